// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Factory
//!
//! This module owns every live broker handle of the process. The [`ResourceRegistry`] keeps
//! the connections and channels opened so far, keyed by connection name and [`Direction`];
//! the [`ResourceFactory`] opens them on demand and declares the topology components need.
//!
//! Connecting never gives up: a failed attempt is logged and retried after a fixed backoff
//! until the broker becomes reachable. Channels found closed are reopened on next use, so
//! consumers and publishers never see a transient channel invalidation. All handles are
//! released by a single [`ResourceRegistry::close_all`] call.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, DeliveryStream},
    connection::{ConnectionParams, Direction},
    errors::AmqpError,
    exchange::ExchangeParams,
    queue::{BindingParams, QueueParams},
    settings::{ConsumerParams, PublisherParams},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, info, warn};

/// Delay between two connection attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

type ResourceKey = (String, Direction);

#[derive(Default)]
struct Resources {
    connections: HashMap<ResourceKey, Arc<dyn BrokerConnection>>,
    channels: HashMap<ResourceKey, Arc<dyn BrokerChannel>>,
    closed: bool,
}

/// The process-wide store of live connections and channels.
///
/// Mutated under a single lock, so two concurrent requests for the same connection never
/// open two physical connections.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: Mutex<Resources>,
}

impl ResourceRegistry {
    pub fn new() -> Arc<ResourceRegistry> {
        Arc::new(ResourceRegistry::default())
    }

    pub async fn is_closed(&self) -> bool {
        self.resources.lock().await.closed
    }

    pub async fn connection_count(&self) -> usize {
        self.resources.lock().await.connections.len()
    }

    /// Closes every channel then every connection. Further requests fail with
    /// [`AmqpError::Closed`]. Calling it again has no effect.
    ///
    /// Every handle is closed even when some fail; the first failure is returned.
    pub async fn close_all(&self) -> Result<(), AmqpError> {
        let mut resources = self.resources.lock().await;
        if resources.closed {
            return Ok(());
        }
        resources.closed = true;

        let mut failure = None;

        for ((name, direction), channel) in resources.channels.drain() {
            if let Err(err) = channel.close().await {
                warn!(
                    error = err.to_string(),
                    name = name.as_str(),
                    direction = %direction,
                    "failure to close channel"
                );
                failure.get_or_insert(err);
            }
        }

        for ((name, direction), connection) in resources.connections.drain() {
            if let Err(err) = connection.close().await {
                warn!(
                    error = err.to_string(),
                    name = name.as_str(),
                    direction = %direction,
                    "failure to close connection"
                );
                failure.get_or_insert(err);
            }
        }

        info!("broker resources released");
        failure.map_or(Ok(()), Err)
    }

    /// A guard releasing the registry when dropped, unless released explicitly before.
    pub fn guard(self: &Arc<Self>) -> ReleaseGuard {
        ReleaseGuard {
            registry: Some(self.clone()),
        }
    }
}

/// Releases a [`ResourceRegistry`] on every exit path of the scope holding it.
///
/// Dropping the guard schedules `close_all` on the current runtime; [`ReleaseGuard::release`]
/// does it in place.
pub struct ReleaseGuard {
    registry: Option<Arc<ResourceRegistry>>,
}

impl ReleaseGuard {
    pub async fn release(mut self) -> Result<(), AmqpError> {
        match self.registry.take() {
            Some(registry) => registry.close_all().await,
            None => Ok(()),
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(registry) = self.registry.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = registry.close_all().await {
                        warn!(error = err.to_string(), "failure to release resources");
                    }
                });
            }
            Err(_) => warn!("no runtime to release broker resources"),
        }
    }
}

/// A started subscription: the deliveries of `queue` on `channel`.
pub struct Subscription {
    pub channel: Arc<dyn BrokerChannel>,
    pub queue: String,
    pub deliveries: DeliveryStream,
}

/// Opens broker resources through the registry and declares topology.
pub struct ResourceFactory {
    broker: Arc<dyn Broker>,
    registry: Arc<ResourceRegistry>,
    app_name: String,
    retry_backoff: Duration,
    subscribe_lock: Mutex<()>,
}

impl ResourceFactory {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<ResourceRegistry>) -> ResourceFactory {
        ResourceFactory {
            broker,
            registry,
            app_name: String::new(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            subscribe_lock: Mutex::new(()),
        }
    }

    /// Sets the application name prefixed to physical connection names.
    pub fn with_app_name(mut self, app_name: &str) -> Self {
        self.app_name = app_name.to_owned();
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Returns the connection for `(params.name, direction)`, opening it when absent or lost.
    ///
    /// Waits for as long as the broker is unreachable.
    pub async fn connect(
        &self,
        params: &ConnectionParams,
        direction: Direction,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut resources = self.registry.resources.lock().await;
        self.connect_locked(&mut resources, params, direction).await
    }

    async fn connect_locked(
        &self,
        resources: &mut Resources,
        params: &ConnectionParams,
        direction: Direction,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if resources.closed {
            return Err(AmqpError::Closed);
        }

        let key = (params.name.clone(), direction);
        if let Some(connection) = resources.connections.get(&key) {
            if connection.is_open() {
                return Ok(connection.clone());
            }
            warn!(name = params.name.as_str(), direction = %direction, "connection lost, reconnecting");
        }

        let connection_name = params.connection_name(&self.app_name, direction);
        let mut attempt: u64 = 0;
        let connection = loop {
            attempt += 1;
            match self.broker.connect(params, &connection_name).await {
                Ok(connection) => break connection,
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        name = connection_name.as_str(),
                        attempt,
                        "failure to connect, retrying in {:?}",
                        self.retry_backoff
                    );
                    sleep(self.retry_backoff).await;
                }
            }
        };
        info!(name = connection_name.as_str(), attempt, "connected");

        resources.channels.remove(&key);
        resources.connections.insert(key, connection.clone());
        Ok(connection)
    }

    /// Returns the shared channel for `(params.name, direction)`, reopening it when closed.
    ///
    /// Channels opened for [`Direction::Write`] have publisher confirms enabled.
    pub async fn channel(
        &self,
        params: &ConnectionParams,
        direction: Direction,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut resources = self.registry.resources.lock().await;
        let key = (params.name.clone(), direction);

        loop {
            if let Some(channel) = resources.channels.get(&key) {
                if channel.is_open() {
                    return Ok(channel.clone());
                }
                debug!(name = params.name.as_str(), direction = %direction, "reopening channel");
            }

            let connection = self.connect_locked(&mut resources, params, direction).await?;
            match open_channel(connection.as_ref(), direction).await {
                Ok(channel) => {
                    resources.channels.insert(key, channel.clone());
                    return Ok(channel);
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        name = params.name.as_str(),
                        "failure to open a channel, retrying in {:?}",
                        self.retry_backoff
                    );
                    sleep(self.retry_backoff).await;
                }
            }
        }
    }

    /// Declares `exchange`. The default exchange always exists and is skipped.
    pub async fn declare_exchange(
        &self,
        channel: &dyn BrokerChannel,
        exchange: &ExchangeParams,
    ) -> Result<(), AmqpError> {
        if exchange.is_default() {
            return Ok(());
        }
        channel.declare_exchange(exchange).await
    }

    /// Declares `queue`, and its dead-letter exchange first, returning the queue name.
    pub async fn declare_queue(
        &self,
        channel: &dyn BrokerChannel,
        queue: &QueueParams,
    ) -> Result<String, AmqpError> {
        if let Some(dead_letter_exchange) = &queue.dead_letter_exchange {
            self.declare_exchange(channel, dead_letter_exchange).await?;
        }
        channel.declare_queue(queue).await
    }

    /// Applies `binding`. Queues cannot be bound to the default exchange, which already
    /// routes by queue name.
    pub async fn bind(
        &self,
        channel: &dyn BrokerChannel,
        binding: &BindingParams,
    ) -> Result<(), AmqpError> {
        if binding.exchange.is_empty() {
            return Ok(());
        }
        channel.bind(binding).await
    }

    /// Declares the consumer topology and starts consuming its queue.
    pub async fn subscribe(
        &self,
        params: &ConsumerParams,
        consumer_tag: &str,
    ) -> Result<Subscription, AmqpError> {
        self.subscribe_with(params, consumer_tag, false).await
    }

    /// Like [`ResourceFactory::subscribe`], binding the queue with its own name as routing
    /// key so that it can be addressed through `reply_to`.
    pub async fn subscribe_self_addressed(
        &self,
        params: &ConsumerParams,
        consumer_tag: &str,
    ) -> Result<Subscription, AmqpError> {
        self.subscribe_with(params, consumer_tag, true).await
    }

    async fn subscribe_with(
        &self,
        params: &ConsumerParams,
        consumer_tag: &str,
        self_addressed: bool,
    ) -> Result<Subscription, AmqpError> {
        loop {
            let channel = self.channel(&params.connection, Direction::Read).await?;
            match self
                .consumer_topology(channel.as_ref(), params, consumer_tag, self_addressed)
                .await
            {
                Ok((queue, deliveries)) => {
                    debug!(consumer = params.name.as_str(), queue = queue.as_str(), "subscribed");
                    return Ok(Subscription {
                        channel,
                        queue,
                        deliveries,
                    });
                }
                Err(AmqpError::ChannelClosed) => {
                    warn!(consumer = params.name.as_str(), "channel closed while subscribing, retrying");
                    sleep(self.retry_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn consumer_topology(
        &self,
        channel: &dyn BrokerChannel,
        params: &ConsumerParams,
        consumer_tag: &str,
        self_addressed: bool,
    ) -> Result<(String, DeliveryStream), AmqpError> {
        self.declare_exchange(channel, &params.exchange).await?;
        let queue = self.declare_queue(channel, &params.queue).await?;

        let routing_key = if self_addressed {
            queue.as_str()
        } else {
            params.routing_key.as_str()
        };
        self.bind(
            channel,
            &BindingParams::new(&params.exchange.name, &queue, routing_key),
        )
        .await?;

        // qos applies to the consumers started next on the shared channel
        let _subscribing = self.subscribe_lock.lock().await;
        channel.qos(params.prefetch_count).await?;
        let deliveries = channel.consume(&queue, consumer_tag).await?;

        Ok((queue, deliveries))
    }

    /// Declares the publisher exchange and its self-bound queue, if any.
    pub async fn prepare_publisher(&self, params: &PublisherParams) -> Result<(), AmqpError> {
        loop {
            let channel = self.channel(&params.connection, Direction::Write).await?;
            match self.publisher_topology(channel.as_ref(), params).await {
                Err(AmqpError::ChannelClosed) => {
                    warn!(publisher = params.name.as_str(), "channel closed while declaring, retrying");
                    sleep(self.retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn publisher_topology(
        &self,
        channel: &dyn BrokerChannel,
        params: &PublisherParams,
    ) -> Result<(), AmqpError> {
        self.declare_exchange(channel, &params.exchange).await?;

        if let Some(queue) = &params.queue {
            let queue = self.declare_queue(channel, queue).await?;
            self.bind(
                channel,
                &BindingParams::new(&params.exchange.name, &queue, &params.routing_key),
            )
            .await?;
        }

        Ok(())
    }
}

async fn open_channel(
    connection: &dyn BrokerConnection,
    direction: Direction,
) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
    let channel = connection.open_channel().await?;
    if direction == Direction::Write {
        channel.confirm_select().await?;
    }
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{MockBroker, MockBrokerConnection},
        memory::MemoryBroker,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn params() -> ConnectionParams {
        ConnectionParams::url("default", "amqp://localhost")
    }

    fn open_connection() -> Arc<dyn BrokerConnection> {
        let mut connection = MockBrokerConnection::new();
        connection.expect_is_open().return_const(true);
        connection.expect_close().returning(|| Ok(()));
        Arc::new(connection)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_the_broker_accepts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut broker = MockBroker::new();
        let counter = attempts.clone();
        broker
            .expect_connect()
            .withf(|_, name| name == "billing_default_read")
            .times(4)
            .returning(move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(AmqpError::ConnectionError("refused".to_owned()))
                } else {
                    Ok(open_connection())
                }
            });
        let factory = ResourceFactory::new(Arc::new(broker), ResourceRegistry::new())
            .with_app_name("billing");
        let started = Instant::now();

        let result = factory.connect(&params(), Direction::Read).await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= DEFAULT_RETRY_BACKOFF * 3);
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_connection_per_direction() {
        let mut broker = MockBroker::new();
        broker
            .expect_connect()
            .withf(|_, name| name == "default_read")
            .times(1)
            .returning(|_, _| Ok(open_connection()));
        broker
            .expect_connect()
            .withf(|_, name| name == "default_write")
            .times(1)
            .returning(|_, _| Ok(open_connection()));
        let factory = ResourceFactory::new(Arc::new(broker), ResourceRegistry::new());
        let params = params();

        let (a, b, c) = tokio::join!(
            factory.connect(&params, Direction::Read),
            factory.connect(&params, Direction::Read),
            factory.connect(&params, Direction::Write),
        );

        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.registry().connection_count().await, 2);
    }

    #[tokio::test]
    async fn lost_channel_is_reopened_transparently() {
        let broker = MemoryBroker::new();
        let factory = ResourceFactory::new(Arc::new(broker.clone()), ResourceRegistry::new());

        let first = factory.channel(&params(), Direction::Write).await.unwrap();
        broker.drop_connection("default_write");
        assert!(!first.is_open());

        let second = factory.channel(&params(), Direction::Write).await.unwrap();

        assert!(second.is_open());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn dead_letter_exchange_is_declared_with_the_queue() {
        let broker = MemoryBroker::new();
        let factory = ResourceFactory::new(Arc::new(broker.clone()), ResourceRegistry::new());
        let channel = factory.channel(&params(), Direction::Read).await.unwrap();
        let dlx = Arc::new(ExchangeParams::new("graveyard").fanout());

        let name = factory
            .declare_queue(channel.as_ref(), &QueueParams::new("jobs").with_dead_letter(dlx, None))
            .await
            .unwrap();
        factory
            .declare_queue(channel.as_ref(), &QueueParams::new("jobs"))
            .await
            .unwrap();

        assert_eq!(name, "jobs");
        assert_eq!(
            broker.exchange_kind("graveyard"),
            Some(crate::exchange::ExchangeKind::Fanout)
        );
    }

    #[tokio::test]
    async fn self_addressed_subscription_binds_the_assigned_name() {
        let broker = MemoryBroker::new();
        let factory = ResourceFactory::new(Arc::new(broker.clone()), ResourceRegistry::new());
        let consumer = ConsumerParams::new(
            "replies",
            Arc::new(params()),
            Arc::new(ExchangeParams::new("rpc")),
            "",
            Arc::new(QueueParams::anonymous()),
        );

        let subscription = factory
            .subscribe_self_addressed(&consumer, "replies")
            .await
            .unwrap();

        let bindings = broker.bindings(&subscription.queue);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].routing_key, subscription.queue);
        assert_eq!(broker.consumer_count(&subscription.queue), 1);
    }

    #[tokio::test]
    async fn close_all_releases_everything_once() {
        let broker = MemoryBroker::new();
        let registry = ResourceRegistry::new();
        let factory = ResourceFactory::new(Arc::new(broker.clone()), registry.clone());
        factory.channel(&params(), Direction::Read).await.unwrap();
        factory.channel(&params(), Direction::Write).await.unwrap();
        assert_eq!(broker.open_connections().len(), 2);

        registry.close_all().await.unwrap();
        registry.close_all().await.unwrap();

        assert!(broker.open_connections().is_empty());
        assert_eq!(
            factory.connect(&params(), Direction::Read).await.err(),
            Some(AmqpError::Closed)
        );
    }

    #[tokio::test]
    async fn dropped_guard_releases_the_registry() {
        let broker = MemoryBroker::new();
        let registry = ResourceRegistry::new();
        let factory = ResourceFactory::new(Arc::new(broker.clone()), registry.clone());

        {
            let _guard = registry.guard();
            factory.connect(&params(), Direction::Read).await.unwrap();
        }
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert!(registry.is_closed().await);
        assert!(broker.open_connections().is_empty());
    }
}
