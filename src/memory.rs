// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A [`Broker`] living entirely in memory, used to exercise components without a RabbitMQ
//! server. It follows the broker semantics the framework relies on: exchange routing for the
//! four exchange types, mandatory returns, prefetch-limited dispatch, requeue on nack or
//! channel close, dead-lettering, exclusive anonymous queues and connection drops.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, Confirmation, DeliveryStream},
    connection::ConnectionParams,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeParams},
    message::{Headers, IncomingMessage, OutgoingMessage},
    queue::{BindingParams, QueueParams},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A message stored in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutgoingMessage,
    pub redelivered: bool,
}

type DeliverySender = mpsc::UnboundedSender<Result<IncomingMessage, AmqpError>>;

struct ConsumerSlot {
    tag: String,
    channel: u64,
    prefetch: u16,
    sender: DeliverySender,
}

struct Unacked {
    envelope: Envelope,
    consumer: String,
    channel: u64,
}

#[derive(Default)]
struct MemoryQueue {
    owner: Option<u64>,
    auto_delete: bool,
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
    ready: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    unacked: BTreeMap<u64, Unacked>,
}

struct MemoryExchange {
    kind: ExchangeKind,
    bindings: Vec<BindingParams>,
}

struct ConnectionEntry {
    name: String,
    open: bool,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
    prefetch: u16,
    confirms: bool,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, MemoryExchange>,
    queues: HashMap<String, MemoryQueue>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    next_id: u64,
    next_delivery_tag: u64,
    connect_attempts: usize,
    refused_connects: usize,
}

/// The in-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.lock().refused_connects = count;
    }

    /// Number of connection attempts, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Names of the currently open connections, sorted.
    pub fn open_connections(&self) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .connections
            .values()
            .filter(|conn| conn.open)
            .map(|conn| conn.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Closes every connection named `name` from the broker side.
    pub fn drop_connection(&self, name: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.open && conn.name == name)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).map(|exchange| exchange.kind)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Bindings targeting `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<BindingParams> {
        self.lock()
            .exchanges
            .values()
            .flat_map(|exchange| exchange.bindings.iter())
            .filter(|binding| binding.queue == queue)
            .cloned()
            .collect()
    }

    /// Messages waiting for a consumer.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|queue| queue.ready.len())
            .unwrap_or_default()
    }

    /// Messages delivered and not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|queue| queue.unacked.len())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|queue| queue.consumers.len())
            .unwrap_or_default()
    }

    /// Removes and returns the oldest waiting message of `queue`.
    pub fn take(&self, queue: &str) -> Option<Envelope> {
        self.lock()
            .queues
            .get_mut(queue)
            .and_then(|queue| queue.ready.pop_front())
    }

    /// Publishes `message` without a channel and returns the number of queues reached.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<usize, AmqpError> {
        let mut state = self.lock();
        let targets = state.route(exchange, routing_key, &message.headers)?;
        state.deliver(
            &targets,
            Envelope {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message,
                redelivered: false,
            },
        );
        Ok(targets.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        _params: &ConnectionParams,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(AmqpError::ConnectionError(format!(
                "connection `{connection_name}` refused"
            )));
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionEntry {
                name: connection_name.to_owned(),
                open: true,
            },
        );
        debug!(name = connection_name, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = lock(&self.state);
        if !state.connection_open(self.id) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                open: true,
                prefetch: 0,
                confirms: false,
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            state: self.state.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        lock(&self.state).connection_open(self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        lock(&self.state).close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    connection: u64,
    state: Arc<Mutex<State>>,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        let state = lock(&self.state);
        if !state.channel_open(self.id) {
            return Err(AmqpError::ChannelClosed);
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        lock(&self.state).channel_open(self.id)
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirms = true;
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ExchangeParams) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if exchange.is_default() {
            state.close_channel(self.id);
            return Err(AmqpError::DeclareExchangeError(
                "the default exchange cannot be declared".to_owned(),
            ));
        }

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing.kind != exchange.kind => {
                let reason = format!(
                    "{}: declared as `{}`, requested `{}`",
                    exchange.name, existing.kind, exchange.kind
                );
                state.close_channel(self.id);
                Err(AmqpError::DeclareExchangeError(reason))
            }
            Some(_) => Ok(()),
            None if exchange.passive => {
                state.close_channel(self.id);
                Err(AmqpError::DeclareExchangeError(exchange.name.clone()))
            }
            None => {
                state.exchanges.insert(
                    exchange.name.clone(),
                    MemoryExchange {
                        kind: exchange.kind,
                        bindings: vec![],
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueParams) -> Result<String, AmqpError> {
        let mut state = self.open_state()?;

        let name = if queue.is_anonymous() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            queue.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.connection) {
                state.close_channel(self.id);
                return Err(AmqpError::DeclareQueueError(format!(
                    "{name}: locked by another connection"
                )));
            }
            return Ok(name);
        }

        if queue.passive {
            state.close_channel(self.id);
            return Err(AmqpError::DeclareQueueError(name));
        }

        state.queues.insert(
            name.clone(),
            MemoryQueue {
                owner: queue.exclusive.then_some(self.connection),
                auto_delete: queue.auto_delete,
                dead_letter_exchange: queue
                    .dead_letter_exchange
                    .as_ref()
                    .map(|exchange| exchange.name.clone()),
                dead_letter_routing_key: queue.dead_letter_routing_key.clone(),
                ..MemoryQueue::default()
            },
        );

        Ok(name)
    }

    async fn bind(&self, binding: &BindingParams) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if !state.queues.contains_key(&binding.queue) || binding.exchange.is_empty() {
            state.close_channel(self.id);
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange.clone(),
                binding.queue.clone(),
            ));
        }

        let Some(exchange) = state.exchanges.get_mut(&binding.exchange) else {
            state.close_channel(self.id);
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange.clone(),
                binding.queue.clone(),
            ));
        };

        if !exchange.bindings.contains(binding) {
            exchange.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
        mandatory: bool,
    ) -> Result<Confirmation, AmqpError> {
        let mut state = self.open_state()?;

        let targets = match state.route(exchange, routing_key, &message.headers) {
            Ok(targets) => targets,
            Err(err) => {
                state.close_channel(self.id);
                return Err(err);
            }
        };

        let confirms = state
            .channels
            .get(&self.id)
            .map(|channel| channel.confirms)
            .unwrap_or_default();

        if targets.is_empty() {
            return Ok(match (confirms, mandatory) {
                (false, _) => Confirmation::NotRequested,
                (true, true) => Confirmation::Returned,
                (true, false) => Confirmation::Ack,
            });
        }

        state.deliver(
            &targets,
            Envelope {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message: message.clone(),
                redelivered: false,
            },
        );

        Ok(if confirms {
            Confirmation::Ack
        } else {
            Confirmation::NotRequested
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;
        let prefetch = state
            .channels
            .get(&self.id)
            .map(|channel| channel.prefetch)
            .unwrap_or_default();

        let accessible = state
            .queues
            .get(queue)
            .is_some_and(|target| !matches!(target.owner, Some(owner) if owner != self.connection));
        if !accessible {
            state.close_channel(self.id);
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(target) = state.queues.get_mut(queue) {
            target.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_owned(),
                channel: self.id,
                prefetch,
                sender,
            });
        }
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        match state.settle(delivery_tag) {
            Some((queue, _)) => {
                state.dispatch(&queue);
                Ok(())
            }
            None => {
                state.close_channel(self.id);
                Err(AmqpError::AckMessageError(format!(
                    "unknown delivery tag {delivery_tag}"
                )))
            }
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let Some((queue, mut envelope)) = state.settle(delivery_tag) else {
            state.close_channel(self.id);
            return Err(AmqpError::NackMessageError(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };

        if requeue {
            envelope.redelivered = true;
            if let Some(target) = state.queues.get_mut(&queue) {
                target.ready.push_front(envelope);
            }
        } else {
            state.dead_letter(&queue, envelope);
        }

        state.dispatch(&queue);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let id = self.id;
        state.remove_consumers(|slot| slot.channel == id && slot.tag == consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        lock(&self.state).close_channel(self.id);
        Ok(())
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn connection_open(&self, id: u64) -> bool {
        self.connections.get(&id).is_some_and(|conn| conn.open)
    }

    fn channel_open(&self, id: u64) -> bool {
        self.channels
            .get(&id)
            .is_some_and(|channel| channel.open && self.connection_open(channel.connection))
    }

    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        headers: &Headers,
    ) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            });
        }

        let Some(target) = self.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError(format!(
                "no exchange `{exchange}`"
            )));
        };

        let mut queues: Vec<String> = vec![];
        for binding in &target.bindings {
            let matched = match target.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Headers => headers_match(&binding.arguments, headers),
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    fn deliver(&mut self, targets: &[String], envelope: Envelope) {
        for name in targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(envelope.clone());
            }
            self.dispatch(name);
        }
    }

    fn dispatch(&mut self, name: &str) {
        let State {
            queues,
            next_delivery_tag,
            ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let position = queue.consumers.iter().position(|slot| {
                slot.prefetch == 0
                    || queue
                        .unacked
                        .values()
                        .filter(|unacked| unacked.consumer == slot.tag)
                        .count()
                        < usize::from(slot.prefetch)
            });
            let Some(position) = position else {
                break;
            };
            let Some(envelope) = queue.ready.pop_front() else {
                break;
            };

            let slot = queue.consumers.remove(position);
            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;

            let delivery = IncomingMessage {
                delivery_tag,
                exchange: envelope.exchange.clone(),
                routing_key: envelope.routing_key.clone(),
                redelivered: envelope.redelivered,
                body: envelope.message.body.clone(),
                content_type: Some(envelope.message.content_type.clone()),
                content_encoding: Some(envelope.message.content_encoding.clone()),
                correlation_id: envelope.message.correlation_id.clone(),
                reply_to: envelope.message.reply_to.clone(),
                message_id: envelope.message.message_id.clone(),
                headers: envelope.message.headers.clone(),
            };

            if slot.sender.send(Ok(delivery)).is_err() {
                queue.ready.push_front(envelope);
                continue;
            }

            queue.unacked.insert(
                delivery_tag,
                Unacked {
                    envelope,
                    consumer: slot.tag.clone(),
                    channel: slot.channel,
                },
            );
            queue.consumers.push(slot);
        }
    }

    fn settle(&mut self, delivery_tag: u64) -> Option<(String, Envelope)> {
        self.queues.iter_mut().find_map(|(name, queue)| {
            queue
                .unacked
                .remove(&delivery_tag)
                .map(|unacked| (name.clone(), unacked.envelope))
        })
    }

    fn dead_letter(&mut self, queue: &str, envelope: Envelope) {
        let Some((exchange, routing_key)) = self.queues.get(queue).and_then(|queue| {
            queue.dead_letter_exchange.clone().map(|exchange| {
                let routing_key = queue
                    .dead_letter_routing_key
                    .clone()
                    .unwrap_or_else(|| envelope.routing_key.clone());
                (exchange, routing_key)
            })
        }) else {
            debug!(queue, "rejected message dropped");
            return;
        };

        let mut message = envelope.message;
        message
            .headers
            .insert("x-first-death-queue".to_owned(), Value::from(queue));

        if let Ok(targets) = self.route(&exchange, &routing_key, &message.headers) {
            self.deliver(
                &targets,
                Envelope {
                    exchange,
                    routing_key,
                    message,
                    redelivered: false,
                },
            );
        }
    }

    fn remove_consumers(&mut self, matches: impl Fn(&ConsumerSlot) -> bool) {
        let mut emptied = vec![];
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|slot| !matches(slot));
            if before != queue.consumers.len() && queue.consumers.is_empty() && queue.auto_delete
            {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.delete_queue(&name);
        }
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        channel.open = false;

        self.remove_consumers(|slot| slot.channel == id);

        let mut touched = vec![];
        for (name, queue) in self.queues.iter_mut() {
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, unacked)| unacked.channel == id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut envelope = unacked.envelope;
                    envelope.redelivered = true;
                    queue.ready.push_front(envelope);
                }
            }
            touched.push(name.clone());
        }
        for name in touched {
            self.dispatch(&name);
        }
    }

    fn close_connection(&mut self, id: u64) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        connection.open = false;

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|binding| binding.queue != name);
        }
    }
}

fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &words)
}

fn words_match(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| words_match(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && words_match(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && words_match(rest, &words[1..]),
    }
}

fn headers_match(arguments: &serde_json::Map<String, Value>, headers: &Headers) -> bool {
    let any = arguments.get("x-match").and_then(Value::as_str) == Some("any");
    let mut expected = arguments.iter().filter(|(key, _)| !key.starts_with("x-"));

    if any {
        expected.any(|(key, value)| headers.get(key) == Some(value))
    } else {
        expected.all(|(key, value)| headers.get(key) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let params = ConnectionParams::url("default", "amqp://localhost");
        let conn = broker.connect(&params, "test").await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel.confirm_select().await.unwrap();
        channel
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("document.*", "document.new"));
        assert!(!topic_matches("document.*", "document.new.pdf"));
        assert!(topic_matches("document.#", "document"));
        assert!(topic_matches("#.pdf", "document.new.pdf"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("*.new", "new"));
    }

    #[test]
    fn headers_binding_modes() {
        let headers = json!({"format": "pdf", "lang": "en"});
        let headers = headers.as_object().unwrap();

        let all = json!({"x-match": "all", "format": "pdf", "lang": "fr"});
        let any = json!({"x-match": "any", "format": "pdf", "lang": "fr"});

        assert!(!headers_match(all.as_object().unwrap(), headers));
        assert!(headers_match(any.as_object().unwrap(), headers));
    }

    #[tokio::test]
    async fn mandatory_unroutable_is_returned() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_exchange(&ExchangeParams::new("orders"))
            .await
            .unwrap();

        let msg = OutgoingMessage::new("{}");
        let confirmation = channel.publish("orders", "nowhere", &msg, true).await.unwrap();
        assert_eq!(confirmation, Confirmation::Returned);

        let confirmation = channel.publish("orders", "nowhere", &msg, false).await.unwrap();
        assert_eq!(confirmation, Confirmation::Ack);
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.qos(1).await.unwrap();
        channel.declare_queue(&QueueParams::new("jobs")).await.unwrap();
        for n in 0..3 {
            broker
                .publish("", "jobs", OutgoingMessage::new(n.to_string()))
                .unwrap();
        }

        let mut deliveries = channel.consume("jobs", "worker").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();

        assert_eq!(broker.unacked_count("jobs"), 1);
        assert_eq!(broker.queue_len("jobs"), 2);

        channel.ack(first.delivery_tag).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"1");
    }

    #[tokio::test]
    async fn rejected_messages_are_dead_lettered() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        let dlx = Arc::new(ExchangeParams::new("graveyard").fanout());
        channel.declare_exchange(&dlx).await.unwrap();
        channel.declare_queue(&QueueParams::new("dead")).await.unwrap();
        channel
            .bind(&BindingParams::new("graveyard", "dead", ""))
            .await
            .unwrap();
        channel
            .declare_queue(&QueueParams::new("jobs").with_dead_letter(dlx, None))
            .await
            .unwrap();
        broker.publish("", "jobs", OutgoingMessage::new("x")).unwrap();

        let mut deliveries = channel.consume("jobs", "worker").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        let dead = broker.take("dead").unwrap();
        assert_eq!(dead.message.body, b"x");
        assert_eq!(dead.routing_key, "jobs");
    }

    #[tokio::test]
    async fn closing_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel.declare_queue(&QueueParams::new("jobs")).await.unwrap();
        broker.publish("", "jobs", OutgoingMessage::new("x")).unwrap();

        let mut deliveries = channel.consume("jobs", "worker").await.unwrap();
        deliveries.next().await.unwrap().unwrap();
        channel.close().await.unwrap();

        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.queue_len("jobs"), 1);
        assert!(broker.take("jobs").unwrap().redelivered);
    }

    #[tokio::test]
    async fn conflicting_exchange_declaration_closes_channel() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        channel
            .declare_exchange(&ExchangeParams::new("orders").topic())
            .await
            .unwrap();

        let err = channel
            .declare_exchange(&ExchangeParams::new("orders"))
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::DeclareExchangeError(_)));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn exclusive_queue_is_deleted_with_its_connection() {
        let broker = MemoryBroker::new();
        let params = ConnectionParams::url("default", "amqp://localhost");
        let conn = broker.connect(&params, "owner").await.unwrap();
        let channel = conn.open_channel().await.unwrap();

        let name = channel.declare_queue(&QueueParams::anonymous()).await.unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.has_queue(&name));

        broker.drop_connection("owner");

        assert!(!broker.has_queue(&name));
        assert!(!conn.is_open());
    }
}
