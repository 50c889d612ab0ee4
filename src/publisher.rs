// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module publishes messages to a resolved exchange. Every message is published
//! mandatory on a channel with publisher confirms, so the caller learns whether the broker
//! accepted it and whether any queue was bound for it. Trace context of the caller is
//! propagated in the message headers.

use crate::{
    broker::Confirmation,
    connection::Direction,
    errors::AmqpError,
    factory::ResourceFactory,
    message::OutgoingMessage,
    otel,
    settings::PublisherParams,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Publishes messages to the exchange of a [`PublisherParams`].
pub struct Publisher {
    params: Arc<PublisherParams>,
    factory: Arc<ResourceFactory>,
}

impl Publisher {
    pub fn new(params: Arc<PublisherParams>, factory: Arc<ResourceFactory>) -> Publisher {
        Publisher { params, factory }
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn params(&self) -> &Arc<PublisherParams> {
        &self.params
    }

    /// Declares the exchange, and the queue bound to it when configured.
    pub async fn prepare(&self) -> Result<(), AmqpError> {
        self.factory.prepare_publisher(&self.params).await
    }

    /// Publishes `payload` encoded as JSON.
    ///
    /// # Parameters
    /// * `payload` - The message payload
    /// * `routing_key` - Overrides the default routing key of the publisher
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        routing_key: Option<&str>,
    ) -> Result<(), AmqpError> {
        let message = OutgoingMessage::json(payload)
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;
        self.publish_message(message, routing_key).await
    }

    pub async fn publish_message(
        &self,
        message: OutgoingMessage,
        routing_key: Option<&str>,
    ) -> Result<(), AmqpError> {
        self.publish_in(&Context::current(), message, routing_key)
            .await
    }

    /// Publishes `message` as part of the trace `ctx`.
    pub async fn publish_in(
        &self,
        ctx: &Context,
        mut message: OutgoingMessage,
        routing_key: Option<&str>,
    ) -> Result<(), AmqpError> {
        let routing_key = routing_key.unwrap_or(&self.params.routing_key);
        otel::inject(ctx, &mut message.headers);

        let confirmation = match self.params.timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, self.send(routing_key, &message))
                    .await
                    .map_err(|_| {
                        error!(
                            publisher = self.params.name.as_str(),
                            routing_key, "publishing timed out"
                        );
                        AmqpError::PublishTimeout(timeout)
                    })??
            }
            None => self.send(routing_key, &message).await?,
        };

        let exchange = self.params.exchange.name.as_str();
        match confirmation {
            Confirmation::Ack | Confirmation::NotRequested => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
            Confirmation::Returned if self.params.skip_unroutables => {
                warn!(exchange, routing_key, "unroutable message dropped");
                Ok(())
            }
            Confirmation::Returned => {
                error!(exchange, routing_key, "message is unroutable");
                Err(AmqpError::Unroutable {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                })
            }
            Confirmation::Nack => {
                error!(exchange, routing_key, "message rejected by the broker");
                Err(AmqpError::PublishingError(format!(
                    "message to `{exchange}` was nacked by the broker"
                )))
            }
        }
    }

    /// Publishes on the shared write channel, once more on a fresh channel if it was closed.
    async fn send(
        &self,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<Confirmation, AmqpError> {
        let mut retried = false;
        loop {
            let channel = self
                .factory
                .channel(&self.params.connection, Direction::Write)
                .await?;

            match channel
                .publish(&self.params.exchange.name, routing_key, message, true)
                .await
            {
                Err(AmqpError::ChannelClosed) if !retried => {
                    warn!(publisher = self.params.name.as_str(), "channel closed while publishing, retrying");
                    retried = true;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionParams, exchange::ExchangeParams, factory::ResourceRegistry,
        memory::MemoryBroker, queue::QueueParams,
    };
    use serde_json::json;

    fn publisher(broker: &MemoryBroker, params: PublisherParams) -> Publisher {
        let factory = ResourceFactory::new(Arc::new(broker.clone()), ResourceRegistry::new());
        Publisher::new(Arc::new(params), Arc::new(factory))
    }

    fn params(exchange: &str, routing_key: &str) -> PublisherParams {
        PublisherParams::new(
            "events",
            Arc::new(ConnectionParams::url("default", "amqp://localhost")),
            Arc::new(ExchangeParams::new(exchange).topic()),
            routing_key,
        )
    }

    #[tokio::test]
    async fn publishes_with_the_default_routing_key() {
        let broker = MemoryBroker::new();
        let publisher = publisher(
            &broker,
            params("events", "user.created").queue(Arc::new(QueueParams::new("audit"))),
        );
        publisher.prepare().await.unwrap();

        publisher.publish(&json!({"id": 1}), None).await.unwrap();

        let delivered = broker.take("audit").unwrap();
        assert_eq!(delivered.routing_key, "user.created");
        assert_eq!(delivered.message.body, br#"{"id":1}"#);
        assert_eq!(broker.queue_len("audit"), 0);
    }

    #[tokio::test]
    async fn unroutable_messages_fail_unless_skipped() {
        let broker = MemoryBroker::new();
        let strict = publisher(&broker, params("events", "nowhere"));
        strict.prepare().await.unwrap();

        let err = strict.publish(&json!(1), None).await.unwrap_err();
        assert_eq!(
            err,
            AmqpError::Unroutable {
                exchange: "events".to_owned(),
                routing_key: "nowhere".to_owned(),
            }
        );

        let lenient = publisher(&broker, params("events", "nowhere").skip_unroutables(true));
        lenient.prepare().await.unwrap();
        assert!(lenient.publish(&json!(1), None).await.is_ok());
    }

    #[tokio::test]
    async fn routing_key_override_wins() {
        let broker = MemoryBroker::new();
        let publisher = publisher(
            &broker,
            params("events", "audit.#").queue(Arc::new(QueueParams::new("audit"))),
        );
        publisher.prepare().await.unwrap();

        publisher
            .publish_message(OutgoingMessage::new("1"), Some("audit.login"))
            .await
            .unwrap();

        assert_eq!(broker.take("audit").unwrap().routing_key, "audit.login");
    }

    #[tokio::test]
    async fn publishing_survives_a_lost_connection() {
        let broker = MemoryBroker::new();
        let publisher = publisher(
            &broker,
            params("events", "user.created").queue(Arc::new(QueueParams::new("audit"))),
        );
        publisher.prepare().await.unwrap();
        broker.drop_connection("default_write");

        publisher.publish(&json!("again"), None).await.unwrap();

        assert_eq!(broker.queue_len("audit"), 1);
    }
}
