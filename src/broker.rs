// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The seam between the framework and the AMQP client. The resource factory, consumers and
//! publishers only talk to these traits; [`crate::amqp`] implements them on top of lapin and
//! [`crate::memory`] implements them in-process.

use crate::{
    connection::ConnectionParams,
    errors::AmqpError,
    exchange::ExchangeParams,
    message::{IncomingMessage, OutgoingMessage},
    queue::{BindingParams, QueueParams},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// The stream of deliveries of a started consumer. It ends once the consumer is cancelled
/// or its channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<IncomingMessage, AmqpError>>;

/// The broker's answer to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// The message was mandatory and no queue was bound for it.
    Returned,
    /// Publisher confirms are not enabled on the channel.
    NotRequested,
}

/// Opens physical connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a connection named `connection_name` as shown by the broker.
    async fn connect(
        &self,
        params: &ConnectionParams,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Enables publisher confirms.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, exchange: &ExchangeParams) -> Result<(), AmqpError>;

    /// Declares `queue` and returns its name, assigned by the broker for anonymous queues.
    async fn declare_queue(&self, queue: &QueueParams) -> Result<String, AmqpError>;

    async fn bind(&self, binding: &BindingParams) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
        mandatory: bool,
    ) -> Result<Confirmation, AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
