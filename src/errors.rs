// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy of the crate. `AmqpError` covers broker and
//! resource operations, `ConfigError` covers everything detected while resolving the
//! declarative configuration, `ProcessingError` covers the outcome of handling one
//! delivered message and `RpcError` covers the client side of request/response calls.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection failures are retried by the resource factory and never reach application
/// code; every other variant is surfaced to the caller of the failing operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel was closed by the broker or by a previous failure
    #[error("channel is closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker returned a mandatory message because no queue was bound for it
    #[error("message to exchange `{exchange}` with routing key `{routing_key}` is unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// Publishing did not complete within the publisher timeout
    #[error("publishing timed out after {0:?}")]
    PublishTimeout(Duration),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// The resource registry was already closed
    #[error("resources are closed")]
    Closed,
}

/// Errors detected while resolving the declarative configuration.
///
/// These are fatal at startup and are raised before any broker connection is attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{kind} `{reference}` referenced by `{component}` is not declared")]
    MissingReference {
        component: String,
        kind: &'static str,
        reference: String,
    },

    #[error("exchange `{exchange}` is declared as `{existing}` but `{component}` requires `{requested}`")]
    ExchangeTypeConflict {
        component: String,
        exchange: String,
        existing: String,
        requested: String,
    },

    #[error("`{component}` is missing required field `{field}`")]
    MissingField {
        component: String,
        field: &'static str,
    },

    #[error("`{component}` is invalid: {reason}")]
    InvalidValue { component: String, reason: String },

    #[error("component `{0}` is already declared")]
    DuplicateComponent(String),

    #[error("handler declares two payload models `{first}` and `{second}`")]
    AmbiguousPayload { first: String, second: String },

    #[error("failure to read configuration: {0}")]
    Source(String),
}

/// The outcome of a failed message processing.
///
/// The consumer maps each variant to exactly one acknowledgement: see
/// [`Acknowledgement::for_outcome`](crate::consumer::Acknowledgement::for_outcome).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Application code rejects the message explicitly.
    #[error("message is nacked: {reason} (requeue: {requeue})")]
    Nack { reason: String, requeue: bool },

    /// The body is not a JSON document.
    #[error("message body cannot be decoded: {0}")]
    Decode(String),

    /// A handler parameter cannot be bound to the incoming message.
    #[error("dependency cannot be resolved: {0}")]
    DependencyResolution(String),

    /// Any other failure raised by the handler.
    #[error("handler failure: {0}")]
    Handler(String),

    /// The handler result could not be published.
    #[error("failure to publish result: {0}")]
    Publish(#[from] AmqpError),
}

impl ProcessingError {
    pub fn nack(reason: impl Into<String>, requeue: bool) -> Self {
        ProcessingError::Nack {
            reason: reason.into(),
            requeue,
        }
    }

    pub fn handler(err: impl std::fmt::Display) -> Self {
        ProcessingError::Handler(err.to_string())
    }
}

/// Errors returned to the caller of an RPC call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("failure to publish request: {0}")]
    Publish(#[from] AmqpError),

    #[error("failure to encode request: {0}")]
    Encode(String),

    #[error("failure to decode response: {0}")]
    Decode(String),

    #[error("rpc call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rpc call was cancelled")]
    Cancelled,

    #[error("rpc response consumer is not running")]
    NotConsuming,

    #[error("correlation id `{0}` is already pending")]
    DuplicateCorrelationId(String),
}

/// Errors raised by the application root.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Amqp(#[from] AmqpError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_errors_show_the_underlying_failure() {
        let err = AppError::from(AmqpError::Unroutable {
            exchange: "events".to_owned(),
            routing_key: "audit".to_owned(),
        });

        assert_eq!(
            err.to_string(),
            "message to exchange `events` with routing key `audit` is unroutable"
        );
    }

    #[test]
    fn broker_failures_while_processing_are_publish_failures() {
        let err = ProcessingError::from(AmqpError::ChannelClosed);

        assert!(matches!(err, ProcessingError::Publish(AmqpError::ChannelClosed)));
        assert_eq!(err.to_string(), "failure to publish result: channel is closed");
    }
}
