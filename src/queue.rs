// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the queue and binding definitions. A queue may route rejected
//! messages to a dead-letter exchange, which is declared before the queue itself.

use crate::exchange::ExchangeParams;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// An empty name declares an anonymous queue: the broker assigns the name and the queue
/// belongs to the single component that declared it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueParams {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
    pub dead_letter_exchange: Option<Arc<ExchangeParams>>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueParams {
    /// Creates a new durable queue definition with the given name.
    pub fn new(name: &str) -> QueueParams {
        QueueParams {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            passive: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    /// An exclusive, auto-deleted queue whose name is assigned by the broker.
    pub fn anonymous() -> QueueParams {
        QueueParams {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..QueueParams::new("")
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    /// Makes the queue transient, deleted on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Routes rejected messages to `exchange`, optionally under a fixed routing key.
    pub fn with_dead_letter(
        mut self,
        exchange: Arc<ExchangeParams>,
        routing_key: Option<&str>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange);
        self.dead_letter_routing_key = routing_key.map(str::to_owned);
        self
    }

    /// The declaration arguments derived from the dead-letter settings.
    pub fn arguments(&self) -> Map<String, Value> {
        let mut arguments = Map::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            arguments.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                Value::String(exchange.name.clone()),
            );

            if let Some(key) = &self.dead_letter_routing_key {
                arguments.insert(
                    AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                    Value::String(key.clone()),
                );
            }
        }

        arguments
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types. Applying a binding twice has no further effect.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingParams {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub arguments: Map<String, Value>,
}

impl BindingParams {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> BindingParams {
        BindingParams {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments: Map::default(),
        }
    }

    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_arguments_are_derived() {
        let dlx = Arc::new(ExchangeParams::new("archive"));
        let queue = QueueParams::new("documents").with_dead_letter(dlx, Some("expired"));

        let args = queue.arguments();

        assert_eq!(args[AMQP_HEADERS_DEAD_LETTER_EXCHANGE], "archive");
        assert_eq!(args[AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY], "expired");
        assert!(QueueParams::new("plain").arguments().is_empty());
    }

    #[test]
    fn anonymous_queue_is_exclusive() {
        let queue = QueueParams::anonymous();

        assert!(queue.is_anonymous());
        assert!(queue.exclusive && queue.auto_delete && !queue.durable);
    }
}
