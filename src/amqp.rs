// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Broker
//!
//! This module implements the [`Broker`] traits on top of lapin. It handles the creation of
//! AMQP connections and channels, the declaration of the topology, publishing with
//! publisher confirms and the conversion between AMQP field tables and JSON headers.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, Confirmation, DeliveryStream},
    connection::ConnectionParams,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeParams},
    message::{Headers, IncomingMessage, OutgoingMessage},
    queue::{BindingParams, QueueParams},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Connects to RabbitMQ servers through lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBroker;

#[async_trait]
impl Broker for LapinBroker {
    /// Establishes a connection to RabbitMQ using the connection declaration.
    ///
    /// # Parameters
    /// * `params` - The connection declaration
    /// * `connection_name` - The name shown by the broker for this connection
    ///
    /// # Returns
    /// The established connection, or an error when the broker cannot be reached
    async fn connect(
        &self,
        params: &ConnectionParams,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(name = connection_name, "creating amqp connection...");

        let mut options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name));
        for (key, value) in &params.client_properties {
            options.client_properties.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }

        match Connection::connect(&params.uri(), options).await {
            Ok(conn) => {
                debug!(name = connection_name, "amqp connected");
                Ok(Arc::new(LapinConnection { inner: conn }))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = connection_name,
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { inner: channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.inner
            .close(200, "closing")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn declare_exchange(&self, exchange: &ExchangeParams) -> Result<(), AmqpError> {
        debug!(name = exchange.name.as_str(), kind = %exchange.kind, "declaring exchange");

        match self
            .inner
            .exchange_declare(
                &exchange.name,
                lapin_exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    passive: exchange.passive,
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: exchange.internal,
                    nowait: false,
                },
                field_table(&exchange.arguments),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exchange.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, queue: &QueueParams) -> Result<String, AmqpError> {
        debug!(name = queue.name.as_str(), "declaring queue");

        match self
            .inner
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: queue.passive,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: false,
                },
                field_table(&queue.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = queue.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(err.to_string()))
            }
            Ok(declared) => Ok(declared.name().as_str().to_owned()),
        }
    }

    async fn bind(&self, binding: &BindingParams) -> Result<(), AmqpError> {
        debug!(
            exchange = binding.exchange.as_str(),
            queue = binding.queue.as_str(),
            routing_key = binding.routing_key.as_str(),
            "binding queue"
        );

        match self
            .inner
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                field_table(&binding.arguments),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = binding.exchange.as_str(),
                    queue = binding.queue.as_str(),
                    "error to bind queue to exchange"
                );
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange.clone(),
                    binding.queue.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
        mandatory: bool,
    ) -> Result<Confirmation, AmqpError> {
        let message_id = message
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.as_str()))
            .with_content_encoding(ShortString::from(message.content_encoding.as_str()))
            .with_message_id(ShortString::from(message_id))
            .with_headers(field_table(&message.headers));
        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }
        if let Some(reply_to) = &message.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
        }

        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                &message.body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        match confirm.await {
            Ok(publisher_confirm::Confirmation::Ack(Some(_))) => Ok(Confirmation::Returned),
            Ok(publisher_confirm::Confirmation::Ack(None)) => Ok(Confirmation::Ack),
            Ok(publisher_confirm::Confirmation::Nack(_)) => Ok(Confirmation::Nack),
            Ok(publisher_confirm::Confirmation::NotRequested) => Ok(Confirmation::NotRequested),
            Err(err) => {
                error!(error = err.to_string(), "error waiting publisher confirm");
                Err(AmqpError::PublishingError(err.to_string()))
            }
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(err.to_string())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(incoming_message)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.inner
            .close(200, "closing")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

fn lapin_exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn incoming_message(delivery: Delivery) -> IncomingMessage {
    let properties = &delivery.properties;
    let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.as_str().to_owned());

    IncomingMessage {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        content_type: text(properties.content_type()),
        content_encoding: text(properties.content_encoding()),
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
        message_id: text(properties.message_id()),
        headers: properties
            .headers()
            .as_ref()
            .map(json_headers)
            .unwrap_or_default(),
        body: delivery.data,
    }
}

/// Converts JSON headers into an AMQP field table.
pub(crate) fn field_table(headers: &Headers) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.as_str()), amqp_value(value)))
        .collect();
    FieldTable::from(table)
}

/// Converts an AMQP field table into JSON headers.
pub(crate) fn json_headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), json_value(value)))
        .collect()
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(int), _) => AMQPValue::LongLongInt(int),
            (None, Some(float)) => AMQPValue::Double(float),
            (None, None) => AMQPValue::Void,
        },
        Value::String(text) => AMQPValue::LongString(LongString::from(text.as_str())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(field_table(map)),
    }
}

fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(flag) => Value::Bool(*flag),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(f64::from(*v)),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::ShortString(text) => Value::String(text.as_str().to_owned()),
        AMQPValue::LongString(text) => {
            Value::String(String::from_utf8_lossy(text.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(json_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(json_headers(table)),
        AMQPValue::ByteArray(bytes) => Value::from(bytes.as_slice().to_vec()),
        AMQPValue::DecimalValue(_) | AMQPValue::Void => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn headers_survive_field_table_conversion() {
        let headers = json!({
            "traceparent": "00-abc-def-01",
            "attempts": 3,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "nested": {"deleted": false}
        });
        let headers = headers.as_object().unwrap();

        let table = field_table(headers);

        assert_eq!(
            table.inner().get("attempts"),
            Some(&AMQPValue::LongLongInt(3))
        );
        assert_eq!(&json_headers(&table), headers);
    }

    #[test]
    fn broker_integer_widths_become_json_numbers() {
        let mut table = BTreeMap::new();
        table.insert(ShortString::from("count"), AMQPValue::LongInt(7));
        table.insert(
            ShortString::from("queue"),
            AMQPValue::ShortString(ShortString::from("jobs")),
        );

        let headers = json_headers(&FieldTable::from(table));

        assert_eq!(headers["count"], json!(7));
        assert_eq!(headers["queue"], json!("jobs"));
    }
}
