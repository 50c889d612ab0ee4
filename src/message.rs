// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Broker-agnostic representations of a delivered message and of a message about to be
//! published. Header values are kept as JSON values so that application code never deals
//! with the AMQP field table encoding.

use serde::Serialize;
use serde_json::{Map, Value};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Default content encoding
pub const UTF8_CONTENT_ENCODING: &str = "UTF-8";

pub type Headers = Map<String, Value>;

/// A message delivered by the broker, not yet acknowledged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub headers: Headers,
}

impl IncomingMessage {
    /// Decodes the body as a JSON document.
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub headers: Headers,
}

impl OutgoingMessage {
    /// A message with a raw body, published as JSON unless stated otherwise.
    pub fn new(body: impl Into<Vec<u8>>) -> OutgoingMessage {
        OutgoingMessage {
            body: body.into(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            content_encoding: UTF8_CONTENT_ENCODING.to_owned(),
            correlation_id: None,
            reply_to: None,
            message_id: None,
            headers: Headers::default(),
        }
    }

    /// Serializes `payload` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(payload: &T) -> Result<OutgoingMessage, serde_json::Error> {
        Ok(OutgoingMessage::new(serde_json::to_vec(payload)?))
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn content_encoding(mut self, content_encoding: &str) -> Self {
        self.content_encoding = content_encoding.to_owned();
        self
    }

    pub fn correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub fn reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_messages_carry_default_properties() {
        let msg = OutgoingMessage::json(&json!({"id": 7})).unwrap();

        assert_eq!(msg.body, br#"{"id":7}"#);
        assert_eq!(msg.content_type, JSON_CONTENT_TYPE);
        assert_eq!(msg.content_encoding, UTF8_CONTENT_ENCODING);
        assert!(msg.correlation_id.is_none());
    }

    #[test]
    fn incoming_body_is_decoded() {
        let msg = IncomingMessage {
            body: b"[1, 2]".to_vec(),
            ..IncomingMessage::default()
        };

        assert_eq!(msg.json().unwrap(), json!([1, 2]));
        assert!(IncomingMessage::default().json().is_err());
    }
}
