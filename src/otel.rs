// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message headers: publishers inject the current context
//! into outgoing headers and consumers start a span for each delivery as a child of the
//! context found in its headers.

use crate::message::Headers;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use serde_json::Value;
use std::borrow::Cow;

/// Name of the tracer used for consumer spans.
pub const TRACER_NAME: &str = "rabbitmq-services";

/// Writes trace context entries into message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), Value::String(value));
    }
}

/// Reads trace context entries from message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Headers,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a Headers) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    /// Only string headers can carry trace context.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects `ctx` into `headers` with the globally registered propagator.
pub fn inject(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Creates a consumer span for a delivery.
///
/// # Parameters
/// * `headers` - Headers of the delivered message, possibly carrying a parent context
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (typically the consumer name)
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = Headers::new();

        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(headers.get("traceparent"), Some(&json!("00-abc-def-01")));
    }

    #[test]
    fn extractor_ignores_non_string_headers() {
        let mut headers = Headers::new();
        headers.insert("traceparent".to_owned(), json!("00-abc-def-01"));
        headers.insert("x-retries".to_owned(), json!(3));
        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.get("x-retries"), None);
        assert_eq!(extractor.keys().len(), 2);
    }
}
