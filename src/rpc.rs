// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Remote Procedure Calls
//!
//! Request/response over the broker, correlated by a unique id.
//!
//! The [`RpcClient`] publishes each request with a fresh `correlation_id` and with `reply_to`
//! naming its own exclusive response queue, then waits for the response consumed from that
//! queue. Calls are tracked in a pending-call table: an entry lives from the request until
//! its response, its timeout, the caller giving up, or the client being cancelled, whichever
//! comes first.
//!
//! The [`RpcServer`] processes requests and publishes the first output of its handler to the
//! `reply_to` queue of each request, stamped with the request `correlation_id`.

use crate::{
    consumer::{Consumer, MessageHandler},
    errors::{AmqpError, ProcessingError, RpcError},
    factory::ResourceFactory,
    message::{Headers, IncomingMessage, OutgoingMessage},
    processor::Processor,
    publisher::Publisher,
    queue::QueueParams,
    settings::{ConsumerParams, RpcParams},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

type Responder = oneshot::Sender<Result<IncomingMessage, RpcError>>;

#[derive(Default)]
struct Calls {
    pending: HashMap<String, Responder>,
    accepting: bool,
}

/// The calls waiting for a response, by correlation id.
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<Calls>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn open(&self) {
        self.lock().accepting = true;
    }

    /// Registers a call. The entry is removed when the returned guard drops.
    fn register(
        &self,
        correlation_id: &str,
    ) -> Result<(PendingCall<'_>, oneshot::Receiver<Result<IncomingMessage, RpcError>>), RpcError>
    {
        let mut calls = self.lock();
        if !calls.accepting {
            return Err(RpcError::NotConsuming);
        }
        if calls.pending.contains_key(correlation_id) {
            return Err(RpcError::DuplicateCorrelationId(correlation_id.to_owned()));
        }

        let (responder, response) = oneshot::channel();
        calls.pending.insert(correlation_id.to_owned(), responder);
        Ok((
            PendingCall {
                calls: self,
                correlation_id: correlation_id.to_owned(),
            },
            response,
        ))
    }

    /// Completes the call `correlation_id`. Returns `false` when no such call is pending.
    fn resolve(&self, correlation_id: &str, response: IncomingMessage) -> bool {
        match self.lock().pending.remove(correlation_id) {
            // the caller may have given up in between
            Some(responder) => responder.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Fails every pending call with `err` and refuses new ones.
    fn close(&self, err: RpcError) -> usize {
        let mut calls = self.lock();
        calls.accepting = false;
        let failed = calls.pending.len();
        for (_, responder) in calls.pending.drain() {
            let _ = responder.send(Err(err.clone()));
        }
        failed
    }
}

/// Removes its pending entry when dropped.
struct PendingCall<'a> {
    calls: &'a PendingCalls,
    correlation_id: String,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.calls.lock().pending.remove(&self.correlation_id);
    }
}

struct ResponseHandler {
    pending: Arc<PendingCalls>,
}

#[async_trait]
impl MessageHandler for ResponseHandler {
    async fn handle(&self, _ctx: &Context, message: &IncomingMessage) -> Result<(), ProcessingError> {
        let Some(correlation_id) = message.correlation_id.as_deref() else {
            warn!("response without correlation id dropped");
            return Ok(());
        };

        if !self.pending.resolve(correlation_id, message.clone()) {
            warn!(correlation_id, "response to an unknown call dropped");
        }
        Ok(())
    }
}

/// Issues calls to an RPC server and awaits their responses.
pub struct RpcClient {
    params: Arc<RpcParams>,
    publisher: Publisher,
    consumer: Consumer,
    pending: Arc<PendingCalls>,
    timeout: Option<Duration>,
}

impl RpcClient {
    pub fn new(params: Arc<RpcParams>, factory: Arc<ResourceFactory>) -> RpcClient {
        let pending = Arc::new(PendingCalls::default());
        let responses = ConsumerParams::new(
            &format!("{}_responses", params.name),
            params.connection.clone(),
            params.response_exchange().clone(),
            "",
            Arc::new(QueueParams::anonymous()),
        );
        let consumer = Consumer::self_addressed(
            Arc::new(responses),
            factory.clone(),
            Arc::new(ResponseHandler {
                pending: pending.clone(),
            }),
        );

        RpcClient {
            publisher: Publisher::new(params.request_publisher.clone(), factory),
            timeout: params.timeout,
            params,
            consumer,
            pending,
        }
    }

    /// Overrides the call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Declares the request topology and starts consuming responses.
    pub async fn start(&self) -> Result<(), AmqpError> {
        self.publisher.prepare().await?;
        self.consumer.start().await?;
        self.pending.open();
        Ok(())
    }

    /// Stops consuming responses. Pending calls fail with [`RpcError::Cancelled`], later ones
    /// with [`RpcError::NotConsuming`].
    pub async fn cancel(&self) {
        let failed = self.pending.close(RpcError::Cancelled);
        if failed > 0 {
            warn!(client = self.name(), failed, "pending calls cancelled");
        }
        self.consumer.cancel().await;
    }

    /// Calls the server with `payload` and returns the decoded JSON response.
    pub async fn call<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        headers: Headers,
    ) -> Result<Value, RpcError> {
        self.call_as(payload, headers).await
    }

    /// Calls the server with `payload` and deserializes the response.
    pub async fn call_as<T, R>(&self, payload: &T, headers: Headers) -> Result<R, RpcError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request =
            OutgoingMessage::json(payload).map_err(|err| RpcError::Encode(err.to_string()))?;
        request.headers = headers;

        let response = self.call_message(request, None).await?;
        serde_json::from_slice(&response.body).map_err(|err| RpcError::Decode(err.to_string()))
    }

    /// Sends `request` and waits for the correlated response message.
    pub async fn call_message(
        &self,
        request: OutgoingMessage,
        routing_key: Option<&str>,
    ) -> Result<IncomingMessage, RpcError> {
        let reply_to = self.consumer.queue_name().ok_or(RpcError::NotConsuming)?;
        let correlation_id = Uuid::new_v4().to_string();
        let (_pending, response) = self.pending.register(&correlation_id)?;

        let request = request.correlation_id(&correlation_id).reply_to(&reply_to);
        self.publisher.publish_message(request, routing_key).await?;
        debug!(client = self.name(), correlation_id = correlation_id.as_str(), "request sent");

        let response = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, response).await.map_err(|_| {
                warn!(
                    client = self.name(),
                    correlation_id = correlation_id.as_str(),
                    "call timed out"
                );
                RpcError::Timeout(timeout)
            })?,
            None => response.await,
        };

        response.unwrap_or(Err(RpcError::Cancelled))
    }
}

struct RespondingHandler {
    processor: Processor,
    publisher: Arc<Publisher>,
}

#[async_trait]
impl MessageHandler for RespondingHandler {
    async fn handle(&self, ctx: &Context, message: &IncomingMessage) -> Result<(), ProcessingError> {
        let reply_to = message.reply_to.as_deref().ok_or_else(|| {
            ProcessingError::DependencyResolution("request has no reply_to".to_owned())
        })?;

        let mut outputs = self.processor.process(ctx, message).await?.into_outputs();
        let mut response = match outputs.next() {
            Some(output) => output?.message,
            None => OutgoingMessage::new("null"),
        };
        let ignored = outputs.count();
        if ignored > 0 {
            warn!(ignored, "only the first output is sent as response");
        }

        if let Some(correlation_id) = &message.correlation_id {
            response = response.correlation_id(correlation_id);
        }
        self.publisher
            .publish_in(ctx, response, Some(reply_to))
            .await?;
        Ok(())
    }
}

/// Serves the requests of an RPC pair.
pub struct RpcServer {
    params: Arc<RpcParams>,
    consumer: Consumer,
    publisher: Arc<Publisher>,
}

impl RpcServer {
    pub fn new(
        params: Arc<RpcParams>,
        processor: Processor,
        factory: Arc<ResourceFactory>,
    ) -> RpcServer {
        let publisher = Arc::new(Publisher::new(
            params.response_publisher.clone(),
            factory.clone(),
        ));
        let handler = RespondingHandler {
            processor,
            publisher: publisher.clone(),
        };
        let consumer = Consumer::new(params.worker.clone(), factory, Arc::new(handler));

        RpcServer {
            params,
            consumer,
            publisher,
        }
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    pub async fn start(&self) -> Result<(), AmqpError> {
        self.publisher.prepare().await?;
        self.consumer.start().await
    }

    pub async fn cancel(&self) {
        self.consumer.cancel().await;
    }
}
