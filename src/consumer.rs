// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module runs the long-lived consume loop of a queue. Each delivery is handed to a
//! [`MessageHandler`] on its own task and acknowledged exactly once, with the decision
//! derived from the handling outcome by [`Acknowledgement::for_outcome`]. Deliveries in
//! flight are bounded by the prefetch count of the consumer.
//!
//! The loop outlives transient broker failures: when the delivery stream ends without the
//! consumer being cancelled, the topology is declared again and consumption resumes.

use crate::{
    broker::BrokerChannel,
    errors::{AmqpError, ProcessingError},
    factory::{ResourceFactory, Subscription},
    message::IncomingMessage,
    otel,
    settings::ConsumerParams,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::{
    sync::{watch, Mutex},
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Processes one delivered message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, message: &IncomingMessage)
        -> Result<(), ProcessingError>;
}

/// The acknowledgment sent for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
}

impl Acknowledgement {
    /// Maps the outcome of handling a message to its acknowledgment.
    ///
    /// - success acks
    /// - an explicit nack keeps its requeue flag
    /// - undecodable bodies and unresolvable parameters are never requeued
    /// - any other failure follows `requeue_broken_messages`
    pub fn for_outcome(
        outcome: &Result<(), ProcessingError>,
        requeue_broken_messages: bool,
    ) -> Acknowledgement {
        match outcome {
            Ok(()) => Acknowledgement::Ack,
            Err(ProcessingError::Nack { requeue, .. }) => Acknowledgement::Nack { requeue: *requeue },
            Err(ProcessingError::Decode(_) | ProcessingError::DependencyResolution(_)) => {
                Acknowledgement::Nack { requeue: false }
            }
            Err(ProcessingError::Handler(_) | ProcessingError::Publish(_)) => {
                Acknowledgement::Nack {
                    requeue: requeue_broken_messages,
                }
            }
        }
    }
}

struct Shared {
    params: Arc<ConsumerParams>,
    factory: Arc<ResourceFactory>,
    handler: Arc<dyn MessageHandler>,
    tracer: BoxedTracer,
    tag: String,
    self_addressed: bool,
    queue: watch::Sender<Option<String>>,
}

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Consumes the queue of a [`ConsumerParams`] until cancelled.
pub struct Consumer {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Consumer {
    pub fn new(
        params: Arc<ConsumerParams>,
        factory: Arc<ResourceFactory>,
        handler: Arc<dyn MessageHandler>,
    ) -> Consumer {
        Consumer::build(params, factory, handler, false)
    }

    /// A consumer whose queue is bound with its own name as routing key, so that it can be
    /// addressed through `reply_to`.
    pub fn self_addressed(
        params: Arc<ConsumerParams>,
        factory: Arc<ResourceFactory>,
        handler: Arc<dyn MessageHandler>,
    ) -> Consumer {
        Consumer::build(params, factory, handler, true)
    }

    fn build(
        params: Arc<ConsumerParams>,
        factory: Arc<ResourceFactory>,
        handler: Arc<dyn MessageHandler>,
        self_addressed: bool,
    ) -> Consumer {
        let tag = format!("{}-{}", params.name, Uuid::new_v4());
        Consumer {
            shared: Arc::new(Shared {
                params,
                factory,
                handler,
                tracer: global::tracer(otel::TRACER_NAME),
                tag,
                self_addressed,
                queue: watch::Sender::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.params.name
    }

    pub fn params(&self) -> &Arc<ConsumerParams> {
        &self.shared.params
    }

    /// Name of the consumed queue, assigned by the broker for anonymous queues. `None`
    /// before the consumer started.
    pub fn queue_name(&self) -> Option<String> {
        self.shared.queue.borrow().clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Declares the topology, subscribes and spawns the consume loop. Starting a running
    /// consumer has no effect.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let subscription = self.shared.subscribe().await?;
        self.shared.queue.send_replace(Some(subscription.queue.clone()));
        info!(
            consumer = self.name(),
            queue = subscription.queue.as_str(),
            "consumer started"
        );

        let (stop, stopped) = watch::channel(false);
        let span = info_span!("consumer", name = self.name());
        let task = tokio::spawn(
            consume_loop(self.shared.clone(), subscription, stopped).instrument(span),
        );
        *running = Some(Running { stop, task });
        Ok(())
    }

    /// Stops consuming, and returns once the deliveries in flight are acknowledged.
    /// Cancelling twice has no effect.
    pub async fn cancel(&self) {
        let Some(Running { stop, task }) = self.running.lock().await.take() else {
            return;
        };

        stop.send_replace(true);
        if let Err(err) = task.await {
            error!(error = err.to_string(), consumer = self.name(), "consume loop aborted");
        }
        info!(consumer = self.name(), "consumer cancelled");
    }
}

impl Shared {
    async fn subscribe(&self) -> Result<Subscription, AmqpError> {
        if self.self_addressed {
            self.factory
                .subscribe_self_addressed(&self.params, &self.tag)
                .await
        } else {
            self.factory.subscribe(&self.params, &self.tag).await
        }
    }
}

async fn consume_loop(
    shared: Arc<Shared>,
    mut subscription: Subscription,
    mut stop: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();

    'consuming: loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break 'consuming,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            delivery = subscription.deliveries.next() => match delivery {
                Some(Ok(message)) => {
                    in_flight.spawn(
                        deliver(shared.clone(), subscription.channel.clone(), message)
                            .in_current_span(),
                    );
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), "failure to receive a message");
                }
                None => loop {
                    warn!("delivery stream ended, subscribing again");
                    tokio::select! {
                        _ = stop.changed() => break 'consuming,
                        result = shared.subscribe() => match result {
                            Ok(renewed) => {
                                shared.queue.send_replace(Some(renewed.queue.clone()));
                                subscription = renewed;
                                continue 'consuming;
                            }
                            Err(AmqpError::Closed) => break 'consuming,
                            Err(err) => {
                                error!(error = err.to_string(), "failure to subscribe again");
                                sleep(shared.factory.retry_backoff()).await;
                            }
                        },
                    }
                },
            },
        }
    }

    if let Err(err) = subscription.channel.cancel(&shared.tag).await {
        debug!(error = err.to_string(), "failure to cancel the broker consumer");
    }

    // prefetched deliveries the loop never picked up go back to the queue
    while let Some(Some(delivery)) = subscription.deliveries.next().now_or_never() {
        let Ok(message) = delivery else {
            continue;
        };
        if let Err(err) = subscription.channel.nack(message.delivery_tag, true).await {
            debug!(error = err.to_string(), "failure to return an unprocessed delivery");
            break;
        }
    }

    while let Some(result) = in_flight.join_next().await {
        if let Err(err) = result {
            error!(error = err.to_string(), "delivery task aborted");
        }
    }
}

/// Handles `message` and acknowledges it once on the channel that delivered it.
async fn deliver(shared: Arc<Shared>, channel: Arc<dyn BrokerChannel>, message: IncomingMessage) {
    let (ctx, mut span) = otel::new_span(&message.headers, &shared.tracer, &shared.params.name);

    debug!(
        routing_key = message.routing_key.as_str(),
        exchange = message.exchange.as_str(),
        redelivered = message.redelivered,
        "received"
    );

    let outcome = AssertUnwindSafe(shared.handler.handle(&ctx, &message))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(ProcessingError::handler("handler panicked")));
    let acknowledgement =
        Acknowledgement::for_outcome(&outcome, shared.params.requeue_broken_messages);

    match (&outcome, acknowledgement) {
        (Ok(()), _) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        (Err(err), Acknowledgement::Nack { requeue }) => {
            error!(
                error = err.to_string(),
                routing_key = message.routing_key.as_str(),
                requeue,
                "failure to process message, nacking"
            );
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
        (Err(_), Acknowledgement::Ack) => {}
    }

    let result = match acknowledgement {
        Acknowledgement::Ack => channel.ack(message.delivery_tag).await,
        Acknowledgement::Nack { requeue } => channel.nack(message.delivery_tag, requeue).await,
    };

    if let Err(err) = result {
        error!(error = err.to_string(), ?acknowledgement, "failure to acknowledge message");
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("failure to acknowledge message"),
        });
    }
}
