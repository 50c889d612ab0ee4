// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Service
//!
//! A consume-process-produce pipeline: every message consumed is processed and each output
//! of the handler is published, in order, before the message is acknowledged. Outputs
//! published before a failure are not retracted.

use crate::{
    consumer::{Consumer, MessageHandler},
    errors::{AmqpError, ProcessingError},
    factory::ResourceFactory,
    message::IncomingMessage,
    processor::Processor,
    publisher::Publisher,
    settings::ServiceParams,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::debug;

struct PublishingHandler {
    processor: Processor,
    publisher: Arc<Publisher>,
}

#[async_trait]
impl MessageHandler for PublishingHandler {
    async fn handle(&self, ctx: &Context, message: &IncomingMessage) -> Result<(), ProcessingError> {
        let mut published = 0;
        for output in self.processor.process(ctx, message).await?.into_outputs() {
            let output = output?;
            self.publisher
                .publish_in(ctx, output.message, output.routing_key.as_deref())
                .await?;
            published += 1;
        }

        debug!(published, "outputs published");
        Ok(())
    }
}

/// Binds a consumer to a publisher through a processor.
pub struct Service {
    params: Arc<ServiceParams>,
    consumer: Consumer,
    publisher: Arc<Publisher>,
}

impl Service {
    pub fn new(
        params: Arc<ServiceParams>,
        processor: Processor,
        factory: Arc<ResourceFactory>,
    ) -> Service {
        let publisher = Arc::new(Publisher::new(params.publisher.clone(), factory.clone()));
        let handler = PublishingHandler {
            processor,
            publisher: publisher.clone(),
        };
        let consumer = Consumer::new(params.consumer.clone(), factory, Arc::new(handler));

        Service {
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

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Declares the output topology before consuming, so that the first outputs are routable.
    pub async fn start(&self) -> Result<(), AmqpError> {
        self.publisher.prepare().await?;
        self.consumer.start().await
    }

    pub async fn cancel(&self) {
        self.consumer.cancel().await;
    }
}
