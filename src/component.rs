// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Lifecycle shared by the components an application runs.

use crate::{
    consumer::Consumer,
    errors::AmqpError,
    publisher::Publisher,
    rpc::{RpcClient, RpcServer},
    service::Service,
};
use async_trait::async_trait;

/// A runnable part of an application.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Declares the topology of the component and starts its background work.
    async fn start(&self) -> Result<(), AmqpError>;

    /// Stops the background work. Idempotent.
    async fn cancel(&self);
}

#[async_trait]
impl Component for Consumer {
    fn name(&self) -> &str {
        Consumer::name(self)
    }

    async fn start(&self) -> Result<(), AmqpError> {
        Consumer::start(self).await
    }

    async fn cancel(&self) {
        Consumer::cancel(self).await
    }
}

/// Publishers have no background work; starting one declares its topology.
#[async_trait]
impl Component for Publisher {
    fn name(&self) -> &str {
        Publisher::name(self)
    }

    async fn start(&self) -> Result<(), AmqpError> {
        self.prepare().await
    }

    async fn cancel(&self) {}
}

#[async_trait]
impl Component for Service {
    fn name(&self) -> &str {
        Service::name(self)
    }

    async fn start(&self) -> Result<(), AmqpError> {
        Service::start(self).await
    }

    async fn cancel(&self) {
        Service::cancel(self).await
    }
}

#[async_trait]
impl Component for RpcServer {
    fn name(&self) -> &str {
        RpcServer::name(self)
    }

    async fn start(&self) -> Result<(), AmqpError> {
        RpcServer::start(self).await
    }

    async fn cancel(&self) {
        RpcServer::cancel(self).await
    }
}

#[async_trait]
impl Component for RpcClient {
    fn name(&self) -> &str {
        RpcClient::name(self)
    }

    async fn start(&self) -> Result<(), AmqpError> {
        RpcClient::start(self).await
    }

    async fn cancel(&self) {
        RpcClient::cancel(self).await
    }
}
