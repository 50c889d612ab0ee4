// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Services
//!
//! Declarative messaging services on top of RabbitMQ: named connections, exchanges and queues
//! are resolved from settings once, then consumers, publishers, services and RPC pairs run
//! application handlers over them.
//!
//! ```no_run
//! use rabbitmq_services::{
//!     app::App,
//!     processor::{Param, Processor, Reply},
//!     scheme::Scheme,
//!     settings::JsonFileSource,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut app = App::amqp("billing", &JsonFileSource::new("settings.json"))?;
//!
//! let mut scheme = Scheme::new("billing");
//! scheme.service(
//!     "invoicing",
//!     Processor::builder()
//!         .param(Param::value("order_id"))
//!         .handle(|args| async move {
//!             let order_id: u64 = args.get("order_id")?;
//!             Reply::json(&serde_json::json!({ "invoice_for": order_id }))
//!         })?,
//! )?;
//! app.setup(scheme)?;
//!
//! app.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod amqp;
pub mod app;
pub mod broker;
pub mod component;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod factory;
pub mod memory;
pub mod message;
pub mod otel;
pub mod processor;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod rpc;
pub mod scheme;
pub mod service;
pub mod settings;
