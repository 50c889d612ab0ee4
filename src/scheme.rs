// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Scheme
//!
//! A scheme declares which named components an application needs and which processor handles
//! the messages of each consuming one. It is not runnable by itself: an [`crate::app::App`]
//! materialises it against resolved settings.

use crate::{
    errors::ConfigError,
    processor::Processor,
    settings::{ConsumerParams, PublisherParams, RpcParams, ServiceParams},
};
use std::{fmt, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Publisher,
    Consumer,
    Service,
    RpcService,
    RpcClient,
}

impl ComponentKind {
    /// Whether the component consumes messages through a processor.
    pub fn needs_processor(&self) -> bool {
        matches!(
            self,
            ComponentKind::Consumer | ComponentKind::Service | ComponentKind::RpcService
        )
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Publisher => "publisher",
            ComponentKind::Consumer => "consumer",
            ComponentKind::Service => "service",
            ComponentKind::RpcService => "rpc service",
            ComponentKind::RpcClient => "rpc client",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters given with a requirement instead of being looked up in the settings.
#[derive(Debug, Clone)]
pub enum InlineParams {
    Publisher(Arc<PublisherParams>),
    Consumer(Arc<ConsumerParams>),
    Service(Arc<ServiceParams>),
    Rpc(Arc<RpcParams>),
}

/// A named component an application needs.
#[derive(Clone)]
pub struct Requirement {
    pub name: String,
    pub kind: ComponentKind,
    pub params: Option<InlineParams>,
    pub processor: Option<Processor>,
}

impl Requirement {
    pub fn new(name: &str, kind: ComponentKind) -> Requirement {
        Requirement {
            name: name.to_owned(),
            kind,
            params: None,
            processor: None,
        }
    }

    pub fn params(mut self, params: InlineParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn processor(mut self, processor: Processor) -> Self {
        self.processor = Some(processor);
        self
    }
}

impl fmt::Debug for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requirement")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .field("processor", &self.processor.as_ref().map(Processor::solver))
            .finish()
    }
}

/// The requirements of an application, unique by name.
#[derive(Debug, Default)]
pub struct Scheme {
    name: String,
    requirements: Vec<Requirement>,
}

impl Scheme {
    pub fn new(name: &str) -> Scheme {
        Scheme {
            name: name.to_owned(),
            requirements: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requirements in registration order.
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn get(&self, name: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|req| req.name == name)
    }

    pub fn register(&mut self, requirement: Requirement) -> Result<(), ConfigError> {
        if self.get(&requirement.name).is_some() {
            return Err(ConfigError::DuplicateComponent(requirement.name));
        }
        self.requirements.push(requirement);
        Ok(())
    }

    pub fn publisher(&mut self, name: &str) -> Result<(), ConfigError> {
        self.register(Requirement::new(name, ComponentKind::Publisher))
    }

    pub fn consumer(&mut self, name: &str, processor: Processor) -> Result<(), ConfigError> {
        self.register(Requirement::new(name, ComponentKind::Consumer).processor(processor))
    }

    pub fn service(&mut self, name: &str, processor: Processor) -> Result<(), ConfigError> {
        self.register(Requirement::new(name, ComponentKind::Service).processor(processor))
    }

    pub fn rpc_service(&mut self, name: &str, processor: Processor) -> Result<(), ConfigError> {
        self.register(Requirement::new(name, ComponentKind::RpcService).processor(processor))
    }

    pub fn rpc_client(&mut self, name: &str) -> Result<(), ConfigError> {
        self.register(Requirement::new(name, ComponentKind::RpcClient))
    }

    /// Registers every requirement of `other`, failing on the first name already present.
    pub fn merge(mut self, other: Scheme) -> Result<Scheme, ConfigError> {
        for requirement in other.requirements {
            self.register(requirement)?;
        }
        Ok(self)
    }
}
