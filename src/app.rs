// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application
//!
//! The root of a messaging application. An [`App`] resolves its settings before touching the
//! broker, materialises the requirements of a [`Scheme`] into components, runs them until a
//! shutdown signal and finally releases every broker resource, on every exit path.

use crate::{
    amqp::LapinBroker,
    broker::Broker,
    component::Component,
    consumer::Consumer,
    errors::{AppError, ConfigError},
    factory::{ResourceFactory, ResourceRegistry},
    processor::{Argument, ParamKind, Processor},
    publisher::Publisher,
    rpc::{RpcClient, RpcServer},
    scheme::{ComponentKind, InlineParams, Requirement, Scheme},
    service::Service,
    settings::{self, ConsumerParams, ResolvedSettings, RpcParams, ServiceParams, SettingsSource},
};
use futures_util::Future;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{error, info, info_span, Instrument};

/// A messaging application: resolved settings plus the components built from them.
pub struct App {
    name: String,
    settings: ResolvedSettings,
    broker: Arc<dyn Broker>,
    registry: Arc<ResourceRegistry>,
    factory: Arc<ResourceFactory>,
    publishers: BTreeMap<String, Arc<Publisher>>,
    rpc_clients: BTreeMap<String, Arc<RpcClient>>,
    components: Vec<Arc<dyn Component>>,
}

impl App {
    /// Resolves `source`. No broker I/O happens before [`App::run_until`].
    pub fn new(
        name: &str,
        source: &dyn SettingsSource,
        broker: Arc<dyn Broker>,
    ) -> Result<App, ConfigError> {
        let settings = settings::resolve(source)?;
        let registry = ResourceRegistry::new();
        let factory = ResourceFactory::new(broker.clone(), registry.clone()).with_app_name(name);
        info!(app = name, "settings resolved");

        Ok(App {
            name: name.to_owned(),
            settings,
            broker,
            registry,
            factory: Arc::new(factory),
            publishers: BTreeMap::new(),
            rpc_clients: BTreeMap::new(),
            components: vec![],
        })
    }

    /// An application talking to a RabbitMQ broker.
    pub fn amqp(name: &str, source: &dyn SettingsSource) -> Result<App, ConfigError> {
        App::new(name, source, Arc::new(LapinBroker))
    }

    /// Sets the delay between connection attempts. Applies to components set up afterwards.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        let factory = ResourceFactory::new(self.broker.clone(), self.registry.clone())
            .with_app_name(&self.name)
            .with_retry_backoff(backoff);
        self.factory = Arc::new(factory);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ResolvedSettings {
        &self.settings
    }

    pub fn publisher(&self, name: &str) -> Option<Arc<Publisher>> {
        self.publishers.get(name).cloned()
    }

    pub fn rpc_client(&self, name: &str) -> Option<Arc<RpcClient>> {
        self.rpc_clients.get(name).cloned()
    }

    /// Builds the components required by `scheme`.
    ///
    /// Publishers and RPC clients come first so that the static parameters of processors can
    /// be bound to them. A static parameter naming a publisher or RPC client the scheme does
    /// not require is bound to one built from the settings.
    pub fn setup(&mut self, scheme: Scheme) -> Result<(), ConfigError> {
        let (providers, consumers): (Vec<Requirement>, Vec<Requirement>) = scheme
            .requirements()
            .iter()
            .cloned()
            .partition(|req| !req.kind.needs_processor());

        for requirement in providers {
            match requirement.kind {
                ComponentKind::Publisher => {
                    self.add_publisher(&requirement)?;
                }
                _ => {
                    self.add_rpc_client(&requirement)?;
                }
            }
        }

        for requirement in consumers {
            let mut processor = requirement.processor.clone().ok_or_else(|| {
                ConfigError::MissingField {
                    component: requirement.name.clone(),
                    field: "processor",
                }
            })?;
            self.bind_statics(&requirement.name, &mut processor)?;

            let component: Arc<dyn Component> = match requirement.kind {
                ComponentKind::Consumer => Arc::new(Consumer::new(
                    self.consumer_params(&requirement)?,
                    self.factory.clone(),
                    Arc::new(processor),
                )),
                ComponentKind::Service => Arc::new(Service::new(
                    self.service_params(&requirement)?,
                    processor,
                    self.factory.clone(),
                )),
                _ => Arc::new(RpcServer::new(
                    self.rpc_params(&requirement)?,
                    processor,
                    self.factory.clone(),
                )),
            };
            self.components.push(component);
        }

        info!(
            app = self.name.as_str(),
            scheme = scheme.name(),
            components = self.components.len(),
            "scheme set up"
        );
        Ok(())
    }

    fn add_publisher(&mut self, requirement: &Requirement) -> Result<Arc<Publisher>, ConfigError> {
        let params = match &requirement.params {
            Some(InlineParams::Publisher(params)) => params.clone(),
            Some(_) => return Err(self.mismatched_params(requirement)),
            None => self
                .settings
                .publisher(&requirement.name)
                .ok_or_else(|| self.missing(requirement.kind, &requirement.name))?,
        };

        let publisher = Arc::new(Publisher::new(params, self.factory.clone()));
        self.publishers
            .insert(requirement.name.clone(), publisher.clone());
        self.components.push(publisher.clone());
        Ok(publisher)
    }

    fn add_rpc_client(&mut self, requirement: &Requirement) -> Result<Arc<RpcClient>, ConfigError> {
        let client = Arc::new(RpcClient::new(
            self.rpc_params(requirement)?,
            self.factory.clone(),
        ));
        self.rpc_clients
            .insert(requirement.name.clone(), client.clone());
        self.components.push(client.clone());
        Ok(client)
    }

    fn bind_statics(&mut self, component: &str, processor: &mut Processor) -> Result<(), ConfigError> {
        let statics: Vec<(String, ParamKind)> = processor
            .static_params()
            .map(|param| (param.name.clone(), param.kind.clone()))
            .collect();

        for (param, kind) in statics {
            let argument = match kind {
                ParamKind::Publisher(name) => match self.publisher(&name) {
                    Some(publisher) => Argument::Publisher(publisher),
                    None if self.settings.publisher(&name).is_some() => Argument::Publisher(
                        self.add_publisher(&Requirement::new(&name, ComponentKind::Publisher))?,
                    ),
                    None => {
                        return Err(ConfigError::MissingReference {
                            component: component.to_owned(),
                            kind: "publisher",
                            reference: name,
                        })
                    }
                },
                ParamKind::RpcClient(name) => match self.rpc_client(&name) {
                    Some(client) => Argument::RpcClient(client),
                    None if self.settings.rpc(&name).is_some() => Argument::RpcClient(
                        self.add_rpc_client(&Requirement::new(&name, ComponentKind::RpcClient))?,
                    ),
                    None => {
                        return Err(ConfigError::MissingReference {
                            component: component.to_owned(),
                            kind: "rpc client",
                            reference: name,
                        })
                    }
                },
                _ => continue,
            };
            processor.bind_static(&param, argument);
        }
        Ok(())
    }

    fn consumer_params(
        &self,
        requirement: &Requirement,
    ) -> Result<Arc<ConsumerParams>, ConfigError> {
        match &requirement.params {
            Some(InlineParams::Consumer(params)) => Ok(params.clone()),
            Some(_) => Err(self.mismatched_params(requirement)),
            None => self
                .settings
                .consumer(&requirement.name)
                .ok_or_else(|| self.missing(requirement.kind, &requirement.name)),
        }
    }

    fn service_params(
        &self,
        requirement: &Requirement,
    ) -> Result<Arc<ServiceParams>, ConfigError> {
        match &requirement.params {
            Some(InlineParams::Service(params)) => Ok(params.clone()),
            Some(_) => Err(self.mismatched_params(requirement)),
            None => self
                .settings
                .service(&requirement.name)
                .ok_or_else(|| self.missing(requirement.kind, &requirement.name)),
        }
    }

    fn rpc_params(
        &self,
        requirement: &Requirement,
    ) -> Result<Arc<RpcParams>, ConfigError> {
        match &requirement.params {
            Some(InlineParams::Rpc(params)) => Ok(params.clone()),
            Some(_) => Err(self.mismatched_params(requirement)),
            None => self
                .settings
                .rpc(&requirement.name)
                .ok_or_else(|| self.missing(requirement.kind, &requirement.name)),
        }
    }

    fn missing(&self, kind: ComponentKind, name: &str) -> ConfigError {
        ConfigError::MissingReference {
            component: self.name.clone(),
            kind: kind.as_str(),
            reference: name.to_owned(),
        }
    }

    fn mismatched_params(&self, requirement: &Requirement) -> ConfigError {
        ConfigError::InvalidValue {
            component: requirement.name.clone(),
            reason: format!("inline parameters do not describe a {}", requirement.kind),
        }
    }

    /// Runs until a termination signal is received.
    pub async fn run(&self) -> Result<(), AppError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = err.to_string(), "failure to listen for the termination signal");
            }
        })
        .await
    }

    /// Starts every component, waits for `shutdown`, cancels the components and releases
    /// the broker resources.
    ///
    /// Resources are also released when a component fails to start or when the returned
    /// future is dropped.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        let guard = self.registry.guard();
        let span = info_span!("app", name = self.name.as_str());

        let result = self.run_components(shutdown).instrument(span).await;
        let released = guard.release().await;

        result?;
        released?;
        Ok(())
    }

    async fn run_components<F>(&self, shutdown: F) -> Result<(), AppError>
    where
        F: Future<Output = ()>,
    {
        for (started, component) in self.components.iter().enumerate() {
            if let Err(err) = component.start().await {
                error!(
                    error = err.to_string(),
                    component = component.name(),
                    "failure to start component"
                );
                for component in self.components[..started].iter().rev() {
                    component.cancel().await;
                }
                return Err(err.into());
            }
        }
        info!(components = self.components.len(), "app running");

        shutdown.await;
        info!("shutting down");

        for component in self.components.iter().rev() {
            component.cancel().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{ConnectionParams, Direction},
        errors::ProcessingError,
        exchange::ExchangeParams,
        memory::MemoryBroker,
        processor::{Param, Reply},
        settings::RawSettings,
    };

    const SETTINGS: &str = r#"{
        "connections": { "default": { "url": "amqp://localhost" } },
        "publishers": {
            "notifier": { "exchange": "notifications", "routing_key": "note" }
        },
        "consumers": {
            "orders": { "exchange": "orders", "routing_key": "order", "queue": "orders" }
        }
    }"#;

    fn app(broker: &MemoryBroker) -> App {
        let raw = RawSettings::from_json(SETTINGS).unwrap();
        App::new("shop", &raw, Arc::new(broker.clone())).unwrap()
    }

    fn forwarding() -> Processor {
        Processor::builder()
            .param(Param::value("id"))
            .param(Param::publisher("notifier", "notifier"))
            .handle(|args| async move {
                let id: u64 = args.get("id")?;
                args.publisher("notifier")?
                    .publish(&id, None)
                    .await
                    .map_err(ProcessingError::from)?;
                Ok::<_, ProcessingError>(Reply::Empty)
            })
            .unwrap()
    }

    #[test]
    fn configuration_errors_surface_before_any_connection() {
        let broker = MemoryBroker::new();
        let raw = RawSettings::from_json(
            r#"{ "consumers": { "orders": { "exchange": "orders", "queue": "orders", "connection": "missing" } } }"#,
        )
        .unwrap();

        let err = App::new("shop", &raw, Arc::new(broker.clone())).err().unwrap();

        assert!(matches!(err, ConfigError::MissingReference { .. }));
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[test]
    fn static_publishers_are_built_from_the_settings() {
        let broker = MemoryBroker::new();
        let mut app = app(&broker);
        let mut scheme = Scheme::new("shop");
        scheme.consumer("orders", forwarding()).unwrap();

        app.setup(scheme).unwrap();

        assert!(app.publisher("notifier").is_some());
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[test]
    fn unknown_static_reference_is_a_configuration_error() {
        let broker = MemoryBroker::new();
        let mut app = app(&broker);
        let processor = Processor::builder()
            .param(Param::rpc_client("pricing", "pricing"))
            .handle(|_| async { Ok::<_, ProcessingError>(Reply::Empty) })
            .unwrap();
        let mut scheme = Scheme::new("shop");
        scheme.consumer("orders", processor).unwrap();

        let err = app.setup(scheme).unwrap_err();

        assert_eq!(
            err,
            ConfigError::MissingReference {
                component: "orders".to_owned(),
                kind: "rpc client",
                reference: "pricing".to_owned(),
            }
        );
    }

    #[test]
    fn undeclared_requirement_is_a_configuration_error() {
        let broker = MemoryBroker::new();
        let mut app = app(&broker);
        let mut scheme = Scheme::new("shop");
        scheme.publisher("audit").unwrap();

        let err = app.setup(scheme).unwrap_err();

        assert!(matches!(err, ConfigError::MissingReference { kind: "publisher", .. }));
    }

    #[tokio::test]
    async fn run_until_releases_every_connection() {
        let broker = MemoryBroker::new();
        let mut app = app(&broker);
        let mut scheme = Scheme::new("shop");
        scheme.consumer("orders", forwarding()).unwrap();
        app.setup(scheme).unwrap();

        app.run_until(async {
            assert_eq!(broker.consumer_count("orders"), 1);
            assert_eq!(
                broker.open_connections(),
                vec!["shop_default_read".to_owned(), "shop_default_write".to_owned()]
            );
        })
        .await
        .unwrap();

        assert!(broker.open_connections().is_empty());
    }

    #[tokio::test]
    async fn start_failure_still_releases_resources() {
        let broker = MemoryBroker::new();
        let raw = RawSettings::from_json(
            r#"{
                "connections": { "default": { "url": "amqp://localhost" } },
                "exchanges": { "events": { "name": "events", "type": "fanout" } },
                "publishers": { "audit": { "exchange": "events", "routing_key": "audit" } }
            }"#,
        )
        .unwrap();
        let mut app = App::new("shop", &raw, Arc::new(broker.clone())).unwrap();
        let mut scheme = Scheme::new("shop");
        scheme.publisher("audit").unwrap();
        app.setup(scheme).unwrap();
        // a conflicting declaration already exists on the broker
        let setup = ResourceFactory::new(Arc::new(broker.clone()), ResourceRegistry::new());
        let channel = setup
            .channel(&ConnectionParams::url("setup", "amqp://localhost"), Direction::Write)
            .await
            .unwrap();
        setup
            .declare_exchange(channel.as_ref(), &ExchangeParams::new("events").topic())
            .await
            .unwrap();

        let result = app.run_until(async {}).await;

        assert!(matches!(result, Err(AppError::Amqp(_))));
        assert_eq!(broker.open_connections(), vec!["setup_write".to_owned()]);
    }
}
