// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Processor
//!
//! A [`Processor`] turns a delivered message into the arguments of an application handler,
//! invokes the handler and wraps what it returns into messages to publish.
//!
//! Handlers declare their parameters explicitly with [`Param`]. The way message-derived
//! parameters are bound, the [`Solver`], is chosen once when the processor is built:
//!
//! - [`Solver::LegacyPositional`]: two untyped parameters receive the whole decoded body and
//!   the message envelope. Kept for older handlers and deprecated.
//! - [`Solver::TypedModel`]: the body is parsed into a payload model; other parameters are
//!   looked up among the model fields.
//! - [`Solver::RawKeys`]: each parameter is looked up among the top-level keys of the body.
//!
//! Parameters bound to a publisher or an RPC client are static: they are resolved once at
//! startup and never take part in the solver choice.

use crate::{
    consumer::MessageHandler,
    errors::{ConfigError, ProcessingError},
    message::{IncomingMessage, OutgoingMessage},
    publisher::Publisher,
    rpc::RpcClient,
};
use async_trait::async_trait;
use futures_util::{
    future::{BoxFuture, FutureExt},
    Future,
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::{
    any::{type_name, Any, TypeId},
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
};
use tracing::warn;

type ParseFn = fn(&Value) -> Result<Arc<dyn Any + Send + Sync>, String>;
type FieldsFn = fn(&(dyn Any + Send + Sync)) -> Option<Map<String, Value>>;

/// A payload model type: parsed from the whole body, exposing its fields by name.
#[derive(Clone)]
pub struct ModelType {
    id: TypeId,
    name: &'static str,
    parse: ParseFn,
    fields: FieldsFn,
}

impl ModelType {
    pub fn of<T>() -> ModelType
    where
        T: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        ModelType {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
            parse: |body| {
                serde_json::from_value::<T>(body.clone())
                    .map(|model| Arc::new(model) as Arc<dyn Any + Send + Sync>)
                    .map_err(|err| err.to_string())
            },
            fields: |model| {
                let model = model.downcast_ref::<T>()?;
                match serde_json::to_value(model).ok()? {
                    Value::Object(fields) => Some(fields),
                    _ => None,
                }
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ModelType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModelType").field(&self.name).finish()
    }
}

/// What a handler parameter is bound to.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    /// No type information: looked up by name, or positional for legacy handlers.
    Untyped,
    /// A JSON value looked up by name.
    Value,
    /// The message envelope.
    Message,
    /// The payload model.
    Model(ModelType),
    /// The named publisher, bound at startup.
    Publisher(String),
    /// The named RPC client, bound at startup.
    RpcClient(String),
}

/// A declared handler parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
}

impl Param {
    pub fn untyped(name: &str) -> Param {
        Param::with_kind(name, ParamKind::Untyped)
    }

    pub fn value(name: &str) -> Param {
        Param::with_kind(name, ParamKind::Value)
    }

    pub fn message(name: &str) -> Param {
        Param::with_kind(name, ParamKind::Message)
    }

    pub fn model<T>(name: &str) -> Param
    where
        T: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        Param::with_kind(name, ParamKind::Model(ModelType::of::<T>()))
    }

    pub fn publisher(name: &str, publisher: &str) -> Param {
        Param::with_kind(name, ParamKind::Publisher(publisher.to_owned()))
    }

    pub fn rpc_client(name: &str, client: &str) -> Param {
        Param::with_kind(name, ParamKind::RpcClient(client.to_owned()))
    }

    fn with_kind(name: &str, kind: ParamKind) -> Param {
        Param {
            name: name.to_owned(),
            kind,
        }
    }

    /// Whether the parameter is bound once at startup rather than per message.
    pub fn is_static(&self) -> bool {
        matches!(
            self.kind,
            ParamKind::Publisher(_) | ParamKind::RpcClient(_)
        )
    }
}

/// The strategy binding message-derived parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Solver {
    LegacyPositional,
    TypedModel(ModelType),
    RawKeys,
}

/// A value bound to a handler parameter.
#[derive(Clone)]
pub enum Argument {
    Value(Value),
    Message(Arc<IncomingMessage>),
    Model(Arc<dyn Any + Send + Sync>),
    Publisher(Arc<Publisher>),
    RpcClient(Arc<RpcClient>),
}

/// The arguments of one handler invocation, by parameter name.
#[derive(Clone, Default)]
pub struct Arguments {
    values: Vec<(String, Argument)>,
    context: Context,
}

impl Arguments {
    /// Trace context of the message being processed.
    pub fn context(&self) -> &Context {
        &self.context
    }

    fn push(&mut self, name: &str, argument: Argument) {
        self.values.push((name.to_owned(), argument));
    }

    fn find(&self, name: &str) -> Result<&Argument, ProcessingError> {
        self.values
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, argument)| argument)
            .ok_or_else(|| {
                ProcessingError::DependencyResolution(format!("no argument named `{name}`"))
            })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.find(name) {
            Ok(Argument::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// Deserializes the JSON value bound to `name`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, ProcessingError> {
        match self.find(name)? {
            Argument::Value(value) => serde_json::from_value(value.clone()).map_err(|err| {
                ProcessingError::DependencyResolution(format!("argument `{name}`: {err}"))
            }),
            _ => Err(ProcessingError::DependencyResolution(format!(
                "argument `{name}` is not a JSON value"
            ))),
        }
    }

    /// The message envelope, whatever the parameter name.
    pub fn message(&self) -> Result<Arc<IncomingMessage>, ProcessingError> {
        self.values
            .iter()
            .find_map(|(_, argument)| match argument {
                Argument::Message(message) => Some(message.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                ProcessingError::DependencyResolution("no message parameter declared".to_owned())
            })
    }

    pub fn model<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ProcessingError> {
        match self.find(name)? {
            Argument::Model(model) => model.clone().downcast::<T>().map_err(|_| {
                ProcessingError::DependencyResolution(format!(
                    "argument `{name}` is not a `{}`",
                    type_name::<T>()
                ))
            }),
            _ => Err(ProcessingError::DependencyResolution(format!(
                "argument `{name}` is not a model"
            ))),
        }
    }

    pub fn publisher(&self, name: &str) -> Result<Arc<Publisher>, ProcessingError> {
        match self.find(name)? {
            Argument::Publisher(publisher) => Ok(publisher.clone()),
            _ => Err(ProcessingError::DependencyResolution(format!(
                "argument `{name}` is not a publisher"
            ))),
        }
    }

    pub fn rpc_client(&self, name: &str) -> Result<Arc<RpcClient>, ProcessingError> {
        match self.find(name)? {
            Argument::RpcClient(client) => Ok(client.clone()),
            _ => Err(ProcessingError::DependencyResolution(format!(
                "argument `{name}` is not an rpc client"
            ))),
        }
    }
}

/// A message produced by a handler, with an optional routing key override.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub message: OutgoingMessage,
    pub routing_key: Option<String>,
}

impl Output {
    pub fn new(message: OutgoingMessage) -> Output {
        Output {
            message,
            routing_key: None,
        }
    }

    /// Serializes `payload` to its JSON encoding.
    pub fn json<T: Serialize + ?Sized>(payload: &T) -> Result<Output, ProcessingError> {
        OutgoingMessage::json(payload)
            .map(Output::new)
            .map_err(|err| ProcessingError::Handler(format!("cannot encode reply: {err}")))
    }

    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = Some(routing_key.to_owned());
        self
    }
}

type Outputs = Box<dyn Iterator<Item = Result<Output, ProcessingError>> + Send>;

/// What a handler returns.
pub enum Reply {
    /// Nothing to publish.
    Empty,
    One(Output),
    /// A finite sequence produced for this invocation, published in order.
    Sequence(Outputs),
}

impl Reply {
    pub fn json<T: Serialize + ?Sized>(payload: &T) -> Result<Reply, ProcessingError> {
        Output::json(payload).map(Reply::One)
    }

    pub fn message(message: OutgoingMessage) -> Reply {
        Reply::One(Output::new(message))
    }

    pub fn sequence<I>(outputs: I) -> Reply
    where
        I: IntoIterator<Item = Result<Output, ProcessingError>>,
        I::IntoIter: Send + 'static,
    {
        Reply::Sequence(Box::new(outputs.into_iter()))
    }

    pub fn into_outputs(self) -> Outputs {
        match self {
            Reply::Empty => Box::new(std::iter::empty()),
            Reply::One(output) => Box::new(std::iter::once(Ok(output))),
            Reply::Sequence(outputs) => outputs,
        }
    }
}

impl From<Output> for Reply {
    fn from(output: Output) -> Self {
        Reply::One(output)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Empty => f.write_str("Empty"),
            Reply::One(output) => f.debug_tuple("One").field(output).finish(),
            Reply::Sequence(_) => f.write_str("Sequence(..)"),
        }
    }
}

type AsyncHandler =
    Arc<dyn Fn(Arguments) -> BoxFuture<'static, Result<Reply, ProcessingError>> + Send + Sync>;
type BlockingHandler = Arc<dyn Fn(Arguments) -> Result<Reply, ProcessingError> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Async(AsyncHandler),
    Blocking(BlockingHandler),
}

/// Collects the parameter declarations of a handler.
#[derive(Debug, Default)]
pub struct ProcessorBuilder {
    params: Vec<Param>,
    payload: Option<ModelType>,
}

impl ProcessorBuilder {
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Declares the payload model explicitly.
    pub fn payload<T>(mut self) -> Self
    where
        T: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        self.payload = Some(ModelType::of::<T>());
        self
    }

    /// Builds a processor awaiting `handler` on the consumer task.
    pub fn handle<F, Fut>(self, handler: F) -> Result<Processor, ConfigError>
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, ProcessingError>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |args| handler(args).boxed());
        self.build(Handler::Async(handler))
    }

    /// Builds a processor running `handler` on the blocking thread pool.
    pub fn handle_blocking<F>(self, handler: F) -> Result<Processor, ConfigError>
    where
        F: Fn(Arguments) -> Result<Reply, ProcessingError> + Send + Sync + 'static,
    {
        self.build(Handler::Blocking(Arc::new(handler)))
    }

    fn build(self, handler: Handler) -> Result<Processor, ConfigError> {
        let solver = select_solver(&self.params, self.payload)?;

        if solver == Solver::LegacyPositional {
            warn!(
                params = ?self.params.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
                "handler uses the deprecated positional (body, message) parameters, declare typed parameters instead"
            );
        }

        Ok(Processor {
            params: self.params,
            solver,
            handler,
            statics: Vec::new(),
        })
    }
}

fn select_solver(params: &[Param], explicit: Option<ModelType>) -> Result<Solver, ConfigError> {
    let dynamic: Vec<&Param> = params.iter().filter(|param| !param.is_static()).collect();

    let mut models: Vec<&ModelType> = vec![];
    for param in &dynamic {
        if let ParamKind::Model(model) = &param.kind {
            if !models.contains(&model) {
                models.push(model);
            }
        }
    }

    if let [first, second, ..] = models.as_slice() {
        return Err(ConfigError::AmbiguousPayload {
            first: first.name.to_owned(),
            second: second.name.to_owned(),
        });
    }

    let payload = match (explicit, models.first()) {
        (Some(explicit), Some(model)) if explicit != **model => {
            return Err(ConfigError::AmbiguousPayload {
                first: explicit.name.to_owned(),
                second: model.name.to_owned(),
            })
        }
        (Some(explicit), _) => Some(explicit),
        (None, model) => model.map(|model| (*model).clone()),
    };

    let legacy = matches!(
        dynamic.as_slice(),
        [first, second] if first.kind == ParamKind::Untyped
            && matches!(second.kind, ParamKind::Untyped | ParamKind::Message)
    );

    Ok(match payload {
        Some(model) => Solver::TypedModel(model),
        None if legacy => Solver::LegacyPositional,
        None => Solver::RawKeys,
    })
}

/// Binds a handler to delivered messages.
#[derive(Clone)]
pub struct Processor {
    params: Vec<Param>,
    solver: Solver,
    handler: Handler,
    statics: Vec<(String, Argument)>,
}

impl Processor {
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::default()
    }

    pub fn solver(&self) -> &Solver {
        &self.solver
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Parameters to bind at startup.
    pub fn static_params(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|param| param.is_static())
    }

    /// Binds the static parameter `name`.
    pub fn bind_static(&mut self, name: &str, argument: Argument) {
        self.statics.retain(|(param, _)| param != name);
        self.statics.push((name.to_owned(), argument));
    }

    /// Decodes `message`, invokes the handler and returns what it produced.
    pub async fn process(
        &self,
        ctx: &Context,
        message: &IncomingMessage,
    ) -> Result<Reply, ProcessingError> {
        let mut arguments = self.solve(message)?;
        arguments.context = ctx.clone();
        self.invoke(arguments).await
    }

    /// Binds every parameter for `message`.
    pub fn solve(&self, message: &IncomingMessage) -> Result<Arguments, ProcessingError> {
        let body: Value = serde_json::from_slice(&message.body)
            .map_err(|err| ProcessingError::Decode(err.to_string()))?;
        let envelope = Arc::new(message.clone());
        let mut arguments = Arguments::default();

        match &self.solver {
            Solver::LegacyPositional => {
                let mut dynamic = self.params.iter().filter(|param| !param.is_static());
                if let Some(param) = dynamic.next() {
                    arguments.push(&param.name, Argument::Value(body));
                }
                if let Some(param) = dynamic.next() {
                    arguments.push(&param.name, Argument::Message(envelope));
                }
            }
            Solver::TypedModel(model) => {
                let instance = (model.parse)(&body).map_err(|err| {
                    ProcessingError::DependencyResolution(format!(
                        "body is not a valid `{}`: {err}",
                        model.name
                    ))
                })?;
                let mut fields: Option<Map<String, Value>> = None;

                for param in self.params.iter().filter(|param| !param.is_static()) {
                    let argument = match &param.kind {
                        ParamKind::Message => Argument::Message(envelope.clone()),
                        ParamKind::Model(_) => Argument::Model(instance.clone()),
                        _ => {
                            let fields = fields.get_or_insert_with(|| {
                                (model.fields)(instance.as_ref()).unwrap_or_default()
                            });
                            let value = fields.get(&param.name).cloned().ok_or_else(|| {
                                ProcessingError::DependencyResolution(format!(
                                    "`{}` is not a field of `{}`",
                                    param.name, model.name
                                ))
                            })?;
                            Argument::Value(value)
                        }
                    };
                    arguments.push(&param.name, argument);
                }
            }
            Solver::RawKeys => {
                for param in self.params.iter().filter(|param| !param.is_static()) {
                    let argument = match &param.kind {
                        ParamKind::Message => Argument::Message(envelope.clone()),
                        _ => {
                            let value = body
                                .as_object()
                                .ok_or_else(|| {
                                    ProcessingError::DependencyResolution(
                                        "body is not a JSON object".to_owned(),
                                    )
                                })?
                                .get(&param.name)
                                .cloned()
                                .ok_or_else(|| {
                                    ProcessingError::DependencyResolution(format!(
                                        "missing key `{}`",
                                        param.name
                                    ))
                                })?;
                            Argument::Value(value)
                        }
                    };
                    arguments.push(&param.name, argument);
                }
            }
        }

        for param in self.static_params() {
            let (_, argument) = self
                .statics
                .iter()
                .find(|(name, _)| *name == param.name)
                .ok_or_else(|| {
                    ProcessingError::DependencyResolution(format!(
                        "`{}` is not bound",
                        param.name
                    ))
                })?;
            arguments.push(&param.name, argument.clone());
        }

        Ok(arguments)
    }

    async fn invoke(&self, arguments: Arguments) -> Result<Reply, ProcessingError> {
        match &self.handler {
            Handler::Async(handler) => {
                let handler = handler.clone();
                AssertUnwindSafe(async move { handler(arguments).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(ProcessingError::Handler(panic_message(&*panic))))
            }
            Handler::Blocking(handler) => {
                let handler = handler.clone();
                match tokio::task::spawn_blocking(move || handler(arguments)).await {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => {
                        Err(ProcessingError::Handler(panic_message(&*err.into_panic())))
                    }
                    Err(err) => Err(ProcessingError::handler(err)),
                }
            }
        }
    }
}

/// Consumes messages without publishing: outputs are produced and discarded.
#[async_trait]
impl MessageHandler for Processor {
    async fn handle(&self, ctx: &Context, message: &IncomingMessage) -> Result<(), ProcessingError> {
        for output in self.process(ctx, message).await?.into_outputs() {
            output?;
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_owned());
    format!("handler panicked: {detail}")
}
