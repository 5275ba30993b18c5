// crates/drudge-rpc/src/service.rs
//
// Runtime service definitions: a fully-qualified service name plus its
// methods, each with a typed handler, an optional HTTP binding and the
// request fields copied into log tags.
//
// Handlers are plain async closures over serde types; the adapters below
// erase them to the JSON-valued `UnaryHandler` / `StreamHandler` seams the
// interceptor chain drives.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use drudge_core::{
    CallContext, DrudgeError, HttpRule, MethodDescriptor, MethodKind, RequestValidator, Validate,
};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tonic::Status;

use crate::interceptor::{MessageStream, StreamHandler, UnaryHandler};

/// Type-erased handler of one method.
#[derive(Clone)]
pub enum MethodHandler {
    Unary(Arc<dyn UnaryHandler>),
    ServerStreaming(Arc<dyn StreamHandler>),
}

/// A method descriptor with its handler.
#[derive(Clone)]
pub struct MethodEntry {
    descriptor: Arc<MethodDescriptor>,
    handler: MethodHandler,
}

impl MethodEntry {
    pub fn descriptor(&self) -> &Arc<MethodDescriptor> {
        &self.descriptor
    }

    pub fn handler(&self) -> &MethodHandler {
        &self.handler
    }
}

/// An RPC service whose methods are served at `/{name}/{method}`.
#[derive(Clone)]
pub struct ServiceDefinition {
    name: String,
    methods: BTreeMap<String, MethodEntry>,
}

impl ServiceDefinition {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: Vec::new(),
            log_fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by its RPC path.
    pub fn method(&self, path: &str) -> Option<&MethodEntry> {
        self.methods.get(path)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodEntry> {
        self.methods.values()
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct ServiceBuilder {
    name: String,
    methods: Vec<(MethodDescriptor, MethodHandler)>,
    log_fields: Vec<(String, Vec<String>)>,
}

impl ServiceBuilder {
    /// Add a unary method. `rule` is an [`HttpRule`] or `None` for an
    /// RPC-only method.
    pub fn unary<Req, Resp, F, Fut>(
        mut self,
        name: &str,
        rule: impl Into<Option<HttpRule>>,
        handler: F,
    ) -> Self
    where
        Req: DeserializeOwned + Validate + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let descriptor = MethodDescriptor::new(self.name.clone(), name, MethodKind::Unary)
            .with_rule(rule.into())
            .with_validator(validator_for::<Req>());
        let handler = TypedUnary {
            handler,
            _types: PhantomData,
        };
        self.methods
            .push((descriptor, MethodHandler::Unary(Arc::new(handler))));
        self
    }

    /// Add a server-streaming method.
    pub fn server_streaming<Req, Resp, F, Fut, S>(
        mut self,
        name: &str,
        rule: impl Into<Option<HttpRule>>,
        handler: F,
    ) -> Self
    where
        Req: DeserializeOwned + Validate + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        let descriptor =
            MethodDescriptor::new(self.name.clone(), name, MethodKind::ServerStreaming)
                .with_rule(rule.into())
                .with_validator(validator_for::<Req>());
        let handler = TypedStream {
            handler,
            _types: PhantomData,
        };
        self.methods
            .push((descriptor, MethodHandler::ServerStreaming(Arc::new(handler))));
        self
    }

    /// Declare request fields (dotted paths allowed) copied into log tags
    /// for `method`.
    pub fn log_fields(mut self, method: &str, fields: &[&str]) -> Self {
        self.log_fields.push((
            method.to_string(),
            fields.iter().map(|f| f.to_string()).collect(),
        ));
        self
    }

    pub fn build(self) -> Result<ServiceDefinition, DrudgeError> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(DrudgeError::Config(format!(
                "invalid service name '{}'",
                self.name
            )));
        }

        let mut log_fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (method, fields) in self.log_fields {
            if !self.methods.iter().any(|(d, _)| d.name() == method) {
                return Err(DrudgeError::Config(format!(
                    "log fields declared for unknown method '{method}'"
                )));
            }
            log_fields.entry(method).or_default().extend(fields);
        }

        let mut methods = BTreeMap::new();
        for (descriptor, handler) in self.methods {
            if descriptor.name().is_empty() || descriptor.name().contains('/') {
                return Err(DrudgeError::Config(format!(
                    "invalid method name '{}' in {}",
                    descriptor.name(),
                    self.name
                )));
            }
            if let Some(rule) = descriptor.rule() {
                rule.validate()?;
            }
            let fields = log_fields.remove(descriptor.name()).unwrap_or_default();
            let descriptor = descriptor.with_log_fields(fields);
            let path = descriptor.path();
            let entry = MethodEntry {
                descriptor: Arc::new(descriptor),
                handler,
            };
            if methods.insert(path.clone(), entry).is_some() {
                return Err(DrudgeError::Config(format!("duplicate method {path}")));
            }
        }

        Ok(ServiceDefinition {
            name: self.name,
            methods,
        })
    }
}

fn validator_for<Req>() -> RequestValidator
where
    Req: DeserializeOwned + Validate + 'static,
{
    Arc::new(|value: &Value| {
        let request: Req = Req::deserialize(value).map_err(|e| e.to_string())?;
        request.validate()
    })
}

fn decode_request<Req: DeserializeOwned>(request: Value) -> Result<Req, Status> {
    serde_json::from_value(request)
        .map_err(|e| Status::invalid_argument(format!("failed to decode request: {e}")))
}

fn encode_message<Resp: Serialize>(message: &Resp) -> Result<Value, Status> {
    serde_json::to_value(message)
        .map_err(|e| Status::internal(format!("failed to encode response: {e}")))
}

struct TypedUnary<Req, Resp, F> {
    handler: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<Req, Resp, F, Fut> UnaryHandler for TypedUnary<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, request: Value) -> Result<Value, Status> {
        let request = decode_request::<Req>(request)?;
        let response = (self.handler)(ctx, request).await?;
        encode_message(&response)
    }
}

struct TypedStream<Req, Resp, F> {
    handler: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<Req, Resp, F, Fut, S> StreamHandler for TypedStream<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S, Status>> + Send + 'static,
    S: Stream<Item = Result<Resp, Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, request: Value) -> Result<MessageStream, Status> {
        let request = decode_request::<Req>(request)?;
        let stream = (self.handler)(ctx, request).await?;
        Ok(Box::pin(
            stream.map(|item| item.and_then(|message| encode_message(&message))),
        ))
    }
}
