// crates/drudge-rpc/src/middleware.rs
//
// Default interceptors appended to every chain, outermost first:
// validation, tracing, request tagging, access logging, metrics.
//
// Each type implements both the unary and the streaming interceptor trait.
// Streaming post-call logic is attached with `on_stream_end` so it runs when
// the stream finishes, not when the handler returns.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use drudge_core::{code_name, CallContext, DrudgeError, MethodDescriptor, TagSet};
use drudge_telemetry::{
    extract_from_metadata, record, Instrument, MetricDescriptor, MetricRegistry,
    DEFAULT_LATENCY_BUCKETS,
};
use futures::Stream;
use serde_json::Value;
use tonic::{Code, Status};
use tracing::{Instrument as _, Level, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::interceptor::{
    on_stream_end, DefaultTail, MessageStream, StreamInterceptor, StreamNext, UnaryInterceptor,
    UnaryNext,
};

/// Log level for a finished call. OK is quiet; everything else follows the
/// usual severity of the code.
pub fn code_to_level(code: Code) -> Level {
    match code {
        Code::Ok => Level::DEBUG,
        Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::Unauthenticated => Level::INFO,
        Code::DeadlineExceeded
        | Code::PermissionDenied
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable => Level::WARN,
        Code::Unknown | Code::Unimplemented | Code::Internal | Code::DataLoss => Level::ERROR,
    }
}

/// The fixed tail every server chain ends with.
pub fn default_tail(
    service_name: &str,
    registry: &MetricRegistry,
) -> Result<DefaultTail, DrudgeError> {
    let validation = Arc::new(RequestValidation);
    let tracing = Arc::new(ServerTracing::new(service_name));
    let tagging = Arc::new(RequestTagging);
    let logging = Arc::new(AccessLogging);
    let metrics = Arc::new(ServerMetrics::register(registry)?);
    Ok(DefaultTail {
        unary: vec![
            validation.clone(),
            tracing.clone(),
            tagging.clone(),
            logging.clone(),
            metrics.clone(),
        ],
        stream: vec![validation, tracing, tagging, logging, metrics],
    })
}

// ---- validation ----

/// Rejects requests failing the method's validator with INVALID_ARGUMENT.
#[derive(Debug, Default)]
pub struct RequestValidation;

impl RequestValidation {
    fn check(ctx: &CallContext, request: &Value) -> Result<(), Status> {
        ctx.method().validate(request).map_err(Status::invalid_argument)
    }
}

#[async_trait]
impl UnaryInterceptor for RequestValidation {
    fn name(&self) -> &str {
        "validation"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: UnaryNext<'_>,
    ) -> Result<Value, Status> {
        Self::check(&ctx, &request)?;
        next.run(ctx, request).await
    }
}

#[async_trait]
impl StreamInterceptor for RequestValidation {
    fn name(&self) -> &str {
        "validation"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: StreamNext<'_>,
    ) -> Result<MessageStream, Status> {
        Self::check(&ctx, &request)?;
        next.run(ctx, request).await
    }
}

// ---- tracing ----

/// Continues the caller's trace and opens a server span for the call.
#[derive(Debug)]
pub struct ServerTracing {
    service_name: String,
}

impl ServerTracing {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn open_span(&self, ctx: &mut CallContext) -> Span {
        let method = ctx.method();
        let span = tracing::info_span!(
            "drudge.rpc",
            otel.kind = "server",
            otel.status_code = tracing::field::Empty,
            rpc.system = "grpc",
            rpc.service = %method.service(),
            rpc.method = %method.name(),
            rpc.grpc.status_code = tracing::field::Empty,
            drudge.server = %self.service_name,
        );
        span.set_parent(extract_from_metadata(ctx.metadata()));
        ctx.set_span(span.clone());
        span
    }
}

fn record_status(span: &Span, code: Code) {
    span.record("rpc.grpc.status_code", code as i32);
    if code != Code::Ok {
        span.record("otel.status_code", "ERROR");
    }
}

#[async_trait]
impl UnaryInterceptor for ServerTracing {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn intercept(
        &self,
        mut ctx: CallContext,
        request: Value,
        next: UnaryNext<'_>,
    ) -> Result<Value, Status> {
        let span = self.open_span(&mut ctx);
        let result = next.run(ctx, request).instrument(span.clone()).await;
        record_status(&span, result.as_ref().err().map_or(Code::Ok, Status::code));
        result
    }
}

#[async_trait]
impl StreamInterceptor for ServerTracing {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn intercept(
        &self,
        mut ctx: CallContext,
        request: Value,
        next: StreamNext<'_>,
    ) -> Result<MessageStream, Status> {
        let span = self.open_span(&mut ctx);
        let stream = match next.run(ctx, request).instrument(span.clone()).await {
            Ok(stream) => stream,
            Err(status) => {
                record_status(&span, status.code());
                return Err(status);
            }
        };
        let finished = span.clone();
        let stream = on_stream_end(stream, move |outcome| record_status(&finished, outcome.code));
        Ok(Box::pin(SpannedStream { inner: stream, span }))
    }
}

/// Enters `span` on every poll so handler events inside the stream are
/// scoped to the call. The span closes when the stream is dropped.
struct SpannedStream {
    inner: MessageStream,
    span: Span,
}

impl Stream for SpannedStream {
    type Item = Result<Value, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let _entered = this.span.enter();
        this.inner.as_mut().poll_next(cx)
    }
}

// ---- tagging ----

/// Fills the call's tag set: declared request fields, peer, request id.
#[derive(Debug, Default)]
pub struct RequestTagging;

impl RequestTagging {
    fn tag(ctx: &CallContext, request: &Value) {
        for field in ctx.method().log_fields() {
            if let Some(value) = lookup_field(request, field) {
                ctx.set_tag(format!("grpc.request.{field}"), render_value(value));
            }
        }
        if let Some(peer) = ctx.peer() {
            ctx.set_tag("peer.address", peer);
        }
        let request_id = ctx
            .metadata_value("x-request-id")
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        ctx.set_tag("request.id", request_id);
    }
}

fn lookup_field<'a>(request: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(request, |value, segment| value.get(segment))
        .filter(|value| !value.is_null())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl UnaryInterceptor for RequestTagging {
    fn name(&self) -> &str {
        "tagging"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: UnaryNext<'_>,
    ) -> Result<Value, Status> {
        Self::tag(&ctx, &request);
        next.run(ctx, request).await
    }
}

#[async_trait]
impl StreamInterceptor for RequestTagging {
    fn name(&self) -> &str {
        "tagging"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: StreamNext<'_>,
    ) -> Result<MessageStream, Status> {
        Self::tag(&ctx, &request);
        next.run(ctx, request).await
    }
}

// ---- access logging ----

macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($arg)+),
            Level::WARN => tracing::warn!($($arg)+),
            Level::INFO => tracing::info!($($arg)+),
            Level::DEBUG => tracing::debug!($($arg)+),
            _ => tracing::trace!($($arg)+),
        }
    };
}

/// One structured line per finished call, at a level chosen by its code.
#[derive(Debug, Default)]
pub struct AccessLogging;

fn log_finished(
    method: &MethodDescriptor,
    tags: &TagSet,
    code: Code,
    message: Option<&str>,
    started: Instant,
) {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    event_at!(
        code_to_level(code),
        grpc.service = %method.service(),
        grpc.method = %method.name(),
        grpc.kind = %method.kind(),
        grpc.code = code_name(code),
        grpc.time_ms = elapsed_ms,
        grpc.error = message.unwrap_or(""),
        tags = %tags,
        "finished {} call with code {}",
        method.kind(),
        code_name(code)
    );
}

#[async_trait]
impl UnaryInterceptor for AccessLogging {
    fn name(&self) -> &str {
        "logging"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: UnaryNext<'_>,
    ) -> Result<Value, Status> {
        let started = Instant::now();
        let method = ctx.method_arc();
        let tags = ctx.tags().clone();
        let result = next.run(ctx, request).await;
        match &result {
            Ok(_) => log_finished(&method, &tags, Code::Ok, None, started),
            Err(status) => {
                log_finished(&method, &tags, status.code(), Some(status.message()), started)
            }
        }
        result
    }
}

#[async_trait]
impl StreamInterceptor for AccessLogging {
    fn name(&self) -> &str {
        "logging"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: StreamNext<'_>,
    ) -> Result<MessageStream, Status> {
        let started = Instant::now();
        let method = ctx.method_arc();
        let tags = ctx.tags().clone();
        match next.run(ctx, request).await {
            Ok(stream) => Ok(on_stream_end(stream, move |outcome| {
                log_finished(&method, &tags, outcome.code, None, started)
            })),
            Err(status) => {
                log_finished(&method, &tags, status.code(), Some(status.message()), started);
                Err(status)
            }
        }
    }
}

// ---- metrics ----

/// Server-side call counters and latency, tagged by service, method and
/// method kind.
#[derive(Debug, Clone)]
pub struct ServerMetrics {
    started: Instrument,
    handled: Instrument,
    msg_sent: Instrument,
    latency: Instrument,
}

impl ServerMetrics {
    pub fn register(registry: &MetricRegistry) -> Result<Self, DrudgeError> {
        let base = ["service", "method", "type"];
        Ok(Self {
            started: registry.register_counter(
                MetricDescriptor::new("drudge_server_started_total", "RPCs started on the server")
                    .tag_keys(base),
            )?,
            handled: registry.register_counter(
                MetricDescriptor::new(
                    "drudge_server_handled_total",
                    "RPCs completed on the server, regardless of success",
                )
                .tag_keys(["service", "method", "type", "code"]),
            )?,
            msg_sent: registry.register_counter(
                MetricDescriptor::new(
                    "drudge_server_msg_sent_total",
                    "Stream messages sent by the server",
                )
                .tag_keys(base),
            )?,
            latency: registry.register_distribution(
                MetricDescriptor::new(
                    "drudge_server_handling_seconds",
                    "Time from call start until the server finished handling it",
                )
                .unit("s")
                .tag_keys(base),
                DEFAULT_LATENCY_BUCKETS.to_vec(),
            )?,
        })
    }

    fn finish(&self, method: &MethodDescriptor, code: Code, started: Instant, sent: u64) {
        let kind = method.kind().as_str();
        let base = [
            ("service", method.service()),
            ("method", method.name()),
            ("type", kind),
        ];
        record(
            Some(&self.handled),
            1.0,
            &[
                ("service", method.service()),
                ("method", method.name()),
                ("type", kind),
                ("code", code_name(code)),
            ],
        );
        record(Some(&self.latency), started.elapsed().as_secs_f64(), &base);
        if sent > 0 {
            record(Some(&self.msg_sent), sent as f64, &base);
        }
    }

    fn start(&self, method: &MethodDescriptor) {
        record(
            Some(&self.started),
            1.0,
            &[
                ("service", method.service()),
                ("method", method.name()),
                ("type", method.kind().as_str()),
            ],
        );
    }
}

#[async_trait]
impl UnaryInterceptor for ServerMetrics {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: UnaryNext<'_>,
    ) -> Result<Value, Status> {
        let method = ctx.method_arc();
        let started = Instant::now();
        self.start(&method);
        let result = next.run(ctx, request).await;
        let code = result.as_ref().err().map_or(Code::Ok, Status::code);
        self.finish(&method, code, started, 0);
        result
    }
}

#[async_trait]
impl StreamInterceptor for ServerMetrics {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: StreamNext<'_>,
    ) -> Result<MessageStream, Status> {
        let method = ctx.method_arc();
        let started = Instant::now();
        self.start(&method);
        match next.run(ctx, request).await {
            Ok(stream) => {
                let metrics = self.clone();
                Ok(on_stream_end(stream, move |outcome| {
                    metrics.finish(&method, outcome.code, started, outcome.messages)
                }))
            }
            Err(status) => {
                self.finish(&method, status.code(), started, 0);
                Err(status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{InterceptorChain, UnaryHandler};
    use drudge_core::MethodKind;
    use serde_json::json;
    use tonic::metadata::{MetadataMap, MetadataValue};

    struct Fixed(Result<Value, Status>);

    #[async_trait]
    impl UnaryHandler for Fixed {
        async fn call(&self, _ctx: CallContext, _request: Value) -> Result<Value, Status> {
            self.0.clone()
        }
    }

    struct TagRecorder(parking_lot::Mutex<Option<TagSet>>);

    #[async_trait]
    impl UnaryHandler for TagRecorder {
        async fn call(&self, ctx: CallContext, _request: Value) -> Result<Value, Status> {
            *self.0.lock() = Some(ctx.tags().clone());
            Ok(json!({}))
        }
    }

    fn descriptor() -> Arc<MethodDescriptor> {
        Arc::new(
            MethodDescriptor::new("acme.v1.Users", "Get", MethodKind::Unary)
                .with_log_fields(vec!["user.id".to_string(), "missing".to_string()])
                .with_validator(Arc::new(|v: &Value| {
                    if v.get("user").is_some() {
                        Ok(())
                    } else {
                        Err("user is required".to_string())
                    }
                })),
        )
    }

    #[test]
    fn test_code_to_level() {
        assert_eq!(code_to_level(Code::Ok), Level::DEBUG);
        assert_eq!(code_to_level(Code::NotFound), Level::INFO);
        assert_eq!(code_to_level(Code::DeadlineExceeded), Level::WARN);
        assert_eq!(code_to_level(Code::Unavailable), Level::WARN);
        assert_eq!(code_to_level(Code::Internal), Level::ERROR);
        assert_eq!(code_to_level(Code::Unimplemented), Level::ERROR);
    }

    #[test]
    fn test_default_tail_order() {
        let registry = MetricRegistry::new();
        let chain = InterceptorChain::builder().build_with(default_tail("svc", &registry).unwrap());
        assert_eq!(
            chain.unary_names(),
            vec!["validation", "tracing", "tagging", "logging", "metrics"]
        );
        assert_eq!(chain.stream_names(), chain.unary_names());
        assert!(default_tail("svc", &registry).is_err(), "metrics register once per registry");
    }

    #[tokio::test]
    async fn test_validation_rejects_before_handler() {
        let registry = MetricRegistry::new();
        let chain = InterceptorChain::builder().build_with(default_tail("svc", &registry).unwrap());
        let ctx = CallContext::new(descriptor(), MetadataMap::new());
        let err = chain
            .call_unary(ctx, json!({}), &Fixed(Ok(json!({}))))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "user is required");

        // Validation is outermost in the tail, so nothing was counted.
        let text = registry.gather_text().unwrap();
        assert!(!text.contains("drudge_server_started_total{"));
    }

    #[tokio::test]
    async fn test_tags_and_request_id() {
        let recorder = TagRecorder(parking_lot::Mutex::new(None));
        let chain = InterceptorChain::builder()
            .unary(Arc::new(RequestTagging))
            .build();
        let mut md = MetadataMap::new();
        md.insert("x-request-id", MetadataValue::from_static("req-42"));
        let ctx = CallContext::new(descriptor(), md).with_peer(Some("10.0.0.9:5000".into()));
        chain
            .call_unary(ctx, json!({"user": {"id": 7}}), &recorder)
            .await
            .unwrap();

        let tags = recorder.0.lock().clone().unwrap().snapshot();
        assert_eq!(tags["grpc.request.user.id"], "7");
        assert_eq!(tags["peer.address"], "10.0.0.9:5000");
        assert_eq!(tags["request.id"], "req-42");
        assert!(!tags.contains_key("grpc.request.missing"));
    }

    #[tokio::test]
    async fn test_generated_request_id() {
        let recorder = TagRecorder(parking_lot::Mutex::new(None));
        let chain = InterceptorChain::builder()
            .unary(Arc::new(RequestTagging))
            .build();
        let ctx = CallContext::new(descriptor(), MetadataMap::new());
        chain.call_unary(ctx, json!({}), &recorder).await.unwrap();
        let id = recorder.0.lock().clone().unwrap().get("request.id").unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn test_metrics_count_codes() {
        let registry = MetricRegistry::new();
        let metrics = Arc::new(ServerMetrics::register(&registry).unwrap());
        let chain = InterceptorChain::builder().unary(metrics).build();

        let ctx = || CallContext::new(descriptor(), MetadataMap::new());
        chain.call_unary(ctx(), json!({}), &Fixed(Ok(json!({})))).await.unwrap();
        chain
            .call_unary(ctx(), json!({}), &Fixed(Err(Status::not_found("x"))))
            .await
            .unwrap_err();

        let text = registry.gather_text().unwrap();
        assert!(text.contains(
            r#"drudge_server_started_total{method="Get",service="acme.v1.Users",type="unary"} 2"#
        ));
        assert!(text.contains(
            r#"drudge_server_handled_total{code="NOT_FOUND",method="Get",service="acme.v1.Users",type="unary"} 1"#
        ));
        assert!(text.contains(
            r#"drudge_server_handled_total{code="OK",method="Get",service="acme.v1.Users",type="unary"} 1"#
        ));
    }

    #[test]
    fn test_lookup_field() {
        let v = json!({"a": {"b": "x"}, "n": null});
        assert_eq!(lookup_field(&v, "a.b"), Some(&json!("x")));
        assert_eq!(lookup_field(&v, "a.c"), None);
        assert_eq!(lookup_field(&v, "n"), None);
    }
}
