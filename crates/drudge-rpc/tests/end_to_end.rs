// crates/drudge-rpc/tests/end_to_end.rs
//
// End-to-end tests for `run`: a real RPC listener, loopback client and HTTP
// listener on ephemeral ports, driven over REST with reqwest and over gRPC
// with a tonic channel pointed at the HTTP port.

use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tonic::Status;

use drudge_rpc::{
    run, CallContext, CancellationToken, Component, DrudgeError, Endpoint, HttpRule, JsonCodec,
    LifecycleObserver, LifecycleState, Options, RecordingObserver, ServiceDefinition, Validate,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HelloRequest {
    #[serde(default)]
    name: String,
}

impl Validate for HelloRequest {
    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name is required".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct HelloReply {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CountdownRequest {
    from: u32,
}

impl Validate for CountdownRequest {}

#[derive(Debug, Serialize)]
struct Tick {
    n: u32,
}

fn greeter() -> ServiceDefinition {
    ServiceDefinition::builder("drudge.test.Greeter")
        .unary(
            "Hello",
            HttpRule::get("/v1/hello"),
            |ctx: CallContext, req: HelloRequest| async move {
                ctx.set_response_metadata("x-greeted", &req.name)?;
                Ok(HelloReply {
                    message: format!("Hello, {}!", req.name),
                })
            },
        )
        .server_streaming(
            "Countdown",
            HttpRule::get("/v1/countdown/{from}"),
            |_ctx: CallContext, req: CountdownRequest| async move {
                let ticks: Vec<Result<Tick, Status>> =
                    (1..=req.from).rev().map(|n| Ok(Tick { n })).collect();
                Ok(stream::iter(ticks))
            },
        )
        .log_fields("Hello", &["name"])
        .build()
        .unwrap()
}

struct Running {
    cancel: CancellationToken,
    observer: Arc<RecordingObserver>,
    handle: JoinHandle<Result<(), DrudgeError>>,
    http_addr: String,
}

/// Start `run` on ephemeral ports and wait until the HTTP listener serves.
async fn start() -> Running {
    start_with(greeter(), Duration::from_secs(2)).await
}

async fn start_with(service: ServiceDefinition, grace: Duration) -> Running {
    let observer = Arc::new(RecordingObserver::new());
    let mut options =
        Options::new(service).with_observer(observer.clone() as Arc<dyn LifecycleObserver>);
    options.addr = "127.0.0.1:0".to_string();
    options.rpc = Endpoint::tcp("127.0.0.1:0");
    options.shutdown_grace = grace;

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run(options, cancel.clone()));

    let mut http_addr = None;
    for _ in 0..200 {
        if let Some(detail) = observer.detail(Component::HttpListener, LifecycleState::Serving) {
            http_addr = Some(detail.trim_start_matches("tcp://").to_string());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let http_addr = http_addr.expect("HTTP listener never reached Serving");

    Running {
        cancel,
        observer,
        handle,
        http_addr,
    }
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    async fn stop(self) -> Arc<RecordingObserver> {
        self.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("run did not return after cancel")
            .expect("run task panicked");
        assert!(result.is_ok(), "run failed: {result:?}");
        self.observer
    }
}

// ---------------------------------------------------------------------------
// REST gateway
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rest_unary_call() {
    let server = start().await;

    let response = reqwest::get(server.url("/v1/hello?name=rest")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("grpc-metadata-x-greeted").unwrap(),
        "rest"
    );
    assert_eq!(
        response.headers().get("access-control-allow-origin"),
        None,
        "no Origin header, no CORS headers"
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"message": "Hello, rest!"}));

    server.stop().await;
}

#[tokio::test]
async fn test_rest_validation_failure_maps_to_400() {
    let server = start().await;

    let response = reqwest::get(server.url("/v1/hello")).await.unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["grpc_code"], 3);
    assert_eq!(body["error"]["http_code"], 400);
    assert_eq!(body["error"]["message"], "name is required");

    server.stop().await;
}

#[tokio::test]
async fn test_rest_streaming_call() {
    let server = start().await;

    let response = reqwest::get(server.url("/v1/countdown/3")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!([
            {"result": {"n": 3}},
            {"result": {"n": 2}},
            {"result": {"n": 1}},
        ])
    );

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_path_returns_json_404() {
    let server = start().await;

    let response = reqwest::get(server.url("/v1/nothing-here")).await.unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["grpc_code"], 5);
    assert_eq!(body["error"]["http_code"], 404);

    server.stop().await;
}

#[tokio::test]
async fn test_metrics_routes() {
    let server = start().await;

    // Generate one handled RPC so the counters have a sample.
    let response = reqwest::get(server.url("/v1/hello?name=metrics")).await.unwrap();
    assert_eq!(response.status(), 200);

    let list: Value = reqwest::get(server.url("/metrics/list"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list.get("drudge_server_started_total").is_some());
    assert!(list.get("drudge_server_handled_total").is_some());

    let text = reqwest::get(server.url("/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("drudge_server_handled_total"));

    server.stop().await;
}

// ---------------------------------------------------------------------------
// gRPC on the HTTP port
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_grpc_on_http_port() {
    let server = start().await;

    let channel = tonic::transport::Channel::from_shared(format!("http://{}", server.http_addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut grpc = tonic::client::Grpc::new(channel);

    grpc.ready().await.unwrap();
    let reply = grpc
        .unary(
            tonic::Request::new(json!({"name": "rpc"})),
            http::uri::PathAndQuery::from_static("/drudge.test.Greeter/Hello"),
            JsonCodec,
        )
        .await
        .unwrap();
    assert_eq!(reply.metadata().get("x-greeted").unwrap(), "rpc");
    assert_eq!(reply.into_inner(), json!({"message": "Hello, rpc!"}));

    grpc.ready().await.unwrap();
    let mut ticks = grpc
        .server_streaming(
            tonic::Request::new(json!({"from": 2})),
            http::uri::PathAndQuery::from_static("/drudge.test.Greeter/Countdown"),
            JsonCodec,
        )
        .await
        .unwrap()
        .into_inner();
    let mut seen = Vec::new();
    while let Some(tick) = ticks.message().await.unwrap() {
        seen.push(tick);
    }
    assert_eq!(seen, vec![json!({"n": 2}), json!({"n": 1})]);

    grpc.ready().await.unwrap();
    let err = grpc
        .unary(
            tonic::Request::new(json!({})),
            http::uri::PathAndQuery::from_static("/drudge.test.Greeter/Missing"),
            JsonCodec,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Unimplemented);

    server.stop().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_startup_and_shutdown_order() {
    let server = start().await;
    let observer = server.stop().await;

    let at = |component: Component, state: LifecycleState| {
        observer
            .position(component, state)
            .unwrap_or_else(|| panic!("missing {component} {state}"))
    };

    // Startup: RPC, loopback, HTTP.
    assert!(at(Component::RpcListener, LifecycleState::Serving) < at(Component::Loopback, LifecycleState::Starting));
    assert!(at(Component::Loopback, LifecycleState::Serving) < at(Component::HttpListener, LifecycleState::Starting));

    // Shutdown: HTTP, loopback, RPC.
    assert!(at(Component::HttpListener, LifecycleState::Stopped) < at(Component::Loopback, LifecycleState::ShuttingDown));
    assert!(at(Component::Loopback, LifecycleState::Stopped) < at(Component::RpcListener, LifecycleState::ShuttingDown));
    assert!(at(Component::RpcListener, LifecycleState::Stopped) > at(Component::HttpListener, LifecycleState::Stopped));

    let rpc_detail = observer
        .detail(Component::RpcListener, LifecycleState::Serving)
        .unwrap();
    assert!(rpc_detail.starts_with("tcp://127.0.0.1:"));
    assert!(!rpc_detail.ends_with(":0"));
}

#[tokio::test]
async fn test_listen_failure_stops_startup() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken_addr = taken.local_addr().unwrap().to_string();

    let observer = Arc::new(RecordingObserver::new());
    let mut options = Options::new(greeter())
        .with_observer(observer.clone() as Arc<dyn LifecycleObserver>);
    options.addr = taken_addr.clone();
    options.rpc = Endpoint::tcp("127.0.0.1:0");

    let err = run(options, CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains(&taken_addr), "{err}");

    // The RPC listener had started, so it is torn down again.
    assert!(observer
        .position(Component::RpcListener, LifecycleState::Stopped)
        .is_some());
    assert!(observer
        .position(Component::HttpListener, LifecycleState::Serving)
        .is_none());
    drop(taken);
}

#[tokio::test]
async fn test_missing_service_is_config_error() {
    let err = run(Options::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_config());
}

// ---------------------------------------------------------------------------
// Handler panics
// ---------------------------------------------------------------------------

async fn explode(_ctx: CallContext, _req: Value) -> Result<Value, Status> {
    panic!("unary exploded")
}

fn exploding() -> ServiceDefinition {
    ServiceDefinition::builder("drudge.test.Exploding")
        .unary("Explode", HttpRule::get("/v1/explode"), explode)
        .server_streaming(
            "Fizzle",
            HttpRule::get("/v1/fizzle"),
            |_ctx: CallContext, _req: Value| async move {
                Ok(stream::poll_fn(
                    |_cx: &mut std::task::Context<'_>| -> std::task::Poll<Option<Result<Value, Status>>> {
                        panic!("stream exploded")
                    },
                ))
            },
        )
        .build()
        .unwrap()
}

/// Wait for `run` to return on its own, well inside the grace period.
async fn fatal_exit(running: Running) -> (DrudgeError, Arc<RecordingObserver>) {
    let result = tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("run kept serving after a handler panic")
        .expect("run task panicked");
    assert!(!running.cancel.is_cancelled());
    (result.unwrap_err(), running.observer)
}

fn assert_all_stopped(observer: &RecordingObserver) {
    for component in [Component::HttpListener, Component::Loopback, Component::RpcListener] {
        assert!(
            observer.position(component, LifecycleState::Stopped).is_some(),
            "{component} did not stop"
        );
    }
}

#[tokio::test]
async fn test_unary_panic_is_fatal() {
    let running = start_with(exploding(), Duration::from_secs(30)).await;
    let response = reqwest::get(running.url("/v1/explode")).await;
    if let Ok(response) = response {
        assert!(response.status().is_server_error());
    }

    let (err, observer) = fatal_exit(running).await;
    assert!(err.is_fatal(), "unexpected error: {err:?}");
    assert!(err.to_string().contains("unary exploded"), "{err}");
    assert_all_stopped(&observer);
}

#[tokio::test]
async fn test_stream_panic_is_fatal() {
    let running = start_with(exploding(), Duration::from_secs(30)).await;
    let response = reqwest::get(running.url("/v1/fizzle")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    let (err, observer) = fatal_exit(running).await;
    assert!(err.is_fatal(), "unexpected error: {err:?}");
    assert!(err.to_string().contains("stream exploded"), "{err}");
    assert_all_stopped(&observer);
}
