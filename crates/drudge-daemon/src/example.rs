// crates/drudge-daemon/src/example.rs
//
// The service the daemon hosts: `drudge.example.Example` with a unary Hello
// and a server-streaming Countdown, both bound to REST routes.

use std::time::Duration;

use drudge_core::{CallContext, DrudgeError, HttpRule, Validate};
use drudge_rpc::ServiceDefinition;
use drudge_telemetry::{record, Instrument, MetricDescriptor, MetricRegistry};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

pub const SERVICE_NAME: &str = "drudge.example.Example";

const MAX_COUNTDOWN: u32 = 100;
const MAX_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Deserialize)]
pub struct HelloRequest {
    #[serde(default)]
    pub name: String,
}

impl Validate for HelloRequest {
    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct HelloReply {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CountdownRequest {
    pub from: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

impl Validate for CountdownRequest {
    fn validate(&self) -> Result<(), String> {
        if self.from == 0 || self.from > MAX_COUNTDOWN {
            return Err(format!("from must be within 1..={MAX_COUNTDOWN}"));
        }
        if self.interval_ms > MAX_INTERVAL_MS {
            return Err(format!("interval_ms must be at most {MAX_INTERVAL_MS}"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct Tick {
    pub remaining: u32,
}

/// Build the example service, registering its greeting counter in `registry`.
pub fn example_service(registry: &MetricRegistry) -> Result<ServiceDefinition, DrudgeError> {
    let greetings = registry.register_counter(
        MetricDescriptor::new("drudge_example_greetings_total", "Greetings sent by Hello")
            .unit("1"),
    )?;

    ServiceDefinition::builder(SERVICE_NAME)
        .unary(
            "Hello",
            HttpRule::get("/v1/hello/{name}"),
            move |ctx: CallContext, req: HelloRequest| {
                let greetings = greetings.clone();
                async move { hello(ctx, req, &greetings) }
            },
        )
        .server_streaming(
            "Countdown",
            HttpRule::get("/v1/countdown/{from}"),
            |ctx: CallContext, req: CountdownRequest| async move { Ok(countdown(ctx, req)) },
        )
        .log_fields("Hello", &["name"])
        .log_fields("Countdown", &["from"])
        .build()
}

fn hello(ctx: CallContext, req: HelloRequest, greetings: &Instrument) -> Result<HelloReply, Status> {
    record(Some(greetings), 1.0, &[]);
    if let Some(peer) = ctx.peer() {
        ctx.set_tag("peer", peer);
    }
    ctx.set_response_metadata("x-drudge-greeted", req.name.trim())?;
    Ok(HelloReply {
        message: format!("Hello, {}!", req.name.trim()),
    })
}

/// Emit `from`, `from - 1`, ..., `1`, one per interval. Stops early when the
/// call is cancelled or the receiver goes away.
fn countdown(ctx: CallContext, req: CountdownRequest) -> ReceiverStream<Result<Tick, Status>> {
    let (tx, rx) = mpsc::channel(1);
    let cancelled = ctx.cancellation().clone();
    let interval = Duration::from_millis(req.interval_ms);

    tokio::spawn(async move {
        for remaining in (1..=req.from).rev() {
            if tx.send(Ok(Tick { remaining })).await.is_err() {
                return;
            }
            if remaining == 1 {
                break;
            }
            tokio::select! {
                _ = cancelled.cancelled() => {
                    let _ = tx.send(Err(Status::cancelled("countdown cancelled"))).await;
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });

    ReceiverStream::new(rx)
}
