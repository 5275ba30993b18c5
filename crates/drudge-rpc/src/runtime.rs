// crates/drudge-rpc/src/runtime.rs
//
// `run`: start the RPC listener, the loopback client and the HTTP listener
// as one unit, then tear them down in dependency order.
//
// Startup order:  RPC listener -> loopback client -> HTTP listener
// Shutdown order: HTTP listener -> loopback client -> RPC listener
//
// Shutdown starts when the caller's token is cancelled, when a handler
// panics (the shared `FatalSlot` is raised) or when either serving task ends
// on its own (which is always an error).

use std::sync::Arc;
use std::time::Duration;

use drudge_core::{DrudgeError, Endpoint};
use hyper::body::Incoming;
use tokio::task::{JoinError, JoinHandle};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::Options;
use crate::dial::LoopbackClient;
use crate::interceptor::InterceptorChain;
use crate::lifecycle::{Component, ComponentLifecycle, LifecycleState};
use crate::middleware::default_tail;
use crate::router::{rest_service, ProtocolRouter, RestConfig};
use crate::server::RpcService;
use crate::stream::StreamForwarder;
use crate::transport::{panic_message, serve, FatalSlot, Listener};

/// A listener's serve loop running on its own task.
struct ServingTask {
    name: &'static str,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), DrudgeError>>,
}

impl ServingTask {
    fn spawn<S, B>(
        name: &'static str,
        listener: Listener,
        service: S,
        tls: Option<TlsAcceptor>,
        fatal: FatalSlot,
        grace: Duration,
    ) -> Self
    where
        S: tower_service::Service<
                http::Request<Incoming>,
                Response = http::Response<B>,
                Error = std::convert::Infallible,
            > + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
        B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(
            name,
            listener,
            service,
            tls,
            shutdown.clone(),
            fatal,
            grace,
        ));
        Self {
            name,
            shutdown,
            handle,
        }
    }

    async fn stop(self) -> Result<(), DrudgeError> {
        self.shutdown.cancel();
        joined(self.name, self.handle.await)
    }
}

/// Turn a task's join result into the serve loop's result. A panic that
/// escaped the serve loop is fatal.
fn joined(name: &str, result: Result<Result<(), DrudgeError>, JoinError>) -> Result<(), DrudgeError> {
    match result {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic().as_ref());
            tracing::error!(listener = name, panic = %message, "Serving task panicked");
            Err(DrudgeError::Fatal(format!("{name} serving task panicked: {message}")))
        }
        Err(e) => Err(DrudgeError::Fatal(format!("{name} serving task aborted: {e}"))),
    }
}

fn advance(lifecycle: &mut ComponentLifecycle, state: LifecycleState, detail: Option<&str>) {
    if let Err(e) = lifecycle.transition(state, detail) {
        tracing::warn!(error = %e, "Lifecycle transition rejected");
    }
}

/// Move `lifecycle` through ShuttingDown to Stopped around stopping `task`
/// (absent when the task already ended).
async fn shut_down(
    lifecycle: &mut ComponentLifecycle,
    task: Option<ServingTask>,
) -> Result<(), DrudgeError> {
    advance(lifecycle, LifecycleState::ShuttingDown, None);
    let result = match task {
        Some(task) => task.stop().await,
        None => Ok(()),
    };
    let detail = result.as_ref().err().map(ToString::to_string);
    advance(lifecycle, LifecycleState::Stopped, detail.as_deref());
    result
}

/// Stop `task` during a failed startup. The startup error is what the caller
/// sees, so a shutdown failure is only logged.
async fn abandon(lifecycle: &mut ComponentLifecycle, task: ServingTask) {
    if let Err(e) = shut_down(lifecycle, Some(task)).await {
        tracing::error!(error = %e, "Listener shutdown failed");
    }
}

/// Serve the configured service over RPC and REST until `cancel` fires.
///
/// Returns an error if startup fails (configuration, listen, dial) or if a
/// serving task fails; `DrudgeError::Fatal` means the process should exit.
pub async fn run(options: Options, cancel: CancellationToken) -> Result<(), DrudgeError> {
    options.validate()?;
    let Options {
        base_path,
        addr,
        rpc,
        credentials,
        service,
        unary_interceptors,
        stream_interceptors,
        docs_dir,
        service_name,
        stream_mode,
        shutdown_grace,
        response_hooks,
        observer,
        registry,
    } = options;
    let service = Arc::new(service.ok_or_else(|| {
        DrudgeError::Config("no service registered; a service definition is required".to_string())
    })?);

    let chain = InterceptorChain::builder()
        .unary_all(unary_interceptors)
        .stream_all(stream_interceptors)
        .build_with(default_tail(&service_name, &registry)?);
    tracing::debug!(chain = ?chain, "Interceptor chain built");
    let fatal = FatalSlot::new();
    let rpc_service = RpcService::new(Arc::clone(&service), chain).with_fatal_slot(fatal.clone());
    let forwarder = StreamForwarder::new(stream_mode, response_hooks);
    let rest_config = RestConfig {
        base_path,
        registry,
        docs_dir,
        service_name,
    };

    let mut rpc_state = ComponentLifecycle::new(Component::RpcListener, observer.clone());
    let mut loopback_state = ComponentLifecycle::new(Component::Loopback, observer.clone());
    let mut http_state = ComponentLifecycle::new(Component::HttpListener, observer);

    // ---- RPC listener ----
    let rpc_display = rpc.to_string();
    advance(&mut rpc_state, LifecycleState::Starting, Some(&rpc_display));
    let (rpc_listener, rpc_bound) = match bind(&rpc).await {
        Ok(bound) => bound,
        Err(e) => {
            rpc_state.stop(Some(&e.to_string()));
            return Err(e);
        }
    };
    let rpc_tls = credentials.rpc_server.clone().map(TlsAcceptor::from);
    let rpc_task = ServingTask::spawn(
        "rpc",
        rpc_listener,
        rpc_service.clone(),
        rpc_tls,
        fatal.clone(),
        shutdown_grace,
    );
    let rpc_bound_display = rpc_bound.to_string();
    tracing::info!(endpoint = %rpc_bound_display, service = %service.name(), "Serving RPC");
    advance(&mut rpc_state, LifecycleState::Serving, Some(&rpc_bound_display));

    // ---- loopback client ----
    advance(&mut loopback_state, LifecycleState::Starting, Some(&rpc_bound_display));
    let client = match LoopbackClient::dial(&rpc_bound, credentials.loopback_client.clone()).await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "Failed to dial RPC service");
            loopback_state.stop(Some(&e.to_string()));
            abandon(&mut rpc_state, rpc_task).await;
            return Err(e);
        }
    };
    advance(&mut loopback_state, LifecycleState::Serving, Some(&rpc_bound_display));

    // ---- HTTP listener ----
    let http_endpoint = Endpoint::tcp(addr);
    let http_display = http_endpoint.to_string();
    advance(&mut http_state, LifecycleState::Starting, Some(&http_display));
    let started = match rest_service(&rest_config, &service, &client, &forwarder) {
        Ok(rest) => bind(&http_endpoint).await.map(|bound| (rest, bound)),
        Err(e) => Err(e),
    };
    let (rest, (http_listener, http_bound)) = match started {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start HTTP listener");
            http_state.stop(Some(&e.to_string()));
            advance(&mut loopback_state, LifecycleState::ShuttingDown, None);
            drop(client);
            advance(&mut loopback_state, LifecycleState::Stopped, None);
            abandon(&mut rpc_state, rpc_task).await;
            return Err(e);
        }
    };
    let router = ProtocolRouter::new(rpc_service, rest);
    let http_tls = credentials.http_server.clone().map(TlsAcceptor::from);
    let http_task = ServingTask::spawn(
        "http",
        http_listener,
        router,
        http_tls,
        fatal.clone(),
        shutdown_grace,
    );
    let http_bound_display = http_bound.to_string();
    tracing::info!(endpoint = %http_bound_display, "Serving HTTP");
    advance(&mut http_state, LifecycleState::Serving, Some(&http_bound_display));

    // ---- wait ----
    let mut rpc_task = rpc_task;
    let mut http_task = http_task;
    let early = tokio::select! {
        _ = cancel.cancelled() => Wake::Cancelled,
        _ = fatal.raised().cancelled() => Wake::Panicked,
        result = &mut rpc_task.handle => Wake::Ended(Component::RpcListener, joined("rpc", result)),
        result = &mut http_task.handle => Wake::Ended(Component::HttpListener, joined("http", result)),
    };

    let mut rpc_task = Some(rpc_task);
    let mut http_task = Some(http_task);
    let mut failure = None;
    match early {
        Wake::Cancelled => tracing::info!("Shutdown requested"),
        Wake::Panicked => {
            let message = fatal.message().unwrap_or_default();
            tracing::error!(panic = %message, "Handler panicked, shutting down");
            failure = Some(DrudgeError::Fatal(format!("handler panicked: {message}")));
        }
        Wake::Ended(component, result) => {
            let error = match result {
                Err(e) => e,
                Ok(()) => DrudgeError::Fatal(format!("{component} stopped unexpectedly")),
            };
            tracing::error!(component = %component, error = %error, "Serving task ended, shutting down");
            match component {
                Component::RpcListener => rpc_task = None,
                Component::HttpListener => http_task = None,
                Component::Loopback => {}
            }
            failure = Some(error);
        }
    }

    // ---- shutdown: HTTP, loopback, RPC ----
    let http_result = shut_down(&mut http_state, http_task).await;

    advance(&mut loopback_state, LifecycleState::ShuttingDown, None);
    drop(client);
    tracing::info!("Loopback client closed");
    advance(&mut loopback_state, LifecycleState::Stopped, None);

    let rpc_result = shut_down(&mut rpc_state, rpc_task).await;

    for result in [http_result, rpc_result] {
        if let Err(e) = result {
            tracing::error!(error = %e, "Listener shutdown failed");
            failure.get_or_insert(e);
        }
    }
    match failure {
        Some(e) => Err(e),
        None => {
            tracing::info!("Server stopped");
            Ok(())
        }
    }
}

/// Why `run` left its wait.
enum Wake {
    Cancelled,
    Panicked,
    Ended(Component, Result<(), DrudgeError>),
}

async fn bind(endpoint: &Endpoint) -> Result<(Listener, Endpoint), DrudgeError> {
    let listener = Listener::bind(endpoint).await?;
    let bound = listener.local_endpoint()?;
    Ok((listener, bound))
}
