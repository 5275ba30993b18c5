// crates/drudge-rpc/src/transport.rs
//
// Listeners, connection streams and the shared accept loop used by both the
// RPC listener and the HTTP listener.
//
// Each accepted connection runs on its own task (tracked by a `TaskTracker`)
// through hyper-util's auto HTTP/1 + HTTP/2 connection. On shutdown every
// connection is asked to close gracefully; connections still open when the
// grace period elapses are dropped. A panic inside a request future or while
// writing a response body is caught, recorded in the run's `FatalSlot` and
// ends the serve loop with `DrudgeError::Fatal`.

use std::convert::Infallible;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use drudge_core::{DrudgeError, Endpoint, TransportKind};
use futures::FutureExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

/// Remote address of the connection a request arrived on. Inserted into the
/// request extensions by the accept loop.
#[derive(Debug, Clone)]
pub(crate) struct PeerAddr(pub String);

// ---- listeners ----

/// A bound TCP or Unix socket listener.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind `endpoint`. A stale Unix socket file at the same path is replaced.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, DrudgeError> {
        let address = endpoint.listen_address();
        match endpoint.transport() {
            TransportKind::Tcp => match TcpListener::bind(&address).await {
                Ok(listener) => Ok(Listener::Tcp(listener)),
                Err(source) => Err(DrudgeError::Listen { address, source }),
            },
            TransportKind::Unix => {
                let path = PathBuf::from(&address);
                remove_stale_socket(&path);
                match UnixListener::bind(&path) {
                    Ok(listener) => Ok(Listener::Unix { listener, path }),
                    Err(source) => Err(DrudgeError::Listen { address, source }),
                }
            }
        }
    }

    /// The endpoint actually bound, with the kernel-assigned port for `:0`.
    pub fn local_endpoint(&self) -> Result<Endpoint, DrudgeError> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::tcp(listener.local_addr()?.to_string())),
            Listener::Unix { path, .. } => Ok(Endpoint::unix(path.display().to_string())),
        }
    }

    async fn accept(&self) -> io::Result<(PlainStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((PlainStream::Tcp(stream), addr.to_string()))
            }
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((PlainStream::Unix(stream), format!("unix:{}", path.display())))
            }
        }
    }

    fn cleanup(&self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file");
                }
            }
        }
    }
}

fn remove_stale_socket(path: &std::path::Path) {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            tracing::debug!(path = %path.display(), "Removing stale socket file");
            let _ = std::fs::remove_file(path);
        }
    }
}

// ---- streams ----

/// An unencrypted TCP or Unix connection.
#[derive(Debug)]
pub enum PlainStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl PlainStream {
    pub async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint.transport() {
            TransportKind::Tcp => {
                let stream = TcpStream::connect(endpoint.dial_address()).await?;
                let _ = stream.set_nodelay(true);
                Ok(PlainStream::Tcp(stream))
            }
            TransportKind::Unix => Ok(PlainStream::Unix(
                UnixStream::connect(endpoint.dial_address()).await?,
            )),
        }
    }
}

/// A connection as seen by hyper: plain, or wrapped in TLS on either side.
pub enum Connection {
    Plain(PlainStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<PlainStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<PlainStream>>),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Plain(stream) => f.debug_tuple("Plain").field(stream).finish(),
            Connection::ServerTls(_) => f.write_str("ServerTls"),
            Connection::ClientTls(_) => f.write_str("ClientTls"),
        }
    }
}

impl Connection {
    /// Open a client connection to `endpoint`, running a TLS handshake when a
    /// connector is given. `server_name` is the name verified against the
    /// server certificate.
    pub async fn connect(
        endpoint: &Endpoint,
        tls: Option<(&TlsConnector, &str)>,
    ) -> io::Result<Self> {
        let stream = PlainStream::connect(endpoint).await?;
        let Some((connector, server_name)) = tls else {
            return Ok(Connection::Plain(stream));
        };
        let name = tokio_rustls::rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let stream = connector.connect(name, stream).await?;
        Ok(Connection::ClientTls(Box::new(stream)))
    }
}

macro_rules! dispatch_io {
    ($self:ident, $stream:ident => $call:expr) => {
        match $self.get_mut() {
            Connection::Plain(PlainStream::Tcp($stream)) => $call,
            Connection::Plain(PlainStream::Unix($stream)) => $call,
            Connection::ServerTls($stream) => $call,
            Connection::ClientTls($stream) => $call,
        }
    };
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch_io!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        dispatch_io!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch_io!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch_io!(self, s => Pin::new(s).poll_shutdown(cx))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        dispatch_io!(self, s => Pin::new(s).poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Connection::Plain(PlainStream::Tcp(s)) => s.is_write_vectored(),
            Connection::Plain(PlainStream::Unix(s)) => s.is_write_vectored(),
            Connection::ServerTls(s) => s.is_write_vectored(),
            Connection::ClientTls(s) => s.is_write_vectored(),
        }
    }
}

impl AsyncRead for PlainStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PlainStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            PlainStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PlainStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PlainStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            PlainStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PlainStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            PlainStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PlainStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            PlainStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

// ---- serving ----

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// First panic seen by any request handler or response body of a run.
///
/// One slot is shared by both listeners so a panic anywhere stops both
/// accept loops and the runtime can begin its ordered shutdown.
#[derive(Clone, Default)]
pub struct FatalSlot {
    message: Arc<Mutex<Option<String>>>,
    raised: CancellationToken,
}

impl FatalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `message` (the first one wins) and fire the raised token.
    pub fn raise(&self, message: String) {
        let mut slot = self.message.lock();
        if slot.is_none() {
            *slot = Some(message);
        }
        self.raised.cancel();
    }

    /// Cancelled once a panic has been recorded.
    pub fn raised(&self) -> &CancellationToken {
        &self.raised
    }

    pub fn message(&self) -> Option<String> {
        self.message.lock().clone()
    }
}

impl std::fmt::Debug for FatalSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FatalSlot")
            .field("message", &self.message())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Response body that catches a panic while producing frames. The panic is
/// recorded in the fatal slot and the body ends with an error frame, which
/// resets the HTTP/2 stream or closes the HTTP/1 connection.
struct PanicGuardBody<B> {
    inner: Pin<Box<B>>,
    listener: &'static str,
    fatal: FatalSlot,
    panicked: bool,
}

impl<B> PanicGuardBody<B> {
    fn new(inner: B, listener: &'static str, fatal: FatalSlot) -> Self {
        Self {
            inner: Box::pin(inner),
            listener,
            fatal,
            panicked: false,
        }
    }
}

impl<B> http_body::Body for PanicGuardBody<B>
where
    B: http_body::Body<Data = bytes::Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = bytes::Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<bytes::Bytes>, BoxError>>> {
        if self.panicked {
            return Poll::Ready(None);
        }
        let this = &mut *self;
        let polled = std::panic::catch_unwind(AssertUnwindSafe(|| this.inner.as_mut().poll_frame(cx)));
        match polled {
            Ok(poll) => poll.map_err(Into::into),
            Err(payload) => {
                this.panicked = true;
                let message = panic_message(payload.as_ref());
                tracing::error!(listener = this.listener, panic = %message, "Response body panicked");
                this.fatal.raise(message);
                Poll::Ready(Some(Err("response body panicked".into())))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.panicked || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

/// Serve `service` on `listener` until `shutdown` fires or `fatal` is
/// raised, then drain connections for at most `grace`.
///
/// A panic in a request future or a response body is recorded in `fatal`
/// and the call returns `DrudgeError::Fatal`. `name` labels log events
/// (`rpc`, `http`).
pub async fn serve<S, B>(
    name: &'static str,
    listener: Listener,
    service: S,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    fatal: FatalSlot,
    grace: Duration,
) -> Result<(), DrudgeError>
where
    S: tower_service::Service<http::Request<Incoming>, Response = http::Response<B>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let tracker = TaskTracker::new();
    let drain = shutdown.child_token();
    let force_close = CancellationToken::new();

    tracing::info!(listener = name, endpoint = ?listener.local_endpoint().ok(), "Listener serving");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = fatal.raised().cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(listener = name, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let service = service.clone();
        let tls = tls.clone();
        let drain = drain.clone();
        let force_close = force_close.clone();
        let fatal = fatal.clone();
        tracker.spawn(async move {
            let io = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => Connection::ServerTls(Box::new(stream)),
                    Err(e) => {
                        tracing::debug!(listener = name, peer = %peer, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => Connection::Plain(stream),
            };
            serve_connection(name, io, peer, service, drain, force_close, fatal).await;
        });
    }

    // Open connections drain on a fatal panic as well as on shutdown.
    drain.cancel();
    tracker.close();
    listener.cleanup();
    // Stop accepting before draining so no new connection races the drain.
    drop(listener);

    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        tracing::warn!(
            listener = name,
            open = tracker.len(),
            grace_ms = grace.as_millis() as u64,
            "Grace period elapsed, closing remaining connections"
        );
        force_close.cancel();
        tracker.wait().await;
    }

    match fatal.message() {
        Some(message) => Err(DrudgeError::Fatal(format!("{name} listener: {message}"))),
        None => {
            tracing::info!(listener = name, "Listener stopped");
            Ok(())
        }
    }
}

async fn serve_connection<S, B>(
    name: &'static str,
    io: Connection,
    peer: String,
    service: S,
    drain: CancellationToken,
    force_close: CancellationToken,
    fatal: FatalSlot,
) where
    S: tower_service::Service<http::Request<Incoming>, Response = http::Response<B>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let peer_addr = PeerAddr(peer.clone());
    let hyper_service = hyper::service::service_fn(move |mut req: http::Request<Incoming>| {
        req.extensions_mut().insert(peer_addr.clone());
        let call = service.clone().oneshot(req);
        let fatal = fatal.clone();
        async move {
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(response)) => Ok::<_, Infallible>(
                    response.map(|body| Body::new(PanicGuardBody::new(body, name, fatal))),
                ),
                Ok(Err(never)) => match never {},
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(listener = name, panic = %message, "Request handler panicked");
                    fatal.raise(message);
                    let mut response = http::Response::new(Body::empty());
                    *response.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                }
            }
        }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), hyper_service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = drain.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                result = conn.as_mut() => result,
                _ = force_close.cancelled() => {
                    tracing::debug!(listener = name, peer = %peer, "Connection force-closed");
                    return;
                }
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!(listener = name, peer = %peer, error = %e, "Connection ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_listener_reports_bound_port() {
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1:0")).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        assert_eq!(endpoint.transport(), TransportKind::Tcp);
        assert!(!endpoint.address().ends_with(":0"));
    }

    #[tokio::test]
    async fn test_listen_failure_names_address() {
        let first = Listener::bind(&Endpoint::tcp("127.0.0.1:0")).await.unwrap();
        let taken = first.local_endpoint().unwrap();
        let err = Listener::bind(&taken).await.unwrap_err();
        match err {
            DrudgeError::Listen { address, .. } => assert_eq!(address, taken.address()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unix_socket_removed_after_serve() {
        let path = std::env::temp_dir().join(format!("drudge-{}.sock", uuid::Uuid::now_v7()));
        let endpoint = Endpoint::unix(path.display().to_string());
        let listener = Listener::bind(&endpoint).await.unwrap();
        assert!(path.exists());

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let service = tower::service_fn(|_req: http::Request<Incoming>| async {
            Ok::<_, Infallible>(http::Response::new(Body::empty()))
        });
        serve(
            "test",
            listener,
            service,
            None,
            shutdown,
            FatalSlot::new(),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
