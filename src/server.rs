//! HTTP ingress and request pipeline
//!
//! Accepts client connections (plain or TLS), serves each over HTTP/1,
//! and runs the per-request pipeline: admission check, sticky-session
//! resolution, policy selection, upstream forward through the pooled
//! client, outcome capture, and policy/metrics feedback. The control
//! endpoints (`/reload`, `/stats`, `/healthz`) hang off the same
//! listener; everything else is proxied.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Sleep;
use tokio_rustls::TlsAcceptor;
use url::Url;

use crate::backend_pool::{Backend, ConnectionGuard};
use crate::constants::{
    HEADER_READ_TIMEOUT_SECS, INGRESS_IDLE_TIMEOUT_SECS, INGRESS_WRITE_TIMEOUT_SECS,
    SESSION_COOKIE,
};
use crate::policy::{CompletionError, Policy};
use crate::reload;
use crate::state::AppContext;

/// Response body type used on every path out of the pipeline.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Connection-scoped headers that must not be forwarded upstream.
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn full_body(text: &str) -> ProxyBody {
    Full::new(Bytes::copy_from_slice(text.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

pub fn text_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(text));
    *response.status_mut() = status;
    response
}

/// Bind the ingress listener. Kept separate from the accept loop so a
/// bind failure is fatal at startup rather than a logged background
/// error.
pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind to port {}", port))
}

/// Accept loop. Stops accepting on shutdown; in-flight connections are
/// left to finish under the supervisor's drain window.
pub async fn serve(
    ctx: Arc<AppContext>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    info!(
        "Proxy server started on {} ({})",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        if tls.is_some() { "https" } else { "http" }
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, remote)) => {
                        let ctx = Arc::clone(&ctx);
                        let tls = tls.clone();
                        tokio::spawn(async move {
                            match tls {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(stream) => serve_connection(ctx, remote, stream).await,
                                    Err(e) => debug!("TLS handshake failed from {}: {}", remote, e),
                                },
                                None => serve_connection(ctx, remote, stream).await,
                            }
                        });
                    }
                    Err(e) => error!("Client connection accept failed: {}", e),
                }
            }
            _ = shutdown.recv() => {
                info!("Proxy server received shutdown signal. Stopping new connection acceptance.");
                break;
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

/// Client-side IO with the server's timeout discipline applied.
///
/// hyper's builder only covers header reads, so the write and idle
/// limits live here: each write toward the client must make progress
/// within the write timeout, and a connection with no traffic in either
/// direction for the idle timeout is torn down.
struct TimeoutIo<I> {
    io: I,
    write_timeout: Duration,
    idle_timeout: Duration,
    // Armed while a single write is pending; cleared on progress.
    write_deadline: Option<Pin<Box<Sleep>>>,
    // Pushed forward on every successful read or write.
    idle_deadline: Pin<Box<Sleep>>,
}

impl<I> TimeoutIo<I> {
    fn new(io: I, write_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            io,
            write_timeout,
            idle_timeout,
            write_deadline: None,
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
        }
    }

    fn touch(&mut self) {
        let deadline = tokio::time::Instant::now() + self.idle_timeout;
        self.idle_deadline.as_mut().reset(deadline);
    }
}

fn timed_out(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, what.to_string())
}

impl<I: AsyncRead + Unpin> AsyncRead for TimeoutIo<I> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        if this.idle_deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(timed_out("connection idle timeout")));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.touch();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for TimeoutIo<I> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        if this.write_deadline.is_none() {
            this.write_deadline = Some(Box::pin(tokio::time::sleep(this.write_timeout)));
        }
        if let Some(deadline) = this.write_deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(timed_out("client write timeout")));
            }
        }

        match Pin::new(&mut this.io).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                if result.is_ok() {
                    this.touch();
                }
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

async fn serve_connection<I>(ctx: Arc<AppContext>, remote: SocketAddr, io: I)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(TimeoutIo::new(
        io,
        Duration::from_secs(INGRESS_WRITE_TIMEOUT_SECS),
        Duration::from_secs(INGRESS_IDLE_TIMEOUT_SECS),
    ));
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        async move {
            ctx.begin_request();
            let response = handle(Arc::clone(&ctx), remote, req).await;
            ctx.end_request();
            Ok::<_, Infallible>(response)
        }
    });

    if let Err(e) = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(Duration::from_secs(HEADER_READ_TIMEOUT_SECS))
        .serve_connection(io, service)
        .await
    {
        debug!("Connection from {} ended with error: {}", remote, e);
    }
}

/// Route control endpoints; proxy everything else.
pub async fn handle(
    ctx: Arc<AppContext>,
    remote: SocketAddr,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    if req.method() == Method::GET {
        match req.uri().path() {
            "/healthz" => return text_response(StatusCode::OK, "ok"),
            "/stats" => return stats_response(&ctx),
            "/reload" => return reload::handle(&ctx).await,
            _ => {}
        }
    }
    proxy_request(ctx, remote, req).await
}

fn stats_response(ctx: &AppContext) -> Response<ProxyBody> {
    match serde_json::to_string(&ctx.metrics().snapshot()) {
        Ok(json) => {
            let mut response = Response::new(full_body(&json));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            error!("Failed to encode stats: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

/// The per-request pipeline.
async fn proxy_request(
    ctx: Arc<AppContext>,
    remote: SocketAddr,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    if let Some(limiter) = ctx.rate_limiter() {
        if !limiter.allow() {
            return text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
        }
    }

    let policy = ctx.policy();

    // Sticky session: honor the cookie while its referent is routable,
    // otherwise mark it for clearing and fall through to selection.
    let mut stale_cookie = false;
    let mut chosen: Option<Arc<Backend>> = None;
    if let Some(session) = session_cookie(req.headers()) {
        if let Some(backend) = policy.backends().into_iter().find(|b| b.key() == session) {
            if backend.is_routable() {
                chosen = Some(backend);
            } else {
                stale_cookie = true;
            }
        }
    }

    let backend = match chosen.or_else(|| policy.next_backend(remote)) {
        Some(backend) => backend,
        None => {
            warn!("No routable backend for {} {}", req.method(), req.uri().path());
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
        }
    };

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let outbound = match build_upstream_request(req, &backend) {
        Ok(outbound) => outbound,
        Err(e) => {
            error!("Failed to build upstream request for {}: {}", backend.key(), e);
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    // Counter covers exactly the forward call, released on every path.
    let _guard = ConnectionGuard::new(Arc::clone(&backend));
    let start = Instant::now();
    let result = ctx.upstream().request(outbound).await;
    let duration = start.elapsed();

    let mut response = match result {
        Ok(response) => {
            let status = response.status().as_u16();
            if status >= 500 {
                backend.breaker().record_failure();
                backend.set_alive(false);
            } else {
                backend.breaker().record_success();
            }

            let error = (status >= 500).then_some(CompletionError::UpstreamStatus(status));
            policy.on_request_completion(backend.key(), duration, error);
            ctx.metrics().record(status, duration);

            info!(
                "{} {} {} -> {} [{}] {:?}",
                remote,
                method,
                path,
                backend.key(),
                status,
                duration
            );
            response.map(|body| body.boxed())
        }
        Err(e) => {
            backend.breaker().record_failure();
            backend.set_alive(false);
            policy.on_request_completion(backend.key(), duration, Some(CompletionError::Transport));
            ctx.metrics().record(502, duration);

            warn!(
                "{} {} {} -> {} transport error after {:?}: {}",
                remote,
                method,
                path,
                backend.key(),
                duration,
                e
            );
            text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    };

    append_session_cookies(response.headers_mut(), backend.key(), stale_cookie);
    response
}

/// Rewrite the inbound request to target the chosen backend, dropping
/// connection-scoped headers on the way through.
fn build_upstream_request(
    req: Request<Incoming>,
    backend: &Backend,
) -> Result<Request<Incoming>> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = join_upstream_uri(backend.url(), path_and_query)?;

    strip_hop_by_hop(&mut parts.headers);

    Ok(Request::from_parts(parts, body))
}

/// Join the backend's base URL (which may carry a path prefix) with the
/// request's path and query.
fn join_upstream_uri(base: &Url, path_and_query: &str) -> Result<Uri> {
    let host = base
        .host_str()
        .with_context(|| format!("backend URL {} has no host", base))?;
    let authority = match base.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let prefix = base.path().trim_end_matches('/');

    format!("{}://{}{}{}", base.scheme(), authority, prefix, path_and_query)
        .parse::<Uri>()
        .context("assembled upstream URI is invalid")
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Extract the session cookie value from the request headers.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == SESSION_COOKIE {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Pin the client to the chosen backend. A stale cookie (referent no
/// longer routable) is cleared before the fresh one is set.
fn append_session_cookies(headers: &mut HeaderMap, backend_key: &str, clear_stale: bool) {
    if clear_stale {
        if let Ok(value) = HeaderValue::from_str(&format!("{}=; Max-Age=-1; Path=/", SESSION_COOKIE)) {
            headers.append(SET_COOKIE, value);
        }
    }
    match HeaderValue::from_str(&format!("{}={}; Path=/", SESSION_COOKIE, backend_key)) {
        Ok(value) => {
            headers.append(SET_COOKIE, value);
        }
        Err(e) => warn!("Session cookie value rejected for {}: {}", backend_key, e),
    }
}
