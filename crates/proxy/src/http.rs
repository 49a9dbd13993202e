//! HTTP egress proxy.
//!
//! Guest outbound traffic is pointed here via its proxy configuration.
//! Plain HTTP requests arrive in absolute form and are forwarded upstream;
//! HTTPS arrives as `CONNECT` and is tunneled. Both paths share the same
//! accounting: request count, throttled count, downloaded and uploaded
//! bytes, with the byte counters claimed atomically against the configured
//! caps so concurrent streams cannot overrun them.

use axum::body::Body;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderName;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Final values are only meaningful after [`HttpProxy::stop`].
#[derive(Debug, Default)]
pub struct HttpProxyStats {
    nb_requests: AtomicU64,
    nb_throttled: AtomicU64,
    download: AtomicU64,
    upload: AtomicU64,
}

/// Point-in-time copy of the counters, byte-denominated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpProxySnapshot {
    pub nb_requests: u64,
    pub nb_throttled: u64,
    pub download: u64,
    pub upload: u64,
}

impl HttpProxyStats {
    pub fn snapshot(&self) -> HttpProxySnapshot {
        HttpProxySnapshot {
            nb_requests: self.nb_requests.load(Ordering::SeqCst),
            nb_throttled: self.nb_throttled.load(Ordering::SeqCst),
            download: self.download.load(Ordering::SeqCst),
            upload: self.upload.load(Ordering::SeqCst),
        }
    }

    fn mark_throttled(&self) {
        self.nb_throttled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Claims up to `want` bytes from a capped counter; returns how many were
/// granted. The counter never exceeds `limit`.
fn claim(counter: &AtomicU64, limit: u64, want: u64) -> u64 {
    let mut granted = 0;
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        granted = limit.saturating_sub(current).min(want);
        Some(current + granted)
    });
    granted
}

#[derive(Debug, Clone)]
pub struct HttpProxyPolicy {
    pub request_limit: u64,
    pub download_limit: u64,
    pub upload_limit: u64,
    pub blacklisted_hosts: Vec<String>,
}

struct ProxyState {
    policy: HttpProxyPolicy,
    stats: Arc<HttpProxyStats>,
    client: reqwest::Client,
}

impl ProxyState {
    fn is_blacklisted(&self, host: &str) -> bool {
        self.policy
            .blacklisted_hosts
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(host))
    }

    /// Claims one request slot; `false` means the request budget is spent.
    fn try_take_request(&self) -> bool {
        self.stats
            .nb_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.policy.request_limit).then_some(current + 1)
            })
            .is_ok()
    }
}

/// The egress proxy itself: an accept loop on a reserved loopback port,
/// torn down by the supervisor at the end of the run.
pub struct HttpProxy {
    stats: Arc<HttpProxyStats>,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    port: u16,
}

impl HttpProxy {
    pub async fn start(listener: TcpListener, policy: HttpProxyPolicy) -> anyhow::Result<Self> {
        let port = listener.local_addr()?.port();
        let stats = Arc::new(HttpProxyStats::default());
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let state = Arc::new(ProxyState {
            policy,
            stats: stats.clone(),
            client,
        });
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, _peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::warn!(target: "proxy", error = %e, "accept failed");
                                break;
                            }
                        };
                        let state = state.clone();
                        connections.spawn(async move {
                            let service = service_fn(move |req| handle(state.clone(), req));
                            let conn = http1::Builder::new()
                                .preserve_header_case(true)
                                .title_case_headers(true)
                                .serve_connection(TokioIo::new(stream), service)
                                .with_upgrades();
                            if let Err(e) = conn.await {
                                tracing::trace!(target: "proxy", error = %e, "connection closed");
                            }
                        });
                    }
                }
            }
            // In-flight tunnels die with the run.
            connections.abort_all();
        });

        tracing::debug!(target: "proxy", port, "http egress proxy listening");
        Ok(Self {
            stats,
            shutdown,
            accept_task: Some(accept_task),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shared handle onto the counters; they are final once `stop` returns.
    pub fn stats(&self) -> Arc<HttpProxyStats> {
        self.stats.clone()
    }

    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
}

async fn handle(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
) -> Result<Response<Body>, Infallible> {
    if req.method() == Method::CONNECT {
        Ok(handle_connect(state, req))
    } else {
        Ok(handle_forward(state, req).await)
    }
}

fn handle_connect(state: Arc<ProxyState>, req: Request<Incoming>) -> Response<Body> {
    let Some(authority) = req.uri().authority().cloned() else {
        return status_response(StatusCode::BAD_REQUEST, "CONNECT requires an authority");
    };
    let host = authority.host().to_string();
    if state.is_blacklisted(&host) {
        state.stats.mark_throttled();
        return status_response(StatusCode::FORBIDDEN, "host is blacklisted");
    }
    if !state.try_take_request() {
        state.stats.mark_throttled();
        return status_response(StatusCode::TOO_MANY_REQUESTS, "request limit exceeded");
    }

    let addr = format!("{}:{}", host, authority.port_u16().unwrap_or(443));
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = tunnel(TokioIo::new(upgraded), addr, state).await {
                    tracing::trace!(target: "proxy", error = %e, "tunnel closed");
                }
            }
            Err(e) => tracing::debug!(target: "proxy", error = %e, "CONNECT upgrade failed"),
        }
    });
    status_response(StatusCode::OK, "")
}

/// Bidirectional tunnel with byte accounting on both directions. Whichever
/// side finishes (or trips a cap) tears the tunnel down.
async fn tunnel<S>(client: S, addr: String, state: Arc<ProxyState>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server = TcpStream::connect(&addr).await?;
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut server_r, mut server_w) = tokio::io::split(server);

    let stats = &state.stats;
    let upload = copy_counted(
        &mut client_r,
        &mut server_w,
        &stats.upload,
        state.policy.upload_limit,
        stats,
    );
    let download = copy_counted(
        &mut server_r,
        &mut client_w,
        &stats.download,
        state.policy.download_limit,
        stats,
    );
    tokio::select! {
        res = upload => res.map(|_| ()),
        res = download => res.map(|_| ()),
    }
}

/// Copies until EOF or until the capped counter refuses bytes, in which
/// case the stream is terminated and the request counted as throttled.
async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    limit: u64,
    stats: &HttpProxyStats,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        let granted = claim(counter, limit, n as u64) as usize;
        if granted > 0 {
            writer.write_all(&buf[..granted]).await?;
            total += granted as u64;
        }
        if granted < n {
            stats.mark_throttled();
            return Err(std::io::Error::other("stream byte cap exceeded"));
        }
    }
}

async fn handle_forward(state: Arc<ProxyState>, req: Request<Incoming>) -> Response<Body> {
    let Some(host) = request_host(&req) else {
        return status_response(StatusCode::BAD_REQUEST, "request host could not be determined");
    };
    if state.is_blacklisted(&host) {
        state.stats.mark_throttled();
        return status_response(StatusCode::FORBIDDEN, "host is blacklisted");
    }
    if !state.try_take_request() {
        state.stats.mark_throttled();
        return status_response(StatusCode::TOO_MANY_REQUESTS, "request limit exceeded");
    }

    let method = req.method().clone();
    let url = req.uri().to_string();
    let headers = req.headers().clone();

    // Buffer and meter the request body before forwarding.
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return status_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {e}"),
            )
        }
    };
    let want = body.len() as u64;
    let granted = claim(&state.stats.upload, state.policy.upload_limit, want);
    if granted < want {
        state.stats.mark_throttled();
        return status_response(StatusCode::TOO_MANY_REQUESTS, "upload limit exceeded");
    }

    let mut forward = state.client.request(method, &url);
    for (name, value) in &headers {
        if !is_hop_by_hop(name) && name != &hyper::header::HOST {
            forward = forward.header(name, value);
        }
    }
    let upstream = match forward.body(body).send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(target: "proxy", error = %e, url = %url, "upstream request failed");
            return status_response(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
    };

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) && name != &hyper::header::CONTENT_LENGTH {
            builder = builder.header(name, value);
        }
    }

    // Stream the response through the download cap; exceeding it terminates
    // the body mid-flight.
    let stats = state.stats.clone();
    let download_limit = state.policy.download_limit;
    let counted = upstream.bytes_stream().scan(false, move |capped, chunk| {
        let item = if *capped {
            None
        } else {
            Some(match chunk {
                Ok(bytes) => {
                    let want = bytes.len() as u64;
                    let granted = claim(&stats.download, download_limit, want);
                    if granted < want {
                        *capped = true;
                        stats.mark_throttled();
                        Err(std::io::Error::other("download limit exceeded"))
                    } else {
                        Ok(bytes)
                    }
                }
                Err(e) => {
                    *capped = true;
                    Err(std::io::Error::other(e))
                }
            })
        };
        futures_util::future::ready(item)
    });

    match builder.body(Body::from_stream(counted)) {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(target: "proxy", error = %e, "failed to assemble response");
            status_response(StatusCode::BAD_GATEWAY, "failed to assemble response")
        }
    }
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|raw| raw.split(':').next().unwrap_or(raw).to_string())
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn status_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(message.to_string()));
    *resp.status_mut() = status;
    resp
}
