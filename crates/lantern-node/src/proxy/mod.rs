//! Local forward proxy.
//!
//! `CONNECT host:port` opens a raw TCP tunnel; any other request is forwarded
//! to the origin named in its URI (or `Host` header) and the answer relayed.

mod connect;
mod forward;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ListenerKind, NodeError};

/// Response body type of every proxy response.
pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Value of the `Proxy-Agent` header.
pub const PROXY_AGENT: &str = "Lantern";

/// Default bound on upstream connects.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Dialling the upstream
    Connecting,
    /// Relaying bytes
    Established,
    /// Either side closed, or the upstream could not be reached
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Established => "established",
            Self::Closed => "closed",
        })
    }
}

/// One client-to-upstream relay.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub id: u64,
    pub client_addr: SocketAddr,
    pub target: String,
    pub state: TunnelState,
}

impl TunnelSession {
    fn new(id: u64, client_addr: SocketAddr, target: String) -> Self {
        debug!(id, client = %client_addr, target = %target, "tunnel connecting");
        Self {
            id,
            client_addr,
            target,
            state: TunnelState::Connecting,
        }
    }

    fn advance(&mut self, state: TunnelState) {
        debug!(id = self.id, from = %self.state, to = %state, "tunnel state");
        self.state = state;
    }
}

/// State shared by every connection of one proxy.
struct Shared {
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// HTTP(S) forward proxy.
#[derive(Debug, Clone)]
pub struct ProxyTunnel {
    connect_timeout: Duration,
}

impl Default for ProxyTunnel {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl ProxyTunnel {
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Listen on `port`; no `host` means every interface.
    pub async fn start(&self, port: u16, host: Option<IpAddr>) -> crate::Result<RunningProxy> {
        let host = host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        self.start_at(SocketAddr::new(host, port)).await
    }

    pub async fn start_at(&self, addr: SocketAddr) -> crate::Result<RunningProxy> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NodeError::listen(ListenerKind::Proxy, addr, e))?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "proxy listening");

        let shared = Arc::new(Shared {
            connect_timeout: self.connect_timeout,
            next_id: AtomicU64::new(1),
        });
        let task = tokio::spawn(accept_loop(listener, shared));
        Ok(RunningProxy { addr, task })
    }
}

/// Handle to a started proxy. Dropping it stops accepting.
#[derive(Debug)]
pub struct RunningProxy {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RunningProxy {
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting. Open tunnels run until one side closes.
    pub fn shutdown(self) {
        info!(addr = %self.addr, "proxy shutting down");
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "proxy accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let shared = shared.clone();
                async move { Ok::<_, Infallible>(dispatch(&shared, client_addr, req).await) }
            });

            if let Err(e) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!(client = %client_addr, error = %e, "proxy connection ended with error");
            }
        });
    }
}

async fn dispatch(
    shared: &Shared,
    client_addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        connect::handle(shared, client_addr, req).await
    } else {
        forward::handle(shared, client_addr, req).await
    }
}

/// Dial `target` (`host:port`) within the connect timeout.
async fn connect_upstream(target: &str, timeout: Duration) -> crate::Result<TcpStream> {
    let failed = |reason: String| NodeError::UpstreamConnect {
        target: target.to_string(),
        reason,
    };
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(failed(e.to_string())),
        Err(_) => Err(failed(format!("timed out after {timeout:?}"))),
    }
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn text(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
}

/// `502 Bad Gateway`; the client connection is closed after it is sent.
fn bad_gateway() -> Response<ProxyBody> {
    let mut response = text(StatusCode::BAD_GATEWAY, "");
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::HeaderName::from_static("proxy-agent"),
        HeaderValue::from_static(PROXY_AGENT),
    );
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
