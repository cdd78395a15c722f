//! Issuance endpoint: signs certificate requests submitted over plain TLS.
//! A submitted certificate is re-issued for its public key.
//!
//! ```text
//! POST /authenticate   body: CSR or certificate (PEM)  ->  200 application/x-pem-file
//! GET  /authenticate                     ->  405
//! *    anything else                     ->  404
//! ```

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use lantern_pki::{fingerprint, IdentityStore};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Largest accepted request body.
pub const MAX_SUBMISSION_BYTES: usize = 64 * 1024;

/// Content type of issued certificates.
pub const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

/// Where a request path leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Sign the submitted CSR or certificate
    Authenticate,
    /// Anything unrecognised
    NotFound,
}

/// Path prefixes, checked in order.
const ROUTES: &[(&str, Route)] = &[("authenticate", Route::Authenticate)];

/// Resolve a request path: one leading and one trailing `/` are ignored,
/// then the first matching prefix wins.
pub fn route(path: &str) -> Route {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    ROUTES
        .iter()
        .find(|(prefix, _)| path.starts_with(prefix))
        .map_or(Route::NotFound, |(_, route)| *route)
}

/// Answer one issuance request. Never fails; problems become status codes.
pub async fn handle<B>(
    store: &IdentityStore,
    remote: SocketAddr,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match route(req.uri().path()) {
        Route::NotFound => {
            debug!(remote = %remote, path = req.uri().path(), "no issuance route");
            text(StatusCode::NOT_FOUND, "not found\n")
        }
        Route::Authenticate if req.method() != Method::POST => {
            let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "use POST\n");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("POST"));
            response
        }
        Route::Authenticate => authenticate(store, remote, req.into_body()).await,
    }
}

async fn authenticate<B>(
    store: &IdentityStore,
    remote: SocketAddr,
    body: B,
) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // The whole submission must arrive before anything is signed.
    let body = match Limited::new(body, MAX_SUBMISSION_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(remote = %remote, error = %e, "incomplete or oversized submission");
            return text(StatusCode::BAD_REQUEST, "incomplete or oversized submission\n");
        }
    };

    let Ok(submission) = std::str::from_utf8(&body) else {
        warn!(remote = %remote, "submission is not text");
        return text(StatusCode::BAD_REQUEST, "malformed submission: not PEM\n");
    };

    match store.sign(submission) {
        Ok(issued) => {
            let fp = lantern_pki::cert::parse_pem(&issued)
                .map(|d| fingerprint::short(&d.fingerprint).to_string())
                .unwrap_or_default();
            info!(remote = %remote, fingerprint = %fp, "issued certificate");

            let mut response = Response::new(Full::new(Bytes::from(issued)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(PEM_CONTENT_TYPE));
            response
        }
        Err(e) if e.is_client_error() => {
            warn!(remote = %remote, error = %e, "rejected submission");
            text(StatusCode::BAD_REQUEST, &format!("{e}\n"))
        }
        Err(e) => {
            warn!(remote = %remote, error = %e, "signing failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "signing failed\n")
        }
    }
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}
