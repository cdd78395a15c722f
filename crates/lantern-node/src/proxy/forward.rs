//! Plain HTTP forwarding.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{HeaderName, HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tracing::{debug, warn};

use super::{bad_gateway, connect_upstream, text, ProxyBody, Shared};

/// Port used when neither the URI nor `Host` names one.
const DEFAULT_HTTP_PORT: u16 = 80;

/// Header some clients send in place of `Connection`; meant for us only.
const PROXY_CONNECTION: &str = "proxy-connection";

/// `host:port` of the origin: the absolute URI first, then `Host`.
pub(super) fn destination<B>(req: &Request<B>) -> Option<String> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.clone(),
        None => {
            let host = req.headers().get(HOST)?.to_str().ok()?;
            host.parse::<Uri>().ok()?.authority()?.clone()
        }
    };
    if authority.host().is_empty() {
        return None;
    }
    let port = authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT);
    Some(format!("{}:{port}", authority.host()))
}

/// Rewrite a proxy request for the origin: origin-form target, a `Host`
/// header, and no proxy-only headers.
///
/// An absolute URI's authority replaces any `Host` the client sent.
pub(super) fn to_origin_form<B>(req: &mut Request<B>) -> Option<()> {
    if let Some(authority) = req.uri().authority() {
        let host = match authority.port() {
            Some(port) => format!("{}:{port}", authority.host()),
            None => authority.host().to_string(),
        };
        let host = HeaderValue::from_str(&host).ok()?;
        req.headers_mut().insert(HOST, host);
    } else if !req.headers().contains_key(HOST) {
        return None;
    }

    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let origin_form: Uri = path.parse().ok()?;
    *req.uri_mut() = origin_form;

    let headers = req.headers_mut();
    headers.remove(HeaderName::from_static(PROXY_CONNECTION));
    headers.remove(PROXY_AUTHORIZATION);
    Some(())
}

/// Send the request to its origin over a fresh connection and relay the answer.
pub(super) async fn handle(
    shared: &Shared,
    client_addr: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<ProxyBody> {
    let Some(target) = destination(&req) else {
        warn!(client = %client_addr, uri = %req.uri(), "request names no destination");
        return text(StatusCode::BAD_REQUEST, "no destination host\n");
    };
    if to_origin_form(&mut req).is_none() {
        return text(StatusCode::BAD_REQUEST, "unusable request target\n");
    }

    let id = shared.next_id();
    debug!(
        id,
        client = %client_addr,
        target = %target,
        method = %req.method(),
        "forwarding request"
    );

    let stream = match connect_upstream(&target, shared.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(id, client = %client_addr, error = %e, "origin unreachable");
            return bad_gateway();
        }
    };

    let (mut sender, conn) = match http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
    {
        Ok(parts) => parts,
        Err(e) => {
            warn!(id, target = %target, error = %e, "origin handshake failed");
            return bad_gateway();
        }
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(id, error = %e, "origin connection ended with error");
        }
    });

    match sender.send_request(req).await {
        Ok(response) => {
            debug!(id, status = %response.status(), "relaying origin response");
            response.map(BodyExt::boxed)
        }
        Err(e) => {
            warn!(id, target = %target, error = %e, "origin request failed");
            bad_gateway()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_destination_from_absolute_uri() {
        let req = request("http://example.com/index.html", None);
        assert_eq!(destination(&req).as_deref(), Some("example.com:80"));

        let req = request("http://127.0.0.1:8081/x?y=1", None);
        assert_eq!(destination(&req).as_deref(), Some("127.0.0.1:8081"));
    }

    #[test]
    fn test_destination_falls_back_to_host_header() {
        let req = request("/status", Some("origin.test:9000"));
        assert_eq!(destination(&req).as_deref(), Some("origin.test:9000"));

        let req = request("/status", Some("origin.test"));
        assert_eq!(destination(&req).as_deref(), Some("origin.test:80"));

        assert_eq!(destination(&request("/status", None)), None);
    }

    #[test]
    fn test_origin_form_rewrite() {
        let mut req = Request::builder()
            .uri("http://example.com:8080/a/b?c=d")
            .header("proxy-connection", "keep-alive")
            .header(PROXY_AUTHORIZATION, "Basic Zm9vOmJhcg==")
            .header("x-kept", "1")
            .body(())
            .unwrap();

        to_origin_form(&mut req).unwrap();
        assert_eq!(req.uri(), "/a/b?c=d");
        assert_eq!(req.headers()[HOST], "example.com:8080");
        assert!(!req.headers().contains_key("proxy-connection"));
        assert!(!req.headers().contains_key(PROXY_AUTHORIZATION));
        assert_eq!(req.headers()["x-kept"], "1");
    }

    #[test]
    fn test_uri_authority_overrides_client_host() {
        let mut req = request("http://user:pw@origin.test:8081/p", Some("elsewhere.test"));
        to_origin_form(&mut req).unwrap();
        assert_eq!(req.headers()[HOST], "origin.test:8081");
        assert_eq!(req.headers().get_all(HOST).iter().count(), 1);

        let mut req = request("http://origin.test/p", Some("elsewhere.test:9"));
        to_origin_form(&mut req).unwrap();
        assert_eq!(req.headers()[HOST], "origin.test");
    }

    #[test]
    fn test_origin_form_keeps_host_without_authority() {
        let mut req = request("/p", Some("origin.test:9000"));
        to_origin_form(&mut req).unwrap();
        assert_eq!(req.headers()[HOST], "origin.test:9000");

        assert!(to_origin_form(&mut request("/p", None)).is_none());
    }
}
