//! CONNECT tunnels.

use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderName, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{
    bad_gateway, connect_upstream, empty, text, ProxyBody, Shared, TunnelSession, TunnelState,
    PROXY_AGENT,
};

/// `host:port` of a CONNECT request target. The port is mandatory.
pub(super) fn target_of(uri: &Uri) -> Option<String> {
    let authority = uri.authority()?;
    authority.port_u16()?;
    if authority.host().is_empty() {
        return None;
    }
    Some(authority.to_string())
}

/// Dial the target, then answer `200 Connection Established` and relay.
pub(super) async fn handle(
    shared: &Shared,
    client_addr: SocketAddr,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let Some(target) = target_of(req.uri()) else {
        warn!(client = %client_addr, uri = %req.uri(), "CONNECT without host:port");
        return text(StatusCode::BAD_REQUEST, "CONNECT target must be host:port\n");
    };

    let mut session = TunnelSession::new(shared.next_id(), client_addr, target);
    let upstream = match connect_upstream(&session.target, shared.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                id = session.id,
                client = %client_addr,
                error = %e,
                "tunnel upstream unreachable"
            );
            session.advance(TunnelState::Closed);
            return bad_gateway();
        }
    };
    session.advance(TunnelState::Established);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => relay(session, upgraded, upstream).await,
            Err(e) => {
                warn!(id = session.id, error = %e, "client never completed CONNECT upgrade");
                session.advance(TunnelState::Closed);
            }
        }
    });

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response.headers_mut().insert(
        HeaderName::from_static("proxy-agent"),
        HeaderValue::from_static(PROXY_AGENT),
    );
    response
}

/// Copy bytes both ways until both directions finish or either errors.
///
/// The upgraded stream replays whatever the client sent after the CONNECT
/// request head, so those bytes reach the upstream first.
async fn relay(mut session: TunnelSession, upgraded: Upgraded, mut upstream: TcpStream) {
    let mut client = TokioIo::new(upgraded);

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            info!(
                id = session.id,
                client = %session.client_addr,
                target = %session.target,
                to_upstream,
                to_client,
                "tunnel closed"
            );
        }
        Err(e) => {
            debug!(id = session.id, target = %session.target, error = %e, "tunnel aborted");
        }
    }
    session.advance(TunnelState::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_target_requires_port() {
        assert_eq!(target_of(&uri("example.com:443")).as_deref(), Some("example.com:443"));
        assert_eq!(target_of(&uri("10.0.0.1:8443")).as_deref(), Some("10.0.0.1:8443"));
        assert_eq!(target_of(&uri("[::1]:22")).as_deref(), Some("[::1]:22"));
        assert_eq!(target_of(&uri("example.com")), None);
        assert_eq!(target_of(&uri("/just/a/path")), None);
    }
}
