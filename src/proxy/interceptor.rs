//! Request interception and the NTLM handshake
//!
//! Each downstream connection owns a pool of pinned upstream connections,
//! exactly one per origin (or per upstream proxy for plain-HTTP targets
//! routed through one). Requests on a downstream connection are handled
//! serially, so all writes to a pinned connection are naturally ordered.
//!
//! When a configured host answers 401 with an NTLM or Negotiate challenge,
//! the three handshake legs and the replayed request travel on the same
//! pinned socket; NTLM authenticates the TCP connection, not the request.

use super::http::{self, Request, Response};
use super::ProxyState;
use crate::auth::ntlm;
use crate::auth::sso::SsoHandshake;
use crate::auth::Credentials;
use crate::common::CompleteUrl;
use crate::context::{ConnectionContext, HandshakeState};
use crate::upstream::Route;
use crate::{Error, Result};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// A pinned upstream connection, plain or TLS.
pub enum OriginStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for OriginStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            OriginStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            OriginStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            OriginStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            OriginStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

struct OriginConn {
    io: BufReader<OriginStream>,
    /// No request exchanged on this socket yet
    fresh: bool,
}

/// Pinned upstream connections for one downstream connection.
#[derive(Default)]
pub struct OriginPool {
    conns: HashMap<String, OriginConn>,
}

impl OriginPool {
    pub fn new() -> Self {
        OriginPool {
            conns: HashMap::new(),
        }
    }

    async fn acquire(
        &mut self,
        state: &ProxyState,
        ctx: &ConnectionContext,
        target: &CompleteUrl,
        key: &str,
    ) -> Result<&mut OriginConn> {
        if !self.conns.contains_key(key) {
            let link = state.upstream.open(target).await?;
            let via_proxy = link.route.is_via_proxy();

            let stream = if target.is_https() {
                let tls = state.tls_client.connect(target, link.stream).await?;
                if let Some(fingerprint) = super::tls::peer_fingerprint(&tls) {
                    ctx.pin_fingerprint(&target.origin(), &fingerprint)?;
                }
                OriginStream::Tls(Box::new(tls))
            } else {
                OriginStream::Plain(link.stream)
            };

            debug!(
                "[{}] Pinned upstream connection for {} (via proxy: {})",
                ctx.id(),
                key,
                via_proxy
            );
            self.conns.insert(
                key.to_string(),
                OriginConn {
                    io: BufReader::new(stream),
                    fresh: true,
                },
            );
        }
        Ok(self.conns.get_mut(key).expect("just inserted"))
    }

    fn discard(&mut self, key: &str) {
        self.conns.remove(key);
    }
}

/// One pinned connection per route endpoint: plain-HTTP targets behind an
/// upstream proxy share the proxy connection, everything else is keyed by
/// origin.
fn pool_key(route: &Route, target: &CompleteUrl) -> String {
    match route {
        Route::Via(proxy) if !target.is_https() => format!("proxy:{}", proxy.host_with_port()),
        _ => target.origin(),
    }
}

/// Handle one downstream request end to end and produce the response to
/// relay. Errors bubbling out of here tear the downstream connection down
/// (the direct-path "socket hang up" surface).
pub async fn process(
    state: &ProxyState,
    ctx: &ConnectionContext,
    pool: &mut OriginPool,
    target: &CompleteUrl,
    request: &Request,
) -> Result<Response> {
    let credentials = state
        .store
        .read()
        .await
        .find(target.host(), target.port())
        .cloned();

    let route = state.upstream.resolve(target, target.is_https());
    let via_proxy = route.is_via_proxy();
    let key = pool_key(&route, target);
    let origin = target.origin();

    let prepared = prepare_request(request, target, via_proxy && !target.is_https());

    // First exchange, with a single retry when a reused keep-alive socket
    // turns out to be dead.
    let mut retried = false;
    let response = loop {
        let conn = match pool.acquire(state, ctx, target, &key).await {
            Ok(conn) => conn,
            Err(e) => return upstream_failure(e, via_proxy, ctx, &origin),
        };
        let was_fresh = conn.fresh;
        match exchange(conn, &prepared).await {
            Ok(response) => break response,
            Err(e) if !was_fresh && !retried => {
                debug!(
                    "[{}] Pinned socket for {} went stale ({}), redialing",
                    ctx.id(),
                    key,
                    e
                );
                pool.discard(&key);
                retried = true;
            }
            Err(e) => {
                pool.discard(&key);
                return upstream_failure(e, via_proxy, ctx, &origin);
            }
        }
    };

    if response.status == 401 && response.has_ntlm_challenge() {
        if let Some(credentials) = credentials {
            return handshake(
                state, ctx, pool, target, &key, via_proxy, &prepared, &credentials, response,
            )
            .await;
        }
        // Unconfigured host: surface the server's own 401 verbatim
        debug!(
            "[{}] 401 from unconfigured host {}, passing through",
            ctx.id(),
            target.host_with_port()
        );
    }

    Ok(response)
}

/// Drive the three handshake legs on the pinned socket and return the
/// final response.
#[allow(clippy::too_many_arguments)]
async fn handshake(
    state: &ProxyState,
    ctx: &ConnectionContext,
    pool: &mut OriginPool,
    target: &CompleteUrl,
    key: &str,
    via_proxy: bool,
    prepared: &Request,
    credentials: &Credentials,
    challenge_401: Response,
) -> Result<Response> {
    let origin = target.origin();

    let Some(scheme) = challenge_401
        .headers
        .get("WWW-Authenticate")
        .and_then(|h| ntlm::offered_scheme(h, credentials.is_sso()))
    else {
        return Ok(challenge_401);
    };

    info!(
        "[{}] Starting {} handshake with {}",
        ctx.id(),
        scheme.as_str(),
        target.host_with_port()
    );

    let mut sso = match credentials {
        Credentials::Sso => match SsoHandshake::new(target.host()) {
            Ok(handshake) => Some(handshake),
            Err(e) => {
                warn!("[{}] SSO unavailable: {}", ctx.id(), e);
                ctx.set_state(&origin, HandshakeState::Failed);
                return Ok(challenge_401);
            }
        },
        Credentials::Explicit(_) => None,
    };

    // The server may have asked to close the connection alongside the
    // challenge; the handshake must then start over on a fresh socket.
    if challenge_401.wants_close() {
        pool.discard(key);
    }

    // Leg 1: negotiate, replaying the original request
    let type1 = if let Some(sso) = &mut sso {
        match sso.initial_token() {
            Ok(token) => token,
            Err(e) => {
                warn!("[{}] SSO negotiate failed: {}", ctx.id(), e);
                ctx.set_state(&origin, HandshakeState::Failed);
                return Ok(challenge_401);
            }
        }
    } else {
        ntlm::negotiate_message()
    };
    let mut leg1 = prepared.clone();
    leg1.headers
        .set("Authorization", ntlm::authorization_header(scheme, &type1));

    ctx.set_state(&origin, HandshakeState::Type1Sent);
    let conn = match pool.acquire(state, ctx, target, key).await {
        Ok(conn) => conn,
        Err(e) => return upstream_failure(e, via_proxy, ctx, &origin),
    };
    let challenge_response = match exchange(conn, &leg1).await {
        Ok(response) => response,
        Err(e) => {
            pool.discard(key);
            ctx.set_state(&origin, HandshakeState::Idle);
            return upstream_failure(e, via_proxy, ctx, &origin);
        }
    };

    if challenge_response.status != 401 {
        // Server accepted without a challenge round trip
        let authenticated = challenge_response.status < 400;
        ctx.set_state(
            &origin,
            if authenticated {
                HandshakeState::Authenticated
            } else {
                HandshakeState::Failed
            },
        );
        return Ok(challenge_response);
    }

    let Some((_, token)) = challenge_response
        .headers
        .get("WWW-Authenticate")
        .and_then(ntlm::extract_token)
    else {
        warn!(
            "[{}] Expected Type 2 challenge from {}, got bare 401",
            ctx.id(),
            target.host_with_port()
        );
        ctx.set_state(&origin, HandshakeState::Failed);
        return Ok(challenge_response);
    };
    ctx.set_state(&origin, HandshakeState::Type2Received);

    if challenge_response.wants_close() {
        // The challenge is bound to this socket; nothing to answer on a
        // new one. Surface the 401 and let the next request retry.
        warn!(
            "[{}] {} closed the connection mid-handshake",
            ctx.id(),
            target.host_with_port()
        );
        pool.discard(key);
        ctx.set_state(&origin, HandshakeState::Idle);
        return Ok(challenge_response);
    }

    // Leg 3: authenticate, replaying the original request again
    let type3 = if let Some(sso) = &mut sso {
        match sso.respond(&token) {
            Ok(token) => token,
            Err(e) => {
                warn!("[{}] SSO authenticate failed: {}", ctx.id(), e);
                ctx.set_state(&origin, HandshakeState::Failed);
                return Ok(challenge_response);
            }
        }
    } else if let Credentials::Explicit(explicit) = credentials {
        let challenge = match ntlm::parse_challenge(&token) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!("[{}] Bad Type 2 challenge: {}", ctx.id(), e);
                ctx.set_state(&origin, HandshakeState::Failed);
                return Ok(challenge_response);
            }
        };
        match ntlm::authenticate_message(&challenge, explicit, target.host()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[{}] Type 3 generation failed: {}", ctx.id(), e);
                ctx.set_state(&origin, HandshakeState::Failed);
                return Ok(challenge_response);
            }
        }
    } else {
        // SSO credentials always carry their own handshake from leg 1
        ctx.set_state(&origin, HandshakeState::Failed);
        return Ok(challenge_response);
    };
    let mut leg3 = prepared.clone();
    leg3.headers
        .set("Authorization", ntlm::authorization_header(scheme, &type3));

    ctx.set_state(&origin, HandshakeState::Type3Sent);
    let conn = match pool.acquire(state, ctx, target, key).await {
        Ok(conn) => conn,
        Err(e) => return upstream_failure(e, via_proxy, ctx, &origin),
    };
    let final_response = match exchange(conn, &leg3).await {
        Ok(response) => response,
        Err(e) => {
            pool.discard(key);
            ctx.set_state(&origin, HandshakeState::Idle);
            return upstream_failure(e, via_proxy, ctx, &origin);
        }
    };

    if final_response.status == 401 && final_response.has_ntlm_challenge() {
        // Server rejected the Type 3; do not loop. Back to Idle so a later
        // request re-attempts from scratch.
        info!(
            "[{}] {} rejected the authentication",
            ctx.id(),
            target.host_with_port()
        );
        ctx.set_state(&origin, HandshakeState::Idle);
        return Ok(final_response);
    }

    info!(
        "[{}] Authenticated against {}",
        ctx.id(),
        target.host_with_port()
    );
    ctx.set_state(&origin, HandshakeState::Authenticated);
    Ok(final_response)
}

/// Write a request and read the response on a pinned connection.
async fn exchange(conn: &mut OriginConn, request: &Request) -> Result<Response> {
    let head_only = request.method.eq_ignore_ascii_case("HEAD");
    http::write_request(conn.io.get_mut(), request)
        .await
        .map_err(into_aborted)?;
    let response = http::read_response(&mut conn.io, head_only)
        .await
        .map_err(into_aborted)?;
    conn.fresh = false;
    Ok(response)
}

fn into_aborted(e: Error) -> Error {
    match e {
        Error::Io(io) => Error::upstream_aborted(io.to_string()),
        other => other,
    }
}

/// Build the request to replay upstream from the downstream one.
fn prepare_request(request: &Request, target: &CompleteUrl, absolute_form: bool) -> Request {
    let mut headers = http::Headers::new();
    for (name, value) in request.headers.iter() {
        if is_hop_by_hop_header(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        headers.push(name, value);
    }

    let host_header = if target.port() == target.scheme().default_port() {
        target.host().to_string()
    } else {
        target.host_with_port()
    };
    headers.set("Host", host_header);
    headers.set("Connection", "keep-alive");
    if !request.body.is_empty() || request.headers.get("Content-Length").is_some() {
        headers.set("Content-Length", request.body.len().to_string());
    }

    let line_target = if absolute_form {
        target.href()
    } else {
        target.path().to_string()
    };

    Request {
        method: request.method.clone(),
        target: line_target,
        version: "HTTP/1.1".to_string(),
        headers,
        body: request.body.clone(),
    }
}

/// Check if header is a hop-by-hop header
fn is_hop_by_hop_header(header: &str) -> bool {
    matches!(
        header.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

/// Translate an upstream failure into the downstream surface: a gateway
/// response when an upstream proxy is in the path or the failure happened
/// before any exchange, a torn-down socket otherwise.
fn upstream_failure(
    e: Error,
    via_proxy: bool,
    ctx: &ConnectionContext,
    origin: &str,
) -> Result<Response> {
    warn!("[{}] Upstream failure for {}: {}", ctx.id(), origin, e);
    if via_proxy {
        return Ok(Response::synthetic(504, "Gateway Timeout", &e.to_string()));
    }
    match e {
        Error::Connection(_) | Error::Timeout(_) => {
            Ok(Response::synthetic(502, "Bad Gateway", &e.to_string()))
        }
        Error::Tls(_) => Ok(Response::synthetic(504, "Gateway Timeout", &e.to_string())),
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, target: &str) -> Request {
        let mut headers = http::Headers::new();
        headers.push("Host", "ignored");
        headers.push("Proxy-Connection", "keep-alive");
        headers.push("Accept", "*/*");
        Request {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers,
            body: Vec::new(),
        }
    }

    #[test]
    fn test_prepare_request_origin_form() {
        let target = CompleteUrl::parse("http://host:5000/get?x=1").unwrap();
        let prepared = prepare_request(&request("GET", "http://host:5000/get?x=1"), &target, false);
        assert_eq!(prepared.target, "/get?x=1");
        assert_eq!(prepared.headers.get("Host"), Some("host:5000"));
        assert_eq!(prepared.headers.get("Connection"), Some("keep-alive"));
        assert!(prepared.headers.get("Proxy-Connection").is_none());
    }

    #[test]
    fn test_prepare_request_absolute_form() {
        let target = CompleteUrl::parse("http://host:5000/get").unwrap();
        let prepared = prepare_request(&request("GET", "http://host:5000/get"), &target, true);
        assert_eq!(prepared.target, "http://host:5000/get");
    }

    #[test]
    fn test_prepare_request_default_port_host_header() {
        let target = CompleteUrl::parse("http://example.com/").unwrap();
        let prepared = prepare_request(&request("GET", "http://example.com/"), &target, false);
        assert_eq!(prepared.headers.get("Host"), Some("example.com"));
    }

    #[test]
    fn test_pool_key_shares_proxy_for_plain_http() {
        let proxy = CompleteUrl::parse("http://proxy:3128").unwrap();
        let http_target = CompleteUrl::parse("http://a.example.com").unwrap();
        let https_target = CompleteUrl::parse("https://b.example.com").unwrap();

        let via = Route::Via(proxy);
        assert_eq!(pool_key(&via, &http_target), "proxy:proxy:3128");
        assert_eq!(pool_key(&via, &https_target), "https://b.example.com:443");
        assert_eq!(
            pool_key(&Route::Direct, &http_target),
            "http://a.example.com:80"
        );
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("Proxy-Connection"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Authorization"));
    }
}
