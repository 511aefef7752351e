//! NTLM proxy front end
//!
//! Accepts downstream proxy connections, creates one connection context
//! per socket, and serves requests through the interceptor. CONNECT
//! requests branch into the tunnel handler.

pub mod http;
pub mod interceptor;
pub mod tls;
pub mod tunnel;

use crate::auth::CredentialStore;
use crate::common::net::{configure_tcp_stream, parse_host_port};
use crate::common::CompleteUrl;
use crate::context::{ConnectionContext, ConnectionContextManager};
use crate::settings::Settings;
use crate::upstream::UpstreamProxyManager;
use crate::{Error, Result};
use http::{Request, Response};
use interceptor::OriginPool;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};

/// Object-safe alias for the downstream byte stream. The MITM path wraps
/// the stream in TLS and re-boxes it, so the session loop stays
/// non-generic.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// How requests on a downstream connection name their target.
pub enum SessionMode {
    /// Plain proxy port: absolute-form targets (or Host header)
    Proxy,
    /// Inside a terminated CONNECT tunnel: origin-form targets against a
    /// fixed authority
    Mitm { host: String, port: u16 },
}

/// Shared state of the proxy front end.
pub struct ProxyState {
    pub settings: Settings,
    pub store: Arc<RwLock<CredentialStore>>,
    pub contexts: Arc<ConnectionContextManager>,
    pub upstream: UpstreamProxyManager,
    pub tls_client: tls::TlsClientFactory,
    pub ca: tls::CertificateAuthority,
    config_api: Mutex<Option<CompleteUrl>>,
}

impl ProxyState {
    pub fn new(settings: Settings, cert_dir: &Path) -> Result<Self> {
        let upstream = UpstreamProxyManager::from_settings(&settings);
        let tls_client = tls::TlsClientFactory::new(&settings)?;
        let ca = tls::CertificateAuthority::load_or_create(cert_dir)?;

        Ok(ProxyState {
            settings,
            store: Arc::new(RwLock::new(CredentialStore::new())),
            contexts: Arc::new(ConnectionContextManager::new()),
            upstream,
            tls_client,
            ca,
            config_api: Mutex::new(None),
        })
    }

    /// Record where the config API listens, so proxied requests to it can
    /// be flagged and spared from reset teardown.
    pub fn set_config_api(&self, url: CompleteUrl) {
        if let Ok(mut guard) = self.config_api.lock() {
            *guard = Some(url);
        }
    }

    pub fn is_config_api_target(&self, target: &CompleteUrl) -> bool {
        let guard = match self.config_api.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match guard.as_ref() {
            Some(api) => {
                api.port() == target.port()
                    && (api.host() == target.host() || (api.is_localhost() && target.is_localhost()))
            }
            None => false,
        }
    }
}

/// Accept loop for the NTLM proxy port.
pub async fn run_listener(
    state: Arc<ProxyState>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("NTLM proxy listening on {}", addr);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("NTLM proxy listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        configure_tcp_stream(&stream);
                        let context = Arc::new(ConnectionContext::new(peer_addr));
                        let task_state = state.clone();
                        let task_context = context.clone();
                        let handle = tokio::spawn(async move {
                            let boxed: BoxedStream = Box::new(stream);
                            if let Err(e) =
                                serve_session(task_state.clone(), task_context, boxed, SessionMode::Proxy).await
                            {
                                debug!("Proxy connection error from {}: {}", peer_addr, e);
                            }
                            task_state.contexts.deregister(peer_addr);
                        });
                        state.contexts.register(peer_addr, context, handle.abort_handle());
                    }
                    Err(e) => error!("Proxy accept error: {}", e),
                }
            }
        }
    }
}

/// Serve requests on one downstream connection until it closes.
///
/// Written as a boxed-future-returning fn (rather than `async fn`) because
/// the CONNECT path recurses back into this function through
/// `tunnel::handle_connect`; the explicit boxing breaks the cycle the
/// compiler would otherwise need to prove `Send` through.
pub(crate) fn serve_session(
    state: Arc<ProxyState>,
    ctx: Arc<ConnectionContext>,
    io: BoxedStream,
    mode: SessionMode,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
    let mut down = BufReader::new(io);
    let mut pool = OriginPool::new();

    loop {
        let Some(request) = http::read_request(&mut down).await? else {
            return Ok(());
        };

        if request.method.eq_ignore_ascii_case("CONNECT") {
            if matches!(mode, SessionMode::Mitm { .. }) {
                let response = Response::synthetic(400, "Bad Request", "CONNECT inside a tunnel");
                http::write_response(&mut down, &response).await?;
                return Ok(());
            }
            drop(pool);
            return tunnel::handle_connect(state, ctx, down, request).await;
        }

        let target = match resolve_target(&request, &mode) {
            Ok(target) => target,
            Err(e) => {
                debug!("[{}] Unresolvable target {}: {}", ctx.id(), request.target, e);
                let response = Response::synthetic(400, "Bad Request", &e.to_string());
                http::write_response(&mut down, &response).await?;
                return Ok(());
            }
        };

        if state.is_config_api_target(&target) {
            ctx.mark_config_api();
        }

        let mut response = interceptor::process(&state, &ctx, &mut pool, &target, &request).await?;

        let close = request.wants_close() || is_gateway_close(&response);
        sanitize_response(&mut response, close);
        http::write_response(&mut down, &response).await?;

        if close {
            return Ok(());
        }
    }
    })
}

/// Map the request line (plus Host header or tunnel authority) to a target.
fn resolve_target(request: &Request, mode: &SessionMode) -> Result<CompleteUrl> {
    match mode {
        SessionMode::Mitm { host, port } => {
            if request.target.starts_with("http://") || request.target.starts_with("https://") {
                CompleteUrl::parse(&request.target)
            } else {
                CompleteUrl::parse(&format!("https://{}:{}{}", host, port, request.target))
            }
        }
        SessionMode::Proxy => {
            if request.target.starts_with("http://") || request.target.starts_with("https://") {
                CompleteUrl::parse(&request.target)
            } else {
                let host = request
                    .headers
                    .get("Host")
                    .ok_or_else(|| Error::protocol("Missing Host header"))?;
                let (host, port) = parse_host_port(host, 80)?;
                CompleteUrl::parse(&format!("http://{}:{}{}", host, port, request.target))
            }
        }
    }
}

/// Relay-generated gateway errors carry Connection: close and end the
/// downstream connection.
fn is_gateway_close(response: &Response) -> bool {
    matches!(response.status, 502 | 504) && response.headers.has_token("Connection", "close")
}

/// Hop-by-hop response headers stop here; the downstream connection
/// header reflects our own keep-alive decision.
fn sanitize_response(response: &mut Response, close: bool) {
    response.headers.remove("Connection");
    response.headers.remove("Keep-Alive");
    response.headers.remove("Proxy-Connection");
    response
        .headers
        .push("Connection", if close { "close" } else { "keep-alive" });
}
