//! CONNECT tunnel handling
//!
//! A CONNECT to a host with configured credentials is terminated locally
//! with a relay-signed certificate so the decrypted requests can run
//! through the interceptor. Anything else becomes an opaque byte pipe;
//! no plaintext is inspected.

use super::http::{self, Request, Response};
use super::{serve_session, BoxedStream, ProxyState, SessionMode};
use crate::common::net::{self, parse_host_port};
use crate::common::CompleteUrl;
use crate::context::ConnectionContext;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

pub async fn handle_connect(
    state: Arc<ProxyState>,
    ctx: Arc<ConnectionContext>,
    mut down: BufReader<BoxedStream>,
    request: Request,
) -> Result<()> {
    let (host, port) = parse_host_port(&request.target, 443)?;
    let configured = state.store.read().await.find(&host, port).is_some();

    if configured {
        terminate_tls(state, ctx, down, host, port).await
    } else {
        splice_opaque(state, ctx, &mut down, host, port).await
    }
}

/// Terminate the tunnel with a relay-signed certificate and feed the
/// decrypted requests through the interceptor.
async fn terminate_tls(
    state: Arc<ProxyState>,
    ctx: Arc<ConnectionContext>,
    mut down: BufReader<BoxedStream>,
    host: String,
    port: u16,
) -> Result<()> {
    info!(
        "[{}] Terminating CONNECT to {}:{} for authentication",
        ctx.id(),
        host,
        port
    );

    let server_config = state.ca.server_config(&host)?;
    down.write_all(ESTABLISHED).await?;
    down.flush().await?;

    let acceptor = TlsAcceptor::from(server_config);
    let tls = acceptor
        .accept(down)
        .await
        .map_err(|e| Error::tls(format!("Downstream TLS accept failed: {}", e)))?;

    let boxed: BoxedStream = Box::new(tls);
    serve_session(state, ctx, boxed, SessionMode::Mitm { host, port }).await
}

/// Opaque passthrough: dial the target (possibly through the upstream
/// proxy) and splice bytes until either side closes or the tunnel is torn
/// down. Teardown ends the target side first.
async fn splice_opaque(
    state: Arc<ProxyState>,
    ctx: Arc<ConnectionContext>,
    down: &mut BufReader<BoxedStream>,
    host: String,
    port: u16,
) -> Result<()> {
    let target = CompleteUrl::from_host_port(&host, port, true);

    let link = match state.upstream.open(&target).await {
        Ok(link) => link,
        Err(e) => {
            debug!("[{}] CONNECT to {}:{} failed: {}", ctx.id(), host, port, e);
            let response = Response::synthetic(502, "Bad Gateway", &format!("Connection failed: {}", e));
            http::write_response(down, &response).await?;
            return Ok(());
        }
    };

    down.write_all(ESTABLISHED).await?;
    down.flush().await?;
    debug!("[{}] Opaque tunnel to {}:{}", ctx.id(), host, port);

    let client_addr = ctx.client_addr();
    let close = state
        .contexts
        .register_tunnel(client_addr, target.host_with_port());

    let mut upstream = link.stream;
    tokio::select! {
        result = net::copy_bidirectional(down, &mut upstream) => {
            match result {
                Ok((sent, received)) => debug!(
                    "[{}] Tunnel to {}:{} done (sent: {}, received: {})",
                    ctx.id(), host, port, sent, received
                ),
                Err(e) => debug!("[{}] Tunnel to {}:{} error: {}", ctx.id(), host, port, e),
            }
        }
        _ = close.notified() => {
            let _ = upstream.shutdown().await;
            let _ = down.shutdown().await;
        }
    }

    state.contexts.deregister_tunnel(client_addr);
    Ok(())
}
