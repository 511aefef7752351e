//! NTLM Relay - authenticating proxy for browser test runners
//!
//! A local HTTP/HTTPS proxy that performs NTLM (and, on Windows,
//! Negotiate/SSO) handshakes on behalf of a downstream client that cannot
//! do Windows Integrated Authentication itself. Credentials are supplied
//! at runtime through a separate config API; upstream 401 challenges from
//! configured hosts are answered transparently on the same pinned TCP
//! connection, so the server associates the authenticated identity with
//! subsequent requests.
//!
//! # Architecture
//!
//! ```text
//!              +----------------+
//!              |  hub/ (config) |
//!              +-------+--------+
//!                      |
//!     +----------------+----------------+
//!     |                |                |
//! +---v----+     +-----v-----+    +-----v-----+
//! | auth/  |     |  context/ |    |  proxy/   |
//! | (creds)|     | (pinning) |    | (inbound) |
//! +--------+     +-----------+    +-----+-----+
//!                                       |
//!                                 +-----v-----+
//!                                 | upstream/ |
//!                                 | (routing) |
//!                                 +-----------+
//! ```

pub mod auth;
pub mod common;
pub mod context;
pub mod hub;
pub mod ports;
pub mod proxy;
pub mod settings;
pub mod upstream;

pub use common::error::{Error, Result};
pub use settings::Settings;

use proxy::ProxyState;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relay instance: both listeners plus the shared state behind them.
pub struct Relay {
    state: Arc<ProxyState>,
    proxy_listener: TcpListener,
    api_listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
}

impl Relay {
    /// Bind both listeners and build the shared state. Listeners default
    /// to ephemeral loopback ports unless pinned through the settings.
    pub async fn start(settings: Settings) -> Result<Self> {
        let proxy_listener = bind(settings.ntlm_proxy_url.as_ref().map(|u| u.host_with_port())).await?;
        let api_listener = bind(settings.config_api_url.as_ref().map(|u| u.host_with_port())).await?;

        let state = Arc::new(ProxyState::new(
            settings,
            Path::new(proxy::tls::DEFAULT_CERT_DIR),
        )?);

        let api_addr = api_listener.local_addr()?;
        state.set_config_api(common::CompleteUrl::parse(&format!("http://{}", api_addr))?);

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Relay {
            state,
            proxy_listener,
            api_listener,
            shutdown_tx,
        })
    }

    pub fn ntlm_proxy_url(&self) -> Result<String> {
        Ok(format!("http://{}", self.proxy_listener.local_addr()?))
    }

    pub fn config_api_url(&self) -> Result<String> {
        Ok(format!("http://{}", self.api_listener.local_addr()?))
    }

    /// Handle that triggers graceful shutdown (also used by `/quit`).
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run both listeners until shutdown is requested via `/quit` or
    /// Ctrl-C, then tear down all contexts and tunnels.
    pub async fn run(self) -> Result<()> {
        let hub_state = hub::AppState {
            store: self.state.store.clone(),
            contexts: self.state.contexts.clone(),
            shutdown: self.shutdown_tx.clone(),
        };

        let api_task = tokio::spawn(hub::serve(
            self.api_listener,
            hub_state,
            self.shutdown_tx.subscribe(),
        ));
        let proxy_task = tokio::spawn(proxy::run_listener(
            self.state.clone(),
            self.proxy_listener,
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt signal");
                let _ = self.shutdown_tx.send(());
            }
        }

        self.state.contexts.remove_all("shutdown");
        self.state.contexts.remove_all_tunnels("shutdown");

        match api_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Config API server error: {}", e),
            Err(e) => warn!("Config API task ended abnormally: {}", e),
        }
        match proxy_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Proxy listener error: {}", e),
            Err(e) => warn!("Proxy task ended abnormally: {}", e),
        }

        info!("Relay stopped");
        Ok(())
    }
}

async fn bind(authority: Option<String>) -> Result<TcpListener> {
    let authority = authority.unwrap_or_else(|| "127.0.0.1:0".to_string());
    TcpListener::bind(authority.as_str())
        .await
        .map_err(|e| Error::bind(format!("Cannot bind {}: {}", authority, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_ports() {
        let relay = Relay::start(Settings::default()).await.unwrap();
        let proxy_url = relay.ntlm_proxy_url().unwrap();
        let api_url = relay.config_api_url().unwrap();
        assert!(proxy_url.starts_with("http://127.0.0.1:"));
        assert!(api_url.starts_with("http://127.0.0.1:"));
        assert_ne!(proxy_url, api_url);
    }
}
