//! Process settings, captured once at startup
//!
//! Environment variables are read a single time into an immutable value
//! that is passed into the components that need it. Only the uppercase
//! variants are recognized.

use crate::common::CompleteUrl;
use crate::Result;
use std::path::PathBuf;
use tracing::warn;

/// Immutable snapshot of the environment configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Upstream proxy for plain-HTTP targets (`HTTP_PROXY`)
    pub http_proxy: Option<CompleteUrl>,
    /// Upstream proxy for TLS targets (`HTTPS_PROXY`), overrides
    /// `HTTP_PROXY` for those
    pub https_proxy: Option<CompleteUrl>,
    /// Bypass list (`NO_PROXY`)
    pub no_proxy: Option<String>,
    /// Exact bind URL for the config API (`CYPRESS_NTLM_AUTH_API`)
    pub config_api_url: Option<CompleteUrl>,
    /// Exact bind URL for the NTLM proxy (`CYPRESS_NTLM_AUTH_PROXY`)
    pub ntlm_proxy_url: Option<CompleteUrl>,
    /// Upstream certificate verification; disabled when
    /// `NODE_TLS_REJECT_UNAUTHORIZED=0`
    pub reject_unauthorized: bool,
    /// Extra PEM bundle merged into the trust store
    /// (`NODE_EXTRA_CA_CERTS`)
    pub extra_ca_certs: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            config_api_url: None,
            ntlm_proxy_url: None,
            reject_unauthorized: true,
            extra_ca_certs: None,
        }
    }
}

impl Settings {
    /// Capture the environment. Invalid upstream proxy URLs are logged and
    /// ignored; invalid explicit bind URLs are fatal.
    pub fn from_env() -> Result<Self> {
        let http_proxy = parse_proxy_var("HTTP_PROXY");
        let https_proxy = parse_proxy_var("HTTPS_PROXY");
        let no_proxy = non_empty_var("NO_PROXY");

        let config_api_url = parse_bind_var("CYPRESS_NTLM_AUTH_API")?;
        let ntlm_proxy_url = parse_bind_var("CYPRESS_NTLM_AUTH_PROXY")?;

        let reject_unauthorized =
            std::env::var("NODE_TLS_REJECT_UNAUTHORIZED").map(|v| v != "0").unwrap_or(true);
        let extra_ca_certs = non_empty_var("NODE_EXTRA_CA_CERTS").map(PathBuf::from);

        Ok(Settings {
            http_proxy,
            https_proxy,
            no_proxy,
            config_api_url,
            ntlm_proxy_url,
            reject_unauthorized,
            extra_ca_certs,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

/// Exact bind URLs; a bare `host:port` is accepted as well.
fn parse_bind_var(name: &str) -> Result<Option<CompleteUrl>> {
    match non_empty_var(name) {
        None => Ok(None),
        Some(raw) => {
            let candidate = if raw.contains("://") {
                raw
            } else {
                format!("http://{}", raw)
            };
            CompleteUrl::parse(&candidate).map(Some)
        }
    }
}

fn parse_proxy_var(name: &str) -> Option<CompleteUrl> {
    let raw = non_empty_var(name)?;
    match CompleteUrl::parse(&raw) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!("Ignoring invalid {}: {}", name, e);
            None
        }
    }
}
