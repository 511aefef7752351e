//! Upstream route resolution and dialing
//!
//! Decides whether an outbound connection goes direct or through the
//! corporate proxy, and performs the dial: a plain TCP connection, or a
//! connection to the proxy with an HTTP CONNECT handshake for TLS
//! targets. Plain-HTTP targets routed through the proxy keep using the
//! proxy connection itself with absolute-form request lines.

pub mod no_proxy;

pub use no_proxy::NoProxyResolver;

use crate::common::net::{configure_tcp_stream, find_header_end};
use crate::common::CompleteUrl;
use crate::settings::Settings;
use crate::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Connection timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved outbound route for a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Via(CompleteUrl),
}

impl Route {
    pub fn is_via_proxy(&self) -> bool {
        matches!(self, Route::Via(_))
    }
}

/// An established upstream connection plus how it was routed.
pub struct UpstreamLink {
    pub stream: TcpStream,
    pub route: Route,
    /// True when request lines must use absolute form (plain HTTP through
    /// the upstream proxy).
    pub absolute_form: bool,
}

/// Routes targets according to HTTP_PROXY / HTTPS_PROXY / NO_PROXY.
#[derive(Debug, Default)]
pub struct UpstreamProxyManager {
    http_proxy: Option<CompleteUrl>,
    https_proxy: Option<CompleteUrl>,
    no_proxy: NoProxyResolver,
}

impl UpstreamProxyManager {
    pub fn from_settings(settings: &Settings) -> Self {
        UpstreamProxyManager {
            http_proxy: settings.http_proxy.clone(),
            https_proxy: settings.https_proxy.clone(),
            no_proxy: NoProxyResolver::new(settings.no_proxy.as_deref()),
        }
    }

    /// Resolve the route for `target`. HTTPS_PROXY overrides HTTP_PROXY for
    /// TLS targets; a lone HTTPS_PROXY never captures plain-HTTP targets.
    pub fn resolve(&self, target: &CompleteUrl, is_ssl: bool) -> Route {
        if self.no_proxy.bypasses(target) {
            return Route::Direct;
        }
        let proxy = if is_ssl {
            self.https_proxy.as_ref().or(self.http_proxy.as_ref())
        } else {
            self.http_proxy.as_ref()
        };
        match proxy {
            Some(url) => Route::Via(url.clone()),
            None => Route::Direct,
        }
    }

    /// Open a connection able to carry requests for `target`.
    pub async fn open(&self, target: &CompleteUrl) -> Result<UpstreamLink> {
        let route = self.resolve(target, target.is_https());

        match &route {
            Route::Direct => {
                let stream = dial(&target.host_with_port()).await?;
                debug!("Direct connection to {}", target.host_with_port());
                Ok(UpstreamLink {
                    stream,
                    route,
                    absolute_form: false,
                })
            }
            Route::Via(proxy) => {
                let mut stream = dial(&proxy.host_with_port()).await?;
                if target.is_https() {
                    // TLS targets tunnel through the proxy with CONNECT
                    http_connect(&mut stream, target.host(), target.port()).await?;
                    debug!(
                        "CONNECT tunnel to {} via {}",
                        target.host_with_port(),
                        proxy.host_with_port()
                    );
                    Ok(UpstreamLink {
                        stream,
                        route,
                        absolute_form: false,
                    })
                } else {
                    debug!(
                        "Forwarding {} via {}",
                        target.host_with_port(),
                        proxy.host_with_port()
                    );
                    Ok(UpstreamLink {
                        stream,
                        route,
                        absolute_form: true,
                    })
                }
            }
        }
    }
}

async fn dial(authority: &str) -> Result<TcpStream> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(authority))
        .await
        .map_err(|_| Error::timeout(format!("Connection to {} timed out", authority)))?
        .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", authority, e)))?;
    configure_tcp_stream(&stream);
    Ok(stream)
}

/// Perform an HTTP CONNECT handshake on an open proxy connection.
async fn http_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    let request = format!(
        "CONNECT {}:{} HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Proxy-Connection: keep-alive\r\n\r\n",
        host, port, host, port
    );

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::connection(format!("Failed to send CONNECT request: {}", e)))?;
    stream.flush().await?;

    let mut response = [0u8; 1024];
    let mut total_read = 0;

    loop {
        let n = stream
            .read(&mut response[total_read..])
            .await
            .map_err(|e| Error::connection(format!("Failed to read CONNECT response: {}", e)))?;
        if n == 0 {
            return Err(Error::connection("Connection closed during CONNECT"));
        }
        total_read += n;

        if let Some(header_end) = find_header_end(&response[..total_read]) {
            let head = String::from_utf8_lossy(&response[..header_end]);
            let status_line = head.lines().next().unwrap_or("");
            if status_line.contains(" 200") {
                return Ok(());
            }
            return Err(Error::connection(format!("CONNECT failed: {}", status_line)));
        }

        if total_read >= response.len() {
            return Err(Error::connection("CONNECT response too large"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(http: Option<&str>, https: Option<&str>, no_proxy: Option<&str>) -> UpstreamProxyManager {
        UpstreamProxyManager {
            http_proxy: http.map(|u| CompleteUrl::parse(u).unwrap()),
            https_proxy: https.map(|u| CompleteUrl::parse(u).unwrap()),
            no_proxy: NoProxyResolver::new(no_proxy),
        }
    }

    fn target(url: &str) -> CompleteUrl {
        CompleteUrl::parse(url).unwrap()
    }

    #[test]
    fn test_no_proxy_configured_goes_direct() {
        let m = manager(None, None, None);
        assert_eq!(m.resolve(&target("http://example.com"), false), Route::Direct);
        assert_eq!(m.resolve(&target("https://example.com"), true), Route::Direct);
    }

    #[test]
    fn test_http_proxy_applies_to_both_schemes() {
        let m = manager(Some("http://proxy:3128"), None, Some("<-loopback>"));
        assert!(m.resolve(&target("http://example.com"), false).is_via_proxy());
        assert!(m.resolve(&target("https://example.com"), true).is_via_proxy());
    }

    #[test]
    fn test_https_proxy_overrides_for_ssl() {
        let m = manager(
            Some("http://proxy:3128"),
            Some("http://sslproxy:3129"),
            Some("<-loopback>"),
        );
        match m.resolve(&target("https://example.com"), true) {
            Route::Via(proxy) => assert_eq!(proxy.host(), "sslproxy"),
            Route::Direct => panic!("expected proxy route"),
        }
        match m.resolve(&target("http://example.com"), false) {
            Route::Via(proxy) => assert_eq!(proxy.host(), "proxy"),
            Route::Direct => panic!("expected proxy route"),
        }
    }

    #[test]
    fn test_https_proxy_alone_leaves_plain_http_direct() {
        let m = manager(None, Some("http://sslproxy:3129"), Some("<-loopback>"));
        assert_eq!(m.resolve(&target("http://example.com"), false), Route::Direct);
        assert!(m.resolve(&target("https://example.com"), true).is_via_proxy());
    }

    #[test]
    fn test_no_proxy_forces_direct() {
        let m = manager(Some("http://proxy:3128"), None, Some("localhost"));
        assert_eq!(m.resolve(&target("http://localhost:5000"), false), Route::Direct);
        assert!(m.resolve(&target("http://example.com"), false).is_via_proxy());
    }
}
