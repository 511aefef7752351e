//! Target URL normalization

use crate::{Error, Result};
use std::fmt;
use url::Url;

/// URL scheme accepted by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved target URL: scheme, host, and a port defaulted from the
/// scheme when absent. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompleteUrl {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl CompleteUrl {
    /// Parse an absolute http/https URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed = Url::parse(raw)?;
        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(Error::url(format!("Unsupported scheme: {}", other))),
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::url(format!("Missing host in {}", raw)))?
            .to_ascii_lowercase();
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());

        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        if path.is_empty() {
            path.push('/');
        }

        Ok(CompleteUrl {
            scheme,
            host,
            port,
            path,
        })
    }

    /// Build from a bare host and port (CONNECT authority form).
    pub fn from_host_port(host: &str, port: u16, is_ssl: bool) -> Self {
        CompleteUrl {
            scheme: if is_ssl { Scheme::Https } else { Scheme::Http },
            host: host.to_ascii_lowercase(),
            port,
            path: "/".to_string(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// `host:port`, the authority used for dialing and pattern matching.
    pub fn host_with_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `scheme://host:port`, the key for per-origin connection state.
    pub fn origin(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Full textual form.
    pub fn href(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }

    /// True for loopback targets.
    pub fn is_localhost(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1" | "[::1]")
    }
}

impl fmt::Display for CompleteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.href())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let u = CompleteUrl::parse("http://example.com/get").unwrap();
        assert_eq!(u.port(), 80);
        assert_eq!(u.host_with_port(), "example.com:80");

        let u = CompleteUrl::parse("https://example.com").unwrap();
        assert_eq!(u.port(), 443);
        assert_eq!(u.path(), "/");
    }

    #[test]
    fn test_explicit_port_and_query() {
        let u = CompleteUrl::parse("http://host:8080/a/b?x=1").unwrap();
        assert_eq!(u.port(), 8080);
        assert_eq!(u.path(), "/a/b?x=1");
        assert_eq!(u.origin(), "http://host:8080");
    }

    #[test]
    fn test_localhost_detection() {
        assert!(CompleteUrl::parse("http://localhost:3000").unwrap().is_localhost());
        assert!(CompleteUrl::parse("http://127.0.0.1:3000").unwrap().is_localhost());
        assert!(CompleteUrl::parse("http://LOCALHOST:3000").unwrap().is_localhost());
        assert!(!CompleteUrl::parse("http://myhost:3000").unwrap().is_localhost());
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(CompleteUrl::parse("ftp://example.com").is_err());
        assert!(CompleteUrl::parse("not a url").is_err());
    }

    #[test]
    fn test_from_host_port() {
        let u = CompleteUrl::from_host_port("Secure.Example.com", 443, true);
        assert!(u.is_https());
        assert_eq!(u.host(), "secure.example.com");
    }
}
