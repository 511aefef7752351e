//! NO_PROXY bypass resolution
//!
//! Decides whether a target skips the configured upstream proxy. Tokens
//! are comma separated: `*` bypasses everything, a leading `*` is a
//! suffix match, a trailing `*` is a prefix match, and anything else is an
//! exact host match with an optional `:port`. `localhost` and `127.0.0.1`
//! are always bypassed unless the special `<-loopback>` token appears.

use crate::common::CompleteUrl;

const LOOPBACK_OPT_OUT: &str = "<-loopback>";

#[derive(Debug, Default)]
pub struct NoProxyResolver {
    tokens: Vec<String>,
    bypass_all: bool,
    loopback_bypass: bool,
}

impl NoProxyResolver {
    pub fn new(no_proxy: Option<&str>) -> Self {
        let mut tokens = Vec::new();
        let mut bypass_all = false;
        let mut loopback_bypass = true;

        if let Some(raw) = no_proxy {
            for token in raw.split(',') {
                let token = token.trim().to_ascii_lowercase();
                if token.is_empty() {
                    continue;
                }
                if token == LOOPBACK_OPT_OUT {
                    loopback_bypass = false;
                } else if token == "*" {
                    bypass_all = true;
                } else {
                    tokens.push(token);
                }
            }
        }

        NoProxyResolver {
            tokens,
            bypass_all,
            loopback_bypass,
        }
    }

    /// True when the target must be dialed directly.
    pub fn bypasses(&self, target: &CompleteUrl) -> bool {
        if self.bypass_all {
            return true;
        }

        let host = target.host();
        if self.loopback_bypass && (host == "localhost" || host == "127.0.0.1") {
            return true;
        }

        self.tokens.iter().any(|token| token_matches(token, target))
    }
}

fn token_matches(token: &str, target: &CompleteUrl) -> bool {
    let host = target.host();

    if let Some(suffix) = token.strip_prefix('*') {
        return host.ends_with(suffix);
    }
    if let Some(prefix) = token.strip_suffix('*') {
        return host.starts_with(prefix);
    }

    // Exact token, optionally with a port
    match token.rsplit_once(':') {
        Some((token_host, token_port)) if token_port.bytes().all(|b| b.is_ascii_digit()) => {
            token_host == host && token_port.parse::<u16>().map(|p| p == target.port()).unwrap_or(false)
        }
        _ => token == host,
    }
}
