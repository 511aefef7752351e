//! Per-connection state
//!
//! Every downstream socket gets exactly one [`ConnectionContext`], keyed by
//! the client address. The context records the NTLM handshake phase per
//! upstream origin (one downstream connection can reach several origins
//! when an upstream proxy multiplexes) and the pinned peer certificate
//! fingerprint for TLS origins.

mod manager;

pub use manager::ConnectionContextManager;

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Phase of the NTLM handshake on one upstream origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Idle,
    Type1Sent,
    Type2Received,
    Type3Sent,
    Authenticated,
    Failed,
}

/// State for one downstream TCP connection.
pub struct ConnectionContext {
    id: String,
    client_addr: SocketAddr,
    config_api: AtomicBool,
    created_at: DateTime<Utc>,
    states: Mutex<HashMap<String, HandshakeState>>,
    fingerprints: Mutex<HashMap<String, String>>,
}

impl ConnectionContext {
    pub fn new(client_addr: SocketAddr) -> Self {
        ConnectionContext {
            id: uuid::Uuid::new_v4().to_string(),
            client_addr,
            config_api: AtomicBool::new(false),
            created_at: Utc::now(),
            states: Mutex::new(HashMap::new()),
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Flag this context as serving config-API traffic, exempting it from
    /// reset teardown.
    pub fn mark_config_api(&self) {
        self.config_api.store(true, Ordering::SeqCst);
    }

    pub fn is_config_api(&self) -> bool {
        self.config_api.load(Ordering::SeqCst)
    }

    pub fn state(&self, origin: &str) -> HandshakeState {
        self.states
            .lock()
            .map(|m| m.get(origin).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn set_state(&self, origin: &str, state: HandshakeState) {
        if let Ok(mut map) = self.states.lock() {
            map.insert(origin.to_string(), state);
        }
    }

    /// Drop all handshake state, forcing fresh authentication.
    pub fn reset_states(&self) {
        if let Ok(mut map) = self.states.lock() {
            map.clear();
        }
    }

    /// Pin (or verify against the pinned) peer certificate fingerprint for
    /// a TLS origin. A mismatch on reconnect is fatal for the context.
    pub fn pin_fingerprint(&self, origin: &str, fingerprint: &str) -> Result<()> {
        let mut map = self
            .fingerprints
            .lock()
            .map_err(|_| Error::internal("fingerprint lock poisoned"))?;
        match map.get(origin) {
            Some(pinned) if pinned != fingerprint => Err(Error::tls(format!(
                "Peer certificate changed for {}: pinned {}, got {}",
                origin, pinned, fingerprint
            ))),
            Some(_) => Ok(()),
            None => {
                map.insert(origin.to_string(), fingerprint.to_string());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:50001".parse().unwrap()
    }

    #[test]
    fn test_state_defaults_to_idle() {
        let ctx = ConnectionContext::new(addr());
        assert_eq!(ctx.state("http://host:80"), HandshakeState::Idle);
    }

    #[test]
    fn test_state_is_per_origin() {
        let ctx = ConnectionContext::new(addr());
        ctx.set_state("http://a:80", HandshakeState::Authenticated);
        assert_eq!(ctx.state("http://a:80"), HandshakeState::Authenticated);
        assert_eq!(ctx.state("http://b:80"), HandshakeState::Idle);

        ctx.reset_states();
        assert_eq!(ctx.state("http://a:80"), HandshakeState::Idle);
    }

    #[test]
    fn test_config_api_flag() {
        let ctx = ConnectionContext::new(addr());
        assert!(!ctx.is_config_api());
        ctx.mark_config_api();
        assert!(ctx.is_config_api());
    }

    #[test]
    fn test_fingerprint_pinning() {
        let ctx = ConnectionContext::new(addr());
        ctx.pin_fingerprint("https://host:443", "aa:bb").unwrap();
        ctx.pin_fingerprint("https://host:443", "aa:bb").unwrap();
        assert!(ctx.pin_fingerprint("https://host:443", "cc:dd").is_err());
    }
}
