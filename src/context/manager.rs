//! Lifecycle of connection contexts and opaque tunnels

use super::ConnectionContext;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info};

struct ContextEntry {
    context: Arc<ConnectionContext>,
    abort: AbortHandle,
}

struct TunnelEntry {
    target: String,
    close: Arc<Notify>,
}

/// Owns every live [`ConnectionContext`] and every opaque CONNECT tunnel.
///
/// Contexts are registered by the proxy listener together with the abort
/// handle of their serving task; destroying a context aborts the task,
/// which drops (and thereby closes) its upstream sockets. Entries are
/// detached from the tables before aborting so that task-exit cleanup
/// cannot re-enter the removal path.
#[derive(Default)]
pub struct ConnectionContextManager {
    contexts: DashMap<SocketAddr, ContextEntry>,
    tunnels: DashMap<SocketAddr, TunnelEntry>,
}

impl ConnectionContextManager {
    pub fn new() -> Self {
        ConnectionContextManager {
            contexts: DashMap::new(),
            tunnels: DashMap::new(),
        }
    }

    /// Track a context for the lifetime of its serving task.
    pub fn register(
        &self,
        addr: SocketAddr,
        context: Arc<ConnectionContext>,
        abort: AbortHandle,
    ) {
        debug!("[{}] Tracking connection context for {}", context.id(), addr);
        self.contexts.insert(addr, ContextEntry { context, abort });
    }

    pub fn lookup(&self, addr: SocketAddr) -> Option<Arc<ConnectionContext>> {
        self.contexts.get(&addr).map(|e| e.context.clone())
    }

    /// Untrack without aborting; called by the serving task itself when the
    /// downstream socket closes.
    pub fn deregister(&self, addr: SocketAddr) {
        if let Some((_, entry)) = self.contexts.remove(&addr) {
            debug!("[{}] Connection context for {} closed", entry.context.id(), addr);
        }
    }

    /// Destroy one context: untrack it and abort its serving task.
    pub fn remove(&self, addr: SocketAddr, reason: &str) {
        if let Some((_, entry)) = self.contexts.remove(&addr) {
            info!(
                "[{}] Destroying connection context for {} ({})",
                entry.context.id(),
                addr,
                reason
            );
            entry.abort.abort();
        }
    }

    /// Destroy every tracked context except those serving config-API
    /// traffic. Returns the number destroyed.
    pub fn remove_all(&self, reason: &str) -> usize {
        let victims: Vec<SocketAddr> = self
            .contexts
            .iter()
            .filter(|e| !e.context.is_config_api())
            .map(|e| *e.key())
            .collect();

        let mut removed = 0;
        for addr in victims {
            if let Some((_, entry)) = self.contexts.remove(&addr) {
                entry.abort.abort();
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Destroyed {} connection contexts ({})", removed, reason);
        }
        removed
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Track an opaque CONNECT passthrough. The returned notifier is
    /// watched by the splice task; signalling it ends the tunnel.
    pub fn register_tunnel(&self, addr: SocketAddr, target: String) -> Arc<Notify> {
        let close = Arc::new(Notify::new());
        debug!("Tracking tunnel {} -> {}", addr, target);
        self.tunnels.insert(
            addr,
            TunnelEntry {
                target,
                close: close.clone(),
            },
        );
        close
    }

    pub fn deregister_tunnel(&self, addr: SocketAddr) {
        if let Some((_, entry)) = self.tunnels.remove(&addr) {
            debug!("Tunnel {} -> {} closed", addr, entry.target);
        }
    }

    pub fn remove_tunnel(&self, addr: SocketAddr, reason: &str) {
        if let Some((_, entry)) = self.tunnels.remove(&addr) {
            info!("Ending tunnel {} -> {} ({})", addr, entry.target, reason);
            entry.close.notify_one();
        }
    }

    /// End every tracked tunnel. Returns the number signalled.
    pub fn remove_all_tunnels(&self, reason: &str) -> usize {
        let victims: Vec<SocketAddr> = self.tunnels.iter().map(|e| *e.key()).collect();
        let mut removed = 0;
        for addr in victims {
            if let Some((_, entry)) = self.tunnels.remove(&addr) {
                entry.close.notify_one();
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Ended {} tunnels ({})", removed, reason);
        }
        removed
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_lookup_deregister() {
        let manager = ConnectionContextManager::new();
        let ctx = Arc::new(ConnectionContext::new(addr(50001)));
        let task = tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(60)).await });
        manager.register(addr(50001), ctx.clone(), task.abort_handle());

        assert_eq!(manager.context_count(), 1);
        assert!(manager.lookup(addr(50001)).is_some());
        assert!(manager.lookup(addr(50002)).is_none());

        manager.deregister(addr(50001));
        assert_eq!(manager.context_count(), 0);
        task.abort();
    }

    #[tokio::test]
    async fn test_remove_all_spares_config_api() {
        let manager = ConnectionContextManager::new();

        let plain = Arc::new(ConnectionContext::new(addr(50001)));
        let api = Arc::new(ConnectionContext::new(addr(50002)));
        api.mark_config_api();

        let t1 = tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(60)).await });
        let t2 = tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(60)).await });
        manager.register(addr(50001), plain, t1.abort_handle());
        manager.register(addr(50002), api, t2.abort_handle());

        let removed = manager.remove_all("reset");
        assert_eq!(removed, 1);
        assert_eq!(manager.context_count(), 1);
        assert!(manager.lookup(addr(50002)).is_some());
        t1.abort();
        t2.abort();
    }

    #[tokio::test]
    async fn test_tunnel_registry() {
        let manager = ConnectionContextManager::new();
        let close = manager.register_tunnel(addr(50003), "example.com:443".to_string());
        assert_eq!(manager.tunnel_count(), 1);

        let notified = close.notified();
        assert_eq!(manager.remove_all_tunnels("shutdown"), 1);
        notified.await;
        assert_eq!(manager.tunnel_count(), 0);
    }
}
