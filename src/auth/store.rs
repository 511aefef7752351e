//! In-memory credential store

use super::pattern::{best_match, HostPattern};
use super::Credentials;

/// Ordered mapping of host patterns to credentials. Re-adding a pattern
/// overwrites the existing entry in place; lookups use pattern precedence,
/// not insertion order.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: Vec<(HostPattern, Credentials)>,
}

impl CredentialStore {
    pub fn new() -> Self {
        CredentialStore { entries: Vec::new() }
    }

    /// Insert or overwrite the entry for `pattern`.
    pub fn upsert(&mut self, pattern: HostPattern, credentials: Credentials) {
        let key = pattern.key();
        if let Some(entry) = self.entries.iter_mut().find(|(p, _)| p.key() == key) {
            entry.1 = credentials;
        } else {
            self.entries.push((pattern, credentials));
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Credentials for `host:port` according to pattern precedence.
    pub fn find(&self, host: &str, port: u16) -> Option<&Credentials> {
        let winner = best_match(self.entries.iter().map(|(p, _)| p), host, port)?;
        let key = winner.key();
        self.entries
            .iter()
            .find(|(p, _)| p.key() == key)
            .map(|(_, c)| c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ExplicitCredentials, NtlmVersion};

    fn explicit(user: &str) -> Credentials {
        Credentials::Explicit(ExplicitCredentials {
            username: user.to_string(),
            password: "pw".to_string(),
            domain: None,
            workstation: None,
            version: NtlmVersion::V2,
        })
    }

    fn username(c: &Credentials) -> &str {
        match c {
            Credentials::Explicit(e) => &e.username,
            Credentials::Sso => "(sso)",
        }
    }

    #[test]
    fn test_upsert_overwrites_same_pattern() {
        let mut store = CredentialStore::new();
        store.upsert(HostPattern::parse("host").unwrap(), explicit("first"));
        store.upsert(HostPattern::parse("HOST").unwrap(), explicit("second"));
        assert_eq!(store.len(), 1);
        assert_eq!(username(store.find("host", 80).unwrap()), "second");
    }

    #[test]
    fn test_find_uses_precedence() {
        let mut store = CredentialStore::new();
        store.upsert(HostPattern::parse("*").unwrap(), explicit("fallback"));
        store.upsert(HostPattern::parse("host:8080").unwrap(), explicit("exact"));
        store.upsert(HostPattern::parse("host").unwrap(), explicit("anyport"));

        assert_eq!(username(store.find("host", 8080).unwrap()), "exact");
        assert_eq!(username(store.find("host", 80).unwrap()), "anyport");
        assert_eq!(username(store.find("other", 80).unwrap()), "fallback");
    }

    #[test]
    fn test_sso_entries() {
        let mut store = CredentialStore::new();
        store.upsert(HostPattern::parse("*.intranet").unwrap(), Credentials::Sso);
        assert!(store.find("app.intranet", 443).unwrap().is_sso());
        assert!(store.find("app.example.com", 443).is_none());
    }

    #[test]
    fn test_clear() {
        let mut store = CredentialStore::new();
        store.upsert(HostPattern::parse("host").unwrap(), explicit("u"));
        assert!(!store.is_empty());
        store.clear();
        assert!(store.is_empty());
        assert!(store.find("host", 80).is_none());
    }
}
