//! Credentials, host patterns, and the NTLM message engine

pub mod ntlm;
pub mod pattern;
pub mod sso;
pub mod store;

pub use pattern::{best_match, HostPattern};
pub use store::CredentialStore;

use crate::{Error, Result};

/// NTLM response scheme version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NtlmVersion {
    V1,
    #[default]
    V2,
}

impl TryFrom<u8> for NtlmVersion {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(NtlmVersion::V1),
            2 => Ok(NtlmVersion::V2),
            other => Err(Error::config(format!("ntlmVersion must be 1 or 2, got {}", other))),
        }
    }
}

/// Explicit username/password credentials.
#[derive(Debug, Clone)]
pub struct ExplicitCredentials {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
    pub workstation: Option<String>,
    pub version: NtlmVersion,
}

impl ExplicitCredentials {
    /// Domain to present: the configured one, else the target host's first
    /// DNS label uppercased (empty for bare hosts like IP literals).
    pub fn domain_for(&self, host: &str) -> String {
        if let Some(domain) = &self.domain {
            return domain.to_ascii_uppercase();
        }
        match host.split('.').next() {
            Some(label) if !label.is_empty() && label.bytes().any(|b| b.is_ascii_alphabetic()) => {
                label.to_ascii_uppercase()
            }
            _ => String::new(),
        }
    }

    /// Workstation to present: the configured one, else the OS hostname.
    pub fn workstation_name(&self) -> String {
        if let Some(ws) = &self.workstation {
            return ws.to_ascii_uppercase();
        }
        std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .map(|h| h.to_ascii_uppercase())
            .unwrap_or_default()
    }
}

/// A configured credential: explicit username/password, or the SSO marker
/// directing the engine to fetch tokens from the host OS.
#[derive(Debug, Clone)]
pub enum Credentials {
    Explicit(ExplicitCredentials),
    Sso,
}

impl Credentials {
    pub fn is_sso(&self) -> bool {
        matches!(self, Credentials::Sso)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntlm_version_parsing() {
        assert_eq!(NtlmVersion::try_from(1).unwrap(), NtlmVersion::V1);
        assert_eq!(NtlmVersion::try_from(2).unwrap(), NtlmVersion::V2);
        assert!(NtlmVersion::try_from(3).is_err());
        assert_eq!(NtlmVersion::default(), NtlmVersion::V2);
    }

    #[test]
    fn test_domain_default_from_host() {
        let creds = ExplicitCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            domain: None,
            workstation: None,
            version: NtlmVersion::V2,
        };
        assert_eq!(creds.domain_for("corp.example.com"), "CORP");
        assert_eq!(creds.domain_for("10.0.0.1"), "");
    }

    #[test]
    fn test_domain_explicit_uppercased() {
        let creds = ExplicitCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            domain: Some("mydomain".to_string()),
            workstation: None,
            version: NtlmVersion::V2,
        };
        assert_eq!(creds.domain_for("whatever"), "MYDOMAIN");
    }
}
