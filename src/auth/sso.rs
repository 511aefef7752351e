//! Single sign-on token source
//!
//! On Windows the handshake tokens come from SSPI via `winauth`, using the
//! credentials of the logged-on user; no password crosses the wire or the
//! configuration. On other platforms SSO is unsupported and configuration
//! attempts are rejected.

use crate::Result;

/// Whether this build can perform SSO authentication.
pub fn supported() -> bool {
    cfg!(windows)
}

#[cfg(windows)]
pub use windows_impl::SsoHandshake;

#[cfg(not(windows))]
pub use stub_impl::SsoHandshake;

#[cfg(windows)]
mod windows_impl {
    use crate::{Error, Result};
    use winauth::windows::NtlmSspiBuilder;
    use winauth::NextBytes;

    /// One SSPI-backed handshake, producing the raw token for each leg.
    pub struct SsoHandshake {
        inner: winauth::windows::NtlmSspi,
    }

    impl SsoHandshake {
        pub fn new(target_host: &str) -> Result<Self> {
            let inner = NtlmSspiBuilder::new()
                .outbound()
                .target_spn(&format!("HTTP/{}", target_host))
                .build()
                .map_err(|e| Error::handshake(format!("SSPI init failed: {}", e)))?;
            Ok(SsoHandshake { inner })
        }

        /// Token for the negotiate leg.
        pub fn initial_token(&mut self) -> Result<Vec<u8>> {
            self.next(None)
        }

        /// Token answering the server challenge.
        pub fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
            self.next(Some(challenge))
        }

        fn next(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>> {
            match self.inner.next_bytes(input) {
                Ok(Some(token)) => Ok(token),
                Ok(None) => Err(Error::handshake("SSPI produced no token")),
                Err(e) => Err(Error::handshake(format!("SSPI error: {}", e))),
            }
        }
    }
}

#[cfg(not(windows))]
mod stub_impl {
    use crate::{Error, Result};

    /// Placeholder on platforms without SSPI; construction always fails.
    pub struct SsoHandshake {
        _private: (),
    }

    impl SsoHandshake {
        pub fn new(_target_host: &str) -> Result<Self> {
            Err(Error::unsupported("SSO is only available on Windows"))
        }

        pub fn initial_token(&mut self) -> Result<Vec<u8>> {
            Err(Error::unsupported("SSO is only available on Windows"))
        }

        pub fn respond(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
            Err(Error::unsupported("SSO is only available on Windows"))
        }
    }
}

/// Convenience wrapper returning a configuration error when SSO cannot be
/// honored on this platform.
pub fn ensure_supported() -> Result<()> {
    if supported() {
        Ok(())
    } else {
        Err(crate::Error::config(
            "SSO is not supported on this platform",
        ))
    }
}
