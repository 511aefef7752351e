//! Ports file handling
//!
//! Both listener URLs are published in a JSON file so the launcher and
//! the test runner plugin can find a running relay. The file is written
//! on successful startup and removed again on graceful shutdown.

use crate::common::CompleteUrl;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const PORTS_FILE_NAME: &str = "cypress-ntlm-auth.port";

/// Contents of the ports file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsFile {
    #[serde(rename = "configApiUrl")]
    pub config_api_url: String,
    #[serde(rename = "ntlmProxyUrl")]
    pub ntlm_proxy_url: String,
}

impl PortsFile {
    pub fn new(config_api_url: String, ntlm_proxy_url: String) -> Self {
        PortsFile {
            config_api_url,
            ntlm_proxy_url,
        }
    }

    /// Both URLs must parse with a scheme, host, and port.
    pub fn validate(&self) -> Result<()> {
        CompleteUrl::parse(&self.config_api_url)
            .map_err(|e| Error::config(format!("Invalid configApiUrl: {}", e)))?;
        CompleteUrl::parse(&self.ntlm_proxy_url)
            .map_err(|e| Error::config(format!("Invalid ntlmProxyUrl: {}", e)))?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let ports: PortsFile = serde_json::from_str(&raw)?;
        ports.validate()?;
        Ok(ports)
    }

    /// Remove the file; missing files are fine.
    pub fn delete(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Default ports file location under the user data directory.
pub fn default_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(PORTS_FILE_NAME)
}
