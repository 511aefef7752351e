//! TLS termination and upstream TLS clients
//!
//! The relay carries its own certificate authority for terminating CONNECT
//! tunnels to NTLM-configured hosts. The CA key pair and the per-host leaf
//! certificates are cached in a hidden directory under the working
//! directory, so the user only has to trust one root across runs.

use crate::common::CompleteUrl;
use crate::settings::Settings;
use crate::{Error, Result};
use dashmap::DashMap;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Default on-disk location of the CA and leaf cache.
pub const DEFAULT_CERT_DIR: &str = ".ntlm-relay-certs";

/// CA plus per-host server config cache for tunnel termination.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    dir: PathBuf,
    configs: DashMap<String, Arc<ServerConfig>>,
}

impl CertificateAuthority {
    /// Load the CA from `dir`, generating and persisting a fresh one when
    /// none exists yet.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let cert_path = dir.join("ca.pem");
        let key_path = dir.join("ca-key.pem");

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = fs::read_to_string(&key_path)?;
            let key = KeyPair::from_pem(&key_pem)
                .map_err(|e| Error::tls(format!("Invalid CA key: {}", e)))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .map_err(|e| Error::tls(format!("Invalid CA certificate: {}", e)))?;
            let cert = params
                .self_signed(&key)
                .map_err(|e| Error::tls(format!("Failed to restore CA: {}", e)))?;
            debug!("Loaded CA from {}", dir.display());
            return Ok(CertificateAuthority {
                cert,
                key,
                dir: dir.to_path_buf(),
                configs: DashMap::new(),
            });
        }

        // A new root invalidates any cached leaves from a previous CA
        if dir.exists() {
            let _ = fs::remove_dir_all(dir);
        }

        let key = KeyPair::generate().map_err(|e| Error::tls(format!("Key generation failed: {}", e)))?;
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        params
            .distinguished_name
            .push(DnType::CommonName, "NTLM Relay CA");
        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::tls(format!("CA generation failed: {}", e)))?;

        fs::create_dir_all(dir)?;
        fs::write(&cert_path, cert.pem())?;
        fs::write(&key_path, key.serialize_pem())?;
        info!("Generated new CA in {}", dir.display());

        Ok(CertificateAuthority {
            cert,
            key,
            dir: dir.to_path_buf(),
            configs: DashMap::new(),
        })
    }

    /// Server config carrying a leaf certificate for `host`: taken from the
    /// in-memory cache, else reloaded from disk, else freshly generated.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.configs.get(host) {
            return Ok(config.clone());
        }

        let (cert_der, key_der) = match self.load_leaf(host) {
            Some(pair) => {
                debug!("Loaded cached certificate for {}", host);
                pair
            }
            None => self.generate_leaf(host)?,
        };
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| Error::tls(format!("Server config for {} failed: {}", host, e)))?;
        let config = Arc::new(config);
        self.configs.insert(host.to_string(), config.clone());
        Ok(config)
    }

    /// Read a previously generated leaf back from the disk cache.
    fn load_leaf(&self, host: &str) -> Option<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let cert_pem = fs::read(self.leaf_cert_path(host)).ok()?;
        let key_pem = fs::read(self.leaf_key_path(host)).ok()?;
        let cert = rustls_pemfile::certs(&mut &cert_pem[..]).next()?.ok()?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..]).ok().flatten()?;
        Some((cert, key))
    }

    fn generate_leaf(&self, host: &str) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| Error::tls(format!("Leaf params for {} failed: {}", host, e)))?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.distinguished_name.push(DnType::CommonName, host);

        let key_pair =
            KeyPair::generate().map_err(|e| Error::tls(format!("Key generation failed: {}", e)))?;
        let cert = params
            .signed_by(&key_pair, &self.cert, &self.key)
            .map_err(|e| Error::tls(format!("Leaf signing for {} failed: {}", host, e)))?;

        // Cache certificate and key so a restart serves the same leaf
        if let Err(e) = fs::write(self.leaf_cert_path(host), cert.pem())
            .and_then(|_| fs::write(self.leaf_key_path(host), key_pair.serialize_pem()))
        {
            warn!("Could not cache certificate for {}: {}", host, e);
        }

        let key_der = PrivateKeyDer::Pkcs8(key_pair.serialized_der().to_vec().into());
        Ok((cert.der().clone(), key_der))
    }

    fn leaf_cert_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{}.pem", host))
    }

    fn leaf_key_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{}-key.pem", host))
    }
}

/// Builds TLS connectors for upstream origins.
///
/// Certificates are verified against the bundled roots (plus any extra CA
/// bundle from the settings) unless verification is disabled globally;
/// self-signed certificates are always accepted for loopback targets.
pub struct TlsClientFactory {
    verified: Arc<ClientConfig>,
    insecure: Arc<ClientConfig>,
    reject_unauthorized: bool,
}

impl TlsClientFactory {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &settings.extra_ca_certs {
            let pem = fs::read(path)
                .map_err(|e| Error::config(format!("Cannot read {}: {}", path.display(), e)))?;
            let mut reader = std::io::BufReader::new(&pem[..]);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert
                    .map_err(|e| Error::config(format!("Invalid PEM in {}: {}", path.display(), e)))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::config(format!("Rejected CA in {}: {}", path.display(), e)))?;
            }
            info!("Merged extra CA bundle from {}", path.display());
        }

        let verified = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let insecure = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth();

        Ok(TlsClientFactory {
            verified: Arc::new(verified),
            insecure: Arc::new(insecure),
            reject_unauthorized: settings.reject_unauthorized,
        })
    }

    fn connector_for(&self, target: &CompleteUrl) -> TlsConnector {
        if !self.reject_unauthorized || target.is_localhost() {
            TlsConnector::from(self.insecure.clone())
        } else {
            TlsConnector::from(self.verified.clone())
        }
    }

    /// Wrap an open TCP connection in TLS for `target`.
    pub async fn connect(
        &self,
        target: &CompleteUrl,
        tcp: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let connector = self.connector_for(target);
        let server_name: ServerName<'static> = target
            .host()
            .to_string()
            .try_into()
            .map_err(|_| Error::tls(format!("Invalid server name: {}", target.host())))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::tls(format!("TLS handshake with {} failed: {}", target.host_with_port(), e)))
    }
}

/// SHA-256 fingerprint of the peer's leaf certificate.
pub fn peer_fingerprint(stream: &tokio_rustls::client::TlsStream<TcpStream>) -> Option<String> {
    let (_, session) = stream.get_ref();
    let cert = session.peer_certificates()?.first()?;
    Some(hex::encode(Sha256::digest(cert.as_ref())))
}

/// Certificate verifier that accepts any certificate
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
