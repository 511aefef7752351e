//! Config control API
//!
//! A plain-HTTP listener on its own loopback port. Credentials are
//! upserted and cleared here; `/quit` begins graceful shutdown. Because
//! this listener is separate from the proxy port, its connections are
//! never tracked by the context manager and `/reset` can answer even
//! while it tears everything else down.

use crate::auth::{
    sso, CredentialStore, Credentials, ExplicitCredentials, HostPattern, NtlmVersion,
};
use crate::context::ConnectionContextManager;
use crate::{Result, VERSION};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tower_http::trace::TraceLayer;
use tracing::info;

/// API error response
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
        (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = std::result::Result<T, (StatusCode, Json<ApiError>)>;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RwLock<CredentialStore>>,
    pub contexts: Arc<ConnectionContextManager>,
    pub shutdown: broadcast::Sender<()>,
}

/// `POST /ntlm-config` body
#[derive(Debug, Deserialize)]
pub struct NtlmConfigBody {
    #[serde(rename = "ntlmHosts")]
    pub ntlm_hosts: Vec<String>,
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
    pub workstation: Option<String>,
    #[serde(rename = "ntlmVersion")]
    pub ntlm_version: Option<u8>,
}

/// `POST /ntlm-sso-config` body
#[derive(Debug, Deserialize)]
pub struct SsoConfigBody {
    #[serde(rename = "ntlmHosts")]
    pub ntlm_hosts: Vec<String>,
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/alive", get(alive))
        .route("/ntlm-config", post(ntlm_config))
        .route("/ntlm-sso-config", post(ntlm_sso_config))
        .route("/reset", post(reset))
        .route("/quit", post(quit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the config API server; resolves after graceful shutdown.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    let router = create_router(state);
    info!("Config API listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn alive() -> Json<Value> {
    Json(json!({ "version": VERSION }))
}

/// Parse and validate the host patterns of a config request.
fn parse_patterns(hosts: &[String]) -> std::result::Result<Vec<HostPattern>, String> {
    if hosts.is_empty() {
        return Err("ntlmHosts must not be empty".to_string());
    }
    hosts
        .iter()
        .map(|h| HostPattern::parse(h).map_err(|e| e.to_string()))
        .collect()
}

async fn ntlm_config(
    State(state): State<AppState>,
    Json(body): Json<NtlmConfigBody>,
) -> ApiResult<Json<Value>> {
    let patterns = parse_patterns(&body.ntlm_hosts).map_err(ApiError::bad_request)?;

    if body.username.trim().is_empty() {
        return Err(ApiError::bad_request("username must not be empty"));
    }
    let version = match body.ntlm_version {
        Some(v) => NtlmVersion::try_from(v).map_err(|e| ApiError::bad_request(e.to_string()))?,
        None => NtlmVersion::default(),
    };

    let credentials = Credentials::Explicit(ExplicitCredentials {
        username: body.username,
        password: body.password,
        domain: body.domain,
        workstation: body.workstation,
        version,
    });

    let mut store = state.store.write().await;
    for pattern in patterns {
        info!("Configured NTLM credentials for {}", pattern.as_str());
        store.upsert(pattern, credentials.clone());
    }

    Ok(Json(json!({ "message": "OK" })))
}

async fn ntlm_sso_config(
    State(state): State<AppState>,
    Json(body): Json<SsoConfigBody>,
) -> ApiResult<Json<Value>> {
    if !sso::supported() {
        return Err(ApiError::bad_request("SSO is not supported on this platform"));
    }
    let patterns = parse_patterns(&body.ntlm_hosts).map_err(ApiError::bad_request)?;

    let mut store = state.store.write().await;
    for pattern in patterns {
        info!("Configured SSO for {}", pattern.as_str());
        store.upsert(pattern, Credentials::Sso);
    }

    Ok(Json(json!({ "message": "OK" })))
}

/// Remove all credentials and tear down every tracked context and tunnel.
/// Config-API traffic survives: this listener is untracked, and proxied
/// connections flagged as config-API are skipped by the manager.
async fn reset(State(state): State<AppState>) -> Json<Value> {
    state.store.write().await.clear();
    let contexts = state.contexts.remove_all("reset");
    let tunnels = state.contexts.remove_all_tunnels("reset");
    info!("Reset complete ({} contexts, {} tunnels)", contexts, tunnels);
    Json(json!({ "message": "Reset complete" }))
}

async fn quit(State(state): State<AppState>) -> Json<Value> {
    info!("Quit requested, starting graceful shutdown");
    let _ = state.shutdown.send(());
    Json(json!({ "message": "Shutting down" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_state() -> AppState {
        let (shutdown, _) = broadcast::channel(1);
        AppState {
            store: Arc::new(RwLock::new(CredentialStore::new())),
            contexts: Arc::new(ConnectionContextManager::new()),
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_alive() {
        let response = alive().await;
        assert_eq!(response.0["version"], VERSION);
    }

    #[test]
    fn test_config_body_parsing() {
        let json = r#"{
            "ntlmHosts": ["host1", "*.intranet", "host2:8080"],
            "username": "alice",
            "password": "secret",
            "domain": "CORP",
            "ntlmVersion": 2
        }"#;
        let body: NtlmConfigBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.ntlm_hosts.len(), 3);
        assert_eq!(body.domain.as_deref(), Some("CORP"));
        assert_eq!(body.ntlm_version, Some(2));
        assert!(body.workstation.is_none());
    }

    #[test]
    fn test_parse_patterns_validation() {
        assert!(parse_patterns(&[]).is_err());
        assert!(parse_patterns(&["http://host".to_string()]).is_err());
        assert!(parse_patterns(&["*.wild:8080".to_string()]).is_err());
        assert!(parse_patterns(&["host:8080".to_string(), "*.intranet".to_string()]).is_ok());
    }

    #[tokio::test]
    async fn test_ntlm_config_upserts_all_patterns() {
        let state = app_state();
        let body = NtlmConfigBody {
            ntlm_hosts: vec!["host1".to_string(), "host2:8080".to_string()],
            username: "alice".to_string(),
            password: "secret".to_string(),
            domain: None,
            workstation: None,
            ntlm_version: None,
        };
        ntlm_config(State(state.clone()), Json(body)).await.unwrap();
        let store = state.store.read().await;
        assert_eq!(store.len(), 2);
        assert!(store.find("host1", 80).is_some());
        assert!(store.find("host2", 8080).is_some());
    }

    #[tokio::test]
    async fn test_ntlm_config_rejects_bad_version() {
        let state = app_state();
        let body = NtlmConfigBody {
            ntlm_hosts: vec!["host1".to_string()],
            username: "alice".to_string(),
            password: "secret".to_string(),
            domain: None,
            workstation: None,
            ntlm_version: Some(7),
        };
        assert!(ntlm_config(State(state), Json(body)).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_store() {
        let state = app_state();
        {
            let mut store = state.store.write().await;
            store.upsert(
                HostPattern::parse("host").unwrap(),
                Credentials::Sso,
            );
        }
        reset(State(state.clone())).await;
        assert!(state.store.read().await.is_empty());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_sso_config_rejected_off_windows() {
        let state = app_state();
        let body = SsoConfigBody {
            ntlm_hosts: vec!["host".to_string()],
        };
        let result = ntlm_sso_config(State(state), Json(body)).await;
        assert!(result.is_err());
        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quit_signals_shutdown() {
        let state = app_state();
        let mut rx = state.shutdown.subscribe();
        quit(State(state)).await;
        assert!(rx.try_recv().is_ok());
    }
}
