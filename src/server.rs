//! HTTP listener: websocket endpoint, relay information document and health
//! check on a single port.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{relay::Relay, ws};

/// NIPs implemented by the transport.
pub const SUPPORTED_NIPS: [u32; 5] = [1, 9, 11, 42, 45];

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// NIP-11 relay information document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    /// Relay public key, hex.
    pub pubkey: String,
    pub contact: String,
    pub icon: String,
    /// URL of the relay software.
    pub software: String,
    pub version: String,
    pub supported_nips: Vec<u32>,
}

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(ws::handler))
        .route("/healthz", get(healthz))
        .with_state(relay)
}

/// Serve the relay on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {}", listener.local_addr()?);
    let app = router(relay).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Relay information for clients asking for `application/nostr+json`, a short
/// banner for everyone else.
pub(crate) fn describe(headers: &HeaderMap, info: &RelayInfo) -> Response {
    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/nostr+json"));
    if wants_info {
        (
            [
                (header::CONTENT_TYPE, "application/nostr+json"),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            ],
            Json(info.clone()),
        )
            .into_response()
    } else {
        format!(
            "{}\n{}\n\nThis is a Nostr relay. Connect with a Nostr client.\n",
            info.name, info.description
        )
        .into_response()
    }
}
