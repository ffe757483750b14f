//! HTTP server for the account-linking webhook, using Axum.

use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use courier_core::config::GatewayConfig;
use courier_core::error::Result;

use crate::link::LinkService;

/// Shared state for the webhook routes.
pub struct AppState {
    pub links: Arc<LinkService>,
    /// Checked against the `secret` query parameter before any update
    /// parsing. `None` skips verification.
    pub webhook_secret: Option<String>,
}

/// Does the request's query string carry the configured secret?
fn secret_matches(expected: Option<&str>, query: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let Some(query) = query else {
        return false;
    };
    query
        .split('&')
        .any(|pair| pair.strip_prefix("secret=") == Some(expected))
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({"ok": false, "error": "invalid webhook secret"})),
    )
        .into_response()
}

fn ok() -> Response {
    Json(serde_json::json!({"ok": true})).into_response()
}

/// Liveness/verification probe.
async fn webhook_probe(State(state): State<Arc<AppState>>, RawQuery(query): RawQuery) -> Response {
    if !secret_matches(state.webhook_secret.as_deref(), query.as_deref()) {
        return forbidden();
    }
    ok()
}

/// Inbound webhook update. Past the secret gate the response is always a
/// success acknowledgment: a business-logic failure must not look like a
/// delivery failure to the platform, or it will retry the update forever.
async fn webhook_inbound(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    if !secret_matches(state.webhook_secret.as_deref(), query.as_deref()) {
        return forbidden();
    }
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(update) => {
            state.links.handle_update(&update).await;
        }
        Err(e) => tracing::debug!("ignoring unparseable webhook body: {e}"),
    }
    ok()
}

/// Build the Axum router with the webhook mounted at `webhook_path`.
pub fn build_router(state: Arc<AppState>, webhook_path: &str) -> Router {
    Router::new()
        .route(webhook_path, get(webhook_probe).post(webhook_inbound))
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn start(config: &GatewayConfig, links: Arc<LinkService>) -> Result<()> {
    let state = Arc::new(AppState {
        links,
        webhook_secret: config.webhook_secret.clone(),
    });
    if state.webhook_secret.is_none() {
        tracing::warn!(
            "no webhook secret configured, inbound updates are accepted unverified"
        );
    }
    let app = build_router(state, &config.webhook_path);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("webhook gateway listening on http://{addr}{}", config.webhook_path);

    axum::serve(listener, app).await?;
    Ok(())
}
