//! Axum HTTP handlers for the Custodia server.
//!
//! Provides the JSON-RPC proxy, health and discovery endpoints, the claims
//! endpoint a relying application calls once consent is granted, and a
//! revoke endpoint for the user's connections page.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::warn;

use crate::{handle_request_as, rpc_codes, Caller, JsonRpcRequest, JsonRpcResponse, RootState};
use custodia_core::{ClientId, CustodiaError, UserId};

/// Header the fronting authentication layer sets to the signed-in user.
pub const AUTHENTICATED_USER_HEADER: &str = "x-authenticated-user";

/// Shared application state for Axum handlers.
pub struct AppState {
    pub root: RootState,
}

/// Build the Axum router with all endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/health", get(handle_health))
        .route("/.well-known/custodia.json", get(handle_well_known))
        .route("/userinfo/{client_id}", get(handle_userinfo))
        .route("/consent/{client_id}/revoke", post(handle_revoke))
        .with_state(state)
}

/// HTTP status for an engine error.
pub fn status_for(err: &CustodiaError) -> StatusCode {
    match err {
        CustodiaError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CustodiaError::AccessDenied => StatusCode::FORBIDDEN,
        CustodiaError::Configuration(_) => StatusCode::BAD_REQUEST,
        CustodiaError::Conflict(_) => StatusCode::CONFLICT,
        CustodiaError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(err: &CustodiaError) -> (StatusCode, Json<serde_json::Value>) {
    let mut body = serde_json::json!({
        "error": err.kind().to_string(),
        "message": err.to_string(),
    });
    if !err.issues().is_empty() {
        body["issues"] = serde_json::to_value(err.issues()).unwrap_or_default();
    }
    (status_for(err), Json(body))
}

fn not_initialized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({"error": "root not initialized"})),
    )
}

fn authenticated_user(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(AUTHENTICATED_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(UserId::new)
}

fn unauthenticated() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "missing authenticated user"})),
    )
}

/// HTTP status for a JSON-RPC response. Only session failures leave 200.
fn rpc_status(response: &JsonRpcResponse) -> StatusCode {
    match response.error.as_ref().map(|e| e.code) {
        Some(rpc_codes::UNAUTHENTICATED) => StatusCode::UNAUTHORIZED,
        Some(rpc_codes::SESSION_MISMATCH) => StatusCode::FORBIDDEN,
        _ => StatusCode::OK,
    }
}

/// POST /rpc -- JSON-RPC proxy acting as the authenticated user
async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> (StatusCode, Json<JsonRpcResponse>) {
    let caller = Caller::Session(authenticated_user(&headers));
    let response = handle_request_as(&state.root, &request, &caller);
    (rpc_status(&response), Json(response))
}

/// GET /health -- server info
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut health = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "initialized": state.root.is_initialized(),
    });
    if let Some(engine) = &state.root.engine {
        health["audit_entries"] = serde_json::json!(engine.audit.len());
        health["applications"] = serde_json::json!(state.root.config.applications.len());
    }
    Json(health)
}

/// GET /.well-known/custodia.json -- service discovery
async fn handle_well_known(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(engine) = &state.root.engine else {
        return not_initialized();
    };
    let scopes: Vec<&str> = engine
        .catalog
        .definitions()
        .iter()
        .map(|d| d.scope_name.as_str())
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "scopes_supported": scopes,
            "claims_namespace": state.root.config.server.claims_namespace,
            "endpoints": {
                "rpc": "/rpc",
                "userinfo": "/userinfo/{client_id}",
                "revoke": "/consent/{client_id}/revoke",
            },
        })),
    )
}

/// GET /userinfo/{client_id} -- claims for the authenticated user, nested
/// under the configured namespace.
async fn handle_userinfo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    let Some(engine) = &state.root.engine else {
        return not_initialized();
    };
    let Some(user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    let client_id = ClientId::new(client_id);

    match engine.assembler.assemble(&user_id, &client_id) {
        Ok(claims) => {
            let mut body = serde_json::Map::new();
            body.insert("sub".into(), serde_json::json!(user_id.as_str()));
            body.insert(
                state.root.config.server.claims_namespace.clone(),
                serde_json::json!(claims),
            );
            (StatusCode::OK, Json(serde_json::Value::Object(body)))
        }
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "userinfo refused");
            error_body(&e)
        }
    }
}

/// POST /consent/{client_id}/revoke -- withdraw the authenticated user's
/// consent for one application.
async fn handle_revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    let Some(engine) = &state.root.engine else {
        return not_initialized();
    };
    let Some(user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };

    match engine.manager.revoke(&user_id, &ClientId::new(client_id)) {
        Ok(record) => (
            StatusCode::OK,
            Json(serde_json::json!({ "revoked": record.is_some() })),
        ),
        Err(e) => error_body(&e),
    }
}
