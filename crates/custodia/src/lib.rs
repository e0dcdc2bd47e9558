//! Custodia Root Library
//!
//! Configuration, engine wiring and the JSON-RPC surface of the consent and
//! claims-resolution engine. The binary and the HTTP layer are thin
//! wrappers over `handle_request_as`.
//!
//! # Architecture
//!
//! `initialize_root` validates the configuration, opens the stores and
//! builds an `Engine`. `handle_request` routes each JSON-RPC method to the
//! engine component that owns it. `shutdown_root` drops every handle.
//!
//! Every request runs on behalf of a `Caller`. The stdio transport is a
//! trusted local channel and takes `user_id` from the params. The HTTP
//! transport passes the authenticated session, which then decides the user.

pub mod config;
pub mod engine;
pub mod error;
pub mod http;

pub use config::{
    CatalogConfig, IntakeConfig, RootConfig, ServerConfig, StorageBackend, StorageConfig,
};
pub use engine::Engine;
pub use error::{RootError, RootResult};

use custodia_core::{
    AuditChainWriter, ClientId, CustodiaError, ScopeSet, Session, UserId,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// JSON-RPC types
// ---------------------------------------------------------------------------

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: serde_json::Value, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    pub fn error_with_data(
        id: serde_json::Value,
        code: i64,
        message: String,
        data: serde_json::Value,
    ) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: Some(data),
            }),
            id,
        }
    }

    /// Map an engine error onto its Custodia-specific code. Validation
    /// errors carry their issues in `data` so a form can be re-prompted.
    pub fn engine_error(id: serde_json::Value, err: &CustodiaError) -> Self {
        let mut data = serde_json::json!({ "kind": err.kind().to_string() });
        if let CustodiaError::Validation(issues) = err {
            data["issues"] = serde_json::to_value(issues).unwrap_or_default();
        }
        Self::error_with_data(id, rpc_codes::for_error(err), err.to_string(), data)
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC error codes (standard + Custodia-specific)
// ---------------------------------------------------------------------------

pub mod rpc_codes {
    use custodia_core::CustodiaError;

    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const VALIDATION_ERROR: i64 = -32001;
    pub const ACCESS_DENIED: i64 = -32002;
    pub const CONFIGURATION_ERROR: i64 = -32003;
    pub const CONFLICT: i64 = -32004;
    pub const STORAGE_ERROR: i64 = -32005;
    pub const UNAUTHENTICATED: i64 = -32006;
    pub const SESSION_MISMATCH: i64 = -32007;

    pub fn for_error(err: &CustodiaError) -> i64 {
        match err {
            CustodiaError::Validation(_) => VALIDATION_ERROR,
            CustodiaError::AccessDenied => ACCESS_DENIED,
            CustodiaError::Configuration(_) => CONFIGURATION_ERROR,
            CustodiaError::Conflict(_) => CONFLICT,
            CustodiaError::Storage(_) => STORAGE_ERROR,
        }
    }
}

// ---------------------------------------------------------------------------
// Root state
// ---------------------------------------------------------------------------

/// Runtime state for the Custodia root. Created by `initialize_root` and
/// consumed by `handle_request` and `shutdown_root`.
pub struct RootState {
    pub config: RootConfig,
    initialized: bool,
    pub engine: Option<Engine>,
}

impl RootState {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Validate the configuration, create the data directory when SQLite is
/// used, open the stores and wire the engine.
pub fn initialize_root(config: RootConfig) -> RootResult<RootState> {
    config.validate()?;

    info!(
        data_dir = %config.data_dir.display(),
        storage = ?config.storage.backend,
        applications = config.applications.len(),
        "initializing custodia root"
    );

    if config.storage.backend == StorageBackend::Sqlite {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            RootError::Internal(format!(
                "failed to create data directory {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;
    }

    let engine = Engine::build(&config)?;
    info!(
        scopes = engine.catalog.definitions().len(),
        "custodia root initialized"
    );

    Ok(RootState {
        config,
        initialized: true,
        engine: Some(engine),
    })
}

/// Release every engine handle. Idempotent.
pub fn shutdown_root(state: &mut RootState) -> RootResult<()> {
    if !state.initialized {
        return Ok(());
    }
    info!("shutting down custodia root");
    state.engine = None;
    state.initialized = false;
    Ok(())
}

/// On whose behalf a request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Local operator channel; `user_id` comes from the params.
    Trusted,
    /// Authenticated front end; `None` when nobody is signed in.
    Session(Option<UserId>),
}

impl Caller {
    /// The user a user-scoped method acts for. A session caller may omit
    /// `user_id` but never name someone else.
    fn user(&self, claimed: Option<UserId>) -> Result<UserId, Failure> {
        match self {
            Caller::Trusted => claimed
                .ok_or_else(|| Failure::Params("invalid params: missing field `user_id`".into())),
            Caller::Session(None) => Err(Failure::Unauthenticated),
            Caller::Session(Some(user)) => match claimed {
                Some(claimed) if &claimed != user => {
                    warn!(session = %user, claimed = %claimed, "user_id does not match session");
                    Err(Failure::SessionMismatch)
                }
                _ => Ok(user.clone()),
            },
        }
    }

    /// Checkpoint session. Without a signed-in user the checkpoint answers
    /// `unauthenticated` whatever the params claim.
    fn session(&self, claimed: Option<UserId>) -> Result<Session, Failure> {
        let user_id = match self {
            Caller::Trusted => claimed,
            Caller::Session(None) => None,
            Caller::Session(Some(_)) => Some(self.user(claimed)?),
        };
        Ok(Session { user_id })
    }
}

/// Route one JSON-RPC request from the trusted local channel.
pub fn handle_request(state: &RootState, request: &JsonRpcRequest) -> JsonRpcResponse {
    handle_request_as(state, request, &Caller::Trusted)
}

/// Route one JSON-RPC request to the engine component that owns the method.
pub fn handle_request_as(
    state: &RootState,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> JsonRpcResponse {
    let engine = match (&state.engine, state.is_initialized()) {
        (Some(engine), true) => engine,
        _ => {
            return JsonRpcResponse::error(
                request.id.clone(),
                rpc_codes::INTERNAL_ERROR,
                "root not initialized".into(),
            );
        }
    };

    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::error(
            request.id.clone(),
            rpc_codes::INVALID_REQUEST,
            format!("unsupported JSON-RPC version: {}", request.jsonrpc),
        );
    }

    info!(method = %request.method, "handling request");

    let outcome = match request.method.as_str() {
        "initialize" => Ok(handle_initialize()),
        "catalog/list" => Ok(serde_json::json!({ "scopes": engine.catalog.definitions() })),
        "ledger/resolve" => handle_ledger_resolve(engine, request, caller),
        "ledger/submit" => handle_ledger_submit(engine, request, caller),
        "ledger/history" => handle_ledger_history(engine, request, caller),
        "consent/evaluate" => handle_consent_evaluate(engine, request, caller),
        "consent/submit" => handle_consent_submit(engine, request, caller),
        "consent/decide" => handle_consent_decide(engine, request, caller),
        "consent/revoke" => handle_consent_revoke(engine, request, caller),
        "consent/connections" => handle_consent_connections(engine, request, caller),
        "claims/assemble" => handle_claims_assemble(engine, request, caller),
        "audit/list" => handle_audit_list(engine, request, caller),
        _ => {
            warn!(method = %request.method, "unknown method");
            return JsonRpcResponse::error(
                request.id.clone(),
                rpc_codes::METHOD_NOT_FOUND,
                format!("unknown method: {}", request.method),
            );
        }
    };

    match outcome {
        Ok(result) => JsonRpcResponse::success(request.id.clone(), result),
        Err(failure) => failure.into_response(request.id.clone()),
    }
}

// ---------------------------------------------------------------------------
// Request handlers (internal)
// ---------------------------------------------------------------------------

/// Why a handler could not produce a result.
enum Failure {
    Params(String),
    Unauthenticated,
    SessionMismatch,
    Engine(CustodiaError),
    Internal(String),
}

impl From<CustodiaError> for Failure {
    fn from(e: CustodiaError) -> Self {
        Failure::Engine(e)
    }
}

impl From<serde_json::Error> for Failure {
    fn from(e: serde_json::Error) -> Self {
        Failure::Internal(format!("failed to encode result: {}", e))
    }
}

impl Failure {
    fn into_response(self, id: serde_json::Value) -> JsonRpcResponse {
        match self {
            Failure::Params(msg) => JsonRpcResponse::error(id, rpc_codes::INVALID_PARAMS, msg),
            Failure::Unauthenticated => JsonRpcResponse::error(
                id,
                rpc_codes::UNAUTHENTICATED,
                "no authenticated user".into(),
            ),
            Failure::SessionMismatch => JsonRpcResponse::error(
                id,
                rpc_codes::SESSION_MISMATCH,
                "user_id does not match the authenticated session".into(),
            ),
            Failure::Engine(err) => JsonRpcResponse::engine_error(id, &err),
            Failure::Internal(msg) => JsonRpcResponse::error(id, rpc_codes::INTERNAL_ERROR, msg),
        }
    }
}

type HandlerResult = Result<serde_json::Value, Failure>;

fn params<T: DeserializeOwned>(request: &JsonRpcRequest) -> Result<T, Failure> {
    let raw = request
        .params
        .clone()
        .unwrap_or_else(|| serde_json::json!({}));
    serde_json::from_value(raw).map_err(|e| Failure::Params(format!("invalid params: {}", e)))
}

#[derive(Deserialize)]
struct UserParams {
    #[serde(default)]
    user_id: Option<UserId>,
}

#[derive(Deserialize)]
struct ResolveParams {
    #[serde(default)]
    user_id: Option<UserId>,
    scopes: ScopeSet,
}

#[derive(Deserialize)]
struct SubmitParams {
    #[serde(default)]
    user_id: Option<UserId>,
    entries: BTreeMap<String, String>,
    #[serde(default)]
    scopes: ScopeSet,
}

/// Checkpoint params. `user_id` is absent for an anonymous trusted call.
#[derive(Deserialize)]
struct CheckpointParams {
    #[serde(default)]
    user_id: Option<UserId>,
    client_id: ClientId,
    #[serde(default)]
    scopes: Option<ScopeSet>,
    #[serde(default)]
    entries: BTreeMap<String, String>,
    #[serde(default)]
    accept: Option<bool>,
}

#[derive(Deserialize)]
struct PairParams {
    #[serde(default)]
    user_id: Option<UserId>,
    client_id: ClientId,
}

#[derive(Deserialize)]
struct AuditParams {
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    limit: Option<usize>,
}

fn handle_initialize() -> serde_json::Value {
    serde_json::json!({
        "serverInfo": {
            "name": "custodia",
            "version": env!("CARGO_PKG_VERSION")
        },
        "methods": [
            "catalog/list",
            "ledger/resolve", "ledger/submit", "ledger/history",
            "consent/evaluate", "consent/submit", "consent/decide",
            "consent/revoke", "consent/connections",
            "claims/assemble",
            "audit/list"
        ]
    })
}

fn handle_ledger_resolve(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: ResolveParams = params(request)?;
    let user_id = caller.user(p.user_id)?;
    let resolution = engine.resolver.resolve(&user_id, &p.scopes)?;
    Ok(serde_json::to_value(resolution)?)
}

fn handle_ledger_submit(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: SubmitParams = params(request)?;
    let user_id = caller.user(p.user_id)?;
    let submission = engine.gate.submit(&user_id, &p.entries, &p.scopes)?;
    Ok(serde_json::to_value(submission)?)
}

fn handle_ledger_history(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: UserParams = params(request)?;
    let sections = engine.resolver.history(&caller.user(p.user_id)?)?;
    Ok(serde_json::json!({ "sections": sections }))
}

fn handle_consent_evaluate(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: CheckpointParams = params(request)?;
    let session = caller.session(p.user_id)?;
    let state = engine
        .checkpoint
        .evaluate(&session, &p.client_id, p.scopes.as_ref())?;
    Ok(serde_json::to_value(state)?)
}

fn handle_consent_submit(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: CheckpointParams = params(request)?;
    let session = caller.session(p.user_id)?;
    let state = engine.checkpoint.submit(
        &session,
        &p.client_id,
        p.scopes.as_ref(),
        &p.entries,
    )?;
    Ok(serde_json::to_value(state)?)
}

fn handle_consent_decide(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: CheckpointParams = params(request)?;
    let accept = p
        .accept
        .ok_or_else(|| Failure::Params("invalid params: missing field `accept`".into()))?;
    let session = caller.session(p.user_id)?;
    let state = engine
        .checkpoint
        .decide(&session, &p.client_id, p.scopes.as_ref(), accept)?;
    Ok(serde_json::to_value(state)?)
}

fn handle_consent_revoke(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: PairParams = params(request)?;
    let record = engine.manager.revoke(&caller.user(p.user_id)?, &p.client_id)?;
    Ok(serde_json::json!({
        "revoked": record.is_some(),
        "record": record,
    }))
}

fn handle_consent_connections(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: UserParams = params(request)?;
    let connections = engine.manager.connections(&caller.user(p.user_id)?)?;
    Ok(serde_json::to_value(connections)?)
}

fn handle_claims_assemble(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: PairParams = params(request)?;
    let claims = engine.assembler.assemble(&caller.user(p.user_id)?, &p.client_id)?;
    Ok(serde_json::json!({ "claims": claims }))
}

fn handle_audit_list(
    engine: &Engine,
    request: &JsonRpcRequest,
    caller: &Caller,
) -> HandlerResult {
    let p: AuditParams = params(request)?;
    // A session only ever sees its own entries.
    let user_id = match caller {
        Caller::Trusted => p.user_id,
        Caller::Session(_) => Some(caller.user(p.user_id)?),
    };
    let mut entries = match &user_id {
        Some(user_id) => engine.audit.entries_for_user(user_id)?,
        None => engine.audit.entries()?,
    };
    let total = entries.len();
    if let Some(limit) = p.limit {
        // Most recent `limit` entries, still oldest first.
        entries = entries.split_off(total.saturating_sub(limit));
    }
    let head = engine.audit.head()?.map(|h| h.to_string());
    Ok(serde_json::json!({
        "entries": entries,
        "total": total,
        "head": head,
        "valid": engine.audit.verify_chain()?,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use custodia_core::{Application, ErrorKind};
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_config() -> RootConfig {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "custodia-test-root-{}-{}",
            std::process::id(),
            id
        ));
        RootConfig {
            data_dir: dir,
            applications: vec![Application {
                client_id: ClientId::new("banco"),
                name: "Banco Ejemplo".into(),
                owner_user_id: UserId::new("dev"),
                declared_scopes: ScopeSet::new(["email", "legal-id"]),
                redirect_targets: vec!["https://banco.example/cb".into()],
                disabled: false,
            }],
            ..RootConfig::default()
        }
    }

    fn make_request(method: &str, params: Option<serde_json::Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: serde_json::json!(1),
        }
    }

    fn call(state: &RootState, method: &str, params: serde_json::Value) -> JsonRpcResponse {
        handle_request(state, &make_request(method, Some(params)))
    }

    fn cleanup(state: &RootState) {
        let _ = std::fs::remove_dir_all(&state.config.data_dir);
    }

    #[test]
    fn test_initialize_root_with_sqlite() {
        let state = initialize_root(test_config()).unwrap();
        assert!(state.is_initialized());
        assert!(state.config.database_path().exists());
        cleanup(&state);
    }

    #[test]
    fn test_initialize_root_invalid_config() {
        let mut config = test_config();
        config.intake.max_value_len = 0;
        assert!(initialize_root(config).is_err());
    }

    #[test]
    fn test_handle_request_initialize() {
        let state = initialize_root(test_config()).unwrap();
        let response = handle_request(&state, &make_request("initialize", None));
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "custodia");
        cleanup(&state);
    }

    #[test]
    fn test_catalog_list() {
        let state = initialize_root(test_config()).unwrap();
        let response = handle_request(&state, &make_request("catalog/list", None));
        let scopes = response.result.unwrap()["scopes"].as_array().unwrap().len();
        assert_eq!(scopes, 13);
        cleanup(&state);
    }

    #[test]
    fn test_unknown_method_and_bad_version() {
        let state = initialize_root(test_config()).unwrap();
        let response = handle_request(&state, &make_request("vault/status", None));
        assert_eq!(response.error.unwrap().code, rpc_codes::METHOD_NOT_FOUND);

        let mut request = make_request("initialize", None);
        request.jsonrpc = "1.0".into();
        let response = handle_request(&state, &request);
        assert_eq!(response.error.unwrap().code, rpc_codes::INVALID_REQUEST);
        cleanup(&state);
    }

    #[test]
    fn test_invalid_params() {
        let state = initialize_root(test_config()).unwrap();
        let response = call(&state, "ledger/resolve", serde_json::json!({ "user": "u" }));
        assert_eq!(response.error.unwrap().code, rpc_codes::INVALID_PARAMS);

        let response = call(
            &state,
            "consent/decide",
            serde_json::json!({ "user_id": "u", "client_id": "banco" }),
        );
        assert_eq!(response.error.unwrap().code, rpc_codes::INVALID_PARAMS);
        cleanup(&state);
    }

    #[test]
    fn test_validation_error_carries_issues() {
        let state = initialize_root(test_config()).unwrap();
        let response = call(
            &state,
            "ledger/submit",
            serde_json::json!({ "user_id": "u", "entries": { "email": "  " } }),
        );
        let error = response.error.unwrap();
        assert_eq!(error.code, rpc_codes::VALIDATION_ERROR);
        let data = error.data.unwrap();
        assert_eq!(data["kind"], ErrorKind::Validation.to_string());
        assert_eq!(data["issues"][0]["issue"], "empty_value");
        cleanup(&state);
    }

    #[test]
    fn test_rpc_consent_journey() {
        let state = initialize_root(test_config()).unwrap();

        let response = call(
            &state,
            "consent/evaluate",
            serde_json::json!({ "user_id": "u", "client_id": "banco" }),
        );
        assert_eq!(response.result.unwrap()["state"], "collecting");

        let response = call(
            &state,
            "consent/submit",
            serde_json::json!({
                "user_id": "u",
                "client_id": "banco",
                "entries": { "email": "a@b.cl", "legal-id": "12.345.678-9" }
            }),
        );
        assert_eq!(response.result.unwrap()["state"], "awaiting_decision");

        let response = call(
            &state,
            "consent/decide",
            serde_json::json!({ "user_id": "u", "client_id": "banco", "accept": true }),
        );
        let result = response.result.unwrap();
        assert_eq!(result["state"], "granted");
        assert_eq!(result["redirect_uri"], "https://banco.example/cb");

        let response = call(
            &state,
            "claims/assemble",
            serde_json::json!({ "user_id": "u", "client_id": "banco" }),
        );
        assert_eq!(response.result.unwrap()["claims"]["email"], "a@b.cl");

        let response = call(
            &state,
            "consent/revoke",
            serde_json::json!({ "user_id": "u", "client_id": "banco" }),
        );
        assert_eq!(response.result.unwrap()["revoked"], true);

        let response = call(
            &state,
            "claims/assemble",
            serde_json::json!({ "user_id": "u", "client_id": "banco" }),
        );
        assert_eq!(response.error.unwrap().code, rpc_codes::ACCESS_DENIED);

        let response = call(
            &state,
            "consent/connections",
            serde_json::json!({ "user_id": "u" }),
        );
        assert_eq!(
            response.result.unwrap()["revoked"].as_array().unwrap().len(),
            1
        );

        let response = call(&state, "audit/list", serde_json::json!({ "limit": 2 }));
        let result = response.result.unwrap();
        assert_eq!(result["valid"], true);
        assert_eq!(result["entries"].as_array().unwrap().len(), 2);
        assert!(result["total"].as_u64().unwrap() >= 4);

        cleanup(&state);
    }

    #[test]
    fn test_anonymous_evaluate() {
        let state = initialize_root(test_config()).unwrap();
        let response = call(
            &state,
            "consent/evaluate",
            serde_json::json!({ "client_id": "banco" }),
        );
        assert_eq!(response.result.unwrap()["state"], "unauthenticated");
        cleanup(&state);
    }

    #[test]
    fn test_unknown_client_is_configuration_error() {
        let state = initialize_root(test_config()).unwrap();
        let response = call(
            &state,
            "consent/evaluate",
            serde_json::json!({ "user_id": "u", "client_id": "nope" }),
        );
        assert_eq!(response.error.unwrap().code, rpc_codes::CONFIGURATION_ERROR);
        cleanup(&state);
    }

    #[test]
    fn test_ledger_history() {
        let state = initialize_root(test_config()).unwrap();
        call(
            &state,
            "ledger/submit",
            serde_json::json!({ "user_id": "u", "entries": { "income": "900", "email": "e@x.cl" } }),
        );
        let response = call(&state, "ledger/history", serde_json::json!({ "user_id": "u" }));
        let sections = response.result.unwrap()["sections"].as_array().unwrap().len();
        assert_eq!(sections, 2);
        cleanup(&state);
    }

    fn call_as(
        state: &RootState,
        caller: &Caller,
        method: &str,
        params: serde_json::Value,
    ) -> JsonRpcResponse {
        handle_request_as(state, &make_request(method, Some(params)), caller)
    }

    #[test]
    fn test_session_user_cannot_act_for_someone_else() {
        let state = initialize_root(test_config()).unwrap();
        call(
            &state,
            "ledger/submit",
            serde_json::json!({ "user_id": "victim", "entries": { "email": "v@x.cl" } }),
        );
        let mallory = Caller::Session(Some(UserId::new("mallory")));

        for method in ["ledger/history", "ledger/submit", "consent/connections", "audit/list"] {
            let response = call_as(
                &state,
                &mallory,
                method,
                serde_json::json!({ "user_id": "victim", "entries": { "email": "m@x.cl" } }),
            );
            assert_eq!(
                response.error.unwrap().code,
                rpc_codes::SESSION_MISMATCH,
                "{}",
                method
            );
        }
        let response = call_as(
            &state,
            &mallory,
            "claims/assemble",
            serde_json::json!({ "user_id": "victim", "client_id": "banco" }),
        );
        assert_eq!(response.error.unwrap().code, rpc_codes::SESSION_MISMATCH);

        // The victim's ledger is untouched.
        let response = call(&state, "ledger/history", serde_json::json!({ "user_id": "victim" }));
        let sections = response.result.unwrap()["sections"].clone();
        assert_eq!(sections[0]["records"].as_array().unwrap().len(), 1);
        cleanup(&state);
    }

    #[test]
    fn test_session_user_fills_in_missing_user_id() {
        let state = initialize_root(test_config()).unwrap();
        let ana = Caller::Session(Some(UserId::new("ana")));
        call_as(
            &state,
            &ana,
            "ledger/submit",
            serde_json::json!({ "entries": { "email": "ana@x.cl" } }),
        );
        let response = call_as(
            &state,
            &ana,
            "ledger/resolve",
            serde_json::json!({ "user_id": "ana", "scopes": ["email"] }),
        );
        assert_eq!(
            response.result.unwrap()["satisfied"]["email"]["value"],
            "ana@x.cl"
        );

        // Audit under a session is scoped to the session user.
        call(
            &state,
            "ledger/submit",
            serde_json::json!({ "user_id": "bruno", "entries": { "email": "b@x.cl" } }),
        );
        let response = call_as(&state, &ana, "audit/list", serde_json::json!({}));
        assert_eq!(response.result.unwrap()["total"], 1);
        cleanup(&state);
    }

    #[test]
    fn test_missing_session_is_unauthenticated() {
        let state = initialize_root(test_config()).unwrap();
        let nobody = Caller::Session(None);

        let response = call_as(
            &state,
            &nobody,
            "claims/assemble",
            serde_json::json!({ "user_id": "u", "client_id": "banco" }),
        );
        assert_eq!(response.error.unwrap().code, rpc_codes::UNAUTHENTICATED);

        let response = call_as(&state, &nobody, "audit/list", serde_json::json!({}));
        assert_eq!(response.error.unwrap().code, rpc_codes::UNAUTHENTICATED);

        // The checkpoint ignores a claimed user without a session.
        let response = call_as(
            &state,
            &nobody,
            "consent/evaluate",
            serde_json::json!({ "user_id": "u", "client_id": "banco" }),
        );
        assert_eq!(response.result.unwrap()["state"], "unauthenticated");

        // The trusted channel still requires a user_id for user-scoped methods.
        let response = call(&state, "ledger/history", serde_json::json!({}));
        assert_eq!(response.error.unwrap().code, rpc_codes::INVALID_PARAMS);
        cleanup(&state);
    }

    #[test]
    fn test_shutdown_root() {
        let mut state = initialize_root(test_config()).unwrap();
        shutdown_root(&mut state).unwrap();
        assert!(!state.is_initialized());
        shutdown_root(&mut state).unwrap();

        let response = handle_request(&state, &make_request("initialize", None));
        assert_eq!(response.error.unwrap().code, rpc_codes::INTERNAL_ERROR);
        cleanup(&state);
    }
}
