//! Axum-based loopback HTTP gateway with SSE streaming.
//!
//! The gateway is a thin transcoder: it parses requests, checks the
//! optional bearer token, calls the orchestrator, and maps error kinds to
//! status codes. No business rules live here. Streaming endpoints emit
//! server-sent events named `metadata`, `content`, `error`, and `done`.

use crate::catalog::{JsonExerciseCatalog, JsonSpecSource};
use crate::composer::Composer;
use crate::config::{Config, Secrets};
use crate::domain::{Intent, Language, Recipe, SessionMode};
use crate::error::PairingError;
use crate::events::{EventBusBuilder, EventKind};
use crate::orchestrator::{
    learning::ProfileUpdater, CreateSessionRequest, EscalationArgs, Orchestrator, PairingArgs,
    PairingChunk,
};
use crate::providers::{self, ProviderRegistry};
use crate::sandbox::Sandbox;
use crate::selector::Selector;
use crate::session::SessionManager;
use crate::store::{DocumentStore, FileStore, ProfileStore};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt as _;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// SHA-256-compared bearer token; `None` disables auth.
    pub api_token: Option<Arc<str>>,
    pub provider_names: Vec<String>,
    pub runner: String,
}

/// Wire everything and serve until shutdown.
pub async fn run_gateway(config: Config) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;

    // ── Refuse accidental public exposure ──
    if !is_loopback(&host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "refusing to bind to {host} — the daemon is single-user and loopback-only.\n\
             Set [gateway] allow_public_bind = true to override (not recommended)."
        );
    }

    let secrets = Secrets::load(&config.secrets_path())?;
    let orchestrator = build_orchestrator(&config, &secrets)?;

    let state = AppState {
        provider_names: orchestrator.providers.names(),
        runner: orchestrator.sandbox.runner_label(),
        api_token: secrets.api_token.as_deref().map(Arc::from),
        orchestrator: orchestrator.clone(),
    };

    // Inactivity sweeper: abandoned sessions get their end event.
    {
        let orchestrator = orchestrator.clone();
        orchestrator.sessions.clone().spawn_sweeper(move |id| {
            orchestrator
                .bus
                .publish(&crate::events::DomainEvent::SessionEnded {
                    session_id: id,
                    status: crate::domain::SessionStatus::Abandoned,
                });
        });
    }

    let app = router(state.clone())
        .layer(RequestBodyLimitLayer::new(config.gateway.max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.gateway.request_timeout_seconds,
        )));

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual = listener.local_addr()?;
    tracing::info!(addr = %actual, "mentord gateway listening");
    println!("mentord gateway listening on http://{actual}");
    println!("  GET  /v1/health");
    println!("  POST /v1/sessions");
    println!("  POST /v1/sessions/{{id}}/{{hint|review|stuck|next|explain}}");
    println!("  POST /v1/sessions/{{id}}/escalate");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Assemble the component graph from configuration.
pub fn build_orchestrator(config: &Config, secrets: &Secrets) -> Result<Arc<Orchestrator>> {
    let data_dir = config.data_dir();
    let store = Arc::new(FileStore::open(&data_dir)?);
    let profiles = Arc::new(ProfileStore::open(&data_dir.join("profiles"))?);
    let sessions = Arc::new(SessionManager::new(store, config.session.clone()));
    let sandbox = Arc::new(Sandbox::new(config.sandbox.clone()).map_err(|e| anyhow::anyhow!(e))?);

    let registry: ProviderRegistry = providers::build_registry(
        &config.providers,
        secrets,
        &config.reliability,
        config.default_provider.as_deref(),
    );
    if registry.is_empty() {
        tracing::warn!("no LLM providers registered; pairing requests will fail");
    }

    let updater = ProfileUpdater::new(profiles.clone());
    let bus = Arc::new(
        EventBusBuilder::new()
            .on(EventKind::RunCompleted, updater.clone())
            .on(EventKind::InterventionDelivered, updater.clone())
            .build(),
    );
    updater.bind_bus(bus.clone());

    Ok(Arc::new(Orchestrator {
        sessions,
        sandbox,
        providers: Arc::new(registry),
        profiles,
        documents: Arc::new(DocumentStore::open(&data_dir.join("documents"))?),
        exercises: Arc::new(JsonExerciseCatalog::new(&config.exercises_dir())),
        specs: Arc::new(JsonSpecSource::new(&data_dir)),
        bus,
        selector: Selector::new(config.selector),
        composer: Composer::default(),
        llm: config.llm,
        default_track: config.session.default_track.clone(),
    }))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(handle_health))
        .route("/v1/status", get(handle_status))
        .route("/v1/sessions", post(handle_create_session))
        .route("/v1/sessions/{id}", get(handle_get_session))
        .route("/v1/sessions/{id}", delete(handle_terminate_session))
        .route("/v1/sessions/{id}/runs", post(handle_run))
        .route("/v1/sessions/{id}/escalate", post(handle_escalate))
        .route("/v1/sessions/{id}/{intent}", post(handle_pairing))
        .with_state(state)
}

// ── Auth ─────────────────────────────────────────────────────────

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(ref expected) = state.api_token else {
        return true;
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    constant_time_eq(presented, expected)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": "auth required — send Authorization: Bearer <token>",
            "status": 401,
        })),
    )
        .into_response()
}

// ── Error mapping ────────────────────────────────────────────────

fn error_response(err: &PairingError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = serde_json::json!({
        "error": err.kind(),
        "status": err.status_code(),
        "details": err.to_string(),
    });
    if let PairingError::CooldownActive { remaining_seconds } = err {
        body["cooldown_remaining"] = serde_json::json!(remaining_seconds);
    }
    if matches!(err, PairingError::Internal(_)) {
        tracing::error!("internal error: {err}");
        // Internal detail stays in the logs.
        body["details"] = serde_json::json!("internal error");
    }
    (status, Json(body)).into_response()
}

fn parse_session_id(raw: &str) -> Result<Uuid, Response> {
    raw.parse::<Uuid>().map_err(|_| {
        error_response(&PairingError::InvalidRequest(format!(
            "invalid session id: {raw}"
        )))
    })
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.provider_names,
        "runner": state.runner,
    }))
}

#[derive(Deserialize, Default)]
struct CreateSessionBody {
    exercise_id: Option<String>,
    spec_path: Option<String>,
    intent: Option<String>,
    track: Option<String>,
}

async fn handle_create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateSessionBody>>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let mode = match body.intent.as_deref() {
        None => None,
        Some("training") => Some(SessionMode::Training),
        Some("greenfield") => Some(SessionMode::Greenfield),
        Some("feature_guidance") => Some(SessionMode::FeatureGuidance),
        Some(other) => {
            return error_response(&PairingError::InvalidRequest(format!(
                "unknown session intent: {other}"
            )))
        }
    };

    let request = CreateSessionRequest {
        exercise_id: body.exercise_id,
        spec_path: body.spec_path,
        track: body.track,
        mode,
    };
    match state.orchestrator.create_session(request).await {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.get_session(id) {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize, Default)]
struct TerminateQuery {
    /// `completed` or `abandoned` (default).
    outcome: Option<String>,
}

async fn handle_terminate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<TerminateQuery>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let completed = match query.outcome.as_deref() {
        None | Some("abandoned") => false,
        Some("completed") => true,
        Some(other) => {
            return error_response(&PairingError::InvalidRequest(format!(
                "unknown outcome: {other}"
            )))
        }
    };
    match state.orchestrator.terminate_session(id, completed).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct RunBody {
    code: BTreeMap<String, String>,
    language: Language,
    #[serde(default = "default_true")]
    format: bool,
    #[serde(default = "default_true")]
    build: bool,
    #[serde(default = "default_true")]
    test: bool,
    #[serde(default = "default_timeout")]
    timeout: u32,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u32 {
    60
}

async fn handle_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<RunBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return error_response(&PairingError::InvalidRequest(e.to_string())),
    };
    let recipe = Recipe {
        format: body.format,
        build: body.build,
        test: body.test,
        timeout_seconds: body.timeout,
    };
    match state
        .orchestrator
        .run_code(id, body.code, body.language, recipe)
        .await
    {
        Ok(run) => (StatusCode::CREATED, Json(run)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize, Default)]
struct PairingBody {
    code: Option<BTreeMap<String, String>>,
    language: Option<Language>,
    run: Option<RunToggles>,
    #[serde(default)]
    stream: bool,
    focus_criterion: Option<String>,
}

#[derive(Deserialize)]
struct RunToggles {
    #[serde(default = "default_true")]
    format: bool,
    #[serde(default = "default_true")]
    build: bool,
    #[serde(default = "default_true")]
    test: bool,
    #[serde(default = "default_timeout")]
    timeout: u32,
}

async fn handle_pairing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, intent)): Path<(String, String)>,
    body: Option<Json<PairingBody>>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let Some(intent) = Intent::from_path_segment(&intent).filter(|i| *i != Intent::Escalate)
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "unknown operation",
                "status": 404,
                "details": format!("no such pairing intent: {intent}"),
            })),
        )
            .into_response();
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let recipe = body.run.as_ref().map(|toggles| Recipe {
        format: toggles.format,
        build: toggles.build,
        test: toggles.test,
        timeout_seconds: toggles.timeout,
    });
    let args = PairingArgs {
        session_id: id,
        intent,
        code: body.code,
        language: body.language,
        recipe,
        focus_criterion: body.focus_criterion,
    };

    if body.stream {
        match state.orchestrator.clone().pair_stream(args).await {
            Ok(rx) => sse_response(rx),
            Err(e) => error_response(&e),
        }
    } else {
        match state.orchestrator.pair(args).await {
            Ok(intervention) => (StatusCode::CREATED, Json(intervention)).into_response(),
            Err(e) => error_response(&e),
        }
    }
}

#[derive(Deserialize)]
struct EscalateBody {
    level: u8,
    justification: String,
    code: Option<BTreeMap<String, String>>,
}

async fn handle_escalate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<EscalateBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(e) => return error_response(&PairingError::InvalidRequest(e.to_string())),
    };
    let args = EscalationArgs {
        session_id: id,
        level: body.level,
        justification: body.justification,
        code: body.code,
    };
    match state.orchestrator.escalate(args).await {
        Ok(intervention) => (StatusCode::CREATED, Json(intervention)).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── SSE transcoding ──────────────────────────────────────────────

fn sse_response(rx: tokio::sync::mpsc::Receiver<PairingChunk>) -> Response {
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx)
        .map(|chunk| Ok::<Event, std::convert::Infallible>(event_for(chunk)));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn event_for(chunk: PairingChunk) -> Event {
    let (name, data) = match chunk {
        PairingChunk::Metadata { level, kind } => (
            "metadata",
            serde_json::json!({"level": level, "type": kind}),
        ),
        PairingChunk::Content { content } => ("content", serde_json::json!({"content": content})),
        PairingChunk::Error { error } => ("error", serde_json::json!({"error": error})),
        PairingChunk::Done { intervention_id } => {
            ("done", serde_json::json!({"id": intervention_id}))
        }
    };
    Event::default()
        .event(name)
        .data(data.to_string())
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "::1" | "localhost")
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}
