//! # Stagewalk HTTP API Module
//!
//! One sequencer per participant session, driven over JSON. The browser
//! client draws each step; the server only sees the values it submits.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /sessions` - Start a session, or reconnect to an existing one
//! - `GET /sessions/{id}` - Current step and session phase
//! - `PUT /sessions/{id}/responses` - Write values into the active step
//! - `POST /sessions/{id}/validate` - Dry-run validation of the active step
//! - `POST /sessions/{id}/advance` - Finish the active step and move on
//! - `POST /sessions/{id}/back` - Return to the previous step
//! - `POST /sessions/{id}/pause` / `resume` - Disconnect handling
//! - `GET /sessions/{id}/history` - Visited and skipped steps
//! - `GET /sessions/{id}/snapshot` - Encoded session snapshot
//! - `GET /records` - Finalized records (`?session=` to filter)
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `STAGEWALK_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `STAGEWALK_RATE_LIMIT`: Requests per second (default: 100, 0 to disable)
//! - `STAGEWALK_API_KEY`: If set, requires Bearer token authentication
//!
//! At most [`MAX_SESSIONS`] sessions are held in memory; past that `POST /sessions`
//! answers 503 until finished sessions can be evicted.

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{API_KEY_ENV, get_api_key_from_env, keys_match};
pub use handlers::{ApiError, status_for};
pub use middleware::{RATE_LIMIT_ENV, create_rate_limiter, get_rate_limit_from_env};
pub use types::{
    CreateSessionRequest, ErrorResponse, HealthResponse, HistoryResponse, RecordsQuery,
    RecordsResponse, SessionResponse, SnapshotResponse, UpdateResponsesRequest, ValidateResponse,
    json_to_value,
};

use crate::config::Blueprint;
use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, StatusCode, header},
    middleware as axum_middleware,
    routing::{get, post, put},
};
use stagewalk_core::{MemorySink, RecordSink, RedbRecordStore, Sequencer, SequencerError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const CORS_ORIGINS_ENV: &str = "STAGEWALK_CORS_ORIGINS";

/// Request bodies above this size are rejected (2 MB).
const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Live sessions held in memory at once. Finished sessions are evicted
/// first when the limit is reached.
pub const MAX_SESSIONS: usize = 10_000;

/// Records kept by the in-memory sink when no database is configured.
pub const MAX_MEMORY_RECORDS: usize = 100_000;

// =============================================================================
// SERVER STATE
// =============================================================================

/// One participant's sequencer behind its own lock.
pub type SessionHandle = Arc<Mutex<Sequencer>>;

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub blueprint: Arc<Blueprint>,
    pub sessions: Arc<RwLock<BTreeMap<String, SessionHandle>>>,
    /// Durable records and snapshots. Without it records stay in `memory`.
    pub store: Option<Arc<RedbRecordStore>>,
    pub memory: Arc<MemorySink>,
    pub max_sessions: usize,
}

impl AppState {
    /// State that keeps records in memory only.
    #[must_use]
    pub fn new(blueprint: Blueprint) -> Self {
        Self {
            blueprint: Arc::new(blueprint),
            sessions: Arc::new(RwLock::new(BTreeMap::new())),
            store: None,
            memory: Arc::new(MemorySink::bounded(MAX_MEMORY_RECORDS)),
            max_sessions: MAX_SESSIONS,
        }
    }

    /// Override the live session limit.
    #[must_use]
    pub fn with_session_limit(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    /// State backed by a redb database.
    #[must_use]
    pub fn with_store(blueprint: Blueprint, store: RedbRecordStore) -> Self {
        Self {
            store: Some(Arc::new(store)),
            ..Self::new(blueprint)
        }
    }

    /// Where finalized records go.
    pub fn sink(&self) -> Arc<dyn RecordSink> {
        match &self.store {
            Some(store) => Arc::clone(store) as Arc<dyn RecordSink>,
            None => Arc::clone(&self.memory) as Arc<dyn RecordSink>,
        }
    }

    pub async fn session(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop finished sessions that nobody is using. Returns how many went.
    ///
    /// With a database their snapshots stay behind, so a reconnect still
    /// finds them.
    pub fn evict_finished(sessions: &mut BTreeMap<String, SessionHandle>) -> usize {
        let before = sessions.len();
        sessions.retain(|_, handle| match handle.try_lock() {
            Ok(seq) => !seq.is_game_over(),
            Err(_) => true,
        });
        before - sessions.len()
    }

    /// Save the session's snapshot. Failures are logged; the session goes on.
    pub fn persist(&self, seq: &Sequencer) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_snapshot(&seq.snapshot()) {
                tracing::warn!(session = seq.session_id(), error = %e, "snapshot not saved");
            }
        }
    }

    /// Rebuild a session from its stored snapshot, if there is one.
    fn load_persisted(&self, id: &str) -> Result<Option<Sequencer>, ApiError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let internal = |e: SequencerError| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::from(&e)),
            )
        };
        match store.load_snapshot(id).map_err(internal)? {
            Some(snapshot) => {
                let seq = self
                    .blueprint
                    .restore(snapshot, self.sink())
                    .map_err(internal)?;
                tracing::info!(session = id, "session restored from snapshot");
                Ok(Some(seq))
            }
            None => Ok(None),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

const CORS_METHODS: [Method; 4] = [Method::GET, Method::POST, Method::PUT, Method::OPTIONS];

/// Build the CORS layer from `STAGEWALK_CORS_ORIGINS`.
///
/// - `*`: any origin (warned about)
/// - unset, or no valid entry: localhost on ports 3000 and 8080
/// - otherwise: the listed origins
fn build_cors_layer() -> CorsLayer {
    match std::env::var(CORS_ORIGINS_ENV).ok().as_deref() {
        Some("*") => {
            tracing::warn!("CORS: allowing ALL origins ({}=*)", CORS_ORIGINS_ENV);
            CorsLayer::permissive()
        }
        Some(list) => {
            let origins: Vec<HeaderValue> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse::<HeaderValue>() {
                    Ok(hv) => Some(hv),
                    Err(e) => {
                        tracing::warn!("CORS: invalid origin '{}': {}", s, e);
                        None
                    }
                })
                .collect();
            if origins.is_empty() {
                tracing::warn!("CORS: no valid origins configured, using localhost only");
                cors_for(localhost_origins())
            } else {
                tracing::info!("CORS: allowing {} origin(s)", origins.len());
                cors_for(origins)
            }
        }
        None => cors_for(localhost_origins()),
    }
}

fn localhost_origins() -> Vec<HeaderValue> {
    [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect()
}

fn cors_for(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(CORS_METHODS)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the router with every endpoint and middleware.
///
/// Middleware stack (outer to inner): tracing, CORS, body limit, rate
/// limiting (if enabled), authentication (if configured).
pub fn create_router(state: AppState) -> Router {
    let rate_limit = get_rate_limit_from_env();
    let limiter = create_rate_limiter(rate_limit);
    match &limiter {
        Some(_) => tracing::info!("Rate limiting enabled: {} requests/second", rate_limit),
        None => tracing::info!("Rate limiting disabled"),
    }

    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED; set {} to require a bearer key",
            API_KEY_ENV
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/sessions", post(handlers::create_session_handler))
        .route("/sessions/{id}", get(handlers::get_session_handler))
        .route(
            "/sessions/{id}/responses",
            put(handlers::update_responses_handler),
        )
        .route("/sessions/{id}/validate", post(handlers::validate_handler))
        .route("/sessions/{id}/advance", post(handlers::advance_handler))
        .route("/sessions/{id}/back", post(handlers::back_handler))
        .route("/sessions/{id}/pause", post(handlers::pause_handler))
        .route("/sessions/{id}/resume", post(handlers::resume_handler))
        .route("/sessions/{id}/history", get(handlers::history_handler))
        .route("/sessions/{id}/snapshot", get(handlers::snapshot_handler))
        .route("/records", get(handlers::records_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }
    if let Some(limiter) = limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(build_cors_layer())
                .layer(DefaultBodyLimit::max(MAX_BODY_SIZE)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve `state` on `addr` until the process is stopped.
pub async fn run_server(addr: &str, state: AppState) -> Result<(), SequencerError> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| SequencerError::Io(format!("Bind failed: {}", e)))?;

    tracing::info!("Stagewalk HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .await
        .map_err(|e| SequencerError::Io(format!("Server error: {}", e)))
}
