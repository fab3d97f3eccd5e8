//! # API Endpoint Handlers
//!
//! Every session handler takes the session's mutex with `try_lock`: a second
//! transition arriving while one is in flight is answered with 409 instead
//! of queuing behind it.

use super::{
    AppState, SessionHandle,
    types::{
        CreateSessionRequest, ErrorResponse, HealthResponse, HistoryResponse, RecordsQuery,
        RecordsResponse, SessionResponse, SnapshotResponse, UpdateResponsesRequest,
        ValidateResponse,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use stagewalk_core::{
    ErrorClass, Sequencer, SequencerError, StepState, primitives::validate_id, snapshot_to_bytes,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Error half of every handler result.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

type ApiResult<T> = Result<(StatusCode, Json<T>), ApiError>;

// =============================================================================
// ERROR MAPPING
// =============================================================================

/// HTTP status for a sequencer error.
pub fn status_for(err: &SequencerError) -> StatusCode {
    match err {
        SequencerError::UnknownField { .. } | SequencerError::LimitExceeded(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => match err.class() {
            ErrorClass::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorClass::Usage => StatusCode::CONFLICT,
            ErrorClass::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorClass::Collaborator => StatusCode::BAD_GATEWAY,
        },
    }
}

fn fail(err: &SequencerError) -> ApiError {
    (status_for(err), Json(ErrorResponse::from(err)))
}

fn bad_request(err: &SequencerError) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::from(err)))
}

fn not_found(session: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::message(format!("Unknown session: {}", session))),
    )
}

// =============================================================================
// SESSION ACCESS
// =============================================================================

async fn find(state: &AppState, id: &str) -> Result<SessionHandle, ApiError> {
    state.session(id).await.ok_or_else(|| not_found(id))
}

/// Exclusive access for a transition; busy sessions are rejected.
async fn claim(state: &AppState, id: &str) -> Result<OwnedMutexGuard<Sequencer>, ApiError> {
    let handle = find(state, id).await?;
    handle.try_lock_owned().map_err(|_| {
        tracing::debug!(session = id, "transition rejected, session busy");
        fail(&SequencerError::ConcurrentTransition)
    })
}

fn session_response(seq: &Sequencer, reconnected: bool) -> SessionResponse {
    SessionResponse {
        session: seq.session_id().to_string(),
        treatment: seq.treatment().to_string(),
        phase: seq.phase(),
        paused: seq.is_paused(),
        game_over: seq.is_game_over(),
        reconnected,
        step: seq.current_step(),
    }
}

/// Run a transition, persist the session, and describe where it stands.
fn transition(
    state: &AppState,
    seq: &mut Sequencer,
    op: impl FnOnce(&mut Sequencer) -> Result<(), SequencerError>,
) -> ApiResult<SessionResponse> {
    op(seq).map_err(|e| fail(&e))?;
    state.persist(seq);
    Ok((StatusCode::OK, Json(session_response(seq, false))))
}

// =============================================================================
// HEALTH HANDLER
// =============================================================================

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// SESSION LIFECYCLE HANDLERS
// =============================================================================

/// Open a session, or pick up an existing one after a reconnect.
///
/// A session already held in memory is resumed. Otherwise a persisted
/// snapshot is restored if one exists, and only then is a new session
/// started. The session map is locked only to insert the result.
pub async fn create_session_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<SessionResponse> {
    validate_id("session", &request.session).map_err(|e| bad_request(&e))?;

    if let Some(handle) = state.session(&request.session).await {
        return reconnect(&state, handle);
    }
    if state.session_count().await >= state.max_sessions {
        ensure_capacity(&state, &mut *state.sessions.write().await)?;
    }

    let (seq, status, reconnected) = match state.load_persisted(&request.session)? {
        Some(mut seq) => {
            seq.resume();
            (seq, StatusCode::OK, true)
        }
        None => {
            let treatment = request
                .treatment
                .as_deref()
                .unwrap_or_else(|| state.blueprint.default_treatment());
            let mut seq = state
                .blueprint
                .sequencer(&request.session, treatment, state.sink())
                .map_err(|e| bad_request(&e))?;
            seq.start().map_err(|e| fail(&e))?;
            tracing::info!(session = %request.session, treatment, "session started");
            (seq, StatusCode::CREATED, false)
        }
    };
    let response = session_response(&seq, reconnected);

    let mut sessions = state.sessions.write().await;
    // Another request may have opened the same session meanwhile.
    if let Some(handle) = sessions.get(&request.session).cloned() {
        drop(sessions);
        return reconnect(&state, handle);
    }
    ensure_capacity(&state, &mut sessions)?;
    let handle = Arc::new(Mutex::new(seq));
    sessions.insert(request.session, Arc::clone(&handle));
    drop(sessions);

    let seq = handle.lock().await;
    state.persist(&seq);
    Ok((status, Json(response)))
}

/// Make room for one more session, evicting finished ones if needed.
fn ensure_capacity(
    state: &AppState,
    sessions: &mut BTreeMap<String, SessionHandle>,
) -> Result<(), ApiError> {
    if sessions.len() < state.max_sessions {
        return Ok(());
    }
    let evicted = AppState::evict_finished(sessions);
    if evicted > 0 {
        tracing::info!(evicted, "evicted finished sessions");
    }
    if sessions.len() >= state.max_sessions {
        tracing::warn!(limit = state.max_sessions, "session limit reached");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::message(format!(
                "Session limit reached ({})",
                state.max_sessions
            ))),
        ));
    }
    Ok(())
}

/// Resume a session that is already held in memory.
fn reconnect(state: &AppState, handle: SessionHandle) -> ApiResult<SessionResponse> {
    let mut seq = handle
        .try_lock_owned()
        .map_err(|_| fail(&SequencerError::ConcurrentTransition))?;
    seq.resume();
    state.persist(&seq);
    Ok((StatusCode::OK, Json(session_response(&seq, true))))
}

pub async fn get_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let handle = find(&state, &id).await?;
    let seq = handle.lock().await;
    Ok((StatusCode::OK, Json(session_response(&seq, false))))
}

/// Write values into the active step's draft.
pub async fn update_responses_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateResponsesRequest>,
) -> ApiResult<SessionResponse> {
    let mut seq = claim(&state, &id).await?;
    let fields = seq.current_step().map(|v| v.fields).unwrap_or_default();
    let values = request.to_field_map(&fields).map_err(|msg| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::message(msg)),
        )
    })?;
    transition(&state, &mut seq, |s| s.set_values(values))
}

/// Check the active step without finishing it.
pub async fn validate_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ValidateResponse> {
    let handle = find(&state, &id).await?;
    let seq = handle.lock().await;
    let Some(view) = seq.current_step() else {
        let err = if seq.is_game_over() {
            SequencerError::SequenceTerminated
        } else {
            SequencerError::NotStarted
        };
        return Err(fail(&err));
    };
    let report = seq.validate(&view.step).map_err(|e| fail(&e))?;
    Ok((
        StatusCode::OK,
        Json(ValidateResponse {
            step: view.step,
            report,
        }),
    ))
}

pub async fn advance_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let mut seq = claim(&state, &id).await?;
    transition(&state, &mut seq, |s| s.advance().map(|_| ()))
}

pub async fn back_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let mut seq = claim(&state, &id).await?;
    transition(&state, &mut seq, |s| s.go_back().map(|_| ()))
}

/// Freeze the session, typically after the client lost its connection.
pub async fn pause_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let mut seq = claim(&state, &id).await?;
    transition(&state, &mut seq, |s| {
        s.pause();
        Ok(())
    })
}

pub async fn resume_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionResponse> {
    let mut seq = claim(&state, &id).await?;
    transition(&state, &mut seq, |s| {
        s.resume();
        Ok(())
    })
}

// =============================================================================
// INSPECTION HANDLERS
// =============================================================================

pub async fn history_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<HistoryResponse> {
    let handle = find(&state, &id).await?;
    let seq = handle.lock().await;
    let skipped = seq
        .definition()
        .step_ids()
        .into_iter()
        .filter(|step| seq.state_of(step) == Some(StepState::Skipped))
        .cloned()
        .collect();
    Ok((
        StatusCode::OK,
        Json(HistoryResponse {
            session: id,
            history: seq.history().to_vec(),
            skipped,
        }),
    ))
}

/// The session's snapshot as base64 `postcard`.
pub async fn snapshot_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SnapshotResponse> {
    let handle = find(&state, &id).await?;
    let seq = handle.lock().await;
    let bytes = snapshot_to_bytes(&seq.snapshot()).map_err(|e| fail(&e))?;
    Ok((
        StatusCode::OK,
        Json(SnapshotResponse {
            session: id,
            data: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes),
            size_bytes: bytes.len(),
        }),
    ))
}

/// Finalized records, optionally for one session.
pub async fn records_handler(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> ApiResult<RecordsResponse> {
    let records = match (&state.store, &query.session) {
        (Some(store), Some(session)) => store.records_for(session).map_err(|e| fail(&e))?,
        (Some(store), None) => store.records().map_err(|e| fail(&e))?,
        (None, Some(session)) => state.memory.records_for(session),
        (None, None) => state.memory.records(),
    };
    Ok((StatusCode::OK, Json(RecordsResponse::new(records))))
}
