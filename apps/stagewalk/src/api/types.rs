//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagewalk_core::{
    ErrorClass, FieldId, FieldKind, FieldMap, FieldSpec, FieldValue, FinalizedRecord,
    SessionPhase, SequencerError, StepId, StepView, ValidationReport,
};
use std::collections::BTreeMap;

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// ERROR RESPONSE
// =============================================================================

/// Body of every non-2xx response produced by a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub class: Option<ErrorClass>,
    /// Failing field ids, for validation errors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FieldId>,
}

impl ErrorResponse {
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            class: None,
            failures: Vec::new(),
        }
    }
}

impl From<&SequencerError> for ErrorResponse {
    fn from(err: &SequencerError) -> Self {
        let failures = match err {
            SequencerError::Validation { failures, .. } => failures.clone(),
            _ => Vec::new(),
        };
        Self {
            error: err.to_string(),
            class: Some(err.class()),
            failures,
        }
    }
}

// =============================================================================
// SESSION REQUESTS/RESPONSES
// =============================================================================

/// Open (or reconnect to) a participant session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session: String,
    /// Defaults to the sequence's default treatment.
    #[serde(default)]
    pub treatment: Option<String>,
}

/// Where a session stands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session: String,
    pub treatment: String,
    pub phase: SessionPhase,
    pub paused: bool,
    pub game_over: bool,
    /// True when an existing session was picked up again.
    #[serde(default)]
    pub reconnected: bool,
    pub step: Option<StepView>,
}

/// Values for the active step, keyed by field id.
///
/// JSON strings become choice labels for choice and scale fields and text
/// otherwise; JSON integers stay integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResponsesRequest {
    pub values: BTreeMap<String, Value>,
}

impl UpdateResponsesRequest {
    /// Convert to core values using the active step's declarations.
    pub fn to_field_map(&self, fields: &[FieldSpec]) -> Result<FieldMap, String> {
        self.values
            .iter()
            .map(|(id, raw)| {
                let spec = fields.iter().find(|f| f.id.as_str() == id);
                Ok((FieldId::new(id.as_str()), json_to_value(spec, raw)?))
            })
            .collect()
    }
}

/// Convert one JSON value.
///
/// Only strings and integers are accepted; the data model has no floats,
/// booleans, or nested values.
pub fn json_to_value(spec: Option<&FieldSpec>, raw: &Value) -> Result<FieldValue, String> {
    match raw {
        Value::String(s) => Ok(match spec.map(|f| &f.kind) {
            Some(FieldKind::Choice { .. } | FieldKind::Scale { .. }) => {
                FieldValue::Choice(s.clone())
            }
            _ => FieldValue::Text(s.clone()),
        }),
        Value::Number(n) => n
            .as_i64()
            .map(FieldValue::Integer)
            .ok_or_else(|| format!("{} is not an integer", n)),
        other => Err(format!("unsupported value: {}", other)),
    }
}

/// Step ids the session has visited and skipped so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub session: String,
    pub history: Vec<StepId>,
    pub skipped: Vec<StepId>,
}

/// Result of a dry-run validation of the active step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub step: StepId,
    #[serde(flatten)]
    pub report: ValidationReport,
}

/// Encoded session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub session: String,
    /// `postcard` bytes behind the snapshot header, base64 encoded.
    pub data: String,
    pub size_bytes: usize,
}

// =============================================================================
// RECORDS
// =============================================================================

/// Filter for `GET /records`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordsQuery {
    pub session: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsResponse {
    pub count: usize,
    pub records: Vec<FinalizedRecord>,
}

impl RecordsResponse {
    pub fn new(records: Vec<FinalizedRecord>) -> Self {
        Self {
            count: records.len(),
            records,
        }
    }
}
