//! Unit tests for API types serialization/deserialization.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use serde_json::json;
use stagewalk::api::{
    CreateSessionRequest, ErrorResponse, HealthResponse, RecordsResponse, SessionResponse,
    UpdateResponsesRequest, json_to_value, status_for,
};
use stagewalk_core::{
    ErrorClass, FieldId, FieldSpec, FieldValue, FinalizedRecord, SequencerError, SessionPhase,
    StageId, StepId,
};
use std::collections::BTreeMap;

// =============================================================================
// HEALTH RESPONSE TESTS
// =============================================================================

#[test]
fn test_health_response_default() {
    let health = HealthResponse::default();
    assert_eq!(health.status, "ok");
    assert!(!health.version.is_empty());
}

#[test]
fn test_health_response_serialization() {
    let health = HealthResponse {
        status: "ok".to_string(),
        version: "0.4.2".to_string(),
    };

    let json = serde_json::to_string(&health).unwrap();
    assert!(json.contains("\"status\":\"ok\""));
    assert!(json.contains("\"version\":\"0.4.2\""));
}

// =============================================================================
// ERROR RESPONSE TESTS
// =============================================================================

#[test]
fn test_error_response_from_validation_error() {
    let err = SequencerError::Validation {
        step: StepId::new("demographics"),
        failures: vec![FieldId::new("age"), FieldId::new("income")],
    };

    let body = ErrorResponse::from(&err);
    assert_eq!(body.class, Some(ErrorClass::Validation));
    assert_eq!(body.failures.len(), 2);

    let json = serde_json::to_value(&body).unwrap();
    assert_eq!(json["class"], "validation");
    assert_eq!(json["failures"], json!(["age", "income"]));
}

#[test]
fn test_error_response_message_omits_failures() {
    let body = ErrorResponse::message("Unknown session: x");
    let json = serde_json::to_string(&body).unwrap();

    assert!(json.contains("\"error\":\"Unknown session: x\""));
    assert!(!json.contains("failures"));
}

#[test]
fn test_status_mapping() {
    use axum::http::StatusCode;

    let validation = SequencerError::Validation {
        step: StepId::new("s"),
        failures: vec![],
    };
    assert_eq!(status_for(&validation), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(status_for(&SequencerError::Paused), StatusCode::CONFLICT);
    assert_eq!(
        status_for(&SequencerError::BackNotAllowed("x".into())),
        StatusCode::CONFLICT
    );
    assert_eq!(
        status_for(&SequencerError::UnknownField {
            step: StepId::new("s"),
            field: FieldId::new("f"),
        }),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        status_for(&SequencerError::Io("disk".into())),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        status_for(&SequencerError::EmptySequence),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

// =============================================================================
// SESSION REQUEST/RESPONSE TESTS
// =============================================================================

#[test]
fn test_create_session_request_treatment_optional() {
    let request: CreateSessionRequest = serde_json::from_str(r#"{"session":"p1"}"#).unwrap();
    assert_eq!(request.session, "p1");
    assert!(request.treatment.is_none());

    let request: CreateSessionRequest =
        serde_json::from_str(r#"{"session":"p2","treatment":"TWTP"}"#).unwrap();
    assert_eq!(request.treatment.as_deref(), Some("TWTP"));
}

#[test]
fn test_session_response_without_step() {
    let response = SessionResponse {
        session: "p1".to_string(),
        treatment: "A".to_string(),
        phase: SessionPhase::GameOver,
        paused: false,
        game_over: true,
        reconnected: false,
        step: None,
    };

    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["phase"], "game_over");
    assert!(json["step"].is_null());

    let back: SessionResponse = serde_json::from_value(json).unwrap();
    assert!(back.game_over);
}

// =============================================================================
// VALUE CONVERSION TESTS
// =============================================================================

#[test]
fn test_strings_follow_field_kind() {
    let choice = FieldSpec::choice("gender", &["Male", "Female"]);
    let scale = FieldSpec::scale("trust-1", &["low", "high"]);
    let numeric = FieldSpec::numeric("age", Some(18), None);

    assert_eq!(
        json_to_value(Some(&choice), &json!("Female")).unwrap(),
        FieldValue::Choice("Female".into())
    );
    assert_eq!(
        json_to_value(Some(&scale), &json!("high")).unwrap(),
        FieldValue::Choice("high".into())
    );
    assert_eq!(
        json_to_value(Some(&numeric), &json!("42")).unwrap(),
        FieldValue::Text("42".into())
    );
    assert_eq!(
        json_to_value(None, &json!("free")).unwrap(),
        FieldValue::Text("free".into())
    );
}

#[test]
fn test_integers_stay_integers() {
    let scale = FieldSpec::scale("trust-1", &["low", "high"]);
    assert_eq!(
        json_to_value(Some(&scale), &json!(2)).unwrap(),
        FieldValue::Integer(2)
    );
    assert_eq!(json_to_value(None, &json!(-7)).unwrap(), FieldValue::Integer(-7));
}

#[test]
fn test_unsupported_json_rejected() {
    assert!(json_to_value(None, &json!(1.5)).is_err());
    assert!(json_to_value(None, &json!(true)).is_err());
    assert!(json_to_value(None, &json!(null)).is_err());
    assert!(json_to_value(None, &json!(["a"])).is_err());
    assert!(json_to_value(None, &json!({"a": 1})).is_err());
}

#[test]
fn test_update_request_to_field_map() {
    let fields = vec![
        FieldSpec::choice("inPrincipleWTP-1", &["Yes", "No"]),
        FieldSpec::numeric("theoreticalWTP-1", Some(1), None),
    ];
    let request: UpdateResponsesRequest = serde_json::from_value(json!({
        "values": { "inPrincipleWTP-1": "No", "theoreticalWTP-1": 20 }
    }))
    .unwrap();

    let map = request.to_field_map(&fields).unwrap();
    assert_eq!(
        map.get(&FieldId::new("inPrincipleWTP-1")),
        Some(&FieldValue::Choice("No".into()))
    );
    assert_eq!(
        map.get(&FieldId::new("theoreticalWTP-1")),
        Some(&FieldValue::Integer(20))
    );

    let bad: UpdateResponsesRequest =
        serde_json::from_value(json!({ "values": { "theoreticalWTP-1": false } })).unwrap();
    assert!(bad.to_field_map(&fields).is_err());
}

// =============================================================================
// RECORDS RESPONSE TESTS
// =============================================================================

#[test]
fn test_records_response_counts() {
    let record = FinalizedRecord {
        session: "p1".to_string(),
        treatment: "A".to_string(),
        stage: StageId::new("trust"),
        step: StepId::new("trust"),
        revision: 1,
        fields: BTreeMap::from([(FieldId::new("trust-1"), FieldValue::Integer(5))]),
        correct: BTreeMap::new(),
        valid: BTreeMap::new(),
        auto_finished: false,
    };

    let response = RecordsResponse::new(vec![record.clone(), record]);
    assert_eq!(response.count, 2);

    let json = serde_json::to_string(&response).unwrap();
    let back: RecordsResponse = serde_json::from_str(&json).unwrap();
    assert_eq!(back.records[0].step.as_str(), "trust");
}
