//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the sequencer:
//! - Identifiers (`StepId`, `StageId`, `FieldId`)
//! - Participant input (`FieldValue`, `FieldMap`)
//! - Session-scoped auxiliary state (`AuxState`)
//! - Error types (`SequencerError`, `ErrorClass`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from a string.
            #[must_use]
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable identifier of a step. Unique across the whole registry.
    StepId
);

string_id!(
    /// Identifier of a stage (a named group of steps).
    StageId
);

string_id!(
    /// Identifier of a response field within a step.
    FieldId
);

// =============================================================================
// FIELD VALUES
// =============================================================================

/// A single value entered by a participant.
///
/// `Text` is what an untyped form input produces; numeric fields parse it
/// at validation time, so `"42"` satisfies a numeric field just like
/// `Integer(42)` does.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Choice(String),
}

impl FieldValue {
    /// Interpret the value as an integer, if it is one.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Choice(_) => None,
        }
    }

    /// Interpret the value as a choice label, if it is textual.
    #[must_use]
    pub fn as_label(&self) -> Option<&str> {
        match self {
            FieldValue::Choice(s) | FieldValue::Text(s) => Some(s),
            FieldValue::Integer(_) => None,
        }
    }

    /// Length in bytes of a textual value; zero for integers.
    #[must_use]
    pub fn text_len(&self) -> usize {
        match self {
            FieldValue::Choice(s) | FieldValue::Text(s) => s.len(),
            FieldValue::Integer(_) => 0,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) | FieldValue::Choice(s) => f.write_str(s),
            FieldValue::Integer(n) => write!(f, "{n}"),
        }
    }
}

/// Values of one step, keyed by field id.
pub type FieldMap = BTreeMap<FieldId, FieldValue>;

// =============================================================================
// AUXILIARY STATE
// =============================================================================

/// Session-scoped scratch space that hooks may read and write.
///
/// Hooks receive this through their context; there is no other shared
/// state between steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxState {
    entries: BTreeMap<String, String>,
}

impl AuxState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// True when `key` is set to `"true"`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Coarse classification of a [`SequencerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad sequence definition. Fatal at setup.
    Configuration,
    /// Participant input does not satisfy the step's constraints. Recoverable.
    Validation,
    /// Misuse of the control surface. The cursor is untouched.
    Usage,
    /// A collaborator (transport, storage, codec) failed.
    Collaborator,
}

/// Errors that can occur in the sequencer.
///
/// - No silent failures
/// - The sequencer never panics; every error leaves the session consistent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    /// An id was registered twice.
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    /// A step or stage id was referenced but never registered.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// A sequence was built from an empty order.
    #[error("Sequence is empty")]
    EmptySequence,

    /// A step references a widget no renderer is registered for.
    #[error("Unknown renderer '{widget}' for step {step}")]
    UnknownRenderer { step: StepId, widget: String },

    /// A step references a hook name that is not registered.
    #[error("Unknown hook '{hook}' for step {step}")]
    UnknownHook { step: StepId, hook: String },

    /// The definition is structurally invalid.
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    /// An input exceeded a hard limit from `primitives`.
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// The active step did not validate.
    #[error("Validation failed for step {step}: {} field(s)", .failures.len())]
    Validation { step: StepId, failures: Vec<FieldId> },

    /// Skip flags can only change before traversal starts.
    #[error("Sequence is locked: traversal already started")]
    SequenceLocked,

    /// The terminal step was reached; the session accepts no more transitions.
    #[error("Sequence terminated")]
    SequenceTerminated,

    /// Another transition is in flight for this session.
    #[error("Concurrent transition rejected")]
    ConcurrentTransition,

    /// Back navigation is not permitted from here.
    #[error("Back navigation not allowed: {0}")]
    BackNotAllowed(String),

    /// The session is suspended after a disconnect.
    #[error("Session is paused")]
    Paused,

    /// The sequencer has not been started.
    #[error("Session not started")]
    NotStarted,

    /// `start` was called twice.
    #[error("Session already started")]
    AlreadyStarted,

    /// The operation needs an active step and there is none.
    #[error("Step {0} is not active")]
    StepNotActive(StepId),

    /// No hook is awaiting completion.
    #[error("No pending hook to resolve")]
    NothingPending,

    /// The step does not declare this field.
    #[error("Unknown field {field} for step {step}")]
    UnknownField { step: StepId, field: FieldId },

    /// The record transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),
}

impl SequencerError {
    /// Classify this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            SequencerError::DuplicateId(_)
            | SequencerError::UnknownStep(_)
            | SequencerError::EmptySequence
            | SequencerError::UnknownRenderer { .. }
            | SequencerError::UnknownHook { .. }
            | SequencerError::InvalidDefinition(_)
            | SequencerError::LimitExceeded(_) => ErrorClass::Configuration,
            SequencerError::Validation { .. } => ErrorClass::Validation,
            SequencerError::SequenceLocked
            | SequencerError::SequenceTerminated
            | SequencerError::ConcurrentTransition
            | SequencerError::BackNotAllowed(_)
            | SequencerError::Paused
            | SequencerError::NotStarted
            | SequencerError::AlreadyStarted
            | SequencerError::StepNotActive(_)
            | SequencerError::NothingPending
            | SequencerError::UnknownField { .. } => ErrorClass::Usage,
            SequencerError::Transport(_)
            | SequencerError::Serialization(_)
            | SequencerError::Io(_) => ErrorClass::Collaborator,
        }
    }

    /// True for errors that are fatal at setup time.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.class() == ErrorClass::Configuration
    }
}

// =============================================================================
// TESTS
// =============================================================================
