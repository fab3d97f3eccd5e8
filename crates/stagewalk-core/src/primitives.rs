//! # Sequencer Primitives
//!
//! Hardcoded limits and format constants for the Stagewalk CORE.
//!
//! These are compiled into the binary and are immutable at runtime.
//! Every externally supplied definition or value is checked against them
//! before it reaches the registry or the response store.

use crate::SequencerError;

/// Magic bytes for the Stagewalk snapshot header.
///
/// - Snapshot = Magic Bytes ("SWLK") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"SWLK";

/// Current serialization format version.
///
/// Increment this when making breaking changes to the snapshot format.
pub const FORMAT_VERSION: u8 = 2;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for step, stage and field ids.
pub const MAX_ID_LENGTH: usize = 128;

/// Maximum number of registered steps.
pub const MAX_STEPS: usize = 512;

/// Maximum number of fields declared by a single step.
pub const MAX_FIELDS_PER_STEP: usize = 64;

/// Maximum number of choices of a choice or scale field.
pub const MAX_CHOICES: usize = 64;

/// Maximum length of a single submitted text value (4KB).
///
/// Larger values are rejected before they are stored.
pub const MAX_TEXT_VALUE_LENGTH: usize = 4096;

/// Maximum length of a treatment tag.
pub const MAX_TREATMENT_LENGTH: usize = 64;

/// Validate an identifier: non-empty, bounded, no control characters.
pub fn validate_id(kind: &str, id: &str) -> Result<(), SequencerError> {
    if id.is_empty() {
        return Err(SequencerError::InvalidDefinition(format!(
            "{} id must not be empty",
            kind
        )));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(SequencerError::LimitExceeded(format!(
            "{} id length {} exceeds maximum {} bytes",
            kind,
            id.len(),
            MAX_ID_LENGTH
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(SequencerError::InvalidDefinition(format!(
            "{} id '{}' contains control characters",
            kind,
            id.escape_debug()
        )));
    }
    Ok(())
}

/// Validate a treatment tag. The empty tag is allowed (no treatment).
pub fn validate_treatment(treatment: &str) -> Result<(), SequencerError> {
    if treatment.len() > MAX_TREATMENT_LENGTH {
        return Err(SequencerError::LimitExceeded(format!(
            "treatment length {} exceeds maximum {} bytes",
            treatment.len(),
            MAX_TREATMENT_LENGTH
        )));
    }
    Ok(())
}
