//! # stagewalk-core
//!
//! The stage/step sequencer for Stagewalk - THE LOGIC.
//!
//! This crate drives one participant through a statically declared,
//! linear-with-branches sequence of survey stages: it orders the steps,
//! runs each step's lifecycle, gates completion on validation, and skips
//! steps based on the treatment and on earlier answers.
//!
//! ## Components (leaves first)
//!
//! - `descriptor`: step metadata, hooks, and the step store
//! - `registry`: stages, treatment plans, and sequence construction
//! - `response`: field declarations, validation, and the response store
//! - `branch`: skip conditions and the branch resolver
//! - `lifecycle`: the per-session state machine
//!
//! Collaborators are traits: `renderer` for whatever draws a step,
//! `transport` for wherever finalized records go.
//!
//! ## Architectural Constraints
//!
//! - No async, no network dependencies
//! - One sequencer per participant; no shared mutable state between sessions
//! - Integer arithmetic only; ordered collections for deterministic output

// =============================================================================
// MODULES
// =============================================================================

pub mod branch;
pub mod cursor;
pub mod descriptor;
pub mod formats;
pub mod lifecycle;
pub mod primitives;
pub mod registry;
pub mod renderer;
pub mod response;
pub mod storage;
pub mod transport;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    AuxState, ErrorClass, FieldId, FieldMap, FieldValue, SequencerError, StageId, StepId,
};

// =============================================================================
// RE-EXPORTS: Sequencer
// =============================================================================

pub use branch::{BranchResolver, Condition, ConditionFn, SkipDecision};
pub use cursor::SessionCursor;
pub use descriptor::{
    ContentRef, DoneButton, HookContext, HookError, HookFlow, HookRegistry, Navigation, NoHooks,
    StepDescriptor, StepHooks, StepStore, ValidationContext,
};
pub use lifecycle::{SessionPhase, SessionSnapshot, Sequencer, StepState, StepView};
pub use registry::{
    Position, SequenceBuilder, SequenceDefinition, Stage, StageStep, StepOverride, TreatmentMatch,
    TreatmentPlan, TreatmentRule,
};
pub use response::{
    FailureReason, FieldFailure, FieldKind, FieldSpec, ResponseStore, Revision, ValidationReport,
    grade_fields, validate_fields,
};

// =============================================================================
// RE-EXPORTS: Collaborators
// =============================================================================

pub use renderer::{PassiveRenderer, RenderHandle, Renderer, RendererRegistry};
pub use transport::{FinalizedRecord, MemorySink, NullSink, RecordSink};

// =============================================================================
// RE-EXPORTS: Formats & Storage
// =============================================================================

pub use formats::{SnapshotHeader, snapshot_from_bytes, snapshot_to_bytes};
pub use storage::RedbRecordStore;
