//! # Response Capture
//!
//! Field declarations, validation, and the per-session response store.
//!
//! Each step keeps a mutable *draft* while it is active. Reaching `Done`
//! finalizes the draft into an immutable *revision*. Revisions are never
//! deleted; re-activating a step through back navigation opens a new draft
//! seeded from the latest revision, and finalizing it again appends a new
//! revision.
//!
//! Validation is a pure function of the declarations and the values: it
//! never mutates the store, it only reports.

use crate::primitives::MAX_CHOICES;
use crate::{FieldId, FieldMap, FieldValue, SequencerError, StepId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// FIELD DECLARATIONS
// =============================================================================

/// What kind of value a field accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Free-form choice among labels. Also accepts a zero-based index.
    /// `correct` marks the expected answer of a comprehension check.
    Choice {
        choices: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correct: Option<usize>,
    },
    /// Single integer with optional inclusive bounds.
    Numeric {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    /// Ordered scale. Accepts a label or a one-based point.
    Scale { labels: Vec<String> },
    /// Free text.
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
}

/// A field declared by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub id: FieldId,
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Falls back to the step-level default when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl FieldSpec {
    #[must_use]
    pub fn new(id: impl Into<FieldId>, kind: FieldKind) -> Self {
        Self {
            id: id.into(),
            kind,
            required: None,
        }
    }

    /// Shorthand for a choice field.
    #[must_use]
    pub fn choice(id: impl Into<FieldId>, choices: &[&str]) -> Self {
        Self::new(
            id,
            FieldKind::Choice {
                choices: choices.iter().map(|c| (*c).to_string()).collect(),
                correct: None,
            },
        )
    }

    /// Shorthand for a numeric field.
    #[must_use]
    pub fn numeric(id: impl Into<FieldId>, min: Option<i64>, max: Option<i64>) -> Self {
        Self::new(id, FieldKind::Numeric { min, max })
    }

    /// Shorthand for a scale field.
    #[must_use]
    pub fn scale(id: impl Into<FieldId>, labels: &[&str]) -> Self {
        Self::new(
            id,
            FieldKind::Scale {
                labels: labels.iter().map(|c| (*c).to_string()).collect(),
            },
        )
    }

    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    /// Set the expected answer of a choice field. No effect on other kinds.
    #[must_use]
    pub fn with_correct(mut self, index: usize) -> Self {
        if let FieldKind::Choice { correct, .. } = &mut self.kind {
            *correct = Some(index);
        }
        self
    }

    /// Effective required flag given the step default.
    #[must_use]
    pub fn is_required(&self, step_default: bool) -> bool {
        self.required.unwrap_or(step_default)
    }

    /// Check the declaration itself.
    pub fn check(&self, step: &StepId) -> Result<(), SequencerError> {
        let bad = |msg: String| {
            Err(SequencerError::InvalidDefinition(format!(
                "step {} field {}: {}",
                step, self.id, msg
            )))
        };
        match &self.kind {
            FieldKind::Choice { choices, correct } => {
                if choices.is_empty() {
                    return bad("choice field has no choices".into());
                }
                if choices.len() > MAX_CHOICES {
                    return Err(SequencerError::LimitExceeded(format!(
                        "step {} field {} has {} choices (maximum {})",
                        step,
                        self.id,
                        choices.len(),
                        MAX_CHOICES
                    )));
                }
                if let Some(c) = correct.filter(|c| *c >= choices.len()) {
                    return bad(format!("correct choice {} out of range", c));
                }
            }
            FieldKind::Numeric { min, max } => {
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        return bad(format!("min {} is greater than max {}", lo, hi));
                    }
                }
            }
            FieldKind::Scale { labels } => {
                if labels.len() < 2 {
                    return bad("scale needs at least two points".into());
                }
                if labels.len() > MAX_CHOICES {
                    return Err(SequencerError::LimitExceeded(format!(
                        "step {} field {} has {} scale points (maximum {})",
                        step,
                        self.id,
                        labels.len(),
                        MAX_CHOICES
                    )));
                }
            }
            FieldKind::Text { .. } => {}
        }
        Ok(())
    }

    /// Check a present value against this declaration.
    fn check_value(&self, value: &FieldValue) -> Option<FailureReason> {
        match &self.kind {
            FieldKind::Choice { choices, .. } => {
                let ok = match value {
                    FieldValue::Integer(i) => {
                        usize::try_from(*i).is_ok_and(|i| i < choices.len())
                    }
                    FieldValue::Choice(s) | FieldValue::Text(s) => {
                        choices.iter().any(|c| c == s)
                    }
                };
                (!ok).then_some(FailureReason::NotAChoice)
            }
            FieldKind::Numeric { min, max } => match value.as_integer() {
                None => Some(FailureReason::NotNumeric),
                Some(n) if min.is_some_and(|lo| n < lo) => Some(FailureReason::BelowMin),
                Some(n) if max.is_some_and(|hi| n > hi) => Some(FailureReason::AboveMax),
                Some(_) => None,
            },
            FieldKind::Scale { labels } => {
                let by_label = value
                    .as_label()
                    .is_some_and(|s| labels.iter().any(|l| l == s));
                let by_point = value
                    .as_integer()
                    .and_then(|n| usize::try_from(n).ok())
                    .is_some_and(|n| (1..=labels.len()).contains(&n));
                (!(by_label || by_point)).then_some(FailureReason::OutOfScale)
            }
            FieldKind::Text { max_length } => max_length
                .is_some_and(|max| value.text_len() > max)
                .then_some(FailureReason::TooLong),
        }
    }

    /// Whether `value` matches the declared correct answer, if one is declared.
    #[must_use]
    pub fn is_correct(&self, value: Option<&FieldValue>) -> Option<bool> {
        let FieldKind::Choice {
            choices,
            correct: Some(expected),
        } = &self.kind
        else {
            return None;
        };
        let hit = match value {
            Some(FieldValue::Integer(i)) => usize::try_from(*i).is_ok_and(|i| i == *expected),
            Some(FieldValue::Choice(s) | FieldValue::Text(s)) => {
                choices.get(*expected).is_some_and(|c| c == s)
            }
            None => false,
        };
        Some(hit)
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Why a field failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Missing,
    NotNumeric,
    BelowMin,
    AboveMax,
    NotAChoice,
    OutOfScale,
    TooLong,
    /// Rejected by a step's `on_validate` hook.
    Rejected(String),
}

/// One failing field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFailure {
    pub field: FieldId,
    pub reason: FailureReason,
}

impl FieldFailure {
    #[must_use]
    pub fn new(field: impl Into<FieldId>, reason: FailureReason) -> Self {
        Self {
            field: field.into(),
            reason,
        }
    }
}

/// Outcome of validating one step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub failures: Vec<FieldFailure>,
}

impl ValidationReport {
    #[must_use]
    pub fn from_failures(failures: Vec<FieldFailure>) -> Self {
        Self {
            valid: failures.is_empty(),
            failures,
        }
    }

    /// Ids of the failing fields, in declaration order, without repeats.
    #[must_use]
    pub fn failed_fields(&self) -> Vec<FieldId> {
        let mut ids: Vec<FieldId> = Vec::with_capacity(self.failures.len());
        for failure in &self.failures {
            if !ids.contains(&failure.field) {
                ids.push(failure.field.clone());
            }
        }
        ids
    }

    /// Per-field outcome for every declared field: `false` when the field
    /// has at least one failure.
    #[must_use]
    pub fn field_validity(&self, specs: &[FieldSpec]) -> BTreeMap<FieldId, bool> {
        specs
            .iter()
            .map(|spec| {
                let ok = !self.failures.iter().any(|f| f.field == spec.id);
                (spec.id.clone(), ok)
            })
            .collect()
    }

    /// Append failures reported by a hook.
    pub fn extend(&mut self, more: Vec<FieldFailure>) {
        self.failures.extend(more);
        self.valid = self.failures.is_empty();
    }
}

/// Validate `values` against the declared fields.
///
/// - Absent required fields fail with `Missing` (an empty text counts as absent).
/// - Present fields are checked against their kind even when optional.
/// - A step with zero required fields and no present values always validates.
#[must_use]
pub fn validate_fields(
    specs: &[FieldSpec],
    default_required: bool,
    values: &FieldMap,
) -> ValidationReport {
    let mut failures = Vec::new();
    for spec in specs {
        let value = values
            .get(&spec.id)
            .filter(|v| !matches!(v, FieldValue::Text(s) if s.trim().is_empty()));
        match value {
            None if spec.is_required(default_required) => {
                failures.push(FieldFailure::new(spec.id.clone(), FailureReason::Missing));
            }
            None => {}
            Some(v) => {
                if let Some(reason) = spec.check_value(v) {
                    failures.push(FieldFailure::new(spec.id.clone(), reason));
                }
            }
        }
    }
    ValidationReport::from_failures(failures)
}

/// Correctness of every field that declares an expected answer.
#[must_use]
pub fn grade_fields(specs: &[FieldSpec], values: &FieldMap) -> BTreeMap<FieldId, bool> {
    specs
        .iter()
        .filter_map(|spec| {
            spec.is_correct(values.get(&spec.id))
                .map(|hit| (spec.id.clone(), hit))
        })
        .collect()
}

// =============================================================================
// RESPONSE STORE
// =============================================================================

/// A finalized, read-only set of values for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// One-based revision number.
    pub number: u32,
    pub fields: FieldMap,
    pub correct: BTreeMap<FieldId, bool>,
    /// Validation outcome per declared field at finalization time.
    pub valid: BTreeMap<FieldId, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StepResponses {
    draft: Option<FieldMap>,
    revisions: Vec<Revision>,
}

/// All responses of one session, keyed by step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStore {
    steps: BTreeMap<StepId, StepResponses>,
}

impl ResponseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The open draft of a step, if any.
    #[must_use]
    pub fn draft(&self, step: &StepId) -> Option<&FieldMap> {
        self.steps.get(step).and_then(|s| s.draft.as_ref())
    }

    /// Values currently attributed to a step: the draft if open,
    /// otherwise the latest revision.
    #[must_use]
    pub fn current_values(&self, step: &StepId) -> FieldMap {
        match self.steps.get(step) {
            Some(StepResponses { draft: Some(d), .. }) => d.clone(),
            Some(StepResponses { revisions, .. }) => revisions
                .last()
                .map(|r| r.fields.clone())
                .unwrap_or_default(),
            None => FieldMap::new(),
        }
    }

    /// Open a draft for `step`, seeded from the latest revision.
    /// An already open draft is left as is.
    pub fn open_draft(&mut self, step: &StepId) -> &FieldMap {
        let entry = self.steps.entry(step.clone()).or_default();
        let seed = entry
            .revisions
            .last()
            .map(|r| r.fields.clone())
            .unwrap_or_default();
        entry.draft.get_or_insert(seed)
    }

    /// Write one value into the draft, opening it if needed.
    pub fn set_draft_value(&mut self, step: &StepId, field: FieldId, value: FieldValue) {
        self.open_draft(step);
        if let Some(draft) = self.steps.get_mut(step).and_then(|s| s.draft.as_mut()) {
            draft.insert(field, value);
        }
    }

    /// Overlay `values` onto the draft. Existing keys are replaced.
    pub fn merge_draft(&mut self, step: &StepId, values: FieldMap) {
        self.open_draft(step);
        if let Some(draft) = self.steps.get_mut(step).and_then(|s| s.draft.as_mut()) {
            draft.extend(values);
        }
    }

    /// Close the draft into a new immutable revision and return a copy of it.
    pub fn finalize(
        &mut self,
        step: &StepId,
        correct: BTreeMap<FieldId, bool>,
        valid: BTreeMap<FieldId, bool>,
    ) -> Revision {
        let entry = self.steps.entry(step.clone()).or_default();
        let fields = entry.draft.take().unwrap_or_default();
        let number = u32::try_from(entry.revisions.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        let revision = Revision {
            number,
            fields,
            correct,
            valid,
        };
        entry.revisions.push(revision.clone());
        revision
    }

    /// The most recent revision of a step.
    #[must_use]
    pub fn latest(&self, step: &StepId) -> Option<&Revision> {
        self.steps.get(step).and_then(|s| s.revisions.last())
    }

    /// Every revision of a step, oldest first.
    #[must_use]
    pub fn revisions(&self, step: &StepId) -> &[Revision] {
        self.steps
            .get(step)
            .map(|s| s.revisions.as_slice())
            .unwrap_or(&[])
    }

    /// Latest finalized value of a field. Drafts are not visible here.
    #[must_use]
    pub fn value(&self, step: &StepId, field: &FieldId) -> Option<&FieldValue> {
        self.latest(step).and_then(|r| r.fields.get(field))
    }

    #[must_use]
    pub fn is_finalized(&self, step: &StepId) -> bool {
        self.latest(step).is_some()
    }

    /// Steps with at least one revision, in id order.
    pub fn finalized_steps(&self) -> impl Iterator<Item = &StepId> {
        self.steps
            .iter()
            .filter(|(_, s)| !s.revisions.is_empty())
            .map(|(id, _)| id)
    }
}

// =============================================================================
// TESTS
// =============================================================================
