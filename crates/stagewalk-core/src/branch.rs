//! # Branch Resolver
//!
//! Decides, every time the engine reaches a `Pending` position, whether the
//! step is shown or skipped.
//!
//! Two independent checks run per position: one for the enclosing stage and
//! one for the step itself. Each check has a static part (skip flags set at
//! build time from the treatment) and a dynamic part (a [`Condition`] over
//! the finalized responses). Dynamic skips win over static ones.

use crate::registry::{Stage, StageStep};
use crate::response::ResponseStore;
use crate::{FieldId, StepId};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// CONDITIONS
// =============================================================================

/// Predicate signature for code-defined conditions.
pub type ConditionFn = dyn Fn(&ResponseStore, &str) -> bool + Send + Sync;

/// A declarative predicate over finalized responses and the treatment.
///
/// Answers that have not been finalized yet are treated as absent, so
/// `Equals` on a missing answer is false and `NotEquals` is true.
#[derive(Clone)]
pub enum Condition {
    /// The latest answer of `step.field` renders as `value`.
    Equals {
        step: StepId,
        field: FieldId,
        value: String,
    },
    /// The latest answer of `step.field` does not render as `value`.
    NotEquals {
        step: StepId,
        field: FieldId,
        value: String,
    },
    /// `step.field` has a finalized answer.
    Answered { step: StepId, field: FieldId },
    /// The session runs under this treatment.
    Treatment(String),
    Any(Vec<Condition>),
    All(Vec<Condition>),
    Not(Box<Condition>),
    /// Arbitrary code, given the responses and the treatment.
    Custom(Arc<ConditionFn>),
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Equals { step, field, value } => {
                write!(f, "Equals({}.{} == {:?})", step, field, value)
            }
            Condition::NotEquals { step, field, value } => {
                write!(f, "NotEquals({}.{} != {:?})", step, field, value)
            }
            Condition::Answered { step, field } => write!(f, "Answered({}.{})", step, field),
            Condition::Treatment(t) => write!(f, "Treatment({:?})", t),
            Condition::Any(all) => f.debug_tuple("Any").field(all).finish(),
            Condition::All(all) => f.debug_tuple("All").field(all).finish(),
            Condition::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Condition::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Condition {
    /// Shorthand for `Equals`.
    #[must_use]
    pub fn equals(
        step: impl Into<StepId>,
        field: impl Into<FieldId>,
        value: impl Into<String>,
    ) -> Self {
        Condition::Equals {
            step: step.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    /// Evaluate against the finalized responses of a session.
    #[must_use]
    pub fn evaluate(&self, responses: &ResponseStore, treatment: &str) -> bool {
        match self {
            Condition::Equals { step, field, value } => responses
                .value(step, field)
                .is_some_and(|v| v.to_string() == *value),
            Condition::NotEquals { step, field, value } => responses
                .value(step, field)
                .is_none_or(|v| v.to_string() != *value),
            Condition::Answered { step, field } => responses.value(step, field).is_some(),
            Condition::Treatment(t) => t == treatment,
            Condition::Any(all) => all.iter().any(|c| c.evaluate(responses, treatment)),
            Condition::All(all) => all.iter().all(|c| c.evaluate(responses, treatment)),
            Condition::Not(inner) => !inner.evaluate(responses, treatment),
            Condition::Custom(f) => f(responses, treatment),
        }
    }

    /// Steps whose answers this condition reads. `Custom` reads are unknown.
    #[must_use]
    pub fn referenced_steps(&self) -> Vec<&StepId> {
        match self {
            Condition::Equals { step, .. }
            | Condition::NotEquals { step, .. }
            | Condition::Answered { step, .. } => vec![step],
            Condition::Any(all) | Condition::All(all) => {
                all.iter().flat_map(Condition::referenced_steps).collect()
            }
            Condition::Not(inner) => inner.referenced_steps(),
            Condition::Treatment(_) | Condition::Custom(_) => Vec::new(),
        }
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Outcome of a skip check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Show,
    /// Skipped by a build-time flag (treatment or explicit marking).
    Static,
    /// Skipped by a condition over earlier answers.
    Dynamic,
}

impl SkipDecision {
    #[must_use]
    pub fn is_skip(self) -> bool {
        self != SkipDecision::Show
    }
}

/// Stateless skip resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct BranchResolver;

impl BranchResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolve the stage boundary and the step boundary independently.
    ///
    /// `step_condition` is the step descriptor's `skip_if`.
    #[must_use]
    pub fn resolve(
        &self,
        stage: &Stage,
        step: &StageStep,
        step_condition: Option<&Condition>,
        responses: &ResponseStore,
        treatment: &str,
    ) -> SkipDecision {
        let stage_dynamic = stage
            .skip_if
            .as_ref()
            .is_some_and(|c| c.evaluate(responses, treatment));
        let step_dynamic = step_condition.is_some_and(|c| c.evaluate(responses, treatment));
        if stage_dynamic || step_dynamic {
            return SkipDecision::Dynamic;
        }
        if stage.skipped || step.skipped {
            return SkipDecision::Static;
        }
        SkipDecision::Show
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldValue, StageId};
    use std::collections::BTreeMap;

    fn answered(step: &str, field: &str, value: &str) -> ResponseStore {
        let mut store = ResponseStore::new();
        let step = StepId::new(step);
        store.set_draft_value(&step, FieldId::new(field), FieldValue::Choice(value.into()));
        store.finalize(&step, BTreeMap::new(), BTreeMap::new());
        store
    }

    fn stage(id: &str, skipped: bool) -> Stage {
        Stage {
            id: StageId::new(id),
            steps: vec![StageStep::new(id)],
            skipped,
            skip_if: None,
        }
    }

    #[test]
    fn missing_answer_never_equals() {
        let store = ResponseStore::new();
        let cond = Condition::equals("inPrincipleWTP", "inPrincipleWTP-1", "No");
        assert!(!cond.evaluate(&store, "A"));
        let not = Condition::NotEquals {
            step: "inPrincipleWTP".into(),
            field: "inPrincipleWTP-1".into(),
            value: "No".into(),
        };
        assert!(not.evaluate(&store, "A"));
    }

    #[test]
    fn equals_reads_finalized_answer() {
        let store = answered("inPrincipleWTP", "inPrincipleWTP-1", "No");
        let cond = Condition::equals("inPrincipleWTP", "inPrincipleWTP-1", "No");
        assert!(cond.evaluate(&store, "A"));
        let yes = Condition::equals("inPrincipleWTP", "inPrincipleWTP-1", "Yes");
        assert!(!yes.evaluate(&store, "A"));
    }

    #[test]
    fn combinators() {
        let store = answered("q", "f", "x");
        let yes = Condition::equals("q", "f", "x");
        let no = Condition::equals("q", "f", "y");
        assert!(Condition::Any(vec![no.clone(), yes.clone()]).evaluate(&store, ""));
        assert!(!Condition::All(vec![no.clone(), yes.clone()]).evaluate(&store, ""));
        assert!(Condition::Not(Box::new(no)).evaluate(&store, ""));
        assert!(Condition::Treatment("TWTP".into()).evaluate(&store, "TWTP"));
        let custom = Condition::Custom(Arc::new(|r: &ResponseStore, _t: &str| {
            r.is_finalized(&StepId::new("q"))
        }));
        assert!(custom.evaluate(&store, ""));
    }

    #[test]
    fn dynamic_beats_static() {
        let resolver = BranchResolver::new();
        let store = answered("inPrincipleWTP", "inPrincipleWTP-1", "No");
        let cond = Condition::equals("inPrincipleWTP", "inPrincipleWTP-1", "No");

        let shown = stage("betterplace", false);
        let step = StageStep::new("betterplace");
        assert_eq!(
            resolver.resolve(&shown, &step, Some(&cond), &store, "A"),
            SkipDecision::Dynamic
        );

        let hidden = stage("betterplace", true);
        assert_eq!(
            resolver.resolve(&hidden, &step, Some(&cond), &store, "A"),
            SkipDecision::Dynamic
        );
        assert_eq!(
            resolver.resolve(&hidden, &step, None, &store, "A"),
            SkipDecision::Static
        );
        assert_eq!(
            resolver.resolve(&shown, &step, None, &store, "A"),
            SkipDecision::Show
        );
    }

    #[test]
    fn stage_and_step_checked_independently() {
        let resolver = BranchResolver::new();
        let store = ResponseStore::new();
        let mut group = stage("matrix", false);
        group.steps.push(StageStep::new("matrix-2"));
        let mut skipped_step = StageStep::new("matrix-2");
        skipped_step.skipped = true;

        assert_eq!(
            resolver.resolve(&group, &StageStep::new("matrix"), None, &store, ""),
            SkipDecision::Show
        );
        assert_eq!(
            resolver.resolve(&group, &skipped_step, None, &store, ""),
            SkipDecision::Static
        );

        group.skip_if = Some(Condition::Treatment("B".into()));
        assert_eq!(
            resolver.resolve(&group, &StageStep::new("matrix"), None, &store, "B"),
            SkipDecision::Dynamic
        );
    }

    #[test]
    fn referenced_steps_walks_tree() {
        let cond = Condition::All(vec![
            Condition::equals("a", "f", "1"),
            Condition::Not(Box::new(Condition::Answered {
                step: "b".into(),
                field: "g".into(),
            })),
        ]);
        let refs: Vec<&str> = cond
            .referenced_steps()
            .into_iter()
            .map(StepId::as_str)
            .collect();
        assert_eq!(refs, vec!["a", "b"]);
    }
}
