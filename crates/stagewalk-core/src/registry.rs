//! # Stage Registry
//!
//! Orders registered steps into stages and stages into a
//! [`SequenceDefinition`], parameterized by a treatment tag.
//!
//! ## Construction
//!
//! - [`StepStore::build_sequence`]: one stage per step, in the given order.
//! - [`SequenceBuilder`]: stages with several steps, per-stage and per-step
//!   overrides, explicit skip marks, and a [`TreatmentPlan`].
//!
//! Skip flags are the only mutable part of a definition, and only until a
//! sequencer starts walking it. Skips that depend on answers are resolved
//! later by the branch resolver.

use crate::branch::Condition;
use crate::descriptor::{ContentRef, DoneButton, StepDescriptor, StepHooks, StepStore};
use crate::primitives::{validate_id, validate_treatment};
use crate::{SequencerError, StageId, StepId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// STAGES
// =============================================================================

/// A step slot inside a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStep {
    pub id: StepId,
    /// Static skip flag of this step alone.
    pub skipped: bool,
}

impl StageStep {
    #[must_use]
    pub fn new(id: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            skipped: false,
        }
    }
}

/// An ordered, non-empty group of steps.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub steps: Vec<StageStep>,
    /// Static skip flag of the whole stage.
    pub skipped: bool,
    /// Dynamic skip of the whole stage.
    pub skip_if: Option<Condition>,
}

/// A (stage, step) coordinate in a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub stage: usize,
    pub step: usize,
}

impl Position {
    #[must_use]
    pub const fn new(stage: usize, step: usize) -> Self {
        Self { stage, step }
    }
}

// =============================================================================
// SEQUENCE DEFINITION
// =============================================================================

/// The fully ordered stages of one session plus its treatment tag.
#[derive(Debug, Clone)]
pub struct SequenceDefinition {
    stages: Vec<Stage>,
    descriptors: BTreeMap<StepId, StepDescriptor>,
    treatment: String,
    locked: bool,
}

impl SequenceDefinition {
    #[must_use]
    pub fn treatment(&self) -> &str {
        &self.treatment
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Freeze skip flags. Called when traversal starts.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    #[must_use]
    pub fn descriptor(&self, id: &StepId) -> Option<&StepDescriptor> {
        self.descriptors.get(id)
    }

    /// Every descriptor used by this sequence, in id order.
    pub fn descriptors(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.descriptors.values()
    }

    #[must_use]
    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    #[must_use]
    pub fn step_at(&self, pos: Position) -> Option<&StageStep> {
        self.stages.get(pos.stage).and_then(|s| s.steps.get(pos.step))
    }

    /// Where a step sits in the sequence.
    #[must_use]
    pub fn position_of(&self, id: &StepId) -> Option<Position> {
        self.stages.iter().enumerate().find_map(|(si, stage)| {
            stage
                .steps
                .iter()
                .position(|s| &s.id == id)
                .map(|pi| Position::new(si, pi))
        })
    }

    /// The position after `pos`, crossing stage boundaries.
    #[must_use]
    pub fn next_position(&self, pos: Position) -> Option<Position> {
        let stage = self.stages.get(pos.stage)?;
        if pos.step + 1 < stage.steps.len() {
            return Some(Position::new(pos.stage, pos.step + 1));
        }
        (pos.stage + 1 < self.stages.len()).then(|| Position::new(pos.stage + 1, 0))
    }

    /// All step ids in traversal order.
    #[must_use]
    pub fn step_ids(&self) -> Vec<&StepId> {
        self.stages
            .iter()
            .flat_map(|s| s.steps.iter().map(|p| &p.id))
            .collect()
    }

    #[must_use]
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    /// Toggle the static skip flag of a stage or step.
    ///
    /// Stage ids are matched before step ids. Idempotent. Fails with
    /// `SequenceLocked` once traversal started.
    pub fn mark_skipped(&mut self, id: &str, skipped: bool) -> Result<(), SequencerError> {
        if self.locked {
            return Err(SequencerError::SequenceLocked);
        }
        if let Some(stage) = self.stages.iter_mut().find(|s| s.id.as_str() == id) {
            stage.skipped = skipped;
            return Ok(());
        }
        let step = self
            .stages
            .iter_mut()
            .flat_map(|s| s.steps.iter_mut())
            .find(|s| s.id.as_str() == id)
            .ok_or_else(|| SequencerError::UnknownStep(id.to_string()))?;
        step.skipped = skipped;
        Ok(())
    }

    /// Whether a step is statically skipped, by itself or through its stage.
    #[must_use]
    pub fn is_statically_skipped(&self, id: &StepId) -> bool {
        self.position_of(id).is_some_and(|pos| {
            let stage_flag = self.stages.get(pos.stage).is_some_and(|s| s.skipped);
            let step_flag = self.step_at(pos).is_some_and(|s| s.skipped);
            stage_flag || step_flag
        })
    }
}

// =============================================================================
// TREATMENT PLAN
// =============================================================================

/// When a treatment rule applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreatmentMatch {
    /// The session treatment is one of these.
    When(BTreeSet<String>),
    /// The session treatment is none of these.
    Unless(BTreeSet<String>),
}

impl TreatmentMatch {
    #[must_use]
    pub fn matches(&self, treatment: &str) -> bool {
        match self {
            TreatmentMatch::When(set) => set.contains(treatment),
            TreatmentMatch::Unless(set) => !set.contains(treatment),
        }
    }
}

/// Skip a set of stage/step ids under a treatment condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentRule {
    pub skip: Vec<String>,
    pub matches: TreatmentMatch,
}

/// Static skip rules keyed on the treatment tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentPlan {
    rules: Vec<TreatmentRule>,
}

impl TreatmentPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip `ids` when the treatment is one of `treatments`.
    #[must_use]
    pub fn skip_when(mut self, treatments: &[&str], ids: &[&str]) -> Self {
        self.rules.push(TreatmentRule {
            skip: ids.iter().map(|s| (*s).to_string()).collect(),
            matches: TreatmentMatch::When(to_set(treatments)),
        });
        self
    }

    /// Skip `ids` when the treatment is none of `treatments`.
    #[must_use]
    pub fn skip_unless(mut self, treatments: &[&str], ids: &[&str]) -> Self {
        self.rules.push(TreatmentRule {
            skip: ids.iter().map(|s| (*s).to_string()).collect(),
            matches: TreatmentMatch::Unless(to_set(treatments)),
        });
        self
    }

    pub fn push(&mut self, rule: TreatmentRule) {
        self.rules.push(rule);
    }

    #[must_use]
    pub fn rules(&self) -> &[TreatmentRule] {
        &self.rules
    }

    /// Ids statically skipped under `treatment`.
    #[must_use]
    pub fn static_skips(&self, treatment: &str) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|r| r.matches.matches(treatment))
            .flat_map(|r| r.skip.iter().cloned())
            .collect()
    }
}

fn to_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

// =============================================================================
// OVERRIDES
// =============================================================================

/// Per-stage or per-step changes applied on top of the registered descriptor.
#[derive(Clone, Default)]
pub struct StepOverride {
    pub allow_back: Option<bool>,
    pub back_across_stages: Option<bool>,
    pub done_button: Option<DoneButton>,
    pub content: Option<ContentRef>,
    pub hooks: Option<Arc<dyn StepHooks>>,
}

impl std::fmt::Debug for StepOverride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepOverride")
            .field("allow_back", &self.allow_back)
            .field("back_across_stages", &self.back_across_stages)
            .field("done_button", &self.done_button)
            .field("content", &self.content)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

impl StepOverride {
    fn apply(&self, descriptor: &mut StepDescriptor) {
        if let Some(allow) = self.allow_back {
            descriptor.navigation.allow_back = allow;
        }
        if let Some(across) = self.back_across_stages {
            descriptor.navigation.back_across_stages = across;
        }
        if let Some(done) = self.done_button {
            descriptor.done_button = done;
        }
        if let Some(content) = &self.content {
            descriptor.content = content.clone();
        }
        if let Some(hooks) = &self.hooks {
            descriptor.hooks = Arc::clone(hooks);
        }
    }
}

// =============================================================================
// SEQUENCE BUILDER
// =============================================================================

#[derive(Debug, Clone)]
struct PendingStage {
    id: StageId,
    steps: Vec<StepId>,
    skip_if: Option<Condition>,
    overrides: Option<StepOverride>,
}

/// Declarative construction of a [`SequenceDefinition`].
///
/// ```
/// use stagewalk_core::{SequenceBuilder, StepDescriptor, StepStore, TreatmentPlan};
///
/// let mut store = StepStore::new();
/// for id in ["consent", "inPrincipleWTP", "theoreticalWTP", "betterplace", "end"] {
///     store.register(StepDescriptor::new(id)).unwrap();
/// }
/// let definition = SequenceBuilder::new()
///     .stage("consent")
///     .stage("donation")
///     .step("inPrincipleWTP")
///     .step("theoreticalWTP")
///     .step("betterplace")
///     .stage("end")
///     .treatment_plan(
///         TreatmentPlan::new()
///             .skip_when(&["TWTP"], &["betterplace"])
///             .skip_unless(&["TWTP"], &["theoreticalWTP"]),
///     )
///     .build(&store, "A")
///     .unwrap();
/// assert_eq!(definition.step_count(), 5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequenceBuilder {
    stages: Vec<PendingStage>,
    step_overrides: BTreeMap<StepId, StepOverride>,
    marks: Vec<(String, bool)>,
    plan: TreatmentPlan,
}

impl SequenceBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new stage. A stage that receives no `step` calls holds a
    /// single step with the stage's id.
    #[must_use]
    pub fn stage(mut self, id: impl Into<StageId>) -> Self {
        self.stages.push(PendingStage {
            id: id.into(),
            steps: Vec::new(),
            skip_if: None,
            overrides: None,
        });
        self
    }

    /// Append a step to the current stage, or open a stage named after the
    /// step if none is open.
    #[must_use]
    pub fn step(mut self, id: impl Into<StepId>) -> Self {
        let id = id.into();
        match self.stages.last_mut() {
            Some(stage) => stage.steps.push(id),
            None => self.stages.push(PendingStage {
                id: StageId::new(id.as_str()),
                steps: vec![id],
                skip_if: None,
                overrides: None,
            }),
        }
        self
    }

    /// Dynamic skip for the current stage.
    #[must_use]
    pub fn stage_skip_if(mut self, condition: Condition) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.skip_if = Some(condition);
        }
        self
    }

    /// Overrides for every step of the current stage.
    #[must_use]
    pub fn stage_override(mut self, overrides: StepOverride) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.overrides = Some(overrides);
        }
        self
    }

    /// Overrides for one step. Applied after stage overrides.
    #[must_use]
    pub fn step_override(mut self, id: impl Into<StepId>, overrides: StepOverride) -> Self {
        self.step_overrides.insert(id.into(), overrides);
        self
    }

    /// Static skip mark by stage or step id.
    #[must_use]
    pub fn mark_skipped(mut self, id: impl Into<String>, skipped: bool) -> Self {
        self.marks.push((id.into(), skipped));
        self
    }

    #[must_use]
    pub fn treatment_plan(mut self, plan: TreatmentPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Resolve every id against `store` and produce the definition.
    ///
    /// Treatment rules are applied first, explicit marks after them.
    pub fn build(
        self,
        store: &StepStore,
        treatment: &str,
    ) -> Result<SequenceDefinition, SequencerError> {
        validate_treatment(treatment)?;
        if self.stages.is_empty() {
            return Err(SequencerError::EmptySequence);
        }

        let mut stage_ids = BTreeSet::new();
        let mut descriptors: BTreeMap<StepId, StepDescriptor> = BTreeMap::new();
        let mut stages = Vec::with_capacity(self.stages.len());

        for pending in self.stages {
            validate_id("stage", pending.id.as_str())?;
            if !stage_ids.insert(pending.id.clone()) {
                return Err(SequencerError::DuplicateId(pending.id.to_string()));
            }
            let step_ids = if pending.steps.is_empty() {
                vec![StepId::new(pending.id.as_str())]
            } else {
                pending.steps
            };

            let mut steps = Vec::with_capacity(step_ids.len());
            for id in step_ids {
                let mut descriptor = store
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| SequencerError::UnknownStep(id.to_string()))?;
                if descriptors.contains_key(&id) {
                    return Err(SequencerError::DuplicateId(id.to_string()));
                }
                if let Some(overrides) = &pending.overrides {
                    overrides.apply(&mut descriptor);
                }
                if let Some(overrides) = self.step_overrides.get(&id) {
                    overrides.apply(&mut descriptor);
                }
                descriptors.insert(id.clone(), descriptor);
                steps.push(StageStep::new(id));
            }

            stages.push(Stage {
                id: pending.id,
                steps,
                skipped: false,
                skip_if: pending.skip_if,
            });
        }

        if let Some(unknown) = self
            .step_overrides
            .keys()
            .find(|id| !descriptors.contains_key(*id))
        {
            return Err(SequencerError::UnknownStep(unknown.to_string()));
        }

        let mut definition = SequenceDefinition {
            stages,
            descriptors,
            treatment: treatment.to_string(),
            locked: false,
        };

        for id in self.plan.static_skips(treatment) {
            definition.mark_skipped(&id, true)?;
        }
        for (id, skipped) in &self.marks {
            definition.mark_skipped(id, *skipped)?;
        }

        tracing::debug!(
            treatment,
            stages = definition.stages.len(),
            steps = definition.step_count(),
            "sequence built"
        );
        Ok(definition)
    }
}

impl StepStore {
    /// Build a sequence with one stage per step, in `order`.
    pub fn build_sequence(
        &self,
        order: &[StepId],
        treatment: &str,
    ) -> Result<SequenceDefinition, SequencerError> {
        if order.is_empty() {
            return Err(SequencerError::EmptySequence);
        }
        order
            .iter()
            .fold(SequenceBuilder::new(), |builder, id| {
                builder.stage(id.as_str()).step(id.clone())
            })
            .build(self, treatment)
    }
}

// =============================================================================
// TESTS
// =============================================================================
