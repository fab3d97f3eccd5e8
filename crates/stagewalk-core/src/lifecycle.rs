//! # Step Lifecycle Engine
//!
//! The per-session state machine that walks a [`SequenceDefinition`].
//!
//! ## Step States
//!
//! | From | To | Trigger |
//! |------|----|---------|
//! | Pending | Skipped | branch resolver reports a skip |
//! | Pending | Entering | normal entry; `on_enter` runs |
//! | Entering | Active | `on_enter` returned `Continue` |
//! | Entering | Exiting | `on_enter` returned `FinishStep` |
//! | Active | Validating | `advance` |
//! | Validating | Active | validation failed |
//! | Validating | Exiting | validation passed; `on_exit` runs |
//! | Exiting | Done | draft finalized, record emitted |
//! | Active | Pending | `go_back` away from the step |
//!
//! Reaching a terminal step finishes it on entry and moves the session to
//! `GameOver`; every later transition fails with `SequenceTerminated`.
//!
//! ## Solo Progression
//!
//! One sequencer belongs to one participant and shares no mutable state.
//! Transitions take `&mut self`, so two transitions can never interleave
//! in-process. A hook that returns [`HookFlow::Await`] suspends the session
//! until [`Sequencer::resolve_pending`] reports the outcome; while suspended
//! every transition fails with `ConcurrentTransition`.

use crate::branch::{BranchResolver, SkipDecision};
use crate::cursor::SessionCursor;
use crate::descriptor::{
    ContentRef, DoneButton, HookContext, HookError, HookFlow, StepDescriptor, ValidationContext,
};
use crate::primitives::{MAX_TEXT_VALUE_LENGTH, validate_id};
use crate::registry::{Position, SequenceDefinition};
use crate::renderer::{RenderHandle, Renderer, RendererRegistry};
use crate::response::{FieldSpec, ResponseStore, ValidationReport, grade_fields, validate_fields};
use crate::transport::{FinalizedRecord, NullSink, RecordSink};
use crate::{AuxState, FieldId, FieldMap, FieldValue, SequencerError, StageId, StepId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// STATES
// =============================================================================

/// Lifecycle state of one step within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Entering,
    Active,
    Validating,
    Exiting,
    Done,
    Skipped,
}

impl StepState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Entering => "entering",
            StepState::Active => "active",
            StepState::Validating => "validating",
            StepState::Exiting => "exiting",
            StepState::Done => "done",
            StepState::Skipped => "skipped",
        }
    }

    /// `Done` and `Skipped` end a step's pass through the sequence.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Done | StepState::Skipped)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Process-level state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NotStarted,
    Running,
    /// An `on_enter` hook is waiting for asynchronous work.
    Suspended,
    GameOver,
}

/// Read-only view of the step under the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepView {
    pub step: StepId,
    pub stage: StageId,
    pub display_name: String,
    pub state: StepState,
    pub content: ContentRef,
    pub done_button: DoneButton,
    pub can_go_back: bool,
    pub fields: Vec<FieldSpec>,
    /// Values currently attributed to the step.
    pub values: FieldMap,
    pub terminal: bool,
    pub paused: bool,
    pub awaiting: bool,
}

/// Everything needed to rebuild a session on top of the same definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: String,
    pub treatment: String,
    pub phase: SessionPhase,
    pub paused: bool,
    pub cursor: SessionCursor,
    pub states: BTreeMap<StepId, StepState>,
    pub entered_once: BTreeSet<StepId>,
    pub responses: ResponseStore,
    pub aux: AuxState,
    /// The suspended step was entered through back navigation.
    pub pending_back: bool,
    pub transport_failures: u64,
    pub hook_failures: u64,
}

// =============================================================================
// SEQUENCER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Forward,
    Back,
}

/// Outcome of entering one position.
enum Entered {
    /// The cursor rests here (active, awaiting, or the session ended).
    Rest,
    /// The step finished on its own; continue with the next position.
    Next,
}

struct Presentation {
    handle: RenderHandle,
    renderer: Arc<dyn Renderer>,
}

/// One participant's walk through a sequence.
pub struct Sequencer {
    session: String,
    definition: SequenceDefinition,
    renderers: RendererRegistry,
    sink: Arc<dyn RecordSink>,
    resolver: BranchResolver,
    responses: ResponseStore,
    cursor: SessionCursor,
    states: BTreeMap<StepId, StepState>,
    entered_once: BTreeSet<StepId>,
    aux: AuxState,
    phase: SessionPhase,
    paused: bool,
    pending_back: bool,
    presentation: Option<Presentation>,
    transport_failures: u64,
    hook_failures: u64,
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("session", &self.session)
            .field("treatment", &self.definition.treatment())
            .field("phase", &self.phase)
            .field("paused", &self.paused)
            .field("position", &self.cursor.position())
            .field("history", &self.cursor.history().len())
            .finish_non_exhaustive()
    }
}

impl Sequencer {
    /// Create a sequencer for one session.
    ///
    /// Every widget referenced by the definition must resolve in `renderers`;
    /// an unknown widget is a configuration error.
    pub fn new(
        session: impl Into<String>,
        definition: SequenceDefinition,
        renderers: RendererRegistry,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self, SequencerError> {
        let session = session.into();
        validate_id("session", &session)?;
        renderers.check(&definition)?;
        let states = definition
            .step_ids()
            .into_iter()
            .map(|id| (id.clone(), StepState::Pending))
            .collect();
        Ok(Self {
            session,
            definition,
            renderers,
            sink,
            resolver: BranchResolver::new(),
            responses: ResponseStore::new(),
            cursor: SessionCursor::new(),
            states,
            entered_once: BTreeSet::new(),
            aux: AuxState::new(),
            phase: SessionPhase::NotStarted,
            paused: false,
            pending_back: false,
            presentation: None,
            transport_failures: 0,
            hook_failures: 0,
        })
    }

    /// A sequencer with passive renderers for every widget the definition
    /// names and a sink that discards records.
    pub fn passive(
        session: impl Into<String>,
        definition: SequenceDefinition,
    ) -> Result<Self, SequencerError> {
        let widgets: BTreeSet<String> = definition
            .descriptors()
            .filter_map(|d| d.content.widget.clone())
            .collect();
        let names: Vec<&str> = widgets.iter().map(String::as_str).collect();
        let renderers = RendererRegistry::passive(&names);
        Self::new(session, definition, renderers, Arc::new(NullSink))
    }

    // =========================================================================
    // CONTROL SURFACE
    // =========================================================================

    /// Lock the definition and enter the first non-skipped step.
    pub fn start(&mut self) -> Result<Option<StepView>, SequencerError> {
        match self.phase {
            SessionPhase::NotStarted => {}
            SessionPhase::GameOver => return Err(SequencerError::SequenceTerminated),
            SessionPhase::Running | SessionPhase::Suspended => {
                return Err(SequencerError::AlreadyStarted);
            }
        }
        self.definition.lock();
        self.phase = SessionPhase::Running;
        tracing::info!(
            session = %self.session,
            treatment = self.definition.treatment(),
            "session started"
        );
        self.enter_from(Some(Position::new(0, 0)), Entry::Forward)?;
        Ok(self.current_step())
    }

    /// Validate the active step and, if it passes, finish it and move on.
    ///
    /// On validation failure the step stays `Active`, the cursor does not
    /// move, and the failing field ids are returned in the error.
    pub fn advance(&mut self) -> Result<Option<StepView>, SequencerError> {
        self.ensure_running()?;
        let (pos, id) = self.active_step()?;
        let descriptor = self.descriptor(&id)?.clone();

        self.set_state(&id, StepState::Validating);
        let collected = self
            .presentation
            .as_ref()
            .map(|p| p.renderer.collect_values(p.handle));
        if let Some(values) = collected {
            self.responses.merge_draft(&id, values);
        }

        let values = self.responses.current_values(&id);
        let report = self.check_values(&descriptor, &values);
        if !report.valid {
            self.set_state(&id, StepState::Active);
            let failures = report.failed_fields();
            tracing::debug!(step = %id, failures = failures.len(), "validation failed");
            return Err(SequencerError::Validation { step: id, failures });
        }

        self.finish_step(pos, &descriptor, false, Some(report));
        self.cursor.record_visit(id);
        self.cursor.push_trail(pos);
        self.release_presentation();
        self.enter_from(self.definition.next_position(pos), Entry::Forward)?;
        Ok(self.current_step())
    }

    /// Leave the active step and re-activate the previously visited one.
    ///
    /// Rejected with `BackNotAllowed` when nothing was visited before, when
    /// the target step does not allow returning, or when the move crosses a
    /// stage boundary and the current step does not allow that.
    pub fn go_back(&mut self) -> Result<Option<StepView>, SequencerError> {
        self.ensure_running()?;
        let (_, id) = self.active_step()?;
        let target = self.back_target()?;

        self.release_presentation();
        self.set_state(&id, StepState::Pending);
        self.cursor.pop_trail();
        tracing::debug!(from = %id, stage = target.stage, step = target.step, "back navigation");
        self.enter_from(Some(target), Entry::Back)?;
        Ok(self.current_step())
    }

    /// Write one value into the active step's draft.
    pub fn set_value(
        &mut self,
        field: impl Into<FieldId>,
        value: FieldValue,
    ) -> Result<(), SequencerError> {
        let mut values = FieldMap::new();
        values.insert(field.into(), value);
        self.set_values(values)
    }

    /// Write several values into the active step's draft.
    ///
    /// Every field must be declared by the step. Nothing is written when
    /// any value is rejected.
    pub fn set_values(&mut self, values: FieldMap) -> Result<(), SequencerError> {
        self.ensure_running()?;
        let (_, id) = self.active_step()?;
        let descriptor = self.descriptor(&id)?;
        for (field, value) in &values {
            if descriptor.field_spec(field).is_none() {
                return Err(SequencerError::UnknownField {
                    step: id,
                    field: field.clone(),
                });
            }
            if value.text_len() > MAX_TEXT_VALUE_LENGTH {
                return Err(SequencerError::LimitExceeded(format!(
                    "value of {}.{} is {} bytes (maximum {})",
                    id,
                    field,
                    value.text_len(),
                    MAX_TEXT_VALUE_LENGTH
                )));
            }
        }
        if let Some(p) = &self.presentation {
            p.renderer.set_values(p.handle, &values);
        }
        self.responses.merge_draft(&id, values);
        Ok(())
    }

    /// Check a step's current values without changing anything.
    pub fn validate(&self, step: &StepId) -> Result<ValidationReport, SequencerError> {
        let descriptor = self.descriptor(step)?;
        let mut values = self.responses.current_values(step);
        if self.is_active(step) {
            if let Some(p) = &self.presentation {
                values.extend(p.renderer.collect_values(p.handle));
            }
        }
        Ok(self.check_values(descriptor, &values))
    }

    /// Freeze the session after a disconnect. Idempotent.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        if let Some(p) = &self.presentation {
            p.renderer.disable(p.handle);
        }
        tracing::info!(session = %self.session, "session paused");
    }

    /// Continue exactly where the session was paused. A no-op when the
    /// session is not paused.
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        if let Some(p) = &self.presentation {
            p.renderer.enable(p.handle);
        }
        tracing::info!(session = %self.session, "session resumed");
    }

    /// Report the outcome of the work an `on_enter` hook was waiting for.
    ///
    /// A hook error is logged and the step is activated normally. Another
    /// `Await` keeps the session suspended. A step re-entered through back
    /// navigation is activated even when the outcome is `FinishStep`.
    pub fn resolve_pending(
        &mut self,
        outcome: Result<HookFlow, HookError>,
    ) -> Result<Option<StepView>, SequencerError> {
        if self.phase != SessionPhase::Suspended {
            return Err(SequencerError::NothingPending);
        }
        let pos = self
            .cursor
            .position()
            .ok_or(SequencerError::NothingPending)?;
        let id = self.step_id_at(pos)?;
        let descriptor = self.descriptor(&id)?.clone();
        let flow = match (self.pending_back, self.absorb_hook_result(&id, outcome)) {
            (true, HookFlow::FinishStep) => HookFlow::Continue,
            (_, flow) => flow,
        };
        if flow == HookFlow::Await {
            return Ok(self.current_step());
        }
        self.phase = SessionPhase::Running;
        self.pending_back = false;
        if let Entered::Next = self.settle(pos, &descriptor, flow)? {
            self.enter_from(self.definition.next_position(pos), Entry::Forward)?;
        }
        Ok(self.current_step())
    }

    /// Toggle a static skip flag. Only possible before `start`.
    pub fn mark_skipped(&mut self, id: &str, skipped: bool) -> Result<(), SequencerError> {
        self.definition.mark_skipped(id, skipped)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// The step under the cursor, if any.
    #[must_use]
    pub fn current_step(&self) -> Option<StepView> {
        let pos = self.cursor.position()?;
        let stage = self.definition.stage(pos.stage)?;
        let slot = stage.steps.get(pos.step)?;
        let descriptor = self.definition.descriptor(&slot.id)?;
        let mut values = self.responses.current_values(&slot.id);
        if let Some(p) = &self.presentation {
            values.extend(p.renderer.collect_values(p.handle));
        }
        Some(StepView {
            step: slot.id.clone(),
            stage: stage.id.clone(),
            display_name: descriptor.display_name.clone(),
            state: self.state_of(&slot.id).unwrap_or(StepState::Pending),
            content: descriptor.content.clone(),
            done_button: descriptor.done_button,
            can_go_back: self.can_go_back(),
            fields: descriptor.fields.clone(),
            values,
            terminal: descriptor.terminal,
            paused: self.paused,
            awaiting: self.phase == SessionPhase::Suspended,
        })
    }

    /// Visited step ids in traversal order.
    #[must_use]
    pub fn history(&self) -> &[StepId] {
        self.cursor.history()
    }

    #[must_use]
    pub fn state_of(&self, step: &StepId) -> Option<StepState> {
        self.states.get(step).copied()
    }

    /// Whether a back request would currently be accepted.
    #[must_use]
    pub fn can_go_back(&self) -> bool {
        self.ensure_running().is_ok() && self.back_target().is_ok()
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    #[must_use]
    pub fn is_game_over(&self) -> bool {
        self.phase == SessionPhase::GameOver
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub fn is_awaiting(&self) -> bool {
        self.phase == SessionPhase::Suspended
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session
    }

    #[must_use]
    pub fn treatment(&self) -> &str {
        self.definition.treatment()
    }

    #[must_use]
    pub fn responses(&self) -> &ResponseStore {
        &self.responses
    }

    #[must_use]
    pub fn aux(&self) -> &AuxState {
        &self.aux
    }

    #[must_use]
    pub fn definition(&self) -> &SequenceDefinition {
        &self.definition
    }

    /// Records the sink refused.
    #[must_use]
    pub fn transport_failures(&self) -> u64 {
        self.transport_failures
    }

    /// Hook calls that returned an error.
    #[must_use]
    pub fn hook_failures(&self) -> u64 {
        self.hook_failures
    }

    // =========================================================================
    // SNAPSHOTS
    // =========================================================================

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            treatment: self.definition.treatment().to_string(),
            phase: self.phase,
            paused: self.paused,
            cursor: self.cursor.clone(),
            states: self.states.clone(),
            entered_once: self.entered_once.clone(),
            responses: self.responses.clone(),
            aux: self.aux.clone(),
            pending_back: self.pending_back,
            transport_failures: self.transport_failures,
            hook_failures: self.hook_failures,
        }
    }

    /// Rebuild a session from a snapshot taken on an equivalent definition.
    ///
    /// No hook fires. An active step is presented again with its draft.
    /// A session suspended on a hook stays suspended until
    /// [`resolve_pending`](Self::resolve_pending) is called.
    pub fn restore(
        definition: SequenceDefinition,
        snapshot: SessionSnapshot,
        renderers: RendererRegistry,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self, SequencerError> {
        if snapshot.treatment != definition.treatment() {
            return Err(SequencerError::InvalidDefinition(format!(
                "snapshot treatment '{}' does not match definition treatment '{}'",
                snapshot.treatment,
                definition.treatment()
            )));
        }
        if let Some(unknown) = snapshot
            .states
            .keys()
            .find(|id| definition.descriptor(id).is_none())
        {
            return Err(SequencerError::UnknownStep(unknown.to_string()));
        }
        if let Some(pos) = snapshot.cursor.position() {
            if definition.step_at(pos).is_none() {
                return Err(SequencerError::InvalidDefinition(format!(
                    "snapshot position {}:{} is outside the definition",
                    pos.stage, pos.step
                )));
            }
        }

        let mut sequencer = Self::new(snapshot.session, definition, renderers, sink)?;
        if snapshot.phase != SessionPhase::NotStarted {
            sequencer.definition.lock();
        }
        sequencer.phase = snapshot.phase;
        sequencer.paused = snapshot.paused;
        sequencer.cursor = snapshot.cursor;
        sequencer.states.extend(snapshot.states);
        sequencer.entered_once = snapshot.entered_once;
        sequencer.responses = snapshot.responses;
        sequencer.aux = snapshot.aux;
        sequencer.pending_back = snapshot.phase == SessionPhase::Suspended && snapshot.pending_back;
        sequencer.transport_failures = snapshot.transport_failures;
        sequencer.hook_failures = snapshot.hook_failures;

        if let Some(pos) = sequencer.cursor.position() {
            let id = sequencer.step_id_at(pos)?;
            if sequencer.state_of(&id) == Some(StepState::Active) {
                let descriptor = sequencer.descriptor(&id)?.clone();
                sequencer.present(&descriptor)?;
            }
        }
        tracing::debug!(session = %sequencer.session, phase = ?sequencer.phase, "session restored");
        Ok(sequencer)
    }

    // =========================================================================
    // ENGINE
    // =========================================================================

    fn ensure_running(&self) -> Result<(), SequencerError> {
        match self.phase {
            SessionPhase::GameOver => Err(SequencerError::SequenceTerminated),
            SessionPhase::NotStarted => Err(SequencerError::NotStarted),
            SessionPhase::Suspended => Err(SequencerError::ConcurrentTransition),
            SessionPhase::Running if self.paused => Err(SequencerError::Paused),
            SessionPhase::Running => Ok(()),
        }
    }

    fn descriptor(&self, id: &StepId) -> Result<&StepDescriptor, SequencerError> {
        self.definition
            .descriptor(id)
            .ok_or_else(|| SequencerError::UnknownStep(id.to_string()))
    }

    fn step_id_at(&self, pos: Position) -> Result<StepId, SequencerError> {
        self.definition
            .step_at(pos)
            .map(|s| s.id.clone())
            .ok_or_else(|| {
                SequencerError::InvalidDefinition(format!(
                    "no step at position {}:{}",
                    pos.stage, pos.step
                ))
            })
    }

    fn is_active(&self, id: &StepId) -> bool {
        self.state_of(id) == Some(StepState::Active)
    }

    /// Position and id of the active step.
    fn active_step(&self) -> Result<(Position, StepId), SequencerError> {
        let pos = self
            .cursor
            .position()
            .ok_or(SequencerError::SequenceTerminated)?;
        let id = self.step_id_at(pos)?;
        if !self.is_active(&id) {
            return Err(SequencerError::StepNotActive(id));
        }
        Ok((pos, id))
    }

    fn back_target(&self) -> Result<Position, SequencerError> {
        let (pos, id) = self.active_step()?;
        let target = self.cursor.peek_trail().ok_or_else(|| {
            SequencerError::BackNotAllowed(format!("no step was visited before {id}"))
        })?;
        let target_id = self.step_id_at(target)?;
        if !self.descriptor(&target_id)?.navigation.allow_back {
            return Err(SequencerError::BackNotAllowed(format!(
                "step {target_id} cannot be returned to"
            )));
        }
        if target.stage != pos.stage && !self.descriptor(&id)?.navigation.back_across_stages {
            return Err(SequencerError::BackNotAllowed(format!(
                "step {id} cannot go back across its stage boundary"
            )));
        }
        Ok(target)
    }

    fn set_state(&mut self, id: &StepId, state: StepState) {
        tracing::debug!(step = %id, state = state.name(), "step state");
        self.states.insert(id.clone(), state);
    }

    /// Enter positions starting at `next` until one rests.
    ///
    /// `entry` applies to the first position only; every following
    /// position is entered forward.
    fn enter_from(
        &mut self,
        mut next: Option<Position>,
        mut entry: Entry,
    ) -> Result<(), SequencerError> {
        while let Some(pos) = next {
            self.cursor.set_position(Some(pos));
            let id = self.step_id_at(pos)?;

            if entry == Entry::Forward {
                if pos.step == 0 {
                    if let Some(stage) = self.definition.stage(pos.stage) {
                        tracing::info!(
                            session = %self.session,
                            stage = %stage.id,
                            "entering stage"
                        );
                    }
                }
                self.set_state(&id, StepState::Pending);
                let decision = self.skip_decision(pos);
                if decision.is_skip() {
                    self.set_state(&id, StepState::Skipped);
                    tracing::debug!(step = %id, ?decision, "step skipped");
                    next = self.definition.next_position(pos);
                    continue;
                }
            }

            match self.enter_step(pos, &id, entry)? {
                Entered::Rest => return Ok(()),
                Entered::Next => {
                    next = self.definition.next_position(pos);
                    entry = Entry::Forward;
                }
            }
        }

        self.cursor.set_position(None);
        self.end_session();
        Ok(())
    }

    fn skip_decision(&self, pos: Position) -> SkipDecision {
        let Some(stage) = self.definition.stage(pos.stage) else {
            return SkipDecision::Show;
        };
        let Some(slot) = stage.steps.get(pos.step) else {
            return SkipDecision::Show;
        };
        let condition = self
            .definition
            .descriptor(&slot.id)
            .and_then(|d| d.skip_if.as_ref());
        self.resolver.resolve(
            stage,
            slot,
            condition,
            &self.responses,
            self.definition.treatment(),
        )
    }

    fn enter_step(
        &mut self,
        pos: Position,
        id: &StepId,
        entry: Entry,
    ) -> Result<Entered, SequencerError> {
        let descriptor = self.descriptor(id)?.clone();
        self.set_state(id, StepState::Entering);

        let already_entered = self.entered_once.contains(id);
        let flow = if descriptor.enter_once && already_entered {
            HookFlow::Continue
        } else {
            self.run_enter_hook(&descriptor)
        };
        let flow = match (entry, flow) {
            // Returning to a step never completes it on its own.
            (Entry::Back, HookFlow::FinishStep) => HookFlow::Continue,
            (_, flow) => flow,
        };

        if flow == HookFlow::Await {
            self.phase = SessionPhase::Suspended;
            self.pending_back = entry == Entry::Back;
            tracing::debug!(step = %id, "awaiting hook completion");
            return Ok(Entered::Rest);
        }
        self.settle(pos, &descriptor, flow)
    }

    /// Act on a resolved `on_enter` outcome.
    fn settle(
        &mut self,
        pos: Position,
        descriptor: &StepDescriptor,
        flow: HookFlow,
    ) -> Result<Entered, SequencerError> {
        if descriptor.terminal {
            self.finish_step(pos, descriptor, true, None);
            self.cursor.record_visit(descriptor.id.clone());
            self.end_session();
            return Ok(Entered::Rest);
        }
        match flow {
            HookFlow::FinishStep => {
                tracing::debug!(step = %descriptor.id, "step finished by its entry hook");
                self.finish_step(pos, descriptor, true, None);
                Ok(Entered::Next)
            }
            HookFlow::Continue | HookFlow::Await => {
                self.responses.open_draft(&descriptor.id);
                self.present(descriptor)?;
                Ok(Entered::Rest)
            }
        }
    }

    /// Show an entered step and make it `Active`.
    fn present(&mut self, descriptor: &StepDescriptor) -> Result<(), SequencerError> {
        let renderer = self.renderers.resolve(&descriptor.id, &descriptor.content)?;
        let handle = renderer.present(&descriptor.id, &descriptor.content);
        let draft = self.responses.current_values(&descriptor.id);
        if !draft.is_empty() {
            renderer.set_values(handle, &draft);
        }
        if self.paused {
            renderer.disable(handle);
        }
        self.presentation = Some(Presentation { handle, renderer });
        self.set_state(&descriptor.id, StepState::Active);
        Ok(())
    }

    fn release_presentation(&mut self) {
        if let Some(p) = self.presentation.take() {
            p.renderer.release(p.handle);
        }
    }

    /// Exiting → Done: run `on_exit`, finalize the draft, emit the record.
    ///
    /// `report` is the validation that let the step finish; steps that
    /// finish on their own are checked here so their record still carries
    /// a per-field outcome.
    fn finish_step(
        &mut self,
        pos: Position,
        descriptor: &StepDescriptor,
        auto: bool,
        report: Option<ValidationReport>,
    ) {
        let id = &descriptor.id;
        self.set_state(id, StepState::Exiting);
        let exit = {
            let mut ctx = HookContext {
                session: &self.session,
                step: id,
                treatment: self.definition.treatment(),
                responses: &self.responses,
                aux: &mut self.aux,
            };
            descriptor.hooks.on_exit(&mut ctx)
        };
        if let Err(e) = exit {
            self.hook_failures = self.hook_failures.saturating_add(1);
            tracing::warn!(step = %id, error = %e, "exit hook failed");
        }

        self.responses.open_draft(id);
        let values = self.responses.current_values(id);
        let correct = grade_fields(&descriptor.fields, &values);
        let report = report.unwrap_or_else(|| self.check_values(descriptor, &values));
        let valid = report.field_validity(&descriptor.fields);
        if !report.valid {
            tracing::debug!(
                step = %id,
                failures = report.failures.len(),
                "finalized with invalid fields"
            );
        }
        let revision = self.responses.finalize(id, correct, valid);
        self.set_state(id, StepState::Done);

        let stage = self
            .definition
            .stage(pos.stage)
            .map(|s| s.id.clone())
            .unwrap_or_else(|| StageId::new(id.as_str()));
        let record = FinalizedRecord {
            session: self.session.clone(),
            treatment: self.definition.treatment().to_string(),
            stage,
            step: id.clone(),
            revision: revision.number,
            fields: revision.fields,
            correct: revision.correct,
            valid: revision.valid,
            auto_finished: auto,
        };
        if let Err(e) = self.sink.emit(&record) {
            self.transport_failures = self.transport_failures.saturating_add(1);
            tracing::warn!(step = %id, error = %e, "record transport failed");
        }
    }

    fn run_enter_hook(&mut self, descriptor: &StepDescriptor) -> HookFlow {
        let id = &descriptor.id;
        let outcome = {
            let mut ctx = HookContext {
                session: &self.session,
                step: id,
                treatment: self.definition.treatment(),
                responses: &self.responses,
                aux: &mut self.aux,
            };
            descriptor.hooks.on_enter(&mut ctx)
        };
        self.entered_once.insert(id.clone());
        self.absorb_hook_result(id, outcome)
    }

    fn absorb_hook_result(
        &mut self,
        id: &StepId,
        outcome: Result<HookFlow, HookError>,
    ) -> HookFlow {
        match outcome {
            Ok(flow) => flow,
            Err(e) => {
                self.hook_failures = self.hook_failures.saturating_add(1);
                tracing::warn!(step = %id, error = %e, "entry hook failed, activating step");
                HookFlow::Continue
            }
        }
    }

    fn check_values(&self, descriptor: &StepDescriptor, values: &FieldMap) -> ValidationReport {
        let mut report =
            validate_fields(&descriptor.fields, descriptor.required_by_default, values);
        let ctx = ValidationContext {
            session: &self.session,
            step: &descriptor.id,
            treatment: self.definition.treatment(),
            responses: &self.responses,
            aux: &self.aux,
        };
        report.extend(descriptor.hooks.on_validate(&ctx, values));
        report
    }

    fn end_session(&mut self) {
        self.release_presentation();
        self.phase = SessionPhase::GameOver;
        tracing::info!(
            session = %self.session,
            visited = self.cursor.history().len(),
            "session complete"
        );
    }
}

// =============================================================================
// TESTS
// =============================================================================
