//! # Step Descriptor Store
//!
//! Declarative metadata for every step: identity, navigation flags, the
//! done-button policy, an opaque content reference, declared fields, and
//! the lifecycle hooks.
//!
//! Hooks are resolved through [`HookRegistry`] at construction time, so an
//! unknown hook name is a configuration error, never a first-use surprise.
//! Hook bodies see the session only through the context passed to them.

use crate::branch::Condition;
use crate::primitives::{MAX_FIELDS_PER_STEP, MAX_STEPS, validate_id};
use crate::response::{FieldFailure, FieldSpec, ResponseStore};
use crate::{AuxState, FieldMap, SequencerError, StepId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// NAVIGATION & DONE BUTTON
// =============================================================================

/// Back-navigation flags of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Navigation {
    /// Whether this step may become active again through a back request.
    pub allow_back: bool,
    /// Whether a back request issued from this step may cross into the
    /// previous stage.
    pub back_across_stages: bool,
}

impl Default for Navigation {
    fn default() -> Self {
        Self {
            allow_back: true,
            back_across_stages: true,
        }
    }
}

/// Availability of the step's completion control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DoneButton {
    /// No completion control; the step finishes by other means.
    Hidden,
    /// Enabled as soon as the step is active.
    #[default]
    Immediate,
    /// Enabled after `millis` milliseconds of activity.
    Delayed { millis: u64 },
}

impl DoneButton {
    /// Build from a configured delay.
    ///
    /// Any non-positive delay means "immediately enabled". The normalization
    /// is reported as a configuration warning.
    #[must_use]
    pub fn from_delay(millis: i64) -> Self {
        match u64::try_from(millis) {
            Ok(ms) if ms > 0 => DoneButton::Delayed { millis: ms },
            _ => {
                tracing::warn!(
                    delay = millis,
                    "done button delay is not positive, treating it as immediately enabled"
                );
                DoneButton::Immediate
            }
        }
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        !matches!(self, DoneButton::Hidden)
    }
}

/// Opaque reference to the rendering payload of a step.
///
/// The sequencer only interprets `widget`, which selects a renderer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    /// Renderer options, passed through untouched.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub options: String,
}

impl ContentRef {
    #[must_use]
    pub fn widget(name: impl Into<String>) -> Self {
        Self {
            widget: Some(name.into()),
            ..Self::default()
        }
    }
}

// =============================================================================
// HOOKS
// =============================================================================

/// What the engine should do after `on_enter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookFlow {
    /// Activate the step normally.
    Continue,
    /// Complete the step immediately without participant input.
    FinishStep,
    /// Asynchronous work is pending; the engine freezes until
    /// `Sequencer::resolve_pending` reports its outcome.
    Await,
}

/// A hook body failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// Session view handed to `on_enter` and `on_exit`.
pub struct HookContext<'a> {
    pub session: &'a str,
    pub step: &'a StepId,
    pub treatment: &'a str,
    /// Finalized answers of every step; read-only.
    pub responses: &'a ResponseStore,
    pub aux: &'a mut AuxState,
}

/// Session view handed to `on_validate`.
pub struct ValidationContext<'a> {
    pub session: &'a str,
    pub step: &'a StepId,
    pub treatment: &'a str,
    pub responses: &'a ResponseStore,
    pub aux: &'a AuxState,
}

/// Lifecycle hooks of a step. Every method has a no-op default.
///
/// Hooks must not block. Work that cannot finish synchronously returns
/// [`HookFlow::Await`] from `on_enter` and is completed later.
pub trait StepHooks: Send + Sync {
    fn on_enter(&self, _ctx: &mut HookContext<'_>) -> Result<HookFlow, HookError> {
        Ok(HookFlow::Continue)
    }

    fn on_exit(&self, _ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }

    /// Extra checks on top of the declared field constraints.
    fn on_validate(
        &self,
        _ctx: &ValidationContext<'_>,
        _values: &FieldMap,
    ) -> Vec<FieldFailure> {
        Vec::new()
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl StepHooks for NoHooks {}

/// Named hook implementations, resolved when a sequence is configured.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Arc<dyn StepHooks>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("names", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        hooks: Arc<dyn StepHooks>,
    ) -> Result<(), SequencerError> {
        let name = name.into();
        if self.hooks.contains_key(&name) {
            return Err(SequencerError::DuplicateId(name));
        }
        self.hooks.insert(name, hooks);
        Ok(())
    }

    /// Look up `name` on behalf of `step`.
    pub fn resolve(
        &self,
        step: &StepId,
        name: &str,
    ) -> Result<Arc<dyn StepHooks>, SequencerError> {
        self.hooks
            .get(name)
            .cloned()
            .ok_or_else(|| SequencerError::UnknownHook {
                step: step.clone(),
                hook: name.to_string(),
            })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.hooks.keys().map(String::as_str).collect()
    }
}

// =============================================================================
// STEP DESCRIPTOR
// =============================================================================

/// Declarative description of one step.
#[derive(Clone)]
pub struct StepDescriptor {
    pub id: StepId,
    pub display_name: String,
    pub navigation: Navigation,
    pub done_button: DoneButton,
    pub content: ContentRef,
    pub fields: Vec<FieldSpec>,
    /// Required flag for fields that do not set their own.
    pub required_by_default: bool,
    /// Reaching this step ends the session.
    pub terminal: bool,
    /// `on_enter` fires at most once per session.
    pub enter_once: bool,
    /// Declarative dynamic skip, evaluated before the step is entered.
    pub skip_if: Option<Condition>,
    pub hooks: Arc<dyn StepHooks>,
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("navigation", &self.navigation)
            .field("done_button", &self.done_button)
            .field("content", &self.content)
            .field("fields", &self.fields.len())
            .field("terminal", &self.terminal)
            .field("enter_once", &self.enter_once)
            .field("skip_if", &self.skip_if)
            .finish_non_exhaustive()
    }
}

impl StepDescriptor {
    /// A step with default navigation, an immediate done button and no fields.
    #[must_use]
    pub fn new(id: impl Into<StepId>) -> Self {
        let id = id.into();
        Self {
            display_name: id.to_string(),
            id,
            navigation: Navigation::default(),
            done_button: DoneButton::Immediate,
            content: ContentRef::default(),
            fields: Vec::new(),
            required_by_default: false,
            terminal: false,
            enter_once: false,
            skip_if: None,
            hooks: Arc::new(NoHooks),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    #[must_use]
    pub fn allow_back(mut self, allow: bool) -> Self {
        self.navigation.allow_back = allow;
        self
    }

    #[must_use]
    pub fn back_across_stages(mut self, allow: bool) -> Self {
        self.navigation.back_across_stages = allow;
        self
    }

    #[must_use]
    pub fn done_button(mut self, done_button: DoneButton) -> Self {
        self.done_button = done_button;
        self
    }

    #[must_use]
    pub fn content(mut self, content: ContentRef) -> Self {
        self.content = content;
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn required_by_default(mut self, required: bool) -> Self {
        self.required_by_default = required;
        self
    }

    #[must_use]
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    #[must_use]
    pub fn enter_once(mut self, once: bool) -> Self {
        self.enter_once = once;
        self
    }

    #[must_use]
    pub fn skip_if(mut self, condition: Condition) -> Self {
        self.skip_if = Some(condition);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn StepHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Find a declared field.
    #[must_use]
    pub fn field_spec(&self, field: &crate::FieldId) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| &f.id == field)
    }

    /// Check ids, limits and field declarations.
    pub fn check(&self) -> Result<(), SequencerError> {
        validate_id("step", self.id.as_str())?;
        if self.fields.len() > MAX_FIELDS_PER_STEP {
            return Err(SequencerError::LimitExceeded(format!(
                "step {} declares {} fields (maximum {})",
                self.id,
                self.fields.len(),
                MAX_FIELDS_PER_STEP
            )));
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            validate_id("field", field.id.as_str())?;
            if !seen.insert(&field.id) {
                return Err(SequencerError::DuplicateId(format!(
                    "{}.{}",
                    self.id, field.id
                )));
            }
            field.check(&self.id)?;
        }
        Ok(())
    }
}

// =============================================================================
// STEP STORE
// =============================================================================

/// Registry of every step a sequence may use. Ids are unique.
#[derive(Debug, Clone, Default)]
pub struct StepStore {
    steps: BTreeMap<StepId, StepDescriptor>,
}

impl StepStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Fails with `DuplicateId` when the id is taken.
    pub fn register(&mut self, descriptor: StepDescriptor) -> Result<(), SequencerError> {
        descriptor.check()?;
        if self.steps.contains_key(&descriptor.id) {
            return Err(SequencerError::DuplicateId(descriptor.id.to_string()));
        }
        if self.steps.len() >= MAX_STEPS {
            return Err(SequencerError::LimitExceeded(format!(
                "step store is full ({} steps)",
                MAX_STEPS
            )));
        }
        tracing::debug!(step = %descriptor.id, "registered step");
        self.steps.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &StepId) -> Option<&StepDescriptor> {
        self.steps.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &StepId) -> bool {
        self.steps.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_configuration_error() {
        let mut store = StepStore::new();
        store
            .register(StepDescriptor::new("consent"))
            .expect("first registration");
        let err = store
            .register(StepDescriptor::new("consent"))
            .expect_err("duplicate");
        assert_eq!(err, SequencerError::DuplicateId("consent".into()));
        assert!(err.is_configuration());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_field_ids_rejected() {
        let step = StepDescriptor::new("demographics")
            .field(FieldSpec::choice("gender", &["Male", "Female"]))
            .field(FieldSpec::choice("gender", &["Other"]));
        assert!(matches!(step.check(), Err(SequencerError::DuplicateId(_))));
    }

    #[test]
    fn non_positive_delay_is_immediate() {
        assert_eq!(DoneButton::from_delay(0), DoneButton::Immediate);
        assert_eq!(DoneButton::from_delay(-5), DoneButton::Immediate);
        assert_eq!(
            DoneButton::from_delay(30_000),
            DoneButton::Delayed { millis: 30_000 }
        );
        assert!(!DoneButton::Hidden.is_visible());
    }

    #[test]
    fn hook_registry_rejects_unknown_names() {
        let mut registry = HookRegistry::new();
        registry
            .register("noop", Arc::new(NoHooks))
            .expect("register");
        assert!(registry.register("noop", Arc::new(NoHooks)).is_err());

        let step = StepId::new("end");
        assert!(registry.resolve(&step, "noop").is_ok());
        assert!(matches!(
            registry.resolve(&step, "missing"),
            Err(SequencerError::UnknownHook { .. })
        ));
    }

    #[test]
    fn builder_sets_flags() {
        let step = StepDescriptor::new("treatment")
            .named("Treatment")
            .allow_back(false)
            .done_button(DoneButton::from_delay(0))
            .content(ContentRef::widget("ChoiceManager"));
        assert_eq!(step.display_name, "Treatment");
        assert!(!step.navigation.allow_back);
        assert!(step.navigation.back_across_stages);
        assert_eq!(step.done_button, DoneButton::Immediate);
        assert_eq!(step.content.widget.as_deref(), Some("ChoiceManager"));
    }
}
