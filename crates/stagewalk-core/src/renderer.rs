//! # Renderer Contract
//!
//! The sequencer never draws anything. A [`Renderer`] presents a step's
//! content, reports the values the participant entered, and can be
//! enabled or disabled. Renderers are looked up by the step's widget name
//! through a [`RendererRegistry`]; unknown names are rejected when a
//! sequencer is constructed.

use crate::descriptor::ContentRef;
use crate::registry::SequenceDefinition;
use crate::{FieldMap, SequencerError, StepId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque token for one presentation of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RenderHandle(pub u64);

/// A renderer bound to steps by widget name.
///
/// Methods take `&self`; implementations keep their own interior state.
pub trait Renderer: Send + Sync {
    /// Show `content` for `step` and return a handle to it.
    fn present(&self, step: &StepId, content: &ContentRef) -> RenderHandle;

    /// Values currently entered in the presentation.
    fn collect_values(&self, handle: RenderHandle) -> FieldMap;

    /// Pre-fill the presentation.
    fn set_values(&self, handle: RenderHandle, values: &FieldMap);

    fn enable(&self, handle: RenderHandle);

    fn disable(&self, handle: RenderHandle);

    /// The step left the screen. Default: nothing to clean up.
    fn release(&self, _handle: RenderHandle) {}
}

// =============================================================================
// PASSIVE RENDERER
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Slot {
    step: Option<StepId>,
    values: FieldMap,
    enabled: bool,
}

/// A renderer without a screen.
///
/// It remembers whatever values were set on a presentation and hands them
/// back on collection. Used when the real UI lives in a remote client that
/// submits values through the sequencer.
#[derive(Debug, Default)]
pub struct PassiveRenderer {
    next: AtomicU64,
    slots: Mutex<BTreeMap<RenderHandle, Slot>>,
}

impl PassiveRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live presentation is enabled.
    #[must_use]
    pub fn is_enabled(&self, handle: RenderHandle) -> bool {
        self.slots
            .lock()
            .map(|slots| slots.get(&handle).is_some_and(|s| s.enabled))
            .unwrap_or(false)
    }

    /// Number of live presentations.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    /// Step shown by a live presentation.
    #[must_use]
    pub fn step_of(&self, handle: RenderHandle) -> Option<StepId> {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(&handle).and_then(|s| s.step.clone()))
    }

    fn with_slot(&self, handle: RenderHandle, f: impl FnOnce(&mut Slot)) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some(slot) = slots.get_mut(&handle) {
                f(slot);
            }
        }
    }
}

impl Renderer for PassiveRenderer {
    fn present(&self, step: &StepId, _content: &ContentRef) -> RenderHandle {
        let handle = RenderHandle(self.next.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(
                handle,
                Slot {
                    step: Some(step.clone()),
                    values: FieldMap::new(),
                    enabled: true,
                },
            );
        }
        handle
    }

    fn collect_values(&self, handle: RenderHandle) -> FieldMap {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(&handle).map(|s| s.values.clone()))
            .unwrap_or_default()
    }

    fn set_values(&self, handle: RenderHandle, values: &FieldMap) {
        self.with_slot(handle, |slot| {
            slot.values
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        });
    }

    fn enable(&self, handle: RenderHandle) {
        self.with_slot(handle, |slot| slot.enabled = true);
    }

    fn disable(&self, handle: RenderHandle) {
        self.with_slot(handle, |slot| slot.enabled = false);
    }

    fn release(&self, handle: RenderHandle) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(&handle);
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Widget name to renderer, plus a fallback for steps without a widget.
#[derive(Clone)]
pub struct RendererRegistry {
    fallback: Arc<dyn Renderer>,
    named: BTreeMap<String, Arc<dyn Renderer>>,
}

impl fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendererRegistry")
            .field("widgets", &self.named.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::new(Arc::new(PassiveRenderer::new()))
    }
}

impl RendererRegistry {
    /// A registry whose only renderer is `fallback`.
    #[must_use]
    pub fn new(fallback: Arc<dyn Renderer>) -> Self {
        Self {
            fallback,
            named: BTreeMap::new(),
        }
    }

    /// One shared passive renderer registered under every name in `widgets`.
    #[must_use]
    pub fn passive(widgets: &[&str]) -> Self {
        let renderer: Arc<dyn Renderer> = Arc::new(PassiveRenderer::new());
        let mut registry = Self::new(Arc::clone(&renderer));
        for widget in widgets {
            registry.named.insert((*widget).to_string(), Arc::clone(&renderer));
        }
        registry
    }

    pub fn register(
        &mut self,
        widget: impl Into<String>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<(), SequencerError> {
        let widget = widget.into();
        if self.named.contains_key(&widget) {
            return Err(SequencerError::DuplicateId(widget));
        }
        self.named.insert(widget, renderer);
        Ok(())
    }

    /// Renderer for a step's content.
    pub fn resolve(
        &self,
        step: &StepId,
        content: &ContentRef,
    ) -> Result<Arc<dyn Renderer>, SequencerError> {
        match &content.widget {
            None => Ok(Arc::clone(&self.fallback)),
            Some(widget) => self
                .named
                .get(widget)
                .cloned()
                .ok_or_else(|| SequencerError::UnknownRenderer {
                    step: step.clone(),
                    widget: widget.clone(),
                }),
        }
    }

    /// Resolve every step of `definition`, failing on the first unknown widget.
    pub fn check(&self, definition: &SequenceDefinition) -> Result<(), SequencerError> {
        for descriptor in definition.descriptors() {
            self.resolve(&descriptor.id, &descriptor.content)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn widgets(&self) -> Vec<&str> {
        self.named.keys().map(String::as_str).collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldId, FieldValue};

    #[test]
    fn passive_renderer_round_trips_values() {
        let renderer = PassiveRenderer::new();
        let step = StepId::new("demographics");
        let handle = renderer.present(&step, &ContentRef::default());
        assert_eq!(renderer.step_of(handle), Some(step));

        let mut values = FieldMap::new();
        values.insert(FieldId::new("age"), FieldValue::Integer(30));
        renderer.set_values(handle, &values);
        assert_eq!(renderer.collect_values(handle), values);

        renderer.disable(handle);
        assert!(!renderer.is_enabled(handle));
        renderer.enable(handle);
        assert!(renderer.is_enabled(handle));

        renderer.release(handle);
        assert_eq!(renderer.live(), 0);
        assert!(renderer.collect_values(handle).is_empty());
    }

    #[test]
    fn handles_are_distinct() {
        let renderer = PassiveRenderer::new();
        let step = StepId::new("a");
        let first = renderer.present(&step, &ContentRef::default());
        let second = renderer.present(&step, &ContentRef::default());
        assert_ne!(first, second);
    }

    #[test]
    fn registry_resolves_by_widget_name() {
        let registry = RendererRegistry::passive(&["ChoiceManager", "EndScreen"]);
        let step = StepId::new("end");
        assert!(registry.resolve(&step, &ContentRef::widget("EndScreen")).is_ok());
        assert!(registry.resolve(&step, &ContentRef::default()).is_ok());
        assert!(matches!(
            registry.resolve(&step, &ContentRef::widget("Unknown")),
            Err(SequencerError::UnknownRenderer { .. })
        ));
        assert_eq!(registry.widgets(), vec!["ChoiceManager", "EndScreen"]);
    }

    #[test]
    fn duplicate_widget_names_rejected() {
        let mut registry = RendererRegistry::default();
        registry
            .register("ContentBox", Arc::new(PassiveRenderer::new()))
            .expect("register");
        assert!(
            registry
                .register("ContentBox", Arc::new(PassiveRenderer::new()))
                .is_err()
        );
    }
}
