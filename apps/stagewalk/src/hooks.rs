//! # Built-in Hooks
//!
//! Step hooks that sequence files can refer to by name.
//!
//! - `announce-end`: reports that the participant reached the end screen and
//!   sets the `end_announced` flag in the session's aux state

use stagewalk_core::{HookContext, HookError, HookFlow, HookRegistry, SequencerError, StepHooks};
use std::sync::Arc;

pub const ANNOUNCE_END: &str = "announce-end";

/// Aux-state flag set by [`AnnounceEnd`].
pub const END_ANNOUNCED: &str = "end_announced";

/// Logs the end of a session once.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnounceEnd;

impl StepHooks for AnnounceEnd {
    fn on_enter(&self, ctx: &mut HookContext<'_>) -> Result<HookFlow, HookError> {
        if !ctx.aux.flag(END_ANNOUNCED) {
            tracing::info!(
                session = ctx.session,
                treatment = ctx.treatment,
                step = %ctx.step,
                "participant reached the end"
            );
            ctx.aux.set(END_ANNOUNCED, "true");
        }
        Ok(HookFlow::Continue)
    }
}

/// Every hook a sequence file may name.
pub fn builtin_hooks() -> Result<HookRegistry, SequencerError> {
    let mut hooks = HookRegistry::new();
    hooks.register(ANNOUNCE_END, Arc::new(AnnounceEnd))?;
    Ok(hooks)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use stagewalk_core::{AuxState, ResponseStore, StepId};

    #[test]
    fn announce_end_sets_flag_once() {
        let responses = ResponseStore::new();
        let mut aux = AuxState::new();
        let step = StepId::new("end");
        let mut ctx = HookContext {
            session: "p1",
            step: &step,
            treatment: "A",
            responses: &responses,
            aux: &mut aux,
        };

        assert_eq!(AnnounceEnd.on_enter(&mut ctx).unwrap(), HookFlow::Continue);
        assert_eq!(AnnounceEnd.on_enter(&mut ctx).unwrap(), HookFlow::Continue);
        assert!(aux.flag(END_ANNOUNCED));
        assert_eq!(aux.len(), 1);
    }

    #[test]
    fn builtin_registry_resolves_announce_end() {
        let hooks = builtin_hooks().unwrap();
        assert!(hooks.resolve(&StepId::new("end"), ANNOUNCE_END).is_ok());
        assert!(hooks.resolve(&StepId::new("end"), "missing").is_err());
    }

    #[test]
    fn name_collision_surfaces_as_error() {
        let mut hooks = builtin_hooks().unwrap();
        let err = hooks
            .register(ANNOUNCE_END, Arc::new(AnnounceEnd))
            .unwrap_err();
        assert!(matches!(err, SequencerError::DuplicateId(name) if name == ANNOUNCE_END));
    }
}
