//! # Session Cursor
//!
//! Where a session is and where it has been.
//!
//! - `position`: the step currently being entered, active or waiting.
//! - `history`: visited step ids in traversal order. Append-only; back
//!   navigation never truncates it.
//! - `trail`: positions a back request can return to, most recent last.

use crate::StepId;
use crate::registry::Position;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCursor {
    position: Option<Position>,
    history: Vec<StepId>,
    trail: Vec<Position>,
}

impl SessionCursor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn set_position(&mut self, position: Option<Position>) {
        self.position = position;
    }

    /// Append a visited step to the history.
    pub fn record_visit(&mut self, step: StepId) {
        self.history.push(step);
    }

    #[must_use]
    pub fn history(&self) -> &[StepId] {
        &self.history
    }

    pub fn push_trail(&mut self, position: Position) {
        self.trail.push(position);
    }

    pub fn pop_trail(&mut self) -> Option<Position> {
        self.trail.pop()
    }

    /// The position a back request would return to.
    #[must_use]
    pub fn peek_trail(&self) -> Option<Position> {
        self.trail.last().copied()
    }

    #[must_use]
    pub fn trail_len(&self) -> usize {
        self.trail.len()
    }
}
