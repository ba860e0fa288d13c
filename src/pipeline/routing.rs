//! Pure routing decisions for the run state machine.
//!
//! Kept free of I/O so the exact transition rules are unit-testable on
//! their own.

use crate::models::Phase;

/// Decision after requirement extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectRoute {
    Proceed,
    /// Pause the run and surface clarifying questions. Used at most once
    /// per run; a second low-confidence round is never requested.
    AwaitClarification,
}

pub fn route_after_collecting(
    confidence: f64,
    threshold: f64,
    clarifications_asked: u32,
) -> CollectRoute {
    if confidence >= threshold || clarifications_asked >= 1 {
        CollectRoute::Proceed
    } else {
        CollectRoute::AwaitClarification
    }
}

pub fn route_after_execution(success: bool) -> Phase {
    if success {
        Phase::Presenting
    } else {
        Phase::Debugging
    }
}

/// `attempts` counts completed repair cycles. Below the ceiling the
/// replacement source goes back to the sandbox; at the ceiling the run
/// proceeds to presentation with the last failing result preserved.
pub fn route_after_debug(attempts: u32, ceiling: u32) -> Phase {
    if attempts < ceiling {
        Phase::Executing
    } else {
        Phase::Presenting
    }
}

pub fn route_after_presenting(approved: bool) -> Option<Phase> {
    if approved {
        Some(Phase::Deploying)
    } else {
        None
    }
}
