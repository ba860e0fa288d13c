//! Pipeline orchestration: the run state machine and its routing rules.

mod orchestrator;
pub mod routing;

pub use orchestrator::{Orchestrator, RunHandle};
