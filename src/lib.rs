//! ForgeFlow core: a bounded generation-execution-debug pipeline.
//!
//! A natural-language automation request flows through a state machine
//! (requirements, API discovery, planning, code generation, review,
//! testing), then into a sandboxed execution loop that classifies failures
//! and requests bounded automated repairs before presenting the result for
//! approval and deployment.
//!
//! The pieces:
//! - [`pipeline`]: the orchestrator state machine and routing rules
//! - [`sandbox`]: Docker execution with a static-analysis fallback
//! - [`classify`]: structured failure classification and syntax checking
//! - [`debugger`]: diagnosis and repair coordination
//! - [`collaborators`]: contracts for the external LLM/service stages

pub mod classify;
pub mod collaborators;
pub mod config;
pub mod debugger;
pub mod errors;
pub mod events;
pub mod models;
pub mod pipeline;
pub mod sandbox;
