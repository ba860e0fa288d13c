//! External collaborator contracts.
//!
//! Everything the pipeline does not do itself (requirement extraction, API
//! discovery, planning, code generation, review, testing, deployment)
//! arrives through these traits. Every boundary returns an explicit
//! `Result`; a missing or broken collaborator is a value the orchestrator
//! routes on, never an uncaught fault.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::{ErrorCategory, TracebackFrame};
use crate::errors::CollaboratorError;
use crate::models::{
    ActionItem, ApiCandidate, ExecutionResult, GeneratedCode, Requirements, TestReport,
    WorkflowDag,
};

/// Targeted repair context handed to the code generator on a debug cycle.
/// Carries the classifier's evidence, not just raw failure text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixBrief {
    pub attempt: u32,
    pub ceiling: u32,
    pub category: ErrorCategory,
    pub error_type: String,
    pub error_message: String,
    pub line_number: Option<usize>,
    pub code_context: String,
    pub frames: Vec<TracebackFrame>,
    pub suggestions: Vec<String>,
    pub undefined_names: Vec<String>,
    pub stderr: String,
    /// The full current candidate source. The generator must return a
    /// complete replacement, never a partial patch.
    pub source: String,
    #[serde(default)]
    pub aux_files: HashMap<String, String>,
}

#[async_trait]
pub trait RequirementExtractor: Send + Sync {
    async fn extract(
        &self,
        message: &str,
        history: &[String],
    ) -> Result<Requirements, CollaboratorError>;
}

#[async_trait]
pub trait ApiDiscovery: Send + Sync {
    /// Ranked API candidates for one extracted action. An empty list means
    /// the action is unmatched and becomes a research step downstream.
    async fn discover(&self, action: &ActionItem) -> Result<Vec<ApiCandidate>, CollaboratorError>;
}

#[async_trait]
pub trait DagBuilder: Send + Sync {
    async fn build(
        &self,
        requirements: &Requirements,
        candidates: &[ApiCandidate],
        unmatched: &[ActionItem],
    ) -> Result<WorkflowDag, CollaboratorError>;
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        dag: &WorkflowDag,
        data_mappings: &[Value],
    ) -> Result<GeneratedCode, CollaboratorError>;

    /// Re-invoked by the debug coordinator. The brief is the whole context;
    /// the response replaces the candidate source wholesale.
    async fn repair(&self, brief: &FixBrief) -> Result<GeneratedCode, CollaboratorError>;
}

#[async_trait]
pub trait SecurityReviewer: Send + Sync {
    /// Advisory findings; surfaced to the approval gate but never routed on.
    async fn review(&self, code: &GeneratedCode) -> Result<Value, CollaboratorError>;
}

#[async_trait]
pub trait TestGenerator: Send + Sync {
    async fn run_tests(
        &self,
        code: &GeneratedCode,
        dag: &WorkflowDag,
    ) -> Result<TestReport, CollaboratorError>;
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(
        &self,
        code: &GeneratedCode,
        execution: &ExecutionResult,
        security_review: Option<&Value>,
    ) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        code: &GeneratedCode,
        dag: &WorkflowDag,
    ) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait FeedbackRecorder: Send + Sync {
    async fn record(&self, report: &crate::models::RunReport) -> Result<(), CollaboratorError>;
}

/// Default approval gate: approve exactly when execution succeeded. An
/// artifact that never passed execution is never auto-deployed.
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn approve(
        &self,
        _code: &GeneratedCode,
        execution: &ExecutionResult,
        _security_review: Option<&Value>,
    ) -> Result<bool, CollaboratorError> {
        Ok(execution.success)
    }
}

/// The full set of collaborators one orchestrator instance talks to.
/// Advisory collaborators are optional; their absence skips the stage with
/// an event rather than failing the run.
#[derive(Clone)]
pub struct CollaboratorSet {
    pub extractor: Arc<dyn RequirementExtractor>,
    pub discovery: Arc<dyn ApiDiscovery>,
    pub dag_builder: Arc<dyn DagBuilder>,
    pub generator: Arc<dyn CodeGenerator>,
    pub security_reviewer: Option<Arc<dyn SecurityReviewer>>,
    pub test_generator: Option<Arc<dyn TestGenerator>>,
    pub approval_gate: Arc<dyn ApprovalGate>,
    pub deployer: Option<Arc<dyn Deployer>>,
    pub feedback: Option<Arc<dyn FeedbackRecorder>>,
}

impl CollaboratorSet {
    /// Assemble the minimum viable set; advisory collaborators default to
    /// absent and the approval gate to [`AutoApprove`].
    pub fn new(
        extractor: Arc<dyn RequirementExtractor>,
        discovery: Arc<dyn ApiDiscovery>,
        dag_builder: Arc<dyn DagBuilder>,
        generator: Arc<dyn CodeGenerator>,
    ) -> Self {
        Self {
            extractor,
            discovery,
            dag_builder,
            generator,
            security_reviewer: None,
            test_generator: None,
            approval_gate: Arc::new(AutoApprove),
            deployer: None,
            feedback: None,
        }
    }
}

impl std::fmt::Debug for CollaboratorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaboratorSet")
            .field("security_reviewer", &self.security_reviewer.is_some())
            .field("test_generator", &self.test_generator.is_some())
            .field("deployer", &self.deployer.is_some())
            .field("feedback", &self.feedback.is_some())
            .finish_non_exhaustive()
    }
}
