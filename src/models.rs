//! Core data model for the pipeline: run state, workflow DAG, execution
//! results, and debug diagnoses.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named stage in the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Collecting,
    Discovering,
    Planning,
    Generating,
    Reviewing,
    Testing,
    Executing,
    Debugging,
    Presenting,
    Deploying,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Discovering => "discovering",
            Self::Planning => "planning",
            Self::Generating => "generating",
            Self::Reviewing => "reviewing",
            Self::Testing => "testing",
            Self::Executing => "executing",
            Self::Debugging => "debugging",
            Self::Presenting => "presenting",
            Self::Deploying => "deploying",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collecting" => Ok(Self::Collecting),
            "discovering" => Ok(Self::Discovering),
            "planning" => Ok(Self::Planning),
            "generating" => Ok(Self::Generating),
            "reviewing" => Ok(Self::Reviewing),
            "testing" => Ok(Self::Testing),
            "executing" => Ok(Self::Executing),
            "debugging" => Ok(Self::Debugging),
            "presenting" => Ok(Self::Presenting),
            "deploying" => Ok(Self::Deploying),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Approved and handed to the deployer.
    Deployed,
    /// Execution succeeded but the approval gate declined.
    Rejected,
    /// Retry ceiling exhausted; the last artifact is preserved for review.
    Failed,
    /// Stopped after the clarification round was surfaced; the caller
    /// restarts the run with the user's answer.
    AwaitingClarification,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployed => "deployed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::AwaitingClarification => "awaiting_clarification",
        }
    }

    /// Whether the run ended with a usable, execution-verified artifact.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Deployed)
    }
}

// Requirement extraction models

/// One atomic action extracted from the user's request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionItem {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub service_hint: String,
    #[serde(default)]
    pub is_trigger: bool,
}

/// Output of the requirement-extraction collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub workflow_name: String,
    pub confidence: f64,
    #[serde(default)]
    pub actions: Vec<ActionItem>,
    #[serde(default)]
    pub clarifying_questions: Vec<String>,
    #[serde(default)]
    pub assumed_defaults: Vec<String>,
}

// API discovery models

/// A candidate API endpoint returned by semantic discovery, ranked by
/// confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCandidate {
    pub service: String,
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub base_url: String,
    pub confidence: f64,
}

// Workflow DAG models

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Trigger,
    ApiCall,
    Condition,
    Delay,
    /// No pre-indexed API matched; the code generator researches it.
    Research,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::ApiCall => "api_call",
            Self::Condition => "condition",
            Self::Delay => "delay",
            Self::Research => "research",
        }
    }
}

/// One node of the planned workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub step_type: StepType,
    #[serde(default)]
    pub api: Option<ApiCandidate>,
}

/// The planned workflow, produced by the external DAG builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub environment_vars: Vec<String>,
}

impl WorkflowDag {
    /// Validate referential integrity and acyclicity of the plan.
    ///
    /// Planners are not trusted to produce well-formed graphs; a dangling
    /// dependency or a cycle here is reported before anything executes.
    pub fn validate(&self) -> Result<(), String> {
        let ids: std::collections::HashSet<&str> =
            self.steps.iter().map(|s| s.id.as_str()).collect();
        if ids.len() != self.steps.len() {
            return Err("duplicate step ids in workflow DAG".to_string());
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ));
                }
            }
        }

        // Kahn's algorithm: if not every node drains, there is a cycle.
        let mut in_degree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut drained = 0usize;
        while let Some(id) = ready.pop() {
            drained += 1;
            if let Some(next) = dependents.get(id) {
                for n in next {
                    if let Some(d) = in_degree.get_mut(n) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(n);
                        }
                    }
                }
            }
        }

        if drained != self.steps.len() {
            return Err("workflow DAG contains a dependency cycle".to_string());
        }
        Ok(())
    }

    /// Group step ids by identical dependency sets — these can run in
    /// parallel.
    pub fn parallel_groups(&self) -> Vec<Vec<String>> {
        let mut by_deps: HashMap<Vec<String>, Vec<String>> = HashMap::new();
        for step in &self.steps {
            let mut key = step.depends_on.clone();
            key.sort();
            by_deps.entry(key).or_default().push(step.id.clone());
        }
        by_deps.into_values().filter(|g| g.len() > 1).collect()
    }
}

// Code generation models

/// The generated candidate program: one main source plus auxiliary files
/// (per-service clients, config modules) keyed by relative path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub source: String,
    #[serde(default)]
    pub aux_files: HashMap<String, String>,
}

// Execution models

/// Which execution strategy produced a result. Callers must be able to tell
/// a behavioral run from a structural approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    Docker,
    StaticAnalysis,
    None,
}

impl SandboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::StaticAnalysis => "static_analysis",
            Self::None => "none",
        }
    }
}

/// Outcome of one sandbox invocation attempt. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock seconds spent in the sandbox.
    pub execution_time: f64,
    pub sandbox: SandboxKind,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>, sandbox: SandboxKind) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            execution_time: 0.0,
            sandbox,
        }
    }
}

// Debug models

/// A proposed full-source fix plus its rationale. Appended to the run's
/// debug history each attempt; the history is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugDiagnosis {
    pub category: crate::classify::ErrorCategory,
    pub root_cause: String,
    pub fix_description: String,
    /// Complete replacement for the candidate source — never a partial
    /// patch, so every retry operates on one self-consistent artifact.
    pub replacement_source: String,
    #[serde(default)]
    pub diff: String,
}

// Run state

/// The incoming request that starts a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub message: String,
    /// Prior conversation turns, newest last. Carried when a run restarts
    /// after a clarification round.
    #[serde(default)]
    pub history: Vec<String>,
    /// Set when this request answers a previous clarification round.
    #[serde(default)]
    pub clarifications_asked: u32,
}

/// Mutable state for one in-flight run. Owned exclusively by the run task
/// for the run's lifetime; never shared across runs.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: Uuid,
    pub phase: Phase,
    pub request: RunRequest,
    pub requirements: Option<Requirements>,
    pub clarifications_asked: u32,
    pub discovered_apis: Vec<ApiCandidate>,
    pub unmatched_actions: Vec<ActionItem>,
    pub dag: Option<WorkflowDag>,
    pub data_mappings: Vec<serde_json::Value>,
    pub code: Option<GeneratedCode>,
    pub security_review: Option<serde_json::Value>,
    pub test_report: Option<TestReport>,
    pub execution_result: Option<ExecutionResult>,
    pub debug_attempts: u32,
    pub debug_history: Vec<DebugDiagnosis>,
}

impl RunState {
    pub fn new(run_id: Uuid, request: RunRequest) -> Self {
        let clarifications_asked = request.clarifications_asked;
        Self {
            run_id,
            phase: Phase::Collecting,
            request,
            requirements: None,
            clarifications_asked,
            discovered_apis: Vec::new(),
            unmatched_actions: Vec::new(),
            dag: None,
            data_mappings: Vec::new(),
            code: None,
            security_review: None,
            test_report: None,
            execution_result: None,
            debug_attempts: 0,
            debug_history: Vec::new(),
        }
    }

    /// Current candidate source text, empty until generation has run.
    pub fn source(&self) -> &str {
        self.code.as_ref().map(|c| c.source.as_str()).unwrap_or("")
    }
}

/// Advisory test results from the test-generation collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
    #[serde(default)]
    pub output: String,
}

/// Final report handed back through the run handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub final_message: String,
    pub requirements: Option<Requirements>,
    pub dag: Option<WorkflowDag>,
    pub code: Option<GeneratedCode>,
    pub execution_result: Option<ExecutionResult>,
    pub test_report: Option<TestReport>,
    pub debug_attempts: u32,
    pub debug_history: Vec<DebugDiagnosis>,
    pub clarifying_questions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            step_type: StepType::ApiCall,
            api: None,
        }
    }

    fn dag(steps: Vec<WorkflowStep>) -> WorkflowDag {
        WorkflowDag {
            id: "wf-1".into(),
            name: "test".into(),
            description: String::new(),
            steps,
            environment_vars: Vec::new(),
        }
    }

    #[test]
    fn test_phase_round_trip() {
        for phase in [
            Phase::Collecting,
            Phase::Discovering,
            Phase::Planning,
            Phase::Generating,
            Phase::Reviewing,
            Phase::Testing,
            Phase::Executing,
            Phase::Debugging,
            Phase::Presenting,
            Phase::Deploying,
        ] {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("warp_speed".parse::<Phase>().is_err());
    }

    #[test]
    fn test_dag_validate_linear_chain() {
        let d = dag(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_dag_validate_detects_cycle() {
        let d = dag(vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])]);
        let err = d.validate().unwrap_err();
        assert!(err.contains("cycle"), "unexpected error: {}", err);
    }

    #[test]
    fn test_dag_validate_detects_self_cycle() {
        let d = dag(vec![step("a", &["a"])]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_dag_validate_detects_dangling_dependency() {
        let d = dag(vec![step("a", &[]), step("b", &["ghost"])]);
        let err = d.validate().unwrap_err();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn test_dag_validate_detects_duplicate_ids() {
        let d = dag(vec![step("a", &[]), step("a", &[])]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_parallel_groups() {
        let d = dag(vec![
            step("fetch", &[]),
            step("notify_slack", &["fetch"]),
            step("notify_mail", &["fetch"]),
        ]);
        let groups = d.parallel_groups();
        assert_eq!(groups.len(), 1);
        let mut g = groups[0].clone();
        g.sort();
        assert_eq!(g, vec!["notify_mail", "notify_slack"]);
    }

    #[test]
    fn test_execution_result_failure_helper() {
        let r = ExecutionResult::failure("boom", SandboxKind::None);
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert_eq!(r.execution_time, 0.0);
    }

    #[test]
    fn test_run_state_source_empty_before_generation() {
        let state = RunState::new(Uuid::new_v4(), RunRequest::default());
        assert_eq!(state.source(), "");
        assert_eq!(state.phase, Phase::Collecting);
        assert_eq!(state.debug_attempts, 0);
    }
}
