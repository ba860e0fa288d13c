//! End-to-end state machine tests with mock collaborators and the
//! static-analysis sandbox (no container engine required).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use forgeflow::collaborators::{
    ApiDiscovery, CodeGenerator, CollaboratorSet, DagBuilder, FixBrief, RequirementExtractor,
};
use forgeflow::config::{SandboxConfig, Settings};
use forgeflow::errors::CollaboratorError;
use forgeflow::models::{
    ActionItem, ApiCandidate, GeneratedCode, Requirements, RunOutcome, RunRequest, SandboxKind,
    StepType, WorkflowDag, WorkflowStep,
};
use forgeflow::pipeline::Orchestrator;
use forgeflow::sandbox::SandboxExecutor;

const VALID_SOURCE: &str = "import httpx\n\n\nasync def main():\n    pass\n\n\nif __name__ == \"__main__\":\n    pass\n";
const BROKEN_SOURCE: &str = "def main(:\n    pass\n";

struct FixedExtractor {
    confidence: f64,
    delay: Option<Duration>,
}

#[async_trait]
impl RequirementExtractor for FixedExtractor {
    async fn extract(
        &self,
        message: &str,
        _history: &[String],
    ) -> Result<Requirements, CollaboratorError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Requirements {
            intent: "automation".into(),
            description: message.to_string(),
            workflow_name: "test-workflow".into(),
            confidence: self.confidence,
            actions: vec![ActionItem {
                id: "a1".into(),
                description: "post a message".into(),
                service_hint: "slack".into(),
                is_trigger: false,
            }],
            clarifying_questions: vec!["Which channel should the message go to?".into()],
            assumed_defaults: Vec::new(),
        })
    }
}

struct FailingExtractor;

#[async_trait]
impl RequirementExtractor for FailingExtractor {
    async fn extract(
        &self,
        _message: &str,
        _history: &[String],
    ) -> Result<Requirements, CollaboratorError> {
        Err(CollaboratorError::call_failed(
            "requirement_extractor",
            "upstream model unavailable",
        ))
    }
}

struct FixedDiscovery;

#[async_trait]
impl ApiDiscovery for FixedDiscovery {
    async fn discover(
        &self,
        _action: &ActionItem,
    ) -> Result<Vec<ApiCandidate>, CollaboratorError> {
        Ok(vec![ApiCandidate {
            service: "slack".into(),
            endpoint: "/api/chat.postMessage".into(),
            method: "POST".into(),
            description: "Post a message to a channel".into(),
            base_url: "https://slack.com".into(),
            confidence: 0.92,
        }])
    }
}

struct FixedDagBuilder;

#[async_trait]
impl DagBuilder for FixedDagBuilder {
    async fn build(
        &self,
        _requirements: &Requirements,
        _candidates: &[ApiCandidate],
        _unmatched: &[ActionItem],
    ) -> Result<WorkflowDag, CollaboratorError> {
        Ok(WorkflowDag {
            id: "wf-1".into(),
            name: "test-workflow".into(),
            description: String::new(),
            steps: vec![WorkflowStep {
                id: "s1".into(),
                name: "post".into(),
                description: String::new(),
                depends_on: Vec::new(),
                step_type: StepType::ApiCall,
                api: None,
            }],
            environment_vars: vec!["SLACK_BOT_TOKEN".into()],
        })
    }
}

struct CyclicDagBuilder;

#[async_trait]
impl DagBuilder for CyclicDagBuilder {
    async fn build(
        &self,
        _requirements: &Requirements,
        _candidates: &[ApiCandidate],
        _unmatched: &[ActionItem],
    ) -> Result<WorkflowDag, CollaboratorError> {
        let step = |id: &str, dep: &str| WorkflowStep {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            depends_on: vec![dep.into()],
            step_type: StepType::ApiCall,
            api: None,
        };
        Ok(WorkflowDag {
            id: "wf-cyclic".into(),
            name: "cyclic".into(),
            description: String::new(),
            steps: vec![step("a", "b"), step("b", "a")],
            environment_vars: Vec::new(),
        })
    }
}

/// Generates an initial source, then serves one repair source per attempt.
struct ScriptedGenerator {
    initial: String,
    repairs: Vec<String>,
    repair_calls: AtomicU32,
}

impl ScriptedGenerator {
    fn new(initial: &str, repairs: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            initial: initial.to_string(),
            repairs: repairs.iter().map(|s| s.to_string()).collect(),
            repair_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _dag: &WorkflowDag,
        _data_mappings: &[Value],
    ) -> Result<GeneratedCode, CollaboratorError> {
        Ok(GeneratedCode {
            source: self.initial.clone(),
            aux_files: HashMap::new(),
        })
    }

    async fn repair(&self, _brief: &FixBrief) -> Result<GeneratedCode, CollaboratorError> {
        let call = self.repair_calls.fetch_add(1, Ordering::SeqCst) as usize;
        let source = self
            .repairs
            .get(call)
            .cloned()
            .unwrap_or_else(|| self.initial.clone());
        Ok(GeneratedCode {
            source,
            aux_files: HashMap::new(),
        })
    }
}

fn orchestrator(
    extractor: Arc<dyn RequirementExtractor>,
    dag_builder: Arc<dyn DagBuilder>,
    generator: Arc<dyn CodeGenerator>,
) -> Orchestrator {
    let collaborators = CollaboratorSet::new(
        extractor,
        Arc::new(FixedDiscovery),
        dag_builder,
        generator,
    );
    Orchestrator::new(
        collaborators,
        Settings::default(),
        SandboxExecutor::with_capability(None, SandboxConfig::default()),
    )
}

#[tokio::test]
async fn happy_path_reaches_deployed() {
    let generator = ScriptedGenerator::new(VALID_SOURCE, &[]);
    let orch = orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.9,
            delay: None,
        }),
        Arc::new(FixedDagBuilder),
        generator.clone(),
    );

    let mut handle = orch.start(RunRequest {
        message: "post daily summary to slack".into(),
        history: Vec::new(),
        clarifications_asked: 0,
    });
    let report = handle.wait().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Deployed);
    assert_eq!(report.debug_attempts, 0);
    let execution = report.execution_result.unwrap();
    assert!(execution.success);
    assert_eq!(execution.sandbox, SandboxKind::StaticAnalysis);
    assert_eq!(generator.repair_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn low_confidence_pauses_for_clarification() {
    let orch = orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.4,
            delay: None,
        }),
        Arc::new(FixedDagBuilder),
        ScriptedGenerator::new(VALID_SOURCE, &[]),
    );

    let mut handle = orch.start(RunRequest::default());
    let report = handle.wait().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::AwaitingClarification);
    assert!(!report.clarifying_questions.is_empty());
    assert!(report.code.is_none());
}

#[tokio::test]
async fn second_clarification_round_is_never_requested() {
    let orch = orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.4,
            delay: None,
        }),
        Arc::new(FixedDagBuilder),
        ScriptedGenerator::new(VALID_SOURCE, &[]),
    );

    // Same low confidence, but one clarification round already happened.
    let mut handle = orch.start(RunRequest {
        message: "the channel is #ops".into(),
        history: vec!["post daily summary to slack".into()],
        clarifications_asked: 1,
    });
    let report = handle.wait().await.unwrap();

    assert_ne!(report.outcome, RunOutcome::AwaitingClarification);
    assert_eq!(report.outcome, RunOutcome::Deployed);
}

#[tokio::test]
async fn three_failures_exhaust_ceiling_and_present_last_artifact() {
    // Broken initial source and broken repairs: every attempt fails the
    // syntax pre-check, so the debug loop runs to the ceiling.
    let generator = ScriptedGenerator::new(BROKEN_SOURCE, &[BROKEN_SOURCE, BROKEN_SOURCE]);
    let orch = orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.9,
            delay: None,
        }),
        Arc::new(FixedDagBuilder),
        generator.clone(),
    );

    let mut handle = orch.start(RunRequest {
        message: "post daily summary to slack".into(),
        ..Default::default()
    });
    let report = handle.wait().await.unwrap();
    let mut events = handle.events;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.debug_attempts, 3);
    assert_eq!(report.debug_history.len(), 3);
    let last = report.execution_result.unwrap();
    assert!(!last.success);
    // The artifact is preserved even though every attempt failed.
    assert!(report.code.is_some());

    // The run announced a review-required presentation before terminating,
    // and attempts were numbered monotonically from 1.
    let mut seen_attempts = Vec::new();
    let mut saw_needs_review = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type == "debug.started" {
            seen_attempts.push(event.data["attempt"].as_u64().unwrap());
        }
        if event.event_type == "workflow.approval_required" {
            saw_needs_review = event.data["needs_review"].as_bool().unwrap_or(false);
        }
    }
    assert_eq!(seen_attempts, vec![1, 2, 3]);
    assert!(saw_needs_review);
}

#[tokio::test]
async fn successful_repair_recovers_and_deploys() {
    // First attempt fails on syntax, the first repair fixes it.
    let generator = ScriptedGenerator::new(BROKEN_SOURCE, &[VALID_SOURCE]);
    let orch = orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.9,
            delay: None,
        }),
        Arc::new(FixedDagBuilder),
        generator.clone(),
    );

    let mut handle = orch.start(RunRequest::default());
    let report = handle.wait().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Deployed);
    assert_eq!(report.debug_attempts, 1);
    assert_eq!(report.debug_history.len(), 1);
    assert!(report.execution_result.unwrap().success);
    assert_eq!(report.code.unwrap().source, VALID_SOURCE);
}

#[tokio::test]
async fn extractor_fault_still_reaches_terminal_state() {
    let orch = orchestrator(
        Arc::new(FailingExtractor),
        Arc::new(FixedDagBuilder),
        ScriptedGenerator::new(VALID_SOURCE, &[]),
    );

    let mut handle = orch.start(RunRequest::default());
    let report = handle.wait().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    let execution = report.execution_result.unwrap();
    assert!(!execution.success);
    assert!(execution.error.unwrap().contains("requirement_extractor"));

    // The fault is recorded as a classifier-shaped diagnosis, not dropped.
    assert_eq!(report.debug_history.len(), 1);
    let diagnosis = &report.debug_history[0];
    assert!(diagnosis.root_cause.contains("requirement_extractor"));
    assert!(diagnosis.fix_description.contains("Unresolved"));
}

#[tokio::test]
async fn cyclic_plan_is_rejected_before_generation() {
    let orch = orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.9,
            delay: None,
        }),
        Arc::new(CyclicDagBuilder),
        ScriptedGenerator::new(VALID_SOURCE, &[]),
    );

    let mut handle = orch.start(RunRequest::default());
    let report = handle.wait().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(report.code.is_none(), "no code should be generated for a bad plan");
    let execution = report.execution_result.unwrap();
    assert!(execution.error.unwrap().contains("cycle"));
}

#[tokio::test]
async fn events_arrive_in_stage_order() {
    let orch = orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.9,
            delay: None,
        }),
        Arc::new(FixedDagBuilder),
        ScriptedGenerator::new(VALID_SOURCE, &[]),
    );

    let mut handle = orch.start(RunRequest::default());
    handle.wait().await.unwrap();
    let mut events = handle.events;

    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        order.push(event.event_type);
    }

    let position = |name: &str| order.iter().position(|e| e == name);
    let started = position("conversation.started").unwrap();
    let extracted = position("requirements.extracted").unwrap();
    let planned = position("workflow.planned").unwrap();
    let generated = position("code.generated").unwrap();
    let executing = position("execution.started").unwrap();
    let deployed = position("workflow.deployed").unwrap();
    assert!(started < extracted);
    assert!(extracted < planned);
    assert!(planned < generated);
    assert!(generated < executing);
    assert!(executing < deployed);
}

#[tokio::test]
async fn cancellation_drives_run_to_failed_terminal() {
    let orch = orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.9,
            delay: Some(Duration::from_millis(100)),
        }),
        Arc::new(FixedDagBuilder),
        ScriptedGenerator::new(VALID_SOURCE, &[]),
    );

    let mut handle = orch.start(RunRequest::default());
    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert!(report.final_message.to_lowercase().contains("cancel"));
}

#[tokio::test]
async fn concurrent_runs_are_independent() {
    let orch = Arc::new(orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.9,
            delay: None,
        }),
        Arc::new(FixedDagBuilder),
        ScriptedGenerator::new(VALID_SOURCE, &[]),
    ));

    let a = orch.start(RunRequest {
        message: "run a".into(),
        ..Default::default()
    });
    let b = orch.start(RunRequest {
        message: "run b".into(),
        ..Default::default()
    });
    assert_ne!(a.run_id, b.run_id);

    let mut a = a;
    let mut b = b;
    let (ra, rb) = tokio::join!(a.wait(), b.wait());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.outcome, RunOutcome::Deployed);
    assert_eq!(rb.outcome, RunOutcome::Deployed);
    assert_ne!(ra.run_id, rb.run_id);
}

#[tokio::test]
async fn cancel_by_id_requires_known_run() {
    let orch = orchestrator(
        Arc::new(FixedExtractor {
            confidence: 0.9,
            delay: None,
        }),
        Arc::new(FixedDagBuilder),
        ScriptedGenerator::new(VALID_SOURCE, &[]),
    );
    assert!(orch.cancel_run(uuid::Uuid::new_v4()).is_err());

    let mut handle = orch.start(RunRequest::default());
    let run_id = handle.run_id;
    let _ = orch.cancel_run(run_id);
    let report = handle.wait().await.unwrap();
    // Depending on timing the run either finished or was cancelled; both
    // are terminal states.
    assert!(matches!(
        report.outcome,
        RunOutcome::Deployed | RunOutcome::Failed
    ));

    // Terminal runs leave the registry; cancelling again reports unknown.
    assert!(orch.cancel_run(run_id).is_err());
}
