//! The run state machine.
//!
//! `Orchestrator::start` spawns one task per run; the returned `RunHandle`
//! exposes the live event stream, a cancellation token, and the final
//! report. Runs are fully independent: each owns its state, event bus, and
//! scratch resources, and shares only read-only settings and the probed
//! sandbox capability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collaborators::CollaboratorSet;
use crate::config::Settings;
use crate::debugger::DebugCoordinator;
use crate::errors::{CollaboratorError, PipelineError};
use crate::events::{EventBus, PipelineEvent};
use crate::models::{
    DebugDiagnosis, ExecutionResult, Phase, RunOutcome, RunReport, RunRequest, RunState,
    SandboxKind,
};
use crate::pipeline::routing::{self, CollectRoute};
use crate::sandbox::SandboxExecutor;

/// Handle to one in-flight run.
pub struct RunHandle {
    pub run_id: Uuid,
    pub events: broadcast::Receiver<PipelineEvent>,
    cancel: CancellationToken,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to reach its terminal state. Takes `&mut self` so
    /// the event receiver stays drainable after completion; it was
    /// subscribed before the run task started and buffers every event.
    pub async fn wait(&mut self) -> Result<RunReport, PipelineError> {
        (&mut self.task)
            .await
            .map_err(|e| PipelineError::TaskPanicked(e.to_string()))
    }
}

pub struct Orchestrator {
    collaborators: CollaboratorSet,
    settings: Settings,
    sandbox: Arc<SandboxExecutor>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        collaborators: CollaboratorSet,
        settings: Settings,
        sandbox: SandboxExecutor,
    ) -> Self {
        Self {
            collaborators,
            settings,
            sandbox: Arc::new(sandbox),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a run. Returns immediately; the pipeline advances on its own
    /// task and is observable through the handle's event stream.
    pub fn start(&self, request: RunRequest) -> RunHandle {
        let run_id = Uuid::new_v4();
        let bus = EventBus::new(run_id, self.settings.event_buffer);
        let events = bus.subscribe();
        let cancel = CancellationToken::new();

        if let Ok(mut running) = self.running.lock() {
            running.insert(run_id, cancel.clone());
        }

        let task = RunTask {
            state: RunState::new(run_id, request),
            bus,
            collaborators: self.collaborators.clone(),
            settings: self.settings.clone(),
            sandbox: Arc::clone(&self.sandbox),
            cancel: cancel.clone(),
        };
        // Drop the registry entry once the run is terminal; cancel_run on a
        // finished run reports RunNotFound instead of silently succeeding.
        let running = Arc::clone(&self.running);
        let task = tokio::spawn(async move {
            let report = task.run().await;
            if let Ok(mut running) = running.lock() {
                running.remove(&run_id);
            }
            report
        });

        RunHandle {
            run_id,
            events,
            cancel,
            task,
        }
    }

    /// Cancel a run by id. The run still drives itself to a terminal state.
    pub fn cancel_run(&self, run_id: Uuid) -> Result<(), PipelineError> {
        let running = self
            .running
            .lock()
            .map_err(|_| PipelineError::TaskPanicked("run registry poisoned".to_string()))?;
        match running.get(&run_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(PipelineError::RunNotFound(run_id)),
        }
    }
}

/// One run's worth of pipeline work. Owns the state exclusively.
struct RunTask {
    state: RunState,
    bus: EventBus,
    collaborators: CollaboratorSet,
    settings: Settings,
    sandbox: Arc<SandboxExecutor>,
    cancel: CancellationToken,
}

enum StepOutcome {
    Next(Phase),
    Terminal(RunOutcome, String),
}

impl RunTask {
    async fn run(mut self) -> RunReport {
        self.bus.publish(
            "conversation.started",
            Phase::Collecting,
            "Analyzing your request...",
            json!({ "message": self.state.request.message }),
        );

        let (outcome, final_message) = loop {
            if self.cancel.is_cancelled() {
                self.bus.publish(
                    "run.cancelled",
                    self.state.phase,
                    "Run cancelled",
                    json!(null),
                );
                break (RunOutcome::Failed, "Run cancelled".to_string());
            }

            let step = match self.state.phase {
                Phase::Collecting => self.collect().await,
                Phase::Discovering => self.discover().await,
                Phase::Planning => self.plan().await,
                Phase::Generating => self.generate().await,
                Phase::Reviewing => self.review().await,
                Phase::Testing => self.test().await,
                Phase::Executing => self.execute().await,
                Phase::Debugging => self.debug().await,
                Phase::Presenting => self.present().await,
                Phase::Deploying => self.deploy().await,
            };

            match step {
                StepOutcome::Next(phase) => {
                    self.state.phase = phase;
                }
                StepOutcome::Terminal(outcome, message) => break (outcome, message),
            }
        };

        let report = self.report(outcome, final_message);
        if let Some(feedback) = &self.collaborators.feedback {
            if let Err(e) = feedback.record(&report).await {
                tracing::warn!(run_id = %report.run_id, error = %e, "Feedback recorder failed");
            }
        }
        report
    }

    fn report(&self, outcome: RunOutcome, final_message: String) -> RunReport {
        let clarifying_questions = self
            .state
            .requirements
            .as_ref()
            .map(|r| r.clarifying_questions.clone())
            .unwrap_or_default();
        RunReport {
            run_id: self.state.run_id,
            outcome,
            final_message,
            requirements: self.state.requirements.clone(),
            dag: self.state.dag.clone(),
            code: self.state.code.clone(),
            execution_result: self.state.execution_result.clone(),
            test_report: self.state.test_report.clone(),
            debug_attempts: self.state.debug_attempts,
            debug_history: self.state.debug_history.clone(),
            clarifying_questions,
        }
    }

    /// Convert a required-collaborator fault into an ordinary failure.
    ///
    /// These faults all happen before a candidate source exists, so there
    /// is nothing the repair loop could rewrite: the failed result and a
    /// classifier-shaped fallback diagnosis are recorded and the run
    /// proceeds to presentation, terminating as failed with the fault
    /// preserved.
    fn stage_fault(&mut self, stage: &str, err: CollaboratorError) -> StepOutcome {
        tracing::error!(run_id = %self.state.run_id, stage, error = %err, "Stage collaborator fault");
        let message = format!("CollaboratorError in {}: {}", stage, err);
        let parsed = crate::classify::parse_error(&message, self.state.source());
        self.state.debug_history.push(DebugDiagnosis {
            category: parsed.category,
            root_cause: message.clone(),
            fix_description: format!("Unresolved: the {} collaborator failed", stage),
            replacement_source: self.state.source().to_string(),
            diff: String::new(),
        });
        self.state.execution_result =
            Some(ExecutionResult::failure(message, SandboxKind::None));
        self.bus.publish(
            "execution.failed",
            self.state.phase,
            format!("The {} stage failed: {}", stage, err),
            json!({ "stage": stage, "error": err.to_string() }),
        );
        StepOutcome::Next(Phase::Presenting)
    }

    async fn collect(&mut self) -> StepOutcome {
        let requirements = match self
            .collaborators
            .extractor
            .extract(&self.state.request.message, &self.state.request.history)
            .await
        {
            Ok(req) => req,
            Err(e) => return self.stage_fault("collecting", e),
        };

        self.bus.publish(
            "requirements.extracted",
            Phase::Collecting,
            format!(
                "Understood: {} ({} actions, confidence {:.2})",
                requirements.intent,
                requirements.actions.len(),
                requirements.confidence
            ),
            json!({
                "confidence": requirements.confidence,
                "actions": requirements.actions.len(),
            }),
        );

        let route = routing::route_after_collecting(
            requirements.confidence,
            self.settings.confidence_threshold,
            self.state.clarifications_asked,
        );
        let questions = requirements.clarifying_questions.clone();
        self.state.requirements = Some(requirements);

        match route {
            CollectRoute::Proceed => StepOutcome::Next(Phase::Discovering),
            CollectRoute::AwaitClarification => {
                self.state.clarifications_asked += 1;
                self.bus.publish(
                    "clarification.requested",
                    Phase::Collecting,
                    "I need a bit more detail before building this.",
                    json!({ "questions": questions }),
                );
                StepOutcome::Terminal(
                    RunOutcome::AwaitingClarification,
                    "Waiting for clarification".to_string(),
                )
            }
        }
    }

    async fn discover(&mut self) -> StepOutcome {
        let actions = self
            .state
            .requirements
            .as_ref()
            .map(|r| r.actions.clone())
            .unwrap_or_default();

        for action in actions {
            match self.collaborators.discovery.discover(&action).await {
                Ok(candidates) if candidates.is_empty() => {
                    self.bus.publish(
                        "api.unmatched",
                        Phase::Discovering,
                        format!("No known API for '{}', will research it", action.description),
                        json!({ "action": action.id }),
                    );
                    self.state.unmatched_actions.push(action);
                }
                Ok(candidates) => {
                    self.bus.publish(
                        "api.discovered",
                        Phase::Discovering,
                        format!(
                            "Found {} API candidate(s) for '{}'",
                            candidates.len(),
                            action.description
                        ),
                        json!({
                            "action": action.id,
                            "top": candidates.first().map(|c| c.endpoint.clone()),
                        }),
                    );
                    self.state.discovered_apis.extend(candidates);
                }
                Err(e) => return self.stage_fault("discovering", e),
            }
        }
        StepOutcome::Next(Phase::Planning)
    }

    async fn plan(&mut self) -> StepOutcome {
        let requirements = match &self.state.requirements {
            Some(req) => req.clone(),
            None => {
                return self.stage_fault(
                    "planning",
                    CollaboratorError::call_failed("dag_builder", "no requirements available"),
                )
            }
        };

        let dag = match self
            .collaborators
            .dag_builder
            .build(
                &requirements,
                &self.state.discovered_apis,
                &self.state.unmatched_actions,
            )
            .await
        {
            Ok(dag) => dag,
            Err(e) => return self.stage_fault("planning", e),
        };

        // Planners are not trusted: a cyclic or dangling plan is rejected
        // before anything is generated or executed.
        if let Err(reason) = dag.validate() {
            return self.stage_fault(
                "planning",
                CollaboratorError::MalformedResponse {
                    name: "dag_builder".to_string(),
                    message: reason,
                },
            );
        }

        self.bus.publish(
            "workflow.planned",
            Phase::Planning,
            format!("Planned workflow '{}' with {} steps", dag.name, dag.steps.len()),
            json!({
                "steps": dag.steps.len(),
                "parallel_groups": dag.parallel_groups().len(),
            }),
        );
        self.state.dag = Some(dag);
        StepOutcome::Next(Phase::Generating)
    }

    async fn generate(&mut self) -> StepOutcome {
        let dag = match &self.state.dag {
            Some(dag) => dag.clone(),
            None => {
                return self.stage_fault(
                    "generating",
                    CollaboratorError::call_failed("code_generator", "no workflow plan available"),
                )
            }
        };

        let code = match self
            .collaborators
            .generator
            .generate(&dag, &self.state.data_mappings)
            .await
        {
            Ok(code) => code,
            Err(e) => return self.stage_fault("generating", e),
        };

        self.bus.publish(
            "code.generated",
            Phase::Generating,
            format!(
                "Generated {} lines of integration code",
                code.source.lines().count()
            ),
            json!({ "aux_files": code.aux_files.len() }),
        );
        self.state.code = Some(code);
        StepOutcome::Next(Phase::Reviewing)
    }

    async fn review(&mut self) -> StepOutcome {
        let reviewer = match &self.collaborators.security_reviewer {
            Some(reviewer) => Arc::clone(reviewer),
            None => return StepOutcome::Next(Phase::Testing),
        };
        let code = self.state.code.clone().unwrap_or_default();

        // Advisory: findings are surfaced to the approval gate but never
        // change routing, and a broken reviewer does not fail the run.
        match reviewer.review(&code).await {
            Ok(findings) => {
                self.bus.publish(
                    "security.reviewed",
                    Phase::Reviewing,
                    "Security review complete",
                    findings.clone(),
                );
                self.state.security_review = Some(findings);
            }
            Err(e) => {
                tracing::warn!(run_id = %self.state.run_id, error = %e, "Security reviewer failed");
                self.bus.publish(
                    "security.skipped",
                    Phase::Reviewing,
                    "Security review unavailable",
                    json!({ "error": e.to_string() }),
                );
            }
        }
        StepOutcome::Next(Phase::Testing)
    }

    async fn test(&mut self) -> StepOutcome {
        let tester = match &self.collaborators.test_generator {
            Some(tester) => Arc::clone(tester),
            None => return StepOutcome::Next(Phase::Executing),
        };
        let code = self.state.code.clone().unwrap_or_default();
        let dag = self.state.dag.clone().unwrap_or_default();

        match tester.run_tests(&code, &dag).await {
            Ok(report) => {
                self.bus.publish(
                    "tests.completed",
                    Phase::Testing,
                    format!("{}/{} generated tests passed", report.passed, report.total),
                    json!({ "passed": report.passed, "failed": report.failed }),
                );
                self.state.test_report = Some(report);
            }
            Err(e) => {
                tracing::warn!(run_id = %self.state.run_id, error = %e, "Test generator failed");
                self.bus.publish(
                    "tests.skipped",
                    Phase::Testing,
                    "Generated tests unavailable",
                    json!({ "error": e.to_string() }),
                );
            }
        }
        StepOutcome::Next(Phase::Executing)
    }

    async fn execute(&mut self) -> StepOutcome {
        let attempt = self.state.debug_attempts + 1;
        self.bus.publish(
            "execution.started",
            Phase::Executing,
            format!("Executing in sandbox (attempt {})...", attempt),
            json!({ "attempt": attempt, "sandbox": self.sandbox.kind().as_str() }),
        );

        let code = self.state.code.clone().unwrap_or_default();

        // Syntax pre-check short-circuits before any sandbox invocation.
        let result = if let Some(parsed) = crate::classify::validate_syntax(&code.source) {
            let line = parsed.line_number.unwrap_or(0);
            ExecutionResult {
                success: false,
                stdout: String::new(),
                stderr: format!(
                    "  File \"workflow.py\", line {}\nSyntaxError: {}",
                    line, parsed.message
                ),
                error: Some(format!("SyntaxError: {}", parsed.message)),
                execution_time: 0.0,
                sandbox: SandboxKind::None,
            }
        } else {
            match self.sandbox.execute(&code, &self.cancel).await {
                Ok(result) => result,
                Err(e) => ExecutionResult::failure(e.to_string(), SandboxKind::None),
            }
        };

        if result.success {
            self.bus.publish(
                "execution.completed",
                Phase::Executing,
                format!(
                    "Execution succeeded in {:.2}s ({})",
                    result.execution_time,
                    result.sandbox.as_str()
                ),
                json!({ "sandbox": result.sandbox.as_str(), "stdout": result.stdout }),
            );
        } else {
            self.bus.publish(
                "execution.failed",
                Phase::Executing,
                format!("Execution failed (attempt {})", attempt),
                json!({
                    "attempt": attempt,
                    "error": result.error,
                    "sandbox": result.sandbox.as_str(),
                }),
            );
        }

        let success = result.success;
        self.state.execution_result = Some(result);
        StepOutcome::Next(routing::route_after_execution(success))
    }

    async fn debug(&mut self) -> StepOutcome {
        let attempt = self.state.debug_attempts + 1;
        let code = self.state.code.clone().unwrap_or_default();
        let result = match &self.state.execution_result {
            Some(result) => result.clone(),
            None => ExecutionResult::failure("missing execution result", SandboxKind::None),
        };

        self.bus.publish(
            "debug.started",
            Phase::Debugging,
            format!(
                "Diagnosing failure (attempt {}/{})...",
                attempt, self.settings.max_debug_attempts
            ),
            json!({ "attempt": attempt }),
        );

        let coordinator = DebugCoordinator::new(
            Arc::clone(&self.collaborators.generator),
            self.settings.max_debug_attempts,
        );
        let diagnosis = coordinator.diagnose_and_fix(&code, &result, attempt).await;

        self.bus.publish(
            "debug.diagnosed",
            Phase::Debugging,
            format!("{}: {}", diagnosis.category, diagnosis.root_cause),
            json!({
                "attempt": attempt,
                "category": diagnosis.category.as_str(),
                "fix": diagnosis.fix_description,
            }),
        );

        self.state.debug_attempts = attempt;
        if let Some(code) = &mut self.state.code {
            code.source = diagnosis.replacement_source.clone();
        }
        self.state.debug_history.push(diagnosis);

        let next = routing::route_after_debug(attempt, self.settings.max_debug_attempts);
        if next == Phase::Presenting {
            self.bus.publish(
                "debug.exhausted",
                Phase::Debugging,
                format!(
                    "Retry ceiling of {} reached; presenting last artifact for review",
                    self.settings.max_debug_attempts
                ),
                json!({ "attempts": attempt }),
            );
        }
        StepOutcome::Next(next)
    }

    async fn present(&mut self) -> StepOutcome {
        let code = self.state.code.clone().unwrap_or_default();
        let execution = match &self.state.execution_result {
            Some(result) => result.clone(),
            None => ExecutionResult::failure("never executed", SandboxKind::None),
        };
        let needs_review = !execution.success;

        self.bus.publish(
            "workflow.approval_required",
            Phase::Presenting,
            if needs_review {
                "Automation could not be fully verified and needs review".to_string()
            } else {
                "Automation is ready for approval".to_string()
            },
            json!({
                "needs_review": needs_review,
                "debug_attempts": self.state.debug_attempts,
                "sandbox": execution.sandbox.as_str(),
            }),
        );

        // An artifact that never passed execution is preserved for review
        // but is never eligible for deployment.
        if needs_review {
            return StepOutcome::Terminal(
                RunOutcome::Failed,
                format!(
                    "Execution failed after {} repair attempt(s); artifact preserved for review",
                    self.state.debug_attempts
                ),
            );
        }

        let approved = match self
            .collaborators
            .approval_gate
            .approve(&code, &execution, self.state.security_review.as_ref())
            .await
        {
            Ok(approved) => approved,
            Err(e) => {
                tracing::warn!(run_id = %self.state.run_id, error = %e, "Approval gate failed, defaulting to rejection");
                false
            }
        };

        match routing::route_after_presenting(approved) {
            Some(next) => StepOutcome::Next(next),
            None => {
                self.bus.publish(
                    "workflow.rejected",
                    Phase::Presenting,
                    "Automation was not approved",
                    json!(null),
                );
                StepOutcome::Terminal(RunOutcome::Rejected, "Not approved".to_string())
            }
        }
    }

    async fn deploy(&mut self) -> StepOutcome {
        let code = self.state.code.clone().unwrap_or_default();
        let dag = self.state.dag.clone().unwrap_or_default();

        if let Some(deployer) = &self.collaborators.deployer {
            if let Err(e) = deployer.deploy(&code, &dag).await {
                self.bus.publish(
                    "deployment.failed",
                    Phase::Deploying,
                    format!("Deployment failed: {}", e),
                    json!({ "error": e.to_string() }),
                );
                return StepOutcome::Terminal(
                    RunOutcome::Failed,
                    format!("Deployment failed: {}", e),
                );
            }
        } else {
            tracing::info!(run_id = %self.state.run_id, "No deployer configured, artifact handed back as-is");
        }

        self.bus.publish(
            "workflow.deployed",
            Phase::Deploying,
            format!("Automation '{}' deployed", dag.name),
            json!({ "workflow": dag.id }),
        );
        StepOutcome::Terminal(RunOutcome::Deployed, "Deployed".to_string())
    }
}

// Scenario tests for the state machine live in tests/pipeline_tests.rs
// with mock collaborators.
