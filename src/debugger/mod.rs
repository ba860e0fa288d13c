//! Automated repair coordination.
//!
//! Turns a failed execution into a `DebugDiagnosis`: classifies the
//! failure, gathers undefined-name evidence, packages everything into a
//! `FixBrief`, and asks the code generator for a complete replacement
//! source. Infallible by contract: a broken generator yields an unresolved
//! diagnosis with the source unchanged, never an error.

use std::sync::Arc;

use crate::classify;
use crate::collaborators::{CodeGenerator, FixBrief};
use crate::models::{DebugDiagnosis, ExecutionResult, GeneratedCode};

pub struct DebugCoordinator {
    generator: Arc<dyn CodeGenerator>,
    ceiling: u32,
}

impl DebugCoordinator {
    pub fn new(generator: Arc<dyn CodeGenerator>, ceiling: u32) -> Self {
        Self { generator, ceiling }
    }

    /// Diagnose a failed attempt and produce a replacement source.
    ///
    /// `attempt` is 1-based and monotonically increasing per run. The
    /// returned diagnosis always carries a complete candidate source:
    /// either the generator's replacement or, when the generator itself
    /// fails, the original unchanged.
    pub async fn diagnose_and_fix(
        &self,
        code: &GeneratedCode,
        result: &ExecutionResult,
        attempt: u32,
    ) -> DebugDiagnosis {
        // Classification prefers real stderr; a result with no captured
        // stderr (collaborator fault, cancellation) falls back to its
        // error string.
        let stderr = if result.stderr.trim().is_empty() {
            result.error.clone().unwrap_or_default()
        } else {
            result.stderr.clone()
        };
        let parsed = classify::parse_error(&stderr, &code.source);
        let undefined_names = classify::find_undefined_names(&code.source);

        let root_cause = if parsed.error_type.is_empty() {
            parsed.message.clone()
        } else {
            format!("{}: {}", parsed.error_type, parsed.message)
        };

        let brief = FixBrief {
            attempt,
            ceiling: self.ceiling,
            category: parsed.category,
            error_type: parsed.error_type.clone(),
            error_message: parsed.message.clone(),
            line_number: parsed.line_number,
            code_context: parsed.code_context.clone(),
            frames: parsed.frames.clone(),
            suggestions: parsed.suggestions.clone(),
            undefined_names,
            stderr,
            source: code.source.clone(),
            aux_files: code.aux_files.clone(),
        };

        tracing::info!(
            attempt,
            ceiling = self.ceiling,
            category = %parsed.category,
            root_cause = %root_cause,
            "Requesting repair"
        );

        match self.generator.repair(&brief).await {
            Ok(replacement) => DebugDiagnosis {
                category: parsed.category,
                root_cause,
                fix_description: format!(
                    "Attempt {}/{}: regenerated source for {} error",
                    attempt, self.ceiling, parsed.category
                ),
                diff: summarize_diff(&code.source, &replacement.source),
                replacement_source: replacement.source,
            },
            Err(e) => {
                tracing::warn!(attempt, error = %e, "Repair collaborator failed, attempt left unresolved");
                DebugDiagnosis {
                    category: parsed.category,
                    root_cause,
                    fix_description: format!(
                        "Attempt {}/{}: unresolved, repair collaborator failed ({})",
                        attempt, self.ceiling, e
                    ),
                    replacement_source: code.source.clone(),
                    diff: String::new(),
                }
            }
        }
    }
}

/// Compact line diff of the changed region: common prefix and suffix are
/// trimmed, the middle is shown as removals then additions.
fn summarize_diff(old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut out = Vec::new();
    out.push(format!("@@ line {} @@", prefix + 1));
    for line in &old_lines[prefix..old_lines.len() - suffix] {
        out.push(format!("- {}", line));
    }
    for line in &new_lines[prefix..new_lines.len() - suffix] {
        out.push(format!("+ {}", line));
    }
    out.join("\n")
}
