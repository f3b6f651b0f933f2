//! Built-in phase implementations: Analysis, Development, Judge, Fixer.
//!
//! Each phase builds a prompt for the agent runtime and interprets the
//! agent's final output. Structured outputs (story lists, review
//! verdicts) are required to be JSON; a brace-extraction pass tolerates
//! agents that wrap JSON in prose or markdown fences.

use serde::Deserialize;

use crate::orchestrator::ExecutionContext;
use crate::phase::{AgentOutcome, AgentRequest, PhaseResult, PhaseRole, PhaseSpec};
use crate::story::{ReviewAssessment, Story};

/// Extract the outermost JSON object from agent output that may be wrapped
/// in markdown fences or explanatory text.
fn extract_json(output: &str) -> &str {
    match (output.find('{'), output.rfind('}')) {
        (Some(start), Some(end)) if end > start => &output[start..=end],
        _ => output,
    }
}

fn request_for(phase: &dyn PhaseSpec, ctx: &ExecutionContext, prompt: String, system: &str) -> AgentRequest {
    AgentRequest {
        task_id: ctx.task.id.clone(),
        phase: phase.name().to_string(),
        agent_type: phase.agent_type().to_string(),
        prompt,
        system_prompt: Some(system.to_string()),
        workspace: ctx.workspace.clone(),
    }
}

/// Render the common task header shared by every prompt.
fn task_header(ctx: &ExecutionContext) -> String {
    let mut header = format!(
        "## Task\n**Title:** {}\n**Description:** {}\n",
        ctx.task.title, ctx.task.description
    );
    if !ctx.repositories.is_empty() {
        let repos: Vec<&str> = ctx.repositories.iter().map(|r| r.name.as_str()).collect();
        header.push_str(&format!("**Repositories:** {}\n", repos.join(", ")));
    }
    header
}

/// Render the active story block, when the story loop is driving.
fn story_block(ctx: &ExecutionContext) -> String {
    let Some(cursor) = &ctx.vars.current_story else {
        return String::new();
    };
    let mut block = format!(
        "\n## Story {} of {}\n**Title:** {}\n**Description:** {}\n",
        cursor.index + 1,
        cursor.total,
        cursor.story.title,
        cursor.story.description
    );
    if !cursor.story.files.is_empty() {
        block.push_str(&format!("**Files:** {}\n", cursor.story.files.join(", ")));
    }
    if !cursor.story.acceptance_criteria.is_empty() {
        block.push_str("**Acceptance criteria:**\n");
        for criterion in &cursor.story.acceptance_criteria {
            block.push_str(&format!("- {}\n", criterion));
        }
    }
    block
}

/// Render human feedback attached by a request_changes approval.
fn feedback_block(ctx: &ExecutionContext, phase: &str) -> String {
    match ctx.feedback_for(phase) {
        Some(feedback) => format!("\n## Reviewer feedback on your previous attempt\n{}\n", feedback),
        None => String::new(),
    }
}

// ── Analysis ─────────────────────────────────────────────────────────

const ANALYST_SYSTEM_PROMPT: &str = r#"You are a software engineering analyst. Break the given task into independently implementable stories.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "stories": [
    {
      "title": "Short story name",
      "description": "Detailed prompt for the developer agent",
      "files": ["files/this/story/touches.rs"],
      "acceptance_criteria": ["observable behavior that proves the story is done"]
    }
  ]
}

Rules:
- Stories run strictly in order; later stories may build on earlier file changes.
- For a simple task, return a single story or an empty list - don't over-decompose.
- Keep each story small enough to develop and review in one sitting.
"#;

#[derive(Debug, Deserialize)]
struct AnalysisReport {
    #[serde(default)]
    stories: Vec<StoryDraft>,
}

#[derive(Debug, Deserialize)]
struct StoryDraft {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
}

/// Breaks a task into stories. Its output seeds the story loop.
pub struct AnalysisPhase;

impl PhaseSpec for AnalysisPhase {
    fn name(&self) -> &str {
        "Analysis"
    }

    fn description(&self) -> &str {
        "Break the task into independently implementable stories"
    }

    fn agent_type(&self) -> &str {
        "analyst"
    }

    fn role(&self) -> PhaseRole {
        PhaseRole::Analysis
    }

    fn validate(&self, ctx: &ExecutionContext) -> bool {
        !ctx.task.title.trim().is_empty() || !ctx.task.description.trim().is_empty()
    }

    fn build_request(&self, ctx: &ExecutionContext) -> AgentRequest {
        let prompt = format!(
            "Analyze this task and produce a story decomposition.\n\n{}{}\nRespond with JSON only.",
            task_header(ctx),
            feedback_block(ctx, self.name()),
        );
        request_for(self, ctx, prompt, ANALYST_SYSTEM_PROMPT)
    }

    fn interpret(&self, outcome: &AgentOutcome, _ctx: &ExecutionContext) -> PhaseResult {
        let report: AnalysisReport = match serde_json::from_str(extract_json(&outcome.final_output))
        {
            Ok(report) => report,
            Err(e) => {
                return PhaseResult::fail(format!("analysis output was not valid JSON: {}", e));
            }
        };

        let stories: Vec<Story> = report
            .stories
            .into_iter()
            .map(|draft| {
                let mut story = Story::new(&draft.title, &draft.description);
                story.files = draft.files;
                story.acceptance_criteria = draft.acceptance_criteria;
                story
            })
            .collect();

        let count = stories.len();
        match serde_json::to_value(&stories) {
            Ok(stories) => PhaseResult::ok(serde_json::json!({ "stories": stories }))
                .with_metadata("story_count", serde_json::json!(count)),
            Err(e) => PhaseResult::fail(format!("failed to serialize stories: {}", e)),
        }
    }
}

// ── Development ──────────────────────────────────────────────────────

const DEVELOPER_SYSTEM_PROMPT: &str = "You are a software developer agent. Implement the requested \
change in the current workspace, keeping the diff minimal and the existing style intact. Finish \
with a short summary of what you changed.";

/// Implements the task (or the active story) in the workspace.
pub struct DevelopmentPhase;

impl PhaseSpec for DevelopmentPhase {
    fn name(&self) -> &str {
        "Development"
    }

    fn description(&self) -> &str {
        "Implement the task or the active story"
    }

    fn agent_type(&self) -> &str {
        "developer"
    }

    fn role(&self) -> PhaseRole {
        PhaseRole::Development
    }

    fn predecessor(&self) -> Option<&str> {
        Some("Analysis")
    }

    fn validate(&self, _ctx: &ExecutionContext) -> bool {
        true
    }

    fn build_request(&self, ctx: &ExecutionContext) -> AgentRequest {
        let prompt = format!(
            "Implement the following.\n\n{}{}{}",
            task_header(ctx),
            story_block(ctx),
            feedback_block(ctx, self.name()),
        );
        request_for(self, ctx, prompt, DEVELOPER_SYSTEM_PROMPT)
    }

    fn interpret(&self, outcome: &AgentOutcome, _ctx: &ExecutionContext) -> PhaseResult {
        if outcome.final_output.trim().is_empty() {
            return PhaseResult::fail("development produced no output");
        }
        PhaseResult::ok(serde_json::json!({
            "summary": outcome.final_output,
            "tool_calls": outcome.tool_calls.len(),
            "turns": outcome.turns,
        }))
    }
}

// ── Judge ────────────────────────────────────────────────────────────

const JUDGE_SYSTEM_PROMPT: &str = r#"You are a code review judge. Assess the development work against the task and its acceptance criteria.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "verdict": "approved" | "rejected" | "needs_revision",
  "score": 0.0,
  "issues": [
    { "severity": "low" | "medium" | "high" | "critical", "description": "what is wrong", "file": "optional/path.rs" }
  ]
}

Rules:
- "approved" means the work is mergeable as-is.
- "needs_revision" means the issues are fixable without redoing the work.
- "rejected" means the approach is wrong and the changes should be discarded.
- Every non-approved verdict needs at least one concrete issue.
"#;

/// Reviews the Development output and produces a verdict.
pub struct JudgePhase;

impl PhaseSpec for JudgePhase {
    fn name(&self) -> &str {
        "Judge"
    }

    fn description(&self) -> &str {
        "Review the development output and record a verdict"
    }

    fn agent_type(&self) -> &str {
        "reviewer"
    }

    fn role(&self) -> PhaseRole {
        PhaseRole::Review
    }

    fn predecessor(&self) -> Option<&str> {
        Some("Development")
    }

    fn validate(&self, _ctx: &ExecutionContext) -> bool {
        true
    }

    fn build_request(&self, ctx: &ExecutionContext) -> AgentRequest {
        let development = ctx
            .result("Development")
            .map(|r| r.output.to_string())
            .unwrap_or_else(|| "(no development output recorded)".to_string());
        let prompt = format!(
            "Review the development work below.\n\n{}{}\n## Development output\n{}\n\nRespond with JSON only.",
            task_header(ctx),
            story_block(ctx),
            development,
        );
        request_for(self, ctx, prompt, JUDGE_SYSTEM_PROMPT)
    }

    fn interpret(&self, outcome: &AgentOutcome, _ctx: &ExecutionContext) -> PhaseResult {
        let assessment: ReviewAssessment =
            match serde_json::from_str(extract_json(&outcome.final_output)) {
                Ok(assessment) => assessment,
                Err(e) => {
                    return PhaseResult::fail(format!("judge output was not valid JSON: {}", e));
                }
            };

        let issues = assessment.issues.len();
        match serde_json::to_value(&assessment) {
            Ok(output) => PhaseResult::ok(output)
                .with_metadata("verdict", serde_json::json!(assessment.verdict.as_str()))
                .with_metadata("issue_count", serde_json::json!(issues)),
            Err(e) => PhaseResult::fail(format!("failed to serialize assessment: {}", e)),
        }
    }
}

// ── Fixer ────────────────────────────────────────────────────────────

const FIXER_SYSTEM_PROMPT: &str = "You are a software developer agent fixing review findings. \
Address every listed issue with the smallest change that resolves it; do not rework parts the \
reviewer did not flag. Finish with a short summary of the fixes.";

/// Addresses the issues raised by the Judge.
pub struct FixerPhase;

impl PhaseSpec for FixerPhase {
    fn name(&self) -> &str {
        "Fixer"
    }

    fn description(&self) -> &str {
        "Address the issues raised by the review"
    }

    fn agent_type(&self) -> &str {
        "fixer"
    }

    fn role(&self) -> PhaseRole {
        PhaseRole::Fix
    }

    fn predecessor(&self) -> Option<&str> {
        Some("Judge")
    }

    fn validate(&self, _ctx: &ExecutionContext) -> bool {
        true
    }

    fn build_request(&self, ctx: &ExecutionContext) -> AgentRequest {
        let mut issues = String::new();
        if let Some(review) = &ctx.vars.review {
            for issue in &review.issues {
                match &issue.file {
                    Some(file) => issues.push_str(&format!(
                        "- [{}] {} ({})\n",
                        issue.severity, issue.description, file
                    )),
                    None => {
                        issues.push_str(&format!("- [{}] {}\n", issue.severity, issue.description))
                    }
                }
            }
        }
        if issues.is_empty() {
            issues.push_str("(no structured issues recorded; re-check the review output)\n");
        }
        let prompt = format!(
            "Fix the review findings below.\n\n{}{}\n## Review findings\n{}",
            task_header(ctx),
            story_block(ctx),
            issues,
        );
        request_for(self, ctx, prompt, FIXER_SYSTEM_PROMPT)
    }

    fn interpret(&self, outcome: &AgentOutcome, _ctx: &ExecutionContext) -> PhaseResult {
        if outcome.final_output.trim().is_empty() {
            return PhaseResult::fail("fixer produced no output");
        }
        PhaseResult::ok(serde_json::json!({
            "summary": outcome.final_output,
            "tool_calls": outcome.tool_calls.len(),
        }))
    }
}
