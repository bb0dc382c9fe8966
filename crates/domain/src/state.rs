use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::task::TaskId;

/// Upper bound on injected file context before an explicit truncation
/// marker is appended (Coder node, §4.6).
pub const FILE_CONTEXT_TRUNCATION_BYTES: usize = 10 * 1024;
/// Upper bound on stdout/stderr slices fed back into review/reflection
/// prompts (Reviewer/Reflector nodes, §4.6).
pub const FEEDBACK_TRUNCATION_BYTES: usize = 2 * 1024;
/// Number of trailing chat turns appended to each Coder prompt (§9).
pub const CHAT_HISTORY_WINDOW: usize = 10;
/// Per-step retry cap before the router forces a finish (§4.6, §8).
pub const MAX_ITERATIONS_PER_STEP: u32 = 5;

pub const TRUNCATION_MARKER: &str = "\n...[truncated]...\n";
pub const ENGINE_UNAVAILABLE_MARKER: &str = "[System] engine unavailable";
pub const WAITING_FOR_CLIENT_MARKER: &str = "[Waiting for Client Tool Execution]";
pub const SAFETY_BLOCKED_MARKER: &str = "[Blocked by Safety Filters]";

/// Truncate `s` to `limit` bytes on a char boundary, appending the marker
/// when truncation actually occurred.
pub fn truncate_with_marker(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], TRUNCATION_MARKER)
}

/// Read-only editor context supplied at task start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContext {
    pub filename: String,
    pub content: String,
    #[serde(default)]
    pub selection: Option<String>,
    #[serde(default)]
    pub cursor_line: Option<u32>,
    #[serde(default)]
    pub language_id: Option<String>,
}

/// Accumulated token/cost usage for a task. Monotonically non-decreasing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub request_count: u64,
}

/// Raw usage counters returned by a single LLM call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl CostStats {
    /// Accumulate one call's usage. `cost_per_1k` prices input/output tokens;
    /// `(0.0, 0.0)` (the default, since rate tables are an out-of-scope
    /// collaborator) keeps `cost` at zero without breaking monotonicity.
    pub fn accumulate(&mut self, usage: Usage, cost_per_1k: (f64, f64)) {
        self.input_tokens += usage.prompt_tokens as u64;
        self.output_tokens += usage.completion_tokens as u64;
        self.request_count += 1;
        self.cost += (usage.prompt_tokens as f64 / 1000.0) * cost_per_1k.0
            + (usage.completion_tokens as f64 / 1000.0) * cost_per_1k.1;
    }
}

/// Coding mode selected for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Coder,
    Architect,
    Debugger,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Coder
    }
}

/// A single turn of the running conversation with the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

/// approve/reject outcome shared by the review and aggregation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Approve,
    Reject,
}

/// A single planner-produced step description.
pub type PlanStep = String;

/// State carried for the lifetime of one task, mutated by every node.
#[derive(Debug, Clone, Default)]
pub struct ProjectState {
    pub task_id: TaskId,
    pub user_input: String,
    pub workspace_root: Option<std::path::PathBuf>,
    pub file_context: Option<FileContext>,
    pub repo_map: Option<String>,
    pub cost_stats: CostStats,
    pub code_blocks: HashMap<String, String>,
    pub artifacts: HashMap<String, serde_json::Value>,
    pub full_chat_history: Vec<ChatTurn>,
    pub final_report: Option<String>,
    pub last_error: Option<String>,
    pub mode: Mode,
}

impl ProjectState {
    pub fn new(task_id: TaskId, user_input: String) -> Self {
        Self {
            task_id,
            user_input,
            ..Default::default()
        }
    }

    /// The trailing window of chat history sent with each Coder prompt.
    pub fn recent_history(&self) -> &[ChatTurn] {
        let len = self.full_chat_history.len();
        let start = len.saturating_sub(CHAT_HISTORY_WINDOW);
        &self.full_chat_history[start..]
    }
}

/// Per-run state layered on top of [`ProjectState`]; the working memory of
/// the workflow graph. Each node patches disjoint fields of this struct —
/// disjointness between the Reviewer and SecurityGuard fork branches is
/// enforced at the type level by [`crate::patch::ReviewerPatch`] and
/// [`crate::patch::SecurityPatch`] exposing setters only for their own
/// fields (see `crate::patch`).
#[derive(Debug, Clone, Default)]
pub struct WorkflowState {
    pub project: ProjectState,

    pub plan: Vec<PlanStep>,
    pub current_step_index: usize,
    pub iteration_count: u32,

    pub generated_code: Option<String>,

    pub execution_stdout: String,
    pub execution_stderr: String,
    pub execution_passed: bool,
    pub linter_passed: bool,

    pub functional_status: Option<ReviewStatus>,
    pub functional_feedback: String,
    pub security_feedback: String,

    pub review_status: Option<ReviewStatus>,
    pub review_feedback: String,
    pub review_report: String,

    pub reflection: Option<String>,
    pub final_output: Option<String>,
}

impl WorkflowState {
    pub fn new(project: ProjectState) -> Self {
        Self {
            project,
            linter_passed: true,
            ..Default::default()
        }
    }

    /// `executePassed` per §9's pinned definition: stderr free of "Error",
    /// "Traceback", and the engine-unavailable marker.
    pub fn compute_execution_passed(stderr: &str) -> bool {
        !stderr.contains("Error")
            && !stderr.contains("Traceback")
            && !stderr.contains(ENGINE_UNAVAILABLE_MARKER)
    }

    /// §4.6 Aggregator: reject if the linter failed, a security vulnerability
    /// marker is present, or the functional reviewer rejected.
    pub fn aggregate_review(&mut self) {
        let security_flagged = self.security_feedback.contains("VULNERABILITY");
        let functional_rejected = self.functional_status != Some(ReviewStatus::Approve);

        self.review_status = Some(
            if !self.linter_passed || security_flagged || functional_rejected {
                ReviewStatus::Reject
            } else {
                ReviewStatus::Approve
            },
        );
        self.review_feedback = format!("{}\n{}", self.functional_feedback, self.security_feedback)
            .trim()
            .to_string();
        self.review_report = self.functional_feedback.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_appends_marker_only_when_needed() {
        assert_eq!(truncate_with_marker("short", 100), "short");
        let long = "a".repeat(20);
        let truncated = truncate_with_marker(&long, 5);
        assert!(truncated.starts_with("aaaaa"));
        assert!(truncated.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn cost_stats_accumulate_is_monotonic() {
        let mut stats = CostStats::default();
        stats.accumulate(
            Usage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            },
            (0.01, 0.02),
        );
        assert_eq!(stats.input_tokens, 10);
        assert_eq!(stats.output_tokens, 20);
        assert_eq!(stats.request_count, 1);
        assert!(stats.cost > 0.0);

        let before = stats;
        stats.accumulate(Usage::default(), (0.01, 0.02));
        assert!(stats.input_tokens >= before.input_tokens);
        assert!(stats.request_count > before.request_count);
    }

    #[test]
    fn recent_history_caps_at_window() {
        let mut project = ProjectState::new(TaskId::new(), "hi".into());
        for i in 0..25 {
            project.full_chat_history.push(ChatTurn {
                role: ChatRole::User,
                content: i.to_string(),
            });
        }
        assert_eq!(project.recent_history().len(), CHAT_HISTORY_WINDOW);
        assert_eq!(project.recent_history().first().unwrap().content, "15");
    }

    #[test]
    fn execution_passed_rejects_error_traceback_and_engine_unavailable() {
        assert!(WorkflowState::compute_execution_passed(""));
        assert!(!WorkflowState::compute_execution_passed("Traceback (most recent call last)"));
        assert!(!WorkflowState::compute_execution_passed("NameError: x"));
        assert!(!WorkflowState::compute_execution_passed(ENGINE_UNAVAILABLE_MARKER));
    }

    #[test]
    fn aggregate_rejects_on_linter_failure_even_if_approved() {
        let mut state = WorkflowState::new(ProjectState::new(TaskId::new(), "hi".into()));
        state.linter_passed = false;
        state.functional_status = Some(ReviewStatus::Approve);
        state.aggregate_review();
        assert_eq!(state.review_status, Some(ReviewStatus::Reject));
    }

    #[test]
    fn aggregate_rejects_on_security_vulnerability() {
        let mut state = WorkflowState::new(ProjectState::new(TaskId::new(), "hi".into()));
        state.functional_status = Some(ReviewStatus::Approve);
        state.security_feedback = "VULNERABILITY: eval() on untrusted input".into();
        state.aggregate_review();
        assert_eq!(state.review_status, Some(ReviewStatus::Reject));
    }

    #[test]
    fn aggregate_approves_when_all_clear() {
        let mut state = WorkflowState::new(ProjectState::new(TaskId::new(), "hi".into()));
        state.functional_status = Some(ReviewStatus::Approve);
        state.security_feedback = "no issues found".into();
        state.aggregate_review();
        assert_eq!(state.review_status, Some(ReviewStatus::Approve));
    }
}
