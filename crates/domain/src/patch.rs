//! Disjoint patch types for the Reviewer/SecurityGuard parallel fork (§4.5,
//! §4.6.4, §9).
//!
//! The spec requires field disjointness between concurrent branches to be a
//! *static* property of the graph definition. [`ReviewerPatch`] and
//! [`SecurityPatch`] each expose setters (via their constructor) only for
//! the fields their node is allowed to write; [`WorkflowState::aggregate_review`]
//! then reads both sets. A branch cannot compile code that writes the
//! other's fields, which is a stronger guarantee than a runtime assertion.

use crate::state::{ReviewStatus, Usage, WorkflowState};

/// Everything the functional Reviewer node is allowed to write.
///
/// `usage` is the one exception to field disjointness: both fork branches
/// call the LLM and both need to add to `project.cost_stats`. Since
/// `CostStats::accumulate` is a monotonic, order-independent merge rather
/// than a field overwrite, two concurrent accumulations are safe regardless
/// of which `apply` runs first.
#[derive(Debug, Clone, Default)]
pub struct ReviewerPatch {
    functional_status: ReviewStatus,
    functional_feedback: String,
    review_report: String,
    usage: Usage,
}

impl Default for ReviewStatus {
    fn default() -> Self {
        ReviewStatus::Reject
    }
}

impl ReviewerPatch {
    pub fn new(
        functional_status: ReviewStatus,
        functional_feedback: impl Into<String>,
        review_report: impl Into<String>,
    ) -> Self {
        Self {
            functional_status,
            functional_feedback: functional_feedback.into(),
            review_report: review_report.into(),
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Merge into `state`, touching only `functional_status`,
    /// `functional_feedback`, and `review_report`, plus the shared
    /// monotonic `cost_stats` accumulator.
    pub fn apply(self, state: &mut WorkflowState) {
        state.functional_status = Some(self.functional_status);
        state.functional_feedback = self.functional_feedback;
        state.review_report = self.review_report;
        state.project.cost_stats.accumulate(self.usage, (0.0, 0.0));
    }
}

/// Everything the SecurityGuard node is allowed to write.
#[derive(Debug, Clone, Default)]
pub struct SecurityPatch {
    security_feedback: String,
    usage: Usage,
}

impl SecurityPatch {
    pub fn new(security_feedback: impl Into<String>) -> Self {
        Self { security_feedback: security_feedback.into(), usage: Usage::default() }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Merge into `state`, touching only `security_feedback`, plus the
    /// shared monotonic `cost_stats` accumulator.
    pub fn apply(self, state: &mut WorkflowState) {
        state.security_feedback = self.security_feedback;
        state.project.cost_stats.accumulate(self.usage, (0.0, 0.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProjectState;
    use crate::task::TaskId;

    #[test]
    fn reviewer_patch_touches_only_its_fields() {
        let mut state = WorkflowState::new(ProjectState::new(TaskId::new(), "hi".into()));
        state.security_feedback = "pre-existing".into();
        ReviewerPatch::new(ReviewStatus::Approve, "looks good", "report").apply(&mut state);
        assert_eq!(state.functional_status, Some(ReviewStatus::Approve));
        assert_eq!(state.functional_feedback, "looks good");
        // Untouched by the reviewer branch.
        assert_eq!(state.security_feedback, "pre-existing");
    }

    #[test]
    fn security_patch_touches_only_its_field() {
        let mut state = WorkflowState::new(ProjectState::new(TaskId::new(), "hi".into()));
        state.functional_status = Some(ReviewStatus::Approve);
        SecurityPatch::new("VULNERABILITY: eval()").apply(&mut state);
        assert_eq!(state.security_feedback, "VULNERABILITY: eval()");
        // Untouched by the security branch.
        assert_eq!(state.functional_status, Some(ReviewStatus::Approve));
    }

    #[test]
    fn both_branches_accumulate_into_shared_cost_stats() {
        let mut state = WorkflowState::new(ProjectState::new(TaskId::new(), "hi".into()));
        let usage = Usage { prompt_tokens: 5, completion_tokens: 5, total_tokens: 10 };
        ReviewerPatch::new(ReviewStatus::Approve, "ok", "ok")
            .with_usage(usage)
            .apply(&mut state);
        SecurityPatch::new("no issues found").with_usage(usage).apply(&mut state);
        assert_eq!(state.project.cost_stats.request_count, 2);
        assert_eq!(state.project.cost_stats.input_tokens, 10);
    }
}
