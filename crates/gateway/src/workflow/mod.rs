//! Workflow graph runtime (C5): a declarative directed graph over named
//! nodes with unconditional edges, parallel fan-out, a join, and one
//! conditional edge after the aggregator (§4.5).
//!
//! [`successors`] expresses the unconditional adjacency as data; the two
//! places where the spec calls for something other than "run the single
//! successor" — the Executor's fan-out and the Aggregator's router — are
//! handled explicitly in [`run`]. This mirrors the source's builder-API
//! graph (`add_node`/`add_edge`/`add_conditional_edges`) compiled down to a
//! small driver, per §9's design note.

pub mod nodes;

use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use async_trait::async_trait;
use swarm_domain::state::{ReviewStatus, WorkflowState, MAX_ITERATIONS_PER_STEP};
use swarm_providers::LlmClient;
use swarm_sandbox::Sandbox;

/// External vision collaborator (screenshotting a detected localhost
/// server, §4.6.3). Out of scope in the sense the other external
/// collaborators (§1) are: this crate defines the interface only and never
/// ships a concrete browser-driving implementation. `WorkflowDeps::vision`
/// is `None` unless a caller supplies one.
#[async_trait]
pub trait Vision: Send + Sync {
    async fn capture_screenshot(&self, url: &str) -> Option<String>;
}

/// Everything a node needs beyond the state it patches.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub llm: Arc<dyn LlmClient>,
    pub model: String,
    pub sandbox: Arc<AsyncMutex<Sandbox>>,
    pub vision: Option<Arc<dyn Vision>>,
}

/// The nine stages of the coding-crew state machine (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    Planner,
    Coder,
    Executor,
    Reviewer,
    SecurityGuard,
    Aggregator,
    Reflector,
    StepManager,
    Summarizer,
}

/// Unconditional successor edges. `Executor` is the only fan-out (two
/// concurrent successors joining at `Aggregator`); `Aggregator` has no
/// unconditional successor because its only outgoing edge is conditional
/// (see [`route_after_aggregator`]); `Summarizer` is terminal.
fn successors(id: NodeId) -> &'static [NodeId] {
    use NodeId::*;
    match id {
        Planner => &[Coder],
        Coder => &[Executor],
        Executor => &[Reviewer, SecurityGuard],
        Reviewer | SecurityGuard => &[Aggregator],
        Reflector => &[Coder],
        StepManager => &[Coder],
        Aggregator | Summarizer => &[],
    }
}

/// The conditional edge after the Aggregator join (§4.6.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Reflect,
    NextStep,
    Summarize,
}

pub fn route_after_aggregator(state: &WorkflowState) -> RouteDecision {
    if state.review_status != Some(ReviewStatus::Approve) {
        if state.iteration_count >= MAX_ITERATIONS_PER_STEP {
            RouteDecision::Summarize
        } else {
            RouteDecision::Reflect
        }
    } else if state.current_step_index + 1 < state.plan.len() {
        RouteDecision::NextStep
    } else {
        RouteDecision::Summarize
    }
}

/// Drive `state` from the Planner entry node to the Summarizer terminal,
/// calling `observe` after every node completes so the caller (the task
/// runtime's event bus, C7) can diff the state and emit typed events.
pub async fn run(
    mut state: WorkflowState,
    deps: &WorkflowDeps,
    mut observe: impl FnMut(&WorkflowState),
) -> WorkflowState {
    let mut current = NodeId::Planner;

    loop {
        match current {
            NodeId::Planner => {
                nodes::planner(&mut state, deps).await;
                observe(&state);
            }
            NodeId::Coder => {
                nodes::coder(&mut state, deps).await;
                observe(&state);
            }
            NodeId::Executor => {
                nodes::executor(&mut state, deps).await;
                observe(&state);

                // Parallel fork: both branches observe the same
                // post-executor state; their patches touch disjoint
                // fields (enforced by `ReviewerPatch`/`SecurityPatch`'s
                // type-level setters, §9) and are applied atomically here
                // at the join, before either branch's state is visible to
                // the other.
                let (reviewer_patch, security_patch) = tokio::join!(
                    nodes::reviewer(&state, deps),
                    nodes::security_guard(&state, deps)
                );
                reviewer_patch.apply(&mut state);
                security_patch.apply(&mut state);
                observe(&state);

                current = NodeId::Aggregator;
                continue;
            }
            NodeId::Aggregator => {
                state.aggregate_review();
                observe(&state);
                current = match route_after_aggregator(&state) {
                    RouteDecision::Reflect => NodeId::Reflector,
                    RouteDecision::NextStep => NodeId::StepManager,
                    RouteDecision::Summarize => NodeId::Summarizer,
                };
                continue;
            }
            NodeId::Reflector => {
                nodes::reflector(&mut state, deps).await;
                observe(&state);
            }
            NodeId::StepManager => {
                nodes::step_manager(&mut state);
                observe(&state);
            }
            NodeId::Summarizer => {
                nodes::summarizer(&mut state, deps).await;
                observe(&state);
                break;
            }
            NodeId::Reviewer | NodeId::SecurityGuard => {
                unreachable!("Reviewer/SecurityGuard only run inside the Executor fan-out")
            }
        }

        current = *successors(current)
            .first()
            .expect("non-terminal node has exactly one unconditional successor");
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_domain::state::ProjectState;
    use swarm_domain::task::TaskId;

    fn base_state() -> WorkflowState {
        let mut state = WorkflowState::new(ProjectState::new(TaskId::new(), "hi".into()));
        state.plan = vec!["only step".into()];
        state
    }

    #[test]
    fn router_reflects_on_reject_under_cap() {
        let mut state = base_state();
        state.review_status = Some(ReviewStatus::Reject);
        state.iteration_count = 1;
        assert_eq!(route_after_aggregator(&state), RouteDecision::Reflect);
    }

    #[test]
    fn router_forces_summarize_at_iteration_cap() {
        let mut state = base_state();
        state.review_status = Some(ReviewStatus::Reject);
        state.iteration_count = MAX_ITERATIONS_PER_STEP;
        assert_eq!(route_after_aggregator(&state), RouteDecision::Summarize);
    }

    #[test]
    fn router_advances_step_on_approve_with_more_steps() {
        let mut state = base_state();
        state.plan = vec!["a".into(), "b".into()];
        state.current_step_index = 0;
        state.review_status = Some(ReviewStatus::Approve);
        assert_eq!(route_after_aggregator(&state), RouteDecision::NextStep);
    }

    #[test]
    fn router_summarizes_on_approve_at_last_step() {
        let mut state = base_state();
        state.review_status = Some(ReviewStatus::Approve);
        assert_eq!(route_after_aggregator(&state), RouteDecision::Summarize);
    }

    #[test]
    fn successors_executor_fans_out_to_reviewer_and_security() {
        assert_eq!(
            successors(NodeId::Executor),
            &[NodeId::Reviewer, NodeId::SecurityGuard]
        );
    }

    #[test]
    fn successors_summarizer_is_terminal() {
        assert!(successors(NodeId::Summarizer).is_empty());
    }
}
