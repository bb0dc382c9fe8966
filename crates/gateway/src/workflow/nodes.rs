//! The nine node implementations (C6), grounded on the coding crew's node
//! methods: plan, write, run, review (functional + security in parallel),
//! aggregate, and either reflect-and-retry, advance-and-retry, or
//! summarize.
//!
//! Prompt text is built inline rather than loaded from template files —
//! template management on disk is an out-of-scope external collaborator
//! (§1), so the prompts themselves are ordinary Rust string formatting.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use swarm_domain::extract::{extract_json, parse_tool_call, ToolCall, ToolParams};
use swarm_domain::patch::{ReviewerPatch, SecurityPatch};
use swarm_domain::state::{
    ChatRole, ChatTurn, ReviewStatus, Usage, WorkflowState, FEEDBACK_TRUNCATION_BYTES,
    FILE_CONTEXT_TRUNCATION_BYTES, WAITING_FOR_CLIENT_MARKER,
};
use swarm_providers::Complexity;

use super::WorkflowDeps;

/// Artifact key for a tool call the client must execute and report back
/// (§4.6.3): when present, the Executor short-circuits the sandbox run.
pub const ARTIFACT_PENDING_TOOL_CALL: &str = "pendingToolCall";
/// Artifact key for screenshots captured off a detected localhost server.
pub const ARTIFACT_IMAGE_ARTIFACTS: &str = "imageArtifacts";
/// Artifact key for the commit message proposed by the Summarizer.
pub const ARTIFACT_COMMIT_PROPOSAL: &str = "commitProposal";

fn localhost_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"http://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d+)").expect("valid regex")
    })
}

/// Whether `code` declares functions or imports, per §4.6's condition for
/// running the pre-flight linter at all (trivial scripts skip it).
fn declares_functions_or_imports(code: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(def\s+\w+|import\s+\w+|from\s+\w+)").expect("valid regex"))
        .is_match(code)
}

fn no_cost(usage: Usage) -> (Usage, (f64, f64)) {
    (usage, (0.0, 0.0))
}

fn user_turn(text: String) -> Value {
    serde_json::json!({"role": "user", "parts": [{"text": text}]})
}

// ---------------------------------------------------------------- Planner

pub async fn planner(state: &mut WorkflowState, deps: &WorkflowDeps) {
    let prompt = format!(
        "You are a senior software architect breaking a request into an \
         ordered implementation plan.\n\n\
         User request:\n{}\n\n\
         Workspace map:\n{}\n\n\
         Return a JSON array of 1 to 6 short, concrete step descriptions. \
         Return only the JSON array, nothing else.",
        state.project.user_input,
        state.project.repo_map.as_deref().unwrap_or("(no workspace map available)"),
    );

    let contents = Value::Array(vec![user_turn(prompt)]);
    let result = deps
        .llm
        .call(
            &deps.model,
            contents,
            Some("You are a senior software architect. Respond with strict JSON only."),
            Complexity::Complex,
            None,
        )
        .await;

    let plan = match result {
        Ok((text, usage)) => {
            let (u, rate) = no_cost(usage);
            state.project.cost_stats.accumulate(u, rate);
            match extract_json(&text) {
                Some(Value::Array(items)) => {
                    let steps: Vec<String> = items
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                    (!steps.is_empty()).then_some(steps)
                }
                _ => None,
            }
        }
        Err(e) => {
            state.project.last_error = Some(e.to_string());
            None
        }
    };

    state.plan = plan.unwrap_or_else(|| vec!["Execute user request directly.".to_string()]);
    state.current_step_index = 0;
    state.iteration_count = 0;
}

// ------------------------------------------------------------------ Coder

fn current_step_description(state: &WorkflowState) -> String {
    match state.plan.get(state.current_step_index) {
        Some(step) => format!(
            "Step {}/{}: {step}",
            state.current_step_index + 1,
            state.plan.len()
        ),
        None => "Execute the user's request.".to_string(),
    }
}

fn file_context_block(state: &WorkflowState) -> String {
    match &state.project.file_context {
        Some(fc) => {
            let content = swarm_domain::state::truncate_with_marker(
                &fc.content,
                FILE_CONTEXT_TRUNCATION_BYTES,
            );
            format!(
                "Filename: {}\nLanguage: {}\n---\n{}",
                fc.filename,
                fc.language_id.as_deref().unwrap_or("plaintext"),
                content
            )
        }
        None => "No file is currently open.".to_string(),
    }
}

fn combined_feedback(state: &WorkflowState) -> String {
    let mut feedback = state.review_feedback.clone();
    if !state.linter_passed {
        feedback = format!(
            "{feedback}\n\n[System] Pre-flight syntax check failed:\n{}",
            state.execution_stderr
        );
    }
    let feedback = match &state.reflection {
        Some(r) if !r.trim().is_empty() => {
            format!("Tech lead's remediation strategy:\n{r}\n\nRaw review feedback:\n{feedback}")
        }
        _ => feedback,
    };
    if feedback.trim().is_empty() {
        "None.".to_string()
    } else {
        feedback
    }
}

fn extract_fenced_code(text: &str) -> Option<String> {
    extract_fenced_with_lang(text, Some("python")).or_else(|| extract_fenced_with_lang(text, None))
}

/// Scan every fenced block in `text`, not just the first one, so a
/// language-tagged block that appears after an earlier mismatched fence is
/// still found (mirrors `extract.rs`'s `try_fenced` fallback chain).
fn extract_fenced_with_lang(text: &str, lang: Option<&str>) -> Option<String> {
    let fence = "```";
    let mut search_from = 0;

    while let Some(rel_start) = text[search_from..].find(fence) {
        let start = search_from + rel_start + fence.len();
        let after = &text[start..];

        let body_start = match lang {
            Some(l) => {
                let trimmed = after.trim_start();
                if !trimmed.to_ascii_lowercase().starts_with(l) {
                    search_from = start;
                    continue;
                }
                start + (after.len() - trimmed.len() + l.len())
            }
            None => start,
        };

        let Some(rel_end) = text[body_start..].find(fence) else {
            return None;
        };
        let code = text[body_start..body_start + rel_end].trim();
        if !code.is_empty() {
            return Some(code.to_string());
        }
        search_from = body_start + rel_end + fence.len();
    }
    None
}

fn tool_call_to_json(call: &ToolCall) -> Value {
    let params = match &call.params {
        ToolParams::WriteToFile { path, content } => {
            serde_json::json!({"path": path, "content": content})
        }
        ToolParams::ApplyDiff { path, search_block, replace_block } => serde_json::json!({
            "path": path,
            "search_block": search_block,
            "replace_block": replace_block,
        }),
        ToolParams::ExecuteCommand { command } => serde_json::json!({"command": command}),
    };
    serde_json::json!({"tool": call.tool, "params": params})
}

const CODER_SYSTEM: &str =
    "You are a pair-programming coding assistant embedded in an editor. \
     Prefer a single MCP tool call (<tool_code>) when a side-effectful \
     action on the user's files or shell is required; otherwise respond \
     with a single fenced code block containing the complete solution.";

pub async fn coder(state: &mut WorkflowState, deps: &WorkflowDeps) {
    let augmented_input = format!(
        "GLOBAL GOAL: {}\n\nCURRENT TASK (focus only on this step):\n{}\n\n\
         Open file:\n{}\n\nPrior feedback:\n{}",
        state.project.user_input,
        current_step_description(state),
        file_context_block(state),
        combined_feedback(state),
    );

    let mut contents: Vec<Value> = state
        .project
        .recent_history()
        .iter()
        .map(|turn| {
            let role = match turn.role {
                ChatRole::User => "user",
                ChatRole::Model => "model",
            };
            serde_json::json!({"role": role, "parts": [{"text": turn.content}]})
        })
        .collect();
    contents.push(user_turn(augmented_input.clone()));

    let result = deps
        .llm
        .call(&deps.model, Value::Array(contents), Some(CODER_SYSTEM), Complexity::Complex, None)
        .await;

    let (response_text, usage) = match result {
        Ok(r) => r,
        Err(e) => {
            state.project.last_error = Some(e.to_string());
            (String::new(), Usage::default())
        }
    };
    let (u, rate) = no_cost(usage);
    state.project.cost_stats.accumulate(u, rate);

    state.project.full_chat_history.push(ChatTurn { role: ChatRole::User, content: augmented_input });
    state
        .project
        .full_chat_history
        .push(ChatTurn { role: ChatRole::Model, content: response_text.clone() });

    match parse_tool_call(&response_text) {
        Some(call) => {
            state.project.code_blocks.insert("coder".to_string(), response_text.clone());
            state
                .project
                .artifacts
                .insert(ARTIFACT_PENDING_TOOL_CALL.to_string(), tool_call_to_json(&call));
            state.generated_code = Some(response_text);
        }
        None => {
            state.project.artifacts.remove(ARTIFACT_PENDING_TOOL_CALL);
            let code = extract_fenced_code(&response_text).unwrap_or(response_text);
            state.project.code_blocks.insert("coder".to_string(), code.clone());
            state.generated_code = Some(code);
        }
    }

    state.iteration_count += 1;
    state.reflection = None;
    state.linter_passed = true;
}

// --------------------------------------------------------------- Executor

pub async fn executor(state: &mut WorkflowState, deps: &WorkflowDeps) {
    if state.project.artifacts.contains_key(ARTIFACT_PENDING_TOOL_CALL) {
        state.execution_stdout = WAITING_FOR_CLIENT_MARKER.to_string();
        state.execution_stderr.clear();
        state.execution_passed = true;
        state.linter_passed = true;
        return;
    }

    let code = state.generated_code.clone().unwrap_or_default();
    if code.trim().is_empty() {
        state.execution_stdout.clear();
        state.execution_stderr = "No code was produced to execute.".to_string();
        state.execution_passed = false;
        return;
    }

    if declares_functions_or_imports(&code) {
        let lint_output = deps.sandbox.lock().await.check_syntax(&code).await;
        if let Some(output) = lint_output {
            state.linter_passed = false;
            state.execution_stdout.clear();
            state.execution_stderr = output;
            state.execution_passed = false;
            return;
        }
    }
    state.linter_passed = true;

    let (stdout, stderr, images) = deps.sandbox.lock().await.execute_code(&code).await;

    state.execution_stdout = stdout;
    state.execution_stderr = stderr.clone();
    state.execution_passed = WorkflowState::compute_execution_passed(&stderr);

    let mut all_images: Vec<Value> = images
        .iter()
        .map(|img| serde_json::json!({"type": img.kind, "filename": img.filename, "data": img.data}))
        .collect();

    if let Some(vision) = &deps.vision {
        let haystack = format!("{}{}", state.execution_stdout, state.execution_stderr);
        if let Some(caps) = localhost_url_re().captures(&haystack) {
            let port = &caps[1];
            let url = format!("http://localhost:{port}");
            if let Some(data) = vision.capture_screenshot(&url).await {
                all_images.push(serde_json::json!({
                    "type": "screenshot",
                    "filename": format!("screenshot_{port}.png"),
                    "data": data,
                }));
            }
        }
    }

    if !all_images.is_empty() {
        state
            .project
            .artifacts
            .insert(ARTIFACT_IMAGE_ARTIFACTS.to_string(), Value::Array(all_images));
    } else {
        state.project.artifacts.remove(ARTIFACT_IMAGE_ARTIFACTS);
    }
}

// --------------------------------------------------------------- Reviewer

pub async fn reviewer(state: &WorkflowState, deps: &WorkflowDeps) -> ReviewerPatch {
    if !state.linter_passed {
        return ReviewerPatch::new(
            ReviewStatus::Reject,
            "Pre-flight syntax check failed; the code does not parse.",
            "",
        );
    }

    let stdout = swarm_domain::state::truncate_with_marker(
        &state.execution_stdout,
        FEEDBACK_TRUNCATION_BYTES,
    );
    let stderr = swarm_domain::state::truncate_with_marker(
        &state.execution_stderr,
        FEEDBACK_TRUNCATION_BYTES,
    );

    let prompt = format!(
        "Role: functional code reviewer.\n\nUser goal: {}\n\nCode:\n{}\n\n\
         Stdout:\n{stdout}\n\nStderr:\n{stderr}\n\n\
         Does the code satisfy the user's goal and run without errors? \
         Return strict JSON: {{\"status\": \"approve\" or \"reject\", \"feedback\": \"...\"}}.",
        state.project.user_input,
        state.generated_code.as_deref().unwrap_or(""),
    );

    let mut turn = user_turn(prompt);
    if let Some(Value::Array(images)) = state.project.artifacts.get(ARTIFACT_IMAGE_ARTIFACTS) {
        if let Some(parts) = turn.get_mut("parts").and_then(|p| p.as_array_mut()) {
            for img in images {
                if let Some(data) = img.get("data").and_then(Value::as_str) {
                    parts.push(serde_json::json!({
                        "inline_data": {"mime_type": "image/png", "data": data}
                    }));
                }
            }
        }
    }

    let contents = Value::Array(vec![turn]);
    match deps
        .llm
        .call(
            &deps.model,
            contents,
            Some("You are a strict functional code reviewer. Respond with JSON only."),
            Complexity::Complex,
            None,
        )
        .await
    {
        Ok((text, usage)) => {
            let patch = match extract_json(&text) {
                Some(v) => {
                    let status = v
                        .get("status")
                        .and_then(Value::as_str)
                        .map(|s| s.eq_ignore_ascii_case("approve"))
                        .unwrap_or(false);
                    let feedback =
                        v.get("feedback").and_then(Value::as_str).unwrap_or("").to_string();
                    let status = if status { ReviewStatus::Approve } else { ReviewStatus::Reject };
                    ReviewerPatch::new(status, feedback.clone(), feedback)
                }
                None => ReviewerPatch::new(
                    ReviewStatus::Reject,
                    format!(
                        "Reviewer JSON Error: model did not return parseable JSON ({})",
                        swarm_domain::state::truncate_with_marker(&text, 200)
                    ),
                    "",
                ),
            };
            patch.with_usage(usage)
        }
        Err(e) => ReviewerPatch::new(ReviewStatus::Reject, format!("Reviewer call failed: {e}"), ""),
    }
}

// ----------------------------------------------------------- SecurityGuard

pub async fn security_guard(state: &WorkflowState, deps: &WorkflowDeps) -> SecurityPatch {
    let code = state.generated_code.as_deref().unwrap_or("");
    if code.trim().is_empty() {
        return SecurityPatch::new("no issues found");
    }

    let prompt = format!(
        "Role: application security reviewer.\n\nCode:\n{code}\n\n\
         Identify command injection, path traversal, SSRF, unsafe deserialization, \
         hard-coded secrets, or other exploitable vulnerabilities. If you find one, \
         your feedback MUST start with the literal word VULNERABILITY followed by a \
         description. If the code is safe, return \"no issues found\".",
    );

    let contents = Value::Array(vec![user_turn(prompt)]);
    match deps
        .llm
        .call(&deps.model, contents, Some("You are a security reviewer."), Complexity::Complex, None)
        .await
    {
        Ok((text, usage)) => SecurityPatch::new(text.trim().to_string()).with_usage(usage),
        Err(e) => SecurityPatch::new(format!("Security review call failed: {e}")),
    }
}

// -------------------------------------------------------------- Reflector

pub async fn reflector(state: &mut WorkflowState, deps: &WorkflowDeps) {
    if state.functional_feedback.contains("Reviewer JSON Error") {
        state.reflection = Some(
            "The reviewer could not parse its own output last time. Keep the code as-is \
             and simply restate the result; the reviewer will be asked to follow the \
             required JSON format more strictly."
                .to_string(),
        );
        return;
    }

    let stderr = swarm_domain::state::truncate_with_marker(
        &state.execution_stderr,
        FEEDBACK_TRUNCATION_BYTES,
    );
    let prompt = format!(
        "Role: tech lead.\n\nUser goal: {}\n\nCurrent code:\n{}\n\nStderr:\n{stderr}\n\n\
         Review feedback:\n{}\n\n\
         Propose a concrete, specific remediation strategy for the next attempt. \
         Do not write full code, just the strategy.",
        state.project.user_input,
        state.generated_code.as_deref().unwrap_or(""),
        state.review_feedback,
    );

    let contents = Value::Array(vec![user_turn(prompt)]);
    match deps.llm.call(&deps.model, contents, None, Complexity::Complex, None).await {
        Ok((text, usage)) => {
            let (u, rate) = no_cost(usage);
            state.project.cost_stats.accumulate(u, rate);
            state.reflection = Some(text);
        }
        Err(e) => {
            state.project.last_error = Some(e.to_string());
            state.reflection = Some(
                "Remediation request failed; retry the same code paying closer attention \
                 to the stated error."
                    .to_string(),
            );
        }
    }
}

// ------------------------------------------------------------- StepManager

pub fn step_manager(state: &mut WorkflowState) {
    state.current_step_index += 1;
    state.iteration_count = 0;
    state.reflection = None;
    state.review_feedback.clear();
    state.linter_passed = true;
}

// -------------------------------------------------------------- Summarizer

pub async fn summarizer(state: &mut WorkflowState, deps: &WorkflowDeps) {
    let prompt = format!(
        "Summarize the outcome of this coding task for the user in a few sentences.\n\n\
         User goal: {}\n\nFinal code:\n{}\n\nExecution output:\n{}",
        state.project.user_input,
        state.generated_code.as_deref().unwrap_or(""),
        state.execution_stdout,
    );
    let contents = Value::Array(vec![user_turn(prompt)]);
    let report = match deps.llm.call(&deps.model, contents, None, Complexity::Simple, None).await {
        Ok((text, usage)) => {
            let (u, rate) = no_cost(usage);
            state.project.cost_stats.accumulate(u, rate);
            text
        }
        Err(e) => {
            state.project.last_error = Some(e.to_string());
            "The task finished, but a summary could not be generated.".to_string()
        }
    };

    state.final_output = Some(report.clone());
    state.project.final_report = Some(report);

    if !state.project.code_blocks.is_empty() {
        let commit_prompt = format!(
            "Write a single one-line Conventional-Commits-style commit message for this \
             change.\n\nUser goal: {}\n\nFinal code:\n{}",
            state.project.user_input,
            state.generated_code.as_deref().unwrap_or(""),
        );
        let contents = Value::Array(vec![user_turn(commit_prompt)]);
        if let Ok((commit_msg, usage)) =
            deps.llm.call(&deps.model, contents, None, Complexity::Simple, None).await
        {
            let (u, rate) = no_cost(usage);
            state.project.cost_stats.accumulate(u, rate);
            let commit_msg = commit_msg.trim().to_string();
            state
                .project
                .artifacts
                .insert(ARTIFACT_COMMIT_PROPOSAL.to_string(), Value::String(commit_msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declares_functions_or_imports_detects_def_and_import() {
        assert!(declares_functions_or_imports("def f():\n    pass\n"));
        assert!(declares_functions_or_imports("import os\nprint(os.getcwd())"));
        assert!(declares_functions_or_imports("from collections import OrderedDict"));
    }

    #[test]
    fn declares_functions_or_imports_false_for_bare_expression() {
        assert!(!declares_functions_or_imports("print(1 + 1)\n"));
    }

    #[test]
    fn extract_fenced_code_prefers_python_tag() {
        let text = "```text\nno\n```\n```python\nprint(1)\n```";
        assert_eq!(extract_fenced_code(text), Some("print(1)".to_string()));
    }

    #[test]
    fn extract_fenced_code_falls_back_to_any_fence() {
        let text = "```\nprint(1)\n```";
        assert_eq!(extract_fenced_code(text), Some("print(1)".to_string()));
    }

    #[test]
    fn extract_fenced_code_returns_none_without_fence() {
        assert_eq!(extract_fenced_code("just talking, no code here"), None);
    }

    #[test]
    fn tool_call_to_json_shapes_write_to_file() {
        let call = ToolCall {
            tool: "write_to_file".to_string(),
            params: ToolParams::WriteToFile {
                path: "a.py".to_string(),
                content: "x = 1".to_string(),
            },
        };
        let v = tool_call_to_json(&call);
        assert_eq!(v["tool"], "write_to_file");
        assert_eq!(v["params"]["path"], "a.py");
    }

    #[test]
    fn current_step_description_falls_back_without_plan() {
        let state = WorkflowState::new(swarm_domain::state::ProjectState::new(
            swarm_domain::task::TaskId::new(),
            "hi".into(),
        ));
        assert_eq!(current_step_description(&state), "Execute the user's request.");
    }
}
