use async_trait::async_trait;
use swarm_domain::error::Result;
use swarm_domain::state::Usage;

/// Complexity hint controlling sampling temperature (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Complex,
}

impl Complexity {
    pub fn temperature(self) -> f32 {
        match self {
            Complexity::Complex => 0.2,
            Complexity::Simple => 0.1,
        }
    }
}

/// The key-rotating LLM client contract (C2).
///
/// A single blocking call per invocation; streaming is not part of this
/// engine's contract (§9: the source's streaming paths are not mirrored —
/// every node needs the complete text to run `extract_json`/`parse_tool_call`
/// against).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(
        &self,
        model: &str,
        contents: serde_json::Value,
        system_instruction: Option<&str>,
        complexity: Complexity,
        max_retries: Option<u32>,
    ) -> Result<(String, Usage)>;
}
