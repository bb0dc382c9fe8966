use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM credentials & model tiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolved provider credentials and model tier selection.
///
/// `gemini_api_keys` is populated by parsing `GEMINI_API_KEYS` (a JSON
/// array, a comma-separated list, or a single bare string — see
/// [`crate::config::parse_api_keys`]), never read directly from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub gemini_api_keys: Vec<String>,
    #[serde(default = "d_model_name")]
    pub gemini_model_name: String,
    #[serde(default)]
    pub gemini_auth_token: Option<String>,
    #[serde(default = "d_base_url")]
    pub base_url: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            gemini_api_keys: Vec::new(),
            gemini_model_name: d_model_name(),
            gemini_auth_token: None,
            base_url: d_base_url(),
        }
    }
}

fn d_model_name() -> String {
    "gemini-2.5-flash".into()
}

fn d_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}

/// Parse the `GEMINI_API_KEYS` env var contract: a JSON array of strings,
/// a comma-separated list, or a single bare key. Blank entries are dropped.
pub fn parse_api_keys(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(trimmed) {
        match parsed {
            serde_json::Value::Array(items) => {
                return items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::trim).map(str::to_string))
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            serde_json::Value::String(s) if !s.trim().is_empty() => {
                return vec![s.trim().to_string()];
            }
            _ => {}
        }
    }

    if trimmed.contains(',') {
        return trimmed
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    vec![trimmed.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_array() {
        let keys = parse_api_keys(r#"["a", "b", ""]"#);
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn parses_comma_list() {
        let keys = parse_api_keys("a, b ,,c");
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn parses_bare_string() {
        let keys = parse_api_keys("single-key");
        assert_eq!(keys, vec!["single-key"]);
    }

    #[test]
    fn parses_json_string() {
        let keys = parse_api_keys(r#""json-string-key""#);
        assert_eq!(keys, vec!["json-string-key"]);
    }

    #[test]
    fn empty_input_yields_empty() {
        assert!(parse_api_keys("").is_empty());
        assert!(parse_api_keys("[]").is_empty());
        assert!(parse_api_keys("   ").is_empty());
    }

    #[test]
    fn default_model_name() {
        assert_eq!(ProvidersConfig::default().gemini_model_name, "gemini-2.5-flash");
    }
}
