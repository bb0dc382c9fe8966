//! Shared utility functions for the Gemini adapter.

use swarm_domain::error::Error;

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    Error::Http(e.to_string())
}

/// Redact the `key=` query parameter from a URL before logging it.
pub(crate) fn redact_url_key(url: &str) -> String {
    match url.find("key=") {
        Some(idx) => {
            let (head, tail) = url.split_at(idx);
            let amp = tail.find('&').unwrap_or(tail.len());
            format!("{head}key=***{}", &tail[amp..])
        }
        None => url.to_string(),
    }
}
