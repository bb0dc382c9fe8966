//! Containerised code execution sandbox and its process-wide registry.

pub mod docker;
pub mod registry;

pub use docker::{ImageArtifact, Sandbox};
pub use registry::SandboxRegistry;
