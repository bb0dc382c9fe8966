use clap::{Parser, Subcommand};

/// swarmd — an LLM-driven code-generation workflow engine.
#[derive(Debug, Parser)]
#[command(name = "swarmd", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Print version information.
    Version,
}
