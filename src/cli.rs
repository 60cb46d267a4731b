/// Command line interface definitions
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Sandbox broker for supervising untrusted processes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command as a sandboxed target and wait for it to finish
    Run {
        /// JSON policy configuration file
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Memory limit in MB
        #[arg(long)]
        mem: Option<u64>,
        /// Maximum number of processes in the container
        #[arg(long)]
        processes: Option<u32>,
        /// Confinement level: lockdown, restricted, limited, interactive or
        /// unprotected
        #[arg(long)]
        level: Option<String>,
        /// Fail hard if container support is unavailable
        #[arg(long)]
        strict: bool,
        /// Command and arguments to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Report container support on this host
    Info,
}
