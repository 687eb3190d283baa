//! embedvar CLI Library
//!
//! Command-line access to checkpoint bundles written by
//! `embedvar-checkpoint`:
//!
//! - **Inspect**: List every record with its element type and shape
//! - **Verify**: Re-check record checksums and the consistency of each
//!   dumped embedding prefix
//!
//! # Example
//!
//! ```bash
//! embedvar inspect /path/to/ckpt/model
//! embedvar verify /path/to/ckpt/model --prefix item_emb/part_0
//! ```

pub mod commands;

use clap::{Parser, Subcommand};

pub use commands::{InspectCommand, PrefixReport, VerifyCommand, VerifyReport};

/// embedvar - embedding variable checkpoint tools
#[derive(Parser, Debug)]
#[command(name = "embedvar")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the records of a bundle
    Inspect(InspectCommand),

    /// Verify checksums, offsets and row counts of a bundle
    Verify(VerifyCommand),
}

/// Result type alias for CLI operations
pub type CliResult<T> = anyhow::Result<T>;
