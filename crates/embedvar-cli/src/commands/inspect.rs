//! Inspect Command Implementation
//!
//! Lists the records of a checkpoint bundle without reading payloads.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use embedvar_checkpoint::BundleReader;
use tracing::info;

/// List the records of a bundle
///
/// # Example
///
/// ```bash
/// embedvar inspect /path/to/ckpt/model --json
/// ```
#[derive(Args, Debug, Clone)]
pub struct InspectCommand {
    /// Bundle base path (without the `.index` / `.data` suffix)
    #[arg(env = "EMBEDVAR_BUNDLE")]
    pub bundle: PathBuf,

    /// Print the raw index as JSON
    #[arg(long)]
    pub json: bool,
}

impl InspectCommand {
    /// Execute the inspect command
    pub fn run(&self) -> Result<()> {
        info!("Inspecting bundle {:?}", self.bundle);
        print!("{}", self.render()?);
        Ok(())
    }

    /// Renders the listing that [`run`](Self::run) prints.
    pub fn render(&self) -> Result<String> {
        let reader = BundleReader::open(&self.bundle)
            .with_context(|| format!("Failed to open bundle {:?}", self.bundle))?;
        let index = reader.index();

        if self.json {
            let mut json = serde_json::to_string_pretty(index).context("Failed to encode index")?;
            json.push('\n');
            return Ok(json);
        }

        let width = index.records.keys().map(String::len).max().unwrap_or(0).max("record".len());
        let mut out = String::new();
        writeln!(out, "{:<width$}  {:<8}  {:<16}  bytes", "record", "dtype", "shape")?;
        for (name, entry) in &index.records {
            writeln!(
                out,
                "{name:<width$}  {:<8}  {:<16}  {}",
                entry.kind.to_string(),
                format!("{:?}", entry.shape),
                entry.length
            )?;
        }
        writeln!(
            out,
            "{} records, format version {}",
            index.records.len(),
            index.format_version
        )?;
        Ok(out)
    }
}
