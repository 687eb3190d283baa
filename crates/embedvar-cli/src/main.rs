//! embedvar CLI - inspect and verify embedding checkpoint bundles.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use embedvar_cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("embedvar=info".parse()?))
        .init();

    let cli = Cli::parse();
    info!("embedvar starting...");

    match cli.command {
        Commands::Inspect(cmd) => cmd.run()?,
        Commands::Verify(cmd) => cmd.run()?,
    }

    Ok(())
}
