//! Command-line front end for the pak builder.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "paktool",
    about = "Builds a pak file and its companion stream files from a build map",
    version
)]
struct Options {
    /// Path to the build map (JSON) describing the pak to build.
    map: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let options = Options::parse();

    let pak_path = rpak::build_from_map_file(&options.map)
        .with_context(|| format!("Failed to build pak from \"{}\"", options.map.display()))?;

    tracing::info!(pak = %pak_path.display(), "build finished");
    Ok(())
}
