use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Arguments for a single scan pass.
#[derive(Args, Debug)]
pub(crate) struct ScanArgs {
    /// Instead of masking, dampen the area outside the drawing towards
    /// black, flooring the factor at the given alpha. Nothing is
    /// persisted in this mode.
    #[arg(long, value_name = "ALPHA")]
    pub visualized_alpha: Option<f32>,
}

/// Arguments for regenerating the printable sheets and masks.
#[derive(Args, Debug)]
pub(crate) struct GenerateArgs {
    /// Regenerate only the given command/scene.
    pub command: Option<String>,

    /// Regenerate only the given parameter/actor.
    pub parameter: Option<String>,

    /// Localize for the given language (e.g.: 'de' for German). Use `all`
    /// to localize for all available languages.
    #[arg(long, default_value = "all")]
    pub language: String,

    /// Regenerate all files, even if they are not stale.
    #[arg(long)]
    pub force: bool,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Scan the configured source once and emit the actor artifact.
    Scan(ScanArgs),
    /// Regenerate sheets, masks and books from the vector sources.
    Generate(GenerateArgs),
    /// Rebuild the per-scene listings of scanned actors.
    Reindex,
}

#[derive(Parser)]
#[command(version)]
pub(crate) struct TopLevelArgs {
    /// Configuration file.
    #[arg(long, global = true, default_value = "conf/scanarium.json")]
    pub config: PathBuf,

    /// Additional configuration whose sections take precedence over the
    /// base configuration.
    #[arg(long, global = true, value_name = "FILE")]
    pub config_override: Option<PathBuf>,

    /// Increase verbosity.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub(crate) command: Commands,
}
