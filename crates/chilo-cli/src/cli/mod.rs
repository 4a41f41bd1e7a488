mod inspect_seeds;
mod replay_bitmap;
mod validate_config;

use inspect_seeds::InspectSeeds;
use replay_bitmap::ReplayBitmap;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use validate_config::ValidateConfig;

/// Operator-facing debugging aid for `chilo-mutator`: replay a persisted
/// bitmap, inspect the on-disk seed/mutator artifacts, or validate a config
/// file, all outside of a live AFL++ run.
#[derive(Debug, clap::Parser)]
#[command(version, about, styles = clap::builder::Styles::styled())]
pub struct Cli {
    #[clap(flatten)]
    global_options: GlobalOptions,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        setup_logger(&self.global_options)?;
        match self.command {
            Command::ValidateConfig(cmd) => cmd.run(),
            Command::ReplayBitmap(cmd) => cmd.run(),
            Command::InspectSeeds(cmd) => cmd.run(),
        }
    }
}

#[derive(Debug, clap::Parser)]
struct GlobalOptions {
    #[clap(long, default_value = "info")]
    default_log_level: LevelFilter,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Parse a config file and ensure its directories exist or can be created.
    ValidateConfig(ValidateConfig),
    /// Load a persisted `sum.txt`/`cumulative.txt`/`bool.txt` triple and report
    /// hit count and invariant violations.
    ReplayBitmap(ReplayBitmap),
    /// Walk the annotated-seed and mutator-module directories and summarize
    /// what the pipeline has produced per seed.
    InspectSeeds(InspectSeeds),
}

fn setup_logger(global_opts: &GlobalOptions) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(global_opts.default_log_level.into())
                .from_env()?,
        )
        .try_init()
        .ok();
    Ok(())
}
