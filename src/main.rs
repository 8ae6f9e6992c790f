use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use packrat::error::die;
use packrat::ui;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the repository
    #[arg(short, long)]
    repository: Utf8PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv). Ignored if `RUST_LOG` is
    /// set - that always wins.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Create an empty repository
    Init,
    /// Run a backup pass
    Backup(ui::backup::Args),
    /// Delete unreferenced content from the repository
    Gc(ui::gc::Args),
}

fn main() {
    let args = Args::parse();
    init_logger(args.verbose);

    if let Err(e) = run(args) {
        die(&e);
    }
}

fn run(args: Args) -> Result<()> {
    match args.subcommand {
        Subcommand::Init => ui::init::run(&args.repository),
        Subcommand::Backup(b) => ui::backup::run(&args.repository, b),
        Subcommand::Gc(g) => ui::gc::run(&args.repository, g),
    }
}

/// Set up `tracing-subscriber` to spit messages to stderr. `RUST_LOG`, if
/// set, wins outright; otherwise `-v`/`-vv`/`-vvv` steps the default level
/// up from `warn` through `trace`.
fn init_logger(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();
}
