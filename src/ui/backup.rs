//! `packrat backup`: run one incremental backup pass against a config file.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Args as ClapArgs;
use tracing::info;

use crate::backup;
use crate::metadata::Metadata;
use crate::repo::Repository;
use crate::search::SearchTree;
use crate::ui::nice_size;

/// Run a backup pass using the given config file.
#[derive(Debug, ClapArgs)]
pub struct Args {
    /// Path to the policy-tree config file (§4.2) describing what to
    /// track, copy, mirror, or ignore.
    config: Utf8PathBuf,
}

pub fn run(repository: &Utf8Path, args: Args) -> Result<()> {
    let repo = Repository::open(repository)
        .with_context(|| format!("Couldn't open repository at {repository}"))?;

    let config_text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("Couldn't read config {}", args.config))?;
    let mut tree = SearchTree::from_config(&config_text)
        .with_context(|| format!("Couldn't parse config {}", args.config))?;

    let mut md = Metadata::load(&repo).context("Couldn't load repository metadata")?;

    info!("Running backup against {}", args.config);
    let report = backup::run(&mut md, &mut tree, &repo)?;

    println!(
        "{} added ({}), {} changed ({}), {} removed",
        report.added,
        nice_size(report.added_bytes),
        report.changed,
        nice_size(report.changed_bytes),
        report.removed,
    );
    println!(
        "{} stored into the repository ({})",
        report.stored,
        nice_size(report.stored_bytes)
    );
    if report.owner_changed > 0 || report.permissions_changed > 0 || report.timestamp_changed > 0 {
        println!(
            "{} owner changes, {} permission changes, {} timestamp-only changes",
            report.owner_changed, report.permissions_changed, report.timestamp_changed
        );
    }
    if report.not_part_of_repository > 0 {
        println!(
            "{} paths excluded from the repository (mirrored-away or out of scope)",
            report.not_part_of_repository
        );
    }

    Ok(())
}
