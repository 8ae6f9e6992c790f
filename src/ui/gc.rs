//! `packrat gc`: reclaim content files no surviving history point references.

use anyhow::{Context, Result};
use camino::Utf8Path;
use clap::Args as ClapArgs;

use crate::gc;
use crate::metadata::Metadata;
use crate::repo::Repository;
use crate::ui::nice_size;

#[derive(Debug, ClapArgs)]
pub struct Args {}

pub fn run(repository: &Utf8Path, _args: Args) -> Result<()> {
    let repo = Repository::open(repository)
        .with_context(|| format!("Couldn't open repository at {repository}"))?;
    let md = Metadata::load(&repo).context("Couldn't load repository metadata")?;

    let report = gc::collect(&md, &repo)?;
    println!(
        "{} content files removed ({} reclaimed)",
        report.deleted_count,
        nice_size(report.deleted_bytes)
    );
    Ok(())
}
