//! `packrat init`: lay down an empty repository.

use anyhow::Result;
use camino::Utf8Path;

use crate::repo::Repository;

pub fn run(repository: &Utf8Path) -> Result<()> {
    Repository::init(repository)?;
    println!("Initialized empty repository at {repository}");
    Ok(())
}
