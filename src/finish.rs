//! Backup pipeline finalisation (C9b): for every regular-file node
//! initiation flagged as needing repository storage, re-check it hasn't
//! raced out from under us, then hash-dedupe and copy its bytes into the
//! content-addressed repository (§4.5). Initiation ([`crate::backup`])
//! already resolved the hash (or inline content) for every such node; all
//! that's left here is slot assignment and the actual write. One file at
//! a time, no chunking, no concurrency.

use std::io;

use anyhow::{bail, Context, Result};

use crate::backup::Pending;
use crate::error::Failure;
use crate::io_util::{self, StatType};
use crate::metadata::{Metadata, NodeId, PathState};
use crate::repo::{ContentId, Repository};
use crate::report::Report;

/// Store every node in `pending` into `repo`, filling in each state's
/// `slot` field and folding stored counts into `report`.
pub fn finish(md: &mut Metadata, repo: &Repository, pending: Pending, report: &mut Report) -> Result<()> {
    for id in pending {
        finish_one(md, repo, id, report)?;
    }
    Ok(())
}

fn finish_one(md: &mut Metadata, repo: &Repository, id: NodeId, report: &mut Report) -> Result<()> {
    let path = md.get(id).path.clone();
    let (hash, size, mtime) = match &md.get(id).head().state {
        PathState::RegularFile { hash, size, mtime, .. } => (*hash, *size, *mtime),
        other => bail!("finalisation was queued a non-regular-file node: {other:?}"),
    };

    // §4.5 "finalisation re-checks the file hasn't changed since
    // initiation sampled it" - a mismatch in either mtime or size here
    // means something else touched the path mid-run, and the hash
    // initiation already computed no longer matches what's on disk.
    let restat = io_util::lstat(&path).with_context(|| format!("Couldn't re-stat {path}"))?;
    if restat.kind != StatType::Regular || restat.size != size || restat.mtime != mtime {
        bail!(Failure::FilesystemRace(path.to_string()));
    }

    let slot = repo.find_slot(hash, size, &path)?;
    let content_id = ContentId { hash, size, slot };
    if !repo.exists(&content_id) {
        let mut reader = io_util::open_read(&path)?;
        let mut writer = repo.open_writer(content_id)?;
        io::copy(&mut reader, &mut writer)
            .with_context(|| format!("Couldn't copy {path} into the repository"))?;
        writer.close()?;
        report.stored += 1;
        report.stored_bytes += size;
    }

    if let PathState::RegularFile { slot: s, .. } = &mut md.get_mut(id).head_mut().state {
        *s = slot;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::initiate;
    use crate::search::SearchTree;
    use camino::Utf8Path;
    use std::fs;

    fn open_temp_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("repo");
        Repository::init(&root).unwrap();
        let repo = Repository::open(&root).unwrap();
        (dir, repo)
    }

    #[test]
    fn large_file_is_stored_and_slotted() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let src_root = Utf8Path::from_path(src_dir.path()).unwrap();
        let file = src_root.join("big");
        fs::write(&file, vec![0x11u8; 8192])?;

        let (_repo_dir, repo) = open_temp_repo();
        let mut md = Metadata::new();
        let config = format!("[copy]\n{file}\n");
        let mut tree = SearchTree::from_config(&config)?;
        let (mut report, pending) = initiate(&mut md, &mut tree)?;

        assert_eq!(pending.len(), 1);
        finish(&mut md, &repo, pending, &mut report)?;

        assert_eq!(report.stored, 1);
        assert_eq!(report.stored_bytes, 8192);

        let id = md.find(&file).unwrap();
        match &md.get(id).head().state {
            PathState::RegularFile { hash, size, slot, .. } => {
                assert!(repo.exists(&ContentId {
                    hash: *hash,
                    size: *size,
                    slot: *slot,
                }));
            }
            other => panic!("expected RegularFile, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn identical_content_is_deduped_not_restored() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let src_root = Utf8Path::from_path(src_dir.path()).unwrap();
        let a = src_root.join("a");
        let b = src_root.join("b");
        fs::write(&a, vec![0x22u8; 4096])?;
        fs::write(&b, vec![0x22u8; 4096])?;

        let (_repo_dir, repo) = open_temp_repo();
        let mut md = Metadata::new();
        let config = format!("[copy]\n{a}\n{b}\n");
        let mut tree = SearchTree::from_config(&config)?;
        let (mut report, pending) = initiate(&mut md, &mut tree)?;
        assert_eq!(pending.len(), 2);

        finish(&mut md, &repo, pending, &mut report)?;
        assert_eq!(report.stored, 1, "second file should dedupe against the first");

        let id_a = md.find(&a).unwrap();
        let id_b = md.find(&b).unwrap();
        let slot = |id: NodeId| match &md.get(id).head().state {
            PathState::RegularFile { slot, .. } => *slot,
            _ => panic!("expected RegularFile"),
        };
        assert_eq!(slot(id_a), slot(id_b));
        Ok(())
    }

    #[test]
    fn race_during_finalisation_is_detected() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let src_root = Utf8Path::from_path(src_dir.path()).unwrap();
        let file = src_root.join("racy");
        fs::write(&file, vec![0x33u8; 4096])?;

        let (_repo_dir, repo) = open_temp_repo();
        let mut md = Metadata::new();
        let config = format!("[copy]\n{file}\n");
        let mut tree = SearchTree::from_config(&config)?;
        let (mut report, pending) = initiate(&mut md, &mut tree)?;

        fs::write(&file, vec![0x33u8; 10])?;
        let err = finish(&mut md, &repo, pending, &mut report).unwrap_err();
        assert!(err.to_string().contains("changed while it was being backed up"));
        Ok(())
    }
}
