//! Garbage collection (C10): reclaim content files no surviving history
//! point references. Compute the live set from metadata, walk the
//! repository's on-disk objects, delete what's unreferenced. No repack
//! step - this collector only ever deletes whole content files, it never
//! rewrites or compacts anything.

use anyhow::Result;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::metadata::{BackupHint, Metadata, PathState};
use crate::repo::{ContentId, Repository};
use crate::report::GcReport;

/// Every `(hash, size, slot)` still referenced by some history point in
/// `md`. Inline states (`size <= 20`) reference nothing on disk (§3, §4.5)
/// and are skipped entirely - their hash field is never treated as
/// content to preserve.
fn live_set(md: &Metadata) -> FxHashSet<ContentId> {
    let mut live = FxHashSet::default();
    for id in md.walk() {
        let node = md.get(id);
        if node.hint.contains(BackupHint::NOT_PART_OF_REPOSITORY) {
            continue;
        }
        for point in &node.history {
            if let PathState::RegularFile { size, hash, slot, .. } = &point.state {
                if *size > 20 {
                    live.insert(ContentId {
                        hash: *hash,
                        size: *size,
                        slot: *slot,
                    });
                }
            }
        }
    }
    live
}

/// Delete every on-disk content file not in `md`'s live set (§4.7).
pub fn collect(md: &Metadata, repo: &Repository) -> Result<GcReport> {
    let live = live_set(md);
    let mut report = GcReport::default();

    for id in repo.list_content()? {
        if live.contains(&id) {
            continue;
        }
        let freed = repo.remove_content(&id)?;
        debug!("removed unreferenced content {}", id.filename());
        report.deleted_count += 1;
        report.deleted_bytes += freed;
    }

    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::{initiate, run};
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
    fn unreferenced_content_is_deleted() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let src_root = Utf8Path::from_path(src_dir.path()).unwrap();
        let file = src_root.join("big");
        fs::write(&file, vec![0xaa; 8192])?;

        let (_repo_dir, repo) = open_temp_repo();
        let mut md = Metadata::new();
        let config = format!("[copy]\n{file}\n");
        let mut tree = SearchTree::from_config(&config)?;
        run(&mut md, &mut tree, &repo)?;

        assert_eq!(repo.list_content()?.len(), 1);

        fs::remove_file(&file)?;
        let mut md2 = Metadata::load(&repo)?;
        let mut tree2 = SearchTree::from_config(&config)?;
        run(&mut md2, &mut tree2, &repo)?;

        let report = collect(&md2, &repo)?;
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.deleted_bytes, 8192);
        assert!(repo.list_content()?.is_empty());
        Ok(())
    }

    #[test]
    fn referenced_content_survives() -> Result<()> {
        let src_dir = tempfile::tempdir()?;
        let src_root = Utf8Path::from_path(src_dir.path()).unwrap();
        let file = src_root.join("kept");
        fs::write(&file, vec![0xbb; 4096])?;

        let (_repo_dir, repo) = open_temp_repo();
        let mut md = Metadata::new();
        let config = format!("[copy]\n{file}\n");
        let mut tree = SearchTree::from_config(&config)?;
        let (mut report, pending) = initiate(&mut md, &mut tree)?;
        crate::finish::finish(&mut md, &repo, pending, &mut report)?;

        let gc_report = collect(&md, &repo)?;
        assert_eq!(gc_report.deleted_count, 0);
        assert_eq!(repo.list_content()?.len(), 1);
        Ok(())
    }

    #[test]
    fn inline_content_is_never_referenced_on_disk() {
        let mut md = Metadata::new();
        md.insert_new(
            camino::Utf8PathBuf::from("/tiny"),
            crate::metadata::BackupPolicy::Copy,
            None,
            PathState::RegularFile {
                uid: 0,
                gid: 0,
                mode: 0o644,
                mtime: 0,
                size: 3,
                hash: crate::hashing::Hash20([b'h', b'i', b'!', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
                slot: 0,
            },
        );
        assert!(live_set(&md).is_empty());
    }
}
