//! Backup pipeline initiation (C9a): diff a live filesystem walk against
//! the last completed backup's metadata, deciding per-path hints without
//! touching the repository yet (§4.4). Finalisation (hashing, dedup, and
//! the actual repository writes) is [`crate::finish`].
//!
//! Mirrors `walk.rs`'s own explicit frame stack rather than native
//! recursion, so a deeply nested tree can't blow the call stack.

use anyhow::{bail, Result};
use camino::Utf8Path;
use rustc_hash::FxHashSet;

use crate::error::Failure;
use crate::hashing;
use crate::io_util::{self, Stat, StatType};
use crate::metadata::{
    BackupHint, BackupPolicy, BackupRef, Metadata, NodeId, PathHistoryPoint, PathState,
    PathStateType,
};
use crate::repo::Repository;
use crate::report::Report;
use crate::search::{SearchNodeId, SearchTree};
use crate::walk::{self, Event};

/// Run initiation, finalisation, and the metadata write in sequence - the
/// single entry point the CLI's `backup` subcommand calls (§4.4-§4.6).
pub fn run(md: &mut Metadata, tree: &mut SearchTree, repo: &Repository) -> Result<Report> {
    let (mut report, pending) = initiate(md, tree)?;
    crate::finish::finish(md, repo, pending, &mut report)?;

    if md.current_backup.ref_count > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        md.current_backup.completion_time = now;
    }

    md.write(repo)?;
    Ok(report)
}

/// Regular-file nodes whose content (> 20 bytes) still needs hashing,
/// deduping, and copying into the repository - [`crate::finish`]'s work
/// list.
pub type Pending = Vec<NodeId>;

struct Frame {
    /// The metadata node this directory's children live under; `None` at
    /// the root level (children live in [`Metadata::roots`]).
    dir_node: Option<NodeId>,
    /// The search node this directory corresponds to - used to classify
    /// orphaned subnodes (§4.4 step 4). `None` when this directory wasn't
    /// matched by any search subnode itself.
    search_node: Option<SearchNodeId>,
    /// Metadata children actually observed (visited) this run.
    visited: FxHashSet<NodeId>,
}

/// Walk the live filesystem via `tree`, updating `md` in place: new paths
/// are inserted, existing paths are compared against their last known
/// state, and paths no longer found are marked removed or excluded from
/// the repository (§4.4). Returns a tally for reporting, plus the list of
/// regular-file nodes [`crate::finish::finish`] still needs to process.
pub fn initiate(md: &mut Metadata, tree: &mut SearchTree) -> Result<(Report, Pending)> {
    // Hints describe what happened during the run that's about to start;
    // whatever a prior run left behind is stale as of now.
    for node in &mut md.nodes {
        node.hint = BackupHint::empty();
    }

    let mut report = Report::default();
    let mut pending = Vec::new();
    let mut stack = vec![Frame {
        dir_node: None,
        search_node: Some(tree.root),
        visited: FxHashSet::default(),
    }];

    let mut iter = walk::walk(tree)?;
    loop {
        match iter.next_event()? {
            Event::Entry(record) => {
                let (dir_node, search_node_for_child) = {
                    let frame = stack.last().expect("frame stack is never empty mid-walk");
                    (frame.dir_node, record.node)
                };
                let id = resolve_node(
                    md,
                    dir_node,
                    &record.path,
                    record.policy,
                    &record.stat,
                    &mut report,
                    &mut pending,
                )?;
                stack
                    .last_mut()
                    .expect("frame stack is never empty mid-walk")
                    .visited
                    .insert(id);

                if record.stat.kind == StatType::Directory {
                    stack.push(Frame {
                        dir_node: Some(id),
                        search_node: search_node_for_child,
                        visited: FxHashSet::default(),
                    });
                }
            }
            Event::EndOfDirectory => {
                let frame = stack.pop().expect("EndOfDirectory without a matching frame");
                handle_not_found_subnodes(md, tree, &frame, &mut report);
                if let Some(id) = frame.dir_node {
                    maybe_exclude_empty_none_policy_node(md, id);
                }
            }
            Event::EndOfSearch => break,
        }
    }

    Ok((report, pending))
}

fn resolve_node(
    md: &mut Metadata,
    parent: Option<NodeId>,
    path: &Utf8Path,
    policy: BackupPolicy,
    stat: &Stat,
    report: &mut Report,
    pending: &mut Pending,
) -> Result<NodeId> {
    match md.find(path) {
        None => {
            let state = build_state(path, stat)?;
            // Directories materialised only because a selector needed to
            // traverse through them on the way to a real match (§6.4 "new
            // items") don't themselves count as added - only the entries
            // the search tree actually selected do.
            let is_directory = matches!(state, PathState::Directory { .. });
            if let PathState::RegularFile { size, .. } = &state {
                report.added_bytes += size;
            }
            let id = md.insert_new(path.to_owned(), policy, parent, state);
            if !is_directory {
                report.added += 1;
            }
            if let PathState::RegularFile { size, .. } = &md.get(id).head().state {
                if *size > 20 {
                    pending.push(id);
                }
            }
            Ok(id)
        }
        Some(id) => {
            compare_and_update(md, id, path, policy, stat, report, pending)?;
            Ok(id)
        }
    }
}

/// Build a brand-new [`PathState`] from a freshly lstat'd entry (§4.4
/// step 1, and the type-transition case of step "state comparison").
fn build_state(path: &Utf8Path, stat: &Stat) -> Result<PathState> {
    Ok(match stat.kind {
        StatType::Regular => {
            let hash = hashing::probe(path, stat.size)?;
            PathState::RegularFile {
                uid: stat.uid,
                gid: stat.gid,
                mode: stat.mode,
                mtime: stat.mtime,
                size: stat.size,
                hash,
                slot: 0,
            }
        }
        StatType::Symlink => {
            let target = io_util::read_link(path)?;
            if target.as_str().len() as u64 != stat.size {
                bail!(Failure::FilesystemRace(path.to_string()));
            }
            PathState::Symlink {
                uid: stat.uid,
                gid: stat.gid,
                target,
            }
        }
        StatType::Directory => PathState::Directory {
            uid: stat.uid,
            gid: stat.gid,
            mode: stat.mode,
            mtime: stat.mtime,
        },
        StatType::Other => PathState::Other {
            uid: stat.uid,
            gid: stat.gid,
        },
    })
}

fn path_type(kind: StatType) -> PathStateType {
    match kind {
        StatType::Regular => PathStateType::RegularFile,
        StatType::Symlink => PathStateType::Symlink,
        StatType::Directory => PathStateType::Directory,
        StatType::Other => PathStateType::Other,
    }
}

/// The named type-transition code for `old -> new`, or an empty hint if
/// this pair has no dedicated bit (§3 names nine of the twelve possible
/// off-diagonal pairs; the rest still get `CONTENT_CHANGED` from the
/// caller, just no dedicated bit).
fn transition_flag(old: PathStateType, new: PathStateType) -> BackupHint {
    use PathStateType::*;
    match (old, new) {
        (RegularFile, Symlink) => BackupHint::REGULAR_TO_SYMLINK,
        (RegularFile, Directory) => BackupHint::REGULAR_TO_DIRECTORY,
        (RegularFile, Other) => BackupHint::REGULAR_TO_OTHER,
        (Symlink, RegularFile) => BackupHint::SYMLINK_TO_REGULAR,
        (Symlink, Directory) => BackupHint::SYMLINK_TO_DIRECTORY,
        (Symlink, Other) => BackupHint::SYMLINK_TO_OTHER,
        (Directory, RegularFile) => BackupHint::DIRECTORY_TO_REGULAR,
        (Directory, Symlink) => BackupHint::DIRECTORY_TO_SYMLINK,
        (Other, Directory) => BackupHint::OTHER_TO_DIRECTORY,
        _ => BackupHint::empty(),
    }
}

/// State comparison for a node that still exists (§4.4 "State comparison
/// for nodes that still exist").
fn compare_and_update(
    md: &mut Metadata,
    id: NodeId,
    path: &Utf8Path,
    new_policy: BackupPolicy,
    stat: &Stat,
    report: &mut Report,
    pending: &mut Pending,
) -> Result<()> {
    let old_state = md.get(id).head().state.clone();
    let old_type = old_state.state_type();
    let new_type = path_type(stat.kind);

    let mut hint;
    let new_state;

    if old_type != new_type {
        new_state = build_state(path, stat)?;
        hint = transition_flag(old_type, new_type) | BackupHint::CONTENT_CHANGED | BackupHint::LOSES_HISTORY;
    } else {
        match (&old_state, stat.kind) {
            (
                PathState::RegularFile {
                    uid,
                    gid,
                    mode,
                    mtime,
                    size,
                    hash,
                    ..
                },
                StatType::Regular,
            ) => {
                let mut h = BackupHint::empty();
                if *uid != stat.uid || *gid != stat.gid {
                    h |= BackupHint::OWNER_CHANGED;
                }
                if *mode != stat.mode {
                    h |= BackupHint::PERMISSIONS_CHANGED;
                }
                if *mtime != stat.mtime {
                    h |= BackupHint::TIMESTAMP_CHANGED;
                }
                let mut new_hash = *hash;
                if *size != stat.size {
                    h |= BackupHint::CONTENT_CHANGED;
                    new_hash = hashing::probe(path, stat.size)?;
                } else if h.contains(BackupHint::TIMESTAMP_CHANGED) && stat.size > 0 {
                    let probed = hashing::probe(path, stat.size)?;
                    let width = (*size).min(20) as usize;
                    if hash.as_bytes()[..width] != probed.as_bytes()[..width] {
                        h |= BackupHint::CONTENT_CHANGED | BackupHint::FRESH_HASH;
                        new_hash = probed;
                    }
                }
                hint = h;
                new_state = PathState::RegularFile {
                    uid: stat.uid,
                    gid: stat.gid,
                    mode: stat.mode,
                    mtime: stat.mtime,
                    size: stat.size,
                    hash: new_hash,
                    slot: 0,
                };
            }
            (PathState::Symlink { uid, gid, target }, StatType::Symlink) => {
                let new_target = io_util::read_link(path)?;
                if new_target.as_str().len() as u64 != stat.size {
                    bail!(Failure::FilesystemRace(path.to_string()));
                }
                let mut h = BackupHint::empty();
                if *uid != stat.uid || *gid != stat.gid {
                    h |= BackupHint::OWNER_CHANGED;
                }
                if *target != new_target {
                    h |= BackupHint::CONTENT_CHANGED;
                }
                hint = h;
                new_state = PathState::Symlink {
                    uid: stat.uid,
                    gid: stat.gid,
                    target: new_target,
                };
            }
            (
                PathState::Directory { mode, mtime, .. },
                StatType::Directory,
            ) => {
                let mut h = BackupHint::empty();
                if *mode != stat.mode {
                    h |= BackupHint::PERMISSIONS_CHANGED;
                }
                if *mtime != stat.mtime {
                    h |= BackupHint::TIMESTAMP_CHANGED;
                }
                hint = h;
                new_state = PathState::Directory {
                    uid: stat.uid,
                    gid: stat.gid,
                    mode: stat.mode,
                    mtime: stat.mtime,
                };
            }
            (PathState::Other { .. }, StatType::Other) => {
                hint = BackupHint::empty();
                new_state = PathState::Other {
                    uid: stat.uid,
                    gid: stat.gid,
                };
            }
            _ => unreachable!("old_type == new_type was already checked above"),
        }
    }

    if md.get(id).policy != new_policy {
        hint |= BackupHint::POLICY_CHANGED;
        md.get_mut(id).policy = new_policy;
    }

    if hint.contains(BackupHint::OWNER_CHANGED) {
        report.owner_changed += 1;
    }
    if hint.contains(BackupHint::PERMISSIONS_CHANGED) {
        report.permissions_changed += 1;
    }
    if hint.contains(BackupHint::TIMESTAMP_CHANGED) {
        report.timestamp_changed += 1;
    }

    let size_if_regular = match &new_state {
        PathState::RegularFile { size, .. } => Some(*size),
        _ => None,
    };

    if hint.is_empty() {
        md.rebind_to_current(id);
    } else {
        md.get_mut(id).hint |= hint;
        if hint.contains(BackupHint::CONTENT_CHANGED) {
            report.changed += 1;
            if let Some(size) = size_if_regular {
                report.changed_bytes += size;
            }
        }
        apply_new_state(md, id, new_state);
        if let Some(size) = size_if_regular {
            if size > 20 && hint.contains(BackupHint::CONTENT_CHANGED) {
                pending.push(id);
            }
        }
    }

    Ok(())
}

/// Move a node's head forward: for `track`, a brand-new point is pushed
/// so the prior observed state survives in history; for every other
/// policy, the single point is overwritten and rebound in place (§3:
/// "copy: no history beyond current", "mirror: store latest").
fn apply_new_state(md: &mut Metadata, id: NodeId, new_state: PathState) {
    if md.get(id).policy == BackupPolicy::Track {
        md.get_mut(id).history.insert(
            0,
            PathHistoryPoint {
                backup: BackupRef::Current,
                state: new_state,
            },
        );
        md.current_backup.ref_count += 1;
    } else {
        let point = md.get_mut(id).head_mut();
        let old_backup = point.backup;
        point.state = new_state;
        point.backup = BackupRef::Current;
        if let BackupRef::Historical(idx) = old_backup {
            md.backup_history[idx].ref_count -= 1;
            md.current_backup.ref_count += 1;
        }
    }
}

/// A node's reference is being dropped from the written tree entirely
/// (§4.4 step 5, and the `mirror` branch of step 4): decrement whatever
/// backup its head currently counts against, so the write-time refcount
/// invariant (§8) stays correct even though the node itself is excluded.
fn exclude_from_repository(md: &mut Metadata, id: NodeId) {
    match md.get(id).head().backup {
        BackupRef::Current => md.current_backup.ref_count -= 1,
        BackupRef::Historical(idx) => md.backup_history[idx].ref_count -= 1,
    }
    md.get_mut(id).hint |= BackupHint::NOT_PART_OF_REPOSITORY;
}

fn mark_removed(md: &mut Metadata, id: NodeId, report: &mut Report) {
    md.get_mut(id).hint |= BackupHint::REMOVED;
    report.removed += 1;
    if matches!(md.get(id).head().state, PathState::NonExisting) {
        md.rebind_to_current(id);
    } else {
        apply_new_state(md, id, PathState::NonExisting);
    }
}

/// §4.4 step 4: for every metadata child of this directory the walk
/// didn't revisit, decide whether it was genuinely selected-then-removed
/// (`removed`) or simply fell out of scope (`not_part_of_repository`).
fn handle_not_found_subnodes(md: &mut Metadata, tree: &SearchTree, frame: &Frame, report: &mut Report) {
    let children = match frame.dir_node {
        Some(id) => md.get(id).children.clone(),
        None => md.roots.clone(),
    };

    for child in children {
        if frame.visited.contains(&child) {
            continue;
        }

        let basename = md
            .get(child)
            .path
            .file_name()
            .unwrap_or(md.get(child).path.as_str())
            .to_owned();
        let matched = frame
            .search_node
            .and_then(|sn| tree.get(sn).children.iter().copied().find(|&cid| tree.get(cid).matches(&basename)));

        match matched {
            Some(sn_id) if tree.get(sn_id).policy == BackupPolicy::Mirror => {
                exclude_from_repository(md, child);
                report.not_part_of_repository += 1;
            }
            Some(_) => mark_removed(md, child, report),
            None => {
                // No subnode explicitly matched this child - it either
                // fell under a recursive, subnode-less policy region
                // (mirror/copy/track inherited straight down) or out of
                // scope entirely (none, or caught by an ignore rule).
                let fallback_policy = frame.dir_node.map(|id| md.get(id).policy).unwrap_or(BackupPolicy::None);
                let path_str = md.get(child).path.to_string();
                let ignored = tree.ignore.iter().any(|rule| rule.regex.is_match(&path_str));
                if fallback_policy == BackupPolicy::None || fallback_policy == BackupPolicy::Mirror || ignored {
                    exclude_from_repository(md, child);
                    report.not_part_of_repository += 1;
                } else {
                    mark_removed(md, child, report);
                }
            }
        }
    }
}

/// §4.4 step 5: a `none`-policy node whose every surviving child ended up
/// excluded carries no information of its own, so it's excluded too.
fn maybe_exclude_empty_none_policy_node(md: &mut Metadata, id: NodeId) {
    if md.get(id).policy != BackupPolicy::None || md.get(id).hint.contains(BackupHint::NOT_PART_OF_REPOSITORY) {
        return;
    }
    let all_excluded = md
        .get(id)
        .children
        .iter()
        .all(|&c| md.get(c).hint.contains(BackupHint::NOT_PART_OF_REPOSITORY));
    if all_excluded {
        exclude_from_repository(md, id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::search::from_config;
    use std::fs;

    fn run_initiate(md: &mut Metadata, config: &str) -> Result<(Report, Pending)> {
        let mut tree = from_config(config)?;
        initiate(md, &mut tree)
    }

    #[test]
    fn small_file_is_added_with_inline_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("a"), b"hello")?;

        let mut md = Metadata::new();
        let config = format!("[copy]\n{}\n", root.join("a"));
        let (report, pending) = run_initiate(&mut md, &config)?;

        assert_eq!(report.added, 1);
        assert!(pending.is_empty(), "inline files need no finalisation work");

        let id = md.find(&root.join("a")).unwrap();
        assert!(md.get(id).hint.contains(BackupHint::ADDED));
        match &md.get(id).head().state {
            PathState::RegularFile { size, hash, .. } => {
                assert_eq!(*size, 5);
                assert_eq!(&hash.as_bytes()[..5], b"hello");
            }
            other => panic!("expected RegularFile, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn large_file_is_queued_for_finalisation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("big"), vec![0x42u8; 4096])?;

        let mut md = Metadata::new();
        let config = format!("[copy]\n{}\n", root.join("big"));
        let (report, pending) = run_initiate(&mut md, &config)?;

        assert_eq!(report.added, 1);
        assert_eq!(pending.len(), 1);
        Ok(())
    }

    #[test]
    fn mirror_removal_excludes_the_node() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        let file = root.join("cached");
        fs::write(&file, b"x")?;

        let mut md = Metadata::new();
        let config = format!("[mirror]\n{file}\n");
        run_initiate(&mut md, &config)?;

        fs::remove_file(&file)?;
        let (report, _pending) = run_initiate(&mut md, &config)?;

        let id = md.find(&file).unwrap();
        assert!(md.get(id).hint.contains(BackupHint::NOT_PART_OF_REPOSITORY));
        assert_eq!(report.not_part_of_repository, 1);
        Ok(())
    }

    #[test]
    fn copy_removal_keeps_a_non_existing_point() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        let file = root.join("kept-history");
        fs::write(&file, b"x")?;

        let mut md = Metadata::new();
        let config = format!("[copy]\n{file}\n");
        run_initiate(&mut md, &config)?;

        fs::remove_file(&file)?;
        let (report, _pending) = run_initiate(&mut md, &config)?;

        let id = md.find(&file).unwrap();
        assert!(md.get(id).hint.contains(BackupHint::REMOVED));
        assert!(!md.get(id).hint.contains(BackupHint::NOT_PART_OF_REPOSITORY));
        assert!(matches!(md.get(id).head().state, PathState::NonExisting));
        assert_eq!(report.removed, 1);
        Ok(())
    }

    #[test]
    fn unchanged_file_produces_no_hint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        let file = root.join("steady");
        fs::write(&file, b"same")?;

        let mut md = Metadata::new();
        let config = format!("[copy]\n{file}\n");
        run_initiate(&mut md, &config)?;

        let (report, _pending) = run_initiate(&mut md, &config)?;
        assert_eq!(report.added, 0);
        assert_eq!(report.changed, 0);
        let id = md.find(&file).unwrap();
        assert!(md.get(id).hint.is_empty());
        Ok(())
    }
}
