//! The on-disk binary format for [`Metadata`] (C6, §6.1): a flat,
//! little-endian byte stream, hand-rolled rather than run through serde,
//! because the exact byte grammar (fixed field order, no self
//! description, renumbered backup ids) is part of the crash-safety
//! contract, not an implementation detail a generic codec should own.
//!
//! Every multi-byte integer is written and read via `to_le_bytes`/
//! `from_le_bytes`, which is correct on both little- and big-endian hosts
//! without any runtime endianness detection.

use anyhow::{bail, Result};
use camino::Utf8PathBuf;

use crate::error::Failure;
use crate::hashing::Hash20;
use crate::metadata::{
    Backup, BackupPolicy, BackupRef, Metadata, NodeId, PathHistory, PathHistoryPoint, PathNode,
    PathState, PathStateType,
};

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn len_prefixed(&mut self, v: &[u8]) {
        self.u64(v.len() as u64);
        self.bytes(v);
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            bail!(Failure::CorruptMetadata(format!(
                "expected {n} more bytes at offset {}, found {}",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn len_prefixed(&mut self) -> Result<Vec<u8>> {
        let len: usize = self
            .u64()?
            .try_into()
            .map_err(|_| Failure::Overflow("length prefix doesn't fit in memory".into()))?;
        Ok(self.take(len)?.to_vec())
    }

    fn at_eof(&self) -> bool {
        self.pos == self.buf.len()
    }
}

/// Renumbers backups with `ref_count == 0` out of existence, assigning
/// dense ids to survivors. The current backup (if referenced) is appended
/// last, taking the id one past the highest surviving historical id
/// (§3 "During write... surviving ids are renumbered densely").
struct Renumbering {
    /// old historical index -> new dense id
    historical: Vec<Option<u64>>,
    surviving_completion_times: Vec<i64>,
    current_id: Option<u64>,
}

fn plan_renumbering(md: &Metadata) -> Renumbering {
    let mut historical = Vec::with_capacity(md.backup_history.len());
    let mut surviving_completion_times = Vec::new();
    for b in &md.backup_history {
        if b.ref_count > 0 {
            historical.push(Some(surviving_completion_times.len() as u64));
            surviving_completion_times.push(b.completion_time);
        } else {
            historical.push(None);
        }
    }
    let current_id = if md.current_backup.ref_count > 0 {
        Some(surviving_completion_times.len() as u64)
    } else {
        None
    };
    Renumbering {
        historical,
        surviving_completion_times,
        current_id,
    }
}

fn encode_backup_ref(r: &Renumbering, backup: &BackupRef) -> u64 {
    match backup {
        BackupRef::Current => r
            .current_id
            .expect("a history point referenced Current with current_backup.ref_count == 0"),
        BackupRef::Historical(old_idx) => r.historical[*old_idx]
            .expect("a history point referenced a historical backup with ref_count == 0"),
    }
}

fn encode_state(w: &mut ByteWriter, state: &PathState) {
    w.u8(state.state_type().to_tag());
    match state {
        PathState::NonExisting => {}
        PathState::RegularFile {
            uid,
            gid,
            mode,
            mtime,
            size,
            hash,
            slot,
        } => {
            w.u32(*uid);
            w.u32(*gid);
            w.u32(*mode);
            w.i64(*mtime);
            w.u64(*size);
            if *size > 20 {
                w.bytes(hash.as_bytes());
                w.u8(*slot);
            } else if *size > 0 {
                w.bytes(&hash.as_bytes()[..*size as usize]);
            }
        }
        PathState::Symlink { uid, gid, target } => {
            w.u32(*uid);
            w.u32(*gid);
            w.len_prefixed(target.as_str().as_bytes());
        }
        PathState::Directory {
            uid,
            gid,
            mode,
            mtime,
        } => {
            w.u32(*uid);
            w.u32(*gid);
            w.u32(*mode);
            w.i64(*mtime);
        }
        PathState::Other { uid, gid } => {
            w.u32(*uid);
            w.u32(*gid);
        }
    }
}

fn decode_state(r: &mut ByteReader) -> Result<PathState> {
    let tag = r.u8()?;
    let ty = PathStateType::from_tag(tag)
        .ok_or_else(|| Failure::CorruptMetadata(format!("bad state_type tag {tag}")))?;
    Ok(match ty {
        PathStateType::NonExisting => PathState::NonExisting,
        PathStateType::RegularFile => {
            let uid = r.u32()?;
            let gid = r.u32()?;
            let mode = r.u32()?;
            let mtime = r.i64()?;
            let size = r.u64()?;
            let mut hash = [0u8; 20];
            let mut slot = 0u8;
            if size > 20 {
                hash.copy_from_slice(r.take(20)?);
                slot = r.u8()?;
            } else if size > 0 {
                hash[..size as usize].copy_from_slice(r.take(size as usize)?);
            }
            PathState::RegularFile {
                uid,
                gid,
                mode,
                mtime,
                size,
                hash: Hash20(hash),
                slot,
            }
        }
        PathStateType::Symlink => {
            let uid = r.u32()?;
            let gid = r.u32()?;
            let target_bytes = r.len_prefixed()?;
            let target = String::from_utf8(target_bytes)
                .map_err(|_| Failure::CorruptMetadata("symlink target isn't UTF-8".into()))?;
            PathState::Symlink {
                uid,
                gid,
                target: Utf8PathBuf::from(target),
            }
        }
        PathStateType::Directory => {
            let uid = r.u32()?;
            let gid = r.u32()?;
            let mode = r.u32()?;
            let mtime = r.i64()?;
            PathState::Directory {
                uid,
                gid,
                mode,
                mtime,
            }
        }
        PathStateType::Other => {
            let uid = r.u32()?;
            let gid = r.u32()?;
            PathState::Other { uid, gid }
        }
    })
}

fn encode_history(w: &mut ByteWriter, r: &Renumbering, history: &PathHistory) {
    w.u64(history.len() as u64);
    for point in history {
        w.u64(encode_backup_ref(r, &point.backup));
        encode_state(w, &point.state);
    }
}

fn decode_history(r: &mut ByteReader) -> Result<PathHistory> {
    let len = r.u64()? as usize;
    let mut points = Vec::with_capacity(len);
    for _ in 0..len {
        let backup_id = r.u64()? as usize;
        let state = decode_state(r)?;
        points.push(PathHistoryPoint {
            backup: BackupRef::Historical(backup_id),
            state,
        });
    }
    Ok(points)
}

fn encode_tree(w: &mut ByteWriter, r: &Renumbering, md: &Metadata, roots: &[NodeId]) {
    // Nodes flagged not_part_of_repository are omitted (§6.1b).
    let visible: Vec<NodeId> = roots
        .iter()
        .copied()
        .filter(|&id| !md.get(id).hint.contains(crate::metadata::BackupHint::NOT_PART_OF_REPOSITORY))
        .collect();
    w.u64(visible.len() as u64);
    for id in visible {
        encode_node(w, r, md, id);
    }
}

fn encode_node(w: &mut ByteWriter, r: &Renumbering, md: &Metadata, id: NodeId) {
    let node = md.get(id);
    let name = node.path.file_name().unwrap_or(node.path.as_str());
    w.len_prefixed(name.as_bytes());
    w.u8(node.policy.to_tag());
    encode_history(w, r, &node.history);
    encode_tree(w, r, md, &node.children);
}

fn decode_tree(
    r: &mut ByteReader,
    md: &mut Metadata,
    parent: Option<NodeId>,
    parent_path: Option<&camino::Utf8Path>,
) -> Result<Vec<NodeId>> {
    let count = r.u64()? as usize;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let name_bytes = r.len_prefixed()?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| Failure::CorruptMetadata("path name isn't UTF-8".into()))?;
        if name.is_empty() {
            bail!(Failure::CorruptMetadata("zero-length path name".into()));
        }
        let path = match parent_path {
            Some(p) => crate::path_util::join_absolute(p, &name),
            None => Utf8PathBuf::from(format!("/{name}")),
        };
        crate::path_util::reject_dot_elements(&path)?;

        let policy_tag = r.u8()?;
        let policy = BackupPolicy::from_tag(policy_tag)
            .ok_or_else(|| Failure::CorruptMetadata(format!("bad policy tag {policy_tag}")))?;
        let history = decode_history(r)?;
        if history.is_empty() {
            bail!(Failure::CorruptMetadata(format!(
                "path {path} has an empty history"
            )));
        }

        let node = PathNode {
            path: path.clone(),
            hint: crate::metadata::BackupHint::empty(),
            policy,
            history,
            children: Vec::new(),
            parent,
        };
        let id = md.nodes.len();
        md.nodes.push(node);
        md.path_table.insert(path.clone(), id);
        md.total_path_count += 1;

        let children = decode_tree(r, md, Some(id), Some(&path))?;
        md.get_mut(id).children = children;

        ids.push(id);
    }
    Ok(ids)
}

/// Serialize `md` to the exact byte grammar of §6.1.
pub fn encode(md: &Metadata) -> Vec<u8> {
    let renumbering = plan_renumbering(md);
    let mut w = ByteWriter::new();

    w.u64(renumbering.surviving_completion_times.len() as u64);
    // A presence flag ahead of the optional `current_completion_time`
    // field - the grammar in §6.1 says the field is "present iff the
    // current backup has any references", but doesn't say how a reader
    // is meant to detect that without one.
    w.u8(renumbering.current_id.is_some() as u8);
    if renumbering.current_id.is_some() {
        w.i64(md.current_backup.completion_time);
    }
    for t in &renumbering.surviving_completion_times {
        w.i64(*t);
    }

    encode_history(&mut w, &renumbering, &md.config_history);
    w.u64(md.total_path_count_visible(&md.roots));
    encode_tree(&mut w, &renumbering, md, &md.roots);

    w.buf
}

/// Deserialize bytes written by [`encode`] back into a fresh [`Metadata`],
/// with a brand-new, empty `current_backup` (ready for a new run - the
/// loaded file's own "current" backup, if it had one, is now just the
/// last entry in `backup_history`).
pub fn decode(bytes: &[u8]) -> Result<Metadata> {
    let mut r = ByteReader::new(bytes);
    let mut md = Metadata::new();

    let backup_count = r.u64()? as usize;
    let current_present = r.u8()? != 0;
    let current_completion_time = if current_present { Some(r.i64()?) } else { None };

    let mut completion_times = Vec::with_capacity(backup_count);
    for _ in 0..backup_count {
        completion_times.push(r.i64()?);
    }
    for t in completion_times {
        md.backup_history.push(Backup {
            completion_time: t,
            ref_count: 0,
        });
    }
    if let Some(t) = current_completion_time {
        md.backup_history.push(Backup {
            completion_time: t,
            ref_count: 0,
        });
    }

    md.config_history = decode_history(&mut r)?;
    let _declared_total_path_count = r.u64()?;
    md.roots = decode_tree(&mut r, &mut md, None, None)?;

    if !r.at_eof() {
        bail!(Failure::CorruptMetadata(
            "trailing bytes after the path list".into()
        ));
    }

    recompute_ref_counts(&mut md);
    Ok(md)
}

impl Metadata {
    /// Load a repository's metadata file, or a fresh, empty [`Metadata`]
    /// if the repository was just initialized and has never been written
    /// to.
    pub fn load(repo: &crate::repo::Repository) -> Result<Metadata> {
        let bytes = repo.read_metadata()?;
        if bytes.is_empty() {
            return Ok(Metadata::new());
        }
        decode(&bytes)
    }

    /// Serialize and write this metadata to `repo`, via the repository's
    /// crash-atomic raw-mode write.
    pub fn write(&self, repo: &crate::repo::Repository) -> Result<()> {
        repo.write_metadata(&encode(self))
    }
}

fn recompute_ref_counts(md: &mut Metadata) {
    let bump = |counts: &mut Vec<u64>, point: &PathHistoryPoint| {
        if let BackupRef::Historical(idx) = point.backup {
            if let Some(c) = counts.get_mut(idx) {
                *c += 1;
            }
        }
    };
    let mut counts = vec![0u64; md.backup_history.len()];
    for point in &md.config_history {
        bump(&mut counts, point);
    }
    for node in &md.nodes {
        for point in &node.history {
            bump(&mut counts, point);
        }
    }
    for (b, c) in md.backup_history.iter_mut().zip(counts) {
        b.ref_count = c;
    }
}

impl Metadata {
    /// Count nodes under `roots` not flagged `not_part_of_repository`,
    /// recursively - what actually gets written to disk (§6.1 field 5).
    fn total_path_count_visible(&self, roots: &[NodeId]) -> u64 {
        let mut count = 0u64;
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            let node = self.get(id);
            if node.hint.contains(crate::metadata::BackupHint::NOT_PART_OF_REPOSITORY) {
                continue;
            }
            count += 1;
            stack.extend(node.children.iter().copied());
        }
        count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::PathState;

    fn small_file(content: &[u8]) -> PathState {
        let mut hash = [0u8; 20];
        hash[..content.len()].copy_from_slice(content);
        PathState::RegularFile {
            uid: 1000,
            gid: 1000,
            mode: 0o644,
            mtime: 12345,
            size: content.len() as u64,
            hash: Hash20(hash),
            slot: 0,
        }
    }

    fn big_file(hash: Hash20, size: u64, slot: u8) -> PathState {
        PathState::RegularFile {
            uid: 0,
            gid: 0,
            mode: 0o644,
            mtime: 99,
            size,
            hash,
            slot,
        }
    }

    #[test]
    fn round_trips_a_small_inline_file() -> Result<()> {
        let mut md = Metadata::new();
        md.insert_new(Utf8PathBuf::from("/a"), BackupPolicy::Copy, None, small_file(b"hello"));

        let bytes = encode(&md);
        let back = decode(&bytes)?;

        assert_eq!(back.total_path_count, 1);
        let id = back.find(camino::Utf8Path::new("/a")).unwrap();
        match &back.get(id).head().state {
            PathState::RegularFile { size, hash, .. } => {
                assert_eq!(*size, 5);
                assert_eq!(&hash.as_bytes()[..5], b"hello");
            }
            other => panic!("expected a regular file state, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn round_trips_a_large_hashed_file_and_renumbers_backups() -> Result<()> {
        let mut md = Metadata::new();
        // A dead backup that should be dropped on write.
        md.backup_history.push(Backup {
            completion_time: 111,
            ref_count: 0,
        });
        // A live historical backup that should become id 0.
        md.backup_history.push(Backup {
            completion_time: 222,
            ref_count: 1,
        });

        let hash = crate::hashing::hash_bytes(b"big file contents padded out past twenty bytes");
        let id = md.insert_new(
            Utf8PathBuf::from("/big"),
            BackupPolicy::Track,
            None,
            big_file(hash, 4096, 0),
        );
        // Give the node a second, older history point bound to the live
        // historical backup.
        md.get_mut(id).history.push(PathHistoryPoint {
            backup: BackupRef::Historical(1),
            state: big_file(hash, 4096, 0),
        });

        let bytes = encode(&md);
        let back = decode(&bytes)?;

        // Dead backup is gone; only the one live historical backup plus
        // the current one (now historical) survive.
        assert_eq!(back.backup_history.len(), 2);
        assert_eq!(back.backup_history[0].completion_time, 222);
        assert_eq!(back.backup_history[0].ref_count, 1);
        assert_eq!(back.backup_history[1].ref_count, 1);

        let id = back.find(camino::Utf8Path::new("/big")).unwrap();
        assert_eq!(back.get(id).history.len(), 2);
        Ok(())
    }

    #[test]
    fn nested_paths_reconstruct_parent_links() -> Result<()> {
        let mut md = Metadata::new();
        let root = md.insert_new(Utf8PathBuf::from("/home"), BackupPolicy::Copy, None, small_file(b""));
        md.insert_new(
            Utf8PathBuf::from("/home/user"),
            BackupPolicy::Copy,
            Some(root),
            small_file(b"x"),
        );

        let bytes = encode(&md);
        let back = decode(&bytes)?;

        let home = back.find(camino::Utf8Path::new("/home")).unwrap();
        let user = back.find(camino::Utf8Path::new("/home/user")).unwrap();
        assert_eq!(back.get(home).children, vec![user]);
        assert_eq!(back.get(user).parent, Some(home));
        Ok(())
    }

    #[test]
    fn not_part_of_repository_nodes_are_omitted() -> Result<()> {
        let mut md = Metadata::new();
        let id = md.insert_new(Utf8PathBuf::from("/gone"), BackupPolicy::Mirror, None, small_file(b""));
        md.get_mut(id).hint = crate::metadata::BackupHint::NOT_PART_OF_REPOSITORY;

        let bytes = encode(&md);
        let back = decode(&bytes)?;
        assert_eq!(back.total_path_count, 0);
        assert!(back.find(camino::Utf8Path::new("/gone")).is_none());
        Ok(())
    }

    #[test]
    fn truncated_input_is_corrupt_metadata() {
        let mut md = Metadata::new();
        md.insert_new(Utf8PathBuf::from("/a"), BackupPolicy::Copy, None, small_file(b"hi"));
        let mut bytes = encode(&md);
        bytes.truncate(bytes.len() - 1);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() -> Result<()> {
        let md = Metadata::new();
        let mut bytes = encode(&md);
        bytes.push(0xff);
        assert!(decode(&bytes).is_err());
        Ok(())
    }
}
