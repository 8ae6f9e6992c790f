//! In-memory path tree, per-path histories, and backup points (C6).
//!
//! Backups are represented as indices rather than parent-pointer
//! references, to dodge reference cycles. The path tree itself takes the
//! same approach one step further: instead of an owned `Vec<PathNode>` of
//! children inside each node (which Rust can express fine, but which
//! makes "look up the node for this path" an O(depth) walk every time),
//! nodes live in a flat arena and everything - children, siblings, the
//! root list, `path_table` - is index-based.

use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::FxHashMap;

use crate::hashing::Hash20;

/// One of the five ways a node's contents are preserved (or not).
/// `Ignore` only ever appears as a parsing discriminator (§3); no
/// [`PathNode`] is ever assigned it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BackupPolicy {
    None,
    Copy,
    Mirror,
    Track,
    Ignore,
}

impl BackupPolicy {
    pub fn to_tag(self) -> u8 {
        match self {
            BackupPolicy::None => 0,
            BackupPolicy::Copy => 1,
            BackupPolicy::Mirror => 2,
            BackupPolicy::Track => 3,
            BackupPolicy::Ignore => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => BackupPolicy::None,
            1 => BackupPolicy::Copy,
            2 => BackupPolicy::Mirror,
            3 => BackupPolicy::Track,
            4 => BackupPolicy::Ignore,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PathStateType {
    NonExisting,
    RegularFile,
    Symlink,
    Directory,
    Other,
}

impl PathStateType {
    pub fn to_tag(self) -> u8 {
        match self {
            PathStateType::NonExisting => 0,
            PathStateType::RegularFile => 1,
            PathStateType::Symlink => 2,
            PathStateType::Directory => 3,
            PathStateType::Other => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => PathStateType::NonExisting,
            1 => PathStateType::RegularFile,
            2 => PathStateType::Symlink,
            3 => PathStateType::Directory,
            4 => PathStateType::Other,
            _ => return None,
        })
    }
}

/// A single snapshot of what a path looked like, as of one [`Backup`].
#[derive(Debug, Clone)]
pub enum PathState {
    NonExisting,
    RegularFile {
        uid: u32,
        gid: u32,
        mode: u32,
        mtime: i64,
        size: u64,
        /// BLAKE2b-20 when `size > 20`; otherwise the first `size` bytes
        /// of this array are the literal file content (inline storage,
        /// §3/§4.5) and `slot` is meaningless.
        hash: Hash20,
        slot: u8,
    },
    Symlink {
        uid: u32,
        gid: u32,
        target: Utf8PathBuf,
    },
    Directory {
        uid: u32,
        gid: u32,
        mode: u32,
        mtime: i64,
    },
    Other {
        uid: u32,
        gid: u32,
    },
}

impl PathState {
    pub fn state_type(&self) -> PathStateType {
        match self {
            PathState::NonExisting => PathStateType::NonExisting,
            PathState::RegularFile { .. } => PathStateType::RegularFile,
            PathState::Symlink { .. } => PathStateType::Symlink,
            PathState::Directory { .. } => PathStateType::Directory,
            PathState::Other { .. } => PathStateType::Other,
        }
    }

    /// True only for a regular-file state whose content lives in the hash
    /// field itself rather than in the repository (§3, §4.5).
    pub fn is_inline(&self) -> bool {
        matches!(self, PathState::RegularFile { size, .. } if *size <= 20)
    }
}

bitflags::bitflags! {
    /// What the pipeline decided about a node during a run (§3). The nine
    /// type-transition codes collapse into a single packed range here
    /// (`TRANSITION_*`); `primary()` masks the rest away.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct BackupHint: u32 {
        const ADDED                   = 1 << 0;
        const REMOVED                 = 1 << 1;
        const OWNER_CHANGED           = 1 << 2;
        const PERMISSIONS_CHANGED     = 1 << 3;
        const TIMESTAMP_CHANGED       = 1 << 4;
        const CONTENT_CHANGED         = 1 << 5;
        const FRESH_HASH              = 1 << 6;
        const NOT_PART_OF_REPOSITORY  = 1 << 7;
        const POLICY_CHANGED          = 1 << 8;
        const LOSES_HISTORY           = 1 << 9;

        const REGULAR_TO_SYMLINK      = 1 << 10;
        const REGULAR_TO_DIRECTORY    = 1 << 11;
        const REGULAR_TO_OTHER        = 1 << 12;
        const SYMLINK_TO_REGULAR      = 1 << 13;
        const SYMLINK_TO_DIRECTORY    = 1 << 14;
        const SYMLINK_TO_OTHER        = 1 << 15;
        const DIRECTORY_TO_REGULAR    = 1 << 16;
        const DIRECTORY_TO_SYMLINK    = 1 << 17;
        const OTHER_TO_DIRECTORY      = 1 << 18;
    }
}

impl BackupHint {
    const TRANSITION_MASK: u32 = 0x7_FC00; // bits 10..=18

    /// Mask out the type-transition bits, yielding the "primary" hint
    /// (§3: "A helper masks out the higher meta bits").
    pub fn primary(self) -> BackupHint {
        BackupHint::from_bits_truncate(self.bits() & !Self::TRANSITION_MASK)
    }
}

/// Identifies which [`Backup`] a [`PathHistoryPoint`] belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BackupRef {
    Current,
    Historical(usize),
}

/// `{ id, completion_time, ref_count }` (§3). `id` is only meaningful for
/// historical backups; the current backup is addressed via
/// [`BackupRef::Current`] and has no stable id until a write renumbers it.
#[derive(Debug, Clone)]
pub struct Backup {
    pub completion_time: i64,
    pub ref_count: u64,
}

impl Backup {
    pub fn new() -> Self {
        Self {
            completion_time: 0,
            ref_count: 0,
        }
    }
}

impl Default for Backup {
    fn default() -> Self {
        Self::new()
    }
}

/// One `{ backup, state }` pair in a path's history.
#[derive(Debug, Clone)]
pub struct PathHistoryPoint {
    pub backup: BackupRef,
    pub state: PathState,
}

/// A path's full history, ordered with `current_backup` (if present)
/// first, then historical points in ascending id order (§3 invariant).
pub type PathHistory = Vec<PathHistoryPoint>;

/// An index into [`Metadata::nodes`]. Never constructed from a raw `usize`
/// outside this module, so callers can't mix up indices from two
/// different arenas.
pub type NodeId = usize;

/// `{ path, hint, policy, history, subnodes, next }` (§3) - except
/// `subnodes`/`next` become index lists into the arena, and `path` is
/// only stored once (not duplicated in both the node and `path_table`).
#[derive(Debug, Clone)]
pub struct PathNode {
    pub path: Utf8PathBuf,
    pub hint: BackupHint,
    pub policy: BackupPolicy,
    pub history: PathHistory,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl PathNode {
    fn new(path: Utf8PathBuf, policy: BackupPolicy, parent: Option<NodeId>) -> Self {
        Self {
            path,
            hint: BackupHint::empty(),
            policy,
            history: Vec::new(),
            children: Vec::new(),
            parent,
        }
    }

    pub fn head(&self) -> &PathHistoryPoint {
        self.history.first().expect("PathNode.history is non-empty")
    }

    pub fn head_mut(&mut self) -> &mut PathHistoryPoint {
        self.history.first_mut().expect("PathNode.history is non-empty")
    }
}

/// Root of the in-memory model (§3). Owns every [`PathNode`] in a flat
/// arena; `path_table` and each node's `children`/`parent` fields are the
/// only way to navigate it.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub current_backup: Backup,
    pub backup_history: Vec<Backup>,
    pub config_history: PathHistory,
    pub total_path_count: u64,
    pub path_table: FxHashMap<Utf8PathBuf, NodeId>,
    pub nodes: Vec<PathNode>,
    pub roots: Vec<NodeId>,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            current_backup: Backup::new(),
            backup_history: Vec::new(),
            config_history: Vec::new(),
            total_path_count: 0,
            path_table: FxHashMap::default(),
            nodes: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn get(&self, id: NodeId) -> &PathNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut PathNode {
        &mut self.nodes[id]
    }

    pub fn find(&self, path: &Utf8Path) -> Option<NodeId> {
        self.path_table.get(path).copied()
    }

    /// Insert a brand-new node for `path` under `parent` (or at the root
    /// list if `parent` is `None`), with a single history point carrying
    /// `state` at the current backup. Increments `total_path_count`.
    pub fn insert_new(
        &mut self,
        path: Utf8PathBuf,
        policy: BackupPolicy,
        parent: Option<NodeId>,
        state: PathState,
    ) -> NodeId {
        let mut node = PathNode::new(path.clone(), policy, parent);
        node.hint = BackupHint::ADDED;
        node.history.push(PathHistoryPoint {
            backup: BackupRef::Current,
            state,
        });
        self.current_backup.ref_count += 1;

        let id = self.nodes.len();
        self.nodes.push(node);
        self.path_table.insert(path, id);
        match parent {
            Some(p) => self.nodes[p].children.push(id),
            None => self.roots.push(id),
        }
        self.total_path_count += 1;
        id
    }

    /// Move a history point's backup reference from `from` to
    /// [`BackupRef::Current`], updating both backups' ref counts (§3
    /// "Lifecycle & ownership").
    pub fn rebind_to_current(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        let point = node.head_mut();
        match point.backup {
            BackupRef::Current => {}
            BackupRef::Historical(old_idx) => {
                self.backup_history[old_idx].ref_count -= 1;
                point.backup = BackupRef::Current;
                self.current_backup.ref_count += 1;
            }
        }
    }

    /// Iterate every `NodeId` reachable from `roots`, depth-first. Used by
    /// the codec writer and the garbage collector, both of which need a
    /// deterministic full-tree walk without recursing natively (§9
    /// "explicit work stack").
    pub fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.nodes[id].children.iter().rev().copied());
        }
        out
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf_state() -> PathState {
        PathState::RegularFile {
            uid: 0,
            gid: 0,
            mode: 0o644,
            mtime: 0,
            size: 0,
            hash: crate::hashing::hash_bytes(b""),
            slot: 0,
        }
    }

    #[test]
    fn hint_primary_masks_transition_bits() {
        let h = BackupHint::ADDED | BackupHint::REGULAR_TO_SYMLINK;
        assert_eq!(h.primary(), BackupHint::ADDED);
    }

    #[test]
    fn insert_new_bumps_current_ref_count_and_table() {
        let mut m = Metadata::new();
        let id = m.insert_new(Utf8PathBuf::from("/a"), BackupPolicy::Copy, None, leaf_state());
        assert_eq!(m.current_backup.ref_count, 1);
        assert_eq!(m.total_path_count, 1);
        assert_eq!(m.find(Utf8Path::new("/a")), Some(id));
        assert!(m.get(id).hint.contains(BackupHint::ADDED));
    }

    #[test]
    fn rebind_moves_refcount_between_backups() {
        let mut m = Metadata::new();
        m.backup_history.push(Backup {
            completion_time: 100,
            ref_count: 1,
        });
        let id = m.insert_new(Utf8PathBuf::from("/a"), BackupPolicy::Copy, None, leaf_state());
        m.get_mut(id).head_mut().backup = BackupRef::Historical(0);
        m.current_backup.ref_count -= 1;

        m.rebind_to_current(id);
        assert_eq!(m.backup_history[0].ref_count, 0);
        assert_eq!(m.current_backup.ref_count, 1);
        assert!(matches!(m.get(id).head().backup, BackupRef::Current));
    }

    #[test]
    fn walk_visits_children_before_siblings_after() {
        let mut m = Metadata::new();
        let root = m.insert_new(Utf8PathBuf::from("/a"), BackupPolicy::Copy, None, leaf_state());
        let _child = m.insert_new(
            Utf8PathBuf::from("/a/b"),
            BackupPolicy::Copy,
            Some(root),
            leaf_state(),
        );
        let _sibling = m.insert_new(Utf8PathBuf::from("/c"), BackupPolicy::Copy, None, leaf_state());
        let order: Vec<_> = m.walk().into_iter().map(|id| m.get(id).path.clone()).collect();
        assert_eq!(
            order,
            vec![
                Utf8PathBuf::from("/a"),
                Utf8PathBuf::from("/a/b"),
                Utf8PathBuf::from("/c"),
            ]
        );
    }
}
