//! Lazy traversal of the live filesystem, driven by the [`SearchTree`]
//! (C8). An explicit stack of frames replaces native recursive descent
//! so deeply nested trees don't blow the call stack - each frame either
//! holds one path awaiting a direct lookup, or a directory whose entries
//! still need matching against the policy tree.

use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::Failure;
use crate::io_util::{self, Stat, StatType};
use crate::metadata::BackupPolicy;
use crate::path_util;
use crate::search::{ObservedTypes, SearchNodeId, SearchTree};

/// One record emitted by the iterator for each filesystem entry visited.
#[derive(Debug, Clone)]
pub struct Record {
    pub path: Utf8PathBuf,
    pub node: Option<SearchNodeId>,
    pub policy: BackupPolicy,
    pub stat: Stat,
}

/// Markers interleaved with [`Record`]s so callers can tell directory
/// boundaries and the end of the walk apart from real entries (§4.3).
pub enum Event {
    Entry(Record),
    EndOfDirectory,
    EndOfSearch,
}

enum Frame {
    /// A node whose policy is `none` and whose subnodes contain no
    /// regex: iterate the declared children directly, skipping `readdir`
    /// entirely (§4.3 "direct-access frame").
    DirectAccess {
        dir_path: Utf8PathBuf,
        node: SearchNodeId,
        next_child: usize,
    },
    /// Open a directory stream and match each entry against the node's
    /// subnode list (§4.3 "directory-search frame").
    DirectorySearch {
        dir_path: Utf8PathBuf,
        node: SearchNodeId,
        fallback_policy: BackupPolicy,
        entries: Vec<Utf8PathBuf>,
        next_entry: usize,
    },
}

/// The iterator itself: a frame stack plus a reference to the tree it was
/// built from.
pub struct SearchIter<'a> {
    tree: &'a mut SearchTree,
    stack: Vec<Frame>,
    done: bool,
}

pub fn walk(tree: &mut SearchTree) -> Result<SearchIter<'_>> {
    let root = tree.root;
    let is_direct = !tree.get(root).subnodes_contain_regex && tree.get(root).policy == BackupPolicy::None;
    let dir_path = Utf8PathBuf::from("/");
    let frame = if is_direct {
        Frame::DirectAccess {
            dir_path,
            node: root,
            next_child: 0,
        }
    } else {
        let entries = io_util::read_dir(&dir_path)?;
        Frame::DirectorySearch {
            dir_path,
            node: root,
            fallback_policy: tree.get(root).policy,
            entries,
            next_entry: 0,
        }
    };
    Ok(SearchIter {
        tree,
        stack: vec![frame],
        done: false,
    })
}

impl<'a> SearchIter<'a> {
    pub fn next_event(&mut self) -> Result<Event> {
        if self.done {
            return Ok(Event::EndOfSearch);
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.done = true;
                return Ok(Event::EndOfSearch);
            };

            match frame {
                Frame::DirectAccess {
                    dir_path,
                    node,
                    next_child,
                } => {
                    let node = *node;
                    let dir_path = dir_path.clone();
                    let children = self.tree.get(node).children.clone();
                    if *next_child >= children.len() {
                        self.stack.pop();
                        return Ok(Event::EndOfDirectory);
                    }
                    let child_id = children[*next_child];
                    if let Frame::DirectAccess { next_child, .. } = self.stack.last_mut().unwrap() {
                        *next_child += 1;
                    }
                    let name = self.tree.get(child_id).name.clone();
                    let entry_path = path_util::join_absolute(&dir_path, &name);
                    return self.emit(entry_path, Some(child_id));
                }

                Frame::DirectorySearch {
                    dir_path,
                    node,
                    fallback_policy,
                    entries,
                    next_entry,
                } => {
                    let node = *node;
                    let fallback_policy = *fallback_policy;
                    let dir_path = dir_path.clone();
                    if *next_entry >= entries.len() {
                        self.stack.pop();
                        return Ok(Event::EndOfDirectory);
                    }
                    let entry_path = entries[*next_entry].clone();
                    if let Frame::DirectorySearch { next_entry, .. } = self.stack.last_mut().unwrap() {
                        *next_entry += 1;
                    }

                    let entry_name = entry_path
                        .file_name()
                        .expect("directory entries always have a name");

                    let matched = if node == UNMATCHED_PARENT {
                        None
                    } else {
                        self.match_subnodes(node, entry_name, &entry_path)?
                    };
                    match matched {
                        Some(child_id) => {
                            return self.emit(entry_path, Some(child_id));
                        }
                        None => {
                            if fallback_policy == BackupPolicy::None {
                                continue;
                            }
                            if self.matches_ignore(&entry_path) {
                                continue;
                            }
                            return self.emit_with_policy(entry_path, None, fallback_policy);
                        }
                    }
                }
            }
        }
    }

    fn match_subnodes(
        &self,
        node: SearchNodeId,
        entry_name: &str,
        full_path: &Utf8Path,
    ) -> Result<Option<SearchNodeId>> {
        let children = &self.tree.get(node).children;
        let mut matches = Vec::new();
        for &id in children {
            if self.tree.get(id).matches(entry_name) {
                matches.push(id);
            }
        }
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => {
                for id in &matches {
                    tracing::warn!(
                        "{full_path} matches more than one rule (line {})",
                        self.tree.get(*id).line_nr
                    );
                }
                Err(Failure::AmbiguousMatch(full_path.to_string()).into())
            }
        }
    }

    fn matches_ignore(&mut self, path: &Utf8Path) -> bool {
        let mut hit = false;
        for rule in &mut self.tree.ignore {
            if rule.regex.is_match(path.as_str()) {
                rule.has_matched = true;
                hit = true;
            }
        }
        hit
    }

    fn emit(&mut self, path: Utf8PathBuf, node: Option<SearchNodeId>) -> Result<Event> {
        let policy = node.map(|id| self.tree.get(id).policy).unwrap_or(BackupPolicy::None);
        self.emit_with_policy(path, node, policy)
    }

    fn emit_with_policy(
        &mut self,
        path: Utf8PathBuf,
        node: Option<SearchNodeId>,
        policy: BackupPolicy,
    ) -> Result<Event> {
        let stat = io_util::lstat(&path).with_context(|| format!("Couldn't stat {path}"))?;

        if let Some(id) = node {
            let observed = match stat.kind {
                StatType::Regular => ObservedTypes::REGULAR,
                StatType::Symlink => ObservedTypes::SYMLINK,
                StatType::Directory => ObservedTypes::DIRECTORY,
                StatType::Other => ObservedTypes::OTHER,
            };
            self.tree.get_mut(id).search_match |= observed;
        }

        if stat.kind == StatType::Directory {
            self.push_directory_frame(&path, node, policy)?;
        }

        Ok(Event::Entry(Record { path, node, policy, stat }))
    }

    fn push_directory_frame(
        &mut self,
        dir_path: &Utf8Path,
        node: Option<SearchNodeId>,
        fallback_policy: BackupPolicy,
    ) -> Result<()> {
        match node {
            Some(id)
                if self.tree.get(id).policy == BackupPolicy::None
                    && !self.tree.get(id).subnodes_contain_regex =>
            {
                self.stack.push(Frame::DirectAccess {
                    dir_path: dir_path.to_owned(),
                    node: id,
                    next_child: 0,
                });
            }
            Some(id) => {
                let entries = io_util::read_dir(dir_path)?;
                self.stack.push(Frame::DirectorySearch {
                    dir_path: dir_path.to_owned(),
                    node: id,
                    fallback_policy: self.tree.get(id).policy,
                    entries,
                    next_entry: 0,
                });
            }
            None => {
                let entries = io_util::read_dir(dir_path)?;
                self.stack.push(Frame::DirectorySearch {
                    dir_path: dir_path.to_owned(),
                    // No matched node: there are no subnodes to search
                    // against, so every entry falls straight to the
                    // fallback-policy/ignore-list path (§4.3 steps 3-5).
                    node: UNMATCHED_PARENT,
                    fallback_policy,
                    entries,
                    next_entry: 0,
                });
            }
        }
        Ok(())
    }
}

/// Sentinel `SearchNodeId` meaning "this directory frame has no matched
/// parent node", used instead of `Option<SearchNodeId>` to keep `Frame`
/// a plain, cheaply cloned struct.
const UNMATCHED_PARENT: SearchNodeId = SearchNodeId::MAX;
