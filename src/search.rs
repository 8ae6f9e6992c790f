//! The policy tree (C7): a config-driven tree of selectors with policy
//! inheritance and a shared ignore list. Each node carries a name or
//! regex matcher and its own inherited policy, so `regex::Regex` is
//! compiled per node rather than batched into one set.

use camino::Utf8Path;
use regex::Regex;

use crate::error::Failure;
use crate::metadata::BackupPolicy;
use crate::path_util;

bitflags::bitflags! {
    /// Which filesystem entry types a [`SearchNode`] has actually been
    /// matched against, across however many directory walks have touched
    /// it - used for post-run reporting of nodes that matched nothing, or
    /// matched a type the config author didn't expect (§4.3).
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
    pub struct ObservedTypes: u8 {
        const REGULAR   = 1 << 0;
        const SYMLINK   = 1 << 1;
        const DIRECTORY = 1 << 2;
        const OTHER     = 1 << 3;
    }
}

pub type SearchNodeId = usize;

/// `{ name, optional regex, policy, policy_inherited, ... }` (§3). Shares
/// the "flat arena, index-linked" shape of [`crate::metadata::PathNode`].
#[derive(Debug, Clone)]
pub struct SearchNode {
    pub name: String,
    pub regex: Option<Regex>,
    pub policy: BackupPolicy,
    pub policy_inherited: bool,
    pub line_nr: usize,
    pub policy_line_nr: usize,
    pub search_match: ObservedTypes,
    pub children: Vec<SearchNodeId>,
    pub subnodes_contain_regex: bool,
}

impl SearchNode {
    fn new_root() -> Self {
        Self {
            name: "/".to_owned(),
            regex: None,
            policy: BackupPolicy::None,
            policy_inherited: false,
            line_nr: 0,
            policy_line_nr: 0,
            search_match: ObservedTypes::empty(),
            children: Vec::new(),
            subnodes_contain_regex: false,
        }
    }

    fn new_child(name: String, regex: Option<Regex>, inherited_policy: BackupPolicy, line_nr: usize) -> Self {
        Self {
            name,
            regex,
            policy: inherited_policy,
            policy_inherited: true,
            line_nr,
            policy_line_nr: 0,
            search_match: ObservedTypes::empty(),
            children: Vec::new(),
            subnodes_contain_regex: false,
        }
    }

    /// True if `entry_name` matches this node's selector.
    pub fn matches(&self, entry_name: &str) -> bool {
        match &self.regex {
            Some(re) => re.is_match(entry_name),
            None => self.name == entry_name,
        }
    }
}

/// One compiled pattern from a `[ignore]` block, shared by the whole tree.
#[derive(Debug, Clone)]
pub struct IgnoreRule {
    pub regex: Regex,
    pub source: String,
    pub line_nr: usize,
    pub has_matched: bool,
}

/// The full parsed policy tree, plus the ignore list every search frame
/// consults once a subnode-level match fails (§4.3 step 4).
#[derive(Debug, Clone)]
pub struct SearchTree {
    pub nodes: Vec<SearchNode>,
    pub root: SearchNodeId,
    pub ignore: Vec<IgnoreRule>,
}

impl SearchTree {
    /// Parse a config's text into a [`SearchTree`] (§4.2).
    pub fn from_config(text: &str) -> Result<SearchTree, anyhow::Error> {
        from_config(text)
    }

    pub fn get(&self, id: SearchNodeId) -> &SearchNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: SearchNodeId) -> &mut SearchNode {
        &mut self.nodes[id]
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Context {
    /// No `[policy]` block has been seen yet; a selector line here is an
    /// error (§4.2 "path-before-policy").
    None,
    Policy(BackupPolicy),
    Ignore,
}

enum Segment<'a> {
    Literal(&'a str),
    Regex(&'a str),
}

/// Split a selector's segments, honoring the "a segment preceded by an
/// extra slash is a regex" convention (§4.2: "A segment that itself
/// starts with `/regex`... is compiled as a regex"). A doubled slash in
/// the selector (`//pattern`) marks the segment right after it as a
/// regex instead of a literal name; the empty marker token itself is not
/// a segment.
fn selector_segments(selector: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut parts = selector.split('/').skip(1).peekable();
    while let Some(part) = parts.next() {
        if part.is_empty() {
            if let Some(next) = parts.next() {
                out.push(Segment::Regex(next));
            }
        } else {
            out.push(Segment::Literal(part));
        }
    }
    out
}

/// Parse a config's text into a [`SearchTree`] (§4.2).
pub fn from_config(text: &str) -> Result<SearchTree, anyhow::Error> {
    if text.contains('\0') {
        anyhow::bail!(Failure::ConfigSyntax {
            line: 0,
            message: "config contains a NUL byte".into(),
        });
    }
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut tree = SearchTree {
        nodes: vec![SearchNode::new_root()],
        root: 0,
        ignore: Vec::new(),
    };
    let mut context = Context::None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_nr = idx + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(token) = bracket_token(trimmed) {
            context = match token {
                "copy" => Context::Policy(BackupPolicy::Copy),
                "mirror" => Context::Policy(BackupPolicy::Mirror),
                "track" => Context::Policy(BackupPolicy::Track),
                "ignore" => Context::Ignore,
                other => anyhow::bail!(Failure::ConfigSyntax {
                    line: line_nr,
                    message: format!("unrecognised policy token [{other}]"),
                }),
            };
            continue;
        }

        match context {
            Context::None => anyhow::bail!(Failure::ConfigSyntax {
                line: line_nr,
                message: "a path selector appeared before any policy block".into(),
            }),
            Context::Ignore => {
                let re = Regex::new(trimmed).map_err(Failure::Regex)?;
                tree.ignore.push(IgnoreRule {
                    regex: re,
                    source: trimmed.to_owned(),
                    line_nr,
                    has_matched: false,
                });
            }
            Context::Policy(policy) => {
                if !trimmed.starts_with('/') {
                    anyhow::bail!(Failure::ConfigSyntax {
                        line: line_nr,
                        message: format!("expected a path selector starting with '/', found {trimmed:?}"),
                    });
                }
                add_selector(&mut tree, trimmed, policy, line_nr)?;
            }
        }
    }

    Ok(tree)
}

fn bracket_token(line: &str) -> Option<&str> {
    line.strip_prefix('[').and_then(|s| s.strip_suffix(']'))
}

fn add_selector(
    tree: &mut SearchTree,
    selector: &str,
    policy: BackupPolicy,
    line_nr: usize,
) -> Result<(), anyhow::Error> {
    let mut current = tree.root;
    let segments = selector_segments(selector);
    let last = segments.len().saturating_sub(1);

    for (i, seg) in segments.into_iter().enumerate() {
        let is_last = i == last;
        let (name, compiled) = match seg {
            Segment::Literal(name) => {
                path_util::reject_dot_elements(Utf8Path::new(name))?;
                (name.to_owned(), None)
            }
            Segment::Regex(pattern) => {
                let re = Regex::new(pattern).map_err(Failure::Regex)?;
                (pattern.to_owned(), Some(re))
            }
        };

        let existing = tree.get(current).children.iter().copied().find(|&id| {
            let n = tree.get(id);
            match (&n.regex, &compiled) {
                (Some(_), Some(_)) => n.name == name,
                (None, None) => n.name == name,
                _ => false,
            }
        });

        let node_id = match existing {
            Some(id) => id,
            None => {
                let inherited = tree.get(current).policy;
                let is_regex = compiled.is_some();
                let node = SearchNode::new_child(name, compiled, inherited, line_nr);
                let id = tree.nodes.len();
                tree.nodes.push(node);
                tree.get_mut(current).children.push(id);
                if is_regex {
                    tree.get_mut(current).subnodes_contain_regex = true;
                }
                id
            }
        };

        if is_last {
            assign_policy(tree, node_id, policy, line_nr)?;
        }
        current = node_id;
    }

    Ok(())
}

fn assign_policy(
    tree: &mut SearchTree,
    id: SearchNodeId,
    policy: BackupPolicy,
    line_nr: usize,
) -> Result<(), anyhow::Error> {
    let node = tree.get(id);
    if !node.policy_inherited {
        if node.policy == policy {
            anyhow::bail!(Failure::ConfigSyntax {
                line: line_nr,
                message: format!(
                    "{} was already assigned policy {:?} at line {}",
                    node.name, node.policy, node.policy_line_nr
                ),
            });
        } else {
            anyhow::bail!(Failure::ConfigSyntax {
                line: line_nr,
                message: format!(
                    "{} was already assigned a different policy ({:?}) at line {}",
                    node.name, node.policy, node.policy_line_nr
                ),
            });
        }
    }

    {
        let node = tree.get_mut(id);
        node.policy = policy;
        node.policy_inherited = false;
        node.policy_line_nr = line_nr;
    }
    propagate_policy(tree, id, policy);
    Ok(())
}

fn propagate_policy(tree: &mut SearchTree, id: SearchNodeId, policy: BackupPolicy) {
    let children = tree.get(id).children.clone();
    for child in children {
        let c = tree.get(child);
        if c.policy == BackupPolicy::None || c.policy_inherited {
            let c = tree.get_mut(child);
            c.policy = policy;
            c.policy_inherited = true;
            propagate_policy(tree, child, policy);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn child_named<'a>(tree: &'a SearchTree, parent: SearchNodeId, name: &str) -> Option<&'a SearchNode> {
        tree.get(parent)
            .children
            .iter()
            .map(|&id| tree.get(id))
            .find(|n| n.name == name)
    }

    #[test]
    fn simple_copy_selector() -> Result<(), anyhow::Error> {
        let tree = from_config("[copy]\n/home\n")?;
        let home = child_named(&tree, tree.root, "home").unwrap();
        assert_eq!(home.policy, BackupPolicy::Copy);
        assert!(!home.policy_inherited);
        Ok(())
    }

    #[test]
    fn policy_inheritance_propagates_to_descendants() -> Result<(), anyhow::Error> {
        let tree = from_config("[copy]\n/home\n[track]\n/home/user/logs\n")?;
        let home = child_named(&tree, tree.root, "home").unwrap();
        assert_eq!(home.policy, BackupPolicy::Copy);

        let home_id = tree.get(tree.root).children[0];
        let user = child_named(&tree, home_id, "user").unwrap();
        // user inherited copy from home (it's an intermediate node on the
        // second selector's path, not itself explicitly assigned).
        assert_eq!(user.policy, BackupPolicy::Copy);
        assert!(user.policy_inherited);

        let user_id = tree.get(home_id).children[0];
        let logs = child_named(&tree, user_id, "logs").unwrap();
        assert_eq!(logs.policy, BackupPolicy::Track);
        assert!(!logs.policy_inherited);
        Ok(())
    }

    #[test]
    fn redefining_an_explicit_path_fails() {
        let err = from_config("[copy]\n/home\n[mirror]\n/home\n").unwrap_err();
        assert!(err.to_string().contains("already assigned"));
    }

    #[test]
    fn selector_before_any_policy_fails() {
        let err = from_config("/home\n").unwrap_err();
        assert!(err.to_string().contains("before any policy"));
    }

    #[test]
    fn ignore_block_compiles_regexes() -> Result<(), anyhow::Error> {
        let tree = from_config("[ignore]\n\\.tmp$\n")?;
        assert_eq!(tree.ignore.len(), 1);
        assert!(tree.ignore[0].regex.is_match("foo.tmp"));
        Ok(())
    }

    #[test]
    fn regex_segment_is_compiled() -> Result<(), anyhow::Error> {
        let tree = from_config("[copy]\n/home//^log.*$\n")?;
        let home = child_named(&tree, tree.root, "home").unwrap();
        assert!(tree.get(home.children[0]).regex.is_some());
        assert!(tree.get(home.children[0]).matches("logfile"));
        Ok(())
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() -> Result<(), anyhow::Error> {
        let tree = from_config("# a comment\n\n[copy]\n   \n/home\n")?;
        assert!(child_named(&tree, tree.root, "home").is_some());
        Ok(())
    }
}
