//! Path strings: dot-element detection and absolute-path joining on top of
//! [`camino`]'s UTF-8 paths.
//!
//! `camino::Utf8Path` already gives us the "immutable slice" half of C2 for
//! free, and every `rustix` call in `io_util.rs` takes one directly via
//! `as_std_path()` - there's no separate C-string bridge to maintain here.
//! What's left is a uniform way to reject `.`/`..` elements.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::Failure;

/// True if `path` contains a `.` or `..` element anywhere.
///
/// Spec §3/§4.2: a [`crate::metadata::PathNode`]'s path must never contain
/// these, and the search-tree parser must reject any selector that does.
pub fn has_dot_element(path: &Utf8Path) -> bool {
    path.components()
        .any(|c| matches!(c.as_str(), "." | ".."))
}

/// Reject `path` if it contains a `.`/`..` element, naming it in the error.
pub fn reject_dot_elements(path: &Utf8Path) -> Result<(), Failure> {
    if has_dot_element(path) {
        Err(Failure::DotElement(path.to_string()))
    } else {
        Ok(())
    }
}

/// Join `parent` and `name`, handling the case where `parent` is the root
/// (`/`) specially so the result never starts with `//` (§4.3: "The root is
/// treated specially so that emitted absolute paths do not start with
/// `//`").
pub fn join_absolute(parent: &Utf8Path, name: &str) -> Utf8PathBuf {
    if parent == Utf8Path::new("/") {
        let mut p = Utf8PathBuf::from("/");
        p.push(name);
        p
    } else {
        parent.join(name)
    }
}
