//! The taxonomy of things that can go wrong, and the one true way to die.
//!
//! Every failure is fatal at the top: format a message, exit nonzero (see
//! [`die`]). Internally every function returns [`anyhow::Result`] so the
//! atomicity contract in `repo` doesn't need a parallel "what do we clean
//! up on panic" story - there's nothing to clean up, because nothing is
//! left half-written (see `repo::Writer::close`).

use thiserror::Error;

/// Named failure modes from spec §7. These get wrapped in an [`anyhow::Error`]
/// via `?` like everything else; the enum exists so call sites (and tests)
/// can match on *why* something failed instead of grepping a message string.
#[derive(Debug, Error)]
pub enum Failure {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    #[error("arithmetic overflow: {0}")]
    Overflow(String),

    #[error("path contains a '.' or '..' element: {0}")]
    DotElement(String),

    #[error("config error at line {line}: {message}")]
    ConfigSyntax { line: usize, message: String },

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("{0} changed while it was being backed up")]
    FilesystemRace(String),

    #[error("more than 255 distinct files hash to the same (hash, size): {0}")]
    SlotOverflow(String),

    #[error("ambiguous rules for path {0}")]
    AmbiguousMatch(String),
}

/// The tool's identifier, prefixed onto every user-visible failure per §7.
const IDENTIFIER: &str = "packrat";

/// Format and terminate the process. This is the *only* place that should
/// call `std::process::exit`; everything upstream of `main` just returns
/// `Result` and lets errors bubble.
pub fn die(e: &anyhow::Error) -> ! {
    eprintln!("{IDENTIFIER}: {e:#}");
    std::process::exit(1);
}
