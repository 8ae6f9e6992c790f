//! The thin CLI front end. Each submodule is one subcommand: it parses its
//! own [`clap::Parser`] arg struct, opens whatever repository state it
//! needs, and calls straight into the library (`backup::run`, `gc::collect`,
//! ...) - no business logic lives here.

pub mod backup;
pub mod gc;
pub mod init;

use byte_unit::{Byte, UnitType};

/// Human-readable byte count for report lines, e.g. "12.34 MiB".
pub(crate) fn nice_size(bytes: u64) -> String {
    format!("{:#.2}", Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary))
}
