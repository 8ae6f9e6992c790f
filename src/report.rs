//! The summary structures a run hands back to its caller (§6.4): per
//! category counts and byte totals for a backup, and a separate, smaller
//! one for garbage collection. Nothing in this engine is concurrent, so
//! a plain `u64` per counter is enough - no atomics needed.

/// Per-category counts and byte totals produced by one backup run.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Report {
    pub added: u64,
    pub added_bytes: u64,
    pub removed: u64,
    pub changed: u64,
    pub changed_bytes: u64,
    pub owner_changed: u64,
    pub permissions_changed: u64,
    pub timestamp_changed: u64,
    pub not_part_of_repository: u64,
    /// Regular files that were actually hashed, deduped, and (if not a
    /// duplicate) copied into the repository during finalisation.
    pub stored: u64,
    pub stored_bytes: u64,
}

/// What garbage collection reclaimed.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct GcReport {
    pub deleted_count: u64,
    pub deleted_bytes: u64,
}
