#![forbid(unsafe_code)]
//! Error types for loess.
//!
//! # Error Taxonomy
//!
//! loess uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `loess-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `LoessError` | `loess-error` (this crate) | User-facing errors for the block-layer front end and recovery callers |
//!
//! `loess-error` is intentionally independent of `loess-types` so the
//! two bottom crates cannot form a cycle; the `ParseError` →
//! `LoessError::Parse` conversion happens at the boundary of whichever
//! crate holds both (via the string payload).
//!
//! ## Fatality policy
//!
//! - `CorruptJournal` and `ReferenceCountInvalid` compromise global
//!   space accounting: the caller latches read-only mode and aborts
//!   the recovery attempt.
//! - `BadMapping` is fatal to the current recovery attempt only.
//! - `OutOfSpace` is an ordinary allocation result, never fatal.
//! - `Io` during a recovery phase is recorded once (first error wins)
//!   and surfaces as that phase's result.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via
//! [`LoessError::to_errno`]. The mapping is exhaustive (no wildcard
//! arms) so adding a new variant is a compile error until its errno is
//! assigned.

use thiserror::Error;

/// Unified error type for all loess operations.
#[derive(Debug, Error)]
pub enum LoessError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The recovery journal failed header or entry validation.
    ///
    /// Always fatal: the journal can no longer be trusted to describe
    /// reference changes, so the caller must fall back to read-only
    /// mode and (on the next load) a full rebuild.
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    /// A reference adjustment violated a counter invariant
    /// (decrement of a free block, increment past the maximum
    /// shareable count, or an invalid block-map-block transition).
    ///
    /// Always fatal; never silently clamped.
    #[error("invalid reference count: {0}")]
    ReferenceCountInvalid(String),

    /// A block-map page PBN resolved outside the valid physical range.
    #[error("bad mapping: PBN {pbn} is not a valid block map page location")]
    BadMapping { pbn: u64 },

    /// No free blocks available in the scanned slab.
    #[error("no space left on device")]
    OutOfSpace,

    /// The store is in read-only mode and a write was attempted.
    #[error("read-only store")]
    ReadOnly,

    /// The on-disk data is in a format this build cannot replay
    /// (e.g. a legacy-format recovery journal, which is only usable
    /// for a read-only rebuild).
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    /// Structurally invalid on-disk data outside the journal
    /// (bad geometry, misaligned images, size mismatches).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller, carrying the string
    /// form of a `ParseError` from `loess-types`.
    #[error("parse error: {0}")]
    Parse(String),

    /// An operation was issued against a slab or journal in the wrong
    /// lifecycle state (e.g. adjusting counters on an unopened slab).
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl LoessError {
    /// Convert this error into a POSIX errno suitable for a block
    /// layer front end.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    ///
    /// Policy notes:
    /// - `CorruptJournal`, `ReferenceCountInvalid`, `BadMapping` →
    ///   `EIO`: metadata integrity failures surface as I/O errors.
    /// - `UnsupportedVersion` → `EOPNOTSUPP`: distinguishes "this
    ///   build cannot replay that" from "the data is broken".
    /// - `Format`, `Parse`, `InvalidState` → `EINVAL`.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::CorruptJournal(_) | Self::ReferenceCountInvalid(_) | Self::BadMapping { .. } => {
                libc::EIO
            }
            Self::OutOfSpace => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
            Self::UnsupportedVersion(_) => libc::EOPNOTSUPP,
            Self::Format(_) | Self::Parse(_) | Self::InvalidState(_) => libc::EINVAL,
        }
    }

    /// Whether this error must latch the whole store read-only.
    #[must_use]
    pub fn forces_read_only(&self) -> bool {
        matches!(
            self,
            Self::CorruptJournal(_) | Self::ReferenceCountInvalid(_) | Self::Io(_)
        )
    }
}

/// Result alias using `LoessError`.
pub type Result<T> = std::result::Result<T, LoessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(LoessError, libc::c_int)> = vec![
            (LoessError::Io(std::io::Error::other("test")), libc::EIO),
            (LoessError::CorruptJournal("bad header".into()), libc::EIO),
            (
                LoessError::ReferenceCountInvalid("decrement of free block".into()),
                libc::EIO,
            ),
            (LoessError::BadMapping { pbn: 9 }, libc::EIO),
            (LoessError::OutOfSpace, libc::ENOSPC),
            (LoessError::ReadOnly, libc::EROFS),
            (
                LoessError::UnsupportedVersion("legacy journal".into()),
                libc::EOPNOTSUPP,
            ),
            (LoessError::Format("unaligned image".into()), libc::EINVAL),
            (LoessError::Parse("short header".into()), libc::EINVAL),
            (LoessError::InvalidState("slab not open".into()), libc::EINVAL),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = LoessError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn read_only_policy() {
        assert!(LoessError::CorruptJournal("x".into()).forces_read_only());
        assert!(LoessError::ReferenceCountInvalid("x".into()).forces_read_only());
        assert!(LoessError::Io(std::io::Error::other("x")).forces_read_only());
        assert!(!LoessError::OutOfSpace.forces_read_only());
        assert!(!LoessError::BadMapping { pbn: 1 }.forces_read_only());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            LoessError::CorruptJournal("sector 3 torn".into()).to_string(),
            "corrupt journal: sector 3 torn"
        );
        assert_eq!(
            LoessError::BadMapping { pbn: 42 }.to_string(),
            "bad mapping: PBN 42 is not a valid block map page location"
        );
        assert_eq!(LoessError::OutOfSpace.to_string(), "no space left on device");
        assert_eq!(LoessError::ReadOnly.to_string(), "read-only store");
    }
}
