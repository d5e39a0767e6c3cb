// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// The input range exceeds the current size of the object.
    OutOfRange,
    /// Misaligned offset, non-page-multiple length, or otherwise bad input.
    InvalidArgs,
    /// The operation is invalid for this object's configuration.
    NotSupported,
    /// The object is in a state that forbids the operation, e.g. a pinned
    /// page conflicts with decommit, or the page source has been detached.
    BadState,
    /// The overwrite policy rejected existing content in the slot.
    AlreadyExists,
    /// The page or offset to replace is not present.
    NotFound,
    /// An internal allocation failed without a retry path.
    NoMemory,
    /// The operation paused; the caller must wait on the populated page
    /// request and re-invoke. Partial-progress outputs reflect precisely
    /// what was done before the wait.
    ShouldWait,
    /// A per-page counter is saturated (e.g. the pin count).
    Unavailable,
}

/// A specialized [`Result`] type for this crate.
pub type Result<T> = core::result::Result<T, Error>;
