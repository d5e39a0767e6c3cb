// SPDX-License-Identifier: MPL-2.0

//! Content entries stored in page list slots.

use alloc::sync::Arc;

use crate::compression::CompressedRef;
use crate::page::{DirtyState, VmPage};

/// The content of one page-sized slot.
///
/// A slot is exactly one of the following. Sparse zero regions are bounded
/// by `IntervalStart`/`IntervalEnd` sentinel pairs (or a standalone
/// `IntervalSlot` for a single page); nothing but `Empty` may lie strictly
/// between a sentinel pair, and both sentinels carry the same dirty state.
pub enum VmPageOrMarker {
    /// No stored content.
    Empty,
    /// An explicit clean zero page; occupies the slot without a frame.
    Marker,
    /// A physical page attributed to the node holding this slot.
    Page(Arc<VmPage>),
    /// A compressed surrogate for a page. The compressor owns the bytes;
    /// the share count of compressed content lives in the compressor's
    /// metadata sidecar.
    Reference(CompressedRef),
    /// Some ancestor may have content for this offset; walk up to find it.
    /// Only present in leaf nodes of trees that use parent content
    /// markers, where an `Empty` slot instead means definitively zero.
    ParentContent,
    /// First page of a sparse zero interval.
    IntervalStart {
        dirty_state: DirtyState,
        /// Length of the prefix of the interval with a writeback in
        /// progress. Readers take the maximum over repeated
        /// writeback-begins so that clipping cannot lose writeback intent.
        awaiting_clean_len: u64,
    },
    /// Last page of a sparse zero interval.
    IntervalEnd { dirty_state: DirtyState },
    /// A single-page zero interval.
    IntervalSlot {
        dirty_state: DirtyState,
        awaiting_clean_len: u64,
    },
}

impl VmPageOrMarker {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Marker)
    }

    pub fn is_page(&self) -> bool {
        matches!(self, Self::Page(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    pub fn is_parent_content(&self) -> bool {
        matches!(self, Self::ParentContent)
    }

    pub fn is_interval_start(&self) -> bool {
        matches!(self, Self::IntervalStart { .. })
    }

    pub fn is_interval_end(&self) -> bool {
        matches!(self, Self::IntervalEnd { .. })
    }

    pub fn is_interval_slot(&self) -> bool {
        matches!(self, Self::IntervalSlot { .. })
    }

    /// Whether this entry is any zero interval sentinel.
    pub fn is_interval_zero(&self) -> bool {
        self.is_interval_start() || self.is_interval_end() || self.is_interval_slot()
    }

    /// Whether this entry holds content, as opposed to being empty or a
    /// placeholder that resolves through an ancestor.
    pub fn is_content(&self) -> bool {
        !self.is_empty() && !self.is_parent_content()
    }

    pub fn page(&self) -> Option<&Arc<VmPage>> {
        match self {
            Self::Page(page) => Some(page),
            _ => None,
        }
    }

    pub fn reference(&self) -> Option<CompressedRef> {
        match self {
            Self::Reference(reference) => Some(*reference),
            _ => None,
        }
    }

    /// The dirty state of an interval sentinel.
    pub fn interval_dirty_state(&self) -> Option<DirtyState> {
        match self {
            Self::IntervalStart { dirty_state, .. }
            | Self::IntervalEnd { dirty_state }
            | Self::IntervalSlot { dirty_state, .. } => Some(*dirty_state),
            _ => None,
        }
    }

    /// The awaiting-clean length carried by a start or slot sentinel.
    pub fn awaiting_clean_len(&self) -> u64 {
        match self {
            Self::IntervalStart {
                awaiting_clean_len, ..
            }
            | Self::IntervalSlot {
                awaiting_clean_len, ..
            } => *awaiting_clean_len,
            _ => 0,
        }
    }

    /// Raises the awaiting-clean length to at least `len`.
    pub fn grow_awaiting_clean_len(&mut self, len: u64) {
        match self {
            Self::IntervalStart {
                awaiting_clean_len, ..
            }
            | Self::IntervalSlot {
                awaiting_clean_len, ..
            } => *awaiting_clean_len = (*awaiting_clean_len).max(len),
            _ => debug_assert!(false, "not an interval start"),
        }
    }

    pub fn set_interval_dirty_state(&mut self, state: DirtyState) {
        match self {
            Self::IntervalStart { dirty_state, .. }
            | Self::IntervalEnd { dirty_state }
            | Self::IntervalSlot { dirty_state, .. } => *dirty_state = state,
            _ => debug_assert!(false, "not an interval sentinel"),
        }
    }

    /// Takes the entry out of the slot, leaving `Empty` behind.
    pub fn take(&mut self) -> VmPageOrMarker {
        core::mem::replace(self, Self::Empty)
    }

    /// Replaces the entry, returning the previous one.
    pub fn replace(&mut self, new: VmPageOrMarker) -> VmPageOrMarker {
        core::mem::replace(self, new)
    }
}

impl core::fmt::Debug for VmPageOrMarker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Marker => write!(f, "Marker"),
            Self::Page(page) => write!(f, "Page({:#x})", page.paddr()),
            Self::Reference(reference) => write!(f, "Reference({:#x})", reference.0),
            Self::ParentContent => write!(f, "ParentContent"),
            Self::IntervalStart {
                dirty_state,
                awaiting_clean_len,
            } => write!(f, "IntervalStart({dirty_state:?}, {awaiting_clean_len:#x})"),
            Self::IntervalEnd { dirty_state } => write!(f, "IntervalEnd({dirty_state:?})"),
            Self::IntervalSlot { dirty_state, .. } => write!(f, "IntervalSlot({dirty_state:?})"),
        }
    }
}
