// SPDX-License-Identifier: MPL-2.0

//! Reclamation: eviction, compression, discard and loaned page
//! replacement.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use crate::compression::{CompressionResult, VmCompressor};
use crate::error::{Error, Result};
use crate::page::VmPage;
use crate::page_list::VmPageOrMarker;
use crate::page_source::MultiPageRequest;
use crate::pmm;
use crate::range::VmCowRange;
use crate::PAGE_SIZE;

use super::locking::LockedPtr;
use super::lookup::LookupCursor;
use super::{CowPagesInner, DeferredOps, RangeChangeOp, VmCowPages};

/// How aggressively a reclamation attempt treats hints.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvictionAction {
    /// Respect `always_need` and high-priority hints.
    FollowHints,
    /// Reclaim despite hints. Dirty, pinned and non-Clean pages are still
    /// refused; this never forces a writeback.
    IgnoreHints,
}

/// What a reclamation call achieved, for the caller's statistics.
#[derive(Clone, Copy, Default, Debug)]
pub struct ReclaimCounts {
    pub evicted: u64,
    pub compressed: u64,
    pub discarded: u64,
}

impl VmCowPages {
    /// Attempts to reclaim `page`, believed to live in this node at
    /// `offset`. Dispatches by policy: pager-backed roots evict,
    /// discardable nodes discard (when `page` is their first page), and
    /// anonymous nodes compress when a compressor is supplied.
    ///
    /// A refused page stays attributed exactly where it was and is marked
    /// accessed so it is not immediately retried.
    pub fn reclaim_page(
        self: &Arc<Self>,
        page: &Arc<VmPage>,
        offset: u64,
        action: EvictionAction,
        compressor: Option<&dyn VmCompressor>,
    ) -> ReclaimCounts {
        if self.is_source_preserving_page_content() {
            return self.reclaim_by_eviction(page, offset, action);
        }
        if self.is_discardable() {
            return self.reclaim_discardable(page, offset);
        }
        if let Some(compressor) = compressor
            && !self.root_has_page_source()
            && self.can_decommit_zero_pages()
        {
            return self.reclaim_by_compression(page, offset, compressor);
        }
        pmm::page_queues().mark_accessed(page);
        ReclaimCounts::default()
    }

    /// Common gates for reclaiming a specific page of this node.
    fn can_reclaim_page_locked(
        self: &Arc<Self>,
        inner: &CowPagesInner,
        page: &Arc<VmPage>,
        offset: u64,
        action: EvictionAction,
    ) -> bool {
        let resident = inner
            .page_list
            .lookup(offset)
            .and_then(|entry| entry.page())
            .is_some_and(|slot_page| Arc::ptr_eq(slot_page, page));
        if !resident || page.is_pinned() {
            return false;
        }
        if action == EvictionAction::FollowHints {
            if page.always_need() {
                return false;
            }
            if inner.high_priority_count > 0 {
                return false;
            }
        }
        true
    }

    fn reclaim_by_eviction(
        self: &Arc<Self>,
        page: &Arc<VmPage>,
        offset: u64,
        action: EvictionAction,
    ) -> ReclaimCounts {
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        if !self.can_reclaim_page_locked(inner, page, offset, action) || !page.is_clean() {
            pmm::page_queues().mark_accessed(page);
            return ReclaimCounts::default();
        }
        // Unmap with accessed-bit harvesting; a page touched since the
        // candidate was chosen survives this round.
        pmm::page_queues().clear_accessed(page);
        self.range_change_update_locked(
            inner,
            VmCowRange::new(offset, PAGE_SIZE),
            RangeChangeOp::UnmapAndHarvest,
            Some(&mut deferred),
        );
        if page.is_accessed() {
            return ReclaimCounts::default();
        }
        self.remove_page_locked(inner, offset, &mut deferred);
        inner.reclamation_event_count += 1;
        ReclaimCounts {
            evicted: 1,
            ..Default::default()
        }
    }

    fn reclaim_by_compression(
        self: &Arc<Self>,
        page: &Arc<VmPage>,
        offset: u64,
        compressor: &dyn VmCompressor,
    ) -> ReclaimCounts {
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        {
            let inner = locked.locked_mut();
            if !self.can_reclaim_page_locked(inner, page, offset, EvictionAction::FollowHints) {
                pmm::page_queues().mark_accessed(page);
                return ReclaimCounts::default();
            }
            pmm::page_queues().clear_accessed(page);
            self.range_change_update_locked(
                inner,
                VmCowRange::new(offset, PAGE_SIZE),
                RangeChangeOp::UnmapAndHarvest,
                Some(&mut deferred),
            );
            if page.is_accessed() {
                return ReclaimCounts::default();
            }
            if compressor.arm().is_err() {
                return ReclaimCounts::default();
            }
            // Swap the page for a temporary reference while compression
            // runs without the lock held.
            let temp = compressor.start(page.clone(), page.share_count());
            let Some(slot) = inner.page_list.lookup_mut(offset) else {
                compressor.finalize();
                return ReclaimCounts::default();
            };
            let old = slot.replace(VmPageOrMarker::Reference(temp));
            debug_assert!(old.is_page());
            pmm::page_queues().remove(page);
        }
        locked.release();
        compressor.compress();
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        let result = compressor.take_compression_result();
        // Reconcile: the slot may have been touched while unlocked.
        let still_temp = inner
            .page_list
            .lookup(offset)
            .and_then(|entry| entry.reference())
            .is_some_and(|reference| compressor.is_temp_reference(reference));
        let counts = if still_temp {
            match result {
                CompressionResult::Reference(reference) => {
                    let slot = inner.page_list.lookup_mut(offset).unwrap();
                    *slot = VmPageOrMarker::Reference(reference);
                    page.clear_backlink();
                    deferred.freed_list().append(page.clone());
                    inner.reclamation_event_count += 1;
                    ReclaimCounts {
                        compressed: 1,
                        ..Default::default()
                    }
                }
                CompressionResult::Zero => {
                    // Zero content needs no storage at all: an empty slot
                    // in a marker tree, an explicit marker elsewhere.
                    if self.node_has_parent_content_markers() || inner.parent.is_none() {
                        let _ = inner.page_list.remove_content(offset);
                    } else {
                        let slot = inner.page_list.lookup_mut(offset).unwrap();
                        *slot = VmPageOrMarker::Marker;
                    }
                    page.clear_backlink();
                    deferred.freed_list().append(page.clone());
                    inner.reclamation_event_count += 1;
                    ReclaimCounts {
                        compressed: 1,
                        ..Default::default()
                    }
                }
                CompressionResult::Fail { src_page } => {
                    debug_assert!(Arc::ptr_eq(&src_page, page));
                    let slot = inner.page_list.lookup_mut(offset).unwrap();
                    *slot = VmPageOrMarker::Page(src_page.clone());
                    src_page.set_backlink(self, offset);
                    self.set_not_pinned_queue(&src_page, false);
                    pmm::page_queues().mark_accessed(&src_page);
                    ReclaimCounts::default()
                }
            }
        } else {
            // Raced with another operation; throw the result away and
            // leave the node alone.
            match result {
                CompressionResult::Reference(reference) => compressor.free_reference(reference),
                CompressionResult::Fail { src_page } => {
                    let _ = src_page;
                }
                CompressionResult::Zero => {}
            }
            ReclaimCounts::default()
        };
        compressor.finalize();
        counts
    }

    fn reclaim_discardable(self: &Arc<Self>, page: &Arc<VmPage>, offset: u64) -> ReclaimCounts {
        let tracker = self.discardable_tracker().expect("discardable node");
        if !tracker.is_eligible_for_reclamation() {
            pmm::page_queues().mark_accessed(page);
            return ReclaimCounts::default();
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        // Only a reclamation attempt against the first page discards, so
        // that one object is not discarded piecemeal by several racing
        // attempts.
        let first = inner.page_list.first_page_offset();
        if first != Some(offset)
            || !inner
                .page_list
                .lookup(offset)
                .and_then(|entry| entry.page())
                .is_some_and(|slot_page| Arc::ptr_eq(slot_page, page))
        {
            pmm::page_queues().mark_accessed(page);
            return ReclaimCounts::default();
        }
        let size = inner.size;
        let mut released = Vec::new();
        inner
            .page_list
            .remove_content_in_range(VmCowRange::new(0, size), |_, entry| released.push(entry));
        let mut discarded = 0;
        for entry in released {
            if entry.is_page() {
                discarded += 1;
            }
            Self::stage_removed_entry(entry, &mut deferred);
        }
        self.range_change_update_locked(
            inner,
            VmCowRange::new(0, size),
            RangeChangeOp::Unmap,
            Some(&mut deferred),
        );
        inner.reclamation_event_count += 1;
        tracker.set_discarded();
        log::debug!("discarded {discarded} pages");
        ReclaimCounts {
            discarded,
            ..Default::default()
        }
    }

    /// Replaces the page at `offset` with a loaned one, when its state
    /// permits borrowing.
    pub fn replace_page_with_loaned(
        self: &Arc<Self>,
        before: &Arc<VmPage>,
        offset: u64,
    ) -> Result<Arc<VmPage>> {
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let result =
            self.replace_page_locked(locked.locked_mut(), before, offset, true, &mut deferred);
        drop(locked);
        result
    }

    /// Replaces every loaned page in `range` with a normally allocated
    /// one, returning how many were replaced.
    pub fn replace_pages_with_non_loaned(self: &Arc<Self>, range: VmCowRange) -> Result<u64> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        Self::check_range_locked(inner, range)?;
        let mut loaned = Vec::new();
        inner.page_list.for_every_page_in_range(range, |offset, entry| {
            if let Some(page) = entry.page()
                && page.is_loaned()
            {
                loaned.push((offset, page.clone()));
            }
            ControlFlow::Continue(())
        });
        let mut replaced = 0;
        for (offset, page) in loaned {
            self.replace_page_locked(inner, &page, offset, false, &mut deferred)?;
            replaced += 1;
        }
        Ok(replaced)
    }

    /// Replaces an all-zero committed page with the cheapest zero
    /// representation. Returns whether the dedup happened.
    pub fn dedup_zero_page(self: &Arc<Self>, page: &Arc<VmPage>, offset: u64) -> bool {
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        let resident = inner
            .page_list
            .lookup(offset)
            .and_then(|entry| entry.page())
            .is_some_and(|slot_page| Arc::ptr_eq(slot_page, page));
        if !resident
            || page.is_pinned()
            || page.is_loaned()
            || page.is_dirty()
            || page.is_awaiting_clean()
            || self.is_source_preserving_page_content()
        {
            return false;
        }
        if !page.is_all_zeroes() {
            return false;
        }
        if self.node_has_parent_content_markers() || inner.parent.is_none() {
            let _ = inner.page_list.remove_content(offset);
        } else {
            let slot = inner.page_list.lookup_mut(offset).unwrap();
            *slot = VmPageOrMarker::Marker;
        }
        pmm::page_queues().remove(page);
        page.clear_backlink();
        deferred.freed_list().append(page.clone());
        self.range_change_update_locked(
            inner,
            VmCowRange::new(offset, PAGE_SIZE),
            RangeChangeOp::UnmapZeroPage,
            Some(&mut deferred),
        );
        true
    }

    /// Hints that `range` is a good reclamation candidate by clearing the
    /// accessed state of its resident pages.
    pub fn promote_range_for_reclamation(self: &Arc<Self>, range: VmCowRange) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        let inner = self.inner.lock();
        Self::check_range_locked(&inner, range)?;
        inner.page_list.for_every_page_in_range(range, |_, entry| {
            if let Some(page) = entry.page() {
                pmm::page_queues().clear_accessed(page);
            }
            ControlFlow::Continue(())
        });
        Ok(())
    }

    /// Commits `range` and marks its pages as always needed (or clears
    /// the hint), shielding them from hint-respecting reclamation.
    pub fn protect_range_from_reclamation(
        self: &Arc<Self>,
        range: VmCowRange,
        set_always_need: bool,
        request: &mut MultiPageRequest,
    ) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        if range.is_empty() {
            return Ok(());
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        Self::check_range_locked(inner, range)?;
        let mut cursor = LookupCursor::new(self, inner, range);
        while cursor.offset() < range.end() {
            let remaining = (range.end() - cursor.offset()) / PAGE_SIZE;
            let result = cursor.require_owned_page(false, remaining, &mut deferred, request)?;
            result.page.set_always_need(set_always_need);
        }
        Ok(())
    }

    /// Eagerly turns compressed references in `range` back into pages.
    pub fn decompress_in_range(self: &Arc<Self>, range: VmCowRange) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        let compressor = match crate::compression::active_compressor() {
            Some(compressor) => compressor,
            None => return Ok(()),
        };
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        Self::check_range_locked(inner, range)?;
        let mut references = Vec::new();
        inner.page_list.for_every_page_in_range(range, |offset, entry| {
            if entry.is_reference() {
                references.push(offset);
            }
            ControlFlow::Continue(())
        });
        for offset in references {
            let Some(reference) = inner
                .page_list
                .lookup(offset)
                .and_then(|entry| entry.reference())
            else {
                continue;
            };
            let page = pmm::alloc_page(self.pmm_alloc_flags)?;
            if let Some((src_page, metadata)) = compressor.move_reference(reference) {
                page.copy_contents_from(&src_page);
                page.set_share_count(metadata);
                pmm::free_page(src_page);
            } else {
                page.set_share_count(compressor.metadata(reference));
                compressor.decompress(reference, &page);
            }
            page.set_backlink(self, offset);
            let slot = inner.page_list.lookup_mut(offset).unwrap();
            *slot = VmPageOrMarker::Page(page.clone());
            self.set_not_pinned_queue(&page, false);
        }
        Ok(())
    }
}
