// SPDX-License-Identifier: MPL-2.0

//! Per-page dirty tracking and the pager writeback protocol.
//!
//! Only the root of a hierarchy whose source preserves page content
//! tracks dirty state. Sparse dirty zero ranges are represented as zero
//! intervals whose start sentinel carries the length of any writeback in
//! progress; repeated writeback-begins take the maximum so that clipping
//! an interval can never lose writeback intent.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use crate::error::{Error, Result};
use crate::page::{DirtyState, VmPage};
use crate::page_list::{InsertIntervalPolicy, PlItem, VmPageOrMarker};
use crate::page_source::MultiPageRequest;
use crate::pmm::{self, PmmAllocFlags};
use crate::range::VmCowRange;
use crate::PAGE_SIZE;

use super::locking::LockedPtr;
use super::{CowPagesInner, DeferredOps, RangeChangeOp, VmCowPages};

/// Applies a dirty state transition to `page` and re-parks it in the
/// matching queue.
pub(crate) fn update_dirty_state(
    node: &Arc<VmCowPages>,
    inner: &mut CowPagesInner,
    page: &Arc<VmPage>,
    state: DirtyState,
) {
    page.set_dirty_state(state);
    if !page.is_pinned() {
        node.move_not_pinned_queue(page);
    }
    if state == DirtyState::Dirty {
        node.mark_modified_locked(inner);
    }
}

impl VmCowPages {
    /// Resolves outstanding dirty requests in `range` spuriously so that
    /// waiters retry rather than hang.
    pub(crate) fn invalidate_dirty_requests(&self, range: VmCowRange) {
        if let Some(source) = self.page_source() {
            source.on_pages_dirtied(range);
        }
    }

    /// Acknowledges a trapped dirty transition: marks the contiguous run
    /// `range` Dirty. Committed pages transition in place; zero markers
    /// and zero intervals become freshly allocated Dirty zero pages,
    /// taken from `alloc_list` when possible.
    ///
    /// Offsets with no resident content and no zero interval fail with
    /// [`Error::NotFound`]. On any early return, outstanding dirty
    /// requests covering the full range are spuriously resolved.
    pub fn dirty_pages(
        self: &Arc<Self>,
        range: VmCowRange,
        alloc_list: &mut Vec<Arc<VmPage>>,
        _request: &mut MultiPageRequest,
    ) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        if !self.is_source_preserving_page_content() || !self.should_trap_dirty_transitions() {
            return Err(Error::NotSupported);
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let result =
            self.dirty_pages_locked(locked.locked_mut(), range, alloc_list, &mut deferred);
        drop(locked);
        // Resolve the acknowledged (or abandoned) requests either way;
        // retries observe the actual page states.
        self.invalidate_dirty_requests(range);
        result
    }

    fn dirty_pages_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        range: VmCowRange,
        alloc_list: &mut Vec<Arc<VmPage>>,
        deferred: &mut DeferredOps,
    ) -> Result<()> {
        Self::check_range_locked(inner, range)?;
        // Validate the whole run first so the transition is atomic.
        let mut valid = true;
        inner.page_list.visit_range(range, |item| {
            match item {
                PlItem::Entry { entry, .. } => {
                    if !entry.is_page() && !entry.is_marker() {
                        valid = false;
                    }
                }
                PlItem::Interval { .. } => {}
                PlItem::Gap { .. } => valid = false,
            }
            if valid {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        });
        if !valid {
            return Err(Error::NotFound);
        }
        for offset in range.pages() {
            let existing = inner
                .page_list
                .lookup(offset)
                .and_then(|entry| entry.page().cloned());
            if let Some(page) = existing {
                if !page.is_dirty() {
                    update_dirty_state(self, inner, &page, DirtyState::Dirty);
                }
                continue;
            }
            // A marker or a slot inside a zero interval becomes a new
            // Dirty zero page.
            let page = match alloc_list.pop() {
                Some(page) => page,
                None => pmm::alloc_page(PmmAllocFlags::CAN_WAIT)?,
            };
            page.zero();
            page.set_dirty_state(DirtyState::Dirty);
            page.set_backlink(self, offset);
            let (slot, _) = inner
                .page_list
                .lookup_or_allocate(offset, InsertIntervalPolicy::SplitInterval)?;
            let old = slot.replace(VmPageOrMarker::Page(page.clone()));
            debug_assert!(old.is_empty() || old.is_marker());
            self.set_not_pinned_queue(&page, false);
            self.range_change_update_locked(
                inner,
                VmCowRange::new(offset, PAGE_SIZE),
                RangeChangeOp::UnmapZeroPage,
                Some(deferred),
            );
        }
        self.mark_modified_locked(inner);
        if let Some(source) = self.page_source() {
            source.on_pages_dirtied(range);
        }
        Ok(())
    }

    /// Reports contiguous runs of non-Clean pages and dirty zero
    /// intervals in `range` as `(offset, length, is_zero_range)`.
    pub fn enumerate_dirty_ranges<F>(&self, range: VmCowRange, mut f: F) -> Result<()>
    where
        F: FnMut(u64, u64, bool) -> ControlFlow<()>,
    {
        if !self.is_source_preserving_page_content() {
            return Err(Error::NotSupported);
        }
        let inner = self.inner.lock();
        Self::check_range_locked(&inner, range)?;
        let mut run: Option<VmCowRange> = None;
        let mut stopped = false;
        inner.page_list.visit_range(range, |item| {
            match item {
                PlItem::Entry { offset, entry } => {
                    let dirty = entry
                        .page()
                        .is_some_and(|page| !page.is_clean() && page.is_dirty_tracked());
                    if dirty {
                        run = Some(match run.take() {
                            Some(run) if run.end() == offset => {
                                VmCowRange::new(run.offset, run.len + PAGE_SIZE)
                            }
                            Some(done) => {
                                if f(done.offset, done.len, false).is_break() {
                                    stopped = true;
                                    return ControlFlow::Break(());
                                }
                                VmCowRange::new(offset, PAGE_SIZE)
                            }
                            None => VmCowRange::new(offset, PAGE_SIZE),
                        });
                    } else if let Some(done) = run.take()
                        && f(done.offset, done.len, false).is_break()
                    {
                        stopped = true;
                        return ControlFlow::Break(());
                    }
                }
                PlItem::Interval {
                    range: interval,
                    dirty_state,
                    ..
                } => {
                    if let Some(done) = run.take()
                        && f(done.offset, done.len, false).is_break()
                    {
                        stopped = true;
                        return ControlFlow::Break(());
                    }
                    if dirty_state != DirtyState::Untracked
                        && f(interval.offset, interval.len, true).is_break()
                    {
                        stopped = true;
                        return ControlFlow::Break(());
                    }
                }
                PlItem::Gap { .. } => {
                    if let Some(done) = run.take()
                        && f(done.offset, done.len, false).is_break()
                    {
                        stopped = true;
                        return ControlFlow::Break(());
                    }
                }
            }
            ControlFlow::Continue(())
        });
        if !stopped
            && let Some(done) = run.take()
        {
            let _ = f(done.offset, done.len, false);
        }
        Ok(())
    }

    /// Begins writeback over `range`: transitions Dirty pages (or, for
    /// `is_zero_range`, dirty zero intervals) to AwaitingClean and
    /// removes write permission from mappings. Pinned pages are skipped;
    /// their content may still change under the writeback.
    pub fn writeback_begin(self: &Arc<Self>, range: VmCowRange, is_zero_range: bool) -> Result<()> {
        if !self.is_source_preserving_page_content() {
            return Err(Error::NotSupported);
        }
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        Self::check_range_locked(inner, range)?;
        if is_zero_range {
            // Collect affected intervals, then adjust their sentinels.
            let mut intervals = Vec::new();
            inner.page_list.visit_range(range, |item| {
                if let PlItem::Interval {
                    interval_start,
                    dirty_state,
                    range: covered,
                    ..
                } = item
                    && dirty_state == DirtyState::Dirty
                {
                    intervals.push((interval_start, covered.end()));
                }
                ControlFlow::Continue(())
            });
            for (start, covered_end) in intervals {
                if start < range.offset {
                    // The writeback does not include the interval's
                    // prefix, so no progress can be recorded for it.
                    continue;
                }
                inner.page_list.set_interval_dirty_state(start, DirtyState::AwaitingClean);
                inner
                    .page_list
                    .grow_interval_awaiting_clean(start, covered_end - start);
            }
        } else {
            let mut pages = Vec::new();
            inner.page_list.for_every_page_in_range(range, |_, entry| {
                if let Some(page) = entry.page()
                    && page.is_dirty()
                    && !page.is_pinned()
                {
                    pages.push(page.clone());
                }
                ControlFlow::Continue(())
            });
            for page in pages {
                update_dirty_state(self, inner, &page, DirtyState::AwaitingClean);
            }
        }
        self.range_change_update_locked(
            inner,
            range,
            RangeChangeOp::RemoveWrite,
            Some(&mut deferred),
        );
        Ok(())
    }

    /// Ends writeback over `range`: AwaitingClean pages become Clean and
    /// intervals whose awaiting-clean extent is covered are removed (or
    /// clipped to the remainder, which stays Dirty).
    pub fn writeback_end(self: &Arc<Self>, range: VmCowRange) -> Result<()> {
        if !self.is_source_preserving_page_content() {
            return Err(Error::NotSupported);
        }
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        Self::check_range_locked(inner, range)?;
        let mut pages = Vec::new();
        let mut intervals = Vec::new();
        inner.page_list.visit_range(range, |item| {
            match item {
                PlItem::Entry { entry, .. } => {
                    if let Some(page) = entry.page()
                        && page.is_awaiting_clean()
                    {
                        pages.push(page.clone());
                    }
                }
                PlItem::Interval {
                    interval_start,
                    dirty_state,
                    awaiting_clean_len,
                    ..
                } => {
                    if dirty_state == DirtyState::AwaitingClean && interval_start >= range.offset {
                        intervals.push((interval_start, awaiting_clean_len));
                    }
                }
                PlItem::Gap { .. } => {}
            }
            ControlFlow::Continue(())
        });
        for page in pages {
            update_dirty_state(self, inner, &page, DirtyState::Clean);
        }
        for (start, awaiting_clean_len) in intervals {
            let cleaned = awaiting_clean_len.min(range.end().saturating_sub(start));
            if cleaned == 0 {
                continue;
            }
            let Some((istart, iend, _, _)) = inner.page_list.enclosing_interval(start) else {
                continue;
            };
            debug_assert_eq!(istart, start);
            if start + cleaned > iend {
                // The whole interval was written back.
                inner.page_list.clip_interval_start(start, iend + PAGE_SIZE);
            } else {
                inner.page_list.clip_interval_start(start, start + cleaned);
                inner
                    .page_list
                    .set_interval_dirty_state(start + cleaned, DirtyState::Dirty);
            }
        }
        Ok(())
    }

    /// The zero-range path for hierarchies preserving page content:
    /// committed pages are replaced in place by dirty zero intervals and
    /// untouched ranges become (or stay) zero intervals. Writes of zeroes
    /// over content that is not already dirty must be acknowledged by a
    /// trapping source first.
    pub(crate) fn zero_range_preserving_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        range: VmCowRange,
        dirty_track: bool,
        deferred: &mut DeferredOps,
        request: &mut MultiPageRequest,
        zeroed_len: &mut u64,
    ) -> Result<()> {
        let trap = dirty_track && self.should_trap_dirty_transitions();
        let state = if dirty_track {
            DirtyState::Dirty
        } else {
            DirtyState::Untracked
        };
        for offset in range.pages() {
            let in_interval = inner.page_list.is_offset_in_zero_interval(offset);
            let page = inner
                .page_list
                .lookup(offset)
                .and_then(|entry| entry.page().cloned());
            if let Some(page) = page {
                if page.is_pinned() {
                    // Cannot release the page; flush zeroes through it.
                    if dirty_track && !page.is_dirty() {
                        if trap {
                            return self.zero_dirty_request(offset, range, request, zeroed_len);
                        }
                        update_dirty_state(self, inner, &page, DirtyState::Dirty);
                    }
                    page.zero();
                } else {
                    if dirty_track && !page.is_dirty() && trap {
                        return self.zero_dirty_request(offset, range, request, zeroed_len);
                    }
                    let old = inner.page_list.replace_page_with_zero_interval(offset, state);
                    Self::stage_removed_entry(old, deferred);
                }
            } else if in_interval {
                // Already zero; dirtiness only ever grows, so leave it.
            } else if inner
                .page_list
                .lookup(offset)
                .is_some_and(|entry| entry.is_marker())
            {
                // A clean zero becoming a tracked zero carries no new
                // content, only writeback intent.
                let _ = inner.page_list.remove_content(offset);
                inner.page_list.return_interval_slot(offset, state);
            } else {
                // Unsupplied content becomes zero. This changes what the
                // source will eventually read back, so it traps like any
                // other write.
                if trap {
                    return self.zero_dirty_request(offset, range, request, zeroed_len);
                }
                inner.page_list.return_interval_slot(offset, state);
            }
            *zeroed_len = offset + PAGE_SIZE - range.offset;
        }
        self.range_change_update_locked(inner, range, RangeChangeOp::Unmap, Some(deferred));
        self.mark_modified_locked(inner);
        Ok(())
    }

    fn zero_dirty_request(
        &self,
        offset: u64,
        range: VmCowRange,
        request: &mut MultiPageRequest,
        zeroed_len: &mut u64,
    ) -> Result<()> {
        *zeroed_len = offset - range.offset;
        let source = self.page_source().ok_or(Error::BadState)?;
        source.request_dirty_transition(
            VmCowRange::new(offset, range.end() - offset),
            request.dirty_request(),
        )?;
        Err(Error::ShouldWait)
    }
}
