// SPDX-License-Identifier: MPL-2.0

//! Range operations on a node: resize, commit, pin, decommit, zero,
//! lookup, page transfer and byte-level access.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use align_ext::AlignExt;

use crate::error::{Error, Result};
use crate::page::{DirtyState, Paddr, VmPage};
use crate::page_list::{InsertIntervalPolicy, PlItem, VmPageOrMarker};
use crate::page_source::{MultiPageRequest, PageSource};
use crate::pmm::{self, queues::PageQueue};
use crate::range::VmCowRange;
use crate::PAGE_SIZE;

use super::hierarchy;
use super::locking::LockedPtr;
use super::lookup::LookupCursor;
use super::{
    CanOverwriteContent, CowPagesInner, DeferredOps, LifeCycle, RangeChangeOp, VmCowPages,
    VmPageSpliceList,
};

/// How supplied pages interact with existing content.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SupplyOptions {
    /// Pager supply: offsets that already have content keep it and the
    /// supplied page is released.
    PagerSupply,
    /// Data transfer: supplied content overwrites existing non-pinned
    /// content.
    TransferData,
}

impl VmCowPages {
    pub(super) fn check_range_locked(inner: &CowPagesInner, range: VmCowRange) -> Result<()> {
        if inner.life_cycle != LifeCycle::Alive {
            return Err(Error::BadState);
        }
        if !range.is_bounded_by(inner.size) {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }

    /// Changes the size of this node.
    ///
    /// Growing extends the range with zero content; when the page source
    /// preserves content the new range becomes a Dirty zero interval.
    /// Shrinking refuses if the vanishing range holds pinned pages,
    /// spuriously resolves pending pager requests there, releases the
    /// content and clamps every child's parent limit so a later re-grow
    /// cannot expose stale content.
    pub fn resize(self: &Arc<Self>, new_size: u64) -> Result<()> {
        if new_size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let children = {
            let inner = locked.locked_mut();
            if inner.life_cycle != LifeCycle::Alive {
                return Err(Error::BadState);
            }
            let old_size = inner.size;
            if new_size == old_size {
                return Ok(());
            }
            if new_size > old_size {
                inner
                    .root_parent_offset
                    .checked_add(new_size)
                    .ok_or(Error::InvalidArgs)?;
                if self.is_source_preserving_page_content() {
                    inner.page_list.add_zero_interval(
                        VmCowRange::new(old_size, new_size - old_size),
                        DirtyState::Dirty,
                    )?;
                }
                inner.size = new_size;
                self.mark_modified_locked(inner);
                Vec::new()
            } else {
                let removed = VmCowRange::new(new_size, old_size - new_size);
                if Self::any_pages_pinned_locked(inner, removed) {
                    return Err(Error::BadState);
                }
                if let Some(source) = &self.page_source {
                    // Resolve outstanding requests in the vanishing range
                    // spuriously; retries will observe the new size.
                    source.on_pages_supplied(removed);
                    source.on_pages_dirtied(removed);
                }
                hierarchy::release_ancestor_views(self, inner, removed, deferred.freed_list());
                let mut released = Vec::new();
                inner
                    .page_list
                    .remove_content_in_range(removed, |_, entry| released.push(entry));
                for entry in released {
                    Self::stage_removed_entry(entry, &mut deferred);
                }
                inner.parent_limit = inner.parent_limit.min(new_size);
                self.range_change_update_locked(inner, removed, RangeChangeOp::Unmap, Some(&mut deferred));
                inner.size = new_size;
                self.mark_modified_locked(inner);
                Self::children_locked(inner)
            }
        };
        drop(locked);
        // Descendants must never see beyond the new size, even across a
        // later re-grow. For pager hierarchies the hierarchy lock held by
        // `deferred` keeps this update atomic with the resize.
        for child in children {
            let mut child_locked = LockedPtr::lock(&child);
            let child_inner = child_locked.locked_mut();
            if child_inner
                .parent
                .as_ref()
                .is_some_and(|parent| Arc::ptr_eq(parent, self))
            {
                let visible = new_size.saturating_sub(child_inner.parent_offset);
                child_inner.parent_limit = child_inner.parent_limit.min(visible);
            }
        }
        Ok(())
    }

    pub(super) fn stage_removed_entry(entry: VmPageOrMarker, deferred: &mut DeferredOps) {
        match entry {
            VmPageOrMarker::Page(page) => {
                pmm::page_queues().remove(&page);
                page.clear_backlink();
                deferred.freed_list().append(page);
            }
            VmPageOrMarker::Marker => {}
            entry => deferred.freed_list().append_content(entry),
        }
    }

    /// Commits owned pages over `range`, best effort. On
    /// [`Error::ShouldWait`] the populated request must be waited on and
    /// the call retried; `committed_len` reports the completed prefix.
    pub fn commit_range(
        self: &Arc<Self>,
        range: VmCowRange,
        committed_len: &mut u64,
        request: &mut MultiPageRequest,
    ) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        *committed_len = 0;
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
            match cursor.require_owned_page(false, remaining, &mut deferred, request) {
                Ok(_) => *committed_len = cursor.offset() - range.offset,
                Err(error) => {
                    *committed_len = cursor.offset() - range.offset;
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Pins every page of `range`, all or nothing. The range must be
    /// fully committed; a gap or marker fails with [`Error::BadState`]
    /// and a saturated pin count with [`Error::Unavailable`].
    pub fn pin_range(self: &Arc<Self>, range: VmCowRange) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        if range.is_empty() {
            return Ok(());
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let result = self.pin_range_locked(locked.locked_mut(), range, &mut deferred);
        drop(locked);
        result
    }

    fn pin_range_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        range: VmCowRange,
        deferred: &mut DeferredOps,
    ) -> Result<()> {
        Self::check_range_locked(inner, range)?;
        let mut pinned = Vec::new();
        let mut fail = None;
        for offset in range.pages() {
            let page = match inner.page_list.lookup(offset).and_then(|entry| entry.page()) {
                Some(page) => page.clone(),
                None => {
                    fail = Some(Error::BadState);
                    break;
                }
            };
            let page = if page.is_loaned() {
                // Pinned pages may never be loaned.
                match self.replace_page_locked(inner, &page, offset, false, deferred) {
                    Ok(page) => page,
                    Err(error) => {
                        fail = Some(error);
                        break;
                    }
                }
            } else {
                page
            };
            if let Err(error) = page.pin() {
                fail = Some(error);
                break;
            }
            if page.pin_count() == 1 {
                pmm::page_queues().move_to(&page, PageQueue::Wired);
            }
            inner.pinned_page_count += 1;
            pinned.push(page);
        }
        if let Some(error) = fail {
            for page in pinned {
                if page.unpin() == 0 {
                    self.move_not_pinned_queue(&page);
                }
                inner.pinned_page_count -= 1;
            }
            return Err(error);
        }
        inner.ever_pinned = true;
        Ok(())
    }

    /// Releases pins previously taken over `range`. Unpinning a page that
    /// is not pinned is a programming error.
    pub fn unpin_range(self: &Arc<Self>, range: VmCowRange) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        {
            let inner = locked.locked_mut();
            Self::check_range_locked(inner, range)?;
            for offset in range.pages() {
                let page = inner
                    .page_list
                    .lookup(offset)
                    .and_then(|entry| entry.page())
                    .expect("unpin of uncommitted offset");
                if page.unpin() == 0 {
                    self.move_not_pinned_queue(page);
                }
                assert!(inner.pinned_page_count > 0);
                inner.pinned_page_count -= 1;
            }
            self.range_change_update_locked(
                inner,
                range,
                RangeChangeOp::DebugUnpin,
                Some(&mut deferred),
            );
        }
        drop(locked);
        Ok(())
    }

    /// Frees the committed pages of `range`, returning how many pages
    /// were released. Only legal on a parentless node whose content is
    /// not preserved by a source.
    pub fn decommit_range(self: &Arc<Self>, range: VmCowRange) -> Result<u64> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        if inner.parent.is_some() || self.is_source_preserving_page_content() {
            return Err(Error::NotSupported);
        }
        Self::check_range_locked(inner, range)?;
        if Self::any_pages_pinned_locked(inner, range) {
            return Err(Error::BadState);
        }
        let mut released = Vec::new();
        inner
            .page_list
            .remove_content_in_range(range, |_, entry| released.push(entry));
        let mut freed = 0;
        for entry in released {
            if entry.is_page() {
                freed += 1;
            }
            Self::stage_removed_entry(entry, &mut deferred);
        }
        self.range_change_update_locked(inner, range, RangeChangeOp::Unmap, Some(&mut deferred));
        Ok(freed)
    }

    /// Makes `range` read as zero, choosing the cheapest representation
    /// per page: dropping slots, consuming placeholders, inserting
    /// markers, or zeroing in place where pins or configuration demand
    /// it. Hierarchies preserving page content get dirty zero intervals
    /// instead; see the dirty tracking module.
    ///
    /// On an early return `zeroed_len` carries the prefix that already
    /// reads as zero.
    pub fn zero_range(
        self: &Arc<Self>,
        range: VmCowRange,
        dirty_track: bool,
        zeroed_len: &mut u64,
        request: &mut MultiPageRequest,
    ) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        *zeroed_len = 0;
        if range.is_empty() {
            return Ok(());
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        Self::check_range_locked(inner, range)?;
        if self.is_source_preserving_page_content() {
            return self.zero_range_preserving_locked(
                inner,
                range,
                dirty_track,
                &mut deferred,
                request,
                zeroed_len,
            );
        }
        self.zero_range_anonymous_locked(inner, range, &mut deferred, zeroed_len)
    }

    fn zero_range_anonymous_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        range: VmCowRange,
        deferred: &mut DeferredOps,
        zeroed_len: &mut u64,
    ) -> Result<()> {
        let marker_tree = self.tree_has_parent_content_markers();
        for offset in range.pages() {
            let entry_kind = inner.page_list.lookup(offset).map(|entry| match entry {
                VmPageOrMarker::Page(page) => {
                    if page.is_pinned() {
                        0u8
                    } else {
                        1
                    }
                }
                VmPageOrMarker::Reference(_) => 1,
                VmPageOrMarker::Marker => 2,
                VmPageOrMarker::ParentContent => 3,
                _ => 4,
            });
            match entry_kind {
                Some(0) => {
                    // Pinned pages cannot be decommitted; zero in place.
                    let page = inner
                        .page_list
                        .lookup(offset)
                        .and_then(|entry| entry.page())
                        .unwrap()
                        .clone();
                    page.zero();
                }
                Some(1) => {
                    if marker_tree || !self.can_decommit_zero_pages() {
                        if !self.can_decommit_zero_pages() {
                            // Keep the slot committed; flush zeroes into
                            // the existing page.
                            let page = inner
                                .page_list
                                .lookup(offset)
                                .and_then(|entry| entry.page())
                                .unwrap()
                                .clone();
                            page.zero();
                        } else {
                            let entry = inner.page_list.remove_content(offset);
                            Self::stage_removed_entry(entry, deferred);
                        }
                    } else {
                        // A pager-hierarchy leaf: absence means the
                        // parent shows through, so an explicit clean zero
                        // marker is needed.
                        let entry = inner.page_list.remove_content(offset);
                        Self::stage_removed_entry(entry, deferred);
                        let (slot, _) = inner
                            .page_list
                            .lookup_or_allocate(offset, InsertIntervalPolicy::NoIntervals)?;
                        *slot = VmPageOrMarker::Marker;
                    }
                }
                Some(2) => {}
                Some(3) => {
                    // Consume the placeholder: the ancestor loses one
                    // viewer and the slot becomes definitively zero.
                    hierarchy::release_ancestor_views(
                        self,
                        inner,
                        VmCowRange::new(offset, PAGE_SIZE),
                        deferred.freed_list(),
                    );
                    let _ = inner.page_list.remove_content(offset);
                }
                Some(4) => debug_assert!(false, "interval in a non-preserving node"),
                Some(_) => unreachable!("entry_kind only produces values 0..=4"),
                None => {
                    if !marker_tree && inner.can_see_parent(offset) {
                        let sees_content = {
                            let lookup =
                                hierarchy::find_page_content(self, inner, offset, PAGE_SIZE);
                            lookup.owner.is_some()
                                && lookup
                                    .owner
                                    .locked()
                                    .page_list
                                    .lookup(lookup.owner_offset)
                                    .is_some_and(|entry| entry.is_content())
                        };
                        if sees_content {
                            let (slot, _) = inner
                                .page_list
                                .lookup_or_allocate(offset, InsertIntervalPolicy::NoIntervals)?;
                            *slot = VmPageOrMarker::Marker;
                        }
                    }
                }
            }
            *zeroed_len = offset + PAGE_SIZE - range.offset;
        }
        self.range_change_update_locked(inner, range, RangeChangeOp::Unmap, Some(deferred));
        Ok(())
    }

    /// Invokes `f` with each committed page of `range` in this node only,
    /// without walking the hierarchy.
    pub fn lookup_range<F>(&self, range: VmCowRange, mut f: F) -> Result<()>
    where
        F: FnMut(u64, Paddr) -> ControlFlow<()>,
    {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        let inner = self.inner.lock();
        Self::check_range_locked(&inner, range)?;
        inner.page_list.for_every_page_in_range(range, |offset, entry| {
            if let Some(page) = entry.page() {
                f(offset, page.paddr())
            } else {
                ControlFlow::Continue(())
            }
        });
        Ok(())
    }

    /// Invokes `f` with every readable page of `range`, walking ancestors
    /// and reporting offsets as they appear in this node.
    pub fn lookup_readable<F>(self: &Arc<Self>, range: VmCowRange, mut f: F) -> Result<()>
    where
        F: FnMut(u64, Paddr) -> ControlFlow<()>,
    {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        let inner = self.inner.lock();
        Self::check_range_locked(&inner, range)?;
        // Worklist of (range in current level, level offset - target
        // offset) segments, advanced one ancestor at a time.
        let mut stopped = false;
        let mut level_ranges: Vec<(VmCowRange, u64)> = alloc::vec![(range, 0)];
        let mut level = LockedPtr::none();
        loop {
            let node = level.node_or(self);
            let level_inner = level.locked_or(&inner);
            let markers = node.node_has_parent_content_markers();
            let mut up = Vec::new();
            for (seg, delta) in &level_ranges {
                level_inner.page_list.visit_range(*seg, |item| {
                    match item {
                        PlItem::Entry { offset, entry } => {
                            if let Some(page) = entry.page() {
                                if f(offset - delta, page.paddr()).is_break() {
                                    stopped = true;
                                    return ControlFlow::Break(());
                                }
                            } else if entry.is_parent_content() {
                                up.push((VmCowRange::new(offset, PAGE_SIZE), *delta));
                            }
                        }
                        PlItem::Gap { range } => {
                            if !markers {
                                up.push((range, *delta));
                            }
                        }
                        PlItem::Interval { .. } => {}
                    }
                    ControlFlow::Continue(())
                });
                if stopped {
                    return Ok(());
                }
            }
            if up.is_empty() || level_inner.parent.is_none() {
                return Ok(());
            }
            let window = VmCowRange::new(0, level_inner.parent_limit);
            let parent_offset = level_inner.parent_offset;
            let parent = level_inner.parent.clone().unwrap();
            level_ranges = up
                .into_iter()
                .filter_map(|(seg, delta)| {
                    let clipped = seg.intersect(window);
                    if clipped.is_empty() {
                        None
                    } else {
                        Some((clipped.offset_by(parent_offset), delta + parent_offset))
                    }
                })
                .collect();
            if level_ranges.is_empty() {
                return Ok(());
            }
            let next = LockedPtr::lock(&parent);
            level = next;
        }
    }

    /// Moves the content of `range` out into `splice` for a cross-object
    /// transfer, leaving the range zero. Only legal on a parentless
    /// anonymous node.
    pub fn take_pages(
        self: &Arc<Self>,
        range: VmCowRange,
        splice: &mut VmPageSpliceList,
        taken_len: &mut u64,
        _request: &mut MultiPageRequest,
    ) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        *taken_len = 0;
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        if self.root_has_page_source() || inner.parent.is_some() {
            return Err(Error::NotSupported);
        }
        Self::check_range_locked(inner, range)?;
        if Self::any_pages_pinned_locked(inner, range) {
            return Err(Error::BadState);
        }
        for offset in range.pages() {
            let entry = inner.page_list.remove_content(offset);
            match entry {
                VmPageOrMarker::Page(page) => {
                    pmm::page_queues().remove(&page);
                    page.clear_backlink();
                    splice.append(VmPageOrMarker::Page(page));
                }
                VmPageOrMarker::Empty => splice.append(VmPageOrMarker::Empty),
                entry => splice.append(entry),
            }
        }
        self.range_change_update_locked(inner, range, RangeChangeOp::Unmap, Some(&mut deferred));
        *taken_len = range.len;
        Ok(())
    }

    /// Installs pages from `splice` into `range`. With
    /// [`SupplyOptions::PagerSupply`] existing content wins and the
    /// supplied page is released; with [`SupplyOptions::TransferData`]
    /// the supplied content overwrites non-pinned content.
    pub fn supply_pages(
        self: &Arc<Self>,
        range: VmCowRange,
        splice: &mut VmPageSpliceList,
        options: SupplyOptions,
        supplied_len: &mut u64,
        _request: &mut MultiPageRequest,
    ) -> Result<()> {
        if !range.is_page_aligned() {
            return Err(Error::InvalidArgs);
        }
        *supplied_len = 0;
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        if let Some(source) = &self.page_source
            && source.is_detached()
        {
            return Err(Error::BadState);
        }
        if options == SupplyOptions::TransferData && self.root_has_page_source() {
            return Err(Error::NotSupported);
        }
        Self::check_range_locked(inner, range)?;
        let preserving = self.is_source_preserving_page_content();
        let result = self.supply_pages_locked(inner, range, splice, options, preserving, supplied_len, &mut deferred);
        if *supplied_len > 0
            && let Some(source) = &self.page_source
        {
            source.on_pages_supplied(VmCowRange::new(range.offset, *supplied_len));
        }
        result
    }

    #[expect(clippy::too_many_arguments)]
    fn supply_pages_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        range: VmCowRange,
        splice: &mut VmPageSpliceList,
        options: SupplyOptions,
        preserving: bool,
        supplied_len: &mut u64,
        deferred: &mut DeferredOps,
    ) -> Result<()> {
        let overwrite = match options {
            SupplyOptions::PagerSupply => CanOverwriteContent::None,
            SupplyOptions::TransferData => CanOverwriteContent::NonZero,
        };
        for offset in range.pages() {
            let entry = splice.pop().unwrap_or(VmPageOrMarker::Empty);
            match entry {
                VmPageOrMarker::Empty => {}
                entry => {
                    if let VmPageOrMarker::Page(page) = &entry {
                        page.set_dirty_state(if preserving {
                            DirtyState::Clean
                        } else {
                            DirtyState::Untracked
                        });
                    }
                    // Check the destination before committing to the
                    // insert so a refused page can be released cleanly.
                    let allowed = {
                        let (slot, in_interval) = inner
                            .page_list
                            .lookup_or_allocate(offset, InsertIntervalPolicy::CheckForInterval)?;
                        Self::check_overwrite(slot, in_interval, overwrite)
                    };
                    match allowed {
                        Ok(()) => {
                            self.add_page_locked(inner, offset, entry, overwrite, false, Some(deferred))?;
                        }
                        Err(Error::AlreadyExists) if options == SupplyOptions::PagerSupply => {
                            // The offset already has content; the pager's
                            // page is simply not needed.
                            Self::stage_removed_entry(entry, deferred);
                        }
                        Err(error) => {
                            Self::stage_removed_entry(entry, deferred);
                            return Err(error);
                        }
                    }
                }
            }
            *supplied_len = offset + PAGE_SIZE - range.offset;
        }
        Ok(())
    }

    /// Fails all outstanding pager requests in `range` with `error`,
    /// which must be one of the statuses a pager may report.
    pub fn fail_page_requests(&self, range: VmCowRange, error: Error) -> Result<()> {
        let Some(source) = &self.page_source else {
            return Err(Error::BadState);
        };
        if !PageSource::is_valid_failure_code(error) {
            return Err(Error::InvalidArgs);
        }
        let inner = self.inner.lock();
        Self::check_range_locked(&inner, range)?;
        drop(inner);
        source.on_pages_failed(range, error);
        Ok(())
    }

    /// Detaches the page source: outstanding requests fail, Clean pages
    /// and markers are released (their content can no longer be
    /// refetched on demand, but is also no longer needed), while Dirty
    /// and AwaitingClean pages stay for writeback.
    pub fn detach_source(self: &Arc<Self>) -> Result<()> {
        let Some(source) = self.page_source.clone() else {
            return Err(Error::BadState);
        };
        source.detach();
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        let size = inner.size;
        let mut removals = Vec::new();
        inner
            .page_list
            .visit_range(VmCowRange::new(0, size), |item| {
                match item {
                    PlItem::Entry { offset, entry } => match entry {
                        VmPageOrMarker::Page(page) => {
                            if !page.is_dirty() && !page.is_awaiting_clean() && !page.is_pinned() {
                                removals.push(offset);
                            }
                        }
                        VmPageOrMarker::Marker => removals.push(offset),
                        _ => {}
                    },
                    _ => {}
                }
                ControlFlow::Continue(())
            });
        for offset in removals {
            let entry = inner.page_list.remove_content(offset);
            Self::stage_removed_entry(entry, &mut deferred);
        }
        self.range_change_update_locked(
            inner,
            VmCowRange::new(0, size),
            RangeChangeOp::Unmap,
            Some(&mut deferred),
        );
        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `offset`. Restartable: on
    /// [`Error::ShouldWait`] the caller waits on `request` and re-invokes.
    pub fn read(
        self: &Arc<Self>,
        offset: u64,
        buf: &mut [u8],
        request: &mut MultiPageRequest,
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        let end = offset.checked_add(buf.len() as u64).ok_or(Error::OutOfRange)?;
        if inner.life_cycle != LifeCycle::Alive {
            return Err(Error::BadState);
        }
        if end > inner.size {
            return Err(Error::OutOfRange);
        }
        let aligned_start = offset.align_down(PAGE_SIZE);
        let aligned = VmCowRange::new(aligned_start, end.align_up(PAGE_SIZE) - aligned_start);
        let mut cursor = LookupCursor::new(self, inner, aligned);
        let mut cur = offset;
        let mut buf_offset = 0usize;
        while cur < end {
            let in_page = (cur % PAGE_SIZE) as usize;
            let chunk = ((PAGE_SIZE as usize - in_page) as u64).min(end - cur) as usize;
            let remaining = (aligned.end() - cursor.offset()) / PAGE_SIZE;
            let result = cursor.require_read_page(remaining, &mut deferred, request)?;
            result
                .page
                .read_bytes(in_page, &mut buf[buf_offset..buf_offset + chunk]);
            buf_offset += chunk;
            cur += chunk as u64;
        }
        Ok(())
    }

    /// Writes `buf` starting at `offset`. Restartable like
    /// [`VmCowPages::read`].
    pub fn write(
        self: &Arc<Self>,
        offset: u64,
        buf: &[u8],
        request: &mut MultiPageRequest,
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let inner = locked.locked_mut();
        let end = offset.checked_add(buf.len() as u64).ok_or(Error::OutOfRange)?;
        if inner.life_cycle != LifeCycle::Alive {
            return Err(Error::BadState);
        }
        if end > inner.size {
            return Err(Error::OutOfRange);
        }
        let aligned_start = offset.align_down(PAGE_SIZE);
        let aligned = VmCowRange::new(aligned_start, end.align_up(PAGE_SIZE) - aligned_start);
        let mut cursor = LookupCursor::new(self, inner, aligned);
        let mut cur = offset;
        let mut buf_offset = 0usize;
        while cur < end {
            let in_page = (cur % PAGE_SIZE) as usize;
            let chunk = ((PAGE_SIZE as usize - in_page) as u64).min(end - cur) as usize;
            let remaining = (aligned.end() - cursor.offset()) / PAGE_SIZE;
            let result = cursor.require_owned_page(true, remaining, &mut deferred, request)?;
            debug_assert!(result.writable);
            result
                .page
                .write_bytes(in_page, &buf[buf_offset..buf_offset + chunk]);
            buf_offset += chunk;
            cur += chunk as u64;
        }
        drop(cursor);
        self.mark_modified_locked(locked.locked_mut());
        Ok(())
    }

    /// Replaces `page` at `offset` with a new page, loaned or not,
    /// copying metadata and contents and preserving pin requirements.
    pub(crate) fn replace_page_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        before: &Arc<VmPage>,
        offset: u64,
        with_loaned: bool,
        deferred: &mut DeferredOps,
    ) -> Result<Arc<VmPage>> {
        let slot_matches = inner
            .page_list
            .lookup(offset)
            .and_then(|entry| entry.page())
            .is_some_and(|page| Arc::ptr_eq(page, before));
        if !slot_matches {
            return Err(Error::NotFound);
        }
        if with_loaned {
            if before.is_pinned() || before.is_dirty() || before.is_awaiting_clean() {
                return Err(Error::BadState);
            }
            if before.always_need() {
                return Err(Error::BadState);
            }
        }
        let new_page = if with_loaned {
            pmm::alloc_loaned_page(|_| {})?
        } else {
            pmm::alloc_page(self.pmm_alloc_flags)?
        };
        new_page.copy_metadata_from(before);
        new_page.copy_contents_from(before);
        new_page.set_backlink(self, offset);
        let slot = inner.page_list.lookup_mut(offset).ok_or(Error::NotFound)?;
        let old = slot.replace(VmPageOrMarker::Page(new_page.clone()));
        self.range_change_update_locked(
            inner,
            VmCowRange::new(offset, PAGE_SIZE),
            RangeChangeOp::Unmap,
            Some(deferred),
        );
        self.set_not_pinned_queue(&new_page, false);
        match old {
            VmPageOrMarker::Page(old_page) => {
                pmm::page_queues().remove(&old_page);
                old_page.clear_backlink();
                deferred.freed_list().append(old_page);
            }
            _ => unreachable!(),
        }
        Ok(new_page)
    }
}

