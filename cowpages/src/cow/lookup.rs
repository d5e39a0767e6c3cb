// SPDX-License-Identifier: MPL-2.0

//! A cursor resolving successive offsets of a node to pages.
//!
//! The cursor walks the hierarchy to find the first visible content for
//! each offset, forking, allocating, decompressing or generating pager
//! requests as the query demands. The target's lock must be held
//! contiguously over the cursor's whole lifetime; ancestor locks are
//! taken and dropped as owners change.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::compression;
use crate::error::{Error, Result};
use crate::page::{DirtyState, VmPage};
use crate::page_list::{InsertIntervalPolicy, VmPageOrMarker};
use crate::page_source::MultiPageRequest;
use crate::pmm;
use crate::range::VmCowRange;
use crate::PAGE_SIZE;

use super::hierarchy::{self, OwnerContentFate};
use super::locking::LockedPtr;
use super::{CowPagesInner, DeferredOps, RangeChangeOp, VmCowPages};

/// The outcome of a successful cursor query.
pub(crate) struct RequireResult {
    pub page: Arc<VmPage>,
    /// Whether the returned page may be written through right now.
    pub writable: bool,
}

pub(crate) struct LookupCursor<'a> {
    target: &'a Arc<VmCowPages>,
    target_inner: &'a mut CowPagesInner,
    offset: u64,
    end_offset: u64,
    /// Owner of the current content; empty when the target itself is the
    /// relevant node.
    owner: LockedPtr,
    owner_offset: u64,
    /// Target offset at which the current owner resolution expires.
    visible_end: u64,
    is_valid: bool,
    target_preserving: bool,
    zero_fork: bool,
    mark_accessed: bool,
    alloc_list: Option<&'a mut Vec<Arc<VmPage>>>,
}

impl<'a> LookupCursor<'a> {
    pub(crate) fn new(
        target: &'a Arc<VmCowPages>,
        target_inner: &'a mut CowPagesInner,
        range: VmCowRange,
    ) -> Self {
        debug_assert!(range.is_page_aligned() && !range.is_empty());
        debug_assert!(range.end() <= target_inner.size);
        let target_preserving = target.is_source_preserving_page_content();
        Self {
            target,
            target_inner,
            offset: range.offset,
            end_offset: range.end(),
            owner: LockedPtr::none(),
            owner_offset: range.offset,
            visible_end: range.offset,
            is_valid: false,
            target_preserving,
            zero_fork: !target_preserving && target.can_decommit_zero_pages(),
            mark_accessed: true,
            alloc_list: None,
        }
    }

    /// Provides spare pages used to satisfy allocations before hitting
    /// the PMM.
    pub(crate) fn give_alloc_list(&mut self, list: &'a mut Vec<Arc<VmPage>>) {
        self.alloc_list = Some(list);
    }

    pub(crate) fn disable_zero_fork(&mut self) {
        self.zero_fork = false;
    }

    pub(crate) fn disable_mark_accessed(&mut self) {
        self.mark_accessed = false;
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    fn remaining_pages(&self) -> u64 {
        (self.end_offset - self.offset) / PAGE_SIZE
    }

    fn establish(&mut self) {
        if self.is_valid {
            return;
        }
        debug_assert!(self.offset < self.end_offset);
        let lookup = hierarchy::find_page_content(
            self.target,
            self.target_inner,
            self.offset,
            self.end_offset - self.offset,
        );
        self.owner = lookup.owner;
        self.owner_offset = lookup.owner_offset;
        self.visible_end = lookup.visible_end;
        self.is_valid = true;
    }

    fn invalidate(&mut self) {
        self.owner.release();
        self.is_valid = false;
    }

    fn target_is_owner(&self) -> bool {
        !self.owner.is_some()
    }

    /// Steps to the next offset, invalidating the owner resolution when
    /// it expires or when content may now come from somewhere else.
    fn increment_cursor(&mut self) {
        self.offset += PAGE_SIZE;
        if self.offset >= self.visible_end {
            self.invalidate();
            return;
        }
        self.owner_offset += PAGE_SIZE;
        let node = self.owner.node_or(self.target);
        let inner = self.owner.locked_or(self.target_inner);
        let entry = inner.page_list.lookup(self.owner_offset);
        let can_see_parent = if node.node_has_parent_content_markers() {
            entry.is_some_and(|entry| entry.is_parent_content())
        } else {
            entry.is_none()
        } && inner.can_see_parent(self.owner_offset);
        let has_content = entry.is_some_and(|entry| entry.is_content())
            || inner.page_list.is_offset_in_zero_interval(self.owner_offset);
        if !has_content || can_see_parent {
            self.invalidate();
        }
    }

    /// Steps over `delta` bytes without keeping the owner resolution.
    fn increment_offset_and_invalidate(&mut self, delta: u64) {
        self.offset += delta;
        self.invalidate();
    }

    /// Allocates a page, preferring the caller-provided allocation list.
    fn alloc_page(&mut self) -> Result<Arc<VmPage>> {
        if let Some(list) = self.alloc_list.as_mut()
            && let Some(page) = list.pop()
        {
            return Ok(page);
        }
        pmm::alloc_page(self.target.pmm_alloc_flags)
    }

    fn alloc_zeroed_page(&mut self) -> Result<Arc<VmPage>> {
        let page = self.alloc_page()?;
        page.zero();
        Ok(page)
    }

    /// Issues a read request against the owner's page source.
    fn read_request(
        &mut self,
        max_request_pages: u64,
        request: &mut MultiPageRequest,
    ) -> Result<()> {
        let owner_node = self.owner.node_or(self.target);
        let source = owner_node.page_source().ok_or(Error::BadState)?;
        let window = (self.visible_end - self.offset).min(max_request_pages * PAGE_SIZE);
        let range = VmCowRange::new(self.owner_offset, window.max(PAGE_SIZE));
        source.get_pages(range, request.read_request())?;
        Err(Error::ShouldWait)
    }

    /// Issues a dirty transition request against the target's source.
    fn dirty_request(
        &mut self,
        max_request_pages: u64,
        request: &mut MultiPageRequest,
    ) -> Result<()> {
        let source = self.target.page_source().ok_or(Error::BadState)?;
        let window = ((self.end_offset - self.offset).min(max_request_pages * PAGE_SIZE))
            .max(PAGE_SIZE);
        let range = VmCowRange::new(self.offset, window);
        source.request_dirty_transition(range, request.dirty_request())?;
        Err(Error::ShouldWait)
    }

    /// Installs a page the target now owns at the current offset. The
    /// slot may currently hold a parent content placeholder (whose
    /// accounting the caller has already settled) or zero content.
    fn target_install_page(
        &mut self,
        page: Arc<VmPage>,
        dirty_state: DirtyState,
        deferred: &mut DeferredOps,
    ) -> Result<Arc<VmPage>> {
        page.set_dirty_state(dirty_state);
        page.set_backlink(self.target, self.offset);
        let zero_fork = self.zero_fork;
        let (slot, _in_interval) = self
            .target_inner
            .page_list
            .lookup_or_allocate(self.offset, InsertIntervalPolicy::SplitInterval)?;
        let old = slot.replace(VmPageOrMarker::Page(page.clone()));
        debug_assert!(
            old.is_empty() || old.is_marker() || old.is_parent_content(),
            "installing over live content"
        );
        self.target.set_not_pinned_queue(&page, zero_fork);
        if self.target_preserving {
            self.target.mark_modified_locked(self.target_inner);
        }
        self.target.range_change_update_locked(
            self.target_inner,
            VmCowRange::new(self.offset, PAGE_SIZE),
            RangeChangeOp::UnmapZeroPage,
            Some(deferred),
        );
        Ok(page)
    }

    /// Turns a reference at the owner (or target) back into a page,
    /// preserving its share count.
    fn reference_to_page(&mut self) -> Result<()> {
        let compressor = compression::active_compressor().ok_or(Error::BadState)?;
        let page = self.alloc_page()?;
        let offset = self.owner_offset;
        let owner_node = self.owner.node_or(self.target).clone();
        let inner = self.owner.locked_or_mut(self.target_inner);
        let Some(slot) = inner.page_list.lookup_mut(offset) else {
            pmm::free_page(page);
            return Err(Error::NotFound);
        };
        let Some(reference) = slot.reference() else {
            pmm::free_page(page);
            return Err(Error::NotFound);
        };
        if let Some((src_page, metadata)) = compressor.move_reference(reference) {
            page.copy_contents_from(&src_page);
            page.set_share_count(metadata);
            pmm::free_page(src_page);
        } else {
            page.set_share_count(compressor.metadata(reference));
            compressor.decompress(reference, &page);
        }
        page.set_backlink(&owner_node, offset);
        *slot = VmPageOrMarker::Page(page.clone());
        owner_node.set_not_pinned_queue(&page, false);
        Ok(())
    }

    /// Copies (or migrates) ancestor content into the target at the
    /// current offset.
    fn fork_owner_page(
        &mut self,
        deferred: &mut DeferredOps,
    ) -> Result<Arc<VmPage>> {
        debug_assert!(!self.target_is_owner());
        // Settle the target's placeholder first: the target stops viewing
        // the owner's content either by taking it over or by reducing its
        // share count.
        let owner_offset = self.owner_offset;
        let had_marker = self
            .target_inner
            .page_list
            .lookup(self.offset)
            .is_some_and(|entry| entry.is_parent_content());
        let owner_is_hidden = self.owner.node().is_hidden();
        let fate = if owner_is_hidden {
            hierarchy::take_or_share_owner_content(self.owner.locked_mut(), owner_offset)
        } else {
            // Content in a visible ancestor is never migrated; the owner
            // keeps using it.
            OwnerContentFate::Shared
        };
        let page = match fate {
            OwnerContentFate::Taken(VmPageOrMarker::Page(page)) => {
                // Sole viewer: migrate the page instead of copying it.
                pmm::page_queues().remove(&page);
                page.set_share_count(0);
                page
            }
            OwnerContentFate::Taken(entry) => {
                // A taken reference is first turned back into a page by
                // the caller paths; taking any other entry is a bug.
                debug_assert!(false, "unexpected taken entry {entry:?}");
                return Err(Error::BadState);
            }
            OwnerContentFate::Shared => {
                let source = {
                    let inner = self.owner.locked();
                    inner
                        .page_list
                        .lookup(owner_offset)
                        .and_then(|entry| entry.page().cloned())
                };
                let Some(source) = source else {
                    return Err(Error::NotFound);
                };
                let page = self.alloc_page()?;
                page.copy_contents_from(&source);
                page
            }
        };
        if had_marker {
            // The placeholder is consumed by the fork; the share count
            // adjustment above already accounted for it.
            let _ = self.target_inner.page_list.remove_content(self.offset);
        }
        self.target_install_page(page, DirtyState::Untracked, deferred)
    }

    /// Resolves an owned-by-target page at the current offset, forking or
    /// allocating as necessary. `will_write` additionally guarantees the
    /// page is writable, performing any dirty transition the target's
    /// source demands.
    pub(crate) fn require_owned_page(
        &mut self,
        will_write: bool,
        max_request_pages: u64,
        deferred: &mut DeferredOps,
        request: &mut MultiPageRequest,
    ) -> Result<RequireResult> {
        debug_assert!(self.offset < self.end_offset);
        loop {
            self.establish();
            if self.target_is_owner() {
                let entry_kind = {
                    let entry = self.target_inner.page_list.lookup(self.offset);
                    match entry {
                        Some(VmPageOrMarker::Page(page)) => Some(page.clone()),
                        _ => None,
                    }
                };
                if let Some(page) = entry_kind {
                    if page.is_loaned() {
                        // Writable pages must not be loaned; replace the
                        // page in place before handing it out.
                        if will_write {
                            self.replace_loaned_page(&page, deferred)?;
                            continue;
                        }
                    }
                    if will_write && self.target_preserving && !page.is_dirty() {
                        if self.target.should_trap_dirty_transitions() {
                            self.dirty_request(max_request_pages, request)?;
                            unreachable!("dirty_request never returns Ok");
                        }
                        super::dirty::update_dirty_state(
                            self.target,
                            self.target_inner,
                            &page,
                            DirtyState::Dirty,
                        );
                    }
                    if self.mark_accessed {
                        pmm::page_queues().mark_accessed(&page);
                    }
                    let writable = !self.target_preserving || page.is_dirty();
                    self.increment_cursor();
                    return Ok(RequireResult { page, writable });
                }
                if self
                    .target_inner
                    .page_list
                    .lookup(self.offset)
                    .is_some_and(|entry| entry.is_reference())
                {
                    self.reference_to_page()?;
                    continue;
                }
                // The target holds zero content or nothing at all.
                let in_dirty_interval = {
                    let list = &self.target_inner.page_list;
                    list.enclosing_interval(self.offset)
                        .is_some_and(|(_, _, state, _)| state == DirtyState::Dirty)
                };
                let is_marker = self
                    .target_inner
                    .page_list
                    .lookup(self.offset)
                    .is_some_and(|entry| entry.is_marker());
                let in_interval = self
                    .target_inner
                    .page_list
                    .is_offset_in_zero_interval(self.offset);
                if self.target_preserving && !is_marker && !in_interval {
                    // Unknown content; it must come from the source.
                    self.read_request(max_request_pages, request)?;
                    unreachable!("read_request never returns Ok");
                }
                // Zero content owned by the target. Content inside a
                // Dirty interval stays dirty whatever the access; writes
                // into content that is not already dirty need a trap
                // first.
                let dirty_state = if self.target_preserving {
                    if in_dirty_interval {
                        DirtyState::Dirty
                    } else if will_write {
                        if self.target.should_trap_dirty_transitions() {
                            self.dirty_request(max_request_pages, request)?;
                            unreachable!("dirty_request never returns Ok");
                        }
                        DirtyState::Dirty
                    } else {
                        DirtyState::Clean
                    }
                } else {
                    DirtyState::Untracked
                };
                let page = self.alloc_zeroed_page()?;
                let page = self.target_install_page(page, dirty_state, deferred)?;
                let writable = !self.target_preserving || page.is_dirty();
                self.increment_offset_and_invalidate(PAGE_SIZE);
                return Ok(RequireResult { page, writable });
            }
            // An ancestor owns the content.
            let owner_entry_is_reference = {
                let inner = self.owner.locked();
                inner
                    .page_list
                    .lookup(self.owner_offset)
                    .is_some_and(|entry| entry.is_reference())
            };
            if owner_entry_is_reference {
                self.reference_to_page()?;
                continue;
            }
            let owner_has_page = {
                let inner = self.owner.locked();
                inner
                    .page_list
                    .lookup(self.owner_offset)
                    .is_some_and(|entry| entry.is_page())
            };
            if owner_has_page {
                let page = self.fork_owner_page(deferred)?;
                self.increment_offset_and_invalidate(PAGE_SIZE);
                return Ok(RequireResult {
                    page,
                    writable: true,
                });
            }
            // The ancestor holds zero content (a marker or an interval) or
            // nothing; in a pager hierarchy absence means the source must
            // supply it.
            let owner_zero = {
                let inner = self.owner.locked();
                inner
                    .page_list
                    .lookup(self.owner_offset)
                    .is_some_and(|entry| entry.is_marker() || entry.is_interval_zero())
                    || inner.page_list.is_offset_in_zero_interval(self.owner_offset)
            };
            if !owner_zero && self.owner.node().is_source_preserving_page_content() {
                self.read_request(max_request_pages, request)?;
                unreachable!("read_request never returns Ok");
            }
            // Fork zero content: consume the target's placeholder if any
            // and allocate a fresh zero page. Markers carry no share
            // count, so no ancestor accounting is needed.
            if self
                .target_inner
                .page_list
                .lookup(self.offset)
                .is_some_and(|entry| entry.is_parent_content())
            {
                let _ = self.target_inner.page_list.remove_content(self.offset);
            }
            let page = self.alloc_zeroed_page()?;
            let page = self.target_install_page(page, DirtyState::Untracked, deferred)?;
            self.increment_offset_and_invalidate(PAGE_SIZE);
            return Ok(RequireResult {
                page,
                writable: true,
            });
        }
    }

    /// Replaces a loaned page of the target with a freshly allocated one,
    /// copying metadata and contents.
    fn replace_loaned_page(
        &mut self,
        page: &Arc<VmPage>,
        deferred: &mut DeferredOps,
    ) -> Result<()> {
        let new_page = self.alloc_page()?;
        new_page.copy_metadata_from(page);
        new_page.copy_contents_from(page);
        new_page.set_backlink(self.target, self.offset);
        let Some(slot) = self.target_inner.page_list.lookup_mut(self.offset) else {
            pmm::free_page(new_page);
            return Err(Error::NotFound);
        };
        let old = slot.replace(VmPageOrMarker::Page(new_page.clone()));
        self.target.range_change_update_locked(
            self.target_inner,
            VmCowRange::new(self.offset, PAGE_SIZE),
            RangeChangeOp::Unmap,
            Some(deferred),
        );
        self.target.set_not_pinned_queue(&new_page, false);
        match old {
            VmPageOrMarker::Page(old_page) => {
                pmm::page_queues().remove(&old_page);
                old_page.clear_backlink();
                deferred.freed_list().append(old_page);
            }
            _ => debug_assert!(false, "loaned slot changed"),
        }
        self.invalidate();
        Ok(())
    }

    /// Returns any readable page for the current offset, which may be
    /// owned by an ancestor or be the singleton zero page.
    pub(crate) fn require_read_page(
        &mut self,
        max_request_pages: u64,
        _deferred: &mut DeferredOps,
        request: &mut MultiPageRequest,
    ) -> Result<RequireResult> {
        debug_assert!(self.offset < self.end_offset);
        loop {
            self.establish();
            let has_reference = {
                let inner = self.owner.locked_or(self.target_inner);
                inner
                    .page_list
                    .lookup(self.owner_offset)
                    .is_some_and(|entry| entry.is_reference())
            };
            if has_reference {
                self.reference_to_page()?;
                continue;
            }
            let page = {
                let inner = self.owner.locked_or(self.target_inner);
                inner
                    .page_list
                    .lookup(self.owner_offset)
                    .and_then(|entry| entry.page().cloned())
            };
            if let Some(page) = page {
                if self.mark_accessed {
                    pmm::page_queues().mark_accessed(&page);
                }
                let writable =
                    self.target_is_owner() && (!self.target_preserving || page.is_dirty());
                self.increment_cursor();
                return Ok(RequireResult { page, writable });
            }
            let zero = {
                let inner = self.owner.locked_or(self.target_inner);
                inner
                    .page_list
                    .lookup(self.owner_offset)
                    .is_some_and(|entry| entry.is_marker() || entry.is_interval_zero())
                    || inner.page_list.is_offset_in_zero_interval(self.owner_offset)
            };
            let owner_preserving = self
                .owner
                .node_or(self.target)
                .is_source_preserving_page_content();
            if !zero && owner_preserving {
                self.read_request(max_request_pages, request)?;
                unreachable!("read_request never returns Ok");
            }
            // Definitive zero.
            self.increment_cursor();
            return Ok(RequireResult {
                page: pmm::zero_page().clone(),
                writable: false,
            });
        }
    }

    /// Dispatches to [`LookupCursor::require_owned_page`] or
    /// [`LookupCursor::require_read_page`]; writing implies owning.
    pub(crate) fn require_page(
        &mut self,
        will_write: bool,
        max_request_pages: u64,
        deferred: &mut DeferredOps,
        request: &mut MultiPageRequest,
    ) -> Result<RequireResult> {
        if will_write {
            self.require_owned_page(true, max_request_pages, deferred, request)
        } else {
            self.require_read_page(max_request_pages, deferred, request)
        }
    }

    fn usable_page(&mut self, will_write: bool) -> Option<Arc<VmPage>> {
        self.establish();
        let inner = self.owner.locked_or(self.target_inner);
        let page = inner
            .page_list
            .lookup(self.owner_offset)
            .and_then(|entry| entry.page().cloned())?;
        if will_write
            && (!self.target_is_owner() || (self.target_preserving && !page.is_dirty()))
        {
            return None;
        }
        Some(page)
    }

    /// Fast path: returns the page at the current offset only if it is
    /// immediately usable without allocations, forks or dirty
    /// transitions. The cursor always advances.
    pub(crate) fn maybe_page(&mut self, will_write: bool) -> Option<Arc<VmPage>> {
        let page = self.usable_page(will_write);
        if let Some(page) = &page
            && self.mark_accessed
        {
            pmm::page_queues().mark_accessed(page);
        }
        self.increment_cursor();
        page
    }

    /// Vectorized fast path filling `paddrs` with contiguous physical
    /// addresses of immediately usable pages. Does not update access
    /// times.
    pub(crate) fn if_exist_pages(
        &mut self,
        will_write: bool,
        max_pages: u64,
        paddrs: &mut [crate::page::Paddr],
    ) -> u64 {
        let max = max_pages.min(self.remaining_pages()).min(paddrs.len() as u64);
        let mut count = 0;
        while count < max {
            match self.usable_page(will_write) {
                Some(page) => {
                    paddrs[count as usize] = page.paddr();
                    self.increment_cursor();
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// The number of offsets, starting at the current one, that have no
    /// content anywhere in the hierarchy and unknown-content semantics do
    /// not apply to.
    pub(crate) fn skip_missing_pages(&mut self) -> u64 {
        let mut count = 0;
        while self.offset < self.end_offset {
            self.establish();
            let missing = {
                let inner = self.owner.locked_or(self.target_inner);
                let entry = inner.page_list.lookup(self.owner_offset);
                entry.is_none_or(|entry| entry.is_empty() || entry.is_parent_content())
                    && !inner.page_list.is_offset_in_zero_interval(self.owner_offset)
            };
            if !missing {
                break;
            }
            count += 1;
            self.increment_cursor();
        }
        count
    }
}
