// SPDX-License-Identifier: MPL-2.0

//! The copy-on-write page hierarchy.
//!
//! A [`VmCowPages`] node owns a sparse [`PageList`] and hangs in a tree of
//! content containers. Visible nodes are what user-facing objects
//! reference; hidden nodes exist only to hold content shared between
//! siblings after a bidirectional snapshot. Children copy-on-write from
//! their ancestors; reclamation, dirty tracking and pager supply all
//! operate on this tree.

mod clone;
mod deferred;
mod dirty;
mod hierarchy;
mod locking;
mod lookup;
mod ops;
mod reclaim;
mod tree_cursor;

pub use clone::SnapshotType;
pub use deferred::{DeferredOps, RangeChangeOp, ScopedPageFreedList};
pub use ops::SupplyOptions;
pub use reclaim::{EvictionAction, ReclaimCounts};
pub use tree_cursor::TreeWalkCursor;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::discardable::DiscardableVmoTracker;
use crate::error::{Error, Result};
use crate::page::{DirtyState, VmPage};
use crate::page_list::{InsertIntervalPolicy, PageList, VmPageOrMarker, PAGE_FAN_OUT};
use crate::page_source::PageSource;
use crate::pmm::{self, queues::PageQueue, PmmAllocFlags};
use crate::range::VmCowRange;
use crate::PAGE_SIZE;

use locking::LockedPtr;
use tree_cursor::TreeCursorState;

/// Builds a lookup cursor against an externally locked node, for the
/// crate's own tests.
#[cfg(test)]
pub(crate) fn lookup_cursor_for_test<'a>(
    target: &'a Arc<VmCowPages>,
    inner: &'a mut CowPagesInner,
    range: VmCowRange,
) -> lookup::LookupCursor<'a> {
    lookup::LookupCursor::new(target, inner, range)
}

bitflags::bitflags! {
    /// Configuration of a node, fixed at creation.
    pub struct VmCowPagesOptions: u32 {
        /// The root of this hierarchy is backed by a user pager.
        const USER_PAGER_BACKED_ROOT = 1 << 0;
        /// The root's page source preserves page content, so pages are
        /// dirty tracked and must be written back before eviction.
        const PRESERVING_PAGE_CONTENT_ROOT = 1 << 1;
        /// The root of this hierarchy has a page source of any kind.
        const PAGE_SOURCE_ROOT = 1 << 2;
        /// Zeroing never decommits pages; they are zeroed in place.
        const CANNOT_DECOMMIT_ZERO_PAGES = 1 << 3;
        /// Internal bookkeeping node holding content shared by siblings.
        const HIDDEN = 1 << 4;
        /// The initial content of an externally sourced node is zero
        /// rather than pager-supplied: the whole range starts as a single
        /// Dirty zero interval awaiting writeback, the way stream-style
        /// objects come into existence. Without this flag initial content
        /// is fetched from the source on demand.
        const INITIAL_ZERO_CONTENT = 1 << 5;
    }
}

impl VmCowPagesOptions {
    /// The options a clone inherits from its parent.
    fn inheritable(self) -> Self {
        self & (Self::USER_PAGER_BACKED_ROOT
            | Self::PRESERVING_PAGE_CONTENT_ROOT
            | Self::PAGE_SOURCE_ROOT)
    }
}

/// Life cycle of a node.
///
/// The explicit Dead transition guarantees that a node owns no pages by
/// the time its destructor runs; destruction is only legal in `Init` or
/// `Dead`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LifeCycle {
    Init,
    Alive,
    Dying,
    Dead,
}

/// How an insertion treats content already present in the slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CanOverwriteContent {
    /// Nothing may be overwritten.
    None,
    /// Zero content (markers and zero intervals) may be overwritten.
    Zero,
    /// Any non-pinned content may be overwritten.
    NonZero,
}

/// Pager statistics of a node, reported to the user pager.
#[derive(Clone, Copy, Default, Debug)]
pub struct PagerVmoStats {
    /// Whether the node was modified (written or resized) since the last
    /// query that reset the state.
    pub modified: bool,
}

/// The user-facing object a visible node backs.
///
/// The node keeps a weak reference; the object must clear it (and drive
/// the dead transition) on its own destruction. Range changes reach the
/// mapping layer through this trait.
pub trait VmoBacklink: Send + Sync {
    /// Applies a mapping invalidation for `range`.
    fn range_change(&self, range: VmCowRange, op: RangeChangeOp);
}

/// An ordered container of content entries used to move pages between
/// nodes atomically.
pub struct VmPageSpliceList {
    offset: u64,
    len: u64,
    entries: alloc::collections::VecDeque<VmPageOrMarker>,
}

impl VmPageSpliceList {
    pub fn new(offset: u64, len: u64) -> Self {
        Self {
            offset,
            len,
            entries: alloc::collections::VecDeque::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a page carrying content.
    pub fn append_page(&mut self, page: Arc<VmPage>) {
        self.entries.push_back(VmPageOrMarker::Page(page));
    }

    /// Appends a slot of known-zero content.
    pub fn append_zero(&mut self) {
        self.entries.push_back(VmPageOrMarker::Marker);
    }

    pub(crate) fn append(&mut self, entry: VmPageOrMarker) {
        self.entries.push_back(entry);
    }

    pub(crate) fn pop(&mut self) -> Option<VmPageOrMarker> {
        self.entries.pop_front()
    }
}

/// State of a node guarded by its lock.
pub(crate) struct CowPagesInner {
    pub(crate) life_cycle: LifeCycle,
    pub(crate) size: u64,
    pub(crate) parent: Option<Arc<VmCowPages>>,
    /// Offset in the parent where this node starts.
    pub(crate) parent_offset: u64,
    /// Offset in *this* node above which accesses never see the parent.
    pub(crate) parent_limit: u64,
    /// Offset in the root parent where this node would start if projected
    /// onto it. Maintained so accumulated offsets can never overflow.
    pub(crate) root_parent_offset: u64,
    /// Ordered list of children; insertion at head, iteration head first.
    pub(crate) children: Vec<Weak<VmCowPages>>,
    pub(crate) page_list: PageList,
    pub(crate) paged_ref: Option<Weak<dyn VmoBacklink>>,
    pub(crate) pinned_page_count: u64,
    pub(crate) high_priority_count: i64,
    pub(crate) ever_pinned: bool,
    pub(crate) pager_stats_modified: bool,
    pub(crate) reclamation_event_count: u64,
    pub(crate) root_cursors: Vec<Weak<TreeCursorState>>,
    pub(crate) cur_cursors: Vec<Weak<TreeCursorState>>,
}

impl CowPagesInner {
    fn new(size: u64, page_list: PageList) -> Self {
        Self {
            life_cycle: LifeCycle::Init,
            size,
            parent: None,
            parent_offset: 0,
            parent_limit: 0,
            root_parent_offset: 0,
            children: Vec::new(),
            page_list,
            paged_ref: None,
            pinned_page_count: 0,
            high_priority_count: 0,
            ever_pinned: false,
            pager_stats_modified: false,
            reclamation_event_count: 0,
            root_cursors: Vec::new(),
            cur_cursors: Vec::new(),
        }
    }

    /// Whether `offset` can resolve through the parent.
    pub(crate) fn can_see_parent(&self, offset: u64) -> bool {
        self.parent.is_some() && offset < self.parent_limit
    }
}

/// A copy-on-write page container.
pub struct VmCowPages {
    options: VmCowPagesOptions,
    pmm_alloc_flags: PmmAllocFlags,
    lock_order: u64,
    /// The page source; only ever present on the root of a hierarchy.
    page_source: Option<Arc<PageSource>>,
    /// The root's page source, cached on every node of the hierarchy so
    /// deferred operations can serialize on it without walking up.
    root_source: Option<Arc<PageSource>>,
    discardable_tracker: Option<DiscardableVmoTracker>,
    pub(crate) inner: Mutex<CowPagesInner>,
}

impl VmCowPages {
    /// Creates an anonymous node. The node starts in `Init` and must be
    /// transitioned to `Alive` before use.
    pub fn new_anonymous(
        options: VmCowPagesOptions,
        alloc_flags: PmmAllocFlags,
        size: u64,
        discardable_tracker: Option<DiscardableVmoTracker>,
    ) -> Result<Arc<Self>> {
        if size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        if options.intersects(
            VmCowPagesOptions::HIDDEN
                | VmCowPagesOptions::PAGE_SOURCE_ROOT
                | VmCowPagesOptions::USER_PAGER_BACKED_ROOT
                | VmCowPagesOptions::PRESERVING_PAGE_CONTENT_ROOT
                | VmCowPagesOptions::INITIAL_ZERO_CONTENT,
        ) {
            return Err(Error::InvalidArgs);
        }
        Ok(Self::new_node(
            options,
            alloc_flags,
            locking::LOCK_ORDER_FIRST_ANON,
            size,
            None,
            None,
            discardable_tracker,
            PageList::new(),
        ))
    }

    /// Creates the root node of an externally sourced hierarchy.
    ///
    /// With [`VmCowPagesOptions::INITIAL_ZERO_CONTENT`] a preserving
    /// source starts with a single Dirty zero interval covering the whole
    /// range; otherwise the node starts empty and initial content is
    /// supplied by the pager on demand.
    pub fn new_external(
        source: Arc<PageSource>,
        options: VmCowPagesOptions,
        size: u64,
    ) -> Result<Arc<Self>> {
        if size % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        let properties = source.properties();
        let mut options = options | VmCowPagesOptions::PAGE_SOURCE_ROOT;
        if properties.is_preserving_page_content {
            options |= VmCowPagesOptions::PRESERVING_PAGE_CONTENT_ROOT
                | VmCowPagesOptions::USER_PAGER_BACKED_ROOT;
        }
        let mut page_list = PageList::new();
        if properties.is_preserving_page_content
            && options.contains(VmCowPagesOptions::INITIAL_ZERO_CONTENT)
            && size > 0
        {
            page_list.add_zero_interval(VmCowRange::new(0, size), DirtyState::Dirty)?;
        }
        Ok(Self::new_node(
            options,
            PmmAllocFlags::CAN_WAIT,
            locking::LOCK_ORDER_ROOT,
            size,
            Some(source.clone()),
            Some(source),
            None,
            page_list,
        ))
    }

    #[expect(clippy::too_many_arguments)]
    fn new_node(
        options: VmCowPagesOptions,
        pmm_alloc_flags: PmmAllocFlags,
        lock_order: u64,
        size: u64,
        page_source: Option<Arc<PageSource>>,
        root_source: Option<Arc<PageSource>>,
        discardable_tracker: Option<DiscardableVmoTracker>,
        page_list: PageList,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            pmm_alloc_flags,
            lock_order,
            page_source,
            root_source,
            discardable_tracker,
            inner: Mutex::new(CowPagesInner::new(size, page_list)),
        })
    }

    pub fn options(&self) -> VmCowPagesOptions {
        self.options
    }

    pub fn lock_order(&self) -> u64 {
        self.lock_order
    }

    pub fn is_hidden(&self) -> bool {
        self.options.contains(VmCowPagesOptions::HIDDEN)
    }

    pub fn root_has_page_source(&self) -> bool {
        self.options.contains(VmCowPagesOptions::PAGE_SOURCE_ROOT)
    }

    pub fn is_root_source_user_pager_backed(&self) -> bool {
        self.options.contains(VmCowPagesOptions::USER_PAGER_BACKED_ROOT)
    }

    pub fn is_root_source_preserving_page_content(&self) -> bool {
        self.options
            .contains(VmCowPagesOptions::PRESERVING_PAGE_CONTENT_ROOT)
    }

    pub fn can_decommit_zero_pages(&self) -> bool {
        !self
            .options
            .contains(VmCowPagesOptions::CANNOT_DECOMMIT_ZERO_PAGES)
    }

    /// Whether this hierarchy marks ancestor content with explicit
    /// placeholders in leaf page lists. In such trees an empty leaf slot
    /// reads as definitively zero.
    pub fn tree_has_parent_content_markers(&self) -> bool {
        !self.root_has_page_source()
    }

    /// Whether this node's own page list uses parent content markers.
    pub fn node_has_parent_content_markers(&self) -> bool {
        self.tree_has_parent_content_markers() && !self.is_hidden()
    }

    /// Whether this node's own source preserves page content, i.e. this is
    /// the dirty-tracking root of a pager hierarchy.
    pub fn is_source_preserving_page_content(&self) -> bool {
        self.page_source
            .as_ref()
            .is_some_and(|source| source.properties().is_preserving_page_content)
    }

    /// Whether dirty transitions of this node's pages must be trapped.
    pub fn should_trap_dirty_transitions(&self) -> bool {
        self.page_source
            .as_ref()
            .is_some_and(|source| source.properties().should_trap_dirty_transitions)
    }

    pub fn is_discardable(&self) -> bool {
        self.discardable_tracker.is_some()
    }

    pub fn discardable_tracker(&self) -> Option<&DiscardableVmoTracker> {
        self.discardable_tracker.as_ref()
    }

    pub fn page_source(&self) -> Option<&Arc<PageSource>> {
        self.page_source.as_ref()
    }

    pub(crate) fn root_source(&self) -> Option<&Arc<PageSource>> {
        self.root_source.as_ref()
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn life_cycle(&self) -> LifeCycle {
        self.inner.lock().life_cycle
    }

    pub fn pinned_page_count(&self) -> u64 {
        self.inner.lock().pinned_page_count
    }

    pub fn reclamation_event_count(&self) -> u64 {
        self.inner.lock().reclamation_event_count
    }

    /// Transitions a freshly created node to `Alive`.
    pub fn transition_to_alive(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.life_cycle, LifeCycle::Init);
        inner.life_cycle = LifeCycle::Alive;
    }

    /// Installs the backlink to the user-facing object.
    pub fn set_paged_backlink(&self, backlink: Weak<dyn VmoBacklink>) {
        let mut inner = self.inner.lock();
        debug_assert!(!self.is_hidden());
        inner.paged_ref = Some(backlink);
    }

    /// Clears the backlink when the user-facing object goes away. The
    /// caller is expected to follow up with [`VmCowPages::dead_transition`].
    pub fn clear_paged_backlink(&self) {
        self.inner.lock().paged_ref = None;
    }

    pub(crate) fn mark_modified_locked(&self, inner: &mut CowPagesInner) {
        if self.is_root_source_user_pager_backed() && self.page_source.is_some() {
            inner.pager_stats_modified = true;
        }
    }

    /// Reports, and optionally resets, the pager statistics of this node.
    pub fn query_pager_vmo_stats(&self, reset: bool) -> Result<PagerVmoStats> {
        if !self.is_root_source_user_pager_backed() || self.page_source.is_none() {
            return Err(Error::NotSupported);
        }
        let mut inner = self.inner.lock();
        let stats = PagerVmoStats {
            modified: inner.pager_stats_modified,
        };
        if reset {
            inner.pager_stats_modified = false;
        }
        Ok(stats)
    }

    /// Adjusts this node's high priority count, propagating the 0 to
    /// positive (and back) edges to the parent chain. While the count is
    /// positive, reclamation skips the node.
    pub fn change_high_priority_count(self: &Arc<Self>, delta: i64) {
        let mut locked = LockedPtr::lock(self);
        Self::change_high_priority_count_locked(self, locked.locked_mut(), delta);
    }

    pub(crate) fn change_high_priority_count_locked(
        node: &Arc<Self>,
        inner: &mut CowPagesInner,
        delta: i64,
    ) {
        let _ = node;
        let was_positive = inner.high_priority_count > 0;
        inner.high_priority_count += delta;
        assert!(inner.high_priority_count >= 0);
        if was_positive == (inner.high_priority_count > 0) {
            return;
        }
        // Crossing the zero edge contributes exactly one count to the
        // parent, and so on up the chain until an edge stops crossing.
        let step = if delta > 0 { 1 } else { -1 };
        let mut cur_parent = inner.parent.clone();
        while let Some(parent) = cur_parent {
            let mut locked = LockedPtr::lock(&parent);
            let parent_inner = locked.locked_mut();
            let was_positive = parent_inner.high_priority_count > 0;
            parent_inner.high_priority_count += step;
            assert!(parent_inner.high_priority_count >= 0);
            if was_positive == (parent_inner.high_priority_count > 0) {
                break;
            }
            cur_parent = parent_inner.parent.clone();
        }
    }

    pub fn is_high_memory_priority(&self) -> bool {
        self.inner.lock().high_priority_count > 0
    }

    // ----- range changes -----

    /// Notifies this node's mapping layer about `range` and queues the
    /// same operation for copy-on-write descendants via `deferred`.
    pub(crate) fn range_change_update_locked(
        self: &Arc<Self>,
        inner: &CowPagesInner,
        range: VmCowRange,
        op: RangeChangeOp,
        deferred: Option<&mut DeferredOps>,
    ) {
        if range.is_empty() {
            return;
        }
        if let Some(backlink) = inner.paged_ref.as_ref().and_then(|weak| weak.upgrade()) {
            backlink.range_change(range, op);
        }
        if let Some(deferred) = deferred {
            deferred.add_range(self, range, op);
        }
    }

    /// Applies `op` over `range` to every copy-on-write descendant of
    /// `node`, projecting the range through each child's window. Holds at
    /// most one node lock at a time.
    pub(crate) fn range_change_cow_children(node: &Arc<Self>, range: VmCowRange, op: RangeChangeOp) {
        let mut cursor = TreeWalkCursor::new(node.clone());
        // Range as projected into the node at each depth of the walk.
        let mut ranges: Vec<VmCowRange> = alloc::vec![range];
        while let Some((locked, depth)) = cursor.next_locked() {
            debug_assert!(depth >= 1);
            if depth > ranges.len() {
                // A cursor fixup moved us somewhere the stack cannot
                // describe; bail out of this subtree conservatively.
                cursor.skip_children();
                continue;
            }
            let parent_range = ranges[depth - 1];
            let inner = locked.locked();
            let window = VmCowRange::new(inner.parent_offset, inner.parent_limit);
            let intersection = parent_range.intersect(window);
            if intersection.is_empty() {
                cursor.skip_children();
                continue;
            }
            let my_range = VmCowRange::new(intersection.offset - inner.parent_offset, intersection.len);
            if let Some(backlink) = inner.paged_ref.as_ref().and_then(|weak| weak.upgrade()) {
                backlink.range_change(my_range, op);
            }
            ranges.truncate(depth);
            ranges.push(my_range);
        }
    }

    // ----- tree maintenance -----

    /// Links `child` under `self`. Both nodes must be locked.
    pub(crate) fn add_child_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        child: &Arc<Self>,
        child_inner: &mut CowPagesInner,
        offset: u64,
        parent_limit: u64,
    ) {
        debug_assert!(child_inner.parent.is_none());
        child_inner.parent = Some(self.clone());
        child_inner.parent_offset = offset;
        child_inner.parent_limit = parent_limit;
        child_inner.root_parent_offset = inner
            .root_parent_offset
            .checked_add(offset)
            .expect("root projection overflow must be validated by the caller");
        inner.children.insert(0, Arc::downgrade(child));
        if child_inner.high_priority_count > 0 {
            Self::change_high_priority_count_locked(self, inner, 1);
        }
    }

    /// Unlinks `removed` from this node's child list. Both nodes must be
    /// locked; `removed.parent` is left untouched for the caller.
    pub(crate) fn remove_child_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        removed: &Arc<Self>,
        removed_inner: &mut CowPagesInner,
    ) {
        inner
            .children
            .retain(|weak| !core::ptr::eq(weak.as_ptr(), Arc::as_ptr(removed)));
        if removed_inner.high_priority_count > 0 {
            Self::change_high_priority_count_locked(self, inner, -1);
        }
    }

    /// Swaps `old` for `new` in the child list, preserving its position.
    pub(crate) fn replace_child_locked(
        inner: &mut CowPagesInner,
        old: &Arc<Self>,
        new: &Arc<Self>,
    ) {
        for weak in inner.children.iter_mut() {
            if core::ptr::eq(weak.as_ptr(), Arc::as_ptr(old)) {
                *weak = Arc::downgrade(new);
                return;
            }
        }
        debug_assert!(false, "old child not found");
    }

    /// Upgraded snapshot of the child list, head first.
    pub(crate) fn children_locked(inner: &CowPagesInner) -> Vec<Arc<Self>> {
        inner
            .children
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }

    /// When cleaning up a hidden node with a single remaining child,
    /// merges the hidden node's content and view of the parent into that
    /// child. Both nodes must be locked.
    pub(crate) fn merge_content_with_child_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        child: &Arc<Self>,
        child_inner: &mut CowPagesInner,
        freed: &mut ScopedPageFreedList,
    ) {
        debug_assert!(self.is_hidden());
        let child_offset = child_inner.parent_offset;
        let child_limit = child_inner.parent_limit;
        let visible = VmCowRange::new(child_offset, child_limit);

        // Move the content the child can see; everything else is
        // unreachable and gets freed. Content moving down must not be
        // shared anymore, as the child is the only remaining viewer.
        let child_arc = child.clone();
        inner.page_list.merge_range_onto_and_clear(
            visible,
            &mut child_inner.page_list,
            child_offset,
            |new_offset, entry| {
                if let VmPageOrMarker::Page(page) = entry {
                    debug_assert_eq!(page.share_count(), 0);
                    page.set_backlink(&child_arc, new_offset);
                }
            },
            |entry| freed.append_content(entry),
        );

        // The child takes over the hidden node's view of the grandparent.
        let grandparent = inner.parent.take();
        child_inner.parent = grandparent.clone();
        child_inner.parent_offset = inner.parent_offset + child_offset;
        child_inner.parent_limit =
            child_limit.min(inner.parent_limit.saturating_sub(child_offset));
        if let Some(grandparent) = &grandparent {
            let mut locked = LockedPtr::lock(grandparent);
            Self::replace_child_locked(locked.locked_mut(), self, child);
        }
        inner.children.clear();
        inner.parent_limit = 0;

        tree_cursor::on_node_merged(self, inner, child, child_inner);
    }

    // ----- life cycle -----

    fn should_dead_transition_locked(inner: &CowPagesInner) -> bool {
        inner.life_cycle == LifeCycle::Alive
            && inner.paged_ref.is_none()
            && inner.children.is_empty()
    }

    /// Transitions this node to `Dead` once it has become unreachable (no
    /// user-facing object and no children), releasing all owned pages and
    /// parent references. Propagates up the tree when the removal leaves a
    /// hidden parent childless or with a single mergeable child.
    pub fn dead_transition(self: &Arc<Self>) {
        let mut cur = Some(self.clone());
        while let Some(node) = cur.take() {
            cur = Self::dead_transition_one(&node);
        }
    }

    fn dead_transition_one(node: &Arc<Self>) -> Option<Arc<Self>> {
        let mut deferred = DeferredOps::new(node);
        let mut locked = LockedPtr::lock(node);
        if !Self::should_dead_transition_locked(locked.locked()) {
            if locked.locked().life_cycle == LifeCycle::Init {
                locked.locked_mut().life_cycle = LifeCycle::Dead;
            }
            return None;
        }
        locked.locked_mut().life_cycle = LifeCycle::Dying;
        if let Some(source) = &node.page_source {
            source.close();
        }
        if let Some(tracker) = &node.discardable_tracker {
            tracker.remove_from_discardable_list();
        }

        // Drop this node's claim on any content it could see through its
        // ancestors, then free everything it owns directly.
        let size = locked.locked().size;
        hierarchy::release_ancestor_views(
            node,
            locked.locked_mut(),
            VmCowRange::new(0, size),
            deferred.freed_list(),
        );
        let inner = locked.locked_mut();
        let mut released = Vec::new();
        inner.page_list.clear(|_, entry| released.push(entry));
        for entry in released {
            deferred.freed_list().append_content(entry);
        }
        inner.parent_limit = 0;

        let parent = locked.locked().parent.clone();
        let Some(parent) = parent else {
            tree_cursor::on_root_death(node, locked.locked_mut());
            locked.locked_mut().life_cycle = LifeCycle::Dead;
            return None;
        };

        let mut parent_locked = LockedPtr::lock(&parent);
        // A sibling lock is needed both for cursor fixups and for a
        // potential hidden-node merge.
        let sibling = {
            let parent_inner = parent_locked.locked();
            let children = Self::children_locked(parent_inner);
            let pos = children
                .iter()
                .position(|child| Arc::ptr_eq(child, node))
                .expect("dying node not in parent's child list");
            children
                .get(pos + 1)
                .or_else(|| if pos > 0 { children.get(pos - 1) } else { None })
                .cloned()
        };
        let mut sibling_locked = match &sibling {
            Some(sibling) => LockedPtr::lock(sibling),
            None => LockedPtr::none(),
        };

        tree_cursor::on_node_removed(
            node,
            locked.locked_mut(),
            &mut sibling_locked,
            &parent,
            parent_locked.locked_mut(),
        );
        Self::remove_child_locked(&parent, parent_locked.locked_mut(), node, locked.locked_mut());
        locked.locked_mut().parent = None;
        locked.locked_mut().life_cycle = LifeCycle::Dead;

        if !parent.is_hidden() {
            // A visible parent whose user-facing object is already gone
            // dies once its last child unlinks.
            if Self::should_dead_transition_locked(parent_locked.locked()) {
                return Some(parent.clone());
            }
            return None;
        }
        match Self::children_locked(parent_locked.locked()).len() {
            0 => Some(parent.clone()),
            1 => {
                let child = sibling.expect("hidden node with one child but no sibling");
                debug_assert!(sibling_locked.is_some());
                Self::merge_content_with_child_locked(
                    &parent,
                    parent_locked.locked_mut(),
                    &child,
                    sibling_locked.locked_mut(),
                    deferred.freed_list(),
                );
                Some(parent.clone())
            }
            _ => None,
        }
    }

    // ----- page bookkeeping helpers -----

    /// Parks a newly added, unpinned page in its appropriate queue.
    pub(crate) fn set_not_pinned_queue(&self, page: &Arc<VmPage>, zero_fork: bool) {
        let queue = if self.is_source_preserving_page_content() {
            if page.is_dirty() || page.is_awaiting_clean() {
                PageQueue::PagerBackedDirty
            } else {
                PageQueue::PagerBacked
            }
        } else if zero_fork {
            PageQueue::AnonymousZeroFork
        } else {
            PageQueue::Anonymous
        };
        pmm::page_queues().set_to(page, queue);
    }

    /// Re-parks an existing, unpinned page after a state change.
    pub(crate) fn move_not_pinned_queue(&self, page: &Arc<VmPage>) {
        let queue = if self.is_source_preserving_page_content() {
            if page.is_dirty() || page.is_awaiting_clean() {
                PageQueue::PagerBackedDirty
            } else {
                PageQueue::PagerBacked
            }
        } else {
            PageQueue::Anonymous
        };
        pmm::page_queues().move_to(page, queue);
    }

    fn check_overwrite(
        entry: &VmPageOrMarker,
        in_interval: bool,
        overwrite: CanOverwriteContent,
    ) -> Result<()> {
        let has_zero_content = entry.is_marker() || in_interval;
        let has_content = entry.is_content() || entry.is_parent_content();
        match overwrite {
            CanOverwriteContent::None if has_content || in_interval => Err(Error::AlreadyExists),
            CanOverwriteContent::Zero if has_content && !has_zero_content => {
                Err(Error::AlreadyExists)
            }
            _ => {
                if let Some(page) = entry.page()
                    && page.is_pinned()
                {
                    return Err(Error::BadState);
                }
                Ok(())
            }
        }
    }

    /// Installs `entry` at `offset`, subject to the overwrite policy.
    ///
    /// On success any displaced content is staged on `deferred`'s freed
    /// list and the offset is unmapped from existing mappings (a zero
    /// slot displacement downgrades to an `UnmapZeroPage`).
    pub(crate) fn add_page_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        offset: u64,
        entry: VmPageOrMarker,
        overwrite: CanOverwriteContent,
        zero_fork: bool,
        deferred: Option<&mut DeferredOps>,
    ) -> Result<()> {
        debug_assert!(offset % PAGE_SIZE == 0 && offset < inner.size);
        // Check before mutating so a refused insert leaves no trace.
        {
            let (slot, in_interval) = inner
                .page_list
                .lookup_or_allocate(offset, InsertIntervalPolicy::CheckForInterval)?;
            Self::check_overwrite(slot, in_interval, overwrite)?;
        }
        let new_page = entry.page().cloned();
        let (slot, _was_in_interval) = inner
            .page_list
            .lookup_or_allocate(offset, InsertIntervalPolicy::SplitInterval)?;
        if let VmPageOrMarker::Page(page) = &entry {
            page.set_backlink(self, offset);
        }
        let old = slot.replace(entry);
        let had_visible_content = old.is_page() || old.is_reference();
        if let Some(page) = &new_page
            && !page.is_pinned()
        {
            self.set_not_pinned_queue(page, zero_fork);
        }
        let op = if had_visible_content {
            RangeChangeOp::Unmap
        } else {
            RangeChangeOp::UnmapZeroPage
        };
        if let Some(deferred) = deferred {
            self.range_change_update_locked(
                inner,
                VmCowRange::new(offset, PAGE_SIZE),
                op,
                Some(deferred),
            );
            match old {
                VmPageOrMarker::Page(page) => {
                    pmm::page_queues().remove(&page);
                    page.clear_backlink();
                    deferred.freed_list().append(page);
                }
                VmPageOrMarker::Reference(reference) => {
                    deferred
                        .freed_list()
                        .append_content(VmPageOrMarker::Reference(reference));
                }
                _ => {}
            }
        } else {
            debug_assert!(!had_visible_content);
        }
        Ok(())
    }

    /// Removes the page at `offset` from this node and stages it for
    /// freeing, unmapping the offset.
    pub(crate) fn remove_page_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        offset: u64,
        deferred: &mut DeferredOps,
    ) {
        let entry = inner.page_list.remove_content(offset);
        self.range_change_update_locked(
            inner,
            VmCowRange::new(offset, PAGE_SIZE),
            RangeChangeOp::Unmap,
            Some(deferred),
        );
        match entry {
            VmPageOrMarker::Page(page) => {
                pmm::page_queues().remove(&page);
                page.clear_backlink();
                deferred.freed_list().append(page);
            }
            entry => deferred.freed_list().append_content(entry),
        }
    }

    /// Whether any page in `range` is pinned.
    pub(crate) fn any_pages_pinned_locked(inner: &CowPagesInner, range: VmCowRange) -> bool {
        let mut pinned = false;
        inner.page_list.for_every_page_in_range(range, |_, entry| {
            if let Some(page) = entry.page()
                && page.is_pinned()
            {
                pinned = true;
                return core::ops::ControlFlow::Break(());
            }
            core::ops::ControlFlow::Continue(())
        });
        pinned
    }

    // ----- debug validation -----

    /// Checks that every page in this node points back at it.
    pub fn debug_validate_backlinks(self: &Arc<Self>) -> bool {
        let inner = self.inner.lock();
        let mut valid = true;
        inner
            .page_list
            .for_every_page_in_range(VmCowRange::new(0, inner.size), |offset, entry| {
                if let Some(page) = entry.page()
                    && !page.backlink_matches(self, offset)
                {
                    valid = false;
                    return core::ops::ControlFlow::Break(());
                }
                core::ops::ControlFlow::Continue(())
            });
        valid
    }

    /// Checks that zero intervals only exist where the root preserves
    /// content, that sentinels pair up with matching dirty states, and
    /// that nothing lies strictly between a pair.
    pub fn debug_validate_zero_intervals(&self) -> bool {
        let inner = self.inner.lock();
        let mut valid = true;
        inner.page_list.visit_range(
            VmCowRange::new(0, inner.size.max(PAGE_SIZE * PAGE_FAN_OUT)),
            |item| {
                use crate::page_list::PlItem;
                if let PlItem::Interval { range, interval_start, dirty_state, .. } = item {
                    if !self.is_root_source_preserving_page_content() {
                        valid = false;
                    }
                    if dirty_state == DirtyState::Clean {
                        valid = false;
                    }
                    // The sentinel pair must agree on the dirty state and
                    // have only empty slots between them.
                    if let Some((start, end, state, _)) =
                        inner.page_list.enclosing_interval(range.offset)
                    {
                        if start != interval_start || state != dirty_state {
                            valid = false;
                        }
                        let mut between = start + PAGE_SIZE;
                        while between < end {
                            if inner.page_list.lookup(between).is_some() {
                                valid = false;
                                break;
                            }
                            between += PAGE_SIZE;
                        }
                    } else {
                        valid = false;
                    }
                }
                if valid {
                    core::ops::ControlFlow::Continue(())
                } else {
                    core::ops::ControlFlow::Break(())
                }
            },
        );
        valid
    }

    /// Checks that, for every content entry owned by this (hidden) node,
    /// the number of visible descendants that resolve the offset to it is
    /// exactly the entry's share count plus one.
    pub fn debug_validate_page_sharing(self: &Arc<Self>) -> bool {
        if !self.is_hidden() {
            return true;
        }
        let inner = self.inner.lock();
        let mut valid = true;
        let mut offsets = Vec::new();
        inner
            .page_list
            .for_every_page_in_range(VmCowRange::new(0, inner.size), |offset, entry| {
                let share = match entry {
                    VmPageOrMarker::Page(page) => page.share_count(),
                    VmPageOrMarker::Reference(reference) => crate::compression::active_compressor()
                        .map(|compressor| compressor.metadata(*reference))
                        .unwrap_or(0),
                    _ => return core::ops::ControlFlow::Continue(()),
                };
                offsets.push((offset, share));
                core::ops::ControlFlow::Continue(())
            });
        let children = Self::children_locked(&inner);
        drop(inner);
        for (offset, share) in offsets {
            let mut viewers = 0u32;
            for child in &children {
                viewers += Self::count_viewers(child, offset);
            }
            if viewers != share + 1 {
                valid = false;
            }
        }
        valid
    }

    fn count_viewers(node: &Arc<Self>, parent_offset: u64) -> u32 {
        let inner = node.inner.lock();
        if parent_offset < inner.parent_offset
            || parent_offset - inner.parent_offset >= inner.parent_limit
        {
            return 0;
        }
        let offset = parent_offset - inner.parent_offset;
        let slot = inner.page_list.lookup(offset);
        let sees = match slot {
            Some(entry) if entry.is_parent_content() => true,
            Some(entry) if entry.is_content() => false,
            _ => !node.node_has_parent_content_markers(),
        };
        if !sees {
            return 0;
        }
        if !node.is_hidden() {
            return 1;
        }
        let children = Self::children_locked(&inner);
        drop(inner);
        children
            .iter()
            .map(|child| Self::count_viewers(child, offset))
            .sum()
    }
}

impl Drop for VmCowPages {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        debug_assert!(
            matches!(inner.life_cycle, LifeCycle::Init | LifeCycle::Dead),
            "node dropped while {:?}",
            inner.life_cycle
        );
    }
}
