// SPDX-License-Identifier: MPL-2.0

//! Deferred completion of operations that must run after the node lock is
//! released.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::compression;
use crate::page::VmPage;
use crate::page_source::PageSource;
use crate::page_list::VmPageOrMarker;
use crate::pmm::{self, FreeLoanedPagesHolder};
use crate::range::VmCowRange;

use super::VmCowPages;

/// A mapping-layer invalidation applied to a range of a node and its
/// copy-on-write descendants.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RangeChangeOp {
    /// Remove all mappings of the range.
    Unmap,
    /// Remove mappings of the range known to only contain zero pages.
    /// Upgrades to `Unmap` when combined with one.
    UnmapZeroPage,
    /// Remove write permission from mappings of the range.
    RemoveWrite,
    /// Remove mappings and harvest accessed bits into the page queues.
    UnmapAndHarvest,
    /// Debug notification that a pinned range was unpinned.
    DebugUnpin,
}

/// Collects pages to free once the owning node's lock has been dropped.
#[derive(Default)]
pub struct ScopedPageFreedList {
    pages: Vec<Arc<VmPage>>,
    loaned: FreeLoanedPagesHolder,
}

impl ScopedPageFreedList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a page for freeing.
    pub fn append(&mut self, page: Arc<VmPage>) {
        if page.is_loaned() {
            pmm::begin_free_loaned_page(page, &mut self.loaned);
        } else {
            self.pages.push(page);
        }
    }

    /// Stages whatever resources `entry` holds. References are released
    /// through the active compressor.
    pub(crate) fn append_content(&mut self, entry: VmPageOrMarker) {
        match entry {
            VmPageOrMarker::Page(page) => self.append(page),
            VmPageOrMarker::Reference(reference) => {
                if let Some(compressor) = compression::active_compressor() {
                    compressor.free_reference(reference);
                }
            }
            VmPageOrMarker::Empty | VmPageOrMarker::Marker => {}
            VmPageOrMarker::ParentContent => {
                debug_assert!(false, "parent content released without share accounting")
            }
            _ => debug_assert!(false, "interval sentinel in a freed list"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Frees everything staged, routing source-provided pages through
    /// `source` when it handles freeing.
    pub fn free(&mut self, source: Option<&Arc<PageSource>>) {
        if !self.pages.is_empty() {
            match source {
                Some(source) if source.properties().is_providing_specific_physical_pages => {
                    source.free_pages(&mut self.pages);
                }
                _ => pmm::free_pages(&mut self.pages),
            }
        }
        pmm::finish_free_loaned_pages(&mut self.loaned);
    }
}

/// Scope object finishing a node operation after its lock is dropped.
///
/// Constructed without the node lock held; its destructor runs after the
/// lock is released:
///
/// ```ignore
/// let mut deferred = DeferredOps::new(&node);
/// let mut locked = LockedPtr::lock(&node);
/// node.some_operation_locked(locked.locked_mut(), &mut deferred)?;
/// drop(locked);
/// // `deferred` drops here: range changes fan out, pages are freed.
/// ```
///
/// For a hierarchy rooted in a page source, construction acquires the
/// pager hierarchy lock and holds a strong reference to the source so the
/// lock outlives any concurrent tree teardown. This serializes every
/// mutating operation over the hierarchy, so user space never observes a
/// partially updated tree.
pub struct DeferredOps {
    node: Arc<VmCowPages>,
    range_op: Option<(VmCowRange, RangeChangeOp)>,
    freed: ScopedPageFreedList,
    locked_source: Option<Arc<PageSource>>,
}

impl DeferredOps {
    pub fn new(node: &Arc<VmCowPages>) -> Self {
        let locked_source = node.root_source().cloned().inspect(|source| {
            source.lock_hierarchy();
        });
        Self {
            node: node.clone(),
            range_op: None,
            freed: ScopedPageFreedList::new(),
            locked_source,
        }
    }

    /// Accumulates a range change to apply to the node's copy-on-write
    /// descendants after the lock is dropped. Ranges are combined into
    /// their cover; `UnmapZeroPage` upgrades to `Unmap` when mixed, any
    /// other mix is a programming error.
    pub(crate) fn add_range(&mut self, node: &Arc<VmCowPages>, range: VmCowRange, op: RangeChangeOp) {
        debug_assert!(Arc::ptr_eq(node, &self.node));
        match &mut self.range_op {
            None => self.range_op = Some((range, op)),
            Some((acc_range, acc_op)) => {
                let op = match (*acc_op, op) {
                    (a, b) if a == b => a,
                    (RangeChangeOp::Unmap, RangeChangeOp::UnmapZeroPage)
                    | (RangeChangeOp::UnmapZeroPage, RangeChangeOp::Unmap) => RangeChangeOp::Unmap,
                    (a, b) => {
                        debug_assert!(false, "incompatible range ops {a:?} and {b:?}");
                        RangeChangeOp::Unmap
                    }
                };
                *acc_range = acc_range.cover(range);
                *acc_op = op;
            }
        }
    }

    pub(crate) fn freed_list(&mut self) -> &mut ScopedPageFreedList {
        &mut self.freed
    }
}

impl Drop for DeferredOps {
    fn drop(&mut self) {
        if let Some((range, op)) = self.range_op.take() {
            VmCowPages::range_change_cow_children(&self.node, range, op);
        }
        self.freed.free(self.locked_source.as_ref());
        if let Some(source) = self.locked_source.take() {
            source.unlock_hierarchy();
        }
    }
}
