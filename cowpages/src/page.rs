// SPDX-License-Identifier: MPL-2.0

//! Physical page objects and their per-page metadata.

use alloc::sync::{Arc, Weak};
use core::alloc::Layout;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use spin::Mutex;

use crate::cow::VmCowPages;
use crate::error::{Error, Result};
use crate::pmm::queues::PageQueue;
use crate::PAGE_SIZE;

/// A physical address. The backing frames of this crate live on the heap
/// and the physical map is the identity, so a `Paddr` is directly usable
/// as a pointer value.
pub type Paddr = usize;

/// The maximum number of times a single page may be pinned.
pub const MAX_PIN_COUNT: u8 = 31;

/// Dirty tracking state of a page, for pages in hierarchies whose root
/// page source preserves content.
///
/// The transitions between the three tracked states can roughly be
/// summarized as follows:
/// 1. A page starts off as `Clean` when supplied.
/// 2. A write transitions the page from `Clean` to `Dirty`.
/// 3. A writeback-begin moves the `Dirty` page to `AwaitingClean`.
/// 4. A writeback-end moves the `AwaitingClean` page to `Clean`.
/// 5. A write that comes in while the writeback is in progress moves the
///    `AwaitingClean` page back to `Dirty`.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DirtyState {
    /// The page is not dirty tracked.
    Untracked = 0,
    /// The page content matches what the page source holds; evictable.
    Clean = 1,
    /// The page was modified after supply and must be written back.
    Dirty = 2,
    /// A writeback is in progress; retained until writeback-end.
    AwaitingClean = 3,
}

impl DirtyState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Untracked,
            1 => Self::Clean,
            2 => Self::Dirty,
            3 => Self::AwaitingClean,
            _ => unreachable!(),
        }
    }
}

/// Identifies the node and offset that own a page.
pub struct PageBacklink {
    pub node: Weak<VmCowPages>,
    pub offset: u64,
}

/// A page of physical memory together with the metadata the
/// copy-on-write engine keeps per page.
///
/// The mutable metadata fields are logically guarded by the lock of the
/// owning node (the backlink target); they are stored as atomics so that
/// shared `Arc` references stay sound.
pub struct VmPage {
    paddr: Paddr,
    pin_count: AtomicU8,
    share_count: AtomicU32,
    dirty_state: AtomicU8,
    always_need: AtomicBool,
    loaned: AtomicBool,
    accessed: AtomicBool,
    queue: AtomicU8,
    backlink: Mutex<Option<PageBacklink>>,
}

impl VmPage {
    /// Allocates a new uninitialized page frame.
    pub(crate) fn alloc(loaned: bool) -> Result<Arc<VmPage>> {
        let layout = Layout::from_size_align(PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        // SAFETY: the layout has a non-zero size.
        let frame = unsafe { alloc::alloc::alloc(layout) };
        if frame.is_null() {
            return Err(Error::NoMemory);
        }
        Ok(Arc::new(VmPage {
            paddr: frame as Paddr,
            pin_count: AtomicU8::new(0),
            share_count: AtomicU32::new(0),
            dirty_state: AtomicU8::new(DirtyState::Untracked as u8),
            always_need: AtomicBool::new(false),
            loaned: AtomicBool::new(loaned),
            accessed: AtomicBool::new(false),
            queue: AtomicU8::new(PageQueue::None as u8),
            backlink: Mutex::new(None),
        }))
    }

    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    pub fn pin_count(&self) -> u8 {
        self.pin_count.load(Ordering::Relaxed)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Increments the pin count, failing with [`Error::Unavailable`] at
    /// the saturation limit.
    pub(crate) fn pin(&self) -> Result<()> {
        let count = self.pin_count.load(Ordering::Relaxed);
        if count == MAX_PIN_COUNT {
            return Err(Error::Unavailable);
        }
        self.pin_count.store(count + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Decrements the pin count, returning the new value.
    pub(crate) fn unpin(&self) -> u8 {
        let count = self.pin_count.load(Ordering::Relaxed);
        assert!(count > 0, "unpin of an unpinned page");
        self.pin_count.store(count - 1, Ordering::Relaxed);
        count - 1
    }

    pub fn share_count(&self) -> u32 {
        self.share_count.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_share_count(&self) {
        self.share_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the share count, returning the previous value.
    pub(crate) fn decrement_share_count(&self) -> u32 {
        let count = self.share_count.load(Ordering::Relaxed);
        assert!(count > 0, "share count underflow");
        self.share_count.store(count - 1, Ordering::Relaxed);
        count
    }

    pub(crate) fn set_share_count(&self, count: u32) {
        self.share_count.store(count, Ordering::Relaxed);
    }

    pub fn dirty_state(&self) -> DirtyState {
        DirtyState::from_raw(self.dirty_state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_dirty_state(&self, state: DirtyState) {
        self.dirty_state.store(state as u8, Ordering::Relaxed);
    }

    pub fn is_dirty_tracked(&self) -> bool {
        self.dirty_state() != DirtyState::Untracked
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_state() == DirtyState::Dirty
    }

    pub fn is_clean(&self) -> bool {
        self.dirty_state() == DirtyState::Clean
    }

    pub fn is_awaiting_clean(&self) -> bool {
        self.dirty_state() == DirtyState::AwaitingClean
    }

    pub fn always_need(&self) -> bool {
        self.always_need.load(Ordering::Relaxed)
    }

    pub(crate) fn set_always_need(&self, value: bool) {
        self.always_need.store(value, Ordering::Relaxed);
    }

    pub fn is_loaned(&self) -> bool {
        self.loaned.load(Ordering::Relaxed)
    }

    pub fn is_accessed(&self) -> bool {
        self.accessed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_accessed(&self, value: bool) {
        self.accessed.store(value, Ordering::Relaxed);
    }

    pub(crate) fn queue(&self) -> PageQueue {
        PageQueue::from_raw(self.queue.load(Ordering::Relaxed))
    }

    pub(crate) fn set_queue(&self, queue: PageQueue) {
        self.queue.store(queue as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_backlink(&self, node: &Arc<VmCowPages>, offset: u64) {
        *self.backlink.lock() = Some(PageBacklink {
            node: Arc::downgrade(node),
            offset,
        });
    }

    pub(crate) fn clear_backlink(&self) {
        *self.backlink.lock() = None;
    }

    /// Whether this page is currently attributed to `node` at `offset`.
    pub fn backlink_matches(&self, node: &Arc<VmCowPages>, offset: u64) -> bool {
        let backlink = self.backlink.lock();
        match &*backlink {
            Some(link) => link.offset == offset && Weak::ptr_eq(&link.node, &Arc::downgrade(node)),
            None => false,
        }
    }

    pub(crate) fn backlink_offset(&self) -> Option<u64> {
        self.backlink.lock().as_ref().map(|link| link.offset)
    }

    /// Copies the copy-on-write metadata from `src` in preparation for
    /// replacing `src` with this page. Contents are copied separately with
    /// [`VmPage::copy_contents_from`].
    pub(crate) fn copy_metadata_from(&self, src: &VmPage) {
        self.set_share_count(src.share_count());
        self.set_dirty_state(src.dirty_state());
        self.set_always_need(src.always_need());
    }

    fn frame(&self) -> *mut u8 {
        self.paddr as *mut u8
    }

    /// Fills the page with zeros.
    pub fn zero(&self) {
        // SAFETY: the frame covers PAGE_SIZE writable bytes and content
        // access is serialized by the owning node's lock.
        unsafe { core::ptr::write_bytes(self.frame(), 0, PAGE_SIZE as usize) };
    }

    /// Copies the full contents of `src` into this page.
    pub fn copy_contents_from(&self, src: &VmPage) {
        // SAFETY: both frames cover PAGE_SIZE bytes and do not overlap.
        unsafe { core::ptr::copy_nonoverlapping(src.frame(), self.frame(), PAGE_SIZE as usize) };
    }

    /// Reads `buf.len()` bytes starting at `at` within the page.
    pub fn read_bytes(&self, at: usize, buf: &mut [u8]) {
        assert!(at + buf.len() <= PAGE_SIZE as usize);
        // SAFETY: the source range is within the frame.
        unsafe { core::ptr::copy_nonoverlapping(self.frame().add(at), buf.as_mut_ptr(), buf.len()) };
    }

    /// Writes `buf` into the page starting at `at`.
    pub fn write_bytes(&self, at: usize, buf: &[u8]) {
        assert!(at + buf.len() <= PAGE_SIZE as usize);
        // SAFETY: the destination range is within the frame.
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), self.frame().add(at), buf.len()) };
    }

    /// Whether every byte of the page is zero.
    pub fn is_all_zeroes(&self) -> bool {
        // SAFETY: the frame covers PAGE_SIZE readable bytes.
        let slice = unsafe { core::slice::from_raw_parts(self.frame(), PAGE_SIZE as usize) };
        slice.iter().all(|b| *b == 0)
    }
}

impl Drop for VmPage {
    fn drop(&mut self) {
        debug_assert!(!self.is_pinned(), "pinned page dropped");
        let layout = Layout::from_size_align(PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        // SAFETY: the frame was allocated in `VmPage::alloc` with the same
        // layout and is not referenced anymore.
        unsafe { alloc::alloc::dealloc(self.frame(), layout) };
    }
}
