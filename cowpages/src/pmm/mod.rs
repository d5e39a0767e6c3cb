// SPDX-License-Identifier: MPL-2.0

//! A physical memory manager for the copy-on-write engine.
//!
//! Frames live on the heap and the physical map is the identity, which
//! keeps the engine testable as a standalone library while preserving the
//! allocate/free/loan surface a kernel provides.

pub mod queues;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, Once};

use crate::error::Result;
use crate::page::VmPage;

use queues::PageQueues;

bitflags::bitflags! {
    /// Flags controlling page allocation behavior.
    pub struct PmmAllocFlags: u32 {
        /// The caller can wait for memory to become available; transient
        /// failures should be reported as a waitable request.
        const CAN_WAIT = 1 << 0;
        /// The allocation may be satisfied with a loaned page.
        const CAN_BORROW = 1 << 1;
    }
}

struct PmmNode {
    queues: PageQueues,
    allocated: AtomicU64,
    loaned: AtomicU64,
    cache: Mutex<Vec<Arc<VmPage>>>,
    zero_page: Once<Arc<VmPage>>,
}

static PMM: Once<PmmNode> = Once::new();

fn pmm() -> &'static PmmNode {
    PMM.call_once(|| PmmNode {
        queues: PageQueues::new(),
        allocated: AtomicU64::new(0),
        loaned: AtomicU64::new(0),
        cache: Mutex::new(Vec::new()),
        zero_page: Once::new(),
    })
}

/// Seeds the process-wide page cache used for batch allocations. Called
/// once at initialization, before any other thread runs; later calls only
/// grow the cache.
pub fn init_page_cache(pages: usize) -> Result<()> {
    let node = pmm();
    let mut cache = node.cache.lock();
    while cache.len() < pages {
        let page = VmPage::alloc(false)?;
        cache.push(page);
    }
    Ok(())
}

/// Allocates a single page.
pub fn alloc_page(_flags: PmmAllocFlags) -> Result<Arc<VmPage>> {
    let node = pmm();
    let page = match node.cache.lock().pop() {
        Some(page) => page,
        None => VmPage::alloc(false)?,
    };
    node.allocated.fetch_add(1, Ordering::Relaxed);
    Ok(page)
}

/// Allocates `count` pages into `list`. On failure the pages allocated so
/// far remain in `list` for the caller to free.
pub fn alloc_pages(count: usize, flags: PmmAllocFlags, list: &mut Vec<Arc<VmPage>>) -> Result<()> {
    for _ in 0..count {
        list.push(alloc_page(flags)?);
    }
    Ok(())
}

/// Allocates a loaned page, invoking `init` on it before it becomes
/// visible to the caller.
pub fn alloc_loaned_page<F>(init: F) -> Result<Arc<VmPage>>
where
    F: FnOnce(&Arc<VmPage>),
{
    let node = pmm();
    let page = VmPage::alloc(true)?;
    node.allocated.fetch_add(1, Ordering::Relaxed);
    node.loaned.fetch_add(1, Ordering::Relaxed);
    init(&page);
    Ok(page)
}

/// Returns a page to the allocator. The caller must hold the only
/// remaining reference.
pub fn free_page(page: Arc<VmPage>) {
    let node = pmm();
    debug_assert!(!page.is_pinned());
    node.queues.remove(&page);
    page.clear_backlink();
    if page.is_loaned() {
        node.loaned.fetch_sub(1, Ordering::Relaxed);
    }
    node.allocated.fetch_sub(1, Ordering::Relaxed);
    drop(page);
}

/// Returns every page in `list` to the allocator.
pub fn free_pages(list: &mut Vec<Arc<VmPage>>) {
    for page in list.drain(..) {
        free_page(page);
    }
}

/// Holds loaned pages through the two-phase free protocol.
#[derive(Default)]
pub struct FreeLoanedPagesHolder {
    pages: Vec<Arc<VmPage>>,
}

/// Stages a loaned page for freeing. The page stays owned by the holder
/// until [`finish_free_loaned_pages`] runs.
pub fn begin_free_loaned_page(page: Arc<VmPage>, holder: &mut FreeLoanedPagesHolder) {
    debug_assert!(page.is_loaned());
    page.clear_backlink();
    holder.pages.push(page);
}

/// Completes the free of all staged loaned pages.
pub fn finish_free_loaned_pages(holder: &mut FreeLoanedPagesHolder) {
    for page in holder.pages.drain(..) {
        free_page(page);
    }
}

/// The process-wide page queues.
pub fn page_queues() -> &'static PageQueues {
    &pmm().queues
}

/// The singleton zero page. It is never placed in a page list and never
/// freed.
pub fn zero_page() -> &'static Arc<VmPage> {
    let node = pmm();
    node.zero_page
        .call_once(|| {
            let page = VmPage::alloc(false).expect("cannot allocate the zero page");
            page.zero();
            page
        })
}

/// The number of pages currently allocated, for diagnostics and tests.
pub fn allocated_pages() -> u64 {
    pmm().allocated.load(Ordering::Relaxed)
}

/// The number of loaned pages currently outstanding.
pub fn loaned_pages() -> u64 {
    pmm().loaned.load(Ordering::Relaxed)
}
