// SPDX-License-Identifier: MPL-2.0

//! Reclamation page queues.
//!
//! Pages are parked in age-tracked queues so that reclamation can pick
//! candidates by kind. This rendition keeps the queue tag and the accessed
//! bit on the page itself plus per-queue counts; ordering within a queue is
//! a policy of the enclosing system and not needed by the engine.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::page::VmPage;

/// The queue a page is currently parked in.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageQueue {
    /// Not in any queue.
    None = 0,
    /// Pinned pages; exempt from reclamation.
    Wired = 1,
    /// Anonymous pages.
    Anonymous = 2,
    /// Anonymous pages that were forked from the zero page.
    AnonymousZeroFork = 3,
    /// Clean pages supplied by a user pager; evictable.
    PagerBacked = 4,
    /// Dirty or awaiting-clean pager-backed pages; not evictable.
    PagerBackedDirty = 5,
}

const QUEUE_COUNT: usize = 6;

impl PageQueue {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Wired,
            2 => Self::Anonymous,
            3 => Self::AnonymousZeroFork,
            4 => Self::PagerBacked,
            5 => Self::PagerBackedDirty,
            _ => unreachable!(),
        }
    }
}

/// Tracks which queue every page is in.
pub struct PageQueues {
    counts: [AtomicU64; QUEUE_COUNT],
}

impl PageQueues {
    pub(crate) fn new() -> Self {
        Self {
            counts: [const { AtomicU64::new(0) }; QUEUE_COUNT],
        }
    }

    fn transition(&self, page: &VmPage, to: PageQueue) {
        let from = page.queue();
        if from != PageQueue::None {
            self.counts[from as usize].fetch_sub(1, Ordering::Relaxed);
        }
        if to != PageQueue::None {
            self.counts[to as usize].fetch_add(1, Ordering::Relaxed);
        }
        page.set_queue(to);
    }

    /// Places a page that is not yet in any queue.
    pub fn set_to(&self, page: &VmPage, queue: PageQueue) {
        debug_assert_eq!(page.queue(), PageQueue::None);
        page.set_accessed(true);
        self.transition(page, queue);
    }

    /// Moves a page between queues, leaving its age intact.
    pub fn move_to(&self, page: &VmPage, queue: PageQueue) {
        self.transition(page, queue);
    }

    /// Records an access, protecting the page from imminent reclamation.
    pub fn mark_accessed(&self, page: &VmPage) {
        page.set_accessed(true);
    }

    /// Clears the accessed state, typically after an unmap-and-harvest, so
    /// that a later check can tell whether the page was touched again.
    pub fn clear_accessed(&self, page: &VmPage) {
        page.set_accessed(false);
    }

    /// Removes a page from its queue.
    pub fn remove(&self, page: &VmPage) {
        self.transition(page, PageQueue::None);
    }

    /// The number of pages currently in `queue`.
    pub fn count(&self, queue: PageQueue) -> u64 {
        self.counts[queue as usize].load(Ordering::Relaxed)
    }
}
