// SPDX-License-Identifier: MPL-2.0

//! Externally sourced page content.
//!
//! A [`PageSource`] sits at the root of a hierarchy whose initial content
//! comes from outside the physical memory manager: a user pager, a
//! contiguous range, or specific physical pages. The source tracks the
//! outstanding read and dirty requests and owns the lock that serializes
//! every mutating operation over the hierarchy.
//!
//! The transport behind the source is a [`PageProvider`]; the engine only
//! signals it and resolves its requests, it never blocks internally. All
//! waiting is explicit through [`PageRequest`] objects handed back to the
//! caller together with [`Error::ShouldWait`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::error::{Error, Result};
use crate::page::VmPage;
use crate::pmm;
use crate::range::VmCowRange;

/// Static properties of a page source.
#[derive(Clone, Copy, Debug)]
pub struct PageSourceProperties {
    /// Whether the source retains page content, so pages have meaningful
    /// dirty states and must be written back rather than silently dropped.
    pub is_preserving_page_content: bool,
    /// Whether the source supplies specific physical pages and therefore
    /// also handles freeing them.
    pub is_providing_specific_physical_pages: bool,
    /// Whether Clean to Dirty transitions must be trapped and acknowledged
    /// by the source before a write may proceed.
    pub should_trap_dirty_transitions: bool,
}

/// The transport that fulfills page source requests.
pub trait PageProvider: Send + Sync {
    fn properties(&self) -> PageSourceProperties;

    /// Notifies the provider that content for `range` is needed.
    fn send_read_request(&self, range: VmCowRange);

    /// Notifies the provider that a Clean to Dirty transition for `range`
    /// awaits acknowledgement.
    fn send_dirty_request(&self, range: VmCowRange);

    /// Frees pages on behalf of the source. Only consulted when the source
    /// provides specific physical pages.
    fn free_pages(&self, pages: &mut Vec<Arc<VmPage>>) {
        pmm::free_pages(pages);
    }

    fn on_detach(&self) {}

    fn on_close(&self) {}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RequestKind {
    Read,
    Dirty,
}

struct RequestState {
    kind: RequestKind,
    range: VmCowRange,
    status: Option<Result<()>>,
}

struct RequestInner {
    state: Mutex<RequestState>,
}

impl RequestInner {
    fn resolve(&self, status: Result<()>) {
        let mut state = self.state.lock();
        if state.status.is_none() {
            state.status = Some(status);
        }
    }
}

/// A waitable token populated when an operation returns
/// [`Error::ShouldWait`].
///
/// In a kernel the wait would block the calling thread; in this standalone
/// rendition [`PageRequest::wait`] reports the resolution recorded so far,
/// returning [`Error::ShouldWait`] again if the provider has not yet
/// responded.
#[derive(Default)]
pub struct PageRequest {
    inner: Option<Arc<RequestInner>>,
}

impl PageRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this request has been populated by an operation.
    pub fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    /// The range the request covers, if populated.
    pub fn range(&self) -> Option<VmCowRange> {
        self.inner.as_ref().map(|inner| inner.state.lock().range)
    }

    /// Consumes the resolution of the request. On success the request is
    /// reset and the caller should retry the original operation.
    pub fn wait(&mut self) -> Result<()> {
        let Some(inner) = self.inner.as_ref() else {
            return Err(Error::BadState);
        };
        let status = inner.state.lock().status;
        match status {
            Some(status) => {
                self.inner = None;
                status
            }
            None => Err(Error::ShouldWait),
        }
    }
}

/// A page request bundle covering the different waits a single operation
/// can produce: a content read and a dirty transition.
#[derive(Default)]
pub struct MultiPageRequest {
    read: PageRequest,
    dirty: PageRequest,
}

impl MultiPageRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read_request(&mut self) -> &mut PageRequest {
        &mut self.read
    }

    pub(crate) fn dirty_request(&mut self) -> &mut PageRequest {
        &mut self.dirty
    }

    pub fn read(&self) -> &PageRequest {
        &self.read
    }

    pub fn dirty(&self) -> &PageRequest {
        &self.dirty
    }

    /// Waits on whichever sub-request was populated.
    pub fn wait(&mut self) -> Result<()> {
        if self.read.is_initialized() {
            return self.read.wait();
        }
        if self.dirty.is_initialized() {
            return self.dirty.wait();
        }
        Err(Error::BadState)
    }
}

/// A provider of pages from outside the kernel-owned physical memory
/// manager, together with its request bookkeeping.
pub struct PageSource {
    provider: Arc<dyn PageProvider>,
    properties: PageSourceProperties,
    detached: AtomicBool,
    closed: AtomicBool,
    requests: Mutex<Vec<Arc<RequestInner>>>,
    // Serializes every mutating operation over the whole hierarchy rooted
    // at the node owning this source. Held via DeferredOps.
    hierarchy_lock: Mutex<()>,
}

impl PageSource {
    pub fn new(provider: Arc<dyn PageProvider>) -> Arc<Self> {
        let properties = provider.properties();
        Arc::new(Self {
            provider,
            properties,
            detached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            hierarchy_lock: Mutex::new(()),
        })
    }

    pub fn properties(&self) -> PageSourceProperties {
        self.properties
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Relaxed)
    }

    fn register(&self, kind: RequestKind, range: VmCowRange, request: &mut PageRequest) {
        let inner = Arc::new(RequestInner {
            state: Mutex::new(RequestState {
                kind,
                range,
                status: None,
            }),
        });
        self.requests.lock().push(inner.clone());
        request.inner = Some(inner);
    }

    /// Issues an asynchronous read request for `range` and populates
    /// `request` with the corresponding wait token.
    pub fn get_pages(&self, range: VmCowRange, request: &mut PageRequest) -> Result<()> {
        if self.is_detached() {
            return Err(Error::BadState);
        }
        self.register(RequestKind::Read, range, request);
        self.provider.send_read_request(range);
        Ok(())
    }

    /// Issues an asynchronous dirty transition request for `range`.
    pub fn request_dirty_transition(
        &self,
        range: VmCowRange,
        request: &mut PageRequest,
    ) -> Result<()> {
        if self.is_detached() {
            return Err(Error::BadState);
        }
        self.register(RequestKind::Dirty, range, request);
        self.provider.send_dirty_request(range);
        Ok(())
    }

    fn resolve_overlapping(&self, kind: RequestKind, range: VmCowRange, status: Result<()>) {
        let mut requests = self.requests.lock();
        requests.retain(|request| {
            let state = request.state.lock();
            if state.kind != kind || state.range.intersect(range).is_empty() {
                return true;
            }
            drop(state);
            request.resolve(status);
            false
        });
    }

    /// Completes read requests overlapping `range`. Resolution may be
    /// spurious for partially supplied requests; waiters retry and make
    /// progress on the supplied prefix.
    pub fn on_pages_supplied(&self, range: VmCowRange) {
        self.resolve_overlapping(RequestKind::Read, range, Ok(()));
    }

    /// Completes dirty requests overlapping `range`.
    pub fn on_pages_dirtied(&self, range: VmCowRange) {
        self.resolve_overlapping(RequestKind::Dirty, range, Ok(()));
    }

    /// Fails requests of both kinds overlapping `range`.
    pub fn on_pages_failed(&self, range: VmCowRange, error: Error) {
        self.resolve_overlapping(RequestKind::Read, range, Err(error));
        self.resolve_overlapping(RequestKind::Dirty, range, Err(error));
    }

    /// Validates an error status a pager is allowed to fail requests with.
    pub fn is_valid_failure_code(error: Error) -> bool {
        matches!(
            error,
            Error::BadState | Error::NoMemory | Error::NotFound | Error::Unavailable
        )
    }

    /// Frees pages that came from this source, delegating to the provider
    /// when it supplies specific physical pages.
    pub fn free_pages(&self, pages: &mut Vec<Arc<VmPage>>) {
        if self.properties.is_providing_specific_physical_pages {
            self.provider.free_pages(pages);
        } else {
            pmm::free_pages(pages);
        }
    }

    /// Detaches the source. Outstanding requests complete with
    /// [`Error::BadState`] and new requests are refused.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut requests = self.requests.lock();
        for request in requests.drain(..) {
            request.resolve(Err(Error::BadState));
        }
        drop(requests);
        self.provider.on_detach();
    }

    /// Closes the source for good, detaching it first if needed.
    pub fn close(&self) {
        self.detach();
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.provider.on_close();
        }
    }

    /// Acquires the hierarchy lock. Must be paired with
    /// [`PageSource::unlock_hierarchy`].
    pub(crate) fn lock_hierarchy(&self) {
        core::mem::forget(self.hierarchy_lock.lock());
    }

    /// Releases the hierarchy lock acquired by
    /// [`PageSource::lock_hierarchy`].
    pub(crate) fn unlock_hierarchy(&self) {
        // SAFETY: paired with a forgotten guard from `lock_hierarchy`.
        unsafe { self.hierarchy_lock.force_unlock() };
    }
}
