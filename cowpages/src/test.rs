// SPDX-License-Identifier: MPL-2.0

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use spin::Mutex;

use crate::compression::{self, CompressedRef, CompressionResult, VmCompressor};
use crate::cow::{
    EvictionAction, SnapshotType, SupplyOptions, VmCowPages, VmCowPagesOptions, VmPageSpliceList,
    VmoBacklink,
};
use crate::cow::DeferredOps;
use crate::discardable::{DiscardableState, DiscardableVmoTracker};
use crate::error::Error;
use crate::page::VmPage;
use crate::page_source::{
    MultiPageRequest, PageProvider, PageSource, PageSourceProperties,
};
use crate::pmm::{self, PmmAllocFlags};
use crate::range::VmCowRange;
use crate::{RangeChangeOp, PAGE_SIZE};

const P: u64 = PAGE_SIZE;

// ----- collaborators -----

struct TestMapping {
    changes: Mutex<Vec<(VmCowRange, RangeChangeOp)>>,
}

impl TestMapping {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            changes: Mutex::new(Vec::new()),
        })
    }

    fn took(&self, op: RangeChangeOp) -> bool {
        self.changes.lock().iter().any(|(_, o)| *o == op)
    }
}

impl VmoBacklink for TestMapping {
    fn range_change(&self, range: VmCowRange, op: RangeChangeOp) {
        self.changes.lock().push((range, op));
    }
}

struct TestPager {
    properties: PageSourceProperties,
    reads: Mutex<Vec<VmCowRange>>,
    dirties: Mutex<Vec<VmCowRange>>,
}

impl TestPager {
    fn new(trap_dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            properties: PageSourceProperties {
                is_preserving_page_content: true,
                is_providing_specific_physical_pages: false,
                should_trap_dirty_transitions: trap_dirty,
            },
            reads: Mutex::new(Vec::new()),
            dirties: Mutex::new(Vec::new()),
        })
    }

    fn last_read(&self) -> Option<VmCowRange> {
        self.reads.lock().last().copied()
    }

    fn last_dirty(&self) -> Option<VmCowRange> {
        self.dirties.lock().last().copied()
    }
}

impl PageProvider for TestPager {
    fn properties(&self) -> PageSourceProperties {
        self.properties
    }

    fn send_read_request(&self, range: VmCowRange) {
        self.reads.lock().push(range);
    }

    fn send_dirty_request(&self, range: VmCowRange) {
        self.dirties.lock().push(range);
    }
}

const TEMP_BIT: u64 = 1 << 63;

struct CompressorInner {
    next_id: u64,
    pending: Option<(u64, Arc<VmPage>, u32)>,
    result: Option<CompressionResult>,
    store: BTreeMap<u64, (Vec<u8>, u32)>,
}

struct TestCompressor {
    inner: Mutex<CompressorInner>,
}

impl TestCompressor {
    fn new() -> Self {
        Self {
            inner: Mutex::new(CompressorInner {
                next_id: 1,
                pending: None,
                result: None,
                store: BTreeMap::new(),
            }),
        }
    }
}

impl VmCompressor for TestCompressor {
    fn arm(&self) -> crate::Result<()> {
        Ok(())
    }

    fn start(&self, page: Arc<VmPage>, metadata: u32) -> CompressedRef {
        let mut inner = self.inner.lock();
        let id = inner.next_id | TEMP_BIT;
        inner.next_id += 1;
        inner.pending = Some((id, page, metadata));
        CompressedRef(id)
    }

    fn compress(&self) {
        let mut inner = self.inner.lock();
        let Some((id, page, metadata)) = inner.pending.take() else {
            return;
        };
        let mut bytes = alloc::vec![0u8; PAGE_SIZE as usize];
        page.read_bytes(0, &mut bytes);
        if bytes.iter().all(|b| *b == 0) {
            inner.result = Some(CompressionResult::Zero);
        } else {
            let final_id = id & !TEMP_BIT;
            inner.store.insert(final_id, (bytes, metadata));
            inner.result = Some(CompressionResult::Reference(CompressedRef(final_id)));
        }
    }

    fn take_compression_result(&self) -> CompressionResult {
        self.inner.lock().result.take().expect("no compression ran")
    }

    fn finalize(&self) {
        self.inner.lock().pending = None;
    }

    fn is_temp_reference(&self, reference: CompressedRef) -> bool {
        reference.0 & TEMP_BIT != 0
    }

    fn metadata(&self, reference: CompressedRef) -> u32 {
        let inner = self.inner.lock();
        if reference.0 & TEMP_BIT != 0 {
            inner
                .pending
                .as_ref()
                .map(|(_, _, metadata)| *metadata)
                .unwrap_or(0)
        } else {
            inner
                .store
                .get(&reference.0)
                .map(|(_, metadata)| *metadata)
                .unwrap_or(0)
        }
    }

    fn set_metadata(&self, reference: CompressedRef, value: u32) {
        let mut inner = self.inner.lock();
        if let Some((_, metadata)) = inner.store.get_mut(&reference.0) {
            *metadata = value;
        }
    }

    fn decompress(&self, reference: CompressedRef, page: &VmPage) {
        let (bytes, _) = self
            .inner
            .lock()
            .store
            .remove(&reference.0)
            .expect("decompress of unknown reference");
        page.write_bytes(0, &bytes);
    }

    fn move_reference(&self, _reference: CompressedRef) -> Option<(Arc<VmPage>, u32)> {
        None
    }

    fn free_reference(&self, reference: CompressedRef) {
        let mut inner = self.inner.lock();
        if reference.0 & TEMP_BIT != 0 {
            inner.pending = None;
        } else {
            inner.store.remove(&reference.0);
        }
    }
}

fn test_compressor() -> Arc<TestCompressor> {
    static COMPRESSOR: spin::Once<Arc<TestCompressor>> = spin::Once::new();
    let compressor = COMPRESSOR.call_once(|| Arc::new(TestCompressor::new())).clone();
    compression::set_active_compressor(Some(compressor.clone()));
    compressor
}

// The compressor holds one in-flight compression at a time, so tests that
// drive the arm/compress protocol serialize on this.
static COMPRESSION_SERIAL: Mutex<()> = Mutex::new(());

// ----- helpers -----

fn anon(pages: u64) -> Arc<VmCowPages> {
    let vmo = VmCowPages::new_anonymous(
        VmCowPagesOptions::empty(),
        PmmAllocFlags::CAN_WAIT,
        pages * P,
        None,
    )
    .unwrap();
    vmo.transition_to_alive();
    vmo
}

fn pager_backed(
    pages: u64,
    trap_dirty: bool,
    initial_zero: bool,
) -> (Arc<VmCowPages>, Arc<TestPager>) {
    let pager = TestPager::new(trap_dirty);
    let source = PageSource::new(pager.clone());
    let options = if initial_zero {
        VmCowPagesOptions::INITIAL_ZERO_CONTENT
    } else {
        VmCowPagesOptions::empty()
    };
    let vmo = VmCowPages::new_external(source, options, pages * P).unwrap();
    vmo.transition_to_alive();
    (vmo, pager)
}

fn destroy(vmo: Arc<VmCowPages>) {
    vmo.clear_paged_backlink();
    vmo.dead_transition();
}

fn write_page(vmo: &Arc<VmCowPages>, offset: u64, value: u8) {
    let buf = alloc::vec![value; P as usize];
    let mut request = MultiPageRequest::new();
    vmo.write(offset, &buf, &mut request).unwrap();
}

fn read_byte(vmo: &Arc<VmCowPages>, offset: u64) -> u8 {
    let mut buf = [0u8; 1];
    let mut request = MultiPageRequest::new();
    vmo.read(offset, &mut buf, &mut request).unwrap();
    buf[0]
}

fn supply_page(vmo: &Arc<VmCowPages>, offset: u64, value: u8) {
    let page = pmm::alloc_page(PmmAllocFlags::CAN_WAIT).unwrap();
    let buf = alloc::vec![value; P as usize];
    page.write_bytes(0, &buf);
    let mut splice = VmPageSpliceList::new(offset, P);
    splice.append_page(page);
    let mut supplied = 0;
    let mut request = MultiPageRequest::new();
    vmo.supply_pages(
        VmCowRange::new(offset, P),
        &mut splice,
        SupplyOptions::PagerSupply,
        &mut supplied,
        &mut request,
    )
    .unwrap();
    assert_eq!(supplied, P);
}

fn page_at(vmo: &Arc<VmCowPages>, offset: u64) -> Option<Arc<VmPage>> {
    let inner = vmo.inner.lock();
    inner
        .page_list
        .lookup(offset)
        .and_then(|entry| entry.page().cloned())
}

fn commit_all(vmo: &Arc<VmCowPages>, range: VmCowRange) {
    let mut committed = 0;
    let mut request = MultiPageRequest::new();
    vmo.commit_range(range, &mut committed, &mut request).unwrap();
    assert_eq!(committed, range.len);
}

fn dirty_ranges(vmo: &Arc<VmCowPages>, range: VmCowRange) -> Vec<(u64, u64, bool)> {
    let mut ranges = Vec::new();
    vmo.enumerate_dirty_ranges(range, |offset, len, is_zero| {
        ranges.push((offset, len, is_zero));
        ControlFlow::Continue(())
    })
    .unwrap();
    ranges
}

// ----- properties -----

#[test]
fn zero_default() {
    let vmo = anon(4);
    for offset in [0, P, 3 * P, 4 * P - 1] {
        assert_eq!(read_byte(&vmo, offset), 0);
    }
    destroy(vmo);
}

#[test]
fn resize_grow_reads_zero() {
    let vmo = anon(4);
    write_page(&vmo, 0, 0xaa);
    vmo.resize(8 * P).unwrap();
    assert_eq!(vmo.size(), 8 * P);
    assert_eq!(read_byte(&vmo, 0), 0xaa);
    for offset in [4 * P, 6 * P, 8 * P - 1] {
        assert_eq!(read_byte(&vmo, offset), 0);
    }
    destroy(vmo);
}

#[test]
fn resize_shrink_forgets_for_descendants() {
    let parent = anon(4);
    for index in 0..4 {
        write_page(&parent, index * P, index as u8 + 1);
    }
    let child = parent
        .create_clone(SnapshotType::OnWrite, false, VmCowRange::new(0, 4 * P))
        .unwrap();
    assert_eq!(read_byte(&child, 2 * P), 3);

    parent.resize(P).unwrap();
    assert_eq!(child.inner.lock().parent_limit, P);
    // Even after the parent grows again, the child cannot see new data.
    parent.resize(4 * P).unwrap();
    write_page(&parent, 2 * P, 0x77);
    assert_eq!(read_byte(&child, 2 * P), 0);
    assert_eq!(read_byte(&child, 0), 1);

    destroy(child);
    destroy(parent);
}

#[test]
fn resize_misaligned_is_invalid() {
    let vmo = anon(1);
    assert_eq!(vmo.resize(P + 1), Err(Error::InvalidArgs));
    destroy(vmo);
}

#[test]
fn backlink_consistency() {
    let vmo = anon(4);
    commit_all(&vmo, VmCowRange::new(0, 4 * P));
    assert!(vmo.debug_validate_backlinks());
    let page = page_at(&vmo, 2 * P).unwrap();
    assert!(page.backlink_matches(&vmo, 2 * P));
    assert!(!page.backlink_matches(&vmo, 3 * P));
    destroy(vmo);
}

#[test]
fn lock_order_assignment() {
    let root = anon(4);
    assert_eq!(root.lock_order(), u64::MAX / 2);
    let child = root
        .create_clone(SnapshotType::OnWrite, false, VmCowRange::new(0, 4 * P))
        .unwrap();
    assert_eq!(child.lock_order(), root.lock_order() - 3);

    let snap = root
        .create_clone(SnapshotType::Full, false, VmCowRange::new(0, 4 * P))
        .unwrap();
    let hidden = root.inner.lock().parent.clone().unwrap();
    assert!(hidden.is_hidden());
    assert_eq!(hidden.lock_order(), u64::MAX - 3);
    assert_eq!(snap.lock_order(), u64::MAX / 2);

    destroy(child);
    destroy(snap);
    destroy(root);
}

#[test]
fn s1_pin_unpin_with_grow() {
    let vmo = anon(4);
    commit_all(&vmo, VmCowRange::new(0, 4 * P));
    vmo.pin_range(VmCowRange::new(0, P)).unwrap();

    assert_eq!(vmo.decommit_range(VmCowRange::new(0, 4 * P)), Err(Error::BadState));

    vmo.unpin_range(VmCowRange::new(0, P)).unwrap();
    assert_eq!(vmo.decommit_range(VmCowRange::new(0, 4 * P)).unwrap(), 4);

    vmo.resize(8 * P).unwrap();
    assert_eq!(read_byte(&vmo, 4 * P), 0);
    destroy(vmo);
}

#[test]
fn pin_requires_committed_pages() {
    let vmo = anon(2);
    commit_all(&vmo, VmCowRange::new(0, P));
    assert_eq!(vmo.pin_range(VmCowRange::new(0, 2 * P)), Err(Error::BadState));
    // The failed pin released the pin it took on the first page.
    assert_eq!(vmo.pinned_page_count(), 0);
    destroy(vmo);
}

#[test]
fn s2_unidirectional_clone_with_pager_parent() {
    let (root, pager) = pager_backed(2, false, false);
    supply_page(&root, 0, 0x11);

    let clone = root
        .create_clone(SnapshotType::OnWrite, false, VmCowRange::new(0, 2 * P))
        .unwrap();
    // Reads resolve through the parent without copying.
    assert_eq!(read_byte(&clone, 0), 0x11);
    assert!(page_at(&clone, 0).is_none());

    // A write forks the page; the root's copy is untouched.
    write_page(&clone, 0, 0x33);
    assert_eq!(read_byte(&clone, 0), 0x33);
    assert_eq!(read_byte(&root, 0), 0x11);

    // Unsupplied parent content generates a read request against the
    // root's source.
    let mut buf = [0u8; 1];
    let mut request = MultiPageRequest::new();
    let result = clone.read(P, &mut buf, &mut request);
    assert_eq!(result, Err(Error::ShouldWait));
    assert_eq!(pager.last_read().unwrap().offset, P);

    supply_page(&root, P, 0x22);
    assert!(request.wait().is_ok());
    assert_eq!(read_byte(&clone, P), 0x22);

    destroy(clone);
    destroy(root);
}

#[test]
fn s3_bidirectional_snapshot() {
    let origin = anon(4);
    for index in 0..4u64 {
        write_page(&origin, index * P, index as u8 + 1);
    }
    let snapshot = origin
        .create_clone(SnapshotType::Full, false, VmCowRange::new(0, 4 * P))
        .unwrap();

    let hidden = origin.inner.lock().parent.clone().unwrap();
    assert!(hidden.is_hidden());
    assert!(hidden.debug_validate_page_sharing());

    write_page(&origin, 0, 9);
    assert_eq!(read_byte(&snapshot, 0), 1);
    assert_eq!(read_byte(&origin, 0), 9);
    assert!(hidden.debug_validate_page_sharing());

    // Destroying the origin migrates the shared pages into the snapshot
    // via the hidden node merge.
    destroy(origin);
    assert_eq!(read_byte(&snapshot, 0), 1);
    assert_eq!(read_byte(&snapshot, 3 * P), 4);
    let page = page_at(&snapshot, 0).unwrap();
    assert!(page.backlink_matches(&snapshot, 0));
    assert!(snapshot.inner.lock().parent.is_none());

    destroy(snapshot);
}

#[test]
fn clone_content_equality_at_creation() {
    let origin = anon(3);
    write_page(&origin, 0, 0x10);
    write_page(&origin, 2 * P, 0x30);
    let clone = origin
        .create_clone(SnapshotType::Full, false, VmCowRange::new(0, 3 * P))
        .unwrap();
    for offset in [0, P, 2 * P] {
        assert_eq!(read_byte(&clone, offset), read_byte(&origin, offset));
    }
    destroy(clone);
    destroy(origin);
}

#[test]
fn share_count_conservation_with_three_viewers() {
    let origin = anon(2);
    write_page(&origin, 0, 0x42);
    let first = origin
        .create_clone(SnapshotType::Full, false, VmCowRange::new(0, 2 * P))
        .unwrap();
    let hidden = origin.inner.lock().parent.clone().unwrap();
    // A further clone of a transparent node hangs off the hidden node and
    // shares its content.
    let second = first
        .create_clone(SnapshotType::OnWrite, false, VmCowRange::new(0, 2 * P))
        .unwrap();
    assert!(Arc::ptr_eq(
        second.inner.lock().parent.as_ref().unwrap(),
        &hidden
    ));
    let page = page_at(&hidden, 0).unwrap();
    assert_eq!(page.share_count(), 2);
    assert!(hidden.debug_validate_page_sharing());

    // Forking one viewer drops the count by one.
    write_page(&second, 0, 0x55);
    assert_eq!(page.share_count(), 1);
    assert!(hidden.debug_validate_page_sharing());
    assert_eq!(read_byte(&origin, 0), 0x42);
    assert_eq!(read_byte(&first, 0), 0x42);

    destroy(second);
    destroy(first);
    destroy(origin);
}

#[test]
fn modified_snapshot_of_root_is_unidirectional() {
    let root = anon(2);
    write_page(&root, 0, 0x21);
    let clone = root
        .create_clone(SnapshotType::Modified, false, VmCowRange::new(0, 2 * P))
        .unwrap();
    // No hidden node was interposed.
    assert!(root.inner.lock().parent.is_none());
    assert!(Arc::ptr_eq(clone.inner.lock().parent.as_ref().unwrap(), &root));
    assert_eq!(read_byte(&clone, 0), 0x21);
    destroy(clone);
    destroy(root);
}

#[test]
fn full_snapshot_of_pager_backed_is_unsupported() {
    let (root, _pager) = pager_backed(2, false, false);
    assert_eq!(
        root.create_clone(SnapshotType::Full, false, VmCowRange::new(0, 2 * P))
            .err(),
        Some(Error::NotSupported)
    );
    destroy(root);
}

#[test]
fn bidirectional_snapshot_refused_with_pinned_pages() {
    let vmo = anon(2);
    commit_all(&vmo, VmCowRange::new(0, 2 * P));
    vmo.pin_range(VmCowRange::new(0, P)).unwrap();
    assert_eq!(
        vmo.create_clone(SnapshotType::Full, false, VmCowRange::new(0, 2 * P))
            .err(),
        Some(Error::BadState)
    );
    vmo.unpin_range(VmCowRange::new(0, P)).unwrap();
    destroy(vmo);
}

#[test]
fn s4_dirty_writeback_round_trip() {
    let (root, pager) = pager_backed(1, true, false);
    let mapping = TestMapping::new();
    root.set_paged_backlink(Arc::downgrade(&mapping) as _);
    supply_page(&root, 0, 0x01);

    // The first write traps.
    let buf = alloc::vec![0x58u8; P as usize];
    let mut request = MultiPageRequest::new();
    assert_eq!(root.write(0, &buf, &mut request), Err(Error::ShouldWait));
    assert_eq!(pager.last_dirty().unwrap().offset, 0);

    let mut alloc_list = Vec::new();
    let mut ack_request = MultiPageRequest::new();
    root.dirty_pages(VmCowRange::new(0, P), &mut alloc_list, &mut ack_request)
        .unwrap();
    assert!(request.wait().is_ok());
    assert!(page_at(&root, 0).unwrap().is_dirty());

    root.write(0, &buf, &mut request).unwrap();
    assert_eq!(dirty_ranges(&root, VmCowRange::new(0, P)), alloc::vec![(0, P, false)]);

    root.writeback_begin(VmCowRange::new(0, P), false).unwrap();
    assert!(page_at(&root, 0).unwrap().is_awaiting_clean());
    assert!(mapping.took(RangeChangeOp::RemoveWrite));

    // A second write during writeback traps again and dirties the page.
    let buf2 = alloc::vec![0x59u8; P as usize];
    let mut request2 = MultiPageRequest::new();
    assert_eq!(root.write(0, &buf2, &mut request2), Err(Error::ShouldWait));
    root.dirty_pages(VmCowRange::new(0, P), &mut alloc_list, &mut ack_request)
        .unwrap();
    root.write(0, &buf2, &mut request2).unwrap();
    assert!(page_at(&root, 0).unwrap().is_dirty());

    // Writeback-end only cleans pages still awaiting clean.
    root.writeback_end(VmCowRange::new(0, P)).unwrap();
    assert!(page_at(&root, 0).unwrap().is_dirty());
    assert_eq!(dirty_ranges(&root, VmCowRange::new(0, P)), alloc::vec![(0, P, false)]);
    assert_eq!(read_byte(&root, 0), 0x59);

    destroy(root);
}

#[test]
fn dirty_without_trap_is_implicit() {
    let (root, pager) = pager_backed(1, false, false);
    supply_page(&root, 0, 0x01);
    write_page(&root, 0, 0x02);
    assert!(pager.last_dirty().is_none());
    assert!(page_at(&root, 0).unwrap().is_dirty());
    assert!(root.query_pager_vmo_stats(true).unwrap().modified);
    assert!(!root.query_pager_vmo_stats(false).unwrap().modified);
    destroy(root);
}

#[test]
fn s5_zero_interval_writeback() {
    let (root, _pager) = pager_backed(16, true, true);
    assert_eq!(
        dirty_ranges(&root, VmCowRange::new(0, 16 * P)),
        alloc::vec![(0, 16 * P, true)]
    );

    // Writing inside a Dirty interval needs no new trap.
    write_page(&root, 2 * P, 0x5a);
    assert_eq!(
        dirty_ranges(&root, VmCowRange::new(0, 16 * P)),
        alloc::vec![(0, 2 * P, true), (2 * P, P, false), (3 * P, 13 * P, true)]
    );
    assert!(root.debug_validate_zero_intervals());

    root.writeback_begin(VmCowRange::new(0, 16 * P), true).unwrap();
    // The committed page stays Dirty.
    assert!(page_at(&root, 2 * P).unwrap().is_dirty());

    root.writeback_end(VmCowRange::new(0, 16 * P)).unwrap();
    assert_eq!(
        dirty_ranges(&root, VmCowRange::new(0, 16 * P)),
        alloc::vec![(2 * P, P, false)]
    );
    assert_eq!(read_byte(&root, 2 * P), 0x5a);
    assert_eq!(read_byte(&root, 5 * P), 0);

    destroy(root);
}

#[test]
fn partial_zero_interval_writeback_clips_start() {
    let (root, _pager) = pager_backed(8, true, true);
    root.writeback_begin(VmCowRange::new(0, 4 * P), true).unwrap();
    root.writeback_end(VmCowRange::new(0, 4 * P)).unwrap();
    // The first four pages were cleaned; the rest stays dirty zero.
    assert_eq!(
        dirty_ranges(&root, VmCowRange::new(0, 8 * P)),
        alloc::vec![(4 * P, 4 * P, true)]
    );
    destroy(root);
}

#[test]
fn s6_reclamation_via_compression() {
    let _serial = COMPRESSION_SERIAL.lock();
    let compressor = test_compressor();
    let vmo = anon(4);
    for index in 0..4u64 {
        write_page(&vmo, index * P, index as u8 + 0x40);
    }
    let page = page_at(&vmo, 2 * P).unwrap();
    let counts = vmo.reclaim_page(&page, 2 * P, EvictionAction::FollowHints, Some(&*compressor));
    assert_eq!(counts.compressed, 1);
    assert!(page_at(&vmo, 2 * P).is_none());
    {
        let inner = vmo.inner.lock();
        assert!(inner.page_list.lookup(2 * P).unwrap().is_reference());
    }

    // Reading decompresses and restores the original bytes.
    assert_eq!(read_byte(&vmo, 2 * P), 0x42);

    // An all-zero page compresses to nothing at all.
    write_page(&vmo, 3 * P, 0);
    let zero_page = page_at(&vmo, 3 * P).unwrap();
    let counts = vmo.reclaim_page(&zero_page, 3 * P, EvictionAction::FollowHints, Some(&*compressor));
    assert_eq!(counts.compressed, 1);
    assert!(vmo.inner.lock().page_list.lookup(3 * P).is_none());
    assert_eq!(read_byte(&vmo, 3 * P), 0);

    destroy(vmo);
}

#[test]
fn reclaim_refuses_pinned_and_marks_accessed() {
    let compressor = test_compressor();
    let vmo = anon(1);
    commit_all(&vmo, VmCowRange::new(0, P));
    vmo.pin_range(VmCowRange::new(0, P)).unwrap();
    let page = page_at(&vmo, 0).unwrap();
    page.set_accessed(false);
    let counts = vmo.reclaim_page(&page, 0, EvictionAction::FollowHints, Some(&*compressor));
    assert_eq!(counts.compressed + counts.evicted + counts.discarded, 0);
    assert!(page_at(&vmo, 0).is_some());
    assert!(page.is_accessed());
    vmo.unpin_range(VmCowRange::new(0, P)).unwrap();
    destroy(vmo);
}

#[test]
fn eviction_of_clean_pager_page() {
    let (root, _pager) = pager_backed(2, false, false);
    supply_page(&root, 0, 0x11);
    let page = page_at(&root, 0).unwrap();
    assert!(page.is_clean());

    // An always-needed page survives hint-respecting reclamation.
    page.set_always_need(true);
    let counts = root.reclaim_page(&page, 0, EvictionAction::FollowHints, None);
    assert_eq!(counts.evicted, 0);
    assert!(page_at(&root, 0).is_some());

    let counts = root.reclaim_page(&page, 0, EvictionAction::IgnoreHints, None);
    assert_eq!(counts.evicted, 1);
    assert!(page_at(&root, 0).is_none());

    // The content comes back from the pager on the next access.
    let mut buf = [0u8; 1];
    let mut request = MultiPageRequest::new();
    assert_eq!(root.read(0, &mut buf, &mut request), Err(Error::ShouldWait));
    supply_page(&root, 0, 0x11);
    assert_eq!(read_byte(&root, 0), 0x11);

    destroy(root);
}

#[test]
fn dirty_pages_are_not_evictable() {
    let (root, _pager) = pager_backed(1, false, false);
    supply_page(&root, 0, 0x11);
    write_page(&root, 0, 0x22);
    let page = page_at(&root, 0).unwrap();
    assert!(page.is_dirty());
    let counts = root.reclaim_page(&page, 0, EvictionAction::IgnoreHints, None);
    assert_eq!(counts.evicted, 0);
    assert!(page_at(&root, 0).is_some());
    destroy(root);
}

#[test]
fn discardable_reclamation() {
    let vmo = VmCowPages::new_anonymous(
        VmCowPagesOptions::empty(),
        PmmAllocFlags::CAN_WAIT,
        3 * P,
        Some(DiscardableVmoTracker::new()),
    )
    .unwrap();
    vmo.transition_to_alive();
    let tracker = vmo.discardable_tracker().unwrap();
    tracker.lock();
    for index in 0..3u64 {
        write_page(&vmo, index * P, 0x11);
    }
    tracker.unlock();
    assert!(tracker.is_eligible_for_reclamation());

    // Only the first page triggers the discard.
    let late_page = page_at(&vmo, 2 * P).unwrap();
    let counts = vmo.reclaim_page(&late_page, 2 * P, EvictionAction::FollowHints, None);
    assert_eq!(counts.discarded, 0);

    let first_page = page_at(&vmo, 0).unwrap();
    let counts = vmo.reclaim_page(&first_page, 0, EvictionAction::FollowHints, None);
    assert_eq!(counts.discarded, 3);
    assert_eq!(tracker.state(), DiscardableState::Discarded);

    assert!(tracker.lock());
    assert_eq!(read_byte(&vmo, 0), 0);
    tracker.unlock();
    destroy(vmo);
}

#[test]
fn fail_page_requests_resolves_waiters() {
    let (root, _pager) = pager_backed(1, false, false);
    let mut buf = [0u8; 1];
    let mut request = MultiPageRequest::new();
    assert_eq!(root.read(0, &mut buf, &mut request), Err(Error::ShouldWait));

    assert_eq!(
        root.fail_page_requests(VmCowRange::new(0, P), Error::ShouldWait),
        Err(Error::InvalidArgs)
    );
    root.fail_page_requests(VmCowRange::new(0, P), Error::NotFound)
        .unwrap();
    assert_eq!(request.wait(), Err(Error::NotFound));

    // Retrying makes progress once the pager supplies.
    let mut request = MultiPageRequest::new();
    assert_eq!(root.read(0, &mut buf, &mut request), Err(Error::ShouldWait));
    supply_page(&root, 0, 0x66);
    assert!(request.wait().is_ok());
    assert_eq!(read_byte(&root, 0), 0x66);
    destroy(root);
}

#[test]
fn detach_keeps_dirty_content_only() {
    let (root, _pager) = pager_backed(2, false, false);
    supply_page(&root, 0, 0x11);
    supply_page(&root, P, 0x22);
    write_page(&root, P, 0x33);
    assert!(page_at(&root, P).unwrap().is_dirty());

    root.detach_source().unwrap();
    // The clean page is gone and cannot be refetched.
    assert!(page_at(&root, 0).is_none());
    let mut buf = [0u8; 1];
    let mut request = MultiPageRequest::new();
    assert_eq!(root.read(0, &mut buf, &mut request), Err(Error::BadState));
    // The dirty page survives for writeback.
    assert_eq!(read_byte(&root, P), 0x33);

    destroy(root);
}

#[test]
fn resize_refused_on_pinned_tail() {
    let vmo = anon(4);
    commit_all(&vmo, VmCowRange::new(0, 4 * P));
    vmo.pin_range(VmCowRange::new(3 * P, P)).unwrap();
    assert_eq!(vmo.resize(2 * P), Err(Error::BadState));
    vmo.unpin_range(VmCowRange::new(3 * P, P)).unwrap();
    vmo.resize(2 * P).unwrap();
    destroy(vmo);
}

#[test]
fn zero_range_decommits_anonymous_pages() {
    let vmo = anon(4);
    for index in 0..4u64 {
        write_page(&vmo, index * P, 0x99);
    }
    let mut zeroed = 0;
    let mut request = MultiPageRequest::new();
    vmo.zero_range(VmCowRange::new(P, 2 * P), false, &mut zeroed, &mut request)
        .unwrap();
    assert_eq!(zeroed, 2 * P);
    assert!(page_at(&vmo, P).is_none());
    assert!(page_at(&vmo, 2 * P).is_none());
    assert_eq!(read_byte(&vmo, P), 0);
    assert_eq!(read_byte(&vmo, 0), 0x99);
    destroy(vmo);
}

#[test]
fn zero_range_keeps_pinned_pages_committed() {
    let vmo = anon(1);
    write_page(&vmo, 0, 0x77);
    vmo.pin_range(VmCowRange::new(0, P)).unwrap();
    let mut zeroed = 0;
    let mut request = MultiPageRequest::new();
    vmo.zero_range(VmCowRange::new(0, P), false, &mut zeroed, &mut request)
        .unwrap();
    assert!(page_at(&vmo, 0).is_some());
    assert_eq!(read_byte(&vmo, 0), 0);
    vmo.unpin_range(VmCowRange::new(0, P)).unwrap();
    destroy(vmo);
}

#[test]
fn zero_range_in_pager_child_inserts_marker() {
    let (root, _pager) = pager_backed(1, false, false);
    supply_page(&root, 0, 0x11);
    let clone = root
        .create_clone(SnapshotType::OnWrite, false, VmCowRange::new(0, P))
        .unwrap();
    let mut zeroed = 0;
    let mut request = MultiPageRequest::new();
    clone
        .zero_range(VmCowRange::new(0, P), false, &mut zeroed, &mut request)
        .unwrap();
    {
        let inner = clone.inner.lock();
        assert!(inner.page_list.lookup(0).unwrap().is_marker());
    }
    assert_eq!(read_byte(&clone, 0), 0);
    assert_eq!(read_byte(&root, 0), 0x11);
    destroy(clone);
    destroy(root);
}

#[test]
fn zero_range_preserving_inserts_dirty_interval() {
    let (root, _pager) = pager_backed(4, false, false);
    supply_page(&root, 0, 0x11);
    supply_page(&root, P, 0x22);
    let mut zeroed = 0;
    let mut request = MultiPageRequest::new();
    root.zero_range(VmCowRange::new(0, 2 * P), true, &mut zeroed, &mut request)
        .unwrap();
    assert_eq!(zeroed, 2 * P);
    assert!(page_at(&root, 0).is_none());
    assert_eq!(
        dirty_ranges(&root, VmCowRange::new(0, 4 * P)),
        alloc::vec![(0, 2 * P, true)]
    );
    assert_eq!(read_byte(&root, 0), 0);
    assert!(root.debug_validate_zero_intervals());
    destroy(root);
}

#[test]
fn take_and_supply_pages_transfer_content() {
    let source = anon(2);
    write_page(&source, 0, 0xab);
    write_page(&source, P, 0xcd);

    let mut splice = VmPageSpliceList::new(0, 2 * P);
    let mut taken = 0;
    let mut request = MultiPageRequest::new();
    source
        .take_pages(VmCowRange::new(0, 2 * P), &mut splice, &mut taken, &mut request)
        .unwrap();
    assert_eq!(taken, 2 * P);
    assert_eq!(read_byte(&source, 0), 0);

    let dest = anon(2);
    let mut supplied = 0;
    dest.supply_pages(
        VmCowRange::new(0, 2 * P),
        &mut splice,
        SupplyOptions::TransferData,
        &mut supplied,
        &mut request,
    )
    .unwrap();
    assert_eq!(supplied, 2 * P);
    assert_eq!(read_byte(&dest, 0), 0xab);
    assert_eq!(read_byte(&dest, P), 0xcd);

    destroy(dest);
    destroy(source);
}

#[test]
fn take_pages_unsupported_for_pager_backed() {
    let (root, _pager) = pager_backed(1, false, false);
    let mut splice = VmPageSpliceList::new(0, P);
    let mut taken = 0;
    let mut request = MultiPageRequest::new();
    assert_eq!(
        root.take_pages(VmCowRange::new(0, P), &mut splice, &mut taken, &mut request),
        Err(Error::NotSupported)
    );
    destroy(root);
}

#[test]
fn loaned_pages_are_replaced_before_pinning() {
    let vmo = anon(1);
    commit_all(&vmo, VmCowRange::new(0, P));
    write_page(&vmo, 0, 0x3c);
    let original = page_at(&vmo, 0).unwrap();
    let loaned = vmo.replace_page_with_loaned(&original, 0).unwrap();
    assert!(loaned.is_loaned());
    assert_eq!(read_byte(&vmo, 0), 0x3c);

    vmo.pin_range(VmCowRange::new(0, P)).unwrap();
    let pinned = page_at(&vmo, 0).unwrap();
    assert!(!pinned.is_loaned());
    assert!(pinned.is_pinned());
    assert_eq!(read_byte(&vmo, 0), 0x3c);
    vmo.unpin_range(VmCowRange::new(0, P)).unwrap();
    destroy(vmo);
}

#[test]
fn replace_pages_with_non_loaned_in_range() {
    let vmo = anon(2);
    commit_all(&vmo, VmCowRange::new(0, 2 * P));
    let original = page_at(&vmo, P).unwrap();
    vmo.replace_page_with_loaned(&original, P).unwrap();
    assert_eq!(
        vmo.replace_pages_with_non_loaned(VmCowRange::new(0, 2 * P)).unwrap(),
        1
    );
    assert!(!page_at(&vmo, P).unwrap().is_loaned());
    destroy(vmo);
}

#[test]
fn dedup_zero_page_drops_the_page() {
    let vmo = anon(1);
    commit_all(&vmo, VmCowRange::new(0, P));
    let page = page_at(&vmo, 0).unwrap();
    assert!(vmo.dedup_zero_page(&page, 0));
    assert!(page_at(&vmo, 0).is_none());
    assert_eq!(read_byte(&vmo, 0), 0);

    write_page(&vmo, 0, 0x12);
    let page = page_at(&vmo, 0).unwrap();
    assert!(!vmo.dedup_zero_page(&page, 0));
    destroy(vmo);
}

#[test]
fn high_priority_counts_propagate() {
    let root = anon(2);
    let clone = root
        .create_clone(SnapshotType::OnWrite, false, VmCowRange::new(0, 2 * P))
        .unwrap();
    clone.change_high_priority_count(1);
    assert!(clone.is_high_memory_priority());
    assert!(root.is_high_memory_priority());
    clone.change_high_priority_count(1);
    assert_eq!(root.inner.lock().high_priority_count, 1);
    clone.change_high_priority_count(-2);
    assert!(!root.is_high_memory_priority());
    destroy(clone);
    destroy(root);
}

#[test]
fn range_changes_fan_out_to_descendants() {
    let root = anon(4);
    write_page(&root, 2 * P, 0x61);
    let clone = root
        .create_clone(SnapshotType::OnWrite, false, VmCowRange::new(2 * P, 2 * P))
        .unwrap();
    let mapping = TestMapping::new();
    clone.set_paged_backlink(Arc::downgrade(&mapping) as _);

    let mut zeroed = 0;
    let mut request = MultiPageRequest::new();
    root.zero_range(VmCowRange::new(0, 4 * P), false, &mut zeroed, &mut request)
        .unwrap();
    // The child saw the invalidation projected into its own offsets.
    let changes = mapping.changes.lock();
    assert!(changes
        .iter()
        .any(|(range, op)| *op == RangeChangeOp::Unmap && range.offset == 0 && range.len == 2 * P));
    drop(changes);

    destroy(clone);
    destroy(root);
}

#[test]
fn lookup_range_reports_committed_pages_only() {
    let vmo = anon(4);
    write_page(&vmo, P, 0x44);
    let mut seen = Vec::new();
    vmo.lookup_range(VmCowRange::new(0, 4 * P), |offset, _paddr| {
        seen.push(offset);
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(seen, alloc::vec![P]);
    destroy(vmo);
}

#[test]
fn lookup_readable_walks_ancestors() {
    let root = anon(2);
    write_page(&root, P, 0x10);
    let clone = root
        .create_clone(SnapshotType::OnWrite, false, VmCowRange::new(0, 2 * P))
        .unwrap();
    write_page(&clone, 0, 0x20);
    let mut seen = Vec::new();
    clone
        .lookup_readable(VmCowRange::new(0, 2 * P), |offset, _paddr| {
            seen.push(offset);
            ControlFlow::Continue(())
        })
        .unwrap();
    seen.sort_unstable();
    assert_eq!(seen, alloc::vec![0, P]);
    destroy(clone);
    destroy(root);
}

#[test]
fn protect_and_promote_hints() {
    let (root, _pager) = pager_backed(1, false, false);
    supply_page(&root, 0, 0x31);
    let mut request = MultiPageRequest::new();
    root.protect_range_from_reclamation(VmCowRange::new(0, P), true, &mut request)
        .unwrap();
    let page = page_at(&root, 0).unwrap();
    assert!(page.always_need());
    let counts = root.reclaim_page(&page, 0, EvictionAction::FollowHints, None);
    assert_eq!(counts.evicted, 0);

    root.protect_range_from_reclamation(VmCowRange::new(0, P), false, &mut request)
        .unwrap();
    root.promote_range_for_reclamation(VmCowRange::new(0, P)).unwrap();
    assert!(!page.is_accessed());
    destroy(root);
}

#[test]
fn decompress_in_range_restores_pages() {
    let _serial = COMPRESSION_SERIAL.lock();
    let compressor = test_compressor();
    let vmo = anon(1);
    write_page(&vmo, 0, 0x27);
    let page = page_at(&vmo, 0).unwrap();
    let counts = vmo.reclaim_page(&page, 0, EvictionAction::FollowHints, Some(&*compressor));
    assert_eq!(counts.compressed, 1);
    vmo.decompress_in_range(VmCowRange::new(0, P)).unwrap();
    assert!(page_at(&vmo, 0).is_some());
    assert_eq!(read_byte(&vmo, 0), 0x27);
    destroy(vmo);
}

#[test]
fn commit_of_pager_range_requests_content() {
    let (root, pager) = pager_backed(2, false, false);
    let mut committed = 0;
    let mut request = MultiPageRequest::new();
    assert_eq!(
        root.commit_range(VmCowRange::new(0, 2 * P), &mut committed, &mut request),
        Err(Error::ShouldWait)
    );
    assert_eq!(committed, 0);
    // The request covers the whole missing window.
    assert_eq!(pager.last_read().unwrap().len, 2 * P);
    supply_page(&root, 0, 1);
    supply_page(&root, P, 2);
    commit_all(&root, VmCowRange::new(0, 2 * P));
    destroy(root);
}

#[test]
fn out_of_range_operations_are_rejected() {
    let vmo = anon(2);
    let mut committed = 0;
    let mut request = MultiPageRequest::new();
    assert_eq!(
        vmo.commit_range(VmCowRange::new(0, 3 * P), &mut committed, &mut request),
        Err(Error::OutOfRange)
    );
    assert_eq!(
        vmo.commit_range(VmCowRange::new(1, P), &mut committed, &mut request),
        Err(Error::InvalidArgs)
    );
    let mut buf = [0u8; 1];
    assert_eq!(vmo.read(2 * P, &mut buf, &mut request), Err(Error::OutOfRange));
    destroy(vmo);
}

#[test]
fn interval_invariants_hold_after_churn() {
    let (root, _pager) = pager_backed(8, true, true);
    write_page(&root, 0, 1);
    write_page(&root, 7 * P, 2);
    write_page(&root, 3 * P, 3);
    assert!(root.debug_validate_zero_intervals());
    assert!(root.debug_validate_backlinks());
    root.writeback_begin(VmCowRange::new(0, 8 * P), true).unwrap();
    root.writeback_end(VmCowRange::new(0, 8 * P)).unwrap();
    assert!(root.debug_validate_zero_intervals());
    destroy(root);
}

#[test]
fn cursor_fast_paths() {
    let vmo = anon(4);
    write_page(&vmo, 0, 0x71);
    write_page(&vmo, P, 0x72);

    let mut deferred = DeferredOps::new(&vmo);
    let mut request = MultiPageRequest::new();
    {
        let mut guard = vmo.inner.lock();
        let mut cursor =
            crate::cow::lookup_cursor_for_test(&vmo, &mut guard, VmCowRange::new(0, 4 * P));
        // Two committed pages are immediately usable.
        let mut paddrs = [0; 4];
        assert_eq!(cursor.if_exist_pages(true, 4, &mut paddrs), 2);
        // The next offsets hold no content at all.
        assert_eq!(cursor.skip_missing_pages(), 2);
    }
    {
        let mut spares = Vec::new();
        let mut guard = vmo.inner.lock();
        let mut cursor =
            crate::cow::lookup_cursor_for_test(&vmo, &mut guard, VmCowRange::new(0, 4 * P));
        cursor.disable_mark_accessed();
        cursor.disable_zero_fork();
        assert!(cursor.maybe_page(false).is_some());
        assert!(cursor.maybe_page(true).is_some());
        // An uncommitted offset cannot be satisfied without allocation.
        assert!(cursor.maybe_page(true).is_none());
        // A full query allocates the missing page.
        cursor.give_alloc_list(&mut spares);
        let result = cursor
            .require_page(true, 1, &mut deferred, &mut request)
            .unwrap();
        assert!(result.writable);
    }
    drop(deferred);
    assert!(page_at(&vmo, 3 * P).is_some());
    destroy(vmo);
}

#[test]
fn dead_transition_frees_everything() {
    let vmo = anon(8);
    commit_all(&vmo, VmCowRange::new(0, 8 * P));
    vmo.clear_paged_backlink();
    vmo.dead_transition();
    assert_eq!(vmo.life_cycle(), crate::LifeCycle::Dead);
    drop(vmo);
}
