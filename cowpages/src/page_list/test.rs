// SPDX-License-Identifier: MPL-2.0

use alloc::vec::Vec;
use core::ops::ControlFlow;

use super::*;
use crate::page::{DirtyState, VmPage};

const P: u64 = PAGE_SIZE;

fn page_entry() -> VmPageOrMarker {
    VmPageOrMarker::Page(VmPage::alloc(false).unwrap())
}

fn collect_items(list: &PageList, range: VmCowRange) -> Vec<(u64, u64, &'static str)> {
    let mut items = Vec::new();
    list.visit_range(range, |item| {
        match item {
            PlItem::Entry { offset, entry } => {
                let kind = if entry.is_page() {
                    "page"
                } else if entry.is_marker() {
                    "marker"
                } else {
                    "other"
                };
                items.push((offset, P, kind));
            }
            PlItem::Interval { range, .. } => items.push((range.offset, range.len, "interval")),
            PlItem::Gap { range } => items.push((range.offset, range.len, "gap")),
        }
        ControlFlow::Continue(())
    });
    items
}

#[test]
fn lookup_and_remove() {
    let mut list = PageList::new();
    assert!(list.lookup(0).is_none());

    let (slot, in_interval) = list
        .lookup_or_allocate(3 * P, InsertIntervalPolicy::NoIntervals)
        .unwrap();
    assert!(!in_interval);
    *slot = page_entry();

    assert!(list.lookup(3 * P).unwrap().is_page());
    assert!(list.lookup(2 * P).is_none());

    let removed = list.remove_content(3 * P);
    assert!(removed.is_page());
    assert!(list.lookup(3 * P).is_none());
    assert!(list.is_empty());
}

#[test]
fn cursor_steps_over_slots() {
    let mut list = PageList::new();
    for offset in [0, P, 2 * P] {
        let (slot, _) = list
            .lookup_or_allocate(offset, InsertIntervalPolicy::NoIntervals)
            .unwrap();
        *slot = VmPageOrMarker::Marker;
    }
    let mut cursor = list.cursor_at(0);
    assert!(cursor.current(&list).unwrap().is_marker());
    cursor.step();
    cursor.step();
    assert_eq!(cursor.offset(), 2 * P);
    assert!(cursor.current(&list).unwrap().is_marker());
    cursor.step();
    assert!(cursor.current(&list).is_none());
}

#[test]
fn zero_interval_round_trip() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 16 * P), DirtyState::Dirty)
        .unwrap();

    assert!(list.is_offset_in_zero_interval(0));
    assert!(list.is_offset_in_zero_interval(8 * P));
    assert!(list.is_offset_in_zero_interval(15 * P));
    assert!(!list.is_offset_in_zero_interval(16 * P));

    let (start, end, state, _) = list.enclosing_interval(4 * P).unwrap();
    assert_eq!((start, end), (0, 15 * P));
    assert_eq!(state, DirtyState::Dirty);
}

#[test]
fn single_page_interval_uses_slot_form() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(2 * P, P), DirtyState::Untracked)
        .unwrap();
    assert!(list.lookup(2 * P).unwrap().is_interval_slot());
    let (start, end, _, _) = list.enclosing_interval(2 * P).unwrap();
    assert_eq!((start, end), (2 * P, 2 * P));
}

#[test]
fn split_interval_carves_usable_slot() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 8 * P), DirtyState::Dirty)
        .unwrap();

    let (slot, in_interval) = list
        .lookup_or_allocate(3 * P, InsertIntervalPolicy::SplitInterval)
        .unwrap();
    assert!(in_interval);
    assert!(slot.is_empty());
    *slot = page_entry();

    // Left and right remainders survive with the same state.
    let (start, end, state, _) = list.enclosing_interval(0).unwrap();
    assert_eq!((start, end), (0, 2 * P));
    assert_eq!(state, DirtyState::Dirty);
    let (start, end, _, _) = list.enclosing_interval(5 * P).unwrap();
    assert_eq!((start, end), (4 * P, 7 * P));
    assert!(!list.is_offset_in_zero_interval(3 * P));
}

#[test]
fn split_interval_at_edges() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 3 * P), DirtyState::Dirty)
        .unwrap();

    let (slot, _) = list
        .lookup_or_allocate(0, InsertIntervalPolicy::SplitInterval)
        .unwrap();
    *slot = page_entry();
    let (start, end, _, _) = list.enclosing_interval(P).unwrap();
    assert_eq!((start, end), (P, 2 * P));

    let (slot, _) = list
        .lookup_or_allocate(2 * P, InsertIntervalPolicy::SplitInterval)
        .unwrap();
    *slot = page_entry();
    assert!(list.lookup(P).unwrap().is_interval_slot());
}

#[test]
fn return_interval_slot_refuses_with_neighbors() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 8 * P), DirtyState::Dirty)
        .unwrap();
    let (slot, _) = list
        .lookup_or_allocate(3 * P, InsertIntervalPolicy::SplitInterval)
        .unwrap();
    assert!(slot.is_empty());

    // Giving the slot back re-fuses the original interval.
    list.return_interval_slot(3 * P, DirtyState::Dirty);
    let (start, end, _, _) = list.enclosing_interval(3 * P).unwrap();
    assert_eq!((start, end), (0, 7 * P));
}

#[test]
fn adjacent_dirty_intervals_merge() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 4 * P), DirtyState::Dirty)
        .unwrap();
    list.add_zero_interval(VmCowRange::new(4 * P, 4 * P), DirtyState::Dirty)
        .unwrap();
    let (start, end, _, _) = list.enclosing_interval(0).unwrap();
    assert_eq!((start, end), (0, 7 * P));
}

#[test]
fn populate_and_overwrite_interval_slots() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 8 * P), DirtyState::Dirty)
        .unwrap();
    list.populate_slots_in_interval(VmCowRange::new(2 * P, 2 * P))
        .unwrap();

    assert!(list.lookup(2 * P).unwrap().is_interval_slot());
    assert!(list.lookup(3 * P).unwrap().is_interval_slot());

    list.overwrite_zero_interval(2 * P, page_entry());
    assert!(list.lookup(2 * P).unwrap().is_page());

    // The surrounding pieces survive.
    let (start, end, _, _) = list.enclosing_interval(0).unwrap();
    assert_eq!((start, end), (0, P));
    let (start, end, _, _) = list.enclosing_interval(5 * P).unwrap();
    assert_eq!((start, end), (4 * P, 7 * P));
}

#[test]
fn replace_page_with_zero_interval_merges() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 2 * P), DirtyState::Dirty)
        .unwrap();
    let (slot, _) = list
        .lookup_or_allocate(2 * P, InsertIntervalPolicy::NoIntervals)
        .unwrap();
    *slot = page_entry();

    let old = list.replace_page_with_zero_interval(2 * P, DirtyState::Dirty);
    assert!(old.is_page());
    let (start, end, _, _) = list.enclosing_interval(0).unwrap();
    assert_eq!((start, end), (0, 2 * P));
}

#[test]
fn clip_interval_start_and_end() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 8 * P), DirtyState::Dirty)
        .unwrap();

    list.clip_interval_start(0, 2 * P);
    let (start, end, _, _) = list.enclosing_interval(4 * P).unwrap();
    assert_eq!((start, end), (2 * P, 7 * P));

    list.clip_interval_end(2 * P, 5 * P);
    let (start, end, _, _) = list.enclosing_interval(4 * P).unwrap();
    assert_eq!((start, end), (2 * P, 5 * P));

    // Clipping to a single page leaves the slot form.
    list.clip_interval_start(2 * P, 5 * P);
    assert!(list.lookup(5 * P).unwrap().is_interval_slot());
}

#[test]
fn visit_range_reports_gaps_entries_and_intervals() {
    let mut list = PageList::new();
    let (slot, _) = list
        .lookup_or_allocate(P, InsertIntervalPolicy::NoIntervals)
        .unwrap();
    *slot = VmPageOrMarker::Marker;
    list.add_zero_interval(VmCowRange::new(4 * P, 3 * P), DirtyState::Dirty)
        .unwrap();

    let items = collect_items(&list, VmCowRange::new(0, 10 * P));
    assert_eq!(
        items,
        alloc::vec![
            (0, P, "gap"),
            (P, P, "marker"),
            (2 * P, 2 * P, "gap"),
            (4 * P, 3 * P, "interval"),
            (7 * P, 3 * P, "gap"),
        ]
    );
}

#[test]
fn visit_range_clips_straddling_interval() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 8 * P), DirtyState::Dirty)
        .unwrap();
    let items = collect_items(&list, VmCowRange::new(2 * P, 4 * P));
    assert_eq!(items, alloc::vec![(2 * P, 4 * P, "interval")]);
}

#[test]
fn remove_content_in_range_clips_intervals() {
    let mut list = PageList::new();
    list.add_zero_interval(VmCowRange::new(0, 8 * P), DirtyState::Dirty)
        .unwrap();
    let (slot, _) = list
        .lookup_or_allocate(9 * P, InsertIntervalPolicy::NoIntervals)
        .unwrap();
    *slot = page_entry();

    let mut removed = Vec::new();
    list.remove_content_in_range(VmCowRange::new(4 * P, 6 * P), |offset, entry| {
        removed.push((offset, entry.is_page()));
    });
    assert_eq!(removed, alloc::vec![(9 * P, true)]);

    let (start, end, _, _) = list.enclosing_interval(0).unwrap();
    assert_eq!((start, end), (0, 3 * P));
    assert!(!list.is_offset_in_zero_interval(4 * P));
}

#[test]
fn merge_moves_entries_onto_empty_slots() {
    let mut parent = PageList::new();
    let mut child = PageList::with_skew(2 * P);

    // Parent offsets [2P, 4P) correspond to child offsets [0, 2P).
    for offset in [2 * P, 3 * P] {
        let (slot, _) = parent
            .lookup_or_allocate(offset, InsertIntervalPolicy::NoIntervals)
            .unwrap();
        *slot = page_entry();
    }
    // The child has its own content at offset P, occluding the parent.
    let (slot, _) = child
        .lookup_or_allocate(P, InsertIntervalPolicy::NoIntervals)
        .unwrap();
    *slot = VmPageOrMarker::Marker;

    let mut migrated = Vec::new();
    let mut released = Vec::new();
    parent.merge_range_onto_and_clear(
        VmCowRange::new(2 * P, 2 * P),
        &mut child,
        2 * P,
        |new_offset, _| migrated.push(new_offset),
        |entry| released.push(entry.is_page()),
    );

    assert_eq!(migrated, alloc::vec![0]);
    assert_eq!(released, alloc::vec![true]);
    assert!(parent.is_empty());
    assert!(child.lookup(0).unwrap().is_page());
    assert!(child.lookup(P).unwrap().is_marker());
}

#[test]
fn merge_moves_whole_nodes_when_aligned() {
    let mut parent = PageList::new();
    let mut child = PageList::with_skew(0);

    for slot_idx in 0..PAGE_FAN_OUT {
        let (slot, _) = parent
            .lookup_or_allocate(slot_idx * P, InsertIntervalPolicy::NoIntervals)
            .unwrap();
        *slot = page_entry();
    }

    let mut migrated = 0;
    parent.merge_range_onto_and_clear(
        VmCowRange::new(0, PAGE_FAN_OUT * P),
        &mut child,
        0,
        |_, _| migrated += 1,
        |_| panic!("nothing should be released"),
    );
    assert_eq!(migrated, PAGE_FAN_OUT);
    for slot_idx in 0..PAGE_FAN_OUT {
        assert!(child.lookup(slot_idx * P).unwrap().is_page());
    }
}

#[test]
fn first_page_offset_skips_markers() {
    let mut list = PageList::new();
    let (slot, _) = list
        .lookup_or_allocate(0, InsertIntervalPolicy::NoIntervals)
        .unwrap();
    *slot = VmPageOrMarker::Marker;
    let (slot, _) = list
        .lookup_or_allocate(5 * P, InsertIntervalPolicy::NoIntervals)
        .unwrap();
    *slot = page_entry();
    assert_eq!(list.first_page_offset(), Some(5 * P));
}
