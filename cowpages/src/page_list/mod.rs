// SPDX-License-Identifier: MPL-2.0

//! The sparse offset-to-content map of a copy-on-write node.
//!
//! Entries live in fixed fan-out nodes keyed by the high bits of the page
//! index, so contiguous block operations can move or merge whole nodes. A
//! list carries an additive *skew*, inherited from its original root, which
//! keeps a child's indexes aligned with its parent's and makes hidden-node
//! collapse a matter of moving nodes rather than entries.

mod cursor;
mod entry;
#[cfg(test)]
mod test;

use alloc::collections::BTreeMap;
use core::ops::ControlFlow;

pub use cursor::PageListCursor;
pub use entry::VmPageOrMarker;

use crate::error::{Error, Result};
use crate::page::DirtyState;
use crate::range::VmCowRange;
use crate::PAGE_SIZE;

/// Entries per page list node.
pub(crate) const PAGE_FAN_OUT: u64 = 16;

static_assertions::const_assert!(PAGE_FAN_OUT.is_power_of_two());

struct PageListNode {
    slots: [VmPageOrMarker; PAGE_FAN_OUT as usize],
}

impl PageListNode {
    fn empty() -> Self {
        Self {
            slots: core::array::from_fn(|_| VmPageOrMarker::Empty),
        }
    }

    fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_empty())
    }
}

/// How [`PageList::lookup_or_allocate`] treats a slot that lies inside a
/// sparse zero interval.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InsertIntervalPolicy {
    /// The caller asserts no interval can be here.
    NoIntervals,
    /// Report that the slot is inside an interval without mutating it.
    CheckForInterval,
    /// Carve the enclosing interval around the slot, leaving a single
    /// usable slot the caller will fill. On failure to fill it the caller
    /// must give the slot back with [`PageList::return_interval_slot`].
    SplitInterval,
}

/// One visited item of [`PageList::visit_range`].
pub(crate) enum PlItem<'a> {
    /// A non-empty, non-interval entry.
    Entry { offset: u64, entry: &'a VmPageOrMarker },
    /// A zero interval, reported once, clipped to the queried range.
    Interval {
        range: VmCowRange,
        interval_start: u64,
        dirty_state: DirtyState,
        awaiting_clean_len: u64,
    },
    /// A maximal run of empty slots outside any interval.
    Gap { range: VmCowRange },
}

/// The sparse offset-to-content map.
pub struct PageList {
    nodes: BTreeMap<u64, PageListNode>,
    skew: u64,
}

impl PageList {
    pub fn new() -> Self {
        Self::with_skew(0)
    }

    /// Creates a list whose indexes are shifted by `skew` bytes, used to
    /// keep a child index-aligned with its parent.
    pub fn with_skew(skew: u64) -> Self {
        debug_assert_eq!(skew % PAGE_SIZE, 0);
        Self {
            nodes: BTreeMap::new(),
            skew: skew % (PAGE_SIZE * PAGE_FAN_OUT),
        }
    }

    pub fn skew(&self) -> u64 {
        self.skew
    }

    fn index_of(&self, offset: u64) -> u64 {
        debug_assert_eq!(offset % PAGE_SIZE, 0);
        (offset + self.skew) / PAGE_SIZE
    }

    fn offset_of_index(&self, index: u64) -> u64 {
        index * PAGE_SIZE - self.skew
    }

    fn get(&self, offset: u64) -> Option<&VmPageOrMarker> {
        let index = self.index_of(offset);
        self.nodes
            .get(&(index / PAGE_FAN_OUT))
            .map(|node| &node.slots[(index % PAGE_FAN_OUT) as usize])
    }

    fn get_mut(&mut self, offset: u64) -> Option<&mut VmPageOrMarker> {
        let index = self.index_of(offset);
        self.nodes
            .get_mut(&(index / PAGE_FAN_OUT))
            .map(|node| &mut node.slots[(index % PAGE_FAN_OUT) as usize])
    }

    fn get_or_insert_mut(&mut self, offset: u64) -> &mut VmPageOrMarker {
        let index = self.index_of(offset);
        let node = self
            .nodes
            .entry(index / PAGE_FAN_OUT)
            .or_insert_with(PageListNode::empty);
        &mut node.slots[(index % PAGE_FAN_OUT) as usize]
    }

    fn prune_node_at(&mut self, offset: u64) {
        let key = self.index_of(offset) / PAGE_FAN_OUT;
        if let Some(node) = self.nodes.get(&key)
            && node.is_empty()
        {
            self.nodes.remove(&key);
        }
    }

    /// Looks up the entry at `offset`, if its slot is populated.
    pub fn lookup(&self, offset: u64) -> Option<&VmPageOrMarker> {
        self.get(offset).filter(|entry| !entry.is_empty())
    }

    /// Mutable variant of [`PageList::lookup`].
    pub fn lookup_mut(&mut self, offset: u64) -> Option<&mut VmPageOrMarker> {
        self.get_mut(offset).filter(|entry| !entry.is_empty())
    }

    /// Returns a stepping cursor positioned at `offset`.
    pub fn cursor_at(&self, offset: u64) -> PageListCursor {
        PageListCursor::new(offset)
    }

    /// Whether the list holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The offset of the lowest committed page, if any.
    pub fn first_page_offset(&self) -> Option<u64> {
        let mut result = None;
        self.visit_range(VmCowRange::new(0, u64::MAX - self.skew), |item| {
            if let PlItem::Entry { offset, entry } = item
                && entry.is_page()
            {
                result = Some(offset);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        result
    }

    /// Looks up the slot at `offset`, allocating it if needed.
    ///
    /// Returns the slot and whether the offset lies inside a zero
    /// interval. With [`InsertIntervalPolicy::SplitInterval`] the interval
    /// is restructured so the returned slot is directly usable.
    pub fn lookup_or_allocate(
        &mut self,
        offset: u64,
        policy: InsertIntervalPolicy,
    ) -> Result<(&mut VmPageOrMarker, bool)> {
        let interval = self.enclosing_interval(offset);
        let in_interval = interval.is_some();
        match policy {
            InsertIntervalPolicy::NoIntervals => {
                debug_assert!(!in_interval, "unexpected interval at {offset:#x}");
            }
            InsertIntervalPolicy::CheckForInterval => {}
            InsertIntervalPolicy::SplitInterval => {
                if let Some((start, end, state, acl)) = interval {
                    self.carve_interval_slot(start, end, state, acl, offset);
                }
            }
        }
        Ok((self.get_or_insert_mut(offset), in_interval))
    }

    /// Removes and returns the content entry at `offset`, leaving the slot
    /// empty and releasing the node if it becomes empty.
    ///
    /// Interval sentinels cannot be removed this way.
    pub fn remove_content(&mut self, offset: u64) -> VmPageOrMarker {
        let Some(slot) = self.get_mut(offset) else {
            return VmPageOrMarker::Empty;
        };
        debug_assert!(!slot.is_interval_zero(), "removing an interval sentinel");
        let entry = slot.take();
        self.prune_node_at(offset);
        entry
    }

    /// Whether `offset` lies inside a sparse zero interval, including on
    /// its sentinels.
    pub fn is_offset_in_zero_interval(&self, offset: u64) -> bool {
        self.enclosing_interval(offset).is_some()
    }

    /// The extent of the interval enclosing `offset`, as
    /// `(start, inclusive_end, dirty_state, awaiting_clean_len)`.
    pub(crate) fn enclosing_interval(
        &self,
        offset: u64,
    ) -> Option<(u64, u64, DirtyState, u64)> {
        if let Some(entry) = self.get(offset) {
            match entry {
                VmPageOrMarker::IntervalSlot {
                    dirty_state,
                    awaiting_clean_len,
                } => return Some((offset, offset, *dirty_state, *awaiting_clean_len)),
                VmPageOrMarker::IntervalStart {
                    dirty_state,
                    awaiting_clean_len,
                } => {
                    let end = self.next_populated(offset + PAGE_SIZE).map(|(off, _)| off);
                    let end = end.expect("interval start without an end");
                    return Some((offset, end, *dirty_state, *awaiting_clean_len));
                }
                VmPageOrMarker::IntervalEnd { dirty_state } => {
                    let (start, start_entry) = self
                        .prev_populated(offset)
                        .expect("interval end without a start");
                    debug_assert!(start_entry.is_interval_start());
                    return Some((start, offset, *dirty_state, start_entry.awaiting_clean_len()));
                }
                _ if !entry.is_empty() => return None,
                _ => {}
            }
        }
        // The slot is empty; it is inside an interval iff the nearest
        // populated entry below is an interval start.
        let (start, start_entry) = self.prev_populated(offset)?;
        if let VmPageOrMarker::IntervalStart {
            dirty_state,
            awaiting_clean_len,
        } = start_entry
        {
            let end = self
                .next_populated(offset)
                .map(|(off, _)| off)
                .expect("interval start without an end");
            debug_assert!(end > offset);
            Some((start, end, *dirty_state, *awaiting_clean_len))
        } else {
            None
        }
    }

    /// The nearest populated slot strictly below `offset`.
    fn prev_populated(&self, offset: u64) -> Option<(u64, &VmPageOrMarker)> {
        let index = self.index_of(offset);
        let mut key = index / PAGE_FAN_OUT;
        let mut slot = index % PAGE_FAN_OUT;
        loop {
            let upper = if slot == 0 { key } else { key + 1 };
            let (found_key, node) = self.nodes.range(..upper).next_back()?;
            let start_slot = if *found_key == key { slot } else { PAGE_FAN_OUT };
            for s in (0..start_slot).rev() {
                let entry = &node.slots[s as usize];
                if !entry.is_empty() {
                    return Some((self.offset_of_index(found_key * PAGE_FAN_OUT + s), entry));
                }
            }
            if *found_key == 0 {
                return None;
            }
            key = *found_key;
            slot = 0;
        }
    }

    /// The offset of the nearest populated slot at or above `offset`, if
    /// any. Used to bound how far a hierarchy walk may assume this list
    /// stays empty.
    pub(crate) fn next_populated_offset(&self, offset: u64) -> Option<u64> {
        self.next_populated(offset).map(|(off, _)| off)
    }

    /// The nearest populated slot at or above `offset`.
    fn next_populated(&self, offset: u64) -> Option<(u64, &VmPageOrMarker)> {
        let index = self.index_of(offset);
        let first_key = index / PAGE_FAN_OUT;
        for (key, node) in self.nodes.range(first_key..) {
            let start_slot = if *key == first_key { index % PAGE_FAN_OUT } else { 0 };
            for s in start_slot..PAGE_FAN_OUT {
                let entry = &node.slots[s as usize];
                if !entry.is_empty() {
                    return Some((self.offset_of_index(key * PAGE_FAN_OUT + s), entry));
                }
            }
        }
        None
    }

    /// Visits `range` in offset order, reporting entries, whole intervals
    /// (clipped) and maximal gaps.
    pub(crate) fn visit_range<'a, F>(&'a self, range: VmCowRange, mut f: F)
    where
        F: FnMut(PlItem<'a>) -> ControlFlow<()>,
    {
        if range.is_empty() {
            return;
        }
        let mut cursor = range.offset;
        let mut gap_start: Option<u64> = None;

        // Entering the range mid-interval needs special casing as the
        // start sentinel lies outside the range.
        if let Some((start, end, dirty_state, acl)) = self.enclosing_interval(cursor)
            && start < cursor
        {
            let interval_range =
                VmCowRange::new(cursor, (end + PAGE_SIZE).min(range.end()) - cursor);
            if f(PlItem::Interval {
                range: interval_range,
                interval_start: start,
                dirty_state,
                awaiting_clean_len: acl,
            })
            .is_break()
            {
                return;
            }
            cursor = end + PAGE_SIZE;
        }

        while cursor < range.end() {
            let Some((offset, entry)) = self.next_populated(cursor) else {
                break;
            };
            if offset >= range.end() {
                break;
            }
            if offset > cursor {
                gap_start.get_or_insert(cursor);
            }
            match entry {
                VmPageOrMarker::IntervalStart {
                    dirty_state,
                    awaiting_clean_len,
                } => {
                    if let Some(start) = gap_start.take() {
                        if f(PlItem::Gap {
                            range: VmCowRange::new(start, offset - start),
                        })
                        .is_break()
                        {
                            return;
                        }
                    }
                    let (_, end, _, _) = self
                        .enclosing_interval(offset)
                        .expect("sentinel without an interval");
                    let clipped_end = (end + PAGE_SIZE).min(range.end());
                    if f(PlItem::Interval {
                        range: VmCowRange::new(offset, clipped_end - offset),
                        interval_start: offset,
                        dirty_state: *dirty_state,
                        awaiting_clean_len: *awaiting_clean_len,
                    })
                    .is_break()
                    {
                        return;
                    }
                    cursor = end + PAGE_SIZE;
                }
                VmPageOrMarker::IntervalSlot {
                    dirty_state,
                    awaiting_clean_len,
                } => {
                    if let Some(start) = gap_start.take() {
                        if f(PlItem::Gap {
                            range: VmCowRange::new(start, offset - start),
                        })
                        .is_break()
                        {
                            return;
                        }
                    }
                    if f(PlItem::Interval {
                        range: VmCowRange::new(offset, PAGE_SIZE),
                        interval_start: offset,
                        dirty_state: *dirty_state,
                        awaiting_clean_len: *awaiting_clean_len,
                    })
                    .is_break()
                    {
                        return;
                    }
                    cursor = offset + PAGE_SIZE;
                }
                VmPageOrMarker::IntervalEnd { .. } => {
                    debug_assert!(false, "interval end before its start in a range walk");
                    cursor = offset + PAGE_SIZE;
                }
                entry => {
                    if let Some(start) = gap_start.take() {
                        if f(PlItem::Gap {
                            range: VmCowRange::new(start, offset - start),
                        })
                        .is_break()
                        {
                            return;
                        }
                    }
                    if f(PlItem::Entry { offset, entry }).is_break() {
                        return;
                    }
                    cursor = offset + PAGE_SIZE;
                }
            }
            if cursor < range.end() && self.next_populated(cursor).is_none() {
                break;
            }
        }
        if cursor < range.end() {
            let start = gap_start.unwrap_or(cursor);
            let _ = f(PlItem::Gap {
                range: VmCowRange::new(start, range.end() - start),
            });
        } else if let Some(start) = gap_start {
            let _ = f(PlItem::Gap {
                range: VmCowRange::new(start, range.end() - start),
            });
        }
    }

    /// Invokes `f` for every committed page in `range`.
    pub fn for_every_page_in_range<F>(&self, range: VmCowRange, mut f: F)
    where
        F: FnMut(u64, &VmPageOrMarker) -> ControlFlow<()>,
    {
        self.visit_range(range, |item| match item {
            PlItem::Entry { offset, entry } if entry.is_page() || entry.is_reference() => {
                f(offset, entry)
            }
            _ => ControlFlow::Continue(()),
        });
    }

    /// Invokes `page_fn` for every content entry and `gap_fn` for every
    /// maximal empty run in `range`. Intervals are reported through
    /// `page_fn` at their (clipped) starting offset.
    pub fn for_every_page_and_gap_in_range<F, G>(
        &self,
        range: VmCowRange,
        mut page_fn: F,
        mut gap_fn: G,
    ) where
        F: FnMut(u64, &VmPageOrMarker) -> ControlFlow<()>,
        G: FnMut(VmCowRange) -> ControlFlow<()>,
    {
        self.visit_range(range, |item| match item {
            PlItem::Entry { offset, entry } => page_fn(offset, entry),
            PlItem::Interval { range, .. } => {
                // Look up the live sentinel so the callback sees a real
                // entry reference.
                match self.get(range.offset) {
                    Some(entry) if entry.is_interval_zero() => page_fn(range.offset, entry),
                    _ => ControlFlow::Continue(()),
                }
            }
            PlItem::Gap { range } => gap_fn(range),
        });
    }

    /// Removes every content entry in `range`, handing each to `f`
    /// together with its offset. Intervals partially covered by the range
    /// are clipped; fully covered ones are removed.
    pub fn remove_content_in_range<F>(&mut self, range: VmCowRange, mut f: F)
    where
        F: FnMut(u64, VmPageOrMarker),
    {
        debug_assert!(range.is_page_aligned());
        if range.is_empty() {
            return;
        }
        // An interval straddling the range start (possibly out both ends).
        if let Some((start, end, state, _)) = self.enclosing_interval(range.offset)
            && start < range.offset
        {
            let tail = if end >= range.end() {
                Some((range.end(), end))
            } else {
                None
            };
            self.clip_interval_end(start, range.offset - PAGE_SIZE);
            if let Some((tail_start, tail_end)) = tail {
                self.insert_interval(tail_start, tail_end, state, 0);
                // The whole range was inside this one interval.
                return;
            }
        }
        // An interval starting inside the range and straddling its end.
        if let Some((start, end, state, _)) = self.enclosing_interval(range.end() - PAGE_SIZE)
            && start >= range.offset
            && end >= range.end()
        {
            self.remove_interval_sentinels(start, end);
            self.insert_interval(range.end(), end, state, 0);
        }
        // Now remove everything remaining in range.
        let mut offsets = alloc::vec::Vec::new();
        self.visit_range(range, |item| {
            match item {
                PlItem::Entry { offset, .. } => offsets.push((offset, false)),
                PlItem::Interval { range, .. } => offsets.push((range.offset, true)),
                PlItem::Gap { .. } => {}
            }
            ControlFlow::Continue(())
        });
        for (offset, is_interval) in offsets {
            if is_interval {
                if let Some((start, end, _, _)) = self.enclosing_interval(offset) {
                    debug_assert!(start >= range.offset && end < range.end());
                    self.remove_interval_sentinels(start, end);
                }
            } else if let Some(slot) = self.get_mut(offset) {
                let entry = slot.take();
                if !entry.is_empty() {
                    f(offset, entry);
                }
                self.prune_node_at(offset);
            }
        }
    }

    fn remove_interval_sentinels(&mut self, start: u64, end: u64) {
        if let Some(slot) = self.get_mut(start) {
            debug_assert!(slot.is_interval_start() || slot.is_interval_slot());
            slot.take();
        }
        if end != start
            && let Some(slot) = self.get_mut(end)
        {
            debug_assert!(slot.is_interval_end());
            slot.take();
        }
        self.prune_node_at(start);
        self.prune_node_at(end);
    }

    fn insert_interval(&mut self, start: u64, end_inclusive: u64, state: DirtyState, acl: u64) {
        if start == end_inclusive {
            let slot = self.get_or_insert_mut(start);
            debug_assert!(slot.is_empty());
            *slot = VmPageOrMarker::IntervalSlot {
                dirty_state: state,
                awaiting_clean_len: acl,
            };
        } else {
            let slot = self.get_or_insert_mut(start);
            debug_assert!(slot.is_empty());
            *slot = VmPageOrMarker::IntervalStart {
                dirty_state: state,
                awaiting_clean_len: acl,
            };
            let slot = self.get_or_insert_mut(end_inclusive);
            debug_assert!(slot.is_empty());
            *slot = VmPageOrMarker::IntervalEnd { dirty_state: state };
        }
    }

    /// Adds a sparse zero interval covering the page-aligned `range`,
    /// merging with directly adjacent intervals of the same dirty state.
    ///
    /// Every slot in the range must be empty.
    pub fn add_zero_interval(&mut self, range: VmCowRange, state: DirtyState) -> Result<()> {
        debug_assert!(range.is_page_aligned() && !range.is_empty());
        debug_assert!(state != DirtyState::Clean);
        let mut start = range.offset;
        let mut end = range.end() - PAGE_SIZE;
        let mut acl = 0;
        // Merge a Dirty interval ending right before us.
        if state == DirtyState::Dirty
            && range.offset >= PAGE_SIZE
            && let Some((prev_start, prev_end, prev_state, prev_acl)) =
                self.enclosing_interval(range.offset - PAGE_SIZE)
            && prev_state == state
        {
            debug_assert_eq!(prev_end, range.offset - PAGE_SIZE);
            self.remove_interval_sentinels(prev_start, prev_end);
            start = prev_start;
            acl = prev_acl;
        }
        // Merge a Dirty interval starting right after us.
        if state == DirtyState::Dirty
            && let Some((next_start, next_end, next_state, _)) = self.enclosing_interval(range.end())
            && next_state == state
        {
            debug_assert_eq!(next_start, range.end());
            self.remove_interval_sentinels(next_start, next_end);
            end = next_end;
        }
        self.insert_interval(start, end, state, acl);
        Ok(())
    }

    /// Moves the inclusive end of the interval starting at `start` down to
    /// `new_end`. Removes the interval if `new_end < start`.
    pub fn clip_interval_end(&mut self, start: u64, new_end: u64) {
        let Some((istart, iend, state, acl)) = self.enclosing_interval(start) else {
            debug_assert!(false, "no interval at {start:#x}");
            return;
        };
        debug_assert_eq!(istart, start);
        self.remove_interval_sentinels(istart, iend);
        if new_end >= istart && new_end != u64::MAX {
            self.insert_interval(istart, new_end, state, acl);
        }
    }

    /// Moves the start of the interval starting at `start` up to
    /// `new_start`. Removes the interval if `new_start` passes its end.
    /// The awaiting-clean length is carried over; readers apply max-take
    /// semantics on the next writeback.
    pub fn clip_interval_start(&mut self, start: u64, new_start: u64) {
        let Some((istart, iend, state, acl)) = self.enclosing_interval(start) else {
            debug_assert!(false, "no interval at {start:#x}");
            return;
        };
        debug_assert_eq!(istart, start);
        self.remove_interval_sentinels(istart, iend);
        if new_start <= iend {
            self.insert_interval(new_start, iend, state, acl);
        }
    }

    /// Restructures the interval covering `range` so that every slot of
    /// `range` becomes an individually replaceable `IntervalSlot`.
    pub fn populate_slots_in_interval(&mut self, range: VmCowRange) -> Result<()> {
        debug_assert!(range.is_page_aligned() && !range.is_empty());
        let Some((start, end, state, acl)) = self.enclosing_interval(range.offset) else {
            debug_assert!(false, "no interval covering {:#x}", range.offset);
            return Err(Error::BadState);
        };
        debug_assert!(end + PAGE_SIZE >= range.end());
        self.remove_interval_sentinels(start, end);
        if start < range.offset {
            self.insert_interval(start, range.offset - PAGE_SIZE, state, acl);
        }
        for offset in range.pages() {
            let slot = self.get_or_insert_mut(offset);
            debug_assert!(slot.is_empty());
            *slot = VmPageOrMarker::IntervalSlot {
                dirty_state: state,
                awaiting_clean_len: 0,
            };
        }
        if end >= range.end() {
            self.insert_interval(range.end(), end, state, 0);
        }
        Ok(())
    }

    /// Replaces the `IntervalSlot` at `offset` with `entry`.
    pub fn overwrite_zero_interval(&mut self, offset: u64, entry: VmPageOrMarker) {
        let slot = self.get_mut(offset).expect("no slot at offset");
        debug_assert!(slot.is_interval_slot());
        *slot = entry;
    }

    /// Carves a single empty, usable slot at `offset` out of the interval
    /// `(start, end)`. The surrounding interval pieces are preserved.
    fn carve_interval_slot(
        &mut self,
        start: u64,
        end: u64,
        state: DirtyState,
        acl: u64,
        offset: u64,
    ) {
        debug_assert!(offset >= start && offset <= end);
        self.remove_interval_sentinels(start, end);
        if offset > start {
            self.insert_interval(start, offset - PAGE_SIZE, state, acl);
        }
        if offset < end {
            self.insert_interval(offset + PAGE_SIZE, end, state, if offset > start { 0 } else { acl });
        }
        // The slot at `offset` stays empty for the caller to fill.
        let _ = self.get_or_insert_mut(offset);
    }

    /// Re-fuses an empty slot at `offset` back into a zero interval of the
    /// given state, merging with adjacent intervals where possible.
    pub fn return_interval_slot(&mut self, offset: u64, state: DirtyState) {
        debug_assert!(self.get(offset).is_none_or(|slot| slot.is_empty()));
        let mut start = offset;
        let mut end = offset;
        let mut acl = 0;
        if offset >= PAGE_SIZE
            && let Some((prev_start, prev_end, prev_state, prev_acl)) =
                self.enclosing_interval(offset - PAGE_SIZE)
            && prev_state == state
        {
            debug_assert_eq!(prev_end, offset - PAGE_SIZE);
            self.remove_interval_sentinels(prev_start, prev_end);
            start = prev_start;
            acl = prev_acl;
        }
        if let Some((next_start, next_end, next_state, _)) =
            self.enclosing_interval(offset + PAGE_SIZE)
            && next_state == state
        {
            debug_assert_eq!(next_start, offset + PAGE_SIZE);
            self.remove_interval_sentinels(next_start, next_end);
            end = next_end;
        }
        self.insert_interval(start, end, state, acl);
    }

    /// Replaces the committed page at `offset` with a zero interval of the
    /// given state, returning the displaced entry.
    pub fn replace_page_with_zero_interval(
        &mut self,
        offset: u64,
        state: DirtyState,
    ) -> VmPageOrMarker {
        let slot = self.get_mut(offset).expect("no slot at offset");
        debug_assert!(slot.is_page() || slot.is_reference() || slot.is_marker());
        let old = slot.take();
        self.return_interval_slot(offset, state);
        old
    }

    /// Raises the awaiting-clean length of the interval starting at
    /// `start` to at least `len`.
    pub(crate) fn grow_interval_awaiting_clean(&mut self, start: u64, len: u64) {
        let slot = self.get_mut(start).expect("no interval start");
        slot.grow_awaiting_clean_len(len);
    }

    /// Sets the dirty state of the whole interval starting at `start`.
    pub(crate) fn set_interval_dirty_state(&mut self, start: u64, state: DirtyState) {
        let Some((istart, iend, _, _)) = self.enclosing_interval(start) else {
            debug_assert!(false, "no interval at {start:#x}");
            return;
        };
        debug_assert_eq!(istart, start);
        self.get_mut(istart)
            .expect("missing sentinel")
            .set_interval_dirty_state(state);
        if iend != istart {
            self.get_mut(iend)
                .expect("missing sentinel")
                .set_interval_dirty_state(state);
        }
    }

    /// Moves every entry of `range` (in this list's offsets) onto `other`,
    /// where this list's `offset` corresponds to `offset - offset_delta`
    /// in `other`. Entries whose destination already holds content, and
    /// entries outside `range`, are handed to `release`. Entries that land
    /// are first passed to `migrate` with their new offset.
    ///
    /// When the two lists' skews are aligned, whole nodes are moved
    /// without touching individual slots. Afterwards this list is empty.
    pub fn merge_range_onto_and_clear<F, G>(
        &mut self,
        range: VmCowRange,
        other: &mut PageList,
        offset_delta: u64,
        mut migrate: F,
        mut release: G,
    ) where
        F: FnMut(u64, &mut VmPageOrMarker),
        G: FnMut(VmPageOrMarker),
    {
        debug_assert!(range.is_page_aligned());
        let nodes = core::mem::take(&mut self.nodes);
        // Whole nodes can move when the shift between the two lists'
        // indexes is a multiple of the fan-out and the destination node is
        // absent. The shift is always a whole number of pages.
        let shift_pages = (self.skew as i128 + offset_delta as i128 - other.skew as i128)
            / PAGE_SIZE as i128;
        let aligned = shift_pages % PAGE_FAN_OUT as i128 == 0;
        for (key, mut node) in nodes {
            let base_index = key * PAGE_FAN_OUT;
            // The slots of the first node below the skew map to no valid
            // offset and are always empty.
            if aligned && base_index * PAGE_SIZE >= self.skew {
                let node_first = base_index * PAGE_SIZE - self.skew;
                let node_last = node_first + (PAGE_FAN_OUT - 1) * PAGE_SIZE;
                if node_first >= range.offset && node_last < range.end() {
                    let other_key = other.index_of(node_first - offset_delta) / PAGE_FAN_OUT;
                    if !other.nodes.contains_key(&other_key) {
                        for (s, slot) in node.slots.iter_mut().enumerate() {
                            if !slot.is_empty() {
                                let new_offset =
                                    node_first + s as u64 * PAGE_SIZE - offset_delta;
                                migrate(new_offset, slot);
                            }
                        }
                        if !node.is_empty() {
                            other.nodes.insert(other_key, node);
                        }
                        continue;
                    }
                }
            }
            for (s, slot) in node.slots.iter_mut().enumerate() {
                if slot.is_empty() {
                    continue;
                }
                let offset = self.offset_of_index(base_index + s as u64);
                let mut entry = slot.take();
                if !range.contains(offset) {
                    release(entry);
                    continue;
                }
                let new_offset = offset - offset_delta;
                let dest = other.get_or_insert_mut(new_offset);
                if dest.is_empty() || dest.is_parent_content() {
                    migrate(new_offset, &mut entry);
                    let old = dest.replace(entry);
                    debug_assert!(old.is_empty() || old.is_parent_content());
                } else {
                    release(entry);
                }
            }
        }
    }

    /// Removes every entry, handing page and reference entries to `f`.
    pub fn clear<F>(&mut self, mut f: F)
    where
        F: FnMut(u64, VmPageOrMarker),
    {
        let nodes = core::mem::take(&mut self.nodes);
        for (key, mut node) in nodes {
            for (s, slot) in node.slots.iter_mut().enumerate() {
                let entry = slot.take();
                if entry.is_page() || entry.is_reference() {
                    let offset = self.offset_of_index(key * PAGE_FAN_OUT + s as u64);
                    f(offset, entry);
                }
            }
        }
    }
}

impl Default for PageList {
    fn default() -> Self {
        Self::new()
    }
}
