// SPDX-License-Identifier: MPL-2.0

//! The clone protocol: unidirectional clones and bidirectional snapshots.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use crate::error::{Error, Result};
use crate::page_list::{InsertIntervalPolicy, PageList, PlItem, VmPageOrMarker, PAGE_FAN_OUT};
use crate::range::VmCowRange;
use crate::PAGE_SIZE;

use super::hierarchy;
use super::locking::{self, LockedPtr};
use super::{CowPagesInner, DeferredOps, LifeCycle, RangeChangeOp, VmCowPages, VmCowPagesOptions};

/// The strength of a clone.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SnapshotType {
    /// Semantically a memcpy: the clone observes the origin's content at
    /// clone time and nothing later. Incompatible with pager backing,
    /// whose content can change underneath a "snapshot".
    Full,
    /// Snapshots content modified relative to the origin's parent chain;
    /// shared ancestor content stays live.
    Modified,
    /// The weakest mode: lazy copy-on-write of any page.
    OnWrite,
}

struct ParentAndRange {
    /// The node to hang the clone off; empty means the origin itself.
    /// Holding this lock until the clone is linked keeps the reasoning
    /// that made the choice valid: reshaping the chosen parent (merge,
    /// death, reparenting) requires its lock. Mutations of the chain
    /// above it are serialized by the pager hierarchy lock where one
    /// exists.
    parent: LockedPtr,
    /// Clone offset relative to the chosen parent.
    offset: u64,
    /// How far the clone may see into the chosen parent.
    limit: u64,
}

impl VmCowPages {
    /// Creates a copy-on-write clone of `range` of this node.
    ///
    /// `Full` (and `Modified` on a node with a parent) requires a
    /// bidirectional snapshot: a hidden node is interposed above the
    /// origin and both the origin and the clone copy-on-write from it.
    /// `require_unidirectional` refuses such requests. The returned node
    /// is already alive.
    pub fn create_clone(
        self: &Arc<Self>,
        snapshot: SnapshotType,
        require_unidirectional: bool,
        range: VmCowRange,
    ) -> Result<Arc<Self>> {
        if !range.is_page_aligned() || range.is_empty() {
            return Err(Error::InvalidArgs);
        }
        if self.is_hidden() {
            return Err(Error::BadState);
        }
        let mut deferred = DeferredOps::new(self);
        let mut locked = LockedPtr::lock(self);
        let result = self.create_clone_locked(
            &mut locked,
            snapshot,
            require_unidirectional,
            range,
            &mut deferred,
        );
        drop(locked);
        result
    }

    fn create_clone_locked(
        self: &Arc<Self>,
        locked: &mut LockedPtr,
        snapshot: SnapshotType,
        require_unidirectional: bool,
        range: VmCowRange,
        deferred: &mut DeferredOps,
    ) -> Result<Arc<Self>> {
        let inner = locked.locked_mut();
        if inner.life_cycle != LifeCycle::Alive {
            return Err(Error::BadState);
        }
        let bidirectional = match snapshot {
            SnapshotType::Full => true,
            SnapshotType::Modified => inner.parent.is_some(),
            SnapshotType::OnWrite => false,
        };
        if snapshot == SnapshotType::Full && self.root_has_page_source() {
            return Err(Error::NotSupported);
        }
        if bidirectional {
            if require_unidirectional {
                return Err(Error::NotSupported);
            }
            if self.root_has_page_source() {
                return Err(Error::NotSupported);
            }
            if inner.pinned_page_count > 0 {
                return Err(Error::BadState);
            }
        }
        // The clone projected onto the root must stay representable.
        inner
            .root_parent_offset
            .checked_add(range.end())
            .ok_or(Error::InvalidArgs)?;
        if bidirectional {
            self.clone_bidirectional_locked(inner, range, deferred)
        } else {
            self.clone_unidirectional_locked(inner, range)
        }
    }

    /// Walks up from this node to the most distant correct parent for a
    /// new clone of `range`: through nodes fully transparent for the
    /// range, stopping at the first node owning content in it, at the
    /// first non-hidden candidate when `parent_must_be_hidden`, or at the
    /// root. The final parent's own parent is returned locked so the tree
    /// above cannot change until the clone is linked.
    fn find_parent_and_range_for_clone(
        self: &Arc<Self>,
        inner: &CowPagesInner,
        offset: u64,
        size: u64,
        parent_must_be_hidden: bool,
    ) -> ParentAndRange {
        let mut parent = LockedPtr::none();
        let mut cur_offset = offset;
        let limit = size.min(inner.size.saturating_sub(offset));
        loop {
            let (next, next_offset) = {
                let level_inner = parent.locked_or(inner);
                let window = VmCowRange::new(cur_offset, limit.max(PAGE_SIZE));
                let mut owns_content = false;
                if limit > 0 {
                    level_inner.page_list.visit_range(window, |item| match item {
                        PlItem::Entry { entry, .. } if entry.is_content() => {
                            owns_content = true;
                            ControlFlow::Break(())
                        }
                        PlItem::Interval { .. } => {
                            owns_content = true;
                            ControlFlow::Break(())
                        }
                        _ => ControlFlow::Continue(()),
                    });
                }
                let can_pass = !owns_content
                    && level_inner.parent.is_some()
                    && cur_offset
                        .checked_add(limit)
                        .is_some_and(|end| end <= level_inner.parent_limit)
                    && level_inner
                        .parent
                        .as_ref()
                        .is_some_and(|candidate| candidate.is_hidden() || !parent_must_be_hidden);
                if !can_pass {
                    (None, 0)
                } else {
                    (level_inner.parent.clone(), level_inner.parent_offset)
                }
            };
            let Some(next) = next else {
                return ParentAndRange {
                    parent,
                    offset: cur_offset,
                    limit,
                };
            };
            cur_offset += next_offset;
            let next_locked = LockedPtr::lock(&next);
            parent = next_locked;
        }
    }

    /// Collects the clone-relative offsets at which the hierarchy holds
    /// pages or references visible from `parent` in `window`; these are
    /// the offsets a marker-tree clone marks with parent content.
    fn collect_visible_content_offsets(
        parent: &Arc<Self>,
        parent_inner: &CowPagesInner,
        window: VmCowRange,
    ) -> Vec<u64> {
        let mut offsets = Vec::new();
        let mut level = LockedPtr::none();
        // (range in level coords, level offset - clone offset) segments.
        let mut segments: Vec<(VmCowRange, u64)> = alloc::vec![(window, window.offset)];
        loop {
            let node = level.node_or(parent);
            let level_inner = level.locked_or(parent_inner);
            let markers = node.node_has_parent_content_markers();
            let mut up = Vec::new();
            for (segment, delta) in &segments {
                level_inner.page_list.visit_range(*segment, |item| {
                    match item {
                        PlItem::Entry { offset, entry } => {
                            if entry.is_page() || entry.is_reference() {
                                offsets.push(offset - delta);
                            } else if entry.is_parent_content() {
                                up.push((VmCowRange::new(offset, PAGE_SIZE), *delta));
                            }
                        }
                        PlItem::Gap { range } => {
                            if !markers {
                                up.push((range, *delta));
                            }
                        }
                        PlItem::Interval { .. } => {}
                    }
                    ControlFlow::Continue(())
                });
            }
            if up.is_empty() || level_inner.parent.is_none() {
                offsets.sort_unstable();
                return offsets;
            }
            let clip = VmCowRange::new(0, level_inner.parent_limit);
            let parent_offset = level_inner.parent_offset;
            let next = level_inner.parent.clone().unwrap();
            segments = up
                .into_iter()
                .filter_map(|(segment, delta)| {
                    let clipped = segment.intersect(clip);
                    if clipped.is_empty() {
                        None
                    } else {
                        Some((clipped.offset_by(parent_offset), delta + parent_offset))
                    }
                })
                .collect();
            if segments.is_empty() {
                offsets.sort_unstable();
                return offsets;
            }
            let next_locked = LockedPtr::lock(&next);
            level = next_locked;
        }
    }

    fn populate_parent_content_markers(
        list: &mut PageList,
        offsets: &[u64],
        clone_size: u64,
    ) -> Result<()> {
        for offset in offsets {
            if *offset >= clone_size {
                continue;
            }
            let (slot, _) = list.lookup_or_allocate(*offset, InsertIntervalPolicy::NoIntervals)?;
            if slot.is_empty() {
                *slot = VmPageOrMarker::ParentContent;
            }
        }
        Ok(())
    }

    fn clone_unidirectional_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        range: VmCowRange,
    ) -> Result<Arc<Self>> {
        let mut found =
            self.find_parent_and_range_for_clone(inner, range.offset, range.len, false);
        let parent_node = found.parent.node_or(self).clone();
        let lock_order = if parent_node.is_hidden() || parent_node.page_source().is_some() {
            locking::LOCK_ORDER_FIRST_ANON
        } else {
            parent_node.lock_order() - locking::LOCK_ORDER_DELTA
        };
        let (parent_skew, marker_tree) = {
            let parent_inner = found.parent.locked_or(inner);
            (parent_inner.page_list.skew(), self.tree_has_parent_content_markers())
        };
        let skew = (parent_skew + found.offset) % (PAGE_SIZE * PAGE_FAN_OUT);
        let mut child_list = PageList::with_skew(skew);
        if marker_tree {
            let window = VmCowRange::new(found.offset, found.limit);
            let offsets = {
                let parent_inner = found.parent.locked_or(inner);
                Self::collect_visible_content_offsets(&parent_node, parent_inner, window)
            };
            Self::populate_parent_content_markers(&mut child_list, &offsets, range.len)?;
        }
        let child = Self::new_node(
            self.options().inheritable(),
            self.pmm_alloc_flags,
            lock_order,
            range.len,
            None,
            self.root_source().cloned(),
            None,
            child_list,
        );
        {
            // The share counts of all hidden-owned content the clone can
            // now reach grow by one viewer.
            let parent_inner = found.parent.locked_or_mut(inner);
            hierarchy::increment_visible_shares_from(
                &parent_node,
                parent_inner,
                VmCowRange::new(found.offset, found.limit),
            );
        }
        let mut child_locked = LockedPtr::lock(&child);
        {
            let parent_inner = found.parent.locked_or_mut(inner);
            parent_node.add_child_locked(
                parent_inner,
                &child,
                child_locked.locked_mut(),
                found.offset,
                found.limit,
            );
        }
        child_locked.locked_mut().life_cycle = LifeCycle::Alive;
        Ok(child)
    }

    fn clone_bidirectional_locked(
        self: &Arc<Self>,
        inner: &mut CowPagesInner,
        range: VmCowRange,
        deferred: &mut DeferredOps,
    ) -> Result<Arc<Self>> {
        let size = inner.size;
        // Lock the old parent (if any) first: the hidden node takes over
        // this node's place under it.
        let old_parent = inner.parent.clone();
        let mut old_parent_locked = match &old_parent {
            Some(parent) => LockedPtr::lock(parent),
            None => LockedPtr::none(),
        };
        let hidden_order = match &old_parent {
            Some(parent) => parent.lock_order() - locking::LOCK_ORDER_DELTA,
            None => locking::LOCK_ORDER_ROOT,
        };
        let hidden = Self::new_node(
            VmCowPagesOptions::HIDDEN | self.options().inheritable(),
            self.pmm_alloc_flags,
            hidden_order,
            size,
            None,
            self.root_source().cloned(),
            None,
            PageList::with_skew(inner.page_list.skew()),
        );
        let mut hidden_locked = LockedPtr::lock(&hidden);
        let hidden_inner = hidden_locked.locked_mut();

        // Move this node's stored content into the hidden node. Parent
        // content placeholders are not content and belong back in this
        // node, and every moved page or reference leaves a placeholder in
        // its stead so this node keeps finding it. Share counts start at
        // the number of extra viewers: children of this node that could
        // already see the content through their own placeholders.
        let children = Self::children_locked(inner);
        let mut moved: Vec<u64> = Vec::new();
        let mut stray_markers: Vec<u64> = Vec::new();
        inner.page_list.merge_range_onto_and_clear(
            VmCowRange::new(0, size),
            &mut hidden_inner.page_list,
            0,
            |offset, entry| {
                if let VmPageOrMarker::Page(page) = entry {
                    page.set_backlink(&hidden, offset);
                    page.set_share_count(0);
                }
                if entry.is_page() || entry.is_reference() {
                    moved.push(offset);
                } else if entry.is_parent_content() {
                    stray_markers.push(offset);
                }
            },
            |entry| debug_assert!(entry.is_empty(), "unexpected displaced entry {entry:?}"),
        );
        for offset in &stray_markers {
            let entry = hidden_inner.page_list.remove_content(*offset);
            debug_assert!(entry.is_parent_content());
        }
        for offset in moved.iter().chain(stray_markers.iter()) {
            // Restore what this node can see: its old content, now in the
            // hidden node, and whatever its placeholders already tracked.
            let (slot, _) = inner
                .page_list
                .lookup_or_allocate(*offset, InsertIntervalPolicy::NoIntervals)?;
            debug_assert!(slot.is_empty());
            *slot = VmPageOrMarker::ParentContent;
        }
        for offset in &moved {
            // Account for pre-existing children that view this offset.
            let mut extra = 0u32;
            for child in &children {
                let child_inner = child.inner.lock();
                if *offset >= child_inner.parent_offset
                    && *offset - child_inner.parent_offset < child_inner.parent_limit
                    && child_inner
                        .page_list
                        .lookup(*offset - child_inner.parent_offset)
                        .is_some_and(|entry| entry.is_parent_content())
                {
                    extra += 1;
                }
            }
            if extra > 0
                && let Some(page) = hidden_inner
                    .page_list
                    .lookup(*offset)
                    .and_then(|entry| entry.page())
            {
                page.set_share_count(extra);
            }
        }

        // Interpose the hidden node between this node and its old parent,
        // then let go of the old parent: the share count and marker walks
        // below need to lock the chain above the hidden node themselves.
        hidden_inner.parent = old_parent.clone();
        hidden_inner.parent_offset = inner.parent_offset;
        hidden_inner.parent_limit = inner.parent_limit;
        hidden_inner.root_parent_offset = inner.root_parent_offset;
        hidden_inner.high_priority_count = if inner.high_priority_count > 0 { 1 } else { 0 };
        hidden_inner.life_cycle = LifeCycle::Alive;
        if old_parent.is_some() {
            Self::replace_child_locked(old_parent_locked.locked_mut(), self, &hidden);
        }
        drop(old_parent_locked);
        inner.parent = Some(hidden.clone());
        inner.parent_offset = 0;
        inner.parent_limit = size;
        hidden_inner.children.push(Arc::downgrade(self));

        // Create the actual clone under the hidden node.
        let clone_skew = (hidden_inner.page_list.skew() + range.offset)
            % (PAGE_SIZE * PAGE_FAN_OUT);
        let mut clone_list = PageList::with_skew(clone_skew);
        let window = VmCowRange::new(range.offset, range.len.min(size.saturating_sub(range.offset)));
        let offsets = Self::collect_visible_content_offsets(&hidden, hidden_inner, window);
        Self::populate_parent_content_markers(&mut clone_list, &offsets, range.len)?;
        let clone = Self::new_node(
            self.options().inheritable(),
            self.pmm_alloc_flags,
            locking::LOCK_ORDER_FIRST_ANON,
            range.len,
            None,
            self.root_source().cloned(),
            None,
            clone_list,
        );
        // One more viewer for everything the clone can see.
        hierarchy::increment_visible_shares_from(&hidden, hidden_inner, window);
        let mut clone_locked = LockedPtr::lock(&clone);
        hidden.add_child_locked(
            hidden_inner,
            &clone,
            clone_locked.locked_mut(),
            range.offset,
            window.len,
        );
        clone_locked.locked_mut().life_cycle = LifeCycle::Alive;

        // The origin's content is now copy-on-write; strip write access.
        self.range_change_update_locked(
            inner,
            VmCowRange::new(0, size),
            RangeChangeOp::RemoveWrite,
            Some(deferred),
        );
        Ok(clone)
    }
}
