// SPDX-License-Identifier: MPL-2.0

//! Hierarchy walks: owner resolution for an offset and share count
//! maintenance for content reachable through ancestors.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use crate::compression;
use crate::page_list::{PlItem, VmPageOrMarker};
use crate::range::VmCowRange;
use crate::PAGE_SIZE;

use super::locking::LockedPtr;
use super::{CowPagesInner, ScopedPageFreedList, VmCowPages};

/// The result of resolving an offset to the node owning its first visible
/// content.
///
/// When `owner` is empty the target itself is the relevant node, either
/// because it holds content at the offset or because no ancestor does and
/// the target must be queried or populated. `visible_end` is the target
/// offset up to which no node between the target and the owner holds any
/// content, bounding how far a cursor may step before re-resolving.
pub(crate) struct OwnedContentLookup {
    pub owner: LockedPtr,
    pub owner_offset: u64,
    pub visible_end: u64,
}

/// Walks up from `target` to find the first node with content for
/// `offset`. `max_owner_length` bounds the computed `visible_end` window
/// and must be at least one page.
pub(crate) fn find_page_content(
    target: &Arc<VmCowPages>,
    target_inner: &CowPagesInner,
    offset: u64,
    max_owner_length: u64,
) -> OwnedContentLookup {
    debug_assert!(max_owner_length >= PAGE_SIZE);
    let mut remaining = max_owner_length;
    let mut owner = LockedPtr::none();
    let mut owner_offset = offset;
    loop {
        let step = {
            let node = owner.node_or(target);
            let inner = owner.locked_or(target_inner);
            let entry = inner.page_list.lookup(owner_offset);
            let has_content = entry.is_some_and(|entry| entry.is_content())
                || inner.page_list.is_offset_in_zero_interval(owner_offset);
            if has_content {
                None
            } else {
                let can_see = if node.node_has_parent_content_markers() {
                    inner.can_see_parent(owner_offset)
                        && entry.is_some_and(|entry| entry.is_parent_content())
                } else {
                    inner.can_see_parent(owner_offset) && entry.is_none()
                };
                if !can_see {
                    None
                } else {
                    // Clip the visible window before leaving this level:
                    // content or markers further along this level occlude
                    // the deeper owner, as does the parent limit.
                    let mut level_window = inner.parent_limit - owner_offset;
                    if let Some(next) = inner.page_list.next_populated_offset(owner_offset + PAGE_SIZE)
                    {
                        level_window = level_window.min(next - owner_offset);
                    }
                    remaining = remaining.min(level_window.max(PAGE_SIZE));
                    Some((
                        inner.parent.clone().expect("can_see_parent implies parent"),
                        inner.parent_offset,
                    ))
                }
            }
        };
        let Some((parent, parent_offset)) = step else {
            return OwnedContentLookup {
                owner,
                owner_offset,
                visible_end: offset + remaining,
            };
        };
        owner_offset += parent_offset;
        let next = LockedPtr::lock(&parent);
        owner = next;
    }
}

/// Projects the gap subranges of one level into its parent's offsets,
/// clipped by the level's parent limit.
fn project_up(inner: &CowPagesInner, ranges: &[VmCowRange]) -> Vec<VmCowRange> {
    let window = VmCowRange::new(0, inner.parent_limit);
    ranges
        .iter()
        .filter_map(|range| {
            let clipped = range.intersect(window);
            if clipped.is_empty() {
                None
            } else {
                Some(clipped.offset_by(inner.parent_offset))
            }
        })
        .collect()
}

/// The subranges of `range` that `inner` resolves through its parent:
/// parent content markers for marker-tree leaves, plain gaps otherwise.
fn see_through_ranges(
    node: &Arc<VmCowPages>,
    inner: &CowPagesInner,
    range: VmCowRange,
) -> Vec<VmCowRange> {
    let mut ranges = Vec::new();
    let markers = node.node_has_parent_content_markers();
    inner.page_list.visit_range(range, |item| {
        match item {
            PlItem::Entry { offset, entry } if entry.is_parent_content() => {
                if markers {
                    ranges.push(VmCowRange::new(offset, PAGE_SIZE));
                }
            }
            PlItem::Gap { range } => {
                if !markers {
                    ranges.push(range);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    });
    ranges
}

/// What to do to first-visible ancestor content.
enum ShareOp<'a> {
    /// A new visible node can now reach the content.
    Increment,
    /// A visible node stopped reaching the content; content that loses its
    /// last extra viewer but is still owned stays in place, content whose
    /// sole viewer is going away is removed and freed.
    Release(&'a mut ScopedPageFreedList),
}

/// Walks the parent chain, applying `op` to the first visible content
/// entry of every offset that `start_ranges` (in the coordinates of
/// `start`, which must be the parent of the node the view originates
/// from) can reach.
fn walk_first_visible_content(
    start: Option<Arc<VmCowPages>>,
    mut ranges: Vec<VmCowRange>,
    mut op: ShareOp<'_>,
) {
    let mut cur = start;
    while let Some(level) = cur {
        if ranges.is_empty() {
            return;
        }
        let mut locked = LockedPtr::lock(&level);
        let counted = level.is_hidden();
        let inner = locked.locked_mut();
        let mut up = Vec::new();
        let mut removals = Vec::new();
        for range in &ranges {
            inner.page_list.visit_range(*range, |item| {
                match item {
                    PlItem::Entry { offset, entry } => match entry {
                        // Share counts only track content owned by hidden
                        // nodes; a visible owner's content simply stops
                        // the walk.
                        VmPageOrMarker::Page(page) => match &mut op {
                            ShareOp::Increment => {
                                if counted {
                                    page.increment_share_count();
                                }
                            }
                            ShareOp::Release(_) => {
                                if counted {
                                    if page.share_count() == 0 {
                                        removals.push(offset);
                                    } else {
                                        page.decrement_share_count();
                                    }
                                }
                            }
                        },
                        VmPageOrMarker::Reference(reference) => {
                            let compressor = compression::active_compressor();
                            match &mut op {
                                ShareOp::Increment => {
                                    if counted
                                        && let Some(compressor) = &compressor
                                    {
                                        let count = compressor.metadata(*reference);
                                        compressor.set_metadata(*reference, count + 1);
                                    }
                                }
                                ShareOp::Release(_) => {
                                    if counted {
                                        let count = compressor
                                            .as_ref()
                                            .map(|compressor| compressor.metadata(*reference))
                                            .unwrap_or(0);
                                        if count == 0 {
                                            removals.push(offset);
                                        } else if let Some(compressor) = &compressor {
                                            compressor.set_metadata(*reference, count - 1);
                                        }
                                    }
                                }
                            }
                        }
                        // Markers are shared freely and carry no count. A
                        // parent content placeholder in a visible chain
                        // node forwards the view further up.
                        VmPageOrMarker::ParentContent => {
                            up.push(VmCowRange::new(offset, PAGE_SIZE));
                        }
                        _ => {}
                    },
                    PlItem::Gap { range } => {
                        if !level.node_has_parent_content_markers() {
                            up.push(range);
                        }
                    }
                    // Zero intervals hold no shareable resources.
                    PlItem::Interval { .. } => {}
                }
                ControlFlow::Continue(())
            });
        }
        if let ShareOp::Release(freed) = &mut op {
            for offset in removals {
                let entry = inner.page_list.remove_content(offset);
                match entry {
                    VmPageOrMarker::Page(page) => {
                        crate::pmm::page_queues().remove(&page);
                        page.clear_backlink();
                        freed.append(page);
                    }
                    entry => freed.append_content(entry),
                }
            }
        } else {
            debug_assert!(removals.is_empty());
        }
        let next = inner.parent.clone();
        ranges = project_up(inner, &up);
        drop(locked);
        cur = next;
    }
}

/// Records that a new visible node begins to reach every piece of
/// ancestor content visible in `range` of `parent` (the clone's parent).
/// `parent_inner` must be locked by the caller; content owned by `parent`
/// itself is included.
pub(crate) fn increment_visible_shares_from(
    parent: &Arc<VmCowPages>,
    parent_inner: &mut CowPagesInner,
    range: VmCowRange,
) {
    let counted = parent.is_hidden();
    let mut up = Vec::new();
    parent_inner.page_list.visit_range(range, |item| {
        match item {
            PlItem::Entry { offset, entry } => match entry {
                VmPageOrMarker::Page(page) => {
                    if counted {
                        page.increment_share_count();
                    }
                }
                VmPageOrMarker::Reference(reference) => {
                    if counted
                        && let Some(compressor) = compression::active_compressor()
                    {
                        let count = compressor.metadata(*reference);
                        compressor.set_metadata(*reference, count + 1);
                    }
                }
                VmPageOrMarker::ParentContent => up.push(VmCowRange::new(offset, PAGE_SIZE)),
                _ => {}
            },
            PlItem::Gap { range } => {
                if !parent.node_has_parent_content_markers() {
                    up.push(range);
                }
            }
            PlItem::Interval { .. } => {}
        }
        ControlFlow::Continue(())
    });
    let start = parent_inner.parent.clone();
    let ranges = project_up(parent_inner, &up);
    walk_first_visible_content(start, ranges, ShareOp::Increment);
}

/// Drops `node`'s claim on all ancestor content it can reach in `range`.
/// Content whose only remaining viewer was `node` is removed from its
/// owner and staged on `freed`.
pub(crate) fn release_ancestor_views(
    node: &Arc<VmCowPages>,
    inner: &mut CowPagesInner,
    range: VmCowRange,
    freed: &mut ScopedPageFreedList,
) {
    if inner.parent.is_none() || inner.parent_limit == 0 {
        return;
    }
    let through = see_through_ranges(node, inner, range);
    let start = inner.parent.clone();
    let ranges = project_up(inner, &through);
    walk_first_visible_content(start, ranges, ShareOp::Release(freed));
}

/// Reduces the share count of `content` owned by a (hidden) ancestor
/// because one viewer is replacing its view with its own content. When
/// the count is already zero the content's sole viewer is taking it over
/// and it is removed from the owner and handed back.
pub(crate) fn take_or_share_owner_content(
    owner_inner: &mut CowPagesInner,
    owner_offset: u64,
) -> OwnerContentFate {
    let Some(entry) = owner_inner.page_list.lookup(owner_offset) else {
        return OwnerContentFate::Shared;
    };
    match entry {
        VmPageOrMarker::Page(page) => {
            if page.share_count() == 0 {
                let entry = owner_inner.page_list.remove_content(owner_offset);
                OwnerContentFate::Taken(entry)
            } else {
                page.decrement_share_count();
                OwnerContentFate::Shared
            }
        }
        VmPageOrMarker::Reference(reference) => {
            let compressor = compression::active_compressor();
            let count = compressor
                .as_ref()
                .map(|compressor| compressor.metadata(*reference))
                .unwrap_or(0);
            if count == 0 {
                let entry = owner_inner.page_list.remove_content(owner_offset);
                OwnerContentFate::Taken(entry)
            } else {
                if let Some(compressor) = &compressor {
                    compressor.set_metadata(*reference, count - 1);
                }
                OwnerContentFate::Shared
            }
        }
        _ => OwnerContentFate::Shared,
    }
}

/// Outcome of [`take_or_share_owner_content`].
pub(crate) enum OwnerContentFate {
    /// The content stays with the owner; its share count was reduced.
    Shared,
    /// The caller was the only viewer and now owns the content.
    Taken(VmPageOrMarker),
}
