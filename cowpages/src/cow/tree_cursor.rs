// SPDX-License-Identifier: MPL-2.0

//! A pre-order subtree walk that survives concurrent tree mutations.
//!
//! The cursor registers itself in the root's and the current node's
//! cursor lists. Structural operations (node death, hidden-node merge,
//! root removal) forward any registered cursors before the tree changes
//! under them. Between advances the cursor holds no node lock; each
//! advance acquires what it needs, verifies the tree did not move
//! underneath it, and retries when it did.

use alloc::sync::{Arc, Weak};

use spin::Mutex;

use super::locking::LockedPtr;
use super::{CowPagesInner, VmCowPages};

struct CursorPos {
    root: Option<Arc<VmCowPages>>,
    current: Option<Arc<VmCowPages>>,
    depth: usize,
    /// Set while walking back up; children of `current` are not entered.
    ascending: bool,
    /// Set by a fixup that moved `current` to a node the walk has not
    /// visited yet.
    revisit: bool,
    done: bool,
}

/// Shared cursor state, reachable from the nodes' registration lists.
pub(crate) struct TreeCursorState {
    pos: Mutex<CursorPos>,
}

impl TreeCursorState {
    fn lock(&self) -> spin::MutexGuard<'_, CursorPos> {
        self.pos.lock()
    }
}

fn register(list: &mut alloc::vec::Vec<Weak<TreeCursorState>>, state: &Arc<TreeCursorState>) {
    list.retain(|weak| weak.strong_count() > 0);
    list.push(Arc::downgrade(state));
}

fn unregister(list: &mut alloc::vec::Vec<Weak<TreeCursorState>>, state: &Arc<TreeCursorState>) {
    list.retain(|weak| {
        weak.strong_count() > 0 && !core::ptr::eq(weak.as_ptr(), Arc::as_ptr(state))
    });
}

/// A cooperating cursor for pre-order traversal of a subtree.
pub struct TreeWalkCursor {
    state: Arc<TreeCursorState>,
}

impl TreeWalkCursor {
    /// Creates a cursor rooted at `root`. The first
    /// [`TreeWalkCursor::next_locked`] call yields the root's first
    /// child.
    pub(crate) fn new(root: Arc<VmCowPages>) -> Self {
        let state = Arc::new(TreeCursorState {
            pos: Mutex::new(CursorPos {
                root: Some(root.clone()),
                current: Some(root.clone()),
                depth: 0,
                ascending: false,
                revisit: false,
                done: false,
            }),
        });
        {
            let mut locked = LockedPtr::lock(&root);
            let inner = locked.locked_mut();
            register(&mut inner.root_cursors, &state);
            register(&mut inner.cur_cursors, &state);
        }
        Self { state }
    }

    /// Requests that the subtree below the current node be skipped.
    pub fn skip_children(&mut self) {
        self.state.lock().ascending = true;
    }

    /// Advances to the next node in pre-order and returns it locked,
    /// together with its depth below the root. Returns `None` once the
    /// walk is complete.
    pub(crate) fn next_locked(&mut self) -> Option<(LockedPtr, usize)> {
        loop {
            let (current, depth, ascending, revisit, done) = {
                let pos = self.state.lock();
                (
                    pos.current.clone(),
                    pos.depth,
                    pos.ascending,
                    pos.revisit,
                    pos.done,
                )
            };
            if done {
                return None;
            }
            let current = current?;
            if revisit {
                let locked = LockedPtr::lock(&current);
                self.state.lock().revisit = false;
                return Some((locked, depth));
            }
            if !ascending {
                // Try to descend to the first child.
                let child = {
                    let mut locked = LockedPtr::lock(&current);
                    let inner = locked.locked_mut();
                    let child = VmCowPages::children_locked(inner).into_iter().next();
                    if let Some(child) = &child {
                        unregister(&mut inner.cur_cursors, &self.state);
                        let _ = child;
                    }
                    child
                };
                let Some(child) = child else {
                    self.state.lock().ascending = true;
                    continue;
                };
                let mut child_locked = LockedPtr::lock(&child);
                let still_child = child_locked
                    .locked()
                    .parent
                    .as_ref()
                    .is_some_and(|parent| Arc::ptr_eq(parent, &current));
                if !still_child {
                    // The tree moved; re-register at the current node and
                    // retry the whole step.
                    drop(child_locked);
                    let mut locked = LockedPtr::lock(&current);
                    register(&mut locked.locked_mut().cur_cursors, &self.state);
                    continue;
                }
                register(&mut child_locked.locked_mut().cur_cursors, &self.state);
                let mut pos = self.state.lock();
                pos.current = Some(child.clone());
                pos.depth = depth + 1;
                return Some((child_locked, depth + 1));
            }
            // Ascending: move to the next sibling, or further up.
            let mut locked = LockedPtr::lock(&current);
            let parent = locked.locked().parent.clone();
            let Some(parent) = parent else {
                // Back at (or fixed up onto) a root; the walk is over.
                let inner = locked.locked_mut();
                unregister(&mut inner.cur_cursors, &self.state);
                self.finish(inner);
                return None;
            };
            let mut parent_locked = LockedPtr::lock(&parent);
            let is_root = {
                let pos = self.state.lock();
                pos.root.as_ref().is_some_and(|root| Arc::ptr_eq(root, &current))
            };
            if is_root {
                let inner = locked.locked_mut();
                unregister(&mut inner.cur_cursors, &self.state);
                self.finish(inner);
                return None;
            }
            let sibling = {
                let children = VmCowPages::children_locked(parent_locked.locked());
                let pos = children
                    .iter()
                    .position(|child| Arc::ptr_eq(child, &current));
                pos.and_then(|pos| children.get(pos + 1).cloned())
            };
            unregister(&mut locked.locked_mut().cur_cursors, &self.state);
            drop(locked);
            match sibling {
                Some(sibling) => {
                    let mut sibling_locked = LockedPtr::lock(&sibling);
                    register(&mut sibling_locked.locked_mut().cur_cursors, &self.state);
                    drop(parent_locked);
                    let mut pos = self.state.lock();
                    pos.current = Some(sibling.clone());
                    pos.ascending = false;
                    drop(pos);
                    return Some((sibling_locked, depth));
                }
                None => {
                    register(&mut parent_locked.locked_mut().cur_cursors, &self.state);
                    let mut pos = self.state.lock();
                    pos.current = Some(parent.clone());
                    pos.depth = depth.saturating_sub(1);
                    pos.ascending = true;
                }
            }
        }
    }

    fn finish(&self, root_inner: &mut CowPagesInner) {
        unregister(&mut root_inner.root_cursors, &self.state);
        let mut pos = self.state.lock();
        pos.done = true;
        pos.current = None;
        pos.root = None;
    }
}

impl Drop for TreeWalkCursor {
    fn drop(&mut self) {
        let (root, current) = {
            let pos = self.state.lock();
            (pos.root.clone(), pos.current.clone())
        };
        if let Some(current) = current {
            let mut locked = LockedPtr::lock(&current);
            unregister(&mut locked.locked_mut().cur_cursors, &self.state);
        }
        if let Some(root) = root {
            let mut locked = LockedPtr::lock(&root);
            unregister(&mut locked.locked_mut().root_cursors, &self.state);
        }
    }
}

/// Forwards cursors off `node` as it is being unlinked from `parent`.
/// Cursors move to the node's next sibling when there is one (preferring
/// the locked `sibling` when it matches) and otherwise continue upwards
/// from the parent.
pub(crate) fn on_node_removed(
    node: &Arc<VmCowPages>,
    node_inner: &mut CowPagesInner,
    sibling: &mut LockedPtr,
    parent: &Arc<VmCowPages>,
    parent_inner: &mut CowPagesInner,
) {
    let cursors: alloc::vec::Vec<_> = node_inner
        .cur_cursors
        .drain(..)
        .filter_map(|weak| weak.upgrade())
        .collect();
    if cursors.is_empty() {
        // Cursors rooted here can only exist while the node also hosts
        // their current position; anything left in the root list belongs
        // to walks that must terminate now.
        for weak in node_inner.root_cursors.drain(..) {
            if let Some(state) = weak.upgrade() {
                let mut pos = state.lock();
                pos.done = true;
                pos.current = None;
                pos.root = None;
            }
        }
        return;
    }
    let next_sibling = {
        let children = VmCowPages::children_locked(parent_inner);
        let pos = children.iter().position(|child| Arc::ptr_eq(child, node));
        pos.and_then(|pos| children.get(pos + 1).cloned())
    };
    for state in cursors {
        let mut pos = state.lock();
        if pos.root.as_ref().is_some_and(|root| Arc::ptr_eq(root, node)) {
            pos.done = true;
            pos.current = None;
            pos.root = None;
            continue;
        }
        match (&next_sibling, sibling.get()) {
            (Some(next), Some(locked_sibling)) if Arc::ptr_eq(next, locked_sibling) => {
                pos.current = Some(next.clone());
                pos.ascending = false;
                pos.revisit = true;
                drop(pos);
                register(&mut sibling.locked_mut().cur_cursors, &state);
            }
            _ => {
                pos.current = Some(parent.clone());
                pos.depth = pos.depth.saturating_sub(1);
                pos.ascending = true;
                pos.revisit = false;
                drop(pos);
                register(&mut parent_inner.cur_cursors, &state);
            }
        }
    }
    node_inner.root_cursors.retain(|weak| {
        let Some(state) = weak.upgrade() else {
            return false;
        };
        let mut pos = state.lock();
        pos.done = true;
        pos.current = None;
        pos.root = None;
        false
    });
}

/// Forwards cursors off a hidden `node` whose content is merging into its
/// only remaining `child`.
pub(crate) fn on_node_merged(
    node: &Arc<VmCowPages>,
    node_inner: &mut CowPagesInner,
    child: &Arc<VmCowPages>,
    child_inner: &mut CowPagesInner,
) {
    let cursors: alloc::vec::Vec<_> = node_inner
        .cur_cursors
        .drain(..)
        .filter_map(|weak| weak.upgrade())
        .collect();
    for state in cursors {
        {
            let mut pos = state.lock();
            pos.current = Some(child.clone());
            // The child takes the merged node's place; a descending walk
            // has not visited it yet.
            if !pos.ascending {
                pos.revisit = true;
            }
        }
        register(&mut child_inner.cur_cursors, &state);
    }
    node_inner.root_cursors.retain(|weak| {
        let Some(state) = weak.upgrade() else {
            return false;
        };
        {
            let mut pos = state.lock();
            pos.root = Some(child.clone());
        }
        register(&mut child_inner.root_cursors, &state);
        false
    });
    let _ = node;
}

/// Terminates cursors on a parentless node that is dying.
pub(crate) fn on_root_death(node: &Arc<VmCowPages>, inner: &mut CowPagesInner) {
    let _ = node;
    for list in [&mut inner.cur_cursors, &mut inner.root_cursors] {
        for weak in list.drain(..) {
            if let Some(state) = weak.upgrade() {
                let mut pos = state.lock();
                pos.done = true;
                pos.current = None;
                pos.root = None;
            }
        }
    }
}
