// SPDX-License-Identifier: MPL-2.0

//! Lock ordering and scoped lock ownership for hierarchy walks.
//!
//! Every node carries an immutable `lock_order`. When multiple node locks
//! are held they are acquired in ascending order value, which places
//! descendants before ancestors:
//!
//! * A node with a page source is always the root and takes the top of the
//!   space, `LOCK_ORDER_ROOT`.
//! * The first anonymous node in a chain (a new anonymous root, a direct
//!   child of a sourced root, or a direct child of a hidden node) takes
//!   the reserved mid-range `LOCK_ORDER_FIRST_ANON`.
//! * Children of visible anonymous nodes take `parent - LOCK_ORDER_DELTA`,
//!   growing downwards.
//! * Hidden nodes take either `LOCK_ORDER_ROOT`, when they become a new
//!   root, or `parent - LOCK_ORDER_DELTA`.
//!
//! The delta leaves gaps so that the scheme never collides across hidden
//! insertion and unidirectional child growth, and so that newly
//! constructed, externally unreferenced nodes can be ordered at
//! `parent + 1` or `parent + 2` where no deadlock partner can exist yet.
//! During a dead transition the same gaps order a node's two children
//! relative to each other before their parent.

use alloc::sync::Arc;

use super::{CowPagesInner, VmCowPages};

pub(crate) const LOCK_ORDER_DELTA: u64 = 3;
pub(crate) const LOCK_ORDER_ROOT: u64 = u64::MAX - LOCK_ORDER_DELTA;
pub(crate) const LOCK_ORDER_FIRST_ANON: u64 = u64::MAX / 2;

/// Owns a node's lock for a scope without borrowing the node, so that
/// several nodes of a hierarchy can be held at once and passed around.
///
/// An empty `LockedPtr` stands for "the externally locked target" in walk
/// results; see [`LockedPtr::locked_or`].
pub(crate) struct LockedPtr {
    node: Option<(Arc<VmCowPages>, *mut CowPagesInner)>,
}

impl LockedPtr {
    pub fn none() -> Self {
        Self { node: None }
    }

    /// Locks `node` and takes ownership of the lock.
    pub fn lock(node: &Arc<VmCowPages>) -> Self {
        let guard = node.inner.lock();
        let ptr = spin::MutexGuard::leak(guard) as *mut CowPagesInner;
        Self {
            node: Some((node.clone(), ptr)),
        }
    }

    pub fn is_some(&self) -> bool {
        self.node.is_some()
    }

    pub fn get(&self) -> Option<&Arc<VmCowPages>> {
        self.node.as_ref().map(|(node, _)| node)
    }

    /// The locked node. Panics when empty.
    pub fn node(&self) -> &Arc<VmCowPages> {
        &self.node.as_ref().expect("empty LockedPtr").0
    }

    /// The node, falling back to `other` when empty.
    pub fn node_or<'a>(&'a self, other: &'a Arc<VmCowPages>) -> &'a Arc<VmCowPages> {
        match &self.node {
            Some((node, _)) => node,
            None => other,
        }
    }

    /// The locked state. Panics when empty.
    pub fn locked(&self) -> &CowPagesInner {
        let (_, ptr) = self.node.as_ref().expect("empty LockedPtr");
        // SAFETY: this object owns the lock and hands out references with
        // the aliasing of `&self`/`&mut self`.
        unsafe { &**ptr }
    }

    /// Mutable access to the locked state. Panics when empty.
    pub fn locked_mut(&mut self) -> &mut CowPagesInner {
        let (_, ptr) = self.node.as_ref().expect("empty LockedPtr");
        // SAFETY: as in `locked`, with exclusivity from `&mut self`.
        unsafe { &mut **ptr }
    }

    /// The locked state, falling back to `other` (the externally locked
    /// target) when empty.
    pub fn locked_or<'a>(&'a self, other: &'a CowPagesInner) -> &'a CowPagesInner {
        match &self.node {
            Some((_, ptr)) => {
                // SAFETY: as in `locked`.
                unsafe { &**ptr }
            }
            None => other,
        }
    }

    /// Mutable variant of [`LockedPtr::locked_or`].
    pub fn locked_or_mut<'a>(&'a mut self, other: &'a mut CowPagesInner) -> &'a mut CowPagesInner {
        match &self.node {
            Some((_, ptr)) => {
                // SAFETY: as in `locked_mut`.
                unsafe { &mut **ptr }
            }
            None => other,
        }
    }

    /// Unlocks and returns the node, leaving this pointer empty.
    pub fn release(&mut self) -> Option<Arc<VmCowPages>> {
        let (node, _) = self.node.take()?;
        // SAFETY: this object held the lock since `lock`.
        unsafe { node.inner.force_unlock() };
        Some(node)
    }
}

impl Drop for LockedPtr {
    fn drop(&mut self) {
        self.release();
    }
}
