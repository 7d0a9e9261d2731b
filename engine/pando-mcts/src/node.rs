//! Node identity, state flags, and the atomic primitives of the tree.
//!
//! Nodes are indices into structure-of-arrays storage owned by
//! [`crate::tree::SearchTree`]; this module holds the pieces shared across
//! the tree, pool, and worker code: the index newtype, the node flag
//! bitset, and a lock-free `f32` built on `AtomicU32` bit-casts.

use std::sync::atomic::{AtomicU32, Ordering};

/// Index into the node arrays. Using a newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NONE: NodeId = NodeId(u32::MAX);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    #[inline]
    pub fn is_some(self) -> bool {
        !self.is_none()
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Sentinel stored in a `child_node_idx` slot whose child is not
/// materialised (or has been pruned).
pub const NO_CHILD: u32 = u32::MAX;

/// Node lifecycle flags.
///
/// A node starts with no flags set. Exactly one worker wins the CAS from
/// empty to `EXPANDING`; that worker publishes the edges and replaces the
/// flags with `EXPANDED` (possibly `| TERMINAL` or `| PINNED`) in a single
/// release store, so `EXPANDING` is never observed together with
/// `EXPANDED`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u8);

impl NodeFlags {
    pub const EMPTY: NodeFlags = NodeFlags(0);
    /// Edges are published and visible.
    pub const EXPANDED: NodeFlags = NodeFlags(0x01);
    /// One worker holds the expansion lock.
    pub const EXPANDING: NodeFlags = NodeFlags(0x02);
    /// The game ends at this node; `child_count` is 0.
    pub const TERMINAL: NodeFlags = NodeFlags(0x04);
    /// Expansion was refused (pool exhausted); the node stays a dead end
    /// until the tree is rerooted.
    pub const PINNED: NodeFlags = NodeFlags(0x08);

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        NodeFlags(bits)
    }

    #[inline]
    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for NodeFlags {
    type Output = NodeFlags;

    #[inline]
    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for NodeFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = Vec::new();
        if self.contains(NodeFlags::EXPANDED) {
            names.push("EXPANDED");
        }
        if self.contains(NodeFlags::EXPANDING) {
            names.push("EXPANDING");
        }
        if self.contains(NodeFlags::TERMINAL) {
            names.push("TERMINAL");
        }
        if self.contains(NodeFlags::PINNED) {
            names.push("PINNED");
        }
        if names.is_empty() {
            write!(f, "EMPTY")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Thread-safe `f32` accumulator over an `AtomicU32` bit-cast.
///
/// `fetch_add` is a compare-exchange loop; the caller chooses the memory
/// order exactly as with the integer atomics.
pub struct AtomicF32 {
    bits: AtomicU32,
}

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.bits.load(order))
    }

    #[inline]
    pub fn store(&self, value: f32, order: Ordering) {
        self.bits.store(value.to_bits(), order);
    }

    #[inline]
    pub fn fetch_add(&self, value: f32, order: Ordering) -> f32 {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let new = (f32::from_bits(current) + value).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, new, order, Ordering::Relaxed)
            {
                Ok(_) => return f32::from_bits(current),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl std::fmt::Debug for AtomicF32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AtomicF32({})", self.load(Ordering::Relaxed))
    }
}
