//! Ordered index from `u64` keys to caller-owned payloads.
//!
//! Nodes live in a slot arena and refer to each other by 32-bit slot
//! offsets, with freed slots recycled through a free list. Slot 0 is the
//! head sentinel: key 0, no payload, a full-height tower.
//!
//! ```text
//!  level 2   head ──────────────────────────► 0x3000 ──────────► nil
//!  level 1   head ──────────► 0x2000 ───────► 0x3000 ──────────► nil
//!  level 0   head ─► 0x1000 ► 0x2000 ► 0x2800 ► 0x3000 ► 0x4000 ► nil
//! ```
//!
//! The list never looks inside a payload. It moves payloads in on
//! [`SkipList::insert`] and hands them back out on [`SkipList::remove`].

use std::fmt;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Tallest tower any node can get. With p = 1/2 search stays logarithmic up
/// to about 2^16 live entries.
pub const MAX_LEVEL: usize = 16;

/// Terminates a forward chain.
const NIL: u32 = u32::MAX;

const HEAD_SLOT: u32 = 0;

// =============================================================================
// Node handles
// =============================================================================

/// Handle to a node in a [`SkipList`].
///
/// A handle stays valid until the node it names is removed. After that the
/// slot may be reused by a later insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(u32);

impl NodeRef {
    /// The head sentinel. Predecessor searches return it when no key is small
    /// enough.
    pub const HEAD: NodeRef = NodeRef(HEAD_SLOT);

    #[inline]
    pub fn is_head(self) -> bool {
        self.0 == HEAD_SLOT
    }
}

struct Node<P> {
    key: u64,
    payload: Option<P>,
    /// One forward offset per level the node participates in.
    forward: SmallVec<[u32; 2]>,
}

// =============================================================================
// SkipList
// =============================================================================

/// A skip list keyed by `u64` with expected-logarithmic search, insert and
/// remove.
///
/// Keys must be unique. The list performs no locking; callers serialize
/// writers against readers themselves.
pub struct SkipList<P> {
    nodes: Vec<Node<P>>,
    /// Slots of removed nodes, reused before the arena grows.
    free: Vec<u32>,
    len: usize,
    rng: SmallRng,
}

impl<P> SkipList<P> {
    pub fn new() -> Self {
        Self::with_seed(42)
    }

    /// Create an empty list whose tower heights are drawn from a generator
    /// seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        let head = Node {
            key: 0,
            payload: None,
            forward: SmallVec::from_elem(NIL, MAX_LEVEL),
        };
        Self {
            nodes: vec![head],
            free: Vec::new(),
            len: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn next(&self, at: u32, level: usize) -> u32 {
        self.nodes[at as usize].forward[level]
    }

    #[inline]
    fn key_at(&self, at: u32) -> u64 {
        self.nodes[at as usize].key
    }

    /// Key stored in `node`. The head reports 0.
    #[inline]
    pub fn key(&self, node: NodeRef) -> u64 {
        self.key_at(node.0)
    }

    /// Payload stored in `node`, or `None` for the head.
    #[inline]
    pub fn payload(&self, node: NodeRef) -> Option<&P> {
        self.nodes[node.0 as usize].payload.as_ref()
    }

    /// Return the node with the greatest key `<= key`, or [`NodeRef::HEAD`]
    /// if every key is larger.
    pub fn search(&self, key: u64) -> NodeRef {
        let mut cur = HEAD_SLOT;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next = self.next(cur, level);
                if next != NIL && self.key_at(next) <= key {
                    cur = next;
                } else {
                    break;
                }
            }
        }
        NodeRef(cur)
    }

    pub fn contains_key(&self, key: u64) -> bool {
        let node = self.search(key);
        !node.is_head() && self.key(node) == key
    }

    /// For every level, the last node whose key is strictly below `key`.
    fn find_update(&self, key: u64) -> [u32; MAX_LEVEL] {
        let mut update = [HEAD_SLOT; MAX_LEVEL];
        let mut cur = HEAD_SLOT;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next = self.next(cur, level);
                if next != NIL && self.key_at(next) < key {
                    cur = next;
                } else {
                    break;
                }
            }
            update[level] = cur;
        }
        update
    }

    /// Geometric height draw with p = 1/2, capped at [`MAX_LEVEL`].
    fn random_level(&mut self) -> usize {
        let bits: u32 = self.rng.gen();
        (bits.trailing_ones() as usize + 1).min(MAX_LEVEL)
    }

    /// Link `payload` under `key`.
    ///
    /// The caller guarantees `key` is not already present. Debug builds
    /// assert this. Release builds link the new node directly ahead of the
    /// existing one, and predecessor searches then keep finding the older
    /// entry.
    ///
    /// Every allocation happens before any link is written, so on
    /// [`Error::OutOfMemory`] the list is unchanged and `payload` is dropped.
    pub fn insert(&mut self, key: u64, payload: P) -> Result<NodeRef> {
        debug_assert!(
            !self.contains_key(key),
            "duplicate skip list key {key:#x}"
        );

        let height = self.random_level();
        let mut forward: SmallVec<[u32; 2]> = SmallVec::new();
        forward
            .try_reserve_exact(height)
            .map_err(|_| Error::OutOfMemory {
                requested: height * std::mem::size_of::<u32>(),
            })?;
        if self.free.is_empty() {
            if self.nodes.len() >= NIL as usize {
                return Err(Error::OutOfMemory {
                    requested: std::mem::size_of::<Node<P>>(),
                });
            }
            self.nodes
                .try_reserve(1)
                .map_err(|_| Error::OutOfMemory {
                    requested: std::mem::size_of::<Node<P>>(),
                })?;
        }

        let update = self.find_update(key);
        for (level, &prev) in update.iter().enumerate().take(height) {
            forward.push(self.next(prev, level));
        }
        let node = Node {
            key,
            payload: Some(payload),
            forward,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        };
        for (level, &prev) in update.iter().enumerate().take(height) {
            self.nodes[prev as usize].forward[level] = slot;
        }

        self.len += 1;
        Ok(NodeRef(slot))
    }

    /// Unlink the node whose key is exactly `key` and hand its payload back.
    /// Returns `None` when the key is absent.
    pub fn remove(&mut self, key: u64) -> Option<P> {
        let update = self.find_update(key);
        let target = self.next(update[0], 0);
        if target == NIL || self.key_at(target) != key {
            return None;
        }

        let height = self.nodes[target as usize].forward.len();
        for (level, &start) in update.iter().enumerate().take(height) {
            // Only walks further than one step past equal keys.
            let mut prev = start;
            while self.next(prev, level) != target {
                prev = self.next(prev, level);
                debug_assert_ne!(prev, NIL, "node missing from level {level}");
            }
            let next = self.next(target, level);
            self.nodes[prev as usize].forward[level] = next;
        }

        let node = &mut self.nodes[target as usize];
        node.forward = SmallVec::new();
        let payload = node.payload.take();
        self.free.push(target);
        self.len -= 1;
        payload
    }

    /// Smallest key present, or 0 when the list is empty.
    pub fn firstkey(&self) -> u64 {
        match self.next(HEAD_SLOT, 0) {
            NIL => 0,
            first => self.key_at(first),
        }
    }

    /// Smallest key `>= key`, if any.
    pub fn first_at_or_after(&self, key: u64) -> Option<u64> {
        let update = self.find_update(key);
        match self.next(update[0], 0) {
            NIL => None,
            next => Some(self.key_at(next)),
        }
    }

    /// Remove the smallest entry.
    pub fn pop_first(&mut self) -> Option<(u64, P)> {
        let first = self.next(HEAD_SLOT, 0);
        if first == NIL {
            return None;
        }
        let key = self.key_at(first);
        self.remove(key).map(|payload| (key, payload))
    }

    pub fn iter(&self) -> Iter<'_, P> {
        Iter {
            list: self,
            cur: self.next(HEAD_SLOT, 0),
        }
    }
}

#[cfg(test)]
impl<P> SkipList<P> {
    /// Panic unless every level is a strictly increasing chain of live
    /// nodes and every slot is accounted for.
    pub(crate) fn check_invariants(&self) {
        let head = &self.nodes[HEAD_SLOT as usize];
        assert_eq!(head.key, 0, "head key must be 0");
        assert!(head.payload.is_none(), "head must not hold a payload");
        assert_eq!(head.forward.len(), MAX_LEVEL, "head must span every level");

        let mut level0 = 0usize;
        for level in 0..MAX_LEVEL {
            let mut prev_key: Option<u64> = None;
            let mut cur = self.next(HEAD_SLOT, level);
            while cur != NIL {
                let node = &self.nodes[cur as usize];
                assert!(
                    node.forward.len() > level,
                    "node reachable on level {level} but only {} tall",
                    node.forward.len()
                );
                assert!(node.payload.is_some(), "reachable node lost its payload");
                assert!(
                    !self.free.contains(&cur),
                    "free slot {cur} still linked on level {level}"
                );
                if let Some(prev) = prev_key {
                    assert!(prev < node.key, "keys must strictly increase on level {level}");
                }
                prev_key = Some(node.key);
                if level == 0 {
                    level0 += 1;
                }
                cur = node.forward[level];
            }
        }

        assert_eq!(level0, self.len, "level 0 must hold every live key");
        assert_eq!(
            self.nodes.len(),
            1 + self.len + self.free.len(),
            "every slot is head, live, or free"
        );
    }
}

impl<P> Default for SkipList<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: fmt::Debug> fmt::Debug for SkipList<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// In-order iterator over `(key, payload)` pairs.
pub struct Iter<'a, P> {
    list: &'a SkipList<P>,
    cur: u32,
}

impl<'a, P> Iterator for Iter<'a, P> {
    type Item = (u64, &'a P);

    fn next(&mut self) -> Option<Self::Item> {
        while self.cur != NIL {
            let node = &self.list.nodes[self.cur as usize];
            self.cur = node.forward[0];
            if let Some(payload) = node.payload.as_ref() {
                return Some((node.key, payload));
            }
        }
        None
    }
}
