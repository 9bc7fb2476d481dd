// Copyright 2021 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! The routing table.
//!
//! A chain of levels along the path from the root that corresponds to
//! the node's own id. Level at depth `d` holds contacts whose ids
//! share exactly `d` leading bits with the own id (they diverge at
//! bit `d`); only the deepest level holds the remainder and may split
//! further. The chain is a bounded window: when it is full and a
//! split needs a deeper level, the shallowest level is evicted and
//! its contacts retired.
//!
//! Contacts are owned by an arena; buckets and the timeout wheel hold
//! slot ids, so a split never invalidates wheel links.

use crate::arena::{Arena, SlotId};
use crate::config::K;
use crate::id::{bit, distance, rank, Distance, Key, NodeId};
use crate::store::Token;
use crate::timeout::{Links, Timed, Wheel};
use arrayvec::ArrayVec;
use log::trace;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::iter;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A routing-table contact.
///
/// Valid iff the id is non-zero and the port is non-zero; `insert`
/// refuses anything else. Good is the default; a contact turns bad
/// when pings go unanswered for too long and is the first candidate
/// for replacement.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_request_sent: Instant,
    pub last_response: Instant,
    pub last_activity: Instant,
    pub outstanding_pings: u8,
    pub good: bool,
    /// Token this remote handed us in its last `get_peers` reply; what
    /// we must echo to announce to it.
    pub announce_token: Option<Token>,
    links: Links,
}

impl Node {
    fn new(id: NodeId, addr: SocketAddr, now: Instant) -> Node {
        Node {
            id,
            addr,
            last_request_sent: now,
            last_response: now,
            last_activity: now,
            outstanding_pings: 0,
            good: true,
            announce_token: None,
            links: Links::default(),
        }
    }
}

impl Timed for Node {
    fn links(&self) -> &Links {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
    fn stamp(&self) -> Instant {
        self.last_request_sent
    }
}

struct Bucket {
    slots: ArrayVec<[SlotId; K]>,
}

impl Bucket {
    fn new() -> Bucket {
        Bucket {
            slots: ArrayVec::new(),
        }
    }
}

struct Level {
    depth: usize,
    buckets: Vec<Bucket>,
}

/// Outcome of [`RoutingTable::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    /// The id is already present; nothing changed.
    Existing,
    /// No slot, no evictable contact, no further split possible.
    Full,
    /// Zero id, own id or zero port.
    Invalid,
}

fn pack(slots: Vec<SlotId>) -> Vec<Bucket> {
    let mut buckets = Vec::with_capacity(slots.len() / K + 1);
    let mut current = Bucket::new();
    for slot in slots {
        if current.slots.is_full() {
            buckets.push(current);
            current = Bucket::new();
        }
        current.slots.push(slot);
    }
    buckets.push(current);
    buckets
}

pub struct RoutingTable {
    own_id: NodeId,
    levels: VecDeque<Level>,
    root_limit: usize,
    nodes: Arena<Node>,
    wheel: Wheel,
    bad_nodes: usize,
    retired: Vec<SocketAddr>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId, root_limit: usize) -> RoutingTable {
        let root_limit = root_limit.max(1);
        let mut levels = VecDeque::with_capacity(root_limit);
        levels.push_back(Level {
            depth: 0,
            buckets: vec![Bucket::new()],
        });
        RoutingTable {
            own_id,
            levels,
            root_limit,
            nodes: Arena::new(root_limit * K * 2),
            wheel: Wheel::new(),
            bad_nodes: 0,
            retired: Vec::new(),
        }
    }

    pub fn own_id(&self) -> &NodeId {
        &self.own_id
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn bad_nodes(&self) -> usize {
        self.bad_nodes
    }

    pub fn good_nodes(&self) -> usize {
        self.nodes.len() - self.bad_nodes
    }

    /// Index of the level covering `key`: the level where the key's
    /// prefix diverges from the own id, clamped to the deepest. `None`
    /// when the window has slid past the key's rank.
    fn level_index(&self, key: &Key) -> Option<usize> {
        let base = self.levels.front().expect("levels never empty").depth;
        let r = rank(self.own_id.as_bytes(), key);
        if r < base {
            return None;
        }
        Some((r - base).min(self.levels.len() - 1))
    }

    fn find_slot(&self, id: &NodeId) -> Option<SlotId> {
        let li = self.level_index(id.as_bytes())?;
        self.levels[li]
            .buckets
            .iter()
            .flat_map(|b| b.slots.iter())
            .copied()
            .find(|slot| {
                self.nodes
                    .get(*slot)
                    .map_or(false, |n| n.id == *id)
            })
    }

    pub fn find(&self, id: &NodeId) -> Option<&Node> {
        self.find_slot(id)
            .map(|slot| self.nodes.get(slot).expect("found slot is live"))
    }

    /// Refresh a known contact on inbound traffic; clears the bad flag
    /// and, for responses, the outstanding-ping counter.
    pub fn touch(&mut self, id: &NodeId, now: Instant, response: bool) -> bool {
        let slot = match self.find_slot(id) {
            Some(slot) => slot,
            None => return false,
        };
        let node = self.nodes.get_mut(slot).expect("found slot is live");
        node.last_activity = now;
        if response {
            node.last_response = now;
            node.outstanding_pings = 0;
        }
        if !node.good {
            node.good = true;
            self.bad_nodes -= 1;
        }
        true
    }

    pub fn set_announce_token(&mut self, id: &NodeId, token: Token) {
        if let Some(slot) = self.find_slot(id) {
            self.nodes.get_mut(slot).expect("found slot is live").announce_token = Some(token);
        }
    }

    pub fn insert(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> Insert {
        if id.is_zero() || id == self.own_id || addr.port() == 0 {
            return Insert::Invalid;
        }
        if self.find_slot(&id).is_some() {
            return Insert::Existing;
        }
        loop {
            let li = match self.level_index(id.as_bytes()) {
                Some(li) => li,
                None => return Insert::Full,
            };
            if let Some(slot) = self.place(li, &id, &addr, now) {
                self.wheel.append(&mut self.nodes, slot);
                trace!("routing: inserted {} depth {}", id, self.levels[li].depth);
                return Insert::Inserted;
            }
            if li != self.levels.len() - 1 {
                return Insert::Full;
            }
            // deepest level is out of room: split it, evicting the
            // shallowest level first when the window is at its limit
            if self.levels.len() == self.root_limit {
                if self.levels.len() == 1 {
                    return Insert::Full;
                }
                self.evict_shallowest();
                continue;
            }
            let depth = self.levels.back().expect("levels never empty").depth;
            if depth + 1 >= 160 {
                return Insert::Full;
            }
            self.split();
        }
    }

    /// Try to place in any bucket of the level: an empty slot first,
    /// failing that a slot holding a contact that is not good.
    fn place(&mut self, li: usize, id: &NodeId, addr: &SocketAddr, now: Instant) -> Option<SlotId> {
        let mut empty: Option<usize> = None;
        let mut evictable: Option<(usize, usize)> = None;
        for (bi, bucket) in self.levels[li].buckets.iter().enumerate() {
            if empty.is_none() && !bucket.slots.is_full() {
                empty = Some(bi);
                break;
            }
            if evictable.is_none() {
                for (si, slot) in bucket.slots.iter().enumerate() {
                    let node = self.nodes.get(*slot).expect("bucket slots are live");
                    if !node.good {
                        evictable = Some((bi, si));
                        break;
                    }
                }
            }
        }

        if let Some(bi) = empty {
            let slot = self.nodes.insert(Node::new(*id, *addr, now))?;
            self.levels[li].buckets[bi].slots.push(slot);
            return Some(slot);
        }
        if let Some((bi, si)) = evictable {
            let old = self.levels[li].buckets[bi].slots[si];
            let evicted = self.evict_slot(old);
            trace!("routing: replaced bad {}", evicted.id);
            let slot = self
                .nodes
                .insert(Node::new(*id, *addr, now))
                .expect("slot was just freed");
            self.levels[li].buckets[bi].slots[si] = slot;
            return Some(slot);
        }
        None
    }

    fn evict_slot(&mut self, slot: SlotId) -> Node {
        self.wheel.unlink(&mut self.nodes, slot);
        let node = self.nodes.remove(slot).expect("evicted slot is live");
        if !node.good {
            self.bad_nodes -= 1;
        }
        node
    }

    /// Split the deepest level along its depth bit: contacts whose bit
    /// matches the own id move one level deeper, the rest stay as this
    /// level's bucket chain. Arena ids are stable, so wheel links
    /// survive the move.
    fn split(&mut self) {
        let li = self.levels.len() - 1;
        let depth = self.levels[li].depth;
        let own = bit(self.own_id.as_bytes(), depth);
        let mut stay = Vec::new();
        let mut movers = Vec::new();
        for bucket in &self.levels[li].buckets {
            for &slot in &bucket.slots {
                let node = self.nodes.get(slot).expect("bucket slots are live");
                if node.id.bit(depth) == own {
                    movers.push(slot);
                } else {
                    stay.push(slot);
                }
            }
        }
        trace!(
            "routing: split depth {} stay {} move {}",
            depth,
            stay.len(),
            movers.len()
        );
        self.levels[li].buckets = pack(stay);
        self.levels.push_back(Level {
            depth: depth + 1,
            buckets: pack(movers),
        });
    }

    /// Drop the level farthest from the own id; its contacts are
    /// retired and can be fetched with [`take_retired`] for reuse as
    /// bootstrap material.
    ///
    /// [`take_retired`]: RoutingTable::take_retired
    fn evict_shallowest(&mut self) {
        let level = self.levels.pop_front().expect("levels never empty");
        trace!("routing: evicting level depth {}", level.depth);
        for bucket in level.buckets {
            for slot in bucket.slots {
                let node = self.evict_slot(slot);
                self.retired.push(node.addr);
            }
        }
    }

    pub fn take_retired(&mut self) -> Vec<SocketAddr> {
        std::mem::take(&mut self.retired)
    }

    /// The up-to-`k` good contacts closest to `target` by XOR
    /// distance, closest first.
    pub fn closest(&self, target: &Key, k: usize) -> SmallVec<[(NodeId, SocketAddr); K]> {
        let mut gathered: Vec<(Distance, NodeId, SocketAddr)> = Vec::new();
        let len = self.levels.len();
        let start = self.level_index(target).unwrap_or(0);

        let mut collect = |li: usize, gathered: &mut Vec<(Distance, NodeId, SocketAddr)>| {
            for bucket in &self.levels[li].buckets {
                for &slot in &bucket.slots {
                    let node = self.nodes.get(slot).expect("bucket slots are live");
                    if node.good {
                        gathered.push((distance(target, node.id.as_bytes()), node.id, node.addr));
                    }
                }
            }
        };

        // the level where the target diverges holds the closest
        // contacts; deeper levels all tie at that bit, shallower ones
        // are strictly farther
        for li in iter::once(start).chain(start + 1..len) {
            collect(li, &mut gathered);
        }
        if gathered.len() < k {
            for li in (0..start).rev() {
                collect(li, &mut gathered);
                if gathered.len() >= k {
                    break;
                }
            }
        }

        gathered.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        gathered
            .into_iter()
            .take(k)
            .map(|(_, id, addr)| (id, addr))
            .collect()
    }

    /// Pop contacts whose last send is older than `delta`, oldest
    /// first. The caller pings and requeues them.
    pub fn take_expired(
        &mut self,
        now: Instant,
        delta: Duration,
        max: usize,
    ) -> SmallVec<[SlotId; 8]> {
        self.wheel.take_expired(&mut self.nodes, now, delta, max)
    }

    pub fn node(&self, slot: SlotId) -> Option<&Node> {
        self.nodes.get(slot)
    }

    pub fn node_mut(&mut self, slot: SlotId) -> Option<&mut Node> {
        self.nodes.get_mut(slot)
    }

    pub fn mark_bad(&mut self, slot: SlotId) {
        if let Some(node) = self.nodes.get_mut(slot) {
            if node.good {
                node.good = false;
                self.bad_nodes += 1;
            }
        }
    }

    /// Requeue at the tail after a send.
    pub fn requeue(&mut self, slot: SlotId) {
        self.wheel.append(&mut self.nodes, slot);
    }

    /// Requeue at the head; used when sending failed and the contact
    /// should be retried first.
    pub fn requeue_front(&mut self, slot: SlotId) {
        self.wheel.prepend(&mut self.nodes, slot);
    }

    /// Deadline at which the stalest contact wants a ping.
    pub fn next_deadline(&self, delta: Duration) -> Option<Instant> {
        self.wheel.next_deadline(&self.nodes, delta)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().map(|(_, node)| node)
    }

    /// Throw the table away and start over under a new own id; every
    /// contact address is handed back for the bootstrap list.
    pub fn reset(&mut self, own_id: NodeId) -> Vec<SocketAddr> {
        let contacts = self.iter().map(|n| n.addr).collect();
        *self = RoutingTable::new(own_id, self.root_limit);
        contacts
    }

    #[cfg(test)]
    fn level_shape(&self) -> Vec<(usize, Vec<NodeId>)> {
        self.levels
            .iter()
            .map(|level| {
                let ids = level
                    .buckets
                    .iter()
                    .flat_map(|b| b.slots.iter())
                    .map(|&s| self.nodes.get(s).expect("bucket slots are live").id)
                    .collect();
                (level.depth, ids)
            })
            .collect()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        use std::collections::HashSet;

        let base = self.levels.front().expect("levels never empty").depth;
        let mut seen = HashSet::new();
        let mut count = 0;
        for (idx, level) in self.levels.iter().enumerate() {
            assert_eq!(level.depth, base + idx, "depths are consecutive");
            let deepest = idx == self.levels.len() - 1;
            for bucket in &level.buckets {
                assert!(bucket.slots.len() <= K, "bucket holds at most K");
                for &slot in &bucket.slots {
                    assert!(seen.insert(slot), "a contact appears once");
                    count += 1;
                    let node = self.nodes.get(slot).expect("bucket slots are live");
                    assert!(!node.id.is_zero() && node.addr.port() != 0);
                    let r = rank(self.own_id.as_bytes(), node.id.as_bytes());
                    assert!(r >= level.depth, "contact shares the level prefix");
                    if !deepest {
                        assert_eq!(r, level.depth, "away contact diverges at depth");
                    }
                }
            }
        }
        assert_eq!(count, self.nodes.len());
        let wheel: Vec<_> = self.wheel.ids(&self.nodes);
        assert_eq!(wheel.len(), count, "total equals wheel length");
        let unique: HashSet<_> = wheel.iter().collect();
        assert_eq!(unique.len(), count, "wheel holds each contact once");
        let bad = self.iter().filter(|n| !n.good).count();
        assert_eq!(bad, self.bad_nodes);
    }
}
