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

//! Recursive `get_peers` lookup.
//!
//! A search keeps the closest contacts seen so far ordered by XOR
//! distance to the target, queries them with bounded parallelism and
//! folds returned nodes back into the candidate set. Contacts already
//! queried are remembered in a bloom filter so a contact reported by
//! several remotes is asked once. The search retires when the closest
//! candidates have all been asked, or at its deadline.

use crate::bloom::Bloom;
use crate::config::K;
use crate::id::{distance, Distance, InfoHash, NodeId};
use crate::krpc::NodeInfo;
use smallvec::SmallVec;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Bounded work queue: candidates beyond this are dropped, farthest
/// first.
const CANDIDATES_MAX: usize = 4 * K;
const FOUND_MAX: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchId(pub u32);

fn contact_key(addr: &SocketAddr) -> SmallVec<[u8; 18]> {
    let mut key: SmallVec<[u8; 18]> = match addr.ip() {
        IpAddr::V4(ip) => SmallVec::from_slice(&ip.octets()),
        IpAddr::V6(ip) => SmallVec::from_slice(&ip.octets()),
    };
    key.extend_from_slice(&addr.port().to_be_bytes());
    key
}

struct Candidate {
    dist: Distance,
    id: NodeId,
    addr: SocketAddr,
    queried: bool,
}

pub struct Search {
    id: SearchId,
    target: InfoHash,
    candidates: Vec<Candidate>,
    queried: Bloom,
    outstanding: usize,
    deadline: Instant,
    found: Vec<SocketAddr>,
}

impl Search {
    fn new(id: SearchId, target: InfoHash, deadline: Instant) -> Search {
        Search {
            id,
            target,
            candidates: Vec::new(),
            queried: Bloom::new(),
            outstanding: 0,
            deadline,
            found: Vec::new(),
        }
    }

    pub fn id(&self) -> SearchId {
        self.id
    }

    pub fn target(&self) -> &InfoHash {
        &self.target
    }

    pub fn found(&self) -> &[SocketAddr] {
        &self.found
    }

    pub fn into_found(self) -> Vec<SocketAddr> {
        self.found
    }

    /// Fold contacts into the candidate set, keeping it sorted by
    /// distance and bounded.
    pub fn add_candidates(&mut self, nodes: &[NodeInfo]) {
        for node in nodes {
            if node.id.is_zero() || self.queried.contains(&contact_key(&node.addr)) {
                continue;
            }
            if self.candidates.iter().any(|c| c.id == node.id) {
                continue;
            }
            self.candidates.push(Candidate {
                dist: distance(self.target.as_bytes(), node.id.as_bytes()),
                id: node.id,
                addr: node.addr,
                queried: false,
            });
        }
        self.candidates.sort_by(|a, b| a.dist.cmp(&b.dist));
        self.candidates.truncate(CANDIDATES_MAX);
    }

    /// The closest un-queried candidate, if parallelism allows another
    /// outstanding query. Marks it queried.
    pub fn next_contact(&mut self, alpha: usize) -> Option<(NodeId, SocketAddr)> {
        if self.outstanding >= alpha {
            return None;
        }
        let candidate = self.candidates.iter_mut().find(|c| !c.queried)?;
        candidate.queried = true;
        self.outstanding += 1;
        self.queried.insert(&contact_key(&candidate.addr));
        Some((candidate.id, candidate.addr))
    }

    pub fn on_response(&mut self, nodes: &[NodeInfo], values: &[SocketAddr]) {
        self.outstanding = self.outstanding.saturating_sub(1);
        for value in values {
            if self.found.len() >= FOUND_MAX {
                break;
            }
            if !self.found.contains(value) {
                self.found.push(*value);
            }
        }
        self.add_candidates(nodes);
    }

    /// A queried contact answered with an error or timed out.
    pub fn on_failure(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Retired when the deadline passed, or when nothing is in flight
    /// and the K closest candidates have all been asked.
    pub fn is_done(&self, now: Instant) -> bool {
        if now >= self.deadline {
            return true;
        }
        self.outstanding == 0 && self.candidates.iter().take(K).all(|c| c.queried)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Default)]
pub struct SearchPool {
    active: Vec<Search>,
    next: u32,
}

impl SearchPool {
    pub fn new() -> SearchPool {
        SearchPool::default()
    }

    pub fn start(&mut self, target: InfoHash, seeds: &[NodeInfo], deadline: Instant) -> SearchId {
        let id = SearchId(self.next);
        self.next = self.next.wrapping_add(1);
        let mut search = Search::new(id, target, deadline);
        search.add_candidates(seeds);
        self.active.push(search);
        id
    }

    pub fn get_mut(&mut self, id: SearchId) -> Option<&mut Search> {
        self.active.iter_mut().find(|s| s.id == id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Search> {
        self.active.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Remove and return every search that has retired.
    pub fn retire(&mut self, now: Instant) -> Vec<Search> {
        let mut done = Vec::new();
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].is_done(now) {
                done.push(self.active.swap_remove(i));
            } else {
                i += 1;
            }
        }
        done
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.iter().map(|s| s.deadline).min()
    }
}
