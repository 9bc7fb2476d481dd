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

//! External-address election.
//!
//! Responses may carry an `ip` field reporting the address the remote
//! saw us at. Any single remote can lie, so the node adopts an
//! address only once enough distinct voters agree. A voter is keyed
//! by its IP through a bloom filter, so the same host cannot inflate
//! a candidate by voting from many ports.

use crate::bloom::Bloom;
use smallvec::SmallVec;
use std::net::{IpAddr, SocketAddr};

const CANDIDATES: usize = 16;

fn ip_key(ip: &IpAddr) -> SmallVec<[u8; 16]> {
    match ip {
        IpAddr::V4(v4) => SmallVec::from_slice(&v4.octets()),
        IpAddr::V6(v6) => SmallVec::from_slice(&v6.octets()),
    }
}

#[derive(Default)]
pub struct IpElection {
    table: SmallVec<[(SocketAddr, usize); CANDIDATES]>,
    voted: Bloom,
    /// Invocation count, votes suppressed by the filter included.
    votes: usize,
}

impl IpElection {
    pub fn new() -> IpElection {
        IpElection::default()
    }

    /// Count one vote by `by` for `candidate`. Returns false when the
    /// voter's IP has voted before or the candidate table is full.
    pub fn vote(&mut self, by: &SocketAddr, candidate: SocketAddr) -> bool {
        self.votes += 1;
        let key = ip_key(&by.ip());
        if self.voted.contains(&key) {
            return false;
        }
        self.voted.insert(&key);

        if let Some(entry) = self.table.iter_mut().find(|(c, _)| *c == candidate) {
            entry.1 += 1;
            return true;
        }
        if self.table.len() < CANDIDATES {
            self.table.push((candidate, 1));
            return true;
        }
        false
    }

    /// The leading candidate, provided it has at least `min` votes.
    /// Ties break by iteration order.
    pub fn winner(&self, min: usize) -> Option<SocketAddr> {
        self.table
            .iter()
            .max_by_key(|(_, count)| *count)
            .filter(|(_, count)| *count >= min)
            .map(|(candidate, _)| *candidate)
    }

    pub fn votes(&self) -> usize {
        self.votes
    }

    /// Forget everything; used after the winner has been adopted so a
    /// later address change can win a fresh election.
    pub fn reset(&mut self) {
        self.table.clear();
        self.voted.clear();
        self.votes = 0;
    }
}
