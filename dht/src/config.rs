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

use std::time::Duration;

/// Bucket capacity and replication factor for closest-node queries.
pub const K: usize = 8;

/// Tunables of the node. Every threshold the core consults lives
/// here; the defaults are what the daemon runs with.
#[derive(Debug, Clone)]
pub struct Config {
    /// A contact is pinged when it has not been sent anything for this
    /// long; a peer announcement ages out after it.
    pub refresh_interval: Duration,
    /// Lower bound on the deadline returned to the event loop, so a
    /// crowded timeout wheel cannot spin it hot.
    pub min_timeout_interval: Duration,
    /// Age after which an outgoing transaction is expired and its
    /// timeout continuation runs.
    pub transaction_timeout: Duration,
    /// Size of the transaction prefix pool.
    pub transaction_capacity: usize,
    /// A peer announcement is dropped once older than this, provided
    /// the node itself has seen Internet activity since.
    pub peer_age_refresh: Duration,
    /// Announce tokens outlive their `get_peers` by at most this.
    pub token_lifetime: Duration,
    /// Remotes with an outstanding token, at most.
    pub token_capacity: usize,
    /// Stored peer entries across all infohashes, at most.
    pub peer_capacity: usize,
    /// Maximum number of levels in the routing table.
    pub root_limit: usize,
    /// Outstanding pings after which a silent contact turns bad.
    pub max_outstanding_pings: u8,
    /// Routing-table fill percentage below which the discovery sweep
    /// issues `find_node` queries.
    pub percentage_seek: usize,
    /// Parallelism of a recursive search. Often called `alpha` in
    /// technical papers.
    pub alpha: usize,
    /// A recursive search gives up after this long.
    pub search_timeout: Duration,
    /// Votes required before an externally reported address wins the
    /// election.
    pub min_ip_votes: usize,
    /// Upper bound on the `values` list of a `get_peers` reply.
    pub max_peer_values: usize,
    /// Bootstrap contacts retained, at most.
    pub bootstrap_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            refresh_interval: Duration::from_secs(15 * 60),
            min_timeout_interval: Duration::from_secs(1),
            transaction_timeout: Duration::from_secs(10),
            transaction_capacity: 64,
            peer_age_refresh: Duration::from_secs(30 * 60),
            token_lifetime: Duration::from_secs(10 * 60),
            token_capacity: 512,
            peer_capacity: 4096,
            root_limit: 40,
            max_outstanding_pings: 2,
            percentage_seek: 80,
            alpha: 3,
            search_timeout: Duration::from_secs(60),
            min_ip_votes: 4,
            max_peer_values: 64,
            bootstrap_limit: 64,
        }
    }
}

impl Config {
    /// Contacts the routing table can hold when every level is
    /// allocated and full.
    pub fn max_routing_nodes(&self) -> usize {
        self.root_limit * K
    }
}
