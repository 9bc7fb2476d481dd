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

//! Peer announcement database and announce-token mint.
//!
//! Infohash -> singly linked list of announcing peers, each peer also
//! threaded through a timeout wheel for aging. A peer expires when it
//! is old *and* the node has seen Internet traffic since the peer's
//! end of life; a node that was offline for an hour must not dump its
//! whole database on the first lookup after it comes back.
//!
//! Tokens authenticate `announce_peer` against an earlier `get_peers`
//! from the same remote: five random non-zero bytes, valid for a
//! bounded time, kept per remote contact.

use crate::arena::{Arena, SlotId};
use crate::config::Config;
use crate::id::InfoHash;
use crate::timeout::{Links, Timed, Wheel};
use fnv::FnvHashMap;
use log::trace;
use rand::Rng;
use smallvec::SmallVec;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Length of tokens this node mints.
pub const TOKEN_LEN: usize = 5;

const TOKEN_MAX_LEN: usize = 20;

/// An opaque announce token, at most 20 bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token {
    bytes: [u8; TOKEN_MAX_LEN],
    len: u8,
}

impl Token {
    pub fn from_bytes(bytes: &[u8]) -> Option<Token> {
        if bytes.is_empty() || bytes.len() > TOKEN_MAX_LEN {
            return None;
        }
        let mut out = [0u8; TOKEN_MAX_LEN];
        out[..bytes.len()].copy_from_slice(bytes);
        Some(Token {
            bytes: out,
            len: bytes.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(")?;
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

struct PeerEntry {
    addr: SocketAddr,
    last_activity: Instant,
    next: Option<SlotId>,
    key: InfoHash,
    links: Links,
}

impl Timed for PeerEntry {
    fn links(&self) -> &Links {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
    fn stamp(&self) -> Instant {
        self.last_activity
    }
}

pub struct PeerStore {
    records: FnvHashMap<InfoHash, SlotId>,
    peers: Arena<PeerEntry>,
    wheel: Wheel,
    tokens: FnvHashMap<SocketAddr, (Token, Instant)>,
    peer_age: Duration,
    token_lifetime: Duration,
    token_capacity: usize,
}

impl PeerStore {
    pub fn new(config: &Config) -> PeerStore {
        PeerStore {
            records: FnvHashMap::default(),
            peers: Arena::new(config.peer_capacity),
            wheel: Wheel::new(),
            tokens: FnvHashMap::default(),
            peer_age: config.peer_age_refresh,
            token_lifetime: config.token_lifetime,
            token_capacity: config.token_capacity,
        }
    }

    pub fn records(&self) -> usize {
        self.records.len()
    }

    pub fn peers(&self) -> usize {
        self.peers.len()
    }

    fn is_expired(
        &self,
        entry: &PeerEntry,
        now: Instant,
        node_last_activity: Option<Instant>,
    ) -> bool {
        let eol = entry.last_activity + self.peer_age;
        eol < now && node_last_activity.map_or(false, |last| last > eol)
    }

    fn unlink_from_chain(&mut self, slot: SlotId) {
        let (key, next) = {
            let entry = self.peers.get(slot).expect("chained peer is live");
            (entry.key, entry.next)
        };
        match self.records.get(&key).copied() {
            Some(head) if head == slot => match next {
                Some(n) => {
                    self.records.insert(key, n);
                }
                None => {
                    self.records.remove(&key);
                }
            },
            Some(head) => {
                let mut cur = head;
                loop {
                    match self.peers.get(cur).expect("chained peer is live").next {
                        Some(n) if n == slot => {
                            self.peers.get_mut(cur).expect("chained peer is live").next = next;
                            break;
                        }
                        Some(n) => cur = n,
                        None => break,
                    }
                }
            }
            None => {}
        }
    }

    fn remove_peer(&mut self, slot: SlotId) -> SocketAddr {
        self.unlink_from_chain(slot);
        self.wheel.unlink(&mut self.peers, slot);
        self.peers.remove(slot).expect("removed peer is live").addr
    }

    /// Record `addr` as announcing `infohash`: refresh an existing
    /// entry or prepend a new one. The oldest peer across all records
    /// is dropped when the pool is full.
    pub fn insert(&mut self, infohash: InfoHash, addr: SocketAddr, now: Instant) -> bool {
        if let Some(&head) = self.records.get(&infohash) {
            let mut cur = Some(head);
            while let Some(slot) = cur {
                let (entry_addr, next) = {
                    let entry = self.peers.get(slot).expect("chained peer is live");
                    (entry.addr, entry.next)
                };
                if entry_addr == addr {
                    self.peers.get_mut(slot).expect("chained peer is live").last_activity = now;
                    self.wheel.unlink(&mut self.peers, slot);
                    self.wheel.append(&mut self.peers, slot);
                    return true;
                }
                cur = next;
            }
        }

        if self.peers.len() >= self.peers.capacity() {
            match self.wheel.head() {
                Some(oldest) => {
                    let dropped = self.remove_peer(oldest);
                    trace!("peer db full, dropped oldest {}", dropped);
                }
                None => return false,
            }
        }

        let head = self.records.get(&infohash).copied();
        let slot = self
            .peers
            .insert(PeerEntry {
                addr,
                last_activity: now,
                next: head,
                key: infohash,
                links: Links::default(),
            })
            .expect("room was ensured above");
        self.records.insert(infohash, slot);
        self.wheel.append(&mut self.peers, slot);
        trace!("peer db: {} announces {}", addr, infohash);
        true
    }

    /// Peers announcing `infohash`, purging expired entries on the
    /// way. An emptied record is deallocated.
    pub fn lookup(
        &mut self,
        infohash: &InfoHash,
        now: Instant,
        node_last_activity: Option<Instant>,
    ) -> SmallVec<[SocketAddr; 8]> {
        let mut out = SmallVec::new();
        let head = match self.records.get(infohash) {
            Some(head) => *head,
            None => return out,
        };
        let mut chain = SmallVec::<[SlotId; 8]>::new();
        let mut cur = Some(head);
        while let Some(slot) = cur {
            chain.push(slot);
            cur = self.peers.get(slot).expect("chained peer is live").next;
        }
        for slot in chain {
            let (expired, addr) = {
                let entry = self.peers.get(slot).expect("chained peer is live");
                (self.is_expired(entry, now, node_last_activity), entry.addr)
            };
            if expired {
                self.remove_peer(slot);
            } else {
                out.push(addr);
            }
        }
        out
    }

    /// Expire peers from the wheel end; the scheduler's peer-db sweep.
    pub fn sweep(&mut self, now: Instant, node_last_activity: Option<Instant>) {
        loop {
            let head = match self.wheel.head() {
                Some(head) => head,
                None => break,
            };
            let expired = {
                let entry = self.peers.get(head).expect("wheel head is live");
                self.is_expired(entry, now, node_last_activity)
            };
            if !expired {
                break;
            }
            let addr = self.remove_peer(head);
            trace!("peer db: expired {}", addr);
        }
    }

    /// Deadline at which the oldest peer reaches end of life.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.wheel.next_deadline(&self.peers, self.peer_age)
    }

    /// Mint a token for `remote`: [`TOKEN_LEN`] random bytes, redrawn
    /// until non-zero.
    pub fn mint_token<R: Rng>(&mut self, remote: &SocketAddr, rng: &mut R, now: Instant) -> Token {
        let mut bytes = [0u8; TOKEN_LEN];
        loop {
            rng.fill(&mut bytes[..]);
            if bytes.iter().any(|b| *b != 0) {
                break;
            }
        }
        let token = Token::from_bytes(&bytes).expect("token length fits");

        if !self.tokens.contains_key(remote) && self.tokens.len() >= self.token_capacity {
            let lifetime = self.token_lifetime;
            self.tokens.retain(|_, (_, minted)| *minted + lifetime > now);
            if self.tokens.len() >= self.token_capacity {
                // still full of fresh tokens: drop the oldest mint
                let stalest = self
                    .tokens
                    .iter()
                    .min_by_key(|(_, (_, minted))| *minted)
                    .map(|(remote, _)| *remote);
                if let Some(stale) = stalest {
                    self.tokens.remove(&stale);
                }
            }
        }
        self.tokens.insert(*remote, (token, now));
        token
    }

    /// A token is valid iff non-zero, minted by this node for exactly
    /// this remote, and still fresh.
    pub fn valid_token(&self, remote: &SocketAddr, token: &[u8], now: Instant) -> bool {
        let candidate = match Token::from_bytes(token) {
            Some(t) if !t.is_zero() => t,
            _ => return false,
        };
        match self.tokens.get(remote) {
            Some((minted, at)) => *minted == candidate && *at + self.token_lifetime > now,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn config() -> Config {
        Config {
            peer_capacity: 8,
            ..Config::default()
        }
    }

    fn addr(d: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, d), port))
    }

    fn hash(b: u8) -> InfoHash {
        InfoHash([b; 20])
    }

    #[test]
    fn insert_then_lookup() {
        let mut store = PeerStore::new(&config());
        let now = Instant::now();
        assert!(store.insert(hash(1), addr(1, 6881), now));
        assert!(store.insert(hash(1), addr(2, 6881), now));
        assert!(store.insert(hash(2), addr(3, 6881), now));
        let peers = store.lookup(&hash(1), now, Some(now));
        assert_eq!(peers.len(), 2);
        assert!(peers.contains(&addr(1, 6881)));
        assert!(peers.contains(&addr(2, 6881)));
        assert_eq!(store.records(), 2);
    }

    #[test]
    fn reannounce_refreshes_instead_of_duplicating() {
        let mut store = PeerStore::new(&config());
        let now = Instant::now();
        store.insert(hash(1), addr(1, 6881), now);
        store.insert(hash(1), addr(1, 6881), now + Duration::from_secs(60));
        assert_eq!(store.peers(), 1);
    }

    #[test]
    fn peer_ages_out_when_node_saw_traffic() {
        let cfg = config();
        let mut store = PeerStore::new(&cfg);
        let t0 = Instant::now();
        store.insert(hash(1), addr(1, 6881), t0);
        let after = t0 + cfg.peer_age_refresh + Duration::from_millis(1);
        // node itself active past the peer's end of life
        let peers = store.lookup(&hash(1), after, Some(after));
        assert!(peers.is_empty());
        // the emptied record is gone
        assert_eq!(store.records(), 0);
        assert_eq!(store.peers(), 0);
    }

    #[test]
    fn offline_node_keeps_stale_peers() {
        let cfg = config();
        let mut store = PeerStore::new(&cfg);
        let t0 = Instant::now();
        store.insert(hash(1), addr(1, 6881), t0);
        let after = t0 + cfg.peer_age_refresh + Duration::from_millis(1);
        // last inbound datagram was before the peer's end of life:
        // the node may simply have been offline, keep the peer
        let peers = store.lookup(&hash(1), after, Some(t0));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn sweep_expires_oldest_first() {
        let cfg = config();
        let mut store = PeerStore::new(&cfg);
        let t0 = Instant::now();
        store.insert(hash(1), addr(1, 1), t0);
        store.insert(hash(1), addr(2, 2), t0 + Duration::from_secs(600));
        let mid = t0 + cfg.peer_age_refresh + Duration::from_secs(1);
        store.sweep(mid, Some(mid));
        let peers = store.lookup(&hash(1), mid, Some(mid));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0], addr(2, 2));
    }

    #[test]
    fn pool_overflow_drops_oldest() {
        let cfg = config(); // capacity 8
        let mut store = PeerStore::new(&cfg);
        let t0 = Instant::now();
        for i in 0..9u8 {
            store.insert(hash(1), addr(i + 1, 100), t0 + Duration::from_secs(u64::from(i)));
        }
        assert_eq!(store.peers(), 8);
        let peers = store.lookup(&hash(1), t0, Some(t0));
        assert!(!peers.contains(&addr(1, 100)), "oldest was dropped");
    }

    #[test]
    fn minted_token_is_five_nonzero_bytes() {
        let mut store = PeerStore::new(&config());
        let mut rng = SmallRng::seed_from_u64(7);
        let now = Instant::now();
        let token = store.mint_token(&addr(1, 6881), &mut rng, now);
        assert_eq!(token.as_bytes().len(), TOKEN_LEN);
        assert!(!token.is_zero());
    }

    #[test]
    fn token_binds_to_remote() {
        let mut store = PeerStore::new(&config());
        let mut rng = SmallRng::seed_from_u64(7);
        let now = Instant::now();
        let token = store.mint_token(&addr(1, 6881), &mut rng, now);
        assert!(store.valid_token(&addr(1, 6881), token.as_bytes(), now));
        assert!(!store.valid_token(&addr(2, 6881), token.as_bytes(), now));
        assert!(!store.valid_token(&addr(1, 6881), &[0, 0, 0, 0, 0], now));
    }

    #[test]
    fn token_expires_after_lifetime() {
        let cfg = config();
        let mut store = PeerStore::new(&cfg);
        let mut rng = SmallRng::seed_from_u64(7);
        let now = Instant::now();
        let token = store.mint_token(&addr(1, 6881), &mut rng, now);
        let later = now + cfg.token_lifetime + Duration::from_secs(1);
        assert!(!store.valid_token(&addr(1, 6881), token.as_bytes(), later));
    }

    #[test]
    fn full_token_table_drops_oldest_mint() {
        let cfg = Config {
            token_capacity: 3,
            ..Config::default()
        };
        let mut store = PeerStore::new(&cfg);
        let mut rng = SmallRng::seed_from_u64(7);
        let t0 = Instant::now();
        let ta = store.mint_token(&addr(1, 1), &mut rng, t0);
        let tb = store.mint_token(&addr(2, 2), &mut rng, t0 + Duration::from_secs(1));
        let tc = store.mint_token(&addr(3, 3), &mut rng, t0 + Duration::from_secs(2));
        // everyone is still fresh, so the fourth mint evicts the
        // oldest one rather than an arbitrary entry
        let now = t0 + Duration::from_secs(3);
        let td = store.mint_token(&addr(4, 4), &mut rng, now);
        assert!(!store.valid_token(&addr(1, 1), ta.as_bytes(), now));
        assert!(store.valid_token(&addr(2, 2), tb.as_bytes(), now));
        assert!(store.valid_token(&addr(3, 3), tc.as_bytes(), now));
        assert!(store.valid_token(&addr(4, 4), td.as_bytes(), now));
    }

    #[test]
    fn remint_replaces_previous_token() {
        let mut store = PeerStore::new(&config());
        let mut rng = SmallRng::seed_from_u64(7);
        let now = Instant::now();
        let first = store.mint_token(&addr(1, 6881), &mut rng, now);
        let second = store.mint_token(&addr(1, 6881), &mut rng, now);
        assert!(!store.valid_token(&addr(1, 6881), first.as_bytes(), now) || first == second);
        assert!(store.valid_token(&addr(1, 6881), second.as_bytes(), now));
    }
}
