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

//! Transaction registry.
//!
//! Every outgoing query carries a short transaction id the remote
//! echoes back. The registry correlates the eventual response with
//! the continuation minted alongside the query, and expires
//! transactions whose response never came. Ids are a 2-byte prefix
//! drawn from a bounded pool plus a random suffix; the prefix alone
//! routes the lookup, the full id is verified before consumption.

use crate::id::{InfoHash, NodeId};
use crate::query::SearchId;
use rand::Rng;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Maximum transaction id length accepted on the wire.
pub const TX_MAX_LEN: usize = 16;

const PREFIX_LEN: usize = 2;
const SUFFIX_LEN: usize = 2;

/// A wire transaction id, 1..=16 bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    bytes: [u8; TX_MAX_LEN],
    len: u8,
}

impl Transaction {
    pub fn from_bytes(bytes: &[u8]) -> Option<Transaction> {
        if bytes.is_empty() || bytes.len() > TX_MAX_LEN {
            return None;
        }
        let mut out = [0u8; TX_MAX_LEN];
        out[..bytes.len()].copy_from_slice(bytes);
        Some(Transaction {
            bytes: out,
            len: bytes.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    fn prefix(&self) -> Option<[u8; PREFIX_LEN]> {
        if (self.len as usize) < PREFIX_LEN {
            return None;
        }
        Some([self.bytes[0], self.bytes[1]])
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tx(")?;
        for b in self.as_bytes() {
            if b.is_ascii_graphic() {
                write!(f, "{}", *b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        write!(f, ")")
    }
}

/// Continuation for an outstanding query; dispatched once, either on
/// the matching response or on timeout.
#[derive(Debug, Clone)]
pub enum TxContext {
    Ping {
        id: NodeId,
    },
    FindNode {
        target: NodeId,
        remote: SocketAddr,
        /// Set when the query went to a bootstrap contact not yet in
        /// the routing table; a timeout puts it back on the list.
        bootstrap: bool,
    },
    GetPeers {
        infohash: InfoHash,
        search: SearchId,
        remote: SocketAddr,
    },
    AnnouncePeer {
        infohash: InfoHash,
    },
}

struct Pending {
    tx: Transaction,
    ctx: TxContext,
    minted_at: Instant,
}

/// An expired transaction handed back to the caller, which runs the
/// timeout continuation.
pub struct Expired {
    pub tx: Transaction,
    pub ctx: TxContext,
    pub minted_at: Instant,
}

pub struct Transactions {
    active: BTreeMap<[u8; PREFIX_LEN], Pending>,
    free: Vec<[u8; PREFIX_LEN]>,
    timeout: Duration,
}

impl Transactions {
    /// `capacity` distinct printable prefixes; at most 26 * 26.
    pub fn new(capacity: usize, timeout: Duration) -> Transactions {
        let capacity = capacity.min(26 * 26);
        let free = (0..capacity)
            .map(|i| [b'a' + (i / 26) as u8, b'a' + (i % 26) as u8])
            .collect();
        Transactions {
            active: BTreeMap::new(),
            free,
            timeout,
        }
    }

    /// Mint a fresh transaction carrying `ctx`. `None` when the pool
    /// is exhausted.
    pub fn mint<R: Rng>(&mut self, rng: &mut R, now: Instant, ctx: TxContext) -> Option<Transaction> {
        if self.free.is_empty() {
            return None;
        }
        let pick = rng.gen_range(0..self.free.len());
        let prefix = self.free.swap_remove(pick);

        let mut bytes = [0u8; TX_MAX_LEN];
        bytes[..PREFIX_LEN].copy_from_slice(&prefix);
        rng.fill(&mut bytes[PREFIX_LEN..PREFIX_LEN + SUFFIX_LEN]);
        let tx = Transaction {
            bytes,
            len: (PREFIX_LEN + SUFFIX_LEN) as u8,
        };
        let previous = self.active.insert(
            prefix,
            Pending {
                tx,
                ctx,
                minted_at: now,
            },
        );
        debug_assert!(previous.is_none());
        Some(tx)
    }

    /// Look up `tx`, verify the full id and remove it. A second
    /// consume of the same id returns `None`.
    pub fn consume(&mut self, tx: &Transaction) -> Option<TxContext> {
        let prefix = tx.prefix()?;
        match self.active.get(&prefix) {
            Some(pending) if pending.tx == *tx => {}
            _ => return None,
        }
        let pending = self.active.remove(&prefix).expect("entry probed above");
        self.free.push(prefix);
        Some(pending.ctx)
    }

    /// Remove every transaction older than the timeout and hand the
    /// stored continuations back for their `on_timeout` dispatch.
    pub fn expire(&mut self, now: Instant) -> SmallVec<[Expired; 4]> {
        let timeout = self.timeout;
        let dead: SmallVec<[[u8; PREFIX_LEN]; 4]> = self
            .active
            .iter()
            .filter(|(_, p)| p.minted_at + timeout <= now)
            .map(|(prefix, _)| *prefix)
            .collect();
        let mut out = SmallVec::new();
        for prefix in dead {
            let pending = self.active.remove(&prefix).expect("collected above");
            self.free.push(prefix);
            out.push(Expired {
                tx: pending.tx,
                ctx: pending.ctx,
                minted_at: pending.minted_at,
            });
        }
        out
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// When minting failed, the instant the next prefix frees up.
    pub fn next_available_at(&self) -> Option<Instant> {
        self.active
            .values()
            .map(|p| p.minted_at + self.timeout)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const CAP: usize = 16;

    fn registry() -> (Transactions, SmallRng, Instant) {
        (
            Transactions::new(CAP, Duration::from_secs(10)),
            SmallRng::seed_from_u64(99),
            Instant::now(),
        )
    }

    #[test]
    fn mint_is_unique_until_exhausted() {
        let (mut txs, mut rng, now) = registry();
        let mut minted = Vec::new();
        for _ in 0..CAP {
            assert!(txs.has_free());
            let tx = txs.mint(&mut rng, now, TxContext::Ping { id: NodeId::default() });
            minted.push(tx.unwrap());
        }
        for i in 0..minted.len() {
            for k in i + 1..minted.len() {
                assert_ne!(minted[i].as_bytes()[..2], minted[k].as_bytes()[..2]);
            }
        }
        assert!(!txs.has_free());
        assert!(txs
            .mint(&mut rng, now, TxContext::Ping { id: NodeId::default() })
            .is_none());

        for tx in &minted {
            assert!(txs.consume(tx).is_some());
            assert!(txs.consume(tx).is_none());
            assert!(txs.has_free());
        }
    }

    #[test]
    fn consume_of_unminted_fails() {
        let (mut txs, mut rng, now) = registry();
        let _ = txs.mint(&mut rng, now, TxContext::Ping { id: NodeId::default() });
        let bogus = Transaction::from_bytes(b"zz11").unwrap();
        assert!(txs.consume(&bogus).is_none());
    }

    #[test]
    fn consume_verifies_full_id_not_only_prefix() {
        let (mut txs, mut rng, now) = registry();
        let tx = txs
            .mint(&mut rng, now, TxContext::Ping { id: NodeId::default() })
            .unwrap();
        let mut forged = tx.as_bytes().to_vec();
        forged[3] ^= 0xff;
        let forged = Transaction::from_bytes(&forged).unwrap();
        assert!(txs.consume(&forged).is_none());
        assert!(txs.consume(&tx).is_some());
    }

    #[test]
    fn expire_fires_every_timeout_exactly_once() {
        let (mut txs, mut rng, now) = registry();
        for _ in 0..CAP {
            txs.mint(&mut rng, now, TxContext::Ping { id: NodeId::default() })
                .unwrap();
        }
        assert!(txs.expire(now).is_empty());
        let fired = txs.expire(now + Duration::from_millis(10_001));
        assert_eq!(fired.len(), CAP);
        assert!(txs.has_free());
        assert!(txs
            .mint(&mut rng, now, TxContext::Ping { id: NodeId::default() })
            .is_some());
        assert!(txs.expire(now + Duration::from_secs(3600)).len() == 1);
    }

    #[test]
    fn next_available_tracks_oldest() {
        let (mut txs, mut rng, now) = registry();
        for _ in 0..CAP {
            txs.mint(&mut rng, now, TxContext::Ping { id: NodeId::default() })
                .unwrap();
        }
        assert_eq!(txs.next_available_at(), Some(now + Duration::from_secs(10)));
    }
}
