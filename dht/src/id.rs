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

//! 160-bit identifiers, XOR distance and BEP-42 id hardening.

use rand::RngCore;
use std::fmt;
use std::net::Ipv4Addr;

/// Length in bytes of node ids, infohashes and distances.
pub const ID_LEN: usize = 20;

/// Raw 160-bit key; node ids and infohashes share it.
pub type Key = [u8; ID_LEN];

/// Identity of a node in the Kademlia key space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub [u8; ID_LEN]);

/// A BitTorrent content identifier; lives in the same key space as
/// [`NodeId`] and is looked up the same way.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InfoHash(pub [u8; ID_LEN]);

/// XOR of two 160-bit keys, ordered lexicographically: smaller is
/// closer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; ID_LEN]);

/// `a ^ b`.
pub fn distance(a: &Key, b: &Key) -> Distance {
    let mut out = [0u8; ID_LEN];
    for (i, o) in out.iter_mut().enumerate() {
        *o = a[i] ^ b[i];
    }
    Distance(out)
}

/// Count of shared leading bits; the "rank" of `b` relative to `a`.
pub fn rank(a: &Key, b: &Key) -> usize {
    for i in 0..ID_LEN {
        let x = a[i] ^ b[i];
        if x != 0 {
            return i * 8 + x.leading_zeros() as usize;
        }
    }
    ID_LEN * 8
}

/// Bit `idx` of `key`, most significant first.
pub fn bit(key: &Key, idx: usize) -> bool {
    let mask = 0b1000_0000u8 >> (idx % 8);
    key[idx / 8] & mask != 0
}

impl NodeId {
    pub fn from_bytes(bytes: &[u8]) -> Option<NodeId> {
        if bytes.len() != ID_LEN {
            return None;
        }
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(bytes);
        Some(NodeId(out))
    }

    pub fn random<R: RngCore>(rng: &mut R) -> NodeId {
        let mut out = [0u8; ID_LEN];
        rng.fill_bytes(&mut out);
        NodeId(out)
    }

    pub fn as_bytes(&self) -> &Key {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn bit(&self, idx: usize) -> bool {
        bit(&self.0, idx)
    }

    pub fn distance(&self, other: &Key) -> Distance {
        distance(&self.0, other)
    }

    pub fn rank(&self, other: &Key) -> usize {
        rank(&self.0, other)
    }
}

impl InfoHash {
    pub fn from_bytes(bytes: &[u8]) -> Option<InfoHash> {
        NodeId::from_bytes(bytes).map(|id| InfoHash(id.0))
    }

    pub fn as_bytes(&self) -> &Key {
        &self.0
    }
}

fn hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId(")?;
        hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        hex(f, &self.0)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash(")?;
        hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        hex(f, &self.0)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance(")?;
        hex(f, &self.0)?;
        write!(f, ")")
    }
}

/// BEP-42: node ids hardened against the external IP.
///
/// The first 21 bits of a conforming id are the CRC32C of the masked
/// IP mixed with a 3-bit seed; the seed byte is stored in the last id
/// byte so a verifier can reproduce the computation.
pub mod bep42 {
    use super::{NodeId, ID_LEN};
    use rand::RngCore;
    use std::net::Ipv4Addr;

    const V4_MASK: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];

    fn prefix_crc(ip: &Ipv4Addr, seed: u8) -> u32 {
        let mut masked = ip.octets();
        for (b, m) in masked.iter_mut().zip(V4_MASK.iter()) {
            *b &= m;
        }
        masked[0] |= (seed & 0x7) << 5;
        crc32c::crc32c(&masked)
    }

    /// Mint an id valid for `ip`.
    pub fn node_id<R: RngCore>(ip: &Ipv4Addr, rng: &mut R) -> NodeId {
        let mut id = [0u8; ID_LEN];
        rng.fill_bytes(&mut id);
        let seed = id[ID_LEN - 1];
        let crc = prefix_crc(ip, seed);
        id[0] = (crc >> 24) as u8;
        id[1] = (crc >> 16) as u8;
        id[2] = ((crc >> 8) as u8 & 0xf8) | (id[2] & 0x7);
        NodeId(id)
    }

    /// The strict BEP-42 test: does `id` carry the prefix mandated for
    /// `ip`?
    pub fn is_strict(ip: &Ipv4Addr, id: &NodeId) -> bool {
        let seed = id.0[ID_LEN - 1];
        let crc = prefix_crc(ip, seed);
        id.0[0] == (crc >> 24) as u8
            && id.0[1] == (crc >> 16) as u8
            && (id.0[2] & 0xf8) == ((crc >> 8) as u8 & 0xf8)
    }
}

/// Mint the node's own id: BEP-42 conforming when the external
/// address is known, uniformly random otherwise.
pub fn mint_self_id<R: RngCore>(external: Option<Ipv4Addr>, rng: &mut R) -> NodeId {
    match external {
        Some(ip) => bep42::node_id(&ip, rng),
        None => NodeId::random(rng),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn rank_counts_shared_prefix() {
        let a = [0u8; ID_LEN];
        let mut b = [0u8; ID_LEN];
        assert_eq!(rank(&a, &b), 160);
        b[0] = 0b1000_0000;
        assert_eq!(rank(&a, &b), 0);
        b[0] = 0b0000_0001;
        assert_eq!(rank(&a, &b), 7);
        b[0] = 0;
        b[5] = 0b0001_0000;
        assert_eq!(rank(&a, &b), 43);
    }

    #[test]
    fn distance_orders_lexicographically() {
        let target = [0u8; ID_LEN];
        let mut near = [0u8; ID_LEN];
        near[ID_LEN - 1] = 1;
        let mut far = [0u8; ID_LEN];
        far[0] = 1;
        assert!(distance(&target, &near) < distance(&target, &far));
    }

    #[test]
    fn bit_is_msb_first() {
        let mut key = [0u8; ID_LEN];
        key[0] = 0b1000_0000;
        key[1] = 0b0000_0001;
        assert!(bit(&key, 0));
        assert!(!bit(&key, 1));
        assert!(bit(&key, 15));
    }

    quickcheck! {
        fn bep42_derived_id_is_strict(a: u8, b: u8, c: u8, d: u8, seed: u64) -> bool {
            let ip = Ipv4Addr::new(a, b, c, d);
            let mut rng = SmallRng::seed_from_u64(seed);
            let id = bep42::node_id(&ip, &mut rng);
            bep42::is_strict(&ip, &id)
        }

        fn bep42_rejects_other_ip(seed: u64) -> bool {
            let ip = Ipv4Addr::new(21, 75, 31, 124);
            let other = Ipv4Addr::new(65, 23, 51, 170);
            let mut rng = SmallRng::seed_from_u64(seed);
            let id = bep42::node_id(&ip, &mut rng);
            !bep42::is_strict(&other, &id)
        }
    }

    #[test]
    fn self_id_follows_external_estimate() {
        let mut rng = SmallRng::seed_from_u64(3);
        let ip = Ipv4Addr::new(93, 184, 216, 34);
        let hardened = mint_self_id(Some(ip), &mut rng);
        assert!(bep42::is_strict(&ip, &hardened));
        // with no estimate the id is plain random, not tied to any ip
        let blind = mint_self_id(None, &mut rng);
        assert!(!blind.is_zero());
    }

    #[test]
    fn zero_id_detected() {
        assert!(NodeId([0u8; ID_LEN]).is_zero());
        let mut id = [0u8; ID_LEN];
        id[19] = 1;
        assert!(!NodeId(id).is_zero());
    }
}
