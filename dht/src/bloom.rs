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

//! 256-bit bloom filter over two independent hash functions.
//!
//! Small enough to sit inline in the election and in every search;
//! false positives only ever suppress a redundant vote or query.

const BITS: usize = 256;
const WORDS: usize = BITS / 64;

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn djb2a(data: &[u8]) -> u64 {
    let mut hash = 5381u64;
    for b in data {
        hash = hash.wrapping_mul(33) ^ u64::from(*b);
    }
    hash
}

#[derive(Clone, Default)]
pub struct Bloom {
    words: [u64; WORDS],
}

impl Bloom {
    pub fn new() -> Bloom {
        Bloom::default()
    }

    fn slots(data: &[u8]) -> [usize; 2] {
        [fnv1a(data) as usize % BITS, djb2a(data) as usize % BITS]
    }

    pub fn insert(&mut self, data: &[u8]) {
        for slot in Self::slots(data).iter() {
            self.words[slot / 64] |= 1u64 << (slot % 64);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        Self::slots(data)
            .iter()
            .all(|slot| self.words[slot / 64] & (1u64 << (slot % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.words = [0; WORDS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_is_found() {
        let mut b = Bloom::new();
        assert!(!b.contains(b"1.2.3.4"));
        b.insert(b"1.2.3.4");
        assert!(b.contains(b"1.2.3.4"));
    }

    #[test]
    fn distinct_keys_usually_miss() {
        let mut b = Bloom::new();
        b.insert(&[1, 2, 3, 4]);
        let misses = (0u16..100)
            .filter(|i| !b.contains(&i.to_be_bytes()))
            .count();
        // two hash functions over 256 bits: near all of 100 keys miss
        assert!(misses > 90);
    }

    #[test]
    fn clear_forgets() {
        let mut b = Bloom::new();
        b.insert(b"x");
        b.clear();
        assert!(!b.contains(b"x"));
    }
}
