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

//! Intrusive timeout wheel.
//!
//! A circular doubly-linked FIFO threaded through arena slots by
//! index, ordered by the entry's timestamp: the head is always the
//! oldest entry, so the next wake deadline is a single lookup. An
//! entry is appended on insertion and on every send, and unlinked
//! when it times out or is evicted.

use crate::arena::{Arena, SlotId};
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Wheel linkage embedded in each entry. Both pointers are set iff
/// the entry is linked; a lone entry points at itself.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Links {
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

impl Links {
    pub fn is_linked(&self) -> bool {
        self.prev.is_some()
    }
}

/// An arena entry the wheel can age.
pub(crate) trait Timed {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
    /// The FIFO key: when this entry last became "fresh".
    fn stamp(&self) -> Instant;
}

#[derive(Default)]
pub(crate) struct Wheel {
    head: Option<SlotId>,
    len: usize,
}

impl Wheel {
    pub fn new() -> Wheel {
        Wheel::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn head(&self) -> Option<SlotId> {
        self.head
    }

    /// Link `id` at the tail (the freshest end).
    pub fn append<T: Timed>(&mut self, arena: &mut Arena<T>, id: SlotId) {
        debug_assert!(!arena.get(id).map_or(true, |e| e.links().is_linked()));
        match self.head {
            None => {
                let links = arena.get_mut(id).expect("appended slot exists").links_mut();
                links.prev = Some(id);
                links.next = Some(id);
                self.head = Some(id);
            }
            Some(head) => {
                let tail = arena.get(head).expect("wheel head exists").links().prev
                    .expect("linked entry has prev");
                {
                    let links = arena.get_mut(id).expect("appended slot exists").links_mut();
                    links.prev = Some(tail);
                    links.next = Some(head);
                }
                arena.get_mut(tail).expect("wheel tail exists").links_mut().next = Some(id);
                arena.get_mut(head).expect("wheel head exists").links_mut().prev = Some(id);
            }
        }
        self.len += 1;
    }

    /// Link `id` at the head (the stalest end), so it is reconsidered
    /// first on the next sweep.
    pub fn prepend<T: Timed>(&mut self, arena: &mut Arena<T>, id: SlotId) {
        self.append(arena, id);
        self.head = Some(id);
    }

    pub fn unlink<T: Timed>(&mut self, arena: &mut Arena<T>, id: SlotId) {
        let links = match arena.get(id) {
            Some(entry) if entry.links().is_linked() => *entry.links(),
            _ => return,
        };
        let prev = links.prev.expect("linked entry has prev");
        let next = links.next.expect("linked entry has next");
        if next == id {
            self.head = None;
        } else {
            arena.get_mut(prev).expect("prev linked").links_mut().next = Some(next);
            arena.get_mut(next).expect("next linked").links_mut().prev = Some(prev);
            if self.head == Some(id) {
                self.head = Some(next);
            }
        }
        *arena.get_mut(id).expect("unlinked slot exists").links_mut() = Links::default();
        self.len -= 1;
    }

    /// Pop up to `max` entries whose `stamp + delta <= now`, oldest
    /// first. Popped entries are unlinked; the caller re-appends them
    /// after refreshing their stamp, or drops them.
    pub fn take_expired<T: Timed>(
        &mut self,
        arena: &mut Arena<T>,
        now: Instant,
        delta: Duration,
        max: usize,
    ) -> SmallVec<[SlotId; 8]> {
        let mut out = SmallVec::new();
        while out.len() < max {
            let head = match self.head {
                Some(h) => h,
                None => break,
            };
            let stamp = arena.get(head).expect("wheel head exists").stamp();
            if stamp + delta > now {
                break;
            }
            self.unlink(arena, head);
            out.push(head);
        }
        out
    }

    /// Deadline at which the oldest entry expires, if any.
    pub fn next_deadline<T: Timed>(&self, arena: &Arena<T>, delta: Duration) -> Option<Instant> {
        self.head
            .and_then(|h| arena.get(h))
            .map(|entry| entry.stamp() + delta)
    }

    /// Walk the wheel head to tail. Used by integrity checks and the
    /// table dump.
    pub fn ids<T: Timed>(&self, arena: &Arena<T>) -> Vec<SlotId> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(head) = self.head {
            let mut cur = head;
            loop {
                out.push(cur);
                cur = arena.get(cur).expect("linked slot exists").links()
                    .next
                    .expect("linked entry has next");
                if cur == head {
                    break;
                }
            }
        }
        out
    }
}
