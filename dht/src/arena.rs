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

//! Bounded slot arena with stable indices.
//!
//! The routing table and the peer database keep their entries here so
//! the intrusive timeout wheels can hold plain `u32` slot ids instead
//! of pointers; a slot id stays valid until the entry is removed, no
//! matter how the owning bucket or record reorganizes.

pub(crate) type SlotId = u32;

pub(crate) struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<SlotId>,
    capacity: usize,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new(capacity: usize) -> Arena<T> {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    /// Store `value`, returning its slot id, or `None` when the pool
    /// is exhausted.
    pub fn insert(&mut self, value: T) -> Option<SlotId> {
        let id = match self.free.pop() {
            Some(id) => {
                debug_assert!(self.slots[id as usize].is_none());
                self.slots[id as usize] = Some(value);
                id
            }
            None => {
                if self.slots.len() >= self.capacity {
                    return None;
                }
                self.slots.push(Some(value));
                (self.slots.len() - 1) as SlotId
            }
        };
        self.len += 1;
        Some(id)
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let value = self.slots.get_mut(id as usize)?.take();
        if value.is_some() {
            self.free.push(id);
            self.len -= 1;
        }
        value
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i as SlotId, v)))
    }
}
