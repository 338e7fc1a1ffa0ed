//! Callback registration table.
//!
//! Slots are addressed by a small integer handle that stays stable across
//! growth. Free slots form an intrusive list threaded through the entries;
//! each slot also carries a generation, bumped on every disarm, so a
//! completion from an earlier registration of a reused slot can be told
//! apart from the current one.

use std::rc::Rc;

use super::core::Proactor;

/// Callback invoked on readiness: `(event mask, error, proactor)`.
pub(crate) type EventCb = Rc<dyn Fn(u32, i32, &Proactor)>;

/// End-of-list marker for the intrusive free list.
const NIL: i32 = -1;

enum Slot {
    /// Vacant entry linking to the next free slot.
    Free { next: i32 },

    /// Live registration.
    Armed { cb: EventCb },
}

struct Entry {
    slot: Slot,
    generation: u32,
}

pub(crate) struct CallbackTable {
    entries: Vec<Entry>,
    next_free: i32,
}

impl CallbackTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut table = Self {
            entries: Vec::new(),
            next_free: NIL,
        };
        table.grow_to(capacity);
        table
    }

    /// Claims a slot for `cb`, doubling the table if the free list is
    /// empty. Returns the slot index and its current generation.
    pub(crate) fn arm(&mut self, cb: EventCb) -> (u32, u32) {
        if self.next_free == NIL {
            let capacity = self.entries.len();
            self.grow_to(capacity * 2);
            log::debug!("callback table regrown to {}", self.entries.len());
        }

        let index = self.next_free as usize;
        let entry = &mut self.entries[index];

        self.next_free = match entry.slot {
            Slot::Free { next } => next,
            Slot::Armed { .. } => unreachable!("armed slot on the free list"),
        };
        entry.slot = Slot::Armed { cb };

        (index as u32, entry.generation)
    }

    /// Releases `slot` onto the free list and invalidates the tokens handed
    /// out for it.
    pub(crate) fn disarm(&mut self, slot: u32) {
        let index = slot as usize;
        assert!(index < self.entries.len(), "disarm of unknown slot {slot}");

        let entry = &mut self.entries[index];
        debug_assert!(
            matches!(entry.slot, Slot::Armed { .. }),
            "double disarm of slot {slot}"
        );

        entry.generation = entry.generation.wrapping_add(1);
        entry.slot = Slot::Free {
            next: self.next_free,
        };
        self.next_free = slot as i32;
    }

    /// The callback for `slot`, iff it is still armed under `generation`.
    pub(crate) fn armed(&self, slot: usize, generation: u32) -> Option<EventCb> {
        match self.entries.get(slot) {
            Some(Entry {
                slot: Slot::Armed { cb },
                generation: current,
            }) if *current == generation => Some(cb.clone()),
            _ => None,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn armed_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.slot, Slot::Armed { .. }))
            .count()
    }

    #[cfg(test)]
    pub(crate) fn generation(&self, slot: u32) -> u32 {
        self.entries[slot as usize].generation
    }

    /// Doubling growth. Fresh slots are threaded onto the free list;
    /// existing indices never move.
    fn grow_to(&mut self, new_len: usize) {
        debug_assert_eq!(self.next_free, NIL);

        let prev = self.entries.len();
        self.entries.reserve(new_len - prev);
        for i in prev..new_len {
            let next = if i + 1 < new_len { (i + 1) as i32 } else { NIL };
            self.entries.push(Entry {
                slot: Slot::Free { next },
                generation: 0,
            });
        }
        self.next_free = prev as i32;
    }
}
