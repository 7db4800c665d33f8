//! Fixed-capacity slot arena with generation-checked handles.

/// Handle to an arena slot.
///
/// A handle stays valid until its slot is freed; after that the slot's
/// generation moves on and the stale handle no longer resolves, even if
/// the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Preallocated table of `T` with a free list.
#[derive(Debug)]
pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> SlotArena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        // Lowest index is handed out first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free,
            len: 0,
        }
    }

    /// Store `value`, handing it back when every slot is taken.
    pub fn insert(&mut self, value: T) -> Result<SlotId, T> {
        let Some(index) = self.free.pop() else {
            return Err(value);
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;
        Ok(SlotId {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Free a slot. Returns `None` when `id` is stale, so a slot is
    /// released at most once per handle.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotId, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(|value| {
                (
                    SlotId {
                        index: index as u32,
                        generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_until_full() {
        let mut arena = SlotArena::with_capacity(2);
        let a = arena.insert("a").expect("first slot");
        let b = arena.insert("b").expect("second slot");
        assert_ne!(a, b);
        assert!(arena.is_full());
        assert_eq!(arena.insert("c"), Err("c"));
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn stale_handle_does_not_resolve_after_reuse() {
        let mut arena = SlotArena::with_capacity(1);
        let old = arena.insert(1).expect("slot");
        assert_eq!(arena.remove(old), Some(1));
        let new = arena.insert(2).expect("reused slot");

        assert_eq!(old.index(), new.index());
        assert!(arena.get(old).is_none());
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn double_remove_is_noop() {
        let mut arena = SlotArena::with_capacity(3);
        let id = arena.insert(7).expect("slot");
        assert_eq!(arena.remove(id), Some(7));
        assert_eq!(arena.remove(id), None);
        assert!(arena.is_empty());
        assert_eq!(arena.free.len(), 3);
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut arena = SlotArena::with_capacity(4);
        let ids: Vec<SlotId> = (0..4)
            .map(|i| arena.insert(i).expect("slot"))
            .collect();
        arena.remove(ids[1]);
        arena.remove(ids[2]);

        let values: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 3]);

        for (_, value) in arena.iter_mut() {
            *value *= 10;
        }
        assert_eq!(arena.get(ids[3]), Some(&30));
    }
}
