// src/slab.rs
//! Fixed-capacity table of live units (connections and spawned tasks).
//!
//! Slots are recycled through an intrusive free list. Each slot carries a
//! generation so a [`Key`] held by a stale timer or continuation never
//! reaches the unit that later reuses the slot.

/// Stable reference to a slab entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

pub struct Slab<T> {
    entries: Vec<Slot<T>>,
    head_free: Option<u32>,
    active_count: usize,
    capacity: usize,
}

impl<T> Slab<T> {
    /// Slots are allocated lazily up to `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            head_free: None,
            active_count: 0,
            capacity,
        }
    }

    /// O(1) insert. Returns `None` when the slab is full.
    pub fn insert(&mut self, value: T) -> Option<Key> {
        if let Some(index) = self.head_free {
            let slot = &mut self.entries[index as usize];
            let (generation, next_free) = match slot {
                Slot::Vacant { generation, next_free } => (generation.wrapping_add(1), *next_free),
                Slot::Occupied { .. } => return None,
            };
            *slot = Slot::Occupied { generation, value };
            self.head_free = next_free;
            self.active_count += 1;
            return Some(Key { index, generation });
        }

        if self.entries.len() >= self.capacity {
            return None;
        }
        let index = self.entries.len() as u32;
        self.entries.push(Slot::Occupied { generation: 0, value });
        self.active_count += 1;
        Some(Key { index, generation: 0 })
    }

    /// O(1) removal. Stale keys are ignored.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.entries.get_mut(key.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }
        let old = std::mem::replace(
            slot,
            Slot::Vacant {
                generation: key.generation,
                next_free: self.head_free,
            },
        );
        self.head_free = Some(key.index);
        self.active_count -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        match self.entries.get(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match self.entries.get_mut(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    /// Keys of every live entry, in slot order.
    pub fn keys(&self) -> Vec<Key> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied { generation, .. } => Some(Key {
                    index: i as u32,
                    generation: *generation,
                }),
                Slot::Vacant { .. } => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
