/*! The stream pool: an arena of stable indices with a generation counter
per slot to resolve ABA hazards (`spec.md` §9 "Stream identity and
back-pointers": "a freed stream slot is quarantined until no outstanding
timer or in-flight segment references it (a generation counter on the slot
resolves ABA)").

Every external reference to a stream — a timer wheel entry, a listen
backlog's ready queue, the caller's own `StreamId` — is a raw index plus
the generation it was issued under, never a pointer. A `slab`-style
free-list arena was the first instinct (`dspeyrer-net`'s `collections` crate
in the retrieved pack depends on `slab` for an analogous purpose), but
`slab::Slab`'s bare `usize` key does not carry the generation this design
needs to detect a stale reference to a slot that has since been recycled,
so the free-list is hand-rolled here instead and `slab` is not carried as a
dependency (see `DESIGN.md`).
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub index: usize,
    pub generation: u32,
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// A fixed-capacity generational arena.
#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<SlotDebug<T>>,
    free: Vec<usize>,
    len: usize,
    capacity: usize,
}

// Slab-style slot storage; kept as a thin wrapper so `Pool<T>: Debug`
// doesn't require `T: Debug` on the private generation bookkeeping.
struct SlotDebug<T>(Slot<T>);

impl<T> std::fmt::Debug for SlotDebug<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("occupied", &self.0.value.is_some())
            .field("generation", &self.0.generation)
            .finish()
    }
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Pool<T> {
        Pool {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a value, returning `None` if the pool is already at capacity
    /// (`spec.md` §6 error code "pool-exhausted").
    pub fn insert(&mut self, value: T) -> Option<StreamId> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.0.value = Some(value);
            self.len += 1;
            return Some(StreamId {
                index,
                generation: slot.0.generation,
            });
        }
        if self.slots.len() >= self.capacity {
            return None;
        }
        let index = self.slots.len();
        self.slots.push(SlotDebug(Slot {
            value: Some(value),
            generation: 0,
        }));
        self.len += 1;
        Some(StreamId { index, generation: 0 })
    }

    /// Remove and return the value at `id`, bumping the slot's generation
    /// so any stale `StreamId` referencing it now misses.
    pub fn remove(&mut self, id: StreamId) -> Option<T> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.0.generation != id.generation || slot.0.value.is_none() {
            return None;
        }
        let value = slot.0.value.take();
        slot.0.generation = slot.0.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        value
    }

    pub fn get(&self, id: StreamId) -> Option<&T> {
        let slot = self.slots.get(id.index)?;
        if slot.0.generation != id.generation {
            return None;
        }
        slot.0.value.as_ref()
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.0.generation != id.generation {
            return None;
        }
        slot.0.value.as_mut()
    }

    /// Reconstruct the `StreamId` currently valid for a raw index, e.g.
    /// after reading one back out of the timer wheel (which only stores
    /// the bare index).
    pub fn current_id(&self, index: usize) -> Option<StreamId> {
        let slot = self.slots.get(index)?;
        slot.0.value.as_ref()?;
        Some(StreamId {
            index,
            generation: slot.0.generation,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.0.value.as_ref().map(|v| {
                (
                    StreamId {
                        index,
                        generation: slot.0.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn iter_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.0.value.is_some())
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_id_misses_after_removal_and_reinsertion() {
        let mut pool: Pool<u32> = Pool::with_capacity(4);
        let a = pool.insert(1).unwrap();
        pool.remove(a);
        let b = pool.insert(2).unwrap();
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(pool.get(a).is_none());
        assert_eq!(*pool.get(b).unwrap(), 2);
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let mut pool: Pool<u32> = Pool::with_capacity(1);
        assert!(pool.insert(1).is_some());
        assert!(pool.insert(2).is_none());
    }
}
