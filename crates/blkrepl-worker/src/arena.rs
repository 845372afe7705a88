//! Generational arena for in-flight requests.
//!
//! Requests are referenced by [`Handle`]s rather than pointers. A handle
//! carries the slot generation, so a handle to a freed and reused slot is
//! detected instead of aliasing the new occupant.

use core::fmt;
use std::marker::PhantomData;

/// Typed reference into an [`Arena`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Pack into a u64 suitable for use as a wire-level ack token.
    pub fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack a token produced by [`Handle::to_raw`].
    pub fn from_raw(raw: u64) -> Self {
        Self::new(raw as u32, (raw >> 32) as u32)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Slot arena with generation-checked handles and an optional size cap.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: usize,
}

impl<T> Arena<T> {
    /// Create an unbounded arena.
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Create an arena that refuses inserts beyond `limit` live entries.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit,
        }
    }

    /// Insert a value, handing it back if the arena is full.
    pub fn try_insert(&mut self, value: T) -> Result<Handle<T>, T> {
        if self.len >= self.limit {
            return Err(value);
        }
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => generation.wrapping_add(1),
                Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            *slot = Slot::Occupied { generation, value };
            return Ok(Handle::new(index, generation));
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        Ok(Handle::new(index, 0))
    }

    /// Borrow the value behind a live handle.
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Mutably borrow the value behind a live handle.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Remove and return the value behind a live handle.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {
                let generation = *generation;
                let old = std::mem::replace(slot, Slot::Vacant { generation });
                self.free.push(handle.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => None,
                }
            }
            _ => None,
        }
    }

    /// True if the handle still refers to a live value.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no values are live.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live values with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((Handle::new(i as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let h = arena.try_insert("a").unwrap();
        assert_eq!(arena.get(h), Some(&"a"));
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.remove(h), Some("a"));
        assert!(arena.is_empty());
        assert_eq!(arena.get(h), None);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = Arena::new();
        let old = arena.try_insert(1).unwrap();
        arena.remove(old);
        let new = arena.try_insert(2).unwrap();
        assert_ne!(old, new);
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.get(new), Some(&2));
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_limit() {
        let mut arena = Arena::with_limit(2);
        arena.try_insert(1).unwrap();
        let h = arena.try_insert(2).unwrap();
        assert_eq!(arena.try_insert(3), Err(3));
        arena.remove(h);
        assert!(arena.try_insert(3).is_ok());
    }

    #[test]
    fn test_raw_round_trip() {
        let mut arena = Arena::new();
        let a = arena.try_insert(1).unwrap();
        arena.remove(a);
        let b = arena.try_insert(2).unwrap();
        let raw = b.to_raw();
        assert_eq!(Handle::<i32>::from_raw(raw), b);
        assert_ne!(Handle::<i32>::from_raw(a.to_raw()), b);
    }

    #[test]
    fn test_iter_skips_vacant() {
        let mut arena = Arena::new();
        let a = arena.try_insert(10).unwrap();
        arena.try_insert(20).unwrap();
        arena.remove(a);
        let values: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![20]);
    }
}
