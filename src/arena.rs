//! Generational handle arena backing the particle handle spaces.
//!
//! Handles are typed, so a collision handle can never index the particles
//! arena. Freed slots bump their generation; a stale handle keeps resolving
//! to `None` instead of aliasing the slot's next occupant.

use std::fmt;
use std::marker::PhantomData;

/// Typed handle into a [`HandleArena`].
///
/// Construction is two-phase: `allocate` reserves the slot, `initialize`
/// fills it. Lookups on a reserved-but-uninitialized handle return `None`.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Slot index, for diagnostics only.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation, for diagnostics only.
    pub fn generation(&self) -> u32 {
        self.generation
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

struct Slot<T> {
    generation: u32,
    /// `None` for both free and reserved slots; `occupied` tells them apart.
    value: Option<T>,
    occupied: bool,
}

/// Slot arena with generation-checked lookups.
pub struct HandleArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Reserve a slot without a value. The handle is live for `free` and
    /// `initialize` but resolves to `None` until initialized.
    pub fn allocate(&mut self) -> Handle<T> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                    occupied: false,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.occupied = true;
        self.live += 1;
        Handle {
            index,
            generation: slot.generation,
            _marker: PhantomData,
        }
    }

    /// Fill a reserved slot. Returns `false` for stale or already
    /// initialized handles.
    pub fn initialize(&mut self, handle: Handle<T>, value: T) -> bool {
        match self.slot_mut(handle) {
            Some(slot) if slot.value.is_none() => {
                slot.value = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Reserve and fill in one step.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        let handle = self.allocate();
        self.slots[handle.index as usize].value = Some(value);
        handle
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slot(handle).and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slot_mut(handle).and_then(|slot| slot.value.as_mut())
    }

    /// True for any live handle, initialized or not.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    /// Release the slot and return its value if it had one. The generation
    /// bump invalidates every outstanding copy of the handle.
    pub fn free(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slot_mut(handle)?;
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        let value = slot.value.take();
        self.free.push(handle.index);
        self.live -= 1;
        value
    }

    /// Number of live (allocated) slots.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate initialized entries with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let value = slot.value.as_ref()?;
            Some((
                Handle {
                    index: index as u32,
                    generation: slot.generation,
                    _marker: PhantomData,
                },
                value,
            ))
        })
    }

    /// Iterate initialized entries mutably with their handles.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            let value = slot.value.as_mut()?;
            Some((
                Handle {
                    index: index as u32,
                    generation,
                    _marker: PhantomData,
                },
                value,
            ))
        })
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
    }

    fn slot_mut(&mut self, handle: Handle<T>) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
    }
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_phase_construction() {
        let mut arena: HandleArena<u32> = HandleArena::new();
        let handle = arena.allocate();
        assert!(arena.contains(handle));
        assert!(arena.get(handle).is_none());

        assert!(arena.initialize(handle, 42));
        assert_eq!(arena.get(handle), Some(&42));

        // Double initialize is rejected
        assert!(!arena.initialize(handle, 43));
        assert_eq!(arena.get(handle), Some(&42));
    }

    #[test]
    fn test_stale_handle_after_free() {
        let mut arena: HandleArena<&str> = HandleArena::new();
        let handle = arena.insert("alive");
        assert_eq!(arena.free(handle), Some("alive"));

        assert!(!arena.contains(handle));
        assert!(arena.get(handle).is_none());
        assert!(arena.free(handle).is_none());
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut arena: HandleArena<u32> = HandleArena::new();
        let first = arena.insert(1);
        arena.free(first);

        let second = arena.insert(2);
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert!(arena.get(first).is_none());
        assert_eq!(arena.get(second), Some(&2));
    }

    #[test]
    fn test_iter_skips_reserved_slots() {
        let mut arena: HandleArena<u32> = HandleArena::new();
        let _reserved = arena.allocate();
        let a = arena.insert(10);
        let b = arena.insert(20);

        let mut values: Vec<u32> = arena.iter().map(|(_, v)| *v).collect();
        values.sort_unstable();
        assert_eq!(values, vec![10, 20]);
        assert_eq!(arena.len(), 3);

        arena.free(a);
        arena.free(b);
        assert_eq!(arena.len(), 1);
    }
}
