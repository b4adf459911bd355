//! Generation-checked handle table. A handle packs a slot index and the slot's generation; releasing
//! a slot bumps its generation, so a stale handle never reaches a newer resource in the same slot.

use std::fmt;

use crate::error::AbyssError;

/// Opaque, non-zero reference to a slot in a [`HandleTable`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    fn new(index: u32, generation: u32) -> Self {
        // index + 1 keeps every valid handle non-zero; zero stays free to mean "no handle".
        Handle(((index as u64 + 1) << 32) | generation as u64)
    }

    fn index(self) -> Option<usize> {
        let hi = self.0 >> 32;
        if hi == 0 {
            None
        } else {
            Some((hi - 1) as usize)
        }
    }

    fn generation(self) -> u32 {
        self.0 as u32
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of resources addressed by [`Handle`]. Not synchronized; wrap it in a lock to share it.
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn allocate(&mut self, value: T) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    pub fn resolve(&self, handle: Handle) -> Result<&T, AbyssError> {
        handle
            .index()
            .and_then(|i| self.slots.get(i))
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
            .ok_or(AbyssError::NotFound)
    }

    pub fn resolve_mut(&mut self, handle: Handle) -> Result<&mut T, AbyssError> {
        handle
            .index()
            .and_then(|i| self.slots.get_mut(i))
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
            .ok_or(AbyssError::NotFound)
    }

    /// Remove and return the resource. Releasing a stale or already released handle returns `None`.
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        let index = handle.index()?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index as u32);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release everything, returning the resources.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                out.push(value);
            }
        }
        out
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
