//! Arena of shared, reference-counted hot artifacts.
//!
//! Entries are addressed by a generational [`ArtifactHandle`]: once an
//! entry is removed its slot can be reused, and stale handles to the
//! old occupant are rejected instead of aliasing the new one.

use std::sync::Mutex;

use crate::errors::EngineError;
use crate::errors::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactHandle {
    index: u32,
    generation: u32,
}

struct Occupant<T> {
    value: T,
    refs: usize,
}

struct Slot<T> {
    generation: u32,
    occupant: Option<Occupant<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Slots<T> {
    fn occupant(&mut self, handle: ArtifactHandle) -> EngineResult<&mut Occupant<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.occupant.as_mut())
            .ok_or_else(|| EngineError::InvalidOperation(format!("stale artifact handle {handle:?}")))
    }
}

pub struct HotArtifactArena<T> {
    inner: Mutex<Slots<T>>,
}

impl<T> Default for HotArtifactArena<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }
}

impl<T> HotArtifactArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots<T>> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Add an artifact with a reference count of zero.
    pub fn insert(&self, value: T) -> ArtifactHandle {
        let mut inner = self.lock();
        let occupant = Some(Occupant { value, refs: 0 });
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.occupant = occupant;
            ArtifactHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = inner.slots.len() as u32;
            inner.slots.push(Slot {
                generation: 0,
                occupant,
            });
            ArtifactHandle {
                index,
                generation: 0,
            }
        }
    }

    /// Returns the new reference count.
    pub fn acquire(&self, handle: ArtifactHandle) -> EngineResult<usize> {
        let mut inner = self.lock();
        let occupant = inner.occupant(handle)?;
        occupant.refs += 1;
        Ok(occupant.refs)
    }

    /// Returns the new reference count.
    pub fn release(&self, handle: ArtifactHandle) -> EngineResult<usize> {
        let mut inner = self.lock();
        let occupant = inner.occupant(handle)?;
        if occupant.refs == 0 {
            return Err(EngineError::InvalidOperation(format!(
                "artifact {handle:?} released more often than acquired"
            )));
        }
        occupant.refs -= 1;
        Ok(occupant.refs)
    }

    pub fn ref_count(&self, handle: ArtifactHandle) -> EngineResult<usize> {
        Ok(self.lock().occupant(handle)?.refs)
    }

    /// Take the artifact out, invalidating `handle`.
    pub fn remove(&self, handle: ArtifactHandle) -> EngineResult<T> {
        let mut inner = self.lock();
        inner.occupant(handle)?;
        let slot = &mut inner.slots[handle.index as usize];
        let occupant = slot.occupant.take();
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        occupant
            .map(|occupant| occupant.value)
            .ok_or_else(|| EngineError::InvalidOperation(format!("stale artifact handle {handle:?}")))
    }

    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.occupant.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        for slot in inner.slots.iter_mut() {
            if slot.occupant.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        inner.free = (0..inner.slots.len() as u32).collect();
    }
}

impl<T: Clone> HotArtifactArena<T> {
    pub fn get(&self, handle: ArtifactHandle) -> EngineResult<T> {
        Ok(self.lock().occupant(handle)?.value.clone())
    }
}
