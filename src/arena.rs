//! Handle-indexed pools
//!
//! Work items and compilation units live in pools and refer to each other
//! through generational handles, so intrusive list links are plain indices
//! and a handle kept past reclamation is detected instead of aliasing a
//! recycled slot.

use std::fmt;
use std::marker::PhantomData;

/// A handle into a [`Pool`]
pub trait PoolHandle: Copy + Eq {
    fn from_parts(index: u32, generation: u32) -> Self;
    fn index(self) -> u32;
    fn generation(self) -> u32;
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl PoolHandle for $name {
            fn from_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }
            fn index(self) -> u32 {
                self.index
            }
            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}v{}"), self.index, self.generation)
            }
        }
    };
}

define_handle!(
    /// Handle of a work item
    ItemId,
    "item#"
);
define_handle!(
    /// Handle of a compilation unit
    UnitId,
    "unit#"
);

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with a free list
pub struct Pool<H, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    _handle: PhantomData<H>,
}

impl<H: PoolHandle, T> Pool<H, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            _handle: PhantomData,
        }
    }

    /// Store `value`, reusing a freed slot when one exists
    pub fn insert(&mut self, value: T) -> H {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return H::from_parts(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, value: Some(value) });
        H::from_parts(index, 0)
    }

    /// Take the value out and return its slot to the free list
    pub fn remove(&mut self, handle: H) -> Option<T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live handles and values in slot order
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (H::from_parts(index as u32, slot.generation), value))
        })
    }

    /// Drain every live value
    pub fn drain(&mut self) -> Vec<T> {
        let values = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.value.take())
            .collect();
        self.slots.clear();
        self.free.clear();
        self.live = 0;
        values
    }
}

impl<H: PoolHandle, T> Default for Pool<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: PoolHandle, T> std::ops::Index<H> for Pool<H, T> {
    type Output = T;

    fn index(&self, handle: H) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => panic!("stale pool handle (slot {})", handle.index()),
        }
    }
}

impl<H: PoolHandle, T> std::ops::IndexMut<H> for Pool<H, T> {
    fn index_mut(&mut self, handle: H) -> &mut T {
        match self.get_mut(handle) {
            Some(value) => value,
            None => panic!("stale pool handle (slot {})", handle.index()),
        }
    }
}
