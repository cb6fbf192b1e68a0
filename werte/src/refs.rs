use std::marker::PhantomData;

use log::trace;

use crate::error::RuntimeError;

/// Handle to a slot in a [`RefArena`]. Index plus generation: a freed slot
/// bumps its generation, so ids that outlive their referent read as stale
/// instead of aliasing the slot's next tenant.
pub struct RefId<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls: derive would put a `T: Clone`/`T: Copy` bound on the id even
// though it only carries indexes.
impl<T> Clone for RefId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RefId<T> {}

impl<T> PartialEq for RefId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for RefId<T> {}

impl<T> std::hash::Hash for RefId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> std::fmt::Debug for RefId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RefId({}, gen {})", self.index, self.generation)
    }
}

impl<T> RefId<T> {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline(always)]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

struct RefSlot<T> {
    payload: T,
    count: u32,
    size: u32,
}

struct Entry<T> {
    generation: u32,
    slot: Option<RefSlot<T>>,
}

/// Reference-counted handle storage.
///
/// A slot is shared by every value or container holding a copy of its id and
/// is freed exactly when its count reaches zero. [`RefArena::inc`] is the
/// only count-increasing operation; decrements are batched through the GC
/// context and land in [`RefArena::dec`] only from the drain path, never
/// inline from value destruction.
pub struct RefArena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Ref-counted string storage; the payload of string-kinded values.
pub type StrArena = RefArena<Box<str>>;
pub type StrId = RefId<Box<str>>;

impl<T> Default for RefArena<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> RefArena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Allocate a slot with count 1. `size` is the element/byte extent of
    /// the payload, reported back by [`RefArena::size`].
    pub fn alloc(&mut self, payload: T, size: u32) -> RefId<T> {
        let slot = RefSlot {
            payload,
            count: 1,
            size,
        };
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                debug_assert!(entry.slot.is_none());
                entry.slot = Some(slot);
                RefId {
                    index,
                    generation: entry.generation,
                    _marker: PhantomData,
                }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry {
                    generation: 0,
                    slot: Some(slot),
                });
                RefId {
                    index,
                    generation: 0,
                    _marker: PhantomData,
                }
            }
        }
    }

    /// Size-checked allocation for extents measured in `usize`.
    pub fn try_alloc(
        &mut self,
        payload: T,
        size: usize,
    ) -> Result<RefId<T>, RuntimeError> {
        match u32::try_from(size) {
            Ok(size) => Ok(self.alloc(payload, size)),
            Err(_) => Err(RuntimeError::CapacityExceeded {
                what: "handle size",
                limit: u32::MAX as usize,
            }),
        }
    }

    /// Bump the count. No other effect; there is no upper bound check
    /// (payload sizes are bounded long before a u32 count can wrap).
    pub fn inc(&mut self, id: RefId<T>) {
        match self.slot_mut(id) {
            Some(slot) => slot.count += 1,
            None => debug_assert!(false, "inc on stale handle {id:?}"),
        }
    }

    /// Read the payload without touching the count. `None` when the id is
    /// stale or freed.
    pub fn get(&self, id: RefId<T>) -> Option<&T> {
        self.slot(id).map(|slot| &slot.payload)
    }

    /// The element/byte extent recorded at allocation.
    pub fn size(&self, id: RefId<T>) -> Option<u32> {
        self.slot(id).map(|slot| slot.size)
    }

    pub fn count(&self, id: RefId<T>) -> Option<u32> {
        self.slot(id).map(|slot| slot.count)
    }

    /// Number of live slots.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Decrement, freeing the slot when the count reaches zero. Returns the
    /// payload when this decrement freed it, so the drain can stage its
    /// children. Called from the drain path only.
    ///
    /// Decrementing a freed slot is a double-free: debug-asserted, reported,
    /// and ignored in release rather than corrupting the arena.
    pub(crate) fn dec(&mut self, id: RefId<T>) -> Option<T> {
        match self.entries.get_mut(id.index()) {
            Some(entry) if entry.generation == id.generation => {
                let Some(slot) = entry.slot.as_mut() else {
                    debug_assert!(
                        false,
                        "refcount decremented past zero: {id:?}"
                    );
                    log::error!("refcount decremented past zero: {id:?}");
                    return None;
                };
                slot.count -= 1;
                if slot.count > 0 {
                    return None;
                }
                let freed = entry.slot.take()?;
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(id.index);
                self.live -= 1;
                trace!("freed handle {id:?} ({} bytes)", freed.size);
                Some(freed.payload)
            }
            _ => {
                debug_assert!(false, "refcount decremented past zero: {id:?}");
                log::error!("refcount decremented past zero: {id:?}");
                None
            }
        }
    }

    fn slot(&self, id: RefId<T>) -> Option<&RefSlot<T>> {
        let entry = self.entries.get(id.index())?;
        if entry.generation != id.generation {
            return None;
        }
        entry.slot.as_ref()
    }

    fn slot_mut(&mut self, id: RefId<T>) -> Option<&mut RefSlot<T>> {
        let entry = self.entries.get_mut(id.index())?;
        if entry.generation != id.generation {
            return None;
        }
        entry.slot.as_mut()
    }
}

impl StrArena {
    /// Allocate a string handle; the size extent is the byte length.
    ///
    /// Panics when the byte length does not fit the u32 extent, the same way
    /// the allocator treats out-of-memory.
    pub fn alloc_str(&mut self, s: &str) -> StrId {
        let Ok(size) = u32::try_from(s.len()) else {
            panic!("string payload exceeds handle size limit");
        };
        self.alloc(Box::from(s), size)
    }
}
