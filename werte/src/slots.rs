use crate::error::RuntimeError;
use crate::value::Value;

/// Index of a variable slot in the [`SlotPool`]. Slots are recycled only
/// through the deferred-free queue, so an id stays valid until the next
/// drain after its owner died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

impl SlotId {
    #[inline(always)]
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Backing store for instance variables. Objects map interned names to slot
/// ids; the pool owns the values. Keeping the values out of the objects
/// gives variable references a stable address while their owner moves
/// through the free queue.
#[derive(Default)]
pub struct SlotPool {
    slots: Vec<Value>,
    free: Vec<u32>,
}

impl SlotPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot holding `undefined`, reusing a recycled index when
    /// one is available.
    pub fn alloc(&mut self) -> Result<SlotId, RuntimeError> {
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Value::undefined();
            return Ok(SlotId(index));
        }
        if self.slots.len() >= u32::MAX as usize {
            return Err(RuntimeError::CapacityExceeded {
                what: "slot pool",
                limit: u32::MAX as usize,
            });
        }
        let index = self.slots.len() as u32;
        self.slots.push(Value::undefined());
        Ok(SlotId(index))
    }

    pub fn get(&self, id: SlotId) -> Option<&Value> {
        self.slots.get(id.index())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut Value> {
        self.slots.get_mut(id.index())
    }

    /// Move the slot's value out, leaving `undefined` behind. The slot is
    /// not recycled; that happens separately once the drain reaches it.
    pub(crate) fn take(&mut self, id: SlotId) -> Option<Value> {
        let slot = self.slots.get_mut(id.index())?;
        Some(std::mem::replace(slot, Value::undefined()))
    }

    /// Return a slot to the free list. The value must already have been
    /// taken and released.
    pub(crate) fn recycle(&mut self, id: SlotId) {
        debug_assert!(
            self.slots
                .get(id.index())
                .is_some_and(Value::is_undefined),
            "recycled a slot that still holds a value"
        );
        self.free.push(id.0);
    }

    /// Slots currently owned by live objects.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
