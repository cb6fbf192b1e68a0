use log::trace;

use crate::error::RuntimeError;
use crate::names::VarId;
use crate::object::{HeapObject, ObjectBody};
use crate::slots::SlotId;
use crate::sparse::SparseMap;
use crate::value::Value;

/// Generation-checked handle to a heap object. Freeing a slot bumps its
/// generation, so a handle kept past its object's death stops resolving
/// instead of reaching recycled memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline(always)]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) const fn new_for_test(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({}, gen {})", self.index, self.generation)
    }
}

struct Entry {
    generation: u32,
    object: Option<HeapObject>,
}

/// Slab of all heap objects plus the doubly-linked allocation list
/// threaded through them, newest first. The collector walks the list; the
/// slab indexes double as mark-bitmap positions.
#[derive(Default)]
pub struct ObjectHeap {
    entries: Vec<Entry>,
    free: Vec<u32>,
    head: Option<ObjectId>,
    live: usize,
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link a fresh object in at the list head.
    pub(crate) fn insert(&mut self, mut object: HeapObject) -> Result<ObjectId, RuntimeError> {
        let id = match self.free.pop() {
            Some(index) => ObjectId {
                index,
                generation: self.entries[index as usize].generation,
            },
            None => {
                if self.entries.len() >= u32::MAX as usize {
                    return Err(RuntimeError::CapacityExceeded {
                        what: "object heap",
                        limit: u32::MAX as usize,
                    });
                }
                self.entries.push(Entry {
                    generation: 0,
                    object: None,
                });
                ObjectId {
                    index: self.entries.len() as u32 - 1,
                    generation: 0,
                }
            }
        };

        object.next = self.head;
        object.prev = None;
        trace!("alloc {} {id:?}", object.kind().name());
        self.entries[id.index()].object = Some(object);
        if let Some(old_head) = self.head {
            if let Some(prev_head) = self.get_mut(old_head) {
                prev_head.prev = Some(id);
            }
        }
        self.head = Some(id);
        self.live += 1;
        Ok(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        let entry = self.entries.get(id.index())?;
        if entry.generation != id.generation {
            return None;
        }
        entry.object.as_ref()
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        let entry = self.entries.get_mut(id.index())?;
        if entry.generation != id.generation {
            return None;
        }
        entry.object.as_mut()
    }

    #[inline(always)]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Newest live object, the allocation-list anchor.
    #[inline(always)]
    pub fn head(&self) -> Option<ObjectId> {
        self.head
    }

    #[inline(always)]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Index-space bound, the size a mark bitmap must cover.
    #[inline(always)]
    pub fn index_bound(&self) -> usize {
        self.entries.len()
    }

    /// Walk the allocation list from the head, newest allocation first.
    pub fn iter_live(&self) -> impl Iterator<Item = ObjectId> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.get(id).and_then(|obj| obj.next);
            Some(id)
        })
    }

    /// Register `weak` as an observer of `target`. The target keeps the
    /// observer set so death can null every watcher in one pass.
    pub(crate) fn register_weak(
        &mut self,
        weak: ObjectId,
        target: ObjectId,
    ) -> Result<(), RuntimeError> {
        if !self.contains(weak) {
            return Err(RuntimeError::StaleReference);
        }
        let Some(target_obj) = self.get_mut(target) else {
            return Err(RuntimeError::StaleReference);
        };
        target_obj.weak_refs.push(weak);
        if let Some(weak_obj) = self.get_mut(weak) {
            if let ObjectBody::WeakRef { target: slot } = &mut weak_obj.body {
                *slot = Some(target);
            }
        }
        Ok(())
    }

    /// Null every watcher of `id` and drop its observer set. Idempotent;
    /// the sweep runs this for all doomed objects before any pre-free hook
    /// so watchers are stale by the time teardown can observe them.
    pub(crate) fn clear_watchers(&mut self, id: ObjectId) {
        let Some(obj) = self.get_mut(id) else { return };
        let watchers = std::mem::take(&mut obj.weak_refs);
        for weak in watchers {
            if let Some(weak_obj) = self.get_mut(weak) {
                if let ObjectBody::WeakRef { target } = &mut weak_obj.body {
                    *target = None;
                }
            }
        }
    }

    /// Unlink and drop the object's heap record. Weak observers are nulled
    /// here, before any hook-level teardown the caller runs afterwards can
    /// observe them. Returns the detached object.
    pub(crate) fn free_object(&mut self, id: ObjectId) -> Option<HeapObject> {
        let object = {
            let Some(entry) = self.entries.get_mut(id.index()) else {
                debug_assert!(false, "freed an out-of-range object id: {id:?}");
                log::error!("freed an out-of-range object id: {id:?}");
                return None;
            };
            if entry.generation != id.generation {
                debug_assert!(false, "object freed twice: {id:?}");
                log::error!("object freed twice: {id:?}");
                return None;
            }
            let Some(object) = entry.object.take() else {
                debug_assert!(false, "object freed twice: {id:?}");
                log::error!("object freed twice: {id:?}");
                return None;
            };
            entry.generation = entry.generation.wrapping_add(1);
            object
        };
        self.free.push(id.index);
        self.live -= 1;

        // Splice the allocation list around the hole.
        match object.prev {
            Some(prev) => {
                if let Some(prev_obj) = self.get_mut(prev) {
                    prev_obj.next = object.next;
                }
            }
            None => self.head = object.next,
        }
        if let Some(next) = object.next {
            if let Some(next_obj) = self.get_mut(next) {
                next_obj.prev = object.prev;
            }
        }

        // Every watcher of this object goes stale now.
        for weak in &object.weak_refs {
            if let Some(weak_obj) = self.get_mut(*weak) {
                if let ObjectBody::WeakRef { target } = &mut weak_obj.body {
                    *target = None;
                }
            }
        }
        // A dying weak reference stops watching its target.
        if let ObjectBody::WeakRef {
            target: Some(target),
        } = &object.body
        {
            let target = *target;
            if let Some(target_obj) = self.get_mut(target) {
                target_obj.weak_refs.retain(|weak| *weak != id);
            }
        }

        trace!("freed {} {id:?}", object.kind().name());
        Some(object)
    }

    // ── array counts ───────────────────────────────────────────────

    /// Bump an array body's reference count. No upper bound is enforced;
    /// allocation limits cap the count long before it can wrap.
    pub(crate) fn inc_array(&mut self, id: ObjectId) {
        match self.get_mut(id).and_then(HeapObject::as_array_mut) {
            Some(body) => body.count += 1,
            None => {
                debug_assert!(false, "array count bumped on a non-array: {id:?}");
                log::error!("array count bumped on a non-array: {id:?}");
            }
        }
    }

    /// Drop an array body's reference count. Returns `true` when it
    /// reached zero and the body should be torn down.
    ///
    /// A sweep may free an array record while counted copies of it are
    /// still staged; those decrements land here after the fact and are
    /// no-ops. Zeroed counts on a live body are real double-decrements.
    pub(crate) fn dec_array(&mut self, id: ObjectId) -> bool {
        let Some(obj) = self.get_mut(id) else {
            trace!("array {id:?} already freed before a staged decrement");
            return false;
        };
        match obj.as_array_mut() {
            Some(body) if body.count > 0 => {
                body.count -= 1;
                body.count == 0
            }
            _ => {
                debug_assert!(false, "array count decremented past zero: {id:?}");
                log::error!("array count decremented past zero: {id:?}");
                false
            }
        }
    }

    pub fn array_count(&self, id: ObjectId) -> Option<u32> {
        self.get(id).and_then(HeapObject::as_array).map(|body| body.count)
    }

    // ── storage detachment (teardown hooks) ────────────────────────

    pub(crate) fn detach_vars(&mut self, id: ObjectId) -> Option<Box<SparseMap<VarId, SlotId>>> {
        self.get_mut(id)?.vars.take()
    }

    pub(crate) fn detach_array_elements(&mut self, id: ObjectId) -> Vec<Value> {
        match self.get_mut(id).and_then(HeapObject::as_array_mut) {
            Some(body) => std::mem::take(&mut body.elements),
            None => Vec::new(),
        }
    }

    pub(crate) fn detach_script_bindings(&mut self, id: ObjectId) -> Option<(Value, Value)> {
        let body = self.get_mut(id)?.script_ref_mut()?;
        let scope = std::mem::replace(&mut body.scope, Value::undefined());
        let bound_this = std::mem::replace(&mut body.bound_this, Value::undefined());
        Some((scope, bound_this))
    }
}
