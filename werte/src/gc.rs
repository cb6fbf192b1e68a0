use std::collections::VecDeque;

use log::{debug, trace};

use crate::heap::ObjectId;
use crate::object::ObjectFlags;
use crate::runtime::Runtime;
use crate::slots::SlotId;
use crate::value::{Value, ValueData};

// ── mark bitmap ─────────────────────────────────────────────────────────────

/// Visited bitmap for one mark pass, bounded by the heap's index space.
/// Marking an index past the bound reports failure instead of growing; the
/// collector treats that as "unmarkable".
pub struct MarkBitmap {
    words: Vec<u32>,
    bound: usize,
    marked: usize,
}

impl MarkBitmap {
    pub fn new(bound: usize) -> Self {
        Self {
            words: vec![0; bound.div_ceil(32)],
            bound,
            marked: 0,
        }
    }

    /// Set a bit. `true` only when the bit was inside the bound and not
    /// yet set.
    pub fn mark(&mut self, index: usize) -> bool {
        if index >= self.bound {
            return false;
        }
        let word = &mut self.words[index / 32];
        let bit = 1u32 << (index % 32);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        self.marked += 1;
        true
    }

    pub fn is_marked(&self, index: usize) -> bool {
        index < self.bound && self.words[index / 32] & (1u32 << (index % 32)) != 0
    }

    #[inline(always)]
    pub fn bound(&self) -> usize {
        self.bound
    }

    #[inline(always)]
    pub fn marked(&self) -> usize {
        self.marked
    }
}

/// Mark-pass state handed to marking hooks: the visited bitmap plus the
/// worklist that replaces recursion. Hooks mark their own bit and enqueue
/// children; the collector loops until the worklist is empty.
pub struct Marker {
    bitmap: MarkBitmap,
    worklist: Vec<ObjectId>,
}

impl Marker {
    pub fn with_capacity(bound: usize) -> Self {
        Self {
            bitmap: MarkBitmap::new(bound),
            worklist: Vec::new(),
        }
    }

    /// Mark an object's bit. `false` when already marked or out of bound;
    /// hooks use that to cut off re-traversal.
    pub fn mark(&mut self, id: ObjectId) -> bool {
        self.bitmap.mark(id.index())
    }

    pub fn is_marked(&self, id: ObjectId) -> bool {
        self.bitmap.is_marked(id.index())
    }

    /// Queue an object for traversal.
    pub fn enqueue(&mut self, id: ObjectId) {
        self.worklist.push(id);
    }

    pub(crate) fn pop(&mut self) -> Option<ObjectId> {
        self.worklist.pop()
    }

    #[inline(always)]
    pub fn marked_count(&self) -> usize {
        self.bitmap.marked()
    }
}

// ── staging context ─────────────────────────────────────────────────────────

/// Deferred-collection staging buffers: owned values pending a count
/// decrement, variable slots pending recycling, and array bodies whose
/// count already hit zero. The buffers hold work, never traverse it; a
/// drain processes them in FIFO order, staging any newly freed children
/// back into the same context instead of recursing.
#[derive(Default)]
pub struct GcContext {
    values: VecDeque<Value>,
    slots: VecDeque<SlotId>,
    arrays: VecDeque<ObjectId>,
}

impl GcContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an owned value for a deferred count decrement.
    pub fn stage_value(&mut self, value: Value) {
        self.values.push_back(value);
    }

    /// Stage an emptied variable slot for recycling.
    pub fn stage_slot(&mut self, slot: SlotId) {
        self.slots.push_back(slot);
    }

    /// Stage a zero-count array body for teardown.
    pub fn stage_array(&mut self, id: ObjectId) {
        self.arrays.push_back(id);
    }

    /// Total staged entries awaiting a drain.
    pub fn pending(&self) -> usize {
        self.values.len() + self.slots.len() + self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

/// Per-pass counters reported by [`Runtime::collect`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    /// Live objects when the pass started.
    pub live: usize,
    /// Objects the mark phase reached.
    pub marked: usize,
    /// Objects swept.
    pub freed: usize,
    /// Staged entries processed by the drain, zero for deferred passes.
    pub drained: usize,
}

/// Supplier of external mark roots, typically the interpreter's value
/// stack. Visited values only need to expose their object edges.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&Value));
}

// ── collection passes ───────────────────────────────────────────────────────

impl Runtime {
    /// Hand an owned value back. Counted payloads (strings, arrays) are
    /// staged for a deferred decrement; everything else just drops.
    pub fn release(&mut self, value: Value) {
        match value.data {
            ValueData::Str(_) | ValueData::Array(_) => self.gc.stage_value(value),
            _ => {}
        }
    }

    /// Release with the decrement applied on the spot. A decrement that
    /// zeroes an array still stages the body teardown, so deep graphs cost
    /// queue entries instead of stack frames.
    pub fn release_now(&mut self, value: Value) {
        match value.data {
            ValueData::Str(id) => {
                self.strings.dec(id);
            }
            ValueData::Array(id) => {
                if self.objects.dec_array(id) {
                    self.gc.stage_array(id);
                }
            }
            _ => {}
        }
    }

    /// Drain the staging buffers to empty, FIFO per buffer. Newly zeroed
    /// children re-enter the buffers and are processed in the same loop.
    pub fn drain_pending(&mut self) -> usize {
        let mut processed = 0;
        loop {
            if let Some(value) = self.gc.values.pop_front() {
                processed += 1;
                self.release_now(value);
                continue;
            }
            if let Some(id) = self.gc.arrays.pop_front() {
                processed += 1;
                // The sweep may already have reclaimed the record.
                if !self.objects.contains(id) {
                    trace!("array {id:?} already swept before drain");
                    continue;
                }
                for element in self.objects.detach_array_elements(id) {
                    self.gc.stage_value(element);
                }
                if let Some(vars) = self.objects.detach_vars(id) {
                    for (_, slot) in vars.into_entries() {
                        if let Some(value) = self.slots.take(slot) {
                            self.gc.stage_value(value);
                        }
                        self.gc.stage_slot(slot);
                    }
                }
                self.objects.free_object(id);
                continue;
            }
            if let Some(slot) = self.gc.slots.pop_front() {
                processed += 1;
                self.slots.recycle(slot);
                continue;
            }
            break;
        }
        processed
    }

    /// Stop-the-world collection: mark from pinned roots, sweep the
    /// unreachable, release their storage immediately, then drain the
    /// cascades.
    pub fn collect(&mut self) -> CollectStats {
        let mut stats = self.mark_and_sweep(None, false);
        stats.drained = self.drain_pending();
        debug!(
            "collect: live {} marked {} freed {} drained {}",
            stats.live, stats.marked, stats.freed, stats.drained
        );
        stats
    }

    /// [`Runtime::collect`] seeded with external roots as well as pinned
    /// objects.
    pub fn collect_with_roots(&mut self, provider: &mut dyn RootProvider) -> CollectStats {
        let mut stats = self.mark_and_sweep(Some(provider), false);
        stats.drained = self.drain_pending();
        debug!(
            "collect: live {} marked {} freed {} drained {}",
            stats.live, stats.marked, stats.freed, stats.drained
        );
        stats
    }

    /// Mark and sweep, but stage all storage teardown into the context
    /// instead of releasing inline. The caller (or a drain worker) runs
    /// [`Runtime::drain_pending`] at its own pace.
    pub fn collect_deferred(&mut self) -> CollectStats {
        let stats = self.mark_and_sweep(None, true);
        debug!(
            "collect (deferred): live {} marked {} freed {} staged {}",
            stats.live,
            stats.marked,
            stats.freed,
            self.gc.pending()
        );
        stats
    }

    fn mark_and_sweep(
        &mut self,
        provider: Option<&mut dyn RootProvider>,
        deferred: bool,
    ) -> CollectStats {
        self.gc_epoch += 1;
        let live_before = self.objects.live();

        // Mark phase. The heap and slot pool are only read; the marker
        // carries all mutable state.
        let mut marker = Marker::with_capacity(self.objects.index_bound());
        {
            let objects = &self.objects;
            let slots = &self.slots;
            for id in objects.iter_live() {
                let pinned = objects
                    .get(id)
                    .is_some_and(|obj| obj.flags.contains(ObjectFlags::ROOT));
                if pinned {
                    marker.enqueue(id);
                }
            }
            if let Some(provider) = provider {
                provider.visit_roots(&mut |value| {
                    if let Some(edge) = value.object_edge() {
                        marker.enqueue(edge);
                    }
                });
            }
            while let Some(id) = marker.pop() {
                let Some(mark) = objects.get(id).map(|obj| obj.hooks.mark) else {
                    continue;
                };
                mark(objects, slots, id, &mut marker);
            }
        }

        // Sweep phase 1: null watchers and run pre-free for every doomed
        // object while all their records still exist.
        let doomed: Vec<ObjectId> = self
            .objects
            .iter_live()
            .filter(|id| !marker.is_marked(*id))
            .collect();
        for &id in &doomed {
            self.objects.clear_watchers(id);
            if let Some(pre_free) = self.objects.get(id).map(|obj| obj.hooks.pre_free) {
                pre_free(self, id);
            }
        }

        // Sweep phase 2: storage teardown, then the record itself.
        for &id in &doomed {
            let hook = self.objects.get(id).map(|obj| {
                if deferred {
                    obj.hooks.thread_free
                } else {
                    obj.hooks.free
                }
            });
            if let Some(teardown) = hook {
                teardown(self, id);
            }
            self.objects.free_object(id);
        }

        // Survivor bookkeeping.
        let survivors: Vec<ObjectId> = self.objects.iter_live().collect();
        for id in survivors {
            if let Some(obj) = self.objects.get_mut(id) {
                obj.visited_gc = self.gc_epoch;
            }
        }

        CollectStats {
            live: live_before,
            marked: marker.marked_count(),
            freed: doomed.len(),
            drained: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;
    use crate::value::ValueKind;

    struct Stack(Vec<Value>);

    impl RootProvider for Stack {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(&Value)) {
            for value in &self.0 {
                visitor(value);
            }
        }
    }

    #[test]
    fn releasing_the_last_string_handle_frees_it_on_drain() {
        let mut rt = Runtime::new();
        let value = rt.alloc_string("transient");
        assert_eq!(rt.strings().live(), 1);

        rt.release(value);
        assert_eq!(rt.strings().live(), 1, "free must wait for the drain");
        let drained = rt.drain_pending();
        assert_eq!(drained, 1);
        assert_eq!(rt.strings().live(), 0);
    }

    #[test]
    fn collect_sweeps_unreachable_objects_and_keeps_pinned_ones() {
        let mut rt = Runtime::new();
        let kept = rt.alloc_object(ObjectKind::Instance).unwrap();
        let _lost = rt.alloc_object(ObjectKind::Instance).unwrap();
        rt.pin(kept);

        let stats = rt.collect();
        assert_eq!(stats.live, 2);
        assert_eq!(stats.marked, 1);
        assert_eq!(stats.freed, 1);
        assert!(rt.objects().contains(kept));
        assert_eq!(rt.objects().live(), 1);
    }

    #[test]
    fn survivors_carry_the_pass_epoch() {
        let mut rt = Runtime::new();
        let kept = rt.alloc_object(ObjectKind::Instance).unwrap();
        rt.pin(kept);
        rt.collect();
        assert_eq!(rt.objects().get(kept).unwrap().visited_gc, rt.gc_epoch());
    }

    #[test]
    fn values_reached_through_root_providers_survive() {
        let mut rt = Runtime::new();
        let id = rt.alloc_object(ObjectKind::Instance).unwrap();
        let mut stack = Stack(vec![Value::object(id)]);

        rt.collect_with_roots(&mut stack);
        assert!(rt.objects().contains(id));

        stack.0.clear();
        rt.collect_with_roots(&mut stack);
        assert!(!rt.objects().contains(id));
    }

    #[test]
    fn marked_objects_keep_their_children_alive() {
        let mut rt = Runtime::new();
        let parent = rt.alloc_object(ObjectKind::Instance).unwrap();
        let child = rt.alloc_object(ObjectKind::Instance).unwrap();
        rt.pin(parent);
        rt.set(parent, "child", &Value::object(child)).unwrap();

        let stats = rt.collect();
        assert_eq!(stats.freed, 0);
        assert!(rt.objects().contains(child));
    }

    #[test]
    fn unreachable_cycles_are_swept() {
        let mut rt = Runtime::new();
        let a = rt.alloc_object(ObjectKind::Instance).unwrap();
        let b = rt.alloc_object(ObjectKind::Instance).unwrap();
        rt.set(a, "other", &Value::object(b)).unwrap();
        rt.set(b, "other", &Value::object(a)).unwrap();

        let stats = rt.collect();
        assert_eq!(stats.freed, 2);
        assert_eq!(rt.objects().live(), 0);
    }

    #[test]
    fn objects_without_marking_logic_are_swept_not_crashed() {
        // Sequence kinds carry fail-safe hooks; even pinned they cannot
        // mark themselves and degrade to unreachable.
        let mut rt = Runtime::new();
        let seq = rt.alloc_object(ObjectKind::Sequence).unwrap();
        rt.pin(seq);

        let stats = rt.collect();
        assert_eq!(stats.freed, 1);
        assert!(!rt.objects().contains(seq));
    }

    #[test]
    fn weak_references_report_stale_after_their_target_is_collected() {
        let mut rt = Runtime::new();
        let target = rt.alloc_object(ObjectKind::Instance).unwrap();
        let w1 = rt.alloc_weak_ref(target).unwrap();
        let w2 = rt.alloc_weak_ref(target).unwrap();
        rt.pin(w1);
        rt.pin(w2);
        assert_eq!(rt.weak_target(w1).unwrap(), target);

        rt.collect();
        assert!(!rt.objects().contains(target));
        assert!(matches!(
            rt.weak_target(w1),
            Err(crate::error::RuntimeError::StaleReference)
        ));
        assert!(matches!(
            rt.weak_target(w2),
            Err(crate::error::RuntimeError::StaleReference)
        ));
    }

    #[test]
    fn weak_references_never_keep_their_target_alive() {
        let mut rt = Runtime::new();
        let target = rt.alloc_object(ObjectKind::Instance).unwrap();
        let weak = rt.alloc_weak_ref(target).unwrap();
        rt.pin(weak);

        rt.collect();
        assert!(!rt.objects().contains(target));
        assert!(rt.objects().contains(weak));
    }

    #[test]
    fn deep_array_chains_drain_without_recursion() {
        let mut rt = Runtime::new();
        let mut head = rt.alloc_array(Vec::new()).unwrap();
        for _ in 0..10_000 {
            head = rt.alloc_array(vec![head]).unwrap();
        }
        assert_eq!(rt.objects().live(), 10_001);

        rt.release(head);
        rt.drain_pending();
        assert_eq!(rt.objects().live(), 0);
    }

    #[test]
    fn a_sweep_beats_a_staged_array_release_without_incident() {
        let mut rt = Runtime::new();
        let array = rt.alloc_array(vec![Value::int32(1)]).unwrap();
        rt.release(array);

        // The owned value is still staged when the sweep frees the
        // unreachable record; the drained decrement finds nothing to do.
        let stats = rt.collect();
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.drained, 1);
        assert_eq!(rt.objects().live(), 0);
    }

    #[test]
    fn doomed_holders_tolerate_their_arrays_being_swept_first() {
        let mut rt = Runtime::new();
        let holder = rt.alloc_object(ObjectKind::Instance).unwrap();
        let array = rt.alloc_array(Vec::new()).unwrap();
        rt.set(holder, "items", &array).unwrap();
        rt.release(array);
        rt.drain_pending();
        assert_eq!(rt.objects().live(), 2);

        // The array record (newer, so swept earlier) is gone by the time
        // the holder's teardown releases its counted property copy.
        let stats = rt.collect();
        assert_eq!(stats.freed, 2);
        assert_eq!(rt.objects().live(), 0);
    }

    #[test]
    fn deferred_collection_stages_storage_until_the_drain() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        let text = rt.alloc_string("held by obj");
        rt.set(obj, "s", &text).unwrap();
        rt.release(text);
        rt.drain_pending();
        assert_eq!(rt.strings().live(), 1, "the object still holds a copy");

        let stats = rt.collect_deferred();
        assert_eq!(stats.freed, 1);
        assert!(!rt.objects().contains(obj));
        assert_eq!(rt.strings().live(), 1, "teardown is staged, not run");
        assert!(rt.gc().pending() > 0);

        rt.drain_pending();
        assert_eq!(rt.strings().live(), 0);
        assert!(rt.gc().is_empty());
    }

    #[test]
    fn partial_mark_hooks_cover_self_and_children_separately() {
        let mut rt = Runtime::new();
        let parent = rt.alloc_object(ObjectKind::Instance).unwrap();
        let child = rt.alloc_object(ObjectKind::Instance).unwrap();
        rt.set(parent, "child", &Value::object(child)).unwrap();

        let hooks = rt.objects().get(parent).unwrap().hooks;
        let mut marker = Marker::with_capacity(rt.objects().index_bound());

        assert!((hooks.mark_this_only)(rt.objects(), rt.slots(), parent, &mut marker));
        assert!(marker.is_marked(parent));
        assert!(!marker.is_marked(child));

        (hooks.mark_children_only)(rt.objects(), rt.slots(), parent, &mut marker);
        let queued = marker.pop();
        assert_eq!(queued, Some(child));
    }

    #[test]
    fn bitmap_bound_is_respected() {
        let mut bitmap = MarkBitmap::new(4);
        assert!(bitmap.mark(3));
        assert!(!bitmap.mark(3), "remarking reports failure");
        assert!(!bitmap.mark(4), "past the bound is unmarkable");
        assert!(bitmap.is_marked(3));
        assert!(!bitmap.is_marked(4));
        assert_eq!(bitmap.marked(), 1);
    }

    #[test]
    fn released_array_values_cascade_through_their_elements() {
        let mut rt = Runtime::new();
        let text = rt.alloc_string("inside");
        let array = rt.alloc_array(vec![text]).unwrap();
        assert_eq!(array.kind(), ValueKind::Array);
        assert_eq!(rt.strings().live(), 1);

        rt.release(array);
        rt.drain_pending();
        assert_eq!(rt.strings().live(), 0);
        assert_eq!(rt.objects().live(), 0);
    }
}
