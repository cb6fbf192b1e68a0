use bitflags::bitflags;

use crate::code::ScriptRefBody;
use crate::error::RuntimeError;
use crate::gc::Marker;
use crate::heap::{ObjectHeap, ObjectId};
use crate::names::VarId;
use crate::runtime::Runtime;
use crate::slots::{SlotId, SlotPool};
use crate::sparse::SparseMap;
use crate::value::{Value, ValueFlags, ValueKind};

// ── object kinds ────────────────────────────────────────────────────────────

/// Discriminant for heap-object specializations. The sequence family and
/// nine-slice belong to the animation subsystem; the core only routes them
/// to fail-safe hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectKind {
    Base = 0,
    Instance,
    Accessor,
    ScriptRef,
    Property,
    Array,
    WeakRef,
    Container,
    Sequence,
    SequenceInstance,
    SequenceTrack,
    SequenceCurve,
    SequenceCurveChannel,
    SequenceCurvePoint,
    SequenceKeyframeStore,
    SequenceKeyframe,
    SequenceKeyframeData,
    SequenceEvalTree,
    SequenceEvalNode,
    SequenceEvent,
    NineSlice,
}

impl ObjectKind {
    pub const COUNT: usize = 21;

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Base => "object",
            ObjectKind::Instance => "instance",
            ObjectKind::Accessor => "accessor",
            ObjectKind::ScriptRef => "script ref",
            ObjectKind::Property => "property",
            ObjectKind::Array => "array",
            ObjectKind::WeakRef => "weak ref",
            ObjectKind::Container => "container",
            ObjectKind::Sequence => "sequence",
            ObjectKind::SequenceInstance => "sequence instance",
            ObjectKind::SequenceTrack => "sequence track",
            ObjectKind::SequenceCurve => "sequence curve",
            ObjectKind::SequenceCurveChannel => "sequence curve channel",
            ObjectKind::SequenceCurvePoint => "sequence curve point",
            ObjectKind::SequenceKeyframeStore => "sequence keyframe store",
            ObjectKind::SequenceKeyframe => "sequence keyframe",
            ObjectKind::SequenceKeyframeData => "sequence keyframe data",
            ObjectKind::SequenceEvalTree => "sequence eval tree",
            ObjectKind::SequenceEvalNode => "sequence eval node",
            ObjectKind::SequenceEvent => "sequence event",
            ObjectKind::NineSlice => "nine slice",
        }
    }

    /// Kinds owned by the animation subsystem.
    #[inline(always)]
    pub fn is_sequence_family(self) -> bool {
        (self as u32) >= ObjectKind::Sequence as u32
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// Treated as a mark root by every collection pass.
        const ROOT = 1 << 0;
        /// Property definition is refused with a type error.
        const SEALED = 1 << 1;
    }
}

/// Tri-state result of property definition and `has_instance` checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TriBool {
    False = 0,
    True = 1,
    TypeError = 2,
}

impl From<bool> for TriBool {
    fn from(value: bool) -> Self {
        if value { TriBool::True } else { TriBool::False }
    }
}

// ── property capabilities ───────────────────────────────────────────────────

/// Read a property copy. `Ok(None)` means the object has no such property.
pub type GetOwnFn = fn(&mut Runtime, ObjectId, &str) -> Result<Option<Value>, RuntimeError>;

/// Remove a property, returning the owned value to the caller. The `bool`
/// carries caller intent through to the capability; the sparse default
/// ignores it.
pub type DeleteFn = fn(&mut Runtime, ObjectId, &str, bool) -> Result<Option<Value>, RuntimeError>;

/// Define or overwrite a property from a borrowed value. `TypeError` marks
/// sealed objects, constant slots, and accessor collisions.
pub type DefineOwnFn = fn(&mut Runtime, ObjectId, &str, &Value, bool) -> Result<TriBool, RuntimeError>;

/// Instance-of check hook carried by script references.
pub type HasInstanceFn = fn(&mut Runtime, ObjectId, &Value) -> TriBool;

/// Constructor hook carried by script references: (self, other, args).
pub type ConstructFn =
    fn(&mut Runtime, ObjectId, Option<ObjectId>, &[Value]) -> Result<Value, RuntimeError>;

/// Per-object property dispatch, fixed at construction. Behavior varies by
/// data, not by subtype: generated object kinds swap these pointers instead
/// of overriding methods.
#[derive(Clone, Copy)]
pub struct Capabilities {
    pub get_own: GetOwnFn,
    pub delete_own: DeleteFn,
    pub define_own: DefineOwnFn,
}

impl Capabilities {
    /// Storage policy backed by the per-object sparse map and the shared
    /// slot pool.
    pub fn sparse() -> Self {
        Self {
            get_own: sparse_get_own,
            delete_own: sparse_delete_own,
            define_own: sparse_define_own,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::sparse()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Capabilities { .. }")
    }
}

/// Default get-own: name lookup through the interning table, then the
/// object's sparse map. Handle payloads are copied with a count bump.
pub fn sparse_get_own(
    rt: &mut Runtime,
    id: ObjectId,
    name: &str,
) -> Result<Option<Value>, RuntimeError> {
    let Runtime {
        names,
        objects,
        slots,
        strings,
        ..
    } = rt;
    let Some(var) = names.lookup(name) else {
        return Ok(None);
    };
    let Some(obj) = objects.get(id) else {
        return Err(RuntimeError::StaleReference);
    };
    let Some(slot) = obj.var_slot(var) else {
        return Ok(None);
    };
    let Some(current) = slots.get(slot) else {
        debug_assert!(false, "mapped variable {var:?} without a slot");
        return Ok(None);
    };
    Ok(Some(current.clone_raw(strings, objects)))
}

/// Default delete: unmaps the name and hands the owned value back. The
/// emptied slot is recycled through the deferred queue so outstanding
/// variable references stay valid until the next drain.
pub fn sparse_delete_own(
    rt: &mut Runtime,
    id: ObjectId,
    name: &str,
    _strict: bool,
) -> Result<Option<Value>, RuntimeError> {
    let Some(var) = rt.names.lookup(name) else {
        return Ok(None);
    };
    let Some(obj) = rt.objects.get_mut(id) else {
        return Err(RuntimeError::StaleReference);
    };
    let Some(vars) = obj.vars.as_deref_mut() else {
        return Ok(None);
    };
    let Some(slot) = vars.remove(var) else {
        return Ok(None);
    };
    let value = rt.slots.take(slot);
    rt.gc.stage_slot(slot);
    Ok(value)
}

/// Default define-own: interns the name, stores a counted copy into the
/// slot pool, and releases whatever the slot held before. Sealed objects,
/// constant slots, and accessor-typed slots refuse with `TypeError`.
pub fn sparse_define_own(
    rt: &mut Runtime,
    id: ObjectId,
    name: &str,
    value: &Value,
    _strict: bool,
) -> Result<TriBool, RuntimeError> {
    let var = rt.names.intern(name)?;
    let Some(obj) = rt.objects.get(id) else {
        return Err(RuntimeError::StaleReference);
    };
    if obj.flags.contains(ObjectFlags::SEALED) {
        return Ok(TriBool::TypeError);
    }

    if let Some(slot) = obj.var_slot(var) {
        let Some(current) = rt.slots.get(slot) else {
            debug_assert!(false, "mapped variable {var:?} without a slot");
            return Ok(TriBool::False);
        };
        if current.kind() == ValueKind::Accessor
            || current.flags().contains(ValueFlags::CONSTANT)
        {
            return Ok(TriBool::TypeError);
        }
        let stored = value.clone_with(rt);
        if let Some(slot_value) = rt.slots.get_mut(slot) {
            let old = std::mem::replace(slot_value, stored);
            rt.release(old);
        }
        return Ok(TriBool::True);
    }

    let slot = rt.slots.alloc()?;
    let stored = value.clone_with(rt);
    if let Some(slot_value) = rt.slots.get_mut(slot) {
        *slot_value = stored;
    }
    let Some(obj) = rt.objects.get_mut(id) else {
        // The object died while we allocated; undo the slot.
        let value = rt.slots.take(slot);
        if let Some(value) = value {
            rt.release(value);
        }
        rt.gc.stage_slot(slot);
        return Err(RuntimeError::StaleReference);
    };
    obj.vars_mut_or_init().insert(var, slot)?;
    Ok(TriBool::True)
}

// ── GC hooks ────────────────────────────────────────────────────────────────

/// Marking hook: set the object's bit and queue children onto the marker's
/// worklist. Returns `false` when the object could not be marked (out of
/// the bitmap's bound, already marked, or the kind carries no marking
/// logic), which the collector treats as "unmarkable", never as an error.
pub type MarkFn = fn(&ObjectHeap, &SlotPool, ObjectId, &mut Marker) -> bool;

/// Teardown that may still touch other doomed objects; runs for every
/// doomed object before any storage is released.
pub type PreFreeFn = fn(&mut Runtime, ObjectId);

/// Storage teardown. The immediate variant releases counts on the spot;
/// the threaded variant stages everything into the pending queues.
pub type TeardownFn = fn(&mut Runtime, ObjectId);

/// Per-object GC protocol, fixed at construction like [`Capabilities`].
/// The fail-safe default marks nothing, so a kind that forgets to supply
/// marking logic is swept rather than crashed on.
#[derive(Clone, Copy)]
pub struct GcHooks {
    pub mark: MarkFn,
    pub mark_this_only: MarkFn,
    pub mark_children_only: MarkFn,
    pub pre_free: PreFreeFn,
    pub free: TeardownFn,
    pub thread_free: TeardownFn,
}

impl GcHooks {
    /// The no-op protocol: nothing is markable, teardown releases nothing.
    pub fn fail_safe() -> Self {
        Self {
            mark: unmarkable,
            mark_this_only: unmarkable,
            mark_children_only: unmarkable,
            pre_free: teardown_noop,
            free: teardown_noop,
            thread_free: teardown_noop,
        }
    }

    /// Hooks for plain variable-bearing objects.
    pub fn instance() -> Self {
        Self {
            mark: mark_instance,
            mark_this_only: mark_self,
            mark_children_only: mark_instance_children,
            pre_free: teardown_noop,
            free: free_instance,
            thread_free: thread_free_instance,
        }
    }

    /// Hooks for dynamic arrays: elements are traced and released along
    /// with any named variables.
    pub fn array() -> Self {
        Self {
            mark: mark_array,
            mark_this_only: mark_self,
            mark_children_only: mark_array_children,
            pre_free: teardown_noop,
            free: free_array,
            thread_free: thread_free_array,
        }
    }

    /// Hooks for weak references: the target is deliberately not traced.
    pub fn weak_ref() -> Self {
        Self {
            mark: mark_self,
            mark_this_only: mark_self,
            mark_children_only: unmarkable,
            pre_free: teardown_noop,
            free: free_instance,
            thread_free: thread_free_instance,
        }
    }

    /// Hooks for script references: bound scope and `this` are traced and
    /// released.
    pub fn script_ref() -> Self {
        Self {
            mark: mark_script_ref,
            mark_this_only: mark_self,
            mark_children_only: mark_script_ref_children,
            pre_free: teardown_noop,
            free: free_script_ref,
            thread_free: thread_free_script_ref,
        }
    }

    /// The protocol matching a kind. Sequence-family kinds belong to an
    /// external subsystem and fall back to the fail-safe default.
    pub fn for_kind(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Array => Self::array(),
            ObjectKind::WeakRef => Self::weak_ref(),
            ObjectKind::ScriptRef => Self::script_ref(),
            _ if kind.is_sequence_family() => Self::fail_safe(),
            _ => Self::instance(),
        }
    }
}

impl Default for GcHooks {
    fn default() -> Self {
        Self::fail_safe()
    }
}

impl std::fmt::Debug for GcHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GcHooks { .. }")
    }
}

fn unmarkable(_heap: &ObjectHeap, _slots: &SlotPool, _id: ObjectId, _marker: &mut Marker) -> bool {
    false
}

fn teardown_noop(_rt: &mut Runtime, _id: ObjectId) {}

fn mark_self(_heap: &ObjectHeap, _slots: &SlotPool, id: ObjectId, marker: &mut Marker) -> bool {
    marker.mark(id)
}

fn enqueue_var_children(heap: &ObjectHeap, slots: &SlotPool, id: ObjectId, marker: &mut Marker) {
    let Some(obj) = heap.get(id) else { return };
    let Some(vars) = obj.vars.as_deref() else { return };
    for slot in vars.values() {
        if let Some(child) = slots.get(*slot).and_then(Value::object_edge) {
            marker.enqueue(child);
        }
    }
}

fn mark_instance(heap: &ObjectHeap, slots: &SlotPool, id: ObjectId, marker: &mut Marker) -> bool {
    if !marker.mark(id) {
        return false;
    }
    enqueue_var_children(heap, slots, id, marker);
    true
}

fn mark_instance_children(
    heap: &ObjectHeap,
    slots: &SlotPool,
    id: ObjectId,
    marker: &mut Marker,
) -> bool {
    enqueue_var_children(heap, slots, id, marker);
    true
}

fn enqueue_array_children(heap: &ObjectHeap, slots: &SlotPool, id: ObjectId, marker: &mut Marker) {
    enqueue_var_children(heap, slots, id, marker);
    let Some(body) = heap.get(id).and_then(HeapObject::as_array) else {
        return;
    };
    for element in &body.elements {
        if let Some(child) = element.object_edge() {
            marker.enqueue(child);
        }
    }
}

fn mark_array(heap: &ObjectHeap, slots: &SlotPool, id: ObjectId, marker: &mut Marker) -> bool {
    if !marker.mark(id) {
        return false;
    }
    enqueue_array_children(heap, slots, id, marker);
    true
}

fn mark_array_children(
    heap: &ObjectHeap,
    slots: &SlotPool,
    id: ObjectId,
    marker: &mut Marker,
) -> bool {
    enqueue_array_children(heap, slots, id, marker);
    true
}

fn enqueue_script_ref_children(
    heap: &ObjectHeap,
    slots: &SlotPool,
    id: ObjectId,
    marker: &mut Marker,
) {
    enqueue_var_children(heap, slots, id, marker);
    let Some(body) = heap.get(id).and_then(HeapObject::script_ref) else {
        return;
    };
    if let Some(child) = body.scope.object_edge() {
        marker.enqueue(child);
    }
    if let Some(child) = body.bound_this.object_edge() {
        marker.enqueue(child);
    }
    if let Some(stat) = body.static_object {
        marker.enqueue(stat);
    }
}

fn mark_script_ref(heap: &ObjectHeap, slots: &SlotPool, id: ObjectId, marker: &mut Marker) -> bool {
    if !marker.mark(id) {
        return false;
    }
    enqueue_script_ref_children(heap, slots, id, marker);
    true
}

fn mark_script_ref_children(
    heap: &ObjectHeap,
    slots: &SlotPool,
    id: ObjectId,
    marker: &mut Marker,
) -> bool {
    enqueue_script_ref_children(heap, slots, id, marker);
    true
}

fn drain_vars(rt: &mut Runtime, id: ObjectId) -> Vec<(SlotId, Value)> {
    let Some(vars) = rt.objects.detach_vars(id) else {
        return Vec::new();
    };
    let mut drained = Vec::with_capacity(vars.len());
    for (_, slot) in vars.into_entries() {
        if let Some(value) = rt.slots.take(slot) {
            drained.push((slot, value));
        }
    }
    drained
}

fn free_instance(rt: &mut Runtime, id: ObjectId) {
    for (slot, value) in drain_vars(rt, id) {
        rt.release_now(value);
        rt.slots.recycle(slot);
    }
}

fn thread_free_instance(rt: &mut Runtime, id: ObjectId) {
    for (slot, value) in drain_vars(rt, id) {
        rt.gc.stage_value(value);
        rt.gc.stage_slot(slot);
    }
}

fn free_array(rt: &mut Runtime, id: ObjectId) {
    free_instance(rt, id);
    for element in rt.objects.detach_array_elements(id) {
        rt.release_now(element);
    }
}

fn thread_free_array(rt: &mut Runtime, id: ObjectId) {
    thread_free_instance(rt, id);
    for element in rt.objects.detach_array_elements(id) {
        rt.gc.stage_value(element);
    }
}

fn free_script_ref(rt: &mut Runtime, id: ObjectId) {
    free_instance(rt, id);
    if let Some((scope, bound_this)) = rt.objects.detach_script_bindings(id) {
        rt.release_now(scope);
        rt.release_now(bound_this);
    }
}

fn thread_free_script_ref(rt: &mut Runtime, id: ObjectId) {
    thread_free_instance(rt, id);
    if let Some((scope, bound_this)) = rt.objects.detach_script_bindings(id) {
        rt.gc.stage_value(scope);
        rt.gc.stage_value(bound_this);
    }
}

// ── heap object ─────────────────────────────────────────────────────────────

/// Kind-specific payload of a heap object.
#[derive(Debug)]
pub enum ObjectBody {
    Plain,
    Array(ArrayBody),
    WeakRef { target: Option<ObjectId> },
    ScriptRef(Box<ScriptRefBody>),
}

/// Dynamic-array payload. Arrays carry their own reference count: values
/// holding the array bump it, and the body is torn down when it reaches
/// zero or when the collector proves the object unreachable, whichever
/// happens first.
#[derive(Debug)]
pub struct ArrayBody {
    pub(crate) count: u32,
    pub elements: Vec<Value>,
    pub owner: i64,
    pub visited: u32,
}

impl ArrayBody {
    pub(crate) fn new(elements: Vec<Value>) -> Self {
        Self {
            count: 1,
            elements,
            owner: -1,
            visited: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[inline(always)]
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// The polymorphic heap allocation unit: list linkage, prototype edge,
/// dispatch capabilities, GC hooks, sparse variable storage, and the
/// kind-specific body.
#[derive(Debug)]
pub struct HeapObject {
    pub(crate) next: Option<ObjectId>,
    pub(crate) prev: Option<ObjectId>,
    /// Non-owning: never counted, never traced. Readers must tolerate the
    /// prototype dying first.
    pub prototype: Option<ObjectId>,
    pub class_name: Option<Box<str>>,
    pub capabilities: Capabilities,
    pub(crate) hooks: GcHooks,
    pub(crate) vars: Option<Box<SparseMap<VarId, SlotId>>>,
    pub(crate) weak_refs: Vec<ObjectId>,
    pub flags: ObjectFlags,
    pub visited: u32,
    pub visited_gc: u32,
    pub gc_generation: i32,
    pub creation_frame: i32,
    kind: ObjectKind,
    pub(crate) body: ObjectBody,
}

impl HeapObject {
    pub(crate) fn new(
        kind: ObjectKind,
        capabilities: Capabilities,
        hooks: GcHooks,
        body: ObjectBody,
    ) -> Self {
        Self {
            next: None,
            prev: None,
            prototype: None,
            class_name: None,
            capabilities,
            hooks,
            vars: None,
            weak_refs: Vec::new(),
            flags: ObjectFlags::empty(),
            visited: 0,
            visited_gc: 0,
            gc_generation: 0,
            creation_frame: 0,
            kind,
            body,
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Number of named variables.
    pub fn nvars(&self) -> usize {
        self.vars.as_deref().map_or(0, SparseMap::len)
    }

    /// Allocated capacity of the variable map.
    pub fn var_capacity(&self) -> usize {
        self.vars.as_deref().map_or(0, SparseMap::capacity)
    }

    pub fn var_slot(&self, var: VarId) -> Option<SlotId> {
        self.vars.as_deref()?.get(var).copied()
    }

    pub(crate) fn vars_mut_or_init(&mut self) -> &mut SparseMap<VarId, SlotId> {
        self.vars.get_or_insert_with(|| Box::new(SparseMap::new()))
    }

    pub fn as_array(&self) -> Option<&ArrayBody> {
        match &self.body {
            ObjectBody::Array(body) => Some(body),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ArrayBody> {
        match &mut self.body {
            ObjectBody::Array(body) => Some(body),
            _ => None,
        }
    }

    pub fn script_ref(&self) -> Option<&ScriptRefBody> {
        match &self.body {
            ObjectBody::ScriptRef(body) => Some(body),
            _ => None,
        }
    }

    pub fn script_ref_mut(&mut self) -> Option<&mut ScriptRefBody> {
        match &mut self.body {
            ObjectBody::ScriptRef(body) => Some(body),
            _ => None,
        }
    }

    /// Weak-reference target, if this object is a live weak reference.
    pub fn weak_target(&self) -> Option<ObjectId> {
        match &self.body {
            ObjectBody::WeakRef { target } => *target,
            _ => None,
        }
    }
}
