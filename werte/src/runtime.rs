use log::debug;

use crate::code::{CallTarget, CodeRegistry, NativeCallFn, ScriptId, ScriptRefBody, ScriptRegistry};
use crate::error::RuntimeError;
use crate::gc::GcContext;
use crate::heap::{ObjectHeap, ObjectId};
use crate::names::{NameTable, VarId};
use crate::object::{
    ArrayBody, Capabilities, GcHooks, HeapObject, ObjectBody, ObjectFlags, ObjectKind, TriBool,
};
use crate::refs::StrArena;
use crate::slots::{SlotId, SlotPool};
use crate::value::{Value, ValueKind};

/// Construction-time knobs.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// String handles preallocated up front.
    pub string_capacity: usize,
    /// Frame counter the first allocations are stamped with.
    pub initial_frame: i32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            string_capacity: 256,
            initial_frame: 0,
        }
    }
}

/// The value/object core. Owns every arena and registry; all mutation goes
/// through `&mut self`, which is also the single-writer discipline the
/// plain (non-atomic) reference counts rely on.
pub struct Runtime {
    pub(crate) names: NameTable,
    pub(crate) strings: StrArena,
    pub(crate) objects: ObjectHeap,
    pub(crate) slots: SlotPool,
    pub(crate) gc: GcContext,
    pub(crate) code: CodeRegistry,
    pub(crate) scripts: ScriptRegistry,
    pub(crate) gc_epoch: u32,
    frame: i32,
    settings: RuntimeSettings,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_settings(RuntimeSettings::default())
    }

    pub fn with_settings(settings: RuntimeSettings) -> Self {
        debug!(
            "runtime up: {} string handles preallocated, frame {}",
            settings.string_capacity, settings.initial_frame
        );
        Self {
            names: NameTable::new(),
            strings: StrArena::with_capacity(settings.string_capacity),
            objects: ObjectHeap::new(),
            slots: SlotPool::new(),
            gc: GcContext::new(),
            code: CodeRegistry::new(),
            scripts: ScriptRegistry::new(),
            gc_epoch: 0,
            frame: settings.initial_frame,
            settings,
        }
    }

    // ── accessors ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn names(&self) -> &NameTable {
        &self.names
    }

    #[inline(always)]
    pub fn strings(&self) -> &StrArena {
        &self.strings
    }

    #[inline(always)]
    pub fn objects(&self) -> &ObjectHeap {
        &self.objects
    }

    #[inline(always)]
    pub fn objects_mut(&mut self) -> &mut ObjectHeap {
        &mut self.objects
    }

    #[inline(always)]
    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    #[inline(always)]
    pub fn gc(&self) -> &GcContext {
        &self.gc
    }

    #[inline(always)]
    pub fn code(&self) -> &CodeRegistry {
        &self.code
    }

    #[inline(always)]
    pub fn code_mut(&mut self) -> &mut CodeRegistry {
        &mut self.code
    }

    #[inline(always)]
    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    #[inline(always)]
    pub fn scripts_mut(&mut self) -> &mut ScriptRegistry {
        &mut self.scripts
    }

    #[inline(always)]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn gc_epoch(&self) -> u32 {
        self.gc_epoch
    }

    #[inline(always)]
    pub fn frame(&self) -> i32 {
        self.frame
    }

    /// Advance the frame counter new allocations are stamped with.
    pub fn advance_frame(&mut self) -> i32 {
        self.frame += 1;
        self.frame
    }

    /// Intern a variable name.
    pub fn intern(&mut self, name: &str) -> Result<VarId, RuntimeError> {
        self.names.intern(name)
    }

    // ── allocation ─────────────────────────────────────────────────

    /// Allocate a counted string and wrap it in a value. The returned
    /// value owns the initial count.
    pub fn alloc_string(&mut self, text: &str) -> Value {
        Value::string(self.strings.alloc_str(text))
    }

    /// Allocate an object of `kind` with the default sparse storage and
    /// the kind's hook preset. Arrays allocated this way keep a count
    /// floor of one and live until swept; script references need a body
    /// and come from [`Runtime::alloc_script_ref`].
    pub fn alloc_object(&mut self, kind: ObjectKind) -> Result<ObjectId, RuntimeError> {
        debug_assert!(
            kind != ObjectKind::ScriptRef,
            "script refs carry a call target; use alloc_script_ref"
        );
        let body = match kind {
            ObjectKind::Array => ObjectBody::Array(ArrayBody::new(Vec::new())),
            ObjectKind::WeakRef => ObjectBody::WeakRef { target: None },
            _ => ObjectBody::Plain,
        };
        self.alloc_object_with(kind, Capabilities::sparse(), GcHooks::for_kind(kind), body)
    }

    /// Full-control allocation for externally generated object kinds:
    /// capabilities, hooks, and body are taken as-is.
    pub fn alloc_object_with(
        &mut self,
        kind: ObjectKind,
        capabilities: Capabilities,
        hooks: GcHooks,
        body: ObjectBody,
    ) -> Result<ObjectId, RuntimeError> {
        let mut object = HeapObject::new(kind, capabilities, hooks, body);
        object.gc_generation = self.gc_epoch as i32;
        object.creation_frame = self.frame;
        self.objects.insert(object)
    }

    /// Allocate a dynamic array owning `elements`. The returned value
    /// holds the initial count.
    pub fn alloc_array(&mut self, elements: Vec<Value>) -> Result<Value, RuntimeError> {
        let id = self.alloc_object_with(
            ObjectKind::Array,
            Capabilities::sparse(),
            GcHooks::array(),
            ObjectBody::Array(ArrayBody::new(elements)),
        )?;
        Ok(Value::array(id))
    }

    /// Allocate a script reference around a prepared body.
    pub fn alloc_script_ref(&mut self, body: ScriptRefBody) -> Result<ObjectId, RuntimeError> {
        self.alloc_object_with(
            ObjectKind::ScriptRef,
            Capabilities::sparse(),
            GcHooks::script_ref(),
            ObjectBody::ScriptRef(Box::new(body)),
        )
    }

    /// Allocate a weak reference watching `target`.
    pub fn alloc_weak_ref(&mut self, target: ObjectId) -> Result<ObjectId, RuntimeError> {
        if !self.objects.contains(target) {
            return Err(RuntimeError::StaleReference);
        }
        let weak = self.alloc_object_with(
            ObjectKind::WeakRef,
            Capabilities::sparse(),
            GcHooks::weak_ref(),
            ObjectBody::WeakRef { target: None },
        )?;
        self.objects.register_weak(weak, target)?;
        Ok(weak)
    }

    /// Dereference a weak reference. Fails with [`RuntimeError::StaleReference`]
    /// once the target (or the weak reference itself) has died.
    pub fn weak_target(&self, weak: ObjectId) -> Result<ObjectId, RuntimeError> {
        let Some(obj) = self.objects.get(weak) else {
            return Err(RuntimeError::StaleReference);
        };
        obj.weak_target().ok_or(RuntimeError::StaleReference)
    }

    /// Flag an object as a collection root. Returns whether the object
    /// was alive to flag.
    pub fn pin(&mut self, id: ObjectId) -> bool {
        match self.objects.get_mut(id) {
            Some(obj) => {
                obj.flags.insert(ObjectFlags::ROOT);
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, id: ObjectId) -> bool {
        match self.objects.get_mut(id) {
            Some(obj) => {
                obj.flags.remove(ObjectFlags::ROOT);
                true
            }
            None => false,
        }
    }

    /// Label an object with the class it was built from. Returns whether
    /// the object was alive to label.
    pub fn set_class_name(&mut self, id: ObjectId, name: &str) -> bool {
        match self.objects.get_mut(id) {
            Some(obj) => {
                obj.class_name = Some(name.into());
                true
            }
            None => false,
        }
    }

    pub fn class_name(&self, id: ObjectId) -> Option<&str> {
        self.objects.get(id)?.class_name.as_deref()
    }

    // ── properties ─────────────────────────────────────────────────

    /// Read a property through the object's get-own capability. The
    /// returned value is an owned counted copy.
    pub fn get(&mut self, obj: ObjectId, name: &str) -> Result<Option<Value>, RuntimeError> {
        let Some(get_own) = self.objects.get(obj).map(|o| o.capabilities.get_own) else {
            return Err(RuntimeError::StaleReference);
        };
        get_own(self, obj, name)
    }

    /// Define a property through the define-own capability, surfacing the
    /// raw tri-state.
    pub fn define_property(
        &mut self,
        obj: ObjectId,
        name: &str,
        value: &Value,
        strict: bool,
    ) -> Result<TriBool, RuntimeError> {
        let Some(define_own) = self.objects.get(obj).map(|o| o.capabilities.define_own) else {
            return Err(RuntimeError::StaleReference);
        };
        define_own(self, obj, name, value, strict)
    }

    /// Store a property copy. `TypeError` from the capability surfaces as
    /// [`RuntimeError::TypeMismatch`]; `false` means the capability
    /// declined without an error.
    pub fn set(&mut self, obj: ObjectId, name: &str, value: &Value) -> Result<bool, RuntimeError> {
        match self.define_property(obj, name, value, false)? {
            TriBool::True => Ok(true),
            TriBool::False => Ok(false),
            TriBool::TypeError => Err(RuntimeError::TypeMismatch {
                expected: "a writable property slot",
                got: value.kind(),
            }),
        }
    }

    /// Remove a property through the delete capability, releasing the
    /// removed value. Returns whether anything was removed.
    pub fn delete(&mut self, obj: ObjectId, name: &str) -> Result<bool, RuntimeError> {
        let Some(delete_own) = self.objects.get(obj).map(|o| o.capabilities.delete_own) else {
            return Err(RuntimeError::StaleReference);
        };
        match delete_own(self, obj, name, false)? {
            Some(removed) => {
                self.release(removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── variable slots ─────────────────────────────────────────────

    /// Direct reference to a variable slot by interned id, creating the
    /// slot (holding `undefined`) on first touch. This bypasses the
    /// property capabilities; interpreters use it for indexed access.
    pub fn var_ref(&mut self, obj: ObjectId, var: VarId) -> Result<&mut Value, RuntimeError> {
        let existing = match self.objects.get(obj) {
            None => return Err(RuntimeError::StaleReference),
            Some(o) => o.var_slot(var),
        };
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let slot = self.slots.alloc()?;
                let Some(obj) = self.objects.get_mut(obj) else {
                    self.slots.recycle(slot);
                    return Err(RuntimeError::StaleReference);
                };
                if let Err(err) = obj.vars_mut_or_init().insert(var, slot) {
                    self.slots.recycle(slot);
                    return Err(err);
                }
                slot
            }
        };
        match self.slots.get_mut(slot) {
            Some(value) => Ok(value),
            None => {
                debug_assert!(false, "mapped variable {var:?} without a slot");
                Err(RuntimeError::StaleReference)
            }
        }
    }

    /// The slot currently backing a variable, if the object has one.
    pub fn var_slot(&self, obj: ObjectId, var: VarId) -> Option<SlotId> {
        self.objects.get(obj)?.var_slot(var)
    }

    // ── arrays ─────────────────────────────────────────────────────

    pub fn array_len(&self, array: &Value) -> Result<usize, RuntimeError> {
        let id = array.as_array().ok_or_else(|| RuntimeError::TypeMismatch {
            expected: "array",
            got: array.kind(),
        })?;
        let body = self
            .objects
            .get(id)
            .and_then(|obj| obj.as_array())
            .ok_or(RuntimeError::StaleReference)?;
        Ok(body.len())
    }

    /// Append an owned value to an array.
    pub fn array_push(&mut self, array: &Value, value: Value) -> Result<(), RuntimeError> {
        let id = array.as_array().ok_or_else(|| RuntimeError::TypeMismatch {
            expected: "array",
            got: array.kind(),
        })?;
        let body = self
            .objects
            .get_mut(id)
            .and_then(|obj| obj.as_array_mut())
            .ok_or(RuntimeError::StaleReference)?;
        body.elements.push(value);
        Ok(())
    }

    /// Copy an element out of an array, counts bumped.
    pub fn array_get(&mut self, array: &Value, index: usize) -> Result<Option<Value>, RuntimeError> {
        let id = array.as_array().ok_or_else(|| RuntimeError::TypeMismatch {
            expected: "array",
            got: array.kind(),
        })?;
        let Runtime {
            objects, strings, ..
        } = self;
        let Some(body) = objects.get(id).and_then(|obj| obj.as_array()) else {
            return Err(RuntimeError::StaleReference);
        };
        let Some(element) = body.elements.get(index) else {
            return Ok(None);
        };
        if let Some(copy) = element.copy_immediate() {
            return Ok(Some(copy));
        }
        let flags = element.flags();
        if let Some(string) = element.as_string() {
            strings.inc(string);
            return Ok(Some(Value::string(string).with_flags(flags)));
        }
        if let Some(nested) = element.as_array() {
            objects.inc_array(nested);
            return Ok(Some(Value::array(nested).with_flags(flags)));
        }
        debug_assert!(false, "copy_immediate covers every non-counted kind");
        Ok(None)
    }

    // ── script references ──────────────────────────────────────────

    /// Invoke a script reference's call target. Script targets resolve
    /// through the registry and require a registered native entry; source
    /// forms belong to the interpreter.
    pub fn call(
        &mut self,
        script_ref: ObjectId,
        other: Option<ObjectId>,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        enum Resolved {
            Direct(NativeCallFn),
            Script(ScriptId),
        }

        let Some(obj) = self.objects.get(script_ref) else {
            return Err(RuntimeError::StaleReference);
        };
        let Some(body) = obj.script_ref() else {
            return Err(RuntimeError::TypeMismatch {
                expected: "a script reference",
                got: ValueKind::Object,
            });
        };
        let bound_self = body.bound_this.object_edge();
        let resolved = match &body.target {
            CallTarget::Native(func) | CallTarget::Compiled(func) => Resolved::Direct(*func),
            CallTarget::Script(id) => Resolved::Script(*id),
        };

        match resolved {
            Resolved::Direct(func) => func(self, bound_self, other, args),
            Resolved::Script(id) => {
                let native = self
                    .scripts
                    .get(id)
                    .and_then(|script| script.native.as_ref())
                    .map(|native| native.func);
                match native {
                    Some(func) => func(self, bound_self, other, args),
                    None => Err(RuntimeError::TypeMismatch {
                        expected: "a script with a registered native entry",
                        got: ValueKind::Object,
                    }),
                }
            }
        }
    }

    /// Run the reference's `has_instance` hook; references without one
    /// answer `False`.
    pub fn has_instance(
        &mut self,
        script_ref: ObjectId,
        value: &Value,
    ) -> Result<TriBool, RuntimeError> {
        let Some(obj) = self.objects.get(script_ref) else {
            return Err(RuntimeError::StaleReference);
        };
        let Some(body) = obj.script_ref() else {
            return Err(RuntimeError::TypeMismatch {
                expected: "a script reference",
                got: ValueKind::Object,
            });
        };
        match body.has_instance {
            Some(hook) => Ok(hook(self, script_ref, value)),
            None => Ok(TriBool::False),
        }
    }

    /// Run the reference's constructor hook.
    pub fn construct(
        &mut self,
        script_ref: ObjectId,
        other: Option<ObjectId>,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let Some(obj) = self.objects.get(script_ref) else {
            return Err(RuntimeError::StaleReference);
        };
        let Some(body) = obj.script_ref() else {
            return Err(RuntimeError::TypeMismatch {
                expected: "a script reference",
                got: ValueKind::Object,
            });
        };
        match body.construct {
            Some(hook) => hook(self, script_ref, other, args),
            None => Err(RuntimeError::TypeMismatch {
                expected: "a constructable script reference",
                got: ValueKind::Object,
            }),
        }
    }

    // ── direct teardown ────────────────────────────────────────────

    /// Tear an object down outside a collection pass: watchers nulled,
    /// pre-free, immediate storage release, record freed, cascades
    /// drained. Returns whether the object was alive.
    pub fn free_object_now(&mut self, id: ObjectId) -> bool {
        let Some(hooks) = self.objects.get(id).map(|o| o.hooks) else {
            return false;
        };
        self.objects.clear_watchers(id);
        (hooks.pre_free)(self, id);
        (hooks.free)(self, id);
        self.objects.free_object(id);
        self.drain_pending();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{NativeFunction, ScriptUnit};
    use crate::value::ValueFlags;

    #[test]
    fn set_then_get_round_trips_int32_through_the_sparse_map() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();

        assert!(rt.set(obj, "x", &Value::int32(42)).unwrap());
        let out = rt.get(obj, "x").unwrap().unwrap();
        assert_eq!(out.to_i32().unwrap(), 42);
        assert_eq!(rt.objects().get(obj).unwrap().nvars(), 1);
    }

    #[test]
    fn get_of_an_unknown_property_is_none() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        assert!(rt.get(obj, "missing").unwrap().is_none());

        rt.set(obj, "present", &Value::real(1.0)).unwrap();
        assert!(rt.get(obj, "missing").unwrap().is_none());
    }

    #[test]
    fn class_names_stick_to_their_objects() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        assert!(rt.class_name(obj).is_none());

        assert!(rt.set_class_name(obj, "player"));
        assert_eq!(rt.class_name(obj), Some("player"));

        rt.free_object_now(obj);
        assert!(!rt.set_class_name(obj, "ghost"));
        assert!(rt.class_name(obj).is_none());
    }

    #[test]
    fn property_copies_bump_string_counts() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        let text = rt.alloc_string("payload");
        let id = text.as_string().unwrap();
        assert_eq!(rt.strings().count(id), Some(1));

        rt.set(obj, "s", &text).unwrap();
        assert_eq!(rt.strings().count(id), Some(2));

        let copy = rt.get(obj, "s").unwrap().unwrap();
        assert_eq!(rt.strings().count(id), Some(3));

        rt.release(text);
        rt.release(copy);
        rt.drain_pending();
        assert_eq!(rt.strings().count(id), Some(1), "the slot keeps one");
    }

    #[test]
    fn overwriting_a_property_releases_the_old_value() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        let text = rt.alloc_string("old");
        rt.set(obj, "v", &text).unwrap();
        rt.release(text);
        rt.drain_pending();
        assert_eq!(rt.strings().live(), 1);

        rt.set(obj, "v", &Value::int32(9)).unwrap();
        rt.drain_pending();
        assert_eq!(rt.strings().live(), 0);
        assert_eq!(rt.get(obj, "v").unwrap().unwrap().to_i32().unwrap(), 9);
    }

    #[test]
    fn constant_slots_refuse_redefinition() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        let pinned = Value::int32(1).with_flags(ValueFlags::CONSTANT);
        rt.set(obj, "k", &pinned).unwrap();

        assert_eq!(
            rt.define_property(obj, "k", &Value::int32(2), false).unwrap(),
            TriBool::TypeError
        );
        assert!(matches!(
            rt.set(obj, "k", &Value::int32(2)),
            Err(RuntimeError::TypeMismatch { .. })
        ));
        assert_eq!(rt.get(obj, "k").unwrap().unwrap().to_i32().unwrap(), 1);
    }

    #[test]
    fn sealed_objects_refuse_definition() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        rt.objects_mut()
            .get_mut(obj)
            .unwrap()
            .flags
            .insert(ObjectFlags::SEALED);

        assert_eq!(
            rt.define_property(obj, "x", &Value::int32(1), false).unwrap(),
            TriBool::TypeError
        );
        assert!(rt.get(obj, "x").unwrap().is_none());
    }

    #[test]
    fn delete_removes_the_property_and_frees_its_payload() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        let text = rt.alloc_string("doomed");
        rt.set(obj, "s", &text).unwrap();
        rt.release(text);
        rt.drain_pending();

        assert!(rt.delete(obj, "s").unwrap());
        assert!(rt.get(obj, "s").unwrap().is_none());
        assert!(!rt.delete(obj, "s").unwrap());
        rt.drain_pending();
        assert_eq!(rt.strings().live(), 0);
    }

    #[test]
    fn operations_on_dead_objects_report_stale() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        assert!(rt.free_object_now(obj));

        assert!(matches!(
            rt.get(obj, "x"),
            Err(RuntimeError::StaleReference)
        ));
        assert!(matches!(
            rt.set(obj, "x", &Value::int32(1)),
            Err(RuntimeError::StaleReference)
        ));
        assert!(matches!(
            rt.delete(obj, "x"),
            Err(RuntimeError::StaleReference)
        ));
        assert!(!rt.free_object_now(obj));
    }

    #[test]
    fn var_refs_create_undefined_slots_on_first_touch() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        let hp = rt.intern("hp").unwrap();
        assert!(rt.var_slot(obj, hp).is_none());

        assert!(rt.var_ref(obj, hp).unwrap().is_undefined());
        assert!(rt.var_slot(obj, hp).is_some());

        *rt.var_ref(obj, hp).unwrap() = Value::int32(5);
        // The property surface and the indexed surface share storage.
        assert_eq!(rt.get(obj, "hp").unwrap().unwrap().to_i32().unwrap(), 5);
    }

    #[test]
    fn free_object_now_releases_storage_immediately() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        let text = rt.alloc_string("held");
        rt.set(obj, "s", &text).unwrap();
        rt.release(text);
        rt.drain_pending();
        assert_eq!(rt.strings().live(), 1);

        assert!(rt.free_object_now(obj));
        assert_eq!(rt.strings().live(), 0);
        assert_eq!(rt.objects().live(), 0);
    }

    #[test]
    fn prototype_edges_neither_own_nor_extend_lifetimes() {
        let mut rt = Runtime::new();
        let proto = rt.alloc_object(ObjectKind::Instance).unwrap();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        rt.objects_mut().get_mut(obj).unwrap().prototype = Some(proto);
        rt.pin(obj);

        rt.collect();
        // The prototype was not traced, so it died; the edge stays and
        // simply stops resolving.
        let stale = rt.objects().get(obj).unwrap().prototype.unwrap();
        assert!(rt.objects().get(stale).is_none());
    }

    #[test]
    fn allocation_stamps_frame_and_generation() {
        let mut rt = Runtime::with_settings(RuntimeSettings {
            initial_frame: 7,
            ..RuntimeSettings::default()
        });
        assert_eq!(rt.frame(), 7);
        rt.advance_frame();

        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        let record = rt.objects().get(obj).unwrap();
        assert_eq!(record.creation_frame, 8);
        assert_eq!(record.gc_generation, rt.gc_epoch() as i32);
    }

    #[test]
    fn array_helpers_push_and_copy_elements() {
        let mut rt = Runtime::new();
        let array = rt.alloc_array(vec![Value::int32(1)]).unwrap();
        rt.array_push(&array, Value::real(2.5)).unwrap();
        assert_eq!(rt.array_len(&array).unwrap(), 2);

        assert_eq!(rt.array_get(&array, 0).unwrap().unwrap().to_i32().unwrap(), 1);
        assert_eq!(rt.array_get(&array, 1).unwrap().unwrap().to_f64().unwrap(), 2.5);
        assert!(rt.array_get(&array, 2).unwrap().is_none());

        assert!(matches!(
            rt.array_len(&Value::int32(3)),
            Err(RuntimeError::TypeMismatch { .. })
        ));
        rt.release(array);
        rt.drain_pending();
    }

    #[test]
    fn array_get_bumps_the_counts_of_counted_elements() {
        let mut rt = Runtime::new();
        let text = rt.alloc_string("elem");
        let id = text.as_string().unwrap();
        let array = rt.alloc_array(vec![text]).unwrap();
        assert_eq!(rt.strings().count(id), Some(1));

        let copy = rt.array_get(&array, 0).unwrap().unwrap();
        assert_eq!(rt.strings().count(id), Some(2));
        rt.release(copy);
        rt.release(array);
        rt.drain_pending();
        assert_eq!(rt.strings().live(), 0);
    }

    fn double_first_arg(
        _rt: &mut Runtime,
        _this: Option<ObjectId>,
        _other: Option<ObjectId>,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let n = args.first().map_or(Ok(0), Value::to_i32)?;
        Ok(Value::int32(n * 2))
    }

    #[test]
    fn native_call_targets_dispatch_directly() {
        let mut rt = Runtime::new();
        let script_ref = rt
            .alloc_script_ref(ScriptRefBody::new(CallTarget::Native(double_first_arg)))
            .unwrap();

        let result = rt.call(script_ref, None, &[Value::int32(21)]).unwrap();
        assert_eq!(result.to_i32().unwrap(), 42);
    }

    #[test]
    fn script_call_targets_resolve_through_the_registry() {
        let mut rt = Runtime::new();
        let mut unit = ScriptUnit::from_text("scr_double", "return argument0 * 2;");
        unit.native = Some(NativeFunction {
            name: "scr_double".into(),
            func: double_first_arg,
        });
        let script = rt.scripts_mut().register(unit);
        let script_ref = rt
            .alloc_script_ref(ScriptRefBody::new(CallTarget::Script(script)))
            .unwrap();

        let result = rt.call(script_ref, None, &[Value::int32(4)]).unwrap();
        assert_eq!(result.to_i32().unwrap(), 8);
    }

    #[test]
    fn script_targets_without_a_native_entry_are_not_callable_here() {
        let mut rt = Runtime::new();
        let script = rt
            .scripts_mut()
            .register(ScriptUnit::from_text("scr_pure", "x = 1;"));
        let script_ref = rt
            .alloc_script_ref(ScriptRefBody::new(CallTarget::Script(script)))
            .unwrap();

        assert!(matches!(
            rt.call(script_ref, None, &[]),
            Err(RuntimeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn calling_a_plain_object_is_a_type_mismatch() {
        let mut rt = Runtime::new();
        let obj = rt.alloc_object(ObjectKind::Instance).unwrap();
        assert!(matches!(
            rt.call(obj, None, &[]),
            Err(RuntimeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn hookless_script_refs_answer_false_and_refuse_construction() {
        let mut rt = Runtime::new();
        let script_ref = rt
            .alloc_script_ref(ScriptRefBody::new(CallTarget::Native(double_first_arg)))
            .unwrap();

        assert_eq!(
            rt.has_instance(script_ref, &Value::int32(1)).unwrap(),
            TriBool::False
        );
        assert!(matches!(
            rt.construct(script_ref, None, &[]),
            Err(RuntimeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn script_ref_teardown_releases_bound_values() {
        let mut rt = Runtime::new();
        let text = rt.alloc_string("scope state");
        let mut body = ScriptRefBody::new(CallTarget::Native(double_first_arg));
        body.scope = text;
        let script_ref = rt.alloc_script_ref(body).unwrap();
        assert_eq!(rt.strings().live(), 1);

        rt.free_object_now(script_ref);
        assert_eq!(rt.strings().live(), 0);
    }
}
