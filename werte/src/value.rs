use std::borrow::Cow;

use bitflags::bitflags;

use crate::error::RuntimeError;
use crate::heap::{ObjectHeap, ObjectId};
use crate::refs::{StrArena, StrId};
use crate::runtime::Runtime;

/// Kind word mask. Historical kind words carried out-of-band flag bits above
/// this mask; [`ValueKind::from_raw`] always masks before matching.
pub const KIND_MASK: u32 = 0x00ff_ffff;

const COERCE_NUMERIC: &str = "real, int32, int64 or bool";
const COERCE_TEXT: &str = "real, int32, int64, bool or string";

/// Value kind discriminant. The numeric order is load-bearing: serialized
/// kind words and external collaborators rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ValueKind {
    Real = 0,
    Str = 1,
    Array = 2,
    Ptr = 3,
    Vec3 = 4,
    Undefined = 5,
    Object = 6,
    Int32 = 7,
    Vec4 = 8,
    Mat44 = 9,
    Int64 = 10,
    Accessor = 11,
    Null = 12,
    Bool = 13,
    Iterator = 14,
    Ref = 15,
    Unset = KIND_MASK,
}

impl ValueKind {
    /// Decode a raw kind word, masking out flag bits first. Unknown kind
    /// numbers decode as [`ValueKind::Unset`].
    pub const fn from_raw(raw: u32) -> Self {
        match raw & KIND_MASK {
            0 => ValueKind::Real,
            1 => ValueKind::Str,
            2 => ValueKind::Array,
            3 => ValueKind::Ptr,
            4 => ValueKind::Vec3,
            5 => ValueKind::Undefined,
            6 => ValueKind::Object,
            7 => ValueKind::Int32,
            8 => ValueKind::Vec4,
            9 => ValueKind::Mat44,
            10 => ValueKind::Int64,
            11 => ValueKind::Accessor,
            12 => ValueKind::Null,
            13 => ValueKind::Bool,
            14 => ValueKind::Iterator,
            15 => ValueKind::Ref,
            _ => ValueKind::Unset,
        }
    }

    #[inline(always)]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Real => "real",
            ValueKind::Str => "string",
            ValueKind::Array => "array",
            ValueKind::Ptr => "pointer",
            ValueKind::Vec3 => "vec3",
            ValueKind::Undefined => "undefined",
            ValueKind::Object => "object",
            ValueKind::Int32 => "int32",
            ValueKind::Vec4 => "vec4",
            ValueKind::Mat44 => "mat44",
            ValueKind::Int64 => "int64",
            ValueKind::Accessor => "accessor",
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Iterator => "iterator",
            ValueKind::Ref => "reference",
            ValueKind::Unset => "unset",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Out-of-band value flag bits. Historically packed above [`KIND_MASK`]
    /// in the kind word; carried as a separate field here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ValueFlags: u32 {
        /// The value may not be reassigned through the property surface.
        const CONSTANT = 1 << 0;
    }
}

/// An opaque pointer payload. The runtime carries it and compares it by
/// address but never dereferences it; ownership stays with the collaborator
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpaquePtr(*mut ());

impl OpaquePtr {
    #[inline(always)]
    pub const fn new(ptr: *mut ()) -> Self {
        Self(ptr)
    }

    #[inline(always)]
    pub const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut () {
        self.0
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// Closed payload union. Payload interpretation is determined solely by the
/// variant; the vec/iterator kinds carry externally managed opaque state, and
/// the array/accessor/reference kinds share the object-handle payload with
/// kind checks at the registry boundary.
#[derive(Debug, PartialEq)]
pub(crate) enum ValueData {
    Real(f64),
    Str(StrId),
    Array(ObjectId),
    Ptr(OpaquePtr),
    Vec3(OpaquePtr),
    Undefined,
    Object(ObjectId),
    Int32(i32),
    Vec4(OpaquePtr),
    Mat44(OpaquePtr),
    Int64(i64),
    Accessor(ObjectId),
    Null,
    Bool(bool),
    Iterator(OpaquePtr),
    Ref(ObjectId),
    Unset,
}

/// The universal dynamically-typed value.
///
/// `Value` deliberately does not implement `Clone`: copying a handle kind
/// must bump the referenced count, so copies go through
/// [`Value::clone_with`] (or [`Value::copy_immediate`] for kinds with no
/// heap effect) and every owned value is eventually returned through
/// [`Runtime::release`], which stages the decrement instead of freeing
/// inline.
#[derive(PartialEq)]
pub struct Value {
    pub(crate) data: ValueData,
    pub flags: ValueFlags,
}

impl Value {
    const fn from_data(data: ValueData) -> Self {
        Self {
            data,
            flags: ValueFlags::empty(),
        }
    }

    // ── construction ───────────────────────────────────────────────

    #[inline(always)]
    pub const fn real(f: f64) -> Self {
        Self::from_data(ValueData::Real(f))
    }

    #[inline(always)]
    pub const fn int32(i: i32) -> Self {
        Self::from_data(ValueData::Int32(i))
    }

    #[inline(always)]
    pub const fn int64(i: i64) -> Self {
        Self::from_data(ValueData::Int64(i))
    }

    #[inline(always)]
    pub const fn boolean(b: bool) -> Self {
        Self::from_data(ValueData::Bool(b))
    }

    #[inline(always)]
    pub const fn undefined() -> Self {
        Self::from_data(ValueData::Undefined)
    }

    #[inline(always)]
    pub const fn null() -> Self {
        Self::from_data(ValueData::Null)
    }

    #[inline(always)]
    pub const fn unset() -> Self {
        Self::from_data(ValueData::Unset)
    }

    /// Wrap an owned string handle. Ownership of one count transfers into
    /// the value; the arena does not get bumped here.
    #[inline(always)]
    pub const fn string(id: StrId) -> Self {
        Self::from_data(ValueData::Str(id))
    }

    /// Wrap an owned array handle (one array count transfers in).
    #[inline(always)]
    pub const fn array(id: ObjectId) -> Self {
        Self::from_data(ValueData::Array(id))
    }

    #[inline(always)]
    pub const fn object(id: ObjectId) -> Self {
        Self::from_data(ValueData::Object(id))
    }

    #[inline(always)]
    pub const fn accessor(id: ObjectId) -> Self {
        Self::from_data(ValueData::Accessor(id))
    }

    #[inline(always)]
    pub const fn reference(id: ObjectId) -> Self {
        Self::from_data(ValueData::Ref(id))
    }

    #[inline(always)]
    pub const fn pointer(ptr: OpaquePtr) -> Self {
        Self::from_data(ValueData::Ptr(ptr))
    }

    #[inline(always)]
    pub const fn vec3(ptr: OpaquePtr) -> Self {
        Self::from_data(ValueData::Vec3(ptr))
    }

    #[inline(always)]
    pub const fn vec4(ptr: OpaquePtr) -> Self {
        Self::from_data(ValueData::Vec4(ptr))
    }

    #[inline(always)]
    pub const fn mat44(ptr: OpaquePtr) -> Self {
        Self::from_data(ValueData::Mat44(ptr))
    }

    #[inline(always)]
    pub const fn iterator(ptr: OpaquePtr) -> Self {
        Self::from_data(ValueData::Iterator(ptr))
    }

    pub const fn with_flags(mut self, flags: ValueFlags) -> Self {
        self.flags = flags;
        self
    }

    // ── inspection ─────────────────────────────────────────────────

    pub const fn kind(&self) -> ValueKind {
        match self.data {
            ValueData::Real(_) => ValueKind::Real,
            ValueData::Str(_) => ValueKind::Str,
            ValueData::Array(_) => ValueKind::Array,
            ValueData::Ptr(_) => ValueKind::Ptr,
            ValueData::Vec3(_) => ValueKind::Vec3,
            ValueData::Undefined => ValueKind::Undefined,
            ValueData::Object(_) => ValueKind::Object,
            ValueData::Int32(_) => ValueKind::Int32,
            ValueData::Vec4(_) => ValueKind::Vec4,
            ValueData::Mat44(_) => ValueKind::Mat44,
            ValueData::Int64(_) => ValueKind::Int64,
            ValueData::Accessor(_) => ValueKind::Accessor,
            ValueData::Null => ValueKind::Null,
            ValueData::Bool(_) => ValueKind::Bool,
            ValueData::Iterator(_) => ValueKind::Iterator,
            ValueData::Ref(_) => ValueKind::Ref,
            ValueData::Unset => ValueKind::Unset,
        }
    }

    #[inline(always)]
    pub const fn flags(&self) -> ValueFlags {
        self.flags
    }

    #[inline(always)]
    pub fn is_undefined(&self) -> bool {
        matches!(self.data, ValueData::Undefined)
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        matches!(self.data, ValueData::Null)
    }

    /// True for kinds whose payload references shared storage.
    pub fn is_handle(&self) -> bool {
        matches!(
            self.data,
            ValueData::Str(_)
                | ValueData::Array(_)
                | ValueData::Object(_)
                | ValueData::Accessor(_)
                | ValueData::Ref(_)
        )
    }

    pub fn as_string(&self) -> Option<StrId> {
        match self.data {
            ValueData::Str(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self.data {
            ValueData::Object(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<ObjectId> {
        match self.data {
            ValueData::Array(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<OpaquePtr> {
        match self.data {
            ValueData::Ptr(ptr) => Some(ptr),
            _ => None,
        }
    }

    /// The object-registry edge this value holds, for any object-backed kind.
    /// Marking walks these.
    pub fn object_edge(&self) -> Option<ObjectId> {
        match self.data {
            ValueData::Array(id)
            | ValueData::Object(id)
            | ValueData::Accessor(id)
            | ValueData::Ref(id) => Some(id),
            _ => None,
        }
    }

    // ── coercion ───────────────────────────────────────────────────

    pub fn to_f64(&self) -> Result<f64, RuntimeError> {
        match self.data {
            ValueData::Real(f) => Ok(f),
            ValueData::Int32(i) => Ok(f64::from(i)),
            ValueData::Int64(i) => Ok(i as f64),
            ValueData::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
            _ => Err(self.mismatch(COERCE_NUMERIC)),
        }
    }

    pub fn to_i32(&self) -> Result<i32, RuntimeError> {
        match self.data {
            ValueData::Real(f) => Ok(f as i32),
            ValueData::Int32(i) => Ok(i),
            ValueData::Int64(i) => Ok(i as i32),
            ValueData::Bool(b) => Ok(i32::from(b)),
            _ => Err(self.mismatch(COERCE_NUMERIC)),
        }
    }

    pub fn to_i64(&self) -> Result<i64, RuntimeError> {
        match self.data {
            ValueData::Real(f) => Ok(f as i64),
            ValueData::Int32(i) => Ok(i64::from(i)),
            ValueData::Int64(i) => Ok(i),
            ValueData::Bool(b) => Ok(i64::from(b)),
            _ => Err(self.mismatch(COERCE_NUMERIC)),
        }
    }

    pub fn to_bool(&self) -> Result<bool, RuntimeError> {
        match self.data {
            ValueData::Real(f) => Ok(f > 0.5),
            ValueData::Int32(i) => Ok(i > 0),
            ValueData::Int64(i) => Ok(i > 0),
            ValueData::Bool(b) => Ok(b),
            _ => Err(self.mismatch(COERCE_NUMERIC)),
        }
    }

    /// Render as text. The string kind borrows the referenced character data
    /// without copying; numeric kinds render decimal.
    pub fn to_text<'a>(
        &self,
        strings: &'a StrArena,
    ) -> Result<Cow<'a, str>, RuntimeError> {
        match self.data {
            ValueData::Real(f) => Ok(Cow::Owned(f.to_string())),
            ValueData::Int32(i) => Ok(Cow::Owned(i.to_string())),
            ValueData::Int64(i) => Ok(Cow::Owned(i.to_string())),
            ValueData::Bool(b) => {
                Ok(Cow::Borrowed(if b { "true" } else { "false" }))
            }
            ValueData::Str(id) => match strings.get(id) {
                Some(s) => Ok(Cow::Borrowed(s)),
                None => Err(RuntimeError::StaleReference),
            },
            _ => Err(self.mismatch(COERCE_TEXT)),
        }
    }

    fn mismatch(&self, expected: &'static str) -> RuntimeError {
        RuntimeError::TypeMismatch {
            expected,
            got: self.kind(),
        }
    }

    // ── lifecycle ──────────────────────────────────────────────────

    /// Copy this value, bumping the count of a ref-counted payload (strings
    /// and arrays). Object handles are traced by marking, not counted, so
    /// they copy freely. Flags survive the copy.
    pub fn clone_with(&self, rt: &mut Runtime) -> Value {
        let Runtime {
            strings, objects, ..
        } = rt;
        self.clone_raw(strings, objects)
    }

    /// [`Value::clone_with`] against the split arenas; callers that already
    /// hold other runtime fields borrow through this.
    pub(crate) fn clone_raw(&self, strings: &mut StrArena, objects: &mut ObjectHeap) -> Value {
        let data = match self.data {
            ValueData::Real(f) => ValueData::Real(f),
            ValueData::Str(id) => {
                strings.inc(id);
                ValueData::Str(id)
            }
            ValueData::Array(id) => {
                objects.inc_array(id);
                ValueData::Array(id)
            }
            ValueData::Ptr(p) => ValueData::Ptr(p),
            ValueData::Vec3(p) => ValueData::Vec3(p),
            ValueData::Undefined => ValueData::Undefined,
            ValueData::Object(id) => ValueData::Object(id),
            ValueData::Int32(i) => ValueData::Int32(i),
            ValueData::Vec4(p) => ValueData::Vec4(p),
            ValueData::Mat44(p) => ValueData::Mat44(p),
            ValueData::Int64(i) => ValueData::Int64(i),
            ValueData::Accessor(id) => ValueData::Accessor(id),
            ValueData::Null => ValueData::Null,
            ValueData::Bool(b) => ValueData::Bool(b),
            ValueData::Iterator(p) => ValueData::Iterator(p),
            ValueData::Ref(id) => ValueData::Ref(id),
            ValueData::Unset => ValueData::Unset,
        };
        Value {
            data,
            flags: self.flags,
        }
    }

    /// Copy without touching any count. `None` for the ref-counted kinds.
    pub fn copy_immediate(&self) -> Option<Value> {
        let data = match self.data {
            ValueData::Real(f) => ValueData::Real(f),
            ValueData::Ptr(p) => ValueData::Ptr(p),
            ValueData::Vec3(p) => ValueData::Vec3(p),
            ValueData::Undefined => ValueData::Undefined,
            ValueData::Object(id) => ValueData::Object(id),
            ValueData::Int32(i) => ValueData::Int32(i),
            ValueData::Vec4(p) => ValueData::Vec4(p),
            ValueData::Mat44(p) => ValueData::Mat44(p),
            ValueData::Int64(i) => ValueData::Int64(i),
            ValueData::Accessor(id) => ValueData::Accessor(id),
            ValueData::Null => ValueData::Null,
            ValueData::Bool(b) => ValueData::Bool(b),
            ValueData::Iterator(p) => ValueData::Iterator(p),
            ValueData::Ref(id) => ValueData::Ref(id),
            ValueData::Unset => ValueData::Unset,
            ValueData::Str(_) | ValueData::Array(_) => return None,
        };
        Some(Value {
            data,
            flags: self.flags,
        })
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::undefined()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::int32(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int64(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::real(f)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.data {
            ValueData::Real(v) => write!(f, "Real({v})")?,
            ValueData::Str(id) => write!(f, "Str({id:?})")?,
            ValueData::Array(id) => write!(f, "Array({id:?})")?,
            ValueData::Ptr(p) => write!(f, "Ptr({:?})", p.as_ptr())?,
            ValueData::Vec3(p) => write!(f, "Vec3({:?})", p.as_ptr())?,
            ValueData::Undefined => f.write_str("Undefined")?,
            ValueData::Object(id) => write!(f, "Object({id:?})")?,
            ValueData::Int32(v) => write!(f, "Int32({v})")?,
            ValueData::Vec4(p) => write!(f, "Vec4({:?})", p.as_ptr())?,
            ValueData::Mat44(p) => write!(f, "Mat44({:?})", p.as_ptr())?,
            ValueData::Int64(v) => write!(f, "Int64({v})")?,
            ValueData::Accessor(id) => write!(f, "Accessor({id:?})")?,
            ValueData::Null => f.write_str("Null")?,
            ValueData::Bool(v) => write!(f, "Bool({v})")?,
            ValueData::Iterator(p) => write!(f, "Iterator({:?})", p.as_ptr())?,
            ValueData::Ref(id) => write!(f, "Ref({id:?})")?,
            ValueData::Unset => f.write_str("Unset")?,
        }
        if !self.flags.is_empty() {
            write!(f, "+{:?}", self.flags)?;
        }
        Ok(())
    }
}
