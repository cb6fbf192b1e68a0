use crate::error::RuntimeError;
use crate::heap::ObjectId;
use crate::object::{ConstructFn, HasInstanceFn};
use crate::runtime::Runtime;
use crate::value::Value;

/// Literal type tags used by token trees and compiled literals. The
/// numbering is sparse on purpose; it matches what compiled buffers store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DataType {
    None = 0,
    Double = 1,
    String = 2,
    Int32 = 4,
    Error = 0xffff_ffff,
}

impl DataType {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => DataType::None,
            1 => DataType::Double,
            2 => DataType::String,
            4 => DataType::Int32,
            _ => DataType::Error,
        }
    }
}

/// One node of a parsed token tree.
#[derive(Debug)]
pub struct Token {
    pub kind: i32,
    pub data_type: DataType,
    pub ind: i32,
    pub ind2: i32,
    pub value: Value,
    pub children: Vec<Token>,
    pub position: i32,
}

impl Token {
    pub fn new(kind: i32, value: Value) -> Self {
        Self {
            kind,
            data_type: DataType::None,
            ind: 0,
            ind2: 0,
            value,
            children: Vec::new(),
            position: 0,
        }
    }
}

/// Generic native entry point: (self, other, args) in, one value out.
pub type NativeCallFn =
    fn(&mut Runtime, Option<ObjectId>, Option<ObjectId>, &[Value]) -> Result<Value, RuntimeError>;

/// A named native function registered with a script or code unit.
pub struct NativeFunction {
    pub name: Box<str>,
    pub func: NativeCallFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// Compiled bytecode plus its side tables.
#[derive(Debug, Default)]
pub struct CompiledBuffer {
    pub bytes: Vec<u8>,
    pub jump_table: Vec<i32>,
    pub locals_used: i32,
    pub arg_count: i32,
}

impl CompiledBuffer {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One compiled routine or token tree: literal payload, buffers, source
/// strings, and counts the interpreter needs to set up a frame. The
/// prototype edge is non-owning, like every prototype in the system.
#[derive(Debug)]
pub struct CodeUnit {
    pub kind: i32,
    pub compiled: bool,
    pub name: Box<str>,
    pub source: Option<Box<str>>,
    pub token: Option<Token>,
    pub literal: Value,
    pub buffer: Option<CompiledBuffer>,
    pub debug_buffer: Option<CompiledBuffer>,
    pub code_index: i32,
    pub native: Option<NativeFunction>,
    pub watch: bool,
    pub offset: i32,
    pub locals: i32,
    pub args: i32,
    pub flags: i32,
    pub prototype: Option<ObjectId>,
}

impl CodeUnit {
    pub fn new(name: &str) -> Self {
        Self {
            kind: 0,
            compiled: false,
            name: name.into(),
            source: None,
            token: None,
            literal: Value::undefined(),
            buffer: None,
            debug_buffer: None,
            code_index: -1,
            native: None,
            watch: false,
            offset: 0,
            locals: 0,
            args: 0,
            flags: 0,
            prototype: None,
        }
    }
}

/// Index of a registered [`CodeUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeId(u32);

impl CodeId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Registry of compiled routines. Units are appended once and addressed
/// by [`CodeId`] afterwards; `code_index` is kept in sync on register.
#[derive(Debug, Default)]
pub struct CodeRegistry {
    units: Vec<CodeUnit>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mut unit: CodeUnit) -> CodeId {
        let id = CodeId(self.units.len() as u32);
        unit.code_index = id.0 as i32;
        self.units.push(unit);
        id
    }

    pub fn get(&self, id: CodeId) -> Option<&CodeUnit> {
        self.units.get(id.index())
    }

    pub fn get_mut(&mut self, id: CodeId) -> Option<&mut CodeUnit> {
        self.units.get_mut(id.index())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// What a script unit currently holds: raw text before compilation, a
/// code-registry index after.
#[derive(Debug)]
pub enum ScriptSource {
    Text(Box<str>),
    Compiled(CodeId),
}

/// A script known to the runtime: its current source form plus an
/// optional registered native entry point.
#[derive(Debug)]
pub struct ScriptUnit {
    pub name: Box<str>,
    pub source: ScriptSource,
    pub native: Option<NativeFunction>,
    pub offset: i32,
}

impl ScriptUnit {
    pub fn from_text(name: &str, text: &str) -> Self {
        Self {
            name: name.into(),
            source: ScriptSource::Text(text.into()),
            native: None,
            offset: 0,
        }
    }

    pub fn from_code(name: &str, code: CodeId) -> Self {
        Self {
            name: name.into(),
            source: ScriptSource::Compiled(code),
            native: None,
            offset: 0,
        }
    }
}

/// Index of a registered [`ScriptUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptId(u32);

impl ScriptId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: Vec<ScriptUnit>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, script: ScriptUnit) -> ScriptId {
        let id = ScriptId(self.scripts.len() as u32);
        self.scripts.push(script);
        id
    }

    pub fn get(&self, id: ScriptId) -> Option<&ScriptUnit> {
        self.scripts.get(id.index())
    }

    pub fn get_mut(&mut self, id: ScriptId) -> Option<&mut ScriptUnit> {
        self.scripts.get_mut(id.index())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// The callable a script reference binds. Being an enum, exactly one
/// target exists per reference by construction.
pub enum CallTarget {
    /// A registered script, resolved through the registry at call time.
    Script(ScriptId),
    /// A native entry point.
    Native(NativeCallFn),
    /// An ahead-of-time compiled entry point.
    Compiled(NativeCallFn),
}

impl std::fmt::Debug for CallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallTarget::Script(id) => write!(f, "CallTarget::Script({id:?})"),
            CallTarget::Native(_) => f.write_str("CallTarget::Native"),
            CallTarget::Compiled(_) => f.write_str("CallTarget::Compiled"),
        }
    }
}

/// Body of a script-reference object: the bound-call representation for
/// method and closure values. Scope and `this` are owned counted copies;
/// the static object is a plain traced edge.
#[derive(Debug)]
pub struct ScriptRefBody {
    pub target: CallTarget,
    pub scope: Value,
    pub bound_this: Value,
    pub static_object: Option<ObjectId>,
    pub has_instance: Option<HasInstanceFn>,
    pub construct: Option<ConstructFn>,
    pub tag: Option<Box<str>>,
}

impl ScriptRefBody {
    pub fn new(target: CallTarget) -> Self {
        Self {
            target,
            scope: Value::undefined(),
            bound_this: Value::undefined(),
            static_object: None,
            has_instance: None,
            construct: None,
            tag: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_round_trips_through_raw_words() {
        assert_eq!(DataType::from_raw(0), DataType::None);
        assert_eq!(DataType::from_raw(1), DataType::Double);
        assert_eq!(DataType::from_raw(2), DataType::String);
        assert_eq!(DataType::from_raw(4), DataType::Int32);
        assert_eq!(DataType::from_raw(3), DataType::Error);
        assert_eq!(DataType::from_raw(0xffff_ffff), DataType::Error);
        assert_eq!(DataType::Int32 as u32, 4);
    }

    #[test]
    fn registered_code_units_get_their_index_written_back() {
        let mut registry = CodeRegistry::new();
        let a = registry.register(CodeUnit::new("scr_init"));
        let b = registry.register(CodeUnit::new("scr_step"));

        assert_eq!(registry.get(a).unwrap().code_index, 0);
        assert_eq!(registry.get(b).unwrap().code_index, 1);
        assert_eq!(registry.get(b).unwrap().name.as_ref(), "scr_step");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn script_source_tracks_compilation_state() {
        let mut codes = CodeRegistry::new();
        let mut scripts = ScriptRegistry::new();
        let id = scripts.register(ScriptUnit::from_text("scr_move", "x += speed"));

        assert!(matches!(
            scripts.get(id).unwrap().source,
            ScriptSource::Text(_)
        ));

        let code = codes.register(CodeUnit::new("scr_move"));
        scripts.get_mut(id).unwrap().source = ScriptSource::Compiled(code);
        match scripts.get(id).unwrap().source {
            ScriptSource::Compiled(c) => assert_eq!(c, code),
            ScriptSource::Text(_) => panic!("still uncompiled"),
        }
    }

    #[test]
    fn token_trees_nest_through_children() {
        let mut root = Token::new(1, Value::undefined());
        let mut lhs = Token::new(2, Value::real(1.5));
        lhs.data_type = DataType::Double;
        root.children.push(lhs);
        root.children.push(Token::new(2, Value::int32(7)));

        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].data_type, DataType::Double);
        assert_eq!(root.children[1].value.to_i32().unwrap(), 7);
    }

    #[test]
    fn fresh_script_ref_bodies_bind_nothing() {
        let body = ScriptRefBody::new(CallTarget::Script(ScriptId(3)));
        assert!(body.scope.is_undefined());
        assert!(body.bound_this.is_undefined());
        assert!(body.static_object.is_none());
        assert!(body.has_instance.is_none());
        assert!(body.construct.is_none());
        assert!(matches!(body.target, CallTarget::Script(_)));
    }
}
