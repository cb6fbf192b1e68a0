mod code;
mod error;
mod gc;
mod heap;
mod names;
mod object;
mod refs;
mod runtime;
mod shared;
mod slots;
mod sparse;
mod value;

pub use code::{
    CallTarget, CodeId, CodeRegistry, CodeUnit, CompiledBuffer, DataType, NativeCallFn,
    NativeFunction, ScriptId, ScriptRefBody, ScriptRegistry, ScriptSource, ScriptUnit, Token,
};
pub use error::RuntimeError;
pub use gc::{CollectStats, GcContext, MarkBitmap, Marker, RootProvider};
pub use heap::{ObjectHeap, ObjectId};
pub use names::{NameTable, VarId};
pub use object::{
    ArrayBody, Capabilities, ConstructFn, DefineOwnFn, DeleteFn, GcHooks, GetOwnFn, HasInstanceFn,
    HeapObject, MarkFn, ObjectBody, ObjectFlags, ObjectKind, PreFreeFn, TeardownFn, TriBool,
    sparse_define_own, sparse_delete_own, sparse_get_own,
};
pub use refs::{RefArena, RefId, StrArena, StrId};
pub use runtime::{Runtime, RuntimeSettings};
pub use shared::{DrainWorker, SharedRuntime};
pub use slots::{SlotId, SlotPool};
pub use sparse::{SparseKey, SparseMap};
pub use value::{KIND_MASK, OpaquePtr, Value, ValueFlags, ValueKind};
