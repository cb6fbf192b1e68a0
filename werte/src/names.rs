use ahash::AHashMap;

use crate::error::RuntimeError;
use crate::sparse::SparseKey;

/// Dense index of an interned variable name. Instance variable storage is
/// keyed by these, never by the name text itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(i32);

impl VarId {
    #[inline(always)]
    pub const fn index(self) -> i32 {
        self.0
    }
}

impl SparseKey for VarId {
    #[inline(always)]
    fn hash_index(self) -> u32 {
        self.0 as u32
    }
}

/// Two-way interning table: name text to [`VarId`] and back. Ids are handed
/// out densely in interning order, so they double as indexes into the
/// reverse table.
#[derive(Default)]
pub struct NameTable {
    by_name: AHashMap<Box<str>, VarId>,
    names: Vec<Box<str>>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning the existing id when the name is already
    /// known. Ids are `i32`, so the table refuses to grow past `i32::MAX`
    /// entries.
    pub fn intern(&mut self, name: &str) -> Result<VarId, RuntimeError> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        if self.names.len() >= i32::MAX as usize {
            return Err(RuntimeError::CapacityExceeded {
                what: "name table",
                limit: i32::MAX as usize,
            });
        }
        let id = VarId(self.names.len() as i32);
        let owned: Box<str> = name.into();
        self.names.push(owned.clone());
        self.by_name.insert(owned, id);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<VarId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: VarId) -> Option<&str> {
        self.names.get(id.0 as usize).map(Box::as_ref)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut table = NameTable::new();
        let a = table.intern("speed").unwrap();
        let b = table.intern("speed").unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ids_are_dense_in_interning_order() {
        let mut table = NameTable::new();
        let x = table.intern("x").unwrap();
        let y = table.intern("y").unwrap();
        let z = table.intern("z").unwrap();
        assert_eq!(x.index(), 0);
        assert_eq!(y.index(), 1);
        assert_eq!(z.index(), 2);
    }

    #[test]
    fn names_round_trip_through_their_ids() {
        let mut table = NameTable::new();
        let id = table.intern("direction").unwrap();
        assert_eq!(table.name(id), Some("direction"));
        assert_eq!(table.lookup("direction"), Some(id));
        assert_eq!(table.lookup("gravity"), None);
    }

    #[test]
    fn var_ids_hash_by_identity() {
        let mut table = NameTable::new();
        let id = table.intern("hp").unwrap();
        assert_eq!(id.hash_index(), 0);
        let other = table.intern("mp").unwrap();
        assert_eq!(other.hash_index(), 1);
    }
}
