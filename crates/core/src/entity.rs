//! Entity trait + compile-time schema descriptors.
//!
//! Each persistent entity declares an [`EntitySchema`]: its table name and a
//! constant table of field accessors. The persistence layer uses the field
//! table to snapshot an entity's persistent state (dirty checking) and to
//! render entities in logs and conflict messages.

use core::fmt;
use core::hash::Hash;

/// Snapshot of an entity's persistent fields, in schema order.
pub type PersistentState = Vec<(&'static str, String)>;

/// Accessor for one persistent field.
pub struct FieldDescriptor<E> {
    pub name: &'static str,
    pub read: fn(&E) -> String,
}

/// Static description of a persistent entity.
pub struct EntitySchema<E: 'static> {
    /// Logical table / store name (e.g. "timer job").
    pub table: &'static str,
    /// Persistent fields, excluding the revision counter.
    pub fields: &'static [FieldDescriptor<E>],
}

impl<E: 'static> EntitySchema<E> {
    pub fn persistent_state(&self, entity: &E) -> PersistentState {
        self.fields
            .iter()
            .map(|field| (field.name, (field.read)(entity)))
            .collect()
    }

    pub fn field(&self, entity: &E, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| (field.read)(entity))
    }

    /// Compact `table[field=value, ...]` rendering for logs.
    pub fn describe(&self, entity: &E) -> String {
        let fields = self
            .persistent_state(entity)
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}[{}]", self.table, fields)
    }
}

/// Persistent entity: identity, optimistic-locking revision, schema.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync;

    const SCHEMA: EntitySchema<Self>;

    fn id(&self) -> Self::Id;

    /// Revision read from the store; bumped by the store on every update.
    fn revision(&self) -> u32;

    fn set_revision(&mut self, revision: u32);

    fn persistent_state(&self) -> PersistentState {
        Self::SCHEMA.persistent_state(self)
    }

    fn describe(&self) -> String {
        Self::SCHEMA.describe(self)
    }
}

/// Render an optional value for a field accessor.
pub fn opt<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "null".to_string(),
    }
}
