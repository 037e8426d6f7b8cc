//! The instance kind: a fixed set of field slots plus optional hidden slots.
//!
//! Slots are copied from the (frozen) class at creation, so field access
//! never walks the parent chain at runtime; writes store in place into the
//! slot declared by some ancestor.

use indexmap::IndexMap;

use crate::{heap::HeapId, intern::StringId, value::Value};

type Slots = IndexMap<StringId, Value, ahash::RandomState>;

#[derive(Debug)]
pub(crate) struct Instance {
    /// Immutable after creation.
    pub class: HeapId,
    fields: Slots,
    hidden: Slots,
}

impl Instance {
    pub fn new(class: HeapId, fields: Slots, hidden: Slots) -> Self {
        Self { class, fields, hidden }
    }

    pub fn get_field(&self, name: StringId) -> Option<Value> {
        self.fields.get(&name).copied()
    }

    /// Writes succeed only into a declared slot.
    pub fn set_field(&mut self, name: StringId, value: Value) -> bool {
        match self.fields.get_mut(&name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn get_hidden(&self, name: StringId) -> Option<Value> {
        self.hidden.get(&name).copied()
    }

    pub fn set_hidden(&mut self, name: StringId, value: Value) -> bool {
        match self.hidden.get_mut(&name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.fields.iter().map(|(&k, &v)| (k, v))
    }

    pub fn hidden_fields(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.hidden.iter().map(|(&k, &v)| (k, v))
    }
}
