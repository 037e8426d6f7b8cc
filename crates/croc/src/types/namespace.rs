//! The namespace kind: string-keyed slots with a parent chain.
//!
//! The `root` pointer (the top of the parent chain) provides the
//! "module-local then global" fallback used by global lookup.

use indexmap::IndexMap;

use crate::{heap::HeapId, intern::StringId, value::Value};

#[derive(Debug)]
pub(crate) struct Namespace {
    pub name: StringId,
    pub parent: Option<HeapId>,
    /// Top of the parent chain; `None` when this namespace is itself a root.
    pub root: Option<HeapId>,
    slots: IndexMap<StringId, Value, ahash::RandomState>,
}

impl Namespace {
    pub fn new(name: StringId) -> Self {
        Self {
            name,
            parent: None,
            root: None,
            slots: IndexMap::default(),
        }
    }

    /// `root` is derived from the parent: the parent's root, or the parent
    /// itself when the parent is a root.
    pub fn with_parent(name: StringId, parent: HeapId, parent_root: Option<HeapId>) -> Self {
        Self {
            name,
            parent: Some(parent),
            root: Some(parent_root.unwrap_or(parent)),
            slots: IndexMap::default(),
        }
    }

    pub fn get(&self, key: StringId) -> Option<Value> {
        self.slots.get(&key).copied()
    }

    pub fn contains(&self, key: StringId) -> bool {
        self.slots.contains_key(&key)
    }

    /// Direct write, creating the slot if needed.
    pub fn set(&mut self, key: StringId, value: Value) {
        self.slots.insert(key, value);
    }

    /// Writes only if the slot already exists here.
    pub fn set_if_exists(&mut self, key: StringId, value: Value) -> bool {
        match self.slots.get_mut(&key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: StringId) -> bool {
        self.slots.shift_remove(&key).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.slots.iter().map(|(&k, &v)| (k, v))
    }
}
