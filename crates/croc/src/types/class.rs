//! The class kind: named member sets, a parent link, and a freeze latch.
//!
//! Fields and methods share one lookup namespace from the user's view but are
//! stored separately; hidden fields live in their own set invisible to normal
//! field access. Deriving copies the parent's members into the child, so
//! member lookup on a frozen class is a single map probe; the parent pointer
//! remains for `super` and `derivesFrom` checks.

use indexmap::IndexMap;

use crate::{heap::HeapId, intern::StringId, value::Value};

type Members = IndexMap<StringId, Value, ahash::RandomState>;

#[derive(Debug)]
pub(crate) struct Class {
    pub name: StringId,
    pub parent: Option<HeapId>,
    methods: Members,
    fields: Members,
    hidden: Members,
    /// Set on first instantiation or derivation; after freeze only explicit
    /// overrides of existing methods/fields are allowed.
    pub frozen: bool,
    pub finalizer: Option<Value>,
}

impl Class {
    pub fn new(name: StringId) -> Self {
        Self {
            name,
            parent: None,
            methods: Members::default(),
            fields: Members::default(),
            hidden: Members::default(),
            frozen: false,
            finalizer: None,
        }
    }

    /// Copies `base`'s members into `self` and records the derivation. The
    /// base is frozen by the act of being derived from.
    pub fn derive_from(&mut self, base_id: HeapId, base: &Self) {
        self.parent = Some(base_id);
        for (&k, &v) in &base.methods {
            self.methods.insert(k, v);
        }
        for (&k, &v) in &base.fields {
            self.fields.insert(k, v);
        }
        for (&k, &v) in &base.hidden {
            self.hidden.insert(k, v);
        }
        if self.finalizer.is_none() {
            self.finalizer = base.finalizer;
        }
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Walks `parent` links looking for `ancestor`.
    pub fn derives_from(&self, ancestor: HeapId, lookup: impl Fn(HeapId) -> Option<HeapId>) -> bool {
        let mut cur = self.parent;
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = lookup(id);
        }
        false
    }

    pub fn get_method(&self, name: StringId) -> Option<Value> {
        self.methods.get(&name).copied()
    }

    pub fn get_field(&self, name: StringId) -> Option<Value> {
        self.fields.get(&name).copied()
    }

    pub fn get_hidden(&self, name: StringId) -> Option<Value> {
        self.hidden.get(&name).copied()
    }

    /// Fields and methods conflict with each other; hidden fields conflict
    /// with neither.
    fn member_exists(&self, name: StringId) -> bool {
        self.methods.contains_key(&name) || self.fields.contains_key(&name)
    }

    /// With `override_` false, fails if the name is already a field or method;
    /// with it true, fails unless the name is already a method. After freeze
    /// only the override form is permitted.
    pub fn add_method(&mut self, name: StringId, value: Value, override_: bool) -> bool {
        if override_ {
            if !self.methods.contains_key(&name) {
                return false;
            }
        } else if self.frozen || self.member_exists(name) {
            return false;
        }
        self.methods.insert(name, value);
        true
    }

    pub fn add_field(&mut self, name: StringId, value: Value, override_: bool) -> bool {
        if override_ {
            if !self.fields.contains_key(&name) {
                return false;
            }
        } else if self.frozen || self.member_exists(name) {
            return false;
        }
        self.fields.insert(name, value);
        true
    }

    pub fn add_hidden_field(&mut self, name: StringId, value: Value, override_: bool) -> bool {
        if override_ {
            if !self.hidden.contains_key(&name) {
                return false;
            }
        } else if self.frozen || self.hidden.contains_key(&name) {
            return false;
        }
        self.hidden.insert(name, value);
        true
    }

    /// Removes a field or method before freeze. Returns false if absent or
    /// the class is frozen.
    pub fn remove_member(&mut self, name: StringId) -> bool {
        if self.frozen {
            return false;
        }
        self.methods.shift_remove(&name).is_some() || self.fields.shift_remove(&name).is_some()
    }

    /// Declared fields in declaration order; instances copy these at creation.
    pub fn fields(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.fields.iter().map(|(&k, &v)| (k, v))
    }

    pub fn hidden_fields(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.hidden.iter().map(|(&k, &v)| (k, v))
    }

    pub fn methods(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.methods.iter().map(|(&k, &v)| (k, v))
    }

    /// The instance size is the number of declared field slots, fixed at
    /// freeze time.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    fn ids(interns: &mut Interns, names: &[&str]) -> Vec<StringId> {
        names.iter().map(|n| interns.intern(n)).collect()
    }

    #[test]
    fn fields_and_methods_share_a_namespace() {
        let mut interns = Interns::new();
        let n = ids(&mut interns, &["C", "x"]);
        let mut c = Class::new(n[0]);
        assert!(c.add_field(n[1], Value::Int(1), false));
        // A method may not reuse a field name.
        assert!(!c.add_method(n[1], Value::Null, false));
    }

    #[test]
    fn hidden_fields_do_not_conflict_with_either() {
        let mut interns = Interns::new();
        let n = ids(&mut interns, &["C", "x"]);
        let mut c = Class::new(n[0]);
        assert!(c.add_field(n[1], Value::Int(1), false));
        assert!(c.add_hidden_field(n[1], Value::Int(2), false));
        assert_eq!(c.get_field(n[1]), Some(Value::Int(1)));
        assert_eq!(c.get_hidden(n[1]), Some(Value::Int(2)));
        // Normal member lookup never sees the hidden slot.
        assert!(c.get_method(n[1]).is_none());
    }

    #[test]
    fn freeze_latches_membership() {
        let mut interns = Interns::new();
        let n = ids(&mut interns, &["C", "m", "extra"]);
        let mut c = Class::new(n[0]);
        assert!(c.add_method(n[1], Value::Int(1), false));
        c.freeze();
        // New members are rejected; explicit overrides of existing ones are not.
        assert!(!c.add_method(n[2], Value::Null, false));
        assert!(c.add_method(n[1], Value::Int(2), true));
        assert!(!c.remove_member(n[1]));
    }

    #[test]
    fn override_requires_an_existing_member() {
        let mut interns = Interns::new();
        let n = ids(&mut interns, &["C", "m"]);
        let mut c = Class::new(n[0]);
        assert!(!c.add_method(n[1], Value::Null, true));
        assert!(c.add_method(n[1], Value::Null, false));
        assert!(c.add_method(n[1], Value::Int(1), true));
    }

    #[test]
    fn remove_member_before_freeze() {
        let mut interns = Interns::new();
        let n = ids(&mut interns, &["C", "x"]);
        let mut c = Class::new(n[0]);
        assert!(c.add_field(n[1], Value::Int(1), false));
        assert!(c.remove_member(n[1]));
        assert!(!c.remove_member(n[1]));
    }
}
