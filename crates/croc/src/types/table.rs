//! The table kind: a hash map from non-`null` values to values.

use ahash::AHashMap;

use crate::value::Value;

/// Mapping from Value to Value. A `null` key is forbidden (enforced at the
/// operation layer); writing a `null` value removes the key, so "absent" and
/// "mapped to null" are indistinguishable, by design of the language.
#[derive(Debug, Default)]
pub(crate) struct Table {
    data: AHashMap<Value, Value>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a slot; absent keys read as `null`.
    pub fn get(&self, key: Value) -> Value {
        self.data.get(&key).copied().unwrap_or(Value::Null)
    }

    /// Writes a slot; a `null` value removes the key.
    pub fn set(&mut self, key: Value, value: Value) {
        if value.is_null() {
            self.data.remove(&key);
        } else {
            self.data.insert(key, value);
        }
    }

    pub fn contains(&self, key: Value) -> bool {
        self.data.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.data.iter().map(|(&k, &v)| (k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_value_removes_the_key() {
        let mut t = Table::new();
        t.set(Value::Int(1), Value::Int(10));
        assert_eq!(t.get(Value::Int(1)), Value::Int(10));
        t.set(Value::Int(1), Value::Null);
        assert!(!t.contains(Value::Int(1)));
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn int_and_float_keys_coincide_numerically() {
        let mut t = Table::new();
        t.set(Value::Int(2), Value::Bool(true));
        assert_eq!(t.get(Value::Float(2.0)), Value::Bool(true));
    }
}
