//! The tagged value type flowing through registers, stacks, and containers.
//!
//! Value kinds (`null`, `bool`, `int`, `float`, `nativeobj`) are stored
//! inline; strings are inline [`StringId`]s into the per-VM intern table
//! (identity is implied by interning); everything else is a [`HeapId`] into
//! the arena. `Value` is `Copy`: the heap owns every object and the collector
//! is the sole deallocator, so values are freely duplicated.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::{
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
};

/// Opaque host-pointer handle. Round-trips through the VM without the VM ever
/// interpreting it; meaning is assigned entirely by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct NativeId(pub u64);

/// Runtime kind tags, in typemask bit order.
///
/// Parameter typemasks are bitsets over these discriminants, so the order is
/// part of the compiled-function format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub(crate) enum CrocType {
    Null = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    NativeObj = 4,
    String = 5,
    Weakref = 6,
    Table = 7,
    Namespace = 8,
    Array = 9,
    Memblock = 10,
    Function = 11,
    Funcdef = 12,
    Class = 13,
    Instance = 14,
    Thread = 15,
    Upval = 16,
}

impl CrocType {
    #[inline]
    pub fn mask_bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Typemask accepting any first-class value (everything except `upval`).
pub(crate) const TYPEMASK_ANY: u32 = 0xFFFF;
/// Typemask accepting only instances of `null`-able parameter positions.
pub(crate) const TYPEMASK_NULL: u32 = 1 << (CrocType::Null as u32);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Opaque host pointer; equality is handle identity.
    NativeObj(NativeId),
    /// An interned string. Pointer identity is implied by interning, so
    /// equality is id equality.
    Str(StringId),
    /// Reference kind: the object lives in the arena.
    Ref(HeapId),
}

impl Value {
    /// `null`, `false`, integer 0, and float 0.0 are the falsey values.
    #[inline]
    pub fn is_false(self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(b) => !b,
            Self::Int(i) => i == 0,
            Self::Float(f) => f == 0.0,
            _ => false,
        }
    }

    #[inline]
    pub fn is_true(self) -> bool {
        !self.is_false()
    }

    #[inline]
    pub fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }

    /// Identity equality: the `is` operator. Value kinds compare
    /// structurally (floats by bit pattern), reference kinds by identity.
    pub fn exact_eq(self, other: Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::NativeObj(a), Self::NativeObj(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    pub fn kind(self, heap: &Heap) -> CrocType {
        match self {
            Self::Null => CrocType::Null,
            Self::Bool(_) => CrocType::Bool,
            Self::Int(_) => CrocType::Int,
            Self::Float(_) => CrocType::Float,
            Self::NativeObj(_) => CrocType::NativeObj,
            Self::Str(_) => CrocType::String,
            Self::Ref(id) => heap.get(id).kind(),
        }
    }

    /// Renders the value the way `write`/`writeln` and error messages do.
    ///
    /// Reference kinds other than strings render as `<kind 0xNN>`; classes and
    /// namespaces include their names.
    pub fn stringify(self, heap: &Heap, interns: &Interns) -> String {
        match self {
            Self::Null => "null".to_owned(),
            Self::Bool(b) => if b { "true" } else { "false" }.to_owned(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => {
                let mut buf = ryu::Buffer::new();
                buf.format(f).to_owned()
            }
            Self::NativeObj(id) => format!("<nativeobj {:#x}>", id.0),
            Self::Str(id) => interns.get(id).to_owned(),
            Self::Ref(id) => match heap.get(id) {
                HeapData::Class(c) => format!("<class {}>", interns.get(c.name)),
                HeapData::Instance(i) => {
                    let HeapData::Class(c) = heap.get(i.class) else {
                        return format!("<instance {:#x}>", id.index());
                    };
                    format!("<instance of {}>", interns.get(c.name))
                }
                HeapData::Namespace(n) => format!("<namespace {}>", interns.get(n.name)),
                HeapData::Function(f) => format!("<function {}>", interns.get(f.name(heap))),
                other => format!("<{} {:#x}>", other.kind().name(), id.index()),
            },
        }
    }
}

/// Equality as seen by table keys and the `==` fast path: structural for
/// value kinds with int/float cross-type numeric equality, identity for
/// reference kinds.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Self::Int(a), Self::Float(b)) => (a as f64) == b,
            (Self::Float(a), Self::Int(b)) => a == (b as f64),
            (Self::Float(a), Self::Float(b)) => a == b,
            _ => self.exact_eq(*other),
        }
    }
}

impl Eq for Value {}

/// Consistent with `PartialEq`: integral floats hash like the equal integer.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match *self {
            Self::Null => state.write_u8(0),
            Self::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Self::Int(i) => {
                state.write_u8(2);
                i.hash(state);
            }
            Self::Float(f) => {
                if f.fract() == 0.0 && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
                    state.write_u8(2);
                    (f as i64).hash(state);
                } else {
                    state.write_u8(3);
                    f.to_bits().hash(state);
                }
            }
            Self::NativeObj(id) => {
                state.write_u8(4);
                id.hash(state);
            }
            Self::Str(id) => {
                state.write_u8(5);
                id.hash(state);
            }
            Self::Ref(id) => {
                state.write_u8(6);
                id.hash(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_follows_the_language() {
        assert!(Value::Null.is_false());
        assert!(Value::Bool(false).is_false());
        assert!(Value::Int(0).is_false());
        assert!(Value::Float(0.0).is_false());
        assert!(Value::Int(1).is_true());
        assert!(Value::Float(0.5).is_true());
    }

    #[test]
    fn cross_type_numeric_equality() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::Float(1.5));
        // `is` stays strict about kinds
        assert!(!Value::Int(1).exact_eq(Value::Float(1.0)));
    }
}
