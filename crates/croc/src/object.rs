//! Host-facing value mirror.
//!
//! [`Object`] is the owned, heap-independent form results cross the API
//! boundary in. Containers are copied out shallowly-by-value (arrays
//! recursively, other reference kinds as opaque descriptions), which is
//! enough for embedding hosts and tests to assert on results without holding
//! references into the VM's heap.

use std::fmt::{self, Display};

/// An owned snapshot of a VM value.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Object>),
    /// Any other reference kind, rendered as its display string.
    Opaque(String),
}

impl Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => {
                let mut buf = ryu::Buffer::new();
                write!(f, "{}", buf.format(*x))
            }
            Self::Str(s) => write!(f, "{s}"),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Opaque(s) => write!(f, "{s}"),
        }
    }
}
