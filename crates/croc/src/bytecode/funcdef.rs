//! The compiled function body: bytecode, constants, and debug tables.
//!
//! [`FuncDefData`] is shared (`Rc`) between the funcdef heap object, every
//! closure made from it, and the activation records running it. It contains
//! no heap references - constants are inline values or interned strings - so
//! the collector never needs to trace into it.

use std::rc::Rc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{intern::StringId, value::Value};

/// Per-switch-statement dispatch table: literal case values to PC offsets,
/// plus the default offset. Offsets are relative to the word after the
/// `Switch` instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SwitchTable {
    pub offsets: AHashMap<Value, i32>,
    pub default_offset: Option<i32>,
}

/// One entry of a script function's upvalue table: where the closure's
/// instruction finds each captured variable in the *enclosing* function -
/// either one of its registers or one of its own upvalues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct UpvalDesc {
    pub is_upval: bool,
    pub index: u16,
    /// Debug name of the captured variable.
    pub name: StringId,
}

/// Debug descriptor of a local variable's live range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct LocalDesc {
    pub name: StringId,
    pub pc_start: u32,
    pub pc_end: u32,
    pub reg: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FuncDefData {
    /// Source location of the definition.
    pub file: StringId,
    pub line: u32,
    pub col: u32,
    pub name: StringId,
    /// Declared parameter count, including the `this` slot.
    pub num_params: usize,
    /// Per-parameter type masks (bit per runtime kind), including `this`.
    pub param_masks: Vec<u32>,
    pub is_vararg: bool,
    /// Registers this body needs beyond its base.
    pub stack_size: usize,
    pub inner: Vec<Rc<FuncDefData>>,
    pub constants: Vec<Value>,
    pub code: Vec<u16>,
    pub switch_tables: Vec<SwitchTable>,
    /// Source line per code word, for tracebacks and line hooks.
    pub line_info: Vec<u32>,
    pub upvals: Vec<UpvalDesc>,
    pub locals: Vec<LocalDesc>,
}

impl FuncDefData {
    /// Source line of the instruction word at `pc`.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc.min(self.line_info.len().saturating_sub(1))).copied().unwrap_or(self.line)
    }
}
