//! Bytecode representation shared by the compiler and the interpreter.
//!
//! - `op` - the opcode inventory with operand-shape metadata
//! - `instr` - 16-bit word encoding constants and accessors
//! - `funcdef` - the compiled function body ([`FuncDefData`]) and its tables

pub(crate) mod funcdef;
pub(crate) mod instr;
pub(crate) mod op;

pub(crate) use funcdef::{FuncDefData, LocalDesc, SwitchTable, UpvalDesc};
pub(crate) use op::Opcode;
