//! The opcode inventory.
//!
//! Every instruction starts with a word packing the opcode and RD; operand
//! words follow per opcode. The jump-carrying opcodes record where their
//! signed offset word sits so the builder can patch forward jumps and walk
//! jump lists without decoding whole instructions.

use strum::{FromRepr, IntoStaticStr};

/// Opcodes, one byte each in the packed instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub(crate) enum Opcode {
    // Binary arithmetic: rd, RS, RT
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // Reflexive arithmetic: rd (dest register), RS
    AddEq,
    SubEq,
    MulEq,
    DivEq,
    ModEq,
    // Binary bitwise: rd, RS, RT
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
    // Reflexive bitwise: rd, RS
    AndEq,
    OrEq,
    XorEq,
    ShlEq,
    ShrEq,
    UShrEq,
    // Unary: rd, RS
    Neg,
    Com,
    // Crements: rd
    Inc,
    Dec,
    // Data transfer
    Move,
    /// rd (value register), uimm (name constant index)
    NewGlobal,
    GetGlobal,
    SetGlobal,
    /// rd, uimm (upvalue index)
    GetUpval,
    SetUpval,
    // Comparisons. Cmp3 writes a register; the rest write a branch: the
    // comparison word(s) are followed by a signed jump offset, and RD holds
    // the comparison code (Cmp) or the expected truth (the others).
    Cmp3,
    Cmp,
    SwitchCmp,
    Equals,
    Is,
    In,
    IsTrue,
    // Control: rd (1 = take the jump) for Jmp, rd (table index) for Switch.
    // Jmp and Switch are deliberately the same length: an all-dynamic switch
    // with only a default is rewritten into a Jmp in place.
    Jmp,
    Switch,
    /// Close open upvalues at or above register rd.
    Close,
    // Loops: rd (base register of the loop triple), imm
    For,
    ForLoop,
    Foreach,
    /// rd, uimm (number of user indices), imm
    ForeachLoop,
    // Exception handling
    /// rd (handler slot), imm (offset to handler)
    PushCatch,
    PushFinally,
    PopEH,
    EndFinal,
    /// rd (1 = rethrow), RS (exception value)
    Throw,
    /// rd (number of EH frames to unwind)
    Unwind,
    // Calls
    /// rd (base), RS (object), RT (method name), uimm (params+1, 0 = multi),
    /// uimm (results+1, 0 = multi)
    Method,
    TailMethod,
    /// rd (base), uimm (params+1, 0 = multi), uimm (results+1, 0 = multi)
    Call,
    TailCall,
    /// rd (first result register), uimm (count+1, 0 = to stack top)
    SaveRets,
    Ret,
    /// rd (first value register), uimm (values+1, 0 = multi), uimm (results+1)
    Yield,
    // Parameter checks (function prelude)
    CheckParams,
    /// rd (param register), RS (class), imm (jump on success)
    CheckObjParam,
    /// rd (param register)
    ObjParamFail,
    /// rd (param register), RS (constraint name string)
    CustomParamFail,
    /// rd (message register)
    AssertFail,
    // Length and composite data
    Length,
    LengthAssign,
    /// rd (array register), RS (value)
    Append,
    /// rd (array register), uimm (count+1, 0 = multi), uimm (block offset)
    SetArray,
    /// rd, uimm (first source register), uimm (count)
    Cat,
    CatEq,
    /// rd, RS (container), RT (key)
    Index,
    /// rd (container register), RS (key), RT (value)
    IndexAssign,
    Field,
    FieldAssign,
    /// rd, uimm (base register of [src, lo, hi] triple)
    Slice,
    /// rd (base register of triple), RS (value)
    SliceAssign,
    // Object creation
    /// rd, uimm (length constant index)
    NewArray,
    NewTable,
    /// rd, uimm (inner funcdef index)
    Closure,
    /// rd (environment register), uimm (inner funcdef index)
    ClosureWithEnv,
    /// rd, RS (name), RT (first base register), uimm (base count)
    Class,
    /// rd, uimm (name constant index), RT (parent)
    Namespace,
    /// rd, uimm (name constant index); parent is the current environment
    NamespaceNP,
    SuperOf,
    /// rd (class register), RS (name), RT (value), uimm (flags: 1 = method, 2 = override)
    AddMember,
    // Varargs
    /// rd (dest base), uimm (count+1, 0 = all)
    Vararg,
    VargLen,
    /// rd, RS (index)
    VargIndex,
    /// RS (index), RT (value)
    VargIndexAssign,
    /// rd (dest base; lo/hi live at rd, rd+1), uimm (count+1, 0 = all)
    VargSlice,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Word offset (from the instruction's first word) of the signed jump
    /// operand, for the opcodes that have one.
    pub fn jump_word_offset(self) -> Option<usize> {
        match self {
            Self::Jmp | Self::Switch | Self::For | Self::ForLoop | Self::Foreach | Self::PushCatch | Self::PushFinally => {
                Some(1)
            }
            Self::ForeachLoop | Self::IsTrue | Self::CheckObjParam => Some(2),
            Self::Cmp | Self::SwitchCmp | Self::Equals | Self::Is | Self::In => Some(3),
            _ => None,
        }
    }
}

/// Comparison codes carried in the RD field of `Cmp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub(crate) enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    /// The inversion applied when a jump's sense is flipped.
    pub fn inverted(self) -> Self {
        match self {
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Gt => Self::Le,
            Self::Ge => Self::Lt,
        }
    }
}
