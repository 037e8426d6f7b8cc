//! Metamethod names and lookup.
//!
//! Every operator the interpreter cannot resolve on primitive types consults
//! a metamethod: a method on the receiver's class (for instances and
//! classes) or an entry in the VM-wide per-type metatable namespace (for
//! everything else). Lookup is a presence check first - metamethods are
//! never invoked speculatively.

use strum::IntoStaticStr;

use crate::{
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    run::Vm,
    value::{CrocType, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum Metamethod {
    #[strum(serialize = "opAdd")]
    Add,
    #[strum(serialize = "opAdd_r")]
    AddR,
    #[strum(serialize = "opSub")]
    Sub,
    #[strum(serialize = "opSub_r")]
    SubR,
    #[strum(serialize = "opMul")]
    Mul,
    #[strum(serialize = "opMul_r")]
    MulR,
    #[strum(serialize = "opDiv")]
    Div,
    #[strum(serialize = "opDiv_r")]
    DivR,
    #[strum(serialize = "opMod")]
    Mod,
    #[strum(serialize = "opMod_r")]
    ModR,
    #[strum(serialize = "opNeg")]
    Neg,
    #[strum(serialize = "opAnd")]
    And,
    #[strum(serialize = "opAnd_r")]
    AndR,
    #[strum(serialize = "opOr")]
    Or,
    #[strum(serialize = "opOr_r")]
    OrR,
    #[strum(serialize = "opXor")]
    Xor,
    #[strum(serialize = "opXor_r")]
    XorR,
    #[strum(serialize = "opShl")]
    Shl,
    #[strum(serialize = "opShl_r")]
    ShlR,
    #[strum(serialize = "opShr")]
    Shr,
    #[strum(serialize = "opShr_r")]
    ShrR,
    #[strum(serialize = "opUShr")]
    UShr,
    #[strum(serialize = "opUShr_r")]
    UShrR,
    #[strum(serialize = "opCom")]
    Com,
    #[strum(serialize = "opAddAssign")]
    AddAssign,
    #[strum(serialize = "opSubAssign")]
    SubAssign,
    #[strum(serialize = "opMulAssign")]
    MulAssign,
    #[strum(serialize = "opDivAssign")]
    DivAssign,
    #[strum(serialize = "opModAssign")]
    ModAssign,
    #[strum(serialize = "opAndAssign")]
    AndAssign,
    #[strum(serialize = "opOrAssign")]
    OrAssign,
    #[strum(serialize = "opXorAssign")]
    XorAssign,
    #[strum(serialize = "opShlAssign")]
    ShlAssign,
    #[strum(serialize = "opShrAssign")]
    ShrAssign,
    #[strum(serialize = "opUShrAssign")]
    UShrAssign,
    #[strum(serialize = "opInc")]
    Inc,
    #[strum(serialize = "opDec")]
    Dec,
    #[strum(serialize = "opCat")]
    Cat,
    #[strum(serialize = "opCat_r")]
    CatR,
    #[strum(serialize = "opCatAssign")]
    CatAssign,
    #[strum(serialize = "opIndex")]
    Index,
    #[strum(serialize = "opIndexAssign")]
    IndexAssign,
    #[strum(serialize = "opSlice")]
    Slice,
    #[strum(serialize = "opSliceAssign")]
    SliceAssign,
    #[strum(serialize = "opField")]
    Field,
    #[strum(serialize = "opFieldAssign")]
    FieldAssign,
    #[strum(serialize = "opLength")]
    Length,
    #[strum(serialize = "opLengthAssign")]
    LengthAssign,
    #[strum(serialize = "opCmp")]
    Cmp,
    #[strum(serialize = "opEquals")]
    Equals,
    #[strum(serialize = "opIn")]
    In,
    #[strum(serialize = "opCall")]
    Call,
    #[strum(serialize = "opApply")]
    Apply,
    #[strum(serialize = "opMethod")]
    Method,
    #[strum(serialize = "toString")]
    ToString,
}

pub(crate) const NUM_METAMETHODS: usize = 54;

impl Metamethod {
    pub const ALL: [Self; NUM_METAMETHODS] = [
        Self::Add,
        Self::AddR,
        Self::Sub,
        Self::SubR,
        Self::Mul,
        Self::MulR,
        Self::Div,
        Self::DivR,
        Self::Mod,
        Self::ModR,
        Self::Neg,
        Self::And,
        Self::AndR,
        Self::Or,
        Self::OrR,
        Self::Xor,
        Self::XorR,
        Self::Shl,
        Self::ShlR,
        Self::Shr,
        Self::ShrR,
        Self::UShr,
        Self::UShrR,
        Self::Com,
        Self::AddAssign,
        Self::SubAssign,
        Self::MulAssign,
        Self::DivAssign,
        Self::ModAssign,
        Self::AndAssign,
        Self::OrAssign,
        Self::XorAssign,
        Self::ShlAssign,
        Self::ShrAssign,
        Self::UShrAssign,
        Self::Inc,
        Self::Dec,
        Self::Cat,
        Self::CatR,
        Self::CatAssign,
        Self::Index,
        Self::IndexAssign,
        Self::Slice,
        Self::SliceAssign,
        Self::Field,
        Self::FieldAssign,
        Self::Length,
        Self::LengthAssign,
        Self::Cmp,
        Self::Equals,
        Self::In,
        Self::Call,
        Self::Apply,
        Self::Method,
    ];

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Interns all metamethod names up front so lookup is id comparison.
    pub fn intern_all(interns: &mut Interns) -> Vec<StringId> {
        Self::ALL.iter().map(|mm| interns.intern(mm.name())).collect()
    }
}

/// Looks up the metamethod function for `v`, or `None` when absent.
pub(crate) fn get_metamethod(vm: &Vm, v: Value, mm: Metamethod) -> Option<Value> {
    let name = vm.mm_name(mm);
    match v {
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Instance(inst) => class_method(&vm.heap, inst.class, name),
            HeapData::Class(c) => c.get_method(name),
            _ => type_metatable_method(vm, vm.heap.get(id).kind(), name),
        },
        other => type_metatable_method(vm, other.kind(&vm.heap), name),
    }
}

fn class_method(heap: &Heap, class: HeapId, name: StringId) -> Option<Value> {
    match heap.get(class) {
        HeapData::Class(c) => c.get_method(name),
        _ => None,
    }
}

fn type_metatable_method(vm: &Vm, kind: CrocType, name: StringId) -> Option<Value> {
    let mt = vm.type_metatables[kind as usize]?;
    match vm.heap.get(mt) {
        HeapData::Namespace(ns) => ns.get(name),
        _ => None,
    }
}
