#![doc = include_str!("../../../README.md")]
#![expect(dead_code, reason = "embedding API keeps some currently-unused surface")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior is part of the language semantics")]

mod bytecode;
mod compiler;
mod errors;
mod heap;
mod intern;
mod io;
mod object;
mod run;
mod types;
mod value;
mod vm;

pub use crate::{
    compiler::CompiledModule,
    errors::{CodeLoc, ExcKind, Exception},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::Object,
    run::Vm,
};
