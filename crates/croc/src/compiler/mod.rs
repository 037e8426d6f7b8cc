//! Source-to-bytecode pipeline: lexer, parser, semantic pass, function
//! builder, code generator, and the optional doc extractor.
//!
//! The pipeline is pure with respect to the heap: it reads and extends the
//! intern table, and produces an [`FuncDefData`] tree the VM installs as a
//! funcdef object. No partial bytecode is ever installed - any phase error
//! aborts the whole compile.

pub(crate) mod ast;
pub(crate) mod builder;
pub(crate) mod codegen;
pub(crate) mod docgen;
pub(crate) mod lexer;
pub(crate) mod parser;
pub(crate) mod semantic;

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{
    bytecode::FuncDefData,
    errors::CompileError,
    intern::{Interns, StringId},
    value::Value,
};

/// A source position carried on tokens and AST nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompileLoc {
    pub file: StringId,
    pub line: u32,
    pub col: u32,
}

/// Compiler configuration and entry points.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CompilerFlags {
    /// Compile `assert()` statements (disabled compiles them away).
    pub asserts: bool,
    /// Capture doc comments and run the doc extractor.
    pub doc_comments: bool,
    /// Build the doc tables and attach the doc decorator to the module.
    pub doc_tables: bool,
}

impl Default for CompilerFlags {
    fn default() -> Self {
        Self {
            asserts: true,
            doc_comments: true,
            doc_tables: false,
        }
    }
}

/// Compiles a module: source text to a compiled function body (plus the doc
/// table when enabled). The returned body is the module's top-level vararg
/// function.
pub(crate) fn compile_module(
    interns: &mut Interns,
    flags: CompilerFlags,
    file_name: &str,
    source: &str,
) -> Result<(Rc<FuncDefData>, Option<docgen::DocTable>), CompileError> {
    let mut lexer = lexer::Lexer::new(interns, flags, file_name, source)?;
    let mut module = parser::Parser::new(&mut lexer).parse_module()?;
    let docs = if flags.doc_tables {
        Some(docgen::extract_module_docs(lexer.interns(), &module))
    } else {
        None
    };
    module = semantic::SemPass::new(lexer.interns_mut(), flags, file_name).run_module(module)?;
    let def = codegen::gen_module(lexer.interns_mut(), file_name, &module)?;
    Ok((def, docs))
}

/// Compiles loose statements as the body of an implicit vararg function.
pub(crate) fn compile_statements(
    interns: &mut Interns,
    flags: CompilerFlags,
    file_name: &str,
    source: &str,
) -> Result<Rc<FuncDefData>, CompileError> {
    let (def, _) = compile_module(interns, CompilerFlags { doc_tables: false, ..flags }, file_name, source)?;
    Ok(def)
}

/// Compiles a single expression as the body of a function returning it.
pub(crate) fn compile_expression(
    interns: &mut Interns,
    flags: CompilerFlags,
    file_name: &str,
    source: &str,
) -> Result<Rc<FuncDefData>, CompileError> {
    let wrapped = format!("return ({source})");
    compile_statements(interns, flags, file_name, &wrapped)
}

/// A compiled module in transportable form: the function-body tree plus the
/// interned strings it references. Installing into a VM re-interns the
/// strings and remaps every [`StringId`] in the tree, so artifacts are valid
/// across VM instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledModule {
    pub(crate) def: FuncDefDataOwned,
    pub(crate) strings: Vec<String>,
}

/// Serializable mirror of [`FuncDefData`] with owned nesting (no `Rc`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FuncDefDataOwned {
    inner: FuncDefData,
}

impl CompiledModule {
    pub(crate) fn capture(def: &FuncDefData, interns: &Interns) -> Self {
        let strings = (0..interns.len()).map(|i| interns.get(StringId::from_index(i)).to_owned()).collect();
        Self {
            def: FuncDefDataOwned { inner: def.clone() },
            strings,
        }
    }

    /// Re-interns the captured strings into `interns` and rewrites every id
    /// in the tree accordingly.
    pub(crate) fn install(&self, interns: &mut Interns) -> Rc<FuncDefData> {
        let remap: Vec<StringId> = self.strings.iter().map(|s| interns.intern(s)).collect();
        Rc::new(remap_def(&self.def.inner, &remap))
    }
}

fn remap_id(id: StringId, remap: &[StringId]) -> StringId {
    remap[id.index()]
}

fn remap_value(v: Value, remap: &[StringId]) -> Value {
    match v {
        Value::Str(id) => Value::Str(remap_id(id, remap)),
        other => other,
    }
}

fn remap_def(def: &FuncDefData, remap: &[StringId]) -> FuncDefData {
    let mut out = def.clone();
    out.file = remap_id(def.file, remap);
    out.name = remap_id(def.name, remap);
    out.constants = def.constants.iter().map(|&c| remap_value(c, remap)).collect();
    for table in &mut out.switch_tables {
        let old = std::mem::take(&mut table.offsets);
        for (k, off) in old {
            table.offsets.insert(remap_value(k, remap), off);
        }
    }
    for uv in &mut out.upvals {
        uv.name = remap_id(uv.name, remap);
    }
    for lv in &mut out.locals {
        lv.name = remap_id(lv.name, remap);
    }
    out.inner = def.inner.iter().map(|d| Rc::new(remap_def(d, remap))).collect();
    out
}
