//! Doc extraction: an optional pass over the parsed module recording
//! structured documentation into parallel tables.
//!
//! The extractor never affects execution - it reads the AST the parser
//! produced (before lowering) and builds a plain data structure hosts can
//! attach or serialize. Entries cover the module, functions, classes,
//! namespaces, and their fields, each with name, kind, source line, doc
//! text, and (for functions) parameter names.

use serde::{Deserialize, Serialize};

use crate::{
    compiler::ast::{ExpKind, Module, Stmt, StmtKind},
    intern::Interns,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum DocKind {
    Module,
    Function,
    Class,
    Namespace,
    Field,
    Variable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DocEntry {
    pub kind: DocKind,
    pub name: String,
    pub line: u32,
    /// Raw doc-comment text; empty when the declaration was undocumented.
    pub docs: String,
    /// Parameter names, for function entries.
    pub params: Vec<String>,
    /// Nested members, for class and namespace entries.
    pub children: Vec<DocEntry>,
}

/// The module's documentation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DocTable {
    pub module: DocEntry,
}

pub(crate) fn extract_module_docs(interns: &Interns, module: &Module) -> DocTable {
    let mut root = DocEntry {
        kind: DocKind::Module,
        name: "<module>".to_owned(),
        line: module.loc.line,
        docs: doc_text(interns, module.docs),
        params: Vec::new(),
        children: Vec::new(),
    };

    for stmt in &module.statements {
        if let Some(entry) = extract_stmt(interns, stmt) {
            root.children.push(entry);
        }
    }

    DocTable { module: root }
}

fn doc_text(interns: &Interns, docs: Option<(crate::intern::StringId, crate::compiler::CompileLoc)>) -> String {
    docs.map(|(id, _)| interns.get(id).to_owned()).unwrap_or_default()
}

fn extract_stmt(interns: &Interns, stmt: &Stmt) -> Option<DocEntry> {
    match &stmt.kind {
        StmtKind::FuncDecl { def, .. } => Some(DocEntry {
            kind: DocKind::Function,
            name: interns.get(def.name.name).to_owned(),
            line: def.loc.line,
            docs: doc_text(interns, def.docs),
            params: def.params.iter().map(|p| interns.get(p.name.name).to_owned()).collect(),
            children: Vec::new(),
        }),
        StmtKind::ClassDecl {
            name, fields, docs, ..
        } => {
            let mut entry = DocEntry {
                kind: DocKind::Class,
                name: interns.get(name.name).to_owned(),
                line: stmt.loc.line,
                docs: doc_text(interns, *docs),
                params: Vec::new(),
                children: Vec::new(),
            };
            for field in fields {
                let child = match &field.initializer.kind {
                    ExpKind::FuncLiteral(def) if field.is_method => DocEntry {
                        kind: DocKind::Function,
                        name: interns.get(field.name).to_owned(),
                        line: field.loc.line,
                        docs: doc_text(interns, field.docs),
                        params: def.params.iter().map(|p| interns.get(p.name.name).to_owned()).collect(),
                        children: Vec::new(),
                    },
                    _ => DocEntry {
                        kind: DocKind::Field,
                        name: interns.get(field.name).to_owned(),
                        line: field.loc.line,
                        docs: doc_text(interns, field.docs),
                        params: Vec::new(),
                        children: Vec::new(),
                    },
                };
                entry.children.push(child);
            }
            Some(entry)
        }
        StmtKind::NamespaceDecl {
            name, fields, docs, ..
        } => {
            let mut entry = DocEntry {
                kind: DocKind::Namespace,
                name: interns.get(name.name).to_owned(),
                line: stmt.loc.line,
                docs: doc_text(interns, *docs),
                params: Vec::new(),
                children: Vec::new(),
            };
            for field in fields {
                entry.children.push(match &field.initializer.kind {
                    ExpKind::FuncLiteral(def) => DocEntry {
                        kind: DocKind::Function,
                        name: interns.get(field.name).to_owned(),
                        line: field.loc.line,
                        docs: doc_text(interns, field.docs),
                        params: def.params.iter().map(|p| interns.get(p.name.name).to_owned()).collect(),
                        children: Vec::new(),
                    },
                    _ => DocEntry {
                        kind: DocKind::Field,
                        name: interns.get(field.name).to_owned(),
                        line: field.loc.line,
                        docs: doc_text(interns, field.docs),
                        params: Vec::new(),
                        children: Vec::new(),
                    },
                });
            }
            Some(entry)
        }
        StmtKind::VarDecl { names, .. } => names.first().map(|n| DocEntry {
            kind: DocKind::Variable,
            name: interns.get(n.name).to_owned(),
            line: stmt.loc.line,
            docs: String::new(),
            params: Vec::new(),
            children: Vec::new(),
        }),
        _ => None,
    }
}
