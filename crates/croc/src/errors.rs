//! Error taxonomy shared by the compiler, the interpreter, and the host API.
//!
//! Compile-time failures are [`CompileError`]s carrying a phase and a source
//! location. Runtime failures travel through the interpreter as [`CrocError`]s
//! wrapping the thrown exception instance (or the uncatchable halt signal) and
//! are converted into the host-facing [`Exception`] at the API boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::value::Value;

/// Result alias for operations that can raise a runtime error.
pub(crate) type VmResult<T> = Result<T, CrocError>;

/// Standard exception kinds registered in the VM's exception class registry.
///
/// The string representation matches the class name exactly (e.g. `TypeError`
/// -> "TypeError"), which is also the global the class is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcKind {
    /// Base class of every standard exception; also the catch-all thrown by user code.
    Exception,

    /// Host used the embedding API incorrectly; typically a programmer bug.
    ApiError,
    /// Assertion failure raised by `assert(...)`.
    AssertError,
    /// Index outside the bounds of an array, memblock, string, or vararg list.
    BoundsError,
    /// Unresolved class/instance/namespace member.
    FieldError,
    /// Uncatchable cancellation of a running thread.
    HaltException,
    /// Module loading failure, including circular imports.
    ImportException,
    /// Malformed source text.
    LexicalException,
    /// Unresolved global name.
    NameError,
    /// Numeric value outside the representable/acceptable range.
    RangeError,
    /// Invariant violation or unimplemented path; catchable but usually fatal.
    RuntimeError,
    /// Error detected by the semantic pass or the code generator.
    SemanticException,
    /// Operation on an object in the wrong lifecycle state (threads, frozen classes).
    StateError,
    /// `switch` fell off the end without a default.
    SwitchError,
    /// Malformed program structure.
    SyntaxException,
    /// Operation applied to a value of the wrong type.
    TypeError,
    /// Invalid UTF-8 or invalid code point.
    UnicodeError,
    /// Structurally invalid argument (zero step, empty selector, ...).
    ValueError,
    /// Internal interpreter invariant violation.
    #[strum(serialize = "VMError")]
    VmError,
}

impl ExcKind {
    /// All kinds, in registration order. The registry and the globals are
    /// built by iterating this slice.
    pub(crate) const ALL: &'static [Self] = &[
        Self::Exception,
        Self::ApiError,
        Self::AssertError,
        Self::BoundsError,
        Self::FieldError,
        Self::HaltException,
        Self::ImportException,
        Self::LexicalException,
        Self::NameError,
        Self::RangeError,
        Self::RuntimeError,
        Self::SemanticException,
        Self::StateError,
        Self::SwitchError,
        Self::SyntaxException,
        Self::TypeError,
        Self::UnicodeError,
        Self::ValueError,
        Self::VmError,
    ];
}

/// A runtime error in flight inside the interpreter.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CrocError {
    /// A thrown exception instance. The location and traceback fields are
    /// filled in by the throw machinery if they are still null.
    Exc(Value),
    /// The uncatchable halt signal: skips catch frames, still runs finallys.
    Halt,
}

/// Which compilation phase rejected the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompilePhase {
    Lexical,
    Syntax,
    Semantic,
}

impl CompilePhase {
    pub(crate) fn exc_kind(self) -> ExcKind {
        match self {
            Self::Lexical => ExcKind::LexicalException,
            Self::Syntax => ExcKind::SyntaxException,
            Self::Semantic => ExcKind::SemanticException,
        }
    }
}

/// A compile-time error with its phase and source location.
///
/// `is_eof` is set when the lexer hit end-of-file inside a construct (an
/// unterminated string or block comment); interactive hosts use it to prompt
/// for more input instead of reporting an error.
#[derive(Debug, Clone)]
pub(crate) struct CompileError {
    pub phase: CompilePhase,
    pub msg: String,
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub is_eof: bool,
}

impl CompileError {
    pub(crate) fn new(phase: CompilePhase, msg: String, file: &str, line: u32, col: u32) -> Self {
        Self {
            phase,
            msg,
            file: file.to_owned(),
            line,
            col,
            is_eof: false,
        }
    }
}

/// A source location as reported on exceptions and tracebacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLoc {
    pub file: String,
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.file, self.line, self.col)
    }
}

/// Host-facing exception: the printable form of any compile-time or runtime
/// failure, with the standard-exception kind name, the message, the throw
/// location, and the traceback walking outward from the throw site.
#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: String,
    pub message: String,
    pub location: Option<CodeLoc>,
    pub traceback: Vec<CodeLoc>,
}

impl Exception {
    pub(crate) fn from_compile_error(e: &CompileError) -> Self {
        Self {
            kind: e.phase.exc_kind().to_string(),
            message: e.msg.clone(),
            location: Some(CodeLoc {
                file: e.file.clone(),
                line: e.line,
                col: e.col,
            }),
            traceback: Vec::new(),
        }
    }

    /// Renders the exception the way the CLI prints it: the message line
    /// followed by one indented traceback line per frame.
    #[must_use]
    pub fn traceback_string(&self) -> String {
        let mut out = self.to_string();
        for loc in &self.traceback {
            out.push_str("\n    at ");
            out.push_str(&loc.to_string());
        }
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}: {} [{}]", self.kind, self.message, loc),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for Exception {}
