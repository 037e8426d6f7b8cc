//! Abstract syntax tree produced by the parser.
//!
//! Nodes carry their source span; the parser makes no semantic decisions, so
//! the tree still contains `scope(...)` statements, multi-clause catches,
//! unlowered imports, and default-protection declarations for the semantic
//! pass to resolve.

use crate::{compiler::CompileLoc, intern::StringId};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Ident {
    pub loc: CompileLoc,
    pub name: StringId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    /// Not written; defaults to local in nested scope, global at top level.
    Default,
    Local,
    Global,
}

/// Binary operators that produce a value in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
    Cmp3,
}

/// Comparison operators; these compile into branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Is,
    NotIs,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    /// The operator `!` rewrites a comparison into.
    pub fn inverted(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Is => Self::NotIs,
            Self::NotIs => Self::Is,
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Gt => Self::Le,
            Self::Ge => Self::Lt,
            Self::In => Self::NotIn,
            Self::NotIn => Self::In,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Exp {
    pub loc: CompileLoc,
    pub end_loc: CompileLoc,
    pub kind: ExpKind,
}

impl Exp {
    pub fn new(loc: CompileLoc, kind: ExpKind) -> Self {
        Self { loc, end_loc: loc, kind }
    }

    pub fn spanned(loc: CompileLoc, end_loc: CompileLoc, kind: ExpKind) -> Self {
        Self { loc, end_loc, kind }
    }

    /// Multi-return expressions may expand into several values in terminal
    /// positions.
    pub fn is_mult_ret(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::Call { .. } | ExpKind::MethodCall { .. } | ExpKind::Vararg | ExpKind::VargSlice { .. } | ExpKind::Yield { .. }
        )
    }

    /// Expressions with side effects may stand alone as statements.
    pub fn is_statement_exp(&self) -> bool {
        match &self.kind {
            ExpKind::Call { .. } | ExpKind::MethodCall { .. } | ExpKind::Yield { .. } => true,
            ExpKind::Paren(e) => e.is_statement_exp(),
            _ => false,
        }
    }

    /// Valid assignment targets.
    pub fn is_lhs(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::Ident(_)
                | ExpKind::Dot { .. }
                | ExpKind::Index { .. }
                | ExpKind::VargIndex { .. }
                | ExpKind::Slice { .. }
                | ExpKind::Len { .. }
        )
    }

    pub fn is_constant(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::Null | ExpKind::Bool(_) | ExpKind::Int(_) | ExpKind::Float(_) | ExpKind::Str(_)
        )
    }

    pub fn is_true_constant(&self) -> bool {
        match self.kind {
            ExpKind::Bool(b) => b,
            ExpKind::Int(i) => i != 0,
            ExpKind::Float(f) => f != 0.0,
            ExpKind::Str(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ExpKind {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(StringId),
    Ident(Ident),
    This,
    Vararg,
    VargLen,
    Paren(Box<Exp>),
    Cond {
        cond: Box<Exp>,
        op1: Box<Exp>,
        op2: Box<Exp>,
    },
    OrOr(Box<Exp>, Box<Exp>),
    AndAnd(Box<Exp>, Box<Exp>),
    Bin {
        op: BinOp,
        op1: Box<Exp>,
        op2: Box<Exp>,
    },
    Cmp {
        op: CmpOp,
        op1: Box<Exp>,
        op2: Box<Exp>,
    },
    /// N-ary after semantic collapses nested `~`.
    Cat {
        operands: Vec<Exp>,
        collapsed: bool,
    },
    Neg(Box<Exp>),
    Com(Box<Exp>),
    Not(Box<Exp>),
    Len(Box<Exp>),
    /// `x.super`
    DotSuper(Box<Exp>),
    Dot {
        op: Box<Exp>,
        name: Box<Exp>,
    },
    MethodCall {
        op: Box<Exp>,
        method: Box<Exp>,
        args: Vec<Exp>,
    },
    Call {
        op: Box<Exp>,
        /// `with`-context; defaults to null.
        context: Option<Box<Exp>>,
        args: Vec<Exp>,
    },
    Index {
        op: Box<Exp>,
        index: Box<Exp>,
    },
    VargIndex {
        index: Box<Exp>,
    },
    Slice {
        op: Box<Exp>,
        lo: Box<Exp>,
        hi: Box<Exp>,
    },
    VargSlice {
        lo: Box<Exp>,
        hi: Box<Exp>,
    },
    FuncLiteral(Box<FuncDef>),
    TableCtor {
        fields: Vec<(Exp, Exp)>,
    },
    ArrayCtor {
        values: Vec<Exp>,
    },
    Yield {
        args: Vec<Exp>,
    },
    TableComprehension {
        key: Box<Exp>,
        value: Box<Exp>,
        comp: Box<ForComp>,
    },
    ArrayComprehension {
        exp: Box<Exp>,
        comp: Box<ForComp>,
    },
}

/// A comprehension clause chain: `foreach ... [foreach ...] [if ...]`.
#[derive(Debug, Clone)]
pub(crate) enum ForComp {
    Foreach {
        loc: CompileLoc,
        end_loc: CompileLoc,
        indices: Vec<Ident>,
        container: Vec<Exp>,
        if_comp: Option<Box<Exp>>,
        next: Option<Box<ForComp>>,
    },
    ForNum {
        loc: CompileLoc,
        end_loc: CompileLoc,
        index: Ident,
        lo: Box<Exp>,
        hi: Box<Exp>,
        step: Box<Exp>,
        if_comp: Option<Box<Exp>>,
        next: Option<Box<ForComp>>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct FuncParam {
    pub name: Ident,
    /// Bitset over runtime kinds this parameter accepts.
    pub type_mask: u32,
    /// Class-typed constraints (`x: SomeClass`), checked by `CheckObjParam`.
    pub class_types: Vec<Exp>,
    /// Arbitrary constraint call (`x: @check`), checked by truth test.
    pub custom_constraint: Option<Exp>,
    /// Default value, applied when the argument is null.
    pub default: Option<Exp>,
}

#[derive(Debug, Clone)]
pub(crate) struct FuncDef {
    pub loc: CompileLoc,
    pub end_loc: CompileLoc,
    pub name: Ident,
    pub params: Vec<FuncParam>,
    pub is_vararg: bool,
    pub body: Box<Stmt>,
    pub docs: Option<(StringId, CompileLoc)>,
}

#[derive(Debug, Clone)]
pub(crate) struct Decorator {
    pub loc: CompileLoc,
    pub end_loc: CompileLoc,
    pub func: Exp,
    pub context: Option<Exp>,
    pub args: Vec<Exp>,
    pub next: Option<Box<Decorator>>,
}

#[derive(Debug, Clone)]
pub(crate) struct ClassField {
    pub name: StringId,
    pub loc: CompileLoc,
    pub initializer: Exp,
    /// Methods are functions attached to the class; everything else is a field.
    pub is_method: bool,
    pub is_override: bool,
    pub docs: Option<(StringId, CompileLoc)>,
}

#[derive(Debug, Clone)]
pub(crate) struct NamespaceField {
    pub name: StringId,
    pub loc: CompileLoc,
    pub initializer: Exp,
    pub docs: Option<(StringId, CompileLoc)>,
}

#[derive(Debug, Clone)]
pub(crate) struct CatchClause {
    pub catch_var: Ident,
    /// Exception class expressions; empty means catch-all.
    pub ex_types: Vec<Exp>,
    pub body: Box<Stmt>,
}

#[derive(Debug, Clone)]
pub(crate) struct CaseCond {
    pub exp: Exp,
}

#[derive(Debug, Clone)]
pub(crate) struct Case {
    pub loc: CompileLoc,
    pub conditions: Vec<CaseCond>,
    /// `case lo..hi:` range form (mutually exclusive with multiple conditions).
    pub high_range: Option<Exp>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeAction {
    Exit,
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub(crate) enum ForInit {
    Decl(Box<Stmt>),
    Stmt(Box<Stmt>),
}

#[derive(Debug, Clone)]
pub(crate) struct Stmt {
    pub loc: CompileLoc,
    pub end_loc: CompileLoc,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(loc: CompileLoc, kind: StmtKind) -> Self {
        Self { loc, end_loc: loc, kind }
    }

    pub fn spanned(loc: CompileLoc, end_loc: CompileLoc, kind: StmtKind) -> Self {
        Self { loc, end_loc, kind }
    }

    pub fn empty(loc: CompileLoc) -> Self {
        Self::new(loc, StmtKind::Block(Vec::new()))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum StmtKind {
    /// Block that introduces a scope.
    Scope(Box<Stmt>),
    /// Plain statement list (no scope of its own).
    Block(Vec<Stmt>),
    Expr(Exp),
    VarDecl {
        protection: Protection,
        names: Vec<Ident>,
        inits: Vec<Exp>,
    },
    FuncDecl {
        protection: Protection,
        def: Box<FuncDef>,
        decorator: Option<Box<Decorator>>,
    },
    ClassDecl {
        protection: Protection,
        name: Ident,
        bases: Vec<Exp>,
        fields: Vec<ClassField>,
        decorator: Option<Box<Decorator>>,
        docs: Option<(StringId, CompileLoc)>,
    },
    NamespaceDecl {
        protection: Protection,
        name: Ident,
        parent: Option<Exp>,
        fields: Vec<NamespaceField>,
        decorator: Option<Box<Decorator>>,
        docs: Option<(StringId, CompileLoc)>,
    },
    Import {
        expr: Exp,
        alias: Option<Ident>,
        /// Selected member names inside the module...
        symbols: Vec<Ident>,
        /// ...and the local names they bind to.
        symbol_names: Vec<Ident>,
    },
    Assert {
        cond: Exp,
        msg: Option<Exp>,
    },
    If {
        cond_var: Option<Ident>,
        cond: Exp,
        then_body: Box<Stmt>,
        else_body: Option<Box<Stmt>>,
    },
    While {
        name: Option<StringId>,
        cond_var: Option<Ident>,
        cond: Exp,
        body: Box<Stmt>,
    },
    DoWhile {
        name: Option<StringId>,
        body: Box<Stmt>,
        cond: Exp,
    },
    For {
        name: Option<StringId>,
        init: Vec<ForInit>,
        cond: Option<Exp>,
        step: Vec<Stmt>,
        body: Box<Stmt>,
    },
    ForNum {
        name: Option<StringId>,
        index: Ident,
        lo: Exp,
        hi: Exp,
        step: Exp,
        body: Box<Stmt>,
    },
    Foreach {
        name: Option<StringId>,
        indices: Vec<Ident>,
        container: Vec<Exp>,
        body: Box<Stmt>,
    },
    Switch {
        name: Option<StringId>,
        cond: Exp,
        cases: Vec<Case>,
        default: Option<Vec<Stmt>>,
    },
    Continue {
        name: Option<StringId>,
    },
    Break {
        name: Option<StringId>,
    },
    Return {
        exprs: Vec<Exp>,
    },
    TryCatch {
        body: Box<Stmt>,
        catches: Vec<CatchClause>,
        /// Filled by semantic: the hidden variable holding the caught value
        /// and the if/else chain the clauses lower into.
        hidden_var: Option<Ident>,
        transformed: Option<Box<Stmt>>,
    },
    TryFinally {
        body: Box<Stmt>,
        finally_body: Box<Stmt>,
    },
    Throw {
        exp: Exp,
        rethrowing: bool,
    },
    ScopeAction {
        action: ScopeAction,
        stmt: Box<Stmt>,
    },
    Assign {
        lhs: Vec<Exp>,
        rhs: Vec<Exp>,
    },
    OpAssign {
        op: BinOp,
        lhs: Exp,
        rhs: Exp,
    },
    CatAssign {
        lhs: Exp,
        operands: Vec<Exp>,
        collapsed: bool,
    },
    /// `lhs ?= rhs`: assign when lhs is null.
    CondAssign {
        lhs: Exp,
        rhs: Exp,
    },
    IncStmt(Exp),
    DecStmt(Exp),
}

/// A parsed module: its statements plus the optional module decorator.
#[derive(Debug, Clone)]
pub(crate) struct Module {
    pub loc: CompileLoc,
    pub end_loc: CompileLoc,
    pub statements: Vec<Stmt>,
    pub decorator: Option<Box<Decorator>>,
    pub docs: Option<(StringId, CompileLoc)>,
}
