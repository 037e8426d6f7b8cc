//! The semantic pass: an identity-shaped AST-to-AST transformation.
//!
//! Performs protection defaulting, constant folding, `!` inversion of
//! comparisons, concatenation flattening, dead-branch elimination for
//! constant conditions, and the desugarings the code generator relies on:
//! `import` into `modules.load(...)` plus bindings, multi-clause typed
//! catches into a hidden-variable if/else chain, and `scope(...)` statements
//! into try/catch/finally with hidden state variables. Also validates
//! `break`/`continue`/`return` against enclosing `finally` blocks and the
//! shapes of numeric-for bounds.

use crate::{
    compiler::{
        CompileLoc, CompilerFlags,
        ast::{
            BinOp, Case, CatchClause, CmpOp, Decorator, Exp, ExpKind, ForComp, ForInit, FuncDef, Ident, Module,
            Protection, ScopeAction, Stmt, StmtKind,
        },
    },
    errors::{CompileError, CompilePhase},
    intern::Interns,
};

type SResult<T> = Result<T, CompileError>;

pub(crate) struct SemPass<'a> {
    interns: &'a mut Interns,
    flags: CompilerFlags,
    file_name: String,
    /// Loop-nesting depth at each open `finally` block; used to reject
    /// breaks/continues that would cross a finally boundary.
    finally_stack: Vec<usize>,
    loop_depth: usize,
    dummy_counter: u32,
}

impl<'a> SemPass<'a> {
    pub fn new(interns: &'a mut Interns, flags: CompilerFlags, file_name: &str) -> Self {
        Self {
            interns,
            flags,
            file_name: file_name.to_owned(),
            finally_stack: Vec::new(),
            loop_depth: 0,
            dummy_counter: 0,
        }
    }

    fn error(&self, loc: CompileLoc, msg: impl Into<String>) -> CompileError {
        // Honor `#line` pragmas: the location's file wins over the input name.
        let file = self.interns.get(loc.file).to_owned();
        let file = if file.is_empty() { self.file_name.clone() } else { file };
        CompileError::new(CompilePhase::Semantic, msg.into(), &file, loc.line, loc.col)
    }

    fn dummy_ident(&mut self, loc: CompileLoc, prefix: &str) -> Ident {
        let name = format!("__{prefix}{}", self.dummy_counter);
        self.dummy_counter += 1;
        Ident {
            loc,
            name: self.interns.intern(&name),
        }
    }

    pub fn run_module(&mut self, mut m: Module) -> SResult<Module> {
        let statements = std::mem::take(&mut m.statements);
        m.statements = self.visit_block_contents(statements, true)?;
        if let Some(deco) = m.decorator.take() {
            m.decorator = Some(Box::new(self.visit_decorator(*deco)?));
        }
        Ok(m)
    }

    // === Statements ===

    fn visit_stmt(&mut self, s: Stmt, top_level: bool) -> SResult<Stmt> {
        let Stmt { loc, end_loc, kind } = s;
        let kind = match kind {
            StmtKind::Scope(inner) => {
                let inner = self.visit_stmt(*inner, false)?;
                StmtKind::Scope(Box::new(inner))
            }
            StmtKind::Block(stmts) => StmtKind::Block(self.visit_block_contents(stmts, false)?),
            StmtKind::Expr(e) => {
                let e = self.visit_exp(e)?;
                if !e.is_statement_exp() {
                    return Err(self.error(e.loc, "Expression cannot be used as a statement"));
                }
                StmtKind::Expr(e)
            }
            StmtKind::VarDecl { protection, names, inits } => {
                let protection = self.default_protection(protection, top_level);
                let inits = self.visit_exps(inits)?;
                StmtKind::VarDecl { protection, names, inits }
            }
            StmtKind::FuncDecl { protection, def, decorator } => {
                let protection = self.default_protection(protection, top_level);
                let def = Box::new(self.visit_func_def(*def)?);
                let decorator = self.visit_opt_decorator(decorator)?;
                StmtKind::FuncDecl { protection, def, decorator }
            }
            StmtKind::ClassDecl {
                protection,
                name,
                bases,
                mut fields,
                decorator,
                docs,
            } => {
                let protection = self.default_protection(protection, top_level);
                let bases = self.visit_exps(bases)?;
                for f in &mut fields {
                    let init = std::mem::replace(&mut f.initializer, Exp::new(loc, ExpKind::Null));
                    f.initializer = self.visit_exp(init)?;
                }
                let decorator = self.visit_opt_decorator(decorator)?;
                StmtKind::ClassDecl {
                    protection,
                    name,
                    bases,
                    fields,
                    decorator,
                    docs,
                }
            }
            StmtKind::NamespaceDecl {
                protection,
                name,
                parent,
                mut fields,
                decorator,
                docs,
            } => {
                let protection = self.default_protection(protection, top_level);
                let parent = match parent {
                    Some(p) => Some(self.visit_exp(p)?),
                    None => None,
                };
                for f in &mut fields {
                    let init = std::mem::replace(&mut f.initializer, Exp::new(loc, ExpKind::Null));
                    f.initializer = self.visit_exp(init)?;
                }
                let decorator = self.visit_opt_decorator(decorator)?;
                StmtKind::NamespaceDecl {
                    protection,
                    name,
                    parent,
                    fields,
                    decorator,
                    docs,
                }
            }
            StmtKind::Import {
                expr,
                alias,
                symbols,
                symbol_names,
            } => return self.lower_import(loc, end_loc, expr, alias, symbols, symbol_names),
            StmtKind::Assert { cond, msg } => return self.lower_assert(loc, end_loc, cond, msg),
            StmtKind::If {
                cond_var,
                cond,
                then_body,
                else_body,
            } => {
                let cond = self.visit_exp(cond)?;
                let then_body = Box::new(self.visit_stmt(*then_body, false)?);
                let else_body = match else_body {
                    Some(e) => Some(Box::new(self.visit_stmt(*e, false)?)),
                    None => None,
                };

                if cond.is_constant() {
                    if cond.is_true_constant() {
                        let then_stmt = *then_body;
                        return Ok(match cond_var {
                            None => Stmt::spanned(loc, end_loc, StmtKind::Scope(Box::new(then_stmt))),
                            Some(var) => {
                                let decl = Stmt::new(
                                    var.loc,
                                    StmtKind::VarDecl {
                                        protection: Protection::Local,
                                        names: vec![var],
                                        inits: vec![cond],
                                    },
                                );
                                Stmt::spanned(
                                    loc,
                                    end_loc,
                                    StmtKind::Scope(Box::new(Stmt::spanned(
                                        loc,
                                        end_loc,
                                        StmtKind::Block(vec![decl, then_stmt]),
                                    ))),
                                )
                            }
                        });
                    }
                    return Ok(match else_body {
                        Some(e) => Stmt::spanned(loc, end_loc, StmtKind::Scope(e)),
                        None => Stmt::empty(loc),
                    });
                }

                StmtKind::If {
                    cond_var,
                    cond,
                    then_body,
                    else_body,
                }
            }
            StmtKind::While { name, cond_var, cond, body } => {
                let cond = self.visit_exp(cond)?;
                self.loop_depth += 1;
                let body = Box::new(self.visit_stmt(*body, false)?);
                self.loop_depth -= 1;
                if cond.is_constant() && !cond.is_true_constant() {
                    return Ok(Stmt::empty(loc));
                }
                StmtKind::While { name, cond_var, cond, body }
            }
            StmtKind::DoWhile { name, body, cond } => {
                self.loop_depth += 1;
                let body = Box::new(self.visit_stmt(*body, false)?);
                self.loop_depth -= 1;
                let cond = self.visit_exp(cond)?;
                StmtKind::DoWhile { name, body, cond }
            }
            StmtKind::For {
                name,
                init,
                cond,
                step,
                body,
            } => {
                let init = init
                    .into_iter()
                    .map(|i| {
                        Ok(match i {
                            ForInit::Decl(d) => ForInit::Decl(Box::new(self.visit_stmt(*d, false)?)),
                            ForInit::Stmt(s) => ForInit::Stmt(Box::new(self.visit_stmt(*s, false)?)),
                        })
                    })
                    .collect::<SResult<Vec<_>>>()?;
                let mut cond = match cond {
                    Some(c) => Some(self.visit_exp(c)?),
                    None => None,
                };
                let step = self.visit_block_contents(step, false)?;
                self.loop_depth += 1;
                let body = Box::new(self.visit_stmt(*body, false)?);
                self.loop_depth -= 1;

                if let Some(c) = &cond {
                    if c.is_constant() {
                        if c.is_true_constant() {
                            cond = None;
                        } else {
                            // The loop never runs; only the initializers remain.
                            let inits: Vec<Stmt> = init
                                .into_iter()
                                .map(|i| match i {
                                    ForInit::Decl(d) | ForInit::Stmt(d) => *d,
                                })
                                .collect();
                            if inits.is_empty() {
                                return Ok(Stmt::empty(loc));
                            }
                            return Ok(Stmt::spanned(
                                loc,
                                end_loc,
                                StmtKind::Scope(Box::new(Stmt::spanned(loc, end_loc, StmtKind::Block(inits)))),
                            ));
                        }
                    }
                }

                StmtKind::For {
                    name,
                    init,
                    cond,
                    step,
                    body,
                }
            }
            StmtKind::ForNum {
                name,
                index,
                lo,
                hi,
                step,
                body,
            } => {
                let lo = self.visit_exp(lo)?;
                let hi = self.visit_exp(hi)?;
                let step = self.visit_exp(step)?;

                for (e, what) in [(&lo, "low"), (&hi, "high"), (&step, "step")] {
                    if e.is_constant() && !matches!(e.kind, ExpKind::Int(_)) {
                        return Err(self.error(e.loc, format!("Numeric for loop {what} value must be an integer")));
                    }
                }
                if let ExpKind::Int(0) = step.kind {
                    return Err(self.error(step.loc, "Numeric for loop step value may not be 0"));
                }

                self.loop_depth += 1;
                let body = Box::new(self.visit_stmt(*body, false)?);
                self.loop_depth -= 1;
                StmtKind::ForNum {
                    name,
                    index,
                    lo,
                    hi,
                    step,
                    body,
                }
            }
            StmtKind::Foreach {
                name,
                indices,
                container,
                body,
            } => {
                let container = self.visit_exps(container)?;
                self.loop_depth += 1;
                let body = Box::new(self.visit_stmt(*body, false)?);
                self.loop_depth -= 1;
                StmtKind::Foreach {
                    name,
                    indices,
                    container,
                    body,
                }
            }
            StmtKind::Switch {
                name,
                cond,
                mut cases,
                default,
            } => {
                let cond = self.visit_exp(cond)?;
                self.loop_depth += 1;
                for case in &mut cases {
                    self.visit_case(case)?;
                }
                let default = match default {
                    Some(d) => Some(self.visit_block_contents(d, false)?),
                    None => None,
                };
                self.loop_depth -= 1;
                StmtKind::Switch {
                    name,
                    cond,
                    cases,
                    default,
                }
            }
            StmtKind::Continue { name } => {
                self.check_loop_escape(loc, "continue")?;
                StmtKind::Continue { name }
            }
            StmtKind::Break { name } => {
                self.check_loop_escape(loc, "break")?;
                StmtKind::Break { name }
            }
            StmtKind::Return { exprs } => {
                if !self.finally_stack.is_empty() {
                    return Err(self.error(loc, "'return' may not be used inside a finally block"));
                }
                StmtKind::Return {
                    exprs: self.visit_exps(exprs)?,
                }
            }
            StmtKind::TryCatch {
                body,
                catches,
                hidden_var: _,
                transformed: _,
            } => return self.lower_try_catch(loc, end_loc, *body, catches),
            StmtKind::TryFinally { body, finally_body } => {
                let body = Box::new(self.visit_stmt(*body, false)?);
                self.finally_stack.push(self.loop_depth);
                let finally_body = Box::new(self.visit_stmt(*finally_body, false)?);
                self.finally_stack.pop();
                StmtKind::TryFinally { body, finally_body }
            }
            StmtKind::Throw { exp, rethrowing } => StmtKind::Throw {
                exp: self.visit_exp(exp)?,
                rethrowing,
            },
            StmtKind::ScopeAction { action, stmt } => {
                // Reached only for a scope action that ends its block; the
                // block visitor rewrites mid-block occurrences.
                let stmt = match action {
                    ScopeAction::Exit | ScopeAction::Success => {
                        self.finally_stack.push(self.loop_depth);
                        let s = self.visit_stmt(*stmt, false)?;
                        self.finally_stack.pop();
                        s
                    }
                    ScopeAction::Failure => self.visit_stmt(*stmt, false)?,
                };
                StmtKind::ScopeAction {
                    action,
                    stmt: Box::new(stmt),
                }
            }
            StmtKind::Assign { lhs, rhs } => StmtKind::Assign {
                lhs: self.visit_exps(lhs)?,
                rhs: self.visit_exps(rhs)?,
            },
            StmtKind::OpAssign { op, lhs, rhs } => StmtKind::OpAssign {
                op,
                lhs: self.visit_exp(lhs)?,
                rhs: self.visit_exp(rhs)?,
            },
            StmtKind::CatAssign {
                lhs,
                operands,
                collapsed: _,
            } => {
                let lhs = self.visit_exp(lhs)?;
                // `a ~= b ~ c` appends both operands in one CatEq.
                let mut flat = Vec::new();
                for op in operands {
                    let op = self.visit_exp(op)?;
                    match op.kind {
                        ExpKind::Cat { operands, .. } => flat.extend(operands),
                        _ => flat.push(op),
                    }
                }
                StmtKind::CatAssign {
                    lhs,
                    operands: flat,
                    collapsed: true,
                }
            }
            StmtKind::CondAssign { lhs, rhs } => StmtKind::CondAssign {
                lhs: self.visit_exp(lhs)?,
                rhs: self.visit_exp(rhs)?,
            },
            StmtKind::IncStmt(e) => StmtKind::IncStmt(self.visit_exp(e)?),
            StmtKind::DecStmt(e) => StmtKind::DecStmt(self.visit_exp(e)?),
        };
        Ok(Stmt::spanned(loc, end_loc, kind))
    }

    fn check_loop_escape(&self, loc: CompileLoc, what: &str) -> SResult<()> {
        if let Some(&depth_at_finally) = self.finally_stack.last() {
            if self.loop_depth == depth_at_finally {
                return Err(self.error(loc, format!("'{what}' may not leave a finally block")));
            }
        }
        Ok(())
    }

    fn default_protection(&self, p: Protection, top_level: bool) -> Protection {
        match p {
            Protection::Default => {
                if top_level {
                    Protection::Global
                } else {
                    Protection::Local
                }
            }
            other => other,
        }
    }

    fn visit_block_contents(&mut self, stmts: Vec<Stmt>, top_level: bool) -> SResult<Vec<Stmt>> {
        let mut out: Vec<Stmt> = Vec::with_capacity(stmts.len());
        let mut iter = stmts.into_iter();

        while let Some(s) = iter.next() {
            if let StmtKind::ScopeAction { action, stmt } = s.kind {
                let rest: Vec<Stmt> = iter.collect();
                let loc = s.loc;
                let end_loc = s.end_loc;
                let lowered = self.lower_scope_action(loc, end_loc, action, *stmt, rest, top_level)?;
                out.push(lowered);
                return Ok(out);
            }
            out.push(self.visit_stmt(s, top_level)?);
        }
        Ok(out)
    }

    // === Lowerings ===

    /// `import name [as x] [: a, b]` becomes a `modules.load(name)` call with
    /// local bindings; selective imports without an alias hold the module
    /// namespace in a hidden local.
    fn lower_import(
        &mut self,
        loc: CompileLoc,
        end_loc: CompileLoc,
        expr: Exp,
        alias: Option<Ident>,
        symbols: Vec<Ident>,
        symbol_names: Vec<Ident>,
    ) -> SResult<Stmt> {
        let expr = self.visit_exp(expr)?;
        if expr.is_constant() && !matches!(expr.kind, ExpKind::Str(_)) {
            return Err(self.error(expr.loc, "Import expression must evaluate to a string"));
        }

        let modules_id = self.interns.intern("modules");
        let load_id = self.interns.intern("load");
        let call = Exp::spanned(
            loc,
            end_loc,
            ExpKind::MethodCall {
                op: Box::new(Exp::new(loc, ExpKind::Ident(Ident { loc, name: modules_id }))),
                method: Box::new(Exp::new(loc, ExpKind::Str(load_id))),
                args: vec![expr],
            },
        );

        let selective = |src: Ident, stmts: &mut Vec<Stmt>| {
            for (sym, bind) in symbols.iter().zip(&symbol_names) {
                let dot = Exp::spanned(
                    sym.loc,
                    sym.loc,
                    ExpKind::Dot {
                        op: Box::new(Exp::new(sym.loc, ExpKind::Ident(src))),
                        name: Box::new(Exp::new(sym.loc, ExpKind::Str(sym.name))),
                    },
                );
                stmts.push(Stmt::new(
                    sym.loc,
                    StmtKind::Assign {
                        lhs: vec![Exp::new(bind.loc, ExpKind::Ident(*bind))],
                        rhs: vec![dot],
                    },
                ));
            }
        };

        let mut stmts = Vec::new();

        // Selectively-imported names become locals up front.
        if !symbol_names.is_empty() {
            stmts.push(Stmt::new(
                loc,
                StmtKind::VarDecl {
                    protection: Protection::Local,
                    names: symbol_names.clone(),
                    inits: Vec::new(),
                },
            ));
        }

        match alias {
            None if symbols.is_empty() => {
                stmts.push(Stmt::spanned(loc, end_loc, StmtKind::Expr(call)));
            }
            None => {
                let tmp = self.dummy_ident(loc, "tempimport");
                let mut inner = vec![Stmt::new(
                    loc,
                    StmtKind::VarDecl {
                        protection: Protection::Local,
                        names: vec![tmp],
                        inits: vec![call],
                    },
                )];
                selective(tmp, &mut inner);
                stmts.push(Stmt::spanned(
                    loc,
                    end_loc,
                    StmtKind::Scope(Box::new(Stmt::spanned(loc, end_loc, StmtKind::Block(inner)))),
                ));
            }
            Some(name) => {
                stmts.push(Stmt::new(
                    loc,
                    StmtKind::VarDecl {
                        protection: Protection::Local,
                        names: vec![name],
                        inits: vec![call],
                    },
                ));
                selective(name, &mut stmts);
            }
        }

        let block = Stmt::spanned(loc, end_loc, StmtKind::Block(stmts));
        self.visit_stmt(block, false)
    }

    fn lower_assert(&mut self, loc: CompileLoc, end_loc: CompileLoc, cond: Exp, msg: Option<Exp>) -> SResult<Stmt> {
        if !self.flags.asserts {
            return Ok(Stmt::empty(loc));
        }
        let cond = self.visit_exp(cond)?;
        let msg = match msg {
            Some(m) => self.visit_exp(m)?,
            None => {
                let text = format!("Assertion failure at {}({}:{})", self.file_name, loc.line, loc.col);
                Exp::new(loc, ExpKind::Str(self.interns.intern(&text)))
            }
        };
        Ok(Stmt::spanned(loc, end_loc, StmtKind::Assert { cond, msg: Some(msg) }))
    }

    /// Multi-clause typed catches collapse into one hidden-variable catch
    /// whose body tests `__catchN.super is Ti`; an untyped catchall is the
    /// trailing else, otherwise the caught value is rethrown.
    fn lower_try_catch(
        &mut self,
        loc: CompileLoc,
        end_loc: CompileLoc,
        body: Stmt,
        catches: Vec<CatchClause>,
    ) -> SResult<Stmt> {
        let body = self.visit_stmt(body, false)?;
        let catches: Vec<CatchClause> = catches
            .into_iter()
            .map(|c| {
                Ok(CatchClause {
                    catch_var: c.catch_var,
                    ex_types: self.visit_exps(c.ex_types)?,
                    body: Box::new(self.visit_stmt(*c.body, false)?),
                })
            })
            .collect::<SResult<Vec<_>>>()?;

        let first_loc = catches.first().map_or(loc, |c| c.catch_var.loc);
        let cvar = self.dummy_ident(first_loc, "catch");
        let cvar_exp = Exp::new(cvar.loc, ExpKind::Ident(cvar));
        let super_exp = Exp::new(cvar.loc, ExpKind::DotSuper(Box::new(cvar_exp.clone())));

        let mut stmt: Option<Stmt> = None;

        if catches.last().is_some_and(|c| !c.ex_types.is_empty()) {
            stmt = Some(Stmt::new(
                end_loc,
                StmtKind::Throw {
                    exp: cvar_exp.clone(),
                    rethrowing: true,
                },
            ));
        }

        for clause in catches.into_iter().rev() {
            let cloc = clause.catch_var.loc;

            // local user = __catchN; <clause body>
            let decl = Stmt::new(
                cloc,
                StmtKind::VarDecl {
                    protection: Protection::Local,
                    names: vec![clause.catch_var],
                    inits: vec![cvar_exp.clone()],
                },
            );
            let if_code = Stmt::spanned(
                cloc,
                clause.body.end_loc,
                StmtKind::Scope(Box::new(Stmt::spanned(
                    cloc,
                    clause.body.end_loc,
                    StmtKind::Block(vec![decl, *clause.body]),
                ))),
            );

            stmt = Some(match stmt {
                None => if_code,
                Some(else_stmt) => {
                    let mut cond: Option<Exp> = None;
                    for ty in clause.ex_types {
                        let test = Exp::spanned(
                            cloc,
                            cloc,
                            ExpKind::Cmp {
                                op: CmpOp::Is,
                                op1: Box::new(super_exp.clone()),
                                op2: Box::new(ty),
                            },
                        );
                        cond = Some(match cond {
                            None => test,
                            Some(prev) => Exp::spanned(cloc, cloc, ExpKind::OrOr(Box::new(prev), Box::new(test))),
                        });
                    }
                    let cond = cond.expect("typed clause has at least one type");
                    Stmt::spanned(
                        cloc,
                        else_stmt.end_loc,
                        StmtKind::If {
                            cond_var: None,
                            cond,
                            then_body: Box::new(if_code),
                            else_body: Some(Box::new(else_stmt)),
                        },
                    )
                }
            });
        }

        Ok(Stmt::spanned(
            loc,
            end_loc,
            StmtKind::TryCatch {
                body: Box::new(body),
                catches: Vec::new(),
                hidden_var: Some(cvar),
                transformed: Some(Box::new(stmt.expect("at least one catch clause"))),
            },
        ))
    }

    /// Rewrites `scope(...) S; rest...` into the equivalent
    /// try/catch/finally over the rest of the block.
    fn lower_scope_action(
        &mut self,
        loc: CompileLoc,
        end_loc: CompileLoc,
        action: ScopeAction,
        action_stmt: Stmt,
        rest: Vec<Stmt>,
        top_level: bool,
    ) -> SResult<Stmt> {
        if rest.is_empty() {
            // Nothing follows: the action body either always or never runs.
            return match action {
                ScopeAction::Exit | ScopeAction::Success => self.visit_stmt(action_stmt, top_level),
                ScopeAction::Failure => Ok(Stmt::empty(loc)),
            };
        }

        let rest_loc = rest.first().expect("nonempty").loc;
        let rest_end = rest.last().expect("nonempty").end_loc;
        let try_body = Stmt::spanned(
            rest_loc,
            rest_end,
            StmtKind::Scope(Box::new(Stmt::spanned(rest_loc, rest_end, StmtKind::Block(rest)))),
        );

        let lowered = match action {
            ScopeAction::Exit => Stmt::spanned(
                loc,
                end_loc,
                StmtKind::TryFinally {
                    body: Box::new(try_body),
                    finally_body: Box::new(action_stmt),
                },
            ),
            ScopeAction::Failure => {
                // try { rest } catch(__scopeN) { S; throw __scopeN }
                let catch_var = self.dummy_ident(loc, "scope");
                let rethrow = Stmt::new(
                    action_stmt.end_loc,
                    StmtKind::Throw {
                        exp: Exp::new(catch_var.loc, ExpKind::Ident(catch_var)),
                        rethrowing: true,
                    },
                );
                let catch_body = Stmt::spanned(
                    loc,
                    end_loc,
                    StmtKind::Scope(Box::new(Stmt::spanned(
                        loc,
                        end_loc,
                        StmtKind::Block(vec![action_stmt, rethrow]),
                    ))),
                );
                Stmt::spanned(
                    loc,
                    end_loc,
                    StmtKind::TryCatch {
                        body: Box::new(try_body),
                        catches: vec![CatchClause {
                            catch_var,
                            ex_types: Vec::new(),
                            body: Box::new(catch_body),
                        }],
                        hidden_var: None,
                        transformed: None,
                    },
                )
            }
            ScopeAction::Success => {
                // local __scopeN = true
                // try { rest } catch(__scopeM) { __scopeN = false; throw __scopeM }
                // finally { if(__scopeN) S }
                let finished = self.dummy_ident(loc, "scope");
                let finished_exp = Exp::new(loc, ExpKind::Ident(finished));
                let decl = Stmt::new(
                    loc,
                    StmtKind::VarDecl {
                        protection: Protection::Local,
                        names: vec![finished],
                        inits: vec![Exp::new(loc, ExpKind::Bool(true))],
                    },
                );

                let catch_var = self.dummy_ident(loc, "scope");
                let set_false = Stmt::new(
                    loc,
                    StmtKind::Assign {
                        lhs: vec![finished_exp.clone()],
                        rhs: vec![Exp::new(loc, ExpKind::Bool(false))],
                    },
                );
                let rethrow = Stmt::new(
                    loc,
                    StmtKind::Throw {
                        exp: Exp::new(catch_var.loc, ExpKind::Ident(catch_var)),
                        rethrowing: true,
                    },
                );
                let catch_body = Stmt::spanned(
                    loc,
                    end_loc,
                    StmtKind::Scope(Box::new(Stmt::spanned(loc, end_loc, StmtKind::Block(vec![set_false, rethrow])))),
                );
                let try_catch = Stmt::spanned(
                    loc,
                    end_loc,
                    StmtKind::TryCatch {
                        body: Box::new(try_body),
                        catches: vec![CatchClause {
                            catch_var,
                            ex_types: Vec::new(),
                            body: Box::new(catch_body),
                        }],
                        hidden_var: None,
                        transformed: None,
                    },
                );

                let finally_body = Stmt::spanned(
                    loc,
                    end_loc,
                    StmtKind::If {
                        cond_var: None,
                        cond: finished_exp,
                        then_body: Box::new(action_stmt),
                        else_body: None,
                    },
                );
                let try_finally = Stmt::spanned(
                    loc,
                    end_loc,
                    StmtKind::TryFinally {
                        body: Box::new(try_catch),
                        finally_body: Box::new(finally_body),
                    },
                );

                Stmt::spanned(
                    loc,
                    end_loc,
                    StmtKind::Scope(Box::new(Stmt::spanned(loc, end_loc, StmtKind::Block(vec![decl, try_finally])))),
                )
            }
        };

        self.visit_stmt(lowered, top_level)
    }

    fn visit_case(&mut self, case: &mut Case) -> SResult<()> {
        for cond in &mut case.conditions {
            let e = std::mem::replace(&mut cond.exp, Exp::new(case.loc, ExpKind::Null));
            cond.exp = self.visit_exp(e)?;
        }
        if let Some(hi) = case.high_range.take() {
            let hi = self.visit_exp(hi)?;
            let lo = &case.conditions[0].exp;
            if lo.is_constant() && hi.is_constant() {
                let ok = matches!(
                    (&lo.kind, &hi.kind),
                    (ExpKind::Int(_), ExpKind::Int(_))
                        | (ExpKind::Int(_), ExpKind::Float(_))
                        | (ExpKind::Float(_), ExpKind::Int(_))
                        | (ExpKind::Float(_), ExpKind::Float(_))
                        | (ExpKind::Str(_), ExpKind::Str(_))
                );
                if !ok {
                    return Err(self.error(hi.loc, "Case range bounds must both be numbers or both be strings"));
                }
            }
            case.high_range = Some(hi);
        }
        let body = std::mem::take(&mut case.body);
        case.body = self.visit_block_contents(body, false)?;
        Ok(())
    }

    fn visit_func_def(&mut self, mut def: FuncDef) -> SResult<FuncDef> {
        // Function bodies get a fresh control-flow context.
        let saved_finally = std::mem::take(&mut self.finally_stack);
        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);

        for p in &mut def.params {
            if let Some(d) = p.default.take() {
                p.default = Some(self.visit_exp(d)?);
            }
            let types = std::mem::take(&mut p.class_types);
            p.class_types = self.visit_exps(types)?;
            if let Some(c) = p.custom_constraint.take() {
                p.custom_constraint = Some(self.visit_exp(c)?);
            }
        }

        let body = std::mem::replace(&mut def.body, Box::new(Stmt::empty(def.loc)));
        def.body = Box::new(self.visit_stmt(*body, false)?);

        self.finally_stack = saved_finally;
        self.loop_depth = saved_loops;
        Ok(def)
    }

    fn visit_opt_decorator(&mut self, d: Option<Box<Decorator>>) -> SResult<Option<Box<Decorator>>> {
        match d {
            Some(d) => Ok(Some(Box::new(self.visit_decorator(*d)?))),
            None => Ok(None),
        }
    }

    fn visit_decorator(&mut self, mut d: Decorator) -> SResult<Decorator> {
        d.func = self.visit_exp(d.func)?;
        if let Some(ctx) = d.context.take() {
            d.context = Some(self.visit_exp(ctx)?);
        }
        d.args = self.visit_exps(d.args)?;
        if let Some(next) = d.next.take() {
            d.next = Some(Box::new(self.visit_decorator(*next)?));
        }
        Ok(d)
    }

    // === Expressions ===

    fn visit_exps(&mut self, exps: Vec<Exp>) -> SResult<Vec<Exp>> {
        exps.into_iter().map(|e| self.visit_exp(e)).collect()
    }

    fn visit_exp(&mut self, e: Exp) -> SResult<Exp> {
        let Exp { loc, end_loc, kind } = e;
        let out = match kind {
            ExpKind::Paren(inner) => {
                let inner = self.visit_exp(*inner)?;
                if inner.is_mult_ret() {
                    Exp::spanned(loc, end_loc, ExpKind::Paren(Box::new(inner)))
                } else {
                    inner
                }
            }
            ExpKind::Cond { cond, op1, op2 } => {
                let cond = self.visit_exp(*cond)?;
                let op1 = self.visit_exp(*op1)?;
                let op2 = self.visit_exp(*op2)?;
                if cond.is_constant() {
                    if cond.is_true_constant() { op1 } else { op2 }
                } else {
                    Exp::spanned(
                        loc,
                        end_loc,
                        ExpKind::Cond {
                            cond: Box::new(cond),
                            op1: Box::new(op1),
                            op2: Box::new(op2),
                        },
                    )
                }
            }
            ExpKind::OrOr(op1, op2) => {
                let op1 = self.visit_exp(*op1)?;
                let op2 = self.visit_exp(*op2)?;
                if op1.is_constant() {
                    if op1.is_true_constant() { op1 } else { op2 }
                } else {
                    Exp::spanned(loc, end_loc, ExpKind::OrOr(Box::new(op1), Box::new(op2)))
                }
            }
            ExpKind::AndAnd(op1, op2) => {
                let op1 = self.visit_exp(*op1)?;
                let op2 = self.visit_exp(*op2)?;
                if op1.is_constant() {
                    if op1.is_true_constant() { op2 } else { op1 }
                } else {
                    Exp::spanned(loc, end_loc, ExpKind::AndAnd(Box::new(op1), Box::new(op2)))
                }
            }
            ExpKind::Bin { op, op1, op2 } => {
                let op1 = self.visit_exp(*op1)?;
                let op2 = self.visit_exp(*op2)?;
                return self.fold_bin(loc, end_loc, op, op1, op2);
            }
            ExpKind::Cmp { op, op1, op2 } => {
                let op1 = self.visit_exp(*op1)?;
                let op2 = self.visit_exp(*op2)?;
                return self.fold_cmp(loc, end_loc, op, op1, op2);
            }
            ExpKind::Cat { operands, collapsed } => {
                if collapsed {
                    Exp::spanned(loc, end_loc, ExpKind::Cat { operands, collapsed })
                } else {
                    return self.fold_cat(loc, end_loc, operands);
                }
            }
            ExpKind::Neg(op) => {
                let op = self.visit_exp(*op)?;
                match op.kind {
                    ExpKind::Int(i) => Exp::spanned(loc, end_loc, ExpKind::Int(i.wrapping_neg())),
                    ExpKind::Float(f) => Exp::spanned(loc, end_loc, ExpKind::Float(-f)),
                    _ if op.is_constant() => {
                        return Err(self.error(loc, "Negation must be performed on numbers"));
                    }
                    _ => Exp::spanned(loc, end_loc, ExpKind::Neg(Box::new(op))),
                }
            }
            ExpKind::Com(op) => {
                let op = self.visit_exp(*op)?;
                match op.kind {
                    ExpKind::Int(i) => Exp::spanned(loc, end_loc, ExpKind::Int(!i)),
                    _ if op.is_constant() => {
                        return Err(self.error(loc, "Bitwise complement must be performed on integers"));
                    }
                    _ => Exp::spanned(loc, end_loc, ExpKind::Com(Box::new(op))),
                }
            }
            ExpKind::Not(op) => {
                let op = self.visit_exp(*op)?;
                return self.fold_not(loc, end_loc, op);
            }
            ExpKind::Len(op) => {
                let op = self.visit_exp(*op)?;
                match op.kind {
                    ExpKind::Str(id) => {
                        let len = self.interns.cp_len(id) as i64;
                        Exp::spanned(loc, end_loc, ExpKind::Int(len))
                    }
                    _ if op.is_constant() => {
                        return Err(self.error(loc, "Length must be performed on a string at compile time"));
                    }
                    _ => Exp::spanned(loc, end_loc, ExpKind::Len(Box::new(op))),
                }
            }
            ExpKind::DotSuper(op) => Exp::spanned(loc, end_loc, ExpKind::DotSuper(Box::new(self.visit_exp(*op)?))),
            ExpKind::Dot { op, name } => {
                let op = self.visit_exp(*op)?;
                let name = self.visit_exp(*name)?;
                if name.is_constant() && !matches!(name.kind, ExpKind::Str(_)) {
                    return Err(self.error(name.loc, "Field name must be a string"));
                }
                Exp::spanned(
                    loc,
                    end_loc,
                    ExpKind::Dot {
                        op: Box::new(op),
                        name: Box::new(name),
                    },
                )
            }
            ExpKind::MethodCall { op, method, args } => {
                let op = self.visit_exp(*op)?;
                let method = self.visit_exp(*method)?;
                if method.is_constant() && !matches!(method.kind, ExpKind::Str(_)) {
                    return Err(self.error(method.loc, "Method name must be a string"));
                }
                Exp::spanned(
                    loc,
                    end_loc,
                    ExpKind::MethodCall {
                        op: Box::new(op),
                        method: Box::new(method),
                        args: self.visit_exps(args)?,
                    },
                )
            }
            ExpKind::Call { op, context, args } => {
                let op = self.visit_exp(*op)?;
                let context = match context {
                    Some(c) => Some(Box::new(self.visit_exp(*c)?)),
                    None => None,
                };
                Exp::spanned(
                    loc,
                    end_loc,
                    ExpKind::Call {
                        op: Box::new(op),
                        context,
                        args: self.visit_exps(args)?,
                    },
                )
            }
            ExpKind::Index { op, index } => {
                let op = self.visit_exp(*op)?;
                let index = self.visit_exp(*index)?;
                if op.is_constant() && index.is_constant() {
                    let (ExpKind::Str(sid), ExpKind::Int(i)) = (&op.kind, &index.kind) else {
                        return Err(self.error(loc, "Can only index strings with integers at compile time"));
                    };
                    let len = self.interns.cp_len(*sid) as i64;
                    let idx = if *i < 0 { i + len } else { *i };
                    if idx < 0 || idx >= len {
                        return Err(self.error(loc, "Invalid string index at compile time"));
                    }
                    let c = self.interns.char_at(*sid, idx as usize).expect("in bounds");
                    let id = self.interns.intern(&c.to_string());
                    Exp::spanned(loc, end_loc, ExpKind::Str(id))
                } else {
                    Exp::spanned(
                        loc,
                        end_loc,
                        ExpKind::Index {
                            op: Box::new(op),
                            index: Box::new(index),
                        },
                    )
                }
            }
            ExpKind::VargIndex { index } => Exp::spanned(
                loc,
                end_loc,
                ExpKind::VargIndex {
                    index: Box::new(self.visit_exp(*index)?),
                },
            ),
            ExpKind::Slice { op, lo, hi } => Exp::spanned(
                loc,
                end_loc,
                ExpKind::Slice {
                    op: Box::new(self.visit_exp(*op)?),
                    lo: Box::new(self.visit_exp(*lo)?),
                    hi: Box::new(self.visit_exp(*hi)?),
                },
            ),
            ExpKind::VargSlice { lo, hi } => Exp::spanned(
                loc,
                end_loc,
                ExpKind::VargSlice {
                    lo: Box::new(self.visit_exp(*lo)?),
                    hi: Box::new(self.visit_exp(*hi)?),
                },
            ),
            ExpKind::FuncLiteral(def) => {
                Exp::spanned(loc, end_loc, ExpKind::FuncLiteral(Box::new(self.visit_func_def(*def)?)))
            }
            ExpKind::TableCtor { fields } => {
                let fields = fields
                    .into_iter()
                    .map(|(k, v)| Ok((self.visit_exp(k)?, self.visit_exp(v)?)))
                    .collect::<SResult<Vec<_>>>()?;
                Exp::spanned(loc, end_loc, ExpKind::TableCtor { fields })
            }
            ExpKind::ArrayCtor { values } => Exp::spanned(
                loc,
                end_loc,
                ExpKind::ArrayCtor {
                    values: self.visit_exps(values)?,
                },
            ),
            ExpKind::Yield { args } => Exp::spanned(
                loc,
                end_loc,
                ExpKind::Yield {
                    args: self.visit_exps(args)?,
                },
            ),
            ExpKind::TableComprehension { key, value, comp } => Exp::spanned(
                loc,
                end_loc,
                ExpKind::TableComprehension {
                    key: Box::new(self.visit_exp(*key)?),
                    value: Box::new(self.visit_exp(*value)?),
                    comp: Box::new(self.visit_for_comp(*comp)?),
                },
            ),
            ExpKind::ArrayComprehension { exp, comp } => Exp::spanned(
                loc,
                end_loc,
                ExpKind::ArrayComprehension {
                    exp: Box::new(self.visit_exp(*exp)?),
                    comp: Box::new(self.visit_for_comp(*comp)?),
                },
            ),
            leaf @ (ExpKind::Null
            | ExpKind::Bool(_)
            | ExpKind::Int(_)
            | ExpKind::Float(_)
            | ExpKind::Str(_)
            | ExpKind::Ident(_)
            | ExpKind::This
            | ExpKind::Vararg
            | ExpKind::VargLen) => Exp::spanned(loc, end_loc, leaf),
        };
        Ok(out)
    }

    fn visit_for_comp(&mut self, comp: ForComp) -> SResult<ForComp> {
        Ok(match comp {
            ForComp::Foreach {
                loc,
                end_loc,
                indices,
                container,
                if_comp,
                next,
            } => ForComp::Foreach {
                loc,
                end_loc,
                indices,
                container: self.visit_exps(container)?,
                if_comp: match if_comp {
                    Some(c) => Some(Box::new(self.visit_exp(*c)?)),
                    None => None,
                },
                next: match next {
                    Some(n) => Some(Box::new(self.visit_for_comp(*n)?)),
                    None => None,
                },
            },
            ForComp::ForNum {
                loc,
                end_loc,
                index,
                lo,
                hi,
                step,
                if_comp,
                next,
            } => ForComp::ForNum {
                loc,
                end_loc,
                index,
                lo: Box::new(self.visit_exp(*lo)?),
                hi: Box::new(self.visit_exp(*hi)?),
                step: Box::new(self.visit_exp(*step)?),
                if_comp: match if_comp {
                    Some(c) => Some(Box::new(self.visit_exp(*c)?)),
                    None => None,
                },
                next: match next {
                    Some(n) => Some(Box::new(self.visit_for_comp(*n)?)),
                    None => None,
                },
            },
        })
    }

    // === Folding helpers ===

    fn fold_bin(&mut self, loc: CompileLoc, end_loc: CompileLoc, op: BinOp, op1: Exp, op2: Exp) -> SResult<Exp> {
        use ExpKind as K;

        if op1.is_constant() && op2.is_constant() {
            match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                    return self.fold_arith(loc, end_loc, op, &op1, &op2);
                }
                BinOp::And | BinOp::Or | BinOp::Xor | BinOp::Shl | BinOp::Shr | BinOp::UShr => {
                    let (K::Int(a), K::Int(b)) = (&op1.kind, &op2.kind) else {
                        return Err(self.error(loc, "Bitwise operations must be performed on integers"));
                    };
                    let (a, b) = (*a, *b);
                    let v = match op {
                        BinOp::And => a & b,
                        BinOp::Or => a | b,
                        BinOp::Xor => a ^ b,
                        BinOp::Shl => a.wrapping_shl(b as u32),
                        BinOp::Shr => a.wrapping_shr(b as u32),
                        BinOp::UShr => ((a as u64).wrapping_shr(b as u32)) as i64,
                        _ => unreachable!(),
                    };
                    return Ok(Exp::spanned(loc, end_loc, K::Int(v)));
                }
                BinOp::Cmp3 => {
                    let v = self.common_compare(&op1, &op2)?;
                    return Ok(Exp::spanned(loc, end_loc, K::Int(v)));
                }
            }
        }

        Ok(Exp::spanned(
            loc,
            end_loc,
            K::Bin {
                op,
                op1: Box::new(op1),
                op2: Box::new(op2),
            },
        ))
    }

    fn fold_arith(&mut self, loc: CompileLoc, end_loc: CompileLoc, op: BinOp, op1: &Exp, op2: &Exp) -> SResult<Exp> {
        use ExpKind as K;
        match (&op1.kind, &op2.kind) {
            (K::Int(a), K::Int(b)) => {
                let (a, b) = (*a, *b);
                let v = match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => {
                        if b == 0 {
                            return Err(self.error(loc, "Integer divide by zero"));
                        }
                        a.wrapping_div(b)
                    }
                    BinOp::Mod => {
                        if b == 0 {
                            return Err(self.error(loc, "Integer modulo by zero"));
                        }
                        a.wrapping_rem(b)
                    }
                    _ => unreachable!(),
                };
                Ok(Exp::spanned(loc, end_loc, K::Int(v)))
            }
            (K::Int(_) | K::Float(_), K::Int(_) | K::Float(_)) => {
                let a = as_float(op1).expect("numeric");
                let b = as_float(op2).expect("numeric");
                let v = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Mod => a % b,
                    _ => unreachable!(),
                };
                Ok(Exp::spanned(loc, end_loc, K::Float(v)))
            }
            _ => Err(self.error(loc, "Arithmetic must be performed on numbers")),
        }
    }

    fn common_compare(&mut self, op1: &Exp, op2: &Exp) -> SResult<i64> {
        use ExpKind as K;
        use std::cmp::Ordering;
        let ord = match (&op1.kind, &op2.kind) {
            (K::Null, K::Null) => Ordering::Equal,
            (K::Int(a), K::Int(b)) => a.cmp(b),
            (K::Int(_) | K::Float(_), K::Int(_) | K::Float(_)) => {
                let a = as_float(op1).expect("numeric");
                let b = as_float(op2).expect("numeric");
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            (K::Str(a), K::Str(b)) => self.interns.get(*a).cmp(self.interns.get(*b)),
            _ => return Err(self.error(op1.loc, "Invalid compile-time comparison")),
        };
        Ok(match ord {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        })
    }

    fn fold_cmp(&mut self, loc: CompileLoc, end_loc: CompileLoc, op: CmpOp, op1: Exp, op2: Exp) -> SResult<Exp> {
        use ExpKind as K;

        if op1.is_constant() && op2.is_constant() {
            match op {
                CmpOp::Eq | CmpOp::Ne | CmpOp::Is | CmpOp::NotIs => {
                    let is_true = matches!(op, CmpOp::Eq | CmpOp::Is);
                    let strict = matches!(op, CmpOp::Is | CmpOp::NotIs);
                    let result = match (&op1.kind, &op2.kind) {
                        (K::Null, K::Null) => Some(true),
                        (K::Bool(a), K::Bool(b)) => Some(a == b),
                        (K::Int(a), K::Int(b)) => Some(a == b),
                        (K::Float(a), K::Float(b)) => Some(a == b),
                        (K::Int(_) | K::Float(_), K::Int(_) | K::Float(_)) if !strict => {
                            Some(as_float(&op1) == as_float(&op2))
                        }
                        (K::Str(a), K::Str(b)) => Some(a == b),
                        _ => None,
                    };
                    return match result {
                        Some(eq) => Ok(Exp::spanned(loc, end_loc, K::Bool(eq == is_true))),
                        None if strict => Ok(Exp::spanned(loc, end_loc, K::Bool(!is_true))),
                        None => Err(self.error(loc, "Cannot compare different types")),
                    };
                }
                CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                    let c = self.common_compare(&op1, &op2)?;
                    let v = match op {
                        CmpOp::Lt => c < 0,
                        CmpOp::Le => c <= 0,
                        CmpOp::Gt => c > 0,
                        CmpOp::Ge => c >= 0,
                        _ => unreachable!(),
                    };
                    return Ok(Exp::spanned(loc, end_loc, K::Bool(v)));
                }
                CmpOp::In | CmpOp::NotIn => {
                    if let (K::Str(a), K::Str(b)) = (&op1.kind, &op2.kind) {
                        let found = self.interns.get(*b).contains(self.interns.get(*a));
                        return Ok(Exp::spanned(loc, end_loc, K::Bool(found == matches!(op, CmpOp::In))));
                    }
                }
            }
        }

        Ok(Exp::spanned(
            loc,
            end_loc,
            K::Cmp {
                op,
                op1: Box::new(op1),
                op2: Box::new(op2),
            },
        ))
    }

    /// `!` of a constant folds; `!` of a comparison inverts it; `!` of a
    /// logical connective De Morgans into the dual.
    fn fold_not(&mut self, loc: CompileLoc, end_loc: CompileLoc, op: Exp) -> SResult<Exp> {
        use ExpKind as K;

        if op.is_constant() {
            return Ok(Exp::spanned(loc, end_loc, K::Bool(!op.is_true_constant())));
        }

        match op.kind {
            K::Cmp { op: cmp_op, op1, op2 } => Ok(Exp::spanned(
                loc,
                end_loc,
                K::Cmp {
                    op: cmp_op.inverted(),
                    op1,
                    op2,
                },
            )),
            K::AndAnd(op1, op2) => {
                let op1_loc = op1.loc;
                let op2_loc = op2.loc;
                let not1 = self.fold_not(op1_loc, op1_loc, *op1)?;
                let not2 = self.fold_not(op2_loc, op2_loc, *op2)?;
                Ok(Exp::spanned(loc, end_loc, K::OrOr(Box::new(not1), Box::new(not2))))
            }
            K::OrOr(op1, op2) => {
                let op1_loc = op1.loc;
                let op2_loc = op2.loc;
                let not1 = self.fold_not(op1_loc, op1_loc, *op1)?;
                let not2 = self.fold_not(op2_loc, op2_loc, *op2)?;
                Ok(Exp::spanned(loc, end_loc, K::AndAnd(Box::new(not1), Box::new(not2))))
            }
            other => Ok(Exp::spanned(
                loc,
                end_loc,
                K::Not(Box::new(Exp::spanned(op.loc, op.end_loc, other))),
            )),
        }
    }

    /// Collapses nested `~` chains into one n-ary concatenation and folds
    /// runs of constant strings.
    fn fold_cat(&mut self, loc: CompileLoc, end_loc: CompileLoc, operands: Vec<Exp>) -> SResult<Exp> {
        debug_assert_eq!(operands.len(), 2);
        let mut it = operands.into_iter();
        let op1 = self.visit_exp(it.next().expect("binary cat"))?;
        let op2 = self.visit_exp(it.next().expect("binary cat"))?;

        let mut flat = Vec::new();
        match op1.kind {
            ExpKind::Cat { operands, collapsed: true } => flat.extend(operands),
            _ => flat.push(op1),
        }
        flat.push(op2);

        // Fold adjacent constant strings.
        let mut folded: Vec<Exp> = Vec::with_capacity(flat.len());
        for e in flat {
            let both_strings = matches!(e.kind, ExpKind::Str(_))
                && matches!(folded.last().map(|p| &p.kind), Some(ExpKind::Str(_)));
            if both_strings {
                let prev = folded.pop().expect("nonempty");
                let (ExpKind::Str(a), ExpKind::Str(b)) = (&prev.kind, &e.kind) else {
                    unreachable!()
                };
                let joined = self.interns.concat(&[*a, *b]);
                folded.push(Exp::spanned(prev.loc, e.end_loc, ExpKind::Str(joined)));
            } else {
                folded.push(e);
            }
        }

        if folded.len() == 1 {
            return Ok(folded.into_iter().next().expect("single operand"));
        }
        Ok(Exp::spanned(
            loc,
            end_loc,
            ExpKind::Cat {
                operands: folded,
                collapsed: true,
            },
        ))
    }
}

fn as_float(e: &Exp) -> Option<f64> {
    match e.kind {
        ExpKind::Int(i) => Some(i as f64),
        ExpKind::Float(f) => Some(f),
        _ => None,
    }
}
