//! The code generator: walks the lowered AST and sequences builder
//! operations. Emits a default return at the end of every function body,
//! unfolds decorators into call chains, compiles class/namespace bodies into
//! member additions, and turns comprehensions into implicit loops.

use std::rc::Rc;

use crate::{
    bytecode::{
        FuncDefData,
        instr::NO_JUMP,
        op::{Comparison, Opcode},
    },
    compiler::{
        CompileLoc,
        ast::{
            BinOp, Case, CmpOp, Decorator, Exp, ExpKind, ForComp, ForInit, FuncDef, Ident, Module, Protection, Stmt,
            StmtKind,
        },
        builder::{Builder, ForDesc, InstRef},
    },
    errors::{CompileError, CompilePhase},
    intern::{Interns, StringId},
    value::{TYPEMASK_ANY, Value},
};

type CResult<T> = Result<T, CompileError>;

/// Compiles a lowered module into its top-level function body.
pub(crate) fn gen_module(interns: &mut Interns, file_name: &str, m: &Module) -> CResult<Rc<FuncDefData>> {
    let mut cg = Codegen {
        b: Builder::new(interns, file_name),
        file_name: file_name.to_owned(),
    };
    cg.gen_module(m)
}

/// What a comprehension loop produces per iteration.
enum CompInner<'x> {
    Array(&'x Exp),
    Table(&'x Exp, &'x Exp),
}

/// A loop body to generate: either a statement or a comprehension chain.
enum LoopBody<'x> {
    Stmt(&'x Stmt),
    Comp {
        if_comp: Option<&'x Exp>,
        next: Option<&'x ForComp>,
        inner: &'x CompInner<'x>,
    },
    None,
}

struct Codegen<'a> {
    b: Builder<'a>,
    file_name: String,
}

impl<'a> Codegen<'a> {
    fn err(&self, loc: CompileLoc, msg: impl Into<String>) -> CompileError {
        let file = self.b.interns().get(loc.file).to_owned();
        let file = if file.is_empty() { self.file_name.clone() } else { file };
        CompileError::new(CompilePhase::Semantic, msg.into(), &file, loc.line, loc.col)
    }

    fn gen_module(&mut self, m: &Module) -> CResult<Rc<FuncDefData>> {
        let this_id = self.b.interns_mut().intern("this");
        let name_id = self.b.interns_mut().intern("<top-level>");

        self.b.begin_function(m.loc, name_id, true);
        self.b.set_num_params(1);
        self.b.push_scope();
        self.b.add_param(this_id, m.loc, TYPEMASK_ANY)?;
        self.b.activate_locals(1);

        for s in &m.statements {
            self.gen_stmt(s)?;
        }

        if let Some(deco) = &m.decorator {
            self.gen_decorator(deco, &DecoratorTarget::This)?;
            self.b.pop_to_nothing();
        }

        self.b.pop_scope(m.end_loc);
        self.b.default_return(m.end_loc)?;
        Ok(self.b.end_module_function())
    }

    // === Functions ===

    /// Compiles a function definition and leaves the closure expression on
    /// the enclosing builder's stack.
    fn gen_func_def(&mut self, d: &FuncDef) -> CResult<()> {
        let this_id = self.b.interns_mut().intern("this");

        self.b.begin_function(d.loc, d.name.name, d.is_vararg);
        self.b.set_num_params(d.params.len() + 1);
        self.b.push_scope();
        self.b.add_param(this_id, d.loc, TYPEMASK_ANY)?;
        for p in &d.params {
            self.b.add_param(p.name.name, p.name.loc, p.type_mask)?;
        }
        self.b.activate_locals(d.params.len() + 1);

        self.gen_param_checks(d)?;
        self.gen_stmt(&d.body)?;

        self.b.pop_scope(d.end_loc);
        self.b.default_return(d.end_loc)?;
        self.b.end_function(d.loc)
    }

    /// The function prelude: typemask validation, class-type constraints,
    /// custom constraints, and default values for null parameters.
    fn gen_param_checks(&mut self, d: &FuncDef) -> CResult<()> {
        if d.params.iter().any(|p| p.type_mask != TYPEMASK_ANY) {
            self.b.param_check(d.loc);
        }

        for (i, p) in d.params.iter().enumerate() {
            let param_idx = i + 1;

            if !p.class_types.is_empty() {
                let mut success = InstRef::new();
                for ty in &p.class_types {
                    self.gen_exp(ty)?;
                    self.b.to_source(ty.end_loc)?;
                    let j = self.b.check_obj_param(ty.end_loc, param_idx);
                    self.b.cat_to_true(&mut success, j);
                }
                let last_loc = p.class_types.last().expect("nonempty").end_loc;
                self.b.obj_param_fail(last_loc, param_idx);
                self.b.patch_true_to_here(last_loc, &mut success)?;
            } else if let Some(con) = &p.custom_constraint {
                let mut success = InstRef::new();
                // constraint(param)
                self.gen_exp(con)?;
                self.b.to_temporary(con.end_loc)?;
                self.b.push_null(con.end_loc)?;
                self.b.to_temporary(con.end_loc)?;
                self.b.push_var(p.name.loc, p.name.name)?;
                self.b.to_temporary(con.end_loc)?;
                self.b.push_call(con.end_loc, 1)?;
                self.b.to_source(con.end_loc)?;
                let j = self.b.code_is_true(con.end_loc, true);
                self.b.cat_to_true(&mut success, j);

                let text = dotted_name_text(self.b.interns_mut(), con);
                let name_id = self.b.interns_mut().intern(&text);
                self.b.push_string(con.end_loc, name_id)?;
                self.b.to_source(con.end_loc)?;
                self.b.custom_param_fail(con.end_loc, param_idx);
                self.b.patch_true_to_here(con.end_loc, &mut success)?;
            }

            if let Some(default) = &p.default {
                // param ?= default
                self.b.push_var(p.name.loc, p.name.name)?;
                self.b.dup();
                self.b.to_source(p.name.loc)?;
                self.b.push_null(p.name.loc)?;
                let j = self.b.code_is(p.name.loc, false);
                self.gen_exp(default)?;
                self.b.assign(default.end_loc, 1, 1)?;
                self.b.patch_jump_to_here(default.end_loc, j)?;
            }
        }

        Ok(())
    }

    // === Statements ===

    fn gen_stmt(&mut self, s: &Stmt) -> CResult<()> {
        match &s.kind {
            StmtKind::Scope(inner) => {
                self.b.push_scope();
                self.gen_stmt(inner)?;
                self.b.pop_scope(s.end_loc);
            }
            StmtKind::Block(stmts) => {
                for st in stmts {
                    self.gen_stmt(st)?;
                }
            }
            StmtKind::Expr(e) => {
                self.gen_exp(e)?;
                self.b.pop_to_nothing();
            }
            StmtKind::VarDecl { protection, names, inits } => {
                self.gen_var_decl(s, *protection, names, inits)?;
            }
            StmtKind::FuncDecl {
                protection,
                def,
                decorator,
            } => {
                if *protection == Protection::Local {
                    self.b.insert_local(def.name.name, def.name.loc)?;
                    self.b.activate_locals(1);
                    self.b.push_var(def.name.loc, def.name.name)?;
                } else {
                    self.b.push_new_global(def.name.loc, def.name.name)?;
                }
                self.gen_func_def(def)?;
                self.b.assign(s.end_loc, 1, 1)?;

                if let Some(deco) = decorator {
                    self.b.push_var(def.name.loc, def.name.name)?;
                    self.gen_decorator(deco, &DecoratorTarget::Var(def.name))?;
                    self.b.assign(s.end_loc, 1, 1)?;
                }
            }
            StmtKind::ClassDecl {
                protection,
                name,
                bases,
                fields,
                decorator,
                docs: _,
            } => {
                if *protection == Protection::Local {
                    self.b.insert_local(name.name, name.loc)?;
                    self.b.activate_locals(1);
                    self.b.push_var(name.loc, name.name)?;
                } else {
                    self.b.push_new_global(name.loc, name.name)?;
                }

                self.b.push_string(s.loc, name.name)?;
                for base in bases {
                    self.gen_exp(base)?;
                    self.b.to_temporary(base.loc)?;
                }
                self.b.new_class(s.loc, bases.len());
                self.b.assign(s.loc, 1, 1)?;

                // Add members on the finished class value.
                self.b.push_var(name.loc, name.name)?;
                if !fields.is_empty() {
                    self.b.to_source(s.loc)?;
                    for field in fields {
                        self.b.dup();
                        self.b.push_string(field.loc, field.name)?;
                        self.gen_exp(&field.initializer)?;
                        self.b.to_source(field.initializer.loc)?;
                        if field.is_method {
                            self.b.add_class_method(field.initializer.loc, field.is_override);
                        } else {
                            self.b.add_class_field(field.initializer.loc, field.is_override);
                        }
                    }
                }
                self.b.pop(1);

                if let Some(deco) = decorator {
                    self.b.push_var(name.loc, name.name)?;
                    self.gen_decorator(deco, &DecoratorTarget::Var(*name))?;
                    self.b.assign(s.end_loc, 1, 1)?;
                }
            }
            StmtKind::NamespaceDecl {
                protection,
                name,
                parent,
                fields,
                decorator,
                docs: _,
            } => {
                if *protection == Protection::Local {
                    self.b.insert_local(name.name, name.loc)?;
                    self.b.activate_locals(1);
                    self.b.push_var(name.loc, name.name)?;
                } else {
                    self.b.push_new_global(name.loc, name.name)?;
                }

                self.b.push_string(s.loc, name.name)?;
                if let Some(parent) = parent {
                    self.gen_exp(parent)?;
                    self.b.to_source(parent.loc)?;
                    self.b.new_namespace(s.loc);
                } else {
                    self.b.new_namespace_np(s.loc);
                }

                let desc = self.b.begin_namespace(s.loc)?;
                self.b.assign(s.loc, 1, 1)?;

                self.b.push_var(name.loc, name.name)?;
                if !fields.is_empty() {
                    self.b.to_source(s.loc)?;
                    for field in fields {
                        self.b.dup();
                        self.b.push_string(field.loc, field.name)?;
                        self.b.to_source(field.initializer.loc)?;
                        self.b.field();
                        self.gen_exp(&field.initializer)?;
                        self.b.assign(field.initializer.loc, 1, 1)?;
                    }
                }
                self.b.end_namespace(desc);
                self.b.pop(1);

                if let Some(deco) = decorator {
                    self.b.push_var(name.loc, name.name)?;
                    self.gen_decorator(deco, &DecoratorTarget::Var(*name))?;
                    self.b.assign(s.end_loc, 1, 1)?;
                }
            }
            StmtKind::Assert { cond, msg } => {
                let msg = msg.as_ref().expect("semantic fills the assert message");
                let mut i = self.gen_condition(cond)?;
                self.b.patch_false_to_here(s.loc, &mut i)?;
                self.gen_exp(msg)?;
                self.b.to_temporary(msg.end_loc)?;
                self.b.assert_fail(s.loc);
                self.b.patch_true_to_here(s.loc, &mut i)?;
            }
            StmtKind::If {
                cond_var,
                cond,
                then_body,
                else_body,
            } => {
                self.gen_if(
                    s.end_loc,
                    else_body.as_ref().map_or(s.end_loc, |e| e.loc),
                    cond_var.as_ref(),
                    cond,
                    &LoopBody::Stmt(then_body),
                    else_body.as_deref(),
                )?;
            }
            StmtKind::While {
                name,
                cond_var,
                cond,
                body,
            } => self.gen_while(s, *name, cond_var.as_ref(), cond, body)?,
            StmtKind::DoWhile { name, body, cond } => self.gen_do_while(s, *name, body, cond)?,
            StmtKind::For {
                name,
                init,
                cond,
                step,
                body,
            } => self.gen_c_for(s, *name, init, cond.as_ref(), step, body)?,
            StmtKind::ForNum {
                name,
                index,
                lo,
                hi,
                step,
                body,
            } => self.gen_for_num(s.loc, s.end_loc, *name, *index, lo, hi, step, &LoopBody::Stmt(body))?,
            StmtKind::Foreach {
                name,
                indices,
                container,
                body,
            } => self.gen_foreach(s.loc, s.end_loc, *name, indices, container, &LoopBody::Stmt(body))?,
            StmtKind::Switch {
                name,
                cond,
                cases,
                default,
            } => self.gen_switch(s, *name, cond, cases, default.as_deref())?,
            StmtKind::Continue { name } => self.b.code_continue(s.loc, *name)?,
            StmtKind::Break { name } => self.b.code_break(s.loc, *name)?,
            StmtKind::Return { exprs } => self.gen_return(s, exprs)?,
            StmtKind::TryCatch {
                body,
                catches: _,
                hidden_var,
                transformed,
            } => {
                let hidden = hidden_var.expect("semantic lowers catches");
                let transformed = transformed.as_ref().expect("semantic lowers catches");

                let push_catch = self.b.code_catch(s.loc)?;
                self.gen_stmt(body)?;
                let jump_over = self.b.pop_catch(body.end_loc, transformed.loc, push_catch)?;

                self.b.push_scope();
                self.b.insert_local(hidden.name, hidden.loc)?;
                self.b.activate_locals(1);
                self.gen_stmt(transformed)?;
                self.b.pop_scope(transformed.end_loc);

                self.b.patch_jump_to_here(s.end_loc, jump_over)?;
            }
            StmtKind::TryFinally { body, finally_body } => {
                let push_finally = self.b.code_finally(s.loc)?;
                self.gen_stmt(body)?;
                self.b.pop_finally(body.end_loc, finally_body.loc, push_finally)?;

                self.b.push_scope();
                self.gen_stmt(finally_body)?;
                self.b.code_end_final(finally_body.end_loc);
                self.b.pop_scope(finally_body.end_loc);
            }
            StmtKind::Throw { exp, rethrowing } => {
                self.gen_exp(exp)?;
                self.b.to_source(exp.end_loc)?;
                self.b.code_throw(s.end_loc, *rethrowing);
            }
            StmtKind::ScopeAction { .. } => unreachable!("semantic lowers scope actions"),
            StmtKind::Assign { lhs, rhs } => {
                for dest in lhs {
                    self.gen_exp(dest)?;
                }
                self.b.resolve_assignment_conflicts(lhs.last().expect("nonempty").loc, lhs.len())?;
                self.gen_assign_rhs(rhs)?;
                self.b.assign(s.end_loc, lhs.len(), rhs.len())?;
            }
            StmtKind::OpAssign { op, lhs, rhs } => {
                self.gen_exp(lhs)?;
                self.b.dup();
                self.b.to_source(lhs.end_loc)?;
                self.gen_exp(rhs)?;
                self.b.to_source(rhs.end_loc)?;
                self.b.reflex_op(s.end_loc, reflex_opcode(*op));
                self.b.assign(s.end_loc, 1, 1)?;
            }
            StmtKind::CatAssign {
                lhs,
                operands,
                collapsed,
            } => {
                debug_assert!(*collapsed);
                self.gen_exp(lhs)?;
                self.b.dup();
                self.b.to_source(lhs.end_loc)?;
                self.gen_exp_list(operands, false)?;
                self.b.concat_eq(s.end_loc, operands.len());
                self.b.assign(s.end_loc, 1, 1)?;
            }
            StmtKind::CondAssign { lhs, rhs } => {
                self.gen_exp(lhs)?;
                self.b.dup();
                self.b.to_source(lhs.end_loc)?;
                self.b.push_null(lhs.end_loc)?;
                let j = self.b.code_is(lhs.end_loc, false);
                self.gen_exp(rhs)?;
                self.b.assign(s.end_loc, 1, 1)?;
                self.b.patch_jump_to_here(s.end_loc, j)?;
            }
            StmtKind::IncStmt(e) => {
                self.gen_exp(e)?;
                self.b.dup();
                self.b.to_source(e.end_loc)?;
                self.b.inc_dec(s.end_loc, true);
                self.b.assign(s.end_loc, 1, 1)?;
            }
            StmtKind::DecStmt(e) => {
                self.gen_exp(e)?;
                self.b.dup();
                self.b.to_source(e.end_loc)?;
                self.b.inc_dec(s.end_loc, false);
                self.b.assign(s.end_loc, 1, 1)?;
            }
            StmtKind::Import { .. } => unreachable!("semantic lowers imports"),
        }
        Ok(())
    }

    fn gen_var_decl(&mut self, s: &Stmt, protection: Protection, names: &[Ident], inits: &[Exp]) -> CResult<()> {
        for (i, n1) in names.iter().enumerate() {
            if let Some(n0) = names[..i].iter().find(|n0| n0.name == n1.name) {
                let name = self.b.interns_mut().get(n1.name).to_owned();
                return Err(self.err(
                    n1.loc,
                    format!(
                        "Variable '{name}' conflicts with previous definition at line {}:{}",
                        n0.loc.line, n0.loc.col
                    ),
                ));
            }
        }

        if protection == Protection::Global {
            for n in names {
                self.b.push_new_global(n.loc, n.name)?;
            }
            self.gen_assign_rhs(inits)?;
            self.b.assign(s.loc, names.len(), inits.len())?;
        } else {
            self.b.push_new_locals(s.loc, names.len())?;
            self.gen_exp_list(inits, true)?;
            self.b.assign(s.loc, names.len(), inits.len())?;
            for n in names {
                self.b.insert_local(n.name, n.loc)?;
            }
            self.b.activate_locals(names.len());
        }
        Ok(())
    }

    fn gen_return(&mut self, s: &Stmt, exprs: &[Exp]) -> CResult<()> {
        // A lone call in return position becomes a tail call, unless a
        // try/catch frame is active (tracebacks across handlers stay intact).
        let is_direct_call = exprs.len() == 1
            && matches!(exprs[0].kind, ExpKind::Call { .. } | ExpKind::MethodCall { .. });

        if !self.b.in_try_catch() && is_direct_call {
            self.gen_exp(&exprs[0])?;
            self.b.make_tailcall();
            self.b.save_rets(exprs[0].end_loc, 1)?;
            self.b.code_ret(s.end_loc);
        } else {
            self.gen_exp_list(exprs, true)?;
            self.b.save_rets(s.end_loc, exprs.len())?;
            if self.b.in_try_catch() {
                self.b.code_unwind(s.end_loc);
            }
            self.b.code_ret(s.end_loc);
        }
        Ok(())
    }

    // === Control flow ===

    fn gen_if(
        &mut self,
        end_loc: CompileLoc,
        else_loc: CompileLoc,
        cond_var: Option<&Ident>,
        cond: &Exp,
        then_body: &LoopBody<'_>,
        else_body: Option<&Stmt>,
    ) -> CResult<()> {
        self.b.push_scope();

        let mut i = if let Some(var) = cond_var {
            self.b.push_new_locals(cond.loc, 1)?;
            self.gen_exp(cond)?;
            self.b.assign(cond.loc, 1, 1)?;
            self.b.insert_local(var.name, var.loc)?;
            self.b.activate_locals(1);
            let var_exp = Exp::new(var.loc, ExpKind::Ident(*var));
            self.gen_condition(&var_exp)?
        } else {
            self.gen_condition(cond)?
        };

        self.b.invert_jump(&mut i);
        self.b.patch_true_to_here(cond.end_loc, &mut i)?;
        self.gen_loop_body(then_body)?;

        if let Some(else_body) = else_body {
            self.b.pop_scope(else_loc);
            let j = self.b.make_jump(else_loc);
            self.b.patch_false_to_here(else_loc, &mut i)?;
            self.b.push_scope();
            self.gen_stmt(else_body)?;
            self.b.pop_scope(end_loc);
            self.b.patch_jump_to_here(end_loc, j)?;
        } else {
            self.b.pop_scope(end_loc);
            self.b.patch_false_to_here(end_loc, &mut i)?;
        }
        Ok(())
    }

    fn gen_while(
        &mut self,
        s: &Stmt,
        name: Option<StringId>,
        cond_var: Option<&Ident>,
        cond: &Exp,
        body: &Stmt,
    ) -> CResult<()> {
        let begin_loop = self.b.here();
        self.b.push_scope();

        // A constant-false condition was eliminated in semantic.
        if cond.is_constant() && cond.is_true_constant() {
            self.b.set_breakable();
            self.b.set_continuable();
            self.b.set_scope_name(name);

            if let Some(var) = cond_var {
                self.b.push_new_locals(cond.loc, 1)?;
                self.gen_exp(cond)?;
                self.b.assign(cond.loc, 1, 1)?;
                self.b.insert_local(var.name, var.loc)?;
                self.b.activate_locals(1);
            }

            self.gen_stmt(body)?;
            self.b.patch_continues_to(s.end_loc, begin_loop)?;
            self.b.jump_to(s.end_loc, begin_loop)?;
            self.b.patch_breaks_to_here(s.end_loc)?;
            self.b.pop_scope(s.end_loc);
        } else {
            let mut c = if let Some(var) = cond_var {
                self.b.push_new_locals(cond.loc, 1)?;
                self.gen_exp(cond)?;
                self.b.assign(cond.loc, 1, 1)?;
                self.b.insert_local(var.name, var.loc)?;
                self.b.activate_locals(1);
                let var_exp = Exp::new(var.loc, ExpKind::Ident(*var));
                self.gen_condition(&var_exp)?
            } else {
                self.gen_condition(cond)?
            };

            self.b.invert_jump(&mut c);
            self.b.patch_true_to_here(cond.end_loc, &mut c)?;
            self.b.set_breakable();
            self.b.set_continuable();
            self.b.set_scope_name(name);
            self.gen_stmt(body)?;
            self.b.patch_continues_to(s.end_loc, begin_loop)?;
            self.b.close_scope_upvals(s.end_loc);
            self.b.jump_to(s.end_loc, begin_loop)?;
            self.b.patch_breaks_to_here(s.end_loc)?;
            self.b.pop_scope(s.end_loc);
            self.b.patch_false_to_here(s.end_loc, &mut c)?;
        }
        Ok(())
    }

    fn gen_do_while(&mut self, s: &Stmt, name: Option<StringId>, body: &Stmt, cond: &Exp) -> CResult<()> {
        let begin_loop = self.b.here();
        self.b.push_scope();
        self.b.set_breakable();
        self.b.set_continuable();
        self.b.set_scope_name(name);
        self.gen_stmt(body)?;

        if cond.is_constant() {
            self.b.patch_continues_to_here(cond.loc)?;
            if cond.is_true_constant() {
                self.b.jump_to(s.end_loc, begin_loop)?;
            }
            self.b.patch_breaks_to_here(s.end_loc)?;
            self.b.pop_scope(s.end_loc);
        } else {
            self.b.close_scope_upvals(cond.loc);
            self.b.patch_continues_to_here(cond.loc)?;
            let mut c = self.gen_condition(cond)?;
            self.b.invert_jump(&mut c);
            self.b.patch_true_to_here(cond.end_loc, &mut c)?;
            self.b.jump_to(s.end_loc, begin_loop)?;
            self.b.patch_breaks_to_here(s.end_loc)?;
            self.b.pop_scope(s.end_loc);
            self.b.patch_false_to_here(s.end_loc, &mut c)?;
        }
        Ok(())
    }

    fn gen_c_for(
        &mut self,
        s: &Stmt,
        name: Option<StringId>,
        init: &[ForInit],
        cond: Option<&Exp>,
        step: &[Stmt],
        body: &Stmt,
    ) -> CResult<()> {
        self.b.push_scope();
        self.b.set_breakable();
        self.b.set_continuable();
        self.b.set_scope_name(name);

        for i in init {
            match i {
                ForInit::Decl(d) => self.gen_stmt(d)?,
                ForInit::Stmt(st) => self.gen_stmt(st)?,
            }
        }

        let begin_loop = self.b.here();
        let mut cond_ref = None;
        if let Some(cond) = cond {
            let mut c = self.gen_condition(cond)?;
            self.b.invert_jump(&mut c);
            self.b.patch_true_to_here(cond.end_loc, &mut c)?;
            cond_ref = Some(c);
        }

        self.gen_stmt(body)?;

        self.b.close_scope_upvals(s.loc);
        self.b.patch_continues_to_here(s.loc)?;
        for inc in step {
            self.gen_stmt(inc)?;
        }

        self.b.jump_to(s.end_loc, begin_loop)?;
        self.b.patch_breaks_to_here(s.end_loc)?;
        self.b.pop_scope(s.end_loc);

        if let Some(mut c) = cond_ref {
            self.b.patch_false_to_here(s.end_loc, &mut c)?;
        }
        Ok(())
    }

    fn gen_for_num(
        &mut self,
        loc: CompileLoc,
        end_loc: CompileLoc,
        name: Option<StringId>,
        index: Ident,
        lo: &Exp,
        hi: &Exp,
        step: &Exp,
        body: &LoopBody<'_>,
    ) -> CResult<()> {
        self.b.push_scope();
        self.b.set_breakable();
        self.b.set_continuable();
        self.b.set_scope_name(name);

        let desc = self.begin_for_with(loc, |cg| {
            cg.gen_exp(lo)?;
            cg.b.to_temporary(lo.end_loc)?;
            cg.gen_exp(hi)?;
            cg.b.to_temporary(hi.end_loc)?;
            cg.gen_exp(step)?;
            cg.b.to_temporary(step.end_loc)?;
            Ok(3)
        })?;

        self.b.insert_local(index.name, index.loc)?;
        self.b.activate_locals(1);
        self.gen_loop_body(body)?;
        self.b.end_for(end_loc, desc)?;
        self.b.pop_scope(end_loc);
        Ok(())
    }

    fn gen_foreach(
        &mut self,
        loc: CompileLoc,
        end_loc: CompileLoc,
        name: Option<StringId>,
        indices: &[Ident],
        container: &[Exp],
        body: &LoopBody<'_>,
    ) -> CResult<()> {
        self.b.push_scope();
        self.b.set_breakable();
        self.b.set_continuable();
        self.b.set_scope_name(name);

        let desc = self.begin_foreach_with(loc, container)?;

        for i in indices {
            self.b.insert_local(i.name, i.loc)?;
        }
        self.b.activate_locals(indices.len());
        self.gen_loop_body(body)?;
        self.b.end_foreach(end_loc, desc, indices.len())?;
        self.b.pop_scope(end_loc);
        Ok(())
    }

    fn gen_switch(
        &mut self,
        s: &Stmt,
        name: Option<StringId>,
        cond: &Exp,
        cases: &[Case],
        default: Option<&[Stmt]>,
    ) -> CResult<()> {
        self.b.push_scope();
        self.b.set_breakable();
        self.b.set_scope_name(name);

        self.gen_exp(cond)?;
        self.b.to_source(cond.end_loc)?;

        // Dynamic case jumps, parallel to `cases` / their conditions.
        let mut dyn_jumps: Vec<Vec<Option<usize>>> = Vec::with_capacity(cases.len());

        for case in cases {
            let mut case_jumps = Vec::with_capacity(case.conditions.len());
            if let Some(hi) = &case.high_range {
                let lo = &case.conditions[0].exp;

                self.b.dup();
                self.gen_exp(lo)?;
                self.b.to_source(lo.end_loc)?;
                let jmp1 = self.b.code_cmp(lo.loc, Comparison::Lt);

                self.b.dup();
                self.gen_exp(hi)?;
                self.b.to_source(hi.end_loc)?;
                let jmp2 = self.b.code_cmp(hi.end_loc, Comparison::Gt);

                case_jumps.push(Some(self.b.make_jump(hi.end_loc)));
                self.b.patch_jump_to_here(hi.end_loc, jmp1)?;
                self.b.patch_jump_to_here(hi.end_loc, jmp2)?;
            } else {
                for c in &case.conditions {
                    if c.exp.is_constant() {
                        case_jumps.push(None);
                    } else {
                        self.b.dup();
                        self.gen_exp(&c.exp)?;
                        self.b.to_source(c.exp.end_loc)?;
                        case_jumps.push(Some(self.b.code_switch_cmp(c.exp.end_loc)));
                    }
                }
            }
            dyn_jumps.push(case_jumps);
        }

        self.b.begin_switch(s.loc);

        for (case, case_jumps) in cases.iter().zip(&dyn_jumps) {
            if case.high_range.is_some() {
                let j = case_jumps[0].expect("range cases always jump dynamically");
                self.b.patch_jump_to_here(case.loc, j)?;
            } else {
                for (c, j) in case.conditions.iter().zip(case_jumps) {
                    match j {
                        None => {
                            let v = const_exp_value(&c.exp).expect("checked constant");
                            self.b.add_case(c.exp.loc, v)?;
                        }
                        Some(j) => self.b.patch_jump_to_here(c.exp.loc, *j)?,
                    }
                }
            }
            for st in &case.body {
                self.gen_stmt(st)?;
            }
        }

        if let Some(default) = default {
            self.b.add_default();
            for st in default {
                self.gen_stmt(st)?;
            }
        }

        self.b.end_switch(s.end_loc)?;
        self.b.patch_breaks_to_here(s.end_loc)?;
        self.b.pop_scope(s.end_loc);
        Ok(())
    }

    fn gen_loop_body(&mut self, body: &LoopBody<'_>) -> CResult<()> {
        match body {
            LoopBody::Stmt(s) => self.gen_stmt(s),
            LoopBody::None => Ok(()),
            LoopBody::Comp { if_comp, next, inner } => {
                if let Some(cond) = if_comp {
                    let chained = ChainedComp { next: *next, inner };
                    self.gen_comp_if(cond, &chained)
                } else {
                    match next {
                        Some(n) => self.gen_for_comp(n, inner),
                        None => self.gen_comp_inner(inner),
                    }
                }
            }
        }
    }

    fn gen_comp_if(&mut self, cond: &Exp, chained: &ChainedComp<'_>) -> CResult<()> {
        self.b.push_scope();
        let mut i = self.gen_condition(cond)?;
        self.b.invert_jump(&mut i);
        self.b.patch_true_to_here(cond.end_loc, &mut i)?;
        match chained.next {
            Some(n) => self.gen_for_comp(n, chained.inner)?,
            None => self.gen_comp_inner(chained.inner)?,
        }
        self.b.pop_scope(cond.end_loc);
        self.b.patch_false_to_here(cond.end_loc, &mut i)?;
        Ok(())
    }

    fn gen_for_comp(&mut self, comp: &ForComp, inner: &CompInner<'_>) -> CResult<()> {
        match comp {
            ForComp::Foreach {
                loc,
                end_loc,
                indices,
                container,
                if_comp,
                next,
            } => self.gen_foreach(
                *loc,
                *end_loc,
                None,
                indices,
                container,
                &LoopBody::Comp {
                    if_comp: if_comp.as_deref(),
                    next: next.as_deref(),
                    inner,
                },
            ),
            ForComp::ForNum {
                loc,
                end_loc,
                index,
                lo,
                hi,
                step,
                if_comp,
                next,
            } => self.gen_for_num(
                *loc,
                *end_loc,
                None,
                *index,
                lo,
                hi,
                step,
                &LoopBody::Comp {
                    if_comp: if_comp.as_deref(),
                    next: next.as_deref(),
                    inner,
                },
            ),
        }
    }

    fn gen_comp_inner(&mut self, inner: &CompInner<'_>) -> CResult<()> {
        match inner {
            CompInner::Array(exp) => {
                self.b.dup();
                self.gen_exp(exp)?;
                self.b.to_source(exp.end_loc)?;
                self.b.array_append(exp.end_loc);
            }
            CompInner::Table(key, value) => {
                self.b.dup();
                self.gen_exp(key)?;
                self.b.to_source(key.end_loc)?;
                self.b.index();
                self.gen_exp(value)?;
                self.b.assign(value.end_loc, 1, 1)?;
            }
        }
        Ok(())
    }

    // === Decorators ===

    fn gen_decorator(&mut self, d: &Decorator, target: &DecoratorTarget) -> CResult<()> {
        if let ExpKind::Dot { op, name } = &d.func.kind {
            if d.context.is_some() {
                return Err(self.err(d.loc, "'with' is disallowed on method calls"));
            }
            let desc = self.b.begin_method_call();
            self.gen_exp(op)?;
            self.b.to_source(d.loc)?;
            self.b.update_method_call(d.loc, desc, 1)?;
            self.gen_exp(name)?;
            self.b.to_source(name.end_loc)?;
            self.b.update_method_call(d.loc, desc, 2)?;
            self.gen_decorator_args(d, target)?;
            self.b.push_method_call(d.end_loc, desc)?;
        } else {
            self.gen_exp(&d.func)?;
            self.b.to_temporary(d.func.end_loc)?;
            match &d.context {
                Some(ctx) => {
                    self.gen_exp(ctx)?;
                    self.b.to_temporary(ctx.end_loc)?;
                }
                None => {
                    self.b.push_null(d.loc)?;
                    self.b.to_temporary(d.loc)?;
                }
            }
            let num_args = self.gen_decorator_args(d, target)?;
            self.b.push_call(d.end_loc, num_args)?;
        }
        Ok(())
    }

    /// The decorated object (or the next decorator's result) is the first
    /// argument; declared arguments follow.
    fn gen_decorator_args(&mut self, d: &Decorator, target: &DecoratorTarget) -> CResult<usize> {
        match &d.next {
            Some(next) => {
                self.gen_decorator(next, target)?;
                self.b.to_source(next.end_loc)?;
                self.b.to_temporary(next.end_loc)?;
            }
            None => {
                match target {
                    DecoratorTarget::This => self.b.push_this(),
                    DecoratorTarget::Var(ident) => self.b.push_var(ident.loc, ident.name)?,
                }
                self.b.to_source(d.loc)?;
                self.b.to_temporary(d.loc)?;
            }
        }
        self.gen_exp_list(&d.args, true)?;
        Ok(d.args.len() + 1)
    }

    // === Expressions ===

    fn gen_exp_list(&mut self, exprs: &[Exp], allow_mult_ret: bool) -> CResult<()> {
        let Some((last, rest)) = exprs.split_last() else {
            return Ok(());
        };
        for e in rest {
            self.gen_exp(e)?;
            self.b.to_temporary(e.end_loc)?;
        }
        self.gen_exp(last)?;
        if !allow_mult_ret || !last.is_mult_ret() {
            self.b.to_temporary(last.end_loc)?;
        }
        Ok(())
    }

    fn gen_assign_rhs(&mut self, exprs: &[Exp]) -> CResult<()> {
        let Some((last, rest)) = exprs.split_last() else {
            return Ok(());
        };
        for e in rest {
            self.gen_exp(e)?;
            self.b.to_temporary(e.end_loc)?;
        }
        self.gen_exp(last)?;
        Ok(())
    }

    fn gen_exp(&mut self, e: &Exp) -> CResult<()> {
        match &e.kind {
            ExpKind::Null => self.b.push_null(e.loc)?,
            ExpKind::Bool(v) => self.b.push_bool(e.loc, *v)?,
            ExpKind::Int(v) => self.b.push_int(e.loc, *v)?,
            ExpKind::Float(v) => self.b.push_float(e.loc, *v)?,
            ExpKind::Str(v) => self.b.push_string(e.loc, *v)?,
            ExpKind::Ident(id) => self.b.push_var(id.loc, id.name)?,
            ExpKind::This => self.b.push_this(),
            ExpKind::Vararg => {
                self.require_vararg(e.loc)?;
                self.b.push_vararg(e.loc)?;
            }
            ExpKind::VargLen => {
                self.require_vararg(e.loc)?;
                self.b.push_varg_len(e.end_loc);
            }
            ExpKind::Paren(inner) => {
                debug_assert!(inner.is_mult_ret());
                self.gen_exp(inner)?;
                self.b.to_temporary(e.end_loc)?;
            }
            ExpKind::Cond { cond, op1, op2 } => {
                self.b.push_new_locals(e.loc, 1)?;
                let mut c = self.gen_condition(cond)?;
                self.b.invert_jump(&mut c);
                self.b.patch_true_to_here(cond.end_loc, &mut c)?;
                self.b.dup();
                self.gen_exp(op1)?;
                self.b.assign(op1.end_loc, 1, 1)?;
                let j = self.b.make_jump(op1.end_loc);
                self.b.patch_false_to_here(op1.end_loc, &mut c)?;
                self.b.dup();
                self.gen_exp(op2)?;
                self.b.assign(op2.end_loc, 1, 1)?;
                self.b.patch_jump_to_here(e.end_loc, j)?;
                self.b.to_temporary(e.end_loc)?;
            }
            ExpKind::OrOr(op1, op2) => {
                self.b.push_new_locals(e.loc, 1)?;
                self.b.dup();
                self.gen_exp(op1)?;
                self.b.assign(op1.end_loc, 1, 1)?;
                self.b.dup();
                self.b.to_source(op1.end_loc)?;
                let j = self.b.code_is_true(op1.end_loc, true);
                self.b.dup();
                self.gen_exp(op2)?;
                self.b.assign(op2.end_loc, 1, 1)?;
                self.b.patch_jump_to_here(e.end_loc, j)?;
                self.b.to_temporary(e.end_loc)?;
            }
            ExpKind::AndAnd(op1, op2) => {
                self.b.push_new_locals(e.loc, 1)?;
                self.b.dup();
                self.gen_exp(op1)?;
                self.b.assign(op1.end_loc, 1, 1)?;
                self.b.dup();
                self.b.to_source(op1.end_loc)?;
                let j = self.b.code_is_true(op1.end_loc, false);
                self.b.dup();
                self.gen_exp(op2)?;
                self.b.assign(op2.end_loc, 1, 1)?;
                self.b.patch_jump_to_here(e.end_loc, j)?;
                self.b.to_temporary(e.end_loc)?;
            }
            ExpKind::Bin { op, op1, op2 } => {
                self.gen_exp(op1)?;
                self.b.to_source(op1.end_loc)?;
                self.gen_exp(op2)?;
                self.b.to_source(op2.end_loc)?;
                self.b.bin_op(e.end_loc, bin_opcode(*op));
            }
            ExpKind::Cmp { .. } => self.gen_comparison_value(e)?,
            ExpKind::Cat { operands, collapsed } => {
                debug_assert!(*collapsed && operands.len() >= 2);
                self.gen_exp_list(operands, false)?;
                self.b.concat(e.end_loc, operands.len());
            }
            ExpKind::Neg(op) => {
                self.gen_exp(op)?;
                self.b.to_source(op.end_loc)?;
                self.b.un_op(e.end_loc, Opcode::Neg);
            }
            ExpKind::Com(op) => {
                self.gen_exp(op)?;
                self.b.to_source(op.end_loc)?;
                self.b.un_op(e.end_loc, Opcode::Com);
            }
            ExpKind::Not(op) => {
                // `!x` materializes through the condition machinery: the
                // fall-through (false) path yields true.
                self.b.push_new_locals(e.loc, 1)?;
                let mut c = self.gen_condition(op)?;
                self.b.dup();
                self.b.push_bool(e.end_loc, true)?;
                self.b.assign(e.end_loc, 1, 1)?;
                let j = self.b.make_jump(e.end_loc);
                self.b.patch_true_to_here(e.end_loc, &mut c)?;
                self.b.dup();
                self.b.push_bool(e.end_loc, false)?;
                self.b.assign(e.end_loc, 1, 1)?;
                self.b.patch_jump_to_here(e.end_loc, j)?;
                self.b.to_temporary(e.end_loc)?;
            }
            ExpKind::Len(op) => {
                self.gen_exp(op)?;
                self.b.to_source(op.end_loc)?;
                self.b.length();
            }
            ExpKind::DotSuper(op) => {
                self.gen_exp(op)?;
                self.b.to_source(op.end_loc)?;
                self.b.un_op(e.end_loc, Opcode::SuperOf);
            }
            ExpKind::Dot { op, name } => {
                self.gen_exp(op)?;
                self.b.to_source(op.end_loc)?;
                self.gen_exp(name)?;
                self.b.to_source(e.end_loc)?;
                self.b.field();
            }
            ExpKind::MethodCall { op, method, args } => {
                let desc = self.b.begin_method_call();
                self.gen_exp(op)?;
                self.b.to_source(e.loc)?;
                self.b.update_method_call(e.loc, desc, 1)?;
                self.gen_exp(method)?;
                self.b.to_source(method.end_loc)?;
                self.b.update_method_call(e.loc, desc, 2)?;
                self.gen_exp_list(args, true)?;
                self.b.push_method_call(e.end_loc, desc)?;
            }
            ExpKind::Call { op, context, args } => {
                self.gen_exp(op)?;
                self.b.to_temporary(op.end_loc)?;
                match context {
                    Some(ctx) => {
                        self.gen_exp(ctx)?;
                        self.b.to_temporary(ctx.end_loc)?;
                    }
                    None => {
                        self.b.push_null(op.end_loc)?;
                        self.b.to_temporary(op.end_loc)?;
                    }
                }
                self.gen_exp_list(args, true)?;
                self.b.push_call(e.end_loc, args.len())?;
            }
            ExpKind::Index { op, index } => {
                self.gen_exp(op)?;
                self.b.to_source(op.end_loc)?;
                self.gen_exp(index)?;
                self.b.to_source(e.end_loc)?;
                self.b.index();
            }
            ExpKind::VargIndex { index } => {
                self.require_vararg(e.loc)?;
                self.gen_exp(index)?;
                self.b.to_source(index.end_loc)?;
                self.b.varg_index();
            }
            ExpKind::Slice { op, lo, hi } => {
                self.gen_exp(op)?;
                self.b.to_temporary(op.end_loc)?;
                self.gen_exp(lo)?;
                self.b.to_temporary(lo.end_loc)?;
                self.gen_exp(hi)?;
                self.b.to_temporary(hi.end_loc)?;
                self.b.slice();
            }
            ExpKind::VargSlice { lo, hi } => {
                self.require_vararg(e.loc)?;
                self.gen_exp(lo)?;
                self.b.to_temporary(lo.end_loc)?;
                self.gen_exp(hi)?;
                self.b.to_temporary(hi.end_loc)?;
                self.b.varg_slice(e.end_loc);
            }
            ExpKind::FuncLiteral(def) => self.gen_func_def(def)?,
            ExpKind::TableCtor { fields } => {
                self.b.push_table(e.loc)?;
                for (key, value) in fields {
                    self.b.dup();
                    self.gen_exp(key)?;
                    self.b.to_source(key.end_loc)?;
                    self.b.index();
                    self.gen_exp(value)?;
                    self.b.assign(value.end_loc, 1, 1)?;
                }
            }
            ExpKind::ArrayCtor { values } => self.gen_array_ctor(e, values)?,
            ExpKind::Yield { args } => {
                self.gen_exp_list(args, true)?;
                self.b.push_yield(e.end_loc, args.len())?;
            }
            ExpKind::TableComprehension { key, value, comp } => {
                self.b.push_table(e.loc)?;
                let inner = CompInner::Table(key, value);
                self.gen_for_comp(comp, &inner)?;
            }
            ExpKind::ArrayComprehension { exp, comp } => {
                self.b.push_array(e.loc, 0)?;
                let inner = CompInner::Array(exp);
                self.gen_for_comp(comp, &inner)?;
            }
        }
        Ok(())
    }

    fn gen_array_ctor(&mut self, e: &Exp, values: &[Exp]) -> CResult<()> {
        const BLOCK: usize = crate::bytecode::instr::ARRAY_SET_FIELDS;

        if values.len() > crate::bytecode::instr::MAX_ARRAY_FIELDS {
            return Err(self.err(e.loc, "Array constructor has too many fields"));
        }

        let trailing_multi = values.last().is_some_and(Exp::is_mult_ret);
        let literal_len = if trailing_multi { values.len() - 1 } else { values.len() };
        self.b.push_array(e.loc, literal_len)?;

        let mut index = 0usize;
        let mut block = 0usize;
        while index < values.len() {
            let num = (values.len() - index).min(BLOCK);
            let is_last_block = index + num == values.len();
            self.b.dup();
            self.gen_exp_list(&values[index..index + num], is_last_block)?;
            self.b.array_set(values[index + num - 1].end_loc, num, block)?;
            index += num;
            block += 1;
        }
        Ok(())
    }

    /// Compiles a comparison used as a value: condition codes assemble into
    /// a register holding true/false.
    fn gen_comparison_value(&mut self, e: &Exp) -> CResult<()> {
        self.b.push_new_locals(e.loc, 1)?;
        let mut i = self.gen_condition(e)?;
        self.b.dup();
        self.b.push_bool(e.end_loc, false)?;
        self.b.assign(e.end_loc, 1, 1)?;
        let j = self.b.make_jump(e.end_loc);
        self.b.patch_true_to_here(e.end_loc, &mut i)?;
        self.b.dup();
        self.b.push_bool(e.end_loc, true)?;
        self.b.assign(e.end_loc, 1, 1)?;
        self.b.patch_jump_to_here(e.end_loc, j)?;
        self.b.to_temporary(e.end_loc)?;
        Ok(())
    }

    // === Condition codes ===

    /// Compiles `e` as a branch: returns the pending true/false jump lists.
    /// Falls through on false.
    fn gen_condition(&mut self, e: &Exp) -> CResult<InstRef> {
        match &e.kind {
            ExpKind::Cond { cond, op1, op2 } => {
                let mut c = self.gen_condition(cond)?;
                self.b.invert_jump(&mut c);
                self.b.patch_true_to_here(cond.end_loc, &mut c)?;
                let mut left = self.gen_condition(op1)?;
                self.b.invert_jump(&mut left);
                self.b.patch_true_to_here(op1.end_loc, &mut left)?;
                let true_jump = self.b.make_jump(op1.end_loc);
                self.b.patch_false_to_here(op1.end_loc, &mut c)?;
                let mut right = self.gen_condition(op2)?;
                if left.false_list != NO_JUMP {
                    self.b.cat_to_false(&mut right, left.false_list as usize);
                }
                self.b.cat_to_true(&mut right, true_jump);
                Ok(right)
            }
            ExpKind::OrOr(op1, op2) => {
                let mut left = self.gen_condition(op1)?;
                self.b.patch_false_to_here(op1.end_loc, &mut left)?;
                let mut right = self.gen_condition(op2)?;
                if left.true_list != NO_JUMP {
                    self.b.cat_to_true(&mut right, left.true_list as usize);
                }
                Ok(right)
            }
            ExpKind::AndAnd(op1, op2) => {
                let mut left = self.gen_condition(op1)?;
                self.b.invert_jump(&mut left);
                self.b.patch_true_to_here(op1.end_loc, &mut left)?;
                let mut right = self.gen_condition(op2)?;
                if left.false_list != NO_JUMP {
                    self.b.cat_to_false(&mut right, left.false_list as usize);
                }
                Ok(right)
            }
            ExpKind::Cmp { op, op1, op2 } => {
                self.gen_exp(op1)?;
                self.b.to_source(op1.end_loc)?;
                self.gen_exp(op2)?;
                self.b.to_source(op2.end_loc)?;

                let mut i = InstRef::new();
                let j = match op {
                    CmpOp::Eq => self.b.code_equals(op2.end_loc, true),
                    CmpOp::Ne => self.b.code_equals(op2.end_loc, false),
                    CmpOp::Is => self.b.code_is(op2.end_loc, true),
                    CmpOp::NotIs => self.b.code_is(op2.end_loc, false),
                    CmpOp::In => self.b.code_in(op2.end_loc, true),
                    CmpOp::NotIn => self.b.code_in(op2.end_loc, false),
                    CmpOp::Lt => self.b.code_cmp(op2.end_loc, Comparison::Lt),
                    CmpOp::Le => self.b.code_cmp(op2.end_loc, Comparison::Le),
                    CmpOp::Gt => self.b.code_cmp(op2.end_loc, Comparison::Gt),
                    CmpOp::Ge => self.b.code_cmp(op2.end_loc, Comparison::Ge),
                };
                i.true_list = j as i32;
                Ok(i)
            }
            ExpKind::Paren(inner) => self.gen_condition(inner),
            _ => {
                self.gen_exp(e)?;
                self.b.to_source(e.end_loc)?;
                let mut i = InstRef::new();
                i.true_list = self.b.code_is_true(e.end_loc, true) as i32;
                Ok(i)
            }
        }
    }

    // === Helpers ===

    fn require_vararg(&self, loc: CompileLoc) -> CResult<()> {
        if !self.b.is_vararg() {
            return Err(self.err(loc, "'vararg' cannot be used in a non-variadic function"));
        }
        Ok(())
    }

    fn begin_for_with(
        &mut self,
        loc: CompileLoc,
        r#gen: impl FnOnce(&mut Self) -> CResult<usize>,
    ) -> CResult<ForDesc> {
        // Mirrors Builder::begin_for, with bound evaluation interleaved here
        // because the expressions need the code generator, not just the
        // builder.
        self.b.push_new_locals(loc, 3)?;
        let produced = r#gen(self)?;
        self.b.assign(loc, 3, produced)?;
        self.b.finish_begin_for(loc, Opcode::For)
    }

    fn begin_foreach_with(&mut self, loc: CompileLoc, container: &[Exp]) -> CResult<ForDesc> {
        self.b.push_new_locals(loc, 3)?;
        self.gen_exp_list(container, true)?;
        self.b.assign(loc, 3, container.len())?;
        self.b.finish_begin_for(loc, Opcode::Foreach)
    }
}

struct ChainedComp<'x> {
    next: Option<&'x ForComp>,
    inner: &'x CompInner<'x>,
}

enum DecoratorTarget {
    This,
    Var(Ident),
}

fn bin_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::And => Opcode::And,
        BinOp::Or => Opcode::Or,
        BinOp::Xor => Opcode::Xor,
        BinOp::Shl => Opcode::Shl,
        BinOp::Shr => Opcode::Shr,
        BinOp::UShr => Opcode::UShr,
        BinOp::Cmp3 => Opcode::Cmp3,
    }
}

fn reflex_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::AddEq,
        BinOp::Sub => Opcode::SubEq,
        BinOp::Mul => Opcode::MulEq,
        BinOp::Div => Opcode::DivEq,
        BinOp::Mod => Opcode::ModEq,
        BinOp::And => Opcode::AndEq,
        BinOp::Or => Opcode::OrEq,
        BinOp::Xor => Opcode::XorEq,
        BinOp::Shl => Opcode::ShlEq,
        BinOp::Shr => Opcode::ShrEq,
        BinOp::UShr => Opcode::UShrEq,
        BinOp::Cmp3 => unreachable!("<=> has no reflexive form"),
    }
}

fn const_exp_value(e: &Exp) -> Option<Value> {
    match e.kind {
        ExpKind::Null => Some(Value::Null),
        ExpKind::Bool(b) => Some(Value::Bool(b)),
        ExpKind::Int(i) => Some(Value::Int(i)),
        ExpKind::Float(f) => Some(Value::Float(f)),
        ExpKind::Str(s) => Some(Value::Str(s)),
        _ => None,
    }
}

fn dotted_name_text(interns: &Interns, e: &Exp) -> String {
    match &e.kind {
        ExpKind::Ident(id) => interns.get(id.name).to_owned(),
        ExpKind::Dot { op, name } => {
            let mut s = dotted_name_text(interns, op);
            if let ExpKind::Str(id) = name.kind {
                s.push('.');
                s.push_str(interns.get(id));
            }
            s
        }
        _ => String::from("<constraint>"),
    }
}
