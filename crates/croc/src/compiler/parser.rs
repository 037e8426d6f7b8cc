//! The recursive-descent parser: tokens to AST.
//!
//! No semantic decisions are made here: protections default to
//! [`Protection::Default`], imports and scope actions are kept structural,
//! and constant folding is left to the semantic pass. The parser does reject
//! expressions without side effects used as statements, and `@decorators` on
//! method calls.

use crate::{
    compiler::{
        CompileLoc,
        ast::{
            BinOp, Case, CaseCond, CatchClause, ClassField, CmpOp, Decorator, Exp, ExpKind, ForComp, ForInit,
            FuncDef, FuncParam, Ident, Module, NamespaceField, Protection, ScopeAction, Stmt, StmtKind,
        },
        lexer::{Lexer, Token, TokenKind},
    },
    errors::CompileError,
    intern::StringId,
    value::{CrocType, TYPEMASK_ANY},
};

type PResult<T> = Result<T, CompileError>;

pub(crate) struct Parser<'a, 'i> {
    l: &'a mut Lexer<'i>,
    dummy_name_counter: u32,
    current_class_name: Option<StringId>,
}

impl<'a, 'i> Parser<'a, 'i> {
    pub fn new(l: &'a mut Lexer<'i>) -> Self {
        Self {
            l,
            dummy_name_counter: 0,
            current_class_name: None,
        }
    }

    fn loc(&self) -> CompileLoc {
        self.l.loc()
    }

    fn kind(&self) -> TokenKind {
        self.l.tok().kind
    }

    fn syn(&self, loc: CompileLoc, msg: impl Into<String>) -> CompileError {
        self.l.syn_error(loc, msg)
    }

    fn parse_ident(&mut self) -> PResult<Ident> {
        let tok = self.l.expect(TokenKind::Ident)?;
        Ok(Ident {
            loc: tok.loc,
            name: tok.string_value.expect("ident token carries a name"),
        })
    }

    fn dummy_ident(&mut self, loc: CompileLoc, prefix: &str) -> Ident {
        let name = format!("__{prefix}{}", self.dummy_name_counter);
        self.dummy_name_counter += 1;
        Ident {
            loc,
            name: self.l.interns_mut().intern(&name),
        }
    }

    fn decl_docs(&mut self, tok: &Token) -> Option<(StringId, CompileLoc)> {
        tok.pre_comment
    }

    // === Top level ===

    pub fn parse_module(&mut self) -> PResult<Module> {
        let loc = self.loc();
        let docs = self.l.tok().pre_comment;

        let mut statements = Vec::new();
        let mut decorator = None;

        while !self.l.check(TokenKind::Eof) {
            // A trailing `@decorator` before EOF decorates the module itself.
            if self.l.check(TokenKind::At) {
                let deco = self.parse_decorators()?;
                if self.l.check(TokenKind::Eof) {
                    decorator = Some(Box::new(deco));
                    break;
                }
                statements.push(self.parse_decorated_decl(Some(deco))?);
            } else {
                statements.push(self.parse_statement(true)?);
            }
        }

        let end_loc = self.loc();
        Ok(Module {
            loc,
            end_loc,
            statements,
            decorator,
            docs,
        })
    }

    // === Statements ===

    fn parse_statement(&mut self, need_scope: bool) -> PResult<Stmt> {
        use TokenKind as T;
        match self.kind() {
            T::Dec
            | T::False
            | T::FloatLiteral
            | T::Ident
            | T::Inc
            | T::IntLiteral
            | T::LBracket
            | T::Length
            | T::LParen
            | T::Null
            | T::StringLiteral
            | T::This
            | T::True
            | T::Vararg => self.parse_expression_stmt(),

            T::Yield => self.parse_yield_stmt(),

            T::At => {
                let deco = self.parse_decorators()?;
                self.parse_decorated_decl(Some(deco))
            }
            T::Class | T::Function | T::Global | T::Local | T::Namespace => self.parse_decorated_decl(None),

            T::LBrace => {
                let block = self.parse_block_stmt()?;
                if need_scope {
                    let loc = block.loc;
                    let end = block.end_loc;
                    Ok(Stmt::spanned(loc, end, StmtKind::Scope(Box::new(block))))
                } else {
                    Ok(block)
                }
            }
            T::Assert => self.parse_assert_stmt(),
            T::Break => self.parse_break_stmt(),
            T::Continue => self.parse_continue_stmt(),
            T::Do => self.parse_do_while_stmt(),
            T::For => self.parse_for_stmt(),
            T::Foreach => self.parse_foreach_stmt(),
            T::If => self.parse_if_stmt(),
            T::Import => self.parse_import_stmt(),
            T::Return => self.parse_return_stmt(),
            T::Scope => self.parse_scope_action_stmt(),
            T::Switch => self.parse_switch_stmt(),
            T::Throw => self.parse_throw_stmt(),
            T::Try => self.parse_try_stmt(),
            T::While => self.parse_while_stmt(),
            T::Semicolon => Err(self.syn(self.loc(), "Empty statements ';' are not allowed (use {} instead)")),
            other => Err(self.syn(self.loc(), format!("Statement expected, not '{other}'"))),
        }
    }

    fn parse_decorated_decl(&mut self, deco: Option<Decorator>) -> PResult<Stmt> {
        use TokenKind as T;
        let protection = match self.kind() {
            T::Local => {
                self.l.next()?;
                Protection::Local
            }
            T::Global => {
                self.l.next()?;
                Protection::Global
            }
            _ => Protection::Default,
        };

        match self.kind() {
            T::Ident => {
                if deco.is_some() {
                    return Err(self.syn(self.loc(), "Cannot put decorators on variable declarations"));
                }
                let s = self.parse_var_decl(protection)?;
                self.l.statement_term()?;
                Ok(s)
            }
            T::Function => self.parse_func_decl(protection, deco.map(Box::new)),
            T::Class => self.parse_class_decl(protection, deco.map(Box::new)),
            T::Namespace => self.parse_namespace_decl(protection, deco.map(Box::new)),
            other => Err(self.syn(
                self.loc(),
                format!("Declaration expected after protection specifier, not '{other}'"),
            )),
        }
    }

    fn parse_var_decl(&mut self, protection: Protection) -> PResult<Stmt> {
        let loc = self.loc();
        let mut names = vec![self.parse_ident()?];
        while self.l.check(TokenKind::Comma) {
            self.l.next()?;
            names.push(self.parse_ident()?);
        }

        let mut inits = Vec::new();
        if self.l.check(TokenKind::Assign) {
            self.l.next()?;
            inits.push(self.parse_expression()?);
            while self.l.check(TokenKind::Comma) {
                self.l.next()?;
                inits.push(self.parse_expression()?);
            }
            if names.len() < inits.len() {
                return Err(self.syn(loc, "Declaration has fewer names than sources"));
            }
        }

        let end_loc = inits.last().map_or(names.last().expect("at least one name").loc, |e| e.end_loc);
        Ok(Stmt::spanned(loc, end_loc, StmtKind::VarDecl { protection, names, inits }))
    }

    fn parse_func_decl(&mut self, protection: Protection, decorator: Option<Box<Decorator>>) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Function)?;
        let docs = self.decl_docs(&tok);
        let name = self.parse_ident()?;
        let mut def = self.parse_func_body(tok.loc, name)?;
        def.docs = def.docs.or(docs);
        let end_loc = def.end_loc;
        Ok(Stmt::spanned(
            tok.loc,
            end_loc,
            StmtKind::FuncDecl {
                protection,
                def: Box::new(def),
                decorator,
            },
        ))
    }

    fn parse_func_body(&mut self, loc: CompileLoc, name: Ident) -> PResult<FuncDef> {
        self.l.expect(TokenKind::LParen)?;
        let (params, is_vararg) = self.parse_func_params()?;
        self.l.expect(TokenKind::RParen)?;

        let body = self.parse_statement(false)?;
        let body = match body.kind {
            StmtKind::Block(_) | StmtKind::Scope(_) => body,
            // Single-statement bodies still get their own scope.
            _ => {
                let bloc = body.loc;
                let bend = body.end_loc;
                Stmt::spanned(bloc, bend, StmtKind::Scope(Box::new(body)))
            }
        };

        let end_loc = body.end_loc;
        Ok(FuncDef {
            loc,
            end_loc,
            name,
            params,
            is_vararg,
            body: Box::new(body),
            docs: None,
        })
    }

    fn parse_func_params(&mut self) -> PResult<(Vec<FuncParam>, bool)> {
        let mut params = Vec::new();
        let mut is_vararg = false;

        if self.l.check(TokenKind::RParen) {
            return Ok((params, is_vararg));
        }

        loop {
            if self.l.check(TokenKind::Vararg) || self.l.check(TokenKind::Ellipsis) {
                self.l.next()?;
                is_vararg = true;
                break;
            }

            let name = self.parse_ident()?;
            let mut type_mask = TYPEMASK_ANY;
            let mut class_types = Vec::new();
            let mut custom_constraint = None;
            let mut default = None;

            if self.l.check(TokenKind::Colon) {
                self.l.next()?;
                (type_mask, class_types, custom_constraint) = self.parse_param_type()?;
            }

            if self.l.check(TokenKind::Assign) {
                self.l.next()?;
                default = Some(self.parse_expression()?);
                // A defaulted parameter may always be omitted.
                type_mask |= CrocType::Null.mask_bit();
            }

            params.push(FuncParam {
                name,
                type_mask,
                class_types,
                custom_constraint,
                default,
            });

            if self.l.check(TokenKind::Comma) {
                self.l.next()?;
            } else {
                break;
            }
        }

        Ok((params, is_vararg))
    }

    /// `int|string`, `SomeClass`, `@constraintFn`, or `any`.
    fn parse_param_type(&mut self) -> PResult<(u32, Vec<Exp>, Option<Exp>)> {
        let mut mask = 0u32;
        let mut class_types = Vec::new();

        if self.l.check(TokenKind::At) {
            self.l.next()?;
            let con = self.parse_dotted_name()?;
            return Ok((TYPEMASK_ANY, Vec::new(), Some(con)));
        }

        loop {
            let loc = self.loc();
            if self.l.check(TokenKind::Null) {
                self.l.next()?;
                mask |= CrocType::Null.mask_bit();
            } else if self.l.check(TokenKind::Function) {
                self.l.next()?;
                mask |= CrocType::Function.mask_bit();
            } else if self.l.check(TokenKind::Class) {
                self.l.next()?;
                mask |= CrocType::Class.mask_bit();
            } else if self.l.check(TokenKind::Namespace) {
                self.l.next()?;
                mask |= CrocType::Namespace.mask_bit();
            } else {
                let tok = self.l.expect(TokenKind::Ident)?;
                let name = self.l.interns().get(tok.string_value.expect("ident")).to_owned();
                match name.as_str() {
                    "any" => mask |= TYPEMASK_ANY,
                    "bool" => mask |= CrocType::Bool.mask_bit(),
                    "int" => mask |= CrocType::Int.mask_bit(),
                    "float" => mask |= CrocType::Float.mask_bit(),
                    "string" => mask |= CrocType::String.mask_bit(),
                    "table" => mask |= CrocType::Table.mask_bit(),
                    "array" => mask |= CrocType::Array.mask_bit(),
                    "memblock" => mask |= CrocType::Memblock.mask_bit(),
                    "thread" => mask |= CrocType::Thread.mask_bit(),
                    "nativeobj" => mask |= CrocType::NativeObj.mask_bit(),
                    "funcdef" => mask |= CrocType::Funcdef.mask_bit(),
                    "weakref" => mask |= CrocType::Weakref.mask_bit(),
                    "instance" => mask |= CrocType::Instance.mask_bit(),
                    _ => {
                        // A class-typed constraint; instances of it (and
                        // anything else instance-shaped) pass the mask check,
                        // the CheckObjParam test does the rest.
                        mask |= CrocType::Instance.mask_bit();
                        let mut exp = Exp::new(
                            loc,
                            ExpKind::Ident(Ident {
                                loc,
                                name: tok.string_value.expect("ident"),
                            }),
                        );
                        while self.l.check(TokenKind::Dot) {
                            self.l.next()?;
                            let field = self.l.expect(TokenKind::Ident)?;
                            let name_exp = Exp::new(field.loc, ExpKind::Str(field.string_value.expect("ident")));
                            let end = field.loc;
                            exp = Exp::spanned(
                                loc,
                                end,
                                ExpKind::Dot {
                                    op: Box::new(exp),
                                    name: Box::new(name_exp),
                                },
                            );
                        }
                        class_types.push(exp);
                    }
                }
            }

            if self.l.check(TokenKind::BitOr) {
                self.l.next()?;
            } else {
                break;
            }
        }

        Ok((mask, class_types, None))
    }

    fn parse_class_decl(&mut self, protection: Protection, decorator: Option<Box<Decorator>>) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Class)?;
        let docs = self.decl_docs(&tok);
        let name = self.parse_ident()?;
        let prev_class = self.current_class_name.replace(name.name);

        let mut bases = Vec::new();
        if self.l.check(TokenKind::Colon) {
            self.l.next()?;
            bases.push(self.parse_expression()?);
            while self.l.check(TokenKind::Comma) {
                self.l.next()?;
                bases.push(self.parse_expression()?);
            }
        }

        self.l.expect(TokenKind::LBrace)?;
        let mut fields: Vec<ClassField> = Vec::new();

        while !self.l.check(TokenKind::RBrace) {
            let member_docs = self.l.tok().pre_comment;

            // `override` is contextual: only special before a member.
            let mut is_override = false;
            if self.l.check(TokenKind::Ident)
                && self.l.tok().string_value.is_some_and(|id| self.l.interns().get(id) == "override")
                && matches!(self.l.peek()?.kind, TokenKind::Function | TokenKind::Ident)
            {
                self.l.next()?;
                is_override = true;
            }

            match self.kind() {
                TokenKind::Function => {
                    let ftok = self.l.next()?;
                    let fname = self.parse_ident()?;
                    let def = self.parse_func_body(ftok.loc, fname)?;
                    let end = def.end_loc;
                    fields.push(ClassField {
                        name: fname.name,
                        loc: ftok.loc,
                        initializer: Exp::spanned(ftok.loc, end, ExpKind::FuncLiteral(Box::new(def))),
                        is_method: true,
                        is_override,
                        docs: member_docs,
                    });
                }
                TokenKind::Ident => {
                    let fname = self.parse_ident()?;
                    let init = if self.l.check(TokenKind::Assign) {
                        self.l.next()?;
                        self.parse_expression()?
                    } else {
                        Exp::new(fname.loc, ExpKind::Null)
                    };
                    self.l.statement_term()?;
                    fields.push(ClassField {
                        name: fname.name,
                        loc: fname.loc,
                        initializer: init,
                        is_method: false,
                        is_override,
                        docs: member_docs,
                    });
                }
                other => return Err(self.syn(self.loc(), format!("Class member expected, not '{other}'"))),
            }

            if let Some((dup, _)) = fields
                .iter()
                .enumerate()
                .last()
                .and_then(|(i, f)| fields[..i].iter().find(|g| g.name == f.name).map(|g| (g.loc, ())))
            {
                return Err(self.syn(dup, "Class member name appears twice"));
            }
        }

        let end = self.l.expect(TokenKind::RBrace)?.loc;
        self.current_class_name = prev_class;
        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::ClassDecl {
                protection,
                name,
                bases,
                fields,
                decorator,
                docs,
            },
        ))
    }

    fn parse_namespace_decl(&mut self, protection: Protection, decorator: Option<Box<Decorator>>) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Namespace)?;
        let docs = self.decl_docs(&tok);
        let name = self.parse_ident()?;

        let parent = if self.l.check(TokenKind::Colon) {
            self.l.next()?;
            Some(self.parse_expression()?)
        } else {
            None
        };

        self.l.expect(TokenKind::LBrace)?;
        let mut fields: Vec<NamespaceField> = Vec::new();

        while !self.l.check(TokenKind::RBrace) {
            let member_docs = self.l.tok().pre_comment;
            match self.kind() {
                TokenKind::Function => {
                    let ftok = self.l.next()?;
                    let fname = self.parse_ident()?;
                    let def = self.parse_func_body(ftok.loc, fname)?;
                    let end = def.end_loc;
                    fields.push(NamespaceField {
                        name: fname.name,
                        loc: ftok.loc,
                        initializer: Exp::spanned(ftok.loc, end, ExpKind::FuncLiteral(Box::new(def))),
                        docs: member_docs,
                    });
                }
                TokenKind::Ident => {
                    let fname = self.parse_ident()?;
                    let init = if self.l.check(TokenKind::Assign) {
                        self.l.next()?;
                        self.parse_expression()?
                    } else {
                        Exp::new(fname.loc, ExpKind::Null)
                    };
                    self.l.statement_term()?;
                    fields.push(NamespaceField {
                        name: fname.name,
                        loc: fname.loc,
                        initializer: init,
                        docs: member_docs,
                    });
                }
                other => return Err(self.syn(self.loc(), format!("Namespace member expected, not '{other}'"))),
            }

            if fields.len() >= 2 {
                let last = fields.last().expect("nonempty");
                if fields[..fields.len() - 1].iter().any(|f| f.name == last.name) {
                    return Err(self.syn(last.loc, "Namespace member name appears twice"));
                }
            }
        }

        let end = self.l.expect(TokenKind::RBrace)?.loc;
        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::NamespaceDecl {
                protection,
                name,
                parent,
                fields,
                decorator,
                docs,
            },
        ))
    }

    fn parse_decorators(&mut self) -> PResult<Decorator> {
        let mut deco = self.parse_decorator()?;
        while self.l.check(TokenKind::At) {
            let mut next = self.parse_decorator()?;
            next.next = Some(Box::new(deco));
            deco = next;
        }
        Ok(deco)
    }

    fn parse_decorator(&mut self) -> PResult<Decorator> {
        let at = self.l.expect(TokenKind::At)?;
        let func = self.parse_dotted_name()?;

        let mut args = Vec::new();
        let mut end_loc = func.end_loc;
        if self.l.check(TokenKind::LParen) {
            self.l.next()?;
            if !self.l.check(TokenKind::RParen) {
                args.push(self.parse_expression()?);
                while self.l.check(TokenKind::Comma) {
                    self.l.next()?;
                    args.push(self.parse_expression()?);
                }
            }
            end_loc = self.l.expect(TokenKind::RParen)?.loc;
        }

        Ok(Decorator {
            loc: at.loc,
            end_loc,
            func,
            context: None,
            args,
            next: None,
        })
    }

    fn parse_dotted_name(&mut self) -> PResult<Exp> {
        let id = self.parse_ident()?;
        let mut exp = Exp::new(id.loc, ExpKind::Ident(id));
        while self.l.check(TokenKind::Dot) && self.l.peek()?.kind == TokenKind::Ident {
            self.l.next()?;
            let field = self.parse_ident()?;
            let name_exp = Exp::new(field.loc, ExpKind::Str(field.name));
            exp = Exp::spanned(
                exp.loc,
                field.loc,
                ExpKind::Dot {
                    op: Box::new(exp),
                    name: Box::new(name_exp),
                },
            );
        }
        Ok(exp)
    }

    fn parse_block_stmt(&mut self) -> PResult<Stmt> {
        let open = self.l.expect(TokenKind::LBrace)?;
        let mut statements = Vec::new();
        while !self.l.check(TokenKind::RBrace) {
            if self.l.check(TokenKind::Eof) {
                return Err(self.syn(open.loc, "Unterminated block"));
            }
            statements.push(self.parse_statement(true)?);
        }
        let end = self.l.expect(TokenKind::RBrace)?.loc;
        Ok(Stmt::spanned(open.loc, end, StmtKind::Block(statements)))
    }

    fn parse_assert_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Assert)?;
        self.l.expect(TokenKind::LParen)?;
        let cond = self.parse_expression()?;
        let msg = if self.l.check(TokenKind::Comma) {
            self.l.next()?;
            Some(self.parse_expression()?)
        } else {
            None
        };
        let end = self.l.expect(TokenKind::RParen)?.loc;
        self.l.statement_term()?;
        Ok(Stmt::spanned(tok.loc, end, StmtKind::Assert { cond, msg }))
    }

    fn parse_break_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Break)?;
        let name = if self.l.check(TokenKind::Ident) && !self.l.tok().newline_before {
            Some(self.parse_ident()?.name)
        } else {
            None
        };
        self.l.statement_term()?;
        Ok(Stmt::new(tok.loc, StmtKind::Break { name }))
    }

    fn parse_continue_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Continue)?;
        let name = if self.l.check(TokenKind::Ident) && !self.l.tok().newline_before {
            Some(self.parse_ident()?.name)
        } else {
            None
        };
        self.l.statement_term()?;
        Ok(Stmt::new(tok.loc, StmtKind::Continue { name }))
    }

    fn parse_loop_label(&mut self) -> PResult<Option<StringId>> {
        // `while name(cond)` / `for name(...)` label form.
        if self.l.check(TokenKind::Ident) && self.l.peek()?.kind == TokenKind::LParen {
            Ok(Some(self.parse_ident()?.name))
        } else {
            Ok(None)
        }
    }

    fn parse_do_while_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Do)?;
        let body = self.parse_statement(true)?;
        self.l.expect(TokenKind::While)?;
        let name = self.parse_loop_label()?;
        self.l.expect(TokenKind::LParen)?;
        let cond = self.parse_expression()?;
        let end = self.l.expect(TokenKind::RParen)?.loc;
        self.l.statement_term()?;
        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::DoWhile {
                name,
                body: Box::new(body),
                cond,
            },
        ))
    }

    fn parse_for_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::For)?;
        let name = self.parse_loop_label()?;
        self.l.expect(TokenKind::LParen)?;

        // Numeric form: `for(i: lo .. hi[, step])` (';' also accepted).
        if self.l.check(TokenKind::Ident) {
            let peek = self.l.peek()?.kind;
            if peek == TokenKind::Colon || peek == TokenKind::Semicolon {
                let index = self.parse_ident()?;
                self.l.next()?;
                let lo = self.parse_expression()?;
                self.l.expect(TokenKind::DotDot)?;
                let hi = self.parse_expression()?;
                let step = if self.l.check(TokenKind::Comma) {
                    self.l.next()?;
                    self.parse_expression()?
                } else {
                    Exp::new(hi.end_loc, ExpKind::Int(1))
                };
                self.l.expect(TokenKind::RParen)?;
                let body = self.parse_statement(true)?;
                let end = body.end_loc;
                return Ok(Stmt::spanned(
                    tok.loc,
                    end,
                    StmtKind::ForNum {
                        name,
                        index,
                        lo,
                        hi,
                        step,
                        body: Box::new(body),
                    },
                ));
            }
        }

        // C-style form.
        let mut init = Vec::new();
        if !self.l.check(TokenKind::Semicolon) {
            loop {
                if self.l.check(TokenKind::Local) {
                    self.l.next()?;
                    init.push(ForInit::Decl(Box::new(self.parse_var_decl(Protection::Local)?)));
                } else {
                    init.push(ForInit::Stmt(Box::new(self.parse_statement_expr()?)));
                }
                if self.l.check(TokenKind::Comma) {
                    self.l.next()?;
                } else {
                    break;
                }
            }
        }
        self.l.expect(TokenKind::Semicolon)?;

        let cond = if self.l.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.l.expect(TokenKind::Semicolon)?;

        let mut step = Vec::new();
        if !self.l.check(TokenKind::RParen) {
            loop {
                step.push(self.parse_statement_expr()?);
                if self.l.check(TokenKind::Comma) {
                    self.l.next()?;
                } else {
                    break;
                }
            }
        }
        self.l.expect(TokenKind::RParen)?;

        let body = self.parse_statement(true)?;
        let end = body.end_loc;
        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::For {
                name,
                init,
                cond,
                step,
                body: Box::new(body),
            },
        ))
    }

    fn parse_foreach_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Foreach)?;
        let name = self.parse_loop_label()?;
        self.l.expect(TokenKind::LParen)?;
        let (indices, container) = self.parse_foreach_header()?;
        self.l.expect(TokenKind::RParen)?;
        let body = self.parse_statement(true)?;
        let end = body.end_loc;
        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::Foreach {
                name,
                indices,
                container,
                body: Box::new(body),
            },
        ))
    }

    /// `ind1[, ind2...]; container[, state[, control]]`. A single index
    /// binds the iterator's first result (the yielded value for coroutine
    /// containers).
    fn parse_foreach_header(&mut self) -> PResult<(Vec<Ident>, Vec<Exp>)> {
        let mut indices = vec![self.parse_ident()?];
        while self.l.check(TokenKind::Comma) {
            self.l.next()?;
            indices.push(self.parse_ident()?);
        }
        self.l.expect(TokenKind::Semicolon)?;

        let mut container = vec![self.parse_expression()?];
        while self.l.check(TokenKind::Comma) {
            self.l.next()?;
            container.push(self.parse_expression()?);
        }
        if container.len() > 3 {
            return Err(self.syn(container[3].loc, "'foreach' may have a maximum of three container expressions"));
        }

        Ok((indices, container))
    }

    fn parse_if_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::If)?;
        self.l.expect(TokenKind::LParen)?;

        // `if(local x = cond)` binds the condition value.
        let cond_var = if self.l.check(TokenKind::Local) {
            self.l.next()?;
            let id = self.parse_ident()?;
            self.l.expect(TokenKind::Assign)?;
            Some(id)
        } else {
            None
        };

        let cond = self.parse_expression()?;
        self.l.expect(TokenKind::RParen)?;
        let then_body = self.parse_statement(true)?;

        let (end, else_body) = if self.l.check(TokenKind::Else) {
            self.l.next()?;
            let e = self.parse_statement(true)?;
            (e.end_loc, Some(Box::new(e)))
        } else {
            (then_body.end_loc, None)
        };

        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::If {
                cond_var,
                cond,
                then_body: Box::new(then_body),
                else_body,
            },
        ))
    }

    fn parse_import_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Import)?;

        // Module "name" is a dotted identifier chain or a parenthesized
        // expression evaluating to a string.
        let expr = if self.l.check(TokenKind::LParen) {
            self.l.next()?;
            let e = self.parse_expression()?;
            self.l.expect(TokenKind::RParen)?;
            e
        } else {
            let first = self.parse_ident()?;
            let mut name = self.l.interns().get(first.name).to_owned();
            let mut end = first.loc;
            while self.l.check(TokenKind::Dot) {
                self.l.next()?;
                let part = self.parse_ident()?;
                name.push('.');
                name.push_str(self.l.interns().get(part.name));
                end = part.loc;
            }
            let id = self.l.interns_mut().intern(&name);
            Exp::spanned(first.loc, end, ExpKind::Str(id))
        };

        let alias = if self.l.check(TokenKind::As) {
            self.l.next()?;
            Some(self.parse_ident()?)
        } else {
            None
        };

        let mut symbols = Vec::new();
        let mut symbol_names = Vec::new();
        if self.l.check(TokenKind::Colon) {
            self.l.next()?;
            loop {
                let sym = self.parse_ident()?;
                if self.l.check(TokenKind::As) {
                    self.l.next()?;
                    symbol_names.push(self.parse_ident()?);
                } else {
                    symbol_names.push(sym);
                }
                symbols.push(sym);
                if self.l.check(TokenKind::Comma) {
                    self.l.next()?;
                } else {
                    break;
                }
            }
        }

        self.l.statement_term()?;
        Ok(Stmt::new(
            tok.loc,
            StmtKind::Import {
                expr,
                alias,
                symbols,
                symbol_names,
            },
        ))
    }

    fn parse_return_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Return)?;
        let mut exprs = Vec::new();

        if !self.l.is_statement_term() {
            exprs.push(self.parse_expression()?);
            while self.l.check(TokenKind::Comma) {
                self.l.next()?;
                exprs.push(self.parse_expression()?);
            }
        }

        let end = exprs.last().map_or(tok.loc, |e| e.end_loc);
        self.l.statement_term()?;
        Ok(Stmt::spanned(tok.loc, end, StmtKind::Return { exprs }))
    }

    fn parse_scope_action_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Scope)?;
        self.l.expect(TokenKind::LParen)?;
        let which = self.l.expect(TokenKind::Ident)?;
        let action = match self.l.interns().get(which.string_value.expect("ident")) {
            "exit" => ScopeAction::Exit,
            "success" => ScopeAction::Success,
            "failure" => ScopeAction::Failure,
            other => {
                return Err(self.syn(which.loc, format!("Scope action must be 'exit', 'success', or 'failure', not '{other}'")));
            }
        };
        self.l.expect(TokenKind::RParen)?;
        let stmt = self.parse_statement(true)?;
        let end = stmt.end_loc;
        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::ScopeAction {
                action,
                stmt: Box::new(stmt),
            },
        ))
    }

    fn parse_switch_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Switch)?;
        let name = self.parse_loop_label()?;
        self.l.expect(TokenKind::LParen)?;
        let cond = self.parse_expression()?;
        self.l.expect(TokenKind::RParen)?;
        self.l.expect(TokenKind::LBrace)?;

        let mut cases = Vec::new();
        let mut default = None;

        while self.l.check(TokenKind::Case) {
            cases.push(self.parse_case_stmt()?);
        }

        if self.l.check(TokenKind::Default) {
            let dloc = self.l.next()?.loc;
            self.l.expect(TokenKind::Colon)?;
            let mut body = Vec::new();
            while !self.l.check(TokenKind::RBrace) {
                if self.l.check(TokenKind::Eof) {
                    return Err(self.syn(dloc, "Unterminated switch"));
                }
                body.push(self.parse_statement(true)?);
            }
            default = Some(body);
        }

        if cases.is_empty() && default.is_none() {
            return Err(self.syn(tok.loc, "Switch statement must have at least one case or default"));
        }

        let end = self.l.expect(TokenKind::RBrace)?.loc;
        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::Switch {
                name,
                cond,
                cases,
                default,
            },
        ))
    }

    fn parse_case_stmt(&mut self) -> PResult<Case> {
        let tok = self.l.expect(TokenKind::Case)?;
        let mut conditions = vec![CaseCond {
            exp: self.parse_expression()?,
        }];
        let mut high_range = None;

        if self.l.check(TokenKind::DotDot) {
            self.l.next()?;
            high_range = Some(self.parse_expression()?);
        } else {
            while self.l.check(TokenKind::Comma) {
                self.l.next()?;
                conditions.push(CaseCond {
                    exp: self.parse_expression()?,
                });
            }
        }

        self.l.expect(TokenKind::Colon)?;

        let mut body = Vec::new();
        while !matches!(self.kind(), TokenKind::Case | TokenKind::Default | TokenKind::RBrace) {
            if self.l.check(TokenKind::Eof) {
                return Err(self.syn(tok.loc, "Unterminated case"));
            }
            body.push(self.parse_statement(true)?);
        }

        Ok(Case {
            loc: tok.loc,
            conditions,
            high_range,
            body,
        })
    }

    /// Statement-position yield, with or without parentheses:
    /// `yield`, `yield 1, 2`, `yield(1, 2)`.
    fn parse_yield_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Yield)?;

        let mut args = Vec::new();
        let mut end = tok.loc;
        if self.l.check(TokenKind::LParen) {
            self.l.next()?;
            if !self.l.check(TokenKind::RParen) {
                args.push(self.parse_expression()?);
                while self.l.check(TokenKind::Comma) {
                    self.l.next()?;
                    args.push(self.parse_expression()?);
                }
            }
            end = self.l.expect(TokenKind::RParen)?.loc;
        } else if !self.l.is_statement_term() {
            args.push(self.parse_expression()?);
            while self.l.check(TokenKind::Comma) {
                self.l.next()?;
                args.push(self.parse_expression()?);
            }
            end = args.last().expect("nonempty").end_loc;
        }

        self.l.statement_term()?;
        let exp = Exp::spanned(tok.loc, end, ExpKind::Yield { args });
        Ok(Stmt::spanned(tok.loc, end, StmtKind::Expr(exp)))
    }

    fn parse_throw_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Throw)?;
        let exp = self.parse_expression()?;
        let end = exp.end_loc;
        self.l.statement_term()?;
        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::Throw {
                exp,
                rethrowing: false,
            },
        ))
    }

    fn parse_try_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::Try)?;
        let body = self.parse_statement(true)?;

        let mut catches: Vec<CatchClause> = Vec::new();
        while self.l.check(TokenKind::Catch) {
            self.l.next()?;
            self.l.expect(TokenKind::LParen)?;
            let catch_var = self.parse_ident()?;

            let mut ex_types = Vec::new();
            if self.l.check(TokenKind::Colon) {
                self.l.next()?;
                ex_types.push(self.parse_dotted_name()?);
                while self.l.check(TokenKind::BitOr) {
                    self.l.next()?;
                    ex_types.push(self.parse_dotted_name()?);
                }
            }

            self.l.expect(TokenKind::RParen)?;
            let catch_body = self.parse_statement(true)?;

            // Only the last clause may be a catchall.
            if let Some(prev) = catches.last() {
                if prev.ex_types.is_empty() {
                    return Err(self.syn(catch_var.loc, "Catchall clause must be the last catch clause"));
                }
            }

            catches.push(CatchClause {
                catch_var,
                ex_types,
                body: Box::new(catch_body),
            });
        }

        let finally_body = if self.l.check(TokenKind::Finally) {
            self.l.next()?;
            Some(self.parse_statement(true)?)
        } else {
            None
        };

        match (catches.is_empty(), finally_body) {
            (true, None) => Err(self.syn(tok.loc, "Try statement must have a catch or a finally clause")),
            (true, Some(f)) => {
                let end = f.end_loc;
                Ok(Stmt::spanned(
                    tok.loc,
                    end,
                    StmtKind::TryFinally {
                        body: Box::new(body),
                        finally_body: Box::new(f),
                    },
                ))
            }
            (false, finally) => {
                let end = catches.last().expect("nonempty").body.end_loc;
                let try_catch = Stmt::spanned(
                    tok.loc,
                    end,
                    StmtKind::TryCatch {
                        body: Box::new(body),
                        catches,
                        hidden_var: None,
                        transformed: None,
                    },
                );
                match finally {
                    None => Ok(try_catch),
                    Some(f) => {
                        let fend = f.end_loc;
                        Ok(Stmt::spanned(
                            tok.loc,
                            fend,
                            StmtKind::TryFinally {
                                body: Box::new(try_catch),
                                finally_body: Box::new(f),
                            },
                        ))
                    }
                }
            }
        }
    }

    fn parse_while_stmt(&mut self) -> PResult<Stmt> {
        let tok = self.l.expect(TokenKind::While)?;
        let name = self.parse_loop_label()?;
        self.l.expect(TokenKind::LParen)?;

        let cond_var = if self.l.check(TokenKind::Local) {
            self.l.next()?;
            let id = self.parse_ident()?;
            self.l.expect(TokenKind::Assign)?;
            Some(id)
        } else {
            None
        };

        let cond = self.parse_expression()?;
        self.l.expect(TokenKind::RParen)?;
        let body = self.parse_statement(true)?;
        let end = body.end_loc;
        Ok(Stmt::spanned(
            tok.loc,
            end,
            StmtKind::While {
                name,
                cond_var,
                cond,
                body: Box::new(body),
            },
        ))
    }

    // === Expression statements ===

    fn parse_expression_stmt(&mut self) -> PResult<Stmt> {
        let s = self.parse_statement_expr()?;
        self.l.statement_term()?;
        Ok(s)
    }

    fn parse_statement_expr(&mut self) -> PResult<Stmt> {
        let loc = self.loc();

        if self.l.check(TokenKind::Inc) {
            self.l.next()?;
            let exp = self.parse_primary_chain()?;
            let end = exp.end_loc;
            return Ok(Stmt::spanned(loc, end, StmtKind::IncStmt(exp)));
        }
        if self.l.check(TokenKind::Dec) {
            self.l.next()?;
            let exp = self.parse_primary_chain()?;
            let end = exp.end_loc;
            return Ok(Stmt::spanned(loc, end, StmtKind::DecStmt(exp)));
        }

        let first = self.parse_expression()?;

        use TokenKind as T;
        match self.kind() {
            T::Assign | T::Comma => self.parse_assign_stmt(first),
            T::AddEq => self.parse_op_assign(first, BinOp::Add),
            T::SubEq => self.parse_op_assign(first, BinOp::Sub),
            T::MulEq => self.parse_op_assign(first, BinOp::Mul),
            T::DivEq => self.parse_op_assign(first, BinOp::Div),
            T::ModEq => self.parse_op_assign(first, BinOp::Mod),
            T::BitAndEq => self.parse_op_assign(first, BinOp::And),
            T::BitOrEq => self.parse_op_assign(first, BinOp::Or),
            T::XorEq => self.parse_op_assign(first, BinOp::Xor),
            T::ShlEq => self.parse_op_assign(first, BinOp::Shl),
            T::ShrEq => self.parse_op_assign(first, BinOp::Shr),
            T::UShrEq => self.parse_op_assign(first, BinOp::UShr),
            T::CatEq => {
                self.l.next()?;
                let rhs = self.parse_expression()?;
                let end = rhs.end_loc;
                self.check_lhs(&first)?;
                Ok(Stmt::spanned(
                    loc,
                    end,
                    StmtKind::CatAssign {
                        lhs: first,
                        operands: vec![rhs],
                        collapsed: false,
                    },
                ))
            }
            T::DefaultEq => {
                self.l.next()?;
                let rhs = self.parse_expression()?;
                let end = rhs.end_loc;
                self.check_lhs(&first)?;
                Ok(Stmt::spanned(loc, end, StmtKind::CondAssign { lhs: first, rhs }))
            }
            T::Inc => {
                self.l.next()?;
                let end = first.end_loc;
                Ok(Stmt::spanned(loc, end, StmtKind::IncStmt(first)))
            }
            T::Dec => {
                self.l.next()?;
                let end = first.end_loc;
                Ok(Stmt::spanned(loc, end, StmtKind::DecStmt(first)))
            }
            _ => {
                if !first.is_statement_exp() {
                    return Err(self.syn(first.loc, "Expression cannot be used as a statement"));
                }
                let end = first.end_loc;
                Ok(Stmt::spanned(loc, end, StmtKind::Expr(first)))
            }
        }
    }

    fn check_lhs(&self, e: &Exp) -> PResult<()> {
        if e.is_lhs() || matches!(e.kind, ExpKind::This) {
            Ok(())
        } else {
            Err(self.syn(e.loc, "Expression is not an assignment target"))
        }
    }

    fn parse_assign_stmt(&mut self, first: Exp) -> PResult<Stmt> {
        let loc = first.loc;
        let mut lhs = vec![first];

        while self.l.check(TokenKind::Comma) {
            self.l.next()?;
            lhs.push(self.parse_expression()?);
        }
        for e in &lhs {
            self.check_lhs(e)?;
        }

        self.l.expect(TokenKind::Assign)?;
        let mut rhs = vec![self.parse_expression()?];
        while self.l.check(TokenKind::Comma) {
            self.l.next()?;
            rhs.push(self.parse_expression()?);
        }

        if lhs.len() < rhs.len() {
            return Err(self.syn(loc, "Assignment has fewer targets than sources"));
        }

        let end = rhs.last().expect("nonempty").end_loc;
        Ok(Stmt::spanned(loc, end, StmtKind::Assign { lhs, rhs }))
    }

    fn parse_op_assign(&mut self, lhs: Exp, op: BinOp) -> PResult<Stmt> {
        self.l.next()?;
        let rhs = self.parse_expression()?;
        let loc = lhs.loc;
        let end = rhs.end_loc;
        if !matches!(lhs.kind, ExpKind::This) {
            self.check_lhs(&lhs)?;
        }
        Ok(Stmt::spanned(loc, end, StmtKind::OpAssign { op, lhs, rhs }))
    }

    // === Expressions ===

    pub fn parse_expression(&mut self) -> PResult<Exp> {
        self.parse_cond_exp()
    }

    fn parse_cond_exp(&mut self) -> PResult<Exp> {
        let cond = self.parse_oror_exp()?;
        if !self.l.check(TokenKind::Question) {
            return Ok(cond);
        }
        self.l.next()?;
        let op1 = self.parse_expression()?;
        self.l.expect(TokenKind::Colon)?;
        let op2 = self.parse_cond_exp()?;
        let loc = cond.loc;
        let end = op2.end_loc;
        Ok(Exp::spanned(
            loc,
            end,
            ExpKind::Cond {
                cond: Box::new(cond),
                op1: Box::new(op1),
                op2: Box::new(op2),
            },
        ))
    }

    fn parse_oror_exp(&mut self) -> PResult<Exp> {
        let mut exp = self.parse_andand_exp()?;
        while matches!(self.kind(), TokenKind::OrOr | TokenKind::Or) {
            self.l.next()?;
            let rhs = self.parse_andand_exp()?;
            let loc = exp.loc;
            let end = rhs.end_loc;
            exp = Exp::spanned(loc, end, ExpKind::OrOr(Box::new(exp), Box::new(rhs)));
        }
        Ok(exp)
    }

    fn parse_andand_exp(&mut self) -> PResult<Exp> {
        let mut exp = self.parse_bitor_exp()?;
        while matches!(self.kind(), TokenKind::AndAnd | TokenKind::And) {
            self.l.next()?;
            let rhs = self.parse_bitor_exp()?;
            let loc = exp.loc;
            let end = rhs.end_loc;
            exp = Exp::spanned(loc, end, ExpKind::AndAnd(Box::new(exp), Box::new(rhs)));
        }
        Ok(exp)
    }

    fn parse_bitor_exp(&mut self) -> PResult<Exp> {
        let mut exp = self.parse_xor_exp()?;
        while self.l.check(TokenKind::BitOr) {
            self.l.next()?;
            let rhs = self.parse_xor_exp()?;
            exp = bin(exp, BinOp::Or, rhs);
        }
        Ok(exp)
    }

    fn parse_xor_exp(&mut self) -> PResult<Exp> {
        let mut exp = self.parse_bitand_exp()?;
        while self.l.check(TokenKind::Xor) {
            self.l.next()?;
            let rhs = self.parse_bitand_exp()?;
            exp = bin(exp, BinOp::Xor, rhs);
        }
        Ok(exp)
    }

    fn parse_bitand_exp(&mut self) -> PResult<Exp> {
        let mut exp = self.parse_cmp_exp()?;
        while self.l.check(TokenKind::BitAnd) {
            self.l.next()?;
            let rhs = self.parse_cmp_exp()?;
            exp = bin(exp, BinOp::And, rhs);
        }
        Ok(exp)
    }

    /// Equality, identity, membership, relational, and `<=>`; all
    /// non-associative.
    fn parse_cmp_exp(&mut self) -> PResult<Exp> {
        use TokenKind as T;
        let exp = self.parse_shift_exp()?;

        let op = match self.kind() {
            T::Eq => Some(CmpOp::Eq),
            T::Ne => Some(CmpOp::Ne),
            T::Is => Some(CmpOp::Is),
            T::In => Some(CmpOp::In),
            T::Lt => Some(CmpOp::Lt),
            T::Le => Some(CmpOp::Le),
            T::Gt => Some(CmpOp::Gt),
            T::Ge => Some(CmpOp::Ge),
            T::Cmp3 => None,
            T::Bang | T::Not => {
                // `!is` / `!in` (and keyword form `not is` / `not in`)
                match self.l.peek()?.kind {
                    T::Is => {
                        self.l.next()?;
                        self.l.next()?;
                        let rhs = self.parse_shift_exp()?;
                        return Ok(cmp(exp, CmpOp::NotIs, rhs));
                    }
                    T::In => {
                        self.l.next()?;
                        self.l.next()?;
                        let rhs = self.parse_shift_exp()?;
                        return Ok(cmp(exp, CmpOp::NotIn, rhs));
                    }
                    _ => return Ok(exp),
                }
            }
            _ => return Ok(exp),
        };

        match op {
            Some(op) => {
                self.l.next()?;
                let rhs = self.parse_shift_exp()?;
                Ok(cmp(exp, op, rhs))
            }
            None => {
                self.l.next()?;
                let rhs = self.parse_shift_exp()?;
                Ok(bin(exp, BinOp::Cmp3, rhs))
            }
        }
    }

    fn parse_shift_exp(&mut self) -> PResult<Exp> {
        use TokenKind as T;
        let mut exp = self.parse_add_exp()?;
        loop {
            let op = match self.kind() {
                T::Shl => BinOp::Shl,
                T::Shr => BinOp::Shr,
                T::UShr => BinOp::UShr,
                _ => break,
            };
            self.l.next()?;
            let rhs = self.parse_add_exp()?;
            exp = bin(exp, op, rhs);
        }
        Ok(exp)
    }

    /// Additive level; `~` (concatenation) lives here and builds the n-ary
    /// node the semantic pass collapses.
    fn parse_add_exp(&mut self) -> PResult<Exp> {
        use TokenKind as T;
        let mut exp = self.parse_mul_exp()?;
        loop {
            match self.kind() {
                T::Add => {
                    self.l.next()?;
                    let rhs = self.parse_mul_exp()?;
                    exp = bin(exp, BinOp::Add, rhs);
                }
                T::Sub => {
                    self.l.next()?;
                    let rhs = self.parse_mul_exp()?;
                    exp = bin(exp, BinOp::Sub, rhs);
                }
                T::Cat => {
                    self.l.next()?;
                    let rhs = self.parse_mul_exp()?;
                    let loc = exp.loc;
                    let end = rhs.end_loc;
                    exp = Exp::spanned(
                        loc,
                        end,
                        ExpKind::Cat {
                            operands: vec![exp, rhs],
                            collapsed: false,
                        },
                    );
                }
                _ => break,
            }
        }
        Ok(exp)
    }

    fn parse_mul_exp(&mut self) -> PResult<Exp> {
        use TokenKind as T;
        let mut exp = self.parse_un_exp()?;
        loop {
            let op = match self.kind() {
                T::Mul => BinOp::Mul,
                T::Div => BinOp::Div,
                T::Mod => BinOp::Mod,
                _ => break,
            };
            self.l.next()?;
            let rhs = self.parse_un_exp()?;
            exp = bin(exp, op, rhs);
        }
        Ok(exp)
    }

    fn parse_un_exp(&mut self) -> PResult<Exp> {
        use TokenKind as T;
        let loc = self.loc();
        match self.kind() {
            T::Sub => {
                self.l.next()?;
                let op = self.parse_un_exp()?;
                let end = op.end_loc;
                Ok(Exp::spanned(loc, end, ExpKind::Neg(Box::new(op))))
            }
            T::Bang | T::Not => {
                self.l.next()?;
                let op = self.parse_un_exp()?;
                let end = op.end_loc;
                Ok(Exp::spanned(loc, end, ExpKind::Not(Box::new(op))))
            }
            // Unary `~` is bitwise complement.
            T::Cat => {
                self.l.next()?;
                let op = self.parse_un_exp()?;
                let end = op.end_loc;
                Ok(Exp::spanned(loc, end, ExpKind::Com(Box::new(op))))
            }
            T::Length => {
                self.l.next()?;
                let op = self.parse_un_exp()?;
                let end = op.end_loc;
                if matches!(op.kind, ExpKind::Vararg) {
                    Ok(Exp::spanned(loc, end, ExpKind::VargLen))
                } else {
                    Ok(Exp::spanned(loc, end, ExpKind::Len(Box::new(op))))
                }
            }
            _ => self.parse_primary_chain(),
        }
    }

    fn parse_primary_chain(&mut self) -> PResult<Exp> {
        let exp = self.parse_primary_exp()?;
        self.parse_postfix(exp)
    }

    fn parse_primary_exp(&mut self) -> PResult<Exp> {
        use TokenKind as T;
        let loc = self.loc();
        match self.kind() {
            T::Ident => {
                let id = self.parse_ident()?;
                Ok(Exp::new(loc, ExpKind::Ident(id)))
            }
            T::This => {
                self.l.next()?;
                Ok(Exp::new(loc, ExpKind::This))
            }
            T::Null => {
                self.l.next()?;
                Ok(Exp::new(loc, ExpKind::Null))
            }
            T::True => {
                self.l.next()?;
                Ok(Exp::new(loc, ExpKind::Bool(true)))
            }
            T::False => {
                self.l.next()?;
                Ok(Exp::new(loc, ExpKind::Bool(false)))
            }
            T::IntLiteral => {
                let t = self.l.next()?;
                Ok(Exp::new(loc, ExpKind::Int(t.int_value)))
            }
            T::FloatLiteral => {
                let t = self.l.next()?;
                Ok(Exp::new(loc, ExpKind::Float(t.float_value)))
            }
            T::StringLiteral => {
                let t = self.l.next()?;
                Ok(Exp::new(loc, ExpKind::Str(t.string_value.expect("string token"))))
            }
            T::Vararg => {
                self.l.next()?;
                Ok(Exp::new(loc, ExpKind::Vararg))
            }
            T::Function => self.parse_func_literal_exp(),
            T::Backslash => self.parse_haskell_func_literal(),
            T::LParen => {
                self.l.next()?;
                let inner = self.parse_expression()?;
                let end = self.l.expect(T::RParen)?.loc;
                if inner.is_mult_ret() {
                    // Parenthesization truncates a multi-return to one value.
                    Ok(Exp::spanned(loc, end, ExpKind::Paren(Box::new(inner))))
                } else {
                    Ok(inner)
                }
            }
            T::LBrace => self.parse_table_ctor(),
            T::LBracket => self.parse_array_ctor(),
            T::Yield => {
                self.l.next()?;
                self.l.expect(T::LParen)?;
                let mut args = Vec::new();
                if !self.l.check(T::RParen) {
                    args.push(self.parse_expression()?);
                    while self.l.check(T::Comma) {
                        self.l.next()?;
                        args.push(self.parse_expression()?);
                    }
                }
                let end = self.l.expect(T::RParen)?.loc;
                Ok(Exp::spanned(loc, end, ExpKind::Yield { args }))
            }
            other => Err(self.syn(loc, format!("Expression expected, not '{other}'"))),
        }
    }

    fn parse_func_literal_exp(&mut self) -> PResult<Exp> {
        let tok = self.l.expect(TokenKind::Function)?;
        let name = if self.l.check(TokenKind::Ident) {
            self.parse_ident()?
        } else {
            self.dummy_ident(tok.loc, "literal")
        };
        let def = self.parse_func_body(tok.loc, name)?;
        let end = def.end_loc;
        Ok(Exp::spanned(tok.loc, end, ExpKind::FuncLiteral(Box::new(def))))
    }

    /// `\a, b -> exp`: sugar for a function literal returning one expression.
    fn parse_haskell_func_literal(&mut self) -> PResult<Exp> {
        let tok = self.l.expect(TokenKind::Backslash)?;
        let name = self.dummy_ident(tok.loc, "literal");

        let mut params = Vec::new();
        if self.l.check(TokenKind::Ident) {
            loop {
                let pname = self.parse_ident()?;
                params.push(FuncParam {
                    name: pname,
                    type_mask: TYPEMASK_ANY,
                    class_types: Vec::new(),
                    custom_constraint: None,
                    default: None,
                });
                if self.l.check(TokenKind::Comma) {
                    self.l.next()?;
                } else {
                    break;
                }
            }
        }

        self.l.expect(TokenKind::Arrow)?;
        let body_exp = self.parse_expression()?;
        let end = body_exp.end_loc;
        let ret = Stmt::spanned(body_exp.loc, end, StmtKind::Return { exprs: vec![body_exp] });

        Ok(Exp::spanned(
            tok.loc,
            end,
            ExpKind::FuncLiteral(Box::new(FuncDef {
                loc: tok.loc,
                end_loc: end,
                name,
                params,
                is_vararg: false,
                body: Box::new(Stmt::spanned(tok.loc, end, StmtKind::Scope(Box::new(ret)))),
                docs: None,
            })),
        ))
    }

    fn parse_table_ctor(&mut self) -> PResult<Exp> {
        let open = self.l.expect(TokenKind::LBrace)?;
        let mut fields: Vec<(Exp, Exp)> = Vec::new();

        let mut first = true;
        while !self.l.check(TokenKind::RBrace) {
            if !first {
                if self.l.check(TokenKind::Comma) {
                    self.l.next()?;
                    if self.l.check(TokenKind::RBrace) {
                        break;
                    }
                } else {
                    return Err(self.syn(self.loc(), "Table constructor fields must be separated by commas"));
                }
            }
            first = false;

            match self.kind() {
                TokenKind::LBracket => {
                    self.l.next()?;
                    let key = self.parse_expression()?;
                    self.l.expect(TokenKind::RBracket)?;
                    self.l.expect(TokenKind::Assign)?;
                    let value = self.parse_expression()?;

                    // Comprehension form: exactly one `[k] = v` followed by a
                    // foreach/for clause chain.
                    if fields.is_empty() && matches!(self.kind(), TokenKind::Foreach | TokenKind::For) {
                        let comp = self.parse_for_comprehension()?;
                        let end = self.l.expect(TokenKind::RBrace)?.loc;
                        return Ok(Exp::spanned(
                            open.loc,
                            end,
                            ExpKind::TableComprehension {
                                key: Box::new(key),
                                value: Box::new(value),
                                comp: Box::new(comp),
                            },
                        ));
                    }
                    fields.push((key, value));
                }
                TokenKind::Function => {
                    let ftok = self.l.next()?;
                    let fname = self.parse_ident()?;
                    let def = self.parse_func_body(ftok.loc, fname)?;
                    let end = def.end_loc;
                    let key = Exp::new(fname.loc, ExpKind::Str(fname.name));
                    let value = Exp::spanned(ftok.loc, end, ExpKind::FuncLiteral(Box::new(def)));
                    fields.push((key, value));
                }
                _ => {
                    let fname = self.parse_ident()?;
                    self.l.expect(TokenKind::Assign)?;
                    let value = self.parse_expression()?;
                    let key = Exp::new(fname.loc, ExpKind::Str(fname.name));
                    fields.push((key, value));
                }
            }
        }

        let end = self.l.expect(TokenKind::RBrace)?.loc;
        Ok(Exp::spanned(open.loc, end, ExpKind::TableCtor { fields }))
    }

    fn parse_array_ctor(&mut self) -> PResult<Exp> {
        let open = self.l.expect(TokenKind::LBracket)?;
        let mut values = Vec::new();

        if !self.l.check(TokenKind::RBracket) {
            let first = self.parse_expression()?;

            if matches!(self.kind(), TokenKind::Foreach | TokenKind::For) {
                let comp = self.parse_for_comprehension()?;
                let end = self.l.expect(TokenKind::RBracket)?.loc;
                return Ok(Exp::spanned(
                    open.loc,
                    end,
                    ExpKind::ArrayComprehension {
                        exp: Box::new(first),
                        comp: Box::new(comp),
                    },
                ));
            }

            values.push(first);
            while self.l.check(TokenKind::Comma) {
                self.l.next()?;
                if self.l.check(TokenKind::RBracket) {
                    break;
                }
                values.push(self.parse_expression()?);
            }
        }

        let end = self.l.expect(TokenKind::RBracket)?.loc;
        Ok(Exp::spanned(open.loc, end, ExpKind::ArrayCtor { values }))
    }

    /// `foreach(i; c)` / `for(i: lo .. hi[, step])` clause chains inside
    /// comprehensions, with optional trailing `if(cond)`.
    fn parse_for_comprehension(&mut self) -> PResult<ForComp> {
        use TokenKind as T;
        let loc = self.loc();

        match self.kind() {
            T::Foreach => {
                self.l.next()?;
                self.l.expect(T::LParen)?;
                let (indices, container) = self.parse_foreach_header()?;
                let end = self.l.expect(T::RParen)?.loc;
                let (if_comp, next) = self.parse_comp_tail()?;
                Ok(ForComp::Foreach {
                    loc,
                    end_loc: end,
                    indices,
                    container,
                    if_comp,
                    next,
                })
            }
            T::For => {
                self.l.next()?;
                self.l.expect(T::LParen)?;
                let index = self.parse_ident()?;
                if !self.l.check(T::Colon) && !self.l.check(T::Semicolon) {
                    return Err(self.syn(self.loc(), "Numeric comprehension must use 'for(name: lo .. hi)'"));
                }
                self.l.next()?;
                let lo = self.parse_expression()?;
                self.l.expect(T::DotDot)?;
                let hi = self.parse_expression()?;
                let step = if self.l.check(T::Comma) {
                    self.l.next()?;
                    self.parse_expression()?
                } else {
                    Exp::new(hi.end_loc, ExpKind::Int(1))
                };
                let end = self.l.expect(T::RParen)?.loc;
                let (if_comp, next) = self.parse_comp_tail()?;
                Ok(ForComp::ForNum {
                    loc,
                    end_loc: end,
                    index,
                    lo: Box::new(lo),
                    hi: Box::new(hi),
                    step: Box::new(step),
                    if_comp,
                    next,
                })
            }
            other => Err(self.syn(loc, format!("'foreach' or 'for' expected in comprehension, not '{other}'"))),
        }
    }

    fn parse_comp_tail(&mut self) -> PResult<(Option<Box<Exp>>, Option<Box<ForComp>>)> {
        use TokenKind as T;
        let mut if_comp = None;
        if self.l.check(T::If) {
            self.l.next()?;
            self.l.expect(T::LParen)?;
            if_comp = Some(Box::new(self.parse_expression()?));
            self.l.expect(T::RParen)?;
        }
        let next = if matches!(self.kind(), T::Foreach | T::For) {
            Some(Box::new(self.parse_for_comprehension()?))
        } else {
            None
        };
        Ok((if_comp, next))
    }

    fn parse_postfix(&mut self, mut exp: Exp) -> PResult<Exp> {
        use TokenKind as T;
        loop {
            match self.kind() {
                T::Dot => {
                    self.l.next()?;
                    match self.kind() {
                        T::Ident => {
                            let field = self.parse_ident()?;
                            let name_exp = Exp::new(field.loc, ExpKind::Str(field.name));

                            if self.l.check(T::LParen) {
                                let args = self.parse_arguments()?;
                                let end = self.loc();
                                let loc = exp.loc;
                                exp = Exp::spanned(
                                    loc,
                                    end,
                                    ExpKind::MethodCall {
                                        op: Box::new(exp),
                                        method: Box::new(name_exp),
                                        args,
                                    },
                                );
                            } else {
                                let loc = exp.loc;
                                exp = Exp::spanned(
                                    loc,
                                    field.loc,
                                    ExpKind::Dot {
                                        op: Box::new(exp),
                                        name: Box::new(name_exp),
                                    },
                                );
                            }
                        }
                        T::LParen => {
                            self.l.next()?;
                            let name = self.parse_expression()?;
                            let end = self.l.expect(T::RParen)?.loc;
                            let loc = exp.loc;
                            exp = Exp::spanned(
                                loc,
                                end,
                                ExpKind::Dot {
                                    op: Box::new(exp),
                                    name: Box::new(name),
                                },
                            );
                        }
                        other => return Err(self.syn(self.loc(), format!("Identifier expected after '.', not '{other}'"))),
                    }
                }
                T::LParen => {
                    let args = self.parse_arguments()?;
                    let end = self.loc();
                    let loc = exp.loc;
                    exp = Exp::spanned(
                        loc,
                        end,
                        ExpKind::Call {
                            op: Box::new(exp),
                            context: None,
                            args,
                        },
                    );
                }
                T::LBracket => {
                    self.l.next()?;
                    let loc = exp.loc;
                    let is_vararg = matches!(exp.kind, ExpKind::Vararg);

                    // `[]`, `[lo .. hi]`, or `[index]`.
                    if self.l.check(T::RBracket) {
                        let end = self.l.next()?.loc;
                        let lo = Exp::new(end, ExpKind::Null);
                        let hi = Exp::new(end, ExpKind::Null);
                        exp = slice_exp(loc, end, exp, lo, hi, is_vararg);
                        continue;
                    }

                    let lo = if self.l.check(T::DotDot) {
                        Exp::new(self.loc(), ExpKind::Null)
                    } else {
                        self.parse_expression()?
                    };

                    if self.l.check(T::DotDot) {
                        self.l.next()?;
                        let hi = if self.l.check(T::RBracket) {
                            Exp::new(self.loc(), ExpKind::Null)
                        } else {
                            self.parse_expression()?
                        };
                        let end = self.l.expect(T::RBracket)?.loc;
                        exp = slice_exp(loc, end, exp, lo, hi, is_vararg);
                    } else {
                        let end = self.l.expect(T::RBracket)?.loc;
                        if is_vararg {
                            exp = Exp::spanned(loc, end, ExpKind::VargIndex { index: Box::new(lo) });
                        } else {
                            exp = Exp::spanned(
                                loc,
                                end,
                                ExpKind::Index {
                                    op: Box::new(exp),
                                    index: Box::new(lo),
                                },
                            );
                        }
                    }
                }
                _ => break,
            }

            // `x.super` postfix
            if let ExpKind::Dot { op, name } = &exp.kind {
                if let ExpKind::Str(id) = name.kind {
                    if self.l.interns().get(id) == "super" {
                        let loc = exp.loc;
                        let end = exp.end_loc;
                        let inner = op.as_ref().clone();
                        exp = Exp::spanned(loc, end, ExpKind::DotSuper(Box::new(inner)));
                    }
                }
            }
        }
        Ok(exp)
    }

    fn parse_arguments(&mut self) -> PResult<Vec<Exp>> {
        self.l.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.l.check(TokenKind::RParen) {
            args.push(self.parse_expression()?);
            while self.l.check(TokenKind::Comma) {
                self.l.next()?;
                args.push(self.parse_expression()?);
            }
        }
        self.l.expect(TokenKind::RParen)?;
        Ok(args)
    }
}

fn bin(op1: Exp, op: BinOp, op2: Exp) -> Exp {
    let loc = op1.loc;
    let end = op2.end_loc;
    Exp::spanned(
        loc,
        end,
        ExpKind::Bin {
            op,
            op1: Box::new(op1),
            op2: Box::new(op2),
        },
    )
}

fn cmp(op1: Exp, op: CmpOp, op2: Exp) -> Exp {
    let loc = op1.loc;
    let end = op2.end_loc;
    Exp::spanned(
        loc,
        end,
        ExpKind::Cmp {
            op,
            op1: Box::new(op1),
            op2: Box::new(op2),
        },
    )
}

fn slice_exp(loc: CompileLoc, end: CompileLoc, op: Exp, lo: Exp, hi: Exp, is_vararg: bool) -> Exp {
    if is_vararg {
        Exp::spanned(
            loc,
            end,
            ExpKind::VargSlice {
                lo: Box::new(lo),
                hi: Box::new(hi),
            },
        )
    } else {
        Exp::spanned(
            loc,
            end,
            ExpKind::Slice {
                op: Box::new(op),
                lo: Box::new(lo),
                hi: Box::new(hi),
            },
        )
    }
}
