//! The function builder: an expression-stack machine that emits register
//! bytecode.
//!
//! The code generator pushes abstract operands (locals, constants, globals,
//! upvalues, indexes, fields, slices, varargs, calls, ...) and combines them;
//! the builder schedules concrete register traffic and emits instructions. It
//! owns register allocation (a bump allocator snapshotted per scope), local
//! and upvalue bookkeeping, the deduplicated constant pool, switch tables,
//! jump lists for condition codes, and exception-handler frame emission.
//!
//! Nested functions are built on a stack of function states: `begin_function`
//! pushes a fresh state, `end_function` finalizes it into a funcdef and
//! pushes the closure expression onto the enclosing state.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    bytecode::{
        FuncDefData, LocalDesc, SwitchTable, UpvalDesc,
        instr::{
            self, ARRAY_SET_FIELDS, CONST_BIT, MAX_CONSTANT, MAX_INNER_FUNC, MAX_JUMP_BACKWARD, MAX_JUMP_FORWARD,
            MAX_REGISTER, MAX_SWITCH_TABLE, MAX_UPVALUE, NO_JUMP,
        },
        op::{Comparison, Opcode},
    },
    compiler::CompileLoc,
    errors::{CompileError, CompilePhase},
    intern::{Interns, StringId},
    value::Value,
};

type BResult<T> = Result<T, CompileError>;

/// Kinds of abstract operands on the expression stack. `Temporary` is the
/// `Local` representation pointing at a freshly-claimed register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpType {
    Const,
    Local,
    NewLocal,
    Upval,
    Global,
    NewGlobal,
    Index,
    Field,
    Slice,
    Vararg,
    VargIndex,
    VargSlice,
    Length,
    Call,
    Yield,
    NeedsDest,
    Conflict,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Exp {
    pub ty: ExpType,
    pub index: usize,
    pub index2: usize,
    /// First free register after this operand; popping restores it.
    pub reg_after: usize,
}

impl Exp {
    fn new(ty: ExpType, index: usize) -> Self {
        Self {
            ty,
            index,
            index2: 0,
            reg_after: 0,
        }
    }

    pub fn is_mult_ret(&self) -> bool {
        matches!(self.ty, ExpType::Call | ExpType::Yield | ExpType::Vararg | ExpType::VargSlice)
    }

    pub fn is_source(&self) -> bool {
        matches!(self.ty, ExpType::Local | ExpType::Const)
    }

    fn is_dest(&self) -> bool {
        matches!(
            self.ty,
            ExpType::Local
                | ExpType::NewLocal
                | ExpType::Upval
                | ExpType::Global
                | ExpType::NewGlobal
                | ExpType::Index
                | ExpType::Field
                | ExpType::Slice
                | ExpType::VargIndex
                | ExpType::Length
        )
    }
}

/// Pending true/false jump lists for a condition in flight.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InstRef {
    pub true_list: i32,
    pub false_list: i32,
}

impl InstRef {
    pub fn new() -> Self {
        Self {
            true_list: NO_JUMP,
            false_list: NO_JUMP,
        }
    }
}

#[derive(Debug, Clone)]
struct Scope {
    break_scope: Option<usize>,
    continue_scope: Option<usize>,
    breaks: i32,
    continues: i32,
    name: Option<StringId>,
    var_start: usize,
    reg_start: usize,
    first_free_reg: usize,
    has_upval: bool,
    eh_level: usize,
}

/// An in-progress switch.
#[derive(Debug, Default)]
struct SwitchDesc {
    offsets: AHashMap<Value, i32>,
    default_offset: Option<i32>,
    switch_pc: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ForDesc {
    base_reg: usize,
    begin_jump: usize,
    begin_loop: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MethodCallDesc {
    base_reg: usize,
    base_exp: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NamespaceDesc {
    prev_reg: Option<usize>,
}

#[derive(Debug, Clone)]
struct LocVar {
    name: StringId,
    loc: CompileLoc,
    pc_start: usize,
    pc_end: usize,
    reg: usize,
    is_active: bool,
}

struct FuncState {
    loc: CompileLoc,
    name: StringId,
    is_vararg: bool,
    num_params: usize,
    param_masks: Vec<u32>,

    scopes: Vec<Scope>,
    free_reg: usize,
    stack_size: usize,
    exp_stack: Vec<Exp>,
    try_catch_depth: usize,

    upvals: Vec<UpvalDesc>,
    inner: Vec<Rc<FuncDefData>>,
    constants: Vec<Value>,
    const_map: AHashMap<Value, usize>,
    code: Vec<u16>,
    line_info: Vec<u32>,
    /// Register holding the namespace under construction, if any; closures
    /// made inside a namespace body bind it as their environment.
    namespace_reg: Option<usize>,
    switch_stack: Vec<SwitchDesc>,
    switch_tables: Vec<SwitchTable>,
    loc_vars: Vec<LocVar>,
    dummy_counter: u32,
}

impl FuncState {
    fn new(loc: CompileLoc, name: StringId) -> Self {
        let mut fs = Self {
            loc,
            name,
            is_vararg: false,
            num_params: 0,
            param_masks: Vec::new(),
            scopes: Vec::new(),
            free_reg: 0,
            stack_size: 0,
            exp_stack: Vec::new(),
            try_catch_depth: 0,
            upvals: Vec::new(),
            inner: Vec::new(),
            constants: Vec::new(),
            const_map: AHashMap::new(),
            code: Vec::new(),
            line_info: Vec::new(),
            namespace_reg: None,
            switch_stack: Vec::new(),
            switch_tables: Vec::new(),
            loc_vars: Vec::new(),
            dummy_counter: 0,
        };
        // null is always constant 0.
        fs.constants.push(Value::Null);
        fs.const_map.insert(Value::Null, 0);
        fs
    }
}

pub(crate) struct Builder<'a> {
    interns: &'a mut Interns,
    file: StringId,
    file_name: String,
    funcs: Vec<FuncState>,
}

impl<'a> Builder<'a> {
    pub fn new(interns: &'a mut Interns, file_name: &str) -> Self {
        let file = interns.intern(file_name);
        Self {
            interns,
            file,
            file_name: file_name.to_owned(),
            funcs: Vec::new(),
        }
    }

    pub fn interns(&self) -> &Interns {
        self.interns
    }

    pub fn interns_mut(&mut self) -> &mut Interns {
        self.interns
    }

    fn err(&self, loc: CompileLoc, msg: impl Into<String>) -> CompileError {
        let file = if loc.file == self.file {
            self.file_name.clone()
        } else {
            self.interns.get(loc.file).to_owned()
        };
        CompileError::new(CompilePhase::Semantic, msg.into(), &file, loc.line, loc.col)
    }

    fn f(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("no function under construction")
    }

    fn fr(&self) -> &FuncState {
        self.funcs.last().expect("no function under construction")
    }

    // === Function nesting ===

    pub fn begin_function(&mut self, loc: CompileLoc, name: StringId, is_vararg: bool) {
        let mut fs = FuncState::new(loc, name);
        fs.is_vararg = is_vararg;
        self.funcs.push(fs);
    }

    pub fn set_num_params(&mut self, num: usize) {
        self.f().num_params = num;
    }

    pub fn is_vararg(&self) -> bool {
        self.fr().is_vararg
    }

    /// Finalizes the current function state into a funcdef.
    fn finish_funcdef(&mut self) -> Rc<FuncDefData> {
        let fs = self.funcs.pop().expect("no function under construction");
        let stack_size = fs.stack_size.max(fs.num_params).max(2);
        Rc::new(FuncDefData {
            file: self.file,
            line: fs.loc.line,
            col: fs.loc.col,
            name: fs.name,
            num_params: fs.num_params,
            param_masks: fs.param_masks,
            is_vararg: fs.is_vararg,
            stack_size: stack_size + 1,
            inner: fs.inner,
            constants: fs.constants,
            code: fs.code,
            switch_tables: fs.switch_tables,
            line_info: fs.line_info,
            upvals: fs.upvals,
            locals: fs
                .loc_vars
                .iter()
                .map(|lv| LocalDesc {
                    name: lv.name,
                    pc_start: lv.pc_start as u32,
                    pc_end: lv.pc_end as u32,
                    reg: lv.reg as u16,
                })
                .collect(),
        })
    }

    /// Ends the top-level function and returns its body.
    pub fn end_module_function(&mut self) -> Rc<FuncDefData> {
        debug_assert_eq!(self.funcs.len(), 1);
        self.finish_funcdef()
    }

    /// Ends an inner function and pushes the closure expression onto the
    /// enclosing function's stack.
    pub fn end_function(&mut self, loc: CompileLoc) -> BResult<()> {
        let def = self.finish_funcdef();
        let parent = self.f();
        parent.inner.push(def);
        if parent.inner.len() > MAX_INNER_FUNC {
            return Err(self.err(loc, "Too many inner functions"));
        }
        let idx = self.fr().inner.len() - 1;

        if let Some(ns_reg) = self.fr().namespace_reg {
            let reg = self.push_register(loc)?;
            self.push_exp(ExpType::Local, reg);
            self.code_move(loc, reg, ns_reg);
            self.code_rd(loc, Opcode::ClosureWithEnv, reg);
            self.code_uimm(idx);
        } else {
            let inst = self.code_rd(loc, Opcode::Closure, 0);
            self.code_uimm(idx);
            self.push_exp(ExpType::NeedsDest, inst);
        }
        Ok(())
    }

    // === Scopes ===

    pub fn push_scope(&mut self) {
        let (break_scope, continue_scope, eh_level) = match self.fr().scopes.last() {
            Some(s) => (s.break_scope, s.continue_scope, s.eh_level),
            None => (None, None, 0),
        };
        let fs = self.f();
        let scope = Scope {
            break_scope,
            continue_scope,
            breaks: NO_JUMP,
            continues: NO_JUMP,
            name: None,
            var_start: fs.loc_vars.len(),
            reg_start: fs.free_reg,
            first_free_reg: fs.free_reg,
            has_upval: false,
            eh_level,
        };
        fs.scopes.push(scope);
    }

    pub fn pop_scope(&mut self, loc: CompileLoc) {
        self.close_scope_upvals(loc);
        let fs = self.f();
        let scope = fs.scopes.pop().expect("scope underflow");
        let here = fs.code.len();
        for lv in fs.loc_vars[scope.var_start..].iter_mut().rev() {
            if lv.reg >= scope.reg_start && lv.is_active {
                lv.is_active = false;
                lv.pc_end = here;
            }
        }
        fs.free_reg = scope.reg_start;
    }

    pub fn set_breakable(&mut self) {
        let idx = self.fr().scopes.len() - 1;
        self.f().scopes[idx].break_scope = Some(idx);
    }

    pub fn set_continuable(&mut self) {
        let idx = self.fr().scopes.len() - 1;
        self.f().scopes[idx].continue_scope = Some(idx);
    }

    pub fn set_scope_name(&mut self, name: Option<StringId>) {
        self.f().scopes.last_mut().expect("scope").name = name;
    }

    pub fn close_scope_upvals(&mut self, loc: CompileLoc) {
        let Some(scope) = self.fr().scopes.last() else { return };
        if scope.has_upval {
            let reg = scope.reg_start;
            self.code_rd(loc, Opcode::Close, reg);
            self.f().scopes.last_mut().expect("scope").has_upval = false;
        }
    }

    // === Locals ===

    pub fn add_param(&mut self, name: StringId, loc: CompileLoc, type_mask: u32) -> BResult<()> {
        self.insert_local_named(name, loc)?;
        self.f().param_masks.push(type_mask);
        Ok(())
    }

    fn search_local(fs: &FuncState, name: StringId) -> Option<(usize, usize)> {
        for (i, lv) in fs.loc_vars.iter().enumerate().rev() {
            if lv.is_active && lv.name == name {
                return Some((i, lv.reg));
            }
        }
        None
    }

    pub fn insert_local(&mut self, name: StringId, loc: CompileLoc) -> BResult<usize> {
        self.insert_local_named(name, loc)
    }

    fn insert_local_named(&mut self, name: StringId, loc: CompileLoc) -> BResult<usize> {
        if let Some((idx, _)) = Self::search_local(self.fr(), name) {
            let prev = self.fr().loc_vars[idx].loc;
            let name_str = self.interns.get(name).to_owned();
            let prev_file = self.interns.get(prev.file).to_owned();
            return Err(self.err(
                loc,
                format!(
                    "Local '{name_str}' conflicts with previous definition at {prev_file}({}:{})",
                    prev.line, prev.col
                ),
            ));
        }
        let reg = self.push_register(loc)?;
        self.f().loc_vars.push(LocVar {
            name,
            loc,
            pc_start: 0,
            pc_end: 0,
            reg,
            is_active: false,
        });
        Ok(reg)
    }

    pub fn insert_dummy_local(&mut self, loc: CompileLoc, prefix: &str) -> BResult<usize> {
        let n = self.fr().dummy_counter;
        self.f().dummy_counter += 1;
        let name = self.interns.intern(&format!("__{prefix}{n}"));
        self.insert_local_named(name, loc)
    }

    pub fn activate_locals(&mut self, num: usize) {
        let here = self.fr().code.len();
        let fs = self.f();
        let len = fs.loc_vars.len();
        for lv in &mut fs.loc_vars[len - num..] {
            lv.is_active = true;
            lv.pc_start = here;
        }
        let first_free = fs.loc_vars[len - 1].reg + 1;
        fs.scopes.last_mut().expect("scope").first_free_reg = first_free;
        if let Some(top) = fs.exp_stack.last_mut() {
            if top.reg_after < first_free {
                top.reg_after = first_free;
            }
        }
    }

    // === Registers ===

    fn push_register(&mut self, loc: CompileLoc) -> BResult<usize> {
        let reg = self.fr().free_reg;
        self.check_reg_ok(loc, reg)?;
        let fs = self.f();
        fs.free_reg += 1;
        if fs.free_reg > fs.stack_size {
            fs.stack_size = fs.free_reg;
        }
        Ok(reg)
    }

    fn check_reg_ok(&self, loc: CompileLoc, reg: usize) -> BResult<usize> {
        if reg > MAX_REGISTER {
            return Err(self.err(loc, "Too many registers"));
        }
        Ok(reg)
    }

    // === Expression stack primitives ===

    fn push_exp(&mut self, ty: ExpType, index: usize) -> &mut Exp {
        let free = self.fr().free_reg;
        let fs = self.f();
        fs.exp_stack.push(Exp {
            ty,
            index,
            index2: 0,
            reg_after: free,
        });
        fs.exp_stack.last_mut().expect("just pushed")
    }

    fn push_exp2(&mut self, ty: ExpType, index: usize, index2: usize) {
        self.push_exp(ty, index).index2 = index2;
    }

    fn get_exp(&self, back: usize) -> Exp {
        let fs = self.fr();
        fs.exp_stack[fs.exp_stack.len() - back]
    }

    pub fn pop(&mut self, num: usize) {
        debug_assert!(num >= 1);
        let fs = self.f();
        debug_assert!(fs.exp_stack.len() >= num);
        fs.exp_stack.truncate(fs.exp_stack.len() - num);
        fs.free_reg = match fs.exp_stack.last() {
            Some(top) => top.reg_after,
            None => fs.scopes.last().map_or(0, |s| s.first_free_reg),
        };
    }

    pub fn dup(&mut self) {
        let top = self.get_exp(1);
        let fs = self.f();
        fs.exp_stack.push(top);
    }

    fn pack_reg_or_const(e: Exp) -> usize {
        if e.ty == ExpType::Local {
            e.index
        } else {
            e.index + MAX_REGISTER + 1
        }
    }

    fn unpack_reg_or_const(idx: usize) -> Exp {
        if idx > MAX_REGISTER {
            Exp::new(ExpType::Const, idx - MAX_REGISTER - 1)
        } else {
            Exp::new(ExpType::Local, idx)
        }
    }

    // === Constants ===

    pub fn add_const(&mut self, loc: CompileLoc, v: Value) -> BResult<usize> {
        if let Some(&i) = self.fr().const_map.get(&v) {
            // Exact-kind match only: 1 and 1.0 are distinct constants even
            // though they compare numerically equal.
            if self.fr().constants[i].exact_eq(v) {
                return Ok(i);
            }
        }
        let fs = self.f();
        let i = fs.constants.len();
        fs.constants.push(v);
        fs.const_map.entry(v).or_insert(i);
        if i > MAX_CONSTANT {
            return Err(self.err(loc, "Too many constants"));
        }
        Ok(i)
    }

    fn push_const_idx(&mut self, index: usize) {
        self.push_exp(ExpType::Const, index);
    }

    pub fn push_null(&mut self, loc: CompileLoc) -> BResult<()> {
        let i = self.add_const(loc, Value::Null)?;
        self.push_const_idx(i);
        Ok(())
    }

    pub fn push_bool(&mut self, loc: CompileLoc, v: bool) -> BResult<()> {
        let i = self.add_const(loc, Value::Bool(v))?;
        self.push_const_idx(i);
        Ok(())
    }

    pub fn push_int(&mut self, loc: CompileLoc, v: i64) -> BResult<()> {
        let i = self.add_const(loc, Value::Int(v))?;
        self.push_const_idx(i);
        Ok(())
    }

    pub fn push_float(&mut self, loc: CompileLoc, v: f64) -> BResult<()> {
        let i = self.add_const(loc, Value::Float(v))?;
        self.push_const_idx(i);
        Ok(())
    }

    pub fn push_string(&mut self, loc: CompileLoc, v: StringId) -> BResult<()> {
        let i = self.add_const(loc, Value::Str(v))?;
        self.push_const_idx(i);
        Ok(())
    }

    pub fn push_new_global(&mut self, loc: CompileLoc, name: StringId) -> BResult<()> {
        let i = self.add_const(loc, Value::Str(name))?;
        self.push_exp(ExpType::NewGlobal, i);
        Ok(())
    }

    pub fn push_this(&mut self) {
        self.push_exp(ExpType::Local, 0);
    }

    // === Variable resolution ===

    fn add_upval(&mut self, func_idx: usize, name: StringId, e: &mut Exp) -> BResult<()> {
        let fs = &self.funcs[func_idx];
        for (i, uv) in fs.upvals.iter().enumerate() {
            if uv.name == name
                && ((uv.is_upval && e.ty == ExpType::Upval) || (!uv.is_upval && e.ty == ExpType::Local))
            {
                e.index = i;
                e.ty = ExpType::Upval;
                return Ok(());
            }
        }

        let is_upval = e.ty == ExpType::Upval;
        let index = e.index as u16;
        let fs = &mut self.funcs[func_idx];
        fs.upvals.push(UpvalDesc { is_upval, index, name });
        if fs.upvals.len() > MAX_UPVALUE {
            let loc = fs.loc;
            return Err(self.err(loc, "Too many upvalues"));
        }
        e.index = self.funcs[func_idx].upvals.len() - 1;
        e.ty = ExpType::Upval;
        Ok(())
    }

    /// Resolves `name` starting at function-state `idx`, marking intervening
    /// scopes and adding upvalue table entries as needed.
    fn search_var(&mut self, idx: Option<usize>, name: StringId, e: &mut Exp, is_original: bool) -> BResult<()> {
        let Some(idx) = idx else {
            e.ty = ExpType::Global;
            return Ok(());
        };

        match Self::search_local(&self.funcs[idx], name) {
            None => {
                let parent = idx.checked_sub(1);
                self.search_var(parent, name, e, false)?;
                if e.ty == ExpType::Global {
                    return Ok(());
                }
                self.add_upval(idx, name, e)?;
            }
            Some((_, reg)) => {
                e.index = reg;
                e.ty = ExpType::Local;
                if !is_original {
                    // This local is captured from an inner function; mark the
                    // innermost scope containing its register so scope exit
                    // emits a Close.
                    for sc in self.funcs[idx].scopes.iter_mut().rev() {
                        if sc.reg_start <= reg {
                            sc.has_upval = true;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn push_var(&mut self, loc: CompileLoc, name: StringId) -> BResult<()> {
        let mut e = Exp::new(ExpType::Local, 0);
        let top = self.funcs.len() - 1;
        self.search_var(Some(top), name, &mut e, true)?;
        if e.ty == ExpType::Global {
            e.index = self.add_const(loc, Value::Str(name))?;
        }
        let reg_after = self.fr().free_reg;
        let fs = self.f();
        fs.exp_stack.push(Exp { reg_after, ..e });
        Ok(())
    }

    pub fn push_vararg(&mut self, loc: CompileLoc) -> BResult<()> {
        let reg = self.push_register(loc)?;
        let inst = self.code_rd(loc, Opcode::Vararg, reg);
        self.code_uimm(0);
        self.push_exp(ExpType::Vararg, inst);
        Ok(())
    }

    pub fn push_varg_len(&mut self, loc: CompileLoc) {
        let inst = self.code_rd(loc, Opcode::VargLen, 0);
        self.push_exp(ExpType::NeedsDest, inst);
    }

    pub fn push_table(&mut self, loc: CompileLoc) -> BResult<()> {
        let reg = self.push_register(loc)?;
        self.push_exp(ExpType::Local, reg);
        self.code_rd(loc, Opcode::NewTable, reg);
        Ok(())
    }

    pub fn push_array(&mut self, loc: CompileLoc, length: usize) -> BResult<()> {
        let reg = self.push_register(loc)?;
        self.push_exp(ExpType::Local, reg);
        let size_const = self.add_const(loc, Value::Int(length as i64))?;
        self.code_rd(loc, Opcode::NewArray, reg);
        self.code_uimm(size_const);
        Ok(())
    }

    /// Reserves `num` expression-stack slots for pending declarations. The
    /// registers are not claimed yet: RHS temporaries land on the same
    /// registers, so the final moves usually elide.
    pub fn push_new_locals(&mut self, loc: CompileLoc, num: usize) -> BResult<()> {
        let base = self.fr().free_reg;
        for k in 0..num {
            self.check_reg_ok(loc, base + k)?;
            self.push_exp(ExpType::NewLocal, base + k);
        }
        Ok(())
    }

    // === Pops ===

    /// Pops the top expression, discarding its value; calls and yields are
    /// set to zero results.
    pub fn pop_to_nothing(&mut self) {
        if self.fr().exp_stack.is_empty() {
            return;
        }
        let src = self.get_exp(1);
        if src.ty == ExpType::Call || src.ty == ExpType::Yield {
            self.set_mult_ret_returns(src.index, 1);
        }
        self.pop(1);
    }

    /// Multi-target assignment: stack holds `numLhs` destinations (plus an
    /// optional Conflict marker) then `numRhs` sources, the last of which may
    /// be a multi-return. Pops values into destinations right to left so
    /// side effects occur in source order.
    pub fn assign(&mut self, loc: CompileLoc, num_lhs: usize, num_rhs: usize) -> BResult<()> {
        let conflict = self.prepare_assignment(loc, num_lhs, num_rhs)?;

        // Layout now: [dests(num_lhs)] [Conflict?] [values(num_lhs)].
        let dests_end = self.fr().exp_stack.len() - num_lhs - usize::from(conflict);
        for i in 0..num_lhs {
            let dest = self.fr().exp_stack[dests_end - 1 - i];
            self.pop_move_to(loc, dest)?;
        }

        self.pop(num_lhs + usize::from(conflict));
        Ok(())
    }

    /// Balances an assignment's RHS count to its LHS count, spreading a
    /// trailing multi-return or padding with nulls. Returns whether a
    /// Conflict marker sits between destinations and values.
    fn prepare_assignment(&mut self, loc: CompileLoc, num_lhs: usize, num_rhs: usize) -> BResult<bool> {
        debug_assert!(num_lhs >= num_rhs);

        if num_rhs > 0 && self.get_exp(1).is_mult_ret() {
            self.mult_ret_to_regs((num_lhs - num_rhs + 1) as isize);
            let base = self.get_exp(1).index;
            for i in num_rhs..num_lhs {
                let reg = base + (i - num_rhs) + 1;
                self.check_reg_ok(loc, reg)?;
                self.push_exp(ExpType::Local, reg);
            }
        } else {
            for _ in num_rhs..num_lhs {
                self.push_null(loc)?;
            }
        }

        let fs = self.fr();
        let below = fs.exp_stack.len() - num_lhs;
        let conflict = below > 0 && fs.exp_stack[below - 1].ty == ExpType::Conflict;
        debug_assert!(
            fs.exp_stack[below - usize::from(conflict) - num_lhs..below - usize::from(conflict)]
                .iter()
                .all(Exp::is_dest)
        );
        Ok(conflict)
    }

    /// Detects LHS destination registers read by later LHS expressions and
    /// reroutes them through temporaries, pushing a Conflict marker.
    pub fn resolve_assignment_conflicts(&mut self, loc: CompileLoc, num_vals: usize) -> BResult<()> {
        let mut num_temps = 0usize;
        let sp = self.fr().exp_stack.len();

        for i in (sp - num_vals + 1)..sp {
            let e_i = self.fr().exp_stack[i];
            if e_i.ty != ExpType::Local {
                continue;
            }
            let index = e_i.index;
            let mut reloc: Option<usize> = None;

            for j in (sp - num_vals)..i {
                let e_j = self.fr().exp_stack[j];
                if e_j.index == index || e_j.index2 == index {
                    let reg = match reloc {
                        Some(r) => r,
                        None => {
                            num_temps += 1;
                            let r = self.push_register(loc)?;
                            self.code_move(loc, r, index);
                            reloc = Some(r);
                            r
                        }
                    };
                    let e_j = &mut self.f().exp_stack[j];
                    if e_j.index == index {
                        e_j.index = reg;
                    }
                    if e_j.index2 == index {
                        e_j.index2 = reg;
                    }
                }
            }
        }

        if num_temps > 0 {
            self.push_exp(ExpType::Conflict, 0);
        }
        Ok(())
    }

    // === Conversions ===

    /// Forces the top expression into `Local` or `Const` form.
    pub fn to_source(&mut self, loc: CompileLoc) -> BResult<()> {
        let e = self.get_exp(1);
        if e.is_source() {
            return Ok(());
        }
        self.pop(1);
        match e.ty {
            ExpType::NewLocal => {
                debug_assert_eq!(self.fr().free_reg, e.index);
                self.push_register(loc)?;
                self.push_exp(ExpType::Local, e.index);
            }
            _ => {
                let reg = self.push_register(loc)?;
                self.move_to_reg(loc, reg, e);
                self.push_exp(ExpType::Local, reg);
            }
        }
        Ok(())
    }

    /// Forces the top expression into a register at the top of the register
    /// stack (a temporary). Self-moves elide, so re-temporarying a value
    /// already on top costs nothing.
    pub fn to_temporary(&mut self, loc: CompileLoc) -> BResult<()> {
        self.to_source(loc)?;
        let e = self.get_exp(1);
        if e.ty == ExpType::Const || e.index != self.fr().free_reg {
            self.pop(1);
            let reg = self.push_register(loc)?;
            self.move_to_reg(loc, reg, e);
            self.push_exp(ExpType::Local, reg);
        }
        Ok(())
    }

    // === Composite operand constructors ===

    pub fn field(&mut self) {
        let op = self.get_exp(2);
        let name = self.get_exp(1);
        self.pop(2);
        self.f().free_reg = name.reg_after;
        self.push_exp2(ExpType::Field, Self::pack_reg_or_const(op), Self::pack_reg_or_const(name));
    }

    pub fn index(&mut self) {
        let op = self.get_exp(2);
        let idx = self.get_exp(1);
        self.pop(2);
        self.f().free_reg = idx.reg_after;
        self.push_exp2(ExpType::Index, Self::pack_reg_or_const(op), Self::pack_reg_or_const(idx));
    }

    pub fn varg_index(&mut self) {
        let idx = self.get_exp(1);
        self.pop(1);
        self.f().free_reg = idx.reg_after;
        self.push_exp(ExpType::VargIndex, Self::pack_reg_or_const(idx));
    }

    pub fn varg_slice(&mut self, loc: CompileLoc) {
        let lo = self.get_exp(2);
        let hi = self.get_exp(1);
        self.pop(2);
        self.f().free_reg = hi.reg_after;
        let inst = self.code_rd(loc, Opcode::VargSlice, lo.index);
        self.code_uimm(0);
        self.push_exp(ExpType::VargSlice, inst);
    }

    pub fn length(&mut self) {
        let op = self.get_exp(1);
        self.pop(1);
        self.f().free_reg = op.reg_after;
        self.push_exp(ExpType::Length, Self::pack_reg_or_const(op));
    }

    pub fn slice(&mut self) {
        let base = self.get_exp(3);
        let hi = self.get_exp(1);
        self.pop(3);
        self.f().free_reg = hi.reg_after;
        self.push_exp(ExpType::Slice, base.index);
    }

    // === Operators ===

    pub fn bin_op(&mut self, loc: CompileLoc, op: Opcode) {
        let op1 = self.get_exp(2);
        let op2 = self.get_exp(1);
        let inst = self.code_rd(loc, op, 0);
        self.code_rc(op1);
        self.code_rc(op2);
        self.pop(2);
        self.push_exp(ExpType::NeedsDest, inst);
    }

    pub fn un_op(&mut self, loc: CompileLoc, op: Opcode) {
        let src = self.get_exp(1);
        let inst = self.code_rd(loc, op, 0);
        self.code_rc(src);
        self.pop(1);
        self.push_exp(ExpType::NeedsDest, inst);
    }

    pub fn concat(&mut self, loc: CompileLoc, num_ops: usize) {
        debug_assert!(num_ops >= 2);
        let first = self.get_exp(num_ops);
        let inst = self.code_rd(loc, Opcode::Cat, 0);
        self.code_uimm(first.index);
        self.code_uimm(num_ops);
        self.pop(num_ops);
        self.push_exp(ExpType::NeedsDest, inst);
    }

    /// `lhs <op>= src`: lhs is a register holding the current value, src a
    /// source; the result stays in the register.
    pub fn reflex_op(&mut self, loc: CompileLoc, op: Opcode) {
        let lhs = self.get_exp(2);
        let src = self.get_exp(1);
        self.code_rd(loc, op, lhs.index);
        self.code_rc(src);
        self.pop(1);
    }

    pub fn concat_eq(&mut self, loc: CompileLoc, operands: usize) {
        debug_assert!(operands >= 1);
        let lhs = self.get_exp(operands + 1);
        let first = self.get_exp(operands);
        self.code_rd(loc, Opcode::CatEq, lhs.index);
        self.code_uimm(first.index);
        self.code_uimm(operands);
        self.pop(operands);
    }

    pub fn inc_dec(&mut self, loc: CompileLoc, inc: bool) {
        let op = self.get_exp(1);
        self.code_rd(loc, if inc { Opcode::Inc } else { Opcode::Dec }, op.index);
    }

    // === Condition codes ===

    /// Emits `IsTrue src` + pending jump; returns the jump's instruction index.
    pub fn code_is_true(&mut self, loc: CompileLoc, is_true: bool) -> usize {
        let src = self.get_exp(1);
        let inst = self.code_rd(loc, Opcode::IsTrue, usize::from(is_true));
        self.code_rc(src);
        self.code_imm(NO_JUMP);
        self.pop(1);
        inst
    }

    pub fn code_cmp(&mut self, loc: CompileLoc, comparison: Comparison) -> usize {
        self.common_cmp_jump(loc, Opcode::Cmp, comparison as usize)
    }

    pub fn code_switch_cmp(&mut self, loc: CompileLoc) -> usize {
        self.common_cmp_jump(loc, Opcode::SwitchCmp, 0)
    }

    pub fn code_equals(&mut self, loc: CompileLoc, is_true: bool) -> usize {
        self.common_cmp_jump(loc, Opcode::Equals, usize::from(is_true))
    }

    pub fn code_is(&mut self, loc: CompileLoc, is_true: bool) -> usize {
        self.common_cmp_jump(loc, Opcode::Is, usize::from(is_true))
    }

    pub fn code_in(&mut self, loc: CompileLoc, is_true: bool) -> usize {
        self.common_cmp_jump(loc, Opcode::In, usize::from(is_true))
    }

    fn common_cmp_jump(&mut self, loc: CompileLoc, op: Opcode, rd: usize) -> usize {
        let src1 = self.get_exp(2);
        let src2 = self.get_exp(1);
        let inst = self.code_rd(loc, op, rd);
        self.code_rc(src1);
        self.code_rc(src2);
        self.code_imm(NO_JUMP);
        self.pop(2);
        inst
    }

    pub fn code_throw(&mut self, loc: CompileLoc, rethrowing: bool) {
        let src = self.get_exp(1);
        self.code_rd(loc, Opcode::Throw, usize::from(rethrowing));
        self.code_rc(src);
        self.pop(1);
    }

    /// Saves `numRets` pending returns into the thread's result buffer.
    pub fn save_rets(&mut self, loc: CompileLoc, num_rets: usize) -> BResult<()> {
        if num_rets == 0 {
            self.code_rd(loc, Opcode::SaveRets, 0);
            self.code_uimm(1);
            return Ok(());
        }
        let arg = self.prepare_arg_list(loc, num_rets)?;
        let first = self.get_exp(num_rets).index;
        self.code_rd(loc, Opcode::SaveRets, first);
        self.code_uimm(arg);
        self.pop(num_rets);
        Ok(())
    }

    // === Class and namespace construction ===

    pub fn new_class(&mut self, loc: CompileLoc, num_bases: usize) {
        let name = self.get_exp(num_bases + 1);
        let inst = self.code_rd(loc, Opcode::Class, 0);
        self.code_rc(name);
        if num_bases > 0 {
            let first_base = self.get_exp(num_bases);
            self.code_rc(first_base);
        } else {
            self.code_rc(Exp::new(ExpType::Local, 0));
        }
        self.code_uimm(num_bases);
        self.pop(num_bases + 1);
        self.push_exp(ExpType::NeedsDest, inst);
    }

    pub fn new_namespace(&mut self, loc: CompileLoc) {
        let name = self.get_exp(2);
        let base = self.get_exp(1);
        let inst = self.code_rd(loc, Opcode::Namespace, 0);
        self.code_uimm(name.index);
        self.code_rc(base);
        self.pop(2);
        self.push_exp(ExpType::NeedsDest, inst);
    }

    pub fn new_namespace_np(&mut self, loc: CompileLoc) {
        let name = self.get_exp(1);
        let inst = self.code_rd(loc, Opcode::NamespaceNP, 0);
        self.code_uimm(name.index);
        self.pop(1);
        self.push_exp(ExpType::NeedsDest, inst);
    }

    /// Enters a namespace body: the namespace value (a NeedsDest on top of
    /// the stack) is materialized and becomes the closure environment for
    /// functions defined inside.
    pub fn begin_namespace(&mut self, loc: CompileLoc) -> BResult<NamespaceDesc> {
        let prev_reg = self.fr().namespace_reg;
        let reg = self.check_reg_ok(loc, self.fr().free_reg)?;
        self.to_source(loc)?;
        self.f().namespace_reg = Some(reg);
        Ok(NamespaceDesc { prev_reg })
    }

    pub fn end_namespace(&mut self, desc: NamespaceDesc) {
        self.f().namespace_reg = desc.prev_reg;
    }

    pub fn add_class_field(&mut self, loc: CompileLoc, is_override: bool) {
        self.add_member(loc, false, is_override);
    }

    pub fn add_class_method(&mut self, loc: CompileLoc, is_override: bool) {
        self.add_member(loc, true, is_override);
    }

    fn add_member(&mut self, loc: CompileLoc, is_method: bool, is_override: bool) {
        let cls = self.get_exp(3);
        let name = self.get_exp(2);
        let src = self.get_exp(1);
        self.code_rd(loc, Opcode::AddMember, cls.index);
        self.code_rc(name);
        self.code_rc(src);
        self.code_uimm(usize::from(is_method) | (usize::from(is_override) << 1));
        self.pop(3);
    }

    // === Parameter checks ===

    pub fn param_check(&mut self, loc: CompileLoc) {
        self.code_rd(loc, Opcode::CheckParams, 0);
    }

    pub fn check_obj_param(&mut self, loc: CompileLoc, param_idx: usize) -> usize {
        let ty = self.get_exp(1);
        let inst = self.code_rd(loc, Opcode::CheckObjParam, param_idx);
        self.code_rc(ty);
        self.code_imm(NO_JUMP);
        self.pop(1);
        inst
    }

    pub fn obj_param_fail(&mut self, loc: CompileLoc, param_idx: usize) {
        self.code_rd(loc, Opcode::ObjParamFail, param_idx);
    }

    pub fn custom_param_fail(&mut self, loc: CompileLoc, param_idx: usize) {
        let msg = self.get_exp(1);
        self.code_rd(loc, Opcode::CustomParamFail, param_idx);
        self.code_rc(msg);
        self.pop(1);
    }

    pub fn assert_fail(&mut self, loc: CompileLoc) {
        let msg = self.get_exp(1);
        debug_assert!(msg.ty == ExpType::Local);
        self.code_rd(loc, Opcode::AssertFail, msg.index);
        self.pop(1);
    }

    // === Arrays ===

    pub fn array_set(&mut self, loc: CompileLoc, num_items: usize, block: usize) -> BResult<()> {
        let arr = self.get_exp(num_items + 1);
        let arg = self.prepare_arg_list(loc, num_items)?;
        self.code_rd(loc, Opcode::SetArray, arr.index);
        self.code_uimm(arg);
        self.code_uimm(block * ARRAY_SET_FIELDS);
        self.pop(num_items + 1);
        Ok(())
    }

    pub fn array_append(&mut self, loc: CompileLoc) {
        let arr = self.get_exp(2);
        let item = self.get_exp(1);
        self.code_rd(loc, Opcode::Append, arr.index);
        self.code_rc(item);
        self.pop(2);
    }

    // === Switches ===

    pub fn begin_switch(&mut self, loc: CompileLoc) {
        let cond = self.get_exp(1);
        let switch_pc = self.code_rd(loc, Opcode::Switch, 0);
        self.code_rc(cond);
        self.pop(1);
        self.f().switch_stack.push(SwitchDesc {
            offsets: AHashMap::new(),
            default_offset: None,
            switch_pc,
        });
    }

    pub fn add_case(&mut self, loc: CompileLoc, value: Value) -> BResult<()> {
        let here = self.here();
        let switch_pc = self.fr().switch_stack.last().expect("no switch in progress").switch_pc;
        let offset = Self::jump_diff_static(&self.fr().code, switch_pc, here);
        let desc = self.f().switch_stack.last_mut().expect("switch");
        if desc.offsets.contains_key(&value) {
            return Err(self.err(loc, "Duplicate case value"));
        }
        desc.offsets.insert(value, offset);
        Ok(())
    }

    pub fn add_default(&mut self) {
        let here = self.here();
        let switch_pc = self.fr().switch_stack.last().expect("no switch in progress").switch_pc;
        let offset = Self::jump_diff_static(&self.fr().code, switch_pc, here);
        let desc = self.f().switch_stack.last_mut().expect("switch");
        debug_assert!(desc.default_offset.is_none());
        desc.default_offset = Some(offset);
    }

    pub fn end_switch(&mut self, loc: CompileLoc) -> BResult<()> {
        let desc = self.f().switch_stack.pop().expect("no switch in progress");

        if !desc.offsets.is_empty() || desc.default_offset.is_none() {
            let fs = self.f();
            fs.switch_tables.push(SwitchTable {
                offsets: desc.offsets,
                default_offset: desc.default_offset,
            });
            let idx = fs.switch_tables.len() - 1;
            if idx > MAX_SWITCH_TABLE {
                return Err(self.err(loc, "Too many switches"));
            }
            self.set_rd(desc.switch_pc, idx);
        } else {
            // Only dynamic cases plus a default: the table is dead weight,
            // the Switch becomes an unconditional Jmp (same length).
            self.set_opcode(desc.switch_pc, Opcode::Jmp);
            self.set_rd(desc.switch_pc, 1);
            self.set_jump_offset(loc, desc.switch_pc, desc.default_offset.expect("default"))?;
        }
        Ok(())
    }

    // === Loops ===

    /// Completes loop entry after the caller has pushed three new locals and
    /// assigned the loop expressions into them: claims the hidden locals and
    /// emits the `For`/`Foreach` entry instruction.
    pub fn finish_begin_for(&mut self, loc: CompileLoc, op: Opcode) -> BResult<ForDesc> {
        let base_reg = self.fr().free_reg;
        self.insert_dummy_local(loc, "hidden")?;
        self.insert_dummy_local(loc, "hidden")?;
        self.insert_dummy_local(loc, "hidden")?;
        self.activate_locals(3);

        let begin_jump = self.code_rd(loc, op, base_reg);
        self.code_imm(NO_JUMP);
        let begin_loop = self.here();
        Ok(ForDesc {
            base_reg,
            begin_jump,
            begin_loop,
        })
    }

    pub fn end_for(&mut self, loc: CompileLoc, desc: ForDesc) -> BResult<()> {
        self.end_for_impl(loc, desc, Opcode::ForLoop, 0)
    }

    pub fn end_foreach(&mut self, loc: CompileLoc, desc: ForDesc, ind_length: usize) -> BResult<()> {
        self.end_for_impl(loc, desc, Opcode::ForeachLoop, ind_length)
    }

    fn end_for_impl(&mut self, loc: CompileLoc, desc: ForDesc, op: Opcode, ind_length: usize) -> BResult<()> {
        self.close_scope_upvals(loc);
        self.patch_continues_to_here(loc)?;
        self.patch_jump_to_here(loc, desc.begin_jump)?;

        let j = self.code_rd(loc, op, desc.base_reg);
        if op == Opcode::ForeachLoop {
            self.code_uimm(ind_length);
        }
        self.code_imm(NO_JUMP);

        self.patch_jump_to(loc, j, desc.begin_loop)?;
        self.patch_breaks_to_here(loc)?;
        Ok(())
    }

    // === Calls ===

    pub fn begin_method_call(&mut self) -> MethodCallDesc {
        MethodCallDesc {
            base_reg: self.fr().free_reg,
            base_exp: self.fr().exp_stack.len(),
        }
    }

    /// Pads claimed registers so the method-call frame stays contiguous even
    /// when operands resolved to existing locals or constants.
    pub fn update_method_call(&mut self, loc: CompileLoc, desc: MethodCallDesc, num: usize) -> BResult<()> {
        while self.fr().free_reg < desc.base_reg + num {
            self.push_register(loc)?;
        }
        let free = self.fr().free_reg;
        let fs = self.f();
        if let Some(top) = fs.exp_stack.get_mut(desc.base_exp + num - 1) {
            if top.reg_after < free {
                top.reg_after = free;
            }
        }
        Ok(())
    }

    pub fn push_method_call(&mut self, loc: CompileLoc, desc: MethodCallDesc) -> BResult<()> {
        let stack_len = self.fr().exp_stack.len();
        let obj = self.fr().exp_stack[desc.base_exp];
        let name = self.fr().exp_stack[desc.base_exp + 1];
        let num_args = stack_len - desc.base_exp - 2;
        let arg = self.prepare_arg_list_at(loc, num_args)?;
        let arg = if arg == 0 { 0 } else { arg + 1 };

        self.pop(num_args + 2);
        debug_assert_eq!(self.fr().free_reg, desc.base_reg);

        let inst = self.code_rd(loc, Opcode::Method, desc.base_reg);
        self.code_rc(obj);
        self.code_rc(name);
        self.code_uimm(arg);
        self.code_uimm(0);
        self.push_exp(ExpType::Call, inst);
        Ok(())
    }

    pub fn push_call(&mut self, loc: CompileLoc, num_args: usize) -> BResult<()> {
        let func = self.get_exp(num_args + 2);
        let arg = self.prepare_arg_list_at(loc, num_args)?;
        let arg = if arg == 0 { 0 } else { arg + 1 };
        self.pop(num_args + 2);

        let inst = self.code_rd(loc, Opcode::Call, func.index);
        self.code_uimm(arg);
        self.code_uimm(0);
        self.push_exp(ExpType::Call, inst);
        Ok(())
    }

    pub fn push_yield(&mut self, loc: CompileLoc, num_args: usize) -> BResult<()> {
        let inst;
        if num_args == 0 {
            inst = self.code_rd(loc, Opcode::Yield, 0);
            self.code_uimm(1);
            self.code_uimm(0);
        } else {
            let arg = self.prepare_arg_list(loc, num_args)?;
            let base = self.get_exp(num_args).index;
            self.pop(num_args);
            inst = self.code_rd(loc, Opcode::Yield, base);
            self.code_uimm(arg);
            self.code_uimm(0);
        }
        self.push_exp(ExpType::Yield, inst);
        Ok(())
    }

    /// Rewrites the call on top of the stack into its tail-call form.
    pub fn make_tailcall(&mut self) {
        let e = self.get_exp(1);
        debug_assert_eq!(e.ty, ExpType::Call);
        match self.get_opcode(e.index) {
            Opcode::Call => self.set_opcode(e.index, Opcode::TailCall),
            Opcode::Method => self.set_opcode(e.index, Opcode::TailMethod),
            _ => unreachable!("tailcall of a non-call"),
        }
    }

    /// Normalizes an argument run: all but the last must already be
    /// temporaries; a trailing multi-return spreads. Returns the encoded
    /// count (`0` = multi, else n+1).
    fn prepare_arg_list(&mut self, _loc: CompileLoc, items: usize) -> BResult<usize> {
        if items == 0 {
            return Ok(1);
        }
        if self.get_exp(1).is_mult_ret() {
            self.mult_ret_to_regs(-1);
            Ok(0)
        } else {
            Ok(items + 1)
        }
    }

    fn prepare_arg_list_at(&mut self, loc: CompileLoc, items: usize) -> BResult<usize> {
        self.prepare_arg_list(loc, items)
    }

    /// Fixes the result count of the multi-return on top of the stack and
    /// demotes it to a temporary at its destination register.
    fn mult_ret_to_regs(&mut self, num: isize) {
        let e = self.get_exp(1);
        self.set_mult_ret_returns(e.index, (num + 1) as usize);
        let rd = self.get_rd(e.index);
        let top = self.f().exp_stack.last_mut().expect("exp");
        top.ty = ExpType::Local;
        top.index = rd;
    }

    fn set_mult_ret_returns(&mut self, inst: usize, num: usize) {
        match self.get_opcode(inst) {
            Opcode::Vararg | Opcode::VargSlice => self.set_uimm(inst + 1, num),
            Opcode::Call | Opcode::Yield => self.set_uimm(inst + 2, num),
            Opcode::Method => self.set_uimm(inst + 4, num),
            Opcode::TailCall | Opcode::TailMethod => {}
            _ => unreachable!("not a multi-return instruction"),
        }
    }

    // === Assignment plumbing ===

    /// Pops the value on top of the stack into `dest`.
    fn pop_move_to(&mut self, loc: CompileLoc, dest: Exp) -> BResult<()> {
        if dest.ty == ExpType::Local || dest.ty == ExpType::NewLocal {
            let src = self.get_exp(1);
            self.move_to_reg(loc, dest.index, src);
        } else {
            self.to_source(loc)?;
            let src = self.get_exp(1);
            match dest.ty {
                ExpType::Upval => {
                    self.code_rd_exp(loc, Opcode::SetUpval, src)?;
                    self.code_uimm(dest.index);
                }
                ExpType::Global => {
                    self.code_rd_exp(loc, Opcode::SetGlobal, src)?;
                    self.code_uimm(dest.index);
                }
                ExpType::NewGlobal => {
                    self.code_rd_exp(loc, Opcode::NewGlobal, src)?;
                    self.code_uimm(dest.index);
                }
                ExpType::Slice => {
                    self.code_rd(loc, Opcode::SliceAssign, dest.index);
                    self.code_rc(src);
                }
                ExpType::Index => {
                    let d1 = Self::unpack_reg_or_const(dest.index);
                    let d2 = Self::unpack_reg_or_const(dest.index2);
                    self.code_rd_exp(loc, Opcode::IndexAssign, d1)?;
                    self.code_rc(d2);
                    self.code_rc(src);
                }
                ExpType::Field => {
                    let d1 = Self::unpack_reg_or_const(dest.index);
                    let d2 = Self::unpack_reg_or_const(dest.index2);
                    self.code_rd_exp(loc, Opcode::FieldAssign, d1)?;
                    self.code_rc(d2);
                    self.code_rc(src);
                }
                ExpType::VargIndex => {
                    self.code_rd(loc, Opcode::VargIndexAssign, 0);
                    let d = Self::unpack_reg_or_const(dest.index);
                    self.code_rc(d);
                    self.code_rc(src);
                }
                ExpType::Length => {
                    let d = Self::unpack_reg_or_const(dest.index);
                    self.code_rd_exp(loc, Opcode::LengthAssign, d)?;
                    self.code_rc(src);
                }
                _ => unreachable!("not an assignment destination"),
            }
        }
        self.pop(1);
        Ok(())
    }

    /// Emits whatever instruction realizes `src` into register `reg`.
    fn move_to_reg(&mut self, loc: CompileLoc, reg: usize, src: Exp) {
        match src.ty {
            ExpType::Const => {
                self.code_rd(loc, Opcode::Move, reg);
                self.code_rc(src);
            }
            ExpType::Local | ExpType::NewLocal => self.code_move(loc, reg, src.index),
            ExpType::Upval => {
                self.code_rd(loc, Opcode::GetUpval, reg);
                self.code_uimm(src.index);
            }
            ExpType::Global => {
                self.code_rd(loc, Opcode::GetGlobal, reg);
                self.code_uimm(src.index);
            }
            ExpType::Index => {
                self.code_rd(loc, Opcode::Index, reg);
                self.code_rc(Self::unpack_reg_or_const(src.index));
                self.code_rc(Self::unpack_reg_or_const(src.index2));
            }
            ExpType::Field => {
                self.code_rd(loc, Opcode::Field, reg);
                self.code_rc(Self::unpack_reg_or_const(src.index));
                self.code_rc(Self::unpack_reg_or_const(src.index2));
            }
            ExpType::Slice => {
                self.code_rd(loc, Opcode::Slice, reg);
                self.code_uimm(src.index);
            }
            ExpType::Vararg => {
                self.set_rd(src.index, reg);
                self.set_mult_ret_returns(src.index, 2);
            }
            ExpType::VargIndex => {
                self.code_rd(loc, Opcode::VargIndex, reg);
                self.code_rc(Self::unpack_reg_or_const(src.index));
            }
            ExpType::Length => {
                self.code_rd(loc, Opcode::Length, reg);
                self.code_rc(Self::unpack_reg_or_const(src.index));
            }
            ExpType::VargSlice | ExpType::Call | ExpType::Yield => {
                self.set_mult_ret_returns(src.index, 2);
                let rd = self.get_rd(src.index);
                self.code_move(loc, reg, rd);
            }
            ExpType::NeedsDest => self.set_rd(src.index, reg),
            ExpType::Conflict | ExpType::NewGlobal => unreachable!("not a source"),
        }
    }

    fn code_move(&mut self, loc: CompileLoc, dest: usize, src: usize) {
        if dest != src {
            self.code_rd(loc, Opcode::Move, dest);
            self.code_rc(Exp::new(ExpType::Local, src));
        }
    }

    // === Control flow ===

    pub fn here(&self) -> usize {
        self.fr().code.len()
    }

    pub fn patch_jump_to_here(&mut self, loc: CompileLoc, src: usize) -> BResult<()> {
        let here = self.here();
        self.patch_jump_to(loc, src, here)
    }

    pub fn patch_continues_to(&mut self, loc: CompileLoc, dest: usize) -> BResult<()> {
        let idx = self.fr().scopes.len() - 1;
        let list = self.fr().scopes[idx].continues;
        self.patch_list_to(loc, list, dest)?;
        self.f().scopes[idx].continues = NO_JUMP;
        Ok(())
    }

    pub fn patch_continues_to_here(&mut self, loc: CompileLoc) -> BResult<()> {
        let here = self.here();
        self.patch_continues_to(loc, here)
    }

    pub fn patch_breaks_to_here(&mut self, loc: CompileLoc) -> BResult<()> {
        let idx = self.fr().scopes.len() - 1;
        let list = self.fr().scopes[idx].breaks;
        let here = self.here();
        self.patch_list_to(loc, list, here)?;
        self.f().scopes[idx].breaks = NO_JUMP;
        Ok(())
    }

    pub fn patch_true_to_here(&mut self, loc: CompileLoc, i: &mut InstRef) -> BResult<()> {
        let here = self.here();
        self.patch_list_to(loc, i.true_list, here)?;
        i.true_list = NO_JUMP;
        Ok(())
    }

    pub fn patch_false_to_here(&mut self, loc: CompileLoc, i: &mut InstRef) -> BResult<()> {
        let here = self.here();
        self.patch_list_to(loc, i.false_list, here)?;
        i.false_list = NO_JUMP;
        Ok(())
    }

    /// Appends jump `j` to the ref's true list.
    pub fn cat_to_true(&mut self, i: &mut InstRef, j: usize) {
        if i.true_list == NO_JUMP {
            i.true_list = j as i32;
        } else {
            let mut idx = i.true_list as usize;
            loop {
                let next = self.get_jump_offset(idx);
                if next == NO_JUMP {
                    break;
                }
                idx = next as usize;
            }
            self.set_jump_raw(idx, j as i32);
        }
    }

    pub fn cat_to_false(&mut self, i: &mut InstRef, j: usize) {
        if i.false_list == NO_JUMP {
            i.false_list = j as i32;
        } else {
            let mut idx = i.false_list as usize;
            loop {
                let next = self.get_jump_offset(idx);
                if next == NO_JUMP {
                    break;
                }
                idx = next as usize;
            }
            self.set_jump_raw(idx, j as i32);
        }
    }

    /// Swaps a condition's true and false lists, flipping the head jump's
    /// sense (and comparison code, for `Cmp`).
    pub fn invert_jump(&mut self, i: &mut InstRef) {
        let j = i.true_list;
        debug_assert!(j != NO_JUMP);
        let j = j as usize;
        i.true_list = self.get_jump_offset(j);
        self.set_jump_raw(j, i.false_list);
        i.false_list = j as i32;

        if self.get_opcode(j) == Opcode::Cmp {
            let code = Comparison::from_repr(self.get_rd(j) as u16).expect("comparison code");
            self.set_rd(j, code.inverted() as usize);
        } else {
            let rd = self.get_rd(j);
            self.set_rd(j, usize::from(rd == 0));
        }
    }

    pub fn jump_to(&mut self, loc: CompileLoc, dest: usize) -> BResult<()> {
        let j = self.code_rd(loc, Opcode::Jmp, 1);
        self.code_imm(NO_JUMP);
        self.patch_jump_to(loc, j, dest)
    }

    pub fn make_jump(&mut self, loc: CompileLoc) -> usize {
        let j = self.code_rd(loc, Opcode::Jmp, 1);
        self.code_imm(NO_JUMP);
        j
    }

    // === Exception handlers ===

    pub fn code_catch(&mut self, loc: CompileLoc) -> BResult<usize> {
        self.push_scope();
        let idx = self.fr().scopes.len() - 1;
        self.f().scopes[idx].eh_level += 1;
        self.f().try_catch_depth += 1;
        let slot = self.check_reg_ok(loc, self.fr().free_reg)?;
        let inst = self.code_rd(loc, Opcode::PushCatch, slot);
        self.code_imm(NO_JUMP);
        Ok(inst)
    }

    pub fn pop_catch(&mut self, loc: CompileLoc, catch_loc: CompileLoc, catch_begin: usize) -> BResult<usize> {
        self.code_rd(loc, Opcode::PopEH, 0);
        let jump_over = self.make_jump(loc);
        self.patch_jump_to_here(loc, catch_begin)?;
        self.pop_scope(catch_loc);
        self.f().try_catch_depth -= 1;
        Ok(jump_over)
    }

    pub fn code_finally(&mut self, loc: CompileLoc) -> BResult<usize> {
        self.push_scope();
        let idx = self.fr().scopes.len() - 1;
        self.f().scopes[idx].eh_level += 1;
        self.f().try_catch_depth += 1;
        let slot = self.check_reg_ok(loc, self.fr().free_reg)?;
        let inst = self.code_rd(loc, Opcode::PushFinally, slot);
        self.code_imm(NO_JUMP);
        Ok(inst)
    }

    pub fn pop_finally(&mut self, loc: CompileLoc, finally_loc: CompileLoc, finally_begin: usize) -> BResult<()> {
        self.code_rd(loc, Opcode::PopEH, 0);
        self.patch_jump_to_here(loc, finally_begin)?;
        self.pop_scope(finally_loc);
        self.f().try_catch_depth -= 1;
        Ok(())
    }

    pub fn in_try_catch(&self) -> bool {
        self.fr().try_catch_depth > 0
    }

    pub fn code_continue(&mut self, loc: CompileLoc, name: Option<StringId>) -> BResult<()> {
        let (target, any_upvals) = self.find_jump_scope(loc, name, false)?;
        self.emit_loop_escape(loc, target, any_upvals, false)
    }

    pub fn code_break(&mut self, loc: CompileLoc, name: Option<StringId>) -> BResult<()> {
        let (target, any_upvals) = self.find_jump_scope(loc, name, true)?;
        self.emit_loop_escape(loc, target, any_upvals, true)
    }

    fn find_jump_scope(&self, loc: CompileLoc, name: Option<StringId>, is_break: bool) -> BResult<(usize, bool)> {
        let what = if is_break { "breakable" } else { "continuable" };
        let fs = self.fr();
        match name {
            None => {
                let cur = fs.scopes.last().expect("scope");
                let target = if is_break { cur.break_scope } else { cur.continue_scope };
                let Some(target) = target else {
                    return Err(self.err(loc, format!("No {what} control structure")));
                };
                Ok((target, fs.scopes[target].has_upval))
            }
            Some(name) => {
                let mut any_upvals = false;
                for (i, sc) in fs.scopes.iter().enumerate().rev() {
                    any_upvals |= sc.has_upval;
                    if sc.name == Some(name) {
                        let self_ref = if is_break { sc.break_scope } else { sc.continue_scope };
                        if self_ref != Some(i) {
                            return Err(self.err(loc, format!("Cannot {} control structure of that name", if is_break { "break" } else { "continue" })));
                        }
                        return Ok((i, any_upvals));
                    }
                }
                Err(self.err(loc, format!("No {what} control structure of that name")))
            }
        }
    }

    fn emit_loop_escape(&mut self, loc: CompileLoc, target: usize, any_upvals: bool, is_break: bool) -> BResult<()> {
        if any_upvals {
            let reg = self.fr().scopes[target].reg_start;
            self.code_rd(loc, Opcode::Close, reg);
        }

        let cur_eh = self.fr().scopes.last().expect("scope").eh_level;
        let target_eh = self.fr().scopes[target].eh_level;
        if cur_eh > target_eh {
            self.code_rd(loc, Opcode::Unwind, cur_eh - target_eh);
        }

        // Thread this jump onto the target scope's pending list.
        let prev = if is_break {
            self.fr().scopes[target].breaks
        } else {
            self.fr().scopes[target].continues
        };
        let j = self.code_rd(loc, Opcode::Jmp, 1);
        self.code_imm(prev);
        if is_break {
            self.f().scopes[target].breaks = j as i32;
        } else {
            self.f().scopes[target].continues = j as i32;
        }
        Ok(())
    }

    pub fn default_return(&mut self, loc: CompileLoc) -> BResult<()> {
        self.save_rets(loc, 0)?;
        self.code_ret(loc);
        Ok(())
    }

    pub fn code_ret(&mut self, loc: CompileLoc) {
        self.code_rd(loc, Opcode::Ret, 0);
    }

    pub fn code_unwind(&mut self, loc: CompileLoc) {
        let depth = self.fr().try_catch_depth;
        self.code_rd(loc, Opcode::Unwind, depth);
    }

    pub fn code_end_final(&mut self, loc: CompileLoc) {
        self.code_rd(loc, Opcode::EndFinal, 0);
    }

    // === Raw emission ===

    fn code_rd(&mut self, loc: CompileLoc, op: Opcode, rd: usize) -> usize {
        let word = instr::pack(op, rd);
        self.add_inst(loc.line, word)
    }

    /// RD variant accepting a source expression; constants are moved into a
    /// scratch register first since RD must name a register.
    fn code_rd_exp(&mut self, loc: CompileLoc, op: Opcode, dest: Exp) -> BResult<usize> {
        if dest.ty == ExpType::Const {
            let reg = self.check_reg_ok(loc, self.fr().free_reg)?;
            self.code_rd(loc, Opcode::Move, reg);
            self.code_uimm(dest.index | CONST_BIT as usize);
            return Ok(self.code_rd(loc, op, reg));
        }
        Ok(self.code_rd(loc, op, dest.index))
    }

    fn code_imm(&mut self, imm: i32) {
        debug_assert!(imm == NO_JUMP || (MAX_JUMP_BACKWARD..=MAX_JUMP_FORWARD).contains(&imm));
        self.add_inst_cont(imm as i16 as u16);
    }

    fn code_uimm(&mut self, uimm: usize) {
        debug_assert!(uimm <= u16::MAX as usize);
        self.add_inst_cont(uimm as u16);
    }

    fn code_rc(&mut self, src: Exp) {
        debug_assert!(src.is_source());
        let word = if src.ty == ExpType::Local {
            debug_assert!(src.index <= MAX_REGISTER);
            src.index as u16
        } else {
            debug_assert!(src.index <= MAX_CONSTANT);
            src.index as u16 | CONST_BIT
        };
        self.add_inst_cont(word);
    }

    fn add_inst(&mut self, line: u32, word: u16) -> usize {
        let fs = self.f();
        fs.line_info.push(line);
        fs.code.push(word);
        fs.code.len() - 1
    }

    fn add_inst_cont(&mut self, word: u16) {
        let line = *self.fr().line_info.last().expect("operand follows an opcode word");
        self.add_inst(line, word);
    }

    fn set_opcode(&mut self, index: usize, op: Opcode) {
        let rd = instr::rd_of(self.fr().code[index]);
        self.f().code[index] = instr::pack(op, rd);
    }

    fn set_rd(&mut self, index: usize, rd: usize) {
        let op = instr::opcode_of(self.fr().code[index]);
        self.f().code[index] = instr::pack(op, rd);
    }

    fn set_imm(&mut self, index: usize, val: i32) {
        self.f().code[index] = val as i16 as u16;
    }

    fn set_uimm(&mut self, index: usize, val: usize) {
        self.f().code[index] = val as u16;
    }

    fn get_opcode(&self, index: usize) -> Opcode {
        instr::opcode_of(self.fr().code[index])
    }

    fn get_rd(&self, index: usize) -> usize {
        instr::rd_of(self.fr().code[index])
    }

    fn get_imm(&self, index: usize) -> i32 {
        i32::from(self.fr().code[index] as i16)
    }

    // === Jump offsets ===

    fn jump_operand_index(&self, i: usize) -> usize {
        let off = self.get_opcode(i).jump_word_offset().expect("jump-carrying opcode");
        i + off
    }

    fn set_jump_offset(&mut self, loc: CompileLoc, i: usize, offs: i32) -> BResult<()> {
        if offs != NO_JUMP && !(MAX_JUMP_BACKWARD..=MAX_JUMP_FORWARD).contains(&offs) {
            return Err(self.err(loc, "Code is too big to perform jump, consider splitting function"));
        }
        let idx = self.jump_operand_index(i);
        self.set_imm(idx, offs);
        Ok(())
    }

    /// Raw list-link write: list links store instruction indices, which are
    /// patched into real offsets when the list resolves.
    fn set_jump_raw(&mut self, i: usize, val: i32) {
        let idx = self.jump_operand_index(i);
        self.set_imm(idx, val);
    }

    fn get_jump_offset(&self, i: usize) -> i32 {
        self.get_imm(self.jump_operand_index(i))
    }

    /// Offset from the word after instruction `src`'s jump operand to `dest`.
    fn jump_diff(&self, src: usize, dest: usize) -> i32 {
        Self::jump_diff_static_op(self.get_opcode(src), src, dest)
    }

    fn jump_diff_static(code: &[u16], src: usize, dest: usize) -> i32 {
        Self::jump_diff_static_op(instr::opcode_of(code[src]), src, dest)
    }

    fn jump_diff_static_op(op: Opcode, src: usize, dest: usize) -> i32 {
        let operand = src + op.jump_word_offset().expect("jump-carrying opcode");
        dest as i32 - (operand as i32 + 1)
    }

    fn patch_jump_to(&mut self, loc: CompileLoc, src: usize, dest: usize) -> BResult<()> {
        let offs = self.jump_diff(src, dest);
        self.set_jump_offset(loc, src, offs)
    }

    fn patch_list_to(&mut self, loc: CompileLoc, mut j: i32, dest: usize) -> BResult<()> {
        while j != NO_JUMP {
            let next = self.get_jump_offset(j as usize);
            self.patch_jump_to(loc, j as usize, dest)?;
            j = next;
        }
        Ok(())
    }
}
