//! The bytecode interpreter: a register machine over the unified
//! activation-record / exception-handler stack.
//!
//! The interpreter owns the *detached* current thread: exactly one thread is
//! ever out of the heap, and resume/yield swap which one. Between any two
//! instructions it checks the pending-halt flag and the debug-hook counters.
//! Dispatch is one large match over the opcode of the packed instruction
//! word; operands are fetched word by word.

pub(crate) mod calls;
pub(crate) mod coroutine;
pub(crate) mod debug;
pub(crate) mod eh;
pub(crate) mod meta;
pub(crate) mod ops;

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    bytecode::{
        FuncDefData,
        instr::{self, CONST_BIT},
        op::{Comparison, Opcode},
    },
    errors::{CrocError, ExcKind, VmResult},
    heap::{HeapData, HeapId},
    run::Vm,
    types::{CrocThread, Upval},
    value::{CrocType, Value},
};

pub(crate) struct Interp<'vm> {
    pub vm: &'vm mut Vm,
    /// The detached running thread.
    pub t: Box<CrocThread>,
    pub t_id: HeapId,
    /// Result count of the last completed host-boundary call.
    pub last_results: usize,
}

impl<'vm> Interp<'vm> {
    /// Runs the callable at `slot` (with `this` at `slot + 1` and arguments
    /// after) to completion and returns the number of results copied back to
    /// `slot`.
    pub fn host_call(&mut self, slot: usize, expected: isize) -> VmResult<usize> {
        let num_params = (self.t.stack_index - (slot + 1)) as isize;
        let entry_thread = self.t_id;
        let entry_depth = self.t.frames.len();

        let pushed = self.call_prologue(slot, expected, num_params, true)?;
        if pushed {
            self.execute(entry_thread, entry_depth)?;
        }
        Ok(self.last_results)
    }

    /// Re-entrant call used by metamethods, the module loader, debug hooks,
    /// and class constructors. Yields across this boundary are errors.
    pub fn call_sync(&mut self, func: Value, this: Value, args: &[Value], expected: isize) -> VmResult<Vec<Value>> {
        let slot = self.t.stack_index;
        self.t.ensure_stack(slot + 2 + args.len());
        self.t.stack[slot] = func;
        self.t.stack[slot + 1] = this;
        for (i, &a) in args.iter().enumerate() {
            self.t.stack[slot + 2 + i] = a;
        }
        self.t.stack_index = slot + 2 + args.len();

        self.t.native_call_depth += 1;
        let result = self.host_call(slot, expected);
        self.t.native_call_depth -= 1;

        let out = match result {
            Ok(n) => Ok(self.t.stack[slot..slot + n].to_vec()),
            Err(e) => Err(e),
        };
        self.t.stack_index = slot;
        out
    }

    /// The dispatch loop. Runs until the entry frame on the entry thread
    /// pops, switching threads on resume/yield along the way.
    fn execute(&mut self, entry_thread: HeapId, entry_depth: usize) -> VmResult<()> {
        'reenter: loop {
            if self.t_id == entry_thread && self.t.frames.len() <= entry_depth {
                return Ok(());
            }

            let frame = self.t.current_frame();
            let def: Rc<FuncDefData> = frame.def.clone().expect("script frame has a body");
            let base = frame.base;
            let mut pc = frame.pc;
            let env = match frame.func.map(|f| match self.vm.heap.get(f) {
                HeapData::Function(func) => func.env(),
                _ => self.vm.globals,
            }) {
                Some(e) => e,
                None => self.vm.globals,
            };
            let upvals: Vec<HeapId> = match frame.func.map(|f| self.vm.heap.get(f)) {
                Some(HeapData::Function(crate::types::Function::Script { upvals, .. })) => upvals.clone(),
                _ => Vec::new(),
            };

            macro_rules! fetch {
                () => {{
                    let w = def.code[pc];
                    pc += 1;
                    w
                }};
            }
            macro_rules! fetch_uimm {
                () => {{ fetch!() as usize }};
            }
            macro_rules! fetch_imm {
                () => {{ instr::imm_of(fetch!()) }};
            }
            // Register-or-constant operand.
            macro_rules! fetch_rc {
                () => {{
                    let w = fetch!();
                    if w & CONST_BIT != 0 {
                        def.constants[(w & !CONST_BIT) as usize]
                    } else {
                        self.t.stack[base + w as usize]
                    }
                }};
            }
            macro_rules! jump {
                ($offs:expr) => {{
                    let offs = $offs;
                    pc = (pc as i64 + i64::from(offs)) as usize;
                }};
            }
            macro_rules! save_pc {
                () => {{ self.t.current_frame_mut().pc = pc }};
            }
            /// Runs a fallible operation; on error, saves the pc (for the
            /// traceback) and routes through the thrower.
            macro_rules! vmtry {
                ($e:expr) => {{
                    match $e {
                        Ok(v) => v,
                        Err(err) => {
                            save_pc!();
                            self.throw_error(err)?;
                            continue 'reenter;
                        }
                    }
                }};
            }

            loop {
                // Between-instruction checks: cooperative cancellation and
                // debug hooks.
                if self.t.pending_halt {
                    self.t.pending_halt = false;
                    save_pc!();
                    self.throw_error(CrocError::Halt)?;
                    continue 'reenter;
                }
                if self.t.hooks_enabled && self.t.hook.is_some() {
                    save_pc!();
                    vmtry!(self.fire_instruction_hooks(&def, pc));
                    pc = self.t.current_frame().pc;
                }

                let word = fetch!();
                let op = instr::opcode_of(word);
                let rd = instr::rd_of(word);

                match op {
                    // === Binary arithmetic ===
                    Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        save_pc!();
                        let v = vmtry!(self.bin_arith(op, rs, rt));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::AddEq | Opcode::SubEq | Opcode::MulEq | Opcode::DivEq | Opcode::ModEq => {
                        let rs = fetch_rc!();
                        let dest = self.t.stack[base + rd];
                        save_pc!();
                        let v = vmtry!(self.refl_arith(op, dest, rs));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr | Opcode::UShr => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        save_pc!();
                        let v = vmtry!(self.bin_bitwise(op, rs, rt));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::AndEq | Opcode::OrEq | Opcode::XorEq | Opcode::ShlEq | Opcode::ShrEq | Opcode::UShrEq => {
                        let rs = fetch_rc!();
                        let dest = self.t.stack[base + rd];
                        save_pc!();
                        let v = vmtry!(self.refl_bitwise(op, dest, rs));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::Neg => {
                        let rs = fetch_rc!();
                        save_pc!();
                        let v = vmtry!(self.neg_value(rs));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::Com => {
                        let rs = fetch_rc!();
                        save_pc!();
                        let v = vmtry!(self.com_value(rs));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::Inc => {
                        let dest = self.t.stack[base + rd];
                        save_pc!();
                        let v = vmtry!(self.inc_dec_value(dest, true));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::Dec => {
                        let dest = self.t.stack[base + rd];
                        save_pc!();
                        let v = vmtry!(self.inc_dec_value(dest, false));
                        self.t.stack[base + rd] = v;
                    }

                    // === Data transfer ===
                    Opcode::Move => {
                        let rs = fetch_rc!();
                        self.t.stack[base + rd] = rs;
                    }
                    Opcode::NewGlobal => {
                        let name = self.const_string(&def, fetch_uimm!());
                        let v = self.t.stack[base + rd];
                        save_pc!();
                        vmtry!(self.new_global(env, name, v));
                    }
                    Opcode::GetGlobal => {
                        let name = self.const_string(&def, fetch_uimm!());
                        save_pc!();
                        let v = vmtry!(self.get_global(env, name));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::SetGlobal => {
                        let name = self.const_string(&def, fetch_uimm!());
                        let v = self.t.stack[base + rd];
                        save_pc!();
                        vmtry!(self.set_global(env, name, v));
                    }
                    Opcode::GetUpval => {
                        let idx = fetch_uimm!();
                        self.t.stack[base + rd] = self.read_upval(upvals[idx]);
                    }
                    Opcode::SetUpval => {
                        let idx = fetch_uimm!();
                        let v = self.t.stack[base + rd];
                        self.write_upval(upvals[idx], v);
                    }

                    // === Comparisons and branches ===
                    Opcode::Cmp3 => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        save_pc!();
                        let c = vmtry!(self.compare_values(rs, rt));
                        self.t.stack[base + rd] = Value::Int(c);
                    }
                    Opcode::Cmp => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        let offs = fetch_imm!();
                        save_pc!();
                        let c = vmtry!(self.compare_values(rs, rt));
                        let code = Comparison::from_repr(rd as u16).expect("comparison code");
                        let taken = match code {
                            Comparison::Lt => c < 0,
                            Comparison::Le => c <= 0,
                            Comparison::Gt => c > 0,
                            Comparison::Ge => c >= 0,
                        };
                        if taken {
                            jump!(offs);
                        }
                    }
                    Opcode::SwitchCmp => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        let offs = fetch_imm!();
                        if ops::switch_cmp(rs, rt) {
                            jump!(offs);
                        }
                    }
                    Opcode::Equals => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        let offs = fetch_imm!();
                        save_pc!();
                        let eq = vmtry!(self.equals_values(rs, rt));
                        if eq == (rd != 0) {
                            jump!(offs);
                        }
                    }
                    Opcode::Is => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        let offs = fetch_imm!();
                        if rs.exact_eq(rt) == (rd != 0) {
                            jump!(offs);
                        }
                    }
                    Opcode::In => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        let offs = fetch_imm!();
                        save_pc!();
                        let found = vmtry!(self.in_values(rs, rt));
                        if found == (rd != 0) {
                            jump!(offs);
                        }
                    }
                    Opcode::IsTrue => {
                        let rs = fetch_rc!();
                        let offs = fetch_imm!();
                        if rs.is_true() == (rd != 0) {
                            jump!(offs);
                        }
                    }
                    Opcode::Jmp => {
                        let offs = fetch_imm!();
                        if rd != 0 {
                            jump!(offs);
                        }
                    }
                    Opcode::Switch => {
                        let rs = fetch_rc!();
                        let table = &def.switch_tables[rd];
                        match table.offsets.get(&rs) {
                            Some(&offs) => jump!(offs),
                            None => match table.default_offset {
                                Some(offs) => jump!(offs),
                                None => {
                                    save_pc!();
                                    vmtry!(Err(self.vm.make_exc(ExcKind::SwitchError, "Switch without default")));
                                }
                            },
                        }
                    }
                    Opcode::Close => {
                        self.close_upvals(base + rd);
                    }

                    // === Loops ===
                    Opcode::For => {
                        let offs = fetch_imm!();
                        save_pc!();
                        vmtry!(self.loop_for_entry(base + rd));
                        jump!(offs);
                    }
                    Opcode::ForLoop => {
                        let offs = fetch_imm!();
                        let idx = self.t.stack[base + rd];
                        let hi = self.t.stack[base + rd + 1];
                        let step = self.t.stack[base + rd + 2];
                        let (Value::Int(idx), Value::Int(hi), Value::Int(step)) = (idx, hi, step) else {
                            unreachable!("For validated the loop registers");
                        };
                        let again = if step > 0 { idx < hi } else { idx >= hi };
                        if again {
                            self.t.stack[base + rd + 3] = Value::Int(idx);
                            self.t.stack[base + rd] = Value::Int(idx + step);
                            jump!(offs);
                        }
                    }
                    Opcode::Foreach => {
                        let offs = fetch_imm!();
                        save_pc!();
                        vmtry!(self.loop_foreach_entry(base + rd));
                        jump!(offs);
                    }
                    Opcode::ForeachLoop => {
                        let num_indices = fetch_uimm!();
                        let offs = fetch_imm!();
                        save_pc!();
                        let again = vmtry!(self.loop_foreach_step(base + rd, num_indices));
                        if again {
                            jump!(offs);
                        }
                    }

                    // === Exception handling ===
                    Opcode::PushCatch | Opcode::PushFinally => {
                        let offs = fetch_imm!();
                        let handler_pc = (pc as i64 + i64::from(offs)) as usize;
                        self.push_eh_frame(op == Opcode::PushCatch, rd, handler_pc);
                    }
                    Opcode::PopEH => {
                        self.t.eh_frames.pop();
                    }
                    Opcode::EndFinal => {
                        save_pc!();
                        if let Some(err) = self.pending_exc_take() {
                            self.throw_error_rethrow(err)?;
                            continue 'reenter;
                        }
                        if self.t.current_frame().unwind_return.is_some() {
                            self.unwind()?;
                            continue 'reenter;
                        }
                    }
                    Opcode::Throw => {
                        let rs = fetch_rc!();
                        save_pc!();
                        self.throw_value(rs, rd != 0)?;
                        continue 'reenter;
                    }
                    Opcode::Unwind => {
                        save_pc!();
                        self.t.current_frame_mut().unwind_return = Some(pc);
                        self.t.current_frame_mut().unwind_counter = rd as u32;
                        self.unwind()?;
                        continue 'reenter;
                    }

                    // === Calls ===
                    Opcode::Call | Opcode::TailCall => {
                        let mut num_params = fetch_uimm!() as isize - 1;
                        let dummy_or_results = fetch_uimm!() as isize - 1;
                        let expected = if op == Opcode::TailCall { -1 } else { dummy_or_results };
                        save_pc!();
                        if num_params == -1 {
                            num_params = (self.t.stack_index - (base + rd + 1)) as isize;
                        } else {
                            self.t.stack_index = base + rd + 1 + num_params as usize;
                        }
                        if op == Opcode::TailCall {
                            vmtry!(self.tail_call(base + rd, num_params));
                        } else {
                            vmtry!(self.call_prologue(base + rd, expected, num_params, false));
                        }
                        self.vm.maybe_collect(Some(&self.t));
                        continue 'reenter;
                    }
                    Opcode::Method | Opcode::TailMethod => {
                        let obj = fetch_rc!();
                        let name = fetch_rc!();
                        let mut num_params = fetch_uimm!() as isize - 1;
                        let dummy_or_results = fetch_uimm!() as isize - 1;
                        let expected = if op == Opcode::TailMethod { -1 } else { dummy_or_results };
                        save_pc!();
                        let Value::Str(name_id) = name else {
                            let k = name.kind(&self.vm.heap).name();
                            vmtry!(Err(self.vm.make_exc(
                                ExcKind::TypeError,
                                format!("Attempting to get a method with a non-string name (type '{k}' instead)"),
                            )));
                            unreachable!()
                        };
                        if num_params == -1 {
                            num_params = (self.t.stack_index - (base + rd + 1)) as isize;
                        } else {
                            self.t.stack_index = base + rd + 1 + num_params as usize;
                        }
                        if op == Opcode::TailMethod {
                            vmtry!(self.tail_method_call(base + rd, obj, name_id, num_params));
                        } else {
                            vmtry!(self.method_call_prologue(base + rd, obj, name_id, expected, num_params));
                        }
                        self.vm.maybe_collect(Some(&self.t));
                        continue 'reenter;
                    }
                    Opcode::SaveRets => {
                        let num = fetch_uimm!();
                        let first = base + rd;
                        save_pc!();
                        if num == 0 {
                            let count = self.t.stack_index - first;
                            self.save_results(first, count);
                            self.t.stack_index = self.t.current_frame().saved_top;
                        } else {
                            self.save_results(first, num - 1);
                        }
                    }
                    Opcode::Ret => {
                        save_pc!();
                        self.do_return()?;
                        continue 'reenter;
                    }
                    Opcode::Yield => {
                        let num_values = fetch_uimm!() as isize - 1;
                        let num_results = fetch_uimm!() as isize - 1;
                        save_pc!();
                        self.do_yield(base + rd, num_values, num_results)?;
                        continue 'reenter;
                    }

                    // === Parameter checks ===
                    Opcode::CheckParams => {
                        save_pc!();
                        vmtry!(self.check_params(&def, base));
                    }
                    Opcode::CheckObjParam => {
                        let rs = fetch_rc!();
                        let offs = fetch_imm!();
                        save_pc!();
                        let val = self.t.stack[base + rd];
                        if val.kind(&self.vm.heap) != CrocType::Instance {
                            jump!(offs);
                        } else {
                            let Value::Ref(class_id) = rs else {
                                vmtry!(Err(self.param_constraint_error(rd, rs)));
                                unreachable!()
                            };
                            if !matches!(self.vm.heap.get(class_id), HeapData::Class(_)) {
                                vmtry!(Err(self.param_constraint_error(rd, rs)));
                            }
                            if vmtry!(self.instance_derives_from(val, class_id)) {
                                jump!(offs);
                            }
                        }
                    }
                    Opcode::ObjParamFail => {
                        save_pc!();
                        let val = self.t.stack[base + rd];
                        vmtry!(Err(self.param_type_error(rd, val)));
                    }
                    Opcode::CustomParamFail => {
                        let rs = fetch_rc!();
                        save_pc!();
                        let val = self.t.stack[base + rd];
                        let kind = val.kind(&self.vm.heap).name();
                        let constraint = rs.stringify(&self.vm.heap, &self.vm.interns);
                        let msg = if rd == 0 {
                            format!("'this' parameter: type '{kind}' does not satisfy constraint '{constraint}'")
                        } else {
                            format!("Parameter {rd}: type '{kind}' does not satisfy constraint '{constraint}'")
                        };
                        vmtry!(Err(self.vm.make_exc(ExcKind::TypeError, msg)));
                    }
                    Opcode::AssertFail => {
                        save_pc!();
                        let msg = self.t.stack[base + rd];
                        let err = match msg {
                            Value::Str(s) => {
                                let text = self.vm.interns.get(s).to_owned();
                                self.vm.make_exc(ExcKind::AssertError, text)
                            }
                            other => {
                                let k = other.kind(&self.vm.heap).name();
                                self.vm.make_exc(
                                    ExcKind::AssertError,
                                    format!("Assertion failed, but the message is a '{k}', not a 'string'"),
                                )
                            }
                        };
                        vmtry!(Err(err));
                    }

                    // === Length and composite data ===
                    Opcode::Length => {
                        let rs = fetch_rc!();
                        save_pc!();
                        let v = vmtry!(self.length_of(rs));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::LengthAssign => {
                        let rs = fetch_rc!();
                        save_pc!();
                        let obj = self.t.stack[base + rd];
                        vmtry!(self.length_assign(obj, rs));
                    }
                    Opcode::Append => {
                        let rs = fetch_rc!();
                        let arr = self.t.stack[base + rd];
                        let Value::Ref(arr_id) = arr else {
                            unreachable!("Append target is always a fresh array");
                        };
                        if let HeapData::Array(a) = self.vm.heap.get_mut(arr_id) {
                            a.push(rs);
                        }
                    }
                    Opcode::SetArray => {
                        let num = fetch_uimm!();
                        let block = fetch_uimm!();
                        let first = base + rd + 1;
                        let count = if num == 0 {
                            let c = self.t.stack_index - first;
                            self.t.stack_index = self.t.current_frame().saved_top;
                            c
                        } else {
                            num - 1
                        };
                        let values = self.t.stack[first..first + count].to_vec();
                        let arr = self.t.stack[base + rd];
                        let Value::Ref(arr_id) = arr else {
                            unreachable!("SetArray target is always a fresh array");
                        };
                        if let HeapData::Array(a) = self.vm.heap.get_mut(arr_id) {
                            a.set_block(block, &values);
                        }
                    }
                    Opcode::Cat => {
                        let first = fetch_uimm!();
                        let num = fetch_uimm!();
                        save_pc!();
                        let v = vmtry!(self.concat_values(base + first, num));
                        self.t.stack[base + rd] = v;
                        self.vm.maybe_collect(Some(&self.t));
                    }
                    Opcode::CatEq => {
                        let first = fetch_uimm!();
                        let num = fetch_uimm!();
                        save_pc!();
                        let dest = self.t.stack[base + rd];
                        let v = vmtry!(self.concat_assign(dest, base + first, num));
                        self.t.stack[base + rd] = v;
                        self.vm.maybe_collect(Some(&self.t));
                    }
                    Opcode::Index => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        save_pc!();
                        let v = vmtry!(self.index_value(rs, rt));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::IndexAssign => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        save_pc!();
                        let container = self.t.stack[base + rd];
                        vmtry!(self.index_assign(container, rs, rt));
                    }
                    Opcode::Field => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        save_pc!();
                        let Value::Str(name) = rt else {
                            let k = rt.kind(&self.vm.heap).name();
                            vmtry!(Err(self
                                .vm
                                .make_exc(ExcKind::TypeError, format!("Field name must be a string, not a '{k}'"))));
                            unreachable!()
                        };
                        let v = vmtry!(self.field_value(rs, name));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::FieldAssign => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        save_pc!();
                        let Value::Str(name) = rs else {
                            let k = rs.kind(&self.vm.heap).name();
                            vmtry!(Err(self
                                .vm
                                .make_exc(ExcKind::TypeError, format!("Field name must be a string, not a '{k}'"))));
                            unreachable!()
                        };
                        let obj = self.t.stack[base + rd];
                        vmtry!(self.field_assign(obj, name, rt));
                    }
                    Opcode::Slice => {
                        let src_base = fetch_uimm!();
                        save_pc!();
                        let src = self.t.stack[base + src_base];
                        let lo = self.t.stack[base + src_base + 1];
                        let hi = self.t.stack[base + src_base + 2];
                        let v = vmtry!(self.slice_value(src, lo, hi));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::SliceAssign => {
                        let rs = fetch_rc!();
                        save_pc!();
                        let src = self.t.stack[base + rd];
                        let lo = self.t.stack[base + rd + 1];
                        let hi = self.t.stack[base + rd + 2];
                        vmtry!(self.slice_assign(src, lo, hi, rs));
                    }

                    // === Object creation ===
                    Opcode::NewArray => {
                        let size = match def.constants[fetch_uimm!()] {
                            Value::Int(n) => n as usize,
                            _ => 0,
                        };
                        let id = self
                            .vm
                            .heap
                            .allocate(HeapData::Array(crate::types::Array::with_len(size)));
                        self.t.stack[base + rd] = Value::Ref(id);
                        self.vm.maybe_collect(Some(&self.t));
                    }
                    Opcode::NewTable => {
                        let id = self.vm.heap.allocate(HeapData::Table(crate::types::Table::new()));
                        self.t.stack[base + rd] = Value::Ref(id);
                        self.vm.maybe_collect(Some(&self.t));
                    }
                    Opcode::Closure | Opcode::ClosureWithEnv => {
                        let idx = fetch_uimm!();
                        save_pc!();
                        let func_env = if op == Opcode::ClosureWithEnv {
                            match self.t.stack[base + rd] {
                                Value::Ref(id) if matches!(self.vm.heap.get(id), HeapData::Namespace(_)) => id,
                                _ => env,
                            }
                        } else {
                            env
                        };
                        let v = vmtry!(self.make_closure(&def, idx, func_env, &upvals));
                        self.t.stack[base + rd] = v;
                        self.vm.maybe_collect(Some(&self.t));
                    }
                    Opcode::Class => {
                        let name = fetch_rc!();
                        let first_base = fetch!();
                        let num_bases = fetch_uimm!();
                        save_pc!();
                        let base_reg = (first_base & !CONST_BIT) as usize;
                        let v = vmtry!(self.make_class(name, base + base_reg, num_bases));
                        self.t.stack[base + rd] = v;
                        self.vm.maybe_collect(Some(&self.t));
                    }
                    Opcode::Namespace => {
                        let name = self.const_string(&def, fetch_uimm!());
                        let parent = fetch_rc!();
                        save_pc!();
                        let v = vmtry!(self.make_namespace(name, Some(parent)));
                        self.t.stack[base + rd] = v;
                        self.vm.maybe_collect(Some(&self.t));
                    }
                    Opcode::NamespaceNP => {
                        let name = self.const_string(&def, fetch_uimm!());
                        save_pc!();
                        let v = vmtry!(self.make_namespace_with_parent(name, env));
                        self.t.stack[base + rd] = v;
                        self.vm.maybe_collect(Some(&self.t));
                    }
                    Opcode::SuperOf => {
                        let rs = fetch_rc!();
                        save_pc!();
                        let v = vmtry!(self.super_of(rs));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::AddMember => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        let flags = fetch_uimm!();
                        save_pc!();
                        let cls = self.t.stack[base + rd];
                        vmtry!(self.add_class_member(cls, rs, rt, flags));
                    }

                    // === Varargs ===
                    Opcode::Vararg => {
                        let num = fetch_uimm!();
                        let frame = self.t.current_frame();
                        let num_varargs = frame.base - frame.varg_base;
                        let varg_base = frame.varg_base;
                        let dest = base + rd;

                        let needed = if num == 0 {
                            self.t.stack_index = dest + num_varargs;
                            self.t.ensure_stack(self.t.stack_index + 1);
                            num_varargs
                        } else {
                            num - 1
                        };
                        self.t.ensure_stack(dest + needed + 1);
                        for i in 0..needed {
                            self.t.stack[dest + i] = if i < num_varargs {
                                self.t.stack[varg_base + i]
                            } else {
                                Value::Null
                            };
                        }
                    }
                    Opcode::VargLen => {
                        let frame = self.t.current_frame();
                        let n = (frame.base - frame.varg_base) as i64;
                        self.t.stack[base + rd] = Value::Int(n);
                    }
                    Opcode::VargIndex => {
                        let rs = fetch_rc!();
                        save_pc!();
                        let v = vmtry!(self.vararg_index(rs));
                        self.t.stack[base + rd] = v;
                    }
                    Opcode::VargIndexAssign => {
                        let rs = fetch_rc!();
                        let rt = fetch_rc!();
                        save_pc!();
                        vmtry!(self.vararg_index_assign(rs, rt));
                    }
                    Opcode::VargSlice => {
                        let num = fetch_uimm!();
                        save_pc!();
                        vmtry!(self.vararg_slice(base + rd, num));
                    }
                }
            }
        }
    }

    // === Shared helpers used across the submodules ===

    pub(crate) fn const_string(&self, def: &FuncDefData, idx: usize) -> crate::intern::StringId {
        match def.constants[idx] {
            Value::Str(s) => s,
            _ => unreachable!("name constants are strings"),
        }
    }

    pub(crate) fn read_upval(&self, uv: HeapId) -> Value {
        match self.vm.heap.get(uv) {
            HeapData::Upval(Upval::Closed(v)) => *v,
            HeapData::Upval(Upval::Open { thread, slot }) => {
                if *thread == self.t_id {
                    self.t.stack[*slot]
                } else {
                    match self.vm.heap.get(*thread) {
                        HeapData::Thread(t) => t.stack[*slot],
                        _ => Value::Null,
                    }
                }
            }
            _ => Value::Null,
        }
    }

    pub(crate) fn write_upval(&mut self, uv: HeapId, v: Value) {
        let target = match self.vm.heap.get(uv) {
            HeapData::Upval(Upval::Closed(_)) => None,
            HeapData::Upval(Upval::Open { thread, slot }) => Some((*thread, *slot)),
            _ => return,
        };
        match target {
            None => {
                if let HeapData::Upval(u) = self.vm.heap.get_mut(uv) {
                    *u = Upval::Closed(v);
                }
            }
            Some((thread, slot)) => {
                if thread == self.t_id {
                    self.t.stack[slot] = v;
                } else if let HeapData::Thread(t) = self.vm.heap.get_mut(thread) {
                    t.stack[slot] = v;
                }
            }
        }
    }

    /// Finds or creates the open upvalue box for a stack slot of the current
    /// thread. The list stays sorted by descending slot.
    pub(crate) fn find_upval(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.t.open_upvals.len();
        for (i, &uv) in self.t.open_upvals.iter().enumerate() {
            let HeapData::Upval(Upval::Open { slot: s, .. }) = self.vm.heap.get(uv) else {
                continue;
            };
            if *s == slot {
                return uv;
            }
            if *s < slot {
                insert_at = i;
                break;
            }
        }
        let uv = self.vm.heap.allocate(HeapData::Upval(Upval::Open {
            thread: self.t_id,
            slot,
        }));
        self.t.open_upvals.insert(insert_at, uv);
        uv
    }

    /// Closes all open upvalues at or above `threshold`: copies the aliased
    /// stack slot into the box and trims the (descending-sorted) list.
    pub(crate) fn close_upvals(&mut self, threshold: usize) {
        while let Some(&uv) = self.t.open_upvals.first() {
            let slot = match self.vm.heap.get(uv) {
                HeapData::Upval(Upval::Open { slot, .. }) => *slot,
                _ => {
                    self.t.open_upvals.remove(0);
                    continue;
                }
            };
            if slot < threshold {
                break;
            }
            let v = self.t.stack[slot];
            if let HeapData::Upval(u) = self.vm.heap.get_mut(uv) {
                *u = Upval::Closed(v);
            }
            self.t.open_upvals.remove(0);
        }
    }

    pub(crate) fn make_closure(
        &mut self,
        def: &FuncDefData,
        idx: usize,
        env: HeapId,
        upvals: &[HeapId],
    ) -> VmResult<Value> {
        let inner = Rc::clone(&def.inner[idx]);
        let mut new_upvals = Vec::with_capacity(inner.upvals.len());
        for desc in &inner.upvals {
            if desc.is_upval {
                new_upvals.push(upvals[desc.index as usize]);
            } else {
                let base = self.t.current_frame().base;
                let uv = self.find_upval(base + desc.index as usize);
                new_upvals.push(uv);
            }
        }
        let id = self.vm.heap.allocate(HeapData::Function(crate::types::Function::Script {
            def: inner,
            env,
            upvals: new_upvals,
        }));
        Ok(Value::Ref(id))
    }

    pub(crate) fn param_type_error(&mut self, idx: usize, val: Value) -> CrocError {
        let kind = val.kind(&self.vm.heap).name();
        let msg = if idx == 0 {
            format!("'this' parameter: type '{kind}' is not allowed")
        } else {
            format!("Parameter {idx}: type '{kind}' is not allowed")
        };
        self.vm.make_exc(ExcKind::TypeError, msg)
    }

    pub(crate) fn param_constraint_error(&mut self, idx: usize, val: Value) -> CrocError {
        let kind = val.kind(&self.vm.heap).name();
        let msg = if idx == 0 {
            format!("'this' parameter: instance type constraint type must be 'class', not '{kind}'")
        } else {
            format!("Parameter {idx}: instance type constraint type must be 'class', not '{kind}'")
        };
        self.vm.make_exc(ExcKind::TypeError, msg)
    }

    pub(crate) fn check_params(&mut self, def: &FuncDefData, base: usize) -> VmResult<()> {
        for (idx, &mask) in def.param_masks.iter().enumerate() {
            let val = self.t.stack[base + idx];
            let kind = val.kind(&self.vm.heap);
            if mask & kind.mask_bit() == 0 {
                return Err(self.param_type_error(idx, val));
            }
        }
        Ok(())
    }

    pub(crate) fn instance_derives_from(&mut self, val: Value, class_id: HeapId) -> VmResult<bool> {
        let Value::Ref(inst_id) = val else { return Ok(false) };
        let HeapData::Instance(inst) = self.vm.heap.get(inst_id) else {
            return Ok(false);
        };
        if inst.class == class_id {
            return Ok(true);
        }
        let mut cur = Some(inst.class);
        while let Some(cid) = cur {
            if cid == class_id {
                return Ok(true);
            }
            cur = match self.vm.heap.get(cid) {
                HeapData::Class(c) => c.parent,
                _ => None,
            };
        }
        Ok(false)
    }

    pub(crate) fn results_smallvec(&self, first: usize, num: usize) -> SmallVec<[Value; 4]> {
        self.t.stack[first..first + num].iter().copied().collect()
    }
}
