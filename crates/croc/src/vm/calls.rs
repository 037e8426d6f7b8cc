//! Call setup and teardown: prologue (including class instantiation,
//! `opCall` dispatch, and thread resumption), method resolution, tail calls,
//! and the result-buffer plumbing behind `SaveRets`/`Ret`.

use std::rc::Rc;

use crate::{
    errors::{CrocError, ExcKind, VmResult},
    heap::{HeapData, HeapId},
    intern::StringId,
    run::NativeCtx,
    types::{ActRecord, Function},
    value::Value,
    vm::{Interp, meta::Metamethod},
};

impl Interp<'_> {
    /// Sets up a call: `stack[slot]` is the callable, `slot + 1` the `this`
    /// context, arguments follow. `num_params` counts `this` plus arguments.
    ///
    /// Returns true when a script frame was pushed (or a thread was resumed)
    /// and the dispatch loop must re-enter; false when the call completed
    /// synchronously (native functions, class instantiation) with results
    /// already in place.
    pub(crate) fn call_prologue(
        &mut self,
        slot: usize,
        expected: isize,
        num_params: isize,
        is_entry: bool,
    ) -> VmResult<bool> {
        let num_params = num_params.max(1) as usize;
        let func = self.t.stack[slot];

        match func {
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Function(_) => self.func_call_prologue(id, slot, expected, slot + 1, num_params, is_entry),
                HeapData::Class(_) => {
                    let inst = self.class_call(id, slot, num_params)?;
                    self.t.stack[slot] = inst;
                    self.finish_sync_call(slot, 1, expected);
                    Ok(false)
                }
                HeapData::Thread(_) => {
                    self.resume_thread(id, slot, expected, num_params)?;
                    Ok(true)
                }
                HeapData::Instance(_) => {
                    // Instances are callable through opCall.
                    let Some(mm) = super::meta::get_metamethod(self.vm, func, Metamethod::Call) else {
                        return Err(self.no_call_error(func));
                    };
                    // The instance becomes the `this` of the metamethod call.
                    self.t.stack[slot + 1] = func;
                    self.t.stack[slot] = mm;
                    self.call_prologue(slot, expected, num_params as isize, is_entry)
                }
                _ => Err(self.no_call_error(func)),
            },
            _ => {
                if let Some(mm) = super::meta::get_metamethod(self.vm, func, Metamethod::Call) {
                    self.t.stack[slot + 1] = func;
                    self.t.stack[slot] = mm;
                    return self.call_prologue(slot, expected, num_params as isize, is_entry);
                }
                Err(self.no_call_error(func))
            }
        }
    }

    fn no_call_error(&mut self, func: Value) -> CrocError {
        let kind = func.kind(&self.vm.heap).name();
        self.vm
            .make_exc(ExcKind::TypeError, format!("Attempting to call a value of type '{kind}'"))
    }

    fn func_call_prologue(
        &mut self,
        func_id: HeapId,
        return_slot: usize,
        expected: isize,
        param_slot: usize,
        num_params: usize,
        is_entry: bool,
    ) -> VmResult<bool> {
        enum Kind {
            Native(crate::types::NativeFn),
            Script(Rc<crate::bytecode::FuncDefData>),
        }

        let kind = match self.vm.heap.get(func_id) {
            HeapData::Function(Function::Native { func, .. }) => Kind::Native(*func),
            HeapData::Function(Function::Script { def, .. }) => Kind::Script(Rc::clone(def)),
            _ => unreachable!("checked by the caller"),
        };

        match kind {
            Kind::Native(native) => {
                let this = self.t.stack[param_slot];
                let args = self.t.stack[param_slot + 1..param_slot + num_params].to_vec();
                self.fire_call_hook(false)?;
                self.t.native_call_depth += 1;
                let result = {
                    let mut ctx = NativeCtx {
                        interp: self,
                        this,
                        args,
                        func_id,
                    };
                    native(&mut ctx)
                };
                self.t.native_call_depth -= 1;
                let rets = result?;
                self.t.ensure_stack(return_slot + rets.len() + 1);
                for (i, &v) in rets.iter().enumerate() {
                    self.t.stack[return_slot + i] = v;
                }
                self.finish_sync_call(return_slot, rets.len(), expected);
                Ok(false)
            }
            Kind::Script(def) => {
                let given = num_params;
                let declared = def.num_params;
                // Extra arguments to a variadic function slide below the
                // declared frame so registers stay contiguous.
                let (base, varg_base) = if def.is_vararg && given > declared {
                    self.shuffle_vararg_args(param_slot, declared, given)
                } else {
                    (param_slot, param_slot)
                };

                // Null-fill missing parameters and clear the rest of the frame.
                let frame_top = base + def.stack_size;
                self.t.ensure_stack(frame_top + 1);
                let have = given.min(declared);
                for i in have..def.stack_size {
                    self.t.stack[base + i] = Value::Null;
                }

                let record = ActRecord {
                    base,
                    saved_top: frame_top,
                    varg_base,
                    return_slot,
                    func: Some(func_id),
                    def: Some(def),
                    pc: 0,
                    expected_results: expected,
                    num_tailcalls: 0,
                    // Guards result-buffer truncation during unwinding: a
                    // frame that never saves results must not clobber its
                    // callers' pending ones.
                    first_result: self.t.results.len(),
                    num_results: 0,
                    unwind_counter: 0,
                    unwind_return: None,
                    is_entry,
                    is_coro_entry: false,
                };
                self.t.frames.push(record);
                self.t.stack_base = base;
                self.t.stack_index = frame_top;
                self.fire_call_hook(false)?;
                Ok(true)
            }
        }
    }

    /// Handles the vararg shuffle for script calls. Separated because tail
    /// calls reuse it with a different frame target.
    pub(crate) fn shuffle_vararg_args(&mut self, param_slot: usize, declared: usize, given: usize) -> (usize, usize) {
        let extras = given.saturating_sub(declared);
        if extras == 0 {
            return (param_slot, param_slot);
        }
        // Rotate so the extras sit at param_slot and the declared block
        // (this + params) follows them.
        let total = given;
        let region: Vec<Value> = self.t.stack[param_slot..param_slot + total].to_vec();
        self.t.ensure_stack(param_slot + total + declared + 1);
        for (i, &v) in region[declared..].iter().enumerate() {
            self.t.stack[param_slot + i] = v;
        }
        for (i, &v) in region[..declared].iter().enumerate() {
            self.t.stack[param_slot + extras + i] = v;
        }
        (param_slot + extras, param_slot)
    }

    /// Copies sync-call results into the caller-visible slots per the
    /// expected count and records the actual count.
    pub(crate) fn finish_sync_call(&mut self, return_slot: usize, num_results: usize, expected: isize) {
        let final_count = if expected < 0 { num_results } else { expected as usize };
        self.t.ensure_stack(return_slot + final_count + 1);
        for i in num_results..final_count {
            self.t.stack[return_slot + i] = Value::Null;
        }
        self.last_results = final_count;
        if expected < 0 {
            self.t.stack_index = return_slot + final_count;
        } else if let Some(frame) = self.t.frames.last() {
            self.t.stack_index = frame.saved_top;
        } else {
            self.t.stack_index = return_slot + final_count;
        }
        self.fire_ret_hook_quietly();
    }

    /// Calling a class creates an instance; the constructor (when present)
    /// runs to completion with the instance as `this`, and the call's single
    /// result is the instance.
    fn class_call(&mut self, class_id: HeapId, slot: usize, num_params: usize) -> VmResult<Value> {
        let ctor = {
            let HeapData::Class(c) = self.vm.heap.get(class_id) else {
                unreachable!()
            };
            c.get_method(self.vm.wk.constructor).filter(|m| !m.is_null())
        };

        let inst = self.vm.instantiate_raw(class_id);
        if let Some(ctor) = ctor {
            let args = self.t.stack[slot + 2..slot + 1 + num_params].to_vec();
            self.call_sync(ctor, Value::Ref(inst), &args, 0)?;
        }
        Ok(Value::Ref(inst))
    }

    /// Resolves a method the way the `Method` opcode does: class/instance
    /// method tables first, then stored fields, then per-type metatables,
    /// then the `opMethod` metamethod.
    pub(crate) fn lookup_method(&mut self, obj: Value, name: StringId) -> VmResult<Value> {
        let found = match obj {
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Instance(inst) => {
                    let class = inst.class;
                    let method = match self.vm.heap.get(class) {
                        HeapData::Class(c) => c.get_method(name),
                        _ => None,
                    };
                    method.or_else(|| match self.vm.heap.get(id) {
                        HeapData::Instance(inst) => inst.get_field(name),
                        _ => None,
                    })
                }
                HeapData::Class(c) => c.get_method(name).or_else(|| c.get_field(name)),
                HeapData::Namespace(ns) => ns.get(name),
                HeapData::Table(t) => {
                    let v = t.get(Value::Str(name));
                    if v.is_null() { None } else { Some(v) }
                }
                _ => None,
            },
            _ => None,
        };

        if let Some(m) = found {
            return Ok(m);
        }

        // Value kinds and misses consult the type metatable.
        if let Some(mt) = self.vm.type_metatables[obj.kind(&self.vm.heap) as usize] {
            if let HeapData::Namespace(ns) = self.vm.heap.get(mt) {
                if let Some(m) = ns.get(name) {
                    return Ok(m);
                }
            }
        }

        if let Some(mm) = super::meta::get_metamethod(self.vm, obj, Metamethod::Method) {
            let name_val = Value::Str(name);
            let results = self.call_sync(mm, obj, &[name_val], 1)?;
            if let Some(&m) = results.first() {
                if !m.is_null() {
                    return Ok(m);
                }
            }
        }

        let kind = obj.kind(&self.vm.heap).name();
        let name_str = self.vm.interns.get(name).to_owned();
        Err(self
            .vm
            .make_exc(ExcKind::FieldError, format!("No implementation of method '{name_str}' for type '{kind}'")))
    }

    pub(crate) fn method_call_prologue(
        &mut self,
        slot: usize,
        obj: Value,
        name: StringId,
        expected: isize,
        num_params: isize,
    ) -> VmResult<bool> {
        let method = self.lookup_method(obj, name)?;
        self.t.stack[slot] = method;
        self.t.stack[slot + 1] = obj;
        let num_params = if num_params <= 0 { 1 } else { num_params };
        self.call_prologue(slot, expected, num_params, false)
    }

    /// Tail call: the caller's activation record is overwritten in place and
    /// the stack region slides down, so call depth does not grow.
    pub(crate) fn tail_call(&mut self, slot: usize, num_params: isize) -> VmResult<()> {
        let pushed = self.call_prologue(slot, -1, num_params, false)?;
        if pushed {
            self.merge_tail_frames();
        }
        Ok(())
    }

    pub(crate) fn tail_method_call(&mut self, slot: usize, obj: Value, name: StringId, num_params: isize) -> VmResult<()> {
        let method = self.lookup_method(obj, name)?;
        self.t.stack[slot] = method;
        self.t.stack[slot + 1] = obj;
        self.tail_call(slot, num_params)
    }

    /// Collapses the frame just pushed by a tail call into its caller's
    /// record.
    fn merge_tail_frames(&mut self) {
        let len = self.t.frames.len();
        if len < 2 {
            return;
        }
        // A resumed thread is a frame on another thread; nothing to merge.
        if self.t.frames[len - 1].is_coro_entry {
            return;
        }

        let prev = self.t.frames[len - 2].clone();
        let cur = self.t.frames[len - 1].clone();

        self.close_upvals(prev.base);

        let diff = cur.return_slot - prev.return_slot;
        let tailcalls = prev.num_tailcalls + 1;

        let mut merged = cur;
        merged.expected_results = prev.expected_results;
        merged.num_tailcalls = tailcalls;
        merged.base -= diff;
        merged.saved_top -= diff;
        merged.varg_base -= diff;
        merged.return_slot -= diff;
        merged.is_entry = prev.is_entry;
        merged.is_coro_entry = prev.is_coro_entry;

        // Slide the callee's stack region down over the caller's.
        for idx in merged.return_slot..merged.saved_top {
            self.t.stack[idx] = self.t.stack[idx + diff];
        }

        self.t.frames.truncate(len - 2);
        self.t.frames.push(merged.clone());
        self.t.stack_base = merged.base;
        self.t.stack_index = merged.saved_top;
        self.t.unwind_dead_eh_frames();
    }

    // === Results ===

    /// Saves a run of stack values into the thread's result buffer and
    /// records it on the current activation record.
    pub(crate) fn save_results(&mut self, first: usize, num: usize) {
        let start = self.t.results.len();
        for i in 0..num {
            let v = self.t.stack[first + i];
            self.t.results.push(v);
        }
        let frame = self.t.current_frame_mut();
        frame.first_result = start;
        frame.num_results = num;
    }

    /// Pops the current activation record: copies its saved results to the
    /// return slot per the caller's expected count, closes upvalues above
    /// the frame, and restores the caller's stack view.
    pub(crate) fn call_epilogue(&mut self) {
        let frame = self.t.frames.last().expect("no frame to pop").clone();

        self.fire_ret_hook_quietly();
        self.close_upvals(frame.base);

        let num_results = frame.num_results;
        let first = frame.first_result;
        let expected = frame.expected_results;
        let dest = frame.return_slot;

        let final_count = if expected < 0 { num_results } else { expected as usize };
        self.t.ensure_stack(dest + final_count + 1);
        for i in 0..final_count {
            let v = if i < num_results {
                self.t.results[first + i]
            } else {
                Value::Null
            };
            self.t.stack[dest + i] = v;
        }
        self.t.results.truncate(first);
        self.last_results = final_count;

        self.t.frames.pop();
        self.t.unwind_dead_eh_frames();

        match self.t.frames.last() {
            Some(caller) => {
                self.t.stack_base = caller.base;
                self.t.stack_index = if expected < 0 { dest + final_count } else { caller.saved_top };
            }
            None => {
                self.t.stack_base = 0;
                self.t.stack_index = dest + final_count;
            }
        }
    }

    /// The `Ret` instruction: pops the frame, handling coroutine death when
    /// the popped frame was the coroutine body's entry.
    pub(crate) fn do_return(&mut self) -> VmResult<()> {
        let was_coro_entry = self.t.current_frame().is_coro_entry;
        self.call_epilogue();

        if was_coro_entry && self.t.frames.is_empty() {
            self.coroutine_died()?;
        }
        Ok(())
    }
}
