//! Coroutine scheduling: resume, yield, and death.
//!
//! Exactly one thread is detached from the heap at a time. Resume stores the
//! caller back into its slot (state `Waiting`), detaches the callee, and
//! either starts its body or continues its pending yield. Yield reverses the
//! swap, copying the yielded values into the resumer's frame.

use crate::{
    errors::{ExcKind, VmResult},
    heap::{HeapData, HeapId},
    types::{ActRecord, ThreadState},
    value::Value,
    vm::Interp,
};

impl Interp<'_> {
    /// Swaps the detached thread: the current one goes back into the heap,
    /// `target` comes out.
    pub(crate) fn switch_to_thread(&mut self, target: HeapId) {
        let incoming = self.vm.heap.detach_thread(target);
        let outgoing = std::mem::replace(&mut self.t, incoming);
        self.vm.heap.attach_thread(self.t_id, outgoing);
        self.t_id = target;
    }

    /// Calling a thread resumes it. `slot` holds the thread value, `slot+1`
    /// the `this`, arguments follow; yields land at `slot` like call results.
    pub(crate) fn resume_thread(
        &mut self,
        thread_id: HeapId,
        slot: usize,
        expected: isize,
        num_params: usize,
    ) -> VmResult<()> {
        if thread_id == self.t_id {
            return Err(self
                .vm
                .make_exc(ExcKind::StateError, "Attempting to resume the currently-running thread"));
        }

        let state = match self.vm.heap.get(thread_id) {
            HeapData::Thread(t) => t.state,
            _ => unreachable!("checked by the caller"),
        };
        match state {
            ThreadState::Initial | ThreadState::Suspended => {}
            other => {
                return Err(self.vm.make_exc(
                    ExcKind::StateError,
                    format!("Attempting to resume a thread that is in the '{}' state", other.name()),
                ));
            }
        }

        // The resume record on the caller: yields are its "results".
        let record = ActRecord {
            base: slot,
            saved_top: self.t.stack_index,
            varg_base: slot,
            return_slot: slot,
            func: None,
            def: None,
            pc: self.t.frames.last().map_or(0, |f| f.pc),
            expected_results: expected,
            num_tailcalls: 0,
            first_result: self.t.results.len(),
            num_results: 0,
            unwind_counter: 0,
            unwind_return: None,
            is_entry: false,
            is_coro_entry: false,
        };
        // Arguments travel to the callee: this + args.
        let args: Vec<Value> = self.t.stack[slot + 1..slot + 1 + num_params].to_vec();
        self.t.frames.push(record);
        self.t.state = ThreadState::Waiting;

        let caller = self.t_id;
        self.switch_to_thread(thread_id);
        self.t.resumed_by = Some(caller);
        self.t.state = ThreadState::Running;

        match state {
            ThreadState::Initial => {
                let body = self.t.coro_func.expect("coroutine has a body function");
                self.t.ensure_stack(2 + args.len());
                self.t.stack[1] = Value::Ref(body);
                for (i, &a) in args.iter().enumerate() {
                    self.t.stack[2 + i] = a;
                }
                self.t.stack_index = 2 + args.len();

                let pushed = self.call_prologue(1, -1, args.len() as isize, false)?;
                debug_assert!(pushed, "coroutine bodies are script functions");
                self.t.current_frame_mut().is_coro_entry = true;
                Ok(())
            }
            ThreadState::Suspended => {
                // Resume values (the arguments sans `this`) become the
                // pending yield expression's results.
                let resumed_with = &args[1..];
                let first = self.t.stack_index;
                self.t.ensure_stack(first + resumed_with.len() + 1);
                for (i, &v) in resumed_with.iter().enumerate() {
                    self.t.stack[first + i] = v;
                }
                self.save_results(first, resumed_with.len());
                self.call_epilogue();
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    /// The `Yield` instruction: saves the yielded run, suspends, and control
    /// returns to the resumer.
    pub(crate) fn do_yield(&mut self, first_value: usize, num_values: isize, num_results: isize) -> VmResult<()> {
        if self.t.resumed_by.is_none() {
            return Err(self
                .vm
                .make_exc(ExcKind::RuntimeError, "Attempting to yield out of the main thread"));
        }
        if self.t.native_call_depth > 0 {
            return Err(self.vm.make_exc(
                ExcKind::RuntimeError,
                "Attempting to yield across native / metamethod call boundary",
            ));
        }

        // A bookkeeping record marks the yield point; resuming pops it,
        // copying the resume values to the yield expression's registers.
        let mut record = self.t.current_frame().clone();
        record.func = None;
        record.def = None;
        record.return_slot = first_value;
        record.expected_results = num_results;
        record.first_result = self.t.results.len();
        record.num_results = 0;
        record.is_entry = false;
        record.is_coro_entry = false;
        self.t.frames.push(record);

        let num = if num_values < 0 {
            self.t.stack_index - first_value
        } else {
            self.t.stack_index = first_value + num_values as usize;
            num_values as usize
        };
        self.t.num_yields = num;
        self.t.state = ThreadState::Suspended;

        self.return_yields_to_resumer(num)
    }

    /// A coroutine body returned: the thread dies and its return values are
    /// the final yields.
    pub(crate) fn coroutine_died(&mut self) -> VmResult<()> {
        self.t.state = ThreadState::Dead;
        let num = self.last_results;
        // The epilogue left the results at the entry's return slot (1).
        self.t.stack_index = 1 + num;
        self.t.num_yields = num;
        self.return_yields_to_resumer(num)
    }

    fn return_yields_to_resumer(&mut self, num_yields: usize) -> VmResult<()> {
        let Some(resumer) = self.t.resumed_by.take() else {
            return Err(self
                .vm
                .make_exc(ExcKind::RuntimeError, "Yield with no thread to yield to"));
        };
        // Copy the yielded values out before switching; a suspended thread
        // keeps its resumed_by link clear until the next resume.
        let first = self.t.stack_index - num_yields;
        let yields: Vec<Value> = self.t.stack[first..first + num_yields].to_vec();
        self.t.stack_index = first;

        self.switch_to_thread(resumer);
        self.t.state = ThreadState::Running;
        self.finish_resume_with_values(&yields);
        Ok(())
    }

    /// Completes the resume record on the (now current) resumer with the
    /// yielded values.
    pub(crate) fn finish_resume_with_values(&mut self, yields: &[Value]) {
        let first = self.t.stack_index;
        self.t.ensure_stack(first + yields.len() + 1);
        for (i, &v) in yields.iter().enumerate() {
            self.t.stack[first + i] = v;
        }
        self.save_results(first, yields.len());
        self.call_epilogue();
    }

    pub(crate) fn finish_resume_with_yields(&mut self, num: usize) {
        debug_assert_eq!(num, 0);
        self.finish_resume_with_values(&[]);
    }
}
