//! Exception propagation: throw, unwind, and traceback capture.
//!
//! A throw fills the exception's `location` and `traceback` fields if still
//! unset, then unwinds activation records and handler frames - crossing
//! thread resume boundaries - until a handler is found. Finally frames
//! encountered on the way run with the exception pending; `EndFinal`
//! rethrows. The halt signal takes the same path but refuses to stop at
//! catch frames.

use crate::{
    errors::{CrocError, ExcKind, VmResult},
    heap::{HeapData, HeapId},
    types::{Array, ThreadState},
    value::Value,
    vm::Interp,
};

impl Interp<'_> {
    pub(crate) fn pending_exc_take(&mut self) -> Option<CrocError> {
        self.vm.pending_exc.take()
    }

    /// `PushCatch`/`PushFinally`: installs a handler frame owned by the
    /// current activation record.
    pub(crate) fn push_eh_frame(&mut self, is_catch: bool, slot: usize, pc: usize) {
        let act_record = self.t.frames.len() - 1;
        self.t.eh_frames.push(crate::types::EhFrame {
            is_catch,
            slot,
            pc,
            act_record,
        });
    }

    /// The `Throw` instruction: only instances may be thrown.
    pub(crate) fn throw_value(&mut self, v: Value, rethrowing: bool) -> VmResult<()> {
        let is_instance = matches!(v, Value::Ref(id) if matches!(self.vm.heap.get(id), HeapData::Instance(_)));
        if !is_instance {
            let kind = v.kind(&self.vm.heap).name();
            let err = self
                .vm
                .make_exc(ExcKind::TypeError, format!("Only instances can be thrown, not '{kind}'"));
            return self.throw_error(err);
        }
        if rethrowing {
            self.throw_error_rethrow(CrocError::Exc(v))
        } else {
            self.throw_error(CrocError::Exc(v))
        }
    }

    /// Routes a runtime error to its handler, attaching location and
    /// traceback on the first throw.
    pub(crate) fn throw_error(&mut self, err: CrocError) -> VmResult<()> {
        if let CrocError::Exc(v) = err {
            self.add_location_info(v);
        }
        self.unwind_to_handler(err)
    }

    /// Rethrow: the original location and traceback are preserved.
    pub(crate) fn throw_error_rethrow(&mut self, err: CrocError) -> VmResult<()> {
        self.unwind_to_handler(err)
    }

    /// Fills `location` and `traceback` on the exception instance when the
    /// location is still null (i.e. this is the initial throw).
    fn add_location_info(&mut self, exc: Value) {
        let Value::Ref(exc_id) = exc else { return };

        let already_set = match self.vm.heap.get(exc_id) {
            HeapData::Instance(inst) => inst
                .get_field(self.vm.wk.location)
                .is_some_and(|l| !l.is_null()),
            _ => true,
        };
        if already_set {
            return;
        }

        let traceback = self.capture_traceback();
        let location = traceback.first().copied().unwrap_or(Value::Null);
        let tb_array = self.vm.heap.allocate(HeapData::Array(Array::from_values(traceback)));

        let loc_key = self.vm.wk.location;
        let tb_key = self.vm.wk.traceback;
        if let HeapData::Instance(inst) = self.vm.heap.get_mut(exc_id) {
            inst.set_field(loc_key, location);
            inst.set_field(tb_key, Value::Ref(tb_array));
        }
    }

    /// Snapshot of the current activation stack as Location instances,
    /// innermost first.
    fn capture_traceback(&mut self) -> Vec<Value> {
        let mut locs: Vec<(crate::intern::StringId, u32, u32)> = Vec::new();
        for frame in self.t.frames.iter().rev() {
            if let Some(def) = &frame.def {
                let pc = frame.pc.min(def.code.len().saturating_sub(1));
                locs.push((def.file, def.line_at(pc), def.col));
            }
            if frame.num_tailcalls > 0 {
                // Frames elided by tail calls are marked, not enumerated.
                if let Some(def) = &frame.def {
                    locs.push((def.file, def.line, def.col));
                }
            }
        }
        locs.into_iter().map(|(f, l, c)| self.vm.make_location(f, l, c)).collect()
    }

    /// Core unwinding: pops activation records and handler frames, running
    /// across the resumed-by chain, until a frame takes the error.
    fn unwind_to_handler(&mut self, err: CrocError) -> VmResult<()> {
        let is_halt = matches!(err, CrocError::Halt);

        // Unwind bookkeeping of an interrupted return is cancelled.
        if let Some(frame) = self.t.frames.last_mut() {
            frame.unwind_counter = 0;
            frame.unwind_return = None;
        }

        loop {
            // Innermost host entry on this thread; handlers below it belong
            // to an outer native invocation and cannot be reached directly.
            let entry_boundary = self.t.frames.iter().rposition(|f| f.is_entry);

            // Find the topmost live EH frame within the boundary.
            let handler = self.t.eh_frames.iter().rposition(|f| {
                f.act_record < self.t.frames.len() && entry_boundary.is_none_or(|b| f.act_record >= b)
            });

            if let Some(idx) = handler {
                let frame = self.t.eh_frames[idx];
                if is_halt && frame.is_catch {
                    // Halts skip catch frames but still run finallys.
                    self.t.eh_frames.remove(idx);
                    continue;
                }

                self.t.eh_frames.truncate(idx);

                // Pop activation records above the handler's owner.
                while self.t.frames.len() > frame.act_record + 1 {
                    self.pop_frame_for_unwind();
                }

                let owner = self.t.current_frame().clone();
                let abs_slot = owner.base + frame.slot;
                self.close_upvals(abs_slot);
                self.t.stack_base = owner.base;
                if self.t.stack_index <= abs_slot {
                    self.t.stack_index = abs_slot + 1;
                }
                for i in abs_slot + 1..self.t.stack_index {
                    self.t.stack[i] = Value::Null;
                }

                if frame.is_catch {
                    let CrocError::Exc(v) = err else {
                        unreachable!("halts never stop at catch frames")
                    };
                    self.t.stack[abs_slot] = v;
                    self.vm.pending_exc = None;
                } else {
                    // A finally runs with the exception pending; EndFinal
                    // rethrows it.
                    self.vm.pending_exc = Some(err);
                }

                self.t.current_frame_mut().pc = frame.pc;
                return Ok(());
            }

            // No handler on this thread within the boundary.
            if let Some(boundary) = entry_boundary {
                // Unwind to the host entry and hand the error to the native
                // caller.
                while self.t.frames.len() > boundary {
                    self.pop_frame_for_unwind();
                }
                self.t.unwind_dead_eh_frames();
                if let Some(frame) = self.t.frames.last() {
                    self.t.stack_base = frame.base;
                }
                return Err(err);
            }

            // A coroutine with no handler dies; the error continues in the
            // thread that resumed it - unless it was a halt, which the
            // resumer does not observe.
            while !self.t.frames.is_empty() {
                self.pop_frame_for_unwind();
            }
            self.t.unwind_dead_eh_frames();
            self.t.state = ThreadState::Dead;
            self.t.num_yields = 0;

            let Some(resumer) = self.t.resumed_by.take() else {
                // Nothing resumed this thread: the error is unhandled.
                return Err(err);
            };

            self.switch_to_thread(resumer);
            if is_halt {
                // The halted coroutine simply stops; its resumer continues
                // with zero yielded values.
                self.finish_resume_with_yields(0);
                return Ok(());
            }
            // Drop the resume record, then keep unwinding on the resumer.
            self.t.frames.pop();
            self.t.unwind_dead_eh_frames();
            if let Some(frame) = self.t.frames.last() {
                self.t.stack_base = frame.base;
                self.t.stack_index = frame.saved_top;
            }
        }
    }

    /// Pops one activation record during unwinding (results and hooks are
    /// not involved; values die with the frame).
    fn pop_frame_for_unwind(&mut self) {
        if let Some(frame) = self.t.frames.pop() {
            self.close_upvals(frame.base);
            self.t.results.truncate(frame.first_result.min(self.t.results.len()));
        }
        self.t.unwind_dead_eh_frames();
    }

    /// The `Unwind` instruction and its `EndFinal` continuation: runs `N`
    /// pending handler frames (executing finallys) before resuming at the
    /// recorded return point.
    pub(crate) fn unwind(&mut self) -> VmResult<()> {
        loop {
            let counter = self.t.current_frame().unwind_counter;
            if counter == 0 {
                let ret = self.t.current_frame_mut().unwind_return.take().expect("unwind target");
                self.t.current_frame_mut().pc = ret;
                return Ok(());
            }

            let frame = *self.t.eh_frames.last().expect("unwind with no EH frame");
            debug_assert_eq!(frame.act_record + 1, self.t.frames.len());
            self.t.eh_frames.pop();

            let base = self.t.current_frame().base;
            self.close_upvals(base + frame.slot);
            self.t.current_frame_mut().unwind_counter -= 1;

            if !frame.is_catch {
                // A finally in the middle of the unwind: run it; EndFinal
                // re-enters this loop.
                self.t.current_frame_mut().pc = frame.pc;
                return Ok(());
            }
        }
    }

    /// Entry for halting a thread by id from native code.
    pub(crate) fn halt_thread(&mut self, id: HeapId) -> VmResult<()> {
        if id == self.t_id {
            return Err(CrocError::Halt);
        }
        if let HeapData::Thread(t) = self.vm.heap.get_mut(id) {
            t.pending_halt = true;
        }
        Ok(())
    }
}
