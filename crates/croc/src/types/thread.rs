//! The thread kind: a coroutine with its own value stack, activation-record
//! stack, exception-handler stack, open-upvalue list, and result buffer.

use std::rc::Rc;

use crate::{bytecode::FuncDefData, heap::HeapId, value::Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadState {
    /// Created but never resumed.
    Initial,
    /// Resumed another thread and is waiting for it to yield or die.
    Waiting,
    /// Currently executing.
    Running,
    /// Yielded; resumable.
    Suspended,
    /// Body returned or the thread was halted; no longer resumable.
    Dead,
}

impl ThreadState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Dead => "dead",
        }
    }
}

/// One function call in flight.
#[derive(Debug, Clone)]
pub(crate) struct ActRecord {
    /// Absolute stack slot of `this` for this call; registers are relative to it.
    pub base: usize,
    /// Stack top to restore when a fixed-result call completes.
    pub saved_top: usize,
    /// Start of the variadic argument block (== `base` for non-variadic calls).
    pub varg_base: usize,
    /// Absolute slot results are copied into on return.
    pub return_slot: usize,
    /// The running function; `None` for resume/yield bookkeeping records.
    pub func: Option<HeapId>,
    /// Shared body of the running script function, cached here so dispatch
    /// does not touch the heap per instruction.
    pub def: Option<Rc<FuncDefData>>,
    /// Word index into the body's code.
    pub pc: usize,
    /// Result count the caller expects; -1 means "all of them".
    pub expected_results: isize,
    /// Number of tail calls that reused this record.
    pub num_tailcalls: u32,
    /// Slice of the thread's result buffer holding saved returns.
    pub first_result: usize,
    pub num_results: usize,
    /// Unwind bookkeeping for returns/breaks crossing finally frames.
    pub unwind_counter: u32,
    pub unwind_return: Option<usize>,
    /// Marks a host entry: when this record pops, control returns to the host.
    pub is_entry: bool,
    /// Marks the initial call of a coroutine body: when this record pops, the
    /// thread dies and its return values become the final yields.
    pub is_coro_entry: bool,
}

impl ActRecord {
    pub fn blank() -> Self {
        Self {
            base: 0,
            saved_top: 0,
            varg_base: 0,
            return_slot: 0,
            func: None,
            def: None,
            pc: 0,
            expected_results: -1,
            num_tailcalls: 0,
            first_result: 0,
            num_results: 0,
            unwind_counter: 0,
            unwind_return: None,
            is_entry: false,
            is_coro_entry: false,
        }
    }
}

/// One exception-handler frame. `slot` is relative to the owning activation
/// record's base; `pc` is the handler (catch) or cleanup (finally) target.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EhFrame {
    pub is_catch: bool,
    pub slot: usize,
    pub pc: usize,
    /// Index into the thread's activation-record stack.
    pub act_record: usize,
}

/// Debug-hook event mask bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HookMask(pub u8);

impl HookMask {
    pub const CALL: u8 = 1;
    pub const RET: u8 = 2;
    pub const LINE: u8 = 4;
    pub const DELAY: u8 = 8;

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// Per-thread debug-hook configuration.
#[derive(Debug, Clone)]
pub(crate) struct DebugHook {
    pub func: Value,
    pub mask: HookMask,
    /// Instructions between `delay` events; 0 disables the delay hook.
    pub delay: u32,
    pub counter: u32,
}

#[derive(Debug)]
pub(crate) struct CrocThread {
    pub state: ThreadState,
    pub stack: Vec<Value>,
    /// One past the highest live slot.
    pub stack_index: usize,
    /// Base of the current frame (mirrors `frames.last().base`).
    pub stack_base: usize,
    pub frames: Vec<ActRecord>,
    pub eh_frames: Vec<EhFrame>,
    /// Open upvalue boxes, sorted by descending stack slot.
    pub open_upvals: Vec<HeapId>,
    /// Multi-return save buffer.
    pub results: Vec<Value>,
    /// Number of values produced by the last yield (or final return).
    pub num_yields: usize,
    /// The body function a coroutine runs when first resumed.
    pub coro_func: Option<HeapId>,
    /// The thread that resumed this one; exception propagation and yields
    /// travel along this link.
    pub resumed_by: Option<HeapId>,
    /// Set by `halt` on a non-running thread; checked between instructions.
    pub pending_halt: bool,
    /// Depth of native frames on this thread; yielding across them is an error.
    pub native_call_depth: u32,
    pub hook: Option<DebugHook>,
    /// Cleared while the hook function itself runs.
    pub hooks_enabled: bool,
    /// Source line of the previously executed instruction, for line hooks.
    pub last_hook_line: u32,
}

impl CrocThread {
    pub fn new() -> Self {
        Self {
            state: ThreadState::Initial,
            stack: vec![Value::Null; 32],
            stack_index: 1,
            stack_base: 0,
            frames: Vec::new(),
            eh_frames: Vec::new(),
            open_upvals: Vec::new(),
            results: Vec::new(),
            num_yields: 0,
            coro_func: None,
            resumed_by: None,
            pending_halt: false,
            native_call_depth: 0,
            hook: None,
            hooks_enabled: true,
            last_hook_line: 0,
        }
    }

    pub fn new_coroutine(body: HeapId) -> Self {
        let mut t = Self::new();
        t.coro_func = Some(body);
        t
    }

    /// Grows the backing store so slots below `needed` are addressable,
    /// null-filling new space.
    pub fn ensure_stack(&mut self, needed: usize) {
        if needed > self.stack.len() {
            let target = needed.max(self.stack.len() * 2);
            self.stack.resize(target, Value::Null);
        }
    }

    pub fn current_frame(&self) -> &ActRecord {
        self.frames.last().expect("no activation record")
    }

    pub fn current_frame_mut(&mut self) -> &mut ActRecord {
        self.frames.last_mut().expect("no activation record")
    }

    /// Pops EH frames belonging to already-popped activation records.
    pub fn unwind_dead_eh_frames(&mut self) {
        while let Some(f) = self.eh_frames.last() {
            if f.act_record >= self.frames.len() {
                self.eh_frames.pop();
            } else {
                break;
            }
        }
    }
}
