//! The debug-hook protocol.
//!
//! A per-thread hook function can fire on four events: `call` (and
//! `tailcall`) at call prologue, `ret` at epilogue, `line` when execution
//! crosses a source line (or jumps backward), and `delay` every N
//! instructions. Hooks are disabled while the hook function itself runs.

use crate::{
    bytecode::FuncDefData,
    errors::VmResult,
    types::HookMask,
    value::Value,
    vm::Interp,
};

impl Interp<'_> {
    fn call_hook(&mut self, event: &str) -> VmResult<()> {
        let Some(hook) = self.t.hook.clone() else {
            return Ok(());
        };
        if !self.t.hooks_enabled {
            return Ok(());
        }
        self.t.hooks_enabled = false;
        let ev = Value::Str(self.vm.interns.intern(event));
        let result = self.call_sync(hook.func, Value::Null, &[ev], 0);
        self.t.hooks_enabled = true;
        result.map(|_| ())
    }

    /// Between-instruction checks: the delay counter and line transitions.
    pub(crate) fn fire_instruction_hooks(&mut self, def: &FuncDefData, pc: usize) -> VmResult<()> {
        let Some(hook) = &self.t.hook else { return Ok(()) };
        let mask = hook.mask;

        if mask.has(HookMask::DELAY) && hook.delay > 0 {
            let hook = self.t.hook.as_mut().expect("checked above");
            hook.counter = hook.counter.saturating_sub(1);
            if hook.counter == 0 {
                let delay = hook.delay;
                self.t.hook.as_mut().expect("checked above").counter = delay;
                self.call_hook("delay")?;
            }
        }

        if mask.has(HookMask::LINE) {
            let line = def.line_at(pc);
            // Fires at function entry, on a line change, and on backward
            // jumps (each loop iteration revisits its first line).
            if pc == 0 || line != self.t.last_hook_line {
                self.t.last_hook_line = line;
                self.call_hook("line")?;
            }
        }

        Ok(())
    }

    pub(crate) fn fire_call_hook(&mut self, is_tail: bool) -> VmResult<()> {
        let fires = self.t.hook.as_ref().is_some_and(|h| h.mask.has(HookMask::CALL));
        if fires {
            self.call_hook(if is_tail { "tailcall" } else { "call" })?;
        }
        Ok(())
    }

    /// The return hook fires from the epilogue, which has no error channel;
    /// a throwing hook function is deliberately swallowed here.
    pub(crate) fn fire_ret_hook_quietly(&mut self) {
        let fires = self.t.hook.as_ref().is_some_and(|h| h.mask.has(HookMask::RET));
        if fires {
            let _ = self.call_hook("ret");
        }
    }
}
