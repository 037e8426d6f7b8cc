//! The function kinds: native host callbacks and script closures, plus the
//! funcdef object that wraps a compiled body when exposed as a value.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    bytecode::FuncDefData,
    errors::VmResult,
    heap::{Heap, HeapData, HeapId},
    intern::StringId,
    run::NativeCtx,
    value::Value,
};

/// Values returned by a native function, copied into the caller's frame by
/// the same epilogue path script returns take.
pub(crate) type NativeRets = SmallVec<[Value; 4]>;

/// A native host callback. Receives the interpreter context, the `this`
/// value, and the argument values; returns the result tuple.
pub(crate) type NativeFn = fn(&mut NativeCtx<'_, '_>) -> VmResult<NativeRets>;

#[derive(Debug)]
pub(crate) enum Function {
    Native {
        name: StringId,
        func: NativeFn,
        /// Environment namespace for global lookups made on behalf of the host.
        env: HeapId,
        /// Fixed upvalue slots, stored inline as plain values.
        upvals: Vec<Value>,
    },
    Script {
        def: Rc<FuncDefData>,
        env: HeapId,
        /// One captured upvalue box per entry in the funcdef's upvalue table.
        upvals: Vec<HeapId>,
    },
}

impl Function {
    pub fn name(&self, _heap: &Heap) -> StringId {
        match self {
            Self::Native { name, .. } => *name,
            Self::Script { def, .. } => def.name,
        }
    }

    pub fn env(&self) -> HeapId {
        match self {
            Self::Native { env, .. } | Self::Script { env, .. } => *env,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native { .. })
    }

    pub fn script_def(&self) -> Option<&Rc<FuncDefData>> {
        match self {
            Self::Script { def, .. } => Some(def),
            Self::Native { .. } => None,
        }
    }
}

/// A compiled-but-uninstantiated function body exposed as a first-class
/// value (the result of `compileModule` and friends).
#[derive(Debug)]
pub(crate) struct FuncdefObj {
    pub data: Rc<FuncDefData>,
    /// Pins the first instantiation: a funcdef instantiated once with some
    /// environment refuses other environments, and upvalue-free funcdefs
    /// reuse the cached closure.
    pub cached_func: Option<HeapId>,
    pub cached_env: Option<HeapId>,
}

impl FuncdefObj {
    pub fn new(data: Rc<FuncDefData>) -> Self {
        Self {
            data,
            cached_func: None,
            cached_env: None,
        }
    }
}

/// Instantiates a funcdef object with an environment, honoring the cache
/// pin. Returns `None` when the funcdef was already bound to a different
/// environment.
pub(crate) fn instantiate_funcdef(heap: &mut Heap, funcdef_id: HeapId, env: HeapId) -> Option<HeapId> {
    let (data, cached_func, cached_env) = {
        let HeapData::Funcdef(fd) = heap.get(funcdef_id) else {
            return None;
        };
        (Rc::clone(&fd.data), fd.cached_func, fd.cached_env)
    };

    if let Some(bound) = cached_env {
        if bound != env {
            return None;
        }
        if let Some(f) = cached_func {
            return Some(f);
        }
    }

    if !data.upvals.is_empty() {
        // Closures with captures are created by the Closure instruction,
        // which supplies the upvalue boxes; a bare instantiation is only
        // valid for capture-free bodies.
        return None;
    }

    let func = heap.allocate(HeapData::Function(Function::Script {
        def: data,
        env,
        upvals: Vec::new(),
    }));

    if let HeapData::Funcdef(fd) = heap.get_mut(funcdef_id) {
        fd.cached_func = Some(func);
        fd.cached_env = Some(env);
    }

    Some(func)
}
