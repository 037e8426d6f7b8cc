//! The VM root object and the host embedding surface.
//!
//! [`Vm`] owns the heap, the intern table, the global namespace, the
//! standard-exception class registry, the per-type metatables, and the module
//! registry. Hosts compile and run modules, call script values, and receive
//! results as [`Object`]s; script failures surface as [`Exception`]s with
//! location and traceback.

use ahash::{AHashMap, AHashSet};
use smallvec::smallvec;

use crate::{
    compiler::{self, CompiledModule, CompilerFlags},
    errors::{CodeLoc, CrocError, ExcKind, Exception, VmResult},
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    io::{PrintWriter, StdPrint},
    object::Object,
    types::{
        Array, Class, CrocThread, DebugHook, Function, FuncdefObj, HookMask, Instance, Namespace, NativeFn,
        NativeRets, ThreadState,
    },
    value::{CrocType, Value},
    vm::{
        Interp,
        meta::{Metamethod, NUM_METAMETHODS},
    },
};

/// Interned ids for names the VM itself needs constantly.
#[derive(Debug)]
pub(crate) struct WellKnown {
    pub this_: StringId,
    pub constructor: StringId,
    pub msg: StringId,
    pub location: StringId,
    pub traceback: StringId,
    pub cause: StringId,
    pub file: StringId,
    pub line: StringId,
    pub col: StringId,
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) interns: Interns,
    /// The root global namespace; module namespaces chain to it.
    pub(crate) globals: HeapId,
    pub(crate) main_thread: HeapId,
    pub(crate) writer: Box<dyn PrintWriter>,
    /// Standard exception classes, by kind.
    pub(crate) exc_classes: AHashMap<&'static str, HeapId>,
    pub(crate) location_class: HeapId,
    /// Per-type metamethod namespaces, indexed by `CrocType` discriminant.
    pub(crate) type_metatables: [Option<HeapId>; 17],
    /// Metamethod name ids, indexed by `Metamethod` position.
    pub(crate) mm_names: Vec<StringId>,
    pub(crate) wk: WellKnown,
    /// Loaded module namespaces by name.
    pub(crate) modules: AHashMap<StringId, HeapId>,
    /// Host-registered module sources, resolved by `modules.load`.
    pub(crate) module_sources: AHashMap<StringId, String>,
    /// Modules currently loading, for circular-import detection.
    pub(crate) loading: AHashSet<StringId>,
    pub(crate) flags: CompilerFlags,
    /// Values the host holds across VM calls; collector roots.
    pub(crate) temp_roots: Vec<Value>,
    /// Optional script-level unhandled-exception handler.
    pub(crate) unhandled: Option<Value>,
    /// The in-flight exception while a `finally` block runs; rethrown by
    /// `EndFinal`.
    pub(crate) pending_exc: Option<CrocError>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").field("live_objects", &self.heap.live_objects()).finish()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        Self::with_writer(Box::new(StdPrint))
    }

    #[must_use]
    pub fn with_writer(writer: Box<dyn PrintWriter>) -> Self {
        let mut heap = Heap::new();
        let mut interns = Interns::new();

        let globals_name = interns.intern("_G");
        let globals = heap.allocate(HeapData::Namespace(Namespace::new(globals_name)));
        let main_thread = heap.allocate(HeapData::Thread(Box::new(CrocThread::new())));

        let wk = WellKnown {
            this_: interns.intern("this"),
            constructor: interns.intern("constructor"),
            msg: interns.intern("msg"),
            location: interns.intern("location"),
            traceback: interns.intern("traceback"),
            cause: interns.intern("cause"),
            file: interns.intern("file"),
            line: interns.intern("line"),
            col: interns.intern("col"),
        };

        let mm_names = Metamethod::intern_all(&mut interns);
        debug_assert_eq!(mm_names.len(), NUM_METAMETHODS);

        let mut vm = Self {
            heap,
            interns,
            globals,
            main_thread,
            writer,
            exc_classes: AHashMap::new(),
            location_class: globals, // placeholder until init
            type_metatables: [None; 17],
            mm_names,
            wk,
            modules: AHashMap::new(),
            module_sources: AHashMap::new(),
            loading: AHashSet::new(),
            flags: CompilerFlags::default(),
            temp_roots: Vec::new(),
            unhandled: None,
            pending_exc: None,
        };

        vm.init_exception_registry();
        vm.init_base_globals();
        vm.init_type_metatables();
        vm
    }

    pub(crate) fn mm_name(&self, mm: Metamethod) -> StringId {
        let idx = Metamethod::ALL.iter().position(|&m| m == mm).expect("known metamethod");
        self.mm_names[idx]
    }

    // === Setup ===

    /// Builds the standard exception classes and binds them as globals. All
    /// kinds derive from `Exception`, which declares the `msg`, `location`,
    /// `traceback`, and `cause` fields and a constructor taking the message.
    fn init_exception_registry(&mut self) {
        let exc_name = self.interns.intern("Exception");
        let mut base = Class::new(exc_name);
        for field in [self.wk.msg, self.wk.location, self.wk.traceback, self.wk.cause] {
            base.add_field(field, Value::Null, false);
        }
        let ctor_name = self.wk.constructor;
        base.add_method(ctor_name, Value::Null, false);
        let base_id = self.heap.allocate(HeapData::Class(base));
        let ctor = self.new_native_func("constructor", native_exception_ctor);
        if let HeapData::Class(c) = self.heap.get_mut(base_id) {
            c.add_method(ctor_name, Value::Ref(ctor), true);
        }
        self.set_global_raw(exc_name, Value::Ref(base_id));
        self.exc_classes.insert("Exception", base_id);

        for kind in ExcKind::ALL {
            let name: &'static str = (*kind).into();
            if name == "Exception" {
                continue;
            }
            let name_id = self.interns.intern(name);
            let mut class = Class::new(name_id);
            let (base_copy_methods, base_copy_fields): (Vec<_>, Vec<_>) = {
                let HeapData::Class(base) = self.heap.get(base_id) else { unreachable!() };
                (base.methods().collect(), base.fields().collect())
            };
            for (k, v) in base_copy_methods {
                class.add_method(k, v, false);
            }
            for (k, v) in base_copy_fields {
                class.add_field(k, v, false);
            }
            class.parent = Some(base_id);
            let id = self.heap.allocate(HeapData::Class(class));
            self.set_global_raw(name_id, Value::Ref(id));
            self.exc_classes.insert(name, id);
        }

        // Location objects carried on exceptions and tracebacks.
        let loc_name = self.interns.intern("Location");
        let mut loc_class = Class::new(loc_name);
        loc_class.add_field(self.wk.file, Value::Null, false);
        loc_class.add_field(self.wk.line, Value::Int(0), false);
        loc_class.add_field(self.wk.col, Value::Int(0), false);
        loc_class.freeze();
        let loc_id = self.heap.allocate(HeapData::Class(loc_class));
        self.set_global_raw(loc_name, Value::Ref(loc_id));
        self.location_class = loc_id;
    }

    fn init_base_globals(&mut self) {
        self.register_global_native("write", native_write);
        self.register_global_native("writeln", native_writeln);
        self.register_global_native("toString", native_to_string);
        self.register_global_native("typeof", native_typeof);
        self.register_global_native("weakref", native_weakref);
        self.register_global_native("deref", native_deref);
        self.register_global_native("memblock", native_memblock);

        // The `thread` namespace: coroutine construction and inspection.
        let ns_name = self.interns.intern("thread");
        let ns = Namespace::new(ns_name);
        let ns_id = self.heap.allocate(HeapData::Namespace(ns));
        self.register_ns_native(ns_id, "new", native_thread_new);
        self.register_ns_native(ns_id, "state", native_thread_state);
        self.register_ns_native(ns_id, "halt", native_thread_halt);
        self.set_global_raw(ns_name, Value::Ref(ns_id));

        // The `modules` namespace: the loader the import statement lowers to.
        let m_name = self.interns.intern("modules");
        let m_ns = Namespace::new(m_name);
        let m_id = self.heap.allocate(HeapData::Namespace(m_ns));
        self.register_ns_native(m_id, "load", native_modules_load);
        self.set_global_raw(m_name, Value::Ref(m_id));
    }

    /// Installs `opApply` for the built-in iterable kinds so `foreach` works
    /// over arrays, tables, namespaces, and strings.
    fn init_type_metatables(&mut self) {
        let protocols: [(CrocType, NativeFn); 4] = [
            (CrocType::Array, native_array_apply),
            (CrocType::Table, native_table_apply),
            (CrocType::Namespace, native_namespace_apply),
            (CrocType::String, native_string_apply),
        ];
        for (kind, apply) in protocols {
            let mt_name = self.interns.intern(kind.name());
            let mt = self.heap.allocate(HeapData::Namespace(Namespace::new(mt_name)));
            let apply_name = self.mm_name(Metamethod::Apply);
            let f = self.new_native_func("opApply", apply);
            if let HeapData::Namespace(ns) = self.heap.get_mut(mt) {
                ns.set(apply_name, Value::Ref(f));
            }
            self.type_metatables[kind as usize] = Some(mt);
        }
    }

    pub(crate) fn new_native_func(&mut self, name: &str, func: NativeFn) -> HeapId {
        let name_id = self.interns.intern(name);
        self.heap.allocate(HeapData::Function(Function::Native {
            name: name_id,
            func,
            env: self.globals,
            upvals: Vec::new(),
        }))
    }

    fn register_global_native(&mut self, name: &str, func: NativeFn) {
        let f = self.new_native_func(name, func);
        let name_id = self.interns.intern(name);
        self.set_global_raw(name_id, Value::Ref(f));
    }

    fn register_ns_native(&mut self, ns: HeapId, name: &str, func: NativeFn) {
        let f = self.new_native_func(name, func);
        let name_id = self.interns.intern(name);
        if let HeapData::Namespace(n) = self.heap.get_mut(ns) {
            n.set(name_id, Value::Ref(f));
        }
    }

    pub(crate) fn set_global_raw(&mut self, name: StringId, value: Value) {
        let globals = self.globals;
        if let HeapData::Namespace(ns) = self.heap.get_mut(globals) {
            ns.set(name, value);
        }
    }

    // === Error construction ===

    pub(crate) fn exc_class(&self, kind: ExcKind) -> HeapId {
        let name: &'static str = kind.into();
        *self.exc_classes.get(name).expect("registered exception kind")
    }

    /// Creates an instance of a standard exception class with its message
    /// set; location and traceback are filled at throw time.
    pub(crate) fn make_exc(&mut self, kind: ExcKind, msg: impl Into<String>) -> CrocError {
        let class_id = self.exc_class(kind);
        let inst = self.instantiate_raw(class_id);
        let msg_id = self.interns.intern(&msg.into());
        if let HeapData::Instance(i) = self.heap.get_mut(inst) {
            i.set_field(self.wk.msg, Value::Str(msg_id));
        }
        CrocError::Exc(Value::Ref(inst))
    }

    /// Allocates an instance without running any constructor.
    pub(crate) fn instantiate_raw(&mut self, class_id: HeapId) -> HeapId {
        if let HeapData::Class(c) = self.heap.get_mut(class_id) {
            c.freeze();
        }
        let (fields, hidden) = {
            let HeapData::Class(c) = self.heap.get(class_id) else {
                panic!("instantiate of a non-class");
            };
            (c.fields().collect(), c.hidden_fields().collect())
        };
        self.heap.allocate(HeapData::Instance(Instance::new(class_id, fields, hidden)))
    }

    pub(crate) fn make_location(&mut self, file: StringId, line: u32, col: u32) -> Value {
        let inst = self.instantiate_raw(self.location_class);
        if let HeapData::Instance(i) = self.heap.get_mut(inst) {
            i.set_field(self.wk.file, Value::Str(file));
            i.set_field(self.wk.line, Value::Int(i64::from(line)));
            i.set_field(self.wk.col, Value::Int(i64::from(col)));
        }
        Value::Ref(inst)
    }

    /// Converts an in-flight runtime error into the host-facing form.
    pub(crate) fn exception_from_error(&mut self, err: CrocError) -> Exception {
        match err {
            CrocError::Halt => Exception {
                kind: "HaltException".to_owned(),
                message: "thread halted".to_owned(),
                location: None,
                traceback: Vec::new(),
            },
            CrocError::Exc(v) => self.exception_from_value(v),
        }
    }

    pub(crate) fn exception_from_value(&mut self, v: Value) -> Exception {
        let Value::Ref(id) = v else {
            return Exception {
                kind: "Exception".to_owned(),
                message: v.stringify(&self.heap, &self.interns),
                location: None,
                traceback: Vec::new(),
            };
        };

        let (class_id, msg, location, traceback) = match self.heap.get(id) {
            HeapData::Instance(inst) => (
                Some(inst.class),
                inst.get_field(self.wk.msg),
                inst.get_field(self.wk.location),
                inst.get_field(self.wk.traceback),
            ),
            _ => (None, None, None, None),
        };

        let kind = match class_id {
            Some(cid) => match self.heap.get(cid) {
                HeapData::Class(c) => self.interns.get(c.name).to_owned(),
                _ => "Exception".to_owned(),
            },
            None => "Exception".to_owned(),
        };

        let message = match msg {
            Some(Value::Str(s)) => self.interns.get(s).to_owned(),
            Some(other) if !other.is_null() => other.stringify(&self.heap, &self.interns),
            _ => String::new(),
        };

        let location = location.and_then(|l| self.code_loc_of(l));
        let traceback = match traceback {
            Some(Value::Ref(tb)) => match self.heap.get(tb) {
                HeapData::Array(a) => {
                    let locs: Vec<Value> = a.values().to_vec();
                    locs.into_iter().filter_map(|l| self.code_loc_of(l)).collect()
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        Exception {
            kind,
            message,
            location,
            traceback,
        }
    }

    fn code_loc_of(&self, v: Value) -> Option<CodeLoc> {
        let Value::Ref(id) = v else { return None };
        let HeapData::Instance(i) = self.heap.get(id) else {
            return None;
        };
        let file = match i.get_field(self.wk.file) {
            Some(Value::Str(s)) => self.interns.get(s).to_owned(),
            _ => return None,
        };
        let line = match i.get_field(self.wk.line) {
            Some(Value::Int(n)) => n as u32,
            _ => 0,
        };
        let col = match i.get_field(self.wk.col) {
            Some(Value::Int(n)) => n as u32,
            _ => 0,
        };
        Some(CodeLoc { file, line, col })
    }

    // === Garbage collection ===

    /// Runs a collection when the allocation budget is spent. The detached
    /// running thread, if any, is passed by the interpreter.
    pub(crate) fn maybe_collect(&mut self, running: Option<&CrocThread>) {
        if self.heap.should_collect() {
            self.collect_now(running);
        }
    }

    pub(crate) fn collect_now(&mut self, running: Option<&CrocThread>) {
        let mut roots: Vec<Value> = vec![Value::Ref(self.globals), Value::Ref(self.main_thread)];
        roots.extend(self.exc_classes.values().map(|&id| Value::Ref(id)));
        roots.push(Value::Ref(self.location_class));
        roots.extend(self.type_metatables.iter().flatten().map(|&id| Value::Ref(id)));
        roots.extend(self.modules.values().map(|&id| Value::Ref(id)));
        roots.extend(self.temp_roots.iter().copied());
        if let Some(u) = self.unhandled {
            roots.push(u);
        }
        if let Some(CrocError::Exc(v)) = self.pending_exc {
            roots.push(v);
        }
        self.heap.collect(&roots, running);
    }

    /// Forces a full collection; mostly useful for tests and hosts probing
    /// weakref behavior.
    pub fn collect_garbage(&mut self) {
        self.collect_now(None);
    }

    // === Compilation ===

    /// Registers a module source the importer can load.
    pub fn register_module_source(&mut self, name: &str, source: &str) {
        let id = self.interns.intern(name);
        self.module_sources.insert(id, source.to_owned());
    }

    /// Compiles a module to a transportable artifact without running it.
    pub fn compile_module(&mut self, name: &str, source: &str) -> Result<CompiledModule, Exception> {
        let (def, _docs) = compiler::compile_module(&mut self.interns, self.flags, name, source)
            .map_err(|e| Exception::from_compile_error(&e))?;
        Ok(CompiledModule::capture(&def, &self.interns))
    }

    /// Compiles a module and wraps the body as a funcdef heap object.
    pub(crate) fn compile_module_funcdef(&mut self, name: &str, source: &str) -> Result<HeapId, Exception> {
        let (def, _docs) = compiler::compile_module(&mut self.interns, self.flags, name, source)
            .map_err(|e| Exception::from_compile_error(&e))?;
        Ok(self.heap.allocate(HeapData::Funcdef(FuncdefObj::new(def))))
    }

    // === Running ===

    /// Compiles and runs `source` as a script named `file_name`, returning
    /// the top-level function's results. Scripts share the root global
    /// namespace; module isolation comes from `modules.load`.
    pub fn run_source(&mut self, file_name: &str, source: &str) -> Result<Vec<Object>, Exception> {
        let funcdef = self.compile_module_funcdef(file_name, source)?;
        let env = self.globals;
        let func = crate::types::instantiate_funcdef(&mut self.heap, funcdef, env)
            .expect("fresh module funcdef instantiates");

        let results = self
            .call_value_on_main(Value::Ref(func), Value::Null, &[], -1)
            .map_err(|e| self.raise_unhandled(e))?;
        Ok(results.iter().map(|&v| self.to_object(v)).collect())
    }

    /// Installs and runs a previously compiled module artifact.
    pub fn run_compiled(&mut self, module: &CompiledModule) -> Result<Vec<Object>, Exception> {
        let def = module.install(&mut self.interns);
        let env = self.globals;
        let func = self.heap.allocate(HeapData::Function(Function::Script {
            def,
            env,
            upvals: Vec::new(),
        }));
        let results = self
            .call_value_on_main(Value::Ref(func), Value::Null, &[], -1)
            .map_err(|e| self.raise_unhandled(e))?;
        Ok(results.iter().map(|&v| self.to_object(v)).collect())
    }

    /// Registers a global function as the unhandled-exception handler. It is
    /// invoked with the exception instance before the error reaches the host.
    pub fn set_unhandled_handler(&mut self, func_name: &str) -> Result<(), Exception> {
        let name_id = self.interns.intern(func_name);
        let func = {
            let HeapData::Namespace(g) = self.heap.get(self.globals) else {
                unreachable!()
            };
            g.get(name_id)
        };
        match func {
            Some(f) => {
                self.unhandled = Some(f);
                Ok(())
            }
            None => {
                let e = self.make_exc(ExcKind::NameError, format!("Attempting to get a non-existent global '{func_name}'"));
                Err(self.exception_from_error(e))
            }
        }
    }

    /// Evaluates one expression and returns its first result.
    pub fn eval(&mut self, source: &str) -> Result<Object, Exception> {
        let def = compiler::compile_expression(&mut self.interns, self.flags, "<eval>", source)
            .map_err(|e| Exception::from_compile_error(&e))?;
        let env = self.globals;
        let func = self.heap.allocate(HeapData::Function(Function::Script {
            def,
            env,
            upvals: Vec::new(),
        }));
        let results = self
            .call_value_on_main(Value::Ref(func), Value::Null, &[], -1)
            .map_err(|e| self.raise_unhandled(e))?;
        Ok(results.first().map_or(Object::Null, |&v| self.to_object(v)))
    }

    /// Calls a global function by name.
    pub fn call_global(&mut self, name: &str, args: &[Object]) -> Result<Vec<Object>, Exception> {
        let name_id = self.interns.intern(name);
        let func = {
            let HeapData::Namespace(g) = self.heap.get(self.globals) else {
                unreachable!()
            };
            g.get(name_id)
        };
        let Some(func) = func else {
            let e = self.make_exc(ExcKind::NameError, format!("Attempting to get a non-existent global '{name}'"));
            return Err(self.raise_unhandled(e));
        };
        let arg_values: Vec<Value> = args.iter().map(|a| self.from_object(a)).collect();
        let results = self
            .call_value_on_main(func, Value::Null, &arg_values, -1)
            .map_err(|e| self.raise_unhandled(e))?;
        Ok(results.iter().map(|&v| self.to_object(v)).collect())
    }

    /// Calls a callable and reports failure without unwinding past the
    /// caller: the error result carries the exception instead of aborting.
    pub fn try_call(&mut self, name: &str, args: &[Object]) -> Result<Vec<Object>, Exception> {
        // try_call never invokes the unhandled handler.
        let name_id = self.interns.intern(name);
        let func = {
            let HeapData::Namespace(g) = self.heap.get(self.globals) else {
                unreachable!()
            };
            g.get(name_id)
        };
        let Some(func) = func else {
            let e = self.make_exc(ExcKind::NameError, format!("Attempting to get a non-existent global '{name}'"));
            return Err(self.exception_from_error(e));
        };
        let arg_values: Vec<Value> = args.iter().map(|a| self.from_object(a)).collect();
        match self.call_value_on_main(func, Value::Null, &arg_values, -1) {
            Ok(results) => Ok(results.iter().map(|&v| self.to_object(v)).collect()),
            Err(e) => Err(self.exception_from_error(e)),
        }
    }

    /// Reads a global as an [`Object`].
    pub fn global(&mut self, name: &str) -> Option<Object> {
        let name_id = self.interns.intern(name);
        let HeapData::Namespace(g) = self.heap.get(self.globals) else {
            unreachable!()
        };
        let v = g.get(name_id)?;
        Some(self.to_object(v))
    }

    /// Sets a global from an [`Object`].
    pub fn set_global(&mut self, name: &str, value: &Object) {
        let name_id = self.interns.intern(name);
        let v = self.from_object(value);
        self.set_global_raw(name_id, v);
    }

    /// Invokes the unhandled-exception handler (when installed) and converts
    /// the error for the host.
    fn raise_unhandled(&mut self, err: CrocError) -> Exception {
        if let (Some(handler), CrocError::Exc(v)) = (self.unhandled, &err) {
            let v = *v;
            // Failures inside the handler are swallowed; the original error
            // is what the host sees.
            let _ = self.call_value_on_main(handler, Value::Null, &[v], 0);
        }
        self.exception_from_error(err)
    }

    /// The core call entry: runs `func` on the main thread to completion.
    pub(crate) fn call_value_on_main(
        &mut self,
        func: Value,
        this: Value,
        args: &[Value],
        expected: isize,
    ) -> VmResult<Vec<Value>> {
        let t_id = self.main_thread;
        let mut thread = self.heap.detach_thread(t_id);
        thread.state = ThreadState::Running;

        let slot = thread.stack_index;
        thread.ensure_stack(slot + 2 + args.len());
        thread.stack[slot] = func;
        thread.stack[slot + 1] = this;
        for (i, &a) in args.iter().enumerate() {
            thread.stack[slot + 2 + i] = a;
        }
        thread.stack_index = slot + 2 + args.len();

        let mut interp = Interp {
            vm: self,
            t: thread,
            t_id,
            last_results: 0,
        };
        let result = interp.host_call(slot, expected);
        let Interp { vm, mut t, .. } = interp;

        let out = match result {
            Ok(num_results) => {
                let results = t.stack[slot..slot + num_results].to_vec();
                Ok(results)
            }
            Err(e) => Err(e),
        };

        // The host boundary resets the value stack for the next call.
        t.stack_index = slot.max(1);
        t.state = ThreadState::Initial;
        vm.heap.attach_thread(t_id, t);
        out
    }

    /// Stringification used by `write`/`writeln` and `toString`.
    pub(crate) fn stringify_value(&mut self, v: Value) -> VmResult<String> {
        Ok(v.stringify(&self.heap, &self.interns))
    }

    /// Drains the captured output of a collecting writer; empty for
    /// pass-through writers.
    pub fn take_output(&mut self) -> String {
        self.writer.take_output().unwrap_or_default()
    }

    // === Debug hooks ===

    /// Installs a debug hook on the main thread. `func_name` names a global
    /// function called with the event name (`"call"`, `"tailcall"`, `"ret"`,
    /// `"line"`, `"delay"`); `mask` selects events with the letters `c`,
    /// `r`, `l`, and `d`; `delay` is the instruction period of the delay
    /// hook (0 disables it).
    pub fn set_debug_hook(&mut self, func_name: &str, mask: &str, delay: u32) -> Result<(), Exception> {
        let name_id = self.interns.intern(func_name);
        let func = {
            let HeapData::Namespace(g) = self.heap.get(self.globals) else {
                unreachable!()
            };
            g.get(name_id)
        };
        let Some(func) = func else {
            let e = self.make_exc(ExcKind::NameError, format!("Attempting to get a non-existent global '{func_name}'"));
            return Err(self.exception_from_error(e));
        };

        let mut bits = 0u8;
        for c in mask.chars() {
            bits |= match c {
                'c' => HookMask::CALL,
                'r' => HookMask::RET,
                'l' => HookMask::LINE,
                'd' => HookMask::DELAY,
                _ => 0,
            };
        }

        let main = self.main_thread;
        if let HeapData::Thread(t) = self.heap.get_mut(main) {
            t.hook = Some(DebugHook {
                func,
                mask: HookMask(bits),
                delay,
                counter: delay.max(1),
            });
            t.hooks_enabled = true;
        }
        Ok(())
    }

    pub fn remove_debug_hook(&mut self) {
        let main = self.main_thread;
        if let HeapData::Thread(t) = self.heap.get_mut(main) {
            t.hook = None;
        }
    }

    // === Object conversion ===

    pub(crate) fn to_object(&self, v: Value) -> Object {
        self.to_object_depth(v, 0)
    }

    fn to_object_depth(&self, v: Value, depth: usize) -> Object {
        match v {
            Value::Null => Object::Null,
            Value::Bool(b) => Object::Bool(b),
            Value::Int(i) => Object::Int(i),
            Value::Float(f) => Object::Float(f),
            Value::Str(s) => Object::Str(self.interns.get(s).to_owned()),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Array(a) if depth < 16 => {
                    Object::Array(a.values().iter().map(|&x| self.to_object_depth(x, depth + 1)).collect())
                }
                _ => Object::Opaque(v.stringify(&self.heap, &self.interns)),
            },
            Value::NativeObj(_) => Object::Opaque(v.stringify(&self.heap, &self.interns)),
        }
    }

    pub(crate) fn from_object(&mut self, o: &Object) -> Value {
        match o {
            Object::Null => Value::Null,
            Object::Bool(b) => Value::Bool(*b),
            Object::Int(i) => Value::Int(*i),
            Object::Float(f) => Value::Float(*f),
            Object::Str(s) => Value::Str(self.interns.intern(s)),
            Object::Array(items) => {
                let values: Vec<Value> = items.iter().map(|i| self.from_object(i)).collect();
                Value::Ref(self.heap.allocate(HeapData::Array(Array::from_values(values))))
            }
            Object::Opaque(_) => Value::Null,
        }
    }
}

/// Context handed to native functions: the interpreter (for re-entrant
/// calls), the `this` value, and the argument values.
pub(crate) struct NativeCtx<'i, 'vm> {
    pub interp: &'i mut Interp<'vm>,
    pub this: Value,
    pub args: Vec<Value>,
    /// The native function object itself, for upvalue access.
    pub func_id: HeapId,
}

impl NativeCtx<'_, '_> {
    pub fn vm(&mut self) -> &mut Vm {
        self.interp.vm
    }

    fn upval(&self, idx: usize) -> Value {
        match self.interp.vm.heap.get(self.func_id) {
            HeapData::Function(Function::Native { upvals, .. }) => upvals[idx],
            _ => Value::Null,
        }
    }

    fn set_upval(&mut self, idx: usize, v: Value) {
        if let HeapData::Function(Function::Native { upvals, .. }) = self.interp.vm.heap.get_mut(self.func_id) {
            upvals[idx] = v;
        }
    }
}

// === Native implementations of the base globals ===

fn native_write(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let args = std::mem::take(&mut ctx.args);
    let vm = ctx.vm();
    for a in args {
        let s = vm.stringify_value(a)?;
        vm.writer.print(&s);
    }
    Ok(NativeRets::new())
}

fn native_writeln(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let args = std::mem::take(&mut ctx.args);
    let vm = ctx.vm();
    for a in args {
        let s = vm.stringify_value(a)?;
        vm.writer.print(&s);
    }
    vm.writer.print("\n");
    Ok(NativeRets::new())
}

fn native_to_string(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let v = ctx.args.first().copied().unwrap_or(Value::Null);
    let vm = ctx.vm();
    let s = vm.stringify_value(v)?;
    let id = vm.interns.intern(&s);
    Ok(smallvec![Value::Str(id)])
}

fn native_typeof(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let v = ctx.args.first().copied().unwrap_or(Value::Null);
    let vm = ctx.vm();
    let name = v.kind(&vm.heap).name();
    let id = vm.interns.intern(name);
    Ok(smallvec![Value::Str(id)])
}

fn native_weakref(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let v = ctx.args.first().copied().unwrap_or(Value::Null);
    let vm = ctx.vm();
    match v {
        Value::Ref(id) => {
            let w = vm.heap.weakref_of(id);
            Ok(smallvec![Value::Ref(w)])
        }
        _ => Err(vm.make_exc(ExcKind::TypeError, "Cannot take a weak reference to a value type")),
    }
}

fn native_deref(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let v = ctx.args.first().copied().unwrap_or(Value::Null);
    let vm = ctx.vm();
    match v {
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Weakref(w) => Ok(smallvec![w.target.map_or(Value::Null, Value::Ref)]),
            _ => Ok(smallvec![v]),
        },
        _ => Ok(smallvec![v]),
    }
}

fn native_memblock(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let v = ctx.args.first().copied().unwrap_or(Value::Null);
    let vm = ctx.vm();
    let Value::Int(n) = v else {
        return Err(vm.make_exc(ExcKind::TypeError, "Memblock length must be an integer"));
    };
    if n < 0 {
        return Err(vm.make_exc(ExcKind::RangeError, format!("Invalid memblock length {n}")));
    }
    let id = vm.heap.allocate(HeapData::Memblock(crate::types::Memblock::with_len(n as usize)));
    Ok(smallvec![Value::Ref(id)])
}

fn native_exception_ctor(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let msg = ctx.args.first().copied().unwrap_or(Value::Null);
    let this = ctx.this;
    let vm = ctx.vm();
    if let Value::Ref(id) = this {
        let msg_key = vm.wk.msg;
        if let HeapData::Instance(inst) = vm.heap.get_mut(id) {
            inst.set_field(msg_key, msg);
        }
    }
    Ok(NativeRets::new())
}

// === thread namespace ===

fn native_thread_new(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let v = ctx.args.first().copied().unwrap_or(Value::Null);
    let vm = ctx.vm();
    let Value::Ref(id) = v else {
        return Err(vm.make_exc(ExcKind::TypeError, "Coroutine body must be a script function"));
    };
    let is_script = matches!(vm.heap.get(id), HeapData::Function(f) if !f.is_native());
    if !is_script {
        return Err(vm.make_exc(ExcKind::TypeError, "Coroutine body must be a script function"));
    }
    let t = vm.heap.allocate(HeapData::Thread(Box::new(CrocThread::new_coroutine(id))));
    Ok(smallvec![Value::Ref(t)])
}

fn native_thread_state(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let v = ctx.args.first().copied().unwrap_or(ctx.this);
    let state = match v {
        Value::Ref(id) if id == ctx.interp.t_id => ThreadState::Running,
        Value::Ref(id) => match ctx.interp.vm.heap.get(id) {
            HeapData::Thread(t) => t.state,
            _ => {
                return Err(ctx
                    .vm()
                    .make_exc(ExcKind::TypeError, "'thread.state' expects a thread"));
            }
        },
        _ => {
            return Err(ctx.vm().make_exc(ExcKind::TypeError, "'thread.state' expects a thread"));
        }
    };
    let id = ctx.vm().interns.intern(state.name());
    Ok(smallvec![Value::Str(id)])
}

fn native_thread_halt(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let v = ctx.args.first().copied().unwrap_or(Value::Null);
    let Value::Ref(id) = v else {
        return Err(ctx.vm().make_exc(ExcKind::TypeError, "'thread.halt' expects a thread"));
    };
    if id == ctx.interp.t_id {
        // Halting the currently-running thread raises immediately.
        return Err(CrocError::Halt);
    }
    match ctx.interp.vm.heap.get_mut(id) {
        HeapData::Thread(t) => {
            t.pending_halt = true;
            Ok(NativeRets::new())
        }
        _ => Err(ctx.vm().make_exc(ExcKind::TypeError, "'thread.halt' expects a thread")),
    }
}

// === modules namespace ===

fn native_modules_load(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let name_val = ctx.args.first().copied().unwrap_or(Value::Null);
    let Value::Str(name_id) = name_val else {
        return Err(ctx
            .vm()
            .make_exc(ExcKind::ImportException, "Module name must be a string"));
    };

    if let Some(&ns) = ctx.interp.vm.modules.get(&name_id) {
        return Ok(smallvec![Value::Ref(ns)]);
    }
    if ctx.interp.vm.loading.contains(&name_id) {
        let name = ctx.interp.vm.interns.get(name_id).to_owned();
        return Err(ctx
            .vm()
            .make_exc(ExcKind::ImportException, format!("Circular import of module '{name}'")));
    }
    let Some(source) = ctx.interp.vm.module_sources.get(&name_id).cloned() else {
        let name = ctx.interp.vm.interns.get(name_id).to_owned();
        return Err(ctx
            .vm()
            .make_exc(ExcKind::ImportException, format!("Cannot find module '{name}'")));
    };

    ctx.interp.vm.loading.insert(name_id);
    let result = load_module(ctx, name_id, &source);
    ctx.interp.vm.loading.remove(&name_id);
    result
}

fn load_module(ctx: &mut NativeCtx<'_, '_>, name_id: StringId, source: &str) -> VmResult<NativeRets> {
    let name = ctx.interp.vm.interns.get(name_id).to_owned();
    let funcdef = match ctx.interp.vm.compile_module_funcdef(&name, source) {
        Ok(fd) => fd,
        Err(e) => {
            return Err(ctx
                .vm()
                .make_exc(ExcKind::ImportException, format!("Error loading module '{name}': {e}")));
        }
    };

    let globals = ctx.interp.vm.globals;
    let env = ctx
        .interp
        .vm
        .heap
        .allocate(HeapData::Namespace(Namespace::with_parent(name_id, globals, None)));
    let func = crate::types::instantiate_funcdef(&mut ctx.interp.vm.heap, funcdef, env)
        .expect("fresh module funcdef instantiates");

    // The module's top-level function runs with the namespace as `this`.
    ctx.interp.call_sync(Value::Ref(func), Value::Ref(env), &[], 0)?;

    ctx.interp.vm.modules.insert(name_id, env);
    Ok(smallvec![Value::Ref(env)])
}

// === foreach protocols for the built-in containers ===

fn native_array_apply(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let this = ctx.this;
    let iter = ctx.vm().new_native_func("arrayIterator", native_array_iter);
    Ok(smallvec![Value::Ref(iter), this, Value::Int(-1)])
}

fn native_array_iter(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let Value::Ref(arr_id) = ctx.this else {
        return Ok(NativeRets::new());
    };
    let control = match ctx.args.first() {
        Some(Value::Int(i)) => *i,
        _ => -1,
    };
    let idx = control + 1;
    let HeapData::Array(a) = ctx.interp.vm.heap.get(arr_id) else {
        return Ok(NativeRets::new());
    };
    if idx < 0 || idx as usize >= a.len() {
        return Ok(NativeRets::new());
    }
    Ok(smallvec![Value::Int(idx), a.get(idx as usize)])
}

fn native_string_apply(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let this = ctx.this;
    let iter = ctx.vm().new_native_func("stringIterator", native_string_iter);
    Ok(smallvec![Value::Ref(iter), this, Value::Int(-1)])
}

fn native_string_iter(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let Value::Str(sid) = ctx.this else {
        return Ok(NativeRets::new());
    };
    let control = match ctx.args.first() {
        Some(Value::Int(i)) => *i,
        _ => -1,
    };
    let idx = control + 1;
    let vm = ctx.vm();
    if idx < 0 || idx as usize >= vm.interns.cp_len(sid) {
        return Ok(NativeRets::new());
    }
    let c = vm.interns.char_at(sid, idx as usize).expect("in bounds");
    let cid = vm.interns.intern(&c.to_string());
    Ok(smallvec![Value::Int(idx), Value::Str(cid)])
}

/// Tables and namespaces iterate over a snapshot of their pairs captured at
/// loop entry, held in the iterator closure's upvalues along with a cursor.
fn native_table_apply(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let Value::Ref(id) = ctx.this else {
        return Ok(NativeRets::new());
    };
    let pairs: Vec<Value> = match ctx.interp.vm.heap.get(id) {
        HeapData::Table(t) => t.iter().flat_map(|(k, v)| [k, v]).collect(),
        _ => Vec::new(),
    };
    make_pairs_iterator(ctx, "tableIterator", pairs)
}

fn native_namespace_apply(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let Value::Ref(id) = ctx.this else {
        return Ok(NativeRets::new());
    };
    let pairs: Vec<Value> = match ctx.interp.vm.heap.get(id) {
        HeapData::Namespace(ns) => ns.iter().flat_map(|(k, v)| [Value::Str(k), v]).collect(),
        _ => Vec::new(),
    };
    make_pairs_iterator(ctx, "namespaceIterator", pairs)
}

fn make_pairs_iterator(ctx: &mut NativeCtx<'_, '_>, name: &str, pairs: Vec<Value>) -> VmResult<NativeRets> {
    let this = ctx.this;
    let vm = ctx.vm();
    let snapshot = vm.heap.allocate(HeapData::Array(Array::from_values(pairs)));
    let name_id = vm.interns.intern(name);
    let iter = vm.heap.allocate(HeapData::Function(Function::Native {
        name: name_id,
        func: native_pairs_iter,
        env: vm.globals,
        upvals: vec![Value::Ref(snapshot), Value::Int(0)],
    }));
    Ok(smallvec![Value::Ref(iter), this, Value::Null])
}

fn native_pairs_iter(ctx: &mut NativeCtx<'_, '_>) -> VmResult<NativeRets> {
    let Value::Ref(snap_id) = ctx.upval(0) else {
        return Ok(NativeRets::new());
    };
    let Value::Int(cursor) = ctx.upval(1) else {
        return Ok(NativeRets::new());
    };
    let pair = (cursor as usize) * 2;
    let (k, v) = {
        let HeapData::Array(a) = ctx.interp.vm.heap.get(snap_id) else {
            return Ok(NativeRets::new());
        };
        if pair + 1 >= a.len() {
            return Ok(NativeRets::new());
        }
        (a.get(pair), a.get(pair + 1))
    };
    ctx.set_upval(1, Value::Int(cursor + 1));
    Ok(smallvec![k, v])
}
