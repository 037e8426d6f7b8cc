//! The arena heap: slot storage for every reference-kind object, plus the
//! mark-sweep collector and the weakref table.
//!
//! References between objects are [`HeapId`] indices, which keeps the cyclic
//! object graphs of the language (classes referencing parents, closures
//! sharing upvalues, threads referencing functions referencing threads)
//! representable without ownership cycles. The collector traces by index from
//! the roots the VM supplies and sweeps unmarked slots onto a free list;
//! weakrefs are swept from a side table keyed by target.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    types::{Array, Class, CrocThread, FuncdefObj, Function, Instance, Memblock, Namespace, Table, Upval, Weakref},
    value::{CrocType, Value},
};

/// Index of an object slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct HeapId(u32);

impl HeapId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The object kinds an arena slot can hold.
#[derive(Debug)]
pub(crate) enum HeapData {
    Table(Table),
    Array(Array),
    Memblock(Memblock),
    Function(Function),
    Funcdef(FuncdefObj),
    Class(Class),
    Instance(Instance),
    Namespace(Namespace),
    Thread(Box<CrocThread>),
    Upval(Upval),
    Weakref(Weakref),
}

impl HeapData {
    pub fn kind(&self) -> CrocType {
        match self {
            Self::Table(_) => CrocType::Table,
            Self::Array(_) => CrocType::Array,
            Self::Memblock(_) => CrocType::Memblock,
            Self::Function(_) => CrocType::Function,
            Self::Funcdef(_) => CrocType::Funcdef,
            Self::Class(_) => CrocType::Class,
            Self::Instance(_) => CrocType::Instance,
            Self::Namespace(_) => CrocType::Namespace,
            Self::Thread(_) => CrocType::Thread,
            Self::Upval(_) => CrocType::Upval,
            Self::Weakref(_) => CrocType::Weakref,
        }
    }
}

#[derive(Debug)]
struct Slot {
    data: Option<HeapData>,
    mark: bool,
}

/// Collection kicks in after this many allocations since the last cycle.
const GC_ALLOC_THRESHOLD: usize = 4096;

#[derive(Debug, Default)]
pub(crate) struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<HeapId>,
    /// target object -> its weakref object, for dedup and for the sweep.
    weak_table: AHashMap<HeapId, HeapId>,
    allocs_since_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        self.allocs_since_gc += 1;
        if let Some(id) = self.free_list.pop() {
            let slot = &mut self.slots[id.index()];
            debug_assert!(slot.data.is_none());
            slot.data = Some(data);
            slot.mark = false;
            id
        } else {
            let id = HeapId(u32::try_from(self.slots.len()).expect("heap slot overflow"));
            self.slots.push(Slot { data: Some(data), mark: false });
            id
        }
    }

    #[inline]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.slots[id.index()].data.as_ref().expect("access to reclaimed heap slot")
    }

    #[inline]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.slots[id.index()].data.as_mut().expect("access to reclaimed heap slot")
    }

    /// Moves a thread out of its slot for the duration of a run; the slot
    /// keeps a placeholder the collector knows to skip. The interpreter owns
    /// the thread until [`Heap::attach_thread`] puts it back.
    pub fn detach_thread(&mut self, id: HeapId) -> Box<CrocThread> {
        let slot = &mut self.slots[id.index()];
        match slot.data.replace(HeapData::Thread(Box::new(CrocThread::new()))) {
            Some(HeapData::Thread(t)) => t,
            _ => panic!("detach_thread on a non-thread slot"),
        }
    }

    pub fn attach_thread(&mut self, id: HeapId, thread: Box<CrocThread>) {
        self.slots[id.index()].data = Some(HeapData::Thread(thread));
    }

    /// Looks up or creates the weakref object for `target`.
    pub fn weakref_of(&mut self, target: HeapId) -> HeapId {
        if let Some(&w) = self.weak_table.get(&target) {
            return w;
        }
        let w = self.allocate(HeapData::Weakref(Weakref::new(target)));
        self.weak_table.insert(target, w);
        w
    }

    pub fn should_collect(&self) -> bool {
        self.allocs_since_gc >= GC_ALLOC_THRESHOLD
    }

    /// Mark-sweep over the arena. `roots` are the values the VM can reach
    /// directly; `extra_thread` is the detached running thread, which lives
    /// outside its slot during execution but is still fully live.
    pub fn collect(&mut self, roots: &[Value], extra_thread: Option<&CrocThread>) {
        for slot in &mut self.slots {
            slot.mark = false;
        }

        let mut work: Vec<HeapId> = Vec::new();
        for &v in roots {
            if let Value::Ref(id) = v {
                work.push(id);
            }
        }
        if let Some(t) = extra_thread {
            trace_thread(t, &mut work);
        }

        while let Some(id) = work.pop() {
            let slot = &mut self.slots[id.index()];
            if slot.mark {
                continue;
            }
            slot.mark = true;
            if let Some(data) = &slot.data {
                trace_object(data, &mut work);
            }
        }

        // Weakrefs do not keep targets alive: clear refs whose target died,
        // and drop table entries for dead targets.
        let mut cleared: Vec<HeapId> = Vec::new();
        for (&target, &weak) in &self.weak_table {
            if !self.slots[target.index()].mark {
                cleared.push(weak);
            }
        }
        for weak in cleared {
            self.weak_table.retain(|_, &mut w| w != weak);
            if let Some(HeapData::Weakref(w)) = self.slots[weak.index()].data.as_mut() {
                w.target = None;
            }
        }

        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.mark && slot.data.is_some() {
                slot.data = None;
                self.free_list.push(HeapId(i as u32));
            }
        }

        // Drop table entries whose weakref object itself was reclaimed.
        let slots = &self.slots;
        self.weak_table
            .retain(|t, w| slots[t.index()].data.is_some() && slots[w.index()].data.is_some());

        self.allocs_since_gc = 0;
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.data.is_some()).count()
    }
}

fn push_value(v: Value, work: &mut Vec<HeapId>) {
    if let Value::Ref(id) = v {
        work.push(id);
    }
}

fn trace_object(data: &HeapData, work: &mut Vec<HeapId>) {
    match data {
        HeapData::Table(t) => {
            for (k, v) in t.iter() {
                push_value(k, work);
                push_value(v, work);
            }
        }
        HeapData::Array(a) => {
            for &v in a.values() {
                push_value(v, work);
            }
        }
        HeapData::Memblock(_) => {}
        HeapData::Function(f) => match f {
            Function::Native { env, upvals, .. } => {
                work.push(*env);
                for &v in upvals {
                    push_value(v, work);
                }
            }
            Function::Script { env, upvals, .. } => {
                work.push(*env);
                work.extend(upvals.iter().copied());
            }
        },
        HeapData::Funcdef(fd) => {
            if let Some(f) = fd.cached_func {
                work.push(f);
            }
            if let Some(e) = fd.cached_env {
                work.push(e);
            }
        }
        HeapData::Class(c) => {
            if let Some(p) = c.parent {
                work.push(p);
            }
            for (_, v) in c.methods() {
                push_value(v, work);
            }
            for (_, v) in c.fields() {
                push_value(v, work);
            }
            for (_, v) in c.hidden_fields() {
                push_value(v, work);
            }
            if let Some(f) = c.finalizer {
                push_value(f, work);
            }
        }
        HeapData::Instance(i) => {
            work.push(i.class);
            for (_, v) in i.fields() {
                push_value(v, work);
            }
            for (_, v) in i.hidden_fields() {
                push_value(v, work);
            }
        }
        HeapData::Namespace(n) => {
            if let Some(p) = n.parent {
                work.push(p);
            }
            if let Some(r) = n.root {
                work.push(r);
            }
            for (_, v) in n.iter() {
                push_value(v, work);
            }
        }
        HeapData::Thread(t) => trace_thread(t, work),
        HeapData::Upval(u) => match u {
            // The aliased stack slot is traced through its owning thread.
            Upval::Open { thread, .. } => work.push(*thread),
            Upval::Closed(v) => push_value(*v, work),
        },
        // Weak: the target is deliberately not traced.
        HeapData::Weakref(_) => {}
    }
}

fn trace_thread(t: &CrocThread, work: &mut Vec<HeapId>) {
    for &v in &t.stack[..t.stack_index.min(t.stack.len())] {
        push_value(v, work);
    }
    for &v in &t.results {
        push_value(v, work);
    }
    for frame in &t.frames {
        if let Some(f) = frame.func {
            work.push(f);
        }
    }
    work.extend(t.open_upvals.iter().copied());
    if let Some(f) = t.coro_func {
        work.push(f);
    }
    if let Some(r) = t.resumed_by {
        work.push(r);
    }
    if let Some(h) = &t.hook {
        push_value(h.func, work);
    }
}
