//! Value operation semantics: arithmetic, comparison, membership,
//! indexing, slicing, field access, length, concatenation, globals, loop
//! protocols, and object creation - each with its metamethod fallback.

use crate::{
    bytecode::op::Opcode,
    errors::{CrocError, ExcKind, VmResult},
    heap::{HeapData, HeapId},
    intern::StringId,
    types::{Array, Class, Memblock, Namespace, ThreadState},
    value::{CrocType, Value},
    vm::{Interp, meta::Metamethod, meta::get_metamethod},
};

/// Strict equality used for switch dispatch: no metamethods, value kinds
/// only, with int/float numeric cross-equality.
pub(crate) fn switch_cmp(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) => (x as f64) == y,
        (Value::Float(x), Value::Int(y)) => x == (y as f64),
        (Value::Float(x), Value::Float(y)) => x == y,
        _ => a.exact_eq(b),
    }
}

impl Interp<'_> {
    fn type_error(&mut self, msg: String) -> CrocError {
        self.vm.make_exc(ExcKind::TypeError, msg)
    }

    fn kind_name(&self, v: Value) -> &'static str {
        v.kind(&self.vm.heap).name()
    }

    /// Invokes a binary metamethod, trying the left operand's method first
    /// and the right operand's reversed form second.
    fn try_binary_mm(&mut self, mm: Metamethod, mm_rev: Metamethod, a: Value, b: Value) -> VmResult<Option<Value>> {
        if let Some(f) = get_metamethod(self.vm, a, mm) {
            let r = self.call_sync(f, a, &[b], 1)?;
            return Ok(Some(r.first().copied().unwrap_or(Value::Null)));
        }
        if let Some(f) = get_metamethod(self.vm, b, mm_rev) {
            let r = self.call_sync(f, b, &[a], 1)?;
            return Ok(Some(r.first().copied().unwrap_or(Value::Null)));
        }
        Ok(None)
    }

    // === Arithmetic ===

    pub(crate) fn bin_arith(&mut self, op: Opcode, a: Value, b: Value) -> VmResult<Value> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                let v = match op {
                    Opcode::Add => x.wrapping_add(y),
                    Opcode::Sub => x.wrapping_sub(y),
                    Opcode::Mul => x.wrapping_mul(y),
                    Opcode::Div => {
                        if y == 0 {
                            return Err(self.vm.make_exc(ExcKind::ValueError, "Integer divide by zero"));
                        }
                        x.wrapping_div(y)
                    }
                    Opcode::Mod => {
                        if y == 0 {
                            return Err(self.vm.make_exc(ExcKind::ValueError, "Integer modulo by zero"));
                        }
                        x.wrapping_rem(y)
                    }
                    _ => unreachable!(),
                };
                Ok(Value::Int(v))
            }
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let x = as_float(a);
                let y = as_float(b);
                let v = match op {
                    Opcode::Add => x + y,
                    Opcode::Sub => x - y,
                    Opcode::Mul => x * y,
                    Opcode::Div => x / y,
                    Opcode::Mod => x % y,
                    _ => unreachable!(),
                };
                Ok(Value::Float(v))
            }
            _ => {
                let (mm, mm_rev, verb) = match op {
                    Opcode::Add => (Metamethod::Add, Metamethod::AddR, "add"),
                    Opcode::Sub => (Metamethod::Sub, Metamethod::SubR, "subtract"),
                    Opcode::Mul => (Metamethod::Mul, Metamethod::MulR, "multiply"),
                    Opcode::Div => (Metamethod::Div, Metamethod::DivR, "divide"),
                    Opcode::Mod => (Metamethod::Mod, Metamethod::ModR, "modulo"),
                    _ => unreachable!(),
                };
                match self.try_binary_mm(mm, mm_rev, a, b)? {
                    Some(v) => Ok(v),
                    None => {
                        let (ka, kb) = (self.kind_name(a), self.kind_name(b));
                        Err(self.type_error(format!("Attempting to {verb} a '{ka}' and a '{kb}'")))
                    }
                }
            }
        }
    }

    pub(crate) fn refl_arith(&mut self, op: Opcode, dest: Value, src: Value) -> VmResult<Value> {
        let bin = match op {
            Opcode::AddEq => Opcode::Add,
            Opcode::SubEq => Opcode::Sub,
            Opcode::MulEq => Opcode::Mul,
            Opcode::DivEq => Opcode::Div,
            Opcode::ModEq => Opcode::Mod,
            _ => unreachable!(),
        };
        if matches!(dest, Value::Int(_) | Value::Float(_)) && matches!(src, Value::Int(_) | Value::Float(_)) {
            return self.bin_arith(bin, dest, src);
        }
        let mm = match op {
            Opcode::AddEq => Metamethod::AddAssign,
            Opcode::SubEq => Metamethod::SubAssign,
            Opcode::MulEq => Metamethod::MulAssign,
            Opcode::DivEq => Metamethod::DivAssign,
            Opcode::ModEq => Metamethod::ModAssign,
            _ => unreachable!(),
        };
        if let Some(f) = get_metamethod(self.vm, dest, mm) {
            self.call_sync(f, dest, &[src], 0)?;
            return Ok(dest);
        }
        let (ka, kb) = (self.kind_name(dest), self.kind_name(src));
        Err(self.type_error(format!("Attempting to operate on a '{ka}' and a '{kb}'")))
    }

    pub(crate) fn bin_bitwise(&mut self, op: Opcode, a: Value, b: Value) -> VmResult<Value> {
        if let (Value::Int(x), Value::Int(y)) = (a, b) {
            let v = match op {
                Opcode::And => x & y,
                Opcode::Or => x | y,
                Opcode::Xor => x ^ y,
                Opcode::Shl => x.wrapping_shl(y as u32),
                Opcode::Shr => x.wrapping_shr(y as u32),
                Opcode::UShr => ((x as u64).wrapping_shr(y as u32)) as i64,
                _ => unreachable!(),
            };
            return Ok(Value::Int(v));
        }
        let (mm, mm_rev, verb) = match op {
            Opcode::And => (Metamethod::And, Metamethod::AndR, "and"),
            Opcode::Or => (Metamethod::Or, Metamethod::OrR, "or"),
            Opcode::Xor => (Metamethod::Xor, Metamethod::XorR, "xor"),
            Opcode::Shl => (Metamethod::Shl, Metamethod::ShlR, "left-shift"),
            Opcode::Shr => (Metamethod::Shr, Metamethod::ShrR, "right-shift"),
            Opcode::UShr => (Metamethod::UShr, Metamethod::UShrR, "unsigned right-shift"),
            _ => unreachable!(),
        };
        match self.try_binary_mm(mm, mm_rev, a, b)? {
            Some(v) => Ok(v),
            None => {
                let (ka, kb) = (self.kind_name(a), self.kind_name(b));
                Err(self.type_error(format!("Attempting to bitwise {verb} a '{ka}' and a '{kb}'")))
            }
        }
    }

    pub(crate) fn refl_bitwise(&mut self, op: Opcode, dest: Value, src: Value) -> VmResult<Value> {
        let bin = match op {
            Opcode::AndEq => Opcode::And,
            Opcode::OrEq => Opcode::Or,
            Opcode::XorEq => Opcode::Xor,
            Opcode::ShlEq => Opcode::Shl,
            Opcode::ShrEq => Opcode::Shr,
            Opcode::UShrEq => Opcode::UShr,
            _ => unreachable!(),
        };
        if matches!((dest, src), (Value::Int(_), Value::Int(_))) {
            return self.bin_bitwise(bin, dest, src);
        }
        let mm = match op {
            Opcode::AndEq => Metamethod::AndAssign,
            Opcode::OrEq => Metamethod::OrAssign,
            Opcode::XorEq => Metamethod::XorAssign,
            Opcode::ShlEq => Metamethod::ShlAssign,
            Opcode::ShrEq => Metamethod::ShrAssign,
            Opcode::UShrEq => Metamethod::UShrAssign,
            _ => unreachable!(),
        };
        if let Some(f) = get_metamethod(self.vm, dest, mm) {
            self.call_sync(f, dest, &[src], 0)?;
            return Ok(dest);
        }
        let (ka, kb) = (self.kind_name(dest), self.kind_name(src));
        Err(self.type_error(format!("Attempting to bitwise-assign a '{kb}' into a '{ka}'")))
    }

    pub(crate) fn neg_value(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Int(x) => Ok(Value::Int(x.wrapping_neg())),
            Value::Float(x) => Ok(Value::Float(-x)),
            _ => {
                if let Some(f) = get_metamethod(self.vm, v, Metamethod::Neg) {
                    let r = self.call_sync(f, v, &[], 1)?;
                    return Ok(r.first().copied().unwrap_or(Value::Null));
                }
                let k = self.kind_name(v);
                Err(self.type_error(format!("Cannot perform negation on a '{k}'")))
            }
        }
    }

    pub(crate) fn com_value(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Int(x) => Ok(Value::Int(!x)),
            _ => {
                if let Some(f) = get_metamethod(self.vm, v, Metamethod::Com) {
                    let r = self.call_sync(f, v, &[], 1)?;
                    return Ok(r.first().copied().unwrap_or(Value::Null));
                }
                let k = self.kind_name(v);
                Err(self.type_error(format!("Cannot perform bitwise complement on a '{k}'")))
            }
        }
    }

    pub(crate) fn inc_dec_value(&mut self, v: Value, inc: bool) -> VmResult<Value> {
        match v {
            Value::Int(x) => Ok(Value::Int(if inc { x.wrapping_add(1) } else { x.wrapping_sub(1) })),
            Value::Float(x) => Ok(Value::Float(if inc { x + 1.0 } else { x - 1.0 })),
            _ => {
                let mm = if inc { Metamethod::Inc } else { Metamethod::Dec };
                if let Some(f) = get_metamethod(self.vm, v, mm) {
                    self.call_sync(f, v, &[], 0)?;
                    return Ok(v);
                }
                let k = self.kind_name(v);
                let verb = if inc { "increment" } else { "decrement" };
                Err(self.type_error(format!("Cannot {verb} a '{k}'")))
            }
        }
    }

    // === Comparison ===

    /// Three-way comparison: mixed numerics by value; same-kind null/bool/
    /// string naturally; otherwise `opCmp` on the left then right operand.
    pub(crate) fn compare_values(&mut self, a: Value, b: Value) -> VmResult<i64> {
        use std::cmp::Ordering;
        let ord = match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(x.cmp(&y)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                as_float(a).partial_cmp(&as_float(b))
            }
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(&y)),
            (Value::Str(x), Value::Str(y)) => Some(self.vm.interns.get(x).cmp(self.vm.interns.get(y))),
            _ => None,
        };
        if let Some(ord) = ord {
            return Ok(match ord {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            });
        }

        for (recv, arg, flip) in [(a, b, false), (b, a, true)] {
            if let Some(f) = get_metamethod(self.vm, recv, Metamethod::Cmp) {
                let r = self.call_sync(f, recv, &[arg], 1)?;
                let Some(Value::Int(c)) = r.first().copied() else {
                    return Err(self.type_error("opCmp must return an integer".into()));
                };
                return Ok(if flip { -c } else { c });
            }
        }

        let (ka, kb) = (self.kind_name(a), self.kind_name(b));
        Err(self.type_error(format!("Attempting to compare a '{ka}' and a '{kb}'")))
    }

    pub(crate) fn equals_values(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if a.exact_eq(b) {
            return Ok(true);
        }
        match (a, b) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => Ok(as_float(a) == as_float(b)),
            (Value::Null, _) | (_, Value::Null) => Ok(false),
            (Value::Bool(_), Value::Bool(_)) | (Value::Str(_), Value::Str(_)) => Ok(false),
            _ => {
                for (recv, arg) in [(a, b), (b, a)] {
                    if let Some(f) = get_metamethod(self.vm, recv, Metamethod::Equals) {
                        let r = self.call_sync(f, recv, &[arg], 1)?;
                        return Ok(r.first().copied().unwrap_or(Value::Null).is_true());
                    }
                }
                // Reference kinds without opEquals compare by identity,
                // which already failed above.
                if a.kind(&self.vm.heap) == b.kind(&self.vm.heap) {
                    return Ok(false);
                }
                let (ka, kb) = (self.kind_name(a), self.kind_name(b));
                Err(self.type_error(format!("Attempting to compare a '{ka}' and a '{kb}' for equality")))
            }
        }
    }

    /// The `in` operator.
    pub(crate) fn in_values(&mut self, item: Value, container: Value) -> VmResult<bool> {
        match container {
            Value::Str(s) => {
                let Value::Str(sub) = item else {
                    let k = self.kind_name(item);
                    return Err(self.type_error(format!("Can only use strings with 'in' on strings, not '{k}'")));
                };
                let hay = self.vm.interns.get(s);
                let needle = self.vm.interns.get(sub);
                Ok(hay.contains(needle))
            }
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Array(a) => {
                    let values = a.values().to_vec();
                    for v in values {
                        if self.equals_eq_like(item, v) {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                HeapData::Table(t) => Ok(t.contains(item)),
                HeapData::Namespace(ns) => match item {
                    Value::Str(name) => Ok(ns.contains(name)),
                    _ => Ok(false),
                },
                _ => self.in_fallback(item, container),
            },
            _ => self.in_fallback(item, container),
        }
    }

    /// Structural equality without metamethods, for array membership.
    fn equals_eq_like(&self, a: Value, b: Value) -> bool {
        a == b
    }

    fn in_fallback(&mut self, item: Value, container: Value) -> VmResult<bool> {
        if let Some(f) = get_metamethod(self.vm, container, Metamethod::In) {
            let r = self.call_sync(f, container, &[item], 1)?;
            return Ok(r.first().copied().unwrap_or(Value::Null).is_true());
        }
        let k = self.kind_name(container);
        Err(self.type_error(format!("No implementation of opIn for type '{k}'")))
    }

    // === Indexing ===

    pub(crate) fn index_value(&mut self, container: Value, key: Value) -> VmResult<Value> {
        match container {
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Array(a) => {
                    let len = a.len();
                    let idx = self.normalize_index(key, len, "array")?;
                    let HeapData::Array(a) = self.vm.heap.get(id) else { unreachable!() };
                    Ok(a.get(idx))
                }
                HeapData::Memblock(m) => {
                    let len = m.len();
                    let idx = self.normalize_index(key, len, "memblock")?;
                    let HeapData::Memblock(m) = self.vm.heap.get(id) else {
                        unreachable!()
                    };
                    Ok(Value::Int(i64::from(m.get(idx))))
                }
                HeapData::Table(_) => {
                    if key.is_null() {
                        return Err(self.type_error("Tables may not be indexed with null".into()));
                    }
                    let HeapData::Table(t) = self.vm.heap.get(id) else { unreachable!() };
                    let v = t.get(key);
                    if v.is_null() {
                        // Absent entries read as null unless opIndex supplies
                        // a fallback.
                        if let Some(f) = get_metamethod(self.vm, container, Metamethod::Index) {
                            let r = self.call_sync(f, container, &[key], 1)?;
                            return Ok(r.first().copied().unwrap_or(Value::Null));
                        }
                    }
                    Ok(v)
                }
                _ => self.index_fallback(container, key),
            },
            Value::Str(s) => {
                let len = self.vm.interns.cp_len(s);
                let idx = self.normalize_index(key, len, "string")?;
                let c = self.vm.interns.char_at(s, idx).expect("in bounds");
                let id = self.vm.interns.intern(&c.to_string());
                Ok(Value::Str(id))
            }
            _ => self.index_fallback(container, key),
        }
    }

    fn index_fallback(&mut self, container: Value, key: Value) -> VmResult<Value> {
        if let Some(f) = get_metamethod(self.vm, container, Metamethod::Index) {
            let r = self.call_sync(f, container, &[key], 1)?;
            return Ok(r.first().copied().unwrap_or(Value::Null));
        }
        let k = self.kind_name(container);
        Err(self.type_error(format!("Attempting to index a value of type '{k}'")))
    }

    fn normalize_index(&mut self, key: Value, len: usize, what: &str) -> VmResult<usize> {
        let Value::Int(mut idx) = key else {
            let k = self.kind_name(key);
            return Err(self.type_error(format!("Attempting to index a {what} with a '{k}'")));
        };
        if idx < 0 {
            idx += len as i64;
        }
        if idx < 0 || idx >= len as i64 {
            return Err(self
                .vm
                .make_exc(ExcKind::BoundsError, format!("Invalid {what} index {idx} (length is {len})")));
        }
        Ok(idx as usize)
    }

    pub(crate) fn index_assign(&mut self, container: Value, key: Value, value: Value) -> VmResult<()> {
        match container {
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Array(a) => {
                    let len = a.len();
                    let idx = self.normalize_index(key, len, "array")?;
                    if let HeapData::Array(a) = self.vm.heap.get_mut(id) {
                        a.set(idx, value);
                    }
                    Ok(())
                }
                HeapData::Memblock(m) => {
                    let len = m.len();
                    let idx = self.normalize_index(key, len, "memblock")?;
                    let Value::Int(byte) = value else {
                        let k = self.kind_name(value);
                        return Err(self.type_error(format!("Memblock elements must be integers, not '{k}'")));
                    };
                    if !(0..=255).contains(&byte) {
                        return Err(self
                            .vm
                            .make_exc(ExcKind::RangeError, format!("Memblock element value {byte} out of range")));
                    }
                    if let HeapData::Memblock(m) = self.vm.heap.get_mut(id) {
                        m.set(idx, byte as u8);
                    }
                    Ok(())
                }
                HeapData::Table(_) => {
                    if key.is_null() {
                        return Err(self.type_error("Tables may not have null keys".into()));
                    }
                    if let HeapData::Table(t) = self.vm.heap.get_mut(id) {
                        t.set(key, value);
                    }
                    Ok(())
                }
                _ => self.index_assign_fallback(container, key, value),
            },
            _ => self.index_assign_fallback(container, key, value),
        }
    }

    fn index_assign_fallback(&mut self, container: Value, key: Value, value: Value) -> VmResult<()> {
        if let Some(f) = get_metamethod(self.vm, container, Metamethod::IndexAssign) {
            self.call_sync(f, container, &[key, value], 0)?;
            return Ok(());
        }
        let k = self.kind_name(container);
        Err(self.type_error(format!("Attempting to index-assign a value of type '{k}'")))
    }

    // === Fields ===

    pub(crate) fn field_value(&mut self, obj: Value, name: StringId) -> VmResult<Value> {
        let found = match obj {
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Instance(inst) => {
                    let class = inst.class;
                    inst.get_field(name).or_else(|| match self.vm.heap.get(class) {
                        HeapData::Class(c) => c.get_method(name),
                        _ => None,
                    })
                }
                HeapData::Class(c) => c.get_field(name).or_else(|| c.get_method(name)),
                HeapData::Namespace(ns) => ns.get(name),
                HeapData::Table(t) => return Ok(t.get(Value::Str(name))),
                _ => None,
            },
            _ => None,
        };

        if let Some(v) = found {
            return Ok(v);
        }

        if let Some(f) = get_metamethod(self.vm, obj, Metamethod::Field) {
            let r = self.call_sync(f, obj, &[Value::Str(name)], 1)?;
            return Ok(r.first().copied().unwrap_or(Value::Null));
        }

        let k = self.kind_name(obj);
        let name_str = self.vm.interns.get(name).to_owned();
        Err(self
            .vm
            .make_exc(ExcKind::FieldError, format!("Attempting to access nonexistent field '{name_str}' from '{k}'")))
    }

    pub(crate) fn field_assign(&mut self, obj: Value, name: StringId, value: Value) -> VmResult<()> {
        match obj {
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Instance(_) => {
                    let ok = match self.vm.heap.get_mut(id) {
                        HeapData::Instance(inst) => inst.set_field(name, value),
                        _ => false,
                    };
                    if ok {
                        return Ok(());
                    }
                    if let Some(f) = get_metamethod(self.vm, obj, Metamethod::FieldAssign) {
                        self.call_sync(f, obj, &[Value::Str(name), value], 0)?;
                        return Ok(());
                    }
                    let name_str = self.vm.interns.get(name).to_owned();
                    Err(self.vm.make_exc(
                        ExcKind::FieldError,
                        format!("Attempting to add a field '{name_str}' to an instance"),
                    ))
                }
                HeapData::Class(_) => {
                    let frozen = match self.vm.heap.get(id) {
                        HeapData::Class(c) => c.frozen,
                        _ => false,
                    };
                    let ok = match self.vm.heap.get_mut(id) {
                        HeapData::Class(c) => {
                            if c.get_field(name).is_some() {
                                c.add_field(name, value, true)
                            } else if !frozen {
                                c.add_field(name, value, false)
                            } else {
                                false
                            }
                        }
                        _ => false,
                    };
                    if ok {
                        return Ok(());
                    }
                    let name_str = self.vm.interns.get(name).to_owned();
                    Err(self.vm.make_exc(
                        ExcKind::StateError,
                        format!("Attempting to add field '{name_str}' to a frozen class"),
                    ))
                }
                HeapData::Namespace(_) => {
                    if let HeapData::Namespace(ns) = self.vm.heap.get_mut(id) {
                        ns.set(name, value);
                    }
                    Ok(())
                }
                HeapData::Table(_) => {
                    if let HeapData::Table(t) = self.vm.heap.get_mut(id) {
                        t.set(Value::Str(name), value);
                    }
                    Ok(())
                }
                _ => self.field_assign_fallback(obj, name, value),
            },
            _ => self.field_assign_fallback(obj, name, value),
        }
    }

    fn field_assign_fallback(&mut self, obj: Value, name: StringId, value: Value) -> VmResult<()> {
        if let Some(f) = get_metamethod(self.vm, obj, Metamethod::FieldAssign) {
            self.call_sync(f, obj, &[Value::Str(name), value], 0)?;
            return Ok(());
        }
        let k = self.kind_name(obj);
        Err(self
            .vm
            .make_exc(ExcKind::FieldError, format!("Attempting to assign a field of a '{k}'")))
    }

    // === Length ===

    pub(crate) fn length_of(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Str(s) => Ok(Value::Int(self.vm.interns.cp_len(s) as i64)),
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Array(a) => Ok(Value::Int(a.len() as i64)),
                HeapData::Memblock(m) => Ok(Value::Int(m.len() as i64)),
                HeapData::Table(t) => Ok(Value::Int(t.len() as i64)),
                HeapData::Namespace(ns) => Ok(Value::Int(ns.len() as i64)),
                _ => self.length_fallback(v),
            },
            _ => self.length_fallback(v),
        }
    }

    fn length_fallback(&mut self, v: Value) -> VmResult<Value> {
        if let Some(f) = get_metamethod(self.vm, v, Metamethod::Length) {
            let r = self.call_sync(f, v, &[], 1)?;
            return Ok(r.first().copied().unwrap_or(Value::Null));
        }
        let k = self.kind_name(v);
        Err(self.type_error(format!("Cannot get the length of a '{k}'")))
    }

    pub(crate) fn length_assign(&mut self, obj: Value, len: Value) -> VmResult<()> {
        match obj {
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Array(_) => {
                    let Value::Int(n) = len else {
                        let k = self.kind_name(len);
                        return Err(self.type_error(format!("Array length must be an integer, not '{k}'")));
                    };
                    if n < 0 {
                        return Err(self.vm.make_exc(ExcKind::RangeError, format!("Invalid array length {n}")));
                    }
                    if let HeapData::Array(a) = self.vm.heap.get_mut(id) {
                        a.resize(n as usize);
                    }
                    Ok(())
                }
                HeapData::Memblock(m) => {
                    let owned = m.is_owned();
                    let Value::Int(n) = len else {
                        let k = self.kind_name(len);
                        return Err(self.type_error(format!("Memblock length must be an integer, not '{k}'")));
                    };
                    if n < 0 {
                        return Err(self.vm.make_exc(ExcKind::RangeError, format!("Invalid memblock length {n}")));
                    }
                    if !owned {
                        return Err(self
                            .vm
                            .make_exc(ExcKind::StateError, "Attempting to resize a memblock view"));
                    }
                    if let HeapData::Memblock(m) = self.vm.heap.get_mut(id) {
                        m.resize(n as usize);
                    }
                    Ok(())
                }
                _ => self.length_assign_fallback(obj, len),
            },
            _ => self.length_assign_fallback(obj, len),
        }
    }

    fn length_assign_fallback(&mut self, obj: Value, len: Value) -> VmResult<()> {
        if let Some(f) = get_metamethod(self.vm, obj, Metamethod::LengthAssign) {
            self.call_sync(f, obj, &[len], 0)?;
            return Ok(());
        }
        let k = self.kind_name(obj);
        Err(self.type_error(format!("Cannot set the length of a '{k}'")))
    }

    // === Slicing ===

    fn normalize_slice(&mut self, lo: Value, hi: Value, len: usize, what: &str) -> VmResult<(usize, usize)> {
        let lo = match lo {
            Value::Null => 0,
            Value::Int(mut n) => {
                if n < 0 {
                    n += len as i64;
                }
                n
            }
            other => {
                let k = self.kind_name(other);
                return Err(self.type_error(format!("Attempting to slice a {what} with a '{k}'")));
            }
        };
        let hi = match hi {
            Value::Null => len as i64,
            Value::Int(mut n) => {
                if n < 0 {
                    n += len as i64;
                }
                n
            }
            other => {
                let k = self.kind_name(other);
                return Err(self.type_error(format!("Attempting to slice a {what} with a '{k}'")));
            }
        };
        if lo > hi || lo < 0 || hi > len as i64 {
            return Err(self
                .vm
                .make_exc(ExcKind::BoundsError, format!("Invalid {what} slice indices [{lo} .. {hi}] (length is {len})")));
        }
        Ok((lo as usize, hi as usize))
    }

    pub(crate) fn slice_value(&mut self, src: Value, lo: Value, hi: Value) -> VmResult<Value> {
        match src {
            Value::Str(s) => {
                let len = self.vm.interns.cp_len(s);
                let (lo, hi) = self.normalize_slice(lo, hi, len, "string")?;
                let id = self.vm.interns.slice(s, lo, hi);
                Ok(Value::Str(id))
            }
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Array(a) => {
                    let len = a.len();
                    let (lo, hi) = self.normalize_slice(lo, hi, len, "array")?;
                    let HeapData::Array(a) = self.vm.heap.get(id) else { unreachable!() };
                    let values = a.slice(lo, hi);
                    let new_id = self.vm.heap.allocate(HeapData::Array(Array::from_values(values)));
                    Ok(Value::Ref(new_id))
                }
                HeapData::Memblock(m) => {
                    let len = m.len();
                    let (lo, hi) = self.normalize_slice(lo, hi, len, "memblock")?;
                    let HeapData::Memblock(m) = self.vm.heap.get(id) else {
                        unreachable!()
                    };
                    let bytes = m.slice(lo, hi);
                    let new_id = self.vm.heap.allocate(HeapData::Memblock(Memblock::from_bytes(bytes)));
                    Ok(Value::Ref(new_id))
                }
                _ => self.slice_fallback(src, lo, hi),
            },
            _ => self.slice_fallback(src, lo, hi),
        }
    }

    fn slice_fallback(&mut self, src: Value, lo: Value, hi: Value) -> VmResult<Value> {
        if let Some(f) = get_metamethod(self.vm, src, Metamethod::Slice) {
            let r = self.call_sync(f, src, &[lo, hi], 1)?;
            return Ok(r.first().copied().unwrap_or(Value::Null));
        }
        let k = self.kind_name(src);
        Err(self.type_error(format!("Attempting to slice a value of type '{k}'")))
    }

    pub(crate) fn slice_assign(&mut self, dest: Value, lo: Value, hi: Value, value: Value) -> VmResult<()> {
        match dest {
            Value::Ref(id) if matches!(self.vm.heap.get(id), HeapData::Array(_)) => {
                let len = match self.vm.heap.get(id) {
                    HeapData::Array(a) => a.len(),
                    _ => unreachable!(),
                };
                let (lo, hi) = self.normalize_slice(lo, hi, len, "array")?;
                let Value::Ref(src_id) = value else {
                    let k = self.kind_name(value);
                    return Err(self.type_error(format!("Attempting to slice-assign a '{k}' into an array")));
                };
                let src_values = match self.vm.heap.get(src_id) {
                    HeapData::Array(a) => a.values().to_vec(),
                    _ => {
                        let k = self.kind_name(value);
                        return Err(self.type_error(format!("Attempting to slice-assign a '{k}' into an array")));
                    }
                };
                if src_values.len() != hi - lo {
                    return Err(self.vm.make_exc(
                        ExcKind::RangeError,
                        format!("Attempting to slice-assign {} values into a slice of length {}", src_values.len(), hi - lo),
                    ));
                }
                if let HeapData::Array(a) = self.vm.heap.get_mut(id) {
                    for (i, v) in src_values.into_iter().enumerate() {
                        a.set(lo + i, v);
                    }
                }
                Ok(())
            }
            _ => {
                if let Some(f) = get_metamethod(self.vm, dest, Metamethod::SliceAssign) {
                    self.call_sync(f, dest, &[lo, hi, value], 0)?;
                    return Ok(());
                }
                let k = self.kind_name(dest);
                Err(self.type_error(format!("Attempting to slice-assign a value of type '{k}'")))
            }
        }
    }

    // === Concatenation ===

    /// `Cat` over a run of operands: all-strings join by bytes; runs with
    /// arrays build a new array; anything else goes through the
    /// `opCat`/`opCat_r` protocol left to right.
    pub(crate) fn concat_values(&mut self, first: usize, num: usize) -> VmResult<Value> {
        let operands: Vec<Value> = self.t.stack[first..first + num].to_vec();

        if operands.iter().all(|v| matches!(v, Value::Str(_))) {
            let ids: Vec<_> = operands
                .iter()
                .map(|v| match v {
                    Value::Str(s) => *s,
                    _ => unreachable!(),
                })
                .collect();
            let id = self.vm.interns.concat(&ids);
            return Ok(Value::Str(id));
        }

        let has_array = operands
            .iter()
            .any(|v| matches!(v, Value::Ref(id) if matches!(self.vm.heap.get(*id), HeapData::Array(_))));
        let has_mm_operand = operands.iter().any(|&v| {
            get_metamethod(self.vm, v, Metamethod::Cat).is_some()
                || get_metamethod(self.vm, v, Metamethod::CatR).is_some()
        });

        if has_array && !has_mm_operand {
            let mut out = Vec::new();
            for v in operands {
                match v {
                    Value::Ref(id) => match self.vm.heap.get(id) {
                        HeapData::Array(a) => out.extend_from_slice(a.values()),
                        _ => out.push(v),
                    },
                    _ => out.push(v),
                }
            }
            let id = self.vm.heap.allocate(HeapData::Array(Array::from_values(out)));
            return Ok(Value::Ref(id));
        }

        // Metamethod chain: fold left to right.
        let mut iter = operands.into_iter();
        let mut acc = iter.next().expect("concatenation of at least two operands");
        for next in iter {
            acc = self.concat_pair(acc, next)?;
        }
        Ok(acc)
    }

    fn concat_pair(&mut self, a: Value, b: Value) -> VmResult<Value> {
        if let (Value::Str(x), Value::Str(y)) = (a, b) {
            let id = self.vm.interns.concat(&[x, y]);
            return Ok(Value::Str(id));
        }
        match self.try_binary_mm(Metamethod::Cat, Metamethod::CatR, a, b)? {
            Some(v) => Ok(v),
            None => {
                let (ka, kb) = (self.kind_name(a), self.kind_name(b));
                Err(self.type_error(format!("Attempting to concatenate a '{ka}' and a '{kb}'")))
            }
        }
    }

    pub(crate) fn concat_assign(&mut self, dest: Value, first: usize, num: usize) -> VmResult<Value> {
        let operands: Vec<Value> = self.t.stack[first..first + num].to_vec();

        match dest {
            Value::Str(s) if operands.iter().all(|v| matches!(v, Value::Str(_))) => {
                let mut ids = vec![s];
                for v in operands {
                    if let Value::Str(x) = v {
                        ids.push(x);
                    }
                }
                let id = self.vm.interns.concat(&ids);
                Ok(Value::Str(id))
            }
            Value::Ref(id) if matches!(self.vm.heap.get(id), HeapData::Array(_)) => {
                for v in operands {
                    let elems = match v {
                        Value::Ref(vid) => match self.vm.heap.get(vid) {
                            HeapData::Array(a) => a.values().to_vec(),
                            _ => vec![v],
                        },
                        _ => vec![v],
                    };
                    if let HeapData::Array(a) = self.vm.heap.get_mut(id) {
                        for e in elems {
                            a.push(e);
                        }
                    }
                }
                Ok(dest)
            }
            _ => {
                if let Some(f) = get_metamethod(self.vm, dest, Metamethod::CatAssign) {
                    self.call_sync(f, dest, &operands, 0)?;
                    return Ok(dest);
                }
                // Fall back to building the concatenation value.
                let mut acc = dest;
                for v in operands {
                    acc = self.concat_pair(acc, v)?;
                }
                Ok(acc)
            }
        }
    }

    // === Globals ===

    fn env_namespace(&self, env: HeapId) -> &Namespace {
        match self.vm.heap.get(env) {
            HeapData::Namespace(ns) => ns,
            _ => unreachable!("environments are namespaces"),
        }
    }

    pub(crate) fn get_global(&mut self, env: HeapId, name: StringId) -> VmResult<Value> {
        let ns = self.env_namespace(env);
        if let Some(v) = ns.get(name) {
            return Ok(v);
        }
        if let Some(root) = ns.root {
            if let Some(v) = self.env_namespace(root).get(name) {
                return Ok(v);
            }
        }
        let name_str = self.vm.interns.get(name).to_owned();
        Err(self
            .vm
            .make_exc(ExcKind::NameError, format!("Attempting to get a non-existent global '{name_str}'")))
    }

    pub(crate) fn set_global(&mut self, env: HeapId, name: StringId, value: Value) -> VmResult<()> {
        let root = self.env_namespace(env).root;
        if let HeapData::Namespace(ns) = self.vm.heap.get_mut(env) {
            if ns.set_if_exists(name, value) {
                return Ok(());
            }
        }
        if let Some(root) = root {
            if let HeapData::Namespace(ns) = self.vm.heap.get_mut(root) {
                if ns.set_if_exists(name, value) {
                    return Ok(());
                }
            }
        }
        let name_str = self.vm.interns.get(name).to_owned();
        Err(self
            .vm
            .make_exc(ExcKind::NameError, format!("Attempting to set a non-existent global '{name_str}'")))
    }

    /// `NewGlobal` declares directly in the environment; redeclaration
    /// overwrites, so re-running a script refreshes its globals.
    pub(crate) fn new_global(&mut self, env: HeapId, name: StringId, value: Value) -> VmResult<()> {
        if let HeapData::Namespace(ns) = self.vm.heap.get_mut(env) {
            ns.set(name, value);
        }
        Ok(())
    }

    // === Loops ===

    /// `For` entry: validates the loop triple and normalizes the step sign.
    pub(crate) fn loop_for_entry(&mut self, base_reg: usize) -> VmResult<()> {
        let idx = self.t.stack[base_reg];
        let hi = self.t.stack[base_reg + 1];
        let step = self.t.stack[base_reg + 2];
        let (Value::Int(idx), Value::Int(hi), Value::Int(step)) = (idx, hi, step) else {
            return Err(self.type_error("Numeric for loop low, high, and step values must be integers".into()));
        };
        if step == 0 {
            return Err(self
                .vm
                .make_exc(ExcKind::ValueError, "Numeric for loop step value may not be 0"));
        }

        let mut step = step;
        if (idx > hi && step > 0) || (idx < hi && step < 0) {
            step = -step;
        }
        if step < 0 {
            self.t.stack[base_reg] = Value::Int(idx + step);
        }
        self.t.stack[base_reg + 2] = Value::Int(step);
        Ok(())
    }

    /// `Foreach` entry: non-function, non-thread containers are converted
    /// through `opApply`.
    pub(crate) fn loop_foreach_entry(&mut self, base_reg: usize) -> VmResult<()> {
        let src = self.t.stack[base_reg];
        let is_callable = matches!(
            src.kind(&self.vm.heap),
            CrocType::Function | CrocType::Thread
        );

        if !is_callable {
            let Some(method) = get_metamethod(self.vm, src, Metamethod::Apply) else {
                let k = self.kind_name(src);
                return Err(self.type_error(format!("No implementation of opApply for type '{k}'")));
            };
            let mode = self.t.stack[base_reg + 1];
            let results = self.call_sync(method, src, &[mode], 3)?;
            for i in 0..3 {
                self.t.stack[base_reg + i] = results.get(i).copied().unwrap_or(Value::Null);
            }

            let src = self.t.stack[base_reg];
            if !matches!(src.kind(&self.vm.heap), CrocType::Function | CrocType::Thread) {
                let k = self.kind_name(src);
                return Err(self.type_error(format!("Invalid iterable type '{k}' returned from opApply")));
            }
        }

        let src = self.t.stack[base_reg];
        if let Value::Ref(id) = src {
            if let HeapData::Thread(t) = self.vm.heap.get(id) {
                if t.state != ThreadState::Initial {
                    return Err(self.vm.make_exc(
                        ExcKind::StateError,
                        "Attempting to iterate over a thread that is not in the 'initial' state",
                    ));
                }
            }
        }
        Ok(())
    }

    /// One `ForeachLoop` iteration: calls the iterator function (or resumes
    /// the iterator thread) and stores the results into the user indices.
    /// Returns whether the loop continues.
    pub(crate) fn loop_foreach_step(&mut self, base_reg: usize, num_indices: usize) -> VmResult<bool> {
        let func = self.t.stack[base_reg];
        let state = self.t.stack[base_reg + 1];
        let control = self.t.stack[base_reg + 2];

        let results = self.call_sync(func, state, &[control], num_indices as isize)?;
        for i in 0..num_indices {
            self.t.stack[base_reg + 3 + i] = results.get(i).copied().unwrap_or(Value::Null);
        }

        match func {
            Value::Ref(id) if matches!(self.vm.heap.get(id), HeapData::Thread(_)) => {
                let HeapData::Thread(t) = self.vm.heap.get(id) else { unreachable!() };
                Ok(t.state != ThreadState::Dead)
            }
            _ => {
                let first = self.t.stack[base_reg + 3];
                if first.is_null() {
                    Ok(false)
                } else {
                    self.t.stack[base_reg + 2] = first;
                    Ok(true)
                }
            }
        }
    }

    // === Object creation ===

    pub(crate) fn make_class(&mut self, name: Value, first_base_abs: usize, num_bases: usize) -> VmResult<Value> {
        let Value::Str(name_id) = name else {
            let k = self.kind_name(name);
            return Err(self.type_error(format!("Class name must be a string, not a '{k}'")));
        };

        let mut class = Class::new(name_id);
        for i in 0..num_bases {
            let base = self.t.stack[first_base_abs + i];
            let Value::Ref(base_id) = base else {
                let k = self.kind_name(base);
                return Err(self.type_error(format!("Attempting to derive a class from a value of type '{k}'")));
            };
            let HeapData::Class(_) = self.vm.heap.get(base_id) else {
                let k = self.kind_name(base);
                return Err(self.type_error(format!("Attempting to derive a class from a value of type '{k}'")));
            };
            // Deriving freezes the base.
            if let HeapData::Class(b) = self.vm.heap.get_mut(base_id) {
                b.freeze();
            }
            let HeapData::Class(b) = self.vm.heap.get(base_id) else {
                unreachable!()
            };
            class.derive_from(base_id, b);
        }

        let id = self.vm.heap.allocate(HeapData::Class(class));
        Ok(Value::Ref(id))
    }

    pub(crate) fn make_namespace(&mut self, name: StringId, parent: Option<Value>) -> VmResult<Value> {
        match parent {
            None | Some(Value::Null) => {
                let id = self.vm.heap.allocate(HeapData::Namespace(Namespace::new(name)));
                Ok(Value::Ref(id))
            }
            Some(Value::Ref(pid)) if matches!(self.vm.heap.get(pid), HeapData::Namespace(_)) => {
                let parent_root = match self.vm.heap.get(pid) {
                    HeapData::Namespace(p) => p.root,
                    _ => None,
                };
                let id = self
                    .vm
                    .heap
                    .allocate(HeapData::Namespace(Namespace::with_parent(name, pid, parent_root)));
                Ok(Value::Ref(id))
            }
            Some(other) => {
                let k = self.kind_name(other);
                let name_str = self.vm.interns.get(name).to_owned();
                Err(self.type_error(format!(
                    "Attempted to use a '{k}' as a parent namespace for namespace '{name_str}'"
                )))
            }
        }
    }

    pub(crate) fn make_namespace_with_parent(&mut self, name: StringId, env: HeapId) -> VmResult<Value> {
        self.make_namespace(name, Some(Value::Ref(env)))
    }

    pub(crate) fn super_of(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Ref(id) => match self.vm.heap.get(id) {
                HeapData::Instance(inst) => Ok(Value::Ref(inst.class)),
                HeapData::Class(c) => Ok(c.parent.map_or(Value::Null, Value::Ref)),
                HeapData::Namespace(ns) => Ok(ns.parent.map_or(Value::Null, Value::Ref)),
                _ => {
                    let k = self.kind_name(v);
                    Err(self.type_error(format!("Cannot get the super of a '{k}'")))
                }
            },
            _ => {
                let k = self.kind_name(v);
                Err(self.type_error(format!("Cannot get the super of a '{k}'")))
            }
        }
    }

    pub(crate) fn add_class_member(&mut self, cls: Value, name: Value, value: Value, flags: usize) -> VmResult<()> {
        let Value::Ref(cls_id) = cls else {
            unreachable!("codegen guarantees a class register");
        };
        let Value::Str(name_id) = name else {
            unreachable!("codegen guarantees a string name");
        };

        let is_method = flags & 1 != 0;
        let is_override = flags & 2 != 0;

        let ok = match self.vm.heap.get_mut(cls_id) {
            HeapData::Class(c) => {
                if is_method {
                    c.add_method(name_id, value, is_override)
                } else {
                    c.add_field(name_id, value, is_override)
                }
            }
            _ => unreachable!("codegen guarantees a class register"),
        };

        if ok {
            return Ok(());
        }

        let what = if is_method { "method" } else { "field" };
        let name_str = self.vm.interns.get(name_id).to_owned();
        let cls_name = match self.vm.heap.get(cls_id) {
            HeapData::Class(c) => self.vm.interns.get(c.name).to_owned(),
            _ => String::new(),
        };
        let msg = if is_override {
            format!("Attempting to override {what} '{name_str}' in class '{cls_name}', but no such member already exists")
        } else {
            format!("Attempting to add a {what} '{name_str}' which already exists to class '{cls_name}'")
        };
        Err(self.vm.make_exc(ExcKind::FieldError, msg))
    }

    // === Varargs ===

    fn vararg_window(&self) -> (usize, usize) {
        let frame = self.t.current_frame();
        (frame.varg_base, frame.base - frame.varg_base)
    }

    pub(crate) fn vararg_index(&mut self, key: Value) -> VmResult<Value> {
        let (varg_base, num) = self.vararg_window();
        let Value::Int(mut idx) = key else {
            let k = self.kind_name(key);
            return Err(self.type_error(format!("Attempting to index 'vararg' with a '{k}'")));
        };
        if idx < 0 {
            idx += num as i64;
        }
        if idx < 0 || idx >= num as i64 {
            return Err(self
                .vm
                .make_exc(ExcKind::BoundsError, format!("Invalid 'vararg' index: {idx} (only have {num})")));
        }
        Ok(self.t.stack[varg_base + idx as usize])
    }

    pub(crate) fn vararg_index_assign(&mut self, key: Value, value: Value) -> VmResult<()> {
        let (varg_base, num) = self.vararg_window();
        let Value::Int(mut idx) = key else {
            let k = self.kind_name(key);
            return Err(self.type_error(format!("Attempting to index 'vararg' with a '{k}'")));
        };
        if idx < 0 {
            idx += num as i64;
        }
        if idx < 0 || idx >= num as i64 {
            return Err(self
                .vm
                .make_exc(ExcKind::BoundsError, format!("Invalid 'vararg' index: {idx} (only have {num})")));
        }
        self.t.stack[varg_base + idx as usize] = value;
        Ok(())
    }

    /// `VargSlice`: lo/hi live at the destination registers; the slice of
    /// the vararg window replaces them.
    pub(crate) fn vararg_slice(&mut self, dest: usize, num_wanted: usize) -> VmResult<()> {
        let (varg_base, num) = self.vararg_window();
        let lo = self.t.stack[dest];
        let hi = self.t.stack[dest + 1];
        let (lo, hi) = self.normalize_slice(lo, hi, num, "vararg")?;
        let slice_size = hi - lo;

        let needed = if num_wanted == 0 {
            self.t.stack_index = dest + slice_size;
            self.t.ensure_stack(self.t.stack_index + 1);
            slice_size
        } else {
            num_wanted - 1
        };
        self.t.ensure_stack(dest + needed + 1);
        for i in 0..needed {
            self.t.stack[dest + i] = if i < slice_size {
                self.t.stack[varg_base + lo + i]
            } else {
                Value::Null
            };
        }
        Ok(())
    }
}

fn as_float(v: Value) -> f64 {
    match v {
        Value::Int(i) => i as f64,
        Value::Float(f) => f,
        _ => unreachable!("numeric fast paths check kinds first"),
    }
}
