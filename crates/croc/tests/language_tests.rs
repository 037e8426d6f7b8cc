//! Language-surface coverage: classes, namespaces, imports, comprehensions,
//! decorators, varargs, and operator semantics.

use croc::{CollectStringPrint, Vm};

fn run(src: &str) -> String {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    if let Err(e) = vm.run_source("test.croc", src) {
        panic!("script failed: {}", e.traceback_string());
    }
    vm.take_output()
}

#[test]
fn class_with_constructor_and_method() {
    let out = run(r#"
        class Point {
            x = 0
            y = 0
            function constructor(x, y) {
                this.x = x
                this.y = y
            }
            function sum() { return this.x + this.y }
        }
        local p = Point(3, 4)
        writeln(p.sum())
    "#);
    assert_eq!(out, "7\n");
}

#[test]
fn derived_class_inherits_and_overrides() {
    let out = run(r#"
        class A {
            function who() { return "A" }
            function greet() { return "hi " ~ this.who() }
        }
        class B : A {
            override function who() { return "B" }
        }
        write(A().greet(), " ", B().greet())
    "#);
    assert_eq!(out, "hi A hi B");
}

#[test]
fn instance_field_writes_stay_per_instance() {
    let out = run(r#"
        class Box { v = 0 }
        local a = Box()
        local b = Box()
        a.v = 1
        b.v = 2
        write(a.v, b.v)
    "#);
    assert_eq!(out, "12");
}

#[test]
fn adding_a_field_to_an_instance_is_an_error() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    let err = vm
        .run_source("test.croc", "class C { } local c = C() c.nope = 1")
        .unwrap_err();
    assert_eq!(err.kind, "FieldError");
}

#[test]
fn superof_walks_the_derivation() {
    let out = run(r#"
        class A { }
        class B : A { }
        local b = B()
        writeln(b.super is B)
        writeln(B.super is A)
        writeln(A.super is null)
    "#);
    assert_eq!(out, "true\ntrue\ntrue\n");
}

#[test]
fn metamethods_drive_operators() {
    let out = run(r#"
        class Vec {
            x = 0
            function constructor(x) { this.x = x }
            function opAdd(other) { return Vec(this.x + other.x) }
            function opCmp(other) { return this.x <=> other.x }
        }
        local v = Vec(1) + Vec(2)
        writeln(v.x)
        writeln(Vec(1) < Vec(2))
        writeln(Vec(5) <= Vec(2))
    "#);
    assert_eq!(out, "3\ntrue\nfalse\n");
}

#[test]
fn namespace_fields_and_functions() {
    let out = run(r#"
        namespace math {
            pi = 3
            function double(x) { return x * 2 }
        }
        writeln(math.double(math.pi))
    "#);
    assert_eq!(out, "6\n");
}

#[test]
fn import_with_selective_symbols() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    vm.register_module_source("util", "global function triple(x) { return x * 3 }\nglobal seven = 7");
    vm.run_source(
        "test.croc",
        r#"
        import util : triple, seven
        writeln(triple(5) + seven)
    "#,
    )
    .unwrap();
    assert_eq!(vm.take_output(), "22\n");
}

#[test]
fn import_is_cached_and_alias_binds_the_namespace() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    vm.register_module_source("counter", "write(\"loaded-\")\nglobal n = 1");
    vm.run_source(
        "test.croc",
        r#"
        import counter as c1
        import counter as c2
        writeln(c1 is c2)
    "#,
    )
    .unwrap();
    // The module body runs once; the second import returns the cached
    // namespace.
    assert_eq!(vm.take_output(), "loaded-true\n");
}

#[test]
fn missing_module_is_an_import_exception() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    let err = vm.run_source("test.croc", "import nope").unwrap_err();
    assert_eq!(err.kind, "ImportException");
}

#[test]
fn vararg_length_indexing_and_spread() {
    let out = run(r#"
        local function sum(vararg) {
            local s = 0
            for(local i = 0; i < #vararg; i++)
                s += vararg[i]
            return s
        }
        local function spread(vararg) { return sum(vararg) }
        writeln(sum(1, 2, 3, 4))
        writeln(spread(5, 6, 7))
    "#);
    assert_eq!(out, "10\n18\n");
}

#[test]
fn multi_assignment_evaluates_in_source_order() {
    let out = run(r#"
        local a, b = 1, 2
        a, b = b, a
        write(a, b)
    "#);
    assert_eq!(out, "21");
}

#[test]
fn multi_return_spreads_into_targets() {
    let out = run(r#"
        local function two() { return 10, 20 }
        local a, b = two()
        write(a, "/", b)
    "#);
    assert_eq!(out, "10/20");
}

#[test]
fn array_comprehension_with_filter() {
    let out = run(r#"
        local evens = [x foreach i, x; [1, 2, 3, 4, 5, 6] if(x % 2 == 0)]
        write(#evens, ":", evens[0], evens[1], evens[2])
    "#);
    assert_eq!(out, "3:246");
}

#[test]
fn numeric_for_comprehension() {
    let out = run(r#"
        local squares = [i * i for(i: 1 .. 4)]
        write(squares[0], squares[1], squares[2])
    "#);
    assert_eq!(out, "149");
}

#[test]
fn table_comprehension() {
    let out = run(r#"
        local t = { [x] = x * 10 foreach i, x; [1, 2, 3] }
        write(t[1], t[2], t[3])
    "#);
    assert_eq!(out, "102030");
}

#[test]
fn decorator_wraps_a_function_declaration() {
    let out = run(r#"
        local function addOne(f) {
            return function(x) { return f(x) + 1 }
        }
        @addOne
        function g(x) { return x * 2 }
        writeln(g(5))
    "#);
    assert_eq!(out, "11\n");
}

#[test]
fn conditional_assignment_only_fills_null() {
    let out = run(r#"
        local x
        x ?= 5
        x ?= 10
        writeln(x)
    "#);
    assert_eq!(out, "5\n");
}

#[test]
fn default_parameters_apply_on_null() {
    let out = run(r#"
        local function greet(name = "world") { return "hi " ~ name }
        write(greet(), "|", greet("croc"))
    "#);
    assert_eq!(out, "hi world|hi croc");
}

#[test]
fn parameter_typemasks_reject_bad_arguments() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    let err = vm
        .run_source(
            "test.croc",
            "local function f(x: int) { return x }\nf(\"nope\")",
        )
        .unwrap_err();
    assert_eq!(err.kind, "TypeError");
}

#[test]
fn class_typed_parameters_check_derivation() {
    let out = run(r#"
        class Animal { }
        class Dog : Animal { }
        local function pet(a: Animal) { return "ok" }
        writeln(pet(Dog()))
    "#);
    assert_eq!(out, "ok\n");
}

#[test]
fn foreach_over_builtin_containers() {
    let out = run(r#"
        local total = 0
        foreach(k, v; { [1] = 10, [2] = 20 })
            total += v
        write(total, "|")
        foreach(i, c; "abc")
            write(c)
        write("|")
        foreach(i, x; [7, 8])
            write(i, ":", x, " ")
    "#);
    assert_eq!(out, "30|abc|0:7 1:8 ");
}

#[test]
fn string_indexing_and_slicing_are_by_codepoint() {
    let out = run(r#"
        local s = "héllo"
        local mid = s
        write(mid[1], "|", mid[1 .. 3], "|", mid[-1])
    "#);
    assert_eq!(out, "é|él|o");
}

#[test]
fn array_slicing_and_length_assignment() {
    let out = run(r#"
        local a = [1, 2, 3, 4]
        local b = a[1 .. 3]
        write(#b, ":", b[0], b[1], "|")
        #a = 6
        write(#a, a[5] is null)
    "#);
    assert_eq!(out, "2:23|6true");
}

#[test]
fn concatenation_of_arrays_flattens() {
    let out = run(r#"
        local a = [1] ~ [2, 3] ~ 4
        write(#a, ":", a[0], a[1], a[2], a[3])
    "#);
    assert_eq!(out, "4:1234");
}

#[test]
fn labeled_break_escapes_the_outer_loop() {
    let out = run(r#"
        for outer(local i = 0; i < 3; i++) {
            for(local j = 0; j < 3; j++) {
                if(j == 1)
                    break outer
                write(i, j, " ")
            }
        }
        write("done")
    "#);
    assert_eq!(out, "00 done");
}

#[test]
fn while_with_condition_binding() {
    let out = run(r#"
        local n = 3
        local function next() {
            n--
            if(n == 0)
                return null
            return n
        }
        while(local v = next())
            write(v)
    "#);
    assert_eq!(out, "21");
}

#[test]
fn logical_operators_short_circuit() {
    let out = run(r#"
        local hits = 0
        local function bump() { hits++; return true }
        local a = false && bump()
        local b = true || bump()
        write(hits, a, b)
    "#);
    assert_eq!(out, "0falsetrue");
}

#[test]
fn ternary_and_not_inversion() {
    let out = run(r#"
        local x = 5
        write(x > 3 ? "big" : "small", "|", !(x < 3))
    "#);
    assert_eq!(out, "big|true");
}

#[test]
fn in_operator_on_containers() {
    let out = run(r#"
        write(2 in [1, 2, 3])
        write("ell" in "hello")
        write(5 in { [1] = true })
    "#);
    assert_eq!(out, "truetruefalse");
}

#[test]
fn compound_assignment_operators() {
    let out = run(r#"
        local x = 10
        x += 5
        x -= 3
        x *= 2
        x /= 4
        write(x, "|")
        local s = "a"
        s ~= "b" ~ "c"
        write(s)
    "#);
    assert_eq!(out, "6|abc");
}

#[test]
fn index_and_field_metamethods_supply_fallbacks() {
    let out = run(r#"
        class Sparse {
            function opIndex(k) { return "idx:" ~ toString(k) }
            function opIndexAssign(k, v) { this.last = toString(k) ~ "=" ~ toString(v) }
            function opField(name) { return "field:" ~ name }
            last = ""
        }
        local s = Sparse()
        write(s[3], "|")
        s[4] = 9
        write(s.last, "|", s.whatever)
    "#);
    assert_eq!(out, "idx:3|4=9|field:whatever");
}

#[test]
fn memblocks_index_resize_and_slice() {
    let out = run(r#"
        local m = memblock(4)
        m[0] = 65
        m[1] = 66
        write(#m, ":", m[0], ",", m[1], ",", m[-1])
        #m = 6
        write("|", #m)
        local s = m[0 .. 2]
        write("|", #s, ":", s[1])
    "#);
    assert_eq!(out, "4:65,66,0|6|2:66");
}

#[test]
fn weakrefs_read_null_after_collection() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    vm.run_source("a.croc", "global arr = [1, 2]\nglobal w = weakref(arr)").unwrap();
    assert_eq!(vm.eval("deref(w) is arr").unwrap(), croc::Object::Bool(true));

    vm.run_source("b.croc", "global arr = null").unwrap();
    vm.collect_garbage();
    assert_eq!(vm.eval("deref(w)").unwrap(), croc::Object::Null);
}
