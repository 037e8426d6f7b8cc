//! End-to-end execution scenarios: source in, printed output out.

use croc::{CollectStringPrint, Vm};

fn run(src: &str) -> String {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    if let Err(e) = vm.run_source("test.croc", src) {
        panic!("script failed: {}", e.traceback_string());
    }
    vm.take_output()
}

#[test]
fn fibonacci_via_recursion() {
    let out = run(r#"
        local function f(n) {
            if(n < 2)
                return n
            return f(n - 1) + f(n - 2)
        }
        writeln(f(10))
    "#);
    assert_eq!(out, "55\n");
}

#[test]
fn coroutine_generator() {
    let out = run(r#"
        local function gen() {
            for(local i = 1; i <= 3; i++)
                yield i
        }
        local t = thread.new(gen)
        foreach(v; t)
            write(v, " ")
    "#);
    assert_eq!(out, "1 2 3 ");
}

#[test]
fn try_catch_with_finally() {
    let out = run(r#"
        try {
            throw Exception("x")
        } catch(e: Exception) {
            write("caught")
        } finally {
            write("-end")
        }
    "#);
    assert_eq!(out, "caught-end");
}

#[test]
fn tailcall_does_not_grow_the_stack() {
    let out = run(r#"
        local function loop(n) {
            if(n == 0)
                return 0
            return loop(n - 1)
        }
        writeln(loop(100000))
    "#);
    assert_eq!(out, "0\n");
}

#[test]
fn string_interning_identity() {
    let out = run(r#"
        local a = "hello"
        local b = "hel" ~ "lo"
        writeln(a is b)
    "#);
    assert_eq!(out, "true\n");
}

#[test]
fn interning_survives_runtime_concatenation() {
    // The right-hand concatenation is not constant-foldable, so identity
    // must come from the runtime intern table.
    let out = run(r#"
        local a = "hello"
        local prefix = "hel"
        writeln(a is (prefix ~ "lo"))
    "#);
    assert_eq!(out, "true\n");
}

#[test]
fn switch_on_ranges() {
    let out = run(r#"
        switch(3) {
            case 1 .. 5:
                write("small")
                break
            case 6 .. 10:
                write("big")
                break
            default:
                write("other")
        }
    "#);
    assert_eq!(out, "small");
}

#[test]
fn arithmetic_round_trips() {
    let out = run(r#"
        local n = 12345
        writeln(-(-n) == n)
        writeln(n + 0 == n)
        writeln(n * 1 == n)
        local x = 1.5
        local y = 2.25
        writeln((x + y) == (y + x))
    "#);
    assert_eq!(out, "true\ntrue\ntrue\ntrue\n");
}

#[test]
fn upvalue_closure_soundness() {
    // Each iteration's captured local is closed at scope exit with the value
    // it had there.
    let out = run(r#"
        local fns = []
        for(local i = 0; i < 3; i++) {
            local j = i * 10
            fns ~= [function() { return j }]
        }
        write(fns[0](), " ", fns[1](), " ", fns[2]())
    "#);
    assert_eq!(out, "0 10 20");
}

#[test]
fn shared_upvalue_is_one_box() {
    let out = run(r#"
        local function counter() {
            local x = 0
            local function bump() { x++ }
            local function get() { return x }
            bump()
            bump()
            return get()
        }
        writeln(counter())
    "#);
    assert_eq!(out, "2\n");
}

#[test]
fn scope_actions_on_success_and_failure() {
    let out = run(r#"
        local function test(fail) {
            scope(exit) write("E")
            scope(success) write("S")
            scope(failure) write("F")
            if(fail)
                throw Exception("x")
            write("ok")
        }
        try { test(false) } catch(e) {}
        write("|")
        try { test(true) } catch(e) {}
    "#);
    assert_eq!(out, "okSE|FE");
}

#[test]
fn finally_runs_on_return() {
    let out = run(r#"
        local function f() {
            try {
                return "r"
            } finally {
                write("fin-")
            }
        }
        write(f())
    "#);
    assert_eq!(out, "fin-r");
}

#[test]
fn finally_runs_on_throw_through() {
    let out = run(r#"
        local function f() {
            try {
                throw Exception("boom")
            } finally {
                write("fin-")
            }
        }
        try { f() } catch(e) { write(e.msg) }
    "#);
    assert_eq!(out, "fin-boom");
}

#[test]
fn switch_dispatches_constant_cases_through_the_table() {
    let out = run(r#"
        local function pick(x) {
            switch(x) {
                case 1: return "one"
                case 2: return "two"
                case "s": return "str"
                default: return "none"
            }
        }
        write(pick(1), pick(2), pick("s"), pick(99))
    "#);
    assert_eq!(out, "onetwostrnone");
}

#[test]
fn constant_folding_preserves_behavior() {
    // Folded and unfolded forms produce the same values.
    let out = run(r#"
        local a = 2 + 3 * 4
        local x = 2
        local b = x + 3 * 4
        writeln(a == b)
        writeln(10 / 4)
        writeln(#"héllo")
    "#);
    assert_eq!(out, "true\n2\n5\n");
}
