//! The embedding surface: eval, global access, call/try_call, compiled
//! artifacts, output capture, and debug hooks.

use croc::{CollectStringPrint, Object, Vm};

fn collecting_vm() -> Vm {
    Vm::with_writer(Box::new(CollectStringPrint::new()))
}

#[test]
fn eval_returns_the_expression_value() {
    let mut vm = collecting_vm();
    assert_eq!(vm.eval("1 + 2").unwrap(), Object::Int(3));
    assert_eq!(vm.eval("\"a\" ~ \"b\"").unwrap(), Object::Str("ab".to_owned()));
    assert_eq!(vm.eval("1.5 * 2").unwrap(), Object::Float(3.0));
    assert_eq!(vm.eval("null").unwrap(), Object::Null);
    assert_eq!(
        vm.eval("[1, 2, 3]").unwrap(),
        Object::Array(vec![Object::Int(1), Object::Int(2), Object::Int(3)])
    );
}

#[test]
fn call_global_passes_arguments_and_returns_results() {
    let mut vm = collecting_vm();
    vm.run_source("m.croc", "global function addmul(a, b) { return a + b, a * b }").unwrap();
    let results = vm.call_global("addmul", &[Object::Int(3), Object::Int(4)]).unwrap();
    assert_eq!(results, vec![Object::Int(7), Object::Int(12)]);
}

#[test]
fn globals_round_trip_through_the_host() {
    let mut vm = collecting_vm();
    vm.set_global("greeting", &Object::Str("hi".to_owned()));
    vm.run_source("m.croc", "global shout = greeting ~ \"!\"").unwrap();
    assert_eq!(vm.global("shout"), Some(Object::Str("hi!".to_owned())));
    assert_eq!(vm.global("missing"), None);
}

#[test]
fn try_call_reports_failure_without_unwinding_the_host() {
    let mut vm = collecting_vm();
    vm.run_source("m.croc", "global function boom() { throw ValueError(\"nope\") }").unwrap();
    let err = vm.try_call("boom", &[]).unwrap_err();
    assert_eq!(err.kind, "ValueError");
    assert_eq!(err.message, "nope");

    // The VM stays usable after the failure.
    assert_eq!(vm.eval("40 + 2").unwrap(), Object::Int(42));
}

#[test]
fn output_capture_is_per_call() {
    let mut vm = collecting_vm();
    vm.run_source("a.croc", "write(\"one\")").unwrap();
    assert_eq!(vm.take_output(), "one");
    vm.run_source("b.croc", "write(\"two\")").unwrap();
    assert_eq!(vm.take_output(), "two");
}

#[test]
fn compiled_modules_install_across_vms() {
    let mut compiler_vm = collecting_vm();
    let artifact = compiler_vm
        .compile_module("lib.croc", "global function square(x) { return x * x }")
        .unwrap();

    // Serialization round-trip, then install into a fresh VM.
    let bytes = serde_json::to_vec(&artifact).unwrap();
    let restored: croc::CompiledModule = serde_json::from_slice(&bytes).unwrap();

    let mut vm = collecting_vm();
    vm.run_compiled(&restored).unwrap();
    assert_eq!(vm.call_global("square", &[Object::Int(9)]).unwrap(), vec![Object::Int(81)]);
}

#[test]
fn debug_hooks_observe_calls_and_returns() {
    let mut vm = collecting_vm();
    vm.run_source(
        "m.croc",
        r#"
        global events = []
        global function hook(ev) { events ~= [ev] }
        global function target() { return 1 }
    "#,
    )
    .unwrap();

    vm.set_debug_hook("hook", "cr", 0).unwrap();
    vm.call_global("target", &[]).unwrap();
    vm.remove_debug_hook();

    assert_eq!(vm.eval("#events").unwrap(), Object::Int(2));
    assert_eq!(vm.eval("events[0]").unwrap(), Object::Str("call".to_owned()));
    assert_eq!(vm.eval("events[1]").unwrap(), Object::Str("ret".to_owned()));
}

#[test]
fn line_hooks_fire_per_source_line() {
    let mut vm = collecting_vm();
    vm.run_source(
        "m.croc",
        r#"
        global lines = 0
        global function hook(ev) { lines++ }
        global function work() {
            local a = 1
            local b = 2
            return a + b
        }
    "#,
    )
    .unwrap();

    vm.set_debug_hook("hook", "l", 0).unwrap();
    vm.call_global("work", &[]).unwrap();
    vm.remove_debug_hook();

    let Object::Int(lines) = vm.eval("lines").unwrap() else {
        panic!("lines should be an integer");
    };
    assert!(lines >= 3, "expected at least one line event per body line, got {lines}");
}

#[test]
fn garbage_collection_keeps_reachable_objects() {
    let mut vm = collecting_vm();
    vm.run_source("m.croc", "global keep = [1, 2, 3]").unwrap();
    vm.collect_garbage();
    assert_eq!(
        vm.eval("keep").unwrap(),
        Object::Array(vec![Object::Int(1), Object::Int(2), Object::Int(3)])
    );
}

#[test]
fn scripts_can_install_an_unhandled_exception_handler() {
    let mut vm = collecting_vm();
    vm.run_source("m.croc", "global function onBoom(e) { write(\"saw:\", e.msg) }").unwrap();
    vm.set_unhandled_handler("onBoom").unwrap();

    let err = vm.run_source("bad.croc", "throw Exception(\"kapow\")").unwrap_err();
    assert_eq!(err.kind, "Exception");
    assert_eq!(vm.take_output(), "saw:kapow");
}
