//! Exception semantics: typed catches, rethrow, tracebacks, finally
//! interactions, and the standard-exception registry.

use croc::{CollectStringPrint, Vm};

fn run(src: &str) -> String {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    if let Err(e) = vm.run_source("test.croc", src) {
        panic!("script failed: {}", e.traceback_string());
    }
    vm.take_output()
}

fn run_err(src: &str) -> croc::Exception {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    vm.run_source("test.croc", src).unwrap_err()
}

#[test]
fn typed_catch_clauses_select_by_class() {
    let out = run(r#"
        local function classify(make) {
            try {
                throw make("x")
            } catch(e: TypeError) {
                return "type"
            } catch(e: ValueError | RangeError) {
                return "numeric"
            } catch(e) {
                return "other"
            }
        }
        write(classify(TypeError), "-", classify(RangeError), "-", classify(Exception))
    "#);
    assert_eq!(out, "type-numeric-other");
}

#[test]
fn uncaught_typed_clause_rethrows() {
    let out = run(r#"
        try {
            try {
                throw ValueError("v")
            } catch(e: TypeError) {
                write("wrong")
            }
        } catch(e: ValueError) {
            write("outer:", e.msg)
        }
    "#);
    assert_eq!(out, "outer:v");
}

#[test]
fn exception_carries_location_and_traceback() {
    let err = run_err("local function f() { throw Exception(\"deep\") }\nlocal function g() { f() }\ng()");
    assert_eq!(err.kind, "Exception");
    assert_eq!(err.message, "deep");
    let loc = err.location.expect("throw site recorded");
    assert_eq!(loc.file, "test.croc");
    assert_eq!(loc.line, 1);
    // Traceback walks outward: f, then g, then the top level.
    assert!(err.traceback.len() >= 3, "traceback too short: {:?}", err.traceback);
}

#[test]
fn rethrow_preserves_the_original_location() {
    let err = run_err(
        r#"local function inner() { throw Exception("orig") }
try {
    inner()
} catch(e) {
    throw e
}"#,
    );
    assert_eq!(err.message, "orig");
    assert_eq!(err.location.expect("location").line, 1);
}

#[test]
fn throwing_a_non_instance_is_a_type_error() {
    let err = run_err("throw 42");
    assert_eq!(err.kind, "TypeError");
}

#[test]
fn finally_throw_replaces_pending_exception() {
    // Last throw wins when a finally block itself throws.
    let out = run(r#"
        try {
            try {
                throw Exception("first")
            } finally {
                throw ValueError("second")
            }
        } catch(e) {
            write(e.super is ValueError, "-", e.msg)
        }
    "#);
    assert_eq!(out, "true-second");
}

#[test]
fn nested_finallys_all_run_during_unwind() {
    let out = run(r#"
        local function f() {
            try {
                try {
                    throw Exception("x")
                } finally {
                    write("inner-")
                }
            } finally {
                write("outer-")
            }
        }
        try { f() } catch(e) { write("caught") }
    "#);
    assert_eq!(out, "inner-outer-caught");
}

#[test]
fn errors_inside_native_operations_are_catchable() {
    let out = run(r#"
        try {
            local x = 1 / [].opNope
        } catch(e: FieldError) {
            write("field")
        }
        try {
            local a = [1]
            local v = a[10]
        } catch(e: BoundsError) {
            write("-bounds")
        }
        local d = 0
        try {
            local v = 1 / d
        } catch(e: ValueError) {
            write("-div")
        }
    "#);
    assert_eq!(out, "field-bounds-div");
}

#[test]
fn standard_exception_registry_is_global() {
    let out = run(r#"
        write(TypeError is TypeError)
        write("-", typeof(Exception))
        write("-", NameError("n").msg)
    "#);
    assert_eq!(out, "true-class-n");
}

#[test]
fn unresolved_global_is_a_name_error() {
    let err = run_err("writeln(noSuchThing)");
    assert_eq!(err.kind, "NameError");
}

#[test]
fn switch_without_matching_case_or_default_is_a_switch_error() {
    let err = run_err("switch(9) { case 1: write(\"a\") }");
    assert_eq!(err.kind, "SwitchError");
}
