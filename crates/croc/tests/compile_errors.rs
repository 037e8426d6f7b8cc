//! Compile-time rejection: lexical, syntactic, and semantic failures all
//! surface before any bytecode is installed.

use croc::{CollectStringPrint, Exception, Vm};

fn compile_err(src: &str) -> Exception {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    vm.run_source("test.croc", src).expect_err("source should not compile")
}

#[test]
fn unterminated_string_is_lexical() {
    let err = compile_err("local s = \"abc");
    assert_eq!(err.kind, "LexicalException");
}

#[test]
fn unterminated_block_comment_is_lexical() {
    let err = compile_err("/* nested /* deeper */ still open");
    assert_eq!(err.kind, "LexicalException");
}

#[test]
fn invalid_escape_is_lexical() {
    let err = compile_err(r#"local s = "\q""#);
    assert_eq!(err.kind, "LexicalException");
}

#[test]
fn integer_literal_overflow_is_lexical() {
    let err = compile_err("local n = 99999999999999999999999999");
    assert_eq!(err.kind, "LexicalException");
}

#[test]
fn lone_expression_statement_is_rejected() {
    let err = compile_err("1 + 2");
    assert_eq!(err.kind, "SyntaxException");
}

#[test]
fn statements_need_terminators() {
    let err = compile_err("local a = 1 local b = 2 writeln(a) writeln(b)");
    assert_eq!(err.kind, "SyntaxException");
}

#[test]
fn newlines_terminate_statements() {
    // The same tokens split across lines parse fine.
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    vm.run_source("test.croc", "local a = 1\nlocal b = 2\nwriteln(a + b)").unwrap();
    assert_eq!(vm.take_output(), "3\n");
}

#[test]
fn division_by_zero_folds_to_a_compile_error() {
    let err = compile_err("local x = 1 / 0");
    assert_eq!(err.kind, "SemanticException");
    assert!(err.message.contains("divide by zero"), "{}", err.message);
}

#[test]
fn modulo_by_zero_folds_to_a_compile_error() {
    let err = compile_err("local x = 1 % 0");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn constant_type_mismatch_folds_to_a_compile_error() {
    let err = compile_err("local x = 1 + \"s\"");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn return_inside_finally_is_rejected() {
    let err = compile_err("local function f() { try { } finally { return 1 } }");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn break_crossing_a_finally_is_rejected() {
    let err = compile_err("while(true) { try { } finally { break } }");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn break_inside_a_loop_inside_finally_is_fine() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    vm.run_source(
        "test.croc",
        r#"
        try { } finally {
            while(true)
                break
            write("ok")
        }
    "#,
    )
    .unwrap();
    assert_eq!(vm.take_output(), "ok");
}

#[test]
fn duplicate_case_values_are_rejected() {
    let err = compile_err("switch(1) { case 1: write(\"a\") case 1: write(\"b\") default: write(\"c\") }");
    assert_eq!(err.kind, "SemanticException");
    assert!(err.message.contains("Duplicate case"), "{}", err.message);
}

#[test]
fn zero_for_step_is_rejected() {
    let err = compile_err("for(i: 0 .. 10, 0) { }");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn non_integer_for_bounds_are_rejected() {
    let err = compile_err("for(i: 0 .. \"ten\") { }");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn vararg_outside_variadic_function_is_rejected() {
    let err = compile_err("local function f(x) { return #vararg }");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn duplicate_local_in_one_declaration_is_rejected() {
    let err = compile_err("local a, a = 1, 2");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn shadowing_an_active_local_is_rejected() {
    let err = compile_err("local a = 1\nlocal a = 2");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn break_outside_a_loop_is_rejected() {
    let err = compile_err("break");
    assert_eq!(err.kind, "SemanticException");
}

#[test]
fn catchall_must_be_last() {
    let err = compile_err("try { } catch(e) { } catch(f: TypeError) { }");
    assert_eq!(err.kind, "SyntaxException");
}

#[test]
fn decorators_are_rejected_on_variables() {
    let err = compile_err("@foo\nlocal x = 1");
    assert_eq!(err.kind, "SyntaxException");
}

#[test]
fn error_location_points_at_the_offense() {
    let err = compile_err("local a = 1\nlocal b = 2 / 0");
    let loc = err.location.expect("compile errors carry locations");
    assert_eq!(loc.file, "test.croc");
    assert_eq!(loc.line, 2);
}

#[test]
fn line_pragma_retargets_locations() {
    let err = compile_err("#line 100 \"virtual.croc\"\nlocal x = 1 / 0");
    let loc = err.location.expect("location");
    assert_eq!(loc.file, "virtual.croc");
    assert_eq!(loc.line, 100);
}

#[test]
fn doc_comments_cannot_stack() {
    let err = compile_err("/// one\n/// two\nlocal x = 1");
    assert_eq!(err.kind, "LexicalException");
}

#[test]
fn verbatim_and_raw_strings_lex() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    vm.run_source(
        "test.croc",
        "local a = [[verb\\atim]]\nlocal b = @\"raw\\here\"\nlocal c = [=[has ]] inside]=]\nwrite(a, \"|\", b, \"|\", c)",
    )
    .unwrap();
    assert_eq!(vm.take_output(), "verb\\atim|raw\\here|has ]] inside|");
}

#[test]
fn numeric_literal_forms() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    vm.run_source(
        "test.croc",
        "write(0b101, \" \", 0xFF, \" \", 1_000_000, \" \", 1.5e2, \" \", .25)",
    )
    .unwrap();
    assert_eq!(vm.take_output(), "5 255 1000000 150.0 0.25");
}
