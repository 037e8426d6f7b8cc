//! Coroutine pairing, state transitions, resume values, and halting.

use croc::{CollectStringPrint, Vm};

fn run(src: &str) -> String {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    if let Err(e) = vm.run_source("test.croc", src) {
        panic!("script failed: {}", e.traceback_string());
    }
    vm.take_output()
}

#[test]
fn yield_and_resume_values_pair_up() {
    let out = run(r#"
        local function echo() {
            local got = yield("first")
            yield(got)
        }
        local t = thread.new(echo)
        write(t())
        write("-", t("second"))
    "#);
    assert_eq!(out, "first-second");
}

#[test]
fn thread_states_transition() {
    let out = run(r#"
        local function gen() { yield(1) }
        local t = thread.new(gen)
        write(thread.state(t))
        t()
        write("-", thread.state(t))
        t()
        write("-", thread.state(t))
    "#);
    assert_eq!(out, "initial-suspended-dead");
}

#[test]
fn resuming_a_dead_thread_is_a_state_error() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    let err = vm
        .run_source(
            "test.croc",
            r#"
            local function gen() { return 0 }
            local t = thread.new(gen)
            t()
            t()
        "#,
        )
        .unwrap_err();
    assert_eq!(err.kind, "StateError");
}

#[test]
fn yield_from_the_main_thread_is_an_error() {
    let mut vm = Vm::with_writer(Box::new(CollectStringPrint::new()));
    let err = vm.run_source("test.croc", "yield(1)").unwrap_err();
    assert_eq!(err.kind, "RuntimeError");
}

#[test]
fn coroutine_return_values_are_the_final_yields() {
    let out = run(r#"
        local function gen() {
            yield(1)
            return 99
        }
        local t = thread.new(gen)
        write(t())
        write("-", t())
        write("-", thread.state(t))
    "#);
    assert_eq!(out, "1-99-dead");
}

#[test]
fn exceptions_propagate_from_coroutine_to_resumer() {
    let out = run(r#"
        local function bad() {
            yield(1)
            throw Exception("inner")
        }
        local t = thread.new(bad)
        write(t())
        try {
            t()
        } catch(e: Exception) {
            write("-", e.msg)
        }
        write("-", thread.state(t))
    "#);
    assert_eq!(out, "1-inner-dead");
}

#[test]
fn halting_a_suspended_thread_kills_it_on_next_resume() {
    let out = run(r#"
        local function gen() {
            yield(1)
            yield(2)
        }
        local t = thread.new(gen)
        write(t())
        thread.halt(t)
        write("-", thread.state(t))
        t()
        write("-", thread.state(t))
    "#);
    assert_eq!(out, "1-suspended-dead");
}

#[test]
fn nested_coroutines_resume_independently() {
    let out = run(r#"
        local function inner() {
            yield("a")
            yield("b")
        }
        local function outer() {
            local t = thread.new(inner)
            yield(t())
            yield(t())
        }
        local o = thread.new(outer)
        write(o(), o())
    "#);
    assert_eq!(out, "ab");
}

#[test]
fn foreach_over_a_thread_consumes_each_yield_once() {
    let out = run(r#"
        local resumes = 0
        local function gen() {
            for(local i = 0; i < 4; i++) {
                resumes++
                yield(i)
            }
        }
        foreach(v; thread.new(gen))
            write(v)
        write("|", resumes)
    "#);
    assert_eq!(out, "0123|4");
}
