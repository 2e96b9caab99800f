/// Integration tests for the statement engine.
///
/// These verify:
///   • Indentation-driven block assembly and the statement result protocol
///   • `then`-chaining on a shared body
///   • Loops consuming break/continue, `return` crossing nesting levels
///   • switch/case breakLevel semantics, try/catch binding
///   • Declarations, declarative mode, comments and joiners
///   • State serialization round-trips
use cantus::{Evaluator, Value};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

fn eval(src: &str) -> String {
    Evaluator::new().eval(src).expect("script should evaluate")
}

fn eval_err(src: &str) -> String {
    Evaluator::new()
        .eval(src)
        .expect_err("script should fail")
        .to_string()
}

// ─── Blocks & loops ───────────────────────────────────────────────────────

#[test]
fn test_indented_while_with_break() {
    let src = "\
let a = 1
while true
  if a > 15
    break
  a += 1
return a";
    assert_eq!(eval(src), "16");
}

#[test]
fn test_for_loop_over_range() {
    let src = "\
let total = 0
for i in range(1, 6)
    total += i
return total";
    assert_eq!(eval(src), "15");
}

#[test]
fn test_for_loop_aliases_elements() {
    let src = "\
let lst = [1, 2, 3]
for v in lst
    v *= 10
return lst";
    assert_eq!(eval(src), "[10, 20, 30]");
}

#[test]
fn test_until_and_repeat() {
    let src = "\
let n = 0
until n >= 3
    n += 1
return n";
    assert_eq!(eval(src), "3");
    let src = "\
let n = 0
repeat 4
    n += 2
return n";
    assert_eq!(eval(src), "8");
}

#[test]
fn test_continue_skips_iteration() {
    let src = "\
let total = 0
for i in range(5)
    if i % 2 == 0
        continue
    total += i
return total";
    assert_eq!(eval(src), "4");
}

#[test]
fn test_return_escapes_nested_blocks() {
    let src = "\
function find(limit)
    let i = 0
    while true
        if i >= limit
            return i
        i += 1
return find(7)";
    assert_eq!(eval(src), "7");
}

#[test]
fn test_break_outside_loop_is_a_syntax_error() {
    assert!(eval_err("break").contains("not valid outside a loop"));
}

// ─── Then-chaining ────────────────────────────────────────────────────────

#[test]
fn test_run_then_while_shares_the_body() {
    let src = "\
let x = 0
run then while x < 3
    x += 1
return x";
    assert_eq!(eval(src), "3");
}

// ─── switch / case ────────────────────────────────────────────────────────

#[test]
fn test_switch_runs_only_the_matching_case() {
    let src = "\
let r = 0
switch 2
    case 1
        r = 10
    case 2
        r = 20
    case 3
        r = 30
return r";
    assert_eq!(eval(src), "20");
}

#[test]
fn test_switch_default_catches_the_rest() {
    let src = "\
let r = 0
switch 9
    case 1
        r = 10
    default
        r = 99
return r";
    assert_eq!(eval(src), "99");
}

// ─── try / catch ──────────────────────────────────────────────────────────

#[test]
fn test_try_catch_binds_the_message() {
    let src = "\
let msg = \"\"
try
    let x = 1 / 0
catch err
    msg = err
return msg";
    assert!(eval(src).contains("division by zero"));
}

#[test]
fn test_try_without_error_skips_catch() {
    let src = "\
let r = 1
try
    r = 2
catch err
    r = 3
return r";
    assert_eq!(eval(src), "2");
}

// ─── Functions ────────────────────────────────────────────────────────────

#[test]
fn test_function_call_and_defaults() {
    let src = "\
function add(a, b = 10)
    return a + b
return add(1) + add(1, 2)";
    assert_eq!(eval(src), "14");
}

#[test]
fn test_named_arguments() {
    let src = "\
function scale(value, factor = 1)
    return value * factor
return scale(3, factor := 5)";
    assert_eq!(eval(src), "15");
}

#[test]
fn test_named_before_positional_is_rejected() {
    let src = "\
function f(a, b)
    return a + b
return f(a := 1, 2)";
    assert!(eval_err(src).contains("named parameter"));
}

#[test]
fn test_arity_mismatch_reports_error() {
    let src = "\
function add(a, b)
    return a + b
return add(1, 2, 3)";
    assert!(eval_err(src).contains("add"));
}

#[test]
fn test_recursion() {
    let src = "\
function fib(n)
    if n <= 1
        return n
    return fib(n - 1) + fib(n - 2)
return fib(10)";
    assert_eq!(eval(src), "55");
}

#[test]
fn test_function_error_carries_a_trail() {
    let src = "\
function inner()
    return 1 / 0
inner()";
    let err = eval_err(src);
    assert!(err.contains("in inner"), "trail missing: {}", err);
}

#[test]
fn test_backtick_lambda() {
    let src = "\
let double = `n => n * 2`
return double(21)";
    assert_eq!(eval(src), "42");
}

#[test]
fn test_block_lambda_with_arrow() {
    let src = "\
let combine = (a, b) =>
    return a + b
return combine(1, 2)";
    assert_eq!(eval(src), "3");
}

// ─── Scopes & modes ───────────────────────────────────────────────────────

#[test]
fn test_namespace_scopes_variables() {
    let src = "\
namespace geo
    let depth = 42
return geo.depth";
    assert_eq!(eval(src), "42");
}

#[test]
fn test_explicit_mode_rejects_implicit_declaration() {
    let src = "\
set explicit true
return ghost + 1";
    assert!(eval_err(src).contains("ghost"));
}

#[test]
fn test_declarative_mode_rejects_loops() {
    let ev = Evaluator::new();
    let err = ev
        .eval_raw("while true\n    break", false, true)
        .expect_err("loops are not declarative");
    assert!(err.to_string().contains("declarative"));
}

#[test]
fn test_declarative_mode_accepts_declarations() {
    let ev = Evaluator::new();
    ev.eval_raw("function f(x)\n    return x\nlet a = 1", false, true)
        .expect("declarations are allowed");
    assert!(ev.get_variable("a").is_some());
}

#[test]
fn test_global_declares_at_root() {
    let src = "\
function init()
    global counter = 7
init()
return counter";
    assert_eq!(eval(src), "7");
}

// ─── Line handling ────────────────────────────────────────────────────────

#[test]
fn test_comments_and_inline_semicolons() {
    let src = "\
# a full-line comment
let a = 1; let b = 2  # trailing comment
return a + b";
    assert_eq!(eval(src), "3");
}

#[test]
fn test_backslash_joins_lines() {
    let src = "\
return 1 + \\
    2";
    assert_eq!(eval(src), "3");
}

#[test]
fn test_triple_quoted_text_spans_lines() {
    let src = "return \"\"\"first\nsecond\"\"\"";
    assert_eq!(eval(src), "first\nsecond");
}

#[test]
fn test_tabs_count_as_configured_spaces() {
    let src = "\
let a = 0
if true
\ta = 5
return a";
    assert_eq!(eval(src), "5");
}

// ─── Embedded API ─────────────────────────────────────────────────────────

#[test]
fn test_set_and_get_variable() {
    let ev = Evaluator::new();
    ev.set_variable("x", Value::Text("hi".into()), None, Default::default());
    assert!(matches!(ev.get_variable("x"), Some(Value::Text(s)) if s == "hi"));
    assert_eq!(ev.eval_expr("x + \"!\"", true, false).unwrap(), "hi!");
}

#[test]
fn test_define_user_function_api() {
    let ev = Evaluator::new();
    ev.define_user_function("triple(n)", "return n * 3", &[])
        .expect("definition should parse");
    assert_eq!(ev.eval_expr("triple(5)", true, false).unwrap(), "15");
}

#[test]
fn test_sub_evaluator_shares_state() {
    let ev = Evaluator::new();
    ev.eval("let shared = 5").unwrap();
    let sub = ev.sub_evaluator(Some("inner"));
    assert_eq!(sub.eval_expr("shared + 1", true, false).unwrap(), "6");
}

#[test]
fn test_deep_copy_isolates_state() {
    let ev = Evaluator::new();
    ev.eval("let n = 1").unwrap();
    let copy = ev.deep_copy();
    copy.eval("n = 99").unwrap();
    assert_eq!(ev.eval_expr("n", true, false).unwrap(), "1");
    assert_eq!(copy.eval_expr("n", true, false).unwrap(), "99");
}

#[test]
fn test_eval_async_emits_completion_event() {
    let ev = Evaluator::new();
    let (tx, rx) = mpsc::channel::<bool>();
    let tx = Mutex::new(tx);
    ev.events().on_eval_complete(Box::new(move |event| {
        let _ = tx.lock().unwrap().send(event.result.is_ok());
    }));
    let id = ev.eval_async("let async_x = 1 + 1", false, false);
    assert!(id > 0);
    let ok = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("completion event");
    assert!(ok);
    assert!(ev.get_variable("async_x").is_some());
}

#[test]
fn test_stop_all_cancels_long_running_worker() {
    let ev = Evaluator::new();
    let (tx, rx) = mpsc::channel::<bool>();
    let tx = Mutex::new(tx);
    ev.events().on_eval_complete(Box::new(move |event| {
        let _ = tx.lock().unwrap().send(event.result.is_ok());
    }));
    ev.eval_async("while true\n    1 + 1", true, false);
    std::thread::sleep(Duration::from_millis(50));
    ev.stop_all(None);
    let ok = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("completion event");
    assert!(!ok, "cancelled evaluation should not succeed");
}

#[test]
fn test_feeder_drives_line_by_line_evaluation() {
    use std::sync::Arc;
    let ev = Evaluator::new();
    let feeder = Arc::new(cantus::ScriptFeeder::new());
    let worker = {
        let ev = ev.clone();
        let feeder = Arc::clone(&feeder);
        std::thread::spawn(move || ev.eval_feeder(feeder))
    };
    feeder.append("let total = 1");
    std::thread::sleep(Duration::from_millis(20));
    feeder.append("total += 2\nreturn total");
    feeder.end();
    let result = worker
        .join()
        .expect("worker thread")
        .expect("feeder evaluation");
    assert_eq!(result.display(), "3");
}

// ─── Serialization ────────────────────────────────────────────────────────

#[test]
fn test_serialization_round_trips_variables_and_functions() {
    let ev = Evaluator::new();
    ev.eval(
        "\
let count = 42
let name = \"cantus\"
function double(n)
    return n * 2",
    )
    .unwrap();
    let script = ev.serialize();

    let fresh = Evaluator::new();
    fresh.eval(&script).expect("serialized state should reload");
    assert_eq!(fresh.eval_expr("count", true, false).unwrap(), "42");
    assert_eq!(fresh.eval_expr("name", true, false).unwrap(), "cantus");
    assert_eq!(fresh.eval_expr("double(21)", true, false).unwrap(), "42");
}

#[test]
fn test_internal_variables_are_not_serialized() {
    let ev = Evaluator::new();
    ev.set_variable(
        "hidden",
        Value::Text("secret".into()),
        None,
        ["internal".to_string()].into_iter().collect(),
    );
    ev.set_variable("visible", Value::Text("shown".into()), None, Default::default());
    let script = ev.serialize();
    assert!(!script.contains("hidden"));
    assert!(script.contains("visible"));
}
