/// Integration tests for expression evaluation.
///
/// These cover the tokenizer/resolver pipeline end to end: precedence,
/// implicit multiplication, sig-fig arithmetic, literals and indexing.
use cantus::Evaluator;

fn eval_expr(expr: &str) -> String {
    Evaluator::new()
        .eval_expr(expr, true, false)
        .expect("expression should evaluate")
}

fn eval_script(src: &str) -> String {
    Evaluator::new().eval(src).expect("script should evaluate")
}

// ─── Precedence & arithmetic ──────────────────────────────────────────────

#[test]
fn test_precedence_multiplication_before_addition() {
    assert_eq!(eval_expr("2 + 3 * 4"), "14");
    assert_eq!(eval_expr("(2 + 3) * 4"), "20");
}

#[test]
fn test_exponent_binds_tighter_than_negation() {
    assert_eq!(eval_expr("-3^2"), "-9");
    assert_eq!(eval_expr("(-3)^2"), "9");
}

#[test]
fn test_equal_precedence_is_left_to_right() {
    assert_eq!(eval_expr("8 - 3 - 2"), "3");
    assert_eq!(eval_expr("2 ^ 3 ^ 2"), "64");
}

#[test]
fn test_exact_division() {
    assert_eq!(eval_expr("1 / 4"), "0.25");
    assert_eq!(eval_expr("10 / 4"), "2.5");
}

#[test]
fn test_nonterminating_division_truncates() {
    let out = eval_expr("1 / 3");
    assert!(out.starts_with("0.3333333333"));
}

#[test]
fn test_division_by_zero_reports_math_error() {
    let err = Evaluator::new()
        .eval_expr("1 / 0", true, false)
        .expect_err("division by zero");
    assert!(err.to_string().contains("division by zero"));
}

#[test]
fn test_integer_division_and_modulo() {
    assert_eq!(eval_expr("7 // 2"), "3");
    assert_eq!(eval_expr("7 % 3"), "1");
    assert_eq!(eval_expr("7 mod 3"), "1");
}

#[test]
fn test_factorial_postfix() {
    assert_eq!(eval_expr("5!"), "120");
    assert_eq!(eval_expr("3! + 1"), "7");
}

#[test]
fn test_unary_prefix_operators() {
    assert_eq!(eval_expr("not true"), "false");
    assert_eq!(eval_expr("~0"), "-1");
}

#[test]
fn test_comparisons_and_logic() {
    assert_eq!(eval_expr("1 < 2"), "true");
    assert_eq!(eval_expr("2 <= 1"), "false");
    assert_eq!(eval_expr("1 == 1 and 2 == 2"), "true");
    assert_eq!(eval_expr("false or 3 > 2"), "true");
    assert_eq!(eval_expr("true xor true"), "false");
}

#[test]
fn test_bitwise_operators() {
    assert_eq!(eval_expr("6 & 3"), "2");
    assert_eq!(eval_expr("6 | 3"), "7");
    assert_eq!(eval_expr("6 ^^ 3"), "5");
    assert_eq!(eval_expr("1 << 4"), "16");
}

// ─── Implicit multiplication ──────────────────────────────────────────────

#[test]
fn test_adjacent_bracket_multiplies() {
    assert_eq!(eval_expr("2(3)"), "6");
    assert_eq!(eval_expr("(2)(3)(4)"), "24");
}

#[test]
fn test_number_prefixed_identifier_multiplies() {
    let out = eval_expr("2pi");
    assert!(out.starts_with("6.28318530717958"), "2pi was {}", out);
}

#[test]
fn test_variable_splitting_both_orders() {
    let src = "\
let x = 2
let y = 3
return xy";
    assert_eq!(eval_script(src), "6");
    let src = "\
let x = 2
let y = 3
return yx";
    assert_eq!(eval_script(src), "6");
}

// ─── Significant figures ──────────────────────────────────────────────────

#[test]
fn test_sig_fig_addition_scenario() {
    let src = "\
set sigfigs true
return 1.20 + 0.034";
    assert_eq!(eval_script(src), "1.23");
}

#[test]
fn test_sig_fig_multiplication_takes_min() {
    let src = "\
set sigfigs true
return 1.20 * 2.0";
    assert_eq!(eval_script(src), "2.4");
}

// ─── Literals & collections ──────────────────────────────────────────────

#[test]
fn test_text_literals_and_concat() {
    assert_eq!(eval_expr("\"a\" + \"b\""), "ab");
    assert_eq!(eval_expr("'x' + 1"), "x1");
    assert_eq!(eval_expr("\"ab\" * 3"), "ababab");
}

#[test]
fn test_comment_character_inside_text_survives() {
    assert_eq!(eval_script("return \"a#b\""), "a#b");
}

#[test]
fn test_matrix_elementwise_arithmetic() {
    assert_eq!(eval_expr("[1, 2] + [3, 4]"), "[4, 6]");
    assert_eq!(eval_expr("[1, 2, 3] * 2"), "[2, 4, 6]");
}

#[test]
fn test_indexing_matrices_and_text() {
    let src = "\
let lst = [10, 20, 30]
return lst[1]";
    assert_eq!(eval_script(src), "20");
    assert_eq!(eval_expr("[10, 20, 30][-1]"), "30");
    assert_eq!(eval_expr("\"abc\"[1]"), "b");
}

#[test]
fn test_dict_and_set_literals() {
    assert_eq!(eval_expr("{1: 10, 2: 20}[2]"), "20");
    // Sets are comparison-ordered regardless of spelling order.
    assert_eq!(eval_expr("{3, 1, 2}"), "{1, 2, 3}");
}

#[test]
fn test_scientific_notation_literal() {
    assert_eq!(eval_expr("1e-5 * 1e5"), "1");
    assert_eq!(eval_expr("2.5e2"), "250");
}

#[test]
fn test_imaginary_literal_arithmetic() {
    assert_eq!(eval_expr("2i * 2i"), "-4");
    assert_eq!(eval_expr("1 + 2i"), "1+2i");
}

#[test]
fn test_undefined_literal_propagates() {
    assert_eq!(eval_expr("undefined + 1"), "undefined");
}

// ─── Assignment ───────────────────────────────────────────────────────────

#[test]
fn test_chained_assignment_is_right_to_left() {
    let src = "\
a = b = 5
return a + b";
    assert_eq!(eval_script(src), "10");
}

#[test]
fn test_compound_assignment() {
    let src = "\
let a = 10
a += 5
a *= 2
return a";
    assert_eq!(eval_script(src), "30");
}

#[test]
fn test_increment_operator_mutates() {
    let src = "\
let a = 1
a++
a++
return a";
    assert_eq!(eval_script(src), "3");
}

// ─── Built-ins ────────────────────────────────────────────────────────────

#[test]
fn test_trig_respects_angle_mode() {
    let src = "\
set angle degree
return sin(90)";
    assert_eq!(eval_script(src), "1");
}

#[test]
fn test_sqrt_of_negative_promotes_to_complex() {
    assert_eq!(eval_expr("sqrt(-4)"), "0+2i");
}

#[test]
fn test_collection_builtins() {
    assert_eq!(eval_expr("sum([1, 2, 3, 4])"), "10");
    assert_eq!(eval_expr("len(\"hello\")"), "5");
    assert_eq!(eval_expr("max(3, 9, 4)"), "9");
    assert_eq!(eval_expr("contains([1, 2], 2)"), "true");
}

#[test]
fn test_previous_answers_ring() {
    let ev = Evaluator::new();
    ev.eval_expr("40 + 1", false, false).unwrap();
    assert_eq!(ev.eval_expr("ans(0) + 1", false, false).unwrap(), "42");
}

#[test]
fn test_undefined_function_reports_error() {
    let err = Evaluator::new()
        .eval_expr("nosuchfn(1)", true, false)
        .expect_err("unknown call target");
    assert!(err.to_string().contains("nosuchfn"));
}

#[test]
fn test_output_format_scientific() {
    let src = "\
set output scientific
return 1250";
    assert_eq!(eval_script(src), "1.25e3");
}
