/// Property tests for the numeric core and the scope-path algebra.
use cantus::bigdec::BigDec;
use cantus::scope;
use cantus::Evaluator;
use num_bigint::BigInt;
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;

// ─── BigDec invariants ────────────────────────────────────────────────────

#[quickcheck]
fn normalized_mantissa_has_no_trailing_zeros(mantissa: i64, exponent: i8) -> bool {
    let d = BigDec::from_parts(BigInt::from(mantissa), exponent as i64);
    if d.is_zero() {
        return true;
    }
    !d.mantissa_digits().ends_with('0')
}

#[quickcheck]
fn equality_is_stable_under_renormalization(mantissa: i64, exponent: i8) -> bool {
    let a = BigDec::from_parts(BigInt::from(mantissa), exponent as i64);
    let b = BigDec::from_parts(BigInt::from(mantissa), exponent as i64);
    a == b
}

#[quickcheck]
fn scaled_representations_compare_equal(mantissa: i32, exponent: i8) -> bool {
    // mantissa * 10^e and (mantissa * 100) * 10^(e-2) are the same value.
    let a = BigDec::from_parts(BigInt::from(mantissa), exponent as i64);
    let b = BigDec::from_parts(
        BigInt::from(mantissa) * BigInt::from(100),
        exponent as i64 - 2,
    );
    a == b
}

#[quickcheck]
fn render_parse_round_trip(value: f64) -> TestResult {
    if !value.is_finite() {
        return TestResult::discard();
    }
    let d = BigDec::from_f64(value);
    let rendered = d.to_output_string();
    match BigDec::parse(&rendered, false) {
        Some(back) => TestResult::from_bool(back == d),
        None => TestResult::failed(),
    }
}

#[quickcheck]
fn addition_matches_integer_arithmetic(a: i64, b: i64) -> bool {
    let sum = BigDec::from_i64(a)
        .add(&BigDec::from_i64(b))
        .expect("integer addition");
    sum == BigDec::from_parts(BigInt::from(a) + BigInt::from(b), 0)
}

#[quickcheck]
fn multiplication_matches_integer_arithmetic(a: i32, b: i32) -> bool {
    let product = BigDec::from_i64(a as i64)
        .mul(&BigDec::from_i64(b as i64))
        .expect("integer multiplication");
    product == BigDec::from_parts(BigInt::from(a) * BigInt::from(b), 0)
}

#[quickcheck]
fn sig_fig_addition_formula_holds(a_digits: u16, b_digits: u16) -> TestResult {
    // Build two tracked decimals in [0.001, 65.535] with 2-digit scale.
    let a = BigDec::parse(&format!("{}.{:03}", a_digits / 1000, a_digits % 1000), true)
        .expect("literal");
    let b = BigDec::parse(&format!("{}.{:03}", b_digits / 1000, b_digits % 1000), true)
        .expect("literal");
    let (Some(la), Some(lb)) = (a.least_sig_fig(), b.least_sig_fig()) else {
        return TestResult::discard();
    };
    let sum = a.add(&b).expect("addition");
    if sum.is_zero() {
        return TestResult::discard();
    }
    let expected = (sum.highest_digit() - la.max(lb) + 1).max(1) as u64;
    TestResult::from_bool(sum.sig_figs() == Some(expected))
}

#[quickcheck]
fn undefined_absorbs_every_operation(value: i64) -> bool {
    let u = BigDec::undefined();
    let v = BigDec::from_i64(value);
    u.add(&v).unwrap().is_undefined()
        && v.sub(&u).unwrap().is_undefined()
        && u.mul(&v).unwrap().is_undefined()
        && v.div(&u).unwrap().is_undefined()
}

// ─── Scope algebra ────────────────────────────────────────────────────────

/// Disjoint alphabets for scope and name components keep the redundancy
/// stripping out of play, which is what the round-trip laws assume.
fn scope_path(parts: &[u8]) -> String {
    let parts: Vec<String> = parts
        .iter()
        .take(4)
        .map(|p| format!("s{}", p % 8))
        .collect();
    if parts.is_empty() {
        "s0".to_string()
    } else {
        parts.join(".")
    }
}

fn name_path(parts: &[u8]) -> String {
    let parts: Vec<String> = parts
        .iter()
        .take(4)
        .map(|p| format!("n{}", p % 8))
        .collect();
    if parts.is_empty() {
        "n0".to_string()
    } else {
        parts.join(".")
    }
}

#[quickcheck]
fn combine_then_strip_recovers_the_name(scope_parts: Vec<u8>, name_parts: Vec<u8>) -> bool {
    let scope = scope_path(&scope_parts);
    let name = name_path(&name_parts);
    let full = scope::combine(&scope, &name);
    scope::remove_redundant_scope(&full, &scope) == name
}

#[quickcheck]
fn combine_produces_a_child_scope(scope_parts: Vec<u8>, name_parts: Vec<u8>) -> bool {
    let scope = scope_path(&scope_parts);
    let name = name_path(&name_parts);
    scope::is_parent(&scope, &scope::combine(&scope, &name))
}

#[quickcheck]
fn normalize_then_combine_reconstructs_the_full_name(
    scope_parts: Vec<u8>,
    name_parts: Vec<u8>,
) -> bool {
    let scope = scope_path(&scope_parts);
    let name = name_path(&name_parts);
    let (last, new_scope) = scope::normalize_name(&name, &scope);
    scope::combine(&new_scope, &last) == scope::combine(&scope, &name)
}

// ─── Precedence monotonicity ──────────────────────────────────────────────

#[quickcheck]
fn multiplication_executes_before_addition(x: i8, y: i8, z: i8) -> bool {
    let ev = Evaluator::new();
    let out = ev
        .eval_expr(&format!("{} + {} * {}", x, y, z), true, false)
        .expect("expression");
    out == (x as i64 + y as i64 * z as i64).to_string()
}

#[quickcheck]
fn shifts_execute_after_additive(x: u8, y: u8) -> bool {
    let ev = Evaluator::new();
    let out = ev
        .eval_expr(&format!("1 + {} << {}", x, y % 8), true, false)
        .expect("expression");
    out == (((1 + x as i64) << (y % 8)) as i64).to_string()
}
