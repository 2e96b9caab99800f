/// Arbitrary-precision decimal with significant-figure tracking.
///
/// A `BigDec` is a mantissa/exponent pair (`value = mantissa * 10^exponent`)
/// plus an optional significant-figure count. `sig_figs == None` means the
/// value is exact and nothing is tracked. Arithmetic propagates sig figs:
/// add/subtract by least-significant-digit alignment, multiply/divide by
/// taking the minimum. Rounding to the tracked precision is deferred across
/// chains of like operations and applied when the operation kind changes.
///
/// Invariant: outside of an in-progress operation the mantissa carries no
/// trailing zeros (zero mantissa forces exponent zero).
use crate::errors::{CantusError, ErrorKind, EvalResult};
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{FromPrimitive, Signed, ToPrimitive, Zero};
use std::cmp::Ordering;
use std::fmt;

/// Maximum number of mantissa digits produced by division and enforced by
/// `always_truncate`.
pub const MAX_PRECISION: u64 = 50;

/// Exponent-step size used when bridging to f64 for transcendentals.
const F64_STEP: i64 = 100;
/// Maximum number of exponent steps before the bridge reports overflow.
const F64_MAX_STEPS: i64 = 100;

/// Sixty digits of pi, enough to reduce trig arguments at full precision.
const PI_60: &str = "3.141592653589793238462643383279502884197169399375105820974944";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastOp {
    None,
    AddSub,
    MulDiv,
}

#[derive(Debug, Clone)]
pub struct BigDec {
    mantissa: BigInt,
    exponent: i64,
    sig_figs: Option<u64>,
    last_op: LastOp,
    undefined: bool,
}

fn pow10(k: u64) -> BigInt {
    num_traits::pow(BigInt::from(10), k as usize)
}

fn digit_count_of(m: &BigInt) -> u64 {
    if m.is_zero() {
        1
    } else {
        m.abs().to_string().len() as u64
    }
}

impl BigDec {
    // ── Construction ────────────────────────────────────────────────────

    pub fn zero() -> Self {
        BigDec::from_parts(BigInt::zero(), 0)
    }

    pub fn one() -> Self {
        BigDec::from_parts(BigInt::from(1), 0)
    }

    pub fn undefined() -> Self {
        BigDec {
            mantissa: BigInt::zero(),
            exponent: 0,
            sig_figs: None,
            last_op: LastOp::None,
            undefined: true,
        }
    }

    pub fn from_parts(mantissa: BigInt, exponent: i64) -> Self {
        let mut d = BigDec {
            mantissa,
            exponent,
            sig_figs: None,
            last_op: LastOp::None,
            undefined: false,
        };
        d.normalize();
        d
    }

    pub fn from_i64(v: i64) -> Self {
        BigDec::from_parts(BigInt::from(v), 0)
    }

    /// Convert a double by iterative scale-factor search: multiply by ten
    /// until the scaled value is integral, then capture it as the mantissa.
    pub fn from_f64(v: f64) -> Self {
        if !v.is_finite() {
            return BigDec::undefined();
        }
        if v == 0.0 {
            return BigDec::zero();
        }
        let mut scale = 1.0f64;
        let mut shift: i64 = 0;
        while (v * scale).fract() != 0.0 && scale < 1e18 {
            scale *= 10.0;
            shift += 1;
        }
        let scaled = v * scale;
        match BigInt::from_f64(scaled.round()) {
            Some(m) => BigDec::from_parts(m, -shift),
            None => BigDec::undefined(),
        }
    }

    /// Parse a decimal literal, optionally capturing the literal's
    /// significant digits (significant mode). Accepts `123`, `1.25`,
    /// `.5`, `1.2e-3` and a leading sign.
    pub fn parse(text: &str, track_sig: bool) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if text == "undefined" {
            return Some(BigDec::undefined());
        }
        let (sign, body) = match text.as_bytes()[0] {
            b'+' => (1, &text[1..]),
            b'-' => (-1, &text[1..]),
            _ => (1, text),
        };
        let (num_part, exp_part) = match body.find(['e', 'E']) {
            Some(i) => (&body[..i], Some(&body[i + 1..])),
            None => (body, None),
        };
        let exp_extra: i64 = match exp_part {
            Some(e) if !e.is_empty() => e.parse().ok()?,
            Some(_) => return None,
            None => 0,
        };
        let (int_part, frac_part) = match num_part.find('.') {
            Some(i) => (&num_part[..i], &num_part[i + 1..]),
            None => (num_part, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let digits: String = int_part.bytes().chain(frac_part.bytes()).map(char::from).collect();
        let mantissa: BigInt = digits.parse().ok()?;
        let mantissa = if sign < 0 { -mantissa } else { mantissa };
        let mut d = BigDec::from_parts(mantissa, exp_extra - frac_part.len() as i64);
        if track_sig {
            d.sig_figs = Some(literal_sig_figs(int_part, frac_part));
        }
        Some(d)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn is_undefined(&self) -> bool {
        self.undefined
    }

    pub fn is_zero(&self) -> bool {
        !self.undefined && self.mantissa.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        !self.undefined && self.mantissa.is_negative()
    }

    pub fn is_integer(&self) -> bool {
        !self.undefined && self.exponent >= 0
    }

    pub fn sig_figs(&self) -> Option<u64> {
        self.sig_figs
    }

    pub fn with_sig_figs(mut self, sig: Option<u64>) -> Self {
        self.sig_figs = sig.map(|s| s.max(1));
        self
    }

    pub fn last_op(&self) -> LastOp {
        self.last_op
    }

    /// Number of digits in the mantissa.
    pub fn digit_count(&self) -> u64 {
        digit_count_of(&self.mantissa)
    }

    /// Decimal digits of the mantissa magnitude, most significant first.
    pub fn mantissa_digits(&self) -> String {
        self.mantissa.abs().to_string()
    }

    /// Index of the most significant digit relative to the units column
    /// (0 = units, 1 = tens, -1 = tenths).
    pub fn highest_digit(&self) -> i64 {
        self.exponent + self.digit_count() as i64 - 1
    }

    /// Index of the least significant *tracked* digit, when tracking.
    pub fn least_sig_fig(&self) -> Option<i64> {
        self.sig_figs
            .map(|s| self.highest_digit() - (s as i64 - 1))
    }

    // ── Normalization & truncation ──────────────────────────────────────

    pub fn normalize(&mut self) {
        if self.undefined {
            return;
        }
        if self.mantissa.is_zero() {
            self.exponent = 0;
            return;
        }
        let ten = BigInt::from(10);
        while (&self.mantissa % &ten).is_zero() {
            self.mantissa /= &ten;
            self.exponent += 1;
        }
    }

    /// Drop least-significant digits until at most `precision` remain.
    /// Rounding is half-to-even on the pivot digit; a nonzero residue
    /// below the pivot breaks the tie away from zero.
    pub fn truncate(&mut self, precision: u64, round: bool) {
        if self.undefined {
            return;
        }
        let precision = precision.max(1);
        let dc = self.digit_count();
        if dc <= precision {
            return;
        }
        let excess = dc - precision;
        let negative = self.mantissa.is_negative();
        let mag = self.mantissa.abs();
        let (mut q, r) = mag.div_rem(&pow10(excess));
        if round && !r.is_zero() {
            let pivot_unit = pow10(excess - 1);
            let (pivot, below) = r.div_rem(&pivot_unit);
            let pivot = pivot.to_u8().unwrap_or(0);
            let round_up = match pivot.cmp(&5) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => !below.is_zero() || q.is_odd(),
            };
            if round_up {
                q += 1u8;
            }
        }
        self.mantissa = if negative { -q } else { q };
        self.exponent += excess as i64;
        self.normalize();
        // Rounding can carry into an extra digit (995 -> 100 at precision 2);
        // the added digit is a trailing zero and normalize absorbs it.
    }

    /// Round the mantissa down to the tracked precision, if any.
    pub fn round_to_sig_figs(&mut self) {
        if let Some(sig) = self.sig_figs {
            self.truncate(sig, true);
        }
    }

    /// Settle deferred rounding before an operation of a different kind.
    fn settled_for(&self, kind: LastOp) -> BigDec {
        let mut out = self.clone();
        if out.sig_figs.is_some() && out.last_op != LastOp::None && out.last_op != kind {
            out.round_to_sig_figs();
        }
        out
    }

    // ── Arithmetic ──────────────────────────────────────────────────────

    pub fn neg(&self) -> BigDec {
        let mut out = self.clone();
        out.mantissa = -out.mantissa;
        out
    }

    pub fn abs(&self) -> BigDec {
        let mut out = self.clone();
        out.mantissa = out.mantissa.abs();
        out
    }

    pub fn add(&self, rhs: &BigDec) -> EvalResult<BigDec> {
        if self.undefined || rhs.undefined {
            return Ok(BigDec::undefined());
        }
        let a = self.settled_for(LastOp::AddSub);
        let b = rhs.settled_for(LastOp::AddSub);
        let exp = a.exponent.min(b.exponent);
        let shift_a = (a.exponent - exp) as u64;
        let shift_b = (b.exponent - exp) as u64;
        if shift_a > 100_000 || shift_b > 100_000 {
            return Err(ErrorKind::Overflow("addition".into()).into());
        }
        let mantissa = &a.mantissa * pow10(shift_a) + &b.mantissa * pow10(shift_b);
        let mut out = BigDec::from_parts(mantissa, exp);
        out.sig_figs = match (a.least_sig_fig(), b.least_sig_fig()) {
            (None, None) => None,
            (one, other) => {
                let least = one.unwrap_or(i64::MIN).max(other.unwrap_or(i64::MIN));
                Some(((out.highest_digit() - least + 1).max(1)) as u64)
            }
        };
        out.last_op = LastOp::AddSub;
        Ok(out)
    }

    pub fn sub(&self, rhs: &BigDec) -> EvalResult<BigDec> {
        self.add(&rhs.neg())
    }

    pub fn mul(&self, rhs: &BigDec) -> EvalResult<BigDec> {
        if self.undefined || rhs.undefined {
            return Ok(BigDec::undefined());
        }
        let a = self.settled_for(LastOp::MulDiv);
        let b = rhs.settled_for(LastOp::MulDiv);
        let mut out = BigDec::from_parts(&a.mantissa * &b.mantissa, a.exponent + b.exponent);
        out.sig_figs = min_sig(a.sig_figs, b.sig_figs);
        out.last_op = LastOp::MulDiv;
        Ok(out)
    }

    pub fn div(&self, rhs: &BigDec) -> EvalResult<BigDec> {
        if self.undefined || rhs.undefined {
            return Ok(BigDec::undefined());
        }
        if rhs.is_zero() {
            return Err(ErrorKind::DivisionByZero.into());
        }
        let a = self.settled_for(LastOp::MulDiv);
        let b = rhs.settled_for(LastOp::MulDiv);
        if a.is_zero() {
            let mut out = BigDec::zero();
            out.sig_figs = min_sig(a.sig_figs, b.sig_figs);
            out.last_op = LastOp::MulDiv;
            return Ok(out);
        }
        // Shift the dividend far enough that the integer quotient carries
        // MAX_PRECISION digits, plus one guard digit for rounding.
        let gap = a.digit_count() as i64 - b.digit_count() as i64;
        let shift = (MAX_PRECISION as i64 - gap).max(0) as u64 + 1;
        let negative = a.mantissa.is_negative() != b.mantissa.is_negative();
        let num = a.mantissa.abs() * pow10(shift);
        let q = num / b.mantissa.abs();
        let mut out = BigDec::from_parts(
            if negative { -q } else { q },
            a.exponent - b.exponent - shift as i64,
        );
        out.truncate(MAX_PRECISION, true);
        out.sig_figs = min_sig(a.sig_figs, b.sig_figs);
        out.last_op = LastOp::MulDiv;
        Ok(out)
    }

    /// `a mod b = a - trunc(a/b) * b`, computed exactly with sig-fig
    /// tracking suspended.
    pub fn rem(&self, rhs: &BigDec) -> EvalResult<BigDec> {
        if self.undefined || rhs.undefined {
            return Ok(BigDec::undefined());
        }
        if rhs.is_zero() {
            return Err(ErrorKind::DivisionByZero.into());
        }
        let q = self.div_trunc_int(rhs)?;
        let prod = BigDec::from_parts(q * &rhs.mantissa, rhs.exponent);
        let exp = self.exponent.min(prod.exponent);
        let mantissa = &self.mantissa * pow10((self.exponent - exp) as u64)
            - &prod.mantissa * pow10((prod.exponent - exp) as u64);
        let mut out = BigDec::from_parts(mantissa, exp);
        out.sig_figs = min_sig(self.sig_figs, rhs.sig_figs);
        out.last_op = LastOp::MulDiv;
        Ok(out)
    }

    /// Integer part of `self / rhs`, truncated toward zero, as a BigInt.
    fn div_trunc_int(&self, rhs: &BigDec) -> EvalResult<BigInt> {
        let exp = self.exponent.min(rhs.exponent);
        let shift_a = (self.exponent - exp) as u64;
        let shift_b = (rhs.exponent - exp) as u64;
        if shift_a > 100_000 || shift_b > 100_000 {
            return Err(ErrorKind::Overflow("modulo".into()).into());
        }
        let a = &self.mantissa * pow10(shift_a);
        let b = &rhs.mantissa * pow10(shift_b);
        Ok(a / b)
    }

    // ── Integer rounding ────────────────────────────────────────────────

    pub fn floor(&self) -> BigDec {
        self.to_integer(|q, r, neg| if neg && !r.is_zero() { q - 1 } else { q })
    }

    pub fn ceil(&self) -> BigDec {
        self.to_integer(|q, r, neg| if !neg && !r.is_zero() { q + 1 } else { q })
    }

    pub fn trunc(&self) -> BigDec {
        self.to_integer(|q, _r, _neg| q)
    }

    pub fn round_int(&self) -> BigDec {
        if self.undefined || self.exponent >= 0 {
            return self.clone();
        }
        let mut shifted = self.clone();
        shifted.truncate(
            (self.digit_count() as i64 + self.exponent).max(1) as u64,
            true,
        );
        if shifted.exponent < 0 {
            shifted.trunc()
        } else {
            shifted
        }
    }

    fn to_integer(&self, adjust: impl Fn(BigInt, BigInt, bool) -> BigInt) -> BigDec {
        if self.undefined || self.exponent >= 0 {
            return self.clone();
        }
        let div = pow10((-self.exponent) as u64);
        let neg = self.mantissa.is_negative();
        let (q, r) = self.mantissa.div_rem(&div);
        BigDec::from_parts(adjust(q, r, neg), 0)
    }

    // ── f64 bridge ──────────────────────────────────────────────────────

    /// Convert to f64 by stepping the exponent in 100-sized chunks so the
    /// intermediate stays inside double range. Fails with math-overflow
    /// when too many steps accumulate.
    pub fn to_f64(&self) -> EvalResult<f64> {
        if self.undefined {
            return Ok(f64::NAN);
        }
        if self.mantissa.is_zero() {
            return Ok(0.0);
        }
        // Reduce an oversized mantissa to its leading digits first.
        let mut work = self.clone();
        let dc = work.digit_count();
        if dc > 18 {
            work.truncate(18, true);
        }
        let mut value = work
            .mantissa
            .to_f64()
            .ok_or_else(|| CantusError::new(ErrorKind::Overflow("conversion".into())))?;
        let mut exp = work.exponent;
        let mut steps = 0i64;
        while exp >= F64_STEP {
            value *= 1e100;
            exp -= F64_STEP;
            steps += 1;
            if steps > F64_MAX_STEPS || !value.is_finite() {
                return Err(ErrorKind::Overflow("conversion".into()).into());
            }
        }
        while exp <= -F64_STEP {
            value *= 1e-100;
            exp += F64_STEP;
            steps += 1;
            if steps > F64_MAX_STEPS {
                return Err(ErrorKind::Overflow("conversion".into()).into());
            }
        }
        value *= 10f64.powi(exp as i32);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ErrorKind::Overflow("conversion".into()).into())
        }
    }

    pub fn to_i64(&self) -> EvalResult<i64> {
        if self.undefined || self.exponent < 0 {
            return Err(CantusError::new(ErrorKind::TypeExpected {
                expected: "integer".into(),
                found: self.to_string(),
            }));
        }
        if self.exponent > 30 {
            return Err(ErrorKind::Overflow("integer conversion".into()).into());
        }
        (&self.mantissa * pow10(self.exponent as u64))
            .to_i64()
            .ok_or_else(|| CantusError::new(ErrorKind::Overflow("integer conversion".into())))
    }

    pub fn to_i128(&self) -> EvalResult<i128> {
        if self.undefined || self.exponent < 0 {
            return Err(CantusError::new(ErrorKind::TypeExpected {
                expected: "integer".into(),
                found: self.to_string(),
            }));
        }
        if self.exponent > 40 {
            return Err(ErrorKind::Overflow("integer conversion".into()).into());
        }
        (&self.mantissa * pow10(self.exponent as u64))
            .to_i128()
            .ok_or_else(|| CantusError::new(ErrorKind::Overflow("integer conversion".into())))
    }

    // ── Transcendentals ─────────────────────────────────────────────────

    pub fn two_pi() -> BigDec {
        let pi = BigDec::parse(PI_60, false).unwrap_or_else(BigDec::zero);
        BigDec::from_parts(&pi.mantissa * BigInt::from(2), pi.exponent)
    }

    pub fn pi() -> BigDec {
        BigDec::parse(PI_60, false).unwrap_or_else(BigDec::zero)
    }

    pub fn e() -> BigDec {
        BigDec::parse(
            "2.718281828459045235360287471352662497757247093699959574966968",
            false,
        )
        .unwrap_or_else(BigDec::zero)
    }

    pub fn pow(&self, rhs: &BigDec) -> EvalResult<BigDec> {
        if self.undefined || rhs.undefined {
            return Ok(BigDec::undefined());
        }
        // Small integer exponents stay exact.
        if rhs.is_integer() {
            if let Ok(k) = rhs.to_i64() {
                if k.unsigned_abs() <= 10_000
                    && self.digit_count().saturating_mul(k.unsigned_abs()) <= 5_000
                {
                    return self.pow_int(k);
                }
            }
        }
        let base = self.to_f64()?;
        let exp = rhs.to_f64()?;
        let v = base.powf(exp);
        if v.is_nan() {
            return Err(ErrorKind::Domain("pow".into()).into());
        }
        if !v.is_finite() {
            return Err(ErrorKind::Overflow("pow".into()).into());
        }
        let mut out = BigDec::from_f64(v);
        out.sig_figs = min_sig(self.sig_figs, rhs.sig_figs);
        out.last_op = LastOp::MulDiv;
        Ok(out)
    }

    fn pow_int(&self, k: i64) -> EvalResult<BigDec> {
        if k == 0 {
            return Ok(BigDec::one());
        }
        let n = k.unsigned_abs() as usize;
        let mantissa = num_traits::pow(self.mantissa.clone(), n);
        let exponent = self
            .exponent
            .checked_mul(k.abs())
            .ok_or_else(|| CantusError::new(ErrorKind::Overflow("pow".into())))?;
        let mut out = BigDec::from_parts(mantissa, exponent);
        out.sig_figs = self.sig_figs;
        out.last_op = LastOp::MulDiv;
        if k < 0 {
            return BigDec::one().div(&out);
        }
        Ok(out)
    }

    pub fn sqrt(&self) -> EvalResult<BigDec> {
        if self.undefined {
            return Ok(BigDec::undefined());
        }
        if self.is_negative() {
            return Err(ErrorKind::Domain("sqrt".into()).into());
        }
        self.map_f64(f64::sqrt, "sqrt")
    }

    pub fn exp(&self) -> EvalResult<BigDec> {
        self.map_f64(f64::exp, "exp")
    }

    pub fn ln(&self) -> EvalResult<BigDec> {
        if !self.undefined && (self.is_zero() || self.is_negative()) {
            return Err(ErrorKind::Domain("ln".into()).into());
        }
        self.map_f64(f64::ln, "ln")
    }

    pub fn log10(&self) -> EvalResult<BigDec> {
        if !self.undefined && (self.is_zero() || self.is_negative()) {
            return Err(ErrorKind::Domain("log".into()).into());
        }
        self.map_f64(f64::log10, "log")
    }

    /// Trig entry points take radians; the argument is reduced modulo 2pi
    /// before the f64 bridge so huge inputs keep their phase.
    pub fn sin(&self) -> EvalResult<BigDec> {
        self.reduced_trig(f64::sin, "sin")
    }

    pub fn cos(&self) -> EvalResult<BigDec> {
        self.reduced_trig(f64::cos, "cos")
    }

    pub fn tan(&self) -> EvalResult<BigDec> {
        self.reduced_trig(f64::tan, "tan")
    }

    pub fn asin(&self) -> EvalResult<BigDec> {
        self.checked_inverse_trig(f64::asin, "asin")
    }

    pub fn acos(&self) -> EvalResult<BigDec> {
        self.checked_inverse_trig(f64::acos, "acos")
    }

    pub fn atan(&self) -> EvalResult<BigDec> {
        self.map_f64(f64::atan, "atan")
    }

    fn reduced_trig(&self, f: impl Fn(f64) -> f64, name: &str) -> EvalResult<BigDec> {
        if self.undefined {
            return Ok(BigDec::undefined());
        }
        let reduced = self.rem(&BigDec::two_pi())?;
        reduced.map_f64(f, name)
    }

    fn checked_inverse_trig(&self, f: impl Fn(f64) -> f64, name: &str) -> EvalResult<BigDec> {
        if self.undefined {
            return Ok(BigDec::undefined());
        }
        let v = self.to_f64()?;
        if !(-1.0..=1.0).contains(&v) {
            return Err(ErrorKind::Domain(name.into()).into());
        }
        self.map_f64(f, name)
    }

    fn map_f64(&self, f: impl Fn(f64) -> f64, name: &str) -> EvalResult<BigDec> {
        if self.undefined {
            return Ok(BigDec::undefined());
        }
        let v = f(self.to_f64()?);
        if v.is_nan() {
            return Err(ErrorKind::Domain(name.into()).into());
        }
        if !v.is_finite() {
            return Err(ErrorKind::Overflow(name.into()).into());
        }
        let mut out = BigDec::from_f64(v);
        out.sig_figs = self.sig_figs;
        out.last_op = LastOp::MulDiv;
        Ok(out)
    }

    pub fn factorial(&self) -> EvalResult<BigDec> {
        if self.undefined {
            return Ok(BigDec::undefined());
        }
        if !self.is_integer() || self.is_negative() {
            return Err(ErrorKind::Domain("factorial".into()).into());
        }
        let n = self.to_i64()?;
        if n > 5_000 {
            return Err(ErrorKind::Overflow("factorial".into()).into());
        }
        let mut acc = BigInt::from(1);
        for i in 2..=n {
            acc *= i;
        }
        Ok(BigDec::from_parts(acc, 0))
    }

    // ── Comparison ──────────────────────────────────────────────────────

    pub fn compare(&self, rhs: &BigDec) -> Option<Ordering> {
        if self.undefined || rhs.undefined {
            return None;
        }
        let sa = self.mantissa.sign();
        let sb = rhs.mantissa.sign();
        if sa != sb {
            return Some(sa.cmp(&sb));
        }
        if self.mantissa.is_zero() {
            return Some(Ordering::Equal);
        }
        let (ha, hb) = (self.highest_digit(), rhs.highest_digit());
        if ha != hb {
            let by_magnitude = ha.cmp(&hb);
            return Some(if self.mantissa.is_negative() {
                by_magnitude.reverse()
            } else {
                by_magnitude
            });
        }
        // Same sign and magnitude band: align exponents and compare
        // mantissas directly. The shift is bounded by the digit counts.
        let exp = self.exponent.min(rhs.exponent);
        let a = &self.mantissa * pow10((self.exponent - exp) as u64);
        let b = &rhs.mantissa * pow10((rhs.exponent - exp) as u64);
        Some(a.cmp(&b))
    }

    // ── Rendering ───────────────────────────────────────────────────────

    /// Render in fixed-point form, padding zeros to show tracked sig figs.
    /// Falls back to scientific when the tracked precision cannot be shown
    /// in fixed form, and always outside the `[1e-9, 1e10)` band.
    pub fn to_output_string(&self) -> String {
        if self.undefined {
            return "undefined".into();
        }
        if self.mantissa.is_zero() {
            return match self.sig_figs {
                Some(s) if s > 1 => format!("0.{}", "0".repeat((s - 1) as usize)),
                _ => "0".into(),
            };
        }
        let hd = self.highest_digit();
        if !(-9..10).contains(&hd) {
            return self.to_scientific_string();
        }
        if let Some(least) = self.least_sig_fig() {
            if least > 0 {
                // Tracked trailing zeros left of the units column cannot be
                // expressed in fixed form.
                return self.to_scientific_string();
            }
        }
        let digits = self.mantissa.abs().to_string();
        let sign = if self.mantissa.is_negative() { "-" } else { "" };
        let mut body = if self.exponent >= 0 {
            let mut s = digits;
            s.push_str(&"0".repeat(self.exponent as usize));
            s
        } else {
            let frac_len = (-self.exponent) as usize;
            if digits.len() > frac_len {
                let (int_part, frac_part) = digits.split_at(digits.len() - frac_len);
                format!("{}.{}", int_part, frac_part)
            } else {
                format!("0.{}{}", "0".repeat(frac_len - digits.len()), digits)
            }
        };
        if let Some(sig) = self.sig_figs {
            let shown = self.digit_count();
            if sig > shown {
                let mut pad = (sig - shown) as usize;
                // Leading zeros in `0.00x` are not significant; padding goes
                // on the fractional tail.
                if !body.contains('.') {
                    body.push('.');
                }
                while pad > 0 {
                    body.push('0');
                    pad -= 1;
                }
            }
        }
        format!("{}{}", sign, body)
    }

    pub fn to_scientific_string(&self) -> String {
        if self.undefined {
            return "undefined".into();
        }
        if self.mantissa.is_zero() {
            return "0".into();
        }
        let digits = self.mantissa.abs().to_string();
        let sign = if self.mantissa.is_negative() { "-" } else { "" };
        let hd = self.highest_digit();
        let mut tail: String = digits[1..].to_string();
        if let Some(sig) = self.sig_figs {
            while (tail.len() as u64) < sig.saturating_sub(1) {
                tail.push('0');
            }
        }
        if tail.is_empty() {
            format!("{}{}e{}", sign, &digits[..1], hd)
        } else {
            format!("{}{}.{}e{}", sign, &digits[..1], tail, hd)
        }
    }
}

fn min_sig(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

/// Count significant digits in a literal: leading zeros never count,
/// trailing zeros count only when a decimal point is present.
fn literal_sig_figs(int_part: &str, frac_part: &str) -> u64 {
    let has_point = !frac_part.is_empty();
    let all: String = format!("{}{}", int_part, frac_part);
    let stripped = all.trim_start_matches('0');
    if stripped.is_empty() {
        return 1;
    }
    let count = if has_point {
        stripped.len()
    } else {
        stripped.trim_end_matches('0').len()
    };
    (count as u64).max(1)
}

impl PartialEq for BigDec {
    fn eq(&self, other: &Self) -> bool {
        if self.undefined || other.undefined {
            return self.undefined && other.undefined;
        }
        // Values are normalized at every operation boundary, so equality is
        // componentwise on the normalized representation.
        self.mantissa == other.mantissa && self.exponent == other.exponent
    }
}

impl PartialOrd for BigDec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other)
    }
}

impl fmt::Display for BigDec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_output_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDec {
        BigDec::parse(s, false).expect("literal")
    }

    fn sig(s: &str) -> BigDec {
        BigDec::parse(s, true).expect("literal")
    }

    #[test]
    fn normalize_strips_trailing_zeros() {
        let d = BigDec::from_parts(BigInt::from(1200), -2);
        assert_eq!(d.to_output_string(), "12");
        assert_eq!(d.digit_count(), 2);
    }

    #[test]
    fn parse_and_render_round_trip() {
        for s in ["0", "1", "-1", "12.5", "0.001", "-3.75"] {
            assert_eq!(dec(s).to_output_string(), s);
        }
    }

    #[test]
    fn equality_is_on_normalized_form() {
        assert_eq!(dec("1.50"), dec("1.5"));
        assert_eq!(BigDec::from_parts(BigInt::from(100), 0), dec("100"));
        assert_ne!(dec("1.5"), dec("1.51"));
    }

    #[test]
    fn addition_aligns_exponents() {
        assert_eq!(dec("1.2").add(&dec("0.034")).unwrap(), dec("1.234"));
        assert_eq!(dec("10").add(&dec("-10")).unwrap(), BigDec::zero());
    }

    #[test]
    fn sig_fig_addition_tracks_least_digit() {
        // 1.20 (least digit -2) + 0.034 (least digit -3): least = -2,
        // highest digit of 1.234 is 0, so 3 sig figs -> renders 1.23.
        let sum = sig("1.20").add(&sig("0.034")).unwrap();
        assert_eq!(sum.sig_figs(), Some(3));
        let mut rounded = sum.clone();
        rounded.round_to_sig_figs();
        assert_eq!(rounded.to_output_string(), "1.23");
    }

    #[test]
    fn sig_fig_multiplication_takes_min() {
        let p = sig("1.20").mul(&sig("2.0")).unwrap();
        assert_eq!(p.sig_figs(), Some(2));
    }

    #[test]
    fn kind_mixing_settles_deferred_rounding() {
        // (1.20 * 2.0) keeps full mantissa until an add arrives.
        let p = sig("1.23").mul(&sig("4.56")).unwrap();
        assert_eq!(p.last_op(), LastOp::MulDiv);
        let s = p.add(&sig("1.0")).unwrap();
        assert_eq!(s.last_op(), LastOp::AddSub);
        // 1.23*4.56 = 5.6088 -> settled to 5.61 before adding.
        let mut r = s.clone();
        r.round_to_sig_figs();
        assert_eq!(r.to_output_string(), "6.6");
    }

    #[test]
    fn division_truncates_to_max_precision() {
        let q = dec("1").div(&dec("3")).unwrap();
        assert_eq!(q.digit_count(), MAX_PRECISION);
        assert!(q.to_output_string().starts_with("0.333333"));
    }

    #[test]
    fn division_by_zero_fails() {
        assert!(dec("1").div(&BigDec::zero()).is_err());
    }

    #[test]
    fn division_exact_results_normalize() {
        assert_eq!(dec("10").div(&dec("4")).unwrap(), dec("2.5"));
    }

    #[test]
    fn modulo_matches_truncated_division() {
        assert_eq!(dec("7").rem(&dec("3")).unwrap(), dec("1"));
        assert_eq!(dec("-7").rem(&dec("3")).unwrap(), dec("-1"));
        assert_eq!(dec("7.5").rem(&dec("2")).unwrap(), dec("1.5"));
    }

    #[test]
    fn truncate_rounds_half_to_even_with_tiebreak() {
        let mut a = dec("125");
        a.truncate(2, true);
        assert_eq!(a, dec("12")); // pivot 5, below zero, 12 is even
        let mut b = dec("135");
        b.truncate(2, true);
        assert_eq!(b, dec("14")); // pivot 5, below zero, 13 is odd
        let mut c = dec("1251");
        c.truncate(2, true);
        assert_eq!(c, dec("13")); // pivot 5, nonzero below forces up
    }

    #[test]
    fn factorial_is_exact() {
        assert_eq!(dec("5").factorial().unwrap(), dec("120"));
        assert_eq!(dec("20").factorial().unwrap(), dec("2432902008176640000"));
    }

    #[test]
    fn rendering_uses_scientific_outside_band() {
        assert_eq!(dec("1e10").to_output_string(), "1e10");
        assert_eq!(dec("1e-10").to_output_string(), "1e-10");
        assert_eq!(dec("9999999999").to_output_string(), "9999999999");
    }

    #[test]
    fn tracked_trailing_zeros_render() {
        let d = sig("1.20");
        assert_eq!(d.to_output_string(), "1.20");
        // 100 with 2 sig figs cannot be written in fixed form.
        let h = dec("100").with_sig_figs(Some(2));
        assert_eq!(h.to_output_string(), "1.0e2");
    }

    #[test]
    fn undefined_propagates() {
        let u = BigDec::undefined();
        assert!(u.add(&dec("1")).unwrap().is_undefined());
        assert!(u.mul(&dec("2")).unwrap().is_undefined());
        assert_eq!(u, BigDec::undefined());
    }

    #[test]
    fn comparisons() {
        assert!(dec("2") > dec("1.5"));
        assert!(dec("-2") < dec("1.5"));
        assert!(dec("0.001") < dec("0.01"));
        assert_eq!(dec("5").compare(&dec("5")), Some(Ordering::Equal));
    }

    #[test]
    fn from_f64_escapes_on_integral_scale() {
        assert_eq!(BigDec::from_f64(2.5), dec("2.5"));
        assert_eq!(BigDec::from_f64(-0.125), dec("-0.125"));
        assert_eq!(BigDec::from_f64(3.0), dec("3"));
    }

    #[test]
    fn trig_reduces_modulo_two_pi() {
        let big = dec("1000000").mul(&BigDec::two_pi()).unwrap();
        let s = big.sin().unwrap().to_f64().unwrap();
        assert!(s.abs() < 1e-6);
    }

    #[test]
    fn pow_small_integer_is_exact() {
        assert_eq!(dec("2").pow(&dec("10")).unwrap(), dec("1024"));
        assert_eq!(dec("1.5").pow(&dec("2")).unwrap(), dec("2.25"));
    }
}
