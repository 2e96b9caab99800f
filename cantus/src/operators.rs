/// Operator catalog and executors.
///
/// Operators come in four shapes: binary, unary-before (postfix),
/// unary-after (prefix) and bracket pairs. Precedence is the single sort
/// key for resolution; assignment-class operators evaluate right-to-left,
/// everything else left-to-right. The default operator (multiplication)
/// fills the gap between adjacent operands the tokenizer placed without an
/// explicit sign.
use crate::bigdec::{BigDec, MAX_PRECISION};
use crate::core::value::{Reference, SysMsg, Value};
use crate::errors::{CantusError, ErrorKind, EvalResult};
use crate::scope::Environment;
use chrono::Duration;
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Context available to operator executors.
pub struct OpCtx<'a> {
    pub env: &'a Environment,
    pub scope: &'a str,
    pub explicit: bool,
    pub always_truncate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Precedence {
    Exponent,
    Unary,
    Multiplicative,
    Additive,
    BitShift,
    Comparison,
    BitAnd,
    BitXor,
    BitOr,
    LogicalAnd,
    LogicalXor,
    LogicalOr,
    Assignment,
    Tuple,
}

impl Precedence {
    /// Sweep order, highest binding first.
    pub const ALL: [Precedence; 14] = [
        Precedence::Exponent,
        Precedence::Unary,
        Precedence::Multiplicative,
        Precedence::Additive,
        Precedence::BitShift,
        Precedence::Comparison,
        Precedence::BitAnd,
        Precedence::BitXor,
        Precedence::BitOr,
        Precedence::LogicalAnd,
        Precedence::LogicalXor,
        Precedence::LogicalOr,
        Precedence::Assignment,
        Precedence::Tuple,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpShape {
    Binary,
    /// Applies to the operand on its left (`5!`).
    UnaryBefore,
    /// Applies to the operand on its right (`~x`).
    UnaryAfter,
}

pub type OpExec = fn(&OpCtx, Option<Value>, Option<Value>) -> EvalResult<Value>;

pub struct Operator {
    pub signs: &'static [&'static str],
    pub shape: OpShape,
    pub prec: Precedence,
    pub by_reference: bool,
    pub assignment: bool,
    pub exec: OpExec,
}

impl Operator {
    pub fn canonical_sign(&self) -> &'static str {
        self.signs[0]
    }
}

pub type OpId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bracket {
    pub open: &'static str,
    pub close: &'static str,
}

pub const BRACKETS: [Bracket; 3] = [
    Bracket {
        open: "(",
        close: ")",
    },
    Bracket {
        open: "[",
        close: "]",
    },
    Bracket {
        open: "{",
        close: "}",
    },
];

pub struct OperatorTable {
    ops: Vec<Operator>,
    by_sign: HashMap<&'static str, OpId>,
    pub max_sign_len: usize,
    pub default_op: OpId,
}

static TABLE: Lazy<OperatorTable> = Lazy::new(OperatorTable::build);

impl OperatorTable {
    pub fn global() -> &'static OperatorTable {
        &TABLE
    }

    pub fn op(&self, id: OpId) -> &Operator {
        &self.ops[id]
    }

    /// Look up a sign, mapping `=` to `==` under condition mode.
    pub fn find_sign(&self, sign: &str, condition_mode: bool) -> Option<OpId> {
        let sign = if condition_mode && sign == "=" {
            "=="
        } else {
            sign
        };
        self.by_sign.get(sign).copied()
    }

    pub fn is_bracket_open(sign: &str) -> Option<Bracket> {
        BRACKETS.iter().copied().find(|b| b.open == sign)
    }

    fn build() -> OperatorTable {
        let ops: Vec<Operator> = vec![
            Operator {
                signs: &["^"],
                shape: OpShape::Binary,
                prec: Precedence::Exponent,
                by_reference: false,
                assignment: false,
                exec: exec_pow,
            },
            Operator {
                signs: &["!"],
                shape: OpShape::UnaryBefore,
                prec: Precedence::Unary,
                by_reference: false,
                assignment: false,
                exec: exec_factorial,
            },
            Operator {
                signs: &["~"],
                shape: OpShape::UnaryAfter,
                prec: Precedence::Unary,
                by_reference: false,
                assignment: false,
                exec: exec_bitnot,
            },
            Operator {
                signs: &["not"],
                shape: OpShape::UnaryAfter,
                prec: Precedence::Unary,
                by_reference: false,
                assignment: false,
                exec: exec_not,
            },
            Operator {
                signs: &["++"],
                shape: OpShape::UnaryBefore,
                prec: Precedence::Unary,
                by_reference: true,
                assignment: true,
                exec: exec_increment,
            },
            Operator {
                signs: &["--"],
                shape: OpShape::UnaryBefore,
                prec: Precedence::Unary,
                by_reference: true,
                assignment: true,
                exec: exec_decrement,
            },
            Operator {
                signs: &["*"],
                shape: OpShape::Binary,
                prec: Precedence::Multiplicative,
                by_reference: false,
                assignment: false,
                exec: exec_mul,
            },
            Operator {
                signs: &["/"],
                shape: OpShape::Binary,
                prec: Precedence::Multiplicative,
                by_reference: false,
                assignment: false,
                exec: exec_div,
            },
            Operator {
                signs: &["//"],
                shape: OpShape::Binary,
                prec: Precedence::Multiplicative,
                by_reference: false,
                assignment: false,
                exec: exec_idiv,
            },
            Operator {
                signs: &["%", "mod"],
                shape: OpShape::Binary,
                prec: Precedence::Multiplicative,
                by_reference: false,
                assignment: false,
                exec: exec_mod,
            },
            Operator {
                signs: &["+"],
                shape: OpShape::Binary,
                prec: Precedence::Additive,
                by_reference: false,
                assignment: false,
                exec: exec_add,
            },
            Operator {
                signs: &["-"],
                shape: OpShape::Binary,
                prec: Precedence::Additive,
                by_reference: false,
                assignment: false,
                exec: exec_sub,
            },
            Operator {
                signs: &["<<"],
                shape: OpShape::Binary,
                prec: Precedence::BitShift,
                by_reference: false,
                assignment: false,
                exec: exec_shl,
            },
            Operator {
                signs: &[">>"],
                shape: OpShape::Binary,
                prec: Precedence::BitShift,
                by_reference: false,
                assignment: false,
                exec: exec_shr,
            },
            Operator {
                signs: &["=="],
                shape: OpShape::Binary,
                prec: Precedence::Comparison,
                by_reference: false,
                assignment: false,
                exec: exec_eq,
            },
            Operator {
                signs: &["!=", "<>"],
                shape: OpShape::Binary,
                prec: Precedence::Comparison,
                by_reference: false,
                assignment: false,
                exec: exec_ne,
            },
            Operator {
                signs: &["<="],
                shape: OpShape::Binary,
                prec: Precedence::Comparison,
                by_reference: false,
                assignment: false,
                exec: exec_le,
            },
            Operator {
                signs: &[">="],
                shape: OpShape::Binary,
                prec: Precedence::Comparison,
                by_reference: false,
                assignment: false,
                exec: exec_ge,
            },
            Operator {
                signs: &["<"],
                shape: OpShape::Binary,
                prec: Precedence::Comparison,
                by_reference: false,
                assignment: false,
                exec: exec_lt,
            },
            Operator {
                signs: &[">"],
                shape: OpShape::Binary,
                prec: Precedence::Comparison,
                by_reference: false,
                assignment: false,
                exec: exec_gt,
            },
            Operator {
                signs: &["&"],
                shape: OpShape::Binary,
                prec: Precedence::BitAnd,
                by_reference: false,
                assignment: false,
                exec: exec_bitand,
            },
            Operator {
                signs: &["^^"],
                shape: OpShape::Binary,
                prec: Precedence::BitXor,
                by_reference: false,
                assignment: false,
                exec: exec_bitxor,
            },
            Operator {
                signs: &["|"],
                shape: OpShape::Binary,
                prec: Precedence::BitOr,
                by_reference: false,
                assignment: false,
                exec: exec_bitor,
            },
            Operator {
                signs: &["&&", "and"],
                shape: OpShape::Binary,
                prec: Precedence::LogicalAnd,
                by_reference: false,
                assignment: false,
                exec: exec_and,
            },
            Operator {
                signs: &["xor"],
                shape: OpShape::Binary,
                prec: Precedence::LogicalXor,
                by_reference: false,
                assignment: false,
                exec: exec_xor,
            },
            Operator {
                signs: &["||", "or"],
                shape: OpShape::Binary,
                prec: Precedence::LogicalOr,
                by_reference: false,
                assignment: false,
                exec: exec_or,
            },
            Operator {
                signs: &["="],
                shape: OpShape::Binary,
                prec: Precedence::Assignment,
                by_reference: true,
                assignment: true,
                exec: exec_assign,
            },
            Operator {
                signs: &[":="],
                shape: OpShape::Binary,
                prec: Precedence::Assignment,
                by_reference: true,
                assignment: true,
                exec: exec_assign,
            },
            Operator {
                signs: &["+="],
                shape: OpShape::Binary,
                prec: Precedence::Assignment,
                by_reference: true,
                assignment: true,
                exec: exec_add_assign,
            },
            Operator {
                signs: &["-="],
                shape: OpShape::Binary,
                prec: Precedence::Assignment,
                by_reference: true,
                assignment: true,
                exec: exec_sub_assign,
            },
            Operator {
                signs: &["*="],
                shape: OpShape::Binary,
                prec: Precedence::Assignment,
                by_reference: true,
                assignment: true,
                exec: exec_mul_assign,
            },
            Operator {
                signs: &["/="],
                shape: OpShape::Binary,
                prec: Precedence::Assignment,
                by_reference: true,
                assignment: true,
                exec: exec_div_assign,
            },
            Operator {
                signs: &["//="],
                shape: OpShape::Binary,
                prec: Precedence::Assignment,
                by_reference: true,
                assignment: true,
                exec: exec_idiv_assign,
            },
            Operator {
                signs: &["%="],
                shape: OpShape::Binary,
                prec: Precedence::Assignment,
                by_reference: true,
                assignment: true,
                exec: exec_mod_assign,
            },
            Operator {
                signs: &["^="],
                shape: OpShape::Binary,
                prec: Precedence::Assignment,
                by_reference: true,
                assignment: true,
                exec: exec_pow_assign,
            },
            Operator {
                signs: &[","],
                shape: OpShape::Binary,
                prec: Precedence::Tuple,
                by_reference: true,
                assignment: false,
                exec: exec_tuple,
            },
            Operator {
                signs: &[":"],
                shape: OpShape::Binary,
                prec: Precedence::Tuple,
                by_reference: true,
                assignment: false,
                exec: exec_pair,
            },
        ];

        let mut by_sign = HashMap::new();
        let mut max_sign_len = 0;
        let mut default_op = 0;
        for (id, op) in ops.iter().enumerate() {
            for sign in op.signs {
                by_sign.insert(*sign, id);
                max_sign_len = max_sign_len.max(sign.len());
            }
            if op.canonical_sign() == "*" {
                default_op = id;
            }
        }
        for b in &BRACKETS {
            max_sign_len = max_sign_len.max(b.open.len());
        }
        OperatorTable {
            ops,
            by_sign,
            max_sign_len,
            default_op,
        }
    }
}

// ── Operand helpers ─────────────────────────────────────────────────────

fn require(v: Option<Value>, sign: &str) -> EvalResult<Value> {
    v.ok_or_else(|| {
        CantusError::syntax(format!("operator '{}' is missing an operand", sign))
    })
}

fn as_num(v: &Value) -> EvalResult<BigDec> {
    match v.resolve() {
        Value::Num(n) => Ok(n),
        Value::Bool(b) => Ok(BigDec::from_i64(if b { 1 } else { 0 })),
        other => Err(CantusError::new(ErrorKind::TypeExpected {
            expected: "number".into(),
            found: other.type_name().into(),
        })),
    }
}

fn as_int(v: &Value) -> EvalResult<i128> {
    as_num(v)?.to_i128()
}

fn finish_num(ctx: &OpCtx, mut n: BigDec) -> Value {
    if ctx.always_truncate {
        n.truncate(MAX_PRECISION, true);
    }
    Value::Num(n)
}

fn complex_parts(v: &Value) -> Option<(f64, f64)> {
    match v.resolve() {
        Value::Complex { re, im } => Some((re, im)),
        Value::Num(n) => n.to_f64().ok().map(|f| (f, 0.0)),
        _ => None,
    }
}

fn complex_value(re: f64, im: f64) -> Value {
    if im == 0.0 {
        Value::Num(BigDec::from_f64(re))
    } else {
        Value::Complex { re, im }
    }
}

fn map_matrix(
    ctx: &OpCtx,
    items: &[Reference],
    f: impl Fn(&OpCtx, Value) -> EvalResult<Value>,
) -> EvalResult<Value> {
    let mut out = Vec::with_capacity(items.len());
    for r in items {
        out.push(Reference::new(f(ctx, r.resolve_value())?));
    }
    Ok(Value::Matrix(out))
}

fn zip_matrix(
    ctx: &OpCtx,
    a: &[Reference],
    b: &[Reference],
    f: impl Fn(&OpCtx, Value, Value) -> EvalResult<Value>,
) -> EvalResult<Value> {
    if a.len() != b.len() {
        return Err(CantusError::evaluator(format!(
            "matrix sizes do not match ({} and {})",
            a.len(),
            b.len()
        )));
    }
    let mut out = Vec::with_capacity(a.len());
    for (x, y) in a.iter().zip(b.iter()) {
        out.push(Reference::new(f(ctx, x.resolve_value(), y.resolve_value())?));
    }
    Ok(Value::Matrix(out))
}

// ── Arithmetic executors ────────────────────────────────────────────────

fn exec_add(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let r = require(r, "+")?;
    let l = match l {
        Some(v) => v,
        None => return Ok(r),
    };
    add_values(ctx, l, r)
}

pub fn add_values(ctx: &OpCtx, l: Value, r: Value) -> EvalResult<Value> {
    match (&l, &r) {
        (Value::Num(a), Value::Num(b)) => Ok(finish_num(ctx, a.add(b)?)),
        (Value::Text(a), _) => Ok(Value::Text(format!("{}{}", a, r.display()))),
        (_, Value::Text(b)) => Ok(Value::Text(format!("{}{}", l.display(), b))),
        (Value::Complex { .. }, _) | (_, Value::Complex { .. }) => {
            match (complex_parts(&l), complex_parts(&r)) {
                (Some((a, b)), Some((c, d))) => Ok(complex_value(a + c, b + d)),
                _ => Err(type_mismatch("+", &l, &r)),
            }
        }
        (Value::DateTime(dt), Value::Num(n)) => Ok(Value::DateTime(
            *dt + Duration::seconds((n.to_f64()? * 86_400.0) as i64),
        )),
        (Value::Num(n), Value::DateTime(dt)) => Ok(Value::DateTime(
            *dt + Duration::seconds((n.to_f64()? * 86_400.0) as i64),
        )),
        (Value::Matrix(a), Value::Matrix(b)) => zip_matrix(ctx, a, b, add_values),
        (Value::Matrix(a), _) => map_matrix(ctx, a, |c, x| add_values(c, x, r.clone())),
        (Value::Tuple(a), Value::Tuple(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Value::Tuple(out))
        }
        (Value::Set(a), Value::Set(b)) => {
            let mut out = a.clone();
            for (k, v) in b {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
            Ok(Value::Set(out))
        }
        (Value::HashSet(a), Value::HashSet(b)) => {
            let mut out = a.clone();
            for (k, v) in b {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
            Ok(Value::HashSet(out))
        }
        (Value::Dict(a), Value::Dict(b)) => {
            let mut out = a.clone();
            for (k, v) in b {
                out.insert(k.clone(), v.clone());
            }
            Ok(Value::Dict(out))
        }
        (Value::LinkedList(a), _) => {
            let mut out = a.clone();
            out.push_back(Reference::new(r));
            Ok(Value::LinkedList(out))
        }
        _ => Err(type_mismatch("+", &l, &r)),
    }
}

fn exec_sub(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let r = require(r, "-")?;
    match l {
        // No left operand: prefix negation.
        None => negate(ctx, r),
        Some(l) => sub_values(ctx, l, r),
    }
}

fn negate(ctx: &OpCtx, v: Value) -> EvalResult<Value> {
    match &v {
        Value::Num(n) => Ok(finish_num(ctx, n.neg())),
        Value::Complex { re, im } => Ok(Value::Complex { re: -re, im: -im }),
        Value::Matrix(items) => map_matrix(ctx, items, |c, x| negate(c, x)),
        _ => Err(CantusError::new(ErrorKind::TypeExpected {
            expected: "number".into(),
            found: v.type_name().into(),
        })),
    }
}

pub fn sub_values(ctx: &OpCtx, l: Value, r: Value) -> EvalResult<Value> {
    match (&l, &r) {
        (Value::Num(a), Value::Num(b)) => Ok(finish_num(ctx, a.sub(b)?)),
        (Value::Complex { .. }, _) | (_, Value::Complex { .. }) => {
            match (complex_parts(&l), complex_parts(&r)) {
                (Some((a, b)), Some((c, d))) => Ok(complex_value(a - c, b - d)),
                _ => Err(type_mismatch("-", &l, &r)),
            }
        }
        (Value::DateTime(dt), Value::Num(n)) => Ok(Value::DateTime(
            *dt - Duration::seconds((n.to_f64()? * 86_400.0) as i64),
        )),
        (Value::DateTime(a), Value::DateTime(b)) => {
            let days = (*a - *b).num_seconds() as f64 / 86_400.0;
            Ok(Value::Num(BigDec::from_f64(days)))
        }
        (Value::Matrix(a), Value::Matrix(b)) => zip_matrix(ctx, a, b, sub_values),
        (Value::Matrix(a), _) => map_matrix(ctx, a, |c, x| sub_values(c, x, r.clone())),
        (Value::Set(a), Value::Set(b)) => {
            let mut out = a.clone();
            for k in b.keys() {
                out.remove(k);
            }
            Ok(Value::Set(out))
        }
        (Value::HashSet(a), Value::HashSet(b)) => {
            let mut out = a.clone();
            for k in b.keys() {
                out.shift_remove(k);
            }
            Ok(Value::HashSet(out))
        }
        (Value::Dict(a), Value::Dict(b)) => {
            let mut out = a.clone();
            for k in b.keys() {
                out.shift_remove(k);
            }
            Ok(Value::Dict(out))
        }
        _ => Err(type_mismatch("-", &l, &r)),
    }
}

fn exec_mul(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "*")?;
    let r = require(r, "*")?;
    mul_values(ctx, l, r)
}

pub fn mul_values(ctx: &OpCtx, l: Value, r: Value) -> EvalResult<Value> {
    match (&l, &r) {
        (Value::Num(a), Value::Num(b)) => Ok(finish_num(ctx, a.mul(b)?)),
        (Value::Complex { .. }, _) | (_, Value::Complex { .. }) => {
            match (complex_parts(&l), complex_parts(&r)) {
                (Some((a, b)), Some((c, d))) => {
                    Ok(complex_value(a * c - b * d, a * d + b * c))
                }
                _ => Err(type_mismatch("*", &l, &r)),
            }
        }
        (Value::Text(s), Value::Num(n)) | (Value::Num(n), Value::Text(s)) => {
            let count = n.to_i64()?;
            if count < 0 {
                return Err(CantusError::evaluator("cannot repeat text a negative number of times"));
            }
            Ok(Value::Text(s.repeat(count as usize)))
        }
        (Value::Matrix(a), Value::Matrix(b)) => zip_matrix(ctx, a, b, mul_values),
        (Value::Matrix(a), _) => map_matrix(ctx, a, |c, x| mul_values(c, x, r.clone())),
        (_, Value::Matrix(b)) => map_matrix(ctx, b, |c, x| mul_values(c, l.clone(), x)),
        _ => Err(type_mismatch("*", &l, &r)),
    }
}

fn exec_div(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "/")?;
    let r = require(r, "/")?;
    div_values(ctx, l, r)
}

pub fn div_values(ctx: &OpCtx, l: Value, r: Value) -> EvalResult<Value> {
    match (&l, &r) {
        (Value::Num(a), Value::Num(b)) => Ok(finish_num(ctx, a.div(b)?)),
        (Value::Complex { .. }, _) | (_, Value::Complex { .. }) => {
            match (complex_parts(&l), complex_parts(&r)) {
                (Some((a, b)), Some((c, d))) => {
                    let denom = c * c + d * d;
                    if denom == 0.0 {
                        return Err(CantusError::new(ErrorKind::DivisionByZero));
                    }
                    Ok(complex_value((a * c + b * d) / denom, (b * c - a * d) / denom))
                }
                _ => Err(type_mismatch("/", &l, &r)),
            }
        }
        (Value::Matrix(a), _) => map_matrix(ctx, a, |c, x| div_values(c, x, r.clone())),
        _ => Err(type_mismatch("/", &l, &r)),
    }
}

fn exec_idiv(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "//")?;
    let r = require(r, "//")?;
    let q = as_num(&l)?.div(&as_num(&r)?)?;
    Ok(finish_num(ctx, q.floor()))
}

fn exec_mod(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "%")?;
    let r = require(r, "%")?;
    Ok(finish_num(ctx, as_num(&l)?.rem(&as_num(&r)?)?))
}

fn exec_pow(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "^")?;
    let r = require(r, "^")?;
    Ok(finish_num(ctx, as_num(&l)?.pow(&as_num(&r)?)?))
}

fn exec_factorial(ctx: &OpCtx, l: Option<Value>, _r: Option<Value>) -> EvalResult<Value> {
    let v = require(l, "!")?;
    Ok(finish_num(ctx, as_num(&v)?.factorial()?))
}

// ── Bitwise & shifts ────────────────────────────────────────────────────

fn exec_bitnot(_ctx: &OpCtx, _l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let v = require(r, "~")?;
    Ok(Value::Num(BigDec::from_i64(!(as_int(&v)? as i64))))
}

fn exec_not(_ctx: &OpCtx, _l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let v = require(r, "not")?;
    Ok(Value::Bool(!v.is_truthy()))
}

fn bit_op(
    l: Option<Value>,
    r: Option<Value>,
    sign: &str,
    ints: fn(i128, i128) -> i128,
    bools: fn(bool, bool) -> bool,
) -> EvalResult<Value> {
    let l = require(l, sign)?;
    let r = require(r, sign)?;
    if let (Value::Bool(a), Value::Bool(b)) = (&l.resolve(), &r.resolve()) {
        return Ok(Value::Bool(bools(*a, *b)));
    }
    let out = ints(as_int(&l)?, as_int(&r)?);
    Ok(Value::Num(BigDec::from_parts(out.into(), 0)))
}

fn exec_bitand(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    bit_op(l, r, "&", |a, b| a & b, |a, b| a & b)
}

fn exec_bitor(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    bit_op(l, r, "|", |a, b| a | b, |a, b| a | b)
}

fn exec_bitxor(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    bit_op(l, r, "^^", |a, b| a ^ b, |a, b| a ^ b)
}

fn exec_shl(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "<<")?;
    let r = require(r, "<<")?;
    let shift = as_int(&r)?.clamp(0, 120) as u32;
    Ok(Value::Num(BigDec::from_parts(
        (as_int(&l)? << shift).into(),
        0,
    )))
}

fn exec_shr(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, ">>")?;
    let r = require(r, ">>")?;
    let shift = as_int(&r)?.clamp(0, 120) as u32;
    Ok(Value::Num(BigDec::from_parts(
        (as_int(&l)? >> shift).into(),
        0,
    )))
}

// ── Comparison & logic ──────────────────────────────────────────────────

fn exec_eq(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "==")?;
    let r = require(r, "==")?;
    Ok(Value::Bool(l.loose_eq(&r)))
}

fn exec_ne(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "!=")?;
    let r = require(r, "!=")?;
    Ok(Value::Bool(!l.loose_eq(&r)))
}

fn ordered(l: Option<Value>, r: Option<Value>, sign: &str) -> EvalResult<Ordering> {
    let l = require(l, sign)?;
    let r = require(r, sign)?;
    l.loose_cmp(&r)
        .ok_or_else(|| type_mismatch(sign, &l, &r))
}

fn exec_lt(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    Ok(Value::Bool(ordered(l, r, "<")? == Ordering::Less))
}

fn exec_le(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    Ok(Value::Bool(ordered(l, r, "<=")? != Ordering::Greater))
}

fn exec_gt(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    Ok(Value::Bool(ordered(l, r, ">")? == Ordering::Greater))
}

fn exec_ge(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    Ok(Value::Bool(ordered(l, r, ">=")? != Ordering::Less))
}

fn exec_and(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "&&")?;
    let r = require(r, "&&")?;
    Ok(Value::Bool(l.is_truthy() && r.is_truthy()))
}

fn exec_or(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "||")?;
    let r = require(r, "||")?;
    Ok(Value::Bool(l.is_truthy() || r.is_truthy()))
}

fn exec_xor(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, "xor")?;
    let r = require(r, "xor")?;
    Ok(Value::Bool(l.is_truthy() != r.is_truthy()))
}

// ── Assignment family (by reference) ────────────────────────────────────

fn target_cell(ctx: &OpCtx, l: Option<Value>) -> EvalResult<Reference> {
    match require(l, "=")? {
        Value::Ref(r) => Ok(r.resolve_cell()),
        Value::Ident(name) => {
            // Late declaration: the tokenizer leaves an identifier when the
            // target did not exist yet.
            if ctx.explicit {
                return Err(CantusError::new(ErrorKind::UndefinedVariable(name)));
            }
            let var = ctx.env.declare_var(
                &name,
                Value::undefined(),
                ctx.scope,
                Default::default(),
            );
            Ok(var.reference)
        }
        other => Err(CantusError::evaluator(format!(
            "cannot assign to {}",
            other.type_name()
        ))),
    }
}

fn exec_assign(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let r = require(r, "=")?.resolve();
    let cell = target_cell(ctx, l)?;
    cell.set(r.clone());
    Ok(Value::Ref(cell))
}

fn compound_assign(
    ctx: &OpCtx,
    l: Option<Value>,
    r: Option<Value>,
    f: fn(&OpCtx, Value, Value) -> EvalResult<Value>,
) -> EvalResult<Value> {
    let r = require(r, "=")?.resolve();
    let cell = target_cell(ctx, l)?;
    let updated = f(ctx, cell.get(), r)?;
    cell.set(updated);
    Ok(Value::Ref(cell))
}

fn exec_add_assign(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    compound_assign(ctx, l, r, add_values)
}

fn exec_sub_assign(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    compound_assign(ctx, l, r, sub_values)
}

fn exec_mul_assign(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    compound_assign(ctx, l, r, mul_values)
}

fn exec_div_assign(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    compound_assign(ctx, l, r, div_values)
}

fn exec_idiv_assign(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    compound_assign(ctx, l, r, |c, a, b| {
        Ok(finish_num(c, as_num(&a)?.div(&as_num(&b)?)?.floor()))
    })
}

fn exec_mod_assign(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    compound_assign(ctx, l, r, |c, a, b| {
        Ok(finish_num(c, as_num(&a)?.rem(&as_num(&b)?)?))
    })
}

fn exec_pow_assign(ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    compound_assign(ctx, l, r, |c, a, b| {
        Ok(finish_num(c, as_num(&a)?.pow(&as_num(&b)?)?))
    })
}

fn exec_increment(ctx: &OpCtx, l: Option<Value>, _r: Option<Value>) -> EvalResult<Value> {
    step_in_place(ctx, l, 1)
}

fn exec_decrement(ctx: &OpCtx, l: Option<Value>, _r: Option<Value>) -> EvalResult<Value> {
    step_in_place(ctx, l, -1)
}

fn step_in_place(ctx: &OpCtx, l: Option<Value>, delta: i64) -> EvalResult<Value> {
    let cell = target_cell(ctx, l)?;
    let updated = as_num(&cell.get())?.add(&BigDec::from_i64(delta))?;
    cell.set(finish_num(ctx, updated));
    Ok(Value::Ref(cell))
}

// ── Tuple builders ──────────────────────────────────────────────────────

fn to_element(v: Value) -> Reference {
    match v {
        Value::Ref(r) => r,
        other => Reference::new(other),
    }
}

fn exec_tuple(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let r = require(r, ",")?;
    let l = require(l, ",")?;
    match l {
        Value::Tuple(mut items) => {
            items.push(to_element(r));
            Ok(Value::Tuple(items))
        }
        other => Ok(Value::Tuple(vec![to_element(other), to_element(r)])),
    }
}

fn exec_pair(_ctx: &OpCtx, l: Option<Value>, r: Option<Value>) -> EvalResult<Value> {
    let l = require(l, ":")?;
    let r = require(r, ":")?;
    Ok(Value::Tuple(vec![to_element(l), to_element(r)]))
}

// ── Shared helpers ──────────────────────────────────────────────────────

fn type_mismatch(sign: &str, l: &Value, r: &Value) -> CantusError {
    CantusError::evaluator(format!(
        "operator '{}' is not defined for {} and {}",
        sign,
        l.type_name(),
        r.type_name()
    ))
}

/// Index into a collection, used by the `[]` bracket with a left operand.
pub fn index_value(base: &Value, index: &Value) -> EvalResult<Value> {
    let base = base.resolve();
    match &base {
        Value::Matrix(items) | Value::Tuple(items) => {
            let i = normalize_index(index, items.len())?;
            Ok(Value::Ref(items[i].clone()))
        }
        Value::LinkedList(items) => {
            let i = normalize_index(index, items.len())?;
            Ok(Value::Ref(items[i].clone()))
        }
        Value::Text(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(index, chars.len())?;
            Ok(Value::Text(chars[i].to_string()))
        }
        Value::Dict(items) => {
            let key = index.sort_key();
            items
                .get(&key)
                .map(|(_, v)| Value::Ref(v.clone()))
                .ok_or_else(|| {
                    CantusError::evaluator(format!("key {} not found", index.repr()))
                })
        }
        Value::Set(items) => Ok(Value::Bool(items.contains_key(&index.sort_key()))),
        Value::HashSet(items) => Ok(Value::Bool(items.contains_key(&index.sort_key()))),
        other => Err(CantusError::new(ErrorKind::TypeExpected {
            expected: "collection".into(),
            found: other.type_name().into(),
        })),
    }
}

fn normalize_index(index: &Value, len: usize) -> EvalResult<usize> {
    let i = as_num(&index.resolve())?.to_i64()?;
    let i = if i < 0 { i + len as i64 } else { i };
    if i < 0 || i as usize >= len {
        return Err(CantusError::evaluator(format!(
            "index {} out of range for length {}",
            index.display(),
            len
        )));
    }
    Ok(i as usize)
}

/// True when the executor asked the resolver to try the next overload.
pub fn is_defer(v: &Value) -> bool {
    matches!(v, Value::Sys(SysMsg::Defer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(env: &Environment) -> OpCtx<'_> {
        OpCtx {
            env,
            scope: "cantus",
            explicit: false,
            always_truncate: false,
        }
    }

    fn num(v: i64) -> Value {
        Value::Num(BigDec::from_i64(v))
    }

    #[test]
    fn longest_sign_wins() {
        let t = OperatorTable::global();
        let eq = t.find_sign("==", false).unwrap();
        let assign = t.find_sign("=", false).unwrap();
        assert_ne!(eq, assign);
        assert_eq!(t.find_sign("=", true), Some(eq));
        assert!(t.op(assign).assignment);
    }

    #[test]
    fn add_covers_the_numeric_tower() {
        let env = Environment::new();
        let c = ctx(&env);
        assert!(exec_add(&c, Some(num(2)), Some(num(3)))
            .unwrap()
            .loose_eq(&num(5)));
        let complex = exec_add(
            &c,
            Some(Value::Complex { re: 1.0, im: 2.0 }),
            Some(num(3)),
        )
        .unwrap();
        assert!(matches!(complex, Value::Complex { re, im } if re == 4.0 && im == 2.0));
    }

    #[test]
    fn missing_left_operand_negates() {
        let env = Environment::new();
        let c = ctx(&env);
        let v = exec_sub(&c, None, Some(num(5))).unwrap();
        assert!(v.loose_eq(&num(-5)));
    }

    #[test]
    fn assignment_mutates_the_cell() {
        let env = Environment::new();
        let c = ctx(&env);
        let cell = Reference::new(num(1));
        let out = exec_assign(&c, Some(Value::Ref(cell.clone())), Some(num(9))).unwrap();
        assert!(cell.get().loose_eq(&num(9)));
        assert!(out.resolve().loose_eq(&num(9)));
    }

    #[test]
    fn assignment_declares_missing_targets() {
        let env = Environment::new();
        let c = ctx(&env);
        exec_assign(&c, Some(Value::Ident("fresh".into())), Some(num(4))).unwrap();
        assert!(env
            .find_var("fresh", "cantus")
            .unwrap()
            .get()
            .loose_eq(&num(4)));
    }

    #[test]
    fn explicit_mode_rejects_implicit_targets() {
        let env = Environment::new();
        let c = OpCtx {
            env: &env,
            scope: "cantus",
            explicit: true,
            always_truncate: false,
        };
        assert!(exec_assign(&c, Some(Value::Ident("ghost".into())), Some(num(1))).is_err());
    }

    #[test]
    fn matrix_elementwise_arithmetic() {
        let env = Environment::new();
        let c = ctx(&env);
        let m = Value::Matrix(vec![Reference::new(num(1)), Reference::new(num(2))]);
        let out = mul_values(&c, m, num(3)).unwrap();
        if let Value::Matrix(items) = out {
            assert!(items[0].get().loose_eq(&num(3)));
            assert!(items[1].get().loose_eq(&num(6)));
        } else {
            panic!("expected matrix");
        }
    }

    #[test]
    fn indexing_supports_negative_offsets() {
        let m = Value::Matrix(vec![
            Reference::new(num(10)),
            Reference::new(num(20)),
            Reference::new(num(30)),
        ]);
        assert!(index_value(&m, &num(-1)).unwrap().resolve().loose_eq(&num(30)));
        assert!(index_value(&m, &num(0)).unwrap().resolve().loose_eq(&num(10)));
        assert!(index_value(&m, &num(3)).is_err());
    }

    #[test]
    fn tuple_operator_accumulates() {
        let env = Environment::new();
        let c = ctx(&env);
        let pair = exec_tuple(&c, Some(num(1)), Some(num(2))).unwrap();
        let triple = exec_tuple(&c, Some(pair), Some(num(3))).unwrap();
        if let Value::Tuple(items) = triple {
            assert_eq!(items.len(), 3);
        } else {
            panic!("expected tuple");
        }
    }
}
