/// Built-in functions.
///
/// An explicit registry maps each name to arity metadata and an invoker;
/// it is populated once at startup. By-reference built-ins receive their
/// arguments unresolved so receiver mutation (`lst.sort()`) reaches the
/// caller's cells. Everything else gets resolved values.
use crate::bigdec::BigDec;
use crate::core::value::{Reference, SortKey, Value};
use crate::errors::{CantusError, ErrorKind, EvalResult};
use crate::evaluator::{AngleMode, Evaluator};
use chrono::Local;
use once_cell::sync::Lazy;
use std::collections::HashMap;

pub struct BuiltinCtx<'a> {
    pub ev: &'a Evaluator,
    pub scope: &'a str,
}

pub type BuiltinFn = fn(&BuiltinCtx, Vec<Value>) -> EvalResult<Value>;

pub struct Builtin {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub by_reference: bool,
    pub func: BuiltinFn,
}

static REGISTRY: Lazy<HashMap<&'static str, Builtin>> = Lazy::new(build_registry);

pub fn builtin(name: &str) -> Option<&'static Builtin> {
    REGISTRY.get(name)
}

pub fn constant(name: &str) -> Option<Value> {
    match name {
        "pi" => Some(Value::Num(BigDec::pi())),
        "e" => Some(Value::Num(BigDec::e())),
        "tau" => Some(Value::Num(BigDec::two_pi())),
        "i" => Some(Value::Complex { re: 0.0, im: 1.0 }),
        _ => None,
    }
}

pub fn is_constant(name: &str) -> bool {
    constant(name).is_some()
}

// ── Argument helpers ────────────────────────────────────────────────────

fn num_arg(args: &[Value], i: usize) -> EvalResult<BigDec> {
    match args.get(i).map(|v| v.resolve()) {
        Some(Value::Num(n)) => Ok(n),
        Some(other) => Err(CantusError::new(ErrorKind::TypeExpected {
            expected: "number".into(),
            found: other.type_name().into(),
        })),
        None => Err(CantusError::evaluator("missing argument")),
    }
}

fn text_arg(args: &[Value], i: usize) -> String {
    args.get(i).map(|v| v.display()).unwrap_or_default()
}

/// The receiver cell of a mutating built-in, when the caller passed one.
fn cell_arg(args: &[Value], i: usize) -> Option<Reference> {
    args.get(i).and_then(|v| v.resolve_ref())
}

fn matrix_items(v: &Value) -> EvalResult<Vec<Reference>> {
    match v.resolve() {
        Value::Matrix(items) | Value::Tuple(items) => Ok(items),
        Value::LinkedList(items) => Ok(items.into_iter().collect()),
        other => Err(CantusError::new(ErrorKind::TypeExpected {
            expected: "matrix".into(),
            found: other.type_name().into(),
        })),
    }
}

fn angle_in(ctx: &BuiltinCtx, v: BigDec) -> EvalResult<BigDec> {
    let factor = match ctx.ev.modes().angle {
        AngleMode::Radian => return Ok(v),
        AngleMode::Degree => BigDec::pi().div(&BigDec::from_i64(180))?,
        AngleMode::Gradian => BigDec::pi().div(&BigDec::from_i64(200))?,
    };
    v.mul(&factor)
}

fn angle_out(ctx: &BuiltinCtx, v: BigDec) -> EvalResult<BigDec> {
    let factor = match ctx.ev.modes().angle {
        AngleMode::Radian => return Ok(v),
        AngleMode::Degree => BigDec::from_i64(180).div(&BigDec::pi())?,
        AngleMode::Gradian => BigDec::from_i64(200).div(&BigDec::pi())?,
    };
    v.mul(&factor)
}

// ── Registry ────────────────────────────────────────────────────────────

macro_rules! builtins {
    ($($name:literal => ($min:expr, $max:expr, $by_ref:expr, $func:expr)),* $(,)?) => {{
        let mut map: HashMap<&'static str, Builtin> = HashMap::new();
        $(
            map.insert($name, Builtin {
                name: $name,
                min_args: $min,
                max_args: $max,
                by_reference: $by_ref,
                func: $func,
            });
        )*
        map
    }};
}

fn build_registry() -> HashMap<&'static str, Builtin> {
    builtins! {
        // Trigonometry (angle-mode aware)
        "sin" => (1, 1, false, |c, a| trig(c, a, BigDec::sin)),
        "cos" => (1, 1, false, |c, a| trig(c, a, BigDec::cos)),
        "tan" => (1, 1, false, |c, a| trig(c, a, BigDec::tan)),
        "asin" => (1, 1, false, |c, a| inverse_trig(c, a, BigDec::asin)),
        "acos" => (1, 1, false, |c, a| inverse_trig(c, a, BigDec::acos)),
        "atan" => (1, 1, false, |c, a| inverse_trig(c, a, BigDec::atan)),

        // Elementary functions
        "sqrt" => (1, 1, false, fn_sqrt),
        "root" => (2, 2, false, fn_root),
        "abs" => (1, 1, false, fn_abs),
        "ln" => (1, 1, false, |_, a| Ok(Value::Num(num_arg(&a, 0)?.ln()?))),
        "log" => (1, 1, false, |_, a| Ok(Value::Num(num_arg(&a, 0)?.log10()?))),
        "exp" => (1, 1, false, |_, a| Ok(Value::Num(num_arg(&a, 0)?.exp()?))),
        "pow" => (2, 2, false, |_, a| {
            Ok(Value::Num(num_arg(&a, 0)?.pow(&num_arg(&a, 1)?)?))
        }),
        "floor" => (1, 1, false, |_, a| Ok(Value::Num(num_arg(&a, 0)?.floor()))),
        "ceil" => (1, 1, false, |_, a| Ok(Value::Num(num_arg(&a, 0)?.ceil()))),
        "round" => (1, 1, false, |_, a| Ok(Value::Num(num_arg(&a, 0)?.round_int()))),
        "trunc" => (1, 1, false, |_, a| Ok(Value::Num(num_arg(&a, 0)?.trunc()))),
        "factorial" => (1, 1, false, |_, a| {
            Ok(Value::Num(num_arg(&a, 0)?.factorial()?))
        }),
        "min" => (1, usize::MAX, false, |_, a| fold_extreme(a, true)),
        "max" => (1, usize::MAX, false, |_, a| fold_extreme(a, false)),

        // Significant figures
        "sigfigs" => (1, 1, false, fn_sigfigs),
        "withsigfigs" => (2, 2, false, fn_withsigfigs),

        // Complex numbers
        "real" => (1, 1, false, |_, a| complex_part(a, true)),
        "imag" => (1, 1, false, |_, a| complex_part(a, false)),
        "conj" => (1, 1, false, fn_conj),

        // Conversions & inspection
        "num" => (1, 1, false, fn_num),
        "text" => (1, 1, false, |_, a| {
            Ok(Value::Text(a.first().map(|v| v.display()).unwrap_or_default()))
        }),
        "bool" => (1, 1, false, |_, a| {
            Ok(Value::Bool(a.first().is_some_and(|v| v.is_truthy())))
        }),
        "type" => (1, 1, false, fn_type),
        "copy" => (1, 1, false, |_, a| {
            Ok(a.first().map(|v| v.deep_copy()).unwrap_or_else(Value::undefined))
        }),

        // Collections
        "len" => (1, 1, false, fn_len),
        "sort" => (1, 1, true, fn_sort),
        "reverse" => (1, 1, true, fn_reverse),
        "append" => (2, 2, true, fn_append),
        "pop" => (1, 1, true, fn_pop),
        "contains" => (2, 2, false, fn_contains),
        "indexof" => (2, 2, false, fn_indexof),
        "keys" => (1, 1, false, fn_keys),
        "values" => (1, 1, false, fn_values),
        "sum" => (1, 1, false, fn_sum),
        "mean" => (1, 1, false, fn_mean),
        "range" => (1, 3, false, fn_range),
        "tomatrix" => (1, 1, false, fn_tomatrix),

        // Text
        "upper" => (1, 1, false, |_, a| Ok(Value::Text(text_arg(&a, 0).to_uppercase()))),
        "lower" => (1, 1, false, |_, a| Ok(Value::Text(text_arg(&a, 0).to_lowercase()))),
        "strip" => (1, 1, false, |_, a| Ok(Value::Text(text_arg(&a, 0).trim().to_string()))),
        "replace" => (3, 3, false, |_, a| {
            Ok(Value::Text(text_arg(&a, 0).replace(&text_arg(&a, 1), &text_arg(&a, 2))))
        }),
        "split" => (2, 2, false, fn_split),
        "join" => (2, 2, false, fn_join),

        // Date & time
        "now" => (0, 0, false, |_, _| {
            Ok(Value::DateTime(Local::now().naive_local()))
        }),

        // Answers & evaluation
        "ans" => (0, 1, false, fn_ans),
        "eval" => (1, 1, false, fn_eval),

        // Console I/O, routed through host events
        "print" => (0, usize::MAX, false, fn_print),
        "printline" => (0, usize::MAX, false, fn_printline),
        "input" => (0, 1, false, fn_input),
        "confirm" => (0, 1, false, fn_confirm),
        "clearconsole" => (0, 0, false, |c, _| {
            c.ev.events().clear_console();
            Ok(Value::undefined())
        }),

        // Instances
        "fields" => (1, 1, false, fn_fields),
    }
}

// ── Implementations ─────────────────────────────────────────────────────

fn trig(
    ctx: &BuiltinCtx,
    args: Vec<Value>,
    f: fn(&BigDec) -> EvalResult<BigDec>,
) -> EvalResult<Value> {
    let radians = angle_in(ctx, num_arg(&args, 0)?)?;
    Ok(Value::Num(f(&radians)?))
}

fn inverse_trig(
    ctx: &BuiltinCtx,
    args: Vec<Value>,
    f: fn(&BigDec) -> EvalResult<BigDec>,
) -> EvalResult<Value> {
    let out = f(&num_arg(&args, 0)?)?;
    Ok(Value::Num(angle_out(ctx, out)?))
}

fn fn_sqrt(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let n = num_arg(&args, 0)?;
    if n.is_negative() {
        // Negative radicand promotes to the complex plane.
        let mag = n.neg().sqrt()?.to_f64()?;
        return Ok(Value::Complex { re: 0.0, im: mag });
    }
    Ok(Value::Num(n.sqrt()?))
}

fn fn_root(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let base = num_arg(&args, 0)?;
    let degree = num_arg(&args, 1)?;
    if degree.is_zero() {
        return Err(CantusError::new(ErrorKind::DivisionByZero));
    }
    Ok(Value::Num(base.pow(&BigDec::one().div(&degree)?)?))
}

fn fn_abs(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    match args.first().map(|v| v.resolve()) {
        Some(Value::Num(n)) => Ok(Value::Num(n.abs())),
        Some(Value::Complex { re, im }) => {
            Ok(Value::Num(BigDec::from_f64((re * re + im * im).sqrt())))
        }
        Some(other) => Err(CantusError::new(ErrorKind::TypeExpected {
            expected: "number".into(),
            found: other.type_name().into(),
        })),
        None => Err(CantusError::evaluator("missing argument")),
    }
}

fn fold_extreme(args: Vec<Value>, take_min: bool) -> EvalResult<Value> {
    let pool: Vec<Value> = if args.len() == 1 {
        match args[0].resolve() {
            Value::Matrix(items) => items.iter().map(|r| r.resolve_value()).collect(),
            single => vec![single],
        }
    } else {
        args.iter().map(|v| v.resolve()).collect()
    };
    let mut best: Option<Value> = None;
    for v in pool {
        best = Some(match best {
            None => v,
            Some(cur) => {
                let replace = match cur.loose_cmp(&v) {
                    Some(ord) => {
                        if take_min {
                            ord == std::cmp::Ordering::Greater
                        } else {
                            ord == std::cmp::Ordering::Less
                        }
                    }
                    None => false,
                };
                if replace {
                    v
                } else {
                    cur
                }
            }
        });
    }
    Ok(best.unwrap_or_else(Value::undefined))
}

fn fn_sigfigs(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let n = num_arg(&args, 0)?;
    match n.sig_figs() {
        Some(s) => Ok(Value::Num(BigDec::from_i64(s as i64))),
        None => Ok(Value::undefined()),
    }
}

fn fn_withsigfigs(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let n = num_arg(&args, 0)?;
    let sig = num_arg(&args, 1)?.to_i64()?.max(1) as u64;
    Ok(Value::Num(n.with_sig_figs(Some(sig))))
}

fn complex_part(args: Vec<Value>, real: bool) -> EvalResult<Value> {
    match args.first().map(|v| v.resolve()) {
        Some(Value::Complex { re, im }) => Ok(Value::Num(BigDec::from_f64(if real {
            re
        } else {
            im
        }))),
        Some(Value::Num(n)) => Ok(if real {
            Value::Num(n)
        } else {
            Value::Num(BigDec::zero())
        }),
        _ => Err(CantusError::evaluator("real/imag expect a number")),
    }
}

fn fn_conj(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    match args.first().map(|v| v.resolve()) {
        Some(Value::Complex { re, im }) => Ok(Value::Complex { re, im: -im }),
        Some(v @ Value::Num(_)) => Ok(v),
        _ => Err(CantusError::evaluator("conj expects a number")),
    }
}

fn fn_num(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    match args.first().map(|v| v.resolve()) {
        Some(Value::Num(n)) => Ok(Value::Num(n)),
        Some(Value::Text(s)) => BigDec::parse(s.trim(), false)
            .map(Value::Num)
            .ok_or_else(|| CantusError::evaluator(format!("cannot parse '{}' as a number", s))),
        Some(Value::Bool(b)) => Ok(Value::Num(BigDec::from_i64(if b { 1 } else { 0 }))),
        _ => Err(CantusError::evaluator("num expects a number, text or boolean")),
    }
}

fn fn_type(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    match args.first().map(|v| v.resolve()) {
        Some(Value::Instance(inst)) => Ok(Value::Text(inst.read().short_class_name())),
        Some(other) => Ok(Value::Text(other.type_name().to_string())),
        None => Ok(Value::Text("undefined".into())),
    }
}

fn fn_len(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let len = match args.first().map(|v| v.resolve()) {
        Some(Value::Matrix(v)) => v.len(),
        Some(Value::Tuple(v)) => v.len(),
        Some(Value::LinkedList(v)) => v.len(),
        Some(Value::Set(v)) => v.len(),
        Some(Value::HashSet(v)) => v.len(),
        Some(Value::Dict(v)) => v.len(),
        Some(Value::Text(s)) => s.chars().count(),
        Some(other) => {
            return Err(CantusError::new(ErrorKind::TypeExpected {
                expected: "collection or text".into(),
                found: other.type_name().into(),
            }))
        }
        None => 0,
    };
    Ok(Value::Num(BigDec::from_i64(len as i64)))
}

fn fn_sort(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let cell = cell_arg(&args, 0);
    let value = args
        .first()
        .map(|v| v.resolve())
        .unwrap_or_else(Value::undefined);
    let mut items = matrix_items(&value)?;
    items.sort_by(|a, b| {
        a.resolve_value()
            .loose_cmp(&b.resolve_value())
            .unwrap_or_else(|| a.resolve_value().sort_key().cmp(&b.resolve_value().sort_key()))
    });
    let sorted = Value::Matrix(items);
    if let Some(cell) = cell {
        cell.set(sorted);
        Ok(Value::Ref(cell))
    } else {
        Ok(sorted)
    }
}

fn fn_reverse(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let cell = cell_arg(&args, 0);
    let value = args
        .first()
        .map(|v| v.resolve())
        .unwrap_or_else(Value::undefined);
    let mut items = matrix_items(&value)?;
    items.reverse();
    let reversed = Value::Matrix(items);
    if let Some(cell) = cell {
        cell.set(reversed);
        Ok(Value::Ref(cell))
    } else {
        Ok(reversed)
    }
}

fn fn_append(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let cell = cell_arg(&args, 0).ok_or_else(|| {
        CantusError::evaluator("append requires a variable to modify")
    })?;
    let element = args
        .get(1)
        .map(|v| v.resolve())
        .unwrap_or_else(Value::undefined);
    match cell.get() {
        Value::Matrix(mut items) => {
            items.push(Reference::new(element));
            cell.set(Value::Matrix(items));
        }
        Value::LinkedList(mut items) => {
            items.push_back(Reference::new(element));
            cell.set(Value::LinkedList(items));
        }
        Value::Set(mut items) => {
            items.insert(element.sort_key(), Reference::new(element));
            cell.set(Value::Set(items));
        }
        Value::HashSet(mut items) => {
            items.insert(element.sort_key(), Reference::new(element));
            cell.set(Value::HashSet(items));
        }
        other => {
            return Err(CantusError::new(ErrorKind::TypeExpected {
                expected: "collection".into(),
                found: other.type_name().into(),
            }))
        }
    }
    Ok(Value::Ref(cell))
}

fn fn_pop(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let cell = cell_arg(&args, 0)
        .ok_or_else(|| CantusError::evaluator("pop requires a variable to modify"))?;
    match cell.get() {
        Value::Matrix(mut items) => {
            let popped = items.pop();
            cell.set(Value::Matrix(items));
            Ok(popped
                .map(|r| r.resolve_value())
                .unwrap_or_else(Value::undefined))
        }
        Value::LinkedList(mut items) => {
            let popped = items.pop_back();
            cell.set(Value::LinkedList(items));
            Ok(popped
                .map(|r| r.resolve_value())
                .unwrap_or_else(Value::undefined))
        }
        other => Err(CantusError::new(ErrorKind::TypeExpected {
            expected: "matrix or linkedlist".into(),
            found: other.type_name().into(),
        })),
    }
}

fn fn_contains(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let needle = args
        .get(1)
        .map(|v| v.resolve())
        .unwrap_or_else(Value::undefined);
    let found = match args.first().map(|v| v.resolve()) {
        Some(Value::Matrix(items)) | Some(Value::Tuple(items)) => items
            .iter()
            .any(|r| r.resolve_value().loose_eq(&needle)),
        Some(Value::LinkedList(items)) => items
            .iter()
            .any(|r| r.resolve_value().loose_eq(&needle)),
        Some(Value::Set(items)) => items.contains_key(&needle.sort_key()),
        Some(Value::HashSet(items)) => items.contains_key(&needle.sort_key()),
        Some(Value::Dict(items)) => items.contains_key(&needle.sort_key()),
        Some(Value::Text(s)) => s.contains(&needle.display()),
        _ => false,
    };
    Ok(Value::Bool(found))
}

fn fn_indexof(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let needle = args
        .get(1)
        .map(|v| v.resolve())
        .unwrap_or_else(Value::undefined);
    let items = matrix_items(
        &args
            .first()
            .map(|v| v.resolve())
            .unwrap_or_else(Value::undefined),
    )?;
    for (i, r) in items.iter().enumerate() {
        if r.resolve_value().loose_eq(&needle) {
            return Ok(Value::Num(BigDec::from_i64(i as i64)));
        }
    }
    Ok(Value::Num(BigDec::from_i64(-1)))
}

fn fn_keys(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    match args.first().map(|v| v.resolve()) {
        Some(Value::Dict(items)) => Ok(Value::Matrix(
            items.values().map(|(k, _)| k.clone()).collect(),
        )),
        Some(Value::Set(items)) => Ok(Value::Matrix(items.values().cloned().collect())),
        Some(Value::HashSet(items)) => Ok(Value::Matrix(items.values().cloned().collect())),
        _ => Err(CantusError::evaluator("keys expects a dictionary or set")),
    }
}

fn fn_values(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    match args.first().map(|v| v.resolve()) {
        Some(Value::Dict(items)) => Ok(Value::Matrix(
            items.values().map(|(_, v)| v.clone()).collect(),
        )),
        _ => Err(CantusError::evaluator("values expects a dictionary")),
    }
}

fn fn_sum(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let items = matrix_items(
        &args
            .first()
            .map(|v| v.resolve())
            .unwrap_or_else(Value::undefined),
    )?;
    let mut acc = BigDec::zero();
    for r in items {
        match r.resolve_value() {
            Value::Num(n) => acc = acc.add(&n)?,
            other => {
                return Err(CantusError::new(ErrorKind::TypeExpected {
                    expected: "number".into(),
                    found: other.type_name().into(),
                }))
            }
        }
    }
    Ok(Value::Num(acc))
}

fn fn_mean(ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let items = matrix_items(
        &args
            .first()
            .map(|v| v.resolve())
            .unwrap_or_else(Value::undefined),
    )?;
    if items.is_empty() {
        return Ok(Value::undefined());
    }
    let count = BigDec::from_i64(items.len() as i64);
    match fn_sum(ctx, args)? {
        Value::Num(total) => Ok(Value::Num(total.div(&count)?)),
        other => Ok(other),
    }
}

fn fn_range(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let (start, stop) = if args.len() == 1 {
        (BigDec::zero(), num_arg(&args, 0)?)
    } else {
        (num_arg(&args, 0)?, num_arg(&args, 1)?)
    };
    let step = if args.len() >= 3 {
        num_arg(&args, 2)?
    } else {
        BigDec::one()
    };
    if step.is_zero() {
        return Err(CantusError::new(ErrorKind::DivisionByZero));
    }
    let mut out = Vec::new();
    let mut cur = start;
    let ascending = !step.is_negative();
    for _ in 0..1_000_000 {
        let done = if ascending {
            cur.compare(&stop) != Some(std::cmp::Ordering::Less)
        } else {
            cur.compare(&stop) != Some(std::cmp::Ordering::Greater)
        };
        if done {
            break;
        }
        out.push(Reference::new(Value::Num(cur.clone())));
        cur = cur.add(&step)?;
    }
    Ok(Value::Matrix(out))
}

fn fn_tomatrix(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    match args.first().map(|v| v.resolve()) {
        Some(Value::Tuple(items)) => Ok(Value::Matrix(items)),
        Some(Value::LinkedList(items)) => Ok(Value::Matrix(items.into_iter().collect())),
        Some(Value::Set(items)) => Ok(Value::Matrix(items.into_values().collect())),
        Some(Value::HashSet(items)) => {
            Ok(Value::Matrix(items.into_values().collect()))
        }
        Some(m @ Value::Matrix(_)) => Ok(m),
        Some(other) => Ok(Value::Matrix(vec![Reference::new(other)])),
        None => Ok(Value::Matrix(Vec::new())),
    }
}

fn fn_split(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let text = text_arg(&args, 0);
    let sep = text_arg(&args, 1);
    let parts: Vec<Reference> = text
        .split(&sep)
        .map(|p| Reference::new(Value::Text(p.to_string())))
        .collect();
    Ok(Value::Matrix(parts))
}

fn fn_join(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let items = matrix_items(
        &args
            .first()
            .map(|v| v.resolve())
            .unwrap_or_else(Value::undefined),
    )?;
    let sep = text_arg(&args, 1);
    let parts: Vec<String> = items.iter().map(|r| r.resolve_value().display()).collect();
    Ok(Value::Text(parts.join(&sep)))
}

fn fn_ans(ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let back = if args.is_empty() {
        0
    } else {
        num_arg(&args, 0)?.to_i64()?.max(0) as usize
    };
    Ok(ctx.ev.answer(back).unwrap_or_else(Value::undefined))
}

fn fn_eval(ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let source = text_arg(&args, 0);
    ctx.ev.eval_raw(&source, true, false)
}

fn fn_print(ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let text: Vec<String> = args.iter().map(|v| v.display()).collect();
    ctx.ev.events().write_output(&text.join(" "));
    Ok(Value::undefined())
}

fn fn_printline(ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let text: Vec<String> = args.iter().map(|v| v.display()).collect();
    ctx.ev
        .events()
        .write_output(&format!("{}\n", text.join(" ")));
    Ok(Value::undefined())
}

fn fn_input(ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let prompt = text_arg(&args, 0);
    let reply = ctx.ev.events().read_input("line", &prompt);
    Ok(Value::Text(reply))
}

fn fn_confirm(ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    let prompt = text_arg(&args, 0);
    let reply = ctx.ev.events().read_input("confirm", &prompt);
    let yes = matches!(reply.trim().to_lowercase().as_str(), "y" | "yes" | "true" | "1");
    Ok(Value::Bool(yes))
}

fn fn_fields(_ctx: &BuiltinCtx, args: Vec<Value>) -> EvalResult<Value> {
    match args.first().map(|v| v.resolve()) {
        Some(Value::Instance(inst)) => {
            let inner = inst.read();
            let mut out: indexmap::IndexMap<SortKey, (Reference, Reference)> =
                indexmap::IndexMap::new();
            for (name, r) in &inner.fields {
                let key = Value::Text(name.clone());
                out.insert(
                    key.sort_key(),
                    (Reference::new(key), r.clone()),
                );
            }
            Ok(Value::Dict(out))
        }
        _ => Err(CantusError::evaluator("fields expects a class instance")),
    }
}
