/// Precedence-driven resolution of a token list.
///
/// For each precedence level from highest to lowest, every operator at
/// that level is executed left to right (right to left for assignment).
/// Collapsed tokens redirect through link pointers so indices captured at
/// sweep start stay valid. A sweep repeats at the same level until it
/// makes no progress, which lets deferred prefix chains and null-right
/// binaries settle.
use crate::core::value::Value;
use crate::errors::{CantusError, EvalResult};
use crate::operators::{OpCtx, OpId, OpShape, OperatorTable, Precedence};
use crate::tokenizer::{Token, TokenList};

struct Slots {
    ops: Vec<Option<OpId>>,
    objs: Vec<Option<Value>>,
    alive: Vec<bool>,
    link: Vec<usize>,
}

impl Slots {
    fn new(list: TokenList) -> Self {
        let n = list.tokens.len();
        let mut ops = Vec::with_capacity(n);
        let mut objs = Vec::with_capacity(n);
        for t in list.tokens {
            ops.push(t.op);
            objs.push(t.obj);
        }
        Slots {
            ops,
            objs,
            alive: vec![true; n],
            link: (0..n).collect(),
        }
    }

    /// Dereference to the live index, compressing the path.
    fn live(&mut self, k: usize) -> usize {
        let mut root = k;
        while self.link[root] != root {
            root = self.link[root];
        }
        let mut cur = k;
        while self.link[cur] != cur {
            let next = self.link[cur];
            self.link[cur] = root;
            cur = next;
        }
        root
    }

    fn prev_alive(&self, k: usize) -> Option<usize> {
        (0..k).rev().find(|&i| self.alive[i])
    }

    fn next_alive(&self, k: usize) -> Option<usize> {
        (k + 1..self.alive.len()).find(|&i| self.alive[i])
    }

    fn remove_into(&mut self, k: usize, into: usize) {
        self.alive[k] = false;
        self.link[k] = into;
    }

    fn next_op_prec(&self, k: usize, table: &OperatorTable) -> Option<Precedence> {
        let next = self.next_alive(k)?;
        let id = self.ops[next]?;
        Some(table.op(id).prec)
    }
}

fn prep(operand: Option<Value>, by_reference: bool) -> Option<Value> {
    operand.map(|v| if by_reference { v } else { v.deep_copy() })
}

/// Reduce a token list to a single value.
pub fn resolve_tokens(list: TokenList, ctx: &OpCtx) -> EvalResult<Value> {
    let table = OperatorTable::global();
    let mut slots = Slots::new(list);

    for level in Precedence::ALL {
        loop {
            let mut indices: Vec<usize> = (0..slots.ops.len())
                .filter(|&k| {
                    slots.alive[k]
                        && slots.ops[k].is_some_and(|id| table.op(id).prec == level)
                })
                .collect();
            if indices.is_empty() {
                break;
            }
            if level == Precedence::Assignment {
                indices.reverse();
            }
            let mut progress = false;
            for orig in indices {
                let k = slots.live(orig);
                if !slots.alive[k] {
                    continue;
                }
                let Some(id) = slots.ops[k] else { continue };
                let op = table.op(id);
                if op.prec != level {
                    continue;
                }
                match op.shape {
                    OpShape::UnaryBefore => {
                        let Some(j) = slots.prev_alive(k) else { continue };
                        let operand = slots.objs[j].take();
                        let saved = operand.clone();
                        let result =
                            (op.exec)(ctx, prep(operand, op.by_reference), None)?;
                        if crate::operators::is_defer(&result) {
                            slots.objs[j] = saved;
                            continue;
                        }
                        slots.objs[j] = Some(result);
                        if slots.objs[k].is_some() {
                            slots.ops[k] = Some(table.default_op);
                        } else {
                            slots.remove_into(k, j);
                        }
                        progress = true;
                    }
                    OpShape::UnaryAfter => {
                        if slots.objs[k].is_none()
                            && slots.next_op_prec(k, table) == Some(level)
                        {
                            // A same-level prefix chain reduces inside out.
                            continue;
                        }
                        let operand = slots.objs[k].take();
                        let saved = operand.clone();
                        let result =
                            (op.exec)(ctx, None, prep(operand, op.by_reference))?;
                        if crate::operators::is_defer(&result) {
                            slots.objs[k] = saved;
                            continue;
                        }
                        match slots.prev_alive(k) {
                            Some(j) if slots.objs[j].is_none() => {
                                slots.objs[j] = Some(result);
                                slots.remove_into(k, j);
                            }
                            Some(_) => {
                                slots.objs[k] = Some(result);
                                slots.ops[k] = Some(table.default_op);
                            }
                            None => {
                                slots.objs[k] = Some(result);
                                slots.ops[k] = None;
                            }
                        }
                        progress = true;
                    }
                    OpShape::Binary => {
                        if slots.objs[k].is_none() {
                            match slots.next_op_prec(k, table) {
                                Some(p) if p == level => continue,
                                Some(p) if p > level => {
                                    // The right side binds less tightly:
                                    // pre-evaluate it and splice.
                                    let value = resolve_right_partial(&mut slots, k, ctx)?;
                                    slots.objs[k] = Some(value);
                                    progress = true;
                                    continue;
                                }
                                _ => {}
                            }
                        }
                        let Some(j) = slots.prev_alive(k) else { continue };
                        let left = slots.objs[j].take();
                        let right = slots.objs[k].take();
                        let (saved_l, saved_r) = (left.clone(), right.clone());
                        let result = (op.exec)(
                            ctx,
                            prep(left, op.by_reference),
                            prep(right, op.by_reference),
                        )?;
                        if crate::operators::is_defer(&result) {
                            slots.objs[j] = saved_l;
                            slots.objs[k] = saved_r;
                            continue;
                        }
                        slots.objs[j] = Some(result);
                        slots.remove_into(k, j);
                        progress = true;
                    }
                }
            }
            if !progress {
                break;
            }
        }
    }

    let mut remaining = slots
        .objs
        .into_iter()
        .zip(slots.alive)
        .filter_map(|(obj, alive)| if alive { obj } else { None });
    let first = remaining.next();
    if remaining.next().is_some() {
        return Err(CantusError::syntax("malformed expression"));
    }
    Ok(first.unwrap_or_else(Value::undefined))
}

/// Collect everything after operator `k` into a fresh token list, resolve
/// it, and hand the value back for splicing.
fn resolve_right_partial(slots: &mut Slots, k: usize, ctx: &OpCtx) -> EvalResult<Value> {
    let mut sub = TokenList::default();
    sub.tokens.push(Token {
        op: None,
        obj: slots.objs[k].take(),
    });
    let mut cursor = slots.next_alive(k);
    while let Some(idx) = cursor {
        sub.tokens.push(Token {
            op: slots.ops[idx],
            obj: slots.objs[idx].take(),
        });
        cursor = slots.next_alive(idx);
        slots.remove_into(idx, k);
    }
    resolve_tokens(sub, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bigdec::BigDec;
    use crate::core::value::Reference;
    use crate::scope::Environment;

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

    fn list(parts: Vec<(Option<&str>, Option<Value>)>) -> TokenList {
        let table = OperatorTable::global();
        let mut out = TokenList::default();
        for (sign, obj) in parts {
            out.tokens.push(Token {
                op: sign.map(|s| table.find_sign(s, false).expect("sign")),
                obj,
            });
        }
        out
    }

    #[test]
    fn precedence_orders_execution() {
        let env = Environment::new();
        // 2 + 3 * 4 = 14
        let tokens = list(vec![
            (None, Some(num(2))),
            (Some("+"), Some(num(3))),
            (Some("*"), Some(num(4))),
        ]);
        let out = resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(out.loose_eq(&num(14)));
    }

    #[test]
    fn equal_precedence_runs_left_to_right() {
        let env = Environment::new();
        // 8 - 3 - 2 = 3
        let tokens = list(vec![
            (None, Some(num(8))),
            (Some("-"), Some(num(3))),
            (Some("-"), Some(num(2))),
        ]);
        let out = resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(out.loose_eq(&num(3)));
    }

    #[test]
    fn missing_left_operand_is_prefix_negation() {
        let env = Environment::new();
        // (null) - 5 + 2 = -3
        let tokens = list(vec![
            (None, None),
            (Some("-"), Some(num(5))),
            (Some("+"), Some(num(2))),
        ]);
        let out = resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(out.loose_eq(&num(-3)));
    }

    #[test]
    fn null_right_defers_to_the_next_same_level_operator() {
        let env = Environment::new();
        // 1 - -2 = 3
        let tokens = list(vec![
            (None, Some(num(1))),
            (Some("-"), None),
            (Some("-"), Some(num(2))),
        ]);
        let out = resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(out.loose_eq(&num(3)));
    }

    #[test]
    fn null_right_pre_evaluates_lower_precedence_tail() {
        let env = Environment::new();
        // 2 ^ -3 = 0.125
        let tokens = list(vec![
            (None, Some(num(2))),
            (Some("^"), None),
            (Some("-"), Some(num(3))),
        ]);
        let out = resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(out.loose_eq(&Value::Num(BigDec::parse("0.125", false).unwrap())));
    }

    #[test]
    fn postfix_factorial_consumes_the_left_operand() {
        let env = Environment::new();
        // 5! = 120, then default-multiplied by a following operand: 5!2 = 240
        let tokens = list(vec![(None, Some(num(5))), (Some("!"), Some(num(2)))]);
        let out = resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(out.loose_eq(&num(240)));
    }

    #[test]
    fn prefix_chain_reduces_inside_out() {
        let env = Environment::new();
        // not not true = true
        let tokens = list(vec![
            (None, None),
            (Some("not"), None),
            (Some("not"), Some(Value::Bool(true))),
        ]);
        let out = resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(out.loose_eq(&Value::Bool(true)));
    }

    #[test]
    fn assignment_sweeps_right_to_left() {
        let env = Environment::new();
        let a = Reference::new(num(0));
        let b = Reference::new(num(0));
        // a = b = 5 leaves both cells at 5
        let tokens = list(vec![
            (None, Some(Value::Ref(a.clone()))),
            (Some("="), Some(Value::Ref(b.clone()))),
            (Some("="), Some(num(5))),
        ]);
        resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(a.resolve_value().loose_eq(&num(5)));
        assert!(b.resolve_value().loose_eq(&num(5)));
    }

    #[test]
    fn non_reference_operators_copy_their_operands() {
        let env = Environment::new();
        let cell = Reference::new(num(3));
        // cell + 1 must not mutate the cell
        let tokens = list(vec![
            (None, Some(Value::Ref(cell.clone()))),
            (Some("+"), Some(num(1))),
        ]);
        let out = resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(out.loose_eq(&num(4)));
        assert!(cell.resolve_value().loose_eq(&num(3)));
    }

    #[test]
    fn empty_list_yields_undefined() {
        let env = Environment::new();
        let tokens = list(vec![(None, None)]);
        let out = resolve_tokens(tokens, &ctx(&env)).unwrap();
        assert!(out.is_undefined());
    }
}
