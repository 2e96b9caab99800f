/// Core value types for the Cantus evaluator.
///
/// Every runtime value is a `Value` variant. Variable bindings are
/// `Reference`s to shared cells; assignment mutates the cell so aliases
/// observe the change, while `deep_copy` allocates fresh cells all the way
/// down. References may point at other references (re-pointable bindings);
/// `resolve` collapses chains transparently.
use crate::bigdec::BigDec;
use crate::core::oop::{ClassInstance, Lambda};
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

pub type InstanceRef = Arc<RwLock<ClassInstance>>;

/// Internal signal values that flow through the resolver but are never
/// user-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysMsg {
    /// Ask the resolver to advance to the next operator with the same sign.
    Defer,
}

#[derive(Debug, Clone)]
pub enum Value {
    Num(BigDec),
    Text(String),
    Bool(bool),
    DateTime(NaiveDateTime),
    Complex { re: f64, im: f64 },
    Matrix(Vec<Reference>),
    Tuple(Vec<Reference>),
    Set(BTreeMap<SortKey, Reference>),
    HashSet(IndexMap<SortKey, Reference>),
    Dict(IndexMap<SortKey, (Reference, Reference)>),
    LinkedList(VecDeque<Reference>),
    Lambda(Lambda),
    Instance(InstanceRef),
    Ref(Reference),
    /// Parse-only placeholder produced by the tokenizer for names that are
    /// resolved late (assignment targets).
    Ident(String),
    Sys(SysMsg),
}

/// A shared value cell. Cloning the reference aliases the cell.
#[derive(Debug, Clone)]
pub struct Reference(Arc<RwLock<Value>>);

impl Reference {
    pub fn new(value: Value) -> Self {
        Reference(Arc::new(RwLock::new(value)))
    }

    /// Clone of the cell's current content (no chain walking).
    pub fn get(&self) -> Value {
        self.0.read().clone()
    }

    /// Overwrite the cell content in place.
    pub fn set(&self, value: Value) {
        *self.0.write() = value;
    }

    /// Follow reference chains and return the final plain value.
    pub fn resolve_value(&self) -> Value {
        self.resolve_cell().get()
    }

    /// Follow reference chains and return the final cell.
    pub fn resolve_cell(&self) -> Reference {
        let mut cell = self.clone();
        for _ in 0..64 {
            let next = match &*cell.0.read() {
                Value::Ref(inner) => Some(inner.clone()),
                _ => None,
            };
            match next {
                Some(next) => cell = next,
                None => return cell,
            }
        }
        cell
    }

    pub fn deep_copy(&self) -> Reference {
        Reference::new(self.resolve_value().deep_copy())
    }

    pub fn ptr_eq(&self, other: &Reference) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Value {
    pub fn undefined() -> Value {
        Value::Num(BigDec::undefined())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Num(n) if n.is_undefined())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Num(_) => "number",
            Value::Text(_) => "text",
            Value::Bool(_) => "boolean",
            Value::DateTime(_) => "datetime",
            Value::Complex { .. } => "complex",
            Value::Matrix(_) => "matrix",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::HashSet(_) => "hashset",
            Value::Dict(_) => "dictionary",
            Value::LinkedList(_) => "linkedlist",
            Value::Lambda(_) => "lambda",
            Value::Instance(_) => "instance",
            Value::Ref(_) => "reference",
            Value::Ident(_) => "identifier",
            Value::Sys(_) => "system",
        }
    }

    /// Unwrap a single reference level; other values pass through.
    pub fn get_value(&self) -> Value {
        match self {
            Value::Ref(r) => r.get(),
            other => other.clone(),
        }
    }

    /// Collapse reference chains to a plain value.
    pub fn resolve(&self) -> Value {
        match self {
            Value::Ref(r) => r.resolve_value(),
            other => other.clone(),
        }
    }

    /// The final cell behind a reference value, if this is one.
    pub fn resolve_ref(&self) -> Option<Reference> {
        match self {
            Value::Ref(r) => Some(r.resolve_cell()),
            _ => None,
        }
    }

    pub fn deep_copy(&self) -> Value {
        self.deep_copy_depth(0)
    }

    fn deep_copy_depth(&self, depth: usize) -> Value {
        // Instances can form reference cycles through their fields; the
        // walk is depth-capped and degrades to aliasing past the cap.
        if depth > 64 {
            return self.clone();
        }
        let copy_ref =
            |r: &Reference| Reference::new(r.resolve_value().deep_copy_depth(depth + 1));
        match self {
            Value::Ref(r) => r.resolve_value().deep_copy_depth(depth + 1),
            Value::Matrix(items) => Value::Matrix(items.iter().map(copy_ref).collect()),
            Value::Tuple(items) => Value::Tuple(items.iter().map(copy_ref).collect()),
            Value::LinkedList(items) => Value::LinkedList(items.iter().map(copy_ref).collect()),
            Value::Set(items) => Value::Set(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), copy_ref(v)))
                    .collect(),
            ),
            Value::HashSet(items) => Value::HashSet(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), copy_ref(v)))
                    .collect(),
            ),
            Value::Dict(items) => Value::Dict(
                items
                    .iter()
                    .map(|(k, (kr, vr))| (k.clone(), (copy_ref(kr), copy_ref(vr))))
                    .collect(),
            ),
            Value::Instance(inst) => {
                let inner = inst.read();
                let fields = inner
                    .fields
                    .iter()
                    .map(|(name, r)| (name.clone(), copy_ref(r)))
                    .collect();
                Value::Instance(Arc::new(RwLock::new(ClassInstance {
                    class_name: inner.class_name.clone(),
                    fields,
                    inner_scope: inner.inner_scope.clone(),
                })))
            }
            other => other.clone(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Num(n) => !n.is_undefined() && !n.is_zero(),
            Value::Text(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::DateTime(_) => true,
            Value::Complex { re, im } => *re != 0.0 || *im != 0.0,
            Value::Matrix(v) => !v.is_empty(),
            Value::Tuple(v) => !v.is_empty(),
            Value::Set(v) => !v.is_empty(),
            Value::HashSet(v) => !v.is_empty(),
            Value::Dict(v) => !v.is_empty(),
            Value::LinkedList(v) => !v.is_empty(),
            Value::Lambda(_) | Value::Instance(_) => true,
            Value::Ref(r) => r.resolve_value().is_truthy(),
            Value::Ident(_) | Value::Sys(_) => false,
        }
    }

    /// Loose structural equality across resolved values.
    pub fn loose_eq(&self, other: &Value) -> bool {
        let a = self.resolve();
        let b = other.resolve();
        match (&a, &b) {
            (Value::Num(x), Value::Num(y)) => x == y,
            (Value::Text(x), Value::Text(y)) => x == y,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::DateTime(x), Value::DateTime(y)) => x == y,
            (Value::Complex { re: a1, im: b1 }, Value::Complex { re: a2, im: b2 }) => {
                a1 == a2 && b1 == b2
            }
            (Value::Matrix(x), Value::Matrix(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
                x.len() == y.len()
                    && x.iter()
                        .zip(y.iter())
                        .all(|(l, r)| l.resolve_value().loose_eq(&r.resolve_value()))
            }
            (Value::LinkedList(x), Value::LinkedList(y)) => {
                x.len() == y.len()
                    && x.iter()
                        .zip(y.iter())
                        .all(|(l, r)| l.resolve_value().loose_eq(&r.resolve_value()))
            }
            (Value::Set(x), Value::Set(y)) => {
                x.len() == y.len() && x.keys().zip(y.keys()).all(|(l, r)| l == r)
            }
            (Value::HashSet(x), Value::HashSet(y)) => {
                x.len() == y.len() && x.keys().all(|k| y.contains_key(k))
            }
            (Value::Dict(x), Value::Dict(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(k, (_, v))| {
                        y.get(k)
                            .is_some_and(|(_, w)| v.resolve_value().loose_eq(&w.resolve_value()))
                    })
            }
            (Value::Instance(x), Value::Instance(y)) => Arc::ptr_eq(x, y),
            (Value::Lambda(x), Value::Lambda(y)) => x.body == y.body,
            (Value::Ident(x), Value::Ident(y)) => x == y,
            _ => false,
        }
    }

    /// Ordering across comparable variants; `None` when incomparable.
    pub fn loose_cmp(&self, other: &Value) -> Option<Ordering> {
        let a = self.resolve();
        let b = other.resolve();
        match (&a, &b) {
            (Value::Num(x), Value::Num(y)) => x.partial_cmp(y),
            (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
            (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
            (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
            (Value::Matrix(x), Value::Matrix(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
                for (l, r) in x.iter().zip(y.iter()) {
                    match l.resolve_value().loose_cmp(&r.resolve_value()) {
                        Some(Ordering::Equal) => continue,
                        other => return other,
                    }
                }
                Some(x.len().cmp(&y.len()))
            }
            _ => None,
        }
    }

    /// Key used by Set/HashSet/Dict storage: ordered numerically for
    /// numbers, lexically for text, by rendering otherwise.
    pub fn sort_key(&self) -> SortKey {
        match self.resolve() {
            Value::Num(n) => {
                if n.is_undefined() {
                    SortKey::Other("undefined".into())
                } else if n.is_zero() {
                    SortKey::Num {
                        neg: false,
                        highest: i64::MIN,
                        digits: String::new(),
                    }
                } else {
                    SortKey::Num {
                        neg: n.is_negative(),
                        highest: n.highest_digit(),
                        digits: n.mantissa_digits(),
                    }
                }
            }
            Value::Bool(b) => SortKey::Bool(b),
            Value::Text(s) => SortKey::Text(s),
            other => SortKey::Other(other.repr()),
        }
    }

    /// Top-level rendering: text is unquoted.
    pub fn display(&self) -> String {
        match self.resolve() {
            Value::Text(s) => s,
            other => other.repr(),
        }
    }

    /// Nested rendering: text is quoted, collections recurse.
    pub fn repr(&self) -> String {
        match self.resolve() {
            Value::Num(n) => n.to_output_string(),
            Value::Text(s) => format!("{:?}", s),
            Value::Bool(b) => b.to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::Complex { re, im } => {
                if im < 0.0 {
                    format!("{}-{}i", re, -im)
                } else {
                    format!("{}+{}i", re, im)
                }
            }
            Value::Matrix(items) => format!("[{}]", join_refs(&items)),
            Value::Tuple(items) => format!("({})", join_refs(&items)),
            Value::LinkedList(items) => {
                let parts: Vec<String> =
                    items.iter().map(|r| r.resolve_value().repr()).collect();
                format!("linkedlist([{}])", parts.join(", "))
            }
            Value::Set(items) => {
                let parts: Vec<String> = items
                    .values()
                    .map(|r| r.resolve_value().repr())
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::HashSet(items) => {
                let parts: Vec<String> = items
                    .values()
                    .map(|r| r.resolve_value().repr())
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Dict(items) => {
                let parts: Vec<String> = items
                    .values()
                    .map(|(k, v)| {
                        format!("{}: {}", k.resolve_value().repr(), v.resolve_value().repr())
                    })
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Lambda(l) => l.render(),
            Value::Instance(inst) => {
                let inner = inst.read();
                format!("<instance of {}>", inner.class_name)
            }
            Value::Ref(r) => r.resolve_value().repr(),
            Value::Ident(name) => name,
            Value::Sys(SysMsg::Defer) => "<defer>".into(),
        }
    }
}

fn join_refs(items: &[Reference]) -> String {
    let parts: Vec<String> = items.iter().map(|r| r.resolve_value().repr()).collect();
    parts.join(", ")
}

/// Collection key with total order: booleans, then numbers (numeric
/// order), then text (lexical), then everything else by rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SortKey {
    Bool(bool),
    Num {
        neg: bool,
        highest: i64,
        digits: String,
    },
    Text(String),
    Other(String),
}

impl SortKey {
    fn rank(&self) -> u8 {
        match self {
            SortKey::Bool(_) => 0,
            SortKey::Num { .. } => 1,
            SortKey::Text(_) => 2,
            SortKey::Other(_) => 3,
        }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Bool(a), SortKey::Bool(b)) => a.cmp(b),
            (
                SortKey::Num {
                    neg: n1,
                    highest: h1,
                    digits: d1,
                },
                SortKey::Num {
                    neg: n2,
                    highest: h2,
                    digits: d2,
                },
            ) => {
                if n1 != n2 {
                    // Negatives order before positives.
                    return if *n1 { Ordering::Less } else { Ordering::Greater };
                }
                let magnitude = h1.cmp(h2).then_with(|| d1.cmp(d2));
                if *n1 {
                    magnitude.reverse()
                } else {
                    magnitude
                }
            }
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            (SortKey::Other(a), SortKey::Other(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(s: &str) -> Value {
        Value::Num(BigDec::parse(s, false).unwrap())
    }

    #[test]
    fn references_alias_cells() {
        let cell = Reference::new(num("1"));
        let alias = cell.clone();
        alias.set(num("2"));
        assert!(cell.get().loose_eq(&num("2")));
    }

    #[test]
    fn deep_copy_detaches_cells() {
        let cell = Reference::new(num("1"));
        let copy = cell.deep_copy();
        copy.set(num("9"));
        assert!(cell.get().loose_eq(&num("1")));
    }

    #[test]
    fn reference_chains_collapse() {
        let inner = Reference::new(num("7"));
        let outer = Reference::new(Value::Ref(inner.clone()));
        assert!(outer.resolve_value().loose_eq(&num("7")));
        assert!(outer.resolve_cell().ptr_eq(&inner));
    }

    #[test]
    fn matrix_deep_copy_is_structural() {
        let m = Value::Matrix(vec![Reference::new(num("1")), Reference::new(num("2"))]);
        let c = m.deep_copy();
        if let (Value::Matrix(a), Value::Matrix(b)) = (&m, &c) {
            a[0].set(num("5"));
            assert!(b[0].get().loose_eq(&num("1")));
        } else {
            panic!("expected matrices");
        }
    }

    #[test]
    fn sort_keys_order_numbers_numerically() {
        let k2 = num("2").sort_key();
        let k10 = num("10").sort_key();
        let kneg = num("-3").sort_key();
        assert!(k2 < k10);
        assert!(kneg < k2);
        assert!(num("3.49").sort_key() < num("3.5").sort_key());
    }

    #[test]
    fn display_nests_with_quotes() {
        let m = Value::Matrix(vec![
            Reference::new(Value::Text("a".into())),
            Reference::new(num("2")),
        ]);
        assert_eq!(m.display(), "[\"a\", 2]");
        assert_eq!(Value::Text("plain".into()).display(), "plain");
    }
}
