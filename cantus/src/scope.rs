/// Scope paths and the evaluator environment.
///
/// A scope is a `.`-separated path rooted at `cantus`. The environment
/// owns the three tables (variables, user functions, user classes) keyed
/// by full name, shared by every worker of an evaluator.
use crate::core::oop::{UserClass, UserFunction};
use crate::core::value::{Reference, Value};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;

pub const ROOT_SCOPE: &str = "cantus";

// ── Scope-path algebra ──────────────────────────────────────────────────

pub fn base_scope(scope: &str) -> &str {
    scope.split('.').next().unwrap_or(scope)
}

pub fn parent_scope(scope: &str) -> Option<&str> {
    scope.rfind('.').map(|i| &scope[..i])
}

/// `a` is a parent of `b` (a scope is its own parent).
pub fn is_parent(a: &str, b: &str) -> bool {
    b == a || (b.len() > a.len() && b.starts_with(a) && b.as_bytes()[a.len()] == b'.')
}

/// Scopes are external when their base components differ.
pub fn is_external(a: &str, b: &str) -> bool {
    base_scope(a) != base_scope(b)
}

/// Strip the portion of `name` that duplicates a suffix of `scope`.
pub fn remove_redundant_scope(name: &str, scope: &str) -> String {
    let parts: Vec<&str> = scope.split('.').collect();
    for k in 0..parts.len() {
        let candidate = parts[k..].join(".");
        if name == candidate {
            return String::new();
        }
        if name.len() > candidate.len()
            && name.starts_with(&candidate)
            && name.as_bytes()[candidate.len()] == b'.'
        {
            return name[candidate.len() + 1..].to_string();
        }
    }
    name.to_string()
}

/// Join `scope` and `name`, removing any duplicated prefix first.
pub fn combine(scope: &str, name: &str) -> String {
    let stripped = remove_redundant_scope(name, scope);
    if stripped.is_empty() {
        scope.to_string()
    } else if scope.is_empty() {
        stripped
    } else {
        format!("{}.{}", scope, stripped)
    }
}

/// Move all but the last component of a dotted name into the scope.
pub fn normalize_name(name: &str, scope: &str) -> (String, String) {
    match name.rfind('.') {
        Some(i) => {
            let prefix = &name[..i];
            let last = &name[i + 1..];
            (last.to_string(), combine(scope, prefix))
        }
        None => (name.to_string(), scope.to_string()),
    }
}

// ── Variables ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub reference: Reference,
    pub declaring_scope: String,
    pub modifiers: HashSet<String>,
}

impl Variable {
    pub fn new(name: &str, value: Value, scope: &str) -> Self {
        Variable {
            name: name.to_string(),
            reference: Reference::new(value),
            declaring_scope: scope.to_string(),
            modifiers: HashSet::new(),
        }
    }

    pub fn with_modifiers(mut self, modifiers: HashSet<String>) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.declaring_scope, self.name)
    }

    pub fn is_private(&self) -> bool {
        self.modifiers.contains("private")
    }

    pub fn is_internal(&self) -> bool {
        self.modifiers.contains("internal")
    }

    pub fn is_global(&self) -> bool {
        self.modifiers.contains("global")
    }
}

// ── Environment ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Environment {
    vars: DashMap<String, Variable>,
    funcs: DashMap<String, UserFunction>,
    classes: DashMap<String, UserClass>,
    imports: RwLock<Vec<String>>,
    /// Inner scopes of declared classes; implicit declaration is rejected
    /// inside these.
    class_scopes: DashMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            vars: DashMap::new(),
            funcs: DashMap::new(),
            classes: DashMap::new(),
            imports: RwLock::new(vec![ROOT_SCOPE.to_string()]),
            class_scopes: DashMap::new(),
        }
    }

    // ── Imports ─────────────────────────────────────────────────────

    pub fn import(&self, scope: &str) {
        let mut imports = self.imports.write();
        if !imports.iter().any(|s| s == scope) {
            imports.push(scope.to_string());
        }
    }

    pub fn unimport(&self, scope: &str) {
        self.imports.write().retain(|s| s != scope);
    }

    pub fn imports(&self) -> Vec<String> {
        self.imports.read().clone()
    }

    pub fn reset_imports(&self) {
        *self.imports.write() = vec![ROOT_SCOPE.to_string()];
    }

    // ── Raw table access ────────────────────────────────────────────

    pub fn var(&self, full: &str) -> Option<Variable> {
        self.vars.get(full).map(|v| v.clone())
    }

    pub fn func(&self, full: &str) -> Option<UserFunction> {
        self.funcs.get(full).map(|f| f.clone())
    }

    pub fn class(&self, full: &str) -> Option<UserClass> {
        self.classes.get(full).map(|c| c.clone())
    }

    pub fn put_var(&self, var: Variable) {
        self.vars.insert(var.full_name(), var);
    }

    pub fn put_func(&self, func: UserFunction) {
        self.funcs.insert(func.full_name(), func);
    }

    pub fn put_class(&self, class: UserClass) {
        self.class_scopes
            .insert(class.inner_scope.clone(), class.full_name());
        self.classes.insert(class.full_name(), class);
    }

    pub fn remove_var(&self, full: &str) -> Option<Variable> {
        self.vars.remove(full).map(|(_, v)| v)
    }

    pub fn all_vars(&self) -> Vec<Variable> {
        self.vars.iter().map(|e| e.value().clone()).collect()
    }

    pub fn all_funcs(&self) -> Vec<UserFunction> {
        self.funcs.iter().map(|e| e.value().clone()).collect()
    }

    pub fn all_classes(&self) -> Vec<UserClass> {
        self.classes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn clear_vars(&self) {
        self.vars.clear();
    }

    pub fn clear_all(&self) {
        self.vars.clear();
        self.funcs.clear();
        self.classes.clear();
        self.class_scopes.clear();
        self.reset_imports();
    }

    pub fn is_class_scope(&self, scope: &str) -> bool {
        self.class_scopes.contains_key(scope)
    }

    /// The class whose inner scope this is, if any.
    pub fn class_of_scope(&self, scope: &str) -> Option<UserClass> {
        let full = self.class_scopes.get(scope).map(|c| c.clone())?;
        self.class(&full)
    }

    // ── Lookup protocol ─────────────────────────────────────────────

    /// Scopes visible from `scope`: itself, its parents, then imports.
    pub fn accessible_scopes(&self, scope: &str) -> Vec<String> {
        let mut out = vec![scope.to_string()];
        let mut cur = scope;
        while let Some(parent) = parent_scope(cur) {
            out.push(parent.to_string());
            cur = parent;
        }
        for import in self.imports() {
            if !out.iter().any(|s| *s == import) {
                out.push(import);
            }
        }
        out
    }

    fn visible_from(&self, declaring_scope: &str, modifiers: &HashSet<String>, from: &str) -> bool {
        !modifiers.contains("private") || is_parent(from, declaring_scope)
    }

    /// Find a variable by the §4.3 protocol. Returns the binding's
    /// reference, or a field reference when a dotted prefix names a class
    /// instance.
    pub fn find_var(&self, name: &str, scope: &str) -> Option<Reference> {
        if let Some(v) = self.var(name) {
            if self.visible_from(&v.declaring_scope, &v.modifiers, scope) {
                return Some(v.reference.clone());
            }
        }
        for acc in self.accessible_scopes(scope) {
            let key = combine(&acc, name);
            if let Some(v) = self.var(&key) {
                if self.visible_from(&v.declaring_scope, &v.modifiers, scope) {
                    return Some(v.reference.clone());
                }
            }
            if name.contains('.') {
                if let Some(r) = self.instance_prefix_walk(name, &acc, scope) {
                    return Some(r);
                }
            }
        }
        None
    }

    /// Strip components off the right of `name`; when some prefix names a
    /// ClassInstance variable, resolve the remainder as a field walk.
    fn instance_prefix_walk(&self, name: &str, acc: &str, from: &str) -> Option<Reference> {
        let mut prefix = name;
        while let Some(i) = prefix.rfind('.') {
            prefix = &prefix[..i];
            let rest = &name[i + 1..];
            let key = combine(acc, prefix);
            if let Some(v) = self.var(&key) {
                if !self.visible_from(&v.declaring_scope, &v.modifiers, from) {
                    continue;
                }
                if let Value::Instance(_) = v.reference.resolve_value() {
                    return self.field_walk(&v.reference, rest);
                }
            }
        }
        None
    }

    /// Walk `a.b.c` field components starting at an instance reference.
    pub fn field_walk(&self, start: &Reference, path: &str) -> Option<Reference> {
        let mut current = start.clone();
        for component in path.split('.') {
            let inst = match current.resolve_value() {
                Value::Instance(inst) => inst,
                _ => return None,
            };
            let field = inst.read().field(component, self)?;
            current = field;
        }
        Some(current)
    }

    /// Declare a variable in `scope`, implicitly or explicitly.
    pub fn declare_var(
        &self,
        name: &str,
        value: Value,
        scope: &str,
        modifiers: HashSet<String>,
    ) -> Variable {
        let (name, scope) = normalize_name(name, scope);
        let var = Variable::new(&name, value, &scope).with_modifiers(modifiers);
        self.put_var(var.clone());
        var
    }

    /// Find a user function by the accessible-scope walk.
    pub fn find_func(&self, name: &str, scope: &str) -> Option<UserFunction> {
        if let Some(f) = self.func(name) {
            if self.visible_from(&f.declaring_scope, &f.modifiers, scope) {
                return Some(f);
            }
        }
        for acc in self.accessible_scopes(scope) {
            let key = combine(&acc, name);
            if let Some(f) = self.func(&key) {
                if self.visible_from(&f.declaring_scope, &f.modifiers, scope) {
                    return Some(f);
                }
            }
        }
        None
    }

    /// Find a user class by the accessible-scope walk.
    pub fn find_class(&self, name: &str, scope: &str) -> Option<UserClass> {
        if let Some(c) = self.class(name) {
            if self.visible_from(&c.declaring_scope, &c.modifiers, scope) {
                return Some(c);
            }
        }
        for acc in self.accessible_scopes(scope) {
            let key = combine(&acc, name);
            if let Some(c) = self.class(&key) {
                if self.visible_from(&c.declaring_scope, &c.modifiers, scope) {
                    return Some(c);
                }
            }
        }
        None
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bigdec::BigDec;

    fn num(v: i64) -> Value {
        Value::Num(BigDec::from_i64(v))
    }

    #[test]
    fn scope_algebra_round_trips() {
        assert_eq!(combine("cantus", "x"), "cantus.x");
        assert_eq!(combine("cantus", "cantus.x"), "cantus.x");
        assert_eq!(remove_redundant_scope("cantus.x", "cantus"), "x");
        assert_eq!(remove_redundant_scope("a.b", "cantus.a"), "b");
        let (name, scope) = normalize_name("a.b.c", "cantus");
        assert_eq!(name, "c");
        assert_eq!(scope, "cantus.a.b");
        assert_eq!(combine(&scope, &name), "cantus.a.b.c");
    }

    #[test]
    fn parent_and_external_checks() {
        assert!(is_parent("cantus", "cantus.f"));
        assert!(is_parent("cantus", "cantus"));
        assert!(!is_parent("cantus.f", "cantus"));
        assert!(!is_parent("can", "cantus"));
        assert!(is_external("cantus.a", "other.b"));
        assert!(!is_external("cantus.a", "cantus.b"));
    }

    #[test]
    fn lookup_walks_parents_then_imports() {
        let env = Environment::new();
        env.declare_var("x", num(1), "cantus", HashSet::new());
        assert!(env.find_var("x", "cantus.inner.deep").is_some());
        env.declare_var("y", num(2), "lib", HashSet::new());
        assert!(env.find_var("y", "cantus").is_none());
        env.import("lib");
        assert!(env.find_var("y", "cantus").is_some());
    }

    #[test]
    fn private_bindings_hide_from_siblings() {
        let env = Environment::new();
        let mods: HashSet<String> = ["private".to_string()].into_iter().collect();
        env.declare_var("secret", num(5), "cantus.f", mods);
        assert!(env.find_var("secret", "cantus.f").is_some());
        assert!(env.find_var("f.secret", "cantus").is_some());
        assert!(env.find_var("f.secret", "cantus.g").is_none());
    }

    #[test]
    fn shadowing_prefers_nearest_scope() {
        let env = Environment::new();
        env.declare_var("x", num(1), "cantus", HashSet::new());
        env.declare_var("x", num(2), "cantus.inner", HashSet::new());
        let r = env.find_var("x", "cantus.inner").unwrap();
        assert!(r.get().loose_eq(&num(2)));
        let r = env.find_var("x", "cantus").unwrap();
        assert!(r.get().loose_eq(&num(1)));
    }
}
