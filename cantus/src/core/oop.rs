/// User-defined callables and classes.
///
/// Function and class bodies are kept as source text and re-run by the
/// statement engine inside a sub-scope at call time; a lambda is the same
/// thing without a name, capturing its declaring scope by path.
use crate::core::value::Value;
use crate::scope::{Environment, Variable};
use indexmap::IndexMap;
use std::collections::HashSet;

/// Sentinel-aware default list: `None` marks a required argument.
pub type Defaults = Vec<Option<Value>>;

#[derive(Debug, Clone)]
pub struct UserFunction {
    pub name: String,
    pub body: String,
    pub arg_names: Vec<String>,
    pub defaults: Defaults,
    pub modifiers: HashSet<String>,
    pub return_type: Option<String>,
    pub declaring_scope: String,
}

impl UserFunction {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.declaring_scope, self.name)
    }

    /// Longest all-required prefix of the default list.
    pub fn required_args(&self) -> usize {
        self.defaults
            .iter()
            .take_while(|d| d.is_none())
            .count()
    }

    pub fn is_private(&self) -> bool {
        self.modifiers.contains("private")
    }

    pub fn is_internal(&self) -> bool {
        self.modifiers.contains("internal")
    }

    /// Signature as written: `name(a, b, c)`.
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.arg_names.join(", "))
    }
}

#[derive(Debug, Clone)]
pub struct Lambda {
    pub arg_names: Vec<String>,
    pub body: String,
    /// Scope path captured at the point of definition.
    pub captured_scope: String,
    /// Multi-line `=>` form; the body is a script, not an expression.
    pub is_block: bool,
}

impl Lambda {
    pub fn expression(arg_names: Vec<String>, body: impl Into<String>, scope: &str) -> Self {
        Lambda {
            arg_names,
            body: body.into(),
            captured_scope: scope.to_string(),
            is_block: false,
        }
    }

    pub fn block(arg_names: Vec<String>, body: impl Into<String>, scope: &str) -> Self {
        Lambda {
            arg_names,
            body: body.into(),
            captured_scope: scope.to_string(),
            is_block: true,
        }
    }

    /// Source rendering; expression lambdas reload from this spelling.
    pub fn render(&self) -> String {
        let args = if self.arg_names.len() == 1 {
            self.arg_names[0].clone()
        } else {
            format!("({})", self.arg_names.join(", "))
        };
        if self.is_block {
            format!("{} =>\n{}", args, self.body)
        } else {
            format!("`{} => {}`", args, self.body)
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserClass {
    pub name: String,
    pub body: String,
    pub modifiers: HashSet<String>,
    /// Full names of base classes, leftmost first.
    pub base_classes: Vec<String>,
    /// Instance fields declared by this class (not its bases).
    pub fields: IndexMap<String, Variable>,
    pub declaring_scope: String,
    pub inner_scope: String,
}

impl UserClass {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.declaring_scope, self.name)
    }

    pub fn is_internal(&self) -> bool {
        self.modifiers.contains("internal")
    }

    /// Fields of this class and every base, depth-first over
    /// `base_classes` with the leftmost base winning ties; this class's
    /// own fields overlay last.
    pub fn all_fields(&self, env: &Environment) -> IndexMap<String, Variable> {
        let mut out: IndexMap<String, Variable> = IndexMap::new();
        for base in &self.base_classes {
            if let Some(base_class) = env.class(base) {
                for (name, var) in base_class.all_fields(env) {
                    out.entry(name).or_insert(var);
                }
            }
        }
        for (name, var) in &self.fields {
            out.insert(name.clone(), var.clone());
        }
        out
    }

    /// Every class answers `init` (synthesized when absent) and `type`.
    pub fn has_default_init(&self) -> bool {
        !self.fields.contains_key("init")
    }
}

#[derive(Debug, Clone)]
pub struct ClassInstance {
    /// Full name of the defining class.
    pub class_name: String,
    pub fields: IndexMap<String, crate::core::value::Reference>,
    pub inner_scope: String,
}

impl ClassInstance {
    /// Field lookup: own fields first, then the class hierarchy.
    pub fn field(&self, name: &str, env: &Environment) -> Option<crate::core::value::Reference> {
        if let Some(r) = self.fields.get(name) {
            return Some(r.clone());
        }
        let class = env.class(&self.class_name)?;
        class.all_fields(env).get(name).map(|v| v.reference.clone())
    }

    pub fn short_class_name(&self) -> String {
        self.class_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.class_name)
            .to_string()
    }
}
