/// Cantus error types.
///
/// Three user-visible kinds (math, syntax, evaluator) plus a cancellation
/// signal that is not an error in the `try`/`catch` sense. Every error can
/// carry a 1-based line number; the statement engine tags untagged errors
/// with the line it was executing when the error surfaced.
use std::fmt;
use thiserror::Error;

pub type EvalResult<T> = Result<T, CantusError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    // ── Math ────────────────────────────────────────────────────────────
    #[error("math error: division by zero")]
    DivisionByZero,
    #[error("math error: overflow in {0}")]
    Overflow(String),
    #[error("math error: {0} out of domain")]
    Domain(String),
    #[error("math error: {0}")]
    Math(String),

    // ── Syntax ──────────────────────────────────────────────────────────
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("syntax error: mismatched bracket '{0}'")]
    BracketMismatch(String),
    #[error("syntax error: named parameters must come after unnamed parameters")]
    NamedParameterOrder,
    #[error("syntax error: '{0}' is not valid outside a loop")]
    NotInLoop(String),
    #[error("syntax error: unexpected indent")]
    BadIndent,
    #[error("syntax error: '{0}' must follow a matching statement")]
    BadChain(String),

    // ── Evaluator ───────────────────────────────────────────────────────
    #[error("variable '{0}' is undefined")]
    UndefinedVariable(String),
    #[error("function or class '{0}' is undefined")]
    UndefinedFunction(String),
    #[error("'{name}' takes {min} to {max} arguments ({got} given)")]
    Arity {
        name: String,
        min: usize,
        max: usize,
        got: usize,
    },
    #[error("expected {expected}, got {found}")]
    TypeExpected { expected: String, found: String },
    #[error("{0}")]
    Evaluator(String),

    // ── Control ─────────────────────────────────────────────────────────
    #[error("evaluation cancelled")]
    Cancelled,
}

impl ErrorKind {
    pub fn is_math(&self) -> bool {
        matches!(
            self,
            Self::DivisionByZero | Self::Overflow(_) | Self::Domain(_) | Self::Math(_)
        )
    }

    pub fn is_syntax(&self) -> bool {
        matches!(
            self,
            Self::Syntax(_)
                | Self::BracketMismatch(_)
                | Self::NamedParameterOrder
                | Self::NotInLoop(_)
                | Self::BadIndent
                | Self::BadChain(_)
        )
    }
}

/// An error with position context. `line == 0` means "not yet tagged".
#[derive(Debug, Clone, PartialEq)]
pub struct CantusError {
    pub kind: ErrorKind,
    pub line: usize,
    /// Call trail entries, innermost first: `in f (scope.f1), line 3`.
    pub trail: Vec<String>,
}

impl CantusError {
    pub fn new(kind: ErrorKind) -> Self {
        CantusError {
            kind,
            line: 0,
            trail: Vec::new(),
        }
    }

    pub fn at_line(kind: ErrorKind, line: usize) -> Self {
        CantusError {
            kind,
            line,
            trail: Vec::new(),
        }
    }

    /// Tag with a line number unless one is already recorded.
    pub fn or_line(mut self, line: usize) -> Self {
        if self.line == 0 {
            self.line = line;
        }
        self
    }

    /// Append a user-function trail entry, preserving the original line.
    pub fn in_function(mut self, name: &str, scope: &str, line: usize) -> Self {
        self.trail
            .push(format!("in {} ({}), line {}", name, scope, line));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn evaluator(msg: impl Into<String>) -> Self {
        CantusError::new(ErrorKind::Evaluator(msg.into()))
    }

    pub fn syntax(msg: impl Into<String>) -> Self {
        CantusError::new(ErrorKind::Syntax(msg.into()))
    }

    pub fn math(msg: impl Into<String>) -> Self {
        CantusError::new(ErrorKind::Math(msg.into()))
    }
}

impl fmt::Display for CantusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for entry in &self.trail {
            write!(f, " [{}]", entry)?;
        }
        if self.line > 0 {
            write!(f, " (line {})", self.line)?;
        }
        Ok(())
    }
}

impl std::error::Error for CantusError {}

impl From<ErrorKind> for CantusError {
    fn from(kind: ErrorKind) -> Self {
        CantusError::new(kind)
    }
}
