/// Cantus — embeddable interpreter for a math-oriented scripting language.
///
/// Module layout:
///   - bigdec     — arbitrary-precision decimal with sig-fig tracking
///   - core       — value variants (Value, Reference) and OOP types
///   - scope      — scope-path algebra and the environment tables
///   - operators  — operator catalog, precedence order, executors
///   - tokenizer  — expression → token list, identifier resolution
///   - resolver   — precedence sweep over the token list
///   - statements — indentation blocks and the statement result protocol
///   - intrinsics — built-in function registry
///   - evaluator  — embedded API façade, modes, events, serialization
///   - threads    — worker registry, cancel tokens, script feeder
///   - loader     — `.can` file loading and startup scan
///   - errors     — error kinds with line tagging

pub mod bigdec;
pub mod core;
pub mod errors;
pub mod evaluator;
pub mod intrinsics;
pub mod loader;
pub mod operators;
pub mod resolver;
pub mod scope;
pub mod statements;
pub mod threads;
pub mod tokenizer;

// ── Re-exports for convenience ──────────────────────────────────────────
pub use crate::core::value::{Reference, Value};
pub use bigdec::BigDec;
pub use errors::{CantusError, ErrorKind, EvalResult};
pub use evaluator::{AngleMode, EvalComplete, Evaluator, Modes, OutputFormat};
pub use scope::{Environment, ROOT_SCOPE};
pub use statements::{Code, StatementResult};
pub use threads::{CancelToken, ScriptFeeder};
