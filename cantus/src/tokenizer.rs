/// Expression tokenizer.
///
/// Scans an expression left to right, trying the longest registered
/// operator sign at every position. The text between operator signs is an
/// object segment: a literal, or an identifier resolved on the spot
/// through the `NameContext` seam (variable lookup, assignment target
/// creation, call dispatch). Brackets recurse: the inner text is evaluated
/// and the result spliced into the token list, with the default operator
/// when the left operand slot is already filled (implicit multiplication).
use crate::bigdec::BigDec;
use crate::core::oop::Lambda;
use crate::core::value::{Reference, SortKey, Value};
use crate::errors::{CantusError, ErrorKind, EvalResult};
use crate::operators::{OpId, OperatorTable, BRACKETS};
use indexmap::IndexMap;
use std::collections::BTreeMap;

/// Identifier resolution as seen from the tokenizer. The evaluator
/// implements this; tokenizer tests use a stub.
pub trait NameContext {
    fn scope(&self) -> &str;
    fn significant_mode(&self) -> bool;
    fn condition_mode(&self) -> bool;
    /// Whether a bare name is currently bound (variable or constant).
    fn is_known(&self, name: &str) -> bool;
    /// Look up a name for value use; may implicitly declare.
    fn variable(&mut self, name: &str) -> EvalResult<Value>;
    /// Look up or create a reference for an assignment target.
    fn assign_target(&mut self, name: &str) -> EvalResult<Value>;
    /// Resolve a call target and invoke it with raw argument text.
    fn call(&mut self, name: &str, args_src: &str, receiver: Option<Value>)
        -> EvalResult<Value>;
    /// Evaluate a nested expression (bracket interiors, literal elements).
    fn eval_sub(&mut self, expr: &str, condition: bool) -> EvalResult<Value>;
}

/// One slot of the token list: the operator before an object, then the
/// object itself. The leading slot carries no operator.
#[derive(Debug, Clone)]
pub struct Token {
    pub op: Option<OpId>,
    pub obj: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenList {
    pub tokens: Vec<Token>,
}

impl TokenList {
    fn new() -> Self {
        TokenList {
            tokens: vec![Token { op: None, obj: None }],
        }
    }

    pub fn object_count(&self) -> usize {
        self.tokens.iter().filter(|t| t.obj.is_some()).count()
    }

    fn push_object(&mut self, value: Value) {
        let default = OperatorTable::global().default_op;
        let last = self.tokens.last_mut().expect("token list is never empty");
        if last.obj.is_none() {
            last.obj = Some(value);
        } else {
            self.tokens.push(Token {
                op: Some(default),
                obj: Some(value),
            });
        }
    }

    fn push_operator(&mut self, id: OpId) {
        self.tokens.push(Token { op: Some(id), obj: None });
    }

    /// Take the trailing object for use as a self-referring receiver.
    fn take_last_object(&mut self) -> Option<Value> {
        self.tokens.last_mut().and_then(|t| t.obj.take())
    }
}

pub fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

fn is_word_sign(sign: &str) -> bool {
    sign.chars().next().is_some_and(|c| c.is_alphanumeric())
}

/// Tokenize a full expression.
pub fn tokenize(expr: &str, ctx: &mut dyn NameContext) -> EvalResult<TokenList> {
    // A top-level `=>` makes the tail a lambda body; the head re-enters.
    if let Some((prefix, lambda)) = extract_arrow_lambda(expr, ctx.scope()) {
        let mut list = tokenize(&prefix, ctx)?;
        list.push_object(Value::Lambda(lambda));
        return Ok(list);
    }

    let table = OperatorTable::global();
    let chars: Vec<char> = expr.chars().collect();
    let mut list = TokenList::new();
    let mut i = 0usize;
    let mut seg_start = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' || c == '`' {
            i = skip_quoted(&chars, i, c)?;
            continue;
        }
        // Signs inside scientific-notation literals are part of the number.
        if (c == '+' || c == '-') && is_exponent_sign(&chars, i) {
            i += 1;
            continue;
        }
        let mut matched = None;
        for len in (1..=table.max_sign_len.min(chars.len() - i)).rev() {
            let sign: String = chars[i..i + len].iter().collect();
            if let Some(bracket) = OperatorTable::is_bracket_open(&sign) {
                matched = Some(Matched::Bracket(bracket, len));
                break;
            }
            if let Some(id) = table.find_sign(&sign, ctx.condition_mode()) {
                if is_word_sign(&sign) {
                    let before_ok = i == 0 || !is_identifier_char(chars[i - 1]);
                    let after_ok =
                        i + len == chars.len() || !is_identifier_char(chars[i + len]);
                    if !before_ok || !after_ok {
                        continue;
                    }
                }
                matched = Some(Matched::Op(id, len));
                break;
            }
        }
        match matched {
            Some(Matched::Op(id, len)) => {
                let segment: String = chars[seg_start..i].iter().collect();
                process_segment(segment.trim(), Some(id), &mut list, ctx)?;
                list.push_operator(id);
                i += len;
                seg_start = i;
            }
            Some(Matched::Bracket(bracket, len)) => {
                let close = find_matching_close(&chars, i + len, bracket)?;
                let inner: String = chars[i + len..close].iter().collect();
                let segment: String = chars[seg_start..i].iter().collect();
                handle_bracket(segment.trim(), bracket.open, &inner, &mut list, ctx)?;
                i = close + bracket.close.len();
                seg_start = i;
            }
            None => {
                i += 1;
            }
        }
    }
    let segment: String = chars[seg_start..].iter().collect();
    process_segment(segment.trim(), None, &mut list, ctx)?;
    Ok(list)
}

enum Matched {
    Op(OpId, usize),
    Bracket(crate::operators::Bracket, usize),
}

fn is_exponent_sign(chars: &[char], i: usize) -> bool {
    i >= 2
        && (chars[i - 1] == 'e' || chars[i - 1] == 'E')
        && chars[i - 2].is_ascii_digit()
        && i + 1 < chars.len()
        && chars[i + 1].is_ascii_digit()
}

fn skip_quoted(chars: &[char], start: usize, quote: char) -> EvalResult<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            return Ok(i + 1);
        }
        i += 1;
    }
    Err(CantusError::syntax(format!("unterminated {} string", quote)))
}

/// Locate the close sign for a bracket opened just before `from`, with
/// registry-aware nesting and quote skipping.
fn find_matching_close(
    chars: &[char],
    from: usize,
    bracket: crate::operators::Bracket,
) -> EvalResult<usize> {
    let mut depth_stack: Vec<crate::operators::Bracket> = vec![bracket];
    let mut i = from;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' || c == '`' {
            i = skip_quoted(chars, i, c)?;
            continue;
        }
        let s = c.to_string();
        if let Some(inner) = BRACKETS.iter().find(|b| b.open == s) {
            depth_stack.push(*inner);
        } else if let Some(top) = depth_stack.last() {
            if top.close == s {
                depth_stack.pop();
                if depth_stack.is_empty() {
                    return Ok(i);
                }
            } else if BRACKETS.iter().any(|b| b.close == s) {
                return Err(CantusError::new(ErrorKind::BracketMismatch(s)));
            }
        }
        i += 1;
    }
    Err(CantusError::new(ErrorKind::BracketMismatch(
        bracket.open.to_string(),
    )))
}

/// Split text on a top-level delimiter, respecting brackets and quotes.
pub fn split_top_level(text: &str, delim: char) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' || c == '`' {
            match skip_quoted(&chars, i, c) {
                Ok(next) => {
                    i = next;
                    continue;
                }
                Err(_) => break,
            }
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ if c == delim && depth == 0 => {
                parts.push(chars[start..i].iter().collect());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(chars[start..].iter().collect());
    parts
}

/// Find a top-level `needle` (used for `=>` and `:=` detection).
pub fn find_top_level(text: &str, needle: &str) -> Option<usize> {
    let chars: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = needle.chars().collect();
    let mut depth = 0i32;
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' || c == '`' {
            match skip_quoted(&chars, i, c) {
                Ok(next) => {
                    i = next;
                    continue;
                }
                Err(_) => return None,
            }
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
        if depth == 0 && chars[i..].starts_with(&pattern[..]) {
            // `>=` must not read as an arrow start.
            if needle == "=>" && i > 0 && (chars[i - 1] == '>' || chars[i - 1] == '<') {
                i += 1;
                continue;
            }
            return Some(chars[..i].iter().map(|c| c.len_utf8()).sum());
        }
        i += 1;
    }
    None
}

/// Recognize `args => body` and package the tail as a lambda.
fn extract_arrow_lambda(expr: &str, scope: &str) -> Option<(String, Lambda)> {
    let at = find_top_level(expr, "=>")?;
    let head = &expr[..at];
    let body = expr[at + 2..].trim();
    if body.is_empty() {
        return None;
    }
    let head_trim = head.trim_end();
    let (prefix, args) = if head_trim.ends_with(')') {
        let open = head_trim.rfind('(')?;
        let inner = &head_trim[open + 1..head_trim.len() - 1];
        (&head_trim[..open], parse_arg_names(inner))
    } else {
        let cut = head_trim
            .rfind(|c: char| !is_identifier_char(c))
            .map(|p| p + 1)
            .unwrap_or(0);
        let name = head_trim[cut..].trim();
        let args = if name.is_empty() {
            Vec::new()
        } else {
            vec![name.to_string()]
        };
        (&head_trim[..cut], args)
    };
    let lambda = if body.contains('\n') {
        Lambda::block(args, body, scope)
    } else {
        Lambda::expression(args, body, scope)
    };
    Some((prefix.to_string(), lambda))
}

fn parse_arg_names(inner: &str) -> Vec<String> {
    inner
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ── Object segments ─────────────────────────────────────────────────────

fn process_segment(
    segment: &str,
    next_op: Option<OpId>,
    list: &mut TokenList,
    ctx: &mut dyn NameContext,
) -> EvalResult<()> {
    if segment.is_empty() {
        return Ok(());
    }
    if let Some(v) = parse_literal(segment, ctx)? {
        list.push_object(v);
        return Ok(());
    }
    // A leading digit splits into number-then-identifier (2pi -> 2 * pi).
    if segment.starts_with(|c: char| c.is_ascii_digit() || c == '.')
        && !segment.starts_with(|c: char| c.is_alphabetic())
    {
        if let Some((num, rest)) = split_leading_number(segment, ctx.significant_mode()) {
            list.push_object(num);
            if !rest.is_empty() {
                return resolve_identifier(&rest, next_op, list, ctx);
            }
            return Ok(());
        }
        return Err(CantusError::syntax(format!("invalid number '{}'", segment)));
    }
    resolve_identifier(segment, next_op, list, ctx)
}

fn parse_literal(segment: &str, ctx: &mut dyn NameContext) -> EvalResult<Option<Value>> {
    match segment {
        "true" => return Ok(Some(Value::Bool(true))),
        "false" => return Ok(Some(Value::Bool(false))),
        "undefined" => return Ok(Some(Value::undefined())),
        _ => {}
    }
    for quote in ['"', '\''] {
        if segment.starts_with(quote) && is_single_quoted(segment, quote) {
            return Ok(Some(Value::Text(unescape(&segment[1..segment.len() - 1]))));
        }
    }
    if segment.starts_with('`') && is_single_quoted(segment, '`') {
        return Ok(Some(Value::Lambda(parse_backtick_lambda(
            &segment[1..segment.len() - 1],
            ctx.scope(),
        ))));
    }
    // Imaginary literal: numeric body with a trailing `i`.
    if let Some(body) = segment.strip_suffix('i') {
        if !body.is_empty() {
            if let Some(n) = BigDec::parse(body, false) {
                return Ok(Some(Value::Complex {
                    re: 0.0,
                    im: n.to_f64().unwrap_or(f64::NAN),
                }));
            }
        }
    }
    if let Some(n) = BigDec::parse(segment, ctx.significant_mode()) {
        return Ok(Some(Value::Num(n)));
    }
    Ok(None)
}

/// The whole segment is one quoted span (`"a" "b"` is not).
fn is_single_quoted(segment: &str, quote: char) -> bool {
    let chars: Vec<char> = segment.chars().collect();
    chars.len() >= 2 && matches!(skip_quoted(&chars, 0, quote), Ok(end) if end == chars.len())
}

fn parse_backtick_lambda(inner: &str, scope: &str) -> Lambda {
    match find_top_level(inner, "=>") {
        Some(at) => {
            let head = inner[..at].trim();
            let args = if head.starts_with('(') && head.ends_with(')') {
                parse_arg_names(&head[1..head.len() - 1])
            } else if head.is_empty() {
                Vec::new()
            } else {
                vec![head.to_string()]
            };
            Lambda::expression(args, inner[at + 2..].trim(), scope)
        }
        None => Lambda::expression(Vec::new(), inner.trim(), scope),
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('`') => out.push('`'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn split_leading_number(segment: &str, track_sig: bool) -> Option<(Value, String)> {
    let chars: Vec<char> = segment.chars().collect();
    let mut end = 0usize;
    while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
        end += 1;
    }
    // Optional exponent marker directly after the digits.
    if end < chars.len() && (chars[end] == 'e' || chars[end] == 'E') {
        let mut j = end + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            end = j;
        }
    }
    if end == 0 {
        return None;
    }
    let body: String = chars[..end].iter().collect();
    let mut rest: String = chars[end..].iter().collect();
    // `2i` is an imaginary literal, not 2 * i.
    if rest == "i" {
        let n = BigDec::parse(&body, false)?;
        return Some((
            Value::Complex {
                re: 0.0,
                im: n.to_f64().ok()?,
            },
            String::new(),
        ));
    }
    let num = BigDec::parse(&body, track_sig)?;
    if rest.starts_with('.') {
        rest.remove(0);
    }
    Some((Value::Num(num), rest))
}

/// Identifier resolution: assignment targets become references, value uses
/// go through lookup with variable splitting for implicit multiplication.
fn resolve_identifier(
    name: &str,
    next_op: Option<OpId>,
    list: &mut TokenList,
    ctx: &mut dyn NameContext,
) -> EvalResult<()> {
    let table = OperatorTable::global();
    let assigning = next_op.is_some_and(|id| table.op(id).assignment);
    if assigning {
        let target = ctx.assign_target(name)?;
        list.push_object(target);
        return Ok(());
    }
    if ctx.is_known(name) || name.contains('.') {
        list.push_object(ctx.variable(name)?);
        return Ok(());
    }
    // Unknown bare name: try splitting into concatenated known names,
    // longest prefix first (xy -> x * y).
    if let Some(parts) = split_known_names(name, ctx) {
        for part in parts {
            let v = ctx.variable(&part)?;
            list.push_object(v);
        }
        return Ok(());
    }
    list.push_object(ctx.variable(name)?);
    Ok(())
}

fn split_known_names(name: &str, ctx: &dyn NameContext) -> Option<Vec<String>> {
    let chars: Vec<char> = name.chars().collect();
    let mut parts = Vec::new();
    let mut pos = 0usize;
    while pos < chars.len() {
        let mut found = None;
        for end in (pos + 1..=chars.len()).rev() {
            let candidate: String = chars[pos..end].iter().collect();
            if ctx.is_known(&candidate) {
                found = Some((candidate, end));
                break;
            }
        }
        match found {
            Some((candidate, end)) => {
                parts.push(candidate);
                pos = end;
            }
            None => return None,
        }
    }
    if parts.len() < 2 {
        return None;
    }
    Some(parts)
}

// ── Brackets ────────────────────────────────────────────────────────────

fn handle_bracket(
    segment: &str,
    open: &str,
    inner: &str,
    list: &mut TokenList,
    ctx: &mut dyn NameContext,
) -> EvalResult<()> {
    if open == "(" && is_call_target(segment) {
        // Call form: the segment names the target; a leading dot makes the
        // previous object the receiver.
        let (name, receiver) = if let Some(stripped) = segment.strip_prefix('.') {
            match list.take_last_object() {
                Some(recv) => (stripped.to_string(), Some(recv)),
                // No explicit left operand: the evaluator binds `this`.
                None => (segment.to_string(), None),
            }
        } else {
            (segment.to_string(), None)
        };
        let result = ctx.call(&name, inner, receiver)?;
        list.push_object(result);
        return Ok(());
    }
    process_segment(segment, None, list, ctx)?;
    match open {
        "(" => {
            let condition = ctx.condition_mode();
            let v = ctx.eval_sub(inner, condition)?;
            list.push_object(v.resolve());
        }
        "[" => {
            if let Some(base) = list.take_last_object() {
                // Indexing; comma-separated indices chain.
                let mut current = base;
                for index_src in split_top_level(inner, ',') {
                    let idx = ctx.eval_sub(index_src.trim(), true)?;
                    current = crate::operators::index_value(&current, &idx.resolve())?;
                }
                list.push_object(current);
            } else {
                let mut items = Vec::new();
                for element in split_top_level(inner, ',') {
                    if element.trim().is_empty() {
                        continue;
                    }
                    let v = ctx.eval_sub(element.trim(), true)?;
                    items.push(Reference::new(v.resolve()));
                }
                list.push_object(Value::Matrix(items));
            }
        }
        "{" => {
            list.push_object(build_brace_literal(inner, ctx)?);
        }
        _ => unreachable!("bracket table covers three pairs"),
    }
    Ok(())
}

fn is_call_target(segment: &str) -> bool {
    if let Some(rest) = segment.strip_prefix('.') {
        // `.sort` is a self-referring call; `.5` is a number.
        return !rest.is_empty() && !rest.starts_with(|c: char| c.is_ascii_digit());
    }
    !segment.is_empty()
        && !segment.starts_with(|c: char| c.is_ascii_digit())
        && segment.chars().all(is_identifier_char)
}

/// `{a, b}` is a set; `{k: v}` is a dictionary; empty braces make an
/// empty dictionary.
fn build_brace_literal(inner: &str, ctx: &mut dyn NameContext) -> EvalResult<Value> {
    let entries: Vec<String> = split_top_level(inner, ',')
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if entries.is_empty() {
        return Ok(Value::Dict(IndexMap::new()));
    }
    let is_dict = entries
        .iter()
        .all(|e| split_top_level(e, ':').len() == 2);
    if is_dict {
        let mut out: IndexMap<SortKey, (Reference, Reference)> = IndexMap::new();
        for entry in entries {
            let parts = split_top_level(&entry, ':');
            let key = ctx.eval_sub(parts[0].trim(), true)?.resolve();
            let val = ctx.eval_sub(parts[1].trim(), true)?.resolve();
            out.insert(
                key.sort_key(),
                (Reference::new(key), Reference::new(val)),
            );
        }
        Ok(Value::Dict(out))
    } else {
        let mut out: BTreeMap<SortKey, Reference> = BTreeMap::new();
        for entry in entries {
            let v = ctx.eval_sub(&entry, true)?.resolve();
            out.insert(v.sort_key(), Reference::new(v));
        }
        Ok(Value::Set(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Name resolution stub: fixed variables, calls echo their name.
    struct Stub {
        vars: HashMap<String, Value>,
        condition: bool,
    }

    impl Stub {
        fn new() -> Self {
            let mut vars = HashMap::new();
            vars.insert("x".to_string(), num(2));
            vars.insert("y".to_string(), num(3));
            Stub {
                vars,
                condition: false,
            }
        }
    }

    fn num(v: i64) -> Value {
        Value::Num(BigDec::from_i64(v))
    }

    impl NameContext for Stub {
        fn scope(&self) -> &str {
            "cantus"
        }
        fn significant_mode(&self) -> bool {
            false
        }
        fn condition_mode(&self) -> bool {
            self.condition
        }
        fn is_known(&self, name: &str) -> bool {
            self.vars.contains_key(name)
        }
        fn variable(&mut self, name: &str) -> EvalResult<Value> {
            self.vars
                .get(name)
                .cloned()
                .ok_or_else(|| CantusError::new(ErrorKind::UndefinedVariable(name.into())))
        }
        fn assign_target(&mut self, name: &str) -> EvalResult<Value> {
            Ok(Value::Ident(name.to_string()))
        }
        fn call(
            &mut self,
            name: &str,
            args_src: &str,
            _receiver: Option<Value>,
        ) -> EvalResult<Value> {
            Ok(Value::Text(format!("{}({})", name, args_src)))
        }
        fn eval_sub(&mut self, expr: &str, _condition: bool) -> EvalResult<Value> {
            BigDec::parse(expr.trim(), false)
                .map(Value::Num)
                .ok_or_else(|| CantusError::syntax(format!("stub cannot eval '{}'", expr)))
        }
    }

    fn signs(list: &TokenList) -> Vec<&'static str> {
        let table = OperatorTable::global();
        list.tokens
            .iter()
            .filter_map(|t| t.op.map(|id| table.op(id).canonical_sign()))
            .collect()
    }

    #[test]
    fn splits_on_longest_operator() {
        let mut ctx = Stub::new();
        let list = tokenize("1<=2", &mut ctx).unwrap();
        assert_eq!(signs(&list), vec!["<="]);
        assert_eq!(list.object_count(), 2);
    }

    #[test]
    fn condition_mode_reads_equals_as_equality() {
        let mut ctx = Stub::new();
        ctx.condition = true;
        let list = tokenize("x = 2", &mut ctx).unwrap();
        assert_eq!(signs(&list), vec!["=="]);
    }

    #[test]
    fn adjacent_operands_get_default_multiplication() {
        let mut ctx = Stub::new();
        let list = tokenize("2(3)", &mut ctx).unwrap();
        assert_eq!(signs(&list), vec!["*"]);
    }

    #[test]
    fn variable_splitting_resolves_concatenated_names() {
        let mut ctx = Stub::new();
        let list = tokenize("xy", &mut ctx).unwrap();
        assert_eq!(signs(&list), vec!["*"]);
        assert_eq!(list.object_count(), 2);
        let list = tokenize("yx", &mut ctx).unwrap();
        assert_eq!(list.object_count(), 2);
    }

    #[test]
    fn leading_number_splits_from_identifier() {
        let mut ctx = Stub::new();
        let list = tokenize("2x", &mut ctx).unwrap();
        assert_eq!(signs(&list), vec!["*"]);
    }

    #[test]
    fn word_operators_respect_boundaries() {
        let mut ctx = Stub::new();
        ctx.vars.insert("sand".into(), num(9));
        let list = tokenize("sand", &mut ctx).unwrap();
        assert_eq!(list.object_count(), 1);
        assert!(signs(&list).is_empty());
        let list = tokenize("x and y", &mut ctx).unwrap();
        assert_eq!(signs(&list), vec!["&&"]);
    }

    #[test]
    fn call_segments_route_through_context() {
        let mut ctx = Stub::new();
        let list = tokenize("f(1, 2)", &mut ctx).unwrap();
        let obj = list.tokens[0].obj.clone().unwrap();
        assert!(obj.loose_eq(&Value::Text("f(1, 2)".into())));
    }

    #[test]
    fn self_referring_call_consumes_left_operand() {
        let mut ctx = Stub::new();
        let list = tokenize("(5).sort()", &mut ctx).unwrap();
        assert_eq!(list.object_count(), 1);
        let obj = list.tokens[0].obj.clone().unwrap();
        assert!(obj.loose_eq(&Value::Text("sort()".into())));
    }

    #[test]
    fn matrix_literal_and_indexing() {
        let mut ctx = Stub::new();
        let list = tokenize("[1, 2, 3]", &mut ctx).unwrap();
        match list.tokens[0].obj.clone().unwrap() {
            Value::Matrix(items) => assert_eq!(items.len(), 3),
            other => panic!("expected matrix, got {}", other.type_name()),
        }
        let list = tokenize("[10, 20][1]", &mut ctx).unwrap();
        assert!(list.tokens[0]
            .obj
            .clone()
            .unwrap()
            .resolve()
            .loose_eq(&num(20)));
    }

    #[test]
    fn brace_literals_build_sets_and_dicts() {
        let mut ctx = Stub::new();
        let list = tokenize("{3, 1, 2}", &mut ctx).unwrap();
        match list.tokens[0].obj.clone().unwrap() {
            Value::Set(items) => assert_eq!(items.len(), 3),
            other => panic!("expected set, got {}", other.type_name()),
        }
        let list = tokenize("{1: 10, 2: 20}", &mut ctx).unwrap();
        match list.tokens[0].obj.clone().unwrap() {
            Value::Dict(items) => assert_eq!(items.len(), 2),
            other => panic!("expected dict, got {}", other.type_name()),
        }
    }

    #[test]
    fn backtick_lambda_is_a_literal() {
        let mut ctx = Stub::new();
        let list = tokenize("`n => n + 1`", &mut ctx).unwrap();
        match list.tokens[0].obj.clone().unwrap() {
            Value::Lambda(l) => {
                assert_eq!(l.arg_names, vec!["n"]);
                assert_eq!(l.body, "n + 1");
            }
            other => panic!("expected lambda, got {}", other.type_name()),
        }
    }

    #[test]
    fn arrow_lambda_splits_off_the_tail() {
        let mut ctx = Stub::new();
        let list = tokenize("x => x + 1", &mut ctx).unwrap();
        assert_eq!(list.object_count(), 1);
        assert!(matches!(
            list.tokens[0].obj.clone().unwrap(),
            Value::Lambda(_)
        ));
    }

    #[test]
    fn assignment_targets_resolve_late() {
        let mut ctx = Stub::new();
        let list = tokenize("fresh = 5", &mut ctx).unwrap();
        assert!(matches!(
            list.tokens[0].obj.clone().unwrap(),
            Value::Ident(_)
        ));
    }

    #[test]
    fn scientific_notation_survives_the_scan() {
        let mut ctx = Stub::new();
        let list = tokenize("1e-5", &mut ctx).unwrap();
        assert_eq!(list.object_count(), 1);
        assert!(signs(&list).is_empty());
    }

    #[test]
    fn unbalanced_brackets_error() {
        let mut ctx = Stub::new();
        assert!(tokenize("(1 + 2", &mut ctx).is_err());
        assert!(tokenize("[1, 2", &mut ctx).is_err());
    }
}
