/// Script-level statement engine.
///
/// Raw source is consumed line by line: comments are stripped (a `#`
/// counts only when single-quote, double-quote and backtick depths are all
/// zero), continuation joiners are applied (trailing `\`, unbalanced
/// backticks, `=>` at end of line), and `;` splits a line into several
/// statements at the same indent. Statements that open a block collect
/// every following line of deeper indentation as their body; auxiliary
/// keywords (`elif`, `else`, `catch`) at the same indent extend the
/// statement. Every statement returns a `(value, code)` pair that directs
/// the enclosing engine.
use crate::core::oop::{Lambda, UserClass, UserFunction};
use crate::core::value::{Reference, Value};
use crate::errors::{CantusError, ErrorKind, EvalResult};
use crate::evaluator::Evaluator;
use crate::scope::{combine, Variable};
use crate::threads::CancelToken;
use crate::tokenizer::{find_top_level, split_top_level};
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// Statement result codes of the block protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Resume,
    Break,
    Continue,
    Return,
    /// Ends the current block, resuming the enclosing statement.
    BreakLevel,
}

#[derive(Debug, Clone)]
pub struct StatementResult {
    pub value: Value,
    pub code: Code,
}

impl StatementResult {
    pub fn resume(value: Value) -> Self {
        StatementResult {
            value,
            code: Code::Resume,
        }
    }
}

/// A producer of raw source lines.
pub trait LineSource {
    fn next_line(&mut self) -> Option<String>;
}

pub struct VecSource {
    lines: std::vec::IntoIter<String>,
}

impl VecSource {
    pub fn new(text: &str) -> Self {
        VecSource {
            lines: text
                .lines()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .into_iter(),
        }
    }
}

impl LineSource for VecSource {
    fn next_line(&mut self) -> Option<String> {
        self.lines.next()
    }
}

/// One logical line: original number, computed indent, body text.
#[derive(Debug, Clone)]
pub struct Line {
    pub no: usize,
    pub indent: usize,
    pub text: String,
}

pub struct ExecOpts {
    pub scope: String,
    pub declarative: bool,
    pub top_level: bool,
    pub no_save_ans: bool,
    pub cancel: CancelToken,
    pub line_offset: usize,
}

struct ExecState<'a> {
    ev: &'a Evaluator,
    scope: String,
    declarative: bool,
    top_level: bool,
    no_save_ans: bool,
    cancel: CancelToken,
    switch_values: Vec<Value>,
    line: usize,
}

/// Run a whole script from a line source.
pub fn exec_script(
    ev: &Evaluator,
    src: &mut dyn LineSource,
    opts: ExecOpts,
) -> EvalResult<StatementResult> {
    let spaces_per_tab = ev.modes().spaces_per_tab;
    let mut reader = LineReader::new(src, spaces_per_tab, opts.line_offset);
    let mut state = ExecState {
        ev,
        scope: opts.scope,
        declarative: opts.declarative,
        top_level: opts.top_level,
        no_save_ans: opts.no_save_ans,
        cancel: opts.cancel,
        switch_values: Vec::new(),
        line: opts.line_offset,
    };
    let result = exec_stream(&mut state, &mut reader)?;
    match result.code {
        Code::Return if state.top_level => Ok(StatementResult::resume(result.value)),
        Code::Break => Err(CantusError::at_line(
            ErrorKind::NotInLoop("break".into()),
            state.line,
        )),
        Code::Continue => Err(CantusError::at_line(
            ErrorKind::NotInLoop("continue".into()),
            state.line,
        )),
        _ => Ok(StatementResult::resume(result.value)),
    }
}

/// Run stored body lines (function bodies, block re-entry).
pub fn exec_lines(
    ev: &Evaluator,
    text: &str,
    opts: ExecOpts,
) -> EvalResult<StatementResult> {
    let mut src = VecSource::new(text);
    let spaces_per_tab = ev.modes().spaces_per_tab;
    let mut reader = LineReader::new(&mut src, spaces_per_tab, opts.line_offset);
    let mut state = ExecState {
        ev,
        scope: opts.scope,
        declarative: opts.declarative,
        top_level: opts.top_level,
        no_save_ans: opts.no_save_ans,
        cancel: opts.cancel,
        switch_values: Vec::new(),
        line: opts.line_offset,
    };
    exec_stream(&mut state, &mut reader)
}

// ── Logical line reader ─────────────────────────────────────────────────

struct LineReader<'a> {
    src: &'a mut dyn LineSource,
    physical_pending: Option<String>,
    queue: VecDeque<Line>,
    line_no: usize,
    spaces_per_tab: usize,
}

impl<'a> LineReader<'a> {
    fn new(src: &'a mut dyn LineSource, spaces_per_tab: usize, offset: usize) -> Self {
        LineReader {
            src,
            physical_pending: None,
            queue: VecDeque::new(),
            line_no: offset,
            spaces_per_tab,
        }
    }

    fn next_physical(&mut self) -> Option<String> {
        if let Some(p) = self.physical_pending.take() {
            return Some(p);
        }
        let line = self.src.next_line()?;
        self.line_no += 1;
        Some(line)
    }

    fn push_back_physical(&mut self, line: String) {
        self.physical_pending = Some(line);
        self.line_no -= 1;
    }

    fn indent_of(&self, line: &str) -> usize {
        let mut indent = 0;
        for c in line.chars() {
            match c {
                ' ' => indent += 1,
                '\t' => indent += self.spaces_per_tab,
                _ => break,
            }
        }
        indent
    }

    /// Next logical line, skipping blanks.
    fn next_logical(&mut self) -> EvalResult<Option<Line>> {
        loop {
            if let Some(line) = self.queue.pop_front() {
                return Ok(Some(line));
            }
            let Some(raw) = self.next_physical() else {
                return Ok(None);
            };
            let no = self.line_no;
            let indent = self.indent_of(&raw);
            let mut text = raw;

            // Triple-quoted strings span lines until the matching triple.
            while has_open_triple(&text) {
                match self.next_physical() {
                    Some(next) => {
                        text.push('\n');
                        text.push_str(&next);
                    }
                    None => {
                        return Err(CantusError::at_line(
                            ErrorKind::Syntax("unterminated triple-quoted string".into()),
                            no,
                        ))
                    }
                }
            }
            text = normalize_triples(&text);
            text = strip_comment(&text);

            // Trailing backslash joins the next line.
            while text.trim_end().ends_with('\\') {
                let cut = text.trim_end().len() - 1;
                text.truncate(cut);
                match self.next_physical() {
                    Some(next) => text.push_str(strip_comment(&next).trim_start()),
                    None => break,
                }
            }

            // An unbalanced backtick keeps consuming lines.
            while count_unquoted(&text, '`') % 2 == 1 {
                match self.next_physical() {
                    Some(next) => {
                        text.push('\n');
                        text.push_str(&strip_comment(&next));
                    }
                    None => {
                        return Err(CantusError::at_line(
                            ErrorKind::Syntax("unterminated lambda".into()),
                            no,
                        ))
                    }
                }
            }

            // `=>` at end of line pulls in the indented block below.
            if text.trim_end().ends_with("=>") {
                loop {
                    let Some(next) = self.next_physical() else { break };
                    if next.trim().is_empty() {
                        text.push('\n');
                        continue;
                    }
                    if self.indent_of(&next) <= indent {
                        self.push_back_physical(next);
                        break;
                    }
                    text.push('\n');
                    text.push_str(&strip_comment(&next));
                }
            }

            if text.trim().is_empty() {
                continue;
            }

            // `;` splits single-line statements at the same indent.
            if !text.contains('\n') {
                for part in split_top_level(&text, ';') {
                    if !part.trim().is_empty() {
                        self.queue.push_back(Line {
                            no,
                            indent,
                            text: part.trim().to_string(),
                        });
                    }
                }
            } else {
                self.queue.push_back(Line {
                    no,
                    indent,
                    text: text.trim_start().to_string(),
                });
            }
        }
    }

    fn peek_logical(&mut self) -> EvalResult<Option<&Line>> {
        if self.queue.is_empty() {
            if let Some(line) = self.next_logical()? {
                self.queue.push_front(line);
            }
        }
        Ok(self.queue.front())
    }
}

/// `#` starts a comment only when single- and double-quote depth (tracked
/// independently) and backtick depth are all zero.
fn strip_comment(line: &str) -> String {
    let mut in_single = false;
    let mut in_double = false;
    let mut in_tick = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                i += 2;
                continue;
            }
            '\'' if !in_double && !in_tick => in_single = !in_single,
            '"' if !in_single && !in_tick => in_double = !in_double,
            '`' if !in_single && !in_double => in_tick = !in_tick,
            '#' if !in_single && !in_double && !in_tick => {
                return chars[..i].iter().collect();
            }
            _ => {}
        }
        i += 1;
    }
    line.to_string()
}

fn count_unquoted(line: &str, target: char) -> usize {
    let mut in_single = false;
    let mut in_double = false;
    let mut count = 0;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                i += 2;
                continue;
            }
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c == target && !in_single && !in_double => count += 1,
            _ => {}
        }
        i += 1;
    }
    count
}

fn has_open_triple(text: &str) -> bool {
    text.matches("\"\"\"").count() % 2 == 1 || text.matches("'''").count() % 2 == 1
}

/// Rewrite triple-quoted spans as ordinary escaped strings so the
/// expression tokenizer only ever sees single-char quotes.
fn normalize_triples(text: &str) -> String {
    let mut out = text.to_string();
    for triple in ["\"\"\"", "'''"] {
        while let Some(start) = out.find(triple) {
            let Some(rel_end) = out[start + 3..].find(triple) else { break };
            let end = start + 3 + rel_end;
            let body = &out[start + 3..end];
            let escaped = body
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n");
            out = format!("{}\"{}\"{}", &out[..start], escaped, &out[end + 3..]);
        }
    }
    out
}

// ── Statement parsing ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Statement {
    line: usize,
    keyword: String,
    modifiers: HashSet<String>,
    arg: String,
    /// Chained statement text split off after ` then `.
    chained: Option<String>,
    body: Vec<Line>,
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone)]
struct Clause {
    keyword: String,
    arg: String,
    body: Vec<Line>,
}

const MODIFIER_WORDS: [&str; 4] = ["private", "internal", "static", "global"];
const DECLARATIVE_KEYWORDS: [&str; 9] = [
    "function",
    "class",
    "let",
    "global",
    "import",
    "unimport",
    "load",
    "namespace",
    "set",
];
const BLOCK_KEYWORDS: [&str; 12] = [
    "if", "elif", "else", "while", "until", "for", "repeat", "run", "switch", "case", "try",
    "namespace",
];

fn keyword_of(text: &str) -> (String, String) {
    match text.find(char::is_whitespace) {
        Some(i) => (text[..i].to_string(), text[i + 1..].trim().to_string()),
        None => (text.to_string(), String::new()),
    }
}

fn aux_keywords(keyword: &str) -> &'static [&'static str] {
    match keyword {
        "if" | "elif" => &["elif", "else"],
        "try" => &["catch"],
        _ => &[],
    }
}

fn read_statement(reader: &mut LineReader<'_>) -> EvalResult<Option<Statement>> {
    let Some(line) = reader.next_logical()? else {
        return Ok(None);
    };
    let (mut keyword, mut arg) = keyword_of(&line.text);

    // Leading modifier words attach to the declaration that follows.
    let mut modifiers: HashSet<String> = HashSet::new();
    while MODIFIER_WORDS.contains(&keyword.as_str()) {
        let (next_kw, next_arg) = keyword_of(&arg);
        if ["function", "class", "let"].contains(&next_kw.as_str()) {
            modifiers.insert(keyword.clone());
            keyword = next_kw;
            arg = next_arg;
        } else {
            break;
        }
    }

    let recognized = BLOCK_KEYWORDS.contains(&keyword.as_str())
        || DECLARATIVE_KEYWORDS.contains(&keyword.as_str())
        || matches!(
            keyword.as_str(),
            "return" | "break" | "continue" | "default" | "catch"
        );
    if !recognized {
        // Plain expression statement; the whole text is the argument.
        return Ok(Some(Statement {
            line: line.no,
            keyword: String::new(),
            modifiers,
            arg: line.text.clone(),
            chained: None,
            body: collect_body(reader, line.indent)?,
            clauses: Vec::new(),
        }));
    }

    // ` then ` chaining splits the argument; a bare argumentless block
    // (`run then while ...`) starts with the chain directly.
    let mut chained = None;
    if let Some(rest) = arg.strip_prefix("then ") {
        chained = Some(rest.trim().to_string());
        arg = String::new();
    } else if let Some(at) = find_top_level(&arg, " then ") {
        chained = Some(arg[at + 6..].trim().to_string());
        arg = arg[..at].trim().to_string();
    } else if let Some(stripped) = arg.strip_suffix(" then") {
        chained = Some(String::new());
        arg = stripped.trim().to_string();
    }

    let body = collect_body(reader, line.indent)?;
    let mut clauses: Vec<Clause> = Vec::new();
    loop {
        let aux = aux_keywords(match clauses.last() {
            Some(last) => &last.keyword,
            None => &keyword,
        });
        let next_head = reader
            .peek_logical()?
            .map(|next| (next.indent, keyword_of(&next.text).0));
        let continues = matches!(
            &next_head,
            Some((indent, kw)) if *indent == line.indent && aux.contains(&kw.as_str())
        );
        if !continues {
            break;
        }
        let Some(aux_line) = reader.next_logical()? else { break };
        let (kw, aux_arg) = keyword_of(&aux_line.text);
        let aux_body = collect_body(reader, aux_line.indent)?;
        clauses.push(Clause {
            keyword: kw,
            arg: aux_arg,
            body: aux_body,
        });
    }

    Ok(Some(Statement {
        line: line.no,
        keyword,
        modifiers,
        arg,
        chained,
        body,
        clauses,
    }))
}

fn collect_body(reader: &mut LineReader<'_>, indent: usize) -> EvalResult<Vec<Line>> {
    let mut body = Vec::new();
    loop {
        let deeper = matches!(reader.peek_logical()?, Some(next) if next.indent > indent);
        if !deeper {
            break;
        }
        if let Some(line) = reader.next_logical()? {
            body.push(line);
        }
    }
    Ok(body)
}

/// Reassemble body lines into storable source text, dedented to the
/// block's own root.
fn body_text(body: &[Line]) -> String {
    let base = body.iter().map(|l| l.indent).min().unwrap_or(0);
    body.iter()
        .map(|l| format!("{}{}", " ".repeat(l.indent - base), l.text))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Execution ───────────────────────────────────────────────────────────

fn exec_stream(
    state: &mut ExecState<'_>,
    reader: &mut LineReader<'_>,
) -> EvalResult<StatementResult> {
    let mut last = Value::undefined();
    while let Some(stmt) = read_statement(reader)? {
        if state.cancel.is_cancelled() {
            return Err(CantusError::new(ErrorKind::Cancelled));
        }
        state.line = stmt.line;
        let result = exec_statement(state, &stmt).map_err(|e| e.or_line(stmt.line))?;
        match result.code {
            Code::Resume => last = result.value,
            Code::BreakLevel => {
                return Ok(StatementResult::resume(result.value));
            }
            _ => return Ok(result),
        }
    }
    Ok(StatementResult::resume(last))
}

fn exec_body(state: &mut ExecState<'_>, body: &[Line]) -> EvalResult<StatementResult> {
    if body.is_empty() {
        return Ok(StatementResult::resume(Value::undefined()));
    }
    let text = body_text(body);
    let mut src = VecSource::new(&text);
    let mut reader = LineReader::new(&mut src, state.ev.modes().spaces_per_tab, body[0].no - 1);
    exec_stream(state, &mut reader)
}

fn exec_statement(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    if state.declarative
        && !stmt.keyword.is_empty()
        && !DECLARATIVE_KEYWORDS.contains(&stmt.keyword.as_str())
    {
        return Err(CantusError::syntax(format!(
            "statement '{}' is not allowed in declarative mode",
            stmt.keyword
        )));
    }
    if state.declarative && stmt.keyword.is_empty() {
        return Err(CantusError::syntax(
            "expressions are not allowed in declarative mode",
        ));
    }
    debug!(keyword = %stmt.keyword, line = stmt.line, "statement");

    let result = match stmt.keyword.as_str() {
        "" => exec_expression_statement(state, stmt),
        "if" => exec_if(state, stmt),
        "elif" | "else" => Err(CantusError::new(ErrorKind::BadChain(stmt.keyword.clone()))),
        "catch" => Err(CantusError::new(ErrorKind::BadChain("catch".into()))),
        "while" => exec_loop(state, stmt, LoopKind::While),
        "until" => exec_loop(state, stmt, LoopKind::Until),
        "repeat" => exec_repeat(state, stmt),
        "for" => exec_for(state, stmt),
        "run" => exec_run(state, stmt),
        "switch" => exec_switch(state, stmt),
        "case" => exec_case(state, stmt, false),
        "default" => exec_case(state, stmt, true),
        "try" => exec_try(state, stmt),
        "return" => {
            let value = if stmt.arg.is_empty() {
                Value::undefined()
            } else {
                state.eval_expr(&stmt.arg, false)?
            };
            Ok(StatementResult {
                value,
                code: Code::Return,
            })
        }
        "break" => Ok(StatementResult {
            value: Value::undefined(),
            code: Code::Break,
        }),
        "continue" => Ok(StatementResult {
            value: Value::undefined(),
            code: Code::Continue,
        }),
        "function" => exec_function_decl(state, stmt),
        "class" => exec_class_decl(state, stmt),
        "let" => exec_let(state, stmt, state.scope.clone()),
        "global" => exec_global(state, stmt),
        "import" => {
            state.ev.import(stmt.arg.trim());
            Ok(StatementResult::resume(Value::undefined()))
        }
        "unimport" => {
            state.ev.unimport(stmt.arg.trim());
            Ok(StatementResult::resume(Value::undefined()))
        }
        "load" => {
            let path = stmt.arg.trim().trim_matches(|c| c == '"' || c == '\'');
            state.ev.load(path, false, false)?;
            Ok(StatementResult::resume(Value::undefined()))
        }
        "namespace" => exec_namespace(state, stmt),
        "set" => exec_set(state, stmt),
        other => Err(CantusError::syntax(format!("unknown statement '{}'", other))),
    }?;

    // A chained statement runs on the same body once the block finishes.
    if let Some(chain) = &stmt.chained {
        if result.code == Code::Resume && !chain.is_empty() {
            let chained_stmt = reparse_chained(chain, stmt)?;
            return exec_statement(state, &chained_stmt);
        }
    }
    Ok(result)
}

fn reparse_chained(chain: &str, origin: &Statement) -> EvalResult<Statement> {
    let (keyword, mut arg) = keyword_of(chain);
    let mut chained = None;
    if let Some(at) = find_top_level(&arg, " then ") {
        chained = Some(arg[at + 6..].trim().to_string());
        arg = arg[..at].trim().to_string();
    }
    Ok(Statement {
        line: origin.line,
        keyword,
        modifiers: HashSet::new(),
        arg,
        chained,
        body: origin.body.clone(),
        clauses: Vec::new(),
    })
}

fn exec_expression_statement(
    state: &mut ExecState<'_>,
    stmt: &Statement,
) -> EvalResult<StatementResult> {
    if !stmt.body.is_empty() {
        return Err(CantusError::new(ErrorKind::BadIndent));
    }
    let value = state.eval_expr(&stmt.arg, false)?;
    if state.top_level && !state.no_save_ans && !value.is_undefined() {
        state.ev.push_answer(value.clone());
    }
    Ok(StatementResult::resume(value))
}

fn exec_if(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    if state.eval_expr(&stmt.arg, true)?.is_truthy() {
        return exec_body(state, &stmt.body);
    }
    for clause in &stmt.clauses {
        match clause.keyword.as_str() {
            "elif" => {
                if state.eval_expr(&clause.arg, true)?.is_truthy() {
                    return exec_body(state, &clause.body);
                }
            }
            "else" => return exec_body(state, &clause.body),
            _ => {}
        }
    }
    Ok(StatementResult::resume(Value::undefined()))
}

enum LoopKind {
    While,
    Until,
}

fn exec_loop(
    state: &mut ExecState<'_>,
    stmt: &Statement,
    kind: LoopKind,
) -> EvalResult<StatementResult> {
    let mut last = Value::undefined();
    loop {
        if state.cancel.is_cancelled() {
            return Err(CantusError::new(ErrorKind::Cancelled));
        }
        let cond = state.eval_expr(&stmt.arg, true)?.is_truthy();
        let run = match kind {
            LoopKind::While => cond,
            LoopKind::Until => !cond,
        };
        if !run {
            break;
        }
        let result = exec_body(state, &stmt.body)?;
        match result.code {
            Code::Break => break,
            Code::Continue | Code::Resume => last = result.value,
            Code::Return | Code::BreakLevel => return Ok(result),
        }
    }
    Ok(StatementResult::resume(last))
}

fn exec_repeat(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    let count = match state.eval_expr(&stmt.arg, false)?.resolve() {
        Value::Num(n) => n.to_i64()?,
        other => {
            return Err(CantusError::new(ErrorKind::TypeExpected {
                expected: "number".into(),
                found: other.type_name().into(),
            }))
        }
    };
    let mut last = Value::undefined();
    for _ in 0..count.max(0) {
        if state.cancel.is_cancelled() {
            return Err(CantusError::new(ErrorKind::Cancelled));
        }
        let result = exec_body(state, &stmt.body)?;
        match result.code {
            Code::Break => break,
            Code::Continue | Code::Resume => last = result.value,
            Code::Return | Code::BreakLevel => return Ok(result),
        }
    }
    Ok(StatementResult::resume(last))
}

fn exec_for(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    let Some(at) = find_top_level(&stmt.arg, " in ") else {
        return Err(CantusError::syntax("for statement requires 'in'"));
    };
    let var_name = stmt.arg[..at].trim().to_string();
    let iter_src = stmt.arg[at + 4..].trim();
    let iterable = state.eval_expr(iter_src, false)?.resolve();
    let items = iterable_items(&iterable)?;
    let mut last = Value::undefined();
    for item in items {
        if state.cancel.is_cancelled() {
            return Err(CantusError::new(ErrorKind::Cancelled));
        }
        state
            .ev
            .env()
            .declare_var(&var_name, item, &state.scope, HashSet::new());
        let result = exec_body(state, &stmt.body)?;
        match result.code {
            Code::Break => break,
            Code::Continue | Code::Resume => last = result.value,
            Code::Return | Code::BreakLevel => return Ok(result),
        }
    }
    Ok(StatementResult::resume(last))
}

fn iterable_items(value: &Value) -> EvalResult<Vec<Value>> {
    match value {
        Value::Matrix(items) | Value::Tuple(items) => {
            Ok(items.iter().map(|r| Value::Ref(r.clone())).collect())
        }
        Value::LinkedList(items) => Ok(items.iter().map(|r| Value::Ref(r.clone())).collect()),
        Value::Set(items) => Ok(items.values().map(|r| Value::Ref(r.clone())).collect()),
        Value::HashSet(items) => Ok(items.values().map(|r| Value::Ref(r.clone())).collect()),
        Value::Dict(items) => Ok(items
            .values()
            .map(|(k, _)| Value::Ref(k.clone()))
            .collect()),
        Value::Text(s) => Ok(s.chars().map(|c| Value::Text(c.to_string())).collect()),
        other => Err(CantusError::new(ErrorKind::TypeExpected {
            expected: "iterable collection".into(),
            found: other.type_name().into(),
        })),
    }
}

fn exec_run(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    let result = exec_body(state, &stmt.body)?;
    match result.code {
        // `run` is loop-kind: it consumes break and continue.
        Code::Break | Code::Continue => Ok(StatementResult::resume(result.value)),
        _ => Ok(result),
    }
}

fn exec_switch(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    let value = state.eval_expr(&stmt.arg, false)?.resolve();
    state.switch_values.push(value);
    let result = exec_body(state, &stmt.body);
    state.switch_values.pop();
    result
}

fn exec_case(
    state: &mut ExecState<'_>,
    stmt: &Statement,
    is_default: bool,
) -> EvalResult<StatementResult> {
    let Some(subject) = state.switch_values.last().cloned() else {
        return Err(CantusError::new(ErrorKind::BadChain(
            stmt.keyword.clone(),
        )));
    };
    let matched = if is_default {
        true
    } else {
        // Several alternatives may share one case, comma-separated.
        let mut hit = false;
        for alternative in split_top_level(&stmt.arg, ',') {
            let candidate = state.eval_expr(alternative.trim(), true)?.resolve();
            if candidate.loose_eq(&subject) {
                hit = true;
                break;
            }
        }
        hit
    };
    if !matched {
        return Ok(StatementResult::resume(Value::undefined()));
    }
    let result = exec_body(state, &stmt.body)?;
    match result.code {
        Code::Resume => Ok(StatementResult {
            value: result.value,
            code: Code::BreakLevel,
        }),
        _ => Ok(result),
    }
}

fn exec_try(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    match exec_body(state, &stmt.body) {
        Ok(result) => Ok(result),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            for clause in &stmt.clauses {
                if clause.keyword == "catch" {
                    let var = clause.arg.trim();
                    if !var.is_empty() {
                        state.ev.env().declare_var(
                            var,
                            Value::Text(e.kind.to_string()),
                            &state.scope,
                            HashSet::new(),
                        );
                    }
                    return exec_body(state, &clause.body);
                }
            }
            Ok(StatementResult::resume(Value::undefined()))
        }
    }
}

// ── Declarations ────────────────────────────────────────────────────────

fn exec_function_decl(
    state: &mut ExecState<'_>,
    stmt: &Statement,
) -> EvalResult<StatementResult> {
    let (name, arg_names, defaults) = parse_signature(state, &stmt.arg)?;
    let func = UserFunction {
        name,
        body: body_text(&stmt.body),
        arg_names,
        defaults,
        modifiers: stmt.modifiers.clone(),
        return_type: None,
        declaring_scope: state.scope.clone(),
    };
    state.ev.env().put_func(func);
    Ok(StatementResult::resume(Value::undefined()))
}

fn parse_signature(
    state: &mut ExecState<'_>,
    text: &str,
) -> EvalResult<(String, Vec<String>, Vec<Option<Value>>)> {
    let text = text.trim();
    let open = text
        .find('(')
        .ok_or_else(|| CantusError::syntax("function signature requires parentheses"))?;
    if !text.ends_with(')') {
        return Err(CantusError::syntax("unterminated function signature"));
    }
    let name = text[..open].trim().to_string();
    if name.is_empty() {
        return Err(CantusError::syntax("function requires a name"));
    }
    let inner = &text[open + 1..text.len() - 1];
    let mut arg_names = Vec::new();
    let mut defaults = Vec::new();
    for part in split_top_level(inner, ',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match find_top_level(part, "=") {
            Some(at) if !part[at..].starts_with("==") => {
                let name = part[..at]
                    .trim_end_matches(|c: char| c == ':' || c.is_whitespace())
                    .to_string();
                arg_names.push(name);
                let default = state.eval_expr(part[at + 1..].trim(), false)?.resolve();
                defaults.push(Some(default));
            }
            _ => {
                arg_names.push(part.to_string());
                defaults.push(None);
            }
        }
    }
    Ok((name, arg_names, defaults))
}

fn exec_class_decl(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    let (name, bases_src) = match stmt.arg.find(':') {
        Some(i) => (
            stmt.arg[..i].trim().to_string(),
            stmt.arg[i + 1..].trim().to_string(),
        ),
        None => (stmt.arg.trim().to_string(), String::new()),
    };
    if name.is_empty() {
        return Err(CantusError::syntax("class requires a name"));
    }
    let mut base_classes = Vec::new();
    for base in bases_src.split(',') {
        let base = base.trim();
        if base.is_empty() {
            continue;
        }
        let class = state
            .ev
            .env()
            .find_class(base, &state.scope)
            .ok_or_else(|| CantusError::new(ErrorKind::UndefinedFunction(base.to_string())))?;
        base_classes.push(class.full_name());
    }

    let inner_scope = combine(&state.scope, &name);
    let source = body_text(&stmt.body);

    // Run the body inside the class scope; declarations become members.
    let saved_scope = std::mem::replace(&mut state.scope, inner_scope.clone());
    let body_result = exec_body(state, &stmt.body);
    state.scope = saved_scope;
    body_result?;

    // Harvest: non-static members leave the tables and become fields.
    let mut fields: IndexMap<String, Variable> = IndexMap::new();
    for var in state.ev.env().all_vars() {
        if var.declaring_scope == inner_scope {
            if var.modifiers.contains("static") {
                continue;
            }
            state.ev.env().remove_var(&var.full_name());
            fields.insert(var.name.clone(), var);
        }
    }
    for func in state.ev.env().all_funcs() {
        if func.declaring_scope == inner_scope && !func.modifiers.contains("static") {
            let lambda = Lambda::block(func.arg_names.clone(), func.body.clone(), &inner_scope);
            let var = Variable::new(&func.name, Value::Lambda(lambda), &inner_scope);
            fields.insert(func.name.clone(), var);
        }
    }
    // Bases always carry an `init` of their own, so synthesis is only
    // needed for root classes the user left without a constructor.
    if !fields.contains_key("init") && base_classes.is_empty() {
        let lambda = Lambda::block(Vec::new(), "return undefined", &inner_scope);
        fields.insert(
            "init".to_string(),
            Variable::new("init", Value::Lambda(lambda), &inner_scope),
        );
    }
    let type_lambda = Lambda::expression(Vec::new(), "type(this)", &inner_scope);
    fields.insert(
        "type".to_string(),
        Variable::new("type", Value::Lambda(type_lambda), &inner_scope),
    );

    let class = UserClass {
        name,
        body: source,
        modifiers: stmt.modifiers.clone(),
        base_classes,
        fields,
        declaring_scope: state.scope.clone(),
        inner_scope,
    };
    state.ev.env().put_class(class);
    Ok(StatementResult::resume(Value::undefined()))
}

fn exec_let(
    state: &mut ExecState<'_>,
    stmt: &Statement,
    scope: String,
) -> EvalResult<StatementResult> {
    let (name, value) = match find_top_level(&stmt.arg, "=") {
        Some(at) => {
            let name = stmt.arg[..at].trim().to_string();
            let value = state.eval_expr(stmt.arg[at + 1..].trim(), false)?.resolve();
            (name, value)
        }
        None => (stmt.arg.trim().to_string(), Value::undefined()),
    };
    if name.is_empty() || !name.chars().all(crate::tokenizer::is_identifier_char) {
        return Err(CantusError::syntax(format!(
            "'{}' is not a valid variable name",
            name
        )));
    }
    state
        .ev
        .env()
        .declare_var(&name, value, &scope, stmt.modifiers.clone());
    Ok(StatementResult::resume(Value::undefined()))
}

fn exec_global(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    let (next_kw, _) = keyword_of(&stmt.arg);
    if ["function", "class", "let"].contains(&next_kw.as_str()) {
        // `global` used as a leading modifier.
        let mut inner = stmt.clone();
        let (kw, arg) = keyword_of(&stmt.arg);
        inner.keyword = kw;
        inner.arg = arg;
        inner.modifiers.insert("global".to_string());
        return exec_statement(state, &inner);
    }
    let mut with_global = stmt.clone();
    with_global.modifiers.insert("global".to_string());
    exec_let(state, &with_global, crate::scope::ROOT_SCOPE.to_string())
}

fn exec_namespace(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    let name = stmt.arg.trim();
    if name.is_empty() {
        return Err(CantusError::syntax("namespace requires a name"));
    }
    let inner = combine(&state.scope, name);
    let saved = std::mem::replace(&mut state.scope, inner);
    let result = exec_body(state, &stmt.body);
    state.scope = saved;
    result
}

fn exec_set(state: &mut ExecState<'_>, stmt: &Statement) -> EvalResult<StatementResult> {
    let (option, value) = keyword_of(&stmt.arg);
    state.ev.set_option(&option, value.trim())?;
    Ok(StatementResult::resume(Value::undefined()))
}

impl ExecState<'_> {
    fn eval_expr(&mut self, expr: &str, condition: bool) -> EvalResult<Value> {
        self.ev
            .eval_expr_in(expr, &self.scope, condition, self.cancel.clone())
    }
}

/// Reference-producing helper shared with the evaluator's class
/// construction: deep copy a field table into fresh instance cells.
pub fn copy_fields(fields: &IndexMap<String, Variable>) -> IndexMap<String, Reference> {
    fields
        .iter()
        .map(|(name, var)| (name.clone(), var.reference.deep_copy()))
        .collect()
}
