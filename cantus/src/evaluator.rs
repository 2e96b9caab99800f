/// The evaluator façade.
///
/// An `Evaluator` is a cheap handle over shared state: the environment
/// tables, the evaluation modes, the previous-answer ring, the event hub
/// and the worker registry. Clones share everything, so `eval_async`
/// workers and sub-evaluators observe the same world; `deep_copy` and
/// `shallow_copy` are the documented ways to isolate concurrent work.
use crate::core::oop::{ClassInstance, Lambda, UserClass, UserFunction};
use crate::core::value::Value;
use crate::errors::{CantusError, ErrorKind, EvalResult};
use crate::intrinsics::{self, Builtin, BuiltinCtx};
use crate::operators::OpCtx;
use crate::resolver::resolve_tokens;
use crate::scope::{self, combine, is_external, Environment, ROOT_SCOPE};
use crate::statements::{exec_lines, exec_script, Code, ExecOpts, VecSource};
use crate::threads::{CancelToken, ThreadManager};
use crate::tokenizer::{find_top_level, split_top_level, tokenize, NameContext};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

const MAX_CALL_DEPTH: usize = 1_000;
const MAX_ANSWERS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngleMode {
    Radian,
    Degree,
    Gradian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Raw,
    /// Accepted for compatibility; renders like raw. Fraction and root
    /// presentation belongs to the host.
    Math,
    Scientific,
}

#[derive(Debug, Clone)]
pub struct Modes {
    pub angle: AngleMode,
    pub output: OutputFormat,
    pub spaces_per_tab: usize,
    pub explicit: bool,
    pub significant: bool,
    pub always_truncate: bool,
}

impl Default for Modes {
    fn default() -> Self {
        Modes {
            angle: AngleMode::Radian,
            output: OutputFormat::Raw,
            spaces_per_tab: 4,
            explicit: false,
            significant: false,
            always_truncate: false,
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────────

pub struct EvalComplete {
    pub worker: usize,
    pub result: Result<Value, CantusError>,
    pub expression: String,
    pub no_save_ans: bool,
}

type OutputHandler = Box<dyn Fn(&str) + Send + Sync>;
type InputHandler = Box<dyn Fn(&str, &str) -> String + Send + Sync>;
type ClearHandler = Box<dyn Fn() + Send + Sync>;
type CompleteHandler = Box<dyn Fn(&EvalComplete) + Send + Sync>;
type StartedHandler = Box<dyn Fn(usize) + Send + Sync>;

/// I/O events are the sole channel between the core and any terminal.
#[derive(Default)]
pub struct EventHub {
    write_output: RwLock<Option<OutputHandler>>,
    read_input: RwLock<Option<InputHandler>>,
    clear_console: RwLock<Option<ClearHandler>>,
    eval_complete: RwLock<Option<CompleteHandler>>,
    thread_started: RwLock<Option<StartedHandler>>,
}

impl EventHub {
    pub fn on_write_output(&self, f: OutputHandler) {
        *self.write_output.write() = Some(f);
    }

    pub fn on_read_input(&self, f: InputHandler) {
        *self.read_input.write() = Some(f);
    }

    pub fn on_clear_console(&self, f: ClearHandler) {
        *self.clear_console.write() = Some(f);
    }

    pub fn on_eval_complete(&self, f: CompleteHandler) {
        *self.eval_complete.write() = Some(f);
    }

    pub fn on_thread_started(&self, f: StartedHandler) {
        *self.thread_started.write() = Some(f);
    }

    pub fn write_output(&self, text: &str) {
        if let Some(f) = &*self.write_output.read() {
            f(text);
        }
    }

    pub fn read_input(&self, kind: &str, prompt: &str) -> String {
        match &*self.read_input.read() {
            Some(f) => f(kind, prompt),
            None => String::new(),
        }
    }

    pub fn clear_console(&self) {
        if let Some(f) = &*self.clear_console.read() {
            f();
        }
    }

    fn eval_complete(&self, event: &EvalComplete) {
        if let Some(f) = &*self.eval_complete.read() {
            f(event);
        }
    }

    fn thread_started(&self, id: usize) {
        if let Some(f) = &*self.thread_started.read() {
            f(id);
        }
    }
}

// ── Evaluator ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Evaluator {
    env: Arc<Environment>,
    modes: Arc<RwLock<Modes>>,
    answers: Arc<RwLock<VecDeque<Value>>>,
    events: Arc<EventHub>,
    threads: Arc<ThreadManager>,
    call_counter: Arc<AtomicUsize>,
    call_depth: Arc<AtomicUsize>,
    instance_counter: Arc<AtomicUsize>,
    scope: String,
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator {
            env: Arc::new(Environment::new()),
            modes: Arc::new(RwLock::new(Modes::default())),
            answers: Arc::new(RwLock::new(VecDeque::new())),
            events: Arc::new(EventHub::default()),
            threads: Arc::new(ThreadManager::new()),
            call_counter: Arc::new(AtomicUsize::new(0)),
            call_depth: Arc::new(AtomicUsize::new(0)),
            instance_counter: Arc::new(AtomicUsize::new(0)),
            scope: ROOT_SCOPE.to_string(),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn modes(&self) -> Modes {
        self.modes.read().clone()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    // ── Modes ───────────────────────────────────────────────────────

    pub fn set_option(&self, option: &str, value: &str) -> EvalResult<()> {
        let mut modes = self.modes.write();
        match option {
            "angle" => {
                modes.angle = match value {
                    "radian" => AngleMode::Radian,
                    "degree" => AngleMode::Degree,
                    "gradian" => AngleMode::Gradian,
                    other => {
                        return Err(CantusError::evaluator(format!(
                            "unknown angle mode '{}'",
                            other
                        )))
                    }
                }
            }
            "output" => {
                modes.output = match value {
                    "raw" => OutputFormat::Raw,
                    "math" => OutputFormat::Math,
                    "scientific" => OutputFormat::Scientific,
                    other => {
                        return Err(CantusError::evaluator(format!(
                            "unknown output format '{}'",
                            other
                        )))
                    }
                }
            }
            "tab" | "spacespertab" => {
                let n: usize = value
                    .parse()
                    .map_err(|_| CantusError::evaluator("tab width must be a positive integer"))?;
                if n == 0 {
                    return Err(CantusError::evaluator(
                        "tab width must be a positive integer",
                    ));
                }
                modes.spaces_per_tab = n;
            }
            "explicit" => modes.explicit = parse_bool(value)?,
            "truncate" => modes.always_truncate = parse_bool(value)?,
            "sigfigs" | "significant" => {
                let on = parse_bool(value)?;
                let entering = on && !modes.significant;
                modes.significant = on;
                drop(modes);
                if entering {
                    self.adopt_rendered_sig_figs();
                }
                return Ok(());
            }
            other => {
                return Err(CantusError::evaluator(format!(
                    "unknown option '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    /// On entry into significant mode, tracked precision is adopted from
    /// each stored number's rendered form.
    fn adopt_rendered_sig_figs(&self) {
        for var in self.env.all_vars() {
            let cell = var.reference.resolve_cell();
            let current = cell.get();
            if let Value::Num(n) = current {
                if !n.is_undefined() && n.sig_figs().is_none() {
                    let digits = n.digit_count();
                    cell.set(Value::Num(n.with_sig_figs(Some(digits))));
                }
            }
        }
    }

    // ── Answers ─────────────────────────────────────────────────────

    pub fn push_answer(&self, value: Value) {
        let mut answers = self.answers.write();
        answers.push_front(value);
        answers.truncate(MAX_ANSWERS);
    }

    pub fn answer(&self, back: usize) -> Option<Value> {
        self.answers.read().get(back).cloned()
    }

    // ── Core evaluation ─────────────────────────────────────────────

    pub fn eval(&self, source: &str) -> EvalResult<String> {
        self.eval_raw(source, false, false).map(|v| self.render(&v))
    }

    pub fn eval_raw(
        &self,
        source: &str,
        no_save_ans: bool,
        declarative: bool,
    ) -> EvalResult<Value> {
        let cancel = CancelToken::new();
        self.eval_raw_cancellable(source, no_save_ans, declarative, cancel)
    }

    pub fn eval_raw_cancellable(
        &self,
        source: &str,
        no_save_ans: bool,
        declarative: bool,
        cancel: CancelToken,
    ) -> EvalResult<Value> {
        let mut src = VecSource::new(source);
        let result = exec_script(
            self,
            &mut src,
            ExecOpts {
                scope: self.scope.clone(),
                declarative,
                top_level: true,
                no_save_ans,
                cancel,
                line_offset: 0,
            },
        )?;
        Ok(result.value.resolve())
    }

    pub fn eval_expr(&self, expr: &str, no_save_ans: bool, condition: bool) -> EvalResult<String> {
        let scope = self.scope.clone();
        let value = self
            .eval_expr_in(expr, &scope, condition, CancelToken::new())?
            .resolve();
        if !no_save_ans && !value.is_undefined() {
            self.push_answer(value.clone());
        }
        Ok(self.render(&value))
    }

    /// Tokenize and resolve one expression in a given scope.
    pub fn eval_expr_in(
        &self,
        expr: &str,
        scope: &str,
        condition: bool,
        cancel: CancelToken,
    ) -> EvalResult<Value> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(Value::undefined());
        }
        let modes = self.modes();
        let mut names = EvalNames {
            ev: self,
            scope: scope.to_string(),
            condition,
            cancel,
            significant: modes.significant,
            explicit: modes.explicit,
        };
        let list = tokenize(expr, &mut names)?;
        let ctx = OpCtx {
            env: &self.env,
            scope,
            explicit: modes.explicit,
            always_truncate: modes.always_truncate,
        };
        resolve_tokens(list, &ctx)
    }

    /// Evaluate lines as a feeder produces them, blocking on an empty
    /// queue until more work or end-of-stream arrives.
    pub fn eval_feeder(&self, feeder: Arc<crate::threads::ScriptFeeder>) -> EvalResult<Value> {
        let mut src = crate::threads::FeederSource(feeder);
        let result = exec_script(
            self,
            &mut src,
            ExecOpts {
                scope: self.scope.clone(),
                declarative: false,
                top_level: true,
                no_save_ans: false,
                cancel: CancelToken::new(),
                line_offset: 0,
            },
        )?;
        Ok(result.value.resolve())
    }

    /// Start a background evaluation; completion is announced through the
    /// `EvalComplete` event and the worker deregisters itself.
    pub fn eval_async(&self, source: &str, no_save_ans: bool, declarative: bool) -> usize {
        let (id, cancel) = self.threads.allocate();
        self.events.thread_started(id);
        let ev = self.clone();
        let text = source.to_string();
        let handle = std::thread::spawn(move || {
            debug!(worker = id, "async evaluation started");
            let result = ev.eval_raw_cancellable(&text, no_save_ans, declarative, cancel);
            ev.events.eval_complete(&EvalComplete {
                worker: id,
                result,
                expression: text,
                no_save_ans,
            });
            ev.threads.deregister(id);
        });
        self.threads.attach(id, handle);
        id
    }

    pub fn stop_all(&self, spare: Option<usize>) {
        self.threads.stop_all(spare);
    }

    pub fn active_workers(&self) -> usize {
        self.threads.active_count()
    }

    // ── Environment surface ─────────────────────────────────────────

    pub fn import(&self, scope_name: &str) {
        self.env.import(&combine(ROOT_SCOPE, scope_name));
    }

    pub fn unimport(&self, scope_name: &str) {
        self.env.unimport(&combine(ROOT_SCOPE, scope_name));
    }

    pub fn set_variable(
        &self,
        name: &str,
        value: Value,
        scope_name: Option<&str>,
        modifiers: HashSet<String>,
    ) {
        let scope_name = scope_name.unwrap_or(&self.scope);
        if let Some(existing) = self.env.find_var(name, scope_name) {
            existing.resolve_cell().set(value);
        } else {
            self.env.declare_var(name, value, scope_name, modifiers);
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.env
            .find_var(name, &self.scope)
            .map(|r| r.resolve_value())
    }

    /// Define a user function from a `name(args)` signature and a body.
    pub fn define_user_function(
        &self,
        signature: &str,
        body: &str,
        modifiers: &[&str],
    ) -> EvalResult<()> {
        let mods = modifiers.join(" ");
        let source = format!(
            "{}{}function {}\n{}",
            mods,
            if mods.is_empty() { "" } else { " " },
            signature,
            indent_block(body),
        );
        self.eval_raw(&source, true, true)?;
        Ok(())
    }

    pub fn define_user_class(
        &self,
        name: &str,
        body: &str,
        bases: &[&str],
        modifiers: &[&str],
    ) -> EvalResult<()> {
        let mods = modifiers.join(" ");
        let heritage = if bases.is_empty() {
            String::new()
        } else {
            format!(" : {}", bases.join(", "))
        };
        let source = format!(
            "{}{}class {}{}\n{}",
            mods,
            if mods.is_empty() { "" } else { " " },
            name,
            heritage,
            indent_block(body),
        );
        self.eval_raw(&source, true, true)?;
        Ok(())
    }

    pub fn clear_variables(&self) {
        self.env.clear_vars();
    }

    /// Reset to the root scope and re-import root + plugin scopes.
    pub fn clear_everything(&self) {
        self.env.clear_all();
        self.answers.write().clear();
        for plugin in crate::loader::plugin_scopes() {
            self.env.import(&plugin);
        }
    }

    // ── Copies ──────────────────────────────────────────────────────

    /// A handle sharing all state, rooted at a sub-scope.
    pub fn sub_evaluator(&self, scope_name: Option<&str>) -> Evaluator {
        let sub = match scope_name {
            Some(s) => combine(&self.scope, s),
            None => {
                let id = self.call_counter.fetch_add(1, Ordering::SeqCst);
                format!("{}.sub{}", self.scope, id)
            }
        };
        let mut clone = self.clone();
        clone.scope = sub;
        clone
    }

    /// An isolated evaluator: tables copied, every value cell reallocated.
    pub fn deep_copy(&self) -> Evaluator {
        let copy = self.isolated_clone();
        for var in self.env.all_vars() {
            let mut fresh = var.clone();
            fresh.reference = var.reference.deep_copy();
            copy.env.put_var(fresh);
        }
        copy
    }

    /// An isolated evaluator sharing value cells with this one.
    pub fn shallow_copy(&self) -> Evaluator {
        let copy = self.isolated_clone();
        for var in self.env.all_vars() {
            copy.env.put_var(var);
        }
        copy
    }

    fn isolated_clone(&self) -> Evaluator {
        let copy = Evaluator {
            env: Arc::new(Environment::new()),
            modes: Arc::new(RwLock::new(self.modes())),
            answers: Arc::new(RwLock::new(self.answers.read().clone())),
            events: Arc::clone(&self.events),
            threads: Arc::new(ThreadManager::new()),
            call_counter: Arc::new(AtomicUsize::new(0)),
            call_depth: Arc::new(AtomicUsize::new(0)),
            instance_counter: Arc::clone(&self.instance_counter),
            scope: self.scope.clone(),
        };
        for func in self.env.all_funcs() {
            copy.env.put_func(func);
        }
        for class in self.env.all_classes() {
            copy.env.put_class(class);
        }
        for import in self.env.imports() {
            copy.env.import(&import);
        }
        copy
    }

    // ── Loading ─────────────────────────────────────────────────────

    pub fn load(&self, path: &str, as_internal: bool, import: bool) -> EvalResult<String> {
        crate::loader::load(self, path, as_internal, import)
    }

    // ── Rendering ───────────────────────────────────────────────────

    pub fn render(&self, value: &Value) -> String {
        let value = value.resolve();
        let modes = self.modes();
        match &value {
            Value::Num(n) => match modes.output {
                OutputFormat::Scientific => n.to_scientific_string(),
                OutputFormat::Raw | OutputFormat::Math => {
                    if modes.significant {
                        let mut rounded = n.clone();
                        rounded.round_to_sig_figs();
                        rounded.to_output_string()
                    } else {
                        n.to_output_string()
                    }
                }
            },
            other => other.display(),
        }
    }

    // ── Call dispatch (identifier resolution, C8 protocol) ──────────

    fn enter_call(&self) -> EvalResult<DepthGuard<'_>> {
        let depth = self.call_depth.fetch_add(1, Ordering::SeqCst);
        if depth >= MAX_CALL_DEPTH {
            self.call_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(CantusError::evaluator(
                "call stack overflow, check for infinite recursion",
            ));
        }
        Ok(DepthGuard(&self.call_depth))
    }

    fn dispatch_call(
        &self,
        name: &str,
        scope: &str,
        args: Vec<Value>,
        named: IndexMap<String, Value>,
        receiver: Option<Value>,
        cancel: CancelToken,
    ) -> EvalResult<Value> {
        let _guard = self.enter_call()?;

        if let Some(recv) = receiver {
            return self.call_method_on(recv, name, scope, args, named, cancel);
        }
        // A bare leading dot resolves the receiver as `this`.
        if let Some(method) = name.strip_prefix('.') {
            let this = self
                .env
                .find_var("this", scope)
                .ok_or_else(|| CantusError::new(ErrorKind::UndefinedVariable("this".into())))?;
            return self.call_method_on(Value::Ref(this), method, scope, args, named, cancel);
        }
        if let Some(class) = self.env.find_class(name, scope) {
            return self.construct(&class, args, named, cancel);
        }
        if let Some(func) = self.env.find_func(name, scope) {
            return self.call_user_function(&func, scope, args, named, cancel);
        }
        // Dotted names try instance-receiver lowering first so field
        // lambdas get `this` bound; a namespaced lambda variable is the
        // fallback.
        if name.contains('.') {
            let mut prefix = name;
            while let Some(i) = prefix.rfind('.') {
                prefix = &name[..i];
                let rest = &name[i + 1..];
                if let Some(var) = self.env.find_var(prefix, scope) {
                    return self.call_method_on(
                        Value::Ref(var),
                        rest,
                        scope,
                        args,
                        named,
                        cancel,
                    );
                }
            }
        }
        if let Some(var) = self.env.find_var(name, scope) {
            if let Value::Lambda(lambda) = var.resolve_value() {
                return self.call_lambda(&lambda, args, named, None, cancel);
            }
        }
        if let Some(builtin) = intrinsics::builtin(name) {
            return self.call_builtin(builtin, scope, args, named);
        }
        Err(CantusError::new(ErrorKind::UndefinedFunction(
            name.to_string(),
        )))
    }

    /// `receiver.method(args)` lowered to `method(receiver, args)` unless
    /// the method is an instance field holding a lambda.
    fn call_method_on(
        &self,
        receiver: Value,
        method_path: &str,
        scope: &str,
        args: Vec<Value>,
        named: IndexMap<String, Value>,
        cancel: CancelToken,
    ) -> EvalResult<Value> {
        let parts: Vec<&str> = method_path.split('.').collect();
        let mut owner = receiver;
        for (idx, part) in parts.iter().enumerate() {
            let is_last = idx + 1 == parts.len();
            let resolved = owner.resolve();
            if let Value::Instance(inst) = &resolved {
                let field = inst.read().field(part, &self.env);
                if let Some(field_ref) = field {
                    if !is_last {
                        owner = Value::Ref(field_ref);
                        continue;
                    }
                    if let Value::Lambda(lambda) = field_ref.resolve_value() {
                        return self.call_lambda(
                            &lambda,
                            args,
                            named,
                            Some(resolved.clone()),
                            cancel,
                        );
                    }
                    return Err(CantusError::evaluator(format!(
                        "field '{}' is not callable",
                        part
                    )));
                }
            }
            if !is_last {
                return Err(CantusError::evaluator(format!(
                    "'{}' has no member '{}'",
                    resolved.type_name(),
                    part
                )));
            }
            // Self-referring lowering: the receiver becomes the first
            // argument, by reference.
            let mut lowered = Vec::with_capacity(args.len() + 1);
            lowered.push(owner);
            lowered.extend(args);
            if let Some(func) = self.env.find_func(part, scope) {
                return self.call_user_function(&func, scope, lowered, named, cancel);
            }
            if let Some(builtin) = intrinsics::builtin(part) {
                return self.call_builtin(builtin, scope, lowered, named);
            }
            return Err(CantusError::new(ErrorKind::UndefinedFunction(
                part.to_string(),
            )));
        }
        Err(CantusError::new(ErrorKind::UndefinedFunction(
            method_path.to_string(),
        )))
    }

    fn call_builtin(
        &self,
        builtin: &Builtin,
        scope: &str,
        args: Vec<Value>,
        named: IndexMap<String, Value>,
    ) -> EvalResult<Value> {
        if !named.is_empty() {
            return Err(CantusError::evaluator(format!(
                "'{}' does not accept named arguments",
                builtin.name
            )));
        }
        if args.len() < builtin.min_args || args.len() > builtin.max_args {
            return Err(CantusError::new(ErrorKind::Arity {
                name: builtin.name.to_string(),
                min: builtin.min_args,
                max: builtin.max_args.min(64),
                got: args.len(),
            }));
        }
        let args = if builtin.by_reference {
            args
        } else {
            // The receiver slot keeps its reference even for read-only
            // built-ins; plain arguments resolve.
            args.into_iter().map(|v| v.get_value()).collect()
        };
        let ctx = BuiltinCtx { ev: self, scope };
        (builtin.func)(&ctx, args)
    }

    pub fn call_user_function(
        &self,
        func: &UserFunction,
        caller_scope: &str,
        args: Vec<Value>,
        named: IndexMap<String, Value>,
        cancel: CancelToken,
    ) -> EvalResult<Value> {
        let required = func.required_args();
        if args.len() < required.saturating_sub(named.len()) || args.len() > func.arg_names.len() {
            return Err(CantusError::new(ErrorKind::Arity {
                name: func.name.clone(),
                min: required,
                max: func.arg_names.len(),
                got: args.len(),
            }));
        }
        let id = self.call_counter.fetch_add(1, Ordering::SeqCst);
        let call_scope = format!("{}.{}{}", caller_scope, func.name, id);
        self.bind_arguments(
            &func.arg_names,
            &func.defaults,
            &func.name,
            args,
            named,
            &call_scope,
        )?;
        debug!(function = %func.name, scope = %call_scope, "call");
        let result = exec_lines(
            self,
            &func.body,
            ExecOpts {
                scope: call_scope,
                declarative: false,
                top_level: false,
                no_save_ans: true,
                cancel,
                line_offset: 0,
            },
        )
        .map_err(|e| {
            if e.is_cancelled() {
                e
            } else {
                let line = e.line;
                e.in_function(&func.name, &func.declaring_scope, line)
            }
        })?;
        match result.code {
            Code::Return | Code::Resume | Code::BreakLevel => Ok(result.value.resolve()),
            Code::Break => Err(CantusError::new(ErrorKind::NotInLoop("break".into()))),
            Code::Continue => Err(CantusError::new(ErrorKind::NotInLoop("continue".into()))),
        }
    }

    fn bind_arguments(
        &self,
        arg_names: &[String],
        defaults: &[Option<Value>],
        func_name: &str,
        args: Vec<Value>,
        mut named: IndexMap<String, Value>,
        call_scope: &str,
    ) -> EvalResult<()> {
        for (name, _) in named.iter() {
            if !arg_names.contains(name) {
                return Err(CantusError::evaluator(format!(
                    "'{}' has no parameter named '{}'",
                    func_name, name
                )));
            }
        }
        let mut args = args.into_iter();
        for (i, arg_name) in arg_names.iter().enumerate() {
            let value = match args.next() {
                Some(v) => v,
                None => match named.shift_remove(arg_name) {
                    Some(v) => v,
                    None => match defaults.get(i).and_then(|d| d.clone()) {
                        Some(default) => default.deep_copy(),
                        None => {
                            return Err(CantusError::new(ErrorKind::Arity {
                                name: func_name.to_string(),
                                min: defaults.iter().take_while(|d| d.is_none()).count(),
                                max: arg_names.len(),
                                got: i,
                            }))
                        }
                    },
                },
            };
            self.env
                .declare_var(arg_name, value, call_scope, HashSet::new());
        }
        Ok(())
    }

    pub fn call_lambda(
        &self,
        lambda: &Lambda,
        args: Vec<Value>,
        named: IndexMap<String, Value>,
        this: Option<Value>,
        cancel: CancelToken,
    ) -> EvalResult<Value> {
        if args.len() > lambda.arg_names.len() {
            return Err(CantusError::new(ErrorKind::Arity {
                name: "lambda".into(),
                min: lambda.arg_names.len(),
                max: lambda.arg_names.len(),
                got: args.len(),
            }));
        }
        let id = self.call_counter.fetch_add(1, Ordering::SeqCst);
        let call_scope = format!("{}.lambda{}", lambda.captured_scope, id);
        if let Some(this_value) = this {
            self.env
                .declare_var("this", this_value, &call_scope, HashSet::new());
        }
        let defaults: Vec<Option<Value>> = vec![None; lambda.arg_names.len()];
        self.bind_arguments(&lambda.arg_names, &defaults, "lambda", args, named, &call_scope)?;
        if lambda.is_block {
            let result = exec_lines(
                self,
                &lambda.body,
                ExecOpts {
                    scope: call_scope,
                    declarative: false,
                    top_level: false,
                    no_save_ans: true,
                    cancel,
                    line_offset: 0,
                },
            )?;
            Ok(result.value.resolve())
        } else {
            Ok(self
                .eval_expr_in(&lambda.body, &call_scope, false, cancel)?
                .resolve())
        }
    }

    /// Class construction: deep-copied fields, receiver-bound `init`,
    /// with the constructor skipped for empty argument lists when `init`
    /// requires parameters.
    pub fn construct(
        &self,
        class: &UserClass,
        args: Vec<Value>,
        named: IndexMap<String, Value>,
        cancel: CancelToken,
    ) -> EvalResult<Value> {
        let fields = crate::statements::copy_fields(&class.all_fields(&self.env));
        let id = self.instance_counter.fetch_add(1, Ordering::SeqCst);
        let instance = Arc::new(RwLock::new(ClassInstance {
            class_name: class.full_name(),
            fields,
            inner_scope: format!("{}@{}", class.inner_scope, id),
        }));
        let value = Value::Instance(Arc::clone(&instance));
        let init = instance.read().field("init", &self.env);
        if let Some(init_ref) = init {
            if let Value::Lambda(init_lambda) = init_ref.resolve_value() {
                let skip = args.is_empty() && named.is_empty() && !init_lambda.arg_names.is_empty();
                if !skip {
                    self.call_lambda(&init_lambda, args, named, Some(value.clone()), cancel)?;
                }
            }
        }
        Ok(value)
    }

    // ── Serialization ───────────────────────────────────────────────

    /// Emit a reloadable script of the evaluator state: modes, classes in
    /// inheritance-dependency order, user functions, then non-internal
    /// variables.
    pub fn serialize(&self) -> String {
        let modes = self.modes();
        let mut out = String::new();
        out.push_str(&format!(
            "set angle {}\n",
            match modes.angle {
                AngleMode::Radian => "radian",
                AngleMode::Degree => "degree",
                AngleMode::Gradian => "gradian",
            }
        ));
        out.push_str(&format!(
            "set output {}\n",
            match modes.output {
                OutputFormat::Raw => "raw",
                OutputFormat::Math => "math",
                OutputFormat::Scientific => "scientific",
            }
        ));
        out.push_str(&format!("set explicit {}\n", modes.explicit));
        out.push_str(&format!("set sigfigs {}\n", modes.significant));

        // Classes: a class appears after every base it depends on.
        let classes = self.env.all_classes();
        let mut visited: HashSet<String> = HashSet::new();
        let mut ordered: Vec<UserClass> = Vec::new();
        for class in &classes {
            visit_class(class, &classes, &mut visited, &mut ordered);
        }
        for class in ordered {
            if class.is_internal() || is_external(&class.declaring_scope, ROOT_SCOPE) {
                continue;
            }
            let heritage = if class.base_classes.is_empty() {
                String::new()
            } else {
                let short: Vec<String> = class
                    .base_classes
                    .iter()
                    .map(|b| scope::remove_redundant_scope(b, &class.declaring_scope))
                    .collect();
                format!(" : {}", short.join(", "))
            };
            out.push_str(&format!(
                "class {}{}\n{}\n",
                class.name,
                heritage,
                indent_block(&class.body)
            ));
        }

        let mut funcs = self.env.all_funcs();
        funcs.sort_by(|a, b| a.full_name().cmp(&b.full_name()));
        for func in funcs {
            if func.is_internal() || is_external(&func.declaring_scope, ROOT_SCOPE) {
                continue;
            }
            // Class methods are serialized with their class body.
            if self.env.is_class_scope(&func.declaring_scope) {
                continue;
            }
            out.push_str(&format!(
                "function {}\n{}\n",
                func.signature(),
                indent_block(&func.body)
            ));
        }

        let mut vars = self.env.all_vars();
        vars.sort_by(|a, b| a.full_name().cmp(&b.full_name()));
        for var in vars {
            if var.is_internal() || is_external(&var.declaring_scope, ROOT_SCOPE) {
                continue;
            }
            let target = scope::remove_redundant_scope(&var.full_name(), ROOT_SCOPE);
            match var.reference.resolve_value() {
                Value::Instance(inst) => {
                    let inner = inst.read();
                    let class_short =
                        scope::remove_redundant_scope(&inner.class_name, ROOT_SCOPE);
                    out.push_str(&format!("{} = {}()\n", target, class_short));
                    for (field, r) in &inner.fields {
                        let field_value = r.resolve_value();
                        if matches!(field_value, Value::Lambda(_)) {
                            continue;
                        }
                        out.push_str(&format!(
                            "{}.{} = {}\n",
                            target,
                            field,
                            field_value.repr()
                        ));
                    }
                }
                other => {
                    out.push_str(&format!("{} = {}\n", target, other.repr()));
                }
            }
        }
        out
    }
}

fn visit_class(
    class: &UserClass,
    all: &[UserClass],
    visited: &mut HashSet<String>,
    ordered: &mut Vec<UserClass>,
) {
    if !visited.insert(class.full_name()) {
        return;
    }
    for base in &class.base_classes {
        if let Some(base_class) = all.iter().find(|c| &c.full_name() == base) {
            visit_class(base_class, all, visited, ordered);
        }
    }
    ordered.push(class.clone());
}

struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn parse_bool(value: &str) -> EvalResult<bool> {
    match value {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        other => Err(CantusError::evaluator(format!(
            "expected true or false, got '{}'",
            other
        ))),
    }
}

fn indent_block(body: &str) -> String {
    body.lines()
        .map(|l| format!("    {}", l))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Identifier resolution seam ──────────────────────────────────────────

struct EvalNames<'a> {
    ev: &'a Evaluator,
    scope: String,
    condition: bool,
    cancel: CancelToken,
    significant: bool,
    explicit: bool,
}

impl EvalNames<'_> {
    /// Evaluate call arguments: comma-separated expressions in condition
    /// mode; `name := value` entries feed the named mapping and must
    /// follow every positional argument.
    fn parse_args(
        &mut self,
        args_src: &str,
    ) -> EvalResult<(Vec<Value>, IndexMap<String, Value>)> {
        let mut positional = Vec::new();
        let mut named: IndexMap<String, Value> = IndexMap::new();
        for part in split_top_level(args_src, ',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match find_top_level(part, ":=") {
                Some(at) => {
                    let name = part[..at].trim().to_string();
                    let value = self
                        .ev
                        .eval_expr_in(part[at + 2..].trim(), &self.scope, true, self.cancel.clone())?;
                    named.insert(name, value);
                }
                None => {
                    if !named.is_empty() {
                        return Err(CantusError::new(ErrorKind::NamedParameterOrder));
                    }
                    positional.push(self.ev.eval_expr_in(
                        part,
                        &self.scope,
                        true,
                        self.cancel.clone(),
                    )?);
                }
            }
        }
        Ok((positional, named))
    }
}

impl NameContext for EvalNames<'_> {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn significant_mode(&self) -> bool {
        self.significant
    }

    fn condition_mode(&self) -> bool {
        self.condition
    }

    fn is_known(&self, name: &str) -> bool {
        self.ev.env.find_var(name, &self.scope).is_some() || intrinsics::is_constant(name)
    }

    fn variable(&mut self, name: &str) -> EvalResult<Value> {
        if let Some(r) = self.ev.env.find_var(name, &self.scope) {
            return Ok(Value::Ref(r));
        }
        if let Some(constant) = intrinsics::constant(name) {
            return Ok(constant);
        }
        if self.explicit {
            return Err(CantusError::new(ErrorKind::UndefinedVariable(
                name.to_string(),
            )));
        }
        if let Some(class) = self.ev.env.class_of_scope(&self.scope) {
            if !class.fields.contains_key(name) {
                return Err(CantusError::new(ErrorKind::UndefinedVariable(
                    name.to_string(),
                )));
            }
        }
        let var = self
            .ev
            .env
            .declare_var(name, Value::undefined(), &self.scope, HashSet::new());
        Ok(Value::Ref(var.reference))
    }

    fn assign_target(&mut self, name: &str) -> EvalResult<Value> {
        if let Some(r) = self.ev.env.find_var(name, &self.scope) {
            return Ok(Value::Ref(r));
        }
        if let Some(class) = self.ev.env.class_of_scope(&self.scope) {
            if !class.fields.contains_key(name) {
                return Err(CantusError::new(ErrorKind::UndefinedVariable(
                    name.to_string(),
                )));
            }
        }
        // Left for the assignment executor to declare on demand.
        Ok(Value::Ident(name.to_string()))
    }

    fn call(
        &mut self,
        name: &str,
        args_src: &str,
        receiver: Option<Value>,
    ) -> EvalResult<Value> {
        let (args, named) = self.parse_args(args_src)?;
        self.ev.dispatch_call(
            name,
            &self.scope,
            args,
            named,
            receiver,
            self.cancel.clone(),
        )
    }

    fn eval_sub(&mut self, expr: &str, condition: bool) -> EvalResult<Value> {
        self.ev
            .eval_expr_in(expr, &self.scope, condition, self.cancel.clone())
    }
}
