/// Source-file loading for `.can` scripts.
///
/// `load` accepts absolute paths, relative paths, and scope-dotted names
/// resolved under an `include/` directory. A directory loads every `.can`
/// file below it. Each file runs inside a scope derived from its name and
/// can optionally be added to the import set.
use crate::errors::{CantusError, EvalResult};
use crate::evaluator::Evaluator;
use crate::scope::{combine, ROOT_SCOPE};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::debug;

const EXTENSION: &str = "can";

/// Plugin scopes loaded at startup; re-imported by `clear_everything`.
static PLUGIN_SCOPES: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub fn plugin_scopes() -> Vec<String> {
    PLUGIN_SCOPES.lock().clone()
}

pub fn load(ev: &Evaluator, path: &str, as_internal: bool, import: bool) -> EvalResult<String> {
    let resolved = resolve_path(path)
        .ok_or_else(|| CantusError::evaluator(format!("cannot find '{}'", path)))?;
    let scope_name = load_resolved(ev, &resolved, as_internal)?;
    if import {
        ev.env().import(&combine(ROOT_SCOPE, &scope_name));
    }
    Ok(scope_name)
}

fn load_resolved(ev: &Evaluator, path: &Path, as_internal: bool) -> EvalResult<String> {
    if path.is_dir() {
        let mut files = collect_can_files(path);
        files.sort();
        let scope_name = scope_name_of(path);
        for file in files {
            load_file(ev, &file, as_internal)?;
        }
        return Ok(scope_name);
    }
    load_file(ev, path, as_internal)
}

fn load_file(ev: &Evaluator, path: &Path, as_internal: bool) -> EvalResult<String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| CantusError::evaluator(format!("cannot read '{}': {}", path.display(), e)))?;
    let scope_name = scope_name_of(path);
    let full_scope = combine(ROOT_SCOPE, &scope_name);
    debug!(file = %path.display(), scope = %full_scope, "load");
    let sub = ev.sub_evaluator(Some(&scope_name));
    sub.eval_raw(&source, true, false)?;
    if as_internal {
        for var in ev.env().all_vars() {
            if crate::scope::is_parent(&full_scope, &var.declaring_scope) {
                let mut updated = var.clone();
                updated.modifiers.insert("internal".to_string());
                ev.env().put_var(updated);
            }
        }
    }
    Ok(scope_name)
}

fn resolve_path(path: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(path);
    for candidate in [
        direct.clone(),
        direct.with_extension(EXTENSION),
    ] {
        if candidate.exists() {
            return Some(candidate);
        }
    }
    // Scope-dotted form under include/: a.b -> include/a/b.can, checked
    // against the working directory and then the user's library directory.
    if path.contains('.') && !path.contains(std::path::MAIN_SEPARATOR) {
        let mut roots = vec![PathBuf::from("include")];
        if let Some(home) = dirs::home_dir() {
            roots.push(home.join(".cantus").join("include"));
        }
        for root in roots {
            let mut candidate = root;
            for part in path.split('.') {
                candidate.push(part);
            }
            if candidate.is_dir() {
                return Some(candidate);
            }
            let with_ext = candidate.with_extension(EXTENSION);
            if with_ext.exists() {
                return Some(with_ext);
            }
        }
    }
    None
}

fn collect_can_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(collect_can_files(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
            out.push(path);
        }
    }
    out
}

fn scope_name_of(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("loaded");
    let mut name: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Startup policy: load `plugin/` (imported), then `init.can` and `init/`
/// beside the executable.
pub fn run_startup(ev: &Evaluator) {
    let Some(base) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
    else {
        return;
    };
    let plugin_dir = base.join("plugin");
    if plugin_dir.is_dir() {
        let mut files = collect_can_files(&plugin_dir);
        files.sort();
        for file in files {
            match load_file(ev, &file, true) {
                Ok(scope_name) => {
                    let full = combine(ROOT_SCOPE, &scope_name);
                    ev.env().import(&full);
                    PLUGIN_SCOPES.lock().push(full);
                }
                Err(e) => ev
                    .events()
                    .write_output(&format!("plugin load failed: {}\n", e)),
            }
        }
    }
    for init in [base.join("init.can"), base.join("init")] {
        if init.exists() {
            if let Err(e) = load_resolved(ev, &init, false) {
                ev.events()
                    .write_output(&format!("init load failed: {}\n", e));
            }
        }
    }
}
