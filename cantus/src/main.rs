/// Cantus CLI (cantus)
/// Runs scripts, evaluates expressions, and hosts the REPL.
use cantus::{loader, Evaluator};
use clap::{Parser as ClapParser, Subcommand};
use colored::Colorize;
use miette::{miette, IntoDiagnostic, Result};
use std::io::{BufRead, Write};
use std::path::PathBuf;

// 64 MB stack for deeply recursive scripts.
const STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(ClapParser)]
#[command(
    name = "cantus",
    version = "0.1.0",
    about = "The Cantus math scripting language",
    long_about = "cantus — run, evaluate, and explore Cantus (.can) scripts."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a Cantus script (.can)
    Run {
        path: PathBuf,
        /// Skip the plugin/ and init.can startup scan
        #[arg(long)]
        no_startup: bool,
    },
    /// Evaluate a single expression and print the result
    Eval {
        expr: String,
    },
    /// Dump the evaluator state after running a script
    State {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let child = std::thread::Builder::new()
        .stack_size(STACK_SIZE)
        .spawn(move || dispatch(cli))
        .into_diagnostic()?;
    child.join().map_err(|_| miette!("interpreter thread panicked"))?
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Run { path, no_startup }) => {
            let ev = host_evaluator();
            if !no_startup {
                loader::run_startup(&ev);
            }
            let source = std::fs::read_to_string(&path).into_diagnostic()?;
            match ev.eval(&source) {
                Ok(result) => {
                    if !result.is_empty() && result != "undefined" {
                        println!("{}", result);
                    }
                    Ok(())
                }
                Err(e) => Err(miette!("{}", e)),
            }
        }
        Some(Commands::Eval { expr }) => {
            let ev = host_evaluator();
            match ev.eval_expr(&expr, false, false) {
                Ok(result) => {
                    println!("{}", result);
                    Ok(())
                }
                Err(e) => Err(miette!("{}", e)),
            }
        }
        Some(Commands::State { path }) => {
            let ev = host_evaluator();
            let source = std::fs::read_to_string(&path).into_diagnostic()?;
            ev.eval(&source).map_err(|e| miette!("{}", e))?;
            print!("{}", ev.serialize());
            Ok(())
        }
        None => repl(),
    }
}

fn host_evaluator() -> Evaluator {
    let ev = Evaluator::new();
    ev.events().on_write_output(Box::new(|text| {
        print!("{}", text);
        let _ = std::io::stdout().flush();
    }));
    ev.events().on_read_input(Box::new(|_kind, prompt| {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
        let mut reply = String::new();
        let _ = std::io::stdin().read_line(&mut reply);
        reply.trim_end_matches(['\r', '\n']).to_string()
    }));
    ev.events().on_clear_console(Box::new(|| {
        print!("\x1b[2J\x1b[H");
        let _ = std::io::stdout().flush();
    }));
    ev
}

const BLOCK_STARTERS: [&str; 13] = [
    "if", "while", "until", "for", "repeat", "run", "switch", "try", "function", "class",
    "namespace", "case", "else",
];

fn repl() -> Result<()> {
    let ev = host_evaluator();
    loader::run_startup(&ev);
    println!("{}", "cantus 0.1.0 — type expressions, blank line ends a block".dimmed());
    let stdin = std::io::stdin();
    let mut buffer = String::new();
    let mut in_block = false;
    loop {
        let prompt = if in_block { "... " } else { ">>> " };
        print!("{}", prompt.cyan());
        std::io::stdout().flush().into_diagnostic()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).into_diagnostic()? == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if !in_block {
            if line.trim() == "exit" || line.trim() == "quit" {
                break;
            }
            let first = line.trim().split_whitespace().next().unwrap_or("");
            if BLOCK_STARTERS.contains(&first) || line.trim_end().ends_with("=>") {
                buffer = line;
                buffer.push('\n');
                in_block = true;
                continue;
            }
            show(&ev, &line);
        } else if line.trim().is_empty() {
            let source = std::mem::take(&mut buffer);
            in_block = false;
            show(&ev, &source);
        } else {
            buffer.push_str(&line);
            buffer.push('\n');
        }
    }
    ev.stop_all(None);
    Ok(())
}

fn show(ev: &Evaluator, source: &str) {
    if source.trim().is_empty() {
        return;
    }
    match ev.eval(source) {
        Ok(result) => {
            if !result.is_empty() && result != "undefined" {
                println!("{}", result.green());
            }
        }
        Err(e) => eprintln!("{}", e.to_string().red()),
    }
}
