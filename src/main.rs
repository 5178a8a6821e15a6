use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt};

use fixpt::assemble::{self, AsmError};
use fixpt::bytecode::{self, Tables};
use fixpt::diagnostic::{Diagnostic, ansi::AnsiRenderer, json, registry};
use fixpt::vm::{Code, Function, Globals, Value};
use fixpt::{FixError, Fixed, fix, transform};

#[derive(Parser, Debug)]
#[command(name = "fixpt", version)]
#[command(about = "Turn a step routine into the fixed point of its iteration")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Never colour diagnostics
    #[arg(long, global = true)]
    no_color: bool,

    /// Print diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Iterate a routine to its fixed point and print it
    Run {
        /// Assembly file holding the routine
        file: PathBuf,

        /// Routine to iterate; defaults to the last one in the file
        #[arg(long)]
        routine: Option<String>,

        /// Starting value, written as an assembly literal
        #[arg(long)]
        init: Option<String>,

        /// Give up after this many step calls
        #[arg(long)]
        max_iterations: Option<i64>,
    },
    /// Disassemble a routine
    Dis {
        file: PathBuf,
        #[arg(long)]
        routine: Option<String>,
        /// Show the single-step routine instead of the original
        #[arg(long)]
        rewritten: bool,
    },
    /// Dump a routine's code object as JSON
    Emit {
        file: PathBuf,
        #[arg(long)]
        routine: Option<String>,
        /// Dump the single-step routine instead of the original
        #[arg(long)]
        rewritten: bool,
    },
    /// Explain an error code such as FXP-D001
    Explain {
        code: Option<String>,
        /// List every code with a one-line summary
        #[arg(long)]
        list: bool,
    },
}

/// Install a fmt subscriber on stderr.
///
/// `RUST_LOG` wins over `-v` when set.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "warn,fixpt=debug",
        _ => "warn,fixpt=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// A failure on its way to the user, with the source text when it points into one.
struct Failure(Diagnostic);

impl From<FixError> for Failure {
    fn from(e: FixError) -> Self {
        Failure(Diagnostic::from(&e))
    }
}

fn load(path: &Path) -> Result<Vec<Arc<Function>>, Failure> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| Failure(Diagnostic::error(format!("cannot read {}: {e}", path.display()))))?;
    let globals = Globals::new();
    let functions = assemble::load_module(&source, &globals)
        .map_err(|e: AsmError| Failure(Diagnostic::from(&e).with_source(source.clone())))?;
    debug!(file = %path.display(), routines = functions.len(), "module loaded");
    Ok(functions)
}

fn select(functions: &[Arc<Function>], routine: Option<&str>) -> Result<Arc<Function>, Failure> {
    let found = match routine {
        Some(name) => functions.iter().find(|f| f.name() == name),
        None => functions.last(),
    };
    found.cloned().ok_or_else(|| {
        let message = match routine {
            Some(name) => format!("no routine named '{name}'"),
            None => "the file defines no routines".to_string(),
        };
        let mut d = Diagnostic::error(message);
        let names: Vec<&str> = functions.iter().map(|f| f.name()).collect();
        if !names.is_empty() {
            d = d.with_note(format!("defined: {}", names.join(", ")));
        }
        Failure(d)
    })
}

fn code_for(func: &Function, rewritten: bool) -> Result<Arc<Code>, Failure> {
    if rewritten {
        Ok(Arc::clone(&transform(func)?.code))
    } else {
        Ok(Arc::clone(&func.code))
    }
}

fn run(command: Command) -> Result<(), Failure> {
    match command {
        Command::Run { file, routine, init, max_iterations } => {
            let functions = load(&file)?;
            let func = select(&functions, routine.as_deref())?;

            let mut kwargs: Vec<(&str, Value)> = Vec::new();
            if let Some(text) = &init {
                let lit = assemble::parse_literal(text)
                    .map_err(|e| Failure(Diagnostic::from(&e).with_source(text.clone())))?;
                kwargs.push(("init", Value::from(&lit.to_const())));
            }
            if let Some(n) = max_iterations {
                kwargs.push(("max_iterations", Value::Int(n)));
            }

            if let Fixed::Value(v) = fix(&[Value::Function(func)], &kwargs)? {
                println!("{v}");
            }
        }
        Command::Dis { file, routine, rewritten } => {
            let functions = load(&file)?;
            let func = select(&functions, routine.as_deref())?;
            let code = code_for(&func, rewritten)?;
            let program = bytecode::decode(&code.code, &code.consts).map_err(FixError::from)?;
            let cells = code.cell_names();
            let tables = Tables {
                varnames: &code.varnames,
                names: &code.names,
                cells: &cells,
                consts: &code.consts,
            };
            println!(
                "{} (argcount={}, stacksize={}, flags={:#x})",
                code.name, code.argcount, code.stacksize, code.flags
            );
            print!("{}", program.listing(tables));
        }
        Command::Emit { file, routine, rewritten } => {
            let functions = load(&file)?;
            let func = select(&functions, routine.as_deref())?;
            let code = code_for(&func, rewritten)?;
            let out = serde_json::to_string_pretty(&*code)
                .map_err(|e| Failure(Diagnostic::error(format!("serialization error: {e}"))))?;
            println!("{out}");
        }
        Command::Explain { code, list } => {
            let Some(code) = code.filter(|_| !list) else {
                for entry in registry::REGISTRY {
                    println!("{}  {}", entry.code, entry.short);
                }
                return Ok(());
            };
            let entry = registry::lookup(&code.to_ascii_uppercase())
                .ok_or_else(|| Failure(Diagnostic::error(format!("unknown error code '{code}'"))))?;
            print!("{}", entry.long);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure(d)) => {
            if cli.json {
                eprintln!("{}", json::render(&d));
            } else {
                let use_color = !cli.no_color && std::io::stderr().is_terminal();
                eprint!("{}", AnsiRenderer { use_color }.render(&d));
            }
            ExitCode::FAILURE
        }
    }
}
