//! Entry point: turn a step routine into its fixed point.

use std::sync::Arc;

use tracing::debug;

use crate::bytecode::{self, DecodeError, EncodeError};
use crate::driver::{self, DEFAULT_MAX_ITERATIONS, IterateError};
use crate::rewrite::{self, RewriteError, RoutineTables};
use crate::vm::{Code, Function, GENERATOR, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UsageError {
    #[error("fix() takes at most 1 positional argument ({0} given)")]
    TooManyPositional(usize),
    #[error("fix() got an unexpected keyword argument '{0}'")]
    UnexpectedKeyword(String),
    #[error("fix() got multiple values for argument '{0}'")]
    DuplicateArgument(String),
    #[error("fix() func must be a routine, not '{0}'")]
    NotARoutine(&'static str),
    #[error("fix() max_iterations must be a non-negative integer, not {0}")]
    BadMaxIterations(String),
    #[error("fix() needs an initial value for '{0}'")]
    MissingInit(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FixError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Iterate(#[from] IterateError),
}

/// Build the single-iteration callable for `func`.
///
/// The result takes the routine's own name as a new first parameter and
/// answers `(stop, value, arg1, ..)`. Every parameter, including the new one,
/// has a default so it can be called with the running value alone.
pub fn transform(func: &Function) -> Result<Function, FixError> {
    let code = &*func.code;
    let program = bytecode::decode(&code.code, &code.consts)?;
    let rewritten = rewrite::rewrite(
        &program,
        RoutineTables {
            name: &code.name,
            argcount: code.argcount,
            varnames: &code.varnames,
            cellvars: &code.cellvars,
            freevars: &code.freevars,
            names: &code.names,
            consts: &code.consts,
        },
    )?;
    let bytes = bytecode::encode(&rewritten.program)?;

    let argcount = code.argcount + 1;
    let new_code = Code {
        name: code.name.clone(),
        argcount,
        flags: code.flags & !GENERATOR,
        stacksize: code.stacksize + code.argcount + 2,
        code: bytes,
        consts: rewritten.consts,
        names: code.names.clone(),
        varnames: rewritten.varnames,
        cellvars: code.cellvars.clone(),
        freevars: code.freevars.clone(),
    };

    let mut defaults = vec![Value::None; argcount.saturating_sub(func.defaults.len())];
    defaults.extend(func.defaults.iter().cloned());

    debug!(
        routine = %code.name,
        before = code.code.len(),
        after = new_code.code.len(),
        "transformed step routine"
    );
    Ok(func.with_code(new_code, defaults))
}

/// Fixed point of `func` starting from `init`.
pub fn fix_function(func: &Function, init: Value, max_iterations: usize) -> Result<Value, FixError> {
    let step = transform(func)?;
    Ok(driver::iterate(&step, init, max_iterations)?)
}

/// A `fix` call that has its settings but still waits for the routine.
#[derive(Debug, Clone)]
pub struct Decorator {
    init: Option<Value>,
    max_iterations: usize,
}

impl Decorator {
    pub fn apply(&self, func: &Function) -> Result<Value, FixError> {
        let init = self
            .init
            .clone()
            .ok_or_else(|| UsageError::MissingInit(func.name().to_string()))?;
        fix_function(func, init, self.max_iterations)
    }
}

#[derive(Debug)]
pub enum Fixed {
    Value(Value),
    Decorator(Decorator),
}

/// Dynamic entry point.
///
/// A single positional argument is the routine when it is one and the
/// initial value otherwise. Keywords: `init`, `func`, `max_iterations`.
/// Without a routine the answer is a [`Decorator`].
pub fn fix(args: &[Value], kwargs: &[(&str, Value)]) -> Result<Fixed, FixError> {
    if args.len() > 1 {
        return Err(UsageError::TooManyPositional(args.len()).into());
    }

    let mut func: Option<Arc<Function>> = None;
    let mut init: Option<Value> = None;
    let mut max_iterations: Option<usize> = None;

    match args.first() {
        Some(Value::Function(f)) => func = Some(Arc::clone(f)),
        Some(v) => init = Some(v.clone()),
        None => {}
    }

    for (key, value) in kwargs {
        match *key {
            "func" => {
                let Value::Function(f) = value else {
                    return Err(UsageError::NotARoutine(value.type_name()).into());
                };
                if func.replace(Arc::clone(f)).is_some() {
                    return Err(UsageError::DuplicateArgument("func".into()).into());
                }
            }
            "init" => {
                if init.replace(value.clone()).is_some() {
                    return Err(UsageError::DuplicateArgument("init".into()).into());
                }
            }
            "max_iterations" => {
                let bound = match value {
                    Value::Int(n) => usize::try_from(*n).ok(),
                    _ => None,
                };
                let Some(bound) = bound else {
                    return Err(UsageError::BadMaxIterations(value.to_string()).into());
                };
                if max_iterations.replace(bound).is_some() {
                    return Err(UsageError::DuplicateArgument("max_iterations".into()).into());
                }
            }
            other => return Err(UsageError::UnexpectedKeyword(other.to_string()).into()),
        }
    }

    let deco = Decorator {
        init,
        max_iterations: max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
    };
    match func {
        Some(f) => deco.apply(&f).map(Fixed::Value),
        None => Ok(Fixed::Decorator(deco)),
    }
}
