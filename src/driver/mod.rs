//! Iterate a rewritten step routine until its state stops changing.

use tracing::{debug, trace, warn};

use crate::vm::{Function, Value, VmError};

/// Default bound on step calls before giving up.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// One application of a rewritten step routine.
///
/// Called with the state spread positionally. Must answer a tuple
/// `(stop, value, arg1, ..)`.
pub trait Step {
    fn step(&self, state: &[Value]) -> Result<Value, VmError>;
}

impl Step for Function {
    fn step(&self, state: &[Value]) -> Result<Value, VmError> {
        self.call(state)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("no fixed point reached after {max_iterations} iterations")]
pub struct DivergenceError {
    pub max_iterations: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IterateError {
    #[error(transparent)]
    Divergence(#[from] DivergenceError),
    #[error("step returned {found}, expected a tuple of at least two elements")]
    MalformedResult { found: String },
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Run `step` from `(init,)` until the running value stops changing or the
/// routine signals a stop.
pub fn iterate<S: Step + ?Sized>(
    step: &S,
    init: Value,
    max_iterations: usize,
) -> Result<Value, IterateError> {
    let mut state: Vec<Value> = vec![init];

    for iteration in 0..max_iterations {
        let result = step.step(&state)?;
        let Value::Tuple(items) = &result else {
            return Err(IterateError::MalformedResult { found: result.to_string() });
        };
        let [stop, payload @ ..] = &items[..] else {
            return Err(IterateError::MalformedResult { found: result.to_string() });
        };
        let Some(value) = payload.first() else {
            return Err(IterateError::MalformedResult { found: result.to_string() });
        };

        if stop.is_truthy() || *value == state[0] {
            debug!(iteration, stopped = stop.is_truthy(), %value, "converged");
            return Ok(value.clone());
        }
        trace!(iteration, %value, "state changed");
        state = payload.to_vec();
    }

    warn!(max_iterations, "iteration bound exhausted");
    Err(DivergenceError { max_iterations }.into())
}
