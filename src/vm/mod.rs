//! Bundled host runtime: code objects, functions and a stack interpreter.
//!
//! The transformation pipeline only needs the parts a host exposes (raw bytes,
//! name tables, constants, defaults, flags) and a factory that turns new parts
//! back into a callable. This module is that host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::opcode::*;

mod builtins;
mod value;

pub use builtins::Builtin;
pub use value::{Const, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("{name}() takes {expected} positional arguments but {given} were given")]
    TooManyArguments { name: String, expected: usize, given: usize },
    #[error("{name}() missing required argument '{param}'")]
    MissingArgument { name: String, param: String },
    #[error("{name}() is a generator routine and cannot be called directly")]
    GeneratorCall { name: String },
    #[error("{name}() expects {expected} closure cells, got {given}")]
    ClosureMismatch { name: String, expected: usize, given: usize },
    #[error("local variable '{name}' referenced before assignment")]
    UnboundLocal { name: String },
    #[error("free variable '{name}' referenced before assignment")]
    UnboundCell { name: String },
    #[error("name '{name}' is not defined")]
    UndefinedGlobal { name: String },
    #[error("'{type_name}' object is not callable")]
    NotCallable { type_name: &'static str },
    #[error("{0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    Overflow,
    #[error("string result would exceed {} bytes", MAX_STR_LEN)]
    StringTooLong,
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("maximum call depth exceeded")]
    RecursionLimit,
    #[error("stack underflow at offset {offset} in {name}()")]
    StackUnderflow { name: String, offset: usize },
    #[error("yield outside of a generator routine")]
    UnexpectedYield,
    #[error("{name}() ran past the end of its code")]
    FellOffEnd { name: String },
    #[error("malformed instruction at offset {offset} in {name}()")]
    BadInstruction { name: String, offset: usize },
}

pub type VmResult<T> = Result<T, VmError>;

const MAX_DEPTH: usize = 256;
pub const MAX_STR_LEN: usize = 1 << 28;

// ── Code objects ─────────────────────────────────────────────────────

/// Flag set on routines that contain suspend points.
pub const GENERATOR: u32 = 0x20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub name: String,
    pub argcount: usize,
    pub flags: u32,
    pub stacksize: usize,
    pub code: Vec<u8>,
    pub consts: Vec<Const>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
}

impl Code {
    pub fn is_generator(&self) -> bool {
        self.flags & GENERATOR != 0
    }

    /// Cell slot names as addressed by `LOAD_DEREF`: cell variables, then free variables.
    pub fn cell_names(&self) -> Vec<String> {
        self.cellvars.iter().chain(&self.freevars).cloned().collect()
    }
}

// ── Globals ──────────────────────────────────────────────────────────

/// Module-level namespace shared by every function of a module.
#[derive(Debug, Default)]
pub struct Globals {
    vars: RwLock<HashMap<String, Value>>,
}

impl Globals {
    pub fn new() -> Arc<Self> {
        Arc::new(Globals::default())
    }

    /// Module binding first, builtin of the same name otherwise.
    pub fn get(&self, name: &str) -> Option<Value> {
        let vars = self.vars.read().unwrap_or_else(|e| e.into_inner());
        vars.get(name)
            .cloned()
            .or_else(|| Builtin::lookup(name).map(Value::Builtin))
    }

    pub fn set(&self, name: &str, value: Value) {
        let mut vars = self.vars.write().unwrap_or_else(|e| e.into_inner());
        vars.insert(name.to_string(), value);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut vars = self.vars.write().unwrap_or_else(|e| e.into_inner());
        vars.remove(name).is_some()
    }
}

// ── Functions ────────────────────────────────────────────────────────

/// A closure cell. `None` until bound.
pub type Cell = Arc<Mutex<Option<Value>>>;

pub fn new_cell(value: Option<Value>) -> Cell {
    Arc::new(Mutex::new(value))
}

pub struct Function {
    pub code: Arc<Code>,
    pub globals: Arc<Globals>,
    pub defaults: Vec<Value>,
    pub closure: Vec<Cell>,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.code.name)
            .field("argcount", &self.code.argcount)
            .field("defaults", &self.defaults.len())
            .finish()
    }
}

impl Function {
    pub fn new(code: Code, globals: Arc<Globals>) -> Self {
        Function { code: Arc::new(code), globals, defaults: Vec::new(), closure: Vec::new() }
    }

    pub fn with_defaults(mut self, defaults: Vec<Value>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_closure(mut self, closure: Vec<Cell>) -> Self {
        self.closure = closure;
        self
    }

    /// Build a sibling callable from new code, keeping this function's globals and closure.
    pub fn with_code(&self, code: Code, defaults: Vec<Value>) -> Function {
        Function {
            code: Arc::new(code),
            globals: Arc::clone(&self.globals),
            defaults,
            closure: self.closure.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.code.name
    }

    pub fn call(&self, args: &[Value]) -> VmResult<Value> {
        self.call_at(args, 0)
    }

    fn call_at(&self, args: &[Value], depth: usize) -> VmResult<Value> {
        if depth >= MAX_DEPTH {
            return Err(VmError::RecursionLimit);
        }
        trace!(name = %self.code.name, args = args.len(), depth, "call");
        Frame::bind(self, args, depth)?.run()
    }
}

fn call_value(callee: &Value, args: &[Value], depth: usize) -> VmResult<Value> {
    match callee {
        Value::Function(f) => f.call_at(args, depth),
        Value::Builtin(b) => b.call(args),
        other => Err(VmError::NotCallable { type_name: other.type_name() }),
    }
}

fn lock(cell: &Cell) -> std::sync::MutexGuard<'_, Option<Value>> {
    cell.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Interpreter ──────────────────────────────────────────────────────

struct Frame<'a> {
    func: &'a Function,
    locals: Vec<Option<Value>>,
    cells: Vec<Cell>,
    stack: Vec<Value>,
    depth: usize,
    /// Offset of the instruction being executed.
    at: usize,
}

impl<'a> Frame<'a> {
    fn bind(func: &'a Function, args: &[Value], depth: usize) -> VmResult<Self> {
        let code = &*func.code;
        let name = &code.name;
        if code.is_generator() {
            return Err(VmError::GeneratorCall { name: name.clone() });
        }
        if args.len() > code.argcount {
            return Err(VmError::TooManyArguments {
                name: name.clone(),
                expected: code.argcount,
                given: args.len(),
            });
        }
        if func.closure.len() != code.freevars.len() {
            return Err(VmError::ClosureMismatch {
                name: name.clone(),
                expected: code.freevars.len(),
                given: func.closure.len(),
            });
        }

        let mut locals: Vec<Option<Value>> = vec![None; code.varnames.len().max(code.argcount)];
        let first_default = code.argcount.saturating_sub(func.defaults.len());
        let skipped = func.defaults.len().saturating_sub(code.argcount);
        for (i, slot) in locals.iter_mut().enumerate().take(code.argcount) {
            let value = match args.get(i) {
                Some(v) => v.clone(),
                None if i >= first_default => func.defaults[skipped + i - first_default].clone(),
                None => {
                    return Err(VmError::MissingArgument {
                        name: name.clone(),
                        param: code.varnames.get(i).cloned().unwrap_or_default(),
                    });
                }
            };
            *slot = Some(value);
        }

        // Cell variables that shadow a parameter start out holding the argument.
        let mut cells: Vec<Cell> = code
            .cellvars
            .iter()
            .map(|cv| {
                let seed = code.varnames[..code.argcount.min(code.varnames.len())]
                    .iter()
                    .position(|v| v == cv)
                    .and_then(|i| locals[i].clone());
                new_cell(seed)
            })
            .collect();
        cells.extend(func.closure.iter().cloned());

        Ok(Frame {
            func,
            locals,
            cells,
            stack: Vec::with_capacity(code.stacksize),
            depth,
            at: 0,
        })
    }

    fn name(&self) -> String {
        self.func.code.name.clone()
    }

    fn bad_instruction(&self) -> VmError {
        VmError::BadInstruction { name: self.name(), offset: self.at }
    }

    fn pop(&mut self) -> VmResult<Value> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => Err(VmError::StackUnderflow { name: self.name(), offset: self.at }),
        }
    }

    fn top(&self) -> VmResult<&Value> {
        self.stack
            .last()
            .ok_or_else(|| VmError::StackUnderflow { name: self.name(), offset: self.at })
    }

    fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        if n > self.stack.len() {
            return Err(VmError::StackUnderflow { name: self.name(), offset: self.at });
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn table<'t>(&self, table: &'t [String], idx: u32) -> VmResult<&'t str> {
        table
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| self.bad_instruction())
    }

    fn cell(&self, idx: u32) -> VmResult<&Cell> {
        self.cells.get(idx as usize).ok_or_else(|| self.bad_instruction())
    }

    fn run(mut self) -> VmResult<Value> {
        let code = Arc::clone(&self.func.code);
        let raw = &code.code;
        let mut ip = 0;
        let mut extended: u32 = 0;

        loop {
            if extended == 0 {
                self.at = ip;
            }
            let Some(&byte) = raw.get(ip) else {
                return Err(VmError::FellOffEnd { name: self.name() });
            };
            let op = Opcode::from_byte(byte).ok_or_else(|| self.bad_instruction())?;
            ip += 1;
            let arg = if op.has_arg() {
                let bytes = raw.get(ip..ip + 2).ok_or_else(|| self.bad_instruction())?;
                ip += 2;
                if extended > MAX_SHORT_ARG {
                    return Err(self.bad_instruction());
                }
                (extended << 16) | u32::from(u16::from_le_bytes([bytes[0], bytes[1]]))
            } else {
                0
            };
            extended = 0;

            match op {
                Opcode::EXTENDED_ARG => extended = arg,

                Opcode::POP_TOP => {
                    self.pop()?;
                }
                Opcode::ROT_TWO => {
                    let a = self.pop()?;
                    let b = self.pop()?;
                    self.stack.push(a);
                    self.stack.push(b);
                }
                Opcode::ROT_THREE => {
                    let a = self.pop()?;
                    let b = self.pop()?;
                    let c = self.pop()?;
                    self.stack.push(a);
                    self.stack.push(c);
                    self.stack.push(b);
                }
                Opcode::DUP_TOP => {
                    let v = self.top()?.clone();
                    self.stack.push(v);
                }

                Opcode::UNARY_NEGATIVE => {
                    let v = match self.pop()? {
                        Value::Int(n) => Value::Int(n.checked_neg().ok_or(VmError::Overflow)?),
                        Value::Float(x) => Value::Float(-x),
                        other => {
                            return Err(VmError::Type(format!(
                                "bad operand type for unary -: '{}'",
                                other.type_name()
                            )));
                        }
                    };
                    self.stack.push(v);
                }
                Opcode::UNARY_NOT => {
                    let v = self.pop()?;
                    self.stack.push(Value::Bool(!v.is_truthy()));
                }
                Opcode::BINARY_MULTIPLY
                | Opcode::BINARY_MODULO
                | Opcode::BINARY_ADD
                | Opcode::BINARY_SUBTRACT
                | Opcode::BINARY_SUBSCR
                | Opcode::BINARY_TRUE_DIVIDE => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.stack.push(binary(op, &lhs, &rhs)?);
                }

                Opcode::GET_ITER => {
                    let items: Arc<[Value]> = match self.pop()? {
                        Value::Tuple(items) => items,
                        Value::Str(s) => s.chars().map(|c| Value::str(c.encode_utf8(&mut [0; 4]))).collect(),
                        Value::Iter { items, pos } => items[pos..].iter().cloned().collect(),
                        other => {
                            return Err(VmError::Type(format!(
                                "'{}' object is not iterable",
                                other.type_name()
                            )));
                        }
                    };
                    self.stack.push(Value::Iter { items, pos: 0 });
                }
                Opcode::FOR_ITER => {
                    let next = match self.stack.last_mut() {
                        Some(Value::Iter { items, pos }) => {
                            let item = items.get(*pos).cloned();
                            *pos += 1;
                            item
                        }
                        _ => return Err(self.bad_instruction()),
                    };
                    match next {
                        Some(item) => self.stack.push(item),
                        None => {
                            self.pop()?;
                            ip += arg as usize;
                        }
                    }
                }

                Opcode::RETURN_VALUE => return self.pop(),
                Opcode::YIELD_VALUE => return Err(VmError::UnexpectedYield),

                Opcode::LOAD_GLOBAL => {
                    let name = self.table(&code.names, arg)?;
                    let v = self
                        .func
                        .globals
                        .get(name)
                        .ok_or_else(|| VmError::UndefinedGlobal { name: name.to_string() })?;
                    self.stack.push(v);
                }
                Opcode::STORE_GLOBAL => {
                    let name = self.table(&code.names, arg)?;
                    let v = self.pop()?;
                    self.func.globals.set(name, v);
                }
                Opcode::DELETE_GLOBAL => {
                    let name = self.table(&code.names, arg)?;
                    if !self.func.globals.remove(name) {
                        return Err(VmError::UndefinedGlobal { name: name.to_string() });
                    }
                }
                Opcode::LOAD_CONST => {
                    let c = code.consts.get(arg as usize).ok_or_else(|| self.bad_instruction())?;
                    self.stack.push(Value::from(c));
                }
                Opcode::BUILD_TUPLE => {
                    let items = self.pop_n(arg as usize)?;
                    self.stack.push(Value::tuple(items));
                }
                Opcode::COMPARE_OP => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    self.stack.push(Value::Bool(compare(arg, &lhs, &rhs)?));
                }

                Opcode::JUMP_FORWARD => ip += arg as usize,
                Opcode::JUMP_ABSOLUTE => ip = arg as usize,
                Opcode::POP_JUMP_IF_FALSE | Opcode::POP_JUMP_IF_TRUE => {
                    let v = self.pop()?;
                    if v.is_truthy() == (op == Opcode::POP_JUMP_IF_TRUE) {
                        ip = arg as usize;
                    }
                }
                Opcode::JUMP_IF_FALSE_OR_POP | Opcode::JUMP_IF_TRUE_OR_POP => {
                    if self.top()?.is_truthy() == (op == Opcode::JUMP_IF_TRUE_OR_POP) {
                        ip = arg as usize;
                    } else {
                        self.pop()?;
                    }
                }

                Opcode::LOAD_FAST => {
                    let v = match self.locals.get(arg as usize) {
                        Some(Some(v)) => v.clone(),
                        Some(None) => {
                            let name = self.table(&code.varnames, arg)?;
                            return Err(VmError::UnboundLocal { name: name.to_string() });
                        }
                        None => return Err(self.bad_instruction()),
                    };
                    self.stack.push(v);
                }
                Opcode::STORE_FAST => {
                    let v = self.pop()?;
                    match self.locals.get_mut(arg as usize) {
                        Some(slot) => *slot = Some(v),
                        None => return Err(self.bad_instruction()),
                    }
                }
                Opcode::DELETE_FAST => {
                    let name = self.table(&code.varnames, arg)?.to_string();
                    match self.locals.get_mut(arg as usize).map(Option::take) {
                        Some(Some(_)) => {}
                        _ => return Err(VmError::UnboundLocal { name }),
                    }
                }

                Opcode::CALL_FUNCTION => {
                    let args = self.pop_n(arg as usize)?;
                    let callee = self.pop()?;
                    let result = call_value(&callee, &args, self.depth + 1)?;
                    self.stack.push(result);
                }

                Opcode::LOAD_DEREF => {
                    let v = lock(self.cell(arg)?).clone();
                    match v {
                        Some(v) => self.stack.push(v),
                        None => {
                            let names = code.cell_names();
                            let name = self.table(&names, arg)?.to_string();
                            return Err(VmError::UnboundCell { name });
                        }
                    }
                }
                Opcode::STORE_DEREF => {
                    let v = self.pop()?;
                    *lock(self.cell(arg)?) = Some(v);
                }
            }
        }
    }
}

fn type_error(op: &str, lhs: &Value, rhs: &Value) -> VmError {
    VmError::Type(format!(
        "unsupported operand types for {op}: '{}' and '{}'",
        lhs.type_name(),
        rhs.type_name()
    ))
}

fn int_result(n: Option<i64>) -> VmResult<Value> {
    n.map(Value::Int).ok_or(VmError::Overflow)
}

fn binary(op: Opcode, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    match (op, lhs, rhs) {
        (Opcode::BINARY_ADD, Value::Int(a), Value::Int(b)) => int_result(a.checked_add(*b)),
        (Opcode::BINARY_SUBTRACT, Value::Int(a), Value::Int(b)) => int_result(a.checked_sub(*b)),
        (Opcode::BINARY_MULTIPLY, Value::Int(a), Value::Int(b)) => int_result(a.checked_mul(*b)),
        (Opcode::BINARY_MODULO, Value::Int(_), Value::Int(0)) => Err(VmError::DivisionByZero),
        (Opcode::BINARY_MODULO, Value::Int(a), Value::Int(b)) => {
            // Result takes the sign of the divisor.
            let r = a.checked_rem(*b).ok_or(VmError::Overflow)?;
            Ok(Value::Int(if r != 0 && (r < 0) != (*b < 0) { r + b } else { r }))
        }

        (Opcode::BINARY_ADD, Value::Str(a), Value::Str(b)) => {
            if a.len() + b.len() > MAX_STR_LEN {
                return Err(VmError::StringTooLong);
            }
            Ok(Value::str(&format!("{a}{b}")))
        }
        (Opcode::BINARY_ADD, Value::Tuple(a), Value::Tuple(b)) => {
            Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        (Opcode::BINARY_MULTIPLY, Value::Str(s), Value::Int(n))
        | (Opcode::BINARY_MULTIPLY, Value::Int(n), Value::Str(s)) => {
            let count = usize::try_from((*n).max(0)).map_err(|_| VmError::StringTooLong)?;
            match s.len().checked_mul(count) {
                Some(len) if len <= MAX_STR_LEN => Ok(Value::str(&s.repeat(count))),
                _ => Err(VmError::StringTooLong),
            }
        }

        (Opcode::BINARY_SUBSCR, Value::Tuple(items), Value::Int(i)) => {
            index(items.len(), *i).map(|i| items[i].clone())
        }
        (Opcode::BINARY_SUBSCR, Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            index(chars.len(), *i).map(|i| Value::str(chars[i].encode_utf8(&mut [0; 4])))
        }

        (_, l, r) => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err(type_error(op.mnemonic(), lhs, rhs));
            };
            match op {
                Opcode::BINARY_ADD => Ok(Value::Float(a + b)),
                Opcode::BINARY_SUBTRACT => Ok(Value::Float(a - b)),
                Opcode::BINARY_MULTIPLY => Ok(Value::Float(a * b)),
                Opcode::BINARY_TRUE_DIVIDE | Opcode::BINARY_MODULO if b == 0.0 => {
                    Err(VmError::DivisionByZero)
                }
                Opcode::BINARY_TRUE_DIVIDE => Ok(Value::Float(a / b)),
                Opcode::BINARY_MODULO => Ok(Value::Float(a - b * (a / b).floor())),
                _ => Err(type_error(op.mnemonic(), lhs, rhs)),
            }
        }
    }
}

fn index(len: usize, i: i64) -> VmResult<usize> {
    let idx = if i < 0 { len as i64 + i } else { i };
    if (0..len as i64).contains(&idx) {
        Ok(idx as usize)
    } else {
        Err(VmError::IndexOutOfRange)
    }
}

fn compare(kind: u32, lhs: &Value, rhs: &Value) -> VmResult<bool> {
    use std::cmp::Ordering;

    match kind {
        CMP_EQ => return Ok(lhs == rhs),
        CMP_NE => return Ok(lhs != rhs),
        _ => {}
    }
    let ordering = match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => return Err(type_error("comparison", lhs, rhs)),
        },
    };
    // NaN compares false under every ordering.
    let Some(ord) = ordering else { return Ok(false) };
    match kind {
        CMP_LT => Ok(ord == Ordering::Less),
        CMP_LE => Ok(ord != Ordering::Greater),
        CMP_GT => Ok(ord == Ordering::Greater),
        CMP_GE => Ok(ord != Ordering::Less),
        _ => Err(VmError::Type(format!("unknown comparison {kind}"))),
    }
}
