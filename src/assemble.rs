//! Lower parsed routines to code objects and bind them into a module.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::ast::{Line, Literal, Module, Operand, ParamDefault, Routine, Span, Spanned};
use crate::bytecode::{self, EncodeError, Exit, Instr, Label, Program};
use crate::lexer::{self, LexError};
use crate::opcode::{Opcode, OperandKind, compare_from_name};
use crate::parser::{self, ParseError};
use crate::vm::{Cell, Code, Const, Function, GENERATOR, Globals, Value, new_cell};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AsmError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unknown instruction '{name}'")]
    UnknownInstruction { name: String, span: Span },
    #[error("extended_arg is inserted by the assembler and cannot be written")]
    ReservedInstruction { span: Span },
    #[error("{op} takes no operand")]
    UnexpectedOperand { op: Opcode, span: Span },
    #[error("{op} needs {expected}")]
    MissingOperand { op: Opcode, expected: &'static str, span: Span },
    #[error("{op} expects {expected}")]
    BadOperand { op: Opcode, expected: &'static str, span: Span },
    #[error("'{name}' is not a cell or free variable of this routine")]
    UnknownCell { name: String, span: Span },
    #[error("label '{name}' is defined twice")]
    DuplicateLabel { name: String, span: Span },
    #[error("label '{name}' is never defined")]
    UndefinedLabel { name: String, span: Span },
    #[error("'{name}' is declared twice")]
    DuplicateName { name: String, span: Span },
    #[error("parameter '{name}' without a default follows one with a default")]
    DefaultOrder { name: String, span: Span },
    #[error("default for '{param}' names '{name}', which is not defined")]
    UndefinedDefault { param: String, name: String, span: Span },
    #[error("routine '{name}' cannot be laid out: {source}")]
    Encode {
        name: String,
        source: EncodeError,
        span: Span,
    },
}

impl AsmError {
    pub fn span(&self) -> Option<Span> {
        match self {
            AsmError::Lex(e) => Some(Span { start: e.position, end: e.position + e.snippet.len().max(1) }),
            AsmError::Parse(e) => Some(e.span),
            AsmError::UnknownInstruction { span, .. }
            | AsmError::ReservedInstruction { span }
            | AsmError::UnexpectedOperand { span, .. }
            | AsmError::MissingOperand { span, .. }
            | AsmError::BadOperand { span, .. }
            | AsmError::UnknownCell { span, .. }
            | AsmError::DuplicateLabel { span, .. }
            | AsmError::UndefinedLabel { span, .. }
            | AsmError::DuplicateName { span, .. }
            | AsmError::DefaultOrder { span, .. }
            | AsmError::UndefinedDefault { span, .. }
            | AsmError::Encode { span, .. } => Some(*span),
        }
    }
}

/// An assembled routine before it is bound to a module.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub code: Code,
    pub defaults: Vec<ParamDefault>,
    pub closure: Vec<Const>,
}

/// First-use ordered name table.
#[derive(Default)]
struct Table {
    names: Vec<String>,
}

impl Table {
    fn index(&mut self, name: &str) -> u32 {
        let idx = match self.names.iter().position(|n| n == name) {
            Some(i) => i,
            None => {
                self.names.push(name.to_string());
                self.names.len() - 1
            }
        };
        idx as u32
    }
}

struct Lowering<'a> {
    routine: &'a Routine,
    varnames: Table,
    names: Table,
    consts: Vec<Const>,
    cells: Vec<String>,
    labels: HashMap<String, Label>,
    defined: HashMap<String, Span>,
    referenced: Vec<(String, Span)>,
    program: Program,
    generator: bool,
}

impl<'a> Lowering<'a> {
    fn new(routine: &'a Routine) -> Self {
        let cells = routine
            .cellvars
            .iter()
            .map(|c| c.node.clone())
            .chain(routine.freevars.iter().map(|f| f.name.clone()))
            .collect();
        Lowering {
            routine,
            varnames: Table::default(),
            names: Table::default(),
            consts: Vec::new(),
            cells,
            labels: HashMap::new(),
            defined: HashMap::new(),
            referenced: Vec::new(),
            program: Program::default(),
            generator: false,
        }
    }

    fn label(&mut self, name: &str) -> Label {
        let next = Label(self.labels.len() as u32);
        *self.labels.entry(name.to_string()).or_insert(next)
    }

    fn const_index(&mut self, c: Const) -> u32 {
        let idx = match self.consts.iter().position(|k| k.is_identical(&c)) {
            Some(i) => i,
            None => {
                self.consts.push(c);
                self.consts.len() - 1
            }
        };
        idx as u32
    }

    fn check_declarations(&mut self) -> Result<(), AsmError> {
        let routine = self.routine;
        let mut seen_default = false;
        for p in &routine.params {
            if self.varnames.names.contains(&p.name) {
                return Err(AsmError::DuplicateName { name: p.name.clone(), span: p.span });
            }
            self.varnames.index(&p.name);
            match (&p.default, seen_default) {
                (Some(_), _) => seen_default = true,
                (None, true) => {
                    return Err(AsmError::DefaultOrder { name: p.name.clone(), span: p.span });
                }
                (None, false) => {}
            }
        }

        let spans = routine
            .cellvars
            .iter()
            .map(|c| c.span)
            .chain(routine.freevars.iter().map(|f| f.span));
        for (i, span) in spans.enumerate() {
            if self.cells[..i].contains(&self.cells[i]) {
                return Err(AsmError::DuplicateName { name: self.cells[i].clone(), span });
            }
        }
        Ok(())
    }

    fn lower(mut self) -> Result<Assembled, AsmError> {
        self.check_declarations()?;

        let routine = self.routine;
        for line in &routine.body {
            match line {
                Line::Label(name) => {
                    if self.defined.insert(name.node.clone(), name.span).is_some() {
                        return Err(AsmError::DuplicateLabel { name: name.node.clone(), span: name.span });
                    }
                    let label = self.label(&name.node);
                    self.program.push(Instr::Label(label));
                }
                Line::Instr { mnemonic, operand } => {
                    let instr = self.lower_instr(mnemonic, operand.as_ref())?;
                    self.program.push(instr);
                }
            }
        }

        if let Some((name, span)) = self.referenced.iter().find(|(n, _)| !self.defined.contains_key(n)) {
            return Err(AsmError::UndefinedLabel { name: name.clone(), span: *span });
        }

        let bytes = bytecode::encode(&self.program).map_err(|source| AsmError::Encode {
            name: routine.name.clone(),
            source,
            span: routine.span,
        })?;

        let code = Code {
            name: routine.name.clone(),
            argcount: routine.params.len(),
            flags: if self.generator { GENERATOR } else { 0 },
            stacksize: stack_size(&self.program),
            code: bytes,
            consts: self.consts,
            names: self.names.names,
            varnames: self.varnames.names,
            cellvars: routine.cellvars.iter().map(|c| c.node.clone()).collect(),
            freevars: routine.freevars.iter().map(|f| f.name.clone()).collect(),
        };
        debug!(
            routine = %code.name,
            bytes = code.code.len(),
            consts = code.consts.len(),
            stacksize = code.stacksize,
            "assembled"
        );
        Ok(Assembled {
            code,
            defaults: routine.params.iter().filter_map(|p| p.default.clone()).collect(),
            closure: routine.freevars.iter().map(|f| f.value.to_const()).collect(),
        })
    }

    fn lower_instr(
        &mut self,
        mnemonic: &Spanned<String>,
        operand: Option<&Spanned<Operand>>,
    ) -> Result<Instr, AsmError> {
        let op = Opcode::from_mnemonic(&mnemonic.node).ok_or_else(|| AsmError::UnknownInstruction {
            name: mnemonic.node.clone(),
            span: mnemonic.span,
        })?;
        let kind = op.operand();
        let expected = match kind {
            OperandKind::None => "no operand",
            OperandKind::Local => "a local variable name",
            OperandKind::Name => "a global name",
            OperandKind::Const => "a literal",
            OperandKind::Cell => "a cell or free variable name",
            OperandKind::JumpRel | OperandKind::JumpAbs => "a label",
            OperandKind::Raw if op == Opcode::COMPARE_OP => "a comparison (lt le eq ne gt ge)",
            OperandKind::Raw => "a non-negative integer",
        };

        if op == Opcode::EXTENDED_ARG {
            return Err(AsmError::ReservedInstruction { span: mnemonic.span });
        }
        let operand = match (kind, operand) {
            (OperandKind::None, None) => {
                return Ok(match op {
                    Opcode::RETURN_VALUE => Instr::Exit(Exit::Return),
                    Opcode::YIELD_VALUE => {
                        self.generator = true;
                        Instr::Exit(Exit::Yield)
                    }
                    _ => Instr::op(op),
                });
            }
            (OperandKind::None, Some(o)) => {
                return Err(AsmError::UnexpectedOperand { op, span: o.span });
            }
            (_, None) => {
                return Err(AsmError::MissingOperand { op, expected, span: mnemonic.span });
            }
            (_, Some(o)) => o,
        };
        let bad = || AsmError::BadOperand { op, expected, span: operand.span };

        let arg = match (kind, &operand.node) {
            (OperandKind::Local, Operand::Name(n)) => self.varnames.index(n),
            (OperandKind::Name, Operand::Name(n)) => self.names.index(n),
            (OperandKind::Const, Operand::Literal(lit)) => self.const_index(lit.to_const()),
            (OperandKind::Cell, Operand::Name(n)) => match self.cells.iter().position(|c| c == n) {
                Some(i) => i as u32,
                None => return Err(AsmError::UnknownCell { name: n.clone(), span: operand.span }),
            },
            (OperandKind::JumpRel | OperandKind::JumpAbs, Operand::Name(n)) => {
                self.referenced.push((n.clone(), operand.span));
                return Ok(Instr::Jump(op, self.label(n)));
            }
            (OperandKind::Raw, Operand::Name(n)) if op == Opcode::COMPARE_OP => {
                compare_from_name(n).ok_or_else(bad)?
            }
            (OperandKind::Raw, Operand::Literal(Literal::Int(n))) => u32::try_from(*n).map_err(|_| bad())?,
            _ => return Err(bad()),
        };
        Ok(Instr::arg(op, arg))
    }
}

/// Deepest stack reached along the instruction order, plus one slot of slack.
fn stack_size(program: &Program) -> usize {
    let mut depth: i64 = 0;
    let mut max: i64 = 0;
    for instr in &program.instrs {
        let effect = match instr {
            Instr::Label(_) => 0,
            Instr::Op(op, arg) => op.stack_effect(arg.unwrap_or(0)),
            Instr::Jump(op, _) => op.stack_effect(0),
            Instr::Exit(exit) => exit.opcode().stack_effect(0),
        };
        depth = (depth + effect).max(0);
        max = max.max(depth);
    }
    max as usize + 1
}

/// Assemble one parsed routine.
pub fn assemble_routine(routine: &Routine) -> Result<Assembled, AsmError> {
    Lowering::new(routine).lower()
}

/// Lex and parse assembly source.
pub fn parse_source(source: &str) -> Result<Module, AsmError> {
    let tokens = lexer::lex(source)?;
    Ok(parser::parse(tokens)?)
}

/// Lex and parse a single literal, such as a starting value given on the command line.
pub fn parse_literal(source: &str) -> Result<Literal, AsmError> {
    let tokens = lexer::lex(source)?;
    Ok(parser::parse_literal(tokens)?)
}

/// Assemble every routine in `source` and bind each into `globals` under its name.
///
/// Routines are bound in source order, so a default may name any builtin or
/// a routine defined earlier in the module.
pub fn load_module(source: &str, globals: &Arc<Globals>) -> Result<Vec<Arc<Function>>, AsmError> {
    let module = parse_source(source)?;
    let mut seen: HashMap<&str, Span> = HashMap::new();
    let mut functions = Vec::with_capacity(module.routines.len());

    for routine in &module.routines {
        if seen.insert(routine.name.as_str(), routine.span).is_some() {
            return Err(AsmError::DuplicateName { name: routine.name.clone(), span: routine.span });
        }
        let assembled = assemble_routine(routine)?;

        let with_default = routine.params.iter().filter(|p| p.default.is_some());
        let mut defaults = Vec::with_capacity(assembled.defaults.len());
        for (param, default) in with_default.zip(&assembled.defaults) {
            let value = match default {
                ParamDefault::Literal(lit) => Value::from(&lit.to_const()),
                ParamDefault::Global(name) => globals.get(name).ok_or_else(|| AsmError::UndefinedDefault {
                    param: param.name.clone(),
                    name: name.clone(),
                    span: param.span,
                })?,
            };
            defaults.push(value);
        }
        let closure: Vec<Cell> = assembled
            .closure
            .iter()
            .map(|c| new_cell(Some(Value::from(c))))
            .collect();

        let func = Arc::new(
            Function::new(assembled.code, Arc::clone(globals))
                .with_defaults(defaults)
                .with_closure(closure),
        );
        globals.set(&routine.name, Value::Function(Arc::clone(&func)));
        functions.push(func);
    }

    Ok(functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode::*;

    fn assemble_one(source: &str) -> Result<Assembled, AsmError> {
        let module = parse_source(source)?;
        assemble_routine(&module.routines[0])
    }

    #[test]
    fn tables_filled_in_first_use_order() {
        let a = assemble_one(
            "def x(f):\n  load_global cos\n  load_fast y\n  load_fast f\n  load_const 1.5\n  load_const 1.5\n  load_const None\n  return_value\nend",
        )
        .unwrap();
        assert_eq!(a.code.varnames, ["f", "y"]);
        assert_eq!(a.code.names, ["cos"]);
        assert_eq!(a.code.consts, vec![Const::Float(1.5), Const::None]);
        assert_eq!(a.code.argcount, 1);
        assert_eq!(a.code.flags, 0);
    }

    #[test]
    fn lowering_round_trips_through_decode() {
        let a = assemble_one(
            "def f(n):\ntop:\n  load_fast n\n  pop_jump_if_false out\n  load_fast n\n  load_const 1\n  binary_subtract\n  store_fast n\n  jump_absolute top\nout:\n  load_fast n\n  return_value\nend",
        )
        .unwrap();
        let p = bytecode::decode(&a.code.code, &a.code.consts).unwrap();
        assert_eq!(p.instrs[0], Instr::Label(Label(0)));
        assert_eq!(p.instrs[2], Instr::Jump(POP_JUMP_IF_FALSE, Label(1)));
        assert_eq!(p.instrs[7], Instr::Jump(JUMP_ABSOLUTE, Label(0)));
    }

    #[test]
    fn yield_marks_generator() {
        let a = assemble_one("def g():\n  load_const 1\n  yield_value\nend").unwrap();
        assert_eq!(a.code.flags & GENERATOR, GENERATOR);
    }

    #[test]
    fn cells_and_compare_operands() {
        let a = assemble_one(
            "def f(a):\n  .cellvars a\n  .freevar k = 2\n  load_deref a\n  load_deref k\n  compare_op lt\n  build_tuple 1\n  return_value\nend",
        )
        .unwrap();
        let p = bytecode::decode(&a.code.code, &a.code.consts).unwrap();
        assert_eq!(
            p.instrs,
            vec![
                Instr::arg(LOAD_DEREF, 0),
                Instr::arg(LOAD_DEREF, 1),
                Instr::arg(COMPARE_OP, crate::opcode::CMP_LT),
                Instr::arg(BUILD_TUPLE, 1),
                Instr::Exit(Exit::Return),
            ]
        );
        assert_eq!(a.closure, vec![Const::Int(2)]);
    }

    #[test]
    fn stack_size_tracks_deepest_point() {
        let a = assemble_one(
            "def f():\n  load_const 1\n  load_const 2\n  load_const 3\n  build_tuple 3\n  return_value\nend",
        )
        .unwrap();
        assert_eq!(a.code.stacksize, 4);
    }

    #[test]
    fn operand_errors() {
        let err = assemble_one("def f():\n  load_fast 3\nend").unwrap_err();
        assert!(matches!(err, AsmError::BadOperand { op: LOAD_FAST, .. }));

        let err = assemble_one("def f():\n  pop_top x\nend").unwrap_err();
        assert!(matches!(err, AsmError::UnexpectedOperand { op: POP_TOP, .. }));

        let err = assemble_one("def f():\n  load_const\nend").unwrap_err();
        assert!(matches!(err, AsmError::MissingOperand { op: LOAD_CONST, .. }));

        let err = assemble_one("def f():\n  frobnicate\nend").unwrap_err();
        assert!(matches!(err, AsmError::UnknownInstruction { ref name, .. } if name == "frobnicate"));

        let err = assemble_one("def f():\n  build_tuple -1\nend").unwrap_err();
        assert!(matches!(err, AsmError::BadOperand { op: BUILD_TUPLE, .. }));

        let err = assemble_one("def f():\n  compare_op approx\nend").unwrap_err();
        assert!(matches!(err, AsmError::BadOperand { op: COMPARE_OP, .. }));

        let err = assemble_one("def f():\n  extended_arg 1\nend").unwrap_err();
        assert!(matches!(err, AsmError::ReservedInstruction { .. }));

        let err = assemble_one("def f():\n  load_deref k\nend").unwrap_err();
        assert!(matches!(err, AsmError::UnknownCell { .. }));
    }

    #[test]
    fn label_errors() {
        let err = assemble_one("def f():\na:\na:\nend").unwrap_err();
        assert!(matches!(err, AsmError::DuplicateLabel { .. }));

        let err = assemble_one("def f():\n  jump_absolute nowhere\nend").unwrap_err();
        assert!(matches!(err, AsmError::UndefinedLabel { ref name, .. } if name == "nowhere"));

        let err = assemble_one("def f():\nback:\n  jump_forward back\nend").unwrap_err();
        assert!(matches!(
            err,
            AsmError::Encode { source: EncodeError::BackwardRelativeJump { .. }, .. }
        ));
    }

    #[test]
    fn declaration_errors() {
        let err = assemble_one("def f(a, a):\nend").unwrap_err();
        assert!(matches!(err, AsmError::DuplicateName { .. }));

        let err = assemble_one("def f(a = 1, b):\nend").unwrap_err();
        assert!(matches!(err, AsmError::DefaultOrder { ref name, .. } if name == "b"));

        let err = assemble_one("def f():\n  .cellvars a\n  .freevar a = 1\nend").unwrap_err();
        assert!(matches!(err, AsmError::DuplicateName { .. }));
    }

    #[test]
    fn load_module_binds_routines_and_defaults() {
        let globals = Globals::new();
        let src = "def one():\n  load_const 1\n  return_value\nend\n\ndef call(f = one, n = 2):\n  load_fast f\n  call_function 0\n  load_fast n\n  binary_add\n  return_value\nend\n";
        let funcs = load_module(src, &globals).unwrap();
        assert_eq!(funcs.len(), 2);
        assert!(matches!(globals.get("one"), Some(Value::Function(_))));
        assert_eq!(funcs[1].call(&[]).unwrap(), Value::Int(3));
        // A default only fills in for a missing argument.
        let abs = Value::Builtin(crate::vm::Builtin::Abs);
        assert!(matches!(funcs[1].call(&[abs]), Err(crate::vm::VmError::Type(_))));
    }

    #[test]
    fn load_module_errors() {
        let globals = Globals::new();
        let err = load_module("def f(g = missing):\nend", &globals).unwrap_err();
        assert!(matches!(err, AsmError::UndefinedDefault { ref name, .. } if name == "missing"));

        let err = load_module("def f():\nend\ndef f():\nend", &globals).unwrap_err();
        assert!(matches!(err, AsmError::DuplicateName { .. }));

        let err = load_module("def f(:\nend", &globals).unwrap_err();
        assert!(matches!(err, AsmError::Parse(_)));
        assert!(err.span().is_some());

        let err = load_module("def f(): $", &globals).unwrap_err();
        assert!(matches!(err, AsmError::Lex(_)));
    }
}
