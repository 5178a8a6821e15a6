//! Semantic edits that turn a step routine into one iteration of a fixed-point loop.
//!
//! The rewritten routine takes its own name as an implicit first parameter
//! (local slot 0) and, instead of returning, leaves `(stop, value, arg1, ..)`
//! behind so the driver can thread state into the next call.

use std::fmt;

use tracing::debug;

use crate::bytecode::{Exit, Instr, Label, Program};
use crate::opcode::{Opcode, OperandKind};
use crate::vm::Const;

/// Where the routine's own name was rebound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Global,
    Nonlocal,
    Parameter,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::Global => "global",
            ConflictKind::Nonlocal => "nonlocal",
            ConflictKind::Parameter => "parameter",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewriteError {
    #[error("'{name}' names its own routine and cannot also be used as a {kind} name")]
    NamingConflict { name: String, kind: ConflictKind },
}

/// Name tables of the routine being rewritten. Never mutated.
#[derive(Debug, Clone, Copy)]
pub struct RoutineTables<'a> {
    pub name: &'a str,
    pub argcount: usize,
    pub varnames: &'a [String],
    pub cellvars: &'a [String],
    pub freevars: &'a [String],
    pub names: &'a [String],
    pub consts: &'a [Const],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rewritten {
    pub program: Program,
    /// Own name first, then the original locals without it.
    pub varnames: Vec<String>,
    /// Original pool with `True` and `False` appended when absent.
    pub consts: Vec<Const>,
}

/// Maps an original local slot to its slot once the own name sits at 0.
#[derive(Debug, Clone, Copy)]
struct SelfSlot(Option<usize>);

impl SelfSlot {
    fn shift(self, slot: u32) -> u32 {
        match self.0 {
            Some(s) if slot as usize == s => 0,
            Some(s) if slot as usize > s => slot,
            _ => slot + 1,
        }
    }
}

fn const_index(consts: &mut Vec<Const>, c: Const) -> u32 {
    let idx = match consts.iter().position(|k| k.is_identical(&c)) {
        Some(i) => i,
        None => {
            consts.push(c);
            consts.len() - 1
        }
    };
    idx as u32
}

pub fn rewrite(program: &Program, tables: RoutineTables<'_>) -> Result<Rewritten, RewriteError> {
    let name = tables.name;
    let conflict = |kind| RewriteError::NamingConflict { name: name.to_string(), kind };

    let self_var = tables.varnames.iter().position(|v| v == name);
    if self_var.is_some_and(|s| s < tables.argcount) {
        return Err(conflict(ConflictKind::Parameter));
    }
    let slot = SelfSlot(self_var);
    let self_global = tables.names.iter().position(|n| n == name).map(|i| i as u32);
    let self_free = tables
        .freevars
        .iter()
        .position(|v| v == name)
        .map(|i| (tables.cellvars.len() + i) as u32);
    let self_cell = tables.cellvars.iter().position(|v| v == name);

    let load_self = match self_cell {
        Some(cell) => Instr::arg(Opcode::LOAD_DEREF, cell as u32),
        None => Instr::arg(Opcode::LOAD_FAST, 0),
    };

    let stop = program.next_label();
    let cont = Label(stop.0 + 1);
    let pack = Label(stop.0 + 2);

    let mut out: Vec<Instr> = Vec::with_capacity(program.len() + tables.argcount + 8);
    for instr in &program.instrs {
        let rewritten = match *instr {
            Instr::Op(Opcode::LOAD_GLOBAL, Some(k)) if Some(k) == self_global => {
                Instr::arg(Opcode::LOAD_FAST, 0)
            }
            Instr::Op(Opcode::STORE_GLOBAL | Opcode::DELETE_GLOBAL, Some(k)) if Some(k) == self_global => {
                return Err(conflict(ConflictKind::Global));
            }
            Instr::Op(Opcode::LOAD_DEREF, Some(k)) if Some(k) == self_free => {
                Instr::arg(Opcode::LOAD_FAST, 0)
            }
            Instr::Op(Opcode::STORE_DEREF, Some(k)) if Some(k) == self_free => {
                return Err(conflict(ConflictKind::Nonlocal));
            }
            Instr::Op(op, Some(k)) if op.operand() == OperandKind::Local => Instr::arg(op, slot.shift(k)),

            Instr::Exit(Exit::Return) => Instr::Jump(Opcode::JUMP_FORWARD, cont),
            Instr::Exit(Exit::ReturnNone) => {
                // The "no value" load becomes a load of the current binding.
                match out.last_mut() {
                    Some(prev) if matches!(prev, Instr::Op(Opcode::LOAD_CONST, _)) => *prev = load_self.clone(),
                    _ => {
                        out.push(Instr::op(Opcode::POP_TOP));
                        out.push(load_self.clone());
                    }
                }
                Instr::Jump(Opcode::JUMP_FORWARD, cont)
            }
            Instr::Exit(Exit::Yield) => Instr::Jump(Opcode::JUMP_FORWARD, stop),

            ref other => other.clone(),
        };
        out.push(rewritten);
    }

    let mut consts = tables.consts.to_vec();
    let k_true = const_index(&mut consts, Const::Bool(true));
    let k_false = const_index(&mut consts, Const::Bool(false));

    out.extend([
        Instr::Label(stop),
        Instr::arg(Opcode::LOAD_CONST, k_true),
        Instr::Jump(Opcode::JUMP_FORWARD, pack),
        Instr::Label(cont),
        Instr::arg(Opcode::LOAD_CONST, k_false),
        Instr::Label(pack),
        Instr::op(Opcode::ROT_TWO),
    ]);
    for (i, arg) in tables.varnames.iter().take(tables.argcount).enumerate() {
        let load = match tables.cellvars.iter().position(|c| c == arg) {
            Some(cell) => Instr::arg(Opcode::LOAD_DEREF, cell as u32),
            None => Instr::arg(Opcode::LOAD_FAST, slot.shift(i as u32)),
        };
        out.push(load);
    }
    out.push(Instr::arg(Opcode::BUILD_TUPLE, tables.argcount as u32 + 2));
    out.push(Instr::Exit(Exit::Return));

    let mut varnames = Vec::with_capacity(tables.varnames.len() + 1);
    varnames.push(name.to_string());
    varnames.extend(tables.varnames.iter().filter(|v| *v != name).cloned());

    debug!(
        routine = name,
        self_slot = ?self_var,
        self_global = self_global.is_some(),
        self_free = self_free.is_some(),
        instrs = out.len(),
        "rewrote step routine"
    );

    Ok(Rewritten { program: Program::new(out), varnames, consts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    struct Owned {
        varnames: Vec<String>,
        cellvars: Vec<String>,
        freevars: Vec<String>,
        names: Vec<String>,
        consts: Vec<Const>,
    }

    impl Owned {
        fn new(varnames: &[&str], names: &[&str], consts: Vec<Const>) -> Self {
            Owned {
                varnames: strings(varnames),
                cellvars: Vec::new(),
                freevars: Vec::new(),
                names: strings(names),
                consts,
            }
        }

        fn tables<'a>(&'a self, name: &'a str, argcount: usize) -> RoutineTables<'a> {
            RoutineTables {
                name,
                argcount,
                varnames: &self.varnames,
                cellvars: &self.cellvars,
                freevars: &self.freevars,
                names: &self.names,
                consts: &self.consts,
            }
        }
    }

    fn epilogue(first: u32, k_true: u32, k_false: u32, args: &[Instr]) -> Vec<Instr> {
        let mut v = vec![
            Instr::Label(Label(first)),
            Instr::arg(LOAD_CONST, k_true),
            Instr::Jump(JUMP_FORWARD, Label(first + 2)),
            Instr::Label(Label(first + 1)),
            Instr::arg(LOAD_CONST, k_false),
            Instr::Label(Label(first + 2)),
            Instr::op(ROT_TWO),
        ];
        v.extend_from_slice(args);
        v.push(Instr::arg(BUILD_TUPLE, args.len() as u32 + 2));
        v.push(Instr::Exit(Exit::Return));
        v
    }

    #[test]
    fn global_self_reference_becomes_slot_zero() {
        // def x(f): x = f(x); return   (x read as a global)
        let t = Owned::new(&["f"], &["x"], vec![Const::None]);
        let program = Program::new(vec![
            Instr::arg(LOAD_FAST, 0),
            Instr::arg(LOAD_GLOBAL, 0),
            Instr::arg(CALL_FUNCTION, 1),
            Instr::arg(LOAD_CONST, 0),
            Instr::Exit(Exit::ReturnNone),
        ]);
        let out = rewrite(&program, t.tables("x", 1)).unwrap();

        let mut expected = vec![
            Instr::arg(LOAD_FAST, 1),
            Instr::arg(LOAD_FAST, 0),
            Instr::arg(CALL_FUNCTION, 1),
            Instr::arg(LOAD_FAST, 0),
            Instr::Jump(JUMP_FORWARD, Label(1)),
        ];
        expected.extend(epilogue(0, 1, 2, &[Instr::arg(LOAD_FAST, 1)]));
        assert_eq!(out.program.instrs, expected);
        assert_eq!(out.varnames, strings(&["x", "f"]));
        assert_eq!(out.consts, vec![Const::None, Const::Bool(true), Const::Bool(false)]);
    }

    #[test]
    fn local_self_moves_to_slot_zero() {
        // locals (f, tmp, x, y): x moves to 0, f and tmp shift up, y stays
        let t = Owned::new(&["f", "tmp", "x", "y"], &[], vec![]);
        let program = Program::new(vec![
            Instr::arg(LOAD_FAST, 0),
            Instr::arg(STORE_FAST, 1),
            Instr::arg(LOAD_FAST, 2),
            Instr::arg(STORE_FAST, 3),
            Instr::arg(DELETE_FAST, 2),
        ]);
        let out = rewrite(&program, t.tables("x", 1)).unwrap();
        assert_eq!(
            &out.program.instrs[..5],
            &[
                Instr::arg(LOAD_FAST, 1),
                Instr::arg(STORE_FAST, 2),
                Instr::arg(LOAD_FAST, 0),
                Instr::arg(STORE_FAST, 3),
                Instr::arg(DELETE_FAST, 0),
            ]
        );
        assert_eq!(out.varnames, strings(&["x", "f", "tmp", "y"]));
    }

    #[test]
    fn value_return_and_yield_branch_to_epilogue() {
        let t = Owned::new(&[], &[], vec![Const::Int(5)]);
        let program = Program::new(vec![
            Instr::Jump(POP_JUMP_IF_FALSE, Label(0)),
            Instr::arg(LOAD_CONST, 0),
            Instr::Exit(Exit::Yield),
            Instr::Label(Label(0)),
            Instr::arg(LOAD_CONST, 0),
            Instr::Exit(Exit::Return),
        ]);
        let out = rewrite(&program, t.tables("x", 0)).unwrap();
        assert_eq!(out.program.instrs[2], Instr::Jump(JUMP_FORWARD, Label(1)));
        assert_eq!(out.program.instrs[5], Instr::Jump(JUMP_FORWARD, Label(2)));
        assert_eq!(out.program.instrs[6], Instr::Label(Label(1)));
        assert!(!out.program.instrs.iter().any(|i| matches!(i, Instr::Exit(Exit::Yield))));
        assert_eq!(out.program.instrs.last(), Some(&Instr::Exit(Exit::Return)));
    }

    #[test]
    fn existing_bools_reused_by_identity() {
        let consts = vec![Const::Int(1), Const::Bool(false), Const::Int(0), Const::Bool(true)];
        let t = Owned::new(&[], &[], consts.clone());
        let out = rewrite(&Program::default(), t.tables("x", 0)).unwrap();
        assert_eq!(out.consts, consts);
        assert_eq!(out.program.instrs[1], Instr::arg(LOAD_CONST, 3));
        assert_eq!(out.program.instrs[4], Instr::arg(LOAD_CONST, 1));

        // Int(1) is equal to True numerically but not identical.
        let t = Owned::new(&[], &[], vec![Const::Int(1), Const::Int(0)]);
        let out = rewrite(&Program::default(), t.tables("x", 0)).unwrap();
        assert_eq!(out.consts.len(), 4);
    }

    #[test]
    fn free_variable_self_reference() {
        let mut t = Owned::new(&["a"], &[], vec![Const::None]);
        t.cellvars = strings(&["a"]);
        t.freevars = strings(&["k", "x"]);
        let program = Program::new(vec![
            Instr::arg(LOAD_DEREF, 2),
            Instr::arg(LOAD_DEREF, 1),
            Instr::arg(LOAD_DEREF, 0),
            Instr::op(POP_TOP),
            Instr::op(POP_TOP),
            Instr::Exit(Exit::Return),
        ]);
        let out = rewrite(&program, t.tables("x", 1)).unwrap();
        assert_eq!(out.program.instrs[0], Instr::arg(LOAD_FAST, 0));
        assert_eq!(out.program.instrs[1], Instr::arg(LOAD_DEREF, 1));
        // Argument `a` lives in cell 0 and is re-read from there.
        let n = out.program.instrs.len();
        assert_eq!(out.program.instrs[n - 3], Instr::arg(LOAD_DEREF, 0));
    }

    #[test]
    fn bare_return_reads_cell_when_self_is_a_cell() {
        let mut t = Owned::new(&[], &[], vec![Const::None]);
        t.cellvars = strings(&["x"]);
        let program = Program::new(vec![Instr::arg(LOAD_CONST, 0), Instr::Exit(Exit::ReturnNone)]);
        let out = rewrite(&program, t.tables("x", 0)).unwrap();
        assert_eq!(out.program.instrs[0], Instr::arg(LOAD_DEREF, 0));
    }

    #[test]
    fn naming_conflicts() {
        let t = Owned::new(&[], &["x"], vec![]);
        for op in [STORE_GLOBAL, DELETE_GLOBAL] {
            let program = Program::new(vec![Instr::arg(op, 0)]);
            assert_eq!(
                rewrite(&program, t.tables("x", 0)),
                Err(RewriteError::NamingConflict { name: "x".into(), kind: ConflictKind::Global })
            );
        }

        let mut t = Owned::new(&[], &[], vec![]);
        t.freevars = strings(&["x"]);
        let program = Program::new(vec![Instr::arg(STORE_DEREF, 0)]);
        assert_eq!(
            rewrite(&program, t.tables("x", 0)),
            Err(RewriteError::NamingConflict { name: "x".into(), kind: ConflictKind::Nonlocal })
        );

        let t = Owned::new(&["x"], &[], vec![]);
        assert_eq!(
            rewrite(&Program::default(), t.tables("x", 1)),
            Err(RewriteError::NamingConflict { name: "x".into(), kind: ConflictKind::Parameter })
        );
    }

    #[test]
    fn store_global_of_other_name_is_untouched() {
        let t = Owned::new(&[], &["x", "g"], vec![]);
        let program = Program::new(vec![Instr::arg(STORE_GLOBAL, 1)]);
        let out = rewrite(&program, t.tables("x", 0)).unwrap();
        assert_eq!(out.program.instrs[0], Instr::arg(STORE_GLOBAL, 1));
    }

    #[test]
    fn fresh_labels_follow_existing_ones() {
        let t = Owned::new(&[], &[], vec![]);
        let program = Program::new(vec![
            Instr::Jump(JUMP_ABSOLUTE, Label(4)),
            Instr::Label(Label(4)),
        ]);
        let out = rewrite(&program, t.tables("x", 0)).unwrap();
        assert_eq!(out.program.instrs[2], Instr::Label(Label(5)));
    }
}
