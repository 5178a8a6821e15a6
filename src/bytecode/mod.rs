//! Symbolic instruction form shared by the decoder, rewriter, encoder and assembler.
//!
//! A [`Program`] never stores byte addresses: branch destinations are [`Label`]
//! markers and jumps name the label they target. Addresses exist only in the
//! encoded byte stream.

use std::fmt;

use crate::opcode::Opcode;

mod decode;
mod encode;

pub use decode::{decode, DecodeError};
pub use encode::{encode, EncodeError};

/// Identity of a branch destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// How an instruction leaves the routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// `return <value>`
    Return,
    /// `return` of the "no value" constant loaded by the preceding instruction
    ReturnNone,
    /// suspend point (`yield <value>`)
    Yield,
}

impl Exit {
    pub const fn opcode(self) -> Opcode {
        match self {
            Exit::Return | Exit::ReturnNone => Opcode::RETURN_VALUE,
            Exit::Yield => Opcode::YIELD_VALUE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// Zero-width branch destination marker.
    Label(Label),
    /// Non-jump, non-exit instruction with its operand, if the opcode takes one.
    Op(Opcode, Option<u32>),
    /// Relative or absolute jump.
    Jump(Opcode, Label),
    Exit(Exit),
}

impl Instr {
    pub fn op(code: Opcode) -> Self {
        Instr::Op(code, None)
    }

    pub fn arg(code: Opcode, arg: u32) -> Self {
        Instr::Op(code, Some(arg))
    }

    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Instr::Label(_) => None,
            Instr::Op(op, _) | Instr::Jump(op, _) => Some(*op),
            Instr::Exit(exit) => Some(exit.opcode()),
        }
    }
}

/// Ordered symbolic instruction sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub instrs: Vec<Instr>,
}

impl Program {
    pub fn new(instrs: Vec<Instr>) -> Self {
        Program { instrs }
    }

    pub fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    /// First label identity not yet used by any marker or jump.
    pub fn next_label(&self) -> Label {
        let max = self
            .instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Label(l) | Instr::Jump(_, l) => Some(l.0),
                _ => None,
            })
            .max();
        Label(max.map_or(0, |m| m + 1))
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Listing that resolves operands against the given tables.
    pub fn listing<'a>(&'a self, tables: Tables<'a>) -> Listing<'a> {
        Listing { program: self, tables }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.listing(Tables::default()), f)
    }
}

/// Name and constant tables used to annotate a listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tables<'a> {
    pub varnames: &'a [String],
    pub names: &'a [String],
    pub cells: &'a [String],
    pub consts: &'a [crate::vm::Const],
}

pub struct Listing<'a> {
    program: &'a Program,
    tables: Tables<'a>,
}

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::opcode::OperandKind;

        for instr in &self.program.instrs {
            match instr {
                Instr::Label(l) => writeln!(f, "{l}:")?,
                Instr::Jump(op, l) => writeln!(f, "    {:<22} -> {l}", op.mnemonic())?,
                Instr::Exit(exit) => {
                    let note = match exit {
                        Exit::ReturnNone => "  ; bare",
                        _ => "",
                    };
                    writeln!(f, "    {}{note}", exit.opcode().mnemonic())?
                }
                Instr::Op(op, None) => writeln!(f, "    {}", op.mnemonic())?,
                Instr::Op(op, Some(arg)) => {
                    let i = *arg as usize;
                    let resolved = match op.operand() {
                        OperandKind::Local => self.tables.varnames.get(i).cloned(),
                        OperandKind::Name => self.tables.names.get(i).cloned(),
                        OperandKind::Cell => self.tables.cells.get(i).cloned(),
                        OperandKind::Const => self.tables.consts.get(i).map(|c| c.to_string()),
                        _ => None,
                    };
                    match resolved {
                        Some(r) => writeln!(f, "    {:<22} {arg:<5} ({r})", op.mnemonic())?,
                        None => writeln!(f, "    {:<22} {arg}", op.mnemonic())?,
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_label_after_highest() {
        let p = Program::new(vec![
            Instr::Label(Label(0)),
            Instr::Jump(Opcode::JUMP_ABSOLUTE, Label(4)),
            Instr::Label(Label(4)),
        ]);
        assert_eq!(p.next_label(), Label(5));
        assert_eq!(Program::default().next_label(), Label(0));
    }

    #[test]
    fn listing_resolves_names() {
        let varnames = vec!["x".to_string()];
        let p = Program::new(vec![
            Instr::arg(Opcode::LOAD_FAST, 0),
            Instr::Exit(Exit::Return),
        ]);
        let tables = Tables { varnames: &varnames, ..Tables::default() };
        let text = p.listing(tables).to_string();
        assert!(text.contains("load_fast"), "{text}");
        assert!(text.contains("(x)"), "{text}");
        assert!(text.contains("return_value"), "{text}");
    }
}
