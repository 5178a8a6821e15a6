use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use super::{Exit, Instr, Label, Program};
use crate::opcode::{MAX_SHORT_ARG, Opcode, OperandKind};
use crate::vm::Const;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown opcode {byte} at offset {offset}")]
    UnknownOpcode { byte: u8, offset: usize },
    #[error("truncated operand for {op} at offset {offset}")]
    TruncatedOperand { op: Opcode, offset: usize },
    #[error("extended_arg at offset {offset} does not prefix an instruction with an operand")]
    DanglingExtendedArg { offset: usize },
    #[error("operand of instruction at offset {offset} does not fit in 32 bits")]
    OperandOverflow { offset: usize },
    #[error("jump at offset {offset} targets {target}, which is not an instruction boundary")]
    BadJumpTarget { offset: usize, target: usize },
}

/// One instruction as laid out in the byte stream, prefixes folded in.
#[derive(Debug)]
struct RawInstr {
    /// Offset of the first byte, including any `EXTENDED_ARG` prefixes.
    offset: usize,
    op: Opcode,
    arg: Option<u32>,
    /// Offset of the instruction that follows.
    next: usize,
}

impl RawInstr {
    fn jump_target(&self) -> Option<usize> {
        let arg = self.arg? as usize;
        match self.op.operand() {
            OperandKind::JumpRel => Some(self.next + arg),
            OperandKind::JumpAbs => Some(arg),
            _ => None,
        }
    }
}

fn scan(raw: &[u8]) -> Result<Vec<RawInstr>, DecodeError> {
    let mut out = Vec::new();
    let mut i = 0;
    let mut start = 0;
    let mut extended: Option<u32> = None;

    while i < raw.len() {
        let offset = i;
        let byte = raw[i];
        let op = Opcode::from_byte(byte).ok_or(DecodeError::UnknownOpcode { byte, offset })?;
        i += 1;
        if extended.is_none() {
            start = offset;
        }

        let arg = if op.has_arg() {
            let bytes = raw
                .get(i..i + 2)
                .ok_or(DecodeError::TruncatedOperand { op, offset })?;
            i += 2;
            let low = u32::from(u16::from_le_bytes([bytes[0], bytes[1]]));
            let high = match extended.take() {
                Some(high) if high > MAX_SHORT_ARG => {
                    return Err(DecodeError::OperandOverflow { offset: start });
                }
                Some(high) => high << 16,
                None => 0,
            };
            Some(high | low)
        } else if extended.is_some() {
            return Err(DecodeError::DanglingExtendedArg { offset: start });
        } else {
            None
        };

        if op == Opcode::EXTENDED_ARG {
            extended = arg;
            continue;
        }
        out.push(RawInstr { offset: start, op, arg, next: i });
    }

    if extended.is_some() {
        return Err(DecodeError::DanglingExtendedArg { offset: start });
    }
    Ok(out)
}

/// Decode a raw instruction stream into its symbolic form.
///
/// Every branch destination gets a `Label` whose identity is the destination's
/// rank among all destinations in address order. `consts` is only consulted to
/// tell a bare `return` (of the "no value" constant) from a value return.
pub fn decode(raw: &[u8], consts: &[Const]) -> Result<Program, DecodeError> {
    let instrs = scan(raw)?;

    let starts: BTreeSet<usize> = instrs.iter().map(|r| r.offset).collect();
    let mut targets = BTreeSet::new();
    for r in &instrs {
        if let Some(target) = r.jump_target() {
            if !starts.contains(&target) {
                return Err(DecodeError::BadJumpTarget { offset: r.offset, target });
            }
            targets.insert(target);
        }
    }
    let labels: BTreeMap<usize, Label> = targets
        .into_iter()
        .enumerate()
        .map(|(rank, addr)| (addr, Label(rank as u32)))
        .collect();

    let mut program = Program::default();
    for r in &instrs {
        if let Some(&label) = labels.get(&r.offset) {
            program.push(Instr::Label(label));
        }

        let instr = match r.op {
            Opcode::RETURN_VALUE => Instr::Exit(classify_return(program.instrs.last(), consts)),
            Opcode::YIELD_VALUE => Instr::Exit(Exit::Yield),
            op if op.operand().is_jump() => {
                let target = r.jump_target().and_then(|t| labels.get(&t).copied());
                match target {
                    Some(label) => Instr::Jump(op, label),
                    None => {
                        return Err(DecodeError::BadJumpTarget {
                            offset: r.offset,
                            target: r.arg.unwrap_or_default() as usize,
                        });
                    }
                }
            }
            op => Instr::Op(op, r.arg),
        };
        program.push(instr);
    }

    trace!(bytes = raw.len(), instrs = instrs.len(), labels = labels.len(), "decoded");
    Ok(program)
}

fn classify_return(prev: Option<&Instr>, consts: &[Const]) -> Exit {
    match prev {
        Some(Instr::Op(Opcode::LOAD_CONST, Some(k)))
            if consts.get(*k as usize) == Some(&Const::None) =>
        {
            Exit::ReturnNone
        }
        _ => Exit::Return,
    }
}
