use std::collections::HashMap;

use tracing::trace;

use super::{Instr, Label, Program};
use crate::opcode::{MAX_SHORT_ARG, Opcode, OperandKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("label {0} is placed more than once")]
    DuplicateLabel(Label),
    #[error("label {0} is referenced but never placed")]
    UndefinedLabel(Label),
    #[error("relative jump {op} to {label} points backwards")]
    BackwardRelativeJump { op: Opcode, label: Label },
    #[error("{op} requires an operand")]
    MissingOperand { op: Opcode },
    #[error("{op} takes no operand")]
    UnexpectedOperand { op: Opcode },
    #[error("{op} cannot appear in this position")]
    MisplacedOpcode { op: Opcode },
    #[error("jump target lies beyond the 32-bit address range")]
    AddressOverflow,
}

// Encoded widths: opcode + u16 operand, optionally preceded by an EXTENDED_ARG.
const NARROW: usize = 1;
const SHORT: usize = 3;
const WIDE: usize = 6;

fn width_for(arg: u32) -> usize {
    if arg > MAX_SHORT_ARG { WIDE } else { SHORT }
}

/// Byte layout of a program: the encoded width of every instruction.
struct Layout {
    widths: Vec<usize>,
}

impl Layout {
    fn initial(program: &Program) -> Result<Self, EncodeError> {
        let widths = program
            .instrs
            .iter()
            .map(|instr| match instr {
                Instr::Label(_) => Ok(0),
                Instr::Exit(_) => Ok(NARROW),
                Instr::Jump(op, _) => {
                    if op.operand().is_jump() {
                        Ok(SHORT)
                    } else {
                        Err(EncodeError::MisplacedOpcode { op: *op })
                    }
                }
                Instr::Op(op, arg) => match (op.operand(), arg) {
                    (kind, _) if kind.is_jump() || *op == Opcode::EXTENDED_ARG => {
                        Err(EncodeError::MisplacedOpcode { op: *op })
                    }
                    (OperandKind::None, None) => Ok(NARROW),
                    (OperandKind::None, Some(_)) => Err(EncodeError::UnexpectedOperand { op: *op }),
                    (_, None) => Err(EncodeError::MissingOperand { op: *op }),
                    (_, Some(a)) => Ok(width_for(*a)),
                },
            })
            .collect::<Result<_, _>>()?;
        Ok(Layout { widths })
    }

    /// Address of every placed label under the current widths.
    fn label_addresses(&self, program: &Program) -> HashMap<Label, usize> {
        let mut addr = 0;
        let mut labels = HashMap::new();
        for (instr, width) in program.instrs.iter().zip(&self.widths) {
            if let Instr::Label(l) = instr {
                labels.insert(*l, addr);
            }
            addr += width;
        }
        labels
    }
}

fn jump_operand(
    op: Opcode,
    label: Label,
    target: usize,
    end: usize,
) -> Result<u32, EncodeError> {
    let operand = match op.operand() {
        OperandKind::JumpRel => target
            .checked_sub(end)
            .ok_or(EncodeError::BackwardRelativeJump { op, label })?,
        _ => target,
    };
    u32::try_from(operand).map_err(|_| EncodeError::AddressOverflow)
}

/// Widen jumps whose resolved operand no longer fits until the layout is stable.
///
/// Widths only ever grow, so this terminates after at most one pass per jump.
fn relax(program: &Program, layout: &mut Layout) -> Result<HashMap<Label, usize>, EncodeError> {
    let mut passes = 0;
    loop {
        passes += 1;
        let labels = layout.label_addresses(program);
        let mut addr = 0;
        let mut changed = false;
        for (idx, instr) in program.instrs.iter().enumerate() {
            let end = addr + layout.widths[idx];
            if let Instr::Jump(op, label) = instr {
                let target = *labels.get(label).ok_or(EncodeError::UndefinedLabel(*label))?;
                let operand = jump_operand(*op, *label, target, end)?;
                if width_for(operand) > layout.widths[idx] {
                    layout.widths[idx] = WIDE;
                    changed = true;
                }
            }
            addr = end;
        }
        if !changed {
            trace!(passes, "layout stable");
            return Ok(labels);
        }
    }
}

fn check_labels(program: &Program) -> Result<(), EncodeError> {
    let mut seen = std::collections::HashSet::new();
    for instr in &program.instrs {
        if let Instr::Label(l) = instr {
            if !seen.insert(*l) {
                return Err(EncodeError::DuplicateLabel(*l));
            }
        }
    }
    Ok(())
}

struct Fixup {
    /// Address of the first byte of the jump, including any prefix.
    at: usize,
    op: Opcode,
    label: Label,
    /// Address of the byte immediately after the jump.
    end: usize,
    wide: bool,
}

fn put_operand(out: &mut Vec<u8>, op: Opcode, arg: u32, wide: bool) {
    if wide {
        out.push(Opcode::EXTENDED_ARG.byte());
        out.extend_from_slice(&((arg >> 16) as u16).to_le_bytes());
    }
    out.push(op.byte());
    out.extend_from_slice(&(arg as u16).to_le_bytes());
}

/// Lay a symbolic program out as raw instruction bytes.
///
/// Labels may be referenced before or after they are placed. Operand widths,
/// including jump operands, are chosen from final resolved values, so an
/// `EXTENDED_ARG` prefix is emitted wherever a value exceeds 16 bits.
pub fn encode(program: &Program) -> Result<Vec<u8>, EncodeError> {
    check_labels(program)?;
    let mut layout = Layout::initial(program)?;
    let labels = relax(program, &mut layout)?;

    // Phase 1: emit, recording a fixup per jump.
    let mut out = Vec::with_capacity(layout.widths.iter().sum());
    let mut fixups = Vec::new();
    for (instr, &width) in program.instrs.iter().zip(&layout.widths) {
        let at = out.len();
        match instr {
            Instr::Label(_) => {}
            Instr::Exit(exit) => out.push(exit.opcode().byte()),
            Instr::Op(op, None) => out.push(op.byte()),
            Instr::Op(op, Some(arg)) => put_operand(&mut out, *op, *arg, width == WIDE),
            Instr::Jump(op, label) => {
                let wide = width == WIDE;
                put_operand(&mut out, *op, 0, wide);
                fixups.push(Fixup { at, op: *op, label: *label, end: at + width, wide });
            }
        }
    }

    // Phase 2: patch jump operands against the recorded label addresses.
    for f in &fixups {
        let target = *labels.get(&f.label).ok_or(EncodeError::UndefinedLabel(f.label))?;
        let operand = jump_operand(f.op, f.label, target, f.end)?;
        let mut pos = f.at + 1;
        if f.wide {
            out[pos..pos + 2].copy_from_slice(&((operand >> 16) as u16).to_le_bytes());
            pos += 3;
        }
        out[pos..pos + 2].copy_from_slice(&(operand as u16).to_le_bytes());
    }

    trace!(instrs = program.len(), bytes = out.len(), jumps = fixups.len(), "encoded");
    Ok(out)
}
