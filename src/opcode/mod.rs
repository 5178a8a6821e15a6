use serde::{Deserialize, Serialize};

// ── Instruction encoding ────────────────────────────────────────────
//
// No operand:    [OP:8]
// With operand:  [OP:8 | ARG_LO:8 | ARG_HI:8]   (little-endian u16)
// Wide operand:  [EXTENDED_ARG | HI16] [OP | LO16]

/// Opcodes at or above this value carry a 16-bit operand.
pub const HAVE_ARGUMENT: u8 = 90;

/// Largest operand that fits a single instruction without an `EXTENDED_ARG` prefix.
pub const MAX_SHORT_ARG: u32 = 0xFFFF;

/// What an instruction's operand refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperandKind {
    None,
    Local,
    Name,
    Const,
    Cell,
    JumpRel,
    JumpAbs,
    Raw,
}

impl OperandKind {
    pub const fn is_jump(self) -> bool {
        matches!(self, OperandKind::JumpRel | OperandKind::JumpAbs)
    }
}

macro_rules! opcodes {
    ($($name:ident = $byte:literal, $mnemonic:literal, $kind:ident;)*) => {
        /// The fixed instruction vocabulary.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[allow(non_camel_case_types)]
        pub enum Opcode {
            $($name = $byte,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub const fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $($byte => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            pub const fn operand(self) -> OperandKind {
                match self {
                    $(Opcode::$name => OperandKind::$kind,)*
                }
            }
        }
    };
}

opcodes! {
    // stack shuffling
    POP_TOP = 1, "pop_top", None;
    ROT_TWO = 2, "rot_two", None;
    ROT_THREE = 3, "rot_three", None;
    DUP_TOP = 4, "dup_top", None;

    // arithmetic
    UNARY_NEGATIVE = 11, "unary_negative", None;
    UNARY_NOT = 12, "unary_not", None;
    BINARY_MULTIPLY = 20, "binary_multiply", None;
    BINARY_MODULO = 22, "binary_modulo", None;
    BINARY_ADD = 23, "binary_add", None;
    BINARY_SUBTRACT = 24, "binary_subtract", None;
    BINARY_SUBSCR = 25, "binary_subscr", None;
    BINARY_TRUE_DIVIDE = 27, "binary_true_divide", None;

    GET_ITER = 68, "get_iter", None;

    // exits
    RETURN_VALUE = 83, "return_value", None;
    YIELD_VALUE = 86, "yield_value", None;

    // ---- HAVE_ARGUMENT ----
    FOR_ITER = 93, "for_iter", JumpRel;
    STORE_GLOBAL = 97, "store_global", Name;
    DELETE_GLOBAL = 98, "delete_global", Name;
    LOAD_CONST = 100, "load_const", Const;
    BUILD_TUPLE = 102, "build_tuple", Raw;
    COMPARE_OP = 107, "compare_op", Raw;
    JUMP_FORWARD = 110, "jump_forward", JumpRel;
    JUMP_IF_FALSE_OR_POP = 111, "jump_if_false_or_pop", JumpAbs;
    JUMP_IF_TRUE_OR_POP = 112, "jump_if_true_or_pop", JumpAbs;
    JUMP_ABSOLUTE = 113, "jump_absolute", JumpAbs;
    POP_JUMP_IF_FALSE = 114, "pop_jump_if_false", JumpAbs;
    POP_JUMP_IF_TRUE = 115, "pop_jump_if_true", JumpAbs;
    LOAD_GLOBAL = 116, "load_global", Name;
    LOAD_FAST = 124, "load_fast", Local;
    STORE_FAST = 125, "store_fast", Local;
    DELETE_FAST = 126, "delete_fast", Local;
    CALL_FUNCTION = 131, "call_function", Raw;
    LOAD_DEREF = 136, "load_deref", Cell;
    STORE_DEREF = 137, "store_deref", Cell;
    EXTENDED_ARG = 145, "extended_arg", Raw;
}

impl Opcode {
    pub const fn byte(self) -> u8 {
        self as u8
    }

    pub const fn has_arg(self) -> bool {
        self.byte() >= HAVE_ARGUMENT
    }

    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.mnemonic() == name)
    }

    /// Net change in stack depth when execution falls through to the next instruction.
    pub const fn stack_effect(self, arg: u32) -> i64 {
        use Opcode::*;
        match self {
            ROT_TWO | ROT_THREE | UNARY_NEGATIVE | UNARY_NOT | GET_ITER | JUMP_FORWARD
            | JUMP_ABSOLUTE | DELETE_FAST | DELETE_GLOBAL | EXTENDED_ARG => 0,
            DUP_TOP | LOAD_CONST | LOAD_GLOBAL | LOAD_FAST | LOAD_DEREF | FOR_ITER => 1,
            POP_TOP | BINARY_MULTIPLY | BINARY_MODULO | BINARY_ADD | BINARY_SUBTRACT
            | BINARY_SUBSCR | BINARY_TRUE_DIVIDE | RETURN_VALUE | YIELD_VALUE | STORE_GLOBAL
            | STORE_FAST | STORE_DEREF | COMPARE_OP | POP_JUMP_IF_FALSE | POP_JUMP_IF_TRUE
            | JUMP_IF_FALSE_OR_POP | JUMP_IF_TRUE_OR_POP => -1,
            BUILD_TUPLE => 1 - arg as i64,
            CALL_FUNCTION => -(arg as i64),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

// ── Comparison operands ─────────────────────────────────────────────

pub const CMP_LT: u32 = 0;
pub const CMP_LE: u32 = 1;
pub const CMP_EQ: u32 = 2;
pub const CMP_NE: u32 = 3;
pub const CMP_GT: u32 = 4;
pub const CMP_GE: u32 = 5;

pub fn compare_from_name(name: &str) -> Option<u32> {
    match name {
        "lt" => Some(CMP_LT),
        "le" => Some(CMP_LE),
        "eq" => Some(CMP_EQ),
        "ne" => Some(CMP_NE),
        "gt" => Some(CMP_GT),
        "ge" => Some(CMP_GE),
        _ => None,
    }
}
