/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    pub short: &'static str, // one line for `fixpt explain --list`
    pub long: &'static str,  // full text for `fixpt explain CODE`
}

/// All stable error codes reported by fixpt.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Lexer ────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "FXP-L001",
        short: "unexpected character",
        long: r#"## FXP-L001: unexpected character

Text was found that is not part of the assembly language. Strings use
double quotes, the only directives are `.cellvars` and `.freevar`, and
integers must fit in 64 bits.

**Example:**

    load_const 'a'    -- single quotes

**Fix:**

    load_const "a"
"#,
    },

    // ── Parser ───────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "FXP-P001",
        short: "expected 'def' at top level",
        long: r#"## FXP-P001: expected 'def'

Outside a routine only `def` may start a line. Instructions belong
between a `def ...:` header and its `end`.
"#,
    },
    ErrorEntry {
        code: "FXP-P002",
        short: "expected 'def', got end of file",
        long: r#"## FXP-P002: expected 'def', got end of file

The file ended where another routine was expected.
"#,
    },
    ErrorEntry {
        code: "FXP-P003",
        short: "unexpected token",
        long: r#"## FXP-P003: unexpected token

A token was found where a different one was required. The message
names both.

**Example:**

    def x(a:        -- ')' missing before ':'
"#,
    },
    ErrorEntry {
        code: "FXP-P004",
        short: "unexpected end of file",
        long: r#"## FXP-P004: unexpected end of file

The file ended before a required token was found.
"#,
    },
    ErrorEntry {
        code: "FXP-P005",
        short: "expected a name",
        long: r#"## FXP-P005: expected a name

A routine, parameter, label or instruction name was required but a
different token was found.
"#,
    },
    ErrorEntry {
        code: "FXP-P006",
        short: "expected a name, got end of file",
        long: r#"## FXP-P006: expected a name, got end of file

The file ended before a required name was found.
"#,
    },
    ErrorEntry {
        code: "FXP-P007",
        short: "expected end of line",
        long: r#"## FXP-P007: expected end of line

Every instruction, label and directive occupies one line. Extra tokens
followed a complete line.

**Example:**

    load_fast x y
"#,
    },
    ErrorEntry {
        code: "FXP-P008",
        short: "routine is missing its 'end'",
        long: r#"## FXP-P008: routine is missing its 'end'

A routine body runs until a line holding only `end`. Another `def`
or the end of the file was reached first.
"#,
    },
    ErrorEntry {
        code: "FXP-P009",
        short: "expected an instruction or label",
        long: r#"## FXP-P009: expected an instruction or label

Inside a routine each line is a label (`name:`), an instruction with an
optional operand, or a directive.
"#,
    },
    ErrorEntry {
        code: "FXP-P010",
        short: "expected a literal",
        long: r#"## FXP-P010: expected a literal

Constants, defaults and free variable values are literals: `None`,
`True`, `False`, integers, floats, double-quoted strings and tuples
of literals.
"#,
    },
    ErrorEntry {
        code: "FXP-P011",
        short: "one-element tuple without trailing comma",
        long: r#"## FXP-P011: one-element tuple without trailing comma

A parenthesised single literal is ambiguous. Write a one-element tuple
with a trailing comma.

**Fix:**

    load_const (1,)
"#,
    },

    // ── Assembler ────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "FXP-A001",
        short: "unknown instruction",
        long: r#"## FXP-A001: unknown instruction

The mnemonic is not in the instruction set. Mnemonics are lowercase,
for example `load_fast`, `binary_add` or `pop_jump_if_false`.
"#,
    },
    ErrorEntry {
        code: "FXP-A002",
        short: "extended_arg cannot be written",
        long: r#"## FXP-A002: extended_arg cannot be written

`extended_arg` prefixes are produced by layout when an operand needs
more than 16 bits. Write the wide operand directly.
"#,
    },
    ErrorEntry {
        code: "FXP-A003",
        short: "instruction takes no operand",
        long: r#"## FXP-A003: instruction takes no operand

Instructions below the operand threshold (`pop_top`, `binary_add`,
`return_value`, ...) stand alone on their line.
"#,
    },
    ErrorEntry {
        code: "FXP-A004",
        short: "instruction needs an operand",
        long: r#"## FXP-A004: instruction needs an operand

The instruction reads a local, name, constant, cell, label or count
and none was given.
"#,
    },
    ErrorEntry {
        code: "FXP-A005",
        short: "wrong kind of operand",
        long: r#"## FXP-A005: wrong kind of operand

The operand does not match what the instruction reads. Jumps take a
label name, `load_const` takes a literal, `compare_op` takes one of
`lt le eq ne gt ge`, counts take a non-negative integer.
"#,
    },
    ErrorEntry {
        code: "FXP-A006",
        short: "not a cell or free variable",
        long: r#"## FXP-A006: not a cell or free variable

`load_deref` and `store_deref` address names listed in `.cellvars`
or declared with `.freevar`.
"#,
    },
    ErrorEntry {
        code: "FXP-A007",
        short: "label defined twice",
        long: r#"## FXP-A007: label defined twice

Each label may be placed once per routine.
"#,
    },
    ErrorEntry {
        code: "FXP-A008",
        short: "label never defined",
        long: r#"## FXP-A008: label never defined

A jump names a label that is not placed anywhere in the routine.
"#,
    },
    ErrorEntry {
        code: "FXP-A009",
        short: "name declared twice",
        long: r#"## FXP-A009: name declared twice

Routine names are unique per file. Parameter, cell and free variable
names are unique per routine.
"#,
    },
    ErrorEntry {
        code: "FXP-A010",
        short: "parameter without default after one with default",
        long: r#"## FXP-A010: parameter without default after one with default

Defaults fill trailing parameters, so every parameter after the first
defaulted one needs a default too.

**Example:**

    def x(a = 1, b):
"#,
    },
    ErrorEntry {
        code: "FXP-A011",
        short: "default names an undefined global",
        long: r#"## FXP-A011: default names an undefined global

A default written as a bare name is looked up when the routine is
bound. Only builtins and routines defined earlier in the file exist
at that point.
"#,
    },
    ErrorEntry {
        code: "FXP-A012",
        short: "routine cannot be laid out",
        long: r#"## FXP-A012: routine cannot be laid out

Layout failed after assembly, for example because a `jump_forward` or
`for_iter` targets a label placed before it. Relative jumps only go
forward; use `jump_absolute` to loop back.
"#,
    },

    // ── Transformation ───────────────────────────────────────────────────────
    ErrorEntry {
        code: "FXP-T001",
        short: "malformed bytecode",
        long: r#"## FXP-T001: malformed bytecode

The routine's byte stream could not be decoded: an unknown opcode, a
truncated operand, a dangling `extended_arg` or a jump into the middle
of an instruction.
"#,
    },
    ErrorEntry {
        code: "FXP-T002",
        short: "rewritten routine cannot be laid out",
        long: r#"## FXP-T002: rewritten routine cannot be laid out

The rewritten instruction list failed to encode. This points at a bug
rather than a problem with the input routine.

If you see this, please file a bug report.
"#,
    },
    ErrorEntry {
        code: "FXP-R001",
        short: "routine name used for another binding",
        long: r#"## FXP-R001: routine name used for another binding

Inside a step routine its own name reads the running value. The
name cannot also be assigned globally, bound by an enclosing routine
as a non-local, or used as a parameter.

**Example:**

    def x():
        load_const 1
        store_global x    -- rebinding 'x'
        ...
"#,
    },

    // ── Usage ────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "FXP-U001",
        short: "bad arguments to fix",
        long: r#"## FXP-U001: bad arguments to fix

`fix` takes at most one positional argument, the routine, plus the
keywords `func`, `init` and `max_iterations`. `max_iterations` is a
non-negative integer.
"#,
    },
    ErrorEntry {
        code: "FXP-U002",
        short: "missing initial value",
        long: r#"## FXP-U002: missing initial value

Iteration starts from `init`, the first value of the running state.
There is no implicit starting value.
"#,
    },

    // ── Iteration ────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "FXP-D001",
        short: "no fixed point reached",
        long: r#"## FXP-D001: no fixed point reached

The running value kept changing for `max_iterations` calls. The
sequence may cycle (for example flip between two values), grow without
bound, or converge more slowly than the bound allows.
"#,
    },
    ErrorEntry {
        code: "FXP-D002",
        short: "step returned a malformed result",
        long: r#"## FXP-D002: step returned a malformed result

A step call must answer a tuple `(stop, value, arg1, ..)` of at least
two elements.
"#,
    },
    ErrorEntry {
        code: "FXP-V001",
        short: "runtime error in step routine",
        long: r#"## FXP-V001: runtime error in step routine

The routine failed while running: an unbound local, a call to a
non-callable value, a type mismatch in arithmetic, division by zero
and similar. The message names the cause.
"#,
    },
];

/// Look up an error entry by code (e.g. `"FXP-D001"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code == code)
}
