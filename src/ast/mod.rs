use serde::{Deserialize, Serialize};

use crate::vm::Const;

pub mod source_map;
pub use source_map::SourceMap;

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Wraps a node with its source span. Transparent to serde (serializes as inner node only).
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T: Serialize> Serialize for Spanned<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Spanned<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(|node| Spanned { node, span: Span::UNKNOWN })
    }
}

// ---- Assembly AST ----

/// Constant written in source: `None`, `True`, `3`, `2.5`, `"s"`, `(1, "a")`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Literal>),
}

impl Literal {
    pub fn to_const(&self) -> Const {
        match self {
            Literal::None => Const::None,
            Literal::Bool(b) => Const::Bool(*b),
            Literal::Int(n) => Const::Int(*n),
            Literal::Float(x) => Const::Float(*x),
            Literal::Str(s) => Const::Str(s.clone()),
            Literal::Tuple(items) => Const::Tuple(items.iter().map(Literal::to_const).collect()),
        }
    }
}

/// Parameter default: a literal, or a global looked up when the module loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamDefault {
    Literal(Literal),
    Global(String),
}

/// `name` or `name = default`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub default: Option<ParamDefault>,
    #[serde(skip)]
    pub span: Span,
}

/// `.freevar name = literal`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeVar {
    pub name: String,
    pub value: Literal,
    #[serde(skip)]
    pub span: Span,
}

/// Instruction operand as written. Its meaning depends on the mnemonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Name(String),
    Literal(Literal),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Line {
    /// `name:`
    Label(Spanned<String>),
    /// `mnemonic [operand]`
    Instr {
        mnemonic: Spanned<String>,
        operand: Option<Spanned<Operand>>,
    },
}

/// `def name(params): .. end`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub name: String,
    pub params: Vec<Param>,
    pub cellvars: Vec<Spanned<String>>,
    pub freevars: Vec<FreeVar>,
    pub body: Vec<Line>,
    #[serde(skip)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub routines: Vec<Routine>,
}
