pub mod ansi;
pub mod json;
pub mod registry;

use crate::assemble::AsmError;
use crate::ast::Span;
use crate::driver::IterateError;
use crate::fix::{FixError, UsageError};
use crate::rewrite::RewriteError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: true });
        self
    }

    pub fn with_secondary_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: false });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---- From impls for error types ----

impl From<&crate::lexer::LexError> for Diagnostic {
    fn from(e: &crate::lexer::LexError) -> Self {
        let span = Span {
            start: e.position,
            end: e.position + e.snippet.len().max(1),
        };
        let mut d = Diagnostic::error(format!("unexpected '{}'", e.snippet))
            .with_code("FXP-L001")
            .with_span(span, "here");
        if !e.suggestion.is_empty() {
            d = d.with_suggestion(e.suggestion.clone());
        }
        d
    }
}

impl From<&crate::parser::ParseError> for Diagnostic {
    fn from(e: &crate::parser::ParseError) -> Self {
        Diagnostic::error(&e.message).with_code(e.code).with_span(e.span, "here")
    }
}

fn asm_code(e: &AsmError) -> &'static str {
    match e {
        AsmError::Lex(_) => "FXP-L001",
        AsmError::Parse(p) => p.code,
        AsmError::UnknownInstruction { .. } => "FXP-A001",
        AsmError::ReservedInstruction { .. } => "FXP-A002",
        AsmError::UnexpectedOperand { .. } => "FXP-A003",
        AsmError::MissingOperand { .. } => "FXP-A004",
        AsmError::BadOperand { .. } => "FXP-A005",
        AsmError::UnknownCell { .. } => "FXP-A006",
        AsmError::DuplicateLabel { .. } => "FXP-A007",
        AsmError::UndefinedLabel { .. } => "FXP-A008",
        AsmError::DuplicateName { .. } => "FXP-A009",
        AsmError::DefaultOrder { .. } => "FXP-A010",
        AsmError::UndefinedDefault { .. } => "FXP-A011",
        AsmError::Encode { .. } => "FXP-A012",
    }
}

impl From<&AsmError> for Diagnostic {
    fn from(e: &AsmError) -> Self {
        match e {
            AsmError::Lex(lex) => Diagnostic::from(lex),
            AsmError::Parse(parse) => Diagnostic::from(parse),
            AsmError::UnknownInstruction { name, .. } => {
                let mut d = Diagnostic::error(e.to_string()).with_code(asm_code(e));
                if let Some(span) = e.span() {
                    d = d.with_span(span, "here");
                }
                let lower = name.to_ascii_lowercase();
                if lower != *name && crate::opcode::Opcode::from_mnemonic(&lower).is_some() {
                    d = d.with_suggestion(format!("mnemonics are lowercase: '{lower}'"));
                }
                d
            }
            AsmError::ReservedInstruction { .. } => Diagnostic::error(e.to_string())
                .with_code(asm_code(e))
                .with_span(e.span().unwrap_or(Span::UNKNOWN), "here")
                .with_note("operands wider than 16 bits are split automatically"),
            _ => {
                let mut d = Diagnostic::error(e.to_string()).with_code(asm_code(e));
                if let Some(span) = e.span() {
                    d = d.with_span(span, "here");
                }
                d
            }
        }
    }
}

impl From<&RewriteError> for Diagnostic {
    fn from(e: &RewriteError) -> Self {
        let RewriteError::NamingConflict { name, .. } = e;
        Diagnostic::error(e.to_string())
            .with_code("FXP-R001")
            .with_suggestion(format!("rename the other '{name}' or the routine itself"))
    }
}

impl From<&UsageError> for Diagnostic {
    fn from(e: &UsageError) -> Self {
        match e {
            UsageError::MissingInit(name) => Diagnostic::error(e.to_string())
                .with_code("FXP-U002")
                .with_suggestion(format!("pass init, the starting value of '{name}'")),
            _ => Diagnostic::error(e.to_string()).with_code("FXP-U001"),
        }
    }
}

impl From<&IterateError> for Diagnostic {
    fn from(e: &IterateError) -> Self {
        match e {
            IterateError::Divergence(d) => Diagnostic::error(e.to_string())
                .with_code("FXP-D001")
                .with_suggestion(format!(
                    "raise max_iterations above {} if the sequence converges slowly",
                    d.max_iterations
                )),
            IterateError::MalformedResult { .. } => Diagnostic::error(e.to_string()).with_code("FXP-D002"),
            IterateError::Vm(vm) => Diagnostic::from(vm),
        }
    }
}

impl From<&crate::vm::VmError> for Diagnostic {
    fn from(e: &crate::vm::VmError) -> Self {
        Diagnostic::error(e.to_string()).with_code("FXP-V001")
    }
}

impl From<&FixError> for Diagnostic {
    fn from(e: &FixError) -> Self {
        match e {
            FixError::Usage(u) => Diagnostic::from(u),
            FixError::Decode(_) => Diagnostic::error(e.to_string()).with_code("FXP-T001"),
            FixError::Encode(_) => Diagnostic::error(e.to_string()).with_code("FXP-T002"),
            FixError::Rewrite(r) => Diagnostic::from(r),
            FixError::Iterate(i) => Diagnostic::from(i),
        }
    }
}
