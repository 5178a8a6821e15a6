use serde::Serialize;

use super::{Diagnostic, Label, Severity};
use crate::ast::SourceMap;

#[derive(Serialize)]
struct JsonDiagnostic<'a> {
    severity: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    message: &'a str,
    labels: Vec<JsonLabel<'a>>,
    notes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

#[derive(Serialize)]
struct JsonLabel<'a> {
    start: usize,
    end: usize,
    message: &'a str,
    primary: bool,
    #[serde(flatten)]
    position: Option<Position>,
}

#[derive(Serialize)]
struct Position {
    line: usize,
    col: usize,
}

impl<'a> JsonLabel<'a> {
    fn new(label: &'a Label, map: Option<&SourceMap>) -> Self {
        JsonLabel {
            start: label.span.start,
            end: label.span.end,
            message: &label.message,
            primary: label.is_primary,
            position: map.map(|m| {
                let (line, col) = m.lookup(label.span.start);
                Position { line, col }
            }),
        }
    }
}

/// One diagnostic as a single JSON line. Labels carry `line`/`col` only when
/// the diagnostic has its source attached.
pub fn render(d: &Diagnostic) -> String {
    let map = d.source.as_deref().map(SourceMap::new);
    let out = JsonDiagnostic {
        severity: match d.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        },
        code: d.code,
        message: &d.message,
        labels: d.labels.iter().map(|l| JsonLabel::new(l, map.as_ref())).collect(),
        notes: &d.notes,
        suggestion: d.suggestion.as_deref(),
    };
    serde_json::to_string(&out).unwrap_or_else(|e| {
        serde_json::json!({ "severity": "error", "message": format!("cannot serialise diagnostic: {e}") })
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let d = Diagnostic::error("no fixed point reached");
        let out = render(&d);
        let v = parse_json(&out);
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "no fixed point reached");
        assert!(v["labels"].as_array().unwrap().is_empty());
    }

    #[test]
    fn render_with_span_and_source() {
        let d = Diagnostic::error("bad token")
            .with_span(Span { start: 14, end: 23 }, "here")
            .with_source("def x(a):\n    load_fast a\nend\n".to_string());
        let out = render(&d);
        let v = parse_json(&out);
        let label = &v["labels"][0];
        assert_eq!(label["start"], 14);
        assert_eq!(label["end"], 23);
        assert_eq!(label["primary"], true);
        assert_eq!(label["line"], 2);
        assert_eq!(label["col"], 5);
    }

    #[test]
    fn render_with_code() {
        let d = Diagnostic::error("label 'top' is never defined").with_code("FXP-A008");
        let v = parse_json(&render(&d));
        assert_eq!(v["code"], "FXP-A008");
        assert!(parse_json(&render(&Diagnostic::error("bad"))).get("code").is_none());
    }

    #[test]
    fn render_with_suggestion() {
        let d = Diagnostic::error("bad")
            .with_suggestion("try this instead");
        let out = render(&d);
        let v = parse_json(&out);
        assert_eq!(v["suggestion"], "try this instead");
    }

    #[test]
    fn render_with_notes() {
        let d = Diagnostic::error("bad")
            .with_note("in routine 'x'")
            .with_note("while fixing 'x'");
        let out = render(&d);
        let v = parse_json(&out);
        let notes = v["notes"].as_array().unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0], "in routine 'x'");
    }

    #[test]
    fn render_no_suggestion_key_absent() {
        let d = Diagnostic::error("bad");
        let out = render(&d);
        let v = parse_json(&out);
        // suggestion key should be absent when None
        assert!(v.get("suggestion").is_none() || v["suggestion"].is_null());
    }

    #[test]
    fn render_label_without_source_no_line_col() {
        let d = Diagnostic::error("bad")
            .with_span(Span { start: 5, end: 8 }, "here");
        let out = render(&d);
        let v = parse_json(&out);
        let label = &v["labels"][0];
        // No source → no line/col fields
        assert!(label.get("line").is_none());
        assert!(label.get("col").is_none());
    }

    #[test]
    fn render_is_valid_json() {
        let d = Diagnostic::error("complex error")
            .with_span(Span { start: 0, end: 5 }, "primary")
            .with_secondary_span(Span { start: 10, end: 12 }, "secondary")
            .with_note("some note")
            .with_suggestion("fix it")
            .with_source("hello world test".to_string());
        let out = render(&d);
        // Must be parseable JSON
        parse_json(&out);
    }

    #[test]
    fn render_warning_severity() {
        let d = Diagnostic::warning("unused label");
        let out = render(&d);
        let v = parse_json(&out);
        assert_eq!(v["severity"], "warning");
    }
}
