use logos::Logos;

use crate::ast::Span;

fn unescape(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let s = lex.slice();
    let mut out = String::with_capacity(s.len());
    let mut chars = s[1..s.len() - 1].chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            _ => return None,
        }
    }
    Some(out)
}

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip(r"#[^\n]*", allow_greedy = true))]
pub enum Token {
    #[token("def")]
    Def,
    #[token("end")]
    End,
    #[token(".cellvars")]
    CellVars,
    #[token(".freevar")]
    FreeVar,

    #[token("None")]
    NoneKw,
    #[token("True")]
    True,
    #[token("False")]
    False,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Assign,

    #[regex(r"-?[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"-?[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""([^"\\\n]|\\[^\n])*""#, unescape)]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Instructions are one per line.
    #[token("\n")]
    Newline,
}

/// Lex assembly source into tokens with their byte spans.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span { start: range.start, end: range.end };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let snippet = source[range].to_string();
                return Err(LexError {
                    position: span.start,
                    suggestion: suggest_fix(&snippet),
                    snippet,
                });
            }
        }
    }

    Ok(tokens)
}

fn suggest_fix(bad_token: &str) -> String {
    if bad_token.starts_with('\'') {
        "Strings use double quotes: \"...\"".to_string()
    } else if bad_token.starts_with('"') {
        "Close the string on the same line; supported escapes are \\n \\t \\r \\0 \\\\ \\\"".to_string()
    } else if bad_token.starts_with('.') {
        "Directives are '.cellvars' and '.freevar'".to_string()
    } else if bad_token.chars().all(|c| c.is_ascii_digit() || c == '-') {
        "Integer literals must fit in 64 bits".to_string()
    } else {
        String::new()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unexpected '{snippet}' at byte {position}")]
pub struct LexError {
    pub position: usize,
    pub snippet: String,
    pub suggestion: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_routine_header() {
        assert_eq!(
            kinds("def x(f = cos):\n"),
            vec![
                Token::Def,
                Token::Ident("x".into()),
                Token::LParen,
                Token::Ident("f".into()),
                Token::Assign,
                Token::Ident("cos".into()),
                Token::RParen,
                Token::Colon,
                Token::Newline,
            ]
        );
    }

    #[test]
    fn lex_literals() {
        assert_eq!(
            kinds(r#"None True False 3 -4 2.5 1e3 "a\"b\n""#),
            vec![
                Token::NoneKw,
                Token::True,
                Token::False,
                Token::Int(3),
                Token::Int(-4),
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Str("a\"b\n".into()),
            ]
        );
    }

    #[test]
    fn keywords_need_exact_case() {
        assert_eq!(kinds("none"), vec![Token::Ident("none".into())]);
        assert_eq!(kinds("define"), vec![Token::Ident("define".into())]);
    }

    #[test]
    fn lex_comment_ignored() {
        assert_eq!(kinds("# header\nend # trailing"), vec![Token::Newline, Token::End]);
    }

    #[test]
    fn lex_directives() {
        assert_eq!(
            kinds(".cellvars a\n.freevar k = 1"),
            vec![
                Token::CellVars,
                Token::Ident("a".into()),
                Token::Newline,
                Token::FreeVar,
                Token::Ident("k".into()),
                Token::Assign,
                Token::Int(1),
            ]
        );
    }

    #[test]
    fn spans_are_byte_ranges() {
        let tokens = lex("  load_fast x").unwrap();
        assert_eq!(tokens[0].1, Span { start: 2, end: 11 });
        assert_eq!(tokens[1].1, Span { start: 12, end: 13 });
    }

    #[test]
    fn lex_error_with_suggestion() {
        let err = lex("load_const 'x'").unwrap_err();
        assert_eq!(err.position, 11);
        assert!(err.suggestion.contains("double quotes"));

        let err = lex("load_const \"open").unwrap_err();
        assert!(err.suggestion.contains("Close the string"));
    }
}
