use crate::ast::*;
use crate::lexer::Token;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

fn describe(tok: &Token) -> String {
    match tok {
        Token::Ident(name) => format!("'{name}'"),
        Token::Int(n) => format!("integer {n}"),
        Token::Float(x) => format!("float {x}"),
        Token::Str(s) => format!("string {s:?}"),
        Token::Newline => "end of line".to_string(),
        Token::Def => "'def'".to_string(),
        Token::End => "'end'".to_string(),
        Token::CellVars => "'.cellvars'".to_string(),
        Token::FreeVar => "'.freevar'".to_string(),
        Token::NoneKw => "'None'".to_string(),
        Token::True => "'True'".to_string(),
        Token::False => "'False'".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::Comma => "','".to_string(),
        Token::Colon => "':'".to_string(),
        Token::Assign => "'='".to_string(),
    }
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        match self.tokens.get(self.pos) {
            Some((_, s)) => *s,
            // Past the end: point just after the last token.
            None => self
                .tokens
                .last()
                .map(|(_, s)| Span { start: s.end, end: s.end })
                .unwrap_or(Span::UNKNOWN),
        }
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|(_, s)| *s)
            .unwrap_or(Span::UNKNOWN)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<Span> {
        match self.peek() {
            Some(tok) if tok == expected => {
                let span = self.peek_span();
                self.advance();
                Ok(span)
            }
            Some(tok) => Err(self.error(
                "FXP-P003",
                format!("expected {}, got {}", describe(expected), describe(tok)),
            )),
            None => Err(self.error("FXP-P004", format!("expected {}, got EOF", describe(expected)))),
        }
    }

    fn expect_ident(&mut self) -> Result<Spanned<String>> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                let span = self.peek_span();
                self.advance();
                Ok(Spanned::new(name, span))
            }
            Some(tok) => Err(self.error("FXP-P005", format!("expected a name, got {}", describe(&tok)))),
            None => Err(self.error("FXP-P006", "expected a name, got EOF".into())),
        }
    }

    /// End of line, or end of input.
    fn expect_line_end(&mut self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(Token::Newline) => {
                self.advance();
                Ok(())
            }
            Some(tok) => Err(self.error("FXP-P007", format!("expected end of line, got {}", describe(tok)))),
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek() == Some(&Token::Newline) {
            self.advance();
        }
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        ParseError {
            code,
            position: self.pos,
            span: self.peek_span(),
            message,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Top-level parsing ----

    pub fn parse_module(&mut self) -> (Module, Vec<ParseError>) {
        let mut routines = Vec::new();
        let mut errors: Vec<ParseError> = Vec::new();
        const MAX_ERRORS: usize = 20;

        loop {
            self.skip_newlines();
            if self.at_end() || errors.len() >= MAX_ERRORS {
                break;
            }
            match self.parse_routine() {
                Ok(routine) => routines.push(routine),
                Err(e) => {
                    errors.push(e);
                    self.sync_past_end();
                }
            }
        }

        (Module { routines }, errors)
    }

    /// Skip to just after the next `end` line, or to the next `def`.
    fn sync_past_end(&mut self) {
        loop {
            match self.peek() {
                None => break,
                Some(Token::Def) if self.at_line_start() => break,
                Some(Token::End) if self.at_line_start() => {
                    self.advance();
                    break;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn at_line_start(&self) -> bool {
        self.pos == 0 || matches!(self.tokens.get(self.pos - 1), Some((Token::Newline, _)))
    }

    /// `def name(p, q = default): NEWLINE body end`
    fn parse_routine(&mut self) -> Result<Routine> {
        let start = match self.peek() {
            Some(Token::Def) => self.expect(&Token::Def)?,
            Some(tok) => {
                return Err(self.error("FXP-P001", format!("expected 'def', got {}", describe(tok))));
            }
            None => return Err(self.error("FXP-P002", "expected 'def', got EOF".into())),
        };
        let name = self.expect_ident()?.node;
        let params = self.parse_params()?;
        self.expect(&Token::Colon)?;
        self.expect_line_end()?;

        let mut cellvars = Vec::new();
        let mut freevars = Vec::new();
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Newline) => {
                    self.advance();
                }
                Some(Token::End) => break,
                Some(Token::CellVars) => {
                    self.advance();
                    while let Some(Token::Ident(_)) = self.peek() {
                        cellvars.push(self.expect_ident()?);
                    }
                    self.expect_line_end()?;
                }
                Some(Token::FreeVar) => {
                    let dstart = self.peek_span();
                    self.advance();
                    let fname = self.expect_ident()?.node;
                    self.expect(&Token::Assign)?;
                    let value = self.parse_literal()?;
                    freevars.push(FreeVar { name: fname, value, span: dstart.merge(self.prev_span()) });
                    self.expect_line_end()?;
                }
                Some(Token::Ident(_)) => self.parse_line(&mut body)?,
                Some(Token::Def) => {
                    return Err(self.error(
                        "FXP-P008",
                        format!("routine '{name}' is missing its 'end'"),
                    ));
                }
                Some(tok) => {
                    return Err(self.error(
                        "FXP-P009",
                        format!("expected an instruction or label, got {}", describe(tok)),
                    ));
                }
                None => {
                    return Err(self.error(
                        "FXP-P008",
                        format!("routine '{name}' is missing its 'end'"),
                    ));
                }
            }
        }
        let end = self.expect(&Token::End)?;
        self.expect_line_end()?;

        Ok(Routine { name, params, cellvars, freevars, body, span: start.merge(end) })
    }

    /// `(name [= default], ...)`
    fn parse_params(&mut self) -> Result<Vec<Param>> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        while self.peek() != Some(&Token::RParen) {
            if !params.is_empty() {
                self.expect(&Token::Comma)?;
            }
            let pname = self.expect_ident()?;
            let default = if self.peek() == Some(&Token::Assign) {
                self.advance();
                Some(match self.peek().cloned() {
                    Some(Token::Ident(g)) => {
                        self.advance();
                        ParamDefault::Global(g)
                    }
                    _ => ParamDefault::Literal(self.parse_literal()?),
                })
            } else {
                None
            };
            params.push(Param {
                name: pname.node,
                default,
                span: pname.span.merge(self.prev_span()),
            });
        }
        self.expect(&Token::RParen)?;
        Ok(params)
    }

    /// `label:` and/or `mnemonic [operand]` on one line.
    fn parse_line(&mut self, body: &mut Vec<Line>) -> Result<()> {
        let first = self.expect_ident()?;
        if self.peek() == Some(&Token::Colon) {
            self.advance();
            body.push(Line::Label(first));
            return match self.peek() {
                Some(Token::Ident(_)) => self.parse_line(body),
                _ => self.expect_line_end(),
            };
        }

        let operand = match self.peek().cloned() {
            None | Some(Token::Newline) => None,
            Some(Token::Ident(name)) => {
                let span = self.peek_span();
                self.advance();
                Some(Spanned::new(Operand::Name(name), span))
            }
            Some(_) => {
                let start = self.peek_span();
                let lit = self.parse_literal()?;
                Some(Spanned::new(Operand::Literal(lit), start.merge(self.prev_span())))
            }
        };
        self.expect_line_end()?;
        body.push(Line::Instr { mnemonic: first, operand });
        Ok(())
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        let lit = match self.peek().cloned() {
            Some(Token::NoneKw) => Literal::None,
            Some(Token::True) => Literal::Bool(true),
            Some(Token::False) => Literal::Bool(false),
            Some(Token::Int(n)) => Literal::Int(n),
            Some(Token::Float(x)) => Literal::Float(x),
            Some(Token::Str(s)) => Literal::Str(s),
            Some(Token::LParen) => return self.parse_tuple(),
            Some(tok) => {
                return Err(self.error("FXP-P010", format!("expected a literal, got {}", describe(&tok))));
            }
            None => return Err(self.error("FXP-P010", "expected a literal, got EOF".into())),
        };
        self.advance();
        Ok(lit)
    }

    /// `()`, `(a,)`, `(a, b)`, `(a, b,)`
    fn parse_tuple(&mut self) -> Result<Literal> {
        self.expect(&Token::LParen)?;
        let mut items = Vec::new();
        let mut trailing_comma = false;
        while self.peek() != Some(&Token::RParen) {
            if !items.is_empty() && !trailing_comma {
                self.expect(&Token::Comma)?;
            }
            items.push(self.parse_literal()?);
            trailing_comma = false;
            if self.peek() == Some(&Token::Comma) {
                self.advance();
                trailing_comma = true;
            }
        }
        if items.len() == 1 && !trailing_comma {
            return Err(self.error("FXP-P011", "a one-element tuple needs a trailing comma: (x,)".into()));
        }
        self.expect(&Token::RParen)?;
        Ok(Literal::Tuple(items))
    }
}

/// Parse a token stream into a module. Reports the first error.
pub fn parse(tokens: Vec<(Token, Span)>) -> Result<Module> {
    let mut parser = Parser::new(tokens);
    let (module, mut errors) = parser.parse_module();
    if errors.is_empty() {
        Ok(module)
    } else {
        Err(errors.swap_remove(0))
    }
}

/// Parse a token stream holding exactly one literal.
pub fn parse_literal(tokens: Vec<(Token, Span)>) -> Result<Literal> {
    let mut parser = Parser::new(tokens);
    parser.skip_newlines();
    let lit = parser.parse_literal()?;
    parser.skip_newlines();
    if let Some(tok) = parser.peek() {
        return Err(parser.error("FXP-P007", format!("expected end of input, got {}", describe(tok))));
    }
    Ok(lit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    #[test]
    fn parse_single_literal() {
        assert_eq!(parse_literal(lex("(1.5, None)\n").unwrap()).unwrap(),
            Literal::Tuple(vec![Literal::Float(1.5), Literal::None]));
        assert_eq!(parse_literal(lex("-3").unwrap()).unwrap(), Literal::Int(-3));
        let err = parse_literal(lex("1 2").unwrap()).unwrap_err();
        assert_eq!(err.code, "FXP-P007");
        let err = parse_literal(lex("cos").unwrap()).unwrap_err();
        assert_eq!(err.code, "FXP-P010");
    }

    fn parse_str(source: &str) -> Result<Module> {
        parse(lex(source).unwrap())
    }

    #[test]
    fn parse_routine_with_defaults() {
        let m = parse_str("def x(f = cos, n = 3):\n  load_fast f\n  return_value\nend\n").unwrap();
        assert_eq!(m.routines.len(), 1);
        let r = &m.routines[0];
        assert_eq!(r.name, "x");
        assert_eq!(r.params[0].name, "f");
        assert_eq!(r.params[0].default, Some(ParamDefault::Global("cos".into())));
        assert_eq!(r.params[1].default, Some(ParamDefault::Literal(Literal::Int(3))));
        assert_eq!(r.body.len(), 2);
        assert!(matches!(&r.body[1], Line::Instr { operand: None, .. }));
    }

    #[test]
    fn parse_labels_and_operands() {
        let src = "def f():\ntop: load_const (1, \"a\")\n  jump_absolute top\nout:\n  load_const -2.5\nend";
        let m = parse_str(src).unwrap();
        let body = &m.routines[0].body;
        assert_eq!(body.len(), 5);
        assert!(matches!(&body[0], Line::Label(l) if l.node == "top"));
        match &body[1] {
            Line::Instr { mnemonic, operand: Some(op) } => {
                assert_eq!(mnemonic.node, "load_const");
                assert_eq!(
                    op.node,
                    Operand::Literal(Literal::Tuple(vec![Literal::Int(1), Literal::Str("a".into())]))
                );
            }
            other => panic!("expected instruction, got {other:?}"),
        }
        assert!(matches!(&body[2], Line::Instr { operand: Some(op), .. } if op.node == Operand::Name("top".into())));
        assert!(matches!(&body[3], Line::Label(l) if l.node == "out"));
    }

    #[test]
    fn parse_directives() {
        let src = "def f(a):\n  .cellvars a b\n  .freevar k = 10\n  load_deref k\nend";
        let r = &parse_str(src).unwrap().routines[0];
        assert_eq!(r.cellvars.iter().map(|c| c.node.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(r.freevars[0].name, "k");
        assert_eq!(r.freevars[0].value, Literal::Int(10));
    }

    #[test]
    fn parse_tuples() {
        let src = "def f():\n load_const ()\n load_const (1,)\n load_const (1, 2,)\nend";
        let r = &parse_str(src).unwrap().routines[0];
        let lits: Vec<_> = r
            .body
            .iter()
            .map(|l| match l {
                Line::Instr { operand: Some(op), .. } => op.node.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(lits[0], Operand::Literal(Literal::Tuple(vec![])));
        assert_eq!(lits[1], Operand::Literal(Literal::Tuple(vec![Literal::Int(1)])));
        assert_eq!(lits[2], Operand::Literal(Literal::Tuple(vec![Literal::Int(1), Literal::Int(2)])));

        let err = parse_str("def f():\n load_const (1)\nend").unwrap_err();
        assert_eq!(err.code, "FXP-P011");
    }

    #[test]
    fn multiple_routines_and_blank_lines() {
        let src = "\n# two routines\ndef a():\nend\n\ndef b(x):\n  load_fast x\nend\n";
        let m = parse_str(src).unwrap();
        assert_eq!(m.routines.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn missing_end_reported() {
        let err = parse_str("def a():\n  pop_top\n").unwrap_err();
        assert_eq!(err.code, "FXP-P008");
    }

    #[test]
    fn extra_tokens_on_line() {
        let err = parse_str("def a():\n  load_fast x y\nend").unwrap_err();
        assert_eq!(err.code, "FXP-P007");
        assert_eq!(err.span, Span { start: 23, end: 24 });
    }

    #[test]
    fn recovery_collects_errors_per_routine() {
        let tokens = lex("def a(:\nend\ndef b():\n  load_const )\nend\ndef c():\nend").unwrap();
        let mut parser = Parser::new(tokens);
        let (module, errors) = parser.parse_module();
        assert_eq!(errors.len(), 2);
        assert_eq!(module.routines.len(), 1);
        assert_eq!(module.routines[0].name, "c");
    }
}
