//! Turns a flat token sequence into one [`Expr`] per balanced form.
//!
//! Parsing is a single left-to-right pass with no backtracking. `define` and
//! `cons` are recognized while the tree is being built, every other
//! parenthesized form becomes an [`Expr::Application`] whose head is
//! classified once, here, so the code generator can match on it.
use std::{collections::HashSet, rc::Rc};

use crate::{
    error::{CompileError, CompileResult},
    lexer::{classify_atom, Atom, Span, Token},
    syntax::MAX_NESTING,
};

pub mod ast;
pub mod special_forms;

use ast::{Expr, FunctionDef};

/// Names the parser claims for itself; they can never name a function.
const SYNTACTIC_KEYWORDS: &[&str] = &["define", "cons"];

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    /// lists currently open
    depth: usize,
}

impl Parser {
    pub fn new(tokens: impl IntoIterator<Item = (Token, Span)>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .filter(|(token, _)| !token.is_trivia())
                .collect(),
            pos: 0,
            depth: 0,
        }
    }

    /// Parse every form in the token sequence.
    pub fn parse(mut self) -> CompileResult<Vec<Expr>> {
        let mut forms = vec![];
        while self.pos < self.tokens.len() {
            let span = self.tokens[self.pos].1.clone();
            match self.parse_expr(true)? {
                Some(expr) => {
                    tracing::trace!("parsed form {expr}");
                    forms.push(expr);
                }
                None => return Err(CompileError::syntax("unmatched `)`", span)),
            }
        }
        Ok(forms)
    }

    fn next(&mut self) -> Option<(Token, Span)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek(&self) -> Option<&(Token, Span)> {
        self.tokens.get(self.pos)
    }

    fn peek_atom(&self) -> Option<&str> {
        match self.peek() {
            Some((Token::Atom(text), _)) => Some(text),
            _ => None,
        }
    }

    fn end_of_input(&self) -> CompileError {
        let end = self.tokens.last().map_or(0, |(_, span)| span.end);
        CompileError::syntax("unexpected end of input inside a form", end..end)
    }

    /// Returns `None` when a `)` ends the enclosing list.
    fn parse_expr(&mut self, top_level: bool) -> CompileResult<Option<Expr>> {
        let Some((token, span)) = self.next() else {
            return Err(self.end_of_input());
        };

        match token {
            Token::RParen => Ok(None),
            Token::Atom(text) => Ok(Some(atom(&text))),
            Token::LParen => {
                if self.depth == MAX_NESTING {
                    return Err(CompileError::too_deep(span));
                }
                self.depth += 1;
                let list = self.parse_list_form(span, top_level);
                self.depth -= 1;
                list.map(Some)
            }
            Token::Whitespace | Token::Comment => unreachable!("trivia is filtered out"),
        }
    }

    /// A parenthesized form, with its `(` already consumed
    fn parse_list_form(&mut self, span: Span, top_level: bool) -> CompileResult<Expr> {
        match self.peek_atom() {
            Some("define") => {
                if !top_level {
                    return Err(CompileError::syntax(
                        "`define` is only allowed at top level",
                        span,
                    ));
                }
                self.pos += 1;
                self.parse_define(span)
            }
            Some("cons") => {
                self.pos += 1;
                self.parse_cons()
            }
            _ => self.parse_application(span),
        }
    }

    /// Sub-expressions up to the matching `)`
    fn parse_list(&mut self) -> CompileResult<Vec<Expr>> {
        let mut items = vec![];
        while let Some(expr) = self.parse_expr(false)? {
            items.push(expr);
        }
        Ok(items)
    }

    fn parse_application(&mut self, open: Span) -> CompileResult<Expr> {
        let mut items = self.parse_list()?.into_iter();
        let Some(head) = items.next() else {
            let end = self.tokens[self.pos - 1].1.end;
            return Err(CompileError::syntax(
                "empty application `()`",
                open.start..end,
            ));
        };
        Ok(Expr::apply(head, items.collect()))
    }

    fn parse_cons(&mut self) -> CompileResult<Expr> {
        let operands = self.parse_list()?;
        match <[Expr; 2]>::try_from(operands) {
            Ok([first, second]) => Ok(Expr::pair(first, second)),
            Err(operands) => Err(CompileError::arity("cons", 2, operands.len())),
        }
    }

    /// `(define (name param*) body)`, with the `(define` already consumed
    fn parse_define(&mut self, open: Span) -> CompileResult<Expr> {
        let header_error = |span: Span| {
            CompileError::syntax(
                "malformed `define` header, expected `(name param...)`",
                span,
            )
        };

        match self.next() {
            Some((Token::LParen, _)) => {}
            Some((_, span)) => return Err(header_error(span)),
            None => return Err(self.end_of_input()),
        }

        let name = match self.next() {
            Some((Token::Atom(text), span)) => {
                if classify_atom(&text) != Atom::Symbol {
                    return Err(header_error(span));
                }
                if SYNTACTIC_KEYWORDS.contains(&text.as_ref()) {
                    return Err(CompileError::syntax(
                        format!("`{text}` is syntax and cannot be redefined"),
                        span,
                    ));
                }
                text
            }
            Some((_, span)) => return Err(header_error(span)),
            None => return Err(self.end_of_input()),
        };

        let mut params = vec![];
        let mut seen = HashSet::new();
        loop {
            match self.next() {
                Some((Token::RParen, _)) => break,
                Some((Token::Atom(text), span)) => {
                    if classify_atom(&text) != Atom::Symbol {
                        return Err(header_error(span));
                    }
                    if !seen.insert(text.clone()) {
                        return Err(CompileError::syntax(
                            format!("duplicate parameter `{text}` in `{name}`"),
                            span,
                        ));
                    }
                    params.push(text);
                }
                Some((_, span)) => return Err(header_error(span)),
                None => return Err(self.end_of_input()),
            }
        }

        let Some(body) = self.parse_expr(false)? else {
            let end = self.tokens[self.pos - 1].1.end;
            return Err(CompileError::syntax(
                format!("`{name}` has no body"),
                open.start..end,
            ));
        };

        match self.next() {
            Some((Token::RParen, _)) => {}
            Some((_, span)) => {
                return Err(CompileError::syntax(
                    format!("`{name}` must have exactly one body expression"),
                    span,
                ))
            }
            None => return Err(self.end_of_input()),
        }

        Ok(Expr::FunctionDef(Rc::new(FunctionDef { name, params, body })))
    }
}

fn atom(text: &str) -> Expr {
    match classify_atom(text) {
        Atom::Number(value) => Expr::Number(value),
        Atom::Symbol => Expr::symbol(text),
    }
}

/// Scan and parse a snippet of source text.
pub fn parse_str(source: &str) -> CompileResult<Vec<Expr>> {
    Parser::new(crate::lexer::tokenize(source)?).parse()
}
