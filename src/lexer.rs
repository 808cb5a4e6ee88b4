pub use logos::Span;
use logos::{Lexer, Logos};

use crate::error::{CompileError, CompileResult};

#[derive(thiserror::Error, Debug, PartialEq, Clone, Default)]
pub enum LexerError {
    #[default]
    #[error("invalid token encountered")]
    Invalid,
}

/// Tokens are lexed from some source. Trivia is kept so the source tree
/// built on top of them stays lossless.
#[derive(Debug, Clone, PartialEq, Logos)]
#[logos(error = LexerError)]
pub enum Token {
    #[regex("[ \t\r\n\x0C]+")]
    Whitespace,
    // a `;` only opens a comment at the start of a token, `a;b` is one atom
    #[regex(r";[^\n]*")]
    Comment,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[regex(r"[^ \t\r\n\x0C();][^ \t\r\n\x0C()]*", |l| Box::from(l.slice()))]
    Atom(Box<str>),
}

impl Token {
    pub fn lexer(source: &str) -> Lexer<Self> {
        <Self as Logos>::lexer(source)
    }

    pub fn is_trivia(&self) -> bool {
        matches!(self, Self::Whitespace | Self::Comment)
    }
}

/// Scan `source` into the flat, trivia-free token sequence the parser consumes.
pub fn tokenize(source: &str) -> CompileResult<Vec<(Token, Span)>> {
    let mut tokens = vec![];
    for (token, span) in Token::lexer(source).spanned() {
        match token {
            Ok(token) if token.is_trivia() => {}
            Ok(token) => tokens.push((token, span)),
            Err(err) => return Err(CompileError::syntax(err.to_string(), span)),
        }
    }
    Ok(tokens)
}

/// What a bare atom means once it has been scanned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Atom {
    Number(f64),
    Symbol,
}

// Re-lexing the atom text lets logos decide between the two readings. The
// symbol pattern matches every atom in full, so a number only wins when it
// covers the same length, i.e. the whole atom.
#[derive(Debug, Clone, Copy, PartialEq, Logos)]
enum Literal {
    #[regex(r"-?[0-9]+(\.[0-9]*)?", priority = 10, callback = |l| l.slice().parse::<f64>().ok())]
    Number(f64),
    #[regex(r"[^ \t\r\n\x0C()]+", priority = 1)]
    Symbol,
}

/// Classify an atom as a number iff the entire text is a signed decimal
/// literal (optional leading `-`, digits, optional fractional part).
pub fn classify_atom(text: &str) -> Atom {
    let mut lexer = Literal::lexer(text);
    match lexer.next() {
        Some(Ok(Literal::Number(value))) if lexer.span().len() == text.len() => {
            Atom::Number(value)
        }
        _ => Atom::Symbol,
    }
}
