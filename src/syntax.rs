//! A lossless [`rowan`] tree over a whole source file.
//!
//! The tree only knows about parentheses: it is what splits a file into its
//! balanced top-level forms and remembers where each of them lives, so that
//! later errors can point back at the source. Giving forms a meaning is the
//! job of [`crate::parser`].

use rowan::{GreenNodeBuilder, NodeOrToken};

use crate::{
    error::{CompileError, CompileResult},
    lexer::{Span, Token},
};

/// Syntax kinds of the source tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[repr(u16)]
pub enum SyntaxKind {
    // tokens
    /// (
    LPAREN = 0,
    /// )
    RPAREN,
    /// a number or a symbol, told apart by the parser
    ATOM,
    /// any run of whitespace
    WHITESPACE,
    /// ; comment
    COMMENT,

    // composite nodes
    /// `(+ 2 3)` and everything nested inside it
    LIST,
    /// top-level node: the whole file
    ROOT,
}
use SyntaxKind::*;

impl SyntaxKind {
    pub fn is_trivia(self) -> bool {
        matches!(self, WHITESPACE | COMMENT)
    }
}

impl From<SyntaxKind> for rowan::SyntaxKind {
    fn from(kind: SyntaxKind) -> Self {
        Self(kind as u16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LispLang {}
impl rowan::Language for LispLang {
    type Kind = SyntaxKind;
    fn kind_from_raw(raw: rowan::SyntaxKind) -> Self::Kind {
        match raw.0 {
            0 => LPAREN,
            1 => RPAREN,
            2 => ATOM,
            3 => WHITESPACE,
            4 => COMMENT,
            5 => LIST,
            6 => ROOT,
            other => unreachable!("unknown syntax kind {other}"),
        }
    }
    fn kind_to_raw(kind: Self::Kind) -> rowan::SyntaxKind {
        kind.into()
    }
}

pub type SyntaxNode = rowan::SyntaxNode<LispLang>;
pub type SyntaxToken = rowan::SyntaxToken<LispLang>;
pub type SyntaxElement = rowan::NodeOrToken<SyntaxNode, SyntaxToken>;

fn span_of(range: rowan::TextRange) -> Span {
    usize::from(range.start())..usize::from(range.end())
}

/// Deepest list nesting a form may have
pub const MAX_NESTING: usize = 256;

/// Root of the tree for a file
#[derive(Debug, Clone)]
pub struct SourceFile(SyntaxNode);

impl SourceFile {
    /// Build the tree, failing on the first unbalanced parenthesis.
    pub fn parse(text: &str) -> CompileResult<Self> {
        let mut builder = GreenNodeBuilder::new();
        builder.start_node(ROOT.into());

        // spans of the `(` that are still waiting for their `)`
        let mut open: Vec<Span> = vec![];
        let mut lexer = Token::lexer(text);
        while let Some(token) = lexer.next() {
            let span = lexer.span();
            let token = token.map_err(|err| CompileError::syntax(err.to_string(), span.clone()))?;
            match token {
                Token::LParen => {
                    if open.len() == MAX_NESTING {
                        return Err(CompileError::too_deep(span));
                    }
                    builder.start_node(LIST.into());
                    builder.token(LPAREN.into(), lexer.slice());
                    open.push(span);
                }
                Token::RParen => {
                    if open.pop().is_none() {
                        return Err(CompileError::syntax("unmatched `)`", span));
                    }
                    builder.token(RPAREN.into(), lexer.slice());
                    builder.finish_node();
                }
                Token::Atom(_) => builder.token(ATOM.into(), lexer.slice()),
                Token::Whitespace => builder.token(WHITESPACE.into(), lexer.slice()),
                Token::Comment => builder.token(COMMENT.into(), lexer.slice()),
            }
        }

        if let Some(span) = open.pop() {
            return Err(CompileError::syntax(
                "unexpected end of input, `(` is never closed",
                span,
            ));
        }

        builder.finish_node();
        Ok(Self(SyntaxNode::new_root(builder.finish())))
    }

    pub fn syntax(&self) -> &SyntaxNode {
        &self.0
    }

    /// The top-level forms, in file order
    pub fn forms(&self) -> impl Iterator<Item = Form> + '_ {
        self.0.children_with_tokens().filter_map(Form::cast)
    }
}

/// One balanced top-level form: either a parenthesized list or a bare atom.
#[derive(Debug, Clone)]
pub enum Form {
    List(SyntaxNode),
    Atom(SyntaxToken),
}

impl Form {
    fn cast(element: SyntaxElement) -> Option<Self> {
        match element {
            NodeOrToken::Node(node) if node.kind() == LIST => Some(Self::List(node)),
            NodeOrToken::Token(token) if token.kind() == ATOM => Some(Self::Atom(token)),
            _ => None,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::List(node) => span_of(node.text_range()),
            Self::Atom(token) => span_of(token.text_range()),
        }
    }

    pub fn text(&self) -> String {
        match self {
            Self::List(node) => node.text().to_string(),
            Self::Atom(token) => token.text().to_string(),
        }
    }

    /// The flat token sequence the parser consumes, with file-relative spans.
    /// Trivia is dropped.
    pub fn tokens(&self) -> Vec<(Token, Span)> {
        let to_token = |token: SyntaxToken| {
            let kind = match token.kind() {
                LPAREN => Token::LParen,
                RPAREN => Token::RParen,
                ATOM => Token::Atom(Box::from(token.text())),
                _ => return None,
            };
            Some((kind, span_of(token.text_range())))
        };

        match self {
            Self::List(node) => node
                .descendants_with_tokens()
                .filter_map(SyntaxElement::into_token)
                .filter_map(to_token)
                .collect(),
            Self::Atom(token) => to_token(token.clone()).into_iter().collect(),
        }
    }
}
