//! Errors shared by every stage of the compiler. All of them are fatal: the
//! first one aborts the run.

use core::fmt;

use crate::{lexer::Span, syntax::MAX_NESTING};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("syntax error: {message}")]
    Syntax { message: Box<str>, span: Option<Span> },
    #[error("`{form}` expects {expected} operand(s), found {found}")]
    Arity {
        form: Box<str>,
        expected: usize,
        found: usize,
    },
    #[error("unresolved symbol `{name}`")]
    UnresolvedSymbol { name: Box<str> },
    #[error("function `{name}` is already defined")]
    DuplicateDefinition { name: Box<str> },
    #[error("number literal {value} cannot be represented as a machine word")]
    UnsupportedNumber { value: f64 },
}

impl CompileError {
    pub(crate) fn syntax(message: impl Into<Box<str>>, span: impl Into<Option<Span>>) -> Self {
        Self::Syntax {
            message: message.into(),
            span: span.into(),
        }
    }

    /// A syntax error found after parsing, it gets the span of its form.
    pub(crate) fn malformed(message: impl Into<Box<str>>) -> Self {
        Self::Syntax {
            message: message.into(),
            span: None,
        }
    }

    /// `span` is the `(` one level past [`MAX_NESTING`].
    pub(crate) fn too_deep(span: Span) -> Self {
        Self::syntax(
            format!("lists nest deeper than {MAX_NESTING} levels"),
            span,
        )
    }

    pub(crate) fn arity(form: impl fmt::Display, expected: usize, found: usize) -> Self {
        Self::Arity {
            form: Box::from(form.to_string().as_str()),
            expected,
            found,
        }
    }

    pub(crate) fn unresolved(name: impl AsRef<str>) -> Self {
        Self::UnresolvedSymbol {
            name: Box::from(name.as_ref()),
        }
    }

    /// The most precise span this error knows about by itself
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Syntax { span, .. } => span.clone(),
            _ => None,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// A [`CompileError`] anchored in the source it came from.
///
/// Errors that carry no span of their own (anything raised by the code
/// generator) are anchored at the top-level form being compiled.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{error}")]
pub struct Diagnostic {
    pub error: CompileError,
    pub span: Span,
}

impl Diagnostic {
    pub fn new(error: CompileError, fallback: Span) -> Self {
        let span = error.span().unwrap_or(fallback);
        Self { error, span }
    }
}
