//! The expression tree handed from the parser to the code generator.
//!
//! Nodes are never mutated after parsing, code generation only reads them.
use core::fmt;
use std::rc::Rc;

use arbitrary::{Arbitrary, Unstructured};

use super::special_forms::Keyword;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// meaning is only resolved at code generation time
    Symbol(Box<str>),
    /// a `(cons a b)` literal
    Pair(Box<Expr>, Box<Expr>),
    Application {
        operator: Operator,
        operands: Vec<Expr>,
    },
    /// only ever produced for a top-level form
    FunctionDef(Rc<FunctionDef>),
}

impl Expr {
    pub fn symbol(name: impl AsRef<str>) -> Self {
        Self::Symbol(Box::from(name.as_ref()))
    }

    pub fn pair(first: Expr, second: Expr) -> Self {
        Self::Pair(Box::new(first), Box::new(second))
    }

    /// Build an application, classifying the head the same way the parser does.
    pub fn apply(head: Expr, operands: Vec<Expr>) -> Self {
        Self::Application {
            operator: Operator::from_expr(head),
            operands,
        }
    }
}

/// Head position of an [`Expr::Application`]
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Keyword(Keyword),
    /// a function name (or something that fails to resolve as one)
    Named(Box<str>),
    /// any non-symbol head, e.g. the first binding of a `let` binding list
    Expr(Box<Expr>),
}

impl Operator {
    pub fn from_expr(head: Expr) -> Self {
        match head {
            Expr::Symbol(name) => match Keyword::from_name(&name) {
                Some(keyword) => Self::Keyword(keyword),
                None => Self::Named(name),
            },
            other => Self::Expr(Box::new(other)),
        }
    }

    /// The symbol written in head position, if there is one
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Keyword(keyword) => Some(keyword.name()),
            Self::Named(name) => Some(name),
            Self::Expr(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Box<str>,
    /// pairwise distinct
    pub params: Vec<Box<str>>,
    pub body: Expr,
}

impl FunctionDef {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

// Printing gives back source text that parses to the same tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Symbol(name) => write!(f, "{name}"),
            Self::Pair(first, second) => write!(f, "(cons {first} {second})"),
            Self::Application { operator, operands } => {
                write!(f, "({operator}")?;
                for operand in operands {
                    write!(f, " {operand}")?;
                }
                write!(f, ")")
            }
            Self::FunctionDef(def) => write!(f, "{def}"),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyword(keyword) => write!(f, "{keyword}"),
            Self::Named(name) => write!(f, "{name}"),
            Self::Expr(head) => write!(f, "{head}"),
        }
    }
}

impl fmt::Display for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(define ({}", self.name)?;
        for param in &self.params {
            write!(f, " {param}")?;
        }
        write!(f, ") {})", self.body)
    }
}

// Arbitrary trees are syntactically valid but not necessarily compilable:
// arities and bindings are not checked.
const LEAF_SYMBOLS: &[&str] = &["x", "y", "n", "acc", "if", "car", "define", "cons", "<=?"];
const HEAD_SYMBOLS: &[&str] = &[
    "double", "fact", "f", "if", "let", "car", "cdr", "+", "-", "*", "=", "<", "eq?",
];
const FUNCTION_NAMES: &[&str] = &["double", "fact", "list-sum", "f"];
const PARAM_NAMES: &[&str] = &["a", "b", "n", "acc"];
const MAX_DEPTH: usize = 4;

fn arbitrary_expr(u: &mut Unstructured<'_>, depth: usize) -> arbitrary::Result<Expr> {
    let choice = if depth == 0 {
        u.int_in_range(0..=1)?
    } else {
        u.int_in_range(0..=4)?
    };
    Ok(match choice {
        0 => Expr::Number(f64::from(u.int_in_range::<i32>(-4000..=4000)?) / 4.0),
        1 => Expr::symbol(u.choose(LEAF_SYMBOLS)?),
        2 => Expr::pair(
            arbitrary_expr(u, depth - 1)?,
            arbitrary_expr(u, depth - 1)?,
        ),
        3 => {
            let operands = (0..u.int_in_range(0..=3)?)
                .map(|_| arbitrary_expr(u, depth - 1))
                .collect::<arbitrary::Result<_>>()?;
            Expr::apply(Expr::symbol(u.choose(HEAD_SYMBOLS)?), operands)
        }
        _ => {
            // a parenthesized head, which is never a bare symbol
            let head = match arbitrary_expr(u, depth - 1)? {
                Expr::Symbol(_) => Expr::apply(Expr::symbol(u.choose(HEAD_SYMBOLS)?), vec![]),
                head => head,
            };
            let operands = (0..u.int_in_range(0..=2)?)
                .map(|_| arbitrary_expr(u, depth - 1))
                .collect::<arbitrary::Result<_>>()?;
            Expr::apply(head, operands)
        }
    })
}

impl<'a> Arbitrary<'a> for Expr {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        arbitrary_expr(u, MAX_DEPTH)
    }
}

impl<'a> Arbitrary<'a> for FunctionDef {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let mut params = vec![];
        for param in PARAM_NAMES {
            if u.arbitrary()? {
                params.push(Box::from(*param));
            }
        }
        Ok(Self {
            name: Box::from(*u.choose(FUNCTION_NAMES)?),
            params,
            body: arbitrary_expr(u, MAX_DEPTH)?,
        })
    }
}
