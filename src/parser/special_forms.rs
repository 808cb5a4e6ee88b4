use core::fmt;

use arbitrary::Arbitrary;

/// Keywords whose operands are interpreted by fixed compiler rules.
///
/// `define` and `cons` are not listed here: the parser turns those into their
/// own node kinds while it is building the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
pub enum SpecialForm {
    If,
    Let,
    Car,
    Cdr,
}

impl SpecialForm {
    pub fn name(self) -> &'static str {
        match self {
            Self::If => "if",
            Self::Let => "let",
            Self::Car => "car",
            Self::Cdr => "cdr",
        }
    }

    /// Exact number of operands the form takes
    pub fn arity(self) -> usize {
        match self {
            Self::If => 3,
            Self::Let => 2,
            Self::Car | Self::Cdr => 1,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "if" => Self::If,
            "let" => Self::Let,
            "car" => Self::Car,
            "cdr" => Self::Cdr,
            _ => return None,
        })
    }
}

/// Binary operators that compile down to a single machine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
pub enum Primitive {
    Add,
    Sub,
    Mul,
    /// `=`
    NumEq,
    /// `<`
    Less,
    /// `eq?`
    Eq,
}

impl Primitive {
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::NumEq => "=",
            Self::Less => "<",
            Self::Eq => "eq?",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "=" => Self::NumEq,
            "<" => Self::Less,
            "eq?" => Self::Eq,
            _ => return None,
        })
    }
}

/// What sits in the head position of an application, decided once at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Special(SpecialForm),
    Primitive(Primitive),
}

impl Keyword {
    pub fn from_name(name: &str) -> Option<Self> {
        SpecialForm::from_name(name)
            .map(Self::Special)
            .or_else(|| Primitive::from_name(name).map(Self::Primitive))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Special(form) => form.name(),
            Self::Primitive(prim) => prim.name(),
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
