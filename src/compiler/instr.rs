//! Structured x86-64 instructions and their AT&T rendering.
//!
//! The code generator only ever builds [`Instr`] values, the text is produced
//! by `Display`. The machine simulator in [`crate::runtime`] executes the
//! same values, so what is tested is exactly what gets printed.
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Rax,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rax => "rax",
            Self::Rdi => "rdi",
            Self::Rsi => "rsi",
            Self::Rbp => "rbp",
            Self::Rsp => "rsp",
        };
        write!(f, "%{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    /// `disp(%base)`
    Mem { base: Reg, disp: i32 },
}

impl Operand {
    pub fn mem(base: Reg, disp: i32) -> Self {
        Self::Mem { base, disp }
    }
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Self::Reg(reg)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(reg) => write!(f, "{reg}"),
            Self::Imm(value) => write!(f, "${value}"),
            Self::Mem { base, disp: 0 } => write!(f, "({base})"),
            Self::Mem { base, disp } => write!(f, "{disp}({base})"),
        }
    }
}

/// Condition codes read after a `cmp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    /// equal
    E,
    /// signed less than
    L,
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::E => write!(f, "e"),
            Self::L => write!(f, "l"),
        }
    }
}

/// Routines the generated code calls but does not define
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum External {
    /// `lisp_alloc(size)`, returns the address of `size` fresh bytes
    Alloc,
    /// `lisp_print(value)`
    Print,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Label {
    /// the exported `lisp_entry`
    Entry,
    /// a user function, by its Lisp name
    Function(Box<str>),
    /// routine for the n-th top-level expression
    TopLevel(usize),
    Else(usize),
    EndIf(usize),
    External(External),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry => write!(f, "lisp_entry"),
            Self::Function(name) => {
                // alphanumerics pass through, everything else (`_` included)
                // becomes `_xx` so distinct names never collide
                write!(f, "fn_")?;
                for byte in name.bytes() {
                    if byte.is_ascii_alphanumeric() {
                        write!(f, "{}", byte as char)?;
                    } else {
                        write!(f, "_{byte:02x}")?;
                    }
                }
                Ok(())
            }
            Self::TopLevel(n) => write!(f, "toplevel_{n}"),
            Self::Else(n) => write!(f, "else_{n}"),
            Self::EndIf(n) => write!(f, "endif_{n}"),
            Self::External(External::Alloc) => write!(f, "lisp_alloc"),
            Self::External(External::Print) => write!(f, "lisp_print"),
        }
    }
}

/// One line of assembly. Two-operand forms are written source first, like
/// the AT&T text they print as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instr {
    /// `.text`
    Text,
    /// `.globl`
    Global(Label),
    Label(Label),
    Push(Operand),
    Pop(Operand),
    Mov(Operand, Operand),
    Add(Operand, Reg),
    Sub(Operand, Reg),
    Imul(Operand, Reg),
    /// flags from `dst - src`
    Cmp(Operand, Reg),
    /// `set<cc> %al`
    Set(Cond),
    /// `movzbq %al, %rax`
    ZeroExtendAl,
    Jmp(Label),
    Jcc(Cond, Label),
    Call(Label),
    Ret,
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, ".text"),
            Self::Global(label) => write!(f, ".globl {label}"),
            Self::Label(label) => write!(f, "{label}:"),
            Self::Push(src) => write!(f, "    pushq {src}"),
            Self::Pop(dst) => write!(f, "    popq {dst}"),
            Self::Mov(src, dst) => write!(f, "    movq {src}, {dst}"),
            Self::Add(src, dst) => write!(f, "    addq {src}, {dst}"),
            Self::Sub(src, dst) => write!(f, "    subq {src}, {dst}"),
            Self::Imul(src, dst) => write!(f, "    imulq {src}, {dst}"),
            Self::Cmp(src, dst) => write!(f, "    cmpq {src}, {dst}"),
            Self::Set(cond) => write!(f, "    set{cond} %al"),
            Self::ZeroExtendAl => write!(f, "    movzbq %al, %rax"),
            Self::Jmp(label) => write!(f, "    jmp {label}"),
            Self::Jcc(cond, label) => write!(f, "    j{cond} {label}"),
            Self::Call(label) => write!(f, "    call {label}"),
            Self::Ret => write!(f, "    ret"),
        }
    }
}

/// A finished, self-contained assembly listing
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Assembly {
    instrs: Vec<Instr>,
}

impl Assembly {
    pub(crate) fn new(instrs: Vec<Instr>) -> Self {
        Self { instrs }
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// Every label defined in the listing, in order
    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.instrs.iter().filter_map(|instr| match instr {
            Instr::Label(label) => Some(label),
            _ => None,
        })
    }
}

impl fmt::Display for Assembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instr in &self.instrs {
            writeln!(f, "{instr}")?;
        }
        Ok(())
    }
}
