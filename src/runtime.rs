//! runtimes execute compiled listings without an assembler or a linker
//!
//! [`Machine`] interprets the same [`Instr`](crate::compiler::instr::Instr)
//! values the code generator prints, with built-in versions of the external
//! routines (`lisp_alloc`, `lisp_print`) a real host would link in. It is
//! strict where hardware is not: unaligned or stray memory accesses, calls
//! out with a misaligned stack and routines that return with a different
//! `%rsp` than they were called with all fault.

use crate::compiler::instr::{Assembly, Label};

pub mod fuel;
mod machine;

pub use fuel::Fuel;
pub use machine::Machine;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MachineError {
    #[error("jump or call to undefined label `{label}`")]
    UnknownLabel { label: Box<str> },
    #[error("unaligned memory access at {address:#x}")]
    Unaligned { address: i64 },
    #[error("access to unmapped memory at {address:#x}")]
    Unmapped { address: i64 },
    #[error("`{routine}` called with misaligned %rsp {rsp:#x}")]
    MisalignedCall { routine: Box<str>, rsp: i64 },
    #[error("stack underflow past the entry frame")]
    StackUnderflow,
    #[error("stack overflow")]
    StackOverflow,
    #[error("`{routine}` returned with %rsp {found:#x}, but was called with {expected:#x}")]
    Unbalanced {
        routine: Box<str>,
        expected: i64,
        found: i64,
    },
    #[error("return to invalid address {address:#x}")]
    BadReturnAddress { address: i64 },
    #[error("`lisp_alloc` called with invalid size {size}")]
    BadAllocation { size: i64 },
    #[error("`{instr}` cannot write to its destination")]
    InvalidDestination { instr: Box<str> },
    #[error("execution ran past the last instruction")]
    RanOffEnd,
    #[error("out of fuel after {steps} steps")]
    OutOfFuel { steps: u64 },
}

/// Run a whole program from `lisp_entry`, returning what it printed.
pub fn run(asm: &Assembly) -> Result<Vec<i64>, MachineError> {
    run_with_fuel(asm, Fuel::default())
}

pub fn run_with_fuel(asm: &Assembly, fuel: Fuel) -> Result<Vec<i64>, MachineError> {
    let mut machine = Machine::new(asm.instrs()).with_fuel(fuel);
    machine.call(&Label::Entry)?;
    Ok(machine.into_printed())
}
