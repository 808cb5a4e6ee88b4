use std::collections::HashMap;

use crate::compiler::instr::{Cond, External, Instr, Label, Operand, Reg};

use super::{Fuel, MachineError};

const WORD: i64 = 8;
/// one past the highest stack word, 16-byte aligned
const STACK_TOP: i64 = 0x7fff_0000;
const STACK_WORDS: i64 = 1 << 16;
const STACK_BOTTOM: i64 = STACK_TOP - STACK_WORDS * WORD;
const HEAP_BASE: i64 = 0x1000_0000;
/// instruction `n` lives at `CODE_BASE + n` as far as return addresses go
const CODE_BASE: i64 = 0x40_0000;
/// return address planted under the routine started by [`Machine::call`]
const EXIT_ADDRESS: i64 = 0x3f_0000;
/// what external routines leave in the caller-saved registers they clobber
const CLOBBERED: i64 = 0x5a5a_5a5a_5a5a_5a5a;

#[derive(Debug, Default, Clone)]
struct Registers {
    rax: i64,
    rdi: i64,
    rsi: i64,
    rbp: i64,
    rsp: i64,
}

impl Registers {
    fn get(&self, reg: Reg) -> i64 {
        match reg {
            Reg::Rax => self.rax,
            Reg::Rdi => self.rdi,
            Reg::Rsi => self.rsi,
            Reg::Rbp => self.rbp,
            Reg::Rsp => self.rsp,
        }
    }

    fn set(&mut self, reg: Reg, value: i64) {
        match reg {
            Reg::Rax => self.rax = value,
            Reg::Rdi => self.rdi = value,
            Reg::Rsi => self.rsi = value,
            Reg::Rbp => self.rbp = value,
            Reg::Rsp => self.rsp = value,
        }
    }
}

/// Result of the last `cmp`
#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    equal: bool,
    less: bool,
}

impl Flags {
    fn holds(self, cond: Cond) -> bool {
        match cond {
            Cond::E => self.equal,
            Cond::L => self.less,
        }
    }
}

/// A routine that has been called and not yet returned
#[derive(Debug, Clone)]
struct Activation {
    routine: Box<str>,
    /// `%rsp` right before the `call`
    rsp: i64,
}

/// Interpreter for an instruction listing
#[derive(Debug)]
pub struct Machine<'p> {
    program: &'p [Instr],
    labels: HashMap<&'p Label, usize>,
    registers: Registers,
    flags: Flags,
    memory: HashMap<i64, i64>,
    heap_top: i64,
    activations: Vec<Activation>,
    fuel: Fuel,
    steps: u64,
    printed: Vec<i64>,
}

impl<'p> Machine<'p> {
    pub fn new(program: &'p [Instr]) -> Self {
        let mut labels = HashMap::new();
        for (index, instr) in program.iter().enumerate() {
            if let Instr::Label(label) = instr {
                labels.entry(label).or_insert(index);
            }
        }
        Self {
            program,
            labels,
            registers: Registers::default(),
            flags: Flags::default(),
            memory: HashMap::new(),
            heap_top: HEAP_BASE,
            activations: vec![],
            fuel: Fuel::default(),
            steps: 0,
            printed: vec![],
        }
    }

    pub fn with_fuel(mut self, fuel: Fuel) -> Self {
        self.fuel = fuel;
        self
    }

    /// Values passed to `lisp_print` so far
    pub fn printed(&self) -> &[i64] {
        &self.printed
    }

    pub fn into_printed(self) -> Vec<i64> {
        self.printed
    }

    /// Run the routine at `label` the way a C caller would: on a fresh,
    /// 16-byte aligned stack, until it returns. Gives back `%rax`.
    pub fn call(&mut self, label: &Label) -> Result<i64, MachineError> {
        let program = self.program;
        let mut ip = self.target(label)?;
        self.registers.rsp = STACK_TOP;
        self.activations.push(Activation {
            routine: Box::from(label.to_string().as_str()),
            rsp: STACK_TOP,
        });
        self.push(EXIT_ADDRESS)?;

        loop {
            if !self.fuel.should_continue() {
                return Err(MachineError::OutOfFuel { steps: self.steps });
            }
            self.fuel.consume(1);
            self.steps += 1;

            let instr = program.get(ip).ok_or(MachineError::RanOffEnd)?;
            ip += 1;
            match instr {
                Instr::Text | Instr::Global(_) | Instr::Label(_) => {}
                Instr::Push(src) => {
                    let value = self.read(*src)?;
                    self.push(value)?;
                }
                Instr::Pop(dst) => {
                    let value = self.pop()?;
                    self.write(instr, *dst, value)?;
                }
                Instr::Mov(src, dst) => {
                    let value = self.read(*src)?;
                    self.write(instr, *dst, value)?;
                }
                Instr::Add(src, dst) => {
                    let value = self.registers.get(*dst).wrapping_add(self.read(*src)?);
                    self.registers.set(*dst, value);
                }
                Instr::Sub(src, dst) => {
                    let value = self.registers.get(*dst).wrapping_sub(self.read(*src)?);
                    self.registers.set(*dst, value);
                }
                Instr::Imul(src, dst) => {
                    let value = self.registers.get(*dst).wrapping_mul(self.read(*src)?);
                    self.registers.set(*dst, value);
                }
                Instr::Cmp(src, dst) => {
                    let (lhs, rhs) = (self.registers.get(*dst), self.read(*src)?);
                    self.flags = Flags {
                        equal: lhs == rhs,
                        less: lhs < rhs,
                    };
                }
                Instr::Set(cond) => {
                    let bit = i64::from(self.flags.holds(*cond));
                    self.registers.rax = (self.registers.rax & !0xff) | bit;
                }
                Instr::ZeroExtendAl => self.registers.rax &= 0xff,
                Instr::Jmp(label) => ip = self.target(label)?,
                Instr::Jcc(cond, label) => {
                    if self.flags.holds(*cond) {
                        ip = self.target(label)?;
                    }
                }
                Instr::Call(Label::External(routine)) => self.external(*routine)?,
                Instr::Call(label) => {
                    let target = self.target(label)?;
                    self.activations.push(Activation {
                        routine: Box::from(label.to_string().as_str()),
                        rsp: self.registers.rsp,
                    });
                    self.push(CODE_BASE + ip as i64)?;
                    ip = target;
                }
                Instr::Ret => {
                    let address = self.pop()?;
                    let activation = self
                        .activations
                        .pop()
                        .ok_or(MachineError::StackUnderflow)?;
                    if activation.rsp != self.registers.rsp {
                        return Err(MachineError::Unbalanced {
                            routine: activation.routine,
                            expected: activation.rsp,
                            found: self.registers.rsp,
                        });
                    }
                    if address == EXIT_ADDRESS && self.activations.is_empty() {
                        return Ok(self.registers.rax);
                    }
                    ip = usize::try_from(address - CODE_BASE)
                        .ok()
                        .filter(|ip| *ip <= program.len())
                        .ok_or(MachineError::BadReturnAddress { address })?;
                }
            }
        }
    }

    fn target(&self, label: &Label) -> Result<usize, MachineError> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| MachineError::UnknownLabel {
                label: Box::from(label.to_string().as_str()),
            })
    }

    fn external(&mut self, routine: External) -> Result<(), MachineError> {
        let rsp = self.registers.rsp;
        if rsp % 16 != 0 {
            return Err(MachineError::MisalignedCall {
                routine: Box::from(Label::External(routine).to_string().as_str()),
                rsp,
            });
        }

        match routine {
            External::Alloc => {
                let size = self.registers.rdi;
                if !(1..=1 << 20).contains(&size) {
                    return Err(MachineError::BadAllocation { size });
                }
                self.registers.rax = self.heap_top;
                // blocks stay 16-byte aligned, like malloc's
                self.heap_top += (size + 15) & !15;
            }
            External::Print => {
                let value = self.registers.rdi;
                tracing::trace!("lisp_print({value})");
                self.printed.push(value);
                self.registers.rax = CLOBBERED;
            }
        }
        self.registers.rdi = CLOBBERED;
        self.registers.rsi = CLOBBERED;
        Ok(())
    }

    fn address(&self, base: Reg, disp: i32) -> Result<i64, MachineError> {
        let address = self.registers.get(base).wrapping_add(i64::from(disp));
        if address % WORD != 0 {
            return Err(MachineError::Unaligned { address });
        }
        let on_stack = (STACK_BOTTOM..STACK_TOP).contains(&address);
        let on_heap = (HEAP_BASE..self.heap_top).contains(&address);
        if on_stack || on_heap {
            Ok(address)
        } else {
            Err(MachineError::Unmapped { address })
        }
    }

    fn read(&self, src: Operand) -> Result<i64, MachineError> {
        Ok(match src {
            Operand::Reg(reg) => self.registers.get(reg),
            Operand::Imm(value) => value,
            Operand::Mem { base, disp } => {
                let address = self.address(base, disp)?;
                self.memory.get(&address).copied().unwrap_or_default()
            }
        })
    }

    fn write(&mut self, instr: &Instr, dst: Operand, value: i64) -> Result<(), MachineError> {
        match dst {
            Operand::Reg(reg) => self.registers.set(reg, value),
            Operand::Mem { base, disp } => {
                let address = self.address(base, disp)?;
                self.memory.insert(address, value);
            }
            Operand::Imm(_) => {
                return Err(MachineError::InvalidDestination {
                    instr: Box::from(instr.to_string().trim()),
                })
            }
        }
        Ok(())
    }

    fn push(&mut self, value: i64) -> Result<(), MachineError> {
        let rsp = self.registers.rsp - WORD;
        if rsp < STACK_BOTTOM {
            return Err(MachineError::StackOverflow);
        }
        self.registers.rsp = rsp;
        self.memory.insert(rsp, value);
        Ok(())
    }

    fn pop(&mut self) -> Result<i64, MachineError> {
        let rsp = self.registers.rsp;
        if rsp >= STACK_TOP {
            return Err(MachineError::StackUnderflow);
        }
        let value = self.read(Operand::mem(Reg::Rsp, 0))?;
        self.registers.rsp = rsp + WORD;
        Ok(value)
    }
}
