//! Compile expression trees into x86-64 stack-machine code.
//!
//! Every expression compiles to code that leaves exactly one word pushed on
//! the stack, whatever it contains. Composite forms compile their operands
//! first, pop what they consume and push their own result, so the forms
//! nest without any further bookkeeping.
//!
//! For example:
//!
//! (define (double n) (* n 2))
//!
//! compiles to
//!
//! fn_double:
//!     pushq %rbp
//!     movq %rsp, %rbp
//!     pushq 16(%rbp)
//!     pushq $2
//!     popq %rdi
//!     popq %rax
//!     imulq %rdi, %rax
//!     pushq %rax
//!     popq %rax
//!     movq %rbp, %rsp
//!     popq %rbp
//!     ret
//!
//! The frame base is `%rbp`. Parameters sit above it, pushed right to left by
//! the caller, `let` locals sit below it in space reserved by the prologue.
//! The generator knows how many words it has pushed at every point, which is
//! how each `call` gets a 16-byte aligned `%rsp`.

use std::rc::Rc;

use crate::{
    error::{CompileError, CompileResult},
    parser::{
        ast::{Expr, FunctionDef, Operator},
        special_forms::{Keyword, Primitive, SpecialForm},
    },
};

pub mod environment;
pub mod instr;

use environment::{FunctionTable, LabelCounter, LexicalTable, WORD};
use instr::{Assembly, Cond, External, Instr, Label, Operand, Reg};

/// Compiles the top-level forms of one run, in order.
///
/// Functions are registered as their `define` is compiled, so a form can only
/// call functions defined before it (or itself, from inside its own body).
#[derive(Debug, Default)]
pub struct Compiler {
    functions: FunctionTable,
    labels: LabelCounter,
    code: Vec<Instr>,
    toplevels: usize,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile one top-level form. Nothing is emitted for a form that fails.
    #[tracing::instrument(skip_all)]
    pub fn compile_form(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::FunctionDef(def) => self.compile_function(def),
            expr => self.compile_toplevel(expr),
        }
    }

    fn compile_function(&mut self, def: &Rc<FunctionDef>) -> CompileResult<()> {
        // registered first so the body can call itself
        self.functions.register(Rc::clone(def))?;
        let frame = Frame::new(
            &self.functions,
            &mut self.labels,
            LexicalTable::for_function(def),
        );
        match frame.routine(Label::Function(def.name.clone()), &def.body) {
            Ok(code) => {
                self.code.extend(code);
                Ok(())
            }
            Err(err) => {
                // its label is never emitted, so later forms must not call it
                self.functions.unregister(&def.name);
                Err(err)
            }
        }
    }

    fn compile_toplevel(&mut self, expr: &Expr) -> CompileResult<()> {
        let frame = Frame::new(&self.functions, &mut self.labels, LexicalTable::new());
        let code = frame.routine(Label::TopLevel(self.toplevels), expr)?;
        self.toplevels += 1;
        self.code.extend(code);
        Ok(())
    }

    /// Wrap everything compiled so far into a listing with its entry point.
    ///
    /// `lisp_entry` runs the top-level expressions in order and hands each
    /// result to `lisp_print`.
    pub fn finish(self) -> Assembly {
        let mut instrs = vec![Instr::Text, Instr::Global(Label::Entry)];
        instrs.extend(self.code);

        instrs.push(Instr::Label(Label::Entry));
        instrs.push(Instr::Push(Reg::Rbp.into()));
        instrs.push(Instr::Mov(Reg::Rsp.into(), Reg::Rbp.into()));
        for n in 0..self.toplevels {
            instrs.push(Instr::Call(Label::TopLevel(n)));
            instrs.push(Instr::Mov(Reg::Rax.into(), Reg::Rdi.into()));
            instrs.push(Instr::Call(Label::External(External::Print)));
        }
        instrs.push(Instr::Mov(Operand::Imm(0), Reg::Rax.into()));
        instrs.push(Instr::Pop(Reg::Rbp.into()));
        instrs.push(Instr::Ret);

        tracing::trace!("finished {} top-level routine(s)", self.toplevels);
        Assembly::new(instrs)
    }
}

/// Immediate for `n` words
fn words(n: usize) -> Operand {
    Operand::Imm(i64::from(WORD) * n as i64)
}

/// Code generation state for a single routine
struct Frame<'c> {
    functions: &'c FunctionTable,
    labels: &'c mut LabelCounter,
    lexical: LexicalTable,
    code: Vec<Instr>,
    /// words pushed since the prologue
    depth: usize,
}

impl<'c> Frame<'c> {
    fn new(functions: &'c FunctionTable, labels: &'c mut LabelCounter, lexical: LexicalTable) -> Self {
        Self {
            functions,
            labels,
            lexical,
            code: vec![],
            depth: 0,
        }
    }

    fn routine(mut self, label: Label, body: &Expr) -> CompileResult<Vec<Instr>> {
        let locals = let_slots(body);
        // keep %rsp 16-byte aligned once the locals are reserved
        let reserved = locals + locals % 2;
        tracing::debug!("{label} reserves {reserved} local slot(s)");

        self.emit(Instr::Label(label));
        self.emit(Instr::Push(Reg::Rbp.into()));
        self.emit(Instr::Mov(Reg::Rsp.into(), Reg::Rbp.into()));
        if reserved > 0 {
            self.emit(Instr::Sub(words(reserved), Reg::Rsp));
        }

        self.expr(body)?;
        self.pop(Reg::Rax.into());
        debug_assert_eq!(self.depth, 0);
        debug_assert!(self.lexical.locals() <= reserved);

        self.emit(Instr::Mov(Reg::Rbp.into(), Reg::Rsp.into()));
        self.emit(Instr::Pop(Reg::Rbp.into()));
        self.emit(Instr::Ret);
        Ok(self.code)
    }

    fn emit(&mut self, instr: Instr) {
        self.code.push(instr);
    }

    fn push(&mut self, src: Operand) {
        self.emit(Instr::Push(src));
        self.depth += 1;
    }

    fn pop(&mut self, dst: Operand) {
        self.emit(Instr::Pop(dst));
        self.depth -= 1;
    }

    fn expr(&mut self, expr: &Expr) -> CompileResult<()> {
        let entry = self.depth;
        match expr {
            Expr::Number(value) => self.number(*value)?,
            Expr::Symbol(name) => {
                let slot = self
                    .lexical
                    .lookup(name)
                    .ok_or_else(|| CompileError::unresolved(name))?;
                self.push(Operand::mem(Reg::Rbp, slot.offset()));
            }
            Expr::Pair(first, second) => self.pair(first, second)?,
            Expr::Application { operator, operands } => self.application(operator, operands)?,
            Expr::FunctionDef(def) => {
                return Err(CompileError::malformed(format!(
                    "`define` of `{}` is only allowed at top level",
                    def.name
                )))
            }
        }
        debug_assert_eq!(self.depth, entry + 1);
        Ok(())
    }

    fn number(&mut self, value: f64) -> CompileResult<()> {
        let word = machine_word(value)?;
        if i32::try_from(word).is_ok() {
            self.push(Operand::Imm(word));
        } else {
            // pushq only takes a sign-extended 32-bit immediate
            self.emit(Instr::Mov(Operand::Imm(word), Reg::Rax.into()));
            self.push(Reg::Rax.into());
        }
        Ok(())
    }

    fn pair(&mut self, first: &Expr, second: &Expr) -> CompileResult<()> {
        self.expr(first)?;
        self.expr(second)?;

        let pad = self.depth % 2 == 1;
        if pad {
            self.emit(Instr::Sub(words(1), Reg::Rsp));
        }
        self.emit(Instr::Mov(words(2), Reg::Rdi.into()));
        self.emit(Instr::Call(Label::External(External::Alloc)));
        if pad {
            self.emit(Instr::Add(words(1), Reg::Rsp));
        }

        self.pop(Reg::Rsi.into());
        self.pop(Reg::Rdi.into());
        self.emit(Instr::Mov(Reg::Rdi.into(), Operand::mem(Reg::Rax, 0)));
        self.emit(Instr::Mov(Reg::Rsi.into(), Operand::mem(Reg::Rax, WORD)));
        self.push(Reg::Rax.into());
        Ok(())
    }

    fn application(&mut self, operator: &Operator, operands: &[Expr]) -> CompileResult<()> {
        // a defined function wins over every keyword
        let functions = self.functions;
        if let Some(def) = operator.name().and_then(|name| functions.get(name)) {
            return self.call(def, operands);
        }

        match operator {
            Operator::Keyword(Keyword::Special(form)) => match (form, operands) {
                (SpecialForm::If, [cond, then, otherwise]) => self.if_(cond, then, otherwise),
                (SpecialForm::Let, [bindings, body]) => self.let_(bindings, body),
                (SpecialForm::Car, [pair]) => self.field(pair, 0),
                (SpecialForm::Cdr, [pair]) => self.field(pair, WORD),
                (form, operands) => Err(CompileError::arity(
                    form.name(),
                    form.arity(),
                    operands.len(),
                )),
            },
            Operator::Keyword(Keyword::Primitive(prim)) => match operands {
                [lhs, rhs] => self.primitive(*prim, lhs, rhs),
                operands => Err(CompileError::arity(prim.name(), 2, operands.len())),
            },
            Operator::Named(name) => Err(CompileError::unresolved(name)),
            Operator::Expr(head) => Err(CompileError::malformed(format!(
                "`{head}` is not a function and cannot be applied"
            ))),
        }
    }

    fn call(&mut self, def: &FunctionDef, operands: &[Expr]) -> CompileResult<()> {
        if operands.len() != def.arity() {
            return Err(CompileError::arity(&def.name, def.arity(), operands.len()));
        }

        let entry = self.depth;
        // padding goes below the arguments, the callee finds them at 16(%rbp) on
        let pad = (entry + operands.len()) % 2;
        if pad == 1 {
            self.emit(Instr::Sub(words(1), Reg::Rsp));
            self.depth += 1;
        }
        for operand in operands.iter().rev() {
            self.expr(operand)?;
        }
        self.emit(Instr::Call(Label::Function(def.name.clone())));

        let cleanup = operands.len() + pad;
        if cleanup > 0 {
            self.emit(Instr::Add(words(cleanup), Reg::Rsp));
        }
        self.depth = entry;
        self.push(Reg::Rax.into());
        Ok(())
    }

    fn if_(&mut self, cond: &Expr, then: &Expr, otherwise: &Expr) -> CompileResult<()> {
        let n = self.labels.next();
        tracing::trace!("if labels else_{n}, endif_{n}");

        self.expr(cond)?;
        self.pop(Reg::Rax.into());
        self.emit(Instr::Cmp(Operand::Imm(0), Reg::Rax));
        self.emit(Instr::Jcc(Cond::E, Label::Else(n)));

        let entry = self.depth;
        self.expr(then)?;
        self.emit(Instr::Jmp(Label::EndIf(n)));

        // only one branch runs, both start from the same depth
        self.emit(Instr::Label(Label::Else(n)));
        self.depth = entry;
        self.expr(otherwise)?;
        self.emit(Instr::Label(Label::EndIf(n)));
        Ok(())
    }

    fn let_(&mut self, bindings: &Expr, body: &Expr) -> CompileResult<()> {
        for (name, value) in let_bindings(bindings)? {
            // the value is compiled before its name is bound
            self.expr(value)?;
            let slot = self.lexical.bind_local(name);
            self.pop(Operand::mem(Reg::Rbp, slot.offset()));
        }
        self.expr(body)
    }

    fn field(&mut self, pair: &Expr, disp: i32) -> CompileResult<()> {
        self.expr(pair)?;
        self.pop(Reg::Rax.into());
        self.push(Operand::mem(Reg::Rax, disp));
        Ok(())
    }

    fn primitive(&mut self, prim: Primitive, lhs: &Expr, rhs: &Expr) -> CompileResult<()> {
        self.expr(lhs)?;
        self.expr(rhs)?;
        self.pop(Reg::Rdi.into());
        self.pop(Reg::Rax.into());

        let rhs = Operand::from(Reg::Rdi);
        match prim {
            Primitive::Add => self.emit(Instr::Add(rhs, Reg::Rax)),
            Primitive::Sub => self.emit(Instr::Sub(rhs, Reg::Rax)),
            Primitive::Mul => self.emit(Instr::Imul(rhs, Reg::Rax)),
            Primitive::NumEq | Primitive::Eq | Primitive::Less => {
                let cond = if prim == Primitive::Less {
                    Cond::L
                } else {
                    Cond::E
                };
                self.emit(Instr::Cmp(rhs, Reg::Rax));
                self.emit(Instr::Set(cond));
                self.emit(Instr::ZeroExtendAl);
            }
        }
        self.push(Reg::Rax.into());
        Ok(())
    }
}

/// The word a number literal denotes, if it has one.
fn machine_word(value: f64) -> CompileResult<i64> {
    // `i64::MAX as f64` rounds up to 2^63, which is already out of range
    if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 {
        Ok(value as i64)
    } else {
        Err(CompileError::UnsupportedNumber { value })
    }
}

/// Split the binding list of a `let`, `((x 1) (y 2))`, into name/value pairs.
///
/// The parser sees that list as an application whose head is the first
/// binding, so it is taken apart here.
fn let_bindings(list: &Expr) -> CompileResult<Vec<(&str, &Expr)>> {
    let malformed = || {
        CompileError::malformed(format!(
            "`let` expects a list of `(name value)` bindings, found `{list}`"
        ))
    };
    let Expr::Application {
        operator: Operator::Expr(first),
        operands,
    } = list
    else {
        return Err(malformed());
    };

    std::iter::once(first.as_ref())
        .chain(operands)
        .map(|binding| match binding {
            Expr::Application { operator, operands } => match (operator.name(), operands.as_slice()) {
                (Some(name), [value]) => Ok((name, value)),
                _ => Err(malformed()),
            },
            _ => Err(malformed()),
        })
        .collect()
}

/// Local slots a routine needs: one per `let` binding anywhere in its body.
///
/// Slots are never reused, not even by a rebinding, so this is an exact count
/// of what code generation will hand out.
fn let_slots(expr: &Expr) -> usize {
    match expr {
        Expr::Number(_) | Expr::Symbol(_) | Expr::FunctionDef(_) => 0,
        Expr::Pair(first, second) => let_slots(first) + let_slots(second),
        Expr::Application { operator, operands } => {
            let own = match (operator, operands.as_slice()) {
                (Operator::Keyword(Keyword::Special(SpecialForm::Let)), [bindings, _]) => {
                    let_bindings(bindings).map_or(0, |bindings| bindings.len())
                }
                _ => 0,
            };
            let head = match operator {
                Operator::Expr(head) => let_slots(head),
                _ => 0,
            };
            own + head + operands.iter().map(let_slots).sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{
        instr::{Assembly, Cond, External, Instr, Label, Operand, Reg},
        let_slots, Compiler,
    };
    use crate::{
        error::{CompileError, CompileResult},
        parser::parse_str,
        runtime,
    };
    use arbitrary::Unstructured;
    use arbtest::arbtest;
    use assert2::{check, let_assert};

    fn compile(source: &str) -> CompileResult<Assembly> {
        let mut compiler = Compiler::new();
        for expr in parse_str(source)? {
            compiler.compile_form(&expr)?;
        }
        Ok(compiler.finish())
    }

    fn routine<'a>(asm: &'a Assembly, label: &Label) -> &'a [Instr] {
        let instrs = asm.instrs();
        let start = instrs
            .iter()
            .position(|instr| instr == &Instr::Label(label.clone()))
            .expect("routine is defined");
        let len = instrs[start..]
            .iter()
            .position(|instr| instr == &Instr::Ret)
            .expect("routine returns");
        &instrs[start..=start + len]
    }

    #[test]
    fn addition() {
        let_assert!(Ok(asm) = compile("(+ 1 2)"));
        check!(
            routine(&asm, &Label::TopLevel(0))
                == [
                    Instr::Label(Label::TopLevel(0)),
                    Instr::Push(Reg::Rbp.into()),
                    Instr::Mov(Reg::Rsp.into(), Reg::Rbp.into()),
                    Instr::Push(Operand::Imm(1)),
                    Instr::Push(Operand::Imm(2)),
                    Instr::Pop(Reg::Rdi.into()),
                    Instr::Pop(Reg::Rax.into()),
                    Instr::Add(Reg::Rdi.into(), Reg::Rax),
                    Instr::Push(Reg::Rax.into()),
                    Instr::Pop(Reg::Rax.into()),
                    Instr::Mov(Reg::Rbp.into(), Reg::Rsp.into()),
                    Instr::Pop(Reg::Rbp.into()),
                    Instr::Ret,
                ]
        );
    }

    #[test]
    fn header_and_entry() {
        let_assert!(Ok(asm) = compile("1 2"));
        let text = asm.to_string();
        check!(text.starts_with(".text\n.globl lisp_entry\n"));
        let entry = routine(&asm, &Label::Entry);
        let calls: Vec<_> = entry
            .iter()
            .filter_map(|instr| match instr {
                Instr::Call(label) => Some(label.clone()),
                _ => None,
            })
            .collect();
        check!(
            calls
                == vec![
                    Label::TopLevel(0),
                    Label::External(External::Print),
                    Label::TopLevel(1),
                    Label::External(External::Print),
                ]
        );
    }

    #[test]
    fn let_locals_and_frame() {
        let_assert!(Ok(asm) = compile("(let ((x 10) (y 20)) (+ x y))"));
        let code = routine(&asm, &Label::TopLevel(0));
        check!(code[3] == Instr::Sub(Operand::Imm(16), Reg::Rsp));
        check!(code.contains(&Instr::Pop(Operand::mem(Reg::Rbp, -8))));
        check!(code.contains(&Instr::Pop(Operand::mem(Reg::Rbp, -16))));
        check!(code.contains(&Instr::Push(Operand::mem(Reg::Rbp, -16))));
    }

    #[test]
    fn let_rebinding_uses_a_new_slot() {
        let_assert!(Ok(asm) = compile("(let ((x 1) (x (+ x 1))) x)"));
        let code = routine(&asm, &Label::TopLevel(0));
        // the second `x` reads the first one, the body reads the second
        check!(code.contains(&Instr::Push(Operand::mem(Reg::Rbp, -8))));
        check!(code.contains(&Instr::Pop(Operand::mem(Reg::Rbp, -16))));
        check!(code[code.len() - 5] == Instr::Push(Operand::mem(Reg::Rbp, -16)));
        check!(code[3] == Instr::Sub(Operand::Imm(16), Reg::Rsp));
    }

    #[test]
    fn frame_size_prepass() {
        let_assert!(Ok(exprs) = parse_str(
            "(let ((a 1)) (if a (let ((b 2) (c 3)) b) (car (cons (let ((d 4)) d) 0))))"
        ));
        check!(let_slots(&exprs[0]) == 4);
        let_assert!(Ok(exprs) = parse_str("(let ((a (let ((b 1)) b))) a)"));
        check!(let_slots(&exprs[0]) == 2);
        let_assert!(Ok(exprs) = parse_str("(+ 1 2)"));
        check!(let_slots(&exprs[0]) == 0);
    }

    #[test]
    fn odd_frame_is_padded() {
        let_assert!(Ok(asm) = compile("(let ((x 1)) x)"));
        check!(routine(&asm, &Label::TopLevel(0))[3] == Instr::Sub(Operand::Imm(16), Reg::Rsp));
    }

    #[test]
    fn function_parameters() {
        let_assert!(Ok(asm) = compile("(define (sub2 a b) (- a b))"));
        let code = routine(&asm, &Label::Function(Box::from("sub2")));
        check!(code[3] == Instr::Push(Operand::mem(Reg::Rbp, 16)));
        check!(code[4] == Instr::Push(Operand::mem(Reg::Rbp, 24)));
        check!(code.contains(&Instr::Sub(Reg::Rdi.into(), Reg::Rax)));
    }

    #[test]
    fn calls_push_arguments_right_to_left() {
        let_assert!(Ok(asm) = compile("(define (sub2 a b) (- a b)) (sub2 5 3)"));
        let code = routine(&asm, &Label::TopLevel(0));
        check!(
            code[3..8]
                == [
                    Instr::Push(Operand::Imm(3)),
                    Instr::Push(Operand::Imm(5)),
                    Instr::Call(Label::Function(Box::from("sub2"))),
                    Instr::Add(Operand::Imm(16), Reg::Rsp),
                    Instr::Push(Reg::Rax.into()),
                ]
        );
    }

    #[test]
    fn calls_are_aligned() {
        let_assert!(Ok(asm) = compile("(define (id a) a) (id 1) (+ 1 (id 2))"));
        // one argument on an empty frame: pad first
        let code = routine(&asm, &Label::TopLevel(0));
        check!(code[3] == Instr::Sub(Operand::Imm(8), Reg::Rsp));
        check!(code[4] == Instr::Push(Operand::Imm(1)));
        check!(code[6] == Instr::Add(Operand::Imm(16), Reg::Rsp));
        // one word already pushed: no padding
        let code = routine(&asm, &Label::TopLevel(1));
        check!(code[4] == Instr::Push(Operand::Imm(2)));
        check!(code[6] == Instr::Add(Operand::Imm(8), Reg::Rsp));
    }

    #[test]
    fn pair_allocation() {
        let_assert!(Ok(asm) = compile("(cons 7 8)"));
        let code = routine(&asm, &Label::TopLevel(0));
        check!(
            code[5..12]
                == [
                    Instr::Mov(Operand::Imm(16), Reg::Rdi.into()),
                    Instr::Call(Label::External(External::Alloc)),
                    Instr::Pop(Reg::Rsi.into()),
                    Instr::Pop(Reg::Rdi.into()),
                    Instr::Mov(Reg::Rdi.into(), Operand::mem(Reg::Rax, 0)),
                    Instr::Mov(Reg::Rsi.into(), Operand::mem(Reg::Rax, 8)),
                    Instr::Push(Reg::Rax.into()),
                ]
        );
    }

    #[test]
    fn comparison() {
        let_assert!(Ok(asm) = compile("(< 1 2)"));
        let code = routine(&asm, &Label::TopLevel(0));
        check!(
            code[7..10]
                == [
                    Instr::Cmp(Reg::Rdi.into(), Reg::Rax),
                    Instr::Set(Cond::L),
                    Instr::ZeroExtendAl,
                ]
        );
    }

    #[test]
    fn labels_continue_across_forms() {
        let_assert!(Ok(asm) = compile("(if 1 2 3) (if (if 0 1 0) 4 5)"));
        let labels: Vec<_> = asm
            .labels()
            .filter(|label| matches!(label, Label::Else(_) | Label::EndIf(_)))
            .cloned()
            .collect();
        check!(
            labels
                == vec![
                    Label::Else(0),
                    Label::EndIf(0),
                    Label::Else(2),
                    Label::EndIf(2),
                    Label::Else(1),
                    Label::EndIf(1),
                ]
        );
    }

    #[test]
    fn large_literals() {
        let_assert!(Ok(asm) = compile("5000000000"));
        let code = routine(&asm, &Label::TopLevel(0));
        check!(code[3] == Instr::Mov(Operand::Imm(5_000_000_000), Reg::Rax.into()));
        check!(code[4] == Instr::Push(Reg::Rax.into()));
    }

    #[test]
    fn unsupported_numbers() {
        let_assert!(Err(CompileError::UnsupportedNumber { value }) = compile("(+ 1.5 2)"));
        check!(value == 1.5);
        let_assert!(Err(CompileError::UnsupportedNumber { .. }) = compile("99999999999999999999"));
        // a trailing point is still an integer
        let_assert!(Ok(_) = compile("7."));
    }

    #[test]
    fn unresolved_symbols() {
        let_assert!(Err(CompileError::UnresolvedSymbol { name }) = compile("(+ x 1)"));
        check!(name.as_ref() == "x");
        let_assert!(Err(CompileError::UnresolvedSymbol { name }) = compile("(nope 1)"));
        check!(name.as_ref() == "nope");
        // variables are not callable
        let_assert!(Err(CompileError::UnresolvedSymbol { .. }) = compile("(let ((f 1)) (f))"));
        // functions are not values
        let_assert!(Err(CompileError::UnresolvedSymbol { .. }) = compile("(define (f) 1) (+ f 1)"));
        // bindings never leak out of the form or function that made them
        let_assert!(Err(CompileError::UnresolvedSymbol { .. }) = compile("(let ((x 1)) x) x"));
        let_assert!(Err(CompileError::UnresolvedSymbol { .. }) = compile("(define (f n) n) (define (g) n)"));
    }

    #[test]
    fn forward_references() {
        let_assert!(Err(CompileError::UnresolvedSymbol { name }) = compile("(double 2) (define (double n) (* n 2))"));
        check!(name.as_ref() == "double");
        let_assert!(Ok(_) = compile("(define (double n) (* n 2)) (double 2)"));
        // self recursion
        let_assert!(Ok(_) = compile("(define (fact n) (if (< n 1) 1 (* n (fact (- n 1)))))"));
    }

    #[test]
    fn duplicate_definitions() {
        let_assert!(
            Err(CompileError::DuplicateDefinition { name }) =
                compile("(define (f) 1) (define (f) 2)")
        );
        check!(name.as_ref() == "f");
    }

    #[test]
    fn functions_shadow_keywords() {
        let_assert!(Ok(asm) = compile("(define (car a b) (+ a b)) (car 1 2)"));
        let code = routine(&asm, &Label::TopLevel(0));
        check!(code.contains(&Instr::Call(Label::Function(Box::from("car")))));
    }

    #[test]
    fn arity_errors() {
        let_assert!(Err(CompileError::Arity { form, expected: 3, found: 2 }) = compile("(if 1 2)"));
        check!(form.as_ref() == "if");
        let_assert!(Err(CompileError::Arity { expected: 2, found: 1, .. }) = compile("(let ((x 1)))"));
        let_assert!(Err(CompileError::Arity { expected: 1, found: 2, .. }) = compile("(car 1 2)"));
        let_assert!(Err(CompileError::Arity { expected: 2, found: 3, .. }) = compile("(+ 1 2 3)"));
        let_assert!(
            Err(CompileError::Arity { form, expected: 1, found: 0 }) = compile("(define (id a) a) (id)")
        );
        check!(form.as_ref() == "id");
    }

    #[test]
    fn malformed_let() {
        let_assert!(Err(CompileError::Syntax { .. }) = compile("(let (x 1) x)"));
        let_assert!(Err(CompileError::Syntax { .. }) = compile("(let ((x)) x)"));
        let_assert!(Err(CompileError::Syntax { .. }) = compile("(let ((x 1 2)) x)"));
        let_assert!(Err(CompileError::Syntax { .. }) = compile("(let ((1 2)) 3)"));
        let_assert!(Err(CompileError::Syntax { .. }) = compile("(let x x)"));
    }

    #[test]
    fn applying_an_expression() {
        let_assert!(Err(CompileError::Syntax { .. }) = compile("((cons 1 2) 3)"));
    }

    #[test]
    fn failed_forms_emit_nothing() {
        let mut compiler = Compiler::new();
        let_assert!(Ok(exprs) = parse_str("(+ 1 (if 1 2 y))"));
        let_assert!(Err(_) = compiler.compile_form(&exprs[0]));

        let_assert!(Ok(exprs) = parse_str("(define (f) y) (f) (define (f) 1) (f)"));
        let_assert!(Err(CompileError::UnresolvedSymbol { name }) = compiler.compile_form(&exprs[0]));
        check!(name.as_ref() == "y");
        let_assert!(Err(CompileError::UnresolvedSymbol { name }) = compiler.compile_form(&exprs[1]));
        check!(name.as_ref() == "f");
        // the name is free again
        let_assert!(Ok(()) = compiler.compile_form(&exprs[2]));
        let_assert!(Ok(()) = compiler.compile_form(&exprs[3]));

        let asm = compiler.finish();
        check!(asm.labels().count() == 3);
        let_assert!(Ok(printed) = crate::run(&asm));
        check!(printed == vec![1]);
    }

    /// Source text of a program that compiles, along with how many `if`s
    /// and top-level expressions it contains.
    struct Program {
        source: String,
        ifs: usize,
        toplevels: usize,
    }

    const PRELUDE: &str = "(define (double n) (* n 2))\n\
        (define (pick a b c) (if (< a b) c (+ a (double b))))\n";
    const OPERATORS: &[&str] = &["+", "-", "*", "=", "<", "eq?"];
    const LOCALS: &[&str] = &["a", "b", "x"];

    struct ProgramBuilder<'u, 'a> {
        u: &'u mut Unstructured<'a>,
        scope: Vec<&'static str>,
        functions: Vec<(&'static str, usize)>,
        ifs: usize,
    }

    impl ProgramBuilder<'_, '_> {
        fn expr(&mut self, depth: usize) -> arbitrary::Result<String> {
            let choice = if depth == 0 {
                self.u.int_in_range(0..=1)?
            } else {
                self.u.int_in_range(0..=6)?
            };
            Ok(match choice {
                1 if !self.scope.is_empty() => self.u.choose(&self.scope)?.to_string(),
                0 | 1 => self.u.int_in_range(-100..=100i64)?.to_string(),
                2 => {
                    let op = self.u.choose(OPERATORS)?;
                    format!("({op} {} {})", self.expr(depth - 1)?, self.expr(depth - 1)?)
                }
                3 => {
                    self.ifs += 1;
                    format!(
                        "(if {} {} {})",
                        self.expr(depth - 1)?,
                        self.expr(depth - 1)?,
                        self.expr(depth - 1)?
                    )
                }
                4 => {
                    let outer = self.scope.len();
                    let mut bindings = vec![];
                    for _ in 0..self.u.int_in_range(1..=3)? {
                        let value = self.expr(depth - 1)?;
                        let name = *self.u.choose(LOCALS)?;
                        bindings.push(format!("({name} {value})"));
                        self.scope.push(name);
                    }
                    let body = self.expr(depth - 1)?;
                    self.scope.truncate(outer);
                    format!("(let ({}) {body})", bindings.join(" "))
                }
                5 => {
                    let field = if self.u.arbitrary()? { "car" } else { "cdr" };
                    format!(
                        "({field} (cons {} {}))",
                        self.expr(depth - 1)?,
                        self.expr(depth - 1)?
                    )
                }
                _ => {
                    let (name, arity) = *self.u.choose(&self.functions)?;
                    let args = (0..arity)
                        .map(|_| self.expr(depth - 1))
                        .collect::<arbitrary::Result<Vec<_>>>()?;
                    format!("({name} {})", args.join(" "))
                }
            })
        }
    }

    fn arbitrary_program(u: &mut Unstructured<'_>) -> arbitrary::Result<Program> {
        let mut builder = ProgramBuilder {
            u,
            scope: vec!["p", "q"],
            functions: vec![("double", 1), ("pick", 3)],
            ifs: 0,
        };
        let mut source = String::from(PRELUDE);
        let body = builder.expr(3)?;
        source.push_str(&format!("(define (gen p q) {body})\n"));
        builder.scope.clear();
        builder.functions.push(("gen", 2));

        let toplevels = builder.u.int_in_range(1..=3)?;
        for _ in 0..toplevels {
            source.push_str(&builder.expr(4)?);
            source.push('\n');
        }
        // the prelude has one `if` of its own
        Ok(Program {
            source,
            ifs: builder.ifs + 1,
            toplevels,
        })
    }

    #[test]
    fn labels_are_unique() {
        arbtest(|u| {
            let program = arbitrary_program(u)?;
            let_assert!(Ok(asm) = compile(&program.source), "{}", program.source);

            let mut elses = BTreeSet::new();
            let mut endifs = BTreeSet::new();
            for label in asm.labels() {
                match label {
                    Label::Else(n) => {
                        check!(elses.insert(*n), "else_{n} defined twice");
                    }
                    Label::EndIf(n) => {
                        check!(endifs.insert(*n), "endif_{n} defined twice");
                    }
                    _ => {}
                }
            }
            let expected: BTreeSet<_> = (0..program.ifs).collect();
            check!(elses == expected);
            check!(endifs == expected);
            Ok(())
        });
    }

    #[test]
    fn stack_stays_balanced() {
        arbtest(|u| {
            let program = arbitrary_program(u)?;
            let_assert!(Ok(asm) = compile(&program.source), "{}", program.source);
            // faults on misaligned external calls and on any routine that
            // returns with a different %rsp than it was called with
            let_assert!(Ok(printed) = runtime::run(&asm), "{}", program.source);
            check!(printed.len() == program.toplevels);
            Ok(())
        });
    }
}
