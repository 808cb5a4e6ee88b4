//! Compile a small Lisp into x86-64 stack-machine assembly.
//!
//! The pipeline runs one top-level form at a time:
//! [`syntax`] splits the file into balanced forms, [`parser`] turns each into
//! an [`Expr`], and [`compiler`] emits its code. [`runtime`] can execute the
//! result without leaving the process.

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod runtime;
pub mod syntax;

pub use compiler::{
    instr::{Assembly, Instr, Label},
    Compiler,
};
pub use error::{CompileError, CompileResult, Diagnostic};
pub use parser::{
    ast::{Expr, FunctionDef, Operator},
    special_forms::{Keyword, Primitive, SpecialForm},
    Parser,
};
pub use runtime::{run, Fuel, MachineError};
pub use syntax::SourceFile;

/// Compile a whole source file.
///
/// Stops at the first error: no listing is produced for a program that does
/// not compile in full.
pub fn compile(source: &str) -> Result<Assembly, Diagnostic> {
    let file = SourceFile::parse(source).map_err(|err| Diagnostic::new(err, 0..source.len()))?;

    let mut compiler = Compiler::new();
    for form in file.forms() {
        let span = form.span();
        tracing::trace!("compiling form at {span:?}");
        let exprs = Parser::new(form.tokens())
            .parse()
            .map_err(|err| Diagnostic::new(err, span.clone()))?;
        for expr in &exprs {
            compiler
                .compile_form(expr)
                .map_err(|err| Diagnostic::new(err, span.clone()))?;
        }
    }
    Ok(compiler.finish())
}
