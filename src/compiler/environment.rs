use std::{collections::HashMap, rc::Rc};

use crate::{
    error::{CompileError, CompileResult},
    parser::ast::FunctionDef,
};

/// Size of every value the generated code handles
pub const WORD: i32 = 8;

/// Every function defined so far in this run.
///
/// A name is registered once and stays for the whole run, a second `define` of
/// the same name fails instead of replacing the first. Only a definition whose
/// body failed to compile is taken out again.
#[derive(Debug, Default, Clone)]
pub struct FunctionTable {
    functions: HashMap<Box<str>, Rc<FunctionDef>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: Rc<FunctionDef>) -> CompileResult<()> {
        if self.functions.contains_key(&def.name) {
            return Err(CompileError::DuplicateDefinition {
                name: def.name.clone(),
            });
        }
        tracing::debug!("registered function `{}`/{}", def.name, def.arity());
        self.functions.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Rc<FunctionDef>> {
        self.functions.get(name)
    }

    /// Drop a definition whose body failed to compile.
    pub(crate) fn unregister(&mut self, name: &str) {
        if self.functions.remove(name).is_some() {
            tracing::debug!("unregistered function `{name}`");
        }
    }
}

/// Where a variable lives relative to the frame base `%rbp`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// n-th parameter, above the saved `%rbp` and the return address
    Param(usize),
    /// n-th `let` binding of the frame, below the frame base
    Local(usize),
}

impl Slot {
    /// Signed byte displacement from `%rbp`
    pub fn offset(self) -> i32 {
        match self {
            Self::Param(index) => 2 * WORD + WORD * index as i32,
            Self::Local(index) => -WORD * (index as i32 + 1),
        }
    }
}

/// Variables visible in one frame: a function body or a top-level form.
///
/// `let` extends the table in place. A rebound name points at its new slot
/// from then on, the old slot is never reused.
#[derive(Debug, Default, Clone)]
pub struct LexicalTable {
    bindings: HashMap<Box<str>, Slot>,
    locals: usize,
}

impl LexicalTable {
    /// Table for a top-level form, nothing bound yet
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_function(def: &FunctionDef) -> Self {
        Self {
            bindings: def
                .params
                .iter()
                .enumerate()
                .map(|(index, name)| (name.clone(), Slot::Param(index)))
                .collect(),
            locals: 0,
        }
    }

    /// Give `name` the next unused local slot.
    pub fn bind_local(&mut self, name: &str) -> Slot {
        let slot = Slot::Local(self.locals);
        self.locals += 1;
        self.bindings.insert(Box::from(name), slot);
        slot
    }

    pub fn lookup(&self, name: &str) -> Option<Slot> {
        self.bindings.get(name).copied()
    }

    /// Number of local slots handed out so far
    pub fn locals(&self) -> usize {
        self.locals
    }
}

/// Source of branch label numbers, shared by every form of a run.
#[derive(Debug, Default, Clone)]
pub struct LabelCounter(usize);

impl LabelCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> usize {
        let n = self.0;
        self.0 += 1;
        n
    }
}
