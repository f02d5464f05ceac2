//! Instances and execution

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::decode::{BinaryModule, ExportKind};
use crate::instr::{pop, pop_i32, Instr};
use crate::{Trap, Val};

/// Maximum call nesting inside one instance
const MAX_CALL_DEPTH: usize = 512;

/// Host function callable from binary code
pub type HostFunc = Rc<dyn Fn(&[Val]) -> Result<Vec<Val>, Trap>>;

/// Host functions offered to a module, keyed by `(namespace, name)`
#[derive(Clone, Default)]
pub struct Imports {
    funcs: HashMap<(String, String), HostFunc>,
}

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define (or replace) a host function
    pub fn define(
        &mut self,
        namespace: &str,
        name: &str,
        func: impl Fn(&[Val]) -> Result<Vec<Val>, Trap> + 'static,
    ) {
        self.funcs
            .insert((namespace.to_string(), name.to_string()), Rc::new(func));
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<HostFunc> {
        self.funcs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

impl fmt::Debug for Imports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.funcs.keys()).finish()
    }
}

/// Errors that can occur while instantiating a module
#[derive(Debug, Error)]
pub enum InstantiateError {
    #[error("missing import {module}.{name}")]
    MissingImport { module: String, name: String },

    #[error("start function trapped: {0}")]
    Start(#[from] Trap),
}

/// An instantiated module
pub struct Instance {
    module: Rc<BinaryModule>,
    host: Vec<HostFunc>,
    globals: RefCell<Vec<Val>>,
}

#[derive(Debug, Clone, Copy)]
struct Label {
    continuation: usize,
    height: usize,
    arity: usize,
    is_loop: bool,
}

impl Instance {
    /// Bind every import and run the start function, if any
    pub fn new(module: Rc<BinaryModule>, imports: &Imports) -> Result<Self, InstantiateError> {
        let mut host = Vec::with_capacity(module.imports().len());
        for import in module.imports() {
            let func = imports.get(&import.module, &import.name).ok_or_else(|| {
                InstantiateError::MissingImport {
                    module: import.module.clone(),
                    name: import.name.clone(),
                }
            })?;
            host.push(func);
        }
        let globals = module.globals.iter().map(|g| g.init).collect();
        let instance = Self {
            module,
            host,
            globals: RefCell::new(globals),
        };
        if let Some(start) = instance.module.start {
            debug!(function = start, "running start function");
            instance.invoke(start, Vec::new(), 0)?;
        }
        Ok(instance)
    }

    pub fn module(&self) -> &Rc<BinaryModule> {
        &self.module
    }

    /// Names of exported functions in declaration order
    pub fn exported_functions(&self) -> Vec<&str> {
        self.module
            .exports()
            .iter()
            .filter(|e| e.kind == ExportKind::Func)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Call an exported function
    pub fn call(&self, name: &str, args: &[Val]) -> Result<Vec<Val>, Trap> {
        let export = self
            .module
            .exports()
            .iter()
            .find(|e| e.name == name && e.kind == ExportKind::Func)
            .ok_or_else(|| Trap::UnknownExport(name.to_string()))?;
        let ty = self
            .module
            .func_type(export.index)
            .ok_or(Trap::TypeMismatch)?;
        if ty.params.len() != args.len() {
            return Err(Trap::ArityMismatch {
                expected: ty.params.len(),
                actual: args.len(),
            });
        }
        if ty.params.iter().zip(args).any(|(p, a)| *p != a.ty()) {
            return Err(Trap::TypeMismatch);
        }
        trace!(export = name, "calling exported function");
        self.invoke(export.index, args.to_vec(), 0)
    }

    fn invoke(&self, index: u32, args: Vec<Val>, depth: usize) -> Result<Vec<Val>, Trap> {
        if depth >= MAX_CALL_DEPTH {
            return Err(Trap::StackExhausted);
        }
        let ty = self.module.func_type(index).ok_or(Trap::TypeMismatch)?;
        let imported = self.host.len();

        if (index as usize) < imported {
            let results = (self.host[index as usize])(&args)?;
            if results.len() != ty.results.len()
                || ty.results.iter().zip(&results).any(|(t, v)| *t != v.ty())
            {
                return Err(Trap::TypeMismatch);
            }
            return Ok(results);
        }

        let body = &self.module.functions[index as usize - imported];
        let mut locals = args;
        locals.extend(body.locals.iter().map(|t| t.zero()));
        self.execute(&body.code, &mut locals, ty.results.len(), depth)
    }

    fn execute(
        &self,
        code: &[Instr],
        locals: &mut [Val],
        result_count: usize,
        depth: usize,
    ) -> Result<Vec<Val>, Trap> {
        let mut stack: Vec<Val> = Vec::new();
        let mut labels: Vec<Label> = Vec::new();
        let mut pc = 0;

        while let Some(instr) = code.get(pc) {
            match instr {
                Instr::Unreachable => return Err(Trap::Unreachable),
                Instr::Nop => {}
                Instr::Block { end, arity } => labels.push(Label {
                    continuation: end + 1,
                    height: stack.len(),
                    arity: *arity,
                    is_loop: false,
                }),
                Instr::Loop => labels.push(Label {
                    continuation: pc + 1,
                    height: stack.len(),
                    arity: 0,
                    is_loop: true,
                }),
                Instr::If { else_at, end, arity } => {
                    let condition = pop_i32(&mut stack)?;
                    labels.push(Label {
                        continuation: end + 1,
                        height: stack.len(),
                        arity: *arity,
                        is_loop: false,
                    });
                    if condition == 0 {
                        // Skip to the else arm, or to the `end` that pops the label
                        pc = match else_at {
                            Some(else_pc) => else_pc + 1,
                            None => *end,
                        };
                        continue;
                    }
                }
                Instr::Else { end } => {
                    pc = *end;
                    continue;
                }
                Instr::End => {
                    if labels.pop().is_none() {
                        break;
                    }
                }
                Instr::Br(relative) => match branch(&mut labels, &mut stack, *relative)? {
                    Some(target) => {
                        pc = target;
                        continue;
                    }
                    None => break,
                },
                Instr::BrIf(relative) => {
                    if pop_i32(&mut stack)? != 0 {
                        match branch(&mut labels, &mut stack, *relative)? {
                            Some(target) => {
                                pc = target;
                                continue;
                            }
                            None => break,
                        }
                    }
                }
                Instr::Return => break,
                Instr::Call(index) => {
                    let ty = self.module.func_type(*index).ok_or(Trap::TypeMismatch)?;
                    let count = ty.params.len();
                    if stack.len() < count {
                        return Err(Trap::StackUnderflow);
                    }
                    let args = stack.split_off(stack.len() - count);
                    let results = self.invoke(*index, args, depth + 1)?;
                    stack.extend(results);
                }
                Instr::Drop => {
                    pop(&mut stack)?;
                }
                Instr::Select => {
                    let condition = pop_i32(&mut stack)?;
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(if condition != 0 { a } else { b });
                }
                Instr::LocalGet(i) => {
                    let value = *locals.get(*i as usize).ok_or(Trap::TypeMismatch)?;
                    stack.push(value);
                }
                Instr::LocalSet(i) => {
                    let value = pop(&mut stack)?;
                    *locals.get_mut(*i as usize).ok_or(Trap::TypeMismatch)? = value;
                }
                Instr::LocalTee(i) => {
                    let value = *stack.last().ok_or(Trap::StackUnderflow)?;
                    *locals.get_mut(*i as usize).ok_or(Trap::TypeMismatch)? = value;
                }
                Instr::GlobalGet(i) => {
                    let value = *self
                        .globals
                        .borrow()
                        .get(*i as usize)
                        .ok_or(Trap::TypeMismatch)?;
                    stack.push(value);
                }
                Instr::GlobalSet(i) => {
                    let value = pop(&mut stack)?;
                    let mutable = self
                        .module
                        .globals
                        .get(*i as usize)
                        .map(|g| g.mutable)
                        .unwrap_or(false);
                    if !mutable {
                        return Err(Trap::TypeMismatch);
                    }
                    self.globals.borrow_mut()[*i as usize] = value;
                }
                Instr::Const(value) => stack.push(*value),
                Instr::Num(op) => op.apply(&mut stack)?,
            }
            pc += 1;
        }

        if stack.len() < result_count {
            return Err(Trap::StackUnderflow);
        }
        Ok(stack.split_off(stack.len() - result_count))
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("exports", &self.exported_functions())
            .finish()
    }
}

/// Unwind to the label `relative` levels out. Returns the continuation pc,
/// or `None` when the branch targets the function body itself.
fn branch(labels: &mut Vec<Label>, stack: &mut Vec<Val>, relative: u32) -> Result<Option<usize>, Trap> {
    let relative = relative as usize;
    if relative >= labels.len() {
        return Ok(None);
    }
    let index = labels.len() - 1 - relative;
    let label = labels[index];
    if stack.len() < label.arity {
        return Err(Trap::StackUnderflow);
    }
    let carried = stack.split_off(stack.len() - label.arity);
    stack.truncate(label.height);
    stack.extend(carried);
    if label.is_loop {
        labels.truncate(index + 1);
    } else {
        labels.truncate(index);
    }
    Ok(Some(label.continuation))
}
