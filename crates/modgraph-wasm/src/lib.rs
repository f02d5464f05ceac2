//! Minimal binary module runtime for modgraph
//!
//! Supports the integer/float subset of WebAssembly MVP: function imports,
//! module-defined functions and globals, structured control flow, and
//! exported functions callable from the host.
//!
//! # Example
//!
//! ```rust,ignore
//! use modgraph_wasm::{BinaryModule, Imports, Instance, Val};
//! use std::rc::Rc;
//!
//! let module = Rc::new(BinaryModule::decode(&bytes)?);
//! let mut imports = Imports::new();
//! imports.define("env", "base", |_| Ok(vec![Val::I32(100)]));
//! let instance = Instance::new(module, &imports)?;
//! assert_eq!(instance.call("add", &[Val::I32(2), Val::I32(3)])?, vec![Val::I32(5)]);
//! ```

#![warn(rust_2018_idioms)]

mod decode;
mod instr;
mod interp;

use std::fmt;

use thiserror::Error;

pub use decode::{BinaryModule, DecodeError, Export, ExportKind, FuncType, Import, ValType};
pub use interp::{HostFunc, Imports, InstantiateError, Instance};

/// A runtime value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Val {
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    /// Widen to f64 for hosts with a single number type
    pub fn to_f64(self) -> f64 {
        match self {
            Val::I32(v) => v as f64,
            Val::I64(v) => v as f64,
            Val::F32(v) => v as f64,
            Val::F64(v) => v,
        }
    }

    /// Narrow an f64 to the given type (integers truncate and wrap)
    pub fn from_f64(ty: ValType, n: f64) -> Self {
        match ty {
            ValType::I32 => Val::I32(if n.is_finite() { n.trunc() as i64 as i32 } else { 0 }),
            ValType::I64 => Val::I64(if n.is_finite() { n.trunc() as i64 } else { 0 }),
            ValType::F32 => Val::F32(n as f32),
            ValType::F64 => Val::F64(n),
        }
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Self {
        Val::I32(b as i32)
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::I32(v) => write!(f, "{}:i32", v),
            Val::I64(v) => write!(f, "{}:i64", v),
            Val::F32(v) => write!(f, "{}:f32", v),
            Val::F64(v) => write!(f, "{}:f64", v),
        }
    }
}

/// Runtime failure while executing binary code
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Trap {
    #[error("unreachable executed")]
    Unreachable,

    #[error("integer divide by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("invalid conversion to integer")]
    InvalidConversion,

    #[error("call stack exhausted")]
    StackExhausted,

    #[error("value stack underflow")]
    StackUnderflow,

    #[error("type mismatch")]
    TypeMismatch,

    #[error("expected {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("no exported function named '{0}'")]
    UnknownExport(String),

    /// Failure raised by an imported host function
    #[error("{0}")]
    Host(String),
}
