//! Module script language for modgraph
//!
//! This crate provides the linkable unit the loader works with:
//! - **Lexer/Parser**: a small ECMAScript-module-like language (`lexer`, `parser`, `ast`)
//! - **Records**: [`ModuleRecord`] with `compile`, `resolve_request`,
//!   `instantiate` and `evaluate`
//! - **Linking**: [`instantiate_all`], two-phase batch instantiation
//! - **Values**: script values, live bindings and module namespaces
//!
//! # Example
//!
//! ```rust,ignore
//! use modgraph_script::ModuleRecord;
//!
//! let dep = ModuleRecord::new("file:///dep.js");
//! dep.compile("export default 'hi';")?;
//!
//! let main = ModuleRecord::new("file:///main.js");
//! main.compile("import greeting from './dep.js'; export const loud = greeting.toUpperCase();")?;
//! main.resolve_request("./dep.js", &dep);
//!
//! main.instantiate()?;
//! main.evaluate()?;
//! assert_eq!(main.namespace().unwrap().get("loud").unwrap().as_str(), Some("HI"));
//! ```

#![warn(rust_2018_idioms)]

pub mod ast;
mod builtins;
mod exception;
mod interpreter;
pub mod lexer;
mod link;
pub mod parser;
mod record;
mod value;

pub use builtins::{get_property, set_property};
pub use exception::{Exception, ExceptionKind};
pub use interpreter::call_function;
pub use link::instantiate_all;
pub use record::{DynamicImportHook, ModuleRecord, ModuleStatus};
pub use value::{
    number_to_string, Binding, Function, NativeFn, NativeFunction, Namespace, Object, ObjectClass,
    Value,
};
