//! Script exceptions
//!
//! An [`Exception`] is a cheap handle; clones share identity, which is how a
//! module's captured failure is re-surfaced unchanged to every later caller.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::value::Value;

/// Phase an exception originated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Source text failed to parse or failed early checks
    Syntax,
    /// An import could not be bound during instantiation
    Link,
    /// Thrown while a module body or function ran
    Evaluation,
}

/// Reference-counted script exception
#[derive(Clone)]
pub struct Exception(Rc<ExceptionInner>);

struct ExceptionInner {
    kind: ExceptionKind,
    value: Value,
    message: String,
    url: RefCell<Option<String>>,
}

impl Exception {
    fn new(kind: ExceptionKind, value: Value, message: String) -> Self {
        Self(Rc::new(ExceptionInner {
            kind,
            value,
            message,
            url: RefCell::new(None),
        }))
    }

    /// Wrap a value raised by `throw` (or by the host on the script's behalf)
    pub fn thrown(value: Value) -> Self {
        let message = value.to_display_string();
        Self::new(ExceptionKind::Evaluation, value, message)
    }

    /// Compile-time failure for the module at `url`
    pub fn syntax(message: &str, url: &str) -> Self {
        let exception = Self::with_error(ExceptionKind::Syntax, "SyntaxError", message);
        exception.attach_url(url);
        exception
    }

    /// Instantiation failure
    pub fn link(message: &str) -> Self {
        Self::with_error(ExceptionKind::Link, "SyntaxError", message)
    }

    pub fn error(message: &str) -> Self {
        Self::with_error(ExceptionKind::Evaluation, "Error", message)
    }

    pub fn type_error(message: &str) -> Self {
        Self::with_error(ExceptionKind::Evaluation, "TypeError", message)
    }

    pub fn reference_error(message: &str) -> Self {
        Self::with_error(ExceptionKind::Evaluation, "ReferenceError", message)
    }

    pub fn range_error(message: &str) -> Self {
        Self::with_error(ExceptionKind::Evaluation, "RangeError", message)
    }

    fn with_error(kind: ExceptionKind, name: &str, message: &str) -> Self {
        let value = Value::error(name, message);
        Self::new(kind, value, format!("{}: {}", name, message))
    }

    pub fn kind(&self) -> ExceptionKind {
        self.0.kind
    }

    /// The script value carried by the exception
    pub fn value(&self) -> &Value {
        &self.0.value
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// URL of the module the exception escaped from, once known
    pub fn url(&self) -> Option<String> {
        self.0.url.borrow().clone()
    }

    /// Record the originating module; the first URL attached is kept
    pub fn attach_url(&self, url: &str) {
        let mut slot = self.0.url.borrow_mut();
        if slot.is_none() {
            *slot = Some(url.to_string());
        }
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Exception) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("kind", &self.0.kind)
            .field("message", &self.0.message)
            .field("url", &self.0.url.borrow())
            .finish()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.message)
    }
}

impl std::error::Error for Exception {}
