//! Runtime values of the module script language.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::ast::FunctionDecl;
use crate::exception::Exception;
use crate::interpreter::{self, Scope};

/// Host closure signature for native functions
pub type NativeFn = dyn Fn(&[Value]) -> Result<Value, Exception>;

/// A script value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<Object>>),
    Function(Rc<Function>),
    Namespace(Namespace),
    /// Host data carried through script code without being inspectable
    Opaque(Rc<dyn Any>),
}

impl Value {
    /// Create a string value
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Rc::from(s.as_ref()))
    }

    /// Create an array value
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    /// Create a plain object from `(key, value)` pairs, preserving order
    pub fn object<K: Into<String>>(properties: impl IntoIterator<Item = (K, Value)>) -> Self {
        let mut object = Object::new(ObjectClass::Plain);
        for (key, value) in properties {
            object.set(key.into(), value);
        }
        Value::Object(Rc::new(RefCell::new(object)))
    }

    /// Create an error object with `name` and `message` properties
    pub fn error(name: &str, message: &str) -> Self {
        let mut object = Object::new(ObjectClass::Error);
        object.set("name".to_string(), Value::string(name));
        object.set("message".to_string(), Value::string(message));
        Value::Object(Rc::new(RefCell::new(object)))
    }

    /// Wrap a host closure as a callable value
    pub fn native(
        name: &str,
        func: impl Fn(&[Value]) -> Result<Value, Exception> + 'static,
    ) -> Self {
        Value::Function(Rc::new(Function::Native(NativeFunction {
            name: Rc::from(name),
            func: Rc::new(func),
            constructor: false,
        })))
    }

    /// Like [`Value::native`], but usable with `new`
    pub fn native_constructor(
        name: &str,
        func: impl Fn(&[Value]) -> Result<Value, Exception> + 'static,
    ) -> Self {
        Value::Function(Rc::new(Function::Native(NativeFunction {
            name: Rc::from(name),
            func: Rc::new(func),
            constructor: true,
        })))
    }

    /// Wrap host data
    pub fn opaque<T: Any>(data: T) -> Self {
        Value::Opaque(Rc::new(data))
    }

    /// Borrow host data of type `T`, if this is an opaque value holding one
    pub fn downcast_opaque<T: Any>(&self) -> Option<Rc<T>> {
        match self {
            Value::Opaque(data) => data.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by conditions and logical operators
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Numeric conversion
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else if let Some(hex) = trimmed.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16)
                        .map(|v| v as f64)
                        .unwrap_or(f64::NAN)
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Value::Array(items) => {
                let items = items.borrow();
                match items.as_slice() {
                    [] => 0.0,
                    [single] => single.to_number(),
                    _ => f64::NAN,
                }
            }
            _ => f64::NAN,
        }
    }

    /// Result of the `typeof` operator
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
            _ => "object",
        }
    }

    /// String conversion (`String(value)`, concatenation, `join`)
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::String(s) => s.to_string(),
            Value::Array(items) => items
                .borrow()
                .iter()
                .map(|item| match item {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_display_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(object) => {
                let object = object.borrow();
                match object.class {
                    ObjectClass::Error => error_summary(&object),
                    ObjectClass::Plain => "[object Object]".to_string(),
                }
            }
            Value::Function(func) => format!("function {}() {{ [native code] }}", func.name()),
            Value::Namespace(_) => "[object Module]".to_string(),
            Value::Opaque(_) => "[object Opaque]".to_string(),
        }
    }

    /// Developer-facing rendering: strings are quoted, containers expanded
    pub fn inspect(&self) -> String {
        self.inspect_depth(0)
    }

    fn inspect_depth(&self, depth: usize) -> String {
        if depth > 4 {
            return match self {
                Value::Array(_) => "[Array]".to_string(),
                Value::Object(_) | Value::Namespace(_) => "[Object]".to_string(),
                other => other.inspect_depth(0),
            };
        }
        match self {
            Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::Array(items) => {
                let items = items.borrow();
                if items.is_empty() {
                    return "[]".to_string();
                }
                let parts: Vec<String> = items.iter().map(|v| v.inspect_depth(depth + 1)).collect();
                format!("[ {} ]", parts.join(", "))
            }
            Value::Object(object) => {
                let object = object.borrow();
                if object.class == ObjectClass::Error {
                    return error_summary(&object);
                }
                if object.properties.is_empty() {
                    return "{}".to_string();
                }
                let parts: Vec<String> = object
                    .properties
                    .iter()
                    .map(|(k, v)| format!("{}: {}", property_key(k), v.inspect_depth(depth + 1)))
                    .collect();
                format!("{{ {} }}", parts.join(", "))
            }
            Value::Namespace(ns) => ns.inspect_depth(depth),
            Value::Function(func) => match func.name() {
                "" => "[Function (anonymous)]".to_string(),
                name => format!("[Function: {}]", name),
            },
            other => other.to_display_string(),
        }
    }

    /// `===`
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Namespace(a), Value::Namespace(b)) => a.ptr_eq(b),
            (Value::Opaque(a), Value::Opaque(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `==`
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (Value::Number(_), Value::String(_) | Value::Bool(_))
            | (Value::String(_) | Value::Bool(_), Value::Number(_))
            | (Value::Bool(_), Value::String(_))
            | (Value::String(_), Value::Bool(_)) => self.to_number() == other.to_number(),
            _ => self.strict_equals(other),
        }
    }

    /// Call this value as a function
    pub fn call(&self, args: &[Value]) -> Result<Value, Exception> {
        match self {
            Value::Function(func) => interpreter::call_function(func, args),
            other => Err(Exception::type_error(&format!(
                "{} is not a function",
                other.inspect()
            ))),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self.strict_equals(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

fn error_summary(object: &Object) -> String {
    let name = object
        .get("name")
        .map(|v| v.to_display_string())
        .unwrap_or_else(|| "Error".to_string());
    let message = object
        .get("message")
        .map(|v| v.to_display_string())
        .unwrap_or_default();
    if message.is_empty() {
        name
    } else {
        format!("{}: {}", name, message)
    }
}

fn property_key(key: &str) -> String {
    let mut chars = key.chars();
    let is_identifier = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        .unwrap_or(false)
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if is_identifier {
        key.to_string()
    } else {
        format!("'{}'", key)
    }
}

/// Number to string conversion following the script language's rules
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

/// Object flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Plain,
    Error,
}

/// Insertion-ordered property bag
#[derive(Debug, Clone)]
pub struct Object {
    pub class: ObjectClass,
    properties: Vec<(String, Value)>,
}

impl Object {
    pub fn new(class: ObjectClass) -> Self {
        Self {
            class,
            properties: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn set(&mut self, key: String, value: Value) {
        match self.properties.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.properties.push((key, value)),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|(k, _)| k.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Callable value
pub enum Function {
    Script(ScriptFunction),
    Native(NativeFunction),
}

impl Function {
    /// Declared name, or empty for anonymous functions
    pub fn name(&self) -> &str {
        match self {
            Function::Script(func) => func.decl.name.as_deref().unwrap_or(""),
            Function::Native(func) => &func.name,
        }
    }

    /// Whether the function may be invoked with `new`
    pub fn is_constructor(&self) -> bool {
        matches!(self, Function::Native(NativeFunction { constructor: true, .. }))
    }
}

/// Function defined in script source, closing over its defining scope
pub struct ScriptFunction {
    pub(crate) decl: Rc<FunctionDecl>,
    pub(crate) scope: Rc<Scope>,
}

/// Function implemented by the host
pub struct NativeFunction {
    pub name: Rc<str>,
    pub func: Rc<NativeFn>,
    pub constructor: bool,
}

/// Shared, possibly uninitialized storage cell for a variable or export.
///
/// Bindings are shared by reference between an exporting module's scope,
/// every importer's scope and namespace views, which makes imports live.
#[derive(Clone, Default)]
pub struct Binding(Rc<RefCell<Option<Value>>>);

impl Binding {
    /// A binding in its temporal dead zone
    pub fn uninitialized() -> Self {
        Self::default()
    }

    pub fn with_value(value: Value) -> Self {
        Self(Rc::new(RefCell::new(Some(value))))
    }

    /// Current value; `None` while uninitialized
    pub fn get(&self) -> Option<Value> {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.borrow_mut() = Some(value);
    }

    pub fn is_initialized(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub fn ptr_eq(&self, other: &Binding) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => write!(f, "Binding({:?})", value),
            None => f.write_str("Binding(<uninitialized>)"),
        }
    }
}

/// Live view of a module's exports, sorted by export name
#[derive(Clone)]
pub struct Namespace(Rc<NamespaceInner>);

struct NamespaceInner {
    url: Rc<str>,
    bindings: BTreeMap<String, Binding>,
}

impl Namespace {
    pub(crate) fn new(url: Rc<str>, bindings: BTreeMap<String, Binding>) -> Self {
        Self(Rc::new(NamespaceInner { url, bindings }))
    }

    /// URL of the module this namespace belongs to
    pub fn url(&self) -> &str {
        &self.0.url
    }

    /// Current value of an export; `None` if not exported or not yet initialized
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.bindings.get(name).and_then(Binding::get)
    }

    /// The live binding behind an export
    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.0.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.bindings.contains_key(name)
    }

    /// Export names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.0.bindings.keys().cloned().collect()
    }

    /// `(name, value)` pairs in sorted order; uninitialized exports yield `None`
    pub fn entries(&self) -> Vec<(String, Option<Value>)> {
        self.0
            .bindings
            .iter()
            .map(|(name, binding)| (name.clone(), binding.get()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.bindings.is_empty()
    }

    pub fn ptr_eq(&self, other: &Namespace) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn inspect_depth(&self, depth: usize) -> String {
        if self.is_empty() {
            return "{}".to_string();
        }
        let parts: Vec<String> = self
            .0
            .bindings
            .iter()
            .map(|(name, binding)| {
                let rendered = match binding.get() {
                    Some(value) => value.inspect_depth(depth + 1),
                    None => "<uninitialized>".to_string(),
                };
                format!("{}: {}", property_key(name), rendered)
            })
            .collect();
        format!("{{ {} }}", parts.join(", "))
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect_depth(0))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect_depth(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(3.0), "3");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_array_display_joins_with_commas() {
        let value = Value::array(vec![1.0.into(), Value::Null, "x".into()]);
        assert_eq!(value.to_display_string(), "1,,x");
        assert_eq!(value.inspect(), "[ 1, null, 'x' ]");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Value::error("TypeError", "bad").to_display_string(), "TypeError: bad");
    }

    #[test]
    fn test_loose_and_strict_equality() {
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(!Value::Null.strict_equals(&Value::Undefined));
        assert!(Value::from(1.0).loose_equals(&Value::from("1")));
        assert!(!Value::from(1.0).strict_equals(&Value::from("1")));
    }

    #[test]
    fn test_opaque_downcast() {
        let value = Value::opaque(42u32);
        assert_eq!(value.downcast_opaque::<u32>().as_deref(), Some(&42));
        assert!(value.downcast_opaque::<String>().is_none());
    }

    #[test]
    fn test_binding_is_shared() {
        let binding = Binding::uninitialized();
        let alias = binding.clone();
        assert!(!alias.is_initialized());
        binding.set(Value::from(7.0));
        assert_eq!(alias.get(), Some(Value::from(7.0)));
        assert!(alias.ptr_eq(&binding));
    }
}
