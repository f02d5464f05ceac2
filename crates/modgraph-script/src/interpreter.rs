//! Tree-walking evaluator for module bodies and script functions.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ast::*;
use crate::builtins;
use crate::exception::Exception;
use crate::value::{Binding, Function, ScriptFunction, Value};

/// Maximum nesting of script function calls
const MAX_CALL_DEPTH: usize = 256;

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Local name holding an anonymous default export
pub(crate) const DEFAULT_LOCAL: &str = "*default*";

/// Module scope local holding the `import.meta` object
pub(crate) const IMPORT_META_LOCAL: &str = "*import.meta*";

/// Module scope local holding the function behind `import(...)`
pub(crate) const DYNAMIC_IMPORT_LOCAL: &str = "*import*";

/// Variable entry in a scope
#[derive(Clone, Debug)]
pub struct ScopeEntry {
    pub binding: Binding,
    pub writable: bool,
}

/// Lexical scope: a name table plus an optional parent
pub struct Scope {
    vars: RefCell<FxHashMap<String, ScopeEntry>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn new(parent: Option<Rc<Scope>>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(FxHashMap::default()),
            parent,
        })
    }

    /// Root scope with the built-in globals installed
    pub fn with_globals() -> Rc<Self> {
        let scope = Self::new(None);
        builtins::install_globals(&scope);
        scope
    }

    pub fn declare(&self, name: &str, binding: Binding, writable: bool) {
        self.vars
            .borrow_mut()
            .insert(name.to_string(), ScopeEntry { binding, writable });
    }

    /// Entry declared directly in this scope
    pub fn own(&self, name: &str) -> Option<ScopeEntry> {
        self.vars.borrow().get(name).cloned()
    }

    /// Entry visible from this scope, searching parents
    pub fn lookup(&self, name: &str) -> Option<ScopeEntry> {
        if let Some(entry) = self.own(name) {
            return Some(entry);
        }
        let mut current = self.parent.clone();
        while let Some(scope) = current {
            if let Some(entry) = scope.own(name) {
                return Some(entry);
            }
            current = scope.parent.clone();
        }
        None
    }
}

enum Flow {
    Normal,
    Return(Value),
}

/// Run a linked module body in its module scope, returning the completion
/// value of the last top-level expression statement.
pub(crate) fn run_module_body(program: &Program, scope: &Rc<Scope>) -> Result<Value, Exception> {
    let mut completion = Value::Undefined;
    for item in &program.items {
        match item {
            ModuleItem::Import(_) | ModuleItem::Export(ExportDecl::Named { .. }) => {}
            ModuleItem::Export(ExportDecl::DefaultFunction(_)) => {}
            ModuleItem::Export(ExportDecl::Declaration(stmt)) => {
                exec_stmt(stmt, scope)?;
            }
            ModuleItem::Export(ExportDecl::DefaultExpr(expr)) => {
                let value = eval_expr(expr, scope)?;
                initialize(scope, DEFAULT_LOCAL, value);
            }
            ModuleItem::Stmt(Stmt::Expr(expr)) => {
                completion = eval_expr(expr, scope)?;
            }
            ModuleItem::Stmt(stmt) => {
                // `return` is rejected at compile time, so the flow is always normal
                exec_stmt(stmt, scope)?;
            }
        }
    }
    Ok(completion)
}

/// Make a script function value closing over `scope`
pub(crate) fn make_function(decl: &Rc<FunctionDecl>, scope: &Rc<Scope>) -> Value {
    Value::Function(Rc::new(Function::Script(ScriptFunction {
        decl: decl.clone(),
        scope: scope.clone(),
    })))
}

/// Invoke a function value with arguments
pub fn call_function(func: &Rc<Function>, args: &[Value]) -> Result<Value, Exception> {
    let _guard = DepthGuard::enter()?;
    match func.as_ref() {
        Function::Native(native) => (native.func)(args),
        Function::Script(script) => {
            let scope = Scope::new(Some(script.scope.clone()));
            for (i, param) in script.decl.params.iter().enumerate() {
                let value = args.get(i).cloned().unwrap_or_default();
                scope.declare(param, Binding::with_value(value), true);
            }
            match exec_block_in(&script.decl.body, &scope)? {
                Flow::Return(value) => Ok(value),
                Flow::Normal => Ok(Value::Undefined),
            }
        }
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Result<Self, Exception> {
        let depth = CALL_DEPTH.with(|d| d.get());
        if depth >= MAX_CALL_DEPTH {
            return Err(Exception::range_error("Maximum call stack size exceeded"));
        }
        CALL_DEPTH.with(|d| d.set(depth + 1));
        Ok(DepthGuard)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Declare the block's lexical names and hoist its function declarations
fn hoist(stmts: &[Stmt], scope: &Rc<Scope>) {
    for stmt in stmts {
        match stmt {
            Stmt::VarDecl { kind, declarations } => {
                for (name, _) in declarations {
                    scope.declare(name, Binding::uninitialized(), *kind == VarKind::Let);
                }
            }
            Stmt::Function(decl) => {
                if let Some(name) = &decl.name {
                    scope.declare(name, Binding::with_value(make_function(decl, scope)), true);
                }
            }
            _ => {}
        }
    }
}

fn exec_block_in(stmts: &[Stmt], scope: &Rc<Scope>) -> Result<Flow, Exception> {
    hoist(stmts, scope);
    for stmt in stmts {
        if let Flow::Return(value) = exec_stmt(stmt, scope)? {
            return Ok(Flow::Return(value));
        }
    }
    Ok(Flow::Normal)
}

fn initialize(scope: &Rc<Scope>, name: &str, value: Value) {
    match scope.own(name) {
        Some(entry) => entry.binding.set(value),
        None => scope.declare(name, Binding::with_value(value), true),
    }
}

fn exec_stmt(stmt: &Stmt, scope: &Rc<Scope>) -> Result<Flow, Exception> {
    match stmt {
        Stmt::VarDecl { declarations, .. } => {
            for (name, init) in declarations {
                let value = match init {
                    Some(expr) => eval_expr(expr, scope)?,
                    None => Value::Undefined,
                };
                initialize(scope, name, value);
            }
            Ok(Flow::Normal)
        }
        // Hoisted when the enclosing block was entered
        Stmt::Function(_) => Ok(Flow::Normal),
        Stmt::If {
            test,
            consequent,
            alternate,
        } => {
            if eval_expr(test, scope)?.is_truthy() {
                exec_nested(consequent, scope)
            } else if let Some(alternate) = alternate {
                exec_nested(alternate, scope)
            } else {
                Ok(Flow::Normal)
            }
        }
        Stmt::While { test, body } => {
            while eval_expr(test, scope)?.is_truthy() {
                if let Flow::Return(value) = exec_nested(body, scope)? {
                    return Ok(Flow::Return(value));
                }
            }
            Ok(Flow::Normal)
        }
        Stmt::Block(stmts) => {
            let inner = Scope::new(Some(scope.clone()));
            exec_block_in(stmts, &inner)
        }
        Stmt::Return(value) => {
            let value = match value {
                Some(expr) => eval_expr(expr, scope)?,
                None => Value::Undefined,
            };
            Ok(Flow::Return(value))
        }
        Stmt::Throw(expr) => {
            let value = eval_expr(expr, scope)?;
            Err(Exception::thrown(value))
        }
        Stmt::Expr(expr) => {
            eval_expr(expr, scope)?;
            Ok(Flow::Normal)
        }
        Stmt::Empty => Ok(Flow::Normal),
    }
}

/// Statement in a sub-statement position (if/while body) gets its own scope
/// when it declares anything.
fn exec_nested(stmt: &Stmt, scope: &Rc<Scope>) -> Result<Flow, Exception> {
    match stmt {
        Stmt::VarDecl { .. } | Stmt::Function(_) => {
            let inner = Scope::new(Some(scope.clone()));
            exec_block_in(std::slice::from_ref(stmt), &inner)
        }
        other => exec_stmt(other, scope),
    }
}

fn read_identifier(name: &str, scope: &Rc<Scope>) -> Result<Value, Exception> {
    match scope.lookup(name) {
        Some(entry) => entry.binding.get().ok_or_else(|| {
            Exception::reference_error(&format!("Cannot access '{}' before initialization", name))
        }),
        None => Err(Exception::reference_error(&format!("{} is not defined", name))),
    }
}

fn eval_expr(expr: &Expr, scope: &Rc<Scope>) -> Result<Value, Exception> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::String(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Undefined => Ok(Value::Undefined),
        Expr::Ident(name) => read_identifier(name, scope),
        Expr::Array(elements) => {
            let mut items = Vec::with_capacity(elements.len());
            for element in elements {
                items.push(eval_expr(element, scope)?);
            }
            Ok(Value::array(items))
        }
        Expr::Object(properties) => {
            let mut evaluated = Vec::with_capacity(properties.len());
            for (key, value) in properties {
                evaluated.push((key.clone(), eval_expr(value, scope)?));
            }
            Ok(Value::object(evaluated))
        }
        Expr::Member { object, property } => {
            let object = eval_expr(object, scope)?;
            builtins::get_property(&object, property)
        }
        Expr::Index { object, index } => {
            let object = eval_expr(object, scope)?;
            let key = builtins::property_key(&eval_expr(index, scope)?);
            builtins::get_property(&object, &key)
        }
        Expr::Call { callee, args } => {
            let func = eval_expr(callee, scope)?;
            let args = eval_args(args, scope)?;
            match &func {
                Value::Function(f) => call_function(f, &args),
                other => Err(Exception::type_error(&format!(
                    "{} is not a function",
                    describe_callee(callee, other)
                ))),
            }
        }
        Expr::New { callee, args } => {
            let ctor = eval_expr(callee, scope)?;
            let args = eval_args(args, scope)?;
            match &ctor {
                Value::Function(f) if f.is_constructor() => call_function(f, &args),
                other => Err(Exception::type_error(&format!(
                    "{} is not a constructor",
                    describe_callee(callee, other)
                ))),
            }
        }
        Expr::Assign { target, value } => {
            let value = eval_expr(value, scope)?;
            assign(target, value.clone(), scope)?;
            Ok(value)
        }
        Expr::Unary { op, operand } => {
            if let (UnaryOp::Typeof, Expr::Ident(name)) = (op, operand.as_ref()) {
                if scope.lookup(name).is_none() {
                    return Ok(Value::string("undefined"));
                }
            }
            let value = eval_expr(operand, scope)?;
            Ok(match op {
                UnaryOp::Neg => Value::Number(-value.to_number()),
                UnaryOp::Plus => Value::Number(value.to_number()),
                UnaryOp::Not => Value::Bool(!value.is_truthy()),
                UnaryOp::Typeof => Value::string(value.type_of()),
            })
        }
        Expr::Binary { op, left, right } => {
            let left = eval_expr(left, scope)?;
            let right = eval_expr(right, scope)?;
            Ok(binary(*op, &left, &right))
        }
        Expr::Logical { op, left, right } => {
            let left = eval_expr(left, scope)?;
            match (op, left.is_truthy()) {
                (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(left),
                _ => eval_expr(right, scope),
            }
        }
        Expr::Function(decl) => Ok(make_function(decl, scope)),
        Expr::ImportMeta => scope
            .lookup(IMPORT_META_LOCAL)
            .and_then(|entry| entry.binding.get())
            .ok_or_else(|| Exception::type_error("Cannot use 'import.meta' outside a module")),
        Expr::DynamicImport(specifier) => {
            let specifier = eval_expr(specifier, scope)?.to_display_string();
            match scope.lookup(DYNAMIC_IMPORT_LOCAL).and_then(|e| e.binding.get()) {
                Some(Value::Function(f)) => call_function(&f, &[Value::string(specifier)]),
                _ => Err(Exception::type_error("Dynamic import is not available here")),
            }
        }
    }
}

fn eval_args(args: &[Expr], scope: &Rc<Scope>) -> Result<Vec<Value>, Exception> {
    args.iter().map(|arg| eval_expr(arg, scope)).collect()
}

fn describe_callee(callee: &Expr, value: &Value) -> String {
    fn path(expr: &Expr) -> Option<String> {
        match expr {
            Expr::Ident(name) => Some(name.clone()),
            Expr::Member { object, property } => Some(format!("{}.{}", path(object)?, property)),
            _ => None,
        }
    }
    path(callee).unwrap_or_else(|| value.inspect())
}

fn assign(target: &Expr, value: Value, scope: &Rc<Scope>) -> Result<(), Exception> {
    match target {
        Expr::Ident(name) => {
            let entry = scope
                .lookup(name)
                .ok_or_else(|| Exception::reference_error(&format!("{} is not defined", name)))?;
            if !entry.binding.is_initialized() {
                return Err(Exception::reference_error(&format!(
                    "Cannot access '{}' before initialization",
                    name
                )));
            }
            if !entry.writable {
                return Err(Exception::type_error("Assignment to constant variable."));
            }
            entry.binding.set(value);
            Ok(())
        }
        Expr::Member { object, property } => {
            let object = eval_expr(object, scope)?;
            builtins::set_property(&object, property, value)
        }
        Expr::Index { object, index } => {
            let object = eval_expr(object, scope)?;
            let key = builtins::property_key(&eval_expr(index, scope)?);
            builtins::set_property(&object, &key, value)
        }
        _ => Err(Exception::reference_error("Invalid left-hand side in assignment")),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            _ if is_stringish(left) || is_stringish(right) => {
                let mut s = left.to_display_string();
                s.push_str(&right.to_display_string());
                Value::from(s)
            }
            _ => Value::Number(left.to_number() + right.to_number()),
        },
        BinaryOp::Sub => Value::Number(left.to_number() - right.to_number()),
        BinaryOp::Mul => Value::Number(left.to_number() * right.to_number()),
        BinaryOp::Div => Value::Number(left.to_number() / right.to_number()),
        BinaryOp::Mod => Value::Number(left.to_number() % right.to_number()),
        BinaryOp::Less | BinaryOp::Greater | BinaryOp::LessEqual | BinaryOp::GreaterEqual => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => left.to_number().partial_cmp(&right.to_number()),
            };
            let result = match ordering {
                None => false,
                Some(ordering) => match op {
                    BinaryOp::Less => ordering.is_lt(),
                    BinaryOp::Greater => ordering.is_gt(),
                    BinaryOp::LessEqual => ordering.is_le(),
                    _ => ordering.is_ge(),
                },
            };
            Value::Bool(result)
        }
        BinaryOp::Equal => Value::Bool(left.loose_equals(right)),
        BinaryOp::NotEqual => Value::Bool(!left.loose_equals(right)),
        BinaryOp::StrictEqual => Value::Bool(left.strict_equals(right)),
        BinaryOp::StrictNotEqual => Value::Bool(!left.strict_equals(right)),
    }
}

fn is_stringish(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Namespace(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    /// Run a standalone body with no imports or exports
    fn run(source: &str) -> Result<Value, Exception> {
        let program = parse(source).unwrap();
        let scope = Scope::new(Some(Scope::with_globals()));
        let stmts: Vec<Stmt> = program
            .items
            .iter()
            .filter_map(|item| match item {
                ModuleItem::Stmt(stmt) => Some(stmt.clone()),
                _ => None,
            })
            .collect();
        hoist(&stmts, &scope);
        run_module_body(&program, &scope)
    }

    #[test]
    fn test_arithmetic_and_concatenation() {
        assert_eq!(run("1 + 2 * 3").unwrap(), Value::from(7.0));
        assert_eq!(run("'a' + 1 + 2").unwrap(), Value::from("a12"));
        assert_eq!(run("10 % 4 - -1").unwrap(), Value::from(3.0));
    }

    #[test]
    fn test_function_hoisting_and_recursion() {
        let value = run(
            "const n = fact(5);
             function fact(k) { if (k <= 1) { return 1; } return k * fact(k - 1); }
             n",
        )
        .unwrap();
        assert_eq!(value, Value::from(120.0));
    }

    #[test]
    fn test_closures_capture_scope() {
        let value = run(
            "function counter() { let c = 0; return function() { c = c + 1; return c; }; }
             const next = counter();
             next(); next();
             next()",
        )
        .unwrap();
        assert_eq!(value, Value::from(3.0));
    }

    #[test]
    fn test_while_loop() {
        let value = run("let i = 0; let total = 0; while (i < 4) { total = total + i; i = i + 1; } total")
            .unwrap();
        assert_eq!(value, Value::from(6.0));
    }

    #[test]
    fn test_temporal_dead_zone() {
        let err = run("x; let x = 1;").unwrap_err();
        assert_eq!(err.message(), "ReferenceError: Cannot access 'x' before initialization");
    }

    #[test]
    fn test_const_assignment_is_type_error() {
        let err = run("const x = 1; x = 2;").unwrap_err();
        assert_eq!(err.message(), "TypeError: Assignment to constant variable.");
    }

    #[test]
    fn test_undefined_identifier() {
        let err = run("missing + 1").unwrap_err();
        assert_eq!(err.message(), "ReferenceError: missing is not defined");
        assert_eq!(run("typeof missing").unwrap(), Value::from("undefined"));
    }

    #[test]
    fn test_throw_preserves_value() {
        let err = run("throw new Error('oops');").unwrap_err();
        assert_eq!(err.message(), "Error: oops");
        assert_eq!(err.value().to_display_string(), "Error: oops");
    }

    #[test]
    fn test_call_depth_limit() {
        let err = run("function f() { return f(); } f()").unwrap_err();
        assert_eq!(err.message(), "RangeError: Maximum call stack size exceeded");
    }

    #[test]
    fn test_import_expressions_outside_module_scope() {
        let err = run("import('./x.js')").unwrap_err();
        assert_eq!(err.message(), "TypeError: Dynamic import is not available here");
        let err = run("import.meta").unwrap_err();
        assert_eq!(err.message(), "TypeError: Cannot use 'import.meta' outside a module");
    }

    #[test]
    fn test_logical_short_circuit() {
        assert_eq!(run("null || 'fallback'").unwrap(), Value::from("fallback"));
        assert_eq!(run("0 && missing()").unwrap(), Value::from(0.0));
    }
}
