//! Module records
//!
//! A [`ModuleRecord`] is the compiled, linkable unit the loader works with.
//! Its lifecycle is `Uncompiled -> Uninstantiated -> Instantiated ->
//! Evaluating -> Evaluated`, with `Errored` reachable on a compile or
//! evaluation failure.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::ast::*;
use crate::exception::Exception;
use crate::interpreter::{self, Scope, DEFAULT_LOCAL};
use crate::link;
use crate::parser;
use crate::value::{Binding, Namespace, Value};

/// Lifecycle status, totally ordered in lifecycle order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleStatus {
    Uncompiled,
    Uninstantiated,
    Instantiated,
    Evaluating,
    Evaluated,
    Errored,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleStatus::Uncompiled => "uncompiled",
            ModuleStatus::Uninstantiated => "uninstantiated",
            ModuleStatus::Instantiated => "instantiated",
            ModuleStatus::Evaluating => "evaluating",
            ModuleStatus::Evaluated => "evaluated",
            ModuleStatus::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Which binding an import entry refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImportName {
    Named(String),
    Namespace,
}

#[derive(Debug, Clone)]
pub(crate) struct ImportEntry {
    pub specifier: String,
    pub import_name: ImportName,
    pub local: String,
}

/// `export { import_name as exported } from specifier`, including re-exports
/// of imported bindings
#[derive(Debug, Clone)]
pub(crate) struct IndirectExport {
    pub exported: String,
    pub specifier: String,
    pub import_name: String,
}

/// Top-level lexical declaration
#[derive(Debug, Clone)]
pub(crate) enum Declaration {
    Let,
    Const,
    Function(Rc<FunctionDecl>),
}

/// Static module information derived at compile time
#[derive(Debug)]
pub(crate) struct CompiledModule {
    pub program: Program,
    pub requests: Vec<String>,
    pub imports: Vec<ImportEntry>,
    /// `(exported, local)` pairs
    pub local_exports: Vec<(String, String)>,
    pub indirect_exports: Vec<IndirectExport>,
    pub declarations: Vec<(String, Declaration)>,
}

impl CompiledModule {
    /// All export names in declaration order
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.local_exports
            .iter()
            .map(|(exported, _)| exported.as_str())
            .chain(self.indirect_exports.iter().map(|e| e.exported.as_str()))
    }

    pub fn local_for_export(&self, name: &str) -> Option<&str> {
        self.local_exports
            .iter()
            .find(|(exported, _)| exported == name)
            .map(|(_, local)| local.as_str())
    }

    pub fn indirect_export(&self, name: &str) -> Option<&IndirectExport> {
        self.indirect_exports.iter().find(|e| e.exported == name)
    }
}

/// Host handler behind `import(specifier)`, called with the specifier and
/// the importing module's URL
pub type DynamicImportHook = dyn Fn(&str, &str) -> Result<Value, Exception>;

pub(crate) type DynamicImportSlot = Rc<RefCell<Option<Rc<DynamicImportHook>>>>;

/// Handle to a module record; clones share the same record
#[derive(Clone)]
pub struct ModuleRecord(Rc<RecordCell>);

struct RecordCell {
    url: Rc<str>,
    state: RefCell<RecordState>,
    dynamic_import: DynamicImportSlot,
}

struct RecordState {
    status: ModuleStatus,
    compiled: Option<Rc<CompiledModule>>,
    resolved: FxHashMap<String, ModuleRecord>,
    env: Option<Rc<Scope>>,
    namespace: Option<Namespace>,
    exception: Option<Exception>,
    completion: Value,
}

impl ModuleRecord {
    /// Create an empty, uncompiled record
    pub fn new(url: impl Into<String>) -> Self {
        let url: String = url.into();
        Self(Rc::new(RecordCell {
            url: Rc::from(url.as_str()),
            state: RefCell::new(RecordState {
                status: ModuleStatus::Uncompiled,
                compiled: None,
                resolved: FxHashMap::default(),
                env: None,
                namespace: None,
                exception: None,
                completion: Value::Undefined,
            }),
            dynamic_import: Rc::new(RefCell::new(None)),
        }))
    }

    pub fn url(&self) -> &str {
        &self.0.url
    }

    pub fn status(&self) -> ModuleStatus {
        self.0.state.borrow().status
    }

    /// Install the handler for `import(...)` expressions in this module.
    /// Without one, a dynamic import throws a `TypeError`.
    pub fn set_dynamic_import(
        &self,
        hook: impl Fn(&str, &str) -> Result<Value, Exception> + 'static,
    ) {
        *self.0.dynamic_import.borrow_mut() = Some(Rc::new(hook));
    }

    /// Captured exception when the record is errored
    pub fn exception(&self) -> Option<Exception> {
        self.0.state.borrow().exception.clone()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &ModuleRecord) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Compile source text, fixing `requests`.
    ///
    /// A syntax error moves the record to `Errored` and is captured.
    pub fn compile(&self, source: &str) -> Result<(), Exception> {
        if self.status() != ModuleStatus::Uncompiled {
            return Err(Exception::type_error(&format!(
                "Module '{}' is already compiled",
                self.url()
            )));
        }

        match analyze(source) {
            Ok(compiled) => {
                debug!(url = %self.url(), requests = ?compiled.requests, "compiled module");
                let mut state = self.0.state.borrow_mut();
                state.compiled = Some(Rc::new(compiled));
                state.status = ModuleStatus::Uninstantiated;
                Ok(())
            }
            Err(message) => {
                let exception = Exception::syntax(&message, self.url());
                debug!(url = %self.url(), error = %exception, "compile failed");
                let mut state = self.0.state.borrow_mut();
                state.status = ModuleStatus::Errored;
                state.exception = Some(exception.clone());
                Err(exception)
            }
        }
    }

    /// Ordered, de-duplicated dependency specifiers; empty before compilation
    pub fn requests(&self) -> Vec<String> {
        self.0
            .state
            .borrow()
            .compiled
            .as_ref()
            .map(|c| c.requests.clone())
            .unwrap_or_default()
    }

    /// Record the dependency for `specifier`. The first resolution wins;
    /// returns `false` if the specifier was already resolved.
    pub fn resolve_request(&self, specifier: &str, dependency: &ModuleRecord) -> bool {
        let mut state = self.0.state.borrow_mut();
        if state.resolved.contains_key(specifier) {
            return false;
        }
        state
            .resolved
            .insert(specifier.to_string(), dependency.clone());
        true
    }

    pub fn is_resolved(&self, specifier: &str) -> bool {
        self.0.state.borrow().resolved.contains_key(specifier)
    }

    /// Dependency record recorded for `specifier`
    pub fn resolved_request(&self, specifier: &str) -> Option<ModuleRecord> {
        self.0.state.borrow().resolved.get(specifier).cloned()
    }

    /// Whether every request has a resolved dependency
    pub fn is_fully_resolved(&self) -> bool {
        let state = self.0.state.borrow();
        match &state.compiled {
            Some(compiled) => compiled
                .requests
                .iter()
                .all(|r| state.resolved.contains_key(r)),
            None => false,
        }
    }

    /// Drop resolved dependency handles. Records referencing each other
    /// through import cycles are otherwise never freed.
    pub fn release_dependencies(&self) {
        self.0.state.borrow_mut().resolved.clear();
    }

    /// Link this record and every not yet instantiated record reachable
    /// from it
    pub fn instantiate(&self) -> Result<(), Exception> {
        link::instantiate_all(std::slice::from_ref(self))
    }

    /// Evaluate the record, first evaluating its dependencies in request
    /// order, depth first. Returns the completion value of the body.
    ///
    /// A record already evaluating (an import cycle) returns immediately;
    /// an errored record returns its captured exception.
    pub fn evaluate(&self) -> Result<Value, Exception> {
        let (compiled, env) = {
            let state = self.0.state.borrow();
            match state.status {
                ModuleStatus::Evaluated => return Ok(state.completion.clone()),
                ModuleStatus::Evaluating => return Ok(Value::Undefined),
                ModuleStatus::Errored => {
                    return Err(state
                        .exception
                        .clone()
                        .unwrap_or_else(|| Exception::error("Module previously failed")));
                }
                ModuleStatus::Uncompiled | ModuleStatus::Uninstantiated => {
                    return Err(Exception::link(&format!(
                        "Module '{}' has not been instantiated",
                        self.url()
                    )));
                }
                ModuleStatus::Instantiated => {}
            }
            match (&state.compiled, &state.env) {
                (Some(compiled), Some(env)) => (compiled.clone(), env.clone()),
                _ => {
                    return Err(Exception::link(&format!(
                        "Module '{}' has no environment",
                        self.url()
                    )))
                }
            }
        };

        self.set_status(ModuleStatus::Evaluating);
        debug!(url = %self.url(), "evaluating module");

        for specifier in &compiled.requests {
            let Some(dependency) = self.resolved_request(specifier) else {
                continue;
            };
            if let Err(exception) = dependency.evaluate() {
                self.fail(exception.clone());
                return Err(exception);
            }
        }

        match interpreter::run_module_body(&compiled.program, &env) {
            Ok(completion) => {
                let mut state = self.0.state.borrow_mut();
                state.status = ModuleStatus::Evaluated;
                state.completion = completion.clone();
                Ok(completion)
            }
            Err(exception) => {
                exception.attach_url(self.url());
                debug!(url = %self.url(), error = %exception, "evaluation failed");
                self.fail(exception.clone());
                Err(exception)
            }
        }
    }

    fn fail(&self, exception: Exception) {
        let mut state = self.0.state.borrow_mut();
        state.status = ModuleStatus::Errored;
        state.exception = Some(exception);
    }

    fn set_status(&self, status: ModuleStatus) {
        self.0.state.borrow_mut().status = status;
    }

    /// Live namespace, available once instantiated
    pub fn namespace(&self) -> Option<Namespace> {
        self.0.state.borrow().namespace.clone()
    }

    /// Live binding behind an exported name
    pub fn binding(&self, name: &str) -> Option<Binding> {
        self.namespace()
            .and_then(|ns| ns.binding(name).cloned())
    }

    /// Set the value of a locally declared export from the host. This is how
    /// reflective records receive their values.
    pub fn set_export(&self, name: &str, value: Value) -> Result<(), Exception> {
        let state = self.0.state.borrow();
        if state.status < ModuleStatus::Instantiated {
            return Err(Exception::reference_error(&format!(
                "Module '{}' is not instantiated",
                self.url()
            )));
        }
        let local = state
            .compiled
            .as_ref()
            .and_then(|c| c.local_for_export(name))
            .ok_or_else(|| {
                Exception::reference_error(&format!(
                    "Module '{}' has no local export named '{}'",
                    self.url(),
                    name
                ))
            })?;
        let entry = state.env.as_ref().and_then(|env| env.own(local)).ok_or_else(|| {
            Exception::reference_error(&format!("Binding '{}' is missing", local))
        })?;
        entry.binding.set(value);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Linker access
    // ---------------------------------------------------------------------

    pub(crate) fn compiled(&self) -> Option<Rc<CompiledModule>> {
        self.0.state.borrow().compiled.clone()
    }

    pub(crate) fn env(&self) -> Option<Rc<Scope>> {
        self.0.state.borrow().env.clone()
    }

    pub(crate) fn url_rc(&self) -> Rc<str> {
        self.0.url.clone()
    }

    pub(crate) fn dynamic_import_slot(&self) -> DynamicImportSlot {
        self.0.dynamic_import.clone()
    }

    pub(crate) fn commit_instantiation(&self, env: Rc<Scope>, namespace: Namespace) {
        let mut state = self.0.state.borrow_mut();
        state.env = Some(env);
        state.namespace = Some(namespace);
        state.status = ModuleStatus::Instantiated;
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("url", &self.url())
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for ModuleRecord {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ModuleRecord {}

/// Parse source and derive import/export tables. Errors are rendered
/// `line:column: message`.
fn analyze(source: &str) -> Result<CompiledModule, String> {
    let program = parser::parse(source).map_err(|e| e.render(source))?;

    let mut requests: Vec<String> = Vec::new();
    let mut imports = Vec::new();
    let mut local_exports = Vec::new();
    let mut named_exports: Vec<(ExportSpecifier, Option<String>)> = Vec::new();
    let mut declarations: Vec<(String, Declaration)> = Vec::new();
    let mut bound: FxHashSet<String> = FxHashSet::default();

    fn bind(name: &str, bound: &mut FxHashSet<String>) -> Result<(), String> {
        if !bound.insert(name.to_string()) {
            return Err(format!("Identifier '{}' has already been declared", name));
        }
        Ok(())
    }

    fn add_request(requests: &mut Vec<String>, specifier: &str) {
        if !requests.iter().any(|r| r == specifier) {
            requests.push(specifier.to_string());
        }
    }

    fn declare_stmt(
        stmt: &Stmt,
        declarations: &mut Vec<(String, Declaration)>,
    ) -> Vec<String> {
        match stmt {
            Stmt::VarDecl { kind, declarations: decls } => {
                for (name, _) in decls {
                    let decl = match kind {
                        VarKind::Let => Declaration::Let,
                        VarKind::Const => Declaration::Const,
                    };
                    declarations.push((name.clone(), decl));
                }
            }
            Stmt::Function(func) => {
                if let Some(name) = &func.name {
                    declarations.push((name.clone(), Declaration::Function(func.clone())));
                }
            }
            _ => {}
        }
        stmt.declared_names()
    }

    for item in &program.items {
        match item {
            ModuleItem::Import(decl) => {
                add_request(&mut requests, &decl.specifier);
                if let Some(local) = &decl.default {
                    bind(local, &mut bound)?;
                    imports.push(ImportEntry {
                        specifier: decl.specifier.clone(),
                        import_name: ImportName::Named("default".to_string()),
                        local: local.clone(),
                    });
                }
                if let Some(local) = &decl.namespace {
                    bind(local, &mut bound)?;
                    imports.push(ImportEntry {
                        specifier: decl.specifier.clone(),
                        import_name: ImportName::Namespace,
                        local: local.clone(),
                    });
                }
                for spec in &decl.named {
                    bind(&spec.local, &mut bound)?;
                    imports.push(ImportEntry {
                        specifier: decl.specifier.clone(),
                        import_name: ImportName::Named(spec.imported.clone()),
                        local: spec.local.clone(),
                    });
                }
            }
            ModuleItem::Export(ExportDecl::Declaration(stmt)) => {
                for name in declare_stmt(stmt, &mut declarations) {
                    bind(&name, &mut bound)?;
                    local_exports.push((name.clone(), name));
                }
            }
            ModuleItem::Export(ExportDecl::DefaultFunction(func)) => {
                let local = func.name.clone().unwrap_or_else(|| DEFAULT_LOCAL.to_string());
                bind(&local, &mut bound)?;
                declarations.push((local.clone(), Declaration::Function(func.clone())));
                local_exports.push(("default".to_string(), local));
            }
            ModuleItem::Export(ExportDecl::DefaultExpr(_)) => {
                bind(DEFAULT_LOCAL, &mut bound)?;
                declarations.push((DEFAULT_LOCAL.to_string(), Declaration::Const));
                local_exports.push(("default".to_string(), DEFAULT_LOCAL.to_string()));
            }
            ModuleItem::Export(ExportDecl::Named {
                specifiers, from, ..
            }) => {
                if let Some(specifier) = from {
                    add_request(&mut requests, specifier);
                }
                for spec in specifiers {
                    named_exports.push((spec.clone(), from.clone()));
                }
            }
            ModuleItem::Stmt(stmt) => {
                if contains_return(stmt) {
                    return Err("Illegal return statement".to_string());
                }
                for name in declare_stmt(stmt, &mut declarations) {
                    bind(&name, &mut bound)?;
                }
            }
        }
    }

    let mut indirect_exports = Vec::new();
    for (spec, from) in named_exports {
        match from {
            Some(specifier) => indirect_exports.push(IndirectExport {
                exported: spec.exported,
                specifier,
                import_name: spec.local,
            }),
            None => {
                let import = imports.iter().find(|i| i.local == spec.local);
                match import {
                    Some(ImportEntry {
                        specifier,
                        import_name: ImportName::Named(name),
                        ..
                    }) => indirect_exports.push(IndirectExport {
                        exported: spec.exported,
                        specifier: specifier.clone(),
                        import_name: name.clone(),
                    }),
                    _ if bound.contains(&spec.local) => {
                        local_exports.push((spec.exported, spec.local))
                    }
                    _ => return Err(format!("Export '{}' is not defined in module", spec.local)),
                }
            }
        }
    }

    let mut seen = FxHashSet::default();
    for name in local_exports
        .iter()
        .map(|(exported, _)| exported)
        .chain(indirect_exports.iter().map(|e| &e.exported))
    {
        if !seen.insert(name.clone()) {
            return Err(format!("Duplicate export of '{}'", name));
        }
    }

    Ok(CompiledModule {
        program,
        requests,
        imports,
        local_exports,
        indirect_exports,
        declarations,
    })
}

fn contains_return(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Return(_) => true,
        Stmt::If {
            consequent,
            alternate,
            ..
        } => contains_return(consequent) || alternate.as_deref().is_some_and(contains_return),
        Stmt::While { body, .. } => contains_return(body),
        Stmt::Block(stmts) => stmts.iter().any(contains_return),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_uncompiled() {
        let record = ModuleRecord::new("file:///a.js");
        assert_eq!(record.status(), ModuleStatus::Uncompiled);
        assert!(record.requests().is_empty());
        assert!(record.namespace().is_none());
    }

    #[test]
    fn test_requests_are_ordered_and_deduplicated() {
        let record = ModuleRecord::new("file:///a.js");
        record
            .compile(
                "import a from './a'; import { b } from './b'; import './a'; export { c } from './c';",
            )
            .unwrap();
        assert_eq!(record.requests(), vec!["./a", "./b", "./c"]);
        assert_eq!(record.status(), ModuleStatus::Uninstantiated);
    }

    #[test]
    fn test_syntax_error_is_captured() {
        let record = ModuleRecord::new("file:///bad.js");
        let err = record.compile("export const = 1;").unwrap_err();
        assert_eq!(record.status(), ModuleStatus::Errored);
        assert!(record.exception().unwrap().ptr_eq(&err));
        assert!(err.message().starts_with("SyntaxError: 1:14:"));
        assert_eq!(err.url().as_deref(), Some("file:///bad.js"));
    }

    #[test]
    fn test_compile_twice_is_rejected() {
        let record = ModuleRecord::new("file:///a.js");
        record.compile("").unwrap();
        assert!(record.compile("").is_err());
        assert_eq!(record.status(), ModuleStatus::Uninstantiated);
    }

    #[test]
    fn test_first_resolution_wins() {
        let record = ModuleRecord::new("file:///a.js");
        record.compile("import './x';").unwrap();
        let first = ModuleRecord::new("file:///x.js");
        let second = ModuleRecord::new("file:///other.js");
        assert!(record.resolve_request("./x", &first));
        assert!(!record.resolve_request("./x", &second));
        assert!(record.resolved_request("./x").unwrap().ptr_eq(&first));
        assert!(record.is_fully_resolved());
    }

    #[test]
    fn test_duplicate_declarations_rejected() {
        let record = ModuleRecord::new("file:///a.js");
        let err = record.compile("import x from './x'; const x = 1;").unwrap_err();
        assert!(err.message().contains("Identifier 'x' has already been declared"));
    }

    #[test]
    fn test_duplicate_export_rejected() {
        let record = ModuleRecord::new("file:///a.js");
        let err = record
            .compile("export const a = 1; const b = 2; export { b as a };")
            .unwrap_err();
        assert!(err.message().contains("Duplicate export of 'a'"));
    }

    #[test]
    fn test_export_of_undeclared_name_rejected() {
        let record = ModuleRecord::new("file:///a.js");
        assert!(record.compile("export { nope };").is_err());
    }

    #[test]
    fn test_top_level_return_rejected() {
        let record = ModuleRecord::new("file:///a.js");
        let err = record.compile("if (true) { return 1; }").unwrap_err();
        assert!(err.message().contains("Illegal return statement"));
    }

    #[test]
    fn test_evaluate_requires_instantiation() {
        let record = ModuleRecord::new("file:///a.js");
        record.compile("1").unwrap();
        assert!(record.evaluate().is_err());
        assert_eq!(record.status(), ModuleStatus::Uninstantiated);
    }

    #[test]
    fn test_evaluate_returns_completion_value() {
        let record = ModuleRecord::new("file:///a.js");
        record.compile("const a = 2; a * 21").unwrap();
        record.instantiate().unwrap();
        assert_eq!(record.evaluate().unwrap(), Value::from(42.0));
        assert_eq!(record.status(), ModuleStatus::Evaluated);
        // Evaluating again returns the stored completion without re-running
        assert_eq!(record.evaluate().unwrap(), Value::from(42.0));
    }

    #[test]
    fn test_set_export_on_reflective_record() {
        let record = ModuleRecord::new("host-facade:test");
        record.compile("export let value;").unwrap();
        record.instantiate().unwrap();
        record.evaluate().unwrap();
        record.set_export("value", Value::from(5.0)).unwrap();
        assert_eq!(record.namespace().unwrap().get("value"), Some(Value::from(5.0)));
        assert!(record.set_export("missing", Value::Null).is_err());
    }
}
