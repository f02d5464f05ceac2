//! Batch instantiation (linking) of module records.
//!
//! Linking runs in two phases over the transitive set of not yet
//! instantiated records: every import is resolved against its exporter's
//! bindings first, and only when all of them resolve are scopes,
//! namespaces and statuses committed. A failure leaves every record in the
//! set `Uninstantiated`.

use std::collections::BTreeMap;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::exception::Exception;
use crate::interpreter::{make_function, Scope, DYNAMIC_IMPORT_LOCAL, IMPORT_META_LOCAL};
use crate::record::{CompiledModule, Declaration, ImportName, ModuleRecord, ModuleStatus};
use crate::value::{Binding, Namespace, Value};

/// A record being linked in the current batch
struct Pending {
    record: ModuleRecord,
    compiled: Rc<CompiledModule>,
    scope: Rc<Scope>,
    namespace: Option<Namespace>,
}

/// Instantiate `roots` and every record reachable from them that is not yet
/// instantiated. Already instantiated records are left untouched.
pub fn instantiate_all(roots: &[ModuleRecord]) -> Result<(), Exception> {
    let batch = collect(roots)?;
    if batch.is_empty() {
        return Ok(());
    }
    debug!(count = batch.len(), "instantiating module batch");

    let globals = Scope::with_globals();
    let mut linker = Linker {
        pending: Vec::with_capacity(batch.len()),
        index: FxHashMap::default(),
    };

    // Phase 1a: declare every module's own bindings
    for record in batch {
        let compiled = record
            .compiled()
            .ok_or_else(|| not_compiled(&record))?;
        let scope = Scope::new(Some(globals.clone()));
        for (name, declaration) in &compiled.declarations {
            let writable = matches!(declaration, Declaration::Let | Declaration::Function(_));
            scope.declare(name, Binding::uninitialized(), writable);
        }
        for import in &compiled.imports {
            if import.import_name == ImportName::Namespace {
                scope.declare(&import.local, Binding::uninitialized(), false);
            }
        }
        declare_module_meta(&record, &scope);
        linker.index.insert(record.id(), linker.pending.len());
        linker.pending.push(Pending {
            record,
            compiled,
            scope,
            namespace: None,
        });
    }

    // Phase 1b: build namespaces, then bind imports
    for i in 0..linker.pending.len() {
        let namespace = linker.build_namespace(&linker.pending[i].record)?;
        linker.pending[i].namespace = Some(namespace);
    }
    for i in 0..linker.pending.len() {
        linker.bind_imports(i)?;
    }

    // Phase 2: commit
    for pending in linker.pending {
        for (name, declaration) in &pending.compiled.declarations {
            if let Declaration::Function(decl) = declaration {
                if let Some(entry) = pending.scope.own(name) {
                    entry.binding.set(make_function(decl, &pending.scope));
                }
            }
        }
        let namespace = pending
            .namespace
            .unwrap_or_else(|| Namespace::new(pending.record.url_rc(), BTreeMap::new()));
        debug!(url = %pending.record.url(), "instantiated module");
        pending.record.commit_instantiation(pending.scope, namespace);
    }

    Ok(())
}

/// Transitive closure of uninstantiated records, in discovery order
fn collect(roots: &[ModuleRecord]) -> Result<Vec<ModuleRecord>, Exception> {
    let mut seen = FxHashSet::default();
    let mut order = Vec::new();
    let mut stack: Vec<ModuleRecord> = roots.iter().rev().cloned().collect();

    while let Some(record) = stack.pop() {
        if !seen.insert(record.id()) {
            continue;
        }
        match record.status() {
            ModuleStatus::Uncompiled => return Err(not_compiled(&record)),
            ModuleStatus::Errored => {
                return Err(record
                    .exception()
                    .unwrap_or_else(|| Exception::link("Module previously failed")))
            }
            ModuleStatus::Uninstantiated => {}
            _ => continue,
        }
        let requests = record.requests();
        for specifier in requests.iter().rev() {
            let dependency = record.resolved_request(specifier).ok_or_else(|| {
                Exception::link(&format!(
                    "Cannot resolve module specifier '{}' from '{}'",
                    specifier,
                    record.url()
                ))
            })?;
            stack.push(dependency);
        }
        order.push(record);
    }

    Ok(order)
}

fn not_compiled(record: &ModuleRecord) -> Exception {
    Exception::link(&format!("Module '{}' has not been compiled", record.url()))
}

/// Bind `import.meta` and the `import(...)` entry point in a module scope
fn declare_module_meta(record: &ModuleRecord, scope: &Scope) {
    let url = record.url_rc();
    let meta = Value::object([("url", Value::String(url.clone()))]);
    scope.declare(IMPORT_META_LOCAL, Binding::with_value(meta), false);

    let slot = record.dynamic_import_slot();
    let import = Value::native("import", move |args| {
        let specifier = args.first().map(Value::to_display_string).unwrap_or_default();
        let hook = slot.borrow().clone();
        match hook {
            Some(hook) => hook(&specifier, &url),
            None => Err(Exception::type_error(&format!(
                "Dynamic import is not supported in module '{}'",
                url
            ))),
        }
    });
    scope.declare(DYNAMIC_IMPORT_LOCAL, Binding::with_value(import), false);
}

struct Linker {
    pending: Vec<Pending>,
    index: FxHashMap<usize, usize>,
}

impl Linker {
    /// Scope holding `record`'s own bindings, pending or committed
    fn scope_of(&self, record: &ModuleRecord) -> Option<Rc<Scope>> {
        match self.index.get(&record.id()) {
            Some(&i) => Some(self.pending[i].scope.clone()),
            None => record.env(),
        }
    }

    fn namespace_of(&self, record: &ModuleRecord) -> Result<Namespace, Exception> {
        match self.index.get(&record.id()) {
            Some(&i) => match &self.pending[i].namespace {
                Some(ns) => Ok(ns.clone()),
                None => self.build_namespace(record),
            },
            None => record.namespace().ok_or_else(|| not_compiled(record)),
        }
    }

    fn build_namespace(&self, record: &ModuleRecord) -> Result<Namespace, Exception> {
        let compiled = record.compiled().ok_or_else(|| not_compiled(record))?;
        let mut bindings = BTreeMap::new();
        for name in compiled.export_names() {
            let binding = self.resolve_binding(record, name)?;
            bindings.insert(name.to_string(), binding);
        }
        Ok(Namespace::new(record.url_rc(), bindings))
    }

    fn bind_imports(&self, i: usize) -> Result<(), Exception> {
        let pending = &self.pending[i];
        for import in &pending.compiled.imports {
            let dependency = pending
                .record
                .resolved_request(&import.specifier)
                .ok_or_else(|| {
                    Exception::link(&format!(
                        "Cannot resolve module specifier '{}' from '{}'",
                        import.specifier,
                        pending.record.url()
                    ))
                })?;
            match &import.import_name {
                ImportName::Namespace => {
                    let namespace = self.namespace_of(&dependency)?;
                    if let Some(entry) = pending.scope.own(&import.local) {
                        entry.binding.set(Value::Namespace(namespace));
                    }
                }
                ImportName::Named(name) => {
                    let binding = self.resolve_binding(&dependency, name).map_err(|_| {
                        Exception::link(&format!(
                            "The requested module '{}' does not provide an export named '{}'",
                            import.specifier, name
                        ))
                    })?;
                    pending.scope.declare(&import.local, binding, false);
                }
            }
        }
        Ok(())
    }

    /// Follow `name` through re-exports to the binding that holds it
    fn resolve_binding(&self, record: &ModuleRecord, name: &str) -> Result<Binding, Exception> {
        let mut visited = FxHashSet::default();
        let (owner, local) = resolve_export(record, name, &mut visited)?.ok_or_else(|| {
            Exception::link(&format!(
                "Module '{}' does not provide an export named '{}'",
                record.url(),
                name
            ))
        })?;
        self.scope_of(&owner)
            .and_then(|scope| scope.own(&local))
            .map(|entry| entry.binding)
            .ok_or_else(|| {
                Exception::link(&format!(
                    "Binding '{}' of module '{}' is not declared",
                    local,
                    owner.url()
                ))
            })
    }
}

/// Resolve an export to `(owning record, local name)`. Returns `None` for
/// an unknown export or a circular re-export chain.
fn resolve_export(
    record: &ModuleRecord,
    name: &str,
    visited: &mut FxHashSet<(usize, String)>,
) -> Result<Option<(ModuleRecord, String)>, Exception> {
    if !visited.insert((record.id(), name.to_string())) {
        return Ok(None);
    }
    let Some(compiled) = record.compiled() else {
        return Ok(None);
    };
    if let Some(local) = compiled.local_for_export(name) {
        return Ok(Some((record.clone(), local.to_string())));
    }
    if let Some(indirect) = compiled.indirect_export(name) {
        let dependency = record.resolved_request(&indirect.specifier).ok_or_else(|| {
            Exception::link(&format!(
                "Cannot resolve module specifier '{}' from '{}'",
                indirect.specifier,
                record.url()
            ))
        })?;
        return resolve_export(&dependency, &indirect.import_name, visited);
    }
    Ok(None)
}
