//! Content-kind initialization
//!
//! Every content kind reduces to the same linkable unit: a module record
//! compiled from source text. Script sources compile as they are; host
//! modules and binary modules compile from synthesized source that imports
//! host-supplied values from a provider record resolved under the empty
//! specifier `""`.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::rc::Rc;

use modgraph_script::{get_property, Binding, Exception, ModuleRecord, Value};
use modgraph_wasm::{BinaryModule, ExportKind, Imports, Instance, Trap, Val};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{InitError, LoadError};
use crate::fetch::{
    FetchError, Resource, BINARY_MODULE_KIND, HOST_MODULE_KIND, SCRIPT_SOURCE_KIND,
};
use crate::host::{HostFactory, HostModules};

/// Specifier under which synthesized source imports its provider record
const PROVIDER_SPECIFIER: &str = "";

/// How a content kind becomes a module record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    /// Module script source text
    ScriptSource,
    /// A host module, bridged in through a reflective facade
    HostBridge,
    /// A portable binary module
    BinaryModule,
}

impl ContentKind {
    /// Compile `record` from `resource`, leaving its requests populated
    pub fn initialize(
        self,
        record: &ModuleRecord,
        url: &Url,
        resource: Resource,
        hosts: &HostModules,
    ) -> Result<(), LoadError> {
        debug!(url = %url, kind = ?self, "initializing module");
        match self {
            ContentKind::ScriptSource => initialize_script(record, url, resource),
            ContentKind::HostBridge => initialize_host(record, url, &resource, hosts),
            ContentKind::BinaryModule => initialize_binary(record, url, resource),
        }
    }
}

/// Content-kind string → initializer table
#[derive(Debug, Clone)]
pub struct ContentKinds {
    table: BTreeMap<String, ContentKind>,
}

impl Default for ContentKinds {
    fn default() -> Self {
        let mut kinds = Self::empty();
        kinds.register(SCRIPT_SOURCE_KIND, ContentKind::ScriptSource);
        kinds.register("application/javascript", ContentKind::ScriptSource);
        kinds.register(HOST_MODULE_KIND, ContentKind::HostBridge);
        kinds.register(BINARY_MODULE_KIND, ContentKind::BinaryModule);
        kinds
    }
}

impl ContentKinds {
    /// The default table
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with no entries
    pub fn empty() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, content_kind: &str, kind: ContentKind) {
        self.table.insert(normalize(content_kind), kind);
    }

    /// Look up a content kind; parameters after `;` and case are ignored
    pub fn lookup(&self, content_kind: &str) -> Option<ContentKind> {
        self.table.get(&normalize(content_kind)).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, ContentKind)> {
        self.table.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

fn normalize(content_kind: &str) -> String {
    content_kind
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether `name` can appear as an import or export name in source text
fn is_identifier_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Source text string literal
fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

// =============================================================================
// Script source
// =============================================================================

fn initialize_script(record: &ModuleRecord, url: &Url, resource: Resource) -> Result<(), LoadError> {
    let invalid = || InitError::InvalidEncoding {
        url: url.to_string(),
    };
    let bytes = resource.bytes.ok_or_else(invalid)?;
    let source = String::from_utf8(bytes).map_err(|_| invalid())?;
    record.compile(&source)?;
    Ok(())
}

// =============================================================================
// Host bridge
// =============================================================================

fn initialize_host(
    record: &ModuleRecord,
    url: &Url,
    resource: &Resource,
    hosts: &HostModules,
) -> Result<(), LoadError> {
    let name = url.path();
    let module = hosts.get(name).ok_or_else(|| {
        LoadError::from(FetchError::NotFound {
            url: url.to_string(),
        })
    })?;

    let pure = resource.parameter("sideEffects") == Some("false");
    let mut exports: Vec<String> = Vec::new();
    if pure {
        for key in module.export_names() {
            if key == "default" || exports.contains(key) {
                continue;
            }
            if !is_identifier_name(key) {
                warn!(module = name, key = %key, "skipping host key that is not an identifier");
                continue;
            }
            exports.push(key.clone());
        }
    }
    exports.push("default".to_string());

    let facade = ModuleRecord::new(format!("host-facade:{}", url));
    let mut facade_source = String::from("export let executor;\n");
    for export in &exports {
        let _ = writeln!(facade_source, "export let ${};", export);
    }
    facade.compile(&facade_source)?;
    facade.instantiate()?;
    facade.evaluate()?;

    let mut slots = Vec::with_capacity(exports.len());
    for export in &exports {
        let binding = facade.binding(&format!("${}", export)).ok_or_else(|| {
            LoadError::Link(Exception::link(&format!(
                "Host facade for {} lacks a binding for '{}'",
                url, export
            )))
        })?;
        slots.push((export.clone(), binding));
    }
    facade.set_export("executor", host_executor(name, module.factory(), slots))?;

    let locals: Vec<String> = exports.iter().map(|e| format!("${}", e)).collect();
    let reexports: Vec<String> = exports
        .iter()
        .map(|e| format!("${} as {}", e, e))
        .collect();
    let wrapper = format!(
        "import {{ executor, {} }} from \"\";\nexport {{ {} }};\nexecutor();\n",
        locals.join(", "),
        reexports.join(", ")
    );
    record.compile(&wrapper)?;
    record.resolve_request(PROVIDER_SPECIFIER, &facade);
    debug!(url = %url, exports = ?exports, "bridged host module");
    Ok(())
}

/// Native executor: runs the factory once and fills the facade bindings
fn host_executor(name: &str, factory: HostFactory, slots: Vec<(String, Binding)>) -> Value {
    let name = name.to_string();
    let ran = Cell::new(false);
    Value::native("executor", move |_| {
        if ran.replace(true) {
            return Ok(Value::Undefined);
        }
        debug!(module = %name, "creating host module value");
        let value = factory()?;
        for (export, binding) in &slots {
            if export == "default" {
                binding.set(value.clone());
            } else {
                binding.set(get_property(&value, export)?);
            }
        }
        Ok(Value::Undefined)
    })
}

// =============================================================================
// Binary module
// =============================================================================

fn invalid_binary(url: &Url, reason: impl Into<String>) -> LoadError {
    LoadError::from(InitError::InvalidBinaryModule {
        url: url.to_string(),
        reason: reason.into(),
    })
}

fn initialize_binary(record: &ModuleRecord, url: &Url, resource: Resource) -> Result<(), LoadError> {
    let bytes = resource
        .bytes
        .ok_or_else(|| invalid_binary(url, "resource has no bytes"))?;
    let module = BinaryModule::decode(&bytes).map_err(|e| invalid_binary(url, e.to_string()))?;

    // Imports grouped by namespace, namespaces in first-use order
    let mut namespaces: Vec<(String, Vec<(String, String)>)> = Vec::new();
    for (index, import) in module.imports().iter().enumerate() {
        if import.module.is_empty() {
            return Err(invalid_binary(
                url,
                format!("import '{}' is declared under the empty namespace", import.name),
            ));
        }
        if !is_identifier_name(&import.name) {
            return Err(invalid_binary(
                url,
                format!("import name '{}' is not an identifier", import.name),
            ));
        }
        let local = format!("$in{}", index);
        match namespaces.iter_mut().find(|(ns, _)| *ns == import.module) {
            Some((_, names)) => names.push((import.name.clone(), local)),
            None => namespaces.push((import.module.clone(), vec![(import.name.clone(), local)])),
        }
    }

    let mut source = String::from("import { module, instantiate } from \"\";\n");
    for (namespace, names) in &namespaces {
        let specifiers: Vec<String> = names
            .iter()
            .map(|(name, local)| format!("{} as {}", name, local))
            .collect();
        let _ = writeln!(
            source,
            "import {{ {} }} from {};",
            specifiers.join(", "),
            quote(namespace)
        );
    }
    let groups: Vec<String> = namespaces
        .iter()
        .map(|(namespace, names)| {
            let entries: Vec<String> = names
                .iter()
                .map(|(name, local)| format!("{}: {}", quote(name), local))
                .collect();
            format!("{}: {{ {} }}", quote(namespace), entries.join(", "))
        })
        .collect();
    let _ = writeln!(source, "const imports = {{ {} }};", groups.join(", "));
    source.push_str("const instance = instantiate(module, imports);\n");

    let mut reexports = Vec::new();
    for export in module.exports() {
        if export.kind != ExportKind::Func {
            warn!(url = %url, export = %export.name, "skipping non-function export");
            continue;
        }
        if !is_identifier_name(&export.name) {
            warn!(url = %url, export = %export.name, "skipping export that is not an identifier");
            continue;
        }
        let local = format!("$out{}", reexports.len());
        let _ = writeln!(
            source,
            "const {} = instance.exports[{}];",
            local,
            quote(&export.name)
        );
        reexports.push(format!("{} as {}", local, export.name));
    }
    if !reexports.is_empty() {
        let _ = writeln!(source, "export {{ {} }};", reexports.join(", "));
    }

    let provider = ModuleRecord::new(format!("binary-compile:{}", url));
    provider.compile("export let module;\nexport let instantiate;\n")?;
    provider.instantiate()?;
    provider.evaluate()?;
    provider.set_export("module", Value::opaque(module))?;
    provider.set_export("instantiate", Value::native("instantiate", instantiate_binary))?;

    record.compile(&source)?;
    record.resolve_request(PROVIDER_SPECIFIER, &provider);
    debug!(url = %url, requests = ?record.requests(), "bridged binary module");
    Ok(())
}

/// `instantiate(module, imports)` as seen by synthesized source
fn instantiate_binary(args: &[Value]) -> Result<Value, Exception> {
    let module = args
        .first()
        .and_then(|v| v.downcast_opaque::<BinaryModule>())
        .ok_or_else(|| Exception::type_error("instantiate expects a binary module"))?;
    let import_object = args.get(1).cloned().unwrap_or_default();

    let mut imports = Imports::new();
    for import in module.imports() {
        let namespace = get_property(&import_object, &import.module)?;
        let func = get_property(&namespace, &import.name)?;
        if !matches!(func, Value::Function(_)) {
            return Err(Exception::type_error(&format!(
                "Import {}.{} is not a function",
                import.module, import.name
            )));
        }
        let results = import.ty.results.clone();
        imports.define(&import.module, &import.name, move |args: &[Val]| {
            let args: Vec<Value> = args.iter().map(|v| Value::Number(v.to_f64())).collect();
            let result = func
                .call(&args)
                .map_err(|e| Trap::Host(e.message().to_string()))?;
            Ok(results
                .first()
                .map(|ty| vec![Val::from_f64(*ty, result.to_number())])
                .unwrap_or_default())
        });
    }

    let instance = Rc::new(Instance::new(module, &imports).map_err(|e| {
        Exception::thrown(Value::error("LinkError", &e.to_string()))
    })?);
    let exports: Vec<(String, Value)> = instance
        .exported_functions()
        .into_iter()
        .map(|name| {
            let instance = instance.clone();
            let export = name.to_string();
            let func = Value::native(name, move |args| call_export(&instance, &export, args));
            (name.to_string(), func)
        })
        .collect();
    Ok(Value::object([("exports", Value::object(exports))]))
}

fn call_export(instance: &Instance, name: &str, args: &[Value]) -> Result<Value, Exception> {
    let ty = instance
        .module()
        .export_func_type(name)
        .ok_or_else(|| Exception::type_error(&format!("No exported function named '{}'", name)))?;
    let args: Vec<Val> = ty
        .params
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let n = args.get(i).map(Value::to_number).unwrap_or(f64::NAN);
            Val::from_f64(*param, n)
        })
        .collect();
    let results = instance
        .call(name, &args)
        .map_err(|trap| Exception::thrown(Value::error("RuntimeError", &trap.to_string())))?;
    Ok(results
        .first()
        .map(|v| Value::Number(v.to_f64()))
        .unwrap_or_default())
}
