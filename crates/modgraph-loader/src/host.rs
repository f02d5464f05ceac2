//! Host modules
//!
//! A host module is a value supplied by the embedding program and bridged
//! into the graph as a module under `host:<name>`. Its factory runs lazily,
//! when the bridging module is evaluated.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use modgraph_script::{Exception, Value};

/// Produces the host value on first evaluation
pub type HostFactory = Rc<dyn Fn() -> Result<Value, Exception>>;

/// A host-provided module
#[derive(Clone)]
pub struct HostModule {
    export_names: Vec<String>,
    pure: bool,
    factory: HostFactory,
}

impl HostModule {
    /// A pure host module exporting `export_names` (plus `default`)
    pub fn new<S: Into<String>>(
        export_names: impl IntoIterator<Item = S>,
        factory: impl Fn() -> Result<Value, Exception> + 'static,
    ) -> Self {
        Self {
            export_names: export_names.into_iter().map(Into::into).collect(),
            pure: true,
            factory: Rc::new(factory),
        }
    }

    /// Mark the module as having side effects; only `default` is exported
    pub fn with_side_effects(mut self) -> Self {
        self.pure = false;
        self
    }

    pub fn export_names(&self) -> &[String] {
        &self.export_names
    }

    pub fn is_pure(&self) -> bool {
        self.pure
    }

    pub fn factory(&self) -> HostFactory {
        self.factory.clone()
    }
}

impl fmt::Debug for HostModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostModule")
            .field("export_names", &self.export_names)
            .field("pure", &self.pure)
            .finish()
    }
}

/// Registry of host modules by name
#[derive(Debug, Clone, Default)]
pub struct HostModules {
    modules: BTreeMap<String, HostModule>,
}

impl HostModules {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `console` and `math`
    pub fn with_builtins() -> Self {
        let mut modules = Self::new();
        modules.register("console", console_module());
        modules.register("math", math_module());
        modules
    }

    pub fn register(&mut self, name: &str, module: HostModule) {
        self.modules.insert(name.to_string(), module);
    }

    pub fn get(&self, name: &str) -> Option<&HostModule> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg.as_str() {
            Some(s) => s.to_string(),
            None => arg.inspect(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn console_module() -> HostModule {
    HostModule::new(["log", "error"], || {
        Ok(Value::object([
            (
                "log",
                Value::native("log", |args| {
                    println!("{}", render_args(args));
                    Ok(Value::Undefined)
                }),
            ),
            (
                "error",
                Value::native("error", |args| {
                    eprintln!("{}", render_args(args));
                    Ok(Value::Undefined)
                }),
            ),
        ]))
    })
}

fn fold_numbers(args: &[Value], init: f64, pick: fn(f64, f64) -> f64) -> f64 {
    let mut result = init;
    for arg in args {
        let n = arg.to_number();
        if n.is_nan() {
            return f64::NAN;
        }
        result = pick(result, n);
    }
    result
}

fn first_number(args: &[Value]) -> f64 {
    args.first().map(Value::to_number).unwrap_or(f64::NAN)
}

fn math_module() -> HostModule {
    HostModule::new(["max", "min", "floor", "abs", "PI"], || {
        Ok(Value::object([
            (
                "max",
                Value::native("max", |args| {
                    Ok(Value::Number(fold_numbers(args, f64::NEG_INFINITY, f64::max)))
                }),
            ),
            (
                "min",
                Value::native("min", |args| {
                    Ok(Value::Number(fold_numbers(args, f64::INFINITY, f64::min)))
                }),
            ),
            (
                "floor",
                Value::native("floor", |args| Ok(Value::Number(first_number(args).floor()))),
            ),
            (
                "abs",
                Value::native("abs", |args| Ok(Value::Number(first_number(args).abs()))),
            ),
            ("PI", Value::Number(std::f64::consts::PI)),
        ]))
    })
}
