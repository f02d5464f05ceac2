//! Integration tests for the module record lifecycle
//!
//! Tests compile -> resolve -> instantiate -> evaluate on hand-wired graphs.

use modgraph_script::{ExceptionKind, ModuleRecord, ModuleStatus, Value};

fn compiled(url: &str, source: &str) -> ModuleRecord {
    let record = ModuleRecord::new(url);
    record.compile(source).unwrap();
    record
}

#[test]
fn test_create_from_source() {
    let m = ModuleRecord::new("file:///a.mjs");
    assert_eq!(m.url(), "file:///a.mjs");
    assert_eq!(m.status(), ModuleStatus::Uncompiled);

    m.compile("export default true; export const foo = 42; foo;")
        .unwrap();
    assert_eq!(m.status(), ModuleStatus::Uninstantiated);
    m.instantiate().unwrap();
    assert_eq!(m.status(), ModuleStatus::Instantiated);

    let result = m.evaluate().unwrap();
    assert_eq!(result, Value::from(42.0));
    assert_eq!(m.status(), ModuleStatus::Evaluated);

    let ns = m.namespace().unwrap();
    assert_eq!(ns.names(), vec!["default", "foo"]);
    assert_eq!(ns.get("foo"), Some(Value::from(42.0)));
    assert_eq!(ns.get("default"), Some(Value::Bool(true)));
    assert!(m.exception().is_none());
}

#[test]
fn test_failing_module_captures_exception() {
    let failing = compiled("file:///b.mjs", r#"throw new Error("oops");"#);
    failing.instantiate().unwrap();

    let err = failing.evaluate().unwrap_err();
    assert_eq!(err.kind(), ExceptionKind::Evaluation);
    assert_eq!(err.message(), "Error: oops");
    assert_eq!(err.url().as_deref(), Some("file:///b.mjs"));
    assert_eq!(failing.status(), ModuleStatus::Errored);
    assert!(failing.exception().unwrap().ptr_eq(&err));

    // Re-evaluating surfaces the same exception instead of running again
    let again = failing.evaluate().unwrap_err();
    assert!(again.ptr_eq(&err));
}

#[test]
fn test_deeply_nested_source_is_syntax_error() {
    let source = format!(
        "export default {}1{};",
        "(".repeat(20_000),
        ")".repeat(20_000)
    );
    let m = ModuleRecord::new("file:///deep.mjs");
    let err = m.compile(&source).unwrap_err();
    assert_eq!(err.kind(), ExceptionKind::Syntax);
    assert!(err.message().contains("Nesting is too deep"));
    assert_eq!(m.status(), ModuleStatus::Errored);
}

#[test]
fn test_link_to_other_modules() {
    let m = compiled(
        "file:///a.mjs",
        "import { x } from 'dep1';\nimport y from 'dep2';\n\nx + 2 * y;\n",
    );
    assert_eq!(m.requests(), vec!["dep1", "dep2"]);

    let dep1 = compiled("dep1", "export const x = 3;");
    assert!(!m.is_resolved("dep1"));
    m.resolve_request("dep1", &dep1);
    assert!(m.is_resolved("dep1"));
    let dep2 = compiled("dep2", "export default 4;");
    m.resolve_request("dep2", &dep2);

    m.instantiate().unwrap();
    assert_eq!(dep1.status(), ModuleStatus::Instantiated);
    assert_eq!(m.evaluate().unwrap(), Value::from(11.0));
    assert_eq!(dep1.status(), ModuleStatus::Evaluated);
    assert_eq!(dep2.status(), ModuleStatus::Evaluated);
}

#[test]
fn test_dependency_failure_propagates_identity() {
    let dep = compiled("file:///dep.js", "throw new TypeError('bad dep');");
    let main = compiled("file:///main.js", "import './dep.js'; export const ok = 1;");
    main.resolve_request("./dep.js", &dep);
    main.instantiate().unwrap();

    let err = main.evaluate().unwrap_err();
    assert_eq!(err.message(), "TypeError: bad dep");
    assert_eq!(main.status(), ModuleStatus::Errored);
    assert!(main.exception().unwrap().ptr_eq(&err));
    assert!(dep.exception().unwrap().ptr_eq(&err));
    assert_eq!(err.url().as_deref(), Some("file:///dep.js"));
}

#[test]
fn test_dependencies_evaluate_in_request_order_once() {
    let log = compiled("file:///log.js", "export const events = [];");
    let a = compiled(
        "file:///a.js",
        "import { events } from './log.js'; events.push('a');",
    );
    let b = compiled(
        "file:///b.js",
        "import { events } from './log.js'; import './a.js'; events.push('b');",
    );
    let main = compiled(
        "file:///main.js",
        "import { events } from './log.js'; import './b.js'; import './a.js'; events.push('main'); export const order = events.join(',');",
    );
    a.resolve_request("./log.js", &log);
    b.resolve_request("./log.js", &log);
    b.resolve_request("./a.js", &a);
    main.resolve_request("./log.js", &log);
    main.resolve_request("./b.js", &b);
    main.resolve_request("./a.js", &a);

    main.instantiate().unwrap();
    main.evaluate().unwrap();
    let order = main.namespace().unwrap().get("order").unwrap();
    assert_eq!(order, Value::from("a,b,main"));
}

#[test]
fn test_imports_are_live_bindings() {
    let counter = compiled(
        "file:///counter.js",
        "export let count = 0; export function inc() { count = count + 1; }",
    );
    let main = compiled(
        "file:///main.js",
        "import { count, inc } from './counter.js'; inc(); inc(); export const seen = count;",
    );
    main.resolve_request("./counter.js", &counter);
    main.instantiate().unwrap();
    main.evaluate().unwrap();

    assert_eq!(main.namespace().unwrap().get("seen"), Some(Value::from(2.0)));
    let inc = counter.namespace().unwrap().get("inc").unwrap();
    inc.call(&[]).unwrap();
    assert_eq!(counter.namespace().unwrap().get("count"), Some(Value::from(3.0)));
}

#[test]
fn test_assigning_to_import_is_type_error() {
    let dep = compiled("file:///dep.js", "export let v = 1;");
    let main = compiled("file:///main.js", "import { v } from './dep.js'; v = 2;");
    main.resolve_request("./dep.js", &dep);
    main.instantiate().unwrap();
    let err = main.evaluate().unwrap_err();
    assert_eq!(err.message(), "TypeError: Assignment to constant variable.");
}

#[test]
fn test_cycle_links_and_evaluates() {
    let a = compiled(
        "file:///a.js",
        "import { b, readA } from './b.js'; export let a = 1; export const viaB = readA();",
    );
    let b = compiled(
        "file:///b.js",
        "import { a } from './a.js'; export const b = 2; export function readA() { return a; }",
    );
    a.resolve_request("./b.js", &b);
    b.resolve_request("./a.js", &a);

    a.instantiate().unwrap();
    assert_eq!(b.status(), ModuleStatus::Instantiated);
    a.evaluate().unwrap();
    assert_eq!(a.status(), ModuleStatus::Evaluated);
    assert_eq!(b.status(), ModuleStatus::Evaluated);
    assert_eq!(a.namespace().unwrap().get("viaB"), Some(Value::from(1.0)));
}

#[test]
fn test_cycle_observes_uninitialized_binding() {
    let a = compiled("file:///a.js", "import { b } from './b.js'; export const a = 'a';");
    let b = compiled("file:///b.js", "import { a } from './a.js'; export const b = a;");
    a.resolve_request("./b.js", &b);
    b.resolve_request("./a.js", &a);
    a.instantiate().unwrap();

    let err = a.evaluate().unwrap_err();
    assert_eq!(err.message(), "ReferenceError: Cannot access 'a' before initialization");
    assert_eq!(b.status(), ModuleStatus::Errored);
    assert_eq!(a.status(), ModuleStatus::Errored);
}

#[test]
fn test_namespace_import() {
    let dep = compiled("file:///dep.js", "export default 'd'; export const n = 1;");
    let main = compiled(
        "file:///main.js",
        "import * as ns from './dep.js'; export const both = ns.default + ns.n; export { ns };",
    );
    main.resolve_request("./dep.js", &dep);
    main.instantiate().unwrap();
    main.evaluate().unwrap();

    let ns = main.namespace().unwrap();
    assert_eq!(ns.get("both"), Some(Value::from("d1")));
    match ns.get("ns") {
        Some(Value::Namespace(inner)) => assert!(inner.ptr_eq(&dep.namespace().unwrap())),
        other => panic!("expected namespace, got {:?}", other),
    }
}

#[test]
fn test_reflective_provider_under_empty_specifier() {
    let facade = compiled("host-facade:demo", "export let executor; export let $a;");
    facade.instantiate().unwrap();
    facade.evaluate().unwrap();

    let wrapper = compiled(
        "host:demo",
        r#"import { executor, $a } from ""; export { $a as a }; executor();"#,
    );
    wrapper.resolve_request("", &facade);

    let target = facade.clone();
    facade
        .set_export(
            "executor",
            Value::native("executor", move |_| {
                target.set_export("$a", Value::from("lazy"))?;
                Ok(Value::Undefined)
            }),
        )
        .unwrap();

    wrapper.instantiate().unwrap();
    assert_eq!(wrapper.namespace().unwrap().get("a"), Some(Value::Undefined));
    wrapper.evaluate().unwrap();
    assert_eq!(wrapper.namespace().unwrap().get("a"), Some(Value::from("lazy")));
}

#[test]
fn test_import_meta_url() {
    let m = compiled(
        "file:///pkg/meta.js",
        "export const here = import.meta.url; function locate() { return import.meta.url; } export const there = locate();",
    );
    m.instantiate().unwrap();
    m.evaluate().unwrap();
    let ns = m.namespace().unwrap();
    assert_eq!(ns.get("here"), Some(Value::from("file:///pkg/meta.js")));
    assert_eq!(ns.get("there"), Some(Value::from("file:///pkg/meta.js")));
}

#[test]
fn test_dynamic_import_calls_host_hook() {
    let m = compiled(
        "file:///pkg/lazy.js",
        "export const loaded = import('./dep' + '.js');",
    );
    m.set_dynamic_import(|specifier, referrer| {
        Ok(Value::string(format!("{} from {}", specifier, referrer)))
    });
    assert!(m.requests().is_empty());
    m.instantiate().unwrap();
    m.evaluate().unwrap();
    assert_eq!(
        m.namespace().unwrap().get("loaded"),
        Some(Value::from("./dep.js from file:///pkg/lazy.js"))
    );
}

#[test]
fn test_dynamic_import_without_hook_is_type_error() {
    let m = compiled("file:///pkg/lazy.js", "import('./dep.js');");
    m.instantiate().unwrap();
    let err = m.evaluate().unwrap_err();
    assert_eq!(
        err.message(),
        "TypeError: Dynamic import is not supported in module 'file:///pkg/lazy.js'"
    );
    assert_eq!(m.status(), ModuleStatus::Errored);
}
