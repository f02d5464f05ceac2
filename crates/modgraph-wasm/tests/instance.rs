//! Decoding and executing hand-assembled binary modules

use std::cell::Cell;
use std::rc::Rc;

use modgraph_wasm::{
    BinaryModule, DecodeError, ExportKind, Imports, InstantiateError, Instance, Trap, Val, ValType,
};

/// Imports `env.base: () -> i32`, exports `add(a, b)` and `addBase(a, b) = a + b + base()`
const ADD_MODULE: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
    0x01, 0x0b, 0x02, 0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f, 0x60, 0x00, 0x01, 0x7f, // types
    0x02, 0x0c, 0x01, 0x03, 0x65, 0x6e, 0x76, 0x04, 0x62, 0x61, 0x73, 0x65, 0x00, 0x01, // imports
    0x03, 0x03, 0x02, 0x00, 0x00, // functions
    0x07, 0x11, 0x02, 0x03, 0x61, 0x64, 0x64, 0x00, 0x01, 0x07, 0x61, 0x64, 0x64, 0x42, 0x61,
    0x73, 0x65, 0x00, 0x02, // exports
    0x0a, 0x14, 0x02, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6a, 0x0b, 0x0a, 0x00, 0x20, 0x00,
    0x20, 0x01, 0x6a, 0x10, 0x00, 0x6a, 0x0b, // code
];

/// Exports `div(a, b) = a / b` (signed) and `sum(n) = n + (n - 1) + ... + 1` as a loop
const LOOP_MODULE: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
    0x01, 0x0c, 0x02, 0x60, 0x02, 0x7f, 0x7f, 0x01, 0x7f, 0x60, 0x01, 0x7f, 0x01, 0x7f, // types
    0x03, 0x03, 0x02, 0x00, 0x01, // functions
    0x07, 0x0d, 0x02, 0x03, 0x64, 0x69, 0x76, 0x00, 0x00, 0x03, 0x73, 0x75, 0x6d, 0x00,
    0x01, // exports
    0x0a, 0x2b, 0x02, // code
    0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6d, 0x0b, // div
    0x21, 0x01, 0x01, 0x7f, // sum: one i32 local
    0x02, 0x40, 0x03, 0x40, // block, loop
    0x20, 0x00, 0x45, 0x0d, 0x01, // br_if 1 when n == 0
    0x20, 0x01, 0x20, 0x00, 0x6a, 0x21, 0x01, // acc += n
    0x20, 0x00, 0x41, 0x01, 0x6b, 0x21, 0x00, // n -= 1
    0x0c, 0x00, 0x0b, 0x0b, // br 0, end, end
    0x20, 0x01, 0x0b, // acc
];

fn env_imports(base: i32) -> Imports {
    let mut imports = Imports::new();
    imports.define("env", "base", move |_| Ok(vec![Val::I32(base)]));
    imports
}

#[test]
fn test_decode_reports_imports_and_exports() {
    let module = BinaryModule::decode(ADD_MODULE).unwrap();

    assert_eq!(module.imports().len(), 1);
    assert_eq!(module.imports()[0].module, "env");
    assert_eq!(module.imports()[0].name, "base");
    assert_eq!(module.imports()[0].ty.results, vec![ValType::I32]);

    let names: Vec<_> = module.exports().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["add", "addBase"]);
    assert!(module.exports().iter().all(|e| e.kind == ExportKind::Func));

    let add = module.export_func_type("add").unwrap();
    assert_eq!(add.params, vec![ValType::I32, ValType::I32]);
    assert!(module.export_func_type("missing").is_none());
}

#[test]
fn test_decode_rejects_garbage() {
    let err = BinaryModule::decode(b"not a module").unwrap_err();
    assert!(matches!(err, DecodeError::Invalid(_)));

    let err = BinaryModule::decode(&ADD_MODULE[..20]).unwrap_err();
    assert!(matches!(err, DecodeError::Invalid(_)));
}

#[test]
fn test_call_exported_functions() {
    let module = Rc::new(BinaryModule::decode(ADD_MODULE).unwrap());
    let instance = Instance::new(module, &env_imports(100)).unwrap();

    assert_eq!(instance.call("add", &[Val::I32(2), Val::I32(3)]).unwrap(), vec![Val::I32(5)]);
    assert_eq!(
        instance.call("addBase", &[Val::I32(2), Val::I32(3)]).unwrap(),
        vec![Val::I32(105)]
    );
    assert_eq!(instance.exported_functions(), vec!["add", "addBase"]);
}

#[test]
fn test_host_function_is_called_per_invocation() {
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let mut imports = Imports::new();
    imports.define("env", "base", move |_| {
        counter.set(counter.get() + 1);
        Ok(vec![Val::I32(counter.get())])
    });

    let module = Rc::new(BinaryModule::decode(ADD_MODULE).unwrap());
    let instance = Instance::new(module, &imports).unwrap();
    assert_eq!(calls.get(), 0);

    assert_eq!(instance.call("addBase", &[Val::I32(0), Val::I32(0)]).unwrap(), vec![Val::I32(1)]);
    assert_eq!(instance.call("addBase", &[Val::I32(0), Val::I32(0)]).unwrap(), vec![Val::I32(2)]);
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_missing_import() {
    let module = Rc::new(BinaryModule::decode(ADD_MODULE).unwrap());
    let err = Instance::new(module, &Imports::new()).unwrap_err();
    match err {
        InstantiateError::MissingImport { module, name } => {
            assert_eq!(module, "env");
            assert_eq!(name, "base");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_host_trap_propagates() {
    let mut imports = Imports::new();
    imports.define("env", "base", |_| Err(Trap::Host("boom".into())));
    let module = Rc::new(BinaryModule::decode(ADD_MODULE).unwrap());
    let instance = Instance::new(module, &imports).unwrap();

    let err = instance.call("addBase", &[Val::I32(1), Val::I32(1)]).unwrap_err();
    assert_eq!(err, Trap::Host("boom".into()));
}

#[test]
fn test_host_result_type_is_checked() {
    let mut imports = Imports::new();
    imports.define("env", "base", |_| Ok(vec![Val::F64(1.5)]));
    let module = Rc::new(BinaryModule::decode(ADD_MODULE).unwrap());
    let instance = Instance::new(module, &imports).unwrap();

    let err = instance.call("addBase", &[Val::I32(1), Val::I32(1)]).unwrap_err();
    assert_eq!(err, Trap::TypeMismatch);
}

#[test]
fn test_argument_checks() {
    let module = Rc::new(BinaryModule::decode(ADD_MODULE).unwrap());
    let instance = Instance::new(module, &env_imports(0)).unwrap();

    assert_eq!(
        instance.call("add", &[Val::I32(1)]).unwrap_err(),
        Trap::ArityMismatch { expected: 2, actual: 1 }
    );
    assert_eq!(
        instance.call("add", &[Val::I32(1), Val::F64(2.0)]).unwrap_err(),
        Trap::TypeMismatch
    );
    assert_eq!(
        instance.call("sub", &[]).unwrap_err(),
        Trap::UnknownExport("sub".into())
    );
}

#[test]
fn test_loop_and_branches() {
    let module = Rc::new(BinaryModule::decode(LOOP_MODULE).unwrap());
    let instance = Instance::new(module, &Imports::new()).unwrap();

    assert_eq!(instance.call("sum", &[Val::I32(4)]).unwrap(), vec![Val::I32(10)]);
    assert_eq!(instance.call("sum", &[Val::I32(0)]).unwrap(), vec![Val::I32(0)]);
    assert_eq!(instance.call("sum", &[Val::I32(100)]).unwrap(), vec![Val::I32(5050)]);
}

#[test]
fn test_division_traps() {
    let module = Rc::new(BinaryModule::decode(LOOP_MODULE).unwrap());
    let instance = Instance::new(module, &Imports::new()).unwrap();

    assert_eq!(instance.call("div", &[Val::I32(7), Val::I32(2)]).unwrap(), vec![Val::I32(3)]);
    assert_eq!(instance.call("div", &[Val::I32(-7), Val::I32(2)]).unwrap(), vec![Val::I32(-3)]);
    assert_eq!(
        instance.call("div", &[Val::I32(1), Val::I32(0)]).unwrap_err(),
        Trap::DivisionByZero
    );
    assert_eq!(
        instance.call("div", &[Val::I32(i32::MIN), Val::I32(-1)]).unwrap_err(),
        Trap::IntegerOverflow
    );
}

#[test]
fn test_value_conversions() {
    assert_eq!(Val::I32(7).to_f64(), 7.0);
    assert_eq!(Val::from_f64(ValType::I32, 3.9), Val::I32(3));
    assert_eq!(Val::from_f64(ValType::I32, f64::NAN), Val::I32(0));
    assert_eq!(Val::from_f64(ValType::F64, 2.5), Val::F64(2.5));
    assert_eq!(Val::from(true), Val::I32(1));
}
