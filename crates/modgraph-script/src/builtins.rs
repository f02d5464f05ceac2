//! Built-in globals and property access on primitive and container values.

use std::rc::Rc;

use crate::exception::Exception;
use crate::interpreter::Scope;
use crate::value::{number_to_string, Binding, Value};

/// Install `Error`, `TypeError`, `RangeError`, `ReferenceError`, `String`,
/// `Number`, `NaN` and `Infinity` into a root scope
pub(crate) fn install_globals(scope: &Scope) {
    for name in ["Error", "TypeError", "RangeError", "ReferenceError"] {
        let ctor = Value::native_constructor(name, move |args| {
            let message = match args.first() {
                None | Some(Value::Undefined) => String::new(),
                Some(value) => value.to_display_string(),
            };
            Ok(Value::error(name, &message))
        });
        scope.declare(name, Binding::with_value(ctor), false);
    }

    let string = Value::native_constructor("String", |args| {
        Ok(Value::from(
            args.first()
                .map(Value::to_display_string)
                .unwrap_or_default(),
        ))
    });
    scope.declare("String", Binding::with_value(string), false);

    let number = Value::native_constructor("Number", |args| {
        Ok(Value::Number(args.first().map(Value::to_number).unwrap_or(0.0)))
    });
    scope.declare("Number", Binding::with_value(number), false);

    scope.declare("NaN", Binding::with_value(Value::Number(f64::NAN)), false);
    scope.declare("Infinity", Binding::with_value(Value::Number(f64::INFINITY)), false);
}

/// Convert an index expression result to a property key
pub(crate) fn property_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string(),
        Value::Number(n) => number_to_string(*n),
        other => other.to_display_string(),
    }
}

fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    key.parse().ok()
}

/// `value.key`
pub fn get_property(value: &Value, key: &str) -> Result<Value, Exception> {
    match value {
        Value::Undefined | Value::Null => Err(Exception::type_error(&format!(
            "Cannot read properties of {} (reading '{}')",
            value.to_display_string(),
            key
        ))),
        Value::String(s) => Ok(string_property(s, key)),
        Value::Array(items) => Ok(array_property(items, key)),
        Value::Object(object) => Ok(object.borrow().get(key).cloned().unwrap_or_default()),
        Value::Namespace(ns) => match ns.binding(key) {
            Some(binding) => binding.get().ok_or_else(|| {
                Exception::reference_error(&format!("Cannot access '{}' before initialization", key))
            }),
            None => Ok(Value::Undefined),
        },
        Value::Function(func) if key == "name" => Ok(Value::string(func.name())),
        Value::Number(n) if key == "toString" => {
            let n = *n;
            Ok(Value::native("toString", move |_| Ok(Value::from(number_to_string(n)))))
        }
        _ => Ok(Value::Undefined),
    }
}

/// `value.key = new_value`
pub fn set_property(value: &Value, key: &str, new_value: Value) -> Result<(), Exception> {
    match value {
        Value::Object(object) => {
            object.borrow_mut().set(key.to_string(), new_value);
            Ok(())
        }
        Value::Array(items) => match array_index(key) {
            Some(index) => {
                let mut items = items.borrow_mut();
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                items[index] = new_value;
                Ok(())
            }
            None => Err(Exception::type_error(&format!(
                "Cannot assign to property '{}' of array",
                key
            ))),
        },
        Value::Namespace(_) => Err(Exception::type_error(&format!(
            "Cannot assign to read only property '{}' of module namespace",
            key
        ))),
        other => Err(Exception::type_error(&format!(
            "Cannot create property '{}' on {}",
            key,
            other.type_of()
        ))),
    }
}

fn string_property(s: &Rc<str>, key: &str) -> Value {
    if let Some(index) = array_index(key) {
        return s
            .chars()
            .nth(index)
            .map(|c| Value::from(c.to_string()))
            .unwrap_or_default();
    }
    let s = s.clone();
    match key {
        "length" => Value::Number(s.chars().count() as f64),
        "toUpperCase" => Value::native("toUpperCase", move |_| Ok(Value::from(s.to_uppercase()))),
        "toLowerCase" => Value::native("toLowerCase", move |_| Ok(Value::from(s.to_lowercase()))),
        "includes" => Value::native("includes", move |args| {
            let needle = args.first().map(Value::to_display_string).unwrap_or_default();
            Ok(Value::Bool(s.contains(needle.as_str())))
        }),
        "indexOf" => Value::native("indexOf", move |args| {
            let needle = args.first().map(Value::to_display_string).unwrap_or_default();
            Ok(Value::Number(match s.find(needle.as_str()) {
                Some(byte) => s[..byte].chars().count() as f64,
                None => -1.0,
            }))
        }),
        _ => Value::Undefined,
    }
}

fn array_property(items: &Rc<std::cell::RefCell<Vec<Value>>>, key: &str) -> Value {
    if let Some(index) = array_index(key) {
        return items.borrow().get(index).cloned().unwrap_or_default();
    }
    let items = items.clone();
    match key {
        "length" => Value::Number(items.borrow().len() as f64),
        "join" => Value::native("join", move |args| {
            let separator = match args.first() {
                None | Some(Value::Undefined) => ",".to_string(),
                Some(sep) => sep.to_display_string(),
            };
            let joined = items
                .borrow()
                .iter()
                .map(|item| match item {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_display_string(),
                })
                .collect::<Vec<_>>()
                .join(&separator);
            Ok(Value::from(joined))
        }),
        "push" => Value::native("push", move |args| {
            let mut items = items.borrow_mut();
            items.extend(args.iter().cloned());
            Ok(Value::Number(items.len() as f64))
        }),
        "map" => Value::native("map", move |args| {
            let callback = args.first().cloned().unwrap_or_default();
            // Snapshot so the callback may mutate the array
            let snapshot: Vec<Value> = items.borrow().clone();
            let mut mapped = Vec::with_capacity(snapshot.len());
            for (i, item) in snapshot.into_iter().enumerate() {
                mapped.push(callback.call(&[item, Value::Number(i as f64)])?);
            }
            Ok(Value::array(mapped))
        }),
        "indexOf" => Value::native("indexOf", move |args| {
            let needle = args.first().cloned().unwrap_or_default();
            let position = items.borrow().iter().position(|item| item.strict_equals(&needle));
            Ok(Value::Number(position.map(|p| p as f64).unwrap_or(-1.0)))
        }),
        "includes" => Value::native("includes", move |args| {
            let needle = args.first().cloned().unwrap_or_default();
            let found = items
                .borrow()
                .iter()
                .any(|item| item == &needle);
            Ok(Value::Bool(found))
        }),
        _ => Value::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_join_and_length() {
        let array = Value::array(vec!["file:///x".into(), "file:///y".into()]);
        let join = get_property(&array, "join").unwrap();
        assert_eq!(join.call(&[" ".into()]).unwrap(), Value::from("file:///x file:///y"));
        assert_eq!(get_property(&array, "length").unwrap(), Value::from(2.0));
    }

    #[test]
    fn test_array_push_is_bound_to_receiver() {
        let array = Value::array(vec![]);
        let push = get_property(&array, "push").unwrap();
        push.call(&[1.0.into(), 2.0.into()]).unwrap();
        assert_eq!(array.to_display_string(), "1,2");
    }

    #[test]
    fn test_string_methods() {
        let s = Value::from("Hello");
        assert_eq!(get_property(&s, "length").unwrap(), Value::from(5.0));
        let upper = get_property(&s, "toUpperCase").unwrap();
        assert_eq!(upper.call(&[]).unwrap(), Value::from("HELLO"));
        assert_eq!(get_property(&s, "1").unwrap(), Value::from("e"));
    }

    #[test]
    fn test_property_of_undefined_is_type_error() {
        let err = get_property(&Value::Undefined, "x").unwrap_err();
        assert_eq!(err.message(), "TypeError: Cannot read properties of undefined (reading 'x')");
    }

    #[test]
    fn test_object_set_and_get() {
        let object = Value::object(Vec::<(String, Value)>::new());
        set_property(&object, "k", Value::from(1.0)).unwrap();
        assert_eq!(get_property(&object, "k").unwrap(), Value::from(1.0));
        assert_eq!(get_property(&object, "missing").unwrap(), Value::Undefined);
    }
}
