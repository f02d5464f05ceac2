//! Dynamic imports from module code
//!
//! `import(specifier)` hands back a pending import object at once and
//! queues the request. The loader serves the queue after the import that
//! evaluated the calling module completes, so a module never observes a
//! dynamically imported graph during its own evaluation. Callbacks
//! registered with `then(onFulfilled, onRejected)` run when the request
//! settles, or immediately if it already has.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use modgraph_script::{Exception, Namespace, Value};
use tracing::{debug, warn};

use crate::error::LoadError;

enum Settlement {
    Pending(Vec<(Value, Value)>),
    Fulfilled(Value),
    Rejected(Value),
}

/// Outcome slot shared by a queued request and its pending import object
struct PendingImport {
    state: RefCell<Settlement>,
}

impl PendingImport {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(Settlement::Pending(Vec::new())),
        })
    }

    fn then(&self, on_fulfilled: Value, on_rejected: Value) -> Result<(), Exception> {
        let settled = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                Settlement::Pending(callbacks) => {
                    callbacks.push((on_fulfilled, on_rejected));
                    return Ok(());
                }
                Settlement::Fulfilled(value) => (on_fulfilled, value.clone()),
                Settlement::Rejected(reason) => (on_rejected, reason.clone()),
            }
        };
        invoke(&settled.0, settled.1)
    }

    fn settle(&self, outcome: Result<Value, Value>) {
        let callbacks = {
            let mut state = self.state.borrow_mut();
            let settled = match &outcome {
                Ok(value) => Settlement::Fulfilled(value.clone()),
                Err(reason) => Settlement::Rejected(reason.clone()),
            };
            match std::mem::replace(&mut *state, settled) {
                Settlement::Pending(callbacks) => callbacks,
                _ => return,
            }
        };

        if let Err(reason) = &outcome {
            if !callbacks.iter().any(|(_, on_rejected)| is_callable(on_rejected)) {
                warn!(reason = %reason.to_display_string(), "unhandled dynamic import failure");
            }
        }
        for (on_fulfilled, on_rejected) in callbacks {
            let (callback, argument) = match &outcome {
                Ok(value) => (on_fulfilled, value.clone()),
                Err(reason) => (on_rejected, reason.clone()),
            };
            if let Err(exception) = invoke(&callback, argument) {
                warn!(error = %exception, "dynamic import callback threw");
            }
        }
    }

    /// Script-visible handle
    fn to_value(self: &Rc<Self>) -> Value {
        let pending = self.clone();
        let then = Value::native("then", move |args| {
            let on_fulfilled = args.first().cloned().unwrap_or_default();
            let on_rejected = args.get(1).cloned().unwrap_or_default();
            pending.then(on_fulfilled, on_rejected)?;
            Ok(Value::Undefined)
        });
        Value::object([("then", then)])
    }
}

fn is_callable(value: &Value) -> bool {
    matches!(value, Value::Function(_))
}

/// Non-function callbacks are skipped
fn invoke(callback: &Value, argument: Value) -> Result<(), Exception> {
    if is_callable(callback) {
        callback.call(&[argument])?;
    }
    Ok(())
}

/// Queued `import(specifier)` from the module at `referrer`
pub(crate) struct DynamicImport {
    pub specifier: String,
    pub referrer: String,
    pending: Rc<PendingImport>,
}

impl DynamicImport {
    /// Deliver the import's outcome to the script
    pub fn settle(&self, result: &Result<Namespace, LoadError>) {
        let outcome = match result {
            Ok(namespace) => Ok(Value::Namespace(namespace.clone())),
            Err(error) => Err(rejection_reason(error)),
        };
        self.pending.settle(outcome);
    }
}

/// Thrown value for script failures, an `Error` object otherwise
fn rejection_reason(error: &LoadError) -> Value {
    match error.exception() {
        Some(exception) => exception.value().clone(),
        None => Value::error("Error", &error.to_string()),
    }
}

/// Requests queued by module code, served by the loader
#[derive(Default)]
pub(crate) struct DynamicImports {
    queue: Rc<RefCell<VecDeque<DynamicImport>>>,
}

impl DynamicImports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler to install on records created by the loader
    pub fn hook(&self) -> impl Fn(&str, &str) -> Result<Value, Exception> + 'static {
        let queue = self.queue.clone();
        move |specifier: &str, referrer: &str| {
            debug!(specifier, referrer, "queued dynamic import");
            let pending = PendingImport::new();
            let value = pending.to_value();
            queue.borrow_mut().push_back(DynamicImport {
                specifier: specifier.to_string(),
                referrer: referrer.to_string(),
                pending,
            });
            Ok(value)
        }
    }

    pub fn next(&self) -> Option<DynamicImport> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recorder(calls: &Rc<RefCell<Vec<String>>>, tag: &'static str) -> Value {
        let calls = calls.clone();
        Value::native(tag, move |args| {
            let argument = args.first().map(Value::to_display_string).unwrap_or_default();
            calls.borrow_mut().push(format!("{}:{}", tag, argument));
            Ok(Value::Undefined)
        })
    }

    fn then(handle: &Value, on_fulfilled: Value, on_rejected: Value) {
        let then = modgraph_script::get_property(handle, "then").unwrap();
        then.call(&[on_fulfilled, on_rejected]).unwrap();
    }

    #[test]
    fn test_hook_queues_requests_in_order() {
        let imports = DynamicImports::new();
        let hook = imports.hook();
        hook("./a.js", "file:///main.js").unwrap();
        hook("./b.js", "file:///main.js").unwrap();
        assert_eq!(imports.len(), 2);

        let first = imports.next().unwrap();
        assert_eq!(first.specifier, "./a.js");
        assert_eq!(first.referrer, "file:///main.js");
        assert_eq!(imports.next().unwrap().specifier, "./b.js");
        assert!(imports.next().is_none());
    }

    #[test]
    fn test_callbacks_run_on_settlement() {
        let imports = DynamicImports::new();
        let handle = imports.hook()("./a.js", "file:///main.js").unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));

        then(&handle, recorder(&calls, "ok"), recorder(&calls, "failed"));
        assert!(calls.borrow().is_empty());

        let request = imports.next().unwrap();
        request.settle(&Err(LoadError::from(crate::fetch::FetchError::NotFound {
            url: "file:///a.js".into(),
        })));
        assert_eq!(
            *calls.borrow(),
            vec!["failed:Error: Module not found: file:///a.js".to_string()]
        );

        // Registered after settlement: runs at once
        then(&handle, Value::Undefined, recorder(&calls, "late"));
        assert_eq!(calls.borrow().len(), 2);
    }

    #[test]
    fn test_settles_once() {
        let pending = PendingImport::new();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let callback = Value::native("count", move |_| {
            counter.set(counter.get() + 1);
            Ok(Value::Undefined)
        });
        pending.then(callback, Value::Undefined).unwrap();

        pending.settle(Ok(Value::from(1.0)));
        pending.settle(Ok(Value::from(2.0)));
        assert_eq!(count.get(), 1);
        assert!(matches!(&*pending.state.borrow(), Settlement::Fulfilled(v) if *v == Value::from(1.0)));
    }
}
