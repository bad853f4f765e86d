//! `all` and `race`, built on [`Promise::then`].
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::promise::Promise;
use crate::scheduler::Scheduler;
use crate::value::{Function, Value};
use crate::Error;

fn not_a_list(combinator: &str) -> Value {
    Error::TypeArgument(format!("{combinator} expects a list of promises")).into()
}

fn not_a_promise(combinator: &str, index: usize, item: &Value) -> Value {
    Error::TypeArgument(format!("{combinator} element {index} is not a promise: {item:?}")).into()
}

/// Per-call state of one `all`.
struct Gather {
    slots: Vec<Option<Value>>,
    remaining: usize,
    decided: bool,
}

pub(crate) fn all(scheduler: &Arc<dyn Scheduler>, promises: Value) -> Promise {
    let Value::List(items) = promises else {
        return Promise::settled(scheduler.clone(), Err(not_a_list("all")));
    };
    if items.is_empty() {
        return Promise::settled(scheduler.clone(), Ok(Value::from(Vec::<Value>::new())));
    }
    let combined = Promise::pending(scheduler.clone());
    let gather = Arc::new(Mutex::new(Gather {
        slots: vec![None; items.len()],
        remaining: items.len(),
        decided: false,
    }));
    for (index, item) in items.iter().enumerate() {
        let Value::Promise(item) = item else {
            decide(&gather, || combined.reject(not_a_promise("all", index, item)));
            break;
        };
        let on_fulfilled = {
            let gather = gather.clone();
            let combined = combined.clone();
            Function::unary(move |value| {
                let finished = {
                    let mut gather = gather.lock().unwrap_or_else(PoisonError::into_inner);
                    if gather.decided {
                        None
                    } else {
                        gather.slots[index] = Some(value);
                        gather.remaining -= 1;
                        gather.decided = gather.remaining == 0;
                        gather.decided.then(|| std::mem::take(&mut gather.slots))
                    }
                };
                if let Some(slots) = finished {
                    let values: Vec<Value> = slots.into_iter().map(Option::unwrap_or_default).collect();
                    combined.fulfill(values.into());
                }
                Ok(Value::Undefined)
            })
        };
        let on_rejected = {
            let gather = gather.clone();
            let combined = combined.clone();
            Function::unary(move |reason| {
                decide(&gather, || combined.reject(reason));
                Ok(Value::Undefined)
            })
        };
        item.then(on_fulfilled, on_rejected);
    }
    combined
}

/// Runs `settle` if nothing has decided the `all` yet.
fn decide(gather: &Mutex<Gather>, settle: impl FnOnce() -> bool) {
    let first = {
        let mut gather = gather.lock().unwrap_or_else(PoisonError::into_inner);
        !std::mem::replace(&mut gather.decided, true)
    };
    if first {
        settle();
    }
}

pub(crate) fn race(scheduler: &Arc<dyn Scheduler>, promises: Value) -> Promise {
    let Value::List(items) = promises else {
        return Promise::settled(scheduler.clone(), Err(not_a_list("race")));
    };
    // No input, no winner.
    let combined = Promise::pending(scheduler.clone());
    let decided = Arc::new(AtomicBool::new(false));
    for (index, item) in items.iter().enumerate() {
        let Value::Promise(item) = item else {
            if !decided.swap(true, Ordering::AcqRel) {
                combined.reject(not_a_promise("race", index, item));
            }
            break;
        };
        let on_fulfilled = {
            let decided = decided.clone();
            let combined = combined.clone();
            Function::unary(move |value| {
                if !decided.swap(true, Ordering::AcqRel) {
                    combined.fulfill(value);
                }
                Ok(Value::Undefined)
            })
        };
        let on_rejected = {
            let decided = decided.clone();
            let combined = combined.clone();
            Function::unary(move |reason| {
                if !decided.swap(true, Ordering::AcqRel) {
                    combined.reject(reason);
                }
                Ok(Value::Undefined)
            })
        };
        item.then(on_fulfilled, on_rejected);
    }
    combined
}
