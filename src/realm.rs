//! Static promise operations bound to one scheduler.
use std::fmt;
use std::sync::Arc;

use crate::combinator;
use crate::promise::Promise;
use crate::scheduler::{Scheduler, ThreadScheduler};
use crate::value::{Function, Value};
use crate::Error;

/// Hosts construction and the static factories and combinators.
///
/// Clones share the scheduler and the canonical value cache.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Realm, Value};
/// use futures::executor::block_on;
///
/// let realm = Realm::default();
/// let both = realm.all(vec![Value::from(realm.resolve(1)), Value::from(realm.resolve("two"))]);
/// assert_eq!(block_on(both), Ok(Value::from(vec![Value::from(1), Value::from("two")])));
/// ```
#[derive(Clone)]
pub struct Realm {
    shared: Arc<Shared>,
}

struct Shared {
    scheduler: Arc<dyn Scheduler>,
    canonical: Option<Canonical>,
}

/// Pre-fulfilled promises shared by every `resolve` of these values.
struct Canonical {
    undefined: Promise,
    null: Promise,
    yes: Promise,
    no: Promise,
    zero: Promise,
    empty: Promise,
}

impl Canonical {
    fn new(scheduler: &Arc<dyn Scheduler>) -> Self {
        let fulfilled = |value: Value| Promise::settled(scheduler.clone(), Ok(value));
        Self {
            undefined: fulfilled(Value::Undefined),
            null: fulfilled(Value::Null),
            yes: fulfilled(Value::Bool(true)),
            no: fulfilled(Value::Bool(false)),
            zero: fulfilled(Value::Number(0.0)),
            empty: fulfilled(Value::from("")),
        }
    }

    fn lookup(&self, value: &Value) -> Option<&Promise> {
        match value {
            Value::Undefined => Some(&self.undefined),
            Value::Null => Some(&self.null),
            Value::Bool(true) => Some(&self.yes),
            Value::Bool(false) => Some(&self.no),
            Value::Number(n) if *n == 0.0 && n.is_sign_positive() => Some(&self.zero),
            Value::String(s) if s.is_empty() => Some(&self.empty),
            _ => None,
        }
    }
}

/// Configures a [`Realm`].
pub struct RealmBuilder {
    scheduler: Option<Arc<dyn Scheduler>>,
    canonical_values: bool,
}

impl Default for RealmBuilder {
    fn default() -> Self {
        Self {
            scheduler: None,
            canonical_values: true,
        }
    }
}

impl RealmBuilder {
    pub fn scheduler<S: Scheduler + 'static>(self, scheduler: S) -> Self {
        self.shared_scheduler(Arc::new(scheduler))
    }

    pub fn shared_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Whether undefined, null, booleans, zero and the empty string resolve to
    /// shared cached promises. On by default.
    pub fn canonical_values(mut self, enabled: bool) -> Self {
        self.canonical_values = enabled;
        self
    }

    /// Falls back to a [`ThreadScheduler`] when no scheduler was given.
    pub fn build(self) -> Realm {
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(ThreadScheduler::new()));
        let canonical = self.canonical_values.then(|| Canonical::new(&scheduler));
        Realm {
            shared: Arc::new(Shared {
                scheduler,
                canonical,
            }),
        }
    }
}

impl Default for Realm {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("canonical_values", &self.shared.canonical.is_some())
            .finish_non_exhaustive()
    }
}

impl Realm {
    pub fn builder() -> RealmBuilder {
        RealmBuilder::default()
    }

    pub fn new<S: Scheduler + 'static>(scheduler: S) -> Self {
        Self::builder().scheduler(scheduler).build()
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.shared.scheduler
    }

    /// `new Promise(executor)` for a dynamic executor value.
    ///
    /// The executor is called synchronously with `(resolve, reject)`.
    /// Anything other than a [`Value::Function`] is an
    /// [`Error::InvalidArgument`].
    pub fn construct(&self, executor: &Value) -> Result<Promise, Error> {
        let Value::Function(executor) = executor else {
            return Err(Error::InvalidArgument(format!(
                "executor must be callable, got {executor:?}"
            )));
        };
        let executor = executor.clone();
        Ok(self.promise(move |resolve, reject| {
            executor
                .call(&Value::Undefined, &[resolve.into(), reject.into()])
                .map(drop)
        }))
    }

    /// Builds a promise from a native executor. An `Err` or a panic from the
    /// executor rejects the promise unless it already settled.
    pub fn promise<F>(&self, executor: F) -> Promise
    where
        F: FnOnce(Function, Function) -> Result<(), Value>,
    {
        Promise::with_executor(self.scheduler().clone(), executor)
    }

    /// A pending promise with its resolve and reject capabilities.
    pub fn deferred(&self) -> (Promise, Function, Function) {
        let promise = Promise::pending(self.scheduler().clone());
        let (resolve, reject) = promise.settle_functions();
        (promise, resolve, reject)
    }

    /// Returns promises unchanged, adopts thenables and fulfills with
    /// anything else.
    pub fn resolve(&self, value: impl Into<Value>) -> Promise {
        let value = value.into();
        if let Value::Promise(p) = value {
            return p;
        }
        if let Some(cached) = self.canonical(&value) {
            return cached.clone();
        }
        if matches!(value, Value::Object(_) | Value::Function(_)) {
            match value.get("then") {
                Err(reason) => return self.reject(reason),
                Ok(Some(Value::Function(then))) => {
                    return self.promise(move |resolve, reject| {
                        then.call(&value, &[resolve.into(), reject.into()]).map(drop)
                    });
                }
                Ok(_) => {}
            }
        }
        Promise::settled(self.scheduler().clone(), Ok(value))
    }

    /// A promise rejected with `reason`. Promises and thenables are not
    /// unwrapped.
    pub fn reject(&self, reason: impl Into<Value>) -> Promise {
        Promise::settled(self.scheduler().clone(), Err(reason.into()))
    }

    /// Fulfills with every input's value in input order, or rejects with the
    /// first rejection.
    pub fn all(&self, promises: impl Into<Value>) -> Promise {
        combinator::all(self.scheduler(), promises.into())
    }

    /// Settles like whichever input settles first. An empty input never
    /// settles.
    pub fn race(&self, promises: impl Into<Value>) -> Promise {
        combinator::race(self.scheduler(), promises.into())
    }

    fn canonical(&self, value: &Value) -> Option<&Promise> {
        self.shared.canonical.as_ref()?.lookup(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::PromiseState;
    use crate::scheduler::TaskQueue;
    use crate::value::{arg, Object};

    fn realm() -> (TaskQueue, Realm) {
        let queue = TaskQueue::new();
        (queue.clone(), Realm::new(queue))
    }

    #[test]
    fn test_resolve_returns_same_promise() {
        let (_queue, realm) = realm();
        let (p, _, _) = realm.deferred();
        assert!(realm.resolve(p.clone()).ptr_eq(&p));
    }

    #[test]
    fn test_resolve_caches_canonical_values() {
        let (_queue, realm) = realm();
        assert!(realm.resolve(true).ptr_eq(&realm.resolve(true)));
        assert!(realm.resolve(0).ptr_eq(&realm.resolve(0.0)));
        assert!(realm.resolve("").ptr_eq(&realm.resolve(String::new())));
        assert!(!realm.resolve(-0.0).ptr_eq(&realm.resolve(0)));
        assert!(!realm.resolve(1).ptr_eq(&realm.resolve(1)));
        assert_eq!(realm.resolve(()).outcome(), Some(Ok(Value::Undefined)));
        assert_eq!(realm.resolve(Value::Null).outcome(), Some(Ok(Value::Null)));
    }

    #[test]
    fn test_canonical_cache_can_be_disabled() {
        let queue = TaskQueue::new();
        let realm = Realm::builder().scheduler(queue).canonical_values(false).build();
        assert!(!realm.resolve(true).ptr_eq(&realm.resolve(true)));
        assert_eq!(realm.resolve(true).outcome(), Some(Ok(Value::Bool(true))));
    }

    #[test]
    fn test_resolve_adopts_thenable() {
        let (queue, realm) = realm();
        let thenable = Object::new().with(
            "then",
            Function::new(|_, args| {
                arg(args, 0).as_function().unwrap().call(&Value::Undefined, &[Value::from(9)])
            }),
        );
        let p = realm.resolve(thenable);
        // The executor runs the thenable synchronously.
        assert_eq!(p.outcome(), Some(Ok(Value::from(9))));
        queue.run_until_idle();
        assert_eq!(p.outcome(), Some(Ok(Value::from(9))));
    }

    #[test]
    fn test_resolve_thenable_getter_raise_rejects() {
        let (_queue, realm) = realm();
        let object = Object::new().with_getter("then", Function::new(|_, _| Err(Value::from("no then"))));
        assert_eq!(realm.resolve(object).outcome(), Some(Err(Value::from("no then"))));
    }

    #[test]
    fn test_resolve_non_callable_then_fulfills_with_object() {
        let (_queue, realm) = realm();
        let object = Object::new().with("then", 1);
        assert_eq!(realm.resolve(object.clone()).outcome(), Some(Ok(object.into())));
    }

    #[test]
    fn test_reject_never_unwraps() {
        let (_queue, realm) = realm();
        let inner = realm.resolve(1);
        let rejected = realm.reject(inner.clone());
        assert_eq!(rejected.outcome(), Some(Err(inner.into())));
    }

    #[test]
    fn test_construct_requires_callable_executor() {
        let (_queue, realm) = realm();
        assert!(matches!(
            realm.construct(&Value::from(3)),
            Err(Error::InvalidArgument(_))
        ));
        let p = realm
            .construct(&Function::new(|_, args| {
                arg(args, 1).as_function().unwrap().call(&Value::Undefined, &[Value::from("r")])
            })
            .into())
            .unwrap();
        assert_eq!(p.outcome(), Some(Err(Value::from("r"))));
    }

    #[test]
    fn test_executor_that_never_settles_stays_pending() {
        let (queue, realm) = realm();
        let p = realm.promise(|_, _| Ok(()));
        queue.run_until_idle();
        assert_eq!(p.state(), PromiseState::Pending);
    }
}
