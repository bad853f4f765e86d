//! The promise state machine and its resolution procedure.
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use tracing::{debug, trace};

use crate::scheduler::Scheduler;
use crate::value::{panic_message, Function, Value};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// `Ok` is a fulfillment value, `Err` a rejection reason.
pub type Outcome = Result<Value, Value>;

enum State {
    /// Observers wait here until settlement moves them out.
    Pending(Vec<Reaction>),
    Fulfilled(Value),
    Rejected(Value),
}

impl State {
    fn tag(&self) -> PromiseState {
        match self {
            State::Pending(_) => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }
}

struct Inner {
    state: State,
    wakers: Vec<Waker>,
}

/// Unlinks pending chains iteratively. Each reaction's child would otherwise
/// drop its own pending reactions recursively, one stack frame per link.
impl Drop for Inner {
    fn drop(&mut self) {
        let State::Pending(reactions) = &mut self.state else {
            return;
        };
        let mut worklist = std::mem::take(reactions);
        while let Some(mut reaction) = worklist.pop() {
            if let Some(child) = Arc::get_mut(&mut reaction.child.inner) {
                let child = child.get_mut().unwrap_or_else(PoisonError::into_inner);
                if let State::Pending(next) = &mut child.state {
                    worklist.append(next);
                }
            }
        }
    }
}

/// A value that settles exactly once, to fulfilled or rejected.
///
/// Clones share the same state. Observers registered with [`Promise::then`]
/// always run on a later turn of the promise's scheduler, in registration
/// order.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Function, Realm, Value};
/// use futures::executor::block_on;
/// use std::thread;
///
/// let realm = Realm::default();
/// let (promise, resolve, _reject) = realm.deferred();
/// let task = thread::spawn(move || resolve.call(&Value::Undefined, &[Value::from("🍓")]));
/// let greeting = promise.then(
///     Function::unary(|v| Ok(Value::from(format!("got {}", v.as_str().unwrap_or_default())))),
///     Value::Undefined,
/// );
/// assert_eq!(block_on(greeting), Ok(Value::from("got 🍓")));
/// task.join().expect("The task thread has panicked").unwrap();
/// ```
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Mutex<Inner>>,
    scheduler: Arc<dyn Scheduler>,
}

enum Handler {
    Callable(Function),
    PassThrough,
    Finally(Function),
    /// Settles the child with the outcome as is. Used to adopt a promise.
    Adopt,
}

impl Handler {
    fn from_value(value: Value) -> Self {
        match value {
            Value::Function(f) => Handler::Callable(f),
            _ => Handler::PassThrough,
        }
    }
}

struct Reaction {
    child: Promise,
    on_fulfilled: Handler,
    on_rejected: Handler,
}

impl Reaction {
    /// Runs the handler matching `outcome` and folds its result into the child.
    fn run(self, origin: &Promise, outcome: Outcome) {
        let handler = match outcome {
            Ok(_) => &self.on_fulfilled,
            Err(_) => &self.on_rejected,
        };
        let chained = match handler {
            Handler::Adopt => {
                match outcome {
                    Ok(value) => self.child.fulfill(value),
                    Err(reason) => self.child.reject(reason),
                };
                return;
            }
            Handler::Callable(f) => {
                let (Ok(input) | Err(input)) = &outcome;
                f.call(&Value::Undefined, &[input.clone()])
            }
            // Pass-through forwards the origin's own settled outcome.
            Handler::PassThrough => origin
                .outcome()
                .unwrap_or_else(|| Err(Error::Context.into())),
            Handler::Finally(f) => f
                .call(&Value::Undefined, &[])
                .and_then(|gate| after_finally(&self.child, gate, outcome)),
        };
        match chained {
            Ok(value) => resolve_with(&self.child, value, Some(origin)),
            Err(reason) => {
                self.child.reject(reason);
            }
        }
    }
}

/// Restores `outcome` once `gate` has settled, unless `gate` rejects.
///
/// Only promises and values with a callable `then` are waited on. Anything
/// else lets `outcome` through unchanged.
fn after_finally(child: &Promise, gate: Value, outcome: Outcome) -> Outcome {
    let waiting = Promise::pending(child.scheduler.clone());
    match gate {
        Value::Promise(_) => resolve_with(&waiting, gate, None),
        Value::Object(_) | Value::Function(_) => match gate.get("then")? {
            Some(Value::Function(then)) => schedule_adoption(&waiting, gate, then),
            _ => return outcome,
        },
        _ => return outcome,
    }
    let restore = Function::new(move |_, _| outcome.clone());
    Ok(waiting.then(restore, Value::Undefined).into())
}

/// Folds `value` into `target`: adopts promises, unwraps thenables and
/// fulfills with anything else.
///
/// `origin` is the promise whose handler produced `value`, if any.
pub(crate) fn resolve_with(target: &Promise, value: Value, origin: Option<&Promise>) {
    match value {
        Value::Promise(p) if p.ptr_eq(target) || origin.is_some_and(|o| o.ptr_eq(&p)) => {
            target.reject(Error::CyclicChain.into());
        }
        Value::Promise(p) => {
            p.subscribe(Reaction {
                child: target.clone(),
                on_fulfilled: Handler::Adopt,
                on_rejected: Handler::Adopt,
            });
        }
        Value::Object(_) | Value::Function(_) => match value.get("then") {
            Err(reason) => {
                target.reject(reason);
            }
            Ok(Some(Value::Function(then))) => schedule_adoption(target, value, then),
            Ok(Some(_)) => {
                target.reject(Error::MalformedThenable.into());
            }
            Ok(None) => {
                target.fulfill(value);
            }
        },
        other => {
            target.fulfill(other);
        }
    }
}

fn schedule_adoption(target: &Promise, thenable: Value, then: Function) {
    trace!("scheduling thenable adoption");
    let scheduler = target.scheduler.clone();
    let target = target.clone();
    scheduler.schedule(Box::new(move || adopt_thenable(&target, &thenable, &then)));
}

/// Calls a thenable's `then` with one-shot resolving functions for `target`.
fn adopt_thenable(target: &Promise, thenable: &Value, then: &Function) {
    let decided = Arc::new(AtomicBool::new(false));
    let resolve = {
        let target = target.clone();
        let decided = decided.clone();
        Function::unary(move |value| {
            if !decided.swap(true, Ordering::AcqRel) {
                resolve_with(&target, value, None);
            }
            Ok(Value::Undefined)
        })
    };
    let reject = {
        let target = target.clone();
        let decided = decided.clone();
        Function::unary(move |reason| {
            if !decided.swap(true, Ordering::AcqRel) {
                target.reject(reason);
            }
            Ok(Value::Undefined)
        })
    };
    if let Err(reason) = then.call(thenable, &[resolve.into(), reject.into()]) {
        if !decided.swap(true, Ordering::AcqRel) {
            target.reject(reason);
        }
    }
}

impl Promise {
    pub(crate) fn pending(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Pending(Vec::new()),
                wakers: Vec::new(),
            })),
            scheduler,
        }
    }

    pub(crate) fn settled(scheduler: Arc<dyn Scheduler>, outcome: Outcome) -> Self {
        let state = match outcome {
            Ok(value) => State::Fulfilled(value),
            Err(reason) => State::Rejected(reason),
        };
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state,
                wakers: Vec::new(),
            })),
            scheduler,
        }
    }

    /// Runs `executor` synchronously with the settle capabilities. A raise or
    /// panic rejects the promise unless the executor already settled it.
    pub(crate) fn with_executor<F>(scheduler: Arc<dyn Scheduler>, executor: F) -> Self
    where
        F: FnOnce(Function, Function) -> Result<(), Value>,
    {
        let promise = Self::pending(scheduler);
        let (fulfill, reject) = promise.settle_functions();
        let result = catch_unwind(AssertUnwindSafe(|| executor(fulfill, reject)))
            .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic.as_ref())).into()));
        if let Err(reason) = result {
            if promise.state() == PromiseState::Pending {
                promise.reject(reason);
            }
        }
        promise
    }

    /// The two capabilities handed to executors. They settle directly,
    /// without unwrapping.
    pub(crate) fn settle_functions(&self) -> (Function, Function) {
        let fulfill = {
            let promise = self.clone();
            Function::unary(move |value| {
                promise.fulfill(value);
                Ok(Value::Undefined)
            })
        };
        let reject = {
            let promise = self.clone();
            Function::unary(move |reason| {
                promise.reject(reason);
                Ok(Value::Undefined)
            })
        };
        (fulfill, reject)
    }

    pub(crate) fn fulfill(&self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    pub(crate) fn reject(&self, reason: Value) -> bool {
        self.settle(Err(reason))
    }

    /// Moves the promise out of `Pending`. Returns `false` and changes nothing
    /// when it already settled.
    fn settle(&self, outcome: Outcome) -> bool {
        let next = match &outcome {
            Ok(value) => State::Fulfilled(value.clone()),
            Err(reason) => State::Rejected(reason.clone()),
        };
        let (reactions, wakers) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match std::mem::replace(&mut inner.state, next) {
                State::Pending(reactions) => (reactions, std::mem::take(&mut inner.wakers)),
                previous => {
                    debug!(state = ?previous.tag(), "ignored settlement of a settled promise");
                    inner.state = previous;
                    return false;
                }
            }
        };
        trace!(
            fulfilled = outcome.is_ok(),
            observers = reactions.len(),
            "promise settled"
        );
        for reaction in reactions {
            self.schedule_reaction(reaction, outcome.clone());
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    fn schedule_reaction(&self, reaction: Reaction, outcome: Outcome) {
        let origin = self.clone();
        self.scheduler
            .schedule(Box::new(move || reaction.run(&origin, outcome)));
    }

    /// Registers continuations and returns the promise they settle.
    ///
    /// A handler that is not a [`Value::Function`] passes the outcome through
    /// unchanged.
    pub fn then(&self, on_fulfilled: impl Into<Value>, on_rejected: impl Into<Value>) -> Promise {
        self.react(
            Handler::from_value(on_fulfilled.into()),
            Handler::from_value(on_rejected.into()),
        )
    }

    pub fn catch(&self, on_rejected: impl Into<Value>) -> Promise {
        self.then(Value::Undefined, on_rejected)
    }

    /// Runs `on_finally` with no arguments on either outcome, then settles
    /// like this promise unless `on_finally` raises or returns a rejection.
    pub fn finally(&self, on_finally: impl Into<Value>) -> Promise {
        match on_finally.into() {
            Value::Function(f) => self.react(Handler::Finally(f.clone()), Handler::Finally(f)),
            _ => self.react(Handler::PassThrough, Handler::PassThrough),
        }
    }

    fn react(&self, on_fulfilled: Handler, on_rejected: Handler) -> Promise {
        let child = Promise::pending(self.scheduler.clone());
        self.subscribe(Reaction {
            child: child.clone(),
            on_fulfilled,
            on_rejected,
        });
        child
    }

    /// Queues `reaction` until settlement, or schedules it now if settled.
    fn subscribe(&self, reaction: Reaction) {
        let outcome = {
            let mut inner = self.lock();
            match &mut inner.state {
                State::Pending(reactions) => {
                    reactions.push(reaction);
                    return;
                }
                State::Fulfilled(value) => Ok(value.clone()),
                State::Rejected(reason) => Err(reason.clone()),
            }
        };
        self.schedule_reaction(reaction, outcome);
    }

    pub fn state(&self) -> PromiseState {
        self.lock().state.tag()
    }

    /// The settled outcome, or `None` while pending.
    pub fn outcome(&self) -> Option<Outcome> {
        match &self.lock().state {
            State::Pending(_) => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish()
    }
}

/// Awaiting a promise yields its outcome. It does not register an observer.
impl Future for Promise {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match &inner.state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending(_) => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
