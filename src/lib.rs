//! A standalone Promises/A+ deferred value.
//!
//! A [`Promise`] settles exactly once, to a fulfillment value or a rejection
//! reason, and notifies its observers on a later turn of a [`Scheduler`].
//! Static operations (`resolve`, `reject`, `all`, `race`) live on a [`Realm`].
//!
//! # Examples
//!
//! ```
//! use promise_aplus::{Function, Realm, Value};
//! use futures::executor::block_on;
//!
//! let realm = Realm::default();
//! let doubled = realm.resolve(Value::from(21)).then(
//!     Function::unary(|v| Ok(Value::from(v.as_number().unwrap_or(0.0) * 2.0))),
//!     Value::Undefined,
//! );
//! assert_eq!(block_on(doubled), Ok(Value::from(42)));
//! ```
mod combinator;
pub mod promise;
pub mod realm;
pub mod scheduler;
pub mod value;

pub use promise::{Outcome, Promise, PromiseState};
pub use realm::{Realm, RealmBuilder};
pub use scheduler::{Job, Scheduler, TaskQueue, ThreadScheduler};
pub use value::{arg, Function, Object, Value};

/// Errors raised by the promise machinery itself.
///
/// Call-site misuse is returned synchronously; everything else travels as a
/// rejection reason wrapped in [`Value::Error`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("type argument error: {0}")]
    TypeArgument(String),
    #[error("thenable object must expose a callable `then`")]
    MalformedThenable,
    #[error("a chain callback cannot return the promise it was derived from")]
    CyclicChain,
    #[error("value pass-through must run within its promise lineage")]
    Context,
    #[error("callback panicked: {0}")]
    Panicked(String),
}
