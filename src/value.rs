//! Dynamically typed values carried by promises.
//!
//! A settled promise holds an opaque [`Value`]. Only [`Object`] and
//! [`Function`] take part in structural "thenable" detection; a [`Promise`]
//! is recognized by its own variant.
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{Error, Promise};

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    List(Arc<Vec<Value>>),
    Object(Object),
    Function(Function),
    Promise(Promise),
    Error(Error),
}

/// Returns the `index`th argument, or `Undefined` when it was not passed.
pub fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Reads a property. Getters run here, so reading may raise.
    ///
    /// Values without properties answer `Ok(None)`.
    pub fn get(&self, key: &str) -> Result<Option<Value>, Value> {
        match self {
            Value::Object(o) => o.get(key),
            Value::Function(f) => f.get(key),
            _ => Ok(None),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(o) => fmt::Debug::fmt(o, f),
            Value::Function(func) => fmt::Debug::fmt(func, f),
            Value::Promise(p) => fmt::Debug::fmt(p, f),
            Value::Error(e) => write!(f, "Error({e})"),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Undefined
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Promise> for Value {
    fn from(p: Promise) -> Self {
        Value::Promise(p)
    }
}

impl From<Error> for Value {
    fn from(e: Error) -> Self {
        Value::Error(e)
    }
}

#[derive(Clone)]
enum Property {
    Data(Value),
    Getter(Function),
}

type Properties = Arc<Mutex<BTreeMap<String, Property>>>;

fn read(props: &Properties, key: &str, this: &Value) -> Result<Option<Value>, Value> {
    let property = props
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(key)
        .cloned();
    match property {
        None => Ok(None),
        Some(Property::Data(value)) => Ok(Some(value)),
        Some(Property::Getter(getter)) => getter.call(this, &[]).map(Some),
    }
}

fn write(props: &Properties, key: &str, property: Property) {
    props
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key.to_owned(), property);
}

/// A shared property bag. Clones alias the same object.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Object, Value};
///
/// let point = Object::new().with("x", 1);
/// assert_eq!(point.get("x"), Ok(Some(Value::from(1))));
/// assert_eq!(point.get("then"), Ok(None));
/// ```
#[derive(Clone, Default)]
pub struct Object {
    props: Properties,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Installs a property whose read runs `getter` with the object as `this`.
    pub fn with_getter(self, key: &str, getter: Function) -> Self {
        write(&self.props, key, Property::Getter(getter));
        self
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        write(&self.props, key, Property::Data(value.into()));
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, Value> {
        read(&self.props, key, &Value::Object(self.clone()))
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.props, &other.props)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let props = self.props.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_set().entries(props.keys()).finish()
    }
}

type NativeFn = dyn Fn(&Value, &[Value]) -> Result<Value, Value> + Send + Sync;

/// A callable value. `Err` from the closure means the call raised.
///
/// Functions can carry properties too, so a function with a callable `then`
/// is a thenable.
#[derive(Clone)]
pub struct Function {
    native: Arc<NativeFn>,
    props: Properties,
}

impl Function {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    {
        Self {
            native: Arc::new(f),
            props: Properties::default(),
        }
    }

    /// A function of its first argument, ignoring `this`.
    pub fn unary<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, Value> + Send + Sync + 'static,
    {
        Self::new(move |_, args| f(arg(args, 0)))
    }

    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        write(&self.props, key, Property::Data(value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, Value> {
        read(&self.props, key, &Value::Function(self.clone()))
    }

    /// Calls the function. A panic inside it is caught and raised as
    /// [`Error::Panicked`].
    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value, Value> {
        catch_unwind(AssertUnwindSafe(|| (self.native)(this, args)))
            .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic.as_ref())).into()))
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.props, &other.props)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Function")
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_getter_runs_with_owner_as_this() {
        let object = Object::new().with("name", "owner").with_getter(
            "then",
            Function::new(|this, _| this.get("name").map(Option::unwrap_or_default)),
        );
        assert_eq!(object.get("then"), Ok(Some(Value::from("owner"))));
    }

    #[test]
    fn test_getter_raise_propagates() {
        let object = Object::new().with_getter("then", Function::new(|_, _| Err(Value::from("boom"))));
        assert_eq!(Value::from(object).get("then"), Err(Value::from("boom")));
    }

    #[test]
    fn test_panicking_function_raises() {
        let f = Function::new(|_, _| panic!("kaboom"));
        assert_eq!(
            f.call(&Value::Undefined, &[]),
            Err(Value::Error(Error::Panicked("kaboom".into())))
        );
    }

    #[test]
    fn test_identity_equality() {
        let a = Object::new();
        assert_eq!(Value::from(a.clone()), Value::from(a));
        assert_ne!(Value::from(Object::new()), Value::from(Object::new()));
        assert_eq!(Value::from(vec![Value::from(1)]), Value::from(vec![Value::from(1)]));
        assert_ne!(Value::Null, Value::Undefined);
    }

    #[test]
    fn test_function_properties() {
        let f = Function::unary(Ok).with("then", 3);
        assert_eq!(f.get("then"), Ok(Some(Value::from(3))));
        assert_eq!(arg(&[], 0), Value::Undefined);
    }
}
