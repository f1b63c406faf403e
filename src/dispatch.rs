//! Server-side method registry.
//!
//! Dispatch never fails past its boundary: a missing function, a handler error and a handler
//! panic are all turned into a [`RemoteError`] which travels back inside an ordinary response.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::codec::{RemoteError, RpcResult};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("function '{0}' is already registered")]
    DuplicateName(String),
}

/// Failure reported by a handler. The message is forwarded to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Arguments of a single call, as seen by a handler.
pub struct Args<'a> {
    positional: &'a [Value],
    named: &'a Map<String, Value>,
}

impl<'a> Args<'a> {
    pub fn new(positional: &'a [Value], named: &'a Map<String, Value>) -> Self {
        Self { positional, named }
    }

    pub fn positional(&self) -> &'a [Value] {
        self.positional
    }

    pub fn named_args(&self) -> &'a Map<String, Value> {
        self.named
    }

    /// Converts positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.positional.get(index).ok_or_else(|| {
            HandlerError(format!("missing positional argument {}", index))
        })?;

        T::deserialize(value)
            .map_err(|err| HandlerError(format!("positional argument {}: {}", index, err)))
    }

    /// Converts named argument `name`, if present.
    pub fn named<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, HandlerError> {
        match self.named.get(name) {
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|err| HandlerError(format!("named argument '{}': {}", name, err))),
            None => Ok(None),
        }
    }

    /// Fails unless exactly `count` positional arguments were supplied.
    pub fn expect_arity(&self, count: usize) -> Result<(), HandlerError> {
        if self.positional.len() != count {
            return Err(HandlerError(format!(
                "takes {} positional arguments but {} were given",
                count,
                self.positional.len()
            )));
        }

        Ok(())
    }
}

pub trait Handler: Send + Sync {
    fn call(&self, args: &Args) -> Result<Value, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Args) -> Result<Value, HandlerError> + Send + Sync,
{
    fn call(&self, args: &Args) -> Result<Value, HandlerError> {
        self(args)
    }
}

/// Maps function names to handlers. Populated before serving, read-only afterwards.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Binds `name` to a function or closure. Fails if the name is already bound.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> Result<(), RegisterError>
    where
        F: Fn(&Args) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register_handler(name, handler)
    }

    /// Binds `name` to `handler`. Fails if the name is already bound.
    pub fn register_handler<H>(
        &mut self,
        name: impl Into<String>,
        handler: H,
    ) -> Result<(), RegisterError>
    where
        H: Handler + 'static,
    {
        let name = name.into();

        if self.handlers.contains_key(&name) {
            return Err(RegisterError::DuplicateName(name));
        }

        self.handlers.insert(name, Box::new(handler));

        Ok(())
    }

    /// Binds `name` to `handler`, returning true if an existing binding was overwritten.
    pub fn replace<F>(&mut self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Args) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler)).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Executes `name` with the given arguments.
    pub fn dispatch(&self, name: &str, positional: &[Value], named: &Map<String, Value>) -> RpcResult {
        let handler = match self.handlers.get(name) {
            Some(handler) => handler,
            None => return Err(RemoteError::FunctionNotFound(name.to_string())),
        };

        let args = Args::new(positional, named);

        match panic::catch_unwind(AssertUnwindSafe(|| handler.call(&args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(RemoteError::HandlerError(err.0)),
            Err(payload) => {
                let message = if let Some(message) = payload.downcast_ref::<&str>() {
                    message.to_string()
                } else if let Some(message) = payload.downcast_ref::<String>() {
                    message.clone()
                } else {
                    "handler panicked".to_string()
                };

                log::error!("[MethodRegistry] handler '{}' panicked: {}", name, message);

                Err(RemoteError::HandlerError(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add(args: &Args) -> Result<Value, HandlerError> {
        args.expect_arity(2)?;
        let a: i64 = args.arg(0)?;
        let b: i64 = args.arg(1)?;
        Ok(json!(a + b))
    }

    fn registry() -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        registry.register("add", add).unwrap();
        registry
    }

    #[test]
    fn dispatch_registered() {
        let result = registry().dispatch("add", &[json!(5), json!(10)], &Map::new());

        assert_eq!(result, Ok(json!(15)));
    }

    #[test]
    fn duplicate_name() {
        let mut registry = registry();

        assert_eq!(
            registry.register("add", add),
            Err(RegisterError::DuplicateName("add".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn replace_overwrites() {
        let mut registry = registry();

        let replaced = registry.replace("add", |_: &Args| Ok(json!("replaced")));

        assert!(replaced);
        assert_eq!(
            registry.dispatch("add", &[], &Map::new()),
            Ok(json!("replaced"))
        );
    }

    #[test]
    fn unknown_function() {
        let result = registry().dispatch("divide", &[json!(10), json!(2)], &Map::new());

        assert_eq!(result, Err(RemoteError::FunctionNotFound("divide".into())));
    }

    #[test]
    fn wrong_arity() {
        let result = registry().dispatch("add", &[json!(1)], &Map::new());

        match result {
            Err(RemoteError::HandlerError(message)) => {
                assert!(message.contains("2 positional arguments"), "{}", message)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn wrong_argument_type() {
        let result = registry().dispatch("add", &[json!("five"), json!(10)], &Map::new());

        assert!(matches!(result, Err(RemoteError::HandlerError(_))));
    }

    #[test]
    fn panic_is_contained() {
        let mut registry = MethodRegistry::new();
        registry
            .register("explode", |_: &Args| -> Result<Value, HandlerError> { panic!("kaboom") })
            .unwrap();

        let result = registry.dispatch("explode", &[], &Map::new());

        assert_eq!(result, Err(RemoteError::HandlerError("kaboom".into())));
    }

    #[test]
    fn named_arguments() {
        let mut registry = MethodRegistry::new();
        registry
            .register("scale", |args: &Args| {
                let value: f64 = args.arg(0)?;
                let factor = args.named::<f64>("factor")?.unwrap_or(1.0);
                Ok(json!(value * factor))
            })
            .unwrap();

        let mut named = Map::new();
        assert_eq!(registry.dispatch("scale", &[json!(3.0)], &named), Ok(json!(3.0)));

        named.insert("factor".into(), json!(2.5));
        assert_eq!(registry.dispatch("scale", &[json!(3.0)], &named), Ok(json!(7.5)));

        named.insert("factor".into(), json!("big"));
        assert!(registry.dispatch("scale", &[json!(3.0)], &named).is_err());
    }
}
