//! Endpoint registry.
//!
//! An endpoint is a named remote operation with a fixed argument shape and a
//! fixed result shape. Shapes are captured statically from type parameters at
//! registration time; nothing is inferred from runtime values. The registry
//! is built exactly once by a [`Service`] initializer and is read-only
//! afterwards, which makes unsynchronized concurrent lookups safe.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;

/// Statically captured identity of an argument or result type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    id: TypeId,
    name: &'static str,
}

impl Shape {
    /// Capture the shape of `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The type name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Immutable description of one registered endpoint.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    name: String,
    args: Shape,
    result: Shape,
}

impl EndpointDescriptor {
    /// The endpoint name (unique within a registry).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registered argument shape.
    pub fn args(&self) -> Shape {
        self.args
    }

    /// The registered result shape.
    pub fn result(&self) -> Shape {
        self.result
    }

    /// Verify that the given shapes match what was registered.
    pub(crate) fn check_shapes(&self, args: Shape, result: Shape) -> Result<()> {
        if self.args != args {
            return Err(Error::ShapeMismatch {
                name: self.name.clone(),
                role: "argument",
                expected: self.args.name,
                actual: args.name,
            });
        }
        if self.result != result {
            return Err(Error::ShapeMismatch {
                name: self.name.clone(),
                role: "result",
                expected: self.result.name,
                actual: result.name,
            });
        }
        Ok(())
    }
}

/// Mapping from endpoint name to [`EndpointDescriptor`].
#[derive(Debug, Default)]
pub struct Registry {
    endpoints: HashMap<String, EndpointDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint with argument type `A` and result type `R`.
    ///
    /// Registering the same name twice is rejected rather than silently
    /// overwriting the earlier descriptor.
    pub fn register<A, R>(&mut self, name: &str) -> Result<()>
    where
        A: Serialize + DeserializeOwned + 'static,
        R: Serialize + DeserializeOwned + 'static,
    {
        if self.endpoints.contains_key(name) {
            return Err(Error::DuplicateEndpoint(name.to_string()));
        }
        self.endpoints.insert(
            name.to_string(),
            EndpointDescriptor {
                name: name.to_string(),
                args: Shape::of::<A>(),
                result: Shape::of::<R>(),
            },
        );
        Ok(())
    }

    /// Look up an endpoint by name.
    pub fn lookup(&self, name: &str) -> Option<&EndpointDescriptor> {
        self.endpoints.get(name)
    }

    /// Iterate over the registered endpoint names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// A service definition: registers every endpoint the service exposes.
///
/// `init` is invoked exactly once per registry, by [`crate::Client::new`] on
/// the client side and by [`crate::ServerBuilder::new`] on the server side.
/// After it returns, the registry is never mutated again.
pub trait Service {
    fn init(&self, registry: &mut Registry) -> Result<()>;
}
