//! Hub method table.
//!
//! Names are matched case-insensitively. Registering two methods whose names
//! differ only in case is an error at build time.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use hubwire_core::errors::{HubError, Result};
use serde_json::Value;

use crate::hub::{Hub, InvocationContext};
use crate::stream::StreamSource;

/// Handler for a method that returns a single result.
#[async_trait]
pub trait MethodHandler<H: Hub>: Send + Sync {
    /// Run the method.
    async fn call(&self, hub: Arc<H>, ctx: InvocationContext) -> Result<Value>;
}

/// Handler for a method that returns a stream of items.
#[async_trait]
pub trait StreamHandler<H: Hub>: Send + Sync {
    /// Start the stream.
    async fn call(&self, hub: Arc<H>, ctx: InvocationContext) -> Result<StreamSource>;
}

/// Adapts an async closure into a [`MethodHandler`].
pub struct UnaryFn<F>(pub F);

#[async_trait]
impl<H, F, Fut> MethodHandler<H> for UnaryFn<F>
where
    H: Hub,
    F: Fn(Arc<H>, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, hub: Arc<H>, ctx: InvocationContext) -> Result<Value> {
        (self.0)(hub, ctx).await
    }
}

/// Adapts an async closure into a [`StreamHandler`].
pub struct StreamFn<F>(pub F);

#[async_trait]
impl<H, F, Fut> StreamHandler<H> for StreamFn<F>
where
    H: Hub,
    F: Fn(Arc<H>, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StreamSource>> + Send + 'static,
{
    async fn call(&self, hub: Arc<H>, ctx: InvocationContext) -> Result<StreamSource> {
        (self.0)(hub, ctx).await
    }
}

/// Whether a method answers once or streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// One Completion with a result or error.
    Unary,
    /// StreamItems followed by a Completion.
    Streaming,
}

/// The callable behind a descriptor.
pub enum MethodCallable<H: Hub> {
    /// Single-result handler.
    Unary(Arc<dyn MethodHandler<H>>),
    /// Streaming handler.
    Streaming(Arc<dyn StreamHandler<H>>),
}

impl<H: Hub> Clone for MethodCallable<H> {
    fn clone(&self) -> Self {
        match self {
            Self::Unary(handler) => Self::Unary(Arc::clone(handler)),
            Self::Streaming(handler) => Self::Streaming(Arc::clone(handler)),
        }
    }
}

/// One registered hub method.
pub struct HubMethodDescriptor<H: Hub> {
    name: String,
    callable: MethodCallable<H>,
    parameter_types: Option<Vec<String>>,
    policies: Vec<String>,
}

impl<H: Hub> HubMethodDescriptor<H> {
    /// A single-result method.
    pub fn unary(name: impl Into<String>, handler: impl MethodHandler<H> + 'static) -> Self {
        Self::with_callable(name.into(), MethodCallable::Unary(Arc::new(handler)))
    }

    /// A streaming method.
    pub fn streaming(name: impl Into<String>, handler: impl StreamHandler<H> + 'static) -> Self {
        Self::with_callable(name.into(), MethodCallable::Streaming(Arc::new(handler)))
    }

    fn with_callable(name: String, callable: MethodCallable<H>) -> Self {
        Self {
            name,
            callable,
            parameter_types: None,
            policies: Vec::new(),
        }
    }

    /// Declare the parameter list; calls with a different argument count
    /// are rejected before the handler runs.
    #[must_use]
    pub fn params<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Require an authorization policy. Repeatable; every policy must pass.
    #[must_use]
    pub fn authorize(mut self, policy: impl Into<String>) -> Self {
        self.policies.push(policy.into());
        self
    }

    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unary or streaming.
    pub fn kind(&self) -> MethodKind {
        match self.callable {
            MethodCallable::Unary(_) => MethodKind::Unary,
            MethodCallable::Streaming(_) => MethodKind::Streaming,
        }
    }

    /// Whether the method streams.
    pub fn is_streaming(&self) -> bool {
        self.kind() == MethodKind::Streaming
    }

    /// The handler.
    pub fn callable(&self) -> &MethodCallable<H> {
        &self.callable
    }

    /// Declared parameter types; empty when none were declared.
    pub fn parameter_types(&self) -> &[String] {
        self.parameter_types.as_deref().unwrap_or_default()
    }

    /// Authorization policies.
    pub fn policies(&self) -> &[String] {
        &self.policies
    }

    /// Check the argument count against the declared parameters.
    pub fn check_arity(&self, arguments: &[Value]) -> Result<()> {
        match &self.parameter_types {
            Some(types) if types.len() != arguments.len() => Err(HubError::Binding(format!(
                "Invocation provides {} argument(s) but target expects {}.",
                arguments.len(),
                types.len()
            ))),
            _ => Ok(()),
        }
    }
}

impl<H: Hub> fmt::Debug for HubMethodDescriptor<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubMethodDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("parameter_types", &self.parameter_types)
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

/// Collects descriptors before building a [`MethodTable`].
pub struct MethodTableBuilder<H: Hub> {
    methods: Vec<HubMethodDescriptor<H>>,
}

impl<H: Hub> MethodTableBuilder<H> {
    /// Add a descriptor.
    #[must_use]
    pub fn add(mut self, descriptor: HubMethodDescriptor<H>) -> Self {
        self.methods.push(descriptor);
        self
    }

    /// Add a single-result method from an async closure.
    #[must_use]
    pub fn method<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<H>, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.add(HubMethodDescriptor::unary(name, UnaryFn(handler)))
    }

    /// Add a streaming method from an async closure.
    #[must_use]
    pub fn stream<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<H>, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StreamSource>> + Send + 'static,
    {
        self.add(HubMethodDescriptor::streaming(name, StreamFn(handler)))
    }

    /// Build the table; fails on case-insensitive duplicate names.
    pub fn build(self) -> Result<MethodTable<H>> {
        let mut methods = HashMap::with_capacity(self.methods.len());
        for descriptor in self.methods {
            let key = descriptor.name().to_lowercase();
            if methods.contains_key(&key) {
                return Err(HubError::DuplicateMethod(descriptor.name().to_owned()));
            }
            let _ = methods.insert(key, Arc::new(descriptor));
        }
        Ok(MethodTable { methods })
    }
}

/// Immutable name → descriptor map.
pub struct MethodTable<H: Hub> {
    methods: HashMap<String, Arc<HubMethodDescriptor<H>>>,
}

impl<H: Hub> MethodTable<H> {
    /// Start a builder.
    pub fn builder() -> MethodTableBuilder<H> {
        MethodTableBuilder {
            methods: Vec::new(),
        }
    }

    /// Case-insensitive lookup.
    pub fn lookup(&self, name: &str) -> Option<Arc<HubMethodDescriptor<H>>> {
        self.methods.get(&name.to_lowercase()).cloned()
    }

    /// Registered names (sorted).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.values().map(|d| d.name().to_owned()).collect();
        names.sort();
        names
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<H: Hub> fmt::Debug for MethodTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable").field("methods", &self.names()).finish()
    }
}
