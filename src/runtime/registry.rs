//! Name → handler registries for orchestrations and side effects.
//!
//! Both kinds share one generic `Registry<H>`; a registry is built once per
//! worker and is immutable afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use super::{FnOrchestration, FnSideEffect, OrchestrationHandler, SideEffectContext, SideEffectHandler};
use crate::codec::{Codec, Json};
use crate::{OrchestrationContext, OrchestrationError, SideEffectError};

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone: H: ?Sized blocks the derive.
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type SideEffectRegistry = Registry<dyn SideEffectHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type SideEffectRegistryBuilder = RegistryBuilder<dyn SideEffectHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "reprise::runtime::registry",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        found
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        for e in &self.errors {
            tracing::warn!(target: "reprise::runtime::registry", error = %e, "registration ignored");
        }
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// # Errors
    ///
    /// Returns every registration error joined with `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn insert(&mut self, name: String, handler: Arc<H>, kind: &str) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {kind} registration: {name}"));
            return;
        }
        self.map.insert(name, handler);
    }

    fn merge_registry(mut self, other: Registry<H>, kind: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            self.insert(name.clone(), handler.clone(), kind);
        }
        self
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, OrchestrationError>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    /// Registers an orchestration whose input and output are JSON-encoded.
    /// A malformed input fails the execution.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, OrchestrationError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&input_s).map_err(OrchestrationError::Failed)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out).map_err(OrchestrationError::Failed)
            }
        };
        self.register(name, wrapper)
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }
}

impl SideEffectRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(SideEffectContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, SideEffectError>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnSideEffect(f)), "side effect");
        self
    }

    /// JSON-encoded input and output; a malformed input is a terminal error.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(SideEffectContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, SideEffectError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: SideEffectContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&input_s).map_err(SideEffectError::terminal)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out).map_err(SideEffectError::terminal)
            }
        };
        self.register(name, wrapper)
    }

    pub fn merge(self, other: SideEffectRegistry) -> Self {
        self.merge_registry(other, "side effect")
    }
}
