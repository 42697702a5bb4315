//! Parameters - lazily resolved values a step exposes to later steps

use crate::core::link::StepLink;
use crate::core::step::StepError;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Future returned by a parameter accessor
pub type ParameterFuture = BoxFuture<'static, Result<String, StepError>>;

/// Deferred lookup of a parameter value
pub type ParameterFn = Arc<dyn Fn() -> ParameterFuture + Send + Sync>;

/// Errors raised by the parameter registry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("parameter {0} is not provided by any step")]
    Unknown(String),

    #[error("parameter {0} has not been published yet")]
    Unavailable(String),

    #[error("parameter {name} is already provided by step {producer}")]
    AlreadyDeclared { name: String, producer: String },

    #[error("parameter {0} was already published")]
    AlreadyPublished(String),

    #[error("step {step} publishes parameter {name} it never declared")]
    NotDeclaredBy { name: String, step: String },
}

/// A single named output
#[derive(Clone)]
pub struct Parameter {
    accessor: ParameterFn,
    placeholder: String,
}

impl Parameter {
    /// Create a parameter resolved by `accessor`; `placeholder` stands in for it in dry runs
    pub fn new<F, Fut>(placeholder: impl Into<String>, accessor: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, StepError>> + Send + 'static,
    {
        Self {
            accessor: Arc::new(move || accessor().boxed()),
            placeholder: placeholder.into(),
        }
    }

    /// A parameter whose value is known up front
    pub fn fixed(value: impl Into<String>) -> Self {
        let value = value.into();
        let resolved = value.clone();
        Self::new(value, move || {
            let resolved = resolved.clone();
            async move { Ok(resolved) }
        })
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Run the lookup
    pub async fn resolve(&self) -> Result<String, StepError> {
        (self.accessor)().await
    }

    fn accessor(&self, dry_run: bool) -> ParameterFn {
        if dry_run {
            let placeholder = self.placeholder.clone();
            Arc::new(move || {
                let placeholder = placeholder.clone();
                async move { Ok(placeholder) }.boxed()
            })
        } else {
            self.accessor.clone()
        }
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("placeholder", &self.placeholder)
            .finish_non_exhaustive()
    }
}

/// Parameter name to deferred accessor
#[derive(Debug, Clone, Default)]
pub struct ParameterMap(BTreeMap<String, Parameter>);

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, parameter: Parameter) {
        self.0.insert(name.into(), parameter);
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a step provides: its parameters and the link that must exist before they resolve
#[derive(Debug, Clone)]
pub struct Provides {
    pub parameters: ParameterMap,
    pub link: StepLink,
}

struct Slot {
    producer: String,
    link: StepLink,
    accessor: OnceLock<ParameterFn>,
    value: OnceCell<String>,
}

/// Run-scoped parameter registry
///
/// Every slot is declared before execution starts and written at most once, after which it
/// is visible to every reader. Resolved values are cached per slot.
#[derive(Default)]
pub struct ParameterRegistry {
    slots: HashMap<String, Slot>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `name`, produced by `producer` once `link` exists
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        producer: impl Into<String>,
        link: StepLink,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if let Some(existing) = self.slots.get(&name) {
            return Err(RegistryError::AlreadyDeclared {
                name,
                producer: existing.producer.clone(),
            });
        }
        self.slots.insert(
            name,
            Slot {
                producer: producer.into(),
                link,
                accessor: OnceLock::new(),
                value: OnceCell::new(),
            },
        );
        Ok(())
    }

    /// Publish a step's parameters; in dry runs the placeholders are published instead
    ///
    /// Either every parameter in `parameters` is published or none is.
    pub fn publish(&self, step: &str, parameters: &ParameterMap, dry_run: bool) -> Result<(), RegistryError> {
        let mut slots = Vec::with_capacity(parameters.len());
        for (name, parameter) in parameters.iter() {
            let slot = self
                .slots
                .get(name)
                .filter(|slot| slot.producer == step)
                .ok_or_else(|| RegistryError::NotDeclaredBy {
                    name: name.to_string(),
                    step: step.to_string(),
                })?;
            if slot.accessor.get().is_some() {
                return Err(RegistryError::AlreadyPublished(name.to_string()));
            }
            slots.push((name, slot, parameter));
        }

        for (name, slot, parameter) in slots {
            slot.accessor
                .set(parameter.accessor(dry_run))
                .map_err(|_| RegistryError::AlreadyPublished(name.to_string()))?;
        }
        Ok(())
    }

    /// Resolve a published parameter, running its accessor on first use
    pub async fn get(&self, name: &str) -> Result<String, StepError> {
        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        let accessor = slot
            .accessor
            .get()
            .ok_or_else(|| RegistryError::Unavailable(name.to_string()))?;
        let value = slot.value.get_or_try_init(|| accessor()).await?;
        Ok(value.clone())
    }

    pub fn is_published(&self, name: &str) -> bool {
        self.slots
            .get(name)
            .is_some_and(|slot| slot.accessor.get().is_some())
    }

    /// Producing step of a declared parameter
    pub fn producer(&self, name: &str) -> Option<&str> {
        self.slots.get(name).map(|slot| slot.producer.as_str())
    }

    /// Link that must exist before a declared parameter resolves
    pub fn link(&self, name: &str) -> Option<&StepLink> {
        self.slots.get(name).map(|slot| &slot.link)
    }

    /// Declared parameter names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.slots.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ParameterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterRegistry")
            .field("parameters", &self.names())
            .finish()
    }
}
