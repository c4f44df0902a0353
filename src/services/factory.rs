// Service factories
//
// Services are instantiated by type name, the way a configuration file
// refers to them. A FactoryRegistry is filled once at startup from a static
// list of registrations; nothing is discovered at runtime.

use super::registry::ObjectServiceRegistry;
use super::service::ServiceHandle;
use crate::error::{CoreError, CoreResult};
use indexmap::IndexMap;
use std::sync::Arc;

/// Creates services of one type
#[cfg_attr(test, mockall::automock)]
pub trait ServiceFactory: Send + Sync {
    /// Name configurations use to request this type
    fn type_name(&self) -> String;

    /// Build a service with the given uid, registering its bindings in `registry`
    fn create(&self, uid: &str, registry: &ObjectServiceRegistry) -> anyhow::Result<ServiceHandle>;
}

type CreateFn = dyn Fn(&str, &ObjectServiceRegistry) -> anyhow::Result<ServiceHandle> + Send + Sync;

/// Factory backed by a plain function or closure
pub struct FnFactory {
    type_name: String,
    create: Box<CreateFn>,
}

impl FnFactory {
    pub fn new<F>(type_name: impl Into<String>, create: F) -> Self
    where
        F: Fn(&str, &ObjectServiceRegistry) -> anyhow::Result<ServiceHandle>
            + Send
            + Sync
            + 'static,
    {
        Self {
            type_name: type_name.into(),
            create: Box::new(create),
        }
    }
}

impl ServiceFactory for FnFactory {
    fn type_name(&self) -> String {
        self.type_name.clone()
    }

    fn create(&self, uid: &str, registry: &ObjectServiceRegistry) -> anyhow::Result<ServiceHandle> {
        (self.create)(uid, registry)
    }
}

impl std::fmt::Debug for FnFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFactory")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Type name -> factory table
#[derive(Default, Clone)]
pub struct FactoryRegistry {
    factories: IndexMap<String, Arc<dyn ServiceFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under its own type name
    pub fn register(&mut self, factory: impl ServiceFactory + 'static) -> CoreResult<()> {
        let type_name = factory.type_name();
        if self.factories.contains_key(&type_name) {
            return Err(CoreError::DuplicateId(type_name));
        }

        tracing::debug!("Registered service factory '{}'", type_name);
        self.factories.insert(type_name, Arc::new(factory));
        Ok(())
    }

    /// Register a closure as the factory for `type_name`
    pub fn register_fn<F>(&mut self, type_name: &str, create: F) -> CoreResult<()>
    where
        F: Fn(&str, &ObjectServiceRegistry) -> anyhow::Result<ServiceHandle>
            + Send
            + Sync
            + 'static,
    {
        self.register(FnFactory::new(type_name, create))
    }

    /// Instantiate a service of type `type_name`
    pub fn create(
        &self,
        type_name: &str,
        uid: &str,
        registry: &ObjectServiceRegistry,
    ) -> CoreResult<ServiceHandle> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| CoreError::UnknownServiceType(type_name.to_string()))?;

        let service = factory
            .create(uid, registry)
            .map_err(|err| CoreError::hook(uid, "creating", err))?;

        if service.uid() != uid {
            tracing::warn!(
                "Factory '{}' was asked for '{}' but built '{}'",
                type_name,
                uid,
                service.uid()
            );
        }
        tracing::debug!("Created service '{}' of type '{}'", uid, type_name);
        Ok(service)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names in registration order
    pub fn type_names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
