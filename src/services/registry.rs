// Object-service registry
//
// Index of which services are bound to which data objects, under which key.
// Services register when an object is bound to one of their keys and are
// removed when the key is unbound, when the service is destroyed and when
// the last handle to the service is dropped. Entries hold weak references,
// so the registry never keeps a service alive. A service remembers every
// registry it was entered in, so destroy and drop clean all of them.

use super::service::{ServiceCore, ServiceHandle};
use crate::data::DataObject;
use crate::models::{ObjectId, ServiceId};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

/// Thread-safe many-to-many map between objects and services
///
/// Cloning shares the same table. Applications normally create one
/// registry at their composition point and hand it to every service;
/// [`default_registry`] exists for services built without one.
#[derive(Clone, Default)]
pub struct ObjectServiceRegistry {
    table: Arc<RwLock<RegistryTable>>,
}

#[derive(Default)]
struct RegistryTable {
    by_object: HashMap<ObjectId, IndexMap<ServiceId, Registration>>,
    by_service: HashMap<ServiceId, IndexMap<String, ObjectId>>,
}

/// Non-owning handle kept by services to leave a registry on destroy
#[derive(Clone)]
pub(crate) struct WeakRegistry {
    table: Weak<RwLock<RegistryTable>>,
}

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<ObjectServiceRegistry> {
        self.table.upgrade().map(|table| ObjectServiceRegistry { table })
    }

    pub(crate) fn points_to(&self, registry: &ObjectServiceRegistry) -> bool {
        std::ptr::eq(self.table.as_ptr(), Arc::as_ptr(&registry.table))
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.table.strong_count() > 0
    }
}

struct Registration {
    service: Weak<ServiceCore>,
    keys: Vec<String>,
}

impl RegistryTable {
    fn insert(&mut self, object: ObjectId, key: &str, service: &Arc<ServiceCore>) {
        let service_id = service.id();

        // One object per (service, key)
        let previous = self
            .by_service
            .get(&service_id)
            .and_then(|keys| keys.get(key))
            .copied();
        if let Some(previous) = previous {
            if previous == object {
                return;
            }
            self.remove_key(service_id, key);
        }

        let registration = self
            .by_object
            .entry(object)
            .or_default()
            .entry(service_id)
            .or_insert_with(|| Registration {
                service: Arc::downgrade(service),
                keys: Vec::new(),
            });
        registration.keys.push(key.to_string());

        self.by_service
            .entry(service_id)
            .or_default()
            .insert(key.to_string(), object);
    }

    fn remove_key(&mut self, service: ServiceId, key: &str) -> bool {
        let Some(keys) = self.by_service.get_mut(&service) else {
            return false;
        };
        let Some(object) = keys.swap_remove(key) else {
            return false;
        };
        if keys.is_empty() {
            self.by_service.remove(&service);
        }

        if let Some(services) = self.by_object.get_mut(&object) {
            if let Some(registration) = services.get_mut(&service) {
                registration.keys.retain(|k| k != key);
                if registration.keys.is_empty() {
                    services.swap_remove(&service);
                }
            }
            if services.is_empty() {
                self.by_object.remove(&object);
            }
        }
        true
    }

    fn remove_service(&mut self, service: ServiceId) -> usize {
        let Some(keys) = self.by_service.remove(&service) else {
            return 0;
        };

        for object in keys.values() {
            if let Some(services) = self.by_object.get_mut(object) {
                services.swap_remove(&service);
                if services.is_empty() {
                    self.by_object.remove(object);
                }
            }
        }
        keys.len()
    }
}

impl ObjectServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` as observer of `object` under `key`
    pub fn register(&self, object: &DataObject, key: &str, service: &ServiceHandle) {
        self.register_core(object.id(), key, service.core());
    }

    pub(crate) fn register_core(&self, object: ObjectId, key: &str, service: &Arc<ServiceCore>) {
        self.table.write().insert(object, key, service);
        service.note_registry(self);
        tracing::trace!("Registered service '{}' on {} as '{}'", service.uid(), object, key);
    }

    /// Whether both handles share the same table
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.table, &other.table)
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            table: Arc::downgrade(&self.table),
        }
    }

    /// Remove every registration of `service`
    pub fn unregister(&self, service: &ServiceHandle) -> usize {
        self.unregister_service(service.id())
    }

    /// Remove every registration of the service with id `service`
    pub fn unregister_service(&self, service: ServiceId) -> usize {
        self.table.write().remove_service(service)
    }

    /// Remove the registration of `service` under `key`
    pub fn unregister_key(&self, service: ServiceId, key: &str) -> bool {
        self.table.write().remove_key(service, key)
    }

    /// Services currently registered on `object`
    pub fn services(&self, object: &DataObject) -> Vec<ServiceHandle> {
        self.services_of(object.id())
    }

    /// Snapshot of the live services registered on the object `object`
    pub fn services_of(&self, object: ObjectId) -> Vec<ServiceHandle> {
        let table = self.table.read();
        table
            .by_object
            .get(&object)
            .map(|services| {
                services
                    .values()
                    .filter_map(|registration| registration.service.upgrade())
                    .map(ServiceHandle::from_core)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Services registered on `object` under `key`
    pub fn services_with_key(&self, object: &DataObject, key: &str) -> Vec<ServiceHandle> {
        let table = self.table.read();
        table
            .by_object
            .get(&object.id())
            .map(|services| {
                services
                    .values()
                    .filter(|registration| registration.keys.iter().any(|k| k == key))
                    .filter_map(|registration| registration.service.upgrade())
                    .map(ServiceHandle::from_core)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_registered(&self, object: ObjectId, service: ServiceId) -> bool {
        self.table
            .read()
            .by_object
            .get(&object)
            .is_some_and(|services| services.contains_key(&service))
    }

    /// Keys of `service` and the objects they are registered with
    pub fn keys_of(&self, service: ServiceId) -> Vec<(String, ObjectId)> {
        self.table
            .read()
            .by_service
            .get(&service)
            .map(|keys| keys.iter().map(|(key, object)| (key.clone(), *object)).collect())
            .unwrap_or_default()
    }

    /// Number of objects with at least one registered service
    pub fn object_count(&self) -> usize {
        self.table.read().by_object.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().by_object.is_empty()
    }
}

impl std::fmt::Debug for ObjectServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read();
        f.debug_struct("ObjectServiceRegistry")
            .field("objects", &table.by_object.len())
            .field("services", &table.by_service.len())
            .finish()
    }
}

/// Process-wide registry for services built without an explicit one
pub fn default_registry() -> &'static ObjectServiceRegistry {
    static DEFAULT: OnceLock<ObjectServiceRegistry> = OnceLock::new();
    DEFAULT.get_or_init(ObjectServiceRegistry::new)
}
