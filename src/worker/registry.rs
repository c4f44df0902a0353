// Named worker table
//
// Keeps the set of "active workers" an application composes its services
// onto, addressed by name. Services configured with a worker name resolve
// it here.

use super::Worker;
use crate::error::{CoreError, CoreResult};
use dashmap::DashMap;
use std::sync::Arc;

/// Name of the worker returned by [`WorkerRegistry::default_worker`]
pub const DEFAULT_WORKER: &str = "default";

/// Concurrent table of named workers
///
/// Cloning the registry shares the same table.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<DashMap<String, Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the worker registered under `name`, spawning it if absent
    ///
    /// A registered worker that has been stopped is replaced by a fresh one.
    pub fn get_or_create(&self, name: &str) -> CoreResult<Worker> {
        if let Some(worker) = self.get(name) {
            return Ok(worker);
        }

        let entry = self.workers.entry(name.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_running() {
                    Ok(occupied.get().clone())
                } else {
                    let worker = Worker::new(name)?;
                    occupied.insert(worker.clone());
                    Ok(worker)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let worker = Worker::new(name)?;
                vacant.insert(worker.clone());
                tracing::debug!("Registered worker '{}'", name);
                Ok(worker)
            }
        }
    }

    /// Return the running worker registered under `name`
    pub fn get(&self, name: &str) -> Option<Worker> {
        self.workers
            .get(name)
            .map(|worker| worker.value().clone())
            .filter(Worker::is_running)
    }

    /// Like [`get`](Self::get) but reports an unknown name as an error
    pub fn require(&self, name: &str) -> CoreResult<Worker> {
        self.get(name)
            .ok_or_else(|| CoreError::WorkerStopped(name.to_string()))
    }

    /// Register an externally created worker under its own name
    ///
    /// Returns the worker previously registered under that name, if any.
    pub fn insert(&self, worker: Worker) -> Option<Worker> {
        self.workers.insert(worker.name().to_string(), worker)
    }

    /// The shared `default` worker, created on first use
    pub fn default_worker(&self) -> CoreResult<Worker> {
        self.get_or_create(DEFAULT_WORKER)
    }

    /// Names of all registered workers, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop and forget every registered worker
    ///
    /// Workers are removed from the table before being stopped so that no
    /// map shard lock is held while joining threads.
    pub fn stop_all(&self) {
        let names = self.names();
        for name in names {
            if let Some((_, worker)) = self.workers.remove(&name) {
                worker.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_reuses_worker() {
        let registry = WorkerRegistry::new();
        let first = registry.get_or_create("render").unwrap();
        let second = registry.get_or_create("render").unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        registry.stop_all();
    }

    #[test]
    fn test_default_worker() {
        let registry = WorkerRegistry::new();
        let worker = registry.default_worker().unwrap();
        assert_eq!(worker.name(), DEFAULT_WORKER);
        assert_eq!(registry.names(), vec![DEFAULT_WORKER.to_string()]);
        registry.stop_all();
    }

    #[test]
    fn test_stopped_worker_is_replaced() {
        let registry = WorkerRegistry::new();
        let first = registry.get_or_create("io").unwrap();
        first.stop();

        assert!(registry.get("io").is_none());
        let second = registry.get_or_create("io").unwrap();
        assert_ne!(first, second);
        assert!(second.is_running());
        registry.stop_all();
    }

    #[test]
    fn test_require_unknown_worker() {
        let registry = WorkerRegistry::new();
        assert!(matches!(
            registry.require("missing"),
            Err(CoreError::WorkerStopped(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_stop_all_clears_table() {
        let registry = WorkerRegistry::new();
        let a = registry.get_or_create("a").unwrap();
        let b = registry.get_or_create("b").unwrap();

        registry.stop_all();

        assert!(registry.is_empty());
        assert!(!a.is_running());
        assert!(!b.is_running());
    }

    #[test]
    fn test_insert_external_worker() {
        let registry = WorkerRegistry::new();
        let worker = Worker::new("external").unwrap();
        assert!(registry.insert(worker.clone()).is_none());
        assert_eq!(registry.get("external"), Some(worker));
        registry.stop_all();
    }
}
