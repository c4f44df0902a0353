use super::connection::{ConnectionSource, ConnectionTarget, LinkState};
use crate::models::{ConnectionId, SlotId};
use crate::worker::{TaskHandle, Worker};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

/// A slot's record of one incoming connection
pub(crate) struct SlotLink {
    pub(crate) state: Arc<LinkState>,
    pub(crate) source: Weak<dyn ConnectionSource>,
}

/// Typed reaction that signals with the same argument type can connect to
///
/// A slot may be bound to a [`Worker`]; asynchronous deliveries are then
/// posted to that worker instead of running on the emitting thread.
/// Multi-argument reactions take a tuple.
///
/// Dropping the last handle of a slot disconnects every connection that
/// targets it.
pub struct Slot<A> {
    pub(crate) inner: Arc<SlotInner<A>>,
}

pub(crate) struct SlotInner<A> {
    id: SlotId,
    name: String,
    func: Box<dyn Fn(A) + Send + Sync>,
    worker: RwLock<Option<Worker>>,
    links: Mutex<Vec<SlotLink>>,
}

impl<A> Clone for Slot<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Clone + Send + 'static> Slot<A> {
    /// Create a slot running `func` on whatever thread delivers to it
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SlotInner {
                id: SlotId::next(),
                name: name.into(),
                func: Box::new(func),
                worker: RwLock::new(None),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Builder-style worker binding
    pub fn with_worker(self, worker: Worker) -> Self {
        self.set_worker(Some(worker));
        self
    }

    pub fn id(&self) -> SlotId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bind the slot to a worker, or unbind it with `None`
    pub fn set_worker(&self, worker: Option<Worker>) {
        *self.inner.worker.write() = worker;
    }

    pub fn worker(&self) -> Option<Worker> {
        self.inner.worker()
    }

    /// Invoke the reaction inline on the calling thread
    pub fn run(&self, args: A) {
        self.inner.invoke(args);
    }

    /// Invoke the reaction on the bound worker, or inline without one
    pub fn async_run(&self, args: A) -> TaskHandle<()> {
        match self.worker() {
            Some(worker) => {
                let inner = Arc::clone(&self.inner);
                worker.post(move || inner.invoke(args))
            }
            None => {
                self.inner.invoke(args);
                TaskHandle::ready(())
            }
        }
    }

    /// Number of live connections targeting this slot
    pub fn connection_count(&self) -> usize {
        self.inner.links.lock().len()
    }
}

impl<A> SlotInner<A> {
    pub(crate) fn id(&self) -> SlotId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn worker(&self) -> Option<Worker> {
        self.worker.read().clone()
    }

    pub(crate) fn invoke(&self, args: A) {
        (self.func)(args);
    }

    pub(crate) fn attach(&self, link: SlotLink) {
        self.links.lock().push(link);
    }
}

impl<A> ConnectionTarget for SlotInner<A> {
    fn forget(&self, id: ConnectionId) {
        self.links.lock().retain(|link| link.state.id() != id);
    }
}

impl<A> Drop for SlotInner<A> {
    fn drop(&mut self) {
        let links = std::mem::take(self.links.get_mut());
        for link in links {
            if link.state.mark_disconnected() {
                if let Some(source) = link.source.upgrade() {
                    source.detach(link.state.id());
                }
            }
        }
    }
}

impl<A> std::fmt::Debug for Slot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("signature", &std::any::type_name::<A>())
            .finish()
    }
}
