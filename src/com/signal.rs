use super::connection::{Connection, ConnectionSource, ConnectionTarget, LinkState};
use super::slot::{Slot, SlotInner, SlotLink};
use crate::error::{CoreError, CoreResult};
use crate::models::{ConnectionId, SignalId, SlotId};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// How [`Signal::notify`] delivers to connected slots
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Every slot runs on the emitting thread before `notify` returns
    Sync,
    /// Worker-bound slots are posted to their worker; unbound slots run inline
    #[default]
    Async,
}

/// One entry of a signal's connection list
struct Link<A> {
    state: Arc<LinkState>,
    slot_id: SlotId,
    slot: Weak<SlotInner<A>>,
}

/// Typed, multi-subscriber notification channel
///
/// Connections are notified in connection order. Emission iterates over a
/// snapshot of the connection list, so slots may connect, disconnect or
/// emit re-entrantly. A disconnect or block performed during an emission
/// still prevents delivery to connections not yet reached.
///
/// Dropping the last handle of a signal invalidates all its connections.
///
/// # Example
/// ```ignore
/// let changed = Signal::<i32>::new("changed");
/// let log = Slot::new("log", |v: i32| tracing::info!("value {}", v));
/// let connection = changed.connect(&log)?;
/// changed.emit(7);
/// connection.disconnect();
/// ```
pub struct Signal<A> {
    inner: Arc<SignalInner<A>>,
}

struct SignalInner<A> {
    id: SignalId,
    name: String,
    mode: DeliveryMode,
    links: RwLock<Vec<Arc<Link<A>>>>,
}

impl<A> Clone for Signal<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Clone + Send + 'static> Signal<A> {
    /// Declare a signal with the default ([`DeliveryMode::Async`]) policy
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_mode(name, DeliveryMode::default())
    }

    /// Declare a signal whose [`notify`](Self::notify) always runs slots inline
    pub fn synchronous(name: impl Into<String>) -> Self {
        Self::with_mode(name, DeliveryMode::Sync)
    }

    pub fn with_mode(name: impl Into<String>, mode: DeliveryMode) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: SignalId::next(),
                name: name.into(),
                mode,
                links: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> SignalId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> DeliveryMode {
        self.inner.mode
    }

    /// Connect `slot` to this signal
    ///
    /// Fails with [`CoreError::AlreadyConnected`] if the pair is already
    /// linked.
    pub fn connect(&self, slot: &Slot<A>) -> CoreResult<Connection> {
        let slot_inner: &Arc<SlotInner<A>> = &slot.inner;
        let state = Arc::new(LinkState::new(&self.inner.name, slot_inner.name()));

        {
            let mut links = self.inner.links.write();
            if links
                .iter()
                .any(|link| link.slot_id == slot_inner.id() && link.state.is_connected())
            {
                return Err(CoreError::AlreadyConnected {
                    signal: self.inner.name.clone(),
                    slot: slot_inner.name().to_string(),
                });
            }

            links.push(Arc::new(Link {
                state: Arc::clone(&state),
                slot_id: slot_inner.id(),
                slot: Arc::downgrade(slot_inner),
            }));
        }

        let source: Weak<SignalInner<A>> = Arc::downgrade(&self.inner);
        let source: Weak<dyn ConnectionSource> = source;
        let target: Weak<SlotInner<A>> = Arc::downgrade(slot_inner);
        let target: Weak<dyn ConnectionTarget> = target;

        slot_inner.attach(SlotLink {
            state: Arc::clone(&state),
            source: source.clone(),
        });

        tracing::debug!(
            "Connected {} ({} -> {})",
            state.id(),
            self.inner.name,
            slot_inner.name()
        );

        Ok(Connection::new(state, source, target))
    }

    /// Disconnect `slot` if it is connected; returns whether it was
    pub fn disconnect(&self, slot: &Slot<A>) -> bool {
        let link = self
            .inner
            .links
            .read()
            .iter()
            .find(|link| link.slot_id == slot.id())
            .cloned();

        match link {
            Some(link) => {
                self.inner.unlink(&link);
                true
            }
            None => false,
        }
    }

    /// Disconnect every slot
    pub fn disconnect_all(&self) {
        for link in self.inner.snapshot() {
            self.inner.unlink(&link);
        }
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.inner.links.read().len()
    }

    /// Synchronous emission
    ///
    /// Invokes every non-blocked slot on the calling thread, in connection
    /// order, regardless of worker bindings. A panic inside a slot
    /// propagates to the caller. Returns the number of slots invoked.
    pub fn emit(&self, args: A) -> usize {
        let mut delivered = 0;

        for link in self.inner.snapshot() {
            if !link.state.is_deliverable() {
                continue;
            }
            match link.slot.upgrade() {
                Some(slot) => {
                    slot.invoke(args.clone());
                    delivered += 1;
                }
                None => self.inner.prune(&link),
            }
        }

        delivered
    }

    /// Asynchronous emission
    ///
    /// Posts the invocation to the worker of every non-blocked, worker-bound
    /// slot and runs unbound slots inline. Never waits for a worker. Returns
    /// the number of slots invoked or scheduled.
    pub fn async_emit(&self, args: A) -> usize {
        let mut dispatched = 0;

        for link in self.inner.snapshot() {
            if !link.state.is_deliverable() {
                continue;
            }
            let Some(slot) = link.slot.upgrade() else {
                self.inner.prune(&link);
                continue;
            };

            match slot.worker() {
                Some(worker) => {
                    let state = Arc::clone(&link.state);
                    let payload = args.clone();
                    // Detached: failures are logged by the worker's task loop.
                    let _ = worker.post(move || {
                        if state.is_connected() {
                            slot.invoke(payload);
                        }
                    });
                }
                None => slot.invoke(args.clone()),
            }
            dispatched += 1;
        }

        dispatched
    }

    /// Deliver with the policy chosen when the signal was declared
    pub fn notify(&self, args: A) -> usize {
        match self.inner.mode {
            DeliveryMode::Sync => self.emit(args),
            DeliveryMode::Async => self.async_emit(args),
        }
    }

    /// Non-owning handle to this signal
    pub fn downgrade(&self) -> WeakSignal<A> {
        WeakSignal {
            inner: Arc::downgrade(&self.inner),
            name: self.inner.name.clone(),
        }
    }
}

impl<A> SignalInner<A> {
    fn snapshot(&self) -> Vec<Arc<Link<A>>> {
        self.links.read().clone()
    }

    fn unlink(&self, link: &Link<A>) {
        if link.state.mark_disconnected() {
            self.detach(link.state.id());
            if let Some(slot) = link.slot.upgrade() {
                slot.forget(link.state.id());
            }
        }
    }

    /// Drop a link whose slot has been destroyed
    fn prune(&self, link: &Link<A>) {
        tracing::warn!(
            "Signal '{}' found dangling endpoint on {}, pruning",
            self.name,
            link.state.id()
        );
        link.state.mark_disconnected();
        self.detach(link.state.id());
    }
}

impl<A> ConnectionSource for SignalInner<A> {
    fn detach(&self, id: ConnectionId) {
        self.links.write().retain(|link| link.state.id() != id);
    }
}

impl<A> Drop for SignalInner<A> {
    fn drop(&mut self) {
        let links = std::mem::take(self.links.get_mut());
        for link in links {
            if link.state.mark_disconnected() {
                if let Some(slot) = link.slot.upgrade() {
                    slot.forget(link.state.id());
                }
            }
        }
    }
}

impl<A> std::fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("mode", &self.inner.mode)
            .field("signature", &std::any::type_name::<A>())
            .finish()
    }
}

/// Non-owning signal handle
///
/// Emitting through, or connecting to, a signal whose owner is gone fails
/// with [`CoreError::DanglingEndpoint`].
pub struct WeakSignal<A> {
    inner: Weak<SignalInner<A>>,
    name: String,
}

impl<A> Clone for WeakSignal<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
            name: self.name.clone(),
        }
    }
}

impl<A: Clone + Send + 'static> WeakSignal<A> {
    pub fn upgrade(&self) -> CoreResult<Signal<A>> {
        self.inner
            .upgrade()
            .map(|inner| Signal { inner })
            .ok_or_else(|| CoreError::DanglingEndpoint(self.name.clone()))
    }

    pub fn emit(&self, args: A) -> CoreResult<usize> {
        Ok(self.upgrade()?.emit(args))
    }

    pub fn async_emit(&self, args: A) -> CoreResult<usize> {
        Ok(self.upgrade()?.async_emit(args))
    }

    pub fn connect(&self, slot: &Slot<A>) -> CoreResult<Connection> {
        self.upgrade()?.connect(slot)
    }
}
