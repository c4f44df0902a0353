use crate::models::ConnectionId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Shared state of one signal -> slot link
///
/// Held by the signal's connection list, by the slot's back-reference list
/// and by every [`Connection`] handle.
#[derive(Debug)]
pub(crate) struct LinkState {
    id: ConnectionId,
    signal: String,
    slot: String,
    blocked: AtomicUsize,
    connected: AtomicBool,
}

impl LinkState {
    pub(crate) fn new(signal: &str, slot: &str) -> Self {
        Self {
            id: ConnectionId::next(),
            signal: signal.to_string(),
            slot: slot.to_string(),
            blocked: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connected and not blocked
    pub(crate) fn is_deliverable(&self) -> bool {
        self.is_connected() && self.blocked.load(Ordering::SeqCst) == 0
    }

    /// Flip to disconnected; true only for the caller that performed the flip
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }
}

/// Signal side of a link: removes a connection from its list
pub(crate) trait ConnectionSource: Send + Sync {
    fn detach(&self, id: ConnectionId);
}

/// Slot side of a link: forgets its back-reference
pub(crate) trait ConnectionTarget: Send + Sync {
    fn forget(&self, id: ConnectionId);
}

/// Runtime link between one signal and one slot
///
/// Weak with respect to both endpoints: destroying either the signal or the
/// slot invalidates the connection. Dropping a `Connection` handle does
/// *not* disconnect; call [`disconnect()`](Self::disconnect).
///
/// Blocking is counted, so independent callers can block the same
/// connection without unblocking each other prematurely.
#[derive(Clone)]
pub struct Connection {
    state: Arc<LinkState>,
    source: Weak<dyn ConnectionSource>,
    target: Weak<dyn ConnectionTarget>,
}

impl Connection {
    pub(crate) fn new(
        state: Arc<LinkState>,
        source: Weak<dyn ConnectionSource>,
        target: Weak<dyn ConnectionTarget>,
    ) -> Self {
        Self {
            state,
            source,
            target,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    pub fn signal_name(&self) -> &str {
        &self.state.signal
    }

    pub fn slot_name(&self) -> &str {
        &self.state.slot
    }

    /// False once disconnected or once either endpoint was destroyed
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_blocked(&self) -> bool {
        self.block_count() > 0
    }

    /// Current nesting depth of [`block()`](Self::block) calls
    pub fn block_count(&self) -> usize {
        self.state.blocked.load(Ordering::SeqCst)
    }

    /// Suppress delivery through this connection until a matching unblock
    pub fn block(&self) {
        self.state.blocked.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo one [`block()`](Self::block)
    ///
    /// An unbalanced unblock is logged and ignored.
    pub fn unblock(&self) {
        let previous = self
            .state
            .blocked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));

        if previous.is_err() {
            tracing::warn!(
                "Unbalanced unblock on connection {} ({} -> {})",
                self.state.id,
                self.state.signal,
                self.state.slot
            );
        }
    }

    /// Block now and unblock when the returned guard is dropped
    pub fn blocker(&self) -> ConnectionBlocker {
        self.block();
        ConnectionBlocker {
            connection: self.clone(),
        }
    }

    /// Remove the link from both endpoints
    ///
    /// Idempotent, and safe to call from inside a slot invoked through this
    /// very connection.
    pub fn disconnect(&self) {
        if !self.state.mark_disconnected() {
            return;
        }

        if let Some(source) = self.source.upgrade() {
            source.detach(self.state.id);
        }
        if let Some(target) = self.target.upgrade() {
            target.forget(self.state.id);
        }

        tracing::debug!(
            "Disconnected {} ({} -> {})",
            self.state.id,
            self.state.signal,
            self.state.slot
        );
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.state.id)
            .field("signal", &self.state.signal)
            .field("slot", &self.state.slot)
            .field("connected", &self.is_connected())
            .field("blocked", &self.block_count())
            .finish()
    }
}

/// RAII guard returned by [`Connection::blocker`]
#[must_use = "the connection is unblocked as soon as the guard is dropped"]
pub struct ConnectionBlocker {
    connection: Connection,
}

impl ConnectionBlocker {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionBlocker {
    fn drop(&mut self) {
        self.connection.unblock();
    }
}
