//! Signal/slot messaging.
//!
//! - [`Signal`]: typed broadcast channel, delivered inline ([`Signal::emit`])
//!   or through each slot's worker ([`Signal::async_emit`])
//! - [`Slot`]: typed reaction with optional [`Worker`](crate::worker::Worker) affinity
//! - [`Connection`]: weak link between the two, with counted blocking
//! - [`Signals`] / [`Slots`]: name tables used for configuration-driven connections
//!
//! There is no global lock on the connection graph. Each signal iterates over
//! a snapshot of its connection list and every connection carries its own
//! atomic blocked counter and connected flag.

pub mod connection;
pub mod named;
pub mod signal;
pub mod slot;

pub use connection::{Connection, ConnectionBlocker};
pub use named::{AnySignal, AnySlot, Signals, Slots};
pub use signal::{DeliveryMode, Signal, WeakSignal};
pub use slot::Slot;
