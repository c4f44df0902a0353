use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Declares a process-unique numeric identifier.
///
/// Identifiers are allocated from a per-type atomic counter and never reused
/// during the lifetime of the process, so a stale id can never alias a live
/// entity.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Allocate the next identifier.
            pub fn next() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                Self(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Raw numeric value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identity of a [`Worker`](crate::worker::Worker).
    WorkerId,
    "worker"
);
define_id!(
    /// Identity of a [`Signal`](crate::com::Signal).
    SignalId,
    "signal"
);
define_id!(
    /// Identity of a [`Slot`](crate::com::Slot).
    SlotId,
    "slot"
);
define_id!(
    /// Identity of a [`Connection`](crate::com::Connection).
    ConnectionId,
    "connection"
);
define_id!(
    /// Identity of a service instance.
    ServiceId,
    "service"
);
define_id!(
    /// Identity of a [`DataObject`](crate::data::DataObject).
    ObjectId,
    "object"
);
