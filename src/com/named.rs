// Name-addressed signal and slot tables
//
// Auto-connections and configuration refer to signals and slots by name.
// The tables below store type-erased entries and recover the typed handle
// on lookup, so a signature mismatch is caught when the connection is made.

use super::connection::Connection;
use super::signal::Signal;
use super::slot::Slot;
use crate::error::{CoreError, CoreResult};
use crate::models::{SignalId, SlotId};
use crate::worker::Worker;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::any::{Any, type_name};
use std::sync::Arc;

/// Type-erased view of a [`Signal`]
pub trait AnySignal: Send + Sync {
    fn id(&self) -> SignalId;

    fn name(&self) -> &str;

    /// Name of the argument type
    fn signature(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Connect to a slot of unknown type, checking signatures at runtime
    fn connect_slot(&self, slot: &dyn AnySlot) -> CoreResult<Connection>;

    fn connection_count(&self) -> usize;

    fn disconnect_all(&self);
}

/// Type-erased view of a [`Slot`]
pub trait AnySlot: Send + Sync {
    fn id(&self) -> SlotId;

    fn name(&self) -> &str;

    fn signature(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn set_worker(&self, worker: Option<Worker>);

    fn connection_count(&self) -> usize;
}

impl<A: Clone + Send + 'static> AnySignal for Signal<A> {
    fn id(&self) -> SignalId {
        Signal::id(self)
    }

    fn name(&self) -> &str {
        Signal::name(self)
    }

    fn signature(&self) -> &'static str {
        type_name::<A>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn connect_slot(&self, slot: &dyn AnySlot) -> CoreResult<Connection> {
        match slot.as_any().downcast_ref::<Slot<A>>() {
            Some(typed) => self.connect(typed),
            None => Err(CoreError::SignatureMismatch {
                name: format!("{} -> {}", Signal::name(self), slot.name()),
                expected: type_name::<A>(),
                found: slot.signature(),
            }),
        }
    }

    fn connection_count(&self) -> usize {
        Signal::connection_count(self)
    }

    fn disconnect_all(&self) {
        Signal::disconnect_all(self)
    }
}

impl<A: Clone + Send + 'static> AnySlot for Slot<A> {
    fn id(&self) -> SlotId {
        Slot::id(self)
    }

    fn name(&self) -> &str {
        Slot::name(self)
    }

    fn signature(&self) -> &'static str {
        type_name::<A>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn set_worker(&self, worker: Option<Worker>) {
        Slot::set_worker(self, worker)
    }

    fn connection_count(&self) -> usize {
        Slot::connection_count(self)
    }
}

/// Insertion-ordered table of named signals
#[derive(Default)]
pub struct Signals {
    entries: RwLock<IndexMap<String, Arc<dyn AnySignal>>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `signal` under its own name, replacing any previous entry
    pub fn insert<A: Clone + Send + 'static>(&self, signal: Signal<A>) -> Signal<A> {
        let name = signal.name().to_string();
        if self
            .entries
            .write()
            .insert(name.clone(), Arc::new(signal.clone()))
            .is_some()
        {
            tracing::warn!("Signal '{}' redeclared", name);
        }
        signal
    }

    /// Typed lookup
    pub fn get<A: Clone + Send + 'static>(&self, name: &str) -> CoreResult<Signal<A>> {
        let entry = self.get_any(name)?;
        entry
            .as_any()
            .downcast_ref::<Signal<A>>()
            .cloned()
            .ok_or_else(|| CoreError::SignatureMismatch {
                name: name.to_string(),
                expected: type_name::<A>(),
                found: entry.signature(),
            })
    }

    pub fn get_any(&self, name: &str) -> CoreResult<Arc<dyn AnySignal>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownSignal(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry; signals with no other handle are destroyed
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.write());
        drop(entries);
    }
}

/// Insertion-ordered table of named slots
#[derive(Default)]
pub struct Slots {
    entries: RwLock<IndexMap<String, Arc<dyn AnySlot>>>,
}

impl Slots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<A: Clone + Send + 'static>(&self, slot: Slot<A>) -> Slot<A> {
        let name = slot.name().to_string();
        if self
            .entries
            .write()
            .insert(name.clone(), Arc::new(slot.clone()))
            .is_some()
        {
            tracing::warn!("Slot '{}' redeclared", name);
        }
        slot
    }

    pub fn get<A: Clone + Send + 'static>(&self, name: &str) -> CoreResult<Slot<A>> {
        let entry = self.get_any(name)?;
        entry
            .as_any()
            .downcast_ref::<Slot<A>>()
            .cloned()
            .ok_or_else(|| CoreError::SignatureMismatch {
                name: name.to_string(),
                expected: type_name::<A>(),
                found: entry.signature(),
            })
    }

    pub fn get_any(&self, name: &str) -> CoreResult<Arc<dyn AnySlot>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownSlot(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Bind every slot in the table to `worker`, or unbind them all
    pub fn set_worker(&self, worker: Option<Worker>) {
        for slot in self.entries.read().values() {
            slot.set_worker(worker.clone());
        }
    }

    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.write());
        drop(entries);
    }
}
