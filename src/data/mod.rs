// Shared data objects
//
// A DataObject is the unit services observe and mutate. It stores a value of
// any type behind a lock and carries its own named signals. Services hold
// WeakObject handles for the objects they read, so an object can be dropped
// or swapped out from under a running service.

use crate::com::{Signal, Signals};
use crate::error::{CoreError, CoreResult};
use crate::models::ObjectId;
use parking_lot::RwLock;
use std::any::{Any, type_name};
use std::sync::{Arc, Weak};

/// Name of the signal every object declares
pub const MODIFIED_SIG: &str = "modified";

/// Shared, observable data object
///
/// Cloning shares the same object. Mutating the value never emits a signal
/// by itself; the writer decides when to notify, typically with
/// [`notify_modified`](Self::notify_modified).
#[derive(Clone)]
pub struct DataObject {
    inner: Arc<ObjectInner>,
}

struct ObjectInner {
    id: ObjectId,
    name: String,
    value: RwLock<Box<dyn Any + Send + Sync>>,
    value_type: &'static str,
    signals: Signals,
    modified: Signal<()>,
}

impl DataObject {
    pub fn new<T: Send + Sync + 'static>(name: impl Into<String>, value: T) -> Self {
        let signals = Signals::new();
        let modified = signals.insert(Signal::<()>::new(MODIFIED_SIG));

        let object = Self {
            inner: Arc::new(ObjectInner {
                id: ObjectId::next(),
                name: name.into(),
                value: RwLock::new(Box::new(value)),
                value_type: type_name::<T>(),
                signals,
                modified,
            }),
        };
        tracing::trace!("Created object '{}' ({})", object.name(), object.id());
        object
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Name of the stored value's type
    pub fn value_type(&self) -> &'static str {
        self.inner.value_type
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.inner.value.read().is::<T>()
    }

    /// Run `f` with shared access to the stored value
    pub fn read<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> CoreResult<R> {
        let guard = self.inner.value.read();
        let value = guard.downcast_ref::<T>().ok_or_else(|| self.mismatch::<T>())?;
        Ok(f(value))
    }

    /// Run `f` with exclusive access to the stored value
    pub fn write<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> CoreResult<R> {
        let mut guard = self.inner.value.write();
        let value = guard.downcast_mut::<T>().ok_or_else(|| self.mismatch::<T>())?;
        Ok(f(value))
    }

    /// Replace the stored value; the type must not change
    pub fn set<T: 'static>(&self, value: T) -> CoreResult<()> {
        self.write(|current: &mut T| *current = value)
    }

    /// Copy of the stored value
    pub fn get<T: Clone + 'static>(&self) -> CoreResult<T> {
        self.read(|value: &T| value.clone())
    }

    /// Declare an additional signal on this object
    pub fn declare_signal<A: Clone + Send + 'static>(&self, signal: Signal<A>) -> Signal<A> {
        self.inner.signals.insert(signal)
    }

    pub fn signal<A: Clone + Send + 'static>(&self, name: &str) -> CoreResult<Signal<A>> {
        self.inner.signals.get(name)
    }

    pub fn signals(&self) -> &Signals {
        &self.inner.signals
    }

    pub fn modified_signal(&self) -> Signal<()> {
        self.inner.modified.clone()
    }

    /// Deliver the `modified` signal with its declared (asynchronous) policy
    pub fn notify_modified(&self) -> usize {
        self.inner.modified.notify(())
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject {
            inner: Arc::downgrade(&self.inner),
            id: self.inner.id,
            name: self.inner.name.clone(),
        }
    }

    /// Whether both handles refer to the same object
    pub fn ptr_eq(&self, other: &DataObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn mismatch<T>(&self) -> CoreError {
        CoreError::TypeMismatch {
            expected: type_name::<T>(),
            found: self.inner.value_type,
        }
    }
}

impl std::fmt::Debug for DataObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataObject")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("type", &self.inner.value_type)
            .finish()
    }
}

/// Non-owning handle to a [`DataObject`]
#[derive(Clone)]
pub struct WeakObject {
    inner: Weak<ObjectInner>,
    id: ObjectId,
    name: String,
}

impl WeakObject {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fails with [`CoreError::ExpiredObject`] once the object is gone
    pub fn upgrade(&self) -> CoreResult<DataObject> {
        self.inner
            .upgrade()
            .map(|inner| DataObject { inner })
            .ok_or(CoreError::ExpiredObject(self.id))
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl std::fmt::Debug for WeakObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}
