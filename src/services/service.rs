// Service - a stateful unit with a fixed lifecycle
//
// A service owns slots, declares signals and holds keyed references to the
// data objects it works on. Its lifecycle is driven through ServiceHandle:
//
//   configure -> start -> (update | swap)* -> stop -> destroy
//
// At start the service resolves its declared auto-connections (object key,
// signal name, slot name) against the currently bound objects; at stop and
// on swap those connections are torn down again. When the service has a
// worker, every lifecycle operation runs on that worker so it serializes
// with the service's slot deliveries.

use super::registry::{ObjectServiceRegistry, WeakRegistry, default_registry};
use crate::com::{Connection, ConnectionBlocker, Signal, Signals, Slot, Slots};
use crate::data::{DataObject, WeakObject};
use crate::error::{CoreError, CoreResult};
use crate::models::{AccessType, ObjectConfig, ServiceConfig, ServiceId};
use crate::state::{Operation, ServiceState, StateChange, StateMachine};
use crate::worker::{TaskHandle, Worker};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Emitted after a successful `start`
pub const STARTED_SIG: &str = "started";
/// Emitted after a successful `update`
pub const UPDATED_SIG: &str = "updated";
/// Emitted after `stop`
pub const STOPPED_SIG: &str = "stopped";
/// Emitted after a successful `swap`, with the swapped key
pub const SWAPPED_SIG: &str = "swapped";
/// Emitted synchronously when the service publishes or withdraws an output, with its key
pub const OUTPUT_SIG: &str = "output_changed";

/// Slot starting the service
pub const START_SLOT: &str = "start";
/// Slot updating the service
pub const UPDATE_SLOT: &str = "update";
/// Slot stopping the service
pub const STOP_SLOT: &str = "stop";

/// Behaviour of a service
///
/// Hooks run with exclusive access to the service value. A hook must not
/// synchronously emit a signal that is connected back to one of its own
/// service's slots: the slot would wait for the lock the hook holds. To
/// mutate an observed object inside a hook, block the auto-connections of
/// its key with [`ServiceContext::block_auto_connections`] first.
pub trait Service: Send + 'static {
    /// Apply static configuration; must not touch bound objects
    fn configuring(
        &mut self,
        _ctx: &ServiceContext<'_>,
        _config: &ServiceConfig,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn starting(&mut self, _ctx: &ServiceContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Recompute the service's effect from its bound objects
    fn updating(&mut self, ctx: &ServiceContext<'_>) -> anyhow::Result<()>;

    /// React to `key` having been rebound; updates by default
    fn swapping(&mut self, ctx: &ServiceContext<'_>, _key: &str) -> anyhow::Result<()> {
        self.updating(ctx)
    }

    fn stopping(&mut self, _ctx: &ServiceContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Connections made at start, independent of configuration
    fn auto_connections(&self) -> KeyConnections {
        KeyConnections::new()
    }
}

/// One auto-connection: `signal` of the object bound to `key` drives `slot`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyConnection {
    pub key: String,
    pub signal: String,
    pub slot: String,
}

/// Declarative auto-connection table of a service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyConnections {
    entries: Vec<KeyConnection>,
}

impl KeyConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`push`](Self::push)
    pub fn with(mut self, key: &str, signal: &str, slot: &str) -> Self {
        self.push(key, signal, slot);
        self
    }

    pub fn push(&mut self, key: &str, signal: &str, slot: &str) {
        self.entries.push(KeyConnection {
            key: key.to_string(),
            signal: signal.to_string(),
            slot: slot.to_string(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyConnection> {
        self.entries.iter()
    }

    pub fn for_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a KeyConnection> {
        self.entries.iter().filter(move |entry| entry.key == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How an object is attached to a key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindOptions {
    pub access: AccessType,
    /// Whether the service's auto-connections apply to this key
    pub auto_connect: bool,
    /// An optional key may be unbound or expired at start
    pub optional: bool,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            access: AccessType::InOut,
            auto_connect: true,
            optional: false,
        }
    }
}

impl BindOptions {
    pub fn input() -> Self {
        Self {
            access: AccessType::Input,
            ..Self::default()
        }
    }

    pub fn output() -> Self {
        Self {
            access: AccessType::Output,
            auto_connect: false,
            optional: true,
        }
    }
}

impl From<&ObjectConfig> for BindOptions {
    fn from(config: &ObjectConfig) -> Self {
        Self {
            access: config.access,
            auto_connect: config.auto_connect,
            optional: config.optional,
        }
    }
}

enum BoundObject {
    Shared(WeakObject),
    Owned(DataObject),
}

struct Binding {
    object: BoundObject,
    options: BindOptions,
}

impl Binding {
    fn new(object: &DataObject, options: BindOptions) -> Self {
        let bound = match options.access {
            AccessType::Output => BoundObject::Owned(object.clone()),
            AccessType::Input | AccessType::InOut => BoundObject::Shared(object.downgrade()),
        };
        Self {
            object: bound,
            options,
        }
    }

    fn object(&self) -> CoreResult<DataObject> {
        match &self.object {
            BoundObject::Shared(weak) => weak.upgrade(),
            BoundObject::Owned(object) => Ok(object.clone()),
        }
    }
}

struct AutoLink {
    key: String,
    connection: Connection,
}

/// Shared state behind every [`ServiceHandle`]
pub(crate) struct ServiceCore {
    id: ServiceId,
    uid: String,
    type_name: String,
    machine: StateMachine,
    service: Arc<Mutex<dyn Service>>,
    auto_table: KeyConnections,
    signals: Signals,
    slots: Slots,
    bindings: RwLock<IndexMap<String, Binding>>,
    requirements: RwLock<Vec<ObjectConfig>>,
    worker: RwLock<Option<Worker>>,
    auto_links: Mutex<Vec<AutoLink>>,
    registry: ObjectServiceRegistry,
    /// Other registries the service was entered in
    joined: Mutex<Vec<WeakRegistry>>,
    started: Signal<()>,
    updated: Signal<()>,
    stopped: Signal<()>,
    swapped: Signal<String>,
    output_changed: Signal<String>,
}

impl ServiceCore {
    pub(crate) fn id(&self) -> ServiceId {
        self.id
    }

    pub(crate) fn uid(&self) -> &str {
        &self.uid
    }

    fn worker(&self) -> Option<Worker> {
        self.worker.read().clone()
    }

    fn object(&self, key: &str) -> CoreResult<DataObject> {
        self.bindings
            .read()
            .get(key)
            .ok_or_else(|| CoreError::MissingObject {
                service: self.uid.clone(),
                key: key.to_string(),
            })?
            .object()
    }

    fn run_hook<F>(self: &Arc<Self>, operation: Operation, hook: F) -> CoreResult<()>
    where
        F: FnOnce(&mut dyn Service, &ServiceContext<'_>) -> anyhow::Result<()>,
    {
        let ctx = ServiceContext { core: self };
        let result = {
            let mut service = self.service.lock();
            hook(&mut *service, &ctx)
        };
        result.map_err(|err| CoreError::hook(&self.uid, operation.phase(), err))
    }

    fn configure(self: &Arc<Self>, config: &ServiceConfig) -> CoreResult<()> {
        let previous = self.machine.begin(Operation::Configure)?;
        if config.uid != self.uid {
            tracing::warn!(
                "Service '{}' configured with the configuration of '{}'",
                self.uid,
                config.uid
            );
        }

        *self.requirements.write() = config.objects.clone();
        let result =
            self.run_hook(Operation::Configure, |service, ctx| service.configuring(ctx, config));
        match result {
            Ok(()) => {
                self.machine.finish(ServiceState::Configured);
                tracing::debug!("Service '{}' configured", self.uid);
                Ok(())
            }
            Err(err) => {
                self.machine.finish(previous);
                tracing::error!("{}", err);
                Err(err)
            }
        }
    }

    fn start(self: &Arc<Self>) -> CoreResult<()> {
        self.machine.begin(Operation::Start)?;

        match self.try_start() {
            Ok(()) => {
                self.machine.finish(ServiceState::Started);
                tracing::info!(
                    "Service '{}' started ({} auto-connections)",
                    self.uid,
                    self.auto_links.lock().len()
                );
                self.started.notify(());
                Ok(())
            }
            Err(err) => {
                self.release_connections(None);
                self.assign_slot_workers(false);
                self.machine.finish(ServiceState::Stopped);
                tracing::error!("Service '{}' failed to start: {}", self.uid, err);
                Err(err)
            }
        }
    }

    fn try_start(self: &Arc<Self>) -> CoreResult<()> {
        self.check_requirements()?;

        self.assign_slot_workers(true);

        self.run_hook(Operation::Start, |service, ctx| service.starting(ctx))?;

        if let Err(err) = self.establish_connections(None) {
            // The starting hook succeeded; give the service a chance to undo it
            let undo = self.run_hook(Operation::Stop, |service, ctx| service.stopping(ctx));
            if let Err(stop_err) = undo {
                tracing::warn!("{}", stop_err);
            }
            return Err(err);
        }
        Ok(())
    }

    fn update(self: &Arc<Self>) -> CoreResult<()> {
        self.machine.begin(Operation::Update)?;

        let ctx = ServiceContext { core: self };
        let result = {
            let mut service = self.service.lock();
            // A stop may have completed while this call waited for the lock
            self.machine.check(Operation::Update)?;
            service.updating(&ctx)
        };
        result
            .map_err(|err| CoreError::hook(&self.uid, Operation::Update.phase(), err))
            .inspect_err(|err| tracing::error!("{}", err))?;

        tracing::debug!("Service '{}' updated", self.uid);
        self.updated.notify(());
        Ok(())
    }

    fn swap(self: &Arc<Self>, key: &str, object: DataObject) -> CoreResult<()> {
        self.machine.begin(Operation::Swap)?;
        let result = self.try_swap(key, &object);
        self.machine.finish(ServiceState::Started);

        match result {
            Ok(()) => {
                tracing::info!(
                    "Service '{}' swapped '{}' to object '{}'",
                    self.uid,
                    key,
                    object.name()
                );
                self.swapped.notify(key.to_string());
                Ok(())
            }
            Err(err) => {
                tracing::error!("Service '{}' failed to swap '{}': {}", self.uid, key, err);
                Err(err)
            }
        }
    }

    fn try_swap(self: &Arc<Self>, key: &str, object: &DataObject) -> CoreResult<()> {
        self.release_connections(Some(key));

        let options = self
            .bindings
            .read()
            .get(key)
            .map(|binding| binding.options)
            .unwrap_or_default();
        self.attach(key, object, options);

        self.establish_connections(Some(key))?;
        self.run_hook(Operation::Swap, |service, ctx| service.swapping(ctx, key))
    }

    fn stop(self: &Arc<Self>) -> CoreResult<()> {
        if self.machine.current() == ServiceState::Stopped {
            tracing::debug!("Service '{}' already stopped", self.uid);
            return Ok(());
        }
        self.machine.begin(Operation::Stop)?;

        let result = self.run_hook(Operation::Stop, |service, ctx| service.stopping(ctx));
        let released = self.release_connections(None);
        self.assign_slot_workers(false);
        self.machine.finish(ServiceState::Stopped);

        tracing::info!(
            "Service '{}' stopped ({} auto-connections released)",
            self.uid,
            released
        );
        self.stopped.notify(());

        result.inspect_err(|err| tracing::error!("{}", err))
    }

    fn destroy(self: &Arc<Self>) -> CoreResult<()> {
        self.machine.begin(Operation::Destroy)?;

        self.leave_registries();
        self.bindings.write().clear();
        for name in self.signals.names() {
            if let Ok(signal) = self.signals.get_any(&name) {
                signal.disconnect_all();
            }
        }
        self.slots.clear();

        self.machine.finish(ServiceState::Destroyed);
        tracing::info!("Service '{}' destroyed", self.uid);
        Ok(())
    }

    fn bind(
        self: &Arc<Self>,
        key: &str,
        object: &DataObject,
        options: BindOptions,
    ) -> CoreResult<()> {
        self.machine.check(Operation::Bind)?;
        self.attach(key, object, options);
        Ok(())
    }

    /// Publish `object` as the output `key`, or withdraw the output with `None`
    ///
    /// Legal in any state, so hooks of a running service can produce outputs.
    pub(crate) fn set_output(self: &Arc<Self>, key: &str, object: Option<&DataObject>) {
        match object {
            Some(object) => self.attach(key, object, BindOptions::output()),
            None => {
                if self.bindings.write().shift_remove(key).is_none() {
                    return;
                }
                self.registry.unregister_key(self.id, key);
                tracing::debug!("Service '{}': withdrew output '{}'", self.uid, key);
            }
        }
        self.output_changed.notify(key.to_string());
    }

    fn unbind(&self, key: &str) -> CoreResult<bool> {
        self.machine.check(Operation::Unbind)?;
        let removed = self.bindings.write().shift_remove(key).is_some();
        if removed {
            self.registry.unregister_key(self.id, key);
            tracing::debug!("Service '{}': unbound '{}'", self.uid, key);
        }
        Ok(removed)
    }

    /// Store the binding and move the registry entry for `key`
    fn attach(self: &Arc<Self>, key: &str, object: &DataObject, options: BindOptions) {
        self.bindings
            .write()
            .insert(key.to_string(), Binding::new(object, options));
        self.registry.register_core(object.id(), key, self);

        tracing::debug!(
            "Service '{}': bound '{}' to object '{}' ({:?})",
            self.uid,
            key,
            object.name(),
            options.access
        );
    }

    fn check_requirements(&self) -> CoreResult<()> {
        let missing = |key: &str| CoreError::MissingObject {
            service: self.uid.clone(),
            key: key.to_string(),
        };

        let bindings = self.bindings.read();
        let requirements = self.requirements.read();
        for requirement in requirements.iter().filter(|r| !r.optional && !r.is_output()) {
            let alive = bindings
                .get(&requirement.key)
                .is_some_and(|binding| binding.object().is_ok());
            if !alive {
                return Err(missing(&requirement.key));
            }
        }
        for (key, binding) in bindings.iter() {
            if !binding.options.optional && binding.object().is_err() {
                return Err(missing(key));
            }
        }
        Ok(())
    }

    /// Resolve the auto-connection table, for every key or only `only_key`
    fn establish_connections(&self, only_key: Option<&str>) -> CoreResult<()> {
        let entries = self
            .auto_table
            .iter()
            .filter(|entry| only_key.is_none_or(|key| key == entry.key));

        for entry in entries {
            let object = {
                let bindings = self.bindings.read();
                let Some(binding) = bindings.get(&entry.key) else {
                    tracing::debug!(
                        "Service '{}': key '{}' is unbound, skipping {} -> {}",
                        self.uid,
                        entry.key,
                        entry.signal,
                        entry.slot
                    );
                    continue;
                };
                if !binding.options.auto_connect {
                    continue;
                }
                match binding.object() {
                    Ok(object) => object,
                    Err(_) if binding.options.optional => continue,
                    Err(err) => return Err(err),
                }
            };

            let signal = object.signals().get_any(&entry.signal)?;
            let slot = self.slots.get_any(&entry.slot)?;
            let connection = signal.connect_slot(slot.as_ref())?;

            tracing::debug!(
                "Service '{}': auto-connected {}.{} -> {}",
                self.uid,
                object.name(),
                entry.signal,
                entry.slot
            );
            self.auto_links.lock().push(AutoLink {
                key: entry.key.clone(),
                connection,
            });
        }
        Ok(())
    }

    /// Disconnect auto-connections, for every key or only `only_key`
    fn release_connections(&self, only_key: Option<&str>) -> usize {
        let released: Vec<AutoLink> = {
            let mut links = self.auto_links.lock();
            let (released, kept): (Vec<AutoLink>, Vec<AutoLink>) = std::mem::take(&mut *links)
                .into_iter()
                .partition(|link| only_key.is_none_or(|key| key == link.key));
            *links = kept;
            released
        };

        for link in &released {
            link.connection.disconnect();
        }
        released.len()
    }

    /// Bind slots to the service worker
    ///
    /// Service-defined slots follow the worker only while the service runs;
    /// the lifecycle slots always do, so signals driving them never block
    /// the emitter.
    fn assign_slot_workers(&self, running: bool) {
        let worker = self.worker();
        self.slots.set_worker(if running { worker.clone() } else { None });
        for name in [START_SLOT, UPDATE_SLOT, STOP_SLOT] {
            if let Ok(slot) = self.slots.get_any(name) {
                slot.set_worker(worker.clone());
            }
        }
    }

    pub(crate) fn note_registry(&self, registry: &ObjectServiceRegistry) {
        if registry.ptr_eq(&self.registry) {
            return;
        }
        let mut joined = self.joined.lock();
        joined.retain(WeakRegistry::is_alive);
        if !joined.iter().any(|weak| weak.points_to(registry)) {
            joined.push(registry.downgrade());
        }
    }

    fn leave_registries(&self) {
        self.registry.unregister_service(self.id);
        let joined = std::mem::take(&mut *self.joined.lock());
        for registry in joined.iter().filter_map(WeakRegistry::upgrade) {
            registry.unregister_service(self.id);
        }
    }

    fn block_auto_connections(&self, key: &str) -> AutoConnectionBlocker {
        let blockers = self
            .auto_links
            .lock()
            .iter()
            .filter(|link| link.key == key)
            .map(|link| link.connection.blocker())
            .collect();
        AutoConnectionBlocker { blockers }
    }
}

impl Drop for ServiceCore {
    fn drop(&mut self) {
        if self.machine.current().accepts_slots() {
            tracing::warn!("Service '{}' dropped while running", self.uid);
        }
        for link in std::mem::take(self.auto_links.get_mut()) {
            link.connection.disconnect();
        }
        self.leave_registries();
    }
}

/// View of a service handed to its hooks and slots
pub struct ServiceContext<'a> {
    core: &'a Arc<ServiceCore>,
}

impl ServiceContext<'_> {
    pub fn uid(&self) -> &str {
        &self.core.uid
    }

    pub fn id(&self) -> ServiceId {
        self.core.id
    }

    pub fn state(&self) -> ServiceState {
        self.core.machine.current()
    }

    /// Object bound to `key`
    ///
    /// Fails with [`CoreError::MissingObject`] for an unbound key and with
    /// [`CoreError::ExpiredObject`] when the object has been dropped.
    pub fn object(&self, key: &str) -> CoreResult<DataObject> {
        self.core.object(key)
    }

    /// One of the service's own signals
    pub fn signal<A: Clone + Send + 'static>(&self, name: &str) -> CoreResult<Signal<A>> {
        self.core.signals.get(name)
    }

    pub fn worker(&self) -> Option<Worker> {
        self.core.worker()
    }

    /// Block this service's auto-connections on `key` until the guard drops
    ///
    /// Use around a mutation of an object the service also observes.
    pub fn block_auto_connections(&self, key: &str) -> AutoConnectionBlocker {
        self.core.block_auto_connections(key)
    }

    /// Publish `object` as the output `key`
    ///
    /// The service owns the object; it is registered and announced through
    /// the `output_changed` signal, which an [`AppManager`](super::AppManager)
    /// uses to hand it to the services waiting for it.
    pub fn set_output(&self, key: &str, object: &DataObject) {
        self.core.set_output(key, Some(object));
    }

    /// Withdraw the output `key`
    pub fn clear_output(&self, key: &str) {
        self.core.set_output(key, None);
    }

    /// Handle to the service itself
    ///
    /// Synchronous lifecycle calls through it from inside a hook or slot of
    /// the same service deadlock on the service lock.
    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            core: Arc::clone(self.core),
        }
    }
}

/// Guard returned by [`ServiceContext::block_auto_connections`]
#[must_use = "the auto-connections are unblocked as soon as the guard is dropped"]
pub struct AutoConnectionBlocker {
    blockers: Vec<ConnectionBlocker>,
}

impl AutoConnectionBlocker {
    /// Number of connections held blocked
    pub fn len(&self) -> usize {
        self.blockers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blockers.is_empty()
    }
}

type SlotInstaller<S> = Box<dyn FnOnce(&Arc<ServiceCore>, &Arc<Mutex<S>>) + Send>;

/// Assembles a service value, its slots and its signals into a [`ServiceHandle`]
///
/// # Example
/// ```ignore
/// let handle = ServiceBuilder::new("histogram", Histogram::default())
///     .slot("on_modified", |service: &mut Histogram, ctx, _: ()| service.recompute(ctx))
///     .signal(Signal::<u64>::new("peak_changed"))
///     .registry(registry.clone())
///     .build();
/// ```
pub struct ServiceBuilder<S: Service> {
    uid: String,
    type_name: String,
    service: S,
    worker: Option<Worker>,
    registry: Option<ObjectServiceRegistry>,
    signals: Signals,
    lifecycle: LifecycleSignals,
    slots: Vec<SlotInstaller<S>>,
}

struct LifecycleSignals {
    started: Signal<()>,
    updated: Signal<()>,
    stopped: Signal<()>,
    swapped: Signal<String>,
    output_changed: Signal<String>,
}

impl<S: Service> ServiceBuilder<S> {
    pub fn new(uid: impl Into<String>, service: S) -> Self {
        let type_name = std::any::type_name::<S>()
            .rsplit("::")
            .next()
            .unwrap_or_default()
            .to_string();

        let signals = Signals::new();
        let lifecycle = LifecycleSignals {
            started: signals.insert(Signal::new(STARTED_SIG)),
            updated: signals.insert(Signal::new(UPDATED_SIG)),
            stopped: signals.insert(Signal::new(STOPPED_SIG)),
            swapped: signals.insert(Signal::new(SWAPPED_SIG)),
            output_changed: signals.insert(Signal::synchronous(OUTPUT_SIG)),
        };

        Self {
            uid: uid.into(),
            type_name,
            service,
            worker: None,
            registry: None,
            signals,
            lifecycle,
            slots: Vec::new(),
        }
    }

    /// Override the reported type name (defaults to the Rust type's name)
    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    pub fn worker(mut self, worker: Worker) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Registry to register bindings in; [`default_registry`] otherwise
    pub fn registry(mut self, registry: ObjectServiceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Declare a signal of the service
    pub fn signal<A: Clone + Send + 'static>(self, signal: Signal<A>) -> Self {
        self.signals.insert(signal);
        self
    }

    /// Declare a slot reacting with `reaction`
    ///
    /// The reaction only runs while the service is started; an `Err` is
    /// logged with the service uid and slot name.
    pub fn slot<A, F>(mut self, name: &str, reaction: F) -> Self
    where
        A: Clone + Send + 'static,
        F: Fn(&mut S, &ServiceContext<'_>, A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.to_string();
        self.slots.push(Box::new(move |core, cell| {
            core.slots.insert(service_slot(core, cell, name, reaction));
        }));
        self
    }

    pub fn build(self) -> ServiceHandle {
        let auto_table = self.service.auto_connections();
        let cell = Arc::new(Mutex::new(self.service));
        let service: Arc<Mutex<dyn Service>> = cell.clone();
        let LifecycleSignals {
            started,
            updated,
            stopped,
            swapped,
            output_changed,
        } = self.lifecycle;

        let core = Arc::new(ServiceCore {
            id: ServiceId::next(),
            machine: StateMachine::new(self.uid.clone()),
            uid: self.uid,
            type_name: self.type_name,
            service,
            auto_table,
            signals: self.signals,
            slots: Slots::new(),
            bindings: RwLock::new(IndexMap::new()),
            requirements: RwLock::new(Vec::new()),
            worker: RwLock::new(self.worker),
            auto_links: Mutex::new(Vec::new()),
            registry: self.registry.unwrap_or_else(|| default_registry().clone()),
            joined: Mutex::new(Vec::new()),
            started,
            updated,
            stopped,
            swapped,
            output_changed,
        });

        core.slots.insert(lifecycle_slot(&core, START_SLOT, Operation::Start));
        core.slots.insert(lifecycle_slot(&core, UPDATE_SLOT, Operation::Update));
        core.slots.insert(lifecycle_slot(&core, STOP_SLOT, Operation::Stop));
        for install in self.slots {
            install(&core, &cell);
        }
        core.assign_slot_workers(false);

        tracing::debug!("Built service '{}' ({})", core.uid, core.type_name);
        ServiceHandle { core }
    }
}

fn service_slot<S, A, F>(
    core: &Arc<ServiceCore>,
    cell: &Arc<Mutex<S>>,
    name: String,
    reaction: F,
) -> Slot<A>
where
    S: Service,
    A: Clone + Send + 'static,
    F: Fn(&mut S, &ServiceContext<'_>, A) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let weak: Weak<ServiceCore> = Arc::downgrade(core);
    let cell = Arc::clone(cell);
    let slot_name = name.clone();

    Slot::new(name, move |args: A| {
        let Some(core) = weak.upgrade() else {
            return;
        };

        let state = core.machine.current();
        if !state.accepts_slots() {
            tracing::debug!(
                "Service '{}' is {}, ignoring slot '{}'",
                core.uid,
                state,
                slot_name
            );
            return;
        }

        let mut service = cell.lock();
        // A stop may have completed while this slot waited for the lock
        if !core.machine.current().accepts_slots() {
            return;
        }

        let ctx = ServiceContext { core: &core };
        if let Err(err) = reaction(&mut service, &ctx, args) {
            tracing::error!("Service '{}' slot '{}' failed: {:#}", core.uid, slot_name, err);
        }
    })
}

fn lifecycle_slot(core: &Arc<ServiceCore>, name: &str, operation: Operation) -> Slot<()> {
    let weak: Weak<ServiceCore> = Arc::downgrade(core);
    let slot_name = name.to_string();

    Slot::new(name, move |_: ()| {
        let Some(core) = weak.upgrade() else {
            return;
        };
        let handle = ServiceHandle { core };
        let result = match operation {
            Operation::Start => handle.start(),
            Operation::Update => handle.update(),
            Operation::Stop => handle.stop(),
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::error!(
                "Service '{}' slot '{}' failed: {}",
                handle.uid(),
                slot_name,
                err
            );
        }
    })
}

/// Shared handle to a service
///
/// Clones refer to the same service. Dropping the last handle unregisters
/// the service from its registry.
#[derive(Clone)]
pub struct ServiceHandle {
    core: Arc<ServiceCore>,
}

impl ServiceHandle {
    pub(crate) fn from_core(core: Arc<ServiceCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<ServiceCore> {
        &self.core
    }

    pub fn id(&self) -> ServiceId {
        self.core.id
    }

    pub fn uid(&self) -> &str {
        &self.core.uid
    }

    pub fn type_name(&self) -> &str {
        &self.core.type_name
    }

    pub fn state(&self) -> ServiceState {
        self.core.machine.current()
    }

    pub fn is_started(&self) -> bool {
        self.state() == ServiceState::Started
    }

    pub fn worker(&self) -> Option<Worker> {
        self.core.worker()
    }

    /// Run lifecycle operations, the lifecycle slots and (once started)
    /// every other slot on `worker`
    pub fn set_worker(&self, worker: Option<Worker>) {
        *self.core.worker.write() = worker;
        self.core.assign_slot_workers(self.state().accepts_slots());
    }

    pub fn registry(&self) -> &ObjectServiceRegistry {
        &self.core.registry
    }

    /// Bind `object` to `key` with default options (in-out, auto-connected, required)
    pub fn bind(&self, key: &str, object: &DataObject) -> CoreResult<()> {
        self.bind_with(key, object, BindOptions::default())
    }

    /// Bind `object` to `key`; only legal while the service is not running
    pub fn bind_with(
        &self,
        key: &str,
        object: &DataObject,
        options: BindOptions,
    ) -> CoreResult<()> {
        self.core.bind(key, object, options)
    }

    /// Remove the binding of `key`; returns whether one existed
    pub fn unbind(&self, key: &str) -> CoreResult<bool> {
        self.core.unbind(key)
    }

    pub fn object(&self, key: &str) -> CoreResult<DataObject> {
        self.core.object(key)
    }

    pub fn is_bound(&self, key: &str) -> bool {
        self.core.bindings.read().contains_key(key)
    }

    /// Bound keys in binding order
    pub fn keys(&self) -> Vec<String> {
        self.core.bindings.read().keys().cloned().collect()
    }

    pub fn configure(&self, config: &ServiceConfig) -> CoreResult<()> {
        let config = config.clone();
        self.run_lifecycle(move |core| core.configure(&config))
    }

    /// Start the service and wait for the outcome
    ///
    /// With a worker, this and the other synchronous lifecycle calls block
    /// until the worker has run the operation. From async code on a
    /// current-thread runtime they fail with
    /// [`CoreError::BlockingInRuntime`]; use [`async_start`](Self::async_start)
    /// and friends with [`TaskHandle::join`] there.
    pub fn start(&self) -> CoreResult<()> {
        self.run_lifecycle(|core| core.start())
    }

    pub fn update(&self) -> CoreResult<()> {
        self.run_lifecycle(|core| core.update())
    }

    /// Rebind `key` to `object` on a running service
    pub fn swap(&self, key: &str, object: DataObject) -> CoreResult<()> {
        let key = key.to_string();
        self.run_lifecycle(move |core| core.swap(&key, object))
    }

    /// Stop the service; a stopped service stays stopped
    pub fn stop(&self) -> CoreResult<()> {
        self.run_lifecycle(|core| core.stop())
    }

    pub fn destroy(&self) -> CoreResult<()> {
        self.run_lifecycle(|core| core.destroy())
    }

    /// [`start`](Self::start) without waiting
    pub fn async_start(&self) -> TaskHandle<CoreResult<()>> {
        self.post_lifecycle(|core| core.start())
    }

    pub fn async_update(&self) -> TaskHandle<CoreResult<()>> {
        self.post_lifecycle(|core| core.update())
    }

    pub fn async_swap(&self, key: &str, object: DataObject) -> TaskHandle<CoreResult<()>> {
        let key = key.to_string();
        self.post_lifecycle(move |core| core.swap(&key, object))
    }

    pub fn async_stop(&self) -> TaskHandle<CoreResult<()>> {
        self.post_lifecycle(|core| core.stop())
    }

    /// Receive every future state transition of this service
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.core.machine.subscribe()
    }

    pub fn signals(&self) -> &Signals {
        &self.core.signals
    }

    pub fn slots(&self) -> &Slots {
        &self.core.slots
    }

    pub fn signal<A: Clone + Send + 'static>(&self, name: &str) -> CoreResult<Signal<A>> {
        self.core.signals.get(name)
    }

    pub fn slot<A: Clone + Send + 'static>(&self, name: &str) -> CoreResult<Slot<A>> {
        self.core.slots.get(name)
    }

    pub fn auto_connections(&self) -> &KeyConnections {
        &self.core.auto_table
    }

    /// Number of auto-connections currently established
    pub fn active_auto_connections(&self) -> usize {
        self.core.auto_links.lock().len()
    }

    fn run_lifecycle<F>(&self, operation: F) -> CoreResult<()>
    where
        F: FnOnce(&Arc<ServiceCore>) -> CoreResult<()> + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        match self.core.worker() {
            Some(worker) => worker.post_and_wait(move || operation(&core))?,
            None => operation(&core),
        }
    }

    fn post_lifecycle<F>(&self, operation: F) -> TaskHandle<CoreResult<()>>
    where
        F: FnOnce(&Arc<ServiceCore>) -> CoreResult<()> + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        match self.core.worker() {
            Some(worker) => worker.post(move || operation(&core)),
            None => TaskHandle::ready(operation(&core)),
        }
    }
}

impl PartialEq for ServiceHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for ServiceHandle {}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.core.id)
            .field("uid", &self.core.uid)
            .field("type", &self.core.type_name)
            .field("state", &self.state())
            .finish()
    }
}
