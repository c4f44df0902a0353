// Application composition
//
// AppManager is the top-level composition point: it owns the object-service
// registry, the factory table, the named workers, the application's data
// objects, its services and its channels. Services are created from
// ServiceConfig entries, bound to objects by uid as those objects appear,
// and started once every object they require is present. Objects a service
// publishes as outputs are fed back in under their configured uid. Channels
// link named signals to named slots across services and objects, and are
// kept in step with which endpoints exist and which services run.

use super::factory::FactoryRegistry;
use super::registry::ObjectServiceRegistry;
use super::service::{BindOptions, OUTPUT_SIG, ServiceHandle};
use crate::com::{AnySignal, AnySlot, Connection, Slot};
use crate::data::DataObject;
use crate::error::{CoreError, CoreResult};
use crate::models::{AppConfig, ChannelConfig, ChannelEndpoint, CoreSettings, ServiceConfig};
use crate::models::{SignalId, SlotId};
use crate::state::ServiceState;
use crate::worker::Worker;
use crate::worker::registry::WorkerRegistry;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Output announcements not yet handled: (service uid, output key)
type OutputInbox = Arc<Mutex<Vec<(String, String)>>>;

struct ManagedService {
    handle: ServiceHandle,
    config: ServiceConfig,
    /// Connected to the service's `output_changed` signal
    _output_listener: Slot<String>,
}

struct ChannelLink {
    /// (signal index, slot index) in the channel's configuration
    pair: (usize, usize),
    signal: SignalId,
    slot: SlotId,
    connection: Connection,
}

struct ChannelState {
    config: ChannelConfig,
    links: Vec<ChannelLink>,
}

impl ChannelState {
    fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            links: Vec::new(),
        }
    }

    /// Connect every resolvable signal/slot pair and drop links whose
    /// endpoints are gone, replaced or no longer running
    fn refresh(
        &mut self,
        services: &IndexMap<String, ManagedService>,
        objects: &IndexMap<String, DataObject>,
    ) -> CoreResult<()> {
        let mut wanted = Vec::new();
        for (i, signal_end) in self.config.signals.iter().enumerate() {
            let Some(signal) = resolve_signal(&self.config.channel, signal_end, services, objects)
            else {
                continue;
            };
            for (j, slot_end) in self.config.slots.iter().enumerate() {
                if let Some(slot) = resolve_slot(&self.config.channel, slot_end, services) {
                    wanted.push(((i, j), Arc::clone(&signal), slot));
                }
            }
        }

        let channel = &self.config.channel;
        self.links.retain(|link| {
            let keep = link.connection.is_connected()
                && wanted.iter().any(|(pair, signal, slot)| {
                    *pair == link.pair && signal.id() == link.signal && slot.id() == link.slot
                });
            if !keep {
                link.connection.disconnect();
                tracing::debug!(
                    "Channel '{}': dropped {} -> {}",
                    channel,
                    link.connection.signal_name(),
                    link.connection.slot_name()
                );
            }
            keep
        });

        for (pair, signal, slot) in wanted {
            if self.links.iter().any(|link| link.pair == pair) {
                continue;
            }
            let connection = signal.connect_slot(slot.as_ref())?;
            tracing::debug!(
                "Channel '{}': connected {} -> {}",
                self.config.channel,
                signal.name(),
                slot.name()
            );
            self.links.push(ChannelLink {
                pair,
                signal: signal.id(),
                slot: slot.id(),
                connection,
            });
        }
        Ok(())
    }

    fn disconnect_all(&mut self) {
        for link in self.links.drain(..) {
            link.connection.disconnect();
        }
    }
}

/// A signal end may be a service or an object; services win on a uid clash
fn resolve_signal(
    channel: &str,
    endpoint: &ChannelEndpoint,
    services: &IndexMap<String, ManagedService>,
    objects: &IndexMap<String, DataObject>,
) -> Option<Arc<dyn AnySignal>> {
    let signals = match services.get(&endpoint.uid) {
        Some(managed) => managed.handle.signals(),
        None => objects.get(&endpoint.uid)?.signals(),
    };
    signals
        .get_any(&endpoint.name)
        .inspect_err(|err| tracing::warn!("Channel '{}': {}", channel, err))
        .ok()
}

/// A slot end is only live while its service runs
fn resolve_slot(
    channel: &str,
    endpoint: &ChannelEndpoint,
    services: &IndexMap<String, ManagedService>,
) -> Option<Arc<dyn AnySlot>> {
    let managed = services.get(&endpoint.uid)?;
    if !managed.handle.is_started() {
        return None;
    }
    managed
        .handle
        .slots()
        .get_any(&endpoint.name)
        .inspect_err(|err| tracing::warn!("Channel '{}': {}", channel, err))
        .ok()
}

/// Owns and drives the services and objects of one application
pub struct AppManager {
    registry: ObjectServiceRegistry,
    factories: FactoryRegistry,
    workers: WorkerRegistry,
    settings: CoreSettings,
    objects: IndexMap<String, DataObject>,
    services: IndexMap<String, ManagedService>,
    channels: IndexMap<String, ChannelState>,
    outputs: OutputInbox,
    start_order: Vec<String>,
}

impl AppManager {
    /// Manager with its own registry and default settings
    pub fn new(factories: FactoryRegistry) -> Self {
        Self::with_settings(factories, CoreSettings::default())
    }

    pub fn with_settings(factories: FactoryRegistry, settings: CoreSettings) -> Self {
        Self {
            registry: ObjectServiceRegistry::new(),
            factories,
            workers: WorkerRegistry::new(),
            settings,
            objects: IndexMap::new(),
            services: IndexMap::new(),
            channels: IndexMap::new(),
            outputs: Arc::new(Mutex::new(Vec::new())),
            start_order: Vec::new(),
        }
    }

    /// Create the workers, services and channels an [`AppConfig`] describes
    pub fn load(&mut self, config: &AppConfig) -> CoreResult<()> {
        for name in &config.workers {
            self.workers.get_or_create(name)?;
        }
        for service in &config.services {
            self.add_service(service.clone())?;
        }
        for channel in &config.connections {
            self.add_channel(channel.clone())?;
        }

        tracing::info!(
            "Loaded application: {} workers, {} services, {} channels",
            config.workers.len(),
            config.services.len(),
            config.connections.len()
        );
        Ok(())
    }

    /// Create, place and configure a service, then bind the objects it
    /// references that are already present
    pub fn add_service(&mut self, config: ServiceConfig) -> CoreResult<ServiceHandle> {
        if self.services.contains_key(&config.uid) {
            return Err(CoreError::DuplicateId(config.uid));
        }

        let handle = self
            .factories
            .create(&config.type_name, &config.uid, &self.registry)?;

        if let Some(worker) = self.worker_for(&config)? {
            tracing::debug!("Service '{}' runs on worker '{}'", config.uid, worker.name());
            handle.set_worker(Some(worker));
        }

        handle.configure(&config)?;

        let inputs = config.objects.iter().filter(|object| !object.is_output());
        for object_config in inputs {
            if let Some(object) = self.objects.get(&object_config.uid) {
                handle.bind_with(&object_config.key, object, BindOptions::from(object_config))?;
            }
        }

        let inbox = Arc::clone(&self.outputs);
        let owner = config.uid.clone();
        let output_listener = Slot::new("output_listener", move |key: String| {
            inbox.lock().push((owner.clone(), key));
        });
        handle.signal::<String>(OUTPUT_SIG)?.connect(&output_listener)?;

        tracing::info!("Added service '{}' ({})", config.uid, config.type_name);
        self.services.insert(
            config.uid.clone(),
            ManagedService {
                handle: handle.clone(),
                config,
                _output_listener: output_listener,
            },
        );
        self.refresh_channels()?;
        Ok(handle)
    }

    /// Declare a channel; its links follow the application from then on
    pub fn add_channel(&mut self, config: ChannelConfig) -> CoreResult<()> {
        if self.channels.contains_key(&config.channel) {
            return Err(CoreError::DuplicateId(config.channel));
        }
        tracing::info!(
            "Added channel '{}' ({} signals, {} slots)",
            config.channel,
            config.signals.len(),
            config.slots.len()
        );
        self.channels
            .insert(config.channel.clone(), ChannelState::new(config));
        self.refresh_channels()
    }

    /// Disconnect and forget a channel; false if it was never declared
    pub fn remove_channel(&mut self, channel: &str) -> bool {
        match self.channels.shift_remove(channel) {
            Some(mut state) => {
                state.disconnect_all();
                tracing::info!("Removed channel '{}'", channel);
                true
            }
            None => false,
        }
    }

    /// Bring every channel's links in line with the current services and objects
    ///
    /// Called by the manager after each change it makes. Call it after
    /// stopping or starting services directly through their handles.
    pub fn refresh_channels(&mut self) -> CoreResult<()> {
        for state in self.channels.values_mut() {
            state.refresh(&self.services, &self.objects)?;
        }
        Ok(())
    }

    /// Publish `object` under `uid`
    ///
    /// Every service referencing the uid gets the object: stopped services
    /// bind it, running services swap it in. Auto-start services whose
    /// required objects are now all present are started.
    pub fn add_object(&mut self, uid: &str, object: DataObject) -> CoreResult<()> {
        self.insert_object(uid, object)?;
        self.start_ready()?;
        self.process_outputs()?;
        Ok(())
    }

    /// Withdraw the object published under `uid`
    ///
    /// Running services that require it are stopped and become pending
    /// again; the object is unbound from every service that can unbind.
    pub fn remove_object(&mut self, uid: &str) -> CoreResult<Option<DataObject>> {
        let removed = self.withdraw_object(uid)?;
        self.process_outputs()?;
        Ok(removed)
    }

    /// Publish or withdraw the outputs services announced since the last call
    ///
    /// An output whose service configuration names an application uid is
    /// added under that uid, which may start the services waiting for it;
    /// a cleared output is removed again. Repeats until no announcement is
    /// left and returns how many were handled.
    pub fn process_outputs(&mut self) -> CoreResult<usize> {
        let mut handled = 0;
        loop {
            let pending = std::mem::take(&mut *self.outputs.lock());
            if pending.is_empty() {
                break;
            }

            for (service_uid, key) in pending {
                handled += 1;
                let Some(managed) = self.services.get(&service_uid) else {
                    continue;
                };
                let Some(uid) = managed.config.output_uid(&key).map(str::to_string) else {
                    tracing::debug!(
                        "Service '{}' output '{}' has no application uid",
                        service_uid,
                        key
                    );
                    continue;
                };

                match managed.handle.object(&key) {
                    Ok(object) => self.insert_object(&uid, object)?,
                    Err(_) => {
                        self.withdraw_object(&uid)?;
                    }
                }
            }
            self.start_ready()?;
        }

        self.refresh_channels()?;
        Ok(handled)
    }

    /// Start every auto-start service whose required objects are present
    ///
    /// Returns the number of services started. Services still waiting for
    /// objects stay pending and are started by a later
    /// [`add_object`](Self::add_object).
    pub fn start_services(&mut self) -> CoreResult<usize> {
        let started = self.start_ready()?;
        self.process_outputs()?;
        let pending = self.pending_services();
        if !pending.is_empty() {
            tracing::info!("Services waiting for objects: {}", pending.join(", "));
        }
        Ok(started)
    }

    /// Stop every service in reverse start order, destroy them, stop the workers
    ///
    /// Channels are torn down first. Keeps going after a failure and
    /// returns the first error.
    pub fn stop_and_destroy(&mut self) -> CoreResult<()> {
        for state in self.channels.values_mut() {
            state.disconnect_all();
        }

        let mut first_error = None;
        let mut record = |result: CoreResult<()>| {
            if let Err(err) = result {
                tracing::error!("{}", err);
                first_error.get_or_insert(err);
            }
        };

        for uid in self.start_order.drain(..).rev() {
            if let Some(managed) = self.services.get(&uid) {
                record(managed.handle.stop());
            }
        }

        for (uid, managed) in self.services.drain(..) {
            let handle = managed.handle;
            if handle.is_started() {
                record(handle.stop());
            }
            match handle.state() {
                ServiceState::Stopped => record(handle.destroy()),
                state => tracing::debug!("Dropping service '{}' ({})", uid, state),
            }
        }

        self.outputs.lock().clear();
        self.objects.clear();
        self.workers.stop_all();
        tracing::info!("Application stopped");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn service(&self, uid: &str) -> Option<&ServiceHandle> {
        self.services.get(uid).map(|managed| &managed.handle)
    }

    pub fn object(&self, uid: &str) -> Option<&DataObject> {
        self.objects.get(uid)
    }

    /// Service uids in the order they were added
    pub fn service_uids(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Channel names in the order they were declared
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Number of links currently established by `channel`
    pub fn channel_links(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |state| state.links.len())
    }

    /// Auto-start services that are not running yet
    pub fn pending_services(&self) -> Vec<String> {
        self.services
            .values()
            .filter(|managed| managed.config.auto_start && !managed.handle.is_started())
            .map(|managed| managed.config.uid.clone())
            .collect()
    }

    /// Uids of the running services in the order they were started
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    pub fn registry(&self) -> &ObjectServiceRegistry {
        &self.registry
    }

    pub fn factories(&self) -> &FactoryRegistry {
        &self.factories
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    fn worker_for(&self, config: &ServiceConfig) -> CoreResult<Option<Worker>> {
        match &config.worker {
            Some(name) => self.workers.get_or_create(name).map(Some),
            None if self.settings.use_default_worker => self
                .workers
                .get_or_create(&self.settings.default_worker)
                .map(Some),
            None => Ok(None),
        }
    }

    fn is_ready(&self, config: &ServiceConfig) -> bool {
        config
            .required_objects()
            .all(|object_config| self.objects.contains_key(&object_config.uid))
    }

    /// Record `object` under `uid` and hand it to every consumer
    fn insert_object(&mut self, uid: &str, object: DataObject) -> CoreResult<()> {
        match self.objects.insert(uid.to_string(), object.clone()) {
            Some(previous) if previous.ptr_eq(&object) => return Ok(()),
            Some(_) => tracing::info!("Replacing object '{}'", uid),
            None => tracing::info!("Added object '{}'", uid),
        }

        for managed in self.services.values() {
            for object_config in managed.config.objects_with_uid(uid) {
                let handle = &managed.handle;
                let state = handle.state();
                if state.is_bindable() {
                    let options = BindOptions::from(object_config);
                    handle.bind_with(&object_config.key, &object, options)?;
                } else if state == ServiceState::Started {
                    handle.swap(&object_config.key, object.clone())?;
                } else {
                    tracing::warn!(
                        "Service '{}' is {}, object '{}' not bound to '{}'",
                        handle.uid(),
                        state,
                        uid,
                        object_config.key
                    );
                }
            }
        }
        Ok(())
    }

    fn withdraw_object(&mut self, uid: &str) -> CoreResult<Option<DataObject>> {
        let Some(object) = self.objects.shift_remove(uid) else {
            return Ok(None);
        };

        for managed in self.services.values() {
            let handle = &managed.handle;
            let keys: Vec<_> = managed.config.objects_with_uid(uid).collect();
            if keys.is_empty() {
                continue;
            }

            if handle.is_started() && keys.iter().any(|object_config| !object_config.optional) {
                tracing::info!(
                    "Stopping service '{}': required object '{}' removed",
                    handle.uid(),
                    uid
                );
                handle.stop()?;
                self.start_order.retain(|started| started != handle.uid());
            }

            if handle.state().is_bindable() {
                for object_config in keys {
                    handle.unbind(&object_config.key)?;
                }
            }
        }

        tracing::info!("Removed object '{}'", uid);
        Ok(Some(object))
    }

    fn start_ready(&mut self) -> CoreResult<usize> {
        let ready: Vec<(ServiceHandle, bool)> = self
            .services
            .values()
            .filter(|managed| managed.config.auto_start)
            .filter(|managed| {
                let state = managed.handle.state();
                state.is_bindable() && state != ServiceState::Destroyed
            })
            .filter(|managed| self.is_ready(&managed.config))
            .map(|managed| (managed.handle.clone(), managed.config.auto_update))
            .collect();

        for (handle, auto_update) in &ready {
            handle.start()?;
            self.start_order.push(handle.uid().to_string());
            if *auto_update {
                handle.update()?;
            }
        }
        Ok(ready.len())
    }
}

impl Drop for AppManager {
    fn drop(&mut self) {
        if !self.start_order.is_empty() {
            tracing::warn!(
                "AppManager dropped with {} running services; stopping them",
                self.start_order.len()
            );
            if let Err(err) = self.stop_and_destroy() {
                tracing::error!("Failed to stop application cleanly: {}", err);
            }
        } else {
            for state in self.channels.values_mut() {
                state.disconnect_all();
            }
            self.workers.stop_all();
        }
    }
}

impl std::fmt::Debug for AppManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppManager")
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("start_order", &self.start_order)
            .finish()
    }
}
