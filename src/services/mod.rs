//! Services module - stateful units with a fixed lifecycle.
//!
//! A service mediates between shared [`DataObject`](crate::data::DataObject)s
//! and reactions. It owns slots, declares signals, and holds keyed references
//! to the objects it works on.
//!
//! # Components
//!
//! - [`Service`]: the hooks a service implements (`configuring`, `starting`,
//!   `updating`, `swapping`, `stopping`) and its auto-connection table
//! - [`ServiceBuilder`]: assembles a service value with its slots and signals
//!   into a [`ServiceHandle`]
//! - [`ServiceHandle`]: the lifecycle entry points (`configure`, `start`,
//!   `update`, `swap`, `stop`, `destroy`) and object binding
//! - [`ObjectServiceRegistry`]: which services are bound to which objects
//! - [`ServiceFactory`] / [`FactoryRegistry`]: creation by type name
//! - [`AppManager`]: composes objects, services, workers and channels from
//!   configuration, and forwards service outputs to the services awaiting them
//!
//! # Lifecycle
//!
//! ```text
//! Created --configure--> Configured --start--> Started --stop--> Stopped --destroy--> Destroyed
//!                                                 |  ^              |
//!                                       update/swap  |              +--configure/start--> ...
//! ```
//!
//! Illegal calls fail with [`CoreError::InvalidState`](crate::error::CoreError::InvalidState)
//! and leave the service unchanged.
//!
//! # Usage Example
//!
//! ```ignore
//! use slotwork::services::{KeyConnections, Service, ServiceBuilder, ServiceContext};
//!
//! struct Threshold;
//!
//! impl Service for Threshold {
//!     fn updating(&mut self, ctx: &ServiceContext<'_>) -> anyhow::Result<()> {
//!         let image = ctx.object("image")?;
//!         // recompute from the image ...
//!         Ok(())
//!     }
//!
//!     fn auto_connections(&self) -> KeyConnections {
//!         KeyConnections::new().with("image", "modified", "update")
//!     }
//! }
//!
//! let service = ServiceBuilder::new("threshold", Threshold).build();
//! service.bind("image", &image)?;
//! service.start()?;
//! ```

pub mod app;
pub mod factory;
pub mod registry;
pub mod service;

pub use app::AppManager;
pub use factory::{FactoryRegistry, FnFactory, ServiceFactory};
pub use registry::{ObjectServiceRegistry, default_registry};
pub use service::{
    AutoConnectionBlocker, BindOptions, KeyConnection, KeyConnections, OUTPUT_SIG, STARTED_SIG,
    START_SLOT, STOP_SLOT, STOPPED_SIG, SWAPPED_SIG, Service, ServiceBuilder, ServiceContext,
    ServiceHandle, UPDATE_SLOT, UPDATED_SIG,
};
