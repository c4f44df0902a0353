// slotwork - signal/slot messaging, worker affinity and service lifecycle
//
// This is the library crate: workers, typed signals and slots, shared data
// objects, and services with a fixed lifecycle composed by an AppManager.

pub mod com;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;
pub mod worker;

// Re-export commonly used types for convenience
pub use com::{Connection, ConnectionBlocker, DeliveryMode, Signal, Slot};
pub use config::ConfigManager;
pub use data::{DataObject, WeakObject};
pub use error::{CoreError, CoreResult};
pub use models::{
    AccessType, AppConfig, ChannelConfig, CoreSettings, ObjectConfig, ServiceConfig,
};
pub use services::{
    AppManager, BindOptions, FactoryRegistry, KeyConnections, ObjectServiceRegistry, Service,
    ServiceBuilder, ServiceContext, ServiceHandle,
};
pub use state::{Operation, ServiceState, StateChange};
pub use worker::{TaskHandle, Worker, WorkerRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
