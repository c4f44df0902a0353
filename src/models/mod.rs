//! Identifiers and configuration models.
//!
//! - [`ids`]: process-unique identifiers for workers, signals, slots,
//!   connections, services and data objects
//! - [`config`]: serde models for process settings ([`CoreSettings`]) and
//!   application composition ([`AppConfig`], [`ServiceConfig`], [`ObjectConfig`])

pub mod config;
pub mod ids;

pub use config::{
    AccessType, AppConfig, ChannelConfig, ChannelEndpoint, CoreSettings, LoggingSettings,
    ObjectConfig, ServiceConfig,
};
pub use ids::{ConnectionId, ObjectId, ServiceId, SignalId, SlotId, WorkerId};
