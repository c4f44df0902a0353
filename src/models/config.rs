use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// How a service uses an object bound to one of its keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    /// Read only; held weakly
    Input,
    /// Read and written; held weakly
    #[default]
    #[serde(alias = "in_out")]
    InOut,
    /// Produced by the service, which owns it
    Output,
}

/// Process-level settings loaded from `slotwork.yaml` and `SLOTWORK__*` variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreSettings {
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Worker used by services configured without an explicit worker name
    #[serde(default = "default_worker_name")]
    pub default_worker: String,

    /// Services without an explicit worker run on `default_worker` instead of
    /// on their caller's thread
    #[serde(default)]
    pub use_default_worker: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings::default(),
            default_worker: default_worker_name(),
            use_default_worker: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_prefix: default_log_prefix(),
            debug: false,
            console: false,
        }
    }
}

fn default_worker_name() -> String {
    crate::worker::registry::DEFAULT_WORKER.to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_prefix() -> String {
    "slotwork".to_string()
}

fn default_true() -> bool {
    true
}

/// One object a service expects under one of its keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectConfig {
    /// Key the service refers to the object by
    pub key: String,

    /// Application-wide identifier of the object
    pub uid: String,

    #[serde(default)]
    pub access: AccessType,

    /// Whether the service's auto-connections apply to this key
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// An optional object may be absent when the service starts
    #[serde(default)]
    pub optional: bool,
}

impl ObjectConfig {
    pub fn new(key: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            uid: uid.into(),
            access: AccessType::default(),
            auto_connect: true,
            optional: false,
        }
    }

    pub fn access(mut self, access: AccessType) -> Self {
        self.access = access;
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Produced by the service rather than handed to it
    pub fn is_output(&self) -> bool {
        self.access == AccessType::Output
    }
}

/// Declarative description of one service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub uid: String,

    /// Factory key the service is created from
    #[serde(rename = "type")]
    pub type_name: String,

    /// Name of the worker the service runs on
    #[serde(default)]
    pub worker: Option<String>,

    /// Start as soon as every required object is present
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Call `update` right after an automatic start
    #[serde(default)]
    pub auto_update: bool,

    #[serde(default)]
    pub objects: Vec<ObjectConfig>,

    /// Free-form key/value parameters handed to `configuring`
    #[serde(default)]
    pub params: IndexMap<String, String>,
}

impl ServiceConfig {
    pub fn new(uid: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            type_name: type_name.into(),
            worker: None,
            auto_start: true,
            auto_update: false,
            objects: Vec::new(),
            params: IndexMap::new(),
        }
    }

    pub fn worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn object(mut self, object: ObjectConfig) -> Self {
        self.objects.push(object);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn auto_update(mut self, auto_update: bool) -> Self {
        self.auto_update = auto_update;
        self
    }

    /// Objects that must be present before the service can start
    pub fn required_objects(&self) -> impl Iterator<Item = &ObjectConfig> {
        self.objects
            .iter()
            .filter(|object| !object.optional && !object.is_output())
    }

    /// Entries through which the service consumes the object `uid`
    pub fn objects_with_uid<'a>(
        &'a self,
        uid: &'a str,
    ) -> impl Iterator<Item = &'a ObjectConfig> {
        self.objects
            .iter()
            .filter(move |object| object.uid == uid && !object.is_output())
    }

    /// Application uid under which the output `key` is published
    pub fn output_uid(&self, key: &str) -> Option<&str> {
        self.objects
            .iter()
            .find(|object| object.key == key && object.is_output())
            .map(|object| object.uid.as_str())
    }
}

/// One end of a channel: a named signal or slot of a service or object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEndpoint {
    /// Uid of a service, or of an object for signal ends
    pub uid: String,

    /// Signal or slot name
    pub name: String,
}

impl ChannelEndpoint {
    pub fn new(uid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
        }
    }
}

/// Named channel: every signal on it drives every slot on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel: String,

    #[serde(default)]
    pub signals: Vec<ChannelEndpoint>,

    #[serde(default)]
    pub slots: Vec<ChannelEndpoint>,
}

impl ChannelConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            signals: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn signal(mut self, uid: impl Into<String>, name: impl Into<String>) -> Self {
        self.signals.push(ChannelEndpoint::new(uid, name));
        self
    }

    pub fn slot(mut self, uid: impl Into<String>, name: impl Into<String>) -> Self {
        self.slots.push(ChannelEndpoint::new(uid, name));
        self
    }
}

/// Application composition: workers and services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Workers created up front, in addition to those named by services
    #[serde(default)]
    pub workers: Vec<String>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Signal/slot channels between services and objects
    #[serde(default)]
    pub connections: Vec<ChannelConfig>,
}
