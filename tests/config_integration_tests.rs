//! Integration tests for ConfigManager and configuration-driven composition
//!
//! These tests verify:
//! - Settings loading with file and environment layers
//! - Application file parsing, saving and validation
//! - Building a running application from a YAML description

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use slotwork::models::AccessType;
use slotwork::{
    AppManager, ConfigManager, CoreSettings, DataObject, FactoryRegistry, KeyConnections,
    Service, ServiceBuilder, ServiceConfig, ServiceContext, ServiceState, Signal,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn create_test_config_dir() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (temp_dir, config_path)
}

const VIEWER_APP: &str = r#"
workers:
  - io
services:
  - uid: reader
    type: Copier
    worker: io
    auto_update: true
    objects:
      - key: source
        uid: raw
        access: input
      - key: target
        uid: copy
  - uid: idle
    type: Copier
    auto_start: false
"#;

/// Copies the integer of `source` into `target` on every update
struct Copier {
    copies: Arc<Mutex<usize>>,
}

impl Service for Copier {
    fn configuring(
        &mut self,
        _ctx: &ServiceContext<'_>,
        config: &ServiceConfig,
    ) -> anyhow::Result<()> {
        if config.params.contains_key("fail") {
            anyhow::bail!("configuration rejected");
        }
        Ok(())
    }

    fn updating(&mut self, ctx: &ServiceContext<'_>) -> anyhow::Result<()> {
        let value = ctx.object("source")?.get::<i32>()?;
        let target = ctx.object("target")?;
        {
            let _blocked = ctx.block_auto_connections("target");
            target.set(value)?;
        }
        *self.copies.lock() += 1;
        Ok(())
    }

    fn auto_connections(&self) -> KeyConnections {
        KeyConnections::new().with("source", "changed", "update")
    }
}

fn copier_factories(copies: &Arc<Mutex<usize>>) -> FactoryRegistry {
    let copies = Arc::clone(copies);
    let mut factories = FactoryRegistry::new();
    factories
        .register_fn("Copier", move |uid, registry| {
            Ok(ServiceBuilder::new(
                uid,
                Copier {
                    copies: Arc::clone(&copies),
                },
            )
            .registry(registry.clone())
            .build())
        })
        .unwrap();
    factories
}

fn object_with_changed(name: &str, value: i32) -> DataObject {
    let object = DataObject::new(name, value);
    object.declare_signal(Signal::<()>::new("changed"));
    object
}

#[test]
fn test_create_config_manager() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    assert_eq!(manager.config_dir(), &config_path);
    assert_eq!(manager.settings_path().as_str(), config_path.join("slotwork.yaml").as_str());
}

#[test]
fn test_settings_file_is_read() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(
        config_path.join("slotwork.yaml"),
        "default_worker: main\nuse_default_worker: true\nlogging:\n  debug: true\n",
    )
    .unwrap();

    let manager = ConfigManager::new(&config_path).unwrap();
    let settings = manager.load_settings_from(Some(Default::default())).unwrap();

    assert_eq!(settings.default_worker, "main");
    assert!(settings.use_default_worker);
    assert!(settings.logging.debug);
    assert_eq!(settings.logging.log_prefix, "slotwork");
}

#[test]
fn test_malformed_settings_are_reported() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(config_path.join("slotwork.yaml"), "use_default_worker: [not, a, bool]\n").unwrap();

    let manager = ConfigManager::new(&config_path).unwrap();
    let err = manager.load_settings_from(Some(Default::default())).unwrap_err();
    assert!(err.to_string().contains("slotwork.yaml"));
}

#[test]
fn test_parse_app_config() {
    let app = ConfigManager::parse_app_config(VIEWER_APP).unwrap();

    assert_eq!(app.workers, vec!["io".to_string()]);
    assert_eq!(app.services.len(), 2);

    let reader = &app.services[0];
    assert_eq!(reader.type_name, "Copier");
    assert_eq!(reader.worker.as_deref(), Some("io"));
    assert!(reader.auto_start);
    assert!(reader.auto_update);
    assert_eq!(reader.objects[0].access, AccessType::Input);
    assert_eq!(reader.objects[1].access, AccessType::InOut);
    assert!(reader.objects[1].auto_connect);

    assert!(!app.services[1].auto_start);
}

#[test]
fn test_app_config_file_drives_app_manager() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(config_path.join("viewer.yaml"), VIEWER_APP).unwrap();
    let manager = ConfigManager::new(&config_path).unwrap();
    let app_config = manager.load_app_config("viewer.yaml").unwrap();

    let copies = Arc::new(Mutex::new(0));
    let mut app = AppManager::new(copier_factories(&copies));
    app.load(&app_config).unwrap();
    assert_eq!(app.workers().names(), vec!["io".to_string()]);
    assert_eq!(app.start_services().unwrap(), 0);

    let raw = object_with_changed("raw", 41);
    let copy = object_with_changed("copy", 0);
    app.add_object("raw", raw.clone()).unwrap();
    assert_eq!(app.pending_services(), vec!["reader".to_string()]);
    app.add_object("copy", copy.clone()).unwrap();

    let reader = app.service("reader").unwrap().clone();
    assert_eq!(reader.state(), ServiceState::Started);
    assert_eq!(copy.get::<i32>().unwrap(), 41);

    // input changes reach the reader on its worker
    raw.set(5_i32).unwrap();
    raw.signal::<()>("changed").unwrap().notify(());
    let worker = reader.worker().unwrap();
    worker.post(|| ()).wait().unwrap();
    assert_eq!(copy.get::<i32>().unwrap(), 5);
    assert_eq!(*copies.lock(), 2);

    assert_eq!(app.service("idle").unwrap().state(), ServiceState::Configured);
    app.stop_and_destroy().unwrap();
    assert_eq!(reader.state(), ServiceState::Destroyed);
    assert!(app.registry().is_empty());
}

#[test]
fn test_failed_configuration_is_reported() {
    let copies = Arc::new(Mutex::new(0));
    let mut app = AppManager::with_settings(copier_factories(&copies), CoreSettings::default());

    let err = app
        .add_service(ServiceConfig::new("broken", "Copier").param("fail", "yes"))
        .unwrap_err();
    assert!(err.to_string().contains("configuration rejected"));
    assert!(app.service("broken").is_none());
}

#[test]
fn test_app_config_round_trip() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    let app = ConfigManager::parse_app_config(VIEWER_APP).unwrap();
    manager.save_app_config("copy.yaml", &app).unwrap();
    let reloaded = manager.load_app_config("copy.yaml").unwrap();
    assert_eq!(reloaded, app);
}
