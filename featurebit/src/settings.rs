use crate::error::FeatureStoreError;
use crate::info;
use crate::logger::{self, Level};
use crate::online_store::{InMemoryOnlineStore, OnlineStore, RedbOnlineStore};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OnlineStoreSettings {
    Memory,
    Redb {
        path: String,
        #[serde(default = "default_cache_size_mb")]
        cache_size_mb: usize,
    },
}

impl Default for OnlineStoreSettings {
    fn default() -> Self {
        OnlineStoreSettings::Memory
    }
}

fn default_cache_size_mb() -> usize {
    64
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub queue_capacity: usize,
    /// 1 disables retries.
    pub write_attempts: usize,
    pub retry_delay_ms: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self { enabled: true, queue_capacity: 1024, write_attempts: 1, retry_delay_ms: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub enable: bool,
    pub bind_address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { enable: false, bind_address: "127.0.0.1:6566".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub online_store: OnlineStoreSettings,
    pub persistence: PersistenceSettings,
    pub server: ServerSettings,
    pub log_level: Level,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            online_store: OnlineStoreSettings::default(),
            persistence: PersistenceSettings::default(),
            server: ServerSettings::default(),
            log_level: Level::Info,
        }
    }
}

impl Settings {
    /// Defaults, overridden by the optional file at `path`, overridden by `FEATUREBIT__*` env vars.
    pub fn load(path: Option<&str>) -> Result<Settings, FeatureStoreError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let builder = builder.add_source(Environment::with_prefix("FEATUREBIT").prefix_separator("__").separator("__").try_parsing(true));
        let settings = builder.build()?.try_deserialize::<Settings>()?;
        logger::set_max_level(settings.log_level);
        info!("{:#?}", settings);
        Ok(settings)
    }

    pub fn build_online_store(&self) -> Result<Arc<dyn OnlineStore>, FeatureStoreError> {
        match &self.online_store {
            OnlineStoreSettings::Memory => Ok(Arc::new(InMemoryOnlineStore::new())),
            OnlineStoreSettings::Redb { path, cache_size_mb } => Ok(Arc::new(RedbOnlineStore::create(path, *cache_size_mb)?)),
        }
    }
}

#[cfg(test)]
mod settings_tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Mutex, MutexGuard};

    // settings loads read process wide env vars
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settings_file(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("featurebit_settings_{}", rand::random::<u64>()));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("settings.toml");
        fs::write(&path, contents).expect("write");
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let _env = env_lock();
        let settings = Settings::load(Some("/nonexistent/featurebit_settings")).expect("settings");
        assert_eq!(settings.online_store, OnlineStoreSettings::Memory);
        assert_eq!(settings.persistence, PersistenceSettings::default());
        assert!(!settings.server.enable);
    }

    #[test]
    fn file_overrides_defaults() {
        let _env = env_lock();
        let path = settings_file(
            r#"
log_level = "warn"

[online_store]
type = "redb"
path = "/tmp/online.redb"

[persistence]
queue_capacity = 16
write_attempts = 3
"#,
        );
        let settings = Settings::load(path.to_str()).expect("settings");
        assert_eq!(settings.online_store, OnlineStoreSettings::Redb { path: "/tmp/online.redb".into(), cache_size_mb: 64 });
        assert_eq!(settings.persistence.queue_capacity, 16);
        assert_eq!(settings.persistence.write_attempts, 3);
        assert!(settings.persistence.enabled);
        assert_eq!(settings.log_level, Level::Warn);
        logger::set_max_level(Level::Info);
    }

    #[test]
    fn env_overrides_file() {
        let _env = env_lock();
        let path = settings_file(
            r#"
[online_store]
type = "memory"

[persistence]
queue_capacity = 16
"#,
        );
        let vars = [
            ("FEATUREBIT__PERSISTENCE__QUEUE_CAPACITY", "7"),
            ("FEATUREBIT__ONLINE_STORE__TYPE", "redb"),
            ("FEATUREBIT__ONLINE_STORE__PATH", "/tmp/env_online.redb"),
            ("FEATUREBIT__ONLINE_STORE__CACHE_SIZE_MB", "8"),
            ("FEATUREBIT__SERVER__ENABLE", "true"),
        ];
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
        let loaded = Settings::load(path.to_str());
        for (key, _) in vars {
            std::env::remove_var(key);
        }
        let settings = loaded.expect("settings");
        assert_eq!(settings.persistence.queue_capacity, 7);
        assert_eq!(settings.online_store, OnlineStoreSettings::Redb { path: "/tmp/env_online.redb".into(), cache_size_mb: 8 });
        assert!(settings.server.enable);
        assert_eq!(settings.server.bind_address, "127.0.0.1:6566");
    }
}
