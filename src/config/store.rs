use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::discovery::{CameraCredentials, CameraSettings};
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads, so hot paths (probe fan-out,
/// camera resolution) never contend with writers.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the store, writing defaults if the file does not exist yet
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = Self::load_config(path).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache,
            change_tx,
        })
    }

    /// In-memory store, nothing is persisted
    pub fn in_memory(config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: PathBuf::new(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    async fn load_config(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, writing defaults", path.display());
                let config = AppConfig::default();
                Self::save_config_to_file(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_config_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Ok(());
        }
        let json = serde_json::to_string_pretty(config)?;
        // Temp file, then rename over the old config
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Set entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        Self::save_config_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; for concurrent updates the last write wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        // Persist first, then swap the cache
        Self::save_config_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CameraSettings for ConfigStore {
    fn credentials(&self) -> CameraCredentials {
        let config = self.get();
        CameraCredentials::new(&config.camera.username, &config.camera.password)
    }

    fn default_ip(&self) -> String {
        self.get().camera.ip.clone()
    }

    fn rtsp_port(&self) -> u16 {
        self.get().camera.rtsp_port
    }

    fn preferred_ips(&self) -> Vec<String> {
        self.get().discovery.preferred_ips.clone()
    }

    fn auto_discovery_enabled(&self) -> bool {
        self.get().discovery.auto_discovery
    }

    fn scan_interval_minutes(&self) -> u32 {
        self.get().discovery.scan_interval_minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::new(&path).await.unwrap();
        assert!(path.exists());

        let config = store.get();
        assert_eq!(config.server.port, 8082);
        assert!(config.discovery.auto_discovery);

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.server.port = 9000;
                c.discovery.preferred_ips = vec!["10.0.0.9".to_string()];
            })
            .await
            .unwrap();
        assert_eq!(changes.recv().await.unwrap().key, "app_config");

        let config = store.get();
        assert_eq!(config.server.port, 9000);

        // New instance reads the persisted file
        let store2 = ConfigStore::new(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.server.port, 9000);
        assert_eq!(store2.preferred_ips(), vec!["10.0.0.9".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        match ConfigStore::new(&path).await {
            Err(AppError::Config(_)) => {}
            other => panic!("expected config error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_camera_settings() {
        let mut config = AppConfig::default();
        config.camera.username = "viewer".to_string();
        config.camera.password = "secret".to_string();
        config.discovery.auto_discovery = false;
        let store = ConfigStore::in_memory(config);

        let creds = store.credentials();
        assert_eq!(creds.username, "viewer");
        assert_eq!(creds.password, "secret");
        assert!(!store.auto_discovery_enabled());
        assert_eq!(store.scan_interval_minutes(), 5);
        assert_eq!(store.default_ip(), "192.168.8.5");
    }
}
