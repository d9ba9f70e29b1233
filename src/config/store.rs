use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Reads go through an `ArcSwap` cache and never touch the disk.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the store at `path`, creating it with defaults if missing
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let config = Self::load_config(path).await?;
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    async fn load_config(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                debug!("Loaded config from {}", path.display());
                serde_json::from_str(&json).map_err(|e| {
                    AppError::Configuration(format!("{}: {}", path.display(), e))
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, writing defaults", path.display());
                let config = AppConfig::default();
                Self::save_config(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temp file so a crash never leaves a truncated config
    async fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        Self::save_config(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        self.notify("app_config");
        Ok(())
    }

    /// Read-modify-write; concurrent updates are last-write-wins
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);

        Self::save_config(&self.path, &config).await?;
        self.cache.store(Arc::new(config));
        self.notify("app_config");

        Ok(())
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn notify(&self, key: &str) {
        let _ = self.change_tx.send(ConfigChange {
            key: key.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("livecast.json");

        let store = ConfigStore::new(&path).await.unwrap();
        assert!(path.exists());

        let config = store.get();
        assert_eq!(config.camera.width, 1920);

        let mut rx = store.subscribe();
        store
            .update(|c| {
                c.camera.width = 1280;
                c.stream.key = "abc".to_string();
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().key, "app_config");
        assert_eq!(store.get().camera.width, 1280);

        // Persistence
        let store2 = ConfigStore::new(&path).await.unwrap();
        let config = store2.get();
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.stream.key, "abc");
    }

    #[tokio::test]
    async fn test_invalid_json_is_configuration_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = ConfigStore::new(&path).await.err().unwrap();
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
