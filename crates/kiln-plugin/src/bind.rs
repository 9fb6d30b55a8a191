//! Host-directory volumes.
//!
//! Each volume is either a directory the driver creates under its root and deletes
//! on removal, or, with the `source` setting, an existing host path that is bound
//! as is and never deleted.
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use kiln_core::runtime::{HostConfig, MountConfig, MountKind};
use kiln_core::{CoreError, Volume, VolumeDriver};
use kiln_model::Mount;
use tracing::{debug, info, warn};

use crate::error::PluginError;

/// Setting naming an existing host path to bind instead of a managed directory.
pub const SOURCE_SETTING: &str = "source";

pub struct BindVolumeDriver {
    root: PathBuf,
    /// Managed directories by volume name.
    managed: Mutex<HashMap<String, PathBuf>>,
}

impl BindVolumeDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            managed: Mutex::new(HashMap::new()),
        }
    }

    /// Directory a managed volume named `name` lives in.
    pub fn path_of(&self, name: &str) -> Result<PathBuf, PluginError> {
        let relative = Path::new(name);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !clean {
            return Err(PluginError::InvalidSettings(format!("bad volume name {name:?}")));
        }
        Ok(self.root.join(relative))
    }

    fn managed(&self) -> std::sync::MutexGuard<'_, HashMap<String, PathBuf>> {
        self.managed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct BindVolume {
    path: PathBuf,
}

impl Volume for BindVolume {
    fn configure(&self, mount: &Mount, host: &mut HostConfig) -> Result<(), CoreError> {
        host.mounts.push(MountConfig {
            kind: MountKind::Bind,
            source: self.path.to_string_lossy().into_owned(),
            target: mount.target.clone(),
            read_only: mount.is_read_only(),
            driver: None,
            driver_options: BTreeMap::new(),
        });
        Ok(())
    }
}

#[async_trait]
impl VolumeDriver for BindVolumeDriver {
    async fn create_volume(
        &self,
        name: &str,
        settings: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Volume>, CoreError> {
        if let Some(source) = settings.get(SOURCE_SETTING) {
            let path = PathBuf::from(source);
            if !path.is_absolute() {
                return Err(PluginError::InvalidSettings(format!("source {source} must be absolute")).into());
            }
            if !tokio::fs::try_exists(&path).await.map_err(PluginError::from)? {
                return Err(PluginError::InvalidSettings(format!("source {source} does not exist")).into());
            }
            debug!(target: "kiln.plugin.bind", volume = name, source = %path.display(), "binding host path");
            return Ok(Box::new(BindVolume { path }));
        }

        let path = self.path_of(name)?;
        tokio::fs::create_dir_all(&path).await.map_err(PluginError::from)?;
        self.managed().insert(name.to_string(), path.clone());

        info!(target: "kiln.plugin.bind", volume = name, path = %path.display(), "volume created");
        Ok(Box::new(BindVolume { path }))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), CoreError> {
        // Volumes rebuilt after a restart were never recorded; fall back to the naming scheme.
        let path = match self.managed().remove(name) {
            Some(path) => path,
            None => self.path_of(name)?,
        };

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(target: "kiln.plugin.bind", volume = name, "volume removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: "kiln.plugin.bind", volume = name, "volume already gone");
                Ok(())
            }
            Err(e) => {
                warn!(target: "kiln.plugin.bind", volume = name, error = %e, "failed to remove volume");
                Err(PluginError::from(e).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_model::MountMode;
    use uuid::Uuid;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("kiln-bind-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn managed_volume_lifecycle() {
        let root = temp_root();
        let driver = BindVolumeDriver::new(&root);

        let volume = driver.create_volume("task-1/data", &BTreeMap::new()).await.unwrap();
        let path = root.join("task-1/data");
        assert!(path.is_dir());

        let mut host = HostConfig::default();
        volume
            .configure(&Mount::new("task-1/data", "/data", MountMode::ReadOnly), &mut host)
            .unwrap();
        assert_eq!(host.mounts[0].kind, MountKind::Bind);
        assert_eq!(host.mounts[0].source, path.to_string_lossy());
        assert!(host.mounts[0].read_only);

        driver.remove_volume("task-1/data").await.unwrap();
        assert!(!path.exists());
        driver.remove_volume("task-1/data").await.unwrap();

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn source_setting_binds_existing_path_without_owning_it() {
        let root = temp_root();
        let source = temp_root();
        std::fs::create_dir_all(&source).unwrap();
        let driver = BindVolumeDriver::new(&root);

        let mut settings = BTreeMap::new();
        settings.insert(SOURCE_SETTING.to_string(), source.to_string_lossy().into_owned());
        let volume = driver.create_volume("task-1/shared", &settings).await.unwrap();

        let mut host = HostConfig::default();
        volume
            .configure(&Mount::new("task-1/shared", "/shared", MountMode::ReadWrite), &mut host)
            .unwrap();
        assert_eq!(host.mounts[0].source, source.to_string_lossy());

        driver.remove_volume("task-1/shared").await.unwrap();
        assert!(source.is_dir());

        let _ = std::fs::remove_dir_all(&source);
    }

    #[tokio::test]
    async fn escaping_names_are_rejected() {
        let driver = BindVolumeDriver::new(temp_root());
        for name in ["../etc", "/abs", "", "a/../../b"] {
            let err = driver.create_volume(name, &BTreeMap::new()).await.err().unwrap();
            assert!(matches!(err, CoreError::Config(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn relative_source_is_rejected() {
        let driver = BindVolumeDriver::new(temp_root());
        let mut settings = BTreeMap::new();
        settings.insert(SOURCE_SETTING.to_string(), "relative/path".to_string());
        assert!(driver.create_volume("t/v", &settings).await.is_err());
    }
}
