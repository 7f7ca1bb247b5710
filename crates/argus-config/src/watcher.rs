//! Hot reload of the access policy.
//!
//! The watcher observes the configuration file's directory, since editors
//! usually replace a file rather than write it in place. Events are
//! debounced; after the burst settles the file is loaded and validated in
//! full. A valid file publishes a new [`AccessPolicy`] into the shared cell,
//! an invalid one is logged and the running policy stays.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use argus_core::{ShutdownSignal, Versioned};
use argus_server::AccessPolicy;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::loader::ConfigLoader;

/// Default quiet period before a reload.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Reloads a configuration file into a [`Versioned<AccessPolicy>`].
pub struct ConfigWatcher {
    path: PathBuf,
    policy: Arc<Versioned<AccessPolicy>>,
    debounce: Duration,
    env_prefix: Option<String>,
}

impl ConfigWatcher {
    /// Watches `path` and publishes into `policy`.
    pub fn new(path: impl Into<PathBuf>, policy: Arc<Versioned<AccessPolicy>>) -> Self {
        Self {
            path: path.into(),
            policy,
            debounce: DEFAULT_DEBOUNCE,
            env_prefix: None,
        }
    }

    /// Sets the quiet period.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Applies environment overrides on every reload, as at startup.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self
    }

    /// The watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the file once and publishes the policy if it changed.
    ///
    /// Returns the new version, or `None` when the policy is unchanged.
    ///
    /// # Errors
    ///
    /// Returns the load or validation error; the cell is left alone.
    pub fn reload(&self) -> ConfigResult<Option<u64>> {
        let mut loader = ConfigLoader::new().with_file(&self.path)?;
        if let Some(prefix) = &self.env_prefix {
            loader = loader.with_env_prefix(prefix);
        }
        let policy = loader.load()?.access_policy();

        if *self.policy.load() == policy {
            debug!(path = %self.path.display(), "configuration reloaded, access policy unchanged");
            return Ok(None);
        }
        let version = self.policy.store(policy);
        info!(path = %self.path.display(), version, "access policy reloaded");
        Ok(Some(version))
    }

    /// Watches until `stop` triggers.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Watch` when the directory cannot be watched.
    pub async fn run(self, stop: ShutdownSignal) -> ConfigResult<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let file_name = self
            .path
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| ConfigError::watch(&self.path, "path has no file name"))?;

        let (tx, mut rx) = mpsc::channel::<()>(16);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else {
                return;
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                // A full channel already holds a pending reload.
                let _ = tx.try_send(());
            }
        })
        .map_err(|e| ConfigError::watch(&dir, e))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::watch(&dir, e))?;
        info!(path = %self.path.display(), "watching configuration");

        loop {
            tokio::select! {
                () = stop.wait() => break,
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    self.settle(&mut rx).await;
                    if let Err(e) = self.reload() {
                        warn!(path = %self.path.display(), error = %e, "invalid configuration ignored");
                    }
                }
            }
        }
        debug!(path = %self.path.display(), "configuration watcher stopped");
        Ok(())
    }

    async fn settle(&self, rx: &mut mpsc::Receiver<()>) {
        while let Ok(Some(())) = tokio::time::timeout(self.debounce, rx.recv()).await {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cell() -> Arc<Versioned<AccessPolicy>> {
        Arc::new(Versioned::new(AccessPolicy::default()))
    }

    #[test]
    fn test_reload_publishes_changed_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("argus.toml");
        fs::write(&path, "[cors]\nenabled = true\n").unwrap();

        let policy = cell();
        let watcher = ConfigWatcher::new(&path, Arc::clone(&policy));
        assert_eq!(watcher.reload().unwrap(), Some(1));
        assert!(policy.load().cors.enabled);

        assert_eq!(watcher.reload().unwrap(), None);
        assert_eq!(policy.version(), 1);
    }

    #[test]
    fn test_invalid_reload_keeps_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("argus.toml");
        fs::write(&path, "[auth]\nenabled = true\n").unwrap();

        let policy = cell();
        let watcher = ConfigWatcher::new(&path, Arc::clone(&policy));
        assert!(watcher.reload().is_err());
        assert_eq!(policy.version(), 0);
        assert!(!policy.load().auth.enabled);
    }

    #[tokio::test]
    async fn test_file_change_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("argus.toml");
        fs::write(&path, "").unwrap();

        let policy = cell();
        let stop = ShutdownSignal::new();
        let watcher = ConfigWatcher::new(&path, Arc::clone(&policy)).with_debounce(Duration::from_millis(50));
        let task = tokio::spawn(watcher.run(stop.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        fs::write(&path, "[auth]\nenabled = true\npassword = \"pw\"\n").unwrap();

        let reloaded = tokio::time::timeout(Duration::from_secs(5), async {
            while policy.version() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reloaded.is_ok());
        assert!(policy.load().auth.enabled);

        stop.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
