//! Plugin Host (§4.8): lifecycle of external subprocess plugins over a
//! newline-delimited JSON wire protocol.
//!
//! Grounded in the teacher's `sync/manager.rs` external-peer
//! supervision pattern (registry behind an RW-lock, per-instance state
//! behind its own lock, explicit lock-release-before-spawn discipline
//! to avoid the deadlock the spec calls out for Enable/Disable).

pub mod install;
pub mod manifest;
pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::error::PluginError;
use crate::hub::OutgoingFrame;
use crate::metrics;
use manifest::PluginManifest;
use process::{PluginProcess, PluginRequest};

pub use manifest::validate_plugin_name;

struct PluginInstance {
    manifest: PluginManifest,
    dir: PathBuf,
    enabled: bool,
    process: Option<PluginProcess>,
}

#[derive(Clone)]
pub struct PluginHost {
    registry: Arc<RwLock<HashMap<String, Arc<Mutex<PluginInstance>>>>>,
    plugin_dir: PathBuf,
    inbound_tx: mpsc::Sender<OutgoingFrame>,
}

/// Summary used by `:plugin list` and the `/metrics` gauge.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub running: bool,
    pub commands: Vec<String>,
}

impl PluginHost {
    pub fn new(plugin_dir: PathBuf, inbound_tx: mpsc::Sender<OutgoingFrame>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            plugin_dir,
            inbound_tx,
        }
    }

    /// Load: read manifest, validate, resolve binary path, construct
    /// the Plugin Instance (enabled=true, process=None).
    #[instrument(skip(self))]
    pub async fn load(&self, name: &str) -> Result<(), PluginError> {
        validate_plugin_name(name)?;
        let dir = self.plugin_dir.join(name);
        let manifest_path = dir.join("manifest.json");
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|_| PluginError::Manifest(format!("missing manifest at {}", manifest_path.display())))?;
        let manifest = PluginManifest::parse(&raw)?;

        let binary_path = dir.join(manifest.binary_filename());
        if !binary_path.exists() {
            return Err(PluginError::BinaryNotFound(binary_path.display().to_string()));
        }

        let instance = PluginInstance {
            manifest,
            dir,
            enabled: true,
            process: None,
        };
        self.registry
            .write()
            .await
            .insert(name.to_string(), Arc::new(Mutex::new(instance)));
        metrics::LOADED_PLUGINS.set(self.registry.read().await.len() as i64);
        info!(plugin = name, "plugin loaded");
        Ok(())
    }

    fn get(&self, registry: &HashMap<String, Arc<Mutex<PluginInstance>>>, name: &str) -> Result<Arc<Mutex<PluginInstance>>, PluginError> {
        registry
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotInstalled(name.to_string()))
    }

    /// Start: spawn the subprocess and send `init`.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<(), PluginError> {
        validate_plugin_name(name)?;
        let instance = {
            let registry = self.registry.read().await;
            self.get(&registry, name)?
        };
        let mut instance = instance.lock().await;
        if instance.process.is_some() {
            return Ok(());
        }
        let binary_path = instance.dir.join(instance.manifest.binary_filename());
        let process = PluginProcess::start(
            name,
            &binary_path,
            &instance.dir,
            serde_json::json!({ "permissions": instance.manifest.permissions }),
            self.inbound_tx.clone(),
        )
        .await?;
        instance.process = Some(process);
        info!(plugin = name, "plugin started");
        Ok(())
    }

    /// Stop: graceful shutdown with a 5-second timeout.
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<(), PluginError> {
        validate_plugin_name(name)?;
        let instance = {
            let registry = self.registry.read().await;
            self.get(&registry, name)?
        };
        let process = {
            let mut instance = instance.lock().await;
            instance.process.take()
        };
        if let Some(process) = process {
            process.stop().await?;
        }
        info!(plugin = name, "plugin stopped");
        Ok(())
    }

    /// Toggles the enabled flag and starts/stops accordingly. Per
    /// §4.8's deadlock note, the registry read lock is dropped before
    /// `start`/`stop` (which take the per-instance lock) are invoked.
    pub async fn enable(&self, name: &str) -> Result<(), PluginError> {
        validate_plugin_name(name)?;
        let instance = {
            let registry = self.registry.read().await;
            self.get(&registry, name)?
        };
        {
            let mut instance = instance.lock().await;
            instance.enabled = true;
        }
        self.start(name).await
    }

    pub async fn disable(&self, name: &str) -> Result<(), PluginError> {
        validate_plugin_name(name)?;
        let instance = {
            let registry = self.registry.read().await;
            self.get(&registry, name)?
        };
        {
            let mut instance = instance.lock().await;
            instance.enabled = false;
        }
        self.stop(name).await
    }

    pub async fn uninstall(&self, name: &str) -> Result<(), PluginError> {
        validate_plugin_name(name)?;
        let _ = self.stop(name).await;
        let dir = {
            let mut registry = self.registry.write().await;
            registry.remove(name).map(|_| self.plugin_dir.join(name))
        };
        if let Some(dir) = dir {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
        metrics::LOADED_PLUGINS.set(self.registry.read().await.len() as i64);
        Ok(())
    }

    pub async fn install(&self, name: &str, source: &str, checksum: Option<&str>) -> Result<(), PluginError> {
        install::install_plugin(name, source, checksum, &self.plugin_dir).await?;
        self.load(name).await
    }

    /// Broadcast semantics (§4.8): one `message` request to every
    /// enabled, running plugin; a failed send to one plugin is logged
    /// and does not affect the others.
    pub async fn send_message(&self, sender: &str, content: &str) {
        let instances: Vec<Arc<Mutex<PluginInstance>>> = self.registry.read().await.values().cloned().collect();
        for instance in instances {
            let instance = instance.lock().await;
            if !instance.enabled {
                continue;
            }
            if let Some(process) = &instance.process {
                let req = PluginRequest {
                    kind: "message",
                    command: None,
                    data: serde_json::json!({ "sender": sender, "content": content }),
                };
                if let Err(e) = process.send(req).await {
                    warn!(plugin = %instance.manifest.name, error = %e, "failed to deliver message to plugin");
                }
            }
        }
    }

    /// Routes a plugin-provided command (§4.6) to the plugin that
    /// declares it.
    pub async fn dispatch_command(&self, command: &str, args: serde_json::Value) -> Result<(), PluginError> {
        let target = {
            let registry = self.registry.read().await;
            let mut found = None;
            for (name, instance) in registry.iter() {
                let instance = instance.lock().await;
                if instance.manifest.commands.iter().any(|c| c == command) {
                    found = Some(name.clone());
                    break;
                }
            }
            found
        };
        let name = target.ok_or_else(|| PluginError::Other(format!("no plugin provides command {command}")))?;
        let instance = {
            let registry = self.registry.read().await;
            self.get(&registry, &name)?
        };
        let instance = instance.lock().await;
        if let Some(process) = &instance.process {
            process
                .send(PluginRequest {
                    kind: "command",
                    command: Some(command.to_string()),
                    data: args,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<PluginSummary> {
        let registry = self.registry.read().await;
        let mut summaries = Vec::new();
        for instance in registry.values() {
            let instance = instance.lock().await;
            summaries.push(PluginSummary {
                name: instance.manifest.name.clone(),
                version: instance.manifest.version.clone(),
                enabled: instance.enabled,
                running: instance.process.is_some(),
                commands: instance.manifest.commands.clone(),
            });
        }
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_rejects_invalid_name_before_touching_disk() {
        let (tx, _rx) = mpsc::channel(10);
        let host = PluginHost::new(PathBuf::from("/tmp/does-not-matter"), tx);
        let err = host.load("../escape").await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidName(_)));
    }

    #[tokio::test]
    async fn start_on_unloaded_plugin_errors() {
        let (tx, _rx) = mpsc::channel(10);
        let host = PluginHost::new(PathBuf::from("/tmp/does-not-matter"), tx);
        let err = host.start("echo").await.unwrap_err();
        assert!(matches!(err, PluginError::NotInstalled(_)));
    }
}
