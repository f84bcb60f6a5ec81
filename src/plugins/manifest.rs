//! Plugin manifest (§4.8): the JSON descriptor validated at Load.

use serde::Deserialize;

use crate::error::PluginError;

#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Validates a plugin name per §4.8/§8: `^[a-z0-9_-]+$`, length <= 64,
/// no `..`, no path separators. Runs at every Plugin Host public entry
/// point to prevent path traversal into the plugin directory.
pub fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    if name.is_empty() || name.len() > 64 {
        return Err(PluginError::InvalidName(name.to_string()));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(PluginError::InvalidName(name.to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return Err(PluginError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl PluginManifest {
    pub fn parse(raw: &str) -> Result<Self, PluginError> {
        let manifest: Self = serde_json::from_str(raw).map_err(|e| PluginError::Manifest(e.to_string()))?;
        validate_plugin_name(&manifest.name)?;
        if manifest.version.trim().is_empty() {
            return Err(PluginError::Manifest("version must not be empty".to_string()));
        }
        Ok(manifest)
    }

    /// OS-aware binary filename resolution (§4.8).
    pub fn binary_filename(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.name)
        } else {
            self.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal_names() {
        assert!(validate_plugin_name("../etc").is_err());
        assert!(validate_plugin_name("a/b").is_err());
        assert!(validate_plugin_name("a\\b").is_err());
        assert!(validate_plugin_name("a..b").is_err());
    }

    #[test]
    fn rejects_disallowed_characters_and_length() {
        assert!(validate_plugin_name("Echo").is_err());
        assert!(validate_plugin_name("echo!").is_err());
        assert!(validate_plugin_name(&"a".repeat(65)).is_err());
        assert!(validate_plugin_name("").is_err());
    }

    #[test]
    fn accepts_well_formed_names() {
        assert!(validate_plugin_name("echo").is_ok());
        assert!(validate_plugin_name("echo-bot_2").is_ok());
    }

    #[test]
    fn parse_rejects_manifest_with_bad_name() {
        let raw = r#"{"name":"Bad Name","version":"1.0"}"#;
        assert!(PluginManifest::parse(raw).is_err());
    }
}
