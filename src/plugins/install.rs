//! Plugin install (§4.8): fetch an archive (local `file://` or HTTP),
//! verify an optional checksum, and extract it under the plugin
//! directory with zip-slip defense.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::PluginError;
use crate::plugins::manifest::validate_plugin_name;

/// Downloads `source` (an HTTP(S) URL or a `file://` path) into memory.
async fn fetch(source: &str) -> Result<Vec<u8>, PluginError> {
    if let Some(path) = source.strip_prefix("file://") {
        return tokio::fs::read(path)
            .await
            .map_err(|e| PluginError::Install(format!("reading {path}: {e}")));
    }
    let response = reqwest::get(source)
        .await
        .map_err(|e| PluginError::Install(format!("fetching {source}: {e}")))?;
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| PluginError::Install(format!("reading body of {source}: {e}")))
}

/// Accepts both bare hex and `sha256:<hex>` forms (§4.8 Install).
fn normalize_checksum(expected: &str) -> String {
    expected
        .strip_prefix("sha256:")
        .unwrap_or(expected)
        .to_lowercase()
}

fn verify_checksum(bytes: &[u8], expected: &str) -> Result<(), PluginError> {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    let expected = normalize_checksum(expected);
    if digest != expected {
        return Err(PluginError::Install(format!(
            "checksum mismatch: expected {expected}, got {digest}"
        )));
    }
    Ok(())
}

/// Downloads, optionally verifies, and extracts a plugin archive under
/// `plugin_dir/<name>`. Every archive entry path is checked for a
/// leading `..` segment or absolute path before being written
/// (zip-slip defense).
pub async fn install_plugin(
    name: &str,
    source: &str,
    checksum: Option<&str>,
    plugin_dir: &Path,
) -> Result<PathBuf, PluginError> {
    validate_plugin_name(name)?;

    let bytes = fetch(source).await?;
    if let Some(expected) = checksum {
        verify_checksum(&bytes, expected)?;
    }

    let dest_dir = plugin_dir.join(name);
    tokio::fs::create_dir_all(&dest_dir)
        .await
        .map_err(|e| PluginError::Install(format!("creating plugin dir: {e}")))?;

    extract_zip(&bytes, &dest_dir)?;
    info!(plugin = name, %source, "plugin installed");
    Ok(dest_dir)
}

fn extract_zip(bytes: &[u8], dest_dir: &Path) -> Result<(), PluginError> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(reader).map_err(|e| PluginError::Install(format!("invalid archive: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| PluginError::Install(format!("reading archive entry {i}: {e}")))?;
        let entry_path = match entry.enclosed_name() {
            Some(p) => p,
            None => {
                return Err(PluginError::Install(format!(
                    "archive entry {} has an unsafe path",
                    entry.name()
                )))
            }
        };

        let out_path = dest_dir.join(&entry_path);
        if !out_path.starts_with(dest_dir) {
            return Err(PluginError::Install(format!(
                "archive entry escapes plugin directory: {}",
                entry_path.display()
            )));
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| PluginError::Install(format!("creating {}: {e}", out_path.display())))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PluginError::Install(format!("creating {}: {e}", parent.display())))?;
        }
        let mut out_file = std::fs::File::create(&out_path)
            .map_err(|e| PluginError::Install(format!("writing {}: {e}", out_path.display())))?;
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| PluginError::Install(format!("reading {}: {e}", entry_path.display())))?;
        std::io::Write::write_all(&mut out_file, &buf)
            .map_err(|e| PluginError::Install(format!("writing {}: {e}", out_path.display())))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_accepts_both_forms() {
        let bytes = b"hello world";
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = format!("{:x}", hasher.finalize());

        assert!(verify_checksum(bytes, &digest).is_ok());
        assert!(verify_checksum(bytes, &format!("sha256:{digest}")).is_ok());
        assert!(verify_checksum(bytes, "deadbeef").is_err());
    }

    #[tokio::test]
    async fn fetch_reads_local_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("archive.zip");
        std::fs::write(&file_path, b"not really a zip").unwrap();
        let bytes = fetch(&format!("file://{}", file_path.display())).await.unwrap();
        assert_eq!(bytes, b"not really a zip");
    }
}
