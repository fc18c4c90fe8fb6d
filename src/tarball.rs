//! Reading package manifests out of tarballs.

use crate::error::{RegistryError, Result};
use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tar::Archive;

/// Where `npm pack` puts the manifest.
pub const MANIFEST_ENTRY: &str = "package/package.json";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn open_archive(path: &Path) -> std::io::Result<Archive<Box<dyn Read>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok(Archive::new(reader))
}

fn scan_entries(path: &Path, entry_path: &str) -> std::io::Result<Vec<u8>> {
    let mut archive = open_archive(path)?;
    let mut data = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == entry_path {
            entry.read_to_end(&mut data)?;
        }
    }
    Ok(data)
}

/// Returns the bytes of every entry named `entry_path` in the (optionally
/// gzipped) tar archive at `path`, concatenated.
///
/// No matching entry yields an empty vector, not an error.
pub async fn read_entry(path: impl AsRef<Path>, entry_path: &str) -> Result<Vec<u8>> {
    let path = path.as_ref().to_path_buf();
    let entry_path = entry_path.to_string();
    let scan_path = path.clone();

    tokio::task::spawn_blocking(move || scan_entries(&scan_path, &entry_path))
        .await
        .map_err(|e| RegistryError::ArchiveRead {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?
        .map_err(|source| RegistryError::ArchiveRead { path, source })
}

/// A local tarball and the manifest packed inside it.
#[derive(Debug, Clone)]
pub struct TarballInfo {
    pub tarball_file: PathBuf,
    pub package_json: Map<String, Value>,
}

impl TarballInfo {
    /// Reads and validates the manifest of the tarball at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let tarball_file = std::path::absolute(path.as_ref())?;
        let bytes = read_entry(&tarball_file, MANIFEST_ENTRY).await?;

        let invalid = |reason: &str| RegistryError::InvalidManifest {
            path: tarball_file.clone(),
            reason: reason.to_string(),
        };

        if bytes.is_empty() {
            return Err(invalid("no package/package.json entry"));
        }
        let package_json = match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(invalid("manifest is not a JSON object")),
            Err(e) => return Err(invalid(&e.to_string())),
        };
        if !matches!(package_json.get("name"), Some(Value::String(_))) {
            return Err(invalid("manifest has no name"));
        }

        Ok(Self {
            tarball_file,
            package_json,
        })
    }

    pub fn name(&self) -> &str {
        self.package_json
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn version(&self) -> Option<&str> {
        self.package_json.get("version").and_then(Value::as_str)
    }
}
