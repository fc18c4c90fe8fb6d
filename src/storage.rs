use crate::config::StorageBackend;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

const PACKUMENT_FILE: &str = "package.json";

/// Locally published packages: one packument per name plus its tarballs.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn store_packument(&self, name: &str, packument: &Value) -> Result<()>;
    async fn get_packument(&self, name: &str) -> Result<Option<Value>>;
    async fn store_tarball(&self, name: &str, filename: &str, data: Vec<u8>) -> Result<()>;
    async fn get_tarball(&self, name: &str, filename: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Default)]
pub struct MemoryStorage {
    packuments: Arc<RwLock<HashMap<String, Value>>>,
    tarballs: Arc<RwLock<HashMap<(String, String), Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store_packument(&self, name: &str, packument: &Value) -> Result<()> {
        self.packuments
            .write()
            .await
            .insert(name.to_string(), packument.clone());
        Ok(())
    }

    async fn get_packument(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.packuments.read().await.get(name).cloned())
    }

    async fn store_tarball(&self, name: &str, filename: &str, data: Vec<u8>) -> Result<()> {
        self.tarballs
            .write()
            .await
            .insert((name.to_string(), filename.to_string()), data);
        Ok(())
    }

    async fn get_tarball(&self, name: &str, filename: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tarballs
            .read()
            .await
            .get(&(name.to_string(), filename.to_string()))
            .cloned())
    }
}

/// Keeps each package under `<base>/<name>/`, so scoped packages nest under
/// their scope directory.
pub struct DiskStorage {
    base_path: PathBuf,
    _temp_dir: Option<tempfile::TempDir>,
}

impl DiskStorage {
    pub async fn new(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path).await?;

        Ok(Self {
            base_path: path,
            _temp_dir: None,
        })
    }

    pub async fn temp() -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().to_path_buf();

        Ok(Self {
            base_path: path,
            _temp_dir: Some(temp_dir),
        })
    }

    fn package_dir(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn store_packument(&self, name: &str, packument: &Value) -> Result<()> {
        let dir = self.package_dir(name);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(PACKUMENT_FILE), serde_json::to_vec_pretty(packument)?).await?;
        Ok(())
    }

    async fn get_packument(&self, name: &str) -> Result<Option<Value>> {
        let path = self.package_dir(name).join(PACKUMENT_FILE);

        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn store_tarball(&self, name: &str, filename: &str, data: Vec<u8>) -> Result<()> {
        let dir = self.package_dir(name);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(filename), &data).await?;
        Ok(())
    }

    async fn get_tarball(&self, name: &str, filename: &str) -> Result<Option<Vec<u8>>> {
        let path = self.package_dir(name).join(filename);

        if !path.exists() {
            return Ok(None);
        }

        Ok(Some(fs::read(&path).await?))
    }
}

pub async fn create_storage(backend: &StorageBackend) -> Result<Arc<dyn Storage>> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::TempDir => Ok(Arc::new(DiskStorage::temp().await?)),
        StorageBackend::Directory(path) => Ok(Arc::new(DiskStorage::new(path.clone()).await?)),
    }
}
