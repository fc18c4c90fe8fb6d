use crate::access::{AccessRules, PackageAccess};
use crate::error::{RegistryError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 4873;
pub const DEFAULT_UPSTREAM: &str = "https://registry.npmjs.org/";

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Memory,
    TempDir,
    Directory(PathBuf),
}

/// A remote registry that rules may proxy to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    pub url: String,
}

impl Uplink {
    pub fn new(url: impl Into<String>) -> Self {
        let mut url = url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        Self { url }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub storage: StorageBackend,
    pub port: Option<u16>,
    pub host: String,
    pub uplinks: BTreeMap<String, Uplink>,
    pub packages: Vec<PackageAccess>,
}

impl RegistryConfig {
    pub fn new(storage: StorageBackend) -> Self {
        Self {
            storage,
            port: None,
            host: "127.0.0.1".to_string(),
            uplinks: BTreeMap::new(),
            packages: vec![PackageAccess::open("**")],
        }
    }

    pub fn memory() -> Self {
        Self::new(StorageBackend::Memory)
    }

    pub fn temp_dir() -> Self {
        Self::new(StorageBackend::TempDir)
    }

    pub fn directory(path: PathBuf) -> Self {
        Self::new(StorageBackend::Directory(path))
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_uplink(mut self, name: impl Into<String>, uplink: Uplink) -> Self {
        self.uplinks.insert(name.into(), uplink);
        self
    }

    /// Replaces the package rules. Order matters: the first match wins.
    pub fn with_packages(mut self, packages: impl IntoIterator<Item = PackageAccess>) -> Self {
        self.packages = packages.into_iter().collect();
        self
    }

    /// Checks masks, uplink URLs and that every proxy names a known uplink.
    pub fn validate(&self) -> Result<AccessRules> {
        for (name, uplink) in &self.uplinks {
            let url = reqwest::Url::parse(&uplink.url).map_err(|e| {
                RegistryError::Config(format!("uplink {} has invalid url {}: {}", name, uplink.url, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(RegistryError::Config(format!(
                    "uplink {} must use http or https",
                    name
                )));
            }
        }

        for rule in &self.packages {
            if let Some(proxy) = &rule.proxy {
                if !self.uplinks.contains_key(proxy) {
                    return Err(RegistryError::Config(format!(
                        "package rule {} proxies to unknown uplink {}",
                        rule.pattern, proxy
                    )));
                }
            }
        }

        AccessRules::compile(&self.packages)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_uplink_is_rejected() {
        let config = RegistryConfig::memory()
            .with_packages([PackageAccess::open("**").with_proxy("npmjs")]);
        assert!(matches!(config.validate(), Err(RegistryError::Config(_))));

        let config = config.with_uplink("npmjs", Uplink::new(DEFAULT_UPSTREAM));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_uplink_url_is_checked() {
        let config = RegistryConfig::memory().with_uplink("bad", Uplink::new("ftp://example.com"));
        assert!(config.validate().is_err());
        let config = RegistryConfig::memory().with_uplink("bad", Uplink::new("not a url"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_uplink_url_gets_trailing_slash() {
        assert_eq!(Uplink::new("http://localhost:1").url, "http://localhost:1/");
    }
}
