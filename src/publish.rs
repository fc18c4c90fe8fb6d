//! Publishing local tarballs into the registry.

use crate::env::RegistryEnv;
use crate::error::{RegistryError, Result};
use crate::process::{Invocation, StdoutRoute};
use crate::tarball::TarballInfo;
use crate::uplink::escape_name;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use std::ffi::OsString;

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, tarball: &TarballInfo, env: &RegistryEnv) -> Result<()>;
}

/// Runs `npm publish --force` against the registry.
pub struct NpmPublisher {
    program: OsString,
    stdout: StdoutRoute,
}

impl NpmPublisher {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            stdout: StdoutRoute::Inherit,
        }
    }

    pub fn with_stdout(mut self, route: StdoutRoute) -> Self {
        self.stdout = route;
        self
    }
}

impl Default for NpmPublisher {
    fn default() -> Self {
        Self::new("npm")
    }
}

#[async_trait]
impl Publisher for NpmPublisher {
    async fn publish(&self, tarball: &TarballInfo, env: &RegistryEnv) -> Result<()> {
        Invocation::new(self.program.clone())
            .args(["publish", "--force", "--registry", env.registry_url()])
            .arg(&tarball.tarball_file)
            .envs(env.vars())
            .with_stdout(self.stdout)
            .run()
            .await
    }
}

/// Sends the publish document straight to the registry over HTTP, the way
/// npm would, without needing npm installed.
pub struct NativePublisher {
    client: reqwest::Client,
}

impl NativePublisher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().no_proxy().build()?,
        })
    }
}

/// The document npm PUTs to `/<name>` when publishing one version.
pub fn publish_document(info: &TarballInfo, data: &[u8], registry_url: &str) -> Value {
    let name = info.name();
    let version = info.version().unwrap_or("0.0.0");
    let bare_name = name.rsplit('/').next().unwrap_or(name);
    let filename = format!("{}-{}.tgz", bare_name, version);
    let integrity = format!("sha512-{}", BASE64.encode(Sha512::digest(data)));

    let mut manifest = info.package_json.clone();
    manifest.insert("_id".to_string(), json!(format!("{}@{}", name, version)));
    manifest.insert(
        "dist".to_string(),
        json!({
            "integrity": integrity,
            "tarball": format!("{}{}/-/{}", registry_url, name, filename),
        }),
    );

    json!({
        "_id": name,
        "name": name,
        "dist-tags": { "latest": version },
        "versions": { version: manifest },
        "_attachments": {
            filename: {
                "content_type": "application/octet-stream",
                "data": BASE64.encode(data),
                "length": data.len(),
            }
        }
    })
}

#[async_trait]
impl Publisher for NativePublisher {
    async fn publish(&self, tarball: &TarballInfo, env: &RegistryEnv) -> Result<()> {
        let data = tokio::fs::read(&tarball.tarball_file).await?;
        let document = publish_document(tarball, &data, env.registry_url());
        let url = format!("{}{}", env.registry_url(), escape_name(tarball.name()));

        let response = self
            .client
            .put(&url)
            .bearer_auth(env.token())
            .json(&document)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RegistryError::PublishRejected {
                package: format!("{}@{}", tarball.name(), tarball.version().unwrap_or("?")),
                status: response.status().as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::path::PathBuf;

    #[test]
    fn test_publish_document_shape() {
        let mut package_json = Map::new();
        package_json.insert("name".to_string(), json!("@corp/widget"));
        package_json.insert("version".to_string(), json!("1.0.0"));
        let info = TarballInfo {
            tarball_file: PathBuf::from("/tmp/widget.tgz"),
            package_json,
        };

        let doc = publish_document(&info, b"tgz", "http://127.0.0.1:4873/");

        assert_eq!(doc["name"], "@corp/widget");
        assert_eq!(doc["dist-tags"]["latest"], "1.0.0");
        assert_eq!(doc["versions"]["1.0.0"]["_id"], "@corp/widget@1.0.0");
        assert_eq!(
            doc["versions"]["1.0.0"]["dist"]["tarball"],
            "http://127.0.0.1:4873/@corp/widget/-/widget-1.0.0.tgz"
        );
        assert_eq!(doc["_attachments"]["widget-1.0.0.tgz"]["data"], "dGd6");
        assert_eq!(doc["_attachments"]["widget-1.0.0.tgz"]["length"], 3);
    }
}
