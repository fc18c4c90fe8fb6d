//! HTTP client for upstream registries.

use crate::config::Uplink;
use crate::error::Result;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const UPLINK_TIMEOUT: Duration = Duration::from_secs(30);

/// Encodes a package name as a single path segment (`@scope%2fname`).
pub fn escape_name(name: &str) -> String {
    name.replace('/', "%2f")
}

#[derive(Clone)]
pub struct UplinkClient {
    client: reqwest::Client,
}

impl UplinkClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPLINK_TIMEOUT)
            .user_agent(concat!("npm-registry-testkit/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Fetches the packument for `name`; `None` when the uplink does not
    /// know the package.
    pub async fn packument(&self, uplink: &Uplink, name: &str) -> Result<Option<Value>> {
        let url = format!("{}{}", uplink.url, escape_name(name));
        debug!("Fetching packument from uplink: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    /// Fetches `filename` of package `name` from the uplink.
    pub async fn tarball(
        &self,
        uplink: &Uplink,
        name: &str,
        filename: &str,
    ) -> Result<Option<Vec<u8>>> {
        let url = format!("{}{}/-/{}", uplink.url, name, filename);
        debug!("Fetching tarball from uplink: {}", url);

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.bytes().await?.to_vec()))
    }
}
