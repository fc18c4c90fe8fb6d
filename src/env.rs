//! The environment handed to workloads that talk to the registry.

use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const REGISTRY_VAR: &str = "npm_config_registry";
pub const USERCONFIG_VAR: &str = "npm_config_userconfig";
pub const PID_VAR: &str = "NPM_REGISTRY_TESTKIT_PID";
pub const DIR_VAR: &str = "NPM_REGISTRY_TESTKIT_DIR";

const NPMRC_FILE: &str = "npmrc";

/// The registry URL without its scheme, the form npm keys credentials by.
///
/// `http://127.0.0.1:4873/` becomes `//127.0.0.1:4873/`.
pub fn nerf_dart(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.trim_end_matches('/');
    format!("//{}/", rest)
}

/// Single-quotes `value` for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Registry URL, credentials file and bookkeeping variables for one run.
#[derive(Debug, Clone)]
pub struct RegistryEnv {
    registry_url: String,
    npmrc: PathBuf,
    token: String,
    vars: BTreeMap<String, String>,
}

impl RegistryEnv {
    /// Writes an npmrc into `work_dir` granting a placeholder token for
    /// `registry_url` only, and collects the variables that point at it.
    pub async fn prepare(work_dir: &Path, registry_url: &str) -> Result<Self> {
        let token = uuid::Uuid::new_v4().to_string();
        let npmrc = work_dir.join(NPMRC_FILE);
        let contents = format!(
            "registry={}\n{}:_authToken={}\n",
            registry_url,
            nerf_dart(registry_url),
            token
        );
        fs::write(&npmrc, contents).await?;
        debug!("Wrote client config to {}", npmrc.display());

        let mut vars = BTreeMap::new();
        vars.insert(REGISTRY_VAR.to_string(), registry_url.to_string());
        vars.insert(
            USERCONFIG_VAR.to_string(),
            npmrc.to_string_lossy().into_owned(),
        );
        vars.insert(PID_VAR.to_string(), std::process::id().to_string());
        vars.insert(
            DIR_VAR.to_string(),
            work_dir.to_string_lossy().into_owned(),
        );

        Ok(Self {
            registry_url: registry_url.to_string(),
            npmrc,
            token,
            vars,
        })
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    pub fn npmrc(&self) -> &Path {
        &self.npmrc
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

/// One shell statement exporting every variable: `export A='1' B='2'`.
pub fn export_line(vars: &BTreeMap<String, String>) -> String {
    let assignments = vars
        .iter()
        .map(|(name, value)| format!("{}={}", name, shell_quote(value)))
        .collect::<Vec<_>>()
        .join(" ");
    format!("export {}", assignments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nerf_dart() {
        assert_eq!(nerf_dart("http://127.0.0.1:4873/"), "//127.0.0.1:4873/");
        assert_eq!(nerf_dart("https://example.com/npm"), "//example.com/npm/");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_prepare_writes_npmrc() {
        let dir = tempfile::tempdir().unwrap();
        let env = RegistryEnv::prepare(dir.path(), "http://127.0.0.1:4873/")
            .await
            .unwrap();

        let npmrc = std::fs::read_to_string(env.npmrc()).unwrap();
        assert!(npmrc.contains("registry=http://127.0.0.1:4873/\n"));
        assert!(npmrc.contains(&format!("//127.0.0.1:4873/:_authToken={}", env.token())));

        assert_eq!(env.vars()[REGISTRY_VAR], "http://127.0.0.1:4873/");
        assert_eq!(env.vars()[PID_VAR], std::process::id().to_string());
        assert_eq!(env.vars()[DIR_VAR], dir.path().to_string_lossy());
    }

    #[test]
    fn test_export_line() {
        let mut vars = BTreeMap::new();
        vars.insert("A".to_string(), "1".to_string());
        vars.insert("B".to_string(), "x y".to_string());
        assert_eq!(export_line(&vars), "export A='1' B='x y'");
    }
}
