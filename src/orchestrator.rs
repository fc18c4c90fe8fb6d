//! Two-phase registry bring-up around a caller-supplied workload.
//!
//! The first phase runs the registry with no uplink and publishes every
//! local tarball into it, so versions that also exist upstream are still
//! accepted. The second phase serves the same storage with the upstream
//! proxied for every name except the hidden ones.

use crate::access::PackageAccess;
use crate::config::{RegistryConfig, Uplink, DEFAULT_PORT, DEFAULT_UPSTREAM};
use crate::env::RegistryEnv;
use crate::error::{RegistryError, Result};
use crate::limit::run_limited;
use crate::publish::Publisher;
use crate::server::RegistryServer;
use crate::tarball::TarballInfo;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the uplink the serve phase proxies to.
pub const UPSTREAM_UPLINK: &str = "npmjs";

/// Which local tarballs to publish.
#[derive(Debug, Clone)]
pub enum TarballSource {
    /// Every `*.tgz` file directly inside the directory.
    Directory(PathBuf),
    /// Every file matching the glob pattern.
    Glob(String),
}

impl Default for TarballSource {
    fn default() -> Self {
        TarballSource::Directory(PathBuf::from("."))
    }
}

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub source: TarballSource,
    pub host: String,
    /// Port for both phases. Zero picks a free port in the publish phase and
    /// keeps it for the serve phase.
    pub port: u16,
    pub hide: Vec<String>,
    pub hide_local: bool,
    pub upstream: String,
    pub concurrency: Option<usize>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            source: TarballSource::default(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            hide: Vec::new(),
            hide_local: false,
            upstream: DEFAULT_UPSTREAM.to_string(),
            concurrency: None,
        }
    }
}

/// Lists the tarballs selected by `source` as sorted absolute paths.
pub async fn resolve_tarballs(source: &TarballSource) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    match source {
        TarballSource::Glob(pattern) => {
            let pattern = pattern.clone();
            files = tokio::task::spawn_blocking(move || glob_files(&pattern))
                .await
                .map_err(std::io::Error::other)??;
        }
        TarballSource::Directory(dir) => {
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let is_tgz = entry.file_name().to_string_lossy().ends_with(".tgz");
                if is_tgz && entry.file_type().await?.is_file() {
                    files.push(std::path::absolute(entry.path())?);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Regular files matching `pattern`. Walks the filesystem, so call it off the
/// async threads.
fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern)
        .map_err(|e| RegistryError::Config(format!("invalid glob {}: {}", pattern, e)))?;
    let mut files = Vec::new();
    for path in paths {
        match path {
            Ok(path) if path.is_file() => files.push(std::path::absolute(path)?),
            Ok(_) => {}
            Err(e) => debug!("Skipping unreadable glob match: {}", e),
        }
    }
    Ok(files)
}

/// Reads the manifest of every tarball, skipping the ones that fail.
pub async fn load_tarballs(paths: &[PathBuf]) -> Vec<TarballInfo> {
    let mut infos = Vec::with_capacity(paths.len());
    for path in paths {
        match TarballInfo::load(path).await {
            Ok(info) => infos.push(info),
            Err(e) => debug!("Skipping {}: {}", path.display(), e),
        }
    }
    infos
}

/// User masks, plus every local package name when `hide_local` is set.
pub fn packages_to_hide(user: &[String], tarballs: &[TarballInfo], hide_local: bool) -> Vec<String> {
    let mut hide = user.to_vec();
    if hide_local {
        hide.extend(tarballs.iter().map(|t| t.name().to_string()));
    }
    hide
}

/// Everything may be published and nothing is fetched from upstream.
pub fn publish_config(storage: PathBuf, host: &str, port: u16) -> RegistryConfig {
    RegistryConfig::directory(storage)
        .with_host(host)
        .with_port(port)
        .with_packages([PackageAccess::open("**")])
}

/// Hidden masks are served locally only; every other name falls through to
/// the upstream.
pub fn serve_config(
    storage: PathBuf,
    host: &str,
    port: u16,
    hide: &[String],
    upstream: &str,
) -> RegistryConfig {
    let rules = hide
        .iter()
        .map(PackageAccess::open)
        .chain(std::iter::once(
            PackageAccess::open("**").with_proxy(UPSTREAM_UPLINK),
        ));
    RegistryConfig::directory(storage)
        .with_host(host)
        .with_port(port)
        .with_uplink(UPSTREAM_UPLINK, Uplink::new(upstream))
        .with_packages(rules)
}

pub struct Orchestrator {
    options: SandboxOptions,
    publisher: Arc<dyn Publisher>,
}

impl Orchestrator {
    pub fn new(options: SandboxOptions, publisher: Arc<dyn Publisher>) -> Self {
        Self { options, publisher }
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Brings the registry up, runs `action` against it and tears everything
    /// down again, whatever the outcome.
    pub async fn run<F, Fut, T>(&self, action: F) -> Result<T>
    where
        F: FnOnce(RegistryEnv) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let paths = resolve_tarballs(&self.options.source).await?;
        let tarballs = load_tarballs(&paths).await;
        let hide = packages_to_hide(&self.options.hide, &tarballs, self.options.hide_local);
        info!(
            "Found {} publishable tarballs out of {} candidates",
            tarballs.len(),
            paths.len()
        );

        let work_dir = tempfile::Builder::new()
            .prefix("npm-registry-testkit-")
            .tempdir()?;
        let work_path = work_dir.path().to_path_buf();

        let result = self.run_phases(&work_path, &tarballs, &hide, action).await;

        if let Err(e) = work_dir.close() {
            warn!("Failed to remove {}: {}", work_path.display(), e);
        }
        result
    }

    async fn run_phases<F, Fut, T>(
        &self,
        work_dir: &Path,
        tarballs: &[TarballInfo],
        hide: &[String],
        action: F,
    ) -> Result<T>
    where
        F: FnOnce(RegistryEnv) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let storage = work_dir.join("storage");
        let host = &self.options.host;

        let server = RegistryServer::new(publish_config(
            storage.clone(),
            host,
            self.options.port,
        ))
        .await?;
        let port = server.port();

        let published = async {
            let env = RegistryEnv::prepare(work_dir, &server.url()).await?;
            self.publish_all(tarballs, &env).await?;
            Ok::<_, RegistryError>(env)
        }
        .await;
        shutdown(server).await;
        let env = published?;

        let server = RegistryServer::new(serve_config(
            storage,
            host,
            port,
            hide,
            &self.options.upstream,
        ))
        .await?;
        info!("Serving on {}", server.url());

        let outcome = action(env).await;
        shutdown(server).await;
        outcome
    }

    async fn publish_all(&self, tarballs: &[TarballInfo], env: &RegistryEnv) -> Result<()> {
        let tasks: Vec<_> = tarballs
            .iter()
            .map(|tarball| {
                let publisher = self.publisher.clone();
                move || async move {
                    info!("Publishing {}", tarball.tarball_file.display());
                    publisher.publish(tarball, env).await
                }
            })
            .collect();

        run_limited(tasks, self.options.concurrency)
            .await
            .map_err(RegistryError::Publish)?;
        Ok(())
    }
}

async fn shutdown(server: RegistryServer) {
    let addr = server.addr();
    if let Err(e) = server.stop().await {
        warn!("Failed to stop registry on {}: {}", addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarball::tests::{write_package, write_tgz};

    #[tokio::test]
    async fn test_resolve_directory_only_tgz() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path(), "b", "1.0.0");
        write_package(dir.path(), "a", "1.0.0");
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("nested.tgz")).unwrap();

        let files = resolve_tarballs(&TarballSource::Directory(dir.path().to_path_buf()))
            .await
            .unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a-1.0.0.tgz", "b-1.0.0.tgz"]);
        assert!(files.iter().all(|f| f.is_absolute()));
    }

    #[tokio::test]
    async fn test_resolve_glob() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path(), "a", "1.0.0");
        write_package(dir.path(), "a", "2.0.0");
        write_package(dir.path(), "b", "1.0.0");

        let pattern = format!("{}/a-*.tgz", dir.path().display());
        let files = resolve_tarballs(&TarballSource::Glob(pattern)).await.unwrap();
        assert_eq!(files.len(), 2);

        let err = resolve_tarballs(&TarballSource::Glob("[".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_resolve_glob_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path(), "a", "1.0.0");
        std::fs::create_dir(dir.path().join("b-1.0.0.tgz")).unwrap();

        let pattern = format!("{}/*.tgz", dir.path().display());
        let files = resolve_tarballs(&TarballSource::Glob(pattern.clone()))
            .await
            .unwrap();
        assert_eq!(files, vec![dir.path().join("a-1.0.0.tgz")]);
        assert_eq!(glob_files(&pattern).unwrap(), files);
    }

    #[tokio::test]
    async fn test_bad_tarballs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_package(dir.path(), "good", "1.0.0");
        let broken = dir.path().join("broken.tgz");
        write_tgz(&broken, &[("package/package.json", b"nope")]);
        let garbage = dir.path().join("garbage.tgz");
        std::fs::write(&garbage, b"not an archive at all").unwrap();

        let infos = load_tarballs(&[broken, good, garbage]).await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name(), "good");
    }

    #[tokio::test]
    async fn test_hide_local_adds_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_package(dir.path(), "a", "1.0.0");
        let infos = load_tarballs(&[path]).await;
        let user = vec!["@corp/*".to_string()];

        assert_eq!(packages_to_hide(&user, &infos, false), vec!["@corp/*"]);
        assert_eq!(packages_to_hide(&user, &infos, true), vec!["@corp/*", "a"]);
    }

    #[test]
    fn test_phase_configs() {
        let publish = publish_config(PathBuf::from("/tmp/s"), "127.0.0.1", 4873);
        assert!(publish.uplinks.is_empty());
        assert_eq!(publish.packages, vec![PackageAccess::open("**")]);
        assert!(publish.validate().is_ok());

        let hide = vec!["@corp/*".to_string(), "a".to_string()];
        let serve = serve_config(PathBuf::from("/tmp/s"), "127.0.0.1", 4873, &hide, DEFAULT_UPSTREAM);
        assert_eq!(serve.packages.len(), 3);
        assert_eq!(serve.packages[0], PackageAccess::open("@corp/*"));
        assert_eq!(serve.packages[1].proxy, None);
        assert_eq!(serve.packages[2].pattern, "**");
        assert_eq!(serve.packages[2].proxy.as_deref(), Some(UPSTREAM_UPLINK));
        assert!(serve.validate().is_ok());
    }
}
