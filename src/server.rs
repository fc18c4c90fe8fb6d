//! Embedded npm registry server.
//!
//! Serves the subset of the npm registry API that `npm publish`,
//! `npm install`, `npm view` and `npm whoami` rely on. Packages are looked up
//! in local storage first; names whose access rule carries a proxy fall
//! through to that uplink.

use crate::access::{AccessRules, PackageAccess};
use crate::config::{RegistryConfig, Uplink};
use crate::error::{RegistryError, Result};
use crate::storage::{create_storage, Storage};
use crate::uplink::UplinkClient;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type SharedStorage = Arc<dyn Storage>;
type Document = Map<String, Value>;

#[derive(Clone)]
struct AppState {
    storage: SharedStorage,
    rules: Arc<AccessRules>,
    uplinks: Arc<BTreeMap<String, Uplink>>,
    uplink_client: UplinkClient,
    publish_lock: Arc<Mutex<()>>,
    base_url: String,
}

impl AppState {
    fn uplink_for(&self, rule: &PackageAccess) -> Option<&Uplink> {
        rule.proxy.as_ref().and_then(|name| self.uplinks.get(name))
    }
}

/// The main registry server.
///
/// Binds on construction and serves in a background task until
/// [`RegistryServer::stop`] is called or the value is dropped.
pub struct RegistryServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RegistryServer {
    /// Creates and starts a new registry server with the given configuration.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use npm_registry_testkit::{RegistryServer, RegistryConfig};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = RegistryConfig::memory();
    /// let server = RegistryServer::new(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: RegistryConfig) -> Result<Self> {
        let rules = config.validate()?;
        let storage = create_storage(&config.storage).await?;

        let requested_port = config.port.unwrap_or(0);
        let bind_addr = format!("{}:{}", config.host, requested_port);
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(RegistryError::PortInUse(requested_port))
            }
            Err(e) => return Err(e.into()),
        };
        let addr = listener.local_addr()?;

        let state = AppState {
            storage,
            rules: Arc::new(rules),
            uplinks: Arc::new(config.uplinks),
            uplink_client: UplinkClient::new()?,
            publish_lock: Arc::new(Mutex::new(())),
            base_url: format!("http://{}/", addr),
        };

        let app = Router::new()
            .route("/-/ping", get(ping))
            .route("/-/whoami", get(whoami))
            .route("/-/user/{user}", put(add_user))
            .route("/{pkg}", get(get_package).put(publish))
            .route("/{pkg}/{sub}", get(get_scoped_or_version))
            .route("/{pkg}/-/{file}", get(get_tarball))
            .route("/{pkg}/{sub}/-/{file}", get(get_scoped_tarball))
            .layer(
                tower::ServiceBuilder::new()
                    .layer(axum::extract::DefaultBodyLimit::max(512 * 1024 * 1024))
                    .layer(TraceLayer::new_for_http()),
            )
            .with_state(state);

        info!("Registry listening on {}", addr);

        let (shutdown, signal) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                signal.await.ok();
            });
            if let Err(e) = serve.await {
                warn!("Registry server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Returns the socket address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the base URL of the registry, with a trailing slash as npm
    /// expects it.
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Returns the port number the server is listening on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stops serving and waits until the listener is closed.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("Registry on {} did not drain in time, aborting", self.addr);
                handle.abort();
                handle.await.ok();
            }
        }
        info!("Registry on {} stopped", self.addr);
        Ok(())
    }
}

impl Drop for RegistryServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn internal(e: RegistryError) -> Response {
    warn!("Storage failure: {}", e);
    error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn denied(authenticated: bool, action: &str, package: &str) -> Response {
    let status = if authenticated {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::UNAUTHORIZED
    };
    error(status, format!("not allowed to {} package {}", action, package))
}

fn is_authenticated(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("Basic "))
        })
        .is_some_and(|credentials| !credentials.trim().is_empty())
}

fn base_url(state: &AppState, headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| format!("http://{}/", host))
        .unwrap_or_else(|| state.base_url.clone())
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.starts_with('_')
        && !segment.contains(['/', '\\', '%', ' '])
}

/// Accepts `name` and `@scope/name`.
pub(crate) fn valid_package_name(name: &str) -> bool {
    match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, bare)) => valid_segment(scope) && valid_segment(bare),
            None => false,
        },
        None => valid_segment(name),
    }
}

fn valid_filename(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\'])
}

/// The last path segment of a tarball URL or attachment key. npm names
/// scoped attachments `@scope/name-1.0.0.tgz`.
fn tarball_filename(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}

fn object_field<'a>(doc: &'a mut Document, key: &str) -> &'a mut Document {
    let slot = doc
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot replaced with an object above"),
    }
}

fn into_document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn has_version(doc: &Document, version: &str) -> bool {
    doc.get("versions")
        .and_then(Value::as_object)
        .is_some_and(|versions| versions.contains_key(version))
}

/// Overlays the local versions, times and dist-tags onto an upstream
/// packument.
fn merge_packuments(mut upstream: Document, local: Document) -> Document {
    for key in ["versions", "time", "dist-tags"] {
        if let Some(Value::Object(entries)) = local.get(key) {
            let target = object_field(&mut upstream, key);
            for (k, v) in entries {
                target.insert(k.clone(), v.clone());
            }
        }
    }
    upstream
}

/// Points every `dist.tarball` at this registry.
fn rewrite_tarballs(doc: &mut Document, base: &str, name: &str) {
    let Some(Value::Object(versions)) = doc.get_mut("versions") else {
        return;
    };
    for manifest in versions.values_mut() {
        let Some(Value::Object(dist)) = manifest.get_mut("dist") else {
            continue;
        };
        let Some(filename) = dist
            .get("tarball")
            .and_then(Value::as_str)
            .map(|url| tarball_filename(url).to_string())
        else {
            continue;
        };
        dist.insert(
            "tarball".to_string(),
            Value::String(format!("{}{}/-/{}", base, name, filename)),
        );
    }
}

async fn ping() -> Json<Value> {
    Json(json!({}))
}

async fn whoami(headers: HeaderMap) -> Response {
    if is_authenticated(&headers) {
        Json(json!({ "username": "testkit" })).into_response()
    } else {
        error(StatusCode::UNAUTHORIZED, "not logged in")
    }
}

async fn add_user(Path(user): Path<String>) -> Response {
    let name = user.strip_prefix("org.couchdb.user:").unwrap_or(&user);
    info!("Issuing token for user {}", name);
    (
        StatusCode::CREATED,
        Json(json!({
            "ok": true,
            "id": format!("org.couchdb.user:{}", name),
            "token": uuid::Uuid::new_v4().to_string(),
        })),
    )
        .into_response()
}

/// Loads the local packument for `name` and merges the upstream one when
/// the matching rule proxies.
async fn resolve_packument(
    state: &AppState,
    name: &str,
    headers: &HeaderMap,
) -> std::result::Result<Document, Response> {
    if !valid_package_name(name) {
        return Err(error(StatusCode::BAD_REQUEST, "invalid package name"));
    }
    let authenticated = is_authenticated(headers);
    let Some(rule) = state.rules.lookup(name) else {
        return Err(error(
            StatusCode::NOT_FOUND,
            format!("no access rule matches {}", name),
        ));
    };
    if !rule.access.allows(authenticated) {
        return Err(denied(authenticated, "access", name));
    }

    let local = state
        .storage
        .get_packument(name)
        .await
        .map_err(internal)?
        .map(into_document);

    let merged = match state.uplink_for(rule) {
        Some(uplink) => match state.uplink_client.packument(uplink, name).await {
            Ok(Some(upstream)) => Some(match local {
                Some(local) => merge_packuments(into_document(upstream), local),
                None => into_document(upstream),
            }),
            Ok(None) => local,
            Err(e) => {
                warn!("Uplink lookup for {} failed: {}", name, e);
                match local {
                    Some(local) => Some(local),
                    None => {
                        return Err(error(
                            StatusCode::BAD_GATEWAY,
                            format!("uplink unavailable for {}", name),
                        ))
                    }
                }
            }
        },
        None => local,
    };

    let mut doc = merged.ok_or_else(|| error(StatusCode::NOT_FOUND, "not found"))?;
    rewrite_tarballs(&mut doc, &base_url(state, headers), name);
    Ok(doc)
}

async fn serve_packument(state: &AppState, name: &str, headers: &HeaderMap) -> Response {
    debug!("Getting packument: {}", name);
    match resolve_packument(state, name, headers).await {
        Ok(doc) => Json(Value::Object(doc)).into_response(),
        Err(response) => response,
    }
}

async fn serve_version(
    state: &AppState,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
) -> Response {
    debug!("Getting version: {}@{}", name, reference);
    let doc = match resolve_packument(state, name, headers).await {
        Ok(doc) => doc,
        Err(response) => return response,
    };

    let version = doc
        .get("dist-tags")
        .and_then(|tags| tags.get(reference))
        .and_then(Value::as_str)
        .unwrap_or(reference);

    match doc.get("versions").and_then(|versions| versions.get(version)) {
        Some(manifest) => Json(manifest.clone()).into_response(),
        None => error(
            StatusCode::NOT_FOUND,
            format!("version not found: {}", reference),
        ),
    }
}

async fn get_package(
    State(state): State<AppState>,
    Path(pkg): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve_packument(&state, &pkg, &headers).await
}

async fn get_scoped_or_version(
    State(state): State<AppState>,
    Path((pkg, sub)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if pkg.starts_with('@') && !pkg.contains('/') {
        serve_packument(&state, &format!("{}/{}", pkg, sub), &headers).await
    } else {
        serve_version(&state, &pkg, &sub, &headers).await
    }
}

async fn serve_tarball(
    state: &AppState,
    name: &str,
    filename: &str,
    headers: &HeaderMap,
) -> Response {
    debug!("Getting tarball: {}/-/{}", name, filename);
    if !valid_package_name(name) || !valid_filename(filename) {
        return error(StatusCode::BAD_REQUEST, "invalid tarball path");
    }
    let authenticated = is_authenticated(headers);
    let Some(rule) = state.rules.lookup(name) else {
        return error(StatusCode::NOT_FOUND, "not found");
    };
    if !rule.access.allows(authenticated) {
        return denied(authenticated, "access", name);
    }

    let octet_stream = [(header::CONTENT_TYPE, "application/octet-stream")];

    match state.storage.get_tarball(name, filename).await {
        Ok(Some(data)) => return (StatusCode::OK, octet_stream, data).into_response(),
        Ok(None) => {}
        Err(e) => return internal(e),
    }

    let Some(uplink) = state.uplink_for(rule) else {
        return error(StatusCode::NOT_FOUND, "not found");
    };
    match state.uplink_client.tarball(uplink, name, filename).await {
        Ok(Some(data)) => (StatusCode::OK, octet_stream, data).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, "not found"),
        Err(e) => {
            warn!("Uplink tarball fetch for {} failed: {}", name, e);
            error(StatusCode::BAD_GATEWAY, "uplink unavailable")
        }
    }
}

async fn get_tarball(
    State(state): State<AppState>,
    Path((pkg, file)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    serve_tarball(&state, &pkg, &file, &headers).await
}

async fn get_scoped_tarball(
    State(state): State<AppState>,
    Path((scope, pkg, file)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    serve_tarball(&state, &format!("{}/{}", scope, pkg), &file, &headers).await
}

async fn publish(
    State(state): State<AppState>,
    Path(pkg): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !valid_package_name(&pkg) {
        return error(StatusCode::BAD_REQUEST, "invalid package name");
    }
    let doc = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(doc)) => doc,
        _ => return error(StatusCode::BAD_REQUEST, "invalid publish document"),
    };
    if doc.get("name").and_then(Value::as_str) != Some(pkg.as_str()) {
        return error(StatusCode::BAD_REQUEST, "package name does not match url");
    }

    let authenticated = is_authenticated(&headers);
    let Some(rule) = state.rules.lookup(&pkg) else {
        return error(StatusCode::FORBIDDEN, format!("no access rule matches {}", pkg));
    };
    if !rule.publish.allows(authenticated) {
        return denied(authenticated, "publish", &pkg);
    }

    let Some(versions) = doc
        .get("versions")
        .and_then(Value::as_object)
        .filter(|v| !v.is_empty())
    else {
        return error(StatusCode::BAD_REQUEST, "no versions to publish");
    };
    let Some(attachments) = doc
        .get("_attachments")
        .and_then(Value::as_object)
        .filter(|a| !a.is_empty())
    else {
        return error(StatusCode::BAD_REQUEST, "no tarball attached");
    };

    let mut tarballs = HashMap::new();
    for (key, attachment) in attachments {
        let filename = tarball_filename(key);
        if !valid_filename(filename) {
            return error(StatusCode::BAD_REQUEST, format!("invalid attachment {}", key));
        }
        let data = match attachment
            .get("data")
            .and_then(Value::as_str)
            .map(|data| BASE64.decode(data))
        {
            Some(Ok(data)) => data,
            _ => {
                return error(
                    StatusCode::BAD_REQUEST,
                    format!("attachment {} is not base64 data", key),
                )
            }
        };
        tarballs.insert(filename.to_string(), data);
    }

    let _guard = state.publish_lock.lock().await;

    let mut packument = match state.storage.get_packument(&pkg).await {
        Ok(Some(existing)) => into_document(existing),
        Ok(None) => {
            let mut fresh = Map::new();
            fresh.insert("_id".to_string(), Value::String(pkg.clone()));
            fresh.insert("name".to_string(), Value::String(pkg.clone()));
            fresh
        }
        Err(e) => return internal(e),
    };

    if let Some(version) = versions.keys().find(|v| has_version(&packument, v)) {
        return error(
            StatusCode::CONFLICT,
            format!("cannot modify pre-existing version {}@{}", pkg, version),
        );
    }

    if let Some(uplink) = state.uplink_for(rule) {
        match state.uplink_client.packument(uplink, &pkg).await {
            Ok(Some(upstream)) => {
                let upstream = into_document(upstream);
                if let Some(version) = versions.keys().find(|v| has_version(&upstream, v)) {
                    return error(
                        StatusCode::CONFLICT,
                        format!("{}@{} already exists upstream", pkg, version),
                    );
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Uplink check for {} failed, publishing anyway: {}", pkg, e),
        }
    }

    for (filename, data) in &tarballs {
        if let Err(e) = state.storage.store_tarball(&pkg, filename, data.clone()).await {
            return internal(e);
        }
    }

    let base = state.base_url.clone();
    let mut last_version = None;
    for (version, manifest) in versions {
        let mut manifest = into_document(manifest.clone());
        let dist = object_field(&mut manifest, "dist");
        let filename = dist
            .get("tarball")
            .and_then(Value::as_str)
            .map(|url| tarball_filename(url).to_string())
            .filter(|f| tarballs.contains_key(f))
            .or_else(|| (tarballs.len() == 1).then(|| tarballs.keys().next().cloned()).flatten());
        if let Some(filename) = filename {
            if !dist.contains_key("integrity") {
                if let Some(data) = tarballs.get(&filename) {
                    let integrity = format!("sha512-{}", BASE64.encode(Sha512::digest(data)));
                    dist.insert("integrity".to_string(), Value::String(integrity));
                }
            }
            dist.insert(
                "tarball".to_string(),
                Value::String(format!("{}{}/-/{}", base, pkg, filename)),
            );
        }
        object_field(&mut packument, "versions").insert(version.clone(), Value::Object(manifest));
        info!("Published {}@{}", pkg, version);
        last_version = Some(version.clone());
    }

    let tags = object_field(&mut packument, "dist-tags");
    if let Some(Value::Object(published_tags)) = doc.get("dist-tags") {
        for (tag, version) in published_tags {
            tags.insert(tag.clone(), version.clone());
        }
    }
    if !tags.contains_key("latest") {
        if let Some(version) = last_version {
            tags.insert("latest".to_string(), Value::String(version));
        }
    }
    for key in ["description", "readme", "license"] {
        if let Some(value) = doc.get(key) {
            packument.insert(key.to_string(), value.clone());
        }
    }

    if let Err(e) = state
        .storage
        .store_packument(&pkg, &Value::Object(packument))
        .await
    {
        return internal(e);
    }

    (
        StatusCode::CREATED,
        Json(json!({ "ok": "created new package", "success": true })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_names() {
        assert!(valid_package_name("lodash"));
        assert!(valid_package_name("@corp/widget"));
        assert!(!valid_package_name("@corp"));
        assert!(!valid_package_name("../etc"));
        assert!(!valid_package_name("a/b"));
        assert!(!valid_package_name("@corp/.."));
        assert!(!valid_package_name(""));
    }

    #[test]
    fn test_tarball_filename() {
        assert_eq!(tarball_filename("@corp/widget-1.0.0.tgz"), "widget-1.0.0.tgz");
        assert_eq!(
            tarball_filename("https://registry.npmjs.org/a/-/a-1.0.0.tgz"),
            "a-1.0.0.tgz"
        );
    }

    #[test]
    fn test_merge_prefers_local() {
        let upstream = into_document(json!({
            "name": "a",
            "versions": { "1.0.0": { "from": "upstream" }, "0.9.0": {} },
            "dist-tags": { "latest": "1.0.0", "next": "2.0.0-rc" }
        }));
        let local = into_document(json!({
            "versions": { "1.0.0": { "from": "local" }, "1.0.1": {} },
            "dist-tags": { "latest": "1.0.1" }
        }));

        let merged = merge_packuments(upstream, local);
        assert_eq!(merged["versions"]["1.0.0"]["from"], "local");
        assert!(merged["versions"].get("0.9.0").is_some());
        assert!(merged["versions"].get("1.0.1").is_some());
        assert_eq!(merged["dist-tags"]["latest"], "1.0.1");
        assert_eq!(merged["dist-tags"]["next"], "2.0.0-rc");
    }

    #[test]
    fn test_rewrite_tarballs() {
        let mut doc = into_document(json!({
            "versions": {
                "1.0.0": { "dist": { "tarball": "https://registry.npmjs.org/@corp/widget/-/widget-1.0.0.tgz" } },
                "1.0.1": {}
            }
        }));
        rewrite_tarballs(&mut doc, "http://127.0.0.1:4873/", "@corp/widget");
        assert_eq!(
            doc["versions"]["1.0.0"]["dist"]["tarball"],
            "http://127.0.0.1:4873/@corp/widget/-/widget-1.0.0.tgz"
        );
    }

    #[test]
    fn test_bearer_token_counts_as_authenticated() {
        let mut headers = HeaderMap::new();
        assert!(!is_authenticated(&headers));
        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(!is_authenticated(&headers));
        headers.insert(header::AUTHORIZATION, "Bearer testkit".parse().unwrap());
        assert!(is_authenticated(&headers));
    }
}
