#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;

pub const UPSTREAM_TARBALL: &[u8] = b"upstream-tarball";

/// Packs a minimal package the way `npm pack` does and returns its path.
pub fn write_package(dir: &FsPath, name: &str, version: &str) -> PathBuf {
    let bare = name.rsplit('/').next().unwrap();
    let path = dir.join(format!("{}-{}.tgz", bare, version));
    let manifest = json!({ "name": name, "version": version, "main": "index.js" }).to_string();
    let index = format!("module.exports = {:?};\n", version);

    let mut builder = tar::Builder::new(GzEncoder::new(
        File::create(&path).unwrap(),
        Compression::default(),
    ));
    for (entry, data) in [
        ("package/package.json", manifest.as_bytes()),
        ("package/index.js", index.as_bytes()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, entry, data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    path
}

/// A packument as the public registry would serve it.
pub fn upstream_packument(name: &str, versions: &[&str]) -> Value {
    let bare = name.rsplit('/').next().unwrap();
    let versions: serde_json::Map<String, Value> = versions
        .iter()
        .map(|v| {
            (
                v.to_string(),
                json!({
                    "name": name,
                    "version": v,
                    "dist": {
                        "tarball": format!("https://registry.npmjs.org/{}/-/{}-{}.tgz", name, bare, v)
                    }
                }),
            )
        })
        .collect();
    json!({
        "_id": name,
        "name": name,
        "dist-tags": { "latest": versions.keys().last().cloned().unwrap_or_default() },
        "versions": versions,
    })
}

type Docs = Arc<HashMap<String, Value>>;

async fn packument(State(docs): State<Docs>, Path(pkg): Path<String>) -> Response {
    match docs.get(&pkg) {
        Some(doc) => Json(doc.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response(),
    }
}

async fn tarball() -> Vec<u8> {
    UPSTREAM_TARBALL.to_vec()
}

/// Starts a stand-in for the public registry and returns its base URL.
pub async fn fake_upstream(packuments: Vec<Value>) -> String {
    let docs: HashMap<String, Value> = packuments
        .into_iter()
        .map(|doc| (doc["name"].as_str().unwrap().to_string(), doc))
        .collect();

    let app = Router::new()
        .route("/{pkg}", get(packument))
        .route("/{pkg}/-/{file}", get(tarball))
        .route("/{pkg}/{sub}/-/{file}", get(tarball))
        .with_state(Arc::new(docs));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}/", addr)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
