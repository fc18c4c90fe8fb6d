pub mod access;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod env;
pub mod error;
pub mod limit;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod publish;
pub mod server;
pub mod storage;
pub mod tarball;
pub mod uplink;

pub use access::{Access, PackageAccess};
pub use config::{RegistryConfig, StorageBackend, Uplink};
pub use env::RegistryEnv;
pub use error::{RegistryError, Result};
pub use limit::{run_limited, AggregateError};
pub use orchestrator::{Orchestrator, SandboxOptions, TarballSource};
pub use publish::{NativePublisher, NpmPublisher, Publisher};
pub use server::RegistryServer;
pub use tarball::TarballInfo;
