//! Background mode: a detached child keeps the registry up and tells the
//! parent how to reach it.
//!
//! The child's stdout is the channel. It carries exactly one
//! [`DaemonMessage::Ready`] line, after which the parent prints the
//! environment as an `export` statement and exits. The child keeps serving
//! until it receives SIGINT, SIGTERM or SIGUSR1.
//!
//! The child never holds the caller's stdio. Its stderr is a pipe the parent
//! relays until the ready message arrives and then closes, so a caller that
//! captures our output sees end-of-file as soon as we exit.

use crate::env::export_line;
use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info};

/// Hidden flag that marks the re-executed child.
pub const CHILD_FLAG: &str = "--daemon-child";

const MESSAGE_PREFIX: &str = "@@npm-registry-testkit@@ ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonMessage {
    Ready { env: BTreeMap<String, String> },
}

impl DaemonMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(format!("{}{}", MESSAGE_PREFIX, serde_json::to_string(self)?))
    }

    /// `None` for lines that are not protocol messages.
    pub fn decode(line: &str) -> Option<Result<Self>> {
        line.strip_prefix(MESSAGE_PREFIX)
            .map(|payload| serde_json::from_str(payload).map_err(RegistryError::from))
    }
}

/// Starts a detached copy of this executable with `args` and waits for it
/// to report ready. Returns the line to print.
pub async fn spawn(args: impl IntoIterator<Item = OsString>) -> Result<String> {
    let exe = std::env::current_exe()?;
    let program = exe.to_string_lossy().into_owned();

    let mut child = Command::new(&exe)
        .arg(CHILD_FLAG)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| RegistryError::ProcessLaunch {
            program: program.clone(),
            source,
        })?;
    debug!("Started daemon child {:?}", child.id());

    let stdout = child.stdout.take().ok_or_else(|| {
        RegistryError::Config("daemon child has no stdout pipe".to_string())
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        RegistryError::Config("daemon child has no stderr pipe".to_string())
    })?;
    let relay = relay_stderr(stderr);
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines.next_line().await? {
        match DaemonMessage::decode(&line) {
            Some(message) => {
                // Dropping the read ends detaches the child from our stdio.
                relay.abort();
                let DaemonMessage::Ready { env } = message?;
                return Ok(export_line(&env));
            }
            None => debug!("daemon: {}", line),
        }
    }

    let status = child.wait().await?;
    let _ = relay.await;
    Err(RegistryError::ProcessExit {
        program,
        code: status.code(),
    })
}

/// Copies the child's stderr to ours, line by line, until end-of-file or abort.
fn relay_stderr(stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut out = tokio::io::stderr();
        while let Ok(Some(line)) = lines.next_line().await {
            if out.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                break;
            }
        }
    })
}

/// Sends the ready message on stdout. Called once, by the child.
pub async fn send_ready(env: &BTreeMap<String, String>) -> Result<()> {
    let line = DaemonMessage::Ready { env: env.clone() }.encode()?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

/// The three signals that shut the daemon down.
pub struct Termination {
    interrupt: Signal,
    terminate: Signal,
    user: Signal,
}

impl Termination {
    /// Installs the handlers. Do this before announcing readiness so an
    /// early signal still leads to cleanup.
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            user: signal(SignalKind::user_defined1())?,
        })
    }

    /// Resolves on whichever signal arrives first.
    pub async fn recv(mut self) {
        let name = tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.user.recv() => "SIGUSR1",
        };
        info!("Received {}, shutting down", name);
    }
}
