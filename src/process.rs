//! Running external commands attached to the controlling terminal.

use crate::error::{RegistryError, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Where a child's standard output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdoutRoute {
    /// Share our stdout.
    #[default]
    Inherit,
    /// Write to our stderr, keeping our stdout free for other traffic.
    Stderr,
}

/// A program, its arguments, and extra environment on top of ours.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: BTreeMap<String, String>,
    pub stdout: StdoutRoute,
}

impl Invocation {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdout: StdoutRoute::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_stdout(mut self, route: StdoutRoute) -> Self {
        self.stdout = route;
        self
    }

    fn display_program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// The command line as it would be typed, for logging.
    pub fn command_line(&self) -> String {
        std::iter::once(self.display_program())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs the command to completion.
    ///
    /// Fails with [`RegistryError::ProcessLaunch`] if it cannot be started and
    /// with [`RegistryError::ProcessExit`] if it exits unsuccessfully.
    pub async fn run(&self) -> Result<()> {
        debug!("Running: {}", self.command_line());

        let stdout = match self.stdout {
            StdoutRoute::Inherit => Stdio::inherit(),
            StdoutRoute::Stderr => Stdio::from(std::io::stderr()),
        };

        let status = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::inherit())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| RegistryError::ProcessLaunch {
                program: self.display_program(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(RegistryError::ProcessExit {
                program: self.display_program(),
                code: status.code(),
            })
        }
    }
}
