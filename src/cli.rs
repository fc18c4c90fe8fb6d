//! Command-line front-end: single-shot and daemon modes.

use crate::config::{DEFAULT_PORT, DEFAULT_UPSTREAM};
use crate::daemon::{self, Termination};
use crate::error::{RegistryError, Result};
use crate::logging::LogOptions;
use crate::orchestrator::{Orchestrator, SandboxOptions, TarballSource};
use crate::process::{Invocation, StdoutRoute};
use crate::publish::{NativePublisher, NpmPublisher, Publisher};
use clap::{ArgAction, Parser, ValueEnum};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PublisherKind {
    /// `npm publish --force`
    Npm,
    /// Built-in HTTP client, no npm required
    Native,
}

#[derive(Debug, Parser)]
#[command(name = "npm-registry-testkit")]
#[command(about = "Serve local npm tarballs from a throwaway registry that proxies the rest")]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Publish every *.tgz file in this directory (default: current directory)
    #[arg(short, long, conflicts_with = "glob")]
    pub directory: Option<PathBuf>,

    /// Publish every file matching this glob
    #[arg(short, long)]
    pub glob: Option<String>,

    /// Write registry server logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Level for registry server logs
    #[arg(long, default_value = "warn")]
    pub log_level: LevelFilter,

    /// Port for the registry
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Never fetch packages matching this mask from upstream (repeatable)
    #[arg(long = "hide", value_name = "MASK")]
    pub hide: Vec<String>,

    /// Hide the names of every local tarball from upstream
    #[arg(long)]
    pub hide_local: bool,

    /// Keep the registry running in the background and print its environment
    #[arg(long)]
    pub daemon: bool,

    #[arg(long = "daemon-child", hide = true)]
    pub daemon_child: bool,

    /// Registry to proxy names that are not hidden
    #[arg(long, default_value = DEFAULT_UPSTREAM)]
    pub upstream: String,

    /// How tarballs get published
    #[arg(long, value_enum, default_value_t = PublisherKind::Npm)]
    pub publisher: PublisherKind,

    /// npm executable used for publishing
    #[arg(long, default_value = "npm")]
    pub npm: OsString,

    /// Maximum concurrent publishes (default: half the CPUs, at least 2)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Command to run against the registry
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

impl Cli {
    /// Exactly one of a command or `--daemon` must be given.
    pub fn validate(&self) -> Result<()> {
        match (self.command.is_empty(), self.daemon) {
            (false, false) | (true, true) => Ok(()),
            (true, false) => Err(RegistryError::Config(
                "nothing to do: give a command to run or --daemon".to_string(),
            )),
            (false, true) => Err(RegistryError::Config(
                "a command cannot be combined with --daemon".to_string(),
            )),
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            verbosity: self.verbose,
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }

    pub fn sandbox_options(&self) -> SandboxOptions {
        let source = match (&self.glob, &self.directory) {
            (Some(pattern), _) => TarballSource::Glob(pattern.clone()),
            (None, Some(dir)) => TarballSource::Directory(dir.clone()),
            (None, None) => TarballSource::default(),
        };
        SandboxOptions {
            source,
            port: self.port,
            hide: self.hide.clone(),
            hide_local: self.hide_local,
            upstream: self.upstream.clone(),
            concurrency: self.concurrency,
            ..SandboxOptions::default()
        }
    }

    fn publisher(&self) -> Result<Arc<dyn Publisher>> {
        let route = if self.daemon_child {
            StdoutRoute::Stderr
        } else {
            StdoutRoute::Inherit
        };
        let publisher: Arc<dyn Publisher> = match self.publisher {
            PublisherKind::Npm => Arc::new(NpmPublisher::new(self.npm.clone()).with_stdout(route)),
            PublisherKind::Native => Arc::new(NativePublisher::new()?),
        };
        Ok(publisher)
    }
}

/// Runs the front-end and returns the process exit code.
pub async fn run(cli: Cli, forwarded_args: Vec<OsString>) -> Result<i32> {
    cli.validate()?;

    if cli.daemon && !cli.daemon_child {
        let exports = daemon::spawn(forwarded_args).await?;
        println!("{}", exports);
        return Ok(0);
    }

    let orchestrator = Orchestrator::new(cli.sandbox_options(), cli.publisher()?);

    if cli.daemon_child {
        let termination = Termination::install()?;
        orchestrator
            .run(|env| async move {
                daemon::send_ready(env.vars()).await?;
                termination.recv().await;
                Ok::<_, RegistryError>(())
            })
            .await?;
        return Ok(0);
    }

    let (program, args) = match cli.command.split_first() {
        Some(split) => split,
        None => return Err(RegistryError::Config("missing command".to_string())),
    };
    orchestrator
        .run(|env| async move {
            ignore_interrupts()?;
            Invocation::new(program.clone())
                .args(args.iter().cloned())
                .envs(env.vars())
                .run()
                .await
        })
        .await?;
    Ok(0)
}

/// Leaves SIGINT to the child command. The handler is registered before
/// this returns, so it is in place before the command starts.
fn ignore_interrupts() -> Result<()> {
    let mut interrupts = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        while interrupts.recv().await.is_some() {
            debug!("Ignoring interrupt while the command runs");
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("npm-registry-testkit").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["npm", "install"]);
        assert_eq!(cli.port, 4873);
        assert_eq!(cli.log_level, LevelFilter::WARN);
        assert_eq!(cli.publisher, PublisherKind::Npm);
        assert_eq!(cli.command, vec![OsString::from("npm"), OsString::from("install")]);
        assert!(cli.validate().is_ok());
        assert!(matches!(
            cli.sandbox_options().source,
            TarballSource::Directory(ref d) if d == &PathBuf::from(".")
        ));
    }

    #[test]
    fn test_trailing_command_keeps_its_flags() {
        let cli = parse(&["-vv", "--hide", "@corp/*", "--hide", "x", "npm", "ci", "--silent"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.hide, vec!["@corp/*", "x"]);
        assert_eq!(cli.command.len(), 3);
        assert_eq!(cli.command[2], "--silent");
    }

    #[test]
    fn test_command_and_daemon_are_exclusive() {
        assert!(parse(&[]).validate().is_err());
        assert!(parse(&["--daemon", "npm", "install"]).validate().is_err());
        assert!(parse(&["--daemon"]).validate().is_ok());
    }

    #[test]
    fn test_directory_conflicts_with_glob() {
        let result = Cli::try_parse_from(["npm-registry-testkit", "-d", "dist", "-g", "*.tgz", "true"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_glob_source() {
        let cli = parse(&["-g", "dist/*.tgz", "--port", "0", "true"]);
        let options = cli.sandbox_options();
        assert!(matches!(options.source, TarballSource::Glob(ref g) if g == "dist/*.tgz"));
        assert_eq!(options.port, 0);
    }
}
