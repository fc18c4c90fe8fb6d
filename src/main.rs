use clap::Parser;
use npm_registry_testkit::cli::{self, Cli};
use npm_registry_testkit::logging;
use std::io::Write;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log_options()) {
        report(&e);
        return ExitCode::FAILURE;
    }

    let forwarded = std::env::args_os().skip(1).collect();
    let code = match cli::run(cli, forwarded).await {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            e.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// A daemon child's stderr is closed once the parent has detached, so write
/// errors are ignored here.
fn report(error: &npm_registry_testkit::RegistryError) {
    let _ = writeln!(std::io::stderr(), "npm-registry-testkit: {}", error);
}
