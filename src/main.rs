#![allow(clippy::result_large_err)]

use anyhow::{anyhow, Context};
use muster::app::MusterApp;
use muster::config::{MusterConfig, StackConfig};
use muster::readiness::DependencyGraph;
use muster::registry::ServiceRegistry;
use muster::telemetry;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

enum CliCommand {
    Up {
        stack_path: Option<String>,
        detach: bool,
    },
    Validate {
        stacks: Vec<String>,
    },
    Order {
        stack_path: Option<String>,
    },
    Help,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", render_failure(&err));
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    telemetry::init_tracing().context("failed to initialise telemetry")?;

    match parse_cli_args(std::env::args().skip(1))? {
        CliCommand::Up { stack_path, detach } => {
            let mut config = MusterConfig::load().context("failed to load configuration")?;
            config.detach |= detach;
            let path = resolve_stack_path(stack_path, &config)?;

            let app = MusterApp::initialise(&config, &path)?;
            let started = app.start().await?;
            println!(
                "all services healthy ({} services in {})",
                started.report().order.len(),
                humantime::format_duration(round_to_millis(started.report().elapsed))
            );

            if config.detach {
                started.detach();
                Ok(())
            } else {
                started
                    .run_until_shutdown()
                    .await
                    .context("stack supervision error")
            }
        }
        CliCommand::Validate { stacks } => run_validate_command(stacks),
        CliCommand::Order { stack_path } => {
            let config = MusterConfig::load().context("failed to load configuration")?;
            let path = resolve_stack_path(stack_path, &config)?;
            for (idx, name) in resolve_order(&path)?.iter().enumerate() {
                println!("{}. {name}", idx + 1);
            }
            Ok(())
        }
        CliCommand::Help => {
            print_help();
            Ok(())
        }
    }
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        return Ok(CliCommand::Help);
    };

    match command.as_str() {
        "up" => {
            let mut stack_path = None;
            let mut detach = false;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "-c" | "--config" | "-f" | "--file" => {
                        if stack_path.is_some() {
                            anyhow::bail!("stack file path specified multiple times");
                        }
                        let value = args
                            .next()
                            .ok_or_else(|| anyhow!("expected path after {arg}"))?;
                        stack_path = Some(value);
                    }
                    "-d" | "--detach" => detach = true,
                    "-h" | "--help" => return Ok(CliCommand::Help),
                    other => anyhow::bail!("unrecognised argument `{other}`"),
                }
            }
            Ok(CliCommand::Up { stack_path, detach })
        }
        "order" => {
            let mut stack_path = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "-c" | "--config" | "-f" | "--file" => {
                        let value = args
                            .next()
                            .ok_or_else(|| anyhow!("expected path after {arg}"))?;
                        stack_path = Some(value);
                    }
                    "-h" | "--help" => return Ok(CliCommand::Help),
                    other => anyhow::bail!("unrecognised argument `{other}`"),
                }
            }
            Ok(CliCommand::Order { stack_path })
        }
        "validate" => {
            let mut stacks = Vec::new();
            for arg in args {
                match arg.as_str() {
                    "-h" | "--help" => return Ok(CliCommand::Help),
                    other => stacks.push(other.to_string()),
                }
            }
            if stacks.is_empty() {
                anyhow::bail!("muster validate requires at least one stack file");
            }
            Ok(CliCommand::Validate { stacks })
        }
        "-h" | "--help" | "help" => Ok(CliCommand::Help),
        other => anyhow::bail!("unrecognised command `{other}` (see `muster --help`)"),
    }
}

fn resolve_stack_path(cli: Option<String>, config: &MusterConfig) -> anyhow::Result<PathBuf> {
    cli.or_else(|| config.stack_path.clone())
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("no stack file given; pass -c <PATH> or set MUSTER__STACK_PATH"))
}

fn resolve_order(path: &Path) -> anyhow::Result<Vec<String>> {
    let stack = StackConfig::from_path(path)
        .with_context(|| format!("failed to load stack file {}", path.display()))?;
    let registry = ServiceRegistry::build(&stack)?;
    Ok(DependencyGraph::build(&registry).resolve()?)
}

fn run_validate_command(stacks: Vec<String>) -> anyhow::Result<()> {
    let mut had_error = false;

    for stack in stacks {
        let path = PathBuf::from(&stack);
        match resolve_order(&path) {
            Ok(_) => println!("validated {}", path.display()),
            Err(err) => {
                eprintln!("{}: {}", path.display(), render_failure(&err));
                had_error = true;
            }
        }
    }

    if had_error {
        Err(anyhow!("one or more stack files failed validation"))
    } else {
        Ok(())
    }
}

/// Coordination failures are printed bare so the failing service leads the
/// line; everything else keeps its context chain.
fn render_failure(err: &anyhow::Error) -> String {
    for cause in err.chain() {
        if let Some(muster_err) = cause.downcast_ref::<muster::error::Error>() {
            if let Some(coordination) = muster_err.coordination() {
                return coordination.to_string();
            }
        }
        if let Some(coordination) = cause.downcast_ref::<muster::readiness::CoordinationError>() {
            return coordination.to_string();
        }
    }
    format!("{err:#}")
}

fn round_to_millis(duration: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(duration.as_millis() as u64)
}

fn print_help() {
    println!(
        "\
Usage: muster up -c <PATH> [--detach]
       muster order -c <PATH>
       muster validate <PATH>...

Commands:
  up          Start every service in dependency order and supervise restarts
  order       Print the resolved start order
  validate    Check stack files, including dependency cycles

Options:
  -c, --config <PATH>    Path to the stack YAML file (or MUSTER__STACK_PATH)
  -d, --detach           Exit once the stack is healthy, leaving services running
  -h, --help             Print this help message
"
    );
}
