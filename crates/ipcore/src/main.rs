mod cmd;
mod exit;
mod logging;
mod output;

use std::path::{Path, PathBuf};

use clap::Parser;
use ipcore_system::CoreConfig;

use crate::cmd::Command;
use crate::exit::{core_error, io_error, CliError, CliResult, DATA_INVALID};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "ipcore", version, about = "Capability handle core CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Core limits as a JSON file; missing fields keep their defaults.
    #[arg(long, value_name = "PATH", env = "IPCORE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn load_config(path: Option<&Path>) -> CliResult<CoreConfig> {
    let Some(path) = path else {
        return Ok(CoreConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| io_error(&format!("read config {}", path.display()), err))?;
    let config: CoreConfig = serde_json::from_str(&text).map_err(|err| {
        CliError::new(
            DATA_INVALID,
            format!("parse config {}: {err}", path.display()),
        )
    })?;
    config
        .validate()
        .map_err(|err| core_error(&format!("config {}", path.display()), err))?;
    Ok(config)
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result =
        load_config(cli.config.as_deref()).and_then(|config| cmd::run(cli.command, format, config));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
