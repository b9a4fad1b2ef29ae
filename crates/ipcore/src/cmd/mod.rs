use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use ipcore_system::CoreConfig;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod config;
pub mod pump;
pub mod selftest;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Exercise every object kind against a fresh core and report.
    Selftest(SelftestArgs),
    /// Stream bytes through a data pipe between two threads.
    Pump(PumpArgs),
    /// Print the effective core configuration.
    Config(ConfigArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: CoreConfig) -> CliResult<i32> {
    match command {
        Command::Selftest(args) => selftest::run(args, format, config),
        Command::Pump(args) => pump::run(args, format, config),
        Command::Config(args) => config::run(args, format, config),
        Command::Version(args) => version::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct SelftestArgs {
    /// Upper bound for each blocking wait a check performs (e.g. 2s, 500ms).
    #[arg(long, default_value = "2s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct PumpArgs {
    /// Total bytes to stream.
    #[arg(long, default_value = "1048576")]
    pub bytes: u64,
    /// Data pipe capacity in bytes. 0 uses the configured default.
    #[arg(long, default_value = "0")]
    pub capacity: usize,
    /// Element size; every transfer is a multiple of it.
    #[arg(long, default_value = "1")]
    pub element_bytes: usize,
    /// Largest single write or read.
    #[arg(long, default_value = "4096")]
    pub chunk: usize,
    /// Use begin/end two-phase transfers instead of copies.
    #[arg(long)]
    pub two_phase: bool,
    /// Give up when either side stalls this long (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
    /// Append every control record the core announces to this file.
    #[arg(long, value_name = "FILE")]
    pub record: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// Ignore --config and print the built-in defaults.
    #[arg(long)]
    pub defaults: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse "5s", "150ms" or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn parse_duration_millis() {
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_duration_invalid() {
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
        assert!(parse_duration("bad").is_err());
    }
}
