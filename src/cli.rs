//! Command-line interface for mcsupervisor.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Verbosity levels, indexed by their numeric shorthand.
const LEVELS: [LevelFilter; 6] = [
    LevelFilter::OFF,
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// `--log-level` value: a level name (`warn`, `debug`, ...) or its number, 0 (off) to 5.
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// Directive for the tracing `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();

        if let Ok(number) = value.parse::<usize>() {
            return LEVELS
                .get(number)
                .map(|level| LogLevelArg(*level))
                .ok_or_else(|| format!("log level {number} is out of range (0-5)"));
        }

        LEVELS
            .iter()
            .copied()
            .find(|level| LogLevelArg(*level).as_str().eq_ignore_ascii_case(value))
            .or(match value.to_ascii_lowercase().as_str() {
                "err" => Some(LevelFilter::ERROR),
                "warning" => Some(LevelFilter::WARN),
                _ => None,
            })
            .map(LogLevelArg)
            .ok_or_else(|| format!("invalid log level '{value}'"))
    }
}

/// Command-line interface for mcsupervisor.
#[derive(Parser)]
#[command(name = "mcsv", version, author)]
#[command(about = "Runs, backs up and restores a Minecraft server", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for mcsv.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the server in the foreground. Console input is forwarded to the server.
    Run {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "mcsv.yaml")]
        config: PathBuf,
    },

    /// Archive the server directory.
    Backup {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "mcsv.yaml")]
        config: PathBuf,
    },

    /// Restore the server directory from an archive. The server must be stopped.
    Restore {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "mcsv.yaml")]
        config: PathBuf,

        /// Archive to restore (defaults to the newest backup).
        #[arg(short, long)]
        archive: Option<PathBuf>,
    },

    /// List existing backups, oldest first.
    Backups {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "mcsv.yaml")]
        config: PathBuf,
    },

    /// Download the server jar without starting it.
    Fetch {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "mcsv.yaml")]
        config: PathBuf,
    },

    /// Show resource usage of a running server process.
    Stats {
        /// PID of the server process.
        #[arg(long)]
        pid: u32,

        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
