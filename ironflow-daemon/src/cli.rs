//! CLI argument definitions for ironflow-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.
//! CLI values take precedence over the config file and environment variables.

use std::path::PathBuf;

use clap::Parser;

use ironflow_core::config::IronflowConfig;

/// ironflow network flow collector daemon.
///
/// Receives NetFlow v5/v9, IPFIX and sFlow datagrams over UDP, decodes and
/// validates them, and flushes adaptive batches to the configured sink.
#[derive(Parser, Debug)]
#[command(name = "ironflow-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to ironflow.toml configuration file.
    #[arg(short, long, default_value = "/etc/ironflow/ironflow.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path.
    #[arg(long)]
    pub pid_file: Option<String>,
}

impl DaemonCli {
    /// Apply CLI overrides on top of an already loaded configuration.
    ///
    /// The caller re-validates afterwards since overrides bypass file validation.
    pub fn apply_overrides(&self, config: &mut IronflowConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.general.log_format = format.clone();
        }
        if let Some(pid_file) = &self.pid_file {
            config.general.pid_file = pid_file.clone();
        }
    }
}
