//! Command-line and environment configuration.
//!
//! Every flag can also be set through a `PERSH_*` environment variable:
//!
//! ```bash
//! persh-mcp --hosts-file ./hosts.json --max-sessions 10
//! PERSH_INACTIVITY_TIMEOUT_SECS=600 persh-mcp --log-format json
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use directories::BaseDirs;
use persh::{Error, Result, SessionConfig};

/// Default cap on command text length, in bytes.
pub const DEFAULT_MAX_COMMAND_LENGTH: usize = 10_000;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// persh-mcp - persistent SSH shell sessions for MCP clients.
///
/// Speaks JSON-RPC over stdin/stdout. Logs go to stderr.
#[derive(Parser, Debug, Clone)]
#[command(name = "persh-mcp", author, version, about)]
pub struct Args {
    /// Host profile file
    ///
    /// Defaults to ~/.persh/hosts.json
    #[arg(long, env = "PERSH_HOSTS_FILE")]
    pub hosts_file: Option<PathBuf>,

    /// Seconds of inactivity before a session is closed
    #[arg(long, env = "PERSH_INACTIVITY_TIMEOUT_SECS", default_value_t = 7200)]
    pub inactivity_timeout_secs: u64,

    /// Seconds to wait for a new shell to become ready
    #[arg(long, env = "PERSH_READY_TIMEOUT_SECS", default_value_t = 15)]
    pub ready_timeout_secs: u64,

    /// Seconds to wait for the SSH connection and handshake
    #[arg(long, env = "PERSH_CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// Maximum number of concurrent sessions
    #[arg(long, env = "PERSH_MAX_SESSIONS", default_value_t = 100)]
    pub max_sessions: usize,

    /// Maximum command length in bytes
    #[arg(long, env = "PERSH_MAX_COMMAND_LENGTH", default_value_t = DEFAULT_MAX_COMMAND_LENGTH)]
    pub max_command_length: usize,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "PERSH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "PERSH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where host profiles are stored.
    pub hosts_file: PathBuf,
    /// Settings for every session.
    pub session: SessionConfig,
    /// Longest accepted command.
    pub max_command_length: usize,
    /// Fallback log filter.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Config {
    /// Creates a configuration with defaults and the given hosts file.
    pub fn new(hosts_file: impl Into<PathBuf>) -> Self {
        Self {
            hosts_file: hosts_file.into(),
            session: SessionConfig::default(),
            max_command_length: DEFAULT_MAX_COMMAND_LENGTH,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }

    /// Sets the session settings.
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Sets the command length cap.
    pub fn max_command_length(mut self, max: usize) -> Self {
        self.max_command_length = max;
        self
    }

    /// Builds and validates a configuration from parsed arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for zero timeouts or limits, or when
    /// no hosts file is given and the home directory is unknown.
    pub fn from_args(args: Args) -> Result<Self> {
        let nonzero = |value: u64, flag: &str| {
            if value == 0 {
                Err(Error::Configuration(format!("--{flag} must be greater than zero")))
            } else {
                Ok(Duration::from_secs(value))
            }
        };

        let inactivity = nonzero(args.inactivity_timeout_secs, "inactivity-timeout-secs")?;
        let ready = nonzero(args.ready_timeout_secs, "ready-timeout-secs")?;
        let connect = nonzero(args.connect_timeout_secs, "connect-timeout-secs")?;
        if args.max_sessions == 0 {
            return Err(Error::Configuration(
                "--max-sessions must be greater than zero".to_string(),
            ));
        }
        if args.max_command_length == 0 {
            return Err(Error::Configuration(
                "--max-command-length must be greater than zero".to_string(),
            ));
        }

        let hosts_file = match args.hosts_file {
            Some(path) => path,
            None => default_hosts_file()?,
        };

        Ok(Self {
            hosts_file,
            session: SessionConfig::default()
                .with_inactivity_timeout(inactivity)
                .with_ready_timeout(ready)
                .with_connect_timeout(connect)
                .with_max_sessions(args.max_sessions),
            max_command_length: args.max_command_length,
            log_level: args.log_level,
            log_format: args.log_format,
        })
    }
}

/// Returns the current user's home directory.
pub fn home_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

fn default_hosts_file() -> Result<PathBuf> {
    home_dir()
        .map(|home| home.join(".persh").join("hosts.json"))
        .ok_or_else(|| {
            Error::Configuration(
                "cannot determine home directory; pass --hosts-file".to_string(),
            )
        })
}
