use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default token endpoint path, relative to the API base URL
pub const DEFAULT_TOKEN_PATH: &str = "/auth/token";

/// Vault session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the Vault API
    #[arg(short = 'u', long, env = "VAULT_API_URL", default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Token endpoint path (login and renewal)
    #[arg(long, env = "VAULT_TOKEN_PATH", default_value = DEFAULT_TOKEN_PATH)]
    pub token_path: String,

    /// Path to the SQLite file holding the persisted session
    #[arg(short = 'd', long, env = "VAULT_SESSION_DB")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Log in and persist the session
    Login {
        username: String,

        /// Prompted for when omitted
        #[arg(short, long, env = "VAULT_PASSWORD")]
        password: Option<String>,
    },

    /// Clear the persisted session
    Logout,

    /// Show the current session
    Status,

    /// Send an authenticated request and print the response
    Request {
        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Path relative to the base URL, e.g. /vault/rooms
        path: String,

        /// JSON body
        #[arg(short, long)]
        body: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub base_url: String,
    pub token_path: String,

    // Session persistence
    pub db_file: PathBuf,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let db_file = match args.db_file {
            Some(ref path) => expand_tilde(path),
            None => default_db_path()?,
        };

        Ok(Config {
            base_url: args.base_url.trim_end_matches('/').to_string(),
            token_path: args.token_path.clone(),
            db_file,

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level.clone(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            anyhow::bail!(
                "VAULT_API_URL must start with http:// or https://: {}",
                self.base_url
            );
        }

        if !self.token_path.starts_with('/') {
            anyhow::bail!("VAULT_TOKEN_PATH must start with '/': {}", self.token_path);
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

/// Default session database under the user's local data directory
fn default_db_path() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir().context("Could not find local data directory")?;
    Ok(data_dir.join("vault-session").join("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
