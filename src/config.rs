use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Fallback signing secret used when no secret is configured.
/// Present for parity with existing deployments; a warning is logged
/// whenever it engages.
pub const DEFAULT_JWT_SECRET: &str = "supersecretkey";

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Base directory for stored data such as uploaded videos.
    pub data_dir: PathBuf,
    /// Shared secret for signing and verifying bearer tokens.
    pub jwt_secret: String,
    /// Maximum video upload size in megabytes.
    pub max_upload_mb: u64,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
}

fn default_port() -> u16 {
    8080
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut port = default_port();
        let mut logging = default_logging();
        let mut jwt_secret: Option<String> = None;

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("COURSEHUB_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/coursehub.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            jwt_secret = file_cfg.auth.jwt_secret;
        }

        // environment overrides
        if let Ok(p) = std::env::var("COURSEHUB_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("COURSEHUB_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(s) = std::env::var("JWT_SECRET") {
            if !s.is_empty() {
                jwt_secret = Some(s);
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("coursehub.db"));
        let max_upload_mb = std::env::var("MAX_UPLOAD_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let jwt_secret = match jwt_secret {
            Some(s) => s,
            None => {
                tracing::warn!("no JWT secret configured, falling back to built-in default");
                DEFAULT_JWT_SECRET.to_string()
            }
        };

        Ok(Self {
            bind,
            db_path,
            data_dir,
            jwt_secret,
            max_upload_mb,
            logging_enabled: logging,
        })
    }

    /// Helper to return the upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/coursehub");
        p
    } else {
        PathBuf::from("./coursehub_data")
    }
}
