//! Server configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::cgi::CgiConfig;
use crate::worker::{DEFAULT_RESPONSE_TIMEOUT, WorkerConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// If true, ignore SIGTERM and wait for explicit /shutdown or SIGINT.
    pub await_explicit_shutdown: bool,
    /// Root of the served git repositories.
    pub repo_dir: PathBuf,
    pub git_http_backend: PathBuf,
    /// Executable computation worker.
    pub sage_server_path: PathBuf,
    pub sage_timeout: Duration,
    /// Request header carrying the authenticated user id.
    pub remote_user_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            await_explicit_shutdown: false,
            repo_dir: PathBuf::from("./repos"),
            git_http_backend: PathBuf::from("/usr/lib/git-core/git-http-backend"),
            sage_server_path: PathBuf::from("./sage_server.py"),
            sage_timeout: DEFAULT_RESPONSE_TIMEOUT,
            remote_user_header: "ufshib_glid".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset or empty keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = get("HOST") {
            config.host = host;
        }
        if let Some(port) = get("PORT") {
            config.port = parse("PORT", &port)?;
        }
        if let Some(flag) = get("AWAIT_EXPLICIT_SHUTDOWN") {
            config.await_explicit_shutdown = parse_bool("AWAIT_EXPLICIT_SHUTDOWN", &flag)?;
        }
        if let Some(dir) = get("REPO_DIR") {
            config.repo_dir = dir.into();
        }
        if let Some(path) = get("GIT_HTTP_BACKEND") {
            config.git_http_backend = path.into();
        }
        if let Some(path) = get("SAGE_SERVER_PATH") {
            config.sage_server_path = path.into();
        }
        if let Some(ms) = get("SAGE_TIMEOUT_MS") {
            let ms: u64 = parse("SAGE_TIMEOUT_MS", &ms)?;
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: "SAGE_TIMEOUT_MS",
                    value: ms.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.sage_timeout = Duration::from_millis(ms);
        }
        if let Some(header) = get("REMOTE_USER_HEADER") {
            config.remote_user_header = header.to_ascii_lowercase();
        }
        Ok(config)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(&self.sage_server_path).with_response_timeout(self.sage_timeout)
    }

    pub fn cgi_config(&self) -> CgiConfig {
        CgiConfig::new(&self.git_http_backend, &self.repo_dir)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
