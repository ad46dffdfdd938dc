//! banx-bridge: pipe-based bridges behind the banx HTTP server.
//!
//! - a persistent computation worker spoken to in newline-delimited JSON
//! - a CGI helper (git-http-backend) spawned per request

mod health;
mod version;

pub mod bridge;
pub mod cgi;
pub mod config;
pub mod framing;
pub mod service;
pub mod transport;
pub mod worker;

pub use cgi::{CgiBridge, CgiConfig, CgiError, CgiRequest, CgiResponse};
pub use config::{ConfigError, ServerConfig};
pub use health::Health;
pub use service::{BanxService, HealthSnapshot};
pub use version::{BANX_VERSION, VersionInfo};
pub use worker::{ExecuteError, Variables, WorkerChannel, WorkerConfig, WorkerError, WorkerStatus};
