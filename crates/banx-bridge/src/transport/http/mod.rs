//! HTTP transport: routes and server lifecycle.

mod routes;
mod server;

pub use routes::{GIT_MOUNT, HealthCheckResponse, SageShellRequest, routes};
pub use server::serve;
