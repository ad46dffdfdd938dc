//! Transport layer for banx.
//!
//! Currently provides HTTP transport via axum.

pub mod http;

pub use http::{routes, serve};
