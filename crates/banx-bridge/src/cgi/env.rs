//! CGI meta-variables for the git HTTP backend.

use std::net::IpAddr;
use std::path::Path;

use axum::http::{HeaderMap, Method, header};

/// Split a request target into path-info and query string, dropping the `?`.
pub fn split_target(target: &str) -> (&str, &str) {
    target.split_once('?').unwrap_or((target, ""))
}

/// Request facts the helper's environment is built from.
#[derive(Debug, Clone)]
pub struct CgiEnvInput<'a> {
    pub project_root: &'a Path,
    pub method: &'a Method,
    pub target: &'a str,
    pub headers: &'a HeaderMap,
    pub remote_user: Option<&'a str>,
    pub remote_addr: Option<IpAddr>,
}

/// Build the complete helper environment.
///
/// Unknown client facts are passed as empty strings. The optional entries only
/// appear when the request carries the matching header.
pub fn build_env(input: &CgiEnvInput<'_>) -> Vec<(&'static str, String)> {
    let (path_info, query) = split_target(input.target);
    let header_value = |name: &header::HeaderName| {
        input
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let mut env = vec![
        (
            "GIT_PROJECT_ROOT",
            input.project_root.to_string_lossy().into_owned(),
        ),
        ("GIT_HTTP_EXPORT_ALL", String::new()),
        ("PATH_INFO", path_info.to_string()),
        ("REMOTE_USER", input.remote_user.unwrap_or_default().to_string()),
        (
            "REMOTE_ADDR",
            input.remote_addr.map(|a| a.to_string()).unwrap_or_default(),
        ),
        (
            "CONTENT_TYPE",
            header_value(&header::CONTENT_TYPE).unwrap_or_default(),
        ),
        ("QUERY_STRING", query.to_string()),
        ("REQUEST_METHOD", input.method.as_str().to_string()),
    ];

    if let Some(length) = header_value(&header::CONTENT_LENGTH) {
        env.push(("CONTENT_LENGTH", length));
    }
    if let Some(encoding) = header_value(&header::CONTENT_ENCODING) {
        env.push(("HTTP_CONTENT_ENCODING", encoding));
    }
    if let Some(protocol) = input
        .headers
        .get("git-protocol")
        .and_then(|v| v.to_str().ok())
    {
        env.push(("GIT_PROTOCOL", protocol.to_string()));
    }
    env
}
