//! CGI bridge - one helper process per request.
//!
//! Flow:
//! 1. Build the helper environment from the request
//! 2. Spawn the helper, stream the request body into its stdin
//! 3. Decode stdout until the header block completes
//! 4. Return status and headers, with the rest of stdout as a lazy body stream

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use super::codec::{CgiCodec, CgiFrame, CgiHeaders};
use super::env::{CgiEnvInput, build_env, split_target};

pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum CgiError {
    #[error("failed to start CGI helper: {0}")]
    Spawn(#[source] io::Error),
    #[error("CGI helper {0} not captured")]
    Pipe(&'static str),
    #[error("failed to parse header: '{0}'")]
    MalformedHeader(String),
    #[error("CGI helper exited abnormally before sending headers: {0}")]
    AbnormalExit(ExitStatus),
    #[error("CGI helper output ended without a header block")]
    MissingHeaders,
    #[error("CGI I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct CgiConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Exported to the helper as `GIT_PROJECT_ROOT`.
    pub project_root: PathBuf,
}

impl CgiConfig {
    pub fn new(program: impl Into<PathBuf>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            project_root: project_root.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

pub struct CgiRequest {
    pub method: Method,
    /// Path and query relative to the mount point, e.g. `/p.git/info/refs?service=git-upload-pack`.
    pub target: String,
    pub headers: HeaderMap,
    pub remote_user: Option<String>,
    pub remote_addr: Option<IpAddr>,
    pub body: BodyStream,
}

impl fmt::Debug for CgiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgiRequest")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("remote_user", &self.remote_user)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

pub struct CgiResponse {
    pub status: StatusCode,
    /// Helper headers with `Status` removed.
    pub headers: CgiHeaders,
    pub body: BodyStream,
}

impl fmt::Debug for CgiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgiResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct CgiBridge {
    config: Arc<CgiConfig>,
}

impl CgiBridge {
    pub fn new(config: CgiConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Run the helper for one request and wait for its header block.
    pub async fn handle(&self, request: CgiRequest) -> Result<CgiResponse, CgiError> {
        let CgiRequest {
            method,
            target,
            headers,
            remote_user,
            remote_addr,
            body,
        } = request;

        let env = build_env(&CgiEnvInput {
            project_root: &self.config.project_root,
            method: &method,
            target: &target,
            headers: &headers,
            remote_user: remote_user.as_deref(),
            remote_addr,
        });
        let (path_info, _) = split_target(&target);

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(CgiError::Spawn)?;
        tracing::debug!(%method, path_info, pid = ?child.id(), "Spawned CGI helper");

        let stdin = child.stdin.take().ok_or(CgiError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(CgiError::Pipe("stdout"))?;
        tokio::spawn(pipe_request_body(body, stdin));

        let mut frames = FramedRead::new(stdout, CgiCodec::new());
        let mut headers = match frames.next().await {
            Some(Ok(CgiFrame::Headers(headers))) => headers,
            Some(Ok(CgiFrame::Body(_))) => return Err(CgiError::MissingHeaders),
            Some(Err(e)) => {
                tracing::warn!(error = %e, path_info, "CGI helper sent bad headers");
                return Err(e);
            }
            None => {
                let status = child.wait().await?;
                if !status.success() {
                    return Err(CgiError::AbnormalExit(status));
                }
                return Err(CgiError::MissingHeaders);
            }
        };

        let status = parse_status(headers.remove("Status").as_deref());
        tracing::info!(%method, path_info, status = status.as_u16(), "CGI response ready");

        Ok(CgiResponse {
            status,
            headers,
            body: body_stream(BodyState { frames, child }),
        })
    }
}

/// Leading digits of a `Status` value; anything unusable means 200.
pub fn parse_status(value: Option<&str>) -> StatusCode {
    let Some(value) = value else {
        return StatusCode::OK;
    };
    let digits: String = value
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    match digits.parse::<u16>().ok().map(StatusCode::from_u16) {
        Some(Ok(code)) => code,
        _ => {
            tracing::warn!(value, "Unusable CGI Status header, using 200");
            StatusCode::OK
        }
    }
}

async fn pipe_request_body(body: BodyStream, mut stdin: ChildStdin) {
    let mut reader = StreamReader::new(body);
    match tokio::io::copy(&mut reader, &mut stdin).await {
        Ok(bytes) => tracing::trace!(bytes, "Request body delivered to CGI helper"),
        Err(e) => tracing::debug!(error = %e, "Request body not fully delivered to CGI helper"),
    }
}

struct BodyState {
    frames: FramedRead<ChildStdout, CgiCodec>,
    child: Child,
}

impl BodyState {
    async fn finish(mut self) {
        match self.child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::error!(%status, "CGI helper exited abnormally after headers were sent")
            }
            Err(e) => tracing::error!(error = %e, "Failed to wait for CGI helper"),
        }
    }
}

/// Dropping the stream drops the child, which kills it.
fn body_stream(state: BodyState) -> BodyStream {
    futures::stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            match state.frames.next().await {
                Some(Ok(CgiFrame::Body(bytes))) => return Some((Ok(bytes), Some(state))),
                Some(Ok(CgiFrame::Headers(_))) => continue,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "CGI helper stdout failed mid-body");
                    return Some((Err(io::Error::other(e)), None));
                }
                None => {
                    state.finish().await;
                    return None;
                }
            }
        }
    })
    .boxed()
}
