//! HTTP route handlers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{any, get, post},
};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::cgi::{CgiError, CgiRequest, CgiResponse};
use crate::health::Health;
use crate::service::{BanxService, HealthSnapshot};
use crate::version::VersionInfo;
use crate::worker::{ExecuteError, WorkerStatus};

/// Mount point of the git smart HTTP routes; stripped to form `PATH_INFO`.
pub const GIT_MOUNT: &str = "/git/repos";

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    pub worker: WorkerStatus,
    pub version: VersionInfo,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        Self {
            status: snapshot.state,
            worker: snapshot.worker,
            version: snapshot.version,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SageShellRequest {
    pub code: String,
}

async fn health_check(State(service): State<Arc<BanxService>>) -> Json<HealthCheckResponse> {
    Json(service.health().into())
}

fn execute_error_status(err: &ExecuteError) -> StatusCode {
    match err {
        ExecuteError::Worker(_) | ExecuteError::UnexpectedResult(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ExecuteError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ExecuteError::Closed | ExecuteError::Send(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn sage_shell(
    State(service): State<Arc<BanxService>>,
    Json(request): Json<SageShellRequest>,
) -> Response {
    match service.execute(&request.code).await {
        Ok(variables) => (StatusCode::OK, Json(variables)).into_response(),
        Err(e) => {
            let status = execute_error_status(&e);
            tracing::warn!(error = %e, status = status.as_u16(), "Code execution failed");
            let message = match e {
                ExecuteError::Worker(message) => message,
                other => other.to_string(),
            };
            (status, Json(serde_json::json!({ "error": message }))).into_response()
        }
    }
}

async fn git_backend(State(service): State<Arc<BanxService>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let path = parts.uri.path();
    let path_info = path.strip_prefix(GIT_MOUNT).unwrap_or(path);
    let target = match parts.uri.query() {
        Some(query) => format!("{path_info}?{query}"),
        None => path_info.to_string(),
    };
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let remote_user = parts
        .headers
        .get(service.remote_user_header())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let request = CgiRequest {
        method: parts.method,
        target,
        headers: parts.headers,
        remote_user,
        remote_addr,
        body: body.into_data_stream().map_err(io::Error::other).boxed(),
    };

    match service.git(request).await {
        Ok(response) => cgi_response(response),
        Err(e) => cgi_error_response(e),
    }
}

fn cgi_response(response: CgiResponse) -> Response {
    let mut out = Response::new(Body::from_stream(response.body));
    *out.status_mut() = response.status;
    for (name, value) in response.headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().append(name, value);
            }
            _ => tracing::warn!(name, "Dropping CGI header that is not valid HTTP"),
        }
    }
    out
}

fn cgi_error_response(err: CgiError) -> Response {
    tracing::error!(error = %err, "git request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn shutdown(State(service): State<Arc<BanxService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<BanxService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/sage-shell", post(sage_shell))
        .route("/git/repos/{*path}", any(git_backend))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::cgi::{CgiBridge, CgiConfig};
    use crate::worker::WorkerChannel;
    use crate::worker::channel::tests::fake_config;

    const ENV_ECHO: &str = concat!(
        r"printf 'Content-Type: text/plain\r\nCache-Control: no-cache\r\n\r\n';",
        r#" printf '%s %s %s %s %s' "$REQUEST_METHOD" "$PATH_INFO" "$QUERY_STRING" "$REMOTE_USER" "$REMOTE_ADDR""#,
    );

    fn service_with(cgi_script: &str, timeout: Duration) -> Arc<BanxService> {
        let worker = WorkerChannel::start(fake_config().with_response_timeout(timeout)).unwrap();
        let cgi = CgiBridge::new(
            CgiConfig::new("/bin/sh", "/srv/repos").with_args(["-c", cgi_script]),
        );
        Arc::new(BanxService::new(Arc::new(worker), cgi))
    }

    fn service() -> Arc<BanxService> {
        service_with(ENV_ECHO, Duration::from_secs(5))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn response_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn sage_request(code: &str) -> Request<Body> {
        Request::post("/sage-shell")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "code": code }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_check_reports_worker() {
        let service = service();
        let response = routes(service.clone())
            .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "READY");
        assert_eq!(json["worker"]["state"], "running");
        assert_eq!(json["worker"]["restarts"], 0);
        assert!(json["version"]["banx"].is_string());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn sage_shell_returns_variables() {
        let service = service();
        let response = routes(service.clone())
            .oneshot(sage_request("x = 2"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert!(json["pid"].is_string());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn sage_shell_worker_error_is_500() {
        let service = service();
        let response = routes(service.clone())
            .oneshot(sage_request("fail"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        insta::assert_json_snapshot!(response_json(response).await, @r#"
        {
          "error": "boom"
        }
        "#);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn sage_shell_timeout_is_504() {
        let service = service_with(ENV_ECHO, Duration::from_millis(150));
        let response = routes(service.clone())
            .oneshot(sage_request("silent"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = response_json(response).await;
        assert_eq!(json["error"], "a timeout occurred waiting for the worker");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn sage_shell_after_worker_shutdown_is_503() {
        let service = service();
        service.shutdown().await;
        let response = routes(service).oneshot(sage_request("x = 1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn sage_shell_requires_code() {
        let service = service();
        let response = routes(service.clone())
            .oneshot(
                Request::post("/sage-shell")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn git_request_runs_cgi_helper() {
        let service = service();
        let addr: SocketAddr = "192.0.2.10:51000".parse().unwrap();
        let response = routes(service.clone())
            .oneshot(
                Request::get("/git/repos/project.git/info/refs?service=git-upload-pack")
                    .header("ufshib_glid", "alice")
                    .extension(ConnectInfo(addr))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.headers()["cache-control"], "no-cache");
        assert_eq!(
            response_text(response).await,
            "GET /project.git/info/refs service=git-upload-pack alice 192.0.2.10"
        );
        service.shutdown().await;
    }

    #[tokio::test]
    async fn git_request_body_is_forwarded() {
        let service = service_with(
            concat!(
                r"printf 'Status: 201 Created\r\n\r\n';",
                r#" while IFS= read -r line; do printf '%s;' "$line"; done"#,
            ),
            Duration::from_secs(5),
        );
        let response = routes(service.clone())
            .oneshot(
                Request::post("/git/repos/project.git/git-receive-pack")
                    .body(Body::from("0000\nPACK\n"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response_text(response).await, "0000;PACK;");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn git_helper_failure_is_500() {
        let service = service_with("exit 3", Duration::from_secs(5));
        let response = routes(service.clone())
            .oneshot(
                Request::get("/git/repos/project.git/HEAD")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = response_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("exited abnormally"));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_triggers_service_shutdown() {
        let service = service();
        let mut rx = service.shutdown_rx();
        let app = routes(service.clone());

        assert!(!*rx.borrow());

        let response = app
            .oneshot(Request::post("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        service.shutdown().await;
    }
}
