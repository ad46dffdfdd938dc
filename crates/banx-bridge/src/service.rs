//! BanxService: transport-agnostic request handling.
//!
//! This service owns:
//! - The shared worker channel (code execution)
//! - The CGI bridge (git smart HTTP)
//! - Shutdown coordination
//!
//! Transports delegate to this service and only translate errors to their own
//! status codes.

use std::sync::Arc;

use tokio::sync::watch;

use crate::cgi::{CgiBridge, CgiError, CgiRequest, CgiResponse};
use crate::health::Health;
use crate::version::VersionInfo;
use crate::worker::{ExecuteError, Variables, WorkerChannel, WorkerStatus};

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: Health,
    pub worker: WorkerStatus,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == Health::Ready
    }
}

pub struct BanxService {
    worker: Arc<WorkerChannel>,
    cgi: CgiBridge,
    remote_user_header: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    version: VersionInfo,
}

impl BanxService {
    pub fn new(worker: Arc<WorkerChannel>, cgi: CgiBridge) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            worker,
            cgi,
            remote_user_header: "ufshib_glid".to_string(),
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn with_remote_user_header(mut self, header: impl Into<String>) -> Self {
        self.remote_user_header = header.into();
        self
    }

    /// Header whose value becomes `REMOTE_USER` for git requests.
    pub fn remote_user_header(&self) -> &str {
        &self.remote_user_header
    }

    pub async fn execute(&self, code: &str) -> Result<Variables, ExecuteError> {
        self.worker.execute(code).await
    }

    pub async fn git(&self, request: CgiRequest) -> Result<CgiResponse, CgiError> {
        self.cgi.handle(request).await
    }

    pub fn health(&self) -> HealthSnapshot {
        let worker = self.worker.status().borrow().clone();
        HealthSnapshot {
            state: Health::from_worker(&worker, *self.shutdown_rx.borrow()),
            worker,
            version: self.version.clone(),
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop the worker subprocess; pending executions fail with `Closed`.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cgi::CgiConfig;
    use crate::worker::WorkerState;
    use crate::worker::channel::tests::fake_config;

    fn service() -> BanxService {
        let worker = Arc::new(WorkerChannel::start(fake_config()).unwrap());
        let cgi = CgiBridge::new(CgiConfig::new("/bin/true", "/srv/repos"));
        BanxService::new(worker, cgi)
    }

    #[tokio::test]
    async fn health_is_ready_with_running_worker() {
        let svc = service();
        let snapshot = svc.health();
        assert!(snapshot.is_ready());
        assert_eq!(snapshot.worker.state, WorkerState::Running);
        assert!(snapshot.worker.pid.is_some());
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_signal_works() {
        let svc = service();
        let mut rx = svc.shutdown_rx();
        assert!(!*rx.borrow());

        svc.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert_eq!(svc.health().state, Health::ShuttingDown);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn execute_after_shutdown_is_closed() {
        let svc = service();
        assert!(svc.execute("x = 1").await.is_ok());

        svc.shutdown().await;
        assert!(matches!(
            svc.execute("x = 1").await,
            Err(ExecuteError::Closed)
        ));
        assert_eq!(svc.health().worker.state, WorkerState::Exited);
    }
}
