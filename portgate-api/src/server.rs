//! HTTP/1.1 management server

use crate::routes;
use anyhow::{bail, Context};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use portgate_core::{EventLog, PolicyEngine, RuleStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared handles every request works against
pub struct ApiState {
    pub engine: Arc<PolicyEngine>,
    pub store: RuleStore,
    pub events: Arc<EventLog>,
}

pub struct ManagementApi {
    state: Arc<ApiState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ManagementApi {
    pub fn new(state: ApiState) -> Self {
        Self {
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
            task: None,
            local_addr: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind `addr` and serve in the background. Port 0 picks an ephemeral port.
    pub async fn start(&mut self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        if let Some(bound) = self.local_addr {
            bail!("management API already running at {}", bound);
        }

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind management API to {}", addr))?;
        let local_addr = listener.local_addr()?;

        self.shutdown = CancellationToken::new();
        self.task = Some(tokio::spawn(serve(
            listener,
            self.state.clone(),
            self.shutdown.clone(),
        )));
        self.local_addr = Some(local_addr);

        self.state
            .events
            .log_system(&format!("Management API started at http://{}", local_addr));
        Ok(local_addr)
    }

    /// Stop accepting requests. Requests already being served run to completion.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Management API task failed: {}", e);
            }
        }
        if let Some(addr) = self.local_addr.take() {
            info!("Management API at {} stopped", addr);
        }
    }
}

impl Drop for ManagementApi {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(listener: TcpListener, state: Arc<ApiState>, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Management API accept failed: {}", e);
                    continue;
                }
            },
        };

        debug!("Management connection from {}", peer);
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| routes::handle(req, state.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Error serving {}: {}", peer, e);
            }
        });
    }
}
