//! Host-side liveness checks used to reconcile `running` records.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::models::session::{ExecutionMode, SessionRecord};
use crate::multiplexer::Multiplexer;
use crate::persistence::session_repo::LivenessProbe;

/// Checks terminal sessions through the multiplexer and agent-server
/// sessions through their health endpoint.
pub struct HostLiveness {
    multiplexer: Arc<dyn Multiplexer>,
    http: reqwest::Client,
    probe_timeout: Duration,
}

impl HostLiveness {
    /// Create a probe.
    #[must_use]
    pub fn new(multiplexer: Arc<dyn Multiplexer>, http: reqwest::Client, probe_timeout: Duration) -> Self {
        Self {
            multiplexer,
            http,
            probe_timeout,
        }
    }

    /// Health probe against `port` on loopback.
    pub async fn server_alive(&self, port: Option<u16>) -> bool {
        let Some(port) = port else {
            return false;
        };
        let url = format!("http://127.0.0.1:{port}/global/health");
        matches!(
            self.http.get(url).timeout(self.probe_timeout).send().await,
            Ok(resp) if resp.status() == reqwest::StatusCode::OK
        )
    }
}

impl LivenessProbe for HostLiveness {
    fn is_alive<'a>(
        &'a self,
        record: &'a SessionRecord,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match record.execution_mode {
                ExecutionMode::Terminal => {
                    let name = self.multiplexer.session_name(&record.task_name);
                    self.multiplexer.session_exists(&name).await
                }
                ExecutionMode::AgentServer => self.server_alive(record.server.port).await,
            }
        })
    }
}
