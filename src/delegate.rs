//! Progress hooks
//!
//! The runner calls a [`Delegate`] after every stage and when a chain ends
//! for a host. Each hook is awaited for at most [`DELEGATE_TIMEOUT`]; a hook
//! that overruns terminates that host's run.

use std::time::Duration;

use async_trait::async_trait;
use clusterup_state::HostStatus;

use crate::connection::ProcessResult;

/// Upper bound on a single hook call
pub const DELEGATE_TIMEOUT: Duration = Duration::from_secs(5);

/// A stage finished on a host.
#[derive(Debug, Clone)]
pub struct StageUpdate {
    pub chain_name: String,
    pub host: String,
    pub stage_index: usize,
    pub label: Option<String>,
    pub cmd: Vec<String>,
    pub result: ProcessResult,
}

/// A chain finished (or was aborted) on a host.
#[derive(Debug, Clone)]
pub struct ChainDone {
    pub chain_name: String,
    pub host: String,
    /// How the chain ended on this host: `success` when every stage it ran
    /// passed (or a best-effort chain gave up), else the failing status
    pub status: HostStatus,
}

#[async_trait]
pub trait Delegate: Send + Sync {
    async fn on_update(&self, _update: &StageUpdate) {}

    async fn on_chain_done(&self, _done: &ChainDone) {}
}

#[derive(Debug, Clone, Default)]
pub struct NoopDelegate;

impl Delegate for NoopDelegate {}

/// Logs a `====> STAGE` header the first time each stage label is seen,
/// and one line per host result.
#[derive(Debug, Default)]
pub struct LogDelegate {
    seen: std::sync::Mutex<std::collections::HashSet<(String, usize)>>,
}

impl LogDelegate {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Delegate for LogDelegate {
    async fn on_update(&self, update: &StageUpdate) {
        let first = {
            let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
            seen.insert((update.chain_name.clone(), update.stage_index))
        };
        if first {
            if let Some(label) = &update.label {
                tracing::info!("====> {}", label);
            }
        }

        if update.result.is_success() {
            tracing::info!(host = %update.host, "====> OK");
        } else {
            tracing::warn!(
                host = %update.host,
                returncode = ?update.result.returncode,
                cmd = %update.cmd.join(" "),
                "====> FAILED"
            );
            for line in update.result.stderr.iter().filter(|l| !l.is_empty()) {
                tracing::warn!(host = %update.host, "{}", line);
            }
        }
    }

    async fn on_chain_done(&self, done: &ChainDone) {
        tracing::debug!(
            host = %done.host,
            chain = %done.chain_name,
            status = %done.status,
            "chain finished"
        );
    }
}
