//! Run-state bookkeeping for one runner invocation
//!
//! Keeps the record in memory and rewrites `<state_dir>/<action>.json` after
//! every change. Write failures never stop a host; the first one is kept and
//! handed back when the run completes.

use std::path::Path;
use std::sync::Mutex as StdMutex;

use clusterup_state::{CommandRecord, HostStatus, RunStateRecord, StateError, StateStore};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::node::Node;

pub(crate) struct Recorder {
    inner: Option<Inner>,
}

struct Inner {
    store: StateStore,
    action: String,
    record: Mutex<RunStateRecord>,
    first_error: StdMutex<Option<StateError>>,
}

impl Recorder {
    /// In-memory only; nothing is persisted.
    pub(crate) fn disabled() -> Self {
        Self { inner: None }
    }

    /// Register `nodes` as fresh `unstarted` targets under the action's lock
    /// and merge `extra` at top level. Fails fast on I/O errors.
    ///
    /// Blocks while another process holds the state lock, so async callers
    /// run it on the blocking pool.
    pub(crate) fn start(
        state_dir: &Path,
        action: &str,
        nodes: &[Node],
        extra: &Map<String, Value>,
    ) -> Result<Self, StateError> {
        let store = StateStore::new(state_dir);
        let record = store.update(action, |record| {
            record.register_hosts(
                nodes
                    .iter()
                    .map(|node| (node.key(), node.tags().clone())),
            );
            record.merge_extra(extra);
            record.clone()
        })?;
        tracing::debug!(
            action,
            total_hosts = record.total_hosts,
            path = %store.path(action).display(),
            "registered run targets"
        );

        Ok(Self {
            inner: Some(Inner {
                store,
                action: action.to_string(),
                record: Mutex::new(record),
                first_error: StdMutex::new(None),
            }),
        })
    }

    pub(crate) async fn mark_running(&self, host: &str) {
        self.apply(|record| record.mark_running(host)).await;
    }

    pub(crate) async fn record_stage(&self, host: &str, chain_name: &str, command: CommandRecord) {
        self.apply(|record| {
            record
                .extra
                .insert("chain_name".to_string(), Value::from(chain_name));
            record.append_command(host, command);
        })
        .await;
    }

    pub(crate) async fn finish(&self, host: &str, status: HostStatus) {
        self.apply(|record| {
            if !record.finish_host(host, status) {
                tracing::debug!(host, %status, "host already finished, keeping first status");
            }
        })
        .await;
    }

    async fn apply<F: FnOnce(&mut RunStateRecord)>(&self, f: F) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut record = inner.record.lock().await;
        f(&mut record);
        if let Err(e) = inner.store.write(&inner.action, &record) {
            tracing::warn!(action = %inner.action, error = %e, "failed to write run state");
            let mut first = inner.first_error.lock().unwrap_or_else(|p| p.into_inner());
            if first.is_none() {
                *first = Some(e);
            }
        }
    }

    /// First write error seen during the run, if any.
    pub(crate) fn take_error(&self) -> Option<StateError> {
        let inner = self.inner.as_ref()?;
        let mut first = inner.first_error.lock().unwrap_or_else(|p| p.into_inner());
        first.take()
    }
}
