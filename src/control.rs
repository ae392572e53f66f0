//! Action lifecycle control
//!
//! Decides whether a requested action starts, retries, or is skipped based
//! on the previous run's state file, and tracks the current action.

use std::sync::Mutex;

use clusterup_state::RunStateRecord;

use crate::pipeline::{Action, Pipeline, PipelineResult};
use crate::runner::RunResult;

/// What `start` did
#[derive(Debug)]
pub enum StartOutcome {
    /// Ran from a clean state file
    Started(RunResult),
    /// A previous run still has a host in `running`
    AlreadyRunning,
    /// A non re-runnable action already has state
    AlreadyExecuted,
    /// Deploy re-ran only on the previously failed hosts
    Retried { hosts: Vec<String>, result: RunResult },
}

impl StartOutcome {
    /// Status line in the control surface's wording
    pub fn message(&self, action: Action) -> String {
        match self {
            StartOutcome::Started(_) => format!("{} started", action),
            StartOutcome::AlreadyRunning => format!("{} is running, skipping", action),
            StartOutcome::AlreadyExecuted => format!("{} was already executed, skipping", action),
            StartOutcome::Retried { hosts, .. } => format!("retried: {}", hosts.join(", ")),
        }
    }

    pub fn result(&self) -> Option<&RunResult> {
        match self {
            StartOutcome::Started(result) | StartOutcome::Retried { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Serializes action starts for one state directory.
pub struct ActionController {
    pipeline: Pipeline,
    current: Mutex<Option<Action>>,
}

impl ActionController {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            current: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The most recently started or queried action.
    pub fn current_action(&self) -> Option<Action> {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_current(&self, action: Action) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(action);
    }

    /// Persisted state for `action`, if it has ever run.
    pub fn status(&self, action: Action) -> PipelineResult<Option<RunStateRecord>> {
        self.set_current(action);
        Ok(self.pipeline.store().read(action.as_str())?)
    }

    /// Start `action`, applying the re-run rules:
    /// a running prior attempt blocks everything; `deploy` with `retry`
    /// re-runs failed hosts; other prior state blocks non re-runnable
    /// actions and is cleared for checks.
    pub async fn start(&self, action: Action, retry: bool) -> PipelineResult<StartOutcome> {
        self.set_current(action);
        let store = self.pipeline.store();

        if let Some(record) = store.read(action.as_str())? {
            if record.is_running() {
                tracing::info!(%action, "action is running, skipping");
                return Ok(StartOutcome::AlreadyRunning);
            }

            if action == Action::Deploy && retry {
                if let Some((plan, result)) = self.pipeline.retry_deploy().await? {
                    return Ok(StartOutcome::Retried {
                        hosts: plan.hosts(),
                        result,
                    });
                }
            }

            if !action.is_rerunnable() {
                tracing::info!(%action, "action was already executed, skipping");
                return Ok(StartOutcome::AlreadyExecuted);
            }

            store.unlink(action.as_str())?;
        }

        tracing::info!(%action, "starting action");
        let result = self.pipeline.run_action(action).await?;
        Ok(StartOutcome::Started(result))
    }
}
