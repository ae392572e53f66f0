//! Multi-host runner
//!
//! Fans out one task per node behind a parallelism gate. Each task opens a
//! single connection, walks every chain's stages in order, and stops at the
//! first failure (cleanup chains excepted). Progress flows to the delegate
//! and, with a state dir, to `<state_dir>/<action>.json`.

mod recorder;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clusterup_state::{CommandRecord, HostStatus, StateError};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::chain::{CommandChain, ResolvedStage};
use crate::connection::process::split_lines;
use crate::connection::{Connection, ConnectionError, ConnectionParams, Connector, ProcessResult};
use crate::delegate::{ChainDone, Delegate, NoopDelegate, StageUpdate, DELEGATE_TIMEOUT};
use crate::node::Node;

use recorder::Recorder;

/// Return code recorded when the connection could not be opened
pub const CONNECT_FAILURE_RETURNCODE: i32 = 255;

/// Return code recorded when the command could not be started at all
pub const SPAWN_FAILURE_RETURNCODE: i32 = 127;

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("run state: {0}")]
    State(#[from] StateError),

    #[error("run state task did not complete: {0}")]
    Blocking(#[source] tokio::task::JoinError),

    #[error("host task for {host} did not complete: {source}")]
    Join {
        host: String,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// Per-invocation options
#[derive(Clone)]
pub struct RunOptions {
    /// Persist run-state here when set
    pub state_dir: Option<PathBuf>,
    /// State file name; defaults to the first chain's name
    pub action: Option<String>,
    /// Merged into the state file's top level
    pub extra_fields: Map<String, Value>,
    pub delegate: Arc<dyn Delegate>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            state_dir: None,
            action: None,
            extra_fields: Map::new(),
            delegate: Arc::new(NoopDelegate),
        }
    }
}

impl RunOptions {
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_extra_fields(mut self, fields: Map<String, Value>) -> Self {
        self.extra_fields = fields;
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.delegate = delegate;
        self
    }
}

/// One stage's results across hosts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageResult {
    pub hosts: BTreeMap<String, ProcessResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainResult {
    pub name: String,
    pub stages: Vec<StageResult>,
}

/// Everything a run produced: `[chain][stage]{host: result}` plus each
/// host's final status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub chains: Vec<ChainResult>,
    pub hosts: BTreeMap<String, HostStatus>,
}

impl RunResult {
    pub fn all_succeeded(&self) -> bool {
        self.hosts.values().all(|s| *s == HostStatus::Success)
    }

    /// Hosts that did not end in `success`, sorted.
    pub fn failed_hosts(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|(_, s)| **s != HostStatus::Success)
            .map(|(h, _)| h.as_str())
            .collect()
    }
}

/// Drives command chains over a fixed node list.
pub struct Runner {
    nodes: Vec<Node>,
    connector: Arc<dyn Connector>,
    params: ConnectionParams,
}

impl Runner {
    pub fn new(nodes: Vec<Node>, connector: Arc<dyn Connector>, params: ConnectionParams) -> Self {
        Self {
            nodes,
            connector,
            params,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Run to completion and return every result.
    pub async fn run(
        &self,
        chains: Vec<CommandChain>,
        options: RunOptions,
    ) -> Result<RunResult, RunnerError> {
        self.spawn(chains, options).await?.wait().await
    }

    /// Start the run and return once every host task is spawned.
    ///
    /// Target registration happens before this returns, so a state error
    /// here means no host was touched. Registration takes the state lock on
    /// the blocking pool.
    pub async fn spawn(
        &self,
        chains: Vec<CommandChain>,
        options: RunOptions,
    ) -> Result<RunHandle, RunnerError> {
        let action = options
            .action
            .clone()
            .or_else(|| chains.first().map(|c| c.name().to_string()))
            .unwrap_or_else(|| "run".to_string());

        let recorder = match &options.state_dir {
            Some(dir) => {
                let dir = dir.clone();
                let action = action.clone();
                let nodes = self.nodes.clone();
                let extra = options.extra_fields.clone();
                tokio::task::spawn_blocking(move || Recorder::start(&dir, &action, &nodes, &extra))
                    .await
                    .map_err(RunnerError::Blocking)??
            }
            None => Recorder::disabled(),
        };

        tracing::debug!(
            action = %action,
            hosts = self.nodes.len(),
            chains = chains.len(),
            parallelism = self.params.parallelism,
            "starting run"
        );

        let shape = chains
            .iter()
            .map(|c| (c.name().to_string(), c.len()))
            .collect();

        let ctx = Arc::new(TaskContext {
            chains,
            connector: Arc::clone(&self.connector),
            params: self.params.clone(),
            gate: Arc::new(Semaphore::new(self.params.parallelism.max(1))),
            delegate: options.delegate,
            recorder,
        });

        let tasks = self
            .nodes
            .iter()
            .cloned()
            .map(|node| {
                let ctx = Arc::clone(&ctx);
                (node.key(), tokio::spawn(run_host(ctx, node)))
            })
            .collect();

        Ok(RunHandle { shape, tasks, ctx })
    }
}

/// A run in flight.
pub struct RunHandle {
    shape: Vec<(String, usize)>,
    tasks: Vec<(String, JoinHandle<HostOutcome>)>,
    ctx: Arc<TaskContext>,
}

impl RunHandle {
    /// Wait for every host task, then assemble the results.
    ///
    /// A state write failure during the run is reported here, after all
    /// hosts have finished.
    pub async fn wait(self) -> Result<RunResult, RunnerError> {
        let mut result = RunResult {
            chains: self
                .shape
                .iter()
                .map(|(name, len)| ChainResult {
                    name: name.clone(),
                    stages: vec![StageResult::default(); *len],
                })
                .collect(),
            hosts: BTreeMap::new(),
        };

        let mut join_error = None;
        for (host, task) in self.tasks {
            match task.await {
                Ok(outcome) => {
                    for (ci, si, process) in outcome.results {
                        result.chains[ci].stages[si]
                            .hosts
                            .insert(outcome.host.clone(), process);
                    }
                    result.hosts.insert(outcome.host, outcome.status);
                }
                Err(source) => {
                    tracing::error!(host = %host, error = %source, "host task panicked");
                    self.ctx.recorder.finish(&host, HostStatus::Terminated).await;
                    result.hosts.insert(host.clone(), HostStatus::Terminated);
                    if join_error.is_none() {
                        join_error = Some(RunnerError::Join { host, source });
                    }
                }
            }
        }

        if let Some(e) = self.ctx.recorder.take_error() {
            return Err(e.into());
        }
        if let Some(e) = join_error {
            return Err(e);
        }
        Ok(result)
    }
}

struct TaskContext {
    chains: Vec<CommandChain>,
    connector: Arc<dyn Connector>,
    params: ConnectionParams,
    gate: Arc<Semaphore>,
    delegate: Arc<dyn Delegate>,
    recorder: Recorder,
}

struct HostOutcome {
    host: String,
    status: HostStatus,
    results: Vec<(usize, usize, ProcessResult)>,
}

impl TaskContext {
    async fn notify_update(&self, update: StageUpdate) -> bool {
        let ok = tokio::time::timeout(DELEGATE_TIMEOUT, self.delegate.on_update(&update))
            .await
            .is_ok();
        if !ok {
            tracing::error!(
                host = %update.host,
                chain = %update.chain_name,
                "stage update hook timed out"
            );
        }
        ok
    }

    async fn notify_done(&self, done: ChainDone) -> bool {
        let ok = tokio::time::timeout(DELEGATE_TIMEOUT, self.delegate.on_chain_done(&done))
            .await
            .is_ok();
        if !ok {
            tracing::error!(
                host = %done.host,
                chain = %done.chain_name,
                "chain done hook timed out"
            );
        }
        ok
    }

    /// Record one stage result everywhere it goes. Returns false if the
    /// delegate overran.
    #[allow(clippy::too_many_arguments)]
    async fn report(
        &self,
        host: &str,
        chain_index: usize,
        stage_index: usize,
        label: Option<String>,
        cmd: Vec<String>,
        result: &ProcessResult,
        outcome: &mut HostOutcome,
    ) -> bool {
        let chain_name = self.chains[chain_index].name().to_string();
        self.recorder
            .record_stage(
                host,
                &chain_name,
                CommandRecord {
                    cmd: cmd.clone(),
                    stdout: result.stdout.clone(),
                    stderr: result.stderr.clone(),
                    returncode: result.returncode,
                    stage: label.clone(),
                    date: Some(Utc::now()),
                },
            )
            .await;
        outcome
            .results
            .push((chain_index, stage_index, result.clone()));

        self.notify_update(StageUpdate {
            chain_name,
            host: host.to_string(),
            stage_index,
            label,
            cmd,
            result: result.clone(),
        })
        .await
    }
}

async fn run_host(ctx: Arc<TaskContext>, node: Node) -> HostOutcome {
    let host = node.key();
    let mut outcome = HostOutcome {
        host: host.clone(),
        status: HostStatus::Unstarted,
        results: Vec::new(),
    };

    let permit = match Arc::clone(&ctx.gate).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            outcome.status = HostStatus::Terminated;
            ctx.recorder.finish(&host, outcome.status).await;
            return outcome;
        }
    };

    if ctx.chains.iter().all(CommandChain::is_empty) {
        outcome.status = HostStatus::Success;
        ctx.recorder.finish(&host, outcome.status).await;
        for chain in &ctx.chains {
            ctx.notify_done(ChainDone {
                chain_name: chain.name().to_string(),
                host: host.clone(),
                status: HostStatus::Success,
            })
            .await;
        }
        return outcome;
    }

    ctx.recorder.mark_running(&host).await;

    let mut conn = match ctx.connector.open(&node, &ctx.params).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(host = %host, error = %e, "connection failed");
            record_connect_failure(&ctx, &node, &e, &mut outcome).await;
            ctx.recorder.finish(&host, outcome.status).await;
            drop(permit);
            return outcome;
        }
    };
    tracing::debug!(host = %host, "connection open");

    let failure = run_chains(&ctx, &node, conn.as_mut(), &mut outcome).await;

    conn.close().await;
    drop(permit);

    outcome.status = failure.unwrap_or(HostStatus::Success);
    ctx.recorder.finish(&host, outcome.status).await;
    tracing::debug!(host = %host, status = %outcome.status, "host finished");
    outcome
}

/// Walk every chain on an open connection. Returns the failing status, or
/// `None` if every required stage passed.
async fn run_chains(
    ctx: &TaskContext,
    node: &Node,
    conn: &mut dyn Connection,
    outcome: &mut HostOutcome,
) -> Option<HostStatus> {
    let host = node.key();
    let mut failure: Option<HostStatus> = None;

    for (ci, chain) in ctx.chains.iter().enumerate() {
        if failure.is_some() && !chain.is_cleanup() {
            continue;
        }

        let mut chain_failure: Option<HostStatus> = None;
        for (si, stage) in chain.stages().iter().enumerate() {
            let label = stage.label(node);
            let resolved = stage.resolve(node);
            let cmd = resolved.describe();
            let (result, stage_failure) = execute(ctx, conn, resolved).await;

            let hook_ok = ctx
                .report(&host, ci, si, label, cmd, &result, outcome)
                .await;
            let stage_failure = match stage_failure {
                None if !hook_ok => Some(HostStatus::Terminated),
                // Only a nonzero exit is tolerated; timeouts still stop the host
                Some(HostStatus::Failed) if hook_ok && chain.is_best_effort() => {
                    tracing::debug!(
                        host = %host,
                        chain = %chain.name(),
                        stage = si,
                        "best-effort stage failed, continuing"
                    );
                    break;
                }
                other => other,
            };

            if let Some(status) = stage_failure {
                chain_failure = Some(status);
                failure.get_or_insert(status);
                break;
            }
        }

        let hook_ok = ctx
            .notify_done(ChainDone {
                chain_name: chain.name().to_string(),
                host: host.clone(),
                status: chain_failure.unwrap_or(HostStatus::Success),
            })
            .await;
        if !hook_ok {
            failure.get_or_insert(HostStatus::Terminated);
        }
    }

    failure
}

/// Run one resolved stage and classify the outcome.
async fn execute(
    ctx: &TaskContext,
    conn: &mut dyn Connection,
    stage: ResolvedStage,
) -> (ProcessResult, Option<HostStatus>) {
    match stage {
        ResolvedStage::Execute { command } => {
            match conn.run(&command, ctx.params.process_timeout).await {
                Ok(result) => {
                    let failure = (!result.is_success()).then_some(HostStatus::Failed);
                    (result, failure)
                }
                Err(ConnectionError::CommandTimeout { output, .. }) => {
                    (output, Some(HostStatus::Terminated))
                }
                Err(e) => (error_result(&e, SPAWN_FAILURE_RETURNCODE), Some(HostStatus::Failed)),
            }
        }
        ResolvedStage::Copy(spec) => match conn.copy(&spec).await {
            Ok(result) => (result, None),
            Err(ConnectionError::CommandTimeout { output, .. }) => {
                (output, Some(HostStatus::Terminated))
            }
            Err(ConnectionError::Copy {
                message,
                returncode,
            }) => (
                ProcessResult {
                    stdout: Vec::new(),
                    stderr: split_lines(message.as_bytes()),
                    returncode: Some(returncode.unwrap_or(1)),
                },
                Some(HostStatus::Failed),
            ),
            Err(e) => (error_result(&e, 1), Some(HostStatus::Failed)),
        },
    }
}

fn error_result(err: &ConnectionError, returncode: i32) -> ProcessResult {
    ProcessResult {
        stdout: Vec::new(),
        stderr: vec![err.to_string()],
        returncode: Some(returncode),
    }
}

/// A connect error counts as the failure of the host's first stage.
async fn record_connect_failure(
    ctx: &TaskContext,
    node: &Node,
    err: &ConnectionError,
    outcome: &mut HostOutcome,
) {
    let host = node.key();
    outcome.status = HostStatus::Failed;

    let Some((ci, chain)) = ctx
        .chains
        .iter()
        .enumerate()
        .find(|(_, chain)| !chain.is_empty())
    else {
        return;
    };
    let stage = &chain.stages()[0];
    let result = error_result(err, CONNECT_FAILURE_RETURNCODE);

    ctx.report(
        &host,
        ci,
        0,
        stage.label(node),
        stage.resolve(node).describe(),
        &result,
        outcome,
    )
    .await;
    ctx.notify_done(ChainDone {
        chain_name: chain.name().to_string(),
        host,
        status: HostStatus::Failed,
    })
    .await;
}
