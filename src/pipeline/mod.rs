//! Staged cluster pipeline
//!
//! Composes command chains for each cluster action and runs them through
//! the [`Runner`]:
//! - preflight: copy the install script and run its preflight-only mode
//! - deploy: ship packages, bootstrap and package list, then install per role
//! - postflight: node checks on every host plus a cluster check on the first
//! - uninstall, install_prereqs
//!
//! Every chain set is bracketed by creating and removing the remote scratch
//! workspace [`REMOTE_TEMP_DIR`].

pub mod artifacts;
pub mod retry;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use clusterup_state::{HostStatus, StateError, StateStore};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::chain::{argv, CommandChain, Param};
use crate::config::{ClusterConfig, ConfigError};
use crate::connection::Connector;
use crate::delegate::{Delegate, NoopDelegate};
use crate::node::{Node, NodeParseError};
use crate::runner::{RunOptions, RunResult, Runner, RunnerError};

use artifacts::DeployArtifacts;
use retry::RetryPlan;

/// Remote scratch workspace created before and removed after every action
pub const REMOTE_TEMP_DIR: &str = "/opt/dcos_install_tmp";

/// Command the postflight checks wrap
pub const CHECK_RUNNER_CMD: &str = "/opt/mesosphere/bin/dcos-check-runner check";

/// State file of the single-host cluster check
pub const CLUSTER_POSTFLIGHT: &str = "cluster_postflight";

/// Seconds the postflight loop keeps retrying a failing check
pub const POSTFLIGHT_WAIT_SECS: u64 = 900;

const INSTALL_PREREQS_SCRIPT: &str = include_str!("scripts/install_prereqs.sh");

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    #[error("invalid artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("run error: {0}")]
    Runner(#[from] RunnerError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("invalid host in run state: {0}")]
    InvalidHost(#[from] NodeParseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::MissingArtifact(_) => 3,
            PipelineError::InvalidArtifact { .. } => 3,
            PipelineError::Runner(RunnerError::State(_)) => 4,
            PipelineError::Runner(_) => 5,
            PipelineError::State(_) => 4,
            PipelineError::InvalidHost(_) => 4,
            PipelineError::Io(_) => 1,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Named cluster actions. The name doubles as the state file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Preflight,
    Deploy,
    Postflight,
    Uninstall,
    InstallPrereqs,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Preflight,
        Action::Deploy,
        Action::Postflight,
        Action::Uninstall,
        Action::InstallPrereqs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Preflight => "preflight",
            Action::Deploy => "deploy",
            Action::Postflight => "postflight",
            Action::Uninstall => "uninstall",
            Action::InstallPrereqs => "install_prereqs",
        }
    }

    /// Checks may be run again once finished; mutating actions may not.
    pub fn is_rerunnable(&self) -> bool {
        matches!(self, Action::Preflight | Action::Postflight)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.replace('-', "_");
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| format!("unknown action: {}", s))
    }
}

/// Append the scratch workspace setup steps.
pub fn add_pre_action(chain: &mut CommandChain, ssh_user: &str) {
    chain.add_execute(
        ["sudo", "mkdir", "-p", REMOTE_TEMP_DIR],
        "Creating temp directory",
    );
    chain.add_execute(
        vec![
            "sudo".to_string(),
            "chown".to_string(),
            ssh_user.to_string(),
            REMOTE_TEMP_DIR.to_string(),
        ],
        format!("Ensuring {} owns temporary directory", ssh_user),
    );
}

/// Append the scratch workspace removal step.
pub fn add_post_action(chain: &mut CommandChain) {
    chain.add_execute(
        ["sudo", "rm", "-rf", REMOTE_TEMP_DIR],
        "Cleaning up temporary directory",
    );
}

fn remote_path(parts: &[&str]) -> String {
    let mut path = REMOTE_TEMP_DIR.to_string();
    for part in parts {
        path.push('/');
        path.push_str(part);
    }
    path
}

fn local(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Poll a check command for up to [`POSTFLIGHT_WAIT_SECS`] so a cluster
/// that is still booting is not reported as failed.
fn check_script(check_type: &str) -> String {
    format!(
        r#"
T={wait}
until OUT=$(sudo /opt/mesosphere/bin/dcos-shell {cmd} {check_type}) || [[ T -eq 0 ]]; do
    sleep 1
    let T=T-1
done
RETCODE=$?
echo $OUT
exit $RETCODE"#,
        wait = POSTFLIGHT_WAIT_SECS,
        cmd = CHECK_RUNNER_CMD,
        check_type = check_type
    )
}

/// Builds and runs the chains for each action against a cluster config.
pub struct Pipeline {
    config: ClusterConfig,
    connector: Arc<dyn Connector>,
    state_dir: PathBuf,
    delegate: Arc<dyn Delegate>,
}

impl Pipeline {
    pub fn new(config: ClusterConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            state_dir: config.state_dir.clone(),
            config,
            connector,
            delegate: Arc::new(NoopDelegate),
        }
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.delegate = delegate;
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.state_dir)
    }

    fn runner(&self, nodes: Vec<Node>) -> Runner {
        Runner::new(nodes, Arc::clone(&self.connector), self.config.connection_params())
    }

    fn options(&self, action: &str, extra: Map<String, Value>) -> RunOptions {
        RunOptions::default()
            .with_state_dir(&self.state_dir)
            .with_action(action)
            .with_extra_fields(extra)
            .with_delegate(Arc::clone(&self.delegate))
    }

    /// Run `action` against every configured host.
    pub async fn run_action(&self, action: Action) -> PipelineResult<RunResult> {
        match action {
            Action::Preflight => self.preflight().await,
            Action::Deploy => self.deploy(None, false).await,
            Action::Postflight => self.postflight().await,
            Action::Uninstall => self.uninstall().await,
            Action::InstallPrereqs => self.install_prereqs().await,
        }
    }

    pub async fn preflight(&self) -> PipelineResult<RunResult> {
        let script = artifacts::install_script(&self.config)?;
        let script_name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifacts::INSTALL_SCRIPT.to_string());

        let mut chain = CommandChain::new("preflight");
        add_pre_action(&mut chain, &self.config.ssh_user);
        chain.add_copy(
            local(&script),
            REMOTE_TEMP_DIR,
            false,
            false,
            Some("Copying preflight script"),
        );
        chain.add_execute(
            argv(&format!(
                "sudo bash {} --preflight-only master",
                remote_path(&[&script_name])
            )),
            "Executing preflight check",
        );

        let mut cleanup = CommandChain::cleanup("preflight_cleanup");
        add_post_action(&mut cleanup);

        let result = self
            .runner(self.config.nodes()?)
            .run(
                vec![chain, cleanup],
                self.options(Action::Preflight.as_str(), self.config.node_counts()),
            )
            .await?;
        Ok(result)
    }

    /// Install on `hosts`, or on every configured host when `None`.
    ///
    /// With `try_remove_stale`, best-effort chains removing a previous
    /// installation run first; a host with nothing to remove still installs.
    pub async fn deploy(
        &self,
        hosts: Option<Vec<Node>>,
        try_remove_stale: bool,
    ) -> PipelineResult<RunResult> {
        let artifacts = DeployArtifacts::resolve(&self.config)?;
        let targets = match hosts {
            Some(hosts) => hosts,
            None => self.config.nodes()?,
        };
        self.run_deploy(targets, &artifacts, try_remove_stale).await
    }

    /// Retry `deploy` on the hosts that did not succeed last time.
    ///
    /// Returns `None` when there is no prior state or nothing failed.
    pub async fn retry_deploy(&self) -> PipelineResult<Option<(RetryPlan, RunResult)>> {
        let store = self.store();
        let action = Action::Deploy.as_str();
        let Some(plan) = retry::plan_retry(&store, action, self.config.ssh_port)? else {
            return Ok(None);
        };

        // Artifacts are checked before the state file is touched
        let artifacts = DeployArtifacts::resolve(&self.config)?;
        let pruned = plan.clone();
        tokio::task::spawn_blocking(move || retry::prune(&store, action, &pruned))
            .await
            .map_err(RunnerError::Blocking)??;

        let result = self
            .run_deploy(plan.nodes.clone(), &artifacts, true)
            .await?;
        Ok(Some((plan, result)))
    }

    async fn run_deploy(
        &self,
        targets: Vec<Node>,
        artifacts: &DeployArtifacts,
        try_remove_stale: bool,
    ) -> PipelineResult<RunResult> {
        let mut chains = Vec::new();
        if try_remove_stale {
            let mut uninstall = CommandChain::best_effort("remove_stale_dcos");
            uninstall.add_execute(
                ["sudo", "-i", "/opt/mesosphere/bin/pkgpanda", "uninstall"],
                "Trying pkgpanda uninstall",
            );
            chains.push(uninstall);

            let mut remove = CommandChain::best_effort("remove_stale_dcos");
            remove.add_execute(
                ["rm", "-rf", "/opt/mesosphere", "/etc/mesosphere"],
                "Removing DC/OS files",
            );
            chains.push(remove);
        }

        let mut chain = CommandChain::new("deploy");
        add_pre_action(&mut chain, &self.config.ssh_user);
        chain.add_copy(
            local(&artifacts.install_script),
            remote_path(&[artifacts::INSTALL_SCRIPT]),
            false,
            false,
            Some("Copying dcos_install.sh"),
        );
        for package in &artifacts.packages {
            let dest = remote_path(&["packages", &package.name]);
            chain.add_execute(
                vec!["mkdir".to_string(), "-p".to_string(), dest.clone()],
                "Creating package directory",
            );
            chain.add_copy(local(&package.path), dest, false, false, Some("Copying packages"));
        }

        let bootstrap_dir = remote_path(&["bootstrap"]);
        chain.add_execute(
            vec!["mkdir".to_string(), "-p".to_string(), bootstrap_dir.clone()],
            "Creating directory",
        );
        chain.add_copy(
            local(&artifacts.bootstrap_tarball),
            bootstrap_dir,
            false,
            false,
            Some("Copying bootstrap"),
        );

        let package_list_dir = remote_path(&["package_lists"]);
        chain.add_execute(
            vec!["mkdir".to_string(), "-p".to_string(), package_list_dir.clone()],
            "Creating directory",
        );
        chain.add_copy(
            local(&artifacts.package_list),
            package_list_dir,
            false,
            false,
            Some("Copying package list"),
        );

        let install_script = remote_path(&[artifacts::INSTALL_SCRIPT]);
        chain.add_execute(
            Param::computed(move |node: &Node| {
                vec![
                    "sudo".to_string(),
                    "bash".to_string(),
                    install_script.clone(),
                    node.tag("dcos_install_param").unwrap_or_default().to_string(),
                ]
            }),
            Param::computed(|_: &Node| "Installing DC/OS".to_string()),
        );
        chains.push(chain);

        let mut cleanup = CommandChain::cleanup("deploy_cleanup");
        add_post_action(&mut cleanup);
        chains.push(cleanup);

        let result = self
            .runner(targets)
            .run(
                chains,
                self.options(Action::Deploy.as_str(), self.config.node_counts()),
            )
            .await?;
        Ok(result)
    }

    /// Node checks on every host and a cluster-wide check on the first
    /// master, run side by side. The cluster check keeps its own state file.
    pub async fn postflight(&self) -> PipelineResult<RunResult> {
        let nodes = self.config.nodes()?;
        let Some(first) = nodes.first().cloned() else {
            return Ok(RunResult::default());
        };
        self.store().unlink(CLUSTER_POSTFLIGHT)?;

        let mut node_chain = CommandChain::new("postflight");
        node_chain.add_execute(
            vec![check_script("node-poststart")],
            "Executing node postflight checks",
        );
        let mut cluster_chain = CommandChain::new(CLUSTER_POSTFLIGHT);
        cluster_chain.add_execute(
            vec![check_script("cluster")],
            "Executing cluster postflight checks",
        );

        let node_runner = self.runner(nodes);
        let cluster_runner = self.runner(vec![first]);
        let (node_result, cluster_result) = tokio::join!(
            node_runner.run(
                vec![node_chain],
                self.options(Action::Postflight.as_str(), self.config.node_counts()),
            ),
            cluster_runner.run(
                vec![cluster_chain],
                self.options(CLUSTER_POSTFLIGHT, Map::new()),
            ),
        );

        Ok(merge_results(node_result?, cluster_result?))
    }

    pub async fn uninstall(&self) -> PipelineResult<RunResult> {
        let mut chain = CommandChain::new("uninstall");
        chain.add_execute(
            [
                "sudo",
                "-i",
                "/opt/mesosphere/bin/pkgpanda",
                "uninstall",
                "&&",
                "sudo",
                "rm",
                "-rf",
                "/opt/mesosphere/",
            ],
            "Uninstalling DC/OS",
        );

        let result = self
            .runner(self.config.nodes()?)
            .run(
                vec![chain],
                self.options(Action::Uninstall.as_str(), self.config.node_counts()),
            )
            .await?;
        Ok(result)
    }

    pub async fn install_prereqs(&self) -> PipelineResult<RunResult> {
        let mut chain = CommandChain::new("install_prereqs");
        // First stage is cheap so the state file shows up right away
        chain.add_execute(
            ["echo", "INSTALL", "PREREQUISITES"],
            "Installing prerequisites",
        );
        chain.add_execute(
            vec![INSTALL_PREREQS_SCRIPT.to_string()],
            "Installing preflight prerequisites",
        );

        let result = self
            .runner(self.config.nodes()?)
            .run(
                vec![chain],
                self.options(Action::InstallPrereqs.as_str(), self.config.node_counts()),
            )
            .await?;
        Ok(result)
    }
}

/// Concatenate chain results; a host that failed either half is failed.
fn merge_results(mut primary: RunResult, secondary: RunResult) -> RunResult {
    primary.chains.extend(secondary.chains);
    for (host, status) in secondary.hosts {
        let entry = primary.hosts.entry(host).or_insert(status);
        if status != HostStatus::Success {
            *entry = status;
        }
    }
    primary
}
