//! Connection layer
//!
//! Abstracts how commands reach a host so the runner can be exercised
//! without SSH. Provides:
//! - [`Connector`]: opens one [`Connection`] per node
//! - [`SshConnector`]: OpenSSH with a multiplexed control master
//! - [`LocalConnector`]: runs argv on this machine
//! - [`HostConnector`]: SSH, except for hosts explicitly marked local

pub mod local;
pub mod process;
pub mod ssh;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::chain::CopySpec;
use crate::node::Node;

pub use local::LocalConnector;
pub use ssh::SshConnector;

/// Default bound on simultaneously open connections
pub const DEFAULT_PARALLELISM: usize = 20;

/// Default per-command timeout
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(120);

/// Default SSH connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Output of one stage on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// `None` when the process was killed before it exited
    pub returncode: Option<i32>,
}

impl ProcessResult {
    pub fn is_success(&self) -> bool {
        self.returncode == Some(0)
    }
}

/// Connection-level errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("command timed out after {}s", timeout.as_secs())]
    CommandTimeout {
        timeout: Duration,
        /// Whatever was buffered before the process was killed
        output: ProcessResult,
    },

    #[error("copy failed: {message}")]
    Copy {
        message: String,
        returncode: Option<i32>,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Where the SSH private key comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Key file on disk
    Path(PathBuf),
    /// PEM text, written to the connection's scratch dir with mode 0600
    Inline(String),
}

/// Everything needed to reach the targets of one run.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub user: String,
    pub key: Option<KeySource>,
    pub default_port: u16,
    pub process_timeout: Duration,
    pub connect_timeout: Duration,
    pub parallelism: usize,
    /// Extra `ssh` arguments (not passed to `scp`)
    pub extra_ssh_options: Vec<String>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            user: "centos".to_string(),
            key: None,
            default_port: 22,
            process_timeout: DEFAULT_PROCESS_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            parallelism: DEFAULT_PARALLELISM,
            extra_ssh_options: Vec::new(),
        }
    }
}

/// Opens connections to nodes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a session, failing with [`ConnectionError::Connect`] if it
    /// is not up within `params.connect_timeout`.
    async fn open(
        &self,
        node: &Node,
        params: &ConnectionParams,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// An open session to one node. Not shared across nodes.
#[async_trait]
pub trait Connection: Send {
    /// Run one command, killing it after `timeout`.
    async fn run(
        &mut self,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ProcessResult, ConnectionError>;

    /// Transfer a file or tree.
    async fn copy(&mut self, spec: &CopySpec) -> Result<ProcessResult, ConnectionError>;

    /// Tear down the session and release scratch resources.
    async fn close(self: Box<Self>);
}

/// Sends every node over [`SshConnector`] unless its `address:port` key was
/// explicitly marked local, in which case [`LocalConnector`] runs it on this
/// machine as the current user.
#[derive(Debug, Default)]
pub struct HostConnector {
    ssh: SshConnector,
    local: LocalConnector,
    local_hosts: HashSet<String>,
}

impl HostConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run these node keys locally instead of over SSH.
    pub fn with_local_hosts<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_hosts.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn is_local(&self, node: &Node) -> bool {
        self.local_hosts.contains(&node.key())
    }
}

#[async_trait]
impl Connector for HostConnector {
    async fn open(
        &self,
        node: &Node,
        params: &ConnectionParams,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        if self.is_local(node) {
            self.local.open(node, params).await
        } else {
            self.ssh.open(node, params).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_defaults() {
        let params = ConnectionParams::default();
        assert_eq!(params.user, "centos");
        assert_eq!(params.default_port, 22);
        assert_eq!(params.parallelism, 20);
        assert_eq!(params.process_timeout, Duration::from_secs(120));
        assert_eq!(params.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_timeout_error_message() {
        let err = ConnectionError::CommandTimeout {
            timeout: Duration::from_secs(3),
            output: ProcessResult::default(),
        };
        assert_eq!(err.to_string(), "command timed out after 3s");
    }

    #[test]
    fn test_loopback_is_not_local_by_default() {
        let connector = HostConnector::new();
        assert!(!connector.is_local(&Node::new("127.0.0.1", 22)));
        assert!(!connector.is_local(&Node::new("localhost", 2222)));
    }

    #[test]
    fn test_local_hosts_match_on_port() {
        let connector = HostConnector::new().with_local_hosts(["127.0.0.1:22"]);
        assert!(connector.is_local(&Node::new("127.0.0.1", 22)));
        assert!(!connector.is_local(&Node::new("127.0.0.1", 2222)));
    }

    #[tokio::test]
    async fn test_host_connector_runs_marked_host_locally() {
        let connector = HostConnector::new().with_local_hosts(["127.0.0.1:22"]);
        let node = Node::new("127.0.0.1", 22);
        let mut conn = connector
            .open(&node, &ConnectionParams::default())
            .await
            .unwrap();

        let result = conn
            .run(&["echo".to_string(), "hi".to_string()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.stdout, vec!["hi"]);
        conn.close().await;
    }
}
