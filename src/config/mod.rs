//! Cluster configuration
//!
//! Parses and validates `clusterup.toml`: who to connect as, which hosts
//! play which role, and where the locally generated artifacts live.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::{ConnectionParams, KeySource};
use crate::node::Node;

/// Default config file name
pub const DEFAULT_CONFIG_PATH: &str = "clusterup.toml";

/// Environment fallback for `bootstrap_id`
pub const BOOTSTRAP_ID_ENV: &str = "BOOTSTRAP_ID";

const MAX_SSH_PORT: u16 = 32000;
const MAX_PARALLELISM: usize = 100;

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// SSH user on every target
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// Port used when a host entry has none
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Private key file
    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: PathBuf,

    /// Inline PEM key; takes precedence over `ssh_key_path`
    #[serde(default, skip_serializing)]
    pub ssh_key: Option<String>,

    pub master_list: Vec<String>,

    #[serde(default)]
    pub agent_list: Vec<String>,

    #[serde(default)]
    pub public_agent_list: Vec<String>,

    /// Max simultaneous SSH sessions
    #[serde(default = "default_parallelism")]
    pub ssh_parallelism: usize,

    /// Per-command timeout in seconds
    #[serde(default = "default_process_timeout")]
    pub process_timeout: u64,

    /// SSH connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Extra ssh arguments, whitespace separated
    #[serde(default)]
    pub extra_ssh_options: String,

    /// Configured hosts to run on this machine as the current user instead
    /// of over SSH. Must also appear in a role list.
    #[serde(default)]
    pub local_hosts: Vec<String>,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_serve_dir")]
    pub serve_dir: PathBuf,

    #[serde(default = "default_bootstrap_dir")]
    pub bootstrap_dir: PathBuf,

    #[serde(default = "default_package_list_dir")]
    pub package_list_dir: PathBuf,

    #[serde(default = "default_cluster_packages_path")]
    pub cluster_packages_path: PathBuf,

    /// Bootstrap tarball id; falls back to `$BOOTSTRAP_ID`
    #[serde(default)]
    pub bootstrap_id: Option<String>,
}

fn default_ssh_user() -> String {
    "centos".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_key_path() -> PathBuf {
    PathBuf::from("genconf/ssh_key")
}

fn default_parallelism() -> usize {
    20
}

fn default_process_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("genconf/state")
}

fn default_serve_dir() -> PathBuf {
    PathBuf::from("genconf/serve")
}

fn default_bootstrap_dir() -> PathBuf {
    PathBuf::from("genconf/serve/bootstrap")
}

fn default_package_list_dir() -> PathBuf {
    PathBuf::from("genconf/serve/package_lists")
}

fn default_cluster_packages_path() -> PathBuf {
    PathBuf::from("genconf/cluster_packages.json")
}

/// Errors loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Role a host plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Agent,
    PublicAgent,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Master, Role::Agent, Role::PublicAgent];

    /// Value of the `role` tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Agent => "agent",
            Role::PublicAgent => "public_agent",
        }
    }

    /// Argument the install script expects for this role
    pub fn install_param(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Agent => "slave",
            Role::PublicAgent => "slave_public",
        }
    }

    pub fn list_field(&self) -> &'static str {
        match self {
            Role::Master => "master_list",
            Role::Agent => "agent_list",
            Role::PublicAgent => "public_agent_list",
        }
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("role".to_string(), self.as_str().to_string()),
            (
                "dcos_install_param".to_string(),
                self.install_param().to_string(),
            ),
        ])
    }
}

impl ClusterConfig {
    /// Load configuration from `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh_user.trim().is_empty() {
            return Err(ConfigError::invalid("ssh_user", "must not be empty"));
        }
        if self.ssh_port == 0 || self.ssh_port > MAX_SSH_PORT {
            return Err(ConfigError::invalid(
                "ssh_port",
                format!("must be between 1 and {}, got {}", MAX_SSH_PORT, self.ssh_port),
            ));
        }
        if self.ssh_parallelism == 0 || self.ssh_parallelism > MAX_PARALLELISM {
            return Err(ConfigError::invalid(
                "ssh_parallelism",
                format!(
                    "must be between 1 and {}, got {}",
                    MAX_PARALLELISM, self.ssh_parallelism
                ),
            ));
        }
        if self.process_timeout == 0 {
            return Err(ConfigError::invalid("process_timeout", "must be greater than 0"));
        }
        if self.connect_timeout == 0 {
            return Err(ConfigError::invalid("connect_timeout", "must be greater than 0"));
        }
        if self.master_list.is_empty() {
            return Err(ConfigError::invalid("master_list", "at least one master is required"));
        }

        // Every address may appear once across all role lists
        let mut seen: HashMap<String, &str> = HashMap::new();
        for role in Role::ALL {
            for host in self.hosts_for(role) {
                let node = Node::parse(host, self.ssh_port)
                    .map_err(|e| ConfigError::invalid(role.list_field(), e.to_string()))?;
                if let Some(previous) = seen.insert(node.address().to_string(), role.list_field())
                {
                    return Err(ConfigError::invalid(
                        role.list_field(),
                        format!("{} is already listed in {}", node.address(), previous),
                    ));
                }
            }
        }

        self.local_host_keys()?;
        Ok(())
    }

    /// `address:port` keys of the hosts listed in `local_hosts`.
    pub fn local_host_keys(&self) -> Result<BTreeSet<String>, ConfigError> {
        let configured: BTreeSet<String> = Role::ALL
            .iter()
            .flat_map(|role| self.hosts_for(*role))
            .filter_map(|host| Node::parse(host, self.ssh_port).ok())
            .map(|node| node.key())
            .collect();

        let mut keys = BTreeSet::new();
        for host in &self.local_hosts {
            let key = Node::parse(host, self.ssh_port)
                .map_err(|e| ConfigError::invalid("local_hosts", e.to_string()))?
                .key();
            if !configured.contains(&key) {
                return Err(ConfigError::invalid(
                    "local_hosts",
                    format!("{} is not in any host list", key),
                ));
            }
            keys.insert(key);
        }
        Ok(keys)
    }

    pub fn hosts_for(&self, role: Role) -> &[String] {
        match role {
            Role::Master => &self.master_list,
            Role::Agent => &self.agent_list,
            Role::PublicAgent => &self.public_agent_list,
        }
    }

    /// Every configured host as a tagged node: masters, then agents, then
    /// public agents.
    pub fn nodes(&self) -> Result<Vec<Node>, ConfigError> {
        let mut nodes = Vec::new();
        for role in Role::ALL {
            for host in self.hosts_for(role) {
                let node = Node::parse_with_tags(host, self.ssh_port, role.tags())
                    .map_err(|e| ConfigError::invalid(role.list_field(), e.to_string()))?;
                nodes.push(node);
            }
        }
        tracing::debug!(count = nodes.len(), "resolved target nodes");
        Ok(nodes)
    }

    /// `total_masters` / `total_agents` for the state file's top level
    pub fn node_counts(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("total_masters".to_string(), Value::from(self.master_list.len()));
        fields.insert(
            "total_agents".to_string(),
            Value::from(self.agent_list.len() + self.public_agent_list.len()),
        );
        fields
    }

    pub fn connection_params(&self) -> ConnectionParams {
        let key = match &self.ssh_key {
            Some(pem) if !pem.trim().is_empty() => KeySource::Inline(pem.clone()),
            _ => KeySource::Path(self.ssh_key_path.clone()),
        };
        ConnectionParams {
            user: self.ssh_user.clone(),
            key: Some(key),
            default_port: self.ssh_port,
            process_timeout: Duration::from_secs(self.process_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            parallelism: self.ssh_parallelism,
            extra_ssh_options: self
                .extra_ssh_options
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Configured bootstrap id, else `$BOOTSTRAP_ID`
    pub fn bootstrap_id(&self) -> Option<String> {
        self.bootstrap_id
            .clone()
            .or_else(|| std::env::var(BOOTSTRAP_ID_ENV).ok())
            .filter(|id| !id.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
master_list = ["10.0.0.1"]
"#;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.ssh_user, "centos");
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.ssh_parallelism, 20);
        assert_eq!(config.process_timeout, 120);
        assert_eq!(config.connect_timeout, 10);
        assert_eq!(config.state_dir, PathBuf::from("genconf/state"));
        assert_eq!(config.ssh_key_path, PathBuf::from("genconf/ssh_key"));
    }

    #[test]
    fn test_nodes_carry_role_tags() {
        let config = ClusterConfig::parse(
            r#"
ssh_port = 2222
master_list = ["10.0.0.1"]
agent_list = ["10.0.0.2:22"]
public_agent_list = ["10.0.0.3"]
"#,
        )
        .unwrap();

        let nodes = config.nodes().unwrap();
        let keys: Vec<String> = nodes.iter().map(Node::key).collect();
        assert_eq!(keys, vec!["10.0.0.1:2222", "10.0.0.2:22", "10.0.0.3:2222"]);
        assert_eq!(nodes[1].tag("role"), Some("agent"));
        assert_eq!(nodes[1].tag("dcos_install_param"), Some("slave"));
        assert_eq!(nodes[2].tag("dcos_install_param"), Some("slave_public"));

        let counts = config.node_counts();
        assert_eq!(counts["total_masters"], 1);
        assert_eq!(counts["total_agents"], 2);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let err = ClusterConfig::parse("master_list = [\"a\"]\nssh_port = 40000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "ssh_port"));

        let err = ClusterConfig::parse("master_list = [\"a\"]\nssh_parallelism = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "ssh_parallelism"));

        let err = ClusterConfig::parse("master_list = [\"a\"]\nprocess_timeout = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "process_timeout"));
    }

    #[test]
    fn test_requires_master() {
        let err = ClusterConfig::parse("master_list = []").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "master_list"));

        assert!(matches!(
            ClusterConfig::parse("agent_list = [\"a\"]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_and_malformed_hosts() {
        let err = ClusterConfig::parse(
            "master_list = [\"10.0.0.1\"]\nagent_list = [\"10.0.0.1:2222\"]",
        )
        .unwrap_err();
        assert!(err.to_string().contains("already listed in master_list"));

        let err = ClusterConfig::parse("master_list = [\"fe80::1\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "master_list"));
    }

    #[test]
    fn test_connection_params() {
        let config = ClusterConfig::parse(
            r#"
ssh_user = "core"
master_list = ["10.0.0.1"]
extra_ssh_options = "-oServerAliveInterval=15  -v"
ssh_parallelism = 5
"#,
        )
        .unwrap();

        let params = config.connection_params();
        assert_eq!(params.user, "core");
        assert_eq!(params.parallelism, 5);
        assert_eq!(params.extra_ssh_options, vec!["-oServerAliveInterval=15", "-v"]);
        assert_eq!(
            params.key,
            Some(KeySource::Path(PathBuf::from("genconf/ssh_key")))
        );
    }

    #[test]
    fn test_inline_key_preferred() {
        let config = ClusterConfig::parse(
            "master_list = [\"10.0.0.1\"]\nssh_key = \"-----BEGIN KEY-----\"",
        )
        .unwrap();
        assert!(matches!(
            config.connection_params().key,
            Some(KeySource::Inline(_))
        ));
    }

    #[test]
    fn test_bootstrap_id_from_config() {
        let config =
            ClusterConfig::parse("master_list = [\"a\"]\nbootstrap_id = \"abc123\"").unwrap();
        assert_eq!(config.bootstrap_id().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_local_hosts_are_explicit() {
        let config = ClusterConfig::parse(
            r#"
master_list = ["127.0.0.1"]
agent_list = ["127.0.0.1:2222"]
"#,
        );
        assert!(config.is_err(), "same address twice is rejected");

        let config = ClusterConfig::parse(
            r#"
master_list = ["127.0.0.1"]
agent_list = ["10.0.0.2"]
local_hosts = ["127.0.0.1"]
"#,
        )
        .unwrap();
        let keys = config.local_host_keys().unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["127.0.0.1:22"]);

        let config = ClusterConfig::parse(MINIMAL).unwrap();
        assert!(config.local_host_keys().unwrap().is_empty());
    }

    #[test]
    fn test_local_hosts_must_be_configured() {
        let err = ClusterConfig::parse(
            r#"
master_list = ["127.0.0.1:2222"]
local_hosts = ["127.0.0.1"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "local_hosts"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ClusterConfig::load(Path::new("/nonexistent/clusterup.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
