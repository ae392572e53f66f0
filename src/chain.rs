//! Command chains
//!
//! A [`CommandChain`] is a named, ordered list of stages (run a command, or
//! copy files) to apply to every target host. Chains are built once and then
//! treated as read-only plans; commands, labels and copy paths may be fixed
//! or computed from the [`Node`] at execution time.

use std::fmt;
use std::sync::Arc;

use crate::node::Node;

/// A value that is either fixed at build time or computed per node.
pub enum Param<T> {
    Literal(T),
    Computed(Arc<dyn Fn(&Node) -> T + Send + Sync>),
}

impl<T: Clone> Param<T> {
    /// Build a per-node value from a closure.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Node) -> T + Send + Sync + 'static,
    {
        Param::Computed(Arc::new(f))
    }

    /// Resolve against one node. Computed values are evaluated on every
    /// call, so callers resolve once per (stage, node).
    pub fn resolve(&self, node: &Node) -> T {
        match self {
            Param::Literal(value) => value.clone(),
            Param::Computed(f) => f(node),
        }
    }
}

impl<T: Clone> Clone for Param<T> {
    fn clone(&self) -> Self {
        match self {
            Param::Literal(value) => Param::Literal(value.clone()),
            Param::Computed(f) => Param::Computed(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Param<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Param::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl From<&str> for Param<String> {
    fn from(value: &str) -> Self {
        Param::Literal(value.to_string())
    }
}

impl From<String> for Param<String> {
    fn from(value: String) -> Self {
        Param::Literal(value)
    }
}

impl From<Vec<String>> for Param<Vec<String>> {
    fn from(value: Vec<String>) -> Self {
        Param::Literal(value)
    }
}

impl From<Vec<&str>> for Param<Vec<String>> {
    fn from(value: Vec<&str>) -> Self {
        Param::Literal(value.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Param<Vec<String>> {
    fn from(value: [&str; N]) -> Self {
        Param::Literal(value.iter().map(|s| s.to_string()).collect())
    }
}

/// Direction of a copy stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    ToRemote,
    FromRemote,
}

/// Run one command on the host.
#[derive(Debug, Clone)]
pub struct ExecuteStage {
    pub command: Param<Vec<String>>,
    pub label: Option<Param<String>>,
}

/// Transfer a file or directory tree.
#[derive(Debug, Clone)]
pub struct CopyStage {
    pub local_path: Param<String>,
    pub remote_path: Param<String>,
    pub direction: CopyDirection,
    pub recursive: bool,
    pub label: Option<Param<String>>,
}

/// Copy with paths already resolved for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySpec {
    pub local_path: String,
    pub remote_path: String,
    pub direction: CopyDirection,
    pub recursive: bool,
}

impl CopySpec {
    /// Argv-style description recorded in the state file's `cmd`.
    pub fn describe(&self) -> Vec<String> {
        let mut cmd = vec!["copy".to_string()];
        if self.recursive {
            cmd.push("-r".to_string());
        }
        match self.direction {
            CopyDirection::ToRemote => {
                cmd.push(self.local_path.clone());
                cmd.push(format!("remote:{}", self.remote_path));
            }
            CopyDirection::FromRemote => {
                cmd.push(format!("remote:{}", self.remote_path));
                cmd.push(self.local_path.clone());
            }
        }
        cmd
    }
}

#[derive(Debug, Clone)]
pub enum Stage {
    Execute(ExecuteStage),
    Copy(CopyStage),
}

/// A stage with every per-node value evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedStage {
    Execute { command: Vec<String> },
    Copy(CopySpec),
}

impl ResolvedStage {
    pub fn describe(&self) -> Vec<String> {
        match self {
            ResolvedStage::Execute { command } => command.clone(),
            ResolvedStage::Copy(spec) => spec.describe(),
        }
    }
}

impl Stage {
    pub fn label(&self, node: &Node) -> Option<String> {
        let label = match self {
            Stage::Execute(stage) => stage.label.as_ref(),
            Stage::Copy(stage) => stage.label.as_ref(),
        };
        label.map(|l| l.resolve(node))
    }

    pub fn resolve(&self, node: &Node) -> ResolvedStage {
        match self {
            Stage::Execute(stage) => ResolvedStage::Execute {
                command: stage.command.resolve(node),
            },
            Stage::Copy(stage) => ResolvedStage::Copy(CopySpec {
                local_path: stage.local_path.resolve(node),
                remote_path: stage.remote_path.resolve(node),
                direction: stage.direction,
                recursive: stage.recursive,
            }),
        }
    }
}

/// How a chain's failures affect the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainKind {
    /// First failing stage fails the host and skips everything after it
    #[default]
    Required,
    /// Still runs after an earlier chain failed on the host
    Cleanup,
    /// A failing stage ends this chain only; the host carries on
    BestEffort,
}

/// Named, ordered sequence of stages.
#[derive(Debug, Clone)]
pub struct CommandChain {
    name: String,
    stages: Vec<Stage>,
    kind: ChainKind,
}

impl CommandChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            kind: ChainKind::Required,
        }
    }

    /// A chain that still runs on a host after an earlier chain failed
    /// there. Its results never turn a failed host into a successful one.
    pub fn cleanup(name: impl Into<String>) -> Self {
        Self {
            kind: ChainKind::Cleanup,
            ..Self::new(name)
        }
    }

    /// A chain whose failures are recorded but never fail the host, e.g.
    /// removing an installation that may not exist.
    pub fn best_effort(name: impl Into<String>) -> Self {
        Self {
            kind: ChainKind::BestEffort,
            ..Self::new(name)
        }
    }

    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_cleanup(&self) -> bool {
        self.kind == ChainKind::Cleanup
    }

    pub fn is_best_effort(&self) -> bool {
        self.kind == ChainKind::BestEffort
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Append a command stage.
    pub fn add_execute(
        &mut self,
        command: impl Into<Param<Vec<String>>>,
        label: impl Into<Param<String>>,
    ) -> &mut Self {
        self.stages.push(Stage::Execute(ExecuteStage {
            command: command.into(),
            label: Some(label.into()),
        }));
        self
    }

    /// Append a command stage with no label.
    pub fn add_execute_unlabeled(&mut self, command: impl Into<Param<Vec<String>>>) -> &mut Self {
        self.stages.push(Stage::Execute(ExecuteStage {
            command: command.into(),
            label: None,
        }));
        self
    }

    /// Insert a command stage before everything else, e.g. a bootstrap step
    /// added after the chain was otherwise built.
    pub fn prepend_command(
        &mut self,
        command: impl Into<Param<Vec<String>>>,
        label: impl Into<Param<String>>,
    ) -> &mut Self {
        self.stages.insert(
            0,
            Stage::Execute(ExecuteStage {
                command: command.into(),
                label: Some(label.into()),
            }),
        );
        self
    }

    /// Append a copy stage.
    pub fn add_copy(
        &mut self,
        local_path: impl Into<Param<String>>,
        remote_path: impl Into<Param<String>>,
        recursive: bool,
        remote_to_local: bool,
        label: Option<&str>,
    ) -> &mut Self {
        self.stages.push(Stage::Copy(CopyStage {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            direction: if remote_to_local {
                CopyDirection::FromRemote
            } else {
                CopyDirection::ToRemote
            },
            recursive,
            label: label.map(Param::from),
        }));
        self
    }
}

/// Convert shell-ish text to argv by splitting on whitespace.
pub fn argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn master() -> Node {
        Node::with_tags(
            "10.0.0.1",
            22,
            BTreeMap::from([("dcos_install_param".to_string(), "master".to_string())]),
        )
    }

    #[test]
    fn test_add_and_prepend_order() {
        let mut chain = CommandChain::new("deploy");
        chain.add_execute(["echo", "second"], "Second");
        chain.add_copy("/tmp/a", "/opt/a", false, false, Some("Copying a"));
        chain.prepend_command(["echo", "first"], "First");

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.stages()[0].label(&master()).as_deref(), Some("First"));
        assert_eq!(chain.stages()[1].label(&master()).as_deref(), Some("Second"));
        assert!(matches!(chain.stages()[2], Stage::Copy(_)));
    }

    #[test]
    fn test_computed_command_resolves_per_node() {
        let mut chain = CommandChain::new("deploy");
        chain.add_execute(
            Param::computed(|node: &Node| {
                argv(&format!(
                    "sudo bash /opt/dcos_install_tmp/dcos_install.sh {}",
                    node.tag("dcos_install_param").unwrap_or_default()
                ))
            }),
            Param::computed(|_: &Node| "Installing DC/OS".to_string()),
        );

        let resolved = chain.stages()[0].resolve(&master());
        assert_eq!(
            resolved,
            ResolvedStage::Execute {
                command: argv("sudo bash /opt/dcos_install_tmp/dcos_install.sh master")
            }
        );
    }

    #[test]
    fn test_computed_values_not_evaluated_at_build_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut chain = CommandChain::new("deploy");
        chain.add_execute(
            Param::computed(move |_: &Node| {
                counter.fetch_add(1, Ordering::SeqCst);
                vec!["true".to_string()]
            }),
            "Noop",
        );

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        chain.stages()[0].resolve(&master());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_copy_description() {
        let mut chain = CommandChain::new("deploy");
        chain.add_copy("/srv/bootstrap", "/opt/tmp/bootstrap", true, false, None);
        chain.add_copy("/tmp/logs", "/var/log/x", false, true, None);

        let to_remote = chain.stages()[0].resolve(&master()).describe();
        assert_eq!(to_remote, vec!["copy", "-r", "/srv/bootstrap", "remote:/opt/tmp/bootstrap"]);
        let from_remote = chain.stages()[1].resolve(&master()).describe();
        assert_eq!(from_remote, vec!["copy", "remote:/var/log/x", "/tmp/logs"]);
        assert_eq!(chain.stages()[0].label(&master()), None);
    }

    #[test]
    fn test_chain_kinds() {
        assert!(CommandChain::cleanup("deploy_cleanup").is_cleanup());
        assert!(!CommandChain::new("deploy").is_cleanup());
        assert_eq!(CommandChain::new("deploy").kind(), ChainKind::Required);

        let stale = CommandChain::best_effort("remove_stale_dcos");
        assert!(stale.is_best_effort());
        assert!(!stale.is_cleanup());
    }
}
