//! Retry-only-failed-hosts
//!
//! Targets come from the previous run's state file: every host whose status
//! is not `success`, rebuilt with the tags it was recorded with. Those
//! entries are pruned before the retry run re-registers them.

use clusterup_state::{RunStateRecord, StateStore};

use super::PipelineResult;
use crate::node::{Node, NodeParseError};

/// Hosts selected for a retry run
#[derive(Debug, Clone)]
pub struct RetryPlan {
    pub nodes: Vec<Node>,
}

impl RetryPlan {
    /// Sorted `address:port` keys
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.nodes.iter().map(Node::key).collect();
        hosts.sort();
        hosts
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Rebuild nodes for every non-successful host in `record`.
pub fn retry_targets(record: &RunStateRecord, default_port: u16) -> Result<Vec<Node>, NodeParseError> {
    record
        .failed_hosts()
        .into_iter()
        .map(|(key, entry)| Node::parse_with_tags(key, default_port, entry.tags.clone()))
        .collect()
}

/// Read `action`'s state and plan a retry. `None` when there is no state or
/// nothing failed.
pub fn plan_retry(
    store: &StateStore,
    action: &str,
    default_port: u16,
) -> PipelineResult<Option<RetryPlan>> {
    let Some(record) = store.read(action)? else {
        return Ok(None);
    };
    let nodes = retry_targets(&record, default_port)?;
    if nodes.is_empty() {
        return Ok(None);
    }
    let plan = RetryPlan { nodes };
    tracing::debug!(action, hosts = ?plan.hosts(), "retry targets");
    Ok(Some(plan))
}

/// Drop the plan's hosts from the state file so the retry run starts them
/// fresh. Hosts that already succeeded stay untouched.
pub fn prune(store: &StateStore, action: &str, plan: &RetryPlan) -> PipelineResult<usize> {
    let removed = store.remove_hosts(action, &plan.hosts())?;
    tracing::debug!(action, removed, "pruned retry hosts from run state");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterup_state::HostStatus;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn tags(role: &str, param: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("role".to_string(), role.to_string()),
            ("dcos_install_param".to_string(), param.to_string()),
        ])
    }

    fn record() -> RunStateRecord {
        let mut record = RunStateRecord::new();
        record.register_hosts([
            ("10.0.0.1:22".to_string(), tags("master", "master")),
            ("10.0.0.2:22".to_string(), tags("agent", "slave")),
            ("10.0.0.3:2222".to_string(), tags("public_agent", "slave_public")),
        ]);
        record.finish_host("10.0.0.1:22", HostStatus::Success);
        record.finish_host("10.0.0.2:22", HostStatus::Failed);
        record.finish_host("10.0.0.3:2222", HostStatus::Terminated);
        record
    }

    #[test]
    fn test_targets_keep_tags_and_ports() {
        let nodes = retry_targets(&record(), 22).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].key(), "10.0.0.2:22");
        assert_eq!(nodes[0].tag("dcos_install_param"), Some("slave"));
        assert_eq!(nodes[1].port(), 2222);
        assert_eq!(nodes[1].tag("role"), Some("public_agent"));
    }

    #[test]
    fn test_plan_and_prune() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());
        store.write("deploy", &record()).unwrap();

        let plan = plan_retry(&store, "deploy", 22).unwrap().unwrap();
        assert_eq!(plan.hosts(), vec!["10.0.0.2:22", "10.0.0.3:2222"]);

        assert_eq!(prune(&store, "deploy", &plan).unwrap(), 2);
        let after = store.read("deploy").unwrap().unwrap();
        assert_eq!(after.hosts.len(), 1);
        assert!(after.hosts.contains_key("10.0.0.1:22"));
    }

    #[test]
    fn test_no_plan_without_state_or_failures() {
        let temp = TempDir::new().unwrap();
        let store = StateStore::new(temp.path());
        assert!(plan_retry(&store, "deploy", 22).unwrap().is_none());

        let mut ok = RunStateRecord::new();
        ok.register_hosts([("10.0.0.1:22".to_string(), BTreeMap::new())]);
        ok.finish_host("10.0.0.1:22", HostStatus::Success);
        store.write("deploy", &ok).unwrap();
        assert!(plan_retry(&store, "deploy", 22).unwrap().is_none());
    }
}
