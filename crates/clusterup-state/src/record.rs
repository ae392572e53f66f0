//! Run-state record (`<action>.json`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::status::HostStatus;

/// One executed stage as seen by the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// The argv that was run (or the copy description)
    pub cmd: Vec<String>,

    /// Captured stdout, one entry per line
    #[serde(default)]
    pub stdout: Vec<String>,

    /// Captured stderr, one entry per line
    #[serde(default)]
    pub stderr: Vec<String>,

    /// Exit code; null when the process was killed
    pub returncode: Option<i32>,

    /// Human-readable stage label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// When the stage finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

/// Everything recorded about one host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostEntry {
    #[serde(default)]
    pub host_status: HostStatus,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub commands: Vec<CommandRecord>,
}

impl HostEntry {
    pub fn unstarted(tags: BTreeMap<String, String>) -> Self {
        Self {
            host_status: HostStatus::Unstarted,
            tags,
            commands: Vec::new(),
        }
    }
}

/// The whole state file for one named action.
///
/// Top-level fields other than `total_hosts` and `hosts` (such as
/// `total_masters`) belong to the caller and are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunStateRecord {
    #[serde(default)]
    pub total_hosts: u64,

    #[serde(default)]
    pub hosts: BTreeMap<String, HostEntry>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunStateRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register hosts for a new run.
    ///
    /// Each host gets a fresh `unstarted` entry carrying its tags. Entries
    /// for hosts not in `hosts` are left alone, so a retry run keeps the
    /// hosts that already succeeded.
    pub fn register_hosts<I>(&mut self, hosts: I)
    where
        I: IntoIterator<Item = (String, BTreeMap<String, String>)>,
    {
        for (key, tags) in hosts {
            self.hosts.insert(key, HostEntry::unstarted(tags));
        }
        self.total_hosts = self.hosts.len() as u64;
    }

    /// Merge caller-owned top-level fields.
    ///
    /// `hosts` and `total_hosts` are engine-owned and cannot be overridden.
    pub fn merge_extra(&mut self, fields: &serde_json::Map<String, serde_json::Value>) {
        for (key, value) in fields {
            if key == "hosts" || key == "total_hosts" {
                continue;
            }
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// Move a host to `running` if it has not started yet.
    pub fn mark_running(&mut self, host: &str) {
        let entry = self.hosts.entry(host.to_string()).or_default();
        if entry.host_status.can_transition_to(HostStatus::Running) {
            entry.host_status = HostStatus::Running;
        }
    }

    /// Append a finished stage to a host's command list.
    pub fn append_command(&mut self, host: &str, command: CommandRecord) {
        let entry = self.hosts.entry(host.to_string()).or_default();
        if entry.host_status == HostStatus::Unstarted {
            entry.host_status = HostStatus::Running;
        }
        entry.commands.push(command);
    }

    /// Record a host's terminal status.
    ///
    /// Returns false (and changes nothing) if the host already finished.
    pub fn finish_host(&mut self, host: &str, status: HostStatus) -> bool {
        let entry = self.hosts.entry(host.to_string()).or_default();
        if !entry.host_status.can_transition_to(status) {
            return false;
        }
        entry.host_status = status;
        true
    }

    /// True if any host is mid-flight.
    pub fn is_running(&self) -> bool {
        self.hosts
            .values()
            .any(|h| h.host_status == HostStatus::Running)
    }

    /// Hosts that did not end in `success`, with their recorded tags.
    ///
    /// `terminated` and `unstarted` hosts count as failed here: a retry must
    /// pick them up too.
    pub fn failed_hosts(&self) -> Vec<(&str, &HostEntry)> {
        self.hosts
            .iter()
            .filter(|(_, entry)| entry.host_status != HostStatus::Success)
            .map(|(key, entry)| (key.as_str(), entry))
            .collect()
    }

    /// Count hosts by status.
    pub fn count(&self, status: HostStatus) -> usize {
        self.hosts
            .values()
            .filter(|h| h.host_status == status)
            .count()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
