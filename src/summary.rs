//! Per-host summaries of a run-state record

use std::fmt::Write as _;

use clusterup_state::{HostEntry, HostStatus, RunStateRecord};
use serde::Serialize;

/// One host's outcome
#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub host: String,
    pub status: HostStatus,
    pub role: Option<String>,
    /// Label (or argv) of the last stage that ran
    pub last_stage: Option<String>,
    pub returncode: Option<i32>,
    /// Trailing stderr of a failed host
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
}

const STDERR_TAIL: usize = 5;

impl HostSummary {
    fn from_entry(host: &str, entry: &HostEntry) -> Self {
        // Cleanup stages run after a failure, so point at the stage that broke
        let last = match entry.host_status {
            HostStatus::Success => entry.commands.last(),
            _ => entry
                .commands
                .iter()
                .rev()
                .find(|c| c.returncode != Some(0))
                .or_else(|| entry.commands.last()),
        };
        let stderr_tail = match (entry.host_status, last) {
            (HostStatus::Success, _) | (_, None) => Vec::new(),
            (_, Some(cmd)) => {
                let lines: Vec<String> = cmd
                    .stderr
                    .iter()
                    .filter(|l| !l.trim().is_empty())
                    .cloned()
                    .collect();
                lines[lines.len().saturating_sub(STDERR_TAIL)..].to_vec()
            }
        };

        Self {
            host: host.to_string(),
            status: entry.host_status,
            role: entry.tags.get("role").cloned(),
            last_stage: last.map(|c| c.stage.clone().unwrap_or_else(|| c.cmd.join(" "))),
            returncode: last.and_then(|c| c.returncode),
            stderr_tail,
        }
    }
}

/// Whole-action rollup
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub action: String,
    pub total_hosts: u64,
    pub succeeded: usize,
    pub failed: usize,
    pub terminated: usize,
    pub running: usize,
    pub unstarted: usize,
    pub hosts: Vec<HostSummary>,
}

impl ActionSummary {
    pub fn from_record(action: &str, record: &RunStateRecord) -> Self {
        Self {
            action: action.to_string(),
            total_hosts: record.total_hosts,
            succeeded: record.count(HostStatus::Success),
            failed: record.count(HostStatus::Failed),
            terminated: record.count(HostStatus::Terminated),
            running: record.count(HostStatus::Running),
            unstarted: record.count(HostStatus::Unstarted),
            hosts: record
                .hosts
                .iter()
                .map(|(host, entry)| HostSummary::from_entry(host, entry))
                .collect(),
        }
    }

    pub fn is_success(&self) -> bool {
        !self.hosts.is_empty() && self.hosts.iter().all(|h| h.status == HostStatus::Success)
    }

    /// 0 when every host succeeded, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Human-readable report
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}: {} host(s), {} succeeded, {} failed, {} terminated",
            self.action, self.total_hosts, self.succeeded, self.failed, self.terminated
        );
        if self.running > 0 || self.unstarted > 0 {
            let _ = writeln!(
                out,
                "  {} running, {} not started",
                self.running, self.unstarted
            );
        }
        for host in &self.hosts {
            let role = host.role.as_deref().unwrap_or("-");
            let _ = write!(out, "  {:<22} {:<13} {:<11}", host.host, role, host.status);
            if host.status != HostStatus::Success {
                if let Some(stage) = &host.last_stage {
                    let rc = host
                        .returncode
                        .map(|rc| rc.to_string())
                        .unwrap_or_else(|| "killed".to_string());
                    let _ = write!(out, " at '{}' (rc {})", stage, rc);
                }
            }
            out.push('\n');
            for line in &host.stderr_tail {
                let _ = writeln!(out, "      {}", line);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterup_state::CommandRecord;
    use std::collections::BTreeMap;

    fn command(stage: &str, rc: Option<i32>, stderr: &[&str]) -> CommandRecord {
        CommandRecord {
            cmd: vec!["sudo".into(), "bash".into()],
            stdout: vec![],
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
            returncode: rc,
            stage: Some(stage.into()),
            date: None,
        }
    }

    fn record() -> RunStateRecord {
        let mut record = RunStateRecord::new();
        record.register_hosts([
            (
                "10.0.0.1:22".to_string(),
                BTreeMap::from([("role".to_string(), "master".to_string())]),
            ),
            (
                "10.0.0.2:22".to_string(),
                BTreeMap::from([("role".to_string(), "agent".to_string())]),
            ),
        ]);
        record.append_command("10.0.0.1:22", command("Installing DC/OS", Some(0), &[]));
        record.finish_host("10.0.0.1:22", HostStatus::Success);
        record.append_command(
            "10.0.0.2:22",
            command("Installing DC/OS", Some(1), &["", "disk full"]),
        );
        record.finish_host("10.0.0.2:22", HostStatus::Failed);
        record
    }

    #[test]
    fn test_counts_and_exit_code() {
        let summary = ActionSummary::from_record("deploy", &record());
        assert_eq!(summary.total_hosts, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.hosts[1].stderr_tail, vec!["disk full"]);
        assert!(summary.hosts[0].stderr_tail.is_empty());
    }

    #[test]
    fn test_render_mentions_failing_stage() {
        let text = ActionSummary::from_record("deploy", &record()).render();
        assert!(text.starts_with("deploy: 2 host(s), 1 succeeded, 1 failed"));
        assert!(text.contains("at 'Installing DC/OS' (rc 1)"));
        assert!(text.contains("disk full"));
    }

    #[test]
    fn test_failed_stage_reported_before_cleanup() {
        let mut record = RunStateRecord::new();
        record.register_hosts([("10.0.0.3:22".to_string(), BTreeMap::new())]);
        record.append_command(
            "10.0.0.3:22",
            command("Copying bootstrap", Some(1), &["scp: No space left on device"]),
        );
        record.append_command(
            "10.0.0.3:22",
            command("Cleaning up temporary directory", Some(0), &[]),
        );
        record.finish_host("10.0.0.3:22", HostStatus::Failed);

        let summary = ActionSummary::from_record("deploy", &record);
        let host = &summary.hosts[0];
        assert_eq!(host.last_stage.as_deref(), Some("Copying bootstrap"));
        assert_eq!(host.returncode, Some(1));
        assert_eq!(host.stderr_tail, vec!["scp: No space left on device"]);
        assert!(summary
            .render()
            .contains("at 'Copying bootstrap' (rc 1)"));
    }

    #[test]
    fn test_terminated_host_points_at_killed_stage() {
        let mut record = RunStateRecord::new();
        record.register_hosts([("10.0.0.4:22".to_string(), BTreeMap::new())]);
        record.append_command("10.0.0.4:22", command("Installing DC/OS", None, &[]));
        record.append_command("10.0.0.4:22", command("Cleaning up", Some(0), &[]));
        record.finish_host("10.0.0.4:22", HostStatus::Terminated);

        let text = ActionSummary::from_record("deploy", &record).render();
        assert!(text.contains("at 'Installing DC/OS' (rc killed)"));
    }

    #[test]
    fn test_empty_record_is_not_success() {
        let summary = ActionSummary::from_record("preflight", &RunStateRecord::new());
        assert_eq!(summary.exit_code(), 1);
    }
}
