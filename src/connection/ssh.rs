//! SSH connector
//!
//! One OpenSSH control master per node (`ssh -N -oControlMaster=yes`);
//! every command and copy after that rides the multiplexed socket, so there
//! is a single handshake per host per run. The control socket and any
//! inline key live in a scratch dir removed when the connection drops.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use super::process::{capture, filter_ssh_warnings, split_lines};
use super::{
    Connection, ConnectionError, ConnectionParams, Connector, KeySource, ProcessResult,
};
use crate::chain::{CopyDirection, CopySpec};
use crate::node::Node;

const CONTROL_SOCKET: &str = "control_socket";
const INLINE_KEY: &str = "key";
const READY_POLL: Duration = Duration::from_millis(100);
const CONTROL_OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Options shared by `ssh` and `scp`. `port_flag` is `-p` for ssh and `-P`
/// for scp.
fn common_options(
    params: &ConnectionParams,
    port: u16,
    key_path: Option<&Path>,
    port_flag: &str,
) -> Vec<String> {
    let mut args = vec![
        format!("-oConnectTimeout={}", params.connect_timeout.as_secs().max(1)),
        "-oStrictHostKeyChecking=no".to_string(),
        "-oUserKnownHostsFile=/dev/null".to_string(),
        "-oBatchMode=yes".to_string(),
        "-oPasswordAuthentication=no".to_string(),
        port_flag.to_string(),
        port.to_string(),
    ];
    if let Some(key) = key_path {
        args.push("-i".to_string());
        args.push(key.to_string_lossy().into_owned());
    }
    args
}

fn write_inline_key(dir: &Path, pem: &str) -> std::io::Result<PathBuf> {
    let path = dir.join(INLINE_KEY);
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(pem.as_bytes())?;
        if !pem.ends_with('\n') {
            file.write_all(b"\n")?;
        }
    }
    #[cfg(not(unix))]
    fs::write(&path, pem)?;
    Ok(path)
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(
        &self,
        node: &Node,
        params: &ConnectionParams,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let connect_err = |message: String| ConnectionError::Connect {
            host: node.key(),
            message,
        };

        let scratch = tempfile::Builder::new()
            .prefix("clusterup-ssh-")
            .tempdir()
            .map_err(|e| connect_err(format!("scratch dir: {}", e)))?;

        let key_path = match &params.key {
            Some(KeySource::Path(path)) => Some(path.clone()),
            Some(KeySource::Inline(pem)) => Some(
                write_inline_key(scratch.path(), pem)
                    .map_err(|e| connect_err(format!("writing key: {}", e)))?,
            ),
            None => None,
        };

        let destination = format!("{}@{}", params.user, node.address());
        let control = scratch.path().join(CONTROL_SOCKET);
        let ssh_options = common_options(params, node.port(), key_path.as_deref(), "-p");
        let scp_options = common_options(params, node.port(), key_path.as_deref(), "-P");

        let mut master = Command::new("ssh");
        master
            .args(&ssh_options)
            .args(&params.extra_ssh_options)
            .arg("-oControlMaster=yes")
            .arg(format!("-oControlPath={}", control.display()))
            .arg("-N")
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let master = master.spawn().map_err(|source| ConnectionError::Spawn {
            program: "ssh".to_string(),
            source,
        })?;

        let mut conn = SshConnection {
            host: node.key(),
            destination,
            control,
            ssh_options,
            scp_options,
            extra_ssh_options: params.extra_ssh_options.clone(),
            process_timeout: params.process_timeout,
            master,
            _scratch: scratch,
        };

        match conn.wait_ready(params.connect_timeout).await {
            Ok(()) => {
                tracing::debug!(host = %conn.host, "ssh control master ready");
                Ok(Box::new(conn))
            }
            Err(message) => {
                let _ = conn.master.start_kill();
                let _ = conn.master.wait().await;
                Err(connect_err(message))
            }
        }
    }
}

/// Multiplexed session to one node.
pub struct SshConnection {
    host: String,
    destination: String,
    control: PathBuf,
    ssh_options: Vec<String>,
    scp_options: Vec<String>,
    extra_ssh_options: Vec<String>,
    process_timeout: Duration,
    master: Child,
    _scratch: TempDir,
}

impl SshConnection {
    fn control_option(&self) -> String {
        format!("-oControlPath={}", self.control.display())
    }

    fn control_command(&self, op: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg(self.control_option())
            .arg("-O")
            .arg(op)
            .arg(&self.destination);
        cmd
    }

    /// Poll `ssh -O check` until the master answers or `timeout` passes.
    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.master.try_wait() {
                let mut stderr = Vec::new();
                if let Some(mut pipe) = self.master.stderr.take() {
                    let _ = pipe.read_to_end(&mut stderr).await;
                }
                let lines = filter_ssh_warnings(split_lines(&stderr));
                return Err(format!(
                    "ssh exited with {}: {}",
                    status,
                    lines.join("\n")
                ));
            }

            if self.control.exists() {
                if let Ok(check) = capture(self.control_command("check"), CONTROL_OP_TIMEOUT).await
                {
                    if check.is_success() {
                        return Ok(());
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(format!("not connected after {}s", timeout.as_secs()));
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{}", self.destination, path)
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn run(
        &mut self,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ProcessResult, ConnectionError> {
        tracing::debug!(host = %self.host, command = ?argv, "running remote command");

        let mut cmd = Command::new("ssh");
        cmd.args(&self.ssh_options)
            .args(&self.extra_ssh_options)
            .arg(self.control_option())
            .arg("-tt")
            .arg(&self.destination)
            .args(argv);

        match capture(cmd, timeout).await {
            Ok(mut result) => {
                result.stderr = filter_ssh_warnings(result.stderr);
                Ok(result)
            }
            Err(ConnectionError::CommandTimeout { timeout, mut output }) => {
                output.stderr = filter_ssh_warnings(output.stderr);
                Err(ConnectionError::CommandTimeout { timeout, output })
            }
            Err(e) => Err(e),
        }
    }

    async fn copy(&mut self, spec: &CopySpec) -> Result<ProcessResult, ConnectionError> {
        let (src, dst) = match spec.direction {
            CopyDirection::ToRemote => (spec.local_path.clone(), self.remote_spec(&spec.remote_path)),
            CopyDirection::FromRemote => (self.remote_spec(&spec.remote_path), spec.local_path.clone()),
        };
        tracing::debug!(host = %self.host, %src, %dst, recursive = spec.recursive, "scp");

        let mut cmd = Command::new("scp");
        if spec.recursive {
            cmd.arg("-r");
        }
        cmd.args(&self.scp_options)
            .arg(self.control_option())
            .arg(&src)
            .arg(&dst);

        let mut result = capture(cmd, self.process_timeout).await?;
        result.stderr = filter_ssh_warnings(result.stderr);
        if !result.is_success() {
            let message = if result.stderr.is_empty() {
                format!("scp exited with {:?}", result.returncode)
            } else {
                result.stderr.join("\n")
            };
            return Err(ConnectionError::Copy {
                message,
                returncode: result.returncode,
            });
        }
        Ok(result)
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        if let Err(e) = capture(this.control_command("exit"), CONTROL_OP_TIMEOUT).await {
            tracing::debug!(host = %this.host, error = %e, "ssh -O exit failed");
        }
        if matches!(this.master.try_wait(), Ok(None)) {
            let _ = this.master.start_kill();
        }
        let _ = this.master.wait().await;
        tracing::debug!(host = %this.host, "closed ssh connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_options() {
        let params = ConnectionParams::default();
        let args = common_options(&params, 2222, Some(Path::new("/keys/id")), "-p");

        assert!(args.contains(&"-oConnectTimeout=10".to_string()));
        assert!(args.contains(&"-oStrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"-oBatchMode=yes".to_string()));
        let port = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[port + 1], "2222");
        assert_eq!(&args[args.len() - 2..], &["-i".to_string(), "/keys/id".to_string()]);
    }

    #[test]
    fn test_scp_uses_capital_port_flag() {
        let args = common_options(&ConnectionParams::default(), 22, None, "-P");
        assert!(args.contains(&"-P".to_string()));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_inline_key_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_inline_key(dir.path(), "-----BEGIN KEY-----").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        // TEST-NET-1 is never routable
        let params = ConnectionParams {
            connect_timeout: Duration::from_secs(1),
            ..ConnectionParams::default()
        };
        let result = SshConnector::new()
            .open(&Node::new("192.0.2.1", 22), &params)
            .await;
        assert!(matches!(
            result,
            Err(ConnectionError::Connect { .. }) | Err(ConnectionError::Spawn { .. })
        ));
    }
}
