//! Local connector
//!
//! Runs argv directly on this machine and copies with the filesystem.
//! "Remote" paths are just local paths.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use walkdir::WalkDir;

use super::process::capture;
use super::{Connection, ConnectionError, ConnectionParams, Connector, ProcessResult};
use crate::chain::{CopyDirection, CopySpec};
use crate::node::Node;

#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

impl LocalConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn open(
        &self,
        node: &Node,
        _params: &ConnectionParams,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        tracing::debug!(host = %node.key(), "opened local connection");
        Ok(Box::new(LocalConnection { host: node.key() }))
    }
}

#[derive(Debug)]
pub struct LocalConnection {
    host: String,
}

#[async_trait]
impl Connection for LocalConnection {
    async fn run(
        &mut self,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ProcessResult, ConnectionError> {
        let (program, args) = argv.split_first().ok_or_else(|| ConnectionError::Spawn {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
        })?;
        tracing::debug!(host = %self.host, command = ?argv, "running local command");

        let mut command = Command::new(program);
        command.args(args);
        capture(command, timeout).await
    }

    async fn copy(&mut self, spec: &CopySpec) -> Result<ProcessResult, ConnectionError> {
        let (src, dst) = match spec.direction {
            CopyDirection::ToRemote => (&spec.local_path, &spec.remote_path),
            CopyDirection::FromRemote => (&spec.remote_path, &spec.local_path),
        };
        let src = PathBuf::from(src);
        let dst = PathBuf::from(dst);
        let recursive = spec.recursive;
        tracing::debug!(host = %self.host, src = %src.display(), dst = %dst.display(), "local copy");

        let copied = tokio::task::spawn_blocking(move || copy_path(&src, &dst, recursive))
            .await
            .map_err(|e| ConnectionError::Copy {
                message: format!("copy task failed: {}", e),
                returncode: None,
            })?;

        copied.map_err(|message| ConnectionError::Copy {
            message,
            returncode: None,
        })?;
        Ok(ProcessResult {
            returncode: Some(0),
            ..ProcessResult::default()
        })
    }

    async fn close(self: Box<Self>) {
        tracing::debug!(host = %self.host, "closed local connection");
    }
}

/// Copy with `scp` placement rules: into an existing directory the source
/// keeps its file name, otherwise `dst` is the new name.
fn copy_path(src: &Path, dst: &Path, recursive: bool) -> Result<(), String> {
    let meta = fs::metadata(src).map_err(|e| format!("{}: {}", src.display(), e))?;
    let target = match (dst.is_dir(), src.file_name()) {
        (true, Some(name)) => dst.join(name),
        _ => dst.to_path_buf(),
    };

    if meta.is_dir() {
        if !recursive {
            return Err(format!("{}: not a regular file", src.display()));
        }
        return copy_tree(src, &target);
    }

    fs::copy(src, &target)
        .map(|_| ())
        .map_err(|e| format!("{} -> {}: {}", src.display(), target.display(), e))
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), String> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| e.to_string())?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| format!("{}: {}", entry.path().display(), e))?;
        let out = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&out).map_err(|e| format!("{}: {}", out.display(), e))?;
        } else {
            fs::copy(entry.path(), &out)
                .map_err(|e| format!("{} -> {}: {}", entry.path().display(), out.display(), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open() -> Box<dyn Connection> {
        LocalConnector::new()
            .open(&Node::new("127.0.0.1", 22), &ConnectionParams::default())
            .await
            .unwrap()
    }

    fn spec(src: &Path, dst: &Path, recursive: bool) -> CopySpec {
        CopySpec {
            local_path: src.to_string_lossy().into_owned(),
            remote_path: dst.to_string_lossy().into_owned(),
            direction: CopyDirection::ToRemote,
            recursive,
        }
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let mut conn = open().await;
        let result = conn
            .run(&["false".to_string()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.returncode, Some(1));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_run_empty_argv_is_spawn_error() {
        let mut conn = open().await;
        let err = conn.run(&[], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_copy_file_into_existing_dir() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("dcos_install.sh");
        fs::write(&src, "#!/bin/bash\n").unwrap();
        let ws = temp.path().join("ws");
        fs::create_dir(&ws).unwrap();

        let mut conn = open().await;
        conn.copy(&spec(&src, &ws, false)).await.unwrap();
        assert!(ws.join("dcos_install.sh").exists());
    }

    #[tokio::test]
    async fn test_copy_tree_recursive() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("bootstrap");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/a.tar.xz"), "x").unwrap();
        let dst = temp.path().join("out");

        let mut conn = open().await;
        conn.copy(&spec(&src, &dst, true)).await.unwrap();
        assert!(dst.join("nested/a.tar.xz").exists());
    }

    #[tokio::test]
    async fn test_copy_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let mut conn = open().await;
        let err = conn
            .copy(&spec(&temp.path().join("missing"), temp.path(), false))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Copy { returncode: None, .. }));
    }

    #[tokio::test]
    async fn test_copy_dir_without_recursive_fails() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("dir");
        fs::create_dir(&src).unwrap();
        let mut conn = open().await;
        assert!(conn
            .copy(&spec(&src, &temp.path().join("out"), false))
            .await
            .is_err());
    }
}
