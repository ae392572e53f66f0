//! clusterup - staged multi-host cluster bring-up
//!
//! This crate runs staged shell operations (prerequisites, artifact copies,
//! install scripts, health checks) across many hosts over SSH with bounded
//! concurrency, records each host's outcome in a resumable run-state file,
//! and can retry an action on only the hosts that failed.

pub mod chain;
pub mod config;
pub mod connection;
pub mod control;
pub mod delegate;
pub mod node;
pub mod pipeline;
pub mod runner;
pub mod summary;

pub use chain::{CommandChain, CopyDirection, Param, Stage};
pub use clusterup_state::{HostStatus, RunStateRecord, StateStore};
pub use config::{ClusterConfig, ConfigError};
pub use connection::{
    Connection, ConnectionError, ConnectionParams, Connector, HostConnector, LocalConnector,
    ProcessResult, SshConnector,
};
pub use control::{ActionController, StartOutcome};
pub use delegate::{Delegate, LogDelegate, NoopDelegate};
pub use node::Node;
pub use pipeline::{Action, Pipeline, PipelineError};
pub use runner::{RunHandle, RunOptions, RunResult, Runner, RunnerError};
pub use summary::ActionSummary;
