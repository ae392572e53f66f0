//! Remote targets
//!
//! A [`Node`] is one addressable host plus opaque tags (e.g. `role=master`)
//! that per-node command generators read. Identity is `address:port`.

use std::collections::BTreeMap;
use std::fmt;

/// Errors parsing a `host[:port]` string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeParseError {
    #[error("empty host address")]
    Empty,

    #[error(
        "expected <ip> or <ip>:<port> but found more than one colon in '{0}' (IPv6 is not supported)"
    )]
    TooManyColons(String),

    #[error("invalid port in '{host}': {port}")]
    InvalidPort { host: String, port: String },
}

/// One remote target host. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    address: String,
    port: u16,
    tags: BTreeMap<String, String>,
}

impl Node {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tags(
        address: impl Into<String>,
        port: u16,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            address: address.into(),
            port,
            tags,
        }
    }

    /// Parse `<ip>` or `<ip>:<port>`, using `default_port` when no port is
    /// given.
    pub fn parse(host: &str, default_port: u16) -> Result<Self, NodeParseError> {
        let host = host.trim();
        let mut parts = host.split(':');
        let address = parts.next().unwrap_or_default();
        let port = parts.next();
        if parts.next().is_some() {
            return Err(NodeParseError::TooManyColons(host.to_string()));
        }
        if address.is_empty() {
            return Err(NodeParseError::Empty);
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| NodeParseError::InvalidPort {
                host: host.to_string(),
                port: p.to_string(),
            })?,
            None => default_port,
        };

        Ok(Self::new(address, port))
    }

    /// Same as [`Node::parse`] but attaching tags.
    pub fn parse_with_tags(
        host: &str,
        default_port: u16,
        tags: BTreeMap<String, String>,
    ) -> Result<Self, NodeParseError> {
        let node = Self::parse(host, default_port)?;
        Ok(Self { tags, ..node })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// `address:port`, the key used in run-state files.
    pub fn key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} tags=", self.address, self.port)?;
        let tags: Vec<String> = self
            .tags
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        write!(f, "{}", tags.join(", "))
    }
}
