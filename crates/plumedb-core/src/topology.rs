//! Topology descriptor: which partition a node owns, whether it fronts
//! clients, and which children it fans queries out to.
//!
//! Loaded once at startup from a JSON file, e.g.:
//!
//! ```json
//! {
//!   "node_id": "gateway-a",
//!   "bind_addr": "0.0.0.0:50051",
//!   "root": true,
//!   "children": ["10.0.0.2:50052", "10.0.0.3:50053"],
//!   "data_dir": "data/partition_a"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid topology: {0}")]
    Invalid(String),
}

/// Per-node deployment descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Identity reported in every internal-query reply.
    pub node_id: String,
    /// Address this node's server listens on.
    pub bind_addr: SocketAddr,
    /// Whether this node fronts clients and runs the request lifecycle
    /// manager. Exactly one node per tree should set this.
    #[serde(default)]
    pub root: bool,
    /// Child node addresses to fan internal queries out to. Empty at
    /// leaves.
    #[serde(default)]
    pub children: Vec<SocketAddr>,
    /// Directory holding this node's partition files.
    pub data_dir: PathBuf,
}

impl TopologyConfig {
    pub fn from_file(path: &Path) -> Result<Self, TopologyError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| TopologyError::Io(format!("{}: {e}", path.display())))?;
        let cfg: TopologyConfig =
            serde_json::from_str(&raw).map_err(|e| TopologyError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.node_id.is_empty() {
            return Err(TopologyError::Invalid("node_id cannot be empty".into()));
        }
        if self.children.contains(&self.bind_addr) {
            return Err(TopologyError::Invalid(format!(
                "node {} lists itself as a child",
                self.node_id
            )));
        }
        Ok(())
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_full_descriptor() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "node_id": "gateway-a",
                "bind_addr": "127.0.0.1:50051",
                "root": true,
                "children": ["127.0.0.1:50052", "127.0.0.1:50053"],
                "data_dir": "data/partition_a"
            }}"#
        )
        .unwrap();

        let cfg = TopologyConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.node_id, "gateway-a");
        assert!(cfg.root);
        assert_eq!(cfg.children.len(), 2);
        assert!(!cfg.is_leaf());
    }

    #[test]
    fn defaults_to_non_root_leaf() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"node_id": "leaf-c", "bind_addr": "127.0.0.1:50053", "data_dir": "data/c"}}"#
        )
        .unwrap();

        let cfg = TopologyConfig::from_file(f.path()).unwrap();
        assert!(!cfg.root);
        assert!(cfg.is_leaf());
    }

    #[test]
    fn rejects_empty_node_id() {
        let cfg = TopologyConfig {
            node_id: String::new(),
            bind_addr: "127.0.0.1:50051".parse().unwrap(),
            root: false,
            children: vec![],
            data_dir: PathBuf::from("data"),
        };
        assert!(matches!(cfg.validate(), Err(TopologyError::Invalid(_))));
    }

    #[test]
    fn rejects_self_as_child() {
        let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
        let cfg = TopologyConfig {
            node_id: "n".into(),
            bind_addr: addr,
            root: false,
            children: vec![addr],
            data_dir: PathBuf::from("data"),
        };
        assert!(matches!(cfg.validate(), Err(TopologyError::Invalid(_))));
    }
}
