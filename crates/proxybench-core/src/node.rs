use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One proxy endpoint as handed to the engine by the upstream provider.
///
/// The engine treats everything beyond `name`/`type`/`server`/`port` as an
/// opaque bag of fields that gets forwarded verbatim into the router's
/// generated config document (minus any `_`-prefixed key, stripped at
/// config-serialisation time, not here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Airport/source this node was published under. Carried explicitly
    /// rather than recovered from a renamed-duplicate display string.
    pub source_name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub server: String,
    pub port: u16,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        source_name: impl Into<String>,
        node_type: impl Into<String>,
        server: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            source_name: source_name.into(),
            node_type: node_type.into(),
            server: server.into(),
            port,
            extra: serde_json::Map::new(),
        }
    }
}

/// Name uniqueness within a batch is a precondition supplied by dedup
/// upstream; the router would refuse a config with duplicate proxy names,
/// so the engine checks it up front instead of surfacing an opaque
/// router-startup failure.
pub fn validate_unique_names(nodes: &[Node]) -> Result<(), EngineError> {
    let mut seen = HashSet::with_capacity(nodes.len());
    for node in nodes {
        if !seen.insert(node.name.as_str()) {
            return Err(EngineError::DuplicateNodeName(node.name.clone()));
        }
    }
    Ok(())
}
