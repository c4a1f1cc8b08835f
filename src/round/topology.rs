//! The ordered list of nodes cooperating on a round.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A node identity, as carried on the wire.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Vec<u8>);

impl NodeId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl From<&[u8]> for NodeId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// An error produced by topology lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// The node is not part of the circuit.
    #[error("node {0} is not in the circuit")]
    UnknownNode(NodeIdDisplay),
    /// A circuit needs at least one node.
    #[error("a circuit cannot be empty")]
    Empty,
}

/// A displayable node id for error payloads.
#[derive(Debug, PartialEq, Eq)]
pub struct NodeIdDisplay(String);

impl fmt::Display for NodeIdDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The circuit of a round: an ordered list of node identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    nodes: Vec<NodeId>,
}

impl Circuit {
    pub fn new(nodes: Vec<NodeId>) -> Result<Self, TopologyError> {
        if nodes.is_empty() {
            return Err(TopologyError::Empty);
        }
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    fn position(&self, node: &NodeId) -> Result<usize, TopologyError> {
        self.nodes
            .iter()
            .position(|n| n == node)
            .ok_or_else(|| TopologyError::UnknownNode(NodeIdDisplay(node.to_string())))
    }

    pub fn is_first_node(&self, node: &NodeId) -> bool {
        self.nodes.first() == Some(node)
    }

    pub fn is_last_node(&self, node: &NodeId) -> bool {
        self.nodes.last() == Some(node)
    }

    /// The node after `node`, wrapping from the last back to the first.
    pub fn next_node(&self, node: &NodeId) -> Result<&NodeId, TopologyError> {
        let position = self.position(node)?;
        Ok(&self.nodes[(position + 1) % self.nodes.len()])
    }

    /// The node before `node`, wrapping from the first back to the last.
    pub fn prev_node(&self, node: &NodeId) -> Result<&NodeId, TopologyError> {
        let position = self.position(node)?;
        Ok(&self.nodes[(position + self.nodes.len() - 1) % self.nodes.len()])
    }
}
