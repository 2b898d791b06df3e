//! 64-bit operational node identifiers

use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid node id: {0:?}")]
pub struct InvalidNodeId(pub String);

/// Operational node identifier of a commissioned peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    /// Accepts decimal, `0x` hexadecimal, `0o` octal and `0b` binary text,
    /// optionally with the big-integer `n` suffix (`"18446744073709551615n"`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidNodeId(s.to_string());
        let text = s.trim();
        let text = text.strip_suffix('n').unwrap_or(text);
        if text.is_empty() {
            return Err(invalid());
        }

        let (digits, radix) = match text.get(..2) {
            Some("0x") | Some("0X") => (&text[2..], 16),
            Some("0o") | Some("0O") => (&text[2..], 8),
            Some("0b") | Some("0B") => (&text[2..], 2),
            _ => (text, 10),
        };
        // from_str_radix tolerates a leading '+', big-int parsing does not
        if digits.is_empty() || digits.starts_with('+') {
            return Err(invalid());
        }

        u64::from_str_radix(digits, radix)
            .map(NodeId)
            .map_err(|_| invalid())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(NodeId(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A node id as handed in by a caller, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    Id(NodeId),
    Number(u64),
    Text(String),
}

impl NodeRef {
    /// Normalize to a [`NodeId`]
    pub fn resolve(&self) -> Result<NodeId, InvalidNodeId> {
        match self {
            NodeRef::Id(id) => Ok(*id),
            NodeRef::Number(n) => Ok(NodeId(*n)),
            NodeRef::Text(s) => s.parse(),
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRef::Id(id) => write!(f, "{}", id),
            NodeRef::Number(n) => write!(f, "{}", n),
            NodeRef::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<NodeId> for NodeRef {
    fn from(id: NodeId) -> Self {
        NodeRef::Id(id)
    }
}

impl From<u64> for NodeRef {
    fn from(n: u64) -> Self {
        NodeRef::Number(n)
    }
}

impl From<&str> for NodeRef {
    fn from(s: &str) -> Self {
        NodeRef::Text(s.to_string())
    }
}

impl From<String> for NodeRef {
    fn from(s: String) -> Self {
        NodeRef::Text(s)
    }
}
