use thiserror::Error;

use crate::node::NodeId;

/// Errors surfaced by the trie engine and its node-manager collaborator.
///
/// `NodeNotFound` and `Check` failures also emit a `tracing` event at the call
/// site, matching this codebase's logging conventions at collaborator
/// boundaries; see [`crate::store`] and [`crate::visitor`].
#[derive(Debug, Error)]
pub enum TrieError {
    #[error("node {0:?} could not be resolved by the node manager")]
    NodeNotFound(NodeId),

    #[error("expected a {expected} node, found {found:?}")]
    WrongVariant { expected: &'static str, found: NodeId },

    #[error("attempted to encode or hash node {0:?} while its hash was marked dirty")]
    DirtyHash(NodeId),

    #[error("cycle detected: node {0:?} appears twice on the same root-to-node path")]
    Cycle(NodeId),

    #[error("invariant violated: {0}")]
    InvalidInvariant(String),

    #[error("trie check found {} invariant violation(s): {}", .0.len(), .0.join("; "))]
    Check(Vec<String>),
}
