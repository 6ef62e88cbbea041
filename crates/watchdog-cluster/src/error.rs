//! Error types for cluster bus operations.

use std::io;

use crate::NodeId;

/// Errors that can occur during cluster bus operations.
///
/// Protocol staleness (an old epoch, a second vote in the same epoch, an
/// outdated UPDATE) is not represented here: those messages are ignored as a
/// normal part of convergence.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Node not found in the registry.
    #[error("node {0} not found in cluster")]
    NodeNotFound(NodeId),

    /// The link was freed before or during a send.
    #[error("link closed")]
    LinkClosed,

    /// The transport failed to deliver a message.
    #[error("cluster transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("cluster codec error: {0}")]
    Codec(#[from] io::Error),

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),

    /// The local node cannot be removed from its own registry.
    #[error("I tried hard but I can't forget myself...")]
    CantForgetMyself,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_from_io() {
        let err: ClusterError = io::Error::new(io::ErrorKind::InvalidData, "bad").into();
        assert!(err.to_string().contains("bad"));
    }
}
