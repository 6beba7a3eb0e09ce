//! Error types for tile streaming

use std::io;

use thiserror::Error;

use crate::tile::NodeId;

/// Main error type for the tile cache
#[derive(Debug, Error)]
pub enum TileError {
    #[error("tile not found: {0}")]
    NotFound(String),

    #[error("malformed tile container: {0}")]
    Parse(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("graphic resource error: {0}")]
    Resource(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("unknown tile node {0:?}")]
    UnknownNode(NodeId),
}

impl TileError {
    /// Whether a retry has a chance of succeeding.
    ///
    /// Only I/O hiccups qualify. A missing locator or a malformed container
    /// will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            TileError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ResourceBusy
            ),
            _ => false,
        }
    }
}
