//! LOD tile tree: payloads, nodes, the node arena and traversal state

pub mod node;
pub mod payload;
pub mod traversal;
pub mod tree;

pub use node::{ChildrenState, LoadState, NodeId, Tick, TileLocator, TileNode, TileSource};
pub use payload::{MeshData, TextureData, TextureFormat, TilePayload, TileVertex};
pub use traversal::{TraversalContext, TraversalStats, ViewportId};
pub use tree::{FlushReport, MemoryKind, TileDescriptor, TileIter, TileTree};
