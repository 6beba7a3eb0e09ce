//! Tile streaming: request bookkeeping, background decoding, failure
//! retries, memory budgets and the cache manager that ties them together

pub mod budget;
pub mod config;
pub mod decoder;
pub mod draw;
pub mod failures;
pub mod loader;
pub mod manager;
pub mod request;
pub mod tile_file;

pub use budget::MemoryBudget;
pub use config::CacheConfig;
pub use decoder::{DecodedNode, DecodedTile, FileTileDecoder, TileDecoder};
pub use draw::Visibility;
pub use failures::{FailureAction, FailureTracker};
pub use loader::TileLoader;
pub use manager::{CacheManager, MemoryUsage, ProcessResult};
pub use request::{LoadKind, LoadOutcome, LoadRequest, RequestHandle, RequestKey, RequestState};
pub use tile_file::{
    TileFileData, TileNodeData,
    encode_tile_file, decode_tile_file,
    read_tile_file, write_tile_file,
};
