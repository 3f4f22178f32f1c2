//! Shoal block-transfer engine.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod assembly;
pub mod best_effort;
pub mod cache;
pub mod channel;
pub mod config;
pub mod geometry;
pub mod integrity;
pub mod ledbat;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod store;
pub mod timer;
pub mod tracker;
pub mod transfer;
pub mod wire;

pub use cache::{CacheHint, CachePrefetchLayer, HintOwner};
pub use config::{LedbatConfig, LossPolicy, TransferConfig};
pub use geometry::{BlockGeometry, ByteRange};
pub use integrity::HashAlg;
pub use protocol::{Envelope, Message, PROTOCOL_VERSION};
pub use session::{Action, FileSession, MessageError, TransferError};
pub use store::{BlockStore, HashGatedStore, MemoryBackend, StorageBackend, StorageError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
