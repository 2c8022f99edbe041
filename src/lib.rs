//! filestorage - Sharded local blob storage
//!
//! Stores arbitrary payloads (files, buffers, base64 text, streams) under
//! monotonically increasing numeric IDs and serves them back with HTTP
//! range and conditional-request semantics.
//!
//! ## Storage Layout
//!
//! ```text
//! <storage_dir>/
//! ├── config                     # Catalog: {"lastId":N,"count":M}
//! ├── filestorage.toml           # Daemon configuration
//! ├── 0000000001/                # Shard 1: IDs 1..=1000
//! │   ├── config                 # Journal: one `<id>=<header json>` line per record
//! │   ├── 0000000001.data        # 2048-byte header region + payload
//! │   └── 0000000002.data
//! └── 0000000002/                # Shard 2: IDs 1001..=2000
//! ```
//!
//! ## Events
//!
//! Every mutation and retrieval is published on an [`EventBus`]; subscribe
//! with [`Store::subscribe`].

pub mod catalog;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod http;
pub mod ids;
pub mod image;
pub mod journal;
pub mod mime;
pub mod payload;
pub mod record;
pub mod retrieval;
pub mod store;

// Re-exports
pub use catalog::CatalogSnapshot;
pub use config::Config;
pub use error::{Result, StorageError};
pub use events::{spawn_logging_listener, EventBus, EventListener, StorageEvent};
pub use http::HttpServer;
pub use payload::Payload;
pub use record::{Header, HEADER_SIZE};
pub use retrieval::{BoxBody, ByteRange, Download};
pub use store::{Store, Stored};
