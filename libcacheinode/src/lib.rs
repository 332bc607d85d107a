// Metadata cache layered between protocol handlers and backend drivers.
// Identity of every handle a backend returns is checked before the cache
// trusts it, and backend-originated changes arrive as upcalls.

pub mod access;
pub mod backend;
pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod handle;
pub mod handle_cache;
pub mod locks;
pub mod lookup;
pub mod models;
pub mod store;
pub mod upcall;

pub use cache::CacheInode;
pub use config::{CacheConfig, CorruptionPolicy, FsInfo};
pub use error::{BackendCorruption, BackendError, CacheError, UpcallError};
pub use handle::ObjectHandle;
