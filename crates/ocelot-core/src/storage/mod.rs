//! Storage layout: canonical tree ownership and the atomic write protocol.

pub mod atomic;
pub mod ignore;
mod layout;

pub use atomic::{atomic_read_json, atomic_write_bytes, atomic_write_json, atomic_write_stream, FileLock};
pub use ignore::WriteIgnoreSet;
pub use layout::{DeleteReport, StorageLayout};
