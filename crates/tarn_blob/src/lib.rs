//! # Tarn Blob
//!
//! Blob-store contract and implementations for Tarn.
//!
//! This crate provides the lowest-level storage abstraction for Tarn.
//! A blob store keeps two kinds of things, and interprets neither:
//!
//! - **Durable objects**, addressed by [`ObjectId`], each carrying a
//!   fixed-size extended attribute ([`Xattr`]) and a byte content.
//! - **Temporaries**, addressed by store-assigned [`TempId`] tokens.
//!   A temporary is anonymous until it is tagged with a [`RecoveryId`],
//!   after which it survives restart and can be enumerated by type
//!   during recovery.
//!
//! ## Design Principles
//!
//! - Stores are opaque byte stores; all format interpretation belongs
//!   to the journaling layer above.
//! - `place_object` is the single atomicity primitive: it moves a
//!   temporary's content into an object slot, creating or replacing it.
//! - Must be `Send + Sync` for concurrent access.
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral storage
//! - [`DirStore`] - Directory-backed persistent storage

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dir;
mod error;
mod memory;
mod store;
mod types;

pub use dir::DirStore;
pub use error::{BlobError, BlobResult};
pub use memory::MemoryStore;
pub use store::{BlobStore, RecoveredBlob};
pub use types::{
    ObjectId, RecoveryId, RecoveryType, TempId, TemporaryXattr, Xattr, XATTR_LEN,
};
