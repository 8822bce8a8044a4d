//! Process-local configuration caches
//!
//! Each gateway instance keeps every entity it routes on in memory.
//! Caches carry no TTL: they change only on a full refresh or a change
//! notification, so a single [`Registry`] is shared by the auth
//! pipeline, the selection engine, the quota ledger and the sync fabric.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod entity_cache;
mod index;
mod registry;

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

pub use entity_cache::EntityCache;
pub use index::IdIndex;
pub use registry::{Cached, Registry, Snapshot};

/// SHA-256 hex digest used to key credentials in memory
pub fn secret_digest(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        // Writing to a String cannot fail
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
