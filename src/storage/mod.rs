//! Blob-backed artifact storage: byte access plus the checksum-gated
//! loader for rulesets and field registries.

pub mod blob;
pub mod loader;

pub use blob::{BlobError, BlobFetch, HttpBlobStore, MemoryBlobStore};
pub use loader::{sha256_hex, ArtifactLoader, Manifest};
