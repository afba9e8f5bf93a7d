//! The registry capability consumed by the relocation engine, plus two
//! implementations: an HTTP client speaking the OCI distribution API and an
//! in-memory registry.

mod client;
mod memory;

pub use client::{RegistryAuth, RegistryClient};
pub use memory::InMemoryRegistry;

use async_trait::async_trait;

use crate::error::Result;
use crate::manifest::is_index_media_type;
use crate::reference::{Digest, Reference, Repository};

/// A manifest or index as stored in a registry: exact bytes plus the
/// metadata needed to re-upload them unchanged.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub media_type: String,
    pub digest: Digest,
    pub bytes: Vec<u8>,
}

impl RawManifest {
    pub fn is_index(&self) -> bool {
        is_index_media_type(&self.media_type)
    }
}

/// What a `HEAD` on a manifest reveals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHead {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

/// Operations the relocation engine needs from a registry.
///
/// Every reference argument names a registry, repository and tag or digest.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch a manifest or index by tag or digest.
    async fn get_manifest(&self, reference: &Reference) -> Result<RawManifest>;

    /// Resolve a reference to its digest without downloading the body.
    async fn head_manifest(&self, reference: &Reference) -> Result<ManifestHead>;

    /// Download a blob.
    async fn get_blob(&self, repository: &Repository, digest: &Digest) -> Result<Vec<u8>>;

    /// Whether `repository` already holds the blob.
    async fn has_blob(&self, repository: &Repository, digest: &Digest) -> Result<bool>;

    /// Upload a blob in one request.
    async fn put_blob(&self, repository: &Repository, digest: &Digest, data: Vec<u8>)
        -> Result<()>;

    /// Store a manifest under the tag or digest in `reference`.  Returns the
    /// digest the registry reports for the stored content.
    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        data: Vec<u8>,
    ) -> Result<Digest>;

    /// List the tags present in a repository.
    async fn list_tags(&self, repository: &Repository) -> Result<Vec<String>>;
}
