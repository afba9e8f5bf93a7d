use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{ManifestHead, RawManifest, Registry};
use crate::error::{OciError, Result};
use crate::manifest::{
    is_index_media_type, is_non_distributable_media_type, sniff_media_type, ImageIndex,
    OciManifest,
};
use crate::reference::{Digest, Reference, Repository};

#[derive(Default)]
struct RepoState {
    manifests: HashMap<Digest, (String, Vec<u8>)>,
    tags: BTreeMap<String, Digest>,
    blobs: HashMap<Digest, Vec<u8>>,
}

#[derive(Default)]
struct State {
    repos: HashMap<Repository, RepoState>,
    blob_uploads: HashMap<Digest, usize>,
    manifest_writes: usize,
}

/// A registry held entirely in memory.
///
/// Behaves like a strict distribution server: blobs must hash to their
/// digest, and manifests may only be stored once everything they reference
/// is present in the same repository.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| OciError::Registry("in-memory registry poisoned".to_string()))
    }

    /// How many times a blob with `digest` was uploaded, across repositories.
    pub fn blob_upload_count(&self, digest: &Digest) -> usize {
        self.lock()
            .map(|s| s.blob_uploads.get(digest).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total blob uploads across all digests.
    pub fn total_blob_uploads(&self) -> usize {
        self.lock()
            .map(|s| s.blob_uploads.values().sum())
            .unwrap_or(0)
    }

    /// Total manifest writes (including re-tags).
    pub fn manifest_writes(&self) -> usize {
        self.lock().map(|s| s.manifest_writes).unwrap_or(0)
    }

    /// Stored blob bytes, if present.
    pub fn blob(&self, repository: &Repository, digest: &Digest) -> Option<Vec<u8>> {
        self.lock()
            .ok()?
            .repos
            .get(repository)?
            .blobs
            .get(digest)
            .cloned()
    }

    fn resolve(repo: &RepoState, reference: &Reference) -> Option<Digest> {
        match reference.digest() {
            Some(d) => repo.manifests.contains_key(&d).then_some(d),
            None => repo.tags.get(&reference.reference).cloned(),
        }
    }

    fn check_references(repo: &RepoState, media_type: &str, data: &[u8]) -> Result<()> {
        if is_index_media_type(media_type) {
            let index = ImageIndex::from_slice(data)?;
            for child in &index.manifests {
                let d = Digest::parse(&child.digest)?;
                if !repo.manifests.contains_key(&d) {
                    return Err(OciError::Manifest(format!(
                        "index references unknown manifest {}",
                        d
                    )));
                }
            }
        } else {
            let manifest = OciManifest::from_slice(data)?;
            let required = std::iter::once(&manifest.config).chain(
                manifest
                    .layers
                    .iter()
                    .filter(|l| !is_non_distributable_media_type(&l.media_type)),
            );
            for desc in required {
                let d = Digest::parse(&desc.digest)?;
                if !repo.blobs.contains_key(&d) {
                    return Err(OciError::Manifest(format!(
                        "manifest references unknown blob {}",
                        d
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn get_manifest(&self, reference: &Reference) -> Result<RawManifest> {
        let state = self.lock()?;
        let repo = state
            .repos
            .get(&reference.context())
            .ok_or_else(|| OciError::NotFound(reference.to_string()))?;
        let digest =
            Self::resolve(repo, reference).ok_or_else(|| OciError::NotFound(reference.to_string()))?;
        let (media_type, bytes) = repo
            .manifests
            .get(&digest)
            .cloned()
            .ok_or_else(|| OciError::NotFound(reference.to_string()))?;
        Ok(RawManifest {
            media_type,
            digest,
            bytes,
        })
    }

    async fn head_manifest(&self, reference: &Reference) -> Result<ManifestHead> {
        let raw = self.get_manifest(reference).await?;
        Ok(ManifestHead {
            size: raw.bytes.len() as u64,
            media_type: raw.media_type,
            digest: raw.digest,
        })
    }

    async fn get_blob(&self, repository: &Repository, digest: &Digest) -> Result<Vec<u8>> {
        self.blob(repository, digest)
            .ok_or_else(|| OciError::NotFound(format!("{}@{}", repository, digest)))
    }

    async fn has_blob(&self, repository: &Repository, digest: &Digest) -> Result<bool> {
        Ok(self.blob(repository, digest).is_some())
    }

    async fn put_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
        data: Vec<u8>,
    ) -> Result<()> {
        digest.verify(&data)?;
        let mut state = self.lock()?;
        *state.blob_uploads.entry(digest.clone()).or_default() += 1;
        state
            .repos
            .entry(repository.clone())
            .or_default()
            .blobs
            .insert(digest.clone(), data);
        debug!(%repository, %digest, "stored blob");
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        data: Vec<u8>,
    ) -> Result<Digest> {
        let media_type = sniff_media_type(Some(media_type), &data)?;
        let digest = Digest::sha256_of(&data);
        if let Some(pinned) = reference.digest() {
            if pinned != digest {
                return Err(OciError::DigestMismatch {
                    expected: pinned.to_string(),
                    actual: digest.to_string(),
                });
            }
        }

        let mut state = self.lock()?;
        state.manifest_writes += 1;
        let repo = state.repos.entry(reference.context()).or_default();
        Self::check_references(repo, &media_type, &data)?;
        repo.manifests.insert(digest.clone(), (media_type, data));
        if let Some(tag) = reference.tag() {
            repo.tags.insert(tag.to_string(), digest.clone());
        }
        debug!(%reference, %digest, "stored manifest");
        Ok(digest)
    }

    async fn list_tags(&self, repository: &Repository) -> Result<Vec<String>> {
        let state = self.lock()?;
        let repo = state
            .repos
            .get(repository)
            .ok_or_else(|| OciError::NotFound(repository.to_string()))?;
        Ok(repo.tags.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
