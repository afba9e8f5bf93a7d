use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{OciError, Result};
use crate::manifest::ImageIndex;
use crate::reference::Digest;

pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const INDEX_FILE: &str = "index.json";
pub const BLOBS_DIR: &str = "blobs";
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OciLayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    pub image_layout_version: String,
}

impl Default for OciLayoutMarker {
    fn default() -> Self {
        Self {
            image_layout_version: IMAGE_LAYOUT_VERSION.to_string(),
        }
    }
}

/// Relative path of a blob inside a layout: `blobs/<alg>/<hex>`.
pub fn blob_entry_path(digest: &Digest) -> String {
    format!("{}/{}/{}", BLOBS_DIR, digest.algorithm(), digest.hex())
}

/// An OCI image layout on disk:
/// `<root>/oci-layout`, `<root>/index.json`, `<root>/blobs/<alg>/<hex>`.
pub struct OciLayoutDir {
    root: PathBuf,
}

impl OciLayoutDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(blob_entry_path(digest))
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Persist `data` under `digest` after checking it hashes correctly.
    pub async fn store_blob(&self, digest: &Digest, data: &[u8]) -> Result<PathBuf> {
        digest.verify(data)?;
        let path = self.blob_path(digest);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(&path, data).await?;
        debug!(path = %path.display(), "stored blob");
        Ok(path)
    }

    pub async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OciError::NotFound(format!("blob {} in {}", digest, self.root.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write `oci-layout` and `index.json`.
    pub async fn write_index(&self, index: &ImageIndex) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let marker = serde_json::to_vec(&OciLayoutMarker::default())?;
        fs::write(self.root.join(OCI_LAYOUT_FILE), marker).await?;
        let data = serde_json::to_vec_pretty(index)?;
        fs::write(self.root.join(INDEX_FILE), data).await?;
        Ok(())
    }

    /// Read `index.json`, rejecting directories without a valid `oci-layout`.
    pub async fn read_index(&self) -> Result<ImageIndex> {
        let marker_path = self.root.join(OCI_LAYOUT_FILE);
        let marker: OciLayoutMarker = match fs::read(&marker_path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OciError::NotFound(format!(
                    "{} is not an OCI layout",
                    self.root.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if marker.image_layout_version != IMAGE_LAYOUT_VERSION {
            return Err(OciError::Manifest(format!(
                "unsupported image layout version {}",
                marker.image_layout_version
            )));
        }
        let data = fs::read(self.root.join(INDEX_FILE)).await?;
        ImageIndex::from_slice(&data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Descriptor, MEDIA_TYPE_OCI_MANIFEST};

    #[test]
    fn blob_path_uses_algorithm_dir() {
        let digest = Digest::sha256_of(b"x");
        let layout = OciLayoutDir::new("/tmp/layout");
        assert_eq!(
            layout.blob_path(&digest),
            PathBuf::from(format!("/tmp/layout/blobs/sha256/{}", digest.hex()))
        );
    }

    #[tokio::test]
    async fn store_and_read_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = OciLayoutDir::new(tmp.path());
        let digest = Digest::sha256_of(b"hello world");

        assert!(!layout.has_blob(&digest));
        layout.store_blob(&digest, b"hello world").await.unwrap();
        assert!(layout.has_blob(&digest));
        assert_eq!(layout.read_blob(&digest).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn store_rejects_wrong_content() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = OciLayoutDir::new(tmp.path());
        let err = layout
            .store_blob(&Digest::sha256_of(b"a"), b"b")
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn index_round_trip_and_missing_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = OciLayoutDir::new(tmp.path().join("out"));
        assert!(layout.read_index().await.unwrap_err().is_not_found());

        let mut index = ImageIndex::new();
        index.manifests.push(Descriptor::new(
            MEDIA_TYPE_OCI_MANIFEST,
            Digest::sha256_of(b"m").to_string(),
            1,
        ));
        layout.write_index(&index).await.unwrap();

        let read = layout.read_index().await.unwrap();
        assert_eq!(read.manifests, index.manifests);
    }
}
