//! BundleLock and ImagesLock documents.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use imgbundle_oci::Reference;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image_ref::{ImageRef, ProcessedImages};

pub const API_VERSION: &str = "imgpkg.carvel.dev/v1alpha1";
pub const BUNDLE_LOCK_KIND: &str = "BundleLock";
pub const IMAGES_LOCK_KIND: &str = "ImagesLock";

// ---------------------------------------------------------------------------
// BundleLock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleLock {
    pub api_version: String,
    pub kind: String,
    pub spec: BundleLockSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleLockSpec {
    pub image: BundleLockImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleLockImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl BundleLock {
    pub fn new(url: impl Into<String>, tag: Option<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: BUNDLE_LOCK_KIND.to_string(),
            spec: BundleLockSpec {
                image: BundleLockImage {
                    url: url.into(),
                    tag,
                },
            },
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let lock: BundleLock = serde_yaml::from_str(raw)?;
        check_kind(&lock.kind, BUNDLE_LOCK_KIND)?;
        Ok(lock)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ImagesLock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesLock {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub spec: ImagesLockSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagesLockSpec {
    #[serde(default)]
    pub images: Vec<ImageLockEntry>,
}

/// One `images.yml` entry.  Deserialization fails unless `image` is a
/// digest reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawImageLockEntry")]
pub struct ImageLockEntry {
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawImageLockEntry {
    image: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl TryFrom<RawImageLockEntry> for ImageLockEntry {
    type Error = Error;

    fn try_from(raw: RawImageLockEntry) -> Result<Self> {
        let is_digest = Reference::parse(&raw.image)
            .map(|r| r.is_digest())
            .unwrap_or(false);
        if !is_digest {
            return Err(Error::Lock(format!(
                "expected image '{}' to be in digest form (repo@sha256:...)",
                raw.image
            )));
        }
        Ok(Self {
            image: raw.image,
            annotations: raw.annotations,
        })
    }
}

impl ImageLockEntry {
    pub fn reference(&self) -> Result<Reference> {
        Ok(Reference::parse(&self.image)?)
    }
}

impl ImagesLock {
    pub fn new(images: Vec<ImageLockEntry>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: IMAGES_LOCK_KIND.to_string(),
            spec: ImagesLockSpec { images },
        }
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let lock: ImagesLock = serde_yaml::from_str(raw)
            .map_err(|e| Error::Lock(format!("invalid ImagesLock: {}", e)))?;
        check_kind(&lock.kind, IMAGES_LOCK_KIND)?;
        Ok(lock)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Error::Lock(format!("ImagesLock is not UTF-8: {}", e)))?;
        Self::from_yaml(text)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Entries as image references, in file order.
    pub fn image_refs(&self) -> Result<Vec<ImageRef>> {
        self.spec
            .images
            .iter()
            .map(|entry| Ok(ImageRef::try_new(&entry.image)?.with_orig_ref(&entry.image)))
            .collect()
    }

    /// A copy with every entry pointing at where `processed` put it.
    /// Annotations are preserved; entries that were not copied are an error.
    pub fn relocated(&self, processed: &ProcessedImages) -> Result<ImagesLock> {
        let mut images = Vec::with_capacity(self.spec.images.len());
        for entry in &self.spec.images {
            let digest = entry
                .reference()?
                .digest()
                .ok_or_else(|| Error::Lock(format!("'{}' has no digest", entry.image)))?;
            let moved = processed.find_by_digest(&digest).ok_or_else(|| {
                Error::Lock(format!("image '{}' was not part of the copy", entry.image))
            })?;
            images.push(ImageLockEntry {
                image: moved.digest_ref,
                annotations: entry.annotations.clone(),
            });
        }
        Ok(ImagesLock::new(images))
    }
}

/// Either lock kind, as accepted by `--lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFile {
    Bundle(BundleLock),
    Images(ImagesLock),
}

impl LockFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Lock(format!("failed to read {}: {}", path.display(), e)))?;

        #[derive(Deserialize)]
        struct Header {
            kind: String,
        }
        let header: Header = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Lock(format!("invalid lock file {}: {}", path.display(), e)))?;
        match header.kind.as_str() {
            BUNDLE_LOCK_KIND => Ok(LockFile::Bundle(BundleLock::from_yaml(&raw)?)),
            IMAGES_LOCK_KIND => Ok(LockFile::Images(ImagesLock::from_yaml(&raw)?)),
            other => Err(Error::Lock(format!(
                "unknown lock kind '{}' in {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        match self {
            LockFile::Bundle(lock) => lock.write(path),
            LockFile::Images(lock) => lock.write(path),
        }
    }
}

fn check_kind(actual: &str, expected: &str) -> Result<()> {
    if actual != expected {
        return Err(Error::Lock(format!(
            "expected kind '{}', found '{}'",
            expected, actual
        )));
    }
    Ok(())
}
