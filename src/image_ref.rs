//! Digest-addressed image references and the result sets built from them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use imgbundle_oci::{Digest, Reference, Repository};
use serde::{Deserialize, Serialize};

use crate::descriptor::ImageOrIndexDescriptor;
use crate::error::{Error, Result};

/// Set to `"true"`/`"false"` once resolution knows whether the image is a
/// bundle.
pub const LABEL_IS_BUNDLE: &str = "dev.carvel.imgpkg.copy.is-bundle";
/// Marks the bundle a copy was started from.
pub const LABEL_ROOT_BUNDLE: &str = "dev.carvel.imgpkg.copy.root-bundle";

/// A resolved image: always addressed by digest, optionally carrying the
/// tag and original reference it was requested by.
///
/// Equality, hashing and ordering consider only the digest reference and
/// the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawImageRef", into = "RawImageRef")]
pub struct ImageRef {
    digest_ref: String,
    reference: Reference,
    digest: Digest,
    pub tag: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub orig_ref: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawImageRef {
    digest_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    orig_ref: Option<String>,
}

impl ImageRef {
    /// Build from a digest reference.
    ///
    /// # Panics
    ///
    /// Panics when `digest_ref` is not a `repo@<digest>` reference.  Callers
    /// construct this type only after resolution; use [`ImageRef::try_new`]
    /// for untrusted input.
    pub fn new(digest_ref: &str) -> Self {
        match Self::try_new(digest_ref) {
            Ok(r) => r,
            Err(e) => panic!("ImageRef requires a digest reference: {}", e),
        }
    }

    pub fn try_new(digest_ref: &str) -> Result<Self> {
        Self::from_reference(Reference::parse(digest_ref)?)
    }

    pub fn from_reference(reference: Reference) -> Result<Self> {
        let digest = reference.digest().ok_or_else(|| {
            Error::Oci(imgbundle_oci::OciError::InvalidReference(format!(
                "'{}' is not a digest reference",
                reference
            )))
        })?;
        Ok(Self {
            digest_ref: reference.to_string(),
            reference,
            digest,
            tag: None,
            labels: BTreeMap::new(),
            orig_ref: None,
        })
    }

    /// `repository@digest` in `repository`.
    pub fn at(repository: &Repository, digest: &Digest) -> Self {
        Self::new(&repository.digest(digest).to_string())
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_orig_ref(mut self, orig_ref: impl Into<String>) -> Self {
        self.orig_ref = Some(orig_ref.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn digest_ref(&self) -> &str {
        &self.digest_ref
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn repository(&self) -> Repository {
        self.reference.context()
    }

    /// `Some` once resolution has recorded whether this is a bundle.
    pub fn is_bundle(&self) -> Option<bool> {
        self.labels.get(LABEL_IS_BUNDLE).map(|v| v == "true")
    }

    pub fn mark_bundle(mut self, is_bundle: bool) -> Self {
        self.labels
            .insert(LABEL_IS_BUNDLE.to_string(), is_bundle.to_string());
        self
    }

    pub fn is_root_bundle(&self) -> bool {
        self.labels.contains_key(LABEL_ROOT_BUNDLE)
    }

    pub fn mark_root_bundle(self) -> Self {
        self.mark_bundle(true).with_label(LABEL_ROOT_BUNDLE, "true")
    }

    fn key(&self) -> (&str, Option<&str>) {
        (&self.digest_ref, self.tag.as_deref())
    }
}

impl TryFrom<RawImageRef> for ImageRef {
    type Error = Error;

    fn try_from(raw: RawImageRef) -> Result<Self> {
        let mut image = ImageRef::try_new(&raw.digest_ref)?;
        image.tag = raw.tag;
        image.labels = raw.labels;
        image.orig_ref = raw.orig_ref;
        Ok(image)
    }
}

impl From<ImageRef> for RawImageRef {
    fn from(image: ImageRef) -> Self {
        Self {
            digest_ref: image.digest_ref,
            tag: image.tag,
            labels: image.labels,
            orig_ref: image.orig_ref,
        }
    }
}

impl PartialEq for ImageRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ImageRef {}

impl Hash for ImageRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for ImageRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ImageRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{} (tag {})", self.digest_ref, tag),
            None => f.write_str(&self.digest_ref),
        }
    }
}

type RefKey = (String, Option<String>);

fn key_of(image: &ImageRef) -> RefKey {
    (image.digest_ref.clone(), image.tag.clone())
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// UnprocessedImageRefs
// ---------------------------------------------------------------------------

/// Deduplicated set of images waiting to be copied, keyed by
/// (digest ref, tag).  Safe to fill from concurrent tasks.
#[derive(Debug, Default)]
pub struct UnprocessedImageRefs {
    refs: Mutex<BTreeMap<RefKey, ImageRef>>,
}

impl UnprocessedImageRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `image`. When it is already present, labels it carries that
    /// the stored entry lacks are merged in.
    pub fn add(&self, image: ImageRef) {
        let mut refs = guard(&self.refs);
        match refs.get_mut(&key_of(&image)) {
            Some(existing) => {
                for (k, v) in image.labels {
                    existing.labels.entry(k).or_insert(v);
                }
                if existing.orig_ref.is_none() {
                    existing.orig_ref = image.orig_ref;
                }
            }
            None => {
                refs.insert(key_of(&image), image);
            }
        }
    }

    pub fn extend(&self, images: impl IntoIterator<Item = ImageRef>) {
        for image in images {
            self.add(image);
        }
    }

    /// Snapshot sorted by digest reference.
    pub fn all(&self) -> Vec<ImageRef> {
        guard(&self.refs).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        guard(&self.refs).len()
    }

    pub fn is_empty(&self) -> bool {
        guard(&self.refs).is_empty()
    }
}

impl FromIterator<ImageRef> for UnprocessedImageRefs {
    fn from_iter<I: IntoIterator<Item = ImageRef>>(iter: I) -> Self {
        let set = Self::new();
        set.extend(iter);
        set
    }
}

// ---------------------------------------------------------------------------
// ProcessedImage(s)
// ---------------------------------------------------------------------------

/// An image after it has been written to its destination.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    /// The reference the image was requested by.
    pub unprocessed: ImageRef,
    /// Where it now lives, `dest/repo@<digest>`.
    pub digest_ref: String,
    /// What was written.
    pub content: Arc<ImageOrIndexDescriptor>,
}

impl ProcessedImage {
    pub fn digest(&self) -> &Digest {
        self.unprocessed.digest()
    }
}

/// Copy results keyed by the original (unprocessed) reference.
#[derive(Debug, Default)]
pub struct ProcessedImages {
    images: Mutex<BTreeMap<RefKey, ProcessedImage>>,
}

impl ProcessedImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, image: ProcessedImage) {
        guard(&self.images).insert(key_of(&image.unprocessed), image);
    }

    /// Snapshot sorted by original digest reference.
    pub fn all(&self) -> Vec<ProcessedImage> {
        guard(&self.images).values().cloned().collect()
    }

    pub fn find_by_digest(&self, digest: &Digest) -> Option<ProcessedImage> {
        guard(&self.images)
            .values()
            .find(|p| p.digest() == digest)
            .cloned()
    }

    pub fn len(&self) -> usize {
        guard(&self.images).len()
    }

    pub fn is_empty(&self) -> bool {
        guard(&self.images).is_empty()
    }
}
