//! Shared fixtures for the integration tests: image/bundle builders and a
//! fault-injecting registry wrapper.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imgbundle::artifacts::{artifact_tag, ArtifactKind};
use imgbundle::bundle::{BUNDLE_CONFIG_LABEL, IMAGES_LOCK_PATH};
use imgbundle::copy::CopyOptions;
use imgbundle::imageset::LayerFilter;
use imgbundle::lock::{ImageLockEntry, ImagesLock};
use imgbundle::retry::RetryPolicy;
use imgbundle_oci::layer::build_layer;
use imgbundle_oci::manifest::{
    Descriptor, OciManifest, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_NONDISTRIBUTABLE_GZIP,
    MEDIA_TYPE_OCI_MANIFEST,
};
use imgbundle_oci::{
    Digest, ImageBuilder, InMemoryRegistry, ManifestHead, OciError, RawManifest, Reference,
    Registry, Repository,
};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn repo(name: &str) -> Repository {
    Repository::parse(name).unwrap()
}

/// Retries quickly so failing tests do not sit in backoff.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(1))
}

pub fn options(concurrency: usize) -> CopyOptions {
    CopyOptions {
        concurrency,
        retry: fast_retry(),
        filter: LayerFilter::default(),
        fetch_artifacts: true,
    }
}

/// Push a one-layer image whose content is derived from `seed`, tagged
/// `tag`, and return its digest reference.
pub async fn push_image(reg: &dyn Registry, repository: &str, tag: &str, seed: &str) -> Reference {
    let repository = repo(repository);
    let image = ImageBuilder::new()
        .label("seed", seed)
        .layer(&[("content.txt", seed.as_bytes())])
        .unwrap()
        .build()
        .unwrap();
    image.push(reg, &repository.tag(tag)).await.unwrap();
    repository.digest(&image.digest)
}

pub fn images_lock_yaml(images: &[&Reference]) -> String {
    ImagesLock::new(
        images
            .iter()
            .map(|r| ImageLockEntry {
                image: r.to_string(),
                annotations: Default::default(),
            })
            .collect(),
    )
    .to_yaml()
    .unwrap()
}

/// Push a bundle whose `images.yml` lists `images`, in order.
pub async fn push_bundle(
    reg: &dyn Registry,
    repository: &str,
    tag: &str,
    images: &[&Reference],
) -> Reference {
    push_bundle_with_lock(reg, repository, tag, &images_lock_yaml(images)).await
}

pub async fn push_bundle_with_lock(
    reg: &dyn Registry,
    repository: &str,
    tag: &str,
    lock_yaml: &str,
) -> Reference {
    let repository = repo(repository);
    let image = ImageBuilder::new()
        .label(BUNDLE_CONFIG_LABEL, "true")
        .layer(&[(IMAGES_LOCK_PATH, lock_yaml.as_bytes())])
        .unwrap()
        .build()
        .unwrap();
    image.push(reg, &repository.tag(tag)).await.unwrap();
    repository.digest(&image.digest)
}

/// Push a companion artifact for `subject` under its digest-derived tag.
pub async fn push_artifact(
    reg: &dyn Registry,
    subject: &Reference,
    kind: ArtifactKind,
    seed: &str,
) -> Reference {
    let digest = subject.digest().unwrap();
    let tag = artifact_tag(&digest, kind);
    let repository = subject.context();
    let image = ImageBuilder::new()
        .label("artifact", kind.suffix())
        .layer(&[("payload.json", seed.as_bytes())])
        .unwrap()
        .build()
        .unwrap();
    image.push(reg, &repository.tag(&tag)).await.unwrap();
    repository.digest(&image.digest)
}

/// Push an image with one distributable and one non-distributable layer.
/// Returns the image and the non-distributable layer digest.
pub async fn push_image_with_foreign_layer(
    reg: &dyn Registry,
    repository: &str,
    tag: &str,
) -> (Reference, Digest) {
    let repository = repo(repository);
    let local = build_layer(&[("app.txt", b"app")]).unwrap();
    let foreign = build_layer(&[("windows.dll", b"base")]).unwrap();
    let config = br#"{"architecture":"amd64","os":"windows"}"#.to_vec();
    let config_digest = Digest::sha256_of(&config);

    for (digest, data) in [
        (&local.digest, local.data.clone()),
        (&foreign.digest, foreign.data.clone()),
        (&config_digest, config.clone()),
    ] {
        reg.put_blob(&repository, digest, data).await.unwrap();
    }

    let manifest = OciManifest {
        schema_version: 2,
        media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
        config: Descriptor::new(
            MEDIA_TYPE_OCI_CONFIG,
            config_digest.to_string(),
            config.len() as u64,
        ),
        layers: vec![
            Descriptor::new(
                MEDIA_TYPE_OCI_LAYER_NONDISTRIBUTABLE_GZIP,
                foreign.digest.to_string(),
                foreign.data.len() as u64,
            ),
            Descriptor::new(
                imgbundle_oci::manifest::MEDIA_TYPE_OCI_LAYER_GZIP,
                local.digest.to_string(),
                local.data.len() as u64,
            ),
        ],
        annotations: None,
    };
    let digest = reg
        .put_manifest(
            &repository.tag(tag),
            MEDIA_TYPE_OCI_MANIFEST,
            serde_json::to_vec(&manifest).unwrap(),
        )
        .await
        .unwrap();
    (repository.digest(&digest), foreign.digest)
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Wraps an [`InMemoryRegistry`] and misbehaves on request: re-encodes
/// manifests written under upload tags, denies selected tags, delays every
/// call, or fails the next few calls with a transient error.  Also records
/// the peak number of concurrent calls.
pub struct FaultyRegistry {
    inner: Arc<InMemoryRegistry>,
    reencode_upload_tags: bool,
    denied_tags: BTreeSet<String>,
    delay: Option<Duration>,
    transient_failures: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FaultyRegistry {
    pub fn new(inner: Arc<InMemoryRegistry>) -> Self {
        Self {
            inner,
            reencode_upload_tags: false,
            denied_tags: BTreeSet::new(),
            delay: None,
            transient_failures: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn reencode_upload_tags(mut self) -> Self {
        self.reencode_upload_tags = true;
        self
    }

    pub fn deny_tag(mut self, tag: impl Into<String>) -> Self {
        self.denied_tags.insert(tag.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_next(self, calls: usize) -> Self {
        self.transient_failures.store(calls, Ordering::SeqCst);
        self
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<CallGuard<'_>, OciError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let guard = CallGuard(&self.in_flight);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(OciError::Registry("503 Service Unavailable".to_string()));
        }
        Ok(guard)
    }

    fn check_denied(&self, reference: &Reference) -> Result<(), OciError> {
        match reference.tag() {
            Some(tag) if self.denied_tags.contains(tag) => {
                Err(OciError::Denied(reference.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Registry for FaultyRegistry {
    async fn get_manifest(&self, reference: &Reference) -> Result<RawManifest, OciError> {
        let _call = self.enter().await?;
        self.check_denied(reference)?;
        self.inner.get_manifest(reference).await
    }

    async fn head_manifest(&self, reference: &Reference) -> Result<ManifestHead, OciError> {
        let _call = self.enter().await?;
        self.check_denied(reference)?;
        self.inner.head_manifest(reference).await
    }

    async fn get_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
    ) -> Result<Vec<u8>, OciError> {
        let _call = self.enter().await?;
        self.inner.get_blob(repository, digest).await
    }

    async fn has_blob(&self, repository: &Repository, digest: &Digest) -> Result<bool, OciError> {
        let _call = self.enter().await?;
        self.inner.has_blob(repository, digest).await
    }

    async fn put_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
        data: Vec<u8>,
    ) -> Result<(), OciError> {
        let _call = self.enter().await?;
        self.inner.put_blob(repository, digest, data).await
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        data: Vec<u8>,
    ) -> Result<Digest, OciError> {
        let _call = self.enter().await?;
        let is_upload_tag = reference
            .tag()
            .map(|t| t.starts_with("imgpkg-"))
            .unwrap_or(false);
        let data = if self.reencode_upload_tags && is_upload_tag {
            let value: serde_json::Value = serde_json::from_slice(&data)?;
            serde_json::to_vec_pretty(&value)?
        } else {
            data
        };
        self.inner.put_manifest(reference, media_type, data).await
    }

    async fn list_tags(&self, repository: &Repository) -> Result<Vec<String>, OciError> {
        let _call = self.enter().await?;
        self.inner.list_tags(repository).await
    }
}
