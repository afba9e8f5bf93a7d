//! Export image closures into descriptor trees and import them into a
//! destination repository, verifying every digest on the way.

mod tar;

pub use self::tar::{ArchiveSource, ArchiveTarget, TarImageSet};

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use imgbundle_oci::manifest::{ImageIndex, OciManifest};
use imgbundle_oci::{Digest, Reference, Registry, Repository};
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::descriptor::{
    ConfigDescriptor, ImageDescriptor, ImageLayerDescriptor, ImageOrIndexDescriptor,
    ImageRefDescriptors, IndexDescriptor, LayerProvider, ManifestDescriptor,
    RegistryLayerProvider,
};
use crate::error::{Error, Result};
use crate::image_ref::{ImageRef, ProcessedImage, ProcessedImages, UnprocessedImageRefs};
use crate::retry::{throttled, RetryPolicy};
use crate::throttle::Throttle;

type BoxedResult<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// `imgpkg-<alg>-<hex>`: the tag content is first written under.
pub fn upload_tag(digest: &Digest) -> String {
    format!("imgpkg-{}-{}", digest.algorithm(), digest.hex())
}

/// Decides which layers travel.  Non-distributable (foreign) layers are
/// skipped unless explicitly included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerFilter {
    pub include_non_distributable: bool,
}

impl LayerFilter {
    pub fn new(include_non_distributable: bool) -> Self {
        Self {
            include_non_distributable,
        }
    }

    pub fn includes(&self, layer: &ImageLayerDescriptor) -> bool {
        self.include_non_distributable || layer.is_distributable()
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry-to-registry transfer sharing one throttle and retry policy.
#[derive(Debug, Clone)]
pub struct ImageSet {
    throttle: Throttle,
    retry: RetryPolicy,
}

impl ImageSet {
    pub fn new(throttle: Throttle, retry: RetryPolicy) -> Self {
        Self { throttle, retry }
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    // -----------------------------------------------------------------------
    // Export
    // -----------------------------------------------------------------------

    /// Fetch manifests and configs for every ref (layers stay remote).  Refs
    /// sharing a digest produce one descriptor listing all of them.
    pub async fn export(
        &self,
        refs: &UnprocessedImageRefs,
        registry: Arc<dyn Registry>,
    ) -> Result<(ImageRefDescriptors, Arc<RegistryLayerProvider>)> {
        let mut by_digest: BTreeMap<Digest, Vec<ImageRef>> = BTreeMap::new();
        for image in refs.all() {
            by_digest.entry(image.digest().clone()).or_default().push(image);
        }
        info!(images = by_digest.len(), "exporting images");

        let mut join_set = JoinSet::new();
        for (_, refs) in by_digest {
            let reference = refs[0].reference().clone();
            let registry = registry.clone();
            let throttle = self.throttle.clone();
            let retry = self.retry.clone();
            join_set.spawn(async move {
                let repository = reference.context();
                let tree = fetch_tree(registry, throttle, retry, reference, refs).await?;
                Ok::<_, Error>((tree, repository))
            });
        }

        let mut items = Vec::new();
        let mut provider = RegistryLayerProvider::new(registry);
        let mut first_error = None;
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(Ok((tree, repository))) => {
                    for layer in tree.layers() {
                        provider.add_source(layer.digest.clone(), repository.clone());
                    }
                    items.push(tree);
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok((ImageRefDescriptors::new(items), Arc::new(provider)))
    }

    // -----------------------------------------------------------------------
    // Import
    // -----------------------------------------------------------------------

    /// Write every descriptor tree into `destination`.
    ///
    /// Each top-level item is pushed under its upload tag, re-resolved and
    /// compared against the expected digest, then tagged with every
    /// original tag it was requested by.
    pub async fn import(
        &self,
        descriptors: &ImageRefDescriptors,
        provider: Arc<dyn LayerProvider>,
        destination: &Repository,
        registry: Arc<dyn Registry>,
        filter: LayerFilter,
    ) -> Result<ProcessedImages> {
        info!(items = descriptors.len(), %destination, "importing images");
        let uploader = Arc::new(Uploader {
            registry,
            provider,
            destination: destination.clone(),
            throttle: self.throttle.clone(),
            retry: self.retry.clone(),
            filter,
            blobs: Mutex::new(HashMap::new()),
        });

        let mut join_set = JoinSet::new();
        for item in descriptors.items() {
            let uploader = uploader.clone();
            let item = Arc::new(item.clone());
            join_set.spawn(async move { uploader.import_item(item).await });
        }

        let processed = ProcessedImages::new();
        let mut first_error = None;
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(Ok(images)) => {
                    for image in images {
                        processed.add(image);
                    }
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(images = processed.len(), %destination, "import finished");
        Ok(processed)
    }

    /// Export from the source registry, then import into `destination`.
    pub async fn relocate(
        &self,
        refs: &UnprocessedImageRefs,
        destination: &Repository,
        source: Arc<dyn Registry>,
        target: Arc<dyn Registry>,
        filter: LayerFilter,
    ) -> Result<ProcessedImages> {
        let (descriptors, provider) = self.export(refs, source).await?;
        self.import(&descriptors, provider, destination, target, filter)
            .await
    }
}

/// Fetch the manifest at `reference` and, recursively, everything it points
/// to except layer bytes.
fn fetch_tree(
    registry: Arc<dyn Registry>,
    throttle: Throttle,
    retry: RetryPolicy,
    reference: Reference,
    refs: Vec<ImageRef>,
) -> BoxedResult<'static, ImageOrIndexDescriptor> {
    Box::pin(async move {
        let raw = throttled(&throttle, &retry, "fetch manifest", || async {
            Ok::<_, Error>(registry.get_manifest(&reference).await?)
        })
        .await?;
        debug!(
            %reference,
            digest = %raw.digest,
            media_type = %raw.media_type,
            "fetched manifest"
        );
        let is_index = raw.is_index();
        let manifest = ManifestDescriptor {
            media_type: raw.media_type,
            size: raw.bytes.len() as u64,
            digest: raw.digest,
            raw: raw.bytes,
        };
        let repository = reference.context();

        if is_index {
            let index = ImageIndex::from_slice(&manifest.raw)?;
            let mut children = Vec::with_capacity(index.manifests.len());
            for child in &index.manifests {
                let child_ref = repository.digest(&Digest::parse(&child.digest)?);
                children.push(
                    fetch_tree(
                        registry.clone(),
                        throttle.clone(),
                        retry.clone(),
                        child_ref,
                        Vec::new(),
                    )
                    .await?,
                );
            }
            return Ok(ImageOrIndexDescriptor::Index(IndexDescriptor {
                refs,
                manifest,
                children,
            }));
        }

        let image = OciManifest::from_slice(&manifest.raw)?;
        let config_digest = Digest::parse(&image.config.digest)?;
        let config_raw = throttled(&throttle, &retry, "fetch config", || async {
            Ok::<_, Error>(registry.get_blob(&repository, &config_digest).await?)
        })
        .await?;
        let layers = image
            .layers
            .iter()
            .map(ImageLayerDescriptor::from_oci)
            .collect::<Result<Vec<_>>>()?;

        Ok(ImageOrIndexDescriptor::Image(ImageDescriptor {
            refs,
            manifest,
            config: ConfigDescriptor {
                media_type: image.config.media_type.clone(),
                size: config_raw.len() as u64,
                digest: config_digest,
                raw: config_raw,
            },
            layers,
        }))
    })
}

// ---------------------------------------------------------------------------
// Uploader
// ---------------------------------------------------------------------------

struct Uploader {
    registry: Arc<dyn Registry>,
    provider: Arc<dyn LayerProvider>,
    destination: Repository,
    throttle: Throttle,
    retry: RetryPolicy,
    filter: LayerFilter,
    /// One upload per digest across all items.
    blobs: Mutex<HashMap<Digest, Arc<OnceCell<()>>>>,
}

impl Uploader {
    async fn import_item(
        self: Arc<Self>,
        item: Arc<ImageOrIndexDescriptor>,
    ) -> Result<Vec<ProcessedImage>> {
        self.clone().push_content(item.clone()).await?;

        let digest = item.digest().clone();
        let manifest = item.manifest();
        let tagged = self.destination.tag(&upload_tag(&digest));
        self.put_manifest(&tagged, &manifest.media_type, &manifest.raw)
            .await?;

        let head = throttled(&self.throttle, &self.retry, "verify manifest", || async {
            Ok::<_, Error>(self.registry.head_manifest(&tagged).await?)
        })
        .await?;
        if head.digest != digest {
            return Err(Error::DigestMismatch {
                image: tagged.to_string(),
                expected: digest.to_string(),
                actual: head.digest.to_string(),
            });
        }
        debug!(image = %tagged, %digest, "verified imported image");

        let mut tags: Vec<&str> = item.refs().iter().filter_map(|r| r.tag.as_deref()).collect();
        tags.sort_unstable();
        tags.dedup();
        for tag in tags {
            self.put_manifest(&self.destination.tag(tag), &manifest.media_type, &manifest.raw)
                .await?;
        }

        let digest_ref = self.destination.digest(&digest).to_string();
        Ok(item
            .refs()
            .iter()
            .map(|r| ProcessedImage {
                unprocessed: r.clone(),
                digest_ref: digest_ref.clone(),
                content: item.clone(),
            })
            .collect())
    }

    /// Upload blobs and child manifests `item` depends on.
    fn push_content(
        self: Arc<Self>,
        item: Arc<ImageOrIndexDescriptor>,
    ) -> BoxedResult<'static, ()> {
        Box::pin(async move {
            match item.as_ref() {
                ImageOrIndexDescriptor::Image(image) => self.push_image_blobs(image).await,
                ImageOrIndexDescriptor::Index(index) => {
                    for child in &index.children {
                        let child = Arc::new(child.clone());
                        self.clone().push_content(child.clone()).await?;
                        let manifest = child.manifest();
                        let by_digest = self.destination.digest(&manifest.digest);
                        self.put_manifest(&by_digest, &manifest.media_type, &manifest.raw)
                            .await?;
                    }
                    Ok(())
                }
            }
        })
    }

    async fn push_image_blobs(self: &Arc<Self>, image: &ImageDescriptor) -> Result<()> {
        let config = image.config.clone();
        self.ensure_blob(&config.digest, || {
            let raw = config.raw.clone();
            async move { Ok::<_, Error>(raw) }
        })
        .await?;

        let mut join_set = JoinSet::new();
        for layer in image.layers.iter().cloned() {
            if !self.filter.includes(&layer) {
                debug!(
                    digest = %layer.digest,
                    media_type = %layer.media_type,
                    "skipping non-distributable layer"
                );
                continue;
            }
            let this = self.clone();
            join_set.spawn(async move {
                let provider = this.provider.clone();
                let layer_ref = &layer;
                this.ensure_blob(&layer.digest, || {
                    let provider = provider.clone();
                    async move { provider.contents(layer_ref).await }
                })
                .await
            });
        }

        let mut first_error = None;
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Upload a blob unless this import or the destination already has it.
    async fn ensure_blob<F, Fut>(&self, digest: &Digest, read: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let cell = guard(&self.blobs).entry(digest.clone()).or_default().clone();
        cell.get_or_try_init(|| async move {
            let exists = throttled(&self.throttle, &self.retry, "check blob", || async {
                Ok::<_, Error>(self.registry.has_blob(&self.destination, digest).await?)
            })
            .await?;
            if exists {
                debug!(%digest, destination = %self.destination, "blob already present");
                return Ok(());
            }

            let data = throttled(&self.throttle, &self.retry, "read blob", read).await?;
            throttled(&self.throttle, &self.retry, "upload blob", || {
                let data = data.clone();
                async move {
                    Ok::<_, Error>(
                        self.registry
                            .put_blob(&self.destination, digest, data)
                            .await?,
                    )
                }
            })
            .await?;
            debug!(%digest, destination = %self.destination, "uploaded blob");
            Ok::<_, Error>(())
        })
        .await?;
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        raw: &[u8],
    ) -> Result<()> {
        throttled(&self.throttle, &self.retry, "write manifest", || async {
            Ok::<_, Error>(
                self.registry
                    .put_manifest(reference, media_type, raw.to_vec())
                    .await?,
            )
        })
        .await?;
        debug!(%reference, "wrote manifest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgbundle_oci::manifest::{
        MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_LAYER_NONDISTRIBUTABLE_GZIP,
    };

    #[test]
    fn upload_tag_uses_content_digest() {
        let digest = Digest::sha256_of(b"content");
        assert_eq!(upload_tag(&digest), format!("imgpkg-sha256-{}", digest.hex()));
    }

    #[test]
    fn filter_skips_foreign_layers_by_default() {
        let layer = |media_type: &str| ImageLayerDescriptor {
            media_type: media_type.to_string(),
            digest: Digest::sha256_of(b"l"),
            size: 1,
        };
        let foreign = layer(MEDIA_TYPE_OCI_LAYER_NONDISTRIBUTABLE_GZIP);
        assert!(!LayerFilter::default().includes(&foreign));
        assert!(LayerFilter::new(true).includes(&foreign));
        assert!(LayerFilter::default().includes(&layer(MEDIA_TYPE_OCI_LAYER_GZIP)));
    }
}
