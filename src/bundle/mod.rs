//! Bundles: images marked with the bundle label whose single layer carries
//! `.imgpkg/images.yml`.

mod locations;
mod resolve;

pub use locations::{
    fetch_locations, locations_tag, write_locations, ImageLocation, LocationsConfig,
    LOCATIONS_FILE, LOCATIONS_KIND,
};
pub use resolve::{BundleClosure, ResolvedBundle};

use std::sync::Arc;

use imgbundle_oci::layer;
use imgbundle_oci::manifest::{ImageConfig, OciManifest};
use imgbundle_oci::{Digest, RawManifest, Reference, Registry};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock::ImagesLock;
use crate::retry::RetryPolicy;
use crate::throttle::Throttle;

/// Config label whose presence marks an image as a bundle.
pub const BUNDLE_CONFIG_LABEL: &str = "dev.carvel.imgpkg.bundle";
/// Location of the lock file inside the bundle layer.
pub const IMAGES_LOCK_PATH: &str = ".imgpkg/images.yml";

/// Manifest and config of an image, fetched on first use.
pub struct FetchedImage {
    pub raw: RawManifest,
    /// `None` for an index.
    pub manifest: Option<OciManifest>,
    pub config: Option<ImageConfig>,
}

/// An image reference plus its lazily fetched manifest and config.
pub struct PlainImage {
    reference: Reference,
    registry: Arc<dyn Registry>,
    fetched: OnceCell<FetchedImage>,
}

impl PlainImage {
    /// No I/O happens until the image is inspected.
    pub fn new(reference: Reference, registry: Arc<dyn Registry>) -> Self {
        Self {
            reference,
            registry,
            fetched: OnceCell::new(),
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub async fn fetch(&self) -> Result<&FetchedImage> {
        self.fetched
            .get_or_try_init(|| async {
                let raw = self.registry.get_manifest(&self.reference).await?;
                if raw.is_index() {
                    return Ok(FetchedImage {
                        raw,
                        manifest: None,
                        config: None,
                    });
                }
                let manifest = OciManifest::from_slice(&raw.bytes)?;
                let config_digest = Digest::parse(&manifest.config.digest)?;
                let config_bytes = self
                    .registry
                    .get_blob(&self.reference.context(), &config_digest)
                    .await?;
                let config: ImageConfig = serde_json::from_slice(&config_bytes)?;
                debug!(reference = %self.reference, digest = %raw.digest, "fetched image");
                Ok(FetchedImage {
                    raw,
                    manifest: Some(manifest),
                    config: Some(config),
                })
            })
            .await
    }

    pub async fn digest(&self) -> Result<Digest> {
        Ok(self.fetch().await?.raw.digest.clone())
    }

    /// `repository@digest` for this image.
    pub async fn digest_ref(&self) -> Result<Reference> {
        let digest = self.digest().await?;
        Ok(self.reference.context().digest(&digest))
    }

    /// Whether the config carries [`BUNDLE_CONFIG_LABEL`]. Indexes never do.
    pub async fn is_bundle(&self) -> Result<bool> {
        let fetched = self.fetch().await?;
        Ok(fetched
            .config
            .as_ref()
            .map(|c| c.has_label(BUNDLE_CONFIG_LABEL))
            .unwrap_or(false))
    }
}

/// A bundle, constructed without network access.
pub struct Bundle {
    image: PlainImage,
    closure: OnceCell<Arc<BundleClosure>>,
}

impl Bundle {
    pub fn new(reference: Reference, registry: Arc<dyn Registry>) -> Self {
        Self::from_image(PlainImage::new(reference, registry))
    }

    pub fn from_image(image: PlainImage) -> Self {
        Self {
            image,
            closure: OnceCell::new(),
        }
    }

    pub fn image(&self) -> &PlainImage {
        &self.image
    }

    pub fn reference(&self) -> &Reference {
        self.image.reference()
    }

    pub(crate) fn registry(&self) -> Arc<dyn Registry> {
        self.image.registry.clone()
    }

    pub async fn is_bundle(&self) -> Result<bool> {
        self.image.is_bundle().await
    }

    /// Parse `.imgpkg/images.yml` out of the bundle's only layer.
    pub async fn images_lock(&self) -> Result<ImagesLock> {
        let fetched = self.image.fetch().await?;
        let reference = self.reference().to_string();
        let manifest = fetched.manifest.as_ref().ok_or_else(|| Error::NotABundle {
            reference: reference.clone(),
        })?;
        if manifest.layers.len() != 1 {
            return Err(Error::Lock(format!(
                "expected bundle '{}' to have exactly one layer, found {}",
                reference,
                manifest.layers.len()
            )));
        }
        let layer_desc = &manifest.layers[0];
        let layer_digest = Digest::parse(&layer_desc.digest)?;
        let data = self
            .image
            .registry
            .get_blob(&self.reference().context(), &layer_digest)
            .await?;
        let contents = layer::read_file(&layer_desc.media_type, &data, IMAGES_LOCK_PATH)?
            .ok_or_else(|| Error::MissingImagesLock {
                bundle: reference.clone(),
                path: IMAGES_LOCK_PATH.to_string(),
            })?;
        ImagesLock::from_slice(&contents)
    }

    /// Every image reachable from this bundle, resolved once and memoized.
    pub async fn all_images_lock_refs(
        self: &Arc<Self>,
        throttle: &Throttle,
        retry: &RetryPolicy,
    ) -> Result<Arc<BundleClosure>> {
        self.closure
            .get_or_try_init(|| resolve::resolve(self.clone(), throttle.clone(), retry.clone()))
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ImageLockEntry;
    use imgbundle_oci::{ImageBuilder, InMemoryRegistry, Repository};

    async fn push(reg: &InMemoryRegistry, tag: &str, builder: ImageBuilder) -> Reference {
        let repo = Repository::parse("registry.local/bundles").unwrap();
        let image = builder.build().unwrap();
        image.push(reg, &repo.tag(tag)).await.unwrap();
        repo.digest(&image.digest)
    }

    fn lock_yaml(images: &[String]) -> String {
        ImagesLock::new(
            images
                .iter()
                .map(|i| ImageLockEntry {
                    image: i.clone(),
                    annotations: Default::default(),
                })
                .collect(),
        )
        .to_yaml()
        .unwrap()
    }

    #[tokio::test]
    async fn reads_images_lock_from_bundle_layer() {
        let reg = Arc::new(InMemoryRegistry::new());
        let app = push(&reg, "app", ImageBuilder::new().layer(&[("f", b"x")]).unwrap()).await;
        let yaml = lock_yaml(&[app.to_string()]);
        let bundle_ref = push(
            &reg,
            "bundle",
            ImageBuilder::new()
                .label(BUNDLE_CONFIG_LABEL, "true")
                .layer(&[(IMAGES_LOCK_PATH, yaml.as_bytes())])
                .unwrap(),
        )
        .await;

        let bundle = Bundle::new(bundle_ref, reg.clone());
        assert!(bundle.is_bundle().await.unwrap());
        let lock = bundle.images_lock().await.unwrap();
        assert_eq!(lock.spec.images[0].image, app.to_string());

        let plain = PlainImage::new(app, reg);
        assert!(!plain.is_bundle().await.unwrap());
    }

    #[tokio::test]
    async fn missing_lock_file_is_reported() {
        let reg = Arc::new(InMemoryRegistry::new());
        let bundle_ref = push(
            &reg,
            "bundle",
            ImageBuilder::new()
                .label(BUNDLE_CONFIG_LABEL, "true")
                .layer(&[("README.md", b"hi")])
                .unwrap(),
        )
        .await;

        let err = Bundle::new(bundle_ref, reg).images_lock().await.unwrap_err();
        assert!(matches!(err, Error::MissingImagesLock { .. }), "{err}");
    }

    #[tokio::test]
    async fn multi_layer_bundle_is_rejected() {
        let reg = Arc::new(InMemoryRegistry::new());
        let bundle_ref = push(
            &reg,
            "bundle",
            ImageBuilder::new()
                .label(BUNDLE_CONFIG_LABEL, "true")
                .layer(&[(IMAGES_LOCK_PATH, b"x")])
                .unwrap()
                .layer(&[("other", b"y")])
                .unwrap(),
        )
        .await;

        let err = Bundle::new(bundle_ref, reg).images_lock().await.unwrap_err();
        assert!(err.to_string().contains("exactly one layer"), "{err}");
    }
}
