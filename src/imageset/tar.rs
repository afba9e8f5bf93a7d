use std::path::PathBuf;
use std::sync::Arc;

use imgbundle_oci::{Registry, Repository};
use tracing::info;

use super::{ImageSet, LayerFilter};
use crate::archive::layout::{write_layout_dir, LayoutDirStore};
use crate::archive::tar::{write_tar, TarArchive};
use crate::archive::{read_descriptors, ArchiveLayerProvider, BlobStore, LayoutPlan};
use crate::descriptor::ImageRefDescriptors;
use crate::error::Result;
use crate::image_ref::{ProcessedImages, UnprocessedImageRefs};

/// Where an export is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveTarget {
    Tar(PathBuf),
    LayoutDir(PathBuf),
}

/// Where an import reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    Tar(PathBuf),
    LayoutDir(PathBuf),
}

/// The [`ImageSet`] contract with an archive in place of a live registry on
/// one side.
#[derive(Debug, Clone)]
pub struct TarImageSet {
    image_set: ImageSet,
}

impl TarImageSet {
    pub fn new(image_set: ImageSet) -> Self {
        Self { image_set }
    }

    /// Export `refs` from `registry` and write them to `target`.
    pub async fn export(
        &self,
        refs: &UnprocessedImageRefs,
        registry: Arc<dyn Registry>,
        target: &ArchiveTarget,
        filter: LayerFilter,
    ) -> Result<ImageRefDescriptors> {
        let (descriptors, provider) = self.image_set.export(refs, registry).await?;
        let plan = LayoutPlan::build(&descriptors, &filter)?;
        let throttle = self.image_set.throttle();
        let retry = self.image_set.retry();
        match target {
            ArchiveTarget::Tar(path) => write_tar(path, &plan, provider, throttle, retry).await?,
            ArchiveTarget::LayoutDir(dir) => {
                write_layout_dir(dir, &plan, provider, throttle, retry).await?
            }
        }
        info!(items = descriptors.len(), blobs = plan.blobs.len(), "export finished");
        Ok(descriptors)
    }

    /// Read the descriptor trees stored in `source` and import them into
    /// `destination`.
    pub async fn import(
        &self,
        source: &ArchiveSource,
        destination: &Repository,
        registry: Arc<dyn Registry>,
        filter: LayerFilter,
    ) -> Result<ProcessedImages> {
        let store: Arc<dyn BlobStore> = match source {
            ArchiveSource::Tar(path) => Arc::new(TarArchive::open(path).await?),
            ArchiveSource::LayoutDir(dir) => Arc::new(LayoutDirStore::new(dir)),
        };
        let descriptors = read_descriptors(store.as_ref()).await?;
        let provider = Arc::new(ArchiveLayerProvider::new(store));
        self.image_set
            .import(&descriptors, provider, destination, registry, filter)
            .await
    }
}
