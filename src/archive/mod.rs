//! OCI image layouts as the interchange format for archives.
//!
//! A layout holds `oci-layout`, an `index.json` listing every exported
//! image or index, and `blobs/<alg>/<hex>` for manifests, configs and
//! layers.  Each `index.json` entry carries the image references it was
//! requested by so an import can restore tags.

pub mod layout;
pub mod tar;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use imgbundle_oci::manifest::{
    is_index_media_type, sniff_media_type, Descriptor, ImageIndex, OciManifest,
};
use imgbundle_oci::{Digest, Reference};
use tracing::{debug, warn};

use crate::descriptor::{
    ConfigDescriptor, ImageDescriptor, ImageLayerDescriptor, ImageOrIndexDescriptor,
    ImageRefDescriptors, IndexDescriptor, LayerProvider, ManifestDescriptor,
};
use crate::error::{Error, Result};
use crate::image_ref::ImageRef;
use crate::imageset::LayerFilter;

pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
/// JSON list of the [`ImageRef`]s an index entry was requested by.
pub const ANNOTATION_REFS: &str = "dev.imgbundle.refs";

/// A blob scheduled for writing.
#[derive(Debug, Clone)]
pub enum PlannedBlob {
    /// Manifest or config bytes already in memory.
    Bytes { digest: Digest, data: Vec<u8> },
    /// Layer bytes fetched through a [`LayerProvider`] at write time.
    Layer(ImageLayerDescriptor),
}

impl PlannedBlob {
    pub fn digest(&self) -> &Digest {
        match self {
            PlannedBlob::Bytes { digest, .. } => digest,
            PlannedBlob::Layer(layer) => &layer.digest,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            PlannedBlob::Bytes { data, .. } => data.len() as u64,
            PlannedBlob::Layer(layer) => layer.size,
        }
    }
}

/// Everything an archive writer needs: the index plus each distinct blob,
/// sorted by digest.
#[derive(Debug, Clone)]
pub struct LayoutPlan {
    pub index: ImageIndex,
    pub blobs: Vec<PlannedBlob>,
}

impl LayoutPlan {
    pub fn build(descriptors: &ImageRefDescriptors, filter: &LayerFilter) -> Result<Self> {
        let mut index = ImageIndex::new();
        let mut blobs = BTreeMap::new();

        for item in descriptors.items() {
            let manifest = item.manifest();
            let mut annotations = BTreeMap::new();
            annotations.insert(
                ANNOTATION_REFS.to_string(),
                serde_json::to_string(item.refs())?,
            );
            if let Some(first) = item.refs().iter().find(|r| r.tag.is_some()) {
                let tag = first.tag.as_deref().unwrap_or_default();
                annotations.insert(
                    ANNOTATION_REF_NAME.to_string(),
                    first.repository().tag(tag).to_string(),
                );
            }
            let mut desc = Descriptor::new(
                manifest.media_type.clone(),
                manifest.digest.to_string(),
                manifest.size,
            );
            desc.annotations = Some(annotations);
            index.manifests.push(desc);

            plan_tree(item, filter, &mut blobs);
        }

        Ok(Self {
            index,
            blobs: blobs.into_values().collect(),
        })
    }

    pub fn index_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.index)?)
    }

    pub fn layers(&self) -> impl Iterator<Item = &ImageLayerDescriptor> {
        self.blobs.iter().filter_map(|b| match b {
            PlannedBlob::Layer(layer) => Some(layer),
            PlannedBlob::Bytes { .. } => None,
        })
    }
}

fn plan_tree(
    item: &ImageOrIndexDescriptor,
    filter: &LayerFilter,
    blobs: &mut BTreeMap<String, PlannedBlob>,
) {
    let manifest = item.manifest();
    blobs
        .entry(manifest.digest.to_string())
        .or_insert_with(|| PlannedBlob::Bytes {
            digest: manifest.digest.clone(),
            data: manifest.raw.clone(),
        });

    match item {
        ImageOrIndexDescriptor::Image(image) => {
            blobs
                .entry(image.config.digest.to_string())
                .or_insert_with(|| PlannedBlob::Bytes {
                    digest: image.config.digest.clone(),
                    data: image.config.raw.clone(),
                });
            for layer in &image.layers {
                if !filter.includes(layer) {
                    warn!(
                        digest = %layer.digest,
                        media_type = %layer.media_type,
                        "skipping non-distributable layer (use --include-non-distributable-layers)"
                    );
                    continue;
                }
                blobs
                    .entry(layer.digest.to_string())
                    .or_insert_with(|| PlannedBlob::Layer(layer.clone()));
            }
        }
        ImageOrIndexDescriptor::Index(index) => {
            for child in &index.children {
                plan_tree(child, filter, blobs);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Random access to the blobs of a layout, wherever it is stored.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// The parsed `index.json`, after checking `oci-layout`.
    async fn index(&self) -> Result<ImageIndex>;

    /// Blob bytes.  A blob the layout lacks is [`Error::ArchiveEntryMissing`].
    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>>;
}

/// Read a blob and check it against its digest.
pub async fn read_verified(store: &dyn BlobStore, digest: &Digest) -> Result<Vec<u8>> {
    let data = store.read_blob(digest).await?;
    digest
        .verify(&data)
        .map_err(|e| Error::ArchiveCorrupt(format!("blob {}: {}", digest, e)))?;
    Ok(data)
}

/// Rebuild the descriptor trees recorded in a layout.
pub async fn read_descriptors(store: &dyn BlobStore) -> Result<ImageRefDescriptors> {
    let index = store.index().await?;
    let mut items = Vec::with_capacity(index.manifests.len());
    for entry in &index.manifests {
        let digest = Digest::parse(&entry.digest)?;
        let refs = entry_refs(entry, &digest)?;
        items.push(read_tree(store, digest, Some(entry.media_type.clone()), refs).await?);
    }
    debug!(items = items.len(), "read archive index");
    Ok(ImageRefDescriptors::new(items))
}

fn entry_refs(entry: &Descriptor, digest: &Digest) -> Result<Vec<ImageRef>> {
    let annotations = entry.annotations.clone().unwrap_or_default();
    if let Some(raw) = annotations.get(ANNOTATION_REFS) {
        let refs: Vec<ImageRef> = serde_json::from_str(raw).map_err(|e| {
            Error::ArchiveCorrupt(format!("bad {} on {}: {}", ANNOTATION_REFS, digest, e))
        })?;
        if refs.iter().any(|r| r.digest() != digest) {
            return Err(Error::ArchiveCorrupt(format!(
                "references recorded for {} point at other content",
                digest
            )));
        }
        return Ok(refs);
    }

    // Layouts written by other tools: a fully qualified ref.name is enough.
    let name = annotations.get(ANNOTATION_REF_NAME).ok_or_else(|| {
        Error::ArchiveCorrupt(format!("index entry {} has no image reference", digest))
    })?;
    let named = Reference::parse(name)
        .map_err(|e| Error::ArchiveCorrupt(format!("index entry {}: {}", digest, e)))?;
    let mut image = ImageRef::from_reference(named.context().digest(digest))?;
    if let Some(tag) = named.tag() {
        image = image.with_tag(tag);
    }
    Ok(vec![image.with_orig_ref(name.clone())])
}

type BoxedResult<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

fn read_tree<'a>(
    store: &'a dyn BlobStore,
    digest: Digest,
    declared_media_type: Option<String>,
    refs: Vec<ImageRef>,
) -> BoxedResult<'a, ImageOrIndexDescriptor> {
    Box::pin(async move {
        let raw = read_verified(store, &digest).await?;
        let media_type = sniff_media_type(declared_media_type.as_deref(), &raw)?;
        let manifest = ManifestDescriptor {
            media_type: media_type.clone(),
            size: raw.len() as u64,
            digest,
            raw,
        };

        if is_index_media_type(&media_type) {
            let index = ImageIndex::from_slice(&manifest.raw)?;
            let mut children = Vec::with_capacity(index.manifests.len());
            for child in &index.manifests {
                let child_digest = Digest::parse(&child.digest)?;
                children.push(
                    read_tree(store, child_digest, Some(child.media_type.clone()), Vec::new())
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
        let config_raw = read_verified(store, &config_digest).await?;
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

/// Serves layer bytes out of an archive, rejecting any whose content does
/// not hash to the recorded digest.
pub struct ArchiveLayerProvider {
    store: Arc<dyn BlobStore>,
}

impl ArchiveLayerProvider {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LayerProvider for ArchiveLayerProvider {
    async fn contents(&self, layer: &ImageLayerDescriptor) -> Result<Vec<u8>> {
        let data = read_verified(self.store.as_ref(), &layer.digest).await?;
        if data.len() as u64 != layer.size {
            return Err(Error::ArchiveCorrupt(format!(
                "layer {} is {} bytes, expected {}",
                layer.digest,
                data.len(),
                layer.size
            )));
        }
        Ok(data)
    }
}
