//! Descriptor trees: everything about an image or index except layer bytes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use imgbundle_oci::manifest::{is_non_distributable_media_type, Descriptor};
use imgbundle_oci::{Digest, Registry, Repository};

use crate::error::Result;
use crate::image_ref::ImageRef;

/// A manifest or index, with its exact bytes.
#[derive(Debug, Clone)]
pub struct ManifestDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    pub raw: Vec<u8>,
}

/// A layer, by digest.  Bytes come from a [`LayerProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayerDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

impl ImageLayerDescriptor {
    pub fn from_oci(desc: &Descriptor) -> Result<Self> {
        Ok(Self {
            media_type: desc.media_type.clone(),
            digest: Digest::parse(&desc.digest)?,
            size: desc.size,
        })
    }

    pub fn is_distributable(&self) -> bool {
        !is_non_distributable_media_type(&self.media_type)
    }
}

#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    /// Every reference this content was requested by.
    pub refs: Vec<ImageRef>,
    pub manifest: ManifestDescriptor,
    pub config: ConfigDescriptor,
    pub layers: Vec<ImageLayerDescriptor>,
}

#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub refs: Vec<ImageRef>,
    pub manifest: ManifestDescriptor,
    /// Child manifests in index order.
    pub children: Vec<ImageOrIndexDescriptor>,
}

#[derive(Debug, Clone)]
pub enum ImageOrIndexDescriptor {
    Image(ImageDescriptor),
    Index(IndexDescriptor),
}

impl ImageOrIndexDescriptor {
    pub fn manifest(&self) -> &ManifestDescriptor {
        match self {
            Self::Image(image) => &image.manifest,
            Self::Index(index) => &index.manifest,
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.manifest().digest
    }

    pub fn refs(&self) -> &[ImageRef] {
        match self {
            Self::Image(image) => &image.refs,
            Self::Index(index) => &index.refs,
        }
    }

    pub fn refs_mut(&mut self) -> &mut Vec<ImageRef> {
        match self {
            Self::Image(image) => &mut image.refs,
            Self::Index(index) => &mut index.refs,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index(_))
    }

    /// Every layer of every image in this tree, depth first.
    pub fn layers(&self) -> Vec<&ImageLayerDescriptor> {
        let mut out = Vec::new();
        self.collect_layers(&mut out);
        out
    }

    fn collect_layers<'a>(&'a self, out: &mut Vec<&'a ImageLayerDescriptor>) {
        match self {
            Self::Image(image) => out.extend(image.layers.iter()),
            Self::Index(index) => {
                for child in &index.children {
                    child.collect_layers(out);
                }
            }
        }
    }
}

/// The export result: one descriptor tree per requested digest, ordered by
/// digest.
#[derive(Debug, Clone, Default)]
pub struct ImageRefDescriptors {
    items: Vec<ImageOrIndexDescriptor>,
}

impl ImageRefDescriptors {
    /// Merge items that share a digest (combining their refs) and sort.
    pub fn new(items: Vec<ImageOrIndexDescriptor>) -> Self {
        let mut by_digest: BTreeMap<String, ImageOrIndexDescriptor> = BTreeMap::new();
        for item in items {
            match by_digest.get_mut(&item.digest().to_string()) {
                Some(existing) => {
                    for r in item.refs() {
                        if !existing.refs().contains(r) {
                            existing.refs_mut().push(r.clone());
                        }
                    }
                }
                None => {
                    by_digest.insert(item.digest().to_string(), item);
                }
            }
        }
        let mut items: Vec<_> = by_digest.into_values().collect();
        for item in &mut items {
            item.refs_mut().sort();
        }
        Self { items }
    }

    pub fn items(&self) -> &[ImageOrIndexDescriptor] {
        &self.items
    }

    pub fn into_items(self) -> Vec<ImageOrIndexDescriptor> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Distinct layers across all items, sorted by digest.
    pub fn layers(&self) -> Vec<ImageLayerDescriptor> {
        let mut seen = BTreeMap::new();
        for item in &self.items {
            for layer in item.layers() {
                seen.entry(layer.digest.to_string())
                    .or_insert_with(|| layer.clone());
            }
        }
        seen.into_values().collect()
    }
}

// ---------------------------------------------------------------------------
// Layer contents
// ---------------------------------------------------------------------------

/// Supplies layer bytes on demand.
#[async_trait]
pub trait LayerProvider: Send + Sync {
    async fn contents(&self, layer: &ImageLayerDescriptor) -> Result<Vec<u8>>;
}

/// Reads layers from the repositories they were exported from.
pub struct RegistryLayerProvider {
    registry: Arc<dyn Registry>,
    sources: HashMap<Digest, Repository>,
}

impl RegistryLayerProvider {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            sources: HashMap::new(),
        }
    }

    /// Remember that `digest` can be fetched from `repository`.  The first
    /// source recorded wins.
    pub fn add_source(&mut self, digest: Digest, repository: Repository) {
        self.sources.entry(digest).or_insert(repository);
    }
}

#[async_trait]
impl LayerProvider for RegistryLayerProvider {
    async fn contents(&self, layer: &ImageLayerDescriptor) -> Result<Vec<u8>> {
        let repository = self.sources.get(&layer.digest).ok_or_else(|| {
            imgbundle_oci::OciError::Layer(format!("no source repository for {}", layer.digest))
        })?;
        Ok(self.registry.get_blob(repository, &layer.digest).await?)
    }
}
