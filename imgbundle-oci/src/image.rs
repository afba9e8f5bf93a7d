use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Result;
use crate::layer::{build_layer, LayerBlob};
use crate::manifest::{
    Descriptor, ImageConfig, OciManifest, RootFs, RuntimeConfig, MEDIA_TYPE_OCI_CONFIG,
    MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::reference::{Digest, Reference};
use crate::registry::Registry;

/// Assembles small single-purpose images in memory (bundles, location
/// records).
#[derive(Debug, Default)]
pub struct ImageBuilder {
    labels: BTreeMap<String, String>,
    layers: Vec<LayerBlob>,
}

/// An image whose manifest, config and layers are all held in memory.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub manifest: Vec<u8>,
    pub digest: Digest,
    pub config: Vec<u8>,
    pub config_digest: Digest,
    pub layers: Vec<LayerBlob>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a gzip layer holding `files`.
    pub fn layer(mut self, files: &[(&str, &[u8])]) -> Result<Self> {
        self.layers.push(build_layer(files)?);
        Ok(self)
    }

    pub fn build(self) -> Result<BuiltImage> {
        let config = ImageConfig {
            architecture: Some(String::new()),
            os: Some(String::new()),
            config: Some(RuntimeConfig {
                labels: (!self.labels.is_empty()).then_some(self.labels),
            }),
            rootfs: Some(RootFs {
                kind: "layers".to_string(),
                diff_ids: self.layers.iter().map(|l| l.diff_id.to_string()).collect(),
            }),
        };
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = Digest::sha256_of(&config_bytes);

        let manifest = OciManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            config: Descriptor::new(
                MEDIA_TYPE_OCI_CONFIG,
                config_digest.to_string(),
                config_bytes.len() as u64,
            ),
            layers: self
                .layers
                .iter()
                .map(|l| {
                    Descriptor::new(
                        MEDIA_TYPE_OCI_LAYER_GZIP,
                        l.digest.to_string(),
                        l.data.len() as u64,
                    )
                })
                .collect(),
            annotations: None,
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;

        Ok(BuiltImage {
            digest: Digest::sha256_of(&manifest_bytes),
            manifest: manifest_bytes,
            config: config_bytes,
            config_digest,
            layers: self.layers,
        })
    }
}

impl BuiltImage {
    /// Upload blobs then the manifest under `reference` (tag or digest).
    pub async fn push(&self, registry: &dyn Registry, reference: &Reference) -> Result<Digest> {
        let repository = reference.context();
        if !registry.has_blob(&repository, &self.config_digest).await? {
            registry
                .put_blob(&repository, &self.config_digest, self.config.clone())
                .await?;
        }
        for layer in &self.layers {
            if !registry.has_blob(&repository, &layer.digest).await? {
                registry
                    .put_blob(&repository, &layer.digest, layer.data.clone())
                    .await?;
            }
        }
        debug!(%reference, digest = %self.digest, "pushing built image");
        registry
            .put_manifest(reference, MEDIA_TYPE_OCI_MANIFEST, self.manifest.clone())
            .await
    }
}
