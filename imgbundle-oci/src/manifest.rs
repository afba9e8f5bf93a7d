//! Wire model for manifests, indexes and image configs.  Only the fields
//! relocation needs are typed; unknown fields are dropped on parse, so the
//! raw bytes are what gets copied, never a re-serialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// A single-image manifest, OCI or Docker v2 schema 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciManifest {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| OciError::Manifest(format!("invalid image manifest: {}", e)))
    }
}

/// Points at a blob or a child manifest by digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    /// Where foreign layers may be fetched from instead of the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            urls: None,
            annotations: None,
            platform: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

// ---------------------------------------------------------------------------
// Indexes
// ---------------------------------------------------------------------------

/// A multi-image index or Docker manifest list.  Also the format of an OCI
/// layout's `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageIndex {
    pub fn new() -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            manifests: Vec::new(),
            annotations: None,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| OciError::Manifest(format!("invalid image index: {}", e)))
    }
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Config blob
// ---------------------------------------------------------------------------

/// The parts of an image config that bundle detection reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default)]
    pub config: Option<RuntimeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<RootFs>,
}

impl ImageConfig {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    pub fn has_label(&self, key: &str) -> bool {
        self.label(key).is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Media types
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_OCI_LAYER_NONDISTRIBUTABLE_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_DOCKER_FOREIGN_LAYER: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// Layers registries may refuse to host, such as Windows base layers.
pub fn is_non_distributable_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_FOREIGN_LAYER || media_type.contains(".nondistributable.")
}

/// Work out whether raw manifest bytes describe an index, preferring the
/// declared media type and falling back to the presence of `manifests`.
pub fn sniff_media_type(declared: Option<&str>, data: &[u8]) -> Result<String> {
    if let Some(mt) = declared.filter(|mt| is_index_media_type(mt) || is_manifest_media_type(mt)) {
        return Ok(mt.to_string());
    }

    let raw: serde_json::Value = serde_json::from_slice(data)?;
    if let Some(mt) = raw.get("mediaType").and_then(|v| v.as_str()) {
        if is_index_media_type(mt) || is_manifest_media_type(mt) {
            return Ok(mt.to_string());
        }
    }
    if raw.get("manifests").is_some() {
        Ok(MEDIA_TYPE_OCI_INDEX.to_string())
    } else if raw.get("layers").is_some() {
        Ok(MEDIA_TYPE_OCI_MANIFEST.to_string())
    } else {
        Err(OciError::UnsupportedMediaType(
            declared.unwrap_or("<none>").to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOWS_IMAGE: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {"mediaType": "application/vnd.docker.container.image.v1+json",
                   "digest": "sha256:c0", "size": 10},
        "layers": [
            {"mediaType": "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
             "digest": "sha256:f0", "size": 300,
             "urls": ["https://mcr.example.com/base"]},
            {"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
             "digest": "sha256:a0", "size": 20}
        ]
    }"#;

    #[test]
    fn foreign_layers_are_recognised() {
        let m = OciManifest::from_slice(WINDOWS_IMAGE.as_bytes()).unwrap();
        assert_eq!(m.layers.len(), 2);
        assert_eq!(m.layers[0].urls.as_ref().map(Vec::len), Some(1));
        assert!(is_non_distributable_media_type(&m.layers[0].media_type));
        assert!(!is_non_distributable_media_type(&m.layers[1].media_type));
    }

    const UNTYPED_INDEX: &str = r#"{
        "schemaVersion": 2,
        "manifests": [
            {"mediaType": "application/vnd.oci.image.manifest.v1+json",
             "digest": "sha256:a1", "size": 100,
             "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}}
        ]
    }"#;

    #[test]
    fn sniff_index_without_media_type() {
        let mt = sniff_media_type(None, UNTYPED_INDEX.as_bytes()).unwrap();
        assert_eq!(mt, MEDIA_TYPE_OCI_INDEX);
        let idx = ImageIndex::from_slice(UNTYPED_INDEX.as_bytes()).unwrap();
        let platform = idx.manifests[0].platform.as_ref().unwrap();
        assert_eq!(platform.variant.as_deref(), Some("v8"));
    }

    #[test]
    fn sniff_prefers_declared_type() {
        let mt = sniff_media_type(Some(MEDIA_TYPE_OCI_MANIFEST), WINDOWS_IMAGE.as_bytes()).unwrap();
        assert_eq!(mt, MEDIA_TYPE_OCI_MANIFEST);
        let mt = sniff_media_type(Some("application/json"), WINDOWS_IMAGE.as_bytes()).unwrap();
        assert_eq!(mt, MEDIA_TYPE_DOCKER_MANIFEST);
    }

    #[test]
    fn config_labels() {
        let cfg: ImageConfig = serde_json::from_str(
            r#"{"config":{"Labels":{"dev.carvel.imgpkg.bundle":"true"}}}"#,
        )
        .unwrap();
        assert!(cfg.has_label("dev.carvel.imgpkg.bundle"));
        assert!(!cfg.has_label("other"));
        let empty: ImageConfig = serde_json::from_str("{}").unwrap();
        assert!(!empty.has_label("dev.carvel.imgpkg.bundle"));
    }

    #[test]
    fn media_type_helpers() {
        assert!(is_index_media_type(MEDIA_TYPE_OCI_INDEX));
        assert!(is_index_media_type(MEDIA_TYPE_DOCKER_MANIFEST_LIST));
        assert!(!is_index_media_type(MEDIA_TYPE_OCI_MANIFEST));

        assert!(is_manifest_media_type(MEDIA_TYPE_OCI_MANIFEST));
        assert!(is_manifest_media_type(MEDIA_TYPE_DOCKER_MANIFEST));
        assert!(!is_manifest_media_type(MEDIA_TYPE_OCI_INDEX));
        assert!(is_non_distributable_media_type(
            MEDIA_TYPE_OCI_LAYER_NONDISTRIBUTABLE_GZIP
        ));
    }
}
