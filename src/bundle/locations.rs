use imgbundle_oci::layer;
use imgbundle_oci::manifest::OciManifest;
use imgbundle_oci::{Digest, ImageBuilder, Reference, Registry, Repository};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lock::API_VERSION;

pub const LOCATIONS_KIND: &str = "ImageLocations";
/// File name inside the locations image layer.
pub const LOCATIONS_FILE: &str = "image-locations.yml";

/// Where a bundle's images were copied to, stored next to the bundle so a
/// relocated bundle resolves without its original registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationsConfig {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub images: Vec<ImageLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLocation {
    pub image: String,
    pub is_bundle: bool,
}

/// `sha256-<hex>.image-locations.imgpkg`
pub fn locations_tag(bundle_digest: &Digest) -> String {
    format!(
        "{}-{}.image-locations.imgpkg",
        bundle_digest.algorithm(),
        bundle_digest.hex()
    )
}

impl LocationsConfig {
    pub fn new(images: Vec<ImageLocation>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: LOCATIONS_KIND.to_string(),
            images,
        }
    }

    /// The entry whose reference pins `digest`.
    pub fn find(&self, digest: &Digest) -> Option<&ImageLocation> {
        self.images.iter().find(|loc| {
            Reference::parse(&loc.image)
                .ok()
                .and_then(|r| r.digest())
                .as_ref()
                == Some(digest)
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(raw: &[u8]) -> Result<Self> {
        let config: LocationsConfig = serde_yaml::from_slice(raw)?;
        if config.kind != LOCATIONS_KIND {
            return Err(Error::Lock(format!(
                "expected kind '{}', found '{}'",
                LOCATIONS_KIND, config.kind
            )));
        }
        Ok(config)
    }
}

/// Read the locations record stored for `bundle_digest` in `repository`.
/// A missing or inaccessible record is `Ok(None)`.
pub async fn fetch_locations(
    registry: &dyn Registry,
    repository: &Repository,
    bundle_digest: &Digest,
) -> Result<Option<LocationsConfig>> {
    let reference = repository.tag(&locations_tag(bundle_digest));
    let raw = match registry.get_manifest(&reference).await {
        Ok(raw) => raw,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) if e.is_denied() || e.is_unauthorized() => {
            warn!(%reference, error = %e, "cannot read image locations, ignoring");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let manifest = OciManifest::from_slice(&raw.bytes)?;
    let layer_desc = manifest.layers.first().ok_or_else(|| {
        Error::Lock(format!("locations image {} has no layers", reference))
    })?;
    let data = registry
        .get_blob(repository, &Digest::parse(&layer_desc.digest)?)
        .await?;
    let contents = layer::read_file(&layer_desc.media_type, &data, LOCATIONS_FILE)?
        .ok_or_else(|| Error::MissingImagesLock {
            bundle: reference.to_string(),
            path: LOCATIONS_FILE.to_string(),
        })?;
    debug!(%reference, "found image locations");
    Ok(Some(LocationsConfig::from_yaml(&contents)?))
}

/// Store `config` as a single-layer image tagged
/// [`locations_tag`]`(bundle_digest)` in `repository`.
pub async fn write_locations(
    registry: &dyn Registry,
    repository: &Repository,
    bundle_digest: &Digest,
    config: &LocationsConfig,
) -> Result<Digest> {
    let yaml = config.to_yaml()?;
    let image = ImageBuilder::new()
        .layer(&[(LOCATIONS_FILE, yaml.as_bytes())])?
        .build()?;
    let reference = repository.tag(&locations_tag(bundle_digest));
    let digest = image.push(registry, &reference).await?;
    debug!(%reference, %digest, "wrote image locations");
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgbundle_oci::InMemoryRegistry;

    #[test]
    fn tag_is_derived_from_digest() {
        let digest = Digest::sha256_of(b"bundle");
        assert_eq!(
            locations_tag(&digest),
            format!("sha256-{}.image-locations.imgpkg", digest.hex())
        );
    }

    #[tokio::test]
    async fn write_then_fetch() {
        let reg = InMemoryRegistry::new();
        let repo = Repository::parse("registry.local/dest").unwrap();
        let bundle = Digest::sha256_of(b"bundle");
        let child = Digest::sha256_of(b"child");

        assert_eq!(fetch_locations(&reg, &repo, &bundle).await.unwrap(), None);

        let config = LocationsConfig::new(vec![ImageLocation {
            image: repo.digest(&child).to_string(),
            is_bundle: false,
        }]);
        write_locations(&reg, &repo, &bundle, &config).await.unwrap();

        let read = fetch_locations(&reg, &repo, &bundle).await.unwrap().unwrap();
        assert_eq!(read, config);
        assert!(read.find(&child).is_some());
        assert!(read.find(&bundle).is_none());
    }
}
