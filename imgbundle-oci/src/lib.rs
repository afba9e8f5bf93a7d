//! OCI registry plumbing: references, manifests, a distribution API client,
//! an in-memory registry, and on-disk image layouts.

pub mod error;
pub mod image;
pub mod layer;
pub mod layout;
pub mod manifest;
pub mod reference;
pub mod registry;

pub use error::{OciError, Result};
pub use image::{BuiltImage, ImageBuilder};
pub use layout::OciLayoutDir;
pub use reference::{Digest, Reference, Repository};
pub use registry::{
    InMemoryRegistry, ManifestHead, RawManifest, Registry, RegistryAuth, RegistryClient,
};
