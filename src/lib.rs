//! imgbundle: relocate OCI bundles and the images they reference.
//!
//! A bundle is an OCI image whose config carries the bundle label and whose
//! single layer holds `.imgpkg/images.yml`.  The relocation engine resolves
//! the full closure of a bundle (nested bundles included), finds companion
//! signature/SBOM/attestation images, and copies everything to a registry
//! repository or an archive while preserving digests.
//!
//! ## Modules
//!
//! - [`image_ref`]: digest-addressed references and result sets
//! - [`descriptor`]: manifest/config/layer descriptor trees
//! - [`bundle`]: bundle detection and recursive resolution
//! - [`artifacts`]: cosign-style companion image lookup
//! - [`throttle`] / [`retry`]: concurrency gate and retry policy
//! - [`imageset`]: registry and archive export/import
//! - [`archive`]: OCI layout tarballs and directories
//! - [`copy`]: the top-level copy pipeline

pub mod archive;
pub mod artifacts;
pub mod bundle;
pub mod config;
pub mod copy;
pub mod descriptor;
pub mod error;
pub mod image_ref;
pub mod imageset;
pub mod lock;
pub mod retry;
pub mod throttle;

pub use error::{Error, Result};
pub use image_ref::{ImageRef, ProcessedImage, ProcessedImages, UnprocessedImageRefs};
pub use throttle::Throttle;
