//! The copy pipeline.
//!
//! `ResolveSource -> ExpandClosure -> FetchArtifacts -> Transfer -> Tag ->
//! AnnotateLockFiles`.  Every stage shares one [`Throttle`], so the
//! configured concurrency bounds the whole copy rather than each subtree.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use imgbundle_oci::{Digest, Reference, Registry, Repository};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::artifacts::{Artifacts, FetchError, Finder};
use crate::bundle::{
    write_locations, Bundle, ImageLocation, LocationsConfig, PlainImage, ResolvedBundle,
};
use crate::config::Settings;
use crate::descriptor::ImageRefDescriptors;
use crate::error::{Error, Result};
use crate::image_ref::{ImageRef, ProcessedImage, ProcessedImages, UnprocessedImageRefs};
use crate::imageset::{ArchiveSource, ArchiveTarget, ImageSet, LayerFilter, TarImageSet};
use crate::lock::{BundleLock, ImageLockEntry, ImagesLock, LockFile};
use crate::retry::{throttled, RetryPolicy};
use crate::throttle::Throttle;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// What to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// A `BundleLock` or `ImagesLock` file.
    LockFile(PathBuf),
    /// A single plain image.
    Image(Reference),
    Bundle(Reference),
    /// A tarball written by a previous export.
    Tar(PathBuf),
    /// An OCI layout directory written by a previous export.
    OciLayout(PathBuf),
}

impl CopySource {
    /// Pick the source from command-line flags; exactly one must be set.
    pub fn from_flags(
        bundle: Option<&str>,
        image: Option<&str>,
        lock: Option<&Path>,
        tar: Option<&Path>,
        oci_layout: Option<&Path>,
    ) -> Result<Self> {
        let given = [
            bundle.is_some(),
            image.is_some(),
            lock.is_some(),
            tar.is_some(),
            oci_layout.is_some(),
        ];
        match given.iter().filter(|set| **set).count() {
            0 => {
                return Err(Error::Usage(
                    "expected one of --bundle, --image, --lock, --tar or --oci-layout".into(),
                ))
            }
            1 => {}
            _ => {
                return Err(Error::Usage(
                    "only one of --bundle, --image, --lock, --tar or --oci-layout may be given"
                        .into(),
                ))
            }
        }

        if let Some(bundle) = bundle {
            return Ok(CopySource::Bundle(Reference::parse(bundle)?));
        }
        if let Some(image) = image {
            return Ok(CopySource::Image(Reference::parse(image)?));
        }
        if let Some(lock) = lock {
            return Ok(CopySource::LockFile(lock.to_path_buf()));
        }
        if let Some(tar) = tar {
            return Ok(CopySource::Tar(tar.to_path_buf()));
        }
        match oci_layout {
            Some(dir) => Ok(CopySource::OciLayout(dir.to_path_buf())),
            None => Err(Error::Usage("no copy source given".into())),
        }
    }

    fn archive(&self) -> Option<ArchiveSource> {
        match self {
            CopySource::Tar(path) => Some(ArchiveSource::Tar(path.clone())),
            CopySource::OciLayout(dir) => Some(ArchiveSource::LayoutDir(dir.clone())),
            _ => None,
        }
    }
}

/// Where to copy to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyDestination {
    Repository(Repository),
    Tar(PathBuf),
    OciLayout(PathBuf),
}

impl CopyDestination {
    pub fn from_flags(
        to_repo: Option<&str>,
        to_tar: Option<&Path>,
        to_oci_layout: Option<&Path>,
    ) -> Result<Self> {
        match (to_repo, to_tar, to_oci_layout) {
            (Some(repo), None, None) => Ok(CopyDestination::Repository(Repository::parse(repo)?)),
            (None, Some(tar), None) => Ok(CopyDestination::Tar(tar.to_path_buf())),
            (None, None, Some(dir)) => Ok(CopyDestination::OciLayout(dir.to_path_buf())),
            (None, None, None) => Err(Error::Usage(
                "expected one of --to-repo, --to-tar or --to-oci-layout".into(),
            )),
            _ => Err(Error::Usage(
                "only one of --to-repo, --to-tar or --to-oci-layout may be given".into(),
            )),
        }
    }

    fn archive(&self) -> Option<ArchiveTarget> {
        match self {
            CopyDestination::Repository(_) => None,
            CopyDestination::Tar(path) => Some(ArchiveTarget::Tar(path.clone())),
            CopyDestination::OciLayout(dir) => Some(ArchiveTarget::LayoutDir(dir.clone())),
        }
    }
}

/// Tunables for one copy.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub filter: LayerFilter,
    pub fetch_artifacts: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl CopyOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            concurrency: settings.concurrency,
            retry: settings.retry_policy(),
            filter: LayerFilter::new(settings.include_non_distributable_layers),
            fetch_artifacts: settings.fetch_artifacts,
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Everything a copy produced.
#[derive(Debug, Default)]
pub struct CopyReport {
    /// Images written to the destination repository (empty for archive
    /// destinations).
    pub processed: ProcessedImages,
    /// Descriptor trees written to an archive destination.
    pub exported: Option<ImageRefDescriptors>,
    /// Artifact lookups that were denied.  The copy still succeeded.
    pub denied: FetchError,
    /// Bundles discovered while expanding the source.
    pub bundles: Vec<ResolvedBundle>,
    /// Human tags (re)written during the tag stage.
    pub retagged: usize,
    /// Bundles that received a locations record.
    pub annotated: usize,
    /// Lock file describing the copied source at its new location.
    pub lock: Option<LockFile>,
}

enum Resolved {
    Bundle {
        bundle: Arc<Bundle>,
        tag: Option<String>,
    },
    Images {
        refs: Vec<ImageRef>,
        lock: ImagesLock,
    },
    Archive(ArchiveSource),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct CopyOrchestrator {
    registry: Arc<dyn Registry>,
    finder: Arc<dyn Finder>,
    options: CopyOptions,
    throttle: Throttle,
}

impl CopyOrchestrator {
    pub fn new(registry: Arc<dyn Registry>, finder: Arc<dyn Finder>, options: CopyOptions) -> Self {
        let throttle = Throttle::new(options.concurrency);
        Self {
            registry,
            finder,
            options,
            throttle,
        }
    }

    /// The gate every stage of this copy goes through.
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    fn image_set(&self) -> ImageSet {
        ImageSet::new(self.throttle.clone(), self.options.retry.clone())
    }

    pub async fn run(
        &self,
        source: &CopySource,
        destination: &CopyDestination,
    ) -> Result<CopyReport> {
        if source.archive().is_some() && destination.archive().is_some() {
            return Err(Error::Usage(
                "archives can only be copied to a repository (use --to-repo)".into(),
            ));
        }

        let mut report = CopyReport::default();
        let resolved = self.resolve_source(source).await?;

        let refs = UnprocessedImageRefs::new();
        let (root, images_lock) = match &resolved {
            Resolved::Bundle { bundle, tag } => {
                let root = self.expand_closure(bundle, tag.clone(), &refs, &mut report).await?;
                (Some(root), None)
            }
            Resolved::Images { refs: images, lock } => {
                refs.extend(images.iter().cloned());
                (None, Some(lock))
            }
            Resolved::Archive(_) => (None, None),
        };

        if self.options.fetch_artifacts && !refs.is_empty() {
            let outcome = Artifacts::new(self.finder.clone(), self.throttle.clone())
                .fetch_for_image_refs(&refs.all())
                .await?;
            refs.extend(outcome.artifacts);
            report.denied = outcome.denied;
        }

        match (&resolved, destination) {
            (Resolved::Archive(archive), CopyDestination::Repository(repo)) => {
                info!(destination = %repo, "importing archive");
                report.processed = TarImageSet::new(self.image_set())
                    .import(archive, repo, self.registry.clone(), self.options.filter)
                    .await?;
            }
            (_, CopyDestination::Repository(repo)) => {
                info!(images = refs.len(), destination = %repo, "copying to repository");
                report.processed = self
                    .image_set()
                    .relocate(
                        &refs,
                        repo,
                        self.registry.clone(),
                        self.registry.clone(),
                        self.options.filter,
                    )
                    .await?;
            }
            (_, target) => {
                let target = target
                    .archive()
                    .ok_or_else(|| Error::Usage("unsupported destination".into()))?;
                info!(images = refs.len(), ?target, "exporting to archive");
                let exported = TarImageSet::new(self.image_set())
                    .export(&refs, self.registry.clone(), &target, self.options.filter)
                    .await?;
                report.exported = Some(exported);
            }
        }

        if let CopyDestination::Repository(repo) = destination {
            report.retagged = self.tag_results(&report.processed, repo).await?;
            report.annotated = self.annotate_lock_files(&report.processed, repo).await?;
            report.lock = Some(lock_output(
                root.as_ref(),
                images_lock,
                &report.processed,
            )?);
        }

        info!(
            processed = report.processed.len(),
            bundles = report.bundles.len(),
            retagged = report.retagged,
            annotated = report.annotated,
            denied = report.denied.errors.len(),
            "copy finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn resolve_source(&self, source: &CopySource) -> Result<Resolved> {
        match source {
            CopySource::Bundle(reference) => Ok(Resolved::Bundle {
                bundle: Arc::new(Bundle::new(reference.clone(), self.registry.clone())),
                tag: reference.tag().map(str::to_string),
            }),
            CopySource::Image(reference) => {
                let image = self.resolve_plain_image(reference).await?;
                let lock = ImagesLock::new(vec![ImageLockEntry {
                    image: image.digest_ref().to_string(),
                    annotations: Default::default(),
                }]);
                Ok(Resolved::Images {
                    refs: vec![image],
                    lock,
                })
            }
            CopySource::LockFile(path) => match LockFile::load(path)? {
                LockFile::Bundle(lock) => {
                    let reference = Reference::parse(&lock.spec.image.url)?;
                    debug!(bundle = %reference, lock = %path.display(), "copying bundle lock");
                    Ok(Resolved::Bundle {
                        bundle: Arc::new(Bundle::new(reference, self.registry.clone())),
                        tag: lock.spec.image.tag.clone(),
                    })
                }
                LockFile::Images(lock) => {
                    debug!(
                        images = lock.spec.images.len(),
                        lock = %path.display(),
                        "copying images lock"
                    );
                    Ok(Resolved::Images {
                        refs: lock.image_refs()?,
                        lock,
                    })
                }
            },
            CopySource::Tar(_) | CopySource::OciLayout(_) => source
                .archive()
                .map(Resolved::Archive)
                .ok_or_else(|| Error::Usage("unsupported source".into())),
        }
    }

    async fn resolve_plain_image(&self, reference: &Reference) -> Result<ImageRef> {
        let image = PlainImage::new(reference.clone(), self.registry.clone());
        let (digest_ref, is_bundle) =
            throttled(&self.throttle, &self.options.retry, "fetch image", || async {
                let digest_ref = image.digest_ref().await?;
                Ok::<_, Error>((digest_ref, image.is_bundle().await?))
            })
            .await?;
        if is_bundle {
            return Err(Error::ExpectedBundle {
                reference: reference.to_string(),
            });
        }

        let mut image_ref = ImageRef::from_reference(digest_ref)?
            .mark_bundle(false)
            .with_orig_ref(reference.to_string());
        if let Some(tag) = reference.tag() {
            image_ref = image_ref.with_tag(tag);
        }
        Ok(image_ref)
    }

    async fn expand_closure(
        &self,
        bundle: &Arc<Bundle>,
        tag: Option<String>,
        refs: &UnprocessedImageRefs,
        report: &mut CopyReport,
    ) -> Result<ImageRef> {
        let closure = bundle
            .all_images_lock_refs(&self.throttle, &self.options.retry)
            .await?;
        let mut root = closure.root.clone();
        if root.tag.is_none() {
            root.tag = tag;
        }
        refs.add(root.clone());
        refs.extend(closure.images.iter().cloned());
        report.bundles = closure.bundles.clone();
        Ok(root)
    }

    /// Make sure every processed image that arrived with a human tag carries
    /// it at the destination.  Returns how many tags were written.
    async fn tag_results(
        &self,
        processed: &ProcessedImages,
        destination: &Repository,
    ) -> Result<usize> {
        let listed = throttled(&self.throttle, &self.options.retry, "list tags", || async {
            Ok::<_, Error>(self.registry.list_tags(destination).await?)
        })
        .await;
        let existing: BTreeSet<String> = match listed {
            Ok(tags) => tags.into_iter().collect(),
            Err(e) if e.is_not_found() => BTreeSet::new(),
            Err(e) => return Err(e),
        };
        let existing = Arc::new(existing);

        let mut join_set = JoinSet::new();
        for image in processed.all() {
            let Some(tag) = image.unprocessed.tag.clone() else {
                continue;
            };
            let registry = self.registry.clone();
            let throttle = self.throttle.clone();
            let retry = self.options.retry.clone();
            let existing = existing.clone();
            let reference = destination.tag(&tag);
            join_set.spawn(async move {
                ensure_tag(registry, throttle, retry, reference, image, &existing).await
            });
        }

        let mut written = 0;
        let mut first_error = None;
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(Ok(true)) => written += 1,
                Ok(Ok(false)) => {}
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
        info!(written, %destination, "tags applied");
        Ok(written)
    }

    /// Write a locations record for every copied bundle so nested images
    /// resolve from the destination without the source registry.
    async fn annotate_lock_files(
        &self,
        processed: &ProcessedImages,
        destination: &Repository,
    ) -> Result<usize> {
        let all = processed.all();
        let by_digest: Arc<HashMap<Digest, ProcessedImage>> = Arc::new(
            all.iter()
                .map(|p| (p.digest().clone(), p.clone()))
                .collect(),
        );
        let mut bundles: Vec<Digest> = all
            .iter()
            .filter(|p| p.unprocessed.is_bundle() == Some(true))
            .map(|p| p.digest().clone())
            .collect();
        bundles.sort();
        bundles.dedup();

        let mut join_set = JoinSet::new();
        for digest in bundles.iter().cloned() {
            let registry = self.registry.clone();
            let throttle = self.throttle.clone();
            let retry = self.options.retry.clone();
            let destination = destination.clone();
            let by_digest = by_digest.clone();
            join_set.spawn(async move {
                note_copy(registry, throttle, retry, destination, digest, &by_digest).await
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
        if let Some(e) = first_error {
            return Err(e);
        }
        if !bundles.is_empty() {
            info!(bundles = bundles.len(), %destination, "wrote image locations");
        }
        Ok(bundles.len())
    }
}

async fn ensure_tag(
    registry: Arc<dyn Registry>,
    throttle: Throttle,
    retry: RetryPolicy,
    reference: Reference,
    image: ProcessedImage,
    existing: &BTreeSet<String>,
) -> Result<bool> {
    let tag = reference.tag().unwrap_or_default().to_string();
    if existing.contains(&tag) {
        let head = throttled(&throttle, &retry, "check tag", || async {
            Ok::<_, Error>(registry.head_manifest(&reference).await?)
        })
        .await?;
        if &head.digest == image.digest() {
            return Ok(false);
        }
        warn!(%reference, found = %head.digest, expected = %image.digest(), "moving tag");
    }

    let manifest = image.content.manifest();
    throttled(&throttle, &retry, "write tag", || async {
        Ok::<_, Error>(
            registry
                .put_manifest(&reference, &manifest.media_type, manifest.raw.clone())
                .await?,
        )
    })
    .await?;
    debug!(%reference, digest = %image.digest(), "tagged");
    Ok(true)
}

async fn note_copy(
    registry: Arc<dyn Registry>,
    throttle: Throttle,
    retry: RetryPolicy,
    destination: Repository,
    bundle_digest: Digest,
    by_digest: &HashMap<Digest, ProcessedImage>,
) -> Result<()> {
    let bundle = Bundle::new(destination.digest(&bundle_digest), registry.clone());
    let lock = throttled(&throttle, &retry, "read images lock", || bundle.images_lock()).await?;

    let mut images = Vec::with_capacity(lock.spec.images.len());
    for entry in &lock.spec.images {
        let digest = entry
            .reference()?
            .digest()
            .ok_or_else(|| Error::Lock(format!("'{}' has no digest", entry.image)))?;
        let moved = by_digest.get(&digest).ok_or_else(|| {
            Error::Lock(format!(
                "image '{}' of bundle {} was not part of the copy",
                entry.image, bundle_digest
            ))
        })?;
        images.push(ImageLocation {
            image: moved.digest_ref.clone(),
            is_bundle: moved.unprocessed.is_bundle().unwrap_or(false),
        });
    }

    let config = LocationsConfig::new(images);
    throttled(&throttle, &retry, "write image locations", || {
        write_locations(registry.as_ref(), &destination, &bundle_digest, &config)
    })
    .await?;
    Ok(())
}

/// The lock file describing the copy at its destination: a `BundleLock`
/// when a bundle was copied, otherwise an `ImagesLock`.
fn lock_output(
    root: Option<&ImageRef>,
    images_lock: Option<&ImagesLock>,
    processed: &ProcessedImages,
) -> Result<LockFile> {
    let root = root
        .cloned()
        .or_else(|| {
            processed
                .all()
                .into_iter()
                .map(|p| p.unprocessed)
                .find(ImageRef::is_root_bundle)
        });
    if let Some(root) = root {
        let moved = processed.find_by_digest(root.digest()).ok_or_else(|| {
            Error::Lock(format!("bundle '{}' was not part of the copy", root.digest_ref()))
        })?;
        return Ok(LockFile::Bundle(BundleLock::new(moved.digest_ref, root.tag)));
    }

    match images_lock {
        Some(lock) => Ok(LockFile::Images(lock.relocated(processed)?)),
        None => {
            let mut seen = BTreeSet::new();
            let images = processed
                .all()
                .into_iter()
                .filter(|p| seen.insert(p.digest_ref.clone()))
                .map(|p| ImageLockEntry {
                    image: p.digest_ref,
                    annotations: Default::default(),
                })
                .collect();
            Ok(LockFile::Images(ImagesLock::new(images)))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_flags_are_exclusive() {
        let err = CopySource::from_flags(Some("reg.io/b:1"), Some("reg.io/i:1"), None, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)), "{err}");

        let err = CopySource::from_flags(None, None, None, None, None).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));

        let src = CopySource::from_flags(None, None, Some(Path::new("lock.yml")), None, None)
            .unwrap();
        assert_eq!(src, CopySource::LockFile(PathBuf::from("lock.yml")));
    }

    #[test]
    fn destination_flags_are_exclusive() {
        let err = CopyDestination::from_flags(Some("reg.io/x"), Some(Path::new("a.tar")), None)
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));

        let dest = CopyDestination::from_flags(Some("reg.io/team/app"), None, None).unwrap();
        assert_eq!(
            dest,
            CopyDestination::Repository(Repository::parse("reg.io/team/app").unwrap())
        );
    }

    #[test]
    fn options_follow_settings() {
        let settings = Settings {
            concurrency: 2,
            include_non_distributable_layers: true,
            fetch_artifacts: false,
            ..Settings::default()
        };
        let options = CopyOptions::from_settings(&settings);
        assert_eq!(options.concurrency, 2);
        assert!(options.filter.include_non_distributable);
        assert!(!options.fetch_artifacts);
    }

    #[tokio::test]
    async fn archive_to_archive_is_rejected() {
        let orchestrator = CopyOrchestrator::new(
            Arc::new(imgbundle_oci::InMemoryRegistry::new()),
            Arc::new(crate::artifacts::NoopFinder),
            CopyOptions::default(),
        );
        let err = orchestrator
            .run(
                &CopySource::Tar(PathBuf::from("in.tar")),
                &CopyDestination::Tar(PathBuf::from("out.tar")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)), "{err}");
    }
}
