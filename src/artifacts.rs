//! Signature, SBOM and attestation images stored next to their subject
//! under digest-derived tags (`sha256-<hex>.sig` and friends).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use imgbundle_oci::{Digest, ManifestHead, Registry};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image_ref::ImageRef;
use crate::retry::{throttled, RetryPolicy};
use crate::throttle::Throttle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    Signature,
    Sbom,
    Attestation,
}

impl ArtifactKind {
    pub fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Signature => "sig",
            ArtifactKind::Sbom => "sbom",
            ArtifactKind::Attestation => "att",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// `<alg>-<hex>.<suffix>` for the subject digest.
pub fn artifact_tag(subject: &Digest, kind: ArtifactKind) -> String {
    format!("{}-{}.{}", subject.algorithm(), subject.hex(), kind.suffix())
}

/// Looks up the artifact of each kind for a subject image.
///
/// Returns [`Error::ArtifactNotFound`] when the tag does not exist and
/// [`Error::AccessDenied`] when the registry refuses the lookup.
#[async_trait]
pub trait Finder: Send + Sync {
    async fn find(&self, subject: &ImageRef, kind: ArtifactKind) -> Result<ImageRef>;

    async fn signature(&self, subject: &ImageRef) -> Result<ImageRef> {
        self.find(subject, ArtifactKind::Signature).await
    }

    async fn sbom(&self, subject: &ImageRef) -> Result<ImageRef> {
        self.find(subject, ArtifactKind::Sbom).await
    }

    async fn attestation(&self, subject: &ImageRef) -> Result<ImageRef> {
        self.find(subject, ArtifactKind::Attestation).await
    }

    /// [`Finder::find`] under `throttle`.  The default holds one slot for
    /// the whole lookup.
    async fn find_throttled(
        &self,
        subject: &ImageRef,
        kind: ArtifactKind,
        throttle: &Throttle,
    ) -> Result<ImageRef> {
        let _slot = throttle.take().await?;
        self.find(subject, kind).await
    }
}

/// Resolves artifact tags with `HEAD` requests against the subject's
/// repository.
pub struct RegistryFinder {
    registry: Arc<dyn Registry>,
    retry: RetryPolicy,
}

impl RegistryFinder {
    pub fn new(registry: Arc<dyn Registry>, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }
}

impl RegistryFinder {
    fn classify(
        subject: &ImageRef,
        kind: ArtifactKind,
        head: Result<ManifestHead>,
    ) -> Result<ImageRef> {
        let repository = subject.repository();
        let tag = artifact_tag(subject.digest(), kind);
        let tagged = repository.tag(&tag);
        match head {
            Ok(head) => {
                debug!(
                    subject = %subject.digest_ref(),
                    %kind,
                    digest = %head.digest,
                    "found artifact"
                );
                Ok(ImageRef::at(&repository, &head.digest)
                    .with_tag(tag)
                    .with_orig_ref(tagged.to_string()))
            }
            Err(e) if e.is_not_found() => Err(Error::ArtifactNotFound {
                image_ref: tagged.to_string(),
            }),
            Err(e) if e.is_access_denied() => Err(Error::AccessDenied {
                image_ref: tagged.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Finder for RegistryFinder {
    async fn find(&self, subject: &ImageRef, kind: ArtifactKind) -> Result<ImageRef> {
        let tagged = subject.repository().tag(&artifact_tag(subject.digest(), kind));
        let head = self
            .retry
            .run("probe artifact", || async {
                Ok::<_, Error>(self.registry.head_manifest(&tagged).await?)
            })
            .await;
        Self::classify(subject, kind, head)
    }

    /// Takes a slot per attempt so backoff sleeps do not hold one.
    async fn find_throttled(
        &self,
        subject: &ImageRef,
        kind: ArtifactKind,
        throttle: &Throttle,
    ) -> Result<ImageRef> {
        let tagged = subject.repository().tag(&artifact_tag(subject.digest(), kind));
        let head = throttled(throttle, &self.retry, "probe artifact", || async {
            Ok::<_, Error>(self.registry.head_manifest(&tagged).await?)
        })
        .await;
        Self::classify(subject, kind, head)
    }
}

/// Finds nothing; used when artifact copying is disabled.
pub struct NoopFinder;

#[async_trait]
impl Finder for NoopFinder {
    async fn find(&self, subject: &ImageRef, kind: ArtifactKind) -> Result<ImageRef> {
        Err(Error::ArtifactNotFound {
            image_ref: format!(
                "{}:{}",
                subject.repository(),
                artifact_tag(subject.digest(), kind)
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Batch fetch
// ---------------------------------------------------------------------------

/// Access-denied lookups collected over a whole batch.
#[derive(Debug, Default)]
pub struct FetchError {
    pub errors: Vec<Error>,
}

impl FetchError {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The references whose lookup was denied.
    pub fn refs(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|e| match e {
                Error::AccessDenied { image_ref } => image_ref.clone(),
                other => other.to_string(),
            })
            .collect()
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} artifact lookup(s) were denied: {}",
            self.errors.len(),
            self.refs().join(", ")
        )
    }
}

impl std::error::Error for FetchError {}

/// What a batch lookup produced.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Found artifacts, deduplicated and sorted.
    pub artifacts: Vec<ImageRef>,
    /// Lookups that were denied; callers proceed with what was found.
    pub denied: FetchError,
}

pub struct Artifacts {
    finder: Arc<dyn Finder>,
    throttle: Throttle,
}

enum Probe {
    Found(ImageRef, ArtifactKind),
    Missing,
    Denied(Error),
}

impl Artifacts {
    pub fn new(finder: Arc<dyn Finder>, throttle: Throttle) -> Self {
        Self { finder, throttle }
    }

    /// Probe every image for its SBOM, attestation and signature, then probe
    /// each SBOM and attestation found for its own signature.
    ///
    /// Not-found lookups are dropped, access-denied lookups are collected
    /// into [`FetchOutcome::denied`], and any other failure is returned
    /// after every in-flight probe has finished.
    pub async fn fetch_for_image_refs(&self, images: &[ImageRef]) -> Result<FetchOutcome> {
        info!(images = images.len(), "looking up signatures, SBOMs and attestations");

        let subjects = images.iter().flat_map(|image| {
            [
                ArtifactKind::Sbom,
                ArtifactKind::Attestation,
                ArtifactKind::Signature,
            ]
            .into_iter()
            .map(move |kind| (image.clone(), kind))
        });
        let first = self.probe_all(subjects.collect()).await?;

        let mut found = BTreeSet::new();
        let mut denied = Vec::new();
        let mut second_round = Vec::new();
        for probe in first {
            match probe {
                Probe::Found(artifact, kind) => {
                    if kind != ArtifactKind::Signature {
                        second_round.push((artifact.clone(), ArtifactKind::Signature));
                    }
                    found.insert(artifact);
                }
                Probe::Denied(e) => denied.push(e),
                Probe::Missing => {}
            }
        }

        for probe in self.probe_all(second_round).await? {
            match probe {
                Probe::Found(artifact, _) => {
                    found.insert(artifact);
                }
                Probe::Denied(e) => denied.push(e),
                Probe::Missing => {}
            }
        }

        let outcome = FetchOutcome {
            artifacts: found.into_iter().collect(),
            denied: FetchError { errors: denied },
        };
        if outcome.denied.has_errors() {
            warn!(error = %outcome.denied, "some artifact lookups were denied");
        }
        info!(artifacts = outcome.artifacts.len(), "artifact lookup finished");
        Ok(outcome)
    }

    async fn probe_all(&self, work: Vec<(ImageRef, ArtifactKind)>) -> Result<Vec<Probe>> {
        let mut join_set = JoinSet::new();
        for (position, (subject, kind)) in work.into_iter().enumerate() {
            let finder = self.finder.clone();
            let throttle = self.throttle.clone();
            join_set.spawn(async move {
                let probe = match finder.find_throttled(&subject, kind, &throttle).await {
                    Ok(artifact) => Probe::Found(artifact, kind),
                    Err(Error::ArtifactNotFound { .. }) => Probe::Missing,
                    Err(e @ Error::AccessDenied { .. }) => Probe::Denied(e),
                    Err(e) => return Err(e),
                };
                Ok::<_, Error>((position, probe))
            });
        }

        let mut probes = Vec::new();
        let mut first_error = None;
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(Ok(probe)) => probes.push(probe),
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
        probes.sort_by_key(|(position, _)| *position);
        Ok(probes.into_iter().map(|(_, p)| p).collect())
    }
}
