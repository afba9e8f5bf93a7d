use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use imgbundle_oci::{Digest, Reference, Registry, Repository};
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::{fetch_locations, Bundle, PlainImage};
use crate::error::{Error, Result};
use crate::image_ref::ImageRef;
use crate::retry::{throttled, RetryPolicy};
use crate::throttle::Throttle;

/// The full image closure of a bundle.
#[derive(Debug, Clone)]
pub struct BundleClosure {
    /// The bundle resolution started from.
    pub root: ImageRef,
    /// Every image and nested bundle reachable from the root, once each,
    /// sorted by digest reference.  The root itself is not included.
    pub images: Vec<ImageRef>,
    /// Every bundle encountered, root included, sorted by digest reference.
    pub bundles: Vec<ResolvedBundle>,
}

/// A bundle together with the images its own lock file lists.
#[derive(Debug, Clone)]
pub struct ResolvedBundle {
    pub image: ImageRef,
    /// Direct children in `images.yml` order.
    pub children: Vec<ImageRef>,
}

#[derive(Clone)]
struct Located {
    image: ImageRef,
    bundle: Option<Arc<Bundle>>,
}

struct Resolver {
    registry: Arc<dyn Registry>,
    throttle: Throttle,
    retry: RetryPolicy,
    /// Keyed by (bundle repository candidate, listed reference).
    located: Mutex<HashMap<(Reference, Reference), Arc<OnceCell<Located>>>>,
    /// Located bundle digest refs already walked.
    walked: Mutex<HashSet<String>>,
    images: Mutex<BTreeMap<Digest, ImageRef>>,
    /// Children per located bundle digest ref.
    bundles: Mutex<BTreeMap<String, ResolvedBundle>>,
}

type BoxedResult<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(super) async fn resolve(
    root: Arc<Bundle>,
    throttle: Throttle,
    retry: RetryPolicy,
) -> Result<Arc<BundleClosure>> {
    let reference = root.reference().clone();
    let (digest_ref, is_bundle) = throttled(&throttle, &retry, "fetch bundle", || async {
        let digest_ref = root.image().digest_ref().await?;
        Ok::<_, Error>((digest_ref, root.is_bundle().await?))
    })
    .await?;
    if !is_bundle {
        return Err(Error::NotABundle {
            reference: reference.to_string(),
        });
    }

    let mut root_ref = ImageRef::from_reference(digest_ref)?
        .mark_root_bundle()
        .with_orig_ref(reference.to_string());
    if let Some(tag) = reference.tag() {
        root_ref = root_ref.with_tag(tag);
    }
    info!(bundle = %root_ref.digest_ref(), "resolving bundle closure");

    let resolver = Arc::new(Resolver {
        registry: root.registry(),
        throttle,
        retry,
        located: Mutex::new(HashMap::new()),
        walked: Mutex::new(HashSet::from([root_ref.digest_ref().to_string()])),
        images: Mutex::new(BTreeMap::new()),
        bundles: Mutex::new(BTreeMap::new()),
    });

    resolver.clone().resolve_bundle(root, root_ref.clone()).await?;

    let mut chosen = std::mem::take(&mut *guard(&resolver.images));
    chosen.remove(root_ref.digest());
    let walked = std::mem::take(&mut *guard(&resolver.bundles));
    let mut bundles: Vec<ResolvedBundle> = walked
        .into_values()
        .filter_map(|mut rb| {
            if rb.image.digest() == root_ref.digest() {
                rb.image = root_ref.clone();
                return Some(rb);
            }
            let image = chosen.get(rb.image.digest())?;
            (image.digest_ref() == rb.image.digest_ref()).then(|| {
                rb.image = image.clone();
                rb
            })
        })
        .collect();
    bundles.sort_by(|a, b| a.image.cmp(&b.image));
    let mut images: Vec<ImageRef> = chosen.into_values().collect();
    images.sort();

    info!(
        bundle = %root_ref.digest_ref(),
        images = images.len(),
        bundles = bundles.len(),
        "resolved bundle closure"
    );
    Ok(Arc::new(BundleClosure {
        root: root_ref,
        images,
        bundles,
    }))
}

impl Resolver {
    /// Read `bundle`'s lock file and resolve each entry concurrently,
    /// recursing into nested bundles.  All children finish before the first
    /// error (if any) is returned.
    fn resolve_bundle(
        self: Arc<Self>,
        bundle: Arc<Bundle>,
        image: ImageRef,
    ) -> BoxedResult<'static, ()> {
        Box::pin(async move {
            let lock = throttled(&self.throttle, &self.retry, "read images lock", || {
                bundle.images_lock()
            })
            .await?;

            let repository = image.repository();
            let locations = throttled(&self.throttle, &self.retry, "read image locations", || {
                fetch_locations(self.registry.as_ref(), &repository, image.digest())
            })
            .await?;
            debug!(
                bundle = %image.digest_ref(),
                entries = lock.spec.images.len(),
                has_locations = locations.is_some(),
                "read bundle lock"
            );

            let mut join_set = JoinSet::new();
            for (position, entry) in lock.spec.images.iter().enumerate() {
                let reference = entry.reference()?;
                let digest = reference
                    .digest()
                    .ok_or_else(|| Error::Lock(format!("'{}' has no digest", entry.image)))?;
                let hint = locations
                    .as_ref()
                    .and_then(|l| l.find(&digest))
                    .map(|l| l.is_bundle);
                let this = self.clone();
                let repository = repository.clone();
                let orig_ref = entry.image.clone();
                join_set.spawn(async move {
                    let child = this
                        .resolve_child(reference, digest, orig_ref, repository, hint)
                        .await?;
                    Ok::<_, Error>((position, child))
                });
            }

            let mut children = Vec::with_capacity(lock.spec.images.len());
            let mut first_error = None;
            while let Some(res) = join_set.join_next().await {
                match res {
                    Ok(Ok(child)) => children.push(child),
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
            children.sort_by_key(|(position, _)| *position);

            guard(&self.bundles).insert(
                image.digest_ref().to_string(),
                ResolvedBundle {
                    image,
                    children: children.into_iter().map(|(_, c)| c).collect(),
                },
            );
            Ok(())
        })
    }

    /// Locate one lock entry and walk it if it is a bundle not walked yet.
    /// Sightings of the same digest in different repositories each get
    /// located; the smallest `(digest ref, orig ref)` is recorded so the
    /// outcome does not depend on task scheduling.
    async fn resolve_child(
        self: Arc<Self>,
        reference: Reference,
        digest: Digest,
        orig_ref: String,
        repository: Repository,
        hint: Option<bool>,
    ) -> Result<ImageRef> {
        let key = (repository.digest(&digest), reference.clone());
        let cell = guard(&self.located).entry(key).or_default().clone();
        let located = cell
            .get_or_try_init(|| self.locate(reference, &digest, &repository, hint))
            .await?
            .clone();

        let image = located.image.clone().with_orig_ref(orig_ref);
        {
            let mut images = guard(&self.images);
            let replace = images.get(&digest).map_or(true, |current| {
                (image.digest_ref(), image.orig_ref.as_deref())
                    < (current.digest_ref(), current.orig_ref.as_deref())
            });
            if replace {
                images.insert(digest.clone(), image.clone());
            }
        }

        if let Some(bundle) = located.bundle.clone() {
            let first_walk = guard(&self.walked).insert(image.digest_ref().to_string());
            if first_walk {
                self.clone().resolve_bundle(bundle, image).await?;
            }
        }
        Ok(located.image)
    }

    /// Find the image in the bundle's repository, falling back to where the
    /// lock file says it came from.  A locations record answers without
    /// fetching anything.
    async fn locate(
        &self,
        reference: Reference,
        digest: &Digest,
        repository: &Repository,
        hint: Option<bool>,
    ) -> Result<Located> {
        let in_bundle_repo = repository.digest(digest);
        if let Some(is_bundle) = hint {
            return Ok(Located {
                image: ImageRef::from_reference(in_bundle_repo.clone())?.mark_bundle(is_bundle),
                bundle: is_bundle
                    .then(|| Arc::new(Bundle::new(in_bundle_repo, self.registry.clone()))),
            });
        }

        let mut candidates = vec![in_bundle_repo];
        if reference != candidates[0] {
            candidates.push(reference);
        }

        let mut last_error = None;
        for candidate in candidates {
            let image = PlainImage::new(candidate.clone(), self.registry.clone());
            match throttled(&self.throttle, &self.retry, "fetch image", || image.is_bundle()).await
            {
                Ok(is_bundle) => {
                    debug!(image = %candidate, is_bundle, "located image");
                    return Ok(Located {
                        image: ImageRef::from_reference(candidate)?.mark_bundle(is_bundle),
                        bundle: is_bundle.then(|| Arc::new(Bundle::from_image(image))),
                    });
                }
                Err(e) if e.is_not_found() => {
                    debug!(image = %candidate, "not found, trying next location");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::Oci(imgbundle_oci::OciError::NotFound(digest.to_string()))
        }))
    }
}
