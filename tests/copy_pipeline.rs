//! The whole copy pipeline, registry to registry.
//!
//! - A bundle and its images land under the destination with their digests
//! - One concurrency limit covers every stage of a copy
//! - Copied bundles get a locations record and can be copied again
//! - Lock files come out pointing at the destination
//! - Companion artifacts travel with their images unless disabled
//! - Denied artifacts and transient failures do not abort the copy

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use common::{fast_retry, options, push_artifact, push_bundle, push_image, repo, FaultyRegistry};
use imgbundle::artifacts::{artifact_tag, ArtifactKind, NoopFinder, RegistryFinder};
use imgbundle::bundle::{fetch_locations, locations_tag};
use imgbundle::copy::{CopyDestination, CopyOptions, CopyOrchestrator, CopyReport, CopySource};
use imgbundle::lock::{ImageLockEntry, ImagesLock, LockFile};
use imgbundle_oci::{InMemoryRegistry, Reference, Registry};

fn to_repo(name: &str) -> CopyDestination {
    CopyDestination::Repository(repo(name))
}

fn with_registry_finder(reg: Arc<dyn Registry>, options: CopyOptions) -> CopyOrchestrator {
    CopyOrchestrator::new(reg.clone(), Arc::new(RegistryFinder::new(reg, fast_retry())), options)
}

fn source_refs(report: &CopyReport) -> BTreeSet<String> {
    report
        .processed
        .all()
        .iter()
        .map(|p| p.unprocessed.digest_ref().to_string())
        .collect()
}

// =============================================================================
// BUNDLE COPY
// =============================================================================

#[tokio::test]
async fn bundle_and_images_land_under_destination_with_same_digests() {
    let reg = Arc::new(InMemoryRegistry::new());
    let img1 = push_image(reg.as_ref(), "registry.local/team/img1", "v1", "img1").await;
    let img2 = push_image(reg.as_ref(), "registry.local/other/img2", "v1", "img2").await;
    let bundle = push_bundle(reg.as_ref(), "registry.local/repo/app", "v1", &[&img1, &img2]).await;
    let dest = repo("registry.local/dest/repo");

    let report = CopyOrchestrator::new(reg.clone(), Arc::new(NoopFinder), options(1))
        .run(&CopySource::Bundle(bundle.clone()), &to_repo("registry.local/dest/repo"))
        .await
        .unwrap();

    assert_eq!(report.processed.len(), 3);
    let expected: BTreeSet<String> =
        [&bundle, &img1, &img2].iter().map(|r| r.to_string()).collect();
    assert_eq!(source_refs(&report), expected);
    for processed in report.processed.all() {
        assert_eq!(
            processed.digest_ref,
            dest.digest(processed.digest()).to_string()
        );
    }
    assert_eq!(report.bundles.len(), 1);
    assert!(!report.denied.has_errors());
}

#[tokio::test]
async fn bundle_lock_output_points_at_destination() {
    let reg = Arc::new(InMemoryRegistry::new());
    let img = push_image(reg.as_ref(), "registry.local/team/img", "v1", "img").await;
    push_bundle(reg.as_ref(), "registry.local/repo/app", "1.0.0", &[&img]).await;
    let dest = repo("registry.local/dest/app");

    let report = CopyOrchestrator::new(reg.clone(), Arc::new(NoopFinder), options(2))
        .run(
            &CopySource::Bundle(repo("registry.local/repo/app").tag("1.0.0")),
            &to_repo("registry.local/dest/app"),
        )
        .await
        .unwrap();

    let LockFile::Bundle(lock) = report.lock.unwrap() else {
        panic!("expected a bundle lock");
    };
    let digest = reg
        .head_manifest(&repo("registry.local/repo/app").tag("1.0.0"))
        .await
        .unwrap()
        .digest;
    assert_eq!(lock.spec.image.url, dest.digest(&digest).to_string());
    assert_eq!(lock.spec.image.tag.as_deref(), Some("1.0.0"));
    assert_eq!(
        reg.head_manifest(&dest.tag("1.0.0")).await.unwrap().digest,
        digest
    );
}

// =============================================================================
// LOCATIONS
// =============================================================================

#[tokio::test]
async fn copied_bundle_records_locations_and_copies_again() {
    let reg = Arc::new(InMemoryRegistry::new());
    let img = push_image(reg.as_ref(), "registry.local/team/img", "v1", "img").await;
    let inner = push_bundle(reg.as_ref(), "registry.local/repo/inner", "v1", &[&img]).await;
    let outer = push_bundle(reg.as_ref(), "registry.local/repo/outer", "v1", &[&inner]).await;
    let first = repo("registry.local/dest1/app");

    let report = CopyOrchestrator::new(reg.clone(), Arc::new(NoopFinder), options(2))
        .run(&CopySource::Bundle(outer.clone()), &to_repo("registry.local/dest1/app"))
        .await
        .unwrap();
    assert_eq!(report.annotated, 2);

    let outer_digest = outer.digest().unwrap();
    let tags = reg.list_tags(&first).await.unwrap();
    assert!(tags.contains(&locations_tag(&outer_digest)), "{tags:?}");

    let locations = fetch_locations(reg.as_ref(), &first, &outer_digest)
        .await
        .unwrap()
        .expect("locations record");
    let inner_digest = inner.digest().unwrap();
    let entry = locations.find(&inner_digest).unwrap();
    assert_eq!(entry.image, first.digest(&inner_digest).to_string());
    assert!(entry.is_bundle);

    let inner_locations = fetch_locations(reg.as_ref(), &first, &inner_digest)
        .await
        .unwrap()
        .expect("nested locations record");
    let img_digest = img.digest().unwrap();
    assert!(!inner_locations.find(&img_digest).unwrap().is_bundle);

    // Copy the relocated bundle onward.
    let second = repo("registry.local/dest2/app");
    let report = CopyOrchestrator::new(reg.clone(), Arc::new(NoopFinder), options(2))
        .run(
            &CopySource::Bundle(first.digest(&outer_digest)),
            &to_repo("registry.local/dest2/app"),
        )
        .await
        .unwrap();
    assert_eq!(report.processed.len(), 3);
    for digest in [&outer_digest, &inner_digest, &img_digest] {
        assert!(reg.get_manifest(&second.digest(digest)).await.is_ok());
    }
    assert!(fetch_locations(reg.as_ref(), &second, &outer_digest)
        .await
        .unwrap()
        .is_some());
}

// =============================================================================
// LOCK FILES
// =============================================================================

#[tokio::test]
async fn images_lock_source_is_relocated_with_annotations() {
    let reg = Arc::new(InMemoryRegistry::new());
    let web = push_image(reg.as_ref(), "registry.local/team/web", "v1", "web").await;
    let db = push_image(reg.as_ref(), "registry.local/team/db", "v1", "db").await;
    let lock = ImagesLock::new(vec![
        ImageLockEntry {
            image: web.to_string(),
            annotations: BTreeMap::from([("kbld.carvel.dev/id".into(), "web".into())]),
        },
        ImageLockEntry {
            image: db.to_string(),
            annotations: BTreeMap::new(),
        },
    ]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("images.yml");
    lock.write(&path).unwrap();
    let dest = repo("registry.local/dest/images");

    let report = CopyOrchestrator::new(reg.clone(), Arc::new(NoopFinder), options(2))
        .run(&CopySource::LockFile(path), &to_repo("registry.local/dest/images"))
        .await
        .unwrap();

    assert_eq!(report.processed.len(), 2);
    assert!(report.bundles.is_empty());
    let LockFile::Images(relocated) = report.lock.unwrap() else {
        panic!("expected an images lock");
    };
    let images: Vec<&str> = relocated.spec.images.iter().map(|e| e.image.as_str()).collect();
    assert_eq!(
        images,
        vec![
            dest.digest(&web.digest().unwrap()).to_string(),
            dest.digest(&db.digest().unwrap()).to_string(),
        ]
    );
    assert_eq!(
        relocated.spec.images[0].annotations.get("kbld.carvel.dev/id").map(String::as_str),
        Some("web")
    );

    // The written lock can be read back and copied from.
    let out = dir.path().join("relocated.yml");
    LockFile::Images(relocated).write(&out).unwrap();
    assert!(matches!(LockFile::load(&out).unwrap(), LockFile::Images(_)));
}

// =============================================================================
// ARTIFACTS
// =============================================================================

#[tokio::test]
async fn artifacts_travel_under_their_derived_tags() {
    let reg = Arc::new(InMemoryRegistry::new());
    let img = push_image(reg.as_ref(), "registry.local/team/img", "v1", "img").await;
    let sig = push_artifact(reg.as_ref(), &img, ArtifactKind::Signature, "sig").await;
    let bundle = push_bundle(reg.as_ref(), "registry.local/repo/app", "v1", &[&img]).await;
    let bundle_sig = push_artifact(reg.as_ref(), &bundle, ArtifactKind::Signature, "b-sig").await;
    let dest = repo("registry.local/dest/app");

    let report = with_registry_finder(reg.clone(), options(2))
        .run(&CopySource::Bundle(bundle.clone()), &to_repo("registry.local/dest/app"))
        .await
        .unwrap();
    assert_eq!(report.processed.len(), 4);

    for (subject, artifact) in [(&img, &sig), (&bundle, &bundle_sig)] {
        let tag = artifact_tag(&subject.digest().unwrap(), ArtifactKind::Signature);
        let head = reg.head_manifest(&dest.tag(&tag)).await.unwrap();
        assert_eq!(head.digest, artifact.digest().unwrap());
    }
}

#[tokio::test]
async fn disabled_artifact_lookup_copies_images_only() {
    let reg = Arc::new(InMemoryRegistry::new());
    let img = push_image(reg.as_ref(), "registry.local/team/img", "v1", "img").await;
    push_artifact(reg.as_ref(), &img, ArtifactKind::Signature, "sig").await;
    let dest = repo("registry.local/dest/img");

    let report = with_registry_finder(
        reg.clone(),
        CopyOptions {
            fetch_artifacts: false,
            ..options(2)
        },
    )
    .run(&CopySource::Image(img.clone()), &to_repo("registry.local/dest/img"))
    .await
    .unwrap();

    assert_eq!(report.processed.len(), 1);
    let tag = artifact_tag(&img.digest().unwrap(), ArtifactKind::Signature);
    let err = reg.head_manifest(&dest.tag(&tag)).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn denied_artifacts_are_reported_not_fatal() {
    let inner = Arc::new(InMemoryRegistry::new());
    let open = push_image(inner.as_ref(), "registry.local/team/open", "v1", "open").await;
    let locked = push_image(inner.as_ref(), "registry.local/team/locked", "v1", "locked").await;
    push_artifact(inner.as_ref(), &open, ArtifactKind::Signature, "open-sig").await;
    let bundle =
        push_bundle(inner.as_ref(), "registry.local/repo/app", "v1", &[&open, &locked]).await;
    let denied = artifact_tag(&locked.digest().unwrap(), ArtifactKind::Sbom);
    let reg = Arc::new(FaultyRegistry::new(inner.clone()).deny_tag(denied.clone()));

    let report = with_registry_finder(reg, options(2))
        .run(&CopySource::Bundle(bundle), &to_repo("registry.local/dest/app"))
        .await
        .unwrap();

    assert_eq!(report.denied.errors.len(), 1, "{}", report.denied);
    assert!(report.denied.refs()[0].ends_with(&denied));
    // bundle + two images + one signature
    assert_eq!(report.processed.len(), 4);
}

// =============================================================================
// DENIED SOURCES
// =============================================================================

async fn assert_nothing_written(inner: &InMemoryRegistry, writes_before: usize, dest: &str) {
    assert_eq!(inner.manifest_writes(), writes_before);
    let err = inner.list_tags(&repo(dest)).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn denied_bundle_aborts_the_copy() {
    let inner = Arc::new(InMemoryRegistry::new());
    let img = push_image(inner.as_ref(), "registry.local/team/img", "v1", "img").await;
    push_bundle(inner.as_ref(), "registry.local/repo/app", "release", &[&img]).await;
    let writes = inner.manifest_writes();
    let reg = Arc::new(FaultyRegistry::new(inner.clone()).deny_tag("release"));

    let err = with_registry_finder(reg, options(2))
        .run(
            &CopySource::Bundle(repo("registry.local/repo/app").tag("release")),
            &to_repo("registry.local/dest/app"),
        )
        .await
        .unwrap_err();

    assert!(err.is_access_denied(), "{err}");
    assert!(!err.is_retryable());
    assert_nothing_written(&inner, writes, "registry.local/dest/app").await;
}

#[tokio::test]
async fn denied_image_aborts_the_copy() {
    let inner = Arc::new(InMemoryRegistry::new());
    push_image(inner.as_ref(), "registry.local/team/img", "locked", "img").await;
    let writes = inner.manifest_writes();
    let reg = Arc::new(FaultyRegistry::new(inner.clone()).deny_tag("locked"));

    let err = with_registry_finder(reg, options(2))
        .run(
            &CopySource::Image(repo("registry.local/team/img").tag("locked")),
            &to_repo("registry.local/dest/img"),
        )
        .await
        .unwrap_err();

    assert!(err.is_access_denied(), "{err}");
    assert_nothing_written(&inner, writes, "registry.local/dest/img").await;
}

// =============================================================================
// CONCURRENCY AND RETRIES
// =============================================================================

async fn wide_bundle(reg: &InMemoryRegistry, width: usize) -> Reference {
    let mut images = Vec::with_capacity(width);
    for i in 0..width {
        let seed = format!("wide-{i}");
        images.push(push_image(reg, "registry.local/team/wide", &seed, &seed).await);
    }
    let listed: Vec<&Reference> = images.iter().collect();
    push_bundle(reg, "registry.local/repo/wide", "v1", &listed).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn whole_copy_stays_within_concurrency() {
    let inner = Arc::new(InMemoryRegistry::new());
    let bundle = wide_bundle(inner.as_ref(), 10).await;
    let faulty = Arc::new(FaultyRegistry::new(inner).with_delay(Duration::from_millis(2)));

    let orchestrator = with_registry_finder(faulty.clone(), options(2));
    let report = orchestrator
        .run(&CopySource::Bundle(bundle), &to_repo("registry.local/dest/wide"))
        .await
        .unwrap();

    assert_eq!(report.processed.len(), 11);
    let throttle = orchestrator.throttle();
    assert!(throttle.peak() <= 2, "throttle peak {}", throttle.peak());
    assert!(faulty.peak() <= 2, "registry peak {}", faulty.peak());
    assert_eq!(throttle.in_flight(), 0);
}

#[tokio::test]
async fn transient_failures_do_not_abort_the_copy() {
    let inner = Arc::new(InMemoryRegistry::new());
    let bundle = wide_bundle(inner.as_ref(), 3).await;
    let flaky = Arc::new(FaultyRegistry::new(inner.clone()).fail_next(3));

    let report = with_registry_finder(flaky, options(1))
        .run(&CopySource::Bundle(bundle.clone()), &to_repo("registry.local/dest/wide"))
        .await
        .unwrap();

    assert_eq!(report.processed.len(), 4);
    let dest = repo("registry.local/dest/wide");
    assert!(inner.get_manifest(&dest.digest(&bundle.digest().unwrap())).await.is_ok());
}
