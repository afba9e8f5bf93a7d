//! Export to an archive, import into a registry that never saw the source.
//!
//! - Tarballs and OCI layout directories both round-trip digests and tags
//! - The written tar does not depend on the concurrency setting
//! - Truncated archives fail without being retried
//! - Non-distributable layers stay out of the archive by default

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{options, push_bundle, push_image, push_image_with_foreign_layer, repo};
use imgbundle::archive::tar::TarArchive;
use imgbundle::artifacts::NoopFinder;
use imgbundle::bundle::Bundle;
use imgbundle::copy::{CopyDestination, CopyOrchestrator, CopyReport, CopySource};
use imgbundle::lock::LockFile;
use imgbundle::{Error, Throttle};
use imgbundle_oci::layout::blob_entry_path;
use imgbundle_oci::{InMemoryRegistry, Reference, Registry};

fn orchestrator(reg: Arc<InMemoryRegistry>, concurrency: usize) -> CopyOrchestrator {
    CopyOrchestrator::new(reg, Arc::new(NoopFinder), options(concurrency))
}

/// Bundle `registry.local/bundles/app:v1` listing two images.
async fn seed_bundle(reg: &InMemoryRegistry) -> (Reference, Vec<Reference>) {
    let web = push_image(reg, "registry.local/images/web", "v1", "web").await;
    let db = push_image(reg, "registry.local/images/db", "v2", "db").await;
    let bundle = push_bundle(reg, "registry.local/bundles/app", "v1", &[&web, &db]).await;
    (bundle, vec![web, db])
}

async fn export(reg: Arc<InMemoryRegistry>, concurrency: usize, target: CopyDestination) {
    let report = orchestrator(reg, concurrency)
        .run(&CopySource::Bundle(repo("registry.local/bundles/app").tag("v1")), &target)
        .await
        .unwrap();
    assert_eq!(report.exported.as_ref().map(|e| e.len()), Some(3));
    assert!(report.processed.is_empty());
    assert!(report.lock.is_none());
}

async fn import(source: CopySource, dest: &str) -> (Arc<InMemoryRegistry>, CopyReport) {
    let fresh = Arc::new(InMemoryRegistry::new());
    let report = orchestrator(fresh.clone(), 2)
        .run(&source, &CopyDestination::Repository(repo(dest)))
        .await
        .unwrap();
    (fresh, report)
}

async fn assert_bundle_landed(
    reg: Arc<InMemoryRegistry>,
    report: &CopyReport,
    dest: &str,
    bundle: &Reference,
    images: &[Reference],
) {
    let dest = repo(dest);
    let bundle_digest = bundle.digest().unwrap();
    assert_eq!(report.processed.len(), 3);
    for image in images.iter().chain([bundle]) {
        let digest = image.digest().unwrap();
        let head = reg.head_manifest(&dest.digest(&digest)).await.unwrap();
        assert_eq!(head.digest, digest);
    }
    let tagged = reg.head_manifest(&dest.tag("v1")).await.unwrap();
    assert_eq!(tagged.digest, bundle_digest);

    match report.lock.as_ref().unwrap() {
        LockFile::Bundle(lock) => {
            assert_eq!(lock.spec.image.url, dest.digest(&bundle_digest).to_string());
            assert_eq!(lock.spec.image.tag.as_deref(), Some("v1"));
        }
        other => panic!("expected a bundle lock, got {other:?}"),
    }
    assert_eq!(report.annotated, 1);

    // The copied bundle resolves entirely from the destination.
    let closure = Arc::new(Bundle::new(dest.digest(&bundle_digest), reg.clone()))
        .all_images_lock_refs(&Throttle::new(2), &common::fast_retry())
        .await
        .unwrap();
    assert_eq!(closure.images.len(), 2);
    for image in &closure.images {
        assert_eq!(image.repository(), dest, "{}", image.digest_ref());
    }
}

// =============================================================================
// TARBALL
// =============================================================================

#[tokio::test]
async fn bundle_round_trips_through_a_tarball() {
    let source = Arc::new(InMemoryRegistry::new());
    let (bundle, images) = seed_bundle(source.as_ref()).await;
    let dir = tempfile::tempdir().unwrap();
    let tar = dir.path().join("bundle.tar");

    export(source, 3, CopyDestination::Tar(tar.clone())).await;
    assert!(tar.is_file());

    let (fresh, report) = import(CopySource::Tar(tar), "registry.local/mirror/app").await;
    assert_bundle_landed(fresh, &report, "registry.local/mirror/app", &bundle, &images).await;
}

#[tokio::test]
async fn tar_bytes_do_not_depend_on_concurrency() {
    let source = Arc::new(InMemoryRegistry::new());
    seed_bundle(source.as_ref()).await;
    let dir = tempfile::tempdir().unwrap();
    let sequential = dir.path().join("one.tar");
    let parallel = dir.path().join("four.tar");

    export(source.clone(), 1, CopyDestination::Tar(sequential.clone())).await;
    export(source, 4, CopyDestination::Tar(parallel.clone())).await;

    let a = std::fs::read(&sequential).unwrap();
    let b = std::fs::read(&parallel).unwrap();
    assert_eq!(a.len(), b.len());
    assert!(a == b, "archives differ");
}

// =============================================================================
// OCI LAYOUT DIRECTORY
// =============================================================================

#[tokio::test]
async fn bundle_round_trips_through_a_layout_directory() {
    let source = Arc::new(InMemoryRegistry::new());
    let (bundle, images) = seed_bundle(source.as_ref()).await;
    let dir = tempfile::tempdir().unwrap();
    let layout = dir.path().join("layout");

    export(source, 2, CopyDestination::OciLayout(layout.clone())).await;
    assert!(layout.join("oci-layout").is_file());
    assert!(layout.join("index.json").is_file());
    let digest = bundle.digest().unwrap();
    assert!(layout.join(blob_entry_path(&digest)).is_file());

    let (fresh, report) = import(CopySource::OciLayout(layout), "registry.local/mirror/app").await;
    assert_bundle_landed(fresh, &report, "registry.local/mirror/app", &bundle, &images).await;
}

// =============================================================================
// DAMAGED ARCHIVES
// =============================================================================

fn truncate(path: &Path) {
    let bytes = std::fs::read(path).unwrap();
    std::fs::write(path, &bytes[..bytes.len() / 2]).unwrap();
}

#[tokio::test]
async fn truncated_tarball_is_rejected_without_retry() {
    let source = Arc::new(InMemoryRegistry::new());
    seed_bundle(source.as_ref()).await;
    let dir = tempfile::tempdir().unwrap();
    let tar = dir.path().join("bundle.tar");
    export(source, 2, CopyDestination::Tar(tar.clone())).await;
    truncate(&tar);

    let fresh = Arc::new(InMemoryRegistry::new());
    let err = orchestrator(fresh, 2)
        .run(
            &CopySource::Tar(tar),
            &CopyDestination::Repository(repo("registry.local/mirror/app")),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(
            err.root(),
            Error::ArchiveCorrupt(_) | Error::ArchiveEntryMissing { .. }
        ),
        "{err}"
    );
    assert!(!err.is_retryable());
}

// =============================================================================
// NON-DISTRIBUTABLE LAYERS
// =============================================================================

#[tokio::test]
async fn foreign_layers_are_left_out_of_the_tarball() {
    let source = Arc::new(InMemoryRegistry::new());
    let (image, foreign) =
        push_image_with_foreign_layer(source.as_ref(), "registry.local/images/win", "ltsc").await;
    let dir = tempfile::tempdir().unwrap();
    let tar = dir.path().join("win.tar");

    orchestrator(source.clone(), 2)
        .run(&CopySource::Image(image.clone()), &CopyDestination::Tar(tar.clone()))
        .await
        .unwrap();

    let archive = TarArchive::open(&tar).await.unwrap();
    assert!(!archive.contains(&blob_entry_path(&foreign)));
    assert!(archive.contains(&blob_entry_path(&image.digest().unwrap())));

    // The import still lands the manifest without the missing layer.
    let (fresh, report) = import(CopySource::Tar(tar), "registry.local/mirror/win").await;
    assert_eq!(report.processed.len(), 1);
    let dest = repo("registry.local/mirror/win");
    assert!(fresh.get_manifest(&dest.digest(&image.digest().unwrap())).await.is_ok());
    assert!(!fresh.has_blob(&dest, &foreign).await.unwrap());
}
