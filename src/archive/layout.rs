//! OCI image layouts unpacked into a directory.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use imgbundle_oci::layout::{blob_entry_path, OCI_LAYOUT_FILE};
use imgbundle_oci::manifest::ImageIndex;
use imgbundle_oci::{Digest, OciError, OciLayoutDir};
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::{BlobStore, LayoutPlan, PlannedBlob};
use crate::descriptor::LayerProvider;
use crate::error::{Error, Result};
use crate::retry::{throttled, RetryPolicy};
use crate::throttle::Throttle;

/// Write `plan` into `dir`. Blobs already present are left alone;
/// `index.json` is written after every blob has landed.
pub async fn write_layout_dir(
    dir: &Path,
    plan: &LayoutPlan,
    provider: Arc<dyn LayerProvider>,
    throttle: &Throttle,
    retry: &RetryPolicy,
) -> Result<()> {
    let layout = Arc::new(OciLayoutDir::new(dir));
    info!(dir = %dir.display(), blobs = plan.blobs.len(), "writing OCI layout directory");

    let mut join_set = JoinSet::new();
    for blob in plan.blobs.iter().cloned() {
        if layout.has_blob(blob.digest()) {
            debug!(digest = %blob.digest(), "blob already in layout");
            continue;
        }
        let layout = layout.clone();
        let provider = provider.clone();
        let throttle = throttle.clone();
        let retry = retry.clone();
        join_set.spawn(async move {
            let data = match &blob {
                PlannedBlob::Bytes { data, .. } => data.clone(),
                PlannedBlob::Layer(layer) => {
                    throttled(&throttle, &retry, "read layer", || provider.contents(layer)).await?
                }
            };
            let _slot = throttle.take().await?;
            layout.store_blob(blob.digest(), &data).await?;
            Ok::<_, Error>(())
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

    layout.write_index(&plan.index).await?;
    Ok(())
}

/// Reads blobs out of a layout directory.
pub struct LayoutDirStore {
    layout: OciLayoutDir,
}

impl LayoutDirStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            layout: OciLayoutDir::new(dir),
        }
    }
}

#[async_trait]
impl BlobStore for LayoutDirStore {
    async fn index(&self) -> Result<ImageIndex> {
        match self.layout.read_index().await {
            Ok(index) => Ok(index),
            Err(OciError::NotFound(_)) => Err(Error::ArchiveEntryMissing {
                path: self.layout.root().join(OCI_LAYOUT_FILE).display().to_string(),
            }),
            Err(e) => Err(Error::ArchiveCorrupt(e.to_string())),
        }
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        match self.layout.read_blob(digest).await {
            Ok(data) => Ok(data),
            Err(OciError::NotFound(_)) => Err(Error::ArchiveEntryMissing {
                path: blob_entry_path(digest),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
