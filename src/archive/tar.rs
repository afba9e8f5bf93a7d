//! Tar archives holding an OCI image layout.
//!
//! Writing to a regular file with more than one slot of concurrency runs in
//! two passes: every entry header is written with a zero-filled body of the
//! right size, then layer bodies are filled in concurrently through
//! independent file handles at the recorded offsets.  Other sinks (pipes,
//! devices) or a concurrency of one are written sequentially.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use imgbundle_oci::layout::{
    blob_entry_path, OciLayoutMarker, IMAGE_LAYOUT_VERSION, INDEX_FILE, OCI_LAYOUT_FILE,
};
use imgbundle_oci::manifest::ImageIndex;
use imgbundle_oci::{Digest, OciError};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::{BlobStore, LayoutPlan, PlannedBlob};
use crate::descriptor::{ImageLayerDescriptor, LayerProvider};
use crate::error::{Error, Result};
use crate::retry::{throttled, RetryPolicy};
use crate::throttle::Throttle;

const BLOCK: u64 = 512;

type Placeholders = Vec<(u64, ImageLayerDescriptor)>;
type EntryIndex = HashMap<String, (u64, u64)>;

enum Body {
    Bytes(Vec<u8>),
    Layer(ImageLayerDescriptor),
}

struct Entry {
    path: String,
    body: Body,
}

fn header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_entry_type(tar::EntryType::Regular);
    header
}

fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK) * BLOCK
}

fn entries(plan: &LayoutPlan) -> Result<Vec<Entry>> {
    let mut out = vec![
        Entry {
            path: OCI_LAYOUT_FILE.to_string(),
            body: Body::Bytes(serde_json::to_vec(&OciLayoutMarker::default())?),
        },
        Entry {
            path: INDEX_FILE.to_string(),
            body: Body::Bytes(plan.index_bytes()?),
        },
    ];
    for blob in &plan.blobs {
        out.push(Entry {
            path: blob_entry_path(blob.digest()),
            body: match blob {
                PlannedBlob::Bytes { data, .. } => Body::Bytes(data.clone()),
                PlannedBlob::Layer(layer) => Body::Layer(layer.clone()),
            },
        });
    }
    Ok(out)
}

/// Write `plan` as a tar archive at `path`, fetching layers from `provider`.
pub async fn write_tar(
    path: &Path,
    plan: &LayoutPlan,
    provider: Arc<dyn LayerProvider>,
    throttle: &Throttle,
    retry: &RetryPolicy,
) -> Result<()> {
    let file = File::create(path)?;
    let seekable = file.metadata()?.file_type().is_file();
    let entries = entries(plan)?;
    info!(
        path = %path.display(),
        blobs = plan.blobs.len(),
        parallel = seekable && throttle.capacity() > 1,
        "writing tar archive"
    );

    if seekable && throttle.capacity() > 1 {
        write_parallel(path, file, entries, provider, throttle, retry).await
    } else {
        write_sequential(file, entries, provider, throttle, retry).await
    }
}

async fn write_parallel(
    path: &Path,
    file: File,
    entries: Vec<Entry>,
    provider: Arc<dyn LayerProvider>,
    throttle: &Throttle,
    retry: &RetryPolicy,
) -> Result<()> {
    // Pass 1: headers, inline bodies and zero placeholders.
    let placeholders = tokio::task::spawn_blocking(move || -> Result<Placeholders> {
        let mut builder = tar::Builder::new(file);
        let mut placeholders = Vec::new();
        for entry in entries {
            match entry.body {
                Body::Bytes(data) => {
                    let mut h = header(data.len() as u64);
                    builder.append_data(&mut h, &entry.path, data.as_slice())?;
                }
                Body::Layer(layer) => {
                    let mut h = header(layer.size);
                    let zeros = io::repeat(0).take(layer.size);
                    builder.append_data(&mut h, &entry.path, zeros)?;
                    let end = builder.get_mut().stream_position()?;
                    placeholders.push((end - padded(layer.size), layer));
                }
            }
        }
        let file = builder.into_inner()?;
        file.sync_all()?;
        Ok(placeholders)
    })
    .await??;

    // Pass 2: fill in layer bodies concurrently.
    let mut join_set = JoinSet::new();
    for (offset, layer) in placeholders {
        let path = path.to_path_buf();
        let provider = provider.clone();
        let throttle = throttle.clone();
        let retry = retry.clone();
        join_set.spawn(async move {
            let data = fetch_layer(provider.as_ref(), &layer, &throttle, &retry).await?;
            let _slot = throttle.take().await?;
            let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            debug!(digest = %layer.digest, offset, "filled layer");
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
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn write_sequential(
    file: File,
    entries: Vec<Entry>,
    provider: Arc<dyn LayerProvider>,
    throttle: &Throttle,
    retry: &RetryPolicy,
) -> Result<()> {
    let mut builder = tar::Builder::new(file);
    for entry in entries {
        let data = match entry.body {
            Body::Bytes(data) => data,
            Body::Layer(layer) => fetch_layer(provider.as_ref(), &layer, throttle, retry).await?,
        };
        let path = entry.path;
        builder = tokio::task::spawn_blocking(move || -> Result<tar::Builder<File>> {
            let mut h = header(data.len() as u64);
            builder.append_data(&mut h, &path, data.as_slice())?;
            Ok(builder)
        })
        .await??;
    }
    tokio::task::spawn_blocking(move || -> Result<()> {
        builder.into_inner()?.sync_all()?;
        Ok(())
    })
    .await??;
    Ok(())
}

async fn fetch_layer(
    provider: &dyn LayerProvider,
    layer: &ImageLayerDescriptor,
    throttle: &Throttle,
    retry: &RetryPolicy,
) -> Result<Vec<u8>> {
    let data = throttled(throttle, retry, "read layer", || provider.contents(layer)).await?;
    layer.digest.verify(&data)?;
    // The placeholder was sized from the descriptor.
    if data.len() as u64 != layer.size {
        return Err(Error::Oci(OciError::Layer(format!(
            "layer {} is {} bytes, descriptor says {}",
            layer.digest,
            data.len(),
            layer.size
        ))));
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// A tar archive opened for random access to its entries.
pub struct TarArchive {
    path: PathBuf,
    /// entry path -> (data offset, size)
    entries: EntryIndex,
}

impl TarArchive {
    /// Index the archive's entries.  Truncated or unreadable archives are
    /// [`Error::ArchiveCorrupt`].
    pub async fn open(path: &Path) -> Result<Self> {
        let owned = path.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || -> Result<EntryIndex> {
            let file = File::open(&owned)?;
            let len = file.metadata()?.len();
            let corrupt =
                |e: io::Error| Error::ArchiveCorrupt(format!("{}: {}", owned.display(), e));

            let mut archive = tar::Archive::new(file);
            let mut entries = HashMap::new();
            for entry in archive.entries_with_seek().map_err(corrupt)? {
                let entry = entry.map_err(corrupt)?;
                let name = entry.path().map_err(corrupt)?.to_string_lossy().into_owned();
                let name = name.trim_start_matches("./").to_string();
                let offset = entry.raw_file_position();
                let size = entry.size();
                if offset + size > len {
                    return Err(Error::ArchiveCorrupt(format!(
                        "{}: entry {} is truncated",
                        owned.display(),
                        name
                    )));
                }
                entries.insert(name, (offset, size));
            }
            Ok(entries)
        })
        .await??;

        debug!(path = %path.display(), entries = entries.len(), "indexed tar archive");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub async fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let &(offset, size) = self
            .entries
            .get(name)
            .ok_or_else(|| Error::ArchiveEntryMissing {
                path: name.to_string(),
            })?;
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; size as usize];
        match file.read_exact(&mut data).await {
            Ok(_) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::ArchiveCorrupt(
                format!("entry {} is truncated", name),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for TarArchive {
    async fn index(&self) -> Result<ImageIndex> {
        let raw = self.read_entry(OCI_LAYOUT_FILE).await?;
        let marker: OciLayoutMarker = serde_json::from_slice(&raw)
            .map_err(|e| Error::ArchiveCorrupt(format!("{}: {}", OCI_LAYOUT_FILE, e)))?;
        if marker.image_layout_version != IMAGE_LAYOUT_VERSION {
            return Err(Error::ArchiveCorrupt(format!(
                "unsupported image layout version {}",
                marker.image_layout_version
            )));
        }
        let raw = self.read_entry(INDEX_FILE).await?;
        ImageIndex::from_slice(&raw)
            .map_err(|e| Error::ArchiveCorrupt(format!("{}: {}", INDEX_FILE, e)))
    }

    async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.read_entry(&blob_entry_path(digest)).await
    }
}
