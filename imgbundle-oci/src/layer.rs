use std::io::{Read, Write};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Archive;
use tracing::{debug, warn};

use crate::error::{OciError, Result};
use crate::reference::Digest;

/// A compressed layer ready for upload.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    /// Gzip-compressed tar bytes.
    pub data: Vec<u8>,
    /// Digest of the compressed bytes (the blob digest).
    pub digest: Digest,
    /// Digest of the uncompressed tar (the config `diff_id`).
    pub diff_id: Digest,
}

/// Build a deterministic gzip-compressed tar from `(path, contents)` pairs.
/// Timestamps, ownership and modes are fixed so identical input always
/// yields the identical digest.
pub fn build_layer(files: &[(&str, &[u8])]) -> Result<LayerBlob> {
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        for &(name, data) in files {
            let mut header = tar::Header::new_ustar();
            header.set_path(name)?;
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();
            builder.append(&header, data)?;
        }
        builder.finish()?;
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    let data = encoder.finish()?;

    Ok(LayerBlob {
        digest: Digest::sha256_of(&data),
        diff_id: Digest::sha256_of(&tar_bytes),
        data,
    })
}

/// Read the file at `wanted` (relative, e.g. `.imgpkg/images.yml`) out of a
/// layer blob.  Returns `Ok(None)` when the layer has no such entry.
pub fn read_file(media_type: &str, data: &[u8], wanted: &str) -> Result<Option<Vec<u8>>> {
    let reader = decompressor(media_type, data)?;
    let mut archive = Archive::new(reader);
    let wanted = normalize(Path::new(wanted));

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let rel_path = entry.path()?.into_owned();
        if normalize(&rel_path) == wanted {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            debug!(path = %rel_path.display(), size = contents.len(), "read file from layer");
            return Ok(Some(contents));
        }
    }

    Ok(None)
}

/// Strip `./` prefixes and leading slashes so `./a/b` and `/a/b` match `a/b`.
fn normalize(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Compression helpers
// ---------------------------------------------------------------------------

/// Return a `Read`er that decompresses `data` according to the OCI media type.
pub fn decompressor<'a>(media_type: &str, data: &'a [u8]) -> Result<Box<dyn Read + 'a>> {
    if media_type.contains("gzip") {
        Ok(Box::new(GzDecoder::new(data)))
    } else if media_type.contains("zstd") {
        let decoder =
            zstd::Decoder::new(data).map_err(|e| OciError::Layer(format!("zstd init: {}", e)))?;
        Ok(Box::new(decoder))
    } else if media_type.contains("tar") && !media_type.contains('+') {
        // Uncompressed tar.
        Ok(Box::new(data))
    } else {
        // Default: try gzip.
        warn!(media_type, "unknown compression; assuming gzip");
        Ok(Box::new(GzDecoder::new(data)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MEDIA_TYPE_OCI_LAYER_GZIP;

    #[test]
    fn build_layer_is_deterministic() {
        let a = build_layer(&[(".imgpkg/images.yml", b"kind: ImagesLock")]).unwrap();
        let b = build_layer(&[(".imgpkg/images.yml", b"kind: ImagesLock")]).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.diff_id, b.diff_id);
        assert_ne!(a.digest, a.diff_id);
    }

    #[test]
    fn read_file_finds_nested_entry() {
        let layer = build_layer(&[
            ("README.md", b"readme"),
            (".imgpkg/images.yml", b"lock contents"),
        ])
        .unwrap();
        let found = read_file(MEDIA_TYPE_OCI_LAYER_GZIP, &layer.data, ".imgpkg/images.yml")
            .unwrap()
            .unwrap();
        assert_eq!(found, b"lock contents");
        let found = read_file(MEDIA_TYPE_OCI_LAYER_GZIP, &layer.data, "./README.md")
            .unwrap()
            .unwrap();
        assert_eq!(found, b"readme");
    }

    #[test]
    fn read_file_reports_missing_entry() {
        let layer = build_layer(&[("other.txt", b"x")]).unwrap();
        let found = read_file(MEDIA_TYPE_OCI_LAYER_GZIP, &layer.data, ".imgpkg/images.yml").unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn read_file_rejects_garbage() {
        assert!(read_file(MEDIA_TYPE_OCI_LAYER_GZIP, b"not gzip at all", "a").is_err());
    }

    #[test]
    fn decompressor_uncompressed_tar() {
        let mt = "application/vnd.oci.image.layer.v1.tar";
        assert!(decompressor(mt, &[]).is_ok());
    }
}
