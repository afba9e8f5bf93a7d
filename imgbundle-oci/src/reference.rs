use std::fmt;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::error::{OciError, Result};

/// Registry hostname used when a reference names no registry.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// A content digest such as `sha256:0123…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parse `algorithm:hex`.  Only `sha256` (64 lowercase hex chars) and
    /// `sha512` (128) are accepted.
    pub fn parse(raw: &str) -> Result<Self> {
        let (algorithm, hex) = raw
            .split_once(':')
            .ok_or_else(|| OciError::InvalidReference(format!("digest '{}' has no algorithm", raw)))?;

        let expected_len = match algorithm {
            "sha256" => 64,
            "sha512" => 128,
            other => {
                return Err(OciError::InvalidReference(format!(
                    "digest '{}' uses unsupported algorithm '{}'",
                    raw, other
                )))
            }
        };

        let valid_hex = hex.len() == expected_len
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid_hex {
            return Err(OciError::InvalidReference(format!(
                "digest '{}' is not {} lowercase hex characters",
                raw, expected_len
            )));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }

    /// SHA-256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self {
            algorithm: "sha256".to_string(),
            hex: hash.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Recompute the digest of `data` with this digest's algorithm and
    /// compare.  Only sha256 is computed locally.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if self.algorithm != "sha256" {
            return Err(OciError::UnsupportedMediaType(format!(
                "cannot verify {} digests",
                self.algorithm
            )));
        }
        let actual = Self::sha256_of(data);
        if actual != *self {
            return Err(OciError::DigestMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// A repository within a registry, e.g. `ghcr.io/org/app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Repository {
    pub registry: String,
    /// Path below the registry, `library/` prefixed for Docker Hub
    /// official images.
    pub repository: String,
}

impl Repository {
    /// Parse a bare repository name (no tag or digest).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let last_segment = raw.rsplit('/').next().unwrap_or(raw);
        if raw.contains('@') || last_segment.contains(':') {
            return Err(OciError::InvalidReference(format!(
                "'{}' names an image, expected a repository",
                raw
            )));
        }
        let (registry, repository) = split_name(raw, raw)?;
        Ok(Self {
            registry,
            repository,
        })
    }

    pub fn tag(&self, tag: &str) -> Reference {
        self.at(tag.to_string())
    }

    pub fn digest(&self, digest: &Digest) -> Reference {
        self.at(digest.to_string())
    }

    fn at(&self, reference: String) -> Reference {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference,
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

/// `registry/repository:tag` or `registry/repository@digest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    /// The tag, or the digest in `algorithm:hex` form.
    pub reference: String,
}

impl Reference {
    /// Parse `[registry/]repository[:tag|@digest]`.  A missing tag means
    /// `latest`; a missing registry means Docker Hub.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::InvalidReference("empty image reference".into()));
        }

        // `name:tag@digest` keeps the tag only for validation; the digest wins.
        let (name, reference) = match raw.split_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest)?.to_string();
                let (name, _tag) = split_tag(name, raw)?;
                (name, digest)
            }
            None => match split_tag(raw, raw)? {
                (name, Some(tag)) => (name, tag.to_string()),
                (name, None) => (name, "latest".to_string()),
            },
        };

        let (registry, repository) = split_name(name, raw)?;
        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Whether this reference pins a digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }

    /// The pinned digest, if any.
    pub fn digest(&self) -> Option<Digest> {
        if self.is_digest() {
            Digest::parse(&self.reference).ok()
        } else {
            None
        }
    }

    /// The tag, if this is a tag reference.
    pub fn tag(&self) -> Option<&str> {
        if self.is_digest() {
            None
        } else {
            Some(&self.reference)
        }
    }

    /// The repository this reference points into.
    pub fn context(&self) -> Repository {
        Repository {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(
            f,
            "{}/{}{}{}",
            self.registry, self.repository, sep, self.reference
        )
    }
}

impl FromStr for Reference {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split `name` into registry host and repository path.  The first path
/// segment is a host when it looks like one (has a dot or port, or is
/// `localhost`).
fn split_name(name: &str, raw: &str) -> Result<(String, String)> {
    if name.is_empty() || name.ends_with('/') {
        return Err(OciError::InvalidReference(format!(
            "reference '{}' has no repository",
            raw
        )));
    }

    let (registry, path) = match name.split_once('/') {
        Some((host, path))
            if host.contains('.') || host.contains(':') || host == "localhost" =>
        {
            (host, path)
        }
        _ => (DEFAULT_REGISTRY, name),
    };
    if path.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(OciError::InvalidReference(format!(
            "repository in '{}' must be lowercase",
            raw
        )));
    }

    let path = if registry == DEFAULT_REGISTRY && !path.contains('/') {
        format!("library/{}", path)
    } else {
        path.to_string()
    };
    Ok((registry.to_string(), path))
}

/// Split a trailing `:tag` off `name`.  A colon before the last '/' belongs
/// to a registry port.
fn split_tag<'a>(name: &'a str, raw: &str) -> Result<(&'a str, Option<&'a str>)> {
    let last_slash = name.rfind('/').map_or(0, |p| p + 1);
    match name.rfind(':').filter(|&colon| colon >= last_slash) {
        Some(colon) => {
            let tag = &name[colon + 1..];
            validate_tag(tag, raw)?;
            Ok((&name[..colon], Some(tag)))
        }
        None => Ok((name, None)),
    }
}

fn validate_tag(tag: &str, raw: &str) -> Result<()> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok || tag.len() > 128 {
        return Err(OciError::InvalidReference(format!(
            "reference '{}' has invalid tag '{}'",
            raw, tag
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
