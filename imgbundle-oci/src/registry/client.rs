use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{
    HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LINK, LOCATION,
    WWW_AUTHENTICATE,
};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::{ManifestHead, RawManifest, Registry};
use crate::error::{OciError, Result};
use crate::manifest::{
    sniff_media_type, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::reference::{Digest, Reference, Repository};

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

// ---------------------------------------------------------------------------
// RegistryAuth
// ---------------------------------------------------------------------------

/// Credentials presented to a registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read credentials from the named environment variables, falling back
    /// to anonymous when either is unset.
    pub fn from_env_vars(username_var: &str, password_var: &str) -> Self {
        match (std::env::var(username_var), std::env::var(password_var)) {
            (Ok(u), Ok(p)) if !u.is_empty() => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    /// Read `IMGBUNDLE_REGISTRY_USERNAME` / `IMGBUNDLE_REGISTRY_PASSWORD`.
    pub fn from_env() -> Self {
        Self::from_env_vars("IMGBUNDLE_REGISTRY_USERNAME", "IMGBUNDLE_REGISTRY_PASSWORD")
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// OCI Distribution HTTP client.
pub struct RegistryClient {
    client: reqwest::Client,
    auth: RegistryAuth,
    /// `Authorization` header values keyed by `registry|scope`.
    tokens: Mutex<HashMap<String, String>>,
}

/// Loopback registries are spoken to over plain HTTP.
fn base_url(registry: &str) -> String {
    let host = match registry.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => registry,
    };
    let loopback = matches!(host, "localhost" | "127.0.0.1" | "[::1]");
    format!("{}://{}", if loopback { "http" } else { "https" }, registry)
}

impl RegistryClient {
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::anonymous())
    }

    pub fn with_auth(auth: RegistryAuth) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("imgbundle/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            auth,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    // -- internals ----------------------------------------------------------

    /// Send a request, running the anonymous-then-token auth flow on a 401.
    async fn send(
        &self,
        method: Method,
        url: &str,
        repository: &Repository,
        push: bool,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let actions = if push { "pull,push" } else { "pull" };
        let scope = format!("repository:{}:{}", repository.repository, actions);
        let cache_key = format!("{}|{}", repository.registry, scope);

        let cached = self
            .tokens
            .lock()
            .map_err(|_| OciError::Registry("token cache poisoned".to_string()))?
            .get(&cache_key)
            .cloned();

        let resp = self
            .build(method.clone(), url, &headers, body.clone(), cached.as_deref())
            .send()
            .await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return check_status(resp, &method, url).await;
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let authorization = self.authorize(&challenge, &scope, url).await?;
        self.tokens
            .lock()
            .map_err(|_| OciError::Registry("token cache poisoned".to_string()))?
            .insert(cache_key, authorization.clone());

        let retried = self
            .build(method.clone(), url, &headers, body, Some(&authorization))
            .send()
            .await?;
        check_status(retried, &method, url).await
    }

    fn build(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<Vec<u8>>,
        authorization: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url).headers(headers.clone());
        if let Some(a) = authorization {
            req = req.header(AUTHORIZATION, a);
        }
        if let Some(b) = body {
            req = req.body(b);
        }
        req
    }

    /// Turn a `WWW-Authenticate` challenge into an `Authorization` value.
    async fn authorize(&self, challenge: &str, scope: &str, url: &str) -> Result<String> {
        if challenge.to_ascii_lowercase().starts_with("basic") {
            return match (&self.auth.username, &self.auth.password) {
                (Some(u), Some(p)) => Ok(format!("Basic {}", basic_token(u, p))),
                _ => Err(OciError::Unauthorized(format!(
                    "{} requires credentials",
                    url
                ))),
            };
        }

        let challenge = Challenge::parse(challenge);
        let Some(realm) = challenge.get("realm") else {
            return Err(OciError::Unauthorized(format!(
                "{} returned 401 without a usable challenge",
                url
            )));
        };
        let service = challenge.get("service").unwrap_or_default();
        let scope = challenge.get("scope").unwrap_or(scope);

        debug!(%realm, %service, %scope, "fetching bearer token");

        let mut req = self
            .client
            .get(realm)
            .query(&[("service", service), ("scope", scope)]);
        if let (Some(u), Some(p)) = (&self.auth.username, &self.auth.password) {
            req = req.basic_auth(u, Some(p));
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(OciError::Unauthorized(format!(
                "token endpoint {} returned {}",
                realm, status
            )));
        }
        let resp = check_status(resp, &Method::GET, realm).await?;
        let issued: TokenResponse = resp.json().await?;
        issued
            .token
            .or(issued.access_token)
            .map(|token| format!("Bearer {}", token))
            .ok_or_else(|| OciError::Registry(format!("{} issued no token", realm)))
    }

    fn manifest_url(reference: &Reference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            base_url(&reference.registry),
            reference.repository,
            reference.reference,
        )
    }

    fn blob_url(repository: &Repository, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            base_url(&repository.registry),
            repository.repository,
            digest,
        )
    }

    fn manifest_accept() -> HeaderMap {
        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");
        let mut headers = HeaderMap::new();
        if let Ok(v) = accept.parse() {
            headers.insert(ACCEPT, v);
        }
        headers
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn get_manifest(&self, reference: &Reference) -> Result<RawManifest> {
        let url = Self::manifest_url(reference);
        let resp = self
            .send(
                Method::GET,
                &url,
                &reference.context(),
                false,
                Self::manifest_accept(),
                None,
            )
            .await?;

        let declared = header_str(resp.headers(), CONTENT_TYPE.as_str());
        let bytes = resp.bytes().await?.to_vec();
        let media_type = sniff_media_type(declared.as_deref(), &bytes)?;

        let digest = match reference.digest() {
            Some(expected) => {
                expected.verify(&bytes)?;
                expected
            }
            None => Digest::sha256_of(&bytes),
        };

        debug!(%reference, %digest, %media_type, "fetched manifest");
        Ok(RawManifest {
            media_type,
            digest,
            bytes,
        })
    }

    async fn head_manifest(&self, reference: &Reference) -> Result<ManifestHead> {
        let url = Self::manifest_url(reference);
        let resp = self
            .send(
                Method::HEAD,
                &url,
                &reference.context(),
                false,
                Self::manifest_accept(),
                None,
            )
            .await?;

        let headers = resp.headers();
        let digest = header_str(headers, DOCKER_CONTENT_DIGEST).and_then(|d| Digest::parse(&d).ok());
        let media_type = header_str(headers, CONTENT_TYPE.as_str());
        let size = header_str(headers, CONTENT_LENGTH.as_str()).and_then(|s| s.parse().ok());

        match (digest, media_type, size) {
            (Some(digest), Some(media_type), Some(size)) => Ok(ManifestHead {
                media_type,
                digest,
                size,
            }),
            // Some registries omit digest headers on HEAD; fall back to GET.
            _ => {
                let raw = self.get_manifest(reference).await?;
                Ok(ManifestHead {
                    size: raw.bytes.len() as u64,
                    media_type: raw.media_type,
                    digest: raw.digest,
                })
            }
        }
    }

    async fn get_blob(&self, repository: &Repository, digest: &Digest) -> Result<Vec<u8>> {
        let url = Self::blob_url(repository, digest);
        info!(%digest, "downloading blob");
        let resp = self
            .send(Method::GET, &url, repository, false, HeaderMap::new(), None)
            .await?;
        let data = resp.bytes().await?.to_vec();
        digest.verify(&data)?;
        Ok(data)
    }

    async fn has_blob(&self, repository: &Repository, digest: &Digest) -> Result<bool> {
        let url = Self::blob_url(repository, digest);
        match self
            .send(Method::HEAD, &url, repository, false, HeaderMap::new(), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(OciError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn put_blob(
        &self,
        repository: &Repository,
        digest: &Digest,
        data: Vec<u8>,
    ) -> Result<()> {
        let base = base_url(&repository.registry);
        let start_url = format!("{}/v2/{}/blobs/uploads/", base, repository.repository);
        let resp = self
            .send(Method::POST, &start_url, repository, true, HeaderMap::new(), None)
            .await?;

        let location = header_str(resp.headers(), LOCATION.as_str()).ok_or_else(|| {
            OciError::Registry(format!("upload to {} returned no location", repository))
        })?;
        let location = if location.starts_with("http://") || location.starts_with("https://") {
            location
        } else {
            format!("{}{}", base, location)
        };
        let sep = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", location, sep, digest);

        let mut headers = HeaderMap::new();
        if let Ok(v) = "application/octet-stream".parse() {
            headers.insert(CONTENT_TYPE, v);
        }

        debug!(%digest, size = data.len(), "uploading blob");
        self.send(Method::PUT, &put_url, repository, true, headers, Some(data))
            .await?;
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        data: Vec<u8>,
    ) -> Result<Digest> {
        let url = Self::manifest_url(reference);
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            media_type
                .parse()
                .map_err(|_| OciError::UnsupportedMediaType(media_type.to_string()))?,
        );

        let local = Digest::sha256_of(&data);
        let resp = self
            .send(Method::PUT, &url, &reference.context(), true, headers, Some(data))
            .await?;

        let digest = header_str(resp.headers(), DOCKER_CONTENT_DIGEST)
            .and_then(|d| Digest::parse(&d).ok())
            .unwrap_or(local);
        info!(%reference, %digest, "wrote manifest");
        Ok(digest)
    }

    async fn list_tags(&self, repository: &Repository) -> Result<Vec<String>> {
        let base = base_url(&repository.registry);
        let mut url = format!("{}/v2/{}/tags/list", base, repository.repository);
        let mut tags = Vec::new();

        loop {
            let resp = self
                .send(Method::GET, &url, repository, false, HeaderMap::new(), None)
                .await?;
            let next = resp
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);
            let body: serde_json::Value = resp.json().await?;
            if let Some(list) = body.get("tags").and_then(|t| t.as_array()) {
                tags.extend(list.iter().filter_map(|t| t.as_str().map(str::to_string)));
            }
            match next {
                Some(path) if path.starts_with('/') => url = format!("{}{}", base, path),
                Some(full) => url = full,
                None => break,
            }
        }

        tags.sort();
        Ok(tags)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn check_status(resp: Response, method: &Method, url: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let what = format!("{} {} returned {}: {}", method, url, status, body.trim());
    Err(match status {
        StatusCode::NOT_FOUND => OciError::NotFound(url.to_string()),
        StatusCode::UNAUTHORIZED => OciError::Unauthorized(what),
        StatusCode::FORBIDDEN => OciError::Denied(what),
        _ => OciError::Registry(what),
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The quoted `key="value"` pairs of a `WWW-Authenticate: Bearer ...`
/// header.
struct Challenge {
    params: HashMap<String, String>,
}

impl Challenge {
    fn parse(header: &str) -> Self {
        let mut params = HashMap::new();
        let mut rest = header.split_once(' ').map_or(header, |(_, rest)| rest);
        while let Some((key, after)) = rest.split_once("=\"") {
            let Some((value, tail)) = after.split_once('"') else {
                break;
            };
            let key = key.trim_start_matches([',', ' ']).to_ascii_lowercase();
            params.insert(key, value.to_string());
            rest = tail;
        }
        Self { params }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Pull the target out of `Link: </v2/...>; rel="next"`.
fn next_link(header: &str) -> Option<String> {
    if !header.contains("rel=\"next\"") {
        return None;
    }
    let start = header.find('<')? + 1;
    let end = header[start..].find('>')? + start;
    Some(header[start..end].to_string())
}

fn basic_token(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{}:{}", username, password))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
