//! Object storage gateways (GCS JSON API, local directory, in-memory) and
//! service-account credential handling.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "gcsa-storage";

pub const GCS_API_BASE: &str = "https://storage.googleapis.com";
pub const READ_ONLY_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_only";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

/// Keys a service-account secret must carry, in the order they are checked.
pub const SERVICE_ACCOUNT_FIELDS: [&str; 9] = [
    "type",
    "private_key_id",
    "private_key",
    "client_email",
    "client_id",
    "auth_uri",
    "token_uri",
    "auth_provider_x509_cert_url",
    "project_id",
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("object {path} is not valid UTF-8")]
    InvalidUtf8 { path: String },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid service account credentials: {0}")]
    Credentials(String),
    #[error("signing token assertion: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("invalid storage url: {0}")]
    Url(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read-only view of an object store: list a bucket, fetch one object as text.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, StorageError>;

    /// `Ok(None)` when the object does not exist.
    async fn get_object_text(&self, bucket: &str, path: &str)
        -> Result<Option<String>, StorageError>;
}

/// Google service-account key as found in the collector's secret data.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub project_id: String,
    pub private_key_id: String,
    pub private_key: String,
    pub client_email: String,
    pub client_id: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub auth_provider_x509_cert_url: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("key_type", &self.key_type)
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .field("client_email", &self.client_email)
            .field("client_id", &self.client_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct GcsConfig {
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub scope: String,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            api_base: GCS_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            scope: READ_ONLY_SCOPE.to_string(),
        }
    }
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    TOKEN_LIFETIME_SECS as u64
}

struct AccessToken {
    value: String,
    refresh_at: Instant,
}

/// OAuth2 JWT-bearer grant for a service account, with a cached access token.
struct TokenSource {
    client_email: String,
    private_key_id: String,
    token_uri: String,
    scope: String,
    encoding_key: EncodingKey,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenSource {
    fn new(key: &ServiceAccountKey, scope: &str) -> Result<Self, StorageError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| StorageError::Credentials(format!("private_key: {e}")))?;
        Url::parse(&key.token_uri)
            .map_err(|e| StorageError::Credentials(format!("token_uri: {e}")))?;
        Ok(Self {
            client_email: key.client_email.clone(),
            private_key_id: key.private_key_id.clone(),
            token_uri: key.token_uri.clone(),
            scope: scope.to_string(),
            encoding_key,
            cached: Mutex::new(None),
        })
    }

    fn assertion(&self, issued_at: i64) -> Result<String, StorageError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.private_key_id.clone());
        let claims = JwtClaims {
            iss: &self.client_email,
            scope: &self.scope,
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + TOKEN_LIFETIME_SECS,
        };
        Ok(encode(&header, &claims, &self.encoding_key)?)
    }

    async fn bearer(&self, client: &reqwest::Client) -> Result<String, StorageError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.assertion(Utc::now().timestamp())?;
        let resp = client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StorageError::HttpStatus {
                status: status.as_u16(),
                url: self.token_uri.clone(),
            });
        }
        let token: TokenResponse = resp.json().await?;
        let lifetime =
            Duration::from_secs(token.expires_in.saturating_sub(TOKEN_REFRESH_MARGIN_SECS));
        debug!(client_email = %self.client_email, "refreshed storage access token");
        *cached = Some(AccessToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<ObjectEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectEntry {
    name: String,
}

/// Gateway over the GCS JSON API.
pub struct GcsGateway {
    client: reqwest::Client,
    api_base: Url,
    auth: Option<TokenSource>,
}

impl fmt::Debug for GcsGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsGateway")
            .field("api_base", &self.api_base.as_str())
            .field("authenticated", &self.auth.is_some())
            .finish()
    }
}

impl GcsGateway {
    pub fn new(config: &GcsConfig, key: &ServiceAccountKey) -> Result<Self, StorageError> {
        let auth = TokenSource::new(key, &config.scope)?;
        Self::build(config, Some(auth))
    }

    /// Unauthenticated gateway, for storage emulators.
    pub fn anonymous(config: &GcsConfig) -> Result<Self, StorageError> {
        Self::build(config, None)
    }

    fn build(config: &GcsConfig, auth: Option<TokenSource>) -> Result<Self, StorageError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        let api_base = Url::parse(&config.api_base)
            .map_err(|e| StorageError::Url(format!("{}: {e}", config.api_base)))?;
        Ok(Self {
            client,
            api_base,
            auth,
        })
    }

    pub fn objects_url(&self, bucket: &str) -> Result<Url, StorageError> {
        storage_url(&self.api_base, &[bucket, "o"])
    }

    /// Media download URL; the object name is encoded as a single path segment.
    pub fn object_media_url(&self, bucket: &str, path: &str) -> Result<Url, StorageError> {
        let mut url = storage_url(&self.api_base, &[bucket, "o", path])?;
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }

    async fn authorized_get(&self, url: Url) -> Result<reqwest::Response, StorageError> {
        let mut request = self.client.get(url);
        if let Some(auth) = &self.auth {
            request = request.bearer_auth(auth.bearer(&self.client).await?);
        }
        Ok(request.send().await?)
    }

    async fn list_pages(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.objects_url(bucket)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("fields", "items(name),nextPageToken");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let resp = self.authorized_get(url.clone()).await?;
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Err(StorageError::BucketNotFound(bucket.to_string()));
            }
            if !status.is_success() {
                return Err(StorageError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let page: ListPage = resp.json().await?;
            names.extend(page.items.into_iter().map(|o| o.name));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(objects = names.len(), "listed bucket");
        Ok(names)
    }

    async fn fetch_text(&self, bucket: &str, path: &str) -> Result<Option<String>, StorageError> {
        let url = self.object_media_url(bucket, path)?;
        let resp = self.authorized_get(url.clone()).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StorageError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let bytes = resp.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| StorageError::InvalidUtf8 {
                path: path.to_string(),
            })
    }
}

fn storage_url(base: &Url, segments: &[&str]) -> Result<Url, StorageError> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| StorageError::Url(format!("{base} cannot be a base url")))?;
        path.pop_if_empty()
            .extend(["storage", "v1", "b"])
            .extend(segments.iter().copied());
    }
    Ok(url)
}

#[async_trait]
impl StorageGateway for GcsGateway {
    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
        let span = info_span!("gcs_request", op = "list", bucket);
        self.list_pages(bucket).instrument(span).await
    }

    async fn get_object_text(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<Option<String>, StorageError> {
        let span = info_span!("gcs_request", op = "get", bucket, path);
        self.fetch_text(bucket, path).instrument(span).await
    }
}

/// Gateway over a local directory: each bucket is a subdirectory of `root`.
#[derive(Debug, Clone)]
pub struct FsGateway {
    root: PathBuf,
}

impl FsGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Option<PathBuf> {
        safe_relative_path(bucket)
            .filter(|p| p.components().count() == 1)
            .map(|p| self.root.join(p))
    }
}

/// `a/b/c` as a relative path, rejecting empty, `.` and `..` segments.
fn safe_relative_path(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        out.push(segment);
    }
    Some(out)
}

fn object_name(bucket_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(bucket_dir).ok()?;
    let parts = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

#[async_trait]
impl StorageGateway for FsGateway {
    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
        let bucket_dir = self
            .bucket_dir(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        if !fs::try_exists(&bucket_dir)
            .await
            .map_err(io_error(&bucket_dir))?
        {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }

        let mut names = Vec::new();
        let mut pending = vec![bucket_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(io_error(&dir))?;
            while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(io_error(&path))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Some(name) = object_name(&bucket_dir, &path) {
                        names.push(name);
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get_object_text(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<Option<String>, StorageError> {
        let (Some(bucket_dir), Some(relative)) = (self.bucket_dir(bucket), safe_relative_path(path))
        else {
            return Ok(None);
        };
        let full = bucket_dir.join(relative);
        match fs::read(&full).await {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StorageError::InvalidUtf8 {
                    path: path.to_string(),
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&full)(err)),
        }
    }
}

/// In-memory buckets that list objects in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    buckets: BTreeMap<String, Vec<(String, String)>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.buckets.entry(bucket.into()).or_default();
        self
    }

    pub fn with_object(
        mut self,
        bucket: impl Into<String>,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let text = text.into();
        let objects = self.buckets.entry(bucket.into()).or_default();
        match objects.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = text,
            None => objects.push((name, text)),
        }
        self
    }
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, StorageError> {
        self.buckets
            .get(bucket)
            .map(|objects| objects.iter().map(|(name, _)| name.clone()).collect())
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))
    }

    async fn get_object_text(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self.buckets.get(bucket).and_then(|objects| {
            objects
                .iter()
                .find(|(name, _)| name == path)
                .map(|(_, text)| text.clone())
        }))
    }
}

/// Turns collector credentials into a storage client.
pub trait GatewayFactory: Send + Sync {
    fn connect(&self, key: &ServiceAccountKey) -> Result<Arc<dyn StorageGateway>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct GcsGatewayFactory {
    config: GcsConfig,
    anonymous: bool,
}

impl GcsGatewayFactory {
    pub fn new(config: GcsConfig) -> Self {
        Self {
            config,
            anonymous: false,
        }
    }

    pub fn anonymous(config: GcsConfig) -> Self {
        Self {
            config,
            anonymous: true,
        }
    }
}

impl GatewayFactory for GcsGatewayFactory {
    fn connect(&self, key: &ServiceAccountKey) -> Result<Arc<dyn StorageGateway>, StorageError> {
        let gateway = if self.anonymous {
            GcsGateway::anonymous(&self.config)?
        } else {
            GcsGateway::new(&self.config, key)?
        };
        Ok(Arc::new(gateway))
    }
}

#[derive(Debug, Clone)]
pub struct FsGatewayFactory {
    root: PathBuf,
}

impl FsGatewayFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl GatewayFactory for FsGatewayFactory {
    fn connect(&self, _key: &ServiceAccountKey) -> Result<Arc<dyn StorageGateway>, StorageError> {
        Ok(Arc::new(FsGateway::new(self.root.clone())))
    }
}

/// Hands out the same gateway regardless of credentials.
#[derive(Clone)]
pub struct StaticGatewayFactory {
    gateway: Arc<dyn StorageGateway>,
}

impl StaticGatewayFactory {
    pub fn new(gateway: Arc<dyn StorageGateway>) -> Self {
        Self { gateway }
    }
}

impl GatewayFactory for StaticGatewayFactory {
    fn connect(&self, _key: &ServiceAccountKey) -> Result<Arc<dyn StorageGateway>, StorageError> {
        Ok(self.gateway.clone())
    }
}
