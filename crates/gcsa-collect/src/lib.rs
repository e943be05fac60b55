//! Collector entry points: plugin init metadata, secret and option checks, and
//! the streaming collect run that turns bucket datasets into response envelopes.

use std::collections::VecDeque;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, BoxStream, StreamExt};
use gcsa_assets::{discover, load_dataset, DatasetRows, PreparedDataset};
use gcsa_core::{
    DatasetDescriptor, DatasetIdentity, Envelope, ErrorResource, Resource, ResourceKind,
    ResourceRecord, ResourceTypeRecord, ResponseState, CLOUD_SERVICE_MATCH_KEYS,
    CLOUD_SERVICE_TYPE_MATCH_KEYS, DEFAULT_PROVIDER,
};
use gcsa_storage::{
    FsGatewayFactory, GatewayFactory, GcsConfig, GcsGatewayFactory, ServiceAccountKey,
    StorageError, StorageGateway, GCS_API_BASE, READ_ONLY_SCOPE, SERVICE_ACCOUNT_FIELDS,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcsa-collect";

pub const BUCKET_NAME_OPTION: &str = "bucket_name";
pub const DEFAULT_USER_AGENT: &str = "gcsa-collector/0.1";

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub storage_api_base: String,
    pub emulator_host: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub local_root: Option<PathBuf>,
    pub web_port: u16,
    pub log_level: String,
    pub log_json: bool,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        Self {
            storage_api_base: non_empty_env("GCSA_STORAGE_API_BASE")
                .unwrap_or_else(|| GCS_API_BASE.to_string()),
            emulator_host: non_empty_env("STORAGE_EMULATOR_HOST"),
            http_timeout_secs: std::env::var("GCSA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("GCSA_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            local_root: non_empty_env("GCSA_LOCAL_ROOT").map(PathBuf::from),
            web_port: std::env::var("GCSA_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            log_level: std::env::var("GCSA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env_flag("GCSA_LOG_JSON"),
        }
    }

    /// GCS client settings; an emulator host replaces the API base.
    pub fn gcs_config(&self) -> GcsConfig {
        let api_base = match &self.emulator_host {
            Some(host) if host.contains("://") => host.clone(),
            Some(host) => format!("http://{host}"),
            None => self.storage_api_base.clone(),
        };
        GcsConfig {
            api_base,
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            scope: READ_ONLY_SCOPE.to_string(),
        }
    }

    pub fn gateway_factory(&self) -> Arc<dyn GatewayFactory> {
        match (&self.local_root, &self.emulator_host) {
            (Some(root), _) => Arc::new(FsGatewayFactory::new(root.clone())),
            (None, Some(_)) => Arc::new(GcsGatewayFactory::anonymous(self.gcs_config())),
            (None, None) => Arc::new(GcsGatewayFactory::new(self.gcs_config())),
        }
    }
}

/// Configuration problems detected before any storage access.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("required parameter missing (key = {key})")]
    RequiredParameter { key: String },
    #[error("invalid parameter (key = {key}): {reason}")]
    InvalidParameter { key: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CollectError {
    pub fn error_type(&self) -> &'static str {
        match self {
            CollectError::RequiredParameter { .. } => "requiredParameter",
            CollectError::InvalidParameter { .. } => "invalidParameter",
            CollectError::Storage(_) => "storage",
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            CollectError::RequiredParameter { key } | CollectError::InvalidParameter { key, .. } => {
                Some(key)
            }
            CollectError::Storage(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("match key `{key}` is empty")]
    EmptyMatchKey { key: &'static str },
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginMetadata {
    pub supported_resource_type: Vec<ResourceKind>,
    pub options_schema: JsonValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitResponse {
    pub metadata: PluginMetadata,
}

pub fn init_metadata() -> InitResponse {
    InitResponse {
        metadata: PluginMetadata {
            supported_resource_type: ResourceKind::SUPPORTED.to_vec(),
            options_schema: json!({
                "type": "object",
                "properties": {
                    BUCKET_NAME_OPTION: {
                        "type": "string",
                        "title": "Bucket Name",
                        "description": "The name of the Google Cloud Storage bucket",
                    }
                },
                "required": [BUCKET_NAME_OPTION],
            }),
        },
    }
}

/// Checks the service-account secret key by key, in a fixed order, and reports
/// the first missing one.
pub fn check_secret_data(
    secret_data: &JsonMap<String, JsonValue>,
) -> Result<ServiceAccountKey, CollectError> {
    for field in SERVICE_ACCOUNT_FIELDS {
        let key = format!("secret_data.{field}");
        match secret_data.get(field) {
            None => return Err(CollectError::RequiredParameter { key }),
            Some(JsonValue::String(_)) => {}
            Some(_) => {
                return Err(CollectError::InvalidParameter {
                    key,
                    reason: "expected a string".to_string(),
                })
            }
        }
    }
    serde_json::from_value(JsonValue::Object(secret_data.clone())).map_err(|e| {
        CollectError::InvalidParameter {
            key: "secret_data".to_string(),
            reason: e.to_string(),
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectOptions {
    pub bucket_name: String,
}

impl CollectOptions {
    pub fn from_options(options: &JsonMap<String, JsonValue>) -> Result<Self, CollectError> {
        let key = format!("options.{BUCKET_NAME_OPTION}");
        match options.get(BUCKET_NAME_OPTION) {
            Some(JsonValue::String(name)) if !name.trim().is_empty() => Ok(Self {
                bucket_name: name.clone(),
            }),
            None | Some(JsonValue::Null) | Some(JsonValue::String(_)) => {
                Err(CollectError::RequiredParameter { key })
            }
            Some(_) => Err(CollectError::InvalidParameter {
                key,
                reason: "expected a string".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectRequest {
    #[serde(default)]
    pub options: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub secret_data: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub schema: Option<String>,
}

fn check_match_keys(keys: &[&'static str], values: &[&str]) -> Result<(), EmitError> {
    match keys.iter().zip(values).find(|(_, value)| value.is_empty()) {
        Some((key, _)) => Err(EmitError::EmptyMatchKey { key: *key }),
        None => Ok(()),
    }
}

pub fn emit_cloud_service(record: ResourceRecord) -> Result<Envelope, EmitError> {
    check_match_keys(
        &CLOUD_SERVICE_MATCH_KEYS,
        &[
            record.resource_id(),
            &record.provider,
            &record.cloud_service_type,
            &record.cloud_service_group,
        ],
    )?;
    Ok(Envelope::success(
        ResourceKind::CloudService,
        &CLOUD_SERVICE_MATCH_KEYS,
        Resource::CloudService(record),
    ))
}

pub fn emit_cloud_service_type(record: ResourceTypeRecord) -> Result<Envelope, EmitError> {
    check_match_keys(
        &CLOUD_SERVICE_TYPE_MATCH_KEYS,
        &[&record.name, &record.group, &record.provider],
    )?;
    Ok(Envelope::success(
        ResourceKind::CloudServiceType,
        &CLOUD_SERVICE_TYPE_MATCH_KEYS,
        Resource::CloudServiceType(record),
    ))
}

fn dataset_error(identity: &DatasetIdentity, err: &dyn Display) -> Envelope {
    Envelope::error(err.to_string(), ErrorResource::for_dataset(identity))
}

/// Row envelopes of one dataset in CSV order, then its type envelope.
pub struct DatasetEnvelopes {
    identity: DatasetIdentity,
    rows: DatasetRows,
    trailer: Option<ResourceTypeRecord>,
}

impl DatasetEnvelopes {
    pub fn new(descriptor: &DatasetDescriptor, dataset: PreparedDataset) -> Self {
        let (resource_type, rows) = dataset.into_parts();
        Self {
            identity: descriptor.identity(),
            rows,
            trailer: Some(resource_type),
        }
    }
}

impl Iterator for DatasetEnvelopes {
    type Item = Envelope;

    fn next(&mut self) -> Option<Envelope> {
        if let Some(row) = self.rows.next() {
            return Some(match row {
                Ok(record) => emit_cloud_service(record)
                    .unwrap_or_else(|err| dataset_error(&self.identity, &err)),
                Err(err) => {
                    warn!(dataset = %self.identity, line = err.line(), error = %err, "row rejected");
                    dataset_error(&self.identity, &err)
                }
            });
        }
        let record = self.trailer.take()?;
        debug!(dataset = %self.identity, "emitting cloud service type");
        Some(emit_cloud_service_type(record).unwrap_or_else(|err| dataset_error(&self.identity, &err)))
    }
}

/// Per-kind envelope counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectStats {
    pub datasets: usize,
    pub cloud_services: usize,
    pub cloud_service_types: usize,
    pub errors: usize,
}

impl CollectStats {
    pub fn record(&mut self, envelope: &Envelope) {
        match (envelope.state, envelope.resource_type) {
            (ResponseState::Success, ResourceKind::CloudService) => self.cloud_services += 1,
            (ResponseState::Success, ResourceKind::CloudServiceType) => {
                self.cloud_service_types += 1
            }
            (ResponseState::Failure, _) | (_, ResourceKind::ErrorResource) => self.errors += 1,
            (ResponseState::Success, ResourceKind::Region) => {}
        }
    }
}

struct CollectRun {
    gateway: Arc<dyn StorageGateway>,
    bucket: String,
    project_id: String,
    run_id: Uuid,
    started: Instant,
    span: Span,
    pending: Option<VecDeque<DatasetDescriptor>>,
    current: Option<DatasetEnvelopes>,
    stats: CollectStats,
    finished: bool,
}

impl CollectRun {
    fn start(gateway: Arc<dyn StorageGateway>, bucket: String, project_id: String) -> Self {
        let run_id = Uuid::new_v4();
        let span = info_span!("collect", %run_id, bucket = %bucket);
        span.in_scope(|| {
            info!(project_id = %project_id, "start collecting cloud resources");
        });
        Self {
            gateway,
            bucket,
            project_id,
            run_id,
            started: Instant::now(),
            span,
            pending: None,
            current: None,
            stats: CollectStats::default(),
            finished: false,
        }
    }

    async fn next_envelope(&mut self) -> Option<Envelope> {
        let envelope = self.advance().await?;
        self.stats.record(&envelope);
        Some(envelope)
    }

    async fn advance(&mut self) -> Option<Envelope> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(current) = self.current.as_mut() {
                if let Some(envelope) = current.next() {
                    return Some(envelope);
                }
                self.current = None;
            }

            if self.pending.is_none() {
                match discover(self.gateway.as_ref(), &self.bucket).await {
                    Ok(datasets) => {
                        info!(datasets = datasets.len(), "discovered assets");
                        self.pending = Some(datasets.into());
                    }
                    Err(err) => {
                        warn!(error = %err, "bucket listing failed");
                        self.finish();
                        return Some(Envelope::error(
                            err.to_string(),
                            ErrorResource::for_provider(DEFAULT_PROVIDER),
                        ));
                    }
                }
            }

            let Some(descriptor) = self.pending.as_mut().and_then(VecDeque::pop_front) else {
                self.finish();
                return None;
            };
            self.stats.datasets += 1;
            debug!(dataset = %descriptor.identity(), "collecting cloud services");
            match load_dataset(self.gateway.as_ref(), &self.bucket, &descriptor).await {
                Ok(dataset) => self.current = Some(DatasetEnvelopes::new(&descriptor, dataset)),
                Err(err) => {
                    warn!(dataset = %descriptor.identity(), error = %err, "dataset skipped");
                    return Some(dataset_error(&descriptor.identity(), &err));
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        info!(
            project_id = %self.project_id,
            run_id = %self.run_id,
            datasets = self.stats.datasets,
            cloud_services = self.stats.cloud_services,
            cloud_service_types = self.stats.cloud_service_types,
            errors = self.stats.errors,
            duration_secs = self.started.elapsed().as_secs_f64(),
            "finished collecting cloud resources"
        );
    }

    fn into_stream(self) -> BoxStream<'static, Envelope> {
        stream::unfold(self, |mut run| async move {
            let span = run.span.clone();
            let envelope = run.next_envelope().instrument(span).await?;
            Some((envelope, run))
        })
        .boxed()
    }
}

/// Validates secret and options, connects storage, and returns the lazy
/// envelope stream. Only configuration problems are returned as errors;
/// everything after this point is reported inside the stream.
pub fn collect(
    request: CollectRequest,
    factory: &dyn GatewayFactory,
) -> Result<BoxStream<'static, Envelope>, CollectError> {
    let key = check_secret_data(&request.secret_data)?;
    let options = CollectOptions::from_options(&request.options)?;
    let gateway = factory.connect(&key)?;
    if let Some(schema) = &request.schema {
        debug!(schema = %schema, "schema hint ignored");
    }
    Ok(CollectRun::start(gateway, options.bucket_name, key.project_id).into_stream())
}
