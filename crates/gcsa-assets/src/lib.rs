//! Asset discovery, sidecar metadata resolution and CSV row normalization.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;

use csv::{Position, StringRecord, StringRecordsIntoIter};
use gcsa_core::{
    CellValue, DatasetDescriptor, DatasetIdentity, DatasetMetadata, FieldSpec, Reference,
    ResourceRecord, ResourceTypeRecord, SearchSection, SortSpec, StructuralColumn, TableSection,
    TypeMetadata, DEFAULT_UNIQUE_KEY, ICON_TAG,
};
use gcsa_storage::{StorageError, StorageGateway};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "gcsa-assets";

const PROVIDER_KEY: &str = "provider";
const GROUP_KEY: &str = "cloud_service_group";
const TYPE_KEY: &str = "cloud_service_type";
const SIDECAR_YAML: &str = "metadata.yaml";
const SIDECAR_YML: &str = "metadata.yml";
const TABLE_SORT_KEY: &str = "name";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("metadata document is not a mapping")]
    NotAMapping,
}

/// Failures that stop a whole dataset. No rows or type record are produced.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset {0} has no csv data file")]
    MissingDataFile(DatasetIdentity),
    #[error("data file {path} not found")]
    DataFileNotFound { path: String },
    #[error("required parameter missing (key = {key})")]
    RequiredParameter { key: String },
    #[error("duplicate column {column:?} in csv header")]
    DuplicateColumn { column: String },
    #[error("invalid csv: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A single bad row. Iteration over the dataset continues past it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("line {line}: required column `name` is empty")]
    MissingName { line: u64 },
    #[error("line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: {message}")]
    Record { line: u64, message: String },
}

impl RowError {
    pub fn line(&self) -> u64 {
        match self {
            RowError::MissingName { line }
            | RowError::FieldCount { line, .. }
            | RowError::Record { line, .. } => *line,
        }
    }
}

/// Splits `provider=P/cloud_service_group=G/cloud_service_type=T/<file>` into
/// its identity and file name.
pub fn parse_object_path(name: &str) -> Option<(DatasetIdentity, &str)> {
    let mut segments = name.split('/');
    let provider = prefix_value(segments.next()?, PROVIDER_KEY)?;
    let group = prefix_value(segments.next()?, GROUP_KEY)?;
    let service_type = prefix_value(segments.next()?, TYPE_KEY)?;
    let file_name = segments.next().filter(|f| !f.is_empty())?;
    if segments.next().is_some() {
        return None;
    }
    Some((
        DatasetIdentity {
            provider: provider.to_string(),
            cloud_service_group: group.to_string(),
            cloud_service_type: service_type.to_string(),
        },
        file_name,
    ))
}

fn prefix_value<'a>(segment: &'a str, key: &str) -> Option<&'a str> {
    let (k, v) = segment.split_once('=')?;
    (k == key && !v.is_empty()).then_some(v)
}

enum ObjectKind {
    Data,
    Sidecar { preferred: bool },
    Other,
}

fn classify(file_name: &str) -> ObjectKind {
    match file_name {
        SIDECAR_YAML => ObjectKind::Sidecar { preferred: true },
        SIDECAR_YML => ObjectKind::Sidecar { preferred: false },
        f if f.ends_with(".csv") => ObjectKind::Data,
        _ => ObjectKind::Other,
    }
}

/// Groups object names into datasets in order of first appearance.
///
/// The first CSV of a group is its data file and `metadata.yaml` beats
/// `metadata.yml`; losers are recorded in `ignored_files`. When no dataset in
/// the listing has a sidecar, the first dataset is marked primary.
pub fn discover_datasets<I, S>(object_names: I) -> Vec<DatasetDescriptor>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut datasets: Vec<DatasetDescriptor> = Vec::new();
    let mut index: HashMap<DatasetIdentity, usize> = HashMap::new();

    for object in object_names {
        let object = object.as_ref();
        let Some((identity, file_name)) = parse_object_path(object) else {
            debug!(object, "skipping object outside the asset layout");
            continue;
        };
        let slot = *index.entry(identity).or_insert_with_key(|identity| {
            datasets.push(DatasetDescriptor::new(
                identity.provider.clone(),
                identity.cloud_service_group.clone(),
                identity.cloud_service_type.clone(),
            ));
            datasets.len() - 1
        });
        let dataset = &mut datasets[slot];

        match classify(file_name) {
            ObjectKind::Data => match &dataset.csv_file_path {
                None => dataset.csv_file_path = Some(object.to_string()),
                Some(kept) => {
                    warn!(kept = %kept, ignored = object, "dataset has more than one csv; keeping the first");
                    dataset.ignored_files.push(object.to_string());
                }
            },
            ObjectKind::Sidecar { preferred } => match dataset.metadata_file_path.take() {
                None => dataset.metadata_file_path = Some(object.to_string()),
                Some(existing) => {
                    let (kept, ignored) = if preferred {
                        (object.to_string(), existing)
                    } else {
                        (existing, object.to_string())
                    };
                    warn!(kept = %kept, ignored = %ignored, "dataset has two metadata sidecars; keeping metadata.yaml");
                    dataset.ignored_files.push(ignored);
                    dataset.metadata_file_path = Some(kept);
                }
            },
            ObjectKind::Other => debug!(object, "ignoring non-asset file"),
        }
    }

    if !datasets.iter().any(|d| d.metadata_file_path.is_some()) {
        if let Some(first) = datasets.first_mut() {
            first.is_primary = true;
        }
    }

    datasets
}

pub async fn discover(
    gateway: &dyn StorageGateway,
    bucket: &str,
) -> Result<Vec<DatasetDescriptor>, StorageError> {
    let objects = gateway.list_objects(bucket).await?;
    let datasets = discover_datasets(&objects);
    if datasets.is_empty() {
        debug!(bucket, objects = objects.len(), "no assets found");
    } else {
        debug!(bucket, datasets = datasets.len(), "discovered datasets");
    }
    Ok(datasets)
}

/// Strict sidecar parse. An empty document is the default metadata.
pub fn try_parse_metadata(text: &str) -> Result<DatasetMetadata, MetadataError> {
    if text.trim().is_empty() {
        return Ok(DatasetMetadata::default());
    }
    match serde_yaml::from_str::<serde_yaml::Value>(text)? {
        serde_yaml::Value::Null => Ok(DatasetMetadata::default()),
        value @ serde_yaml::Value::Mapping(_) => Ok(serde_yaml::from_value(value)?),
        _ => Err(MetadataError::NotAMapping),
    }
}

/// Lenient sidecar parse: anything unreadable degrades to defaults.
pub fn parse_metadata(text: &str) -> DatasetMetadata {
    try_parse_metadata(text).unwrap_or_else(|err| {
        warn!(error = %err, "unreadable metadata sidecar; using defaults");
        DatasetMetadata::default()
    })
}

pub async fn resolve_metadata(
    gateway: &dyn StorageGateway,
    bucket: &str,
    descriptor: &DatasetDescriptor,
) -> DatasetMetadata {
    let Some(path) = descriptor.metadata_file_path.as_deref() else {
        return DatasetMetadata::default();
    };
    match gateway.get_object_text(bucket, path).await {
        Ok(Some(text)) => try_parse_metadata(&text).unwrap_or_else(|err| {
            warn!(path, error = %err, "unreadable metadata sidecar; using defaults");
            DatasetMetadata::default()
        }),
        Ok(None) => {
            debug!(path, "metadata sidecar vanished");
            DatasetMetadata::default()
        }
        Err(err) => {
            warn!(path, error = %err, "failed to fetch metadata sidecar; using defaults");
            DatasetMetadata::default()
        }
    }
}

/// `instance_id` -> `Instance Id`. Letters following a non-letter are upper-cased,
/// the rest lower-cased.
pub fn display_name(column: &str) -> String {
    let mut out = String::with_capacity(column.len());
    let mut in_word = false;
    for ch in column.chars() {
        let ch = if ch == '_' { ' ' } else { ch };
        if ch.is_alphabetic() {
            if in_word {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(ch);
            in_word = false;
        }
    }
    out
}

/// One field per non-structural column, in header order.
pub fn default_fields(columns: &[String], unique_key: &str) -> Vec<FieldSpec> {
    columns
        .iter()
        .filter(|c| !StructuralColumn::is_structural(c))
        .map(|c| FieldSpec::new(display_name(c), format!("data.{c}")).optional(c == unique_key))
        .collect()
}

struct RowLayout {
    descriptor: DatasetDescriptor,
    columns: Vec<String>,
    unique_key: String,
}

fn structural_text(raw: &str) -> Option<String> {
    (!CellValue::is_na(raw)).then(|| raw.to_string())
}

impl RowLayout {
    fn map_record(&self, record: &StringRecord) -> Result<ResourceRecord, RowError> {
        let line = record.position().map_or(0, Position::line);
        if record.len() != self.columns.len() {
            return Err(RowError::FieldCount {
                line,
                expected: self.columns.len(),
                found: record.len(),
            });
        }

        let mut name = None;
        let mut account = None;
        let mut region_code = None;
        let mut resource_id = None;
        let mut unique_value = None;
        let mut data = BTreeMap::new();

        for (column, raw) in self.columns.iter().zip(record.iter()) {
            match StructuralColumn::from_column(column) {
                Some(StructuralColumn::Name) => name = structural_text(raw),
                Some(StructuralColumn::Account) => account = structural_text(raw),
                Some(StructuralColumn::RegionCode) => region_code = structural_text(raw),
                Some(StructuralColumn::ResourceId) => resource_id = structural_text(raw),
                Some(StructuralColumn::UniqueId) => {}
                None => {
                    data.insert(column.clone(), CellValue::from_raw(raw));
                }
            }
            if *column == self.unique_key {
                unique_value = structural_text(raw);
            }
        }

        let name = name.ok_or(RowError::MissingName { line })?;
        let resource_id = resource_id
            .or(unique_value)
            .unwrap_or_else(|| self.descriptor.default_resource_id(&name));

        Ok(ResourceRecord {
            name,
            account,
            region_code,
            provider: self.descriptor.provider.clone(),
            cloud_service_group: self.descriptor.cloud_service_group.clone(),
            cloud_service_type: self.descriptor.cloud_service_type.clone(),
            data,
            reference: Reference { resource_id },
        })
    }
}

/// Lazily parsed rows of one dataset; each pull reads one CSV record.
pub struct DatasetRows {
    records: StringRecordsIntoIter<Cursor<Vec<u8>>>,
    layout: Arc<RowLayout>,
}

impl DatasetRows {
    pub fn columns(&self) -> &[String] {
        &self.layout.columns
    }
}

impl Iterator for DatasetRows {
    type Item = Result<ResourceRecord, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(match record {
            Ok(record) => self.layout.map_record(&record),
            Err(err) => Err(RowError::Record {
                line: err.position().map_or(0, Position::line),
                message: err.to_string(),
            }),
        })
    }
}

/// A dataset whose header and metadata have been validated and resolved.
pub struct PreparedDataset {
    resource_type: ResourceTypeRecord,
    rows: DatasetRows,
}

impl PreparedDataset {
    pub fn prepare(
        descriptor: &DatasetDescriptor,
        metadata: DatasetMetadata,
        mut csv_text: String,
    ) -> Result<Self, DatasetError> {
        if csv_text.starts_with('\u{feff}') {
            csv_text.replace_range(..'\u{feff}'.len_utf8(), "");
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(Cursor::new(csv_text.into_bytes()));
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();

        let mut seen = HashSet::new();
        if let Some(column) = columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(DatasetError::DuplicateColumn {
                column: column.clone(),
            });
        }
        if !columns.iter().any(|c| c == StructuralColumn::Name.as_str()) {
            return Err(DatasetError::RequiredParameter {
                key: StructuralColumn::Name.as_str().to_string(),
            });
        }

        let DatasetMetadata {
            icon,
            is_primary,
            unique_key,
            search,
            table,
        } = metadata;
        let unique_key = unique_key.unwrap_or_else(|| DEFAULT_UNIQUE_KEY.to_string());
        let is_primary = is_primary.unwrap_or(descriptor.is_primary);
        let search = search.unwrap_or_else(|| SearchSection {
            fields: default_fields(&columns, &unique_key),
            ..Default::default()
        });
        let table = table.unwrap_or_else(|| TableSection {
            sort: Some(SortSpec {
                key: TABLE_SORT_KEY.to_string(),
                desc: None,
            }),
            fields: default_fields(&columns, &unique_key),
            ..Default::default()
        });
        let tags = icon
            .map(|icon| BTreeMap::from([(ICON_TAG.to_string(), icon)]))
            .unwrap_or_default();

        let resource_type = ResourceTypeRecord {
            name: descriptor.cloud_service_type.clone(),
            group: descriptor.cloud_service_group.clone(),
            provider: descriptor.provider.clone(),
            metadata: TypeMetadata { search, table },
            is_primary,
            is_major: is_primary,
            service_code: None,
            tags,
            labels: Vec::new(),
        };

        let layout = Arc::new(RowLayout {
            descriptor: descriptor.clone(),
            columns,
            unique_key,
        });
        Ok(Self {
            resource_type,
            rows: DatasetRows {
                records: reader.into_records(),
                layout,
            },
        })
    }

    pub fn resource_type(&self) -> &ResourceTypeRecord {
        &self.resource_type
    }

    pub fn columns(&self) -> &[String] {
        self.rows.columns()
    }

    pub fn into_parts(self) -> (ResourceTypeRecord, DatasetRows) {
        (self.resource_type, self.rows)
    }
}

/// Fetches sidecar and data file for one descriptor and prepares it.
pub async fn load_dataset(
    gateway: &dyn StorageGateway,
    bucket: &str,
    descriptor: &DatasetDescriptor,
) -> Result<PreparedDataset, DatasetError> {
    let csv_path = descriptor
        .csv_file_path
        .as_deref()
        .ok_or_else(|| DatasetError::MissingDataFile(descriptor.identity()))?;
    let metadata = resolve_metadata(gateway, bucket, descriptor).await;
    let text = gateway
        .get_object_text(bucket, csv_path)
        .await?
        .ok_or_else(|| DatasetError::DataFileNotFound {
            path: csv_path.to_string(),
        })?;
    debug!(dataset = %descriptor.identity(), path = csv_path, bytes = text.len(), "loaded data file");
    PreparedDataset::prepare(descriptor, metadata, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcsa_storage::MemoryGateway;

    const PREFIX: &str = "provider=google_cloud/cloud_service_group=compute/cloud_service_type=instance";

    fn instance_descriptor() -> DatasetDescriptor {
        DatasetDescriptor::new("google_cloud", "compute", "instance")
    }

    fn rows_of(dataset: PreparedDataset) -> Vec<Result<ResourceRecord, RowError>> {
        dataset.into_parts().1.collect()
    }

    #[test]
    fn groups_by_prefix_in_first_appearance_order() {
        let names = vec![
            format!("{PREFIX}/vms.csv"),
            "provider=aws/cloud_service_group=ec2/cloud_service_type=host/hosts.csv".to_string(),
            format!("{PREFIX}/metadata.yaml"),
            "README.md".to_string(),
            "provider=aws/cloud_service_group=ec2/extra/cloud_service_type=host/x.csv".to_string(),
            "provider=/cloud_service_group=ec2/cloud_service_type=host/x.csv".to_string(),
            "region=x/cloud_service_group=ec2/cloud_service_type=host/x.csv".to_string(),
            "provider=aws/cloud_service_group=s3/cloud_service_type=bucket/notes.txt".to_string(),
        ];
        let datasets = discover_datasets(&names);

        assert_eq!(datasets.len(), 3);
        assert_eq!(datasets[0].cloud_service_type, "instance");
        assert_eq!(datasets[0].csv_file_path.as_deref(), Some(names[0].as_str()));
        assert_eq!(datasets[0].metadata_file_path.as_deref(), Some(names[2].as_str()));
        assert_eq!(datasets[1].provider, "aws");
        assert!(datasets[2].csv_file_path.is_none());
        assert!(!datasets[2].is_collectible());
        assert!(datasets.iter().all(|d| !d.is_primary));
    }

    #[test]
    fn first_csv_wins_and_yaml_beats_yml() {
        let names = [
            format!("{PREFIX}/metadata.yml"),
            format!("{PREFIX}/b.csv"),
            format!("{PREFIX}/a.csv"),
            format!("{PREFIX}/metadata.yaml"),
        ];
        let datasets = discover_datasets(&names);

        assert_eq!(datasets.len(), 1);
        let dataset = &datasets[0];
        assert_eq!(dataset.csv_file_path.as_deref(), Some(names[1].as_str()));
        assert_eq!(dataset.metadata_file_path.as_deref(), Some(names[3].as_str()));
        assert_eq!(dataset.ignored_files, vec![names[2].clone(), names[0].clone()]);
    }

    #[test]
    fn first_dataset_is_primary_only_when_no_sidecar_exists() {
        let names = [
            format!("{PREFIX}/vms.csv"),
            "provider=google_cloud/cloud_service_group=storage/cloud_service_type=bucket/b.csv"
                .to_string(),
        ];
        let datasets = discover_datasets(&names);
        assert!(datasets[0].is_primary);
        assert!(!datasets[1].is_primary);

        let mut with_sidecar = names.to_vec();
        with_sidecar.push(
            "provider=google_cloud/cloud_service_group=storage/cloud_service_type=bucket/metadata.yaml"
                .to_string(),
        );
        assert!(discover_datasets(&with_sidecar).iter().all(|d| !d.is_primary));
        assert!(discover_datasets(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn metadata_parsing_degrades_to_defaults() {
        assert_eq!(parse_metadata(""), DatasetMetadata::default());
        assert_eq!(parse_metadata("icon: [unclosed"), DatasetMetadata::default());
        assert_eq!(parse_metadata("- a\n- b\n"), DatasetMetadata::default());
        assert_eq!(parse_metadata("is_primary: {nested: 1}\n"), DatasetMetadata::default());

        let metadata = parse_metadata(
            "icon: https://example.com/vm.svg\nis_primary: true\nunique_key: instance_id\nowner: infra\n",
        );
        assert_eq!(metadata.icon.as_deref(), Some("https://example.com/vm.svg"));
        assert_eq!(metadata.is_primary, Some(true));
        assert_eq!(metadata.unique_key.as_deref(), Some("instance_id"));
        assert!(metadata.search.is_none());
    }

    #[test]
    fn display_names_are_title_cased() {
        assert_eq!(display_name("instance_id"), "Instance Id");
        assert_eq!(display_name("IP_address"), "Ip Address");
        assert_eq!(display_name("disk2size"), "Disk2Size");
        assert_eq!(display_name("zone"), "Zone");
    }

    #[test]
    fn derives_schema_from_non_structural_columns() {
        let csv = "name,account,instance_id,machine_type,region_code\nvm-1,acct,0042,e2-small,us-east1\n";
        let metadata = DatasetMetadata {
            unique_key: Some("instance_id".into()),
            ..Default::default()
        };
        let dataset = PreparedDataset::prepare(&instance_descriptor(), metadata, csv.into()).unwrap();
        let record = dataset.resource_type();

        let expected = vec![
            FieldSpec::new("Instance Id", "data.instance_id").optional(true),
            FieldSpec::new("Machine Type", "data.machine_type"),
        ];
        assert_eq!(record.metadata.search.fields, expected);
        assert_eq!(record.metadata.table.fields, expected);
        assert_eq!(record.metadata.table.sort.as_ref().map(|s| s.key.as_str()), Some("name"));
        assert!(!record.is_primary);
        assert!(record.tags.is_empty());

        let rows = rows_of(dataset);
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.resource_id(), "0042");
        assert_eq!(row.account.as_deref(), Some("acct"));
        assert_eq!(row.region_code.as_deref(), Some("us-east1"));
        assert_eq!(row.data.get("instance_id"), Some(&CellValue::Text("0042".into())));
        assert!(!row.data.contains_key("name"));
    }

    #[test]
    fn sidecar_sections_pass_through_unchanged() {
        let metadata = parse_metadata(
            "icon: vm.svg\nis_primary: true\nsearch:\n  fields:\n    - VM: data.vm\ntable:\n  fields:\n    - Zone: data.zone\n",
        );
        let dataset =
            PreparedDataset::prepare(&instance_descriptor(), metadata, "name,zone\nvm-1,a\n".into())
                .unwrap();
        let record = dataset.resource_type();

        assert_eq!(record.metadata.search.fields, vec![FieldSpec::new("VM", "data.vm")]);
        assert_eq!(record.metadata.table.fields, vec![FieldSpec::new("Zone", "data.zone")]);
        assert!(record.metadata.table.sort.is_none());
        assert!(record.is_primary && record.is_major);
        assert_eq!(record.tags.get(ICON_TAG).map(String::as_str), Some("vm.svg"));
    }

    #[test]
    fn header_without_name_is_dataset_fatal() {
        let err = PreparedDataset::prepare(
            &instance_descriptor(),
            DatasetMetadata::default(),
            "id,zone\n1,a\n".into(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DatasetError::RequiredParameter { ref key } if key == "name"));

        let err = PreparedDataset::prepare(
            &instance_descriptor(),
            DatasetMetadata::default(),
            "name,zone,zone\nvm,a,b\n".into(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DatasetError::DuplicateColumn { ref column } if column == "zone"));
    }

    #[test]
    fn resource_id_precedence_and_row_errors() {
        let csv = "\u{feff}name,resource_id,unique_id,cpus,ratio,enabled,note\n\
                   vm-1,rid-1,uid-1,4,0.5,true,NaN\n\
                   vm-2,,uid-2,2,1.5,FALSE,\n\
                   vm-3,,,1,x,no,ok\n\
                   ,,,1,1,true,missing name\n\
                   vm-5,too,short\n\
                   vm-6,NA,null,8,2,false,N/A\n";
        let dataset =
            PreparedDataset::prepare(&instance_descriptor(), DatasetMetadata::default(), csv.into())
                .unwrap();
        let rows = rows_of(dataset);
        assert_eq!(rows.len(), 6);

        let first = rows[0].as_ref().unwrap();
        assert_eq!(first.resource_id(), "rid-1");
        assert_eq!(first.data.get("cpus"), Some(&CellValue::Text("4".into())));
        assert_eq!(first.data.get("ratio"), Some(&CellValue::Text("0.5".into())));
        assert_eq!(first.data.get("enabled"), Some(&CellValue::Text("true".into())));
        assert_eq!(first.data.get("note"), Some(&CellValue::Null));
        assert!(!first.data.contains_key("unique_id"));

        assert_eq!(rows[1].as_ref().unwrap().resource_id(), "uid-2");
        assert_eq!(
            rows[2].as_ref().unwrap().resource_id(),
            "google_cloud:compute:instance:vm-3"
        );
        assert_eq!(rows[3], Err(RowError::MissingName { line: 5 }));
        assert_eq!(
            rows[4],
            Err(RowError::FieldCount {
                line: 6,
                expected: 7,
                found: 3
            })
        );
        assert_eq!(
            rows[5].as_ref().unwrap().resource_id(),
            "google_cloud:compute:instance:vm-6"
        );
    }

    #[test]
    fn unique_key_column_matches_its_data_cell() {
        let csv = "name,instance_id,version\nvm-1,0001,1.10\n";
        let metadata = DatasetMetadata {
            unique_key: Some("instance_id".into()),
            ..Default::default()
        };
        let dataset = PreparedDataset::prepare(&instance_descriptor(), metadata, csv.into()).unwrap();
        let rows = rows_of(dataset);
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.resource_id(), "0001");
        assert_eq!(
            row.data.get("instance_id").and_then(CellValue::as_text),
            Some(row.resource_id())
        );
        assert_eq!(row.data.get("version"), Some(&CellValue::Text("1.10".into())));
    }

    #[test]
    fn sidecar_field_options_survive_in_any_position() {
        let metadata = parse_metadata(
            "search:\n  fields:\n    - type: enum\n      Zone: data.zone\ntable:\n  layout: compact\n  fields:\n    - Zone: data.zone\n",
        );
        let dataset =
            PreparedDataset::prepare(&instance_descriptor(), metadata, "name,zone\nvm-1,a\n".into())
                .unwrap();
        let record = dataset.resource_type();

        let field = &record.metadata.search.fields[0];
        assert_eq!((field.name(), field.key()), ("Zone", "data.zone"));
        let keys: Vec<_> = field.entries().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["type", "Zone"]);
        assert_eq!(
            record.metadata.table.extra.get("layout").and_then(|v| v.as_str()),
            Some("compact")
        );
    }

    #[test]
    fn structural_columns_keep_raw_text() {
        let csv = "name,account\n007,000123\n";
        let dataset =
            PreparedDataset::prepare(&instance_descriptor(), DatasetMetadata::default(), csv.into())
                .unwrap();
        let rows = rows_of(dataset);
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.name, "007");
        assert_eq!(row.account.as_deref(), Some("000123"));
        assert!(row.data.is_empty());
    }

    #[tokio::test]
    async fn load_dataset_reports_missing_objects() {
        let gateway = MemoryGateway::new()
            .with_object("assets", format!("{PREFIX}/vms.csv"), "name\nvm-1\n")
            .with_object("assets", format!("{PREFIX}/metadata.yaml"), "icon: [broken");
        let datasets = discover(&gateway, "assets").await.unwrap();
        assert_eq!(datasets.len(), 1);

        let dataset = load_dataset(&gateway, "assets", &datasets[0]).await.unwrap();
        assert_eq!(dataset.columns(), ["name".to_string()]);
        assert_eq!(dataset.resource_type().metadata.search.fields, Vec::new());

        let mut gone = datasets[0].clone();
        gone.csv_file_path = Some(format!("{PREFIX}/gone.csv"));
        assert!(matches!(
            load_dataset(&gateway, "assets", &gone).await,
            Err(DatasetError::DataFileNotFound { .. })
        ));

        let mut empty = datasets[0].clone();
        empty.csv_file_path = None;
        assert!(matches!(
            load_dataset(&gateway, "assets", &empty).await,
            Err(DatasetError::MissingDataFile(_))
        ));
    }
}
