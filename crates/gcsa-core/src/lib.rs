//! Core domain model for the GCS asset collector: dataset descriptors, sidecar
//! metadata, normalized resource records and the platform response envelope.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "gcsa-core";

/// Provider reported when nothing more specific is known.
pub const DEFAULT_PROVIDER: &str = "google_cloud";
/// Column consulted for the resource identity when the sidecar names no unique key.
pub const DEFAULT_UNIQUE_KEY: &str = "unique_id";
pub const ICON_TAG: &str = "spaceone:icon";
pub const IS_OPTIONAL_KEY: &str = "is_optional";

pub const CLOUD_SERVICE_MATCH_KEYS: [&str; 4] = [
    "reference.resource_id",
    "provider",
    "cloud_service_type",
    "cloud_service_group",
];
pub const CLOUD_SERVICE_TYPE_MATCH_KEYS: [&str; 3] = ["name", "group", "provider"];

/// Cell spellings read as missing values.
pub const NA_TOKENS: [&str; 19] = [
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN", "<NA>",
    "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null", "",
];

/// CSV columns with fixed meaning. Everything else lands in `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructuralColumn {
    Name,
    Account,
    RegionCode,
    UniqueId,
    ResourceId,
}

impl StructuralColumn {
    pub const ALL: [StructuralColumn; 5] = [
        StructuralColumn::Name,
        StructuralColumn::Account,
        StructuralColumn::RegionCode,
        StructuralColumn::UniqueId,
        StructuralColumn::ResourceId,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StructuralColumn::Name => "name",
            StructuralColumn::Account => "account",
            StructuralColumn::RegionCode => "region_code",
            StructuralColumn::UniqueId => "unique_id",
            StructuralColumn::ResourceId => "resource_id",
        }
    }

    /// Exact membership test; `names` or `name_tag` are plain data columns.
    pub fn from_column(column: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == column)
    }

    pub fn is_structural(column: &str) -> bool {
        Self::from_column(column).is_some()
    }
}

impl fmt::Display for StructuralColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One table cell, kept exactly as written in the CSV. `Null` is the
/// missing-value sentinel for empty cells and NA spellings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Text(String),
}

impl CellValue {
    pub fn is_na(raw: &str) -> bool {
        NA_TOKENS.contains(&raw)
    }

    pub fn from_raw(raw: &str) -> Self {
        if Self::is_na(raw) {
            CellValue::Null
        } else {
            CellValue::Text(raw.to_string())
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Null => None,
            CellValue::Text(text) => Some(text),
        }
    }
}

/// Identity shared by everything produced from one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetIdentity {
    pub provider: String,
    pub cloud_service_group: String,
    pub cloud_service_type: String,
}

impl fmt::Display for DatasetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} > {} > {}",
            self.provider, self.cloud_service_group, self.cloud_service_type
        )
    }
}

/// One logical CSV dataset found under a `provider=/cloud_service_group=/cloud_service_type=` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub provider: String,
    pub cloud_service_group: String,
    pub cloud_service_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_file_path: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
    /// Files that lost the data-file or sidecar selection rule.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_files: Vec<String>,
}

impl DatasetDescriptor {
    pub fn new(
        provider: impl Into<String>,
        cloud_service_group: impl Into<String>,
        cloud_service_type: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            cloud_service_group: cloud_service_group.into(),
            cloud_service_type: cloud_service_type.into(),
            csv_file_path: None,
            metadata_file_path: None,
            is_primary: false,
            ignored_files: Vec::new(),
        }
    }

    pub fn identity(&self) -> DatasetIdentity {
        DatasetIdentity {
            provider: self.provider.clone(),
            cloud_service_group: self.cloud_service_group.clone(),
            cloud_service_type: self.cloud_service_type.clone(),
        }
    }

    pub fn is_collectible(&self) -> bool {
        self.csv_file_path.is_some()
    }

    /// Identity used when a row carries neither `resource_id` nor a unique-key value.
    pub fn default_resource_id(&self, name: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.provider, self.cloud_service_group, self.cloud_service_type, name
        )
    }
}

/// Per-field option keys that never name a display column.
pub const FIELD_OPTION_KEYS: [&str; 9] = [
    IS_OPTIONAL_KEY,
    "type",
    "enums",
    "reference",
    "options",
    "default",
    "sort_key",
    "delimiter",
    "labels",
];

/// A `{display name: source key}` entry of a search or table schema.
///
/// The sidecar mapping is kept entry by entry in source order and written back
/// unchanged, so options such as `type` or `enums` survive in any position.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    entries: Vec<(String, JsonValue)>,
    display: usize,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entries: vec![(name.into(), JsonValue::String(key.into()))],
            display: 0,
        }
    }

    pub fn optional(mut self, is_optional: bool) -> Self {
        self.entries.retain(|(k, _)| k != IS_OPTIONAL_KEY);
        if is_optional {
            self.entries
                .push((IS_OPTIONAL_KEY.to_string(), JsonValue::Bool(true)));
        }
        self
    }

    /// Builds a field from raw mapping entries. The display pair is the first
    /// string-valued entry that is not a known option, falling back to the first
    /// string-valued entry of any kind.
    pub fn from_entries(entries: Vec<(String, JsonValue)>) -> Option<Self> {
        let is_pair = |(_, v): &(String, JsonValue)| v.is_string();
        let display = entries
            .iter()
            .position(|e| is_pair(e) && !FIELD_OPTION_KEYS.contains(&e.0.as_str()))
            .or_else(|| entries.iter().position(is_pair))?;
        Some(Self { entries, display })
    }

    pub fn name(&self) -> &str {
        &self.entries[self.display].0
    }

    pub fn key(&self) -> &str {
        self.entries[self.display].1.as_str().unwrap_or_default()
    }

    pub fn is_optional(&self) -> bool {
        self.option(IS_OPTIONAL_KEY)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Any entry other than the display pair.
    pub fn option(&self, key: &str) -> Option<&JsonValue> {
        self.entries
            .iter()
            .enumerate()
            .find(|(i, (k, _))| *i != self.display && k == key)
            .map(|(_, (_, v))| v)
    }

    pub fn entries(&self) -> &[(String, JsonValue)] {
        &self.entries
    }
}

impl Serialize for FieldSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldSpecVisitor;

        impl<'de> Visitor<'de> for FieldSpecVisitor {
            type Value = FieldSpec;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of display name to source key")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FieldSpec, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, JsonValue>()? {
                    if key == IS_OPTIONAL_KEY && !value.is_boolean() {
                        return Err(de::Error::custom("`is_optional` must be a boolean"));
                    }
                    entries.push((key, value));
                }
                FieldSpec::from_entries(entries).ok_or_else(|| {
                    de::Error::custom("field entry needs a `display name: source key` pair")
                })
            }
        }

        deserializer.deserialize_map(FieldSpecVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SearchSection {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Section keys other than `fields`, passed through.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TableSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// Contents of a `metadata.yaml` sidecar. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatasetMetadata {
    pub icon: Option<String>,
    pub is_primary: Option<bool>,
    pub unique_key: Option<String>,
    pub search: Option<SearchSection>,
    pub table: Option<TableSection>,
}

/// Schema metadata attached to a cloud service type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TypeMetadata {
    pub search: SearchSection,
    pub table: TableSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub resource_id: String,
}

/// Canonical cloud service built from one CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_code: Option<String>,
    pub provider: String,
    pub cloud_service_group: String,
    pub cloud_service_type: String,
    pub data: BTreeMap<String, CellValue>,
    pub reference: Reference,
}

impl ResourceRecord {
    pub fn resource_id(&self) -> &str {
        &self.reference.resource_id
    }
}

/// Schema record for one dataset's cloud service type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeRecord {
    pub name: String,
    pub group: String,
    pub provider: String,
    pub metadata: TypeMetadata,
    pub is_primary: bool,
    pub is_major: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_code: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "inventory.CloudService")]
    CloudService,
    #[serde(rename = "inventory.CloudServiceType")]
    CloudServiceType,
    #[serde(rename = "inventory.Region")]
    Region,
    #[serde(rename = "inventory.ErrorResource")]
    ErrorResource,
}

impl ResourceKind {
    pub const SUPPORTED: [ResourceKind; 4] = [
        ResourceKind::CloudService,
        ResourceKind::CloudServiceType,
        ResourceKind::Region,
        ResourceKind::ErrorResource,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::CloudService => "inventory.CloudService",
            ResourceKind::CloudServiceType => "inventory.CloudServiceType",
            ResourceKind::Region => "inventory.Region",
            ResourceKind::ErrorResource => "inventory.ErrorResource",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseState {
    Success,
    Failure,
}

/// Failure context: whatever part of the dataset identity was known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResource {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_service_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_service_type: Option<String>,
    pub resource_type: ResourceKind,
}

impl ErrorResource {
    pub fn for_dataset(identity: &DatasetIdentity) -> Self {
        Self {
            provider: identity.provider.clone(),
            cloud_service_group: Some(identity.cloud_service_group.clone()),
            cloud_service_type: Some(identity.cloud_service_type.clone()),
            resource_type: ResourceKind::CloudService,
        }
    }

    pub fn for_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            cloud_service_group: None,
            cloud_service_type: None,
            resource_type: ResourceKind::CloudService,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Resource {
    CloudService(ResourceRecord),
    CloudServiceType(ResourceTypeRecord),
    Error(ErrorResource),
}

/// One item of the collect response stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub state: ResponseState,
    pub message: String,
    pub resource_type: ResourceKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_keys: Vec<Vec<String>>,
    pub resource: Resource,
}

impl Envelope {
    pub fn success(resource_type: ResourceKind, match_keys: &[&str], resource: Resource) -> Self {
        Self {
            state: ResponseState::Success,
            message: String::new(),
            resource_type,
            match_keys: vec![match_keys.iter().map(|k| k.to_string()).collect()],
            resource,
        }
    }

    pub fn error(message: impl Into<String>, resource: ErrorResource) -> Self {
        Self {
            state: ResponseState::Failure,
            message: message.into(),
            resource_type: ResourceKind::ErrorResource,
            match_keys: Vec::new(),
            resource: Resource::Error(resource),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ResponseState::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_columns_match_by_exact_name() {
        for column in StructuralColumn::ALL {
            assert!(StructuralColumn::is_structural(column.as_str()));
        }
        assert!(!StructuralColumn::is_structural("name_tag"));
        assert!(!StructuralColumn::is_structural("data.name"));
        assert!(!StructuralColumn::is_structural("Name"));
        assert_eq!(
            StructuralColumn::from_column("region_code"),
            Some(StructuralColumn::RegionCode)
        );
    }

    #[test]
    fn cells_keep_raw_text_and_normalize_na() {
        assert_eq!(CellValue::from_raw(""), CellValue::Null);
        assert_eq!(CellValue::from_raw("NaN"), CellValue::Null);
        assert_eq!(CellValue::from_raw("n/a"), CellValue::Null);
        assert_eq!(CellValue::from_raw("NAN"), CellValue::Text("NAN".into()));
        assert_eq!(CellValue::from_raw("0001"), CellValue::Text("0001".into()));
        assert_eq!(CellValue::from_raw("1.10"), CellValue::Text("1.10".into()));
        assert_eq!(CellValue::from_raw("TRUE").as_text(), Some("TRUE"));
    }

    #[test]
    fn null_cells_serialize_as_json_null() {
        let mut data = BTreeMap::new();
        data.insert("zone".to_string(), CellValue::Null);
        data.insert("cpus".to_string(), CellValue::from_raw("4"));
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json, serde_json::json!({"cpus": "4", "zone": null}));
    }

    #[test]
    fn field_spec_reads_single_entry_mapping_with_optional_marker() {
        let yaml = "- Instance ID: data.instance_id\n  is_optional: true\n- Zone: data.zone\n  type: enum\n";
        let fields: Vec<FieldSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name(), "Instance ID");
        assert_eq!(fields[0].key(), "data.instance_id");
        assert!(fields[0].is_optional());
        assert_eq!(fields[1].option("type"), Some(&JsonValue::from("enum")));

        let json = serde_json::to_value(&fields[0]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Instance ID": "data.instance_id", "is_optional": true})
        );
    }

    #[test]
    fn field_spec_with_leading_option_keeps_display_pair_and_order() {
        let yaml = "type: enum\nZone: data.zone\nenums:\n  - a\n  - b\n";
        let field: FieldSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(field.name(), "Zone");
        assert_eq!(field.key(), "data.zone");
        assert!(!field.is_optional());
        assert_eq!(field.option("type"), Some(&JsonValue::from("enum")));

        let keys: Vec<_> = field.entries().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["type", "Zone", "enums"]);
        let reparsed: FieldSpec =
            serde_json::from_str(&serde_json::to_string(&field).unwrap()).unwrap();
        assert_eq!(reparsed, field);
    }

    #[test]
    fn field_spec_without_pair_is_rejected() {
        let err = serde_yaml::from_str::<FieldSpec>("is_optional: true\n");
        assert!(err.is_err());
    }

    #[test]
    fn sections_keep_unrecognized_keys() {
        let yaml = "sort:\n  key: name\nlayout: compact\nfields:\n  - Zone: data.zone\n";
        let table: TableSection = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table.extra.get("layout"), Some(&JsonValue::from("compact")));
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["layout"], "compact");
        assert_eq!(json["fields"], serde_json::json!([{"Zone": "data.zone"}]));
    }

    #[test]
    fn error_envelope_has_failure_state_and_no_match_keys() {
        let identity = DatasetDescriptor::new("google_cloud", "compute", "instance").identity();
        let envelope = Envelope::error("boom", ErrorResource::for_dataset(&identity));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["state"], "FAILURE");
        assert_eq!(json["resource_type"], "inventory.ErrorResource");
        assert_eq!(json["resource"]["cloud_service_group"], "compute");
        assert_eq!(json["resource"]["resource_type"], "inventory.CloudService");
        assert!(json.get("match_keys").is_none());
    }

    #[test]
    fn default_resource_id_joins_identity_and_name() {
        let descriptor = DatasetDescriptor::new("google_cloud", "compute", "instance");
        assert_eq!(
            descriptor.default_resource_id("vm-1"),
            "google_cloud:compute:instance:vm-1"
        );
    }
}
