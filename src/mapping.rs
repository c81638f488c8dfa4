//! Table-driven mapping from decoded rows to events
//!
//! A [`ResourceRegistry`] is loaded from YAML and lists which tables hold
//! resources and which hold references between resources:
//!
//! ```yaml
//! resources:
//!   - table: virtual_network
//!     kind: virtual_network
//!     fqn_column: fq_name
//!     version_column: configuration_version
//! references:
//!   - table: ref_virtual_machine_interface_virtual_network
//!     kind: virtual_machine_interface_virtual_network
//!     from_column: from
//!     to_column: to
//!     to_kind: virtual_network
//! ```
//!
//! Tables are matched by `schema.table` first, then by bare table name.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use etcd_sync_pgoutput::DecodedRow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{Event, Operation, Reference};
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMapping {
    pub table: String,
    pub kind: String,
    /// Column holding the fully qualified name (JSON array or `a:b:c`)
    #[serde(default)]
    pub fqn_column: Option<String>,
    /// Column holding the resource version
    #[serde(default)]
    pub version_column: Option<String>,
    /// Column name to payload field name
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// Columns left out of the payload
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMapping {
    pub table: String,
    pub kind: String,
    pub from_column: String,
    pub to_column: String,
    /// Resource kind of the reference target
    pub to_kind: String,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRegistry {
    #[serde(default)]
    pub resources: Vec<ResourceMapping>,
    #[serde(default)]
    pub references: Vec<ReferenceMapping>,
}

impl ResourceRegistry {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SyncError> {
        let registry: ResourceRegistry =
            serde_yaml::from_str(yaml).map_err(|e| SyncError::Config(e.to_string()))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let mut seen = HashMap::new();
        let tables = self
            .resources
            .iter()
            .map(|r| (&r.table, &r.kind))
            .chain(self.references.iter().map(|r| (&r.table, &r.kind)));
        for (table, kind) in tables {
            if table.is_empty() || kind.is_empty() {
                return Err(SyncError::Config(
                    "registry entries need a table and a kind".into(),
                ));
            }
            if seen.insert(table.as_str(), ()).is_some() {
                return Err(SyncError::Config(format!("table {table} mapped twice")));
            }
        }
        Ok(())
    }

    /// Returns true if the table is mapped as a reference table.
    pub fn is_reference(&self, namespace: &str, table: &str) -> bool {
        let qualified = format!("{namespace}.{table}");
        self.references
            .iter()
            .any(|r| r.table == qualified || r.table == table)
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Resource(usize),
    Reference(usize),
}

/// Turns decoded rows into [`Event`]s.
///
/// Deterministic and side-effect free; rows of unmapped tables are rejected.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    registry: Arc<ResourceRegistry>,
    tables: HashMap<String, Target>,
}

impl EventDecoder {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        let mut tables = HashMap::new();
        for (i, resource) in registry.resources.iter().enumerate() {
            tables.insert(resource.table.clone(), Target::Resource(i));
        }
        for (i, reference) in registry.references.iter().enumerate() {
            tables.insert(reference.table.clone(), Target::Reference(i));
        }
        Self { registry, tables }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Returns true if rows of the table can be decoded.
    pub fn knows(&self, namespace: &str, table: &str) -> bool {
        self.target(namespace, table).is_some()
    }

    fn target(&self, namespace: &str, table: &str) -> Option<Target> {
        self.tables
            .get(&format!("{namespace}.{table}"))
            .or_else(|| self.tables.get(table))
            .copied()
    }

    pub fn decode(&self, operation: Operation, row: &DecodedRow) -> Result<Event, SyncError> {
        match self.target(&row.namespace, &row.table) {
            Some(Target::Resource(i)) => {
                decode_resource(&self.registry.resources[i], operation, row)
            }
            Some(Target::Reference(i)) => {
                decode_reference(&self.registry.references[i], operation, row)
            }
            None => Err(SyncError::UnknownTable(format!(
                "{}.{}",
                row.namespace, row.table
            ))),
        }
    }
}

fn decode_resource(
    mapping: &ResourceMapping,
    operation: Operation,
    row: &DecodedRow,
) -> Result<Event, SyncError> {
    let mut event = Event::new(operation, &mapping.kind, row.primary_key.clone());
    if operation == Operation::Delete {
        return Ok(event);
    }

    for (column, value) in &row.values {
        if row.key_columns.contains(column) || mapping.exclude.contains(column) {
            continue;
        }
        if mapping.version_column.as_ref() == Some(column) {
            event.version = parse_version(value).ok_or_else(|| SyncError::Mapping {
                table: row.table.clone(),
                reason: format!("version column {column} is not an integer: {value}"),
            })?;
            continue;
        }
        if mapping.fqn_column.as_ref() == Some(column) {
            event.fq_name = parse_fq_name(value);
        }
        let field = mapping.rename.get(column).unwrap_or(column);
        event.payload.insert(field.clone(), value.clone());
    }
    Ok(event)
}

fn decode_reference(
    mapping: &ReferenceMapping,
    operation: Operation,
    row: &DecodedRow,
) -> Result<Event, SyncError> {
    let from = row.values.get(&mapping.from_column).and_then(value_text);
    let to = row.values.get(&mapping.to_column).and_then(value_text);

    let mut event = Event::new(operation, &mapping.kind, row.primary_key.clone());
    match (from, to) {
        (Some(from_uuid), Some(to_uuid)) => {
            event.reference = Some(Reference {
                from_uuid,
                to_kind: mapping.to_kind.clone(),
                to_uuid,
            });
        }
        // Deletes only need the key
        _ if operation == Operation::Delete => {}
        _ => {
            return Err(SyncError::Mapping {
                table: row.table.clone(),
                reason: format!(
                    "reference columns {} and {} must both be set",
                    mapping.from_column, mapping.to_column
                ),
            })
        }
    }
    if operation == Operation::Delete {
        return Ok(event);
    }

    let mut payload = Map::new();
    for (column, value) in &row.values {
        let skip = row.key_columns.contains(column)
            || mapping.exclude.contains(column)
            || *column == mapping.from_column
            || *column == mapping.to_column;
        if !skip {
            payload.insert(column.clone(), value.clone());
        }
    }
    Ok(event.with_payload(payload))
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_version(value: &Value) -> Option<i64> {
    match value {
        Value::Null => Some(0),
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Accepts a JSON array of strings, a string holding one, or `a:b:c`.
fn parse_fq_name(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => items.iter().map(value_text).collect(),
        Value::String(s) if s.starts_with('[') => serde_json::from_str::<Vec<String>>(s).ok(),
        Value::String(s) if !s.is_empty() => Some(s.split(':').map(str::to_string).collect()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REGISTRY: &str = r#"
resources:
  - table: vn
    kind: virtual_network
    fqn_column: fq_name
    version_column: configuration_version
    rename:
      display_name: name
    exclude: [created_at]
  - table: public.project
    kind: project
references:
  - table: ref_vmi_vn
    kind: virtual_machine_interface_virtual_network
    from_column: from
    to_column: to
    to_kind: virtual_network
"#;

    fn decoder() -> EventDecoder {
        EventDecoder::new(Arc::new(ResourceRegistry::from_yaml_str(REGISTRY).unwrap()))
    }

    fn row(table: &str, keys: &[(&str, &str)], values: Value) -> DecodedRow {
        let Value::Object(mut values) = values else {
            panic!("values must be an object");
        };
        for (column, value) in keys {
            values.insert(column.to_string(), json!(value));
        }
        DecodedRow {
            table: table.to_string(),
            namespace: "public".to_string(),
            key_columns: keys.iter().map(|(c, _)| c.to_string()).collect(),
            primary_key: keys.iter().map(|(_, v)| v.to_string()).collect(),
            values,
            unchanged: Vec::new(),
        }
    }

    #[test]
    fn test_resource_row() {
        let row = row(
            "vn",
            &[("uuid", "vn-blue")],
            json!({
                "display_name": "blue",
                "fq_name": "[\"default\", \"admin\", \"blue\"]",
                "configuration_version": 7,
                "created_at": "2024-01-15T10:30:00",
            }),
        );
        let event = decoder().decode(Operation::Create, &row).unwrap();
        assert_eq!(event.resource_kind, "virtual_network");
        assert_eq!(event.primary_key, vec!["vn-blue".to_string()]);
        assert_eq!(event.version, 7);
        assert_eq!(
            event.fq_name,
            Some(vec!["default".into(), "admin".into(), "blue".into()])
        );
        assert_eq!(event.payload.get("name"), Some(&json!("blue")));
        assert!(!event.payload.contains_key("display_name"));
        assert!(!event.payload.contains_key("created_at"));
        assert!(!event.payload.contains_key("uuid"));
        assert!(!event.payload.contains_key("configuration_version"));
        assert!(event.reference.is_none());
    }

    #[test]
    fn test_qualified_table_name() {
        let row = row("project", &[("uuid", "p-1")], json!({"fq_name": "default:admin"}));
        let event = decoder().decode(Operation::Update, &row).unwrap();
        assert_eq!(event.resource_kind, "project");
        assert_eq!(event.fq_name, None);
        assert_eq!(event.payload.get("fq_name"), Some(&json!("default:admin")));
    }

    #[test]
    fn test_reference_row() {
        let row = row(
            "ref_vmi_vn",
            &[("from", "vmi-1"), ("to", "vn-1")],
            json!({"attr": {"sequence": 1}}),
        );
        let event = decoder().decode(Operation::Create, &row).unwrap();
        assert_eq!(
            event.reference,
            Some(Reference {
                from_uuid: "vmi-1".into(),
                to_kind: "virtual_network".into(),
                to_uuid: "vn-1".into(),
            })
        );
        assert_eq!(event.payload, json!({"attr": {"sequence": 1}}).as_object().cloned().unwrap());
    }

    #[test]
    fn test_delete_carries_only_key() {
        let row = row("vn", &[("uuid", "vn-blue")], json!({"display_name": null}));
        let event = decoder().decode(Operation::Delete, &row).unwrap();
        assert!(event.payload.is_empty());
        assert_eq!(event.uuid(), Some("vn-blue"));
    }

    #[test]
    fn test_unknown_table() {
        let row = row("nope", &[("uuid", "x")], json!({}));
        assert!(matches!(
            decoder().decode(Operation::Create, &row),
            Err(SyncError::UnknownTable(table)) if table == "public.nope"
        ));
    }

    #[test]
    fn test_invalid_version() {
        let row = row(
            "vn",
            &[("uuid", "vn-blue")],
            json!({"configuration_version": "seven"}),
        );
        assert!(matches!(
            decoder().decode(Operation::Create, &row),
            Err(SyncError::Mapping { .. })
        ));
    }

    #[test]
    fn test_registry_validation() {
        let duplicate = "resources:\n  - {table: a, kind: x}\n  - {table: a, kind: y}\n";
        assert!(ResourceRegistry::from_yaml_str(duplicate).is_err());
        let registry = ResourceRegistry::from_yaml_str(REGISTRY).unwrap();
        assert!(registry.is_reference("public", "ref_vmi_vn"));
        assert!(!registry.is_reference("public", "vn"));
    }
}
