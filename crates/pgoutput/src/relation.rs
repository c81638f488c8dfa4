//! Relation metadata and row decoding

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::value::decode_text;
use crate::{DecodeError, Tuple, TupleData};

/// Column of a replicated relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    /// Part of the replica identity (primary key)
    pub is_key: bool,
}

/// Schema of a replicated table as announced by a Relation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<Column>,
}

/// A row tuple decoded against its relation
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRow {
    /// Table name
    pub table: String,
    /// Schema name
    pub namespace: String,
    /// Key column names in relation-column order
    pub key_columns: Vec<String>,
    /// Key column values, matching `key_columns`
    pub primary_key: Vec<String>,
    /// Decoded column values; unchanged TOAST columns are absent
    pub values: Map<String, Value>,
    /// Columns sent as unchanged TOAST values
    pub unchanged: Vec<String>,
}

impl Relation {
    /// Fully qualified `namespace.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Decodes a tuple into column values and its primary key.
    ///
    /// # Errors
    /// * the tuple length differs from the declared column count
    /// * a value cannot be decoded for its column type
    /// * a key column is null or the relation has no key columns
    pub fn decode_row(&self, tuple: &Tuple) -> Result<DecodedRow, DecodeError> {
        if tuple.len() != self.columns.len() {
            return Err(DecodeError::ColumnCountMismatch {
                relation: self.qualified_name(),
                expected: self.columns.len(),
                actual: tuple.len(),
            });
        }

        let mut key_columns = Vec::new();
        let mut primary_key = Vec::new();
        let mut values = Map::new();
        let mut unchanged = Vec::new();

        for (column, datum) in self.columns.iter().zip(tuple.0.iter()) {
            match datum {
                TupleData::Null | TupleData::Unchanged if column.is_key => {
                    return Err(DecodeError::NullPrimaryKey {
                        relation: self.qualified_name(),
                        column: column.name.clone(),
                    });
                }
                TupleData::Null => {
                    values.insert(column.name.clone(), Value::Null);
                }
                TupleData::Unchanged => unchanged.push(column.name.clone()),
                TupleData::Text(raw) => {
                    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidValue {
                        column: column.name.clone(),
                        type_oid: column.type_oid,
                        reason: "value is not valid UTF-8".to_string(),
                    })?;
                    let value = decode_text(column.type_oid, text).map_err(|reason| {
                        DecodeError::InvalidValue {
                            column: column.name.clone(),
                            type_oid: column.type_oid,
                            reason,
                        }
                    })?;
                    if column.is_key {
                        key_columns.push(column.name.clone());
                        primary_key.push(text.to_string());
                    }
                    values.insert(column.name.clone(), value);
                }
            }
        }

        if primary_key.is_empty() {
            return Err(DecodeError::MissingPrimaryKey(self.qualified_name()));
        }

        Ok(DecodedRow {
            table: self.name.clone(),
            namespace: self.namespace.clone(),
            key_columns,
            primary_key,
            values,
            unchanged,
        })
    }
}

/// Relations seen on one replication connection, keyed by relation id.
///
/// Rebuilt from scratch on every connection; Relation messages replace
/// earlier entries when the source schema changes.
#[derive(Debug, Default)]
pub struct RelationSet {
    relations: HashMap<u32, Relation>,
}

impl RelationSet {
    pub fn insert(&mut self, relation: Relation) {
        tracing::debug!(
            "Relation {} ({}) with {} columns",
            relation.qualified_name(),
            relation.id,
            relation.columns.len()
        );
        self.relations.insert(relation.id, relation);
    }

    pub fn get(&self, id: u32) -> Result<&Relation, DecodeError> {
        self.relations
            .get(&id)
            .ok_or(DecodeError::UnknownRelation(id))
    }

    /// Decodes a tuple of the relation with the given id.
    pub fn decode_row(&self, id: u32, tuple: &Tuple) -> Result<DecodedRow, DecodeError> {
        self.get(id)?.decode_row(tuple)
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::oid;
    use serde_json::json;

    fn network() -> Relation {
        Relation {
            id: 1,
            namespace: "public".to_string(),
            name: "virtual_network".to_string(),
            replica_identity: b'd',
            columns: vec![
                Column {
                    name: "uuid".to_string(),
                    type_oid: oid::TEXT,
                    type_modifier: -1,
                    is_key: true,
                },
                Column {
                    name: "name".to_string(),
                    type_oid: oid::TEXT,
                    type_modifier: -1,
                    is_key: false,
                },
                Column {
                    name: "mtu".to_string(),
                    type_oid: oid::INT4,
                    type_modifier: -1,
                    is_key: false,
                },
            ],
        }
    }

    #[test]
    fn test_decode_row() {
        let tuple = Tuple(vec![
            TupleData::text("vn-blue"),
            TupleData::text("blue"),
            TupleData::text("1500"),
        ]);
        let row = network().decode_row(&tuple).unwrap();
        assert_eq!(row.table, "virtual_network");
        assert_eq!(row.key_columns, vec!["uuid".to_string()]);
        assert_eq!(row.primary_key, vec!["vn-blue".to_string()]);
        assert_eq!(row.values.get("name"), Some(&json!("blue")));
        assert_eq!(row.values.get("mtu"), Some(&json!(1500)));
        assert!(row.unchanged.is_empty());
    }

    #[test]
    fn test_unchanged_toast_is_omitted() {
        let tuple = Tuple(vec![
            TupleData::text("vn-blue"),
            TupleData::Unchanged,
            TupleData::Null,
        ]);
        let row = network().decode_row(&tuple).unwrap();
        assert!(!row.values.contains_key("name"));
        assert_eq!(row.values.get("mtu"), Some(&Value::Null));
        assert_eq!(row.unchanged, vec!["name".to_string()]);
    }

    #[test]
    fn test_column_count_mismatch() {
        let tuple = Tuple(vec![TupleData::text("vn-blue"), TupleData::text("blue")]);
        let err = network().decode_row(&tuple).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::ColumnCountMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_primary_key() {
        let mut relation = network();
        for column in &mut relation.columns {
            column.is_key = false;
        }
        let tuple = Tuple(vec![
            TupleData::text("vn-blue"),
            TupleData::text("blue"),
            TupleData::text("1500"),
        ]);
        assert!(matches!(
            relation.decode_row(&tuple),
            Err(DecodeError::MissingPrimaryKey(_))
        ));
    }

    #[test]
    fn test_null_key_column() {
        let tuple = Tuple(vec![
            TupleData::Null,
            TupleData::text("blue"),
            TupleData::text("1500"),
        ]);
        assert!(matches!(
            network().decode_row(&tuple),
            Err(DecodeError::NullPrimaryKey { .. })
        ));
    }

    #[test]
    fn test_unknown_relation() {
        let mut relations = RelationSet::default();
        assert!(matches!(
            relations.decode_row(1, &Tuple::default()),
            Err(DecodeError::UnknownRelation(1))
        ));
        relations.insert(network());
        assert_eq!(relations.len(), 1);
        assert!(relations.get(1).is_ok());
    }
}
