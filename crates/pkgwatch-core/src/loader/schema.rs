//! Versioned table schemas and per-record validation

use crate::error::{LoadError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

const DYNAMIC_ANALYSIS: &str = include_str!("../../schemas/dynamic-analysis.json");
const STATIC_ANALYSIS: &str = include_str!("../../schemas/static-analysis.json");

/// Partition name for rows whose partition field is null
pub const NULL_PARTITION: &str = "__NULL__";

/// Column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Record,
    Json,
}

/// Column mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

/// One column, possibly nested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
}

/// A table's fixed schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub version: String,
    pub table: String,
    pub partition_field: String,
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    /// Parse and check a schema document
    pub fn parse(json: &str) -> Result<Self> {
        let schema: TableSchema =
            serde_json::from_str(json).map_err(|e| LoadError::Schema(e.to_string()))?;
        schema.check()?;
        Ok(schema)
    }

    /// Schema of the dynamic-analysis table
    pub fn dynamic_analysis() -> Result<Self> {
        Self::parse(DYNAMIC_ANALYSIS)
    }

    /// Schema of the static-analysis table
    pub fn static_analysis() -> Result<Self> {
        Self::parse(STATIC_ANALYSIS)
    }

    fn check(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(LoadError::Schema("table name is empty".into()).into());
        }
        check_fields(&self.fields, "")?;
        self.partition_column(&self.partition_field)?;
        Ok(())
    }

    /// The top-level timestamp column named `field`
    pub fn partition_column(&self, field: &str) -> Result<&FieldSchema> {
        let column = self
            .fields
            .iter()
            .find(|f| f.name == field)
            .ok_or_else(|| LoadError::Schema(format!("partition field {} is not a column", field)))?;
        if column.field_type != FieldType::Timestamp || column.mode == FieldMode::Repeated {
            return Err(LoadError::Schema(format!(
                "partition field {} must be a single TIMESTAMP column",
                field
            ))
            .into());
        }
        Ok(column)
    }

    /// Check one record against the schema. Unknown columns are errors.
    pub fn validate(&self, record: &Value) -> std::result::Result<(), String> {
        match record {
            Value::Object(_) => validate_record(&self.fields, record, ""),
            other => Err(format!("expected a JSON object, found {}", kind(other))),
        }
    }

    /// Day partition (`YYYYMMDD`) of a valid record, keyed on `field`
    pub fn partition_for(&self, record: &Value, field: &str) -> std::result::Result<String, String> {
        match record.get(field) {
            None | Some(Value::Null) => Ok(NULL_PARTITION.to_string()),
            Some(value) => parse_timestamp(value)
                .map(|t| t.format("%Y%m%d").to_string())
                .ok_or_else(|| format!("{}: not a timestamp", field)),
        }
    }
}

fn check_fields(fields: &[FieldSchema], prefix: &str) -> Result<()> {
    let mut names = HashSet::new();
    for field in fields {
        let path = join(prefix, &field.name);
        if field.name.is_empty() {
            return Err(LoadError::Schema(format!("empty column name under {}", prefix)).into());
        }
        if !names.insert(field.name.as_str()) {
            return Err(LoadError::Schema(format!("duplicate column {}", path)).into());
        }
        match (field.field_type, field.fields.is_empty()) {
            (FieldType::Record, true) => {
                return Err(LoadError::Schema(format!("RECORD column {} has no fields", path)).into())
            }
            (FieldType::Record, false) => check_fields(&field.fields, &path)?,
            (_, false) => {
                return Err(
                    LoadError::Schema(format!("column {} has fields but is not a RECORD", path)).into(),
                )
            }
            (_, true) => {}
        }
    }
    Ok(())
}

fn validate_record(fields: &[FieldSchema], record: &Value, prefix: &str) -> std::result::Result<(), String> {
    let Value::Object(map) = record else {
        return Err(format!("{}: expected RECORD, found {}", prefix, kind(record)));
    };

    for key in map.keys() {
        if !fields.iter().any(|f| &f.name == key) {
            return Err(format!("{}: no such field", join(prefix, key)));
        }
    }

    for field in fields {
        let path = join(prefix, &field.name);
        let value = match map.get(&field.name) {
            None | Some(Value::Null) if field.mode == FieldMode::Required => {
                return Err(format!("{}: missing required field", path));
            }
            None | Some(Value::Null) => continue,
            Some(value) => value,
        };
        match (field.mode, value) {
            (FieldMode::Repeated, Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    if item.is_null() {
                        return Err(format!("{}[{}]: null in repeated field", path, i));
                    }
                    validate_value(field, item, &format!("{}[{}]", path, i))?;
                }
            }
            (FieldMode::Repeated, other) => {
                return Err(format!("{}: expected array, found {}", path, kind(other)));
            }
            (_, value) => validate_value(field, value, &path)?,
        }
    }
    Ok(())
}

fn validate_value(field: &FieldSchema, value: &Value, path: &str) -> std::result::Result<(), String> {
    let ok = match field.field_type {
        FieldType::Record => return validate_record(&field.fields, value, path),
        FieldType::Json => true,
        FieldType::String => value.is_string(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Float => value.is_number(),
        FieldType::Integer => parse_integer(value).is_some(),
        FieldType::Timestamp => parse_timestamp(value).is_some(),
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "{}: cannot convert {} to {:?}",
            path,
            kind(value),
            field.field_type
        ))
    }
}

fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Integer or fractional unix seconds, or an RFC 3339 string
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                Utc.timestamp_opt(secs, 0).single()
            } else {
                let secs = n.as_f64()?;
                if !secs.is_finite() {
                    return None;
                }
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9) as u32;
                Utc.timestamp_opt(whole as i64, nanos).single()
            }
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn package() -> Value {
        json!({"Ecosystem": "npm", "Name": "left-pad", "Version": "1.3.0"})
    }

    #[test]
    fn test_embedded_schemas_parse() {
        let dynamic = TableSchema::dynamic_analysis().unwrap();
        assert_eq!(dynamic.table, "analysis");
        assert_eq!(dynamic.partition_field, "CreatedTimestamp");

        let stat = TableSchema::static_analysis().unwrap();
        assert_eq!(stat.table, "static_analysis");
        assert_eq!(stat.partition_field, "Created");
        assert_ne!(dynamic.fields, stat.fields);
    }

    #[test]
    fn test_valid_dynamic_record() {
        let schema = TableSchema::dynamic_analysis().unwrap();
        let record = json!({
            "Package": package(),
            "CreatedTimestamp": 1709294400,
            "Analysis": {
                "Files": [{"Path": "/etc/passwd", "Read": true}],
                "Sockets": [{"Address": "10.0.0.1", "Port": "443", "Hostnames": []}],
                "Commands": [{"Command": ["node", "install.js"]}],
                "DNS": [{"Class": "IN", "Queries": [{"Hostname": "example.com", "Types": ["A"]}]}]
            }
        });
        schema.validate(&record).unwrap();
        assert_eq!(
            schema.partition_for(&record, "CreatedTimestamp").unwrap(),
            "20240301"
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let schema = TableSchema::dynamic_analysis().unwrap();
        let record = json!({
            "Package": package(),
            "CreatedTimestamp": 1709294400,
            "Analysis": {"Processes": []}
        });
        let err = schema.validate(&record).unwrap_err();
        assert_eq!(err, "Analysis.Processes: no such field");
    }

    #[test]
    fn test_missing_required_field() {
        let schema = TableSchema::dynamic_analysis().unwrap();
        let record = json!({
            "Package": {"Ecosystem": "npm", "Name": "x"},
            "CreatedTimestamp": 1709294400
        });
        let err = schema.validate(&record).unwrap_err();
        assert_eq!(err, "Package.Version: missing required field");
    }

    #[test]
    fn test_type_mismatch() {
        let schema = TableSchema::dynamic_analysis().unwrap();
        let record = json!({
            "Package": package(),
            "CreatedTimestamp": "yesterday"
        });
        assert!(schema.validate(&record).unwrap_err().starts_with("CreatedTimestamp:"));

        let record = json!({
            "Package": package(),
            "CreatedTimestamp": 1,
            "Analysis": {"Commands": [{"Command": "sh -c id"}]}
        });
        assert_eq!(
            schema.validate(&record).unwrap_err(),
            "Analysis.Commands[0].Command: expected array, found string"
        );
        assert!(schema.validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_static_record_partition() {
        let schema = TableSchema::static_analysis().unwrap();
        let record = json!({
            "Package": package(),
            "Created": "2024-03-01T23:59:59+00:00",
            "Verdict": {"severity": "low", "suspicious": false, "findings": [], "files": []}
        });
        schema.validate(&record).unwrap();
        assert_eq!(schema.partition_for(&record, "Created").unwrap(), "20240301");
        assert_eq!(
            schema.partition_for(&json!({}), "Created").unwrap(),
            NULL_PARTITION
        );
    }

    #[test]
    fn test_bad_schema_documents() {
        let no_partition = r#"{"version":"1","table":"t","partition_field":"When","fields":[
            {"name":"Other","type":"STRING"}]}"#;
        assert!(TableSchema::parse(no_partition).is_err());

        let wrong_type = r#"{"version":"1","table":"t","partition_field":"When","fields":[
            {"name":"When","type":"STRING"}]}"#;
        assert!(TableSchema::parse(wrong_type).is_err());

        let empty_record = r#"{"version":"1","table":"t","partition_field":"When","fields":[
            {"name":"When","type":"TIMESTAMP"},{"name":"R","type":"RECORD"}]}"#;
        assert!(TableSchema::parse(empty_record).is_err());

        assert!(TableSchema::parse("not json").is_err());
    }

    #[test]
    fn test_fractional_timestamp() {
        let t = parse_timestamp(&json!(1709294400.5)).unwrap();
        assert_eq!(t.timestamp(), 1709294400);
        assert_eq!(t.timestamp_subsec_millis(), 500);
    }
}
