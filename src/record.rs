//! Search requests, extracted records, and their JSON framing

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::RecordKind;

/// What to look up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    kind: RecordKind,
    key: String,
}

impl SearchRequest {
    /// Build a request; the key is trimmed and must not be empty
    pub fn new(kind: RecordKind, key: impl AsRef<str>) -> Result<Self> {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return Err(Error::Config(format!("a {} identifier is required", kind)));
        }
        Ok(Self {
            kind,
            key: key.to_string(),
        })
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Field name → value, with every canonical field of the kind present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetailRecord(IndexMap<String, String>);

impl DetailRecord {
    /// All canonical fields of `kind`, empty
    pub fn empty(kind: RecordKind) -> Self {
        Self(
            kind.schema()
                .fields
                .iter()
                .map(|f| (f.to_string(), String::new()))
                .collect(),
        )
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Set a canonical field; unknown names are ignored so the key set stays fixed
    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        if let Some(slot) = self.0.get_mut(field) {
            *slot = value.into();
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One row of the workflow task list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<String>,
}

impl WorkflowTask {
    pub fn is_empty(&self) -> bool {
        self == &WorkflowTask::default()
    }
}

/// The result of one run, as handed to the output collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOutput {
    pub kind: RecordKind,
    pub record: DetailRecord,
    /// `Some` only for kinds with a workflow section
    pub workflow_tasks: Option<Vec<WorkflowTask>>,
}

impl ExtractionOutput {
    /// `{ "<kind>Data": {...}, "workflowTasks"?: [...] }`
    pub fn to_value(&self) -> Result<Value> {
        let mut doc = serde_json::Map::new();
        doc.insert(
            self.kind.output_key().to_string(),
            serde_json::to_value(&self.record)?,
        );
        if let Some(tasks) = &self.workflow_tasks {
            doc.insert("workflowTasks".to_string(), serde_json::to_value(tasks)?);
        }
        Ok(Value::Object(doc))
    }

    /// Compact single-line form for stdout
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }

    /// Pretty form for the result file
    pub fn to_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_value()?)?)
    }

    /// Parse a document produced by [`ExtractionOutput::to_value`]
    pub fn from_value(value: &Value) -> Option<Self> {
        let doc = value.as_object()?;
        let kind = RecordKind::ALL
            .into_iter()
            .find(|k| doc.contains_key(k.output_key()))?;
        let record = serde_json::from_value(doc.get(kind.output_key())?.clone()).ok()?;
        let workflow_tasks = match doc.get("workflowTasks") {
            Some(tasks) => Some(serde_json::from_value(tasks.clone()).ok()?),
            None => None,
        };
        Some(Self {
            kind,
            record,
            workflow_tasks,
        })
    }

    /// Write the pretty document under `dir`, returning the path
    pub fn write_to(&self, dir: &Path, key: &str, at: DateTime<Utc>) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(output_file_name(self.kind, key, at));
        std::fs::write(&path, self.to_pretty()?)?;
        tracing::info!("Saved result to {}", path.display());
        Ok(path)
    }
}

/// `<prefix>_<key>_<timestamp>.json`, timestamp filesystem-safe
pub fn output_file_name(kind: RecordKind, key: &str, at: DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    let key: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}_{}_{}.json", kind.file_prefix(), key, stamp)
}

/// Top-level keys that mark a line as an extraction result
const RECOGNIZED_KEYS: [&str; 4] = [
    "changeOrderData",
    "incidentData",
    "requestData",
    "workflowTasks",
];

/// Find the result line in free-form process output
///
/// A result line is a complete JSON object carrying one of the recognized
/// top-level keys; when several qualify the last one wins.
pub fn find_record_line(output: &str) -> Option<Value> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|value| {
            value
                .as_object()
                .is_some_and(|doc| RECOGNIZED_KEYS.iter().any(|k| doc.contains_key(*k)))
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> ExtractionOutput {
        let mut record = DetailRecord::empty(RecordKind::ChangeOrder);
        record.set("status", "Implementation in Progress");
        record.set("requester", "Perez, Ana");
        ExtractionOutput {
            kind: RecordKind::ChangeOrder,
            record,
            workflow_tasks: Some(vec![WorkflowTask {
                sequence: Some("10".into()),
                task: Some("Approval".into()),
                status: Some("Pending".into()),
                ..Default::default()
            }]),
        }
    }

    #[test]
    fn test_blank_identifier_is_rejected() {
        for key in ["", "   ", "\t\n"] {
            assert!(matches!(
                SearchRequest::new(RecordKind::ChangeOrder, key),
                Err(Error::Config(_))
            ));
        }
        let request = SearchRequest::new(RecordKind::Incident, " 21236341 ").unwrap();
        assert_eq!(request.key(), "21236341");
    }

    #[test]
    fn test_empty_record_has_exact_field_set() {
        for kind in RecordKind::ALL {
            let record = DetailRecord::empty(kind);
            let keys: Vec<_> = record.fields().map(|(k, _)| k).collect();
            assert_eq!(keys, kind.schema().fields);
            assert!(record.fields().all(|(_, v)| v.is_empty()));
        }
    }

    #[test]
    fn test_unknown_fields_are_not_added() {
        let mut record = DetailRecord::empty(RecordKind::Request);
        record.set("order_description", "x");
        assert_eq!(record.len(), RecordKind::Request.schema().fields.len());
        assert_eq!(record.get("order_description"), None);
    }

    #[test]
    fn test_output_shape() {
        let value = sample().to_value().unwrap();
        assert_eq!(value["changeOrderData"]["status"], "Implementation in Progress");
        assert_eq!(value["changeOrderData"]["order_description"], "");
        assert_eq!(value["workflowTasks"][0]["task"], "Approval");
        assert!(value["workflowTasks"][0].get("assignee").is_none());

        let incident = ExtractionOutput {
            kind: RecordKind::Incident,
            record: DetailRecord::empty(RecordKind::Incident),
            workflow_tasks: None,
        };
        let value = incident.to_value().unwrap();
        assert!(value.get("workflowTasks").is_none());
        assert_eq!(value["incidentData"]["assignment_group"], "");
    }

    #[test]
    fn test_line_is_single_line_and_stable() {
        let first = sample().to_line().unwrap();
        let second = sample().to_line().unwrap();
        assert!(!first.contains('\n'));
        assert_eq!(first, second);
        assert!(first.starts_with(r#"{"changeOrderData":{"requester":"Perez, Ana""#));
    }

    #[test]
    fn test_file_name_is_filesystem_safe() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(
            output_file_name(RecordKind::ChangeOrder, "21236341", at),
            "change_order_21236341_2025-03-14T09-26-53-000Z.json"
        );
        assert_eq!(
            output_file_name(RecordKind::Request, "a/b", at),
            "request_a_b_2025-03-14T09-26-53-000Z.json"
        );
    }

    #[test]
    fn test_written_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let output = sample();
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();

        let path = output
            .write_to(&dir.path().join("output"), "21236341", at)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(ExtractionOutput::from_value(&parsed), Some(output));
    }

    #[test]
    fn test_find_record_line_skips_logs() {
        let line = sample().to_line().unwrap();
        let stdout = format!(
            "Navigating...\n{{\"progress\": 1}}\n{}\nBrowser closed\n{{not json}}\n",
            line
        );
        let found = find_record_line(&stdout).unwrap();
        assert_eq!(found, sample().to_value().unwrap());
        assert!(find_record_line("no json here\n{\"other\": true}").is_none());
    }

    #[test]
    fn test_find_record_line_prefers_last() {
        let stdout = "{\"incidentData\":{\"status\":\"Open\"}}\n{\"incidentData\":{\"status\":\"Closed\"}}";
        assert_eq!(find_record_line(stdout).unwrap()["incidentData"]["status"], "Closed");
    }
}
