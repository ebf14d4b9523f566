//! Record kinds and their canonical field tables
//!
//! Detail table headers are matched against an ordered list of rules per
//! record kind. A rule matches when the header contains any of its patterns
//! and none of its exclusions; the first matching rule names the field.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// One header-matching rule
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    /// Canonical output key
    pub field: &'static str,
    /// Substrings that select this field (case-sensitive)
    pub patterns: &'static [&'static str],
    /// Substrings that veto the match
    pub excludes: &'static [&'static str],
}

impl FieldRule {
    const fn new(field: &'static str, patterns: &'static [&'static str]) -> Self {
        Self {
            field,
            patterns,
            excludes: &[],
        }
    }

    const fn excluding(mut self, excludes: &'static [&'static str]) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn matches(&self, header: &str) -> bool {
        self.patterns.iter().any(|p| header.contains(p))
            && !self.excludes.iter().any(|e| header.contains(e))
    }
}

/// Field layout of one record kind
#[derive(Debug)]
pub struct Schema {
    /// Header rules, in priority order
    pub rules: &'static [FieldRule],
    /// Field filled from the long-text description, outside the table
    pub description_field: &'static str,
    /// Every output key, in output order
    pub fields: &'static [&'static str],
}

impl Schema {
    /// Canonical field for a header label, first matching rule wins
    pub fn field_for(&self, header: &str) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(header))
            .map(|rule| rule.field)
    }
}

static CHANGE_ORDER: Schema = Schema {
    rules: &[
        FieldRule::new("requester", &["Requester"]),
        FieldRule::new("affected_end_user", &["Affected End User"]),
        FieldRule::new("category", &["Category"]),
        FieldRule::new("status", &["Status"]),
    ],
    description_field: "order_description",
    fields: &[
        "requester",
        "affected_end_user",
        "category",
        "status",
        "order_description",
    ],
};

static INCIDENT: Schema = Schema {
    rules: &[
        FieldRule::new("requester", &["Requester", "Customer", "Reporter"]),
        FieldRule::new("affected_end_user", &["Affected End User", "End User"]),
        FieldRule::new("category", &["Category"]),
        FieldRule::new("status", &["Status"]),
        FieldRule::new("priority", &["Priority"]),
        FieldRule::new("severity", &["Severity"]),
        FieldRule::new("type", &["Type"]).excluding(&["Incident Type"]),
        FieldRule::new("incident_type", &["Incident Type"]),
        FieldRule::new("summary", &["Summary", "Subject"]),
        FieldRule::new("active", &["Active", "active"]),
        FieldRule::new("assignee", &["Assignee", "Assigned To"]),
        FieldRule::new("assignment_group", &["Group", "Assignment Group"]),
    ],
    description_field: "incident_description",
    fields: &[
        "requester",
        "affected_end_user",
        "category",
        "status",
        "priority",
        "severity",
        "type",
        "incident_type",
        "summary",
        "incident_description",
        "active",
        "assignee",
        "assignment_group",
    ],
};

static REQUEST: Schema = Schema {
    rules: &[
        FieldRule::new("requester", &["Requester", "Customer"]),
        FieldRule::new("affected_end_user", &["Affected End User", "End User"]),
        FieldRule::new("category", &["Category"]),
        FieldRule::new("status", &["Status"]),
        FieldRule::new("priority", &["Priority"]),
        FieldRule::new("type", &["Type"]).excluding(&["Request Type"]),
        FieldRule::new("request_type", &["Request Type"]),
        FieldRule::new("summary", &["Summary", "Subject"]),
        FieldRule::new("active", &["Active", "active"]),
    ],
    description_field: "request_description",
    fields: &[
        "requester",
        "affected_end_user",
        "category",
        "status",
        "priority",
        "type",
        "request_type",
        "summary",
        "request_description",
        "active",
    ],
};

/// The record types the search form can look up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    ChangeOrder,
    Incident,
    Request,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::ChangeOrder,
        RecordKind::Incident,
        RecordKind::Request,
    ];

    /// Value of the `#ticket_type` option selecting this kind
    pub fn option_value(self) -> &'static str {
        match self {
            RecordKind::ChangeOrder => "go_chg",
            RecordKind::Incident => "go_in",
            RecordKind::Request => "go_cr",
        }
    }

    /// Top-level key of the output document
    pub fn output_key(self) -> &'static str {
        match self {
            RecordKind::ChangeOrder => "changeOrderData",
            RecordKind::Incident => "incidentData",
            RecordKind::Request => "requestData",
        }
    }

    /// Prefix of result file names
    pub fn file_prefix(self) -> &'static str {
        match self {
            RecordKind::ChangeOrder => "change_order",
            RecordKind::Incident => "incident",
            RecordKind::Request => "request",
        }
    }

    pub fn schema(self) -> &'static Schema {
        match self {
            RecordKind::ChangeOrder => &CHANGE_ORDER,
            RecordKind::Incident => &INCIDENT,
            RecordKind::Request => &REQUEST,
        }
    }

    /// Only change orders carry a workflow task section
    pub fn has_workflow(self) -> bool {
        matches!(self, RecordKind::ChangeOrder)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::ChangeOrder => "change-order",
            RecordKind::Incident => "incident",
            RecordKind::Request => "request",
        })
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "change-order" | "change" | "chg" => Ok(RecordKind::ChangeOrder),
            "incident" | "in" => Ok(RecordKind::Incident),
            "request" | "cr" => Ok(RecordKind::Request),
            other => Err(Error::Config(format!(
                "unknown record kind '{}' (expected change-order, incident or request)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_variants_share_a_field() {
        let schema = RecordKind::ChangeOrder.schema();
        assert_eq!(schema.field_for("Requester"), Some("requester"));
        assert_eq!(schema.field_for("Requester Name"), Some("requester"));
        assert_eq!(schema.field_for("Change Status"), Some("status"));
        assert_eq!(schema.field_for("Priority"), None);
    }

    #[test]
    fn test_exclusions_route_to_the_specific_type() {
        let incident = RecordKind::Incident.schema();
        assert_eq!(incident.field_for("Type"), Some("type"));
        assert_eq!(incident.field_for("Incident Type"), Some("incident_type"));

        let request = RecordKind::Request.schema();
        assert_eq!(request.field_for("Request Type"), Some("request_type"));
        assert_eq!(request.field_for("Call Type"), Some("type"));
    }

    #[test]
    fn test_rule_order_decides_overlaps() {
        let incident = RecordKind::Incident.schema();
        // "End User" would also match affected_end_user, but requester is first
        assert_eq!(incident.field_for("Customer / End User"), Some("requester"));
        assert_eq!(incident.field_for("Assignment Group"), Some("assignment_group"));
        assert_eq!(incident.field_for("Inactive"), Some("active"));
    }

    #[test]
    fn test_every_rule_targets_a_declared_field() {
        for kind in RecordKind::ALL {
            let schema = kind.schema();
            assert!(schema.fields.contains(&schema.description_field));
            for rule in schema.rules {
                assert!(schema.fields.contains(&rule.field), "{}", rule.field);
            }
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("change-order".parse::<RecordKind>().unwrap(), RecordKind::ChangeOrder);
        assert_eq!("Incident".parse::<RecordKind>().unwrap(), RecordKind::Incident);
        assert_eq!("change_order".parse::<RecordKind>().unwrap(), RecordKind::ChangeOrder);
        assert!(matches!("problem".parse::<RecordKind>(), Err(Error::Config(_))));
        for kind in RecordKind::ALL {
            assert_eq!(kind.to_string().parse::<RecordKind>().unwrap(), kind);
        }
    }
}
