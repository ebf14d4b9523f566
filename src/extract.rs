//! Table Extractor
//!
//! Pure functions over serialized HTML. Detail pages lay fields out as pairs
//! of rows (a row of `th` labels followed by a row of `td` values), and the
//! markup drifts between deployments, so every lookup is a cascade that ends
//! in something permissive. Nothing here fails: missing tables give empty
//! records and missing task lists give empty vectors.

use scraper::{ElementRef, Html, Selector};

use crate::record::{DetailRecord, WorkflowTask};
use crate::schema::RecordKind;

/// Detail table lookup, most specific first
pub const DETAIL_TABLE_CASCADE: [&str; 3] = ["#dtltbl0", "table.detailro", "table"];

/// Selectors that identify a frame as holding the detail table
pub const DETAIL_TABLE_MARKERS: [&str; 2] = ["#dtltbl0", "table.detailro"];

/// Control that expands the workflow task section
pub const WORKFLOW_CONTROL: &str = "#accrdnHyprlnk2";

/// Elements that may hold the long-text description, tried in order
const DESCRIPTION_CASCADE: [&str; 8] = [
    r#"textarea[name*="description"]"#,
    r#"textarea[id*="description"]"#,
    r#"td[pdmqa="description"]"#,
    r#"span[pdmqa="description"]"#,
    r#"textarea[name*="Description"]"#,
    r#"textarea[id*="Description"]"#,
    r#"input[name*="description"]"#,
    r#"input[id*="description"]"#,
];

/// Label text marking a description cell
const DESCRIPTION_LABELS: [&str; 2] = ["description", "descripción"];

/// Task list lookup before the heuristics kick in
const TASK_TABLE_CASCADE: [&str; 2] = ["#tbl901", r#"table.tab[summary="Task List"]"#];

/// Words a task list's text must all contain for the header scan
const TASK_TABLE_KEYWORDS: [&str; 4] = ["seq", "task", "assignee", "status"];

/// How far up from the workflow control to look for a table
const TASK_TABLE_MAX_CLIMB: usize = 5;

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn select_first<'a>(root: ElementRef<'a>, css: &str) -> Option<ElementRef<'a>> {
    selector(css).and_then(|sel| root.select(&sel).next())
}

fn select_all<'a>(root: ElementRef<'a>, css: &str) -> Vec<ElementRef<'a>> {
    selector(css)
        .map(|sel| root.select(&sel).collect())
        .unwrap_or_default()
}

fn raw_text(element: ElementRef<'_>) -> String {
    element.text().collect()
}

/// Drop literal `&nbsp;` markup, collapse whitespace runs, trim
pub fn normalize(text: &str) -> String {
    text.replace("&nbsp;", "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Value cell text; a lookup link's label is the canonical display value
fn value_cell_text(cell: ElementRef<'_>) -> String {
    match select_first(cell, "a span.lookup1em") {
        Some(span) => normalize(&raw_text(span)),
        None => normalize(&raw_text(cell)),
    }
}

/// Locate the detail table via [`DETAIL_TABLE_CASCADE`]
pub fn find_detail_table(document: &Html) -> Option<ElementRef<'_>> {
    let root = document.root_element();
    DETAIL_TABLE_CASCADE
        .iter()
        .find_map(|css| select_first(root, css))
}

/// Extract the canonical record for `kind` from a detail page
pub fn detail_record(kind: RecordKind, html: &str) -> DetailRecord {
    let document = Html::parse_document(html);
    let schema = kind.schema();
    let mut record = DetailRecord::empty(kind);

    match find_detail_table(&document) {
        Some(table) => {
            let rows = select_all(table, "tr");
            tracing::debug!("Detail table has {} rows", rows.len());

            // Rows come as (labels, values) pairs; a trailing odd row is ignored
            for pair in rows.chunks_exact(2) {
                let headers = select_all(pair[0], "th");
                let cells = select_all(pair[1], "td");

                for (header, cell) in headers.iter().zip(cells.iter()) {
                    let label = normalize(&raw_text(*header));
                    if let Some(field) = schema.field_for(&label) {
                        record.set(field, value_cell_text(*cell));
                    }
                }
            }
        }
        None => tracing::warn!("No table found, {} record will be empty", kind),
    }

    if let Some(description) = description_text(&document) {
        record.set(schema.description_field, description);
    }

    record
}

/// Long-text description, which usually lives outside the detail table
///
/// Tries [`DESCRIPTION_CASCADE`] first, then the element following the first
/// cell whose text mentions a description. Empty candidates are skipped.
pub fn description_text(document: &Html) -> Option<String> {
    let root = document.root_element();

    let from_controls = DESCRIPTION_CASCADE.iter().find_map(|css| {
        let element = select_first(root, css)?;
        let text = raw_text(element);
        let text = if text.trim().is_empty() {
            element.value().attr("value").unwrap_or_default().to_string()
        } else {
            text
        };
        Some(text.trim().to_string()).filter(|t| !t.is_empty())
    });
    if from_controls.is_some() {
        return from_controls;
    }

    select_all(root, "td, th").into_iter().find_map(|cell| {
        let label = raw_text(cell).to_lowercase();
        if !DESCRIPTION_LABELS.iter().any(|l| label.contains(l)) {
            return None;
        }
        let next = cell.next_siblings().find_map(ElementRef::wrap)?;
        Some(raw_text(next).trim().to_string()).filter(|t| !t.is_empty())
    })
}

/// Locate the workflow task table
///
/// `#tbl901`, then the "Task List" table, then the first table whose text
/// mentions every task keyword (scanning the full table set of the document),
/// then the last table inside the nearest of up to five ancestors of the
/// workflow control.
pub fn find_task_table(document: &Html) -> Option<ElementRef<'_>> {
    let root = document.root_element();

    if let Some(table) = TASK_TABLE_CASCADE
        .iter()
        .find_map(|css| select_first(root, css))
    {
        return Some(table);
    }

    let all_tables = select_all(root, "table");
    if let Some(table) = all_tables.iter().copied().find(|table| {
        let text = raw_text(*table).to_lowercase();
        TASK_TABLE_KEYWORDS.iter().all(|k| text.contains(k))
    }) {
        tracing::debug!("Task table found by header keywords");
        return Some(table);
    }

    let control = select_first(root, WORKFLOW_CONTROL)?;
    control
        .ancestors()
        .filter_map(ElementRef::wrap)
        .take(TASK_TABLE_MAX_CLIMB)
        .find_map(|ancestor| select_all(ancestor, "table").pop())
}

/// Assign one task cell by its lowercase header; first match wins
fn assign_task_field(task: &mut WorkflowTask, header: &str, value: String) {
    let slot = if header.contains("seq") {
        &mut task.sequence
    } else if header.contains("task") {
        &mut task.task
    } else if header.contains("description") {
        &mut task.description
    } else if header.contains("assignee") {
        &mut task.assignee
    } else if header.contains("group") {
        &mut task.group
    } else if header.contains("status") {
        &mut task.status
    } else if header.contains("start date") {
        &mut task.start_date
    } else if header.contains("completion date") {
        &mut task.completion_date
    } else {
        return;
    };
    *slot = Some(value);
}

/// Workflow tasks of an expanded detail page; empty when there is no list
pub fn workflow_tasks(html: &str) -> Vec<WorkflowTask> {
    let document = Html::parse_document(html);
    let Some(table) = find_task_table(&document) else {
        tracing::info!("No workflow task table found");
        return Vec::new();
    };

    let rows = select_all(table, "tr");
    let Some((header_row, data_rows)) = rows.split_first() else {
        return Vec::new();
    };

    let headers: Vec<String> = select_all(*header_row, "th")
        .into_iter()
        .map(|th| normalize(&raw_text(th)).to_lowercase())
        .collect();

    let tasks: Vec<WorkflowTask> = data_rows
        .iter()
        .filter_map(|row| {
            let mut task = WorkflowTask::default();
            for (header, cell) in headers.iter().zip(select_all(*row, "td")) {
                let text = match select_first(cell, "a") {
                    Some(link) => normalize(&raw_text(link)),
                    None => normalize(&raw_text(cell)),
                };
                assign_task_field(&mut task, header, text);
            }
            (!task.is_empty()).then_some(task)
        })
        .collect();

    tracing::info!("Extracted {} workflow tasks", tasks.len());
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANGE_ORDER_DETAIL: &str = r#"<html><body>
        <table id="dtltbl0" class="detailro">
          <tr><th>Requester Name</th><th>Affected End User</th></tr>
          <tr>
            <td><a href="javascript:void(0)"><span class="lookup1em">Perez, Ana</span></a> <img src="x.gif"></td>
            <td>  Gomez,&nbsp;Luis  </td>
          </tr>
          <tr><th>Category</th><th>Status</th><th>Priority</th></tr>
          <tr><td>Network.Firewall</td><td>
              Implementation   in Progress
          </td></tr>
          <tr><th>Orphan header</th></tr>
        </table>
        <textarea name="description">Open port 443 on fw-edge-02</textarea>
    </body></html>"#;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  a&nbsp;b \n\t c  "), "ab c");
        assert_eq!(normalize("x\u{a0}\u{a0}y"), "x y");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_change_order_record() {
        let record = detail_record(RecordKind::ChangeOrder, CHANGE_ORDER_DETAIL);
        assert_eq!(record.get("requester"), Some("Perez, Ana"));
        assert_eq!(record.get("affected_end_user"), Some("Gomez, Luis"));
        assert_eq!(record.get("category"), Some("Network.Firewall"));
        assert_eq!(record.get("status"), Some("Implementation in Progress"));
        assert_eq!(
            record.get("order_description"),
            Some("Open port 443 on fw-edge-02")
        );
        assert_eq!(record.len(), 5);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let a = detail_record(RecordKind::ChangeOrder, CHANGE_ORDER_DETAIL);
        let b = detail_record(RecordKind::ChangeOrder, CHANGE_ORDER_DETAIL);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_table_cascade_falls_back_to_detailro_then_any() {
        let detailro = r#"<table class="layout"><tr><th>Status</th></tr><tr><td>Wrong</td></tr></table>
            <table class="detailro"><tr><th>Status</th></tr><tr><td>Closed</td></tr></table>"#;
        let record = detail_record(RecordKind::Request, detailro);
        assert_eq!(record.get("status"), Some("Closed"));

        let plain = r#"<table><tr><th>Status</th></tr><tr><td>Open</td></tr></table>"#;
        assert_eq!(
            detail_record(RecordKind::Request, plain).get("status"),
            Some("Open")
        );
    }

    #[test]
    fn test_no_table_gives_empty_record() {
        let record = detail_record(RecordKind::Incident, "<html><body><p>Loading</p></body></html>");
        assert_eq!(record, DetailRecord::empty(RecordKind::Incident));
    }

    #[test]
    fn test_incident_fields_and_exclusions() {
        let html = r#"<table id="dtltbl0">
            <tr><th>Customer</th><th>Incident Type</th><th>Type</th><th>Assignment Group</th></tr>
            <tr><td>Ruiz, Eva</td><td>Hardware</td><td>Incident</td><td>Service Desk L1</td></tr>
            <tr><th>Summary</th><th>Active?</th><th>Assignee</th></tr>
            <tr><td>Printer offline</td><td>YES</td><td>Diaz, Juan</td></tr>
        </table>"#;
        let record = detail_record(RecordKind::Incident, html);
        assert_eq!(record.get("requester"), Some("Ruiz, Eva"));
        assert_eq!(record.get("incident_type"), Some("Hardware"));
        assert_eq!(record.get("type"), Some("Incident"));
        assert_eq!(record.get("assignment_group"), Some("Service Desk L1"));
        assert_eq!(record.get("summary"), Some("Printer offline"));
        assert_eq!(record.get("active"), Some("YES"));
        assert_eq!(record.get("assignee"), Some("Diaz, Juan"));
        assert_eq!(record.get("severity"), Some(""));
    }

    #[test]
    fn test_mismatched_cell_counts_truncate() {
        let html = r#"<table id="dtltbl0">
            <tr><th>Requester</th><th>Category</th><th>Status</th></tr>
            <tr><td>Lopez, Marta</td></tr>
        </table>"#;
        let record = detail_record(RecordKind::ChangeOrder, html);
        assert_eq!(record.get("requester"), Some("Lopez, Marta"));
        assert_eq!(record.get("category"), Some(""));
        assert_eq!(record.get("status"), Some(""));
    }

    #[test]
    fn test_description_from_label_sibling() {
        let html = r#"<table id="dtltbl0"><tr><th>Status</th></tr><tr><td>Open</td></tr></table>
            <table><tr><td>Descripción</td><td> Cambio de router </td></tr></table>"#;
        let record = detail_record(RecordKind::Request, html);
        assert_eq!(record.get("request_description"), Some("Cambio de router"));
    }

    #[test]
    fn test_description_skips_empty_candidates() {
        let html = r#"<textarea name="description"></textarea>
            <span pdmqa="description">Replace UPS batteries</span>"#;
        let document = Html::parse_document(html);
        assert_eq!(
            description_text(&document).as_deref(),
            Some("Replace UPS batteries")
        );

        let from_value = r#"<input id="x_description" value="Patch window Sunday">"#;
        assert_eq!(
            description_text(&Html::parse_document(from_value)).as_deref(),
            Some("Patch window Sunday")
        );
    }

    const TASKS: &str = r##"<html><body>
        <a id="accrdnHyprlnk2" href="#">Workflow Tasks</a>
        <table id="tbl901" class="tab" summary="Task List">
          <tr><th>Seq</th><th>Task</th><th>Description</th><th>Assignee</th>
              <th>Group</th><th>Status</th><th>Start Date</th><th>Completion Date</th></tr>
          <tr><td><a href="#">10</a></td><td>Approval</td><td>CAB approval</td><td>Soto, Rita</td>
              <td>CAB</td><td>Complete</td><td>01/02/2025 10:00</td><td>01/02/2025 11:30</td></tr>
          <tr><td>20</td><td>Implement</td></tr>
          <tr></tr>
        </table></body></html>"##;

    #[test]
    fn test_workflow_tasks_by_id() {
        let tasks = workflow_tasks(TASKS);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].sequence.as_deref(), Some("10"));
        assert_eq!(tasks[0].description.as_deref(), Some("CAB approval"));
        assert_eq!(tasks[0].completion_date.as_deref(), Some("01/02/2025 11:30"));
        assert_eq!(tasks[1].task.as_deref(), Some("Implement"));
        assert_eq!(tasks[1].status, None);
    }

    #[test]
    fn test_task_table_by_header_keywords() {
        let html = r#"<table id="other"><tr><td>Attachments</td></tr></table>
            <table id="tasks"><tr><th>Seq #</th><th>Task Name</th><th>Assignee</th><th>Status</th></tr>
            <tr><td>5</td><td>Review</td><td>Vera, Pau</td><td>Pending</td></tr></table>"#;
        let document = Html::parse_document(html);
        let table = find_task_table(&document).unwrap();
        assert_eq!(table.value().attr("id"), Some("tasks"));

        let tasks = workflow_tasks(html);
        assert_eq!(tasks[0].sequence.as_deref(), Some("5"));
        assert_eq!(tasks[0].assignee.as_deref(), Some("Vera, Pau"));
    }

    #[test]
    fn test_task_table_near_control() {
        let html = r#"<div id="section">
            <div><a id="accrdnHyprlnk2">Workflow</a></div>
            <table id="first"><tr><td>a</td></tr></table>
            <table id="last"><tr><th>Task</th></tr><tr><td>Close</td></tr></table>
        </div>"#;
        let document = Html::parse_document(html);
        let table = find_task_table(&document).unwrap();
        assert_eq!(table.value().attr("id"), Some("last"));
        assert_eq!(workflow_tasks(html)[0].task.as_deref(), Some("Close"));
    }

    #[test]
    fn test_missing_task_list_is_empty() {
        assert!(workflow_tasks("<html><body><p>nothing</p></body></html>").is_empty());
    }
}
