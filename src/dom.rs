//! DOM capability abstraction
//!
//! Every stage after the session manager only needs a handful of things from a
//! document: test selectors, read and write form controls, click, find a
//! control by its label, and serialize the HTML. [`DomContext`] names that, so the
//! frame locator, form driver and resolver work the same against a live frame
//! ([`crate::FrameHandle`]) or a parsed snapshot ([`SnapshotDom`]).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Escape a string for safe use in JavaScript string literals
pub(crate) fn escape_js_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
        .replace('`', "\\`")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace("${", "\\${")
}

/// Presence and visibility of the first element matching a selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ElementState {
    pub present: bool,
    pub visible: bool,
}

/// Loose description of a control, for when no known selector matches
#[derive(Debug, Clone, Copy)]
pub struct ControlMatch<'a> {
    /// Selector list of the elements to consider
    pub candidates: &'a str,
    /// Wanted in the text, `title` or `value`
    pub label: &'a str,
    /// Wanted in the inline `onclick` handler
    pub handler: &'a str,
}

impl ControlMatch<'_> {
    pub fn accepts(&self, text: &str, title: &str, value: &str, onclick: &str) -> bool {
        text.contains(self.label)
            || title.contains(self.label)
            || value.contains(self.label)
            || onclick.contains(self.handler)
    }
}

/// What a stage can do with one document
#[allow(async_fn_in_trait)]
pub trait DomContext {
    /// Short label for logs (frame URL or fixture name)
    fn describe(&self) -> String;

    /// `document.readyState`
    async fn ready_state(&self) -> Result<String>;

    /// `document.title`; fails once the document's window is gone
    async fn title(&self) -> Result<String>;

    /// Probe the first element matching `selector`
    async fn query(&self, selector: &str) -> Result<ElementState>;

    /// Serialized HTML of the whole document
    async fn serialized_content(&self) -> Result<String>;

    /// Click the first element matching `selector`
    async fn click(&self, selector: &str) -> Result<()>;

    /// Set a `<select>` to the option with the given value
    async fn select_value(&self, selector: &str, value: &str) -> Result<()>;

    /// Replace a text control's contents, as select-all followed by typing
    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;

    /// Current `.value` of a control, `None` if no element matches
    async fn read_value(&self, selector: &str) -> Result<Option<String>>;

    /// First element `wanted` accepts, as a selector that finds it again
    async fn locate_control(&self, wanted: &ControlMatch<'_>) -> Result<Option<String>>;

    /// True if at least one element matches
    async fn exists(&self, selector: &str) -> Result<bool> {
        Ok(self.query(selector).await?.present)
    }

    /// First selector of the cascade that matches anything
    async fn find_one(&self, cascade: &[&str]) -> Result<Option<String>> {
        for selector in cascade {
            if self.exists(selector).await? {
                return Ok(Some((*selector).to_string()));
            }
        }
        Ok(None)
    }
}

/// Poll until `selector` is visible, bounded by `timeout`
///
/// The bound covers the whole loop, so a query that never answers still
/// ends in [`Error::Timeout`].
pub async fn wait_for_visible<D: DomContext>(
    dom: &D,
    selector: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let visible = async {
        loop {
            if let Ok(state) = dom.query(selector).await {
                if state.visible {
                    return;
                }
            }
            tokio::time::sleep(poll).await;
        }
    };

    tokio::time::timeout(timeout, visible).await.map_err(|_| {
        Error::Timeout(format!(
            "'{}' not visible in {} within {}ms",
            selector,
            dom.describe(),
            timeout.as_millis()
        ))
    })
}

/// Poll until every selector is present and the document is complete
pub async fn wait_for_complete<D: DomContext>(
    dom: &D,
    selectors: &[&str],
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let complete = async {
        loop {
            let mut ready = matches!(dom.ready_state().await.as_deref(), Ok("complete"));
            for selector in selectors {
                if !ready {
                    break;
                }
                ready = dom.exists(selector).await.unwrap_or(false);
            }
            if ready {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    };

    tokio::time::timeout(timeout, complete).await.map_err(|_| {
        Error::Timeout(format!(
            "{} did not finish loading {:?} within {}ms",
            dom.describe(),
            selectors,
            timeout.as_millis()
        ))
    })
}

/// Mutable side of a snapshot: control values, clicks, scripted results
#[derive(Debug, Default)]
struct SnapshotState {
    html: String,
    ready_state: String,
    closed: bool,
    values: HashMap<String, String>,
    clicks: Vec<String>,
    click_effects: Vec<(String, String)>,
}

/// A [`DomContext`] over a static HTML document
///
/// Control writes are kept on the side and read back the way a browser would
/// report them: a `<select>` set to an unknown option reads back empty, and
/// typed text is cut at the control's `maxlength`. Scripts are not run.
#[derive(Debug)]
pub struct SnapshotDom {
    name: String,
    state: Mutex<SnapshotState>,
}

impl SnapshotDom {
    pub fn new(name: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SnapshotState {
                html: html.into(),
                ready_state: "complete".into(),
                ..Default::default()
            }),
        }
    }

    /// Report a different `document.readyState`
    pub fn with_ready_state(self, ready_state: &str) -> Self {
        self.lock().ready_state = ready_state.to_string();
        self
    }

    /// Replace the document with `html` after `selector` is clicked
    pub fn with_click_effect(self, selector: &str, html: &str) -> Self {
        self.lock()
            .click_effects
            .push((selector.to_string(), html.to_string()));
        self
    }

    /// Selectors clicked so far, in order
    pub fn clicks(&self) -> Vec<String> {
        self.lock().clicks.clone()
    }

    /// Simulate the document's window going away
    pub fn close(&self) {
        self.lock().closed = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SnapshotState> {
        // A poisoned lock only means a test already panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.lock().closed {
            return Err(Error::transport(format!("{} is closed", self.name)));
        }
        Ok(())
    }

    fn parse_selector(&self, selector: &str) -> Result<Selector> {
        Selector::parse(selector).map_err(|e| {
            Error::script(
                &self.name,
                format!("'{}' is not a valid selector: {}", selector, e),
            )
        })
    }

    /// Run `f` on the first element matching `selector`
    fn with_element<T>(
        &self,
        selector: &str,
        f: impl FnOnce(Option<ElementRef<'_>>) -> T,
    ) -> Result<T> {
        self.ensure_open()?;
        let parsed = self.parse_selector(selector)?;
        let html = self.lock().html.clone();
        let document = Html::parse_document(&html);
        let element = document.select(&parsed).next();
        Ok(f(element))
    }

    fn no_element(&self, selector: &str) -> Error {
        Error::script(&self.name, format!("no element matches '{}'", selector))
    }
}

/// Hidden by attribute or inline style, on the element or any ancestor
fn is_hidden(element: ElementRef<'_>) -> bool {
    if element.value().name() == "input" && element.value().attr("type") == Some("hidden") {
        return true;
    }

    std::iter::once(element)
        .chain(element.ancestors().filter_map(ElementRef::wrap))
        .any(|el| {
            let attrs = el.value();
            if attrs.attr("hidden").is_some() {
                return true;
            }
            let style: String = attrs
                .attr("style")
                .unwrap_or_default()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_lowercase();
            style.contains("display:none") || style.contains("visibility:hidden")
        })
}

/// `.value` the way a browser reports it for an untouched control
fn initial_value(element: ElementRef<'_>) -> String {
    match element.value().name() {
        "select" => {
            let options: Vec<ElementRef<'_>> = element
                .descendants()
                .filter_map(ElementRef::wrap)
                .filter(|el| el.value().name() == "option")
                .collect();
            let chosen = options
                .iter()
                .find(|o| o.value().attr("selected").is_some())
                .or_else(|| options.first());
            chosen.map(|o| option_value(*o)).unwrap_or_default()
        }
        "textarea" => element.text().collect(),
        _ => element.value().attr("value").unwrap_or_default().to_string(),
    }
}

fn option_value(option: ElementRef<'_>) -> String {
    option
        .value()
        .attr("value")
        .map(String::from)
        .unwrap_or_else(|| option.text().collect::<String>().trim().to_string())
}

impl DomContext for SnapshotDom {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn ready_state(&self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.lock().ready_state.clone())
    }

    async fn title(&self) -> Result<String> {
        self.ensure_open()?;
        let html = self.lock().html.clone();
        let document = Html::parse_document(&html);
        let title = Selector::parse("title")
            .ok()
            .and_then(|sel| {
                document
                    .select(&sel)
                    .next()
                    .map(|t| t.text().collect::<String>())
            })
            .unwrap_or_default();
        Ok(title.trim().to_string())
    }

    async fn query(&self, selector: &str) -> Result<ElementState> {
        self.with_element(selector, |element| match element {
            Some(el) => ElementState {
                present: true,
                visible: !is_hidden(el),
            },
            None => ElementState::default(),
        })
    }

    async fn serialized_content(&self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.lock().html.clone())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        if !self.exists(selector).await? {
            return Err(self.no_element(selector));
        }

        let mut state = self.lock();
        state.clicks.push(selector.to_string());
        let effect = state
            .click_effects
            .iter()
            .find(|(target, _)| target == selector)
            .map(|(_, html)| html.clone());
        if let Some(html) = effect {
            state.html = html;
            state.values.clear();
        }
        Ok(())
    }

    async fn select_value(&self, selector: &str, value: &str) -> Result<()> {
        let options = self.with_element(selector, |element| {
            element.map(|el| {
                el.descendants()
                    .filter_map(ElementRef::wrap)
                    .filter(|o| o.value().name() == "option")
                    .map(option_value)
                    .collect::<Vec<_>>()
            })
        })?;
        let options = options.ok_or_else(|| self.no_element(selector))?;

        // Unknown option values leave the select with no selection
        let stored = if options.iter().any(|o| o == value) {
            value.to_string()
        } else {
            String::new()
        };
        self.lock().values.insert(selector.to_string(), stored);
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let max_len = self
            .with_element(selector, |element| {
                element.map(|el| {
                    el.value()
                        .attr("maxlength")
                        .and_then(|m| m.parse::<usize>().ok())
                })
            })?
            .ok_or_else(|| self.no_element(selector))?;

        let typed: String = match max_len {
            Some(max) => text.chars().take(max).collect(),
            None => text.to_string(),
        };
        self.lock().values.insert(selector.to_string(), typed);
        Ok(())
    }

    async fn read_value(&self, selector: &str) -> Result<Option<String>> {
        let initial = self.with_element(selector, |element| element.map(initial_value))?;
        let Some(initial) = initial else {
            return Ok(None);
        };
        Ok(Some(self.lock().values.get(selector).cloned().unwrap_or(initial)))
    }

    async fn locate_control(&self, wanted: &ControlMatch<'_>) -> Result<Option<String>> {
        self.ensure_open()?;
        let candidates = self.parse_selector(wanted.candidates)?;
        let html = self.lock().html.clone();
        let document = Html::parse_document(&html);

        let found = document.select(&candidates).find(|el| {
            let attrs = el.value();
            wanted.accepts(
                &el.text().collect::<String>(),
                attrs.attr("title").unwrap_or_default(),
                attrs.attr("value").unwrap_or_default(),
                attrs.attr("onclick").unwrap_or_default(),
            )
        });
        Ok(found.map(css_path))
    }
}

/// Child-index path from `<html>` down to `element`
fn css_path(element: ElementRef<'_>) -> String {
    let mut steps = Vec::new();
    let mut current = Some(element);
    while let Some(el) = current {
        let name = el.value().name();
        if name == "html" {
            break;
        }
        let position = el
            .prev_siblings()
            .filter(|sibling| sibling.value().is_element())
            .count()
            + 1;
        steps.push(format!("{}:nth-child({})", name, position));
        current = el.parent().and_then(ElementRef::wrap);
    }
    steps.push("html".to_string());
    steps.reverse();
    steps.join(" > ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORM: &str = r#"<html><head><title>Search</title></head><body>
        <form name="frmSearch">
          <select id="ticket_type">
            <option value="go_in">Incident</option>
            <option value="go_chg">Change Order</option>
          </select>
          <input name="searchKey" value="old" maxlength="8">
          <input type="hidden" name="SID" value="1234">
          <div style="display: none"><a id="hidden_go">Go</a></div>
        </form></body></html>"#;

    #[test]
    fn test_escape_js_string() {
        assert_eq!(escape_js_string("a'b"), "a\\'b");
        assert_eq!(escape_js_string("x\ny"), "x\\ny");
        assert_eq!(escape_js_string("${evil}"), "\\${evil}");
    }

    #[tokio::test]
    async fn test_query_reports_visibility() {
        let dom = SnapshotDom::new("form", FORM);
        let key = dom.query("input[name=\"searchKey\"]").await.unwrap();
        assert!(key.present && key.visible);

        let sid = dom.query("input[name=\"SID\"]").await.unwrap();
        assert!(sid.present && !sid.visible);

        let go = dom.query("#hidden_go").await.unwrap();
        assert!(go.present && !go.visible);

        assert_eq!(dom.query("#nothing").await.unwrap(), ElementState::default());
    }

    #[tokio::test]
    async fn test_find_one_takes_first_matching_selector() {
        let dom = SnapshotDom::new("form", FORM);
        let found = dom
            .find_one(&["#chgnum", "select#ticket_type", "input[name=\"searchKey\"]"])
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("select#ticket_type"));
        assert_eq!(dom.find_one(&["#a", "#b"]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_select_reads_back_like_a_browser() {
        let dom = SnapshotDom::new("form", FORM);
        assert_eq!(
            dom.read_value("#ticket_type").await.unwrap().as_deref(),
            Some("go_in")
        );

        dom.select_value("#ticket_type", "go_chg").await.unwrap();
        assert_eq!(
            dom.read_value("#ticket_type").await.unwrap().as_deref(),
            Some("go_chg")
        );

        dom.select_value("#ticket_type", "go_cr").await.unwrap();
        assert_eq!(dom.read_value("#ticket_type").await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_type_replaces_and_respects_maxlength() {
        let dom = SnapshotDom::new("form", FORM);
        let key = "input[name=\"searchKey\"]";
        assert_eq!(dom.read_value(key).await.unwrap().as_deref(), Some("old"));

        dom.type_text(key, "21236341").await.unwrap();
        assert_eq!(dom.read_value(key).await.unwrap().as_deref(), Some("21236341"));

        dom.type_text(key, "2123634199").await.unwrap();
        assert_eq!(dom.read_value(key).await.unwrap().as_deref(), Some("21236341"));
    }

    #[tokio::test]
    async fn test_click_effect_swaps_document() {
        let dom = SnapshotDom::new("form", FORM)
            .with_click_effect("#ticket_type", "<html><body><p id=after></p></body></html>");
        dom.click("#ticket_type").await.unwrap();
        assert!(dom.exists("#after").await.unwrap());
        assert_eq!(dom.clicks(), vec!["#ticket_type".to_string()]);
        assert!(dom.click("#ticket_type").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_snapshot_fails_liveness() {
        let dom = SnapshotDom::new("popup", FORM);
        assert_eq!(dom.title().await.unwrap(), "Search");
        dom.close();
        assert!(dom.title().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_selector_is_a_script_error() {
        let dom = SnapshotDom::new("form", FORM);
        assert!(matches!(
            dom.query("a[title*=").await,
            Err(Error::Script { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_visible_times_out_on_hidden_element() {
        let dom = SnapshotDom::new("form", FORM);
        let err = wait_for_visible(
            &dom,
            "#hidden_go",
            Duration::from_secs(15),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_complete_honours_ready_state() {
        let loading = SnapshotDom::new("form", FORM).with_ready_state("interactive");
        assert!(wait_for_complete(
            &loading,
            &["#ticket_type"],
            Duration::from_secs(3),
            Duration::from_secs(1)
        )
        .await
        .is_err());

        let done = SnapshotDom::new("form", FORM);
        wait_for_complete(
            &done,
            &["#ticket_type", "input[name=\"searchKey\"]"],
            Duration::from_secs(3),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    }

    /// A document whose every call hangs, like a frame stuck behind a dialog
    struct Stalled;

    impl DomContext for Stalled {
        fn describe(&self) -> String {
            "stalled".into()
        }
        async fn ready_state(&self) -> Result<String> {
            std::future::pending().await
        }
        async fn title(&self) -> Result<String> {
            std::future::pending().await
        }
        async fn query(&self, _: &str) -> Result<ElementState> {
            std::future::pending().await
        }
        async fn serialized_content(&self) -> Result<String> {
            std::future::pending().await
        }
        async fn click(&self, _: &str) -> Result<()> {
            std::future::pending().await
        }
        async fn select_value(&self, _: &str, _: &str) -> Result<()> {
            std::future::pending().await
        }
        async fn type_text(&self, _: &str, _: &str) -> Result<()> {
            std::future::pending().await
        }
        async fn read_value(&self, _: &str) -> Result<Option<String>> {
            std::future::pending().await
        }
        async fn locate_control(&self, _: &ControlMatch<'_>) -> Result<Option<String>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_are_bounded_when_the_document_hangs() {
        let start = tokio::time::Instant::now();
        let err = wait_for_visible(
            &Stalled,
            "#ticket_type",
            Duration::from_secs(15),
            Duration::from_millis(250),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(start.elapsed(), Duration::from_secs(15));

        let start = tokio::time::Instant::now();
        let err = wait_for_complete(
            &Stalled,
            &["#ticket_type"],
            Duration::from_secs(3),
            Duration::from_millis(250),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
