//! End-to-end extraction flow
//!
//! One run owns one browser. Every stage works on an [`ExtractionContext`]
//! that carries the page, the located form frame and the resolved result,
//! and the browser plus any popup are released whether the run succeeds or
//! not.

use crate::browser::Browser;
use crate::dom::DomContext;
use crate::error::{Error, Result};
use crate::extract::{self, WORKFLOW_CONTROL};
use crate::frame::FrameHandle;
use crate::locator::{self, FormGeneration};
use crate::page::Page;
use crate::record::{DetailRecord, ExtractionOutput, SearchRequest, WorkflowTask};
use crate::resolver::{self, Resolution};
use crate::schema::RecordKind;
use crate::{form, ExtractorConfig, Timeouts};

/// State threaded through the stages of one run
pub struct ExtractionContext {
    browser: Browser,
    page: Page,
    form: Option<(FrameHandle, FormGeneration)>,
    resolution: Option<Resolution>,
}

impl ExtractionContext {
    pub fn new(browser: Browser, page: Page) -> Self {
        Self {
            browser,
            page,
            form: None,
            resolution: None,
        }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Result of [`ExtractionContext::submit`], once it succeeded
    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    /// Probe, open the application and wait for its frameset
    pub async fn open(&self, config: &ExtractorConfig) -> Result<()> {
        let timeouts = &config.timeouts;
        if let Some(probe_url) = &config.probe_url {
            self.page.probe(probe_url, timeouts.probe).await;
        }

        tracing::info!("Opening {}", config.base_url);
        self.page.open(&config.base_url, timeouts.navigation).await?;

        let frames = self
            .page
            .wait_for_frames(timeouts.frame_settle, timeouts.poll_interval)
            .await?;
        tracing::info!("Application loaded with {} frames", frames);
        Ok(())
    }

    /// Find the search form frame
    pub async fn locate(&mut self) -> Result<()> {
        let (frame, generation) = locator::locate(&self.page).await?;
        self.form = Some((frame, generation));
        Ok(())
    }

    /// Fill and submit the form, then resolve where the result went
    pub async fn submit(&mut self, request: &SearchRequest, timeouts: &Timeouts) -> Result<()> {
        let (frame, generation) = self
            .form
            .as_ref()
            .ok_or_else(|| Error::FrameNotFound("search form not located".into()))?;

        let (_, trigger) = form::prepare(frame, *generation, request, timeouts).await?;

        let armed = resolver::arm(&self.page);
        form::press(frame, &trigger).await?;

        let resolution =
            resolver::resolve(&self.browser, &self.page, frame, armed, timeouts).await?;
        tracing::info!("Result resolved to {}", resolution.target);
        self.resolution = Some(resolution);
        Ok(())
    }

    /// Read the detail record, and the workflow tasks where the kind has them
    pub async fn extract(&self, kind: RecordKind, timeouts: &Timeouts) -> Result<ExtractionOutput> {
        let resolution = self
            .resolution
            .as_ref()
            .ok_or_else(|| Error::ResultNotFound("search was not submitted".into()))?;

        let record = match resolution.frame.serialized_content().await {
            Ok(html) => extract::detail_record(kind, &html),
            Err(e) => {
                tracing::warn!("Could not read the detail page: {}", e);
                DetailRecord::empty(kind)
            }
        };
        let filled = record.fields().filter(|(_, v)| !v.is_empty()).count();
        tracing::info!("Extracted {} of {} fields", filled, record.len());

        let workflow_tasks = if kind.has_workflow() {
            // The result frame first, then the popup's top document
            let popup_main = match &resolution.popup {
                Some(popup) => popup.main_frame().await.ok(),
                None => None,
            };
            let contexts = std::iter::once(&resolution.frame).chain(popup_main.as_ref());
            Some(workflow(contexts, timeouts).await)
        } else {
            None
        };

        Ok(ExtractionOutput {
            kind,
            record,
            workflow_tasks,
        })
    }

    /// Close the popup (if any) and the browser
    pub async fn shutdown(mut self) {
        if let Some(popup) = self.resolution.take().and_then(|r| r.popup) {
            if let Err(e) = popup.close().await {
                tracing::debug!("Closing popup failed: {}", e);
            }
        }
        if let Err(e) = self.browser.close().await {
            tracing::warn!("Closing browser failed: {}", e);
        }
    }
}

/// Expand the workflow section in the first context that has one and read
/// its task list; never fails
pub async fn workflow<'a, D, I>(contexts: I, timeouts: &Timeouts) -> Vec<WorkflowTask>
where
    D: DomContext + 'a,
    I: IntoIterator<Item = &'a D>,
{
    for dom in contexts {
        if !dom.exists(WORKFLOW_CONTROL).await.unwrap_or(false) {
            continue;
        }

        tracing::info!("Expanding workflow section in {}", dom.describe());
        if let Err(e) = dom.click(WORKFLOW_CONTROL).await {
            tracing::warn!("Workflow section did not expand: {}", e);
            return Vec::new();
        }
        tokio::time::sleep(timeouts.workflow_expand).await;

        return match dom.serialized_content().await {
            Ok(html) => extract::workflow_tasks(&html),
            Err(e) => {
                tracing::warn!("Could not read the workflow section: {}", e);
                Vec::new()
            }
        };
    }

    tracing::info!("No workflow section found");
    Vec::new()
}

/// Run one extraction from launch to cleanup
///
/// Nothing is launched when the config is invalid.
pub async fn run(config: &ExtractorConfig, request: &SearchRequest) -> Result<ExtractionOutput> {
    config.validate()?;

    tracing::info!("Looking up {} {}", request.kind(), request.key());
    let browser = Browser::launch(config).await?;
    let page = match browser.new_page().await {
        Ok(page) => page,
        Err(e) => {
            if let Err(close_err) = browser.close().await {
                tracing::warn!("Closing browser failed: {}", close_err);
            }
            return Err(e);
        }
    };

    let mut ctx = ExtractionContext::new(browser, page);
    let result = execute(&mut ctx, config, request).await;
    if let Err(e) = &result {
        tracing::error!("Extraction failed: {}", e);
    }
    ctx.shutdown().await;
    result
}

async fn execute(
    ctx: &mut ExtractionContext,
    config: &ExtractorConfig,
    request: &SearchRequest,
) -> Result<ExtractionOutput> {
    ctx.open(config).await?;
    ctx.locate().await?;
    ctx.submit(request, &config.timeouts).await?;
    ctx.extract(request.kind(), &config.timeouts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::SnapshotDom;
    use std::time::Duration;

    const DETAIL: &str = r#"<html><body>
        <table id="dtltbl0"><tr><th>Status</th></tr><tr><td>Open</td></tr></table>
        </body></html>"#;
    const COLLAPSED: &str = r##"<html><body>
        <a id="accrdnHyprlnk2" href="#">Workflow Tasks</a>
        </body></html>"##;
    const EXPANDED: &str = r##"<html><body>
        <a id="accrdnHyprlnk2" href="#">Workflow Tasks</a>
        <table id="tbl901" summary="Task List">
          <tr><th>Seq</th><th>Task</th><th>Assignee</th><th>Status</th></tr>
          <tr><td>10</td><td>Approval</td><td>Soto, Rita</td><td>Complete</td></tr>
        </table></body></html>"##;

    fn timeouts() -> Timeouts {
        Timeouts {
            workflow_expand: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_expands_in_popup_document() {
        let result_frame = SnapshotDom::new("result", DETAIL);
        let popup_top = SnapshotDom::new("popup", COLLAPSED)
            .with_click_effect(WORKFLOW_CONTROL, EXPANDED);

        let start = tokio::time::Instant::now();
        let tasks = workflow([&result_frame, &popup_top], &timeouts()).await;

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task.as_deref(), Some("Approval"));
        assert_eq!(popup_top.clicks(), vec![WORKFLOW_CONTROL.to_string()]);
        assert!(result_frame.clicks().is_empty());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_workflow_section_yields_empty_list() {
        let result_frame = SnapshotDom::new("result", DETAIL);
        let tasks = workflow([&result_frame], &timeouts()).await;
        assert!(tasks.is_empty());

        let output = ExtractionOutput {
            kind: RecordKind::ChangeOrder,
            record: extract::detail_record(RecordKind::ChangeOrder, DETAIL),
            workflow_tasks: Some(tasks),
        };
        assert!(output.to_line().unwrap().contains(r#""workflowTasks":[]"#));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_launch() {
        let config = ExtractorConfig {
            chrome_path: Some("/nonexistent/chrome".into()),
            ..Default::default()
        };
        let request = SearchRequest::new(RecordKind::ChangeOrder, "21236341").unwrap();
        // A launch attempt would surface as a Launch error instead
        assert!(matches!(run(&config, &request).await, Err(Error::Config(_))));
    }
}
