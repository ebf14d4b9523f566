//! Live frame handle
//!
//! Scripts run in an isolated world created inside the frame, which works for
//! same-process frames whatever their origin. The world's context id is
//! cached and re-created once if the frame navigated underneath it.

use std::sync::Mutex;

use serde_json::Value;

use crate::cdp::types::Frame;
use crate::cdp::Session;
use crate::dom::{escape_js_string, ControlMatch, DomContext, ElementState};
use crate::error::{Error, Result};

/// Name of the isolated world we create in each frame
const WORLD_NAME: &str = "sdm_extract";

/// Attribute a located control is tagged with
const CONTROL_MARKER: &str = "data-sdm-control";

/// A reference into a page's frame tree
///
/// Not owning: the frame can detach or reload at any time, in which case
/// calls fail and the caller re-enumerates frames.
pub struct FrameHandle {
    session: Session,
    frame_id: String,
    parent_id: Option<String>,
    url: String,
    name: Option<String>,
    context_id: Mutex<Option<i64>>,
}

impl FrameHandle {
    pub(crate) fn new(session: Session, frame: Frame) -> Self {
        Self {
            session,
            frame_id: frame.id,
            parent_id: frame.parent_id,
            url: frame.url,
            name: frame.name,
            context_id: Mutex::new(None),
        }
    }

    /// CDP frame id
    pub fn id(&self) -> &str {
        &self.frame_id
    }

    /// URL at enumeration time
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `name` attribute of the frame element, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True for the top-level document of the target
    pub fn is_main(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Target (page or popup) this frame belongs to
    pub fn target_id(&self) -> &str {
        self.session.target_id()
    }

    fn cached_context(&self) -> Option<i64> {
        self.context_id.lock().ok().and_then(|guard| *guard)
    }

    fn store_context(&self, id: Option<i64>) {
        if let Ok(mut guard) = self.context_id.lock() {
            *guard = id;
        }
    }

    async fn context(&self) -> Result<i64> {
        if let Some(id) = self.cached_context() {
            return Ok(id);
        }
        let id = self
            .session
            .create_isolated_world(&self.frame_id, WORLD_NAME)
            .await?;
        tracing::trace!(frame = %self.frame_id, context = id, "Created isolated world");
        self.store_context(Some(id));
        Ok(id)
    }

    /// Evaluate with one retry on a stale execution context
    async fn eval(&self, expression: &str) -> Result<Value> {
        let context = self.context().await?;
        match self.session.evaluate_in(Some(context), expression).await {
            Err(e) if e.is_context_lost() => {
                tracing::debug!(frame = %self.frame_id, "Execution context lost, recreating");
                self.store_context(None);
                let context = self.context().await?;
                self.session.evaluate_in(Some(context), expression).await
            }
            other => other,
        }
    }

    async fn eval_string(&self, expression: &str) -> Result<String> {
        Ok(self
            .eval(expression)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    /// Run `body` against `el`, the first match of `selector`; throws if none
    fn on_element(selector: &str, body: &str) -> String {
        format!(
            r#"(() => {{
                const el = document.querySelector('{sel}');
                if (!el) throw new Error('no element matches {sel}');
                {body}
            }})()"#,
            sel = escape_js_string(selector),
            body = body
        )
    }
}

impl std::fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHandle")
            .field("id", &self.frame_id)
            .field("url", &self.url)
            .field("name", &self.name)
            .finish()
    }
}

impl DomContext for FrameHandle {
    fn describe(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("frame '{}' ({})", name, self.url),
            _ => format!("frame {}", self.url),
        }
    }

    async fn ready_state(&self) -> Result<String> {
        self.eval_string("document.readyState").await
    }

    async fn title(&self) -> Result<String> {
        self.eval_string("document.title").await
    }

    async fn query(&self, selector: &str) -> Result<ElementState> {
        let js = format!(
            r#"(() => {{
                const el = document.querySelector('{}');
                if (!el) return {{ present: false, visible: false }};
                const style = window.getComputedStyle(el);
                const rect = el.getBoundingClientRect();
                const visible = style.display !== 'none'
                    && style.visibility !== 'hidden'
                    && rect.width > 0 && rect.height > 0;
                return {{ present: true, visible }};
            }})()"#,
            escape_js_string(selector)
        );
        let value = self.eval(&js).await?;
        serde_json::from_value(value).map_err(|e| Error::script(self.describe(), e.to_string()))
    }

    async fn serialized_content(&self) -> Result<String> {
        self.eval_string("document.documentElement ? document.documentElement.outerHTML : ''")
            .await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let js = Self::on_element(
            selector,
            "el.scrollIntoView({ block: 'center' }); el.click(); return true;",
        );
        self.eval(&js).await?;
        Ok(())
    }

    async fn select_value(&self, selector: &str, value: &str) -> Result<()> {
        let body = format!(
            r#"el.value = '{}';
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return el.value;"#,
            escape_js_string(value)
        );
        self.eval(&Self::on_element(selector, &body)).await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        // Focus and select everything so typing replaces any residual value
        let focus = Self::on_element(
            selector,
            "el.focus(); if (el.select) el.select(); return true;",
        );
        self.eval(&focus).await?;
        self.session.insert_text(text).await?;

        let notify = Self::on_element(
            selector,
            "el.dispatchEvent(new Event('change', { bubbles: true })); return true;",
        );
        self.eval(&notify).await?;
        Ok(())
    }

    async fn read_value(&self, selector: &str) -> Result<Option<String>> {
        let js = format!(
            r#"(() => {{
                const el = document.querySelector('{}');
                return el ? String(el.value ?? '') : null;
            }})()"#,
            escape_js_string(selector)
        );
        Ok(self.eval(&js).await?.as_str().map(String::from))
    }

    async fn locate_control(&self, wanted: &ControlMatch<'_>) -> Result<Option<String>> {
        let js = format!(
            r#"(() => {{
                document.querySelectorAll('[{marker}]').forEach(el => el.removeAttribute('{marker}'));
                for (const el of document.querySelectorAll('{candidates}')) {{
                    const text = el.textContent || '';
                    const title = el.title || '';
                    const value = el.value || '';
                    const onclick = el.getAttribute('onclick') || '';
                    if (text.includes('{label}') || title.includes('{label}')
                        || value.includes('{label}') || onclick.includes('{handler}')) {{
                        el.setAttribute('{marker}', '1');
                        return '[{marker}="1"]';
                    }}
                }}
                return null;
            }})()"#,
            marker = CONTROL_MARKER,
            candidates = escape_js_string(wanted.candidates),
            label = escape_js_string(wanted.label),
            handler = escape_js_string(wanted.handler),
        );
        Ok(self.eval(&js).await?.as_str().map(String::from))
    }
}
