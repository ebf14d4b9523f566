//! Frame Locator
//!
//! Finds the frame hosting the search form. Frames are searched in document
//! order against three signatures, strongest first: the current form's
//! selector pair, the legacy form's input, and finally raw content tokens.
//! A frame that cannot be evaluated is skipped, never fatal.

use crate::dom::DomContext;
use crate::error::{Error, Result};
use crate::frame::FrameHandle;
use crate::page::Page;

/// Record type selector of the current form
pub const TYPE_SELECTOR: &str = "#ticket_type";
/// Search key input of the current form
pub const SEARCH_KEY_SELECTOR: &str = r#"input[name="searchKey"]"#;
/// Change order number input of the legacy form
pub const LEGACY_KEY_SELECTOR: &str = "#chgnum";
/// Form element the legacy layout must have before it is usable
pub const LEGACY_FORM_SELECTOR: &str = r#"form[name="frmSearchChg"]"#;

/// Which generation of the search form a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormGeneration {
    /// Type dropdown plus generic search key
    Current,
    /// Change-order-only number field
    Legacy,
}

impl FormGeneration {
    /// Input receiving the search key
    pub fn key_selector(self) -> &'static str {
        match self {
            FormGeneration::Current => SEARCH_KEY_SELECTOR,
            FormGeneration::Legacy => LEGACY_KEY_SELECTOR,
        }
    }

    /// Record type dropdown, absent on the legacy form
    pub fn type_selector(self) -> Option<&'static str> {
        match self {
            FormGeneration::Current => Some(TYPE_SELECTOR),
            FormGeneration::Legacy => None,
        }
    }

    /// Elements that must exist before the form counts as loaded
    pub fn ready_selectors(self) -> &'static [&'static str] {
        match self {
            FormGeneration::Current => &[TYPE_SELECTOR, SEARCH_KEY_SELECTOR],
            FormGeneration::Legacy => &[LEGACY_KEY_SELECTOR, LEGACY_FORM_SELECTOR],
        }
    }
}

/// Which signature identified the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Primary,
    Legacy,
    Content,
}

/// Outcome of [`select_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatedForm {
    /// Index into the frame list that was searched
    pub index: usize,
    pub generation: FormGeneration,
    pub signature: Signature,
}

async fn has_primary<D: DomContext>(frame: &D) -> Result<bool> {
    Ok(frame.exists(TYPE_SELECTOR).await? && frame.exists(SEARCH_KEY_SELECTOR).await?)
}

/// Generation suggested by a frame's serialized HTML, if any
pub fn content_signature(content: &str) -> Option<FormGeneration> {
    if content.contains("ticket_type") || content.contains("searchKey") {
        Some(FormGeneration::Current)
    } else if content.contains("chgnum") && content.contains("Change Order Number") {
        Some(FormGeneration::Legacy)
    } else {
        None
    }
}

/// Pick the search form frame out of `frames`
pub async fn select_frame<D: DomContext>(frames: &[D]) -> Result<LocatedForm> {
    for (index, frame) in frames.iter().enumerate() {
        match has_primary(frame).await {
            Ok(true) => {
                tracing::info!("Found search form (current layout) in {}", frame.describe());
                return Ok(LocatedForm {
                    index,
                    generation: FormGeneration::Current,
                    signature: Signature::Primary,
                });
            }
            Ok(false) => {}
            Err(e) => tracing::debug!("Could not probe {}: {}", frame.describe(), e),
        }
    }

    for (index, frame) in frames.iter().enumerate() {
        match frame.exists(LEGACY_KEY_SELECTOR).await {
            Ok(true) => {
                tracing::info!("Found search form (legacy layout) in {}", frame.describe());
                return Ok(LocatedForm {
                    index,
                    generation: FormGeneration::Legacy,
                    signature: Signature::Legacy,
                });
            }
            Ok(false) => {}
            Err(e) => tracing::debug!("Could not probe {}: {}", frame.describe(), e),
        }
    }

    for (index, frame) in frames.iter().enumerate() {
        match frame.serialized_content().await {
            Ok(content) => {
                if let Some(generation) = content_signature(&content) {
                    tracing::info!("Found search form by content in {}", frame.describe());
                    return Ok(LocatedForm {
                        index,
                        generation,
                        signature: Signature::Content,
                    });
                }
            }
            Err(e) => tracing::debug!("Could not read {}: {}", frame.describe(), e),
        }
    }

    Err(Error::FrameNotFound(format!(
        "no search form in any of {} frames",
        frames.len()
    )))
}

/// Locate the search form frame of a settled page
pub async fn locate(page: &Page) -> Result<(FrameHandle, FormGeneration)> {
    let frames = page.frames().await?;
    tracing::info!("Searching {} frames for the search form", frames.len());

    let located = select_frame(&frames).await?;
    let frame = frames
        .into_iter()
        .nth(located.index)
        .ok_or_else(|| Error::FrameNotFound("frame list changed during search".into()))?;
    Ok((frame, located.generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::SnapshotDom;

    const MENU: &str = r##"<html><body><a href="#">Home</a></body></html>"##;
    const CURRENT: &str = r#"<html><body><form>
        <select id="ticket_type"><option value="go_chg">Change Order</option></select>
        <input name="searchKey"></form></body></html>"#;
    const LEGACY: &str = r#"<html><body><form name="frmSearchChg">
        Change Order Number <input id="chgnum"></form></body></html>"#;

    #[tokio::test]
    async fn test_primary_signature_wins_over_earlier_legacy_frame() {
        let frames = [
            SnapshotDom::new("top", MENU),
            SnapshotDom::new("legacy", LEGACY),
            SnapshotDom::new("current", CURRENT),
        ];
        let located = select_frame(&frames).await.unwrap();
        assert_eq!(located.index, 2);
        assert_eq!(located.generation, FormGeneration::Current);
        assert_eq!(located.signature, Signature::Primary);
    }

    #[tokio::test]
    async fn test_legacy_fallback() {
        let frames = [SnapshotDom::new("top", MENU), SnapshotDom::new("legacy", LEGACY)];
        let located = select_frame(&frames).await.unwrap();
        assert_eq!(located.index, 1);
        assert_eq!(located.generation, FormGeneration::Legacy);
        assert_eq!(located.signature, Signature::Legacy);
    }

    #[tokio::test]
    async fn test_content_signature_fallback() {
        // Key input rendered under another id, only the markup mentions it
        let odd = r#"<html><body><script>var f = 'searchKey';</script><input id="k"></body></html>"#;
        let frames = [SnapshotDom::new("top", MENU), SnapshotDom::new("odd", odd)];
        let located = select_frame(&frames).await.unwrap();
        assert_eq!(located.index, 1);
        assert_eq!(located.signature, Signature::Content);
    }

    #[tokio::test]
    async fn test_dead_frame_is_skipped() {
        let dead = SnapshotDom::new("dead", CURRENT);
        dead.close();
        let frames = [dead, SnapshotDom::new("legacy", LEGACY)];
        let located = select_frame(&frames).await.unwrap();
        assert_eq!(located.index, 1);
    }

    #[tokio::test]
    async fn test_no_form_anywhere() {
        let frames = [SnapshotDom::new("a", MENU), SnapshotDom::new("b", MENU)];
        assert!(matches!(
            select_frame(&frames).await,
            Err(Error::FrameNotFound(_))
        ));
    }

    #[test]
    fn test_content_signature_requires_label_for_legacy() {
        assert_eq!(content_signature("<input id=chgnum>"), None);
        assert_eq!(
            content_signature("Change Order Number <input id=chgnum>"),
            Some(FormGeneration::Legacy)
        );
    }
}
