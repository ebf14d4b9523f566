//! Page Abstraction
//!
//! A top-level browsing context (the application page or a popup it opened):
//! navigation with status checking, frame enumeration and settling, and the
//! event watchers the result resolver races against each other.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cdp::types::{
    Frame, NetworkResponseReceivedEvent, TargetInfo, TargetTargetCreatedEvent,
};
use crate::cdp::{wait_for_event, CdpEvent, Connection, Session};
use crate::error::{Error, Result};
use crate::frame::FrameHandle;

/// Rounds of frame liveness checks after the frameset reports complete
const LIVENESS_ROUNDS: u32 = 10;

/// A browser page (tab or popup window)
pub struct Page {
    session: Session,
    connection: Connection,
    responder: JoinHandle<()>,
}

impl Page {
    pub(crate) fn new(
        session: Session,
        connection: Connection,
        responder: JoinHandle<()>,
    ) -> Self {
        Self {
            session,
            connection,
            responder,
        }
    }

    /// Get the underlying CDP session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Target id of this page
    pub fn target_id(&self) -> &str {
        self.session.target_id()
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    /// Navigate and return the HTTP status of the main document
    ///
    /// Returns once the document response has arrived; frames are still
    /// loading at that point.
    pub async fn goto(&self, url: &str, timeout: Duration) -> Result<i64> {
        let mut events = self.session.subscribe();

        let nav = tokio::time::timeout(timeout, self.session.navigate(url))
            .await
            .map_err(|_| Error::Navigation(format!("{} did not respond within {:?}", url, timeout)))??;

        if let Some(error) = nav.error_text.filter(|e| !e.is_empty()) {
            return Err(Error::Navigation(format!("{}: {}", url, error)));
        }

        let session_id = self.session.session_id().to_string();
        let loader_id = nav.loader_id.clone();
        let frame_id = nav.frame_id.clone();

        let response: NetworkResponseReceivedEvent = wait_for_event(
            &mut events,
            "Network.responseReceived",
            timeout,
            |event, response: &NetworkResponseReceivedEvent| {
                event.is_from(&session_id)
                    && response.r#type == "Document"
                    && match &loader_id {
                        Some(loader) => &response.loader_id == loader,
                        None => response.frame_id.as_deref() == Some(frame_id.as_str()),
                    }
            },
        )
        .await
        .map_err(|e| match e {
            Error::Timeout(_) => Error::Navigation(format!("no response from {} within {:?}", url, timeout)),
            other => other,
        })?;

        tracing::info!(
            "Navigation response: {} {}",
            response.response.status,
            response.response.status_text
        );
        Ok(response.response.status)
    }

    /// Navigate and require a 200 for the main document
    pub async fn open(&self, url: &str, timeout: Duration) -> Result<()> {
        let status = self.goto(url, timeout).await?;
        check_document_status(url, status)
    }

    /// Hit a URL only to see whether the host answers; never fails
    pub async fn probe(&self, url: &str, timeout: Duration) {
        match self.goto(url, timeout).await {
            Ok(status) => tracing::info!("Probe {} answered with {}", url, status),
            Err(e) => tracing::warn!("Probe {} failed: {}", url, e),
        }
    }

    // =========================================================================
    // Page Info
    // =========================================================================

    /// Evaluate in the page's main world
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.session.evaluate(expression).await
    }

    /// Get page title; fails once the window is gone
    pub async fn title(&self) -> Result<String> {
        let value = self.session.evaluate("document.title").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// `document.readyState` of the top document
    pub async fn ready_state(&self) -> Result<String> {
        let value = self.session.evaluate("document.readyState").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// All frames of the page, top document first, depth-first
    pub async fn frames(&self) -> Result<Vec<FrameHandle>> {
        let tree = self.session.get_frame_tree().await?;
        Ok(tree
            .flatten()
            .into_iter()
            .map(|frame| FrameHandle::new(self.session.clone(), frame))
            .collect())
    }

    /// The top document as a frame
    pub async fn main_frame(&self) -> Result<FrameHandle> {
        let tree = self.session.get_frame_tree().await?;
        Ok(FrameHandle::new(self.session.clone(), tree.frame))
    }

    /// Wait for a frameset document to finish attaching its frames
    ///
    /// First the top document must be complete with at least one child frame
    /// and an unchanged frame count between two polls (bounded by `settle`).
    /// Then up to ten rounds check that every frame but at most one answers a
    /// script; running out of rounds is not an error.
    pub async fn wait_for_frames(&self, settle: Duration, poll: Duration) -> Result<usize> {
        let mut last_count = None;
        let settled = async {
            loop {
                let complete = matches!(self.ready_state().await.as_deref(), Ok("complete"));
                let count = match self.session.get_frame_tree().await {
                    Ok(tree) => tree.flatten().len(),
                    Err(e) => {
                        tracing::debug!("Frame tree unavailable: {}", e);
                        0
                    }
                };

                if complete && count > 1 && last_count == Some(count) {
                    tracing::debug!("Frame tree settled at {} frames", count);
                    return count;
                }
                last_count = Some(count);
                tokio::time::sleep(poll).await;
            }
        };
        let outcome = tokio::time::timeout(settle, settled).await;
        let settled = match outcome {
            Ok(count) => count,
            Err(_) => {
                return Err(Error::FrameNotFound(format!(
                    "frameset did not settle within {}ms ({} frames)",
                    settle.as_millis(),
                    last_count.unwrap_or(0)
                )))
            }
        };

        // Handles keep their isolated world across rounds
        let mut handles: HashMap<String, FrameHandle> = HashMap::new();
        let liveness = async {
            for round in 1..=LIVENESS_ROUNDS {
                let tree = self.session.get_frame_tree().await?;
                sync_handles(&mut handles, tree.flatten(), |frame| {
                    FrameHandle::new(self.session.clone(), frame)
                });

                let mut live = 0;
                for frame in handles.values() {
                    if crate::dom::DomContext::ready_state(frame).await.is_ok() {
                        live += 1;
                    }
                }

                let total = handles.len();
                if total > 1 && live + 1 >= total {
                    tracing::info!("{} of {} frames loaded", live, total);
                    return Ok(true);
                }

                tracing::debug!(
                    "Liveness round {}: {} of {} frames answer",
                    round,
                    live,
                    total
                );
                tokio::time::sleep(poll).await;
            }
            Ok::<_, Error>(false)
        };

        let outcome = tokio::time::timeout(settle, liveness).await;
        match outcome {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                tracing::warn!("Frames still loading after {} rounds, continuing", LIVENESS_ROUNDS)
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => tracing::warn!(
                "Frames still loading after {}ms, continuing",
                settle.as_millis()
            ),
        }
        Ok(handles.len().max(settled))
    }

    // =========================================================================
    // Watchers
    // =========================================================================

    /// Start listening for popups this page opens
    ///
    /// Must be called before the action that opens the popup.
    pub fn watch_popups(&self) -> PopupWatch {
        PopupWatch {
            events: self.connection.subscribe(),
            opener_id: self.target_id().to_string(),
        }
    }

    /// Start listening for the next load event of this page
    pub fn watch_load(&self) -> LoadWatch {
        LoadWatch {
            events: self.session.subscribe(),
            session_id: self.session.session_id().to_string(),
        }
    }

    /// Close this page's target (used for popups)
    pub async fn close(&self) -> Result<()> {
        self.responder.abort();
        self.connection.close_target(self.target_id()).await?;
        Ok(())
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.responder.abort();
    }
}

/// Keep one handle per frame id: known frames keep theirs, new frames get
/// one from `make`, frames gone from the tree lose theirs
fn sync_handles<H>(
    cache: &mut HashMap<String, H>,
    frames: Vec<Frame>,
    mut make: impl FnMut(Frame) -> H,
) {
    cache.retain(|id, _| frames.iter().any(|frame| &frame.id == id));
    for frame in frames {
        if !cache.contains_key(&frame.id) {
            cache.insert(frame.id.clone(), make(frame));
        }
    }
}

/// Anything other than 200 for the main document is a navigation failure
pub fn check_document_status(url: &str, status: i64) -> Result<()> {
    if status != 200 {
        return Err(Error::HttpStatus {
            url: url.to_string(),
            status,
        });
    }
    Ok(())
}

/// Armed popup listener, see [`Page::watch_popups`]
pub struct PopupWatch {
    events: broadcast::Receiver<CdpEvent>,
    opener_id: String,
}

impl PopupWatch {
    /// Wait for a page target opened by the watched page
    pub async fn next(&mut self, timeout: Duration) -> Result<TargetInfo> {
        let opener = self.opener_id.clone();
        let created: TargetTargetCreatedEvent = wait_for_event(
            &mut self.events,
            "Target.targetCreated",
            timeout,
            |_, created: &TargetTargetCreatedEvent| {
                created.target_info.r#type == "page"
                    && created.target_info.opener_id.as_deref() == Some(opener.as_str())
            },
        )
        .await?;
        Ok(created.target_info)
    }
}

/// Armed load listener, see [`Page::watch_load`]
pub struct LoadWatch {
    events: broadcast::Receiver<CdpEvent>,
    session_id: String,
}

impl LoadWatch {
    /// Wait for the page's next `load` event
    pub async fn next(&mut self, timeout: Duration) -> Result<()> {
        let session_id = self.session_id.clone();
        wait_for_event::<Value, _>(
            &mut self.events,
            "Page.loadEventFired",
            timeout,
            |event, _| event.is_from(&session_id),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_status_check() {
        assert!(check_document_status("http://sdm/pdmweb1.exe", 200).is_ok());
        match check_document_status("http://sdm/pdmweb1.exe", 401) {
            Err(Error::HttpStatus { status, .. }) => assert_eq!(status, 401),
            other => panic!("unexpected: {:?}", other),
        }
    }

    fn frames(ids: &[&str]) -> Vec<Frame> {
        ids.iter()
            .map(|id| Frame {
                id: id.to_string(),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_frame_handles_survive_liveness_rounds() {
        let mut created = 0;
        let mut cache = HashMap::new();
        let mut make = |frame: Frame| {
            created += 1;
            (frame.id, created)
        };

        sync_handles(&mut cache, frames(&["top", "menu", "search"]), &mut make);
        sync_handles(&mut cache, frames(&["top", "menu", "search"]), &mut make);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache["search"], ("search".to_string(), 3));

        // A navigated frameset: one frame replaced, one gone
        sync_handles(&mut cache, frames(&["top", "result"]), &mut make);
        assert_eq!(created, 4);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache["top"].1, 1);
        assert!(!cache.contains_key("menu"));
    }

    #[tokio::test]
    async fn test_popup_watch_ignores_foreign_openers() {
        let (tx, rx) = broadcast::channel(8);
        let mut watch = PopupWatch {
            events: rx,
            opener_id: "MAIN".into(),
        };
        for (id, opener) in [("X", "OTHER"), ("P", "MAIN")] {
            tx.send(CdpEvent {
                method: "Target.targetCreated".into(),
                params: json!({"targetInfo": {"targetId": id, "type": "page", "openerId": opener}}),
                session_id: None,
            })
            .unwrap();
        }

        let popup = watch.next(Duration::from_secs(1)).await.unwrap();
        assert_eq!(popup.target_id, "P");
    }

    #[tokio::test]
    async fn test_load_watch_is_per_session() {
        let (tx, rx) = broadcast::channel(8);
        let mut watch = LoadWatch {
            events: rx,
            session_id: "S1".into(),
        };
        tx.send(CdpEvent {
            method: "Page.loadEventFired".into(),
            params: json!({"timestamp": 1.0}),
            session_id: Some("S2".into()),
        })
        .unwrap();
        tx.send(CdpEvent {
            method: "Page.loadEventFired".into(),
            params: json!({"timestamp": 2.0}),
            session_id: Some("S1".into()),
        })
        .unwrap();

        watch.next(Duration::from_secs(1)).await.unwrap();
        assert!(watch.events.try_recv().is_err());
    }
}
