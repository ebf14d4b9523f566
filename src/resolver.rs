//! Popup/Result Resolver
//!
//! After the search is submitted the detail record shows up in one of three
//! places: a popup window, another frame of the page, or the form's own
//! frame. Listeners are armed before the click ([`arm`]); [`resolve`] then
//! races a popup against a navigation against a fixed window and narrows the
//! winner down to the frame holding the detail table.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::browser::Browser;
use crate::dom::DomContext;
use crate::error::{Error, Result};
use crate::extract::DETAIL_TABLE_MARKERS;
use crate::frame::FrameHandle;
use crate::page::{LoadWatch, Page, PopupWatch};
use crate::Timeouts;

/// Tokens that betray a detail page in serialized markup
const CONTENT_MARKERS: [&str; 2] = ["dtltbl0", "Requester"];

/// Where the detail table ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultTarget {
    /// A new top-level window opened by the form
    PopupWindow,
    /// Another frame of the application page
    SiblingFrame,
    /// The frame that hosted the form
    InPlaceFrame,
}

impl fmt::Display for ResultTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResultTarget::PopupWindow => "popup window",
            ResultTarget::SiblingFrame => "sibling frame",
            ResultTarget::InPlaceFrame => "in-place frame",
        })
    }
}

/// A resolved result: the frame to extract from, plus the popup if one opened
pub struct Resolution {
    pub target: ResultTarget,
    pub frame: FrameHandle,
    /// Owned by the caller until closed
    pub popup: Option<Page>,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("target", &self.target)
            .field("frame", &self.frame)
            .field("popup", &self.popup.as_ref().map(Page::target_id))
            .finish()
    }
}

/// First branch to settle after the submit click
#[derive(Debug, PartialEq, Eq)]
pub enum RaceOutcome<P> {
    Popup(P),
    Navigated,
    TimedOut,
}

/// Race a popup against a navigation against `window`
///
/// A branch that fails drops out of the race instead of ending it. When
/// several branches are ready at once the popup wins, then the navigation.
pub async fn race<P, PF, NF>(popup: PF, navigation: NF, window: Duration) -> RaceOutcome<P>
where
    PF: Future<Output = Result<P>>,
    NF: Future<Output = Result<()>>,
{
    let popup = async {
        match popup.await {
            Ok(popup) => popup,
            Err(e) => {
                tracing::debug!("Popup branch dropped out: {}", e);
                std::future::pending().await
            }
        }
    };
    let navigation = async {
        if let Err(e) = navigation.await {
            tracing::debug!("Navigation branch dropped out: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        biased;
        popup = popup => RaceOutcome::Popup(popup),
        () = navigation => RaceOutcome::Navigated,
        () = tokio::time::sleep(window) => RaceOutcome::TimedOut,
    }
}

/// Listeners that must exist before the submit click
pub struct Armed {
    popups: PopupWatch,
    load: LoadWatch,
}

/// Arm the popup and navigation listeners on `page`
pub fn arm(page: &Page) -> Armed {
    Armed {
        popups: page.watch_popups(),
        load: page.watch_load(),
    }
}

/// Index of the first frame carrying a detail table marker
///
/// Markers are tried in order across all frames, so a frame with the exact
/// table id beats an earlier frame with only the class. Frames that cannot
/// be queried are skipped.
pub async fn probe_frames<D: DomContext>(frames: &[D]) -> Option<usize> {
    for marker in DETAIL_TABLE_MARKERS {
        for (index, frame) in frames.iter().enumerate() {
            match frame.exists(marker).await {
                Ok(true) => {
                    tracing::debug!("Detail table ({}) in {}", marker, frame.describe());
                    return Some(index);
                }
                Ok(false) => {}
                Err(e) => tracing::debug!("Could not probe {}: {}", frame.describe(), e),
            }
        }
    }
    None
}

/// Index of the first frame whose markup mentions the detail page
pub async fn content_fallback<D: DomContext>(frames: &[D]) -> Option<usize> {
    for (index, frame) in frames.iter().enumerate() {
        if let Ok(content) = frame.serialized_content().await {
            if CONTENT_MARKERS.iter().any(|m| content.contains(m)) {
                tracing::debug!("Detail content in {}", frame.describe());
                return Some(index);
            }
        }
    }
    None
}

/// Poll `frames` for a detail table until `wait` runs out
pub async fn wait_for_table<D: DomContext>(
    frames: &[D],
    wait: Duration,
    poll: Duration,
) -> Option<usize> {
    let found = async {
        loop {
            if let Some(index) = probe_frames(frames).await {
                return index;
            }
            tokio::time::sleep(poll).await;
        }
    };
    tokio::time::timeout(wait, found).await.ok()
}

/// Bounded search for the detail table in a popup's frames
///
/// `enumerate` lists the popup's frames, top document first; it is called
/// again on every attempt because popups attach frames late. Between
/// attempts the top document must still answer, or the popup is gone.
/// Returns the frames of the successful attempt and the index found.
pub async fn find_table_frame<D, F, Fut>(
    mut enumerate: F,
    timeouts: &Timeouts,
) -> Result<Option<(Vec<D>, usize)>>
where
    D: DomContext,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<D>>>,
{
    let poll = timeouts.poll_interval.min(Duration::from_millis(500));
    let attempts = timeouts.table_attempts.max(1);

    for attempt in 1..=attempts {
        let frames = enumerate().await.map_err(|e| {
            tracing::warn!("Popup frames unavailable: {}", e);
            Error::PopupClosed
        })?;
        tracing::debug!("Attempt {}: {} popup frames", attempt, frames.len());

        if let Some(index) = wait_for_table(&frames, timeouts.table_wait, poll).await {
            return Ok(Some((frames, index)));
        }

        if attempt < attempts {
            tracing::info!("Detail table not found yet (attempt {}), retrying", attempt);
            tokio::time::sleep(timeouts.table_retry_pause).await;
            match frames.first() {
                Some(top) if top.title().await.is_ok() => {}
                _ => return Err(Error::PopupClosed),
            }
        }
    }
    Ok(None)
}

/// Same frame as the form, or another one
pub fn classify(found_frame_id: &str, form_frame_id: &str) -> ResultTarget {
    if found_frame_id == form_frame_id {
        ResultTarget::InPlaceFrame
    } else {
        ResultTarget::SiblingFrame
    }
}

/// Wait for the armed race to settle and narrow it down to one frame
///
/// Fails with [`Error::ResultNotFound`] when no popup opened and no frame of
/// the page holds a detail table after the grace delay, or with
/// [`Error::PopupClosed`] when the popup died while being searched.
pub async fn resolve(
    browser: &Browser,
    page: &Page,
    form_frame: &FrameHandle,
    armed: Armed,
    timeouts: &Timeouts,
) -> Result<Resolution> {
    let Armed {
        mut popups,
        mut load,
    } = armed;

    let outcome = race(
        popups.next(timeouts.navigation_race),
        load.next(timeouts.navigation_race),
        timeouts.popup_race,
    )
    .await;

    match outcome {
        RaceOutcome::Popup(info) => {
            tracing::info!("Popup window opened: {}", info.url);
            let popup = browser
                .attach_popup(&info.target_id)
                .await
                .map_err(|e| {
                    tracing::warn!("Could not attach to popup: {}", e);
                    Error::PopupClosed
                })?;

            match narrow_popup(&popup, page, form_frame, timeouts).await {
                Ok((target, frame)) => Ok(Resolution {
                    target,
                    frame,
                    popup: Some(popup),
                }),
                Err(e) => {
                    if let Err(close_err) = popup.close().await {
                        tracing::debug!("Closing popup failed: {}", close_err);
                    }
                    Err(e)
                }
            }
        }
        RaceOutcome::Navigated => {
            tracing::info!("No popup, page navigated");
            rescan(page, form_frame, timeouts).await
        }
        RaceOutcome::TimedOut => {
            tracing::info!("No popup or navigation, checking frames");
            rescan(page, form_frame, timeouts).await
        }
    }
}

/// Best-effort wait for the popup's document to leave `loading`
async fn wait_popup_ready<D: DomContext>(top: &D, timeouts: &Timeouts) {
    let poll = timeouts.poll_interval.min(Duration::from_millis(250));
    let loaded = async {
        loop {
            match top.ready_state().await.as_deref() {
                Ok("loading") | Err(_) => {}
                Ok(_) => return,
            }
            tokio::time::sleep(poll).await;
        }
    };
    match tokio::time::timeout(timeouts.popup_ready, loaded).await {
        Ok(()) => tracing::info!("Popup loaded"),
        Err(_) => tracing::warn!("Popup still loading, continuing anyway"),
    }
}

/// Search a popup for the detail page once its document has loaded
///
/// `top` is the popup's top document and `enumerate` lists its frames. The
/// table search comes first, then the content markers. `Ok(None)` means the
/// popup holds no detail page.
pub async fn narrow_popup_frames<D, F, Fut>(
    top: &D,
    mut enumerate: F,
    timeouts: &Timeouts,
) -> Result<Option<(Vec<D>, usize)>>
where
    D: DomContext,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<D>>>,
{
    wait_popup_ready(top, timeouts).await;

    if let Some(found) = find_table_frame(&mut enumerate, timeouts).await? {
        return Ok(Some(found));
    }

    let frames = enumerate().await.map_err(|_| Error::PopupClosed)?;
    Ok(content_fallback(&frames).await.map(|index| {
        tracing::info!("Using popup frame matched by content");
        (frames, index)
    }))
}

async fn narrow_popup(
    popup: &Page,
    page: &Page,
    form_frame: &FrameHandle,
    timeouts: &Timeouts,
) -> Result<(ResultTarget, FrameHandle)> {
    let top = popup.main_frame().await.map_err(|_| Error::PopupClosed)?;

    if let Some((frames, index)) = narrow_popup_frames(&top, || popup.frames(), timeouts).await? {
        return Ok((ResultTarget::PopupWindow, take(frames, index)?));
    }

    let page_frames = page.frames().await?;
    if let Some(index) = probe_frames(&page_frames).await {
        let frame = take(page_frames, index)?;
        let target = classify(frame.id(), form_frame.id());
        tracing::info!("Detail table found in the page instead ({})", target);
        return Ok((target, frame));
    }

    tracing::warn!("No detail table anywhere, falling back to the popup document");
    Ok((ResultTarget::PopupWindow, top))
}

async fn rescan(page: &Page, form_frame: &FrameHandle, timeouts: &Timeouts) -> Result<Resolution> {
    tokio::time::sleep(timeouts.grace_delay).await;

    let frames = page.frames().await?;
    tracing::debug!("Re-scanning {} frames", frames.len());

    let index = probe_frames(&frames).await.ok_or_else(|| {
        Error::ResultNotFound(format!(
            "no popup opened and none of {} frames holds a detail table",
            frames.len()
        ))
    })?;

    let frame = take(frames, index)?;
    let target = classify(frame.id(), form_frame.id());
    tracing::info!("Detail table found in {} {}", target, frame.url());
    Ok(Resolution {
        target,
        frame,
        popup: None,
    })
}

fn take(frames: Vec<FrameHandle>, index: usize) -> Result<FrameHandle> {
    frames
        .into_iter()
        .nth(index)
        .ok_or_else(|| Error::ResultNotFound("frame list changed during search".into()))
}
