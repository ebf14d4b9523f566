//! Form Driver
//!
//! Fills the search form in a located frame. Every write is read back and a
//! mismatch is a hard failure. Submission is split in two ([`prepare`] and
//! [`press`]) so the result resolver can arm its listeners in between.

use std::time::Duration;

use crate::dom::{wait_for_complete, wait_for_visible, ControlMatch, DomContext};
use crate::error::{Error, Result};
use crate::locator::FormGeneration;
use crate::record::SearchRequest;
use crate::schema::RecordKind;
use crate::Timeouts;

/// Submit affordances across UI revisions, most specific first
pub const TRIGGER_CASCADE: [&str; 8] = [
    r#"a#imgBtn0[title*="Popup detail form for specified item"]"#,
    r#"a[id="imgBtn0"]"#,
    r#"a.button[onclick*="ImgBtnExecute"]"#,
    r#"a[title*="Go display specified change order"]"#,
    r#"input[type="button"][title*="Go"]"#,
    r#"a[title*="Go"]"#,
    r#"input[value*="Go"]"#,
    r#"button[title*="Go"]"#,
];

/// Last resort: any link or button mentioning the keyword or the handler
const TRIGGER_SCAN: ControlMatch<'static> = ControlMatch {
    candidates: r#"a, input[type="button"], button"#,
    label: "Go",
    handler: "ImgBtnExecute",
};

/// How the submit element was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Cascade,
    Scan,
}

/// A located submit element, ready to be pressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitTrigger {
    pub selector: String,
    pub source: TriggerSource,
}

/// Wait until the form's controls are visible and its document complete
///
/// A frame located as current that never renders its controls is given a
/// second chance as the legacy layout. Returns the generation that is ready.
pub async fn wait_ready<D: DomContext>(
    frame: &D,
    generation: FormGeneration,
    timeouts: &Timeouts,
) -> Result<FormGeneration> {
    match wait_generation(frame, generation, timeouts).await {
        Ok(()) => Ok(generation),
        Err(e) if generation == FormGeneration::Current => {
            tracing::info!("Current form not ready ({}), trying legacy layout", e);
            wait_generation(frame, FormGeneration::Legacy, timeouts)
                .await
                .map(|()| FormGeneration::Legacy)
                .map_err(|e| Error::FormNotReady(format!("{} in {}", e, frame.describe())))
        }
        Err(e) => Err(Error::FormNotReady(format!("{} in {}", e, frame.describe()))),
    }
}

async fn wait_generation<D: DomContext>(
    frame: &D,
    generation: FormGeneration,
    timeouts: &Timeouts,
) -> Result<()> {
    let poll = timeouts.poll_interval.min(Duration::from_millis(250));

    if let Some(type_selector) = generation.type_selector() {
        wait_for_visible(frame, type_selector, timeouts.form_ready, poll).await?;
    }
    wait_for_visible(frame, generation.key_selector(), timeouts.form_ready, poll).await?;
    wait_for_complete(frame, generation.ready_selectors(), timeouts.form_ready, poll).await?;

    tracing::info!("{:?} search form is ready", generation);
    Ok(())
}

/// Choose the record type; skipped on the legacy form
pub async fn select_kind<D: DomContext>(
    frame: &D,
    generation: FormGeneration,
    kind: RecordKind,
) -> Result<()> {
    let Some(type_selector) = generation.type_selector() else {
        if kind != RecordKind::ChangeOrder {
            return Err(Error::FormNotReady(format!(
                "legacy search form only looks up change orders, not {}",
                kind
            )));
        }
        tracing::info!("Legacy form has no type selector, skipping");
        return Ok(());
    };

    if !frame.exists(type_selector).await? {
        return Err(Error::FormNotReady(format!(
            "type selector '{}' missing from {}",
            type_selector,
            frame.describe()
        )));
    }

    let expected = kind.option_value();
    frame.select_value(type_selector, expected).await?;

    let actual = frame.read_value(type_selector).await?.unwrap_or_default();
    tracing::debug!("Type selector reads back '{}'", actual);
    if actual != expected {
        return Err(Error::mismatch(type_selector, expected, actual));
    }
    Ok(())
}

/// Type the search key over whatever the field held, then verify it
pub async fn enter_key<D: DomContext>(
    frame: &D,
    generation: FormGeneration,
    key: &str,
) -> Result<()> {
    let selector = generation.key_selector();
    if !frame.exists(selector).await? {
        return Err(Error::FormNotReady(format!(
            "search key input {} not found in {}",
            selector,
            frame.describe()
        )));
    }

    frame.type_text(selector, key).await?;

    let actual = frame.read_value(selector).await?.unwrap_or_default();
    if actual != key {
        return Err(Error::mismatch(selector, key, actual));
    }
    tracing::info!("Entered search key {}", key);
    Ok(())
}

/// Locate the submit element via [`TRIGGER_CASCADE`], then the in-page scan
pub async fn find_trigger<D: DomContext>(frame: &D) -> Result<SubmitTrigger> {
    if let Some(selector) = frame.find_one(&TRIGGER_CASCADE).await? {
        tracing::debug!("Submit trigger: {}", selector);
        return Ok(SubmitTrigger {
            selector,
            source: TriggerSource::Cascade,
        });
    }

    match frame.locate_control(&TRIGGER_SCAN).await? {
        Some(selector) => {
            tracing::debug!("Submit trigger found by scan: {}", selector);
            Ok(SubmitTrigger {
                selector,
                source: TriggerSource::Scan,
            })
        }
        None => Err(Error::SubmissionTarget(format!(
            "no submit control in {}",
            frame.describe()
        ))),
    }
}

/// Fill the form and locate its trigger, without submitting
pub async fn prepare<D: DomContext>(
    frame: &D,
    generation: FormGeneration,
    request: &SearchRequest,
    timeouts: &Timeouts,
) -> Result<(FormGeneration, SubmitTrigger)> {
    let generation = wait_ready(frame, generation, timeouts).await?;
    select_kind(frame, generation, request.kind()).await?;
    enter_key(frame, generation, request.key()).await?;
    let trigger = find_trigger(frame).await?;
    Ok((generation, trigger))
}

/// Click a prepared trigger
pub async fn press<D: DomContext>(frame: &D, trigger: &SubmitTrigger) -> Result<()> {
    tracing::info!("Submitting search");
    frame
        .click(&trigger.selector)
        .await
        .map_err(|e| Error::SubmissionTarget(format!("{}: {}", trigger.selector, e)))
}

/// Fill and submit in one go
pub async fn submit<D: DomContext>(
    frame: &D,
    generation: FormGeneration,
    request: &SearchRequest,
    timeouts: &Timeouts,
) -> Result<()> {
    let (_, trigger) = prepare(frame, generation, request, timeouts).await?;
    press(frame, &trigger).await
}
