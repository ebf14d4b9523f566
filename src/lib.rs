//! # sdm-extract
//!
//! Headless record extraction for frame-based service desk web UIs.
//!
//! The target application has no API: records are only reachable by driving
//! its search form, which lives somewhere in a nest of framesets, and reading
//! the detail popup it opens. This crate drives Chrome over a minimal CDP
//! client to do exactly that and returns the record as structured JSON.
//!
//! ## Flow
//!
//! Session manager → frame locator → form driver → (submit) → result
//! resolver → table extractor → [`ExtractionOutput`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sdm_extract::{ExtractorConfig, RecordKind, SearchRequest};
//!
//! #[tokio::main]
//! async fn main() -> sdm_extract::Result<()> {
//!     let config = ExtractorConfig {
//!         base_url: "http://servicedesk.local/CAisd/pdmweb1.exe".into(),
//!         ..Default::default()
//!     };
//!     let request = SearchRequest::new(RecordKind::ChangeOrder, "21236341")?;
//!
//!     let output = sdm_extract::pipeline::run(&config, &request).await?;
//!     println!("{}", output.to_line()?);
//!     Ok(())
//! }
//! ```
//!
//! ## Offline extraction
//!
//! Extraction itself is a pure function over HTML, so saved detail pages can
//! be processed without a browser:
//!
//! ```rust
//! use sdm_extract::{extract, RecordKind};
//!
//! let html = r#"<table id="dtltbl0">
//!     <tr><th>Status</th></tr><tr><td>Closed</td></tr>
//! </table>"#;
//! let record = extract::detail_record(RecordKind::ChangeOrder, html);
//! assert_eq!(record.get("status"), Some("Closed"));
//! assert_eq!(record.get("requester"), Some(""));
//! ```

use std::path::PathBuf;
use std::time::Duration;

pub mod browser;
pub mod cdp;
pub mod dom;
pub mod error;
pub mod extract;
pub mod form;
pub mod frame;
pub mod locator;
pub mod page;
pub mod pipeline;
pub mod record;
pub mod resolver;
pub mod schema;

// Re-exports
pub use browser::Browser;
pub use dom::{ControlMatch, DomContext, ElementState, SnapshotDom};
pub use error::{Error, ErrorCategory, Result};
pub use frame::FrameHandle;
pub use page::Page;
pub use record::{DetailRecord, ExtractionOutput, SearchRequest, WorkflowTask};
pub use resolver::{Resolution, ResultTarget};
pub use schema::RecordKind;

/// Basic-auth style credentials answered at the transport layer
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Bounds for every wait in the flow
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Main navigation to the application
    pub navigation: Duration,
    /// Optional connectivity probe
    pub probe: Duration,
    /// Frame tree settling after the main navigation
    pub frame_settle: Duration,
    /// Interval between polls in settle/visibility loops
    pub poll_interval: Duration,
    /// Search form controls becoming visible
    pub form_ready: Duration,
    /// Popup branch of the post-submit race
    pub popup_race: Duration,
    /// Navigation branch of the post-submit race
    pub navigation_race: Duration,
    /// Popup document leaving `loading`
    pub popup_ready: Duration,
    /// Pause before re-scanning frames when no popup appeared
    pub grace_delay: Duration,
    /// Waiting for the detail table inside a popup, per attempt
    pub table_wait: Duration,
    /// Attempts at finding the detail table inside a popup
    pub table_attempts: u32,
    /// Pause between those attempts
    pub table_retry_pause: Duration,
    /// Pause after expanding the workflow section
    pub workflow_expand: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(60),
            probe: Duration::from_secs(15),
            frame_settle: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            form_ready: Duration::from_secs(15),
            popup_race: Duration::from_secs(5),
            navigation_race: Duration::from_secs(10),
            popup_ready: Duration::from_secs(10),
            grace_delay: Duration::from_secs(3),
            table_wait: Duration::from_secs(5),
            table_attempts: 3,
            table_retry_pause: Duration::from_secs(2),
            workflow_expand: Duration::from_secs(2),
        }
    }
}

/// Configuration for one extraction run
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Application entry point (the frameset document)
    pub base_url: String,
    /// Host to hit first to check reachability; failures are only logged
    pub probe_url: Option<String>,
    /// Answered to HTTP auth challenges
    pub credentials: Option<Credentials>,
    /// Headless mode
    pub headless: bool,
    /// Path to Chrome/Chromium binary
    pub chrome_path: Option<String>,
    /// Viewport width
    pub viewport_width: u32,
    /// Viewport height
    pub viewport_height: u32,
    /// Where result files are written
    pub output_dir: PathBuf,
    pub timeouts: Timeouts,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            probe_url: None,
            credentials: None,
            headless: true,
            chrome_path: None,
            viewport_width: 1920,
            viewport_height: 1080,
            output_dir: PathBuf::from("output"),
            timeouts: Timeouts::default(),
        }
    }
}

impl ExtractorConfig {
    /// Check the parts of the config that must hold before launching anything
    pub fn validate(&self) -> Result<()> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(Error::Config("base URL is required".into()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(Error::Config(format!(
                "base URL must be http(s), got '{}'",
                base
            )));
        }
        Ok(())
    }
}
