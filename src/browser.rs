//! Browser Session Manager
//!
//! Finds and launches Chrome, opens the single top-level page of a run,
//! answers HTTP auth challenges, and attaches to popups that page opens.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;

use crate::cdp::transport::launch_chrome;
use crate::cdp::types::{AuthChallengeResponse, FetchAuthRequiredEvent, FetchRequestPausedEvent};
use crate::cdp::{CdpEvent, Connection, Session, Transport};
use crate::error::{Error, Result};
use crate::page::Page;
use crate::{Credentials, ExtractorConfig};

/// Counter for unique user data directories
static BROWSER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Locate a Chrome/Chromium binary in the usual install locations
pub fn find_chrome() -> Result<PathBuf> {
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "linux") {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &[]
    };

    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
        .ok_or(Error::ChromeNotFound)
}

/// Command line for a scraping session against a frameset application
///
/// Site isolation is disabled so cross-origin frames stay in the page's
/// frame tree, and the popup blocker is off so the detail window opens.
fn chrome_args(config: &ExtractorConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--no-sandbox".into(),
        "--disable-setuid-sandbox".into(),
        "--disable-web-security".into(),
        "--disable-features=IsolateOrigins,site-per-process,VizDisplayCompositor".into(),
        "--disable-popup-blocking".into(),
        "--disable-dev-shm-usage".into(),
        "--disable-background-timer-throttling".into(),
        "--disable-backgrounding-occluded-windows".into(),
        "--disable-renderer-backgrounding".into(),
        "--no-first-run".into(),
        "--no-default-browser-check".into(),
        "--disable-default-apps".into(),
        "--disable-sync".into(),
        "--disable-translate".into(),
        "--password-store=basic".into(),
        "--use-mock-keychain".into(),
        format!(
            "--window-size={},{}",
            config.viewport_width, config.viewport_height
        ),
    ];

    if config.headless {
        args.push("--headless=new".into());
    }

    args
}

/// What the session responder does with one event
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    /// Answer an auth challenge with the run's credentials
    Authenticate(String),
    /// Release a paused request unchanged
    Continue(String),
    /// Close an `alert`/`confirm`/`prompt` so scripts keep running
    DismissDialog,
}

fn reply_for(event: &CdpEvent, session_id: &str) -> Option<Reply> {
    if !event.is_from(session_id) {
        return None;
    }
    match event.method.as_str() {
        "Fetch.authRequired" => event
            .decode::<FetchAuthRequiredEvent>()
            .map(|challenge| Reply::Authenticate(challenge.request_id)),
        "Fetch.requestPaused" => event
            .decode::<FetchRequestPausedEvent>()
            .map(|paused| Reply::Continue(paused.request_id)),
        "Page.javascriptDialogOpening" => Some(Reply::DismissDialog),
        _ => None,
    }
}

/// Spawn the task that keeps one session moving
///
/// Answers HTTP auth challenges, releases the requests `Fetch.enable` pauses
/// and dismisses JavaScript dialogs, which would otherwise block every
/// script evaluation in the page. Each reply runs on its own task so the
/// receiver never falls behind on a slow round-trip. The task ends when the
/// connection closes.
pub(crate) fn spawn_session_responder(
    session: Session,
    credentials: Option<Credentials>,
) -> JoinHandle<()> {
    let mut events = session.subscribe();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Session responder lagged, skipped {} events", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let Some(reply) = reply_for(&event, session.session_id()) else {
                continue;
            };

            let session = session.clone();
            let credentials = credentials.clone();
            tokio::spawn(async move {
                let outcome = match reply {
                    Reply::Authenticate(request_id) => {
                        let response = match credentials {
                            Some(credentials) => AuthChallengeResponse {
                                response: "ProvideCredentials".into(),
                                username: Some(credentials.username),
                                password: Some(credentials.password),
                            },
                            None => AuthChallengeResponse {
                                response: "Default".into(),
                                username: None,
                                password: None,
                            },
                        };
                        tracing::debug!("Answering auth challenge");
                        session.fetch_continue_with_auth(&request_id, response).await
                    }
                    Reply::Continue(request_id) => session.fetch_continue(&request_id).await,
                    Reply::DismissDialog => {
                        tracing::info!("Dismissing JavaScript dialog");
                        session.dismiss_dialog().await
                    }
                };

                if let Err(e) = outcome {
                    // Requests of a closing target fail to continue; that's fine
                    tracing::debug!("Session responder: {}", e);
                }
            });
        }
    })
}

/// Throwaway Chrome profile, removed when dropped
struct ProfileDir(PathBuf);

impl ProfileDir {
    fn create(path: PathBuf) -> Result<Self> {
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ProfileDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// A launched Chrome instance owned by one extraction run
pub struct Browser {
    connection: Connection,
    credentials: Option<Credentials>,
    viewport: (u32, u32),
    /// Field order matters: Chrome is killed before its profile is removed
    profile: ProfileDir,
}

impl Browser {
    /// Launch Chrome for the given run configuration
    pub async fn launch(config: &ExtractorConfig) -> Result<Self> {
        let instance_id = BROWSER_COUNTER.fetch_add(1, Ordering::Relaxed);
        let profile = ProfileDir::create(std::env::temp_dir().join(format!(
            "sdm-extract-{}-{}",
            std::process::id(),
            instance_id
        )))?;

        let chrome_path = match &config.chrome_path {
            Some(p) => PathBuf::from(p),
            None => find_chrome()?,
        };

        let mut args = chrome_args(config);
        args.push(format!("--user-data-dir={}", profile.path().display()));

        tracing::info!("Launching Chrome from {:?}", chrome_path);
        let (child, ws_url) = launch_chrome(&chrome_path, &args)?;

        let transport = Transport::new(child, &ws_url)?;
        // From here on an early return drops the browser, which kills Chrome
        // and removes the profile
        let browser = Self {
            connection: Connection::new(transport),
            credentials: config.credentials.clone(),
            viewport: (config.viewport_width, config.viewport_height),
            profile,
        };

        let version = browser.connection.version().await?;
        tracing::info!("Connected to Chrome: {}", version.product);

        // Popups only show up as targetCreated events once discovery is on
        browser.connection.discover_targets().await?;

        Ok(browser)
    }

    /// Open the run's top-level page at about:blank
    pub async fn new_page(&self) -> Result<Page> {
        let target_id = self
            .connection
            .create_target("about:blank", None, None)
            .await?;
        self.attach(&target_id, true).await
    }

    /// Attach to a popup opened by one of our pages
    pub async fn attach_popup(&self, target_id: &str) -> Result<Page> {
        self.attach(target_id, false).await
    }

    async fn attach(&self, target_id: &str, set_viewport: bool) -> Result<Page> {
        let session = self.connection.attach_to_target(target_id).await?;

        // Subscribed before anything is enabled so no challenge or dialog is missed
        let responder = spawn_session_responder(session.clone(), self.credentials.clone());
        let page = Page::new(session.clone(), self.connection.clone(), responder);

        session.page_enable().await?;
        session.network_enable().await?;

        if set_viewport {
            let (width, height) = self.viewport;
            session.set_viewport(width, height).await?;
        }

        if self.credentials.is_some() {
            session.fetch_enable_auth().await?;
        }

        Ok(page)
    }

    /// Get the browser version
    pub async fn version(&self) -> Result<String> {
        let v = self.connection.version().await?;
        Ok(v.product)
    }

    /// Close the browser
    ///
    /// The profile directory goes with `self` on both paths.
    pub async fn close(self) -> Result<()> {
        self.connection.close().await
    }
}
