//! CDP Connection/Session Management
//!
//! A `Connection` talks to the browser endpoint; a `Session` is a flattened
//! attachment to one target (the main page or a popup).

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;

use super::transport::{CdpEvent, Transport};
use super::types::*;
use crate::error::{Error, Result};

/// A CDP connection to Chrome
#[derive(Clone)]
pub struct Connection {
    transport: Arc<Transport>,
}

impl Connection {
    /// Create a new connection wrapping a transport
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Get a reference to the transport
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Subscribe to every event on the connection (all sessions)
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.transport.subscribe()
    }

    /// Get browser version info
    pub async fn version(&self) -> Result<BrowserGetVersionResult> {
        self.transport
            .send("Browser.getVersion", &BrowserGetVersion {})
            .await
    }

    /// Ask the browser to report target creation (popups included)
    pub async fn discover_targets(&self) -> Result<()> {
        self.transport
            .send::<_, Value>(
                "Target.setDiscoverTargets",
                &TargetSetDiscoverTargets { discover: true },
            )
            .await?;
        Ok(())
    }

    /// Create a new target (tab)
    pub async fn create_target(
        &self,
        url: &str,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<String> {
        let result: TargetCreateTargetResult = self
            .transport
            .send(
                "Target.createTarget",
                &TargetCreateTarget {
                    url: url.to_string(),
                    width,
                    height,
                },
            )
            .await?;
        Ok(result.target_id)
    }

    /// Attach to a target and get a session
    pub async fn attach_to_target(&self, target_id: &str) -> Result<Session> {
        let result: TargetAttachToTargetResult = self
            .transport
            .send(
                "Target.attachToTarget",
                &TargetAttachToTarget {
                    target_id: target_id.to_string(),
                    flatten: Some(true),
                },
            )
            .await?;

        Ok(Session {
            transport: Arc::clone(&self.transport),
            session_id: result.session_id,
            target_id: target_id.to_string(),
        })
    }

    /// Close a target
    pub async fn close_target(&self, target_id: &str) -> Result<bool> {
        let result: TargetCloseTargetResult = self
            .transport
            .send(
                "Target.closeTarget",
                &TargetCloseTarget {
                    target_id: target_id.to_string(),
                },
            )
            .await?;
        Ok(result.success)
    }

    /// Close the browser
    pub async fn close(&self) -> Result<()> {
        let _ = self
            .transport
            .send::<_, Value>("Browser.close", &BrowserClose {})
            .await;
        self.transport.close().await
    }
}

/// A CDP session attached to a specific target
#[derive(Clone)]
pub struct Session {
    transport: Arc<Transport>,
    session_id: String,
    target_id: String,
}

impl Session {
    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the target ID
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Subscribe to events; callers filter with [`CdpEvent::is_from`]
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.transport.subscribe()
    }

    /// Send a command to this session
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: serde::Serialize,
        R: DeserializeOwned,
    {
        self.transport
            .send_to_session(&self.session_id, method, params)
            .await
    }

    /// Send a command whose result we don't care about
    async fn call<C: serde::Serialize>(&self, method: &str, params: &C) -> Result<()> {
        self.send::<_, Value>(method, params).await?;
        Ok(())
    }

    /// Enable page events
    pub async fn page_enable(&self) -> Result<()> {
        self.call("Page.enable", &PageEnable {}).await
    }

    /// Enable network events (needed for document status codes)
    pub async fn network_enable(&self) -> Result<()> {
        self.call("Network.enable", &NetworkEnable {}).await
    }

    /// Intercept document requests so HTTP auth challenges surface as events
    ///
    /// Subresources reuse the credentials Chrome cached for the document, so
    /// only documents (frames, popups) are paused.
    pub async fn fetch_enable_auth(&self) -> Result<()> {
        self.call("Fetch.enable", &auth_interception()).await
    }

    /// Close the current JavaScript dialog without accepting it
    pub async fn dismiss_dialog(&self) -> Result<()> {
        self.call(
            "Page.handleJavaScriptDialog",
            &PageHandleJavaScriptDialog { accept: false },
        )
        .await
    }

    /// Let a paused request through unchanged
    pub async fn fetch_continue(&self, request_id: &str) -> Result<()> {
        self.call(
            "Fetch.continueRequest",
            &FetchContinueRequest {
                request_id: request_id.to_string(),
            },
        )
        .await
    }

    /// Answer an auth challenge
    pub async fn fetch_continue_with_auth(
        &self,
        request_id: &str,
        response: AuthChallengeResponse,
    ) -> Result<()> {
        self.call(
            "Fetch.continueWithAuth",
            &FetchContinueWithAuth {
                request_id: request_id.to_string(),
                auth_challenge_response: response,
            },
        )
        .await
    }

    /// Override the viewport size
    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        self.call(
            "Emulation.setDeviceMetricsOverride",
            &EmulationSetDeviceMetricsOverride {
                width,
                height,
                device_scale_factor: 1.0,
                mobile: false,
            },
        )
        .await
    }

    /// Navigate to a URL
    pub async fn navigate(&self, url: &str) -> Result<PageNavigateResult> {
        self.send(
            "Page.navigate",
            &PageNavigate {
                url: url.to_string(),
            },
        )
        .await
    }

    /// Get the frame tree
    pub async fn get_frame_tree(&self) -> Result<FrameTree> {
        let result: PageGetFrameTreeResult =
            self.send("Page.getFrameTree", &PageGetFrameTree {}).await?;
        Ok(result.frame_tree)
    }

    /// Create an isolated JS world inside a frame, returning its context id
    pub async fn create_isolated_world(&self, frame_id: &str, world_name: &str) -> Result<i64> {
        let result: PageCreateIsolatedWorldResult = self
            .send(
                "Page.createIsolatedWorld",
                &PageCreateIsolatedWorld {
                    frame_id: frame_id.to_string(),
                    world_name: Some(world_name.to_string()),
                    grant_univeral_access: Some(true),
                },
            )
            .await?;
        Ok(result.execution_context_id)
    }

    /// Insert text at current cursor position
    pub async fn insert_text(&self, text: &str) -> Result<()> {
        self.call(
            "Input.insertText",
            &InputInsertText {
                text: text.to_string(),
            },
        )
        .await
    }

    /// Evaluate JavaScript in the target's main world and return the value
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.evaluate_in(None, expression).await
    }

    /// Evaluate JavaScript in a given execution context (a frame's world)
    ///
    /// Runs as a user gesture so script-opened windows are not blocked.
    pub async fn evaluate_in(&self, context_id: Option<i64>, expression: &str) -> Result<Value> {
        let result: RuntimeEvaluateResult = self
            .send(
                "Runtime.evaluate",
                &RuntimeEvaluate {
                    expression: expression.to_string(),
                    context_id,
                    return_by_value: Some(true),
                    await_promise: Some(true),
                    user_gesture: Some(true),
                },
            )
            .await?;

        if let Some(exception) = result.exception_details {
            return Err(Error::script(
                context_id.map_or_else(|| "main world".to_string(), |id| format!("context {}", id)),
                exception.message(),
            ));
        }

        Ok(result.result.value.unwrap_or(Value::Null))
    }
}

/// `Fetch.enable` params pausing only document requests
pub(crate) fn auth_interception() -> FetchEnable {
    FetchEnable {
        patterns: vec![FetchRequestPattern {
            url_pattern: "*".into(),
            resource_type: Some("Document".into()),
        }],
        handle_auth_requests: true,
    }
}

/// Wait for the next event matching `method` (and `accept`) within `timeout`
///
/// Lagged receivers skip ahead; a closed channel is a transport error.
pub async fn wait_for_event<T, F>(
    rx: &mut broadcast::Receiver<CdpEvent>,
    method: &str,
    timeout: Duration,
    mut accept: F,
) -> Result<T>
where
    T: DeserializeOwned,
    F: FnMut(&CdpEvent, &T) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if event.method == method => {
                    if let Some(payload) = event.decode::<T>() {
                        if accept(&event, &payload) {
                            return Ok(payload);
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event receiver lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::transport("Event channel closed"));
                }
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::Timeout(format!("waiting for {}", method)))?
}
