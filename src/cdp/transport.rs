//! CDP Transport Layer
//!
//! WebSocket link to Chrome. Responses are routed back to the caller that sent
//! the command; events are fanned out to every subscriber.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::error::{Error, Result};

/// Capacity of the event fan-out. Frame-heavy pages emit bursts of
/// lifecycle events; slow subscribers see `Lagged` rather than blocking.
const EVENT_CAPACITY: usize = 1024;

/// Upper bound on any single command reply
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A pending command: its method (for error context) and the reply slot
type PendingRequest = (String, oneshot::Sender<Result<Value>>);

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, PendingRequest>>>;

/// WebSocket message types
mod ws {
    pub const OPCODE_TEXT: u8 = 0x1;
    pub const OPCODE_CONTINUATION: u8 = 0x0;
    pub const OPCODE_CLOSE: u8 = 0x8;
    pub const OPCODE_PING: u8 = 0x9;
    pub const OPCODE_PONG: u8 = 0xA;
}

/// Write one masked client frame
fn write_ws_frame(stream: &mut TcpStream, opcode: u8, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let len = data.len();
    let mut frame = Vec::with_capacity(14 + len);

    frame.push(0x80 | opcode);

    // Client frames are always masked
    if len < 126 {
        frame.push(0x80 | len as u8);
    } else if len < 65536 {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    let mask: [u8; 4] = rand::random();
    frame.extend_from_slice(&mask);
    frame.extend(data.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));

    stream.write_all(&frame)?;
    stream.flush()
}

/// Read one frame, returns (fin, opcode, payload)
fn read_ws_frame(stream: &mut TcpStream) -> std::io::Result<(bool, u8, Vec<u8>)> {
    use std::io::Read;

    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;

    let fin = (header[0] & 0x80) != 0;
    let opcode = header[0] & 0x0F;
    let masked = (header[1] & 0x80) != 0;
    let mut len = (header[1] & 0x7F) as usize;

    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext)?;
        len = u16::from_be_bytes(ext) as usize;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext)?;
        len = u64::from_be_bytes(ext) as usize;
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        stream.read_exact(&mut m)?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok((fin, opcode, payload))
}

/// A CDP event as delivered to subscribers
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

impl CdpEvent {
    /// Decode the event params into a typed payload
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.params.clone()).ok()
    }

    /// True if this event was emitted by the given session
    pub fn is_from(&self, session_id: &str) -> bool {
        self.session_id.as_deref() == Some(session_id)
    }
}

/// CDP Transport - sends commands, routes responses, broadcasts events
pub struct Transport {
    /// The Chrome child process
    child: Mutex<Child>,
    /// WebSocket stream for writing
    writer: Mutex<TcpStream>,
    /// Next message ID
    next_id: AtomicU64,
    /// Commands waiting for their response
    pending: PendingMap,
    /// Event fan-out
    events: broadcast::Sender<CdpEvent>,
}

impl Transport {
    /// Create a new transport connecting to Chrome via WebSocket
    ///
    /// Chrome is killed if the WebSocket cannot be opened.
    pub fn new(mut child: Child, ws_url: &str) -> Result<Self> {
        match Self::connect(ws_url) {
            Ok(stream) => Self::start(child, stream),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    /// Open the socket and complete the WebSocket upgrade
    fn connect(ws_url: &str) -> Result<TcpStream> {
        let url = ws_url.trim_start_matches("ws://");
        let (host_port, path) = url.split_once('/').unwrap_or((url, ""));

        let mut stream = TcpStream::connect(host_port)
            .map_err(|e| Error::transport_io("Failed to connect to Chrome", e))?;

        let key = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            rand::random::<[u8; 16]>(),
        );

        let handshake = format!(
            "GET /{} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            path, host_port, key
        );

        use std::io::{Read, Write};
        stream
            .write_all(handshake.as_bytes())
            .map_err(|e| Error::transport_io("Handshake write failed", e))?;

        // Read the upgrade response up to the blank line, byte by byte so no
        // frame bytes are swallowed
        let mut response = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            let n = stream
                .read(&mut byte)
                .map_err(|e| Error::transport_io("Handshake read failed", e))?;
            if n == 0 {
                break;
            }
            response.push(byte[0]);
        }
        let response_str = String::from_utf8_lossy(&response);

        if !response_str.starts_with("HTTP/1.1 101") {
            return Err(Error::transport(format!(
                "WebSocket handshake failed: {}",
                response_str.lines().next().unwrap_or_default()
            )));
        }

        tracing::debug!("WebSocket connected to {}", ws_url);
        Ok(stream)
    }

    fn start(mut child: Child, stream: TcpStream) -> Result<Self> {
        let clones = stream
            .try_clone()
            .and_then(|reader| Ok((reader, stream.try_clone()?)));
        let (reader_stream, pong_stream) = match clones {
            Ok(pair) => pair,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::transport_io("Failed to clone stream", e));
            }
        };

        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let pending_clone = Arc::clone(&pending);
        let events_clone = events.clone();
        std::thread::spawn(move || {
            Self::reader_loop(reader_stream, pong_stream, pending_clone, events_clone);
        });

        Ok(Self {
            child: Mutex::new(child),
            writer: Mutex::new(stream),
            next_id: AtomicU64::new(1),
            pending,
            events,
        })
    }

    /// Reader loop - runs on its own thread, owns the read half of the socket
    fn reader_loop(
        mut stream: TcpStream,
        mut pong_stream: TcpStream,
        pending: PendingMap,
        events: broadcast::Sender<CdpEvent>,
    ) {
        let mut message: Vec<u8> = Vec::new();

        loop {
            let (fin, opcode, payload) = match read_ws_frame(&mut stream) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("WebSocket read error: {}", e);
                    break;
                }
            };

            match opcode {
                ws::OPCODE_TEXT | ws::OPCODE_CONTINUATION => {
                    message.extend_from_slice(&payload);
                    if !fin {
                        continue;
                    }
                    let text = std::mem::take(&mut message);
                    Self::dispatch(&text, &pending, &events);
                }
                ws::OPCODE_PING => {
                    let _ = write_ws_frame(&mut pong_stream, ws::OPCODE_PONG, &payload);
                }
                ws::OPCODE_CLOSE => {
                    tracing::debug!("WebSocket closed by server");
                    break;
                }
                _ => {}
            }
        }

        // Fail everything still waiting so callers do not hang
        if let Ok(mut guard) = pending.lock() {
            for (_, (method, sender)) in guard.drain() {
                let _ = sender.send(Err(Error::transport(format!(
                    "Connection closed while waiting for {}",
                    method
                ))));
            }
        }

        tracing::debug!("CDP reader loop ended");
    }

    /// Route one complete text message
    fn dispatch(text: &[u8], pending: &PendingMap, events: &broadcast::Sender<CdpEvent>) {
        let msg: Value = match serde_json::from_slice(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to parse CDP message: {}", e);
                return;
            }
        };

        if let Some(id) = msg.get("id").and_then(Value::as_u64) {
            let entry = pending.lock().ok().and_then(|mut p| p.remove(&id));
            let Some((method, sender)) = entry else {
                tracing::trace!("Response for unknown id: {}", id);
                return;
            };

            let result = match msg.get("error") {
                Some(error) => Err(Error::cdp(
                    method,
                    error.get("code").and_then(Value::as_i64).unwrap_or(-1),
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown"),
                )),
                None => Ok(msg.get("result").cloned().unwrap_or(json!({}))),
            };
            let _ = sender.send(result);
        } else if let Some(method) = msg.get("method").and_then(Value::as_str) {
            // No subscribers is fine
            let _ = events.send(CdpEvent {
                method: method.to_string(),
                params: msg.get("params").cloned().unwrap_or(json!({})),
                session_id: msg
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(String::from),
            });
        }
    }

    /// Subscribe to all events received from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Send a browser-level CDP command and wait for the response
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.send_raw(None, method, params).await
    }

    /// Send a CDP command to a specific session
    pub async fn send_to_session<C, R>(
        &self,
        session_id: &str,
        method: &str,
        params: &C,
    ) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.send_raw(Some(session_id), method, params).await
    }

    async fn send_raw<C, R>(&self, session_id: Option<&str>, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| Error::transport("Pending map poisoned"))?
            .insert(id, (method.to_string(), tx));

        let mut msg = json!({
            "id": id,
            "method": method,
            "params": serde_json::to_value(params)?,
        });
        if let Some(session_id) = session_id {
            msg["sessionId"] = Value::String(session_id.to_string());
        }

        let data = serde_json::to_string(&msg)?;

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_ws_frame(&mut writer, ws::OPCODE_TEXT, data.as_bytes()) {
                if let Ok(mut p) = self.pending.lock() {
                    p.remove(&id);
                }
                return Err(Error::transport_io("WebSocket write failed", e));
            }
        }

        tracing::trace!(method, id, session = session_id, "Sent CDP command");

        let result =
            Self::await_reply(rx, &self.pending, id, method, COMMAND_TIMEOUT).await?;

        Ok(serde_json::from_value(result)?)
    }

    /// Wait for the reply to command `id`, giving up after `timeout`
    ///
    /// An expired command is dropped from the pending map so a late reply is
    /// discarded.
    async fn await_reply(
        rx: oneshot::Receiver<Result<Value>>,
        pending: &PendingMap,
        id: u64,
        method: &str,
        timeout: Duration,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(reply) => reply.map_err(|_| Error::transport("Response channel closed"))?,
            Err(_) => {
                if let Ok(mut p) = pending.lock() {
                    p.remove(&id);
                }
                Err(Error::Timeout(format!(
                    "{} got no reply within {}ms",
                    method,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Close the transport and kill Chrome
    pub async fn close(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock().await;
            let _ = write_ws_frame(&mut writer, ws::OPCODE_CLOSE, &[]);
        }

        let mut child = self.child.lock().await;
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.try_lock() {
            let _ = child.kill();
        }
    }
}

/// Launch Chrome and get the WebSocket debugging URL
pub fn launch_chrome(path: &std::path::Path, args: &[String]) -> Result<(Child, String)> {
    use std::process::Command;

    let mut child = Command::new(path)
        .args(args)
        .arg("--remote-debugging-port=0")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Launch(format!("Failed to launch Chrome: {}", e)))?;

    let Some(stderr) = child.stderr.take() else {
        let _ = child.kill();
        return Err(Error::Launch("No stderr from Chrome".into()));
    };

    // Chrome prints: DevTools listening on ws://127.0.0.1:PORT/devtools/browser/GUID
    let ws_url = BufReader::new(stderr)
        .lines()
        .map_while(|line| line.ok())
        .inspect(|line| tracing::trace!("Chrome stderr: {}", line))
        .find_map(|line| {
            line.find("ws://")
                .filter(|_| line.contains("DevTools listening on"))
                .map(|start| line[start..].trim().to_string())
        });

    let Some(ws_url) = ws_url else {
        let _ = child.kill();
        return Err(Error::Launch(
            "Failed to get DevTools WebSocket URL from Chrome".into(),
        ));
    };

    tracing::info!("Chrome DevTools URL: {}", ws_url);

    Ok((child, ws_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch_to(text: &str) -> (PendingMap, broadcast::Receiver<CdpEvent>) {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (events, rx) = broadcast::channel(8);
        Transport::dispatch(text.as_bytes(), &pending, &events);
        (pending, rx)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_connect_kills_the_child() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("sleep spawns");
        let pid = child.id();

        // Nothing listens on port 1
        let result = Transport::new(child, "ws://127.0.0.1:1/devtools/browser/x");
        assert!(result.is_err());
        assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
    }

    #[test]
    fn test_event_is_broadcast_with_session() {
        let (_, mut rx) = dispatch_to(
            r#"{"method":"Page.loadEventFired","params":{"timestamp":1.5},"sessionId":"S1"}"#,
        );
        let event = rx.try_recv().expect("event delivered");
        assert_eq!(event.method, "Page.loadEventFired");
        assert!(event.is_from("S1"));
        assert!(!event.is_from("S2"));
    }

    #[test]
    fn test_response_error_carries_method() {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (events, _rx) = broadcast::channel(8);
        let (tx, mut reply) = oneshot::channel();
        pending
            .lock()
            .unwrap()
            .insert(7, ("Runtime.evaluate".to_string(), tx));

        Transport::dispatch(
            br#"{"id":7,"error":{"code":-32000,"message":"Cannot find context with specified id"}}"#,
            &pending,
            &events,
        );

        match reply.try_recv().expect("reply delivered") {
            Err(Error::Cdp { method, code, .. }) => {
                assert_eq!(method, "Runtime.evaluate");
                assert_eq!(code, -32000);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_command_times_out() {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending
            .lock()
            .unwrap()
            .insert(3, ("Runtime.evaluate".to_string(), tx));

        let start = tokio::time::Instant::now();
        let err = Transport::await_reply(rx, &pending, 3, "Runtime.evaluate", COMMAND_TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(start.elapsed(), COMMAND_TIMEOUT);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reply_arrives_within_bound() {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(json!({"value": 1}))).unwrap();
        let reply = Transport::await_reply(rx, &pending, 1, "Browser.getVersion", COMMAND_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply["value"], 1);
    }

    #[test]
    fn test_garbage_is_ignored() {
        let (_, mut rx) = dispatch_to("not json");
        assert!(rx.try_recv().is_err());
    }
}
