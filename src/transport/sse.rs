use super::{ActiveKind, ConnState, EventHub, RETRY_DELAY};
use crate::error::{MixError, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The device emits keep-alives every 10 s; silence beyond this is treated
/// as a dead connection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(12);

/// One parsed Server-Sent-Events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE wire parser. Feed it raw chunks; completed frames come
/// back in arrival order. Comment lines and `id:`/`retry:` fields are
/// ignored; an empty line without accumulated data (a bare keep-alive) emits
/// nothing.
#[derive(Default)]
pub struct FrameParser {
    buffer: String,
    event: Option<String>,
    data: String,
}

impl FrameParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    frames.push(SseFrame {
                        event: self.event.take().unwrap_or_else(|| "message".to_string()),
                        data: std::mem::take(&mut self.data),
                    });
                }
                self.event = None;
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value.trim_start_matches(' '));
            }
            // id:, retry: and comment lines carry nothing we use
        }

        frames
    }
}

/// HTTP Server-Sent-Events client transport.
///
/// Issues a cancellable GET against the device's event stream. Exactly one
/// connect attempt is in flight at a time; reads are bounded by a 12 s idle
/// timeout, and reconnects run every two seconds as long as this transport
/// is still the active one.
pub struct SseTransport {
    url: String,
    hub: Arc<EventHub>,
    active: watch::Receiver<ActiveKind>,
    client: reqwest::Client,
    conn: Arc<ConnState>,
    connect_lock: Arc<tokio::sync::Mutex<()>>,
    stop: CancellationToken,
}

impl SseTransport {
    pub fn new(url: String, hub: Arc<EventHub>, active: watch::Receiver<ActiveKind>) -> Self {
        Self {
            url,
            hub,
            active,
            client: reqwest::Client::new(),
            conn: Arc::new(ConnState::default()),
            connect_lock: Arc::new(tokio::sync::Mutex::new(())),
            stop: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Connect and launch the read loop.
    ///
    /// # Errors
    /// `TransportMissing` when the URL is empty or the first connect fails.
    pub async fn start(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(MixError::TransportMissing {
                endpoint: "<empty SSE URL>".to_string(),
            });
        }

        let response = connect_once(
            &self.client,
            &self.url,
            &self.connect_lock,
            &self.stop,
        )
        .await?;

        info!(url = %self.url, "SSE stream connected");

        tokio::spawn(run_loop(
            response,
            self.url.clone(),
            self.client.clone(),
            self.hub.clone(),
            self.conn.clone(),
            self.connect_lock.clone(),
            self.stop.clone(),
            self.active.clone(),
        ));

        Ok(())
    }

    /// Cancel the request and close the stream. Safe to call concurrently;
    /// idempotent.
    pub fn stop(&self) {
        if self.conn.is_connected() {
            debug!(url = %self.url, "shutting down SSE connection");
        }
        self.stop.cancel();
    }

    /// Wait for `is_connected()` to flip false, up to `timeout`.
    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.conn.wait_for_stop(timeout).await
    }
}

/// One connect attempt, mutually exclusive with itself and aborted by the
/// stop token.
async fn connect_once(
    client: &reqwest::Client,
    url: &str,
    connect_lock: &tokio::sync::Mutex<()>,
    stop: &CancellationToken,
) -> Result<reqwest::Response> {
    let _guard = connect_lock.lock().await;

    let response = tokio::select! {
        _ = stop.cancelled() => return Err(MixError::Cancelled),
        result = client.get(url).send() => result.map_err(|e| MixError::TransportMissing {
            endpoint: format!("{url}: {e}"),
        })?,
    };

    if !response.status().is_success() {
        return Err(MixError::TransportMissing {
            endpoint: format!("{url}: HTTP {}", response.status()),
        });
    }

    Ok(response)
}

enum StreamEnd {
    Stopped,
    Disconnected,
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    response: reqwest::Response,
    url: String,
    client: reqwest::Client,
    hub: Arc<EventHub>,
    conn: Arc<ConnState>,
    connect_lock: Arc<tokio::sync::Mutex<()>>,
    stop: CancellationToken,
    active: watch::Receiver<ActiveKind>,
) {
    let mut response = Some(response);

    loop {
        if let Some(r) = response.take() {
            match read_stream(r, &hub, &conn, &stop).await {
                StreamEnd::Stopped => {
                    conn.set_connected(false);
                    debug!(url, "SSE transport stopped");
                    return;
                }
                StreamEnd::Disconnected => {
                    conn.set_connected(false);
                }
            }
        }

        tokio::select! {
            _ = stop.cancelled() => {
                debug!(url, "SSE transport stopped");
                return;
            }
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }

        // If another transport took over in the meantime, exit silently.
        if *active.borrow() != ActiveKind::Sse {
            debug!(url, "SSE is no longer the active transport, exiting retry loop");
            return;
        }

        match connect_once(&client, &url, &connect_lock, &stop).await {
            Ok(r) => {
                info!(url, "reconnected to SSE stream");
                response = Some(r);
            }
            Err(MixError::Cancelled) => return,
            Err(e) => {
                warn!(url, "SSE reconnect failed: {e}");
            }
        }
    }
}

async fn read_stream(
    response: reqwest::Response,
    hub: &EventHub,
    conn: &ConnState,
    stop: &CancellationToken,
) -> StreamEnd {
    let mut stream = response.bytes_stream();
    let mut parser = FrameParser::default();

    loop {
        let chunk = tokio::select! {
            _ = stop.cancelled() => return StreamEnd::Stopped,
            next = tokio::time::timeout(IDLE_TIMEOUT, stream.next()) => match next {
                Err(_) => {
                    warn!("SSE stream idle past {IDLE_TIMEOUT:?}, treating as disconnect");
                    return StreamEnd::Disconnected;
                }
                Ok(None) => {
                    info!("SSE stream closed by server");
                    return StreamEnd::Disconnected;
                }
                Ok(Some(Err(e))) => {
                    warn!("SSE read error: {e}");
                    return StreamEnd::Disconnected;
                }
                Ok(Some(Ok(bytes))) => bytes,
            }
        };

        // Any traffic counts as liveness, including bare keep-alive lines.
        conn.set_connected(true);

        for frame in parser.feed(&chunk) {
            if frame.event == "state" {
                hub.handle_payload(frame.data.as_bytes());
            } else {
                debug!(event = %frame.event, "ignoring non-state SSE frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_parses() {
        let mut parser = FrameParser::default();
        let frames = parser.feed(b"event: state\ndata: {\"id\":\"sensor-pot1\",\"value\":5}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "state");
        assert_eq!(frames[0].data, r#"{"id":"sensor-pot1","value":5}"#);
    }

    #[test]
    fn frame_split_across_chunks_reassembles() {
        let mut parser = FrameParser::default();
        assert!(parser.feed(b"event: sta").is_empty());
        assert!(parser.feed(b"te\ndata: {\"id\":\"x\"").is_empty());
        let frames = parser.feed(b"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, r#"{"id":"x"}"#);
    }

    #[test]
    fn keep_alive_blank_lines_emit_nothing() {
        let mut parser = FrameParser::default();
        assert!(parser.feed(b"\n\n\n").is_empty());
    }

    #[test]
    fn event_type_defaults_to_message() {
        let mut parser = FrameParser::default();
        let frames = parser.feed(b"data: hello\n\n");
        assert_eq!(frames[0].event, "message");
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let mut parser = FrameParser::default();
        let frames = parser.feed(b"data: one\ndata: two\n\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn id_retry_and_comment_lines_are_ignored() {
        let mut parser = FrameParser::default();
        let frames = parser.feed(b"retry: 30000\nid: 17\n: comment\nevent: ping\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "ping");
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn crlf_lines_parse() {
        let mut parser = FrameParser::default();
        let frames = parser.feed(b"event: state\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "state");
    }
}
