//! SSE relay server: fans the local device stream out to other instances.
//!
//! Every URL path serves the same stream. A new client gets a `retry`
//! directive, a `ping` with fixed metadata, and one `state` frame per known
//! sensor, then live `state` frames as events arrive and a `ping` every ten
//! seconds.

use crate::error::{MixError, Result};
use crate::event::RawState;
use crate::state::DeviceState;
use axum::extract::State;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry directive sent to every client, milliseconds. Fixed by the device's
/// own stream format.
const RETRY_MS: u64 = 30_000;

/// Keep-alive interval for NAT/proxy paths.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Graceful shutdown deadline before the listener is force-closed.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Per-client frame buffer; a client this far behind starts losing frames.
const CLIENT_BUFFER: usize = 32;

/// One outbound frame, shared by all clients and converted per connection.
#[derive(Debug, Clone)]
enum Frame {
    Retry,
    Message {
        id: u64,
        event: &'static str,
        data: String,
    },
}

impl Frame {
    fn into_sse(self) -> SseEvent {
        match self {
            Self::Retry => SseEvent::default().retry(Duration::from_millis(RETRY_MS)),
            Self::Message { id, event, data } => SseEvent::default()
                .id(id.to_string())
                .event(event)
                .data(data),
        }
    }
}

/// State shared between the HTTP handlers and the broadcast side.
struct Shared {
    device_state: Arc<DeviceState>,
    clients: Mutex<Vec<mpsc::Sender<Frame>>>,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn ping_frame(&self) -> Frame {
        Frame::Message {
            id: self.next_id(),
            event: "ping",
            data: json!({
                "title": "Mixer",
                "comment": "",
                "ota": false,
                "log": false,
                "lang": "en",
            })
            .to_string(),
        }
    }

    fn state_frame(&self, wire_id: &str, value: serde_json::Value) -> Frame {
        Frame::Message {
            id: self.next_id(),
            event: "state",
            data: json!({ "id": wire_id, "value": value }).to_string(),
        }
    }

    /// Register a client: returns its connect preamble and live receiver.
    fn attach_client(&self) -> (Vec<Frame>, mpsc::Receiver<Frame>) {
        let mut preamble = vec![Frame::Retry, self.ping_frame()];
        for (wire_id, value) in self.device_state.snapshot() {
            preamble.push(self.state_frame(&wire_id, value));
        }

        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        self.clients.lock().unwrap().push(tx);
        (preamble, rx)
    }

    /// Best-effort fan-out. A closed client is dropped; a full one loses
    /// this frame but keeps its connection. Never blocks.
    fn broadcast(&self, frame: &Frame) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("relay client falling behind, dropping frame");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

struct Running {
    port: u16,
    bound_port: u16,
    cancel: CancellationToken,
    serve_handle: tokio::task::JoinHandle<()>,
}

/// The relay server. Enabled iff the configured port is positive; restarts
/// when the port changes.
pub struct RelayServer {
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl RelayServer {
    pub fn new(device_state: Arc<DeviceState>) -> Self {
        Self {
            shared: Arc::new(Shared {
                device_state,
                clients: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bind the listener and start serving. Already running on the same
    /// port is a no-op; a different port restarts the server.
    pub async fn start(&self, port: u16) -> Result<()> {
        let mut running = self.running.lock().await;

        if let Some(current) = running.as_ref() {
            if current.port == port {
                debug!(port, "relay already running on this port");
                return Ok(());
            }
            info!(old_port = current.port, new_port = port, "relay port changed, restarting");
            let current = running.take().expect("checked above");
            self.stop_running(current).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| MixError::Relay(format!("bind port {port}: {e}")))?;
        let bound_port = listener.local_addr().map_or(port, |addr| addr.port());

        let app = Router::new()
            .route("/", get(stream_handler))
            .fallback(get(stream_handler))
            .with_state(self.shared.clone());

        let cancel = CancellationToken::new();

        let serve_cancel = cancel.clone();
        let serve_handle = tokio::spawn(async move {
            let shutdown = async move { serve_cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("relay server error: {e}");
            }
        });

        let ping_shared = self.shared.clone();
        let ping_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await; // immediate first tick is not a keep-alive
            loop {
                tokio::select! {
                    _ = ping_cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let frame = ping_shared.ping_frame();
                        ping_shared.broadcast(&frame);
                    }
                }
            }
        });

        info!(port = bound_port, "relay server listening");
        *running = Some(Running {
            port,
            bound_port,
            cancel,
            serve_handle,
        });
        Ok(())
    }

    /// The port actually bound, e.g. after requesting an ephemeral one.
    pub async fn bound_port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.bound_port)
    }

    /// Close all clients, then stop the listener within the shutdown
    /// deadline, force-closing past it. Idempotent.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(current) = running.take() {
            self.stop_running(current).await;
        }
    }

    async fn stop_running(&self, running: Running) {
        let dropped = {
            let mut clients = self.shared.clients.lock().unwrap();
            let count = clients.len();
            clients.clear();
            count
        };
        if dropped > 0 {
            debug!(count = dropped, "closed relay client connections");
        }

        running.cancel.cancel();
        let mut handle = running.serve_handle;
        if tokio::time::timeout(SHUTDOWN_DEADLINE, &mut handle)
            .await
            .is_err()
        {
            warn!("relay did not shut down gracefully, forcing close");
            handle.abort();
        }
        info!("relay server stopped");
    }

    /// React to a config reload: start, restart or stop per the new port.
    pub async fn apply_config(&self, relay_port: u16) {
        if relay_port > 0 {
            if let Err(e) = self.start(relay_port).await {
                warn!("relay start failed: {e}");
            }
        } else {
            self.stop().await;
        }
    }

    /// Translate one upstream event into a `state` broadcast.
    pub fn broadcast_state(&self, raw: &RawState) {
        let frame = self
            .shared
            .state_frame(&raw.wire_name(), raw.json_value());
        self.shared.broadcast(&frame);
    }

    pub fn client_count(&self) -> usize {
        self.shared.client_count()
    }
}

async fn stream_handler(
    State(shared): State<Arc<Shared>>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let (preamble, rx) = shared.attach_client();
    info!(clients = shared.client_count(), "relay client connected");

    let stream = tokio_stream::iter(preamble)
        .chain(ReceiverStream::new(rx))
        .map(|frame| Ok(frame.into_sse()));

    Sse::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with_state(state: Arc<DeviceState>) -> Arc<Shared> {
        Arc::new(Shared {
            device_state: state,
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn data_of(frame: &Frame) -> &str {
        match frame {
            Frame::Message { data, .. } => data,
            Frame::Retry => panic!("expected message frame"),
        }
    }

    #[tokio::test]
    async fn preamble_is_retry_ping_then_states() {
        let state = Arc::new(DeviceState::new());
        state.record(&RawState::Pot { id: 2, value: 81.0 });
        state.record(&RawState::Switch { id: 0, state: true });
        let shared = shared_with_state(state);

        let (preamble, _rx) = shared.attach_client();

        assert!(matches!(preamble[0], Frame::Retry));
        match &preamble[1] {
            Frame::Message { event, data, .. } => {
                assert_eq!(*event, "ping");
                let value: serde_json::Value = serde_json::from_str(data).unwrap();
                assert_eq!(value["title"], "Mixer");
                assert_eq!(value["lang"], "en");
                assert_eq!(value["ota"], false);
            }
            Frame::Retry => panic!("expected ping"),
        }

        // one state frame per known sensor, minimal payload
        assert_eq!(preamble.len(), 4);
        let first: serde_json::Value = serde_json::from_str(data_of(&preamble[2])).unwrap();
        assert_eq!(first["id"], "binary_sensor-sw0");
        assert_eq!(first["value"], true);
        let second: serde_json::Value = serde_json::from_str(data_of(&preamble[3])).unwrap();
        assert_eq!(second["id"], "sensor-pot2");
        assert_eq!(second["value"], 81);
        assert!(second.get("state").is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_attached_client() {
        let state = Arc::new(DeviceState::new());
        let shared = shared_with_state(state.clone());
        let relay = RelayServer {
            shared: shared.clone(),
            running: tokio::sync::Mutex::new(None),
        };

        let (_preamble, mut rx) = shared.attach_client();

        relay.broadcast_state(&RawState::Pot { id: 2, value: 81.0 });

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(data_of(&frame)).unwrap();
        assert_eq!(value["id"], "sensor-pot2");
        assert_eq!(value["value"], 81);
    }

    #[tokio::test]
    async fn event_ids_increase_monotonically() {
        let shared = shared_with_state(Arc::new(DeviceState::new()));
        let ids: Vec<u64> = (0..3)
            .map(|_| match shared.ping_frame() {
                Frame::Message { id, .. } => id,
                Frame::Retry => unreachable!(),
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn closed_clients_are_dropped_from_broadcast() {
        let shared = shared_with_state(Arc::new(DeviceState::new()));
        let (_p1, rx1) = shared.attach_client();
        let (_p2, _rx2) = shared.attach_client();
        assert_eq!(shared.client_count(), 2);

        drop(rx1);
        let frame = shared.ping_frame();
        shared.broadcast(&frame);
        assert_eq!(shared.client_count(), 1);
    }

    #[tokio::test]
    async fn server_starts_stops_and_restarts_on_port_change() {
        let relay = RelayServer::new(Arc::new(DeviceState::new()));

        relay.start(0).await.unwrap();
        assert!(relay.is_running().await);

        relay.stop().await;
        assert!(!relay.is_running().await);

        // disabled config is a no-op stop
        relay.apply_config(0).await;
        assert!(!relay.is_running().await);
    }
}
