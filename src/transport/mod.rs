pub mod serial;
pub mod sse;

use crate::config::bus::ConfigBus;
use crate::config::schema::AppConfig;
use crate::error::MixError;
use crate::event::{decode_payload, DecodeOptions, Event, RawState, SliderMove, SwitchChange};
use crate::notify::Notifier;
use crate::state::DeviceState;
use serial::SerialTransport;
use sse::SseTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a supervisor waits for a transport to confirm it stopped before
/// proceeding with a swap.
pub(crate) const STOP_WAIT: Duration = Duration::from_millis(500);

/// Settle pause between stopping one transport and starting the next.
pub(crate) const SWAP_SETTLE: Duration = Duration::from_millis(50);

/// Delay between reconnection attempts, shared by both transports.
pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Which transport the supervisor currently runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveKind {
    Serial,
    Sse,
    None,
}

/// Connection flag shared between a transport's tasks and its callers.
/// `stop()` guarantees the flag flips within the supervisor's stop wait.
#[derive(Default)]
pub(crate) struct ConnState {
    connected: AtomicBool,
}

impl ConnState {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Poll until the connection flag drops or the deadline passes.
    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        !self.is_connected()
    }
}

/// Fans decoded events out to subscribers.
///
/// Every subscriber channel has capacity one and is fed with `try_send`: a
/// subscriber that has not consumed the previous event loses the older one,
/// never the transport's liveness. The device emits at bounded rates, so the
/// newest value is always the one that matters.
pub struct EventHub {
    bus: Arc<ConfigBus>,
    state: Arc<DeviceState>,
    sliders: RwLock<Option<Vec<mpsc::Sender<SliderMove>>>>,
    switches: RwLock<Option<Vec<mpsc::Sender<SwitchChange>>>>,
    raw: RwLock<Option<Vec<mpsc::Sender<RawState>>>>,
}

impl EventHub {
    pub fn new(bus: Arc<ConfigBus>, state: Arc<DeviceState>) -> Self {
        Self {
            bus,
            state,
            sliders: RwLock::new(Some(Vec::new())),
            switches: RwLock::new(Some(Vec::new())),
            raw: RwLock::new(Some(Vec::new())),
        }
    }

    pub fn subscribe_sliders(&self) -> mpsc::Receiver<SliderMove> {
        let (tx, rx) = mpsc::channel(1);
        if let Some(subs) = self.sliders.write().unwrap().as_mut() {
            subs.push(tx);
        }
        rx
    }

    pub fn subscribe_switches(&self) -> mpsc::Receiver<SwitchChange> {
        let (tx, rx) = mpsc::channel(1);
        if let Some(subs) = self.switches.write().unwrap().as_mut() {
            subs.push(tx);
        }
        rx
    }

    /// Raw device states, pre-inversion, as the relay re-broadcasts them.
    pub fn subscribe_raw(&self) -> mpsc::Receiver<RawState> {
        let (tx, rx) = mpsc::channel(1);
        if let Some(subs) = self.raw.write().unwrap().as_mut() {
            subs.push(tx);
        }
        rx
    }

    /// Decode one state payload and deliver the result. Malformed payloads
    /// are dropped silently.
    pub fn handle_payload(&self, payload: &[u8]) {
        let Some(raw) = decode_payload(payload) else {
            return;
        };

        let prev = self.state.record(&raw);
        Self::deliver(&self.raw, raw.clone());

        let config = self.bus.current();
        let event = raw.into_event(DecodeOptions {
            invert_sliders: config.invert_sliders,
        });

        match event {
            Event::SliderMove(mut movement) => {
                // A pinned slider always reports its override value.
                if let Some(percent) = config.slider_override.get(&movement.slider_id) {
                    movement.percent = f32::from(*percent) / 100.0;
                }
                Self::deliver(&self.sliders, movement);
            }
            Event::SwitchChange(mut change) => {
                change.prev_state = prev;
                Self::deliver(&self.switches, change);
            }
        }
    }

    fn deliver<T: Clone>(lock: &RwLock<Option<Vec<mpsc::Sender<T>>>>, event: T) {
        // Copy the list under the read lock, deliver after releasing it.
        let subs = {
            let guard = lock.read().unwrap();
            match guard.as_ref() {
                Some(subs) => subs.clone(),
                None => return,
            }
        };

        for sub in &subs {
            let _ = sub.try_send(event.clone());
        }
    }

    /// Close all subscriber channels exactly once. Subscribers treat a closed
    /// channel as their exit signal.
    pub fn close(&self) {
        self.sliders.write().unwrap().take();
        self.switches.write().unwrap().take();
        self.raw.write().unwrap().take();
        debug!("closed event hub");
    }
}

enum ActiveTransport {
    Serial(SerialTransport),
    Sse(SseTransport),
    None,
}

impl ActiveTransport {
    fn kind(&self) -> ActiveKind {
        match self {
            Self::Serial(_) => ActiveKind::Serial,
            Self::Sse(_) => ActiveKind::Sse,
            Self::None => ActiveKind::None,
        }
    }
}

/// Selects, starts, stops and swaps the single active transport.
///
/// All lifecycle transitions happen under one async mutex; at most one
/// transport is started at any time across the supervisor's lifetime.
pub struct TransportSupervisor {
    hub: Arc<EventHub>,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
    active: tokio::sync::Mutex<ActiveTransport>,
    active_kind: watch::Sender<ActiveKind>,
}

impl TransportSupervisor {
    pub fn new(
        hub: Arc<EventHub>,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            notifier,
            shutdown,
            active: tokio::sync::Mutex::new(ActiveTransport::None),
            active_kind: watch::Sender::new(ActiveKind::None),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self.active.try_lock() {
            Ok(guard) => match &*guard {
                ActiveTransport::Serial(t) => t.is_connected(),
                ActiveTransport::Sse(t) => t.is_connected(),
                ActiveTransport::None => false,
            },
            // a swap is in flight
            Err(_) => false,
        }
    }

    /// Start the transport preferred by `config`.
    pub async fn start(&self, config: &AppConfig) {
        let mut guard = self.active.lock().await;
        self.select_and_start(&mut guard, config).await;
    }

    /// Preference order: serial first; SSE only as fallback when the serial
    /// failure is a missing port. A busy port is terminal.
    async fn select_and_start(&self, guard: &mut ActiveTransport, config: &AppConfig) {
        let conn = &config.connection;
        let serial_ok = conn.serial_configured();
        let sse_ok = conn.sse_configured();

        if !serial_ok && !sse_ok {
            warn!("no transport configured");
            self.notifier.notify(
                "No transport configured!",
                "Set a serial port or an SSE URL in the configuration.",
            );
            self.set_active(guard, ActiveTransport::None);
            self.shutdown.cancel();
            return;
        }

        if serial_ok {
            let port = conn.serial_port.clone().unwrap_or_default();
            let baud = conn.serial_baud.unwrap_or_default();
            let transport = SerialTransport::new(
                port.clone(),
                baud,
                self.hub.clone(),
                self.active_kind.subscribe(),
            );

            // The retry loop's "still active?" pre-check must already see us.
            self.active_kind.send_replace(ActiveKind::Serial);

            match transport.start().await {
                Ok(()) => {
                    info!(port, baud, "serial transport active");
                    *guard = ActiveTransport::Serial(transport);
                    return;
                }
                Err(MixError::TransportBusy { port }) => {
                    warn!(port, "serial port busy, stopping");
                    self.notifier.notify(
                        &format!("Can't connect to {port}!"),
                        "This serial port is busy; close any serial monitor or other running instance.",
                    );
                    self.set_active(guard, ActiveTransport::None);
                    self.shutdown.cancel();
                    return;
                }
                Err(e @ MixError::TransportMissing { .. }) if sse_ok => {
                    info!("serial unavailable ({e}), falling back to SSE");
                }
                Err(e) if sse_ok => {
                    warn!(port, "serial start failed ({e}), trying SSE");
                }
                Err(e) => {
                    warn!(port, "serial start failed: {e}");
                    self.notifier.notify(
                        &format!("Can't connect to {port}!"),
                        "This serial port doesn't exist; check your configuration.",
                    );
                    self.set_active(guard, ActiveTransport::None);
                    self.shutdown.cancel();
                    return;
                }
            }
        }

        let url = conn.sse_url.clone().unwrap_or_default();
        let transport = SseTransport::new(
            url.clone(),
            self.hub.clone(),
            self.active_kind.subscribe(),
        );

        self.active_kind.send_replace(ActiveKind::Sse);

        match transport.start().await {
            Ok(()) => {
                info!(url, "SSE transport active");
                *guard = ActiveTransport::Sse(transport);
            }
            Err(e) => {
                warn!(url, "SSE start failed: {e}");
                self.notifier.notify(
                    &format!("Can't connect to {url}!"),
                    "Make sure the URL is correct and the device event stream is reachable.",
                );
                self.set_active(guard, ActiveTransport::None);
                self.shutdown.cancel();
            }
        }
    }

    /// React to a config reload: swap transports if the desired identity or
    /// the active one's connection parameters changed, otherwise leave the
    /// running transport alone.
    pub async fn apply_config(&self, config: &AppConfig) {
        let mut guard = self.active.lock().await;
        let conn = &config.connection;

        let desired = if conn.serial_configured() {
            ActiveKind::Serial
        } else if conn.sse_configured() {
            ActiveKind::Sse
        } else {
            ActiveKind::None
        };

        let params_changed = match &*guard {
            ActiveTransport::Serial(t) => {
                conn.serial_port.as_deref() != Some(t.port()) || conn.serial_baud != Some(t.baud())
            }
            ActiveTransport::Sse(t) => conn.sse_url.as_deref() != Some(t.url()),
            ActiveTransport::None => false,
        };

        if desired == guard.kind() && !params_changed {
            debug!("transport config unchanged");
            return;
        }

        info!(
            from = ?guard.kind(),
            to = ?desired,
            params_changed,
            "transport change detected, swapping"
        );

        self.stop_current(&mut guard).await;
        tokio::time::sleep(SWAP_SETTLE).await;
        self.select_and_start(&mut guard, config).await;
    }

    /// Stop whatever transport runs, for shutdown.
    pub async fn shutdown_transport(&self) {
        let mut guard = self.active.lock().await;
        self.stop_current(&mut guard).await;
    }

    async fn stop_current(&self, guard: &mut ActiveTransport) {
        match &*guard {
            ActiveTransport::Serial(t) => {
                t.stop();
                if !t.wait_for_stop(STOP_WAIT).await {
                    warn!("serial transport did not stop within timeout, proceeding");
                }
            }
            ActiveTransport::Sse(t) => {
                t.stop();
                if !t.wait_for_stop(STOP_WAIT).await {
                    warn!("SSE transport did not stop within timeout, proceeding");
                }
            }
            ActiveTransport::None => {}
        }
        self.set_active(guard, ActiveTransport::None);
    }

    fn set_active(&self, guard: &mut ActiveTransport, transport: ActiveTransport) {
        self.active_kind.send_replace(transport.kind());
        *guard = transport;
    }
}
