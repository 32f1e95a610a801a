use super::{ActiveKind, ConnState, EventHub, RETRY_DELAY};
use crate::error::{MixError, Result};
use crate::event::extract_payload;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout between characters before a blocking read returns.
const INTER_CHARACTER_TIMEOUT: Duration = Duration::from_millis(50);

/// Line-oriented serial transport.
///
/// Owns its port exclusively. After a successful `start()` a background task
/// reads lines until the connection drops, then retries every two seconds as
/// long as this transport is still the supervisor's active one.
pub struct SerialTransport {
    port: String,
    baud: u32,
    hub: Arc<EventHub>,
    active: watch::Receiver<ActiveKind>,
    conn: Arc<ConnState>,
    stop: CancellationToken,
}

impl SerialTransport {
    pub fn new(
        port: String,
        baud: u32,
        hub: Arc<EventHub>,
        active: watch::Receiver<ActiveKind>,
    ) -> Self {
        Self {
            port,
            baud,
            hub,
            active,
            conn: Arc::new(ConnState::default()),
            stop: CancellationToken::new(),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Open the port and launch the read loop.
    ///
    /// # Errors
    /// `TransportBusy` when the port is occupied or access is denied (the
    /// caller treats this as terminal), `TransportMissing` when the port
    /// doesn't exist (the caller may fall back to SSE).
    pub async fn start(&self) -> Result<()> {
        let stream = open_port(&self.port, self.baud)?;
        self.conn.set_connected(true);
        info!(port = %self.port, baud = self.baud, "connected to serial port");

        tokio::spawn(run_loop(
            stream,
            self.port.clone(),
            self.baud,
            self.hub.clone(),
            self.conn.clone(),
            self.stop.clone(),
            self.active.clone(),
        ));

        Ok(())
    }

    /// Signal the read loop to shut down. Idempotent.
    pub fn stop(&self) {
        if self.conn.is_connected() {
            debug!(port = %self.port, "shutting down serial connection");
        }
        self.stop.cancel();
    }

    /// Wait for `is_connected()` to flip false, up to `timeout`.
    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        self.conn.wait_for_stop(timeout).await
    }
}

fn open_port(port: &str, baud: u32) -> Result<SerialStream> {
    let builder = tokio_serial::new(port, baud)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .timeout(INTER_CHARACTER_TIMEOUT);

    SerialStream::open(&builder).map_err(|e| classify_open_error(port, &e))
}

/// Split port-open failures into the two cases the supervisor cares about:
/// busy/permission (terminal) and missing (fallback candidate).
fn classify_open_error(port: &str, error: &tokio_serial::Error) -> MixError {
    use std::io::ErrorKind as IoKind;
    use tokio_serial::ErrorKind;

    let description = error.description.to_lowercase();

    match error.kind() {
        ErrorKind::NoDevice => MixError::TransportMissing {
            endpoint: port.to_string(),
        },
        ErrorKind::Io(IoKind::NotFound) => MixError::TransportMissing {
            endpoint: port.to_string(),
        },
        ErrorKind::Io(IoKind::PermissionDenied) => MixError::TransportBusy {
            port: port.to_string(),
        },
        _ if description.contains("permission denied")
            || description.contains("access is denied")
            || description.contains("busy") =>
        {
            MixError::TransportBusy {
                port: port.to_string(),
            }
        }
        _ if description.contains("no such file") || description.contains("cannot find") => {
            MixError::TransportMissing {
                endpoint: port.to_string(),
            }
        }
        _ => MixError::TransportIo(format!("open {port}: {error}")),
    }
}

async fn run_loop(
    stream: SerialStream,
    port: String,
    baud: u32,
    hub: Arc<EventHub>,
    conn: Arc<ConnState>,
    stop: CancellationToken,
    active: watch::Receiver<ActiveKind>,
) {
    let mut stream = Some(stream);

    loop {
        if let Some(s) = stream.take() {
            read_lines(s, &hub, &stop).await;
            conn.set_connected(false);
        }

        if stop.is_cancelled() {
            debug!(port, "serial transport stopped");
            return;
        }

        tokio::select! {
            _ = stop.cancelled() => {
                debug!(port, "serial transport stopped");
                return;
            }
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }

        // If another transport took over in the meantime, exit silently.
        if *active.borrow() != ActiveKind::Serial {
            debug!(port, "serial is no longer the active transport, exiting retry loop");
            return;
        }

        match open_port(&port, baud) {
            Ok(s) => {
                conn.set_connected(true);
                info!(port, "reconnected to serial port");
                stream = Some(s);
            }
            Err(e) => {
                warn!(port, "serial reconnect failed: {e}");
            }
        }
    }
}

async fn read_lines(stream: SerialStream, hub: &EventHub, stop: &CancellationToken) {
    let mut lines = BufReader::new(stream).lines();

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(payload) = extract_payload(&line) {
                        hub.handle_payload(payload.as_bytes());
                    }
                }
                Ok(None) => {
                    info!("serial stream reached EOF, connection lost");
                    return;
                }
                Err(e) => {
                    warn!("serial read error, connection may be lost: {e}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(kind: tokio_serial::ErrorKind, description: &str) -> tokio_serial::Error {
        tokio_serial::Error::new(kind, description)
    }

    #[test]
    fn missing_port_classifies_as_missing() {
        let e = error(tokio_serial::ErrorKind::NoDevice, "device not configured");
        assert!(matches!(
            classify_open_error("/dev/ttyUSB9", &e),
            MixError::TransportMissing { .. }
        ));

        let e = error(
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound),
            "No such file or directory",
        );
        assert!(matches!(
            classify_open_error("/dev/ttyUSB9", &e),
            MixError::TransportMissing { .. }
        ));
    }

    #[test]
    fn busy_port_classifies_as_busy() {
        let e = error(
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied),
            "Permission denied",
        );
        assert!(matches!(
            classify_open_error("/dev/ttyUSB0", &e),
            MixError::TransportBusy { .. }
        ));

        let e = error(tokio_serial::ErrorKind::Unknown, "Device or resource busy");
        assert!(matches!(
            classify_open_error("/dev/ttyUSB0", &e),
            MixError::TransportBusy { .. }
        ));
    }

    #[test]
    fn other_failures_classify_as_io() {
        let e = error(tokio_serial::ErrorKind::InvalidInput, "bad baud rate");
        assert!(matches!(
            classify_open_error("/dev/ttyUSB0", &e),
            MixError::TransportIo(_)
        ));
    }
}
