//! Serial transport
//!
//! Owns the connection lifecycle (discover, open, settle, close) and line
//! writes. The read half of an open connection is handed to the response
//! correlator as an [`InboundLink`].

pub mod backend;
pub mod codec;

use futures::SinkExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::time::{self, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use backend::{DynSerial, NativeSerial, SerialBackend, SerialIo};
pub use codec::FeederLineCodec;

use crate::config::SerialSettings;
use crate::discovery::{find_target, PortDescriptor};
use crate::error::{FeederError, Result};

/// Boot output is discarded until the line has been quiet this long
const SETTLE_DRAIN_IDLE: Duration = Duration::from_millis(20);

/// Upper bound on the post-settle drain, for controllers that never go quiet
const SETTLE_DRAIN_MAX: Duration = Duration::from_millis(500);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Port opening or controller settling after reset
    Connecting,
    /// Connected and ready
    Connected,
    /// Teardown in progress
    Closing,
}

/// Inbound half of a connection, decoded into lines
pub type LineReader = FramedRead<ReadHalf<DynSerial>, FeederLineCodec>;
type LineWriter = FramedWrite<WriteHalf<DynSerial>, FeederLineCodec>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type WriterSlot = Arc<tokio::sync::Mutex<Option<LineWriter>>>;
type PortSlot = Arc<Mutex<Option<PortDescriptor>>>;

/// Connection resources shared between the transport and its reader task
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<Mutex<ConnectionState>>,
    shutdown: CancellationToken,
    writer: WriterSlot,
    port: PortSlot,
}

impl StateHandle {
    /// Current connection state
    pub fn get(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Tear down after a fatal read error; ignored once the connection was closed on purpose
    ///
    /// Drops the write half and forgets the port, so the device handle is
    /// released and the same port can be opened again.
    pub async fn mark_lost(&self, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        warn!("connection lost: {}", reason);
        release(&self.state, &self.shutdown, &self.writer, &self.port).await;
    }
}

/// Closing -> Disconnected, dropping the write half and the port descriptor
async fn release(
    state: &Mutex<ConnectionState>,
    shutdown: &CancellationToken,
    writer: &WriterSlot,
    port: &PortSlot,
) {
    *lock(state) = ConnectionState::Closing;
    shutdown.cancel();
    writer.lock().await.take();
    lock(port).take();
    *lock(state) = ConnectionState::Disconnected;
}

/// Read side of an open connection
pub struct InboundLink {
    /// Decoded inbound lines
    pub lines: LineReader,
    /// Cancelled when the connection is closed or lost
    pub shutdown: CancellationToken,
    /// Used to tear the connection down when the read side fails
    pub state: StateHandle,
}

/// Serial connection to the feeder controller
pub struct Transport {
    settings: SerialSettings,
    backend: Arc<dyn SerialBackend>,
    state: Arc<Mutex<ConnectionState>>,
    shutdown: Mutex<CancellationToken>,
    writer: WriterSlot,
    port: PortSlot,
}

impl Transport {
    /// Create a transport (not yet connected)
    pub fn new(settings: SerialSettings, backend: Arc<dyn SerialBackend>) -> Self {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        Self {
            settings,
            backend,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            shutdown: Mutex::new(shutdown),
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            port: Arc::new(Mutex::new(None)),
        }
    }

    /// Serial settings this transport opens ports with
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Port source used for discovery and opening
    pub fn backend(&self) -> &Arc<dyn SerialBackend> {
        &self.backend
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Whether commands can be written
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Port of the current connection
    pub fn port(&self) -> Option<PortDescriptor> {
        lock(&self.port).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Open the controller port
    ///
    /// With no target, discovery picks one. The controller reboots when the
    /// port opens, so the transport waits out the settle window and discards
    /// whatever the board printed while booting before reporting `Connected`.
    pub async fn open(&self, target: Option<PortDescriptor>) -> Result<InboundLink> {
        let shutdown = {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Disconnected => {}
                ConnectionState::Connected | ConnectionState::Connecting => {
                    return Err(FeederError::AlreadyConnected)
                }
                ConnectionState::Closing => {
                    return Err(FeederError::TransportError(
                        "previous connection is still closing".to_string(),
                    ))
                }
            }
            *state = ConnectionState::Connecting;
            let token = CancellationToken::new();
            *lock(&self.shutdown) = token.clone();
            token
        };

        match self.establish(target, shutdown.clone()).await {
            Ok(link) => Ok(link),
            Err(e) => {
                shutdown.cancel();
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        target: Option<PortDescriptor>,
        shutdown: CancellationToken,
    ) -> Result<InboundLink> {
        let target = match target {
            Some(target) => target,
            None => {
                let ports = self.backend.enumerate();
                debug!("discovery: {} serial port(s) attached", ports.len());
                find_target(&ports).ok_or(FeederError::DeviceNotFound)?
            }
        };

        info!(
            "opening {} ({}) at {} baud",
            target.path, target.description, self.settings.baud_rate
        );
        let mut stream = self.backend.open(&target.path, &self.settings)?;

        debug!(
            "waiting {}ms after port open for controller reset",
            self.settings.settle_ms
        );
        tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(FeederError::TransportError(
                    "connection closed while the controller was settling".to_string(),
                ));
            }
            _ = time::sleep(self.settings.settle()) => {}
        }

        let discarded = discard_pending(&mut stream)
            .await
            .map_err(|e| FeederError::TransportError(format!("settle read failed: {}", e)))?;
        if discarded > 0 {
            debug!("discarded {} byte(s) of boot output", discarded);
        }

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(FramedWrite::new(write_half, FeederLineCodec::new()));

        let promoted = {
            let mut state = lock(&self.state);
            let still_opening = !shutdown.is_cancelled() && *state == ConnectionState::Connecting;
            if still_opening {
                *state = ConnectionState::Connected;
            }
            still_opening
        };
        if !promoted {
            self.writer.lock().await.take();
            return Err(FeederError::TransportError(
                "connection closed while opening".to_string(),
            ));
        }
        info!("connected to {}", target.path);
        *lock(&self.port) = Some(target);

        Ok(InboundLink {
            lines: FramedRead::new(read_half, FeederLineCodec::new()),
            shutdown: shutdown.clone(),
            state: StateHandle {
                state: self.state.clone(),
                shutdown,
                writer: self.writer.clone(),
                port: self.port.clone(),
            },
        })
    }

    /// Close the connection; safe to call in any state and idempotent
    pub async fn close(&self) {
        let was = {
            let mut state = lock(&self.state);
            let was = *state;
            if was != ConnectionState::Disconnected {
                *state = ConnectionState::Closing;
            }
            was
        };

        lock(&self.shutdown).cancel();
        self.writer.lock().await.take();
        lock(&self.port).take();
        self.set_state(ConnectionState::Disconnected);

        if was != ConnectionState::Disconnected {
            info!("disconnected");
        }
    }

    /// Cancel the connection without waiting on the writer (for `Drop`)
    pub fn abort(&self) {
        lock(&self.shutdown).cancel();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Write one command line and flush it immediately
    ///
    /// Writes are serialized; a failed or stalled write tears the connection
    /// down and is reported as `TransportError`, never retried.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(FeederError::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(FeederError::NotConnected)?;
        trace!(">> {}", text);

        let failure = match time::timeout(self.settings.write_timeout(), sink.send(text)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => format!("write of '{}' failed: {}", text, e),
            Err(_) => format!(
                "write of '{}' did not complete within {}ms",
                text, self.settings.write_timeout_ms
            ),
        };

        drop(writer);
        warn!("{}", failure);
        let shutdown = lock(&self.shutdown).clone();
        release(&self.state, &shutdown, &self.writer, &self.port).await;
        Err(FeederError::TransportError(failure))
    }
}

/// Read and drop bytes until the line goes idle; returns the number discarded
async fn discard_pending(stream: &mut DynSerial) -> io::Result<usize> {
    let deadline = Instant::now() + SETTLE_DRAIN_MAX;
    let mut buffer = [0u8; 256];
    let mut total = 0;

    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!("controller still talking after settle drain; continuing");
            break;
        }
        let idle = SETTLE_DRAIN_IDLE.min(deadline - now);
        match time::timeout(idle, stream.read(&mut buffer)).await {
            Err(_) => break,
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "port closed during settle",
                ))
            }
            Ok(Ok(n)) => {
                trace!("settle: discarding {:?}", String::from_utf8_lossy(&buffer[..n]));
                total += n;
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => break,
            Ok(Err(e)) => return Err(e),
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoPorts;

    impl SerialBackend for NoPorts {
        fn enumerate(&self) -> Vec<PortDescriptor> {
            Vec::new()
        }

        fn open(&self, path: &str, _settings: &SerialSettings) -> Result<DynSerial> {
            Err(FeederError::TransportError(format!("no such port {}", path)))
        }
    }

    fn transport() -> Transport {
        Transport::new(SerialSettings::default(), Arc::new(NoPorts))
    }

    #[test]
    fn test_new_transport_is_disconnected() {
        let transport = transport();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.port().is_none());
    }

    #[tokio::test]
    async fn test_open_without_ports_is_device_not_found() {
        let transport = transport();
        let err = transport.open(None).await.err().unwrap();
        assert!(matches!(err, FeederError::DeviceNotFound));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_open_failure_returns_to_disconnected() {
        let transport = transport();
        let err = transport
            .open(Some(PortDescriptor::from_path("/dev/ttyACM9")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FeederError::TransportError(_)));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_write_while_disconnected() {
        let transport = transport();
        assert!(matches!(
            transport.write_line("STOP").await,
            Err(FeederError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = transport();
        transport.close().await;
        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_pending_drops_buffered_bytes() {
        let (host, mut device) = tokio::io::duplex(256);
        tokio::io::AsyncWriteExt::write_all(&mut device, b"boot banner\nv1.2\n")
            .await
            .unwrap();
        let mut stream: DynSerial = Box::new(host);
        assert_eq!(discard_pending(&mut stream).await.unwrap(), 17);
    }
}
