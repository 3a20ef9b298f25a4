//! Connected MP-285 session.
//!
//! A [`Session`] owns the serial link for its whole lifetime and serializes
//! every request/reply exchange behind a single async lock, so two callers can
//! never interleave bytes on the half-duplex wire. It caches the last known
//! position and active manipulator, and records queries and moves in the CSV
//! [`EventLog`].
//!
//! # Example Usage
//!
//! ```no_run
//! use mp285::config::{LogConfig, StageConfig};
//! use mp285::event_log::AlwaysOverwrite;
//! use mp285::protocol::Position;
//! use mp285::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StageConfig::new("/dev/ttyUSB0");
//!     let log = LogConfig { path: Some("positions.csv".into()) };
//!     let stage = Session::open(config, &log, &AlwaysOverwrite).await?;
//!
//!     stage.move_to(Position::from((3625, 4108, 9000))).await?;
//!     println!("Now at {}", stage.query().await?);
//!
//!     stage.close().await;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{LogConfig, StageConfig};
use crate::error::{StageError, StageResult};
use crate::event_log::{EventLog, ExistingLogPolicy, LogEvent};
use crate::protocol::{self, Position, MANIPULATOR_REPLY_LEN, MOVE_ACK_LEN, POSITION_REPLY_LEN};

use crate::TRACE_TARGET as TARGET;

/// Quiet period that ends a drain of stale input.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// Any byte stream that can stand in for the serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed serial link.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Everything guarded by the exchange lock.
struct SessionState {
    /// `None` once closed
    port: Option<DynSerial>,
    position: Option<Position>,
    manipulator: Option<u8>,
    log: Option<EventLog>,
    /// Set when an exchange timed out and its reply may still arrive
    stale: bool,
}

/// Exclusive, connected MP-285.
pub struct Session {
    config: StageConfig,
    state: Mutex<SessionState>,
}

impl Session {
    /// Open the serial port, create the event log and read the initial
    /// position.
    ///
    /// The link runs at `config.baud_rate` (128000 for the MP-285), 8 data
    /// bits, no parity, one stop bit, no flow control.
    ///
    /// # Errors
    /// - `StageError::Config` for an invalid `config`
    /// - `StageError::Connection` if the port cannot be opened. This is never
    ///   retried; the caller decides whether to exit.
    /// - `StageError::LogWrite` if the log cannot be created
    /// - any error from the initial position query
    pub async fn open<P>(config: StageConfig, log: &LogConfig, policy: &P) -> StageResult<Self>
    where
        P: ExistingLogPolicy + ?Sized,
    {
        config.validate()?;
        let port = open_port(&config)?;
        info!(target: TARGET, "Connected to Sutter MP-285 on '{}' at {} baud", config.port, config.baud_rate);
        Self::with_port(port, config, log, policy).await
    }

    /// Same lifecycle as [`Session::open`] over an already connected link.
    ///
    /// # Errors
    /// `StageError::Config` for an invalid `config`, before anything is sent.
    pub async fn with_port<P>(
        port: DynSerial,
        config: StageConfig,
        log: &LogConfig,
        policy: &P,
    ) -> StageResult<Self>
    where
        P: ExistingLogPolicy + ?Sized,
    {
        config.validate()?;
        let log = match &log.path {
            Some(path) => Some(EventLog::create(path, policy)?),
            None => {
                warn!(target: TARGET, "No logfile configured, not logging stage events");
                None
            }
        };

        let session = Self {
            config,
            state: Mutex::new(SessionState {
                port: Some(port),
                position: None,
                manipulator: None,
                log,
                stale: false,
            }),
        };

        // The `start` row stands in for this read; it is not logged separately.
        {
            let mut state = session.state.lock().await;
            let position = session.read_position(&mut state).await?;
            state.position = Some(position);
            info!(target: TARGET, "Initial position: {}", position);
        }

        Ok(session)
    }

    /// Query the current position, refresh the cache and log `get_pos`.
    ///
    /// # Errors
    /// `StageError::Timeout` if the device does not answer within the read
    /// timeout; the cached position is left as it was.
    pub async fn query(&self) -> StageResult<Position> {
        let mut state = self.state.lock().await;
        let position = self.read_position(&mut state).await?;
        state.position = Some(position);

        info!(
            target: TARGET,
            x = position.x,
            y = position.y,
            z = position.z,
            "Current position: {}",
            position
        );

        if let Some(log) = state.log.as_mut() {
            log.record(LogEvent::GetPos, Some(position))?;
        }
        Ok(position)
    }

    /// Move to `target` (µm) and wait for the stage to report completion.
    ///
    /// Returns once the device has sent its end-of-motion acknowledgement, or
    /// with `StageError::Timeout` if that does not arrive within the read
    /// timeout. The position is not re-read afterwards; the cache takes the
    /// commanded value.
    ///
    /// Concurrent calls wait for the exchange in flight to finish.
    ///
    /// # Errors
    /// `StageError::Range` if `target` does not fit the wire format. Nothing
    /// is sent in that case.
    pub async fn move_to(&self, target: Position) -> StageResult<()> {
        let frame = protocol::encode_set_position(&target, self.config.stepmult)?;
        let mut state = self.state.lock().await;
        self.finish_move(&mut state, &frame, target).await
    }

    /// Like [`Session::move_to`] but fails with `StageError::Busy` instead of
    /// waiting when another exchange is in flight.
    pub async fn try_move_to(&self, target: Position) -> StageResult<()> {
        let frame = protocol::encode_set_position(&target, self.config.stepmult)?;
        let mut state = self.state.try_lock().map_err(|_| StageError::Busy)?;
        self.finish_move(&mut state, &frame, target).await
    }

    /// Query the active manipulator and refresh the cache.
    pub async fn query_manipulator(&self) -> StageResult<u8> {
        let mut state = self.state.lock().await;
        let mut reply = [0u8; MANIPULATOR_REPLY_LEN];
        self.transaction(&mut state, &protocol::encode_get_active_manipulator(), &mut reply)
            .await?;
        protocol::check_terminator(&reply, "manipulator")?;

        let manipulator = protocol::decode_manipulator_reply(&reply)?;
        state.manipulator = Some(manipulator);
        info!(target: TARGET, "Active manipulator: {}", manipulator);
        Ok(manipulator)
    }

    /// Not supported by this driver; always returns `StageError::Unsupported`.
    pub fn set_active_manipulator(&self, manipulator: u8) -> StageResult<()> {
        protocol::encode_set_active_manipulator(manipulator).map(|_| ())
    }

    /// Release the serial port. Calling it again does nothing.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut port) = state.port.take() {
            if let Err(e) = port.shutdown().await {
                debug!(target: TARGET, "Error shutting down serial link: {}", e);
            }
            info!(target: TARGET, "Connection to Sutter MP-285 closed");
        }
    }

    /// Last known position, without talking to the device.
    pub async fn position(&self) -> Option<Position> {
        self.state.lock().await.position
    }

    /// Last queried manipulator, without talking to the device.
    pub async fn manipulator(&self) -> Option<u8> {
        self.state.lock().await.manipulator
    }

    /// False after [`Session::close`].
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.port.is_some()
    }

    /// Path of the event log, if logging is enabled.
    pub async fn log_path(&self) -> Option<PathBuf> {
        let state = self.state.lock().await;
        state.log.as_ref().map(|log| log.path().to_path_buf())
    }

    /// Microsteps per micron for this device.
    pub fn stepmult(&self) -> u32 {
        self.config.stepmult
    }

    /// Read timeout for every exchange.
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    async fn read_position(&self, state: &mut SessionState) -> StageResult<Position> {
        let mut reply = [0u8; POSITION_REPLY_LEN];
        self.transaction(state, &protocol::encode_get_position(), &mut reply)
            .await?;
        protocol::check_terminator(&reply, "position")?;
        protocol::decode_position_reply(&reply, self.config.stepmult)
    }

    async fn finish_move(
        &self,
        state: &mut SessionState,
        frame: &[u8],
        target: Position,
    ) -> StageResult<()> {
        info!(
            target: TARGET,
            x = target.x,
            y = target.y,
            z = target.z,
            "Moving to {}",
            target
        );

        // The acknowledgement only arrives once motion has finished.
        let mut ack = [0u8; MOVE_ACK_LEN];
        self.transaction(state, frame, &mut ack).await?;
        protocol::check_terminator(&ack, "move")?;

        state.position = Some(target);
        if let Some(log) = state.log.as_mut() {
            log.record(LogEvent::SetPos, Some(target))?;
        }
        Ok(())
    }

    /// Send `request` and fill `reply` within the read timeout.
    ///
    /// The caller holds the state lock for the whole exchange.
    async fn transaction(
        &self,
        state: &mut SessionState,
        request: &[u8],
        reply: &mut [u8],
    ) -> StageResult<()> {
        let port = state
            .port
            .as_mut()
            .ok_or(StageError::SerialPortNotConnected)?;
        if std::mem::take(&mut state.stale) {
            drain_stale(port).await;
        }

        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, exchange(port, request, reply)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target: TARGET,
                    "No reply to '{}' within {:?}",
                    char::from(request[0]),
                    timeout
                );
                state.stale = true;
                Err(StageError::Timeout(timeout))
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.get_mut().port.take().is_some() {
            debug!(target: TARGET, "Serial link to MP-285 dropped without close()");
        }
    }
}

/// Discard whatever a timed-out exchange left behind, until the link has been
/// quiet for [`DRAIN_WINDOW`].
async fn drain_stale(port: &mut DynSerial) {
    let mut buf = [0u8; 64];
    let mut discarded = 0usize;
    while let Ok(Ok(n)) = tokio::time::timeout(DRAIN_WINDOW, port.read(&mut buf)).await {
        if n == 0 {
            break;
        }
        discarded += n;
    }
    if discarded > 0 {
        debug!(target: TARGET, "Discarded {} stale bytes from the serial link", discarded);
    }
}

async fn exchange(port: &mut DynSerial, request: &[u8], reply: &mut [u8]) -> StageResult<()> {
    port.write_all(request).await?;
    port.flush().await?;
    debug!(target: TARGET, "Sent {:02X?}", request);

    port.read_exact(reply).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            StageError::SerialUnexpectedEof
        } else {
            StageError::Io(e)
        }
    })?;
    debug!(target: TARGET, "Received {:02X?}", reply);
    Ok(())
}

#[cfg(feature = "tokio_serial")]
fn open_port(config: &StageConfig) -> StageResult<DynSerial> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(&config.port, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(config.timeout())
        .open_native_async()
        .map_err(|e| StageError::Connection {
            port: config.port.clone(),
            reason: e.to_string(),
        })?;

    Ok(Box::new(port))
}

#[cfg(not(feature = "tokio_serial"))]
fn open_port(_config: &StageConfig) -> StageResult<DynSerial> {
    Err(StageError::FeatureNotEnabled("tokio_serial".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::AlwaysOverwrite;
    use tokio::io::DuplexStream;

    fn test_config() -> StageConfig {
        StageConfig {
            timeout_secs: 0.2,
            ..StageConfig::new("mock")
        }
    }

    async fn answer_position(device: &mut DuplexStream, steps: [i32; 3]) {
        assert_eq!(device.read_u8().await.unwrap(), b'C');
        let mut reply = vec![b'D'];
        for v in steps {
            reply.extend_from_slice(&v.to_le_bytes());
        }
        reply.push(b'\r');
        device.write_all(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_reads_initial_position() {
        let (host, mut device) = tokio::io::duplex(64);
        let responder = tokio::spawn(async move {
            answer_position(&mut device, [16, 32, -48]).await;
            device
        });

        let session = Session::with_port(Box::new(host), test_config(), &LogConfig::default(), &AlwaysOverwrite)
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(session.position().await, Some(Position::from((1, 2, -3))));
        assert!(session.log_path().await.is_none());
    }

    #[tokio::test]
    async fn test_payload_containing_cr_is_not_split() {
        // 0x0D inside the payload must not end the frame early.
        let (host, mut device) = tokio::io::duplex(64);
        let responder = tokio::spawn(async move {
            answer_position(&mut device, [0x0D, 0x0D0D, 0]).await;
            device
        });

        let session = Session::with_port(Box::new(host), test_config(), &LogConfig::default(), &AlwaysOverwrite)
            .await
            .unwrap();
        responder.await.unwrap();

        let expected = Position::new(13.0 / 16.0, 3341.0 / 16.0, 0.0);
        assert_eq!(session.position().await, Some(expected));
    }

    #[tokio::test]
    async fn test_bad_terminator_is_protocol_error() {
        let (host, mut device) = tokio::io::duplex(64);
        tokio::spawn(async move {
            assert_eq!(device.read_u8().await.unwrap(), b'C');
            device.write_all(&[b'D'; POSITION_REPLY_LEN]).await.unwrap();
            device
        });

        let result = Session::with_port(Box::new(host), test_config(), &LogConfig::default(), &AlwaysOverwrite).await;
        assert!(matches!(result, Err(StageError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_closed_device_is_unexpected_eof() {
        let (host, device) = tokio::io::duplex(64);
        drop(device);

        let result = Session::with_port(Box::new(host), test_config(), &LogConfig::default(), &AlwaysOverwrite).await;
        assert!(matches!(
            result,
            Err(StageError::SerialUnexpectedEof) | Err(StageError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_range_error_sends_nothing() {
        let (host, mut device) = tokio::io::duplex(64);
        let responder = tokio::spawn(async move {
            answer_position(&mut device, [0, 0, 0]).await;
            device
        });
        let session = Session::with_port(Box::new(host), test_config(), &LogConfig::default(), &AlwaysOverwrite)
            .await
            .unwrap();
        let mut device = responder.await.unwrap();

        let err = session
            .move_to(Position::new(1e12, 0.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Range { .. }));

        let mut buf = [0u8; 1];
        let pending = tokio::time::timeout(Duration::from_millis(50), device.read(&mut buf)).await;
        assert!(pending.is_err(), "bytes were written for an out-of-range move");
        assert_eq!(session.position().await, Some(Position::default()));
    }
}
