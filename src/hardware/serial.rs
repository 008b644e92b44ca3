//! Serial Command Channel
//!
//! Shared types and helpers for line-oriented serial instruments, plus the
//! [`SerialChannel`] used by the stage controller.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SharedPort`]: Thread-safe shared serial port with buffered reading
//! - [`SerialChannel`]: one-lock-per-exchange command/response wrapper
//!
//! # Locking
//!
//! Every exchange acquires the port, writes, reads the single expected line and
//! releases. Two tasks sharing one channel can therefore never consume each other's
//! response line.
//!
//! # Example
//!
//! ```rust,ignore
//! use vibroscan::hardware::serial::{open_serial_async, SerialChannel};
//!
//! let port = open_serial_async("/dev/ttyACM0", 115200, "GRBL").await?;
//! let channel = SerialChannel::new(Box::new(port), Duration::from_secs(5));
//! let reply = channel.transact("G90").await?;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::{AppResult, ScanError};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`MockSerialPort`](crate::hardware::mock_serial::MockSerialPort)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

// =============================================================================
// Type Aliases
// =============================================================================

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Thread-safe shared serial port with buffered reading.
///
/// The `BufReader` wrapper enables `read_line()` on protocols that terminate
/// every answer with a newline.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Create a SharedPort from a type-erased serial port.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns [`ScanError::Connection`] if the port cannot be opened.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                ScanError::Connection(format!(
                    "Failed to open {} serial port {}: {}",
                    device_name_owned, port_path_owned, e
                ))
            })
    })
    .await
    .map_err(|e| ScanError::Connection(format!("spawn_blocking for serial port opening failed: {e}")))?
}

/// Fallback when the crate is built without serial support.
#[cfg(not(feature = "serial"))]
pub async fn open_serial_async(
    _port_path: &str,
    _baud_rate: u32,
    _device_name: &str,
) -> AppResult<tokio::io::DuplexStream> {
    Err(ScanError::SerialFeatureDisabled)
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards data until nothing arrives for `timeout_ms` milliseconds
/// or the port reports EOF.
///
/// # Returns
///
/// Total number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        if tokio::time::Instant::now() >= deadline {
            break;
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                total_discarded += n;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

/// Discard what the `BufReader` already holds, then drain the underlying port.
async fn discard_pending(port: &mut BufReader<DynSerial>, timeout_ms: u64) -> usize {
    let buffered = port.buffer().len();
    port.consume(buffered);
    buffered + drain_serial_buffer(port.get_mut(), timeout_ms).await
}

// =============================================================================
// SerialChannel
// =============================================================================

/// Line terminator appended to every queued command.
pub const LINE_TERMINATOR: &str = "\n";

/// How long `query_status` listens for stale bytes before writing `?`.
const STALE_INPUT_WINDOW_MS: u64 = 2;

/// Mutex-guarded line transport to the stage firmware.
///
/// Cloning shares the same underlying port.
#[derive(Clone)]
pub struct SerialChannel {
    port: SharedPort,
    response_timeout: Duration,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

impl SerialChannel {
    /// Wrap an already-open port.
    pub fn new(port: DynSerial, response_timeout: Duration) -> Self {
        Self {
            port: wrap_shared(port),
            response_timeout,
        }
    }

    /// Wake the firmware and flush its start-up banner.
    ///
    /// GRBL prints a greeting after a reset; the sleep gives it time to finish
    /// before the banner is discarded.
    pub async fn wake(&self, startup_delay: Duration) -> AppResult<()> {
        let mut port = self.port.lock().await;
        let writer = port.get_mut();
        writer.write_all(b"\r\n\r\n").await?;
        writer.flush().await?;
        tokio::time::sleep(startup_delay).await;
        let discarded = discard_pending(&mut port, 10).await;
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded firmware start-up output");
        }
        Ok(())
    }

    /// Send one command line and read exactly one response line.
    ///
    /// The terminator is appended here; callers pass the bare command.
    pub async fn transact(&self, command: &str) -> AppResult<String> {
        let mut port = self.port.lock().await;
        let line = format!("{}{}", command.trim(), LINE_TERMINATOR);
        let writer = port.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        read_response(&mut port, self.response_timeout).await
    }

    /// Issue the realtime status query `?` and read the status line.
    ///
    /// Stale input is discarded first so the line read belongs to this query.
    pub async fn query_status(&self) -> AppResult<String> {
        let mut port = self.port.lock().await;
        discard_pending(&mut port, STALE_INPUT_WINDOW_MS).await;
        let writer = port.get_mut();
        writer.write_all(b"?").await?;
        writer.flush().await?;
        read_response(&mut port, self.response_timeout).await
    }

    /// Shut down the write half of the transport.
    pub async fn close(&self) -> AppResult<()> {
        let mut port = self.port.lock().await;
        port.get_mut().shutdown().await?;
        Ok(())
    }
}

async fn read_response(port: &mut BufReader<DynSerial>, timeout: Duration) -> AppResult<String> {
    let mut response = String::new();
    let read = tokio::time::timeout(timeout, port.read_line(&mut response))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no response within {timeout:?}"),
            )
        })??;
    if read == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "serial port closed",
        )
        .into());
    }
    Ok(response.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn transact_appends_terminator_and_trims_reply() {
        let (mut host, device) = tokio::io::duplex(64);
        let channel = SerialChannel::new(Box::new(device), Duration::from_secs(1));

        let firmware = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = host.read(&mut buf).await.unwrap();
            host.write_all(b"ok\r\n").await.unwrap();
            (String::from_utf8_lossy(&buf[..n]).to_string(), host)
        });

        let reply = channel.transact("  G90 ").await.unwrap();
        let (sent, _host) = firmware.await.unwrap();

        assert_eq!(sent, "G90\n");
        assert_eq!(reply, "ok");
    }

    #[tokio::test]
    async fn query_status_sends_bare_question_mark() {
        let (mut host, device) = tokio::io::duplex(64);
        let channel = SerialChannel::new(Box::new(device), Duration::from_secs(1));

        let firmware = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = host.read(&mut buf).await.unwrap();
            host.write_all(b"<Idle|MPos:0.000,0.000,0.000>\n").await.unwrap();
            (buf[..n].to_vec(), host)
        });

        let reply = channel.query_status().await.unwrap();
        let (sent, _host) = firmware.await.unwrap();

        assert_eq!(sent, b"?");
        assert_eq!(reply, "<Idle|MPos:0.000,0.000,0.000>");
    }

    #[tokio::test]
    async fn transact_times_out_without_reply() {
        let (_host, device) = tokio::io::duplex(64);
        let channel = SerialChannel::new(Box::new(device), Duration::from_millis(20));

        let err = channel.transact("G90").await.unwrap_err();
        match err {
            ScanError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn transact_reports_closed_port() {
        let (host, device) = tokio::io::duplex(64);
        drop(host);
        let channel = SerialChannel::new(Box::new(device), Duration::from_millis(50));

        assert!(channel.transact("G90").await.is_err());
    }

    #[tokio::test]
    async fn test_drain_serial_buffer() {
        let (mut host, mut device) = tokio::io::duplex(64);

        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_serial_buffer(&mut device, 50).await;
        assert_eq!(discarded, 16);
    }
}
