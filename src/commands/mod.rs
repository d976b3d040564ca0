//! Command handlers for board operations.
//!
//! This module provides one function per protocol command, each handling the
//! request/response exchange with the device.

use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDateTime;

use crate::archive::LogArchive;
use crate::error::{Error, Result};
use crate::protocol::{CommandCode, Frame, Message};
use crate::transport::Transport;

/// Default command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between consecutive log requests.
pub const DEFAULT_LOG_PAUSE: Duration = Duration::from_secs(1);

/// The device answers a log request with this text once its log is drained.
pub const LOG_END_MARKER: &[u8] = b"NO LOG";

/// Tag under which device log chunks are archived.
pub const LOG_TAG: &str = "BOARD LOG";

/// Result of draining the device log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogTransfer {
    /// Number of chunks appended to the archive, end marker included.
    pub chunks: usize,
    /// Whether the transfer ended on the end marker rather than a failure.
    pub complete: bool,
}

/// Command handler for board operations.
pub struct CommandHandler<T> {
    transport: T,
    timeout: Duration,
    log_pause: Duration,
}

impl<T: Transport> CommandHandler<T> {
    /// Creates a new command handler.
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            log_pause: DEFAULT_LOG_PAUSE,
        }
    }

    /// Sets the command timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sets the pause between log requests.
    pub fn set_log_pause(&mut self, pause: Duration) {
        self.log_pause = pause;
    }

    /// Returns the underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the underlying transport mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Opens the link.
    pub async fn connect(&mut self) -> Result<()> {
        self.transport.connect().await
    }

    /// Closes the link.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.transport.disconnect().await
    }

    /// Returns true if the link is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Sends a message and waits for any frame in response.
    ///
    /// The frame is returned even when its checksum is bad.
    pub async fn exchange(&mut self, message: &Message, timeout: Duration) -> Result<Frame> {
        tracing::debug!("request {:?}", message.command());
        self.transport.send(message).await?;
        self.transport
            .receive(timeout)
            .await?
            .ok_or_else(|| Error::timeout(timeout))
    }

    /// Sends a message and expects the matching, checksum-valid response.
    /// Returns the response parameters.
    async fn request(&mut self, message: &Message, timeout: Duration) -> Result<Bytes> {
        let expected = message.command().response();
        let frame = self.exchange(message, timeout).await?;

        if !frame.checksum_ok {
            tracing::warn!("checksum mismatch in response 0x{:02x}", frame.command);
            return Err(Error::ChecksumMismatch {
                command: frame.command,
            });
        }
        if frame.command != u8::from(expected) {
            return Err(Error::UnexpectedResponse {
                expected,
                got: frame.command,
            });
        }
        Ok(frame.parameters)
    }

    // ==================== Liveness ====================

    /// Sends an alive request and returns whatever frame comes back.
    ///
    /// Callers decide whether a non-alive answer counts; use
    /// [`Frame::is_alive_response`] for the strict check.
    pub async fn alive(&mut self, timeout: Duration) -> Result<Frame> {
        self.exchange(&Message::bare(CommandCode::Alive), timeout)
            .await
    }

    // ==================== Administration ====================

    /// Reads the device status. The payload is not interpreted.
    pub async fn read_status(&mut self, timeout: Duration) -> Result<Bytes> {
        self.request(&Message::bare(CommandCode::Status), timeout)
            .await
    }

    /// Sets the device RTC to `now`. Returns the date and time the device
    /// echoes back.
    pub async fn sync_rtc(&mut self, now: NaiveDateTime) -> Result<Bytes> {
        tracing::debug!("syncing device clock to {}", now);
        self.request(&Message::time_sync(now), self.timeout).await
    }

    /// Requests the next log chunk.
    pub async fn read_log_chunk(&mut self) -> Result<Bytes> {
        self.request(&Message::bare(CommandCode::Log), self.timeout)
            .await
    }

    /// Drains the device log into `archive`.
    ///
    /// Stops on the end marker or on the first failed exchange.
    pub async fn read_logs(&mut self, archive: &mut dyn LogArchive) -> LogTransfer {
        let mut transfer = LogTransfer {
            chunks: 0,
            complete: false,
        };

        loop {
            let chunk = match self.read_log_chunk().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!("log transfer stopped after {} chunks: {}", transfer.chunks, e);
                    return transfer;
                }
            };

            if let Err(e) = archive.append(LOG_TAG, &chunk) {
                tracing::error!("cannot archive device log chunk: {}", e);
            }
            transfer.chunks += 1;

            if contains(&chunk, LOG_END_MARKER) {
                transfer.complete = true;
                tracing::info!("device log drained ({} chunks)", transfer.chunks);
                return transfer;
            }

            tokio::time::sleep(self.log_pause).await;
        }
    }

    /// Asks the device for a cold reboot.
    pub async fn cold_reboot(&mut self) -> Result<()> {
        self.request(&Message::bare(CommandCode::Reboot), self.timeout)
            .await
            .map(|_| ())
    }

    /// Sets the power-off time (0 = 30 seconds).
    pub async fn set_poweroff_time(&mut self, code: u8) -> Result<()> {
        self.request(
            &Message::with_byte(CommandCode::PowerOffTime, code),
            self.timeout,
        )
        .await
        .map(|_| ())
    }

    /// Sets the device-side heartbeat period.
    pub async fn set_heartbeat_period(&mut self, code: u8) -> Result<()> {
        self.request(
            &Message::with_byte(CommandCode::HeartbeatPeriod, code),
            self.timeout,
        )
        .await
        .map(|_| ())
    }

    /// Presses the host power button.
    pub async fn press_power_button(&mut self) -> Result<()> {
        self.request(&Message::bare(CommandCode::PowerButton), self.timeout)
            .await
            .map(|_| ())
    }

    /// Presses the host reset button.
    pub async fn press_reset_button(&mut self) -> Result<()> {
        self.request(&Message::bare(CommandCode::ResetButton), self.timeout)
            .await
            .map(|_| ())
    }

    /// Reads the board temperature. The payload format is device-defined.
    pub async fn read_temperature(&mut self) -> Result<Bytes> {
        self.request(&Message::bare(CommandCode::Temperature), self.timeout)
            .await
    }

    /// Sends a no-op and waits for its echo.
    pub async fn nop(&mut self) -> Result<()> {
        self.request(&Message::bare(CommandCode::Nop), self.timeout)
            .await
            .map(|_| ())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
