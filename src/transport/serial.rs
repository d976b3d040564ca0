//! Serial transport implementation.
//!
//! The board is attached to a host UART and runs at a low baud rate to keep
//! the signal clean over the cable, 8N1 without flow control.

use std::io;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameDecoder, Message};
use crate::transport::Transport;

/// Default serial device (UART1 on the host module).
pub const DEFAULT_PORT: &str = "/dev/ttyTHS0";

/// Default baud rate for the board link.
pub const DEFAULT_BAUD_RATE: u32 = 1200;

/// Open failures are logged on the first attempt and then every this many.
const OPEN_LOG_EVERY: u32 = 1000;

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyTHS0" or "/dev/ttyACM0").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Give up opening after this many attempts. `None` retries forever.
    pub max_open_attempts: Option<u32>,
    /// Pause between open attempts.
    pub open_retry_delay: Duration,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            max_open_attempts: None,
            open_retry_delay: Duration::ZERO,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Limits the number of open attempts before giving up.
    #[must_use]
    pub const fn max_open_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_open_attempts = attempts;
        self
    }

    /// Sets the pause between open attempts.
    #[must_use]
    pub const fn open_retry_delay(mut self, delay: Duration) -> Self {
        self.open_retry_delay = delay;
        self
    }
}

/// Serial transport for the board link.
pub struct SerialTransport {
    config: SerialConfig,
    stream: Option<SerialStream>,
    decoder: FrameDecoder,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            stream: None,
            decoder: FrameDecoder::new(),
        }
    }

    /// Creates a new serial transport for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    /// Returns the transport configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn open(&self) -> Result<SerialStream> {
        tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(Error::Serial)
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.stream.is_some() {
                return Ok(());
            }

            tracing::info!(
                "opening serial port {} at {} baud",
                self.config.port,
                self.config.baud_rate
            );

            let mut attempts = 0u32;
            let stream = loop {
                attempts = attempts.saturating_add(1);
                match self.open() {
                    Ok(stream) => break stream,
                    Err(e) => {
                        if attempts == 1 {
                            tracing::warn!("cannot open {}: {}", self.config.port, e);
                            if let Ok(ports) = list_ports() {
                                tracing::debug!("available ports: {:?}", ports);
                            }
                        } else if attempts % OPEN_LOG_EVERY == 0 {
                            tracing::warn!(
                                "still cannot open {} after {} attempts: {}",
                                self.config.port,
                                attempts,
                                e
                            );
                        }

                        if let Some(max) = self.config.max_open_attempts {
                            if attempts >= max {
                                return Err(Error::OpenExhausted {
                                    port: self.config.port.clone(),
                                    attempts,
                                });
                            }
                        }

                        if self.config.open_retry_delay.is_zero() {
                            tokio::task::yield_now().await;
                        } else {
                            tokio::time::sleep(self.config.open_retry_delay).await;
                        }
                    }
                }
            };

            self.stream = Some(stream);
            self.decoder.clear();

            tracing::info!("opened serial port after {} attempt(s)", attempts);
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.stream.take().is_some() {
                tracing::info!("closed serial port {}", self.config.port);
            }
            self.decoder.clear();
            Ok(())
        })
    }

    fn send(&mut self, message: &Message) -> BoxFuture<'_, Result<()>> {
        let frame = message.encode();
        let command = message.command();
        Box::pin(async move {
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            self.decoder.clear();

            tracing::trace!("sending {:?}: {}", command, hex::encode(&frame));
            stream.write_all(&frame).await.map_err(Error::Io)?;
            stream.flush().await.map_err(Error::Io)?;
            Ok(())
        })
    }

    fn receive(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<Frame>>> {
        Box::pin(async move {
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            let deadline = Instant::now() + timeout;
            let mut buf = [0u8; 256];

            loop {
                // Process everything already buffered before reading more
                loop {
                    match self.decoder.decode() {
                        Ok(Some(frame)) => {
                            tracing::trace!(
                                "received frame 0x{:02x}: {}",
                                frame.command,
                                hex::encode(&frame.parameters)
                            );
                            return Ok(Some(frame));
                        }
                        Ok(None) => break,
                        Err(e) => tracing::warn!("discarding frame: {}", e),
                    }
                }

                let n = match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
                    Err(_) => {
                        tracing::debug!("no frame within {:?}", timeout);
                        return Ok(None);
                    }
                    Ok(Ok(0)) => {
                        tracing::debug!("serial port closed");
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "serial port closed",
                        )));
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        tracing::error!("serial read error: {}", e);
                        return Err(Error::Io(e));
                    }
                };

                tracing::trace!("received {} bytes", n);
                self.decoder.feed(&buf[..n]);
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_defaults() {
        let config = SerialConfig::new("/dev/ttyTHS0");
        assert_eq!(config.port, "/dev/ttyTHS0");
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.max_open_attempts, None);
        assert!(config.open_retry_delay.is_zero());
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyACM0")
            .baud_rate(115_200)
            .max_open_attempts(Some(3))
            .open_retry_delay(Duration::from_secs(1));
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.max_open_attempts, Some(3));
        assert_eq!(config.open_retry_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bounded_open_gives_up() {
        let config = SerialConfig::new("/dev/boardwatch-does-not-exist").max_open_attempts(Some(3));
        let mut transport = SerialTransport::new(config);

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(
            err,
            Error::OpenExhausted { attempts: 3, .. }
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_io_without_connection() {
        let mut transport = SerialTransport::with_port("/dev/ttyTHS0");
        let alive = Message::bare(crate::protocol::CommandCode::Alive);

        assert!(matches!(
            transport.send(&alive).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            transport.receive(Duration::from_millis(1)).await,
            Err(Error::NotConnected)
        ));
        // closing twice is fine
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
    }

    #[test]
    #[ignore = "Requires /sys/class/tty - not available in sandboxed builds"]
    fn test_list_ports() {
        // Just verify it doesn't panic
        let _ = list_ports();
    }
}
