//! Logical request messages and their parameter encodings.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::error::FrameError;
use crate::protocol::command::CommandCode;
use crate::protocol::frame::{self, MAX_PARAMETERS};

/// A request to the device: a command code and up to 128 parameter bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: CommandCode,
    parameters: Bytes,
}

impl Message {
    /// Creates a message with parameters.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if there are more than 128
    /// parameter bytes.
    pub fn new(command: CommandCode, parameters: impl Into<Bytes>) -> Result<Self, FrameError> {
        let parameters = parameters.into();
        if parameters.len() > MAX_PARAMETERS {
            return Err(FrameError::PayloadTooLarge {
                size: parameters.len(),
                max: MAX_PARAMETERS,
            });
        }
        Ok(Self {
            command,
            parameters,
        })
    }

    /// Creates a message without parameters.
    #[must_use]
    pub const fn bare(command: CommandCode) -> Self {
        Self {
            command,
            parameters: Bytes::new(),
        }
    }

    /// Creates a message with a single parameter byte.
    #[must_use]
    pub fn with_byte(command: CommandCode, value: u8) -> Self {
        Self {
            command,
            parameters: Bytes::copy_from_slice(&[value]),
        }
    }

    /// Creates a time-sync message for the given local time.
    #[must_use]
    pub fn time_sync(now: NaiveDateTime) -> Self {
        Self {
            command: CommandCode::TimeSync,
            parameters: bcd_timestamp(now),
        }
    }

    /// Returns the command code.
    #[must_use]
    pub const fn command(&self) -> CommandCode {
        self.command
    }

    /// Returns the parameter bytes.
    #[must_use]
    pub fn parameters(&self) -> &[u8] {
        &self.parameters
    }

    /// Encodes the message as a wire frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        // Length is checked on construction, so this cannot fail.
        frame::encode(self.command.into(), &self.parameters).unwrap_or_default()
    }
}

/// Encodes a value below 100 as one packed BCD byte.
#[must_use]
pub const fn bcd(value: u8) -> u8 {
    0x10 * (value / 10) + value % 10
}

/// Encodes a local time as `YY MM DD hh mm ss`, one BCD byte each.
#[must_use]
pub fn bcd_timestamp(now: NaiveDateTime) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(bcd(now.year().rem_euclid(100) as u8));
    buf.put_u8(bcd(now.month() as u8));
    buf.put_u8(bcd(now.day() as u8));
    buf.put_u8(bcd(now.hour() as u8));
    buf.put_u8(bcd(now.minute() as u8));
    buf.put_u8(bcd(now.second() as u8));
    buf.freeze()
}
