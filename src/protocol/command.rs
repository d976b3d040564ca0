//! Command codes for the board protocol.
//!
//! Every request the host sends has a paired response code which the device
//! answers with. By convention the response code is the request code with the
//! high bit set, except for the alive pair (`0x55`/`0xAA`).

/// Request codes sent from the host to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    /// Just test TX.
    Nop = 0x00,
    /// Status request (contents undefined by the protocol).
    Status = 0x01,
    /// Set the device RTC (six BCD bytes).
    TimeSync = 0x02,
    /// Fetch the next device log chunk.
    Log = 0x03,
    /// Cold reboot of the device and the host power rail.
    Reboot = 0x04,
    /// Power-off time setting (one byte, 0 = 30s).
    PowerOffTime = 0x05,
    /// Device-side heartbeat period setting (one byte, minutes - 1).
    HeartbeatPeriod = 0x06,
    /// Press the host power button.
    PowerButton = 0x07,
    /// Press the host reset button.
    ResetButton = 0x08,
    /// Read the board temperature.
    Temperature = 0x09,
    /// Notice that the host is alive.
    Alive = 0x55,
}

impl CommandCode {
    /// Returns the response code the device answers this request with.
    #[must_use]
    pub const fn response(self) -> ResponseCode {
        match self {
            Self::Nop => ResponseCode::Nop,
            Self::Status => ResponseCode::Status,
            Self::TimeSync => ResponseCode::TimeSync,
            Self::Log => ResponseCode::Log,
            Self::Reboot => ResponseCode::Reboot,
            Self::PowerOffTime => ResponseCode::PowerOffTime,
            Self::HeartbeatPeriod => ResponseCode::HeartbeatPeriod,
            Self::PowerButton => ResponseCode::PowerButton,
            Self::ResetButton => ResponseCode::ResetButton,
            Self::Temperature => ResponseCode::Temperature,
            Self::Alive => ResponseCode::Alive,
        }
    }
}

impl From<CommandCode> for u8 {
    fn from(cmd: CommandCode) -> Self {
        cmd as Self
    }
}

/// Response codes sent from the device to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    /// NOP received.
    Nop = 0x80,
    /// Status response.
    Status = 0x81,
    /// Time sync acknowledged (echoes date and time).
    TimeSync = 0x82,
    /// Log chunk.
    Log = 0x83,
    /// Reboot acknowledged.
    Reboot = 0x84,
    /// Power-off time acknowledged.
    PowerOffTime = 0x85,
    /// Heartbeat period acknowledged.
    HeartbeatPeriod = 0x86,
    /// Power button pressed.
    PowerButton = 0x87,
    /// Reset button pressed.
    ResetButton = 0x88,
    /// Temperature reading.
    Temperature = 0x89,
    /// Response to an alive request.
    Alive = 0xAA,
    /// Received an unknown command. Never emitted by the host.
    Unknown = 0xFF,
}

impl ResponseCode {
    /// Parses a response code from a byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x80 => Some(Self::Nop),
            0x81 => Some(Self::Status),
            0x82 => Some(Self::TimeSync),
            0x83 => Some(Self::Log),
            0x84 => Some(Self::Reboot),
            0x85 => Some(Self::PowerOffTime),
            0x86 => Some(Self::HeartbeatPeriod),
            0x87 => Some(Self::PowerButton),
            0x88 => Some(Self::ResetButton),
            0x89 => Some(Self::Temperature),
            0xAA => Some(Self::Alive),
            0xFF => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(code: ResponseCode) -> Self {
        code as Self
    }
}
