//! Protocol definitions for the board serial link.
//!
//! This module contains the low-level protocol types including:
//! - Frame encoding/decoding (byte stuffing and checksum)
//! - Request and response codes
//! - Logical request messages

pub mod command;
pub mod frame;
pub mod message;

pub use command::{CommandCode, ResponseCode};
pub use frame::{
    DLE, Decoded, ETX, Frame, FrameDecoder, MAX_PARAMETERS, STX, checksum, encode as encode_frame,
    try_decode,
};
pub use message::{Message, bcd, bcd_timestamp};
