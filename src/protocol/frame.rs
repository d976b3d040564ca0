//! Frame encoding and decoding for the board protocol.
//!
//! The wire format is a byte-stuffed frame:
//! ```text
//! ┌──────┬──────┬───────────────────────────────────────┬──────┬──────┐
//! │ DLE  │ STX  │ escape(command ‖ parameters ‖ sum)    │ DLE  │ ETX  │
//! │ 0x10 │ 0x02 │ 2..=130 bytes before escaping         │ 0x10 │ 0x03 │
//! └──────┴──────┴───────────────────────────────────────┴──────┴──────┘
//! ```
//!
//! Escaping doubles every `0x10` inside the body, the checksum byte included.
//! The checksum is the low byte of the sum of the unescaped command and
//! parameter bytes. It is computed before escaping on encode and after
//! unescaping on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::protocol::command::{CommandCode, ResponseCode};

/// Data link escape.
pub const DLE: u8 = 0x10;

/// Start of text.
pub const STX: u8 = 0x02;

/// End of text.
pub const ETX: u8 = 0x03;

/// Maximum number of parameter bytes in one frame.
pub const MAX_PARAMETERS: usize = 128;

/// Longest possible frame on the wire: markers plus a fully escaped body.
pub const MAX_ENCODED_LEN: usize = 4 + 2 * (MAX_PARAMETERS + 2);

/// Computes the frame checksum over the logical (unescaped) bytes.
#[must_use]
pub fn checksum(command: u8, parameters: &[u8]) -> u8 {
    parameters
        .iter()
        .fold(command, |sum, &byte| sum.wrapping_add(byte))
}

fn put_escaped(buf: &mut BytesMut, byte: u8) {
    buf.put_u8(byte);
    if byte == DLE {
        buf.put_u8(DLE);
    }
}

/// Encodes a command and its parameters into a complete frame.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if `parameters` is longer than
/// [`MAX_PARAMETERS`].
pub fn encode(command: u8, parameters: &[u8]) -> Result<Bytes, FrameError> {
    if parameters.len() > MAX_PARAMETERS {
        return Err(FrameError::PayloadTooLarge {
            size: parameters.len(),
            max: MAX_PARAMETERS,
        });
    }

    let sum = checksum(command, parameters);
    let mut buf = BytesMut::with_capacity(6 + parameters.len());
    buf.put_slice(&[DLE, STX]);
    put_escaped(&mut buf, command);
    for &byte in parameters {
        put_escaped(&mut buf, byte);
    }
    put_escaped(&mut buf, sum);
    buf.put_slice(&[DLE, ETX]);
    Ok(buf.freeze())
}

/// A decoded frame.
///
/// A checksum mismatch does not prevent decoding; it is reported through
/// `checksum_ok` and the caller decides what to do with the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command or response code.
    pub command: u8,
    /// Unescaped parameter bytes.
    pub parameters: Bytes,
    /// Whether the transmitted checksum matched the recomputed one.
    pub checksum_ok: bool,
}

impl Frame {
    /// Returns the response code if the command byte is a known one.
    #[must_use]
    pub const fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_byte(self.command)
    }

    /// Returns true if this is a checksum-valid answer to `request`.
    #[must_use]
    pub fn answers(&self, request: CommandCode) -> bool {
        self.checksum_ok && self.command == u8::from(request.response())
    }

    /// Returns true for a checksum-valid alive response.
    #[must_use]
    pub fn is_alive_response(&self) -> bool {
        self.answers(CommandCode::Alive)
    }
}

/// Outcome of decoding the front of a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// No complete frame yet; keep accumulating.
    Incomplete,
    /// A complete frame, possibly with a bad checksum.
    Frame(Frame),
    /// A terminated or abandoned frame that cannot be interpreted.
    Malformed(FrameError),
}

/// Decodes the first frame in `buffer` without consuming anything.
#[must_use]
pub fn try_decode(buffer: &[u8]) -> Decoded {
    scan(buffer).0
}

fn find_start(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == [DLE, STX])
}

/// Scans `buffer` for one frame. Returns the outcome and the number of
/// leading bytes that can be dropped.
fn scan(buffer: &[u8]) -> (Decoded, usize) {
    let Some(start) = find_start(buffer) else {
        // A trailing DLE may be the first half of a start marker.
        let keep = usize::from(buffer.last() == Some(&DLE));
        return (Decoded::Incomplete, buffer.len() - keep);
    };

    let mut body = Vec::with_capacity(MAX_PARAMETERS + 2);
    let mut i = start + 2;
    while i < buffer.len() {
        if i - start >= MAX_ENCODED_LEN {
            return (
                Decoded::Malformed(FrameError::Malformed {
                    reason: "no terminator within maximum frame length",
                }),
                start + 2,
            );
        }

        let byte = buffer[i];
        if byte != DLE {
            body.push(byte);
            i += 1;
            continue;
        }

        match buffer.get(i + 1) {
            None => break,
            Some(&DLE) => {
                body.push(DLE);
                i += 2;
            }
            Some(&ETX) => return (finish(&body), i + 2),
            Some(&STX) => {
                return (
                    Decoded::Malformed(FrameError::Malformed {
                        reason: "start marker inside frame",
                    }),
                    i,
                );
            }
            Some(_) => {
                return (
                    Decoded::Malformed(FrameError::Malformed {
                        reason: "unpaired escape byte",
                    }),
                    i + 1,
                );
            }
        }
    }

    (Decoded::Incomplete, start)
}

fn finish(body: &[u8]) -> Decoded {
    let Some((&sum, rest)) = body.split_last() else {
        return Decoded::Malformed(FrameError::Malformed {
            reason: "empty frame",
        });
    };
    let Some((&command, parameters)) = rest.split_first() else {
        return Decoded::Malformed(FrameError::Malformed {
            reason: "frame has no command byte",
        });
    };
    if parameters.len() > MAX_PARAMETERS {
        return Decoded::Malformed(FrameError::Malformed {
            reason: "too many parameter bytes",
        });
    }

    Decoded::Frame(Frame {
        command,
        parameters: Bytes::copy_from_slice(parameters),
        checksum_ok: checksum(command, parameters) == sum,
    })
}

/// Frame decoder that handles partial data.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded, `Ok(None)`
    /// if more data is needed, or an error if a malformed frame was dropped.
    /// Bytes before the first start marker are discarded.
    ///
    /// # Errors
    ///
    /// Returns a `FrameError::Malformed` after discarding a frame that
    /// contained an unpaired escape byte, was too short, or never terminated.
    /// Decoding can continue with the next call.
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        let (decoded, consumed) = scan(&self.buffer);
        self.buffer.advance(consumed);

        match decoded {
            Decoded::Incomplete => Ok(None),
            Decoded::Frame(frame) => Ok(Some(frame)),
            Decoded::Malformed(e) => Err(e),
        }
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame_of(decoded: Decoded) -> Frame {
        match decoded {
            Decoded::Frame(frame) => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_alive_request() {
        let frame = encode(0x55, &[]).unwrap();
        assert_eq!(&frame[..], &[0x10, 0x02, 0x55, 0x55, 0x10, 0x03]);
    }

    #[test]
    fn test_decode_alive_response() {
        let frame = frame_of(try_decode(&[0x10, 0x02, 0xAA, 0xAA, 0x10, 0x03]));
        assert_eq!(frame.command, 0xAA);
        assert!(frame.parameters.is_empty());
        assert!(frame.checksum_ok);
        assert!(frame.is_alive_response());
    }

    #[test]
    fn test_encode_doubles_dle_in_parameters() {
        let frame = encode(0x06, &[0x10]).unwrap();
        // sum = 0x16, no escape needed for it
        assert_eq!(
            &frame[..],
            &[0x10, 0x02, 0x06, 0x10, 0x10, 0x16, 0x10, 0x03]
        );

        let decoded = frame_of(try_decode(&frame));
        assert_eq!(&decoded.parameters[..], &[0x10]);
        assert!(decoded.checksum_ok);
    }

    #[test]
    fn test_encode_doubles_dle_checksum() {
        // 0x02 + 0x0E = 0x10, so the checksum byte itself needs escaping
        let frame = encode(0x02, &[0x0E]).unwrap();
        assert_eq!(
            &frame[..],
            &[0x10, 0x02, 0x02, 0x0E, 0x10, 0x10, 0x10, 0x03]
        );

        let decoded = frame_of(try_decode(&frame));
        assert_eq!(decoded.command, 0x02);
        assert_eq!(&decoded.parameters[..], &[0x0E]);
        assert!(decoded.checksum_ok);
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(0xFF, &[0x02]), 0x01);
        assert_eq!(checksum(0x83, &[0x80, 0x80]), 0x83);
    }

    #[test]
    fn test_payload_too_large() {
        let params = [0u8; MAX_PARAMETERS + 1];
        assert_eq!(
            encode(0x03, &params),
            Err(FrameError::PayloadTooLarge {
                size: 129,
                max: MAX_PARAMETERS
            })
        );
        assert!(encode(0x03, &params[..MAX_PARAMETERS]).is_ok());
    }

    #[test]
    fn test_flipped_bit_fails_checksum() {
        let params = [0x23, 0x11, 0x16, 0x09, 0x30, 0x00];
        let frame = encode(0x02, &params).unwrap();

        for byte_index in 3..3 + params.len() {
            for bit in 0..8 {
                let mut corrupted = frame.to_vec();
                corrupted[byte_index] ^= 1 << bit;
                if corrupted[byte_index] == DLE {
                    // would change the framing, not just the contents
                    continue;
                }
                let decoded = frame_of(try_decode(&corrupted));
                assert!(!decoded.checksum_ok, "byte {byte_index} bit {bit}");
            }
        }
    }

    #[test]
    fn test_incomplete_without_terminator() {
        assert_eq!(try_decode(&[]), Decoded::Incomplete);
        assert_eq!(try_decode(&[0x10, 0x02, 0xAA]), Decoded::Incomplete);
        assert_eq!(try_decode(&[0x10, 0x02, 0xAA, 0xAA, 0x10]), Decoded::Incomplete);
        // escaped DLE followed by ETX is data, not a terminator
        assert_eq!(
            try_decode(&[0x10, 0x02, 0x83, 0x10, 0x10, 0x03]),
            Decoded::Incomplete
        );
    }

    #[test]
    fn test_unpaired_escape_is_malformed() {
        assert!(matches!(
            try_decode(&[0x10, 0x02, 0x83, 0x10, 0x41, 0xD4, 0x10, 0x03]),
            Decoded::Malformed(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn test_short_frame_is_malformed() {
        assert!(matches!(
            try_decode(&[0x10, 0x02, 0x10, 0x03]),
            Decoded::Malformed(_)
        ));
        assert!(matches!(
            try_decode(&[0x10, 0x02, 0xAA, 0x10, 0x03]),
            Decoded::Malformed(_)
        ));
    }

    #[test]
    fn test_decoder_skips_leading_noise() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x00, 0xFF, 0x03, 0x10]);
        assert_eq!(decoder.decode().unwrap(), None);
        // the trailing DLE is kept as a possible start
        assert_eq!(decoder.buffered(), 1);

        decoder.feed(&[0x02, 0xAA, 0xAA, 0x10, 0x03]);
        let frame = decoder.decode().unwrap().unwrap();
        assert!(frame.is_alive_response());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_recovers_after_malformed() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x10, 0x02, 0x83, 0x10, 0x41]);
        decoder.feed(&encode(0xAA, &[]).unwrap());

        assert!(decoder.decode().is_err());
        let frame = decoder.decode().unwrap().unwrap();
        assert!(frame.is_alive_response());
    }

    #[test]
    fn test_decoder_resyncs_on_new_start_marker() {
        let mut decoder = FrameDecoder::new();
        // a frame cut short by a fresh start marker
        decoder.feed(&[0x10, 0x02, 0x83, 0x41]);
        decoder.feed(&encode(0xAA, &[]).unwrap());

        assert!(decoder.decode().is_err());
        assert!(decoder.decode().unwrap().unwrap().is_alive_response());
    }

    #[test]
    fn test_decoder_drops_runaway_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[DLE, STX]);
        decoder.feed(&[0x41; MAX_ENCODED_LEN]);
        assert!(decoder.decode().is_err());
        assert_eq!(decoder.decode().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_split_stream_of_two_frames() {
        let first = encode(0x83, b"E:0010 boot\x10").unwrap();
        let second = encode(0xAA, &[]).unwrap();
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        for split in 0..stream.len() {
            let mut decoder = FrameDecoder::new();
            decoder.feed(&stream[..split]);
            let early = decoder.decode().unwrap();
            if split < first.len() {
                assert_eq!(early, None, "split at {split}");
                decoder.feed(&stream[split..]);
                let frame = decoder.decode().unwrap().unwrap();
                assert_eq!(frame.command, 0x83);
                assert_eq!(&frame.parameters[..], b"E:0010 boot\x10");
                assert!(frame.checksum_ok);
            } else {
                let frame = early.unwrap();
                assert_eq!(frame.command, 0x83);
                decoder.feed(&stream[split..]);
            }
            assert!(decoder.decode().unwrap().unwrap().is_alive_response());
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            command in any::<u8>(),
            parameters in proptest::collection::vec(any::<u8>(), 0..=MAX_PARAMETERS),
        ) {
            let encoded = encode(command, &parameters).unwrap();
            let frame = frame_of(try_decode(&encoded));
            prop_assert_eq!(frame.command, command);
            prop_assert_eq!(&frame.parameters[..], &parameters[..]);
            prop_assert!(frame.checksum_ok);

            let body = &encoded[2..encoded.len() - 2];
            let literal = parameters.iter().filter(|&&b| b == DLE).count()
                + usize::from(command == DLE)
                + usize::from(checksum(command, &parameters) == DLE);
            let escaped = body.iter().filter(|&&b| b == DLE).count();
            prop_assert_eq!(escaped, 2 * literal);
        }
    }
}
