//! Scripted in-memory transport for tests.
//!
//! Each `send` consumes the next scripted reply. Replies are raw wire bytes
//! that go through the real frame decoder on `receive`.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameDecoder, Message, ResponseCode, encode_frame};
use crate::transport::Transport;

/// What the fake device does in answer to one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Put these bytes on the wire.
    Wire(Bytes),
    /// Say nothing; `receive` runs into its deadline.
    Silence,
    /// The write itself fails.
    SendFails,
}

impl Reply {
    pub fn response(code: ResponseCode, parameters: &[u8]) -> Self {
        Self::Wire(encode_frame(code.into(), parameters).unwrap())
    }

    pub fn alive() -> Self {
        Self::response(ResponseCode::Alive, &[])
    }

    /// An alive response with its checksum byte corrupted.
    pub fn corrupt_alive() -> Self {
        Self::Wire(Bytes::from_static(&[0x10, 0x02, 0xAA, 0xAB, 0x10, 0x03]))
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: VecDeque<Reply>,
    decoder: FrameDecoder,
    sent: Vec<Message>,
    connected: bool,
    connects: usize,
    disconnects: usize,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            script: script.into_iter().collect(),
            connected: true,
            ..Self::default()
        }
    }

    pub fn disconnected(script: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            connected: false,
            ..Self::new(script)
        }
    }

    pub fn push(&mut self, reply: Reply) {
        self.script.push_back(reply);
    }

    pub fn sent(&self) -> &[Message] {
        &self.sent
    }

    pub fn sent_codes(&self) -> Vec<u8> {
        self.sent.iter().map(|m| u8::from(m.command())).collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    pub const fn connects(&self) -> usize {
        self.connects
    }

    pub const fn disconnects(&self) -> usize {
        self.disconnects
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.connected {
                self.connected = true;
                self.connects += 1;
            }
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.connected {
                self.connected = false;
                self.disconnects += 1;
            }
            self.decoder.clear();
            Ok(())
        })
    }

    fn send(&mut self, message: &Message) -> BoxFuture<'_, Result<()>> {
        let message = message.clone();
        Box::pin(async move {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            self.decoder.clear();
            match self.script.pop_front().unwrap_or(Reply::Silence) {
                Reply::SendFails => Err(Error::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "scripted write failure",
                ))),
                Reply::Wire(bytes) => {
                    self.sent.push(message);
                    self.decoder.feed(&bytes);
                    Ok(())
                }
                Reply::Silence => {
                    self.sent.push(message);
                    Ok(())
                }
            }
        })
    }

    fn receive(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<Frame>>> {
        Box::pin(async move {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            loop {
                match self.decoder.decode() {
                    Ok(Some(frame)) => return Ok(Some(frame)),
                    Ok(None) => break,
                    Err(_) => {}
                }
            }
            tokio::time::sleep(timeout).await;
            Ok(None)
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
