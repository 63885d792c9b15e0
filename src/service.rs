// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The iTALC service message channel.
//!
//! Once a connection is authenticated it carries typed, length-prefixed
//! service messages interleaved with ordinary RFB traffic. A reserved
//! message-type tag ([`SERVICE_MESSAGE_TAG`]) distinguishes them from
//! framebuffer data.
//!
//! # Wire Format
//!
//! ```text
//! +-----+---------+-------------+------------------+
//! | tag | command | payload len | payload          |
//! | u8  | u8      | u32 (BE)    | len bytes        |
//! +-----+---------+-------------+------------------+
//! ```
//!
//! The channel is fire-and-forget: delivery confirmation and retry are the
//! caller's concern. What this layer guarantees is atomicity - a message is
//! encoded into a single buffer and written under a send mutex, so it is
//! never interleaved mid-message with another message on the same
//! connection, and a received message is fully buffered before it is
//! handed to the caller as a decoded unit.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::keys::KeyRole;
use crate::protocol::{
    read_exact_timeout, DEFAULT_HANDSHAKE_TIMEOUT, MAX_SERVICE_PAYLOAD, SERVICE_MESSAGE_TAG,
};

// Service command bytes. Part of the wire format; do not renumber.
const CMD_POWER_ON: u8 = 0;
const CMD_POWER_OFF: u8 = 1;
const CMD_RESTART: u8 = 2;
const CMD_LOGOUT_USER: u8 = 3;
const CMD_LOCK_SCREEN: u8 = 4;
const CMD_UNLOCK_SCREEN: u8 = 5;
const CMD_DEMO_START: u8 = 6;
const CMD_DEMO_STOP: u8 = 7;
const CMD_TEXT_MESSAGE: u8 = 8;

/// An out-of-band command exchanged over an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMessage {
    /// Power on the client machine (typically relayed as wake-on-LAN by
    /// the application layer).
    PowerOn,
    /// Power down the client machine.
    PowerOff,
    /// Reboot the client machine.
    Restart,
    /// Log out the currently signed-in user.
    LogoutUser,
    /// Lock screen and input devices.
    LockScreen,
    /// Release a previous lock.
    UnlockScreen,
    /// Enter demo mode, viewing the demo server at `master_host`.
    DemoStart {
        /// Host the client should connect to for the demo stream.
        master_host: String,
        /// Fullscreen (locked) demo rather than a windowed one.
        fullscreen: bool,
    },
    /// Leave demo mode.
    DemoStop,
    /// Display a text message to the user.
    TextMessage {
        /// Role of the sender, shown to the recipient.
        role: KeyRole,
        /// The message text.
        text: String,
    },
}

impl ServiceMessage {
    /// The command byte of this message.
    #[must_use]
    pub fn command(&self) -> u8 {
        match self {
            ServiceMessage::PowerOn => CMD_POWER_ON,
            ServiceMessage::PowerOff => CMD_POWER_OFF,
            ServiceMessage::Restart => CMD_RESTART,
            ServiceMessage::LogoutUser => CMD_LOGOUT_USER,
            ServiceMessage::LockScreen => CMD_LOCK_SCREEN,
            ServiceMessage::UnlockScreen => CMD_UNLOCK_SCREEN,
            ServiceMessage::DemoStart { .. } => CMD_DEMO_START,
            ServiceMessage::DemoStop => CMD_DEMO_STOP,
            ServiceMessage::TextMessage { .. } => CMD_TEXT_MESSAGE,
        }
    }

    /// Encodes the complete framed message (tag, command, length,
    /// payload) into a single buffer.
    #[allow(clippy::cast_possible_truncation)] // Payload length checked against MAX_SERVICE_PAYLOAD
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);
        debug_assert!(payload.len() <= MAX_SERVICE_PAYLOAD);

        let mut frame = BytesMut::with_capacity(6 + payload.len());
        frame.put_u8(SERVICE_MESSAGE_TAG);
        frame.put_u8(self.command());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        frame
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            ServiceMessage::PowerOn
            | ServiceMessage::PowerOff
            | ServiceMessage::Restart
            | ServiceMessage::LogoutUser
            | ServiceMessage::LockScreen
            | ServiceMessage::UnlockScreen
            | ServiceMessage::DemoStop => {}
            ServiceMessage::DemoStart {
                master_host,
                fullscreen,
            } => {
                buf.put_u8(u8::from(*fullscreen));
                buf.put_u32(master_host.len() as u32);
                buf.put_slice(master_host.as_bytes());
            }
            ServiceMessage::TextMessage { role, text } => {
                buf.put_u8(role.as_u8());
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
        }
    }

    /// Decodes a message from its command byte and fully buffered payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for unknown commands, truncated
    /// payloads, invalid role bytes or non-UTF-8 text.
    pub fn decode(command: u8, payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let message = match command {
            CMD_POWER_ON => ServiceMessage::PowerOn,
            CMD_POWER_OFF => ServiceMessage::PowerOff,
            CMD_RESTART => ServiceMessage::Restart,
            CMD_LOGOUT_USER => ServiceMessage::LogoutUser,
            CMD_LOCK_SCREEN => ServiceMessage::LockScreen,
            CMD_UNLOCK_SCREEN => ServiceMessage::UnlockScreen,
            CMD_DEMO_STOP => ServiceMessage::DemoStop,
            CMD_DEMO_START => {
                if buf.remaining() < 5 {
                    return Err(truncated("DemoStart"));
                }
                let fullscreen = buf.get_u8() != 0;
                let master_host = decode_string(&mut buf, "DemoStart host")?;
                ServiceMessage::DemoStart {
                    master_host,
                    fullscreen,
                }
            }
            CMD_TEXT_MESSAGE => {
                if buf.remaining() < 5 {
                    return Err(truncated("TextMessage"));
                }
                let role_byte = buf.get_u8();
                let role = KeyRole::from_u8(role_byte).ok_or_else(|| {
                    Error::Protocol(format!("invalid role byte {role_byte} in TextMessage"))
                })?;
                let text = decode_string(&mut buf, "TextMessage text")?;
                ServiceMessage::TextMessage { role, text }
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unknown service command {other}"
                )))
            }
        };
        if buf.has_remaining() {
            return Err(Error::Protocol(format!(
                "trailing bytes after service command {command}"
            )));
        }
        Ok(message)
    }
}

fn truncated(what: &str) -> Error {
    Error::Protocol(format!("truncated {what} payload"))
}

fn decode_string(buf: &mut &[u8], what: &str) -> Result<String> {
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(truncated(what));
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(bytes).map_err(|_| Error::Protocol(format!("{what} is not valid UTF-8")))
}

/// Write half of a service channel.
///
/// Cheap to clone; every clone shares the same send mutex, so concurrent
/// senders on one connection cannot interleave their frames.
#[derive(Clone)]
pub struct ServiceWriter {
    stream: Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>,
}

impl ServiceWriter {
    /// Wraps the write half of an authenticated connection.
    #[must_use]
    pub fn new(stream: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// Sends one service message atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the transport write fails.
    pub async fn send(&self, message: &ServiceMessage) -> Result<()> {
        let frame = message.encode();
        let mut stream = self.stream.lock().await;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Shuts down the underlying write half, signalling a graceful close
    /// to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the shutdown fails.
    pub async fn shutdown(&self) -> Result<()> {
        self.stream.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Read half of a service channel.
pub struct ServiceReader {
    stream: Box<dyn AsyncRead + Unpin + Send>,
}

impl ServiceReader {
    /// Wraps the read half of an authenticated connection.
    #[must_use]
    pub fn new(stream: Box<dyn AsyncRead + Unpin + Send>) -> Self {
        Self { stream }
    }

    /// Receives the next service message, waiting as long as necessary.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a message boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the peer sends a tag other than
    /// [`SERVICE_MESSAGE_TAG`], an unknown command or a malformed payload;
    /// [`Error::Io`] on transport failure mid-message.
    pub async fn recv(&mut self) -> Result<Option<ServiceMessage>> {
        read_service_message(&mut self.stream).await
    }
}

/// Reads one framed service message from `stream`.
///
/// The header (tag, command, length) is read without a deadline - inbound
/// service messages arrive unsolicited - but the payload that follows a
/// header is expected promptly.
///
/// # Errors
///
/// Same failure modes as [`ServiceReader::recv`].
pub async fn read_service_message<S>(stream: &mut S) -> Result<Option<ServiceMessage>>
where
    S: AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    // EOF is a clean close only at a message boundary. Once the tag byte
    // has arrived, a truncated header is a transport error.
    let mut tag = [0u8; 1];
    match stream.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if tag[0] != SERVICE_MESSAGE_TAG {
        return Err(Error::Protocol(format!(
            "unexpected message tag {} on service channel",
            tag[0]
        )));
    }

    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let command = header[0];
    let len = u32::from_be_bytes(header[1..5].try_into().expect("fixed slice")) as usize;
    if len > MAX_SERVICE_PAYLOAD {
        return Err(Error::Protocol(format!(
            "service payload length {len} exceeds limit {MAX_SERVICE_PAYLOAD}"
        )));
    }

    let mut payload = vec![0u8; len];
    read_exact_timeout(
        stream,
        &mut payload,
        DEFAULT_HANDSHAKE_TIMEOUT,
        "service message payload",
    )
    .await?;

    ServiceMessage::decode(command, &payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: &ServiceMessage) -> ServiceMessage {
        let frame = message.encode();
        assert_eq!(frame[0], SERVICE_MESSAGE_TAG);
        let command = frame[1];
        let len = u32::from_be_bytes(frame[2..6].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 6);
        ServiceMessage::decode(command, &frame[6..]).unwrap()
    }

    #[test]
    fn empty_payload_commands_round_trip() {
        for message in [
            ServiceMessage::PowerOff,
            ServiceMessage::LockScreen,
            ServiceMessage::DemoStop,
        ] {
            assert_eq!(round_trip(&message), message);
        }
    }

    #[test]
    fn demo_start_carries_host_and_mode() {
        let message = ServiceMessage::DemoStart {
            master_host: "teacher-console.example:5900".to_string(),
            fullscreen: true,
        };
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn text_message_carries_role_and_text() {
        let message = ServiceMessage::TextMessage {
            role: KeyRole::Teacher,
            text: "Please close your browsers.".to_string(),
        };
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn unknown_command_is_a_protocol_violation() {
        let err = ServiceMessage::decode(99, &[]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn truncated_and_trailing_payloads_are_rejected() {
        // DemoStart with a declared host length past the payload end.
        let mut payload = BytesMut::new();
        payload.put_u8(1);
        payload.put_u32(100);
        payload.put_slice(b"short");
        assert!(ServiceMessage::decode(CMD_DEMO_START, &payload).is_err());

        // Empty-payload command followed by garbage.
        assert!(ServiceMessage::decode(CMD_LOCK_SCREEN, &[0xde, 0xad]).is_err());
    }

    #[test]
    fn invalid_role_byte_is_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u8(42); // no such role
        payload.put_u32(2);
        payload.put_slice(b"hi");
        assert!(ServiceMessage::decode(CMD_TEXT_MESSAGE, &payload).is_err());
    }

    #[tokio::test]
    async fn reader_rejects_foreign_tags() {
        let (mut a, b) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        // Message type 0 is a framebuffer update, not a service message.
        a.write_all(&[0u8; 6]).await.unwrap();
        let mut reader = ServiceReader::new(Box::new(b));
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn eof_inside_the_header_is_an_error() {
        let (mut a, b) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        // Tag and command arrive, then the connection dies mid-header.
        a.write_all(&[SERVICE_MESSAGE_TAG, CMD_LOCK_SCREEN, 0])
            .await
            .unwrap();
        drop(a);
        let mut reader = ServiceReader::new(Box::new(b));
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn reader_returns_none_on_clean_eof() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut reader = ServiceReader::new(Box::new(b));
        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writer_and_reader_carry_a_message_end_to_end() {
        let (a, b) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(a);
        drop(read_half);
        let writer = ServiceWriter::new(Box::new(write_half));
        let (read_b, _write_b) = tokio::io::split(b);
        let mut reader = ServiceReader::new(Box::new(read_b));

        let message = ServiceMessage::TextMessage {
            role: KeyRole::Admin,
            text: "maintenance at 16:00".to_string(),
        };
        writer.send(&message).await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), Some(message));
    }
}
