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

//! iTALC RFB protocol extension constants and wire primitives.
//!
//! The iTALC extension rides on the standard RFB handshake: a reserved
//! security-type byte identifies "iTALC extended security", and after
//! authentication a reserved message-type tag carries service messages
//! interleaved with ordinary RFB traffic. The byte values here are fixed by
//! the deployed protocol and must match exactly for interoperability with
//! existing masters and client service daemons.
//!
//! # Handshake Flow
//!
//! 1. **Protocol version** - both sides exchange `RFB 003.008\n`
//! 2. **Security type** - the service daemon offers type 19, the master
//!    selects it
//! 3. **iTALC sub-negotiation** - the daemon lists its accepted
//!    [`ItalcAuthType`]s, the master picks one and states its role, and the
//!    per-type exchange runs (see the `auth` module)
//! 4. **Result** - `ItalcAuthOK` promotes the connection to the service
//!    channel; `ItalcAuthFailed` closes the transport

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// The RFB protocol version string exchanged during the handshake.
///
/// Must be exactly 12 bytes including the trailing newline, as specified by
/// the RFB protocol.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Security type: iTALC extended security.
///
/// A reserved value in the RFB security-type enumeration, distinct from the
/// built-in `None` (1) and `VNC Authentication` (2) types. Selecting it
/// switches the handshake into the iTALC auth sub-negotiation.
pub const SECURITY_TYPE_ITALC: u8 = 19;

/// Message-type tag for iTALC service requests and responses.
///
/// After authentication, messages carrying this tag are service messages;
/// they are framed so a conforming peer never misinterprets them as
/// framebuffer data. Requests and responses share the same tag value.
pub const SERVICE_MESSAGE_TAG: u8 = 19;

/// Encoding type reserved for iTALC-compressed framebuffer rectangles.
///
/// The rectangle payload itself is handled by the screen-sharing layer, not
/// by this crate; the constant is kept for protocol completeness.
pub const ENCODING_ITALC: i32 = 19;

/// Pseudo-encoding reserved for iTALC cursor updates.
pub const ENCODING_ITALC_CURSOR: i32 = 20;

/// Port offset of the IVS screen-sharing sub-service.
///
/// The auxiliary screen-sharing server of a client machine listens at
/// `base port + PORT_OFFSET_IVS`; it speaks the same authentication
/// extension as the main service port.
pub const PORT_OFFSET_IVS: u16 = 11100;

/// Authentication result: access granted (`ItalcAuthOK`).
pub const AUTH_RESULT_OK: u32 = 0;

/// Authentication result: access denied (`ItalcAuthFailed`).
pub const AUTH_RESULT_FAILED: u32 = 1;

/// Upper bound for any length-prefixed frame read during the handshake.
///
/// Challenges are 32 bytes and signatures 64, so anything near this limit
/// is already a protocol violation; the bound only exists to keep a
/// misbehaving peer from forcing a huge allocation.
pub const MAX_HANDSHAKE_FRAME: usize = 512;

/// Upper bound for a service message payload.
pub const MAX_SERVICE_PAYLOAD: usize = 64 * 1024;

/// Default bounded timeout applied to every handshake read step.
///
/// An unresponsive peer must not occupy a connection slot indefinitely; on
/// expiry the session moves to `Failed` and the transport is closed.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// The authentication schemes of the iTALC extension.
///
/// The ordinals are part of the wire format and match the deployed
/// protocol; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ItalcAuthType {
    /// No authentication; the connection is accepted immediately.
    None = 0,

    /// Accept iff the peer's address is in the host allow-list. No
    /// cryptographic exchange takes place.
    HostBased = 1,

    /// Challenge/response: the master signs a fresh nonce with its private
    /// key and the service daemon verifies it against the public key
    /// registered for the claimed role.
    Dsa = 2,

    /// Same exchange as [`ItalcAuthType::Dsa`], but suppresses the
    /// access-confirmation prompt that a teacher-role `Dsa` login would
    /// otherwise trigger. Used when the master already holds the teacher
    /// role on the same machine.
    LocalDsa = 3,

    /// Same-process trust shortcut: the challenge is exchanged through a
    /// shared in-process context instead of the network. Never accepted
    /// from a remote peer.
    AppInternalChallenge = 4,

    /// Cross-process local trust shortcut: the challenge is exchanged
    /// through an owner-only-readable file. Never accepted from a remote
    /// peer.
    ChallengeViaAuthFile = 5,
}

impl ItalcAuthType {
    /// Master-side selection order, highest trust first.
    pub const PREFERENCE: [ItalcAuthType; 6] = [
        ItalcAuthType::Dsa,
        ItalcAuthType::LocalDsa,
        ItalcAuthType::AppInternalChallenge,
        ItalcAuthType::ChallengeViaAuthFile,
        ItalcAuthType::HostBased,
        ItalcAuthType::None,
    ];

    /// Parses an auth type from its wire byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ItalcAuthType::None),
            1 => Some(ItalcAuthType::HostBased),
            2 => Some(ItalcAuthType::Dsa),
            3 => Some(ItalcAuthType::LocalDsa),
            4 => Some(ItalcAuthType::AppInternalChallenge),
            5 => Some(ItalcAuthType::ChallengeViaAuthFile),
            _ => None,
        }
    }

    /// Returns the wire byte of this auth type.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the same-host trust shortcuts that must never be reachable
    /// from a remote peer.
    #[must_use]
    pub fn is_local_only(self) -> bool {
        matches!(
            self,
            ItalcAuthType::AppInternalChallenge | ItalcAuthType::ChallengeViaAuthFile
        )
    }
}

impl std::fmt::Display for ItalcAuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ItalcAuthType::None => "None",
            ItalcAuthType::HostBased => "HostBased",
            ItalcAuthType::Dsa => "DSA",
            ItalcAuthType::LocalDsa => "LocalDSA",
            ItalcAuthType::AppInternalChallenge => "AppInternalChallenge",
            ItalcAuthType::ChallengeViaAuthFile => "ChallengeViaAuthFile",
        };
        f.write_str(name)
    }
}

/// Reads exactly `buf.len()` bytes with a bounded timeout.
///
/// # Errors
///
/// Returns [`Error::Timeout`] naming `what` if the peer does not deliver the
/// bytes in time, or [`Error::Io`] on transport failure (including EOF).
pub async fn read_exact_timeout<S>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Duration,
    what: &'static str,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, stream.read_exact(buf))
        .await
        .map_err(|_| Error::Timeout(what))??;
    Ok(())
}

/// Reads a single byte with a bounded timeout.
///
/// # Errors
///
/// Same failure modes as [`read_exact_timeout`].
pub async fn read_u8_timeout<S>(stream: &mut S, timeout: Duration, what: &'static str) -> Result<u8>
where
    S: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    read_exact_timeout(stream, &mut byte, timeout, what).await?;
    Ok(byte[0])
}

/// Reads a big-endian u32 with a bounded timeout.
///
/// # Errors
///
/// Same failure modes as [`read_exact_timeout`].
pub async fn read_u32_timeout<S>(
    stream: &mut S,
    timeout: Duration,
    what: &'static str,
) -> Result<u32>
where
    S: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 4];
    read_exact_timeout(stream, &mut bytes, timeout, what).await?;
    Ok(u32::from_be_bytes(bytes))
}

/// Reads a length-prefixed frame (big-endian u32 length, then the bytes).
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the announced length exceeds `max`,
/// [`Error::Timeout`] naming `what` on expiry, or [`Error::Io`] on
/// transport failure.
pub async fn read_frame_timeout<S>(
    stream: &mut S,
    max: usize,
    timeout: Duration,
    what: &'static str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = read_u32_timeout(stream, timeout, what).await? as usize;
    if len > max {
        return Err(Error::Protocol(format!(
            "frame length {len} exceeds limit {max} while reading {what}"
        )));
    }
    let mut frame = vec![0u8; len];
    read_exact_timeout(stream, &mut frame, timeout, what).await?;
    Ok(frame)
}

/// Writes a length-prefixed frame as a single buffered write.
///
/// The length prefix and payload are assembled into one buffer before
/// writing so the frame is never split by a concurrent writer.
///
/// # Errors
///
/// Returns [`Error::Io`] on transport failure.
#[allow(clippy::cast_possible_truncation)] // Frame lengths bounded well below u32::MAX
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    stream.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_type_ordinals_are_stable() {
        // Wire values fixed by the deployed protocol.
        assert_eq!(ItalcAuthType::None.as_u8(), 0);
        assert_eq!(ItalcAuthType::HostBased.as_u8(), 1);
        assert_eq!(ItalcAuthType::Dsa.as_u8(), 2);
        assert_eq!(ItalcAuthType::LocalDsa.as_u8(), 3);
        assert_eq!(ItalcAuthType::AppInternalChallenge.as_u8(), 4);
        assert_eq!(ItalcAuthType::ChallengeViaAuthFile.as_u8(), 5);
        assert_eq!(SECURITY_TYPE_ITALC, 19);
        assert_eq!(SERVICE_MESSAGE_TAG, 19);
        assert_eq!(PORT_OFFSET_IVS, 11100);
    }

    #[test]
    fn auth_type_round_trips_through_wire_byte() {
        for ty in ItalcAuthType::PREFERENCE {
            assert_eq!(ItalcAuthType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(ItalcAuthType::from_u8(6), None);
        assert_eq!(ItalcAuthType::from_u8(255), None);
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, b"challenge-bytes").await.unwrap();
        let frame = read_frame_timeout(
            &mut b,
            MAX_HANDSHAKE_FRAME,
            DEFAULT_HANDSHAKE_TIMEOUT,
            "test frame",
        )
        .await
        .unwrap();
        assert_eq!(frame, b"challenge-bytes");
    }

    #[tokio::test]
    async fn oversize_frame_is_a_protocol_violation() {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err =
            read_frame_timeout(&mut b, MAX_HANDSHAKE_FRAME, DEFAULT_HANDSHAKE_TIMEOUT, "test")
                .await
                .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_a, mut b) = tokio::io::duplex(256);
        let err = read_u8_timeout(&mut b, Duration::from_millis(50), "security type")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout("security type")));
    }
}
