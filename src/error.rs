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

//! Error types for the iTALC protocol extension.
//!
//! The taxonomy distinguishes key-material problems ([`KeyError`]),
//! authentication outcomes ([`AuthFailure`]), malformed wire data
//! ([`Error::Protocol`]), transport failures ([`Error::Io`]) and handshake
//! timeouts ([`Error::Timeout`]). A timeout terminates a session exactly like
//! an authentication failure but stays distinguishable in logs.
//!
//! No error here is fatal to the process: a failed authentication or a
//! protocol violation affects only the one connection it occurred on.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::keys::KeyRole;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while generating, loading or validating key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// A key for this role already exists and overwrite was not requested.
    #[error("key already exists at {0} (pass overwrite to replace it)")]
    AlreadyExists(PathBuf),

    /// The file did not parse as a recognized key encoding.
    #[error("invalid key format in {path}: {reason}")]
    InvalidFormat {
        /// Path of the offending key file.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },

    /// The key file exists but is not readable (or its directory is not
    /// writable for key generation).
    #[error("permission denied accessing {0}")]
    PermissionDenied(PathBuf),

    /// Any other filesystem failure while handling key material.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being accessed when the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Reasons an authentication attempt is rejected.
///
/// Every variant terminates the session with `ItalcAuthFailed`; there is no
/// graduated trust level and no retry at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    /// The signature did not verify against the expected public key.
    #[error("signature verification failed")]
    SignatureMismatch,

    /// An app-internal challenge echo did not match the issued nonce.
    #[error("challenge mismatch")]
    ChallengeMismatch,

    /// The peer's address is not in the host allow-list.
    #[error("host {0} is not in the allow-list")]
    HostNotAllowed(IpAddr),

    /// The peer claimed a role identifier this side does not know.
    #[error("unknown role identifier {0}")]
    UnknownRole(u8),

    /// No public key is registered for the claimed role.
    #[error("no public key registered for role {0}")]
    NoKeyForRole(KeyRole),

    /// The peer requested an authentication type that was not offered or
    /// that this side cannot perform.
    #[error("authentication type {0} not offered or not supported")]
    UnsupportedAuthType(u8),

    /// A local-only authentication type was requested by a remote peer.
    #[error("authentication type is only valid for local peers")]
    NotLocal,

    /// The session id echoed by the prover did not match the auth file
    /// issued for this session (stale file from an earlier process).
    #[error("stale or mismatched auth file session id")]
    StaleAuthFile,

    /// The auth file did not have the expected size or layout.
    #[error("malformed auth file")]
    MalformedAuthFile,

    /// No internal challenge context was available for the exchange.
    #[error("no pending internal challenge")]
    MissingInternalChallenge,

    /// The operator declined the access-confirmation prompt.
    #[error("access denied by operator")]
    AccessDenied,

    /// The remote side answered `ItalcAuthFailed`.
    #[error("peer rejected authentication")]
    Rejected,
}

/// Top-level error type of the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Key material could not be generated, loaded or validated.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The authentication exchange failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthFailure),

    /// The peer sent a malformed handshake byte sequence or an unexpected
    /// message on the service channel.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Filesystem or network failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A handshake step exceeded its bounded timeout.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl Error {
    /// True if this error is an authentication failure (as opposed to a
    /// transport or key-material problem).
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}
