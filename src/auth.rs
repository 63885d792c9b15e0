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

//! Challenge/response primitives for the iTALC authentication extension.
//!
//! The verifier issues a fresh random nonce; the prover signs it with its
//! private key and the verifier checks the signature against the public key
//! registered for the claimed role. Two local trust shortcuts avoid the
//! network round trip for the nonce:
//!
//! - [`InternalChallenge`] - a short-lived shared context for two
//!   collaborators inside the same process (e.g. the demo server
//!   authenticating against its own local service)
//! - [`AuthFileChallenge`] - an owner-only-readable file bridging two local
//!   processes that cannot share in-memory state
//!
//! Both shortcuts are single-use. The auth file additionally embeds a
//! random session id that the prover must echo, so a stale file left behind
//! by a crashed process can never satisfy a new session.

use std::fs;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};
use rand::Rng;

use crate::error::{AuthFailure, Error, Result};
use crate::keys::KeyRole;

/// Length in bytes of an authentication challenge nonce.
pub const CHALLENGE_SIZE: usize = 32;

/// Size in bytes of an auth file: 8-byte session id plus the nonce.
const AUTH_FILE_SIZE: usize = 8 + CHALLENGE_SIZE;

/// Generates a fresh random challenge nonce.
///
/// Uses the thread-local CSPRNG; a predictable nonce would let a recorded
/// signature be replayed, so nonces are never derived from weaker sources
/// and never reused across sessions.
#[must_use]
pub fn generate_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut rng = rand::rng();
    let mut challenge = [0u8; CHALLENGE_SIZE];
    rng.fill(&mut challenge);
    challenge
}

/// Shared challenge context for same-process authentication.
///
/// Used by the `AppInternalChallenge` scheme: the prover (a component of
/// the same process as the verifier) stores a fresh nonce here before
/// sending it over the connection, and the verifier takes the stored value
/// to compare against what arrived. The context is an explicitly
/// passed handle scoped to the two collaborators that need it - it has no
/// process-wide visibility.
///
/// The slot holds at most one nonce and [`take`](Self::take) consumes it,
/// so a nonce can satisfy at most one exchange.
#[derive(Clone, Default)]
pub struct InternalChallenge {
    slot: Arc<Mutex<Option<[u8; CHALLENGE_SIZE]>>>,
}

impl InternalChallenge {
    /// Creates an empty challenge context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the nonce issued for the current exchange, replacing any
    /// leftover from an abandoned one.
    pub fn set(&self, nonce: [u8; CHALLENGE_SIZE]) {
        *self.slot.lock().expect("internal challenge lock poisoned") = Some(nonce);
    }

    /// Takes the pending nonce, leaving the slot empty.
    #[must_use]
    pub fn take(&self) -> Option<[u8; CHALLENGE_SIZE]> {
        self.slot
            .lock()
            .expect("internal challenge lock poisoned")
            .take()
    }
}

/// An ephemeral owner-only auth file issued by the verifier.
///
/// Created immediately before a `ChallengeViaAuthFile` exchange and removed
/// when the value is dropped, on every exit path. The file holds a random
/// session id followed by the challenge nonce; the prover must echo the
/// session id along with its signature, which binds the response to this
/// session and rejects stale files.
#[derive(Debug)]
pub struct AuthFileChallenge {
    path: PathBuf,
    session_id: u64,
    nonce: [u8; CHALLENGE_SIZE],
}

impl AuthFileChallenge {
    /// Creates the auth file at `path` with owner-only permissions,
    /// overwriting any stale file from an earlier process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be created or written.
    pub fn create(path: &Path) -> Result<Self> {
        let mut rng = rand::rng();
        let session_id: u64 = rng.random();
        let mut nonce = [0u8; CHALLENGE_SIZE];
        rng.fill(&mut nonce);

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&session_id.to_be_bytes())?;
        file.write_all(&nonce)?;
        file.sync_all()?;

        info!("Issued auth file challenge at {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            session_id,
            nonce,
        })
    }

    /// The session id embedded in the file.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The challenge nonce embedded in the file.
    #[must_use]
    pub fn nonce(&self) -> &[u8; CHALLENGE_SIZE] {
        &self.nonce
    }

    /// True if the prover echoed the session id of this exchange.
    #[must_use]
    pub fn matches_session(&self, echoed_id: u64) -> bool {
        self.session_id == echoed_id
    }
}

impl Drop for AuthFileChallenge {
    fn drop(&mut self) {
        // Single-use credential: remove on success, failure and
        // cancellation alike.
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove auth file {}: {e}", self.path.display());
            }
        }
    }
}

/// Reads an auth file from the prover side, returning its session id and
/// nonce.
///
/// # Errors
///
/// Returns [`AuthFailure::MalformedAuthFile`] (as [`Error::Auth`]) if the
/// file does not have the expected size, or [`Error::Io`] if it cannot be
/// read.
pub fn read_auth_file(path: &Path) -> Result<(u64, [u8; CHALLENGE_SIZE])> {
    let mut file = fs::File::open(path)?;
    let mut contents = [0u8; AUTH_FILE_SIZE];
    file.read_exact(&mut contents)
        .map_err(|_| Error::Auth(AuthFailure::MalformedAuthFile))?;
    // Trailing bytes mean the file was not written by a conforming
    // verifier.
    let mut extra = [0u8; 1];
    if file.read(&mut extra)? != 0 {
        return Err(Error::Auth(AuthFailure::MalformedAuthFile));
    }

    let session_id = u64::from_be_bytes(contents[..8].try_into().expect("fixed slice"));
    let mut nonce = [0u8; CHALLENGE_SIZE];
    nonce.copy_from_slice(&contents[8..]);
    Ok((session_id, nonce))
}

/// The host allow-list consulted by `HostBased` authentication.
///
/// Read-mostly shared configuration: lookups clone an `Arc` snapshot, and
/// updates swap the whole list atomically so a concurrent authentication
/// never observes a partially updated list.
#[derive(Clone, Default)]
pub struct HostList {
    inner: Arc<RwLock<Arc<Vec<IpAddr>>>>,
}

impl HostList {
    /// Creates an allow-list from the given addresses.
    #[must_use]
    pub fn new(hosts: Vec<IpAddr>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(hosts))),
        }
    }

    /// Replaces the entire list in one atomic swap.
    pub fn replace(&self, hosts: Vec<IpAddr>) {
        *self.inner.write().expect("host list lock poisoned") = Arc::new(hosts);
    }

    /// True if `address` is in the allow-list.
    #[must_use]
    pub fn contains(&self, address: IpAddr) -> bool {
        self.snapshot().contains(&address)
    }

    /// Returns an immutable snapshot of the current list.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<IpAddr>> {
        self.inner.read().expect("host list lock poisoned").clone()
    }
}

/// Access-confirmation hook consulted before granting a teacher-role `DSA`
/// login.
///
/// The GUI layer implements this with a confirmation prompt; `LocalDSA`
/// logins skip the hook entirely (the authenticating principal already
/// holds the teacher role on this machine).
pub trait AccessConfirmer: Send + Sync {
    /// Returns true to grant access for `role` to the peer at `address`
    /// (None for in-process transports).
    fn confirm(&self, address: Option<IpAddr>, role: KeyRole) -> bool;
}

/// Confirmer that grants every request, for headless deployments and
/// tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessConfirmer for AllowAll {
    fn confirm(&self, _address: Option<IpAddr>, _role: KeyRole) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    #[test]
    fn challenges_are_unique_per_session() {
        let a = generate_challenge();
        let b = generate_challenge();
        assert_ne!(a, b);
    }

    #[test]
    fn internal_challenge_is_single_use() {
        let ctx = InternalChallenge::new();
        assert!(ctx.take().is_none());

        let nonce = generate_challenge();
        ctx.set(nonce);
        assert_eq!(ctx.take(), Some(nonce));
        assert!(ctx.take().is_none(), "second take must find the slot empty");
    }

    #[test]
    fn auth_file_round_trip_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("italc_auth");

        let challenge = AuthFileChallenge::create(&path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "auth file must be owner-only");
        }

        let (session_id, nonce) = read_auth_file(&path).unwrap();
        assert!(challenge.matches_session(session_id));
        assert_eq!(&nonce, challenge.nonce());

        drop(challenge);
        assert!(!path.exists(), "auth file must be removed on drop");
    }

    #[test]
    fn stale_auth_file_does_not_match_new_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("italc_auth");

        let stale = AuthFileChallenge::create(&path).unwrap();
        let stale_id = stale.session_id();
        // Keep the stale file on disk by forgetting the guard, simulating
        // a crashed process.
        std::mem::forget(stale);
        assert!(path.exists());

        let fresh = AuthFileChallenge::create(&path).unwrap();
        assert!(!fresh.matches_session(stale_id));

        drop(fresh);
        assert!(!path.exists());
    }

    #[test]
    fn truncated_auth_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("italc_auth");
        fs::write(&path, [0u8; 10]).unwrap();
        let err = read_auth_file(&path).unwrap_err();
        assert!(matches!(err, Error::Auth(AuthFailure::MalformedAuthFile)));
    }

    #[test]
    fn host_list_swaps_atomically() {
        let allowed: IpAddr = Ipv4Addr::new(192, 0, 2, 10).into();
        let other: IpAddr = Ipv4Addr::new(192, 0, 2, 11).into();

        let list = HostList::new(vec![allowed]);
        assert!(list.contains(allowed));
        assert!(!list.contains(other));

        let snapshot = list.snapshot();
        list.replace(vec![other]);
        // An in-flight authentication keeps seeing its snapshot.
        assert!(snapshot.contains(&allowed));
        assert!(list.contains(other));
        assert!(!list.contains(allowed));
    }
}
