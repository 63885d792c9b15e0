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

//! Per-connection authentication session state.
//!
//! An [`AuthSession`] is created when a connection reaches the RFB
//! security-type selection step, mutated through each handshake round, and
//! consumed once it reaches `Verified` or `Failed`. There is no partial
//! credit and no retry: a failed session closes the transport, and a new
//! attempt requires a fresh connection.

use crate::auth::CHALLENGE_SIZE;
use crate::keys::KeyRole;
use crate::protocol::ItalcAuthType;

/// Lifecycle states of an authentication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Security-type and auth-type selection in progress.
    Negotiating,
    /// The verifier has issued a challenge and awaits the response.
    ChallengeSent,
    /// The prover has received a challenge and is producing a response.
    ChallengeReceived,
    /// Authentication succeeded; the connection may carry service
    /// messages.
    Verified,
    /// Authentication failed; the transport must be closed.
    Failed,
}

/// Authentication state for a single connection.
#[derive(Debug)]
pub struct AuthSession {
    connection_id: usize,
    state: AuthState,
    auth_type: Option<ItalcAuthType>,
    role: Option<KeyRole>,
    nonce: Option<[u8; CHALLENGE_SIZE]>,
}

impl AuthSession {
    /// Creates a session in the `Negotiating` state.
    #[must_use]
    pub fn new(connection_id: usize) -> Self {
        Self {
            connection_id,
            state: AuthState::Negotiating,
            auth_type: None,
            role: None,
            nonce: None,
        }
    }

    /// The connection this session belongs to.
    #[must_use]
    pub fn connection_id(&self) -> usize {
        self.connection_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// The negotiated auth type, once selected.
    #[must_use]
    pub fn auth_type(&self) -> Option<ItalcAuthType> {
        self.auth_type
    }

    /// The claimed role, once stated by the prover.
    #[must_use]
    pub fn role(&self) -> Option<KeyRole> {
        self.role
    }

    /// The challenge nonce issued for this session, if any.
    #[must_use]
    pub fn nonce(&self) -> Option<&[u8; CHALLENGE_SIZE]> {
        self.nonce.as_ref()
    }

    /// Records the selected auth type and claimed role.
    pub fn select(&mut self, auth_type: ItalcAuthType, role: KeyRole) {
        debug_assert_eq!(self.state, AuthState::Negotiating);
        self.auth_type = Some(auth_type);
        self.role = Some(role);
    }

    /// Records that the verifier issued `nonce` for this session.
    pub fn challenge_sent(&mut self, nonce: [u8; CHALLENGE_SIZE]) {
        self.nonce = Some(nonce);
        self.state = AuthState::ChallengeSent;
    }

    /// Records that the prover obtained the challenge and is responding.
    pub fn challenge_received(&mut self) {
        self.state = AuthState::ChallengeReceived;
    }

    /// Consumes the session as verified.
    #[must_use]
    pub fn verified(mut self) -> Self {
        self.state = AuthState::Verified;
        self
    }

    /// Consumes the session as failed.
    #[must_use]
    pub fn failed(mut self) -> Self {
        self.state = AuthState::Failed;
        self.nonce = None;
        self
    }

    /// True once the session reached `Verified`.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.state == AuthState::Verified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_walks_the_verifier_path() {
        let mut session = AuthSession::new(7);
        assert_eq!(session.state(), AuthState::Negotiating);
        assert_eq!(session.connection_id(), 7);

        session.select(ItalcAuthType::Dsa, KeyRole::Teacher);
        let nonce = crate::auth::generate_challenge();
        session.challenge_sent(nonce);
        assert_eq!(session.state(), AuthState::ChallengeSent);
        assert_eq!(session.nonce(), Some(&nonce));

        let session = session.verified();
        assert!(session.is_verified());
        assert_eq!(session.auth_type(), Some(ItalcAuthType::Dsa));
        assert_eq!(session.role(), Some(KeyRole::Teacher));
    }

    #[test]
    fn failed_session_drops_its_nonce() {
        let mut session = AuthSession::new(1);
        session.select(ItalcAuthType::Dsa, KeyRole::Other);
        session.challenge_sent(crate::auth::generate_challenge());

        let session = session.failed();
        assert_eq!(session.state(), AuthState::Failed);
        assert!(session.nonce().is_none());
        assert!(!session.is_verified());
    }
}
