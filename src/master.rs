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

//! Master-side connections to client service daemons.
//!
//! A [`MasterConnection`] dials a service daemon, runs the prover side of
//! the handshake and then exposes the bidirectional service-message
//! channel. The auth type is chosen from the daemon's offer by a fixed
//! preference order, constrained by the credentials this master holds.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::auth::{generate_challenge, read_auth_file, InternalChallenge};
use crate::error::{AuthFailure, Error, Result};
use crate::keys::{KeyRole, PrivateKey};
use crate::protocol::{
    read_exact_timeout, read_frame_timeout, read_u32_timeout, read_u8_timeout, write_frame,
    ItalcAuthType, AUTH_RESULT_OK, DEFAULT_HANDSHAKE_TIMEOUT, MAX_HANDSHAKE_FRAME,
    PROTOCOL_VERSION, SECURITY_TYPE_ITALC,
};
use crate::service::{ServiceMessage, ServiceReader, ServiceWriter};
use crate::session::AuthSession;

/// Global atomic counter for assigning session IDs to outbound dials.
static NEXT_DIAL_ID: AtomicU64 = AtomicU64::new(1);

/// Credentials and behavior of a master when dialing service daemons.
pub struct MasterConfig {
    /// Role this master authenticates as.
    pub role: KeyRole,
    /// Private key for signature-based auth types; None restricts the
    /// master to the keyless schemes.
    pub private_key: Option<PrivateKey>,
    /// Shared context for `AppInternalChallenge` when master and daemon
    /// run in the same process.
    pub internal_challenge: Option<InternalChallenge>,
    /// Path where the daemon places `ChallengeViaAuthFile` files.
    pub auth_file_path: Option<PathBuf>,
    /// Bounded timeout applied to each handshake read step.
    pub handshake_timeout: Duration,
}

impl MasterConfig {
    /// Creates a keyless configuration for the given role.
    #[must_use]
    pub fn new(role: KeyRole) -> Self {
        Self {
            role,
            private_key: None,
            internal_challenge: None,
            auth_file_path: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Creates a configuration authenticating with the given private key.
    #[must_use]
    pub fn with_key(role: KeyRole, private_key: PrivateKey) -> Self {
        let mut config = Self::new(role);
        config.private_key = Some(private_key);
        config
    }

    /// True if this master can complete an exchange of the given type.
    fn supports(&self, auth_type: ItalcAuthType) -> bool {
        match auth_type {
            ItalcAuthType::None | ItalcAuthType::HostBased => true,
            ItalcAuthType::Dsa | ItalcAuthType::LocalDsa => self.private_key.is_some(),
            ItalcAuthType::AppInternalChallenge => self.internal_challenge.is_some(),
            ItalcAuthType::ChallengeViaAuthFile => {
                self.private_key.is_some() && self.auth_file_path.is_some()
            }
        }
    }
}

/// An authenticated master connection to one service daemon.
pub struct MasterConnection {
    writer: ServiceWriter,
    reader: ServiceReader,
    auth_type: ItalcAuthType,
}

impl std::fmt::Debug for MasterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterConnection")
            .field("auth_type", &self.auth_type)
            .finish_non_exhaustive()
    }
}

impl MasterConnection {
    /// Dials a service daemon over TCP and authenticates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the connection cannot be established and
    /// any handshake error verbatim.
    pub async fn connect(host: &str, port: u16, config: &MasterConfig) -> Result<Self> {
        let stream = TcpStream::connect(format!("{host}:{port}")).await?;
        stream.set_nodelay(true)?;
        info!("Connected to service daemon at {host}:{port}");
        Self::from_socket(stream, config).await
    }

    /// Authenticates over an already-established generic stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the peer does not speak the
    /// extension, an [`AuthFailure`] if negotiation or the exchange is
    /// refused, [`Error::Timeout`] if the peer stalls.
    pub async fn from_socket<S>(mut stream: S, config: &MasterConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = handshake(&mut stream, config).await?;
        let auth_type = session.auth_type().expect("verified session has a type");
        info!("Authenticated as {} via {auth_type}", config.role);

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            writer: ServiceWriter::new(Box::new(write_half)),
            reader: ServiceReader::new(Box::new(read_half)),
            auth_type,
        })
    }

    /// The auth type this connection was established with.
    #[must_use]
    pub fn auth_type(&self) -> ItalcAuthType {
        self.auth_type
    }

    /// A clonable handle for sending service messages.
    #[must_use]
    pub fn writer(&self) -> ServiceWriter {
        self.writer.clone()
    }

    /// Sends a service message to the daemon.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the transport write fails.
    pub async fn send(&self, message: &ServiceMessage) -> Result<()> {
        self.writer.send(message).await
    }

    /// Receives the next service message from the daemon.
    ///
    /// Returns `Ok(None)` once the daemon closes the channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on malformed traffic and
    /// [`Error::Io`] on transport failure.
    pub async fn recv(&mut self) -> Result<Option<ServiceMessage>> {
        self.reader.recv().await
    }

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the transport shutdown fails.
    pub async fn shutdown(&self) -> Result<()> {
        self.writer.shutdown().await
    }
}

/// Runs the prover side of the handshake. Returns the verified session on
/// success.
async fn handshake<S>(stream: &mut S, config: &MasterConfig) -> Result<AuthSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = config.handshake_timeout;

    // Protocol version exchange.
    let mut version = [0u8; 12];
    read_exact_timeout(stream, &mut version, timeout, "protocol version").await?;
    if !version.starts_with(b"RFB ") {
        return Err(Error::Protocol(format!(
            "peer did not speak RFB: {:?}",
            String::from_utf8_lossy(&version)
        )));
    }
    stream.write_all(PROTOCOL_VERSION.as_bytes()).await?;

    // Security type: require the iTALC extension among the offer.
    let count = read_u8_timeout(stream, timeout, "security type count").await?;
    if count == 0 {
        return Err(Error::Protocol(
            "peer offered no security types".to_string(),
        ));
    }
    let mut types = vec![0u8; count as usize];
    read_exact_timeout(stream, &mut types, timeout, "security types").await?;
    if !types.contains(&SECURITY_TYPE_ITALC) {
        return Err(Error::Protocol(format!(
            "peer does not support the iTALC security type (offered {types:?})"
        )));
    }
    stream.write_all(&[SECURITY_TYPE_ITALC]).await?;

    // Auth sub-negotiation: read the daemon's offer, pick by preference.
    let offered_count = read_u8_timeout(stream, timeout, "auth type count").await?;
    let mut offered_bytes = vec![0u8; offered_count as usize];
    read_exact_timeout(stream, &mut offered_bytes, timeout, "auth types").await?;
    let offered: Vec<ItalcAuthType> = offered_bytes
        .iter()
        .filter_map(|b| ItalcAuthType::from_u8(*b))
        .collect();
    debug!("Daemon offered auth types {offered:?}");

    let auth_type = ItalcAuthType::PREFERENCE
        .iter()
        .copied()
        .find(|ty| offered.contains(ty) && config.supports(*ty))
        .ok_or_else(|| {
            Error::Protocol(format!(
                "no usable auth type among daemon offer {offered:?}"
            ))
        })?;

    #[allow(clippy::cast_possible_truncation)] // Counter exhaustion is unreachable in practice
    let mut session = AuthSession::new(NEXT_DIAL_ID.fetch_add(1, Ordering::SeqCst) as usize);
    session.select(auth_type, config.role);

    stream
        .write_all(&[auth_type.as_u8(), config.role.as_u8()])
        .await?;

    if let Err(e) = run_exchange(stream, &mut session, auth_type, config).await {
        let _ = session.failed();
        return Err(e);
    }

    let result = read_u32_timeout(stream, timeout, "auth result").await?;
    if result != AUTH_RESULT_OK {
        let _ = session.failed();
        return Err(AuthFailure::Rejected.into());
    }
    Ok(session.verified())
}

/// Runs the per-type exchange as prover.
async fn run_exchange<S>(
    stream: &mut S,
    session: &mut AuthSession,
    auth_type: ItalcAuthType,
    config: &MasterConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = config.handshake_timeout;

    match auth_type {
        ItalcAuthType::None | ItalcAuthType::HostBased => Ok(()),

        ItalcAuthType::Dsa | ItalcAuthType::LocalDsa => {
            let key = config
                .private_key
                .as_ref()
                .ok_or(AuthFailure::NoKeyForRole(config.role))?;
            let nonce =
                read_frame_timeout(stream, MAX_HANDSHAKE_FRAME, timeout, "challenge").await?;
            session.challenge_received();
            let signature = key.sign(&nonce);
            write_frame(stream, &signature).await?;
            Ok(())
        }

        ItalcAuthType::AppInternalChallenge => {
            let context = config
                .internal_challenge
                .as_ref()
                .ok_or(AuthFailure::MissingInternalChallenge)?;
            // Deposit the nonce for the in-process verifier before it
            // goes over the connection.
            let nonce = generate_challenge();
            context.set(nonce);
            session.challenge_received();
            write_frame(stream, &nonce).await?;
            Ok(())
        }

        ItalcAuthType::ChallengeViaAuthFile => {
            let key = config
                .private_key
                .as_ref()
                .ok_or(AuthFailure::NoKeyForRole(config.role))?;
            let path = config
                .auth_file_path
                .as_ref()
                .ok_or(AuthFailure::UnsupportedAuthType(auth_type.as_u8()))?;

            // The daemon signals once the auth file is in place.
            let ready = read_u8_timeout(stream, timeout, "auth file ready marker").await?;
            if ready != 1 {
                return Err(Error::Protocol(format!(
                    "unexpected auth file ready marker {ready}"
                )));
            }

            let (session_id, nonce) = read_auth_file(path)?;
            session.challenge_received();
            let mut echoed = BytesMut::with_capacity(8);
            echoed.put_u64(session_id);
            stream.write_all(&echoed).await?;
            write_frame(stream, &key.sign(&nonce)).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::generate_challenge;
    use crate::keys::generate_key_pair;
    use crate::session::AuthState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prover_session_is_verified_after_dsa_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let pair = generate_key_pair(KeyRole::Teacher, dir.path(), false).unwrap();
        let public = pair.public_key.clone();

        let (mut daemon, mut master_end) = tokio::io::duplex(4096);
        let daemon_task = tokio::spawn(async move {
            daemon.write_all(PROTOCOL_VERSION.as_bytes()).await.unwrap();
            let mut version = [0u8; 12];
            daemon.read_exact(&mut version).await.unwrap();

            daemon.write_all(&[1, SECURITY_TYPE_ITALC]).await.unwrap();
            let mut choice = [0u8; 1];
            daemon.read_exact(&mut choice).await.unwrap();
            assert_eq!(choice[0], SECURITY_TYPE_ITALC);

            daemon
                .write_all(&[1, ItalcAuthType::Dsa.as_u8()])
                .await
                .unwrap();
            let mut selection = [0u8; 2];
            daemon.read_exact(&mut selection).await.unwrap();
            assert_eq!(selection[0], ItalcAuthType::Dsa.as_u8());
            assert_eq!(selection[1], KeyRole::Teacher.as_u8());

            let nonce = generate_challenge();
            write_frame(&mut daemon, &nonce).await.unwrap();
            let signature = read_frame_timeout(
                &mut daemon,
                MAX_HANDSHAKE_FRAME,
                DEFAULT_HANDSHAKE_TIMEOUT,
                "signature",
            )
            .await
            .unwrap();
            assert!(public.verify(&nonce, &signature));

            daemon
                .write_all(&AUTH_RESULT_OK.to_be_bytes())
                .await
                .unwrap();
        });

        let config = MasterConfig::with_key(KeyRole::Teacher, pair.private_key);
        let session = handshake(&mut master_end, &config).await.unwrap();
        assert_eq!(session.state(), AuthState::Verified);
        assert_eq!(session.auth_type(), Some(ItalcAuthType::Dsa));
        assert_eq!(session.role(), Some(KeyRole::Teacher));
        daemon_task.await.unwrap();
    }
}
