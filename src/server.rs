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

//! The client-side service daemon accepting master connections.
//!
//! This module provides the server half of the iTALC extension:
//! - TCP listener for incoming master connections
//! - Per-connection handshake (verifier side) and session management
//! - Service message routing to the application layer via channels
//!
//! # Architecture
//!
//! Each connection runs in its own asynchronous task. The task drives the
//! RFB handshake and the iTALC auth sub-negotiation to completion, then
//! loops decoding service messages and forwarding them as [`ServerEvent`]s.
//! A failed or timed-out handshake closes the transport; it never affects
//! other connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};

use crate::auth::{
    generate_challenge, AccessConfirmer, AllowAll, AuthFileChallenge, HostList, InternalChallenge,
};
use crate::error::{AuthFailure, Error, Result};
use crate::events::ServerEvent;
use crate::keys::{KeyRole, PublicKey};
use crate::platform::{IdleTimers, IdleToken, NoopIdleTimers};
use crate::protocol::{
    read_exact_timeout, read_frame_timeout, read_u8_timeout, write_frame, ItalcAuthType,
    AUTH_RESULT_FAILED, AUTH_RESULT_OK, DEFAULT_HANDSHAKE_TIMEOUT, MAX_HANDSHAKE_FRAME,
    PROTOCOL_VERSION, SECURITY_TYPE_ITALC,
};
use crate::service::{read_service_message, ServiceMessage, ServiceWriter};
use crate::session::AuthSession;

/// Global atomic counter for assigning unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration of the service daemon's authentication behavior.
///
/// All values here are resolved by a configuration collaborator before
/// construction; this crate does not parse configuration files.
pub struct ServerConfig {
    /// Auth types offered to connecting masters, in offer order.
    pub offered: Vec<ItalcAuthType>,
    /// Public key registered per role, loaded once at startup.
    pub public_keys: HashMap<KeyRole, PublicKey>,
    /// Allow-list consulted for `HostBased` authentication.
    pub host_list: HostList,
    /// Shared context for `AppInternalChallenge`; None disables the
    /// scheme.
    pub internal_challenge: Option<InternalChallenge>,
    /// Path for `ChallengeViaAuthFile` exchanges; None disables the
    /// scheme.
    pub auth_file_path: Option<PathBuf>,
    /// Hook consulted before granting teacher-role `DSA` logins.
    pub confirmer: Arc<dyn AccessConfirmer>,
    /// Desktop-integration hook for idle-timer suppression while locked
    /// or in fullscreen demo mode.
    pub idle_timers: Arc<dyn IdleTimers>,
    /// Bounded timeout applied to each handshake read step.
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    /// Creates a configuration offering `DSA` and `LocalDSA` with the
    /// given role keys and permissive defaults for the optional hooks.
    #[must_use]
    pub fn new(public_keys: HashMap<KeyRole, PublicKey>) -> Self {
        Self {
            offered: vec![ItalcAuthType::Dsa, ItalcAuthType::LocalDsa],
            public_keys,
            host_list: HostList::default(),
            internal_challenge: None,
            auth_file_path: None,
            confirmer: Arc::new(AllowAll),
            idle_timers: Arc::new(NoopIdleTimers),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// The iTALC service server.
///
/// Accepts master connections, authenticates them and forwards their
/// service messages to the application as [`ServerEvent`]s.
#[derive(Clone)]
pub struct ServiceServer {
    config: Arc<ServerConfig>,
    /// Write halves of authenticated connections, for outbound service
    /// messages and shutdown.
    writers: Arc<RwLock<HashMap<usize, ServiceWriter>>>,
    /// Task handles for waiting on connection tasks to exit.
    tasks: Arc<RwLock<Vec<tokio::task::JoinHandle<()>>>>,
    /// Sender for server-wide events consumed by the application.
    event_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ServiceServer {
    /// Creates a new `ServiceServer`.
    ///
    /// Returns the server together with the receiver for the events it
    /// emits.
    #[must_use]
    pub fn new(config: ServerConfig) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let server = Self {
            config: Arc::new(config),
            writers: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(Vec::new())),
            event_tx,
        };
        (server, event_rx)
    }

    /// Starts listening for master connections on the specified port.
    ///
    /// Enters an infinite accept loop, spawning a task per connection.
    ///
    /// # Errors
    ///
    /// Returns `Err(std::io::Error)` if the port cannot be bound or a
    /// connection cannot be accepted.
    pub async fn listen(&self, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        info!("iTALC service listening on port {port}");

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    stream.set_nodelay(true)?;
                    self.spawn_connection(stream, Some(addr)).await;
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
    }

    /// Accepts a master connection from a generic stream.
    ///
    /// This allows serving connections over any transport implementing
    /// `AsyncRead + AsyncWrite + Unpin + Send`, such as in-process duplex
    /// pipes. Pass the peer address if the transport has one; a `None`
    /// peer is treated as an in-process (local) transport.
    ///
    /// Returns the connection id assigned to the new connection.
    pub async fn from_socket<S>(&self, stream: S, peer: Option<SocketAddr>) -> usize
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.spawn_connection(stream, peer).await
    }

    async fn spawn_connection<S>(&self, stream: S, peer: Option<SocketAddr>) -> usize
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        #[allow(clippy::cast_possible_truncation)] // Counter exhaustion is unreachable in practice
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst) as usize;

        let config = self.config.clone();
        let writers = self.writers.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            Self::handle_connection(stream, connection_id, peer, config, writers, event_tx).await;
        });
        self.tasks.write().await.push(handle);

        connection_id
    }

    /// Drives one connection from handshake to disconnect.
    async fn handle_connection<S>(
        mut stream: S,
        connection_id: usize,
        peer: Option<SocketAddr>,
        config: Arc<ServerConfig>,
        writers: Arc<RwLock<HashMap<usize, ServiceWriter>>>,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _ = event_tx.send(ServerEvent::Connected {
            id: connection_id,
            address: peer,
        });

        let session = match authenticate(&mut stream, connection_id, peer, &config).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Connection {connection_id} authentication failed: {e}");
                let _ = event_tx.send(ServerEvent::AuthFailed {
                    id: connection_id,
                    address: peer,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let role = session.role().expect("verified session has a role");
        let auth_type = session.auth_type().expect("verified session has a type");
        info!("Connection {connection_id} authenticated as {role} via {auth_type}");
        let _ = event_tx.send(ServerEvent::Authenticated {
            id: connection_id,
            role,
            auth_type,
        });

        let (mut read_half, write_half) = tokio::io::split(stream);
        let writer = ServiceWriter::new(Box::new(write_half));
        writers.write().await.insert(connection_id, writer);

        // Idle timers are suspended while this connection holds the
        // machine locked or in fullscreen demo mode.
        let mut idle_token: Option<IdleToken> = None;

        loop {
            match read_service_message(&mut read_half).await {
                Ok(Some(message)) => {
                    match &message {
                        ServiceMessage::LockScreen
                        | ServiceMessage::DemoStart {
                            fullscreen: true, ..
                        } => {
                            if idle_token.is_none() {
                                idle_token = Some(config.idle_timers.suspend());
                            }
                        }
                        ServiceMessage::UnlockScreen | ServiceMessage::DemoStop => {
                            if let Some(token) = idle_token.take() {
                                config.idle_timers.restore(token);
                            }
                        }
                        _ => {}
                    }
                    let _ = event_tx.send(ServerEvent::ServiceMessage {
                        id: connection_id,
                        message,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Connection {connection_id} service channel error: {e}");
                    break;
                }
            }
        }

        if let Some(token) = idle_token.take() {
            config.idle_timers.restore(token);
        }
        writers.write().await.remove(&connection_id);
        let _ = event_tx.send(ServerEvent::Disconnected { id: connection_id });
        info!("Connection {connection_id} disconnected");
    }

    /// Sends a service message to one authenticated connection.
    ///
    /// Returns `Ok(false)` if no authenticated connection with that id
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the transport write fails.
    pub async fn send_to(&self, connection_id: usize, message: &ServiceMessage) -> Result<bool> {
        let writer = {
            let writers = self.writers.read().await;
            writers.get(&connection_id).cloned()
        };
        match writer {
            Some(writer) => {
                writer.send(message).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Sends a service message to every authenticated connection.
    ///
    /// Failures on individual connections are logged and skipped.
    pub async fn broadcast(&self, message: &ServiceMessage) {
        // Snapshot before sending to avoid holding the lock across writes.
        let writers: Vec<(usize, ServiceWriter)> = {
            let guard = self.writers.read().await;
            guard.iter().map(|(id, w)| (*id, w.clone())).collect()
        };
        for (id, writer) in writers {
            if let Err(e) = writer.send(message).await {
                warn!("Broadcast to connection {id} failed: {e}");
            }
        }
    }

    /// Returns the ids of all authenticated connections.
    pub async fn connected_ids(&self) -> Vec<usize> {
        self.writers.read().await.keys().copied().collect()
    }

    /// Disconnects all connections by aborting their tasks and shutting
    /// down their write halves.
    pub async fn disconnect_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.write().await);
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let writers = std::mem::take(&mut *self.writers.write().await);
        for (id, writer) in writers {
            if let Err(e) = writer.shutdown().await {
                warn!("Shutdown of connection {id} failed: {e}");
            }
        }
    }
}

/// Runs the verifier side of the handshake on a fresh connection.
///
/// On success the returned session is `Verified` and the stream is
/// positioned at the start of service-message traffic. On any failure the
/// caller must drop the transport; negotiation has no retry.
async fn authenticate<S>(
    stream: &mut S,
    connection_id: usize,
    peer: Option<SocketAddr>,
    config: &ServerConfig,
) -> Result<AuthSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = config.handshake_timeout;

    // Protocol version exchange.
    stream.write_all(PROTOCOL_VERSION.as_bytes()).await?;
    let mut version = [0u8; 12];
    read_exact_timeout(stream, &mut version, timeout, "protocol version").await?;
    if !version.starts_with(b"RFB ") {
        return Err(Error::Protocol(format!(
            "peer did not speak RFB: {:?}",
            String::from_utf8_lossy(&version)
        )));
    }

    // Security type: offer only the iTALC extension.
    stream.write_all(&[1, SECURITY_TYPE_ITALC]).await?;
    let selected = read_u8_timeout(stream, timeout, "security type").await?;
    if selected != SECURITY_TYPE_ITALC {
        return Err(Error::Protocol(format!(
            "peer selected unsupported security type {selected}"
        )));
    }

    let mut session = AuthSession::new(connection_id);

    // iTALC sub-negotiation: offered auth types, then the peer's choice
    // and claimed role.
    let mut offer = BytesMut::with_capacity(1 + config.offered.len());
    #[allow(clippy::cast_possible_truncation)] // At most 6 auth types exist
    offer.put_u8(config.offered.len() as u8);
    for ty in &config.offered {
        offer.put_u8(ty.as_u8());
    }
    stream.write_all(&offer).await?;

    let choice_byte = read_u8_timeout(stream, timeout, "auth type choice").await?;
    let role_byte = read_u8_timeout(stream, timeout, "claimed role").await?;

    let (auth_type, role) = match check_selection(choice_byte, role_byte, config) {
        Ok((ty, role)) => {
            session.select(ty, role);
            (ty, role)
        }
        Err(e) => return reject(stream, session, e).await,
    };

    match run_exchange(stream, &mut session, auth_type, role, peer, config).await {
        Ok(()) => {
            let mut result = BytesMut::with_capacity(4);
            result.put_u32(AUTH_RESULT_OK);
            stream.write_all(&result).await?;
            Ok(session.verified())
        }
        Err(e) => reject(stream, session, e).await,
    }
}

/// Answers `ItalcAuthFailed` (best effort) and fails the session.
async fn reject<S>(stream: &mut S, session: AuthSession, error: Error) -> Result<AuthSession>
where
    S: AsyncWrite + Unpin,
{
    let _ = session.failed();
    if matches!(error, Error::Auth(_) | Error::Protocol(_)) {
        let mut result = BytesMut::with_capacity(4);
        result.put_u32(AUTH_RESULT_FAILED);
        let _ = stream.write_all(&result).await;
    }
    Err(error)
}

fn check_selection(
    choice_byte: u8,
    role_byte: u8,
    config: &ServerConfig,
) -> Result<(ItalcAuthType, KeyRole)> {
    let auth_type = ItalcAuthType::from_u8(choice_byte)
        .filter(|ty| config.offered.contains(ty))
        .ok_or(AuthFailure::UnsupportedAuthType(choice_byte))?;
    let role = KeyRole::from_u8(role_byte).ok_or(AuthFailure::UnknownRole(role_byte))?;
    Ok((auth_type, role))
}

/// Runs the per-type exchange as verifier. `Ok(())` means access granted.
async fn run_exchange<S>(
    stream: &mut S,
    session: &mut AuthSession,
    auth_type: ItalcAuthType,
    role: KeyRole,
    peer: Option<SocketAddr>,
    config: &ServerConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = config.handshake_timeout;

    if auth_type.is_local_only() && !is_local(peer) {
        return Err(AuthFailure::NotLocal.into());
    }

    match auth_type {
        ItalcAuthType::None => Ok(()),

        ItalcAuthType::HostBased => {
            // In-process transports have no address and are local by
            // construction.
            let Some(addr) = peer else { return Ok(()) };
            if config.host_list.contains(addr.ip()) {
                Ok(())
            } else {
                Err(AuthFailure::HostNotAllowed(addr.ip()).into())
            }
        }

        ItalcAuthType::Dsa | ItalcAuthType::LocalDsa => {
            let nonce = generate_challenge();
            session.challenge_sent(nonce);
            write_frame(stream, &nonce).await?;

            let signature =
                read_frame_timeout(stream, MAX_HANDSHAKE_FRAME, timeout, "challenge signature")
                    .await?;
            let key = config
                .public_keys
                .get(&role)
                .ok_or(AuthFailure::NoKeyForRole(role))?;
            if !key.verify(&nonce, &signature) {
                return Err(AuthFailure::SignatureMismatch.into());
            }

            // A teacher-role DSA login on the machine's own service asks
            // the operator; LocalDSA suppresses the prompt.
            if auth_type == ItalcAuthType::Dsa
                && role == KeyRole::Teacher
                && !config.confirmer.confirm(peer.map(|a| a.ip()), role)
            {
                return Err(AuthFailure::AccessDenied.into());
            }
            Ok(())
        }

        ItalcAuthType::AppInternalChallenge => {
            let context = config
                .internal_challenge
                .as_ref()
                .ok_or(AuthFailure::MissingInternalChallenge)?;

            let sent =
                read_frame_timeout(stream, MAX_HANDSHAKE_FRAME, timeout, "internal challenge")
                    .await?;
            // The slot is only writable from inside this process; taking
            // it also makes the nonce single use.
            let expected = context
                .take()
                .ok_or(AuthFailure::MissingInternalChallenge)?;
            session.challenge_sent(expected);
            if sent.as_slice() == expected.as_slice() {
                Ok(())
            } else {
                Err(AuthFailure::ChallengeMismatch.into())
            }
        }

        ItalcAuthType::ChallengeViaAuthFile => {
            let path = config
                .auth_file_path
                .as_ref()
                .ok_or(AuthFailure::UnsupportedAuthType(auth_type.as_u8()))?;
            let challenge = AuthFileChallenge::create(path)?;
            session.challenge_sent(*challenge.nonce());

            // Tell the prover the file is in place.
            stream.write_all(&[1]).await?;

            let mut echoed_id = [0u8; 8];
            read_exact_timeout(stream, &mut echoed_id, timeout, "auth file session id").await?;
            let signature =
                read_frame_timeout(stream, MAX_HANDSHAKE_FRAME, timeout, "auth file signature")
                    .await?;

            if !challenge.matches_session(u64::from_be_bytes(echoed_id)) {
                return Err(AuthFailure::StaleAuthFile.into());
            }
            let key = config
                .public_keys
                .get(&role)
                .ok_or(AuthFailure::NoKeyForRole(role))?;
            if !key.verify(challenge.nonce(), &signature) {
                return Err(AuthFailure::SignatureMismatch.into());
            }
            Ok(())
            // The drop of `challenge` removes the auth file on this and
            // every earlier exit path.
        }
    }
}

fn is_local(peer: Option<SocketAddr>) -> bool {
    peer.map_or(true, |addr| addr.ip().is_loopback())
}
