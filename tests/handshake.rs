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

//! End-to-end handshake tests running a master against a service server
//! over in-process duplex pipes.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use italc_rfb::protocol::{AUTH_RESULT_FAILED, AUTH_RESULT_OK};
use italc_rfb::{
    AccessConfirmer, Error, InternalChallenge, ItalcAuthType, KeyPair, KeyRole, MasterConfig,
    MasterConnection, ServerConfig, ServerEvent, ServiceMessage, ServiceServer,
    SECURITY_TYPE_ITALC,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fresh_keys(role: KeyRole) -> KeyPair {
    let dir = tempfile::tempdir().expect("temp dir");
    italc_rfb::generate_key_pair(role, dir.path(), false).expect("key generation")
}

fn server_with_teacher_key(pair: &KeyPair) -> ServerConfig {
    let mut keys = HashMap::new();
    keys.insert(KeyRole::Teacher, pair.public_key.clone());
    ServerConfig::new(keys)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

/// Skips the initial `Connected` event and returns the one after it.
async fn event_after_connect(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    let first = next_event(events).await;
    assert!(matches!(first, ServerEvent::Connected { .. }));
    next_event(events).await
}

/// Drives a DSA handshake on the raw wire as prover, answering the issued
/// challenge with whatever `sign` produces. Returns the server's result
/// word and the nonce that was issued.
async fn raw_dsa_handshake(
    server: &ServiceServer,
    sign: impl FnOnce(&[u8]) -> Vec<u8>,
) -> (u32, Vec<u8>) {
    let (mut wire, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let mut version = [0u8; 12];
    wire.read_exact(&mut version).await.unwrap();
    wire.write_all(b"RFB 003.008\n").await.unwrap();

    let mut security = [0u8; 2];
    wire.read_exact(&mut security).await.unwrap();
    assert_eq!(security, [1, SECURITY_TYPE_ITALC]);
    wire.write_all(&[SECURITY_TYPE_ITALC]).await.unwrap();

    let mut count = [0u8; 1];
    wire.read_exact(&mut count).await.unwrap();
    let mut offered = vec![0u8; count[0] as usize];
    wire.read_exact(&mut offered).await.unwrap();
    wire.write_all(&[ItalcAuthType::Dsa.as_u8(), KeyRole::Teacher.as_u8()])
        .await
        .unwrap();

    let mut len = [0u8; 4];
    wire.read_exact(&mut len).await.unwrap();
    let mut nonce = vec![0u8; u32::from_be_bytes(len) as usize];
    wire.read_exact(&mut nonce).await.unwrap();

    let signature = sign(&nonce);
    wire.write_all(&(signature.len() as u32).to_be_bytes())
        .await
        .unwrap();
    wire.write_all(&signature).await.unwrap();

    let mut result = [0u8; 4];
    wire.read_exact(&mut result).await.unwrap();
    (u32::from_be_bytes(result), nonce)
}

struct DenyAll;

impl AccessConfirmer for DenyAll {
    fn confirm(&self, _address: Option<IpAddr>, _role: KeyRole) -> bool {
        false
    }
}

#[tokio::test]
async fn dsa_handshake_grants_access() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let (server, mut events) = ServiceServer::new(server_with_teacher_key(&pair));

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let config = MasterConfig::with_key(KeyRole::Teacher, pair.private_key);
    let connection = MasterConnection::from_socket(master_end, &config)
        .await
        .expect("handshake succeeds");
    assert_eq!(connection.auth_type(), ItalcAuthType::Dsa);

    match event_after_connect(&mut events).await {
        ServerEvent::Authenticated { role, auth_type, .. } => {
            assert_eq!(role, KeyRole::Teacher);
            assert_eq!(auth_type, ItalcAuthType::Dsa);
        }
        other => panic!("expected Authenticated, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    init_logging();
    let server_pair = fresh_keys(KeyRole::Teacher);
    let rogue_pair = fresh_keys(KeyRole::Teacher);
    let (server, mut events) = ServiceServer::new(server_with_teacher_key(&server_pair));

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let config = MasterConfig::with_key(KeyRole::Teacher, rogue_pair.private_key);
    let error = MasterConnection::from_socket(master_end, &config)
        .await
        .expect_err("signature from another key pair must be refused");
    assert!(error.is_auth_failure(), "unexpected error: {error}");

    assert!(matches!(
        event_after_connect(&mut events).await,
        ServerEvent::AuthFailed { .. }
    ));
}

#[tokio::test]
async fn signature_over_a_different_nonce_is_rejected() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let (server, mut events) = ServiceServer::new(server_with_teacher_key(&pair));

    // The registered key signs a mutated copy of the issued challenge.
    let (result, _) = raw_dsa_handshake(&server, |nonce| {
        let mut wrong = nonce.to_vec();
        wrong[0] ^= 0xff;
        pair.private_key.sign(&wrong).to_vec()
    })
    .await;
    assert_eq!(result, AUTH_RESULT_FAILED);

    assert!(matches!(
        event_after_connect(&mut events).await,
        ServerEvent::AuthFailed { .. }
    ));
}

#[tokio::test]
async fn replayed_nonce_does_not_satisfy_a_fresh_challenge() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let (server, _events) = ServiceServer::new(server_with_teacher_key(&pair));

    let (first_result, first_nonce) =
        raw_dsa_handshake(&server, |nonce| pair.private_key.sign(nonce).to_vec()).await;
    assert_eq!(first_result, AUTH_RESULT_OK);

    // A recorded signature over the earlier session's nonce must not
    // verify against the new challenge.
    let (second_result, _) =
        raw_dsa_handshake(&server, |_| pair.private_key.sign(&first_nonce).to_vec()).await;
    assert_eq!(second_result, AUTH_RESULT_FAILED);
}

#[tokio::test]
async fn denied_confirmer_blocks_dsa_teacher_logins() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let mut config = server_with_teacher_key(&pair);
    config.offered = vec![ItalcAuthType::Dsa];
    config.confirmer = Arc::new(DenyAll);
    let (server, _events) = ServiceServer::new(config);

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let master = MasterConfig::with_key(KeyRole::Teacher, pair.private_key);
    let error = MasterConnection::from_socket(master_end, &master)
        .await
        .expect_err("operator denial must refuse access");
    assert!(error.is_auth_failure());
}

#[tokio::test]
async fn local_dsa_bypasses_the_confirmer() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let mut config = server_with_teacher_key(&pair);
    config.offered = vec![ItalcAuthType::LocalDsa];
    config.confirmer = Arc::new(DenyAll);
    let (server, _events) = ServiceServer::new(config);

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let master = MasterConfig::with_key(KeyRole::Teacher, pair.private_key);
    let connection = MasterConnection::from_socket(master_end, &master)
        .await
        .expect("local variant must not consult the confirmer");
    assert_eq!(connection.auth_type(), ItalcAuthType::LocalDsa);
}

#[tokio::test]
async fn auth_type_none_grants_access_without_credentials() {
    init_logging();
    let mut config = ServerConfig::new(HashMap::new());
    config.offered = vec![ItalcAuthType::None];
    let (server, _events) = ServiceServer::new(config);

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let connection = MasterConnection::from_socket(master_end, &MasterConfig::new(KeyRole::Other))
        .await
        .expect("None auth must accept any peer");
    assert_eq!(connection.auth_type(), ItalcAuthType::None);
}

#[tokio::test]
async fn host_based_consults_the_allow_list() {
    init_logging();
    let allowed: SocketAddr = "192.168.1.10:5900".parse().unwrap();
    let denied: SocketAddr = "10.0.0.9:5900".parse().unwrap();

    let mut config = ServerConfig::new(HashMap::new());
    config.offered = vec![ItalcAuthType::HostBased];
    config.host_list.replace(vec![allowed.ip()]);
    let (server, _events) = ServiceServer::new(config);

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, Some(allowed)).await;
    MasterConnection::from_socket(master_end, &MasterConfig::new(KeyRole::Teacher))
        .await
        .expect("listed host must be accepted");

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, Some(denied)).await;
    let error = MasterConnection::from_socket(master_end, &MasterConfig::new(KeyRole::Teacher))
        .await
        .expect_err("unlisted host must be refused");
    assert!(error.is_auth_failure());
}

#[tokio::test]
async fn internal_challenge_authenticates_in_process_masters() {
    init_logging();
    let shared = InternalChallenge::new();

    let mut config = ServerConfig::new(HashMap::new());
    config.offered = vec![ItalcAuthType::AppInternalChallenge];
    config.internal_challenge = Some(shared.clone());
    let (server, mut events) = ServiceServer::new(config);

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let mut master = MasterConfig::new(KeyRole::Teacher);
    master.internal_challenge = Some(shared);
    let connection = MasterConnection::from_socket(master_end, &master)
        .await
        .expect("shared challenge context must authenticate");
    assert_eq!(connection.auth_type(), ItalcAuthType::AppInternalChallenge);

    assert!(matches!(
        event_after_connect(&mut events).await,
        ServerEvent::Authenticated { .. }
    ));
}

#[tokio::test]
async fn internal_challenge_requires_a_local_transport() {
    init_logging();
    let shared = InternalChallenge::new();

    let mut config = ServerConfig::new(HashMap::new());
    config.offered = vec![ItalcAuthType::AppInternalChallenge];
    config.internal_challenge = Some(shared.clone());
    let (server, _events) = ServiceServer::new(config);

    let remote: SocketAddr = "203.0.113.7:5900".parse().unwrap();
    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, Some(remote)).await;

    let mut master = MasterConfig::new(KeyRole::Teacher);
    master.internal_challenge = Some(shared);
    let error = MasterConnection::from_socket(master_end, &master)
        .await
        .expect_err("local-only scheme must refuse a routed peer");
    assert!(error.is_auth_failure());
}

#[tokio::test]
async fn auth_file_exchange_cleans_up_the_file() {
    init_logging();
    let pair = fresh_keys(KeyRole::Admin);
    let dir = tempfile::tempdir().expect("temp dir");
    let file_path = dir.path().join("italc_auth");

    let mut keys = HashMap::new();
    keys.insert(KeyRole::Admin, pair.public_key.clone());
    let mut config = ServerConfig::new(keys);
    config.offered = vec![ItalcAuthType::ChallengeViaAuthFile];
    config.auth_file_path = Some(file_path.clone());
    let (server, _events) = ServiceServer::new(config);

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let mut master = MasterConfig::with_key(KeyRole::Admin, pair.private_key);
    master.auth_file_path = Some(file_path.clone());
    let connection = MasterConnection::from_socket(master_end, &master)
        .await
        .expect("auth file exchange succeeds");
    assert_eq!(connection.auth_type(), ItalcAuthType::ChallengeViaAuthFile);
    assert!(
        !file_path.exists(),
        "auth file must be removed after the exchange"
    );
}

#[tokio::test]
async fn no_mutual_auth_type_fails_cleanly() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let (server, mut events) = ServiceServer::new(server_with_teacher_key(&pair));

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    // Keyless master against a server offering only signature schemes.
    let error = MasterConnection::from_socket(master_end, &MasterConfig::new(KeyRole::Teacher))
        .await
        .expect_err("a keyless master cannot satisfy a DSA-only offer");
    assert!(matches!(error, Error::Protocol(_)));

    assert!(matches!(
        event_after_connect(&mut events).await,
        ServerEvent::AuthFailed { .. }
    ));
}

#[tokio::test]
async fn service_messages_flow_both_ways_after_auth() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let (server, mut events) = ServiceServer::new(server_with_teacher_key(&pair));

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let config = MasterConfig::with_key(KeyRole::Teacher, pair.private_key);
    let mut connection = MasterConnection::from_socket(master_end, &config)
        .await
        .expect("handshake succeeds");

    let id = match event_after_connect(&mut events).await {
        ServerEvent::Authenticated { id, .. } => id,
        other => panic!("expected Authenticated, got {other:?}"),
    };

    connection
        .send(&ServiceMessage::LockScreen)
        .await
        .expect("send to daemon");
    match next_event(&mut events).await {
        ServerEvent::ServiceMessage { id: from, message } => {
            assert_eq!(from, id);
            assert!(matches!(message, ServiceMessage::LockScreen));
        }
        other => panic!("expected ServiceMessage, got {other:?}"),
    }

    let sent = server
        .send_to(
            id,
            &ServiceMessage::TextMessage {
                role: KeyRole::Teacher,
                text: "eyes front".to_string(),
            },
        )
        .await
        .expect("send to master");
    assert!(sent);

    let received = timeout(Duration::from_secs(2), connection.recv())
        .await
        .expect("recv within deadline")
        .expect("channel healthy")
        .expect("message, not EOF");
    match received {
        ServiceMessage::TextMessage { role, text } => {
            assert_eq!(role, KeyRole::Teacher);
            assert_eq!(text, "eyes front");
        }
        other => panic!("expected TextMessage, got {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_is_reported_after_master_hangup() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let (server, mut events) = ServiceServer::new(server_with_teacher_key(&pair));

    let (master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    let config = MasterConfig::with_key(KeyRole::Teacher, pair.private_key);
    let connection = MasterConnection::from_socket(master_end, &config)
        .await
        .expect("handshake succeeds");
    assert!(matches!(
        event_after_connect(&mut events).await,
        ServerEvent::Authenticated { .. }
    ));

    connection.shutdown().await.expect("clean shutdown");
    drop(connection);

    assert!(matches!(
        next_event(&mut events).await,
        ServerEvent::Disconnected { .. }
    ));
    assert!(server.connected_ids().await.is_empty());
}

#[tokio::test]
async fn garbage_before_the_handshake_never_reaches_the_service_layer() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let (server, mut events) = ServiceServer::new(server_with_teacher_key(&pair));

    let (mut master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    master_end
        .write_all(b"GET / HTTP/1.1\r\n\r\n")
        .await
        .expect("write garbage");
    drop(master_end);

    match event_after_connect(&mut events).await {
        ServerEvent::AuthFailed { .. } => {}
        other => panic!("expected AuthFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn stalled_peer_times_out() {
    init_logging();
    let pair = fresh_keys(KeyRole::Teacher);
    let mut config = server_with_teacher_key(&pair);
    config.handshake_timeout = Duration::from_millis(100);
    let (server, mut events) = ServiceServer::new(config);

    // The master end stays open but never writes a byte.
    let (_master_end, server_end) = tokio::io::duplex(4096);
    server.from_socket(server_end, None).await;

    match event_after_connect(&mut events).await {
        ServerEvent::AuthFailed { reason, .. } => {
            assert!(reason.contains("timed out"), "reason: {reason}");
        }
        other => panic!("expected AuthFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_handshakes_do_not_interfere() {
    init_logging();
    let key_dir = tempfile::tempdir().expect("temp dir");
    let pair = italc_rfb::generate_key_pair(KeyRole::Teacher, key_dir.path(), false)
        .expect("key generation");
    let (server, mut events) = ServiceServer::new(server_with_teacher_key(&pair));

    let mut handles = Vec::new();
    for n in 0..8 {
        let (master_end, server_end) = tokio::io::duplex(4096);
        server.from_socket(server_end, None).await;

        // Even masters reload the accepted key from disk, odd ones
        // present a freshly generated rogue key.
        let use_good = n % 2 == 0;
        let private_key = if use_good {
            italc_rfb::PrivateKey::load(&italc_rfb::private_key_path(
                key_dir.path(),
                KeyRole::Teacher,
            ))
            .expect("reload private key")
        } else {
            fresh_keys(KeyRole::Teacher).private_key
        };
        let config = MasterConfig::with_key(KeyRole::Teacher, private_key);
        handles.push((
            use_good,
            tokio::spawn(
                async move { MasterConnection::from_socket(master_end, &config).await },
            ),
        ));
    }

    for (use_good, handle) in handles {
        let result = handle.await.expect("task completes");
        if use_good {
            result.expect("good key authenticates");
        } else {
            assert!(result.is_err(), "rogue key must be refused");
        }
    }

    let mut authenticated = 0;
    let mut rejected = 0;
    for _ in 0..16 {
        match next_event(&mut events).await {
            ServerEvent::Connected { .. } => {}
            ServerEvent::Authenticated { .. } => authenticated += 1,
            ServerEvent::AuthFailed { .. } => rejected += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(authenticated, 4);
    assert_eq!(rejected, 4);
}
