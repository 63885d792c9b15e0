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

//! iTALC RFB extension layer for classroom remote-control suites.
//!
//! This crate implements the protocol extension that iTALC layers on top
//! of a standard RFB transport:
//!
//! - Security-type negotiation carrying the iTALC auth sub-negotiation
//! - Asymmetric challenge/response authentication with per-role key pairs
//! - Local-trust schemes (in-process challenge, filesystem auth file)
//! - A tagged service-message channel for classroom control commands
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::path::Path;
//! use italc_rfb::{
//!     KeyRole, MasterConfig, MasterConnection, PrivateKey, PublicKey, ServerConfig,
//!     ServiceMessage, ServiceServer, PORT_OFFSET_IVS,
//! };
//!
//! # async fn run() -> italc_rfb::Result<()> {
//! // Service daemon side.
//! let mut keys = HashMap::new();
//! keys.insert(
//!     KeyRole::Teacher,
//!     PublicKey::load(Path::new("/etc/italc/keys/public/teacher/key.pub"))?,
//! );
//! let (server, _events) = ServiceServer::new(ServerConfig::new(keys));
//! tokio::spawn(async move { server.listen(PORT_OFFSET_IVS).await });
//!
//! // Master side.
//! let key = PrivateKey::load(Path::new("/etc/italc/keys/private/teacher/key"))?;
//! let config = MasterConfig::with_key(KeyRole::Teacher, key);
//! let connection = MasterConnection::connect("192.168.1.50", 11100, &config).await?;
//! connection.send(&ServiceMessage::LockScreen).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod error;
pub mod events;
pub mod keys;
pub mod master;
pub mod platform;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;

pub use auth::{
    generate_challenge, read_auth_file, AccessConfirmer, AllowAll, AuthFileChallenge, HostList,
    InternalChallenge, CHALLENGE_SIZE,
};
pub use error::{AuthFailure, Error, KeyError, Result};
pub use events::ServerEvent;
pub use keys::{
    generate_key_pair, private_key_path, public_key_path, KeyPair, KeyRole, PrivateKey, PublicKey,
};
pub use master::{MasterConfig, MasterConnection};
pub use platform::{IdleTimers, IdleToken, NoopIdleTimers};
pub use protocol::{ItalcAuthType, PORT_OFFSET_IVS, SECURITY_TYPE_ITALC};
pub use server::{ServerConfig, ServiceServer};
pub use service::{ServiceMessage, ServiceReader, ServiceWriter};
pub use session::{AuthSession, AuthState};
