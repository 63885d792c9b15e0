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

//! Server events that can be received by the application.

use std::net::SocketAddr;

use crate::keys::KeyRole;
use crate::protocol::ItalcAuthType;
use crate::service::ServiceMessage;

/// Events emitted by the service server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was accepted and entered the handshake.
    Connected {
        /// Unique connection identifier.
        id: usize,
        /// Peer address, if the transport has one (None for in-process
        /// transports).
        address: Option<SocketAddr>,
    },

    /// A connection completed authentication and may now carry service
    /// messages.
    Authenticated {
        /// Connection identifier.
        id: usize,
        /// Role the peer authenticated as.
        role: KeyRole,
        /// The authentication scheme that was used.
        auth_type: ItalcAuthType,
    },

    /// A connection failed authentication and was closed.
    ///
    /// Timeouts are reported here as well; the `reason` string keeps them
    /// distinguishable from signature failures in diagnostics.
    AuthFailed {
        /// Connection identifier.
        id: usize,
        /// Peer address, if known.
        address: Option<SocketAddr>,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A service message arrived on an authenticated connection.
    ///
    /// Never emitted before [`ServerEvent::Authenticated`] for the same
    /// connection.
    ServiceMessage {
        /// Connection identifier.
        id: usize,
        /// The decoded message.
        message: ServiceMessage,
    },

    /// A connection was closed (after authentication).
    Disconnected {
        /// Connection identifier.
        id: usize,
    },
}
