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

//! Collaborator interface for platform-side desktop integration.
//!
//! Screensaver suppression and input grabbing belong to the lock-screen
//! layer, not to this crate. The service daemon only needs a seam through
//! which it can ask that layer to suspend system idle timers while a
//! machine is locked or in fullscreen demo mode, and to restore them
//! afterwards.

/// Opaque handle returned by [`IdleTimers::suspend`], passed back to
/// [`IdleTimers::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleToken(u64);

impl IdleToken {
    /// Creates a token from an implementation-defined value.
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The implementation-defined value of this token.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// System idle-timer control implemented by the desktop integration layer.
pub trait IdleTimers: Send + Sync {
    /// Suspends screensaver/idle timers, returning a token for the
    /// matching [`restore`](Self::restore) call.
    fn suspend(&self) -> IdleToken;

    /// Restores the timers suspended under `token`.
    fn restore(&self, token: IdleToken);
}

/// No-op implementation for headless deployments and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIdleTimers;

impl IdleTimers for NoopIdleTimers {
    fn suspend(&self) -> IdleToken {
        IdleToken::new(0)
    }

    fn restore(&self, _token: IdleToken) {}
}
