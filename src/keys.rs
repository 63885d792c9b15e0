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

//! Key material store for iTALC access keys.
//!
//! Masters authenticate by signing challenges with an Ed25519 private key;
//! client service daemons verify the signature against the public key
//! distributed for the master's role. Private keys are owned exclusively by
//! the principal that generated them and never cross the network - only
//! public keys are exported.
//!
//! # On-Disk Layout
//!
//! Keys live at role-derived paths under a configurable base directory:
//! `<base>/<role>/key` (private, PKCS#8 PEM, owner-only permissions) and
//! `<base>/<role>/key.pub` (public, SPKI PEM). Public keys can additionally
//! be exported to a plain-text file with the conventional `.key.txt` suffix
//! for distribution to client machines.
//!
//! Key generation writes through a temporary file and renames it into
//! place, so an interrupted or concurrent generation never leaves a
//! partially written key behind.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::info;
use rand::Rng;

use crate::error::KeyError;

/// Length in bytes of a signature produced by [`PrivateKey::sign`].
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Conventional filename for an exported public key.
pub const PUBLIC_KEY_EXPORT_NAME: &str = "italc_public_key.key.txt";

/// The principal roles a key pair can be issued for.
///
/// The ordinals are part of the handshake wire format (the master states
/// its claimed role as a single byte); do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyRole {
    /// A teacher console controlling classroom machines.
    Teacher = 0,
    /// An administrator with full access.
    Admin = 1,
    /// A support agent with assist-level access.
    SupportAgent = 2,
    /// Any other principal.
    Other = 3,
}

impl KeyRole {
    /// All roles, in wire-byte order.
    pub const ALL: [KeyRole; 4] = [
        KeyRole::Teacher,
        KeyRole::Admin,
        KeyRole::SupportAgent,
        KeyRole::Other,
    ];

    /// Parses a role from its wire byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(KeyRole::Teacher),
            1 => Some(KeyRole::Admin),
            2 => Some(KeyRole::SupportAgent),
            3 => Some(KeyRole::Other),
            _ => None,
        }
    }

    /// Returns the wire byte of this role.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Directory name used for role-derived key paths.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            KeyRole::Teacher => "teacher",
            KeyRole::Admin => "admin",
            KeyRole::SupportAgent => "supporter",
            KeyRole::Other => "other",
        }
    }
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Returns the role-derived private key path under `base_dir`.
#[must_use]
pub fn private_key_path(base_dir: &Path, role: KeyRole) -> PathBuf {
    base_dir.join(role.dir_name()).join("key")
}

/// Returns the role-derived public key path under `base_dir`.
#[must_use]
pub fn public_key_path(base_dir: &Path, role: KeyRole) -> PathBuf {
    base_dir.join(role.dir_name()).join("key.pub")
}

/// An Ed25519 signing key held by an authenticating master.
///
/// Cloning is deliberately not implemented for the wrapper; the key is
/// loaded once and shared by reference.
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Loads a private key from a PKCS#8 PEM file.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::PermissionDenied`] if the file is unreadable,
    /// [`KeyError::InvalidFormat`] if it does not parse as a recognized key
    /// encoding, or [`KeyError::Io`] on any other filesystem failure.
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let pem = read_key_file(path)?;
        let key = SigningKey::from_pkcs8_pem(&pem).map_err(|e| KeyError::InvalidFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self { key })
    }

    /// Signs a message, producing a 64-byte signature verifiable with the
    /// paired public key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.key.sign(message).to_bytes()
    }

    /// Returns the public half of this key pair.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.key.verifying_key(),
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak key material through Debug output.
        f.write_str("PrivateKey(..)")
    }
}

/// An Ed25519 verification key distributed to client service daemons.
#[derive(Clone)]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    /// Loads a public key from an SPKI PEM file.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`PrivateKey::load`].
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let pem = read_key_file(path)?;
        let key = VerifyingKey::from_public_key_pem(&pem).map_err(|e| KeyError::InvalidFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self { key })
    }

    /// Structural self-consistency check, without requiring a signature
    /// test. A key that parsed but is of small order (and therefore can
    /// never bind a signature to a single signer) is reported invalid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.key.is_weak()
    }

    /// Verifies a signature over `message`.
    ///
    /// Never fails on malformed input: a signature of the wrong length or
    /// structure simply yields `false`.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.key.verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }

    /// Writes this key as SPKI PEM to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] on encoding or filesystem failure.
    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        let pem = self
            .key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::InvalidFormat {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        write_key_file(path, pem.as_bytes(), 0o644)
    }

    /// Exports this key to `dir` under the conventional
    /// [`PUBLIC_KEY_EXPORT_NAME`] filename, returning the written path.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] on encoding or filesystem failure.
    pub fn export(&self, dir: &Path) -> Result<PathBuf, KeyError> {
        let path = dir.join(PUBLIC_KEY_EXPORT_NAME);
        self.save(&path)?;
        Ok(path)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:02x?}..)", &self.key.to_bytes()[..4])
    }
}

/// A freshly generated key pair together with the role it was issued for.
#[derive(Debug)]
pub struct KeyPair {
    /// The role the pair was generated for.
    pub role: KeyRole,
    /// The private half, written to the role-derived path.
    pub private_key: PrivateKey,
    /// The public half, written alongside the private key.
    pub public_key: PublicKey,
}

/// Generates a new key pair for `role` under `base_dir`.
///
/// The private key is written to [`private_key_path`] with owner-only
/// permissions and the public key to [`public_key_path`] alongside it. Both
/// writes go through a temporary file and an atomic rename, so concurrent
/// generation for the same destination cannot interleave into a corrupted
/// key file.
///
/// # Errors
///
/// Returns [`KeyError::AlreadyExists`] if a key for this role is already
/// present and `overwrite` is false, [`KeyError::PermissionDenied`] if the
/// directory is not writable, or [`KeyError::Io`] on other filesystem
/// failures.
pub fn generate_key_pair(
    role: KeyRole,
    base_dir: &Path,
    overwrite: bool,
) -> Result<KeyPair, KeyError> {
    let priv_path = private_key_path(base_dir, role);
    let pub_path = public_key_path(base_dir, role);

    if priv_path.exists() && !overwrite {
        return Err(KeyError::AlreadyExists(priv_path));
    }

    let key_dir = base_dir.join(role.dir_name());
    fs::create_dir_all(&key_dir).map_err(|e| map_fs_error(&key_dir, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| map_fs_error(&key_dir, e))?;
    }

    let mut secret = [0u8; 32];
    rand::rng().fill(&mut secret);
    let signing_key = SigningKey::from_bytes(&secret);

    let priv_pem =
        signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::InvalidFormat {
                path: priv_path.clone(),
                reason: e.to_string(),
            })?;
    write_key_file(&priv_path, priv_pem.as_bytes(), 0o600)?;

    let public_key = PublicKey {
        key: signing_key.verifying_key(),
    };
    public_key.save(&pub_path)?;

    info!("Generated {role} key pair at {}", key_dir.display());

    Ok(KeyPair {
        role,
        private_key: PrivateKey { key: signing_key },
        public_key,
    })
}

/// Reads a key file, distinguishing permission problems from other I/O
/// failures.
fn read_key_file(path: &Path) -> Result<String, KeyError> {
    fs::read_to_string(path).map_err(|e| map_fs_error(path, e))
}

/// Writes `contents` to `path` with the given Unix mode, via a temporary
/// file in the same directory and an atomic rename.
fn write_key_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), KeyError> {
    use std::io::Write;

    // Append rather than replace the extension so "key" and "key.pub"
    // never share a temporary path.
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    let result = (|| -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let mut file = options.open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result.map_err(|e| map_fs_error(path, e))
}

fn map_fs_error(path: &Path, error: io::Error) -> KeyError {
    if error.kind() == io::ErrorKind::PermissionDenied {
        KeyError::PermissionDenied(path.to_path_buf())
    } else {
        KeyError::Io {
            path: path.to_path_buf(),
            source: error,
        }
    }
}
