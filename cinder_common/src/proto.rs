// cinder_common is the main cinder library implementing the protocol shared logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::gate::GateMode;
use crate::id::{FileId, LinkId, SessionId};
use crate::memory::{SafeBlob, SizeRule};
use crate::{MemoryError, ValueError};

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// The length of a [`Salt`] in bytes.
pub const SALT_LEN: usize = 16;
/// The length of a [`SessionSecret`] in bytes.
pub const SECRET_LEN: usize = 32;
/// The length of a request [`Hmac`] in bytes (HMAC-SHA512 output).
pub const HMAC_LEN: usize = 64;
/// The maximum length of a key [`Envelope`] in bytes.
pub const ENVELOPE_MAX_LEN: usize = 1024;
/// The length of an AEAD nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;
/// The length of the AEAD authentication tag in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// The minimum exchange lifetime in seconds.
pub const MIN_EXPIRY_SECONDS: u32 = 1;
/// The maximum exchange lifetime in seconds (7 days).
pub const MAX_EXPIRY_SECONDS: u32 = 604_800;

/// A `Salt` is the fixed-size key derivation salt uploaded alongside
/// the sealed envelope. It is client-produced derivation input,
/// sealed at rest but not wipe-sensitive by itself.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    /// Validates and wraps a salt of exactly [`SALT_LEN`] bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, ValueError> {
        let array: [u8; SALT_LEN] = bytes.try_into().map_err(|v: Vec<u8>| ValueError::FixedSize {
            field: "salt",
            expected: SALT_LEN,
            actual: v.len(),
        })?;

        Ok(Self(array))
    }

    /// Returns the salt bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// An `Envelope` is the client-sealed key envelope: the wrapped file key
/// the server stores but can never open.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Envelope(Vec<u8>);

impl Envelope {
    /// Validates and wraps an envelope of 1 to [`ENVELOPE_MAX_LEN`] bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, ValueError> {
        if bytes.is_empty() || bytes.len() > ENVELOPE_MAX_LEN {
            return Err(ValueError::BoundedSize {
                field: "envelope",
                min: 1,
                max: ENVELOPE_MAX_LEN,
                actual: bytes.len(),
            });
        }

        Ok(Self(bytes))
    }

    /// Returns the envelope bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A `GateHash` is the digest a client access key is compared against,
/// e.g. `SHA-256(answers || quiz_nonce)` in quiz mode.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct GateHash(Vec<u8>);

impl GateHash {
    /// Validates and wraps a SHA-256 or SHA-512 sized digest.
    pub fn new(bytes: Vec<u8>) -> Result<Self, ValueError> {
        if bytes.len() != 32 && bytes.len() != 64 {
            return Err(ValueError::DigestSize {
                field: "gate hash",
                actual: bytes.len(),
            });
        }

        Ok(Self(bytes))
    }

    /// Returns the digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Compares a candidate access key against the digest in constant time.
    pub fn ct_verify(&self, candidate: &[u8]) -> bool {
        candidate.len() == self.0.len() && bool::from(self.0.ct_eq(candidate))
    }
}

impl fmt::Debug for GateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GateHash({} bytes)", self.0.len())
    }
}

/// An `Hmac` is the HMAC-SHA512 authentication tag of a request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Hmac(Vec<u8>);

impl Hmac {
    /// Validates and wraps a tag of exactly [`HMAC_LEN`] bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, ValueError> {
        if bytes.len() != HMAC_LEN {
            return Err(ValueError::FixedSize {
                field: "hmac",
                expected: HMAC_LEN,
                actual: bytes.len(),
            });
        }

        Ok(Self(bytes))
    }

    /// Returns the tag bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A `SessionSecret` is the per-session HMAC key shared with the client
/// during a handshake. It is wipe-sensitive and lives in a [`SafeBlob`].
#[derive(Clone, Debug)]
pub struct SessionSecret(SafeBlob);

impl SessionSecret {
    /// Takes ownership of exactly [`SECRET_LEN`] key bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, MemoryError> {
        Ok(Self(SafeBlob::new_sized(
            bytes,
            SizeRule::Exact(SECRET_LEN),
        )?))
    }

    /// Returns the key bytes.
    pub fn bytes(&self) -> Result<&[u8], MemoryError> {
        self.0.bytes()
    }
}

/// A `SealedBlob` is a piece of metadata sealed by the pepper vault:
/// ciphertext with its AEAD tag, the nonce, and the pepper version
/// it was sealed under.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SealedBlob {
    pepper_version: i16,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl SealedBlob {
    /// The minimum wire length: version, nonce and a bare AEAD tag.
    pub const MIN_LEN: usize = 2 + NONCE_LEN + TAG_LEN;

    /// Wraps AEAD output produced under the given pepper version.
    pub fn new(pepper_version: i16, nonce: [u8; NONCE_LEN], ciphertext: Vec<u8>) -> Self {
        Self {
            pepper_version,
            nonce,
            ciphertext,
        }
    }

    /// Returns the pepper version this blob was sealed under.
    pub fn pepper_version(&self) -> i16 {
        self.pepper_version
    }

    /// Returns the AEAD nonce.
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Returns the ciphertext including its trailing tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Serializes to the wire form
    /// `version (i16 BE) || nonce (12 B) || ciphertext-with-tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + NONCE_LEN + self.ciphertext.len());
        buf.extend_from_slice(&self.pepper_version.to_be_bytes());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ciphertext);

        buf
    }

    /// Deserializes from the wire form produced by [`SealedBlob::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValueError> {
        if bytes.len() < Self::MIN_LEN {
            return Err(ValueError::Truncated {
                field: "sealed blob",
                min: Self::MIN_LEN,
                actual: bytes.len(),
            });
        }

        let pepper_version = i16::from_be_bytes([bytes[0], bytes[1]]);
        let mut nonce = [0; NONCE_LEN];
        nonce.copy_from_slice(&bytes[2..2 + NONCE_LEN]);

        Ok(Self {
            pepper_version,
            nonce,
            ciphertext: bytes[2 + NONCE_LEN..].to_vec(),
        })
    }
}

/// `FileSpecs` are the sender-chosen lifetime and attempt budget
/// of an exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileSpecs {
    expiry_seconds: u32,
    max_attempts: u16,
}

impl FileSpecs {
    /// Validates the lifetime against
    /// [`MIN_EXPIRY_SECONDS`]..=[`MAX_EXPIRY_SECONDS`]
    /// and requires at least one download attempt.
    pub fn new(expiry_seconds: u32, max_attempts: u16) -> Result<Self, ValueError> {
        if !(MIN_EXPIRY_SECONDS..=MAX_EXPIRY_SECONDS).contains(&expiry_seconds) {
            return Err(ValueError::Range {
                field: "expiry seconds",
                min: MIN_EXPIRY_SECONDS as u64,
                max: MAX_EXPIRY_SECONDS as u64,
                actual: expiry_seconds as u64,
            });
        }
        if max_attempts == 0 {
            return Err(ValueError::Range {
                field: "max attempts",
                min: 1,
                max: u16::MAX as u64,
                actual: 0,
            });
        }

        Ok(Self {
            expiry_seconds,
            max_attempts,
        })
    }

    /// Returns the exchange lifetime in seconds.
    pub fn expiry_seconds(&self) -> u32 {
        self.expiry_seconds
    }

    /// Returns the download attempt budget.
    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }
}

/// A `PathReference` is an opaque token naming blob bytes in the file store.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct PathReference(String);

impl PathReference {
    /// Wraps a file store token.
    pub fn new(token: String) -> Self {
        Self(token)
    }

    /// Returns the token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `SessionMode` tells an upload exchange apart from a download exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionMode {
    /// The session authorizes a single upload.
    Upload,
    /// The session authorizes a single verify-and-download.
    Download,
}

/// A `SessionState` tracks how far a download session has progressed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// The session awaits its one upload or verify request.
    Pending,
    /// The payload has been delivered; the session awaits the burn
    /// acknowledgment.
    AwaitingAck,
}

/// A `Session` binds an in-flight upload or download exchange to its
/// HMAC secret and, for downloads, to the link it operates on.
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    secret: Option<SessionSecret>,
    link_id: Option<LinkId>,
    mode: SessionMode,
    state: SessionState,
    created_at: NaiveDateTime,
    expires_at: NaiveDateTime,
}

impl Session {
    /// Creates an upload session. Upload sessions are never bound to a link.
    pub fn upload(
        id: SessionId,
        secret: SessionSecret,
        created_at: NaiveDateTime,
        expires_at: NaiveDateTime,
    ) -> Result<Self, ValueError> {
        if expires_at <= created_at {
            return Err(ValueError::ExpiryBeforeCreation { field: "session" });
        }

        Ok(Self {
            id,
            secret: Some(secret),
            link_id: None,
            mode: SessionMode::Upload,
            state: SessionState::Pending,
            created_at,
            expires_at,
        })
    }

    /// Creates a download session bound to the link it may verify.
    pub fn download(
        id: SessionId,
        secret: SessionSecret,
        link_id: LinkId,
        created_at: NaiveDateTime,
        expires_at: NaiveDateTime,
    ) -> Result<Self, ValueError> {
        if expires_at <= created_at {
            return Err(ValueError::ExpiryBeforeCreation { field: "session" });
        }

        Ok(Self {
            id,
            secret: Some(secret),
            link_id: Some(link_id),
            mode: SessionMode::Download,
            state: SessionState::Pending,
            created_at,
            expires_at,
        })
    }

    /// Transitions a download session into the acknowledgment stage.
    /// The secret is dropped (and thereby wiped); only the link binding
    /// and a fresh, short expiry remain.
    pub fn into_awaiting_ack(self, expires_at: NaiveDateTime) -> Self {
        Self {
            id: self.id,
            secret: None,
            link_id: self.link_id,
            mode: SessionMode::Download,
            state: SessionState::AwaitingAck,
            created_at: self.created_at,
            expires_at,
        }
    }

    /// Returns the session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the HMAC secret, if the session still holds one.
    pub fn secret(&self) -> Option<&SessionSecret> {
        self.secret.as_ref()
    }

    /// Returns the link binding of a download session.
    pub fn link_id(&self) -> Option<&LinkId> {
        self.link_id.as_ref()
    }

    /// Returns the session mode.
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Returns the session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns when the session was created.
    pub fn created_at(&self) -> NaiveDateTime {
        self.created_at
    }

    /// Returns when the session stops being valid.
    pub fn expires_at(&self) -> NaiveDateTime {
        self.expires_at
    }

    /// Reports whether the session has expired at the given instant.
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expires_at <= now
    }
}

/// A `DownloadLimit` is the per-link attempt budget. It is created when an
/// upload finalizes, mutated only by the verify step and deleted on burn
/// or by the expiry sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DownloadLimit {
    link_id: LinkId,
    remaining_attempts: u16,
    expiry_date: NaiveDateTime,
    last_attempt_at: Option<NaiveDateTime>,
}

impl DownloadLimit {
    /// Creates a fresh budget for a link.
    pub fn new(link_id: LinkId, remaining_attempts: u16, expiry_date: NaiveDateTime) -> Self {
        Self {
            link_id,
            remaining_attempts,
            expiry_date,
            last_attempt_at: None,
        }
    }

    /// Returns the link this budget belongs to.
    pub fn link_id(&self) -> &LinkId {
        &self.link_id
    }

    /// Returns the number of attempts left.
    pub fn remaining_attempts(&self) -> u16 {
        self.remaining_attempts
    }

    /// Returns when the budget (and its link) expires.
    pub fn expiry_date(&self) -> NaiveDateTime {
        self.expiry_date
    }

    /// Returns when the last attempt was counted, if any.
    pub fn last_attempt_at(&self) -> Option<NaiveDateTime> {
        self.last_attempt_at
    }

    /// Reports whether the budget has expired at the given instant.
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expiry_date <= now
    }

    /// Counts one attempt: decrements the budget and stamps the attempt
    /// time. The caller must have checked that attempts remain.
    pub(crate) fn record_attempt(&mut self, now: NaiveDateTime) -> u16 {
        self.remaining_attempts -= 1;
        self.last_attempt_at = Some(now);

        self.remaining_attempts
    }
}

/// A `SecureFile` is the durable record of one uploaded exchange:
/// where the blob lives, the sealed metadata needed to hand it over,
/// and the verification gate protecting it. Generic over the gate mode.
///
/// Records are immutable once created; they are deleted on burn or by
/// the expiry sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SecureFile<G: GateMode> {
    id: FileId,
    link_id: LinkId,
    blob_path: PathReference,
    sealed_envelope: SealedBlob,
    sealed_salt: SealedBlob,
    gate_box: G::Box,
    gate_context: G::Context,
    specs: FileSpecs,
    created_at: NaiveDateTime,
    expiry_date: NaiveDateTime,
}

impl<G: GateMode> SecureFile<G> {
    /// Builds the record of a finalized upload.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: FileId,
        link_id: LinkId,
        blob_path: PathReference,
        sealed_envelope: SealedBlob,
        sealed_salt: SealedBlob,
        gate_box: G::Box,
        gate_context: G::Context,
        specs: FileSpecs,
        created_at: NaiveDateTime,
        expiry_date: NaiveDateTime,
    ) -> Result<Self, ValueError> {
        if expiry_date <= created_at {
            return Err(ValueError::ExpiryBeforeCreation {
                field: "secure file",
            });
        }

        Ok(Self {
            id,
            link_id,
            blob_path,
            sealed_envelope,
            sealed_salt,
            gate_box,
            gate_context,
            specs,
            created_at,
            expiry_date,
        })
    }

    /// Returns the file identifier.
    pub fn id(&self) -> &FileId {
        &self.id
    }

    /// Returns the link this record is published under.
    pub fn link_id(&self) -> &LinkId {
        &self.link_id
    }

    /// Returns the file store token of the blob bytes.
    pub fn blob_path(&self) -> &PathReference {
        &self.blob_path
    }

    /// Returns the sealed key envelope.
    pub fn sealed_envelope(&self) -> &SealedBlob {
        &self.sealed_envelope
    }

    /// Returns the sealed salt.
    pub fn sealed_salt(&self) -> &SealedBlob {
        &self.sealed_salt
    }

    /// Returns the gate box the access key is verified against.
    pub fn gate_box(&self) -> &G::Box {
        &self.gate_box
    }

    /// Returns the gate context handed to clients at handshake.
    pub fn gate_context(&self) -> &G::Context {
        &self.gate_context
    }

    /// Returns the sender-chosen specs.
    pub fn specs(&self) -> FileSpecs {
        self.specs
    }

    /// Returns when the record was created.
    pub fn created_at(&self) -> NaiveDateTime {
        self.created_at
    }

    /// Returns when the record expires.
    pub fn expiry_date(&self) -> NaiveDateTime {
        self.expiry_date
    }

    /// Reports whether the record has expired at the given instant.
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        self.expiry_date <= now
    }
}
