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

use crate::memory::SizeRule;

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An `IdParseError` indicates a failure parsing a typed identifier.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum IdParseError {
    /// The identifier is shorter than a type prefix.
    #[error("Identifier is shorter than a type prefix")]
    Truncated,
    /// The leading two characters are not a known type prefix.
    #[error("Unknown identifier prefix \"{0}\"")]
    UnknownPrefix(String),
    /// The identifier carries a known prefix of the wrong type.
    #[error("Expected a {expected} identifier, got prefix \"{actual}\"")]
    UnexpectedPrefix {
        /// The prefix code required by the parsing type.
        expected: &'static str,
        /// The prefix code actually found.
        actual: String,
    },
    /// The identifier has a prefix but no body.
    #[error("Identifier is missing a body")]
    MissingBody,
}

/// A `MemoryError` indicates misuse of a safe memory buffer.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum MemoryError {
    /// The buffer length violates the size rule it was constructed under.
    #[error("Buffer of {actual} bytes violates size rule: {rule}")]
    InvalidSize {
        /// The rule that was violated.
        rule: SizeRule,
        /// The offending buffer length.
        actual: usize,
    },
    /// The buffer has been resolved or closed and can no longer be read.
    #[error("Buffer has already been resolved")]
    AlreadyResolved,
}

/// A `ValueError` indicates a malformed domain value object.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ValueError {
    /// A fixed-size field has the wrong length.
    #[error("{field} must be exactly {expected} bytes, got {actual}")]
    FixedSize {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A bounded-size field is out of bounds.
    #[error("{field} must be between {min} and {max} bytes, got {actual}")]
    BoundedSize {
        field: &'static str,
        min: usize,
        max: usize,
        actual: usize,
    },
    /// A field that must be a SHA-256 or SHA-512 digest has a different length.
    #[error("{field} must be a SHA-256 or SHA-512 digest, got {actual} bytes")]
    DigestSize { field: &'static str, actual: usize },
    /// A numeric field is out of range.
    #[error("{field} must be between {min} and {max}, got {actual}")]
    Range {
        field: &'static str,
        min: u64,
        max: u64,
        actual: u64,
    },
    /// A serialized structure ends before all of its fields.
    #[error("{field} is truncated: need at least {min} bytes, got {actual}")]
    Truncated {
        field: &'static str,
        min: usize,
        actual: usize,
    },
    /// An expiry timestamp does not lie after the creation timestamp.
    #[error("{field} expiry must be after creation")]
    ExpiryBeforeCreation { field: &'static str },
}

/// A `VaultError` indicates a pepper vault configuration or AEAD failure.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The configuration names no peppers at all.
    #[error("No peppers are configured")]
    NoPeppers,
    /// The configuration names the same pepper version twice.
    #[error("Pepper version {0} is configured twice")]
    DuplicatePepper(i16),
    /// The active version does not appear in the configured map.
    #[error("Active pepper version {0} is not configured")]
    NoActivePepper(i16),
    /// A configured pepper is not exactly 64 hex characters.
    #[error("Pepper version {0} is not a 64 character hex string")]
    MalformedPepper(i16),

    /// The active pepper has been resolved or wiped and cannot seal.
    #[error("Active pepper is no longer available")]
    PepperUnavailable,
    /// A sealed blob references a version this vault does not hold.
    #[error("Unknown pepper version {0}")]
    UnknownPepperVersion(i16),
    /// The referenced pepper exists but has been wiped.
    #[error("Pepper version {0} has been wiped")]
    PepperWiped(i16),

    /// The encryption or decryption of a sealed blob failed.
    /// For decryption this includes authentication tag mismatches.
    #[error("Encryption or decryption failure")]
    Aead(#[from] aes_gcm::Error),

    /// A safe memory buffer was misused while handling a pepper.
    #[error("Pepper memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// A `ConfigError` indicates a failure loading or storing the node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file already exists on this node.
    #[error("Node is already initialized")]
    Exists,
    /// No configuration file exists on this node.
    #[error("Node is not initialized")]
    Uninit,
    /// The permissions on the configuration file are insecure.
    #[error("Insecure config permissions (limit access to root user!)")]
    InsecurePerms,

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A `toml::ser::Error` TOML serialization error occured.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// A `toml::de::Error` TOML deserialization error occured.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// A `FlowError` indicates a failure in an exchange use case
/// or one of the stores it composes.
#[derive(Debug, Error)]
pub enum FlowError {
    /// No exchange record exists for the link.
    #[error("Unknown link")]
    LinkNotFound,
    /// The link exists but its lifetime has passed.
    #[error("Link has expired")]
    LinkExpired,
    /// The blob bytes for a link are gone from the file store.
    #[error("Stored file is missing")]
    FileNotFound,
    /// The session is unknown, expired, consumed or of the wrong kind.
    #[error("Invalid session")]
    InvalidSession,
    /// The request timestamp lies outside the accepted clock skew window.
    #[error("Request timestamp is outside the skew window")]
    StaleRequest,
    /// The request HMAC does not verify under the session secret.
    #[error("Request authentication failed")]
    HmacVerificationFailed,
    /// The supplied access key does not open the verification gate.
    #[error("Access verification failed")]
    AccessVerificationFailed,
    /// The download limit has no attempts left.
    #[error("Maximum download attempts exceeded")]
    MaxAttemptsExceeded,

    /// A malformed domain value was supplied.
    #[error("Invalid input: {0}")]
    Value(#[from] ValueError),
    /// An identifier failed to parse.
    #[error("Invalid identifier: {0}")]
    Id(#[from] IdParseError),
    /// A safe memory buffer was misused.
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
    /// Sealing or unsealing metadata failed.
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    /// A storage backend I/O failure.
    #[error("File storage error: {0}")]
    Storage(#[from] io::Error),
    /// A bincode (de)serialization error on a persisted record.
    #[error("Record (de)serialization error: {0}")]
    Record(#[from] Box<bincode::ErrorKind>),

    /// An internal invariant does not hold.
    #[error("Internal invariant violation: {0}")]
    Internal(&'static str),
}

/// A `PublicError` is the error shape exposed to clients.
///
/// Cryptographic and session failures all collapse to [`PublicError::AccessDenied`]
/// so that clients cannot distinguish a wrong access key from a bad HMAC,
/// a consumed session or a stale timestamp. Details stay in server logs.
#[derive(Clone, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
pub enum PublicError {
    /// The request is structurally invalid. Reported verbatim.
    #[error("Malformed request: {0}")]
    BadRequest(String),
    /// No exchange exists for the link.
    #[error("Unknown link")]
    NotFound,
    /// The link has expired.
    #[error("Link has expired")]
    Expired,
    /// All download attempts have been used up.
    #[error("Download attempts exhausted")]
    AttemptsExhausted,
    /// Access is denied. Covers authentication, gate and session failures.
    #[error("Access denied")]
    AccessDenied,
    /// The server cannot complete the request right now.
    #[error("Service temporarily unavailable")]
    Unavailable,
}

impl From<&FlowError> for PublicError {
    fn from(e: &FlowError) -> Self {
        match e {
            FlowError::LinkNotFound => PublicError::NotFound,
            FlowError::LinkExpired => PublicError::Expired,
            FlowError::MaxAttemptsExceeded => PublicError::AttemptsExhausted,
            FlowError::InvalidSession
            | FlowError::StaleRequest
            | FlowError::HmacVerificationFailed
            | FlowError::AccessVerificationFailed => PublicError::AccessDenied,
            FlowError::Value(e) => PublicError::BadRequest(e.to_string()),
            FlowError::Id(e) => PublicError::BadRequest(e.to_string()),
            // Unseal failures on tampered or rotated-away records must stay
            // indistinguishable from access failures at the boundary.
            FlowError::Vault(_) | FlowError::Memory(_) => PublicError::AccessDenied,
            FlowError::FileNotFound
            | FlowError::Storage(_)
            | FlowError::Record(_)
            | FlowError::Internal(_) => PublicError::Unavailable,
        }
    }
}
