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

use crate::MemoryError;

use std::fmt;
use std::sync::atomic::{self, Ordering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// A size rule a [`SafeBlob`] is validated against at construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SizeRule {
    /// Any non-zero number of bytes.
    NonEmpty,
    /// Exactly this many bytes.
    Exact(usize),
    /// Between min and max bytes, both inclusive.
    Bounded(usize, usize),
    /// A non-zero multiple of this many bytes.
    MultipleOf(usize),
}

impl SizeRule {
    fn admits(&self, len: usize) -> bool {
        match *self {
            SizeRule::NonEmpty => len > 0,
            SizeRule::Exact(n) => len == n,
            SizeRule::Bounded(min, max) => len >= min && len <= max,
            SizeRule::MultipleOf(n) => len > 0 && n > 0 && len % n == 0,
        }
    }
}

impl fmt::Display for SizeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SizeRule::NonEmpty => write!(f, "non-empty"),
            SizeRule::Exact(n) => write!(f, "exactly {} bytes", n),
            SizeRule::Bounded(min, max) => write!(f, "between {} and {} bytes", min, max),
            SizeRule::MultipleOf(n) => write!(f, "a non-zero multiple of {} bytes", n),
        }
    }
}

/// A `SafeBlob` is the sole owner of a heap buffer of secret bytes.
///
/// Construction takes the buffer by move, so no other binding can observe
/// the bytes afterwards. The buffer is wiped on [`SafeBlob::close`],
/// on drop, and when construction is rejected. Once the buffer has been
/// moved out with [`SafeBlob::resolve`] or wiped, every accessor fails
/// with [`MemoryError::AlreadyResolved`].
#[derive(Clone)]
pub struct SafeBlob {
    buf: Option<Vec<u8>>,
}

impl SafeBlob {
    /// Takes ownership of a non-empty byte buffer.
    pub fn new(bytes: Vec<u8>) -> Result<Self, MemoryError> {
        Self::new_sized(bytes, SizeRule::NonEmpty)
    }

    /// Takes ownership of a byte buffer, validating it against the passed
    /// [`SizeRule`]. A rejected buffer is wiped before the error is returned.
    pub fn new_sized(mut bytes: Vec<u8>, rule: SizeRule) -> Result<Self, MemoryError> {
        if !rule.admits(bytes.len()) {
            let actual = bytes.len();
            bytes.zeroize();
            return Err(MemoryError::InvalidSize { rule, actual });
        }

        Ok(Self { buf: Some(bytes) })
    }

    /// Returns a borrowed view of the bytes.
    pub fn bytes(&self) -> Result<&[u8], MemoryError> {
        self.buf.as_deref().ok_or(MemoryError::AlreadyResolved)
    }

    /// Returns the buffer length.
    pub fn len(&self) -> Result<usize, MemoryError> {
        Ok(self.bytes()?.len())
    }

    /// Reports whether the buffer has been resolved or closed.
    pub fn is_resolved(&self) -> bool {
        self.buf.is_none()
    }

    /// Encodes the bytes into a freshly allocated [`SafeString`].
    /// Ownership of the blob is preserved.
    pub fn to_base64(&self) -> Result<SafeString, MemoryError> {
        SafeString::new(STANDARD.encode(self.bytes()?))
    }

    /// Transfers the buffer out of the blob. Every later access fails
    /// with [`MemoryError::AlreadyResolved`]. The caller takes over
    /// the responsibility of wiping the returned bytes.
    pub fn resolve(&mut self) -> Result<Vec<u8>, MemoryError> {
        self.buf.take().ok_or(MemoryError::AlreadyResolved)
    }

    /// Wipes the buffer and marks the blob resolved. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.zeroize();
        }
    }

    /// Timing-safe equality of two blobs.
    ///
    /// Fails with [`MemoryError::InvalidSize`] when either side is empty
    /// or the lengths differ, so the comparison itself never runs over
    /// empty or unequal-length input.
    pub fn ct_eq(a: &SafeBlob, b: &SafeBlob) -> Result<bool, MemoryError> {
        let (a, b) = (a.bytes()?, b.bytes()?);

        if a.is_empty() || b.is_empty() {
            return Err(MemoryError::InvalidSize {
                rule: SizeRule::NonEmpty,
                actual: 0,
            });
        }
        if a.len() != b.len() {
            return Err(MemoryError::InvalidSize {
                rule: SizeRule::Exact(a.len()),
                actual: b.len(),
            });
        }

        Ok(bool::from(a.ct_eq(b)))
    }
}

impl Drop for SafeBlob {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SafeBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.buf {
            Some(buf) => write!(f, "SafeBlob({} bytes)", buf.len()),
            None => write!(f, "SafeBlob(resolved)"),
        }
    }
}

/// A `SafeString` is the sole owner of secret character data.
///
/// Same lifecycle as [`SafeBlob`], except that the wipe fills the buffer
/// with the `'x'` sentinel rather than zero.
#[derive(Clone)]
pub struct SafeString {
    buf: Option<String>,
}

impl SafeString {
    /// Takes ownership of a non-empty string.
    pub fn new(s: String) -> Result<Self, MemoryError> {
        if s.is_empty() {
            return Err(MemoryError::InvalidSize {
                rule: SizeRule::NonEmpty,
                actual: 0,
            });
        }

        Ok(Self { buf: Some(s) })
    }

    /// Returns a borrowed view of the characters.
    pub fn str(&self) -> Result<&str, MemoryError> {
        self.buf.as_deref().ok_or(MemoryError::AlreadyResolved)
    }

    /// Reports whether the string has been resolved or closed.
    pub fn is_resolved(&self) -> bool {
        self.buf.is_none()
    }

    /// Transfers the string out. Every later access fails
    /// with [`MemoryError::AlreadyResolved`].
    pub fn resolve(&mut self) -> Result<String, MemoryError> {
        self.buf.take().ok_or(MemoryError::AlreadyResolved)
    }

    /// Overwrites the characters with the `'x'` sentinel
    /// and marks the string resolved. Idempotent.
    pub fn close(&mut self) {
        if let Some(s) = self.buf.take() {
            let mut bytes = s.into_bytes();
            bytes.iter_mut().for_each(|b| *b = b'x');
            // Keep the sentinel store from being elided as dead.
            atomic::compiler_fence(Ordering::SeqCst);
        }
    }
}

impl Drop for SafeString {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SafeString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.buf {
            Some(buf) => write!(f, "SafeString({} bytes)", buf.len()),
            None => write!(f, "SafeString(resolved)"),
        }
    }
}
