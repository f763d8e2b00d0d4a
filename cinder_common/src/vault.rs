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

use crate::memory::{SafeBlob, SizeRule};
use crate::proto::{SealedBlob, NONCE_LEN};
use crate::system;
use crate::VaultError;

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use zeroize::Zeroize;

/// The length of a decoded pepper in bytes (AES-256 key).
pub const PEPPER_LEN: usize = 32;
/// The length of a configured pepper in hex characters.
pub const PEPPER_HEX_LEN: usize = 64;

/// A `PepperVault` holds the versioned server-side master keys that wrap
/// small pieces of per-file metadata at rest.
///
/// It is initialized once at startup from configuration and shared
/// read-only for the process lifetime. A sealed blob carries the version
/// it was sealed under, so records written before a rotation stay
/// readable while new writes use the active version.
pub struct PepperVault {
    peppers: HashMap<i16, SafeBlob>,
    active: i16,
}

impl PepperVault {
    /// Builds the vault from configured hex peppers and an active version.
    ///
    /// Every hex string is validated (exactly [`PEPPER_HEX_LEN`] hex
    /// characters, either case), decoded into a [`SafeBlob`] and wiped at
    /// the source, so after construction the key material exists nowhere
    /// but inside the vault.
    pub fn new(mut pepper_hex: HashMap<i16, String>, active: i16) -> Result<Self, VaultError> {
        if pepper_hex.is_empty() {
            return Err(VaultError::NoPeppers);
        }

        let mut peppers = HashMap::with_capacity(pepper_hex.len());
        for (version, hex_str) in pepper_hex.drain() {
            let key = decode_pepper(version, &hex_str)?;

            let mut spent = hex_str.into_bytes();
            spent.zeroize();

            peppers.insert(
                version,
                SafeBlob::new_sized(key, SizeRule::Exact(PEPPER_LEN))?,
            );
        }

        if !peppers.contains_key(&active) {
            return Err(VaultError::NoActivePepper(active));
        }

        Ok(Self { peppers, active })
    }

    /// Returns the version new seals are produced under.
    pub fn active_version(&self) -> i16 {
        self.active
    }

    /// Returns all held versions in ascending order.
    pub fn versions(&self) -> Vec<i16> {
        let mut versions: Vec<i16> = self.peppers.keys().copied().collect();
        versions.sort_unstable();

        versions
    }

    /// Reports whether a staged successor of the active version exists.
    /// Operators are expected to stage `active + 1` ahead of a rotation;
    /// its absence is worth a warning but not a failure.
    pub fn has_successor(&self) -> bool {
        self.peppers.contains_key(&(self.active + 1))
    }

    /// Seals data under the active pepper with a fresh random nonce.
    pub fn seal(&self, data: &[u8]) -> Result<SealedBlob, VaultError> {
        let pepper = self
            .peppers
            .get(&self.active)
            .ok_or(VaultError::PepperUnavailable)?;
        let key = pepper.bytes().map_err(|_| VaultError::PepperUnavailable)?;

        let mut nonce = [0; NONCE_LEN];
        nonce.copy_from_slice(&system::random_bytes(NONCE_LEN));

        // The cipher state is rebuilt per call, so a failure leaves
        // nothing to reset.
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let ciphertext = cipher.encrypt(Nonce::from_slice(&nonce), data)?;

        Ok(SealedBlob::new(self.active, nonce, ciphertext))
    }

    /// Unseals a blob under the pepper version it names. The GCM tag is
    /// the integrity check; any tampering fails the AEAD.
    pub fn unseal(&self, sealed: &SealedBlob) -> Result<Vec<u8>, VaultError> {
        let version = sealed.pepper_version();
        let pepper = self
            .peppers
            .get(&version)
            .ok_or(VaultError::UnknownPepperVersion(version))?;
        let key = pepper.bytes().map_err(|_| VaultError::PepperWiped(version))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let plaintext = cipher.decrypt(Nonce::from_slice(sealed.nonce()), sealed.ciphertext())?;

        Ok(plaintext)
    }

    /// Wipes every pepper and empties the vault. Called on shutdown after
    /// in-flight work has drained; dropping the vault wipes as well.
    pub fn wipe(&mut self) {
        for pepper in self.peppers.values_mut() {
            pepper.close();
        }

        self.peppers.clear();
    }
}

fn decode_pepper(version: i16, hex_str: &str) -> Result<Vec<u8>, VaultError> {
    if hex_str.len() != PEPPER_HEX_LEN || !hex_str.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(VaultError::MalformedPepper(version));
    }

    hex::decode(hex_str).map_err(|_| VaultError::MalformedPepper(version))
}
