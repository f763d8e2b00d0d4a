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

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

/// Provides a `Vec<u8>` of `n` random bytes. Uses the thread-local generator
/// of the `rand` crate.
pub fn random_bytes(n: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Standard)
        .take(n)
        .collect()
}

/// Performs an HMAC-SHA512 hash computation.
pub fn hash_hmac(secret: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac: Hmac<Sha512> =
        Hmac::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(data);
    let hmac = mac.finalize();

    hmac.into_bytes().to_vec()
}

/// Recomputes the HMAC-SHA512 of the data and compares it to the expected
/// value in constant time. A mismatch returns `false`, never an error.
pub fn verify_hmac(secret: &[u8], data: &[u8], expected: &[u8]) -> bool {
    bool::from(hash_hmac(secret, data).ct_eq(expected))
}

/// Performs a SHA-256 hash computation, the gate hash function of quiz mode.
pub fn hash_sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}
