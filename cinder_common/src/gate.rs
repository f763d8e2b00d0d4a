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

use crate::proto::GateHash;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A `GateMode` is a pluggable verification scheme for an exchange.
///
/// The *gate box* is the value a client access key must match; the *gate
/// context* is the hint handed back at handshake time (e.g. the encrypted
/// quiz questions). The orchestrator stays generic over the mode; each
/// mode supplies its own constant-time check and the canonical byte
/// projections used for request authentication.
pub trait GateMode: Send + Sync + 'static {
    /// Short mode name for log lines. Never contains secrets.
    const NAME: &'static str;

    /// The value the client must match.
    type Box: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    /// The hint returned to the client at handshake time.
    type Context: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Compares the client access key against the stored gate box
    /// in constant time.
    fn verify(gate_box: &Self::Box, access_key: &[u8]) -> bool;

    /// Canonical byte projection of the gate box for HMAC serialization.
    fn box_bytes(gate_box: &Self::Box) -> Vec<u8>;

    /// Canonical byte projection of the gate context for HMAC serialization.
    fn context_bytes(context: &Self::Context) -> Vec<u8>;
}

/// Quiz mode: the sender hashes the concatenated answers and a random
/// nonce, `SHA-256(answers || quiz_nonce)`, and uploads the encrypted
/// questions as context. The receiver reproduces the digest from the
/// answers it knows.
#[derive(Clone, Copy, Debug)]
pub struct QuizGate;

impl GateMode for QuizGate {
    const NAME: &'static str = "quiz";

    type Box = GateHash;
    type Context = Vec<u8>;

    fn verify(gate_box: &Self::Box, access_key: &[u8]) -> bool {
        gate_box.ct_verify(access_key)
    }

    fn box_bytes(gate_box: &Self::Box) -> Vec<u8> {
        gate_box.as_bytes().to_vec()
    }

    fn context_bytes(context: &Self::Context) -> Vec<u8> {
        context.clone()
    }
}

/// Password mode: the gate box is a digest of the client-derived password
/// hash. There is no context to hand out; the receiver already knows the
/// password out of band.
#[derive(Clone, Copy, Debug)]
pub struct PasswordGate;

impl GateMode for PasswordGate {
    const NAME: &'static str = "password";

    type Box = GateHash;
    type Context = ();

    fn verify(gate_box: &Self::Box, access_key: &[u8]) -> bool {
        gate_box.ct_verify(access_key)
    }

    fn box_bytes(gate_box: &Self::Box) -> Vec<u8> {
        gate_box.as_bytes().to_vec()
    }

    fn context_bytes(_context: &Self::Context) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system;

    #[test]
    fn quiz_gate_matches_the_answer_digest() {
        let mut preimage = b"42|7".to_vec();
        preimage.extend_from_slice(&[0xaa, 0xbb]);
        let gate = GateHash::new(system::hash_sha256(&preimage)).unwrap();

        assert!(QuizGate::verify(&gate, &system::hash_sha256(&preimage)));

        let mut wrong = b"41|7".to_vec();
        wrong.extend_from_slice(&[0xaa, 0xbb]);
        assert!(!QuizGate::verify(&gate, &system::hash_sha256(&wrong)));
    }

    #[test]
    fn password_gate_has_empty_context() {
        assert!(PasswordGate::context_bytes(&()).is_empty());
    }
}
