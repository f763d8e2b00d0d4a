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
use crate::id::{LinkId, SessionId};
use crate::proto::{Envelope, FileSpecs, Hmac, Salt};
use crate::PublicError;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Appends one canonical field: its length as a 4-byte big-endian
/// unsigned integer, then the bytes themselves.
fn put_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn timestamp_bytes(timestamp: NaiveDateTime) -> [u8; 8] {
    timestamp.and_utc().timestamp().to_be_bytes()
}

/// An authenticated upload request, sent against an upload session.
///
/// The `hmac` covers the canonical serialization of every other field;
/// see [`UploadRequest::canonical_bytes`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct UploadRequest<G: GateMode> {
    /// The upload session this request spends.
    pub session_id: SessionId,
    /// The client-encrypted file bytes.
    pub payload: Vec<u8>,
    /// The client-sealed key envelope.
    pub envelope: Envelope,
    /// The key derivation salt.
    pub salt: Salt,
    /// The value download attempts are verified against.
    pub gate_box: G::Box,
    /// The hint handed to downloaders at handshake time.
    pub gate_context: G::Context,
    /// Lifetime and attempt budget of the exchange.
    pub specs: FileSpecs,
    /// Client timestamp, checked against the skew window.
    pub timestamp: NaiveDateTime,
    /// HMAC-SHA512 of the canonical serialization under the session secret.
    pub hmac: Hmac,
}

impl<G: GateMode> UploadRequest<G> {
    /// The canonical serialization covered by the HMAC: every field except
    /// the HMAC itself, in fixed order (session id, payload, envelope,
    /// salt, gate box, gate context, specs, timestamp), each prefixed
    /// with its length as a 4-byte big-endian unsigned integer.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.payload.len());

        put_field(&mut buf, self.session_id.to_string().as_bytes());
        put_field(&mut buf, &self.payload);
        put_field(&mut buf, self.envelope.as_bytes());
        put_field(&mut buf, self.salt.as_bytes());
        put_field(&mut buf, &G::box_bytes(&self.gate_box));
        put_field(&mut buf, &G::context_bytes(&self.gate_context));

        let mut specs = Vec::with_capacity(6);
        specs.extend_from_slice(&self.specs.expiry_seconds().to_be_bytes());
        specs.extend_from_slice(&self.specs.max_attempts().to_be_bytes());
        put_field(&mut buf, &specs);

        put_field(&mut buf, &timestamp_bytes(self.timestamp));

        buf
    }
}

/// An authenticated verify request, sent against a download session.
#[derive(Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// The download session this request spends.
    pub session_id: SessionId,
    /// The client-derived access key to hold against the gate box.
    pub access_key: Vec<u8>,
    /// Client timestamp, checked against the skew window.
    pub timestamp: NaiveDateTime,
    /// HMAC-SHA512 of the canonical serialization under the session secret.
    pub hmac: Hmac,
}

impl VerifyRequest {
    /// The canonical serialization covered by the HMAC: session id,
    /// access key and timestamp, each length-prefixed.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.access_key.len());

        put_field(&mut buf, self.session_id.to_string().as_bytes());
        put_field(&mut buf, &self.access_key);
        put_field(&mut buf, &timestamp_bytes(self.timestamp));

        buf
    }
}

/// The response to an init-upload handshake: a fresh session and the
/// secret the client must authenticate its upload with.
#[derive(Clone, Serialize, Deserialize)]
pub struct UploadHandshake {
    /// The upload session identifier.
    pub session_id: SessionId,
    /// The session secret (HMAC key) for the follow-up upload request.
    pub secret: Vec<u8>,
}

/// The response to a finalized upload.
#[derive(Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// The sharable link the exchange is published under.
    pub link_id: LinkId,
    /// When the exchange expires.
    pub expiry_date: NaiveDateTime,
}

/// The response to an init-download handshake.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DownloadHandshake<G: GateMode> {
    /// The download session identifier.
    pub session_id: SessionId,
    /// The session secret (HMAC key) for the follow-up verify request.
    pub secret: Vec<u8>,
    /// The gate hint, e.g. the encrypted quiz questions.
    pub gate_context: G::Context,
}

/// The delivered exchange: blob plus unsealed metadata.
#[derive(Clone, Serialize, Deserialize)]
pub struct DownloadPayload {
    /// The client-encrypted file bytes, unchanged from upload.
    pub payload: Vec<u8>,
    /// The key envelope, unsealed from rest but still client-sealed.
    pub envelope: Vec<u8>,
    /// The key derivation salt.
    pub salt: Vec<u8>,
}

/// A network message sent by a client to `cinderd`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum ClientMessage<G: GateMode> {
    /// Open an upload session.
    InitUpload,
    /// Spend an upload session on an exchange.
    Upload(UploadRequest<G>),
    /// Open a download session for a link.
    InitDownload(LinkId),
    /// Prove gate knowledge and collect the exchange.
    Verify(VerifyRequest),
    /// Confirm receipt, burning the exchange.
    Acknowledge(SessionId),
}

/// A network message sent by `cinderd` to a client.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum ServerMessage<G: GateMode> {
    /// Response to [`ClientMessage::InitUpload`].
    UploadSession(Result<UploadHandshake, PublicError>),
    /// Response to [`ClientMessage::Upload`].
    UploadReceipt(Result<UploadReceipt, PublicError>),
    /// Response to [`ClientMessage::InitDownload`].
    DownloadSession(Result<DownloadHandshake<G>, PublicError>),
    /// Response to [`ClientMessage::Verify`].
    Payload(Result<DownloadPayload, PublicError>),
    /// Response to [`ClientMessage::Acknowledge`].
    Acknowledged(Result<(), PublicError>),
    /// Protocol error independent of the operation context.
    Error(PublicError),
}
