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

use crate::config::NodeConfig;
use crate::gate::GateMode;
use crate::id::{FileId, LinkId, SessionId};
use crate::message::{
    DownloadHandshake, DownloadPayload, UploadHandshake, UploadReceipt, UploadRequest,
    VerifyRequest,
};
use crate::proto::{
    DownloadLimit, PathReference, SecureFile, Session, SessionMode, SessionSecret, SessionState,
    SECRET_LEN,
};
use crate::store::{Clock, DownloadLimitStore, FileStore, SecureFileRepository, SessionCache};
use crate::system;
use crate::vault::PepperVault;
use crate::{FlowError, ValueError};

use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};

/// The timing and size limits an [`Exchange`] enforces.
#[derive(Clone, Copy, Debug)]
pub struct FlowPolicy {
    /// How long an upload or download session stays valid.
    pub session_timeout: Duration,
    /// How long a delivered download may take to acknowledge.
    pub ack_timeout: Duration,
    /// The accepted clock skew of request timestamps, in both directions.
    pub clock_skew: Duration,
    /// The largest accepted encrypted blob, in bytes.
    pub max_blob_bytes: u64,
}

impl FlowPolicy {
    /// Derives the policy from a node configuration.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            session_timeout: Duration::seconds(config.session_timeout_secs as i64),
            ack_timeout: Duration::seconds(config.ack_timeout_secs as i64),
            clock_skew: Duration::seconds(config.clock_skew_secs as i64),
            max_blob_bytes: config.max_blob_bytes,
        }
    }
}

/// An `Exchange` orchestrates the upload/verify/download/burn lifecycle,
/// composing the pepper vault, the session cache, the download limits,
/// the record repository and the blob store. Generic over the gate mode.
///
/// Per link the lifecycle is `NEW → AWAITING_ACK → BURNED`, with the
/// alternate sinks `EXPIRED` (cleanup sweep) and `EXHAUSTED` (attempt
/// budget spent). Burn policy is split mode: a successful verify leaves
/// a short-lived acknowledgment session behind and the burn happens on
/// acknowledge, on exhaustion, or in the sweep.
pub struct Exchange<G: GateMode> {
    vault: Arc<PepperVault>,
    sessions: Arc<dyn SessionCache>,
    limits: Arc<dyn DownloadLimitStore>,
    repo: Arc<dyn SecureFileRepository<G>>,
    blobs: Arc<dyn FileStore>,
    clock: Arc<dyn Clock>,
    policy: FlowPolicy,
}

impl<G: GateMode> Exchange<G> {
    /// Wires an orchestrator from its collaborators.
    pub fn new(
        vault: Arc<PepperVault>,
        sessions: Arc<dyn SessionCache>,
        limits: Arc<dyn DownloadLimitStore>,
        repo: Arc<dyn SecureFileRepository<G>>,
        blobs: Arc<dyn FileStore>,
        clock: Arc<dyn Clock>,
        policy: FlowPolicy,
    ) -> Self {
        Self {
            vault,
            sessions,
            limits,
            repo,
            blobs,
            clock,
            policy,
        }
    }

    /// Opens an upload session, returning its identifier and the secret
    /// the follow-up upload request must be authenticated with.
    pub fn init_upload(&self) -> Result<UploadHandshake, FlowError> {
        let now = self.clock.now();

        let session_id = SessionId::generate();
        let secret = system::random_bytes(SECRET_LEN);

        let session = Session::upload(
            session_id.clone(),
            SessionSecret::new(secret.clone())?,
            now,
            now + self.policy.session_timeout,
        )?;
        self.sessions.save(session)?;

        Ok(UploadHandshake { session_id, secret })
    }

    /// Spends an upload session on a new exchange.
    ///
    /// Verifies the request HMAC and timestamp, stores the blob, seals
    /// envelope and salt, persists the record, creates the download
    /// limit and deletes the session. A failure after the blob write
    /// deletes the stored bytes again (best effort).
    pub fn upload(&self, request: &UploadRequest<G>) -> Result<UploadReceipt, FlowError> {
        let now = self.clock.now();

        let session = self
            .sessions
            .get(&request.session_id)?
            .ok_or(FlowError::InvalidSession)?;
        if session.mode() != SessionMode::Upload {
            return Err(FlowError::InvalidSession);
        }

        let secret = session.secret().ok_or(FlowError::InvalidSession)?;
        if !system::verify_hmac(
            secret.bytes()?,
            &request.canonical_bytes(),
            request.hmac.as_bytes(),
        ) {
            return Err(FlowError::HmacVerificationFailed);
        }

        self.check_freshness(now, request.timestamp)?;

        if request.payload.is_empty() || request.payload.len() as u64 > self.policy.max_blob_bytes
        {
            return Err(ValueError::BoundedSize {
                field: "payload",
                min: 1,
                max: self.policy.max_blob_bytes as usize,
                actual: request.payload.len(),
            }
            .into());
        }

        let blob_path = self.blobs.store(&request.payload)?;

        match self.finish_upload(now, &blob_path, request) {
            Ok(receipt) => {
                self.sessions.delete(&request.session_id)?;
                Ok(receipt)
            }
            Err(e) => {
                // Compensate the blob write so a failed upload leaves
                // no orphaned bytes behind.
                let _ = self.blobs.delete(&blob_path);
                Err(e)
            }
        }
    }

    fn finish_upload(
        &self,
        now: NaiveDateTime,
        blob_path: &PathReference,
        request: &UploadRequest<G>,
    ) -> Result<UploadReceipt, FlowError> {
        let sealed_envelope = self.vault.seal(request.envelope.as_bytes())?;
        let sealed_salt = self.vault.seal(request.salt.as_bytes())?;

        let link_id = LinkId::generate();
        let expiry_date = now + Duration::seconds(request.specs.expiry_seconds() as i64);

        let file = SecureFile::new(
            FileId::generate(),
            link_id.clone(),
            blob_path.clone(),
            sealed_envelope,
            sealed_salt,
            request.gate_box.clone(),
            request.gate_context.clone(),
            request.specs,
            now,
            expiry_date,
        )?;

        self.repo.save(&file)?;
        self.limits.create(DownloadLimit::new(
            link_id.clone(),
            request.specs.max_attempts(),
            expiry_date,
        ))?;

        Ok(UploadReceipt {
            link_id,
            expiry_date,
        })
    }

    /// Opens a download session for a link, returning the session secret
    /// and the gate context (e.g. the encrypted quiz questions).
    pub fn init_download(&self, link_id: &LinkId) -> Result<DownloadHandshake<G>, FlowError> {
        let now = self.clock.now();

        let file = self
            .repo
            .find_by_link_id(link_id)?
            .ok_or(FlowError::LinkNotFound)?;
        if file.is_expired(now) {
            return Err(FlowError::LinkExpired);
        }

        let session_id = SessionId::generate();
        let secret = system::random_bytes(SECRET_LEN);

        let session = Session::download(
            session_id.clone(),
            SessionSecret::new(secret.clone())?,
            link_id.clone(),
            now,
            now + self.policy.session_timeout,
        )?;
        self.sessions.save(session)?;

        Ok(DownloadHandshake {
            session_id,
            secret,
            gate_context: file.gate_context().clone(),
        })
    }

    /// Proves gate knowledge and collects the exchange.
    ///
    /// The session is taken atomically, so a given session admits at most
    /// one verify. Attempt counting, the constant-time gate check and the
    /// delivery claim happen in one atomic limit-store step; a failing
    /// gate leaves the counted attempt standing, and a passing one
    /// retires the budget so no second verify can deliver the same link.
    /// On success the session is re-inserted awaiting the burn
    /// acknowledgment.
    pub fn verify_download(&self, request: &VerifyRequest) -> Result<DownloadPayload, FlowError> {
        let now = self.clock.now();

        let session = self
            .sessions
            .take(&request.session_id)?
            .ok_or(FlowError::InvalidSession)?;
        if session.mode() != SessionMode::Download || session.state() != SessionState::Pending {
            return Err(FlowError::InvalidSession);
        }

        let secret = session.secret().ok_or(FlowError::InvalidSession)?;
        if !system::verify_hmac(
            secret.bytes()?,
            &request.canonical_bytes(),
            request.hmac.as_bytes(),
        ) {
            return Err(FlowError::HmacVerificationFailed);
        }

        self.check_freshness(now, request.timestamp)?;

        let link_id = session
            .link_id()
            .cloned()
            .ok_or(FlowError::Internal("download session without link"))?;
        let file = self
            .repo
            .find_by_link_id(&link_id)?
            .ok_or(FlowError::LinkNotFound)?;

        match self
            .limits
            .attempt_delivery(&link_id, &|| G::verify(file.gate_box(), &request.access_key))
        {
            Ok(()) => {}
            Err(e @ FlowError::MaxAttemptsExceeded) => {
                // The budget was spent entirely on failed attempts;
                // this link is done for.
                let _ = self.burn_link(&link_id);
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let envelope = self.vault.unseal(file.sealed_envelope())?;
        let salt = self.vault.unseal(file.sealed_salt())?;
        let payload = self.blobs.load(file.blob_path())?;

        self.sessions
            .save(session.into_awaiting_ack(now + self.policy.ack_timeout))?;

        Ok(DownloadPayload {
            payload,
            envelope,
            salt,
        })
    }

    /// Confirms receipt of a delivered exchange and burns it: the record,
    /// the blob bytes, the limit and the session all go away.
    pub fn acknowledge(&self, session_id: &SessionId) -> Result<(), FlowError> {
        let session = self
            .sessions
            .take(session_id)?
            .ok_or(FlowError::InvalidSession)?;
        if session.state() != SessionState::AwaitingAck {
            return Err(FlowError::InvalidSession);
        }

        let link_id = session
            .link_id()
            .cloned()
            .ok_or(FlowError::Internal("acknowledging session without link"))?;

        if !self.burn_link(&link_id)? {
            return Err(FlowError::LinkNotFound);
        }

        Ok(())
    }

    /// Sweeps every expired exchange, burning each one. Idempotent;
    /// returns how many exchanges were burned.
    pub fn cleanup_expired(&self) -> Result<usize, FlowError> {
        let now = self.clock.now();

        let mut count = 0;
        for file in self.repo.find_expired_before(now)? {
            // The record delete is the mutating step; a record another
            // sweep or burn got to first is simply skipped.
            if self.repo.delete_by_link_id(file.link_id())? {
                let _ = self.blobs.delete(file.blob_path());
                let _ = self.limits.delete(file.link_id());
                count += 1;
            }
        }

        self.sessions.evict_expired()?;

        Ok(count)
    }

    /// Deletes record, blob bytes and limit of a link, in that order.
    /// Only the record delete is load-bearing; the rest is best effort
    /// and tolerated to be already gone.
    fn burn_link(&self, link_id: &LinkId) -> Result<bool, FlowError> {
        let file = self.repo.find_by_link_id(link_id)?;
        let existed = self.repo.delete_by_link_id(link_id)?;

        if let Some(file) = &file {
            let _ = self.blobs.delete(file.blob_path());
        }
        let _ = self.limits.delete(link_id);

        Ok(existed)
    }

    fn check_freshness(
        &self,
        now: NaiveDateTime,
        timestamp: NaiveDateTime,
    ) -> Result<(), FlowError> {
        let skew = if now >= timestamp {
            now - timestamp
        } else {
            timestamp - now
        };

        if skew > self.policy.clock_skew {
            return Err(FlowError::StaleRequest);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::QuizGate;
    use crate::proto::{Envelope, FileSpecs, GateHash, Hmac, Salt, HMAC_LEN};
    use crate::store::{
        FsFileRepository, FsFileStore, ManualClock, MemoryLimitStore, MemorySessionCache,
    };
    use crate::vault::PEPPER_LEN;
    use crate::{PublicError, VaultError};

    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    struct Stores {
        sessions: Arc<MemorySessionCache>,
        limits: Arc<MemoryLimitStore>,
        repo: Arc<FsFileRepository<QuizGate>>,
        blobs: Arc<FsFileStore>,
    }

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            chrono::DateTime::from_timestamp(1_700_000_000, 0)
                .unwrap()
                .naive_utc(),
        ))
    }

    fn stores(dir: &Path, clock: Arc<ManualClock>) -> Stores {
        Stores {
            sessions: Arc::new(MemorySessionCache::new(clock.clone())),
            limits: Arc::new(MemoryLimitStore::new(clock)),
            repo: Arc::new(FsFileRepository::new(dir.join("records")).unwrap()),
            blobs: Arc::new(FsFileStore::new(dir.join("blobs")).unwrap()),
        }
    }

    fn vault_with(versions: &[(i16, u8)], active: i16) -> Arc<PepperVault> {
        let peppers: HashMap<i16, String> = versions
            .iter()
            .map(|&(version, fill)| (version, hex::encode([fill; PEPPER_LEN])))
            .collect();

        Arc::new(PepperVault::new(peppers, active).unwrap())
    }

    fn policy() -> FlowPolicy {
        FlowPolicy {
            session_timeout: Duration::seconds(300),
            ack_timeout: Duration::seconds(30),
            clock_skew: Duration::seconds(60),
            max_blob_bytes: 16 * 1024 * 1024,
        }
    }

    fn engine_with(
        vault: Arc<PepperVault>,
        stores: &Stores,
        clock: Arc<ManualClock>,
    ) -> Exchange<QuizGate> {
        Exchange::new(
            vault,
            stores.sessions.clone(),
            stores.limits.clone(),
            stores.repo.clone(),
            stores.blobs.clone(),
            clock,
            policy(),
        )
    }

    struct Harness {
        clock: Arc<ManualClock>,
        stores: Stores,
        engine: Exchange<QuizGate>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let stores = stores(dir.path(), clock.clone());
        let engine = engine_with(vault_with(&[(1, 0x11)], 1), &stores, clock.clone());

        Harness {
            clock,
            stores,
            engine,
            _dir: dir,
        }
    }

    const QUIZ_NONCE: [u8; 2] = [0xaa, 0xbb];

    fn quiz_key(answers: &[u8]) -> Vec<u8> {
        let mut preimage = answers.to_vec();
        preimage.extend_from_slice(&QUIZ_NONCE);

        system::hash_sha256(&preimage)
    }

    fn test_envelope() -> Vec<u8> {
        (0x01..=0x20).collect()
    }

    fn test_salt() -> Vec<u8> {
        (0x10..=0x1f).collect()
    }

    fn upload_request(
        handshake: &UploadHandshake,
        timestamp: NaiveDateTime,
        payload: Vec<u8>,
        specs: FileSpecs,
    ) -> UploadRequest<QuizGate> {
        let mut request = UploadRequest {
            session_id: handshake.session_id.clone(),
            payload,
            envelope: Envelope::new(test_envelope()).unwrap(),
            salt: Salt::new(test_salt()).unwrap(),
            gate_box: GateHash::new(quiz_key(b"42|7")).unwrap(),
            gate_context: b"encrypted quiz questions".to_vec(),
            specs,
            timestamp,
            hmac: Hmac::new(vec![0; HMAC_LEN]).unwrap(),
        };
        request.hmac = Hmac::new(system::hash_hmac(
            &handshake.secret,
            &request.canonical_bytes(),
        ))
        .unwrap();

        request
    }

    fn verify_request(
        handshake: &DownloadHandshake<QuizGate>,
        timestamp: NaiveDateTime,
        access_key: Vec<u8>,
    ) -> VerifyRequest {
        let mut request = VerifyRequest {
            session_id: handshake.session_id.clone(),
            access_key,
            timestamp,
            hmac: Hmac::new(vec![0; HMAC_LEN]).unwrap(),
        };
        request.hmac = Hmac::new(system::hash_hmac(
            &handshake.secret,
            &request.canonical_bytes(),
        ))
        .unwrap();

        request
    }

    /// Runs a full upload with default test values, returning the receipt.
    fn upload_exchange(h: &Harness, payload: &[u8], specs: FileSpecs) -> UploadReceipt {
        let handshake = h.engine.init_upload().unwrap();
        let request = upload_request(&handshake, h.clock.now(), payload.to_vec(), specs);

        h.engine.upload(&request).unwrap()
    }

    #[test]
    fn happy_path_quiz_exchange() {
        let h = harness();
        let payload = b"CIPHER".repeat(1000);

        let receipt = upload_exchange(&h, &payload, FileSpecs::new(300, 3).unwrap());
        assert!(receipt.link_id.to_string().starts_with("LK"));

        let handshake = h.engine.init_download(&receipt.link_id).unwrap();
        assert!(handshake.session_id.to_string().starts_with("SN"));
        assert_eq!(handshake.gate_context, b"encrypted quiz questions");

        let request = verify_request(&handshake, h.clock.now(), quiz_key(b"42|7"));
        let delivered = h.engine.verify_download(&request).unwrap();

        assert_eq!(delivered.payload, payload);
        assert_eq!(delivered.envelope, test_envelope());
        assert_eq!(delivered.salt, test_salt());

        let blob_path = h
            .stores
            .repo
            .find_by_link_id(&receipt.link_id)
            .unwrap()
            .unwrap()
            .blob_path()
            .clone();

        h.engine.acknowledge(&handshake.session_id).unwrap();

        // Burn totality: record, blob and limit are all gone.
        assert!(matches!(
            h.engine.init_download(&receipt.link_id),
            Err(FlowError::LinkNotFound)
        ));
        assert!(h
            .stores
            .repo
            .find_by_link_id(&receipt.link_id)
            .unwrap()
            .is_none());
        assert!(matches!(
            h.stores.blobs.load(&blob_path),
            Err(FlowError::FileNotFound)
        ));
        assert!(h.stores.limits.get(&receipt.link_id).unwrap().is_none());
    }

    #[test]
    fn wrong_answers_exhaust_and_burn() {
        let h = harness();
        let receipt = upload_exchange(&h, b"SECRET", FileSpecs::new(300, 3).unwrap());

        for expected_remaining in [2, 1, 0] {
            let handshake = h.engine.init_download(&receipt.link_id).unwrap();
            let request = verify_request(&handshake, h.clock.now(), quiz_key(b"41|7"));

            assert!(matches!(
                h.engine.verify_download(&request),
                Err(FlowError::AccessVerificationFailed)
            ));
            assert_eq!(
                h.stores
                    .limits
                    .get(&receipt.link_id)
                    .unwrap()
                    .unwrap()
                    .remaining_attempts(),
                expected_remaining
            );
        }

        // The budget is spent; the next attempt burns the link.
        let handshake = h.engine.init_download(&receipt.link_id).unwrap();
        let request = verify_request(&handshake, h.clock.now(), quiz_key(b"41|7"));
        assert!(matches!(
            h.engine.verify_download(&request),
            Err(FlowError::MaxAttemptsExceeded)
        ));

        assert!(matches!(
            h.engine.init_download(&receipt.link_id),
            Err(FlowError::LinkNotFound)
        ));
    }

    #[test]
    fn correct_answer_after_failures_still_delivers() {
        let h = harness();
        let receipt = upload_exchange(&h, b"SECRET", FileSpecs::new(300, 3).unwrap());

        let handshake = h.engine.init_download(&receipt.link_id).unwrap();
        let request = verify_request(&handshake, h.clock.now(), quiz_key(b"41|7"));
        assert!(h.engine.verify_download(&request).is_err());

        let handshake = h.engine.init_download(&receipt.link_id).unwrap();
        let request = verify_request(&handshake, h.clock.now(), quiz_key(b"42|7"));
        assert_eq!(h.engine.verify_download(&request).unwrap().payload, b"SECRET");
    }

    #[test]
    fn delivered_links_are_single_success() {
        let h = harness();
        let receipt = upload_exchange(&h, b"SECRET", FileSpecs::new(300, 3).unwrap());

        let first = h.engine.init_download(&receipt.link_id).unwrap();
        let request = verify_request(&first, h.clock.now(), quiz_key(b"42|7"));
        assert!(h.engine.verify_download(&request).is_ok());

        // Attempts remained, but the delivery claimed the budget: a second
        // verify cannot deliver the same link again.
        let second = h.engine.init_download(&receipt.link_id).unwrap();
        let request = verify_request(&second, h.clock.now(), quiz_key(b"42|7"));
        assert!(matches!(
            h.engine.verify_download(&request),
            Err(FlowError::LinkNotFound)
        ));

        // The record is still there for the winner's acknowledgment.
        h.engine.acknowledge(&first.session_id).unwrap();
    }

    #[test]
    fn concurrent_verifies_deliver_at_most_once() {
        let h = harness();
        let receipt = upload_exchange(&h, b"SECRET", FileSpecs::new(300, 5).unwrap());

        let requests: Vec<VerifyRequest> = (0..4)
            .map(|_| {
                let handshake = h.engine.init_download(&receipt.link_id).unwrap();
                verify_request(&handshake, h.clock.now(), quiz_key(b"42|7"))
            })
            .collect();

        let engine = &h.engine;
        let successes = std::thread::scope(|s| {
            let handles: Vec<_> = requests
                .iter()
                .map(|request| s.spawn(move || engine.verify_download(request).is_ok()))
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|delivered| *delivered)
                .count()
        });

        assert_eq!(successes, 1);
    }

    #[test]
    fn verify_sessions_are_single_use() {
        let h = harness();
        let receipt = upload_exchange(&h, b"SECRET", FileSpecs::new(300, 3).unwrap());

        let handshake = h.engine.init_download(&receipt.link_id).unwrap();
        let request = verify_request(&handshake, h.clock.now(), quiz_key(b"42|7"));

        assert!(h.engine.verify_download(&request).is_ok());
        assert!(matches!(
            h.engine.verify_download(&request),
            Err(FlowError::InvalidSession)
        ));
    }

    #[test]
    fn acknowledge_requires_a_delivered_session() {
        let h = harness();
        let receipt = upload_exchange(&h, b"SECRET", FileSpecs::new(300, 3).unwrap());

        let handshake = h.engine.init_download(&receipt.link_id).unwrap();
        assert!(matches!(
            h.engine.acknowledge(&handshake.session_id),
            Err(FlowError::InvalidSession)
        ));
    }

    #[test]
    fn expiry_sweep_burns_expired_exchanges() {
        let h = harness();
        let receipt = upload_exchange(&h, b"SECRET", FileSpecs::new(1, 3).unwrap());

        let blob_path = h
            .stores
            .repo
            .find_by_link_id(&receipt.link_id)
            .unwrap()
            .unwrap()
            .blob_path()
            .clone();

        h.clock.advance(Duration::seconds(2));

        assert_eq!(h.engine.cleanup_expired().unwrap(), 1);
        assert!(h
            .stores
            .repo
            .find_by_link_id(&receipt.link_id)
            .unwrap()
            .is_none());
        assert!(matches!(
            h.stores.blobs.load(&blob_path),
            Err(FlowError::FileNotFound)
        ));

        // Idempotent: a second sweep has nothing left to do.
        assert_eq!(h.engine.cleanup_expired().unwrap(), 0);
    }

    #[test]
    fn expired_links_refuse_handshakes() {
        let h = harness();
        let receipt = upload_exchange(&h, b"SECRET", FileSpecs::new(1, 3).unwrap());

        h.clock.advance(Duration::seconds(2));

        assert!(matches!(
            h.engine.init_download(&receipt.link_id),
            Err(FlowError::LinkExpired)
        ));
    }

    #[test]
    fn pepper_rotation_keeps_old_records_readable() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let stores = stores(dir.path(), clock.clone());

        let download =
            |engine: &Exchange<QuizGate>, link_id: &LinkId| -> Result<DownloadPayload, FlowError> {
                let handshake = engine.init_download(link_id)?;
                let request = verify_request(&handshake, clock.now(), quiz_key(b"42|7"));
                engine.verify_download(&request)
            };
        let upload = |engine: &Exchange<QuizGate>, payload: &[u8]| -> LinkId {
            let handshake = engine.init_upload().unwrap();
            let request = upload_request(
                &handshake,
                clock.now(),
                payload.to_vec(),
                FileSpecs::new(300, 10).unwrap(),
            );
            engine.upload(&request).unwrap().link_id
        };

        // Links are single-success, so each stage downloads a fresh record
        // sealed under the version in question.
        let engine_v1 = engine_with(vault_with(&[(1, 0x11)], 1), &stores, clock.clone());
        let link_a1 = upload(&engine_v1, b"FILE A");
        let link_a2 = upload(&engine_v1, b"FILE A");

        let engine_v2 = engine_with(
            vault_with(&[(1, 0x11), (2, 0x22)], 2),
            &stores,
            clock.clone(),
        );
        let link_b1 = upload(&engine_v2, b"FILE B");
        let link_b2 = upload(&engine_v2, b"FILE B");

        assert_eq!(download(&engine_v2, &link_a1).unwrap().payload, b"FILE A");
        assert_eq!(download(&engine_v2, &link_b1).unwrap().payload, b"FILE B");

        // Retiring version 1 orphans records sealed under it.
        let engine_v2_only = engine_with(vault_with(&[(2, 0x22)], 2), &stores, clock.clone());
        assert!(matches!(
            download(&engine_v2_only, &link_a2),
            Err(FlowError::Vault(VaultError::UnknownPepperVersion(1)))
        ));
        assert_eq!(
            download(&engine_v2_only, &link_b2).unwrap().payload,
            b"FILE B"
        );
    }

    #[test]
    fn replayed_uploads_fail_the_consumed_session() {
        let h = harness();

        let handshake = h.engine.init_upload().unwrap();
        let request = upload_request(
            &handshake,
            h.clock.now(),
            b"SECRET".to_vec(),
            FileSpecs::new(300, 3).unwrap(),
        );

        assert!(h.engine.upload(&request).is_ok());
        assert!(matches!(
            h.engine.upload(&request),
            Err(FlowError::InvalidSession)
        ));
    }

    #[test]
    fn stale_uploads_mutate_nothing() {
        let h = harness();

        let handshake = h.engine.init_upload().unwrap();
        let request = upload_request(
            &handshake,
            h.clock.now() - Duration::minutes(10),
            b"SECRET".to_vec(),
            FileSpecs::new(300, 3).unwrap(),
        );

        assert!(matches!(
            h.engine.upload(&request),
            Err(FlowError::StaleRequest)
        ));

        // The session survives and no bytes have hit the stores.
        assert!(h
            .stores
            .sessions
            .get(&handshake.session_id)
            .unwrap()
            .is_some());
        assert_eq!(fs::read_dir(h._dir.path().join("records")).unwrap().count(), 0);
        assert_eq!(fs::read_dir(h._dir.path().join("blobs")).unwrap().count(), 0);
    }

    #[test]
    fn tampered_uploads_fail_authentication() {
        let h = harness();

        let handshake = h.engine.init_upload().unwrap();
        let mut request = upload_request(
            &handshake,
            h.clock.now(),
            b"SECRET".to_vec(),
            FileSpecs::new(300, 3).unwrap(),
        );
        request.payload.push(0x00);

        assert!(matches!(
            h.engine.upload(&request),
            Err(FlowError::HmacVerificationFailed)
        ));
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let h = harness();

        let handshake = h.engine.init_upload().unwrap();
        let request = upload_request(
            &handshake,
            h.clock.now(),
            vec![0; (policy().max_blob_bytes + 1) as usize],
            FileSpecs::new(300, 3).unwrap(),
        );

        assert!(matches!(
            h.engine.upload(&request),
            Err(FlowError::Value(ValueError::BoundedSize { .. }))
        ));
        assert_eq!(fs::read_dir(h._dir.path().join("blobs")).unwrap().count(), 0);
    }

    #[test]
    fn gate_and_hmac_failures_are_indistinguishable_publicly() {
        assert_eq!(
            PublicError::from(&FlowError::HmacVerificationFailed),
            PublicError::AccessDenied
        );
        assert_eq!(
            PublicError::from(&FlowError::AccessVerificationFailed),
            PublicError::AccessDenied
        );
        assert_eq!(
            PublicError::from(&FlowError::InvalidSession),
            PublicError::AccessDenied
        );

        assert_eq!(
            PublicError::from(&FlowError::LinkExpired),
            PublicError::Expired
        );
        assert_eq!(
            PublicError::from(&FlowError::MaxAttemptsExceeded),
            PublicError::AttemptsExhausted
        );
    }
}
