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
use crate::proto::{DownloadLimit, PathReference, SecureFile, Session};
use crate::FlowError;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::{fs, fmt};

use chrono::{Duration, NaiveDateTime, Utc};
use uuid::Uuid;

/// A `Clock` provides the current UTC instant. Injected so expiry and
/// skew handling stay testable.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> NaiveDateTime;
}

/// The wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// A settable clock for expiry and skew scenarios in tests.
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    /// Creates a clock frozen at the given instant.
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}

/// A `SessionCache` holds the short-lived upload and download sessions.
///
/// Lookups honor `expires_at` as a hard boundary: a hit past expiry is
/// reported (and evicted) as absent. `take` is the atomic
/// get-and-remove used to make each session single-use.
pub trait SessionCache: Send + Sync {
    /// Stores a session under its identifier, replacing any previous one.
    fn save(&self, session: Session) -> Result<(), FlowError>;
    /// Returns the unexpired session with this identifier, if any.
    fn get(&self, id: &SessionId) -> Result<Option<Session>, FlowError>;
    /// Atomically removes and returns the unexpired session with this
    /// identifier. At most one caller can obtain a given session.
    fn take(&self, id: &SessionId) -> Result<Option<Session>, FlowError>;
    /// Removes a session. Absent sessions are not an error.
    fn delete(&self, id: &SessionId) -> Result<(), FlowError>;
    /// Drops every expired session, returning how many were evicted.
    fn evict_expired(&self) -> Result<usize, FlowError>;
}

/// The mutex-guarded in-memory [`SessionCache`]. Sessions do not survive
/// a restart, which also invalidates any in-flight exchange.
pub struct MemorySessionCache {
    sessions: Mutex<HashMap<SessionId, Session>>,
    clock: Arc<dyn Clock>,
}

impl MemorySessionCache {
    /// Creates an empty cache evaluating expiry against the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl SessionCache for MemorySessionCache {
    fn save(&self, session: Session) -> Result<(), FlowError> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id().clone(), session);

        Ok(())
    }

    fn get(&self, id: &SessionId) -> Result<Option<Session>, FlowError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().unwrap();

        match sessions.get(id) {
            Some(session) if session.is_expired(now) => {
                sessions.remove(id);
                Ok(None)
            }
            Some(session) => Ok(Some(session.clone())),
            None => Ok(None),
        }
    }

    fn take(&self, id: &SessionId) -> Result<Option<Session>, FlowError> {
        let now = self.clock.now();

        Ok(self
            .sessions
            .lock()
            .unwrap()
            .remove(id)
            .filter(|session| !session.is_expired(now)))
    }

    fn delete(&self, id: &SessionId) -> Result<(), FlowError> {
        self.sessions.lock().unwrap().remove(id);

        Ok(())
    }

    fn evict_expired(&self) -> Result<usize, FlowError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock().unwrap();

        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));

        Ok(before - sessions.len())
    }
}

/// A `DownloadLimitStore` tracks the per-link attempt budgets.
pub trait DownloadLimitStore: Send + Sync {
    /// Stores a fresh budget for a link.
    fn create(&self, limit: DownloadLimit) -> Result<(), FlowError>;
    /// Returns the budget of a link, if any.
    fn get(&self, link_id: &LinkId) -> Result<Option<DownloadLimit>, FlowError>;
    /// Atomically counts one attempt and returns the new remaining count.
    ///
    /// Fails without mutation: [`FlowError::LinkNotFound`] if no budget
    /// exists, [`FlowError::LinkExpired`] past the expiry date and
    /// [`FlowError::MaxAttemptsExceeded`] at zero remaining attempts.
    fn decrement_attempts(&self, link_id: &LinkId) -> Result<u16, FlowError>;
    /// Atomically counts one attempt, runs the gate predicate and, when
    /// it passes, claims the delivery by retiring the budget — all under
    /// one lock, so at most one caller can ever claim a given link.
    ///
    /// A failing predicate leaves the counted attempt standing and fails
    /// [`FlowError::AccessVerificationFailed`]. The preconditions fail
    /// without mutation, exactly as in
    /// [`DownloadLimitStore::decrement_attempts`].
    fn attempt_delivery(
        &self,
        link_id: &LinkId,
        gate_check: &dyn Fn() -> bool,
    ) -> Result<(), FlowError>;
    /// Removes the budget of a link. Absent budgets are not an error.
    fn delete(&self, link_id: &LinkId) -> Result<(), FlowError>;
}

/// The mutex-guarded in-memory [`DownloadLimitStore`]. The single lock
/// makes `decrement_attempts` and `attempt_delivery` the linearization
/// points of concurrent verify calls against the same link.
pub struct MemoryLimitStore {
    limits: Mutex<HashMap<LinkId, DownloadLimit>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLimitStore {
    /// Creates an empty store evaluating expiry against the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            limits: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl DownloadLimitStore for MemoryLimitStore {
    fn create(&self, limit: DownloadLimit) -> Result<(), FlowError> {
        self.limits
            .lock()
            .unwrap()
            .insert(limit.link_id().clone(), limit);

        Ok(())
    }

    fn get(&self, link_id: &LinkId) -> Result<Option<DownloadLimit>, FlowError> {
        Ok(self.limits.lock().unwrap().get(link_id).cloned())
    }

    fn decrement_attempts(&self, link_id: &LinkId) -> Result<u16, FlowError> {
        let now = self.clock.now();
        let mut limits = self.limits.lock().unwrap();

        let limit = limits.get_mut(link_id).ok_or(FlowError::LinkNotFound)?;

        if limit.is_expired(now) {
            return Err(FlowError::LinkExpired);
        }
        if limit.remaining_attempts() == 0 {
            return Err(FlowError::MaxAttemptsExceeded);
        }

        Ok(limit.record_attempt(now))
    }

    fn attempt_delivery(
        &self,
        link_id: &LinkId,
        gate_check: &dyn Fn() -> bool,
    ) -> Result<(), FlowError> {
        let now = self.clock.now();
        let mut limits = self.limits.lock().unwrap();

        let limit = limits.get_mut(link_id).ok_or(FlowError::LinkNotFound)?;

        if limit.is_expired(now) {
            return Err(FlowError::LinkExpired);
        }
        if limit.remaining_attempts() == 0 {
            return Err(FlowError::MaxAttemptsExceeded);
        }

        limit.record_attempt(now);

        if !gate_check() {
            return Err(FlowError::AccessVerificationFailed);
        }

        // Claimed. Retiring the budget here, still under the lock, is
        // what keeps a link single-success across interleavings.
        limits.remove(link_id);

        Ok(())
    }

    fn delete(&self, link_id: &LinkId) -> Result<(), FlowError> {
        self.limits.lock().unwrap().remove(link_id);

        Ok(())
    }
}

/// A `SecureFileRepository` durably stores the exchange records.
pub trait SecureFileRepository<G: GateMode>: Send + Sync {
    /// Persists a record under its link identifier.
    fn save(&self, file: &SecureFile<G>) -> Result<(), FlowError>;
    /// Returns the record published under a link, if any.
    fn find_by_link_id(&self, link_id: &LinkId) -> Result<Option<SecureFile<G>>, FlowError>;
    /// Removes the record of a link, reporting whether one existed.
    /// Idempotent.
    fn delete_by_link_id(&self, link_id: &LinkId) -> Result<bool, FlowError>;
    /// Returns every record whose expiry date is at or before the instant.
    fn find_expired_before(&self, instant: NaiveDateTime)
        -> Result<Vec<SecureFile<G>>, FlowError>;
}

/// The filesystem-backed [`SecureFileRepository`]: one bincode record per
/// link under the records directory, written to a `.part` path first and
/// renamed into place so crashed writes never surface as records.
pub struct FsFileRepository<G: GateMode> {
    dir: PathBuf,
    _gate: PhantomData<G>,
}

impl<G: GateMode> FsFileRepository<G> {
    /// Opens (and creates if needed) the records directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, FlowError> {
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            _gate: PhantomData,
        })
    }

    fn record_path(&self, link_id: &LinkId) -> PathBuf {
        self.dir.join(link_id.to_string())
    }

    fn part_path(&self, link_id: &LinkId) -> PathBuf {
        self.dir.join(format!("{}.part", link_id))
    }
}

impl<G: GateMode> SecureFileRepository<G> for FsFileRepository<G> {
    fn save(&self, file: &SecureFile<G>) -> Result<(), FlowError> {
        let bytes = bincode::serialize(file)?;

        let part = self.part_path(file.link_id());
        fs::write(&part, bytes)?;
        fs::rename(part, self.record_path(file.link_id()))?;

        Ok(())
    }

    fn find_by_link_id(&self, link_id: &LinkId) -> Result<Option<SecureFile<G>>, FlowError> {
        match fs::read(self.record_path(link_id)) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_by_link_id(&self, link_id: &LinkId) -> Result<bool, FlowError> {
        let _ = fs::remove_file(self.part_path(link_id));

        match fs::remove_file(self.record_path(link_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn find_expired_before(
        &self,
        instant: NaiveDateTime,
    ) -> Result<Vec<SecureFile<G>>, FlowError> {
        let mut expired = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension() == Some(OsStr::new("part")) {
                continue;
            }

            let file: SecureFile<G> = bincode::deserialize(&fs::read(&path)?)?;
            if file.is_expired(instant) {
                expired.push(file);
            }
        }

        Ok(expired)
    }
}

/// A `FileStore` holds the opaque, client-encrypted blob bytes.
pub trait FileStore: Send + Sync {
    /// Stores a blob and returns the token it can be loaded under.
    fn store(&self, bytes: &[u8]) -> Result<PathReference, FlowError>;
    /// Loads the blob behind a token.
    fn load(&self, path: &PathReference) -> Result<Vec<u8>, FlowError>;
    /// Deletes the blob behind a token. Absent blobs are not an error.
    fn delete(&self, path: &PathReference) -> Result<(), FlowError>;
}

/// The filesystem-backed [`FileStore`]: blobs live in a flat directory
/// under random UUID names, written to a `.part` path first and renamed
/// into place.
pub struct FsFileStore {
    dir: PathBuf,
}

impl FsFileStore {
    /// Opens (and creates if needed) the blobs directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, FlowError> {
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn blob_path(&self, path: &PathReference) -> Result<PathBuf, FlowError> {
        // Tokens are single flat names. Anything that could traverse out
        // of the blobs directory does not name a stored blob.
        if Path::new(path.as_str()).file_name() != Some(OsStr::new(path.as_str())) {
            return Err(FlowError::FileNotFound);
        }

        Ok(self.dir.join(path.as_str()))
    }
}

impl FileStore for FsFileStore {
    fn store(&self, bytes: &[u8]) -> Result<PathReference, FlowError> {
        let token = PathReference::new(Uuid::new_v4().to_string());
        let path = self.blob_path(&token)?;

        let part = self.dir.join(format!("{}.part", token));
        fs::write(&part, bytes)?;
        fs::rename(part, path)?;

        Ok(token)
    }

    fn load(&self, path: &PathReference) -> Result<Vec<u8>, FlowError> {
        match fs::read(self.blob_path(path)?) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FlowError::FileNotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, path: &PathReference) -> Result<(), FlowError> {
        match fs::remove_file(self.blob_path(path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for FsFileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsFileStore({})", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::QuizGate;
    use crate::id::FileId;
    use crate::proto::{
        FileSpecs, GateHash, SealedBlob, SessionSecret, NONCE_LEN, SALT_LEN, SECRET_LEN, TAG_LEN,
    };
    use crate::system;

    use std::thread;

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            chrono::DateTime::from_timestamp(1_700_000_000, 0)
                .unwrap()
                .naive_utc(),
        ))
    }

    fn secret() -> SessionSecret {
        SessionSecret::new(system::random_bytes(SECRET_LEN)).unwrap()
    }

    fn download_session(clock: &ManualClock, ttl_secs: i64) -> Session {
        let now = clock.now();
        Session::download(
            SessionId::generate(),
            secret(),
            LinkId::generate(),
            now,
            now + Duration::seconds(ttl_secs),
        )
        .unwrap()
    }

    fn record(clock: &ManualClock, ttl_secs: i64) -> SecureFile<QuizGate> {
        let now = clock.now();
        SecureFile::new(
            FileId::generate(),
            LinkId::generate(),
            PathReference::new("blob".to_string()),
            SealedBlob::new(1, [0; NONCE_LEN], vec![0; TAG_LEN + 8]),
            SealedBlob::new(1, [1; NONCE_LEN], vec![0; TAG_LEN + SALT_LEN]),
            GateHash::new(system::hash_sha256(b"answers")).unwrap(),
            b"encrypted questions".to_vec(),
            FileSpecs::new(300, 3).unwrap(),
            now,
            now + Duration::seconds(ttl_secs),
        )
        .unwrap()
    }

    #[test]
    fn session_cache_honors_expiry() {
        let clock = manual_clock();
        let cache = MemorySessionCache::new(clock.clone());

        let session = download_session(&clock, 60);
        let id = session.id().clone();
        cache.save(session).unwrap();

        assert!(cache.get(&id).unwrap().is_some());

        clock.advance(Duration::seconds(61));
        assert!(cache.get(&id).unwrap().is_none());
        assert!(cache.take(&id).unwrap().is_none());
    }

    #[test]
    fn session_take_is_single_use() {
        let clock = manual_clock();
        let cache = MemorySessionCache::new(clock.clone());

        let session = download_session(&clock, 60);
        let id = session.id().clone();
        cache.save(session).unwrap();

        assert!(cache.take(&id).unwrap().is_some());
        assert!(cache.take(&id).unwrap().is_none());
        assert!(cache.get(&id).unwrap().is_none());
    }

    #[test]
    fn concurrent_takes_admit_one_holder() {
        let clock = manual_clock();
        let cache = Arc::new(MemorySessionCache::new(clock.clone()));

        let session = download_session(&clock, 60);
        let id = session.id().clone();
        cache.save(session).unwrap();

        let winners = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let id = id.clone();
                    s.spawn(move || cache.take(&id).unwrap().is_some())
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });

        assert_eq!(winners, 1);
    }

    #[test]
    fn eviction_sweeps_expired_sessions() {
        let clock = manual_clock();
        let cache = MemorySessionCache::new(clock.clone());

        cache.save(download_session(&clock, 10)).unwrap();
        cache.save(download_session(&clock, 1000)).unwrap();

        clock.advance(Duration::seconds(11));
        assert_eq!(cache.evict_expired().unwrap(), 1);
        assert_eq!(cache.evict_expired().unwrap(), 0);
    }

    #[test]
    fn limit_decrements_to_exhaustion() {
        let clock = manual_clock();
        let store = MemoryLimitStore::new(clock.clone());

        let link_id = LinkId::generate();
        let expiry = clock.now() + Duration::seconds(300);
        store
            .create(DownloadLimit::new(link_id.clone(), 3, expiry))
            .unwrap();

        assert_eq!(store.decrement_attempts(&link_id).unwrap(), 2);
        assert_eq!(store.decrement_attempts(&link_id).unwrap(), 1);
        assert_eq!(store.decrement_attempts(&link_id).unwrap(), 0);
        assert!(matches!(
            store.decrement_attempts(&link_id),
            Err(FlowError::MaxAttemptsExceeded)
        ));

        // The exhausted failure must not mutate the stored budget.
        let limit = store.get(&link_id).unwrap().unwrap();
        assert_eq!(limit.remaining_attempts(), 0);
    }

    #[test]
    fn limit_stamps_every_counted_attempt() {
        let clock = manual_clock();
        let store = MemoryLimitStore::new(clock.clone());

        let link_id = LinkId::generate();
        let expiry = clock.now() + Duration::seconds(300);
        store
            .create(DownloadLimit::new(link_id.clone(), 1, expiry))
            .unwrap();

        assert!(store.get(&link_id).unwrap().unwrap().last_attempt_at().is_none());

        clock.advance(Duration::seconds(5));
        assert_eq!(store.decrement_attempts(&link_id).unwrap(), 0);
        assert_eq!(
            store.get(&link_id).unwrap().unwrap().last_attempt_at(),
            Some(clock.now())
        );
    }

    #[test]
    fn limit_rejects_expired_and_unknown_links() {
        let clock = manual_clock();
        let store = MemoryLimitStore::new(clock.clone());

        assert!(matches!(
            store.decrement_attempts(&LinkId::generate()),
            Err(FlowError::LinkNotFound)
        ));

        let link_id = LinkId::generate();
        store
            .create(DownloadLimit::new(
                link_id.clone(),
                3,
                clock.now() + Duration::seconds(10),
            ))
            .unwrap();

        clock.advance(Duration::seconds(11));
        assert!(matches!(
            store.decrement_attempts(&link_id),
            Err(FlowError::LinkExpired)
        ));
    }

    #[test]
    fn attempt_delivery_counts_failures_and_claims_once() {
        let clock = manual_clock();
        let store = MemoryLimitStore::new(clock.clone());

        let link_id = LinkId::generate();
        store
            .create(DownloadLimit::new(
                link_id.clone(),
                3,
                clock.now() + Duration::seconds(300),
            ))
            .unwrap();

        // A failing gate counts the attempt and leaves the budget in place.
        assert!(matches!(
            store.attempt_delivery(&link_id, &|| false),
            Err(FlowError::AccessVerificationFailed)
        ));
        assert_eq!(
            store.get(&link_id).unwrap().unwrap().remaining_attempts(),
            2
        );

        // A passing gate claims the delivery and retires the budget.
        store.attempt_delivery(&link_id, &|| true).unwrap();
        assert!(store.get(&link_id).unwrap().is_none());
        assert!(matches!(
            store.attempt_delivery(&link_id, &|| true),
            Err(FlowError::LinkNotFound)
        ));
    }

    #[test]
    fn concurrent_delivery_attempts_claim_at_most_once() {
        let clock = manual_clock();
        let store = Arc::new(MemoryLimitStore::new(clock.clone()));

        let link_id = LinkId::generate();
        store
            .create(DownloadLimit::new(
                link_id.clone(),
                5,
                clock.now() + Duration::seconds(300),
            ))
            .unwrap();

        let claims = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = Arc::clone(&store);
                    let link_id = link_id.clone();
                    s.spawn(move || store.attempt_delivery(&link_id, &|| true).is_ok())
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|claimed| *claimed)
                .count()
        });

        assert_eq!(claims, 1);
    }

    #[test]
    fn concurrent_decrements_respect_the_budget() {
        let clock = manual_clock();
        let store = Arc::new(MemoryLimitStore::new(clock.clone()));

        let link_id = LinkId::generate();
        store
            .create(DownloadLimit::new(
                link_id.clone(),
                3,
                clock.now() + Duration::seconds(300),
            ))
            .unwrap();

        let successes = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = Arc::clone(&store);
                    let link_id = link_id.clone();
                    s.spawn(move || store.decrement_attempts(&link_id).is_ok())
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });

        assert_eq!(successes, 3);
    }

    #[test]
    fn repository_round_trips_records() {
        let clock = manual_clock();
        let dir = tempfile::tempdir().unwrap();
        let repo: FsFileRepository<QuizGate> = FsFileRepository::new(dir.path()).unwrap();

        let file = record(&clock, 300);
        repo.save(&file).unwrap();

        let found = repo.find_by_link_id(file.link_id()).unwrap().unwrap();
        assert_eq!(found.id(), file.id());
        assert_eq!(found.sealed_envelope(), file.sealed_envelope());
        assert_eq!(found.gate_context(), file.gate_context());
        assert_eq!(found.expiry_date(), file.expiry_date());
    }

    #[test]
    fn repository_deletion_is_idempotent() {
        let clock = manual_clock();
        let dir = tempfile::tempdir().unwrap();
        let repo: FsFileRepository<QuizGate> = FsFileRepository::new(dir.path()).unwrap();

        let file = record(&clock, 300);
        repo.save(&file).unwrap();

        assert!(repo.delete_by_link_id(file.link_id()).unwrap());
        assert!(!repo.delete_by_link_id(file.link_id()).unwrap());
        assert!(repo.find_by_link_id(file.link_id()).unwrap().is_none());
    }

    #[test]
    fn repository_finds_expired_records() {
        let clock = manual_clock();
        let dir = tempfile::tempdir().unwrap();
        let repo: FsFileRepository<QuizGate> = FsFileRepository::new(dir.path()).unwrap();

        let short = record(&clock, 10);
        let long = record(&clock, 1000);
        repo.save(&short).unwrap();
        repo.save(&long).unwrap();

        clock.advance(Duration::seconds(11));
        let expired = repo.find_expired_before(clock.now()).unwrap();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].link_id(), short.link_id());
    }

    #[test]
    fn file_store_round_trips_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFileStore::new(dir.path()).unwrap();

        let token = store.store(b"CIPHER".as_slice()).unwrap();
        assert_eq!(store.load(&token).unwrap(), b"CIPHER");

        store.delete(&token).unwrap();
        assert!(matches!(store.load(&token), Err(FlowError::FileNotFound)));
        store.delete(&token).unwrap();
    }

    #[test]
    fn file_store_rejects_traversing_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFileStore::new(dir.path()).unwrap();

        for token in ["../escape", "a/b", "/etc/passwd"] {
            assert!(matches!(
                store.load(&PathReference::new(token.to_string())),
                Err(FlowError::FileNotFound)
            ));
        }
    }
}
