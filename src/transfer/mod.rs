//! Staging directory to remote archive.
//!
//! [`TransferEngine::upload_all`] lists the staging tree and uploads every
//! file it can claim. Claims go through the [`TransferLedger`], so a file is
//! never in flight twice, even when two cycles overlap. A file is removed
//! locally only after the remote copy has been verified:
//!
//! 1. create the remote directories
//! 2. if the remote file already exists with the local size, it counts as
//!    delivered (the process died between upload and delete)
//! 3. write `<name>.part`, compare its size, rename it into place
//!
//! Failed files go back to pending with a per-file capped backoff. After
//! `max_attempts` failures a file is flagged: it is logged at error level and
//! from then on retried at the slower flagged interval. Nothing is dropped.

pub mod sftp;

use crate::config::{StationConfig, TransferConfig};
use crate::error::{AppResult, DaqError};
use crate::retry::Backoff;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use walkdir::WalkDir;

pub use sftp::SftpConnector;

/// Blocking file operations on an open remote session.
pub trait RemoteStore: Send {
    /// Create `path` and any missing parents.
    fn create_dir_all(&mut self, path: &str) -> AppResult<()>;

    /// Size of `path`, or `None` if it does not exist.
    fn size(&mut self, path: &str) -> AppResult<Option<u64>>;

    /// Write the local file to `remote`, replacing it. Returns bytes written.
    fn put(&mut self, local: &Path, remote: &str) -> AppResult<u64>;

    /// Rename `from` to `to`, replacing `to`.
    fn rename(&mut self, from: &str, to: &str) -> AppResult<()>;
}

/// Opens remote sessions.
pub trait Connector: Send + Sync {
    /// Open and authenticate a session.
    fn connect(&self) -> AppResult<Box<dyn RemoteStore>>;

    /// Endpoint for logs.
    fn describe(&self) -> String;
}

/// Per-file transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Waiting for the next attempt
    Pending,
    /// Claimed by a running cycle
    InFlight,
    /// Verified remotely, but the local file is not removed yet
    Delivered,
}

#[derive(Debug, Clone)]
struct Entry {
    state: TransferState,
    attempts: u32,
    next_attempt: Option<Instant>,
    flagged: bool,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: TransferState::Pending,
            attempts: 0,
            next_attempt: None,
            flagged: false,
        }
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the upload
    Claimed,
    /// Another cycle is uploading it
    InFlight,
    /// Backoff has not expired
    Waiting,
    /// Already delivered
    Delivered,
}

/// In-memory per-file state shared by all transfer cycles.
#[derive(Debug, Default)]
pub struct TransferLedger {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl TransferLedger {
    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically move `path` to in-flight if it is due.
    pub fn claim(&self, path: &Path, now: Instant) -> Claim {
        let mut entries = self.lock();
        let entry = entries.entry(path.to_path_buf()).or_insert_with(Entry::new);
        match entry.state {
            TransferState::InFlight => Claim::InFlight,
            TransferState::Delivered => Claim::Delivered,
            TransferState::Pending => {
                if entry.next_attempt.is_some_and(|at| now < at) {
                    return Claim::Waiting;
                }
                entry.state = TransferState::InFlight;
                Claim::Claimed
            }
        }
    }

    /// State of `path`, if known.
    pub fn state(&self, path: &Path) -> Option<TransferState> {
        self.lock().get(path).map(|e| e.state)
    }

    /// Failed attempts so far.
    pub fn attempts(&self, path: &Path) -> u32 {
        self.lock().get(path).map_or(0, |e| e.attempts)
    }

    /// Whether `path` exhausted its attempts.
    pub fn is_flagged(&self, path: &Path) -> bool {
        self.lock().get(path).is_some_and(|e| e.flagged)
    }

    /// Flagged files.
    pub fn flagged(&self) -> Vec<PathBuf> {
        let mut flagged: Vec<_> = self
            .lock()
            .iter()
            .filter(|(_, e)| e.flagged)
            .map(|(p, _)| p.clone())
            .collect();
        flagged.sort();
        flagged
    }

    fn delivered(&self, path: &Path) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(path.to_path_buf()).or_insert_with(Entry::new);
        let was_flagged = entry.flagged;
        entry.state = TransferState::Delivered;
        entry.flagged = false;
        was_flagged
    }

    fn forget(&self, path: &Path) {
        self.lock().remove(path);
    }

    fn failed(&self, path: &Path, policy: &RetryPolicy, now: Instant) -> (u32, bool, Duration) {
        let mut entries = self.lock();
        let entry = entries.entry(path.to_path_buf()).or_insert_with(Entry::new);
        entry.attempts = entry.attempts.saturating_add(1);
        entry.state = TransferState::Pending;
        let newly_flagged = !entry.flagged && entry.attempts >= policy.max_attempts;
        if entry.attempts >= policy.max_attempts {
            entry.flagged = true;
        }
        let delay = if entry.flagged {
            policy.flagged_retry
        } else {
            policy.backoff.delay(entry.attempts)
        };
        entry.next_attempt = Some(now + delay);
        (entry.attempts, newly_flagged, delay)
    }

    /// Drop entries for files no longer in staging, except those in flight.
    fn retain_listed(&self, listed: &HashSet<PathBuf>) {
        self.lock()
            .retain(|path, entry| entry.state == TransferState::InFlight || listed.contains(path));
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    backoff: Backoff,
    max_attempts: u32,
    flagged_retry: Duration,
}

/// Counts from one `upload_all` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Files written and verified remotely
    pub uploaded: usize,
    /// Files found complete on the remote side
    pub already_present: usize,
    /// Files whose attempt failed this cycle
    pub failed: usize,
    /// Files in flight elsewhere, backing off, or gone
    pub skipped: usize,
}

enum Delivery {
    Uploaded,
    AlreadyPresent,
}

struct Inner {
    staging_root: PathBuf,
    remote_root: String,
    connector: Arc<dyn Connector>,
    ledger: TransferLedger,
    sessions: Mutex<Vec<Box<dyn RemoteStore>>>,
    permits: Semaphore,
    policy: RetryPolicy,
}

/// Uploads staged files. Cheap to clone.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("staging_root", &self.inner.staging_root)
            .field("remote", &self.inner.connector.describe())
            .finish()
    }
}

impl TransferEngine {
    /// Engine uploading `staging_root` below `remote_root`.
    pub fn new(
        staging_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        connector: Arc<dyn Connector>,
        settings: &TransferConfig,
    ) -> Self {
        let pool_size = settings.pool_size.max(1);
        Self {
            inner: Arc::new(Inner {
                staging_root: staging_root.into(),
                remote_root: remote_root.into().trim_end_matches('/').to_string(),
                connector,
                ledger: TransferLedger::default(),
                sessions: Mutex::new(Vec::with_capacity(pool_size)),
                permits: Semaphore::new(pool_size),
                policy: RetryPolicy {
                    backoff: Backoff::from(settings.backoff),
                    max_attempts: settings.max_attempts.max(1),
                    flagged_retry: settings.flagged_retry_interval,
                },
            }),
        }
    }

    /// SFTP engine for the station, or `None` when transfer is disabled.
    pub fn from_config(config: &StationConfig) -> AppResult<Option<Self>> {
        if !config.transfer.enabled {
            return Ok(None);
        }
        let sftp = config
            .sftp
            .as_ref()
            .ok_or_else(|| DaqError::Configuration("transfer is enabled but [sftp] is missing".to_string()))?;
        let connector = Arc::new(SftpConnector::new(sftp.clone()));
        Ok(Some(Self::new(
            config.paths.staging.clone(),
            sftp.remote_root.clone(),
            connector,
            &config.transfer,
        )))
    }

    /// Per-file state.
    pub fn ledger(&self) -> &TransferLedger {
        &self.inner.ledger
    }

    /// Remote path for a staged file.
    pub fn remote_path(&self, local: &Path) -> AppResult<String> {
        let relative = local
            .strip_prefix(&self.inner.staging_root)
            .map_err(|_| DaqError::Transfer(format!("{} is outside the staging root", local.display())))?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(format!("{}/{}", self.inner.remote_root, parts.join("/")))
    }

    /// Upload every due file in staging.
    pub async fn upload_all(&self) -> AppResult<TransferReport> {
        let root = self.inner.staging_root.clone();
        let listed = tokio::task::spawn_blocking(move || list_staged(&root))
            .await
            .map_err(|e| DaqError::Transfer(format!("listing task failed: {e}")))??;

        let mut report = TransferReport::default();
        let now = Instant::now();
        self.inner.ledger.retain_listed(&listed.iter().cloned().collect());
        let mut claimed = Vec::new();
        for path in listed {
            match self.inner.ledger.claim(&path, now) {
                Claim::Claimed => claimed.push(path),
                Claim::Delivered => {
                    if let Err(e) = self.remove_delivered(&path) {
                        tracing::warn!(file = %path.display(), error = %e, "delivered file still in staging");
                    }
                    report.skipped += 1;
                }
                Claim::InFlight | Claim::Waiting => report.skipped += 1,
            }
        }
        if claimed.is_empty() {
            return Ok(report);
        }

        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|e| DaqError::Transfer(e.to_string()))?;
        let engine = self.clone();
        let batch = tokio::task::spawn_blocking(move || engine.upload_batch(claimed))
            .await
            .map_err(|e| DaqError::Transfer(format!("upload task failed: {e}")))?;
        report.uploaded += batch.uploaded;
        report.already_present += batch.already_present;
        report.failed += batch.failed;
        report.skipped += batch.skipped;

        if report.uploaded + report.already_present + report.failed > 0 {
            tracing::info!(
                uploaded = report.uploaded,
                already_present = report.already_present,
                failed = report.failed,
                skipped = report.skipped,
                "transfer cycle complete"
            );
        }
        Ok(report)
    }

    fn take_session(&self) -> Option<Box<dyn RemoteStore>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    fn return_session(&self, session: Box<dyn RemoteStore>) {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session);
    }

    fn upload_batch(&self, files: Vec<PathBuf>) -> TransferReport {
        let mut report = TransferReport::default();
        let mut session = self.take_session();
        let mut remaining = files.into_iter();

        while let Some(local) = remaining.next() {
            if !local.exists() {
                self.inner.ledger.forget(&local);
                report.skipped += 1;
                continue;
            }
            if session.is_none() {
                match self.inner.connector.connect() {
                    Ok(store) => session = Some(store),
                    Err(e) => {
                        tracing::warn!(remote = %self.inner.connector.describe(), error = %e, "cannot open transfer session");
                        for path in std::iter::once(local).chain(remaining.by_ref()) {
                            self.record_failure(&path, &e);
                            report.failed += 1;
                        }
                        break;
                    }
                }
            }
            let Some(store) = session.as_mut() else {
                break;
            };

            match self.deliver(store.as_mut(), &local) {
                Ok(delivery) => {
                    match delivery {
                        Delivery::Uploaded => report.uploaded += 1,
                        Delivery::AlreadyPresent => report.already_present += 1,
                    }
                    self.finish_delivered(&local, &delivery);
                }
                Err(e) => {
                    // The session may be in an unknown state; start over.
                    session = None;
                    self.record_failure(&local, &e);
                    report.failed += 1;
                }
            }
        }

        if let Some(store) = session {
            self.return_session(store);
        }
        report
    }

    fn deliver(&self, store: &mut dyn RemoteStore, local: &Path) -> AppResult<Delivery> {
        let local_size = std::fs::metadata(local)?.len();
        let remote = self.remote_path(local)?;
        if let Some((parent, _)) = remote.rsplit_once('/') {
            if !parent.is_empty() {
                store.create_dir_all(parent)?;
            }
        }
        if store.size(&remote)? == Some(local_size) {
            return Ok(Delivery::AlreadyPresent);
        }

        let part = format!("{remote}.part");
        let written = store.put(local, &part)?;
        let stored = store.size(&part)?;
        if written != local_size || stored != Some(local_size) {
            return Err(DaqError::Transfer(format!(
                "size mismatch for {part}: local {local_size}, written {written}, remote {stored:?}"
            )));
        }
        store.rename(&part, &remote)?;
        Ok(Delivery::Uploaded)
    }

    fn finish_delivered(&self, local: &Path, delivery: &Delivery) {
        let was_flagged = self.inner.ledger.delivered(local);
        let how = match delivery {
            Delivery::Uploaded => "uploaded",
            Delivery::AlreadyPresent => "already on remote",
        };
        match self.remove_delivered(local) {
            Ok(()) => tracing::info!(file = %local.display(), flagged = was_flagged, "{how}, removed from staging"),
            Err(e) => tracing::error!(file = %local.display(), error = %e, "delivered but could not remove from staging"),
        }
    }

    /// Delete a delivered file. The ledger entry goes with it, so a later
    /// file staged under the same name is uploaded on its own merits.
    fn remove_delivered(&self, local: &Path) -> std::io::Result<()> {
        match std::fs::remove_file(local) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.inner.ledger.forget(local);
        Ok(())
    }

    fn record_failure(&self, local: &Path, error: &DaqError) {
        let (attempts, newly_flagged, retry_in) =
            self.inner.ledger.failed(local, &self.inner.policy, Instant::now());
        if newly_flagged {
            tracing::error!(
                file = %local.display(),
                attempt = attempts,
                error = %error,
                escalated = true,
                "transfer attempts exhausted; file flagged for attention and kept in staging"
            );
        } else if attempts >= self.inner.policy.max_attempts {
            tracing::error!(file = %local.display(), attempt = attempts, retry_in = ?retry_in, error = %error, "flagged file still failing");
        } else {
            tracing::warn!(file = %local.display(), attempt = attempts, retry_in = ?retry_in, error = %error, "transfer failed");
        }
    }
}

fn is_hidden_or_partial(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(".tmp") || name.ends_with(".part")
}

/// Complete files below `root`, sorted by path.
pub fn list_staged(root: &Path) -> AppResult<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
    {
        let entry = entry.map_err(|e| DaqError::Io(std::io::Error::other(e)))?;
        if entry.file_type().is_file() && !is_hidden_or_partial(&entry.file_name().to_string_lossy()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Remote {
        files: Mutex<HashMap<String, u64>>,
        puts: AtomicUsize,
        fail_puts: AtomicUsize,
    }

    struct Store(Arc<Remote>);

    impl RemoteStore for Store {
        fn create_dir_all(&mut self, _path: &str) -> AppResult<()> {
            Ok(())
        }

        fn size(&mut self, path: &str) -> AppResult<Option<u64>> {
            Ok(self.0.files.lock().unwrap().get(path).copied())
        }

        fn put(&mut self, local: &Path, remote: &str) -> AppResult<u64> {
            self.0.puts.fetch_add(1, Ordering::SeqCst);
            if self.0.fail_puts.load(Ordering::SeqCst) > 0 {
                self.0.fail_puts.fetch_sub(1, Ordering::SeqCst);
                return Err(DaqError::Transfer("connection reset".into()));
            }
            let size = std::fs::metadata(local)?.len();
            self.0.files.lock().unwrap().insert(remote.to_string(), size);
            Ok(size)
        }

        fn rename(&mut self, from: &str, to: &str) -> AppResult<()> {
            let mut files = self.0.files.lock().unwrap();
            let size = files.remove(from).ok_or_else(|| DaqError::Transfer("missing".into()))?;
            files.insert(to.to_string(), size);
            Ok(())
        }
    }

    struct Memory(Arc<Remote>);

    impl Connector for Memory {
        fn connect(&self) -> AppResult<Box<dyn RemoteStore>> {
            Ok(Box::new(Store(self.0.clone())))
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }

    fn settings(max_attempts: u32) -> TransferConfig {
        TransferConfig {
            max_attempts,
            ..TransferConfig::default()
        }
    }

    #[test]
    fn listing_skips_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let inst = dir.path().join("tei49c");
        std::fs::create_dir_all(&inst).unwrap();
        for name in ["tei49c_202610161210.dat", ".stage-x.tmp", "a.dat.part", "b.tmp", "tei49c_202610161200.dat.zip"] {
            std::fs::write(inst.join(name), b"x").unwrap();
        }
        std::fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join(".hidden/c.dat"), b"x").unwrap();

        let files = list_staged(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["tei49c_202610161200.dat.zip", "tei49c_202610161210.dat"]);
    }

    #[tokio::test]
    async fn remote_paths_mirror_staging() {
        let remote = Arc::new(Remote::default());
        let engine = TransferEngine::new("/var/staging", "/archive/station/", Arc::new(Memory(remote)), &settings(3));
        assert_eq!(
            engine.remote_path(Path::new("/var/staging/ae33/ae33_202610161210.dat")).unwrap(),
            "/archive/station/ae33/ae33_202610161210.dat"
        );
        assert!(engine.remote_path(Path::new("/elsewhere/x.dat")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_keeps_file_and_flags_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ne300/ne300_202610161300.dat");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"dtm p2635000\n").unwrap();

        let remote = Arc::new(Remote::default());
        remote.fail_puts.store(2, Ordering::SeqCst);
        let engine = TransferEngine::new(dir.path(), "/archive", Arc::new(Memory(remote.clone())), &settings(2));

        let report = engine.upload_all().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(file.exists());
        assert_eq!(engine.ledger().state(&file), Some(TransferState::Pending));

        // backing off
        assert_eq!(engine.upload_all().await.unwrap().skipped, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        engine.upload_all().await.unwrap();
        assert!(engine.ledger().is_flagged(&file));
        assert!(file.exists());

        tokio::time::advance(Duration::from_secs(3601)).await;
        let report = engine.upload_all().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(!file.exists());
        assert_eq!(remote.files.lock().unwrap().get("/archive/ne300/ne300_202610161300.dat"), Some(&13));
        assert!(engine.ledger().flagged().is_empty());
    }

    #[test]
    fn claims_are_exclusive() {
        let ledger = TransferLedger::default();
        let path = Path::new("/s/a.dat");
        let now = Instant::now();
        assert_eq!(ledger.claim(path, now), Claim::Claimed);
        assert_eq!(ledger.claim(path, now), Claim::InFlight);
        ledger.delivered(path);
        assert_eq!(ledger.claim(path, now), Claim::Delivered);
        ledger.forget(path);
        assert_eq!(ledger.claim(path, now), Claim::Claimed);
    }

    #[tokio::test]
    async fn delivered_entries_are_dropped_with_the_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("g2401/CFKADS2-20261016-DataLog_User.dat");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"v1\n").unwrap();

        let remote = Arc::new(Remote::default());
        let engine = TransferEngine::new(dir.path(), "/archive", Arc::new(Memory(remote)), &settings(3));
        assert_eq!(engine.upload_all().await.unwrap().uploaded, 1);
        assert!(!file.exists());
        assert_eq!(engine.ledger().state(&file), None);
    }
}
