//! Passive-filesystem adapter: harvesting files an instrument writes itself
//! (e.g. a Picarro analyzer syncing to a network share).
//!
//! There is no channel to open; `connect` only checks that the source is
//! reachable. A scan lists the configured layout (flat, or day/hour buckets),
//! keeps files modified within `days_to_sync`, and returns those that are
//! complete and not yet harvested. A file counts as complete once its size
//! and mtime are unchanged across two scans, or once its mtime is older than
//! `settle_time`.
//!
//! Files that reached staging are recorded in a [`HarvestLedger`] keyed by
//! path, size and mtime and persisted next to the instrument's data, so a
//! restart does not harvest them again. A file rewritten in place gets a new
//! key and is harvested again.

use super::{ConfigReport, ProtocolAdapter, RawResponse};
use crate::config::{Connection, InstrumentSpec, SourceLayout};
use crate::core::{Decoded, HarvestKey, HarvestedFile};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Ledger file name inside `<data_root>/<instrument_id>/`.
pub const LEDGER_FILE: &str = ".harvest-ledger.json";

/// Upper bound for one scan of a (possibly stale) network share.
const SCAN_TIMEOUT: Duration = Duration::from_secs(120);

/// A source that never reconnects still has its ledger pruned this often.
const LEDGER_PRUNE_INTERVAL: chrono::Duration = chrono::Duration::days(1);

/// Persistent seen-set of staged harvested files.
#[derive(Debug, Clone)]
pub struct HarvestLedger {
    inner: Arc<Mutex<LedgerState>>,
}

#[derive(Debug)]
struct LedgerState {
    path: Option<PathBuf>,
    staged: HashSet<HarvestKey>,
}

impl HarvestLedger {
    /// Load the ledger at `path`, or start empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let staged = match std::fs::read(&path) {
            Ok(bytes) => {
                let keys: Vec<HarvestKey> = serde_json::from_slice(&bytes)
                    .map_err(|e| DaqError::Parse(format!("harvest ledger {}: {e}", path.display())))?;
                keys.into_iter().collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(LedgerState {
                path: Some(path),
                staged,
            })),
        })
    }

    /// Ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerState {
                path: None,
                staged: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether this exact file version was staged before.
    pub fn is_staged(&self, key: &HarvestKey) -> bool {
        self.lock().staged.contains(key)
    }

    /// Record a staged file and persist the ledger.
    pub fn mark_staged(&self, key: HarvestKey) -> AppResult<()> {
        let mut state = self.lock();
        state.staged.insert(key);
        persist(&state)
    }

    /// Forget entries whose mtime is older than `cutoff`; such files are
    /// outside the sync window and would not be considered anyway.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> AppResult<usize> {
        let mut state = self.lock();
        let before = state.staged.len();
        let cutoff = cutoff.timestamp_millis();
        state.staged.retain(|k| k.modified >= cutoff);
        let removed = before - state.staged.len();
        if removed > 0 {
            persist(&state)?;
        }
        Ok(removed)
    }

    /// Number of recorded files.
    pub fn len(&self) -> usize {
        self.lock().staged.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn persist(state: &LedgerState) -> AppResult<()> {
    let Some(path) = &state.path else {
        return Ok(());
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut keys: Vec<&HarvestKey> = state.staged.iter().collect();
    keys.sort_by(|a, b| a.path.cmp(&b.path).then(a.modified.cmp(&b.modified)));
    let json = serde_json::to_vec_pretty(&keys)
        .map_err(|e| DaqError::Staging(format!("serialize harvest ledger: {e}")))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".ledger-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    std::io::Write::write_all(&mut temp, &json)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| DaqError::Io(e.error))?;
    Ok(())
}

/// Harvests files from a directory or mounted share.
pub struct PassiveFilesystemAdapter {
    id: String,
    source: PathBuf,
    layout: SourceLayout,
    days_to_sync: u32,
    pattern: Option<Regex>,
    settle_time: Duration,
    ledger: HarvestLedger,
    observed: HashMap<PathBuf, (u64, i64)>,
    harvested: HashSet<HarvestKey>,
    reachable: bool,
    last_pruned: Option<DateTime<Utc>>,
}

impl PassiveFilesystemAdapter {
    /// Adapter for `spec`, recording staged files in `ledger`.
    pub fn new(spec: &InstrumentSpec, ledger: HarvestLedger) -> AppResult<Self> {
        let Connection::Filesystem {
            source,
            layout,
            days_to_sync,
            pattern,
            settle_time,
        } = &spec.connection
        else {
            return Err(DaqError::Configuration(format!(
                "instrument '{}' is not a filesystem instrument",
                spec.id
            )));
        };
        let pattern = pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| DaqError::Configuration(format!("instrument '{}': {e}", spec.id)))?;
        Ok(Self {
            id: spec.id.clone(),
            source: source.clone(),
            layout: *layout,
            days_to_sync: *days_to_sync,
            pattern,
            settle_time: *settle_time,
            ledger,
            observed: HashMap::new(),
            harvested: HashSet::new(),
            reachable: false,
            last_pruned: None,
        })
    }

    /// The ledger shared with the stager.
    pub fn ledger(&self) -> &HarvestLedger {
        &self.ledger
    }

    fn sync_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.days_to_sync))
    }

    /// Drop ledger entries that fell out of the sync window, at most once per
    /// [`LEDGER_PRUNE_INTERVAL`].
    fn prune_ledger(&mut self, now: DateTime<Utc>) {
        if self.last_pruned.is_some_and(|last| now - last < LEDGER_PRUNE_INTERVAL) {
            return;
        }
        match self.ledger.prune(now - self.sync_window()) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(instrument = %self.id, removed, "pruned harvest ledger"),
            Err(e) => tracing::warn!(instrument = %self.id, error = %e, "could not prune harvest ledger"),
        }
        self.last_pruned = Some(now);
    }

    fn select(&mut self, candidates: Vec<HarvestedFile>, now: DateTime<Utc>) -> Vec<HarvestedFile> {
        let settle = chrono::Duration::from_std(self.settle_time).unwrap_or_else(|_| chrono::Duration::zero());
        let ledger = self.ledger.clone();
        self.harvested.retain(|key| !ledger.is_staged(key));

        let mut seen_now = HashMap::with_capacity(candidates.len());
        let mut ready = Vec::new();
        for file in candidates {
            let stamp = (file.size, file.modified.timestamp_millis());
            let previous = self.observed.get(&file.path).copied();
            seen_now.insert(file.path.clone(), stamp);

            let key = file.key();
            if self.ledger.is_staged(&key) || self.harvested.contains(&key) {
                continue;
            }
            let unchanged = previous == Some(stamp);
            let settled = now - file.modified >= settle;
            if unchanged || settled {
                self.harvested.insert(key);
                ready.push(file);
            } else {
                tracing::debug!(instrument = %self.id, file = %file.path.display(), "file still growing");
            }
        }
        self.observed = seen_now;
        ready.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.path.cmp(&b.path)));
        ready
    }
}

/// Directories to list for a layout, newest first.
pub fn candidate_dirs(source: &Path, layout: SourceLayout, days: u32, now: DateTime<Utc>) -> Vec<PathBuf> {
    match layout {
        SourceLayout::Flat => vec![source.to_path_buf()],
        SourceLayout::Daily => (0..=i64::from(days))
            .map(|d| source.join((now - chrono::Duration::days(d)).format("%Y/%m/%d").to_string()))
            .collect(),
        SourceLayout::Hourly => (0..=i64::from(days) * 24)
            .map(|h| source.join((now - chrono::Duration::hours(h)).format("%Y/%m/%d/%H").to_string()))
            .collect(),
    }
}

/// List regular, visible files in `dirs` modified at or after `since`.
pub fn scan_dirs(dirs: &[PathBuf], pattern: Option<&Regex>, since: DateTime<Utc>) -> std::io::Result<Vec<HarvestedFile>> {
    let mut files = Vec::new();
    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || pattern.is_some_and(|re| !re.is_match(&name)) {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = metadata.modified()?.into();
            if modified < since {
                continue;
            }
            files.push(HarvestedFile {
                path: entry.path(),
                size: metadata.len(),
                modified,
            });
        }
    }
    Ok(files)
}

#[async_trait]
impl ProtocolAdapter for PassiveFilesystemAdapter {
    fn instrument_id(&self) -> &str {
        &self.id
    }

    async fn connect(&mut self) -> AppResult<()> {
        let source = self.source.clone();
        let metadata = tokio::task::spawn_blocking(move || std::fs::metadata(source))
            .await
            .map_err(|e| DaqError::Io(std::io::Error::other(e)))??;
        if !metadata.is_dir() {
            return Err(DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", self.source.display()),
            )));
        }
        self.last_pruned = None;
        self.prune_ledger(Utc::now());
        self.reachable = true;
        Ok(())
    }

    async fn apply_config(&mut self, _commands: &[String]) -> AppResult<ConfigReport> {
        Ok(ConfigReport::default())
    }

    async fn poll(&mut self, at: DateTime<Utc>) -> AppResult<RawResponse> {
        let dirs = candidate_dirs(&self.source, self.layout, self.days_to_sync, at);
        let pattern = self.pattern.clone();
        let since = at - self.sync_window();
        let scan = tokio::task::spawn_blocking(move || scan_dirs(&dirs, pattern.as_ref(), since));
        let candidates = match tokio::time::timeout(SCAN_TIMEOUT, scan).await {
            Ok(joined) => joined.map_err(|e| DaqError::Io(std::io::Error::other(e)))??,
            Err(_) => {
                self.reachable = false;
                return Err(DaqError::timeout(format!("scan {}", self.source.display()), SCAN_TIMEOUT));
            }
        };
        self.prune_ledger(at);
        Ok(RawResponse::Files(self.select(candidates, at)))
    }

    fn decode(&mut self, raw: RawResponse, _at: DateTime<Utc>) -> AppResult<Decoded> {
        match raw {
            RawResponse::Files(files) => Ok(Decoded::files(files)),
            other => Err(DaqError::Parse(format!("unexpected response for a filesystem source: {other:?}"))),
        }
    }

    async fn disconnect(&mut self) {
        self.reachable = false;
    }

    fn is_connected(&self) -> bool {
        self.reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn layouts_expand_to_bucket_directories() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 1, 30, 0).unwrap();
        let root = Path::new("/share");
        assert_eq!(candidate_dirs(root, SourceLayout::Flat, 3, now), vec![PathBuf::from("/share")]);
        assert_eq!(
            candidate_dirs(root, SourceLayout::Daily, 1, now),
            vec![PathBuf::from("/share/2026/10/16"), PathBuf::from("/share/2026/10/15")]
        );
        let hourly = candidate_dirs(root, SourceLayout::Hourly, 1, now);
        assert_eq!(hourly.len(), 25);
        assert_eq!(hourly[0], PathBuf::from("/share/2026/10/16/01"));
        assert_eq!(hourly[2], PathBuf::from("/share/2026/10/15/23"));
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g2401").join(LEDGER_FILE);
        let key = HarvestKey {
            path: "/share/CFKADS2.dat".into(),
            size: 2048,
            modified: Utc::now().timestamp_millis(),
        };

        let ledger = HarvestLedger::open(&path).unwrap();
        assert!(ledger.is_empty());
        ledger.mark_staged(key.clone()).unwrap();

        let reopened = HarvestLedger::open(&path).unwrap();
        assert!(reopened.is_staged(&key));
        assert_eq!(reopened.prune(Utc::now() + chrono::Duration::days(1)).unwrap(), 1);
        assert!(HarvestLedger::open(&path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn ledger_is_pruned_while_the_source_stays_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::StationConfig::from_toml_str(&format!(
            r#"
            [application]
            name = "harvest-test"

            [paths]
            staging = "/tmp/unused/staging"
            data = "/tmp/unused/data"
            logs = "/tmp/unused/logs"

            [transfer]
            enabled = false

            [[instruments]]
            id = "g2401"
            type = "G2401"

            [instruments.connection]
            protocol = "filesystem"
            source = '{}'
            days_to_sync = 2
            "#,
            dir.path().display()
        ))
        .unwrap();
        let ledger = HarvestLedger::in_memory();
        let mut adapter = PassiveFilesystemAdapter::new(&config.instruments[0], ledger.clone()).unwrap();
        adapter.connect().await.unwrap();

        let staged_at = |at: DateTime<Utc>, name: &str| HarvestKey {
            path: dir.path().join(name),
            size: 10,
            modified: at.timestamp_millis(),
        };
        let now = Utc::now();
        ledger.mark_staged(staged_at(now, "recent.dat")).unwrap();
        ledger.mark_staged(staged_at(now - chrono::Duration::days(1), "yesterday.dat")).unwrap();

        // Within a day of the connect-time prune: nothing is dropped.
        adapter.poll(now + chrono::Duration::hours(12)).await.unwrap();
        assert_eq!(ledger.len(), 2);

        // Two days later, without reconnecting, yesterday's file is outside the window.
        adapter.poll(now + chrono::Duration::hours(30)).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.is_staged(&staged_at(now, "recent.dat")));
        assert!(adapter.is_connected());
    }

    #[test]
    fn scan_skips_hidden_and_filtered_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CFKADS2-20261016-0100Z-DataLog_User.dat"), b"a").unwrap();
        std::fs::write(dir.path().join(".partial.dat"), b"b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"c").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let pattern = Regex::new(r"\.dat$").unwrap();
        let since = Utc::now() - chrono::Duration::days(1);
        let files = scan_dirs(&[dir.path().to_path_buf()], Some(&pattern), since).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("CFKADS2-20261016-0100Z-DataLog_User.dat"));
        assert_eq!(files[0].size, 1);
    }
}
