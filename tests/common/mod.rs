//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use station_daq::config::StationConfig;
use station_daq::transfer::{Connector, RemoteStore};
use station_daq::{AppResult, DaqError};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Station configuration rooted at `root`, with `instruments` appended verbatim.
pub fn station(root: &Path, instruments: &str) -> StationConfig {
    let text = format!(
        r#"
reporting_interval = "10m"

[application]
name = "station-test"

[paths]
staging = '{staging}'
data = '{data}'
logs = '{logs}'

[transfer]
enabled = false

{instruments}
"#,
        staging = root.join("staging").display(),
        data = root.join("data").display(),
        logs = root.join("logs").display(),
    );
    StationConfig::from_toml_str(&text).unwrap()
}

/// Shared state of a fake archive host.
#[derive(Debug, Default)]
pub struct Archive {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub dirs: Mutex<HashSet<String>>,
    /// Final remote paths whose upload fails
    pub failing: Mutex<HashSet<String>>,
    /// Final remote paths whose upload breaks off after half the bytes
    pub truncating: Mutex<HashSet<String>>,
    /// Final remote paths whose upload claims success but stores half the bytes
    pub short_writes: Mutex<HashSet<String>>,
    pub puts: AtomicUsize,
    pub connects: AtomicUsize,
    pub put_delay: Mutex<Duration>,
}

impl Archive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn insert(&self, path: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
    }

    pub fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn truncate(&self, path: &str) {
        self.truncating.lock().unwrap().insert(path.to_string());
    }

    pub fn short_write(&self, path: &str) {
        self.short_writes.lock().unwrap().insert(path.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.truncating.lock().unwrap().clear();
        self.short_writes.lock().unwrap().clear();
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

/// Connector opening sessions on an [`Archive`].
#[derive(Debug, Clone)]
pub struct ArchiveConnector(pub Arc<Archive>);

impl Connector for ArchiveConnector {
    fn connect(&self) -> AppResult<Box<dyn RemoteStore>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ArchiveSession(self.0.clone())))
    }

    fn describe(&self) -> String {
        "memory://archive".to_string()
    }
}

struct ArchiveSession(Arc<Archive>);

impl RemoteStore for ArchiveSession {
    fn create_dir_all(&mut self, path: &str) -> AppResult<()> {
        self.0.dirs.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    fn size(&mut self, path: &str) -> AppResult<Option<u64>> {
        Ok(self.0.files.lock().unwrap().get(path).map(|d| d.len() as u64))
    }

    fn put(&mut self, local: &Path, remote: &str) -> AppResult<u64> {
        self.0.puts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.0.put_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let target = remote.trim_end_matches(".part");
        if self.0.failing.lock().unwrap().contains(target) {
            return Err(DaqError::Transfer(format!("write {remote}: connection reset")));
        }
        let mut data = std::fs::read(local)?;
        let len = data.len() as u64;
        if self.0.truncating.lock().unwrap().contains(target) {
            data.truncate(data.len() / 2);
            self.0.files.lock().unwrap().insert(remote.to_string(), data);
            return Err(DaqError::Transfer(format!("write {remote}: broken pipe")));
        }
        if self.0.short_writes.lock().unwrap().contains(target) {
            data.truncate(data.len() / 2);
        }
        self.0.files.lock().unwrap().insert(remote.to_string(), data);
        Ok(len)
    }

    fn rename(&mut self, from: &str, to: &str) -> AppResult<()> {
        let mut files = self.0.files.lock().unwrap();
        let data = files
            .remove(from)
            .ok_or_else(|| DaqError::Transfer(format!("rename {from}: no such file")))?;
        files.insert(to.to_string(), data);
        Ok(())
    }
}
