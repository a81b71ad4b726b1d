//! Harvesting a source directory: only complete files are staged, and each
//! file only once, across restarts.

mod common;

use chrono::Utc;
use station_daq::adapters::filesystem::{HarvestLedger, LEDGER_FILE};
use station_daq::adapters::PassiveFilesystemAdapter;
use station_daq::clock::SystemClock;
use station_daq::config::StationConfig;
use station_daq::scheduler::StagingJob;
use station_daq::stager::Stager;
use station_daq::worker::{InstrumentWorker, TickOutcome, WorkerHandle};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn config(root: &Path) -> StationConfig {
    let source = root.join("picarro");
    std::fs::create_dir_all(&source).unwrap();
    common::station(
        root,
        &format!(
            r#"
[[instruments]]
id = "g2401"
type = "G2401"
sampling_interval = "1m"
staging_interval = "1h"

[instruments.connection]
protocol = "filesystem"
source = '{}'
pattern = '\.dat$'
settle_time = "1h"
"#,
            source.display()
        ),
    )
}

fn spawn(config: &StationConfig, ledger: HarvestLedger) -> (WorkerHandle, JoinHandle<()>, watch::Sender<bool>, StagingJob) {
    let spec = Arc::new(config.instruments[0].clone());
    let adapter = PassiveFilesystemAdapter::new(&spec, ledger.clone()).unwrap();
    let (stop, shutdown) = watch::channel(false);
    let (worker, task) = InstrumentWorker::spawn(
        spec.clone(),
        Box::new(adapter),
        &config.runtime,
        Arc::new(SystemClock),
        shutdown,
    );
    let stager = Stager::new(&config.paths.staging, &config.paths.data, config.reporting_interval);
    let job = StagingJob::new(spec, worker.clone(), stager, Some(ledger), 3);
    (worker, task, stop, job)
}

fn harvested(outcome: TickOutcome) -> usize {
    match outcome {
        TickOutcome::Polled { files, .. } => files,
        other => panic!("unexpected tick outcome {other:?}"),
    }
}

fn write(path: &Path, body: &str) {
    let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
}

fn age(path: &Path, by: Duration) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - by).unwrap();
}

#[tokio::test]
async fn growing_file_waits_until_it_stops_changing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let source = dir.path().join("picarro");
    let ledger = HarvestLedger::open(config.paths.data.join("g2401").join(LEDGER_FILE)).unwrap();
    let (worker, task, stop, job) = spawn(&config, ledger);

    let growing = source.join("CFKADS2276-20261016-120000Z-DataLog_User_Sync.dat");
    write(&growing, "DATE TIME CH4\n");
    write(&source.join("notes.txt"), "ignored by pattern\n");

    // First sighting of a fresh file.
    assert_eq!(harvested(worker.tick(Utc::now()).await.unwrap()), 0);

    write(&growing, "2026-10-16 12:00:01 1.98\n");
    assert_eq!(harvested(worker.tick(Utc::now()).await.unwrap()), 0);

    // Unchanged since the previous scan.
    assert_eq!(harvested(worker.tick(Utc::now()).await.unwrap()), 1);
    // Already handed over.
    assert_eq!(harvested(worker.tick(Utc::now()).await.unwrap()), 0);

    let summary = job.run(Utc::now()).await.unwrap();
    assert_eq!(summary.files.len(), 1);
    let staged = config.paths.staging.join("g2401/CFKADS2276-20261016-120000Z-DataLog_User_Sync.dat");
    assert_eq!(summary.files[0], staged);
    assert_eq!(
        std::fs::read_to_string(&staged).unwrap(),
        "DATE TIME CH4\n2026-10-16 12:00:01 1.98\n"
    );
    assert!(growing.exists(), "source files are never modified");

    stop.send_replace(true);
    task.await.unwrap();
}

#[tokio::test]
async fn staged_files_are_not_harvested_again_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let source = dir.path().join("picarro");
    let ledger_path = config.paths.data.join("g2401").join(LEDGER_FILE);

    let old = source.join("CFKADS2276-20261016-100000Z-DataLog_User_Sync.dat");
    write(&old, "complete\n");
    age(&old, Duration::from_secs(2 * 3600));

    {
        let ledger = HarvestLedger::open(&ledger_path).unwrap();
        let (worker, task, stop, job) = spawn(&config, ledger.clone());
        // Older than the settle time: complete on first sight.
        assert_eq!(harvested(worker.tick(Utc::now()).await.unwrap()), 1);
        let summary = job.run(Utc::now()).await.unwrap();
        assert_eq!(summary.files.len(), 1);
        assert_eq!(ledger.len(), 1);
        stop.send_replace(true);
        task.await.unwrap();
    }

    // Staging emptied by a transfer in the meantime.
    std::fs::remove_dir_all(&config.paths.staging).unwrap();

    let ledger = HarvestLedger::open(&ledger_path).unwrap();
    assert_eq!(ledger.len(), 1);
    let (worker, task, stop, job) = spawn(&config, ledger);
    assert_eq!(harvested(worker.tick(Utc::now()).await.unwrap()), 0);
    assert_eq!(harvested(worker.tick(Utc::now()).await.unwrap()), 0);
    assert!(job.run(Utc::now()).await.unwrap().files.is_empty());

    stop.send_replace(true);
    task.await.unwrap();
}

#[tokio::test]
async fn missing_source_fails_the_tick_without_stopping_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    std::fs::remove_dir_all(dir.path().join("picarro")).unwrap();
    let (worker, task, stop, _job) = spawn(&config, HarvestLedger::in_memory());

    assert!(matches!(worker.tick(Utc::now()).await.unwrap(), TickOutcome::Failed(_)));
    // Inside the reconnect backoff.
    assert!(matches!(worker.tick(Utc::now()).await.unwrap(), TickOutcome::BackingOff));

    stop.send_replace(true);
    task.await.unwrap();
}
