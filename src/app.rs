//! Station application: wires configuration, adapters, workers, staging and
//! transfer together and owns their lifecycle.
//!
//! ```no_run
//! use station_daq::{app::StationApp, config::StationConfig};
//! # async fn run() -> station_daq::AppResult<()> {
//! let config = StationConfig::load_from("config/station.toml")?;
//! let mut app = StationApp::build(config)?;
//! app.start()?;
//! tokio::signal::ctrl_c().await?;
//! app.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::adapters::filesystem::{HarvestLedger, LEDGER_FILE};
use crate::adapters::{build_adapter, ProtocolAdapter};
use crate::clock::{Clock, SystemClock};
use crate::config::{InstrumentSpec, StationConfig};
use crate::error::{AppResult, DaqError};
use crate::scheduler::{Scheduler, StagingJob};
use crate::stager::Stager;
use crate::transfer::{TransferEngine, TransferReport};
use crate::worker::{InstrumentWorker, WorkerHandle};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Instrument {
    spec: Arc<InstrumentSpec>,
    adapter: Option<Box<dyn ProtocolAdapter>>,
    ledger: Option<HarvestLedger>,
}

struct Running {
    scheduler: Scheduler,
    workers: Vec<(WorkerHandle, JoinHandle<()>)>,
    staging: Vec<Arc<StagingJob>>,
}

/// The collector process.
pub struct StationApp {
    config: Arc<StationConfig>,
    clock: Arc<dyn Clock>,
    stager: Stager,
    transfer: Option<TransferEngine>,
    instruments: Vec<Instrument>,
    shutdown_tx: watch::Sender<bool>,
    running: Option<Running>,
}

impl StationApp {
    /// Validate `config`, create the directory roots and build one adapter
    /// per enabled instrument.
    pub fn build(config: StationConfig) -> AppResult<Self> {
        config.validate().map_err(DaqError::Configuration)?;
        for root in [&config.paths.staging, &config.paths.data, &config.paths.logs] {
            std::fs::create_dir_all(root).map_err(|e| {
                DaqError::Configuration(format!("cannot create {}: {e}", root.display()))
            })?;
        }

        let mut instruments = Vec::new();
        for spec in config.enabled_instruments() {
            let ledger = if spec.is_passive() {
                let path = config.paths.data.join(&spec.id).join(LEDGER_FILE);
                Some(HarvestLedger::open(path)?)
            } else {
                None
            };
            let adapter = build_adapter(spec, ledger.clone())?;
            instruments.push(Instrument {
                spec: Arc::new(spec.clone()),
                adapter: Some(adapter),
                ledger,
            });
        }

        let transfer = TransferEngine::from_config(&config)?;
        let stager = Stager::new(
            config.paths.staging.clone(),
            config.paths.data.clone(),
            config.reporting_interval,
        );
        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(
            station = %config.application.name,
            instruments = instruments.len(),
            transfer = transfer.is_some(),
            "station configured"
        );
        Ok(Self {
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            stager,
            transfer,
            instruments,
            shutdown_tx,
            running: None,
        })
    }

    /// Use another clock (tests drive the scheduler with tokio's paused clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the transfer engine.
    pub fn with_transfer(mut self, transfer: Option<TransferEngine>) -> Self {
        self.transfer = transfer;
        self
    }

    /// Replace the adapter of instrument `id` before starting.
    pub fn with_adapter(mut self, id: &str, adapter: Box<dyn ProtocolAdapter>) -> AppResult<Self> {
        let instrument = self
            .instruments
            .iter_mut()
            .find(|i| i.spec.id == id)
            .ok_or_else(|| DaqError::Configuration(format!("no enabled instrument '{id}'")))?;
        instrument.adapter = Some(adapter);
        Ok(self)
    }

    /// Loaded configuration.
    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Transfer engine, when transfer is enabled.
    pub fn transfer(&self) -> Option<&TransferEngine> {
        self.transfer.as_ref()
    }

    /// Handle of a running worker.
    pub fn worker(&self, id: &str) -> Option<WorkerHandle> {
        self.running
            .as_ref()?
            .workers
            .iter()
            .find(|(handle, _)| handle.id() == id)
            .map(|(handle, _)| handle.clone())
    }

    /// Spawn one worker per instrument and every trigger.
    pub fn start(&mut self) -> AppResult<()> {
        if self.running.is_some() {
            return Err(DaqError::Configuration("station already started".to_string()));
        }
        let runtime = &self.config.runtime;
        let mut scheduler = Scheduler::new(self.clock.clone(), self.shutdown_tx.subscribe(), runtime.shutdown_grace);
        let mut workers = Vec::new();
        let mut staging = Vec::new();

        for instrument in &mut self.instruments {
            let adapter = instrument.adapter.take().ok_or_else(|| {
                DaqError::Configuration(format!("instrument '{}' has no adapter", instrument.spec.id))
            })?;
            let (handle, task) = InstrumentWorker::spawn(
                instrument.spec.clone(),
                adapter,
                runtime,
                self.clock.clone(),
                self.shutdown_tx.subscribe(),
            );
            let job = Arc::new(StagingJob::new(
                instrument.spec.clone(),
                handle.clone(),
                self.stager.clone(),
                instrument.ledger.clone(),
                runtime.staging_failure_escalation,
            ));
            scheduler.add_instrument(handle.clone(), job.clone());
            workers.push((handle, task));
            staging.push(job);
        }

        if let Some(engine) = &self.transfer {
            let engine = engine.clone();
            scheduler.add_trigger(
                "transfer",
                self.config.transfer.interval,
                self.config.transfer.offset,
                move |_| {
                    let engine = engine.clone();
                    async move {
                        if let Err(e) = engine.upload_all().await {
                            tracing::warn!(error = %e, "transfer cycle failed");
                        }
                    }
                },
            );
        }

        tracing::info!(triggers = ?scheduler.trigger_names(), "station started");
        self.running = Some(Running {
            scheduler,
            workers,
            staging,
        });
        Ok(())
    }

    /// Run one transfer cycle now.
    pub async fn upload_once(&self) -> AppResult<TransferReport> {
        let engine = self
            .transfer
            .as_ref()
            .ok_or_else(|| DaqError::Configuration("transfer is disabled".to_string()))?;
        engine.upload_all().await
    }

    /// Stop triggers and workers, waiting at most the configured grace period
    /// for in-flight work, then stage every record still buffered.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let grace = self.config.runtime.shutdown_grace;
        tracing::info!(?grace, "shutting down");
        self.shutdown_tx.send_replace(true);

        running.scheduler.join().await;
        for (handle, mut task) in running.workers {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!(instrument = %handle.id(), "worker did not stop in time, aborting");
                task.abort();
            }
        }

        let mut errors = Vec::new();
        for job in &running.staging {
            if let Err(e) = job.run(DateTime::<Utc>::MAX_UTC).await {
                tracing::error!(instrument = %job.spec().id, error = %e, "final staging failed");
                errors.push(e);
            }
        }
        if errors.is_empty() {
            tracing::info!("shutdown complete");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}
