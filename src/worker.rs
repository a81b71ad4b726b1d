//! One task per instrument: connect, configure, poll, buffer.
//!
//! The worker owns its adapter exclusively. The scheduler drives it with
//! [`WorkerCommand::Tick`] messages and waits for the [`TickOutcome`]; staging
//! only touches the shared [`RecordBuffer`] and [`HarvestQueue`].
//!
//! ```text
//! Disconnected -> Connecting -> Configuring -> Polling
//!      ^                                          |
//!      +---------- transient I/O error / stall ---+
//! ```
//!
//! Handshake failures are retried on later ticks, gated by a jittered capped
//! backoff. After `max_handshake_attempts` consecutive failures every further
//! failure is logged at error level with `escalated = true`.

use crate::adapters::ProtocolAdapter;
use crate::buffer::{HarvestQueue, RecordBuffer};
use crate::clock::Clock;
use crate::config::{InstrumentSpec, RuntimeConfig};
use crate::core::{Decoded, OperationState};
use crate::error::{AppResult, DaqError};
use crate::retry::Backoff;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const COMMAND_QUEUE: usize = 8;
const RECONNECT_JITTER: f64 = 0.2;

/// Connection state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No channel; waiting for the next tick (or for the backoff to expire)
    Disconnected,
    /// Opening the channel
    Connecting,
    /// Sending configuration and clock commands
    Configuring,
    /// Channel up, answering ticks
    Polling,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Disconnected => "disconnected",
            WorkerState::Connecting => "connecting",
            WorkerState::Configuring => "configuring",
            WorkerState::Polling => "polling",
        };
        f.write_str(name)
    }
}

/// What one tick did.
#[derive(Debug)]
pub enum TickOutcome {
    /// Poll and decode succeeded
    Polled {
        /// Records accepted into the buffer
        records: usize,
        /// Files added to the harvest queue
        files: usize,
    },
    /// Reconnect backoff has not expired yet
    BackingOff,
    /// Handshake or poll failed; the channel is closed
    Failed(DaqError),
    /// The response could not be decoded and was dropped
    Discarded(DaqError),
}

/// Messages understood by a worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Poll (connecting first if needed) on behalf of the tick at `at`
    Tick {
        /// Scheduled tick time; decoded records carry it
        at: DateTime<Utc>,
        /// Completion signal
        done: oneshot::Sender<TickOutcome>,
    },
    /// Start a zero or span check now
    ForceCheck {
        /// Which check
        check: OperationState,
        /// Result of arming the check
        done: oneshot::Sender<AppResult<()>>,
    },
}

/// Cloneable handle to a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: String,
    commands: mpsc::Sender<WorkerCommand>,
    buffer: RecordBuffer,
    harvest: HarvestQueue,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// Instrument id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run one tick and wait for it to finish.
    pub async fn tick(&self, at: DateTime<Utc>) -> AppResult<TickOutcome> {
        let (done, outcome) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Tick { at, done })
            .await
            .map_err(|_| DaqError::WorkerStopped(self.id.clone()))?;
        outcome.await.map_err(|_| DaqError::WorkerStopped(self.id.clone()))
    }

    /// Ask the adapter to start a zero or span check.
    pub async fn force_check(&self, check: OperationState) -> AppResult<()> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(WorkerCommand::ForceCheck { check, done })
            .await
            .map_err(|_| DaqError::WorkerStopped(self.id.clone()))?;
        result.await.map_err(|_| DaqError::WorkerStopped(self.id.clone()))?
    }

    /// Records waiting for staging.
    pub fn buffer(&self) -> &RecordBuffer {
        &self.buffer
    }

    /// Harvested files waiting for staging.
    pub fn harvest(&self) -> &HarvestQueue {
        &self.harvest
    }

    /// Latest published state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }
}

/// The per-instrument task.
pub struct InstrumentWorker {
    spec: Arc<InstrumentSpec>,
    adapter: Box<dyn ProtocolAdapter>,
    clock: Arc<dyn Clock>,
    buffer: RecordBuffer,
    harvest: HarvestQueue,
    state: watch::Sender<WorkerState>,
    backoff: Backoff,
    max_handshake_attempts: u32,
    stall_after: Duration,
    handshake_failures: u32,
    retry_at: Option<Instant>,
    last_success: Option<Instant>,
}

impl InstrumentWorker {
    /// Spawn the worker task for `spec`.
    ///
    /// The task ends when `shutdown` turns true (or its sender is dropped), or
    /// when every handle is dropped.
    pub fn spawn(
        spec: Arc<InstrumentSpec>,
        adapter: Box<dyn ProtocolAdapter>,
        runtime: &RuntimeConfig,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> (WorkerHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(WorkerState::Disconnected);
        let buffer = RecordBuffer::new();
        let harvest = HarvestQueue::new();
        let stall_after = spec.sampling_interval.saturating_mul(runtime.stall_factor.max(1));

        let handle = WorkerHandle {
            id: spec.id.clone(),
            commands: commands_tx,
            buffer: buffer.clone(),
            harvest: harvest.clone(),
            state: state_rx,
        };
        let worker = Self {
            spec,
            adapter,
            clock,
            buffer,
            harvest,
            state: state_tx,
            backoff: Backoff::from(runtime.reconnect).with_jitter(RECONNECT_JITTER),
            max_handshake_attempts: runtime.max_handshake_attempts,
            stall_after,
            handshake_failures: 0,
            retry_at: None,
            last_success: None,
        };
        let task = tokio::spawn(worker.run(commands_rx, shutdown));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(instrument = %self.spec.id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let command = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            // An in-flight tick is abandoned on shutdown; whatever it had read
            // but not yet buffered is lost.
            tokio::select! {
                _ = self.handle(command) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.adapter.disconnect().await;
        self.state.send_replace(WorkerState::Disconnected);
        tracing::info!(instrument = %self.spec.id, "worker stopped");
    }

    async fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Tick { at, done } => {
                let outcome = self.tick(at).await;
                // The scheduler may have given up waiting; nothing to report to.
                let _ = done.send(outcome);
            }
            WorkerCommand::ForceCheck { check, done } => {
                let result = self.adapter.force_check(check, self.clock.now());
                match &result {
                    Ok(()) => tracing::info!(instrument = %self.spec.id, check = %check, "forced check armed"),
                    Err(e) => tracing::warn!(instrument = %self.spec.id, error = %e, "cannot force check"),
                }
                let _ = done.send(result);
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn drop_channel(&mut self) {
        self.adapter.disconnect().await;
        self.last_success = None;
        self.set_state(WorkerState::Disconnected);
    }

    async fn tick(&mut self, at: DateTime<Utc>) -> TickOutcome {
        if self.adapter.is_connected() {
            if let Some(last) = self.last_success {
                if last.elapsed() > self.stall_after {
                    tracing::warn!(
                        instrument = %self.spec.id,
                        silent_for = ?last.elapsed(),
                        "no successful poll, forcing reconnect"
                    );
                    self.drop_channel().await;
                }
            }
        } else {
            // the adapter may have dropped its channel on its own
            self.set_state(WorkerState::Disconnected);
        }

        if !self.adapter.is_connected() {
            if let Some(retry_at) = self.retry_at {
                if Instant::now() < retry_at {
                    return TickOutcome::BackingOff;
                }
            }
            if let Err(e) = self.handshake(at).await {
                self.drop_channel().await;
                self.record_handshake_failure(&e);
                return TickOutcome::Failed(e);
            }
        }

        self.poll(at).await
    }

    async fn handshake(&mut self, at: DateTime<Utc>) -> AppResult<()> {
        self.set_state(WorkerState::Connecting);
        self.adapter.connect().await?;

        self.set_state(WorkerState::Configuring);
        for (command, response) in self.adapter.read_config().await? {
            tracing::info!(instrument = %self.spec.id, command = %command, response = %response, "instrument configuration");
        }
        let report = self.adapter.apply_config(&self.spec.set_config).await?;
        for rejected in &report.rejected {
            tracing::warn!(instrument = %self.spec.id, error = %rejected, "configuration command rejected");
        }
        self.adapter.sync_clock(at).await?;

        if self.handshake_failures > 0 {
            tracing::info!(
                instrument = %self.spec.id,
                attempts = self.handshake_failures + 1,
                "instrument reconnected"
            );
        } else {
            tracing::info!(instrument = %self.spec.id, "instrument connected");
        }
        self.handshake_failures = 0;
        self.retry_at = None;
        self.last_success = Some(Instant::now());
        self.set_state(WorkerState::Polling);
        Ok(())
    }

    fn record_handshake_failure(&mut self, error: &DaqError) {
        self.handshake_failures = self.handshake_failures.saturating_add(1);
        let delay = self.backoff.delay(self.handshake_failures);
        self.retry_at = Some(Instant::now() + delay);
        if self.handshake_failures >= self.max_handshake_attempts {
            tracing::error!(
                instrument = %self.spec.id,
                attempt = self.handshake_failures,
                retry_in = ?delay,
                error = %error,
                escalated = true,
                "instrument handshake keeps failing"
            );
        } else {
            tracing::warn!(
                instrument = %self.spec.id,
                attempt = self.handshake_failures,
                retry_in = ?delay,
                error = %error,
                "instrument handshake failed"
            );
        }
    }

    async fn poll(&mut self, at: DateTime<Utc>) -> TickOutcome {
        let raw = match tokio::time::timeout(self.stall_after, self.adapter.poll(at)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return self.poll_failed(e).await,
            Err(_) => return self.poll_failed(DaqError::timeout("poll", self.stall_after)).await,
        };

        let decoded = match self.adapter.decode(raw, at) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(instrument = %self.spec.id, error = %e, "discarding undecodable response");
                return TickOutcome::Discarded(e);
            }
        };
        self.last_success = Some(Instant::now());
        let (records, files) = self.accept(decoded);
        tracing::debug!(instrument = %self.spec.id, records, files, "poll complete");
        TickOutcome::Polled { records, files }
    }

    async fn poll_failed(&mut self, error: DaqError) -> TickOutcome {
        if error.is_transient() || !self.adapter.is_connected() {
            tracing::warn!(instrument = %self.spec.id, error = %error, "poll failed, reconnecting");
            self.drop_channel().await;
        } else {
            tracing::warn!(instrument = %self.spec.id, error = %error, "poll failed");
        }
        TickOutcome::Failed(error)
    }

    fn accept(&self, decoded: Decoded) -> (usize, usize) {
        let mut records = 0;
        for record in decoded.records {
            match self.buffer.push(record) {
                Ok(()) => records += 1,
                Err(e) => tracing::warn!(instrument = %self.spec.id, error = %e, "dropping out-of-order record"),
            }
        }
        let files = decoded.files.into_iter().filter(|f| self.harvest.push(f.clone())).count();
        (records, files)
    }
}
