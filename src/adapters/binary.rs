//! Binary-register adapter for Acoem nephelometers (NE-300, Aurora 3000).
//!
//! Values are read by parameter id (`base * 1e6 + wavelength * 1e3 + angle`)
//! in the configured order; one response frame becomes one record with a field
//! per parameter. Configuration commands do not apply: the parameter set is
//! fixed by the connection settings.
//!
//! A [`CalibrationCycle`] overlay switches the instrument into zero or span
//! mode on schedule. Records taken while a check runs carry the active state.
//!
//! When the connection drops, the instrument keeps logging on its own. After a
//! reconnect the first poll reads the logged records since the last good poll
//! and places them ahead of the live record, in the same column order.

use super::acoem::{self, Command};
use super::calibration::{operation_code, CalibrationCycle};
use super::{Backfill, BoxedTransport, ChannelOpener, ConfigReport, ProtocolAdapter, RawResponse};
use crate::config::{parameter_id, Connection, InstrumentSpec};
use crate::core::{Decoded, OperationState, Record};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Span of one logged-data request; keeps a reply inside the frame length limit.
const BACKFILL_WINDOW: chrono::Duration = chrono::Duration::hours(1);

/// Oldest gap start that is still fetched.
const BACKFILL_LIMIT: chrono::Duration = chrono::Duration::hours(24);

/// Frame-protocol instrument on a TCP socket.
pub struct BinaryRegisterAdapter {
    id: String,
    opener: Arc<dyn ChannelOpener>,
    timeout: Duration,
    serial_id: u8,
    sync_clock: bool,
    parameters: Vec<u32>,
    names: Vec<String>,
    calibration: Option<CalibrationCycle>,
    pending_operation: Option<OperationState>,
    channel: Option<BoxedTransport>,
    backfill: bool,
    /// Logger records every configured parameter
    logger_ready: bool,
    last_polled: Option<DateTime<Utc>>,
    gap_since: Option<DateTime<Utc>>,
}

impl BinaryRegisterAdapter {
    /// Adapter for `spec`, connecting through `opener`.
    pub fn new(spec: &InstrumentSpec, opener: Arc<dyn ChannelOpener>) -> AppResult<Self> {
        let Connection::Binary {
            timeout,
            serial_id,
            parameter_ids,
            wavelengths,
            angles,
            sync_clock,
            backfill,
            ..
        } = &spec.connection
        else {
            return Err(DaqError::Configuration(format!(
                "instrument '{}' is not a binary-register instrument",
                spec.id
            )));
        };
        let parameters: Vec<u32> = parameter_ids
            .iter()
            .zip(wavelengths)
            .zip(angles)
            .map(|((base, wl), angle)| parameter_id(*base, *wl, *angle))
            .collect();
        let mut names = spec.columns();
        if spec.calibration.is_some() {
            names.pop();
        }
        if names.len() != parameters.len() {
            return Err(DaqError::Configuration(format!(
                "instrument '{}' names {} columns for {} parameters",
                spec.id,
                names.len(),
                parameters.len()
            )));
        }
        Ok(Self {
            id: spec.id.clone(),
            opener,
            timeout: *timeout,
            serial_id: *serial_id,
            sync_clock: *sync_clock,
            parameters,
            names,
            calibration: spec.calibration.map(CalibrationCycle::new),
            pending_operation: None,
            channel: None,
            backfill: *backfill,
            logger_ready: false,
            last_polled: None,
            gap_since: None,
        })
    }

    /// Parameter ids in request order.
    pub fn parameters(&self) -> &[u32] {
        &self.parameters
    }

    /// Active overlay state, if the instrument runs one.
    pub fn operation(&self) -> Option<OperationState> {
        self.calibration.as_ref().map(CalibrationCycle::state)
    }

    async fn exchange(&mut self, request: &[u8], expect: Command) -> AppResult<acoem::Frame> {
        let bytes = self.exchange_raw(request).await?;
        let frame = acoem::decode_frame(&bytes)?;
        if frame.command != expect as u8 {
            return Err(DaqError::Parse(format!(
                "expected reply to command {}, got command {}",
                expect as u8, frame.command
            )));
        }
        Ok(frame)
    }

    /// One request and its complete reply frame, unvalidated.
    ///
    /// Any failure leaves the stream at an unknown offset, so the channel is
    /// dropped and the next cycle reconnects.
    async fn exchange_raw(&mut self, request: &[u8]) -> AppResult<Vec<u8>> {
        let result = self.exchange_inner(request).await;
        if let Err(e) = &result {
            if self.channel.take().is_some() {
                tracing::debug!(instrument = %self.id, error = %e, "dropping channel after failed exchange");
            }
        }
        result
    }

    async fn exchange_inner(&mut self, request: &[u8]) -> AppResult<Vec<u8>> {
        let limit = self.timeout;
        let channel = self.channel.as_mut().ok_or(DaqError::NotConnected)?;
        let io = async {
            channel.write_all(request).await?;
            channel.flush().await?;
            let mut frame = vec![0u8; acoem::HEADER_LEN];
            channel.read_exact(&mut frame).await?;
            let len = acoem::payload_len(&frame)?;
            let mut rest = vec![0u8; len + 2];
            channel.read_exact(&mut rest).await?;
            frame.extend_from_slice(&rest);
            Ok::<_, DaqError>(frame)
        };
        match tokio::time::timeout(limit, io).await {
            Ok(Err(DaqError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(DaqError::ConnectionClosed)
            }
            Ok(result) => result,
            Err(_) => Err(DaqError::timeout("binary exchange", limit)),
        }
    }

    async fn set_operation(&mut self, state: OperationState) -> AppResult<()> {
        let request = acoem::set_value(self.serial_id, acoem::PARAM_OPERATION, operation_code(state))?;
        self.exchange(&request, Command::SetValue).await?;
        tracing::info!(instrument = %self.id, operation = %state, "operation state set");
        Ok(())
    }

    /// Ask the instrument which parameters its logger records.
    async fn check_logger(&mut self) -> AppResult<()> {
        let request = acoem::encode_frame(self.serial_id, Command::LoggingConfig, &[])?;
        let logged = self
            .exchange(&request, Command::LoggingConfig)
            .await
            .and_then(|frame| acoem::logged_parameters(&frame));
        self.logger_ready = match logged {
            Ok(logged) => {
                let missing: Vec<u32> = self
                    .parameters
                    .iter()
                    .copied()
                    .filter(|p| !logged.contains(p))
                    .collect();
                if !missing.is_empty() {
                    tracing::warn!(instrument = %self.id, ?missing, "instrument does not log every configured parameter; outages will not be backfilled");
                }
                missing.is_empty()
            }
            Err(e) if !self.is_connected() => return Err(e),
            Err(e) => {
                tracing::warn!(instrument = %self.id, error = %e, "instrument logging configuration unavailable; outages will not be backfilled");
                false
            }
        };
        Ok(())
    }

    /// Logged-data replies for `since..until`, one request per window.
    async fn fetch_logged(&mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> AppResult<Vec<acoem::Frame>> {
        let mut from = since.max(until - BACKFILL_LIMIT);
        if from > since {
            tracing::warn!(
                instrument = %self.id,
                %since,
                %from,
                "outage exceeds the backfill limit; earlier logged records are not fetched"
            );
        }
        let mut frames = Vec::new();
        while from < until {
            let to = (from + BACKFILL_WINDOW).min(until);
            let request = acoem::get_logged_data(self.serial_id, from, to)?;
            frames.push(self.exchange(&request, Command::LoggedData).await?);
            from = to;
        }
        Ok(frames)
    }

    /// Records for the logged rows strictly between the gap start and `at`.
    fn decode_backfill(&self, backfill: &Backfill, at: DateTime<Utc>) -> Vec<Record> {
        let mut rows = Vec::new();
        for frame in &backfill.frames {
            match acoem::decode_logged_data(frame) {
                Ok(decoded) => rows.extend(decoded),
                Err(e) => tracing::warn!(instrument = %self.id, error = %e, "discarding logged data reply"),
            }
        }
        rows.retain(|row| row.timestamp > backfill.since && row.timestamp < at);
        rows.sort_by_key(|row| row.timestamp);
        rows.dedup_by_key(|row| row.timestamp);

        let mut records = Vec::with_capacity(rows.len());
        let mut incomplete = 0usize;
        for row in rows {
            let values: Option<Vec<_>> = self
                .parameters
                .iter()
                .map(|p| row.value(*p).map(|raw| acoem::item_value(*p, raw)))
                .collect();
            let Some(values) = values else {
                incomplete += 1;
                continue;
            };
            let raw: String = row.values.iter().map(|(_, v)| format!("{v:08x}")).collect();
            records.push(Record::new(row.timestamp, &self.names, values, format!("logged {raw}")));
        }
        if incomplete > 0 {
            tracing::warn!(instrument = %self.id, incomplete, "logged rows without every configured parameter skipped");
        }
        tracing::info!(instrument = %self.id, since = %backfill.since, records = records.len(), "outage backfilled from instrument log");
        records
    }

    fn decode_live(&self, bytes: &[u8], tag: Option<OperationState>, at: DateTime<Utc>) -> AppResult<Record> {
        let frame = acoem::decode_frame(bytes)?;
        if frame.command != Command::GetValues as u8 {
            return Err(DaqError::Parse(format!("unexpected reply to command {}", frame.command)));
        }
        let items = frame.items()?;
        if items.len() != self.parameters.len() {
            return Err(DaqError::Parse(format!(
                "requested {} parameters, received {}",
                self.parameters.len(),
                items.len()
            )));
        }
        let values = self
            .parameters
            .iter()
            .zip(items)
            .map(|(param, raw)| acoem::item_value(*param, raw))
            .collect();
        let mut record = Record::new(at, &self.names, values, hex(bytes));
        if let Some(tag) = tag {
            record = record.with_tag(tag);
        }
        Ok(record)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl ProtocolAdapter for BinaryRegisterAdapter {
    fn instrument_id(&self) -> &str {
        &self.id
    }

    // The instrument is switched on the next poll.
    fn force_check(&mut self, check: OperationState, now: DateTime<Utc>) -> AppResult<()> {
        let cycle = self.calibration.as_mut().ok_or_else(|| {
            DaqError::Configuration(format!("instrument '{}' has no calibration overlay", self.id))
        })?;
        self.pending_operation = Some(cycle.force(check, now));
        Ok(())
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.channel = Some(self.opener.open().await?);
        let request = acoem::encode_frame(self.serial_id, Command::Identify, &[])?;
        let identity = self.exchange(&request, Command::Identify).await?;
        tracing::info!(
            instrument = %self.id,
            endpoint = %self.opener.describe(),
            identity = ?identity.items().unwrap_or_default(),
            "instrument identified"
        );
        // An interrupted check must be re-issued on the new connection.
        if let Some(state) = self.operation() {
            self.pending_operation = Some(state);
        }
        if self.backfill {
            self.check_logger().await?;
            if self.logger_ready {
                self.gap_since = self.last_polled;
            }
        }
        Ok(())
    }

    async fn apply_config(&mut self, commands: &[String]) -> AppResult<ConfigReport> {
        if !commands.is_empty() {
            tracing::debug!(
                instrument = %self.id,
                count = commands.len(),
                "configuration commands do not apply to binary-register instruments"
            );
        }
        Ok(ConfigReport::default())
    }

    async fn sync_clock(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        if !self.sync_clock {
            return Ok(());
        }
        let request = acoem::set_value(self.serial_id, acoem::PARAM_DATETIME, acoem::encode_timestamp(now))?;
        self.exchange(&request, Command::SetValue).await?;
        Ok(())
    }

    async fn poll(&mut self, at: DateTime<Utc>) -> AppResult<RawResponse> {
        if let Some(cycle) = self.calibration.as_mut() {
            if let Some(state) = cycle.advance(at) {
                self.pending_operation = Some(state);
            }
        }
        if let Some(state) = self.pending_operation.take() {
            if let Err(e) = self.set_operation(state).await {
                self.pending_operation = Some(state);
                return Err(e);
            }
        }

        let mut backfill = None;
        if let Some(since) = self.gap_since {
            match self.fetch_logged(since, at).await {
                Ok(frames) => backfill = Some(Backfill { since, frames }),
                // Kept for the next attempt on a fresh connection.
                Err(e) if !self.is_connected() => return Err(e),
                Err(e) => tracing::warn!(instrument = %self.id, error = %e, %since, "logged data unavailable; outage not backfilled"),
            }
            self.gap_since = None;
        }

        let tag = self.operation();
        let request = acoem::get_values(self.serial_id, &self.parameters)?;
        // Frame validation happens in decode, so a corrupt reply only costs this poll.
        let bytes = self.exchange_raw(&request).await?;
        Ok(RawResponse::Frame { bytes, tag, backfill })
    }

    fn decode(&mut self, raw: RawResponse, at: DateTime<Utc>) -> AppResult<Decoded> {
        let (bytes, tag, backfill) = match raw {
            RawResponse::Frame { bytes, tag, backfill } => (bytes, tag, backfill),
            other => {
                return Err(DaqError::Parse(format!(
                    "unexpected response for a binary instrument: {other:?}"
                )))
            }
        };
        let mut records = match &backfill {
            Some(backfill) => self.decode_backfill(backfill, at),
            None => Vec::new(),
        };
        match self.decode_live(&bytes, tag, at) {
            Ok(record) => {
                records.push(record);
                self.last_polled = Some(at);
            }
            Err(e) if records.is_empty() => return Err(e),
            Err(e) => tracing::warn!(instrument = %self.id, error = %e, "live reply rejected; keeping backfilled records"),
        }
        Ok(Decoded::records(records))
    }

    async fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.shutdown().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.channel.is_some()
    }
}
