//! Protocol adapters.
//!
//! One adapter variant per protocol family. A worker drives its adapter
//! through the [`ProtocolAdapter`] trait and never looks at the wire format:
//!
//! - [`serial::SerialTextAdapter`]: RS-232 command/response with ASCII replies
//! - [`socket::SocketTextAdapter`]: the same text protocol over a kept-alive TCP socket
//! - [`binary::BinaryRegisterAdapter`]: checksummed binary frames addressed by parameter id,
//!   with a zero/span overlay
//! - [`filesystem::PassiveFilesystemAdapter`]: harvesting files from a directory or share
//!
//! Channels are opened through [`ChannelOpener`], so tests substitute the
//! in-memory port from [`mock_serial`] or a local TCP listener for real hardware.

use crate::config::{Connection, InstrumentSpec};
use crate::core::{Decoded, HarvestedFile, OperationState};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod acoem;
pub mod binary;
pub mod calibration;
pub mod filesystem;
pub mod mock_serial;
pub mod serial;
pub mod socket;
pub mod text;

pub use binary::BinaryRegisterAdapter;
pub use filesystem::PassiveFilesystemAdapter;
pub use serial::SerialTextAdapter;
pub use socket::SocketTextAdapter;

/// Byte stream to an instrument.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Boxed transport handed out by a [`ChannelOpener`].
pub type BoxedTransport = Box<dyn Transport>;

/// Opens the byte stream for one instrument.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Open a fresh channel.
    async fn open(&self) -> AppResult<BoxedTransport>;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

/// Undecoded result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    /// Tidied response lines, one record each
    Lines(Vec<String>),
    /// A binary response frame and the operation state it was taken in
    Frame {
        /// Complete frame, STX to EOT
        bytes: Vec<u8>,
        /// Overlay state at poll time
        tag: Option<OperationState>,
        /// Logged records covering a gap before this poll
        backfill: Option<Backfill>,
    },
    /// Files ready for harvesting
    Files(Vec<HarvestedFile>),
}

/// Logged-data replies fetched after a reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct Backfill {
    /// Time of the last record before the gap
    pub since: DateTime<Utc>,
    /// Validated replies, oldest window first
    pub frames: Vec<acoem::Frame>,
}

/// Outcome of sending a list of configuration commands.
#[derive(Debug, Default)]
pub struct ConfigReport {
    /// Commands the instrument accepted
    pub accepted: Vec<String>,
    /// Rejections (non-fatal)
    pub rejected: Vec<DaqError>,
}

/// Capability set every instrument protocol provides.
#[async_trait]
pub trait ProtocolAdapter: Send {
    /// Logical instrument id.
    fn instrument_id(&self) -> &str;

    /// Open the channel.
    async fn connect(&mut self) -> AppResult<()>;

    /// Send each `get_config` query and return `(command, response)` pairs.
    async fn read_config(&mut self) -> AppResult<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    /// Send configuration commands in order.
    ///
    /// A rejected command is reported in [`ConfigReport::rejected`]; an
    /// unrecoverable instrument fault fails the whole call.
    async fn apply_config(&mut self, commands: &[String]) -> AppResult<ConfigReport>;

    /// Set the instrument clock.
    async fn sync_clock(&mut self, _now: DateTime<Utc>) -> AppResult<()> {
        Ok(())
    }

    /// Start a single zero or span check now.
    ///
    /// Only adapters with a calibration overlay support this.
    fn force_check(&mut self, _check: OperationState, _now: DateTime<Utc>) -> AppResult<()> {
        Err(DaqError::Configuration(format!(
            "instrument '{}' has no calibration overlay",
            self.instrument_id()
        )))
    }

    /// Query the instrument once.
    async fn poll(&mut self, at: DateTime<Utc>) -> AppResult<RawResponse>;

    /// Turn a raw response into records or harvested files.
    fn decode(&mut self, raw: RawResponse, at: DateTime<Utc>) -> AppResult<Decoded>;

    /// Close the channel. Safe to call when already closed.
    async fn disconnect(&mut self);

    /// Whether a channel is open.
    fn is_connected(&self) -> bool;
}

/// Build the adapter variant matching an instrument's connection.
///
/// Passive-filesystem instruments need the harvest ledger the stager records
/// staged files in; other variants ignore it.
pub fn build_adapter(
    spec: &InstrumentSpec,
    ledger: Option<filesystem::HarvestLedger>,
) -> AppResult<Box<dyn ProtocolAdapter>> {
    let adapter: Box<dyn ProtocolAdapter> = match &spec.connection {
        Connection::Serial {
            port,
            baudrate,
            timeout,
        } => {
            let opener = Arc::new(serial::SerialOpener::new(port.clone(), *baudrate, *timeout));
            Box::new(SerialTextAdapter::new(spec, opener)?)
        }
        Connection::Socket { host, port, timeout, .. } => {
            let opener = Arc::new(socket::TcpOpener::new(host.clone(), *port, *timeout));
            Box::new(SocketTextAdapter::new(spec, opener)?)
        }
        Connection::Binary { host, port, timeout, .. } => {
            let opener = Arc::new(socket::TcpOpener::new(host.clone(), *port, *timeout));
            Box::new(BinaryRegisterAdapter::new(spec, opener)?)
        }
        Connection::Filesystem { .. } => {
            let ledger = ledger.ok_or_else(|| {
                DaqError::Configuration(format!("instrument '{}' needs a harvest ledger", spec.id))
            })?;
            Box::new(PassiveFilesystemAdapter::new(spec, ledger)?)
        }
    };
    Ok(adapter)
}
