//! Serial-text adapter for RS-232 instruments (e.g. Thermo 49C ozone analyzers).
//!
//! The line is opened 8N1 without flow control at the configured baud rate.
//! Every command is answered by one terminated ASCII response; `get_data`
//! responses are decoded as space-delimited fields in header order.

use super::text::{decode_lines, TextCodec, TextSession};
use super::{BoxedTransport, ChannelOpener, ConfigReport, ProtocolAdapter, RawResponse};
use crate::config::{Connection, InstrumentSpec};
use crate::core::Decoded;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Opens a tokio-serial stream with fixed 8N1 framing.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    port: String,
    baudrate: u32,
    timeout: Duration,
}

impl SerialOpener {
    /// Opener for `port` at `baudrate`.
    pub fn new(port: String, baudrate: u32, timeout: Duration) -> Self {
        Self {
            port,
            baudrate,
            timeout,
        }
    }
}

#[async_trait]
impl ChannelOpener for SerialOpener {
    #[cfg(feature = "instrument_serial")]
    async fn open(&self) -> AppResult<BoxedTransport> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(&self.port, self.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(std::io::Error::from)?;
        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn open(&self) -> AppResult<BoxedTransport> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baudrate)
    }
}

/// Command/response instrument on a serial line.
pub struct SerialTextAdapter {
    id: String,
    opener: Arc<dyn ChannelOpener>,
    codec: TextCodec,
    timeout: Duration,
    get_config: Vec<String>,
    get_data: Vec<String>,
    set_datetime: Vec<String>,
    session: Option<TextSession>,
}

impl SerialTextAdapter {
    /// Adapter for `spec`, opening its line through `opener`.
    pub fn new(spec: &InstrumentSpec, opener: Arc<dyn ChannelOpener>) -> AppResult<Self> {
        let timeout = match &spec.connection {
            Connection::Serial { timeout, .. } => *timeout,
            _ => {
                return Err(DaqError::Configuration(format!(
                    "instrument '{}' is not a serial instrument",
                    spec.id
                )))
            }
        };
        Ok(Self {
            id: spec.id.clone(),
            opener,
            codec: TextCodec::from_spec(spec, "\r")?,
            timeout,
            get_config: spec.get_config.clone(),
            get_data: spec.get_data.clone(),
            set_datetime: spec.set_datetime.clone(),
            session: None,
        })
    }

    fn session(&mut self) -> AppResult<&mut TextSession> {
        self.session.as_mut().ok_or(DaqError::NotConnected)
    }
}

#[async_trait]
impl ProtocolAdapter for SerialTextAdapter {
    fn instrument_id(&self) -> &str {
        &self.id
    }

    async fn connect(&mut self) -> AppResult<()> {
        let transport = self.opener.open().await?;
        tracing::debug!(instrument = %self.id, port = %self.opener.describe(), "serial line open");
        self.session = Some(TextSession::new(
            self.codec.clone(),
            transport,
            self.timeout,
            Duration::ZERO,
        ));
        Ok(())
    }

    async fn read_config(&mut self) -> AppResult<Vec<(String, String)>> {
        let commands = self.get_config.clone();
        self.session()?.read_config(&commands).await
    }

    async fn apply_config(&mut self, commands: &[String]) -> AppResult<ConfigReport> {
        self.session()?.apply_config(commands).await
    }

    async fn sync_clock(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        let templates = self.set_datetime.clone();
        self.session()?.sync_clock(&templates, now).await
    }

    async fn poll(&mut self, _at: DateTime<Utc>) -> AppResult<RawResponse> {
        let commands = self.get_data.clone();
        let line = self.session()?.poll_joined(&commands).await?;
        Ok(RawResponse::Lines(if line.is_empty() { vec![] } else { vec![line] }))
    }

    fn decode(&mut self, raw: RawResponse, at: DateTime<Utc>) -> AppResult<Decoded> {
        match raw {
            RawResponse::Lines(lines) => Ok(Decoded::records(decode_lines(&self.codec, &lines, at)?)),
            other => Err(DaqError::Parse(format!("unexpected response for a text instrument: {other:?}"))),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}
