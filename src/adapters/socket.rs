//! Socket-text adapter for instruments with an ASCII TCP interface (e.g. the
//! Magee AE33 aethalometer).
//!
//! The connection is kept open between polls. A slow instrument gets a pause
//! between each command and the read of its answer. A read timeout or an empty
//! read (peer closed, half-open socket) drops the connection immediately so
//! the worker reconnects on its next tick.
//!
//! With a [`CursorQuery`] configured the adapter reads the instrument's
//! internal data table incrementally: it asks for the newest row id, fetches
//! every row after the last one it saw, and decodes each row as a record.

use super::text::{decode_lines, TextCodec, TextSession};
use super::{BoxedTransport, ChannelOpener, ConfigReport, ProtocolAdapter, RawResponse};
use crate::config::{Connection, CursorQuery, InstrumentSpec};
use crate::core::Decoded;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Opens a TCP connection with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpOpener {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpOpener {
    /// Opener for `host:port`.
    pub fn new(host: String, port: u16, timeout: Duration) -> Self {
        Self { host, port, timeout }
    }
}

#[async_trait]
impl ChannelOpener for TcpOpener {
    async fn open(&self) -> AppResult<BoxedTransport> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| DaqError::timeout(format!("connect to {}", self.describe()), self.timeout))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Command/response instrument on a TCP socket.
pub struct SocketTextAdapter {
    id: String,
    opener: Arc<dyn ChannelOpener>,
    codec: TextCodec,
    timeout: Duration,
    sleep: Duration,
    get_config: Vec<String>,
    get_data: Vec<String>,
    set_datetime: Vec<String>,
    cursor: Option<CursorQuery>,
    next_row: Option<u64>,
    session: Option<TextSession>,
}

impl SocketTextAdapter {
    /// Adapter for `spec`, connecting through `opener`.
    pub fn new(spec: &InstrumentSpec, opener: Arc<dyn ChannelOpener>) -> AppResult<Self> {
        let (timeout, sleep) = match &spec.connection {
            Connection::Socket { timeout, sleep, .. } => (*timeout, *sleep),
            _ => {
                return Err(DaqError::Configuration(format!(
                    "instrument '{}' is not a socket instrument",
                    spec.id
                )))
            }
        };
        Ok(Self {
            id: spec.id.clone(),
            opener,
            codec: TextCodec::from_spec(spec, "\r\n")?,
            timeout,
            sleep,
            get_config: spec.get_config.clone(),
            get_data: spec.get_data.clone(),
            set_datetime: spec.set_datetime.clone(),
            cursor: spec.cursor.clone(),
            next_row: None,
            session: None,
        })
    }

    /// Row id the next incremental fetch starts at.
    pub fn next_row(&self) -> Option<u64> {
        self.next_row
    }

    fn session(&mut self) -> AppResult<&mut TextSession> {
        self.session.as_mut().ok_or(DaqError::NotConnected)
    }

    // A failed exchange leaves the socket in an unknown state.
    async fn guard<T>(&mut self, result: AppResult<T>) -> AppResult<T> {
        if let Err(e) = &result {
            if e.is_transient() {
                tracing::debug!(instrument = %self.id, error = %e, "dropping socket");
                self.disconnect().await;
            }
        }
        result
    }

    async fn fetch_rows(&mut self, cursor: &CursorQuery) -> AppResult<Vec<String>> {
        let session = self.session()?;
        let reply = session.query(&cursor.max_id).await?;
        let max_id: u64 = reply
            .split_whitespace()
            .last()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| DaqError::Parse(format!("no row id in {:?}", reply)))?;

        // First contact starts at the newest row instead of replaying history.
        let begin = self.next_row.unwrap_or(max_id);
        if max_id < begin {
            return Ok(Vec::new());
        }
        let mut vars = HashMap::new();
        vars.insert("begin".to_string(), begin.to_string());
        vars.insert("end".to_string(), max_id.to_string());
        let command = strfmt::strfmt(&cursor.fetch, &vars)
            .map_err(|e| DaqError::Configuration(format!("bad fetch template {:?}: {e}", cursor.fetch)))?;

        let rows = self.session()?.query_lines(&command).await?;
        self.next_row = Some(max_id + 1);
        Ok(rows)
    }
}

#[async_trait]
impl ProtocolAdapter for SocketTextAdapter {
    fn instrument_id(&self) -> &str {
        &self.id
    }

    async fn connect(&mut self) -> AppResult<()> {
        let transport = self.opener.open().await?;
        tracing::debug!(instrument = %self.id, endpoint = %self.opener.describe(), "socket open");
        self.session = Some(TextSession::new(
            self.codec.clone(),
            transport,
            self.timeout,
            self.sleep,
        ));
        Ok(())
    }

    async fn read_config(&mut self) -> AppResult<Vec<(String, String)>> {
        let commands = self.get_config.clone();
        let result = match self.session() {
            Ok(session) => session.read_config(&commands).await,
            Err(e) => Err(e),
        };
        self.guard(result).await
    }

    async fn apply_config(&mut self, commands: &[String]) -> AppResult<ConfigReport> {
        let result = match self.session() {
            Ok(session) => session.apply_config(commands).await,
            Err(e) => Err(e),
        };
        self.guard(result).await
    }

    async fn sync_clock(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        let templates = self.set_datetime.clone();
        let result = match self.session() {
            Ok(session) => session.sync_clock(&templates, now).await,
            Err(e) => Err(e),
        };
        self.guard(result).await
    }

    async fn poll(&mut self, _at: DateTime<Utc>) -> AppResult<RawResponse> {
        let result = match self.cursor.clone() {
            Some(cursor) => self.fetch_rows(&cursor).await,
            None => {
                let commands = self.get_data.clone();
                match self.session() {
                    Ok(session) => session
                        .poll_joined(&commands)
                        .await
                        .map(|line| if line.is_empty() { vec![] } else { vec![line] }),
                    Err(e) => Err(e),
                }
            }
        };
        self.guard(result).await.map(RawResponse::Lines)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TextProtocol;
    use crate::core::FieldValue;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn ae33(port: u16, cursor: Option<CursorQuery>) -> InstrumentSpec {
        InstrumentSpec {
            id: "ae33".into(),
            kind: "AE33".into(),
            serial_number: "AE33-S10-01234".into(),
            enabled: true,
            connection: Connection::Socket {
                host: "127.0.0.1".into(),
                port,
                timeout: Duration::from_millis(500),
                sleep: Duration::from_millis(10),
            },
            get_config: vec![],
            set_config: vec![],
            get_data: vec!["$AE33:D1".into()],
            set_datetime: vec![],
            data_header: vec!["id".into(), "bc1".into(), "bc6".into()],
            sampling_interval: Duration::from_secs(60),
            staging_interval: Duration::from_secs(600),
            staging_zip: false,
            archive: false,
            file_prefix: None,
            file_extension: "dat".into(),
            separator: " ".into(),
            text: TextProtocol {
                prompt: Some("AE33>".into()),
                ..Default::default()
            },
            cursor,
            calibration: None,
        }
    }

    #[tokio::test]
    async fn cursor_fetches_only_new_rows() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut max_id = 100;
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end_matches('\r').to_string();
                let reply = if line == "MAXID Data" {
                    max_id += 2;
                    format!("AE33>{max_id}\r")
                } else if let Some(range) = line.strip_prefix("FETCH Data ") {
                    let mut parts = range.split(' ').map(|p| p.parse::<u64>().unwrap());
                    let (begin, end) = (parts.next().unwrap(), parts.next().unwrap());
                    let rows: Vec<String> = (begin..=end).map(|id| format!("{id} 1520 980")).collect();
                    format!("{}\r", rows.join("\n"))
                } else {
                    "bad cmd\r".to_string()
                };
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let cursor = CursorQuery {
            max_id: "MAXID Data".into(),
            fetch: "FETCH Data {begin} {end}".into(),
        };
        let spec = ae33(port, Some(cursor));
        let opener = Arc::new(TcpOpener::new("127.0.0.1".into(), port, Duration::from_secs(1)));
        let mut adapter = SocketTextAdapter::new(&spec, opener).unwrap();
        adapter.connect().await.unwrap();

        let at = Utc::now();
        let first = adapter.poll(at).await.unwrap();
        let first = adapter.decode(first, at).unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].field("id"), Some(&FieldValue::Integer(102)));
        assert_eq!(adapter.next_row(), Some(103));

        let second = adapter.poll(at).await.unwrap();
        let ids: Vec<_> = adapter
            .decode(second, at)
            .unwrap()
            .records
            .iter()
            .map(|r| r.field("id").cloned())
            .collect();
        assert_eq!(ids, vec![Some(FieldValue::Integer(103)), Some(FieldValue::Integer(104))]);

        adapter.disconnect().await;
        server.abort();
    }

    #[tokio::test]
    async fn closed_peer_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let spec = ae33(port, None);
        let opener = Arc::new(TcpOpener::new("127.0.0.1".into(), port, Duration::from_secs(1)));
        let mut adapter = SocketTextAdapter::new(&spec, opener).unwrap();
        adapter.connect().await.unwrap();
        server.await.unwrap();

        let err = adapter.poll(Utc::now()).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error {err}");
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let spec = ae33(port, None);
        let opener = Arc::new(TcpOpener::new("127.0.0.1".into(), port, Duration::from_secs(1)));
        let mut adapter = SocketTextAdapter::new(&spec, opener).unwrap();
        adapter.connect().await.unwrap();

        let err = adapter.poll(Utc::now()).await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }));
        assert!(!adapter.is_connected());
        server.abort();
    }
}
