//! Shared ASCII command/response handling for serial and socket instruments.
//!
//! [`TextCodec`] knows the instrument's framing (terminators, multi-drop id,
//! checksum, echo, prompt) and how to decide whether a command was accepted.
//! [`LineChannel`] reads terminated responses from any transport with a deadline.

use super::BoxedTransport;
use crate::config::InstrumentSpec;
use crate::core::{FieldValue, Record};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// Framing, tidying and acceptance rules for one text instrument.
#[derive(Debug, Clone)]
pub struct TextCodec {
    command_terminator: String,
    response_terminator: Vec<u8>,
    device_id: Option<u8>,
    checksum_delimiter: Option<char>,
    strip_echo: bool,
    prompt: Option<String>,
    reject: Vec<Regex>,
    fault: Vec<Regex>,
    header: Vec<String>,
}

fn compile(patterns: &[String]) -> AppResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| DaqError::Configuration(format!("invalid pattern '{p}': {e}"))))
        .collect()
}

impl TextCodec {
    /// Codec for `spec`, using `default_terminator` unless the instrument overrides it.
    pub fn from_spec(spec: &InstrumentSpec, default_terminator: &str) -> AppResult<Self> {
        let text = &spec.text;
        if text.response_terminator.is_empty() {
            return Err(DaqError::Configuration(format!(
                "instrument '{}' has an empty response terminator",
                spec.id
            )));
        }
        Ok(Self {
            command_terminator: text
                .command_terminator
                .clone()
                .unwrap_or_else(|| default_terminator.to_string()),
            response_terminator: text.response_terminator.as_bytes().to_vec(),
            device_id: text.device_id,
            checksum_delimiter: text.checksum_delimiter,
            strip_echo: text.strip_echo,
            prompt: text.prompt.clone(),
            reject: compile(&text.reject_patterns)?,
            fault: compile(&text.fault_patterns)?,
            header: spec.data_header.clone(),
        })
    }

    /// Bytes to write for `command`.
    pub fn frame_command(&self, command: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(command.len() + 3);
        if let Some(id) = self.device_id {
            bytes.push(id.wrapping_add(128));
        }
        bytes.extend_from_slice(command.as_bytes());
        bytes.extend_from_slice(self.command_terminator.as_bytes());
        bytes
    }

    /// Response terminator.
    pub fn terminator(&self) -> &[u8] {
        &self.response_terminator
    }

    /// Clean a raw response into non-empty lines.
    pub fn tidy(&self, command: &str, raw: &str) -> Vec<String> {
        let mut text = raw.to_string();
        if let Some(prompt) = &self.prompt {
            text = text.replace(prompt.as_str(), "");
        }
        let terminator = String::from_utf8_lossy(&self.response_terminator);
        if !terminator.trim().is_empty() {
            text = text.replace(terminator.as_ref(), "");
        }
        text.split(['\r', '\n'])
            .filter_map(|line| self.tidy_line(command, line))
            .collect()
    }

    fn tidy_line(&self, command: &str, line: &str) -> Option<String> {
        // multi-drop id bytes and other control characters
        let mut line: String = line.chars().filter(|c| !c.is_control() && (*c as u32) < 0x80).collect();
        if let Some(delimiter) = self.checksum_delimiter {
            if let Some(pos) = line.find(delimiter) {
                line.truncate(pos);
            }
        }
        let mut line = line.trim();
        if self.strip_echo && !command.is_empty() {
            if let Some(rest) = line.strip_prefix(command) {
                line = rest.trim_start();
            }
        }
        let line = line.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    /// Classify a tidied response to a configuration command.
    pub fn check_acceptance(&self, command: &str, response: &str) -> AppResult<()> {
        if self.fault.iter().any(|re| re.is_match(response)) {
            return Err(DaqError::InstrumentFault {
                command: command.to_string(),
                response: response.to_string(),
            });
        }
        if self.reject.iter().any(|re| re.is_match(response)) {
            return Err(DaqError::CommandRejected {
                command: command.to_string(),
                response: response.to_string(),
            });
        }
        Ok(())
    }

    /// Decode a space-delimited line against the declared header.
    pub fn decode_line(&self, line: &str, at: DateTime<Utc>) -> AppResult<Record> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != self.header.len() {
            return Err(DaqError::Parse(format!(
                "expected {} fields, got {} in {:?}",
                self.header.len(),
                tokens.len(),
                line
            )));
        }
        let values = tokens.into_iter().map(FieldValue::parse).collect();
        Ok(Record::new(at, &self.header, values, line))
    }
}

/// Terminated-response reader over any transport.
pub struct LineChannel {
    transport: BoxedTransport,
    pending: Vec<u8>,
}

impl std::fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineChannel")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl LineChannel {
    /// Wrap an open transport.
    pub fn new(transport: BoxedTransport) -> Self {
        Self {
            transport,
            pending: Vec::new(),
        }
    }

    /// Drop unread bytes (late replies to an earlier command).
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Write and flush.
    pub async fn write_all(&mut self, bytes: &[u8], limit: Duration) -> AppResult<()> {
        let write = async {
            self.transport.write_all(bytes).await?;
            self.transport.flush().await
        };
        match tokio::time::timeout(limit, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DaqError::timeout("write command", limit)),
        }
    }

    /// Read until `terminator`, returning the text before it.
    ///
    /// An empty read means the peer closed the channel.
    pub async fn read_until(&mut self, terminator: &[u8], limit: Duration) -> AppResult<String> {
        let deadline = Instant::now() + limit;
        let mut chunk = [0u8; 512];
        loop {
            if let Some(pos) = find(&self.pending, terminator) {
                let line: Vec<u8> = self.pending.drain(..pos + terminator.len()).take(pos).collect();
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            let n = match tokio::time::timeout_at(deadline, self.transport.read(&mut chunk)).await {
                Ok(result) => result?,
                Err(_) => return Err(DaqError::timeout("read response", limit)),
            };
            if n == 0 {
                return Err(DaqError::ConnectionClosed);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Shut the transport down.
    pub async fn close(mut self) {
        let _ = self.transport.shutdown().await;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// An open text channel plus the codec that frames it.
#[derive(Debug)]
pub struct TextSession {
    /// Framing rules
    pub codec: TextCodec,
    channel: LineChannel,
    timeout: Duration,
    settle: Duration,
}

impl TextSession {
    /// Session over an open transport. `settle` is slept between writing a
    /// command and reading its answer.
    pub fn new(codec: TextCodec, transport: BoxedTransport, timeout: Duration, settle: Duration) -> Self {
        Self {
            codec,
            channel: LineChannel::new(transport),
            timeout,
            settle,
        }
    }

    /// Send one command and return its tidied response lines.
    pub async fn query_lines(&mut self, command: &str) -> AppResult<Vec<String>> {
        self.channel.discard_pending();
        let framed = self.codec.frame_command(command);
        self.channel.write_all(&framed, self.timeout).await?;
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        let raw = self
            .channel
            .read_until(self.codec.terminator(), self.timeout)
            .await?;
        Ok(self.codec.tidy(command, &raw))
    }

    /// Send one command and return its tidied response as a single line.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        Ok(self.query_lines(command).await?.join(" "))
    }

    /// Send `get_config` queries, returning each response.
    pub async fn read_config(&mut self, commands: &[String]) -> AppResult<Vec<(String, String)>> {
        let mut responses = Vec::with_capacity(commands.len());
        for command in commands {
            let response = self.query(command).await?;
            responses.push((command.clone(), response));
        }
        Ok(responses)
    }

    /// Send `set_config` commands in order, isolating rejections.
    pub async fn apply_config(&mut self, commands: &[String]) -> AppResult<super::ConfigReport> {
        let mut report = super::ConfigReport::default();
        for command in commands {
            let response = self.query(command).await?;
            match self.codec.check_acceptance(command, &response) {
                Ok(()) => report.accepted.push(command.clone()),
                Err(e @ DaqError::CommandRejected { .. }) => report.rejected.push(e),
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Render strftime templates with `now` and send them.
    pub async fn sync_clock(&mut self, templates: &[String], now: DateTime<Utc>) -> AppResult<()> {
        for template in templates {
            let command = now.format(template).to_string();
            let response = self.query(&command).await?;
            if let Err(e) = self.codec.check_acceptance(&command, &response) {
                tracing::warn!(command = %command, error = %e, "clock sync command not accepted");
            }
        }
        Ok(())
    }

    /// Run each query and join the responses into one line.
    pub async fn poll_joined(&mut self, commands: &[String]) -> AppResult<String> {
        let mut parts = Vec::with_capacity(commands.len());
        for command in commands {
            let response = self.query(command).await?;
            if !response.is_empty() {
                parts.push(response);
            }
        }
        Ok(parts.join(" "))
    }

    /// Close the channel.
    pub async fn close(self) {
        self.channel.close().await;
    }
}

/// Decode every response line; a malformed line discards the whole response.
pub fn decode_lines(codec: &TextCodec, lines: &[String], at: DateTime<Utc>) -> AppResult<Vec<Record>> {
    lines.iter().map(|line| codec.decode_line(line, at)).collect()
}
