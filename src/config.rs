//! Station configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `STATION_DAQ_` (nested keys split on `__`)
//!
//! Durations are written as human-readable strings (`"10m"`, `"1s"`).
//!
//! # Example
//! ```no_run
//! use station_daq::config::StationConfig;
//!
//! let config = StationConfig::load_from("config/station.toml")?;
//! config.validate().map_err(station_daq::DaqError::Configuration)?;
//! println!("Station: {}", config.application.name);
//! # Ok::<(), station_daq::DaqError>(())
//! ```

use crate::error::AppResult;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "STATION_DAQ_";

/// Most parameters a binary-register instrument accepts in one request.
pub const MAX_BINARY_PARAMETERS: usize = 32;

/// Top-level station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Staging, data and log roots
    pub paths: PathsConfig,
    /// Resolution of the timestamp encoded in staged file names
    #[serde(with = "humantime_serde", default = "default_reporting_interval")]
    pub reporting_interval: Duration,
    /// Worker and scheduler tuning
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Archive transfer cadence and retry policy
    #[serde(default)]
    pub transfer: TransferConfig,
    /// SFTP destination (required when transfer is enabled)
    #[serde(default)]
    pub sftp: Option<SftpConfig>,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentSpec>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Station name, used in log output
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human-oriented output
    Pretty,
    /// Single-line output
    #[default]
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Filesystem roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Hand-off directory between staging and transfer
    pub staging: PathBuf,
    /// Local data root (archive copies, harvest ledgers)
    pub data: PathBuf,
    /// Log root
    pub logs: PathBuf,
}

impl PathsConfig {
    /// Copy with a leading `~/` expanded to the home directory.
    pub fn resolved(&self) -> Self {
        Self {
            staging: expand_home(&self.staging),
            data: expand_home(&self.data),
            logs: expand_home(&self.logs),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// First retry delay
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Ceiling for the retry delay
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

/// Worker and scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// How long shutdown waits for in-flight I/O before aborting
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    /// A worker is stalled after this many polling intervals without a successful poll
    #[serde(default = "default_stall_factor")]
    pub stall_factor: u32,
    /// Reconnect backoff for instrument channels
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect: BackoffSettings,
    /// Consecutive handshake failures before escalation
    #[serde(default = "default_max_handshake_attempts")]
    pub max_handshake_attempts: u32,
    /// Consecutive staging failures before escalation
    #[serde(default = "default_staging_escalation")]
    pub staging_failure_escalation: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: default_shutdown_grace(),
            stall_factor: default_stall_factor(),
            reconnect: default_reconnect_backoff(),
            max_handshake_attempts: default_max_handshake_attempts(),
            staging_failure_escalation: default_staging_escalation(),
        }
    }
}

/// Archive transfer cadence and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Whether the transfer loop runs at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Transfer cycle cadence
    #[serde(with = "humantime_serde", default = "default_transfer_interval")]
    pub interval: Duration,
    /// Delay after each aligned boundary, so freshly staged files are picked up
    #[serde(with = "humantime_serde", default = "default_transfer_offset")]
    pub offset: Duration,
    /// Failed attempts before a file is flagged for manual intervention
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-file retry backoff
    #[serde(default = "default_transfer_backoff")]
    pub backoff: BackoffSettings,
    /// Retry cadence for flagged files
    #[serde(with = "humantime_serde", default = "default_flagged_retry")]
    pub flagged_retry_interval: Duration,
    /// Idle SFTP sessions kept between cycles
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval: default_transfer_interval(),
            offset: default_transfer_offset(),
            max_attempts: default_max_attempts(),
            backoff: default_transfer_backoff(),
            flagged_retry_interval: default_flagged_retry(),
            pool_size: default_pool_size(),
        }
    }
}

/// SFTP destination, public-key authentication only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    /// Archive host
    pub host: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Remote user
    pub username: String,
    /// Private key file
    pub key_path: PathBuf,
    /// Passphrase for an encrypted private key
    #[serde(default, skip_serializing)]
    pub key_passphrase: Option<String>,
    /// Per-station root on the archive host
    pub remote_root: String,
    /// TCP connect and session timeout
    #[serde(with = "humantime_serde", default = "default_sftp_timeout")]
    pub timeout: Duration,
    /// Optional SOCKS5 proxy
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

/// SOCKS5 proxy endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
}

/// Immutable per-instrument configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Unique logical identifier, also the staging sub-directory
    pub id: String,
    /// Instrument type (e.g. "TEI49C", "AE33", "NE300", "G2401")
    #[serde(rename = "type")]
    pub kind: String,
    /// Manufacturer serial number
    #[serde(default)]
    pub serial_number: String,
    /// Whether this instrument is collected
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How to reach the instrument
    pub connection: Connection,
    /// Commands whose responses are logged after connect
    #[serde(default)]
    pub get_config: Vec<String>,
    /// Commands sent in order while configuring
    #[serde(default)]
    pub set_config: Vec<String>,
    /// Query commands sent on each sampling tick
    #[serde(default)]
    pub get_data: Vec<String>,
    /// strftime templates that set the instrument clock after configuration
    #[serde(default)]
    pub set_datetime: Vec<String>,
    /// Column names in response order
    #[serde(default)]
    pub data_header: Vec<String>,
    /// Polling cadence (`get_data_interval` is accepted as an alias)
    #[serde(with = "humantime_serde", default = "default_sampling_interval", alias = "get_data_interval")]
    pub sampling_interval: Duration,
    /// Interval file length
    #[serde(with = "humantime_serde", default = "default_staging_interval")]
    pub staging_interval: Duration,
    /// Compress staged files
    #[serde(default)]
    pub staging_zip: bool,
    /// Keep an uncompressed copy of every interval file under the data root
    #[serde(default)]
    pub archive: bool,
    /// File name prefix (defaults to the id)
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// File extension for interval files
    #[serde(default = "default_extension")]
    pub file_extension: String,
    /// Field separator in interval files (one byte)
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Text framing and acceptance rules
    #[serde(default)]
    pub text: TextProtocol,
    /// Incremental row fetch for socket instruments with an internal table
    #[serde(default)]
    pub cursor: Option<CursorQuery>,
    /// Zero/span overlay for binary-register instruments
    #[serde(default)]
    pub calibration: Option<CalibrationSettings>,
}

impl InstrumentSpec {
    /// Prefix used for staged file names.
    pub fn prefix(&self) -> &str {
        self.file_prefix.as_deref().unwrap_or(&self.id)
    }

    /// Separator as the single delimiter byte interval files are written with.
    pub fn delimiter(&self) -> u8 {
        match self.separator.as_bytes() {
            [byte] => *byte,
            _ => b' ',
        }
    }

    /// Whether the instrument is harvested rather than polled.
    pub fn is_passive(&self) -> bool {
        matches!(self.connection, Connection::Filesystem { .. })
    }

    /// Column names written to interval files, after the timestamp column.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = match &self.connection {
            Connection::Binary {
                parameter_ids,
                wavelengths,
                angles,
                ..
            } if self.data_header.is_empty() => parameter_ids
                .iter()
                .zip(wavelengths)
                .zip(angles)
                .map(|((base, wl), angle)| format!("p{}", parameter_id(*base, *wl, *angle)))
                .collect(),
            _ => self.data_header.clone(),
        };
        if self.calibration.is_some() {
            columns.push("operation".to_string());
        }
        columns
    }
}

/// Parameter id from base id, wavelength and angle.
pub fn parameter_id(base: u32, wavelength: u32, angle: u32) -> u32 {
    base * 1_000_000 + wavelength * 1_000 + angle
}

/// Connection descriptor, tagged by `protocol`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Connection {
    /// RS-232 line, fixed 8N1 framing
    Serial {
        /// Device path (e.g. /dev/ttyUSB0)
        port: String,
        /// Baud rate
        #[serde(default = "default_baudrate")]
        baudrate: u32,
        /// Per-read timeout
        #[serde(with = "humantime_serde", default = "default_serial_timeout")]
        timeout: Duration,
    },
    /// Plain TCP with ASCII commands
    Socket {
        /// Instrument host
        host: String,
        /// Instrument port
        port: u16,
        /// Connect and read timeout
        #[serde(with = "humantime_serde", default = "default_socket_timeout")]
        timeout: Duration,
        /// Pause between writing a command and reading its response
        #[serde(with = "humantime_serde", default = "default_socket_sleep")]
        sleep: Duration,
    },
    /// Plain TCP with checksummed binary frames
    Binary {
        /// Instrument host
        host: String,
        /// Instrument port
        port: u16,
        /// Connect and read timeout
        #[serde(with = "humantime_serde", default = "default_socket_timeout")]
        timeout: Duration,
        /// Instrument serial id placed in each frame
        #[serde(default)]
        serial_id: u8,
        /// Base parameter ids
        parameter_ids: Vec<u32>,
        /// Wavelengths, one per parameter
        wavelengths: Vec<u32>,
        /// Angles, one per parameter
        angles: Vec<u32>,
        /// Set the instrument clock after connecting
        #[serde(default)]
        sync_clock: bool,
        /// After a reconnect, fill the outage from the instrument's data log
        #[serde(default = "default_enabled")]
        backfill: bool,
    },
    /// Local directory or mounted network share
    Filesystem {
        /// Directory harvested on each scan
        source: PathBuf,
        /// Directory layout below `source`
        #[serde(default)]
        layout: SourceLayout,
        /// Only files modified within this many days are considered
        #[serde(default = "default_days_to_sync")]
        days_to_sync: u32,
        /// File name filter (regex)
        #[serde(default)]
        pattern: Option<String>,
        /// A file older than this is complete even on first sight
        #[serde(with = "humantime_serde", default = "default_settle_time")]
        settle_time: Duration,
    },
}

/// Layout of a harvested source directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLayout {
    /// Files directly under the source
    #[default]
    Flat,
    /// `YYYY/MM/DD` sub-directories
    Daily,
    /// `YYYY/MM/DD/HH` sub-directories
    Hourly,
}

/// Text framing and acceptance rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextProtocol {
    /// Appended to every command (serial default `\r`, socket default `\r\n`)
    #[serde(default)]
    pub command_terminator: Option<String>,
    /// Marks the end of a response
    #[serde(default = "default_response_terminator")]
    pub response_terminator: String,
    /// Multi-drop device id, sent as a prefix byte `id + 128`
    #[serde(default)]
    pub device_id: Option<u8>,
    /// Everything from this character on is a checksum and is dropped
    #[serde(default)]
    pub checksum_delimiter: Option<char>,
    /// Drop an echo of the command from the response
    #[serde(default = "default_enabled")]
    pub strip_echo: bool,
    /// Prompt printed by the instrument (e.g. "AE33>")
    #[serde(default)]
    pub prompt: Option<String>,
    /// Responses matching any of these are rejections
    #[serde(default = "default_reject_patterns")]
    pub reject_patterns: Vec<String>,
    /// Responses matching any of these are unrecoverable faults
    #[serde(default)]
    pub fault_patterns: Vec<String>,
}

impl Default for TextProtocol {
    fn default() -> Self {
        Self {
            command_terminator: None,
            response_terminator: default_response_terminator(),
            device_id: None,
            checksum_delimiter: None,
            strip_echo: true,
            prompt: None,
            reject_patterns: default_reject_patterns(),
            fault_patterns: Vec::new(),
        }
    }
}

/// Incremental row fetch against an instrument-side table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorQuery {
    /// Command returning the newest row id (e.g. "MAXID Data")
    pub max_id: String,
    /// Command template with `{begin}` and `{end}` (e.g. "FETCH Data {begin} {end}")
    pub fetch: String,
}

/// Zero/span overlay settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Cadence of the zero/span cycle, aligned to the wall clock
    #[serde(with = "humantime_serde")]
    pub zero_span_check_interval: Duration,
    /// Length of the zero check
    #[serde(with = "humantime_serde")]
    pub zero_check_duration: Duration,
    /// Length of the span check (zero skips it)
    #[serde(with = "humantime_serde")]
    pub span_check_duration: Duration,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_reporting_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_stall_factor() -> u32 {
    3
}

fn default_reconnect_backoff() -> BackoffSettings {
    BackoffSettings {
        base: Duration::from_secs(5),
        max: Duration::from_secs(300),
    }
}

fn default_max_handshake_attempts() -> u32 {
    5
}

fn default_staging_escalation() -> u32 {
    3
}

fn default_enabled() -> bool {
    true
}

fn default_transfer_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_transfer_offset() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    10
}

fn default_transfer_backoff() -> BackoffSettings {
    BackoffSettings {
        base: Duration::from_secs(30),
        max: Duration::from_secs(1800),
    }
}

fn default_flagged_retry() -> Duration {
    Duration::from_secs(3600)
}

fn default_pool_size() -> usize {
    1
}

fn default_ssh_port() -> u16 {
    22
}

fn default_sftp_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sampling_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_staging_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_extension() -> String {
    "dat".to_string()
}

fn default_separator() -> String {
    " ".to_string()
}

fn default_baudrate() -> u32 {
    9600
}

fn default_serial_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_socket_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_socket_sleep() -> Duration {
    Duration::from_millis(500)
}

fn default_days_to_sync() -> u32 {
    1
}

fn default_settle_time() -> Duration {
    Duration::from_secs(600)
}

fn default_response_terminator() -> String {
    "\r".to_string()
}

fn default_reject_patterns() -> Vec<String> {
    vec![
        "(?i)bad cmd".to_string(),
        "(?i)invalid".to_string(),
        "(?i)error".to_string(),
    ]
}

impl StationConfig {
    /// Load configuration from a specific file path
    ///
    /// Environment variables can override configuration with prefix `STATION_DAQ_`.
    /// Example: `STATION_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Load configuration from TOML text, still honouring environment overrides
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(text)))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let mut config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.paths = config.paths.resolved();
        if let Some(sftp) = config.sftp.as_mut() {
            sftp.key_path = expand_home(&sftp.key_path);
        }
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.reporting_interval < Duration::from_secs(60) {
            return Err("reporting_interval must be at least one minute".to_string());
        }

        let mut ids = HashSet::new();
        for spec in &self.instruments {
            if spec.id.trim().is_empty() {
                return Err("Instrument id must not be empty".to_string());
            }
            if spec.id.contains(['/', '\\']) || spec.id.starts_with('.') {
                return Err(format!("Instrument id '{}' is not a valid directory name", spec.id));
            }
            if !ids.insert(&spec.id) {
                return Err(format!("Duplicate instrument ID: {}", spec.id));
            }
            if spec.enabled {
                self.validate_instrument(spec)
                    .map_err(|e| format!("Instrument '{}': {}", spec.id, e))?;
            }
        }

        if self.transfer.enabled {
            let sftp = self
                .sftp
                .as_ref()
                .ok_or_else(|| "transfer is enabled but no [sftp] section is configured".to_string())?;
            if sftp.host.is_empty() || sftp.username.is_empty() {
                return Err("sftp host and username must be set".to_string());
            }
            if sftp.remote_root.is_empty() {
                return Err("sftp remote_root must be set".to_string());
            }
            if self.transfer.max_attempts == 0 {
                return Err("transfer max_attempts must be at least 1".to_string());
            }
            if self.transfer.interval.is_zero() {
                return Err("transfer interval must be greater than zero".to_string());
            }
        }

        Ok(())
    }

    fn validate_instrument(&self, spec: &InstrumentSpec) -> Result<(), String> {
        if spec.sampling_interval.is_zero() || spec.staging_interval.is_zero() {
            return Err("intervals must be greater than zero".to_string());
        }
        if spec.staging_interval.as_secs() % self.reporting_interval.as_secs() != 0 {
            return Err(format!(
                "staging_interval {:?} is not a multiple of reporting_interval {:?}",
                spec.staging_interval, self.reporting_interval
            ));
        }
        if !spec.is_passive() && spec.staging_interval.as_millis() % spec.sampling_interval.as_millis() != 0 {
            return Err(format!(
                "staging_interval {:?} is not a multiple of sampling_interval {:?}",
                spec.staging_interval, spec.sampling_interval
            ));
        }
        if spec.separator.len() != 1 {
            return Err(format!("separator '{}' must be a single byte", spec.separator));
        }
        for pattern in spec.text.reject_patterns.iter().chain(&spec.text.fault_patterns) {
            regex::Regex::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
        }

        match &spec.connection {
            Connection::Serial { port, baudrate, .. } => {
                if port.is_empty() || *baudrate == 0 {
                    return Err("serial port and baudrate must be set".to_string());
                }
                validate_text(spec)
            }
            Connection::Socket { host, port, .. } => {
                if host.is_empty() || *port == 0 {
                    return Err("socket host and port must be set".to_string());
                }
                validate_text(spec)
            }
            Connection::Binary {
                parameter_ids,
                wavelengths,
                angles,
                ..
            } => {
                if parameter_ids.is_empty() {
                    return Err("binary instruments need at least one parameter".to_string());
                }
                if parameter_ids.len() != wavelengths.len() || parameter_ids.len() != angles.len() {
                    return Err("parameter_ids, wavelengths and angles must have equal length".to_string());
                }
                if parameter_ids.len() > MAX_BINARY_PARAMETERS {
                    return Err(format!("at most {MAX_BINARY_PARAMETERS} parameters per request"));
                }
                if !spec.data_header.is_empty() && spec.data_header.len() != parameter_ids.len() {
                    return Err("data_header must name every parameter".to_string());
                }
                if let Some(cal) = &spec.calibration {
                    if cal.zero_check_duration.is_zero() {
                        return Err("zero_check_duration must be greater than zero".to_string());
                    }
                    if cal.zero_check_duration + cal.span_check_duration >= cal.zero_span_check_interval {
                        return Err("zero and span checks must fit inside zero_span_check_interval".to_string());
                    }
                }
                Ok(())
            }
            Connection::Filesystem { source, pattern, .. } => {
                if source.as_os_str().is_empty() {
                    return Err("filesystem source must be set".to_string());
                }
                if let Some(pattern) = pattern {
                    regex::Regex::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))?;
                }
                Ok(())
            }
        }
    }

    /// Get enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentSpec> {
        self.instruments.iter().filter(|i| i.enabled).collect()
    }
}

fn validate_text(spec: &InstrumentSpec) -> Result<(), String> {
    if spec.data_header.is_empty() {
        return Err("data_header must list the response columns".to_string());
    }
    if spec.get_data.is_empty() && spec.cursor.is_none() {
        return Err("get_data must contain at least one query command".to_string());
    }
    if spec.calibration.is_some() {
        return Err("calibration overlay is only supported for binary instruments".to_string());
    }
    Ok(())
}
