//! Acoem binary frame protocol (Aurora / NE-300 nephelometers).
//!
//! ```text
//! | STX | SID | CMD | ETX | len (u16 BE) | data ... | XOR | EOT |
//! ```
//!
//! `XOR` is the exclusive-or of every byte before it. Requests and responses
//! carry 32-bit big-endian items; measurement parameters (id above 1000) are
//! IEEE-754 floats, everything else is an unsigned integer.
//!
//! The instrument also keeps its own data log. A logged-data reply is a run of
//! fixed-width records, each `kind, timestamp, interval, field count` followed
//! by the fields: a header record (kind 1) lists parameter ids, and the data
//! records (kind 0) after it carry their values in the same order.

use crate::core::FieldValue;
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

/// Start of text
pub const STX: u8 = 0x02;
/// End of text (closes the header)
pub const ETX: u8 = 0x03;
/// End of transmission
pub const EOT: u8 = 0x04;

/// Bytes before the payload: STX SID CMD ETX len_hi len_lo
pub const HEADER_LEN: usize = 6;

/// Instrument clock parameter
pub const PARAM_DATETIME: u32 = 1;
/// Current operation parameter (0 ambient, 1 zero, 2 span)
pub const PARAM_OPERATION: u32 = 4035;

/// Protocol commands used by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Instrument type and firmware version
    Identify = 1,
    /// Read parameter values
    GetValues = 4,
    /// Write one parameter value
    SetValue = 5,
    /// Parameter ids the internal logger records
    LoggingConfig = 6,
    /// Logged records between two instrument timestamps
    LoggedData = 7,
}

/// Words before the fields of a logged record.
const LOGGED_PREAMBLE: usize = 4;

const HEADER_RECORD: u32 = 1;
const DATA_RECORD: u32 = 0;

/// XOR of every byte.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Build a complete frame around `payload`.
pub fn encode_frame(serial_id: u8, command: Command, payload: &[u8]) -> AppResult<Vec<u8>> {
    let len = u16::try_from(payload.len())
        .map_err(|_| DaqError::Configuration(format!("payload of {} bytes is too long", payload.len())))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 2);
    frame.extend_from_slice(&[STX, serial_id, command as u8, ETX]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame.push(EOT);
    Ok(frame)
}

/// Frame reading the values of `parameters`, in order.
pub fn get_values(serial_id: u8, parameters: &[u32]) -> AppResult<Vec<u8>> {
    let payload: Vec<u8> = parameters.iter().flat_map(|p| p.to_be_bytes()).collect();
    encode_frame(serial_id, Command::GetValues, &payload)
}

/// Frame writing `value` to `parameter`.
pub fn set_value(serial_id: u8, parameter: u32, value: u32) -> AppResult<Vec<u8>> {
    let mut payload = parameter.to_be_bytes().to_vec();
    payload.extend_from_slice(&value.to_be_bytes());
    encode_frame(serial_id, Command::SetValue, &payload)
}

/// Frame asking for the logged records between `start` and `end`.
pub fn get_logged_data(serial_id: u8, start: DateTime<Utc>, end: DateTime<Utc>) -> AppResult<Vec<u8>> {
    let mut payload = encode_timestamp(start).to_be_bytes().to_vec();
    payload.extend_from_slice(&encode_timestamp(end).to_be_bytes());
    encode_frame(serial_id, Command::LoggedData, &payload)
}

/// Payload length announced by a frame header.
pub fn payload_len(header: &[u8]) -> AppResult<usize> {
    if header.len() < HEADER_LEN || header[0] != STX || header[3] != ETX {
        return Err(DaqError::Parse(format!("bad frame header {:02x?}", header)));
    }
    Ok(usize::from(u16::from_be_bytes([header[4], header[5]])))
}

/// A validated response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Serial id of the responding instrument
    pub serial_id: u8,
    /// Command the frame answers
    pub command: u8,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Payload as 32-bit big-endian items.
    pub fn items(&self) -> AppResult<Vec<u32>> {
        if self.payload.len() % 4 != 0 {
            return Err(DaqError::Parse(format!(
                "payload of {} bytes is not a whole number of items",
                self.payload.len()
            )));
        }
        Ok(self
            .payload
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Parameter ids listed in a logging-configuration reply.
pub fn logged_parameters(frame: &Frame) -> AppResult<Vec<u32>> {
    let items = frame.items()?;
    let Some((&count, ids)) = items.split_first() else {
        return Err(DaqError::Parse("empty logging configuration".to_string()));
    };
    let count = count as usize;
    if ids.len() < count {
        return Err(DaqError::Parse(format!(
            "logging configuration announces {count} parameters, carries {}",
            ids.len()
        )));
    }
    Ok(ids[..count].to_vec())
}

/// One data record of the instrument's own log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRow {
    /// Instrument time of the record
    pub timestamp: DateTime<Utc>,
    /// Logging interval in seconds
    pub interval: u32,
    /// `(parameter id, raw item)` pairs
    pub values: Vec<(u32, u32)>,
}

impl LoggedRow {
    /// Raw item logged for `parameter`.
    pub fn value(&self, parameter: u32) -> Option<u32> {
        self.values.iter().find(|(p, _)| *p == parameter).map(|(_, v)| *v)
    }
}

/// Data records of a logged-data reply, named by the header record before them.
///
/// Trailing words that do not fill a whole record are ignored.
pub fn decode_logged_data(frame: &Frame) -> AppResult<Vec<LoggedRow>> {
    let items = frame.items()?;
    if items.is_empty() {
        return Ok(Vec::new());
    }
    if items.len() < LOGGED_PREAMBLE {
        return Err(DaqError::Parse(format!("logged data of {} items has no record", items.len())));
    }
    let width = LOGGED_PREAMBLE + items[3] as usize;

    let mut keys: Vec<u32> = Vec::new();
    let mut rows = Vec::new();
    for record in items.chunks_exact(width) {
        let count = (record[3] as usize).min(width - LOGGED_PREAMBLE);
        let fields = &record[LOGGED_PREAMBLE..LOGGED_PREAMBLE + count];
        match record[0] >> 24 {
            HEADER_RECORD => keys = fields.to_vec(),
            DATA_RECORD => {
                if keys.is_empty() {
                    return Err(DaqError::Parse("logged data record before any header record".to_string()));
                }
                rows.push(LoggedRow {
                    timestamp: decode_timestamp(record[1])?,
                    interval: record[2],
                    values: keys.iter().copied().zip(fields.iter().copied()).collect(),
                });
            }
            kind => tracing::debug!(kind, "skipping logged record of unknown kind"),
        }
    }
    Ok(rows)
}

/// Check framing and checksum of a complete frame.
pub fn decode_frame(bytes: &[u8]) -> AppResult<Frame> {
    let len = payload_len(bytes)?;
    let total = HEADER_LEN + len + 2;
    if bytes.len() != total {
        return Err(DaqError::Parse(format!(
            "frame is {} bytes, header announces {}",
            bytes.len(),
            total
        )));
    }
    if bytes[total - 1] != EOT {
        return Err(DaqError::Parse("frame does not end with EOT".to_string()));
    }
    let expected = checksum(&bytes[..total - 2]);
    if bytes[total - 2] != expected {
        return Err(DaqError::Parse(format!(
            "checksum mismatch: got {:#04x}, expected {:#04x}",
            bytes[total - 2],
            expected
        )));
    }
    Ok(Frame {
        serial_id: bytes[1],
        command: bytes[2],
        payload: bytes[HEADER_LEN..HEADER_LEN + len].to_vec(),
    })
}

/// Interpret a raw item for `parameter`.
pub fn item_value(parameter: u32, raw: u32) -> FieldValue {
    if parameter > 1000 && parameter != PARAM_OPERATION {
        FieldValue::Number(f64::from(f32::from_bits(raw)))
    } else {
        FieldValue::Integer(i64::from(raw))
    }
}

/// Pack a time into the instrument clock format.
pub fn encode_timestamp(dtm: DateTime<Utc>) -> u32 {
    let year = u32::try_from(dtm.year() - 2000).unwrap_or(0);
    let mut packed = year;
    packed = (packed << 4) | dtm.month();
    packed = (packed << 5) | dtm.day();
    packed = (packed << 5) | dtm.hour();
    packed = (packed << 6) | dtm.minute();
    (packed << 6) | dtm.second()
}

/// Unpack an instrument clock value.
pub fn decode_timestamp(packed: u32) -> AppResult<DateTime<Utc>> {
    let second = packed & 0x3f;
    let minute = (packed >> 6) & 0x3f;
    let hour = (packed >> 12) & 0x1f;
    let day = (packed >> 17) & 0x1f;
    let month = (packed >> 22) & 0x0f;
    let year = 2000 + (packed >> 26) as i32;
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| DaqError::Parse(format!("invalid instrument timestamp {packed:#010x}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_values_frame_layout() {
        let frame = get_values(0, &[2635000]).unwrap();
        assert_eq!(&frame[..6], &[STX, 0, 4, ETX, 0, 4]);
        assert_eq!(&frame[6..10], &2635000u32.to_be_bytes());
        assert_eq!(frame[10], checksum(&frame[..10]));
        assert_eq!(frame[11], EOT);
        assert_eq!(decode_frame(&frame).unwrap().items().unwrap(), vec![2635000]);
    }

    #[test]
    fn corrupted_frames_are_rejected() {
        let mut frame = set_value(3, PARAM_OPERATION, 1).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.serial_id, 3);
        assert_eq!(decoded.items().unwrap(), vec![PARAM_OPERATION, 1]);

        frame[7] ^= 0xff;
        assert!(matches!(decode_frame(&frame), Err(DaqError::Parse(_))));
        assert!(decode_frame(&frame[..5]).is_err());
    }

    #[test]
    fn measurement_items_are_floats() {
        let raw = 12.5f32.to_bits();
        assert_eq!(item_value(2635000, raw), FieldValue::Number(12.5));
        assert_eq!(item_value(PARAM_OPERATION, 2), FieldValue::Integer(2));
        assert_eq!(item_value(PARAM_DATETIME, 77), FieldValue::Integer(77));
    }

    fn logged_frame(keys: &[u32], rows: &[(DateTime<Utc>, Vec<u32>)]) -> Frame {
        let width = keys.len() as u32;
        let mut words = vec![HEADER_RECORD << 24, 0, 0, width];
        words.extend_from_slice(keys);
        for (at, values) in rows {
            words.extend_from_slice(&[DATA_RECORD, encode_timestamp(*at), 60, width]);
            words.extend_from_slice(values);
        }
        let payload: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        decode_frame(&encode_frame(0, Command::LoggedData, &payload).unwrap()).unwrap()
    }

    #[test]
    fn logged_rows_take_their_names_from_the_header_record() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 12, 1, 0).unwrap();
        let frame = logged_frame(&[2635000, 2450000], &[(at, vec![12.5f32.to_bits(), 3])]);
        let rows = decode_logged_data(&frame).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, at);
        assert_eq!(rows[0].interval, 60);
        assert_eq!(rows[0].value(2635000), Some(12.5f32.to_bits()));
        assert_eq!(rows[0].value(2450000), Some(3));
        assert_eq!(rows[0].value(1), None);

        let empty = decode_frame(&encode_frame(0, Command::LoggedData, &[]).unwrap()).unwrap();
        assert!(decode_logged_data(&empty).unwrap().is_empty());
    }

    #[test]
    fn data_before_header_is_rejected() {
        let words = [DATA_RECORD, encode_timestamp(Utc::now()), 60, 1, 7];
        let payload: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let frame = decode_frame(&encode_frame(0, Command::LoggedData, &payload).unwrap()).unwrap();
        assert!(matches!(decode_logged_data(&frame), Err(DaqError::Parse(_))));
    }

    #[test]
    fn logging_configuration_lists_parameter_ids() {
        let payload: Vec<u8> = [2u32, 2635000, 2450000].iter().flat_map(|w| w.to_be_bytes()).collect();
        let frame = decode_frame(&encode_frame(0, Command::LoggingConfig, &payload).unwrap()).unwrap();
        assert_eq!(logged_parameters(&frame).unwrap(), vec![2635000, 2450000]);

        let short: Vec<u8> = [3u32, 1].iter().flat_map(|w| w.to_be_bytes()).collect();
        let frame = decode_frame(&encode_frame(0, Command::LoggingConfig, &short).unwrap()).unwrap();
        assert!(logged_parameters(&frame).is_err());
    }

    #[test]
    fn timestamp_packing_round_trips() {
        let dtm = Utc.with_ymd_and_hms(2026, 10, 16, 13, 55, 42).unwrap();
        let packed = encode_timestamp(dtm);
        assert_eq!(packed & 0x3f, 42);
        assert_eq!(decode_timestamp(packed).unwrap(), dtm);
        assert!(decode_timestamp(0).is_err());
    }
}
