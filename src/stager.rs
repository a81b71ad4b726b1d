//! Interval files and harvested files into the staging directory.
//!
//! Every file is written to a hidden temporary file inside the target
//! directory, synced, and then renamed into place without replacing an
//! existing file. The rename is the hand-off to the transfer engine: a name
//! that is visible in `<staging_root>/<instrument_id>/` is always complete.
//!
//! Interval files are named `<prefix>_<YYYYMMDDHHmm>.<ext>` after the end of
//! the interval at the reporting resolution, with `.zip` appended when
//! compression is enabled. If the name is taken (an interval re-staged after
//! a restart), `_1`, `_2`, ... is inserted before the extension.

use crate::config::InstrumentSpec;
use crate::core::{HarvestedFile, OperationState, Record};
use crate::error::{AppResult, DaqError};
use crate::timebin::filename_stamp;
use chrono::{DateTime, Utc};
use csv::{QuoteStyle, Terminator, WriterBuilder};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Timestamp format of the first column.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const MAX_NAME_SUFFIX: u32 = 1000;

/// Writes staged files for all instruments.
#[derive(Debug, Clone)]
pub struct Stager {
    staging_root: PathBuf,
    data_root: PathBuf,
    reporting_interval: Duration,
}

impl Stager {
    /// Stager writing below `staging_root`, with archive copies below `data_root`.
    pub fn new(staging_root: impl Into<PathBuf>, data_root: impl Into<PathBuf>, reporting_interval: Duration) -> Self {
        Self {
            staging_root: staging_root.into(),
            data_root: data_root.into(),
            reporting_interval,
        }
    }

    /// Root of the staging tree.
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// `<staging_root>/<instrument_id>`
    pub fn staging_dir(&self, spec: &InstrumentSpec) -> PathBuf {
        self.staging_root.join(&spec.id)
    }

    /// `<data_root>/<instrument_id>`
    pub fn data_dir(&self, spec: &InstrumentSpec) -> PathBuf {
        self.data_root.join(&spec.id)
    }

    /// Uncompressed file name of the interval ending at `end`.
    pub fn interval_file_name(&self, spec: &InstrumentSpec, end: DateTime<Utc>) -> String {
        format!(
            "{}_{}.{}",
            spec.prefix(),
            filename_stamp(end, self.reporting_interval),
            spec.file_extension
        )
    }

    /// Write the records of the interval ending at `end`.
    pub fn stage_interval(&self, spec: &InstrumentSpec, end: DateTime<Utc>, records: &[Record]) -> AppResult<PathBuf> {
        let name = self.interval_file_name(spec, end);
        let dir = self.staging_dir(spec);
        let body = render(spec, records).map_err(|e| staging_error(&dir, &name, e))?;
        let path = self
            .write_staged(&dir, &name, spec.staging_zip, body.as_slice())
            .map_err(|e| staging_error(&dir, &name, e))?;

        if spec.archive {
            let archive_dir = self.data_dir(spec);
            if let Err(e) = write_atomic(&archive_dir, &name, |out| out.write_all(&body)) {
                tracing::warn!(instrument = %spec.id, file = %name, error = %e, "archive copy failed");
            }
        }

        tracing::info!(
            instrument = %spec.id,
            file = %path.display(),
            records = records.len(),
            "staged interval file"
        );
        Ok(path)
    }

    /// Copy a harvested file into staging byte for byte, keeping its name.
    pub fn stage_harvested(&self, spec: &InstrumentSpec, file: &HarvestedFile) -> AppResult<PathBuf> {
        let name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DaqError::Staging(format!("{} has no file name", file.path.display())))?;
        // A vanished source is reported as Io so the caller can drop it.
        let source = File::open(&file.path)?;
        let dir = self.staging_dir(spec);
        let path = self
            .write_staged(&dir, &name, spec.staging_zip, source)
            .map_err(|e| staging_error(&dir, &name, e))?;
        tracing::info!(
            instrument = %spec.id,
            source = %file.path.display(),
            file = %path.display(),
            bytes = file.size,
            "staged harvested file"
        );
        Ok(path)
    }

    fn write_staged(&self, dir: &Path, name: &str, compress: bool, mut content: impl Read) -> io::Result<PathBuf> {
        if compress {
            let zip_name = format!("{name}.zip");
            write_atomic(dir, &zip_name, |out| {
                let mut zip = ZipWriter::new(out);
                let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
                zip.start_file(name, options).map_err(io::Error::other)?;
                io::copy(&mut content, &mut zip)?;
                zip.finish().map_err(io::Error::other)?;
                Ok(())
            })
        } else {
            write_atomic(dir, name, |out| io::copy(&mut content, out).map(|_| ()))
        }
    }
}

fn staging_error(dir: &Path, name: &str, error: io::Error) -> DaqError {
    DaqError::Staging(format!("{}: {}", dir.join(name).display(), error))
}

/// Header line plus one line per record.
pub fn render(spec: &InstrumentSpec, records: &[Record]) -> io::Result<Vec<u8>> {
    let tagged = spec.calibration.is_some();
    let mut writer = WriterBuilder::new()
        .delimiter(spec.delimiter())
        .quote_style(QuoteStyle::Never)
        .terminator(Terminator::Any(b'\n'))
        .has_headers(false)
        .flexible(true)
        .from_writer(Vec::new());

    let mut header = vec!["dtm".to_string()];
    header.extend(spec.columns());
    writer.write_record(&header)?;

    for record in records {
        let mut row = Vec::with_capacity(record.fields.len() + 2);
        row.push(record.timestamp.format(TIMESTAMP_FORMAT).to_string());
        row.extend(record.fields.iter().map(|field| field.value.to_string()));
        if tagged {
            row.push(record.tag.unwrap_or(OperationState::Idle).to_string());
        }
        writer.write_record(&row)?;
    }
    writer.into_inner().map_err(|e| e.into_error())
}

/// Write through a hidden temp file in `dir`, then rename to `name` without
/// replacing an existing file.
fn write_atomic<F>(dir: &Path, name: &str, fill: F) -> io::Result<PathBuf>
where
    F: FnOnce(&mut NamedTempFile) -> io::Result<()>,
{
    fs::create_dir_all(dir)?;
    let mut temp = tempfile::Builder::new().prefix(".stage-").suffix(".tmp").tempfile_in(dir)?;
    fill(&mut temp)?;
    temp.as_file().sync_all()?;

    let mut target = dir.join(name);
    for n in 1..=MAX_NAME_SUFFIX {
        match temp.persist_noclobber(&target) {
            Ok(_) => return Ok(target),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                temp = e.file;
                target = dir.join(suffixed(name, n));
            }
            Err(e) => return Err(e.error),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {name} in {}", dir.display()),
    ))
}

/// `tei49c_202610161210.dat.zip` -> `tei49c_202610161210_1.dat.zip`
///
/// `_` sorts after `.`, so a re-staged interval lists right after the original.
fn suffixed(name: &str, n: u32) -> String {
    match name.split_once('.') {
        Some((stem, ext)) => format!("{stem}_{n}.{ext}"),
        None => format!("{name}_{n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CalibrationSettings, StationConfig};
    use crate::core::{FieldValue, OperationState};
    use chrono::TimeZone;

    const CONFIG: &str = r#"
        [application]
        name = "stager-test"

        [paths]
        staging = "/tmp/unused/staging"
        data = "/tmp/unused/data"
        logs = "/tmp/unused/logs"

        [transfer]
        enabled = false

        [[instruments]]
        id = "tei49i"
        type = "TEI49I"
        get_data = ["lrec"]
        data_header = ["o3", "flags"]
        staging_interval = "10m"

        [instruments.connection]
        protocol = "serial"
        port = "/dev/null"
    "#;

    fn spec() -> InstrumentSpec {
        StationConfig::from_toml_str(CONFIG).unwrap().instruments.remove(0)
    }

    fn at(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, m, 0).unwrap()
    }

    fn record(m: u32, o3: f64) -> Record {
        Record::new(
            at(m),
            &["o3".to_string(), "flags".to_string()],
            vec![FieldValue::Number(o3), FieldValue::Text("0C100000".into())],
            format!("{o3} 0C100000"),
        )
    }

    #[test]
    fn interval_file_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path().join("staging"), dir.path().join("data"), Duration::from_secs(600));
        let spec = spec();

        let path = stager
            .stage_interval(&spec, at(10), &[record(1, 31.5), record(2, 32.0)])
            .unwrap();
        assert_eq!(path, dir.path().join("staging/tei49i/tei49i_202610161210.dat"));
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "dtm o3 flags\n2026-10-16 12:01:00 31.5 0C100000\n2026-10-16 12:02:00 32 0C100000\n"
        );
        // nothing else is left behind in the staging directory
        assert_eq!(fs::read_dir(dir.path().join("staging/tei49i")).unwrap().count(), 1);
    }

    #[test]
    fn configured_separator_joins_every_column() {
        let mut spec = spec();
        spec.separator = ";".into();
        let body = render(&spec, &[record(1, 31.5)]).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "dtm;o3;flags\n2026-10-16 12:01:00;31.5;0C100000\n"
        );
    }

    #[test]
    fn collisions_get_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path(), dir.path().join("data"), Duration::from_secs(600));
        let spec = spec();
        let first = stager.stage_interval(&spec, at(10), &[record(1, 1.0)]).unwrap();
        let second = stager.stage_interval(&spec, at(10), &[record(2, 2.0)]).unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("tei49i_202610161210_1.dat"));
        assert!(fs::read_to_string(&first).unwrap().contains("12:01:00"));

        // The re-staged copy lists between its original and the next interval.
        let next = stager.stage_interval(&spec, at(20), &[record(11, 3.0)]).unwrap();
        let mut names: Vec<_> = fs::read_dir(first.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        let expected: Vec<String> = [&first, &second, &next]
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn zipped_member_keeps_the_plain_name() {
        let dir = tempfile::tempdir().unwrap();
        let stager = Stager::new(dir.path(), dir.path().join("data"), Duration::from_secs(600));
        let mut spec = spec();
        spec.staging_zip = true;
        spec.archive = true;

        let path = stager.stage_interval(&spec, at(10), &[record(3, 30.0)]).unwrap();
        assert!(path.ends_with("tei49i_202610161210.dat.zip"));

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        let mut member = archive.by_index(0).unwrap();
        assert_eq!(member.name(), "tei49i_202610161210.dat");
        let mut text = String::new();
        member.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("dtm o3 flags\n"));

        let copy = dir.path().join("data/tei49i/tei49i_202610161210.dat");
        assert_eq!(fs::read_to_string(copy).unwrap(), text);
    }

    #[test]
    fn calibration_column_carries_the_state() {
        let mut spec = spec();
        spec.calibration = Some(CalibrationSettings {
            zero_span_check_interval: Duration::from_secs(86_400),
            zero_check_duration: Duration::from_secs(300),
            span_check_duration: Duration::from_secs(300),
        });
        let body = render(&spec, &[record(1, 0.1).with_tag(OperationState::ZeroCheck), record(2, 30.0)]).unwrap();
        let text = String::from_utf8(body).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "dtm o3 flags operation");
        assert!(lines[1].ends_with("ZeroCheck"));
        assert!(lines[2].ends_with("Idle"));
    }

    #[test]
    fn harvested_files_are_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("share/CFKADS2-20261016-DataLog_User.dat");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"FRAC_DAYS_SINCE_JAN1 CO2\n288.5 415.2\n").unwrap();
        let stager = Stager::new(dir.path().join("staging"), dir.path().join("data"), Duration::from_secs(600));
        let file = HarvestedFile {
            path: source.clone(),
            size: 37,
            modified: Utc::now(),
        };

        let staged = stager.stage_harvested(&spec(), &file).unwrap();
        assert!(staged.ends_with("tei49i/CFKADS2-20261016-DataLog_User.dat"));
        assert_eq!(fs::read(staged).unwrap(), fs::read(source).unwrap());

        let missing = HarvestedFile {
            path: dir.path().join("share/gone.dat"),
            ..file
        };
        assert!(matches!(stager.stage_harvested(&spec(), &missing), Err(DaqError::Io(_))));
    }

    #[test]
    fn stamps_sort_chronologically() {
        let stager = Stager::new("/s", "/d", Duration::from_secs(600));
        let spec = spec();
        let names: Vec<_> = (1..6).map(|h| stager.interval_file_name(&spec, at(0) + chrono::Duration::hours(h))).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(suffixed("a_1.dat.zip", 2), "a_1_2.dat.zip");
    }
}
