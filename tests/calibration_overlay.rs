//! Binary-register instrument with a zero/span overlay, against a fake
//! NE-300 speaking the frame protocol on a local socket.

mod common;

use chrono::{DateTime, TimeZone, Utc};
use station_daq::adapters::acoem::{self, Command};
use station_daq::adapters::build_adapter;
use station_daq::clock::Clock;
use station_daq::core::{FieldValue, OperationState};
use station_daq::worker::{InstrumentWorker, TickOutcome};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

/// Clock frozen at a settable instant.
#[derive(Debug)]
struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    fn set(&self, at: DateTime<Utc>) {
        *self.0.lock().unwrap() = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Operation codes the fake instrument was switched to.
type Switches = Arc<Mutex<Vec<u32>>>;

async fn read_frame(stream: &mut TcpStream) -> Option<acoem::Frame> {
    let mut bytes = vec![0u8; acoem::HEADER_LEN];
    stream.read_exact(&mut bytes).await.ok()?;
    let len = acoem::payload_len(&bytes).ok()?;
    let mut rest = vec![0u8; len + 2];
    stream.read_exact(&mut rest).await.ok()?;
    bytes.extend_from_slice(&rest);
    acoem::decode_frame(&bytes).ok()
}

async fn serve(listener: TcpListener, switches: Switches) {
    let Ok((mut stream, _)) = listener.accept().await else {
        return;
    };
    let mut operation = 0u32;
    while let Some(request) = read_frame(&mut stream).await {
        let items = request.items().unwrap_or_default();
        let reply = match request.command {
            c if c == Command::Identify as u8 => {
                acoem::encode_frame(request.serial_id, Command::Identify, &300u32.to_be_bytes())
            }
            c if c == Command::SetValue as u8 => {
                if items.first() == Some(&acoem::PARAM_OPERATION) {
                    operation = items[1];
                    switches.lock().unwrap().push(operation);
                }
                acoem::encode_frame(request.serial_id, Command::SetValue, &request.payload)
            }
            _ => {
                // Zero air reads near nothing.
                let reading = if operation == 1 { 0.1f32 } else { 12.5f32 };
                let payload: Vec<u8> = items.iter().flat_map(|_| reading.to_bits().to_be_bytes()).collect();
                acoem::encode_frame(request.serial_id, Command::GetValues, &payload)
            }
        };
        let Ok(reply) = reply else { return };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

fn ne300(port: u16) -> String {
    format!(
        r#"
[[instruments]]
id = "ne300"
type = "NE300"
sampling_interval = "1m"
staging_interval = "1h"

[instruments.connection]
protocol = "binary"
host = "127.0.0.1"
port = {port}
timeout = "2s"
parameter_ids = [2, 2]
wavelengths = [635, 450]
angles = [0, 0]

[instruments.calibration]
zero_span_check_interval = "1d"
zero_check_duration = "5m"
span_check_duration = "5m"
"#
    )
}

#[tokio::test]
async fn forced_zero_check_tags_records_until_it_ends() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let switches: Switches = Arc::default();
    let server = tokio::spawn(serve(listener, switches.clone()));

    let dir = tempfile::tempdir().unwrap();
    let config = common::station(dir.path(), &ne300(port));
    let spec = Arc::new(config.instruments[0].clone());
    let adapter = build_adapter(&spec, None).unwrap();

    let start = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
    let clock = Arc::new(FixedClock(Mutex::new(start)));
    let (stop, shutdown) = watch::channel(false);
    let (worker, task) = InstrumentWorker::spawn(spec, adapter, &config.runtime, clock.clone(), shutdown);

    let minute = |m: i64| start + chrono::Duration::minutes(m);

    // Connects, re-asserts Idle, polls.
    assert!(matches!(assert_ok!(worker.tick(minute(1)).await), TickOutcome::Polled { records: 1, .. }));

    clock.set(minute(1));
    assert_ok!(worker.force_check(OperationState::ZeroCheck).await);
    for m in 2..=5 {
        assert!(matches!(assert_ok!(worker.tick(minute(m)).await), TickOutcome::Polled { records: 1, .. }));
    }
    // The five minutes are over: back to ambient.
    assert_ok!(worker.tick(minute(6)).await);

    let records = worker.buffer().drain();
    let tags: Vec<_> = records.iter().map(|r| r.tag).collect();
    assert_eq!(
        tags,
        vec![
            Some(OperationState::Idle),
            Some(OperationState::ZeroCheck),
            Some(OperationState::ZeroCheck),
            Some(OperationState::ZeroCheck),
            Some(OperationState::ZeroCheck),
            Some(OperationState::Idle),
        ]
    );
    let zero = f64::from(0.1f32);
    assert_eq!(records[1].field("p2635000"), Some(&FieldValue::Number(zero)));
    assert_eq!(records[5].field("p2635000"), Some(&FieldValue::Number(12.5)));
    // A forced zero check skips the span phase.
    assert_eq!(*switches.lock().unwrap(), vec![0, 1, 0]);

    stop.send_replace(true);
    task.await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn text_instruments_refuse_forced_checks() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::station(
        dir.path(),
        r#"
[[instruments]]
id = "tei49c"
type = "TEI49C"
get_data = ["o3"]
data_header = ["o3"]

[instruments.connection]
protocol = "socket"
host = "127.0.0.1"
port = 1
"#,
    );
    let spec = Arc::new(config.instruments[0].clone());
    let adapter = build_adapter(&spec, None).unwrap();
    let (stop, shutdown) = watch::channel(false);
    let clock = Arc::new(FixedClock(Mutex::new(Utc::now())));
    let (worker, task) = InstrumentWorker::spawn(spec, adapter, &config.runtime, clock, shutdown);

    assert_err!(worker.force_check(OperationState::SpanCheck).await);

    stop.send_replace(true);
    task.await.unwrap();
}
