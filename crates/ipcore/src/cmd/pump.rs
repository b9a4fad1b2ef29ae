//! Stream a byte pattern through one data pipe and verify it on arrival.
//!
//! ```text
//!   producer thread                         consumer (main thread)
//!   ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//!   │ write_data / │──►│  data pipe    │──►│ read_data /  │
//!   │ begin/end    │   │  (ring)       │   │ begin/end    │
//!   └──────────────┘   └───────────────┘   └──────────────┘
//!          wait(WRITABLE)             wait(READABLE)
//! ```

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ipcore_system::{
    ConsumerHandle, Core, CoreConfig, CoreError, CoreStats, DataPipeOptions, Deadline,
    ProducerHandle, ReadDataFlags, Signals, WriteDataFlags,
};
use ipcore_wire::{RecordReader, StreamTransport, WireError};
use serde::Serialize;
use tracing::{debug, info};

use crate::cmd::{parse_duration, PumpArgs};
use crate::exit::{
    core_error, io_error, wire_error, CliError, CliResult, DATA_INVALID, INTERNAL, SUCCESS, USAGE,
};
use crate::output::{human_bytes, print_fields, OutputFormat};

#[derive(Clone, Copy, Debug)]
struct Plan {
    total: u64,
    chunk: usize,
    element_bytes: usize,
    two_phase: bool,
    stall: Duration,
}

impl Plan {
    fn from_args(args: &PumpArgs) -> CliResult<Self> {
        let stall = parse_duration(&args.timeout)?;
        if args.element_bytes == 0 {
            return Err(CliError::new(USAGE, "--element-bytes must be greater than zero"));
        }
        if args.chunk == 0 || args.chunk % args.element_bytes != 0 {
            return Err(CliError::new(
                USAGE,
                format!(
                    "--chunk must be a positive multiple of {} bytes",
                    args.element_bytes
                ),
            ));
        }
        if args.bytes % args.element_bytes as u64 != 0 {
            return Err(CliError::new(
                USAGE,
                format!("--bytes must be a multiple of {} bytes", args.element_bytes),
            ));
        }
        Ok(Self {
            total: args.bytes,
            chunk: args.chunk,
            element_bytes: args.element_bytes,
            two_phase: args.two_phase,
            stall,
        })
    }

    fn mode(&self) -> &'static str {
        if self.two_phase {
            "two-phase"
        } else {
            "copy"
        }
    }
}

/// Write side of a record file. Nothing ever arrives on it.
struct RecordSink(File);

impl Read for RecordSink {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }
}

impl Write for RecordSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

#[derive(Debug, Serialize)]
struct PumpReport {
    mode: &'static str,
    transport: &'static str,
    bytes: u64,
    capacity: usize,
    element_bytes: usize,
    elapsed_ms: f64,
    mib_per_sec: f64,
    corrupt_bytes: u64,
    interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<u64>,
    stats: CoreStats,
}

pub fn run(args: PumpArgs, format: OutputFormat, config: CoreConfig) -> CliResult<i32> {
    let plan = Plan::from_args(&args)?;
    let capacity = if args.capacity == 0 {
        config.default_data_pipe_capacity
    } else {
        args.capacity
    };

    let core = match &args.record {
        Some(path) => {
            let file = File::create(path)
                .map_err(|err| io_error(&format!("create {}", path.display()), err))?;
            Core::with_transport(config, StreamTransport::new(RecordSink(file)))
        }
        None => Core::with_config(config),
    }
    .map_err(|err| core_error("core setup failed", err))?;

    let options = DataPipeOptions {
        element_bytes: plan.element_bytes,
        capacity_bytes: args.capacity,
        ..DataPipeOptions::default()
    };
    let (producer, consumer) = core
        .create_data_pipe(Some(&options))
        .map_err(|err| core_error("data pipe setup failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    debug!(mode = plan.mode(), total = plan.total, capacity, "pump starting");
    let started = Instant::now();
    let producer_running = running.clone();
    let writer = thread::Builder::new()
        .name("pump-producer".to_string())
        .spawn(move || {
            let result = produce(&producer, &plan, &producer_running);
            let closed = producer.close();
            result.and_then(|sent| closed.map(|()| sent))
        })
        .map_err(|err| io_error("spawn producer thread", err))?;

    let consumed = consume(&consumer, &plan);
    // Closing first unblocks a producer still waiting for room.
    let closed = consumer.close();
    let produced = writer
        .join()
        .map_err(|_| CliError::new(INTERNAL, "producer thread panicked"))?;
    let elapsed = started.elapsed();

    let (received, corrupt_bytes) = consumed.map_err(|err| core_error("read failed", err))?;
    closed.map_err(|err| core_error("close failed", err))?;
    let sent = produced.map_err(|err| core_error("write failed", err))?;

    let stats = core.stats();
    drop(core);
    let records = match &args.record {
        Some(path) => Some(count_records(path)?),
        None => None,
    };

    let interrupted = !running.load(Ordering::SeqCst);
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let report = PumpReport {
        mode: plan.mode(),
        transport: if args.record.is_some() { "stream" } else { "null" },
        bytes: received,
        capacity,
        element_bytes: plan.element_bytes,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        mib_per_sec: received as f64 / (1024.0 * 1024.0) / secs,
        corrupt_bytes,
        interrupted,
        records,
        stats,
    };
    info!(
        bytes = report.bytes,
        mib_per_sec = report.mib_per_sec,
        "pump finished"
    );
    print_fields("ipcore pump", &report, &report_fields(&report), format);

    if corrupt_bytes > 0 || received != sent || (!interrupted && received != plan.total) {
        return Err(CliError::new(
            DATA_INVALID,
            format!("stream mismatch: sent {sent}, received {received}, {corrupt_bytes} corrupt"),
        ));
    }
    Ok(SUCCESS)
}

fn produce(producer: &ProducerHandle, plan: &Plan, running: &AtomicBool) -> Result<u64, CoreError> {
    let core = producer.core();
    let mut sent = 0u64;
    let mut scratch = vec![0u8; plan.chunk];

    while sent < plan.total && running.load(Ordering::SeqCst) {
        let want = usize::try_from(plan.total - sent)
            .unwrap_or(usize::MAX)
            .min(plan.chunk);
        let written = if plan.two_phase {
            match producer.begin_write_data(plan.element_bytes, WriteDataFlags::NONE) {
                Ok(mut region) => {
                    let n = want.min(region.len());
                    fill_pattern(&mut region[..n], sent);
                    producer.end_write_data(region, n)?;
                    n
                }
                Err(CoreError::ShouldWait) => 0,
                Err(err) => return Err(err),
            }
        } else {
            fill_pattern(&mut scratch[..want], sent);
            producer.write_data(&scratch[..want], WriteDataFlags::NONE)?
        };

        if written == 0 {
            core.wait(producer, Signals::WRITABLE, Deadline::after(plan.stall))?;
        } else {
            sent += written as u64;
        }
    }
    Ok(sent)
}

fn consume(consumer: &ConsumerHandle, plan: &Plan) -> Result<(u64, u64), CoreError> {
    let core = consumer.core();
    let mut received = 0u64;
    let mut corrupt = 0u64;
    let mut scratch = vec![0u8; plan.chunk];

    loop {
        let result = if plan.two_phase {
            consumer
                .begin_read_data(ReadDataFlags::NONE)
                .and_then(|region| {
                    let n = region.len().min(plan.chunk);
                    corrupt += count_corrupt(&region[..n], received);
                    consumer.end_read_data(region, n).map(|()| n)
                })
        } else {
            consumer
                .read_data(&mut scratch, ReadDataFlags::NONE)
                .map(|n| {
                    corrupt += count_corrupt(&scratch[..n], received);
                    n
                })
        };

        match result {
            Ok(n) => received += n as u64,
            Err(CoreError::ShouldWait) => {
                match core.wait(consumer, Signals::READABLE, Deadline::after(plan.stall)) {
                    // Producer gone; the next read reports end of stream.
                    Ok(_) | Err(CoreError::FailedPrecondition(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            Err(CoreError::FailedPrecondition(_)) => return Ok((received, corrupt)),
            Err(err) => return Err(err),
        }
    }
}

fn pattern_byte(pos: u64) -> u8 {
    (pos % 251) as u8
}

fn fill_pattern(buf: &mut [u8], offset: u64) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = pattern_byte(offset + i as u64);
    }
}

fn count_corrupt(data: &[u8], offset: u64) -> u64 {
    data.iter()
        .enumerate()
        .filter(|(i, byte)| **byte != pattern_byte(offset + *i as u64))
        .count() as u64
}

fn count_records(path: &Path) -> CliResult<u64> {
    let file = File::open(path).map_err(|err| io_error(&format!("open {}", path.display()), err))?;
    let mut reader = RecordReader::new(BufReader::new(file));
    let mut count = 0u64;
    loop {
        match reader.read_record() {
            Ok(_) => count += 1,
            Err(WireError::ConnectionClosed) => return Ok(count),
            Err(err) => return Err(wire_error(&format!("decode {}", path.display()), err)),
        }
    }
}

fn report_fields(report: &PumpReport) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("mode", report.mode.to_string()),
        ("transport", report.transport.to_string()),
        ("bytes", human_bytes(report.bytes)),
        ("capacity", human_bytes(report.capacity as u64)),
        ("element_bytes", report.element_bytes.to_string()),
        ("elapsed", format!("{:.1} ms", report.elapsed_ms)),
        ("throughput", format!("{:.1} MiB/s", report.mib_per_sec)),
        ("corrupt_bytes", report.corrupt_bytes.to_string()),
        ("interrupted", report.interrupted.to_string()),
    ];
    if let Some(records) = report.records {
        fields.push(("records", records.to_string()));
    }
    fields.push(("live_handles", report.stats.live_handles.to_string()));
    fields.push(("leaked_handles", report.stats.leaked_handles.to_string()));
    fields
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
