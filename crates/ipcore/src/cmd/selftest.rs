use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use ipcore_system::{
    AsHandle, ConsumerHandle, Core, CoreConfig, CoreError, DataPipeOptions, Deadline,
    DuplicateOptions, MapFlags, ReadDataFlags, ReadMessageFlags, Signals, WriteDataFlags,
    WriteMessageFlags,
};
use ipcore_transport::{ControlOp, LoopbackTransport};
use serde::Serialize;
use tracing::debug;

use crate::cmd::{parse_duration, SelftestArgs};
use crate::exit::{core_error, CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, table, OutputFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: &'static str,
    status: CheckStatus,
    detail: String,
}

#[derive(Debug, Serialize)]
struct SelftestOutput {
    transport: &'static str,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

type Outcome = Result<String, Box<dyn Error>>;
type Check = fn(&Core, Duration) -> Outcome;

const CHECKS: &[(&str, Check)] = &[
    ("message_round_trip", message_round_trip),
    ("handle_transfer", handle_transfer),
    ("data_pipe_copy", data_pipe_copy),
    ("data_pipe_two_phase", data_pipe_two_phase),
    ("shared_buffer", shared_buffer),
    ("wait_deadline", wait_deadline),
    ("wait_many", wait_many),
    ("transport_notify", transport_notify),
];

pub fn run(args: SelftestArgs, format: OutputFormat, config: CoreConfig) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let core = Core::with_config(config).map_err(|err| core_error("core setup failed", err))?;

    let mut checks = run_checks(&core, timeout);
    // Runs last: every earlier check must have released what it created.
    checks.push(run_check("no_leaks", || no_leaks(&core)));

    let has_fail = checks.iter().any(|c| c.status == CheckStatus::Fail);
    let output = SelftestOutput {
        transport: core.transport_name(),
        checks,
        overall: if has_fail { "fail" } else { "pass" },
    };
    print_selftest(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn run_checks(core: &Core, timeout: Duration) -> Vec<CheckResult> {
    CHECKS
        .iter()
        .map(|(name, check)| run_check(name, || check(core, timeout)))
        .collect()
}

fn run_check(name: &'static str, check: impl FnOnce() -> Outcome) -> CheckResult {
    let (status, detail) = match check() {
        Ok(detail) => (CheckStatus::Pass, detail),
        Err(err) => (CheckStatus::Fail, err.to_string()),
    };
    debug!(check = name, ?status, "selftest check finished");
    CheckResult {
        name,
        status,
        detail,
    }
}

fn message_round_trip(core: &Core, timeout: Duration) -> Outcome {
    let (left, right) = core.create_message_pipe()?;
    for text in ["first", "second"] {
        left.write_message(text.as_bytes(), &mut Vec::new(), WriteMessageFlags::NONE)?;
    }
    core.wait(&right, Signals::READABLE, Deadline::after(timeout))?;
    let first = right.read_message(0, ReadMessageFlags::NONE)?;
    let second = right.read_message(0, ReadMessageFlags::NONE)?;
    left.close()?;
    right.close()?;

    if first.bytes.as_ref() != b"first" || second.bytes.as_ref() != b"second" {
        return Err("messages arrived out of order".into());
    }
    Ok("2 messages delivered in order".to_string())
}

fn handle_transfer(core: &Core, timeout: Duration) -> Outcome {
    let (left, right) = core.create_message_pipe()?;
    let (producer, consumer) = core.create_data_pipe(None)?;
    let sent_id = consumer.id();

    let mut handles = vec![consumer.into_untyped()];
    left.write_message(b"consumer", &mut handles, WriteMessageFlags::NONE)?;
    let stale = core.is_live(sent_id);

    core.wait(&right, Signals::READABLE, Deadline::after(timeout))?;
    let mut message = right.read_message(1, ReadMessageFlags::NONE)?;
    let received = message
        .handles
        .pop()
        .ok_or("message arrived without its handle")?;
    let consumer = ConsumerHandle::try_from(received.classify()?)?;

    producer.write_data(b"through", WriteDataFlags::NONE)?;
    let mut buf = [0u8; 7];
    let read = consumer.read_data(&mut buf, ReadDataFlags::ALL_OR_NONE)?;

    let new_id = consumer.id();
    consumer.close()?;
    producer.close()?;
    left.close()?;
    right.close()?;

    if stale {
        return Err(format!("sent handle {sent_id} still valid after write").into());
    }
    if &buf[..read] != b"through" {
        return Err("received consumer read the wrong bytes".into());
    }
    Ok(format!("consumer {sent_id} moved and arrived as {new_id}"))
}

fn data_pipe_copy(core: &Core, _timeout: Duration) -> Outcome {
    let options = DataPipeOptions {
        capacity_bytes: 8,
        ..DataPipeOptions::default()
    };
    let (producer, consumer) = core.create_data_pipe(Some(&options))?;
    let written = producer.write_data(b"0123456789", WriteDataFlags::NONE)?;
    let full = producer.write_data(b"x", WriteDataFlags::NONE)?;
    let mut buf = [0u8; 16];
    let read = consumer.read_data(&mut buf, ReadDataFlags::NONE)?;
    producer.close()?;
    consumer.close()?;

    if written != 8 || full != 0 {
        return Err(format!("capacity not honoured: wrote {written}, then {full}").into());
    }
    if &buf[..read] != b"01234567" {
        return Err("bytes changed in transit".into());
    }
    Ok("8 of 10 bytes accepted by an 8-byte pipe".to_string())
}

fn data_pipe_two_phase(core: &Core, _timeout: Duration) -> Outcome {
    let (producer, consumer) = core.create_data_pipe(None)?;

    let mut region = producer.begin_write_data(4, WriteDataFlags::NONE)?;
    let span = region.len();
    region[..4].copy_from_slice(b"data");
    let exclusive = matches!(
        producer.begin_write_data(1, WriteDataFlags::NONE),
        Err(CoreError::FailedPrecondition(_))
    );
    producer.end_write_data(region, 4)?;

    let region = consumer.begin_read_data(ReadDataFlags::NONE)?;
    let seen = region.to_vec();
    consumer.end_read_data(region, 4)?;
    producer.close()?;
    consumer.close()?;

    if !exclusive {
        return Err("second begin_write_data was not refused".into());
    }
    if seen != b"data" {
        return Err("two-phase read saw the wrong bytes".into());
    }
    Ok(format!("{span}-byte write region committed 4 bytes"))
}

fn shared_buffer(core: &Core, _timeout: Duration) -> Outcome {
    let buffer = core.create_shared_buffer(None, 4096)?;
    let viewer = buffer.duplicate(Some(&DuplicateOptions { read_only: true }))?;
    let writer = buffer.map(0, 4096, MapFlags::NONE)?;
    let reader = viewer.map(1024, 16, MapFlags::NONE)?;

    writer.write_at(1024, b"shared")?;
    let mut seen = [0u8; 6];
    reader.read_at(0, &mut seen)?;
    let refused = reader.write_at(0, b"x").is_err();

    writer.unmap()?;
    reader.unmap()?;
    viewer.close()?;
    buffer.close()?;

    if &seen != b"shared" {
        return Err("duplicate did not see the write".into());
    }
    if !refused {
        return Err("read-only mapping accepted a write".into());
    }
    Ok("read-only duplicate sees writes and refuses its own".to_string())
}

fn wait_deadline(core: &Core, _timeout: Duration) -> Outcome {
    let (left, right) = core.create_message_pipe()?;
    let timed_out = matches!(
        core.wait(&right, Signals::READABLE, Deadline::after(Duration::from_millis(10))),
        Err(CoreError::DeadlineExceeded)
    );
    left.close()?;
    let unsatisfiable = matches!(
        core.wait(&right, Signals::READABLE, Deadline::Infinite),
        Err(CoreError::FailedPrecondition(_))
    );
    right.close()?;

    if !timed_out {
        return Err("idle wait did not time out".into());
    }
    if !unsatisfiable {
        return Err("wait after peer close did not fail".into());
    }
    Ok("idle wait timed out; closed peer failed the wait".to_string())
}

fn wait_many(core: &Core, timeout: Duration) -> Outcome {
    let (a_left, a_right) = core.create_message_pipe()?;
    let (b_left, b_right) = core.create_message_pipe()?;
    b_left.write_message(b"ready", &mut Vec::new(), WriteMessageFlags::NONE)?;

    let index = core.wait_many(
        &[
            (&a_right as &dyn AsHandle, Signals::READABLE),
            (&b_right, Signals::READABLE),
        ],
        Deadline::after(timeout),
    );
    for handle in [a_left, a_right, b_left, b_right] {
        handle.close()?;
    }

    match index {
        Ok(1) => Ok("second of two handles resolved the wait".to_string()),
        Ok(other) => Err(format!("wait resolved on handle {other}").into()),
        Err(err) => Err(err.into()),
    }
}

fn transport_notify(core: &Core, _timeout: Duration) -> Outcome {
    let loopback = Arc::new(LoopbackTransport::new());
    let mirrored = Core::with_transport(core.config().clone(), Arc::clone(&loopback))?;
    let (left, right) = mirrored.create_message_pipe()?;
    left.write_message(b"ping", &mut Vec::new(), WriteMessageFlags::NONE)?;
    let message = right.read_message(0, ReadMessageFlags::NONE)?;
    left.close()?;
    right.close()?;

    let ops: Vec<ControlOp> = loopback.drain().into_iter().map(|event| event.op).collect();
    let expected = [
        ControlOp::CreateMessagePipe,
        ControlOp::WriteMessage,
        ControlOp::Close,
        ControlOp::Close,
    ];
    if message.bytes.as_ref() != b"ping" || ops != expected {
        return Err(format!("unexpected control sequence {ops:?}").into());
    }
    Ok(format!("{} control messages announced", ops.len()))
}

fn no_leaks(core: &Core) -> Outcome {
    let stats = core.stats();
    if stats.live_handles != 0 || stats.in_transit != 0 || stats.live_mappings != 0 {
        return Err(format!(
            "{} handles, {} in transit, {} mappings still open",
            stats.live_handles, stats.in_transit, stats.live_mappings
        )
        .into());
    }
    if stats.leaked_handles != 0 || stats.leaked_mappings != 0 {
        return Err(format!(
            "{} handles and {} mappings closed by the safety net",
            stats.leaked_handles, stats.leaked_mappings
        )
        .into());
    }
    Ok("every handle and mapping released".to_string())
}

fn print_selftest(output: &SelftestOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table => {
            let mut out = table(vec!["CHECK", "STATUS", "DETAIL"]);
            for c in &output.checks {
                out.add_row(vec![
                    c.name.to_string(),
                    status_text(c.status).to_string(),
                    c.detail.clone(),
                ]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            println!("ipcore selftest ({} transport)\n", output.transport);
            for c in &output.checks {
                println!("  [{:>4}] {:<22} {}", status_text(c.status), c.name, c.detail);
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
    }
}
