//! A core announcing over a socket whose peer stops reading.

#![cfg(unix)]

use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ipcore::system::{DataPipeOptions, WriteDataFlags, WriteMessageFlags};
use ipcore::transport::ResultCode;
use ipcore::wire::{StreamTransport, DEFAULT_MAX_RECORD_PAYLOAD};
use ipcore::{Core, CoreConfig, CoreError};

fn stalled_core() -> (Core, UnixStream) {
    let (local, remote) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();
    let core = Core::with_transport(CoreConfig::default(), StreamTransport::new(local)).unwrap();
    (core, remote)
}

#[test]
fn unread_peer_refuses_writes_instead_of_blocking() {
    let (core, _remote) = stalled_core();
    let (a, b) = core.create_message_pipe().unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let writer = thread::spawn(move || {
        let payload = vec![0u8; 64 * 1024];
        let outcomes: Vec<_> = (0..512)
            .map(|_| a.write_message(&payload, &mut Vec::new(), WriteMessageFlags::NONE))
            .collect();
        done_tx.send(()).unwrap();
        (a, outcomes)
    });

    // Other threads keep making progress while the writer runs.
    for _ in 0..20 {
        let _ = core.stats();
        if done_rx.try_recv().is_ok() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("writer stalled on the transport");
    let (a, outcomes) = writer.join().unwrap();

    let accepted = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert!(accepted > 0);
    let refused = outcomes.iter().find_map(|outcome| outcome.as_ref().err());
    match refused {
        Some(err @ CoreError::Transport(_)) => {
            assert_eq!(err.code(), ResultCode::ResourceExhausted);
        }
        other => panic!("expected a transport refusal, got {other:?}"),
    }
    assert_eq!(b.queued_messages().unwrap(), accepted);

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn large_data_pipe_writes_are_accepted_up_to_one_record() {
    let (core, _remote) = stalled_core();
    let options = DataPipeOptions {
        element_bytes: 1,
        capacity_bytes: 12 * 1024 * 1024,
        flags: 0,
    };
    let (producer, consumer) = core.create_data_pipe(Some(&options)).unwrap();

    let chunk = vec![7u8; 1536 * 1024];
    assert_eq!(producer.write_data(&chunk, WriteDataFlags::NONE).unwrap(), chunk.len());

    let oversized = vec![9u8; 9 * 1024 * 1024];
    let written = producer.write_data(&oversized, WriteDataFlags::NONE).unwrap();
    assert_eq!(written, DEFAULT_MAX_RECORD_PAYLOAD - 4);
    assert_eq!(consumer.available_bytes().unwrap(), chunk.len() + written);

    producer.close().unwrap();
    consumer.close().unwrap();
}
