//! End-to-end runs of the fuzz loop against loopback peers.

use mutineer_core::config::SessionFile;
use mutineer_core::{
    ByteFlipEngine, Direction, ExecutorOptions, FindingKind, FuzzLoop, FuzzSummary, Message,
    MutationEngine, MutationGateway, NetworkExecutor, PassthroughProcessor, RunBounds,
    ScheduleMode, Scheduler, Session, StopHandle, StopReason, Transport,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn flipped(seed: u64, input: &[u8]) -> Vec<u8> {
    ByteFlipEngine::new().mutate(seed, input).unwrap()
}

fn hello_session(port: u16) -> Session {
    let mut session = Session::new(vec![
        Message::single(Direction::Outbound, b"HELLO".to_vec(), true),
        Message::single(Direction::Inbound, b"OK".to_vec(), false),
    ])
    .unwrap();
    session.port = port;
    session.receive_timeout = Duration::from_millis(200);
    session.failure_timeout = Duration::from_millis(10);
    session
}

fn fuzz_loop(mode: ScheduleMode, bounds: RunBounds, options: ExecutorOptions) -> FuzzLoop {
    let stop = StopHandle::new();
    let executor = NetworkExecutor::new(
        Transport::new("127.0.0.1", stop.clone()),
        MutationGateway::new(Box::new(ByteFlipEngine::new())),
        Box::new(PassthroughProcessor),
        options,
    );
    FuzzLoop::new(Box::new(executor), Scheduler::new(mode, bounds).unwrap()).with_stop_handle(stop)
}

fn run(mode: ScheduleMode, bounds: RunBounds, session: &mut Session) -> FuzzSummary {
    fuzz_loop(mode, bounds, ExecutorOptions::default())
        .run(session)
        .unwrap()
}

/// Accepts `connections` clients, records `request_len` bytes from each and
/// answers with `reply`.
fn spawn_target(
    connections: usize,
    request_len: usize,
    reply: &'static [u8],
) -> (u16, thread::JoinHandle<Vec<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut seen = Vec::new();
        for _ in 0..connections {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = vec![0u8; request_len];
            stream.read_exact(&mut request).unwrap();
            stream.write_all(reply).unwrap();
            seen.push(request);
        }
        seen
    });
    (port, handle)
}

#[test]
fn range_replays_one_mutated_case_per_seed() {
    let (port, target) = spawn_target(4, 5, b"OK");
    let mut session = hello_session(port);

    let summary = run(
        ScheduleMode::Sequential,
        RunBounds {
            min: 1,
            max: Some(4),
        },
        &mut session,
    );

    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(summary.attempts, 4);
    assert!(summary.findings.is_empty());

    let seen = target.join().unwrap();
    let expected: Vec<Vec<u8>> = (1..=4).map(|seed| flipped(seed, b"HELLO")).collect();
    assert_eq!(seen, expected, "Each run should send the seed's mutation");
    assert!(seen.iter().all(|request| request != b"HELLO"));

    // The session is left pristine for the next run.
    assert_eq!(session.messages()[0].altered_bytes(), b"HELLO");
}

#[test]
fn same_seed_loop_sends_identical_cases() {
    let (port, target) = spawn_target(3, 5, b"OK");
    let mut session = hello_session(port);

    let summary = run(
        ScheduleMode::FiniteLoop(vec![42]),
        RunBounds {
            min: 0,
            max: Some(2),
        },
        &mut session,
    );
    assert_eq!(summary.attempts, 3);

    let seen = target.join().unwrap();
    assert!(seen.iter().all(|request| *request == flipped(42, b"HELLO")));
}

#[test]
fn refused_connection_halts_without_a_finding() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut session = hello_session(port);

    let summary = run(ScheduleMode::Sequential, RunBounds::default(), &mut session);

    assert_eq!(summary.stop_reason, StopReason::Halted);
    assert_eq!(summary.attempts, 1);
    assert!(summary.findings.is_empty());
}

#[test]
fn silent_target_is_logged_as_hang() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (hold_tx, hold_rx) = mpsc::channel::<TcpStream>();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            if hold_tx.send(stream).is_err() {
                break;
            }
        }
    });

    let mut session = hello_session(port);
    session.failure_threshold = 1;
    session.receive_timeout = Duration::from_millis(50);

    let summary = run(
        ScheduleMode::Sequential,
        RunBounds {
            min: 1,
            max: Some(3),
        },
        &mut session,
    );
    drop(hold_rx);

    // Three consecutive timeouts confirm run 1, then runs 2 and 3 are retried.
    assert_eq!(summary.attempts, 5);
    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(summary.findings.len(), 1);
    assert_eq!(summary.findings[0].kind, FindingKind::Hang);
    assert_eq!((summary.findings[0].run, summary.findings[0].seed), (1, 1));
}

#[test]
fn server_mode_waits_for_the_target_to_connect() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = thread::spawn(move || {
        let mut received = Vec::new();
        for _ in 0..2 {
            let mut stream = loop {
                match TcpStream::connect(("127.0.0.1", port)) {
                    Ok(stream) => break stream,
                    Err(_) => thread::sleep(Duration::from_millis(20)),
                }
            };
            stream.write_all(b"HI").unwrap();
            let mut reply = vec![0u8; 4];
            stream.read_exact(&mut reply).unwrap();
            received.push(reply);
        }
        received
    });

    let mut session = Session::new(vec![
        Message::single(Direction::Inbound, b"HI".to_vec(), false),
        Message::single(Direction::Outbound, b"DATA".to_vec(), true),
    ])
    .unwrap();
    session.port = port;
    session.client_mode = false;
    session.receive_timeout = Duration::from_secs(2);

    let summary = run(
        ScheduleMode::Sequential,
        RunBounds {
            min: 10,
            max: Some(11),
        },
        &mut session,
    );
    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.stop_reason, StopReason::Exhausted);

    let received = client.join().unwrap();
    assert_eq!(received, vec![flipped(10, b"DATA"), flipped(11, b"DATA")]);
}

#[test]
fn emulated_case_is_dumped_without_traffic() {
    let dump = tempfile::tempdir().unwrap();
    // Nothing listens on port 9; emulation never touches it.
    let mut session = hello_session(9);

    let summary = fuzz_loop(
        ScheduleMode::Single(7),
        RunBounds::single(7),
        ExecutorOptions {
            receive_timeout: None,
            dump_dir: Some(dump.path().to_path_buf()),
            emulate: true,
        },
    )
    .run(&mut session)
    .unwrap();

    assert_eq!(summary.stop_reason, StopReason::SingleCase);
    assert_eq!(summary.attempts, 1);
    let last = summary.last_fuzzed.unwrap();
    assert_eq!(last.index, 0);
    assert_eq!(last.bytes, flipped(7, b"HELLO"));

    let outbound = std::fs::read(dump.path().join("0-outbound-seed-7")).unwrap();
    let inbound = std::fs::read(dump.path().join("1-inbound-seed-7")).unwrap();
    assert_eq!(outbound, flipped(7, b"HELLO"));
    assert_eq!(inbound, b"OK");
}

#[test]
fn session_file_drives_a_fixed_size_region() {
    let dir = tempfile::tempdir().unwrap();
    let (port, target) = spawn_target(1, 5, b"ACK");
    let path = dir.path().join("session.toml");
    std::fs::write(
        &path,
        format!(
            r#"
port = {port}
receive-timeout-secs = 1.0

[[messages]]
direction = "outbound"
[[messages.subcomponents]]
text = "GET "
[[messages.subcomponents]]
hex = "00"
fuzz = true
fixed-size = 1

[[messages]]
direction = "inbound"
[[messages.subcomponents]]
text = "ACK"
"#
        ),
    )
    .unwrap();

    let mut session = Session::try_from(SessionFile::load_from_file(&path).unwrap()).unwrap();
    let summary = run(
        ScheduleMode::Sequential,
        RunBounds::single(3),
        &mut session,
    );
    assert_eq!(summary.attempts, 1);

    let seen = target.join().unwrap();
    let mut expected = b"GET ".to_vec();
    expected.extend(flipped(3, &[0x00]));
    assert_eq!(seen[0], expected, "Only the fuzzed region changes");

    let exported = session.snapshot(summary.last_fuzzed.as_ref());
    let replayable = Session::try_from(exported).unwrap();
    assert_eq!(replayable.messages()[0].original_bytes(), expected);
}
