//! End-to-end scenarios over real POSIX shared memory.
//!
//! Server and client endpoints run as threads of this process, each with
//! its own mapping of the shared objects — the same data path two separate
//! processes would take. Channel names carry the pid and a per-test tag so
//! reruns and parallel test binaries cannot collide; the tests are
//! serialized anyway because they are timing-sensitive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serial_test::serial;
use shm_duplex::{ChannelConfig, EventKind, ShmClient, ShmError, ShmServer, mono_time_ns};

const RECORD_SIZE: usize = 268;

fn unique_name(tag: &str) -> String {
    format!("duplex_{}_{}", tag, std::process::id())
}

fn blocking_config(size: u32, timeout_ms: u32) -> ChannelConfig {
    ChannelConfig {
        size,
        blocking: true,
        timeout_ms,
        ..ChannelConfig::default()
    }
}

fn nonblocking_config(size: u32) -> ChannelConfig {
    ChannelConfig {
        size,
        blocking: false,
        timeout_ms: 0,
        ..ChannelConfig::default()
    }
}

fn encode(id: u64, timestamp: u64) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    buf[..8].copy_from_slice(&id.to_le_bytes());
    buf[8..16].copy_from_slice(&timestamp.to_le_bytes());
    buf
}

fn decode(buf: &[u8]) -> (u64, u64) {
    let id = u64::from_le_bytes(buf[..8].try_into().unwrap());
    let timestamp = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    (id, timestamp)
}

/// Scenario: 10,000 ping-pong rounds of 268-byte records. Both directions
/// must deliver strictly increasing ids with no duplicates and every pong
/// must echo the ping's timestamp bit-for-bit.
#[test]
#[serial]
fn ping_pong_ten_thousand_rounds() {
    const ROUNDS: u64 = 10_000;
    let name = unique_name("pingpong");

    let server_name = name.clone();
    let server = std::thread::spawn(move || {
        let mut server =
            ShmServer::create(&server_name, &blocking_config(1 << 20, 1000)).expect("server");
        let mut buf = [0u8; RECORD_SIZE];
        let mut expected = 0u64;

        while expected < ROUNDS {
            match server.receive(&mut buf) {
                Ok(n) => {
                    assert_eq!(n, RECORD_SIZE);
                    let (id, _) = decode(&buf);
                    assert_eq!(id, expected, "server saw an out-of-order or duplicate id");
                    expected += 1;
                    server.send(&buf).expect("pong");
                }
                Err(ShmError::Timeout) => continue,
                Err(e) => panic!("server receive failed: {e}"),
            }
        }
        expected
    });

    let mut client = ShmClient::connect_with(&name, &blocking_config(1 << 20, 1000)).expect("client");
    let mut pong = [0u8; RECORD_SIZE];

    for id in 0..ROUNDS {
        let sent_at = mono_time_ns();
        client.send(&encode(id, sent_at)).expect("ping");

        let n = loop {
            match client.receive(&mut pong) {
                Ok(n) => break n,
                Err(ShmError::Timeout) => continue,
                Err(e) => panic!("client receive failed: {e}"),
            }
        };
        assert_eq!(n, RECORD_SIZE);
        let (echoed_id, echoed_ts) = decode(&pong);
        assert_eq!(echoed_id, id, "client saw an out-of-order or duplicate id");
        assert_eq!(echoed_ts, sent_at, "timestamp must round-trip bitwise");
    }

    assert_eq!(server.join().unwrap(), ROUNDS);
}

/// Scenario: the client connects 300 ms after the server starts; the
/// server must deliver Connect within about one listener poll period of
/// the attach.
#[test]
#[serial]
fn late_client_connect_is_detected_within_a_poll() {
    let name = unique_name("late");
    let mut server = ShmServer::create(&name, &nonblocking_config(8192)).expect("server");

    let connect_seen_at: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
    {
        let connect_seen_at = Arc::clone(&connect_seen_at);
        server
            .register_callback(move |kind| {
                if kind == EventKind::Connect {
                    connect_seen_at.store(mono_time_ns(), Ordering::Release);
                }
            })
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(300));
    assert!(!server.peer_present(), "no peer may be seen before attach");

    let attach_at = mono_time_ns();
    let _client = ShmClient::connect_with(&name, &nonblocking_config(8192)).expect("client");

    // One poll period is 100 ms; allow generous slack for CI schedulers.
    let deadline = Instant::now() + Duration::from_millis(500);
    loop {
        let seen = connect_seen_at.load(Ordering::Acquire);
        if seen != 0 {
            let latency_ms = seen.saturating_sub(attach_at) / 1_000_000;
            assert!(
                latency_ms <= 300,
                "Connect delivered {latency_ms} ms after attach"
            );
            break;
        }
        assert!(Instant::now() < deadline, "Connect event never delivered");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(server.peer_present());
}

/// Scenario: the client disappears mid-session. The server must observe
/// the reader counter dropping to zero within one poll, deliver
/// Disconnect, and transition sends to silent drops.
#[test]
#[serial]
fn sudden_client_departure_delivers_disconnect() {
    let name = unique_name("kill");
    let mut server = ShmServer::create(&name, &nonblocking_config(8192)).expect("server");

    let events: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        server
            .register_callback(move |kind| events.lock().unwrap().push(kind))
            .unwrap();
    }

    let mut client = ShmClient::connect_with(&name, &nonblocking_config(8192)).expect("client");
    client.send(b"one last record").unwrap();

    // Wait until the server has seen the attach.
    let deadline = Instant::now() + Duration::from_millis(500);
    while !server.peer_present() {
        assert!(Instant::now() < deadline, "attach never observed");
        std::thread::sleep(Duration::from_millis(5));
    }

    // An abrupt departure takes the same detach path the OS takes when it
    // reclaims a dead process's mappings.
    drop(client);

    let deadline = Instant::now() + Duration::from_millis(500);
    while server.peer_present() {
        assert!(Instant::now() < deadline, "detach never observed");
        std::thread::sleep(Duration::from_millis(5));
    }

    std::thread::sleep(Duration::from_millis(50));
    assert!(
        events.lock().unwrap().contains(&EventKind::Disconnect),
        "Disconnect must reach the callback"
    );

    // Best-effort contract: sends into the void succeed silently.
    server.send(b"nobody is listening").expect("silent drop");
}

/// Scenario: every observed Connect is eventually paired with exactly one
/// Disconnect before the next Connect.
#[test]
#[serial]
fn presence_events_pair_up_across_sessions() {
    let name = unique_name("pairing");
    let mut server = ShmServer::create(&name, &nonblocking_config(8192)).expect("server");

    let log: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let log = Arc::clone(&log);
        server
            .register_callback(move |kind| {
                if matches!(kind, EventKind::Connect | EventKind::Disconnect) {
                    log.lock().unwrap().push(kind);
                }
            })
            .unwrap();
    }

    for _ in 0..3 {
        let client = ShmClient::connect_with(&name, &nonblocking_config(8192)).expect("client");
        let deadline = Instant::now() + Duration::from_millis(500);
        while !server.peer_present() {
            assert!(Instant::now() < deadline, "attach not observed");
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(client);
        let deadline = Instant::now() + Duration::from_millis(500);
        while server.peer_present() {
            assert!(Instant::now() < deadline, "detach not observed");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    std::thread::sleep(Duration::from_millis(150));

    let log = log.lock().unwrap();
    let mut expecting_connect = true;
    for kind in log.iter() {
        match kind {
            EventKind::Connect => {
                assert!(expecting_connect, "two Connects without a Disconnect");
                expecting_connect = false;
            }
            EventKind::Disconnect => {
                assert!(!expecting_connect, "Disconnect without a prior Connect");
                expecting_connect = true;
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(
        log.iter().filter(|&&k| k == EventKind::Connect).count(),
        3,
        "each session produces exactly one Connect"
    );
}

/// Scenario: a producer floods 1,000 records of 4 KiB into a 64 KiB ring
/// while the consumer sleeps. The drain must yield a contiguous,
/// most-recent suffix of at least `size / (4 + 4096)` records with no
/// torn payloads.
#[test]
#[serial]
fn overrun_preserves_a_contiguous_recent_suffix() {
    let name = unique_name("overrun");
    let ring_size = 64 * 1024;
    let mut server = ShmServer::create(&name, &nonblocking_config(ring_size)).expect("server");
    let mut client = ShmClient::connect_with(&name, &nonblocking_config(ring_size)).expect("client");

    // Make the attach visible so sends are not silently dropped.
    assert!(server.check_peer());

    let payload_len = 4096;
    for i in 0u64..1000 {
        let mut record = vec![0u8; payload_len];
        record[..8].copy_from_slice(&i.to_le_bytes());
        // Fill the body with a value derived from the id so a torn record
        // is detectable.
        let fill = (i % 251) as u8;
        record[8..].fill(fill);
        server.send(&record).expect("overwriting send always succeeds");
    }

    // Consumer wakes up and drains.
    let mut out = vec![0u8; payload_len];
    let mut ids = Vec::new();
    loop {
        match client.receive(&mut out) {
            Ok(n) => {
                assert_eq!(n, payload_len, "no torn records");
                let id = u64::from_le_bytes(out[..8].try_into().unwrap());
                let fill = (id % 251) as u8;
                assert!(
                    out[8..].iter().all(|&b| b == fill),
                    "record {id} has a corrupted body"
                );
                ids.push(id);
            }
            Err(ShmError::Empty) => break,
            Err(e) => panic!("drain failed: {e}"),
        }
    }

    let min_expected = (ring_size as usize) / (4 + payload_len);
    assert!(
        ids.len() >= min_expected,
        "expected at least {min_expected} surviving records, got {}",
        ids.len()
    );
    assert_eq!(*ids.last().unwrap(), 999, "the newest record must survive");
    for pair in ids.windows(2) {
        assert_eq!(pair[1], pair[0] + 1, "suffix must be contiguous in write order");
    }
}

/// Scenario: a requested size of 3000 is coerced to 4096, observable
/// through which record sizes the ring accepts.
#[test]
#[serial]
fn requested_size_is_coerced_to_power_of_two() {
    let name = unique_name("coerce");
    let mut server = ShmServer::create(&name, &nonblocking_config(3000)).expect("server");
    let _client = ShmClient::connect_with(&name, &nonblocking_config(3000)).expect("client");
    assert!(server.check_peer());

    // 4092 + 4 == 4096: fits only if the size was rounded up.
    server
        .send(&vec![1u8; 4092])
        .expect("a 4092-byte record must fit a 4096-byte ring");

    // 4093 + 4 > 4096: must be rejected by geometry, proving the ring is
    // exactly 4096 bytes.
    assert!(matches!(
        server.send(&vec![1u8; 4093]),
        Err(ShmError::InvalidParam(_))
    ));
}

/// Round-trip law plus peek idempotence at the endpoint surface.
#[test]
#[serial]
fn peek_is_stable_and_read_consumes() {
    let name = unique_name("peek");
    let mut server = ShmServer::create(&name, &nonblocking_config(8192)).expect("server");
    let mut client = ShmClient::connect_with(&name, &nonblocking_config(8192)).expect("client");
    assert!(server.check_peer());

    server.send(b"alpha").unwrap();
    server.send(b"beta").unwrap();

    let mut buf = [0u8; 32];
    let n1 = client.peek(&mut buf).unwrap();
    assert_eq!(&buf[..n1], b"alpha");
    let n2 = client.peek(&mut buf).unwrap();
    assert_eq!(&buf[..n2], b"alpha", "peek must not advance");

    let n3 = client.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n3], b"alpha");
    let n4 = client.peek(&mut buf).unwrap();
    assert_eq!(&buf[..n4], b"beta", "read must advance past the peeked record");
}

/// Blocking receive with a zero timeout must behave exactly like a
/// non-blocking receive.
#[test]
#[serial]
fn zero_timeout_blocking_equals_nonblocking() {
    let name = unique_name("zerotimeout");
    let config = blocking_config(8192, 0);
    let mut server = ShmServer::create(&name, &config).expect("server");
    let _client = ShmClient::connect_with(&name, &config).expect("client");

    let mut buf = [0u8; 32];
    let start = Instant::now();
    assert!(matches!(server.receive(&mut buf), Err(ShmError::Empty)));
    assert!(
        start.elapsed() < Duration::from_millis(50),
        "zero-timeout receive must return immediately"
    );
}

/// Creating two servers on one name must fail; connecting without any
/// server must exhaust the retry budget and fail with NotFound.
#[test]
#[serial]
fn name_collisions_and_orphan_connects_fail_cleanly() {
    let name = unique_name("names");
    let _server = ShmServer::create(&name, &nonblocking_config(8192)).expect("server");
    assert!(matches!(
        ShmServer::create(&name, &nonblocking_config(8192)),
        Err(ShmError::Exists)
    ));

    let orphan = unique_name("orphan_names");
    assert!(matches!(
        ShmClient::connect_with(&orphan, &nonblocking_config(8192)),
        Err(ShmError::NotFound)
    ));
}
