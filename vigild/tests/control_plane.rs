// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end exercise of the control socket: real unix stream clients
//! speaking length-prefixed JSON frames against a live server thread.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use vigil_ipc::{read_frame, write_frame, Request, Response};
use vigild::control::ControlServer;
use vigild::dispatch::EventDispatcher;
use vigild::handlers::{ControlContext, RuntimeSettings};
use vigild::ingest::IngestReader;
use vigild::queue;
use vigild::storage::{SqliteStore, Storage};
use vigild::supervisor::{DetectorCommand, Supervisor, SupervisorConfig};

struct Harness {
    server: ControlServer,
    ctx: Arc<ControlContext>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn start() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(build_context(dir.path()));
        let server = ControlServer::start(dir.path().join("api.sock"), Arc::clone(&ctx)).unwrap();
        Harness {
            server,
            ctx,
            _dir: dir,
        }
    }

    fn connect(&self) -> UnixStream {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match UnixStream::connect(self.server.socket_path()) {
                Ok(stream) => return stream,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("cannot connect to control socket: {e}"),
            }
        }
    }

    fn stop(self) {
        self.server.stop();
        self.ctx.reader.stop();
        self.ctx.dispatcher.stop();
    }
}

fn build_context(dir: &Path) -> ControlContext {
    let rules_dir = dir.join("rules");
    std::fs::create_dir_all(&rules_dir).unwrap();

    let (queue, consumer) = queue::with_capacity(128);
    let storage: Arc<dyn Storage> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let dispatcher = Arc::new(EventDispatcher::start(consumer, Arc::clone(&storage)));
    let reader = Arc::new(IngestReader::start(dir.join("events.sock"), queue.clone()));
    let supervisor = Arc::new(Supervisor::new(
        DetectorCommand {
            binary: "/bin/true".into(),
            config: dir.join("detector.yaml"),
            event_socket: dir.join("events.sock"),
            rules_dir: Some(rules_dir.clone()),
            log_dir: None,
            interfaces: vec!["eth0".to_owned()],
        },
        SupervisorConfig::default(),
    ));

    ControlContext {
        running: Arc::new(AtomicBool::new(true)),
        started_at: Instant::now(),
        supervisor,
        reader,
        queue,
        dispatcher,
        storage,
        settings: Mutex::new(RuntimeSettings {
            rules_dir,
            recorded: BTreeMap::new(),
        }),
    }
}

fn roundtrip(stream: &mut UnixStream, request: &Request) -> Response {
    let payload = serde_json::to_vec(request).unwrap();
    write_frame(stream, &payload).unwrap();
    let response = read_frame(stream).unwrap();
    serde_json::from_slice(&response).unwrap()
}

fn command(name: &str) -> Request {
    Request {
        command: name.to_owned(),
        params: None,
    }
}

#[test]
fn status_request_succeeds_over_the_wire() {
    let harness = Harness::start();
    let mut client = harness.connect();

    let response = roundtrip(&mut client, &command("status"));
    assert!(response.success);
    assert_eq!(response.error_code, 0);
    let data = response.data.unwrap();
    let status = data["status"].as_str().unwrap();
    assert!(["running", "degraded", "shutting_down"].contains(&status));
    assert!(!data["version"].as_str().unwrap().is_empty());
    assert!(data["uptime"].as_u64().is_some());

    harness.stop();
}

#[test]
fn unknown_command_is_rejected_over_the_wire() {
    let harness = Harness::start();
    let mut client = harness.connect();

    let response = roundtrip(&mut client, &command("not_a_command"));
    assert!(!response.success);
    assert_eq!(response.error_code, 1);
    assert_eq!(response.error, "Invalid command");

    harness.stop();
}

#[test]
fn multiple_requests_on_one_connection() {
    let harness = Harness::start();
    let mut client = harness.connect();

    for _ in 0..3 {
        let response = roundtrip(&mut client, &command("status"));
        assert!(response.success);
    }
    let response = roundtrip(&mut client, &command("get_stats"));
    assert!(response.success);

    harness.stop();
}

#[test]
fn segmented_writes_still_frame_correctly() {
    let harness = Harness::start();
    let mut client = harness.connect();

    let payload = serde_json::to_vec(&command("status")).unwrap();
    let mut wire = Vec::new();
    wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    wire.extend_from_slice(&payload);

    // Dribble the frame one byte at a time.
    for byte in wire {
        client.write_all(&[byte]).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }

    let response: Response = serde_json::from_slice(&read_frame(&mut client).unwrap()).unwrap();
    assert!(response.success);

    harness.stop();
}

#[test]
fn oversized_frame_closes_only_that_client() {
    let harness = Harness::start();
    let mut victim = harness.connect();
    let mut bystander = harness.connect();

    // A length prefix larger than any permitted frame.
    victim.write_all(&u32::MAX.to_be_bytes()).unwrap();
    victim.flush().unwrap();

    // The victim connection is closed by the server: the blocking read
    // sees EOF rather than a response frame.
    victim
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert!(read_frame(&mut victim).is_err());

    // The other client is unaffected.
    let response = roundtrip(&mut bystander, &command("status"));
    assert!(response.success);

    harness.stop();
}

#[test]
fn shutdown_command_flips_the_running_flag() {
    let harness = Harness::start();
    let mut client = harness.connect();

    let response = roundtrip(&mut client, &command("shutdown"));
    assert!(response.success);
    assert!(!harness.ctx.running.load(Ordering::SeqCst));

    // Status now reports the shutdown in progress.
    let response = roundtrip(&mut client, &command("status"));
    assert_eq!(response.data.unwrap()["status"], "shutting_down");

    harness.stop();
}

#[test]
fn list_events_returns_stored_events() {
    use vigil_common::{EventKind, SecurityEvent, Severity, Timestamp};

    let harness = Harness::start();

    let mut event = SecurityEvent::new(EventKind::Alert);
    event.severity = Severity::High;
    event.rule_sid = 1000001;
    event.timestamp = Timestamp { sec: 42, usec: 0 };
    event.src_addr = "10.0.0.1".into();
    event.dst_addr = "10.0.0.2".into();
    event.message = "TEST ALERT".into();
    harness.ctx.storage.insert(&event).unwrap();

    let mut client = harness.connect();
    let response = roundtrip(
        &mut client,
        &Request {
            command: "list_events".to_owned(),
            params: Some(serde_json::json!({"limit": 10})),
        },
    );
    assert!(response.success);
    let data = response.data.unwrap();
    assert_eq!(data["count"], 1);
    assert_eq!(data["events"][0]["signature_id"], 1000001);
    assert_eq!(data["events"][0]["signature_msg"], "TEST ALERT");

    harness.stop();
}

#[test]
fn counters_track_connections_and_requests() {
    let harness = Harness::start();

    let mut a = harness.connect();
    let mut b = harness.connect();
    assert!(roundtrip(&mut a, &command("status")).success);
    assert!(roundtrip(&mut b, &command("status")).success);
    assert!(roundtrip(&mut b, &command("get_stats")).success);

    let counters = harness.server.counters();
    assert!(counters.connections_accepted >= 2);
    assert!(counters.requests_processed >= 3);

    harness.stop();
}
