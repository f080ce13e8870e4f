// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion of the detector's newline-delimited event stream.
//!
//! [`EventStreamClient`] owns the socket and the line framing;
//! [`IngestReader`] is the thread that drives it: connect, wait, read
//! lines, parse, push. Every failure here is non-fatal; the reader cycles
//! through reconnect until the detector comes up or the daemon stops.

use crate::parser::{self, Parsed};
use crate::queue::EventQueue;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use vigil_common::DetectorStats;

/// Initial read buffer size; doubles on demand up to [`LINE_MAX`].
pub const READ_BUFFER_SIZE: usize = 64 * 1024;
/// Hard ceiling for a single record. A longer record is a protocol error:
/// the buffer is discarded and the connection recycled.
pub const LINE_MAX: usize = 128 * 1024;

const WAIT_TIMEOUT_MS: u16 = 100;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Buffered line-framing client for the detector's event socket.
pub struct EventStreamClient {
    socket_path: PathBuf,
    stream: Option<UnixStream>,
    buf: Vec<u8>,
    buf_limit: usize,
    line: String,
}

impl EventStreamClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        EventStreamClient {
            socket_path: socket_path.into(),
            stream: None,
            buf: Vec::with_capacity(READ_BUFFER_SIZE),
            buf_limit: READ_BUFFER_SIZE,
            line: String::new(),
        }
    }

    pub fn connect(&mut self) -> io::Result<()> {
        self.disconnect();
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_nonblocking(true)?;
        self.stream = Some(stream);
        info!(path = %self.socket_path.display(), "connected to detector event socket");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.stream = None;
        self.buf.clear();
        self.buf_limit = READ_BUFFER_SIZE;
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn reconnect(&mut self) -> io::Result<()> {
        self.connect()
    }

    /// Waits for readable data, up to `timeout_ms`. Returns true when a
    /// read is worth attempting (buffered line or socket readiness).
    pub fn wait(&mut self, timeout_ms: u16) -> io::Result<bool> {
        if self.buf.contains(&b'\n') {
            return Ok(true);
        }
        let Some(stream) = self.stream.as_ref() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// Reads more bytes from the socket into the buffer. `Ok(0)` means no
    /// data right now; a closed or broken connection flips the client to
    /// disconnected.
    fn fill(&mut self) -> io::Result<usize> {
        if self.buf.len() >= self.buf_limit {
            if self.buf_limit >= LINE_MAX {
                warn!(
                    limit = LINE_MAX,
                    "event record exceeds line ceiling, discarding buffer"
                );
                self.disconnect();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "event record too long",
                ));
            }
            self.buf_limit = (self.buf_limit * 2).min(LINE_MAX);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };

        let start = self.buf.len();
        self.buf.resize(self.buf_limit, 0);
        match stream.read(&mut self.buf[start..]) {
            Ok(0) => {
                self.buf.truncate(start);
                warn!("detector event socket closed");
                self.disconnect();
                Ok(0)
            }
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.buf.truncate(start);
                Ok(0)
            }
            Err(e) => {
                self.buf.truncate(start);
                warn!(error = %e, "detector event socket read failed");
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Returns the next complete line without its newline, or `None` when
    /// no complete line is buffered. The returned view is valid until the
    /// next call.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        let mut newline = self.buf.iter().position(|&b| b == b'\n');
        if newline.is_none() {
            if self.fill()? == 0 {
                return Ok(None);
            }
            newline = self.buf.iter().position(|&b| b == b'\n');
        }
        let Some(pos) = newline else {
            return Ok(None);
        };

        self.line.clear();
        self.line
            .push_str(&String::from_utf8_lossy(&self.buf[..pos]));
        self.buf.drain(..=pos);
        Ok(Some(&self.line))
    }
}

/// Counters kept by the ingestion thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct IngestCounters {
    pub lines_read: u64,
    pub events_parsed: u64,
    pub events_queued: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
}

struct ReaderShared {
    running: AtomicBool,
    lines_read: AtomicU64,
    events_parsed: AtomicU64,
    events_queued: AtomicU64,
    parse_errors: AtomicU64,
    reconnects: AtomicU64,
    detector_stats: Mutex<DetectorStats>,
}

/// The ingestion thread. Owns an [`EventStreamClient`] and feeds the queue.
pub struct IngestReader {
    shared: Arc<ReaderShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IngestReader {
    pub fn start(socket_path: impl AsRef<Path>, queue: EventQueue) -> Self {
        let shared = Arc::new(ReaderShared {
            running: AtomicBool::new(true),
            lines_read: AtomicU64::new(0),
            events_parsed: AtomicU64::new(0),
            events_queued: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            detector_stats: Mutex::new(DetectorStats::default()),
        });
        let thread_shared = Arc::clone(&shared);
        let path = socket_path.as_ref().to_path_buf();
        let thread = thread::Builder::new()
            .name("vigil-ingest".to_owned())
            .spawn(move || reader_loop(path, queue, thread_shared))
            .ok();
        IngestReader {
            shared,
            thread: Mutex::new(thread),
        }
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        info!("ingest reader stopped");
    }

    /// Latest detector statistics snapshot seen on the stream.
    pub fn detector_stats(&self) -> DetectorStats {
        self.shared
            .detector_stats
            .lock()
            .map(|s| *s)
            .unwrap_or_default()
    }

    pub fn counters(&self) -> IngestCounters {
        IngestCounters {
            lines_read: self.shared.lines_read.load(Ordering::Relaxed),
            events_parsed: self.shared.events_parsed.load(Ordering::Relaxed),
            events_queued: self.shared.events_queued.load(Ordering::Relaxed),
            parse_errors: self.shared.parse_errors.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
        }
    }
}

fn reader_loop(path: PathBuf, queue: EventQueue, shared: Arc<ReaderShared>) {
    info!("ingest reader started");
    let mut client = EventStreamClient::new(&path);

    while shared.running.load(Ordering::SeqCst) {
        if !client.is_connected() {
            if client.connect().is_err() {
                shared.reconnects.fetch_add(1, Ordering::Relaxed);
                // Sleep in short slices so shutdown stays responsive.
                let slices = RECONNECT_DELAY.as_millis() as u64 / 100;
                for _ in 0..slices {
                    if !shared.running.load(Ordering::SeqCst) {
                        return;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                continue;
            }
        }

        match client.wait(WAIT_TIMEOUT_MS) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(_) => {
                client.disconnect();
                continue;
            }
        }

        loop {
            let line = match client.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => break,
            };
            shared.lines_read.fetch_add(1, Ordering::Relaxed);

            match parser::parse(line) {
                Ok(Parsed::Stats(stats)) => {
                    if let Ok(mut latest) = shared.detector_stats.lock() {
                        *latest = stats;
                    }
                }
                Ok(Parsed::Event(event)) => {
                    shared.events_parsed.fetch_add(1, Ordering::Relaxed);
                    match queue.push(event) {
                        Ok(()) => {
                            shared.events_queued.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            // The queue's drop counter accounts for the loss.
                            debug!("event queue full, event dropped");
                        }
                    }
                }
                Ok(Parsed::Skip) => {}
                Err(e) => {
                    shared.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "discarding unparsable event line");
                }
            }

            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
        }

        if !client.is_connected() {
            warn!("detector event socket disconnected, will reconnect");
        }
    }

    info!("ingest reader stopping");
}
