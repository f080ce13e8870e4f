// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The control socket: a poll(2)-multiplexed unix listener serving
//! length-prefixed JSON request/response frames to local clients.

use crate::handlers::{self, ControlContext};
use anyhow::Context;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use vigil_ipc::{FrameBuffer, IpcError, Request, Response};

pub const MAX_CLIENTS: usize = 32;
const SOCKET_MODE: u32 = 0o660;
const SOCKET_BACKLOG: i32 = 5;
const POLL_TICK_MS: u16 = 100;
/// Bound on blocking while flushing one response to a slow client.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Default)]
pub struct ControlCounters {
    pub connections_accepted: u64,
    pub requests_processed: u64,
    pub errors: u64,
}

struct ServerShared {
    running: AtomicBool,
    connections_accepted: AtomicU64,
    requests_processed: AtomicU64,
    errors: AtomicU64,
}

pub struct ControlServer {
    shared: Arc<ServerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    socket_path: PathBuf,
}

struct ClientSlot {
    stream: UnixStream,
    frames: FrameBuffer,
}

impl ControlServer {
    /// Binds the listener (0660, backlog 5) and spawns the server thread.
    pub fn start(socket_path: impl AsRef<Path>, ctx: Arc<ControlContext>) -> anyhow::Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let listener = bind_listener(&socket_path)?;

        let shared = Arc::new(ServerShared {
            running: AtomicBool::new(true),
            connections_accepted: AtomicU64::new(0),
            requests_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        });
        let thread_shared = Arc::clone(&shared);
        let thread_path = socket_path.clone();
        let thread = thread::Builder::new()
            .name("vigil-control".to_owned())
            .spawn(move || server_loop(listener, thread_path, ctx, thread_shared))
            .context("failed to spawn control server thread")?;

        info!(path = %socket_path.display(), "control server listening");
        Ok(ControlServer {
            shared,
            thread: Mutex::new(Some(thread)),
            socket_path,
        })
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        info!("control server stopped");
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn counters(&self) -> ControlCounters {
        ControlCounters {
            connections_accepted: self.shared.connections_accepted.load(Ordering::Relaxed),
            requests_processed: self.shared.requests_processed.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
        }
    }
}

fn bind_listener(path: &Path) -> anyhow::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("could not remove stale socket {}", path.display()))?;
    }

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .context("control socket creation failed")?;
    let addr = UnixAddr::new(path).context("invalid control socket path")?;
    bind(fd.as_raw_fd(), &addr).context("control socket bind failed")?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
        .context("failed to set control socket permissions")?;
    listen(&fd, Backlog::new(SOCKET_BACKLOG).context("invalid backlog")?)
        .context("control socket listen failed")?;
    Ok(UnixListener::from(fd))
}

fn server_loop(
    listener: UnixListener,
    socket_path: PathBuf,
    ctx: Arc<ControlContext>,
    shared: Arc<ServerShared>,
) {
    info!("control server thread started");
    let mut clients: Vec<ClientSlot> = Vec::with_capacity(MAX_CLIENTS);

    while shared.running.load(Ordering::SeqCst) {
        let mut fds = Vec::with_capacity(clients.len() + 1);
        fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        for client in &clients {
            fds.push(PollFd::new(client.stream.as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::from(POLL_TICK_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "control poll failed");
                break;
            }
        }

        let listener_ready = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let ready: Vec<usize> = fds[1..]
            .iter()
            .enumerate()
            .filter(|(_, fd)| {
                fd.revents().is_some_and(|r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                })
            })
            .map(|(i, _)| i)
            .collect();
        drop(fds);

        // Highest index first so removals do not shift pending entries.
        for index in ready.into_iter().rev() {
            if !handle_client(&mut clients[index], &ctx, &shared) {
                clients.remove(index);
                debug!("control client disconnected");
            }
        }

        if listener_ready {
            accept_clients(&listener, &mut clients, &shared);
        }
    }

    drop(clients);
    let _ = std::fs::remove_file(&socket_path);
    info!("control server thread stopped");
}

fn accept_clients(listener: &UnixListener, clients: &mut Vec<ClientSlot>, shared: &ServerShared) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if clients.len() >= MAX_CLIENTS {
                    warn!("control client limit reached, rejecting connection");
                    continue;
                }
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(error = %e, "failed to set control client non-blocking");
                    continue;
                }
                shared.connections_accepted.fetch_add(1, Ordering::Relaxed);
                debug!("control client connected");
                clients.push(ClientSlot {
                    stream,
                    frames: FrameBuffer::new(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "control accept failed");
                return;
            }
        }
    }
}

/// Reads whatever the client has sent, answering each complete frame.
/// Returns false when the connection should be dropped.
fn handle_client(client: &mut ClientSlot, ctx: &ControlContext, shared: &ServerShared) -> bool {
    let mut chunk = [0u8; 4096];
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => return false,
            Ok(n) => {
                client.frames.extend(&chunk[..n]);
                loop {
                    match client.frames.next_frame() {
                        Ok(Some(payload)) => {
                            let response = process_frame(ctx, &payload, shared);
                            if send_response(client, &response).is_err() {
                                shared.errors.fetch_add(1, Ordering::Relaxed);
                                return false;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // Oversized frame: protocol violation from this
                            // client only.
                            warn!(error = %e, "closing control client");
                            shared.errors.fetch_add(1, Ordering::Relaxed);
                            return false;
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "control client read failed");
                return false;
            }
        }
    }
}

fn process_frame(ctx: &ControlContext, payload: &[u8], shared: &ServerShared) -> Response {
    let request: Request = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "unparsable control request");
            shared.errors.fetch_add(1, Ordering::Relaxed);
            return Response::err(IpcError::InvalidParams, "Invalid request");
        }
    };
    shared.requests_processed.fetch_add(1, Ordering::Relaxed);
    handlers::handle_request(ctx, &request)
}

fn send_response(client: &mut ClientSlot, response: &Response) -> io::Result<()> {
    let payload = serde_json::to_vec(response)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    write_all_bounded(&mut client.stream, &frame)
}

/// write_all over a non-blocking socket, waiting for writability between
/// short writes, bounded by [`SEND_TIMEOUT`].
fn write_all_bounded(stream: &mut UnixStream, mut buf: &[u8]) -> io::Result<()> {
    let deadline = Instant::now() + SEND_TIMEOUT;
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::from(io::ErrorKind::TimedOut));
                }
                let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
                match poll(&mut fds, PollTimeout::from(POLL_TICK_MS)) {
                    Ok(_) => {}
                    Err(nix::errno::Errno::EINTR) => {}
                    Err(e) => return Err(io::Error::from(e)),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
