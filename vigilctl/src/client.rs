// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Blocking request/response client for the daemon's control socket.

use anyhow::Context;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use vigil_ipc::{read_frame, write_frame, Request, Response};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub fn connect(socket_path: &Path) -> anyhow::Result<ControlClient> {
        let stream = UnixStream::connect(socket_path).with_context(|| {
            format!(
                "cannot connect to daemon socket {} (is vigild running?)",
                socket_path.display()
            )
        })?;
        stream
            .set_read_timeout(Some(IO_TIMEOUT))
            .context("failed to set read timeout")?;
        stream
            .set_write_timeout(Some(IO_TIMEOUT))
            .context("failed to set write timeout")?;
        Ok(ControlClient { stream })
    }

    /// Sends one request and returns the raw response payload.
    pub fn call_raw(&mut self, request: &Request) -> anyhow::Result<String> {
        let payload = serde_json::to_vec(request).context("failed to encode request")?;
        write_frame(&mut self.stream, &payload).context("failed to send request")?;
        let response = read_frame(&mut self.stream).context("no response from daemon")?;
        String::from_utf8(response).context("daemon sent a non-UTF-8 response")
    }

    /// Sends one request and decodes the response.
    pub fn call(&mut self, request: &Request) -> anyhow::Result<(Response, String)> {
        let raw = self.call_raw(request)?;
        let response = serde_json::from_str(&raw).context("invalid response from daemon")?;
        Ok((response, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use vigil_ipc::Command;

    #[test]
    fn call_round_trips_against_a_fake_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_frame(&mut stream).unwrap();
            let request: Request = serde_json::from_slice(&request).unwrap();
            assert_eq!(request.command, "status");

            let response = Response::ok(serde_json::json!({"status": "running"}));
            write_frame(&mut stream, &serde_json::to_vec(&response).unwrap()).unwrap();
        });

        let mut client = ControlClient::connect(&path).unwrap();
        let (response, raw) = client.call(&Request::new(Command::Status)).unwrap();
        assert!(response.success);
        assert_eq!(response.data.unwrap()["status"], "running");
        assert!(raw.contains("\"success\":true"));

        server.join().unwrap();
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ControlClient::connect(&dir.path().join("absent.sock")).is_err());
    }
}
