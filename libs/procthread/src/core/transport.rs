// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Per-process Unix-socket transport.
//!
//! Every process owns one non-blocking listening socket at
//! `<socket_dir>/<pid>.sock`. A send is a full connect / write / close cycle
//! carrying a single frame: the payload followed by one NUL byte. The
//! receiving side is woken by `SIG_DATA` and drains every pending
//! connection.

use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::config::{RuntimeConfig, socket_path_in};
use super::error::TransportError;
use super::process::{self, SIG_DATA, ThreadId};

/// Frame terminator.
pub const FRAME_TERMINATOR: u8 = 0;

const READ_CHUNK: usize = 64 * 1024;

/// The listening side of a process's endpoint.
#[derive(Debug)]
pub struct Endpoint {
    listener: UnixListener,
    path: PathBuf,
    owner: ThreadId,
}

impl Endpoint {
    /// Bind the endpoint for `owner`, replacing any stale socket file.
    pub fn bind(dir: &Path, owner: ThreadId) -> std::io::Result<Self> {
        let path = socket_path_in(dir, owner);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Removed stale endpoint {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))?;

        tracing::debug!("Endpoint for {} listening at {}", owner, path.display());
        Ok(Self {
            listener,
            path,
            owner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Accept the next pending connection, if any.
    pub fn accept_pending(&self) -> std::io::Result<Option<UnixStream>> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => return Ok(Some(stream)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Accept and read every pending connection. Empty frames are skipped.
    pub fn drain(&self, stall: Duration) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            let mut stream = match self.accept_pending() {
                Ok(Some(stream)) => stream,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Endpoint {} accept failed: {}", self.path.display(), e);
                    break;
                }
            };
            match read_frame(&mut stream, stall) {
                Ok(frame) if frame.is_empty() => {}
                Ok(frame) => frames.push(frame),
                Err(e) => tracing::warn!("Dropping partially received frame: {}", e),
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        frames
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // A forked child carries a copy of its parent's endpoint; only the
        // owning process may remove the file.
        if ThreadId::current() == self.owner {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Read one frame: everything up to the first terminator, end of stream, or
/// a stall of `stall` without new bytes.
pub fn read_frame(stream: &mut UnixStream, stall: Duration) -> std::io::Result<Vec<u8>> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(stall))?;

    let mut frame = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if let Some(end) = chunk[..n].iter().position(|b| *b == FRAME_TERMINATOR) {
                    frame.extend_from_slice(&chunk[..end]);
                    return Ok(frame);
                }
                frame.extend_from_slice(&chunk[..n]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                tracing::warn!(
                    "Receive stalled for {:?} after {} bytes",
                    stall,
                    frame.len()
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(frame)
}

/// Client side of the transport for one process identity.
#[derive(Debug, Clone)]
pub struct Transport {
    socket_dir: PathBuf,
    owner: ThreadId,
    grace: Duration,
    retry_interval: Duration,
}

impl Transport {
    pub fn new(config: &RuntimeConfig, owner: ThreadId) -> Self {
        Self {
            socket_dir: config.socket_dir.clone(),
            owner,
            grace: config.send_grace,
            retry_interval: config.poll_interval,
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn endpoint_path(&self, target: ThreadId) -> PathBuf {
        socket_path_in(&self.socket_dir, target)
    }

    /// Send one frame and wake the target with `SIG_DATA` on every chunk.
    pub fn send(&self, target: ThreadId, payload: &[u8]) -> Result<(), TransportError> {
        self.send_with(target, payload, || {
            process::send_signal(target, SIG_DATA);
        })
    }

    /// Send one frame, calling `notify` after the connection is established
    /// and after every successful partial write.
    pub fn send_with(
        &self,
        target: ThreadId,
        payload: &[u8],
        mut notify: impl FnMut(),
    ) -> Result<(), TransportError> {
        if target == self.owner {
            return Err(TransportError::SelfSend);
        }

        let path = self.endpoint_path(target);
        let mut stream = UnixStream::connect(&path)
            .map_err(|source| TransportError::Connect { target, source })?;
        stream.set_nonblocking(true)?;
        notify();

        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.extend_from_slice(payload);
        frame.push(FRAME_TERMINATOR);

        let mut sent = 0;
        let mut last_progress = Instant::now();
        while sent < frame.len() {
            match stream.write(&frame[sent..]) {
                Ok(n) if n > 0 => {
                    sent += n;
                    last_progress = Instant::now();
                    notify();
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    return Err(self.broken_pipe(target, sent, frame.len()));
                }
                Err(e) => return Err(TransportError::Io(e)),
            }

            if sent < frame.len() {
                if last_progress.elapsed() > self.grace {
                    let _ = stream.shutdown(Shutdown::Both);
                    return Err(self.broken_pipe(target, sent, frame.len()));
                }
                std::thread::sleep(self.retry_interval);
            }
        }

        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    fn broken_pipe(&self, target: ThreadId, sent: usize, total: usize) -> TransportError {
        tracing::warn!(
            "[{}] BROKEN PIPE: failed to transmit message to {} ({} bytes sent - {} bytes remaining)",
            self.owner,
            target,
            sent,
            total - sent
        );
        TransportError::BrokenPipe {
            sent,
            remaining: total - sent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    // Pids that cannot collide with the test process.
    fn fake(n: i32) -> ThreadId {
        ThreadId::new(n).unwrap()
    }

    fn config(dir: &Path) -> RuntimeConfig {
        RuntimeConfig::new()
            .with_socket_dir(dir)
            .with_send_grace(Duration::from_millis(100))
            .with_read_stall(Duration::from_millis(200))
    }

    #[test]
    fn test_refuses_to_send_to_self() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Transport::new(&config(tmp.path()), fake(900_001));
        let err = transport.send_with(fake(900_001), b"{}", || {}).unwrap_err();
        assert!(matches!(err, TransportError::SelfSend));
    }

    #[test]
    fn test_missing_endpoint_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Transport::new(&config(tmp.path()), fake(900_001));
        let err = transport.send_with(fake(900_002), b"{}", || {}).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn test_frames_arrive_in_send_order() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let endpoint = Endpoint::bind(tmp.path(), fake(900_010)).unwrap();
        let transport = Transport::new(&cfg, fake(900_011));

        let notified = Cell::new(0);
        for i in 0..5 {
            let payload = format!("{{\"seq\":{}}}", i);
            transport
                .send_with(fake(900_010), payload.as_bytes(), || {
                    notified.set(notified.get() + 1)
                })
                .unwrap();
        }
        assert!(notified.get() >= 10);

        let frames = endpoint.drain(cfg.read_stall);
        let got: Vec<String> = frames
            .into_iter()
            .map(|f| String::from_utf8(f).unwrap())
            .collect();
        let want: Vec<String> = (0..5).map(|i| format!("{{\"seq\":{}}}", i)).collect();
        assert_eq!(got, want);
        assert!(endpoint.drain(cfg.read_stall).is_empty());
    }

    #[test]
    fn test_large_frame_is_delivered_whole() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let endpoint = Endpoint::bind(tmp.path(), fake(900_020)).unwrap();
        let transport = Transport::new(&cfg, fake(900_021));
        let payload = vec![b'x'; 3 * READ_CHUNK + 17];

        let reader = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if let Some(mut stream) = endpoint.accept_pending().unwrap() {
                    return read_frame(&mut stream, Duration::from_secs(2)).unwrap();
                }
                assert!(Instant::now() < deadline, "no connection arrived");
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        transport.send_with(fake(900_020), &payload, || {}).unwrap();
        assert_eq!(reader.join().unwrap(), payload);
    }

    #[test]
    fn test_read_stops_at_terminator() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.write_all(b"hello\0trailing").unwrap();
        let frame = read_frame(&mut b, Duration::from_millis(100)).unwrap();
        assert_eq!(frame, b"hello");
    }

    #[test]
    fn test_endpoint_removes_its_file_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = {
            let endpoint = Endpoint::bind(tmp.path(), ThreadId::current()).unwrap();
            assert!(endpoint.path().exists());
            endpoint.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
