//! Shared wire-level client for driving a real daemon process.
#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::process::{Child, Command};
use std::time::Duration;
use tempfile::TempDir;

pub const RESET: u8 = 0x00;
pub const OPEN: u8 = 0x01;
pub const CLOSE: u8 = 0x02;
pub const KILL: u8 = 0x03;
pub const EXIT_STATUS: u8 = 0x05;
pub const CLOSE_ACK: u8 = 0x06;
pub const WRITE_CTRL: u8 = 0x10;
pub const WRITE_STDIN: u8 = 0x11;
pub const WRITE_STDOUT: u8 = 0x12;
pub const ACK_CTRL: u8 = 0x20;
pub const ACK_STDIN: u8 = 0x21;
pub const ACK_STDOUT: u8 = 0x22;
pub const CLOSE_CTRL: u8 = 0x30;
pub const CLOSE_STDIN: u8 = 0x31;
pub const CLOSE_STDOUT: u8 = 0x32;
pub const CLOSE_STDERR: u8 = 0x33;

pub const WINDOW: u32 = 4096;

#[derive(Debug, Clone)]
pub struct Frame {
    pub cmd: u8,
    pub id: u8,
    pub arg: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn credit(&self) -> u32 {
        u32::from_le_bytes(self.payload.clone().try_into().unwrap())
    }
}

/// A daemon process under test plus the controller end of its socket.
pub struct MuxDaemon {
    child: Child,
    pub sock: UnixStream,
    _dir: TempDir,
}

impl MuxDaemon {
    pub fn launch() -> MuxDaemon {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execmux.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let child = Command::new(env!("CARGO_BIN_EXE_execmuxd"))
            .arg(&path)
            .spawn()
            .unwrap();
        let (sock, _) = listener.accept().unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        MuxDaemon {
            child,
            sock,
            _dir: dir,
        }
    }

    pub fn send(&mut self, cmd: u8, id: u8, arg: u8, payload: &[u8]) {
        assert!(payload.len() <= 255);
        let mut frame = vec![cmd, id, arg, payload.len() as u8];
        frame.extend_from_slice(payload);
        self.sock.write_all(&frame).unwrap();
    }

    /// Like `send`, but surfaces write errors instead of panicking; a
    /// violating peer can race the daemon's own exit mid-blast.
    pub fn try_send(&mut self, cmd: u8, id: u8, arg: u8, payload: &[u8]) -> std::io::Result<()> {
        assert!(payload.len() <= 255);
        let mut frame = vec![cmd, id, arg, payload.len() as u8];
        frame.extend_from_slice(payload);
        self.sock.write_all(&frame)
    }

    pub fn send_ack(&mut self, cmd: u8, id: u8, credit: u32) {
        let mut frame = vec![cmd, id, 0, 4];
        frame.extend_from_slice(&credit.to_le_bytes());
        self.sock.write_all(&frame).unwrap();
    }

    /// Open a slot and consume the two window-seeding ACKs.
    pub fn open(&mut self, id: u8) {
        self.send(OPEN, id, 0, &[]);
        let ack = self.recv();
        assert_eq!((ack.cmd, ack.id, ack.credit()), (ACK_CTRL, id, WINDOW));
        let ack = self.recv();
        assert_eq!((ack.cmd, ack.id, ack.credit()), (ACK_STDIN, id, WINDOW));
    }

    /// Deliver a NUL-joined argument vector on the control stream and
    /// half-close it so the child can exec.
    pub fn run_command(&mut self, id: u8, argv: &[&str]) {
        let mut payload = Vec::new();
        for arg in argv {
            payload.extend_from_slice(arg.as_bytes());
            payload.push(0);
        }
        for chunk in payload.chunks(255) {
            self.send(WRITE_CTRL, id, 0, chunk);
        }
        self.send(CLOSE_CTRL, id, 0, &[]);
    }

    pub fn recv(&mut self) -> Frame {
        let mut header = [0u8; 4];
        self.sock.read_exact(&mut header).unwrap();
        let body_len = if (0x20..=0x23).contains(&header[0]) {
            4
        } else {
            header[3] as usize
        };
        let mut payload = vec![0u8; body_len];
        self.sock.read_exact(&mut payload).unwrap();
        Frame {
            cmd: header[0],
            id: header[1],
            arg: header[2],
            payload,
        }
    }

    /// Collect frames until one matches, returning everything seen (the
    /// matching frame last).
    pub fn recv_until(&mut self, pred: impl Fn(&Frame) -> bool) -> Vec<Frame> {
        let mut seen = Vec::new();
        for _ in 0..100_000 {
            let frame = self.recv();
            let done = pred(&frame);
            seen.push(frame);
            if done {
                return seen;
            }
        }
        panic!("no matching frame in 100000 reads; saw {} frames", seen.len());
    }

    /// Assert the daemon emits nothing for a while.
    pub fn assert_silence(&mut self) {
        self.sock
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut probe = [0u8; 1];
        match self.sock.read(&mut probe) {
            Ok(n) => panic!("expected silence, read {n} bytes"),
            Err(err) => assert!(
                matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                "expected timeout, got {err}"
            ),
        }
        self.sock
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
    }

    /// Send RESET and check the daemon exits with status 0.
    pub fn reset(mut self) {
        self.send(RESET, 0, 0, &[]);
        let status = self.child.wait().unwrap();
        assert_eq!(status.code(), Some(0));
    }

    /// Stop sending; the daemon sees EOF on its next header read.
    pub fn shutdown_write(&mut self) {
        self.sock.shutdown(std::net::Shutdown::Write).unwrap();
    }

    /// Drain the socket to EOF and check the daemon died with status 1.
    pub fn expect_fatal(mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.sock.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) => panic!("expected daemon to close the socket, got {err}"),
            }
        }
        let status = self.child.wait().unwrap();
        assert_eq!(status.code(), Some(1));
    }
}

impl Drop for MuxDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Concatenated payload of all WRITE_STDOUT frames for a slot.
pub fn stdout_bytes(frames: &[Frame], id: u8) -> Vec<u8> {
    frames
        .iter()
        .filter(|f| f.cmd == WRITE_STDOUT && f.id == id)
        .flat_map(|f| f.payload.iter().copied())
        .collect()
}

pub fn has_frame(frames: &[Frame], cmd: u8, id: u8) -> bool {
    frames.iter().any(|f| f.cmd == cmd && f.id == id)
}
