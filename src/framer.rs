//! Frame I/O on the control socket
//!
//! The framer is the only owner of the socket. Reads happen in two
//! phases: a complete 4-byte header, then (depending on the command) a
//! payload or a credit count. Sub-reads inside a frame block until
//! complete so a partial frame never escapes; the peer is the sole
//! source of socket data, and frames are small and bounded. Writes are
//! atomic per frame, and any socket failure is fatal: a lost peer
//! terminates the daemon.

use crate::protocol::{Command, Header, Role, ACK_WIDTH, HEADER_LEN};
use anyhow::{Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

pub struct Framer {
    sock: UnixStream,
}

impl Framer {
    pub fn new(sock: UnixStream) -> Framer {
        Framer { sock }
    }

    /// Connect to the peer's listening socket. The daemon is
    /// connect-only; failure here is fatal.
    pub fn connect(path: &Path) -> Result<Framer> {
        let sock = UnixStream::connect(path)
            .with_context(|| format!("connect to socket {}", path.display()))?;
        Ok(Framer::new(sock))
    }

    pub fn socket(&self) -> &UnixStream {
        &self.sock
    }

    /// Read one complete frame header. Peer EOF here means the
    /// connection is gone.
    pub fn read_header(&mut self) -> Result<Header> {
        let mut raw = [0u8; HEADER_LEN];
        self.sock.read_exact(&mut raw).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                anyhow::anyhow!("peer closed the connection")
            } else {
                anyhow::Error::new(err).context("read frame header")
            }
        })?;
        Ok(Header::parse(raw)?)
    }

    /// Read exactly `buf.len()` payload bytes of the current frame.
    pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<()> {
        self.sock
            .read_exact(buf)
            .context("read frame payload")
    }

    /// Read the 4-byte little-endian credit count of an ACK frame.
    pub fn read_credit(&mut self) -> Result<u32> {
        let mut raw = [0u8; ACK_WIDTH];
        self.sock
            .read_exact(&mut raw)
            .context("read ACK credit")?;
        Ok(u32::from_le_bytes(raw))
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sock.write_all(bytes).context("write to socket")
    }

    pub fn send_header(&mut self, command: Command, id: u8, arg: u8, len: u8) -> Result<()> {
        let header = Header {
            command,
            id,
            arg,
            len,
        };
        self.send(&header.encode())
    }

    /// Header of a WRITE frame; the payload follows via `write_payload`.
    pub fn send_data_header(&mut self, role: Role, id: u8, len: u8) -> Result<()> {
        self.send_header(Command::Data(role), id, 0, len)
    }

    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.send(bytes)
    }

    /// Grant the peer `amount` more bytes of send window on a stream.
    pub fn send_ack(&mut self, role: Role, id: u8, amount: u32) -> Result<()> {
        let header = Header {
            command: Command::Ack(role),
            id,
            arg: 0,
            len: ACK_WIDTH as u8,
        };
        let mut frame = [0u8; HEADER_LEN + ACK_WIDTH];
        frame[..HEADER_LEN].copy_from_slice(&header.encode());
        frame[HEADER_LEN..].copy_from_slice(&amount.to_le_bytes());
        self.send(&frame)
    }

    pub fn send_close_stream(&mut self, role: Role, id: u8) -> Result<()> {
        self.send_header(Command::CloseStream(role), id, 0, 0)
    }

    pub fn send_close_ack(&mut self, id: u8) -> Result<()> {
        self.send_header(Command::CloseAck, id, 255, 0)
    }

    pub fn send_exit_status(&mut self, id: u8, status: u8) -> Result<()> {
        self.send_header(Command::ExitStatus, id, status, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_ack_frame_layout() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let mut framer = Framer::new(ours);

        framer.send_ack(Role::Stdin, 7, 4096).unwrap();

        let mut frame = [0u8; 8];
        theirs.read_exact(&mut frame).unwrap();
        assert_eq!(&frame[..4], &[0x21, 7, 0, 4]);
        assert_eq!(u32::from_le_bytes(frame[4..].try_into().unwrap()), 4096);
    }

    #[test]
    fn test_header_roundtrip_over_socket() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut sender = Framer::new(ours);
        let mut receiver = Framer::new(theirs);

        sender.send_exit_status(12, 9).unwrap();
        sender.send_close_ack(12).unwrap();

        let header = receiver.read_header().unwrap();
        assert_eq!(header.command, Command::ExitStatus);
        assert_eq!(header.id, 12);
        assert_eq!(header.arg, 9);

        let header = receiver.read_header().unwrap();
        assert_eq!(header.command, Command::CloseAck);
        assert_eq!(header.arg, 255);
    }

    #[test]
    fn test_peer_eof_is_reported() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut framer = Framer::new(ours);
        drop(theirs);

        let err = framer.read_header().unwrap_err();
        assert!(err.to_string().contains("peer closed"));
    }
}
