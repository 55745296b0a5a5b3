//! Wire protocol between the daemon and its controlling peer
//!
//! Every frame starts with a fixed 4-byte header; WRITE frames carry a
//! payload of `len` bytes and ACK frames carry a 4-byte little-endian
//! credit count.
//!
//! ```text
//! ┌───────┬───────┬───────┬───────┬─────────────────────────┐
//! │  cmd  │  id   │  arg  │  len  │  payload (WRITE/ACK)    │
//! │ (1 B) │ (1 B) │ (1 B) │ (1 B) │  0..255 B / 4 B credit  │
//! └───────┴───────┴───────┴───────┴─────────────────────────┘
//! ```
//!
//! The low two bits of a WRITE/ACK/CLOSE command select the stream role
//! (0 = control, 1 = stdin, 2 = stdout, 3 = stderr).

/// Capacity of each per-stream ring buffer, and the send window seeded to
/// the peer for every outbound stream on OPEN.
pub const RING_CAPACITY: usize = 4096;

/// Largest payload a single WRITE frame can carry (the header length field
/// is one byte).
pub const MAX_DATA_FRAME: usize = 255;

/// Width of the credit count following an ACK header, pinned to 4 bytes
/// little-endian on the wire regardless of platform.
pub const ACK_WIDTH: usize = 4;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 4;

/// Number of process slots addressable by the one-byte id field.
pub const SLOT_COUNT: usize = 256;

/// Cap on the NUL-delimited argument vector read from the control stream.
pub const MAX_ARGV_BYTES: usize = 1023;

/// Cap on the number of arguments parsed from the control stream.
pub const MAX_ARGS: usize = 255;

/// Which of a process's four byte streams a frame refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Control = 0,
    Stdin = 1,
    Stdout = 2,
    Stderr = 3,
}

/// Data flow direction of a stream, fixed by its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes travel peer → daemon → child (control, stdin).
    ToChild,
    /// Bytes travel child → daemon → peer (stdout, stderr).
    FromChild,
}

impl Role {
    /// Decode a role from the low two bits of a command byte.
    pub fn from_two_bits(bits: u8) -> Role {
        match bits & 0b11 {
            0 => Role::Control,
            1 => Role::Stdin,
            2 => Role::Stdout,
            _ => Role::Stderr,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            Role::Control | Role::Stdin => Direction::ToChild,
            Role::Stdout | Role::Stderr => Direction::FromChild,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Control => "control",
            Role::Stdin => "stdin",
            Role::Stdout => "stdout",
            Role::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded command byte of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Peer asks the daemon to exit immediately (exit status 0).
    Reset,
    /// Allocate a process slot and fork.
    Open,
    /// Kill, reap and tear down a slot; answered with `CloseAck`.
    Close,
    /// Deliver the signal in `arg` to a slot's child.
    Kill,
    /// Daemon → peer: a child exited; `arg` is the code or signal number.
    ExitStatus,
    /// Daemon → peer: a slot is fully torn down.
    CloseAck,
    /// Stream data; `len` payload bytes follow the header.
    Data(Role),
    /// Credit grant; a 4-byte little-endian count follows the header.
    Ack(Role),
    /// Half-close of one direction of one stream.
    CloseStream(Role),
}

impl Command {
    pub fn from_wire(byte: u8) -> Result<Command, ProtocolError> {
        match byte {
            0x00 => Ok(Command::Reset),
            0x01 => Ok(Command::Open),
            0x02 => Ok(Command::Close),
            0x03 => Ok(Command::Kill),
            0x05 => Ok(Command::ExitStatus),
            0x06 => Ok(Command::CloseAck),
            0x10..=0x13 => Ok(Command::Data(Role::from_two_bits(byte))),
            0x20..=0x23 => Ok(Command::Ack(Role::from_two_bits(byte))),
            0x30..=0x33 => Ok(Command::CloseStream(Role::from_two_bits(byte))),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Command::Reset => 0x00,
            Command::Open => 0x01,
            Command::Close => 0x02,
            Command::Kill => 0x03,
            Command::ExitStatus => 0x05,
            Command::CloseAck => 0x06,
            Command::Data(role) => 0x10 | role as u8,
            Command::Ack(role) => 0x20 | role as u8,
            Command::CloseStream(role) => 0x30 | role as u8,
        }
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub id: u8,
    pub arg: u8,
    pub len: u8,
}

impl Header {
    pub fn parse(raw: [u8; HEADER_LEN]) -> Result<Header, ProtocolError> {
        Ok(Header {
            command: Command::from_wire(raw[0])?,
            id: raw[1],
            arg: raw[2],
            len: raw[3],
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        [self.command.to_wire(), self.id, self.arg, self.len]
    }
}

/// Violations of the wire protocol or of slot bookkeeping. The daemon
/// serves a single trusted peer, so every one of these is fatal.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command byte 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("frame 0x{0:02x} is not valid coming from the peer")]
    DirectionViolation(u8),

    #[error("ACK frame carries length {len}, expected {ACK_WIDTH}")]
    BadAckLength { len: u8 },

    #[error("no process in slot {0}")]
    NoSuchProcess(u8),

    #[error("slot {0} is already in use")]
    SlotOccupied(u8),

    #[error("{role} stream of slot {slot} is closed")]
    StreamClosed { slot: u8, role: Role },

    #[error("peer exceeded its send window on {role} of slot {slot} ({len} bytes, {window} granted)")]
    WindowOverrun {
        slot: u8,
        role: Role,
        len: usize,
        window: usize,
    },

    #[error("invalid signal number {0}")]
    BadSignal(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            command: Command::Data(Role::Stdin),
            id: 42,
            arg: 0,
            len: 255,
        };

        let raw = header.encode();
        assert_eq!(raw, [0x11, 42, 0, 255]);
        assert_eq!(Header::parse(raw).unwrap(), header);
    }

    #[test]
    fn test_command_code_families() {
        assert_eq!(Command::from_wire(0x00).unwrap(), Command::Reset);
        assert_eq!(Command::from_wire(0x01).unwrap(), Command::Open);
        assert_eq!(Command::from_wire(0x02).unwrap(), Command::Close);
        assert_eq!(Command::from_wire(0x03).unwrap(), Command::Kill);
        assert_eq!(Command::from_wire(0x05).unwrap(), Command::ExitStatus);
        assert_eq!(Command::from_wire(0x06).unwrap(), Command::CloseAck);

        assert_eq!(
            Command::from_wire(0x10).unwrap(),
            Command::Data(Role::Control)
        );
        assert_eq!(
            Command::from_wire(0x13).unwrap(),
            Command::Data(Role::Stderr)
        );
        assert_eq!(Command::from_wire(0x22).unwrap(), Command::Ack(Role::Stdout));
        assert_eq!(
            Command::from_wire(0x31).unwrap(),
            Command::CloseStream(Role::Stdin)
        );
    }

    #[test]
    fn test_wire_codes_roundtrip() {
        let commands = [
            Command::Reset,
            Command::Open,
            Command::Close,
            Command::Kill,
            Command::ExitStatus,
            Command::CloseAck,
            Command::Data(Role::Control),
            Command::Data(Role::Stdout),
            Command::Ack(Role::Stdin),
            Command::Ack(Role::Stderr),
            Command::CloseStream(Role::Control),
            Command::CloseStream(Role::Stderr),
        ];

        for command in commands {
            assert_eq!(Command::from_wire(command.to_wire()).unwrap(), command);
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        for byte in [0x04u8, 0x07, 0x0f, 0x14, 0x24, 0x34, 0x40, 0xff] {
            assert!(matches!(
                Command::from_wire(byte),
                Err(ProtocolError::UnknownCommand(b)) if b == byte
            ));
        }
    }

    #[test]
    fn test_role_directions() {
        assert_eq!(Role::Control.direction(), Direction::ToChild);
        assert_eq!(Role::Stdin.direction(), Direction::ToChild);
        assert_eq!(Role::Stdout.direction(), Direction::FromChild);
        assert_eq!(Role::Stderr.direction(), Direction::FromChild);
    }
}
