//! Per-stream ring buffer with credit-based flow control
//!
//! Each process stream owns one `PipeBuf`: a 4096-byte ring between the
//! control socket and one end of a child pipe, plus the credit counter
//! that bounds how much the other side may still send. Outbound buffers
//! (control, stdin) fill from the socket and drain into the child;
//! inbound buffers (stdout, stderr) fill from the child and drain into
//! the socket, but only as far as the peer has granted credit.

use crate::daemon::{Poller, Token};
use crate::framer::Framer;
use crate::protocol::{Direction, ProtocolError, Role, MAX_DATA_FRAME, RING_CAPACITY};
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::EpollFlags;
use nix::unistd;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use tracing::{debug, warn};

/// One direction of one stream of one process.
pub struct PipeBuf {
    slot: u8,
    role: Role,
    generation: u32,
    /// Daemon-side pipe end; `None` once closed, never revived.
    fd: Option<OwnedFd>,
    buf: Box<[u8; RING_CAPACITY]>,
    /// Index of the first occupied byte.
    start: usize,
    /// Number of occupied bytes. The write position is derived:
    /// `(start + count) % RING_CAPACITY`.
    count: usize,
    /// Outbound: bytes the peer may still send us. Inbound: bytes the
    /// peer has authorized us to send.
    credit: usize,
    /// Close requested (by the peer or by child EOF); no new payload is
    /// accepted once set.
    eof: bool,
    registered: bool,
}

impl PipeBuf {
    fn new(slot: u8, role: Role, generation: u32, fd: OwnedFd, credit: usize) -> PipeBuf {
        PipeBuf {
            slot,
            role,
            generation,
            fd: Some(fd),
            buf: Box::new([0u8; RING_CAPACITY]),
            start: 0,
            count: 0,
            credit,
            eof: false,
            registered: false,
        }
    }

    /// Create an outbound (control/stdin) buffer. The daemon keeps the
    /// non-blocking write end; the returned read end goes to the child.
    /// The peer's send window starts at the full ring capacity; the
    /// matching ACK frame is emitted by the slot open path.
    pub fn outbound(slot: u8, role: Role, generation: u32) -> Result<(PipeBuf, OwnedFd)> {
        let (read_end, write_end) = unistd::pipe().context("create pipe")?;
        set_nonblocking(&write_end)?;
        Ok((
            PipeBuf::new(slot, role, generation, write_end, RING_CAPACITY),
            read_end,
        ))
    }

    /// Create an inbound (stdout/stderr) buffer. The daemon keeps the
    /// non-blocking read end; the returned write end goes to the child.
    /// Credit starts at zero, so nothing is read until the peer grants
    /// a window.
    pub fn inbound(slot: u8, role: Role, generation: u32) -> Result<(PipeBuf, OwnedFd)> {
        let (read_end, write_end) = unistd::pipe().context("create pipe")?;
        set_nonblocking(&read_end)?;
        Ok((PipeBuf::new(slot, role, generation, read_end, 0), write_end))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn direction(&self) -> Direction {
        self.role.direction()
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn buffered(&self) -> usize {
        self.count
    }

    pub fn credit(&self) -> usize {
        self.credit
    }

    /// Copy `len` bytes of WRITE payload from the socket into the ring.
    /// The peer must stay inside the window it was granted; overrunning
    /// it (which would also overrun the ring) is a protocol violation.
    pub fn accept_from_peer(&mut self, framer: &mut Framer, poll: &Poller, len: usize) -> Result<()> {
        if self.eof || self.fd.is_none() {
            return Err(ProtocolError::StreamClosed {
                slot: self.slot,
                role: self.role,
            }
            .into());
        }
        if len > self.credit {
            return Err(ProtocolError::WindowOverrun {
                slot: self.slot,
                role: self.role,
                len,
                window: self.credit,
            }
            .into());
        }

        let mut remaining = len;
        while remaining > 0 {
            let end = (self.start + self.count) % RING_CAPACITY;
            // Split transfers that would cross the wrap boundary.
            let n = remaining.min(RING_CAPACITY - end);
            framer.read_payload(&mut self.buf[end..end + n])?;
            self.count += n;
            self.credit -= n;
            remaining -= n;
        }

        debug!(
            slot = self.slot,
            role = self.role.name(),
            len,
            buffered = self.count,
            "buffered payload from peer"
        );
        self.sync_registration(poll)
    }

    /// The child pipe is writable: drain buffered bytes into it and grant
    /// the peer back exactly what was drained, so its window keeps
    /// tracking the ring's free space.
    pub fn drain_to_child(&mut self, framer: &mut Framer, poll: &Poller) -> Result<()> {
        let mut drained = 0usize;
        while self.count > 0 {
            let n = self.count.min(RING_CAPACITY - self.start);
            let result = match self.fd.as_ref() {
                Some(fd) => unistd::write(fd, &self.buf[self.start..self.start + n]),
                None => break,
            };
            match result {
                Ok(0) => break,
                Ok(written) => {
                    self.start = (self.start + written) % RING_CAPACITY;
                    self.count -= written;
                    drained += written;
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) => {
                    // The child went away with input still pending; the
                    // bytes have nowhere to go.
                    warn!(
                        slot = self.slot,
                        role = self.role.name(),
                        dropped = self.count,
                        "child pipe closed, discarding buffered input"
                    );
                    self.close_now(poll)?;
                    return Ok(());
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("write to {} pipe of slot {}", self.role.name(), self.slot)
                    });
                }
            }
        }

        if drained > 0 {
            self.credit += drained;
            framer.send_ack(self.role, self.slot, drained as u32)?;
            debug!(
                slot = self.slot,
                role = self.role.name(),
                drained,
                "drained into child, window replenished"
            );
        }

        if self.eof && self.count == 0 {
            self.close_now(poll)?;
        }
        self.sync_registration(poll)
    }

    /// The peer granted `amount` more bytes of send window on an inbound
    /// stream. Forward anything already buffered, then finish a pending
    /// half-close if the ring just emptied. Grants for an already-closed
    /// stream are accepted and have no effect.
    pub fn grant_credit(&mut self, framer: &mut Framer, poll: &Poller, amount: u32) -> Result<()> {
        self.credit = self.credit.saturating_add(amount as usize);
        debug!(
            slot = self.slot,
            role = self.role.name(),
            amount,
            credit = self.credit,
            "peer granted credit"
        );

        if self.count > 0 && self.credit > 0 {
            self.forward_to_peer(framer)?;
        }
        if self.eof && self.count == 0 && self.fd.is_some() {
            self.close_now(poll)?;
            framer.send_close_stream(self.role, self.slot)?;
        }
        self.sync_registration(poll)
    }

    /// The child pipe is readable: fill the ring until it is full, the
    /// read would block, or the child closed its end. Buffered bytes are
    /// forwarded as far as the peer's credit allows; at EOF the stream
    /// half-closes once the ring has fully flushed.
    pub fn fill_from_child(&mut self, framer: &mut Framer, poll: &Poller) -> Result<()> {
        loop {
            if self.count == RING_CAPACITY {
                break;
            }
            let raw = match self.fd.as_ref() {
                Some(fd) => fd.as_raw_fd(),
                None => return Ok(()),
            };
            let end = (self.start + self.count) % RING_CAPACITY;
            let n = (RING_CAPACITY - self.count).min(RING_CAPACITY - end);
            match unistd::read(raw, &mut self.buf[end..end + n]) {
                Ok(0) => {
                    debug!(slot = self.slot, role = self.role.name(), "child pipe EOF");
                    self.eof = true;
                    break;
                }
                Ok(read) => self.count += read,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("read from {} pipe of slot {}", self.role.name(), self.slot)
                    });
                }
            }
        }

        if self.credit > 0 && self.count > 0 {
            self.forward_to_peer(framer)?;
        }
        if self.eof && self.count == 0 && self.fd.is_some() {
            self.close_now(poll)?;
            framer.send_close_stream(self.role, self.slot)?;
        }
        self.sync_registration(poll)
    }

    /// Peer-requested half-close. Buffered bytes still flush first; a
    /// repeated close of the same stream is a no-op.
    pub fn request_close(&mut self, framer: &mut Framer, poll: &Poller) -> Result<()> {
        if self.fd.is_none() {
            debug!(
                slot = self.slot,
                role = self.role.name(),
                "close of already-closed stream ignored"
            );
            return Ok(());
        }
        self.eof = true;
        if self.count == 0 {
            self.close_now(poll)?;
            if self.direction() == Direction::FromChild {
                framer.send_close_stream(self.role, self.slot)?;
            }
        }
        self.sync_registration(poll)
    }

    /// Tear the stream down without flushing; used when the whole slot is
    /// closed and the child is being killed. Emits no wire traffic.
    pub fn force_close(&mut self, poll: &Poller) -> Result<()> {
        self.eof = true;
        if self.fd.is_some() {
            self.close_now(poll)?;
        }
        Ok(())
    }

    /// Release the daemon-side fd from a freshly forked child, without
    /// touching the parent's epoll registrations (the child closes the
    /// epoll fd itself before exec).
    pub fn close_raw_for_child(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = unistd::close(fd.into_raw_fd());
        }
    }

    /// Send up to `min(count, credit)` buffered bytes to the peer as
    /// WRITE frames of at most 255 bytes each.
    fn forward_to_peer(&mut self, framer: &mut Framer) -> Result<()> {
        let mut budget = self.count.min(self.credit);
        while budget > 0 {
            let chunk = budget.min(MAX_DATA_FRAME);
            framer.send_data_header(self.role, self.slot, chunk as u8)?;
            let first = chunk.min(RING_CAPACITY - self.start);
            framer.write_payload(&self.buf[self.start..self.start + first])?;
            if chunk > first {
                framer.write_payload(&self.buf[..chunk - first])?;
            }
            self.start = (self.start + chunk) % RING_CAPACITY;
            self.count -= chunk;
            self.credit -= chunk;
            budget -= chunk;
        }
        debug!(
            slot = self.slot,
            role = self.role.name(),
            buffered = self.count,
            credit = self.credit,
            "forwarded to peer"
        );
        Ok(())
    }

    /// Deregister (if needed) and release the fd. Deregistration must
    /// come first: the epoll entry refers to the fd.
    fn close_now(&mut self, poll: &Poller) -> Result<()> {
        if self.registered {
            if let Some(fd) = self.fd.as_ref() {
                poll.delete(fd)?;
            }
            self.registered = false;
        }
        self.fd = None;
        self.start = 0;
        self.count = 0;
        debug!(slot = self.slot, role = self.role.name(), "stream closed");
        Ok(())
    }

    /// Keep the epoll registration in sync with the stream state: an
    /// outbound buffer is watched only while it has bytes to drain, an
    /// inbound buffer only while the peer's window is open and the child
    /// has not hit EOF.
    fn sync_registration(&mut self, poll: &Poller) -> Result<()> {
        let desired = match self.direction() {
            Direction::ToChild => self.count > 0 && self.fd.is_some(),
            Direction::FromChild => self.credit > 0 && self.fd.is_some() && !self.eof,
        };
        if desired == self.registered {
            return Ok(());
        }
        let Some(fd) = self.fd.as_ref() else {
            return Ok(());
        };
        let token = Token::Stream {
            slot: self.slot,
            role: self.role,
            generation: self.generation,
        };
        if desired {
            let interest = match self.direction() {
                Direction::ToChild => EpollFlags::EPOLLOUT,
                Direction::FromChild => EpollFlags::EPOLLIN,
            };
            poll.add(fd, token, interest)?;
        } else {
            poll.delete(fd)?;
        }
        self.registered = desired;
        Ok(())
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).context("F_GETFL")?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).context("F_SETFL")?;
    Ok(())
}
