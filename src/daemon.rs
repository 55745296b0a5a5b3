//! The event loop
//!
//! One epoll instance demultiplexes three kinds of readiness: the
//! control socket (peer frames), the SIGCHLD signalfd (child deaths),
//! and the per-stream pipe ends. Registrations carry a typed token in
//! the epoll data word instead of a raw pointer; stream tokens embed the
//! slot's generation so events that outlive their slot are dropped on
//! the floor rather than dispatched into freed state.

use crate::framer::Framer;
use crate::protocol::{Command, Direction, Header, ProtocolError, Role, ACK_WIDTH};
use crate::table::ProcessTable;
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;
use tracing::{debug, info};

/// How many readiness events one wait call may hand back.
const EVENT_BATCH: usize = 16;

/// What a readiness event refers to, packed into the epoll data word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Socket,
    Signal,
    Stream { slot: u8, role: Role, generation: u32 },
}

const TAG_SOCKET: u64 = 0;
const TAG_SIGNAL: u64 = 1;
const TAG_STREAM: u64 = 2;

impl Token {
    pub fn encode(self) -> u64 {
        match self {
            Token::Socket => TAG_SOCKET,
            Token::Signal => TAG_SIGNAL,
            Token::Stream {
                slot,
                role,
                generation,
            } => {
                TAG_STREAM
                    | (slot as u64) << 8
                    | (role as u64) << 16
                    | (generation as u64) << 32
            }
        }
    }

    pub fn decode(data: u64) -> Token {
        match data & 0xff {
            TAG_SOCKET => Token::Socket,
            TAG_SIGNAL => Token::Signal,
            _ => Token::Stream {
                slot: (data >> 8) as u8,
                role: Role::from_two_bits((data >> 16) as u8),
                generation: (data >> 32) as u32,
            },
        }
    }
}

/// Thin wrapper around the epoll instance; registrations carry a `Token`.
pub struct Poller {
    epoll: Epoll,
}

impl Poller {
    pub fn new() -> Result<Poller> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("create epoll")?;
        Ok(Poller { epoll })
    }

    pub fn add<Fd: AsFd>(&self, fd: Fd, token: Token, interest: EpollFlags) -> Result<()> {
        self.epoll
            .add(fd, EpollEvent::new(interest, token.encode()))
            .context("register with epoll")
    }

    pub fn delete<Fd: AsFd>(&self, fd: Fd) -> Result<()> {
        self.epoll.delete(fd).context("deregister from epoll")
    }

    pub fn wait(&self, events: &mut [EpollEvent]) -> nix::Result<usize> {
        self.epoll.wait(events, EpollTimeout::NONE)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }
}

enum Flow {
    Continue,
    Shutdown,
}

/// The daemon proper: socket, slot table, epoll and signal channel, all
/// driven from a single thread.
pub struct Daemon {
    framer: Framer,
    table: ProcessTable,
    poll: Poller,
    sigfd: SignalFd,
    sigmask: SigSet,
}

impl Daemon {
    /// Connect to the peer and assemble the event sources. SIGCHLD is
    /// blocked process-wide and routed through a signalfd so child
    /// deaths arrive as readable records in the same wait as everything
    /// else.
    pub fn connect(path: &Path) -> Result<Daemon> {
        let framer = Framer::connect(path)?;
        let poll = Poller::new()?;

        let mut sigmask = SigSet::empty();
        sigmask.add(Signal::SIGCHLD);
        sigmask.thread_block().context("block SIGCHLD")?;
        let sigfd = SignalFd::with_flags(&sigmask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("create signalfd")?;

        poll.add(framer.socket(), Token::Socket, EpollFlags::EPOLLIN)?;
        poll.add(&sigfd, Token::Signal, EpollFlags::EPOLLIN)?;

        Ok(Daemon {
            framer,
            table: ProcessTable::new(),
            poll,
            sigfd,
            sigmask,
        })
    }

    /// Block on readiness and dispatch until the peer sends RESET.
    pub fn run(&mut self) -> Result<()> {
        let mut events: [EpollEvent; EVENT_BATCH] =
            std::array::from_fn(|_| EpollEvent::empty());
        loop {
            let ready = match self.poll.wait(&mut events) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("epoll wait"),
            };

            for event in &events[..ready] {
                match Token::decode(event.data()) {
                    Token::Socket => {
                        if let Flow::Shutdown = self.handle_socket()? {
                            return Ok(());
                        }
                    }
                    Token::Signal => self.handle_sigchld()?,
                    Token::Stream {
                        slot,
                        role,
                        generation,
                    } => self.handle_stream(slot, role, generation)?,
                }
            }
        }
    }

    /// One frame from the peer. Commands other than RESET and OPEN must
    /// address an existing slot; frames the peer has no business sending
    /// are protocol violations.
    fn handle_socket(&mut self) -> Result<Flow> {
        let Header {
            command,
            id,
            arg,
            len,
        } = self.framer.read_header()?;
        debug!(cmd = ?command, id, arg, len, "frame from peer");

        let Daemon {
            framer,
            table,
            poll,
            sigfd,
            sigmask,
        } = self;

        match command {
            Command::Reset => {
                info!("peer requested reset, shutting down");
                return Ok(Flow::Shutdown);
            }
            Command::Open => {
                let parent_fds = [
                    framer.socket().as_raw_fd(),
                    poll.as_raw_fd(),
                    sigfd.as_raw_fd(),
                ];
                table.open(id, framer, &parent_fds, sigmask)?;
            }
            Command::Close => table.close(id, framer, poll)?,
            Command::Kill => table.kill(id, arg)?,
            Command::Data(role) => {
                if role.direction() != Direction::ToChild {
                    bail!(ProtocolError::DirectionViolation(command.to_wire()));
                }
                table
                    .slot_mut(id)?
                    .stream_mut(role)
                    .accept_from_peer(framer, poll, len as usize)?;
            }
            Command::Ack(role) => {
                if role.direction() != Direction::FromChild {
                    bail!(ProtocolError::DirectionViolation(command.to_wire()));
                }
                if len as usize != ACK_WIDTH {
                    bail!(ProtocolError::BadAckLength { len });
                }
                let amount = framer.read_credit()?;
                table
                    .slot_mut(id)?
                    .stream_mut(role)
                    .grant_credit(framer, poll, amount)?;
            }
            Command::CloseStream(role) => {
                table
                    .slot_mut(id)?
                    .stream_mut(role)
                    .request_close(framer, poll)?;
            }
            Command::ExitStatus | Command::CloseAck => {
                bail!(ProtocolError::DirectionViolation(command.to_wire()));
            }
        }
        Ok(Flow::Continue)
    }

    /// Drain every queued signal record, then reap. Several SIGCHLDs
    /// routinely coalesce into one readable signalfd.
    fn handle_sigchld(&mut self) -> Result<()> {
        loop {
            match self.sigfd.read_signal() {
                Ok(Some(record)) => {
                    if record.ssi_signo as i32 != Signal::SIGCHLD as i32 {
                        bail!("unexpected signal {} on signalfd", record.ssi_signo);
                    }
                }
                Ok(None) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("read signalfd"),
            }
        }

        let Daemon {
            framer,
            table,
            poll,
            ..
        } = self;
        table.reap(framer, poll)
    }

    /// Readiness on one stream's pipe end. The slot may have been torn
    /// down, or the fd closed, earlier in this same batch; the
    /// generation check and the buffers' own fd state make those events
    /// harmless.
    fn handle_stream(&mut self, slot_id: u8, role: Role, generation: u32) -> Result<()> {
        let Daemon {
            framer,
            table,
            poll,
            ..
        } = self;
        let Some(slot) = table.get_mut(slot_id) else {
            return Ok(());
        };
        if slot.generation() != generation {
            return Ok(());
        }
        let stream = slot.stream_mut(role);
        if stream.is_closed() {
            return Ok(());
        }
        match role.direction() {
            Direction::ToChild => stream.drain_to_child(framer, poll),
            Direction::FromChild => stream.fill_from_child(framer, poll),
        }
    }
}
