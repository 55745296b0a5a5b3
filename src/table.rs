//! Fixed-capacity table of process slots
//!
//! Slots are addressed directly by the one-byte id on the wire. Each
//! slot owns the child pid and the four stream buffers; the generation
//! counter lets the event loop reject readiness events that outlive the
//! slot they were registered for.

use crate::framer::Framer;
use crate::launcher;
use crate::pipebuf::PipeBuf;
use crate::protocol::{ProtocolError, Role, RING_CAPACITY, SLOT_COUNT};
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use std::os::fd::RawFd;
use tracing::{debug, info, warn};

use crate::daemon::Poller;

/// One process slot: the child pid plus its four streams.
pub struct Slot {
    pid: Option<Pid>,
    generation: u32,
    ctrl: PipeBuf,
    stdin: PipeBuf,
    stdout: PipeBuf,
    stderr: PipeBuf,
}

impl Slot {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn stream_mut(&mut self, role: Role) -> &mut PipeBuf {
        match role {
            Role::Control => &mut self.ctrl,
            Role::Stdin => &mut self.stdin,
            Role::Stdout => &mut self.stdout,
            Role::Stderr => &mut self.stderr,
        }
    }

    fn streams_mut(&mut self) -> [&mut PipeBuf; 4] {
        [
            &mut self.ctrl,
            &mut self.stdin,
            &mut self.stdout,
            &mut self.stderr,
        ]
    }
}

pub struct ProcessTable {
    slots: [Option<Box<Slot>>; SLOT_COUNT],
    next_generation: u32,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable {
            slots: std::array::from_fn(|_| None),
            next_generation: 0,
        }
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Slot> {
        self.slots[id as usize].as_deref_mut()
    }

    /// Look up a slot a peer command addresses; a missing slot is a
    /// protocol violation.
    pub fn slot_mut(&mut self, id: u8) -> Result<&mut Slot, ProtocolError> {
        self.slots[id as usize]
            .as_deref_mut()
            .ok_or(ProtocolError::NoSuchProcess(id))
    }

    /// Allocate a slot, create its four pipes and fork the child. The
    /// child closes every daemon-side descriptor (all slots' pipe ends
    /// plus `parent_fds`: socket, epoll, signalfd), restores the signal
    /// mask and enters the launcher. The parent keeps only its own pipe
    /// ends, records the pid, and seeds the peer's send window for both
    /// outbound streams.
    pub fn open(
        &mut self,
        id: u8,
        framer: &mut Framer,
        parent_fds: &[RawFd],
        sigmask: &SigSet,
    ) -> Result<()> {
        if self.slots[id as usize].is_some() {
            return Err(ProtocolError::SlotOccupied(id).into());
        }

        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;

        let (ctrl, ctrl_child) = PipeBuf::outbound(id, Role::Control, generation)?;
        let (stdin, stdin_child) = PipeBuf::outbound(id, Role::Stdin, generation)?;
        let (stdout, stdout_child) = PipeBuf::inbound(id, Role::Stdout, generation)?;
        let (stderr, stderr_child) = PipeBuf::inbound(id, Role::Stderr, generation)?;

        framer.send_ack(Role::Control, id, RING_CAPACITY as u32)?;
        framer.send_ack(Role::Stdin, id, RING_CAPACITY as u32)?;

        self.slots[id as usize] = Some(Box::new(Slot {
            pid: None,
            generation,
            ctrl,
            stdin,
            stdout,
            stderr,
        }));

        match unsafe { unistd::fork() }.context("fork child process")? {
            ForkResult::Child => {
                self.close_all_daemon_fds();
                for fd in parent_fds {
                    let _ = unistd::close(*fd);
                }
                let _ = sigmask.thread_unblock();
                launcher::run(ctrl_child, stdin_child, stdout_child, stderr_child)
            }
            ForkResult::Parent { child } => {
                drop(ctrl_child);
                drop(stdin_child);
                drop(stdout_child);
                drop(stderr_child);
                if let Some(slot) = self.slots[id as usize].as_deref_mut() {
                    slot.pid = Some(child);
                }
                info!(id, pid = child.as_raw(), "opened process slot");
                Ok(())
            }
        }
    }

    /// Tear a slot down on peer request: kill and reap any live child,
    /// force-close all four streams without flushing, release the slot
    /// and acknowledge.
    pub fn close(&mut self, id: u8, framer: &mut Framer, poll: &Poller) -> Result<()> {
        let Some(mut slot) = self.slots[id as usize].take() else {
            return Err(ProtocolError::NoSuchProcess(id).into());
        };

        if let Some(pid) = slot.pid.take() {
            // The kill can race a natural death; reap either way.
            let _ = signal::kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }

        for stream in slot.streams_mut() {
            stream.force_close(poll)?;
        }

        framer.send_close_ack(id)?;
        info!(id, "closed process slot");
        Ok(())
    }

    /// Deliver a peer-chosen signal to a slot's child. A slot whose
    /// child already exited swallows the request silently.
    pub fn kill(&mut self, id: u8, signo: u8) -> Result<()> {
        let slot = self.slot_mut(id)?;
        let Some(pid) = slot.pid else {
            debug!(id, signo, "kill for slot with no live child ignored");
            return Ok(());
        };
        let sig =
            Signal::try_from(signo as i32).map_err(|_| ProtocolError::BadSignal(signo))?;
        signal::kill(pid, sig)
            .with_context(|| format!("deliver signal {signo} to slot {id}"))?;
        debug!(id, signo, "delivered signal");
        Ok(())
    }

    /// Harvest every zombie the pending SIGCHLDs announced and report
    /// each exit to the peer. Multiple deaths may coalesce into one
    /// wakeup, so this loops until no reapable child remains.
    pub fn reap(&mut self, framer: &mut Framer, poll: &Poller) -> Result<()> {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.report_exit(framer, poll, pid, code as u8)?;
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.report_exit(framer, poll, pid, sig as i32 as u8)?;
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("waitpid"),
            }
        }
        Ok(())
    }

    fn report_exit(
        &mut self,
        framer: &mut Framer,
        poll: &Poller,
        pid: Pid,
        status: u8,
    ) -> Result<()> {
        let found = self.slots.iter_mut().enumerate().find_map(|(id, entry)| {
            entry
                .as_deref_mut()
                .filter(|slot| slot.pid == Some(pid))
                .map(|slot| (id as u8, slot))
        });
        let Some((id, slot)) = found else {
            // The slot may have been closed (and the pid reaped there)
            // before this notification drained.
            warn!(pid = pid.as_raw(), "reaped child with no matching slot");
            return Ok(());
        };

        slot.pid = None;
        framer.send_exit_status(id, status)?;
        info!(id, pid = pid.as_raw(), status, "child exited");

        // The child's ends are gone now; pick up whatever it left in the
        // output pipes so the EOFs propagate even on streams the peer
        // never opened a window for.
        slot.stdout.fill_from_child(framer, poll)?;
        slot.stderr.fill_from_child(framer, poll)?;
        Ok(())
    }

    /// Close every daemon-side pipe end. Runs in the freshly forked
    /// child, which execs immediately afterwards, so the raw closes
    /// never race the owning `OwnedFd`s.
    fn close_all_daemon_fds(&mut self) {
        for entry in self.slots.iter_mut() {
            if let Some(slot) = entry.as_deref_mut() {
                for stream in slot.streams_mut() {
                    stream.close_raw_for_child();
                }
            }
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
