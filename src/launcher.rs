//! Child-side exec path
//!
//! Runs in the forked child after the parent's descriptors have been
//! closed. The control pipe delivers the argument vector as NUL-delimited
//! strings (the first is the program name); once it hits EOF the child
//! rewires its stdio onto the three remaining pipes and replaces itself
//! with the requested program.

use crate::protocol::{MAX_ARGS, MAX_ARGV_BYTES};
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::unistd;
use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process;
use tracing::error;

/// Exit status when the child cannot be set up or the program cannot be
/// executed, reported to the peer through the normal exit-status path.
const EXEC_FAILURE: i32 = 127;

/// Consume the control stream, rewire stdio and exec. Never returns.
pub fn run(ctrl: OwnedFd, stdin: OwnedFd, stdout: OwnedFd, stderr: OwnedFd) -> ! {
    match exec(ctrl, stdin, stdout, stderr) {
        Ok(never) => match never {},
        Err(err) => {
            error!("cannot launch child process: {err:#}");
            process::exit(EXEC_FAILURE);
        }
    }
}

fn exec(ctrl: OwnedFd, stdin: OwnedFd, stdout: OwnedFd, stderr: OwnedFd) -> Result<Infallible> {
    let argv = read_argv(&ctrl)?;
    drop(ctrl);

    unistd::dup2(stdin.as_raw_fd(), 0).context("dup2 stdin")?;
    unistd::dup2(stdout.as_raw_fd(), 1).context("dup2 stdout")?;
    unistd::dup2(stderr.as_raw_fd(), 2).context("dup2 stderr")?;
    drop(stdin);
    drop(stdout);
    drop(stderr);

    Ok(unistd::execvp(&argv[0], &argv)
        .with_context(|| format!("exec {:?}", argv[0]))?)
}

/// Read the argument vector from the control pipe until EOF. The vector
/// is capped at 1023 bytes and 255 arguments; exceeding either cap is an
/// error, not a truncation.
fn read_argv(ctrl: &OwnedFd) -> Result<Vec<CString>> {
    let mut raw = [0u8; MAX_ARGV_BYTES + 1];
    let mut total = 0;
    while total < raw.len() {
        match unistd::read(ctrl.as_raw_fd(), &mut raw[total..]) {
            Ok(0) => break,
            Ok(read) => total += read,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("read command from control pipe"),
        }
    }
    if total > MAX_ARGV_BYTES {
        bail!("command exceeds {MAX_ARGV_BYTES} bytes");
    }

    parse_argv(&raw[..total])
}

/// Split a NUL-delimited byte sequence into the argument vector. One
/// trailing NUL terminates the last argument; interior empty arguments
/// are preserved.
fn parse_argv(raw: &[u8]) -> Result<Vec<CString>> {
    let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
    if raw.is_empty() {
        bail!("empty command on control stream");
    }

    let mut argv = Vec::new();
    for piece in raw.split(|byte| *byte == 0) {
        if argv.len() == MAX_ARGS {
            bail!("command exceeds {MAX_ARGS} arguments");
        }
        argv.push(CString::new(piece).context("argument contains NUL")?);
    }
    if argv[0].as_bytes().is_empty() {
        bail!("empty program name");
    }
    Ok(argv)
}
