//! execmuxd, a multiplexed process-execution daemon
//!
//! Connects to the controller's Unix socket given as the sole argument
//! and serves the framed stream protocol until the peer sends RESET.
//! Exits 0 on RESET and non-zero on any fatal condition.

use anyhow::Result;
use execmuxd::daemon::Daemon;
use execmuxd::logging;
use std::path::PathBuf;
use std::{env, process};
use tracing::{error, info};

fn main() {
    let mut args = env::args().skip(1);
    let (Some(path), None) = (args.next(), args.next()) else {
        eprintln!("usage: execmuxd <socket-path>");
        process::exit(2);
    };

    logging::init();

    match run(PathBuf::from(path)) {
        Ok(()) => {}
        Err(err) => {
            error!("fatal: {err:#}");
            process::exit(1);
        }
    }
}

fn run(path: PathBuf) -> Result<()> {
    info!(socket = %path.display(), "connecting to controller");
    let mut daemon = Daemon::connect(&path)?;
    daemon.run()
}
