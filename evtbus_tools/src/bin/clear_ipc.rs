//! # clear-ipc
//!
//! Removes shared memory segments and semaphores left behind by crashed
//! evtbus processes. Segments some process is still attached to are kept.
//!
//! ```bash
//! clear-ipc            # unnamed resources only
//! clear-ipc named
//! clear-ipc all -v
//! ```

#![deny(warnings)]

use clap::Parser;
use evtbus_ipc::reclaim_orphans;
use evtbus_tools::{ClearArgs, render_reclaim, setup_tracing};
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("clear-ipc failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = ClearArgs::parse();
    setup_tracing(&args.common);

    let dir = args.common.marker_dir()?;
    info!(dir = %dir.path().display(), mode = %args.mode, "reclaiming IPC resources");
    let report = reclaim_orphans(&dir, args.mode)?;
    for line in render_reclaim(&report, args.common.json)? {
        println!("{line}");
    }
    Ok(())
}
