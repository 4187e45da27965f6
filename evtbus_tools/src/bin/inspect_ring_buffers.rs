//! # inspect-ring-buffers
//!
//! Prints one status line per ring buffer every interval until no buffers
//! remain or Ctrl-C is pressed.
//!
//! ```bash
//! inspect-ring-buffers --interval-ms 500
//! inspect-ring-buffers --once --json --marker-dir /var/tmp/evtbus
//! ```

#![deny(warnings)]

use clap::Parser;
use evtbus_ipc::BufferDiscovery;
use evtbus_tools::{InspectArgs, render_buffers, setup_tracing};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("inspection failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = InspectArgs::parse();
    setup_tracing(&args.common);

    let discovery = BufferDiscovery::new(args.common.marker_dir()?);
    info!(dir = %discovery.marker_dir().path().display(), "inspecting ring buffers");

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    let mut first = true;
    while running.load(Ordering::SeqCst) {
        let reports = discovery.inspect_buffers()?;
        if reports.is_empty() {
            if first {
                println!("No buffers found");
            }
            break;
        }
        for line in render_buffers(&reports, args.common.json)? {
            println!("{line}");
        }
        if args.once {
            break;
        }
        first = false;
        println!();

        let until = Instant::now() + args.interval();
        while running.load(Ordering::SeqCst) && Instant::now() < until {
            std::thread::sleep(Duration::from_millis(20).min(args.interval()));
        }
    }
    Ok(())
}
