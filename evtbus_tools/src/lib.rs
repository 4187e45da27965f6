//! # evtbus tools
//!
//! Command-line front ends for operating evtbus hosts:
//!
//! - `inspect-ring-buffers`: periodic fill-level report for every ring
//!   buffer that has a discovery marker
//! - `clear-ipc`: reclaim segments and semaphores leaked by crashed
//!   processes
//!
//! # Usage
//!
//! ```bash
//! # Watch buffers once a second until none remain
//! inspect-ring-buffers
//!
//! # One report, machine readable
//! inspect-ring-buffers --once --json
//!
//! # Remove everything nobody is attached to
//! clear-ipc all
//! ```

use clap::{Args, Parser};
use evtbus::consts::DEFAULT_INSPECT_INTERVAL_MS;
use evtbus::prelude::{ConfigLoader, TransportConfig};
use evtbus_ipc::{BufferReport, MarkerDir, ReclaimMode, ReclaimReport};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, debug};
use tracing_subscriber::EnvFilter;

/// Options shared by every tool
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Marker directory (default: $EVTBUS_TMPDIR, else the system temp dir)
    #[arg(long, value_name = "DIR")]
    pub marker_dir: Option<PathBuf>,

    /// Transport configuration file; its `marker_dir` is used when
    /// --marker-dir is not given
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Output logs and reports in JSON format
    #[arg(long)]
    pub json: bool,
}

impl CommonArgs {
    /// Marker directory from the flags, the configuration file or the
    /// environment, in that order.
    pub fn marker_dir(&self) -> Result<MarkerDir, Box<dyn std::error::Error>> {
        if let Some(dir) = &self.marker_dir {
            return Ok(MarkerDir::new(dir));
        }
        match &self.config {
            Some(path) => {
                let config = TransportConfig::load(path)?;
                config.validate()?;
                debug!(config = %path.display(), "loaded transport configuration");
                Ok(MarkerDir::new(config.marker_dir()))
            }
            None => Ok(MarkerDir::resolve(None)),
        }
    }
}

/// inspect-ring-buffers - report ring buffer fill levels
#[derive(Parser, Debug)]
#[command(name = "inspect-ring-buffers")]
#[command(version)]
#[command(about = "Report fill level and attachments of every ring buffer on this host")]
#[command(long_about = None)]
pub struct InspectArgs {
    /// Milliseconds between reports
    #[arg(short, long, default_value_t = DEFAULT_INSPECT_INTERVAL_MS)]
    pub interval_ms: u64,

    /// Print a single report and exit
    #[arg(long)]
    pub once: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl InspectArgs {
    /// Pause between reports
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// clear-ipc - reclaim leaked shared memory and semaphores
#[derive(Parser, Debug)]
#[command(name = "clear-ipc")]
#[command(version)]
#[command(about = "Remove evtbus shared memory segments and semaphores no process is attached to")]
#[command(long_about = None)]
pub struct ClearArgs {
    /// Which resources to reclaim: all, named or unnamed
    #[arg(default_value_t = ReclaimMode::Unnamed)]
    pub mode: ReclaimMode,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Setup tracing subscriber based on CLI arguments.
pub fn setup_tracing(args: &CommonArgs) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Lines of one inspection report
pub fn render_buffers(reports: &[BufferReport], json: bool) -> Result<Vec<String>, serde_json::Error> {
    if json {
        reports.iter().map(serde_json::to_string).collect()
    } else {
        Ok(reports.iter().map(ToString::to_string).collect())
    }
}

/// Summary of one reclaim pass
pub fn render_reclaim(report: &ReclaimReport, json: bool) -> Result<Vec<String>, serde_json::Error> {
    if json {
        return Ok(vec![serde_json::to_string(report)?]);
    }
    let mut lines: Vec<String> = report.reclaimed.iter().map(|m| format!("removed {m}")).collect();
    lines.extend(report.stale.iter().map(|m| format!("removed stale marker {m}")));
    lines.extend(
        report
            .busy
            .iter()
            .map(|b| format!("in use by {} processes, kept {}", b.attach_count, b.marker)),
    );
    lines.extend(report.failed.iter().map(|(m, reason)| format!("failed {m}: {reason}")));
    lines.push(report.to_string());
    Ok(lines)
}
