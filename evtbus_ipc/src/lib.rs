//! # evtbus IPC
//!
//! Multi-process event transport for pipelines of the shape
//! input process → N workers → output process. Events move through SysV
//! shared-memory ring buffers guarded by SysV semaphores, or through TCP
//! sockets with per-event acknowledgement when processes run on different
//! hosts.
//!
//! ## Features
//!
//! - **Ring buffers**: one shared header plus a circular word-aligned data
//!   area, safe for any number of producers and consumers in different
//!   processes
//! - **Framing**: every message is length-prefixed and tagged, so consumers
//!   tell events from run boundaries and control messages
//! - **Endpoints**: producer/consumer loops with backpressure, cancellation
//!   and per-event error recovery over a common [`Transport`] trait
//! - **Histograms**: workers publish snapshots into a shared table and a
//!   merger sums them without blocking the workers
//! - **Discovery and cleanup**: every resource leaves a marker file so
//!   monitors can inspect buffers and leaked resources can be reclaimed
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │  Input   ├──►│ Ring buffer  ├──►│ Worker N ├──►│ Ring buffer  ├──►│  Output  │
//! │ Producer │   │ [Header|Data]│   │ Consumer │   │ [Header|Data]│   │ Consumer │
//! └──────────┘   │  Semaphore   │   │ Producer │   │  Semaphore   │   └──────────┘
//!                └──────┬───────┘   └────┬─────┘   └──────┬───────┘
//!                       │                │                │
//!                ┌──────┴───────┐  ┌─────┴──────┐  ┌──────┴───────┐
//!                │ Marker files │  │ Histogram  │  │ clear-ipc /  │
//!                │ SHM<id>-SEM..│  │   table    │  │ inspect-...  │
//!                └──────────────┘  └────────────┘  └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use evtbus_ipc::{
//!     AttachMode, BincodeCodec, CancelToken, Consumer, IpcRegistry, Producer, RetryPolicy,
//!     RingBuffer, RingBufferTransport, StopReason,
//! };
//! use evtbus_ipc::discovery::MarkerDir;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = IpcRegistry::new(MarkerDir::resolve(None));
//! let ring = RingBuffer::create(Some("events"), 1 << 16, &registry)?;
//! let cancel = CancelToken::new();
//!
//! let mut producer = Producer::new(
//!     RingBufferTransport::attach(ring.id(), AttachMode::Producer)?,
//!     BincodeCodec::<u64>::new(),
//!     RetryPolicy::default(),
//!     cancel.clone(),
//! );
//! producer.send(&42)?;
//! producer.finish()?;
//!
//! let mut consumer = Consumer::new(
//!     RingBufferTransport::attach(ring.id(), AttachMode::Consumer)?,
//!     BincodeCodec::<u64>::new(),
//!     RetryPolicy::default(),
//!     cancel,
//! );
//! let summary = consumer.run(|value| {
//!     println!("{value}");
//!     Ok(())
//! })?;
//! assert_eq!(summary.reason, StopReason::EndOfInput);
//! # Ok(())
//! # }
//! ```
//!
//! ## Resource ownership
//!
//! Segments, semaphores and markers created through an [`IpcRegistry`] are
//! removed when the registry is torn down. Resources of processes that
//! crashed are reclaimed with [`cleanup::reclaim_orphans`] or the
//! `clear-ipc` tool.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod cleanup;
pub mod codec;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod histogram;
pub mod platform;
pub mod registry;
pub mod ring_buffer;
pub mod semaphore;
pub mod socket;
pub mod transport;
pub mod version;

pub use cleanup::{ReclaimMode, ReclaimReport, reclaim_orphans};
pub use codec::{BincodeCodec, RecordCodec, StreamerInfo};
pub use discovery::{BufferDiscovery, BufferReport, Marker, MarkerDir};
pub use endpoint::{
    CancelToken, Consumer, EndpointState, Producer, Received, RetryPolicy, RunSummary,
    SendOutcome, StopReason,
};
pub use error::{IpcError, IpcResult};
pub use framing::{Frame, FrameDecoder, MessageType, frame, unframe};
pub use histogram::{Histogram1D, HistogramMerger, HistogramTable};
pub use registry::IpcRegistry;
pub use ring_buffer::{AttachMode, BufferId, RingBuffer, RingStatus};
pub use semaphore::{SemKey, Semaphore, SemaphoreGuard};
pub use socket::{ControlBroadcaster, ControlSubscriber, SocketConsumer, SocketProducer};
pub use transport::{RingBufferTransport, Transport};
pub use version::VersionCounter;

/// Install an `EnvFilter`-driven log subscriber (`RUST_LOG`). Safe to call
/// more than once; later calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
