//! Prelude module for common re-exports.
//!
//! ```rust
//! use evtbus_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, HistogramConfig, LogLevel, RingConfig, SharedConfig,
    SocketConfig, TransportConfig,
};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::{FRAME_HEADER_BYTES, MAX_FRAME_BYTES, WORD_SIZE};
