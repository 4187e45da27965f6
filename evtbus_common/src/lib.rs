//! evtbus Common Library
//!
//! Shared constants and configuration loading for all evtbus workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Limits, defaults and on-disk naming of IPC resources
//! - [`config`] - Configuration loading traits and transport settings
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! evtbus = { package = "evtbus_common", path = "../evtbus_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use evtbus_common::consts::*;
//! use evtbus_common::config::{ConfigLoader, TransportConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
