//! TCP alternative to the shared-memory ring buffer
//!
//! - [`data`]: point-to-point event channel with one outstanding event per
//!   pairing and a fixed-size acknowledgement frame
//! - [`control`]: broadcaster/subscriber channel for `EndOfInput` and
//!   `Terminate`, independent of any data backlog

pub mod control;
pub mod data;

pub use control::{ControlBroadcaster, ControlSubscriber};
pub use data::{SocketConsumer, SocketProducer};

use crate::error::{IpcError, IpcResult};
use evtbus::config::SocketConfig;
use std::io::ErrorKind;
use std::net::TcpStream;
use tracing::{debug, warn};

/// Connect to `addr`, retrying with exponential backoff.
pub(crate) fn connect_with_backoff(addr: &str, config: &SocketConfig) -> IpcResult<TcpStream> {
    let mut attempt = 0u32;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(peer = addr, attempt, "connected");
                return Ok(stream);
            }
            Err(e) if attempt < config.connect_retries => {
                let backoff = config.backoff_for(attempt);
                warn!(peer = addr, attempt, error = %e, ?backoff, "connect failed, backing off");
                std::thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => {
                warn!(peer = addr, attempts = attempt + 1, error = %e, "giving up on connect");
                return Err(IpcError::Closed {
                    peer: format!("{addr} (connect failed after {} attempts: {e})", attempt + 1),
                });
            }
        }
    }
}

/// Read errors that only mean "no data within the timeout"
pub(crate) fn is_timeout(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_gives_up_with_closed() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = SocketConfig {
            connect_retries: 2,
            connect_backoff_ms: 1,
            max_backoff_ms: 2,
            ..SocketConfig::default()
        };
        let err = connect_with_backoff(&format!("127.0.0.1:{port}"), &config).unwrap_err();
        match err {
            IpcError::Closed { peer } => assert!(peer.contains("3 attempts"), "{peer}"),
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}
