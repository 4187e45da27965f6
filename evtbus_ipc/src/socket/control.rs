//! Out-of-band control channel: one broadcaster, many subscribers

use super::{connect_with_backoff, is_timeout};
use crate::error::{IpcError, IpcResult};
use crate::framing::{FrameDecoder, MessageType, frame};
use evtbus::config::SocketConfig;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

/// Publishes `EndOfInput` and `Terminate` to every connected subscriber
#[derive(Debug)]
pub struct ControlBroadcaster {
    listener: TcpListener,
    subscribers: Vec<(SocketAddr, TcpStream)>,
}

impl ControlBroadcaster {
    /// Listen for subscribers on `addr`.
    pub fn bind(addr: impl ToSocketAddrs) -> IpcResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "control channel listening");
        Ok(Self {
            listener,
            subscribers: Vec::new(),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> IpcResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept every subscriber waiting to connect. Never blocks.
    pub fn accept_pending(&mut self) -> IpcResult<usize> {
        let mut accepted = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    debug!(subscriber = %addr, "control subscriber connected");
                    self.subscribers.push((addr, stream));
                    accepted += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(accepted),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Subscribers currently connected
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Send `tag` to every subscriber, dropping those that have gone away.
    /// Returns the number of subscribers reached.
    pub fn broadcast(&mut self, tag: MessageType) -> IpcResult<usize> {
        if !tag.is_control() {
            return Err(IpcError::invalid(format!("{tag:?} cannot be broadcast")));
        }
        self.accept_pending()?;
        let bytes = frame(tag, &[])?;
        self.subscribers.retain_mut(|(addr, stream)| match stream.write_all(&bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(subscriber = %addr, error = %e, "dropping control subscriber");
                false
            }
        });
        info!(?tag, reached = self.subscribers.len(), "control message broadcast");
        Ok(self.subscribers.len())
    }
}

/// Non-blocking receiver of control messages
#[derive(Debug)]
pub struct ControlSubscriber {
    stream: TcpStream,
    peer: String,
    decoder: FrameDecoder,
    closed: bool,
}

impl ControlSubscriber {
    /// Connect to a broadcaster, retrying with backoff.
    pub fn connect(addr: &str, config: &SocketConfig) -> IpcResult<Self> {
        let stream = connect_with_backoff(addr, config)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            peer: addr.to_string(),
            decoder: FrameDecoder::new(),
            closed: false,
        })
    }

    /// Whether the broadcaster has gone away
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next control message, if one has arrived.
    pub fn poll(&mut self) -> IpcResult<Option<MessageType>> {
        loop {
            if let Some(msg) = self.decoder.next_frame()? {
                if msg.tag.is_control() {
                    return Ok(Some(msg.tag));
                }
                warn!(peer = %self.peer, tag = ?msg.tag, "ignoring non-control frame");
                continue;
            }
            if self.closed {
                return Ok(None);
            }
            let mut buf = [0u8; 64];
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    debug!(peer = %self.peer, "control broadcaster closed");
                    self.closed = true;
                    return Ok(None);
                }
                Ok(n) => self.decoder.push(&buf[..n]),
                Err(e) if is_timeout(e.kind()) => return Ok(None),
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            }
        }
    }
}
