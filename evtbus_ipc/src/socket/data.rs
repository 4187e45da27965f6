//! Point-to-point data channel with acknowledgement flow control
//!
//! The producer may have at most one unacknowledged event in flight. Before
//! sending the next event it waits up to `ack_timeout` for the `Ack` frame;
//! if none arrives the connection is marked broken and every later call
//! fails with `Closed`. Writing a frame is bounded by the same timeout, so a
//! worker that stops reading cannot stall the producer either. Run and
//! control frames are not acknowledged.

use super::{connect_with_backoff, is_timeout};
use crate::error::{IpcError, IpcResult};
use crate::framing::{FrameDecoder, MessageType, encoded_len, frame, peek_length};
use crate::transport::Transport;
use evtbus::config::SocketConfig;
use evtbus::consts::FRAME_HEADER_BYTES;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 64 * 1024;

fn tag_of(bytes: &[u8]) -> Option<MessageType> {
    let raw: [u8; 4] = bytes.get(4..8)?.try_into().ok()?;
    MessageType::from_u32(u32::from_le_bytes(raw))
}

fn peer_of(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown peer>".to_string())
}

/// Sending end of a data channel
#[derive(Debug)]
pub struct SocketProducer {
    stream: TcpStream,
    peer: String,
    ack_timeout: Duration,
    decoder: FrameDecoder,
    awaiting_ack: bool,
    broken: bool,
    acked: u64,
}

impl SocketProducer {
    /// Connect to a listening consumer.
    pub fn connect(addr: &str, config: &SocketConfig) -> IpcResult<Self> {
        let stream = connect_with_backoff(addr, config)?;
        Ok(Self::from_stream(stream, config))
    }

    /// Accept one consumer connection on `listener`.
    pub fn accept(listener: &TcpListener, config: &SocketConfig) -> IpcResult<Self> {
        let (stream, addr) = listener.accept()?;
        stream.set_nodelay(true)?;
        info!(peer = %addr, "consumer connected");
        Ok(Self::from_stream(stream, config))
    }

    fn from_stream(stream: TcpStream, config: &SocketConfig) -> Self {
        Self {
            peer: peer_of(&stream),
            stream,
            ack_timeout: config.ack_timeout(),
            decoder: FrameDecoder::new(),
            awaiting_ack: false,
            broken: false,
            acked: 0,
        }
    }

    /// Peer address
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Events acknowledged by the consumer
    pub fn acked_count(&self) -> u64 {
        self.acked
    }

    /// Whether an event is still waiting for its acknowledgement
    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    fn ensure_open(&self) -> IpcResult<()> {
        if self.broken {
            return Err(IpcError::Closed {
                peer: self.peer.clone(),
            });
        }
        Ok(())
    }

    fn timed_out(&mut self, waited: Duration) -> IpcError {
        self.broken = true;
        error!(peer = %self.peer, ?waited, "peer stopped responding");
        IpcError::Timeout {
            peer: self.peer.clone(),
            waited,
        }
    }

    /// Write `bytes` within `ack_timeout`. A partial write leaves the stream
    /// unusable, so any failure breaks the connection.
    fn write_frame(&mut self, bytes: &[u8]) -> IpcResult<()> {
        let started = Instant::now();
        let mut written = 0;
        while written < bytes.len() {
            let remaining = self.ack_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(self.timed_out(self.ack_timeout));
            }
            self.stream.set_write_timeout(Some(remaining))?;
            match self.stream.write(&bytes[written..]) {
                Ok(0) => {
                    self.broken = true;
                    return Err(IpcError::Closed {
                        peer: self.peer.clone(),
                    });
                }
                Ok(n) => written += n,
                Err(e) if is_timeout(e.kind()) => {}
                Err(e) => {
                    self.broken = true;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn wait_for_ack(&mut self) -> IpcResult<()> {
        if !self.awaiting_ack {
            return Ok(());
        }
        let started = Instant::now();
        let mut buf = [0u8; 256];
        loop {
            while let Some(reply) = self.decoder.next_frame()? {
                if reply.tag == MessageType::Ack {
                    self.awaiting_ack = false;
                    self.acked += 1;
                    return Ok(());
                }
                warn!(peer = %self.peer, tag = ?reply.tag, "ignoring unexpected frame from consumer");
            }

            let remaining = self.ack_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(self.timed_out(self.ack_timeout));
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.broken = true;
                    return Err(IpcError::Closed {
                        peer: self.peer.clone(),
                    });
                }
                Ok(n) => self.decoder.push(&buf[..n]),
                Err(e) if is_timeout(e.kind()) => {}
                Err(e) => {
                    self.broken = true;
                    return Err(e.into());
                }
            }
        }
    }
}

impl Transport for SocketProducer {
    /// Blocks for at most `ack_timeout` waiting on the previous event's
    /// acknowledgement; never returns `WouldBlock`.
    fn enqueue(&mut self, bytes: &[u8]) -> IpcResult<()> {
        self.ensure_open()?;
        if bytes.len() < FRAME_HEADER_BYTES
            || peek_length(bytes).map(encoded_len) != Some(bytes.len())
        {
            return Err(IpcError::invalid(format!(
                "{} bytes do not form a complete frame",
                bytes.len()
            )));
        }
        let tag = tag_of(bytes);
        if tag == Some(MessageType::Event) {
            self.wait_for_ack()?;
        }
        self.write_frame(bytes)?;
        if tag == Some(MessageType::Event) {
            self.awaiting_ack = true;
        }
        debug!(peer = %self.peer, ?tag, bytes = bytes.len(), "frame sent");
        Ok(())
    }

    fn dequeue(&mut self) -> IpcResult<Vec<u8>> {
        Err(IpcError::invalid("socket producer is send-only"))
    }

    fn flush(&mut self) -> IpcResult<()> {
        self.ensure_open()?;
        self.wait_for_ack()
    }

    fn is_finished(&self) -> bool {
        self.broken
    }

    fn describe(&self) -> String {
        format!("socket producer to {}", self.peer)
    }
}

/// Receiving end of a data channel
#[derive(Debug)]
pub struct SocketConsumer {
    stream: TcpStream,
    peer: String,
    poll_interval: Duration,
    decoder: FrameDecoder,
    read_buf: Box<[u8]>,
    pending_ack: bool,
    finished: bool,
}

impl SocketConsumer {
    /// Bind a listener for producers to connect to.
    pub fn listen(addr: impl ToSocketAddrs) -> IpcResult<TcpListener> {
        Ok(TcpListener::bind(addr)?)
    }

    /// Accept one producer connection on `listener`.
    pub fn accept(listener: &TcpListener, config: &SocketConfig) -> IpcResult<Self> {
        let (stream, addr) = listener.accept()?;
        stream.set_nodelay(true)?;
        info!(peer = %addr, "producer connected");
        Ok(Self::from_stream(stream, config))
    }

    /// Connect to a listening producer.
    pub fn connect(addr: &str, config: &SocketConfig) -> IpcResult<Self> {
        let stream = connect_with_backoff(addr, config)?;
        Ok(Self::from_stream(stream, config))
    }

    fn from_stream(stream: TcpStream, config: &SocketConfig) -> Self {
        Self {
            peer: peer_of(&stream),
            stream,
            poll_interval: config.poll_interval(),
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
            pending_ack: false,
            finished: false,
        }
    }

    /// Peer address
    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn take_frame(&mut self) -> IpcResult<Option<Vec<u8>>> {
        match self.decoder.next_raw() {
            Ok(Some(raw)) => {
                if tag_of(&raw) == Some(MessageType::Event) {
                    self.pending_ack = true;
                }
                Ok(Some(raw))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                // The stream cannot be resynchronized after a bad length.
                self.finished = true;
                Err(IpcError::fatal(format!("data channel from {}", self.peer), e.to_string()))
            }
        }
    }
}

impl Transport for SocketConsumer {
    fn enqueue(&mut self, _bytes: &[u8]) -> IpcResult<()> {
        Err(IpcError::invalid("socket consumer is receive-only"))
    }

    /// Waits at most one poll interval for a complete frame.
    fn dequeue(&mut self) -> IpcResult<Vec<u8>> {
        if let Some(raw) = self.take_frame()? {
            return Ok(raw);
        }
        if self.finished {
            return Err(IpcError::Closed {
                peer: self.peer.clone(),
            });
        }

        self.stream.set_read_timeout(Some(self.poll_interval))?;
        match self.stream.read(&mut self.read_buf) {
            Ok(0) => {
                self.finished = true;
                debug!(peer = %self.peer, "producer closed the data channel");
                return Err(IpcError::Closed {
                    peer: self.peer.clone(),
                });
            }
            Ok(n) => self.decoder.push(&self.read_buf[..n]),
            Err(e) if is_timeout(e.kind()) => return Err(IpcError::WouldBlock),
            Err(e) => {
                self.finished = true;
                return Err(e.into());
            }
        }
        self.take_frame()?.ok_or(IpcError::WouldBlock)
    }

    /// Acknowledge the last delivered event. No-op if it was not an event.
    fn complete(&mut self) -> IpcResult<()> {
        if !self.pending_ack {
            return Ok(());
        }
        self.pending_ack = false;
        self.stream.write_all(&frame(MessageType::Ack, &[])?)?;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn describe(&self) -> String {
        format!("socket consumer from {}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ack_timeout_ms: u64) -> SocketConfig {
        SocketConfig {
            ack_timeout_ms,
            poll_interval_ms: 5,
            connect_retries: 3,
            connect_backoff_ms: 5,
            ..SocketConfig::default()
        }
    }

    fn pair(ack_timeout_ms: u64) -> (SocketProducer, SocketConsumer) {
        let listener = SocketConsumer::listen("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let cfg = config(ack_timeout_ms);
        let producer = SocketProducer::connect(&addr, &cfg).unwrap();
        let consumer = SocketConsumer::accept(&listener, &cfg).unwrap();
        (producer, consumer)
    }

    fn recv_blocking(consumer: &mut SocketConsumer) -> IpcResult<Vec<u8>> {
        loop {
            match consumer.dequeue() {
                Err(IpcError::WouldBlock) => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn test_event_is_acknowledged() {
        let (mut producer, mut consumer) = pair(2_000);
        let event = frame(MessageType::Event, b"hit").unwrap();
        producer.enqueue(&event).unwrap();
        assert!(producer.awaiting_ack());

        assert_eq!(recv_blocking(&mut consumer).unwrap(), event);
        consumer.complete().unwrap();
        // second complete must not send a second ack
        consumer.complete().unwrap();

        producer.flush().unwrap();
        assert_eq!(producer.acked_count(), 1);
        assert!(!producer.awaiting_ack());
    }

    #[test]
    fn test_control_frames_need_no_ack() {
        let (mut producer, mut consumer) = pair(50);
        producer.enqueue(&frame(MessageType::BeginRun, &[]).unwrap()).unwrap();
        producer.enqueue(&frame(MessageType::EndOfInput, &[]).unwrap()).unwrap();
        assert!(!producer.awaiting_ack());
        producer.flush().unwrap();

        let first = recv_blocking(&mut consumer).unwrap();
        assert_eq!(tag_of(&first), Some(MessageType::BeginRun));
        let second = recv_blocking(&mut consumer).unwrap();
        assert_eq!(tag_of(&second), Some(MessageType::EndOfInput));
    }

    #[test]
    fn test_missing_ack_times_out_and_breaks_connection() {
        let (mut producer, _consumer) = pair(100);
        let event = frame(MessageType::Event, b"1").unwrap();
        producer.enqueue(&event).unwrap();

        let started = Instant::now();
        let err = producer.enqueue(&event).unwrap_err();
        assert!(matches!(err, IpcError::Timeout { .. }), "{err:?}");
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(err.is_fatal());

        assert!(producer.is_finished());
        assert!(matches!(producer.enqueue(&event), Err(IpcError::Closed { .. })));
    }

    #[test]
    fn test_write_to_stalled_consumer_times_out() {
        let (mut producer, consumer) = pair(200);
        // Far larger than the loopback socket buffers; nobody reads it.
        let event = frame(MessageType::Event, &vec![0x5A; 32 << 20]).unwrap();

        let started = Instant::now();
        let err = producer.enqueue(&event).unwrap_err();
        assert!(matches!(err, IpcError::Timeout { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(producer.is_finished());
        assert!(matches!(producer.enqueue(&event), Err(IpcError::Closed { .. })));
        drop(consumer);
    }

    #[test]
    fn test_consumer_reads_many_frames_from_one_buffer() {
        let (mut producer, mut consumer) = pair(2_000);
        let big = frame(MessageType::Event, &vec![1u8; 3 * READ_CHUNK]).unwrap();
        producer.enqueue(&big).unwrap();
        assert_eq!(recv_blocking(&mut consumer).unwrap(), big);
        consumer.complete().unwrap();
        producer.flush().unwrap();

        let small = frame(MessageType::Event, b"after").unwrap();
        producer.enqueue(&small).unwrap();
        assert_eq!(recv_blocking(&mut consumer).unwrap(), small);
        assert_eq!(consumer.read_buf.len(), READ_CHUNK);
    }

    #[test]
    fn test_peer_close_finishes_consumer() {
        let (producer, mut consumer) = pair(100);
        drop(producer);
        assert!(matches!(recv_blocking(&mut consumer), Err(IpcError::Closed { .. })));
        assert!(consumer.is_finished());
    }

    #[test]
    fn test_wrong_direction_is_rejected() {
        let (mut producer, mut consumer) = pair(100);
        assert!(matches!(producer.dequeue(), Err(IpcError::InvalidArgument { .. })));
        assert!(matches!(
            consumer.enqueue(&frame(MessageType::Event, &[]).unwrap()),
            Err(IpcError::InvalidArgument { .. })
        ));
    }
}
