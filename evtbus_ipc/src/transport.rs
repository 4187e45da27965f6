//! Transport-agnostic byte channel used by the producer/consumer endpoints

use crate::error::IpcResult;
use crate::ring_buffer::{AttachMode, BufferId, RingBuffer};

/// Moves complete frames between processes.
///
/// `enqueue` and `dequeue` return [`IpcError::WouldBlock`](crate::IpcError::WouldBlock)
/// instead of waiting; the endpoints own the retry loop.
pub trait Transport: Send {
    /// Hand one encoded frame to the channel
    fn enqueue(&mut self, bytes: &[u8]) -> IpcResult<()>;

    /// Take the next encoded frame from the channel
    fn dequeue(&mut self) -> IpcResult<Vec<u8>>;

    /// Called after the consumer has fully processed the last dequeued
    /// event. Transports with flow control acknowledge here.
    fn complete(&mut self) -> IpcResult<()> {
        Ok(())
    }

    /// Wait until everything enqueued so far has been accepted by the peer.
    fn flush(&mut self) -> IpcResult<()> {
        Ok(())
    }

    /// No more data will ever arrive.
    fn is_finished(&self) -> bool;

    /// Short description for diagnostics
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn enqueue(&mut self, bytes: &[u8]) -> IpcResult<()> {
        (**self).enqueue(bytes)
    }

    fn dequeue(&mut self) -> IpcResult<Vec<u8>> {
        (**self).dequeue()
    }

    fn complete(&mut self) -> IpcResult<()> {
        (**self).complete()
    }

    fn flush(&mut self) -> IpcResult<()> {
        (**self).flush()
    }

    fn is_finished(&self) -> bool {
        (**self).is_finished()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Shared-memory ring buffer as a [`Transport`]
#[derive(Debug)]
pub struct RingBufferTransport {
    ring: RingBuffer,
}

impl RingBufferTransport {
    /// Wrap an existing handle
    pub fn new(ring: RingBuffer) -> Self {
        Self { ring }
    }

    /// Attach to buffer `id` in `mode`
    pub fn attach(id: BufferId, mode: AttachMode) -> IpcResult<Self> {
        RingBuffer::attach(id, mode).map(Self::new)
    }

    /// Underlying buffer
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Unwrap the buffer handle
    pub fn into_inner(self) -> RingBuffer {
        self.ring
    }
}

impl Transport for RingBufferTransport {
    fn enqueue(&mut self, bytes: &[u8]) -> IpcResult<()> {
        self.ring.enqueue(bytes)
    }

    fn dequeue(&mut self) -> IpcResult<Vec<u8>> {
        self.ring.dequeue()
    }

    fn is_finished(&self) -> bool {
        self.ring.is_drained()
    }

    fn describe(&self) -> String {
        format!("ring buffer {}", self.ring.id())
    }
}
