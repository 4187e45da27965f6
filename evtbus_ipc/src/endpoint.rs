//! Producer and consumer endpoints
//!
//! Both endpoints sit on top of a [`Transport`] and own the retry loop that
//! turns `WouldBlock` into backpressure: a full channel slows the producer,
//! an empty one idles the consumer. The cancellation token is checked at
//! every retry boundary, so shutdown is honored within one retry interval
//! without losing the message in hand.

use crate::codec::{RecordCodec, StreamerInfo};
use crate::error::{IpcError, IpcResult};
use crate::framing::{MessageType, frame, unframe};
use crate::socket::ControlSubscriber;
use crate::transport::Transport;
use evtbus::config::RingConfig;
use evtbus::consts::DEFAULT_RETRY_INTERVAL_US;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Sleep between attempts while the transport reports `WouldBlock`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between two attempts
    pub interval: Duration,
    /// Give up with `WouldBlock` after this many attempts; `None` retries forever
    pub max_attempts: Option<u64>,
}

impl RetryPolicy {
    /// Retry forever with `interval` between attempts
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Stop after `attempts` attempts
    pub const fn with_max_attempts(mut self, attempts: u64) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Interval from the `[ring]` configuration section
    pub fn from_config(config: &RingConfig) -> Self {
        Self::new(config.retry_interval())
    }

    fn exhausted(&self, attempts: u64) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_micros(DEFAULT_RETRY_INTERVAL_US))
    }
}

/// Process-local shutdown request shared between threads
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether shutdown was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Where an endpoint is in its send/receive cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Between operations
    Idle,
    /// Producer retrying an enqueue
    Sending,
    /// Consumer waiting for a message
    Waiting,
    /// Consumer handed a record to the caller that has not been completed yet
    Delivered,
}

/// Result of a producer send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The frame is in the transport
    Sent,
    /// Cancelled while waiting for space; the unsent frame is handed back
    Cancelled(Vec<u8>),
}

/// Input side: frames records and pushes them into a transport
pub struct Producer<T, C> {
    transport: Box<dyn Transport>,
    codec: C,
    retry: RetryPolicy,
    cancel: CancelToken,
    state: EndpointState,
    descriptor_sent: bool,
    sent: u64,
    _record: PhantomData<fn(&T)>,
}

impl<T, C: RecordCodec<T>> Producer<T, C> {
    /// Producer over `transport`
    pub fn new(
        transport: impl Transport + 'static,
        codec: C,
        retry: RetryPolicy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transport: Box::new(transport),
            codec,
            retry,
            cancel,
            state: EndpointState::Idle,
            descriptor_sent: false,
            sent: 0,
            _record: PhantomData,
        }
    }

    /// Announce a run: the streamer descriptor followed by `BeginRun`.
    /// Called implicitly by the first [`send`](Self::send) of a run.
    pub fn begin_run(&mut self) -> IpcResult<SendOutcome> {
        if self.descriptor_sent {
            return Ok(SendOutcome::Sent);
        }
        let descriptor = self.codec.descriptor();
        let outcome = self.push(frame(MessageType::StreamerInfo, &descriptor.to_payload()?)?)?;
        if outcome != SendOutcome::Sent {
            return Ok(outcome);
        }
        self.descriptor_sent = true;
        info!(
            transport = %self.transport.describe(),
            record = %descriptor.type_name,
            schema = descriptor.schema_version,
            "run started"
        );
        self.push(frame(MessageType::BeginRun, &[])?)
    }

    /// Close the current run; the next send announces a new one.
    pub fn end_run(&mut self) -> IpcResult<SendOutcome> {
        let outcome = self.push(frame(MessageType::EndRun, &[])?)?;
        if outcome == SendOutcome::Sent {
            self.descriptor_sent = false;
        }
        Ok(outcome)
    }

    /// Frame one record and enqueue it, retrying while the transport is full.
    /// Codec failures are returned before anything is enqueued.
    pub fn send(&mut self, record: &T) -> IpcResult<SendOutcome> {
        let outcome = self.begin_run()?;
        if outcome != SendOutcome::Sent {
            return Ok(outcome);
        }
        let payload = self.codec.serialize_record(record)?;
        let outcome = self.push(frame(MessageType::Event, &payload)?)?;
        if outcome == SendOutcome::Sent {
            self.sent += 1;
            debug!(sent = self.sent, bytes = payload.len(), "event sent");
        }
        Ok(outcome)
    }

    /// Send a payload-free run or control message.
    pub fn send_control(&mut self, tag: MessageType) -> IpcResult<SendOutcome> {
        match tag {
            MessageType::BeginRun
            | MessageType::EndRun
            | MessageType::EndOfInput
            | MessageType::Terminate => self.push(frame(tag, &[])?),
            other => Err(IpcError::invalid(format!("{other:?} is not a control message"))),
        }
    }

    /// Send `EndOfInput` and wait for the transport to drain.
    pub fn finish(&mut self) -> IpcResult<SendOutcome> {
        let outcome = self.send_control(MessageType::EndOfInput)?;
        if outcome == SendOutcome::Sent {
            self.transport.flush()?;
            info!(sent = self.sent, transport = %self.transport.describe(), "input finished");
        }
        Ok(outcome)
    }

    /// Events successfully enqueued
    pub fn sent_count(&self) -> u64 {
        self.sent
    }

    /// Current state
    pub fn state(&self) -> EndpointState {
        self.state
    }

    fn push(&mut self, bytes: Vec<u8>) -> IpcResult<SendOutcome> {
        self.state = EndpointState::Sending;
        let mut attempts = 0u64;
        let result = loop {
            match self.transport.enqueue(&bytes) {
                Ok(()) => break Ok(SendOutcome::Sent),
                Err(IpcError::WouldBlock) => {
                    attempts += 1;
                    if self.cancel.is_cancelled() {
                        debug!(attempts, "send cancelled while waiting for space");
                        break Ok(SendOutcome::Cancelled(bytes));
                    }
                    if self.retry.exhausted(attempts) {
                        break Err(IpcError::WouldBlock);
                    }
                    std::thread::sleep(self.retry.interval);
                }
                Err(e) => {
                    error!(transport = %self.transport.describe(), error = %e, "enqueue failed");
                    break Err(e);
                }
            }
        };
        self.state = EndpointState::Idle;
        result
    }
}

/// What a consumer receive produced
#[derive(Debug, Clone, PartialEq)]
pub enum Received<T> {
    /// One decoded event record
    Record(T),
    /// A run or control message (`BeginRun`, `EndRun`, `EndOfInput`, `Terminate`)
    Control(MessageType),
    /// The transport will deliver nothing more
    EndOfStream,
    /// Cancelled while waiting
    Cancelled,
}

/// Why [`Consumer::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `EndOfInput` received and the data channel is empty
    EndOfInput,
    /// `Terminate` received
    Terminated,
    /// Producers gone and nothing left
    EndOfStream,
    /// The cancellation token fired
    Cancelled,
}

/// Totals of one [`Consumer::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Records handed to the processing step
    pub processed: u64,
    /// Events dropped for framing or decode errors
    pub dropped: u64,
    /// Why the loop stopped
    pub reason: StopReason,
}

/// Worker or output side: pulls frames from a transport and decodes records
pub struct Consumer<T, C> {
    transport: Box<dyn Transport>,
    codec: C,
    retry: RetryPolicy,
    cancel: CancelToken,
    control: Option<ControlSubscriber>,
    state: EndpointState,
    end_of_input: bool,
    received: u64,
    dropped: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T, C: RecordCodec<T>> Consumer<T, C> {
    /// Consumer over `transport`
    pub fn new(
        transport: impl Transport + 'static,
        codec: C,
        retry: RetryPolicy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transport: Box::new(transport),
            codec,
            retry,
            cancel,
            control: None,
            state: EndpointState::Idle,
            end_of_input: false,
            received: 0,
            dropped: 0,
            _record: PhantomData,
        }
    }

    /// Also listen on an out-of-band control channel. `Terminate` cancels the
    /// consumer; `EndOfInput` ends it once the data channel is empty.
    pub fn with_control(mut self, subscriber: ControlSubscriber) -> Self {
        self.control = Some(subscriber);
        self
    }

    /// Next record or signal, waiting while the transport is empty.
    ///
    /// Framing and decode failures cost one event: they are logged, counted
    /// in [`dropped_count`](Self::dropped_count) and skipped. Any other
    /// transport error is returned.
    pub fn recv(&mut self) -> IpcResult<Received<T>> {
        if self.state == EndpointState::Delivered {
            self.complete()?;
        }
        let mut attempts = 0u64;
        loop {
            self.state = EndpointState::Waiting;
            if let Some(signal) = self.poll_control()? {
                return Ok(signal);
            }

            match self.transport.dequeue() {
                Ok(bytes) => match self.decode(&bytes) {
                    Ok(Some(Received::Record(record))) => {
                        self.received += 1;
                        self.state = EndpointState::Delivered;
                        return Ok(Received::Record(record));
                    }
                    Ok(Some(signal)) => {
                        self.state = EndpointState::Idle;
                        return Ok(signal);
                    }
                    Ok(None) => continue,
                    Err(e) if e.is_per_event() => {
                        self.dropped += 1;
                        warn!(
                            transport = %self.transport.describe(),
                            dropped = self.dropped,
                            error = %e,
                            "dropping undecodable event"
                        );
                        self.transport.complete()?;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                Err(IpcError::WouldBlock) => {
                    if self.transport.is_finished() {
                        self.state = EndpointState::Idle;
                        return Ok(Received::EndOfStream);
                    }
                    if self.end_of_input {
                        self.state = EndpointState::Idle;
                        return Ok(Received::Control(MessageType::EndOfInput));
                    }
                    attempts += 1;
                    if self.cancel.is_cancelled() {
                        self.state = EndpointState::Idle;
                        return Ok(Received::Cancelled);
                    }
                    if self.retry.exhausted(attempts) {
                        self.state = EndpointState::Idle;
                        return Err(IpcError::WouldBlock);
                    }
                    std::thread::sleep(self.retry.interval);
                }
                Err(IpcError::Closed { .. }) if self.transport.is_finished() => {
                    self.state = EndpointState::Idle;
                    return Ok(Received::EndOfStream);
                }
                Err(e) => {
                    error!(transport = %self.transport.describe(), error = %e, "dequeue failed");
                    self.state = EndpointState::Idle;
                    return Err(e);
                }
            }
        }
    }

    /// Tell the transport the last delivered record has been fully processed.
    pub fn complete(&mut self) -> IpcResult<()> {
        if self.state == EndpointState::Delivered {
            self.state = EndpointState::Idle;
            self.transport.complete()?;
        }
        Ok(())
    }

    /// Receive and process records until the input ends.
    pub fn run<F>(&mut self, mut process: F) -> IpcResult<RunSummary>
    where
        F: FnMut(T) -> IpcResult<()>,
    {
        let mut processed = 0u64;
        let reason = loop {
            match self.recv()? {
                Received::Record(record) => {
                    process(record)?;
                    self.complete()?;
                    processed += 1;
                }
                Received::Control(MessageType::EndOfInput) => break StopReason::EndOfInput,
                Received::Control(MessageType::Terminate) => break StopReason::Terminated,
                Received::Control(tag) => debug!(?tag, "run boundary"),
                Received::EndOfStream => break StopReason::EndOfStream,
                Received::Cancelled => break StopReason::Cancelled,
            }
        };
        info!(processed, dropped = self.dropped, ?reason, "consumer loop finished");
        Ok(RunSummary {
            processed,
            dropped: self.dropped,
            reason,
        })
    }

    /// Records delivered so far
    pub fn received_count(&self) -> u64 {
        self.received
    }

    /// Events dropped for framing or decode errors
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Current state
    pub fn state(&self) -> EndpointState {
        self.state
    }

    fn poll_control(&mut self) -> IpcResult<Option<Received<T>>> {
        let Some(control) = self.control.as_mut() else {
            return Ok(None);
        };
        match control.poll()? {
            Some(MessageType::Terminate) => {
                info!("terminate received on control channel");
                self.cancel.cancel();
                self.state = EndpointState::Idle;
                Ok(Some(Received::Control(MessageType::Terminate)))
            }
            Some(MessageType::EndOfInput) => {
                debug!("end of input received on control channel");
                self.end_of_input = true;
                Ok(None)
            }
            Some(_) | None => Ok(None),
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> IpcResult<Option<Received<T>>> {
        let frame = unframe(bytes)?;
        match frame.tag {
            MessageType::Event => self
                .codec
                .deserialize_record(&frame.payload)
                .map(|record| Some(Received::Record(record))),
            MessageType::StreamerInfo => {
                let info = StreamerInfo::from_payload(&frame.payload)?;
                self.codec.accept_descriptor(&info)?;
                debug!(record = %info.type_name, schema = info.schema_version, "descriptor accepted");
                Ok(None)
            }
            MessageType::EndOfInput => {
                self.end_of_input = true;
                Ok(Some(Received::Control(MessageType::EndOfInput)))
            }
            tag @ (MessageType::BeginRun | MessageType::EndRun | MessageType::Terminate) => {
                Ok(Some(Received::Control(tag)))
            }
            tag @ (MessageType::HistogramSnapshot | MessageType::Ack) => Err(IpcError::corrupt(
                format!("unexpected {tag:?} frame on the data channel"),
            )),
        }
    }
}
