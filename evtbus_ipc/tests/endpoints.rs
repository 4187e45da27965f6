//! Producer and consumer endpoints over shared-memory ring buffers

use evtbus_ipc::discovery::MarkerDir;
use evtbus_ipc::framing::{MessageType, frame};
use evtbus_ipc::{
    AttachMode, BincodeCodec, CancelToken, Consumer, IpcRegistry, IpcResult, Producer, Received,
    RetryPolicy, RingBuffer, RingBufferTransport, SendOutcome, StopReason,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Event {
    id: u32,
    energy: f64,
    hits: Vec<u16>,
}

fn event(id: u32) -> Event {
    Event {
        id,
        energy: id as f64 * 0.5,
        hits: (0..(id % 7) as u16).collect(),
    }
}

fn retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_micros(20))
}

fn producer(ring: &RingBuffer, cancel: &CancelToken) -> IpcResult<Producer<Event, BincodeCodec<Event>>> {
    Ok(Producer::new(
        RingBufferTransport::attach(ring.id(), AttachMode::Producer)?,
        BincodeCodec::new(),
        retry(),
        cancel.clone(),
    ))
}

fn consumer(ring: &RingBuffer, cancel: &CancelToken) -> IpcResult<Consumer<Event, BincodeCodec<Event>>> {
    Ok(Consumer::new(
        RingBufferTransport::attach(ring.id(), AttachMode::Consumer)?,
        BincodeCodec::new(),
        retry(),
        cancel.clone(),
    ))
}

#[test]
fn test_records_flow_through_a_small_buffer_in_order() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    // Far smaller than the stream, so the producer backs off repeatedly.
    let ring = RingBuffer::create(None, 256, &registry)?;
    let cancel = CancelToken::new();
    let mut output = consumer(&ring, &cancel)?;
    let mut input = producer(&ring, &cancel)?;

    let sender = std::thread::spawn(move || -> IpcResult<u64> {
        for id in 0..5_000 {
            assert_eq!(input.send(&event(id))?, SendOutcome::Sent);
        }
        input.finish()?;
        Ok(input.sent_count())
    });

    let mut expected = 0;
    let summary = output.run(|record| {
        assert_eq!(record, event(expected));
        expected += 1;
        Ok(())
    })?;
    assert_eq!(sender.join().unwrap()?, 5_000);
    assert_eq!(summary.processed, 5_000);
    assert_eq!(summary.dropped, 0);
    assert_eq!(summary.reason, StopReason::EndOfInput);
    Ok(())
}

#[test]
fn test_workers_share_the_stream_without_duplicates() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let ring = RingBuffer::create(None, 1024, &registry)?;
    let cancel = CancelToken::new();
    let mut input = producer(&ring, &cancel)?;

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let mut worker = consumer(&ring, &cancel)?;
            Ok(std::thread::spawn(move || -> IpcResult<(Vec<u32>, StopReason)> {
                let mut seen = Vec::new();
                let summary = worker.run(|record| {
                    seen.push(record.id);
                    Ok(())
                })?;
                Ok((seen, summary.reason))
            }))
        })
        .collect::<IpcResult<Vec<_>>>()?;

    for id in 0..2_000 {
        input.send(&event(id))?;
    }
    // Detaching the only producer lets the workers see the end of stream.
    drop(input);

    let mut all = BTreeSet::new();
    let mut total = 0;
    for worker in workers {
        let (seen, reason) = worker.join().unwrap()?;
        assert_eq!(reason, StopReason::EndOfStream);
        // order is preserved within each worker's share
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        total += seen.len();
        all.extend(seen);
    }
    assert_eq!(total, 2_000);
    assert_eq!(all, (0..2_000).collect());
    Ok(())
}

#[test]
fn test_cancel_releases_a_blocked_producer() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let ring = RingBuffer::create(None, 64, &registry)?;
    let cancel = CancelToken::new();
    let mut input = producer(&ring, &cancel)?;

    let stopper = {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        })
    };
    // Nobody consumes, so the buffer fills and the producer waits.
    let outcome = loop {
        match input.send(&event(3))? {
            SendOutcome::Sent => continue,
            cancelled @ SendOutcome::Cancelled(_) => break cancelled,
        }
    };
    stopper.join().unwrap();
    match outcome {
        SendOutcome::Cancelled(bytes) => assert!(!bytes.is_empty()),
        SendOutcome::Sent => unreachable!(),
    }
    assert!(ring.status().entry_count > 0);
    Ok(())
}

#[test]
fn test_undecodable_event_is_dropped_and_counted() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let ring = RingBuffer::create(None, 512, &registry)?;
    let cancel = CancelToken::new();
    let mut output = consumer(&ring, &cancel)?;
    let mut input = producer(&ring, &cancel)?;

    input.send(&event(1))?;
    // A garbage event between two good ones.
    ring.enqueue(&frame(MessageType::Event, &[0xff, 0x01])?)?;
    input.send(&event(2))?;
    input.finish()?;

    assert_eq!(output.recv()?, Received::Control(MessageType::BeginRun));
    assert_eq!(output.recv()?, Received::Record(event(1)));
    assert_eq!(output.recv()?, Received::Record(event(2)));
    assert_eq!(output.dropped_count(), 1);
    assert_eq!(output.recv()?, Received::Control(MessageType::EndOfInput));
    Ok(())
}

#[test]
fn test_mismatched_record_type_is_rejected() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let ring = RingBuffer::create(None, 512, &registry)?;
    let cancel = CancelToken::new();
    let mut input = producer(&ring, &cancel)?;
    let mut output: Consumer<u64, _> = Consumer::new(
        RingBufferTransport::attach(ring.id(), AttachMode::Consumer)?,
        BincodeCodec::<u64>::new(),
        retry(),
        cancel.clone(),
    );

    input.send(&event(9))?;
    input.finish()?;
    // The descriptor does not match, so it is dropped like a corrupt event.
    assert_eq!(output.recv()?, Received::Control(MessageType::BeginRun));
    assert_eq!(output.dropped_count(), 1);
    Ok(())
}
