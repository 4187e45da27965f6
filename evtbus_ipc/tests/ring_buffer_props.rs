//! Ring buffer FIFO, capacity and wraparound properties

use evtbus_ipc::discovery::MarkerDir;
use evtbus_ipc::framing::{MessageType, frame, unframe};
use evtbus_ipc::{AttachMode, IpcError, IpcRegistry, IpcResult, RingBuffer};
use proptest::prelude::*;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
enum Op {
    Enqueue(Vec<u8>),
    Dequeue,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => proptest::collection::vec(any::<u8>(), 0..48).prop_map(Op::Enqueue),
        2 => Just(Op::Dequeue),
    ]
}

fn words(bytes: &[u8]) -> usize {
    bytes.len().div_ceil(4)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn ring_behaves_like_a_bounded_fifo(
        capacity in 3usize..48,
        ops in proptest::collection::vec(op(), 1..160),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
        let ring = RingBuffer::create(None, capacity, &registry).unwrap();
        let mut model: VecDeque<Vec<u8>> = VecDeque::new();
        let mut used = 0usize;

        for op in ops {
            match op {
                Op::Enqueue(payload) => {
                    let bytes = frame(MessageType::Event, &payload).unwrap();
                    let need = words(&bytes);
                    match ring.enqueue(&bytes) {
                        Ok(()) => {
                            prop_assert!(used + need <= capacity);
                            used += need;
                            model.push_back(payload);
                        }
                        Err(IpcError::WouldBlock) => {
                            prop_assert!(need <= capacity && used + need > capacity)
                        }
                        Err(IpcError::InvalidArgument { .. }) => prop_assert!(need > capacity),
                        Err(e) => prop_assert!(false, "unexpected enqueue error: {}", e),
                    }
                }
                Op::Dequeue => match ring.dequeue() {
                    Ok(bytes) => {
                        let expected = model.pop_front();
                        prop_assert!(expected.is_some(), "dequeued from an empty model");
                        used -= words(&bytes);
                        let decoded = unframe(&bytes).unwrap();
                        prop_assert_eq!(decoded.tag, MessageType::Event);
                        prop_assert_eq!(Some(decoded.payload), expected);
                    }
                    Err(IpcError::WouldBlock) => prop_assert!(model.is_empty()),
                    Err(e) => prop_assert!(false, "unexpected dequeue error: {}", e),
                },
            }
            let status = ring.status();
            prop_assert_eq!(status.filled_words, used);
            prop_assert_eq!(status.entry_count as usize, model.len());
            prop_assert!(status.filled_words <= status.capacity_words);
        }
    }
}

#[test]
fn test_wraparound_preserves_messages() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    // 7 words never divides evenly into 3-word frames, so frames straddle the end.
    let ring = RingBuffer::create(None, 7, &registry)?;

    for i in 0u32..500 {
        let payload = i.to_le_bytes();
        ring.enqueue(&frame(MessageType::Event, &payload)?)?;
        let out = unframe(&ring.dequeue()?)?;
        assert_eq!(out.payload, payload);
    }
    let status = ring.status();
    assert_eq!(status.total_enqueued, 500);
    assert_eq!(status.total_dequeued, 500);
    assert_eq!(status.filled_words, 0);
    Ok(())
}

#[test]
fn test_backpressure_until_consumer_frees_space() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let ring = RingBuffer::create(None, 10, &registry)?;
    let message = frame(MessageType::Event, &[1, 2, 3, 4, 5, 6, 7, 8])?;

    ring.enqueue(&message)?;
    ring.enqueue(&message)?;
    assert!(matches!(ring.enqueue(&message), Err(IpcError::WouldBlock)));
    assert_eq!(ring.fill_fraction(), 0.8);

    ring.dequeue()?;
    ring.enqueue(&message)?;
    assert_eq!(ring.status().entry_count, 2);
    Ok(())
}

#[test]
fn test_producers_and_consumers_in_threads_see_every_message() -> IpcResult<()> {
    let dir = tempfile::tempdir()?;
    let registry = IpcRegistry::new(MarkerDir::new(dir.path()));
    let ring = RingBuffer::create(None, 64, &registry)?;
    let id = ring.id();
    const PER_PRODUCER: u32 = 2_000;

    let producers: Vec<_> = (0u32..3)
        .map(|p| {
            std::thread::spawn(move || -> IpcResult<()> {
                let handle = RingBuffer::attach(id, AttachMode::Producer)?;
                for seq in 0..PER_PRODUCER {
                    let mut payload = p.to_le_bytes().to_vec();
                    payload.extend_from_slice(&seq.to_le_bytes());
                    let bytes = frame(MessageType::Event, &payload)?;
                    loop {
                        match handle.enqueue(&bytes) {
                            Err(IpcError::WouldBlock) => std::thread::yield_now(),
                            other => break other?,
                        }
                    }
                }
                Ok(())
            })
        })
        .collect();

    let consumer = RingBuffer::attach(id, AttachMode::Consumer)?;
    let mut next = [0u32; 3];
    let mut received = 0;
    while received < 3 * PER_PRODUCER {
        match consumer.dequeue() {
            Ok(bytes) => {
                let payload = unframe(&bytes)?.payload;
                let p = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
                let seq = u32::from_le_bytes(payload[4..].try_into().unwrap());
                // per-producer order is preserved
                assert_eq!(seq, next[p]);
                next[p] += 1;
                received += 1;
            }
            Err(IpcError::WouldBlock) => std::thread::yield_now(),
            Err(e) => return Err(e),
        }
    }
    for producer in producers {
        producer.join().unwrap()?;
    }
    assert!(ring.is_drained());
    Ok(())
}
