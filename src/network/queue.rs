//! Bounded receive queue and its drain worker
//!
//! The queue decouples socket reads from application-level packet handling:
//! the endpoint's I/O thread pushes raw buffers, a dedicated worker pops them
//! and hands each to the packet translator. Backpressure is the all-or-nothing
//! drop policy: when the queue exceeds both its packet-count limit and its
//! byte-total limit, the whole queue is purged as a unit and one overflow
//! warning is raised. Nothing ever slows the socket-reading thread down.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::network::dispatch::PacketDispatch;
use crate::Result;

/// Sleep between polls when the queue is empty
const DRAIN_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Dropped totals reported when the queue is purged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOverflow {
    pub packets: usize,
    pub octets: usize,
}

struct QueueInner {
    entries: VecDeque<Bytes>,
    octets: usize,
}

/// FIFO queue of raw packet buffers with a running byte total.
///
/// Invariant: `octets` always equals the sum of the lengths of the queued
/// entries.
pub struct ReceiveQueue {
    inner: Mutex<QueueInner>,
    limit_packets: usize,
    limit_octets: usize,
}

impl ReceiveQueue {
    pub fn new(limit_packets: usize, limit_octets: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                octets: 0,
            }),
            limit_packets,
            limit_octets,
        }
    }

    /// Append one or more buffers.
    ///
    /// When the queue afterwards exceeds both the packet-count limit and the
    /// byte-total limit, the entire queue is dropped as a unit and the dropped
    /// totals are returned for reporting. Exceeding only one of the two limits
    /// never purges.
    pub fn push(&self, entries: impl IntoIterator<Item = Bytes>) -> Option<QueueOverflow> {
        let mut inner = self.inner.lock();
        for entry in entries {
            inner.octets += entry.len();
            inner.entries.push_back(entry);
        }
        if inner.entries.len() > self.limit_packets && inner.octets > self.limit_octets {
            let overflow = QueueOverflow {
                packets: inner.entries.len(),
                octets: inner.octets,
            };
            inner.entries.clear();
            inner.octets = 0;
            warn!(
                "receive queue overflow, dropped {} packets ({} octets)",
                overflow.packets, overflow.octets
            );
            return Some(overflow);
        }
        None
    }

    /// Remove and return the oldest entry.
    pub fn pop(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop_front()?;
        inner.octets -= entry.len();
        Some(entry)
    }

    /// Empty the queue. Used during forced shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.octets = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn octets(&self) -> usize {
        self.inner.lock().octets
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

/// Callback invoked by the drain worker for every dequeued buffer.
///
/// Errors it returns are wrapped and reported through the dispatch error
/// channel, never propagated into the worker or I/O threads.
pub type PacketTranslator = Arc<dyn Fn(&PacketDispatch, &[u8]) -> Result<()> + Send + Sync>;

/// Dedicated consumer thread for a [`ReceiveQueue`].
pub struct DrainWorker {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    stop_when_clear: Arc<AtomicBool>,
}

impl DrainWorker {
    /// Spawn the worker thread.
    pub fn spawn(
        queue: Arc<ReceiveQueue>,
        dispatch: Arc<PacketDispatch>,
        translator: PacketTranslator,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_when_clear = Arc::new(AtomicBool::new(false));

        let stop_flag = stop.clone();
        let clear_flag = stop_when_clear.clone();
        let handle = thread::Builder::new()
            .name("drain-worker".to_string())
            .spawn(move || {
                Self::drain_loop(queue, dispatch, translator, stop_flag, clear_flag);
                debug!("drain worker stopped");
            })
            .map_err(TransportError::Io)?;

        Ok(Self {
            handle: Some(handle),
            stop,
            stop_when_clear,
        })
    }

    fn drain_loop(
        queue: Arc<ReceiveQueue>,
        dispatch: Arc<PacketDispatch>,
        translator: PacketTranslator,
        stop: Arc<AtomicBool>,
        stop_when_clear: Arc<AtomicBool>,
    ) {
        while !stop.load(Ordering::Relaxed) {
            match queue.pop() {
                Some(buffer) => {
                    if let Err(e) = translator(&dispatch, &buffer) {
                        let wrapped = TransportError::Translator(e.to_string());
                        dispatch.fire_error(&wrapped);
                    }
                }
                None => {
                    if stop_when_clear.load(Ordering::Relaxed) {
                        break;
                    }
                    thread::sleep(DRAIN_IDLE_SLEEP);
                }
            }
        }
    }

    /// Ask the worker to exit once the queue is empty.
    pub fn stop_when_clear(&self) {
        self.stop_when_clear.store(true, Ordering::SeqCst);
    }

    /// Ask the worker to exit at the next loop iteration regardless of queue
    /// contents.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the worker and wait for its thread to exit.
    pub fn join(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DrainWorker {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(len: usize) -> Bytes {
        Bytes::from(vec![0u8; len])
    }

    #[test]
    fn test_fifo_and_byte_total() {
        let queue = ReceiveQueue::new(16, 1 << 20);
        assert!(queue.push([Bytes::from_static(b"abc"), Bytes::from_static(b"de")]).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.octets(), 5);
        assert_eq!(queue.pop().unwrap().as_ref(), b"abc");
        assert_eq!(queue.octets(), 2);
        assert_eq!(queue.pop().unwrap().as_ref(), b"de");
        assert!(queue.pop().is_none());
        assert_eq!(queue.octets(), 0);
    }

    #[test]
    fn test_overflow_requires_both_limits() {
        // count exceeded (3 > 2) but bytes (30) not > 1000: no purge
        let queue = ReceiveQueue::new(2, 1000);
        assert!(queue.push([entry(10), entry(10), entry(10)]).is_none());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.octets(), 30);

        // bytes exceeded but count not: still no purge
        let queue = ReceiveQueue::new(10, 15);
        assert!(queue.push([entry(10), entry(10)]).is_none());
        assert_eq!(queue.len(), 2);

        // both exceeded: whole queue dropped as a unit, one warning
        let queue = ReceiveQueue::new(2, 25);
        let overflow = queue.push([entry(10), entry(10), entry(10)]).unwrap();
        assert_eq!(overflow, QueueOverflow { packets: 3, octets: 30 });
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.octets(), 0);
    }

    #[test]
    fn test_clear_resets_totals() {
        let queue = ReceiveQueue::new(16, 1 << 20);
        queue.push([entry(100), entry(200)]);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.octets(), 0);
    }

    proptest! {
        // byte total always equals the sum of queued entry lengths under
        // randomized push/pop/clear interleavings
        #[test]
        fn prop_byte_total_matches_entries(ops in proptest::collection::vec((0u8..3, 1usize..512), 1..200)) {
            let queue = ReceiveQueue::new(64, 16 * 1024);
            let mut model: VecDeque<usize> = VecDeque::new();
            for (op, len) in ops {
                match op {
                    0 => {
                        if queue.push([entry(len)]).is_some() {
                            model.clear();
                        } else {
                            model.push_back(len);
                        }
                    }
                    1 => {
                        let popped = queue.pop().map(|b| b.len());
                        prop_assert_eq!(popped, model.pop_front());
                    }
                    _ => {
                        queue.clear();
                        model.clear();
                    }
                }
                prop_assert_eq!(queue.len(), model.len());
                prop_assert_eq!(queue.octets(), model.iter().sum::<usize>());
            }
        }
    }

    #[test]
    fn test_drain_worker_translates_and_isolates_errors() {
        let queue = Arc::new(ReceiveQueue::new(64, 1 << 20));
        let dispatch = Arc::new(PacketDispatch::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(0usize));

        struct Counter(Arc<Mutex<usize>>);
        impl crate::network::dispatch::ErrorListener for Counter {
            fn on_error(&self, _error: &TransportError) {
                *self.0.lock() += 1;
            }
        }
        dispatch.subscribe_errors(Arc::new(Counter(errors.clone())));

        let seen_by_translator = seen.clone();
        let translator: PacketTranslator = Arc::new(move |_dispatch, buffer| {
            if buffer == b"bad".as_slice() {
                return Err(TransportError::Config("unparseable".into()));
            }
            seen_by_translator.lock().push(buffer.to_vec());
            Ok(())
        });

        let mut worker = DrainWorker::spawn(queue.clone(), dispatch, translator).unwrap();
        queue.push([
            Bytes::from_static(b"one"),
            Bytes::from_static(b"bad"),
            Bytes::from_static(b"two"),
        ]);

        // a failing buffer is reported and dropped, the worker keeps going
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().len() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        worker.stop_when_clear();
        worker.join();

        assert_eq!(*errors.lock(), 1);
        assert_eq!(seen.lock().clone(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stop_when_clear_exits_on_empty_queue() {
        let queue = Arc::new(ReceiveQueue::new(64, 1 << 20));
        let dispatch = Arc::new(PacketDispatch::new());
        let translator: PacketTranslator = Arc::new(|_, _| Ok(()));
        let mut worker = DrainWorker::spawn(queue, dispatch, translator).unwrap();

        worker.stop_when_clear();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !worker.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.is_finished());
        worker.join();
    }
}
