use crossbeam::channel::{bounded, Receiver, Sender};
use htree::{HistoryError, HistoryTree, HtConfig};
use interval::{Interval, Timestamp, Value};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::HistoryTreeBackend;

/// Default capacity of the insertion queue.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

enum Message {
    Insert(Interval),
    /// Close the tree at this end time and report the outcome. The thread
    /// stops only once the tree is closed.
    Finish(Timestamp, Sender<Result<(), HistoryError>>),
    /// Stop without closing the tree.
    Cancel,
}

/// A [`HistoryTreeBackend`] whose tree is mutated by a dedicated thread.
///
/// Insertions go through a bounded FIFO queue and are applied in the order
/// they were sent. A full queue blocks the producer, which is the only
/// backpressure between a fast producer and a slow disk.
///
/// Queries run on the caller's thread, concurrently with the mutation thread.
pub struct ThreadedHistoryTreeBackend {
    backend: Arc<HistoryTreeBackend>,
    sender: Sender<Message>,
    /// Set once the tree is closed or the worker is cancelled.
    closing: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedHistoryTreeBackend {
    /// Creates the history file and starts the mutation thread.
    pub fn new(config: HtConfig, queue_size: usize) -> Result<Self, HistoryError> {
        let backend = Arc::new(HistoryTreeBackend::new(config)?);
        let (sender, receiver) = bounded(queue_size);

        let worker_backend = Arc::clone(&backend);
        let worker = thread::Builder::new()
            .name("htree-mutation".into())
            .spawn(move || mutation_loop(&worker_backend, &receiver))?;
        info!(queue_size, "mutation thread started");

        Ok(Self {
            backend,
            sender,
            closing: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues an interval, blocking while the queue is full.
    ///
    /// The interval is validated here, including the tree start and the node
    /// capacity, so usage errors reach the caller. Only I/O failures happen
    /// on the mutation thread, where they are logged.
    pub fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        attribute: u32,
        value: Value,
    ) -> Result<(), HistoryError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(HistoryError::AlreadyFinished);
        }
        let interval = Interval::new(start, end, attribute, value)?;
        self.backend.tree().check_insertable(&interval)?;
        self.sender
            .send(Message::Insert(interval))
            .map_err(|_| HistoryError::WorkerGone)
    }

    /// Drains the queue, closes the tree at `end_time` and joins the mutation
    /// thread. When this returns `Ok` no writer is left.
    ///
    /// If the tree refuses to close, the error is returned and the mutation
    /// thread keeps running: inserts and another finish may follow.
    pub fn finished_building(&self, end_time: Timestamp) -> Result<(), HistoryError> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            return Err(HistoryError::AlreadyFinished);
        }

        let (reply, outcome) = bounded(1);
        self.sender
            .send(Message::Finish(end_time, reply))
            .map_err(|_| HistoryError::WorkerGone)?;
        outcome.recv().map_err(|_| HistoryError::WorkerGone)??;

        self.closing.store(true, Ordering::Release);
        if let Some(handle) = worker.take() {
            handle.join().map_err(|_| HistoryError::WorkerGone)?;
        }
        Ok(())
    }

    /// Stops the mutation thread if it still runs, then disposes the backend.
    /// An unfinished history file is deleted.
    pub fn dispose(&self) -> Result<(), HistoryError> {
        self.stop_worker();
        self.backend.dispose()
    }

    fn stop_worker(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.closing.store(true, Ordering::Release);
        // the worker may already be gone, nothing left to cancel then
        let _ = self.sender.send(Message::Cancel);
        if handle.join().is_err() {
            error!("mutation thread panicked");
        }
    }

    // ------------------------------------------------------------------------
    // Queries, served by the wrapped backend
    // ------------------------------------------------------------------------

    pub fn do_query(&self, t: Timestamp) -> Result<BTreeMap<u32, Interval>, HistoryError> {
        self.backend.do_query(t)
    }

    pub fn do_singular_query(&self, t: Timestamp, attribute: u32) -> Result<Interval, HistoryError> {
        self.backend.do_singular_query(t, attribute)
    }

    pub fn start_time(&self) -> Timestamp {
        self.backend.start_time()
    }

    pub fn end_time(&self) -> Timestamp {
        self.backend.end_time()
    }

    pub fn file_size(&self) -> u64 {
        self.backend.file_size()
    }

    pub fn average_node_usage(&self) -> Result<f64, HistoryError> {
        self.backend.average_node_usage()
    }

    pub fn is_finished(&self) -> bool {
        self.backend.is_finished()
    }

    pub fn tree(&self) -> &HistoryTree {
        self.backend.tree()
    }
}

impl Drop for ThreadedHistoryTreeBackend {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn mutation_loop(backend: &HistoryTreeBackend, receiver: &Receiver<Message>) {
    let mut dropped = 0u64;
    // recv fails only once every sender is gone
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Insert(interval) => {
                if let Err(e) = backend.insert_interval(interval) {
                    dropped += 1;
                    error!(error = %e, dropped, "dropping interval");
                }
            }
            Message::Finish(end_time, reply) => {
                let outcome = backend.finished_building(end_time);
                let closed = outcome.is_ok();
                if let Err(e) = &outcome {
                    warn!(end_time, error = %e, "history could not be closed");
                }
                // the caller blocks on the reply, it only fails if it is gone
                let _ = reply.send(outcome);
                if closed {
                    debug!(end_time, dropped, "mutation thread finished");
                    return;
                }
            }
            Message::Cancel => {
                debug!(dropped, "mutation thread cancelled");
                return;
            }
        }
    }
}
