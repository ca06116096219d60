use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
};
use tracing::{debug, error, warn};

use super::Shared;
use crate::{collector::LossReason, encoding::EncodedBatch, error::StorageError};

/// Hand-off queue between callers and the I/O loop.
///
/// Closing the queue drops the writer's sender, which stops the I/O loop once every queued batch has been taken.
pub(super) struct Queue {
    sender: Mutex<Option<mpsc::Sender<EncodedBatch>>>,
}

impl Queue {
    pub(super) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<EncodedBatch>) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let queue = Self {
            sender: Mutex::new(Some(sender)),
        };
        (queue, receiver)
    }

    fn sender(&self) -> Option<mpsc::Sender<EncodedBatch>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(super) fn close(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Hands a batch to the I/O loop.
///
/// With backpressure, waits for room in the queue. Without, a full queue drops the batch.
pub(super) async fn enqueue(
    queue: &Queue, shared: &Shared, batch: EncodedBatch, allow_backpressure: bool,
) -> Result<(), StorageError> {
    let Some(sender) = queue.sender() else {
        return Err(StorageError::WriterClosed);
    };

    if allow_backpressure {
        return sender.send(batch).await.map_err(|_| StorageError::WriterClosed);
    }

    match sender.try_send(batch) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(batch)) => {
            let samples = batch.samples();
            warn!(samples, "Write queue full. Dropping batch.");
            shared.collector.record_lost(LossReason::QueueFull, samples);
            Ok(())
        }
        Err(TrySendError::Closed(_)) => Err(StorageError::WriterClosed),
    }
}

/// Takes batches off the queue, admits them through the bulkhead, and drives their writes to completion.
pub(super) async fn run_io_loop(
    mut batches: mpsc::Receiver<EncodedBatch>, shared: Arc<Shared>, max_wait: Option<Duration>,
) {
    debug!(writer = shared.name, "Starting writer I/O task.");

    let mut in_flight = JoinSet::new();
    let mut done = false;

    loop {
        select! {
            maybe_batch = batches.recv(), if !done => match maybe_batch {
                Some(batch) => {
                    // Rejections are recorded on admission.
                    if let Ok(permit) = shared.admit(batch.samples(), max_wait).await {
                        let shared = Arc::clone(&shared);
                        in_flight.spawn(async move { shared.transmit(batch, permit).await });
                    }
                },
                None => {
                    done = true;
                    debug!(writer = shared.name, in_flight = in_flight.len(), "Write queue closed. Completing in-flight writes...");
                }
            },

            Some(task_result) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = task_result {
                    error!(writer = shared.name, error = %e, "Write task failed to run to completion.");
                }
            },

            else => break,
        }
    }

    debug!(writer = shared.name, "Writer I/O task stopped.");
}
