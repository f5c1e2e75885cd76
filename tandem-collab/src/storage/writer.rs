//! Deferred persistence of committed operations.
//!
//! Each document session owns one writer. The session hands over every
//! committed operation without waiting; the writer task batches whatever has
//! queued up and writes it on the blocking pool. A failed batch stays queued
//! and is retried, so a slow or broken disk never stalls the commit path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tandem_core::{CommittedOperation, Revision};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::DocumentStorage;

/// Attempts made for the remaining batch once the session has closed.
const FINAL_ATTEMPTS: u32 = 3;

pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<CommittedOperation>,
    durable: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl PersistenceWriter {
    /// Start a writer for `doc_id` whose storage already holds everything up
    /// to `durable_from`.
    pub fn spawn(
        doc_id: Uuid,
        storage: Arc<dyn DocumentStorage>,
        durable_from: Revision,
        max_batch: usize,
        retry_delay: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let durable = Arc::new(AtomicU64::new(durable_from));
        let task = tokio::spawn(run_writer(
            doc_id,
            storage,
            rx,
            Arc::clone(&durable),
            max_batch.max(1),
            retry_delay,
        ));
        Self { tx, durable, task }
    }

    /// Queue an operation for persistence. Never blocks.
    pub fn persist(&self, operation: CommittedOperation) {
        if self.tx.send(operation).is_err() {
            log::warn!("Persistence writer stopped; operation reaches storage only via snapshot");
        }
    }

    /// Highest revision known to be in storage.
    pub fn durable_revision(&self) -> Revision {
        self.durable.load(Ordering::Acquire)
    }

    /// Flush the queue and stop. Returns the final durable revision.
    pub async fn finish(self) -> Revision {
        let Self { tx, durable, task } = self;
        drop(tx);
        if let Err(e) = task.await {
            log::error!("Persistence writer task failed: {e}");
        }
        durable.load(Ordering::Acquire)
    }
}

async fn run_writer(
    doc_id: Uuid,
    storage: Arc<dyn DocumentStorage>,
    mut rx: mpsc::UnboundedReceiver<CommittedOperation>,
    durable: Arc<AtomicU64>,
    max_batch: usize,
    retry_delay: Duration,
) {
    let mut pending: Vec<CommittedOperation> = Vec::new();
    let mut closed = false;
    let mut failures = 0u32;

    loop {
        if pending.is_empty() {
            if closed {
                break;
            }
            match rx.recv().await {
                Some(op) => pending.push(op),
                None => break,
            }
        }
        while !closed && pending.len() < max_batch {
            match rx.try_recv() {
                Ok(op) => pending.push(op),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => closed = true,
            }
        }

        let batch = pending.clone();
        let store = Arc::clone(&storage);
        let result =
            tokio::task::spawn_blocking(move || store.append_operations(doc_id, &batch)).await;

        match result {
            Ok(Ok(())) => {
                if let Some(last) = pending.last() {
                    durable.store(last.revision, Ordering::Release);
                    log::trace!(
                        "Document {doc_id}: persisted {} ops up to r{}",
                        pending.len(),
                        last.revision
                    );
                }
                pending.clear();
                failures = 0;
            }
            Ok(Err(e)) => {
                failures += 1;
                log::warn!(
                    "Document {doc_id}: failed to persist {} ops (attempt {failures}): {e}",
                    pending.len()
                );
            }
            Err(e) => {
                failures += 1;
                log::error!("Document {doc_id}: persistence task panicked: {e}");
            }
        }

        if failures > 0 {
            if closed && failures >= FINAL_ATTEMPTS {
                log::error!(
                    "Document {doc_id}: giving up on {} unpersisted ops after close",
                    pending.len()
                );
                break;
            }
            tokio::time::sleep(retry_delay).await;
        }
    }
}
