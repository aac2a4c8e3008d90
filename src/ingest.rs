//! The ingest pipeline: a bounded FIFO queue of in-flight datasets fed by
//! the SCP handlers, a pool of anonymizer workers draining it, and the
//! periodic model autosave task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{error, info, warn};

use crate::anonymize::Anonymizer;
use crate::config::{IngestSettings, ProjectModel};
use crate::dicom_access::Dataset;
use crate::error::AnonymizerError;
use crate::phi_index::MODEL_FILENAME;

/// Dequeue timeout before a worker re-checks the active flag.
const WORKER_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
/// Idle sleep after an empty dequeue.
const WORKER_THREAD_SLEEP: Duration = Duration::from_millis(250);
/// Upper bound on waiting for the worker pool at shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Polls a thread to completion, abandoning it at the deadline so shutdown
/// stays finite even when a thread is stuck in a blocking call. Returns
/// false when the thread was abandoned.
pub(crate) fn join_until(handle: JoinHandle<()>, deadline: Instant, name: &str) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            error!(thread = name, "join deadline expired, abandoning thread");
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
    if handle.join().is_err() {
        error!(thread = name, "thread panicked");
    }
    true
}

/// One dataset admitted off the wire, waiting for an anonymizer worker.
pub struct IngestItem {
    pub source: String,
    pub dataset: Dataset,
    pub ts_uid: String,
}

/// Bounded FIFO handle shared between SCP handlers and workers.
#[derive(Clone)]
pub struct IngestQueue {
    tx: Sender<IngestItem>,
    rx: Receiver<IngestItem>,
}

impl IngestQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Non-blocking enqueue; a full queue is reported as resource pressure.
    pub fn enqueue(&self, item: IngestItem) -> Result<(), AnonymizerError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AnonymizerError::StorageError(
                "ingest queue is full".into(),
            )),
            Err(TrySendError::Disconnected(_)) => {
                Err(AnonymizerError::Cancelled)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Worker pool plus autosave task around the shared anonymizer.
pub struct IngestPipeline {
    queue: IngestQueue,
    active: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    autosave: Option<JoinHandle<()>>,
    anonymizer: Arc<Anonymizer>,
}

impl IngestPipeline {
    pub fn start(model: &ProjectModel, anonymizer: Arc<Anonymizer>) -> Self {
        let settings = model.ingest;
        let queue = IngestQueue::new(settings.queue_capacity);
        let active = Arc::new(AtomicBool::new(true));

        let mut workers = Vec::with_capacity(settings.worker_count);
        for i in 0..settings.worker_count {
            workers.push(spawn_worker(
                i + 1,
                queue.rx.clone(),
                Arc::clone(&anonymizer),
                Arc::clone(&active),
            ));
        }

        let autosave = spawn_autosave(
            model.private_dir().join(MODEL_FILENAME),
            settings,
            Arc::clone(&anonymizer),
            Arc::clone(&active),
        );

        info!(workers = settings.worker_count, "ingest pipeline started");
        Self {
            queue,
            active,
            workers,
            autosave: Some(autosave),
            anonymizer,
        }
    }

    pub fn queue(&self) -> IngestQueue {
        self.queue.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deterministic shutdown: clear the active flag, join every worker
    /// (they drain the queue first) under a finite deadline, stop the
    /// autosave task, then flush a final snapshot. A worker wedged in a
    /// blocking call is abandoned rather than hanging the process.
    pub fn shutdown(mut self) {
        info!("stopping ingest pipeline");
        self.active.store(false, Ordering::Release);
        let deadline = Instant::now() + SHUTDOWN_JOIN_TIMEOUT;
        for worker in self.workers.drain(..) {
            join_until(worker, deadline, "anonymizer worker");
        }
        // The autosave task flushes a final snapshot on its way out; give
        // that flush its own bound.
        if let Some(autosave) = self.autosave.take() {
            join_until(
                autosave,
                Instant::now() + SHUTDOWN_JOIN_TIMEOUT,
                "autosave task",
            );
        }
        info!("ingest pipeline stopped");
    }

    pub fn anonymizer(&self) -> &Arc<Anonymizer> {
        &self.anonymizer
    }
}

fn spawn_worker(
    id: usize,
    rx: Receiver<IngestItem>,
    anonymizer: Arc<Anonymizer>,
    active: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("anon-worker-{id}"))
        .spawn(move || {
            info!(worker = id, "anonymizer worker started");
            loop {
                match rx.recv_timeout(WORKER_DEQUEUE_TIMEOUT) {
                    Ok(item) => {
                        // Failures are quarantined and logged inside the
                        // engine; a worker never dies on a bad dataset.
                        match anonymizer.anonymize(&item.source, item.dataset, &item.ts_uid) {
                            Ok(_) | Err(AnonymizerError::AlreadyPresent) => {}
                            Err(e) => warn!(worker = id, error = %e, "anonymization failed"),
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if !active.load(Ordering::Acquire) && rx.is_empty() {
                            break;
                        }
                        thread::sleep(WORKER_THREAD_SLEEP);
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!(worker = id, "anonymizer worker stopped");
        })
        .expect("spawn anonymizer worker")
}

fn spawn_autosave(
    model_path: PathBuf,
    settings: IngestSettings,
    anonymizer: Arc<Anonymizer>,
    active: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("anon-autosave".into())
        .spawn(move || {
            info!(interval = settings.autosave_interval_secs, "autosave task started");
            let mut elapsed = 0u64;
            while active.load(Ordering::Acquire) {
                thread::sleep(Duration::from_secs(1));
                elapsed += 1;
                if elapsed < settings.autosave_interval_secs {
                    continue;
                }
                elapsed = 0;
                if anonymizer.index().take_dirty() {
                    if let Err(e) = anonymizer.index().save(&model_path) {
                        error!(error = %e, "autosave failed");
                        // Try again on the next tick.
                        anonymizer.index().mark_dirty();
                    }
                }
            }
            // Shutdown flush: persist whatever the workers produced last.
            if let Err(e) = anonymizer.index().save(&model_path) {
                error!(error = %e, "final model save failed");
            }
            info!("autosave task stopped");
        })
        .expect("spawn autosave task")
}
