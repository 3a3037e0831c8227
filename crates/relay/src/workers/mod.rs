use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::counter::FillCounter;
use crate::exporter::Exporter;
use crate::flush_trigger::{FlushReason, FlushTrigger};
use crate::impressions::{ImpressionsBatch, ImpressionsJob, ImpressionsMode, SdkMetadata, count_records};
use crate::ingest::Ingestor;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Records a worker may hold before it flushes on volume.
    pub threshold: usize,
    pub workers: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<ImpressionsJob>>>;

/// Handle to the running workers. Dropping it leaves them running; call
/// [`WorkerPool::shutdown`] to drain and stop them.
pub struct WorkerPool {
    cancel: CancellationToken,
    tracker: TaskTracker,
    counter: Arc<FillCounter>,
}

impl WorkerPool {
    /// Build a pipeline and spawn its workers on the current tokio runtime.
    ///
    /// Returns the producer handle alongside the pool. Every call creates an
    /// independent queue, counter and flush signal.
    pub fn initialize<E: Exporter>(config: PipelineConfig, exporter: E) -> (Ingestor, WorkerPool) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue: SharedReceiver = Arc::new(Mutex::new(rx));
        let counter = Arc::new(FillCounter::new());
        counter.reset();
        let flush_signal = Arc::new(Notify::new());
        let exporter = Arc::new(exporter);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let workers = config.workers.max(1);
        for id in 0..workers {
            let worker = Worker {
                id,
                queue: Arc::clone(&queue),
                exporter: Arc::clone(&exporter),
                counter: Arc::clone(&counter),
                flush_signal: Arc::clone(&flush_signal),
                trigger: FlushTrigger::new(config.threshold, config.flush_interval),
                global_threshold: i64::try_from(config.threshold).unwrap_or(i64::MAX),
                pending: Accumulation::default(),
                cancel: cancel.clone(),
            };
            tracker.spawn(worker.run());
        }
        tracker.close();

        info!(
            workers,
            threshold = config.threshold,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "impressions workers started"
        );

        let ingestor = Ingestor::new(tx, Arc::clone(&counter), flush_signal, config.threshold);
        (
            ingestor,
            WorkerPool {
                cancel,
                tracker,
                counter,
            },
        )
    }

    /// Records accepted but not yet resolved by a flush.
    pub fn pending(&self) -> i64 {
        self.counter.value()
    }

    /// Stop accepting work, let every worker drain the queue and finish its
    /// final flush, then return.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.wait().await;
        debug!(pending = self.counter.value(), "impressions workers stopped");
    }
}

/// Batches held by one worker, grouped by client identity in arrival order.
#[derive(Default)]
struct Accumulation {
    groups: Vec<ClientGroup>,
    records: usize,
}

struct ClientGroup {
    metadata: SdkMetadata,
    mode: ImpressionsMode,
    batches: Vec<ImpressionsBatch>,
}

impl Accumulation {
    fn push(&mut self, job: ImpressionsJob) {
        self.records += job.record_count();
        match self
            .groups
            .iter_mut()
            .find(|g| g.metadata == job.metadata && g.mode == job.mode)
        {
            Some(group) => group.batches.extend(job.batches),
            None => self.groups.push(ClientGroup {
                metadata: job.metadata,
                mode: job.mode,
                batches: job.batches,
            }),
        }
    }
}

struct Worker<E> {
    id: usize,
    queue: SharedReceiver,
    exporter: Arc<E>,
    counter: Arc<FillCounter>,
    flush_signal: Arc<Notify>,
    trigger: FlushTrigger,
    /// Pool-wide fill level above which any holding worker flushes.
    global_threshold: i64,
    pending: Accumulation,
    cancel: CancellationToken,
}

async fn next_job(queue: &SharedReceiver) -> Option<ImpressionsJob> {
    queue.lock().await.recv().await
}

impl<E: Exporter> Worker<E> {
    async fn run(mut self) {
        debug!(worker = self.id, "impressions worker running");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                job = next_job(&self.queue) => match job {
                    Some(job) => {
                        self.accept(job);
                        if self.trigger.should_flush_on_volume(self.pending.records) {
                            self.flush(FlushReason::Volume).await;
                        } else if self.counter.greater_than(self.global_threshold) {
                            // The signal may have been raised while this job was in flight.
                            self.flush(FlushReason::Signal).await;
                        }
                    }
                    // Every producer is gone.
                    None => break,
                },
                _ = self.flush_signal.notified() => {
                    self.flush(FlushReason::Signal).await;
                }
                _ = self.trigger.next_tick() => {
                    if self.trigger.should_flush_on_timer() {
                        self.flush(FlushReason::Timer).await;
                    }
                }
            }
        }

        self.drain_queue().await;
        self.flush(FlushReason::Shutdown).await;
        debug!(worker = self.id, "impressions worker exited");
    }

    fn accept(&mut self, job: ImpressionsJob) {
        self.pending.push(job);
        self.trigger.record_dequeue();
    }

    /// Close the queue to new work and take whatever is still buffered in it.
    /// Idempotent across workers.
    async fn drain_queue(&mut self) {
        let queue = Arc::clone(&self.queue);
        let mut rx = queue.lock().await;
        rx.close();
        while let Some(job) = rx.recv().await {
            self.accept(job);
        }
    }

    /// POST everything accumulated, one request per client identity. Failed
    /// requests are logged and their records dropped.
    async fn flush(&mut self, reason: FlushReason) {
        if !self.trigger.begin_flush() {
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        for group in pending.groups {
            let records = count_records(&group.batches);
            let batches = group.batches.len();
            let sdk_version = group.metadata.version.clone();

            // An exporter panic surfaces here as a JoinError.
            let exporter = Arc::clone(&self.exporter);
            let result = tokio::spawn(async move {
                exporter
                    .export(&group.metadata, group.mode, &group.batches)
                    .await
            })
            .await;

            match result {
                Ok(Ok(())) => {
                    debug!(worker = self.id, %reason, records, batches, %sdk_version, "posted impressions");
                }
                Ok(Err(e)) => {
                    error!(worker = self.id, %reason, records, %sdk_version, error = %e, "failed to post impressions, dropping");
                }
                Err(e) => {
                    error!(worker = self.id, %reason, records, %sdk_version, error = %e, "impressions export task panicked, dropping");
                }
            }
            self.counter.addition(-(records as i64));
        }

        self.trigger.record_flush();
    }
}
