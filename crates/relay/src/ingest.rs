use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::counter::FillCounter;
use crate::impressions::{ImpressionsBatch, ImpressionsJob, ImpressionsMode, SdkMetadata, count_records};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed impressions payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("impressions queue is full")]
    QueueFull,

    #[error("impressions pipeline is shut down")]
    Closed,
}

/// Producer side of the pipeline. Cheap to clone; every clone feeds the same
/// queue and counter.
#[derive(Clone)]
pub struct Ingestor {
    tx: mpsc::Sender<ImpressionsJob>,
    counter: Arc<FillCounter>,
    flush_signal: Arc<Notify>,
    threshold: i64,
}

impl Ingestor {
    pub(crate) fn new(
        tx: mpsc::Sender<ImpressionsJob>,
        counter: Arc<FillCounter>,
        flush_signal: Arc<Notify>,
        threshold: usize,
    ) -> Self {
        Self {
            tx,
            counter,
            flush_signal,
            threshold: i64::try_from(threshold).unwrap_or(i64::MAX),
        }
    }

    /// Decode `raw` and queue it for dispatch with the caller's identity.
    ///
    /// Never waits on the network. On any error nothing is queued and the
    /// fill counter is left as it was. Returns the number of records queued.
    pub fn add_impressions(
        &self,
        raw: &[u8],
        sdk_version: &str,
        machine_ip: &str,
        machine_name: &str,
        mode: &str,
    ) -> Result<usize, IngestError> {
        let batches: Vec<ImpressionsBatch> = serde_json::from_slice(raw)?;
        if batches.is_empty() {
            return Ok(0);
        }

        let job = ImpressionsJob {
            metadata: SdkMetadata::new(sdk_version, machine_ip, machine_name),
            mode: ImpressionsMode::parse(mode),
            batches,
        };
        let total = count_records(&job.batches);
        let delta = i64::try_from(total).unwrap_or(i64::MAX);

        // Count before sending so a fast worker never decrements below zero.
        self.counter.addition(delta);
        if let Err(e) = self.tx.try_send(job) {
            self.counter.addition(-delta);
            return Err(match e {
                TrySendError::Full(_) => IngestError::QueueFull,
                TrySendError::Closed(_) => IngestError::Closed,
            });
        }

        if self.counter.greater_than(self.threshold) {
            debug!(pending = self.counter.value(), "fill threshold crossed, signalling flush");
            self.flush_signal.notify_waiters();
        }

        Ok(total)
    }

    pub fn pending(&self) -> i64 {
        self.counter.value()
    }
}
