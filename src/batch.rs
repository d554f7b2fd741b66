use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::BatchConfig;
use crate::geocode::{Coordinates, FailureReason, GeocodeService, Outcome};
use crate::keys::LookupKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedKey {
    pub key: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub resolved: BTreeMap<String, Coordinates>,
    pub failed: Vec<FailedKey>,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.resolved.len() + self.failed.len()
    }

    pub fn success_rate(&self) -> f64 {
        percentage(self.resolved.len(), self.processed())
    }

    pub fn failed_keys(&self) -> Vec<String> {
        self.failed.iter().map(|entry| entry.key.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub batch: usize,
    pub total_batches: usize,
    pub processed: usize,
    pub total_keys: usize,
    pub resolved: usize,
    pub failed: usize,
}

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

pub struct BatchRunner {
    service: GeocodeService,
    config: BatchConfig,
    observer: Option<ProgressObserver>,
}

impl BatchRunner {
    pub fn new(service: GeocodeService, config: BatchConfig) -> Self {
        Self {
            service,
            config,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    // Keys are expected to be unique and sorted.
    pub async fn run(&self, keys: &[LookupKey]) -> BatchReport {
        let batch_size = self.config.batch_size.max(1);
        let concurrency_cap = self.config.concurrency_cap.max(1);
        let total_batches = keys.len().div_ceil(batch_size);
        let gate = Semaphore::new(concurrency_cap);
        let mut report = BatchReport::default();

        info!(
            keys = keys.len(),
            batch_size,
            concurrency_cap,
            total_batches,
            "starting geocode run"
        );

        for (index, batch) in keys.chunks(batch_size).enumerate() {
            let started = Instant::now();
            let outcomes = join_all(batch.iter().map(|key| self.resolve_gated(&gate, key))).await;

            let mut batch_resolved = 0;
            for (key, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Outcome::Success(coordinates) => {
                        report.resolved.insert(key.to_string(), coordinates);
                        batch_resolved += 1;
                    }
                    Outcome::Failure(reason) => report.failed.push(FailedKey {
                        key: key.to_string(),
                        reason,
                    }),
                }
            }

            info!(
                batch = index + 1,
                total_batches,
                successful = batch_resolved,
                size = batch.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                processed = report.processed(),
                total = keys.len(),
                success_rate = %format!("{:.1}%", report.success_rate()),
                "batch completed"
            );

            if let Some(observer) = &self.observer {
                observer(BatchProgress {
                    batch: index + 1,
                    total_batches,
                    processed: report.processed(),
                    total_keys: keys.len(),
                    resolved: report.resolved.len(),
                    failed: report.failed.len(),
                });
            }

            if index + 1 < total_batches && !self.config.inter_batch_delay.is_zero() {
                sleep(self.config.inter_batch_delay).await;
            }
        }

        report
    }

    async fn resolve_gated(&self, gate: &Semaphore, key: &LookupKey) -> Outcome {
        // The permit is held until the outcome is known, whatever it is.
        let Ok(_permit) = gate.acquire().await else {
            warn!(%key, "concurrency gate closed before lookup");
            return Outcome::Failure(FailureReason::Transport);
        };
        self.service.resolve(key).await
    }
}

pub(crate) fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
