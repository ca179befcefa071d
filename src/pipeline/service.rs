//! Data processing service
//!
//! Single ingress for protocol drivers: messages land on a bounded MPMC
//! queue and a fixed worker pool runs each one through the stage chain.
//! Back-pressure at the queue surfaces to the driver as a block or a
//! rejected enqueue, per configuration. Shutdown drains up to a grace
//! deadline, then cancels; whatever is still queued is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::types::DeviceDataMessage;
use crate::util::{BoundedQueue, OverflowPolicy, QueueError};

use super::context::PipelineContext;
use super::stages::PipelineStage;

/// Cumulative pipeline statistics.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub messages_processed: u64,
    pub messages_aborted: u64,
    pub alarms_triggered: u64,
    pub virtual_points_added: u64,
    pub queue_depth: usize,
    pub queue_rejected: u64,
    pub queue_dropped: u64,
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pipeline: {} messages ({} aborted), {} alarms, {} virtual points, queue depth {}",
            self.messages_processed,
            self.messages_aborted,
            self.alarms_triggered,
            self.virtual_points_added,
            self.queue_depth
        )
    }
}

#[derive(Default)]
struct StatsInner {
    messages_processed: AtomicU64,
    messages_aborted: AtomicU64,
    alarms_triggered: AtomicU64,
    virtual_points_added: AtomicU64,
}

pub struct DataProcessingService {
    queue: Arc<BoundedQueue<DeviceDataMessage>>,
    stages: Arc<Vec<Box<dyn PipelineStage>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    stats: Arc<StatsInner>,
    worker_count: usize,
    drain_grace: Duration,
}

impl DataProcessingService {
    pub fn new(stages: Vec<Box<dyn PipelineStage>>, config: &PipelineConfig) -> Self {
        let policy = match config.overflow.as_str() {
            "reject" => OverflowPolicy::Reject,
            _ => OverflowPolicy::Block,
        };
        Self {
            queue: Arc::new(BoundedQueue::new(config.queue_capacity, policy)),
            stages: Arc::new(stages),
            workers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            stats: Arc::new(StatsInner::default()),
            worker_count: config.worker_count.max(1),
            drain_grace: Duration::from_millis(config.drain_grace_ms),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.worker_count {
            let queue = Arc::clone(&self.queue);
            let stages = Arc::clone(&self.stages);
            let stats = Arc::clone(&self.stats);
            let cancel = self.cancel.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(index, queue, stages, stats, cancel).await;
            }));
        }
        info!(workers = self.worker_count, "Data processing service started");
    }

    /// Driver-facing ingress. Applies the configured back-pressure policy.
    pub async fn send_device_data(&self, message: DeviceDataMessage) -> Result<(), QueueError> {
        self.queue.push(message).await
    }

    /// Stop: drain the queue up to the grace deadline, then cancel and join.
    pub async fn stop(&self) {
        self.queue.close();

        let workers: Vec<_> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        if workers.is_empty() {
            return;
        }

        let join_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(self.drain_grace, join_all).await.is_err() {
            warn!(
                remaining = self.queue.len(),
                "Drain grace exceeded — cancelling workers"
            );
            self.cancel.cancel();
        }
        info!("Data processing service stopped");
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            messages_processed: self.stats.messages_processed.load(Ordering::Relaxed),
            messages_aborted: self.stats.messages_aborted.load(Ordering::Relaxed),
            alarms_triggered: self.stats.alarms_triggered.load(Ordering::Relaxed),
            virtual_points_added: self.stats.virtual_points_added.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
            queue_rejected: self.queue.rejected_count(),
            queue_dropped: self.queue.dropped_count(),
        }
    }
}

async fn worker_loop(
    index: usize,
    queue: Arc<BoundedQueue<DeviceDataMessage>>,
    stages: Arc<Vec<Box<dyn PipelineStage>>>,
    stats: Arc<StatsInner>,
    cancel: CancellationToken,
) {
    debug!(worker = index, "Pipeline worker started");
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = queue.pop() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let mut context = PipelineContext::new(message);
        let mut aborted = false;
        for stage in stages.iter() {
            if !stage.process(&mut context).await {
                warn!(
                    worker = index,
                    stage = stage.name(),
                    device_id = context.message.device_id,
                    error = %context.error_message,
                    "Stage aborted chain"
                );
                aborted = true;
                break;
            }
        }

        stats.messages_processed.fetch_add(1, Ordering::Relaxed);
        if aborted {
            stats.messages_aborted.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .alarms_triggered
            .fetch_add(context.stats.alarms_triggered as u64, Ordering::Relaxed);
        stats
            .virtual_points_added
            .fetch_add(context.stats.virtual_points_added as u64, Ordering::Relaxed);
    }
    debug!(worker = index, "Pipeline worker exited");
}
