//! Persistence queue
//!
//! Three bounded lanes fan processed messages out to the slow sinks: the
//! relational store, the time-series store, and communication statistics.
//! Lanes drop oldest at capacity so a stalled sink sheds load instead of
//! stalling the pipeline; drops are visible in the stats.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{DeviceDataMessage, Quality, TimestampedValue};
use crate::util::{BoundedQueue, OverflowPolicy};

use super::repository::RepositoryError;

/// Full message + points payload for the RDB and series lanes.
#[derive(Debug, Clone)]
pub struct PersistenceTask {
    pub message: DeviceDataMessage,
    pub points: Vec<TimestampedValue>,
}

/// Device-level counters for the comm-stats lane.
#[derive(Debug, Clone)]
pub struct CommStatsTask {
    pub device_id: i64,
    pub tenant_id: i32,
    pub timestamp: DateTime<Utc>,
    pub point_count: usize,
    pub good_count: usize,
    pub bad_count: usize,
}

impl CommStatsTask {
    pub fn from_message(message: &DeviceDataMessage) -> Self {
        let good_count = message
            .points
            .iter()
            .filter(|p| p.quality == Quality::Good)
            .count();
        Self {
            device_id: message.device_id,
            tenant_id: message.tenant_id,
            timestamp: message.timestamp,
            point_count: message.points.len(),
            good_count,
            bad_count: message.points.len() - good_count,
        }
    }
}

/// Slow-sink contract the lane consumers drive.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save_rdb(&self, task: &PersistenceTask) -> Result<(), RepositoryError>;
    async fn save_series(&self, task: &PersistenceTask) -> Result<(), RepositoryError>;
    async fn save_comm_stats(&self, task: &CommStatsTask) -> Result<(), RepositoryError>;
}

/// Sink for deployments without a configured store; counts and logs.
#[derive(Default)]
pub struct NullPersistenceSink;

#[async_trait]
impl PersistenceSink for NullPersistenceSink {
    async fn save_rdb(&self, task: &PersistenceTask) -> Result<(), RepositoryError> {
        debug!(device_id = task.message.device_id, points = task.points.len(), "RDB save (null sink)");
        Ok(())
    }

    async fn save_series(&self, task: &PersistenceTask) -> Result<(), RepositoryError> {
        debug!(device_id = task.message.device_id, "Series save (null sink)");
        Ok(())
    }

    async fn save_comm_stats(&self, task: &CommStatsTask) -> Result<(), RepositoryError> {
        debug!(device_id = task.device_id, "Comm stats save (null sink)");
        Ok(())
    }
}

/// Recording sink for tests.
#[derive(Default)]
pub struct MemoryPersistenceSink {
    pub rdb: std::sync::Mutex<Vec<PersistenceTask>>,
    pub series: std::sync::Mutex<Vec<PersistenceTask>>,
    pub comm_stats: std::sync::Mutex<Vec<CommStatsTask>>,
}

#[async_trait]
impl PersistenceSink for MemoryPersistenceSink {
    async fn save_rdb(&self, task: &PersistenceTask) -> Result<(), RepositoryError> {
        self.rdb
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.clone());
        Ok(())
    }

    async fn save_series(&self, task: &PersistenceTask) -> Result<(), RepositoryError> {
        self.series
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.clone());
        Ok(())
    }

    async fn save_comm_stats(&self, task: &CommStatsTask) -> Result<(), RepositoryError> {
        self.comm_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task.clone());
        Ok(())
    }
}

/// Queue stats snapshot.
#[derive(Debug, Clone, Default)]
pub struct PersistenceQueueStats {
    pub rdb_depth: usize,
    pub series_depth: usize,
    pub comm_depth: usize,
    pub rdb_dropped: u64,
    pub series_dropped: u64,
    pub comm_dropped: u64,
}

/// The three-lane queue plus its consumer tasks.
pub struct PersistenceQueue {
    rdb: Arc<BoundedQueue<PersistenceTask>>,
    series: Arc<BoundedQueue<PersistenceTask>>,
    comm: Arc<BoundedQueue<CommStatsTask>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PersistenceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            rdb: Arc::new(BoundedQueue::new(capacity, OverflowPolicy::DropOldest)),
            series: Arc::new(BoundedQueue::new(capacity, OverflowPolicy::DropOldest)),
            comm: Arc::new(BoundedQueue::new(capacity, OverflowPolicy::DropOldest)),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn one consumer task per lane driving the given sink.
    pub fn start(&self, sink: Arc<dyn PersistenceSink>, cancel: CancellationToken) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());

        let rdb = Arc::clone(&self.rdb);
        let rdb_sink = Arc::clone(&sink);
        let rdb_cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            lane_loop("rdb", rdb, rdb_cancel, move |task| {
                let sink = Arc::clone(&rdb_sink);
                async move { sink.save_rdb(&task).await }
            })
            .await;
        }));

        let series = Arc::clone(&self.series);
        let series_sink = Arc::clone(&sink);
        let series_cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            lane_loop("series", series, series_cancel, move |task| {
                let sink = Arc::clone(&series_sink);
                async move { sink.save_series(&task).await }
            })
            .await;
        }));

        let comm = Arc::clone(&self.comm);
        let comm_cancel = cancel;
        workers.push(tokio::spawn(async move {
            lane_loop("comm_stats", comm, comm_cancel, move |task| {
                let sink = Arc::clone(&sink);
                async move { sink.save_comm_stats(&task).await }
            })
            .await;
        }));

        info!("Persistence queue consumers started");
    }

    pub async fn queue_rdb(&self, message: &DeviceDataMessage, points: &[TimestampedValue]) {
        let _ = self
            .rdb
            .push(PersistenceTask {
                message: message.clone(),
                points: points.to_vec(),
            })
            .await;
    }

    pub async fn queue_series(&self, message: &DeviceDataMessage, points: &[TimestampedValue]) {
        let _ = self
            .series
            .push(PersistenceTask {
                message: message.clone(),
                points: points.to_vec(),
            })
            .await;
    }

    pub async fn queue_comm_stats(&self, message: &DeviceDataMessage) {
        let _ = self.comm.push(CommStatsTask::from_message(message)).await;
    }

    /// Close the lanes; consumers drain what is queued, then exit.
    pub async fn stop(&self) {
        self.rdb.close();
        self.series.close();
        self.comm.close();

        let workers: Vec<_> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
        info!("Persistence queue stopped");
    }

    pub fn stats(&self) -> PersistenceQueueStats {
        PersistenceQueueStats {
            rdb_depth: self.rdb.len(),
            series_depth: self.series.len(),
            comm_depth: self.comm.len(),
            rdb_dropped: self.rdb.dropped_count(),
            series_dropped: self.series.dropped_count(),
            comm_dropped: self.comm.dropped_count(),
        }
    }
}

async fn lane_loop<T, F, Fut>(
    lane: &'static str,
    queue: Arc<BoundedQueue<T>>,
    cancel: CancellationToken,
    mut save: F,
) where
    T: Send + 'static,
    F: FnMut(T) -> Fut + Send,
    Fut: std::future::Future<Output = Result<(), RepositoryError>> + Send,
{
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => {
                // Drain whatever is left without blocking on new work.
                while let Some(task) = queue.try_pop() {
                    if let Err(e) = save(task).await {
                        warn!(lane, error = %e, "Persistence save failed during drain");
                    }
                }
                break;
            }
            task = queue.pop() => match task {
                Some(task) => task,
                None => break,
            },
        };

        if let Err(e) = save(task).await {
            warn!(lane, error = %e, "Persistence save failed");
        }
    }
    debug!(lane, "Persistence lane consumer exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message() -> DeviceDataMessage {
        DeviceDataMessage::new(7, 1, vec![TimestampedValue::new(1, 150.0)])
    }

    #[tokio::test]
    async fn lanes_deliver_to_sink() {
        let queue = PersistenceQueue::new(16);
        let sink = Arc::new(MemoryPersistenceSink::default());
        let cancel = CancellationToken::new();
        queue.start(Arc::clone(&sink) as Arc<dyn PersistenceSink>, cancel);

        let msg = make_message();
        queue.queue_rdb(&msg, &msg.points).await;
        queue.queue_series(&msg, &msg.points).await;
        queue.queue_comm_stats(&msg).await;
        queue.stop().await;

        assert_eq!(sink.rdb.lock().unwrap().len(), 1);
        assert_eq!(sink.series.lock().unwrap().len(), 1);
        let comm = sink.comm_stats.lock().unwrap();
        assert_eq!(comm.len(), 1);
        assert_eq!(comm[0].good_count, 1);
        assert_eq!(comm[0].bad_count, 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let queue = PersistenceQueue::new(2);
        let msg = make_message();
        for _ in 0..5 {
            queue.queue_rdb(&msg, &msg.points).await;
        }
        let stats = queue.stats();
        assert_eq!(stats.rdb_depth, 2);
        assert_eq!(stats.rdb_dropped, 3);
    }
}
