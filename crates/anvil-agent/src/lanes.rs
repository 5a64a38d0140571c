use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Semaphore;

/// Wall-clock accounting for one lane submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaneMetrics {
    pub wait_ms: u64,
    pub run_ms: u64,
}

/// Per-session FIFO serializer with a global concurrency cap.
///
/// Work for the same lane executes one item at a time, in submission order
/// (the tokio mutex hands the lock out fairly). Across lanes, at most
/// `max_concurrent` items run at once. The lane lock is taken before a
/// global permit so queued same-lane work never holds capacity while it
/// waits its turn.
pub struct LaneQueue {
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl LaneQueue {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            lanes: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Lanes currently able to start work without waiting on the cap.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `work` inside the lane, returning its result and how long the
    /// submission waited before starting. Dropping the returned future
    /// before it starts removes the queued item silently.
    pub async fn run<T, F>(&self, lane_id: &str, work: F) -> (T, LaneMetrics)
    where
        F: Future<Output = T>,
    {
        let queued_at = Instant::now();
        let lane = self.lane(lane_id);
        let _lane_guard = lane.lock().await;
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("lane queue semaphore closed");
        let started_at = Instant::now();
        let result = work.await;
        let metrics = LaneMetrics {
            wait_ms: started_at.duration_since(queued_at).as_millis() as u64,
            run_ms: started_at.elapsed().as_millis() as u64,
        };
        (result, metrics)
    }

    fn lane(&self, lane_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().expect("lane map mutex poisoned");
        lanes
            .entry(lane_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn same_lane_work_is_serialized_in_submission_order() {
        let queue = Arc::new(LaneQueue::new(4));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let queue = queue.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run("lane-a", async move {
                        log.lock().expect("log").push(format!("start-{i}"));
                        sleep(Duration::from_millis(20)).await;
                        log.lock().expect("log").push(format!("end-{i}"));
                    })
                    .await;
            }));
            // Stagger spawns so submission order is deterministic.
            sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.expect("lane task");
        }

        let log = log.lock().expect("log").clone();
        assert_eq!(
            log,
            vec!["start-0", "end-0", "start-1", "end-1", "start-2", "end-2"]
        );
    }

    #[tokio::test]
    async fn distinct_lanes_overlap_up_to_the_global_cap() {
        let queue = Arc::new(LaneQueue::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(&format!("lane-{i}"), async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.expect("lane task");
        }

        let observed_peak = peak.load(Ordering::SeqCst);
        assert!(observed_peak >= 2, "expected overlap, saw peak {observed_peak}");
        assert!(observed_peak <= 2, "cap exceeded, saw peak {observed_peak}");
    }

    #[tokio::test]
    async fn wait_time_is_reported_for_blocked_submissions() {
        let queue = Arc::new(LaneQueue::new(1));
        let first = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run("lane-a", async {
                        sleep(Duration::from_millis(50)).await;
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;
        let ((), metrics) = queue.run("lane-a", async {}).await;
        first.await.expect("first task");
        assert!(metrics.wait_ms >= 30, "waited {}ms", metrics.wait_ms);
    }
}
