use super::Job;
use std::sync::Arc;
use tokio::{
    sync::{RwLock, broadcast, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{error, info, warn};

/// Runs each job on its own fixed interval.
///
/// A job's run is awaited inside its loop, so runs of the same job never
/// overlap. Stopping lets an in-flight run finish.
pub struct JobScheduler {
    handles: Arc<RwLock<Vec<JoinHandle<()>>>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_coordinator: Option<watch::Receiver<bool>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            handles: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
            shutdown_coordinator: None,
        }
    }

    /// Create JobScheduler with graceful shutdown integration
    pub fn with_shutdown_coordinator(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            shutdown_coordinator: Some(shutdown_rx),
            ..Self::new()
        }
    }

    /// Start the job scheduler with registered jobs
    pub async fn start(&mut self, jobs: Vec<Arc<dyn Job>>) {
        info!("Starting job scheduler with {} jobs", jobs.len());

        let mut handles = self.handles.write().await;
        for job in jobs {
            handles.push(self.spawn_job(job));
        }

        info!("Job scheduler started successfully");
    }

    /// Stop the job scheduler and all running jobs
    pub async fn stop(&mut self) {
        info!("Stopping job scheduler...");

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal: {}", e);
        }

        let mut handles = self.handles.write().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Job handle failed during shutdown: {}", e);
            }
        }

        info!("Job scheduler stopped");
    }

    fn spawn_job(&self, job: Arc<dyn Job>) -> JoinHandle<()> {
        let job_name = job.name().to_string();
        let period = job.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let coordinator_rx = self.shutdown_coordinator.clone();

        tokio::spawn(async move {
            // first tick fires immediately
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("Job '{}' scheduled with interval {:?}", job_name, period);

            loop {
                tokio::select! {
                    // shutdown wins over an overdue tick
                    biased;

                    _ = shutdown_rx.recv() => {
                        info!("Job '{}' received internal shutdown signal", job_name);
                        break;
                    }
                    _ = wait_for_global_shutdown(coordinator_rx.clone()) => {
                        info!("Job '{}' received global shutdown signal", job_name);
                        break;
                    }
                    _ = ticker.tick() => {
                        info!("Executing job '{}'", job_name);

                        match job.execute().await {
                            Ok(result) => {
                                if result.success {
                                    info!("Job '{}' completed: {}", job_name, result.message);
                                } else {
                                    warn!("Job '{}' failed: {}", job_name, result.message);
                                }
                            }
                            Err(e) => {
                                error!("Job '{}' execution error: {}", job_name, e);
                            }
                        }
                    }
                }
            }

            info!("Job '{}' stopped", job_name);
        })
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the coordinator flags shutdown. Never resolves without one.
async fn wait_for_global_shutdown(rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = rx else {
        return std::future::pending().await;
    };

    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::AppError, jobs::JobResult};
    use async_trait::async_trait;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        running: Arc<AtomicUsize>,
        overlapped: Arc<AtomicUsize>,
        work: Duration,
    }

    impl CountingJob {
        fn new(work: Duration) -> Self {
            Self {
                runs: Arc::new(AtomicUsize::new(0)),
                running: Arc::new(AtomicUsize::new(0)),
                overlapped: Arc::new(AtomicUsize::new(0)),
                work,
            }
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn execute(&self) -> Result<JobResult, AppError> {
            if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(JobResult::success())
        }
    }

    #[tokio::test]
    async fn test_first_run_is_immediate_and_stop_halts() {
        let job = CountingJob::new(Duration::ZERO);
        let runs = job.runs.clone();
        let mut scheduler = JobScheduler::new();
        scheduler.start(vec![Arc::new(job)]).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(runs.load(Ordering::SeqCst) >= 1);

        scheduler.stop().await;
        let after_stop = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_runs_never_overlap() {
        // each run takes longer than the interval
        let job = CountingJob::new(Duration::from_millis(25));
        let runs = job.runs.clone();
        let overlapped = job.overlapped.clone();
        let mut scheduler = JobScheduler::new();
        scheduler.start(vec![Arc::new(job)]).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.stop().await;

        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_run_finish() {
        let job = CountingJob::new(Duration::from_millis(50));
        let runs = job.runs.clone();
        let mut scheduler = JobScheduler::new();
        scheduler.start(vec![Arc::new(job)]).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.stop().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_global_shutdown_stops_jobs() {
        let (tx, rx) = watch::channel(false);
        let job = CountingJob::new(Duration::ZERO);
        let runs = job.runs.clone();
        let mut scheduler = JobScheduler::with_shutdown_coordinator(rx);
        scheduler.start(vec![Arc::new(job)]).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_signal = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_signal);

        scheduler.stop().await;
    }
}
