//! Elastic pool of request workers.
//!
//! Connections push decoded frames onto one shared queue. Workers pull from it,
//! and a scheduler task admits new workers, grows the pool when requests pile
//! up and lets idle workers go while the pool stays above its floor.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;

use crate::config::TransportConfig;
use crate::error::{Error, Result};

/// Turns one request frame into its reply frame.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, frame: Vec<u8>) -> Vec<u8>;
}

struct Job {
    frame: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

enum Control {
    Register {
        worker: usize,
        granted: oneshot::Sender<bool>,
    },
    Shutdown {
        worker: usize,
        granted: oneshot::Sender<bool>,
    },
    Exited {
        worker: usize,
    },
}

#[derive(Debug, Clone)]
struct PoolSettings {
    min: usize,
    max: usize,
    incr: usize,
    idle_timeout: Duration,
    scheduler_interval: Duration,
    poll_interval: Duration,
}

impl From<&TransportConfig> for PoolSettings {
    fn from(config: &TransportConfig) -> Self {
        PoolSettings {
            min: config.min_workers,
            max: config.max_workers.max(config.min_workers),
            incr: config.incr_workers.max(1),
            idle_timeout: config.worker_idle_timeout,
            scheduler_interval: config.scheduler_interval,
            poll_interval: config.poll_interval,
        }
    }
}

struct Shared {
    settings: PoolSettings,
    handler: Arc<dyn RequestHandler>,
    jobs: Receiver<Job>,
    control: mpsc::UnboundedSender<Control>,
    stop: watch::Receiver<bool>,
    /// Requests submitted and not answered yet.
    active: AtomicUsize,
    /// Workers admitted by the scheduler.
    workers: AtomicUsize,
    next_worker: AtomicUsize,
}

impl Shared {
    async fn ask(&self, msg: impl FnOnce(oneshot::Sender<bool>) -> Control) -> bool {
        let (granted, answer) = oneshot::channel();
        if self.control.send(msg(granted)).is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    jobs: Sender<Job>,
    stop: watch::Sender<bool>,
}

impl WorkerPool {
    /// Starts the scheduler and the initial `min_workers` workers. Must be
    /// called from within a tokio runtime.
    pub fn start(config: &TransportConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let (jobs_tx, jobs_rx) = async_channel::unbounded();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            settings: PoolSettings::from(config),
            handler,
            jobs: jobs_rx,
            control: control_tx,
            stop: stop_rx,
            active: AtomicUsize::new(0),
            workers: AtomicUsize::new(0),
            next_worker: AtomicUsize::new(0),
        });

        tokio::spawn(schedule(Arc::clone(&shared), control_rx));

        WorkerPool {
            shared,
            jobs: jobs_tx,
            stop: stop_tx,
        }
    }

    /// Queues a request frame and waits for a worker to answer it.
    pub async fn submit(&self, frame: Vec<u8>) -> Result<Vec<u8>> {
        let _active = ActiveGuard::new(&self.shared.active);
        let (reply, answer) = oneshot::channel();
        self.jobs
            .send(Job { frame, reply })
            .await
            .map_err(|_| Error::Internal("worker pool is shut down".into()))?;
        answer
            .await
            .map_err(|_| Error::Internal("request dropped by worker".into()))
    }

    pub fn workers(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    pub fn active_requests(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Stops the scheduler and every worker. Queued requests are dropped.
    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
        self.jobs.close();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_workers(shared: &Arc<Shared>, count: usize) {
    for _ in 0..count {
        let worker = shared.next_worker.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_worker(Arc::clone(shared), worker));
    }
}

async fn schedule(shared: Arc<Shared>, mut control: mpsc::UnboundedReceiver<Control>) {
    let settings = shared.settings.clone();
    let mut stop = shared.stop.clone();
    let mut workers = HashSet::new();

    spawn_workers(&shared, settings.min);

    let mut ticker = time::interval(settings.scheduler_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            Some(msg) = control.recv() => match msg {
                Control::Register { worker, granted } => {
                    let admitted = workers.len() < settings.max;
                    if admitted {
                        workers.insert(worker);
                    }
                    let _ = granted.send(admitted);
                }
                Control::Shutdown { worker, granted } => {
                    let allowed = workers.len() > settings.min && workers.remove(&worker);
                    let _ = granted.send(allowed);
                }
                Control::Exited { worker } => {
                    workers.remove(&worker);
                }
            },
            _ = ticker.tick() => {
                let active = shared.active.load(Ordering::SeqCst);
                if active > 3 * workers.len() && workers.len() < settings.max {
                    let count = settings.incr.min(settings.max - workers.len());
                    info!(
                        "{} requests in flight for {} workers, spawning {} more",
                        active,
                        workers.len(),
                        count
                    );
                    spawn_workers(&shared, count);
                }
            }
            _ = stop.changed() => break,
        }
        shared.workers.store(workers.len(), Ordering::SeqCst);
    }

    shared.workers.store(0, Ordering::SeqCst);
    debug!("worker scheduler stopped");
}

async fn run_worker(shared: Arc<Shared>, worker: usize) {
    let admitted = shared
        .ask(|granted| Control::Register { worker, granted })
        .await;
    if !admitted {
        debug!("worker {} not admitted, pool is full", worker);
        return;
    }

    let mut last_active = Instant::now();
    loop {
        match time::timeout(shared.settings.poll_interval, shared.jobs.recv()).await {
            Ok(Ok(job)) => {
                let reply = shared.handler.handle(job.frame).await;
                let _ = job.reply.send(reply);
                last_active = Instant::now();
            }
            // queue closed
            Ok(Err(_)) => break,
            Err(_) => {}
        }

        if shared.stopped() {
            break;
        }

        if last_active.elapsed() >= shared.settings.idle_timeout {
            let allowed = shared
                .ask(|granted| Control::Shutdown { worker, granted })
                .await;
            if allowed {
                debug!("worker {} idle, shutting down", worker);
                return;
            }
            last_active = Instant::now();
        }
    }

    let _ = shared.control.send(Control::Exited { worker });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, frame: Vec<u8>) -> Vec<u8> {
            frame
        }
    }

    /// Blocks every request until permits are added to the gate.
    struct Gated {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl RequestHandler for Gated {
        async fn handle(&self, frame: Vec<u8>) -> Vec<u8> {
            let _permit = self.gate.acquire().await;
            frame
        }
    }

    fn config() -> TransportConfig {
        TransportConfig::new("127.0.0.1:0")
            .with_workers(2, 8, 2)
            .with_worker_idle_timeout(Duration::from_millis(30))
            .with_scheduler_interval(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn wait_for(pool: &WorkerPool, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if pool.workers() == expected {
                return true;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn idle_pool_stays_at_floor() {
        let pool = WorkerPool::start(&config(), Arc::new(Echo));
        assert!(wait_for(&pool, 2).await);

        assert_eq!(pool.submit(vec![1, 2, 3]).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(pool.active_requests(), 0);

        // several idle timeouts pass, every shutdown request is refused
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.workers(), 2);
    }

    #[tokio::test]
    async fn backlog_grows_pool_up_to_max_then_shrinks() {
        let gate = Arc::new(Semaphore::new(0));
        let pool = Arc::new(WorkerPool::start(
            &config(),
            Arc::new(Gated {
                gate: Arc::clone(&gate),
            }),
        ));
        assert!(wait_for(&pool, 2).await);

        let mut pending = Vec::new();
        for i in 0..40u8 {
            let pool = Arc::clone(&pool);
            pending.push(tokio::spawn(async move { pool.submit(vec![i]).await }));
        }

        assert!(wait_for(&pool, 8).await);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.workers(), 8);
        assert_eq!(pool.active_requests(), 40);

        gate.add_permits(1);
        for (i, handle) in pending.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), vec![i as u8]);
        }
        assert_eq!(pool.active_requests(), 0);

        assert!(wait_for(&pool, 2).await);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.workers(), 2);
    }

    #[tokio::test]
    async fn submit_fails_after_shutdown() {
        let pool = WorkerPool::start(&config(), Arc::new(Echo));
        pool.shutdown();
        assert!(pool.submit(vec![1]).await.is_err());
        assert_eq!(pool.active_requests(), 0);
    }
}
