use super::job::Job;
use super::worker::Worker;
use super::{HostShared, Tier};
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Upper bound on an idle worker's sleep, in case a wakeup is ever missed.
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) enum MainMessage {
    Run(Job),
    Stop,
}

/// Tier queues and the wakeup machinery shared by every worker.
///
/// Pooled tiers are plain FIFO injectors; workers drain them in tier order.
/// `Main` has a channel of its own feeding the single main thread.
pub(crate) struct Pool {
    tiers: [Injector<Job>; Tier::POOLED_COUNT],
    main_tx: Sender<MainMessage>,
    main_rx: Receiver<MainMessage>,
    main_thread: OnceLock<ThreadId>,
    pending: AtomicUsize,
    idle: Mutex<usize>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    num_threads: usize,
}

impl Pool {
    pub(crate) fn new(num_threads: usize) -> Self {
        let (main_tx, main_rx) = unbounded();
        Self {
            tiers: Default::default(),
            main_tx,
            main_rx,
            main_thread: OnceLock::new(),
            pending: AtomicUsize::new(0),
            idle: Mutex::new(0),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            num_threads,
        }
    }

    pub(crate) fn push(&self, tier: Tier, job: Job) {
        let Some(index) = tier.pool_index() else {
            let _ = self.main_tx.send(MainMessage::Run(job));
            return;
        };

        self.pending.fetch_add(1, Ordering::Release);
        self.tiers[index].push(job);

        let idle = self.idle.lock();
        if *idle > 0 {
            self.wakeup.notify_one();
        }
    }

    /// Highest tier first.
    pub(crate) fn find_job(&self) -> Option<Job> {
        for injector in &self.tiers {
            loop {
                match injector.steal() {
                    Steal::Success(job) => {
                        self.pending.fetch_sub(1, Ordering::AcqRel);
                        return Some(job);
                    }
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    /// Blocks an idle worker until a push or shutdown wakes it.
    pub(crate) fn sleep(&self) {
        let mut idle = self.idle.lock();
        if self.pending.load(Ordering::Acquire) > 0 || self.is_shutdown() {
            return;
        }
        *idle += 1;
        self.wakeup.wait_for(&mut idle, IDLE_TIMEOUT);
        *idle -= 1;
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn is_main_thread(&self) -> bool {
        self.main_thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.main_tx.send(MainMessage::Stop);
        let _idle = self.idle.lock();
        self.wakeup.notify_all();
    }

    /// Drops every queued job. Only called once all host threads are gone.
    pub(crate) fn clear(&self) {
        while self.find_job().is_some() {}
        while self.main_rx.try_recv().is_ok() {}
    }
}

/// Spawns the pool workers and the main-tier thread.
pub(crate) fn spawn_threads(shared: &Arc<HostShared>) -> Result<Vec<JoinHandle<()>>> {
    let config = &shared.config;
    let mut handles = Vec::with_capacity(shared.pool.num_threads() + 1);

    for id in 0..shared.pool.num_threads() {
        let worker = Worker::new(id);
        let shared_clone = shared.clone();
        let name = format!("{}-worker-{}", config.thread_name_prefix, id);

        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder
            .spawn(move || worker.run(&shared_clone))
            .map_err(|e| Error::spawn(format!("worker {}: {}", id, e)))?;
        handles.push(handle);
    }

    let shared_clone = shared.clone();
    let mut builder = thread::Builder::new().name(format!("{}-main", config.thread_name_prefix));
    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }
    let main = builder
        .spawn(move || run_main(&shared_clone))
        .map_err(|e| Error::spawn(format!("main thread: {}", e)))?;

    let _ = shared.pool.main_thread.set(main.thread().id());
    handles.push(main);

    Ok(handles)
}

fn run_main(shared: &HostShared) {
    let pool = &shared.pool;
    // The spawner records the id too; whoever wins, it is this thread's id.
    let _ = pool.main_thread.set(thread::current().id());

    while let Ok(message) = pool.main_rx.recv() {
        match message {
            MainMessage::Run(job) => {
                shared.panic_handler.run(job);
            }
            MainMessage::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_job_prefers_higher_tiers() {
        let pool = Pool::new(1);
        let (tx, rx) = unbounded();

        for tier in [Tier::Background, Tier::Utility, Tier::UserInteractive] {
            let tx = tx.clone();
            pool.push(tier, Job::new(move || tx.send(tier).unwrap()));
        }
        assert_eq!(pool.pending(), 3);

        while let Some(job) = pool.find_job() {
            job.run();
        }

        let order: Vec<Tier> = rx.try_iter().collect();
        assert_eq!(
            order,
            vec![Tier::UserInteractive, Tier::Utility, Tier::Background]
        );
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_sleep_returns_when_work_pending() {
        let pool = Pool::new(1);
        pool.push(Tier::Default, Job::new(|| {}));

        let start = std::time::Instant::now();
        pool.sleep();
        assert!(start.elapsed() < IDLE_TIMEOUT);
    }

    #[test]
    fn test_main_jobs_bypass_pooled_tiers() {
        let pool = Pool::new(1);
        pool.push(Tier::Main, Job::new(|| {}));

        assert!(pool.find_job().is_none());
        assert_eq!(pool.pending(), 0);
        assert!(matches!(pool.main_rx.try_recv(), Ok(MainMessage::Run(_))));
    }
}
