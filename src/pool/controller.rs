//! Pool controller: load-balanced dispatch and child supervision.
//!
//! The controller owns a fixed set of workers and a supervisor thread.
//! Dispatch picks the least-loaded running worker and enqueues; the
//! supervisor polls wait status for every child and restarts dead
//! workers in place. A worker whose restart fails is evicted for good:
//! the pool shrinks and never grows back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{FpoolError, Result};
use crate::pool::message::Message;
use crate::pool::worker::{Callback, Completion, Worker, WorkerConfig};

/// Pool-level tunables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of worker processes forked at construction.
    pub workers: usize,
    /// How often the supervisor polls for dead children.
    pub supervisor_poll_interval: Duration,
    /// Tunables applied to every worker.
    pub worker: WorkerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            supervisor_poll_interval: Duration::from_millis(10),
            worker: WorkerConfig::default(),
        }
    }
}

/// Point-in-time pool diagnostics.
#[derive(Debug, Clone)]
pub struct ControllerStats {
    /// Number of workers currently in the pool.
    pub workers: usize,
    /// Total restarts across all workers.
    pub total_restarts: usize,
    /// Pending queue length per worker.
    pub queue_lens: Vec<usize>,
}

struct PoolShared {
    workers: Mutex<Vec<Worker>>,
    callback: Callback,
    need_exit: AtomicBool,
    config: ControllerConfig,
}

/// A fixed-size pool of forked workers behind one dispatch entry point.
pub struct Controller {
    shared: Arc<PoolShared>,
    supervisor: Option<JoinHandle<()>>,
}

impl Controller {
    /// Pool of `workers` children with default tunables.
    pub fn new(
        workers: usize,
        callback: impl Fn(&Message) -> Message + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::with_config(
            ControllerConfig {
                workers,
                ..ControllerConfig::default()
            },
            callback,
        )
    }

    /// Pool with explicit tunables. Any worker start failure is fatal to
    /// construction; already-started workers are torn down on the way
    /// out.
    pub fn with_config(
        config: ControllerConfig,
        callback: impl Fn(&Message) -> Message + Send + Sync + 'static,
    ) -> Result<Self> {
        let callback: Callback = Arc::new(callback);

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let mut worker = Worker::new(id, config.worker.clone());
            worker.start(callback.clone()).map_err(|err| {
                FpoolError::Worker(format!("worker {} failed to start: {}", id, err))
            })?;
            workers.push(worker);
        }
        info!(workers = config.workers, "worker pool started");

        let shared = Arc::new(PoolShared {
            workers: Mutex::new(workers),
            callback,
            need_exit: AtomicBool::new(false),
            config,
        });

        let supervisor = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("fpool-supervisor".to_string())
                .spawn(move || supervise(&shared))
                .map_err(FpoolError::Io)?
        };

        Ok(Self {
            shared,
            supervisor: Some(supervisor),
        })
    }

    /// Queue `msg` on the least-loaded running worker; ties go to the
    /// first-encountered.
    ///
    /// Never blocks. With no running worker left, the completion fires
    /// synchronously with a header-only `-ENOENT` reply: there is no
    /// destination the message could wait for.
    pub fn schedule(&self, msg: Message, complete: Completion) {
        let workers = self.shared.workers.lock().expect("pool lock poisoned");

        let mut target: Option<(&Worker, usize)> = None;
        for worker in workers.iter().filter(|w| w.is_running()) {
            let len = worker.queue_len();
            match target {
                Some((_, best)) if len >= best => {}
                _ => target = Some((worker, len)),
            }
        }

        match target {
            Some((worker, _)) => worker.queue(msg, complete),
            None => {
                debug!(id = msg.header.id, "no live workers, failing schedule");
                let mut reply = Message::copy_header(&msg);
                reply.header.status = FpoolError::NotRunning.status();
                complete(reply);
            }
        }
    }

    /// Snapshot of current child pids.
    pub fn pids(&self) -> Vec<Pid> {
        self.shared
            .workers
            .lock()
            .expect("pool lock poisoned")
            .iter()
            .filter_map(|worker| worker.pid())
            .collect()
    }

    /// Snapshot of pool diagnostics.
    pub fn stats(&self) -> ControllerStats {
        let workers = self.shared.workers.lock().expect("pool lock poisoned");
        ControllerStats {
            workers: workers.len(),
            total_restarts: workers.iter().map(|worker| worker.restarts()).sum(),
            queue_lens: workers.iter().map(|worker| worker.queue_len()).collect(),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shared.need_exit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }

        let mut workers = self.shared.workers.lock().expect("pool lock poisoned");
        for worker in workers.iter_mut() {
            worker.stop();
        }
        // Worker teardown fires any leftover completions.
        workers.clear();
    }
}

/// Supervisor loop: reap dead children and restart their workers in
/// place.
///
/// Per-child non-blocking waits keep this from ever reaping children
/// owned by other code in the same process.
fn supervise(shared: &PoolShared) {
    debug!("supervisor started");
    while !shared.need_exit.load(Ordering::SeqCst) {
        thread::sleep(shared.config.supervisor_poll_interval);

        let mut workers = shared.workers.lock().expect("pool lock poisoned");
        let mut evicted = Vec::new();
        for (slot, worker) in workers.iter_mut().enumerate() {
            let Some(reason) = worker.try_wait() else {
                continue;
            };

            info!(slot, reason = %reason, "child terminated, restarting worker");
            worker.close();
            worker.bump_restarts();
            if let Err(err) = worker.start(shared.callback.clone()) {
                warn!(slot, error = %err, "restart failed, evicting worker");
                evicted.push(slot);
            }
        }
        for slot in evicted.into_iter().rev() {
            workers.remove(slot);
        }
    }
    debug!("supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::sync::mpsc;

    fn echo(request: &Message) -> Message {
        let mut reply = Message::copy_header(request);
        reply.header.cmd = request.header.cmd + 1;
        reply
    }

    #[test]
    fn test_config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.supervisor_poll_interval, Duration::from_millis(10));
        assert_eq!(config.worker.io_step_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_pool_forks_distinct_children() {
        let ctl = Controller::new(2, echo).unwrap();
        let pids = ctl.pids();
        assert_eq!(pids.len(), 2);
        assert_ne!(pids[0], pids[1]);

        let stats = ctl.stats();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.total_restarts, 0);
        assert_eq!(stats.queue_lens.len(), 2);
    }

    #[test]
    fn test_empty_pool_fails_schedule_synchronously() {
        let ctl = Controller::new(0, echo).unwrap();
        assert!(ctl.pids().is_empty());

        let (tx, rx) = mpsc::channel();
        let mut msg = Message::new();
        msg.header.id = 11;
        msg.header.cmd = 5;
        ctl.schedule(
            msg,
            Box::new(move |reply| {
                tx.send(reply).unwrap();
            }),
        );

        // The completion must already have fired by the time schedule
        // returned.
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.header.status, -(Errno::ENOENT as i32));
        assert_eq!(reply.header.id, 11);
        assert_eq!(reply.header.cmd, 5);
        assert_eq!(reply.header.size, 0);
    }
}
