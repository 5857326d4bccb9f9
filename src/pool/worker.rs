//! A single pool worker: one forked child plus the parent-side IO thread.
//!
//! The child runs a synchronous request/reply loop over its end of a
//! `socketpair(2)` channel. The parent-side IO thread drains the worker's
//! private FIFO against the other end, one message at a time: a new
//! request is never started before the previous reply has been read to
//! completion, so the child handles at most one in-flight request.

use std::collections::VecDeque;
use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollFlags};
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, setsid};
use tracing::{debug, trace, warn};

use crate::error::{FpoolError, Result};
use crate::pool::message::Message;
use crate::pool::scheduler::{IoScheduler, Readiness};
use crate::pool::signals::{TerminationReason, analyze_wait_status};

/// Processing function invoked in the child, once per request.
pub type Callback = Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// Invoked exactly once per scheduled message with its outcome.
pub type Completion = Box<dyn FnOnce(Message) + Send>;

/// Interval between non-blocking wait polls while stopping a child.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-worker tunables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bound on a single readiness wait in the parent's IO loop.
    pub io_step_timeout: Duration,
    /// Empty-queue sleep before the IO thread re-checks the exit flag.
    pub queue_poll_interval: Duration,
    /// SIGTERM grace period before escalating to SIGKILL.
    pub stop_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            io_step_timeout: Duration::from_millis(100),
            queue_poll_interval: Duration::from_millis(100),
            stop_grace: Duration::from_millis(500),
        }
    }
}

/// Worker run state, advanced by start/stop and by the IO thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    New = 0,
    Running = 1,
    /// Channel broken; waiting for the supervisor to restart the worker.
    Failed = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Failed,
            3 => Self::Stopped,
            _ => Self::New,
        }
    }
}

/// State shared between the worker handle and its IO thread.
///
/// The pending queue deliberately outlives a single child: messages
/// queued but not yet transferred when a child dies are drained by the IO
/// thread of the restarted worker.
struct Shared {
    queue: Mutex<VecDeque<(Message, Completion)>>,
    available: Condvar,
    need_exit: AtomicBool,
    state: AtomicU8,
}

/// One forked child process and the parent-side machinery driving it.
pub struct Worker {
    id: usize,
    config: WorkerConfig,
    shared: Arc<Shared>,
    fd: Option<Arc<OwnedFd>>,
    epoll: Option<Arc<Epoll>>,
    pid: Option<Pid>,
    io_thread: Option<JoinHandle<()>>,
    restarts: usize,
}

impl Worker {
    pub fn new(id: usize, config: WorkerConfig) -> Self {
        Self {
            id,
            config,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                need_exit: AtomicBool::new(false),
                state: AtomicU8::new(WorkerState::New as u8),
            }),
            fd: None,
            epoll: None,
            pid: None,
            io_thread: None,
            restarts: 0,
        }
    }

    /// Fork the child and spawn the IO thread.
    ///
    /// Channel, fork or epoll setup failures are fatal for this worker
    /// and are not retried here.
    pub fn start(&mut self, callback: Callback) -> Result<()> {
        let (parent_fd, child_fd) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        // The child arm never returns: running destructors of
        // parent-owned state in the child would tear down shared
        // resources twice.
        match unsafe { fork() }? {
            ForkResult::Child => {
                drop(parent_fd);
                child_main(child_fd, callback);
            }
            ForkResult::Parent { child } => {
                drop(child_fd);
                let epoll = match Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC) {
                    Ok(epoll) => epoll,
                    Err(errno) => {
                        let _ = signal::kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        return Err(errno.into());
                    }
                };

                let fd = Arc::new(parent_fd);
                let epoll = Arc::new(epoll);
                self.shared.need_exit.store(false, Ordering::SeqCst);
                self.shared
                    .state
                    .store(WorkerState::Running as u8, Ordering::SeqCst);

                let shared = self.shared.clone();
                let thread_fd = fd.clone();
                let thread_epoll = epoll.clone();
                let config = self.config.clone();
                let id = self.id;
                let handle = thread::Builder::new()
                    .name(format!("fpool-io-{id}"))
                    .spawn(move || io_loop(id, &config, &shared, &thread_fd, &thread_epoll));
                let handle = match handle {
                    Ok(handle) => handle,
                    Err(err) => {
                        let _ = signal::kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        self.shared
                            .state
                            .store(WorkerState::Stopped as u8, Ordering::SeqCst);
                        return Err(FpoolError::Io(err));
                    }
                };

                self.pid = Some(child);
                self.fd = Some(fd);
                self.epoll = Some(epoll);
                self.io_thread = Some(handle);

                debug!(worker_id = self.id, pid = child.as_raw(), "worker started");
                Ok(())
            }
        }
    }

    /// Stop the worker and start it again with `callback`.
    ///
    /// A child that is already gone ("no such process") is not an error.
    pub fn restart(&mut self, callback: Callback) -> Result<()> {
        let status = self.stop();
        trace!(worker_id = self.id, status = ?status, "worker stopped for restart");
        self.restarts += 1;
        self.start(callback)
    }

    /// Stop the child and join the IO thread. Idempotent.
    ///
    /// SIGTERM first, then non-blocking wait polls over the configured
    /// grace period, then SIGKILL plus a blocking wait. Returns the wait
    /// status when one was collected here.
    pub fn stop(&mut self) -> Option<WaitStatus> {
        self.shared.need_exit.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();

        let mut collected = None;
        if let Some(pid) = self.pid.take() {
            match signal::kill(pid, Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => {
                    warn!(worker_id = self.id, pid = pid.as_raw(), error = %errno, "SIGTERM failed");
                }
            }

            let attempts =
                (self.config.stop_grace.as_millis() / STOP_POLL_INTERVAL.as_millis()).max(1);
            let mut still_alive = true;
            for _ in 0..attempts {
                match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => thread::sleep(STOP_POLL_INTERVAL),
                    Ok(status) => {
                        collected = Some(status);
                        still_alive = false;
                        break;
                    }
                    // Already reaped elsewhere (ECHILD) or otherwise gone.
                    Err(_) => {
                        still_alive = false;
                        break;
                    }
                }
            }
            if still_alive {
                warn!(
                    worker_id = self.id,
                    pid = pid.as_raw(),
                    "child ignored SIGTERM, escalating to SIGKILL"
                );
                let _ = signal::kill(pid, Signal::SIGKILL);
                if let Ok(status) = waitpid(pid, None) {
                    collected = Some(status);
                }
            }
        }

        self.close();
        collected
    }

    /// Release parent-side resources without signalling the child.
    ///
    /// Used directly by the supervisor after it has already reaped the
    /// process.
    pub(crate) fn close(&mut self) {
        self.shared.need_exit.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
        self.fd = None;
        self.epoll = None;
        self.shared
            .state
            .store(WorkerState::Stopped as u8, Ordering::SeqCst);
    }

    /// Thread-safe append to the pending FIFO; wakes the IO thread.
    pub fn queue(&self, msg: Message, complete: Completion) {
        let mut queue = self.shared.queue.lock().expect("worker queue poisoned");
        queue.push_back((msg, complete));
        self.shared.available.notify_one();
    }

    /// Number of pending (not yet completed) messages.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().expect("worker queue poisoned").len()
    }

    /// Pid of the current child, if one is running.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// How many times this worker has been restarted.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub(crate) fn bump_restarts(&mut self) {
        self.restarts += 1;
    }

    /// Non-blocking wait for the child. On a terminal status the child is
    /// considered reaped and its pid is forgotten.
    pub(crate) fn try_wait(&mut self) -> Option<TerminationReason> {
        let pid = self.pid?;
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => {
                self.pid = None;
                Some(analyze_wait_status(status))
            }
            Err(_) => {
                self.pid = None;
                Some(TerminationReason::Unknown)
            }
        }
    }

    /// Complete every queued message with a header-only reply carrying
    /// `status`. Used at eviction and final teardown so that no accepted
    /// message is silently dropped.
    pub(crate) fn drain_pending(&mut self, status: i32) {
        let drained: Vec<_> = {
            let mut queue = self.shared.queue.lock().expect("worker queue poisoned");
            queue.drain(..).collect()
        };
        for (msg, complete) in drained {
            let mut reply = Message::copy_header(&msg);
            reply.header.status = status;
            complete(reply);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.pid.is_some() || self.io_thread.is_some() {
            self.stop();
        }
        self.drain_pending(FpoolError::Cancelled.status());
    }
}

/// Parent-side IO loop: drains the pending FIFO against the channel.
fn io_loop(id: usize, config: &WorkerConfig, shared: &Shared, fd: &OwnedFd, epoll: &Epoll) {
    loop {
        let (mut msg, complete) = {
            let mut queue = shared.queue.lock().expect("worker queue poisoned");
            loop {
                if shared.need_exit.load(Ordering::SeqCst) {
                    // Queued messages stay for the restarted worker.
                    return;
                }
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                let (guard, _) = shared
                    .available
                    .wait_timeout(queue, config.queue_poll_interval)
                    .expect("worker queue poisoned");
                queue = guard;
            }
        };

        match exchange(config, shared, fd, epoll, &mut msg) {
            Ok(reply) => {
                trace!(
                    worker_id = id,
                    id = reply.header.id,
                    cmd = reply.header.cmd,
                    "request completed"
                );
                complete(reply);
            }
            Err(err) => {
                let status = err.status();
                warn!(
                    worker_id = id,
                    id = msg.header.id,
                    status,
                    error = %err,
                    "channel IO failed"
                );
                shared
                    .state
                    .store(WorkerState::Failed as u8, Ordering::SeqCst);
                let mut reply = Message::copy_header(&msg);
                reply.header.status = status;
                complete(reply);
                // The channel is broken. The supervisor owns process-death
                // detection and will restart this worker; nothing to drive
                // here until then.
                return;
            }
        }
    }
}

/// Write one request and read its reply, resuming partial transfers on
/// every readiness event.
fn exchange(
    config: &WorkerConfig,
    shared: &Shared,
    fd: &OwnedFd,
    epoll: &Epoll,
    msg: &mut Message,
) -> Result<Message> {
    {
        let scheduler = IoScheduler::new(epoll, fd.as_fd(), EpollFlags::EPOLLOUT)?;
        drive_write(
            &scheduler,
            fd,
            msg,
            Some(&shared.need_exit),
            Some(config.io_step_timeout),
        )?;
    }

    let mut reply = Message::new();
    let scheduler = IoScheduler::new(epoll, fd.as_fd(), EpollFlags::EPOLLIN)?;
    drive_read(
        &scheduler,
        fd,
        &mut reply,
        Some(&shared.need_exit),
        Some(config.io_step_timeout),
    )?;
    Ok(reply)
}

/// Drive an outbound message to completion.
///
/// With an exit flag the readiness waits are bounded by `step_timeout`
/// and the flag is re-checked between steps; without one (child loop)
/// the wait is indefinite.
fn drive_write(
    scheduler: &IoScheduler<'_>,
    fd: &OwnedFd,
    msg: &mut Message,
    exit: Option<&AtomicBool>,
    step_timeout: Option<Duration>,
) -> Result<()> {
    while !msg.io_completed() {
        if exit.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(FpoolError::Cancelled);
        }
        match scheduler.ready(step_timeout)? {
            Readiness::Ready => {
                msg.write_some(fd)?;
            }
            Readiness::TimedOut => {}
        }
    }
    Ok(())
}

/// Drive an inbound message to completion. See [`drive_write`] for the
/// timeout contract.
fn drive_read(
    scheduler: &IoScheduler<'_>,
    fd: &OwnedFd,
    msg: &mut Message,
    exit: Option<&AtomicBool>,
    step_timeout: Option<Duration>,
) -> Result<()> {
    while !msg.io_completed() {
        if exit.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(FpoolError::Cancelled);
        }
        match scheduler.ready(step_timeout)? {
            Readiness::Ready => {
                msg.read_some(fd)?;
            }
            Readiness::TimedOut => {}
        }
    }
    Ok(())
}

/// Child process entry: request/reply loop until EOF or a fatal error.
///
/// Never returns. Exits 0 on a graceful stop (parent closed the channel
/// at a message boundary) or with the negative status of the first fatal
/// IO error, truncated by the OS to its low byte.
fn child_main(fd: OwnedFd, callback: Callback) -> ! {
    let _ = setsid();

    // The embedding process may block termination signals; the child must
    // die by default on them.
    let mut termination = SigSet::empty();
    termination.add(Signal::SIGTERM);
    termination.add(Signal::SIGINT);
    termination.add(Signal::SIGQUIT);
    let _ = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&termination), None);

    // Write failures must surface as EPIPE, not kill the child silently.
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    let code = match child_loop(&fd, callback.as_ref()) {
        Ok(()) => 0,
        Err(err) => err.status(),
    };
    std::process::exit(code);
}

fn child_loop(fd: &OwnedFd, callback: &dyn Fn(&Message) -> Message) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;

    loop {
        let mut request = Message::new();
        {
            let scheduler = IoScheduler::new(&epoll, fd.as_fd(), EpollFlags::EPOLLIN)?;
            match drive_read(&scheduler, fd, &mut request, None, None) {
                Ok(()) => {}
                // EOF between messages is the stop request.
                Err(FpoolError::ChannelClosed) if request.transferred() == 0 => return Ok(()),
                Err(err) => return Err(err),
            }
        }

        let mut reply = callback(&request);

        let scheduler = IoScheduler::new(&epoll, fd.as_fd(), EpollFlags::EPOLLOUT)?;
        drive_write(&scheduler, fd, &mut reply, None, None)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn echo() -> Callback {
        Arc::new(|request: &Message| {
            let payload = request.data();
            let mut reply = Message::with_size(payload.len() as u64);
            reply.header.id = request.header.id;
            reply.header.cmd = request.header.cmd + 1;
            reply.data_mut().copy_from_slice(payload);
            reply
        })
    }

    #[test]
    fn test_worker_roundtrip() {
        let mut worker = Worker::new(0, WorkerConfig::default());
        worker.start(echo()).unwrap();
        assert!(worker.is_running());
        assert!(worker.pid().is_some());

        let mut msg = Message::with_size(5);
        msg.header.id = 7;
        msg.header.cmd = 1;
        msg.data_mut().copy_from_slice(b"hello");

        let (tx, rx) = mpsc::channel();
        worker.queue(
            msg,
            Box::new(move |reply| {
                tx.send(reply).unwrap();
            }),
        );

        let reply = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(reply.header.status, 0);
        assert_eq!(reply.header.id, 7);
        assert_eq!(reply.header.cmd, 2);
        assert_eq!(reply.data(), b"hello");

        let status = worker.stop();
        assert!(!worker.is_running());
        assert!(status.is_some());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut worker = Worker::new(1, WorkerConfig::default());
        worker.start(echo()).unwrap();
        worker.stop();
        assert!(worker.stop().is_none());
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_restart_changes_pid() {
        let mut worker = Worker::new(2, WorkerConfig::default());
        worker.start(echo()).unwrap();
        let first = worker.pid().unwrap();

        worker.restart(echo()).unwrap();
        let second = worker.pid().unwrap();
        assert_ne!(first, second);
        assert_eq!(worker.restarts(), 1);
        assert!(worker.is_running());

        worker.stop();
    }

    #[test]
    fn test_queue_len_counts_pending() {
        let worker = Worker::new(3, WorkerConfig::default());
        // Never started: messages accumulate without being drained.
        assert_eq!(worker.queue_len(), 0);
        let (tx, _rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            worker.queue(
                Message::new(),
                Box::new(move |reply| {
                    let _ = tx.send(reply);
                }),
            );
        }
        assert_eq!(worker.queue_len(), 3);
    }

    #[test]
    fn test_drop_fails_pending_messages() {
        let (tx, rx) = mpsc::channel();
        {
            let worker = Worker::new(4, WorkerConfig::default());
            let tx = tx.clone();
            worker.queue(
                Message::new(),
                Box::new(move |reply| {
                    let _ = tx.send(reply);
                }),
            );
        }
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.header.status, FpoolError::Cancelled.status());
        assert_eq!(reply.header.size, 0);
    }
}
