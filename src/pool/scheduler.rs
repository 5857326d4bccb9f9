//! Readiness scheduling for one descriptor, one direction.
//!
//! An [`IoScheduler`] registers a descriptor for a single event direction
//! on an epoll instance at construction and deregisters it on drop, so
//! registration lifetime matches the transfer phase it serves.

use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::{FpoolError, Result};

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The requested direction is ready.
    Ready,
    /// The timeout elapsed with no event.
    TimedOut,
}

/// One descriptor registered for one direction on an epoll instance.
pub struct IoScheduler<'a> {
    epoll: &'a Epoll,
    fd: BorrowedFd<'a>,
    interest: EpollFlags,
}

impl<'a> IoScheduler<'a> {
    /// Register `fd` for `interest` on `epoll`.
    pub fn new(epoll: &'a Epoll, fd: BorrowedFd<'a>, interest: EpollFlags) -> Result<Self> {
        let event = EpollEvent::new(interest, fd.as_raw_fd() as u64);
        epoll.add(fd, event)?;
        Ok(Self {
            epoll,
            fd,
            interest,
        })
    }

    /// Wait until the descriptor is ready for the registered direction.
    ///
    /// `None` waits indefinitely. Interrupted waits are retried against
    /// the same deadline and never surfaced. A hangup or error condition
    /// without the requested direction is fatal ([`FpoolError::ChannelClosed`]);
    /// spurious wakeups that exhaust the budget surface as
    /// [`FpoolError::TimedOut`].
    pub fn ready(&self, timeout: Option<Duration>) -> Result<Readiness> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = [EpollEvent::empty(); 1];

        loop {
            let wait_for = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let millis = remaining.as_millis().min(u128::from(u16::MAX)) as u16;
                    EpollTimeout::from(millis)
                }
                None => EpollTimeout::NONE,
            };

            let nfds = match self.epoll.wait(&mut events, wait_for) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            };
            if nfds == 0 {
                return Ok(Readiness::TimedOut);
            }

            let got = events[0].events();
            if got.intersects(self.interest) {
                return Ok(Readiness::Ready);
            }
            if got.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                return Err(FpoolError::ChannelClosed);
            }

            // Spurious wakeup: re-check the remaining budget before the
            // next wait.
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(FpoolError::TimedOut);
            }
        }
    }
}

impl Drop for IoScheduler<'_> {
    fn drop(&mut self) {
        let _ = self.epoll.delete(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::epoll::EpollCreateFlags;
    use nix::sys::socket::{AddressFamily, MsgFlags, SockFlag, SockType, send, socketpair};
    use std::os::unix::io::{AsFd, OwnedFd};

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    #[test]
    fn test_write_direction_ready_immediately() {
        let (a, _b) = pair();
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).unwrap();
        let scheduler = IoScheduler::new(&epoll, a.as_fd(), EpollFlags::EPOLLOUT).unwrap();
        assert_eq!(
            scheduler.ready(Some(Duration::from_millis(100))).unwrap(),
            Readiness::Ready
        );
    }

    #[test]
    fn test_read_direction_times_out_when_idle() {
        let (a, _b) = pair();
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).unwrap();
        let scheduler = IoScheduler::new(&epoll, a.as_fd(), EpollFlags::EPOLLIN).unwrap();
        assert_eq!(
            scheduler.ready(Some(Duration::from_millis(20))).unwrap(),
            Readiness::TimedOut
        );
    }

    #[test]
    fn test_read_direction_ready_after_peer_write() {
        let (a, b) = pair();
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).unwrap();
        let scheduler = IoScheduler::new(&epoll, a.as_fd(), EpollFlags::EPOLLIN).unwrap();

        send(b.as_raw_fd(), b"x", MsgFlags::empty()).unwrap();
        assert_eq!(
            scheduler.ready(Some(Duration::from_millis(100))).unwrap(),
            Readiness::Ready
        );
    }

    #[test]
    fn test_registration_released_on_drop() {
        let (a, _b) = pair();
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).unwrap();
        {
            let _scheduler = IoScheduler::new(&epoll, a.as_fd(), EpollFlags::EPOLLOUT).unwrap();
        }
        // A second registration of the same fd would fail with EEXIST if
        // drop had not removed the first.
        let scheduler = IoScheduler::new(&epoll, a.as_fd(), EpollFlags::EPOLLOUT).unwrap();
        assert_eq!(
            scheduler.ready(Some(Duration::from_millis(100))).unwrap(),
            Readiness::Ready
        );
    }
}
