//! Termination analysis for reaped worker children.
//!
//! Classifies a child's wait status so the supervisor can log why a
//! worker died before restarting it.

use std::fmt;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal; the flag records whether a core was dumped.
    Signaled(Signal, bool),
    /// SIGKILL without our involvement, most likely the kernel OOM killer.
    OutOfMemory,
    /// Process has not terminated.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(signal, true) => {
                write!(f, "killed by signal {:?} (core dumped)", signal)
            }
            Self::Signaled(signal, false) => write!(f, "killed by signal {:?}", signal),
            Self::OutOfMemory => write!(f, "killed by SIGKILL (likely OOM killer)"),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::OutOfMemory,
        WaitStatus::Signaled(_, signal, core_dumped) => {
            TerminationReason::Signaled(signal, core_dumped)
        }
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_termination_reason_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::OutOfMemory.is_success());
    }

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(0));

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGTERM, false);
        assert_eq!(
            analyze_wait_status(status),
            TerminationReason::Signaled(Signal::SIGTERM, false)
        );

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(analyze_wait_status(status), TerminationReason::OutOfMemory);

        let status = WaitStatus::StillAlive;
        assert_eq!(analyze_wait_status(status), TerminationReason::StillAlive);
    }

    #[test]
    fn test_display_mentions_core_dump() {
        let reason = TerminationReason::Signaled(Signal::SIGSEGV, true);
        let text = reason.to_string();
        assert!(text.contains("SIGSEGV"));
        assert!(text.contains("core dumped"));
    }
}
