//! Process-group termination.
//!
//! Every subject is spawned as the leader of its own process group, so a
//! single signal sent to `-pgid` reaches the subject and anything it forked.
//! The escalation policy (graceful first, forceful after a grace period)
//! lives in the supervisor; this module only knows how to deliver a signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How hard to ask a process group to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// `SIGTERM`: the subject may clean up or ignore it.
    Graceful,
    /// `SIGKILL`: cannot be caught or ignored.
    Forceful,
}

impl Termination {
    fn signal(self) -> libc::c_int {
        match self {
            Self::Graceful => libc::SIGTERM,
            Self::Forceful => libc::SIGKILL,
        }
    }
}

/// Signal target for one spawned subject.
///
/// Cheap to clone; all clones observe the same `reaped` flag, which the
/// reaper sets once the leader's exit status has been collected. After that
/// point the leader's pid may be recycled by the OS, so it is no longer
/// signalled directly.
#[derive(Debug, Clone)]
pub struct ProcessTarget {
    pid: i32,
    reaped: Arc<AtomicBool>,
}

impl ProcessTarget {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid: pid as i32,
            reaped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pid of the group leader (also the process group id).
    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    pub(crate) fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }

    /// Deliver `termination` to the leader and to its whole process group.
    ///
    /// Delivery failures (typically `ESRCH` because everything already
    /// exited) are logged at trace level and otherwise ignored.
    pub fn terminate(&self, termination: Termination) {
        let signal = termination.signal();

        if !self.is_reaped() {
            send_signal(self.pid, signal);
        }
        send_signal(-self.pid, signal);
    }
}

fn send_signal(target: i32, signal: libc::c_int) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(target, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        tracing::trace!(pid = target, signal, error = %err, "Signal delivery failed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_maps_to_posix_signals() {
        assert_eq!(Termination::Graceful.signal(), libc::SIGTERM);
        assert_eq!(Termination::Forceful.signal(), libc::SIGKILL);
    }

    #[test]
    fn reaped_flag_is_shared_between_clones() {
        let target = ProcessTarget::new(4242);
        let clone = target.clone();
        assert!(!clone.is_reaped());

        target.mark_reaped();
        assert!(clone.is_reaped());
        assert_eq!(clone.pid(), 4242);
    }
}
