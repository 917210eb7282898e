//! Terminal job control for a child running in its own process group.
//!
//! A direct child leads its own group, so while this process owns the
//! terminal the child has to become the foreground group; otherwise its
//! first terminal read stops it with `SIGTTIN`. Stops are mirrored both
//! ways. A stop relayed to the child also stops this process, and a stop
//! that reaches the child straight from the terminal (Ctrl-Z while it is in
//! the foreground) is mirrored onto this process so the shell sees the job
//! suspend. On resume the terminal goes back to the child.

use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill, killpg, pthread_sigmask};
use nix::unistd::{Pid, getpgrp, getpid, tcgetpgrp, tcsetpgrp};
use tracing::{debug, trace, warn};

use crate::signal::{SignalClass, SignalSink, classify};

/// Job-control state shared by the launcher and the signal relay.
#[derive(Debug)]
pub struct JobControl {
    child_pgid: Pid,
    own_pgid: Pid,
    /// Stdin is a terminal this process was in the foreground of.
    terminal: bool,
    /// Stops we forwarded ourselves whose effect on the child has not been
    /// observed yet.
    relayed_stops: AtomicUsize,
}

impl JobControl {
    /// Job control for a child that does not share our terminal.
    pub fn detached(child_pgid: Pid) -> Self {
        Self {
            child_pgid,
            own_pgid: getpgrp(),
            terminal: false,
            relayed_stops: AtomicUsize::new(0),
        }
    }

    /// Hand the terminal to the child's group if stdin is a terminal whose
    /// foreground group is ours, and continue the child in case it already
    /// stopped on a terminal read.
    pub fn claim_terminal(child_pgid: Pid) -> Self {
        let own_pgid = getpgrp();
        let stdin = io::stdin();
        let terminal = stdin.is_terminal() && tcgetpgrp(stdin).is_ok_and(|fg| fg == own_pgid);
        let job = Self {
            terminal,
            ..Self::detached(child_pgid)
        };
        if terminal {
            debug!(child_pgid = %child_pgid, "Handing the terminal to the child");
            job.resume_child();
        }
        job
    }

    pub const fn owns_terminal(&self) -> bool {
        self.terminal
    }

    /// Give the terminal to the child if we hold it, then continue the
    /// child's group.
    pub fn resume_child(&self) {
        self.foreground_child();
        if let Err(errno) = killpg(self.child_pgid, Signal::SIGCONT) {
            debug!(child_pgid = %self.child_pgid, error = %errno, "Failed to continue child");
        }
    }

    /// React to the child being observed stopped by `sig`.
    pub fn child_stopped(&self, sig: Signal) {
        if self.take_relayed_stop() {
            trace!(signal = %sig, "Child stopped by a relayed signal");
            return;
        }
        let foreground = self.foreground();
        let ours = foreground == Some(self.own_pgid) || foreground == Some(self.child_pgid);
        if matches!(sig, Signal::SIGTTIN | Signal::SIGTTOU) && ours {
            // Touched the terminal before it was handed over.
            debug!(signal = %sig, "Child stopped on terminal access, resuming it");
            self.resume_child();
            return;
        }

        debug!(signal = %sig, "Child stopped, stopping alongside it");
        if let Err(errno) = self.suspend_self() {
            warn!(error = %errno, "Failed to stop alongside child");
        }
        self.resume_child();
    }

    /// Take the terminal back if the child's group still holds it.
    pub fn restore(&self) {
        if self.foreground() == Some(self.child_pgid) {
            if let Err(errno) = set_foreground(self.own_pgid) {
                debug!(error = %errno, "Failed to take the terminal back");
            }
        }
    }

    /// Returns once this process has been continued.
    fn suspend_self(&self) -> nix::Result<()> {
        self.restore();
        kill(getpid(), Signal::SIGSTOP)
    }

    fn foreground(&self) -> Option<Pid> {
        if !self.terminal {
            return None;
        }
        tcgetpgrp(io::stdin()).ok()
    }

    /// Only when we hold the terminal; after `bg` it belongs to the shell.
    fn foreground_child(&self) {
        if self.foreground() == Some(self.own_pgid) {
            if let Err(errno) = set_foreground(self.child_pgid) {
                debug!(error = %errno, "Failed to hand the terminal to the child");
            }
        }
    }

    fn take_relayed_stop(&self) -> bool {
        self.relayed_stops
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl SignalSink for JobControl {
    fn signal_group(&self, pgid: Pid, sig: Signal) -> nix::Result<()> {
        let class = classify(sig);
        match class {
            SignalClass::Stop => {
                self.relayed_stops.fetch_add(1, Ordering::AcqRel);
            }
            SignalClass::Continue => self.foreground_child(),
            SignalClass::Terminate | SignalClass::Notify | SignalClass::Ignorable => {}
        }
        let result = killpg(pgid, sig);
        if result.is_err() && class == SignalClass::Stop {
            self.take_relayed_stop();
        }
        result
    }

    fn stop_self(&self) -> nix::Result<()> {
        self.suspend_self()
    }
}

/// `tcsetpgrp` on stdin with `SIGTTOU` blocked, so a background caller is
/// not stopped for touching the terminal.
fn set_foreground(pgid: Pid) -> nix::Result<()> {
    let mut ttou = SigSet::empty();
    ttou.add(Signal::SIGTTOU);
    let mut previous = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&ttou), Some(&mut previous))?;
    let result = tcsetpgrp(io::stdin(), pgid);
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)?;
    result
}
