//! Signal relay from the outer process to the relaunched child.
//!
//! The outer process subscribes to every catchable signal except the ones
//! that must never be forwarded, and re-sends each one to the child's whole
//! process group. Job-control stops are mirrored: after the child's group is
//! stopped the relay stops its own process too, so a shell sees both halves
//! suspend together. The relay never kills the child on its own; when it
//! forwards a termination request it only tells the launcher, which owns the
//! escalation policy.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpid};
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::SignalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How the relay treats a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    /// Forwarded, then the launcher starts its kill grace period. Only
    /// `SIGTERM`: interactive children routinely catch `SIGINT`, `SIGQUIT`
    /// and `SIGHUP` and keep running.
    Terminate,
    /// Forwarded, then the relay stops its own process.
    Stop,
    /// Forwarded so a stopped child resumes with us.
    Continue,
    /// Forwarded with no further action (`SIGINT`, `SIGHUP`, `SIGUSR1`,
    /// `SIGWINCH`, ...).
    Notify,
    /// Never forwarded.
    Ignorable,
}

pub const fn classify(sig: Signal) -> SignalClass {
    match sig {
        Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => SignalClass::Stop,
        Signal::SIGCONT => SignalClass::Continue,
        // SIGCHLD reports our own child being reaped; SIGPIPE belongs to
        // whichever process wrote to a closed pipe.
        Signal::SIGCHLD | Signal::SIGPIPE => SignalClass::Ignorable,
        Signal::SIGTERM => SignalClass::Terminate,
        _ => SignalClass::Notify,
    }
}

/// Signals that cannot be caught, or that are raised synchronously by
/// faults in this process and make no sense to relay.
const NOT_SUBSCRIBED: &[Signal] = &[
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGBUS,
    Signal::SIGTRAP,
    Signal::SIGABRT,
    Signal::SIGSYS,
];

/// Every signal the relay subscribes to.
pub fn forwardable_signals() -> Vec<Signal> {
    Signal::iterator()
        .filter(|sig| classify(*sig) != SignalClass::Ignorable && !NOT_SUBSCRIBED.contains(sig))
        .collect()
}

/// Where the relay receives signals from.
pub trait SignalSource: Send {
    /// Next signal, or `None` once the source is exhausted.
    fn recv(&mut self) -> impl Future<Output = Option<Signal>> + Send;
}

/// Where the relay delivers signals to.
pub trait SignalSink: Send {
    fn signal_group(&self, pgid: Pid, sig: Signal) -> nix::Result<()>;
    fn stop_self(&self) -> nix::Result<()>;
}

/// OS signal subscription for [`forwardable_signals`].
///
/// Dropping it closes every stream. Tokio keeps its process-level handler
/// installed afterwards, so the default action does not come back.
pub struct OsSignals {
    streams: StreamMap<Signal, SignalStream>,
}

impl OsSignals {
    /// Subscribe to all forwardable signals. A signal the platform refuses
    /// is logged and skipped.
    pub fn subscribe() -> Self {
        let mut streams = StreamMap::new();
        for sig in forwardable_signals() {
            match signal(SignalKind::from_raw(sig as i32)) {
                Ok(stream) => {
                    streams.insert(sig, SignalStream::new(stream));
                }
                Err(e) => debug!(signal = %sig, error = %e, "Cannot subscribe to signal"),
            }
        }
        trace!(count = streams.len(), "Subscribed to signals");
        Self { streams }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl SignalSource for OsSignals {
    async fn recv(&mut self) -> Option<Signal> {
        self.streams.next().await.map(|(sig, ())| sig)
    }
}

/// Delivers signals with `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSink;

impl SignalSink for OsSink {
    /// `killpg(pgid, sig)` is `kill(-pgid, sig)`: every process in the group
    /// receives the signal, including anything the child spawned without
    /// moving to a new group.
    fn signal_group(&self, pgid: Pid, sig: Signal) -> nix::Result<()> {
        killpg(pgid, sig)
    }

    /// `SIGSTOP` cannot be caught, so this suspends us until a `SIGCONT`
    /// arrives from outside.
    fn stop_self(&self) -> nix::Result<()> {
        kill(getpid(), Signal::SIGSTOP)
    }
}

impl<T: SignalSink + Sync> SignalSink for Arc<T> {
    fn signal_group(&self, pgid: Pid, sig: Signal) -> nix::Result<()> {
        (**self).signal_group(pgid, sig)
    }

    fn stop_self(&self) -> nix::Result<()> {
        (**self).stop_self()
    }
}

/// A fixed list of signals; handy for driving the relay without the OS.
#[derive(Debug, Default)]
pub struct QueuedSignals {
    queue: VecDeque<Signal>,
}

impl QueuedSignals {
    pub fn new(signals: impl IntoIterator<Item = Signal>) -> Self {
        Self {
            queue: signals.into_iter().collect(),
        }
    }
}

impl SignalSource for QueuedSignals {
    async fn recv(&mut self) -> Option<Signal> {
        self.queue.pop_front()
    }
}

/// Forwards signals from a source to a target process group.
pub struct SignalRelay<S, K> {
    source: S,
    sink: K,
    target: Pid,
    terminate_requested: Option<CancellationToken>,
}

impl<S: SignalSource, K: SignalSink> SignalRelay<S, K> {
    pub const fn new(source: S, sink: K, target: Pid) -> Self {
        Self {
            source,
            sink,
            target,
            terminate_requested: None,
        }
    }

    /// Cancel `token` whenever a [`SignalClass::Terminate`] signal has been
    /// forwarded.
    #[must_use]
    pub fn notify_terminate(mut self, token: CancellationToken) -> Self {
        self.terminate_requested = Some(token);
        self
    }

    /// Relay until `cancel` fires or the source is exhausted. Each signal is
    /// fully handled before the next one is received. Returns how many
    /// signals were delivered.
    pub async fn run(mut self, cancel: CancellationToken) -> usize {
        let mut delivered = 0;
        loop {
            let sig = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                sig = self.source.recv() => match sig {
                    Some(sig) => sig,
                    None => break,
                },
            };
            if self.relay_one(sig) {
                delivered += 1;
            }
        }
        debug!(target_pgid = %self.target, delivered, "Signal relay stopped");
        delivered
    }

    fn relay_one(&self, sig: Signal) -> bool {
        let class = classify(sig);
        if class == SignalClass::Ignorable {
            trace!(signal = %sig, "Not forwarding signal");
            return false;
        }

        if let Err(errno) = self.sink.signal_group(self.target, sig) {
            debug!(
                signal = %sig,
                target_pgid = %self.target,
                error = %errno,
                "Failed to forward signal"
            );
            return false;
        }
        debug!(signal = %sig, target_pgid = %self.target, ?class, "Forwarded signal");

        match class {
            SignalClass::Stop => {
                if let Err(errno) = self.sink.stop_self() {
                    warn!(signal = %sig, error = %errno, "Failed to stop alongside child");
                }
            }
            SignalClass::Terminate => {
                if let Some(token) = &self.terminate_requested {
                    token.cancel();
                }
            }
            SignalClass::Continue | SignalClass::Notify | SignalClass::Ignorable => {}
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Delivery {
        Group(Pid, Signal),
        StopSelf,
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        log: Arc<Mutex<Vec<Delivery>>>,
        fail_group: bool,
    }

    impl RecordingSink {
        fn deliveries(&self) -> Vec<Delivery> {
            self.log.lock().unwrap().clone()
        }
    }

    impl SignalSink for RecordingSink {
        fn signal_group(&self, pgid: Pid, sig: Signal) -> nix::Result<()> {
            if self.fail_group {
                return Err(nix::errno::Errno::ESRCH);
            }
            self.log.lock().unwrap().push(Delivery::Group(pgid, sig));
            Ok(())
        }

        fn stop_self(&self) -> nix::Result<()> {
            self.log.lock().unwrap().push(Delivery::StopSelf);
            Ok(())
        }
    }

    struct PendingSource;

    impl SignalSource for PendingSource {
        async fn recv(&mut self) -> Option<Signal> {
            std::future::pending().await
        }
    }

    const CHILD: i32 = 4242;

    #[test]
    fn classification() {
        assert_eq!(classify(Signal::SIGTSTP), SignalClass::Stop);
        assert_eq!(classify(Signal::SIGTTIN), SignalClass::Stop);
        assert_eq!(classify(Signal::SIGTTOU), SignalClass::Stop);
        assert_eq!(classify(Signal::SIGCONT), SignalClass::Continue);
        assert_eq!(classify(Signal::SIGCHLD), SignalClass::Ignorable);
        assert_eq!(classify(Signal::SIGTERM), SignalClass::Terminate);
        assert_eq!(classify(Signal::SIGINT), SignalClass::Notify);
        assert_eq!(classify(Signal::SIGQUIT), SignalClass::Notify);
        assert_eq!(classify(Signal::SIGHUP), SignalClass::Notify);
        assert_eq!(classify(Signal::SIGUSR1), SignalClass::Notify);
        assert_eq!(classify(Signal::SIGWINCH), SignalClass::Notify);
    }

    #[test]
    fn forwardable_set() {
        let set = forwardable_signals();
        for sig in [
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGTSTP,
            Signal::SIGCONT,
            Signal::SIGUSR1,
            Signal::SIGWINCH,
        ] {
            assert!(set.contains(&sig), "{sig} missing");
        }
        for sig in [
            Signal::SIGCHLD,
            Signal::SIGPIPE,
            Signal::SIGKILL,
            Signal::SIGSTOP,
            Signal::SIGSEGV,
        ] {
            assert!(!set.contains(&sig), "{sig} must not be forwarded");
        }
    }

    #[tokio::test]
    async fn forwards_in_order_to_the_group() {
        let sink = RecordingSink::default();
        let source = QueuedSignals::new([Signal::SIGUSR1, Signal::SIGWINCH, Signal::SIGUSR2]);
        let delivered = SignalRelay::new(source, sink.clone(), Pid::from_raw(CHILD))
            .run(CancellationToken::new())
            .await;

        assert_eq!(delivered, 3);
        let pid = Pid::from_raw(CHILD);
        assert_eq!(
            sink.deliveries(),
            vec![
                Delivery::Group(pid, Signal::SIGUSR1),
                Delivery::Group(pid, Signal::SIGWINCH),
                Delivery::Group(pid, Signal::SIGUSR2),
            ]
        );
    }

    #[tokio::test]
    async fn child_reaped_signal_is_never_forwarded() {
        let sink = RecordingSink::default();
        let source = QueuedSignals::new([Signal::SIGCHLD, Signal::SIGINT, Signal::SIGCHLD]);
        let delivered = SignalRelay::new(source, sink.clone(), Pid::from_raw(CHILD))
            .run(CancellationToken::new())
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(
            sink.deliveries(),
            vec![Delivery::Group(Pid::from_raw(CHILD), Signal::SIGINT)]
        );
    }

    #[tokio::test]
    async fn stop_signals_suspend_both_sides() {
        let sink = RecordingSink::default();
        let source = QueuedSignals::new([Signal::SIGTSTP, Signal::SIGCONT]);
        SignalRelay::new(source, sink.clone(), Pid::from_raw(CHILD))
            .run(CancellationToken::new())
            .await;

        let pid = Pid::from_raw(CHILD);
        assert_eq!(
            sink.deliveries(),
            vec![
                Delivery::Group(pid, Signal::SIGTSTP),
                Delivery::StopSelf,
                Delivery::Group(pid, Signal::SIGCONT),
            ]
        );
    }

    #[tokio::test]
    async fn terminate_signals_notify_the_launcher() {
        let notice = CancellationToken::new();
        SignalRelay::new(
            QueuedSignals::new([Signal::SIGINT, Signal::SIGQUIT, Signal::SIGHUP]),
            RecordingSink::default(),
            Pid::from_raw(CHILD),
        )
        .notify_terminate(notice.clone())
        .run(CancellationToken::new())
        .await;
        assert!(!notice.is_cancelled());

        SignalRelay::new(
            QueuedSignals::new([Signal::SIGTERM]),
            RecordingSink::default(),
            Pid::from_raw(CHILD),
        )
        .notify_terminate(notice.clone())
        .run(CancellationToken::new())
        .await;
        assert!(notice.is_cancelled());
    }

    #[tokio::test]
    async fn delivery_failures_do_not_stop_the_loop() {
        let sink = RecordingSink {
            fail_group: true,
            ..Default::default()
        };
        let notice = CancellationToken::new();
        let delivered = SignalRelay::new(
            QueuedSignals::new([Signal::SIGTSTP, Signal::SIGTERM, Signal::SIGUSR1]),
            sink.clone(),
            Pid::from_raw(CHILD),
        )
        .notify_terminate(notice.clone())
        .run(CancellationToken::new())
        .await;

        assert_eq!(delivered, 0);
        // Nothing reached the child, so we must not stop ourselves either.
        assert!(sink.deliveries().is_empty());
        assert!(!notice.is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_ends_a_waiting_relay() {
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(
            SignalRelay::new(PendingSource, RecordingSink::default(), Pid::from_raw(CHILD))
                .run(cancel.clone()),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, 0);
    }
}
