//! Process-wide signal gate: latches for a pending fatal signal and for
//! queued info (progress) requests, plus the copy loop's poll points.
//!
//! The latches are the only process-global state in the crate; signal
//! handlers cannot carry user context, so they store into atomics that the
//! engine drains at well-defined suspension points. The handler/latch
//! arrangement follows GNU dd.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

/// If nonzero, the value of the pending fatal signal.
static INTERRUPT_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// A count of pending info signals, decremented as processed.
static INFO_SIGNALS_PENDING: AtomicUsize = AtomicUsize::new(0);

const INFO_SIGNAL: i32 = libc::SIGUSR1;

/// What `poll` found; the consumer prints, then the gate finishes the
/// handling (for an interrupt that means re-raising with the default
/// disposition, which terminates the process).
pub enum SignalEvent {
    Interrupt(i32),
    Info,
}

pub fn signal_name(signum: i32) -> String {
    match signum {
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        libc::SIGUSR1 => "SIGUSR1".to_string(),
        other => other.to_string(),
    }
}

pub struct SignalGate {
    /// Signals we installed handlers for (those already set to "ignore"
    /// stay ignored).
    caught: Vec<i32>,
    /// True when the caught set is blocked outside poll points (intio=0).
    masked: bool,
    orig_mask: libc::sigset_t,
    start: Instant,
}

fn empty_sigset() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

fn sigset_of(signals: &[i32]) -> libc::sigset_t {
    let mut set = empty_sigset();
    for &sig in signals {
        unsafe {
            libc::sigaddset(&mut set, sig);
        }
    }
    set
}

/// True when the signal's current disposition is SIG_IGN; such signals are
/// left alone so a parent's "ignore" survives.
fn currently_ignored(sig: i32) -> bool {
    unsafe {
        let mut act = MaybeUninit::<libc::sigaction>::zeroed().assume_init();
        if libc::sigaction(sig, std::ptr::null(), &mut act) != 0 {
            return false;
        }
        act.sa_sigaction == libc::SIG_IGN
    }
}

impl SignalGate {
    /// Install the handlers and, unless `interrupt_io` is set, block the
    /// caught signals so IO system calls cannot be interrupted mid-flight;
    /// they are then only noticed at `poll` points.
    pub fn install(interrupt_io: bool) -> SignalGate {
        let mut caught = Vec::new();

        for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGPIPE] {
            if currently_ignored(sig) {
                debug!("{} ignored, leaving disposition alone", signal_name(sig));
                continue;
            }
            let res = unsafe {
                signal_hook::low_level::register(sig, move || {
                    INTERRUPT_SIGNAL.store(sig, Ordering::SeqCst);
                })
            };
            if res.is_ok() {
                caught.push(sig);
            }
        }
        if currently_ignored(INFO_SIGNAL) {
            debug!("SIGUSR1 ignored, progress reports not available");
        } else {
            let res = unsafe {
                signal_hook::low_level::register(INFO_SIGNAL, || {
                    INFO_SIGNALS_PENDING.fetch_add(1, Ordering::SeqCst);
                })
            };
            if res.is_ok() {
                caught.push(INFO_SIGNAL);
            }
        }

        let mut orig_mask = empty_sigset();
        let mut masked = false;
        if !interrupt_io && !caught.is_empty() {
            let block = sigset_of(&caught);
            unsafe {
                libc::sigprocmask(libc::SIG_BLOCK, &block, &mut orig_mask);
            }
            masked = true;
        }
        SignalGate {
            caught,
            masked,
            orig_mask,
            start: Instant::now(),
        }
    }

    /// Monotonic timestamp taken at installation; used for throughput.
    pub fn start_time(&self) -> Instant {
        self.start
    }

    /// Process pending signals. Called at the head of each read phase and
    /// each write phase. `on_event` prints whatever the event calls for;
    /// after an Interrupt event returns, the signal is re-raised with its
    /// default disposition and the process terminates.
    pub fn poll<F: FnMut(SignalEvent)>(&self, mut on_event: F) {
        if self.masked {
            // Handlers have not run while blocked; if one of ours is
            // pending, open the mask so it is delivered, then continue to
            // drain the latches.
            let mut pending = empty_sigset();
            unsafe {
                libc::sigpending(&mut pending);
            }
            let any = self
                .caught
                .iter()
                .any(|&s| unsafe { libc::sigismember(&pending, s) } == 1);
            if any {
                unsafe {
                    libc::sigsuspend(&self.orig_mask);
                }
            } else {
                return;
            }
        }

        loop {
            let interrupt = INTERRUPT_SIGNAL.load(Ordering::SeqCst);
            let infos = INFO_SIGNALS_PENDING.load(Ordering::SeqCst);
            if interrupt == 0 && infos == 0 {
                return;
            }
            if infos > 0 {
                INFO_SIGNALS_PENDING.store(infos - 1, Ordering::SeqCst);
            }
            if interrupt != 0 {
                on_event(SignalEvent::Interrupt(interrupt));
                let one = sigset_of(&[interrupt]);
                unsafe {
                    libc::sigprocmask(libc::SIG_UNBLOCK, &one, std::ptr::null_mut());
                }
                let _ = signal_hook::low_level::emulate_default_handler(interrupt);
            } else {
                on_event(SignalEvent::Info);
            }
        }
    }
}
