//! Execution timeouts.
//!
//! `KVM_RUN` blocks until the guest exits. To bound a run, each vCPU thread
//! owns a POSIX timer that delivers [`TIMEOUT_SIGNAL`] to that exact thread.
//! The signal handler does nothing; its only effect is that the blocked
//! ioctl returns `EINTR`, after which the run loop compares the clock with
//! its deadline.
//!
//! The timer keeps firing every millisecond after the first expiry, so a
//! signal that lands just before the thread re-enters the guest is followed
//! by another one.

use super::KvmError;
use nix::sys::signal::{
    sigaction, SaFlags, SigAction, SigEvent, SigHandler, SigSet, SigevNotify, Signal,
};
use nix::sys::time::TimeSpec;
use nix::sys::timer::{Expiration, Timer, TimerSetTimeFlags};
use nix::time::ClockId;
use nix::unistd::{gettid, Pid};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Signal used to kick a vCPU thread out of `KVM_RUN`.
pub const TIMEOUT_SIGNAL: Signal = Signal::SIGUSR2;

const REARM_INTERVAL: Duration = Duration::from_millis(1);

static SIGNAL_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs the no-op timeout handler. Idempotent.
///
/// No `SA_RESTART`: the interrupted ioctl returns `EINTR` instead of restarting.
pub fn install_signal_handler() -> Result<(), KvmError> {
    if SIGNAL_HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    extern "C" fn timeout_handler(_: libc::c_int) {}

    let action = SigAction::new(
        SigHandler::Handler(timeout_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler is async-signal-safe, it does nothing.
    unsafe { sigaction(TIMEOUT_SIGNAL, &action) }.map_err(|e| {
        SIGNAL_HANDLER_INSTALLED.store(false, Ordering::SeqCst);
        KvmError::SignalHandler(e)
    })?;
    Ok(())
}

/// A per-thread timer aimed at the thread that created it.
pub struct TimeoutTimer {
    timer: Timer,
    thread: Pid,
}

// SAFETY: the kernel timer id is a plain handle; every operation on it is a
// syscall that may be issued from any thread.
unsafe impl Send for TimeoutTimer {}

impl TimeoutTimer {
    pub fn new() -> Result<Self, KvmError> {
        let thread = gettid();
        let event = SigEvent::new(SigevNotify::SigevThreadId {
            signal: TIMEOUT_SIGNAL,
            thread_id: thread.as_raw(),
            si_value: 0,
        });
        let timer = Timer::new(ClockId::CLOCK_MONOTONIC, event).map_err(KvmError::Timer)?;
        Ok(Self { timer, thread })
    }

    /// The signal would reach the calling thread.
    pub fn targets_current_thread(&self) -> bool {
        self.thread == gettid()
    }

    pub fn arm(&mut self, timeout: Duration) -> Result<(), KvmError> {
        let expiration = Expiration::IntervalDelayed(
            TimeSpec::from_duration(timeout),
            TimeSpec::from_duration(REARM_INTERVAL),
        );
        self.timer
            .set(expiration, TimerSetTimeFlags::empty())
            .map_err(KvmError::Timer)
    }

    pub fn disarm(&mut self) -> Result<(), KvmError> {
        self.timer
            .set(
                Expiration::OneShot(TimeSpec::new(0, 0)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(KvmError::Timer)
    }
}
