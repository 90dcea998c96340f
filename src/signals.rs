//! Signal dispatch via the self-pipe trick.
//!
//! The OS handler does no work: it writes the signal number as a single byte
//! into a non-blocking pipe. The read end is registered with the event loop,
//! which drains it and handles signals synchronously with everything else.

use std::{
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicI32, Ordering},
};

use nix::{
    fcntl::OFlag,
    sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction},
    unistd::{pipe2, read},
};
use tracing::warn;

/// Write end of the self-pipe, reachable from the OS signal handler.
static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Signals routed through the dispatcher. Everything else keeps its default
/// disposition.
pub const HANDLED_SIGNALS: [Signal; 6] = [
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGUSR2,
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
];

extern "C" fn deliver(signum: libc::c_int) {
    let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // Async-signal-safe; a full pipe just drops the byte, which is fine
        // because pending signals of one kind coalesce anyway.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// The event-loop side of the dispatcher: owns the read end of the pipe.
pub struct SignalPipe {
    rx: OwnedFd,
    _tx: OwnedFd,
}

impl SignalPipe {
    /// Creates the pipe and installs handlers for [`HANDLED_SIGNALS`].
    pub fn install() -> nix::Result<Self> {
        let (rx, tx) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        SIGNAL_PIPE_WR.store(tx.as_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(deliver),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in HANDLED_SIGNALS {
            unsafe {
                sigaction(signal, &action)?;
            }
        }

        Ok(SignalPipe { rx, _tx: tx })
    }

    /// File descriptor to register for readability.
    pub fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// Drains every pending byte, returning the received signals in arrival
    /// order.
    pub fn drain(&self) -> Vec<Signal> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match read(self.rx.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        match Signal::try_from(byte as i32) {
                            Ok(signal) => signals.push(signal),
                            Err(_) => warn!("unknown signal byte {byte} on self-pipe"),
                        }
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    warn!("self-pipe read failed: {err}");
                    break;
                }
            }
        }
        signals
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        // Only disarm if the handler still points at this pipe; a newer
        // install owns the slot otherwise.
        let _ = SIGNAL_PIPE_WR.compare_exchange(
            self._tx.as_raw_fd(),
            -1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}
