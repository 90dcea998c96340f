//! Non-blocking capture of child output streams into the log pipeline.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::unistd::read;
use tracing::warn;

use crate::logger::LogFile;

/// Bytes read per loop turn per stream, so one chatty child cannot starve
/// the other handlers.
const READ_CHUNK: usize = 8192;

/// Consecutive sink failures reported before going quiet.
const MAX_REPORTED_SINK_ERRORS: u32 = 3;

/// Result of pumping a stream once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// The stream is still open.
    Open,
    /// The writer side closed; the dispatcher should be deregistered.
    Eof,
}

/// Reads one child stream and hands bytes to the owning Process's log file.
#[derive(Debug)]
pub struct OutputDispatcher {
    fd: OwnedFd,
    bytes_seen: u64,
    sink_errors: u32,
}

impl OutputDispatcher {
    /// Wraps the read end of a child pipe. The descriptor must already be
    /// non-blocking.
    pub fn new(fd: OwnedFd) -> Self {
        OutputDispatcher {
            fd,
            bytes_seen: 0,
            sink_errors: 0,
        }
    }

    /// Descriptor registered with the event loop.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Total bytes captured so far.
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// Performs one bounded non-blocking read, appending to `sink` when the
    /// stream is being kept. Sink failures are local: logged (rate-limited)
    /// and otherwise ignored so a bad disk never stalls the loop.
    pub fn pump(&mut self, name: &str, sink: Option<&mut LogFile>) -> Pump {
        let mut buf = [0u8; READ_CHUNK];
        match read(self.fd.as_raw_fd(), &mut buf) {
            Ok(0) => Pump::Eof,
            Ok(n) => {
                self.bytes_seen += n as u64;
                if let Some(log) = sink {
                    match log.write_all(&buf[..n]) {
                        Ok(()) => self.sink_errors = 0,
                        Err(err) => {
                            if self.sink_errors < MAX_REPORTED_SINK_ERRORS {
                                warn!("failed to write log for '{name}': {err}");
                            }
                            self.sink_errors = self.sink_errors.saturating_add(1);
                        }
                    }
                }
                Pump::Open
            }
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => Pump::Open,
            Err(err) => {
                warn!("read from '{name}' stream failed: {err}");
                Pump::Eof
            }
        }
    }

    /// Drains whatever is immediately available, then reports whether the
    /// stream reached EOF. Used at teardown so a final burst is not lost.
    pub fn drain(&mut self, name: &str, mut sink: Option<&mut LogFile>) -> Pump {
        loop {
            match self.pump(name, sink.as_deref_mut()) {
                Pump::Eof => return Pump::Eof,
                Pump::Open => {
                    // A second would-block read means the pipe is empty.
                    let mut probe = [0u8; 1];
                    match read(self.fd.as_raw_fd(), &mut probe) {
                        Ok(0) => return Pump::Eof,
                        Ok(_) => {
                            if let Some(log) = sink.as_deref_mut() {
                                let _ = log.write_all(&probe);
                            }
                            continue;
                        }
                        Err(_) => return Pump::Open,
                    }
                }
            }
        }
    }
}

/// Marks a descriptor non-blocking.
pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(nix::errno::Errno::last());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}
