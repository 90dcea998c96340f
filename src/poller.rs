//! The event loop's multiplexer: a registry of file-descriptor handlers and
//! a deadline-ordered timer heap, driven by `poll(2)`.
//!
//! The poller owns no handler state. Registrations carry a [`Token`] that the
//! supervisor resolves back to a process, session, or the signal pipe, so the
//! loop holds only weak references by construction.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap, HashSet},
    io,
    os::fd::{BorrowedFd, RawFd},
    time::{Duration, Instant},
};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// Identifies the owner of a registered file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Read end of the signal self-pipe.
    Signal,
    /// A captured child output stream.
    Child {
        /// Stable id of the owning Process.
        process: u32,
        /// Which stream of that child.
        stream: StreamKind,
    },
    /// The RPC listener socket.
    RpcListener,
    /// An accepted RPC client connection.
    RpcClient {
        /// Session id assigned at accept time.
        session: u64,
    },
}

/// Which child stream a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Child standard output.
    Stdout,
    /// Child standard error.
    Stderr,
}

/// I/O directions a handler is interested in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    /// Wake when the descriptor is readable.
    pub readable: bool,
    /// Wake when the descriptor is writable.
    pub writable: bool,
}

impl Interest {
    /// Read-only interest.
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    /// Write-only interest.
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };
    /// Both directions.
    pub const READ_WRITE: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// Readiness reported for one descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    /// Data can be read without blocking.
    pub readable: bool,
    /// Data can be written without blocking.
    pub writable: bool,
    /// Peer hung up.
    pub hangup: bool,
    /// Error condition on the descriptor.
    pub error: bool,
}

/// Timed work owned by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// A BACKOFF delay elapsed; attempt a respawn.
    Backoff {
        /// Stable id of the Process.
        process: u32,
    },
    /// Stop grace period elapsed; escalate to SIGKILL.
    KillEscalation {
        /// Stable id of the Process.
        process: u32,
    },
    /// The child survived `startsecs`; it counts as RUNNING.
    StartupCheck {
        /// Stable id of the Process.
        process: u32,
    },
}

/// Handle for cancelling an armed timer.
pub type TimerId = u64;

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    kind: TimerKind,
}

// Reverse ordering turns the std max-heap into a deadline min-heap.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimerEntry {}

/// Everything one loop turn produced: expired timers first, then readiness.
#[derive(Debug, Default)]
pub struct Turn {
    /// Timers that reached their deadline, in deadline order.
    pub expired: Vec<TimerKind>,
    /// Descriptors that became ready, in registry order.
    pub ready: Vec<(Token, Readiness)>,
}

/// Readiness selector plus timer heap.
pub struct Poller {
    registry: BTreeMap<RawFd, (Token, Interest)>,
    timers: BinaryHeap<TimerEntry>,
    cancelled: HashSet<TimerId>,
    next_timer: TimerId,
}

impl Poller {
    /// Creates an empty poller.
    pub fn new() -> Self {
        Poller {
            registry: BTreeMap::new(),
            timers: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_timer: 1,
        }
    }

    /// Registers (or re-registers) a descriptor with the given interest.
    pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) {
        self.registry.insert(fd, (token, interest));
    }

    /// Changes the interest of an already-registered descriptor.
    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) {
        if let Some(entry) = self.registry.get_mut(&fd) {
            entry.1 = interest;
        }
    }

    /// Removes a descriptor from the registry.
    pub fn deregister(&mut self, fd: RawFd) {
        self.registry.remove(&fd);
    }

    /// Number of registered descriptors.
    pub fn registered(&self) -> usize {
        self.registry.len()
    }

    /// Arms a timer `delay` from now.
    pub fn arm_timer(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        let id = self.next_timer;
        self.next_timer += 1;
        self.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            kind,
        });
        id
    }

    /// Cancels an armed timer. Lazy: the heap entry is tombstoned and
    /// discarded when it surfaces.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.timers.peek() {
            if self.cancelled.remove(&top.id) {
                self.timers.pop();
                continue;
            }
            return Some(top.deadline);
        }
        None
    }

    fn pop_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut expired = Vec::new();
        while let Some(top) = self.timers.peek() {
            if self.cancelled.remove(&top.id) {
                self.timers.pop();
                continue;
            }
            if top.deadline > now {
                break;
            }
            let entry = self.timers.pop().unwrap_or_else(|| unreachable!());
            expired.push(entry.kind);
        }
        expired
    }

    /// Runs one readiness wait: blocks until the nearest deadline, the
    /// optional cap, or any registered descriptor becoming ready.
    pub fn turn(&mut self, cap: Option<Duration>) -> io::Result<Turn> {
        let mut wait = self.next_deadline().map(|deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        if let Some(cap) = cap {
            wait = Some(wait.map_or(cap, |w| w.min(cap)));
        }
        let timeout = match wait {
            Some(remaining) => {
                let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
                // Round up so we never spin on a deadline under 1ms away.
                let millis = if millis == 0 && remaining > Duration::ZERO {
                    1
                } else {
                    millis
                };
                PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
            }
            None => PollTimeout::NONE,
        };

        let fds: Vec<RawFd> = self.registry.keys().copied().collect();
        let mut pollfds: Vec<PollFd> = self
            .registry
            .iter()
            .map(|(fd, (_, interest))| {
                let mut flags = PollFlags::empty();
                if interest.readable {
                    flags |= PollFlags::POLLIN;
                }
                if interest.writable {
                    flags |= PollFlags::POLLOUT;
                }
                PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, flags)
            })
            .collect();

        match poll(&mut pollfds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => {
                return Ok(Turn {
                    expired: self.pop_expired(Instant::now()),
                    ready: Vec::new(),
                });
            }
            Err(err) => return Err(io::Error::from(err)),
        }

        let mut ready = Vec::new();
        for (fd, pollfd) in fds.iter().zip(pollfds.iter()) {
            let Some(revents) = pollfd.revents() else {
                continue;
            };
            if revents.is_empty() {
                continue;
            }
            let readiness = Readiness {
                readable: revents.contains(PollFlags::POLLIN),
                writable: revents.contains(PollFlags::POLLOUT),
                hangup: revents.contains(PollFlags::POLLHUP),
                error: revents.contains(PollFlags::POLLERR)
                    || revents.contains(PollFlags::POLLNVAL),
            };
            if let Some((token, _)) = self.registry.get(fd) {
                ready.push((*token, readiness));
            }
        }

        Ok(Turn {
            expired: self.pop_expired(Instant::now()),
            ready,
        })
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}
