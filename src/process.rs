//! The per-child state machine: spawning, supervising, stopping, and the
//! restart policy.
//!
//! A `Process` is the supervisor-side record of one controlled child. All
//! mutation happens from within the event loop's turn, so transitions for a
//! given Process are totally ordered by construction.

use std::{
    ffi::CString,
    fs,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{signal::Signal, signal::kill, stat::Mode},
    unistd::{ForkResult, Gid, Pid, Uid, execve, fork, pipe2, setgid, setsid, setuid},
};
use serde::Serialize;
use strum::Display;
use tracing::{debug, error, info, warn};

use crate::{
    config::{LogPolicy, ProgramConfig, ServerConfig},
    dispatcher::{OutputDispatcher, Pump, set_nonblocking},
    error::SpawnError,
    logger::{LogFile, auto_log_path},
    poller::{Interest, Poller, StreamKind, TimerId, TimerKind, Token},
};

/// Linear backoff delays are capped at this many seconds.
const BACKOFF_CAP_SECS: u64 = 16;

/// Environment marker injected into every child.
const CHILD_ENV_MARKER: &str = "SUPERVISOR_ENABLED=1";

/// Exhaustive set of Process states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    /// Not running; initial state, or stopped by an operator.
    Stopped,
    /// Spawned, waiting out `startsecs`.
    Starting,
    /// Alive past `startsecs`.
    Running,
    /// A failed start is waiting for its respawn timer.
    Backoff,
    /// Stop signal sent, waiting for the reap.
    Stopping,
    /// Exited with an expected code.
    Exited,
    /// Gave up restarting; needs operator intervention.
    Fatal,
    /// Reserved for pid-reconciliation edge cases.
    Unknown,
}

impl ProcessState {
    /// Numeric state code reported over RPC.
    pub fn code(self) -> i32 {
        match self {
            ProcessState::Stopped => 0,
            ProcessState::Starting => 10,
            ProcessState::Running => 20,
            ProcessState::Backoff => 30,
            ProcessState::Stopping => 40,
            ProcessState::Exited => 100,
            ProcessState::Fatal => 200,
            ProcessState::Unknown => 1000,
        }
    }

    /// True when no further transitions happen without outside input.
    pub fn is_resting(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped
                | ProcessState::Exited
                | ProcessState::Fatal
                | ProcessState::Unknown
        )
    }

    /// True in exactly the states where a live, unreaped pid exists.
    pub fn has_pid(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

/// Supervisor-wide knobs a Process needs at spawn and failure time.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Failed starts tolerated before FATAL.
    pub backofflimit: u32,
    /// Never enter FATAL from backoff exhaustion.
    pub forever: bool,
    /// Umask applied in the child before exec.
    pub umask: u32,
}

impl RestartPolicy {
    /// Extracts the policy from an effective config snapshot.
    pub fn from_config(config: &ServerConfig) -> Self {
        RestartPolicy {
            backofflimit: config.backofflimit,
            forever: config.forever,
            umask: config.umask,
        }
    }
}

/// RPC-facing snapshot of one Process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    /// Stable program name.
    pub name: String,
    /// State name, e.g. `RUNNING`.
    pub state: ProcessState,
    /// Numeric state code.
    pub statecode: i32,
    /// Human-readable summary line.
    pub description: String,
    /// Live pid, if any.
    pub pid: Option<i32>,
    /// Last spawn instant (unix seconds).
    pub start: Option<i64>,
    /// Last exit/stop instant (unix seconds).
    pub stop: Option<i64>,
    /// Last exit code, when the child exited normally.
    pub exitstatus: Option<i32>,
    /// Last spawn error, if any.
    pub spawnerr: Option<String>,
    /// Path of the child log, if output is kept.
    pub logfile: Option<String>,
}

/// One controlled child.
pub struct Process {
    /// Stable id used in event-loop tokens.
    pub id: u32,
    config: ProgramConfig,
    policy: RestartPolicy,
    state: ProcessState,
    pid: Option<Pid>,
    started_at: Option<DateTime<Utc>>,
    spawned_instant: Option<Instant>,
    stopped_at: Option<DateTime<Utc>>,
    last_exit_code: Option<i32>,
    spawnerr: Option<String>,
    retries: u32,
    log: Option<LogFile>,
    stdout: Option<OutputDispatcher>,
    stderr: Option<OutputDispatcher>,
    exec_err_rx: Option<OwnedFd>,
    startup_timer: Option<TimerId>,
    backoff_timer: Option<TimerId>,
    kill_timer: Option<TimerId>,
    respawn_suppressed: bool,
}

impl Process {
    /// Builds the record for one `[program:...]` section. Nothing is spawned
    /// until [`Process::start`].
    pub fn new(
        id: u32,
        config: ProgramConfig,
        policy: RestartPolicy,
        childlogdir: &Path,
    ) -> Self {
        let log = match &config.logfile {
            LogPolicy::None => None,
            LogPolicy::Auto => Some(LogFile::new(
                auto_log_path(childlogdir, &config.name),
                config.logfile_maxbytes,
                config.logfile_backups,
            )),
            LogPolicy::Path(path) => Some(LogFile::new(
                path.clone(),
                config.logfile_maxbytes,
                config.logfile_backups,
            )),
        };

        Process {
            id,
            config,
            policy,
            state: ProcessState::Stopped,
            pid: None,
            started_at: None,
            spawned_instant: None,
            stopped_at: None,
            last_exit_code: None,
            spawnerr: None,
            retries: 0,
            log,
            stdout: None,
            stderr: None,
            exec_err_rx: None,
            startup_timer: None,
            backoff_timer: None,
            kill_timer: None,
            respawn_suppressed: false,
        }
    }

    /// Program name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Live pid, if any.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Start/stop ordering key.
    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    /// Whether this program starts at supervisor boot.
    pub fn autostart(&self) -> bool {
        self.config.autostart
    }

    /// The program section this Process was built from.
    pub fn config(&self) -> &ProgramConfig {
        &self.config
    }

    /// Mutable handle to the child log sink, when output is kept.
    pub fn log_mut(&mut self) -> Option<&mut LogFile> {
        self.log.as_mut()
    }

    /// Replaces the restart policy after a reload.
    pub fn set_policy(&mut self, policy: RestartPolicy) {
        self.policy = policy;
    }

    /// Disables respawns and backoff retries. Used while shutting down and
    /// for processes removed by a reload: any subsequent exit comes to rest.
    pub fn suppress_respawn(&mut self) {
        self.respawn_suppressed = true;
    }

    fn transition(&mut self, to: ProcessState) {
        if self.state != to {
            info!("{}: {} -> {}", self.config.name, self.state, to);
            self.state = to;
        }
    }

    /// Operator-initiated (or autostart) start. Resets the failure streak.
    pub fn start(&mut self, poller: &mut Poller) {
        match self.state {
            ProcessState::Stopped
            | ProcessState::Exited
            | ProcessState::Fatal
            | ProcessState::Unknown => {
                self.retries = 0;
                self.spawnerr = None;
                self.respawn_suppressed = false;
                self.spawn(poller);
            }
            ProcessState::Backoff => {
                self.cancel_backoff_timer(poller);
                self.retries = 0;
                self.spawnerr = None;
                self.respawn_suppressed = false;
                self.spawn(poller);
            }
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping => {
                debug!("{}: start ignored in state {}", self.config.name, self.state);
            }
        }
    }

    /// Initiates a stop. Idempotent while STOPPING; cancels a pending
    /// respawn when in BACKOFF.
    pub fn stop(&mut self, poller: &mut Poller) {
        match self.state {
            ProcessState::Starting | ProcessState::Running => {
                self.cancel_startup_timer(poller);
                if let Some(pid) = self.pid {
                    let signal = self.config.stopsignal.as_signal();
                    info!("{}: sending {} to pid {}", self.config.name, signal, pid);
                    if let Err(err) = kill(pid, signal) {
                        warn!("{}: stop signal failed: {}", self.config.name, err);
                    }
                }
                self.transition(ProcessState::Stopping);
                self.kill_timer = Some(poller.arm_timer(
                    Duration::from_secs(self.config.stopwaitsecs),
                    TimerKind::KillEscalation { process: self.id },
                ));
            }
            ProcessState::Backoff => {
                self.cancel_backoff_timer(poller);
                self.stopped_at = Some(Utc::now());
                self.transition(ProcessState::Stopped);
            }
            ProcessState::Stopping => {}
            ProcessState::Stopped
            | ProcessState::Exited
            | ProcessState::Fatal
            | ProcessState::Unknown => {}
        }
    }

    /// Timer callback dispatch.
    pub fn on_timer(&mut self, kind: TimerKind, poller: &mut Poller) {
        match kind {
            TimerKind::StartupCheck { .. } => {
                self.startup_timer = None;
                if self.state == ProcessState::Starting && self.pid.is_some() {
                    self.retries = 0;
                    self.transition(ProcessState::Running);
                }
            }
            TimerKind::Backoff { .. } => {
                self.backoff_timer = None;
                if self.state == ProcessState::Backoff {
                    self.spawn(poller);
                }
            }
            TimerKind::KillEscalation { .. } => {
                self.kill_timer = None;
                if self.state == ProcessState::Stopping
                    && let Some(pid) = self.pid
                {
                    warn!(
                        "{}: pid {} did not exit within {}s, sending SIGKILL",
                        self.config.name, pid, self.config.stopwaitsecs
                    );
                    if let Err(err) = kill(pid, Signal::SIGKILL) {
                        warn!("{}: SIGKILL failed: {}", self.config.name, err);
                    }
                }
            }
        }
    }

    /// Delivers a reaped exit to the state machine.
    pub fn on_reaped(
        &mut self,
        exit_code: Option<i32>,
        signal: Option<Signal>,
        poller: &mut Poller,
    ) {
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        self.last_exit_code = exit_code;
        self.cancel_startup_timer(poller);
        self.cancel_kill_timer(poller);

        // The close-on-exec error pipe distinguishes an exec failure from an
        // early child death.
        if let Some(errno) = self.take_exec_error() {
            self.spawnerr = Some(SpawnError::ExecFailed(errno).to_string());
        }

        match self.state {
            ProcessState::Stopping => {
                self.transition(ProcessState::Stopped);
            }
            ProcessState::Starting | ProcessState::Running => {
                let expected =
                    exit_code.is_some_and(|code| self.config.exitcodes.contains(&code));
                let ran_long = self
                    .spawned_instant
                    .is_some_and(|t| t.elapsed() >= Duration::from_secs(self.config.startsecs));

                if expected {
                    self.retries = 0;
                    self.transition(ProcessState::Exited);
                    if self.config.autorestart && !self.respawn_suppressed {
                        info!("{}: autorestart after expected exit", self.config.name);
                        self.spawn(poller);
                    }
                } else {
                    if let Some(sig) = signal {
                        debug!("{}: terminated by {}", self.config.name, sig);
                    }
                    if ran_long {
                        self.retries = 0;
                    }
                    if self.respawn_suppressed {
                        // Shutdown or removal is in progress; come to rest
                        // instead of backing off.
                        self.transition(ProcessState::Stopped);
                    } else {
                        self.fail_start(poller);
                    }
                }
            }
            other => {
                warn!(
                    "{}: unexpected reap in state {} (exit {:?})",
                    self.config.name, other, exit_code
                );
            }
        }
    }

    /// A failed start: increment the streak and either back off or give up.
    fn fail_start(&mut self, poller: &mut Poller) {
        self.retries += 1;
        self.transition(ProcessState::Backoff);
        if !self.policy.forever && self.retries >= self.policy.backofflimit {
            error!(
                "{}: gave up after {} failed start attempts",
                self.config.name, self.retries
            );
            self.transition(ProcessState::Fatal);
            return;
        }
        let delay = u64::from(self.retries).min(BACKOFF_CAP_SECS);
        self.backoff_timer = Some(poller.arm_timer(
            Duration::from_secs(delay),
            TimerKind::Backoff { process: self.id },
        ));
    }

    /// Forks and execs the child, transitioning to STARTING on success and
    /// through the failure policy otherwise.
    fn spawn(&mut self, poller: &mut Poller) {
        debug_assert!(self.pid.is_none(), "spawn with an outstanding child");
        match self.try_spawn(poller) {
            Ok(()) => {}
            Err(err) => {
                error!("{}: spawn failed: {}", self.config.name, err);
                self.spawnerr = Some(err.to_string());
                self.fail_start(poller);
            }
        }
    }

    fn try_spawn(&mut self, poller: &mut Poller) -> Result<(), SpawnError> {
        let executable = resolve_command(&self.config.command[0])?;

        // Everything the child needs is materialized before fork; the child
        // only performs raw syscalls between fork and exec.
        let argv: Vec<CString> = self
            .config
            .command
            .iter()
            .map(|arg| CString::new(arg.as_str()).unwrap_or_default())
            .collect();
        let path_c = CString::new(executable.as_os_str().as_encoded_bytes())
            .map_err(|_| SpawnError::CommandNotFound(self.config.command[0].clone()))?;
        let envp = child_environment();
        let ids = self.resolve_child_ids();

        let (stdout_rx, stdout_wr) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::PipeSetup)?;
        let stderr_pair = if self.config.log_stderr {
            Some(pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::PipeSetup)?)
        } else {
            None
        };
        let (err_rx, err_wr) = pipe2(OFlag::O_CLOEXEC).map_err(SpawnError::PipeSetup)?;

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let stderr_fd = stderr_pair.as_ref().map(|(_, wr)| wr.as_raw_fd());
                exec_child(
                    &path_c,
                    &argv,
                    &envp,
                    stdout_wr.as_raw_fd(),
                    stderr_fd,
                    err_wr.as_raw_fd(),
                    ids,
                    self.policy.umask,
                );
            }
            Ok(ForkResult::Parent { child }) => {
                drop(stdout_wr);
                drop(err_wr);

                set_nonblocking(stdout_rx.as_raw_fd()).map_err(SpawnError::PipeSetup)?;
                poller.register(
                    stdout_rx.as_raw_fd(),
                    Token::Child {
                        process: self.id,
                        stream: StreamKind::Stdout,
                    },
                    Interest::READ,
                );
                self.stdout = Some(OutputDispatcher::new(stdout_rx));

                if let Some((stderr_rx, stderr_wr)) = stderr_pair {
                    drop(stderr_wr);
                    set_nonblocking(stderr_rx.as_raw_fd()).map_err(SpawnError::PipeSetup)?;
                    poller.register(
                        stderr_rx.as_raw_fd(),
                        Token::Child {
                            process: self.id,
                            stream: StreamKind::Stderr,
                        },
                        Interest::READ,
                    );
                    self.stderr = Some(OutputDispatcher::new(stderr_rx));
                }

                let _ = set_nonblocking(err_rx.as_raw_fd());
                self.exec_err_rx = Some(err_rx);

                self.pid = Some(child);
                self.started_at = Some(Utc::now());
                self.spawned_instant = Some(Instant::now());
                self.transition(ProcessState::Starting);
                info!("{}: spawned pid {}", self.config.name, child);

                if self.config.startsecs == 0 {
                    self.retries = 0;
                    self.transition(ProcessState::Running);
                } else {
                    self.startup_timer = Some(poller.arm_timer(
                        Duration::from_secs(self.config.startsecs),
                        TimerKind::StartupCheck { process: self.id },
                    ));
                }
                Ok(())
            }
            Err(errno) => Err(SpawnError::ForkFailed {
                service: self.config.name.clone(),
                errno,
            }),
        }
    }

    fn resolve_child_ids(&self) -> Option<(Uid, Gid)> {
        let name = self.config.user.as_deref()?;
        if !Uid::effective().is_root() {
            warn!(
                "{}: ignoring user '{}' (supervisor is not root)",
                self.config.name, name
            );
            return None;
        }
        match nix::unistd::User::from_name(name) {
            Ok(Some(user)) => Some((user.uid, user.gid)),
            Ok(None) => {
                warn!("{}: unknown user '{}'", self.config.name, name);
                None
            }
            Err(err) => {
                warn!("{}: user lookup failed: {}", self.config.name, err);
                None
            }
        }
    }

    /// Pumps one ready output stream; deregisters it at EOF.
    pub fn on_stream_ready(&mut self, stream: StreamKind, poller: &mut Poller) {
        let name = self.config.name.clone();
        let (slot, sink) = match stream {
            StreamKind::Stdout => (&mut self.stdout, self.log.as_mut()),
            StreamKind::Stderr => (&mut self.stderr, self.log.as_mut()),
        };
        if let Some(dispatcher) = slot
            && dispatcher.pump(&name, sink) == Pump::Eof
        {
            poller.deregister(dispatcher.fd());
            *slot = None;
        }
    }

    /// Final drain of both streams; used at teardown and removal.
    fn close_streams(&mut self, poller: &mut Poller) {
        let name = self.config.name.clone();
        for slot in [&mut self.stdout, &mut self.stderr] {
            if let Some(dispatcher) = slot.take() {
                poller.deregister(dispatcher.fd());
                let mut dispatcher = dispatcher;
                let _ = dispatcher.drain(&name, self.log.as_mut());
            }
        }
    }

    /// Tears the record down: drains streams and removes an AUTO log.
    pub fn teardown(&mut self, poller: &mut Poller) {
        self.close_streams(poller);
        self.cancel_startup_timer(poller);
        self.cancel_backoff_timer(poller);
        self.cancel_kill_timer(poller);
        if matches!(self.config.logfile, LogPolicy::Auto)
            && let Some(log) = &mut self.log
        {
            let path = log.path().to_path_buf();
            let _ = log.clear();
            let _ = fs::remove_file(path);
        }
    }

    fn take_exec_error(&mut self) -> Option<Errno> {
        let fd = self.exec_err_rx.take()?;
        let mut byte = [0u8; 1];
        match nix::unistd::read(fd.as_raw_fd(), &mut byte) {
            Ok(1) => Some(Errno::from_raw(i32::from(byte[0]))),
            _ => None,
        }
    }

    fn cancel_startup_timer(&mut self, poller: &mut Poller) {
        if let Some(id) = self.startup_timer.take() {
            poller.cancel_timer(id);
        }
    }

    fn cancel_backoff_timer(&mut self, poller: &mut Poller) {
        if let Some(id) = self.backoff_timer.take() {
            poller.cancel_timer(id);
        }
    }

    fn cancel_kill_timer(&mut self, poller: &mut Poller) {
        if let Some(id) = self.kill_timer.take() {
            poller.cancel_timer(id);
        }
    }

    /// Builds the RPC-facing info record.
    pub fn info(&self) -> ProcessInfo {
        let logfile = self.log.as_ref().map(|l| l.path().display().to_string());
        ProcessInfo {
            name: self.config.name.clone(),
            state: self.state,
            statecode: self.state.code(),
            description: self.describe(),
            pid: self.pid.map(|p| p.as_raw()),
            start: self.started_at.map(|t| t.timestamp()),
            stop: self.stopped_at.map(|t| t.timestamp()),
            exitstatus: self.last_exit_code,
            spawnerr: self.spawnerr.clone(),
            logfile,
        }
    }

    fn describe(&self) -> String {
        match self.state {
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping => {
                let uptime = self
                    .spawned_instant
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                match self.pid {
                    Some(pid) => {
                        format!("pid {}, uptime {}", pid, format_uptime(uptime))
                    }
                    None => format!("uptime {}", format_uptime(uptime)),
                }
            }
            ProcessState::Exited => match self.last_exit_code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            },
            ProcessState::Backoff => self
                .spawnerr
                .clone()
                .unwrap_or_else(|| "exited too quickly".to_string()),
            ProcessState::Fatal => self
                .spawnerr
                .clone()
                .unwrap_or_else(|| "gave up after repeated failed starts".to_string()),
            ProcessState::Stopped => match self.stopped_at {
                Some(at) => format!("stopped at {}", at.format("%Y-%m-%d %H:%M:%S")),
                None => "Not started".to_string(),
            },
            ProcessState::Unknown => "state unknown".to_string(),
        }
    }
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Builds the child environment: the parent's environment plus the marker.
fn child_environment() -> Vec<CString> {
    let mut envp: Vec<CString> = std::env::vars()
        .filter(|(key, _)| key != "SUPERVISOR_ENABLED")
        .filter_map(|(key, value)| CString::new(format!("{key}={value}")).ok())
        .collect();
    envp.push(
        CString::new(CHILD_ENV_MARKER).unwrap_or_default(),
    );
    envp
}

/// Resolves argv[0]: used verbatim when qualified, otherwise searched on
/// `PATH`.
pub fn resolve_command(command: &str) -> Result<PathBuf, SpawnError> {
    let direct = Path::new(command);
    if command.contains('/') {
        if is_executable(direct) {
            return Ok(direct.to_path_buf());
        }
        return Err(SpawnError::CommandNotFound(command.to_string()));
    }

    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(command);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }
    Err(SpawnError::CommandNotFound(command.to_string()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Child-side half of the spawn contract. Runs between fork and exec and
/// never returns; any failure is reported as one errno byte on the error
/// pipe before `_exit`.
fn exec_child(
    path: &CString,
    argv: &[CString],
    envp: &[CString],
    stdout_wr: RawFd,
    stderr_wr: Option<RawFd>,
    err_wr: RawFd,
    ids: Option<(Uid, Gid)>,
    umask_bits: u32,
) -> ! {
    // Raw syscalls only between fork and exec.
    fn dup_onto(old: RawFd, new: RawFd) -> Result<(), Errno> {
        if unsafe { libc::dup2(old, new) } < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    let result: Result<std::convert::Infallible, Errno> = (|| {
        // Detach from the controlling terminal. Failure (already a session
        // leader) is harmless.
        let _ = setsid();

        let devnull = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
        if devnull < 0 {
            return Err(Errno::last());
        }
        dup_onto(devnull, libc::STDIN_FILENO)?;
        dup_onto(stdout_wr, libc::STDOUT_FILENO)?;
        match stderr_wr {
            Some(fd) => dup_onto(fd, libc::STDERR_FILENO)?,
            None => dup_onto(devnull, libc::STDERR_FILENO)?,
        }

        if let Some((uid, gid)) = ids {
            setgid(gid)?;
            setuid(uid)?;
        }

        nix::sys::stat::umask(Mode::from_bits_truncate(umask_bits));
        execve(path, argv, envp)?;
        unreachable!("execve returned without error");
    })();

    let errno = match result {
        Err(errno) => errno as i32,
        Ok(never) => match never {},
    };
    let byte = errno.clamp(0, 255) as u8;
    unsafe {
        libc::write(err_wr, &byte as *const u8 as *const libc::c_void, 1);
        libc::_exit(127);
    }
}
