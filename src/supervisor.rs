//! The top-level coordinator: owns the Process registry, drives the event
//! loop, and sequences startup, reload, rotation, and shutdown.

use std::{
    collections::HashSet,
    io,
    path::PathBuf,
    time::Duration,
};

use nix::sys::{
    signal::Signal,
    wait::{WaitPidFlag, WaitStatus, waitpid},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ProgramConfig, ServerConfig, load_config},
    daemonize::Pidfile,
    error::DaemonError,
    logger::ActivityLog,
    poller::{Poller, Readiness, StreamKind, TimerKind, Token},
    process::{Process, RestartPolicy},
    rpc::{RpcServer, Waiter},
    signals::SignalPipe,
};

/// Upper bound on one readiness wait. Keeps reaping and shutdown progress
/// moving even if a wakeup is lost.
const HEARTBEAT: Duration = Duration::from_secs(1);

/// Coarse supervisor lifecycle state reported by `supervisor.getState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Normal operation.
    Running,
    /// A `restart()` control call is in flight.
    Restarting,
    /// Shutdown has been initiated.
    Shutdown,
}

impl SupervisorState {
    /// Numeric state code reported over RPC.
    pub fn code(self) -> i32 {
        match self {
            SupervisorState::Restarting => 0,
            SupervisorState::Running => 1,
            SupervisorState::Shutdown => -1,
        }
    }

    /// State name reported over RPC.
    pub fn name(self) -> &'static str {
        match self {
            SupervisorState::Restarting => "RESTARTING",
            SupervisorState::Running => "RUNNING",
            SupervisorState::Shutdown => "SHUTDOWN",
        }
    }
}

/// Phase of an in-flight `restart()` control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    /// Waiting for every Process to reach a resting state.
    Stopping,
    /// Waiting for the restarted set to settle.
    Starting,
}

/// The supervisor daemon.
pub struct Supervisor {
    pub(crate) config: ServerConfig,
    pub(crate) config_path: PathBuf,
    pub(crate) activity: ActivityLog,
    pub(crate) processes: Vec<Process>,
    pub(crate) poller: Poller,
    pub(crate) signals: SignalPipe,
    pub(crate) rpc: Option<RpcServer>,
    pub(crate) waiters: Vec<Waiter>,
    pub(crate) state: SupervisorState,
    pub(crate) pending_restart: Option<RestartPhase>,
    pub(crate) done: bool,
    pidfile: Option<Pidfile>,
    doomed: HashSet<u32>,
    pending_adds: Vec<ProgramConfig>,
    next_process_id: u32,
}

impl Supervisor {
    /// Builds a supervisor from an effective config snapshot: installs the
    /// signal dispatcher, binds the control socket, and constructs the
    /// Process registry. Nothing is spawned yet.
    pub fn new(
        config: ServerConfig,
        config_path: PathBuf,
        activity: ActivityLog,
    ) -> Result<Self, DaemonError> {
        let mut poller = Poller::new();

        let signals = SignalPipe::install().map_err(io::Error::from)?;
        poller.register(signals.fd(), Token::Signal, crate::poller::Interest::READ);

        let rpc = match &config.http_port {
            Some(addr) => {
                let server = RpcServer::bind(addr, &config)?;
                poller.register(
                    server.fd(),
                    Token::RpcListener,
                    crate::poller::Interest::READ,
                );
                Some(server)
            }
            None => None,
        };

        let policy = RestartPolicy::from_config(&config);
        let mut processes = Vec::with_capacity(config.programs.len());
        let mut next_process_id = 1;
        for program in &config.programs {
            processes.push(Process::new(
                next_process_id,
                program.clone(),
                policy,
                &config.childlogdir,
            ));
            next_process_id += 1;
        }

        Ok(Supervisor {
            config,
            config_path,
            activity,
            processes,
            poller,
            signals,
            rpc,
            waiters: Vec::new(),
            state: SupervisorState::Running,
            pending_restart: None,
            done: false,
            pidfile: None,
            doomed: HashSet::new(),
            pending_adds: Vec::new(),
            next_process_id,
        })
    }

    /// Hands the acquired pidfile to the supervisor for removal at shutdown.
    pub fn set_pidfile(&mut self, pidfile: Pidfile) {
        self.pidfile = Some(pidfile);
    }

    /// Runs until shutdown completes, then releases shared resources.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            "supervisor started with {} program(s), pid {}",
            self.processes.len(),
            std::process::id()
        );
        self.start_all(true);

        while !self.done {
            self.run_once()?;
        }

        self.finalize();
        Ok(())
    }

    /// One loop turn: wait for readiness, fire timers, dispatch handlers,
    /// reap, and settle pending lifecycle work.
    pub fn run_once(&mut self) -> io::Result<()> {
        let turn = self.poller.turn(Some(HEARTBEAT))?;
        // Deaths are acknowledged before timers fire so a startup-confirm
        // timer never promotes an already-dead child.
        self.reap();
        for kind in turn.expired {
            self.handle_timer(kind);
        }
        for (token, readiness) in turn.ready {
            self.handle_ready(token, readiness);
        }
        self.reap();
        self.settle();
        Ok(())
    }

    /// Process ids ordered for starting: ascending priority, then name.
    pub(crate) fn start_order(&self) -> Vec<u32> {
        let mut order: Vec<(i32, String, u32)> = self
            .processes
            .iter()
            .map(|p| (p.priority(), p.name().to_string(), p.id))
            .collect();
        order.sort();
        order.into_iter().map(|(_, _, id)| id).collect()
    }

    fn handle_timer(&mut self, kind: TimerKind) {
        let id = match kind {
            TimerKind::Backoff { process }
            | TimerKind::KillEscalation { process }
            | TimerKind::StartupCheck { process } => process,
        };
        let poller = &mut self.poller;
        if let Some(process) = self.processes.iter_mut().find(|p| p.id == id) {
            process.on_timer(kind, poller);
        } else {
            debug!("timer {kind:?} for a process that no longer exists");
        }
    }

    fn handle_ready(&mut self, token: Token, readiness: Readiness) {
        match token {
            Token::Signal => {
                let signals = self.signals.drain();
                for signal in signals {
                    self.handle_signal(signal);
                }
            }
            Token::Child { process, stream } => {
                self.handle_child_output(process, stream, readiness);
            }
            Token::RpcListener => self.handle_rpc_accept(),
            Token::RpcClient { session } => self.handle_rpc_client(session, readiness),
        }
    }

    fn handle_child_output(&mut self, id: u32, stream: StreamKind, readiness: Readiness) {
        let poller = &mut self.poller;
        if let Some(process) = self.processes.iter_mut().find(|p| p.id == id) {
            if readiness.readable || readiness.hangup || readiness.error {
                process.on_stream_ready(stream, poller);
            }
        } else {
            debug!("output readiness for a process that no longer exists");
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::SIGCHLD => self.reap(),
            Signal::SIGHUP => {
                info!("received SIGHUP, reloading configuration");
                self.reload();
            }
            Signal::SIGUSR2 => {
                info!("received SIGUSR2, rotating logs");
                self.rotate_all();
            }
            Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT => {
                info!("received {signal}, shutting down");
                self.initiate_shutdown();
            }
            other => debug!("ignoring signal {other}"),
        }
    }

    /// Non-blocking wait over every known pid, delivering exits to their
    /// state machines.
    pub(crate) fn reap(&mut self) {
        for i in 0..self.processes.len() {
            let Some(pid) = self.processes[i].pid() else {
                continue;
            };
            if !self.processes[i].state().has_pid() {
                // Core invariant: a pid exists only in STARTING/RUNNING/
                // STOPPING. Falling out of it means the machine is corrupt.
                error!(
                    "invariant violation: '{}' holds pid {} in state {}; shutting down",
                    self.processes[i].name(),
                    pid,
                    self.processes[i].state()
                );
                self.initiate_shutdown();
                return;
            }
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!("reaped pid {pid} (exit {code})");
                    self.processes[i].on_reaped(Some(code), None, &mut self.poller);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!("reaped pid {pid} (killed by {signal})");
                    self.processes[i].on_reaped(None, Some(signal), &mut self.poller);
                }
                Ok(_) => {}
                Err(nix::errno::Errno::ECHILD) => {
                    warn!("pid {pid} vanished before it could be reaped");
                    self.processes[i].on_reaped(None, None, &mut self.poller);
                }
                Err(err) => warn!("waitpid({pid}) failed: {err}"),
            }
        }
    }

    /// True once the loop has been left after a completed shutdown.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Current state of a named Process.
    pub fn process_state(&self, name: &str) -> Option<crate::process::ProcessState> {
        self.processes
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.state())
    }

    /// Info record for a named Process.
    pub fn process_info(&self, name: &str) -> Option<crate::process::ProcessInfo> {
        self.processes
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.info())
    }

    /// Info records for every Process, in start order.
    pub fn all_process_info(&self) -> Vec<crate::process::ProcessInfo> {
        self.start_order()
            .into_iter()
            .filter_map(|id| self.processes.iter().find(|p| p.id == id))
            .map(|p| p.info())
            .collect()
    }

    /// Starts processes in priority order. With `autostart_only`, skips
    /// programs configured not to start at boot.
    pub fn start_all(&mut self, autostart_only: bool) {
        for id in self.start_order() {
            let poller = &mut self.poller;
            if let Some(process) = self.processes.iter_mut().find(|p| p.id == id) {
                if autostart_only && !process.autostart() {
                    continue;
                }
                process.start(poller);
            }
        }
    }

    /// Stops processes in reverse priority order.
    pub fn stop_all(&mut self) {
        for id in self.start_order().into_iter().rev() {
            let poller = &mut self.poller;
            if let Some(process) = self.processes.iter_mut().find(|p| p.id == id) {
                process.stop(poller);
            }
        }
    }

    /// Begins shutdown: stop everything; the loop exits once every Process
    /// is at rest.
    pub fn initiate_shutdown(&mut self) {
        if self.state != SupervisorState::Shutdown {
            self.state = SupervisorState::Shutdown;
            self.pending_restart = None;
            for process in &mut self.processes {
                process.suppress_respawn();
            }
            self.stop_all();
        }
    }

    /// Re-parses the config file and diffs the program set by name. Server-
    /// wide settings keep their boot values; a parse error keeps the old
    /// config entirely.
    pub fn reload(&mut self) {
        let new_config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                error!("reload failed: {err}; keeping the existing configuration");
                return;
            }
        };

        let mut kept = 0usize;
        let mut incoming: Vec<ProgramConfig> = new_config.programs;

        for process in &mut self.processes {
            match incoming.iter().position(|p| p.name == process.name()) {
                Some(idx) if incoming[idx] == *process.config() => {
                    // Unchanged: leave it alone (a reload with an unchanged
                    // file must not restart anything).
                    incoming.remove(idx);
                    kept += 1;
                }
                Some(idx) => {
                    let replacement = incoming.remove(idx);
                    info!("program '{}' changed; restarting it", replacement.name);
                    self.doomed.insert(process.id);
                    self.pending_adds.push(replacement);
                    process.suppress_respawn();
                    process.stop(&mut self.poller);
                }
                None => {
                    info!("program '{}' removed from config", process.name());
                    self.doomed.insert(process.id);
                    process.suppress_respawn();
                    process.stop(&mut self.poller);
                }
            }
        }

        let added = incoming.len();
        for program in incoming {
            info!("program '{}' added by reload", program.name);
            self.add_process(program, true);
        }

        self.config.programs = self
            .processes
            .iter()
            .filter(|p| !self.doomed.contains(&p.id))
            .map(|p| p.config().clone())
            .collect();
        info!(
            "reload complete: {kept} kept, {added} added, {} stopping",
            self.doomed.len()
        );
    }

    /// Creates a Process for `program` and optionally starts it per its
    /// autostart flag.
    fn add_process(&mut self, program: ProgramConfig, start_now: bool) {
        let id = self.next_process_id;
        self.next_process_id += 1;
        let policy = RestartPolicy::from_config(&self.config);
        let mut process = Process::new(id, program, policy, &self.config.childlogdir);
        if start_now && process.autostart() {
            process.start(&mut self.poller);
        }
        self.processes.push(process);
    }

    /// Forces rotation of the activity log and every child log.
    pub fn rotate_all(&mut self) {
        if let Err(err) = self.activity.rotate() {
            warn!("activity log rotation failed: {err}");
        }
        for process in &mut self.processes {
            if let Some(log) = process.log_mut()
                && let Err(err) = log.rotate()
            {
                warn!("log rotation for '{}' failed: {}", process.name(), err);
            }
        }
    }

    /// Post-dispatch bookkeeping: doomed-process removal, restart-task
    /// phases, shutdown completion, and parked RPC waiters.
    fn settle(&mut self) {
        self.remove_doomed();
        self.advance_restart();

        if self.state == SupervisorState::Shutdown
            && !self.done
            && self.processes.iter().all(|p| p.state().is_resting())
        {
            info!("all processes at rest; leaving the event loop");
            self.done = true;
        }

        self.check_waiters();
    }

    fn remove_doomed(&mut self) {
        if self.doomed.is_empty() {
            return;
        }
        let poller = &mut self.poller;
        let doomed = &mut self.doomed;
        let mut removed = Vec::new();
        self.processes.retain_mut(|process| {
            if doomed.contains(&process.id) && process.state().is_resting() {
                process.teardown(poller);
                doomed.remove(&process.id);
                removed.push(process.name().to_string());
                false
            } else {
                true
            }
        });

        for name in removed {
            // A changed program respawns once its predecessor is gone.
            if let Some(idx) = self.pending_adds.iter().position(|p| p.name == name) {
                let program = self.pending_adds.remove(idx);
                self.add_process(program, true);
            }
        }
    }

    fn advance_restart(&mut self) {
        match self.pending_restart {
            Some(RestartPhase::Stopping) => {
                if self.processes.iter().all(|p| p.state().is_resting()) {
                    info!("restart: stop phase complete, starting all programs");
                    self.start_all(false);
                    self.pending_restart = Some(RestartPhase::Starting);
                }
            }
            Some(RestartPhase::Starting) => {
                let settled = self.processes.iter().all(|p| {
                    !matches!(
                        p.state(),
                        crate::process::ProcessState::Starting
                            | crate::process::ProcessState::Stopping
                            | crate::process::ProcessState::Backoff
                    )
                });
                if settled {
                    info!("restart complete");
                    self.pending_restart = None;
                    self.state = SupervisorState::Running;
                }
            }
            None => {}
        }
    }

    /// Releases shared resources on the way out: the control socket and the
    /// pidfile.
    fn finalize(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            rpc.unlink();
        }
        if let Some(pidfile) = self.pidfile.take() {
            pidfile.remove();
        }
        info!("supervisor exiting");
    }
}
