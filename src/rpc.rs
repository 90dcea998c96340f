//! The RPC control surface: an HTTP/1.0 request-per-connection server on the
//! event loop, speaking JSON call envelopes with Basic authentication.
//!
//! A request body is `{"method": "supervisor.startProcess", "params": [...]}`
//! and a response body is either `{"result": ...}` or
//! `{"fault": {"code": N, "message": "..."}}`. `system.multicall` maps a
//! sequence of envelopes to a matching sequence of responses in order.
//! Dispatch goes through an explicit method registry populated at startup.

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::TcpListener,
    net::TcpStream,
    os::fd::{AsRawFd, RawFd},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    config::{ListenAddr, ServerConfig},
    daemonize::apply_socket_access,
    error::{FaultCode, ResourceError, RpcFault},
    logger::LogFile,
    poller::{Interest, Readiness, Token},
    process::{Process, ProcessState},
    supervisor::{RestartPhase, Supervisor, SupervisorState},
};

/// Requests larger than this are rejected outright.
const MAX_REQUEST_BYTES: usize = 256 * 1024;

/// Basic-auth realm in the 401 challenge.
const AUTH_REALM: &str = "taskmaster";

/// One entry in the explicit method registry.
pub struct MethodSpec {
    /// Fully qualified `namespace.method` name.
    pub name: &'static str,
    /// Signature summary, return type first.
    pub signature: &'static str,
    /// One-line help text.
    pub help: &'static str,
}

/// The full control surface, iterated by the `system` namespace methods.
pub const METHODS: &[MethodSpec] = &[
    MethodSpec {
        name: "system.listMethods",
        signature: "array listMethods()",
        help: "Return the names of every available method.",
    },
    MethodSpec {
        name: "system.methodHelp",
        signature: "string methodHelp(string name)",
        help: "Return the help text for a method.",
    },
    MethodSpec {
        name: "system.methodSignature",
        signature: "string methodSignature(string name)",
        help: "Return the signature of a method.",
    },
    MethodSpec {
        name: "system.multicall",
        signature: "array multicall(array calls)",
        help: "Run several calls in one request; responses match call order.",
    },
    MethodSpec {
        name: "supervisor.getVersion",
        signature: "string getVersion()",
        help: "Return the supervisor version.",
    },
    MethodSpec {
        name: "supervisor.getPID",
        signature: "int getPID()",
        help: "Return the supervisor's pid.",
    },
    MethodSpec {
        name: "supervisor.getState",
        signature: "struct getState()",
        help: "Return the supervisor state as {statecode, statename}.",
    },
    MethodSpec {
        name: "supervisor.getProcessInfo",
        signature: "struct getProcessInfo(string name)",
        help: "Return the info record for one process.",
    },
    MethodSpec {
        name: "supervisor.getAllProcessInfo",
        signature: "array getAllProcessInfo()",
        help: "Return info records for every process, in priority order.",
    },
    MethodSpec {
        name: "supervisor.startProcess",
        signature: "boolean startProcess(string name, boolean wait=true)",
        help: "Start a process; with wait, respond once it is running.",
    },
    MethodSpec {
        name: "supervisor.stopProcess",
        signature: "boolean stopProcess(string name, boolean wait=true)",
        help: "Stop a process; with wait, respond once it has stopped.",
    },
    MethodSpec {
        name: "supervisor.startAllProcesses",
        signature: "boolean startAllProcesses(boolean wait=true)",
        help: "Start every process in priority order.",
    },
    MethodSpec {
        name: "supervisor.stopAllProcesses",
        signature: "boolean stopAllProcesses(boolean wait=true)",
        help: "Stop every process in reverse priority order.",
    },
    MethodSpec {
        name: "supervisor.restart",
        signature: "boolean restart()",
        help: "Stop all processes, then start them again; responds when done.",
    },
    MethodSpec {
        name: "supervisor.shutdown",
        signature: "boolean shutdown()",
        help: "Shut the supervisor down.",
    },
    MethodSpec {
        name: "supervisor.readProcessLog",
        signature: "string readProcessLog(string name, int offset, int length)",
        help: "Read bytes from a process log.",
    },
    MethodSpec {
        name: "supervisor.tailProcessLog",
        signature: "array tailProcessLog(string name, int offset, int length)",
        help: "Tail a process log: returns [bytes, offset, overflow].",
    },
    MethodSpec {
        name: "supervisor.clearProcessLog",
        signature: "boolean clearProcessLog(string name)",
        help: "Truncate a process log and remove its backups.",
    },
    MethodSpec {
        name: "supervisor.clearAllProcessLogs",
        signature: "boolean clearAllProcessLogs()",
        help: "Clear every process log.",
    },
    MethodSpec {
        name: "supervisor.readLog",
        signature: "string readLog(int offset, int length)",
        help: "Read bytes from the supervisor's activity log.",
    },
    MethodSpec {
        name: "supervisor.clearLog",
        signature: "boolean clearLog()",
        help: "Truncate the activity log.",
    },
];

/// A call envelope as found in a request body.
#[derive(Debug, Deserialize)]
pub struct CallEnvelope {
    /// `namespace.method`.
    #[serde(alias = "methodName")]
    pub method: String,
    /// Ordered arguments.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// What waking a parked session is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitGoal {
    /// A single process reaching RUNNING (or failing to).
    Started(u32),
    /// A single process coming to rest.
    Stopped(u32),
    /// Every listed process settling after a start-all.
    AllStarted(Vec<u32>),
    /// Every process coming to rest.
    AllStopped,
    /// An in-flight `restart()` completing.
    Restarted,
}

/// A parked `wait=true` call.
#[derive(Debug)]
pub struct Waiter {
    /// Session that owns the pending response.
    pub session: u64,
    /// Condition that resolves it.
    pub goal: WaitGoal,
}

/// Result of dispatching one call.
enum Outcome {
    /// A complete response envelope.
    Reply(Value),
    /// The response is deferred until the goal resolves.
    Park(WaitGoal),
}

/// Result of routing one HTTP request.
enum Routed {
    Respond(Vec<u8>),
    Park(WaitGoal),
}

/// Either transport the listener can speak.
enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// An accepted client connection.
pub(crate) enum ClientStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(s) => s.read(buf),
            ClientStream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(s) => s.write(buf),
            ClientStream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Unix(s) => s.flush(),
            ClientStream::Tcp(s) => s.flush(),
        }
    }
}

/// Per-connection state.
pub(crate) struct Session {
    pub stream: ClientStream,
    pub fd: RawFd,
    pub read_buf: Vec<u8>,
    pub write_buf: Vec<u8>,
    pub written: usize,
    pub parked: bool,
}

/// The RPC listener plus its sessions.
pub struct RpcServer {
    listener: Listener,
    socket_path: Option<PathBuf>,
    credentials: Option<(String, String)>,
    pub(crate) sessions: HashMap<u64, Session>,
    next_session: u64,
}

impl RpcServer {
    /// Binds the configured transport, applying socket mode/ownership on a
    /// UNIX path.
    pub fn bind(addr: &ListenAddr, config: &ServerConfig) -> Result<Self, ResourceError> {
        let bind_err = |source: io::Error| ResourceError::Bind {
            address: addr.to_string(),
            source,
        };

        let (listener, socket_path) = match addr {
            ListenAddr::Unix(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                listener.set_nonblocking(true).map_err(bind_err)?;
                apply_socket_access(path, config.sockchmod, config.sockchown.as_deref())?;
                (Listener::Unix(listener), Some(path.clone()))
            }
            ListenAddr::Inet(spec) => {
                let listener = TcpListener::bind(spec.as_str()).map_err(bind_err)?;
                listener.set_nonblocking(true).map_err(bind_err)?;
                (Listener::Tcp(listener), None)
            }
        };

        let credentials = match (&config.http_username, &config.http_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        Ok(RpcServer {
            listener,
            socket_path,
            credentials,
            sessions: HashMap::new(),
            next_session: 1,
        })
    }

    /// Listener descriptor for the event loop.
    pub fn fd(&self) -> RawFd {
        match &self.listener {
            Listener::Unix(l) => l.as_raw_fd(),
            Listener::Tcp(l) => l.as_raw_fd(),
        }
    }

    /// Accepts one pending connection, if any.
    pub(crate) fn accept(&mut self) -> io::Result<Option<(u64, RawFd)>> {
        let stream = match &self.listener {
            Listener::Unix(l) => match l.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    ClientStream::Unix(stream)
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err),
            },
            Listener::Tcp(l) => match l.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    ClientStream::Tcp(stream)
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err),
            },
        };

        let fd = match &stream {
            ClientStream::Unix(s) => s.as_raw_fd(),
            ClientStream::Tcp(s) => s.as_raw_fd(),
        };
        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(
            id,
            Session {
                stream,
                fd,
                read_buf: Vec::new(),
                write_buf: Vec::new(),
                written: 0,
                parked: false,
            },
        );
        Ok(Some((id, fd)))
    }

    /// Checks HTTP Basic credentials against the configured pair.
    pub fn check_auth(&self, authorization: Option<&str>) -> bool {
        let Some((user, pass)) = &self.credentials else {
            return true;
        };
        let Some(value) = authorization else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return false;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            return false;
        };
        text.split_once(':') == Some((user.as_str(), pass.as_str()))
    }

    /// Unlinks a UNIX socket path at shutdown.
    pub fn unlink(&self) {
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A fully framed HTTP request.
#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    authorization: Option<String>,
    body: Vec<u8>,
}

enum HttpParse {
    Incomplete,
    Malformed,
    Ready(HttpRequest),
}

fn parse_http(buf: &[u8]) -> HttpParse {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    let header_len = match request.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return HttpParse::Incomplete,
        Err(_) => return HttpParse::Malformed,
    };

    let mut content_length = 0usize;
    let mut authorization = None;
    for header in request.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let Ok(text) = std::str::from_utf8(header.value) else {
                return HttpParse::Malformed;
            };
            let Ok(len) = text.trim().parse::<usize>() else {
                return HttpParse::Malformed;
            };
            content_length = len;
        } else if header.name.eq_ignore_ascii_case("authorization") {
            authorization = std::str::from_utf8(header.value)
                .ok()
                .map(|s| s.trim().to_string());
        }
    }

    if content_length > MAX_REQUEST_BYTES {
        return HttpParse::Malformed;
    }
    if buf.len() < header_len + content_length {
        return HttpParse::Incomplete;
    }

    HttpParse::Ready(HttpRequest {
        method: request.method.unwrap_or_default().to_string(),
        path: request.path.unwrap_or_default().to_string(),
        authorization,
        body: buf[header_len..header_len + content_length].to_vec(),
    })
}

fn http_response(status: &str, extra_headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.0 {status}\r\nServer: taskmaster/{}\r\nContent-Length: {}\r\n",
        env!("CARGO_PKG_VERSION"),
        body.len()
    );
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

fn json_response(envelope: &Value) -> Vec<u8> {
    let body = envelope.to_string().into_bytes();
    http_response(
        "200 OK",
        &[("Content-Type", "application/json".to_string())],
        &body,
    )
}

fn unauthorized_response() -> Vec<u8> {
    http_response(
        "401 Unauthorized",
        &[(
            "WWW-Authenticate",
            format!("Basic realm=\"{AUTH_REALM}\""),
        )],
        b"401 Unauthorized",
    )
}

fn not_found_response() -> Vec<u8> {
    http_response("404 Not Found", &[], b"404 Not Found")
}

fn bad_request_response() -> Vec<u8> {
    http_response("400 Bad Request", &[], b"400 Bad Request")
}

fn result_envelope(value: Value) -> Value {
    json!({ "result": value })
}

fn fault_envelope(fault: &RpcFault) -> Value {
    json!({ "fault": { "code": fault.code as i64, "message": fault.message } })
}

fn reply(value: Value) -> Outcome {
    Outcome::Reply(result_envelope(value))
}

fn fail(code: FaultCode, detail: impl AsRef<str>) -> Outcome {
    Outcome::Reply(fault_envelope(&RpcFault::new(code, detail)))
}

fn param_str(call: &CallEnvelope, idx: usize) -> Result<String, RpcFault> {
    call.params
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            RpcFault::new(
                FaultCode::BadArguments,
                format!("expected a string at position {idx}"),
            )
        })
}

fn param_i64(call: &CallEnvelope, idx: usize) -> Result<i64, RpcFault> {
    call.params
        .get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            RpcFault::new(
                FaultCode::BadArguments,
                format!("expected an integer at position {idx}"),
            )
        })
}

fn opt_bool(call: &CallEnvelope, idx: usize, default: bool) -> Result<bool, RpcFault> {
    match call.params.get(idx) {
        None => Ok(default),
        Some(value) => value.as_bool().ok_or_else(|| {
            RpcFault::new(
                FaultCode::BadArguments,
                format!("expected a boolean at position {idx}"),
            )
        }),
    }
}

/// Evaluates a wait goal against the current registry. `None` keeps waiting.
fn evaluate_goal(
    goal: &WaitGoal,
    processes: &[Process],
    pending_restart: Option<RestartPhase>,
) -> Option<Result<Value, RpcFault>> {
    let by_id = |id: u32| processes.iter().find(|p| p.id == id);
    let settled = |p: &Process| {
        !matches!(
            p.state(),
            ProcessState::Starting | ProcessState::Stopping | ProcessState::Backoff
        )
    };

    match goal {
        WaitGoal::Started(id) => {
            let Some(process) = by_id(*id) else {
                return Some(Err(RpcFault::new(FaultCode::Failed, "process removed")));
            };
            match process.state() {
                ProcessState::Running => Some(Ok(Value::Bool(true))),
                ProcessState::Backoff | ProcessState::Fatal => Some(Err(RpcFault::new(
                    FaultCode::SpawnError,
                    process.info().spawnerr.unwrap_or_else(|| {
                        format!("{} exited before it was fully up", process.name())
                    }),
                ))),
                ProcessState::Exited | ProcessState::Stopped | ProcessState::Unknown => {
                    Some(Err(RpcFault::new(
                        FaultCode::AbnormalTermination,
                        process.name(),
                    )))
                }
                ProcessState::Starting | ProcessState::Stopping => None,
            }
        }
        WaitGoal::Stopped(id) => match by_id(*id) {
            None => Some(Ok(Value::Bool(true))),
            Some(process) if process.state().is_resting() => Some(Ok(Value::Bool(true))),
            Some(_) => None,
        },
        WaitGoal::AllStarted(ids) => {
            let all_settled = ids
                .iter()
                .all(|id| by_id(*id).map(&settled).unwrap_or(true));
            all_settled.then(|| Ok(Value::Bool(true)))
        }
        WaitGoal::AllStopped => processes
            .iter()
            .all(|p| p.state().is_resting())
            .then(|| Ok(Value::Bool(true))),
        WaitGoal::Restarted => pending_restart
            .is_none()
            .then(|| Ok(Value::Bool(true))),
    }
}

impl Supervisor {
    /// Accepts every pending connection on the listener.
    pub(crate) fn handle_rpc_accept(&mut self) {
        loop {
            let Some(rpc) = self.rpc.as_mut() else { return };
            match rpc.accept() {
                Ok(Some((session, fd))) => {
                    self.poller
                        .register(fd, Token::RpcClient { session }, Interest::READ);
                }
                Ok(None) => return,
                Err(err) => {
                    warn!("accept on control socket failed: {err}");
                    return;
                }
            }
        }
    }

    /// Drives one client connection: read, frame, dispatch, write.
    pub(crate) fn handle_rpc_client(&mut self, id: u64, readiness: Readiness) {
        let mut disconnected = readiness.error;
        let mut malformed = false;
        let mut request = None;

        {
            let Some(rpc) = self.rpc.as_mut() else { return };
            let Some(session) = rpc.sessions.get_mut(&id) else { return };

            if readiness.readable || readiness.hangup {
                let mut buf = [0u8; 4096];
                loop {
                    match session.stream.read(&mut buf) {
                        Ok(0) => {
                            disconnected = true;
                            break;
                        }
                        Ok(n) => {
                            session.read_buf.extend_from_slice(&buf[..n]);
                            if session.read_buf.len() > MAX_REQUEST_BYTES {
                                malformed = true;
                                break;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            debug!("control client read failed: {err}");
                            disconnected = true;
                            break;
                        }
                    }
                }
            }

            if !malformed && !session.parked && session.write_buf.is_empty() {
                match parse_http(&session.read_buf) {
                    HttpParse::Incomplete => {}
                    HttpParse::Malformed => malformed = true,
                    HttpParse::Ready(req) => {
                        session.read_buf.clear();
                        request = Some(req);
                    }
                }
            }
        }

        // A half-close after a complete request still gets its response;
        // anything else on a dead peer is dropped, cancelling parked
        // waiters with the session.
        if disconnected && request.is_none() {
            self.drop_session(id);
            return;
        }
        if malformed {
            self.queue_response(id, bad_request_response());
            return;
        }

        if let Some(req) = request {
            match self.route_request(req) {
                Routed::Respond(bytes) => self.queue_response(id, bytes),
                Routed::Park(goal) => {
                    if let Some(rpc) = self.rpc.as_mut()
                        && let Some(session) = rpc.sessions.get_mut(&id)
                    {
                        session.parked = true;
                    }
                    self.waiters.push(Waiter { session: id, goal });
                    // The goal may already hold.
                    self.check_waiters();
                }
            }
        } else if readiness.writable {
            self.flush_session(id);
        }
    }

    /// Removes a session and every waiter parked on it.
    pub(crate) fn drop_session(&mut self, id: u64) {
        if let Some(rpc) = self.rpc.as_mut()
            && let Some(session) = rpc.sessions.remove(&id)
        {
            self.poller.deregister(session.fd);
        }
        self.waiters.retain(|w| w.session != id);
    }

    fn queue_response(&mut self, id: u64, bytes: Vec<u8>) {
        {
            let Some(rpc) = self.rpc.as_mut() else { return };
            let Some(session) = rpc.sessions.get_mut(&id) else { return };
            session.write_buf.extend_from_slice(&bytes);
        }
        self.flush_session(id);
    }

    fn flush_session(&mut self, id: u64) {
        let (close, pending_fd) = {
            let Some(rpc) = self.rpc.as_mut() else { return };
            let Some(session) = rpc.sessions.get_mut(&id) else { return };
            let fd = session.fd;
            loop {
                if session.written >= session.write_buf.len() {
                    break (true, None);
                }
                match session.stream.write(&session.write_buf[session.written..]) {
                    Ok(0) => break (true, None),
                    Ok(n) => session.written += n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        break (false, Some(fd));
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!("control client write failed: {err}");
                        break (true, None);
                    }
                }
            }
        };

        if close {
            // One request per connection: a fully written response ends it.
            self.drop_session(id);
        } else if let Some(fd) = pending_fd {
            self.poller.set_interest(fd, Interest::READ_WRITE);
        }
    }

    /// Resolves any parked waiter whose goal now holds.
    pub(crate) fn check_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let mut resolved = Vec::new();
        {
            let processes = &self.processes;
            let pending = self.pending_restart;
            self.waiters.retain(|waiter| {
                match evaluate_goal(&waiter.goal, processes, pending) {
                    Some(outcome) => {
                        resolved.push((waiter.session, outcome));
                        false
                    }
                    None => true,
                }
            });
        }
        for (session, outcome) in resolved {
            let envelope = match outcome {
                Ok(value) => result_envelope(value),
                Err(fault) => fault_envelope(&fault),
            };
            if let Some(rpc) = self.rpc.as_mut()
                && let Some(record) = rpc.sessions.get_mut(&session)
            {
                record.parked = false;
            }
            self.queue_response(session, json_response(&envelope));
        }
    }

    fn route_request(&mut self, request: HttpRequest) -> Routed {
        let authorized = self
            .rpc
            .as_ref()
            .is_none_or(|rpc| rpc.check_auth(request.authorization.as_deref()));
        if !authorized {
            return Routed::Respond(unauthorized_response());
        }
        if request.method != "POST" || request.path != "/RPC2" {
            return Routed::Respond(not_found_response());
        }

        let call: CallEnvelope = match serde_json::from_slice(&request.body) {
            Ok(call) => call,
            Err(err) => {
                return Routed::Respond(json_response(&fault_envelope(&RpcFault::new(
                    FaultCode::IncorrectParameters,
                    err.to_string(),
                ))));
            }
        };

        match self.dispatch_call(&call, true) {
            Outcome::Reply(envelope) => Routed::Respond(json_response(&envelope)),
            Outcome::Park(goal) => Routed::Park(goal),
        }
    }

    /// Dispatches one call through the method registry. `allow_park` is
    /// false inside `system.multicall`, where wait flags are ignored.
    fn dispatch_call(&mut self, call: &CallEnvelope, allow_park: bool) -> Outcome {
        let method = call.method.as_str();

        if self.state == SupervisorState::Shutdown
            && matches!(
                method,
                "supervisor.startProcess"
                    | "supervisor.startAllProcesses"
                    | "supervisor.restart"
            )
        {
            return fail(FaultCode::ShutdownState, "supervisor is shutting down");
        }

        let result = match method {
            "system.listMethods" => Ok(self.rpc_list_methods()),
            "system.methodHelp" => self.rpc_method_help(call),
            "system.methodSignature" => self.rpc_method_signature(call),
            "system.multicall" => return self.rpc_multicall(call),
            "supervisor.getVersion" => {
                Ok(reply(Value::String(env!("CARGO_PKG_VERSION").to_string())))
            }
            "supervisor.getPID" => Ok(reply(json!(std::process::id()))),
            "supervisor.getState" => Ok(reply(json!({
                "statecode": self.state.code(),
                "statename": self.state.name(),
            }))),
            "supervisor.getProcessInfo" => self.rpc_process_info(call),
            "supervisor.getAllProcessInfo" => Ok(self.rpc_all_process_info()),
            "supervisor.startProcess" => self.rpc_start_process(call, allow_park),
            "supervisor.stopProcess" => self.rpc_stop_process(call, allow_park),
            "supervisor.startAllProcesses" => self.rpc_start_all(call, allow_park),
            "supervisor.stopAllProcesses" => self.rpc_stop_all(call, allow_park),
            "supervisor.restart" => Ok(self.rpc_restart(allow_park)),
            "supervisor.shutdown" => {
                self.initiate_shutdown();
                Ok(reply(Value::Bool(true)))
            }
            "supervisor.readProcessLog" => self.rpc_read_process_log(call),
            "supervisor.tailProcessLog" => self.rpc_tail_process_log(call),
            "supervisor.clearProcessLog" => self.rpc_clear_process_log(call),
            "supervisor.clearAllProcessLogs" => Ok(self.rpc_clear_all_process_logs()),
            "supervisor.readLog" => self.rpc_read_log(call),
            "supervisor.clearLog" => self.rpc_clear_log(),
            _ => {
                return fail(FaultCode::UnknownMethod, method);
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(fault) => Outcome::Reply(fault_envelope(&fault)),
        }
    }

    fn rpc_list_methods(&self) -> Outcome {
        let names: Vec<Value> = METHODS
            .iter()
            .map(|m| Value::String(m.name.to_string()))
            .collect();
        reply(Value::Array(names))
    }

    fn rpc_method_help(&self, call: &CallEnvelope) -> Result<Outcome, RpcFault> {
        let name = param_str(call, 0)?;
        match METHODS.iter().find(|m| m.name == name) {
            Some(spec) => Ok(reply(Value::String(spec.help.to_string()))),
            None => Err(RpcFault::new(FaultCode::UnknownMethod, name)),
        }
    }

    fn rpc_method_signature(&self, call: &CallEnvelope) -> Result<Outcome, RpcFault> {
        let name = param_str(call, 0)?;
        match METHODS.iter().find(|m| m.name == name) {
            Some(spec) => Ok(reply(Value::String(spec.signature.to_string()))),
            None => Err(RpcFault::new(FaultCode::UnknownMethod, name)),
        }
    }

    fn rpc_multicall(&mut self, call: &CallEnvelope) -> Outcome {
        let Some(calls) = call.params.first().and_then(Value::as_array).cloned() else {
            return fail(FaultCode::BadArguments, "expected an array of calls");
        };

        let mut responses = Vec::with_capacity(calls.len());
        for raw in calls {
            let envelope = match serde_json::from_value::<CallEnvelope>(raw) {
                Ok(sub_call) => match self.dispatch_call(&sub_call, false) {
                    Outcome::Reply(envelope) => envelope,
                    // Unreachable with allow_park=false; keep the response
                    // sequence aligned anyway.
                    Outcome::Park(_) => fault_envelope(&RpcFault::new(
                        FaultCode::Failed,
                        "wait is not supported inside multicall",
                    )),
                },
                Err(err) => fault_envelope(&RpcFault::new(
                    FaultCode::IncorrectParameters,
                    err.to_string(),
                )),
            };
            responses.push(envelope);
        }
        reply(Value::Array(responses))
    }

    fn rpc_process_info(&mut self, call: &CallEnvelope) -> Result<Outcome, RpcFault> {
        let name = param_str(call, 0)?;
        let Some(process) = self.processes.iter().find(|p| p.name() == name) else {
            return Err(RpcFault::new(FaultCode::BadName, name));
        };
        let info = serde_json::to_value(process.info())
            .map_err(|e| RpcFault::new(FaultCode::Failed, e.to_string()))?;
        Ok(reply(info))
    }

    fn rpc_all_process_info(&mut self) -> Outcome {
        let mut records = Vec::with_capacity(self.processes.len());
        for id in self.start_order() {
            if let Some(process) = self.processes.iter().find(|p| p.id == id)
                && let Ok(info) = serde_json::to_value(process.info())
            {
                records.push(info);
            }
        }
        reply(Value::Array(records))
    }

    fn rpc_start_process(
        &mut self,
        call: &CallEnvelope,
        allow_park: bool,
    ) -> Result<Outcome, RpcFault> {
        let name = param_str(call, 0)?;
        let wait = opt_bool(call, 1, true)?;

        let Some(id) = self
            .processes
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.id)
        else {
            return Err(RpcFault::new(FaultCode::BadName, name));
        };

        let state_before = self
            .processes
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.state())
            .unwrap_or(ProcessState::Unknown);
        match state_before {
            ProcessState::Starting | ProcessState::Running => {
                return Err(RpcFault::new(FaultCode::AlreadyStarted, name));
            }
            ProcessState::Stopping => {
                return Err(RpcFault::new(
                    FaultCode::Failed,
                    format!("{name} is stopping; try again once it has stopped"),
                ));
            }
            _ => {}
        }

        let state_after = {
            let poller = &mut self.poller;
            let process = self
                .processes
                .iter_mut()
                .find(|p| p.id == id)
                .unwrap_or_else(|| unreachable!());
            process.start(poller);
            process.state()
        };

        match state_after {
            ProcessState::Running => Ok(reply(Value::Bool(true))),
            ProcessState::Backoff | ProcessState::Fatal => {
                let spawnerr = self
                    .processes
                    .iter()
                    .find(|p| p.id == id)
                    .and_then(|p| p.info().spawnerr);
                Err(RpcFault::new(
                    FaultCode::SpawnError,
                    spawnerr.unwrap_or_else(|| name.clone()),
                ))
            }
            ProcessState::Starting if wait && allow_park => {
                Ok(Outcome::Park(WaitGoal::Started(id)))
            }
            ProcessState::Starting => Ok(reply(Value::Bool(true))),
            other => Err(RpcFault::new(
                FaultCode::Failed,
                format!("{name} is {other} after start"),
            )),
        }
    }

    fn rpc_stop_process(
        &mut self,
        call: &CallEnvelope,
        allow_park: bool,
    ) -> Result<Outcome, RpcFault> {
        let name = param_str(call, 0)?;
        let wait = opt_bool(call, 1, true)?;

        let Some(id) = self
            .processes
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.id)
        else {
            return Err(RpcFault::new(FaultCode::BadName, name));
        };

        let state_after = {
            let poller = &mut self.poller;
            let process = self
                .processes
                .iter_mut()
                .find(|p| p.id == id)
                .unwrap_or_else(|| unreachable!());
            // Stop on a resting process is a no-op that reports success.
            if !process.state().is_resting() {
                process.stop(poller);
            }
            process.state()
        };

        if state_after == ProcessState::Stopping && wait && allow_park {
            Ok(Outcome::Park(WaitGoal::Stopped(id)))
        } else {
            Ok(reply(Value::Bool(true)))
        }
    }

    fn rpc_start_all(
        &mut self,
        call: &CallEnvelope,
        allow_park: bool,
    ) -> Result<Outcome, RpcFault> {
        let wait = opt_bool(call, 0, true)?;
        let ids = self.start_order();
        self.start_all(false);
        if wait && allow_park {
            Ok(Outcome::Park(WaitGoal::AllStarted(ids)))
        } else {
            Ok(reply(Value::Bool(true)))
        }
    }

    fn rpc_stop_all(
        &mut self,
        call: &CallEnvelope,
        allow_park: bool,
    ) -> Result<Outcome, RpcFault> {
        let wait = opt_bool(call, 0, true)?;
        self.stop_all();
        let any_live = self.processes.iter().any(|p| !p.state().is_resting());
        if wait && allow_park && any_live {
            Ok(Outcome::Park(WaitGoal::AllStopped))
        } else {
            Ok(reply(Value::Bool(true)))
        }
    }

    fn rpc_restart(&mut self, allow_park: bool) -> Outcome {
        self.state = SupervisorState::Restarting;
        self.pending_restart = Some(RestartPhase::Stopping);
        self.stop_all();
        if allow_park {
            Outcome::Park(WaitGoal::Restarted)
        } else {
            reply(Value::Bool(true))
        }
    }

    fn with_process_log<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut LogFile) -> io::Result<T>,
    ) -> Result<T, RpcFault> {
        let Some(process) = self.processes.iter_mut().find(|p| p.name() == name) else {
            return Err(RpcFault::new(FaultCode::BadName, name));
        };
        let Some(log) = process.log_mut() else {
            return Err(RpcFault::new(
                FaultCode::NoFile,
                format!("{name} keeps no log"),
            ));
        };
        f(log).map_err(|err| RpcFault::new(FaultCode::Failed, err.to_string()))
    }

    fn rpc_read_process_log(&mut self, call: &CallEnvelope) -> Result<Outcome, RpcFault> {
        let name = param_str(call, 0)?;
        let offset = param_i64(call, 1)?;
        let length = param_i64(call, 2)?.max(0) as u64;
        let data = self.with_process_log(&name, |log| log.read_chunk(offset, length))?;
        Ok(reply(Value::String(
            String::from_utf8_lossy(&data).into_owned(),
        )))
    }

    fn rpc_tail_process_log(&mut self, call: &CallEnvelope) -> Result<Outcome, RpcFault> {
        let name = param_str(call, 0)?;
        let offset = param_i64(call, 1)?.max(0) as u64;
        let length = param_i64(call, 2)?.max(0) as u64;
        let (data, new_offset, overflow) =
            self.with_process_log(&name, |log| log.tail_chunk(offset, length))?;
        Ok(reply(json!([
            String::from_utf8_lossy(&data).into_owned(),
            new_offset,
            overflow
        ])))
    }

    fn rpc_clear_process_log(&mut self, call: &CallEnvelope) -> Result<Outcome, RpcFault> {
        let name = param_str(call, 0)?;
        self.with_process_log(&name, |log| log.clear())?;
        Ok(reply(Value::Bool(true)))
    }

    fn rpc_clear_all_process_logs(&mut self) -> Outcome {
        for process in &mut self.processes {
            let name = process.name().to_string();
            if let Some(log) = process.log_mut()
                && let Err(err) = log.clear()
            {
                warn!("clearing log for '{name}' failed: {err}");
            }
        }
        reply(Value::Bool(true))
    }

    fn rpc_read_log(&mut self, call: &CallEnvelope) -> Result<Outcome, RpcFault> {
        let offset = param_i64(call, 0)?;
        let length = param_i64(call, 1)?.max(0) as u64;
        let data = self
            .activity
            .read_chunk(offset, length)
            .map_err(|err| RpcFault::new(FaultCode::Failed, err.to_string()))?;
        Ok(reply(Value::String(
            String::from_utf8_lossy(&data).into_owned(),
        )))
    }

    fn rpc_clear_log(&mut self) -> Result<Outcome, RpcFault> {
        self.activity
            .clear()
            .map_err(|err| RpcFault::new(FaultCode::Failed, err.to_string()))?;
        Ok(reply(Value::Bool(true)))
    }
}
