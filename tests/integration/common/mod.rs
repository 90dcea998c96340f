#![allow(dead_code)]

use std::{
    fs,
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Value, json};
use taskmaster::{config::parse_config, logger::ActivityLog, supervisor::Supervisor};
use tempfile::TempDir;

/// A supervisor running its full event loop on a background thread,
/// controlled over its UNIX socket like any other client would.
pub struct Daemon {
    pub socket: PathBuf,
    pub dir: TempDir,
    auth: Option<(String, String)>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Starts a daemon with the given extra `[supervisord]` lines and program
/// sections. The control socket and child logs live in a fresh tempdir.
pub fn start_daemon(extra_supervisord: &str, programs: &str) -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("control.sock");
    let text = format!(
        "[supervisord]\nhttp_port = {}\nchildlogdir = {}\n{}\n{}\n",
        socket.display(),
        dir.path().display(),
        extra_supervisord,
        programs,
    );

    let config = parse_config(&text).unwrap();
    let config_path = dir.path().join("taskmasterd.conf");
    fs::write(&config_path, &text).unwrap();
    let activity = ActivityLog::new(dir.path().join("activity.log"), 0, 0, false);

    let auth = config
        .http_username
        .clone()
        .zip(config.http_password.clone());
    let mut supervisor = Supervisor::new(config, config_path, activity).unwrap();
    let handle = thread::spawn(move || {
        let _ = supervisor.run();
    });

    // The loop owns the listener before run() is entered; wait until it
    // answers.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if socket.exists() && UnixStream::connect(&socket).is_ok() {
            break;
        }
        assert!(Instant::now() < deadline, "control socket never came up");
        thread::sleep(Duration::from_millis(20));
    }

    Daemon {
        socket,
        dir,
        auth,
        handle: Some(handle),
    }
}

impl Daemon {
    /// One authenticated control call; panics on transport or fault issues
    /// other than the envelope itself.
    pub fn call(&self, method: &str, params: Value) -> Value {
        let auth = self
            .auth
            .as_ref()
            .map(|(u, p)| (u.as_str(), p.as_str()));
        rpc(&self.socket, method, params, auth)
    }

    /// State name of a process as reported over RPC.
    pub fn state_of(&self, name: &str) -> String {
        self.call("supervisor.getProcessInfo", json!([name]))["result"]["state"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    /// Polls until a process reports the given state.
    pub fn wait_state(&self, name: &str, state: &str, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state_of(name) == state {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "'{name}' never reached {state} (currently {})",
                self.state_of(name)
            );
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Asks the supervisor to shut down and joins its thread.
    pub fn stop(mut self) {
        let _ = self.call("supervisor.shutdown", json!([]));
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

/// Sends one raw HTTP/1.0 POST to `/RPC2`; returns (status line, body).
pub fn http_post(
    socket: &Path,
    body: &str,
    auth: Option<(&str, &str)>,
) -> (String, String) {
    http_post_path(socket, "/RPC2", body, auth)
}

/// Sends one raw HTTP/1.0 POST to an arbitrary path.
pub fn http_post_path(
    socket: &Path,
    path: &str,
    body: &str,
    auth: Option<(&str, &str)>,
) -> (String, String) {
    let mut stream = UnixStream::connect(socket).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();

    let mut request = format!(
        "POST {path} HTTP/1.0\r\nContent-Length: {}\r\n",
        body.len()
    );
    if let Some((user, pass)) = auth {
        let encoded = BASE64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    let (head, body) = response
        .split_once("\r\n\r\n")
        .expect("response without header terminator");
    let status = head.lines().next().unwrap_or_default().to_string();
    (status, body.to_string())
}

/// One control call over the socket; asserts HTTP 200 and parses the
/// envelope.
pub fn rpc(
    socket: &Path,
    method: &str,
    params: Value,
    auth: Option<(&str, &str)>,
) -> Value {
    let body = json!({ "method": method, "params": params }).to_string();
    let (status, body) = http_post(socket, &body, auth);
    assert!(status.contains("200"), "unexpected response: {status}");
    serde_json::from_str(&body).unwrap()
}

/// Builds a supervisor for synchronous, single-threaded driving (no
/// background thread, no control socket unless configured).
pub fn build_supervisor(dir: &TempDir, text: &str) -> Supervisor {
    let full = format!(
        "[supervisord]\nchildlogdir = {}\n{}\n",
        dir.path().display(),
        text
    );
    let config = parse_config(&full).unwrap();
    let config_path = dir.path().join("taskmasterd.conf");
    fs::write(&config_path, &full).unwrap();
    let activity = ActivityLog::new(dir.path().join("activity.log"), 0, 0, false);
    Supervisor::new(config, config_path, activity).unwrap()
}

/// Steps the loop until the predicate holds.
pub fn drive_until(
    supervisor: &mut Supervisor,
    timeout: Duration,
    mut predicate: impl FnMut(&Supervisor) -> bool,
) {
    let deadline = Instant::now() + timeout;
    while !predicate(supervisor) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        supervisor.run_once().unwrap();
    }
}

/// Generic polling helper.
pub fn wait_for(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(50));
    }
}
