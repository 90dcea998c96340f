//! Configuration loading.
//!
//! Parses the INI-style configuration file into an immutable [`ServerConfig`]
//! snapshot. A snapshot is never mutated in place: reloads parse a whole new
//! one and the supervisor swaps it wholesale.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;
use strum::{Display, EnumString};

use crate::error::ConfigError;

/// Default per-log size threshold (50 MB), matching the activity log default.
pub const DEFAULT_LOG_MAXBYTES: u64 = 50 * 1024 * 1024;

/// Default number of rotated backups kept per log.
pub const DEFAULT_LOG_BACKUPS: u32 = 10;

/// Seconds a child must stay up before it counts as successfully started.
pub const DEFAULT_STARTSECS: u64 = 1;

/// Grace period between the stop signal and SIGKILL escalation.
pub const DEFAULT_STOPWAITSECS: u64 = 10;

/// Where the control server listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ListenAddr {
    /// TCP `host:port`.
    Inet(String),
    /// Absolute path of a UNIX domain socket.
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Inet(addr) => write!(f, "{addr}"),
            ListenAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Signal used to stop a child, restricted to the supported set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize,
)]
#[strum(ascii_case_insensitive)]
pub enum StopSignal {
    /// SIGTERM (the default).
    #[default]
    #[strum(serialize = "TERM")]
    Term,
    /// SIGHUP.
    #[strum(serialize = "HUP")]
    Hup,
    /// SIGINT.
    #[strum(serialize = "INT")]
    Int,
    /// SIGQUIT.
    #[strum(serialize = "QUIT")]
    Quit,
    /// SIGKILL.
    #[strum(serialize = "KILL")]
    Kill,
    /// SIGUSR1.
    #[strum(serialize = "USR1")]
    Usr1,
    /// SIGUSR2.
    #[strum(serialize = "USR2")]
    Usr2,
}

impl StopSignal {
    /// The corresponding OS signal.
    pub fn as_signal(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Hup => Signal::SIGHUP,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Kill => Signal::SIGKILL,
            StopSignal::Usr1 => Signal::SIGUSR1,
            StopSignal::Usr2 => Signal::SIGUSR2,
        }
    }
}

/// Destination for a child's captured output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogPolicy {
    /// Supervisor-chosen file under `childlogdir`, cleaned up automatically.
    #[default]
    Auto,
    /// Output is discarded.
    None,
    /// Explicit path.
    Path(PathBuf),
}

/// Activity-log verbosity names accepted in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum LogLevel {
    /// Highest-severity only. Mapped onto the error level at runtime.
    Critical,
    /// Errors.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational and above (the default).
    #[default]
    Info,
    /// Debug and above.
    Debug,
    /// Everything.
    Trace,
}

/// One `[program:NAME]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramConfig {
    /// Stable unique name from the section header.
    pub name: String,
    /// Command argv after shell-style splitting; argv[0] may be unqualified.
    pub command: Vec<String>,
    /// Start/stop ordering key; lower starts earlier and stops later.
    pub priority: i32,
    /// Start automatically at supervisor boot.
    pub autostart: bool,
    /// Respawn after an expected exit.
    pub autorestart: bool,
    /// Seconds the child must stay alive to count as started (0 = instantly).
    pub startsecs: u64,
    /// Exit codes considered a clean exit.
    pub exitcodes: Vec<i32>,
    /// Signal sent on stop.
    pub stopsignal: StopSignal,
    /// Grace period before SIGKILL escalation.
    pub stopwaitsecs: u64,
    /// Run the child as this UNIX user (only honored when root).
    pub user: Option<String>,
    /// Capture stderr into the same log as stdout.
    pub log_stderr: bool,
    /// Log destination policy.
    pub logfile: LogPolicy,
    /// Rotation threshold for the child log (0 = unbounded).
    pub logfile_maxbytes: u64,
    /// Rotated backups kept for the child log (0 = unbounded).
    pub logfile_backups: u32,
}

/// The immutable effective configuration snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Control-server listen address, if any.
    pub http_port: Option<ListenAddr>,
    /// Mode bits applied to a UNIX control socket.
    pub sockchmod: u32,
    /// `user` or `user.group` ownership applied to a UNIX control socket.
    pub sockchown: Option<String>,
    /// Umask installed at startup.
    pub umask: u32,
    /// Activity log path.
    pub logfile: PathBuf,
    /// Activity log rotation threshold (0 = unbounded).
    pub logfile_maxbytes: u64,
    /// Activity log backup count (0 = unbounded).
    pub logfile_backups: u32,
    /// Activity log verbosity.
    pub loglevel: LogLevel,
    /// Pidfile path.
    pub pidfile: PathBuf,
    /// Stay in the foreground.
    pub nodaemon: bool,
    /// Minimum usable file descriptors required at startup.
    pub minfds: u64,
    /// Minimum spawnable processes required at startup.
    pub minprocs: u64,
    /// Failed-start attempts before a program goes FATAL.
    pub backofflimit: u32,
    /// Keep stale AUTO logs at startup.
    pub nocleanup: bool,
    /// Never give up restarting (FATAL is not entered from backoff).
    pub forever: bool,
    /// Basic-auth username for the control server.
    pub http_username: Option<String>,
    /// Basic-auth password for the control server.
    pub http_password: Option<String>,
    /// Directory for AUTO child logs.
    pub childlogdir: PathBuf,
    /// Drop privileges to this account before entering the loop.
    pub user: Option<String>,
    /// Working directory for the daemon.
    pub directory: Option<PathBuf>,
    /// All `[program:...]` sections, in file order.
    pub programs: Vec<ProgramConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            http_port: None,
            sockchmod: 0o700,
            sockchown: None,
            umask: 0o022,
            logfile: PathBuf::from("taskmasterd.log"),
            logfile_maxbytes: DEFAULT_LOG_MAXBYTES,
            logfile_backups: DEFAULT_LOG_BACKUPS,
            loglevel: LogLevel::Info,
            pidfile: PathBuf::from("taskmasterd.pid"),
            nodaemon: false,
            minfds: 1024,
            minprocs: 200,
            backofflimit: 3,
            nocleanup: false,
            forever: false,
            http_username: None,
            http_password: None,
            childlogdir: std::env::temp_dir(),
            user: None,
            directory: None,
            programs: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Returns the program at `name`, if configured.
    pub fn program(&self, name: &str) -> Option<&ProgramConfig> {
        self.programs.iter().find(|p| p.name == name)
    }
}

/// Loads and validates a configuration file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&text)
}

/// Parses configuration text into a validated snapshot.
pub fn parse_config(text: &str) -> Result<ServerConfig, ConfigError> {
    let sections = parse_ini(text)?;
    let mut config = ServerConfig::default();
    let mut seen = BTreeSet::new();

    for section in &sections {
        if section.name == "supervisord" {
            apply_supervisord(&mut config, section)?;
        } else if let Some(name) = section.name.strip_prefix("program:") {
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::DuplicateProgram(name.to_string()));
            }
            config.programs.push(parse_program(name, section)?);
        }
        // [supervisorctl] and unknown sections are tolerated: the former is
        // consumed by the external CLI client, and config files may be
        // shared with other tools.
    }

    if config.http_username.is_some() != config.http_password.is_some() {
        return Err(ConfigError::BadValue {
            section: "supervisord".into(),
            key: "http_username".into(),
            reason: "http_username and http_password must be set together".into(),
        });
    }

    Ok(config)
}

/// A raw INI section: ordered `(key, value)` pairs.
struct IniSection {
    name: String,
    pairs: Vec<(String, String)>,
}

impl IniSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal INI reader: `[section]` headers, `key = value` pairs, `;`/`#`
/// comment lines, blank lines, LF or CRLF endings.
fn parse_ini(text: &str) -> Result<Vec<IniSection>, ConfigError> {
    let mut sections: Vec<IniSection> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end_matches('\r').trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let Some(name) = rest.strip_suffix(']') else {
                return Err(ConfigError::Syntax {
                    line: line_no,
                    reason: "unterminated section header".into(),
                });
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::Syntax {
                    line: line_no,
                    reason: "empty section name".into(),
                });
            }
            sections.push(IniSection {
                name: name.to_string(),
                pairs: Vec::new(),
            });
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax {
                line: line_no,
                reason: format!("expected 'key = value', got '{line}'"),
            });
        };
        let Some(section) = sections.last_mut() else {
            return Err(ConfigError::Syntax {
                line: line_no,
                reason: "option outside of any section".into(),
            });
        };
        section
            .pairs
            .push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    Ok(sections)
}

fn apply_supervisord(
    config: &mut ServerConfig,
    section: &IniSection,
) -> Result<(), ConfigError> {
    let bad = |key: &str, reason: String| ConfigError::BadValue {
        section: "supervisord".into(),
        key: key.into(),
        reason,
    };

    if let Some(v) = section.get("http_port") {
        config.http_port = Some(parse_listen_addr(v).map_err(|r| bad("http_port", r))?);
    }
    if let Some(v) = section.get("sockchmod") {
        config.sockchmod = parse_octal(v).map_err(|r| bad("sockchmod", r))?;
    }
    if let Some(v) = section.get("sockchown") {
        config.sockchown = Some(v.to_string());
    }
    if let Some(v) = section.get("umask") {
        config.umask = parse_octal(v).map_err(|r| bad("umask", r))?;
    }
    if let Some(v) = section.get("logfile") {
        config.logfile = PathBuf::from(v);
    }
    if let Some(v) = section.get("logfile_maxbytes") {
        config.logfile_maxbytes = parse_bytes(v).map_err(|r| bad("logfile_maxbytes", r))?;
    }
    if let Some(v) = section.get("logfile_backups") {
        config.logfile_backups =
            v.parse().map_err(|_| bad("logfile_backups", format!("not an integer: '{v}'")))?;
    }
    if let Some(v) = section.get("loglevel") {
        config.loglevel = v
            .parse()
            .map_err(|_| bad("loglevel", format!("unknown level '{v}'")))?;
    }
    if let Some(v) = section.get("pidfile") {
        config.pidfile = PathBuf::from(v);
    }
    if let Some(v) = section.get("nodaemon") {
        config.nodaemon = parse_bool(v).map_err(|r| bad("nodaemon", r))?;
    }
    if let Some(v) = section.get("minfds") {
        config.minfds = v
            .parse()
            .map_err(|_| bad("minfds", format!("not an integer: '{v}'")))?;
    }
    if let Some(v) = section.get("minprocs") {
        config.minprocs = v
            .parse()
            .map_err(|_| bad("minprocs", format!("not an integer: '{v}'")))?;
    }
    if let Some(v) = section.get("backofflimit") {
        config.backofflimit = v
            .parse()
            .map_err(|_| bad("backofflimit", format!("not an integer: '{v}'")))?;
    }
    if let Some(v) = section.get("nocleanup") {
        config.nocleanup = parse_bool(v).map_err(|r| bad("nocleanup", r))?;
    }
    if let Some(v) = section.get("forever") {
        config.forever = parse_bool(v).map_err(|r| bad("forever", r))?;
    }
    if let Some(v) = section.get("http_username") {
        config.http_username = Some(v.to_string());
    }
    if let Some(v) = section.get("http_password") {
        config.http_password = Some(v.to_string());
    }
    if let Some(v) = section.get("childlogdir") {
        config.childlogdir = PathBuf::from(v);
    }
    if let Some(v) = section.get("user") {
        config.user = Some(v.to_string());
    }
    if let Some(v) = section.get("directory") {
        config.directory = Some(PathBuf::from(v));
    }

    Ok(())
}

fn parse_program(name: &str, section: &IniSection) -> Result<ProgramConfig, ConfigError> {
    let section_name = format!("program:{name}");
    let bad = |key: &str, reason: String| ConfigError::BadValue {
        section: section_name.clone(),
        key: key.into(),
        reason,
    };

    let raw_command = section.get("command").ok_or_else(|| ConfigError::MissingOption {
        section: section_name.clone(),
        key: "command".into(),
    })?;
    let command = shell_words::split(raw_command)
        .map_err(|e| bad("command", e.to_string()))?;
    if command.is_empty() {
        return Err(bad("command", "command is empty".into()));
    }

    let mut program = ProgramConfig {
        name: name.to_string(),
        command,
        priority: 999,
        autostart: true,
        autorestart: false,
        startsecs: DEFAULT_STARTSECS,
        exitcodes: vec![0, 2],
        stopsignal: StopSignal::default(),
        stopwaitsecs: DEFAULT_STOPWAITSECS,
        user: None,
        log_stderr: false,
        logfile: LogPolicy::Auto,
        logfile_maxbytes: DEFAULT_LOG_MAXBYTES,
        logfile_backups: DEFAULT_LOG_BACKUPS,
    };

    if let Some(v) = section.get("priority") {
        program.priority = v
            .parse()
            .map_err(|_| bad("priority", format!("not an integer: '{v}'")))?;
    }
    if let Some(v) = section.get("autostart") {
        program.autostart = parse_bool(v).map_err(|r| bad("autostart", r))?;
    }
    if let Some(v) = section.get("autorestart") {
        program.autorestart = parse_bool(v).map_err(|r| bad("autorestart", r))?;
    }
    if let Some(v) = section.get("startsecs") {
        program.startsecs = v
            .parse()
            .map_err(|_| bad("startsecs", format!("not an integer: '{v}'")))?;
    }
    if let Some(v) = section.get("exitcodes") {
        program.exitcodes = parse_exitcodes(v).map_err(|r| bad("exitcodes", r))?;
    }
    if let Some(v) = section.get("stopsignal") {
        program.stopsignal = v
            .parse()
            .map_err(|_| bad("stopsignal", format!("unknown signal '{v}'")))?;
    }
    if let Some(v) = section.get("stopwaitsecs") {
        program.stopwaitsecs = v
            .parse()
            .map_err(|_| bad("stopwaitsecs", format!("not an integer: '{v}'")))?;
    }
    if let Some(v) = section.get("user") {
        program.user = Some(v.to_string());
    }
    if let Some(v) = section.get("log_stderr") {
        program.log_stderr = parse_bool(v).map_err(|r| bad("log_stderr", r))?;
    }
    if let Some(v) = section.get("logfile") {
        program.logfile = match v {
            _ if v.eq_ignore_ascii_case("auto") => LogPolicy::Auto,
            _ if v.eq_ignore_ascii_case("none") => LogPolicy::None,
            _ => LogPolicy::Path(PathBuf::from(v)),
        };
    }
    if let Some(v) = section.get("logfile_maxbytes") {
        program.logfile_maxbytes =
            parse_bytes(v).map_err(|r| bad("logfile_maxbytes", r))?;
    }
    if let Some(v) = section.get("logfile_backups") {
        program.logfile_backups = v
            .parse()
            .map_err(|_| bad("logfile_backups", format!("not an integer: '{v}'")))?;
    }

    Ok(program)
}

/// Parses a listen address: `host:port` or an absolute UNIX socket path.
pub fn parse_listen_addr(value: &str) -> Result<ListenAddr, String> {
    if value.starts_with('/') {
        return Ok(ListenAddr::Unix(PathBuf::from(value)));
    }
    let Some((_, port)) = value.rsplit_once(':') else {
        return Err(format!(
            "expected 'host:port' or an absolute socket path, got '{value}'"
        ));
    };
    port.parse::<u16>()
        .map_err(|_| format!("invalid port '{port}'"))?;
    Ok(ListenAddr::Inet(value.to_string()))
}

/// Parses a boolean literal: true/false, yes/no, on/off, 1/0.
pub fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(format!("not a boolean: '{value}'")),
    }
}

/// Parses an octal mode such as `0700` or `022`.
pub fn parse_octal(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value.trim_start_matches("0o"), 8)
        .map_err(|_| format!("not an octal mode: '{value}'"))
}

/// Parses a byte count with an optional case-insensitive KB/MB/GB suffix.
pub fn parse_bytes(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    let upper = trimmed.to_ascii_uppercase();

    let (number, factor) = if let Some(n) = upper.strip_suffix("KB") {
        (n, 1u64 << 10)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1u64 << 20)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, 1u64 << 30)
    } else {
        (upper.as_str(), 1u64)
    };

    number
        .trim()
        .parse::<u64>()
        .map(|v| v * factor)
        .map_err(|_| format!("not a byte count: '{value}'"))
}

fn parse_exitcodes(value: &str) -> Result<Vec<i32>, String> {
    let mut codes = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        codes.push(
            part.parse::<i32>()
                .map_err(|_| format!("not an integer exit code: '{part}'"))?,
        );
    }
    if codes.is_empty() {
        return Err("no exit codes given".into());
    }
    Ok(codes)
}
