//! Error handling for taskmaster.
use thiserror::Error;

/// Top-level error for daemon startup and shutdown paths.
///
/// Errors raised while the event loop is running are handled locally and
/// logged; only bootstrap failures propagate out of `main`.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Invalid or unreadable configuration. Fatal at startup.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unmet resource requirements or unusable shared resources. Fatal at startup.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Any other I/O failure during bootstrap.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Process exit code for this failure: `2` for config errors, `3` for
    /// resource errors, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::Config(_) => 2,
            DaemonError::Resource(_) => 3,
            DaemonError::Io(_) => 1,
        }
    }
}

/// Error reading or interpreting the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Unreadable {
        /// Path that was attempted.
        path: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A line could not be parsed as a section header or `key = value` pair.
    #[error("config syntax error at line {line}: {reason}")]
    Syntax {
        /// 1-based line number in the file.
        line: usize,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// A section or option carried an invalid value.
    #[error("invalid value for '{key}' in [{section}]: {reason}")]
    BadValue {
        /// Section the option appeared in.
        section: String,
        /// Option name.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A required option is missing.
    #[error("missing required option '{key}' in [{section}]")]
    MissingOption {
        /// Section the option belongs to.
        section: String,
        /// Option name.
        key: String,
    },

    /// Two `[program:...]` sections share the same name.
    #[error("duplicate program name '{0}'")]
    DuplicateProgram(String),
}

/// Startup resource failures: rlimits, sockets, pidfile.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The file-descriptor rlimit is below `minfds`.
    #[error("minfds requires {required} file descriptors but the hard limit is {available}")]
    InsufficientFds {
        /// Configured `minfds` value.
        required: u64,
        /// Hard limit reported by the kernel.
        available: u64,
    },

    /// The process rlimit is below `minprocs`.
    #[error("minprocs requires {required} processes but the hard limit is {available}")]
    InsufficientProcs {
        /// Configured `minprocs` value.
        required: u64,
        /// Hard limit reported by the kernel.
        available: u64,
    },

    /// The RPC socket could not be bound.
    #[error("failed to bind control socket '{address}': {source}")]
    Bind {
        /// The configured listen address.
        address: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The pidfile could not be created or locked.
    #[error("failed to acquire pidfile '{path}': {source}")]
    Pidfile {
        /// Configured pidfile path.
        path: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A user or group named in the configuration does not exist.
    #[error("unknown account '{0}'")]
    UnknownAccount(String),

    /// Dropping privileges failed.
    #[error("failed to drop privileges to '{user}': {errno}")]
    PrivilegeDrop {
        /// Target account name.
        user: String,
        /// The errno reported by the kernel.
        errno: nix::errno::Errno,
    },
}

/// Failure to bring up a child process, recorded as `spawnerr` on the
/// owning Process. Never fatal to the supervisor.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// argv[0] could not be resolved to an executable file.
    #[error("can't find command '{0}'")]
    CommandNotFound(String),

    /// Fork failed before the child existed.
    #[error("fork failed for '{service}': {errno}")]
    ForkFailed {
        /// The program that failed to start.
        service: String,
        /// The errno reported by the kernel.
        errno: nix::errno::Errno,
    },

    /// The child reported an exec failure through the error pipe.
    #[error("exec failed: {0}")]
    ExecFailed(nix::errno::Errno),

    /// Pipe creation failed.
    #[error("pipe setup failed: {0}")]
    PipeSetup(nix::errno::Errno),
}

/// Numeric fault codes carried in RPC fault envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum FaultCode {
    /// The requested method does not exist.
    UnknownMethod = 1,
    /// The request envelope was malformed.
    IncorrectParameters = 2,
    /// Arguments had the wrong arity or types.
    BadArguments = 3,
    /// The supervisor is shutting down and refuses control calls.
    ShutdownState = 6,
    /// No process with the given name exists.
    BadName = 10,
    /// The requested log file does not exist.
    NoFile = 20,
    /// The operation failed for an unspecified reason.
    Failed = 30,
    /// The process ended abnormally while a waiter was parked on it.
    AbnormalTermination = 40,
    /// The process could not be spawned.
    SpawnError = 50,
    /// The process is already running.
    AlreadyStarted = 60,
    /// The process is not running.
    NotRunning = 70,
}

/// A fault reported on the RPC surface. Converted into a response envelope,
/// never into a crash.
#[derive(Debug, Clone, Error)]
#[error("fault {code:?}: {message}")]
pub struct RpcFault {
    /// Numeric fault discriminant.
    pub code: FaultCode,
    /// Human-readable fault text.
    pub message: String,
}

impl RpcFault {
    /// Builds a fault with the canonical `CODE_NAME: detail` message shape.
    pub fn new(code: FaultCode, detail: impl AsRef<str>) -> Self {
        let name = match code {
            FaultCode::UnknownMethod => "UNKNOWN_METHOD",
            FaultCode::IncorrectParameters => "INCORRECT_PARAMETERS",
            FaultCode::BadArguments => "BAD_ARGUMENTS",
            FaultCode::ShutdownState => "SHUTDOWN_STATE",
            FaultCode::BadName => "BAD_NAME",
            FaultCode::NoFile => "NO_FILE",
            FaultCode::Failed => "FAILED",
            FaultCode::AbnormalTermination => "ABNORMAL_TERMINATION",
            FaultCode::SpawnError => "SPAWN_ERROR",
            FaultCode::AlreadyStarted => "ALREADY_STARTED",
            FaultCode::NotRunning => "NOT_RUNNING",
        };
        let detail = detail.as_ref();
        let message = if detail.is_empty() {
            name.to_string()
        } else {
            format!("{name}: {detail}")
        };
        RpcFault { code, message }
    }
}
