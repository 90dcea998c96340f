//! Command-line interface for taskmasterd.
use std::path::PathBuf;

use clap::Parser;

use crate::{
    config::{LogLevel, ServerConfig, parse_bytes, parse_listen_addr, parse_octal},
    error::ConfigError,
};

/// Command-line interface for the taskmaster daemon. Every flag overrides the
/// matching `[supervisord]` option from the configuration file.
#[derive(Debug, Parser)]
#[command(name = "taskmasterd", version, author)]
#[command(about = "A UNIX process supervision daemon", long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "configuration", default_value = "taskmasterd.conf")]
    pub configuration: PathBuf,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'n', long)]
    pub nodaemon: bool,

    /// Drop privileges to this UNIX account after startup.
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Change to this directory before running.
    #[arg(short = 'd', long)]
    pub directory: Option<PathBuf>,

    /// Activity log path.
    #[arg(short = 'l', long)]
    pub logfile: Option<PathBuf>,

    /// Activity log rotation threshold (supports KB/MB/GB suffixes).
    #[arg(short = 'y', long, value_name = "BYTES")]
    pub logfile_maxbytes: Option<String>,

    /// Number of rotated activity-log backups to keep.
    #[arg(short = 'z', long, value_name = "NUM")]
    pub logfile_backups: Option<u32>,

    /// Activity log verbosity (critical, error, warn, info, debug, trace).
    #[arg(short = 'e', long, value_name = "LEVEL")]
    pub loglevel: Option<String>,

    /// Pidfile path.
    #[arg(short = 'j', long)]
    pub pidfile: Option<PathBuf>,

    /// Directory for AUTO child logs.
    #[arg(short = 'q', long)]
    pub childlogdir: Option<PathBuf>,

    /// Failed-start attempts before a program goes FATAL.
    #[arg(short = 'b', long, value_name = "NUM")]
    pub backofflimit: Option<u32>,

    /// Never give up restarting failed programs.
    #[arg(short = 'f', long)]
    pub forever: bool,

    /// Keep stale AUTO child logs at startup.
    #[arg(short = 'k', long)]
    pub nocleanup: bool,

    /// Minimum usable file descriptors required at startup.
    #[arg(long, value_name = "NUM")]
    pub minfds: Option<u64>,

    /// Minimum spawnable processes required at startup.
    #[arg(long, value_name = "NUM")]
    pub minprocs: Option<u64>,

    /// Control-server listen address: host:port or a UNIX socket path.
    #[arg(short = 'w', long, value_name = "SOCKET")]
    pub http_port: Option<String>,

    /// Umask applied at startup (octal).
    #[arg(short = 'g', long, value_name = "OCTAL")]
    pub umask: Option<String>,
}

impl Cli {
    /// Applies command-line overrides on top of a parsed config snapshot.
    pub fn apply_to(&self, config: &mut ServerConfig) -> Result<(), ConfigError> {
        let bad = |key: &str, reason: String| ConfigError::BadValue {
            section: "cli".into(),
            key: key.into(),
            reason,
        };

        if self.nodaemon {
            config.nodaemon = true;
        }
        if let Some(user) = &self.user {
            config.user = Some(user.clone());
        }
        if let Some(dir) = &self.directory {
            config.directory = Some(dir.clone());
        }
        if let Some(path) = &self.logfile {
            config.logfile = path.clone();
        }
        if let Some(raw) = &self.logfile_maxbytes {
            config.logfile_maxbytes =
                parse_bytes(raw).map_err(|r| bad("logfile_maxbytes", r))?;
        }
        if let Some(backups) = self.logfile_backups {
            config.logfile_backups = backups;
        }
        if let Some(raw) = &self.loglevel {
            config.loglevel = raw
                .parse::<LogLevel>()
                .map_err(|_| bad("loglevel", format!("unknown level '{raw}'")))?;
        }
        if let Some(path) = &self.pidfile {
            config.pidfile = path.clone();
        }
        if let Some(dir) = &self.childlogdir {
            config.childlogdir = dir.clone();
        }
        if let Some(limit) = self.backofflimit {
            config.backofflimit = limit;
        }
        if self.forever {
            config.forever = true;
        }
        if self.nocleanup {
            config.nocleanup = true;
        }
        if let Some(minfds) = self.minfds {
            config.minfds = minfds;
        }
        if let Some(minprocs) = self.minprocs {
            config.minprocs = minprocs;
        }
        if let Some(raw) = &self.http_port {
            config.http_port =
                Some(parse_listen_addr(raw).map_err(|r| bad("http_port", r))?);
        }
        if let Some(raw) = &self.umask {
            config.umask = parse_octal(raw).map_err(|r| bad("umask", r))?;
        }

        Ok(())
    }
}

/// Parses command-line arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
