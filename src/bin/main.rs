use std::{fs, process};

use tracing::{info, level_filters::LevelFilter, warn};

use taskmaster::{
    cli::{Cli, parse_args},
    config::{LogLevel, ServerConfig, load_config},
    daemonize::{self, Pidfile},
    error::DaemonError,
    logger::{ActivityLog, cleanup_auto_logs},
    supervisor::Supervisor,
};

fn main() {
    let args = parse_args();
    if let Err(err) = run(&args) {
        eprintln!("taskmasterd: {err}");
        process::exit(err.exit_code());
    }
}

fn run(args: &Cli) -> Result<(), DaemonError> {
    let mut config = load_config(&args.configuration)?;
    args.apply_to(&mut config)?;

    daemonize::check_rlimits(&config)?;

    if let Some(dir) = &config.directory {
        std::env::set_current_dir(dir)?;
    }
    daemonize::apply_umask(config.umask);

    fs::create_dir_all(&config.childlogdir)?;
    if !config.nocleanup
        && let Err(err) = cleanup_auto_logs(&config.childlogdir)
    {
        warn!("stale child-log cleanup failed: {err}");
    }

    if !config.nodaemon {
        daemonize::daemonize()?;
    }

    let activity = ActivityLog::new(
        config.logfile.clone(),
        config.logfile_maxbytes,
        config.logfile_backups,
        config.nodaemon,
    );
    init_logging(&config, activity.clone());

    let pidfile = Pidfile::acquire(&config.pidfile)?;
    let user = config.user.clone();

    let mut supervisor = Supervisor::new(config, args.configuration.clone(), activity)?;
    supervisor.set_pidfile(pidfile);

    // Privileges drop only after the socket, pidfile, and log directories
    // are in place, and before the loop starts.
    if let Some(user) = user {
        if nix::unistd::Uid::effective().is_root() {
            daemonize::drop_privileges(&user)?;
            info!("dropped privileges to '{user}'");
        } else {
            warn!("not running as root; 'user={user}' has no effect");
        }
    }

    supervisor.run()?;
    Ok(())
}

fn init_logging(config: &ServerConfig, activity: ActivityLog) {
    let level = match config.loglevel {
        LogLevel::Critical | LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(false)
        .with_writer(activity)
        .init();
}
