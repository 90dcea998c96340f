#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    sync::Mutex,
    time::Duration,
};

use common::{build_supervisor, drive_until};
use taskmaster::process::ProcessState;

// Signal handlers and the self-pipe are process-wide; only one supervisor
// may be live at a time within this test binary.
static SUPERVISOR_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    match SUPERVISOR_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn state_of(
    supervisor: &taskmaster::supervisor::Supervisor,
    name: &str,
) -> Option<ProcessState> {
    supervisor.process_state(name)
}

#[test]
fn reload_adds_a_program_without_touching_the_running_one() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let mut supervisor = build_supervisor(
        &dir,
        "[program:a]\ncommand = sleep 60\nstartsecs = 0\n",
    );
    supervisor.start_all(true);
    drive_until(&mut supervisor, Duration::from_secs(10), |s| {
        s.process_state("a") == Some(ProcessState::Running)
    });
    let a_pid = supervisor.process_info("a").unwrap().pid;

    // Add program b and reload.
    let config_path = dir.path().join("taskmasterd.conf");
    let mut text = fs::read_to_string(&config_path).unwrap();
    text.push_str("[program:b]\ncommand = sleep 60\nstartsecs = 0\n");
    fs::write(&config_path, text).unwrap();

    supervisor.reload();
    drive_until(&mut supervisor, Duration::from_secs(10), |s| {
        s.process_state("b") == Some(ProcessState::Running)
    });

    // a kept its pid across the reload.
    assert_eq!(supervisor.process_info("a").unwrap().pid, a_pid);
    assert_eq!(state_of(&supervisor, "a"), Some(ProcessState::Running));

    supervisor.initiate_shutdown();
    drive_until(&mut supervisor, Duration::from_secs(15), |s| s.is_done());
}

#[test]
fn reload_removes_and_replaces_changed_programs() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let mut supervisor = build_supervisor(
        &dir,
        "[program:gone]\ncommand = sleep 60\nstartsecs = 0\n\
         [program:changed]\ncommand = sleep 60\nstartsecs = 0\n",
    );
    supervisor.start_all(true);
    drive_until(&mut supervisor, Duration::from_secs(10), |s| {
        s.process_state("gone") == Some(ProcessState::Running)
            && s.process_state("changed") == Some(ProcessState::Running)
    });
    let old_pid = supervisor.process_info("changed").unwrap().pid;

    let config_path = dir.path().join("taskmasterd.conf");
    fs::write(
        &config_path,
        "[program:changed]\ncommand = sleep 59\nstartsecs = 0\n",
    )
    .unwrap();

    supervisor.reload();
    drive_until(&mut supervisor, Duration::from_secs(15), |s| {
        s.process_state("gone").is_none()
            && s.process_state("changed") == Some(ProcessState::Running)
    });
    assert_ne!(supervisor.process_info("changed").unwrap().pid, old_pid);

    supervisor.initiate_shutdown();
    drive_until(&mut supervisor, Duration::from_secs(15), |s| s.is_done());
}

#[test]
fn reload_with_a_broken_file_keeps_running_processes() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let mut supervisor = build_supervisor(
        &dir,
        "[program:a]\ncommand = sleep 60\nstartsecs = 0\n",
    );
    supervisor.start_all(true);
    drive_until(&mut supervisor, Duration::from_secs(10), |s| {
        s.process_state("a") == Some(ProcessState::Running)
    });
    let a_pid = supervisor.process_info("a").unwrap().pid;

    let config_path = dir.path().join("taskmasterd.conf");
    fs::write(&config_path, "this is not an ini file\n").unwrap();
    supervisor.reload();
    for _ in 0..3 {
        supervisor.run_once().unwrap();
    }

    assert_eq!(state_of(&supervisor, "a"), Some(ProcessState::Running));
    assert_eq!(supervisor.process_info("a").unwrap().pid, a_pid);

    supervisor.initiate_shutdown();
    drive_until(&mut supervisor, Duration::from_secs(15), |s| s.is_done());
}

#[test]
fn hangup_signal_triggers_a_reload() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let mut supervisor = build_supervisor(
        &dir,
        "[program:a]\ncommand = sleep 60\nstartsecs = 0\n",
    );
    supervisor.start_all(true);
    drive_until(&mut supervisor, Duration::from_secs(10), |s| {
        s.process_state("a") == Some(ProcessState::Running)
    });

    let config_path = dir.path().join("taskmasterd.conf");
    let mut text = fs::read_to_string(&config_path).unwrap();
    text.push_str("[program:b]\ncommand = sleep 60\nstartsecs = 0\n");
    fs::write(&config_path, text).unwrap();

    nix::sys::signal::raise(nix::sys::signal::Signal::SIGHUP).unwrap();
    drive_until(&mut supervisor, Duration::from_secs(10), |s| {
        s.process_state("b") == Some(ProcessState::Running)
    });

    supervisor.initiate_shutdown();
    drive_until(&mut supervisor, Duration::from_secs(15), |s| s.is_done());
}

#[test]
fn terminate_signal_shuts_the_loop_down() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let mut supervisor = build_supervisor(
        &dir,
        "[program:a]\ncommand = sleep 60\nstartsecs = 0\n",
    );
    supervisor.start_all(true);
    drive_until(&mut supervisor, Duration::from_secs(10), |s| {
        s.process_state("a") == Some(ProcessState::Running)
    });

    nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
    drive_until(&mut supervisor, Duration::from_secs(15), |s| s.is_done());
    assert_eq!(state_of(&supervisor, "a"), Some(ProcessState::Stopped));
}
